//! Audit records for function executions.
//!
//! Every call to [`Sandbox::execute`](crate::Sandbox::execute) produces one
//! [`AuditEntry`]: who ran what (function id, SHA-256 of the source, a
//! redacted preview), which host capabilities it touched, and how it ended.
//! Arguments, secret values, HTTP URLs and service payloads are never
//! recorded.
//!
//! The [`AuditLogger`] trait allows pluggable sinks.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::error::ErrorKind;
use crate::function::{FunctionContext, FunctionOutput};

/// Maximum length of the code preview in audit entries.
const CODE_PREVIEW_MAX: usize = 256;

/// One host capability invocation made by guest code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostCallAudit {
    /// Capability name: `wallet`, `storage`, `oracle` or `http`.
    pub capability: String,
    /// Service method, or HTTP verb.
    pub operation: String,
    /// Wall-clock time of the call in milliseconds.
    pub duration_ms: u64,
    /// Whether the call returned successfully to the guest.
    pub success: bool,
}

/// How an execution ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum AuditOutcome {
    /// `main` returned a value.
    Success,
    /// The execution failed.
    Failed {
        /// Failure class.
        kind: ErrorKind,
        /// Redacted error text.
        message: String,
    },
}

/// A complete audit record for a single execution.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    /// Execution id from the function context.
    pub execution_id: String,
    /// Registered function id.
    pub function_id: String,
    /// Caller identity.
    pub caller: String,
    /// When the execution started.
    pub timestamp: DateTime<Utc>,
    /// SHA-256 of the source.
    pub code_hash: String,
    /// Redacted head of the source.
    pub code_preview: String,
    /// Host capability calls, in order.
    pub host_calls: Vec<HostCallAudit>,
    /// Number of guest log lines.
    pub log_lines: usize,
    /// Duration in milliseconds.
    pub duration_ms: u64,
    /// Peak guest heap in bytes.
    pub memory_used: u64,
    /// Outcome.
    pub outcome: AuditOutcome,
}

/// Trait for audit log backends.
#[async_trait::async_trait]
pub trait AuditLogger: Send + Sync {
    /// Write an audit entry.
    async fn log(&self, entry: &AuditEntry);
}

/// Writes audit entries as newline-delimited JSON to an `AsyncWrite` sink.
pub struct JsonLinesAuditLogger<W: AsyncWrite + Unpin + Send> {
    writer: Mutex<W>,
}

impl<W: AsyncWrite + Unpin + Send> JsonLinesAuditLogger<W> {
    /// Create a logger writing to `writer`.
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Recover the sink.
    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

#[async_trait::async_trait]
impl<W: AsyncWrite + Unpin + Send + 'static> AuditLogger for JsonLinesAuditLogger<W> {
    async fn log(&self, entry: &AuditEntry) {
        let mut line = match serde_json::to_string(entry) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize audit entry");
                return;
            }
        };
        line.push('\n');

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            tracing::warn!(error = %e, "failed to write audit entry");
            return;
        }
        if let Err(e) = writer.flush().await {
            tracing::warn!(error = %e, "failed to flush audit sink");
        }
    }
}

/// Discards entries.
pub struct NoopAuditLogger;

#[async_trait::async_trait]
impl AuditLogger for NoopAuditLogger {
    async fn log(&self, _entry: &AuditEntry) {}
}

/// Emits entries as `tracing` events at `INFO` with `audit = true`.
pub struct TracingAuditLogger;

#[async_trait::async_trait]
impl AuditLogger for TracingAuditLogger {
    async fn log(&self, entry: &AuditEntry) {
        let (outcome, kind) = match &entry.outcome {
            AuditOutcome::Success => ("success", None),
            AuditOutcome::Failed { kind, .. } => ("failed", Some(kind.as_str())),
        };
        tracing::info!(
            audit = true,
            execution_id = %entry.execution_id,
            function_id = %entry.function_id,
            code_hash = %entry.code_hash,
            duration_ms = entry.duration_ms,
            memory_used = entry.memory_used,
            host_calls = entry.host_calls.len(),
            log_lines = entry.log_lines,
            outcome,
            error_kind = kind,
            "audit"
        );
    }
}

/// Lowercase hex SHA-256 of `data`.
pub fn sha256_hex(data: &str) -> String {
    Sha256::digest(data.as_bytes())
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Head of the source, cut on a char boundary, with `...` when truncated.
pub fn code_preview(code: &str) -> String {
    if code.len() <= CODE_PREVIEW_MAX {
        return code.to_string();
    }
    let mut end = CODE_PREVIEW_MAX;
    while !code.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &code[..end])
}

/// Collects the parts of an [`AuditEntry`] while an execution runs.
#[derive(Debug)]
pub struct AuditEntryBuilder {
    execution_id: String,
    function_id: String,
    caller: String,
    timestamp: DateTime<Utc>,
    code_hash: String,
    code_preview: String,
    host_calls: Vec<HostCallAudit>,
}

impl AuditEntryBuilder {
    /// Start an entry for `code` running under `context`.
    pub fn new(code: &str, context: &FunctionContext) -> Self {
        Self {
            execution_id: context.execution_id.clone(),
            function_id: context.function_id.clone(),
            caller: context.caller.clone(),
            timestamp: Utc::now(),
            code_hash: sha256_hex(code),
            code_preview: crate::redact::redact_error_message(&code_preview(code)),
            host_calls: Vec::new(),
        }
    }

    /// Append host calls recorded by the ops.
    pub fn record_host_calls(&mut self, calls: impl IntoIterator<Item = HostCallAudit>) {
        self.host_calls.extend(calls);
    }

    /// Finalize against the execution's output.
    pub fn finish(self, output: &FunctionOutput) -> AuditEntry {
        let outcome = match output.error_kind {
            None if output.is_success() => AuditOutcome::Success,
            kind => AuditOutcome::Failed {
                kind: kind.unwrap_or(ErrorKind::Runtime),
                message: crate::redact::redact_error_message(&output.error),
            },
        };
        AuditEntry {
            execution_id: self.execution_id,
            function_id: self.function_id,
            caller: self.caller,
            timestamp: self.timestamp,
            code_hash: self.code_hash,
            code_preview: self.code_preview,
            host_calls: self.host_calls,
            log_lines: output.logs.len(),
            duration_ms: output.duration.as_millis() as u64,
            memory_used: output.memory_used,
            outcome,
        }
    }
}
