//! Sandbox orchestrator: runs one guest function per call in a fresh V8 isolate.
//!
//! V8 isolates are `!Send`, so every call runs on a dedicated thread with its
//! own single-threaded tokio runtime. The public API is async and
//! `Send`-safe.
//!
//! A call moves through these phases, each emitted as a `tracing` event:
//! environment setup (isolate, op state, bootstrap bindings), running
//! (user script, then `main`), and finalizing (watchers joined, logs and
//! result collected). Guest failures never surface as `Err`: they are
//! classified into [`ErrorKind`] and reported in the [`FunctionOutput`]
//! along with every log line captured before the failure.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use deno_core::{v8, JsRuntime, PollEventLoopOptions, RuntimeOptions};
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditEntryBuilder, AuditLogger, HostCallAudit, NoopAuditLogger};
use crate::capabilities::CapabilitySet;
use crate::enforce::{
    install_heap_limit_callback, spawn_memory_watcher, spawn_timeout_watcher, AbortReason,
    BufferBudget, HeapProbe, Interrupter,
};
use crate::error::{ErrorKind, SandboxError};
use crate::function::{FunctionContext, FunctionInput, FunctionOutput};
use crate::http::{guest_error_message, HttpCapability, NetworkError};
use crate::ops::{funcbox_ext, ExecutionResult, GuestLogs, HostCalls, LogSink, Secrets};

const DEFAULT_MEMORY_LIMIT: usize = 128 * 1024 * 1024;
const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);
const DEFAULT_STACK_SIZE: usize = 8 * 1024 * 1024;
const DEFAULT_MEMORY_CHECK_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_MAX_HTTP_RESPONSE_SIZE: usize = 10 * 1024 * 1024;

/// Where guest `console` output goes besides [`FunctionOutput::logs`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum GuestLogSink {
    /// Also emit each line as a `tracing` event under target `funcbox::guest`.
    #[default]
    Tracing,
    /// Only collect lines into the output.
    Silent,
}

/// Configuration for a [`Sandbox`].
///
/// Zero values are replaced with defaults by [`SandboxConfig::normalized`];
/// [`Sandbox::new`] always normalizes.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxConfig {
    /// Guest memory ceiling in bytes (default 128 MiB). Bounds the V8 heap
    /// and ArrayBuffer backing stores.
    pub memory_limit: usize,
    /// Wall-clock budget per call (default 5 s).
    pub timeout: Duration,
    /// Stack budget of the execution thread in bytes (default 8 MiB).
    pub stack_size: usize,
    /// Whether `httpClient.request` may reach the network.
    pub allow_network: bool,
    /// Reserved; no filesystem binding exists.
    pub allow_file_io: bool,
    /// Whether granted services are bound as `services`.
    pub enable_interoperability: bool,
    /// Service layer base URL, copied into the call's
    /// [`FunctionContext::service_layer_url`] when the caller left it empty.
    pub service_layer_url: String,
    /// Forwarding of guest log lines.
    pub log_sink: GuestLogSink,
    /// Heap sampling interval of the memory watcher (default 100 ms).
    pub memory_check_interval: Duration,
    /// Per-request timeout of `httpClient` (default 15 s).
    pub http_timeout: Duration,
    /// Largest accepted HTTP response body (default 10 MiB).
    pub max_http_response_size: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            memory_limit: DEFAULT_MEMORY_LIMIT,
            timeout: DEFAULT_TIMEOUT,
            stack_size: DEFAULT_STACK_SIZE,
            allow_network: false,
            allow_file_io: false,
            enable_interoperability: true,
            service_layer_url: String::new(),
            log_sink: GuestLogSink::default(),
            memory_check_interval: DEFAULT_MEMORY_CHECK_INTERVAL,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            max_http_response_size: DEFAULT_MAX_HTTP_RESPONSE_SIZE,
        }
    }
}

impl SandboxConfig {
    /// Replace zero limits with their defaults.
    pub fn normalized(mut self) -> Self {
        fn fix<T: PartialEq + Copy + std::fmt::Debug>(field: &str, value: &mut T, zero: T, default: T) {
            if *value == zero {
                tracing::warn!(field, default = ?default, "non-positive sandbox limit, using default");
                *value = default;
            }
        }
        fix("memory_limit", &mut self.memory_limit, 0, DEFAULT_MEMORY_LIMIT);
        fix("timeout", &mut self.timeout, Duration::ZERO, DEFAULT_TIMEOUT);
        fix("stack_size", &mut self.stack_size, 0, DEFAULT_STACK_SIZE);
        fix(
            "memory_check_interval",
            &mut self.memory_check_interval,
            Duration::ZERO,
            DEFAULT_MEMORY_CHECK_INTERVAL,
        );
        fix("http_timeout", &mut self.http_timeout, Duration::ZERO, DEFAULT_HTTP_TIMEOUT);
        fix(
            "max_http_response_size",
            &mut self.max_http_response_size,
            0,
            DEFAULT_MAX_HTTP_RESPONSE_SIZE,
        );
        self
    }

    /// Set the heap ceiling in bytes.
    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = bytes;
        self
    }

    /// Set the wall-clock budget.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the execution thread's stack budget.
    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    /// Allow or deny outbound HTTP.
    pub fn with_network(mut self, allow: bool) -> Self {
        self.allow_network = allow;
        self
    }

    /// Enable or disable the `services` binding.
    pub fn with_interoperability(mut self, enable: bool) -> Self {
        self.enable_interoperability = enable;
        self
    }

    /// Set the service layer URL.
    pub fn with_service_layer_url(mut self, url: impl Into<String>) -> Self {
        self.service_layer_url = url.into();
        self
    }

    /// Set the guest log forwarding.
    pub fn with_log_sink(mut self, sink: GuestLogSink) -> Self {
        self.log_sink = sink;
        self
    }
}

/// Lifecycle state of a [`Sandbox`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    /// Ready for the next call.
    Idle,
    /// Closed; every call fails with [`SandboxError::Closed`].
    Closed,
}

/// Executes guest functions, one at a time.
///
/// `execute` takes `&mut self`, so at most one evaluation is in flight per
/// sandbox. Use [`SandboxPool`](crate::SandboxPool) for concurrency.
pub struct Sandbox {
    config: Arc<SandboxConfig>,
    state: SandboxState,
    executions: u64,
    audit_logger: Arc<dyn AuditLogger>,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<crate::metrics::SandboxMetrics>>,
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("config", &self.config)
            .field("state", &self.state)
            .field("executions", &self.executions)
            .finish()
    }
}

impl Sandbox {
    /// Create a sandbox. Non-positive limits fall back to defaults.
    pub fn new(config: SandboxConfig) -> Self {
        Self::with_audit_logger(config, Arc::new(NoopAuditLogger))
    }

    /// Create a sandbox that reports every execution to `logger`.
    pub fn with_audit_logger(config: SandboxConfig, logger: Arc<dyn AuditLogger>) -> Self {
        Self {
            config: Arc::new(config.normalized()),
            state: SandboxState::Idle,
            executions: 0,
            audit_logger: logger,
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    /// Record executions into `metrics`.
    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Arc<crate::metrics::SandboxMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// The effective configuration.
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SandboxState {
        self.state
    }

    /// Number of completed calls.
    pub fn execution_count(&self) -> u64 {
        self.executions
    }

    /// Close the sandbox. Idempotent.
    pub fn close(&mut self) {
        if self.state != SandboxState::Closed {
            tracing::debug!(executions = self.executions, "sandbox closed");
        }
        self.state = SandboxState::Closed;
    }

    /// Run `input.code`'s `main(args, parameters)` once.
    ///
    /// Returns `Err` only when the sandbox is closed or the engine itself
    /// fails. Guest errors, timeouts and memory aborts are reported in the
    /// output.
    pub async fn execute(&mut self, input: FunctionInput) -> Result<FunctionOutput, SandboxError> {
        self.execute_with_cancellation(input, CancellationToken::new())
            .await
    }

    /// Like [`execute`](Self::execute), aborting with
    /// [`ErrorKind::Cancelled`] when `cancel` fires.
    pub async fn execute_with_cancellation(
        &mut self,
        mut input: FunctionInput,
        cancel: CancellationToken,
    ) -> Result<FunctionOutput, SandboxError> {
        if self.state == SandboxState::Closed {
            return Err(SandboxError::Closed);
        }

        let start = Instant::now();
        let context = resolve_context(&self.config, &mut input);
        let mut audit = AuditEntryBuilder::new(&input.code, &context);
        tracing::info!(
            function_id = %context.function_id,
            execution_id = %context.execution_id,
            code_len = input.code.len(),
            args = input.args.len(),
            "execute: starting"
        );

        let interrupter = Interrupter::new();
        let report = {
            let config = self.config.clone();
            let thread_interrupter = interrupter.clone();
            let stack_size = execution_stack_size(config.stack_size);
            let (tx, mut rx) = tokio::sync::oneshot::channel();
            std::thread::Builder::new()
                .name("funcbox-exec".into())
                .stack_size(stack_size)
                .spawn(move || {
                    let rt = match tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                    {
                        Ok(rt) => rt,
                        Err(e) => {
                            if tx.send(Err(SandboxError::Execution(e.into()))).is_err() {
                                tracing::warn!("sandbox result receiver dropped");
                            }
                            return;
                        }
                    };
                    let report = rt.block_on(run_function(&config, input, thread_interrupter));
                    if tx.send(Ok(report)).is_err() {
                        tracing::warn!("sandbox result receiver dropped before result was sent");
                    }
                })
                .map_err(|e| {
                    SandboxError::Execution(anyhow::anyhow!("failed to spawn execution thread: {e}"))
                })?;

            let received = tokio::select! {
                res = &mut rx => res,
                _ = cancel.cancelled() => {
                    interrupter.trip(AbortReason::Cancelled);
                    rx.await
                }
            };
            received.map_err(|_| {
                SandboxError::Execution(anyhow::anyhow!("sandbox thread panicked"))
            })??
        };

        let ExecutionReport {
            mut output,
            host_calls,
        } = report;
        output.duration = start.elapsed();
        self.executions += 1;

        #[cfg(feature = "metrics")]
        if let Some(m) = &self.metrics {
            m.record_execution(&output, &host_calls);
        }
        audit.record_host_calls(host_calls);
        let entry = audit.finish(&output);
        self.audit_logger.log(&entry).await;

        match output.error_kind {
            None => tracing::info!(
                duration_ms = output.duration.as_millis() as u64,
                memory_used = output.memory_used,
                logs = output.logs.len(),
                "execute: complete"
            ),
            Some(kind) => tracing::warn!(
                error_kind = %kind,
                error = %output.error,
                duration_ms = output.duration.as_millis() as u64,
                "execute: failed"
            ),
        }

        Ok(output)
    }
}

/// Result of one call as produced on the execution thread.
struct ExecutionReport {
    output: FunctionOutput,
    host_calls: Vec<HostCallAudit>,
}

impl ExecutionReport {
    fn setup_failure(message: String) -> Self {
        tracing::warn!(error = %message, "execute: environment setup failed");
        Self {
            output: FunctionOutput::failed(ErrorKind::Setup, message),
            host_calls: Vec::new(),
        }
    }
}

/// Fill in the call's context: `anonymous` when absent, and the configured
/// service layer URL when the caller left it empty.
fn resolve_context(config: &SandboxConfig, input: &mut FunctionInput) -> FunctionContext {
    let context = input
        .context
        .get_or_insert_with(|| FunctionContext::new("anonymous"));
    if context.service_layer_url.is_empty() {
        context.service_layer_url = config.service_layer_url.clone();
    }
    context.clone()
}

/// Envelope written by the invoker through `op_funcbox_set_result`.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    ok: Value,
    error: Option<String>,
    kind: Option<String>,
}

static V8_STACK_KB: OnceLock<usize> = OnceLock::new();

/// Size of the execution thread's stack for a configured budget.
///
/// V8's `--stack-size` flag is process-wide and only honored before the
/// platform starts, so the first budget seen wins; the thread always gets
/// enough native stack to back it.
fn execution_stack_size(requested: usize) -> usize {
    let v8_kb = *V8_STACK_KB.get_or_init(|| {
        // Keep a quarter of the native stack for host frames below V8.
        let kb = (requested / 1024 * 3 / 4).max(512);
        v8::V8::set_flags_from_string(&format!("--stack-size={kb}"));
        kb
    });
    requested.max(v8_kb * 1024 * 4 / 3 + 1024 * 1024)
}

/// Create a fresh runtime with the funcbox extension and per-call op state.
fn create_runtime(
    config: &SandboxConfig,
    buffers: &Arc<BufferBudget>,
    capabilities: CapabilitySet,
    http: Option<HttpCapability>,
    secrets: HashMap<String, String>,
) -> JsRuntime {
    let create_params = v8::CreateParams::default()
        .heap_limits(0, config.memory_limit)
        .array_buffer_allocator(buffers.allocator().make_shared());

    let runtime = JsRuntime::new(RuntimeOptions {
        extensions: vec![funcbox_ext::init()],
        create_params: Some(create_params),
        ..Default::default()
    });

    {
        let state = runtime.op_state();
        let mut state = state.borrow_mut();
        state.put(capabilities);
        state.put(Secrets(secrets));
        state.put(LogSink(config.log_sink));
        state.put(GuestLogs::default());
        state.put(HostCalls::default());
        // Absent unless granted: op_funcbox_http_request fails closed without it.
        if let Some(http) = http {
            state.put(http);
        }
    }

    runtime
}

/// Bootstrap script: installs the guest globals and removes the host escape
/// hatches. Op references are captured in closures before `Deno` is deleted.
fn build_bootstrap(context: &FunctionContext, capabilities: &CapabilitySet, interop: bool) -> String {
    let context_json = context.guest_view().to_string();

    let http = if capabilities.network_allowed() {
        r#"async (...a) => {
                if (a.length !== 1) {
                    throw new TypeError("httpClient error: request expects exactly one options argument");
                }
                return JSON.parse(await httpOp(JSON.stringify(a[0] ?? null)));
            }"#
        .to_string()
    } else {
        let disabled = Value::String(guest_error_message(&NetworkError::Disabled.to_string()));
        format!(
            r#"async () => {{
                throw new Error({disabled});
            }}"#
        )
    };

    let services = if interop {
        format!(
            "define(\"services\", {});",
            capabilities.services_js()
        )
    } else {
        String::new()
    };

    format!(
        r#"((ops) => {{
            const logOp = ops.op_funcbox_log;
            const setResultOp = ops.op_funcbox_set_result;
            const secretOp = ops.op_funcbox_secret;
            const callServiceOp = ops.op_funcbox_call_service;
            const httpOp = {http_op};

            const define = (name, value) => Object.defineProperty(globalThis, name, {{
                value, writable: false, configurable: false, enumerable: true
            }});
            const deepFreeze = (v) => {{
                if (v !== null && typeof v === "object" && !Object.isFrozen(v)) {{
                    for (const k of Object.keys(v)) deepFreeze(v[k]);
                    Object.freeze(v);
                }}
                return v;
            }};

            const fmt = (a) => {{
                if (typeof a === "string") return a;
                try {{
                    const j = JSON.stringify(a);
                    return j === undefined ? String(a) : j;
                }} catch (_) {{
                    try {{ return String(a); }} catch (_) {{ return "[unprintable]"; }}
                }}
            }};
            const emit = (level) => (...args) => {{
                try {{ logOp(level, args.map(fmt).join(" ")); }} catch (_) {{}}
            }};
            delete globalThis.console;
            define("console", Object.freeze({{
                log: emit("log"), info: emit("info"), warn: emit("warn"),
                error: emit("error"), debug: emit("debug"),
            }}));

            define("context", deepFreeze({context_json}));

            define("secrets", Object.freeze({{
                get: (name) => JSON.parse(secretOp(name === undefined || name === null ? "" : String(name))),
            }}));

            const callService = async (service, method, args) =>
                JSON.parse(await callServiceOp(service, method, JSON.stringify(args)));
            {services}

            define("httpClient", Object.freeze({{ request: {http} }}));

            let invoked = false;
            Object.defineProperty(globalThis, "__funcboxInvoke", {{
                enumerable: false, configurable: true, writable: false,
                value: async (args, params) => {{
                    if (invoked) return;
                    invoked = true;
                    if (typeof main !== "function") {{
                        setResultOp(JSON.stringify({{ error: "main function not found in script", kind: "compile" }}));
                        return;
                    }}
                    let value;
                    try {{
                        value = await main(args, params);
                    }} catch (e) {{
                        let message;
                        try {{ message = (e && e.message) || String(e); }} catch (_) {{ message = "uncaught exception"; }}
                        setResultOp(JSON.stringify({{ error: message }}));
                        return;
                    }}
                    let envelope;
                    try {{
                        envelope = JSON.stringify({{ ok: value === undefined ? null : value }});
                    }} catch (e) {{
                        envelope = JSON.stringify({{ error: "result is not serializable: " + ((e && e.message) || String(e)), kind: "conversion" }});
                    }}
                    setResultOp(envelope);
                }},
            }});

            delete globalThis.Deno;
            delete globalThis.eval;
            const AsyncFunction = (async function(){{}}).constructor;
            const GeneratorFunction = (function*(){{}}).constructor;
            const AsyncGeneratorFunction = (async function*(){{}}).constructor;
            for (const F of [Function, AsyncFunction, GeneratorFunction, AsyncGeneratorFunction]) {{
                Object.defineProperty(F.prototype, "constructor", {{
                    value: undefined, configurable: false, writable: false
                }});
            }}
        }})(Deno.core.ops);"#,
        http_op = if capabilities.network_allowed() {
            "ops.op_funcbox_http_request"
        } else {
            "undefined"
        },
    )
}

/// Script that hands control to the invoker and removes it from the global scope.
fn build_driver(args: &[Value], parameters: &Map<String, Value>) -> String {
    let args = Value::Array(args.to_vec()).to_string();
    let params = Value::Object(parameters.clone()).to_string();
    format!(
        r#"(() => {{
            const invoke = globalThis.__funcboxInvoke;
            delete globalThis.__funcboxInvoke;
            invoke({args}, {params});
        }})();"#
    )
}

/// First line of a JS error, without the `Uncaught ` prefix.
fn js_error_message(err: &impl std::fmt::Display) -> String {
    let text = err.to_string();
    let first = text.lines().next().unwrap_or_default();
    first.strip_prefix("Uncaught ").unwrap_or(first).to_string()
}

/// Run one call on the current thread. Must be called from the dedicated
/// execution thread, not the caller's runtime.
async fn run_function(
    config: &SandboxConfig,
    input: FunctionInput,
    interrupter: Arc<Interrupter>,
) -> ExecutionReport {
    let FunctionInput {
        code,
        args,
        parameters,
        context,
        secrets,
    } = input;
    let context = context.unwrap_or_else(|| FunctionContext::new("anonymous"));

    // --- Environment setup ---
    let capabilities = CapabilitySet::new(
        &context.services,
        config.enable_interoperability,
        config.allow_network,
    );
    let http = if config.allow_network {
        match HttpCapability::new(config.http_timeout, config.max_http_response_size) {
            Ok(h) => Some(h),
            Err(e) => {
                return ExecutionReport::setup_failure(format!("failed to initialize httpClient: {e}"))
            }
        }
    } else {
        None
    };
    tracing::debug!(capabilities = ?capabilities, "execute: environment setup");

    // The probe must outlive the runtime: V8 callbacks hold raw pointers to it.
    let buffers = BufferBudget::new(interrupter.clone(), config.memory_limit);
    let probe = HeapProbe::new(interrupter.clone(), buffers.clone(), config.memory_limit);
    let bootstrap = build_bootstrap(&context, &capabilities, config.enable_interoperability);
    let mut runtime = create_runtime(config, &buffers, capabilities, http, secrets);
    interrupter.attach(runtime.v8_isolate().thread_safe_handle());
    install_heap_limit_callback(runtime.v8_isolate(), &probe);

    if let Err(e) = runtime.execute_script("[funcbox:bootstrap]", bootstrap) {
        return ExecutionReport::setup_failure(format!(
            "failed to install bindings: {}",
            js_error_message(&e)
        ));
    }

    let timeout_watcher = match spawn_timeout_watcher(interrupter.clone(), config.timeout) {
        Ok(w) => w,
        Err(e) => return ExecutionReport::setup_failure(format!("failed to start timeout watcher: {e}")),
    };
    let memory_watcher = match spawn_memory_watcher(
        probe.clone(),
        runtime.v8_isolate().thread_safe_handle(),
        config.memory_check_interval,
    ) {
        Ok(w) => w,
        Err(e) => {
            timeout_watcher.stop();
            return ExecutionReport::setup_failure(format!("failed to start memory watcher: {e}"));
        }
    };

    // --- Running ---
    tracing::debug!("execute: running");
    let guest_error: Option<(ErrorKind, String)> =
        match runtime.execute_script("function.js", code) {
            Err(e) => {
                let message = js_error_message(&e);
                let kind = if message.starts_with("SyntaxError") {
                    ErrorKind::Compile
                } else {
                    ErrorKind::Runtime
                };
                Some((kind, message))
            }
            Ok(_) => match runtime.execute_script("[funcbox:invoke]", build_driver(&args, &parameters)) {
                Err(e) => Some((ErrorKind::Runtime, js_error_message(&e))),
                Ok(_) => {
                    let loop_result = tokio::select! {
                        biased;
                        _ = interrupter.tripped() => None,
                        r = runtime.run_event_loop(PollEventLoopOptions::default()) => Some(r),
                    };
                    match loop_result {
                        Some(Err(e)) => Some((ErrorKind::Runtime, js_error_message(&e))),
                        _ => None,
                    }
                }
            },
        };

    // --- Finalizing ---
    // Watchers firing from here on must not override the finished call.
    interrupter.complete();
    timeout_watcher.stop();
    memory_watcher.stop();
    probe.sample(runtime.v8_isolate());

    let (logs, host_calls, envelope) = {
        let state = runtime.op_state();
        let mut state = state.borrow_mut();
        let logs = state.try_take::<GuestLogs>().unwrap_or_default().0;
        let host_calls = state.try_take::<HostCalls>().unwrap_or_default().0;
        let envelope = state.try_take::<ExecutionResult>().map(|r| r.0);
        (logs, host_calls, envelope)
    };
    drop(runtime);

    let mut output = classify(interrupter.reason(), guest_error, envelope);
    output.logs = logs;
    output.memory_used = probe.peak();
    tracing::debug!(error_kind = ?output.error_kind, "execute: finalizing");

    ExecutionReport { output, host_calls }
}

/// Decide the outcome: abort reason first, then script errors, then the
/// invoker's envelope. `abort` is only set when a trip landed before the
/// call completed, see [`Interrupter::complete`].
fn classify(
    abort: Option<AbortReason>,
    guest_error: Option<(ErrorKind, String)>,
    envelope: Option<String>,
) -> FunctionOutput {
    if let Some(reason) = abort {
        let kind = match reason {
            AbortReason::Timeout => ErrorKind::Timeout,
            AbortReason::MemoryExceeded => ErrorKind::ResourceExceeded,
            AbortReason::Cancelled => ErrorKind::Cancelled,
        };
        return FunctionOutput::failed(kind, reason.message());
    }
    if let Some((kind, message)) = guest_error {
        return FunctionOutput::failed(kind, message);
    }
    let Some(raw) = envelope else {
        return FunctionOutput::failed(ErrorKind::Runtime, "main did not complete");
    };
    match serde_json::from_str::<Envelope>(&raw) {
        Ok(Envelope {
            error: Some(message),
            kind,
            ..
        }) => {
            let kind = match kind.as_deref() {
                Some("compile") => ErrorKind::Compile,
                Some("conversion") => ErrorKind::Conversion,
                _ => ErrorKind::Runtime,
            };
            FunctionOutput::failed(kind, message)
        }
        Ok(Envelope { ok, .. }) => FunctionOutput {
            result: ok,
            ..Default::default()
        },
        Err(e) => FunctionOutput::failed(
            ErrorKind::Conversion,
            format!("result could not be decoded: {e}"),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sandbox() -> Sandbox {
        Sandbox::new(SandboxConfig::default().with_log_sink(GuestLogSink::Silent))
    }

    async fn run(code: &str) -> FunctionOutput {
        sandbox().execute(FunctionInput::new(code)).await.unwrap()
    }

    #[test]
    fn zero_limits_are_defaulted() {
        let cfg = SandboxConfig {
            memory_limit: 0,
            timeout: Duration::ZERO,
            stack_size: 0,
            memory_check_interval: Duration::ZERO,
            ..Default::default()
        }
        .normalized();
        assert_eq!(cfg.memory_limit, 128 * 1024 * 1024);
        assert_eq!(cfg.timeout, Duration::from_millis(5000));
        assert_eq!(cfg.stack_size, 8 * 1024 * 1024);
        assert_eq!(cfg.memory_check_interval, Duration::from_millis(100));
    }

    #[test]
    fn defaults() {
        let cfg = SandboxConfig::default();
        assert!(!cfg.allow_network);
        assert!(!cfg.allow_file_io);
        assert!(cfg.enable_interoperability);
        assert_eq!(cfg.http_timeout, Duration::from_secs(15));
    }

    #[test]
    fn new_normalizes_config() {
        let sb = Sandbox::new(SandboxConfig::default().with_timeout(Duration::ZERO));
        assert_eq!(sb.config().timeout, Duration::from_millis(5000));
        assert_eq!(sb.state(), SandboxState::Idle);
    }

    #[test]
    fn service_layer_url_fills_empty_context() {
        let config = SandboxConfig::default().with_service_layer_url("http://svc:9000");

        let mut input = FunctionInput::new("function main() {}");
        let ctx = resolve_context(&config, &mut input);
        assert_eq!(ctx.function_id, "anonymous");
        assert_eq!(ctx.service_layer_url, "http://svc:9000");

        let mut input = FunctionInput::new("function main() {}")
            .with_context(FunctionContext::new("f1").with_service_layer_url("http://own:1"));
        let ctx = resolve_context(&config, &mut input);
        assert_eq!(ctx.service_layer_url, "http://own:1");
        assert_eq!(input.context.unwrap().service_layer_url, "http://own:1");
    }

    #[test]
    fn classify_prefers_abort_reason() {
        let out = classify(
            Some(AbortReason::Timeout),
            Some((ErrorKind::Runtime, "Error: execution terminated".into())),
            Some(r#"{"ok":1}"#.into()),
        );
        assert_eq!(out.error_kind, Some(ErrorKind::Timeout));
        assert_eq!(out.error, "script execution timed out");
        assert_eq!(out.result, Value::Null);
    }

    #[test]
    fn classify_envelopes() {
        let ok = classify(None, None, Some(r#"{"ok":{"a":1}}"#.into()));
        assert!(ok.is_success());
        assert_eq!(ok.result, json!({"a": 1}));

        let err = classify(None, None, Some(r#"{"error":"boom"}"#.into()));
        assert_eq!(err.error_kind, Some(ErrorKind::Runtime));
        assert_eq!(err.error, "boom");

        let missing = classify(None, None, None);
        assert_eq!(missing.error, "main did not complete");
    }

    #[test]
    fn js_error_message_strips_prefix_and_stack() {
        let msg = js_error_message(&"Uncaught Error: boom\n    at main (function.js:1:1)");
        assert_eq!(msg, "Error: boom");
    }

    #[tokio::test]
    async fn hello_world_function() {
        let code = r#"
            function main(a) {
                console.log("Hello from sandbox!");
                return {
                    success: true,
                    message: "Operation completed",
                    data: a,
                };
            }
        "#;
        let out = sandbox()
            .execute(FunctionInput::new(code).with_args(vec![json!("test"), json!(123), json!(true)]))
            .await
            .unwrap();
        assert!(out.is_success(), "error: {}", out.error);
        assert_eq!(
            out.result,
            json!({"success": true, "message": "Operation completed", "data": ["test", 123, true]})
        );
        assert!(out.logs.iter().any(|l| l.contains("Hello from sandbox!")));
        assert!(out.duration > Duration::ZERO);
        assert!(out.memory_used > 0);
    }

    #[tokio::test]
    async fn args_and_parameters_reach_main() {
        let input = FunctionInput::new(
            "function main(args, params) { return { sum: args[0] + args[1], name: params.name }; }",
        )
        .with_args(vec![json!(2), json!(3)])
        .with_parameter("name", json!("neo"));
        let out = sandbox().execute(input).await.unwrap();
        assert_eq!(out.result, json!({"sum": 5, "name": "neo"}));
    }

    #[tokio::test]
    async fn async_main_is_awaited() {
        let out = run("async function main() { await Promise.resolve(); return 'done'; }").await;
        assert_eq!(out.result, json!("done"));
    }

    #[tokio::test]
    async fn arrow_main_is_found() {
        let out = run("const main = () => 42;").await;
        assert_eq!(out.result, json!(42));
    }

    #[tokio::test]
    async fn undefined_result_is_null() {
        let out = run("function main() {}").await;
        assert!(out.is_success());
        assert_eq!(out.result, Value::Null);
    }

    #[tokio::test]
    async fn thrown_error_keeps_prior_logs() {
        let code = r#"
            function main() {
                console.log("first");
                console.info("second");
                throw new Error("Test error");
            }
        "#;
        let out = run(code).await;
        assert_eq!(out.error, "Test error");
        assert_eq!(out.error_kind, Some(ErrorKind::Runtime));
        assert_eq!(out.logs, vec!["first", "INFO: second"]);
        assert_eq!(out.result, Value::Null);
    }

    #[tokio::test]
    async fn missing_main_is_compile_error() {
        let out = run("const x = 1;").await;
        assert_eq!(out.error, "main function not found in script");
        assert_eq!(out.error_kind, Some(ErrorKind::Compile));
    }

    #[tokio::test]
    async fn syntax_error_is_compile_error() {
        let out = run("function main( {").await;
        assert_eq!(out.error_kind, Some(ErrorKind::Compile));
        assert!(out.error.starts_with("SyntaxError"), "{}", out.error);
    }

    #[tokio::test]
    async fn top_level_throw_is_runtime_error() {
        let out = run("console.log('before'); throw new Error('top'); function main() {}").await;
        assert_eq!(out.error_kind, Some(ErrorKind::Runtime));
        assert!(out.error.contains("top"), "{}", out.error);
        assert_eq!(out.logs, vec!["before"]);
    }

    #[tokio::test]
    async fn unserializable_result_is_conversion_error() {
        let out = run("function main() { return { n: 10n }; }").await;
        assert_eq!(out.error_kind, Some(ErrorKind::Conversion));
        assert!(out.error.starts_with("result is not serializable"), "{}", out.error);
    }

    #[tokio::test]
    async fn cpu_bound_infinite_loop_times_out() {
        let mut sb = Sandbox::new(
            SandboxConfig::default()
                .with_timeout(Duration::from_millis(100))
                .with_log_sink(GuestLogSink::Silent),
        );
        let start = Instant::now();
        let out = sb
            .execute(FunctionInput::new(
                "function main() { console.log('spinning'); while (true) {} }",
            ))
            .await
            .unwrap();
        assert_eq!(out.error_kind, Some(ErrorKind::Timeout));
        assert_eq!(out.error, "script execution timed out");
        assert_eq!(out.logs, vec!["spinning"]);
        assert!(start.elapsed() < Duration::from_secs(2), "took {:?}", start.elapsed());
    }

    #[tokio::test]
    async fn timeout_interrupts_top_level_loop() {
        let mut sb = Sandbox::new(SandboxConfig::default().with_timeout(Duration::from_millis(100)));
        let out = sb
            .execute(FunctionInput::new("for (;;) {} function main() {}"))
            .await
            .unwrap();
        assert_eq!(out.error_kind, Some(ErrorKind::Timeout));
    }

    #[tokio::test]
    async fn heap_exhaustion_is_resource_exceeded() {
        let mut sb = Sandbox::new(
            SandboxConfig::default()
                .with_memory_limit(16 * 1024 * 1024)
                .with_timeout(Duration::from_secs(30)),
        );
        let code = r#"
            function main() {
                const arr = [];
                while (true) arr.push(new Array(100000).fill("x"));
            }
        "#;
        let out = sb.execute(FunctionInput::new(code)).await.unwrap();
        assert_eq!(out.error_kind, Some(ErrorKind::ResourceExceeded), "{}", out.error);
        assert_eq!(out.error, "script exceeded memory limit");
        assert!(out.memory_used > 0);
    }

    #[tokio::test]
    async fn typed_array_exhaustion_is_resource_exceeded() {
        let mut sb = Sandbox::new(
            SandboxConfig::default()
                .with_memory_limit(16 * 1024 * 1024)
                .with_timeout(Duration::from_secs(30))
                .with_log_sink(GuestLogSink::Silent),
        );
        let code = r#"
            function main() {
                const keep = [];
                for (let i = 0; i < 10; i++) {
                    keep.push(new Uint8Array(100 * 1024 * 1024).fill(1));
                }
                return keep.length * 100;
            }
        "#;
        let out = sb.execute(FunctionInput::new(code)).await.unwrap();
        assert_eq!(out.error_kind, Some(ErrorKind::ResourceExceeded), "{}", out.error);
        assert_eq!(out.result, Value::Null);
    }

    #[tokio::test]
    async fn caught_buffer_failure_still_aborts() {
        let mut sb = Sandbox::new(
            SandboxConfig::default()
                .with_memory_limit(16 * 1024 * 1024)
                .with_log_sink(GuestLogSink::Silent),
        );
        let code = r#"
            function main() {
                try { new ArrayBuffer(64 * 1024 * 1024); } catch (_) {}
                return "survived";
            }
        "#;
        let out = sb.execute(FunctionInput::new(code)).await.unwrap();
        assert_eq!(out.error_kind, Some(ErrorKind::ResourceExceeded), "{}", out.error);
    }

    #[tokio::test]
    async fn buffers_within_limit_count_toward_memory_used() {
        let code = r#"
            globalThis.keep = new Uint8Array(8 * 1024 * 1024).fill(7);
            function main() { return keep[0]; }
        "#;
        let out = run(code).await;
        assert!(out.is_success(), "{}", out.error);
        assert_eq!(out.result, json!(7));
        assert!(out.memory_used >= 8 * 1024 * 1024, "{}", out.memory_used);
    }

    #[tokio::test]
    async fn completed_call_is_not_reported_as_timeout() {
        let mut sb = Sandbox::new(
            SandboxConfig::default()
                .with_timeout(Duration::from_millis(200))
                .with_log_sink(GuestLogSink::Silent),
        );
        for _ in 0..5 {
            let out = sb
                .execute(FunctionInput::new("function main() { return 'done'; }"))
                .await
                .unwrap();
            assert!(out.is_success(), "{}", out.error);
            assert_eq!(out.result, json!("done"));
        }
    }

    #[tokio::test]
    async fn cancellation_aborts_execution() {
        let mut sb = sandbox();
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let out = sb
            .execute_with_cancellation(FunctionInput::new("function main() { while (true) {} }"), token)
            .await
            .unwrap();
        assert_eq!(out.error_kind, Some(ErrorKind::Cancelled));
    }

    #[tokio::test]
    async fn closed_sandbox_rejects_calls() {
        let mut sb = sandbox();
        sb.close();
        sb.close();
        assert_eq!(sb.state(), SandboxState::Closed);
        let err = sb.execute(FunctionInput::new("function main() {}")).await.unwrap_err();
        assert!(matches!(err, SandboxError::Closed));
    }

    #[tokio::test]
    async fn sandbox_is_reusable_without_state_leaks() {
        let mut sb = sandbox();
        let first = sb
            .execute(FunctionInput::new("globalThis.leak = 1; function main() { return 1; }"))
            .await
            .unwrap();
        assert_eq!(first.result, json!(1));
        let second = sb
            .execute(FunctionInput::new("function main() { return typeof globalThis.leak; }"))
            .await
            .unwrap();
        assert_eq!(second.result, json!("undefined"));
        assert_eq!(sb.execution_count(), 2);
    }

    #[tokio::test]
    async fn context_is_visible_and_frozen() {
        let ctx = FunctionContext::new("fn-42")
            .with_owner("alice")
            .with_parameter("limit", json!(10));
        let code = r#"
            function main() {
                "use strict";
                let mutated = true;
                try { context.owner = "mallory"; } catch (e) { mutated = false; }
                let nested = true;
                try { context.parameters.limit = 0; } catch (e) { nested = false; }
                return { id: context.functionId, owner: context.owner, limit: context.parameters.limit, mutated, nested };
            }
        "#;
        let out = sandbox()
            .execute(FunctionInput::new(code).with_context(ctx))
            .await
            .unwrap();
        assert_eq!(
            out.result,
            json!({"id": "fn-42", "owner": "alice", "limit": 10, "mutated": false, "nested": false})
        );
    }

    #[tokio::test]
    async fn default_context_is_anonymous() {
        let out = run("function main() { return context.functionId; }").await;
        assert_eq!(out.result, json!("anonymous"));
    }

    #[tokio::test]
    async fn secrets_get() {
        let code = r#"
            function main() {
                let threw = false;
                try { secrets.get(""); } catch (e) { threw = e instanceof TypeError; }
                return { key: secrets.get("api_key"), missing: secrets.get("nope"), threw };
            }
        "#;
        let out = sandbox()
            .execute(FunctionInput::new(code).with_secret("api_key", "s3cr3t"))
            .await
            .unwrap();
        assert_eq!(out.result, json!({"key": "s3cr3t", "missing": null, "threw": true}));
    }

    #[tokio::test]
    async fn console_formats_arguments() {
        let code = r#"
            function main() {
                console.log("a", 1, { b: 2 }, [3], null, undefined);
                console.warn("careful");
                console.error("bad");
                console.debug("dbg");
            }
        "#;
        let out = run(code).await;
        assert_eq!(
            out.logs,
            vec![
                r#"a 1 {"b":2} [3] null undefined"#,
                "WARN: careful",
                "ERROR: bad",
                "DEBUG: dbg"
            ]
        );
    }

    #[tokio::test]
    async fn network_disabled_is_catchable() {
        let code = r#"
            async function main() {
                try {
                    await httpClient.request({ url: "https://example.com" });
                    return "ESCAPED";
                } catch (e) {
                    return e.message;
                }
            }
        "#;
        let out = run(code).await;
        assert_eq!(out.result, json!("httpClient error: network access is disabled"));
    }

    #[tokio::test]
    async fn http_request_requires_one_argument() {
        let mut sb = Sandbox::new(SandboxConfig::default().with_network(true));
        let code = r#"
            async function main() {
                try { await httpClient.request(); } catch (e) { return e instanceof TypeError; }
                return false;
            }
        "#;
        let out = sb.execute(FunctionInput::new(code)).await.unwrap();
        assert_eq!(out.result, json!(true));
    }

    #[tokio::test]
    async fn services_absent_when_interop_disabled() {
        let mut sb = Sandbox::new(SandboxConfig::default().with_interoperability(false));
        let out = sb
            .execute(FunctionInput::new("function main() { return typeof services; }"))
            .await
            .unwrap();
        assert_eq!(out.result, json!("undefined"));
    }

    #[tokio::test]
    async fn services_empty_without_grants() {
        let out = run("function main() { return Object.keys(services).length; }").await;
        assert_eq!(out.result, json!(0));
    }

    #[tokio::test]
    async fn deno_global_is_not_accessible() {
        let out = run("function main() { return typeof Deno; }").await;
        assert_eq!(out.result, json!("undefined"));
    }

    #[tokio::test]
    async fn eval_is_not_accessible() {
        let out = run("function main() { return typeof globalThis.eval; }").await;
        assert_eq!(out.result, json!("undefined"));
    }

    #[tokio::test]
    async fn function_constructors_are_blocked() {
        let code = r#"
            function main() {
                return [
                    String(console.log.constructor),
                    String((async () => {}).constructor),
                    String((function* () {}).constructor),
                ];
            }
        "#;
        let out = run(code).await;
        assert_eq!(out.result, json!(["undefined", "undefined", "undefined"]));
    }

    #[tokio::test]
    async fn invoker_is_hidden() {
        let out = run("function main() { return typeof globalThis.__funcboxInvoke; }").await;
        assert_eq!(out.result, json!("undefined"));
    }

    #[tokio::test]
    async fn bindings_cannot_be_replaced() {
        let code = r#"
            function main() {
                try { globalThis.console = null; } catch (e) {}
                try { console.log = null; } catch (e) {}
                console.log("still here");
                return Object.isFrozen(console) && Object.isFrozen(httpClient);
            }
        "#;
        let out = run(code).await;
        assert_eq!(out.result, json!(true));
        assert_eq!(out.logs, vec!["still here"]);
    }
}
