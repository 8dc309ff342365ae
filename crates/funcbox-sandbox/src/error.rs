//! Error types for the funcbox sandbox.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors returned by the host-facing sandbox API.
///
/// Guest failures (thrown exceptions, timeouts, memory aborts) are not
/// errors at this level: they are reported inside
/// [`FunctionOutput`](crate::FunctionOutput) together with the logs captured
/// so far. These variants cover failures of the engine itself.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The sandbox was closed and can no longer execute.
    #[error("sandbox is closed")]
    Closed,

    /// Code failed static validation.
    #[error("code validation failed: {reason}")]
    Validation {
        /// What went wrong.
        reason: String,
    },

    /// No pooled sandbox is available and the pool is at capacity.
    #[error("sandbox pool exhausted (max {max} sandboxes)")]
    PoolExhausted {
        /// Configured pool capacity.
        max: usize,
    },

    /// The pool has been shut down.
    #[error("sandbox pool is shut down")]
    PoolShutdown,

    /// Generic engine failure (thread spawn, runtime construction, panics).
    #[error("sandbox execution failed: {0}")]
    Execution(#[from] anyhow::Error),

    /// Wire-format encoding or decoding failed.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Classification of a failed execution, carried in
/// [`FunctionOutput::error_kind`](crate::FunctionOutput::error_kind).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A configuration value was unusable.
    Configuration,
    /// The per-call environment could not be prepared.
    Setup,
    /// The guest script did not parse, or has no `main`.
    Compile,
    /// The guest threw, or rejected, during evaluation.
    Runtime,
    /// The wall-clock budget elapsed.
    Timeout,
    /// The memory budget was exceeded.
    ResourceExceeded,
    /// The caller cancelled the execution.
    Cancelled,
    /// A guest value did not fit a host shape.
    Conversion,
    /// An outbound HTTP request failed or was denied.
    Network,
    /// The code was rejected by the static validator.
    Validation,
}

impl ErrorKind {
    /// Stable lowercase name, used as a metrics label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::Setup => "setup",
            Self::Compile => "compile",
            Self::Runtime => "runtime",
            Self::Timeout => "timeout",
            Self::ResourceExceeded => "resource_exceeded",
            Self::Cancelled => "cancelled",
            Self::Conversion => "conversion",
            Self::Network => "network",
            Self::Validation => "validation",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::ResourceExceeded).unwrap();
        assert_eq!(json, "\"resource_exceeded\"");
        let back: ErrorKind = serde_json::from_str("\"timeout\"").unwrap();
        assert_eq!(back, ErrorKind::Timeout);
    }

    #[test]
    fn display_matches_label() {
        assert_eq!(ErrorKind::Cancelled.to_string(), "cancelled");
        assert_eq!(ErrorKind::Compile.as_str(), "compile");
    }
}
