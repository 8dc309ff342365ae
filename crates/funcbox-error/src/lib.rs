//! Typed error type for funcbox backend services.
//!
//! Provides [`ServiceError`], the error returned by every wallet, storage and
//! oracle service method the sandbox exposes to guest code.

use thiserror::Error;

/// Canonical error type for backend service operations.
///
/// The enum is `#[non_exhaustive]` so services can grow new failure modes
/// without breaking downstream matches.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ServiceError {
    /// The addressed entity (wallet, key, feed, request) does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The caller supplied arguments the service rejects.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The caller is not allowed to perform the operation.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The service did not answer in time.
    #[error("timeout after {timeout_ms}ms in service '{service}'")]
    Timeout {
        /// The service that timed out.
        service: String,
        /// The timeout duration in milliseconds.
        timeout_ms: u64,
    },

    /// The backend is reachable but refused or failed the request.
    #[error("service '{service}' unavailable: {message}")]
    Unavailable {
        /// The service that failed.
        service: String,
        /// The error message from the backend.
        message: String,
    },

    /// An internal error (catch-all for unexpected failures).
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ServiceError {
    /// Returns a static error code string for programmatic matching.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::InvalidArgument(_) => "INVALID_ARGUMENT",
            Self::PermissionDenied(_) => "PERMISSION_DENIED",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Unavailable { .. } => "UNAVAILABLE",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Returns whether the operation that produced this error may succeed if retried.
    pub fn retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Unavailable { .. } => true,
            Self::NotFound(_) => false,
            Self::InvalidArgument(_) => false,
            Self::PermissionDenied(_) => false,
            Self::Internal(_) => false,
        }
    }

    /// Convert to a structured JSON object suitable for logs and API responses.
    pub fn to_structured_error(&self) -> serde_json::Value {
        serde_json::json!({
            "error": true,
            "code": self.code(),
            "message": self.to_string(),
            "retryable": self.retryable(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(ServiceError::NotFound("w1".into()).code(), "NOT_FOUND");
        assert_eq!(
            ServiceError::InvalidArgument("empty key".into()).code(),
            "INVALID_ARGUMENT"
        );
        assert_eq!(
            ServiceError::PermissionDenied("locked".into()).code(),
            "PERMISSION_DENIED"
        );
        assert_eq!(
            ServiceError::Timeout {
                service: "oracle".into(),
                timeout_ms: 100
            }
            .code(),
            "TIMEOUT"
        );
        assert_eq!(
            ServiceError::Unavailable {
                service: "storage".into(),
                message: "503".into()
            }
            .code(),
            "UNAVAILABLE"
        );
        assert_eq!(
            ServiceError::Internal(anyhow::anyhow!("boom")).code(),
            "INTERNAL"
        );
    }

    #[test]
    fn only_transient_failures_are_retryable() {
        assert!(ServiceError::Timeout {
            service: "wallet".into(),
            timeout_ms: 5
        }
        .retryable());
        assert!(ServiceError::Unavailable {
            service: "wallet".into(),
            message: "down".into()
        }
        .retryable());
        assert!(!ServiceError::NotFound("x".into()).retryable());
        assert!(!ServiceError::PermissionDenied("x".into()).retryable());
        assert!(!ServiceError::Internal(anyhow::anyhow!("x")).retryable());
    }

    #[test]
    fn display_includes_context() {
        let err = ServiceError::Unavailable {
            service: "oracle".into(),
            message: "feed offline".into(),
        };
        assert_eq!(err.to_string(), "service 'oracle' unavailable: feed offline");
    }

    #[test]
    fn structured_error_shape() {
        let json = ServiceError::NotFound("wallet main".into()).to_structured_error();
        assert_eq!(json["error"], true);
        assert_eq!(json["code"], "NOT_FOUND");
        assert_eq!(json["message"], "not found: wallet main");
        assert_eq!(json["retryable"], false);
    }
}
