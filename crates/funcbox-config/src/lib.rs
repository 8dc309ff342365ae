#![warn(missing_docs)]

//! # funcbox-config
//!
//! Configuration loading for the funcbox function engine.
//!
//! Supports TOML configuration files with environment variable expansion.
//! Every field is optional; unset fields keep the engine defaults.
//!
//! ## Example
//!
//! ```toml
//! [sandbox]
//! timeout_ms = 5000
//! memory_limit_mb = 128
//! allow_network = true
//! service_layer_url = "https://services.internal:8443"
//! guest_log = "tracing"
//!
//! [pool]
//! max_sandboxes = 8
//! max_uses = 50
//!
//! [secrets]
//! api_key = "${PRICE_API_KEY}"
//! ```

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// Errors from config parsing.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Invalid configuration value.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level funcbox configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FuncboxConfig {
    /// Sandbox limits and capability switches.
    #[serde(default)]
    pub sandbox: SandboxOverrides,

    /// Sandbox pool settings.
    #[serde(default)]
    pub pool: PoolOverrides,

    /// Secrets handed to every execution, merged under the input's own.
    #[serde(default)]
    pub secrets: HashMap<String, String>,
}

/// Sandbox configuration overrides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SandboxOverrides {
    /// Wall-clock budget per call in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Guest heap ceiling in megabytes.
    #[serde(default)]
    pub memory_limit_mb: Option<usize>,

    /// Execution thread stack in kilobytes.
    #[serde(default)]
    pub stack_size_kb: Option<usize>,

    /// Allow outbound HTTP from guest code.
    #[serde(default)]
    pub allow_network: Option<bool>,

    /// Reserved file I/O switch.
    #[serde(default)]
    pub allow_file_io: Option<bool>,

    /// Bind granted services into guest code.
    #[serde(default)]
    pub enable_interoperability: Option<bool>,

    /// Base URL of the service layer.
    #[serde(default)]
    pub service_layer_url: Option<String>,

    /// Heap sampling interval in milliseconds.
    #[serde(default)]
    pub memory_check_interval_ms: Option<u64>,

    /// Per-request HTTP timeout in seconds.
    #[serde(default)]
    pub http_timeout_secs: Option<u64>,

    /// Largest accepted HTTP response body in megabytes.
    #[serde(default)]
    pub max_http_response_mb: Option<usize>,

    /// Guest log forwarding: `tracing` (default) or `silent`.
    #[serde(default)]
    pub guest_log: Option<String>,
}

/// Sandbox pool overrides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolOverrides {
    /// Maximum sandboxes alive at once.
    #[serde(default)]
    pub max_sandboxes: Option<usize>,

    /// Retire a sandbox after this many executions.
    #[serde(default)]
    pub max_uses: Option<u64>,

    /// Close idle sandboxes after this many seconds.
    #[serde(default)]
    pub max_idle_secs: Option<u64>,
}

impl FuncboxConfig {
    /// Parse a config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: FuncboxConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse a config from a TOML string, expanding `${ENV_VAR}` references.
    pub fn from_toml_with_env(toml_str: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(toml_str);
        Self::from_toml(&expanded)
    }

    /// Load config from a file path, expanding environment variables.
    pub fn from_file_with_env(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_with_env(&content)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(url) = &self.sandbox.service_layer_url {
            if !url.is_empty() && !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConfigError::Invalid(format!(
                    "sandbox.service_layer_url '{url}' must start with http:// or https://"
                )));
            }
        }
        if let Some(sink) = &self.sandbox.guest_log {
            if !matches!(sink.as_str(), "tracing" | "silent") {
                return Err(ConfigError::Invalid(format!(
                    "sandbox.guest_log '{sink}' is not supported, supported: tracing, silent"
                )));
            }
        }
        if self.pool.max_sandboxes == Some(0) {
            return Err(ConfigError::Invalid(
                "pool.max_sandboxes must be at least 1".into(),
            ));
        }
        if let Some(name) = self.secrets.keys().find(|k| k.is_empty()) {
            return Err(ConfigError::Invalid(format!(
                "secret name '{name}' must not be empty"
            )));
        }
        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns using the process environment. Unknown
/// variables are left as-is.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '$' || chars.peek() != Some(&'{') {
            result.push(ch);
            continue;
        }
        chars.next();
        let mut name = String::new();
        let mut closed = false;
        for c in chars.by_ref() {
            if c == '}' {
                closed = true;
                break;
            }
            name.push(c);
        }
        match std::env::var(&name) {
            Ok(value) if closed => result.push_str(&value),
            _ => {
                result.push_str("${");
                result.push_str(&name);
                if closed {
                    result.push('}');
                }
            }
        }
    }

    result
}
