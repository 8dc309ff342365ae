#![warn(missing_docs)]

//! # funcbox-sandbox
//!
//! Execution engine for untrusted, caller-supplied JavaScript functions.
//!
//! Each call runs in a fresh deno_core isolate with bounded heap and wall
//! clock. The only bridges to the host are explicitly registered ops that
//! back a small set of guest bindings: `console`, `context`, `secrets`, the
//! opt-in `services` object and the network-gated `httpClient`.
//!
//! ## Security model
//!
//! - **Fresh isolate per call**: no guest state survives between executions
//! - **Fail-closed capabilities**: a binding that is not granted has no path to its op
//! - **Closed method sets**: service objects expose exactly the allow-listed methods
//! - **One abort path**: timeout, memory and cancellation all trip the same interrupter
//! - **Registration-time validation**: rule-based screening before code is stored
//! - **Redacted host errors**: backend failure text is scrubbed before the guest sees it

pub mod audit;
pub mod bridge;
pub mod capabilities;
pub mod enforce;
pub mod error;
pub mod executor;
pub mod function;
pub mod http;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod ops;
pub mod pool;
pub mod redact;
pub mod validator;
pub mod wire;

use std::collections::HashMap;

pub use error::{ErrorKind, SandboxError};
pub use executor::{GuestLogSink, Sandbox, SandboxConfig, SandboxState};
pub use function::{FunctionContext, FunctionInput, FunctionOutput, ServiceClients};
pub use funcbox_error::ServiceError;
pub use pool::{PoolConfig, ReleaseOutcome, SandboxPool};
pub use validator::{FunctionValidator, Severity, ValidationReport, Violation};

/// Wallet backend exposed to guest code as `services.wallet`.
///
/// Implementations hold keys and talk to the wallet store. Guest code only
/// reaches them through the allow-listed methods in
/// [`capabilities::WalletMethod`].
#[async_trait::async_trait]
pub trait WalletService: Send + Sync {
    /// Create a new wallet protected by `password`.
    async fn create_wallet(&self, name: &str, password: &str) -> Result<(), ServiceError>;

    /// Unlock an existing wallet.
    async fn open_wallet(&self, name: &str, password: &str) -> Result<(), ServiceError>;

    /// Lock a previously opened wallet.
    async fn close_wallet(&self, name: &str) -> Result<(), ServiceError>;

    /// Names of all wallets visible to the caller.
    async fn list_wallets(&self) -> Result<Vec<String>, ServiceError>;

    /// Descriptive metadata for one wallet.
    async fn get_wallet_info(&self, name: &str)
        -> Result<serde_json::Value, ServiceError>;

    /// Create a new account inside `wallet` and describe it.
    async fn create_account(&self, wallet: &str) -> Result<serde_json::Value, ServiceError>;

    /// Describe every account in `wallet`.
    async fn list_accounts(&self, wallet: &str) -> Result<Vec<serde_json::Value>, ServiceError>;

    /// Describe the account at `address` in `wallet`.
    async fn get_account_info(
        &self,
        wallet: &str,
        address: &str,
    ) -> Result<serde_json::Value, ServiceError>;

    /// Sign `message` with the key for `address` and return the signature.
    async fn sign_message(
        &self,
        wallet: &str,
        address: &str,
        message: &str,
    ) -> Result<String, ServiceError>;
}

/// Key/value storage exposed to guest code as `services.storage`.
#[async_trait::async_trait]
pub trait StorageService: Send + Sync {
    /// Store `value` under `key`, replacing any previous value.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), ServiceError>;

    /// Fetch the value stored under `key`.
    async fn get(&self, key: &str) -> Result<Vec<u8>, ServiceError>;

    /// Remove `key`.
    async fn delete(&self, key: &str) -> Result<(), ServiceError>;

    /// Keys starting with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, ServiceError>;
}

/// Data-feed oracle exposed to guest code as `services.oracle`.
#[async_trait::async_trait]
pub trait OracleService: Send + Sync {
    /// Latest data point of a feed.
    async fn get_data(&self, feed_id: &str) -> Result<serde_json::Value, ServiceError>;

    /// Submit an oracle request and return its id.
    async fn submit_request(
        &self,
        feed_type: &str,
        params: HashMap<String, serde_json::Value>,
    ) -> Result<String, ServiceError>;

    /// Status of a previously submitted request.
    async fn get_request_status(
        &self,
        request_id: &str,
    ) -> Result<serde_json::Value, ServiceError>;
}
