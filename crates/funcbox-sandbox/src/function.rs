//! Input, context and output types of a single function execution.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ErrorKind;
use crate::{OracleService, StorageService, WalletService};

/// Backend service handles granted to one execution.
///
/// A `None` slot means the capability is not granted; the guest `services`
/// object then has no member for it. Never serialized.
#[derive(Clone, Default)]
pub struct ServiceClients {
    /// Wallet backend.
    pub wallet: Option<Arc<dyn WalletService>>,
    /// Key/value storage backend.
    pub storage: Option<Arc<dyn StorageService>>,
    /// Oracle backend.
    pub oracle: Option<Arc<dyn OracleService>>,
}

impl ServiceClients {
    /// Whether at least one service is granted.
    pub fn any(&self) -> bool {
        self.wallet.is_some() || self.storage.is_some() || self.oracle.is_some()
    }
}

// Trait objects have no meaningful equality; compare by which slots are granted.
impl PartialEq for ServiceClients {
    fn eq(&self, other: &Self) -> bool {
        self.wallet.is_some() == other.wallet.is_some()
            && self.storage.is_some() == other.storage.is_some()
            && self.oracle.is_some() == other.oracle.is_some()
    }
}

impl fmt::Debug for ServiceClients {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceClients")
            .field("wallet", &self.wallet.is_some())
            .field("storage", &self.storage.is_some())
            .field("oracle", &self.oracle.is_some())
            .finish()
    }
}

/// Metadata about the invocation, visible to the guest as `context`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FunctionContext {
    /// Registered function id.
    pub function_id: String,
    /// Unique id of this execution.
    pub execution_id: String,
    /// Owner of the function.
    pub owner: String,
    /// Identity that triggered the execution.
    pub caller: String,
    /// Free-form invocation parameters.
    pub parameters: Map<String, Value>,
    /// Environment strings configured for the function.
    pub environment: HashMap<String, String>,
    /// Distributed trace id, if any.
    pub trace_id: String,
    /// Base URL of the service layer backing `services`.
    pub service_layer_url: String,
    /// Granted backend services.
    #[serde(skip)]
    pub services: ServiceClients,
}

impl FunctionContext {
    /// Context for `function_id` with a freshly generated execution id.
    pub fn new(function_id: impl Into<String>) -> Self {
        Self {
            function_id: function_id.into(),
            execution_id: uuid::Uuid::new_v4().to_string(),
            ..Default::default()
        }
    }

    /// Set the owner.
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    /// Set the caller.
    pub fn with_caller(mut self, caller: impl Into<String>) -> Self {
        self.caller = caller.into();
        self
    }

    /// Set the trace id.
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    /// Set one invocation parameter.
    pub fn with_parameter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    /// Set one environment entry.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    /// Set the service layer URL.
    pub fn with_service_layer_url(mut self, url: impl Into<String>) -> Self {
        self.service_layer_url = url.into();
        self
    }

    /// Grant the wallet service.
    pub fn with_wallet(mut self, wallet: Arc<dyn WalletService>) -> Self {
        self.services.wallet = Some(wallet);
        self
    }

    /// Grant the storage service.
    pub fn with_storage(mut self, storage: Arc<dyn StorageService>) -> Self {
        self.services.storage = Some(storage);
        self
    }

    /// Grant the oracle service.
    pub fn with_oracle(mut self, oracle: Arc<dyn OracleService>) -> Self {
        self.services.oracle = Some(oracle);
        self
    }

    /// Guest-visible projection. Service handles and the service layer URL
    /// stay on the host.
    pub(crate) fn guest_view(&self) -> Value {
        serde_json::json!({
            "functionId": self.function_id,
            "executionId": self.execution_id,
            "owner": self.owner,
            "caller": self.caller,
            "parameters": self.parameters,
            "environment": self.environment,
            "traceId": self.trace_id,
        })
    }
}

/// Everything needed to run one function once.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FunctionInput {
    /// Guest source. Must define `main`.
    pub code: String,
    /// Positional arguments, passed as the first parameter of `main`.
    pub args: Vec<Value>,
    /// Named parameters, passed as the second parameter of `main`.
    pub parameters: Map<String, Value>,
    /// Invocation context. Defaulted by the orchestrator when absent.
    pub context: Option<FunctionContext>,
    /// Plaintext secrets readable through `secrets.get(name)`.
    pub secrets: HashMap<String, String>,
}

impl FunctionInput {
    /// Input with just source code.
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            ..Default::default()
        }
    }

    /// Set the positional arguments.
    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    /// Set one named parameter.
    pub fn with_parameter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    /// Set the context.
    pub fn with_context(mut self, context: FunctionContext) -> Self {
        self.context = Some(context);
        self
    }

    /// Add one secret.
    pub fn with_secret(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.secrets.insert(name.into(), value.into());
        self
    }
}

/// Result of one execution. `error` is empty on success.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FunctionOutput {
    /// Value returned by `main`, `null` on failure.
    pub result: Value,
    /// Every guest log line, in emission order.
    pub logs: Vec<String>,
    /// Failure description, empty on success.
    pub error: String,
    /// Failure classification, absent on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    /// Wall-clock time of the call, encoded as integer nanoseconds.
    #[serde(with = "duration_nanos")]
    pub duration: Duration,
    /// Peak guest heap usage in bytes.
    pub memory_used: u64,
}

impl FunctionOutput {
    /// Whether the function completed without error.
    pub fn is_success(&self) -> bool {
        self.error.is_empty()
    }

    pub(crate) fn failed(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            error_kind: Some(kind),
            ..Default::default()
        }
    }
}

mod duration_nanos {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_nanos)
    }
}
