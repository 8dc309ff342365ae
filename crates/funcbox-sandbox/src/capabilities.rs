//! Named backend services exposed to guest code.
//!
//! Each service kind has a closed method enum. The enum is the allow-list:
//! the guest-side objects are generated from [`WalletMethod::ALL`] and
//! friends, and host-side dispatch parses the requested name back into the
//! enum, so a method outside the list is unreachable from both ends.
//!
//! A [`CapabilitySet`] is assembled once per execution, before guest code
//! runs, and is never mutated afterwards.

use std::collections::HashMap;
use std::fmt;

use serde_json::Value;
use thiserror::Error;

use crate::bridge::{to_guest, Bytes, ConversionError, GuestArgs};
use crate::function::ServiceClients;
use crate::redact::redact_error_message;

/// A service call could not be completed.
#[derive(Debug, Error)]
pub enum CapabilityError {
    /// The requested service was not granted to this execution.
    #[error("service '{0}' is not available")]
    ServiceUnavailable(String),

    /// The method is not on the service's allow-list.
    #[error("method '{method}' is not allowed on service '{service}'")]
    MethodNotAllowed {
        /// Service that was addressed.
        service: String,
        /// Method that was requested.
        method: String,
    },

    /// Arguments did not fit the method's parameters.
    #[error(transparent)]
    Conversion(#[from] ConversionError),

    /// The backend returned an error. The message is already redacted.
    #[error("{service}.{method} failed: {message}")]
    Service {
        /// Service name.
        service: &'static str,
        /// Method name.
        method: &'static str,
        /// Stable code from [`funcbox_error::ServiceError::code`].
        code: &'static str,
        /// Redacted backend message.
        message: String,
    },
}

/// Kinds of backend service a function may be granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    /// `services.wallet`
    Wallet,
    /// `services.storage`
    Storage,
    /// `services.oracle`
    Oracle,
}

impl ServiceKind {
    /// Every service kind, in binding order.
    pub const ALL: [ServiceKind; 3] = [Self::Wallet, Self::Storage, Self::Oracle];

    /// Guest property name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Wallet => "wallet",
            Self::Storage => "storage",
            Self::Oracle => "oracle",
        }
    }

    /// Parse a guest property name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }

    /// Allow-listed method names for this kind.
    pub fn method_names(&self) -> Vec<&'static str> {
        match self {
            Self::Wallet => WalletMethod::ALL.iter().map(|m| m.name()).collect(),
            Self::Storage => StorageMethod::ALL.iter().map(|m| m.name()).collect(),
            Self::Oracle => OracleMethod::ALL.iter().map(|m| m.name()).collect(),
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Allow-listed wallet methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WalletMethod {
    /// `OpenWallet(name, password)`
    OpenWallet,
    /// `CreateWallet(name, password)`
    CreateWallet,
    /// `ListWallets()`
    ListWallets,
    /// `GetWalletInfo(name)`
    GetWalletInfo,
    /// `CreateAccount(wallet)`
    CreateAccount,
    /// `ListAccounts(wallet)`
    ListAccounts,
    /// `GetAccountInfo(wallet, address)`
    GetAccountInfo,
    /// `SignMessage(wallet, address, message)`
    SignMessage,
    /// `CloseWallet(name)`
    CloseWallet,
}

impl WalletMethod {
    /// The complete allow-list.
    pub const ALL: [WalletMethod; 9] = [
        Self::OpenWallet,
        Self::CreateWallet,
        Self::ListWallets,
        Self::GetWalletInfo,
        Self::CreateAccount,
        Self::ListAccounts,
        Self::GetAccountInfo,
        Self::SignMessage,
        Self::CloseWallet,
    ];

    /// Guest-visible method name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::OpenWallet => "OpenWallet",
            Self::CreateWallet => "CreateWallet",
            Self::ListWallets => "ListWallets",
            Self::GetWalletInfo => "GetWalletInfo",
            Self::CreateAccount => "CreateAccount",
            Self::ListAccounts => "ListAccounts",
            Self::GetAccountInfo => "GetAccountInfo",
            Self::SignMessage => "SignMessage",
            Self::CloseWallet => "CloseWallet",
        }
    }

    /// Number of guest arguments the method takes.
    pub fn arity(&self) -> usize {
        match self {
            Self::ListWallets => 0,
            Self::GetWalletInfo | Self::CreateAccount | Self::ListAccounts | Self::CloseWallet => 1,
            Self::OpenWallet | Self::CreateWallet | Self::GetAccountInfo => 2,
            Self::SignMessage => 3,
        }
    }

    /// Parse a guest-visible method name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.name() == name)
    }
}

/// Allow-listed storage methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageMethod {
    /// `Put(key, value)`
    Put,
    /// `Get(key)`
    Get,
    /// `Delete(key)`
    Delete,
    /// `List(prefix)`
    List,
}

impl StorageMethod {
    /// The complete allow-list.
    pub const ALL: [StorageMethod; 4] = [Self::Put, Self::Get, Self::Delete, Self::List];

    /// Guest-visible method name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Put => "Put",
            Self::Get => "Get",
            Self::Delete => "Delete",
            Self::List => "List",
        }
    }

    /// Number of guest arguments the method takes.
    pub fn arity(&self) -> usize {
        match self {
            Self::Put => 2,
            Self::Get | Self::Delete | Self::List => 1,
        }
    }

    /// Parse a guest-visible method name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.name() == name)
    }
}

/// Allow-listed oracle methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OracleMethod {
    /// `GetData(feedId)`
    GetData,
    /// `SubmitRequest(feedType, params)`
    SubmitRequest,
    /// `GetRequestStatus(requestId)`
    GetRequestStatus,
}

impl OracleMethod {
    /// The complete allow-list.
    pub const ALL: [OracleMethod; 3] = [Self::GetData, Self::SubmitRequest, Self::GetRequestStatus];

    /// Guest-visible method name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::GetData => "GetData",
            Self::SubmitRequest => "SubmitRequest",
            Self::GetRequestStatus => "GetRequestStatus",
        }
    }

    /// Number of guest arguments the method takes.
    pub fn arity(&self) -> usize {
        match self {
            Self::GetData | Self::GetRequestStatus => 1,
            Self::SubmitRequest => 2,
        }
    }

    /// Parse a guest-visible method name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.name() == name)
    }
}

/// A fully decoded wallet invocation.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq)]
pub enum WalletCall {
    /// See [`WalletMethod::OpenWallet`].
    OpenWallet { name: String, password: String },
    /// See [`WalletMethod::CreateWallet`].
    CreateWallet { name: String, password: String },
    /// See [`WalletMethod::ListWallets`].
    ListWallets,
    /// See [`WalletMethod::GetWalletInfo`].
    GetWalletInfo { name: String },
    /// See [`WalletMethod::CreateAccount`].
    CreateAccount { wallet: String },
    /// See [`WalletMethod::ListAccounts`].
    ListAccounts { wallet: String },
    /// See [`WalletMethod::GetAccountInfo`].
    GetAccountInfo { wallet: String, address: String },
    /// See [`WalletMethod::SignMessage`].
    SignMessage {
        wallet: String,
        address: String,
        message: String,
    },
    /// See [`WalletMethod::CloseWallet`].
    CloseWallet { name: String },
}

impl WalletCall {
    /// Decode `args` for `method`. Arity is checked before any conversion.
    pub fn decode(method: WalletMethod, args: &GuestArgs) -> Result<Self, ConversionError> {
        args.require(method.arity())?;
        Ok(match method {
            WalletMethod::OpenWallet => Self::OpenWallet {
                name: args.get(0)?,
                password: args.get(1)?,
            },
            WalletMethod::CreateWallet => Self::CreateWallet {
                name: args.get(0)?,
                password: args.get(1)?,
            },
            WalletMethod::ListWallets => Self::ListWallets,
            WalletMethod::GetWalletInfo => Self::GetWalletInfo { name: args.get(0)? },
            WalletMethod::CreateAccount => Self::CreateAccount {
                wallet: args.get(0)?,
            },
            WalletMethod::ListAccounts => Self::ListAccounts {
                wallet: args.get(0)?,
            },
            WalletMethod::GetAccountInfo => Self::GetAccountInfo {
                wallet: args.get(0)?,
                address: args.get(1)?,
            },
            WalletMethod::SignMessage => Self::SignMessage {
                wallet: args.get(0)?,
                address: args.get(1)?,
                message: args.get(2)?,
            },
            WalletMethod::CloseWallet => Self::CloseWallet { name: args.get(0)? },
        })
    }
}

/// A fully decoded storage invocation.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq)]
pub enum StorageCall {
    /// See [`StorageMethod::Put`].
    Put { key: String, value: Bytes },
    /// See [`StorageMethod::Get`].
    Get { key: String },
    /// See [`StorageMethod::Delete`].
    Delete { key: String },
    /// See [`StorageMethod::List`].
    List { prefix: String },
}

impl StorageCall {
    /// Decode `args` for `method`. Arity is checked before any conversion.
    pub fn decode(method: StorageMethod, args: &GuestArgs) -> Result<Self, ConversionError> {
        args.require(method.arity())?;
        Ok(match method {
            StorageMethod::Put => Self::Put {
                key: args.get(0)?,
                value: args.get(1)?,
            },
            StorageMethod::Get => Self::Get { key: args.get(0)? },
            StorageMethod::Delete => Self::Delete { key: args.get(0)? },
            StorageMethod::List => Self::List {
                prefix: args.get(0)?,
            },
        })
    }
}

/// A fully decoded oracle invocation.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq)]
pub enum OracleCall {
    /// See [`OracleMethod::GetData`].
    GetData { feed_id: String },
    /// See [`OracleMethod::SubmitRequest`].
    SubmitRequest {
        feed_type: String,
        params: HashMap<String, Value>,
    },
    /// See [`OracleMethod::GetRequestStatus`].
    GetRequestStatus { request_id: String },
}

impl OracleCall {
    /// Decode `args` for `method`. Arity is checked before any conversion.
    pub fn decode(method: OracleMethod, args: &GuestArgs) -> Result<Self, ConversionError> {
        args.require(method.arity())?;
        Ok(match method {
            OracleMethod::GetData => Self::GetData {
                feed_id: args.get(0)?,
            },
            OracleMethod::SubmitRequest => Self::SubmitRequest {
                feed_type: args.get(0)?,
                params: args.get(1)?,
            },
            OracleMethod::GetRequestStatus => Self::GetRequestStatus {
                request_id: args.get(0)?,
            },
        })
    }
}

/// Immutable set of capabilities granted to one execution.
#[derive(Clone, Default)]
pub struct CapabilitySet {
    services: ServiceClients,
    network: bool,
}

impl fmt::Debug for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilitySet")
            .field("services", &self.granted())
            .field("network", &self.network)
            .finish()
    }
}

impl CapabilitySet {
    /// Build the set for one execution. Services are granted only when
    /// interoperability is enabled.
    pub fn new(clients: &ServiceClients, enable_interoperability: bool, allow_network: bool) -> Self {
        let services = if enable_interoperability {
            clients.clone()
        } else {
            ServiceClients::default()
        };
        Self {
            services,
            network: allow_network,
        }
    }

    /// Granted service kinds, in binding order.
    pub fn granted(&self) -> Vec<ServiceKind> {
        ServiceKind::ALL
            .into_iter()
            .filter(|k| match k {
                ServiceKind::Wallet => self.services.wallet.is_some(),
                ServiceKind::Storage => self.services.storage.is_some(),
                ServiceKind::Oracle => self.services.oracle.is_some(),
            })
            .collect()
    }

    /// Whether outbound HTTP is granted.
    pub fn network_allowed(&self) -> bool {
        self.network
    }

    /// Dispatch one guest call. `args_json` is the JSON array of arguments.
    pub async fn invoke(
        &self,
        service: &str,
        method: &str,
        args_json: &str,
    ) -> Result<Value, CapabilityError> {
        let not_allowed = || CapabilityError::MethodNotAllowed {
            service: service.to_string(),
            method: method.to_string(),
        };
        let kind = ServiceKind::from_name(service)
            .ok_or_else(|| CapabilityError::ServiceUnavailable(service.to_string()))?;

        match kind {
            ServiceKind::Wallet => {
                let client = self
                    .services
                    .wallet
                    .as_ref()
                    .ok_or_else(|| CapabilityError::ServiceUnavailable(service.to_string()))?;
                let m = WalletMethod::from_name(method).ok_or_else(not_allowed)?;
                let call = WalletCall::decode(m, &GuestArgs::parse(args_json)?)?;
                let fail = |e| service_failure(kind, m.name(), e);
                match call {
                    WalletCall::OpenWallet { name, password } => {
                        client.open_wallet(&name, &password).await.map_err(fail)?;
                        Ok(Value::Null)
                    }
                    WalletCall::CreateWallet { name, password } => {
                        client.create_wallet(&name, &password).await.map_err(fail)?;
                        Ok(Value::Null)
                    }
                    WalletCall::ListWallets => Ok(to_guest(&client.list_wallets().await.map_err(fail)?)?),
                    WalletCall::GetWalletInfo { name } => {
                        Ok(client.get_wallet_info(&name).await.map_err(fail)?)
                    }
                    WalletCall::CreateAccount { wallet } => {
                        Ok(client.create_account(&wallet).await.map_err(fail)?)
                    }
                    WalletCall::ListAccounts { wallet } => {
                        Ok(Value::Array(client.list_accounts(&wallet).await.map_err(fail)?))
                    }
                    WalletCall::GetAccountInfo { wallet, address } => Ok(client
                        .get_account_info(&wallet, &address)
                        .await
                        .map_err(fail)?),
                    WalletCall::SignMessage {
                        wallet,
                        address,
                        message,
                    } => Ok(Value::String(
                        client
                            .sign_message(&wallet, &address, &message)
                            .await
                            .map_err(fail)?,
                    )),
                    WalletCall::CloseWallet { name } => {
                        client.close_wallet(&name).await.map_err(fail)?;
                        Ok(Value::Null)
                    }
                }
            }
            ServiceKind::Storage => {
                let client = self
                    .services
                    .storage
                    .as_ref()
                    .ok_or_else(|| CapabilityError::ServiceUnavailable(service.to_string()))?;
                let m = StorageMethod::from_name(method).ok_or_else(not_allowed)?;
                let call = StorageCall::decode(m, &GuestArgs::parse(args_json)?)?;
                let fail = |e| service_failure(kind, m.name(), e);
                match call {
                    StorageCall::Put { key, value } => {
                        client.put(&key, value.0).await.map_err(fail)?;
                        Ok(Value::Null)
                    }
                    StorageCall::Get { key } => {
                        Ok(Bytes(client.get(&key).await.map_err(fail)?).to_guest_value())
                    }
                    StorageCall::Delete { key } => {
                        client.delete(&key).await.map_err(fail)?;
                        Ok(Value::Null)
                    }
                    StorageCall::List { prefix } => {
                        Ok(to_guest(&client.list(&prefix).await.map_err(fail)?)?)
                    }
                }
            }
            ServiceKind::Oracle => {
                let client = self
                    .services
                    .oracle
                    .as_ref()
                    .ok_or_else(|| CapabilityError::ServiceUnavailable(service.to_string()))?;
                let m = OracleMethod::from_name(method).ok_or_else(not_allowed)?;
                let call = OracleCall::decode(m, &GuestArgs::parse(args_json)?)?;
                let fail = |e| service_failure(kind, m.name(), e);
                match call {
                    OracleCall::GetData { feed_id } => {
                        Ok(client.get_data(&feed_id).await.map_err(fail)?)
                    }
                    OracleCall::SubmitRequest { feed_type, params } => Ok(Value::String(
                        client
                            .submit_request(&feed_type, params)
                            .await
                            .map_err(fail)?,
                    )),
                    OracleCall::GetRequestStatus { request_id } => Ok(client
                        .get_request_status(&request_id)
                        .await
                        .map_err(fail)?),
                }
            }
        }
    }

    /// JavaScript expression evaluating to the frozen `services` object.
    ///
    /// Expects `callService(service, method, args)` in scope. Only granted
    /// services get a member, and each member carries exactly its
    /// allow-listed methods on a null prototype.
    pub(crate) fn services_js(&self) -> String {
        let mut js = String::from("(() => {\n    const services = Object.create(null);\n");
        for kind in self.granted() {
            let methods = kind
                .method_names()
                .iter()
                .map(|m| format!("\"{m}\""))
                .collect::<Vec<_>>()
                .join(", ");
            js.push_str(&format!(
                "    const {name} = Object.create(null);\n    for (const m of [{methods}]) {{\n        {name}[m] = (...args) => callService(\"{name}\", m, args);\n    }}\n    services.{name} = Object.freeze({name});\n",
                name = kind.name(),
            ));
        }
        js.push_str("    return Object.freeze(services);\n})()");
        js
    }
}

fn service_failure(
    kind: ServiceKind,
    method: &'static str,
    err: funcbox_error::ServiceError,
) -> CapabilityError {
    tracing::debug!(
        service = kind.name(),
        method,
        code = err.code(),
        retryable = err.retryable(),
        "service call failed"
    );
    CapabilityError::Service {
        service: kind.name(),
        method,
        code: err.code(),
        message: redact_error_message(&err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use crate::{ServiceError, StorageService};

    #[derive(Default)]
    struct MemStorage {
        data: Mutex<HashMap<String, Vec<u8>>>,
    }

    #[async_trait::async_trait]
    impl StorageService for MemStorage {
        async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), ServiceError> {
            self.data.lock().unwrap().insert(key.to_string(), value);
            Ok(())
        }
        async fn get(&self, key: &str) -> Result<Vec<u8>, ServiceError> {
            self.data
                .lock()
                .unwrap()
                .get(key)
                .cloned()
                .ok_or_else(|| ServiceError::NotFound(format!("key {key} at /var/lib/store/db")))
        }
        async fn delete(&self, key: &str) -> Result<(), ServiceError> {
            self.data.lock().unwrap().remove(key);
            Ok(())
        }
        async fn list(&self, prefix: &str) -> Result<Vec<String>, ServiceError> {
            let mut keys: Vec<_> = self
                .data
                .lock()
                .unwrap()
                .keys()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect();
            keys.sort();
            Ok(keys)
        }
    }

    fn storage_set() -> CapabilitySet {
        let clients = ServiceClients {
            storage: Some(Arc::new(MemStorage::default())),
            ..Default::default()
        };
        CapabilitySet::new(&clients, true, false)
    }

    #[test]
    fn method_enums_round_trip_names() {
        for m in WalletMethod::ALL {
            assert_eq!(WalletMethod::from_name(m.name()), Some(m));
        }
        for m in StorageMethod::ALL {
            assert_eq!(StorageMethod::from_name(m.name()), Some(m));
        }
        for m in OracleMethod::ALL {
            assert_eq!(OracleMethod::from_name(m.name()), Some(m));
        }
        assert_eq!(WalletMethod::from_name("ExportPrivateKey"), None);
        assert_eq!(StorageMethod::from_name("put"), None);
    }

    #[test]
    fn wallet_allow_list_is_exact() {
        assert_eq!(
            ServiceKind::Wallet.method_names(),
            vec![
                "OpenWallet",
                "CreateWallet",
                "ListWallets",
                "GetWalletInfo",
                "CreateAccount",
                "ListAccounts",
                "GetAccountInfo",
                "SignMessage",
                "CloseWallet"
            ]
        );
        assert_eq!(ServiceKind::Storage.method_names(), vec!["Put", "Get", "Delete", "List"]);
        assert_eq!(
            ServiceKind::Oracle.method_names(),
            vec!["GetData", "SubmitRequest", "GetRequestStatus"]
        );
    }

    #[test]
    fn decode_checks_arity_first() {
        let args = GuestArgs::from_values(vec![Value::from("w")]);
        let err = WalletCall::decode(WalletMethod::SignMessage, &args).unwrap_err();
        assert_eq!(
            err,
            ConversionError::Arity {
                expected: 3,
                actual: 1
            }
        );
    }

    #[test]
    fn decode_oracle_params() {
        let args = GuestArgs::parse(r#"["price", {"pair": "NEO/USD"}]"#).unwrap();
        let call = OracleCall::decode(OracleMethod::SubmitRequest, &args).unwrap();
        match call {
            OracleCall::SubmitRequest { feed_type, params } => {
                assert_eq!(feed_type, "price");
                assert_eq!(params["pair"], "NEO/USD");
            }
            other => panic!("unexpected call: {other:?}"),
        }
    }

    #[test]
    fn interoperability_disabled_grants_nothing() {
        let clients = ServiceClients {
            storage: Some(Arc::new(MemStorage::default())),
            ..Default::default()
        };
        assert!(CapabilitySet::new(&clients, false, true).granted().is_empty());
        assert_eq!(
            CapabilitySet::new(&clients, true, true).granted(),
            vec![ServiceKind::Storage]
        );
    }

    #[tokio::test]
    async fn storage_round_trip_through_invoke() {
        let set = storage_set();
        let put = set.invoke("storage", "Put", r#"["greeting", "hello"]"#).await.unwrap();
        assert_eq!(put, Value::Null);
        let got = set.invoke("storage", "Get", r#"["greeting"]"#).await.unwrap();
        assert_eq!(got, Value::from("hello"));
        let keys = set.invoke("storage", "List", r#"["gr"]"#).await.unwrap();
        assert_eq!(keys, serde_json::json!(["greeting"]));
    }

    #[tokio::test]
    async fn ungranted_service_is_unavailable() {
        let set = storage_set();
        let err = set.invoke("wallet", "ListWallets", "[]").await.unwrap_err();
        assert!(matches!(err, CapabilityError::ServiceUnavailable(ref s) if s == "wallet"));
        let err = set.invoke("filesystem", "Read", "[]").await.unwrap_err();
        assert!(matches!(err, CapabilityError::ServiceUnavailable(_)));
    }

    #[tokio::test]
    async fn unlisted_method_is_rejected() {
        let set = storage_set();
        let err = set.invoke("storage", "Drop", r#"["k"]"#).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "method 'Drop' is not allowed on service 'storage'"
        );
    }

    #[tokio::test]
    async fn service_errors_are_redacted() {
        let set = storage_set();
        let err = set.invoke("storage", "Get", r#"["missing"]"#).await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.starts_with("storage.Get failed: not found"), "got: {msg}");
        assert!(!msg.contains("/var/lib/store"), "path leaked: {msg}");
        assert!(matches!(err, CapabilityError::Service { code: "NOT_FOUND", .. }));
    }

    #[test]
    fn services_js_lists_only_granted_members() {
        let js = storage_set().services_js();
        assert!(js.contains("services.storage"));
        assert!(js.contains("\"Put\", \"Get\", \"Delete\", \"List\""));
        assert!(!js.contains("wallet"));
        assert!(!js.contains("oracle"));
        assert!(js.contains("Object.freeze(services)"));
    }
}
