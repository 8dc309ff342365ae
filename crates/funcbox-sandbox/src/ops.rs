//! deno_core op definitions backing the guest bindings.
//!
//! The `#[op2]` macro generates additional public items (v8 function pointers,
//! metadata structs) that cannot carry doc comments, so `missing_docs` is
//! relaxed for this module.
#![allow(missing_docs)]

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Instant;

use deno_core::op2;
use deno_core::OpState;
use deno_error::JsErrorBox;

use crate::audit::HostCallAudit;
use crate::capabilities::{CapabilityError, CapabilitySet};
use crate::executor::GuestLogSink;
use crate::http::{guest_error_message, HttpCapability, HttpRequest, NetworkError};
use crate::redact::redact_known_values;

/// Log lines emitted by the guest, in order.
#[derive(Debug, Default)]
pub struct GuestLogs(pub Vec<String>);

/// Where guest log lines are forwarded besides the output.
pub struct LogSink(pub GuestLogSink);

/// JSON envelope written by the invoker: `{"ok": …}` or `{"error": "…"}`.
pub struct ExecutionResult(pub String);

/// Secrets readable through `secrets.get`.
#[derive(Default)]
pub struct Secrets(pub HashMap<String, String>);

/// Host calls made so far, for the audit record.
#[derive(Debug, Default)]
pub struct HostCalls(pub Vec<HostCallAudit>);

/// Format one guest log line. `log` is written verbatim, other levels get
/// an upper-case prefix.
pub fn format_log_line(level: &str, msg: &str) -> String {
    match level {
        "info" => format!("INFO: {msg}"),
        "warn" => format!("WARN: {msg}"),
        "error" => format!("ERROR: {msg}"),
        "debug" => format!("DEBUG: {msg}"),
        _ => msg.to_string(),
    }
}

/// Append a guest log line.
#[op2(fast)]
pub fn op_funcbox_log(state: &mut OpState, #[string] level: &str, #[string] msg: &str) {
    if let Some(LogSink(GuestLogSink::Tracing)) = state.try_borrow::<LogSink>() {
        match level {
            "error" => tracing::error!(target: "funcbox::guest", "{}", msg),
            "warn" => tracing::warn!(target: "funcbox::guest", "{}", msg),
            "debug" => tracing::debug!(target: "funcbox::guest", "{}", msg),
            _ => tracing::info!(target: "funcbox::guest", "{}", msg),
        }
    }
    let line = format_log_line(level, msg);
    match state.try_borrow_mut::<GuestLogs>() {
        Some(logs) => logs.0.push(line),
        None => state.put(GuestLogs(vec![line])),
    }
}

/// Store the execution result envelope.
#[op2(fast)]
pub fn op_funcbox_set_result(state: &mut OpState, #[string] json: &str) {
    state.put(ExecutionResult(json.to_string()));
}

/// Look up a secret. Returns JSON: the value as a string, or `null`.
#[op2]
#[string]
pub fn op_funcbox_secret(state: &mut OpState, #[string] name: String) -> Result<String, JsErrorBox> {
    if name.is_empty() {
        return Err(JsErrorBox::type_error("secret name is required"));
    }
    let value = state
        .try_borrow::<Secrets>()
        .and_then(|s| s.0.get(&name).cloned());
    serde_json::to_string(&value)
        .map_err(|e| JsErrorBox::generic(format!("secret serialization failed: {e}")))
}

fn record_host_call(op_state: &Rc<RefCell<OpState>>, audit: HostCallAudit) {
    let mut st = op_state.borrow_mut();
    match st.try_borrow_mut::<HostCalls>() {
        Some(calls) => calls.0.push(audit),
        None => st.put(HostCalls(vec![audit])),
    }
}

fn scrub(op_state: &Rc<RefCell<OpState>>, msg: &str) -> String {
    let st = op_state.borrow();
    match st.try_borrow::<Secrets>() {
        Some(secrets) => redact_known_values(msg, secrets.0.values().map(String::as_str)),
        None => msg.to_string(),
    }
}

/// Call an allow-listed service method through the execution's [`CapabilitySet`].
#[op2(async)]
#[string]
pub async fn op_funcbox_call_service(
    op_state: Rc<RefCell<OpState>>,
    #[string] service: String,
    #[string] method: String,
    #[string] args_json: String,
) -> Result<String, JsErrorBox> {
    tracing::debug!(
        service = %service,
        method = %method,
        args_len = args_json.len(),
        "service call dispatched"
    );

    let capabilities = {
        let st = op_state.borrow();
        st.try_borrow::<CapabilitySet>().cloned()
    }
    .ok_or_else(|| JsErrorBox::generic(format!("service '{service}' is not available")))?;

    let start = Instant::now();
    let result = capabilities.invoke(&service, &method, &args_json).await;
    record_host_call(
        &op_state,
        HostCallAudit {
            capability: service.clone(),
            operation: method.clone(),
            duration_ms: start.elapsed().as_millis() as u64,
            success: result.is_ok(),
        },
    );

    match result {
        Ok(value) => serde_json::to_string(&value)
            .map_err(|e| JsErrorBox::generic(format!("result serialization failed: {e}"))),
        Err(CapabilityError::Conversion(e)) => Err(JsErrorBox::type_error(format!(
            "{service}.{method}: {e}"
        ))),
        Err(e) => Err(JsErrorBox::generic(scrub(&op_state, &e.to_string()))),
    }
}

/// Perform an outbound HTTP request. Fails closed when no [`HttpCapability`]
/// was placed in the op state.
#[op2(async)]
#[string]
pub async fn op_funcbox_http_request(
    op_state: Rc<RefCell<OpState>>,
    #[string] options_json: String,
) -> Result<String, JsErrorBox> {
    let http = {
        let st = op_state.borrow();
        st.try_borrow::<HttpCapability>().cloned()
    }
    .ok_or_else(|| JsErrorBox::generic(guest_error_message(&NetworkError::Disabled.to_string())))?;

    let options: serde_json::Value = serde_json::from_str(&options_json)
        .map_err(|e| JsErrorBox::type_error(guest_error_message(&format!("invalid options: {e}"))))?;
    let request = HttpRequest::from_guest(&options)
        .map_err(|e| JsErrorBox::type_error(guest_error_message(&e.to_string())))?;

    tracing::debug!(method = %request.method, "http request dispatched");
    let method = request.method.clone();
    let start = Instant::now();
    let result = http.request(request).await;
    record_host_call(
        &op_state,
        HostCallAudit {
            capability: "http".into(),
            operation: method,
            duration_ms: start.elapsed().as_millis() as u64,
            success: result.is_ok(),
        },
    );

    let response = result.map_err(|e| {
        let msg = crate::redact::redact_error_message(&e.to_string());
        JsErrorBox::generic(guest_error_message(&scrub(&op_state, &msg)))
    })?;
    serde_json::to_string(&response)
        .map_err(|e| JsErrorBox::generic(format!("response serialization failed: {e}")))
}

deno_core::extension!(
    funcbox_ext,
    ops = [
        op_funcbox_log,
        op_funcbox_set_result,
        op_funcbox_secret,
        op_funcbox_call_service,
        op_funcbox_http_request
    ],
);
