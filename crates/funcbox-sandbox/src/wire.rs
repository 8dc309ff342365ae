//! JSON wire adapter around [`Sandbox`].
//!
//! Decodes a camelCase [`FunctionInput`], runs it and encodes the
//! [`FunctionOutput`]. Durations travel as integer nanoseconds. Service
//! clients are never part of the wire form; attach them with
//! [`execute_json_with_services`].

use crate::error::SandboxError;
use crate::executor::Sandbox;
use crate::function::{FunctionContext, FunctionInput, FunctionOutput, ServiceClients};

/// Function id used when the wire input carries no context.
pub const UNKNOWN_FUNCTION_ID: &str = "unknown";

/// Decode a wire input, filling in a default context.
pub fn decode_input(json: &str) -> Result<FunctionInput, SandboxError> {
    let mut input: FunctionInput = serde_json::from_str(json)?;
    if input.context.is_none() {
        input.context = Some(FunctionContext::new(UNKNOWN_FUNCTION_ID));
    }
    Ok(input)
}

/// Encode an output to its wire form.
pub fn encode_output(output: &FunctionOutput) -> Result<String, SandboxError> {
    Ok(serde_json::to_string(output)?)
}

/// Decode `json`, execute it and encode the result.
pub async fn execute_json(sandbox: &mut Sandbox, json: &str) -> Result<String, SandboxError> {
    execute_json_with_services(sandbox, json, ServiceClients::default()).await
}

/// Like [`execute_json`], granting `services` to the call.
pub async fn execute_json_with_services(
    sandbox: &mut Sandbox,
    json: &str,
    services: ServiceClients,
) -> Result<String, SandboxError> {
    let mut input = decode_input(json)?;
    if let Some(ctx) = input.context.as_mut() {
        ctx.services = services;
    }
    let output = sandbox.execute(input).await?;
    encode_output(&output)
}
