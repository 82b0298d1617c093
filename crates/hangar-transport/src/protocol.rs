//! Shared JSON-RPC 2.0 envelope types and the Transport Client's error
//! taxonomy (spec §4.A).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Error kinds the Transport Client itself can produce. Everything else
/// (`tool_error`, `not_found`, `validation`, ...) is classified one layer
/// up, by the Provider Supervisor, from a well-formed [`CallOutcome`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("call timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("call cancelled")]
    Cancelled,
}

impl TransportError {
    pub fn kind(&self) -> &'static str {
        match self {
            TransportError::Timeout(_) => "timeout",
            TransportError::Transport(_) => "transport",
            TransportError::Protocol(_) => "protocol",
            TransportError::Cancelled => "cancelled",
        }
    }
}

/// A JSON-RPC 2.0 error object, carried unchanged so the Provider Supervisor
/// can surface the upstream provider's own message as `tool_error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// The two shapes a well-formed JSON-RPC response can take. Both are
/// "successful" from the Transport Client's point of view: the channel
/// round-tripped a correlated response. Whether `Error` represents a
/// provider-domain failure (`tool_error`) is for the caller to decide.
#[derive(Debug, Clone)]
pub enum CallOutcome {
    Result(Value),
    Error(JsonRpcErrorObject),
}

#[derive(Debug, Serialize)]
pub(crate) struct JsonRpcRequest<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    pub params: Value,
}

impl<'a> JsonRpcRequest<'a> {
    pub fn new(id: u64, method: &'a str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct JsonRpcResponse {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcErrorObject>,
}

impl JsonRpcResponse {
    /// Extract the correlation id as `u64`; our own clients always send
    /// numeric ids, so anything else is itself a protocol violation.
    pub fn numeric_id(&self) -> Option<u64> {
        self.id.as_ref().and_then(Value::as_u64)
    }

    pub fn into_outcome(self) -> Result<CallOutcome, TransportError> {
        match (self.result, self.error) {
            (Some(value), None) => Ok(CallOutcome::Result(value)),
            (None, Some(err)) => Ok(CallOutcome::Error(err)),
            (None, None) => Err(TransportError::Protocol(
                "response carries neither `result` nor `error`".to_string(),
            )),
            (Some(_), Some(_)) => Err(TransportError::Protocol(
                "response carries both `result` and `error`".to_string(),
            )),
        }
    }
}
