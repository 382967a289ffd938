use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

/// Standard "method not found" code, used when a server calls back into us
/// and no request handler is registered.
pub const METHOD_NOT_FOUND: i32 = -32601;

/// Unified JSON-RPC 2.0 envelope.
///
/// Inbound traffic from a tool server can be a response, a notification, or
/// a server-initiated request, and we only learn which after parsing, so one
/// struct covers all shapes and `kind()` classifies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcMessage {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// `method` + `id`: expects a response.
    Request,
    /// `method` without `id`: no response expected.
    Notification,
    /// `id` + exactly one of `result`/`error`.
    Response,
    /// Anything else (e.g. a response carrying both result and error).
    Invalid,
}

impl JsonRpcMessage {
    pub fn request(id: u64, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(Value::from(id)),
            method: Some(method.to_string()),
            params,
            result: None,
            error: None,
        }
    }

    pub fn notification(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: Some(method.to_string()),
            params,
            result: None,
            error: None,
        }
    }

    pub fn response(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: None,
            params: None,
            result: Some(result),
            error: None,
        }
    }

    pub fn error_response(id: Option<Value>, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: None,
            params: None,
            result: None,
            error: Some(error),
        }
    }

    pub fn kind(&self) -> MessageKind {
        match (
            &self.method,
            &self.id,
            self.result.is_some(),
            self.error.is_some(),
        ) {
            (Some(_), Some(_), false, false) => MessageKind::Request,
            (Some(_), None, false, false) => MessageKind::Notification,
            (None, Some(_), true, false) => MessageKind::Response,
            (None, Some(_), false, true) => MessageKind::Response,
            _ => MessageKind::Invalid,
        }
    }

    /// The numeric request id, if this message carries one we issued.
    /// Servers echo our u64 ids back as JSON numbers.
    pub fn numeric_id(&self) -> Option<u64> {
        self.id.as_ref().and_then(Value::as_u64)
    }
}
