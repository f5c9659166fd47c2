//! JSON-RPC 2.0 message types spoken on both sides of the bridge.
//!
//! - **Inbound HTTP**: `RpcRequest` bodies posted to `/mcp`
//! - **Child stdin**: `RpcRequest` (requests and notifications), replies to child pings
//! - **Child stdout**: arbitrary JSON, classified with [`InboundMessage::classify`]

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INTERNAL_ERROR: i64 = -32603;
/// Server-defined code returned when the bearer token check fails.
pub const UNAUTHORIZED: i64 = -32001;

/// JSON-RPC request identifier (number or string).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{}", n),
            Self::String(s) => write!(f, "{:?}", s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

/// Identity of one child-process lifetime.
///
/// A fresh id is minted on every spawn so that exit notifications and
/// handshake completions from a replaced child can be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChildId(uuid::Uuid);

impl ChildId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ChildId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ChildId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A JSON-RPC request or notification (notifications carry no id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
}

impl RpcRequest {
    pub fn new(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
            id: Some(id),
        }
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
            id: None,
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    pub fn has_valid_version(&self) -> bool {
        self.jsonrpc == JSONRPC_VERSION
    }
}

/// Build a successful JSON-RPC response.
pub fn result_response(id: Option<&RequestId>, result: Value) -> Value {
    serde_json::json!({
        "jsonrpc": JSONRPC_VERSION,
        "result": result,
        "id": id,
    })
}

/// Build a JSON-RPC error response.
pub fn error_response(id: Option<&RequestId>, code: i64, message: impl Into<String>) -> Value {
    serde_json::json!({
        "jsonrpc": JSONRPC_VERSION,
        "error": {
            "code": code,
            "message": message.into(),
        },
        "id": id,
    })
}

/// A message read from the child's stdout, sorted by shape.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Reply to one of our requests (carries `result` or `error`).
    Response { id: RequestId, message: Value },
    /// Server-initiated request (e.g. `ping`) expecting a reply.
    Request {
        id: RequestId,
        method: String,
        params: Option<Value>,
    },
    /// Server-initiated notification (e.g. `notifications/message`).
    Notification {
        method: String,
        params: Option<Value>,
    },
    /// Valid JSON that is not a JSON-RPC message we understand.
    Invalid(Value),
}

impl InboundMessage {
    pub fn classify(message: Value) -> Self {
        let method = message
            .get("method")
            .and_then(Value::as_str)
            .map(str::to_owned);
        let id = message
            .get("id")
            .cloned()
            .and_then(|v| serde_json::from_value::<RequestId>(v).ok());

        match (method, id) {
            (Some(method), Some(id)) => Self::Request {
                id,
                method,
                params: message.get("params").cloned(),
            },
            (Some(method), None) => Self::Notification {
                method,
                params: message.get("params").cloned(),
            },
            (None, Some(id)) if message.get("result").is_some() || message.get("error").is_some() => {
                Self::Response { id, message }
            }
            _ => Self::Invalid(message),
        }
    }
}
