//! JSON-RPC 2.0 message model
//!
//! Shared between the browser-facing WebSocket dialect and the agent-facing
//! pipe protocol. Inbound frames are parsed loosely so that requests,
//! notifications, and replies can be told apart before dispatch.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Malformed JSON
pub const PARSE_ERROR: i64 = -32700;
/// Structurally invalid JSON-RPC message
pub const INVALID_REQUEST: i64 = -32600;
/// Unknown method
pub const METHOD_NOT_FOUND: i64 = -32601;
/// Missing or invalid parameters
pub const INVALID_PARAMS: i64 = -32602;
/// Internal failure
pub const INTERNAL_ERROR: i64 = -32603;

// =============================================================================
// Request ids
// =============================================================================

/// A JSON-RPC request id, preserving the peer's original number-or-string
/// type so it round-trips exactly on the reply path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Num(i64),
    Str(String),
}

impl RequestId {
    /// Parse an id out of a raw JSON value. Returns `None` for null,
    /// floats, and anything else JSON-RPC does not allow as an id.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(RequestId::Num),
            Value::String(s) => Some(RequestId::Str(s.clone())),
            _ => None,
        }
    }

    /// If this id is a numeric-looking string, the numeric form of it.
    ///
    /// Used on the permission reply path: a browser may echo the agent's
    /// numeric id back as `"42"`, and the agent must see `42` again.
    pub fn numeric_form(&self) -> Option<RequestId> {
        match self {
            RequestId::Num(_) => None,
            RequestId::Str(s) => s.parse::<i64>().ok().map(RequestId::Num),
        }
    }

    pub fn as_num(&self) -> Option<i64> {
        match self {
            RequestId::Num(n) => Some(*n),
            RequestId::Str(_) => None,
        }
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::Num(n) => write!(f, "{}", n),
            RequestId::Str(s) => write!(f, "{}", s),
        }
    }
}

// =============================================================================
// Inbound frames
// =============================================================================

/// A loosely-parsed inbound JSON-RPC frame.
///
/// A frame with a `method` is a request (with `id`) or a notification
/// (without). A frame with an `id` and a `result` or `error` but no `method`
/// is a reply.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcFrame {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
}

impl RpcFrame {
    /// The frame's id as a [`RequestId`], if it has a usable one.
    pub fn request_id(&self) -> Option<RequestId> {
        self.id.as_ref().and_then(RequestId::from_value)
    }

    /// True when this frame is a reply to an earlier request.
    pub fn is_reply(&self) -> bool {
        self.method.is_none() && self.id.is_some() && (self.result.is_some() || self.error.is_some())
    }
}

// =============================================================================
// Outbound builders
// =============================================================================

/// Build a request frame.
pub fn request(id: &RequestId, method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params,
    })
}

/// Build a notification frame (no id, no reply expected).
pub fn notification(method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
    })
}

/// Build a success response, echoing the caller's id verbatim.
pub fn response(id: &Value, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result,
    })
}

/// Build an error response. `id` is `Value::Null` when the request id
/// could not be recovered (e.g. a parse error).
pub fn error_response(id: &Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message },
    })
}
