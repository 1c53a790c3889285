//! JSON-RPC 2.0 wire types.
//!
//! The relay cares about exactly three shapes: requests carry both `id` and
//! `method`, responses carry `id` without `method`, notifications carry
//! `method` without `id`. Classification keys off field presence alone --
//! the `jsonrpc` version string is relayed but never enforced, so slightly
//! nonconforming peers still flow through the proxy.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error code returned when policy denies a request.
pub const POLICY_VIOLATION_CODE: i32 = -32000;
/// Error code returned when the verdict defers to operator confirmation.
pub const CONFIRMATION_REQUIRED_CODE: i32 = -32001;
/// Error code returned when the downstream does not reply in time.
pub const REQUEST_TIMEOUT_CODE: i32 = -32002;
/// Standard JSON-RPC internal error, used for disconnects and store failures.
pub const INTERNAL_ERROR_CODE: i32 = -32603;

/// Correlation id of a request or response.
///
/// JSON-RPC permits integers, strings, and `null` (the last mostly in error
/// replies to unparseable requests). The interceptor keys its pending-reply
/// table on this value, hence `Hash` + `Eq`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Int(i64),
    Text(String),
    Null,
}

/// A request: expects a reply correlated by `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// A reply to an earlier request. Carries `result` or `error`, never
/// meaningfully both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: RequestId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Build an error reply for `id`. The sentinel only ever synthesizes
    /// error replies; success results always originate downstream.
    pub fn error_reply(
        id: RequestId,
        code: i32,
        message: impl Into<String>,
        data: Option<Value>,
    ) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(JsonRpcError { code, message: message.into(), data }),
        }
    }
}

/// The error member of a failed response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A fire-and-forget message: no `id`, no reply expected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// Any message the relay can see on either side of the wire.
#[derive(Debug, Clone)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Response(JsonRpcResponse),
    Notification(JsonRpcNotification),
}

impl JsonRpcMessage {
    /// The correlation id, when this message carries one.
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            JsonRpcMessage::Request(m) => Some(&m.id),
            JsonRpcMessage::Response(m) => Some(&m.id),
            JsonRpcMessage::Notification(_) => None,
        }
    }
}

/// Which of the three wire shapes a JSON object is, by field presence.
/// `id: null` counts as present -- that is how absent and null ids differ.
fn classify(fields: &serde_json::Map<String, Value>) -> Option<Shape> {
    match (fields.contains_key("method"), fields.contains_key("id")) {
        (true, true) => Some(Shape::Request),
        (false, true) => Some(Shape::Response),
        (true, false) => Some(Shape::Notification),
        (false, false) => None,
    }
}

enum Shape {
    Request,
    Response,
    Notification,
}

impl Serialize for JsonRpcMessage {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            JsonRpcMessage::Request(m) => m.serialize(serializer),
            JsonRpcMessage::Response(m) => m.serialize(serializer),
            JsonRpcMessage::Notification(m) => m.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for JsonRpcMessage {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error;

        let value = Value::deserialize(deserializer)?;
        let shape = value
            .as_object()
            .and_then(classify)
            .ok_or_else(|| D::Error::custom("not a JSON-RPC request, response, or notification"))?;

        match shape {
            Shape::Request => serde_json::from_value(value)
                .map(JsonRpcMessage::Request)
                .map_err(D::Error::custom),
            Shape::Response => serde_json::from_value(value)
                .map(JsonRpcMessage::Response)
                .map_err(D::Error::custom),
            Shape::Notification => serde_json::from_value(value)
                .map(JsonRpcMessage::Notification)
                .map_err(D::Error::custom),
        }
    }
}
