//! Frames exchanged over the broker and over the websocket endpoint.
//!
//! RPC payloads travel as JSON in [`Delivery`](crate::broker::Delivery)
//! bodies. The websocket protocol uses tagged JSON text frames:
//!
//! ```text
//! server -> client  {"type":"event","event":"connected","data":{"socket_id":"..."}}
//! client -> server  {"method":"uppercase","data":{"arg":"foo"},"correlation_id":"..."}
//! server -> client  {"type":"result","success":true,"data":"FOO","correlation_id":"..."}
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Context data carried from caller to callee.
pub type ContextData = BTreeMap<String, String>;

/// Error raised by a remote method, as seen by the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{exc_type}: {message}")]
pub struct RemoteError {
    /// Short classification of the failure, e.g. `MethodNotFound`.
    #[serde(rename = "type")]
    pub exc_type: String,
    /// Human readable message.
    pub message: String,
}

impl RemoteError {
    /// Create a remote error.
    pub fn new(exc_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            exc_type: exc_type.into(),
            message: message.into(),
        }
    }

    /// The callee has no such method.
    #[must_use]
    pub fn method_not_found(service: &str, method: &str) -> Self {
        Self::new("MethodNotFound", format!("{service}.{method}"))
    }

    /// The request payload could not be decoded.
    #[must_use]
    pub fn malformed_request(message: impl Into<String>) -> Self {
        Self::new("MalformedRequest", message)
    }
}

impl From<crate::error::RpcError> for RemoteError {
    fn from(err: crate::error::RpcError) -> Self {
        match err {
            crate::error::RpcError::Remote(remote) => remote,
            crate::error::RpcError::UnknownService(service) => {
                Self::new("UnknownService", service)
            }
            other => Self::new("RpcError", other.to_string()),
        }
    }
}

/// Body of an RPC request published to `rpc-<service>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    #[serde(default)]
    pub args: Value,
    /// Call ids of the calling workers, outermost first.
    #[serde(default)]
    pub call_id_stack: Vec<String>,
    #[serde(default)]
    pub context: ContextData,
}

/// Body of an RPC reply published to the caller's reply queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcReply {
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RemoteError>,
}

impl RpcReply {
    /// Build a reply from a worker outcome.
    #[must_use]
    pub fn from_result(result: Result<Value, RemoteError>) -> Self {
        match result {
            Ok(value) => Self {
                result: Some(value),
                error: None,
            },
            Err(error) => Self {
                result: None,
                error: Some(error),
            },
        }
    }

    /// Turn the reply back into the worker outcome.
    pub fn into_result(self) -> Result<Value, RemoteError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// A websocket request frame sent by a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientFrame {
    pub method: String,
    #[serde(default)]
    pub data: Value,
    pub correlation_id: String,
}

/// A websocket frame sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Unsolicited event, including the initial `connected` event.
    Event {
        event: String,
        #[serde(default)]
        data: Value,
    },
    /// Outcome of a client request.
    Result {
        success: bool,
        #[serde(default)]
        data: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<RemoteError>,
        #[serde(default)]
        correlation_id: Option<String>,
    },
}

/// Event name announcing the server-issued socket id.
pub const CONNECTED_EVENT: &str = "connected";

impl ServerFrame {
    /// The `connected` event for a new socket.
    #[must_use]
    pub fn connected(socket_id: &str) -> Self {
        Self::Event {
            event: CONNECTED_EVENT.to_string(),
            data: serde_json::json!({ "socket_id": socket_id }),
        }
    }

    /// A result frame for the given request.
    #[must_use]
    pub fn result(correlation_id: Option<String>, outcome: Result<Value, RemoteError>) -> Self {
        match outcome {
            Ok(data) => Self::Result {
                success: true,
                data,
                error: None,
                correlation_id,
            },
            Err(error) => Self::Result {
                success: false,
                data: Value::Null,
                error: Some(error),
                correlation_id,
            },
        }
    }

    /// Correlation id of a result frame.
    #[must_use]
    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            Self::Result { correlation_id, .. } => correlation_id.as_deref(),
            Self::Event { .. } => None,
        }
    }

    /// Socket id announced by a `connected` event.
    #[must_use]
    pub fn connected_socket_id(&self) -> Option<&str> {
        match self {
            Self::Event { event, data } if event == CONNECTED_EVENT => {
                data.get("socket_id").and_then(Value::as_str)
            }
            _ => None,
        }
    }

    /// Turn a result frame into the call outcome; events are not outcomes.
    pub fn into_outcome(self) -> Option<Result<Value, RemoteError>> {
        match self {
            Self::Result {
                success: true, data, ..
            } => Some(Ok(data)),
            Self::Result { error, .. } => Some(Err(error.unwrap_or_else(|| {
                RemoteError::new("RemoteError", "call failed without error details")
            }))),
            Self::Event { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_server_result_frame_shape() {
        let frame = ServerFrame::result(Some("c-1".to_string()), Ok(json!("FOO")));
        let encoded = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            encoded,
            json!({"type": "result", "success": true, "data": "FOO", "correlation_id": "c-1"})
        );
    }

    #[test]
    fn test_server_error_frame_carries_type() {
        let frame = ServerFrame::result(
            Some("c-2".to_string()),
            Err(RemoteError::method_not_found("ws", "nope")),
        );
        let encoded = serde_json::to_value(&frame).unwrap();
        assert_eq!(encoded["success"], json!(false));
        assert_eq!(encoded["error"]["type"], json!("MethodNotFound"));
        assert_eq!(encoded["error"]["message"], json!("ws.nope"));
    }

    #[test]
    fn test_connected_event_exposes_socket_id() {
        let raw = r#"{"type":"event","event":"connected","data":{"socket_id":"abc"}}"#;
        let frame: ServerFrame = serde_json::from_str(raw).unwrap();
        assert_eq!(frame.connected_socket_id(), Some("abc"));
        assert_eq!(frame.correlation_id(), None);
    }

    #[test]
    fn test_reply_without_result_is_null() {
        let reply = RpcReply {
            result: None,
            error: None,
        };
        assert_eq!(reply.into_result(), Ok(Value::Null));
    }

    #[test]
    fn test_request_defaults_missing_fields() {
        let request: RpcRequest = serde_json::from_str(r#"{"method":"m"}"#).unwrap();
        assert_eq!(request.args, Value::Null);
        assert!(request.call_id_stack.is_empty());
        assert!(request.context.is_empty());
    }
}
