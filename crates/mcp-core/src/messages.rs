//! JSON message shapes exchanged between clients, the broker, and the EA.
//!
//! Inbound traffic is loosely shaped (the EA may answer with any object), so
//! it is read through [`Envelope`], which only inspects the handful of keys
//! that drive routing. Everything the broker itself emits is strongly typed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::{Map, Value};

use crate::error::{McpError, McpResult};

/// Identity string the MetaTrader EA announces on connect.
pub const UPSTREAM_IDENTITY: &str = "MT5_EA";

pub const MSG_AUTH_OK: &str = "Authentication successful";
pub const MSG_AUTH_FAILED: &str = "Authentication failed";
pub const MSG_NOT_AUTHENTICATED: &str = "Not authenticated";
pub const MSG_UPSTREAM_ABSENT: &str = "MetaTrader EA not connected";
pub const MSG_UPSTREAM_TIMEOUT: &str = "Timeout waiting for response from MetaTrader";
pub const MSG_INVALID_JSON: &str = "Invalid JSON format";
pub const MSG_UNRECOGNIZED: &str = "Unrecognized message";
pub const MSG_LIMIT_REACHED: &str = "Server connection limit reached";

/// Wire field names.
pub mod field {
    pub const IDENTITY: &str = "identity";
    pub const AUTH: &str = "auth";
    pub const COMMAND: &str = "command";
    pub const REQUEST_ID: &str = "requestId";
    pub const RESPONSE_TO_ID: &str = "responseToId";
    pub const PARAMETERS: &str = "parameters";
    pub const STATUS: &str = "status";
}

/// Status replies generated by the broker itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Reply {
    /// Acknowledges an EA identity declaration.
    Connected { server_time: DateTime<Utc> },
    /// Token accepted.
    Authenticated { message: String },
    /// Command accepted into the dispatch queue (not terminal).
    Queued {
        #[serde(rename = "requestId")]
        request_id: String,
        message: String,
    },
    /// Any failure visible to a client.
    Error {
        #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        message: String,
    },
}

impl Reply {
    pub fn connected() -> Self {
        Reply::Connected {
            server_time: Utc::now(),
        }
    }

    pub fn authenticated() -> Self {
        Reply::Authenticated {
            message: MSG_AUTH_OK.to_string(),
        }
    }

    pub fn queued(request_id: &str, command: &str) -> Self {
        Reply::Queued {
            request_id: request_id.to_string(),
            message: format!("Command '{command}' queued for processing"),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Reply::Error {
            request_id: None,
            message: message.into(),
        }
    }

    pub fn error_for(request_id: &str, message: impl Into<String>) -> Self {
        Reply::Error {
            request_id: Some(request_id.to_string()),
            message: message.into(),
        }
    }
}

/// `{"auth": "<token>"}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthRequest {
    pub auth: String,
}

/// A command as submitted by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub command: String,
    #[serde(rename = "requestId")]
    pub request_id: String,
    #[serde(default = "empty_object")]
    pub parameters: Value,
    /// Clients that hold a token repeat it on every command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
}

/// A command as forwarded to the EA.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandForward {
    pub command: String,
    pub parameters: Value,
    #[serde(rename = "requestId")]
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
}

impl CommandForward {
    pub fn new(request_id: &str, command: &str, parameters: Value) -> Self {
        Self {
            command: command.to_string(),
            parameters,
            request_id: request_id.to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// Empty JSON object, the default for missing `parameters`.
pub fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// Read-only view over an inbound JSON object.
#[derive(Debug, Clone)]
pub struct Envelope {
    fields: Map<String, Value>,
}

impl Envelope {
    /// Parse a decoded frame. Only JSON objects are envelopes.
    pub fn parse(raw: &RawValue) -> McpResult<Self> {
        match serde_json::from_str::<Value>(raw.get())? {
            Value::Object(fields) => Ok(Self { fields }),
            other => Err(McpError::InvalidMessage(format!(
                "expected a JSON object, got {}",
                json_kind(&other)
            ))),
        }
    }

    fn str_field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    pub fn identity(&self) -> Option<&str> {
        self.str_field(field::IDENTITY)
    }

    pub fn is_upstream_identity(&self) -> bool {
        self.identity() == Some(UPSTREAM_IDENTITY)
    }

    pub fn auth_token(&self) -> Option<&str> {
        self.str_field(field::AUTH)
    }

    pub fn has_auth(&self) -> bool {
        self.fields.contains_key(field::AUTH)
    }

    pub fn command(&self) -> Option<&str> {
        self.str_field(field::COMMAND)
    }

    pub fn status(&self) -> Option<&str> {
        self.str_field(field::STATUS)
    }

    /// The `requestId` field. Numeric ids are accepted and stringified.
    pub fn request_id(&self) -> Option<String> {
        id_field(&self.fields, field::REQUEST_ID)
    }

    /// Which request an EA reply answers: `responseToId` wins over `requestId`.
    pub fn correlation_id(&self) -> Option<String> {
        id_field(&self.fields, field::RESPONSE_TO_ID).or_else(|| self.request_id())
    }

    /// Command parameters, `{}` when absent or null.
    pub fn parameters(&self) -> Value {
        match self.fields.get(field::PARAMETERS) {
            None | Some(Value::Null) => empty_object(),
            Some(v) => v.clone(),
        }
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.fields)
    }
}

fn id_field(fields: &Map<String, Value>, key: &str) -> Option<String> {
    match fields.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(text: &str) -> McpResult<Envelope> {
        let raw: Box<RawValue> = serde_json::from_str(text).unwrap();
        Envelope::parse(&raw)
    }

    #[test]
    fn queued_reply_shape() {
        let v = serde_json::to_value(Reply::queued("r1", "get_price")).unwrap();
        assert_eq!(v["status"], "queued");
        assert_eq!(v["requestId"], "r1");
        assert_eq!(v["message"], "Command 'get_price' queued for processing");
    }

    #[test]
    fn error_reply_omits_missing_request_id() {
        let v = serde_json::to_value(Reply::error(MSG_INVALID_JSON)).unwrap();
        assert_eq!(v, json!({"status": "error", "message": "Invalid JSON format"}));

        let v = serde_json::to_value(Reply::error_for("r9", MSG_UPSTREAM_ABSENT)).unwrap();
        assert_eq!(
            v,
            json!({"status": "error", "requestId": "r9", "message": "MetaTrader EA not connected"})
        );
    }

    #[test]
    fn connected_reply_has_iso_timestamp() {
        let v = serde_json::to_value(Reply::connected()).unwrap();
        assert_eq!(v["status"], "connected");
        let ts = v["server_time"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(ts).is_ok());
    }

    #[test]
    fn classify_identity_and_auth() {
        let env = envelope(r#"{"identity":"MT5_EA"}"#).unwrap();
        assert!(env.is_upstream_identity());

        let env = envelope(r#"{"identity":"someone_else"}"#).unwrap();
        assert!(!env.is_upstream_identity());

        let env = envelope(r#"{"auth":"tok"}"#).unwrap();
        assert_eq!(env.auth_token(), Some("tok"));
        assert!(env.command().is_none());
    }

    #[test]
    fn command_fields() {
        let env = envelope(
            r#"{"command":"get_price","requestId":"r1","parameters":{"symbol":"EURUSD"}}"#,
        )
        .unwrap();
        assert_eq!(env.command(), Some("get_price"));
        assert_eq!(env.request_id().as_deref(), Some("r1"));
        assert_eq!(env.parameters(), json!({"symbol": "EURUSD"}));

        let env = envelope(r#"{"command":"get_orders","requestId":42}"#).unwrap();
        assert_eq!(env.request_id().as_deref(), Some("42"));
        assert_eq!(env.parameters(), json!({}));
    }

    #[test]
    fn correlation_prefers_response_to_id() {
        let env = envelope(r#"{"requestId":"a","responseToId":"b"}"#).unwrap();
        assert_eq!(env.correlation_id().as_deref(), Some("b"));

        let env = envelope(r#"{"requestId":"a","status":"ok"}"#).unwrap();
        assert_eq!(env.correlation_id().as_deref(), Some("a"));

        let env = envelope(r#"{"status":"ok"}"#).unwrap();
        assert!(env.correlation_id().is_none());
    }

    #[test]
    fn non_objects_are_rejected() {
        assert!(matches!(envelope("[1,2]"), Err(McpError::InvalidMessage(_))));
        assert!(matches!(envelope("\"hi\""), Err(McpError::InvalidMessage(_))));
    }

    #[test]
    fn forward_envelope_shape() {
        let fwd = CommandForward::new("r1", "get_price", json!({"symbol": "EURUSD"}));
        let v = serde_json::to_value(&fwd).unwrap();
        assert_eq!(v["command"], "get_price");
        assert_eq!(v["requestId"], "r1");
        assert_eq!(v["parameters"]["symbol"], "EURUSD");
        assert!(v["timestamp"].is_string());
    }
}
