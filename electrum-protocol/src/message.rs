//! Inbound message classification.

use crate::error::ProtocolError;
use serde_json::Value;
use std::fmt;

/// Error object carried by a server response.
///
/// Electrum servers normally send `{"code": <int>, "message": <string>}`,
/// but some send a bare string; both are accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcError {
    pub code: Option<i64>,
    pub message: String,
    pub data: Option<Value>,
}

impl RpcError {
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(mut obj) => {
                let code = obj.get("code").and_then(Value::as_i64);
                let data = obj.remove("data");
                let message = match obj.remove("message") {
                    Some(Value::String(s)) => s,
                    Some(other) => other.to_string(),
                    None => Value::Object(obj).to_string(),
                };
                Self {
                    code,
                    message,
                    data,
                }
            }
            Value::String(message) => Self {
                code: None,
                message,
                data: None,
            },
            other => Self {
                code: None,
                message: other.to_string(),
                data: None,
            },
        }
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} (code {})", self.message, code),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for RpcError {}

/// A response correlated by id.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: u64,
    /// `Err` when the message carried a non-null `error`; otherwise the
    /// `result` field, or the whole message when `result` is absent.
    pub outcome: Result<Value, RpcError>,
}

impl Response {
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let mut obj = match value {
            Value::Object(obj) => obj,
            other => {
                return Err(ProtocolError::Unclassifiable(format!(
                    "response is a {}",
                    value_kind(&other)
                )))
            }
        };
        let id = parse_id(obj.get("id").unwrap_or(&Value::Null))?;

        let outcome = match obj.remove("error") {
            Some(error) if !error.is_null() => Err(RpcError::from_value(error)),
            _ => match obj.remove("result") {
                Some(result) => Ok(result),
                None => Ok(Value::Object(obj)),
            },
        };

        Ok(Self { id, outcome })
    }
}

/// A classified inbound document.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Server-pushed message with no id.
    Notification { method: String, params: Value },
    /// Reply to a single request.
    Response(Response),
    /// Top-level array replying to a batch. Elements are kept raw.
    BatchResponse(Vec<Value>),
}

impl InboundMessage {
    /// Classifies a parsed document.
    ///
    /// Arrays are batch responses. Objects with a non-null `id` are
    /// responses; objects without one but with a string `method` are
    /// notifications.
    pub fn classify(value: Value) -> Result<Self, ProtocolError> {
        match value {
            Value::Array(elements) => Ok(InboundMessage::BatchResponse(elements)),
            Value::Object(mut obj) => {
                let has_id = obj.get("id").is_some_and(|id| !id.is_null());
                if !has_id {
                    if let Some(Value::String(method)) = obj.remove("method") {
                        let params = obj.remove("params").unwrap_or(Value::Null);
                        return Ok(InboundMessage::Notification { method, params });
                    }
                    if !obj.contains_key("id") {
                        return Err(ProtocolError::Unclassifiable(
                            "object has neither id nor method".to_string(),
                        ));
                    }
                }
                Ok(InboundMessage::Response(Response::from_value(
                    Value::Object(obj),
                )?))
            }
            other => Err(ProtocolError::Unclassifiable(format!(
                "top-level {}",
                value_kind(&other)
            ))),
        }
    }
}

/// Parses a response id. Integers and decimal strings are accepted.
pub fn parse_id(value: &Value) -> Result<u64, ProtocolError> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
    .ok_or_else(|| ProtocolError::InvalidId(value.clone()))
}

/// Returns the id of a batch element, if it has a usable one.
pub fn element_id(element: &Value) -> Option<u64> {
    element.get("id").and_then(|id| parse_id(id).ok())
}

pub(crate) fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
