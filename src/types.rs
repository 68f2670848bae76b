//! Wire message model.
//!
//! Three message kinds travel the stream in either direction, classified by
//! which fields are present rather than by any envelope or version marker:
//!
//! - request: `{"method": ..., "params": [...], "id": n}`
//! - notification: `{"method": ..., "params": [...]}`
//! - response: `{"result": ..., "error": ..., "id": n}`
//!
//! Unknown fields (such as a `jsonrpc` version tag added by other stacks) are
//! ignored on decode.
use serde_json::{Value as JsonValue, json};

use crate::RpcError;

/// A call expecting a correlated [`Response`].
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: u64,
    pub method: String,
    pub params: Vec<JsonValue>,
}

/// A call expecting no reply.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Vec<JsonValue>,
}

/// The answer to a [`Request`], matched to it by `id`.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: u64,
    pub result: JsonValue,
    pub error: Option<ErrorPayload>,
}

impl Response {
    pub fn success(id: u64, result: JsonValue) -> Self {
        Self {
            id,
            result,
            error: None,
        }
    }

    pub fn failure(id: u64, error: ErrorPayload) -> Self {
        Self {
            id,
            result: JsonValue::Null,
            error: Some(error),
        }
    }
}

/// Error carried in a response: an error kind tag plus arbitrary arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorPayload {
    pub kind: String,
    pub args: Vec<JsonValue>,
}

impl ErrorPayload {
    pub fn new(kind: impl Into<String>, args: Vec<JsonValue>) -> Self {
        Self {
            kind: kind.into(),
            args,
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new("MethodNotFound", vec![JsonValue::String(method.to_string())])
    }

    fn into_value(self) -> JsonValue {
        json!({ "type": self.kind, "args": self.args })
    }

    /// Decode the canonical `{"type", "args"}` shape; any other non-null
    /// error value is wrapped verbatim as a generic remote error.
    fn from_value(value: JsonValue) -> Option<Self> {
        if value.is_null() {
            return None;
        }
        if let JsonValue::Object(map) = &value {
            if let (Some(JsonValue::String(kind)), Some(JsonValue::Array(args))) =
                (map.get("type"), map.get("args"))
            {
                return Some(Self::new(kind.clone(), args.clone()));
            }
        }
        Some(Self::new("RemoteError", vec![value]))
    }
}

impl From<ErrorPayload> for RpcError {
    fn from(payload: ErrorPayload) -> Self {
        RpcError::Remote {
            kind: payload.kind,
            args: payload.args,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Notification(Notification),
    Response(Response),
}

impl Message {
    /// Classify a decoded value by field presence.
    ///
    /// A `params` field that is not an array is tolerated: a missing or null
    /// value becomes no arguments, anything else a single argument.
    pub fn from_value(value: JsonValue) -> Result<Self, RpcError> {
        let JsonValue::Object(map) = value else {
            return Err(RpcError::InvalidMessage { value });
        };

        let method = match map.get("method") {
            Some(JsonValue::String(m)) => Some(m.clone()),
            _ => None,
        };
        // a null id reads as no id at all; any other non-integer id is out
        // of contract and must not silently demote a request
        let id = match map.get("id").cloned() {
            None | Some(JsonValue::Null) => None,
            Some(v) => match v.as_u64() {
                Some(id) => Some(id),
                None => {
                    return Err(RpcError::InvalidMessage {
                        value: JsonValue::Object(map),
                    });
                }
            },
        };

        if let Some(method) = method {
            let params = match map.get("params") {
                Some(JsonValue::Array(items)) => items.clone(),
                Some(JsonValue::Null) | None => Vec::new(),
                Some(other) => vec![other.clone()],
            };
            return Ok(match id {
                Some(id) => Message::Request(Request { id, method, params }),
                None => Message::Notification(Notification { method, params }),
            });
        }

        if map.contains_key("result") || map.contains_key("error") {
            if let Some(id) = id {
                let result = map.get("result").cloned().unwrap_or(JsonValue::Null);
                let error = map
                    .get("error")
                    .cloned()
                    .and_then(ErrorPayload::from_value);
                return Ok(Message::Response(Response { id, result, error }));
            }
        }

        Err(RpcError::InvalidMessage {
            value: JsonValue::Object(map),
        })
    }

    /// Produce the canonical wire shape.  Responses always carry all three of
    /// `result`, `error` and `id`, with `error` null on success.
    pub fn into_value(self) -> JsonValue {
        match self {
            Message::Request(r) => json!({
                "method": r.method,
                "params": r.params,
                "id": r.id,
            }),
            Message::Notification(n) => json!({
                "method": n.method,
                "params": n.params,
            }),
            Message::Response(r) => json!({
                "result": r.result,
                "error": r.error.map(ErrorPayload::into_value).unwrap_or(JsonValue::Null),
                "id": r.id,
            }),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::Request(_) => "request",
            Message::Notification(_) => "notification",
            Message::Response(_) => "response",
        }
    }
}
