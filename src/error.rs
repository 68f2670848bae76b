use serde_json::Value as JsonValue;
use thiserror::Error;

pub type Result<T, E = RpcError> = std::result::Result<T, E>;

/// Everything that can go wrong in this crate, from the byte stream up to the
/// RPC layer.
///
/// Parser and writer errors propagate synchronously to their caller.  Errors
/// raised by notification handlers are logged and swallowed (the protocol has
/// no return channel for them), request handler errors become wire-level error
/// responses, and transport errors terminate the connection's read loop.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Malformed JSON.  Fatal to the current `read_value` call only.
    #[error("unexpected character {found:?} at byte {offset}; expected {expected}")]
    Parse {
        found: char,
        expected: &'static str,
        offset: u64,
    },

    /// The stream ended in the middle of a JSON value.  Distinct from a clean
    /// stream boundary, which ends value iteration without an error.
    #[error("end of stream in the middle of a JSON value")]
    UnexpectedEof,

    /// A number lexeme that matched the token grammar but does not denote a
    /// representable number (for example `1e` or an out-of-range exponent).
    #[error("invalid number literal {lexeme:?}")]
    InvalidNumber { lexeme: String },

    /// A value in the native object graph cannot be represented on the wire.
    #[error("cannot encode value as JSON: {reason}")]
    Encode { reason: String },

    #[error("transport I/O error")]
    Io(#[from] std::io::Error),

    /// The remote peer answered a request with an error payload.
    #[error("remote peer reported an error of type {kind:?}")]
    Remote { kind: String, args: Vec<JsonValue> },

    /// A blocking call exceeded its deadline.  The pending entry has been
    /// cleaned up; a late response will be routed to the unsolicited-response
    /// handler.
    #[error("request {method:?} timed out")]
    Timeout { method: String },

    /// The connection was shut down or the peer disconnected.  Also the
    /// resolution of every call still pending when a connection closes.
    #[error("connection closed")]
    ConnectionClosed,

    /// An inbound JSON value that is not a request, notification or response.
    #[error("not a valid JSON-RPC message: {value}")]
    InvalidMessage { value: JsonValue },

    #[error("BUG: {message}")]
    Internal { message: String },
}

impl RpcError {
    pub(crate) fn bug(message: impl Into<String>) -> Self {
        RpcError::Internal {
            message: message.into(),
        }
    }
}
