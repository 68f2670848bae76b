//! The seam between the protocol machinery and application code.
//!
//! A connection owns one [`Handler`] and invokes it for every inbound
//! message.  Handlers receive the connection's [`ConnectionHandle`] so they
//! can call back into the peer that is calling them, which is what makes the
//! protocol symmetric in practice.
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tracing::warn;

use crate::connection::ConnectionHandle;
use crate::types::{ErrorPayload, Response};

/// Application dispatch interface.
///
/// Every method has a default, so a handler only implements the message
/// kinds it serves.  Each invocation runs on its own task; slow handlers do
/// not stall the connection's message loop.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Serve an inbound request.  The return value becomes the wire
    /// response: `Ok` fills `result`, `Err` fills `error`.
    async fn handle_request(
        &self,
        method: &str,
        params: Vec<JsonValue>,
        conn: ConnectionHandle,
    ) -> Result<JsonValue, ErrorPayload> {
        let _ = (params, conn);
        Err(ErrorPayload::method_not_found(method))
    }

    /// Serve an inbound notification.  There is no return channel; an error
    /// here is logged by the connection and otherwise dropped.
    async fn handle_notification(
        &self,
        method: &str,
        params: Vec<JsonValue>,
        conn: ConnectionHandle,
    ) -> Result<(), ErrorPayload> {
        let _ = (method, params, conn);
        Ok(())
    }

    /// Serve a response that matches no pending call, such as the answer to
    /// a fire-and-forget request or one that arrived after its timeout.
    async fn handle_response(&self, response: Response, conn: ConnectionHandle) {
        let _ = conn;
        warn!(id = response.id, "dropping response that matches no pending call");
    }
}

/// Handler that serves nothing.  Useful for pure-client connections.
pub struct NullHandler;

#[async_trait]
impl Handler for NullHandler {}
