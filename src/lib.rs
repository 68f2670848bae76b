//! Symmetric JSON-RPC over duplex byte streams.
//!
//! Most RPC stacks split the world into a client that calls and a server
//! that answers.  Here both ends of a connection are equal: either side can
//! issue requests, send notifications, and serve calls from the other side,
//! all multiplexed over one byte stream with no framing beyond JSON itself.
//! A server can call back into the client it is servicing while that
//! client's original request is still in flight.
//!
//! The wire layer is a streaming JSON codec built for this use case: the
//! [`Reader`] pulls one value at a time off the stream (messages arrive
//! back to back with no delimiters), and the [`Writer`] encodes and flushes
//! each value atomically.  On top of that, [`Connection`] correlates
//! requests with responses by id and dispatches inbound traffic to an
//! injected [`Handler`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use serde_json::json;
//! use symmetric_jsonrpc::{
//!     ConnectionHandle, ConnectionOptions, ErrorPayload, Handler, JsonValue, Server,
//! };
//!
//! struct Greeter;
//!
//! #[async_trait]
//! impl Handler for Greeter {
//!     async fn handle_request(
//!         &self,
//!         method: &str,
//!         params: Vec<JsonValue>,
//!         _conn: ConnectionHandle,
//!     ) -> Result<JsonValue, ErrorPayload> {
//!         match method {
//!             "greet" => Ok(json!(format!("hello, {}", params[0]))),
//!             other => Err(ErrorPayload::method_not_found(other)),
//!         }
//!     }
//! }
//!
//! # async fn run() -> symmetric_jsonrpc::Result<()> {
//! let server = Server::bind(
//!     "127.0.0.1:0",
//!     Arc::new(Greeter),
//!     ConnectionOptions::default(),
//! )
//! .await?;
//! println!("serving on {}", server.local_addr());
//! server.join().await
//! # }
//! ```

pub mod connection;
pub mod error;
pub mod handler;
pub mod io;
pub mod peer;
pub mod reader;
pub mod server;
pub mod tokenizer;
pub mod types;
pub mod writer;

#[cfg(test)]
pub(crate) mod testing;

/// The in-memory JSON model used throughout.
pub use serde_json::Value as JsonValue;

pub use connection::{ConnectHook, Connection, ConnectionHandle, ConnectionOptions};
pub use error::{Result, RpcError};
pub use handler::{Handler, NullHandler};
pub use peer::Peer;
pub use reader::{CLASS_KEY, ClassRegistry, Reader, from_str};
pub use server::Server;
pub use tokenizer::{TokenSink, Tokenizer};
pub use types::{ErrorPayload, Message, Notification, Request, Response};
pub use writer::{Writer, to_string, to_vec};
