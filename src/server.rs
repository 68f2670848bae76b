//! TCP accept loop feeding a handler with connections.
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, debug_span, warn};

use crate::connection::{Connection, ConnectionOptions};
use crate::handler::Handler;
use crate::{Result, RpcError};

/// A listening endpoint.  Every accepted stream becomes a [`Connection`]
/// running under a child of the server's cancellation token, so shutting the
/// server down drains the whole tree.
pub struct Server {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    accept_task: JoinHandle<()>,
}

impl Server {
    /// Bind `addr` and start serving.  Bind to port 0 to let the OS pick;
    /// [`local_addr`](Self::local_addr) reports the effective address.
    pub async fn bind(
        addr: impl ToSocketAddrs,
        handler: Arc<dyn Handler>,
        options: ConnectionOptions,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Self::serve(listener, handler, options)
    }

    /// Serve connections from an already-bound listener.
    pub fn serve(
        listener: TcpListener,
        handler: Arc<dyn Handler>,
        options: ConnectionOptions,
    ) -> Result<Self> {
        Self::serve_with_token(listener, handler, options, CancellationToken::new())
    }

    pub fn serve_with_token(
        listener: TcpListener,
        handler: Arc<dyn Handler>,
        options: ConnectionOptions,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let local_addr = listener.local_addr()?;
        let span = debug_span!("server", addr = %local_addr);
        let accept_task = tokio::spawn(
            accept_loop(listener, handler, options, cancel.clone()).instrument(span),
        );
        Ok(Self {
            local_addr,
            cancel,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and begin draining connections.  Idempotent.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait until the accept loop and every connection have terminated.
    pub async fn join(self) -> Result<()> {
        self.accept_task
            .await
            .map_err(|e| RpcError::bug(format!("server accept task failed: {e}")))
    }

    /// [`shutdown`](Self::shutdown) then [`join`](Self::join).
    pub async fn close(self) -> Result<()> {
        self.shutdown();
        self.join().await
    }
}

async fn accept_loop(
    listener: TcpListener,
    handler: Arc<dyn Handler>,
    options: ConnectionOptions,
    cancel: CancellationToken,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    debug!(%peer_addr, "accepted connection");
                    let conn = Connection::spawn_with_token(
                        stream,
                        Arc::clone(&handler),
                        options.clone(),
                        cancel.child_token(),
                    );
                    connections.spawn(async move {
                        let _ = conn.join().await;
                    });
                }
                Err(e) => {
                    // transient resource exhaustion must not kill the server
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            Some(_) = connections.join_next() => {}
        }
    }

    // release the listening address before the (possibly slow) drain
    drop(listener);
    debug!("draining connections");
    cancel.cancel();
    while connections.join_next().await.is_some() {}
    debug!("server terminated");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionHandle;
    use crate::handler::NullHandler;
    use crate::types::ErrorPayload;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use serde_json::{Value as JsonValue, json};
    use tokio::net::TcpStream;

    struct PongHandler;

    #[async_trait]
    impl crate::handler::Handler for PongHandler {
        async fn handle_request(
            &self,
            method: &str,
            _params: Vec<JsonValue>,
            _conn: ConnectionHandle,
        ) -> std::result::Result<JsonValue, ErrorPayload> {
            match method {
                "ping" => Ok(json!("pong")),
                other => Err(ErrorPayload::method_not_found(other)),
            }
        }
    }

    #[tokio::test]
    async fn serves_connections_over_loopback() {
        crate::testing::init_test_logging();
        let server = Server::bind(
            "127.0.0.1:0",
            Arc::new(PongHandler) as Arc<dyn Handler>,
            ConnectionOptions::default(),
        )
        .await
        .unwrap();

        let stream = TcpStream::connect(server.local_addr()).await.unwrap();
        let client = Connection::spawn(
            stream,
            Arc::new(NullHandler) as Arc<dyn Handler>,
            ConnectionOptions::default(),
        );
        assert_eq!(
            client.handle().call("ping", vec![]).await.unwrap(),
            json!("pong")
        );

        client.shutdown();
        client.join().await.unwrap();
        server.close().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_drains_connected_clients() {
        crate::testing::init_test_logging();
        let server = Server::bind(
            "127.0.0.1:0",
            Arc::new(PongHandler) as Arc<dyn Handler>,
            ConnectionOptions::default(),
        )
        .await
        .unwrap();

        let stream = TcpStream::connect(server.local_addr()).await.unwrap();
        let client = Connection::spawn(
            stream,
            Arc::new(NullHandler) as Arc<dyn Handler>,
            ConnectionOptions::default(),
        );
        // make sure the server saw the connection before tearing down
        client.handle().call("ping", vec![]).await.unwrap();

        server.close().await.unwrap();

        // server-side close reaches the client as end of stream
        let handle = client.handle();
        client.join().await.unwrap();
        assert_matches!(
            handle.call("ping", vec![]).await,
            Err(RpcError::ConnectionClosed)
        );
    }
}
