//! A symmetric node that can listen and dial at the same time.
//!
//! Both roles share one handler and one cancellation token.  Apart from
//! that, an inbound connection and an outbound connection are the same
//! thing: either side of any connection can call, notify, and be called
//! back.
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::connection::{Connection, ConnectionHandle, ConnectionOptions};
use crate::handler::Handler;
use crate::server::Server;

pub struct Peer {
    handler: Arc<dyn Handler>,
    options: ConnectionOptions,
    cancel: CancellationToken,
    servers: Mutex<Vec<Server>>,
    connections: Mutex<Vec<Connection>>,
}

impl Peer {
    pub fn new(handler: Arc<dyn Handler>, options: ConnectionOptions) -> Self {
        Self {
            handler,
            options,
            cancel: CancellationToken::new(),
            servers: Mutex::new(Vec::new()),
            connections: Mutex::new(Vec::new()),
        }
    }

    /// Start serving inbound connections on `addr`.  Returns the effective
    /// local address.  May be called more than once to listen on several
    /// addresses.
    pub async fn listen(&self, addr: impl ToSocketAddrs) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let server = Server::serve_with_token(
            listener,
            Arc::clone(&self.handler),
            self.options.clone(),
            self.cancel.child_token(),
        )?;
        let local_addr = server.local_addr();
        self.servers.lock().await.push(server);
        Ok(local_addr)
    }

    /// Dial a remote endpoint and attach the resulting stream.
    pub async fn connect(&self, addr: impl ToSocketAddrs) -> Result<ConnectionHandle> {
        let stream = TcpStream::connect(addr).await?;
        Ok(self.attach(stream).await)
    }

    /// Run a connection over any duplex stream under this node's lifecycle.
    pub async fn attach<T>(&self, transport: T) -> ConnectionHandle
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let conn = Connection::spawn_with_token(
            transport,
            Arc::clone(&self.handler),
            self.options.clone(),
            self.cancel.child_token(),
        );
        let handle = conn.handle();
        self.connections.lock().await.push(conn);
        handle
    }

    /// Tear down both roles.  Idempotent; use [`join`](Self::join) to wait.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait for every server and connection of this node to terminate.
    pub async fn join(&self) -> Result<()> {
        let servers = std::mem::take(&mut *self.servers.lock().await);
        for server in servers {
            server.join().await?;
        }
        let connections = std::mem::take(&mut *self.connections.lock().await);
        for conn in connections {
            conn.join().await?;
        }
        Ok(())
    }

    /// [`shutdown`](Self::shutdown) then [`join`](Self::join).
    pub async fn close(&self) -> Result<()> {
        self.shutdown();
        self.join().await
    }
}
