//! One RPC endpoint of a duplex byte stream.
//!
//! [`Connection::spawn`] splits the transport and starts a message loop task
//! that owns all per-connection state: the writer (so all outbound traffic is
//! serialized through one owner), the table of pending outbound calls, and a
//! [`JoinSet`] of child tasks running handler invocations.  Everything else
//! talks to the loop through channels via [`ConnectionHandle`], which is
//! cheap to clone and safe to use from any task, including handler tasks
//! calling back into the peer that called them.
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{Value as JsonValue, json};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, debug_span, error, warn};

use crate::handler::Handler;
use crate::reader::{ClassRegistry, Reader};
use crate::types::{ErrorPayload, Message, Notification, Request, Response};
use crate::writer::Writer;
use crate::{Result, RpcError};

/// Runs as a child task from the moment a connection starts, concurrently
/// with the message loop.  This is how a serving endpoint initiates calls
/// into the peer it is servicing.
pub type ConnectHook = Arc<dyn Fn(ConnectionHandle) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Clone)]
pub struct ConnectionOptions {
    /// Revival registry applied to every inbound value.
    pub classes: ClassRegistry,

    /// How long shutdown waits for in-flight handler tasks before aborting
    /// them.  `None` aborts immediately.
    pub graceful_shutdown_timeout: Option<Duration>,

    pub on_connect: Option<ConnectHook>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            classes: ClassRegistry::new(),
            graceful_shutdown_timeout: Some(Duration::from_secs(5)),
            on_connect: None,
        }
    }
}

impl ConnectionOptions {
    pub fn with_on_connect<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(ConnectionHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_connect = Some(Arc::new(move |handle| Box::pin(hook(handle))));
        self
    }
}

enum Outbound {
    Call {
        request: Request,
        response_tx: Option<oneshot::Sender<Result<Response>>>,
    },
    Notify {
        notification: Notification,
        sent_tx: oneshot::Sender<Result<()>>,
    },
    CancelCall {
        id: u64,
    },
}

/// Clonable handle for issuing outbound traffic on a connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    outbound_tx: mpsc::Sender<Outbound>,
    next_id: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl ConnectionHandle {
    /// Call a remote method and wait for its response.
    ///
    /// A remote error payload surfaces as [`RpcError::Remote`]; if the
    /// connection closes first, every waiter gets
    /// [`RpcError::ConnectionClosed`].
    pub async fn call(&self, method: impl Into<String>, params: Vec<JsonValue>) -> Result<JsonValue> {
        let (_, response_rx) = self.start_call(method.into(), params).await?;
        let response = response_rx
            .await
            .map_err(|_| RpcError::ConnectionClosed)??;
        Self::unpack(response)
    }

    /// [`call`](Self::call) bounded by a deadline.  On timeout the pending
    /// entry is discarded, so a late response routes to
    /// [`Handler::handle_response`].
    pub async fn call_with_timeout(
        &self,
        method: impl Into<String>,
        params: Vec<JsonValue>,
        timeout: Duration,
    ) -> Result<JsonValue> {
        let method = method.into();
        let (id, response_rx) = self.start_call(method.clone(), params).await?;
        match tokio::time::timeout(timeout, response_rx).await {
            Ok(received) => {
                let response = received.map_err(|_| RpcError::ConnectionClosed)??;
                Self::unpack(response)
            }
            Err(_) => {
                // must not be lost when the outbound queue is full, or the
                // stale pending entry would swallow the late response
                let outbound_tx = self.outbound_tx.clone();
                tokio::spawn(async move {
                    let _ = outbound_tx.send(Outbound::CancelCall { id }).await;
                });
                Err(RpcError::Timeout { method })
            }
        }
    }

    /// Send a request without waiting for its response.  Returns the
    /// allocated id; the eventual response routes to
    /// [`Handler::handle_response`].
    pub async fn call_no_wait(
        &self,
        method: impl Into<String>,
        params: Vec<JsonValue>,
    ) -> Result<u64> {
        let id = self.allocate_id();
        let request = Request {
            id,
            method: method.into(),
            params,
        };
        self.outbound_tx
            .send(Outbound::Call {
                request,
                response_tx: None,
            })
            .await
            .map_err(|_| RpcError::ConnectionClosed)?;
        Ok(id)
    }

    /// Send a notification.  Resolves once the message has been handed to
    /// the transport.
    pub async fn notify(&self, method: impl Into<String>, params: Vec<JsonValue>) -> Result<()> {
        let (sent_tx, sent_rx) = oneshot::channel();
        self.outbound_tx
            .send(Outbound::Notify {
                notification: Notification {
                    method: method.into(),
                    params,
                },
                sent_tx,
            })
            .await
            .map_err(|_| RpcError::ConnectionClosed)?;
        sent_rx.await.map_err(|_| RpcError::ConnectionClosed)?
    }

    /// Request connection shutdown.  Idempotent; returns immediately.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.outbound_tx.is_closed()
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    async fn start_call(
        &self,
        method: String,
        params: Vec<JsonValue>,
    ) -> Result<(u64, oneshot::Receiver<Result<Response>>)> {
        let id = self.allocate_id();
        let (response_tx, response_rx) = oneshot::channel();
        self.outbound_tx
            .send(Outbound::Call {
                request: Request { id, method, params },
                response_tx: Some(response_tx),
            })
            .await
            .map_err(|_| RpcError::ConnectionClosed)?;
        Ok((id, response_rx))
    }

    fn unpack(response: Response) -> Result<JsonValue> {
        match response.error {
            Some(payload) => Err(payload.into()),
            None => Ok(response.result),
        }
    }
}

/// A spawned RPC endpoint over one duplex stream.
pub struct Connection {
    handle: ConnectionHandle,
    worker: JoinHandle<()>,
}

static CONNECTION_SEQ: AtomicU64 = AtomicU64::new(0);

impl Connection {
    /// Split `transport` and start the message loop.
    pub fn spawn<T>(transport: T, handler: Arc<dyn Handler>, options: ConnectionOptions) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::spawn_with_token(transport, handler, options, CancellationToken::new())
    }

    /// As [`spawn`](Self::spawn), with the connection's cancellation token
    /// supplied by the caller (a server hands each connection a child of its
    /// own token).
    pub fn spawn_with_token<T>(
        transport: T,
        handler: Arc<dyn Handler>,
        options: ConnectionOptions,
        cancel: CancellationToken,
    ) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let conn_seq = CONNECTION_SEQ.fetch_add(1, Ordering::Relaxed);
        let span = debug_span!("connection", conn = conn_seq);

        let (outbound_tx, outbound_rx) = mpsc::channel(32);
        let handle = ConnectionHandle {
            outbound_tx,
            next_id: Arc::new(AtomicU64::new(0)),
            cancel: cancel.clone(),
        };

        let (read_half, write_half) = tokio::io::split(transport);

        // The recursive-descent parse is not safe to abandon mid-value, so
        // reading runs on its own task and feeds the loop through a channel.
        let (inbound_tx, inbound_rx) = mpsc::channel(16);
        let classes = options.classes.clone();
        let read_cancel = cancel.clone();
        let reader_task = tokio::spawn(
            read_loop(read_half, read_cancel, classes, inbound_tx).instrument(span.clone()),
        );

        let writer_cancel = CancellationToken::new();
        let worker = ConnectionWorker {
            handler,
            writer: Writer::new(write_half, writer_cancel.clone()),
            handle: handle.clone(),
            pending: HashMap::new(),
            children: JoinSet::new(),
            child_requests: HashMap::new(),
            cancel,
            writer_cancel,
            graceful_timeout: options.graceful_shutdown_timeout,
            on_connect: options.on_connect,
        };
        let worker = tokio::spawn(worker.run(outbound_rx, inbound_rx, reader_task).instrument(span));

        Self { handle, worker }
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    /// Request shutdown.  Idempotent; use [`join`](Self::join) to wait for
    /// termination.
    pub fn shutdown(&self) {
        self.handle.shutdown();
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    /// Wait until the message loop and all of its children have terminated.
    pub async fn join(self) -> Result<()> {
        self.worker
            .await
            .map_err(|e| RpcError::bug(format!("connection worker task failed: {e}")))
    }
}

async fn read_loop<R: AsyncRead + Unpin + Send>(
    src: R,
    cancel: CancellationToken,
    classes: ClassRegistry,
    inbound_tx: mpsc::Sender<Result<JsonValue>>,
) {
    let mut reader = Reader::with_classes(src, cancel, classes);
    loop {
        match reader.read_value().await {
            Ok(Some(value)) => {
                if inbound_tx.send(Ok(value)).await.is_err() {
                    break;
                }
            }
            // clean end of stream; dropping the sender tells the loop
            Ok(None) => break,
            Err(e) => {
                let _ = inbound_tx.send(Err(e)).await;
                break;
            }
        }
    }
}

struct ConnectionWorker<W> {
    handler: Arc<dyn Handler>,
    writer: Writer<W>,
    handle: ConnectionHandle,
    pending: HashMap<u64, oneshot::Sender<Result<Response>>>,
    children: JoinSet<Option<Response>>,
    child_requests: HashMap<tokio::task::Id, u64>,
    cancel: CancellationToken,
    writer_cancel: CancellationToken,
    graceful_timeout: Option<Duration>,
    on_connect: Option<ConnectHook>,
}

type ChildOutcome = std::result::Result<(tokio::task::Id, Option<Response>), tokio::task::JoinError>;

impl<W: AsyncWrite + Unpin + Send + 'static> ConnectionWorker<W> {
    async fn run(
        mut self,
        mut outbound_rx: mpsc::Receiver<Outbound>,
        mut inbound_rx: mpsc::Receiver<Result<JsonValue>>,
        reader_task: JoinHandle<()>,
    ) {
        if let Some(hook) = self.on_connect.take() {
            let fut = hook(self.handle.clone());
            self.children.spawn(async move {
                fut.await;
                None
            });
        }

        let cancel = self.cancel.clone();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("shutdown requested");
                    break;
                }
                cmd = outbound_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    if let Err(e) = self.handle_outbound(cmd).await {
                        debug!(error = %e, "write side failed");
                        break;
                    }
                }
                inbound = inbound_rx.recv() => match inbound {
                    Some(Ok(value)) => self.dispatch(value),
                    Some(Err(e)) => {
                        warn!(error = %e, "read side failed");
                        break;
                    }
                    None => {
                        debug!("peer closed the stream");
                        break;
                    }
                },
                Some(joined) = self.children.join_next_with_id() => {
                    if let Err(e) = self.reap_child(joined).await {
                        debug!(error = %e, "write side failed");
                        break;
                    }
                }
            }
        }

        self.drain(outbound_rx, inbound_rx, reader_task).await;
    }

    async fn handle_outbound(&mut self, cmd: Outbound) -> Result<()> {
        match cmd {
            Outbound::Call {
                request,
                response_tx,
            } => {
                let id = request.id;
                let value = Message::Request(request).into_value();
                match self.writer.write_value(&value).await {
                    Ok(()) => {
                        if let Some(tx) = response_tx {
                            self.pending.insert(id, tx);
                        }
                        Ok(())
                    }
                    // an encode failure happens before any byte reaches the
                    // wire, so only this call fails, not the connection
                    Err(e @ RpcError::Encode { .. }) => {
                        match response_tx {
                            Some(tx) => {
                                let _ = tx.send(Err(e));
                            }
                            None => warn!(id, error = %e, "request could not be encoded"),
                        }
                        Ok(())
                    }
                    Err(e) => match response_tx {
                        Some(tx) => {
                            let _ = tx.send(Err(e));
                            Err(RpcError::ConnectionClosed)
                        }
                        None => Err(e),
                    },
                }
            }
            Outbound::Notify {
                notification,
                sent_tx,
            } => {
                let value = Message::Notification(notification).into_value();
                match self.writer.write_value(&value).await {
                    Ok(()) => {
                        let _ = sent_tx.send(Ok(()));
                        Ok(())
                    }
                    Err(e @ RpcError::Encode { .. }) => {
                        let _ = sent_tx.send(Err(e));
                        Ok(())
                    }
                    Err(e) => {
                        let _ = sent_tx.send(Err(e));
                        Err(RpcError::ConnectionClosed)
                    }
                }
            }
            Outbound::CancelCall { id } => {
                self.pending.remove(&id);
                Ok(())
            }
        }
    }

    fn dispatch(&mut self, value: JsonValue) {
        let message = match Message::from_value(value) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "discarding unclassifiable inbound value");
                return;
            }
        };
        match message {
            Message::Request(Request { id, method, params }) => {
                let handler = Arc::clone(&self.handler);
                let handle = self.handle.clone();
                let span = debug_span!("request", id, method = method.as_str());
                let task = self.children.spawn(
                    async move {
                        let outcome = handler.handle_request(&method, params, handle).await;
                        Some(match outcome {
                            Ok(result) => Response::success(id, result),
                            Err(payload) => Response::failure(id, payload),
                        })
                    }
                    .instrument(span),
                );
                self.child_requests.insert(task.id(), id);
            }
            Message::Notification(Notification { method, params }) => {
                let handler = Arc::clone(&self.handler);
                let handle = self.handle.clone();
                let span = debug_span!("notification", method = method.as_str());
                self.children.spawn(
                    async move {
                        if let Err(e) = handler.handle_notification(&method, params, handle).await
                        {
                            warn!(method, kind = %e.kind, "notification handler failed");
                        }
                        None
                    }
                    .instrument(span),
                );
            }
            Message::Response(response) => match self.pending.remove(&response.id) {
                Some(response_tx) => {
                    let _ = response_tx.send(Ok(response));
                }
                None => {
                    let handler = Arc::clone(&self.handler);
                    let handle = self.handle.clone();
                    self.children.spawn(async move {
                        handler.handle_response(response, handle).await;
                        None
                    });
                }
            },
        }
    }

    async fn reap_child(&mut self, joined: ChildOutcome) -> Result<()> {
        match joined {
            Ok((task_id, Some(response))) => {
                self.child_requests.remove(&task_id);
                self.send_response(response).await
            }
            Ok((task_id, None)) => {
                self.child_requests.remove(&task_id);
                Ok(())
            }
            Err(join_error) => {
                let task_id = join_error.id();
                error!(error = %join_error, "handler task failed");
                // a panicked request handler still owes the peer an answer
                match self.child_requests.remove(&task_id) {
                    Some(request_id) => {
                        self.send_response(Response::failure(
                            request_id,
                            ErrorPayload::new(
                                "InternalError",
                                vec![json!("request handler failed")],
                            ),
                        ))
                        .await
                    }
                    None => Ok(()),
                }
            }
        }
    }

    async fn send_response(&mut self, response: Response) -> Result<()> {
        let id = response.id;
        match self
            .writer
            .write_value(&Message::Response(response).into_value())
            .await
        {
            // the peer is still owed an answer for this id
            Err(e @ RpcError::Encode { .. }) => {
                warn!(id, error = %e, "response could not be encoded");
                let fallback = Response::failure(
                    id,
                    ErrorPayload::new("EncodeError", vec![json!(e.to_string())]),
                );
                self.writer
                    .write_value(&Message::Response(fallback).into_value())
                    .await
            }
            other => other,
        }
    }

    /// Terminal phase: stop intake, finish or abort children, wake every
    /// pending call, close the stream.
    async fn drain(
        mut self,
        mut outbound_rx: mpsc::Receiver<Outbound>,
        inbound_rx: mpsc::Receiver<Result<JsonValue>>,
        reader_task: JoinHandle<()>,
    ) {
        debug!("draining connection");
        self.cancel.cancel();

        outbound_rx.close();
        while let Ok(cmd) = outbound_rx.try_recv() {
            match cmd {
                Outbound::Call {
                    response_tx: Some(tx),
                    ..
                } => {
                    let _ = tx.send(Err(RpcError::ConnectionClosed));
                }
                Outbound::Notify { sent_tx, .. } => {
                    let _ = sent_tx.send(Err(RpcError::ConnectionClosed));
                }
                Outbound::Call { .. } | Outbound::CancelCall { .. } => {}
            }
        }

        if let Some(timeout) = self.graceful_timeout {
            let deadline = Instant::now() + timeout;
            loop {
                let next = tokio::time::timeout_at(deadline, self.children.join_next_with_id()).await;
                match next {
                    Ok(Some(joined)) => {
                        // responses for already-running handlers still go out
                        if let Err(e) = self.reap_child(joined).await {
                            debug!(error = %e, "response lost during drain");
                        }
                    }
                    Ok(None) => break,
                    Err(_) => {
                        warn!("graceful shutdown deadline passed, aborting handler tasks");
                        break;
                    }
                }
            }
        }
        self.children.abort_all();
        while self.children.join_next().await.is_some() {}

        for (_, response_tx) in self.pending.drain() {
            let _ = response_tx.send(Err(RpcError::ConnectionClosed));
        }

        reader_task.abort();
        let _ = reader_task.await;
        drop(inbound_rx);

        match tokio::time::timeout(Duration::from_secs(1), self.writer.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "error closing the write side"),
            Err(_) => self.writer_cancel.cancel(),
        }
        debug!("connection terminated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::NullHandler;
    use assert_matches::assert_matches;
    use async_trait::async_trait;

    struct EchoHandler;

    #[async_trait]
    impl Handler for EchoHandler {
        async fn handle_request(
            &self,
            method: &str,
            params: Vec<JsonValue>,
            _conn: ConnectionHandle,
        ) -> std::result::Result<JsonValue, ErrorPayload> {
            match method {
                "echo" => Ok(JsonValue::Array(params)),
                "slow_echo" => {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok(JsonValue::Array(params))
                }
                // a result the wire encoding cannot carry
                "emoji" => Ok(json!("\u{1f600}")),
                "fail" => Err(ErrorPayload::new("ValueError", params)),
                other => Err(ErrorPayload::method_not_found(other)),
            }
        }
    }

    struct ResponseRecorder {
        seen_tx: mpsc::UnboundedSender<Response>,
    }

    #[async_trait]
    impl Handler for ResponseRecorder {
        async fn handle_response(&self, response: Response, _conn: ConnectionHandle) {
            let _ = self.seen_tx.send(response);
        }
    }

    fn connected_pair(
        a: Arc<dyn Handler>,
        b: Arc<dyn Handler>,
    ) -> (Connection, Connection) {
        let (left, right) = tokio::io::duplex(4096);
        (
            Connection::spawn(left, a, ConnectionOptions::default()),
            Connection::spawn(right, b, ConnectionOptions::default()),
        )
    }

    #[tokio::test]
    async fn call_round_trip() {
        crate::testing::init_test_logging();
        let (client, server) = connected_pair(Arc::new(NullHandler), Arc::new(EchoHandler));

        let result = client
            .handle()
            .call("echo", vec![json!(1), json!("x")])
            .await
            .unwrap();
        assert_eq!(result, json!([1, "x"]));

        client.shutdown();
        client.join().await.unwrap();
        server.join().await.unwrap();
    }

    #[tokio::test]
    async fn remote_error_surfaces_to_the_caller() {
        crate::testing::init_test_logging();
        let (client, server) = connected_pair(Arc::new(NullHandler), Arc::new(EchoHandler));

        let err = client
            .handle()
            .call("fail", vec![json!("nope")])
            .await
            .unwrap_err();
        assert_matches!(err, RpcError::Remote { kind, .. } if kind == "ValueError");

        let err = client.handle().call("missing", vec![]).await.unwrap_err();
        assert_matches!(err, RpcError::Remote { kind, .. } if kind == "MethodNotFound");

        client.shutdown();
        client.join().await.unwrap();
        server.join().await.unwrap();
    }

    #[tokio::test]
    async fn unencodable_call_fails_alone() {
        crate::testing::init_test_logging();
        let (client, server) = connected_pair(Arc::new(NullHandler), Arc::new(EchoHandler));
        let handle = client.handle();

        // nothing reached the wire, so only this call errors
        let err = handle
            .call("echo", vec![json!("\u{1f600}")])
            .await
            .unwrap_err();
        assert_matches!(err, RpcError::Encode { .. });

        // the connection keeps serving traffic afterwards
        let result = handle.call("echo", vec![json!("ok")]).await.unwrap();
        assert_eq!(result, json!(["ok"]));

        let err = handle.notify("log", vec![json!("\u{1f600}")]).await.unwrap_err();
        assert_matches!(err, RpcError::Encode { .. });

        client.shutdown();
        client.join().await.unwrap();
        server.join().await.unwrap();
    }

    #[tokio::test]
    async fn unencodable_handler_result_becomes_an_error_response() {
        crate::testing::init_test_logging();
        let (client, server) = connected_pair(Arc::new(NullHandler), Arc::new(EchoHandler));
        let handle = client.handle();

        let err = handle.call("emoji", vec![]).await.unwrap_err();
        assert_matches!(err, RpcError::Remote { kind, .. } if kind == "EncodeError");

        // the serving connection survived its own encode failure
        let result = handle.call("echo", vec![json!(1)]).await.unwrap();
        assert_eq!(result, json!([1]));

        client.shutdown();
        client.join().await.unwrap();
        server.join().await.unwrap();
    }

    #[tokio::test]
    async fn fire_and_forget_response_routes_to_handle_response() {
        crate::testing::init_test_logging();
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let (client, server) = connected_pair(
            Arc::new(ResponseRecorder { seen_tx }),
            Arc::new(EchoHandler),
        );

        let id = client
            .handle()
            .call_no_wait("echo", vec![json!(7)])
            .await
            .unwrap();

        let response = seen_rx.recv().await.unwrap();
        assert_eq!(response.id, id);
        assert_eq!(response.result, json!([7]));
        assert_eq!(response.error, None);

        client.shutdown();
        client.join().await.unwrap();
        server.join().await.unwrap();
    }

    #[tokio::test]
    async fn late_response_after_timeout_routes_to_handle_response() {
        crate::testing::init_test_logging();
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let (client, server) = connected_pair(
            Arc::new(ResponseRecorder { seen_tx }),
            Arc::new(EchoHandler),
        );

        let err = client
            .handle()
            .call_with_timeout("slow_echo", vec![json!("late")], Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_matches!(err, RpcError::Timeout { .. });

        // the answer still arrives, and is no longer anyone's pending call
        let response = seen_rx.recv().await.unwrap();
        assert_eq!(response.result, json!(["late"]));

        client.shutdown();
        client.join().await.unwrap();
        server.join().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_wakes_every_pending_call() {
        crate::testing::init_test_logging();
        // the peer never answers: null handler's default is an error response,
        // so park calls against a half-open stream instead
        let (left, _right_unused) = tokio::io::duplex(4096);
        let client = Connection::spawn(
            left,
            Arc::new(NullHandler) as Arc<dyn Handler>,
            ConnectionOptions::default(),
        );

        let handle = client.handle();
        let mut waiters = Vec::new();
        for i in 0..8 {
            let handle = handle.clone();
            waiters.push(tokio::spawn(async move {
                handle.call("sleep", vec![json!(i)]).await
            }));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        client.shutdown();
        client.join().await.unwrap();
        for waiter in waiters {
            assert_matches!(waiter.await.unwrap(), Err(RpcError::ConnectionClosed));
        }
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn call_with_timeout_gives_up_promptly() {
        crate::testing::init_test_logging();
        let (left, _right_unused) = tokio::io::duplex(4096);
        let client = Connection::spawn(
            left,
            Arc::new(NullHandler) as Arc<dyn Handler>,
            ConnectionOptions::default(),
        );

        let err = client
            .handle()
            .call_with_timeout("sleep", vec![], Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_matches!(err, RpcError::Timeout { method } if method == "sleep");

        client.shutdown();
        client.join().await.unwrap();
    }

    #[tokio::test]
    async fn peer_disconnect_terminates_the_connection() {
        crate::testing::init_test_logging();
        let (left, right) = tokio::io::duplex(4096);
        let client = Connection::spawn(
            left,
            Arc::new(NullHandler) as Arc<dyn Handler>,
            ConnectionOptions::default(),
        );
        drop(right);
        client.join().await.unwrap();
    }

    #[tokio::test]
    async fn on_connect_hook_runs_concurrently_with_serving() {
        crate::testing::init_test_logging();
        let (left, right) = tokio::io::duplex(4096);
        let (probe_tx, probe_rx) = oneshot::channel::<JsonValue>();
        let probe_tx = std::sync::Mutex::new(Some(probe_tx));

        let options = ConnectionOptions::default().with_on_connect(move |handle| {
            let probe_tx = probe_tx.lock().ok().and_then(|mut g| g.take());
            async move {
                if let (Some(tx), Ok(result)) =
                    (probe_tx, handle.call("echo", vec![json!("hi")]).await)
                {
                    let _ = tx.send(result);
                }
            }
        });
        let caller = Connection::spawn(left, Arc::new(NullHandler) as Arc<dyn Handler>, options);
        let server = Connection::spawn(
            right,
            Arc::new(EchoHandler) as Arc<dyn Handler>,
            ConnectionOptions::default(),
        );

        assert_eq!(probe_rx.await.unwrap(), json!(["hi"]));
        caller.shutdown();
        caller.join().await.unwrap();
        server.join().await.unwrap();
    }
}
