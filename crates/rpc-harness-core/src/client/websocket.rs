//! WebSocket test client.
//!
//! A [`WebSocketHandle`] owns one connection. A reader task routes result
//! frames to the waiting [`rpc`](WebSocketHandle::rpc) call by correlation
//! id; everything else (events, results nobody waits for) is queued and
//! can be read with [`next_frame`](WebSocketHandle::next_frame).

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use futures::stream::{SplitSink, SplitStream};
use futures::{FutureExt, SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::config::WebSocketConfig;
use crate::error::{HarnessError, Result, RpcError};
use crate::harness::{Finalizers, Stage};
use crate::wire::{ClientFrame, ServerFrame};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long `close` waits for the server to acknowledge.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Opens websocket connections to one container.
#[derive(Debug, Clone)]
pub struct WebSocketClient {
    url: String,
    connect_timeout: Duration,
    rpc_timeout: Duration,
    finalizers: Option<Arc<Finalizers>>,
}

impl WebSocketClient {
    /// Client for the endpoint at `url`.
    #[must_use]
    pub fn new(url: impl Into<String>, config: &WebSocketConfig) -> Self {
        Self {
            url: url.into(),
            connect_timeout: config.connect_timeout(),
            rpc_timeout: config.rpc_timeout(),
            finalizers: None,
        }
    }

    /// Close every handle this client opens when `finalizers` run.
    #[must_use]
    pub fn with_finalizers(mut self, finalizers: Arc<Finalizers>) -> Self {
        self.finalizers = Some(finalizers);
        self
    }

    /// Override the per-call timeout of handles opened from now on.
    #[must_use]
    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    /// The endpoint url.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Connect and wait for the server to announce the socket id.
    ///
    /// # Errors
    ///
    /// - [`HarnessError::WebSocket`] if the handshake fails
    /// - [`HarnessError::Timeout`] if the handshake or the announcement takes
    ///   longer than `websocket.connect_timeout_ms`
    #[instrument(skip(self), fields(url = %self.url))]
    pub async fn connect(&self) -> Result<WebSocketHandle> {
        let deadline = Instant::now() + self.connect_timeout;
        let timed_out = || HarnessError::Timeout {
            operation: format!("websocket connect to {}", self.url),
            after: self.connect_timeout,
        };

        let (socket, _response) = tokio::time::timeout_at(deadline, connect_async(self.url.as_str()))
            .await
            .map_err(|_| timed_out())??;
        let (sink, stream) = socket.split();

        let shared = Arc::new(Shared::default());
        let (announce, announced) = oneshot::channel();
        let reader = tokio::spawn(read_frames(stream, Arc::clone(&shared), announce));

        let socket_id = match tokio::time::timeout_at(deadline, announced).await {
            Ok(Ok(socket_id)) => socket_id,
            Ok(Err(_)) => {
                reader.abort();
                return Err(RpcError::Disconnected.into());
            }
            Err(_) => {
                reader.abort();
                return Err(timed_out());
            }
        };
        debug!(socket_id = %socket_id, "websocket connected");

        let handle = WebSocketHandle {
            inner: Arc::new(HandleInner {
                socket_id,
                rpc_timeout: self.rpc_timeout,
                sink: Mutex::new(sink),
                shared,
                reader: StdMutex::new(Some(reader)),
                closing: AtomicBool::new(false),
            }),
        };

        if let Some(finalizers) = &self.finalizers {
            let tracked = handle.clone();
            finalizers.push(
                Stage::Clients,
                format!("websocket {}", handle.socket_id()),
                move || async move { tracked.close().await }.boxed(),
            );
        }
        Ok(handle)
    }
}

/// State shared between a handle and its reader task.
#[derive(Default)]
struct Shared {
    pending: DashMap<String, oneshot::Sender<ServerFrame>>,
    unmatched: StdMutex<VecDeque<ServerFrame>>,
    arrived: Notify,
    closed: AtomicBool,
}

impl Shared {
    fn unmatched(&self) -> std::sync::MutexGuard<'_, VecDeque<ServerFrame>> {
        self.unmatched.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn route(&self, frame: ServerFrame) {
        let waiter = frame
            .correlation_id()
            .and_then(|id| self.pending.remove(id))
            .map(|(_, waiter)| waiter);

        let frame = match waiter {
            Some(waiter) => match waiter.send(frame) {
                Ok(()) => return,
                // The caller timed out; keep the late result around.
                Err(frame) => frame,
            },
            None => frame,
        };
        self.unmatched().push_back(frame);
        self.arrived.notify_one();
    }
}

async fn read_frames(mut stream: SplitStream<Socket>, shared: Arc<Shared>, announce: oneshot::Sender<String>) {
    let mut announce = Some(announce);

    while let Some(message) = stream.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(error = %e, "websocket read failed");
                break;
            }
        };

        let frame: ServerFrame = match serde_json::from_str(&text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "undecodable websocket frame");
                continue;
            }
        };

        if let Some(socket_id) = frame.connected_socket_id() {
            if let Some(announce) = announce.take() {
                let _ = announce.send(socket_id.to_string());
                continue;
            }
        }
        shared.route(frame);
    }

    shared.closed.store(true, Ordering::SeqCst);
    // Dropping the senders wakes every waiter with a disconnect.
    shared.pending.clear();
    shared.arrived.notify_one();
}

struct HandleInner {
    socket_id: String,
    rpc_timeout: Duration,
    sink: Mutex<SplitSink<Socket, Message>>,
    shared: Arc<Shared>,
    reader: StdMutex<Option<JoinHandle<()>>>,
    closing: AtomicBool,
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        if let Some(reader) = self
            .reader
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            reader.abort();
        }
    }
}

/// An open websocket connection. Clones share the connection.
#[derive(Clone)]
pub struct WebSocketHandle {
    inner: Arc<HandleInner>,
}

impl WebSocketHandle {
    /// Server-issued id of this connection.
    #[must_use]
    pub fn socket_id(&self) -> &str {
        &self.inner.socket_id
    }

    /// Whether the connection has ended.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.shared.closed.load(Ordering::SeqCst)
    }

    /// Call `method` with `data` as keyword arguments and wait for its result.
    ///
    /// # Errors
    ///
    /// - [`HarnessError::Timeout`] if no result arrives within
    ///   `websocket.rpc_timeout_ms`; the call may still complete server-side
    /// - [`RpcError::Remote`] if the handler failed
    /// - [`RpcError::Disconnected`] if the connection is gone
    pub async fn rpc(&self, method: &str, data: Value) -> Result<Value> {
        let shared = &self.inner.shared;
        if self.is_closed() {
            return Err(RpcError::Disconnected.into());
        }

        let correlation_id = Uuid::new_v4().to_string();
        let (waiter, result) = oneshot::channel();
        shared.pending.insert(correlation_id.clone(), waiter);
        if self.is_closed() {
            shared.pending.remove(&correlation_id);
            return Err(RpcError::Disconnected.into());
        }

        let frame = ClientFrame {
            method: method.to_string(),
            data,
            correlation_id: correlation_id.clone(),
        };
        let sent = match serde_json::to_string(&frame) {
            Ok(text) => self
                .inner
                .sink
                .lock()
                .await
                .send(Message::Text(text))
                .await
                .map_err(HarnessError::from),
            Err(e) => Err(e.into()),
        };
        if let Err(err) = sent {
            shared.pending.remove(&correlation_id);
            return Err(err);
        }

        match tokio::time::timeout(self.inner.rpc_timeout, result).await {
            Ok(Ok(frame)) => match frame.into_outcome() {
                Some(Ok(value)) => Ok(value),
                Some(Err(remote)) => Err(RpcError::Remote(remote).into()),
                None => Err(RpcError::Encode("event frame routed as a result".to_string()).into()),
            },
            Ok(Err(_)) => Err(RpcError::Disconnected.into()),
            Err(_) => {
                shared.pending.remove(&correlation_id);
                Err(HarnessError::Timeout {
                    operation: format!("websocket rpc {method}"),
                    after: self.inner.rpc_timeout,
                })
            }
        }
    }

    /// Next frame no rpc call was waiting for, in arrival order.
    ///
    /// # Errors
    ///
    /// [`HarnessError::Timeout`] if nothing arrives in time,
    /// [`RpcError::Disconnected`] if the connection ended with nothing queued.
    pub async fn next_frame(&self, timeout: Duration) -> Result<ServerFrame> {
        let deadline = Instant::now() + timeout;
        let shared = &self.inner.shared;

        loop {
            if let Some(frame) = shared.unmatched().pop_front() {
                return Ok(frame);
            }
            if self.is_closed() {
                return Err(RpcError::Disconnected.into());
            }
            if tokio::time::timeout_at(deadline, shared.arrived.notified())
                .await
                .is_err()
            {
                return Err(HarnessError::Timeout {
                    operation: format!("next frame on socket {}", self.socket_id()),
                    after: timeout,
                });
            }
        }
    }

    /// Take every queued frame.
    #[must_use]
    pub fn drain_unmatched(&self) -> Vec<ServerFrame> {
        self.inner.shared.unmatched().drain(..).collect()
    }

    /// Close the connection, releasing the server-side socket id. Idempotent.
    ///
    /// # Errors
    ///
    /// Never fails today; returns `Result` so it can be used as a finalizer.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        {
            let mut sink = self.inner.sink.lock().await;
            if let Err(e) = sink.send(Message::Close(None)).await {
                debug!(socket_id = %self.socket_id(), error = %e, "close frame not sent");
            }
        }

        let reader = self
            .inner
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut reader) = reader {
            if tokio::time::timeout(CLOSE_TIMEOUT, &mut reader).await.is_err() {
                warn!(socket_id = %self.socket_id(), "server did not acknowledge close");
                reader.abort();
            }
        }
        self.inner.shared.closed.store(true, Ordering::SeqCst);
        self.inner.shared.pending.clear();
        debug!(socket_id = %self.socket_id(), "websocket closed");
        Ok(())
    }
}

impl fmt::Debug for WebSocketHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketHandle")
            .field("socket_id", &self.inner.socket_id)
            .field("closed", &self.is_closed())
            .field("pending", &self.inner.shared.pending.len())
            .finish()
    }
}
