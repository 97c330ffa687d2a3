//! Web listener of a container: http routes plus the websocket endpoint.
//!
//! The accept loop runs until the container's cancellation token fires.
//! Every connection and every websocket session is spawned on the
//! container's task tracker, so `stop` waits for them within the grace
//! period. Open connections are shut down gracefully on cancellation.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONNECTION, CONTENT_TYPE, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, UPGRADE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::wire::{ClientFrame, RemoteError, ServerFrame};

use super::definition::{HttpRequest, HttpResponse};
use super::worker::WorkerRuntime;

type Body = Full<Bytes>;

/// What request handling needs from the container.
pub(crate) struct WebState {
    pub(crate) runtime: Arc<WorkerRuntime>,
    pub(crate) websocket_path: String,
    pub(crate) cancel: CancellationToken,
}

/// Accept connections until cancelled.
#[instrument(skip_all, fields(service = %state.runtime.definition.name(), address = %address))]
pub(crate) async fn serve(listener: TcpListener, address: SocketAddr, state: Arc<WebState>) {
    info!("web listener started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "accepted connection");
                        let state = Arc::clone(&state);
                        state
                            .runtime
                            .tracker
                            .spawn(serve_connection(stream, peer, Arc::clone(&state)));
                    }
                    Err(e) => {
                        error!(error = %e, "accept error");
                    }
                }
            }
            () = state.cancel.cancelled() => {
                info!("web listener stopping");
                break;
            }
        }
    }
}

async fn serve_connection(stream: TcpStream, peer: SocketAddr, state: Arc<WebState>) {
    let service = {
        let state = Arc::clone(&state);
        service_fn(move |request| {
            let state = Arc::clone(&state);
            async move { Ok::<_, Infallible>(handle_request(state, request).await) }
        })
    };

    let connection = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades();
    tokio::pin!(connection);

    tokio::select! {
        result = connection.as_mut() => {
            if let Err(e) = result {
                debug!(peer = %peer, error = %e, "connection error");
            }
        }
        () = state.cancel.cancelled() => {
            connection.as_mut().graceful_shutdown();
            if let Err(e) = connection.as_mut().await {
                debug!(peer = %peer, error = %e, "connection error during shutdown");
            }
        }
    }
}

async fn handle_request(state: Arc<WebState>, request: Request<Incoming>) -> Response<Body> {
    if request.uri().path() == state.websocket_path && is_websocket_upgrade(&request) {
        return upgrade_websocket(state, request);
    }

    let path = request.uri().path().to_string();
    let routes = state.runtime.definition.http_routes();
    let mut path_matched = false;

    for route in routes {
        let Some(params) = route.pattern.matches(&path) else {
            continue;
        };
        path_matched = true;
        if route.method != request.method() {
            continue;
        }

        let (parts, body) = request.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                debug!(error = %e, "failed to read request body");
                return plain(StatusCode::BAD_REQUEST, "unreadable body");
            }
        };

        let http_request = HttpRequest {
            method: parts.method,
            path,
            query: parts.uri.query().map(str::to_string),
            params,
            headers: parts.headers,
            body,
        };

        return match state.runtime.dispatch_http(route, http_request).await {
            Ok(response) => into_response(response),
            Err(err) => error_response(&err),
        };
    }

    if path_matched {
        plain(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
    } else {
        plain(StatusCode::NOT_FOUND, "not found")
    }
}

fn is_websocket_upgrade(request: &Request<Incoming>) -> bool {
    request
        .headers()
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

fn upgrade_websocket(state: Arc<WebState>, mut request: Request<Incoming>) -> Response<Body> {
    let Some(key) = request.headers().get(SEC_WEBSOCKET_KEY) else {
        return plain(StatusCode::BAD_REQUEST, "missing Sec-WebSocket-Key");
    };
    let accept = derive_accept_key(key.as_bytes());
    let on_upgrade = hyper::upgrade::on(&mut request);

    let session_state = Arc::clone(&state);
    state.runtime.tracker.spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                let socket = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
                run_session(socket, session_state).await;
            }
            Err(e) => warn!(error = %e, "websocket upgrade failed"),
        }
    });

    let mut response = Response::new(Body::default());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let headers = response.headers_mut();
    headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    if let Ok(value) = HeaderValue::from_str(&accept) {
        headers.insert(SEC_WEBSOCKET_ACCEPT, value);
    }
    response
}

/// Serve one websocket: announce the socket id, dispatch request frames,
/// forward result and event frames, release the id on exit.
async fn run_session<S>(socket: WebSocketStream<S>, state: Arc<WebState>)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let socket_id = Uuid::new_v4().to_string();
    let hub = Arc::clone(&state.runtime.hub);
    let (mut sink, mut stream) = socket.split();
    let (outbound, mut frames) = mpsc::unbounded_channel::<ServerFrame>();

    hub.register(&socket_id, outbound.clone());
    let _ = outbound.send(ServerFrame::connected(&socket_id));

    let writer = tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "failed to encode frame");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    loop {
        tokio::select! {
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientFrame>(&text) {
                    Ok(frame) => state.runtime.dispatch_websocket(&socket_id, frame, outbound.clone()),
                    Err(e) => {
                        let err = RemoteError::malformed_request(e.to_string());
                        let _ = outbound.send(ServerFrame::result(None, Err(err)));
                    }
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(socket_id = %socket_id, error = %e, "websocket read error");
                    break;
                }
            },
            () = state.cancel.cancelled() => break,
        }
    }

    hub.unregister(&socket_id);
    drop(outbound);
    // Pending workers hold senders; the writer drains what they send.
    if writer.await.is_err() {
        warn!(socket_id = %socket_id, "websocket writer failed");
    }
    debug!(socket_id = %socket_id, "websocket session ended");
}

fn into_response(response: HttpResponse) -> Response<Body> {
    let mut out = Response::new(Full::new(response.body));
    *out.status_mut() = response.status;
    *out.headers_mut() = response.headers;
    out
}

fn error_response(err: &RemoteError) -> Response<Body> {
    let body = serde_json::json!({ "error": err.exc_type, "message": err.message }).to_string();
    let mut out = Response::new(Full::new(Bytes::from(body)));
    *out.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    out.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    out
}

fn plain(status: StatusCode, message: &'static str) -> Response<Body> {
    let mut out = Response::new(Full::new(Bytes::from_static(message.as_bytes())));
    *out.status_mut() = status;
    out
}
