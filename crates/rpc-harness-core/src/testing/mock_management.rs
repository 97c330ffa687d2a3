//! Mock management API for testing [`ManagementClient`](crate::broker::ManagementClient).
//!
//! A small hyper server that:
//! - Records every request (method, raw path, authorization header, body)
//! - Emulates the vhost, permission and connection endpoints in memory
//! - Can be told to fail the next request with a given status

use std::collections::{BTreeMap, BTreeSet};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{AUTHORIZATION, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Mutex};

/// A recorded management request.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    /// HTTP method, upper case.
    pub method: String,
    /// Raw (still percent-encoded) request path.
    pub path: String,
    /// `Authorization` header, if any.
    pub authorization: Option<String>,
    /// Request body.
    pub body: Bytes,
}

#[derive(Debug, Clone)]
struct MockConnection {
    name: String,
    user: String,
    client: Option<String>,
}

#[derive(Debug, Default)]
struct MockState {
    vhosts: BTreeMap<String, Vec<MockConnection>>,
    permissions: BTreeSet<(String, String)>,
    requests: Vec<RecordedRequest>,
    fail_next: Option<u16>,
}

/// In-memory management API.
pub struct MockManagementApi {
    address: SocketAddr,
    state: Arc<Mutex<MockState>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl MockManagementApi {
    /// Bind to an ephemeral loopback port and start serving.
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails.
    pub async fn start() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?;
        let state = Arc::new(Mutex::new(MockState::default()));
        let (shutdown_tx, _) = broadcast::channel::<()>(1);

        let accept_state = Arc::clone(&state);
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    result = listener.accept() => {
                        let Ok((stream, _peer)) = result else { break };
                        let state = Arc::clone(&accept_state);
                        tokio::spawn(async move {
                            let service = service_fn(move |request| {
                                let state = Arc::clone(&state);
                                async move { Ok::<_, Infallible>(handle(state, request).await) }
                            });
                            let _ = http1::Builder::new()
                                .serve_connection(TokioIo::new(stream), service)
                                .await;
                        });
                    }
                }
            }
        });

        Ok(Self {
            address,
            state,
            shutdown_tx,
        })
    }

    /// `http://127.0.0.1:<port>`.
    #[must_use]
    pub fn base_uri(&self) -> String {
        format!("http://{}", self.address)
    }

    /// Every request received so far.
    pub async fn requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().await.requests.clone()
    }

    /// Known vhosts, sorted.
    pub async fn vhosts(&self) -> Vec<String> {
        self.state.lock().await.vhosts.keys().cloned().collect()
    }

    /// Whether `user` was granted permissions on `vhost`.
    pub async fn has_permission(&self, vhost: &str, user: &str) -> bool {
        self.state
            .lock()
            .await
            .permissions
            .contains(&(vhost.to_string(), user.to_string()))
    }

    /// Pretend a client holds a connection in `vhost`, creating the vhost if
    /// needed.
    pub async fn add_connection(&self, vhost: &str, name: &str, user: &str, client: Option<&str>) {
        self.state
            .lock()
            .await
            .vhosts
            .entry(vhost.to_string())
            .or_default()
            .push(MockConnection {
                name: name.to_string(),
                user: user.to_string(),
                client: client.map(str::to_string),
            });
    }

    /// Drop every connection named `name`.
    pub async fn remove_connection(&self, name: &str) {
        for connections in self.state.lock().await.vhosts.values_mut() {
            connections.retain(|c| c.name != name);
        }
    }

    /// Answer the next request with `status` instead of handling it.
    pub async fn fail_next(&self, status: u16) {
        self.state.lock().await.fail_next = Some(status);
    }

    /// Stop accepting connections.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

impl Drop for MockManagementApi {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn handle(state: Arc<Mutex<MockState>>, request: Request<Incoming>) -> Response<Full<Bytes>> {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let authorization = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = match request.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => Bytes::new(),
    };

    let mut state = state.lock().await;
    state.requests.push(RecordedRequest {
        method: method.to_string(),
        path: path.clone(),
        authorization: authorization.clone(),
        body,
    });

    if let Some(status) = state.fail_next.take() {
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        return reply(status, json!({ "error": "injected failure" }));
    }
    if !authorization.is_some_and(|v| v.starts_with("Basic ")) {
        return reply(StatusCode::UNAUTHORIZED, json!({ "error": "not_authorised" }));
    }

    let segments: Vec<String> = path
        .trim_start_matches('/')
        .split('/')
        .map(percent_decode)
        .collect();
    let segments: Vec<&str> = segments.iter().map(String::as_str).collect();

    match (method.as_str(), segments.as_slice()) {
        ("GET", ["api", "vhosts"]) => {
            let names: Vec<Value> = state
                .vhosts
                .keys()
                .map(|name| json!({ "name": name }))
                .collect();
            reply(StatusCode::OK, Value::Array(names))
        }
        ("PUT", ["api", "vhosts", vhost]) => {
            let created = !state.vhosts.contains_key(*vhost);
            state.vhosts.entry((*vhost).to_string()).or_default();
            if created {
                empty(StatusCode::CREATED)
            } else {
                empty(StatusCode::NO_CONTENT)
            }
        }
        ("DELETE", ["api", "vhosts", vhost]) => {
            if state.vhosts.remove(*vhost).is_none() {
                return not_found();
            }
            state.permissions.retain(|(v, _)| v != vhost);
            empty(StatusCode::NO_CONTENT)
        }
        ("GET", ["api", "vhosts", vhost, "connections"]) => match state.vhosts.get(*vhost) {
            Some(connections) => {
                let listed: Vec<Value> = connections
                    .iter()
                    .map(|c| {
                        json!({
                            "name": c.name,
                            "vhost": vhost,
                            "user": c.user,
                            "client_properties": { "connection_name": c.client },
                        })
                    })
                    .collect();
                reply(StatusCode::OK, Value::Array(listed))
            }
            None => not_found(),
        },
        ("PUT", ["api", "permissions", vhost, user]) => {
            if !state.vhosts.contains_key(*vhost) {
                return not_found();
            }
            state
                .permissions
                .insert(((*vhost).to_string(), (*user).to_string()));
            empty(StatusCode::CREATED)
        }
        _ => not_found(),
    }
}

fn reply(status: StatusCode, body: Value) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}

fn empty(status: StatusCode) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}

fn not_found() -> Response<Full<Bytes>> {
    reply(StatusCode::NOT_FOUND, json!({ "error": "Object Not Found", "reason": "Not Found" }))
}

/// Decode `%XX` escapes; malformed escapes are kept as-is.
fn percent_decode(segment: &str) -> String {
    let bytes = segment.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(value) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(value);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
