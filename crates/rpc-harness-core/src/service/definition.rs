//! Service definitions: a name plus the entrypoints a container serves.
//!
//! ```rust,ignore
//! let x = ServiceDefinition::new("x")
//!     .rpc("method", |_ctx, _args| async { Ok(json!("OK")) })
//!     .http(Method::GET, "/foo", "do_get", |_ctx, _req| async {
//!         Ok(HttpResponse::text("OK"))
//!     });
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use hyper::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::LifecycleError;
use crate::wire::RemoteError;

use super::context::CallContext;
use super::hooks::WorkerHook;

/// Outcome of an rpc or websocket handler.
pub type HandlerResult = Result<Value, RemoteError>;

/// Boxed rpc / websocket handler.
pub type RpcHandler = Arc<dyn Fn(CallContext, Value) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Boxed http handler.
pub type HttpHandler =
    Arc<dyn Fn(CallContext, HttpRequest) -> BoxFuture<'static, Result<HttpResponse, RemoteError>> + Send + Sync>;

/// Kind of entrypoint that triggered a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntrypointKind {
    Rpc,
    Http,
    WebSocket,
}

impl EntrypointKind {
    /// Lowercase label, used in metrics and logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rpc => "rpc",
            Self::Http => "http",
            Self::WebSocket => "websocket",
        }
    }
}

impl fmt::Display for EntrypointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which kinds of entrypoint a service needs, or a container can host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    pub rpc: bool,
    pub http: bool,
    pub websocket: bool,
}

impl Capabilities {
    /// Everything.
    #[must_use]
    pub fn all() -> Self {
        Self {
            rpc: true,
            http: true,
            websocket: true,
        }
    }

    /// Only rpc.
    #[must_use]
    pub fn rpc_only() -> Self {
        Self {
            rpc: true,
            ..Self::default()
        }
    }

    /// First capability `self` requires that `offered` lacks.
    #[must_use]
    pub fn first_missing(&self, offered: &Self) -> Option<&'static str> {
        if self.rpc && !offered.rpc {
            Some("rpc")
        } else if self.http && !offered.http {
            Some("http")
        } else if self.websocket && !offered.websocket {
            Some("websocket")
        } else {
            None
        }
    }

    /// Whether a web listener is needed.
    #[must_use]
    pub fn needs_listener(&self) -> bool {
        self.http || self.websocket
    }
}

/// An incoming http request, as seen by a handler.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    /// Values captured by `<name>` route segments.
    pub params: BTreeMap<String, String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpRequest {
    /// Captured route parameter.
    #[must_use]
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// Body as UTF-8 text, lossy.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Body decoded as JSON.
    ///
    /// # Errors
    ///
    /// Returns a `MalformedRequest` remote error if decoding fails.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, RemoteError> {
        serde_json::from_slice(&self.body).map_err(|e| RemoteError::malformed_request(e.to_string()))
    }
}

/// A handler's http response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpResponse {
    /// Response with `status` and an empty body.
    #[must_use]
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// `200 OK` with a plain text body.
    pub fn text(body: impl Into<String>) -> Self {
        Self::new(StatusCode::OK)
            .with_body(body.into())
            .with_header(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"))
    }

    /// `200 OK` with a JSON body.
    #[must_use]
    pub fn json(value: &Value) -> Self {
        Self::new(StatusCode::OK)
            .with_body(value.to_string())
            .with_header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
    }

    /// Replace the status.
    #[must_use]
    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    /// Replace the body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Set a header.
    #[must_use]
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }
}

/// Path pattern of an http route; `<name>` segments capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePattern {
    raw: String,
    segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

impl RoutePattern {
    /// Parse a pattern like `/items/<id>`.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let segments = split_path(raw)
            .map(|segment| {
                match segment.strip_prefix('<').and_then(|s| s.strip_suffix('>')) {
                    Some(name) if !name.is_empty() => Segment::Param(name.to_string()),
                    _ => Segment::Literal(segment.to_string()),
                }
            })
            .collect();
        Self {
            raw: raw.to_string(),
            segments,
        }
    }

    /// The pattern as written.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Match `path`, returning the captured parameters.
    #[must_use]
    pub fn matches(&self, path: &str) -> Option<BTreeMap<String, String>> {
        let mut params = BTreeMap::new();
        let mut parts = split_path(path);
        for segment in &self.segments {
            let part = parts.next()?;
            match segment {
                Segment::Literal(literal) if literal == part => {}
                Segment::Literal(_) => return None,
                Segment::Param(name) => {
                    params.insert(name.clone(), part.to_string());
                }
            }
        }
        if parts.next().is_some() {
            return None;
        }
        Some(params)
    }
}

fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|segment| !segment.is_empty())
}

/// One http entrypoint.
#[derive(Clone)]
pub struct HttpRoute {
    pub method: Method,
    pub pattern: RoutePattern,
    /// Method name used for call ids.
    pub name: String,
    pub(crate) handler: HttpHandler,
}

impl fmt::Debug for HttpRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpRoute")
            .field("method", &self.method)
            .field("pattern", &self.pattern.as_str())
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// A service: unique name plus entrypoints and worker hooks.
#[derive(Clone)]
pub struct ServiceDefinition {
    name: String,
    rpc: BTreeMap<String, RpcHandler>,
    websocket: BTreeMap<String, RpcHandler>,
    http: Vec<HttpRoute>,
    hooks: Vec<Arc<dyn WorkerHook>>,
}

impl ServiceDefinition {
    /// Start a definition for service `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rpc: BTreeMap::new(),
            websocket: BTreeMap::new(),
            http: Vec::new(),
            hooks: Vec::new(),
        }
    }

    /// Add a remote-callable method.
    #[must_use]
    pub fn rpc<F, Fut>(mut self, method: impl Into<String>, handler: F) -> Self
    where
        F: Fn(CallContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.rpc.insert(method.into(), box_rpc(handler));
        self
    }

    /// Add a method callable over the websocket endpoint.
    #[must_use]
    pub fn websocket_rpc<F, Fut>(mut self, method: impl Into<String>, handler: F) -> Self
    where
        F: Fn(CallContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.websocket.insert(method.into(), box_rpc(handler));
        self
    }

    /// Add an http route. `name` identifies the handler in call ids.
    #[must_use]
    pub fn http<F, Fut>(mut self, method: Method, path: &str, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(CallContext, HttpRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HttpResponse, RemoteError>> + Send + 'static,
    {
        let handler: HttpHandler = Arc::new(move |ctx, req| handler(ctx, req).boxed());
        self.http.push(HttpRoute {
            method,
            pattern: RoutePattern::parse(path),
            name: name.into(),
            handler,
        });
        self
    }

    /// Attach a worker hook.
    #[must_use]
    pub fn with_hook(mut self, hook: impl WorkerHook + 'static) -> Self {
        self.hooks.push(Arc::new(hook));
        self
    }

    /// Attach a shared worker hook.
    #[must_use]
    pub fn with_shared_hook(mut self, hook: Arc<dyn WorkerHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Service name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Names of the rpc methods.
    pub fn rpc_methods(&self) -> impl Iterator<Item = &str> {
        self.rpc.keys().map(String::as_str)
    }

    /// Names of the websocket methods.
    pub fn websocket_methods(&self) -> impl Iterator<Item = &str> {
        self.websocket.keys().map(String::as_str)
    }

    /// The http routes, in registration order.
    #[must_use]
    pub fn http_routes(&self) -> &[HttpRoute] {
        &self.http
    }

    pub(crate) fn rpc_handler(&self, method: &str) -> Option<&RpcHandler> {
        self.rpc.get(method)
    }

    pub(crate) fn websocket_handler(&self, method: &str) -> Option<&RpcHandler> {
        self.websocket.get(method)
    }

    pub(crate) fn hooks(&self) -> &[Arc<dyn WorkerHook>] {
        &self.hooks
    }

    /// Entrypoint kinds this service needs from its container.
    #[must_use]
    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            rpc: !self.rpc.is_empty(),
            http: !self.http.is_empty(),
            websocket: !self.websocket.is_empty(),
        }
    }

    /// Check the definition can be hosted.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::InvalidService`] if the name is empty or
    /// contains `.` or whitespace, if there are no entrypoints, or if a route
    /// path does not start with `/`.
    pub fn validate(&self) -> Result<(), LifecycleError> {
        let invalid = |reason: &str| LifecycleError::InvalidService {
            service: self.name.clone(),
            reason: reason.to_string(),
        };

        if self.name.is_empty() {
            return Err(invalid("service name is empty"));
        }
        if self.name.contains('.') || self.name.chars().any(char::is_whitespace) {
            return Err(invalid("service name must not contain '.' or whitespace"));
        }
        if self.rpc.is_empty() && self.http.is_empty() && self.websocket.is_empty() {
            return Err(invalid("service exposes no entrypoints"));
        }
        if let Some(route) = self.http.iter().find(|r| !r.pattern.as_str().starts_with('/')) {
            return Err(invalid(&format!(
                "route '{}' must start with '/'",
                route.pattern.as_str()
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for ServiceDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceDefinition")
            .field("name", &self.name)
            .field("rpc", &self.rpc.keys().collect::<Vec<_>>())
            .field("websocket", &self.websocket.keys().collect::<Vec<_>>())
            .field("http", &self.http)
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

fn box_rpc<F, Fut>(handler: F) -> RpcHandler
where
    F: Fn(CallContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |ctx, args| handler(ctx, args).boxed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ok_rpc(name: &str) -> ServiceDefinition {
        ServiceDefinition::new(name).rpc("method", |_ctx, _args| async { Ok(json!("OK")) })
    }

    #[test]
    fn test_route_pattern_captures_params() {
        let pattern = RoutePattern::parse("/items/<id>/tags/<tag>");
        let params = pattern.matches("/items/42/tags/blue").unwrap();
        assert_eq!(params["id"], "42");
        assert_eq!(params["tag"], "blue");
        assert!(pattern.matches("/items/42").is_none());
        assert!(pattern.matches("/items/42/tags/blue/extra").is_none());
        assert!(pattern.matches("/other/42/tags/blue").is_none());
    }

    #[test]
    fn test_route_pattern_literal_root() {
        let pattern = RoutePattern::parse("/foo");
        assert_eq!(pattern.matches("/foo"), Some(BTreeMap::new()));
        assert_eq!(pattern.matches("/foo/"), Some(BTreeMap::new()));
        assert!(pattern.matches("/bar").is_none());
    }

    #[test]
    fn test_capabilities_follow_entrypoints() {
        let def = ok_rpc("x").http(Method::GET, "/foo", "get_foo", |_c, _r| async {
            Ok(HttpResponse::text("OK"))
        });
        let caps = def.capabilities();
        assert!(caps.rpc && caps.http && !caps.websocket);
        assert!(caps.needs_listener());
        assert_eq!(caps.first_missing(&Capabilities::rpc_only()), Some("http"));
        assert_eq!(caps.first_missing(&Capabilities::all()), None);
    }

    #[test]
    fn test_validate_rejects_bad_names() {
        assert!(ok_rpc("x").validate().is_ok());
        assert!(ok_rpc("").validate().is_err());
        assert!(ok_rpc("a.b").validate().is_err());
        assert!(ok_rpc("a b").validate().is_err());
    }

    #[test]
    fn test_validate_requires_entrypoint() {
        let err = ServiceDefinition::new("empty").validate().unwrap_err();
        assert!(err.to_string().contains("no entrypoints"));
    }

    #[test]
    fn test_validate_route_paths() {
        let def = ServiceDefinition::new("web").http(Method::GET, "foo", "get", |_c, _r| async {
            Ok(HttpResponse::text("OK"))
        });
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_http_response_helpers() {
        let response = HttpResponse::json(&json!({"a": 1})).with_status(StatusCode::CREATED);
        assert_eq!(response.status, StatusCode::CREATED);
        assert_eq!(response.headers[CONTENT_TYPE], "application/json");
        assert_eq!(&response.body[..], br#"{"a":1}"#);
    }
}
