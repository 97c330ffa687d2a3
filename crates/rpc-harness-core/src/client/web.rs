//! HTTP session bound to a container's listener.

use std::net::SocketAddr;

use reqwest::{Client, Method, RequestBuilder};

use crate::error::Result;

/// HTTP client pre-configured with a container's base address.
///
/// No retries and no connection reuse: every request opens a fresh
/// connection, so a stopped container shows up as a connect error from
/// `send()` rather than a stale pooled socket.
#[derive(Debug, Clone)]
pub struct WebSession {
    client: Client,
    base_url: String,
}

impl WebSession {
    /// Session for the listener at `address`.
    ///
    /// # Errors
    ///
    /// Fails if the underlying http client cannot be built.
    pub fn new(address: SocketAddr) -> Result<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(0)
            .no_proxy()
            .build()?;
        Ok(Self {
            client,
            base_url: format!("http://{address}"),
        })
    }

    /// `http://<host>:<port>` of the container.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Absolute url for a relative `path`.
    #[must_use]
    pub fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{path}", self.base_url)
        } else {
            format!("{}/{path}", self.base_url)
        }
    }

    /// Request with an arbitrary method.
    #[must_use]
    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client.request(method, self.url(path))
    }

    /// `GET path`.
    #[must_use]
    pub fn get(&self, path: &str) -> RequestBuilder {
        self.request(Method::GET, path)
    }

    /// `POST path`.
    #[must_use]
    pub fn post(&self, path: &str) -> RequestBuilder {
        self.request(Method::POST, path)
    }

    /// `PUT path`.
    #[must_use]
    pub fn put(&self, path: &str) -> RequestBuilder {
        self.request(Method::PUT, path)
    }

    /// `DELETE path`.
    #[must_use]
    pub fn delete(&self, path: &str) -> RequestBuilder {
        self.request(Method::DELETE, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_joins_relative_paths() {
        let session = WebSession::new("127.0.0.1:8080".parse().unwrap()).unwrap();
        assert_eq!(session.base_url(), "http://127.0.0.1:8080");
        assert_eq!(session.url("/foo"), "http://127.0.0.1:8080/foo");
        assert_eq!(session.url("foo?x=1"), "http://127.0.0.1:8080/foo?x=1");
    }

    #[tokio::test]
    async fn test_closed_port_is_a_transport_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);

        let session = WebSession::new(address).unwrap();
        let err = session.get("/foo").send().await.unwrap_err();
        assert!(err.is_connect());
    }
}
