//! Test-side clients for web-capable containers.
//!
//! - [`WebSession`] - relative-path http requests against a container's
//!   bound address
//! - [`WebSocketClient`] / [`WebSocketHandle`] - rpc over the websocket
//!   endpoint with per-call correlation

pub mod web;
pub mod websocket;

pub use web::WebSession;
pub use websocket::{WebSocketClient, WebSocketHandle};
