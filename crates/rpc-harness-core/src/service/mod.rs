//! The service framework the harness drives.
//!
//! This module provides:
//! - [`ServiceDefinition`] - a named set of rpc, http and websocket entrypoints
//! - [`ServiceContainer`] - one running instance of a definition
//! - [`ContainerFactory`] - the pluggable hosting runtime behind a container
//! - [`CallContext`] / [`WorkerHook`] / [`WorkerContextBuilder`] - what
//!   workers see and the extension points around them
//! - [`RpcClient`] - the test-side rpc proxy
//! - [`WebSocketHub`] - open websocket sockets of a container

pub mod container;
pub mod context;
pub mod definition;
pub mod factory;
pub mod hooks;
pub mod hub;
pub mod rpc;
mod web;
mod worker;

pub use container::{ContainerState, ServiceContainer};
pub use context::{CallContext, ServiceProxy};
pub use definition::{
    Capabilities, EntrypointKind, HandlerResult, HttpRequest, HttpResponse, HttpRoute, RoutePattern,
    ServiceDefinition,
};
pub use factory::{ContainerFactory, DefaultContainerFactory, DEFAULT_CONTAINER_KIND};
pub use hooks::{InheritContext, WorkerContextBuilder, WorkerHook};
pub use hub::WebSocketHub;
pub use rpc::RpcClient;

pub(crate) use container::ContainerEnv;
