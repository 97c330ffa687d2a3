//! RPC Harness Core Library
//!
//! An integration-test harness for services that talk to each other over a
//! shared message broker. Each test gets an exclusively owned broker
//! namespace, starts containers hosting its service definitions, drives them
//! through real rpc, http and websocket calls, and tears everything down in a
//! fixed order that closes every connection before the namespace goes away.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`config`] - Configuration loading and validation
//! - [`error`] - Domain-specific error types
//! - [`broker`] - In-process broker, control-plane trait and management API client
//! - [`namespace`] - Per-test namespace provisioning
//! - [`inventory`] - Connection listing and leak checks
//! - [`call_id`] - Random and sequential call-id generators
//! - [`service`] - Service definitions and the containers hosting them
//! - [`lifecycle`] - Container and runner construction
//! - [`client`] - HTTP and websocket test clients
//! - [`harness`] - Test scopes and ordered teardown
//! - [`metrics`] - Prometheus metrics collection
//!
//! # Example
//!
//! ```rust,ignore
//! use rpc_harness_core::{Harness, ServiceDefinition};
//! use serde_json::json;
//!
//! let harness = Harness::builder().build()?;
//! harness
//!     .run(|scope| async move {
//!         let x = ServiceDefinition::new("x")
//!             .rpc("method", |_ctx, _args| async { Ok(json!("OK")) });
//!         let container = scope.container(x, scope.config().await?)?;
//!         container.start().await?;
//!
//!         let client = scope.rpc_client().await?;
//!         assert_eq!(client.call("x", "method", json!({})).await?, json!("OK"));
//!         Ok(())
//!     })
//!     .await?;
//! ```

#![forbid(unsafe_code)]

pub mod broker;
pub mod call_id;
pub mod client;
pub mod config;
pub mod error;
pub mod harness;
pub mod inventory;
pub mod lifecycle;
pub mod metrics;
pub mod namespace;
pub mod service;
pub mod wire;

/// Test utilities for integration testing.
///
/// This module is only available when compiling tests or when the `testing` feature is enabled.
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export commonly used types
pub use broker::{BrokerAdmin, BrokerConnection, ConnectionRecord, ManagementClient, MemoryBroker};
pub use call_id::{CallIdGenerator, CallIdSelector, CallIdStrategy};
pub use client::{WebSession, WebSocketClient, WebSocketHandle};
pub use config::{HarnessConfig, ServiceConfig};
pub use error::{BrokerError, ConfigError, HarnessError, LifecycleError, Result, RpcError};
pub use harness::{Harness, HarnessBuilder, Stage, TeardownReport, TestScope};
pub use inventory::ConnectionInventory;
pub use lifecycle::{FactoryRegistry, LifecycleManager, Runner};
pub use metrics::HarnessMetrics;
pub use namespace::{Namespace, NamespaceProvisioner};
pub use service::{
    CallContext, ContainerFactory, HttpRequest, HttpResponse, RpcClient, ServiceContainer, ServiceDefinition,
    WorkerHook,
};
pub use wire::RemoteError;
