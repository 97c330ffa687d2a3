//! Broker access.
//!
//! This module provides:
//! - [`BrokerAdmin`], the narrow control plane the harness needs (vhosts and
//!   the connections open against them)
//! - [`MemoryBroker`], an in-process broker with vhost-scoped queues and a
//!   live connection table
//! - [`BrokerConnection`], one client connection to a [`MemoryBroker`] vhost
//! - [`ManagementClient`], the same control plane over a RabbitMQ-style
//!   management HTTP API

pub mod connection;
pub mod management;
pub mod memory;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::BrokerResult;

pub use connection::BrokerConnection;
pub use management::ManagementClient;
pub use memory::MemoryBroker;

/// Name of the queue a service consumes rpc requests from.
#[must_use]
pub fn rpc_queue(service: &str) -> String {
    format!("rpc-{service}")
}

/// Name of a fresh private reply queue.
#[must_use]
pub fn reply_queue() -> String {
    format!("rpc.reply-{}", uuid::Uuid::new_v4())
}

/// Administrative operations on a broker.
///
/// Identifiers are plain strings. Implementations report failures as
/// [`BrokerError`](crate::error::BrokerError); callers decide which of them
/// are fatal.
#[async_trait]
pub trait BrokerAdmin: Send + Sync + fmt::Debug {
    /// Create a vhost. Creating an existing vhost succeeds.
    async fn create_vhost(&self, vhost: &str) -> BrokerResult<()>;

    /// Delete a vhost.
    async fn delete_vhost(&self, vhost: &str) -> BrokerResult<()>;

    /// Names of all vhosts.
    async fn list_vhosts(&self) -> BrokerResult<Vec<String>>;

    /// Connections currently open against `vhost`.
    async fn list_connections(&self, vhost: &str) -> BrokerResult<Vec<ConnectionRecord>>;
}

/// One open broker connection, as reported by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    /// Broker-assigned connection name.
    pub name: String,
    /// Vhost the connection is bound to.
    pub vhost: String,
    /// Authenticated user.
    pub user: String,
    /// Name the client gave itself, if any.
    #[serde(default)]
    pub client: Option<String>,
}

impl fmt::Display for ConnectionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}@{})", self.name, self.user, self.vhost)?;
        if let Some(client) = &self.client {
            write!(f, " [{client}]")?;
        }
        Ok(())
    }
}

/// A message delivered to a queue consumer.
#[derive(Debug, Clone, Default)]
pub struct Delivery {
    /// Correlates a reply with its request.
    pub correlation_id: Option<String>,
    /// Queue the consumer should reply to.
    pub reply_to: Option<String>,
    /// Free-form message headers.
    pub headers: BTreeMap<String, String>,
    /// Message payload.
    pub body: Bytes,
}

impl Delivery {
    /// A delivery carrying `body` and nothing else.
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            ..Self::default()
        }
    }

    /// Set the correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Set the reply queue.
    #[must_use]
    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_names() {
        assert_eq!(rpc_queue("x"), "rpc-x");
        let reply = reply_queue();
        assert!(reply.starts_with("rpc.reply-"));
        assert_ne!(reply, reply_queue());
    }

    #[test]
    fn test_connection_record_display() {
        let record = ConnectionRecord {
            name: "conn-1".to_string(),
            vhost: "ns".to_string(),
            user: "guest".to_string(),
            client: Some("x-container".to_string()),
        };
        assert_eq!(record.to_string(), "conn-1 (guest@ns) [x-container]");
    }
}
