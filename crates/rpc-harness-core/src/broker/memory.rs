//! In-process broker.
//!
//! Holds named vhosts, each with a table of open connections and a table of
//! exclusively consumed queues. Every queue has exactly one consumer: the
//! connection that declared it. Closing that connection removes the queue and
//! ends the consumer's stream.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::{BrokerError, BrokerResult};

use super::connection::BrokerConnection;
use super::{BrokerAdmin, ConnectionRecord, Delivery};

/// A vhost: open connections and the queues they consume.
#[derive(Debug)]
pub(crate) struct VirtualHost {
    pub(crate) name: String,
    pub(crate) connections: DashMap<u64, ConnectionRecord>,
    pub(crate) queues: DashMap<String, QueueBinding>,
}

/// The consumer side of a queue.
#[derive(Debug)]
pub(crate) struct QueueBinding {
    pub(crate) owner: u64,
    pub(crate) sender: mpsc::UnboundedSender<Delivery>,
}

impl VirtualHost {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            connections: DashMap::new(),
            queues: DashMap::new(),
        }
    }

    fn records(&self) -> Vec<ConnectionRecord> {
        let mut records: Vec<_> = self
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }
}

/// In-process broker with vhost isolation.
#[derive(Debug)]
pub struct MemoryBroker {
    name: String,
    vhosts: DashMap<String, Arc<VirtualHost>>,
    next_connection_id: AtomicU64,
}

impl MemoryBroker {
    /// Create a broker. `name` becomes the host part of its URIs.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            vhosts: DashMap::new(),
            next_connection_id: AtomicU64::new(1),
        })
    }

    /// Broker name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Open a connection to `vhost`.
    ///
    /// `client` is recorded as the connection's self-reported name.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::UnknownVhost`] if the vhost does not exist.
    pub fn connect(&self, vhost: &str, user: &str, client: Option<&str>) -> BrokerResult<BrokerConnection> {
        // The shard guard is held while registering so a concurrent delete
        // cannot remove the vhost between lookup and insert.
        let host = self
            .vhosts
            .get(vhost)
            .ok_or_else(|| BrokerError::UnknownVhost(vhost.to_string()))?;

        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let record = ConnectionRecord {
            name: format!("{}/conn-{id}", self.name),
            vhost: vhost.to_string(),
            user: user.to_string(),
            client: client.map(str::to_string),
        };
        host.connections.insert(id, record.clone());
        let host = Arc::clone(host.value());

        debug!(vhost = %vhost, connection = %record.name, "connection opened");
        Ok(BrokerConnection::new(id, record, host))
    }

    /// Whether `vhost` exists.
    #[must_use]
    pub fn has_vhost(&self, vhost: &str) -> bool {
        self.vhosts.contains_key(vhost)
    }

    /// Number of connections open against `vhost`, zero if it does not exist.
    #[must_use]
    pub fn connection_count(&self, vhost: &str) -> usize {
        self.vhosts
            .get(vhost)
            .map_or(0, |host| host.connections.len())
    }

    /// Whether anything consumes from `queue` in `vhost`.
    #[must_use]
    pub fn has_consumer(&self, vhost: &str, queue: &str) -> bool {
        self.vhosts
            .get(vhost)
            .is_some_and(|host| host.queues.contains_key(queue))
    }
}

#[async_trait]
impl BrokerAdmin for MemoryBroker {
    async fn create_vhost(&self, vhost: &str) -> BrokerResult<()> {
        self.vhosts
            .entry(vhost.to_string())
            .or_insert_with(|| Arc::new(VirtualHost::new(vhost)));
        info!(broker = %self.name, vhost = %vhost, "vhost created");
        Ok(())
    }

    async fn delete_vhost(&self, vhost: &str) -> BrokerResult<()> {
        if self
            .vhosts
            .remove_if(vhost, |_, host| host.connections.is_empty())
            .is_some()
        {
            info!(broker = %self.name, vhost = %vhost, "vhost deleted");
            return Ok(());
        }

        match self.vhosts.get(vhost) {
            Some(host) => Err(BrokerError::VhostBusy {
                vhost: host.name.clone(),
                connections: host.connections.len(),
            }),
            None => Err(BrokerError::UnknownVhost(vhost.to_string())),
        }
    }

    async fn list_vhosts(&self) -> BrokerResult<Vec<String>> {
        let mut names: Vec<_> = self.vhosts.iter().map(|e| e.key().clone()).collect();
        names.sort();
        Ok(names)
    }

    async fn list_connections(&self, vhost: &str) -> BrokerResult<Vec<ConnectionRecord>> {
        self.vhosts
            .get(vhost)
            .map(|host| host.records())
            .ok_or_else(|| BrokerError::UnknownVhost(vhost.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_requires_vhost() {
        let broker = MemoryBroker::new("localhost");
        let err = broker.connect("missing", "guest", None).unwrap_err();
        assert_eq!(err, BrokerError::UnknownVhost("missing".to_string()));
    }

    #[tokio::test]
    async fn test_connections_are_listed_until_closed() {
        let broker = MemoryBroker::new("localhost");
        broker.create_vhost("ns").await.unwrap();

        let conn = broker.connect("ns", "guest", Some("client-a")).unwrap();
        let records = broker.list_connections("ns").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].client.as_deref(), Some("client-a"));
        assert_eq!(records[0].user, "guest");

        conn.close();
        assert!(broker.list_connections("ns").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_refuses_busy_vhost() {
        let broker = MemoryBroker::new("localhost");
        broker.create_vhost("ns").await.unwrap();
        let conn = broker.connect("ns", "guest", None).unwrap();

        let err = broker.delete_vhost("ns").await.unwrap_err();
        assert_eq!(
            err,
            BrokerError::VhostBusy {
                vhost: "ns".to_string(),
                connections: 1
            }
        );

        drop(conn);
        broker.delete_vhost("ns").await.unwrap();
        assert!(!broker.has_vhost("ns"));
    }

    #[tokio::test]
    async fn test_delete_unknown_vhost() {
        let broker = MemoryBroker::new("localhost");
        let err = broker.delete_vhost("nope").await.unwrap_err();
        assert!(matches!(err, BrokerError::UnknownVhost(_)));
    }

    #[tokio::test]
    async fn test_vhosts_are_isolated() {
        let broker = MemoryBroker::new("localhost");
        broker.create_vhost("a").await.unwrap();
        broker.create_vhost("b").await.unwrap();

        let in_a = broker.connect("a", "guest", None).unwrap();
        let in_b = broker.connect("b", "guest", None).unwrap();
        let _rx = in_a.consume("rpc-x").unwrap();

        let err = in_b.publish("rpc-x", Delivery::new("hi")).unwrap_err();
        assert!(matches!(err, BrokerError::NoSuchQueue { .. }));
        assert!(broker.has_consumer("a", "rpc-x"));
        assert!(!broker.has_consumer("b", "rpc-x"));
        assert_eq!(broker.list_vhosts().await.unwrap(), vec!["a", "b"]);
    }
}
