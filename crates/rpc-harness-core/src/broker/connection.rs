//! Single connection to a [`MemoryBroker`](super::MemoryBroker) vhost.
//!
//! A connection declares exclusive queues, publishes to queues in its vhost
//! and shows up in the vhost's connection table until it is closed. Dropping
//! the connection closes it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{BrokerError, BrokerResult};

use super::memory::{QueueBinding, VirtualHost};
use super::{ConnectionRecord, Delivery};

/// An open connection to one vhost.
#[derive(Debug)]
pub struct BrokerConnection {
    id: u64,
    record: ConnectionRecord,
    host: Arc<VirtualHost>,
    closed: AtomicBool,
}

impl BrokerConnection {
    pub(crate) fn new(id: u64, record: ConnectionRecord, host: Arc<VirtualHost>) -> Self {
        Self {
            id,
            record,
            host,
            closed: AtomicBool::new(false),
        }
    }

    /// Broker-assigned connection name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.record.name
    }

    /// Vhost the connection is bound to.
    #[must_use]
    pub fn vhost(&self) -> &str {
        &self.host.name
    }

    /// The record the control plane reports for this connection.
    #[must_use]
    pub fn record(&self) -> &ConnectionRecord {
        &self.record
    }

    /// Whether [`close`](Self::close) has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Declare `queue` and become its only consumer.
    ///
    /// The returned stream ends when the queue is cancelled or the connection
    /// closes.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::QueueInUse`] if another consumer owns the queue,
    /// or [`BrokerError::ConnectionClosed`] after `close`.
    pub fn consume(&self, queue: &str) -> BrokerResult<mpsc::UnboundedReceiver<Delivery>> {
        self.ensure_open()?;

        let (sender, receiver) = mpsc::unbounded_channel();
        match self.host.queues.entry(queue.to_string()) {
            Entry::Occupied(_) => {
                return Err(BrokerError::QueueInUse {
                    queue: queue.to_string(),
                })
            }
            Entry::Vacant(slot) => {
                slot.insert(QueueBinding {
                    owner: self.id,
                    sender,
                });
            }
        }

        // Lost a race with close(): undo so the queue does not outlive us.
        if self.is_closed() {
            self.cancel(queue);
            return Err(BrokerError::ConnectionClosed(self.record.name.clone()));
        }

        debug!(connection = %self.record.name, queue = %queue, "consuming");
        Ok(receiver)
    }

    /// Stop consuming from `queue`. No-op if this connection does not own it.
    pub fn cancel(&self, queue: &str) {
        if self
            .host
            .queues
            .remove_if(queue, |_, binding| binding.owner == self.id)
            .is_some()
        {
            debug!(connection = %self.record.name, queue = %queue, "consumer cancelled");
        }
    }

    /// Publish `delivery` to `queue`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::NoSuchQueue`] if nothing consumes from the queue,
    /// or [`BrokerError::ConnectionClosed`] after `close`.
    pub fn publish(&self, queue: &str, delivery: Delivery) -> BrokerResult<()> {
        self.ensure_open()?;

        let sender = self
            .host
            .queues
            .get(queue)
            .map(|binding| binding.sender.clone())
            .ok_or_else(|| BrokerError::NoSuchQueue {
                queue: queue.to_string(),
            })?;

        sender.send(delivery).map_err(|_| BrokerError::NoSuchQueue {
            queue: queue.to_string(),
        })
    }

    /// Close the connection: drop its queues and leave the connection table.
    ///
    /// Returns `false` if the connection was already closed.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }

        self.host.queues.retain(|_, binding| binding.owner != self.id);
        self.host.connections.remove(&self.id);
        debug!(connection = %self.record.name, vhost = %self.host.name, "connection closed");
        true
    }

    fn ensure_open(&self) -> BrokerResult<()> {
        if self.is_closed() {
            return Err(BrokerError::ConnectionClosed(self.record.name.clone()));
        }
        Ok(())
    }
}

impl Drop for BrokerConnection {
    fn drop(&mut self) {
        self.close();
    }
}
