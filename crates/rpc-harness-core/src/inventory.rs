//! Connection inventory: what is still open against a namespace.
//!
//! A read-only view over [`BrokerAdmin::list_connections`]. Brokers may
//! report a just-closed connection for a short while, so strict checks poll
//! with [`ConnectionInventory::assert_drained`] instead of failing on the
//! first non-empty answer.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::broker::{BrokerAdmin, ConnectionRecord};
use crate::error::{HarnessError, Result};
use crate::namespace::Namespace;

/// Read-only connection queries, safe to share between tests.
#[derive(Debug, Clone)]
pub struct ConnectionInventory {
    admin: Arc<dyn BrokerAdmin>,
}

impl ConnectionInventory {
    /// Create an inventory over `admin`.
    #[must_use]
    pub fn new(admin: Arc<dyn BrokerAdmin>) -> Self {
        Self { admin }
    }

    /// Connections currently open against `namespace`.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Broker`] if the query fails.
    pub async fn list_connections(&self, namespace: &Namespace) -> Result<Vec<ConnectionRecord>> {
        Ok(self.admin.list_connections(namespace.name()).await?)
    }

    /// Poll until `namespace` has no open connections.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::NamespaceBusy`] if connections remain after
    /// `timeout`.
    pub async fn assert_drained(
        &self,
        namespace: &Namespace,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;

        loop {
            let open = self.list_connections(namespace).await?;
            if open.is_empty() {
                debug!(namespace = %namespace, "no open connections");
                return Ok(());
            }

            if Instant::now() >= deadline {
                for record in &open {
                    warn!(namespace = %namespace, connection = %record, "leaked connection");
                }
                return Err(HarnessError::NamespaceBusy {
                    namespace: namespace.name().to_string(),
                    connections: open.len(),
                });
            }

            tokio::time::sleep(poll_interval).await;
        }
    }
}
