//! Per-test broker namespaces.
//!
//! A namespace is a vhost created fresh for one test and deleted at teardown.
//! Creation failures are fatal. Deletion retries with bounded exponential
//! backoff while connections linger and then reports the namespace as busy.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::broker::BrokerAdmin;
use crate::config::NamespaceConfig;
use crate::error::{BrokerError, HarnessError, Result};

/// Handle to an isolated broker namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Namespace {
    name: String,
}

impl Namespace {
    /// Wrap an existing namespace name.
    pub fn from_name(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Namespace name (the vhost).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl AsRef<str> for Namespace {
    fn as_ref(&self) -> &str {
        &self.name
    }
}

/// Creates and deletes namespaces through a [`BrokerAdmin`].
#[derive(Debug, Clone)]
pub struct NamespaceProvisioner {
    admin: Arc<dyn BrokerAdmin>,
    config: NamespaceConfig,
}

impl NamespaceProvisioner {
    /// Create a provisioner.
    #[must_use]
    pub fn new(admin: Arc<dyn BrokerAdmin>, config: NamespaceConfig) -> Self {
        Self { admin, config }
    }

    /// The control plane in use.
    #[must_use]
    pub fn admin(&self) -> &Arc<dyn BrokerAdmin> {
        &self.admin
    }

    /// Prefix of generated namespace names.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.config.prefix
    }

    /// Allocate a namespace named `<prefix>-<uuid>`.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Provisioning`] on any broker failure. Not
    /// retried.
    #[instrument(skip(self), fields(prefix = %self.config.prefix))]
    pub async fn create(&self) -> Result<Namespace> {
        let name = format!("{}-{}", self.config.prefix, Uuid::new_v4().simple());
        self.admin
            .create_vhost(&name)
            .await
            .map_err(|source| HarnessError::Provisioning {
                namespace: name.clone(),
                source,
            })?;

        info!(namespace = %name, "namespace provisioned");
        Ok(Namespace { name })
    }

    /// Delete `namespace`, waiting out lingering connections.
    ///
    /// Each attempt first asks the broker for open connections and only
    /// deletes when there are none. Between attempts the backoff doubles up to
    /// `max_delete_backoff_ms`. A namespace that is already gone counts as
    /// deleted.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::NamespaceBusy`] once the retry budget is spent,
    /// or [`HarnessError::Broker`] for any other broker failure.
    #[instrument(skip(self), fields(namespace = %namespace))]
    pub async fn delete(&self, namespace: &Namespace) -> Result<()> {
        let mut backoff = self.config.delete_backoff();
        let mut open = 0;

        for attempt in 0..=self.config.delete_retries {
            match self.try_delete(namespace).await {
                Ok(()) => {
                    info!(attempt, "namespace deleted");
                    return Ok(());
                }
                Err(BrokerError::UnknownVhost(_)) => {
                    debug!("namespace already gone");
                    return Ok(());
                }
                Err(BrokerError::VhostBusy { connections, .. }) => {
                    open = connections;
                }
                Err(other) => return Err(other.into()),
            }

            if attempt < self.config.delete_retries {
                debug!(attempt, open, backoff_ms = backoff.as_millis() as u64, "namespace busy, retrying");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(self.config.max_delete_backoff());
            }
        }

        warn!(connections = open, "namespace still busy after retries");
        Err(HarnessError::NamespaceBusy {
            namespace: namespace.name.clone(),
            connections: open,
        })
    }

    async fn try_delete(&self, namespace: &Namespace) -> std::result::Result<(), BrokerError> {
        let connections = self.admin.list_connections(&namespace.name).await?;
        if !connections.is_empty() {
            return Err(BrokerError::VhostBusy {
                vhost: namespace.name.clone(),
                connections: connections.len(),
            });
        }
        self.admin.delete_vhost(&namespace.name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use async_trait::async_trait;
    use crate::broker::ConnectionRecord;
    use crate::error::BrokerResult;

    fn fast_config() -> NamespaceConfig {
        NamespaceConfig {
            delete_retries: 3,
            delete_backoff_ms: 1,
            max_delete_backoff_ms: 4,
            ..NamespaceConfig::default()
        }
    }

    #[tokio::test]
    async fn test_create_uses_prefix_and_is_unique() {
        let broker = MemoryBroker::new("localhost");
        let provisioner = NamespaceProvisioner::new(broker.clone(), fast_config());

        let a = provisioner.create().await.unwrap();
        let b = provisioner.create().await.unwrap();
        assert!(a.name().starts_with("rpc-test-"));
        assert_ne!(a, b);
        assert!(broker.has_vhost(a.name()));
    }

    #[tokio::test]
    async fn test_delete_empty_namespace() {
        let broker = MemoryBroker::new("localhost");
        let provisioner = NamespaceProvisioner::new(broker.clone(), fast_config());
        let ns = provisioner.create().await.unwrap();

        provisioner.delete(&ns).await.unwrap();
        assert!(!broker.has_vhost(ns.name()));
        // Second delete is a no-op.
        provisioner.delete(&ns).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_busy_namespace_fails_after_retries() {
        let broker = MemoryBroker::new("localhost");
        let provisioner = NamespaceProvisioner::new(broker.clone(), fast_config());
        let ns = provisioner.create().await.unwrap();
        let _conn = broker.connect(ns.name(), "guest", None).unwrap();

        let err = provisioner.delete(&ns).await.unwrap_err();
        assert!(matches!(
            err,
            HarnessError::NamespaceBusy { connections: 1, .. }
        ));
        assert!(broker.has_vhost(ns.name()));
    }

    #[tokio::test]
    async fn test_delete_succeeds_once_connection_closes() {
        let broker = MemoryBroker::new("localhost");
        let provisioner = NamespaceProvisioner::new(
            broker.clone(),
            NamespaceConfig {
                delete_retries: 10,
                delete_backoff_ms: 5,
                max_delete_backoff_ms: 20,
                ..NamespaceConfig::default()
            },
        );
        let ns = provisioner.create().await.unwrap();
        let conn = broker.connect(ns.name(), "guest", None).unwrap();

        let closer = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(15)).await;
            drop(conn);
        });

        provisioner.delete(&ns).await.unwrap();
        closer.await.unwrap();
    }

    #[derive(Debug)]
    struct FailingAdmin;

    #[async_trait]
    impl BrokerAdmin for FailingAdmin {
        async fn create_vhost(&self, _vhost: &str) -> BrokerResult<()> {
            Err(BrokerError::Management {
                status: 401,
                message: "unauthorized".to_string(),
            })
        }
        async fn delete_vhost(&self, _vhost: &str) -> BrokerResult<()> {
            Ok(())
        }
        async fn list_vhosts(&self) -> BrokerResult<Vec<String>> {
            Ok(Vec::new())
        }
        async fn list_connections(&self, _vhost: &str) -> BrokerResult<Vec<ConnectionRecord>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_create_failure_is_provisioning_error() {
        let provisioner = NamespaceProvisioner::new(Arc::new(FailingAdmin), fast_config());
        let err = provisioner.create().await.unwrap_err();
        assert!(matches!(
            err,
            HarnessError::Provisioning {
                source: BrokerError::Management { status: 401, .. },
                ..
            }
        ));
    }
}
