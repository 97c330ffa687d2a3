use std::fmt;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument};

use crate::broker::{BrokerAdmin, ConnectionRecord, MemoryBroker};
use crate::call_id::{CallIdSelector, CallIdStrategy};
use crate::client::{WebSession, WebSocketClient};
use crate::config::{HarnessConfig, ServiceConfig, WEB_SERVER_CONFIG_KEY};
use crate::error::{LifecycleError, Result};
use crate::inventory::ConnectionInventory;
use crate::lifecycle::{FactoryRegistry, LifecycleManager, Runner};
use crate::metrics::HarnessMetrics;
use crate::namespace::{Namespace, NamespaceProvisioner};
use crate::service::{ContainerEnv, ContainerFactory, RpcClient, ServiceContainer, ServiceDefinition};

use super::finalizer::{Finalizers, Stage, TeardownReport};

/// Resources of a single test.
///
/// Cloning is cheap; clones share the same namespace and finalizers.
/// Everything acquired through a scope is released by
/// [`teardown`](Self::teardown): clients first, then containers and runners,
/// then the leak check, then the namespace.
#[derive(Clone)]
pub struct TestScope {
    inner: Arc<ScopeInner>,
}

struct ScopeInner {
    config: Arc<HarnessConfig>,
    broker: Arc<MemoryBroker>,
    provisioner: NamespaceProvisioner,
    inventory: ConnectionInventory,
    namespace: OnceCell<Namespace>,
    call_ids: Arc<CallIdSelector>,
    factories: Arc<FactoryRegistry>,
    finalizers: Arc<Finalizers>,
    metrics: Arc<HarnessMetrics>,
}

impl TestScope {
    pub(crate) fn new(
        config: Arc<HarnessConfig>,
        broker: Arc<MemoryBroker>,
        factories: Arc<FactoryRegistry>,
        metrics: Arc<HarnessMetrics>,
    ) -> Self {
        let admin: Arc<dyn BrokerAdmin> = Arc::clone(&broker) as Arc<dyn BrokerAdmin>;
        Self {
            inner: Arc::new(ScopeInner {
                provisioner: NamespaceProvisioner::new(Arc::clone(&admin), config.namespace.clone()),
                inventory: ConnectionInventory::new(admin),
                namespace: OnceCell::new(),
                call_ids: Arc::new(CallIdSelector::new(config.call_ids)),
                finalizers: Arc::new(Finalizers::new()),
                config,
                broker,
                factories,
                metrics,
            }),
        }
    }

    /// The scope's namespace, provisioned on first use.
    ///
    /// Provisioning registers the drain check and the namespace deletion
    /// with the scope's finalizers.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Provisioning`](crate::error::HarnessError::Provisioning)
    /// if the broker refuses.
    pub async fn namespace(&self) -> Result<Namespace> {
        self.inner
            .namespace
            .get_or_try_init(|| self.provision())
            .await
            .cloned()
    }

    async fn provision(&self) -> Result<Namespace> {
        let namespace = self.inner.provisioner.create().await?;
        self.inner.metrics.namespaces_active.inc();

        let inventory = self.inner.inventory.clone();
        let drained = namespace.clone();
        let timeout = self.inner.config.namespace.drain_timeout();
        let poll = self.inner.config.namespace.drain_poll_interval();
        self.inner.finalizers.push(
            Stage::Inventory,
            format!("drain check {namespace}"),
            move || async move { inventory.assert_drained(&drained, timeout, poll).await }.boxed(),
        );

        let provisioner = self.inner.provisioner.clone();
        let metrics = Arc::clone(&self.inner.metrics);
        let deleted = namespace.clone();
        self.inner.finalizers.push(
            Stage::Namespace,
            format!("delete namespace {namespace}"),
            move || {
                async move {
                    provisioner.delete(&deleted).await?;
                    metrics.namespaces_active.dec();
                    Ok(())
                }
                .boxed()
            },
        );
        Ok(namespace)
    }

    /// Configuration pointing at the scope's namespace.
    ///
    /// # Errors
    ///
    /// Fails if the namespace cannot be provisioned.
    pub async fn config(&self) -> Result<ServiceConfig> {
        let namespace = self.namespace().await?;
        let broker = &self.inner.config.broker;
        Ok(ServiceConfig::for_namespace(&broker.name, &broker.username, namespace.name()))
    }

    /// Like [`config`](Self::config), plus a web listener on an ephemeral
    /// loopback port.
    ///
    /// # Errors
    ///
    /// Fails if the namespace cannot be provisioned.
    pub async fn web_config(&self) -> Result<ServiceConfig> {
        Ok(self.config().await?.with(WEB_SERVER_CONFIG_KEY, "127.0.0.1:0"))
    }

    /// A configuration with no keys at all.
    #[must_use]
    pub fn empty_config(&self) -> ServiceConfig {
        ServiceConfig::new()
    }

    /// Container and runner factory bound to this scope.
    #[must_use]
    pub fn lifecycle_manager(&self) -> LifecycleManager {
        let env = ContainerEnv {
            broker: Arc::clone(&self.inner.broker),
            config: Arc::clone(&self.inner.config),
            call_ids: Arc::clone(&self.inner.call_ids),
            metrics: Arc::clone(&self.inner.metrics),
        };
        LifecycleManager::new(
            env,
            Arc::clone(&self.inner.factories),
            Arc::clone(&self.inner.finalizers),
        )
    }

    /// Build a container, stopped at teardown.
    ///
    /// # Errors
    ///
    /// See [`LifecycleManager::make_container`].
    pub fn container(&self, definition: ServiceDefinition, config: ServiceConfig) -> Result<Arc<ServiceContainer>> {
        self.lifecycle_manager().make_container(definition, config)
    }

    /// Build a container with an explicit factory, stopped at teardown.
    ///
    /// # Errors
    ///
    /// See [`LifecycleManager::make_container_with`].
    pub fn container_with(
        &self,
        definition: ServiceDefinition,
        config: ServiceConfig,
        factory: Arc<dyn ContainerFactory>,
    ) -> Result<Arc<ServiceContainer>> {
        self.lifecycle_manager()
            .make_container_with(definition, config, factory)
    }

    /// Build a runner, stopped at teardown.
    ///
    /// # Errors
    ///
    /// See [`LifecycleManager::make_runner`].
    pub fn runner(
        &self,
        config: ServiceConfig,
        definitions: impl IntoIterator<Item = ServiceDefinition>,
    ) -> Result<Arc<Runner>> {
        self.lifecycle_manager().make_runner(config, definitions)
    }

    /// Switch the scope to sequential call ids.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::CallIdStrategyFrozen`](crate::error::ConfigError::CallIdStrategyFrozen)
    /// once a container of this scope has started.
    pub fn deterministic_call_ids(&self) -> Result<()> {
        self.inner.call_ids.select(CallIdStrategy::Sequential)?;
        debug!("sequential call ids selected");
        Ok(())
    }

    /// The call-id strategy in effect.
    #[must_use]
    pub fn call_id_strategy(&self) -> CallIdStrategy {
        self.inner.call_ids.strategy()
    }

    /// A standalone rpc client in the scope's namespace, closed at teardown.
    ///
    /// # Errors
    ///
    /// Fails if the namespace cannot be provisioned or the broker refuses
    /// the connection.
    pub async fn rpc_client(&self) -> Result<Arc<RpcClient>> {
        let config = self.config().await?;
        let client = Arc::new(RpcClient::connect(
            &self.inner.broker,
            &config,
            self.inner.config.rpc.timeout(),
        )?);

        let tracked = Arc::clone(&client);
        self.inner.finalizers.push(
            Stage::Clients,
            format!("rpc client {}", client.connection_name()),
            move || {
                async move {
                    tracked.close();
                    Ok(())
                }
                .boxed()
            },
        );
        Ok(client)
    }

    /// An http session for a started, web-capable container.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::NotServing`] if the container never bound a
    /// listener.
    pub fn web_session(&self, container: &ServiceContainer) -> Result<WebSession> {
        let address = container
            .web_address()
            .ok_or_else(|| LifecycleError::NotServing {
                service: container.name().to_string(),
                resource: "http",
            })?;
        WebSession::new(address)
    }

    /// A websocket client for a started, web-capable container. Handles it
    /// opens are closed at teardown.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::NotServing`] if the container never bound a
    /// listener.
    pub fn websocket_client(&self, container: &ServiceContainer) -> Result<WebSocketClient> {
        let url = container.websocket_url()?;
        Ok(WebSocketClient::new(url, &self.inner.config.websocket)
            .with_finalizers(Arc::clone(&self.inner.finalizers)))
    }

    /// Read-only view of broker connections.
    #[must_use]
    pub fn inventory(&self) -> &ConnectionInventory {
        &self.inner.inventory
    }

    /// Open connections in the scope's namespace.
    ///
    /// # Errors
    ///
    /// Fails if the namespace cannot be provisioned or listed.
    pub async fn list_connections(&self) -> Result<Vec<ConnectionRecord>> {
        let namespace = self.namespace().await?;
        self.inner.inventory.list_connections(&namespace).await
    }

    /// The provisioner used for the scope's namespace.
    #[must_use]
    pub fn provisioner(&self) -> &NamespaceProvisioner {
        &self.inner.provisioner
    }

    /// The broker of this scope.
    #[must_use]
    pub fn broker(&self) -> &Arc<MemoryBroker> {
        &self.inner.broker
    }

    /// The harness configuration.
    #[must_use]
    pub fn harness_config(&self) -> &HarnessConfig {
        &self.inner.config
    }

    /// Metrics shared with the harness.
    #[must_use]
    pub fn metrics(&self) -> &Arc<HarnessMetrics> {
        &self.inner.metrics
    }

    /// Number of teardown actions still pending.
    #[must_use]
    pub fn pending_finalizers(&self) -> usize {
        self.inner.finalizers.len()
    }

    /// Run every pending teardown action and report the outcome.
    ///
    /// Safe to call more than once; later calls only run what was
    /// registered since.
    #[instrument(skip(self), fields(namespace = ?self.inner.namespace.get().map(Namespace::name)))]
    pub async fn teardown_report(&self) -> TeardownReport {
        let report = self.inner.finalizers.run().await;
        self.inner
            .metrics
            .record_teardown_failures(report.failures.len());
        info!(
            completed = report.completed.len(),
            failed = report.failures.len(),
            "scope torn down"
        );
        report
    }

    /// Run every pending teardown action.
    ///
    /// # Errors
    ///
    /// The single failure, or [`HarnessError::Teardown`](crate::error::HarnessError::Teardown)
    /// if several actions failed.
    pub async fn teardown(&self) -> Result<()> {
        self.teardown_report().await.into_result()
    }
}

impl fmt::Debug for TestScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestScope")
            .field("namespace", &self.inner.namespace.get())
            .field("call_ids", &self.inner.call_ids.strategy())
            .field("pending_finalizers", &self.inner.finalizers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConfigError, HarnessError};
    use crate::harness::Harness;
    use serde_json::json;

    fn echo() -> ServiceDefinition {
        ServiceDefinition::new("x").rpc("method", |_ctx, _args| async { Ok(json!("OK")) })
    }

    #[tokio::test]
    async fn test_namespace_is_provisioned_once() {
        let harness = Harness::builder().build().unwrap();
        let scope = harness.scope();

        let first = scope.namespace().await.unwrap();
        let second = scope.namespace().await.unwrap();
        assert_eq!(first, second);
        assert!(first.name().starts_with("rpc-test-"));
        assert!(harness.broker().has_vhost(first.name()));
        assert_eq!(scope.pending_finalizers(), 2);
        assert_eq!(harness.metrics().namespaces_active.get(), 1);

        scope.teardown().await.unwrap();
        assert!(!harness.broker().has_vhost(first.name()));
        assert_eq!(harness.metrics().namespaces_active.get(), 0);
    }

    #[tokio::test]
    async fn test_config_points_at_namespace() {
        let harness = Harness::builder().build().unwrap();
        let scope = harness.scope();

        let config = scope.web_config().await.unwrap();
        let namespace = scope.namespace().await.unwrap();
        assert_eq!(config.vhost().unwrap(), namespace.name());
        assert_eq!(config.get_str(WEB_SERVER_CONFIG_KEY), Some("127.0.0.1:0"));
        assert!(scope.empty_config().is_empty());

        scope.teardown().await.unwrap();
    }

    #[tokio::test]
    async fn test_teardown_stops_forgotten_container() {
        let harness = Harness::builder().build().unwrap();
        let scope = harness.scope();

        let config = scope.config().await.unwrap();
        let container = scope.container(echo(), config).unwrap();
        container.start().await.unwrap();
        let client = scope.rpc_client().await.unwrap();
        assert_eq!(client.call("x", "method", json!({})).await.unwrap(), json!("OK"));

        let report = scope.teardown_report().await;
        assert!(report.is_clean(), "{:?}", report.failures);
        assert!(!container.is_running());
        assert_eq!(report.completed.len(), 4);
    }

    #[tokio::test]
    async fn test_deterministic_call_ids_rejected_after_start() {
        let harness = Harness::builder().build().unwrap();
        let scope = harness.scope();

        scope.deterministic_call_ids().unwrap();
        let config = scope.config().await.unwrap();
        scope.container(echo(), config).unwrap().start().await.unwrap();

        let err = scope.deterministic_call_ids().unwrap_err();
        assert!(matches!(
            err,
            HarnessError::Configuration(ConfigError::CallIdStrategyFrozen { .. })
        ));
        scope.teardown().await.unwrap();
    }

    #[tokio::test]
    async fn test_web_session_requires_listener() {
        let harness = Harness::builder().build().unwrap();
        let scope = harness.scope();

        let config = scope.config().await.unwrap();
        let container = scope.container(echo(), config).unwrap();
        container.start().await.unwrap();

        let err = scope.web_session(&container).unwrap_err();
        assert!(matches!(
            err,
            HarnessError::Lifecycle(LifecycleError::NotServing { resource: "http", .. })
        ));
        assert!(scope.websocket_client(&container).is_err());
        scope.teardown().await.unwrap();
    }
}
