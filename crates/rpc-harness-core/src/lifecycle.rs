//! Container and runner lifecycle management.
//!
//! Every container or runner built through a [`LifecycleManager`] is
//! registered with the scope's finalizers, so it is stopped at teardown
//! even if the test never calls `stop`.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use futures::FutureExt;
use tracing::{debug, info, warn};

use crate::config::ServiceConfig;
use crate::error::{ConfigError, HarnessError, LifecycleError, Result};
use crate::harness::{Finalizers, Stage};
use crate::service::{
    ContainerEnv, ContainerFactory, DefaultContainerFactory, ServiceContainer, ServiceDefinition,
    DEFAULT_CONTAINER_KIND,
};

/// Named container factories, selectable through `SERVICE_CONTAINER_FACTORY`.
#[derive(Debug, Clone)]
pub struct FactoryRegistry {
    factories: BTreeMap<String, Arc<dyn ContainerFactory>>,
}

impl FactoryRegistry {
    /// A registry holding only the built-in factory.
    #[must_use]
    pub fn new() -> Self {
        let mut factories: BTreeMap<String, Arc<dyn ContainerFactory>> = BTreeMap::new();
        factories.insert(DEFAULT_CONTAINER_KIND.to_string(), Arc::new(DefaultContainerFactory));
        Self { factories }
    }

    /// Register `factory` under `name`, replacing any previous entry.
    pub fn register(&mut self, name: impl Into<String>, factory: Arc<dyn ContainerFactory>) {
        self.factories.insert(name.into(), factory);
    }

    /// Look up a factory by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn ContainerFactory>> {
        self.factories.get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// The factory a service configuration asks for, or the one registered
    /// under [`DEFAULT_CONTAINER_KIND`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownContainerFactory`] if the configuration
    /// names a factory that was never registered.
    pub fn resolve(&self, config: &ServiceConfig) -> std::result::Result<Arc<dyn ContainerFactory>, ConfigError> {
        match config.container_factory() {
            Some(name) => self
                .get(name)
                .ok_or_else(|| ConfigError::UnknownContainerFactory(name.to_string())),
            None => Ok(self
                .get(DEFAULT_CONTAINER_KIND)
                .unwrap_or_else(|| Arc::new(DefaultContainerFactory))),
        }
    }
}

impl Default for FactoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds containers and runners for one test scope.
#[derive(Debug, Clone)]
pub struct LifecycleManager {
    env: ContainerEnv,
    factories: Arc<FactoryRegistry>,
    finalizers: Arc<Finalizers>,
}

impl LifecycleManager {
    pub(crate) fn new(env: ContainerEnv, factories: Arc<FactoryRegistry>, finalizers: Arc<Finalizers>) -> Self {
        Self {
            env,
            factories,
            finalizers,
        }
    }

    /// Build a container for `definition`; does not start it.
    ///
    /// The factory is taken from `SERVICE_CONTAINER_FACTORY` when present.
    ///
    /// # Errors
    ///
    /// - [`LifecycleError::InvalidService`] if the definition has no name or
    ///   no entrypoints
    /// - [`ConfigError::UnknownContainerFactory`] for an unregistered factory
    pub fn make_container(&self, definition: ServiceDefinition, config: ServiceConfig) -> Result<Arc<ServiceContainer>> {
        let factory = self.factories.resolve(&config)?;
        self.make_container_with(definition, config, factory)
    }

    /// Build a container using an explicit factory.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::InvalidService`] for an unusable definition.
    pub fn make_container_with(
        &self,
        definition: ServiceDefinition,
        config: ServiceConfig,
        factory: Arc<dyn ContainerFactory>,
    ) -> Result<Arc<ServiceContainer>> {
        let container = self.build(definition, config, factory)?;

        let tracked = Arc::clone(&container);
        self.finalizers
            .push(Stage::Services, format!("container {}", container.name()), move || {
                async move { tracked.stop().await }.boxed()
            });
        Ok(container)
    }

    fn build(
        &self,
        definition: ServiceDefinition,
        config: ServiceConfig,
        factory: Arc<dyn ContainerFactory>,
    ) -> Result<Arc<ServiceContainer>> {
        definition.validate()?;
        debug!(service = %definition.name(), kind = %factory.kind(), "container created");
        Ok(Arc::new(ServiceContainer::new(
            definition,
            config,
            factory,
            self.env.clone(),
        )))
    }

    /// Build a runner hosting every definition with the same configuration.
    ///
    /// # Errors
    ///
    /// - [`LifecycleError::DuplicateService`] if two definitions share a name
    /// - anything [`make_container`](Self::make_container) reports
    pub fn make_runner(
        &self,
        config: ServiceConfig,
        definitions: impl IntoIterator<Item = ServiceDefinition>,
    ) -> Result<Arc<Runner>> {
        let factory = self.factories.resolve(&config)?;
        let mut seen = HashSet::new();
        let mut containers = Vec::new();

        for definition in definitions {
            if !seen.insert(definition.name().to_string()) {
                return Err(LifecycleError::DuplicateService(definition.name().to_string()).into());
            }
            containers.push(self.build(definition, config.clone(), Arc::clone(&factory))?);
        }

        let runner = Arc::new(Runner { containers });
        let tracked = Arc::clone(&runner);
        self.finalizers.push(
            Stage::Services,
            format!("runner [{}]", runner.service_names().join(", ")),
            move || async move { tracked.stop().await }.boxed(),
        );
        Ok(runner)
    }
}

/// A group of containers started and stopped together.
pub struct Runner {
    containers: Vec<Arc<ServiceContainer>>,
}

impl Runner {
    /// Start every container, in definition order.
    ///
    /// If one fails, the containers already started are stopped in reverse
    /// order before the error is returned.
    ///
    /// # Errors
    ///
    /// A [`HarnessError::Lifecycle`] for the first container that failed.
    /// Lifecycle errors are returned as they are; anything else (a timeout,
    /// bad configuration, io) is wrapped in [`LifecycleError::StartFailed`]
    /// naming that container.
    pub async fn start(&self) -> Result<()> {
        for (index, container) in self.containers.iter().enumerate() {
            if let Err(err) = container.start().await {
                warn!(service = %container.name(), error = %err, "runner start failed, rolling back");
                for started in self.containers[..index].iter().rev() {
                    if let Err(stop_err) = started.stop().await {
                        warn!(service = %started.name(), error = %stop_err, "rollback stop failed");
                    }
                }
                return Err(match err {
                    HarnessError::Lifecycle(_) => err,
                    other => LifecycleError::StartFailed {
                        service: container.name().to_string(),
                        source: Box::new(other),
                    }
                    .into(),
                });
            }
        }
        info!(services = ?self.service_names(), "runner started");
        Ok(())
    }

    /// Stop every container concurrently.
    ///
    /// All containers are stopped even if some fail.
    ///
    /// # Errors
    ///
    /// The first stop error; the others are logged.
    pub async fn stop(&self) -> Result<()> {
        let results = join_all(self.containers.iter().map(|c| c.stop())).await;
        let mut first = None;
        for (container, result) in self.containers.iter().zip(results) {
            if let Err(err) = result {
                if first.is_none() {
                    first = Some(err);
                } else {
                    warn!(service = %container.name(), error = %err, "runner stop failed");
                }
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Container hosting `service`.
    #[must_use]
    pub fn container(&self, service: &str) -> Option<&Arc<ServiceContainer>> {
        self.containers.iter().find(|c| c.name() == service)
    }

    /// All containers, in definition order.
    #[must_use]
    pub fn containers(&self) -> &[Arc<ServiceContainer>] {
        &self.containers
    }

    /// Hosted service names, in definition order.
    #[must_use]
    pub fn service_names(&self) -> Vec<String> {
        self.containers.iter().map(|c| c.name().to_string()).collect()
    }

    /// Whether every container is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.containers.is_empty() && self.containers.iter().all(|c| c.is_running())
    }
}

impl fmt::Debug for Runner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runner")
            .field("services", &self.service_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerAdmin as _, MemoryBroker};
    use crate::call_id::CallIdSelector;
    use crate::config::HarnessConfig;
    use crate::metrics::HarnessMetrics;
    use crate::service::{Capabilities, ContainerState};
    use serde_json::json;

    #[derive(Debug)]
    struct RpcOnly;

    impl ContainerFactory for RpcOnly {
        fn kind(&self) -> &str {
            "rpc-only"
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities::rpc_only()
        }
    }

    async fn manager() -> (LifecycleManager, Arc<Finalizers>, ServiceConfig) {
        let broker = MemoryBroker::new("localhost");
        broker.create_vhost("lifecycle-test").await.unwrap();
        let finalizers = Arc::new(Finalizers::new());
        let env = ContainerEnv {
            broker,
            config: Arc::new(HarnessConfig::default()),
            call_ids: Arc::new(CallIdSelector::default()),
            metrics: Arc::new(HarnessMetrics::new()),
        };
        let mut registry = FactoryRegistry::new();
        registry.register("rpc-only", Arc::new(RpcOnly));
        let manager = LifecycleManager::new(env, Arc::new(registry), Arc::clone(&finalizers));
        let config = ServiceConfig::for_namespace("localhost", "guest", "lifecycle-test");
        (manager, finalizers, config)
    }

    fn echo(name: &str) -> ServiceDefinition {
        ServiceDefinition::new(name).rpc("method", |_ctx, _args| async { Ok(json!("OK")) })
    }

    #[test]
    fn test_registry_resolves_default_and_named() {
        let mut registry = FactoryRegistry::new();
        registry.register("rpc-only", Arc::new(RpcOnly));

        let default = registry.resolve(&ServiceConfig::new()).unwrap();
        assert_eq!(default.kind(), DEFAULT_CONTAINER_KIND);

        let config = ServiceConfig::new().with(crate::config::CONTAINER_FACTORY_CONFIG_KEY, "rpc-only");
        assert_eq!(registry.resolve(&config).unwrap().kind(), "rpc-only");

        let config = ServiceConfig::new().with(crate::config::CONTAINER_FACTORY_CONFIG_KEY, "missing");
        assert!(matches!(
            registry.resolve(&config),
            Err(ConfigError::UnknownContainerFactory(name)) if name == "missing"
        ));
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["default", "rpc-only"]);
    }

    #[tokio::test]
    async fn test_make_container_registers_finalizer() {
        let (manager, finalizers, config) = manager().await;
        let container = manager.make_container(echo("x"), config).unwrap();

        assert_eq!(container.state(), ContainerState::Created);
        assert_eq!(finalizers.len(), 1);

        container.start().await.unwrap();
        let report = finalizers.run().await;
        assert!(report.is_clean());
        assert_eq!(container.state(), ContainerState::Stopped);
    }

    #[tokio::test]
    async fn test_make_container_rejects_invalid_definition() {
        let (manager, finalizers, config) = manager().await;
        let err = manager
            .make_container(ServiceDefinition::new("empty"), config)
            .unwrap_err();

        assert!(matches!(err, HarnessError::Lifecycle(LifecycleError::InvalidService { .. })));
        assert!(finalizers.is_empty());
    }

    #[tokio::test]
    async fn test_make_runner_rejects_duplicates() {
        let (manager, _finalizers, config) = manager().await;
        let err = manager.make_runner(config, [echo("x"), echo("x")]).unwrap_err();
        assert!(matches!(err, HarnessError::Lifecycle(LifecycleError::DuplicateService(name)) if name == "x"));
    }

    #[tokio::test]
    async fn test_runner_start_and_stop() {
        let (manager, _finalizers, config) = manager().await;
        let runner = manager.make_runner(config, [echo("x"), echo("y")]).unwrap();

        runner.start().await.unwrap();
        assert!(runner.is_running());
        assert_eq!(runner.service_names(), vec!["x", "y"]);
        assert_eq!(runner.container("y").map(|c| c.name()), Some("y"));

        runner.stop().await.unwrap();
        assert!(runner
            .containers()
            .iter()
            .all(|c| c.state() == ContainerState::Stopped));
    }

    #[tokio::test]
    async fn test_runner_rolls_back_on_incompatible_container() {
        let (manager, _finalizers, config) = manager().await;
        let config = config.with(crate::config::CONTAINER_FACTORY_CONFIG_KEY, "rpc-only");
        let web = ServiceDefinition::new("web").http(hyper::Method::GET, "/foo", "foo", |_ctx, _req| async {
            Ok(crate::service::HttpResponse::text("OK"))
        });
        let runner = manager.make_runner(config, [echo("x"), web]).unwrap();

        let err = runner.start().await.unwrap_err();
        assert!(matches!(err, HarnessError::Lifecycle(LifecycleError::Incompatible { .. })));
        assert!(runner.containers().iter().all(|c| !c.is_running()));
    }

    #[tokio::test]
    async fn test_runner_wraps_configuration_errors_with_the_service() {
        let (manager, _finalizers, config) = manager().await;
        let config = config.with(crate::config::WEB_SERVER_CONFIG_KEY, "not-an-address");
        let web = ServiceDefinition::new("web").http(hyper::Method::GET, "/foo", "foo", |_ctx, _req| async {
            Ok(crate::service::HttpResponse::text("OK"))
        });
        let runner = manager.make_runner(config, [echo("x"), web]).unwrap();

        let err = runner.start().await.unwrap_err();
        match err {
            HarnessError::Lifecycle(LifecycleError::StartFailed { service, source }) => {
                assert_eq!(service, "web");
                assert!(matches!(*source, HarnessError::Configuration(ConfigError::InvalidAddress(_))));
            }
            other => panic!("expected StartFailed, got {other:?}"),
        }
        assert!(runner.containers().iter().all(|c| !c.is_running()));
    }

    #[test]
    fn test_registry_default_entry_can_be_replaced() {
        let mut registry = FactoryRegistry::new();
        registry.register(DEFAULT_CONTAINER_KIND, Arc::new(RpcOnly));

        let resolved = registry.resolve(&ServiceConfig::new()).unwrap();
        assert_eq!(resolved.kind(), "rpc-only");
        assert_eq!(resolved.capabilities(), Capabilities::rpc_only());
    }
}
