//! Service container: one running instance of a service definition.
//!
//! A container moves through `Created -> Running -> Stopped` exactly once.
//! `start` opens a broker connection in the configured namespace, consumes
//! `rpc-<service>` and binds the web listener when the service needs one.
//! `stop` stops taking new work, gives in-flight workers the grace period and
//! then closes the connection.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use crate::broker::{rpc_queue, BrokerConnection, Delivery, MemoryBroker};
use crate::call_id::CallIdSelector;
use crate::config::{HarnessConfig, ServiceConfig, AMQP_URI_CONFIG_KEY, MEMORY_SCHEME};
use crate::error::{BrokerError, ConfigError, HarnessError, LifecycleError, Result};
use crate::metrics::HarnessMetrics;

use super::definition::ServiceDefinition;
use super::factory::ContainerFactory;
use super::hub::WebSocketHub;
use super::rpc::RpcTransport;
use super::web::{self, WebState};
use super::worker::WorkerRuntime;

/// Lifecycle state of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    Running,
    Stopped,
}

/// Shared dependencies of every container in a test scope.
#[derive(Debug, Clone)]
pub(crate) struct ContainerEnv {
    pub(crate) broker: Arc<MemoryBroker>,
    pub(crate) config: Arc<HarnessConfig>,
    pub(crate) call_ids: Arc<CallIdSelector>,
    pub(crate) metrics: Arc<HarnessMetrics>,
}

/// Settings resolved from the harness and service configuration.
#[derive(Debug, Clone)]
struct ContainerSettings {
    start_timeout: Duration,
    stop_grace_period: Duration,
    rpc_timeout: Duration,
    websocket_path: String,
    max_workers: usize,
}

impl ContainerSettings {
    fn resolve(harness: &HarnessConfig, service: &ServiceConfig) -> Result<Self> {
        Ok(Self {
            start_timeout: harness.lifecycle.start_timeout(),
            stop_grace_period: harness.lifecycle.stop_grace_period(),
            rpc_timeout: harness.rpc.timeout(),
            websocket_path: harness.websocket.path.clone(),
            max_workers: service
                .max_workers()?
                .unwrap_or(harness.lifecycle.max_workers),
        })
    }
}

/// Resources owned while running.
struct Running {
    connection: Arc<BrokerConnection>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    loops: Vec<(&'static str, JoinHandle<()>)>,
    reply_listener: JoinHandle<()>,
    grace: Duration,
}

/// A running unit hosting one service definition.
pub struct ServiceContainer {
    definition: Arc<ServiceDefinition>,
    config: ServiceConfig,
    factory: Arc<dyn ContainerFactory>,
    env: ContainerEnv,
    state: watch::Sender<ContainerState>,
    running: Mutex<Option<Running>>,
    web_address: OnceLock<SocketAddr>,
    hub: Arc<WebSocketHub>,
}

impl ServiceContainer {
    pub(crate) fn new(
        definition: ServiceDefinition,
        config: ServiceConfig,
        factory: Arc<dyn ContainerFactory>,
        env: ContainerEnv,
    ) -> Self {
        let (state, _) = watch::channel(ContainerState::Created);
        Self {
            definition: Arc::new(definition),
            config,
            factory,
            env,
            state,
            running: Mutex::new(None),
            web_address: OnceLock::new(),
            hub: Arc::new(WebSocketHub::new()),
        }
    }

    /// Name of the hosted service.
    #[must_use]
    pub fn name(&self) -> &str {
        self.definition.name()
    }

    /// The hosted service definition.
    #[must_use]
    pub fn definition(&self) -> &ServiceDefinition {
        &self.definition
    }

    /// Configuration the container was created with.
    #[must_use]
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Kind of the factory that built this container.
    #[must_use]
    pub fn kind(&self) -> &str {
        self.factory.kind()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ContainerState {
        *self.state.borrow()
    }

    /// Whether the container is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == ContainerState::Running
    }

    /// Address the web listener was bound to, once started.
    ///
    /// Stays available after `stop`; connecting to it then fails at the
    /// transport level.
    #[must_use]
    pub fn web_address(&self) -> Option<SocketAddr> {
        self.web_address.get().copied()
    }

    /// Websocket URL of the container.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::NotServing`] if no listener was ever bound.
    pub fn websocket_url(&self) -> Result<String> {
        let address = self.web_address().ok_or_else(|| LifecycleError::NotServing {
            service: self.name().to_string(),
            resource: "websocket",
        })?;
        Ok(format!("ws://{address}{}", self.env.config.websocket.path))
    }

    /// The container's websocket hub.
    #[must_use]
    pub fn websocket_hub(&self) -> Arc<WebSocketHub> {
        Arc::clone(&self.hub)
    }

    /// Start serving.
    ///
    /// # Errors
    ///
    /// - [`LifecycleError::AlreadyStarted`] / [`LifecycleError::AlreadyStopped`]
    ///   if the container is not fresh
    /// - [`LifecycleError::Incompatible`] if the factory cannot host the service
    /// - [`LifecycleError::Broker`] / [`LifecycleError::Bind`] if resources
    ///   cannot be acquired
    /// - [`HarnessError::Timeout`] if start exceeds `lifecycle.start_timeout_ms`
    #[instrument(skip(self), fields(service = %self.name(), kind = %self.kind()))]
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        match self.state() {
            ContainerState::Created => {}
            ContainerState::Running => return Err(LifecycleError::AlreadyStarted(self.name().to_string()).into()),
            ContainerState::Stopped => return Err(LifecycleError::AlreadyStopped(self.name().to_string()).into()),
        }

        let required = self.definition.capabilities();
        if let Some(capability) = required.first_missing(&self.factory.capabilities()) {
            return Err(LifecycleError::Incompatible {
                service: self.name().to_string(),
                factory: self.kind().to_string(),
                capability,
            }
            .into());
        }

        let settings = ContainerSettings::resolve(&self.env.config, &self.config)?;
        let parts = tokio::time::timeout(settings.start_timeout, self.launch(&settings))
            .await
            .map_err(|_| HarnessError::Timeout {
                operation: format!("start of container '{}'", self.name()),
                after: settings.start_timeout,
            })??;

        *running = Some(parts);
        self.state.send_replace(ContainerState::Running);
        self.env.metrics.containers_started.inc();
        info!(web_address = ?self.web_address(), "container started");
        Ok(())
    }

    async fn launch(&self, settings: &ContainerSettings) -> Result<Running> {
        let service = self.name().to_string();
        let broker_err = |source: BrokerError| LifecycleError::Broker {
            service: service.clone(),
            source,
        };

        let vhost = self.config.vhost()?;
        self.check_broker_uri()?;
        let user = self
            .config
            .username()
            .unwrap_or_else(|| self.env.config.broker.username.clone());
        let client_name = format!("{service}-container");
        let connection = Arc::new(
            self.env
                .broker
                .connect(&vhost, &user, Some(&client_name))
                .map_err(broker_err)?,
        );

        let capabilities = self.definition.capabilities();
        let deliveries = if capabilities.rpc {
            Some(connection.consume(&rpc_queue(&service)).map_err(broker_err)?)
        } else {
            None
        };

        let listener = if capabilities.needs_listener() {
            let address = self
                .config
                .web_server_address()?
                .unwrap_or_else(|| SocketAddr::from((Ipv4Addr::LOCALHOST, 0)));
            let bind_err = |source: std::io::Error| LifecycleError::Bind {
                service: service.clone(),
                address: address.to_string(),
                source,
            };
            let listener = TcpListener::bind(address).await.map_err(bind_err)?;
            let bound = listener.local_addr().map_err(bind_err)?;
            Some((listener, bound))
        } else {
            None
        };

        let (transport, reply_listener) =
            RpcTransport::open(Arc::clone(&connection), settings.rpc_timeout).map_err(broker_err)?;

        let runtime = Arc::new(WorkerRuntime {
            definition: Arc::clone(&self.definition),
            call_ids: self.env.call_ids.freeze(),
            context_builder: self.factory.context_builder(),
            transport,
            hub: Arc::clone(&self.hub),
            tracker: TaskTracker::new(),
            workers: Arc::new(Semaphore::new(settings.max_workers)),
            metrics: Arc::clone(&self.env.metrics),
        });

        let cancel = CancellationToken::new();
        let mut loops = Vec::new();

        if let Some(deliveries) = deliveries {
            loops.push((
                "rpc consumer",
                tokio::spawn(consume_rpc(Arc::clone(&runtime), deliveries, cancel.clone())),
            ));
        }

        if let Some((listener, bound)) = listener {
            let _ = self.web_address.set(bound);
            let state = Arc::new(WebState {
                runtime: Arc::clone(&runtime),
                websocket_path: settings.websocket_path.clone(),
                cancel: cancel.clone(),
            });
            loops.push(("web listener", tokio::spawn(web::serve(listener, bound, state))));
        }

        Ok(Running {
            connection,
            cancel,
            tracker: runtime.tracker.clone(),
            loops,
            reply_listener,
            grace: settings.stop_grace_period,
        })
    }

    fn check_broker_uri(&self) -> Result<()> {
        let Ok(uri) = self.config.amqp_uri() else {
            return Ok(());
        };
        let host = uri.host_str().unwrap_or_default();
        if uri.scheme() != MEMORY_SCHEME || host != self.env.broker.name() {
            return Err(ConfigError::InvalidValue {
                key: AMQP_URI_CONFIG_KEY.to_string(),
                message: format!(
                    "'{uri}' does not point at {MEMORY_SCHEME}://{}",
                    self.env.broker.name()
                ),
            }
            .into());
        }
        Ok(())
    }

    /// Stop serving. No-op unless running.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::StopFailed`] if a background task panicked.
    /// The connection is closed regardless.
    #[instrument(skip(self), fields(service = %self.name()))]
    pub async fn stop(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        let Some(parts) = running.take() else {
            debug!(state = ?self.state(), "stop ignored: not running");
            return Ok(());
        };

        parts.cancel.cancel();
        parts.connection.cancel(&rpc_queue(self.name()));
        parts.tracker.close();

        let mut failure = None;
        for (task, handle) in parts.loops {
            if let Err(e) = handle.await {
                warn!(task, error = %e, "container task failed");
                failure.get_or_insert_with(|| format!("{task} task failed: {e}"));
            }
        }

        if tokio::time::timeout(parts.grace, parts.tracker.wait()).await.is_err() {
            warn!(
                in_flight = parts.tracker.len(),
                grace_ms = parts.grace.as_millis() as u64,
                "grace period elapsed with workers still running"
            );
        }

        parts.connection.close();
        if parts.reply_listener.await.is_err() {
            failure.get_or_insert_with(|| "reply listener failed".to_string());
        }

        self.state.send_replace(ContainerState::Stopped);
        self.env.metrics.containers_stopped.inc();
        info!("container stopped");

        match failure {
            Some(message) => Err(LifecycleError::StopFailed {
                service: self.name().to_string(),
                message,
            }
            .into()),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for ServiceContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceContainer")
            .field("service", &self.name())
            .field("kind", &self.kind())
            .field("state", &self.state())
            .field("web_address", &self.web_address())
            .finish_non_exhaustive()
    }
}

impl Drop for ServiceContainer {
    fn drop(&mut self) {
        if let Some(parts) = self.running.get_mut().take() {
            parts.cancel.cancel();
            parts.connection.close();
            for (_, handle) in parts.loops {
                handle.abort();
            }
        }
    }
}

async fn consume_rpc(
    runtime: Arc<WorkerRuntime>,
    mut deliveries: mpsc::UnboundedReceiver<Delivery>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            delivery = deliveries.recv() => match delivery {
                Some(delivery) => runtime.dispatch_rpc(delivery),
                None => break,
            },
            () = cancel.cancelled() => break,
        }
    }
    debug!(service = %runtime.definition.name(), "rpc consumer stopped");
}
