//! Test-facing harness: builds per-test scopes and tears them down in order.
//!
//! # Example
//!
//! ```rust,ignore
//! let harness = Harness::builder().build()?;
//! harness
//!     .run(|scope| async move {
//!         let config = scope.config().await?;
//!         let x = scope.container(x_service(), config)?;
//!         x.start().await?;
//!         let client = scope.rpc_client().await?;
//!         assert_eq!(client.call("x", "method", json!({})).await?, json!("OK"));
//!         Ok(())
//!     })
//!     .await?;
//! ```

pub mod finalizer;
mod scope;

use std::any::Any;
use std::future::Future;
use std::panic;
use std::sync::Arc;

use tracing::{error, warn};

use crate::broker::MemoryBroker;
use crate::config::HarnessConfig;
use crate::error::{ConfigResult, HarnessError, LifecycleError, Result};
use crate::lifecycle::FactoryRegistry;
use crate::metrics::HarnessMetrics;
use crate::service::ContainerFactory;

pub use finalizer::{Finalizer, Finalizers, Stage, TeardownFailure, TeardownReport};
pub use scope::TestScope;

/// Builder for [`Harness`].
#[derive(Debug, Default)]
pub struct HarnessBuilder {
    config: HarnessConfig,
    broker: Option<Arc<MemoryBroker>>,
    factories: FactoryRegistry,
    metrics: Option<Arc<HarnessMetrics>>,
}

impl HarnessBuilder {
    /// Start from the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `config` instead of the defaults.
    #[must_use]
    pub fn config(mut self, config: HarnessConfig) -> Self {
        self.config = config;
        self
    }

    /// Share an existing broker instead of creating one.
    #[must_use]
    pub fn broker(mut self, broker: Arc<MemoryBroker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Make a container factory selectable by `name`.
    #[must_use]
    pub fn register_factory(mut self, name: impl Into<String>, factory: Arc<dyn ContainerFactory>) -> Self {
        self.factories.register(name, factory);
        self
    }

    /// Share an existing metrics collection.
    #[must_use]
    pub fn metrics(mut self, metrics: Arc<HarnessMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Validate the configuration and build the harness.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`](crate::error::ConfigError) if the
    /// configuration is invalid.
    pub fn build(self) -> ConfigResult<Harness> {
        self.config.validate()?;
        let broker = self
            .broker
            .unwrap_or_else(|| MemoryBroker::new(self.config.broker.name.clone()));
        Ok(Harness {
            config: Arc::new(self.config),
            broker,
            factories: Arc::new(self.factories),
            metrics: self.metrics.unwrap_or_default(),
        })
    }
}

/// Shared state of a test run; hands out one [`TestScope`] per test.
#[derive(Debug, Clone)]
pub struct Harness {
    config: Arc<HarnessConfig>,
    broker: Arc<MemoryBroker>,
    factories: Arc<FactoryRegistry>,
    metrics: Arc<HarnessMetrics>,
}

impl Harness {
    /// A builder with default settings.
    #[must_use]
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder::new()
    }

    /// The harness configuration.
    #[must_use]
    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// The broker every scope provisions its namespace on.
    #[must_use]
    pub fn broker(&self) -> &Arc<MemoryBroker> {
        &self.broker
    }

    /// Metrics shared by every scope.
    #[must_use]
    pub fn metrics(&self) -> &Arc<HarnessMetrics> {
        &self.metrics
    }

    /// A fresh scope for one test. The caller must call
    /// [`TestScope::teardown`] when done; [`run`](Self::run) does it for you.
    #[must_use]
    pub fn scope(&self) -> TestScope {
        TestScope::new(
            Arc::clone(&self.config),
            Arc::clone(&self.broker),
            Arc::clone(&self.factories),
            Arc::clone(&self.metrics),
        )
    }

    /// Run a test body in its own scope and tear the scope down afterwards.
    ///
    /// Teardown runs even if the body fails or panics. A teardown failure is
    /// never dropped: after a body error both are returned together, and a
    /// resumed panic carries the teardown error in its message.
    ///
    /// # Errors
    ///
    /// - the body's error when teardown was clean
    /// - the teardown error when the body succeeded
    /// - [`HarnessError::BodyAndTeardown`] when both failed
    pub async fn run<F, Fut, T>(&self, body: F) -> Result<T>
    where
        F: FnOnce(TestScope) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let scope = self.scope();
        let outcome = tokio::spawn(body(scope.clone())).await;
        let teardown = scope.teardown().await;

        match outcome {
            Ok(Ok(value)) => teardown.map(|()| value),
            Ok(Err(err)) => Err(with_teardown(err, teardown)),
            Err(join_err) if join_err.is_panic() => {
                let payload = join_err.into_panic();
                match teardown {
                    Ok(()) => panic::resume_unwind(payload),
                    Err(teardown_err) => {
                        error!(error = %teardown_err, "teardown failed after test panic");
                        let message = format!(
                            "{} (teardown also failed: {teardown_err})",
                            panic_message(payload.as_ref())
                        );
                        panic::resume_unwind(Box::new(message))
                    }
                }
            }
            Err(join_err) => {
                let cancelled = LifecycleError::StopFailed {
                    service: "test body".to_string(),
                    message: join_err.to_string(),
                }
                .into();
                Err(with_teardown(cancelled, teardown))
            }
        }
    }
}

/// Attach a failed teardown to the error that ended the test body.
fn with_teardown(body: HarnessError, teardown: Result<()>) -> HarnessError {
    match teardown {
        Ok(()) => body,
        Err(teardown) => {
            warn!(error = %teardown, "teardown failed after test error");
            HarnessError::BodyAndTeardown {
                body: Box::new(body),
                teardown: Box::new(teardown),
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("test body panicked")
}
