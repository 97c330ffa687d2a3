//! Domain error types for the test harness.
//!
//! Uses `thiserror` for ergonomic error definitions with proper context.
//! [`HarnessError`] is the taxonomy tests see; the smaller enums carry the
//! detail of each subsystem and convert into it with `?`.

use std::time::Duration;

use thiserror::Error;

use crate::harness::TeardownFailure;
use crate::wire::RemoteError;

/// Errors related to configuration parsing, validation and strategy selection.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A configuration value failed validation.
    #[error("invalid value for '{key}': {message}")]
    InvalidValue { key: String, message: String },

    /// A required key is absent from a service configuration.
    #[error("missing configuration key '{0}'")]
    MissingKey(String),

    /// The broker URI could not be parsed.
    #[error("invalid broker uri '{0}'")]
    InvalidUri(String),

    /// Invalid address format.
    #[error("invalid address format: {0} (expected 'host:port')")]
    InvalidAddress(String),

    /// The call-id strategy was changed after a container already started.
    #[error("call-id strategy is fixed once a container has started (current: {current}, requested: {requested})")]
    CallIdStrategyFrozen { current: String, requested: String },

    /// A configuration names a container factory nobody registered.
    #[error("unknown container factory '{0}'")]
    UnknownContainerFactory(String),

    /// Failed to read configuration file.
    #[error("failed to read config file '{path}': {source}")]
    IoError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse YAML configuration.
    #[error("failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
}

/// Errors reported by the broker data plane or control plane.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// The named vhost does not exist.
    #[error("unknown vhost '{0}'")]
    UnknownVhost(String),

    /// The vhost still has open connections.
    #[error("vhost '{vhost}' still has {connections} open connection(s)")]
    VhostBusy { vhost: String, connections: usize },

    /// The connection was closed before the operation.
    #[error("connection {0} is closed")]
    ConnectionClosed(String),

    /// Another connection already consumes from this queue.
    #[error("queue '{queue}' already has a consumer")]
    QueueInUse { queue: String },

    /// Nothing consumes from this queue.
    #[error("no consumer on queue '{queue}'")]
    NoSuchQueue { queue: String },

    /// The management API answered with a non-success status.
    #[error("management api returned {status}: {message}")]
    Management { status: u16, message: String },

    /// The management API could not be reached or answered garbage.
    #[error("management transport error: {0}")]
    Transport(String),
}

/// Misuse of the container lifecycle, or a container that cannot run.
#[derive(Error, Debug)]
pub enum LifecycleError {
    /// The service definition does not satisfy the framework contract.
    #[error("invalid service definition '{service}': {reason}")]
    InvalidService { service: String, reason: String },

    /// Two services with the same name were put into one runner.
    #[error("runner already hosts a service named '{0}'")]
    DuplicateService(String),

    /// `start` was called on a running container.
    #[error("container for '{0}' is already running")]
    AlreadyStarted(String),

    /// `start` was called on a container that has been stopped.
    #[error("container for '{0}' was stopped and cannot be restarted")]
    AlreadyStopped(String),

    /// The container factory cannot host what the service needs.
    #[error("container factory '{factory}' does not support {capability} entrypoints required by '{service}'")]
    Incompatible {
        service: String,
        factory: String,
        capability: &'static str,
    },

    /// The broker refused a connection or queue during start.
    #[error("container for '{service}' failed to start: {source}")]
    Broker {
        service: String,
        #[source]
        source: BrokerError,
    },

    /// The web listener could not be bound.
    #[error("container for '{service}' could not bind {address}: {source}")]
    Bind {
        service: String,
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// Start failed for a reason outside the lifecycle itself: a timeout,
    /// bad configuration or an io error.
    #[error("container for '{service}' failed to start: {source}")]
    StartFailed {
        service: String,
        #[source]
        source: Box<HarnessError>,
    },

    /// A background task of the container panicked or was cancelled.
    #[error("container for '{service}' failed while stopping: {message}")]
    StopFailed { service: String, message: String },

    /// The container is not in a state that offers the requested resource.
    #[error("container for '{service}' is not serving {resource}")]
    NotServing {
        service: String,
        resource: &'static str,
    },
}

/// Errors of a single remote call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RpcError {
    /// No container consumes requests for the service.
    #[error("unknown service '{0}'")]
    UnknownService(String),

    /// The callee raised an error.
    #[error("remote error: {0}")]
    Remote(RemoteError),

    /// No reply arrived before the deadline.
    #[error("call to {service}.{method} timed out after {after:?}")]
    Timeout {
        service: String,
        method: String,
        after: Duration,
    },

    /// The reply channel went away before a reply arrived.
    #[error("reply channel closed before a reply arrived")]
    Disconnected,

    /// A request or reply could not be (de)serialized.
    #[error("payload encoding error: {0}")]
    Encode(String),

    /// The broker refused the publish.
    #[error("broker error: {0}")]
    Broker(BrokerError),
}

/// Errors surfaced to test code.
#[derive(Error, Debug)]
pub enum HarnessError {
    /// Creating an isolated namespace failed. Fatal for the test.
    #[error("failed to provision namespace '{namespace}': {source}")]
    Provisioning {
        namespace: String,
        #[source]
        source: BrokerError,
    },

    /// Connections outlived the resources that own them.
    #[error("namespace '{namespace}' is busy: {connections} connection(s) still open")]
    NamespaceBusy {
        namespace: String,
        connections: usize,
    },

    /// Container start/stop misuse or an incompatible container factory.
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    /// Invalid configuration or a strategy selected too late.
    #[error(transparent)]
    Configuration(#[from] ConfigError),

    /// A blocking operation exceeded its deadline.
    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    /// Broker control-plane or data-plane error.
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// A remote call failed.
    #[error(transparent)]
    Rpc(RpcError),

    /// HTTP client error.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// WebSocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// TCP/IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A websocket frame could not be (de)serialized.
    #[error("frame encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    /// Several teardown actions failed.
    #[error("{} teardown action(s) failed", failures.len())]
    Teardown { failures: Vec<TeardownFailure> },

    /// The test body failed and teardown failed after it.
    #[error("{body} (teardown also failed: {teardown})")]
    BodyAndTeardown {
        body: Box<HarnessError>,
        teardown: Box<HarnessError>,
    },
}

impl From<RpcError> for HarnessError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Timeout {
                service,
                method,
                after,
            } => Self::Timeout {
                operation: format!("rpc {service}.{method}"),
                after,
            },
            other => Self::Rpc(other),
        }
    }
}

impl HarnessError {
    /// Whether the error is a recoverable timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Whether a namespace was found busy, here or in any teardown failure
    /// this error carries.
    #[must_use]
    pub fn is_namespace_busy(&self) -> bool {
        match self {
            Self::NamespaceBusy { .. } => true,
            Self::Teardown { failures } => failures.iter().any(|f| f.error.is_namespace_busy()),
            Self::BodyAndTeardown { body, teardown } => body.is_namespace_busy() || teardown.is_namespace_busy(),
            _ => false,
        }
    }

    /// The remote error, when the failure was raised by a callee.
    #[must_use]
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            Self::Rpc(RpcError::Remote(remote)) => Some(remote),
            _ => None,
        }
    }
}

/// Result type alias for harness operations.
pub type Result<T> = std::result::Result<T, HarnessError>;

/// Result type alias for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Result type alias for broker operations.
pub type BrokerResult<T> = std::result::Result<T, BrokerError>;

/// Result type alias for remote calls.
pub type RpcResult<T> = std::result::Result<T, RpcError>;
