//! Configuration types for the test harness.
//!
//! Two layers of configuration exist:
//!
//! - [`HarnessConfig`] - ambient settings (timeouts, retry budgets, naming,
//!   logging), loaded from YAML and validated before use.
//! - [`ServiceConfig`] - the flat key/value mapping handed to containers,
//!   composed per test from a namespace and caller overrides.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use regex::Regex;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::call_id::CallIdStrategy;
use crate::error::{ConfigError, ConfigResult};

/// Broker connection URI key.
pub const AMQP_URI_CONFIG_KEY: &str = "AMQP_URI";

/// Namespace (vhost) key.
pub const VHOST_CONFIG_KEY: &str = "vhost";

/// Broker user key.
pub const USERNAME_CONFIG_KEY: &str = "username";

/// Web server bind address key.
pub const WEB_SERVER_CONFIG_KEY: &str = "WEB_SERVER_ADDRESS";

/// Name of a registered container factory to use instead of the default.
pub const CONTAINER_FACTORY_CONFIG_KEY: &str = "SERVICE_CONTAINER_FACTORY";

/// Maximum concurrent workers per container.
pub const MAX_WORKERS_CONFIG_KEY: &str = "max_workers";

/// URI scheme of the in-process broker.
pub const MEMORY_SCHEME: &str = "memory";

/// Root configuration for the harness.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct HarnessConfig {
    /// Broker identity and management API access.
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Namespace naming and teardown budgets.
    #[serde(default)]
    pub namespace: NamespaceConfig,

    /// Container start/stop budgets.
    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    /// Remote call settings.
    #[serde(default)]
    pub rpc: RpcConfig,

    /// WebSocket endpoint and client settings.
    #[serde(default)]
    pub websocket: WebSocketConfig,

    /// Default call-id strategy for new scopes.
    #[serde(default)]
    pub call_ids: CallIdStrategy,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Broker identity.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrokerConfig {
    /// Name of the in-process broker, used as the host part of broker URIs.
    #[serde(default = "default_broker_name")]
    pub name: String,

    /// User recorded on every connection.
    #[serde(default = "default_username")]
    pub username: String,

    /// Management API of an external broker, used by housekeeping tools.
    #[serde(default)]
    pub management: Option<ManagementConfig>,
}

/// Management HTTP API access.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ManagementConfig {
    /// Base URI, e.g. "http://localhost:15672".
    #[serde(default = "default_management_uri")]
    pub uri: String,

    /// Supports environment variable expansion: "${RABBIT_USER}"
    #[serde(default = "default_username")]
    pub username: String,

    /// Supports environment variable expansion: "${RABBIT_PASS}"
    #[serde(default = "default_password")]
    pub password: String,

    /// Request timeout in milliseconds.
    #[serde(default = "default_management_timeout_ms")]
    pub timeout_ms: u64,
}

impl ManagementConfig {
    /// Get the username with environment variables expanded.
    #[must_use]
    pub fn username(&self) -> String {
        expand_env_vars(&self.username)
    }

    /// Get the password with environment variables expanded.
    #[must_use]
    pub fn password(&self) -> String {
        expand_env_vars(&self.password)
    }

    /// Request timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Expand environment variables in a string.
///
/// Replaces `${VAR_NAME}` with the value of the environment variable `VAR_NAME`.
/// If the variable is not set, replaces with an empty string.
fn expand_env_vars(s: &str) -> String {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex");
    re.replace_all(s, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_default()
    })
    .to_string()
}

/// Namespace naming and deletion budget.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NamespaceConfig {
    /// Prefix of every namespace the harness creates.
    #[serde(default = "default_namespace_prefix")]
    pub prefix: String,

    /// How many times deletion is retried while connections linger.
    #[serde(default = "default_delete_retries")]
    pub delete_retries: u32,

    /// Initial backoff between deletion attempts, doubled each retry.
    #[serde(default = "default_delete_backoff_ms")]
    pub delete_backoff_ms: u64,

    /// Upper bound for the deletion backoff.
    #[serde(default = "default_max_delete_backoff_ms")]
    pub max_delete_backoff_ms: u64,

    /// How long the teardown drain check waits for connections to close.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,

    /// Poll interval of the drain check.
    #[serde(default = "default_drain_poll_interval_ms")]
    pub drain_poll_interval_ms: u64,
}

impl NamespaceConfig {
    /// Initial deletion backoff.
    #[must_use]
    pub fn delete_backoff(&self) -> Duration {
        Duration::from_millis(self.delete_backoff_ms)
    }

    /// Upper bound for the deletion backoff.
    #[must_use]
    pub fn max_delete_backoff(&self) -> Duration {
        Duration::from_millis(self.max_delete_backoff_ms)
    }

    /// Drain check deadline.
    #[must_use]
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Drain check poll interval.
    #[must_use]
    pub fn drain_poll_interval(&self) -> Duration {
        Duration::from_millis(self.drain_poll_interval_ms)
    }
}

/// Container lifecycle budgets.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LifecycleConfig {
    /// Deadline for `start`.
    #[serde(default = "default_start_timeout_ms")]
    pub start_timeout_ms: u64,

    /// How long `stop` lets in-flight workers finish.
    #[serde(default = "default_stop_grace_period_ms")]
    pub stop_grace_period_ms: u64,

    /// Default concurrent worker limit per container.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
}

impl LifecycleConfig {
    /// Deadline for `start`.
    #[must_use]
    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    /// Grace period for in-flight workers during `stop`.
    #[must_use]
    pub fn stop_grace_period(&self) -> Duration {
        Duration::from_millis(self.stop_grace_period_ms)
    }
}

/// Remote call settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RpcConfig {
    /// Reply deadline for remote calls.
    #[serde(default = "default_rpc_timeout_ms")]
    pub timeout_ms: u64,
}

impl RpcConfig {
    /// Reply deadline for remote calls.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// WebSocket settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebSocketConfig {
    /// Path of the websocket endpoint on a container's web listener.
    #[serde(default = "default_websocket_path")]
    pub path: String,

    /// Reply deadline for `WebSocketHandle::rpc`.
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,

    /// Deadline for the handshake and the `connected` event.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl WebSocketConfig {
    /// Reply deadline for websocket rpc.
    #[must_use]
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    /// Deadline for establishing a socket.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

// Default value functions

fn default_broker_name() -> String {
    "localhost".to_string()
}

fn default_username() -> String {
    "guest".to_string()
}

fn default_password() -> String {
    "guest".to_string()
}

fn default_management_uri() -> String {
    "http://localhost:15672".to_string()
}

fn default_management_timeout_ms() -> u64 {
    5_000
}

fn default_namespace_prefix() -> String {
    "rpc-test".to_string()
}

fn default_delete_retries() -> u32 {
    5
}

fn default_delete_backoff_ms() -> u64 {
    50
}

fn default_max_delete_backoff_ms() -> u64 {
    1_000
}

fn default_drain_timeout_ms() -> u64 {
    2_000
}

fn default_drain_poll_interval_ms() -> u64 {
    25
}

fn default_start_timeout_ms() -> u64 {
    10_000
}

fn default_stop_grace_period_ms() -> u64 {
    5_000
}

fn default_max_workers() -> usize {
    10
}

fn default_rpc_timeout_ms() -> u64 {
    5_000
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_websocket_path() -> String {
    "/ws".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

// Default implementations

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            name: default_broker_name(),
            username: default_username(),
            management: None,
        }
    }
}

impl Default for ManagementConfig {
    fn default() -> Self {
        Self {
            uri: default_management_uri(),
            username: default_username(),
            password: default_password(),
            timeout_ms: default_management_timeout_ms(),
        }
    }
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            prefix: default_namespace_prefix(),
            delete_retries: default_delete_retries(),
            delete_backoff_ms: default_delete_backoff_ms(),
            max_delete_backoff_ms: default_max_delete_backoff_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
            drain_poll_interval_ms: default_drain_poll_interval_ms(),
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            start_timeout_ms: default_start_timeout_ms(),
            stop_grace_period_ms: default_stop_grace_period_ms(),
            max_workers: default_max_workers(),
        }
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_rpc_timeout_ms(),
        }
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            path: default_websocket_path(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// Configuration loading and validation

impl HarnessConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if
    /// validation fails.
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError {
            path: path.display().to_string(),
            source: e,
        })?;

        Self::from_str(&content)
    }

    /// Load configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if parsing or validation fails.
    pub fn from_str(content: &str) -> ConfigResult<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - the namespace prefix is empty or contains characters other than
    ///   ASCII alphanumerics, `-` and `_`
    /// - any timeout or poll interval is zero
    /// - `max_workers` is zero
    /// - the websocket path does not start with `/`
    pub fn validate(&self) -> ConfigResult<()> {
        let prefix = &self.namespace.prefix;
        if prefix.is_empty()
            || !prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(invalid(
                "namespace.prefix",
                format!("'{prefix}' must be non-empty and use only [A-Za-z0-9_-]"),
            ));
        }

        let durations = [
            ("namespace.drain_timeout_ms", self.namespace.drain_timeout_ms),
            (
                "namespace.drain_poll_interval_ms",
                self.namespace.drain_poll_interval_ms,
            ),
            ("lifecycle.start_timeout_ms", self.lifecycle.start_timeout_ms),
            ("rpc.timeout_ms", self.rpc.timeout_ms),
            ("websocket.rpc_timeout_ms", self.websocket.rpc_timeout_ms),
            (
                "websocket.connect_timeout_ms",
                self.websocket.connect_timeout_ms,
            ),
        ];
        for (key, value) in durations {
            if value == 0 {
                return Err(invalid(key, "must be greater than zero"));
            }
        }

        if self.namespace.max_delete_backoff_ms < self.namespace.delete_backoff_ms {
            return Err(invalid(
                "namespace.max_delete_backoff_ms",
                "must be >= namespace.delete_backoff_ms",
            ));
        }

        if self.lifecycle.max_workers == 0 {
            return Err(invalid("lifecycle.max_workers", "must be at least 1"));
        }

        if !self.websocket.path.starts_with('/') {
            return Err(invalid("websocket.path", "must start with '/'"));
        }

        Ok(())
    }
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}

/// Flat key/value configuration handed to containers.
///
/// Recognized keys have typed accessors; everything else is passed through
/// untouched and can be read back with [`get`](Self::get).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceConfig {
    values: BTreeMap<String, Value>,
}

impl ServiceConfig {
    /// An empty configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration pointing at `vhost` on the in-process broker `broker`.
    #[must_use]
    pub fn for_namespace(broker: &str, username: &str, vhost: &str) -> Self {
        Self::new()
            .with(
                AMQP_URI_CONFIG_KEY,
                format!("{MEMORY_SCHEME}://{username}@{broker}/{vhost}"),
            )
            .with(VHOST_CONFIG_KEY, vhost)
            .with(USERNAME_CONFIG_KEY, username)
    }

    /// Return a copy with `key` set.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    /// Set `key`.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    /// Remove `key`, returning its value.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    /// Raw value of `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// String value of `key`, if present and a string.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    /// Whether `key` is present.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Number of keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the configuration has no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterate over all keys and values.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    /// Parsed broker URI.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is missing or not a valid URI.
    pub fn amqp_uri(&self) -> ConfigResult<Url> {
        let raw = self
            .get_str(AMQP_URI_CONFIG_KEY)
            .ok_or_else(|| ConfigError::MissingKey(AMQP_URI_CONFIG_KEY.to_string()))?;
        Url::parse(raw).map_err(|_| ConfigError::InvalidUri(raw.to_string()))
    }

    /// The namespace the configuration points at.
    ///
    /// The explicit `vhost` key wins; otherwise the first path segment of the
    /// broker URI is used.
    ///
    /// # Errors
    ///
    /// Returns an error if neither source names a vhost.
    pub fn vhost(&self) -> ConfigResult<String> {
        if let Some(vhost) = self.get_str(VHOST_CONFIG_KEY) {
            return Ok(vhost.to_string());
        }
        let uri = self.amqp_uri()?;
        uri.path_segments()
            .and_then(|mut segments| segments.next())
            .filter(|segment| !segment.is_empty())
            .map(str::to_string)
            .ok_or_else(|| ConfigError::MissingKey(VHOST_CONFIG_KEY.to_string()))
    }

    /// The broker user, from `username` or the URI.
    #[must_use]
    pub fn username(&self) -> Option<String> {
        if let Some(user) = self.get_str(USERNAME_CONFIG_KEY) {
            return Some(user.to_string());
        }
        self.amqp_uri()
            .ok()
            .map(|uri| uri.username().to_string())
            .filter(|user| !user.is_empty())
    }

    /// Web listener address, if configured.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not an `ip:port` pair.
    pub fn web_server_address(&self) -> ConfigResult<Option<SocketAddr>> {
        match self.get(WEB_SERVER_CONFIG_KEY) {
            None => Ok(None),
            Some(Value::String(raw)) => raw
                .parse()
                .map(Some)
                .map_err(|_| ConfigError::InvalidAddress(raw.clone())),
            Some(other) => Err(ConfigError::InvalidAddress(other.to_string())),
        }
    }

    /// Name of the container factory override, if any.
    #[must_use]
    pub fn container_factory(&self) -> Option<&str> {
        self.get_str(CONTAINER_FACTORY_CONFIG_KEY)
    }

    /// Worker limit override, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a positive integer.
    pub fn max_workers(&self) -> ConfigResult<Option<usize>> {
        match self.get(MAX_WORKERS_CONFIG_KEY) {
            None => Ok(None),
            Some(value) => value
                .as_u64()
                .filter(|n| *n > 0)
                .and_then(|n| usize::try_from(n).ok())
                .map(Some)
                .ok_or_else(|| invalid(MAX_WORKERS_CONFIG_KEY, "must be a positive integer")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config_passes_validation() {
        let config = HarnessConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_values_applied() {
        let config = HarnessConfig::from_str("namespace:\n  prefix: ci\n").unwrap();
        assert_eq!(config.namespace.prefix, "ci");
        assert_eq!(config.namespace.delete_retries, 5);
        assert_eq!(config.lifecycle.stop_grace_period(), Duration::from_secs(5));
        assert_eq!(config.websocket.path, "/ws");
        assert_eq!(config.call_ids, CallIdStrategy::Random);
        assert!(config.broker.management.is_none());
    }

    #[test]
    fn test_call_id_strategy_parsing() {
        let config = HarnessConfig::from_str("call_ids: sequential\n").unwrap();
        assert_eq!(config.call_ids, CallIdStrategy::Sequential);
    }

    #[test]
    fn test_invalid_prefix() {
        let result = HarnessConfig::from_str("namespace:\n  prefix: 'has space'\n");
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut config = HarnessConfig::default();
        config.rpc.timeout_ms = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("rpc.timeout_ms"));
    }

    #[test]
    fn test_backoff_bounds_checked() {
        let mut config = HarnessConfig::default();
        config.namespace.delete_backoff_ms = 500;
        config.namespace.max_delete_backoff_ms = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "broker:\n  name: ci-broker\n  management:\n    uri: 'http://rabbit:15672'\nlifecycle:\n  max_workers: 3\n"
        )
        .unwrap();

        let config = HarnessConfig::from_file(file.path()).unwrap();
        assert_eq!(config.broker.name, "ci-broker");
        assert_eq!(config.lifecycle.max_workers, 3);
        let management = config.broker.management.unwrap();
        assert_eq!(management.uri, "http://rabbit:15672");
        assert_eq!(management.username(), "guest");
    }

    #[test]
    fn test_from_missing_file() {
        let result = HarnessConfig::from_file("/definitely/not/here.yaml");
        assert!(matches!(result, Err(ConfigError::IoError { .. })));
    }

    #[test]
    fn test_env_var_expansion() {
        std::env::set_var("TEST_RPC_HARNESS_USER", "ci-user");
        let management = ManagementConfig {
            username: "${TEST_RPC_HARNESS_USER}".to_string(),
            password: "${TEST_RPC_HARNESS_MISSING}".to_string(),
            ..ManagementConfig::default()
        };
        assert_eq!(management.username(), "ci-user");
        assert_eq!(management.password(), "");
        std::env::remove_var("TEST_RPC_HARNESS_USER");
    }

    #[test]
    fn test_service_config_for_namespace() {
        let config = ServiceConfig::for_namespace("localhost", "guest", "rpc-test-abc");
        assert_eq!(
            config.get_str(AMQP_URI_CONFIG_KEY),
            Some("memory://guest@localhost/rpc-test-abc")
        );
        assert_eq!(config.vhost().unwrap(), "rpc-test-abc");
        assert_eq!(config.username().as_deref(), Some("guest"));
    }

    #[test]
    fn test_vhost_from_uri_path() {
        let config = ServiceConfig::new().with(AMQP_URI_CONFIG_KEY, "memory://u@broker/ns-1");
        assert_eq!(config.vhost().unwrap(), "ns-1");
        assert_eq!(config.username().as_deref(), Some("u"));
    }

    #[test]
    fn test_vhost_missing() {
        let config = ServiceConfig::new().with(AMQP_URI_CONFIG_KEY, "memory://broker");
        assert!(matches!(config.vhost(), Err(ConfigError::MissingKey(_))));
        assert!(matches!(
            ServiceConfig::new().vhost(),
            Err(ConfigError::MissingKey(_))
        ));
    }

    #[test]
    fn test_web_server_address() {
        let config = ServiceConfig::new().with(WEB_SERVER_CONFIG_KEY, "127.0.0.1:0");
        let addr = config.web_server_address().unwrap().unwrap();
        assert_eq!(addr.port(), 0);

        let bad = ServiceConfig::new().with(WEB_SERVER_CONFIG_KEY, "nowhere");
        assert!(matches!(
            bad.web_server_address(),
            Err(ConfigError::InvalidAddress(_))
        ));
        assert_eq!(ServiceConfig::new().web_server_address().unwrap(), None);
    }

    #[test]
    fn test_unknown_keys_pass_through() {
        let config = ServiceConfig::new().with("CUSTOM_SETTING", serde_json::json!({"a": 1}));
        assert_eq!(config.get("CUSTOM_SETTING").unwrap()["a"], 1);
        assert_eq!(config.len(), 1);
    }

    #[test]
    fn test_max_workers() {
        assert_eq!(ServiceConfig::new().max_workers().unwrap(), None);
        let config = ServiceConfig::new().with(MAX_WORKERS_CONFIG_KEY, 4);
        assert_eq!(config.max_workers().unwrap(), Some(4));
        let zero = ServiceConfig::new().with(MAX_WORKERS_CONFIG_KEY, 0);
        assert!(zero.max_workers().is_err());
    }
}
