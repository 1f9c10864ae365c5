//! Provider configuration.
//!
//! Built once in `main` from the command line and handed to every component
//! as `Arc<ProviderConfig>`. Nothing in the crate reads configuration from
//! process-wide state.

use std::time::Duration;

/// Namespace used when a request does not name one.
pub const DEFAULT_NAMESPACE: &str = "openfaas-fn";

/// Label a namespace must carry before functions in it are served.
pub const NAMESPACE_LABEL: &str = "openfaas";
pub const NAMESPACE_LABEL_VALUE: &str = "1";

/// Port the in-container watchdog listens on.
pub const WATCHDOG_PORT: u16 = 8080;

/// Watchdog control paths.
pub const SCALE_READER_PATH: &str = "/scale-reader";
pub const SCALE_UPDATER_PATH: &str = "/scale-updater";

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub default_namespace: String,
    pub namespace_label: String,
    pub namespace_label_value: String,
    /// Appended to endpoints that carry no port of their own.
    pub watchdog_port: u16,
    pub read_path: String,
    pub update_path: String,
    /// Bound on a whole watchdog call, connect included.
    pub read_timeout: Duration,
    pub connect_timeout: Duration,
    pub max_idle_conns_per_host: usize,
    pub idle_conn_timeout: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            default_namespace: DEFAULT_NAMESPACE.to_string(),
            namespace_label: NAMESPACE_LABEL.to_string(),
            namespace_label_value: NAMESPACE_LABEL_VALUE.to_string(),
            watchdog_port: WATCHDOG_PORT,
            read_path: SCALE_READER_PATH.to_string(),
            update_path: SCALE_UPDATER_PATH.to_string(),
            read_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(3),
            max_idle_conns_per_host: 1024,
            idle_conn_timeout: Duration::from_millis(120),
        }
    }
}

impl ProviderConfig {
    /// Substitutes the default namespace for a missing or blank one.
    pub fn namespace_or_default<'a>(&'a self, requested: Option<&'a str>) -> &'a str {
        match requested.map(str::trim) {
            Some(namespace) if !namespace.is_empty() => namespace,
            _ => &self.default_namespace,
        }
    }
}
