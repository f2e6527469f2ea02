use hypervisor_reconciler::{Authorizer, ConsumerStore, PrincipalAuthorizer, Reconciler, UuidGenerator};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

pub const STATE_PATH_VAR: &str = "HYPERVISOR_STATE_PATH";
pub const MAX_REPORT_HOSTS_VAR: &str = "HYPERVISOR_MAX_REPORT_HOSTS";
pub const LOG_VAR: &str = "HYPERVISOR_LOG";

const DEFAULT_STATE_PATH: &str = "./data/consumers.json";
const DEFAULT_MAX_REPORT_HOSTS: usize = 10_000;
const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {value:?}")]
    InvalidValue { var: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilerConfig {
    /// Where the binary keeps its consumer store snapshot.
    pub state_path: PathBuf,
    /// Reports with more host entries are refused before reconciliation.
    pub max_report_hosts: usize,
    /// Tracing filter used when `RUST_LOG` is not set.
    pub log_filter: String,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            state_path: PathBuf::from(DEFAULT_STATE_PATH),
            max_report_hosts: DEFAULT_MAX_REPORT_HOSTS,
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl ReconcilerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(path) = lookup(STATE_PATH_VAR).filter(|v| !v.trim().is_empty()) {
            config.state_path = PathBuf::from(path);
        }
        if let Some(value) = lookup(MAX_REPORT_HOSTS_VAR) {
            config.max_report_hosts =
                value
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue {
                        var: MAX_REPORT_HOSTS_VAR,
                        value: value.clone(),
                    })?;
        }
        if let Some(filter) = lookup(LOG_VAR).filter(|v| !v.trim().is_empty()) {
            config.log_filter = filter;
        }
        Ok(config)
    }
}

#[derive(Clone)]
pub struct ReconcilerContext {
    pub config: ReconcilerConfig,
    pub reconciler: Arc<Reconciler>,
}

impl ReconcilerContext {
    pub fn new(config: ReconcilerConfig, reconciler: Reconciler) -> Self {
        Self {
            config,
            reconciler: Arc::new(reconciler),
        }
    }

    /// Context over `store` with the default authorizer and uuid generator.
    pub fn with_store(config: ReconcilerConfig, store: Arc<dyn ConsumerStore>) -> Self {
        Self::with_authorizer(config, store, Arc::new(PrincipalAuthorizer))
    }

    pub fn with_authorizer(
        config: ReconcilerConfig,
        store: Arc<dyn ConsumerStore>,
        authorizer: Arc<dyn Authorizer>,
    ) -> Self {
        info!(
            max_report_hosts = config.max_report_hosts,
            state_path = %config.state_path.display(),
            "Initializing reconciler context"
        );
        let reconciler = Reconciler::new(store, authorizer, Arc::new(UuidGenerator));
        Self::new(config, reconciler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ReconcilerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, ReconcilerConfig::default());
        assert_eq!(config.state_path, PathBuf::from("./data/consumers.json"));
        assert_eq!(config.max_report_hosts, 10_000);
        assert_eq!(config.log_filter, "info");
    }

    #[test]
    fn test_overrides() {
        let config = ReconcilerConfig::from_lookup(lookup(&[
            (STATE_PATH_VAR, "/var/lib/hypervisors.json"),
            (MAX_REPORT_HOSTS_VAR, " 50 "),
            (LOG_VAR, "debug"),
        ]))
        .unwrap();
        assert_eq!(config.state_path, PathBuf::from("/var/lib/hypervisors.json"));
        assert_eq!(config.max_report_hosts, 50);
        assert_eq!(config.log_filter, "debug");
    }

    #[test]
    fn test_unparsable_host_limit() {
        let err = ReconcilerConfig::from_lookup(lookup(&[(MAX_REPORT_HOSTS_VAR, "lots")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                var: MAX_REPORT_HOSTS_VAR,
                value: "lots".to_string()
            }
        );
    }
}
