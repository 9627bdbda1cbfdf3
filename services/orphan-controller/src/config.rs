//! Configuration for the orphan controller.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use keel_reconcile::{
    BackoffPolicy, RetryPolicy, DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_MAX, DEFAULT_WORKERS,
};

use crate::disk_service::DEFAULT_DISK_SERVICE_PORT;

/// Namespace orphans live in unless configured otherwise.
pub const DEFAULT_NAMESPACE: &str = "keel-system";

/// Settings the controller itself needs.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Identity of this controller instance; the name of the node it runs on.
    pub controller_id: String,

    /// Namespace of the orphans this controller handles.
    pub namespace: String,

    /// Number of reconcile workers.
    pub workers: usize,

    pub retry: RetryPolicy,

    pub backoff: BackoffPolicy,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            controller_id: String::new(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            workers: DEFAULT_WORKERS,
            retry: RetryPolicy::default(),
            backoff: BackoffPolicy::default(),
        }
    }
}

impl ControllerConfig {
    pub fn new(controller_id: impl Into<String>) -> Self {
        Self {
            controller_id: controller_id.into(),
            ..Default::default()
        }
    }
}

/// Process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub controller: ControllerConfig,

    /// Disk service port on instance managers.
    pub disk_service_port: u16,

    /// Connect and request timeout for disk service calls.
    pub rpc_timeout: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// JSON file to seed the in-memory store from.
    pub seed_file: Option<String>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(name).filter(|v| !v.is_empty());

        let controller_id = match var("KEEL_CONTROLLER_ID")
            .or_else(|| var("NODE_NAME"))
            .or_else(|| var("HOSTNAME"))
        {
            Some(id) => id,
            None => bail!("controller id not set: set KEEL_CONTROLLER_ID or NODE_NAME"),
        };

        let namespace = var("KEEL_NAMESPACE").unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());

        let workers: usize = parse_or(&var, "KEEL_WORKERS", DEFAULT_WORKERS)?;
        if workers == 0 {
            bail!("KEEL_WORKERS must be at least 1");
        }

        let max_retries = parse_or(&var, "KEEL_MAX_RETRIES", RetryPolicy::default().max_retries)?;

        let backoff_base_ms = parse_or(
            &var,
            "KEEL_BACKOFF_BASE_MS",
            DEFAULT_BACKOFF_BASE.as_millis() as u64,
        )?;
        let backoff_max_secs =
            parse_or(&var, "KEEL_BACKOFF_MAX_SECS", DEFAULT_BACKOFF_MAX.as_secs())?;

        let disk_service_port = parse_or(&var, "KEEL_DISK_SERVICE_PORT", DEFAULT_DISK_SERVICE_PORT)?;
        let rpc_timeout_secs: u64 = parse_or(&var, "KEEL_RPC_TIMEOUT_SECS", 30)?;

        let log_level = var("KEEL_LOG_LEVEL").unwrap_or_else(|| "info".to_string());
        let seed_file = var("KEEL_SEED_FILE");

        Ok(Self {
            controller: ControllerConfig {
                controller_id,
                namespace,
                workers,
                retry: RetryPolicy { max_retries },
                backoff: BackoffPolicy::new(
                    Duration::from_millis(backoff_base_ms),
                    Duration::from_secs(backoff_max_secs),
                ),
            },
            disk_service_port,
            rpc_timeout: Duration::from_secs(rpc_timeout_secs),
            log_level,
            seed_file,
        })
    }
}

fn parse_or<T>(var: impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match var(name) {
        Some(value) => value
            .parse()
            .with_context(|| format!("invalid value for {name}: {value:?}")),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[("KEEL_CONTROLLER_ID", "node-1")]).unwrap();

        assert_eq!(config.controller.controller_id, "node-1");
        assert_eq!(config.controller.namespace, "keel-system");
        assert_eq!(config.controller.workers, 4);
        assert_eq!(config.controller.retry.max_retries, 3);
        assert_eq!(config.controller.backoff.base, Duration::from_millis(5));
        assert_eq!(config.controller.backoff.max, Duration::from_secs(1000));
        assert_eq!(config.disk_service_port, 8503);
        assert_eq!(config.rpc_timeout, Duration::from_secs(30));
        assert_eq!(config.log_level, "info");
        assert!(config.seed_file.is_none());
    }

    #[test]
    fn test_controller_id_fallbacks() {
        let config = load(&[("NODE_NAME", "node-2"), ("HOSTNAME", "host")]).unwrap();
        assert_eq!(config.controller.controller_id, "node-2");

        let config = load(&[("HOSTNAME", "host")]).unwrap();
        assert_eq!(config.controller.controller_id, "host");

        assert!(load(&[("KEEL_CONTROLLER_ID", "")]).is_err());
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("KEEL_CONTROLLER_ID", "node-1"),
            ("KEEL_NAMESPACE", "storage"),
            ("KEEL_WORKERS", "8"),
            ("KEEL_MAX_RETRIES", "5"),
            ("KEEL_BACKOFF_BASE_MS", "100"),
            ("KEEL_BACKOFF_MAX_SECS", "60"),
            ("KEEL_DISK_SERVICE_PORT", "9000"),
            ("KEEL_RPC_TIMEOUT_SECS", "5"),
            ("KEEL_SEED_FILE", "/etc/keel/seed.json"),
        ])
        .unwrap();

        assert_eq!(config.controller.namespace, "storage");
        assert_eq!(config.controller.workers, 8);
        assert_eq!(config.controller.retry.max_retries, 5);
        assert_eq!(config.controller.backoff.base, Duration::from_millis(100));
        assert_eq!(config.controller.backoff.max, Duration::from_secs(60));
        assert_eq!(config.disk_service_port, 9000);
        assert_eq!(config.rpc_timeout, Duration::from_secs(5));
        assert_eq!(config.seed_file.as_deref(), Some("/etc/keel/seed.json"));
    }

    #[test]
    fn test_invalid_values() {
        assert!(load(&[("KEEL_CONTROLLER_ID", "n"), ("KEEL_WORKERS", "many")]).is_err());
        assert!(load(&[("KEEL_CONTROLLER_ID", "n"), ("KEEL_WORKERS", "0")]).is_err());
        assert!(load(&[("KEEL_CONTROLLER_ID", "n"), ("KEEL_DISK_SERVICE_PORT", "70000")]).is_err());
    }
}
