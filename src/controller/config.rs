//! Operator configuration read from the environment

use std::path::PathBuf;
use std::time::Duration;

use crate::controller::error::{Error, Result};

/// Runtime settings shared by the controllers
#[derive(Clone, Debug, PartialEq)]
pub struct OperatorConfig {
    /// Identity used for leader election
    pub pod_name: String,
    /// Namespace holding the leader lease
    pub pod_namespace: String,
    /// Restrict watches to one namespace; `None` watches the whole cluster
    pub watch_namespace: Option<String>,
    /// Bound on waiting for a StatefulSet to become ready
    pub readiness_timeout: Duration,
    pub readiness_poll_interval: Duration,
    /// Bound on waiting for the restore job
    pub restore_timeout: Duration,
    /// Pause after StatefulSets are ready before the cluster is declared running
    pub settle_delay: Duration,
    pub password_length: usize,
    /// Create a service account, role and binding per database
    pub enable_rbac: bool,
    pub exporter_port: i32,
    pub health_port: u16,
    /// HTTPS port of the validating admission webhook
    pub webhook_port: u16,
    /// Serving certificate of the webhook; the webhook is disabled without it
    pub webhook_cert_path: PathBuf,
    pub webhook_key_path: PathBuf,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            pod_name: "elasticsearch-operator".to_string(),
            pod_namespace: "default".to_string(),
            watch_namespace: None,
            readiness_timeout: Duration::from_secs(600),
            readiness_poll_interval: Duration::from_secs(5),
            restore_timeout: Duration::from_secs(1800),
            settle_delay: Duration::from_secs(60),
            password_length: 8,
            enable_rbac: true,
            exporter_port: 56790,
            health_port: 8080,
            webhook_port: 8443,
            webhook_cert_path: PathBuf::from("/etc/webhook/certs/tls.crt"),
            webhook_key_path: PathBuf::from("/etc/webhook/certs/tls.key"),
        }
    }
}

impl OperatorConfig {
    /// Build the configuration from process environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let pod_name = lookup("POD_NAME")
            .or_else(|| {
                hostname::get()
                    .ok()
                    .and_then(|h| h.into_string().ok())
            })
            .unwrap_or(defaults.pod_name);

        Ok(Self {
            pod_name,
            pod_namespace: lookup("POD_NAMESPACE").unwrap_or(defaults.pod_namespace),
            watch_namespace: lookup("WATCH_NAMESPACE").filter(|ns| !ns.is_empty()),
            readiness_timeout: secs(&lookup, "READINESS_TIMEOUT_SECS", defaults.readiness_timeout)?,
            readiness_poll_interval: secs(
                &lookup,
                "READINESS_POLL_INTERVAL_SECS",
                defaults.readiness_poll_interval,
            )?,
            restore_timeout: secs(&lookup, "RESTORE_TIMEOUT_SECS", defaults.restore_timeout)?,
            settle_delay: secs(&lookup, "SETTLE_DELAY_SECS", defaults.settle_delay)?,
            password_length: parsed(&lookup, "PASSWORD_LENGTH", defaults.password_length)?,
            enable_rbac: parsed(&lookup, "ENABLE_RBAC", defaults.enable_rbac)?,
            exporter_port: parsed(&lookup, "EXPORTER_PORT", defaults.exporter_port)?,
            health_port: parsed(&lookup, "HEALTH_PORT", defaults.health_port)?,
            webhook_port: parsed(&lookup, "WEBHOOK_PORT", defaults.webhook_port)?,
            webhook_cert_path: lookup("WEBHOOK_CERT_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.webhook_cert_path),
            webhook_key_path: lookup("WEBHOOK_KEY_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.webhook_key_path),
        })
    }
}

fn parsed<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| Error::InvalidConfig(format!("{}={:?} is not valid", key, raw))),
    }
}

fn secs<F>(lookup: &F, key: &str, default: Duration) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    parsed(lookup, key, default.as_secs()).map(Duration::from_secs)
}
