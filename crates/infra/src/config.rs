//! Engine configuration: defaults, serde and environment overrides.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::circuit::CircuitConfig;
use crate::keys::KeySpace;
use crate::lock::LockOptions;
use crate::sla::SlaTable;

pub const DEFAULT_NAMESPACE: &str = "jobforge";
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?}")]
    Invalid { var: String, value: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueConfig {
    pub namespace: String,
    pub redis_url: String,
    /// Pub/sub channel for queue events; `<namespace>:events` when unset.
    pub event_channel: Option<String>,
    /// Concurrent handlers per queue in one worker.
    pub worker_concurrency: usize,
    pub max_attempts: u32,
    pub idempotency_ttl_secs: u64,
    pub job_mapping_ttl_secs: u64,
    pub poll_interval_ms: u64,
    pub lock: LockOptions,
    pub circuit_defaults: CircuitConfig,
    pub circuit_overrides: HashMap<String, CircuitConfig>,
    pub sla: SlaTable,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            redis_url: DEFAULT_REDIS_URL.to_string(),
            event_channel: None,
            worker_concurrency: 5,
            max_attempts: jobforge_core::DEFAULT_MAX_ATTEMPTS,
            idempotency_ttl_secs: 24 * 60 * 60,
            job_mapping_ttl_secs: 7 * 24 * 60 * 60,
            poll_interval_ms: 250,
            lock: LockOptions::default(),
            circuit_defaults: CircuitConfig::default(),
            circuit_overrides: HashMap::new(),
            sla: SlaTable::default(),
        }
    }
}

impl QueueConfig {
    /// Defaults overlaid with `JOBFORGE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Like [`QueueConfig::from_env`] with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(ns) = lookup("JOBFORGE_NAMESPACE").filter(|v| !v.trim().is_empty()) {
            config.namespace = ns;
        }
        match lookup("JOBFORGE_REDIS_URL").filter(|v| !v.trim().is_empty()) {
            Some(url) => config.redis_url = url,
            None => warn!(
                redis_url = DEFAULT_REDIS_URL,
                "JOBFORGE_REDIS_URL not set; using local development default"
            ),
        }
        if let Some(channel) = lookup("JOBFORGE_EVENT_CHANNEL").filter(|v| !v.trim().is_empty()) {
            config.event_channel = Some(channel);
        }
        if let Some(n) = parse_var(&lookup, "JOBFORGE_WORKER_CONCURRENCY")? {
            config.worker_concurrency = n;
        }
        if let Some(n) = parse_var(&lookup, "JOBFORGE_MAX_ATTEMPTS")? {
            config.max_attempts = n;
        }
        if let Some(n) = parse_var(&lookup, "JOBFORGE_IDEMPOTENCY_TTL_SECS")? {
            config.idempotency_ttl_secs = n;
        }
        if let Some(n) = parse_var(&lookup, "JOBFORGE_POLL_INTERVAL_MS")? {
            config.poll_interval_ms = n;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |var: &str, value: String| ConfigError::Invalid {
            var: var.to_string(),
            value,
        };
        if self.namespace.contains(char::is_whitespace) || self.namespace.is_empty() {
            return Err(invalid("namespace", self.namespace.clone()));
        }
        if self.worker_concurrency == 0 {
            return Err(invalid("worker_concurrency", "0".into()));
        }
        if self.max_attempts == 0 {
            return Err(invalid("max_attempts", "0".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(invalid("poll_interval_ms", "0".into()));
        }
        Ok(())
    }

    pub fn keys(&self) -> KeySpace {
        KeySpace::new(self.namespace.clone())
    }

    pub fn event_channel(&self) -> String {
        self.event_channel
            .clone()
            .unwrap_or_else(|| format!("{}:events", self.namespace))
    }

    pub fn idempotency_ttl(&self) -> Duration {
        Duration::from_secs(self.idempotency_ttl_secs)
    }

    pub fn job_mapping_ttl(&self) -> Duration {
        Duration::from_secs(self.job_mapping_ttl_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn parse_var<F, T>(lookup: &F, var: &str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid {
                var: var.to_string(),
                value: raw,
            }),
    }
}
