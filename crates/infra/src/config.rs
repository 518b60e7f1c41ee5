//! Orchestrator configuration loading and representation.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::jobs::RetryPolicy;

/// Label stamped on every compute unit with the job it serves.
pub const JOB_ID_TAG: &str = "job_id";

/// Upper bound for configured runtimes and grace periods (ten years).
pub const MAX_SPAN_SECS: u64 = 10 * 365 * 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("invalid {key}={value:?}: {reason}")]
pub struct ConfigError {
    pub key: String,
    pub value: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    /// Runtime budget from submission to a terminal state.
    pub max_runtime: Duration,
    pub watchdog_interval: Duration,
    /// How long a Completed/Failed job may sit before the watchdog re-drives
    /// its reclaim. Defaults to the watchdog interval.
    pub reclaim_grace: Duration,
    pub scan_page_size: usize,
    /// Wait for the unit's `ProvisionAcked` before entering `Running`.
    pub await_provision_ack: bool,
    pub provision_retry: RetryPolicy,
    pub terminate_retry: RetryPolicy,
    pub dedup_token_window: usize,
    /// Extra labels for every compute unit, alongside `job_id`.
    pub unit_tags: BTreeMap<String, String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_runtime: Duration::from_secs(3600),
            watchdog_interval: Duration::from_secs(60),
            reclaim_grace: Duration::from_secs(60),
            scan_page_size: 100,
            await_provision_ack: false,
            provision_retry: RetryPolicy::default(),
            terminate_retry: RetryPolicy::default(),
            dedup_token_window: warden_core::DEFAULT_TOKEN_WINDOW,
            unit_tags: BTreeMap::new(),
        }
    }
}

impl OrchestratorConfig {
    /// Read `WARDEN_*` variables from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(secs) = parse::<u64>(&lookup, "WARDEN_MAX_RUNTIME_SECS")? {
            config.max_runtime = Duration::from_secs(secs);
        }
        if let Some(secs) = parse::<u64>(&lookup, "WARDEN_WATCHDOG_INTERVAL_SECS")? {
            config.watchdog_interval = Duration::from_secs(secs);
            config.reclaim_grace = config.watchdog_interval;
        }
        if let Some(secs) = parse::<u64>(&lookup, "WARDEN_RECLAIM_GRACE_SECS")? {
            config.reclaim_grace = Duration::from_secs(secs);
        }
        if let Some(size) = parse::<usize>(&lookup, "WARDEN_SCAN_PAGE_SIZE")? {
            config.scan_page_size = size;
        }
        if let Some(flag) = parse::<bool>(&lookup, "WARDEN_AWAIT_PROVISION_ACK")? {
            config.await_provision_ack = flag;
        }
        if let Some(window) = parse::<usize>(&lookup, "WARDEN_DEDUP_TOKEN_WINDOW")? {
            config.dedup_token_window = window;
        }

        let base_delay = parse::<u64>(&lookup, "WARDEN_RETRY_BASE_DELAY_MS")?.map(Duration::from_millis);
        let max_delay = parse::<u64>(&lookup, "WARDEN_RETRY_MAX_DELAY_MS")?.map(Duration::from_millis);
        for policy in [&mut config.provision_retry, &mut config.terminate_retry] {
            if let Some(base) = base_delay {
                policy.base_delay = base;
            }
            if let Some(max) = max_delay {
                policy.max_delay = max;
            }
        }
        if let Some(attempts) = parse::<u32>(&lookup, "WARDEN_PROVISION_MAX_ATTEMPTS")? {
            config.provision_retry.max_attempts = attempts;
        }
        if let Some(attempts) = parse::<u32>(&lookup, "WARDEN_TERMINATE_MAX_ATTEMPTS")? {
            config.terminate_retry.max_attempts = attempts;
        }

        if let Some(raw) = lookup("WARDEN_UNIT_TAGS") {
            config.unit_tags = parse_tags(&raw)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(key: &str, value: impl ToString, reason: &str) -> ConfigError {
            ConfigError {
                key: key.to_string(),
                value: value.to_string(),
                reason: reason.to_string(),
            }
        }

        if self.max_runtime.is_zero() {
            return Err(invalid("WARDEN_MAX_RUNTIME_SECS", 0, "must be positive"));
        }
        if self.max_runtime.as_secs() > MAX_SPAN_SECS {
            return Err(invalid(
                "WARDEN_MAX_RUNTIME_SECS",
                self.max_runtime.as_secs(),
                "exceeds ten years",
            ));
        }
        if self.reclaim_grace.as_secs() > MAX_SPAN_SECS {
            return Err(invalid(
                "WARDEN_RECLAIM_GRACE_SECS",
                self.reclaim_grace.as_secs(),
                "exceeds ten years",
            ));
        }
        if self.watchdog_interval.is_zero() {
            return Err(invalid("WARDEN_WATCHDOG_INTERVAL_SECS", 0, "must be positive"));
        }
        if self.scan_page_size == 0 {
            return Err(invalid("WARDEN_SCAN_PAGE_SIZE", 0, "must be positive"));
        }
        if self.dedup_token_window == 0 {
            return Err(invalid("WARDEN_DEDUP_TOKEN_WINDOW", 0, "must be positive"));
        }
        if self.provision_retry.max_attempts == 0 {
            return Err(invalid("WARDEN_PROVISION_MAX_ATTEMPTS", 0, "must be at least 1"));
        }
        if self.terminate_retry.max_attempts == 0 {
            return Err(invalid("WARDEN_TERMINATE_MAX_ATTEMPTS", 0, "must be at least 1"));
        }
        if self.unit_tags.contains_key(JOB_ID_TAG) {
            return Err(invalid("WARDEN_UNIT_TAGS", JOB_ID_TAG, "is reserved"));
        }
        Ok(())
    }

    pub fn max_runtime_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.max_runtime).unwrap_or_else(|_| chrono::Duration::weeks(5200))
    }

    pub fn reclaim_grace_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.reclaim_grace).unwrap_or_else(|_| chrono::Duration::weeks(5200))
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| ConfigError {
            key: key.to_string(),
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

/// `team=media,env=prod` style label lists.
fn parse_tags(raw: &str) -> Result<BTreeMap<String, String>, ConfigError> {
    let mut tags = BTreeMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').ok_or_else(|| ConfigError {
            key: "WARDEN_UNIT_TAGS".to_string(),
            value: raw.to_string(),
            reason: format!("expected key=value, got {pair:?}"),
        })?;
        if key.trim().is_empty() {
            return Err(ConfigError {
                key: "WARDEN_UNIT_TAGS".to_string(),
                value: raw.to_string(),
                reason: "empty tag key".to_string(),
            });
        }
        tags.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(tags)
}
