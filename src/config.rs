use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::backoff::BackoffPolicy;
use crate::constants::*;
use crate::retry::RetryOptions;
use crate::types::{Result, SyncError, TraceId};

/// Top-level settings for the sync layer. Every field has a default, so a partial
/// TOML/JSON document or a handful of env vars is enough.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub base_url: String,
    pub events_path: String,
    pub legacy_events_path: Option<String>,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub reconnect: bool,
    pub max_retries: u32,
    pub error_grace_ms: u64,
    pub liveness_timeout_ms: u64,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".to_string(),
            events_path: EVENTS_PATH_TEMPLATE.to_string(),
            legacy_events_path: Some(LEGACY_EVENTS_PATH_TEMPLATE.to_string()),
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            reconnect: true,
            max_retries: DEFAULT_MAX_RETRIES,
            error_grace_ms: DEFAULT_ERROR_GRACE_MS,
            liveness_timeout_ms: DEFAULT_LIVENESS_TIMEOUT_MS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
        }
    }
}

fn parse_env<T: FromStr>(key: &str, lookup: &impl Fn(&str) -> Option<String>) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| SyncError::Config(format!("{}={:?}: {}", key, raw, e)).into()),
        _ => Ok(None),
    }
}

impl SyncConfig {
    /// Defaults overridden by `CHAT_SYNC_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(v) = parse_env::<String>(ENV_BASE_URL, &lookup)? {
            config.base_url = v;
        }
        if let Some(v) = parse_env::<String>(ENV_LEGACY_EVENTS_PATH, &lookup)? {
            config.legacy_events_path = match v.as_str() {
                "none" | "off" => None,
                _ => Some(v),
            };
        }
        if let Some(v) = parse_env(ENV_BASE_DELAY_MS, &lookup)? {
            config.base_delay_ms = v;
        }
        if let Some(v) = parse_env(ENV_MAX_DELAY_MS, &lookup)? {
            config.max_delay_ms = v;
        }
        if let Some(v) = parse_env(ENV_MAX_RECONNECTS, &lookup)? {
            config.max_reconnect_attempts = v;
        }
        if let Some(v) = parse_env(ENV_RECONNECT, &lookup)? {
            config.reconnect = v;
        }
        if let Some(v) = parse_env(ENV_MAX_RETRIES, &lookup)? {
            config.max_retries = v;
        }
        if let Some(v) = parse_env(ENV_ERROR_GRACE_MS, &lookup)? {
            config.error_grace_ms = v;
        }
        if let Some(v) = parse_env(ENV_LIVENESS_TIMEOUT_MS, &lookup)? {
            config.liveness_timeout_ms = v;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.base_url.trim().is_empty() {
            return Err(SyncError::Config("base_url must not be empty".to_string()).into());
        }
        if !self.events_path.contains("{job_id}") {
            return Err(SyncError::Config(format!(
                "events_path {:?} must contain {{job_id}}",
                self.events_path
            ))
            .into());
        }
        if let Some(legacy) = &self.legacy_events_path {
            if !legacy.contains("{job_id}") {
                return Err(SyncError::Config(format!(
                    "legacy_events_path {:?} must contain {{job_id}}",
                    legacy
                ))
                .into());
            }
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(SyncError::Config(format!(
                "max_delay_ms ({}) is below base_delay_ms ({})",
                self.max_delay_ms, self.base_delay_ms
            ))
            .into());
        }
        if self.error_grace_ms < MIN_ERROR_GRACE_MS {
            return Err(SyncError::Config(format!(
                "error_grace_ms ({}) must be at least {}",
                self.error_grace_ms, MIN_ERROR_GRACE_MS
            ))
            .into());
        }
        if self.liveness_timeout_ms < MIN_LIVENESS_TIMEOUT_MS {
            return Err(SyncError::Config(format!(
                "liveness_timeout_ms ({}) must be at least {}",
                self.liveness_timeout_ms, MIN_LIVENESS_TIMEOUT_MS
            ))
            .into());
        }
        Ok(())
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::from_millis(self.base_delay_ms, self.max_delay_ms)
    }

    pub fn connection(&self, trace_id: TraceId) -> ConnectionConfig {
        ConnectionConfig {
            base_url: self.base_url.clone(),
            events_path: self.events_path.clone(),
            legacy_events_path: self.legacy_events_path.clone(),
            reconnect: self.reconnect,
            max_reconnect_attempts: self.max_reconnect_attempts,
            backoff: self.backoff(),
            trace_id,
        }
    }

    pub fn tracker(&self) -> TrackerConfig {
        TrackerConfig {
            error_grace: Duration::from_millis(self.error_grace_ms),
            liveness_timeout: Duration::from_millis(self.liveness_timeout_ms),
        }
    }

    pub fn retry(&self) -> RetryOptions {
        RetryOptions::new(self.max_retries, self.backoff())
    }

    pub fn http_client(&self) -> Result<reqwest::Client> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(self.connect_timeout_secs))
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .build()?;
        Ok(client)
    }
}

/// Per-stream settings derived from [`SyncConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    pub base_url: String,
    pub events_path: String,
    pub legacy_events_path: Option<String>,
    pub reconnect: bool,
    pub max_reconnect_attempts: u32,
    pub backoff: BackoffPolicy,
    pub trace_id: TraceId,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        SyncConfig::default().connection(TraceId::new())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerConfig {
    /// How long a recoverable connection issue stays visible without new events.
    pub error_grace: Duration,
    /// Silence after which the job is treated as disconnected.
    pub liveness_timeout: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        SyncConfig::default().tracker()
    }
}
