//! Process configuration.
//!
//! Everything is read from `HUBFLOW_*` environment variables with defaults
//! suitable for a single local node. Routing comes from a JSON file when
//! `HUBFLOW_ROUTING_FILE` is set, else from the built-in five-hub topology.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use hubflow_observability::LogFormat;
use hubflow_sync::{SyncConfiguration, default_topology};

pub const REDIS_URL: &str = "HUBFLOW_REDIS_URL";
pub const MAX_CONCURRENCY: &str = "HUBFLOW_MAX_CONCURRENCY";
pub const REGISTRY_TTL_SECS: &str = "HUBFLOW_REGISTRY_TTL_SECS";
pub const SWEEP_INTERVAL_SECS: &str = "HUBFLOW_SWEEP_INTERVAL_SECS";
pub const CONFLICT_WINDOW_MS: &str = "HUBFLOW_CONFLICT_WINDOW_MS";
pub const APPLY_TIMEOUT_MS: &str = "HUBFLOW_APPLY_TIMEOUT_MS";
pub const ROUTING_FILE: &str = "HUBFLOW_ROUTING_FILE";
pub const LOG_FORMAT: &str = "HUBFLOW_LOG_FORMAT";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("cannot read routing file {path}: {source}")]
    RoutingIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse routing file {path}: {source}")]
    RoutingParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubflowConfig {
    /// Redis broker URL; the in-memory broker is used when unset.
    pub redis_url: Option<String>,
    pub max_concurrency: usize,
    pub registry_ttl: Duration,
    pub sweep_interval: Duration,
    pub conflict_window: Duration,
    pub apply_timeout: Duration,
    pub routing_file: Option<PathBuf>,
    pub log_format: LogFormat,
}

impl Default for HubflowConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            max_concurrency: 10,
            registry_ttl: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(60),
            conflict_window: Duration::from_millis(5000),
            apply_timeout: Duration::from_millis(5000),
            routing_file: None,
            log_format: LogFormat::Json,
        }
    }
}

impl HubflowConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable source; unset or blank values keep
    /// their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let max_concurrency = match get(MAX_CONCURRENCY) {
            Some(raw) => match parse::<usize>(MAX_CONCURRENCY, &raw)? {
                0 => return Err(invalid(MAX_CONCURRENCY, &raw, "must be at least 1")),
                n => n,
            },
            None => defaults.max_concurrency,
        };

        let log_format = match get(LOG_FORMAT) {
            Some(raw) => raw
                .parse::<LogFormat>()
                .map_err(|e| invalid(LOG_FORMAT, &raw, e))?,
            None => defaults.log_format,
        };

        Ok(Self {
            redis_url: get(REDIS_URL),
            max_concurrency,
            registry_ttl: secs(get(REGISTRY_TTL_SECS), REGISTRY_TTL_SECS, defaults.registry_ttl)?,
            sweep_interval: secs(get(SWEEP_INTERVAL_SECS), SWEEP_INTERVAL_SECS, defaults.sweep_interval)?,
            conflict_window: millis(get(CONFLICT_WINDOW_MS), CONFLICT_WINDOW_MS, defaults.conflict_window)?,
            apply_timeout: millis(get(APPLY_TIMEOUT_MS), APPLY_TIMEOUT_MS, defaults.apply_timeout)?,
            routing_file: get(ROUTING_FILE).map(PathBuf::from),
            log_format,
        })
    }

    /// Routing table: the configured file, or the default topology.
    pub fn load_routing(&self) -> Result<Vec<SyncConfiguration>, ConfigError> {
        let Some(path) = &self.routing_file else {
            return Ok(default_topology());
        };
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::RoutingIo {
            path: path.clone(),
            source,
        })?;
        SyncConfiguration::from_json(&raw).map_err(|source| ConfigError::RoutingParse {
            path: path.clone(),
            source,
        })
    }
}

fn invalid(var: &'static str, value: &str, reason: impl ToString) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse<T>(var: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: ToString,
{
    raw.trim().parse::<T>().map_err(|e| invalid(var, raw, e))
}

fn secs(raw: Option<String>, var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    raw.map_or(Ok(default), |raw| parse::<u64>(var, &raw).map(Duration::from_secs))
}

fn millis(raw: Option<String>, var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    raw.map_or(Ok(default), |raw| parse::<u64>(var, &raw).map(Duration::from_millis))
}
