use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::limits::DEFAULT_RATE_LIMIT_MAX_KEYS;

/// Requests allowed per key inside a trailing window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub max_requests: usize,
    pub window_secs: u64,
}

impl RateLimitPolicy {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            max_requests: 10,
            window_secs: 60,
        }
    }
}

/// Process configuration, read once from `VISITD_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    /// JSON file with users and properties for the in-memory directory.
    pub seed: Option<PathBuf>,
    pub metrics_port: Option<u16>,
    pub compact_threshold: u64,
    pub submit_rate: RateLimitPolicy,
    pub rate_limit_max_keys: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 8080,
            data_dir: PathBuf::from("./data"),
            seed: None,
            metrics_port: None,
            compact_threshold: 1000,
            submit_rate: RateLimitPolicy::default(),
            rate_limit_max_keys: DEFAULT_RATE_LIMIT_MAX_KEYS,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Missing or malformed values fall
    /// back to the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            bind: lookup("VISITD_BIND").unwrap_or(defaults.bind),
            port: env_parse(&lookup, "VISITD_PORT").unwrap_or(defaults.port),
            data_dir: lookup("VISITD_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            seed: lookup("VISITD_SEED").filter(|s| !s.is_empty()).map(PathBuf::from),
            metrics_port: env_parse(&lookup, "VISITD_METRICS_PORT"),
            compact_threshold: env_parse(&lookup, "VISITD_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
            submit_rate: RateLimitPolicy {
                max_requests: env_parse::<usize>(&lookup, "VISITD_SUBMIT_RATE_MAX")
                    .filter(|n| *n > 0)
                    .unwrap_or(defaults.submit_rate.max_requests),
                window_secs: env_parse::<u64>(&lookup, "VISITD_SUBMIT_RATE_WINDOW_SECS")
                    .filter(|n| *n > 0)
                    .unwrap_or(defaults.submit_rate.window_secs),
            },
            rate_limit_max_keys: env_parse::<usize>(&lookup, "VISITD_RATE_LIMIT_MAX_KEYS")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.rate_limit_max_keys),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("visits.wal")
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn env_parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("ignoring malformed {key}={raw:?}, using default");
            None
        }
    }
}
