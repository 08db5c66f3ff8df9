use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::limits::{DEFAULT_TOKEN_TTL_MS, MAX_TOKEN_TTL_MS};
use crate::model::{Ms, HOUR_MS};

/// Process configuration, read from `VENUEBOOK_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub token_secret: String,
    pub token_ttl_ms: Ms,
    pub sweep_interval: Duration,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ConfigError {
    Missing(&'static str),
    Invalid { var: &'static str, value: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Missing(var) => write!(f, "missing required variable {var}"),
            ConfigError::Invalid { var, value } => write!(f, "invalid value for {var}: {value:?}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let token_secret = lookup("VENUEBOOK_TOKEN_SECRET")
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::Missing("VENUEBOOK_TOKEN_SECRET"))?;
        let token_ttl_ms = match lookup("VENUEBOOK_TOKEN_TTL_HOURS") {
            None => DEFAULT_TOKEN_TTL_MS,
            Some(value) => value
                .trim()
                .parse::<i64>()
                .ok()
                .filter(|h| *h > 0)
                .and_then(|h| h.checked_mul(HOUR_MS))
                .filter(|ms| *ms <= MAX_TOKEN_TTL_MS)
                .ok_or(ConfigError::Invalid {
                    var: "VENUEBOOK_TOKEN_TTL_HOURS",
                    value,
                })?,
        };
        let sweep_secs: u64 = parse_var(&lookup, "VENUEBOOK_SWEEP_INTERVAL_SECS")?.unwrap_or(60);

        Ok(Self {
            data_dir: PathBuf::from(
                lookup("VENUEBOOK_DATA_DIR").unwrap_or_else(|| "./data".into()),
            ),
            token_secret,
            token_ttl_ms,
            sweep_interval: Duration::from_secs(sweep_secs.max(1)),
            compact_threshold: parse_var(&lookup, "VENUEBOOK_COMPACT_THRESHOLD")?.unwrap_or(1000),
            metrics_port: parse_var(&lookup, "VENUEBOOK_METRICS_PORT")?,
        })
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("venuebook.wal")
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value }),
    }
}
