use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::engine::EngineOptions;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}")]
    Invalid { var: &'static str, value: String },
    #[error("{var} must be greater than zero")]
    Zero { var: &'static str },
}

/// Process configuration, read from `SLOTGATE_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    pub lock_timeout: Duration,
    pub conferencing_timeout: Duration,
    /// Journal appends since the last compaction that trigger the next one.
    pub compact_threshold: u64,
    pub sweep_interval: Duration,
    /// How long cancelled and completed bookings, and dead links, are kept
    /// after they end.
    pub retention: Duration,
    pub metrics_port: Option<u16>,
}

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

impl Default for EngineConfig {
    fn default() -> Self {
        let options = EngineOptions::default();
        Self {
            data_dir: PathBuf::from("./data"),
            lock_timeout: options.lock_timeout,
            conferencing_timeout: options.conferencing_timeout,
            compact_threshold: 1000,
            sweep_interval: Duration::from_secs(60),
            retention: DAY * 90,
            metrics_port: None,
        }
    }
}

fn parse<T: FromStr>(
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

fn positive(var: &'static str, value: u64) -> Result<u64, ConfigError> {
    if value == 0 {
        return Err(ConfigError::Zero { var });
    }
    Ok(value)
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source. Unset variables take their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let millis = |var: &'static str| -> Result<Option<Duration>, ConfigError> {
            parse::<u64>(&lookup, var)?
                .map(|ms| positive(var, ms).map(Duration::from_millis))
                .transpose()
        };

        Ok(Self {
            data_dir: lookup("SLOTGATE_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            lock_timeout: millis("SLOTGATE_LOCK_TIMEOUT_MS")?.unwrap_or(defaults.lock_timeout),
            conferencing_timeout: millis("SLOTGATE_CONFERENCING_TIMEOUT_MS")?
                .unwrap_or(defaults.conferencing_timeout),
            compact_threshold: parse::<u64>(&lookup, "SLOTGATE_COMPACT_THRESHOLD")?
                .map(|n| positive("SLOTGATE_COMPACT_THRESHOLD", n))
                .transpose()?
                .unwrap_or(defaults.compact_threshold),
            sweep_interval: parse::<u64>(&lookup, "SLOTGATE_SWEEP_INTERVAL_SECS")?
                .map(|s| positive("SLOTGATE_SWEEP_INTERVAL_SECS", s).map(Duration::from_secs))
                .transpose()?
                .unwrap_or(defaults.sweep_interval),
            retention: parse::<u32>(&lookup, "SLOTGATE_RETENTION_DAYS")?
                .map(|d| positive("SLOTGATE_RETENTION_DAYS", u64::from(d)).map(|_| DAY * d))
                .transpose()?
                .unwrap_or(defaults.retention),
            metrics_port: parse(&lookup, "SLOTGATE_METRICS_PORT")?,
        })
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            lock_timeout: self.lock_timeout,
            conferencing_timeout: self.conferencing_timeout,
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("slotgate.wal")
    }
}
