//! Configuration for the driver.

use std::time::Duration;

use anyhow::{Context, Result};
use metal_reconcile::DEFAULT_CREATE_BACKOFF;

use crate::volumes::DEFAULT_BLOCK_STORAGE_DRIVER;

const CREATE_BACKOFF_VAR: &str = "METAL_DRIVER_CREATE_BACKOFF_SECS";
const CALL_TIMEOUT_VAR: &str = "METAL_DRIVER_CALL_TIMEOUT_SECS";
const BLOCK_STORAGE_DRIVER_VAR: &str = "METAL_DRIVER_BLOCK_STORAGE_DRIVER";
const LOG_LEVEL_VAR: &str = "METAL_DRIVER_LOG_LEVEL";

/// Driver configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    /// Cool-down between accepted creations of the same machine name.
    pub create_backoff: Duration,

    /// Deadline applied to each request, unless the caller supplies one.
    pub call_timeout: Option<Duration>,

    /// CSI driver whose volume handles carry an `nguid` field.
    pub block_storage_driver: String,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            create_backoff: DEFAULT_CREATE_BACKOFF,
            call_timeout: None,
            block_storage_driver: DEFAULT_BLOCK_STORAGE_DRIVER.to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl DriverConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let create_backoff = match lookup(CREATE_BACKOFF_VAR) {
            Some(v) => parse_secs(CREATE_BACKOFF_VAR, &v)?,
            None => defaults.create_backoff,
        };

        let call_timeout = match lookup(CALL_TIMEOUT_VAR) {
            Some(v) => Some(parse_secs(CALL_TIMEOUT_VAR, &v)?).filter(|d| !d.is_zero()),
            None => defaults.call_timeout,
        };

        let block_storage_driver = lookup(BLOCK_STORAGE_DRIVER_VAR)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or(defaults.block_storage_driver);

        let log_level = lookup(LOG_LEVEL_VAR).unwrap_or(defaults.log_level);

        Ok(Self {
            create_backoff,
            call_timeout,
            block_storage_driver,
            log_level,
        })
    }
}

fn parse_secs(var: &str, value: &str) -> Result<Duration> {
    let secs: u64 = value
        .trim()
        .parse()
        .with_context(|| format!("{var} must be a whole number of seconds, got '{value}'"))?;
    Ok(Duration::from_secs(secs))
}
