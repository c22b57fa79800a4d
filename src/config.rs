//! Configuration loading from environment variables.
//!
//! Uses the following environment variables:
//! - `QCQUEUE_DATABASE_URL`: PostgreSQL connection string (required)
//! - `QCQUEUE_POOL_SIZE`: connection pool size (default: 10)
//! - `QCQUEUE_HEARTBEAT_FREQUENCY_SECS`: expected manager heartbeat interval (default: 300)
//! - `QCQUEUE_HEARTBEAT_MAX_MISSED`: missed heartbeats before a manager is declared dead (default: 5)
//! - `QCQUEUE_LIVENESS_CHECK_INTERVAL_MS`: sweep interval (default: 60000)

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::liveness::LivenessConfig;

/// Service configuration. Built once in `main` and passed down explicitly.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL
    pub database_url: String,

    /// Connection pool size
    pub pool_size: u32,

    /// Expected interval between manager heartbeats (seconds)
    pub heartbeat_frequency_secs: u64,

    /// Missed heartbeats tolerated before deactivation
    pub heartbeat_max_missed: u32,

    /// Liveness sweep interval (milliseconds)
    pub liveness_check_interval_ms: u64,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Loads `.env` file if present, then reads from environment.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = env::var("QCQUEUE_DATABASE_URL")
            .context("QCQUEUE_DATABASE_URL environment variable is required")?;

        let pool_size = env::var("QCQUEUE_POOL_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);

        let heartbeat_frequency_secs = env::var("QCQUEUE_HEARTBEAT_FREQUENCY_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(300);

        let heartbeat_max_missed = env::var("QCQUEUE_HEARTBEAT_MAX_MISSED")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5);

        let liveness_check_interval_ms = env::var("QCQUEUE_LIVENESS_CHECK_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(60_000);

        Ok(Self {
            database_url,
            pool_size,
            heartbeat_frequency_secs,
            heartbeat_max_missed,
            liveness_check_interval_ms,
        })
    }

    /// Derive the sweep configuration.
    pub fn liveness_config(&self) -> LivenessConfig {
        LivenessConfig {
            check_interval: Duration::from_millis(self.liveness_check_interval_ms),
            heartbeat_frequency: Duration::from_secs(self.heartbeat_frequency_secs),
            max_missed: self.heartbeat_max_missed,
        }
    }

    /// Create a test configuration with defaults
    #[cfg(test)]
    pub fn test_config(database_url: &str) -> Self {
        Self {
            database_url: database_url.to_string(),
            pool_size: 5,
            heartbeat_frequency_secs: 1,
            heartbeat_max_missed: 2,
            liveness_check_interval_ms: 100,
        }
    }
}
