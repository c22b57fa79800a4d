//! Heartbeat-timeout sweep.
//!
//! Managers report liveness by touching `modified_at` on every heartbeat.
//! This sweep periodically deactivates any active manager whose last
//! heartbeat is older than `heartbeat_frequency * max_missed` and returns its
//! in-flight tasks to the waiting pool, where the ordinary claim protocol
//! hands them to any capable manager. Recovery is fail-open and idempotent,
//! so overlapping sweeps are harmless.

use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Result};
use chrono::Utc;
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{error, info};

use crate::db::Database;

#[derive(Clone, Debug)]
pub struct LivenessConfig {
    /// How often the sweep runs.
    pub check_interval: Duration,
    /// Expected interval between manager heartbeats.
    pub heartbeat_frequency: Duration,
    /// Missed heartbeats tolerated before a manager is declared dead.
    pub max_missed: u32,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(60),
            heartbeat_frequency: Duration::from_secs(300),
            max_missed: 5,
        }
    }
}

impl LivenessConfig {
    fn staleness(&self) -> chrono::Duration {
        chrono::Duration::seconds(
            (self.heartbeat_frequency.as_secs() * u64::from(self.max_missed.max(1))) as i64,
        )
    }
}

/// Handle to the background sweep task.
pub struct HeartbeatMonitor {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<Result<()>>,
}

impl HeartbeatMonitor {
    pub fn start(config: LivenessConfig, database: Arc<Database>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let task = MonitorTask {
                config,
                database,
                shutdown_rx,
            };
            if let Err(err) = task.run().await {
                error!(?err, "heartbeat monitor terminated with error");
                Err(err)
            } else {
                Ok(())
            }
        });
        Self {
            shutdown_tx,
            handle,
        }
    }

    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown(self) -> Result<()> {
        self.trigger_shutdown();
        match self.handle.await {
            Ok(result) => result,
            Err(err) => Err(anyhow!("heartbeat monitor task panicked: {err}")),
        }
    }
}

struct MonitorTask {
    config: LivenessConfig,
    database: Arc<Database>,
    shutdown_rx: watch::Receiver<bool>,
}

impl MonitorTask {
    async fn run(mut self) -> Result<()> {
        info!(
            check_interval_ms = self.config.check_interval.as_millis(),
            heartbeat_frequency_ms = self.config.heartbeat_frequency.as_millis(),
            max_missed = self.config.max_missed,
            "starting heartbeat monitor",
        );

        let mut ticker = interval(self.config.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.sweep().await {
                        metrics::counter!("qcqueue_sweep_errors_total").increment(1);
                        error!(?err, "liveness sweep failed");
                    }
                }
                changed = self.shutdown_rx.changed() => {
                    if changed.is_ok() && *self.shutdown_rx.borrow() {
                        info!("heartbeat monitor shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    async fn sweep(&self) -> Result<()> {
        let cutoff = Utc::now() - self.config.staleness();
        let shutdown = self.database.deactivate_stale_managers(cutoff).await?;
        if !shutdown.managers.is_empty() {
            metrics::counter!("qcqueue_managers_deactivated_total")
                .increment(shutdown.managers.len() as u64);
            metrics::counter!("qcqueue_tasks_recovered_total").increment(shutdown.tasks_reset);
            info!(
                managers = ?shutdown.managers,
                tasks_reset = shutdown.tasks_reset,
                "deactivated stale managers"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::LivenessConfig;
    use std::time::Duration;

    #[test]
    fn default_config_values() {
        let config = LivenessConfig::default();
        assert_eq!(config.check_interval, Duration::from_secs(60));
        assert_eq!(config.heartbeat_frequency, Duration::from_secs(300));
        assert_eq!(config.max_missed, 5);
    }

    #[test]
    fn staleness_is_frequency_times_missed() {
        let config = LivenessConfig::default();
        assert_eq!(config.staleness(), chrono::Duration::seconds(1500));
    }
}
