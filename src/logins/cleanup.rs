//! Retention cleanup for persisted login counts.
//!
//! Runs once at startup and then on a fixed interval. A failed run is only
//! logged; the next scheduled run tries again.

use crate::config::CleanupConfig;
use crate::error::DiscoError;
use crate::metrics::SharedMetrics;
use crate::store::loginstats::{current_day, delete_expired};
use crate::store::Database;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{info, warn};

pub struct CleanupScheduler {
    db: Arc<Database>,
    config: CleanupConfig,
    metrics: SharedMetrics,
}

impl CleanupScheduler {
    pub fn new(db: Arc<Database>, config: CleanupConfig, metrics: SharedMetrics) -> Self {
        Self {
            db,
            config,
            metrics,
        }
    }

    /// Delete rows older than the retention horizon, and rows without a
    /// positive count. Returns the number of rows removed.
    pub async fn run_once(&self) -> Result<usize, DiscoError> {
        let before_day = current_day() - self.config.retention_days;
        let db = Arc::clone(&self.db);

        let deleted = tokio::task::spawn_blocking(move || delete_expired(&db, before_day)).await??;
        info!(deleted, before_day, "Retention cleanup finished");
        Ok(deleted)
    }

    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                interval_secs = self.config.interval.as_secs(),
                retention_days = self.config.retention_days,
                "Starting retention cleanup"
            );
            let mut ticker = interval(self.config.interval);

            loop {
                tokio::select! {
                    // the first tick completes immediately: one run at startup
                    _ = ticker.tick() => match self.run_once().await {
                        Ok(deleted) => {
                            self.metrics.cleanup_runs_total.with_label_values(&["ok"]).inc();
                            self.metrics.cleanup_rows_deleted_total.inc_by(deleted as u64);
                        }
                        Err(e) => {
                            warn!(error = %e, "Retention cleanup failed, retrying at next run");
                            self.metrics.cleanup_runs_total.with_label_values(&["failed"]).inc();
                        }
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            let db = Arc::clone(&self.db);
            if let Err(e) = tokio::task::spawn_blocking(move || db.shutdown()).await {
                warn!(error = %e, "Failed to release cleanup store connection");
            }
            info!("Retention cleanup stopped");
        })
    }
}
