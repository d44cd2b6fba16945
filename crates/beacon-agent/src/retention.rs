use std::sync::Arc;
use std::time::Duration;

use beacon_core::Clock;
use beacon_store::StoreError;
use serde::Serialize;

use crate::scheduler::{Scheduler, TaskHandle};
use crate::sync::SharedStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub purged_items: usize,
    pub pruned_runs: usize,
}

/// Purges Synced items and old sync runs past the retention window.
/// Pending and Abandoned items are never touched.
pub struct RetentionSweeper {
    store: SharedStore,
    clock: Arc<dyn Clock>,
    retention: Duration,
}

impl RetentionSweeper {
    pub fn new(store: SharedStore, clock: Arc<dyn Clock>, retention: Duration) -> Self {
        Self {
            store,
            clock,
            retention,
        }
    }

    pub async fn sweep_once(&self) -> Result<SweepReport, StoreError> {
        let retention_ms = i64::try_from(self.retention.as_millis()).unwrap_or(i64::MAX);
        let cutoff = self.clock.now_ms().saturating_sub(retention_ms);

        let store = self.store.lock().await;
        let report = SweepReport {
            purged_items: store.purge_synced_before(cutoff)?,
            pruned_runs: store.prune_sync_runs_before(cutoff)?,
        };
        if report.purged_items > 0
            && let Err(e) = store.checkpoint_truncate()
        {
            tracing::debug!("WAL checkpoint after purge failed: {e}");
        }
        tracing::info!(
            purged = report.purged_items,
            pruned_runs = report.pruned_runs,
            "retention sweep complete"
        );
        Ok(report)
    }

    /// Sweep now and then every `every` until the scheduler shuts down.
    pub fn spawn(self: Arc<Self>, scheduler: &Scheduler, every: Duration) -> TaskHandle {
        scheduler.spawn(move |token| async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep_once().await {
                            tracing::error!("retention sweep failed: {e}");
                        }
                    }
                }
            }
        })
    }
}
