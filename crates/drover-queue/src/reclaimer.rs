//! Expired-lock reclaim loop.

use crate::stats::QueueCounters;
use crate::store::JobStore;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, warn};

/// Returns claims whose lock expired to the ready set, on a fixed period.
pub(crate) struct Reclaimer {
    pub(crate) queue: String,
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) counters: Arc<QueueCounters>,
    pub(crate) period: Duration,
}

impl Reclaimer {
    pub(crate) async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!(queue = %self.queue, period_ms = self.period.as_millis() as u64, "Reclaimer started");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.reclaim_once().await;
                }
            }
        }

        debug!(queue = %self.queue, "Reclaimer stopped");
    }

    async fn reclaim_once(&self) {
        match self.store.reclaim_expired_locks(&self.queue, Utc::now()).await {
            Ok(0) => {}
            Ok(count) => {
                warn!(queue = %self.queue, count, "Reclaimed jobs with expired locks");
                self.counters.record_reclaimed(count);
            }
            Err(e) => {
                error!(queue = %self.queue, error = %e, "Failed to reclaim expired locks");
                self.counters.record_store_error("reclaim_expired_locks");
            }
        }
    }
}
