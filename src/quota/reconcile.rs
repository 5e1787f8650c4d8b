//! Periodic ledger reconciliation

use crate::quota::ledger::InflightLedger;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Background task that flushes the ledger on a fixed period
///
/// Dropping the timer aborts the task; [`ReconciliationTimer::stop`] waits
/// for the running sweep to finish first.
pub struct ReconciliationTimer {
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
    interval: Duration,
}

impl ReconciliationTimer {
    /// Spawn the sweep on the current tokio runtime
    pub fn start(ledger: Arc<dyn InflightLedger>, interval: Duration) -> Self {
        let (shutdown, mut stopped) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            info!(interval_ms = interval.as_millis() as u64, "Ledger reconciliation started");
            loop {
                tokio::select! {
                    _ = stopped.changed() => break,
                    _ = ticker.tick() => {
                        let stats = ledger.flush();
                        if stats.flushed > 0 || stats.expired > 0 {
                            debug!(
                                flushed = stats.flushed,
                                expired = stats.expired,
                                released = stats.buckets_released,
                                "Reconciliation sweep"
                            );
                        }
                    }
                }
            }
            info!("Ledger reconciliation stopped");
        });

        ReconciliationTimer {
            shutdown,
            task: Some(task),
            interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Signal the task and wait for it to exit
    pub async fn stop(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ReconciliationTimer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::ledger::LocalLedger;

    #[tokio::test(start_paused = true)]
    async fn test_sweep_discards_committed_entries() {
        let window = Duration::from_millis(500);
        let ledger = Arc::new(LocalLedger::new(window));
        let timer = ReconciliationTimer::start(ledger.clone(), Duration::from_millis(100));
        assert!(timer.is_running());

        let handle = ledger.reserve("b", 1024);
        ledger.commit(&handle).unwrap();
        let pending = ledger.reserve("b", 10);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(ledger.pending_total("b"), 1034);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(ledger.pending_total("b"), 10);

        ledger.rollback(&pending).unwrap();
        timer.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_task() {
        let ledger = Arc::new(LocalLedger::new(Duration::from_millis(50)));
        let timer = ReconciliationTimer::start(ledger.clone(), Duration::from_millis(10));
        assert_eq!(timer.interval(), Duration::from_millis(10));
        timer.stop().await;

        // No sweep after stop
        let handle = ledger.reserve("b", 1);
        ledger.commit(&handle).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(ledger.pending_total("b"), 1);
    }
}
