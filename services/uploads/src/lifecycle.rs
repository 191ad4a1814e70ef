use crate::catalog::Catalog;
use crate::config::LifecycleConfig;
use crate::content_store::ContentStore;
use crate::error::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Outcome of one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub deleted: usize,
    pub failed: usize,
}

/// Requests an out-of-cycle sweep
#[derive(Clone)]
pub struct LifecycleHandle {
    tx: mpsc::Sender<()>,
}

impl LifecycleHandle {
    /// Ask for a sweep. Requests arriving while one is pending are coalesced.
    pub fn trigger(&self) {
        if self.tx.try_send(()).is_err() {
            debug!("Sweep already pending");
        }
    }
}

/// Deletes uploads that were never claimed within the grace period
pub struct LifecycleManager {
    catalog: Arc<dyn Catalog>,
    store: Arc<ContentStore>,
    grace_period: Duration,
    interval: Duration,
    batch_size: i64,
}

impl LifecycleManager {
    pub fn new(catalog: Arc<dyn Catalog>, store: Arc<ContentStore>, config: &LifecycleConfig) -> Self {
        Self {
            catalog,
            store,
            grace_period: config.grace_period(),
            interval: config.sweep_interval(),
            batch_size: config.sweep_batch_size,
        }
    }

    pub fn handle() -> (LifecycleHandle, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(1);
        (LifecycleHandle { tx }, rx)
    }

    pub async fn sweep(&self) -> Result<SweepReport> {
        self.sweep_at(Utc::now().timestamp()).await
    }

    /// Sweep files that were stale as of `now` (epoch seconds). A row that
    /// fails to delete is left for the next sweep.
    #[instrument(skip(self))]
    pub async fn sweep_at(&self, now: i64) -> Result<SweepReport> {
        let cutoff = now - self.grace_period.as_secs() as i64;
        let stale = self
            .catalog
            .list_stale_unclaimed(cutoff, self.batch_size)
            .await?;

        let mut report = SweepReport {
            scanned: stale.len(),
            ..SweepReport::default()
        };

        for file in &stale {
            match self.store.delete_if_unclaimed(file).await {
                Ok(true) => report.deleted += 1,
                // Claimed or removed since the scan
                Ok(false) => {}
                Err(e) => {
                    report.failed += 1;
                    warn!(id = %file.id, error = %e, "Failed to delete stale file");
                }
            }
        }

        metrics::counter!("uploads.gc.swept").increment(report.deleted as u64);
        metrics::counter!("uploads.gc.failed").increment(report.failed as u64);
        if report.scanned > 0 {
            info!(
                scanned = report.scanned,
                deleted = report.deleted,
                failed = report.failed,
                "Sweep completed"
            );
        }

        Ok(report)
    }

    /// Sweep on a fixed interval and whenever triggered, until cancelled
    pub async fn run(self, mut triggers: mpsc::Receiver<()>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_secs = self.interval.as_secs(),
            grace_period_secs = self.grace_period.as_secs(),
            "Lifecycle manager started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
                Some(()) = triggers.recv() => debug!("Out-of-cycle sweep requested"),
            }

            if let Err(e) = self.sweep().await {
                error!(error = %e, "Sweep failed");
            }
        }

        info!("Lifecycle manager stopped");
    }
}
