//! Recycle bin sweep.
//!
//! Recycled nodes older than the retention window are purged on a timer.

use chrono::{Duration as ChronoDuration, Utc};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::node::FileNodeRepository;
use super::service::FileService;
use crate::{HoardError, Result};

impl FileService {
    /// Purge every recycled node soft-deleted more than `retention_days` ago.
    ///
    /// A node that fails to purge is logged and left for the next sweep.
    /// Returns the number of node records removed.
    pub async fn sweep_recycle_bin(&self, retention_days: i64) -> Result<u64> {
        if retention_days <= 0 {
            return Err(HoardError::Validation(format!(
                "retention must be at least one day, got {retention_days}"
            )));
        }

        let cutoff = Utc::now() - ChronoDuration::days(retention_days);
        let expired = FileNodeRepository::list_recycled_before(self.pool(), cutoff).await?;
        if expired.is_empty() {
            debug!("recycle bin sweep found nothing to purge");
            return Ok(0);
        }

        let mut removed = 0u64;
        for id in &expired {
            // A folder purged earlier in this pass takes its recycled children with it
            match self.purge(*id).await {
                Ok(n) => removed += n,
                Err(e) => error!(file_id = id, "failed to purge recycled node: {}", e),
            }
        }

        info!(
            candidates = expired.len(),
            removed, retention_days, "recycle bin sweep finished"
        );
        Ok(removed)
    }
}

/// Background task that sweeps the recycle bin on a fixed interval.
pub struct RecycleSweeper {
    service: FileService,
    retention_days: i64,
    interval: Duration,
    cancel: CancellationToken,
}

impl RecycleSweeper {
    /// Create a sweeper. The first sweep runs immediately.
    pub fn new(service: FileService, retention_days: i64, interval_secs: u64) -> Self {
        Self {
            service,
            retention_days,
            interval: Duration::from_secs(interval_secs.max(1)),
            cancel: CancellationToken::new(),
        }
    }

    /// Token that stops the sweeper when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run until cancelled.
    pub async fn run(self) {
        info!(
            "recycle sweeper started (retention: {} days, interval: {} seconds)",
            self.retention_days,
            self.interval.as_secs()
        );

        let mut timer = interval(self.interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = timer.tick() => {
                    if let Err(e) = self.service.sweep_recycle_bin(self.retention_days).await {
                        error!("recycle bin sweep failed: {}", e);
                    }
                }
            }
        }

        info!("recycle sweeper stopped");
    }

    /// Run on a spawned task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}
