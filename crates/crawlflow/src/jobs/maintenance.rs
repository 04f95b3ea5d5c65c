use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

use crate::jobs::backend::QueueBackend;

pub fn cutoff_days(now: DateTime<Utc>, days: i64) -> DateTime<Utc> {
    now - Duration::days(days)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub purged_jobs: u64,
    pub pruned_attempts: u64,
}

/// Purges finished jobs past their keep window and old attempt history,
/// in bounded batches.
#[derive(Clone)]
pub struct QueueMaintenance {
    backend: Arc<dyn QueueBackend>,
    history_days: i64,
    batch: i64,
}

impl QueueMaintenance {
    pub fn new(backend: Arc<dyn QueueBackend>, history_days: i64) -> Self {
        Self {
            backend,
            history_days: history_days.max(1),
            batch: 500,
        }
    }

    pub async fn run_once(&self, now: DateTime<Utc>) -> anyhow::Result<MaintenanceReport> {
        let mut report = MaintenanceReport::default();

        // 1) finished jobs whose retention elapsed
        loop {
            let n = self.backend.purge_finished(self.batch).await?;
            report.purged_jobs += n;
            if n < self.batch as u64 {
                break;
            }
        }

        // 2) attempt history older than the window
        let cutoff = cutoff_days(now, self.history_days);
        loop {
            let n = self.backend.prune_attempts(cutoff, self.batch).await?;
            report.pruned_attempts += n;
            if n < self.batch as u64 {
                break;
            }
        }

        Ok(report)
    }
}
