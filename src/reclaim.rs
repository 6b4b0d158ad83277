//! Stale reclaimer: returns abandoned forms to the pool.
//!
//! A form whose claim window has passed without a delivery is aborted: the
//! worker gets a fault and the form goes back to WAITING. The same loop also
//! purges expired jobs.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::forms::store::FormStore;
use crate::jobs::aggregator::JobAggregator;

/// Outcome of one reclaim pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    /// PROCESSING forms looked at.
    pub scanned: usize,
    /// Stale forms returned to WAITING.
    pub reclaimed: usize,
    /// Stale forms whose abort failed.
    pub failed: usize,
}

/// Spawn the background sweep: reclaim stale forms, then purge expired jobs,
/// every `interval`. The first pass runs immediately.
pub fn spawn_sweep_loop(
    forms: Arc<FormStore>,
    jobs: Arc<JobAggregator>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Sweep loop started (interval: {}s)", interval.as_secs());

        let mut tick = tokio::time::interval(interval);

        loop {
            tick.tick().await;
            run_sweep(&forms, &jobs).await;
        }
    })
}

/// Single sweep: reclaim, then purge. Errors are logged, never fatal.
async fn run_sweep(forms: &FormStore, jobs: &JobAggregator) {
    if let Err(e) = run_reclaim_cycle(forms).await {
        warn!(error = %e, "Reclaim pass failed");
    }
    if let Err(e) = jobs.purge_expired().await {
        warn!(error = %e, "Expired job purge failed");
    }
}

/// Abort every stale PROCESSING form. One failed abort is logged and skipped;
/// the rest of the batch still runs.
pub async fn run_reclaim_cycle(forms: &FormStore) -> Result<ReclaimReport> {
    let processing = forms.list_processing().await?;
    let mut report = ReclaimReport {
        scanned: processing.len(),
        ..ReclaimReport::default()
    };

    for form in processing.iter().filter(|f| forms.is_stale(f)) {
        match forms.abort_claim(form).await {
            Ok(true) => report.reclaimed += 1,
            // Delivered or re-claimed since the scan.
            Ok(false) => {}
            Err(e) => {
                warn!(
                    form_id = %form.id,
                    job_id = %form.job_id,
                    error = %e,
                    "Failed to reclaim stale form, skipping"
                );
                report.failed += 1;
            }
        }
    }

    if report.reclaimed > 0 || report.failed > 0 {
        info!(
            scanned = report.scanned,
            reclaimed = report.reclaimed,
            failed = report.failed,
            "Reclaim pass complete"
        );
    } else {
        debug!(scanned = report.scanned, "No stale forms");
    }

    Ok(report)
}
