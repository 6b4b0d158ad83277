//! Reward recorder: credits workers when a form finishes, and counts faults.
//!
//! Ledger writes happen after the state transition has committed. A failed
//! write is logged and dropped; the transition stands.

use std::sync::Arc;

use tracing::{info, warn};

use crate::forms::model::Form;
use crate::forms::state::FormState;

use super::ledger::WorkerLedger;

pub struct RewardRecorder {
    ledger: Arc<dyn WorkerLedger>,
}

impl RewardRecorder {
    pub fn new(ledger: Arc<dyn WorkerLedger>) -> Self {
        Self { ledger }
    }

    /// Credit `worker_id` for `form`, which has just become DONE or CANCELLED.
    /// Returns whether the ledger accepted the write.
    pub async fn record_completion(
        &self,
        form: &Form,
        worker_id: &str,
        kudos: u64,
        seconds_taken: u64,
    ) -> bool {
        let cancel_txt = if form.state == FormState::Cancelled {
            " CANCELLED"
        } else {
            ""
        };

        if let Err(e) = self
            .ledger
            .record_success(worker_id, kudos, seconds_taken)
            .await
        {
            warn!(
                form_id = %form.id,
                worker_id,
                kudos,
                error = %e,
                "Failed to record worker reward"
            );
            return false;
        }

        info!(
            form_id = %form.id,
            form = %form.name,
            job_id = %form.job_id,
            worker_id,
            kudos,
            seconds_taken,
            "New{cancel_txt} form delivered"
        );
        true
    }

    /// Count an abandoned claim against `worker_id`.
    pub async fn record_fault(&self, form: &Form, worker_id: &str) -> bool {
        if let Err(e) = self.ledger.record_fault(worker_id).await {
            warn!(
                form_id = %form.id,
                worker_id,
                error = %e,
                "Failed to record worker fault"
            );
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;
    use crate::error::LedgerError;
    use crate::rewards::ledger::{MemoryLedger, WorkerStats};

    struct BrokenLedger;

    #[async_trait]
    impl WorkerLedger for BrokenLedger {
        async fn record_success(&self, _: &str, _: u64, _: u64) -> Result<(), LedgerError> {
            Err(LedgerError::Unavailable {
                ledger: "broken".into(),
                reason: "offline".into(),
            })
        }
        async fn record_fault(&self, _: &str) -> Result<(), LedgerError> {
            Err(LedgerError::Unavailable {
                ledger: "broken".into(),
                reason: "offline".into(),
            })
        }
        async fn worker_stats(&self, _: &str) -> Result<WorkerStats, LedgerError> {
            Ok(WorkerStats::default())
        }
    }

    fn done_form() -> Form {
        let mut form = Form::new(Uuid::new_v4(), 0, "caption", None, Utc::now());
        form.state = FormState::Done;
        form
    }

    #[tokio::test]
    async fn records_into_ledger() {
        let ledger = Arc::new(MemoryLedger::new());
        let recorder = RewardRecorder::new(ledger.clone());

        assert!(recorder.record_completion(&done_form(), "w1", 1, 8).await);
        assert!(recorder.record_fault(&done_form(), "w1").await);

        let stats = ledger.worker_stats("w1").await.unwrap();
        assert_eq!(stats.kudos, 1);
        assert_eq!(stats.seconds_total, 8);
        assert_eq!(stats.faults, 1);
    }

    #[tokio::test]
    async fn ledger_failure_is_swallowed() {
        let recorder = RewardRecorder::new(Arc::new(BrokenLedger));
        assert!(!recorder.record_completion(&done_form(), "w1", 1, 8).await);
        assert!(!recorder.record_fault(&done_form(), "w1").await);
    }
}
