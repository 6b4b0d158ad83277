//! Form store: claim, deliver, cancel and abort.
//!
//! Every transition is one conditional write keyed on the form's current
//! state. A form not in the required state is left alone and the call reports
//! nothing done (`None`, `0` kudos, `false`). Reward and usage bookkeeping
//! runs after the write has committed and never undoes it.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::DispatchConfig;
use crate::error::Result;
use crate::jobs::aggregator::JobAggregator;
use crate::rewards::recorder::RewardRecorder;
use crate::store::Database;

use super::model::{ClaimPayload, Form, WorkerRef};
use super::state::{FormEvent, FormState};

pub struct FormStore {
    db: Arc<dyn Database>,
    clock: Arc<dyn Clock>,
    config: DispatchConfig,
    rewards: RewardRecorder,
    jobs: Arc<JobAggregator>,
}

impl FormStore {
    pub fn new(
        db: Arc<dyn Database>,
        clock: Arc<dyn Clock>,
        config: DispatchConfig,
        rewards: RewardRecorder,
        jobs: Arc<JobAggregator>,
    ) -> Self {
        Self {
            db,
            clock,
            config,
            rewards,
            jobs,
        }
    }

    pub async fn get(&self, form_id: Uuid) -> Result<Option<Form>> {
        Ok(self.db.get_form(form_id).await?)
    }

    /// Forms currently held by a worker.
    pub async fn list_processing(&self) -> Result<Vec<Form>> {
        Ok(self.db.list_forms_by_state(FormState::Processing).await?)
    }

    /// Claim a WAITING form for `worker`. Returns the claimed form, or `None`
    /// if someone else got there first.
    pub async fn claim_form(&self, form_id: Uuid, worker: &WorkerRef) -> Result<Option<Form>> {
        let now = self.clock.now();
        let expiry = now + self.config.claim_window();

        let Some(form) = self.db.claim_form(form_id, &worker.id, now, expiry).await? else {
            debug!(form_id = %form_id, worker_id = %worker.id, "Claim lost, form not waiting");
            return Ok(None);
        };

        info!(
            form_id = %form.id,
            form = %form.name,
            job_id = %form.job_id,
            worker_id = %worker.id,
            worker = %worker.name,
            attempt = form.attempts,
            claim_expiry = %expiry,
            "Form claimed"
        );

        if let Err(e) = self.jobs.refresh_expiry(form.job_id).await {
            warn!(job_id = %form.job_id, error = %e, "Failed to refresh job expiry after claim");
        }
        Ok(Some(form))
    }

    /// Claim a WAITING form and hand back only what the worker needs.
    pub async fn claim(&self, form_id: Uuid, worker: &WorkerRef) -> Result<Option<ClaimPayload>> {
        Ok(self
            .claim_form(form_id, worker)
            .await?
            .map(|form| form.claim_payload()))
    }

    /// Store the result and finish the form. Returns the kudos awarded, 0 if
    /// the form was not PROCESSING or `result` is null.
    pub async fn deliver(&self, form_id: Uuid, result: Value) -> Result<u64> {
        if result.is_null() {
            debug!(form_id = %form_id, "Ignored delivery without a result");
            return Ok(0);
        }
        self.finish(form_id, FormEvent::Deliver, Some(&result)).await
    }

    /// Cancel a PROCESSING form. The worker is still paid.
    pub async fn cancel(&self, form_id: Uuid) -> Result<u64> {
        self.finish(form_id, FormEvent::Cancel, None).await
    }

    /// Take a PROCESSING form away from its worker and reopen it, counting a
    /// fault against the worker. Returns false if there was nothing to abort.
    pub async fn abort(&self, form_id: Uuid) -> Result<bool> {
        let released = self.db.release_form(form_id, None).await?;
        Ok(self.faulted(form_id, released).await)
    }

    /// Abort exactly the claim `form` describes. A form that has since been
    /// finished or re-claimed is left alone.
    pub async fn abort_claim(&self, form: &Form) -> Result<bool> {
        let released = self.db.release_form(form.id, Some(form.attempts)).await?;
        Ok(self.faulted(form.id, released).await)
    }

    /// PROCESSING with the claim window passed.
    pub fn is_stale(&self, form: &Form) -> bool {
        form.is_stale(self.clock.now())
    }

    async fn finish(&self, form_id: Uuid, event: FormEvent, result: Option<&Value>) -> Result<u64> {
        let Some(to) = FormState::Processing.on(event) else {
            return Ok(0);
        };

        let Some(form) = self.db.finish_form(form_id, to, result).await? else {
            debug!(form_id = %form_id, ?event, "Ignored, form not processing");
            return Ok(0);
        };

        let kudos = self.config.form_kudos;
        let seconds_taken = form.seconds_taken(self.clock.now());
        let worker_id = form.worker_id.clone().unwrap_or_default();

        self.rewards
            .record_completion(&form, &worker_id, kudos, seconds_taken)
            .await;

        if let Err(e) = self.jobs.record_usage(form.job_id, kudos).await {
            warn!(
                form_id = %form.id,
                job_id = %form.job_id,
                error = %e,
                "Failed to record usage for finished form"
            );
        }

        Ok(kudos)
    }

    async fn faulted(&self, form_id: Uuid, released: Option<Form>) -> bool {
        let Some(form) = released else {
            debug!(form_id = %form_id, "Nothing to abort, form not processing");
            return false;
        };
        let worker_id = form.worker_id.clone().unwrap_or_default();
        let faulted = FormState::Faulted;

        warn!(
            form_id = %form.id,
            form = %form.name,
            job_id = %form.job_id,
            worker_id = %worker_id,
            attempt = form.attempts,
            state = faulted.as_str(),
            "Worker fault, form abandoned"
        );

        self.rewards.record_fault(&form, &worker_id).await;

        info!(
            form_id = %form.id,
            form = %form.name,
            job_id = %form.job_id,
            worker_id = %worker_id,
            state = %faulted.settle(),
            "Aborted form"
        );
        true
    }
}
