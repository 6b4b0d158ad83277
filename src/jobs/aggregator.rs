//! Job aggregator: creates jobs with their full form set, keeps them alive
//! while they are worked, and derives their status from the forms.

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::DispatchConfig;
use crate::error::{JobError, Result};
use crate::forms::model::Form;
use crate::forms::state::{FormState, aggregate_state};
use crate::rewards::ledger::UsageLedger;
use crate::store::{ClaimFilter, Database};

use super::model::{FormRequest, Job, JobStatus, PopRequest, RequesterCtx, dedup_form_requests};

pub struct JobAggregator {
    db: Arc<dyn Database>,
    clock: Arc<dyn Clock>,
    config: DispatchConfig,
    usage: Arc<dyn UsageLedger>,
}

impl JobAggregator {
    pub fn new(
        db: Arc<dyn Database>,
        clock: Arc<dyn Clock>,
        config: DispatchConfig,
        usage: Arc<dyn UsageLedger>,
    ) -> Self {
        Self {
            db,
            clock,
            config,
            usage,
        }
    }

    /// Create a job with one WAITING form per distinct task type.
    ///
    /// Repeated task types are dropped, first occurrence wins. The job and
    /// all of its forms become visible together or not at all.
    pub async fn create_job(
        &self,
        source: impl Into<String>,
        requests: Vec<FormRequest>,
        requester: &RequesterCtx,
    ) -> Result<Job> {
        let requested = requests.len();
        let requests = dedup_form_requests(requests)?;

        let now = self.clock.now();
        let job = Job::new(source, requester, now, self.config.job_window());
        let forms: Vec<Form> = requests
            .into_iter()
            .enumerate()
            .map(|(i, r)| Form::new(job.id, i as u32, r.name, r.payload, now))
            .collect();

        self.db.insert_job(&job, &forms).await?;

        info!(
            job_id = %job.id,
            requester_id = %job.requester_id,
            forms = forms.len(),
            dropped = requested - forms.len(),
            trusted_workers = job.trusted_workers,
            "Job created"
        );
        Ok(job)
    }

    /// Look up a job.
    pub async fn get_job(&self, job_id: Uuid) -> Result<Job> {
        self.db
            .get_job(job_id)
            .await?
            .ok_or_else(|| JobError::NotFound { id: job_id }.into())
    }

    /// Push the job's expiry out to now + job TTL. Returns false if the job
    /// no longer exists.
    pub async fn refresh_expiry(&self, job_id: Uuid) -> Result<bool> {
        let expiry = self.clock.now() + self.config.job_window();
        let found = self.db.set_job_expiry(job_id, expiry).await?;
        if !found {
            debug!(job_id = %job_id, "Expiry refresh skipped, job is gone");
        }
        Ok(found)
    }

    /// Aggregate state plus per-form name, state and result. A snapshot; it
    /// may already be out of date when it is returned.
    pub async fn get_status(&self, job_id: Uuid) -> Result<JobStatus> {
        let forms = self.forms_of(job_id).await?;
        Ok(JobStatus {
            job_id,
            state: aggregate_state(forms.iter().map(|f| f.state)),
            forms: forms.iter().map(Form::status).collect(),
        })
    }

    /// All forms faulted, or every form has a result.
    pub async fn is_complete(&self, job_id: Uuid) -> Result<bool> {
        let forms = self.forms_of(job_id).await?;
        if aggregate_state(forms.iter().map(|f| f.state)) == FormState::Faulted {
            return Ok(true);
        }
        Ok(forms.iter().all(|f| f.result.is_some()))
    }

    /// Charge the job's requester for one processed form and keep the job
    /// alive. A failed ledger write is logged and otherwise ignored.
    pub async fn record_usage(&self, job_id: Uuid, kudos_spent: u64) -> Result<()> {
        let job = self.get_job(job_id).await?;

        if let Err(e) = self.usage.record_usage(&job.requester_id, kudos_spent).await {
            warn!(
                job_id = %job.id,
                requester_id = %job.requester_id,
                kudos_spent,
                error = %e,
                "Failed to record requester usage"
            );
        }

        self.refresh_expiry(job.id).await?;
        Ok(())
    }

    /// WAITING forms this worker may claim, in dispatch order.
    pub async fn eligible_forms(&self, request: &PopRequest) -> Result<Vec<Form>> {
        let filter = ClaimFilter {
            names: &request.forms,
            trusted: request.worker.trusted,
            limit: request.limit,
        };
        Ok(self.db.list_claimable_forms(filter, self.clock.now()).await?)
    }

    /// Delete a job and its forms. Returns false if it did not exist.
    pub async fn delete_job(&self, job_id: Uuid) -> Result<bool> {
        let deleted = self.db.delete_job(job_id).await?;
        if deleted {
            info!(job_id = %job_id, "Job deleted");
        }
        Ok(deleted)
    }

    /// Delete every job past its expiry. A job refreshed or claimed since the
    /// listing is kept. Failures are logged per job and do not stop the rest.
    /// Returns the number deleted.
    pub async fn purge_expired(&self) -> Result<usize> {
        let now = self.clock.now();
        let expired = self.db.list_expired_jobs(now).await?;
        if expired.is_empty() {
            return Ok(0);
        }

        let mut purged = 0;
        for job_id in expired {
            match self.db.purge_job(job_id, now).await {
                Ok(true) => purged += 1,
                Ok(false) => debug!(job_id = %job_id, "Expired job revived before purge, kept"),
                Err(e) => warn!(job_id = %job_id, error = %e, "Failed to purge expired job"),
            }
        }

        info!(purged, "Purged expired jobs");
        Ok(purged)
    }

    async fn forms_of(&self, job_id: Uuid) -> Result<Vec<Form>> {
        let forms = self.db.list_forms(job_id).await?;
        if forms.is_empty() {
            return Err(JobError::NotFound { id: job_id }.into());
        }
        Ok(forms)
    }
}
