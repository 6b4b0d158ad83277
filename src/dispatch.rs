//! Request path: hand a worker its next form.

use std::sync::Arc;

use tracing::debug;

use crate::error::{Error, JobError, Result};
use crate::forms::store::FormStore;
use crate::jobs::aggregator::JobAggregator;
use crate::jobs::model::{JobPop, PopRequest};

/// Picks eligible forms and claims the first one the worker wins.
pub struct Dispatcher {
    jobs: Arc<JobAggregator>,
    forms: Arc<FormStore>,
}

impl Dispatcher {
    pub fn new(jobs: Arc<JobAggregator>, forms: Arc<FormStore>) -> Self {
        Self { jobs, forms }
    }

    /// Claim the oldest form this worker may take. Candidates lost to other
    /// workers are skipped. `None` means no work right now.
    pub async fn pop(&self, request: &PopRequest) -> Result<Option<JobPop>> {
        let candidates = self.jobs.eligible_forms(request).await?;
        let offered = candidates.len();

        for candidate in candidates {
            let Some(form) = self.forms.claim_form(candidate.id, &request.worker).await? else {
                continue;
            };

            // The job may have been purged between the claim and this read.
            let job = match self.jobs.get_job(form.job_id).await {
                Ok(job) => job,
                Err(Error::Job(JobError::NotFound { .. })) => continue,
                Err(e) => return Err(e),
            };

            return Ok(Some(JobPop {
                job_id: job.id,
                form_id: form.id,
                source: job.source,
                form: form.claim_payload(),
            }));
        }

        debug!(worker_id = %request.worker.id, offered, "No work for worker");
        Ok(None)
    }
}
