//! `Database` trait: the explicit persistence handle threaded through every
//! operation. Also serves as the payload / result store: both are opaque JSON.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::forms::model::Form;
use crate::forms::state::FormState;
use crate::jobs::model::Job;

/// Which WAITING forms a worker may be offered.
#[derive(Debug, Clone, Copy)]
pub struct ClaimFilter<'a> {
    /// Task types the worker handles. Empty means any.
    pub names: &'a [String],
    /// Trusted workers also see trusted-only jobs.
    pub trusted: bool,
    pub limit: usize,
}

/// Backend-agnostic storage for jobs and forms.
///
/// All state-changing form operations are conditional on the form's current
/// state and report `None` when the condition did not hold. That is how
/// contention misses and no-op transitions surface.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Jobs ────────────────────────────────────────────────────────

    /// Insert a job together with all of its forms, atomically. On error
    /// nothing is left behind.
    async fn insert_job(&self, job: &Job, forms: &[Form]) -> Result<(), DatabaseError>;

    /// Get a job by ID.
    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError>;

    /// Move a job's expiry. Returns false if the job does not exist.
    async fn set_job_expiry(&self, id: Uuid, expiry: DateTime<Utc>) -> Result<bool, DatabaseError>;

    /// Delete a job and its forms. Returns false if the job did not exist.
    async fn delete_job(&self, id: Uuid) -> Result<bool, DatabaseError>;

    /// Delete a job and its forms only if it is still expired at `now` and no
    /// form holds an unexpired claim. The check and the delete are one
    /// transaction. Returns false if the job was kept or did not exist.
    async fn purge_job(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, DatabaseError>;

    /// IDs of jobs whose expiry is before `now`.
    async fn list_expired_jobs(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, DatabaseError>;

    // ── Forms ───────────────────────────────────────────────────────

    /// Get a form by ID.
    async fn get_form(&self, id: Uuid) -> Result<Option<Form>, DatabaseError>;

    /// A job's forms in submission order.
    async fn list_forms(&self, job_id: Uuid) -> Result<Vec<Form>, DatabaseError>;

    /// Every form currently in `state`.
    async fn list_forms_by_state(&self, state: FormState) -> Result<Vec<Form>, DatabaseError>;

    /// WAITING forms of unexpired jobs, oldest job first, then submission order.
    async fn list_claimable_forms(
        &self,
        filter: ClaimFilter<'_>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Form>, DatabaseError>;

    /// Compare-and-swap WAITING → PROCESSING. `None` if the form was not
    /// WAITING at the moment of the swap, or its job had expired by
    /// `claimed_at`.
    async fn claim_form(
        &self,
        id: Uuid,
        worker_id: &str,
        claimed_at: DateTime<Utc>,
        claim_expiry: DateTime<Utc>,
    ) -> Result<Option<Form>, DatabaseError>;

    /// PROCESSING → `to` (DONE or CANCELLED), storing `result`. `None` if the
    /// form was not PROCESSING, or `to` is DONE without a non-null result.
    async fn finish_form(
        &self,
        id: Uuid,
        to: FormState,
        result: Option<&serde_json::Value>,
    ) -> Result<Option<Form>, DatabaseError>;

    /// PROCESSING → WAITING, clearing the claim window but keeping the last
    /// worker. With `attempt`, only releases that specific claim.
    async fn release_form(
        &self,
        id: Uuid,
        attempt: Option<u32>,
    ) -> Result<Option<Form>, DatabaseError>;
}
