//! Form data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::FormState;

/// A worker as seen by the dispatcher. Identity is supplied by the caller and
/// only stored, never validated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRef {
    pub id: String,
    pub name: String,
    /// Whether the worker may take jobs restricted to trusted workers.
    #[serde(default)]
    pub trusted: bool,
}

impl WorkerRef {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            trusted: false,
        }
    }

    /// Builder: mark as trusted.
    pub fn trusted(mut self) -> Self {
        self.trusted = true;
        self
    }
}

/// One claimable unit of work of a single task type within a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Form {
    /// Unique ID.
    pub id: Uuid,
    /// Owning job.
    pub job_id: Uuid,
    /// Position within the job's submission order.
    pub position: u32,
    /// Task-type name, unique within the job.
    pub name: String,
    /// Current state. Never FAULTED once read back from storage.
    pub state: FormState,
    /// Task-specific input, opaque to the dispatcher.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    /// Worker output. Present once DONE.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Worker holding (or last holding) the claim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    /// Number of claims so far. Identifies the current claim.
    #[serde(default)]
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    /// When the current claim started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
    /// Fixed deadline for the current claim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_expiry: Option<DateTime<Utc>>,
}

impl Form {
    /// A fresh WAITING form.
    pub fn new(
        job_id: Uuid,
        position: u32,
        name: impl Into<String>,
        payload: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            position,
            name: name.into(),
            state: FormState::Waiting,
            payload,
            result: None,
            worker_id: None,
            attempts: 0,
            created_at: now,
            claimed_at: None,
            claim_expiry: None,
        }
    }

    /// PROCESSING with its claim window passed. Terminal forms are never stale.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        if self.state != FormState::Processing {
            return false;
        }
        match self.claim_expiry {
            Some(expiry) => now > expiry,
            // A claim without a deadline can never be honoured.
            None => true,
        }
    }

    /// Whole seconds since the claim started.
    pub fn seconds_taken(&self, now: DateTime<Utc>) -> u64 {
        self.claimed_at
            .map(|at| (now - at).num_seconds().max(0) as u64)
            .unwrap_or(0)
    }

    /// What the claiming worker receives.
    pub fn claim_payload(&self) -> ClaimPayload {
        ClaimPayload {
            name: self.name.clone(),
            payload: self.payload.clone(),
        }
    }

    /// Per-form entry of a job status.
    pub fn status(&self) -> FormStatus {
        FormStatus {
            name: self.name.clone(),
            state: self.state,
            result: self.result.clone(),
        }
    }
}

/// Handed to a worker on a successful claim: the task type and its input,
/// nothing else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimPayload {
    pub name: String,
    pub payload: Option<serde_json::Value>,
}

/// One form's entry in a job status view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormStatus {
    pub name: String,
    pub state: FormState,
    pub result: Option<serde_json::Value>,
}
