//! Job data model: jobs, submissions, status views, and pop payloads.

use std::collections::HashSet;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::JobError;
use crate::forms::model::{ClaimPayload, FormStatus, WorkerRef};
use crate::forms::state::FormState;

/// Task-type names fit the 30-character form name column.
static FORM_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.\-]{1,30}$").expect("static regex"));

/// One source item submitted by one requester, grouping its forms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique ID.
    pub id: Uuid,
    /// Opaque reference to the source item (URI, blob key, ...).
    pub source: String,
    /// Who submitted the job and pays for it.
    pub requester_id: String,
    /// Only trusted workers may claim this job's forms.
    pub trusted_workers: bool,
    pub created_at: DateTime<Utc>,
    /// Refreshed on every claim and completion.
    pub expiry: DateTime<Utc>,
}

impl Job {
    pub fn new(
        source: impl Into<String>,
        requester: &RequesterCtx,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: source.into(),
            requester_id: requester.id.clone(),
            trusted_workers: requester.trusted_workers,
            created_at: now,
            expiry: now + ttl,
        }
    }

    /// Past its expiry and eligible for purge.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now > self.expiry
    }

    /// Whether `worker` may be offered this job at all.
    pub fn admits(&self, worker: &WorkerRef) -> bool {
        !self.trusted_workers || worker.trusted
    }
}

/// Requester context supplied with a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequesterCtx {
    pub id: String,
    #[serde(default)]
    pub trusted_workers: bool,
}

impl RequesterCtx {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            trusted_workers: false,
        }
    }

    /// Builder: restrict the job to trusted workers.
    pub fn trusted_only(mut self) -> Self {
        self.trusted_workers = true;
        self
    }
}

/// A requested form in a submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormRequest {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl FormRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            payload: None,
        }
    }

    /// Builder: attach the task input.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// Validate names and drop repeated task types, keeping the first occurrence.
pub fn dedup_form_requests(requests: Vec<FormRequest>) -> Result<Vec<FormRequest>, JobError> {
    let mut seen = HashSet::new();
    let mut kept = Vec::with_capacity(requests.len());

    for request in requests {
        if !FORM_NAME_RE.is_match(&request.name) {
            return Err(JobError::InvalidFormName {
                reason: "expected 1-30 characters of [A-Za-z0-9_.-]".to_string(),
                name: request.name,
            });
        }
        if seen.insert(request.name.clone()) {
            kept.push(request);
        }
    }

    if kept.is_empty() {
        return Err(JobError::NoForms);
    }
    Ok(kept)
}

/// Derived, advisory view of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_id: Uuid,
    pub state: FormState,
    pub forms: Vec<FormStatus>,
}

impl JobStatus {
    pub fn form(&self, name: &str) -> Option<&FormStatus> {
        self.forms.iter().find(|f| f.name == name)
    }

    /// Task types in submission order.
    pub fn form_names(&self) -> Vec<&str> {
        self.forms.iter().map(|f| f.name.as_str()).collect()
    }
}

/// A worker's request for work.
#[derive(Debug, Clone)]
pub struct PopRequest {
    pub worker: WorkerRef,
    /// Task types the worker can process. Empty means any.
    pub forms: Vec<String>,
    /// Maximum number of candidates tried before giving up.
    pub limit: usize,
}

impl PopRequest {
    pub fn new(worker: WorkerRef) -> Self {
        Self {
            worker,
            forms: Vec::new(),
            limit: 20,
        }
    }

    /// Builder: restrict to these task types.
    pub fn with_forms<I, S>(mut self, forms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.forms = forms.into_iter().map(Into::into).collect();
        self
    }
}

/// Work handed to a worker on a successful pop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPop {
    /// Routing handle for delivery.
    pub job_id: Uuid,
    /// Routing handle for delivery.
    pub form_id: Uuid,
    /// Source item to process.
    pub source: String,
    pub form: ClaimPayload,
}
