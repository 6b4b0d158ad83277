//! Form state machine.
//!
//! ```text
//! WAITING --claim--> PROCESSING --deliver--> DONE
//!                               --cancel---> CANCELLED
//!                               --abort----> FAULTED --> WAITING
//! ```
//!
//! FAULTED is transient: it is emitted as a log event and immediately settles
//! back to WAITING within the same operation. It is never persisted.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// State of a single form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FormState {
    /// Claimable.
    Waiting,
    /// Claimed by a worker, within its claim window.
    Processing,
    /// Result delivered.
    Done,
    /// Cancelled while processing.
    Cancelled,
    /// Aborted after a worker fault. Transient.
    Faulted,
}

/// Something that happens to a form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormEvent {
    Claim,
    Deliver,
    Cancel,
    Abort,
}

impl FormState {
    /// The state `event` moves this state to, or `None` if the event does not
    /// apply here. A `None` is a no-op for callers, never an error.
    pub fn on(self, event: FormEvent) -> Option<FormState> {
        use FormEvent::*;
        use FormState::*;

        match (self, event) {
            (Waiting, Claim) => Some(Processing),
            (Processing, Deliver) => Some(Done),
            (Processing, Cancel) => Some(Cancelled),
            (Processing, Abort) => Some(Faulted),
            _ => None,
        }
    }

    /// Where a state comes to rest. Only FAULTED moves on by itself.
    pub fn settle(self) -> FormState {
        match self {
            FormState::Faulted => FormState::Waiting,
            other => other,
        }
    }

    /// DONE and CANCELLED never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, FormState::Done | FormState::Cancelled)
    }

    /// Whether this state is ever written to storage.
    pub fn is_persisted(self) -> bool {
        self != FormState::Faulted
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FormState::Waiting => "waiting",
            FormState::Processing => "processing",
            FormState::Done => "done",
            FormState::Cancelled => "cancelled",
            FormState::Faulted => "faulted",
        }
    }
}

impl fmt::Display for FormState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Waiting => "WAITING",
            Self::Processing => "PROCESSING",
            Self::Done => "DONE",
            Self::Cancelled => "CANCELLED",
            Self::Faulted => "FAULTED",
        };
        write!(f, "{s}")
    }
}

impl FromStr for FormState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "waiting" => Ok(Self::Waiting),
            "processing" => Ok(Self::Processing),
            "done" => Ok(Self::Done),
            "cancelled" => Ok(Self::Cancelled),
            "faulted" => Ok(Self::Faulted),
            other => Err(format!("unknown form state: {other}")),
        }
    }
}

/// Derive a job's aggregate state from its forms' states.
///
/// All FAULTED wins over all DONE, then any PROCESSING, else WAITING. An empty
/// set counts as all FAULTED; jobs without forms cannot be created.
pub fn aggregate_state<I>(states: I) -> FormState
where
    I: IntoIterator<Item = FormState>,
{
    let mut all_faulted = true;
    let mut all_done = true;
    let mut processing = false;

    for state in states {
        if state != FormState::Faulted {
            all_faulted = false;
        }
        if state != FormState::Done {
            all_done = false;
        }
        if state == FormState::Processing {
            processing = true;
        }
    }

    if all_faulted {
        FormState::Faulted
    } else if all_done {
        FormState::Done
    } else if processing {
        FormState::Processing
    } else {
        FormState::Waiting
    }
}
