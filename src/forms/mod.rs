//! Forms: the claimable units of work inside a job.

pub mod model;
pub mod state;
pub mod store;

pub use model::{ClaimPayload, Form, FormStatus, WorkerRef};
pub use state::{FormEvent, FormState, aggregate_state};
pub use store::FormStore;
