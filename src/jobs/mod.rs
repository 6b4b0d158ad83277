//! Jobs: the parent unit grouping one source item's forms.

pub mod aggregator;
pub mod model;

pub use aggregator::JobAggregator;
pub use model::{FormRequest, Job, JobPop, JobStatus, PopRequest, RequesterCtx};
