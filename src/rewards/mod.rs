//! Rewards: worker kudos, fault counts, and requester usage.

pub mod ledger;
pub mod recorder;

pub use ledger::{MemoryLedger, RequesterUsage, UsageLedger, WorkerLedger, WorkerStats};
pub use recorder::RewardRecorder;
