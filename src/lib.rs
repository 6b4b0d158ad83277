//! Form dispatch: job and form lifecycle engine for a pool of remote workers.

pub mod clock;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod forms;
pub mod jobs;
pub mod reclaim;
pub mod rewards;
pub mod store;
