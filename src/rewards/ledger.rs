//! Ledger interfaces: worker rewards and requester usage.
//!
//! The dispatcher only ever adds to a ledger. How kudos are valued or spent is
//! someone else's problem.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::LedgerError;

/// Accumulated statistics for one worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub kudos: u64,
    pub forms_completed: u64,
    pub seconds_total: u64,
    pub faults: u64,
}

/// Accumulated usage for one requester.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequesterUsage {
    pub kudos_spent: u64,
    pub forms_used: u64,
}

/// Where worker rewards and failures accrue.
#[async_trait]
pub trait WorkerLedger: Send + Sync {
    /// Credit a finished (or cancelled) form.
    async fn record_success(
        &self,
        worker_id: &str,
        kudos: u64,
        seconds_taken: u64,
    ) -> Result<(), LedgerError>;

    /// Count one abandoned claim against the worker.
    async fn record_fault(&self, worker_id: &str) -> Result<(), LedgerError>;

    /// Read back a worker's totals. Unknown workers have zero stats.
    async fn worker_stats(&self, worker_id: &str) -> Result<WorkerStats, LedgerError>;
}

/// Where requester costs accrue.
#[async_trait]
pub trait UsageLedger: Send + Sync {
    /// Debit kudos for one form processed on the requester's behalf.
    async fn record_usage(&self, requester_id: &str, kudos_spent: u64) -> Result<(), LedgerError>;

    /// Read back a requester's totals. Unknown requesters have zero usage.
    async fn requester_usage(&self, requester_id: &str) -> Result<RequesterUsage, LedgerError>;
}

/// In-process ledger. Serves both roles.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    workers: RwLock<HashMap<String, WorkerStats>>,
    requesters: RwLock<HashMap<String, RequesterUsage>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkerLedger for MemoryLedger {
    async fn record_success(
        &self,
        worker_id: &str,
        kudos: u64,
        seconds_taken: u64,
    ) -> Result<(), LedgerError> {
        let mut workers = self.workers.write().await;
        let stats = workers.entry(worker_id.to_string()).or_default();
        stats.kudos = stats.kudos.saturating_add(kudos);
        stats.forms_completed = stats.forms_completed.saturating_add(1);
        stats.seconds_total = stats.seconds_total.saturating_add(seconds_taken);
        Ok(())
    }

    async fn record_fault(&self, worker_id: &str) -> Result<(), LedgerError> {
        let mut workers = self.workers.write().await;
        let stats = workers.entry(worker_id.to_string()).or_default();
        stats.faults = stats.faults.saturating_add(1);
        Ok(())
    }

    async fn worker_stats(&self, worker_id: &str) -> Result<WorkerStats, LedgerError> {
        Ok(self
            .workers
            .read()
            .await
            .get(worker_id)
            .copied()
            .unwrap_or_default())
    }
}

#[async_trait]
impl UsageLedger for MemoryLedger {
    async fn record_usage(&self, requester_id: &str, kudos_spent: u64) -> Result<(), LedgerError> {
        let mut requesters = self.requesters.write().await;
        let usage = requesters.entry(requester_id.to_string()).or_default();
        usage.kudos_spent = usage.kudos_spent.saturating_add(kudos_spent);
        usage.forms_used = usage.forms_used.saturating_add(1);
        Ok(())
    }

    async fn requester_usage(&self, requester_id: &str) -> Result<RequesterUsage, LedgerError> {
        Ok(self
            .requesters
            .read()
            .await
            .get(requester_id)
            .copied()
            .unwrap_or_default())
    }
}
