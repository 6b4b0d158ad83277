//! Error types for form dispatch.
//!
//! Contention misses and invalid transitions are not errors here: they are
//! reported as `Ok(None)` / `Ok(0)` / `Ok(false)` by the operations themselves.
//! Only persistence and validation failures surface as `Err`.

use uuid::Uuid;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Job submission and lookup errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: Uuid },

    #[error("Job submission contains no forms")]
    NoForms,

    #[error("Invalid form name {name:?}: {reason}")]
    InvalidFormName { name: String, reason: String },
}

/// Reward / usage ledger errors.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Ledger {ledger} unavailable: {reason}")]
    Unavailable { ledger: String, reason: String },
}

impl From<DatabaseError> for LedgerError {
    fn from(e: DatabaseError) -> Self {
        LedgerError::Unavailable {
            ledger: "database".to_string(),
            reason: e.to_string(),
        }
    }
}

/// Result type alias for form dispatch.
pub type Result<T> = std::result::Result<T, Error>;
