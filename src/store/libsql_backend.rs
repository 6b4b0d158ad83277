//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Writes go through one
//! connection behind an async mutex, so a multi-statement transaction never
//! interleaves with other statements on the same connection. File databases
//! run in WAL mode and serve plain reads from a second connection that never
//! waits on that mutex. Form transitions are single conditional
//! `UPDATE ... RETURNING` statements: a compare-and-swap on `state` that holds
//! SQLite's write lock only for that statement.

use std::ops::Deref;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{DatabaseError, LedgerError};
use crate::forms::model::Form;
use crate::forms::state::FormState;
use crate::jobs::model::Job;
use crate::rewards::ledger::{RequesterUsage, UsageLedger, WorkerLedger, WorkerStats};
use crate::store::migrations;
use crate::store::traits::{ClaimFilter, Database};

const BUSY_TIMEOUT_MS: u32 = 5_000;

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: LibSqlDatabase,
    conn: Mutex<Connection>,
    /// Lock-free read connection. `None` for in-memory databases, where every
    /// connection opens its own empty database.
    reader: Option<Connection>,
}

/// Connection used for a plain read.
enum ReadConn<'a> {
    Shared(&'a Connection),
    Locked(MutexGuard<'a, Connection>),
}

impl Deref for ReadConn<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        match self {
            ReadConn::Shared(conn) => *conn,
            ReadConn::Locked(guard) => &**guard,
        }
    }
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db, true).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        Self::from_database(db, false).await
    }

    async fn from_database(db: LibSqlDatabase, separate_reader: bool) -> Result<Self, DatabaseError> {
        let conn = connect(&db)?;
        conn.execute("PRAGMA foreign_keys = ON", ())
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to enable foreign keys: {e}")))?;
        if separate_reader {
            pragma(&conn, "journal_mode = WAL").await?;
            pragma(&conn, &format!("busy_timeout = {BUSY_TIMEOUT_MS}")).await?;
        }

        let mut backend = Self {
            db,
            conn: Mutex::new(conn),
            reader: None,
        };
        backend.init_schema().await?;

        if separate_reader {
            let reader = connect(&backend.db)?;
            pragma(&reader, &format!("busy_timeout = {BUSY_TIMEOUT_MS}")).await?;
            backend.reader = Some(reader);
        }
        Ok(backend)
    }

    /// Exclusive use of the write connection.
    async fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().await
    }

    /// Connection for a single read statement.
    async fn reader(&self) -> ReadConn<'_> {
        match &self.reader {
            Some(conn) => ReadConn::Shared(conn),
            None => ReadConn::Locked(self.conn().await),
        }
    }
}

fn connect(db: &LibSqlDatabase) -> Result<Connection, DatabaseError> {
    db.connect()
        .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))
}

/// Run a PRAGMA that reports its new value as a row.
async fn pragma(conn: &Connection, pragma: &str) -> Result<(), DatabaseError> {
    let mut rows = conn
        .query(&format!("PRAGMA {pragma}"), ())
        .await
        .map_err(|e| DatabaseError::Pool(format!("PRAGMA {pragma}: {e}")))?;
    while let Ok(Some(_)) = rows.next().await {}
    Ok(())
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp format: fixed-width microseconds, `Z` suffix. Sorts
/// lexicographically in time order, which the expiry queries rely on.
fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| DatabaseError::Serialization(format!("bad timestamp {s:?}: {e}")))
}

fn parse_optional_ts(s: Option<String>) -> Option<DateTime<Utc>> {
    s.filter(|s| !s.is_empty())
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|d| d.with_timezone(&Utc))
}

fn opt_text(value: Option<String>) -> libsql::Value {
    match value {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

/// Counters are stored as SQLite INTEGER. Values past `i64::MAX` are refused
/// rather than wrapped negative.
fn to_sql_int(value: u64, what: &str) -> Result<i64, DatabaseError> {
    i64::try_from(value)
        .map_err(|_| DatabaseError::Constraint(format!("{what} {value} exceeds INTEGER range")))
}

fn parse_uuid(s: &str, what: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("{what} parse: {e}")))
}

fn json_text(value: Option<&serde_json::Value>) -> Result<Option<String>, DatabaseError> {
    value
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn parse_json(s: Option<String>) -> Option<serde_json::Value> {
    s.filter(|s| !s.is_empty())
        .and_then(|s| serde_json::from_str(&s).ok())
}

const JOB_COLUMNS: &str = "id, source, requester_id, trusted_workers, created_at, expiry";

const FORM_COLUMNS: &str = "id, job_id, position, name, state, payload, result, worker_id, attempts, created_at, claimed_at, claim_expiry";

/// FORM_COLUMNS qualified for joins against `jobs`.
const FORM_COLUMNS_F: &str = "f.id, f.job_id, f.position, f.name, f.state, f.payload, f.result, f.worker_id, f.attempts, f.created_at, f.claimed_at, f.claim_expiry";

/// Map a libsql Row to a Job. Column order matches JOB_COLUMNS.
fn row_to_job(row: &libsql::Row) -> Result<Job, DatabaseError> {
    let id_str: String = row.get(0).map_err(|e| DatabaseError::Query(format!("job.id: {e}")))?;
    let source: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("job.source: {e}")))?;
    let requester_id: String = row
        .get(2)
        .map_err(|e| DatabaseError::Query(format!("job.requester_id: {e}")))?;
    let trusted_workers = row.get::<i64>(3).unwrap_or(0) != 0;
    let created_str: String = row
        .get(4)
        .map_err(|e| DatabaseError::Query(format!("job.created_at: {e}")))?;
    let expiry_str: String = row
        .get(5)
        .map_err(|e| DatabaseError::Query(format!("job.expiry: {e}")))?;

    Ok(Job {
        id: parse_uuid(&id_str, "job.id")?,
        source,
        requester_id,
        trusted_workers,
        created_at: parse_ts(&created_str)?,
        expiry: parse_ts(&expiry_str)?,
    })
}

/// Map a libsql Row to a Form. Column order matches FORM_COLUMNS.
fn row_to_form(row: &libsql::Row) -> Result<Form, DatabaseError> {
    let id_str: String = row.get(0).map_err(|e| DatabaseError::Query(format!("form.id: {e}")))?;
    let job_id_str: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("form.job_id: {e}")))?;
    let position: i64 = row.get(2).unwrap_or(0);
    let name: String = row
        .get(3)
        .map_err(|e| DatabaseError::Query(format!("form.name: {e}")))?;
    let state_str: String = row
        .get(4)
        .map_err(|e| DatabaseError::Query(format!("form.state: {e}")))?;
    let state: FormState = state_str
        .parse()
        .map_err(|e: String| DatabaseError::Serialization(e))?;
    let payload = parse_json(row.get(5).ok());
    let result = parse_json(row.get(6).ok());
    let worker_id: Option<String> = row.get::<String>(7).ok().filter(|s| !s.is_empty());
    let attempts: i64 = row.get(8).unwrap_or(0);
    let created_str: String = row
        .get(9)
        .map_err(|e| DatabaseError::Query(format!("form.created_at: {e}")))?;

    Ok(Form {
        id: parse_uuid(&id_str, "form.id")?,
        job_id: parse_uuid(&job_id_str, "form.job_id")?,
        position: position as u32,
        name,
        state,
        payload,
        result,
        worker_id,
        attempts: attempts as u32,
        created_at: parse_ts(&created_str)?,
        claimed_at: parse_optional_ts(row.get(10).ok()),
        claim_expiry: parse_optional_ts(row.get(11).ok()),
    })
}

async fn collect_forms(mut rows: libsql::Rows, op: &str) -> Result<Vec<Form>, DatabaseError> {
    let mut forms = Vec::new();
    loop {
        match rows.next().await {
            Ok(Some(row)) => forms.push(row_to_form(&row)?),
            Ok(None) => break,
            Err(e) => return Err(DatabaseError::Query(format!("{op} row: {e}"))),
        }
    }
    Ok(forms)
}

async fn first_form(mut rows: libsql::Rows, op: &str) -> Result<Option<Form>, DatabaseError> {
    match rows.next().await {
        Ok(Some(row)) => Ok(Some(row_to_form(&row)?)),
        Ok(None) => Ok(None),
        Err(e) => Err(DatabaseError::Query(format!("{op} row: {e}"))),
    }
}

fn is_constraint(e: &libsql::Error) -> bool {
    let msg = e.to_string();
    msg.contains("UNIQUE") || msg.contains("CHECK") || msg.contains("FOREIGN KEY")
}

/// Inserts for `insert_job`, run inside its transaction.
async fn insert_job_rows(conn: &Connection, job: &Job, forms: &[Form]) -> Result<(), DatabaseError> {
    conn.execute(
        &format!("INSERT INTO jobs ({JOB_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"),
        params![
            job.id.to_string(),
            job.source.as_str(),
            job.requester_id.as_str(),
            job.trusted_workers as i64,
            fmt_ts(job.created_at),
            fmt_ts(job.expiry),
        ],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("insert_job: {e}")))?;

    for form in forms {
        conn.execute(
            &format!(
                "INSERT INTO forms ({FORM_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
            ),
            params![
                form.id.to_string(),
                job.id.to_string(),
                form.position as i64,
                form.name.as_str(),
                form.state.as_str(),
                opt_text(json_text(form.payload.as_ref())?),
                opt_text(json_text(form.result.as_ref())?),
                opt_text(form.worker_id.clone()),
                form.attempts as i64,
                fmt_ts(form.created_at),
                opt_text(form.claimed_at.map(fmt_ts)),
                opt_text(form.claim_expiry.map(fmt_ts)),
            ],
        )
        .await
        .map_err(|e| {
            if is_constraint(&e) {
                DatabaseError::Constraint(format!("insert form {}: {e}", form.name))
            } else {
                DatabaseError::Query(format!("insert form {}: {e}", form.name))
            }
        })?;
    }
    Ok(())
}

/// Finish an open `BEGIN`: commit on success, roll back on failure.
async fn finish_transaction<T>(
    conn: &Connection,
    outcome: Result<T, DatabaseError>,
    op: &str,
) -> Result<T, DatabaseError> {
    match outcome {
        Ok(value) => {
            conn.execute("COMMIT", ())
                .await
                .map_err(|e| DatabaseError::Query(format!("{op} commit: {e}")))?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback) = conn.execute("ROLLBACK", ()).await {
                tracing::warn!(op, error = %rollback, "Rollback failed");
            }
            Err(e)
        }
    }
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        let conn = self.conn().await;
        migrations::run_migrations(&conn).await
    }

    // ── Jobs ────────────────────────────────────────────────────────

    async fn insert_job(&self, job: &Job, forms: &[Form]) -> Result<(), DatabaseError> {
        let conn = self.conn().await;

        conn.execute("BEGIN IMMEDIATE", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_job begin: {e}")))?;
        let outcome = insert_job_rows(&conn, job, forms).await;
        finish_transaction(&conn, outcome, "insert_job").await?;

        debug!(job_id = %job.id, forms = forms.len(), "Job inserted into DB");
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError> {
        let conn = self.reader().await;
        let mut rows = conn
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_job: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_job(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_job row: {e}"))),
        }
    }

    async fn set_job_expiry(&self, id: Uuid, expiry: DateTime<Utc>) -> Result<bool, DatabaseError> {
        let conn = self.conn().await;
        let count = conn
            .execute(
                "UPDATE jobs SET expiry = ?1 WHERE id = ?2",
                params![fmt_ts(expiry), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_job_expiry: {e}")))?;
        Ok(count > 0)
    }

    async fn delete_job(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let conn = self.conn().await;

        conn.execute("BEGIN IMMEDIATE", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_job begin: {e}")))?;

        let outcome: Result<u64, DatabaseError> = async {
            conn.execute(
                "DELETE FROM forms WHERE job_id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_job forms: {e}")))?;
            conn.execute("DELETE FROM jobs WHERE id = ?1", params![id.to_string()])
                .await
                .map_err(|e| DatabaseError::Query(format!("delete_job: {e}")))
        }
        .await;

        let count = finish_transaction(&conn, outcome, "delete_job").await?;
        Ok(count > 0)
    }

    async fn purge_job(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, DatabaseError> {
        let conn = self.conn().await;

        conn.execute("BEGIN IMMEDIATE", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("purge_job begin: {e}")))?;

        let outcome: Result<u64, DatabaseError> = async {
            let mut rows = conn
                .query(
                    "SELECT 1 FROM jobs WHERE id = ?1 AND expiry < ?2 \
                     AND NOT EXISTS (SELECT 1 FROM forms WHERE job_id = ?1 \
                       AND state = 'processing' AND claim_expiry >= ?2)",
                    params![id.to_string(), fmt_ts(now)],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("purge_job check: {e}")))?;
            let expired = rows
                .next()
                .await
                .map_err(|e| DatabaseError::Query(format!("purge_job check row: {e}")))?
                .is_some();
            drop(rows);
            if !expired {
                return Ok(0);
            }

            conn.execute(
                "DELETE FROM forms WHERE job_id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("purge_job forms: {e}")))?;
            conn.execute("DELETE FROM jobs WHERE id = ?1", params![id.to_string()])
                .await
                .map_err(|e| DatabaseError::Query(format!("purge_job: {e}")))
        }
        .await;

        let count = finish_transaction(&conn, outcome, "purge_job").await?;
        Ok(count > 0)
    }

    async fn list_expired_jobs(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, DatabaseError> {
        let conn = self.reader().await;
        let mut rows = conn
            .query(
                "SELECT id FROM jobs WHERE expiry < ?1 ORDER BY expiry ASC",
                params![fmt_ts(now)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_expired_jobs: {e}")))?;

        let mut ids = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => {
                    let id_str: String = row
                        .get(0)
                        .map_err(|e| DatabaseError::Query(format!("list_expired_jobs id: {e}")))?;
                    ids.push(parse_uuid(&id_str, "job.id")?);
                }
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("list_expired_jobs row: {e}"))),
            }
        }
        Ok(ids)
    }

    // ── Forms ───────────────────────────────────────────────────────

    async fn get_form(&self, id: Uuid) -> Result<Option<Form>, DatabaseError> {
        let conn = self.reader().await;
        let rows = conn
            .query(
                &format!("SELECT {FORM_COLUMNS} FROM forms WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_form: {e}")))?;
        first_form(rows, "get_form").await
    }

    async fn list_forms(&self, job_id: Uuid) -> Result<Vec<Form>, DatabaseError> {
        let conn = self.reader().await;
        let rows = conn
            .query(
                &format!("SELECT {FORM_COLUMNS} FROM forms WHERE job_id = ?1 ORDER BY position ASC"),
                params![job_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_forms: {e}")))?;
        collect_forms(rows, "list_forms").await
    }

    async fn list_forms_by_state(&self, state: FormState) -> Result<Vec<Form>, DatabaseError> {
        if !state.is_persisted() {
            return Ok(Vec::new());
        }

        let conn = self.reader().await;
        let rows = conn
            .query(
                &format!(
                    "SELECT {FORM_COLUMNS} FROM forms WHERE state = ?1 ORDER BY created_at ASC, position ASC"
                ),
                params![state.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_forms_by_state: {e}")))?;
        collect_forms(rows, "list_forms_by_state").await
    }

    async fn list_claimable_forms(
        &self,
        filter: ClaimFilter<'_>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Form>, DatabaseError> {
        let names = serde_json::to_string(filter.names)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        let conn = self.reader().await;
        let rows = conn
            .query(
                &format!(
                    "SELECT {FORM_COLUMNS_F} FROM forms f JOIN jobs j ON j.id = f.job_id \
                     WHERE f.state = 'waiting' \
                       AND j.expiry >= ?1 \
                       AND (j.trusted_workers = 0 OR ?2 = 1) \
                       AND (?3 = '[]' OR f.name IN (SELECT value FROM json_each(?3))) \
                     ORDER BY j.created_at ASC, f.position ASC \
                     LIMIT ?4"
                ),
                params![
                    fmt_ts(now),
                    filter.trusted as i64,
                    names,
                    filter.limit as i64,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_claimable_forms: {e}")))?;
        collect_forms(rows, "list_claimable_forms").await
    }

    async fn claim_form(
        &self,
        id: Uuid,
        worker_id: &str,
        claimed_at: DateTime<Utc>,
        claim_expiry: DateTime<Utc>,
    ) -> Result<Option<Form>, DatabaseError> {
        let conn = self.conn().await;
        let rows = conn
            .query(
                &format!(
                    "UPDATE forms SET state = 'processing', worker_id = ?1, claimed_at = ?2, \
                     claim_expiry = ?3, attempts = attempts + 1 \
                     WHERE id = ?4 AND state = 'waiting' \
                       AND EXISTS (SELECT 1 FROM jobs j WHERE j.id = forms.job_id AND j.expiry >= ?2) \
                     RETURNING {FORM_COLUMNS}"
                ),
                params![worker_id, fmt_ts(claimed_at), fmt_ts(claim_expiry), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_form: {e}")))?;
        first_form(rows, "claim_form").await
    }

    async fn finish_form(
        &self,
        id: Uuid,
        to: FormState,
        result: Option<&serde_json::Value>,
    ) -> Result<Option<Form>, DatabaseError> {
        if !matches!(to, FormState::Done | FormState::Cancelled) {
            return Err(DatabaseError::Constraint(format!(
                "finish_form: {to} is not a finishing state"
            )));
        }
        // DONE always carries a result.
        if to == FormState::Done && result.is_none_or(serde_json::Value::is_null) {
            return Ok(None);
        }
        let result = opt_text(json_text(result)?);

        let conn = self.conn().await;
        let rows = conn
            .query(
                &format!(
                    "UPDATE forms SET state = ?1, result = ?2 \
                     WHERE id = ?3 AND state = 'processing' \
                     RETURNING {FORM_COLUMNS}"
                ),
                params![to.as_str(), result, id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("finish_form: {e}")))?;
        first_form(rows, "finish_form").await
    }

    async fn release_form(
        &self,
        id: Uuid,
        attempt: Option<u32>,
    ) -> Result<Option<Form>, DatabaseError> {
        let attempt = match attempt {
            Some(n) => libsql::Value::Integer(i64::from(n)),
            None => libsql::Value::Null,
        };

        let conn = self.conn().await;
        let rows = conn
            .query(
                &format!(
                    "UPDATE forms SET state = 'waiting', claimed_at = NULL, claim_expiry = NULL \
                     WHERE id = ?1 AND state = 'processing' AND (?2 IS NULL OR attempts = ?2) \
                     RETURNING {FORM_COLUMNS}"
                ),
                params![id.to_string(), attempt],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("release_form: {e}")))?;
        first_form(rows, "release_form").await
    }
}

// ── Ledgers ─────────────────────────────────────────────────────────

#[async_trait]
impl WorkerLedger for LibSqlBackend {
    async fn record_success(
        &self,
        worker_id: &str,
        kudos: u64,
        seconds_taken: u64,
    ) -> Result<(), LedgerError> {
        let conn = self.conn().await;
        conn.execute(
            "INSERT INTO worker_stats (worker_id, kudos, forms_completed, seconds_total, faults, updated_at) \
             VALUES (?1, ?2, 1, ?3, 0, ?4) \
             ON CONFLICT(worker_id) DO UPDATE SET \
               kudos = kudos + excluded.kudos, \
               forms_completed = forms_completed + 1, \
               seconds_total = seconds_total + excluded.seconds_total, \
               updated_at = excluded.updated_at",
            params![
                worker_id,
                to_sql_int(kudos, "kudos")?,
                to_sql_int(seconds_taken, "seconds_taken")?,
                fmt_ts(Utc::now()),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("record_success: {e}")))?;
        Ok(())
    }

    async fn record_fault(&self, worker_id: &str) -> Result<(), LedgerError> {
        let conn = self.conn().await;
        conn.execute(
            "INSERT INTO worker_stats (worker_id, faults, updated_at) VALUES (?1, 1, ?2) \
             ON CONFLICT(worker_id) DO UPDATE SET faults = faults + 1, updated_at = excluded.updated_at",
            params![worker_id, fmt_ts(Utc::now())],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("record_fault: {e}")))?;
        Ok(())
    }

    async fn worker_stats(&self, worker_id: &str) -> Result<WorkerStats, LedgerError> {
        let conn = self.reader().await;
        let mut rows = conn
            .query(
                "SELECT kudos, forms_completed, seconds_total, faults FROM worker_stats WHERE worker_id = ?1",
                params![worker_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("worker_stats: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(WorkerStats {
                kudos: row.get::<i64>(0).unwrap_or(0) as u64,
                forms_completed: row.get::<i64>(1).unwrap_or(0) as u64,
                seconds_total: row.get::<i64>(2).unwrap_or(0) as u64,
                faults: row.get::<i64>(3).unwrap_or(0) as u64,
            }),
            Ok(None) => Ok(WorkerStats::default()),
            Err(e) => Err(DatabaseError::Query(format!("worker_stats row: {e}")).into()),
        }
    }
}

#[async_trait]
impl UsageLedger for LibSqlBackend {
    async fn record_usage(&self, requester_id: &str, kudos_spent: u64) -> Result<(), LedgerError> {
        let conn = self.conn().await;
        conn.execute(
            "INSERT INTO requester_usage (requester_id, kudos_spent, forms_used, updated_at) \
             VALUES (?1, ?2, 1, ?3) \
             ON CONFLICT(requester_id) DO UPDATE SET \
               kudos_spent = kudos_spent + excluded.kudos_spent, \
               forms_used = forms_used + 1, \
               updated_at = excluded.updated_at",
            params![
                requester_id,
                to_sql_int(kudos_spent, "kudos_spent")?,
                fmt_ts(Utc::now()),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("record_usage: {e}")))?;
        Ok(())
    }

    async fn requester_usage(&self, requester_id: &str) -> Result<RequesterUsage, LedgerError> {
        let conn = self.reader().await;
        let mut rows = conn
            .query(
                "SELECT kudos_spent, forms_used FROM requester_usage WHERE requester_id = ?1",
                params![requester_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("requester_usage: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(RequesterUsage {
                kudos_spent: row.get::<i64>(0).unwrap_or(0) as u64,
                forms_used: row.get::<i64>(1).unwrap_or(0) as u64,
            }),
            Ok(None) => Ok(RequesterUsage::default()),
            Err(e) => Err(DatabaseError::Query(format!("requester_usage row: {e}")).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::jobs::model::RequesterCtx;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap()
    }

    fn make_job(names: &[&str]) -> (Job, Vec<Form>) {
        let job = Job::new(
            "s3://bucket/cat.png",
            &RequesterCtx::new("alice"),
            t0(),
            chrono::Duration::minutes(20),
        );
        let forms = names
            .iter()
            .enumerate()
            .map(|(i, name)| Form::new(job.id, i as u32, *name, None, t0()))
            .collect();
        (job, forms)
    }

    async fn count(db: &LibSqlBackend, table: &str) -> i64 {
        let conn = db.conn().await;
        let mut rows = conn
            .query(&format!("SELECT COUNT(*) FROM {table}"), ())
            .await
            .unwrap();
        rows.next().await.unwrap().unwrap().get(0).unwrap()
    }

    // ── Job tests ───────────────────────────────────────────────────

    #[tokio::test]
    async fn insert_and_get_job() {
        let db = test_db().await;
        let (job, forms) = make_job(&["caption", "tags"]);
        db.insert_job(&job, &forms).await.unwrap();

        let fetched = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, job.id);
        assert_eq!(fetched.source, "s3://bucket/cat.png");
        assert_eq!(fetched.requester_id, "alice");
        assert_eq!(fetched.expiry, job.expiry);

        let stored = db.list_forms(job.id).await.unwrap();
        let names: Vec<_> = stored.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["caption", "tags"]);
        assert!(stored.iter().all(|f| f.state == FormState::Waiting));
    }

    #[tokio::test]
    async fn get_job_not_found() {
        let db = test_db().await;
        assert!(db.get_job(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_insert_leaves_nothing_behind() {
        let db = test_db().await;
        let (job, mut forms) = make_job(&["caption", "tags"]);
        // Second form collides on the primary key after the job and the first
        // form have been written.
        forms[1].id = forms[0].id;

        let err = db.insert_job(&job, &forms).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Constraint(_)), "{err:?}");

        assert!(db.get_job(job.id).await.unwrap().is_none());
        assert_eq!(count(&db, "jobs").await, 0);
        assert_eq!(count(&db, "forms").await, 0);

        // The connection is usable again afterwards.
        let (job, forms) = make_job(&["caption"]);
        db.insert_job(&job, &forms).await.unwrap();
        assert_eq!(count(&db, "forms").await, 1);
    }

    #[tokio::test]
    async fn one_form_per_task_type() {
        let db = test_db().await;
        let (job, forms) = make_job(&["caption", "caption"]);
        assert!(db.insert_job(&job, &forms).await.is_err());
        assert_eq!(count(&db, "jobs").await, 0);
    }

    #[tokio::test]
    async fn delete_job_cascades() {
        let db = test_db().await;
        let (job, forms) = make_job(&["caption", "tags"]);
        db.insert_job(&job, &forms).await.unwrap();

        assert!(db.delete_job(job.id).await.unwrap());
        assert!(db.get_job(job.id).await.unwrap().is_none());
        assert_eq!(count(&db, "forms").await, 0);

        assert!(!db.delete_job(job.id).await.unwrap());
    }

    #[tokio::test]
    async fn expiry_update_and_listing() {
        let db = test_db().await;
        let (job, forms) = make_job(&["caption"]);
        db.insert_job(&job, &forms).await.unwrap();

        let after = job.expiry + chrono::Duration::seconds(1);
        assert_eq!(db.list_expired_jobs(after).await.unwrap(), vec![job.id]);

        assert!(db
            .set_job_expiry(job.id, after + chrono::Duration::minutes(5))
            .await
            .unwrap());
        assert!(db.list_expired_jobs(after).await.unwrap().is_empty());
        assert!(!db.set_job_expiry(Uuid::new_v4(), after).await.unwrap());
    }

    // ── Form tests ──────────────────────────────────────────────────

    #[tokio::test]
    async fn claim_is_compare_and_swap() {
        let db = test_db().await;
        let (job, forms) = make_job(&["caption"]);
        db.insert_job(&job, &forms).await.unwrap();
        let id = forms[0].id;
        let expiry = t0() + chrono::Duration::minutes(3);

        let claimed = db.claim_form(id, "w1", t0(), expiry).await.unwrap().unwrap();
        assert_eq!(claimed.state, FormState::Processing);
        assert_eq!(claimed.worker_id.as_deref(), Some("w1"));
        assert_eq!(claimed.claimed_at, Some(t0()));
        assert_eq!(claimed.claim_expiry, Some(expiry));
        assert_eq!(claimed.attempts, 1);

        assert!(db.claim_form(id, "w2", t0(), expiry).await.unwrap().is_none());
        let stored = db.get_form(id).await.unwrap().unwrap();
        assert_eq!(stored.worker_id.as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn finish_requires_processing() {
        let db = test_db().await;
        let (job, forms) = make_job(&["caption"]);
        db.insert_job(&job, &forms).await.unwrap();
        let id = forms[0].id;
        let result = serde_json::json!({"caption": "a cat"});

        assert!(db
            .finish_form(id, FormState::Done, Some(&result))
            .await
            .unwrap()
            .is_none());

        db.claim_form(id, "w1", t0(), t0() + chrono::Duration::minutes(3))
            .await
            .unwrap()
            .unwrap();
        let done = db
            .finish_form(id, FormState::Done, Some(&result))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.state, FormState::Done);
        assert_eq!(done.result, Some(result.clone()));
        assert_eq!(done.claimed_at, Some(t0()));

        assert!(db
            .finish_form(id, FormState::Cancelled, None)
            .await
            .unwrap()
            .is_none());
        assert!(db.finish_form(id, FormState::Waiting, None).await.is_err());
    }

    #[tokio::test]
    async fn claim_refused_once_job_expired() {
        let db = test_db().await;
        let (job, forms) = make_job(&["caption"]);
        db.insert_job(&job, &forms).await.unwrap();

        let late = job.expiry + chrono::Duration::seconds(1);
        let claim_expiry = late + chrono::Duration::minutes(3);
        assert!(db.claim_form(forms[0].id, "w1", late, claim_expiry).await.unwrap().is_none());
        assert_eq!(
            db.get_form(forms[0].id).await.unwrap().unwrap().state,
            FormState::Waiting
        );

        // Exactly at expiry is still in time.
        assert!(db
            .claim_form(forms[0].id, "w1", job.expiry, claim_expiry)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn done_requires_a_result() {
        let db = test_db().await;
        let (job, forms) = make_job(&["caption"]);
        db.insert_job(&job, &forms).await.unwrap();
        let id = forms[0].id;
        db.claim_form(id, "w1", t0(), t0() + chrono::Duration::minutes(3))
            .await
            .unwrap()
            .unwrap();

        let null = serde_json::Value::Null;
        assert!(db.finish_form(id, FormState::Done, Some(&null)).await.unwrap().is_none());
        assert!(db.finish_form(id, FormState::Done, None).await.unwrap().is_none());

        let stored = db.get_form(id).await.unwrap().unwrap();
        assert_eq!(stored.state, FormState::Processing);
        assert!(stored.result.is_none());
    }

    #[tokio::test]
    async fn purge_only_takes_idle_expired_jobs() {
        let db = test_db().await;
        let (idle, idle_forms) = make_job(&["caption"]);
        let (busy, busy_forms) = make_job(&["caption"]);
        db.insert_job(&idle, &idle_forms).await.unwrap();
        db.insert_job(&busy, &busy_forms).await.unwrap();

        // Claimed just before the job expired, claim still running after it.
        let claimed_at = busy.expiry - chrono::Duration::seconds(10);
        db.claim_form(
            busy_forms[0].id,
            "w1",
            claimed_at,
            claimed_at + chrono::Duration::minutes(3),
        )
        .await
        .unwrap()
        .unwrap();

        let now = idle.expiry + chrono::Duration::seconds(1);
        assert!(!db.purge_job(idle.id, idle.expiry).await.unwrap());
        assert!(!db.purge_job(busy.id, now).await.unwrap());
        assert!(db.purge_job(idle.id, now).await.unwrap());

        assert!(db.get_job(idle.id).await.unwrap().is_none());
        assert!(db.get_job(busy.id).await.unwrap().is_some());
        assert_eq!(count(&db, "forms").await, 1);

        // Once the claim window has passed too, the job goes.
        let later = claimed_at + chrono::Duration::minutes(4);
        assert!(db.purge_job(busy.id, later).await.unwrap());
        assert!(!db.purge_job(Uuid::new_v4(), later).await.unwrap());
    }

    #[tokio::test]
    async fn release_reopens_and_keeps_last_worker() {
        let db = test_db().await;
        let (job, forms) = make_job(&["caption"]);
        db.insert_job(&job, &forms).await.unwrap();
        let id = forms[0].id;

        db.claim_form(id, "w1", t0(), t0() + chrono::Duration::minutes(3))
            .await
            .unwrap()
            .unwrap();

        // A stale attempt number does not release the current claim.
        assert!(db.release_form(id, Some(7)).await.unwrap().is_none());

        let released = db.release_form(id, Some(1)).await.unwrap().unwrap();
        assert_eq!(released.state, FormState::Waiting);
        assert_eq!(released.worker_id.as_deref(), Some("w1"));
        assert!(released.claimed_at.is_none());
        assert!(released.claim_expiry.is_none());

        assert!(db.release_form(id, None).await.unwrap().is_none());
        assert!(db
            .claim_form(id, "w2", t0(), t0() + chrono::Duration::minutes(3))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn claimable_respects_trust_expiry_and_names() {
        let db = test_db().await;

        let (open, open_forms) = make_job(&["caption", "tags"]);
        db.insert_job(&open, &open_forms).await.unwrap();

        let trusted = Job::new(
            "img2",
            &RequesterCtx::new("bob").trusted_only(),
            t0() + chrono::Duration::seconds(1),
            chrono::Duration::minutes(20),
        );
        let trusted_forms = vec![Form::new(trusted.id, 0, "caption", None, t0())];
        db.insert_job(&trusted, &trusted_forms).await.unwrap();

        let any: Vec<String> = Vec::new();
        let filter = ClaimFilter { names: &any, trusted: false, limit: 10 };
        let found = db.list_claimable_forms(filter, t0()).await.unwrap();
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|f| f.job_id == open.id));
        assert_eq!(found[0].name, "caption");

        let filter = ClaimFilter { names: &any, trusted: true, limit: 10 };
        assert_eq!(db.list_claimable_forms(filter, t0()).await.unwrap().len(), 3);

        let tags = vec!["tags".to_string()];
        let filter = ClaimFilter { names: &tags, trusted: true, limit: 10 };
        let found = db.list_claimable_forms(filter, t0()).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "tags");

        let filter = ClaimFilter { names: &any, trusted: true, limit: 1 };
        assert_eq!(db.list_claimable_forms(filter, t0()).await.unwrap().len(), 1);

        let past_expiry = open.expiry + chrono::Duration::hours(1);
        let filter = ClaimFilter { names: &any, trusted: true, limit: 10 };
        assert!(db.list_claimable_forms(filter, past_expiry).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_by_state() {
        let db = test_db().await;
        let (job, forms) = make_job(&["caption", "tags"]);
        db.insert_job(&job, &forms).await.unwrap();
        db.claim_form(forms[1].id, "w1", t0(), t0() + chrono::Duration::minutes(3))
            .await
            .unwrap();

        let processing = db.list_forms_by_state(FormState::Processing).await.unwrap();
        assert_eq!(processing.len(), 1);
        assert_eq!(processing[0].name, "tags");
        assert_eq!(db.list_forms_by_state(FormState::Waiting).await.unwrap().len(), 1);
        assert!(db.list_forms_by_state(FormState::Faulted).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn payload_and_result_are_opaque_json() {
        let db = test_db().await;
        let job = Job::new("img", &RequesterCtx::new("alice"), t0(), chrono::Duration::minutes(20));
        let payload = serde_json::json!({"threshold": 0.35, "labels": ["cat", "dog"]});
        let forms = vec![Form::new(job.id, 0, "tags", Some(payload.clone()), t0())];
        db.insert_job(&job, &forms).await.unwrap();

        let stored = db.get_form(forms[0].id).await.unwrap().unwrap();
        assert_eq!(stored.payload, Some(payload));
        assert!(stored.result.is_none());
    }

    // ── Ledger tests ────────────────────────────────────────────────

    #[tokio::test]
    async fn worker_ledger_upserts() {
        let db = test_db().await;
        db.record_success("w1", 1, 30).await.unwrap();
        db.record_success("w1", 1, 12).await.unwrap();
        db.record_fault("w1").await.unwrap();
        db.record_fault("w2").await.unwrap();

        let w1 = db.worker_stats("w1").await.unwrap();
        assert_eq!(w1.kudos, 2);
        assert_eq!(w1.forms_completed, 2);
        assert_eq!(w1.seconds_total, 42);
        assert_eq!(w1.faults, 1);

        let w2 = db.worker_stats("w2").await.unwrap();
        assert_eq!(w2.faults, 1);
        assert_eq!(w2.kudos, 0);

        assert_eq!(db.worker_stats("w3").await.unwrap(), WorkerStats::default());
    }

    #[tokio::test]
    async fn usage_ledger_upserts() {
        let db = test_db().await;
        db.record_usage("alice", 1).await.unwrap();
        db.record_usage("alice", 2).await.unwrap();

        let usage = db.requester_usage("alice").await.unwrap();
        assert_eq!(usage.kudos_spent, 3);
        assert_eq!(usage.forms_used, 2);
    }

    #[tokio::test]
    async fn oversized_counters_are_refused() {
        let db = test_db().await;
        let err = db.record_success("w1", u64::MAX, 1).await.unwrap_err();
        assert!(matches!(err, LedgerError::Unavailable { .. }), "{err:?}");
        assert!(db.record_usage("alice", u64::MAX).await.is_err());

        assert_eq!(db.worker_stats("w1").await.unwrap(), WorkerStats::default());
        assert_eq!(db.requester_usage("alice").await.unwrap(), RequesterUsage::default());
    }

    #[tokio::test]
    async fn file_database_reads_do_not_wait_on_writes() {
        let dir = tempfile::tempdir().unwrap();
        let db = LibSqlBackend::new_local(&dir.path().join("dispatch.db"))
            .await
            .unwrap();
        let (job, forms) = make_job(&["caption"]);
        db.insert_job(&job, &forms).await.unwrap();

        let _writer = db.conn().await;
        let fetched = tokio::time::timeout(std::time::Duration::from_secs(5), db.get_job(job.id))
            .await
            .expect("read blocked behind the write connection")
            .unwrap();
        assert!(fetched.is_some());
        let forms = tokio::time::timeout(std::time::Duration::from_secs(5), db.list_forms(job.id))
            .await
            .expect("read blocked behind the write connection")
            .unwrap();
        assert_eq!(forms.len(), 1);
    }

    #[tokio::test]
    async fn local_file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/dispatch.db");
        let (job, forms) = make_job(&["caption"]);

        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.insert_job(&job, &forms).await.unwrap();
        }

        let db = LibSqlBackend::new_local(&path).await.unwrap();
        assert!(db.get_job(job.id).await.unwrap().is_some());
        assert_eq!(db.list_forms(job.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let db = test_db().await;
        db.init_schema().await.unwrap();
    }
}
