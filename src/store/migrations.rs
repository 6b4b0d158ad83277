//! Schema migrations for the libSQL backend.
//!
//! Steps are numbered and applied in order. Each step and its entry in
//! `schema_version` commit together, so a failed step leaves the schema at
//! the previous version.

use libsql::{Connection, params};

use crate::error::DatabaseError;

struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// Append only.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "jobs_and_forms",
        sql: r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                source TEXT NOT NULL,
                requester_id TEXT NOT NULL,
                trusted_workers INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                expiry TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_expiry ON jobs(expiry);
            CREATE INDEX IF NOT EXISTS idx_jobs_created ON jobs(created_at);

            CREATE TABLE IF NOT EXISTS forms (
                id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                position INTEGER NOT NULL,
                name TEXT NOT NULL CHECK (length(name) BETWEEN 1 AND 30),
                state TEXT NOT NULL DEFAULT 'waiting'
                    CHECK (state IN ('waiting', 'processing', 'done', 'cancelled')),
                payload TEXT,
                result TEXT,
                worker_id TEXT,
                attempts INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                claimed_at TEXT,
                claim_expiry TEXT,
                UNIQUE (job_id, name)
            );
            CREATE INDEX IF NOT EXISTS idx_forms_job ON forms(job_id);
            CREATE INDEX IF NOT EXISTS idx_forms_state ON forms(state);
            CREATE INDEX IF NOT EXISTS idx_forms_claim_expiry ON forms(claim_expiry);
        "#,
    },
    Migration {
        version: 2,
        name: "reward_ledgers",
        sql: r#"
            CREATE TABLE IF NOT EXISTS worker_stats (
                worker_id TEXT PRIMARY KEY,
                kudos INTEGER NOT NULL DEFAULT 0,
                forms_completed INTEGER NOT NULL DEFAULT 0,
                seconds_total INTEGER NOT NULL DEFAULT 0,
                faults INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS requester_usage (
                requester_id TEXT PRIMARY KEY,
                kudos_spent INTEGER NOT NULL DEFAULT 0,
                forms_used INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            );
        "#,
    },
];

/// Bring the schema up to the newest version.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("schema_version table: {e}")))?;

    let current = schema_version(conn).await?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > current).collect();
    if pending.is_empty() {
        tracing::debug!(version = current, "Schema up to date");
        return Ok(());
    }

    for step in pending {
        tracing::info!(version = step.version, name = step.name, "Applying migration");
        apply(conn, step).await?;
    }
    Ok(())
}

/// Run one step and record it, atomically.
async fn apply(conn: &Connection, step: &Migration) -> Result<(), DatabaseError> {
    let fail = |what: &str, e: libsql::Error| {
        DatabaseError::Migration(format!("V{} {} {what}: {e}", step.version, step.name))
    };

    conn.execute("BEGIN IMMEDIATE", ())
        .await
        .map_err(|e| fail("begin", e))?;

    let outcome: Result<u64, DatabaseError> = async {
        conn.execute_batch(step.sql).await.map_err(|e| fail("apply", e))?;
        conn.execute(
            "INSERT INTO schema_version (version, name) VALUES (?1, ?2)",
            params![step.version, step.name],
        )
        .await
        .map_err(|e| fail("record", e))
    }
    .await;

    match outcome {
        Ok(_) => conn
            .execute("COMMIT", ())
            .await
            .map(|_| ())
            .map_err(|e| fail("commit", e)),
        Err(e) => {
            let _ = conn.execute("ROLLBACK", ()).await;
            Err(e)
        }
    }
}

/// Newest applied version; 0 on a fresh database.
async fn schema_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT IFNULL(MAX(version), 0) FROM schema_version", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("read schema_version: {e}")))?;

    match rows.next().await {
        Ok(Some(row)) => row
            .get::<i64>(0)
            .map_err(|e| DatabaseError::Migration(format!("schema_version value: {e}"))),
        Ok(None) => Ok(0),
        Err(e) => Err(DatabaseError::Migration(format!("schema_version row: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fresh() -> Connection {
        libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap()
            .connect()
            .unwrap()
    }

    async fn table_names(conn: &Connection) -> Vec<String> {
        let mut rows = conn
            .query("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name", ())
            .await
            .unwrap();
        let mut names = Vec::new();
        while let Some(row) = rows.next().await.unwrap() {
            names.push(row.get::<String>(0).unwrap());
        }
        names
    }

    #[tokio::test]
    async fn fresh_database_gets_every_table() {
        let conn = fresh().await;
        run_migrations(&conn).await.unwrap();

        let tables = table_names(&conn).await;
        for expected in ["forms", "jobs", "requester_usage", "schema_version", "worker_stats"] {
            assert!(tables.iter().any(|t| t == expected), "missing {expected}: {tables:?}");
        }
        assert_eq!(schema_version(&conn).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn rerun_applies_nothing() {
        let conn = fresh().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        let mut rows = conn
            .query("SELECT group_concat(name, ',') FROM (SELECT name FROM schema_version ORDER BY version)", ())
            .await
            .unwrap();
        let names: String = rows.next().await.unwrap().unwrap().get(0).unwrap();
        assert_eq!(names, "jobs_and_forms,reward_ledgers");
    }

    async fn insert_form(
        conn: &Connection,
        id: &str,
        name: &str,
        state: &str,
    ) -> Result<u64, libsql::Error> {
        conn.execute(
            "INSERT INTO forms (id, job_id, position, name, state, created_at) \
             VALUES (?1, 'j1', 0, ?2, ?3, '2026-01-01T00:00:00.000000Z')",
            params![id, name, state],
        )
        .await
    }

    #[tokio::test]
    async fn faulted_is_not_a_storable_state() {
        let conn = fresh().await;
        run_migrations(&conn).await.unwrap();

        conn.execute(
            "INSERT INTO jobs (id, source, requester_id, created_at, expiry) \
             VALUES ('j1', 'img', 'r', '2026-01-01T00:00:00.000000Z', '2026-01-01T00:20:00.000000Z')",
            (),
        )
        .await
        .unwrap();

        assert!(insert_form(&conn, "f1", "caption", "waiting").await.is_ok());
        assert!(insert_form(&conn, "f2", "tags", "faulted").await.is_err());
    }
}
