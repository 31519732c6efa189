//! Postgres-backed job mirror.
//!
//! Writes are fire-and-forget: [`JobMirror::record`] spawns an upsert on
//! the tokio runtime captured at construction and returns immediately.
//! Failures are logged from the spawned task.
//!
//! ## Error Mapping
//!
//! | SQLx Error | MirrorError |
//! |------------|-------------|
//! | Database (any code) | `Storage` with the database message |
//! | PoolClosed | `Storage("connection pool closed")` |
//! | Other | `Storage` with the sqlx message |

use sqlx::PgPool;
use tokio::runtime::Handle;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use chrono::{DateTime, Utc};

use crate::error::MirrorError;

use super::{JobMirror, MirrorRecord};

/// Table definition expected by [`PostgresJobMirror`].
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id UUID PRIMARY KEY,
    owner_id UUID NULL,
    queue TEXT NOT NULL,
    job_type TEXT NOT NULL,
    status TEXT NOT NULL,
    priority TEXT NOT NULL,
    progress SMALLINT NOT NULL,
    total_items BIGINT NOT NULL,
    processed_items BIGINT NOT NULL,
    success_count BIGINT NOT NULL,
    error_count BIGINT NOT NULL,
    errors JSONB NOT NULL,
    metadata JSONB NOT NULL,
    attempt INTEGER NOT NULL,
    revision BIGINT NOT NULL DEFAULT 0,
    created_at TIMESTAMPTZ NOT NULL,
    scheduled_at TIMESTAMPTZ NOT NULL,
    started_at TIMESTAMPTZ NULL,
    completed_at TIMESTAMPTZ NULL,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// Adds the `revision` column to tables created before it existed.
const ADD_REVISION_COLUMN: &str =
    "ALTER TABLE jobs ADD COLUMN IF NOT EXISTS revision BIGINT NOT NULL DEFAULT 0";

/// Upsert that never lets an older revision overwrite a newer row.
const UPSERT_JOB: &str = r#"
INSERT INTO jobs (
    id, owner_id, queue, job_type, status, priority, progress,
    total_items, processed_items, success_count, error_count,
    errors, metadata, attempt, revision, created_at, scheduled_at,
    started_at, completed_at, updated_at
)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, NOW())
ON CONFLICT (id) DO UPDATE SET
    status = EXCLUDED.status,
    priority = EXCLUDED.priority,
    progress = EXCLUDED.progress,
    total_items = EXCLUDED.total_items,
    processed_items = EXCLUDED.processed_items,
    success_count = EXCLUDED.success_count,
    error_count = EXCLUDED.error_count,
    errors = EXCLUDED.errors,
    metadata = EXCLUDED.metadata,
    attempt = EXCLUDED.attempt,
    revision = EXCLUDED.revision,
    scheduled_at = EXCLUDED.scheduled_at,
    started_at = EXCLUDED.started_at,
    completed_at = EXCLUDED.completed_at,
    updated_at = NOW()
WHERE jobs.revision < EXCLUDED.revision
"#;

const ORPHANED_ERROR: &str = "orphaned: process restarted while the job was running";

/// Mirror that upserts job rows into Postgres.
#[derive(Debug, Clone)]
pub struct PostgresJobMirror {
    pool: PgPool,
    runtime: Handle,
}

impl PostgresJobMirror {
    /// Create a mirror that spawns writes onto `runtime`.
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self { pool, runtime }
    }

    /// Create a mirror bound to the runtime of the calling context.
    pub fn from_current_runtime(pool: PgPool) -> Result<Self, MirrorError> {
        let runtime = Handle::try_current().map_err(|_| {
            MirrorError::Storage(
                "PostgresJobMirror requires a tokio runtime; construct it from within one".to_string(),
            )
        })?;
        Ok(Self::new(pool, runtime))
    }

    /// Create the `jobs` table if it does not exist.
    pub async fn ensure_schema(&self) -> Result<(), MirrorError> {
        for statement in [SCHEMA, ADD_REVISION_COLUMN] {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }

    /// Upsert a job row and wait for the result.
    #[instrument(skip(self, record), fields(job_id = %record.id, status = %record.status), err)]
    pub async fn upsert(&self, record: &MirrorRecord) -> Result<(), MirrorError> {
        upsert_row(&self.pool, PgJobRow::try_from(record)?).await
    }

    /// Mark rows left `running` by a previous process as `failed`.
    ///
    /// The in-memory queue is not durable, so rows that were running when
    /// the process died would otherwise stay `running` forever. Only rows
    /// belonging to `queues` are touched; call this at startup before the
    /// dispatcher runs. Returns the number of rows updated.
    #[instrument(skip(self), err)]
    pub async fn reconcile_orphans(&self, queues: &[String]) -> Result<u64, MirrorError> {
        let errors = serde_json::json!([ORPHANED_ERROR]);
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed',
                completed_at = NOW(),
                updated_at = NOW(),
                errors = errors || $2,
                revision = revision + 1
            WHERE status = 'running' AND queue = ANY($1)
            "#,
        )
        .bind(queues)
        .bind(errors)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("reconcile_orphans", e))?;

        let updated = result.rows_affected();
        if updated > 0 {
            warn!(updated, "marked orphaned running jobs as failed");
        }
        Ok(updated)
    }
}

impl JobMirror for PostgresJobMirror {
    fn record(&self, record: &MirrorRecord) -> Result<(), MirrorError> {
        let row = PgJobRow::try_from(record)?;
        let pool = self.pool.clone();
        self.runtime.spawn(async move {
            let job_id = row.id;
            match upsert_row(&pool, row).await {
                Ok(()) => debug!(%job_id, "mirrored job row"),
                Err(error) => warn!(%job_id, %error, "mirror write failed"),
            }
        });
        Ok(())
    }
}

/// Column values converted to Postgres types.
#[derive(Debug, Clone, PartialEq)]
struct PgJobRow {
    id: Uuid,
    owner_id: Option<Uuid>,
    queue: String,
    job_type: String,
    status: &'static str,
    priority: &'static str,
    progress: i16,
    total_items: i64,
    processed_items: i64,
    success_count: i64,
    error_count: i64,
    errors: serde_json::Value,
    metadata: serde_json::Value,
    attempt: i32,
    revision: i64,
    created_at: DateTime<Utc>,
    scheduled_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<&MirrorRecord> for PgJobRow {
    type Error = MirrorError;

    fn try_from(record: &MirrorRecord) -> Result<Self, Self::Error> {
        let errors = serde_json::to_value(&record.errors)
            .map_err(|e| MirrorError::Serialization(e.to_string()))?;

        Ok(Self {
            id: *record.id.as_uuid(),
            owner_id: record.owner.map(|o| *o.as_uuid()),
            queue: record.queue.clone(),
            job_type: record.job_type.clone(),
            status: record.status.as_str(),
            priority: record.priority.as_str(),
            progress: i16::from(record.progress),
            total_items: to_i64(record.total_items),
            processed_items: to_i64(record.processed_items),
            success_count: to_i64(record.success_count),
            error_count: to_i64(record.error_count),
            errors,
            metadata: record.metadata.clone(),
            attempt: i32::try_from(record.attempt).unwrap_or(i32::MAX),
            revision: to_i64(record.revision),
            created_at: record.created_at,
            scheduled_at: record.scheduled_at,
            started_at: record.started_at,
            completed_at: record.completed_at,
        })
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

async fn upsert_row(pool: &PgPool, row: PgJobRow) -> Result<(), MirrorError> {
    sqlx::query(UPSERT_JOB)
    .bind(row.id)
    .bind(row.owner_id)
    .bind(row.queue)
    .bind(row.job_type)
    .bind(row.status)
    .bind(row.priority)
    .bind(row.progress)
    .bind(row.total_items)
    .bind(row.processed_items)
    .bind(row.success_count)
    .bind(row.error_count)
    .bind(row.errors)
    .bind(row.metadata)
    .bind(row.attempt)
    .bind(row.revision)
    .bind(row.created_at)
    .bind(row.scheduled_at)
    .bind(row.started_at)
    .bind(row.completed_at)
    .execute(pool)
    .await
    .map_err(|e| map_sqlx_error("upsert_job", e))?;

    Ok(())
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> MirrorError {
    match err {
        sqlx::Error::Database(db_err) => MirrorError::Storage(format!(
            "database error in {}: {}",
            operation,
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            MirrorError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => MirrorError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}
