//! Postgres-backed job store.
//!
//! Each job is one row. Indexed columns (`state`, `revision`, `deadline`,
//! `last_transition_at`) are kept next to the full record in `record`
//! (JSONB), and compare-and-swap is a single conditional `UPDATE`:
//!
//! ```sql
//! UPDATE warden_jobs SET ... WHERE id = $id AND state = $state AND revision = $revision
//! ```
//!
//! Zero affected rows means the expectation did not hold.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database | Any | `Storage` |
//! | PoolClosed / other | N/A | `Storage` |

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use warden_core::{Expected, Job, JobId, JobState};

use super::store::{JobStore, JobStoreError, PutMode, ScanKind, ScanPage};

/// Table and indexes used by [`PostgresJobStore`].
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS warden_jobs (
    id                 UUID PRIMARY KEY,
    state              TEXT        NOT NULL,
    revision           BIGINT      NOT NULL,
    deadline           TIMESTAMPTZ NOT NULL,
    last_transition_at TIMESTAMPTZ NOT NULL,
    record             JSONB       NOT NULL
);
CREATE INDEX IF NOT EXISTS warden_jobs_open_deadline_idx
    ON warden_jobs (deadline)
    WHERE state IN ('submitted', 'provisioning', 'running');
CREATE INDEX IF NOT EXISTS warden_jobs_awaiting_reclaim_idx
    ON warden_jobs (last_transition_at)
    WHERE state IN ('completed', 'failed');
"#;

#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the table and indexes if they do not exist.
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    async fn exists(&self, id: JobId) -> Result<bool, JobStoreError> {
        let row = sqlx::query("SELECT 1 FROM warden_jobs WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("exists", e))?;
        Ok(row.is_some())
    }
}

fn revision_to_db(revision: u64) -> Result<i64, JobStoreError> {
    i64::try_from(revision)
        .map_err(|_| JobStoreError::Storage(format!("revision {revision} out of range")))
}

fn row_to_job(row: &sqlx::postgres::PgRow) -> Result<Job, JobStoreError> {
    let Json(mut job): Json<Job> = row
        .try_get("record")
        .map_err(|e| map_sqlx_error("decode record", e))?;
    let revision: i64 = row
        .try_get("revision")
        .map_err(|e| map_sqlx_error("decode revision", e))?;
    job.revision = u64::try_from(revision)
        .map_err(|_| JobStoreError::Storage(format!("negative revision {revision}")))?;
    Ok(job)
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id, mode = ?mode), err)]
    async fn put(&self, mut job: Job, mode: PutMode) -> Result<Job, JobStoreError> {
        match mode {
            PutMode::CreateOnly => {
                job.revision = 0;
                let result = sqlx::query(
                    r#"
                    INSERT INTO warden_jobs (id, state, revision, deadline, last_transition_at, record)
                    VALUES ($1, $2, 0, $3, $4, $5)
                    ON CONFLICT (id) DO NOTHING
                    "#,
                )
                .bind(job.id.as_uuid())
                .bind(job.state.as_str())
                .bind(job.deadline)
                .bind(job.last_transition_at)
                .bind(Json(&job))
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("put", e))?;

                if result.rows_affected() == 0 {
                    return Err(JobStoreError::AlreadyExists(job.id));
                }
                Ok(job)
            }
            PutMode::Overwrite => {
                let row = sqlx::query(
                    r#"
                    INSERT INTO warden_jobs (id, state, revision, deadline, last_transition_at, record)
                    VALUES ($1, $2, 0, $3, $4, $5)
                    ON CONFLICT (id) DO UPDATE SET
                        state = EXCLUDED.state,
                        revision = warden_jobs.revision + 1,
                        deadline = EXCLUDED.deadline,
                        last_transition_at = EXCLUDED.last_transition_at,
                        record = EXCLUDED.record
                    RETURNING revision
                    "#,
                )
                .bind(job.id.as_uuid())
                .bind(job.state.as_str())
                .bind(job.deadline)
                .bind(job.last_transition_at)
                .bind(Json(&job))
                .fetch_one(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("put", e))?;

                let revision: i64 = row
                    .try_get("revision")
                    .map_err(|e| map_sqlx_error("put", e))?;
                job.revision = u64::try_from(revision)
                    .map_err(|_| JobStoreError::Storage(format!("negative revision {revision}")))?;
                Ok(job)
            }
        }
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get(&self, id: JobId) -> Result<Job, JobStoreError> {
        let row = sqlx::query("SELECT revision, record FROM warden_jobs WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?
            .ok_or(JobStoreError::NotFound(id))?;

        row_to_job(&row)
    }

    #[instrument(
        skip(self, new),
        fields(job_id = %id, expected_state = %expected.state, expected_revision = expected.revision),
        err
    )]
    async fn compare_and_swap(
        &self,
        id: JobId,
        expected: Expected,
        mut new: Job,
    ) -> Result<Job, JobStoreError> {
        if new.id != id {
            return Err(JobStoreError::Storage(format!(
                "record for job {} cannot replace job {id}",
                new.id
            )));
        }

        new.revision = expected.revision + 1;
        let result = sqlx::query(
            r#"
            UPDATE warden_jobs
            SET state = $1,
                revision = $2,
                deadline = $3,
                last_transition_at = $4,
                record = $5
            WHERE id = $6 AND state = $7 AND revision = $8
            "#,
        )
        .bind(new.state.as_str())
        .bind(revision_to_db(new.revision)?)
        .bind(new.deadline)
        .bind(new.last_transition_at)
        .bind(Json(&new))
        .bind(id.as_uuid())
        .bind(expected.state.as_str())
        .bind(revision_to_db(expected.revision)?)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("compare_and_swap", e))?;

        if result.rows_affected() == 1 {
            return Ok(new);
        }

        if self.exists(id).await? {
            Err(JobStoreError::Conflict {
                id,
                reason: format!(
                    "expected {}@{} no longer current",
                    expected.state, expected.revision
                ),
            })
        } else {
            Err(JobStoreError::NotFound(id))
        }
    }

    async fn scan(
        &self,
        kind: ScanKind,
        after: Option<JobId>,
        limit: usize,
    ) -> Result<ScanPage, JobStoreError> {
        let after: Option<Uuid> = after.map(Uuid::from);
        let limit_db = i64::try_from(limit).unwrap_or(i64::MAX);

        let rows = match kind {
            ScanKind::DeadlineExpired { now } => {
                sqlx::query(
                    r#"
                    SELECT id FROM warden_jobs
                    WHERE state IN ('submitted', 'provisioning', 'running')
                      AND deadline <= $1
                      AND ($2::uuid IS NULL OR id > $2)
                    ORDER BY id ASC
                    LIMIT $3
                    "#,
                )
                .bind(now)
                .bind(after)
                .bind(limit_db)
                .fetch_all(&*self.pool)
                .await
            }
            ScanKind::AwaitingReclaim { settled_before } => {
                sqlx::query(
                    r#"
                    SELECT id FROM warden_jobs
                    WHERE state IN ('completed', 'failed')
                      AND last_transition_at <= $1
                      AND ($2::uuid IS NULL OR id > $2)
                    ORDER BY id ASC
                    LIMIT $3
                    "#,
                )
                .bind(settled_before)
                .bind(after)
                .bind(limit_db)
                .fetch_all(&*self.pool)
                .await
            }
        }
        .map_err(|e| map_sqlx_error("scan", e))?;

        let ids = rows
            .iter()
            .map(|row| {
                row.try_get::<Uuid, _>("id")
                    .map(JobId::from_uuid)
                    .map_err(|e| map_sqlx_error("scan", e))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let next = if limit > 0 && ids.len() == limit {
            ids.last().copied()
        } else {
            None
        };

        Ok(ScanPage { ids, next })
    }

    async fn list(&self, state: Option<JobState>, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT revision, record FROM warden_jobs
            WHERE ($1::text IS NULL OR state = $1)
            ORDER BY id DESC
            LIMIT $2
            "#,
        )
        .bind(state.map(JobState::as_str))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list", e))?;

        rows.iter().map(row_to_job).collect()
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            JobStoreError::Storage(msg)
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}
