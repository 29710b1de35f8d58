//! Postgres-backed job repository and audit log.
//!
//! Envelope and entity live in the `payload` JSONB column; everything the
//! admin surface filters on has its own column.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::instrument;

use async_trait::async_trait;
use jobforge_core::{ActorId, JobEnvelope, JobId, JobRecord, JobStatus, TenantId};

use super::{AuditEntry, AuditLog, JobRepository, RepositoryError, RepositoryResult};

const JOBS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS queue_jobs (
    id UUID PRIMARY KEY,
    job_type TEXT NOT NULL,
    queue_name TEXT NOT NULL,
    status TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL,
    idempotency_key TEXT NOT NULL,
    trace_id TEXT NOT NULL,
    tenant_id BIGINT,
    actor_id BIGINT,
    payload JSONB NOT NULL,
    transport_job_id TEXT,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL,
    started_at TIMESTAMPTZ,
    finished_at TIMESTAMPTZ,
    error_message TEXT
);
CREATE INDEX IF NOT EXISTS queue_jobs_status_idx ON queue_jobs (queue_name, status);
CREATE INDEX IF NOT EXISTS queue_jobs_idempotency_idx ON queue_jobs (idempotency_key);
"#;

const AUDIT_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS queue_audit_log (
    id BIGSERIAL PRIMARY KEY,
    actor_id BIGINT,
    action TEXT NOT NULL,
    resource TEXT NOT NULL,
    payload JSONB NOT NULL,
    created_at TIMESTAMPTZ NOT NULL
);
"#;

fn map_sqlx_error(operation: &str, job_id: Option<JobId>, err: sqlx::Error) -> RepositoryError {
    match (&err, job_id) {
        (sqlx::Error::Database(db_err), Some(id)) if db_err.code().as_deref() == Some("23505") => {
            RepositoryError::AlreadyExists(id)
        }
        _ => RepositoryError::Storage(format!("{operation}: {err}")),
    }
}

#[derive(Debug, Clone)]
pub struct PgJobRepository {
    pool: Arc<PgPool>,
}

impl PgJobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }

    pub async fn ensure_schema(&self) -> RepositoryResult<()> {
        sqlx::raw_sql(JOBS_SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", None, e))?;
        Ok(())
    }
}

fn record_from_row(row: &sqlx::postgres::PgRow) -> Result<JobRecord, sqlx::Error> {
    let decode = |column: &str, reason: String| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: reason.into(),
    };

    let status: String = row.try_get("status")?;
    let status = JobStatus::parse(&status).ok_or_else(|| decode("status", format!("unknown status {status}")))?;
    let payload: serde_json::Value = row.try_get("payload")?;
    let envelope: JobEnvelope =
        serde_json::from_value(payload).map_err(|e| decode("payload", e.to_string()))?;
    let attempts: i32 = row.try_get("attempts")?;
    let max_attempts: i32 = row.try_get("max_attempts")?;

    Ok(JobRecord {
        id: JobId::from_uuid(row.try_get("id")?),
        job_type: row.try_get("job_type")?,
        queue_name: row.try_get("queue_name")?,
        status,
        attempts: attempts.max(0) as u32,
        max_attempts: max_attempts.max(0) as u32,
        idempotency_key: row.try_get("idempotency_key")?,
        trace_id: row.try_get("trace_id")?,
        tenant_id: row.try_get::<Option<i64>, _>("tenant_id")?.map(TenantId::new),
        actor_id: row.try_get::<Option<i64>, _>("actor_id")?.map(ActorId::new),
        entity: envelope.entity.clone(),
        payload: envelope,
        transport_job_id: row.try_get("transport_job_id")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get("updated_at")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        error_message: row.try_get("error_message")?,
    })
}

fn payload_json(record: &JobRecord) -> RepositoryResult<serde_json::Value> {
    serde_json::to_value(&record.payload).map_err(|e| RepositoryError::Storage(e.to_string()))
}

#[async_trait]
impl JobRepository for PgJobRepository {
    #[instrument(skip(self, record), fields(job_id = %record.id, job_type = %record.job_type), err)]
    async fn create(&self, record: &JobRecord) -> RepositoryResult<()> {
        sqlx::query(
            r#"
            INSERT INTO queue_jobs (
                id, job_type, queue_name, status, attempts, max_attempts,
                idempotency_key, trace_id, tenant_id, actor_id, payload,
                transport_job_id, created_at, updated_at, started_at, finished_at, error_message
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(&record.job_type)
        .bind(&record.queue_name)
        .bind(record.status.as_str())
        .bind(record.attempts as i32)
        .bind(record.max_attempts as i32)
        .bind(&record.idempotency_key)
        .bind(&record.trace_id)
        .bind(record.tenant_id.map(|t| t.get()))
        .bind(record.actor_id.map(|a| a.get()))
        .bind(payload_json(record)?)
        .bind(&record.transport_job_id)
        .bind(record.created_at)
        .bind(record.updated_at)
        .bind(record.started_at)
        .bind(record.finished_at)
        .bind(&record.error_message)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create", Some(record.id), e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn get(&self, job_id: JobId) -> RepositoryResult<Option<JobRecord>> {
        let row = sqlx::query("SELECT * FROM queue_jobs WHERE id = $1")
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", None, e))?;
        row.map(|r| record_from_row(&r))
            .transpose()
            .map_err(|e| map_sqlx_error("get", None, e))
    }

    #[instrument(skip(self, record), fields(job_id = %record.id, status = %record.status), err)]
    async fn update(&self, record: &JobRecord) -> RepositoryResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE queue_jobs SET
                status = $2, attempts = $3, transport_job_id = $4, updated_at = $5,
                started_at = $6, finished_at = $7, error_message = $8
            WHERE id = $1
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(record.status.as_str())
        .bind(record.attempts as i32)
        .bind(&record.transport_job_id)
        .bind(record.updated_at)
        .bind(record.started_at)
        .bind(record.finished_at)
        .bind(&record.error_message)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update", None, e))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(record.id));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PgAuditLog {
    pool: Arc<PgPool>,
}

impl PgAuditLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }

    pub async fn ensure_schema(&self) -> RepositoryResult<()> {
        sqlx::raw_sql(AUDIT_SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", None, e))?;
        Ok(())
    }
}

#[async_trait]
impl AuditLog for PgAuditLog {
    #[instrument(skip(self, entry), fields(action = %entry.action, resource = %entry.resource), err)]
    async fn append(&self, entry: AuditEntry) -> RepositoryResult<()> {
        sqlx::query(
            r#"
            INSERT INTO queue_audit_log (actor_id, action, resource, payload, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(entry.actor_id.map(|a| a.get()))
        .bind(&entry.action)
        .bind(&entry.resource)
        .bind(&entry.payload)
        .bind(entry.created_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("append", None, e))?;
        Ok(())
    }
}
