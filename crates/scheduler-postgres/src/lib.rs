//! PostgreSQL implementation of the `scheduler-core` store contract.
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE jobs (
//!     job_id                      UUID PRIMARY KEY,
//!     assigned_task_name          TEXT NOT NULL,
//!     assigned_task_start_time    TIMESTAMPTZ NOT NULL,
//!     job_data                    JSONB NOT NULL,
//!     retry_attempts_remaining    INTEGER NOT NULL CHECK (retry_attempts_remaining >= 0),
//!     priority                    INTEGER NOT NULL DEFAULT 10 CHECK (priority BETWEEN 1 AND 10),
//!     worker_id                   UUID,
//!     worker_lock_time            TIMESTAMPTZ
//! );
//!
//! CREATE INDEX idx_jobs_candidates ON jobs (priority, assigned_task_start_time)
//!     WHERE worker_id IS NULL;
//! ```
//!
//! `worker_id` and `worker_lock_time` are always both null or both set; there
//! is no separate status column, completion is row deletion.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use scheduler_core::{Job, JobStore, JobTransaction, StoreError};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

/// Postgres error codes that mean "someone else is holding a conflicting
/// lock or this transaction lost a serialization race", not "something is
/// broken": `40001` serialization_failure, `40P01` deadlock_detected,
/// `55P03` lock_not_available.
const TRANSIENT_PG_CODES: &[&str] = &["40001", "40P01", "55P03"];

fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err
            .code()
            .is_some_and(|code| TRANSIENT_PG_CODES.contains(&code.as_ref())),
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => true,
        _ => false,
    }
}

/// Classifies a raw `sqlx` error into the store's failure taxonomy. Lock
/// contention, serialization failures, and connection-pool exhaustion are
/// [`StoreError::TransientConflict`] (the Worker rolls back and releases the
/// lease for a later attempt); everything else is [`StoreError::Fatal`].
fn store_error(err: sqlx::Error, context: &'static str) -> StoreError {
    let transient = is_transient(&err);
    let err = anyhow::Error::new(err).context(context);
    if transient {
        StoreError::TransientConflict(err)
    } else {
        StoreError::Fatal(err)
    }
}

fn row_to_job(row: PgRow) -> Job {
    Job {
        job_id: row.get("job_id"),
        assigned_task_name: row.get("assigned_task_name"),
        assigned_task_start_time: row.get("assigned_task_start_time"),
        job_data: row.get("job_data"),
        retry_attempts_remaining: row.get("retry_attempts_remaining"),
        priority: row.get("priority"),
        worker_id: row.get("worker_id"),
        worker_lock_time: row.get("worker_lock_time"),
    }
}

/// PostgreSQL-backed [`JobStore`].
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    /// Runs as its own transaction: the `FOR UPDATE SKIP LOCKED` select holds
    /// its write lock only until this transaction commits, immediately after
    /// the rows are fetched. The lock is what keeps a second, concurrent
    /// `lease_candidates` call from returning the same row; it is `assign`
    /// that actually claims one.
    async fn lease_candidates(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Job>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| store_error(e, "opening lease_candidates transaction"))?;

        let rows = sqlx::query(
            r#"
            SELECT job_id, assigned_task_name, assigned_task_start_time, job_data,
                   retry_attempts_remaining, priority, worker_id, worker_lock_time
            FROM jobs
            WHERE worker_id IS NULL AND assigned_task_start_time <= $1
            ORDER BY priority ASC, assigned_task_start_time ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| store_error(e, "selecting lease candidates"))?;

        tx.commit()
            .await
            .map_err(|e| store_error(e, "committing lease_candidates transaction"))?;

        Ok(rows.into_iter().map(row_to_job).collect())
    }

    /// The `worker_id IS NULL` guard is what makes this fail with
    /// [`StoreError::NotFound`] when another caller's `assign` already won the
    /// race for this row after both candidate queries selected it.
    async fn assign(&self, job_id: Uuid, worker_id: Uuid, now: DateTime<Utc>) -> Result<Job, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET worker_id = $2, worker_lock_time = $3
            WHERE job_id = $1 AND worker_id IS NULL
            RETURNING job_id, assigned_task_name, assigned_task_start_time, job_data,
                      retry_attempts_remaining, priority, worker_id, worker_lock_time
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| store_error(e, "assigning job"))?;

        row.map(row_to_job).ok_or(StoreError::NotFound(job_id))
    }

    async fn decrement_retries(&self, job_id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET retry_attempts_remaining = GREATEST(retry_attempts_remaining - 1, 0)
            WHERE job_id = $1
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(|e| store_error(e, "decrementing retries"))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(job_id));
        }
        Ok(())
    }

    async fn release(&self, job_id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET worker_id = NULL, worker_lock_time = NULL
            WHERE job_id = $1
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(|e| store_error(e, "releasing job"))?;

        Ok(())
    }

    async fn insert(&self, job: Job) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO jobs
                (job_id, assigned_task_name, assigned_task_start_time, job_data,
                 retry_attempts_remaining, priority, worker_id, worker_lock_time)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(job.job_id)
        .bind(&job.assigned_task_name)
        .bind(job.assigned_task_start_time)
        .bind(&job.job_data)
        .bind(job.retry_attempts_remaining)
        .bind(job.priority)
        .bind(job.worker_id)
        .bind(job.worker_lock_time)
        .execute(&self.pool)
        .await
        .map_err(|e| store_error(e, "inserting job"))?;

        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn JobTransaction>, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| store_error(e, "opening worker transaction"))?;
        Ok(Box::new(PgJobTransaction { tx: Some(tx) }))
    }
}

/// Wraps one `sqlx` transaction for the duration of a single [`Worker`](scheduler_core::Worker)
/// run. `tx` is `None` only after `commit`/`rollback` has consumed it.
struct PgJobTransaction {
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgJobTransaction {
    fn conn(&mut self) -> &mut Transaction<'static, Postgres> {
        self.tx.as_mut().expect("transaction used after commit or rollback")
    }
}

#[async_trait]
impl JobTransaction for PgJobTransaction {
    async fn update_job_data(&mut self, job_id: Uuid, new_job_data: serde_json::Value) -> Result<(), StoreError> {
        sqlx::query("UPDATE jobs SET job_data = $2 WHERE job_id = $1")
            .bind(job_id)
            .bind(new_job_data)
            .execute(self.conn())
            .await
            .map_err(|e| store_error(e, "updating job_data"))?;
        Ok(())
    }

    async fn advance(
        &mut self,
        job_id: Uuid,
        next_task_name: &str,
        next_start_time: DateTime<Utc>,
        retry_attempts_remaining: i32,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET assigned_task_name = $2,
                assigned_task_start_time = $3,
                retry_attempts_remaining = $4
            WHERE job_id = $1
            "#,
        )
        .bind(job_id)
        .bind(next_task_name)
        .bind(next_start_time)
        .bind(retry_attempts_remaining)
        .execute(self.conn())
        .await
        .map_err(|e| store_error(e, "advancing job"))?;
        Ok(())
    }

    async fn schedule_retry(
        &mut self,
        job_id: Uuid,
        next_start_time: DateTime<Utc>,
        retry_attempts_remaining: i32,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET assigned_task_start_time = $2, retry_attempts_remaining = $3
            WHERE job_id = $1
            "#,
        )
        .bind(job_id)
        .bind(next_start_time)
        .bind(retry_attempts_remaining)
        .execute(self.conn())
        .await
        .map_err(|e| store_error(e, "scheduling retry"))?;
        Ok(())
    }

    async fn release(&mut self, job_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("UPDATE jobs SET worker_id = NULL, worker_lock_time = NULL WHERE job_id = $1")
            .bind(job_id)
            .execute(self.conn())
            .await
            .map_err(|e| store_error(e, "releasing job in transaction"))?;
        Ok(())
    }

    async fn delete(&mut self, job_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM jobs WHERE job_id = $1")
            .bind(job_id)
            .execute(self.conn())
            .await
            .map_err(|e| store_error(e, "deleting job"))?;
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        let tx = self.tx.take().expect("transaction used after commit or rollback");
        tx.commit()
            .await
            .map_err(|e| store_error(e, "committing worker transaction"))?;
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<(), StoreError> {
        let tx = self.tx.take().expect("transaction used after commit or rollback");
        tx.rollback()
            .await
            .map_err(|e| store_error(e, "rolling back worker transaction"))?;
        Ok(())
    }
}

/// Maintenance operations. Neither is scheduled automatically; an operator
/// wires them into a cron job or a periodic task of their own choosing.
impl PgJobStore {
    /// Release leases held past `threshold` without a heartbeat mechanism to
    /// renew them. Exists because this store's `JobStore` contract has no
    /// lease-expiry concept of its own (unlike a fixed lease timeout); a
    /// caller who wants reaping decides the threshold and the cadence.
    pub async fn reap_stale_leases(&self, threshold: Duration) -> Result<u64, StoreError> {
        let cutoff = Utc::now() - threshold;
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET worker_id = NULL, worker_lock_time = NULL
            WHERE worker_id IS NOT NULL AND worker_lock_time < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(|e| store_error(e, "reaping stale leases"))?;

        Ok(result.rows_affected())
    }

    /// Read-only snapshot of queue health.
    pub async fn stats(&self) -> Result<QueueStats, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE worker_id IS NULL) AS ready,
                COUNT(*) FILTER (WHERE worker_id IS NOT NULL) AS leased,
                COUNT(*) AS total
            FROM jobs
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| store_error(e, "reading queue stats"))?;

        Ok(QueueStats {
            ready: row.get("ready"),
            leased: row.get("leased"),
            total: row.get("total"),
        })
    }
}

/// Job queue health snapshot returned by [`PgJobStore::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub ready: i64,
    pub leased: i64,
    pub total: i64,
}
