use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::job::Job;

/// Failure taxonomy surfaced by a [`JobStore`]/[`JobTransaction`]
/// implementation. Callers treat `TransientConflict` as "skip this
/// iteration" and `Fatal` as "log and stop touching this row".
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job {0} not found")]
    NotFound(Uuid),
    #[error("transient conflict, retry later: {0}")]
    TransientConflict(#[source] anyhow::Error),
    #[error("fatal store error: {0}")]
    Fatal(#[source] anyhow::Error),
}

/// The capability set the core requires from a persistence backend. This is
/// a capability contract, not a schema: an implementation is free to shape
/// its table however it likes as long as these nine operations (split here
/// into [`JobStore`] and [`JobTransaction`]) are atomic.
///
/// Operations here each run in their own transaction unless stated
/// otherwise; operations on [`JobTransaction`] share one ambient transaction
/// opened via [`JobStore::begin`].
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Up to `limit` rows where `worker_id` is absent and
    /// `assigned_task_start_time <= now`, ordered by `priority` ascending
    /// then `assigned_task_start_time` ascending, returned under a
    /// pessimistic write lock that prevents another caller from leasing the
    /// same rows concurrently.
    async fn lease_candidates(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Job>, StoreError>;

    /// Set the lease fields. Fails with [`StoreError::NotFound`] if the row
    /// is absent *or* already leased by someone else; the latter is the
    /// expected compensation path when two candidate queries raced for the
    /// same row between their own transactions.
    async fn assign(&self, job_id: Uuid, worker_id: Uuid, now: DateTime<Utc>)
        -> Result<Job, StoreError>;

    /// If `retry_attempts_remaining > 0`, decrement by one; if it is already
    /// zero, a no-op. Fails with [`StoreError::NotFound`] if the row is
    /// absent, which is the race this exists to compensate for: the job
    /// completed and was deleted by a winning racer between the candidate
    /// query and a losing `assign`. Used as compensation when leasing/dispatch
    /// fails before a Worker takes over.
    async fn decrement_retries(&self, job_id: Uuid) -> Result<(), StoreError>;

    /// Clear both lease fields, standalone (its own transaction). Used for
    /// best-effort release on error paths that are not already inside a
    /// [`JobTransaction`].
    async fn release(&self, job_id: Uuid) -> Result<(), StoreError>;

    async fn insert(&self, job: Job) -> Result<(), StoreError>;

    /// Open the ambient transaction a [`Worker`](crate::Worker) uses to
    /// carry its own mutation alongside whatever the task itself does.
    async fn begin(&self) -> Result<Box<dyn JobTransaction>, StoreError>;
}

/// The mutation surface available inside one Worker transaction. See
/// [`JobStore`] for the distinction between this and the standalone
/// operations.
#[async_trait]
pub trait JobTransaction: Send {
    async fn update_job_data(&mut self, job_id: Uuid, new_job_data: Value) -> Result<(), StoreError>;

    /// Rewrite all three task-selection fields in one statement.
    async fn advance(
        &mut self,
        job_id: Uuid,
        next_task_name: &str,
        next_start_time: DateTime<Utc>,
        retry_attempts_remaining: i32,
    ) -> Result<(), StoreError>;

    /// Rewrite start time and retry counter without changing the task name.
    async fn schedule_retry(
        &mut self,
        job_id: Uuid,
        next_start_time: DateTime<Utc>,
        retry_attempts_remaining: i32,
    ) -> Result<(), StoreError>;

    async fn release(&mut self, job_id: Uuid) -> Result<(), StoreError>;

    async fn delete(&mut self, job_id: Uuid) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}
