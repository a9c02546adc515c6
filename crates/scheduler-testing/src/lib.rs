//! In-memory [`JobStore`] and a manually-advanced [`Clock`], so the rest of
//! the workspace (and downstream callers) can exercise the scheduler without
//! a database.
//!
//! `InMemoryJobStore` enforces the same candidate-ordering and lease-guard
//! semantics as `scheduler-postgres`'s `PgJobStore`, so tests against one
//! transfer to the other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scheduler_core::{Clock, Job, JobStore, JobTransaction, StoreError};
use serde_json::Value;
use uuid::Uuid;

/// A [`Clock`] an integration test advances by hand instead of waiting on
/// real time, for deterministic assertions about retry backoff.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, delta: chrono::Duration) {
        let mut now = self.now.lock().unwrap();
        *now += delta;
    }

    pub fn set(&self, value: DateTime<Utc>) {
        *self.now.lock().unwrap() = value;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// A `HashMap`-backed [`JobStore`]. Single-process only; `lease_candidates`
/// and `assign` still behave as two separate steps so that callers exercising
/// the assign-failure compensation path see the same behavior an adapter
/// backed by a real database would produce.
#[derive(Default, Clone)]
pub struct InMemoryJobStore {
    jobs: Arc<Mutex<HashMap<Uuid, Job>>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every job currently held, for test assertions.
    pub fn snapshot(&self) -> Vec<Job> {
        self.jobs.lock().unwrap().values().cloned().collect()
    }

    pub fn get(&self, job_id: Uuid) -> Option<Job> {
        self.jobs.lock().unwrap().get(&job_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.lock().unwrap().is_empty()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn lease_candidates(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.lock().unwrap();
        let mut candidates: Vec<Job> = jobs
            .values()
            .filter(|job| job.worker_id.is_none() && job.assigned_task_start_time <= now)
            .cloned()
            .collect();
        candidates.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.assigned_task_start_time.cmp(&b.assigned_task_start_time))
        });
        candidates.truncate(limit.max(0) as usize);
        Ok(candidates)
    }

    async fn assign(&self, job_id: Uuid, worker_id: Uuid, now: DateTime<Utc>) -> Result<Job, StoreError> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs.get_mut(&job_id).ok_or(StoreError::NotFound(job_id))?;
        if job.worker_id.is_some() {
            return Err(StoreError::NotFound(job_id));
        }
        job.worker_id = Some(worker_id);
        job.worker_lock_time = Some(now);
        Ok(job.clone())
    }

    async fn decrement_retries(&self, job_id: Uuid) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs.get_mut(&job_id).ok_or(StoreError::NotFound(job_id))?;
        if job.retry_attempts_remaining > 0 {
            job.retry_attempts_remaining -= 1;
        }
        Ok(())
    }

    async fn release(&self, job_id: Uuid) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(job) = jobs.get_mut(&job_id) {
            job.worker_id = None;
            job.worker_lock_time = None;
        }
        Ok(())
    }

    async fn insert(&self, job: Job) -> Result<(), StoreError> {
        self.jobs.lock().unwrap().insert(job.job_id, job);
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn JobTransaction>, StoreError> {
        Ok(Box::new(InMemoryTransaction {
            jobs: Arc::clone(&self.jobs),
        }))
    }
}

struct InMemoryTransaction {
    jobs: Arc<Mutex<HashMap<Uuid, Job>>>,
}

#[async_trait]
impl JobTransaction for InMemoryTransaction {
    async fn update_job_data(&mut self, job_id: Uuid, new_job_data: Value) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs.get_mut(&job_id).ok_or(StoreError::NotFound(job_id))?;
        job.job_data = new_job_data;
        Ok(())
    }

    async fn advance(
        &mut self,
        job_id: Uuid,
        next_task_name: &str,
        next_start_time: DateTime<Utc>,
        retry_attempts_remaining: i32,
    ) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs.get_mut(&job_id).ok_or(StoreError::NotFound(job_id))?;
        job.assigned_task_name = next_task_name.to_string();
        job.assigned_task_start_time = next_start_time;
        job.retry_attempts_remaining = retry_attempts_remaining;
        Ok(())
    }

    async fn schedule_retry(
        &mut self,
        job_id: Uuid,
        next_start_time: DateTime<Utc>,
        retry_attempts_remaining: i32,
    ) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs.get_mut(&job_id).ok_or(StoreError::NotFound(job_id))?;
        job.assigned_task_start_time = next_start_time;
        job.retry_attempts_remaining = retry_attempts_remaining;
        Ok(())
    }

    async fn release(&mut self, job_id: Uuid) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs.get_mut(&job_id).ok_or(StoreError::NotFound(job_id))?;
        job.worker_id = None;
        job.worker_lock_time = None;
        Ok(())
    }

    async fn delete(&mut self, job_id: Uuid) -> Result<(), StoreError> {
        self.jobs.lock().unwrap().remove(&job_id);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job(start: DateTime<Utc>, priority: i32) -> Job {
        Job::new(Uuid::new_v4(), "t", start, json!({}), 0, priority).unwrap()
    }

    #[tokio::test]
    async fn lease_candidates_orders_by_priority_then_start_time() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let low = job(now - chrono::Duration::seconds(1), 5);
        let high = job(now - chrono::Duration::seconds(1), 1);
        store.insert(low.clone()).await.unwrap();
        store.insert(high.clone()).await.unwrap();

        let candidates = store.lease_candidates(now, 10).await.unwrap();
        assert_eq!(candidates[0].job_id, high.job_id);
        assert_eq!(candidates[1].job_id, low.job_id);
    }

    #[tokio::test]
    async fn assign_fails_once_another_caller_already_leased_it() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let j = job(now - chrono::Duration::seconds(1), 5);
        store.insert(j.clone()).await.unwrap();

        store.assign(j.job_id, Uuid::new_v4(), now).await.unwrap();
        let err = store.assign(j.job_id, Uuid::new_v4(), now).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(id) if id == j.job_id));
    }

    #[tokio::test]
    async fn decrement_retries_fails_when_row_is_absent() {
        let store = InMemoryJobStore::new();
        let err = store.decrement_retries(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn manual_clock_advances_on_command() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        clock.advance(chrono::Duration::seconds(30));
        assert_eq!(clock.now(), start + chrono::Duration::seconds(30));
    }
}
