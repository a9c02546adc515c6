use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// The sole persisted entity. Everything the scheduler needs to resume a
/// workflow after a crash lives on this row.
///
/// Completion is represented by deletion, not a status field: a `Job` value
/// that exists always has work left to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: Uuid,
    pub assigned_task_name: String,
    pub assigned_task_start_time: DateTime<Utc>,
    pub job_data: Value,
    pub retry_attempts_remaining: i32,
    pub priority: i32,
    pub worker_id: Option<Uuid>,
    pub worker_lock_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("priority {0} is outside the allowed range 1..=10")]
    PriorityOutOfRange(i32),
    #[error("assigned_task_name must be non-empty")]
    EmptyTaskName,
    #[error("retry_attempts_remaining must be >= 0, got {0}")]
    NegativeRetryAttempts(i32),
}

impl Job {
    pub const MIN_PRIORITY: i32 = 1;
    pub const MAX_PRIORITY: i32 = 10;
    pub const DEFAULT_PRIORITY: i32 = 10;

    /// Construct a new, unleased job. Enforces the invariants: priority in
    /// `[1, 10]`, a non-empty task name, and a non-negative retry counter.
    pub fn new(
        job_id: Uuid,
        assigned_task_name: impl Into<String>,
        assigned_task_start_time: DateTime<Utc>,
        job_data: Value,
        retry_attempts_remaining: i32,
        priority: i32,
    ) -> Result<Self, JobError> {
        let assigned_task_name = assigned_task_name.into();
        if assigned_task_name.is_empty() {
            return Err(JobError::EmptyTaskName);
        }
        if !(Self::MIN_PRIORITY..=Self::MAX_PRIORITY).contains(&priority) {
            return Err(JobError::PriorityOutOfRange(priority));
        }
        if retry_attempts_remaining < 0 {
            return Err(JobError::NegativeRetryAttempts(retry_attempts_remaining));
        }

        Ok(Self {
            job_id,
            assigned_task_name,
            assigned_task_start_time,
            job_data,
            retry_attempts_remaining,
            priority,
            worker_id: None,
            worker_lock_time: None,
        })
    }

    /// `true` when both lease fields are present, per the data-model
    /// invariant that `worker_id` and `worker_lock_time` are always set or
    /// absent together.
    pub fn is_leased(&self) -> bool {
        self.worker_id.is_some() && self.worker_lock_time.is_some()
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        !self.is_leased() && self.assigned_task_start_time <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn rejects_priority_out_of_range() {
        assert_eq!(
            Job::new(Uuid::new_v4(), "t", now(), Value::Null, 0, 0),
            Err(JobError::PriorityOutOfRange(0))
        );
        assert_eq!(
            Job::new(Uuid::new_v4(), "t", now(), Value::Null, 0, 11),
            Err(JobError::PriorityOutOfRange(11))
        );
    }

    #[test]
    fn rejects_empty_task_name() {
        assert_eq!(
            Job::new(Uuid::new_v4(), "", now(), Value::Null, 0, 5),
            Err(JobError::EmptyTaskName)
        );
    }

    #[test]
    fn rejects_negative_retry_attempts() {
        assert_eq!(
            Job::new(Uuid::new_v4(), "t", now(), Value::Null, -1, 5),
            Err(JobError::NegativeRetryAttempts(-1))
        );
    }

    #[test]
    fn fresh_job_is_unleased() {
        let job = Job::new(Uuid::new_v4(), "t", now(), Value::Null, 3, 5).unwrap();
        assert!(!job.is_leased());
    }

    #[test]
    fn is_ready_requires_start_time_in_past_and_no_lease() {
        let past = now() - chrono::Duration::seconds(1);
        let future = now() + chrono::Duration::seconds(60);

        let ready = Job::new(Uuid::new_v4(), "t", past, Value::Null, 0, 5).unwrap();
        assert!(ready.is_ready(Utc::now()));

        let not_yet = Job::new(Uuid::new_v4(), "t", future, Value::Null, 0, 5).unwrap();
        assert!(!not_yet.is_ready(Utc::now()));

        let mut leased = ready;
        leased.worker_id = Some(Uuid::new_v4());
        leased.worker_lock_time = Some(Utc::now());
        assert!(!leased.is_ready(Utc::now()));
    }
}
