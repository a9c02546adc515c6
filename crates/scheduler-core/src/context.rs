use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::job::Job;

/// The status a task reports back through its returned [`ExecutionContext`].
///
/// `Started` is only ever found on the context *handed to* a task; a task
/// that returns `Started` has violated the contract, which
/// [`Worker`](crate::Worker) surfaces as a fatal store error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Started,
    InProgress,
    Completed,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExecutionContextError {
    #[error(
        "should_retry requires assigned_task_name, assigned_task_start_time, and job_data \
         to all be present"
    )]
    RetryMissingFields,
    #[error("should_retry can only be set alongside execution_status = InProgress")]
    RetryRequiresInProgress,
}

/// The transient value passed to and returned from a [`Task`](crate::Task).
///
/// Immutable by construction: a task produces a new context from the one it
/// was given rather than mutating in place. The `should_retry ⇒ job_data,
/// assigned_task_name, assigned_task_start_time all present` invariant is
/// enforced at construction time, not left to the caller to remember.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    job_data: Value,
    assigned_task_name: String,
    assigned_task_start_time: DateTime<Utc>,
    execution_status: ExecutionStatus,
    should_retry: bool,
    priority: Option<i32>,
}

impl ExecutionContext {
    /// Build a context, validating the `should_retry` invariant.
    ///
    /// `job_data`, `assigned_task_name`, and `assigned_task_start_time` are
    /// always structurally present (they are not `Option` fields); the
    /// "non-absent" requirement from the source spec is instead expressed
    /// here as "must be set to something other than their defaults when
    /// `should_retry` is requested", which is the meaningful reading of that
    /// rule in a statically typed contract.
    pub fn new(
        job_data: Value,
        assigned_task_name: impl Into<String>,
        assigned_task_start_time: DateTime<Utc>,
        execution_status: ExecutionStatus,
        should_retry: bool,
        priority: Option<i32>,
    ) -> Result<Self, ExecutionContextError> {
        let assigned_task_name = assigned_task_name.into();

        if should_retry {
            if execution_status != ExecutionStatus::InProgress {
                return Err(ExecutionContextError::RetryRequiresInProgress);
            }
            if assigned_task_name.is_empty() || job_data.is_null() {
                return Err(ExecutionContextError::RetryMissingFields);
            }
        }

        Ok(Self {
            job_data,
            assigned_task_name,
            assigned_task_start_time,
            execution_status,
            should_retry,
            priority,
        })
    }

    /// The input context a [`Worker`](crate::Worker) hands to a task:
    /// `execution_status` is always `Started`, and the task-selection fields
    /// mirror the leased job row.
    pub fn from_job(job: &Job) -> Self {
        Self {
            job_data: job.job_data.clone(),
            assigned_task_name: job.assigned_task_name.clone(),
            assigned_task_start_time: job.assigned_task_start_time,
            execution_status: ExecutionStatus::Started,
            should_retry: false,
            priority: Some(job.priority),
        }
    }

    pub fn job_data(&self) -> &Value {
        &self.job_data
    }

    pub fn assigned_task_name(&self) -> &str {
        &self.assigned_task_name
    }

    pub fn assigned_task_start_time(&self) -> DateTime<Utc> {
        self.assigned_task_start_time
    }

    pub fn execution_status(&self) -> ExecutionStatus {
        self.execution_status
    }

    pub fn should_retry(&self) -> bool {
        self.should_retry
    }

    pub fn priority(&self) -> Option<i32> {
        self.priority
    }

    /// Construct-with-changes helper: the idiomatic "builder over an
    /// existing immutable value" a task uses to produce its next context
    /// from the one it was given.
    pub fn with_status(
        &self,
        execution_status: ExecutionStatus,
        should_retry: bool,
    ) -> Result<Self, ExecutionContextError> {
        Self::new(
            self.job_data.clone(),
            self.assigned_task_name.clone(),
            self.assigned_task_start_time,
            execution_status,
            should_retry,
            self.priority,
        )
    }

    pub fn with_job_data(&self, job_data: Value) -> Self {
        Self {
            job_data,
            ..self.clone()
        }
    }

    pub fn with_next_task(
        &self,
        assigned_task_name: impl Into<String>,
        assigned_task_start_time: DateTime<Utc>,
    ) -> Self {
        Self {
            assigned_task_name: assigned_task_name.into(),
            assigned_task_start_time,
            ..self.clone()
        }
    }
}
