use std::sync::Arc;

use uuid::Uuid;

use crate::context::ExecutionContext;
use crate::job::{Job, JobError};
use crate::store::{JobStore, StoreError};
use crate::task::TaskRegistry;

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error(transparent)]
    Job(#[from] JobError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The single inbound operation collaborators outside this crate use to
/// create work: constructs a [`Job`] from an [`ExecutionContext`] plus the
/// registry's retry depth for the named task, and inserts it.
///
/// This is the one inbound operation outside callers use to create work; the
/// HTTP/CLI layer that actually calls it is out of scope for this crate.
pub struct JobSubmitter<S: JobStore + ?Sized> {
    store: Arc<S>,
    registry: Arc<TaskRegistry>,
}

impl<S: JobStore + ?Sized> JobSubmitter<S> {
    pub fn new(store: Arc<S>, registry: Arc<TaskRegistry>) -> Self {
        Self { store, registry }
    }

    /// Priority falls back to [`Job::DEFAULT_PRIORITY`] if the context does
    /// not specify one.
    pub async fn submit(&self, context: ExecutionContext) -> Result<Uuid, SubmitError> {
        let job_id = Uuid::new_v4();
        let retry_attempts_remaining = self.registry.retry_attempts_for(context.assigned_task_name());
        let priority = context.priority().unwrap_or(Job::DEFAULT_PRIORITY);

        let job = Job::new(
            job_id,
            context.assigned_task_name(),
            context.assigned_task_start_time(),
            context.job_data().clone(),
            retry_attempts_remaining,
            priority,
        )?;

        self.store.insert(job).await?;
        Ok(job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExecutionStatus;
    use crate::task::{Task, TaskRegistryBuilder};
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemStore {
        jobs: Mutex<HashMap<Uuid, Job>>,
    }

    #[async_trait]
    impl JobStore for MemStore {
        async fn lease_candidates(
            &self,
            _now: chrono::DateTime<Utc>,
            _limit: i64,
        ) -> Result<Vec<Job>, StoreError> {
            unimplemented!()
        }
        async fn assign(
            &self,
            _job_id: Uuid,
            _worker_id: Uuid,
            _now: chrono::DateTime<Utc>,
        ) -> Result<Job, StoreError> {
            unimplemented!()
        }
        async fn decrement_retries(&self, _job_id: Uuid) -> Result<(), StoreError> {
            unimplemented!()
        }
        async fn release(&self, _job_id: Uuid) -> Result<(), StoreError> {
            unimplemented!()
        }
        async fn insert(&self, job: Job) -> Result<(), StoreError> {
            self.jobs.lock().unwrap().insert(job.job_id, job);
            Ok(())
        }
        async fn begin(&self) -> Result<Box<dyn crate::store::JobTransaction>, StoreError> {
            unimplemented!()
        }
    }

    struct NamedTask {
        name: &'static str,
        schedule: Vec<u64>,
    }

    #[async_trait]
    impl Task for NamedTask {
        fn name(&self) -> &str {
            self.name
        }
        async fn execute(&self, ctx: ExecutionContext) -> anyhow::Result<ExecutionContext> {
            Ok(ctx.with_status(ExecutionStatus::Completed, false)?)
        }
        fn retry_schedule(&self) -> &[u64] {
            &self.schedule
        }
    }

    #[tokio::test]
    async fn submit_fills_in_retry_depth_and_default_priority() {
        let store = Arc::new(MemStore::default());
        let registry = Arc::new(
            TaskRegistryBuilder::new()
                .register(Arc::new(NamedTask {
                    name: "bake",
                    schedule: vec![10, 20, 30],
                }))
                .build(),
        );
        let submitter = JobSubmitter::new(store.clone(), registry);

        let ctx = ExecutionContext::new(
            json!({"recipe": "sourdough"}),
            "bake",
            Utc::now(),
            ExecutionStatus::Completed,
            false,
            None,
        )
        .unwrap();

        let job_id = submitter.submit(ctx).await.unwrap();
        let stored = store.jobs.lock().unwrap().get(&job_id).cloned().unwrap();
        assert_eq!(stored.retry_attempts_remaining, 3);
        assert_eq!(stored.priority, Job::DEFAULT_PRIORITY);
    }
}
