use std::sync::Arc;

use chrono::Duration;
use tracing::{debug, error, warn};

use crate::clock::Clock;
use crate::context::{ExecutionContext, ExecutionStatus};
use crate::job::Job;
use crate::store::{JobStore, StoreError};
use crate::task::{Task, TaskRegistry};

/// Runs exactly one leased job to its next persisted state.
///
/// A `Worker` is stateless across invocations: everything it needs comes in
/// through `run`'s `job` argument and the shared `store`/`registry`/`clock`.
pub struct Worker<S: JobStore + ?Sized> {
    store: Arc<S>,
    registry: Arc<TaskRegistry>,
    clock: Arc<dyn Clock>,
}

enum TransactionFailure {
    TaskRaised(anyhow::Error),
    Store(StoreError),
}

impl<S: JobStore + ?Sized> Worker<S> {
    pub fn new(store: Arc<S>, registry: Arc<TaskRegistry>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            registry,
            clock,
        }
    }

    /// Run one leased job. Never panics on task or store failure: every
    /// error path is absorbed here, so worker failures never propagate to
    /// the Coordinator.
    pub async fn run(&self, job: Job) {
        let task = match self.registry.lookup(&job.assigned_task_name) {
            Some(task) => task,
            None => {
                warn!(
                    job_id = %job.job_id,
                    task = %job.assigned_task_name,
                    "task not registered; releasing lease"
                );
                self.release_best_effort(&job).await;
                return;
            }
        };

        let now = self.clock.now();
        if job.assigned_task_start_time > now {
            debug!(
                job_id = %job.job_id,
                start_time = %job.assigned_task_start_time,
                "job leased prematurely; releasing lease"
            );
            self.release_best_effort(&job).await;
            return;
        }

        let input = ExecutionContext::from_job(&job);

        match self.run_in_transaction(&job, task.as_ref(), input).await {
            Ok(()) => {}
            Err(TransactionFailure::TaskRaised(err)) => {
                error!(job_id = %job.job_id, error = %err, "task raised; rolling back");
                self.release_best_effort(&job).await;
            }
            Err(TransactionFailure::Store(StoreError::TransientConflict(err))) => {
                warn!(job_id = %job.job_id, error = %err, "store conflict; rolling back");
                self.release_best_effort(&job).await;
            }
            Err(TransactionFailure::Store(err @ StoreError::Fatal(_))) => {
                error!(
                    job_id = %job.job_id,
                    error = %err,
                    "fatal store error; lease left in place for outside intervention"
                );
            }
            Err(TransactionFailure::Store(StoreError::NotFound(id))) => {
                error!(job_id = %id, "job vanished mid-transaction; nothing to release");
            }
        }
    }

    async fn run_in_transaction(
        &self,
        job: &Job,
        task: &dyn Task,
        input: ExecutionContext,
    ) -> Result<(), TransactionFailure> {
        let mut tx = self.store.begin().await.map_err(TransactionFailure::Store)?;

        let outcome = task.execute(input).await;
        let output = match outcome {
            Ok(ctx) => ctx,
            Err(err) => {
                let _ = tx.rollback().await;
                return Err(TransactionFailure::TaskRaised(err));
            }
        };

        let result = self.apply_outcome(job, task, &mut *tx, &output).await;
        if let Err(err) = result {
            let _ = tx.rollback().await;
            return Err(TransactionFailure::Store(err));
        }

        tx.commit().await.map_err(TransactionFailure::Store)?;
        Ok(())
    }

    async fn apply_outcome(
        &self,
        job: &Job,
        task: &dyn Task,
        tx: &mut dyn crate::store::JobTransaction,
        output: &ExecutionContext,
    ) -> Result<(), StoreError> {
        match output.execution_status() {
            ExecutionStatus::Completed => {
                tx.delete(job.job_id).await?;
            }
            ExecutionStatus::Started => {
                return Err(StoreError::Fatal(anyhow::anyhow!(
                    "task {} returned execution_status = Started, which is not a valid return value",
                    job.assigned_task_name
                )));
            }
            ExecutionStatus::InProgress => {
                if self.can_retry(job, task, output) {
                    let delays = task.retry_schedule();
                    let used = delays.len() - job.retry_attempts_remaining as usize;
                    let delay_secs = delays[used];
                    let next_start = self.clock.now() + Duration::seconds(delay_secs as i64);
                    let next_retry_attempts = job.retry_attempts_remaining - 1;

                    tx.schedule_retry(job.job_id, next_start, next_retry_attempts)
                        .await?;
                } else {
                    tx.update_job_data(job.job_id, output.job_data().clone())
                        .await?;

                    let next_retry_attempts = if output.assigned_task_name() == job.assigned_task_name
                    {
                        job.retry_attempts_remaining
                    } else {
                        self.registry.retry_attempts_for(output.assigned_task_name())
                    };

                    tx.advance(
                        job.job_id,
                        output.assigned_task_name(),
                        output.assigned_task_start_time(),
                        next_retry_attempts,
                    )
                    .await?;
                }
                tx.release(job.job_id).await?;
            }
        }
        Ok(())
    }

    /// All three must hold: the task asked to retry, the job still has
    /// retries left, and the task actually declares a non-empty schedule.
    fn can_retry(&self, job: &Job, task: &dyn Task, output: &ExecutionContext) -> bool {
        output.should_retry() && job.retry_attempts_remaining > 0 && !task.retry_schedule().is_empty()
    }

    async fn release_best_effort(&self, job: &Job) {
        if let Err(err) = self.store.release(job.job_id).await {
            warn!(job_id = %job.job_id, error = %err, "best-effort release failed; swallowing");
        }
    }
}
