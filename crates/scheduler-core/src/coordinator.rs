use std::sync::Arc;
use std::time::Duration as StdDuration;

use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::job::Job;
use crate::store::JobStore;
use crate::task::TaskRegistry;
use crate::worker::Worker;

/// Poll cadence, batch size, pool sizing, queue capacity, thread-name
/// prefix, and shutdown behavior.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub poll_interval: StdDuration,
    pub batch_size: i64,
    /// Validated and logged at startup (`Coordinator::spawn` warns if this
    /// exceeds `max_pool_size`), but does not get separate elastic behavior
    /// the way a thread-pool executor's core/max split would; Tokio tasks
    /// are cheap enough that `max_pool_size` consumers are spawned eagerly.
    /// See `DESIGN.md` for the full rationale.
    pub core_pool_size: usize,
    pub max_pool_size: usize,
    pub queue_capacity: usize,
    pub thread_name_prefix: String,
    pub wait_for_tasks_on_shutdown: bool,
    pub await_termination: StdDuration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            poll_interval: StdDuration::from_secs(1),
            batch_size: 10,
            core_pool_size: 2,
            max_pool_size: 8,
            queue_capacity: 32,
            thread_name_prefix: "scheduler-worker".to_string(),
            wait_for_tasks_on_shutdown: true,
            await_termination: StdDuration::from_secs(30),
        }
    }
}

/// Turns calendar ticks into Worker invocations.
pub struct Coordinator<S: JobStore + 'static> {
    store: Arc<S>,
    registry: Arc<TaskRegistry>,
    clock: Arc<dyn Clock>,
    config: CoordinatorConfig,
}

/// Handle to a running Coordinator: lets the caller shut it down.
pub struct CoordinatorHandle {
    shutdown_tx: watch::Sender<bool>,
    tick_loop: JoinHandle<()>,
    consumers: Vec<JoinHandle<()>>,
    wait_for_tasks_on_shutdown: bool,
    await_termination: StdDuration,
}

impl CoordinatorHandle {
    /// Stop scheduling new ticks, then either wait up to the configured
    /// grace period for in-flight workers to finish (graceful) or abort
    /// them (non-graceful). Leased-but-unfinished jobs remain leased in the
    /// store either way.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);

        if self.wait_for_tasks_on_shutdown {
            let wait = async {
                let _ = self.tick_loop.await;
                for consumer in self.consumers {
                    let _ = consumer.await;
                }
            };
            if tokio::time::timeout(self.await_termination, wait)
                .await
                .is_err()
            {
                warn!("graceful shutdown timed out waiting for in-flight workers");
            }
        } else {
            self.tick_loop.abort();
            for consumer in self.consumers {
                consumer.abort();
            }
        }
    }
}

impl<S: JobStore + 'static> Coordinator<S> {
    pub fn new(
        store: Arc<S>,
        registry: Arc<TaskRegistry>,
        clock: Arc<dyn Clock>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            store,
            registry,
            clock,
            config,
        }
    }

    /// Start the polling loop and the bounded consumer pool. Ticks do not
    /// overlap: a long tick delays the next one (fixed-delay, not
    /// fixed-rate).
    pub fn spawn(self) -> CoordinatorHandle {
        if self.config.core_pool_size > self.config.max_pool_size {
            warn!(
                core_pool_size = self.config.core_pool_size,
                max_pool_size = self.config.max_pool_size,
                "core_pool_size exceeds max_pool_size; only max_pool_size consumers will run"
            );
        }
        info!(
            core_pool_size = self.config.core_pool_size,
            max_pool_size = self.config.max_pool_size,
            queue_capacity = self.config.queue_capacity,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "coordinator starting"
        );

        let (tx, rx) = mpsc::channel::<Job>(self.config.queue_capacity);
        let rx = Arc::new(AsyncMutex::new(rx));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let store = self.store.clone();
        let registry = self.registry.clone();
        let clock = self.clock.clone();

        let mut consumers = Vec::with_capacity(self.config.max_pool_size);
        for index in 0..self.config.max_pool_size {
            let rx = rx.clone();
            let worker = Worker::new(store.clone(), registry.clone(), clock.clone());
            let prefix = self.config.thread_name_prefix.clone();
            consumers.push(tokio::spawn(async move {
                loop {
                    let job = {
                        let mut guard = rx.lock().await;
                        guard.recv().await
                    };
                    match job {
                        Some(job) => worker.run(job).await,
                        None => break,
                    }
                }
                tracing::debug!(thread_name = %format!("{prefix}-{index}"), "consumer exiting");
            }));
        }

        let tick_loop = tokio::spawn(run_tick_loop(
            self.store,
            self.clock,
            self.config.clone(),
            tx,
            shutdown_rx,
        ));

        CoordinatorHandle {
            shutdown_tx,
            tick_loop,
            consumers,
            wait_for_tasks_on_shutdown: self.config.wait_for_tasks_on_shutdown,
            await_termination: self.config.await_termination,
        }
    }
}

async fn run_tick_loop<S: JobStore + 'static>(
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    config: CoordinatorConfig,
    tx: mpsc::Sender<Job>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        tick(&store, &clock, &config, &tx).await;

        tokio::select! {
            _ = tokio::time::sleep(config.poll_interval) => {}
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

async fn tick<S: JobStore + 'static>(
    store: &Arc<S>,
    clock: &Arc<dyn Clock>,
    config: &CoordinatorConfig,
    tx: &mpsc::Sender<Job>,
) {
    let now = clock.now();
    let candidates = match store.lease_candidates(now, config.batch_size).await {
        Ok(candidates) => candidates,
        Err(err) => {
            error!(error = %err, "candidate query failed; ending this tick early");
            return;
        }
    };

    info!(count = candidates.len(), "leased candidate batch");

    for job in candidates {
        let worker_id = Uuid::new_v4();
        match store.assign(job.job_id, worker_id, now).await {
            Ok(leased_job) => match tx.try_send(leased_job) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // Release the lease rather than leave it stuck, so the job
                    // is a candidate again on the next tick instead of sitting
                    // leased with no consumer ever coming to claim it.
                    warn!(
                        job_id = %job.job_id,
                        "worker pool saturated; releasing lease for a later tick"
                    );
                    if let Err(err) = store.release(job.job_id).await {
                        warn!(job_id = %job.job_id, error = %err, "release-on-saturation failed");
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    warn!(job_id = %job.job_id, "consumer pool is gone; releasing lease");
                    if let Err(err) = store.release(job.job_id).await {
                        warn!(job_id = %job.job_id, error = %err, "release-on-shutdown failed");
                    }
                }
            },
            Err(err) => {
                warn!(job_id = %job.job_id, error = %err, "assign failed; compensating");
                if let Err(err) = store.decrement_retries(job.job_id).await {
                    warn!(
                        job_id = %job.job_id,
                        error = %err,
                        "compensation (decrement-retries) also failed; swallowing"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{JobTransaction, StoreError};
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::Value;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    /// Records every `assign` call and lets a test force it to fail for one
    /// job id, so the decrement-retries compensation path can be observed
    /// directly instead of through timing-dependent end-to-end behavior.
    #[derive(Default)]
    struct RecordingStore {
        jobs: StdMutex<HashMap<Uuid, Job>>,
        fail_assign_for: StdMutex<Option<Uuid>>,
        decremented: StdMutex<Vec<Uuid>>,
    }

    #[async_trait]
    impl JobStore for RecordingStore {
        async fn lease_candidates(&self, now: chrono::DateTime<Utc>, limit: i64) -> Result<Vec<Job>, StoreError> {
            let mut candidates: Vec<Job> = self
                .jobs
                .lock()
                .unwrap()
                .values()
                .filter(|j| j.worker_id.is_none() && j.assigned_task_start_time <= now)
                .cloned()
                .collect();
            candidates.sort_by(|a, b| a.priority.cmp(&b.priority));
            candidates.truncate(limit.max(0) as usize);
            Ok(candidates)
        }

        async fn assign(&self, job_id: Uuid, worker_id: Uuid, now: chrono::DateTime<Utc>) -> Result<Job, StoreError> {
            if *self.fail_assign_for.lock().unwrap() == Some(job_id) {
                return Err(StoreError::NotFound(job_id));
            }
            let mut jobs = self.jobs.lock().unwrap();
            let job = jobs.get_mut(&job_id).ok_or(StoreError::NotFound(job_id))?;
            job.worker_id = Some(worker_id);
            job.worker_lock_time = Some(now);
            Ok(job.clone())
        }

        async fn decrement_retries(&self, job_id: Uuid) -> Result<(), StoreError> {
            self.decremented.lock().unwrap().push(job_id);
            let mut jobs = self.jobs.lock().unwrap();
            let job = jobs.get_mut(&job_id).ok_or(StoreError::NotFound(job_id))?;
            if job.retry_attempts_remaining > 0 {
                job.retry_attempts_remaining -= 1;
            }
            Ok(())
        }

        async fn release(&self, job_id: Uuid) -> Result<(), StoreError> {
            if let Some(job) = self.jobs.lock().unwrap().get_mut(&job_id) {
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
            unimplemented!("not exercised by these tests")
        }
    }

    fn new_job(priority: i32) -> Job {
        Job::new(
            Uuid::new_v4(),
            "t",
            Utc::now() - chrono::Duration::seconds(1),
            Value::Null,
            3,
            priority,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn tick_leases_and_assigns_candidates_in_priority_order() {
        let store = Arc::new(RecordingStore::default());
        let low = new_job(8);
        let high = new_job(1);
        store.insert(low.clone()).await.unwrap();
        store.insert(high.clone()).await.unwrap();

        let clock: Arc<dyn Clock> = Arc::new(crate::clock::SystemClock);
        let config = CoordinatorConfig::default();
        let (tx, mut rx) = mpsc::channel(8);

        tick(&store, &clock, &config, &tx).await;
        drop(tx);

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.job_id, high.job_id);
        assert_eq!(second.job_id, low.job_id);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn assign_failure_decrements_retries_as_compensation() {
        let store = Arc::new(RecordingStore::default());
        let job = new_job(5);
        store.insert(job.clone()).await.unwrap();
        *store.fail_assign_for.lock().unwrap() = Some(job.job_id);

        let clock: Arc<dyn Clock> = Arc::new(crate::clock::SystemClock);
        let config = CoordinatorConfig::default();
        let (tx, mut rx) = mpsc::channel(8);

        tick(&store, &clock, &config, &tx).await;

        assert_eq!(*store.decremented.lock().unwrap(), vec![job.job_id]);
        let stored = store.jobs.lock().unwrap().get(&job.job_id).cloned().unwrap();
        assert_eq!(stored.retry_attempts_remaining, 2);
        assert!(!stored.is_leased());
        drop(tx);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn pool_saturation_releases_the_lease_instead_of_leaving_it_stuck() {
        let store = Arc::new(RecordingStore::default());
        let job = new_job(5);
        store.insert(job.clone()).await.unwrap();

        let clock: Arc<dyn Clock> = Arc::new(crate::clock::SystemClock);
        let config = CoordinatorConfig::default();
        // Zero-capacity channel with no consumer: try_send always reports Full.
        let (tx, _rx) = mpsc::channel(1);
        let occupied = tx.try_send(new_job(1));
        assert!(occupied.is_ok());

        tick(&store, &clock, &config, &tx).await;

        let stored = store.jobs.lock().unwrap().get(&job.job_id).cloned().unwrap();
        assert!(!stored.is_leased());
    }
}
