use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::context::ExecutionContext;

/// A named, registered unit of business logic. A task is a pure-ish function
/// from [`ExecutionContext`] to `ExecutionContext`: it may perform IO (via
/// whatever it closes over) but must tolerate being invoked more than once
/// for the same job, since the engine's delivery guarantee is at-least-once.
#[async_trait]
pub trait Task: Send + Sync {
    /// The name this task is registered under. Duplicate registrations for
    /// the same name are resolved first-registration-wins; an empty name is
    /// skipped entirely during registration.
    fn name(&self) -> &str;

    async fn execute(&self, context: ExecutionContext) -> anyhow::Result<ExecutionContext>;

    /// Ordered list of second-delays for backoff retries. An empty schedule
    /// (the default) means "not retryable": a task returning
    /// `should_retry = true` with no schedule is treated as if it had not
    /// asked for a retry at all.
    fn retry_schedule(&self) -> &[u64] {
        &[]
    }
}

/// Process-wide, read-only name → task map. Built once via
/// [`TaskRegistryBuilder`] before the [`Coordinator`](crate::Coordinator) is
/// allowed to begin polling; safe for concurrent lookup without external
/// synchronization afterward.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: DashMap<String, Arc<dyn Task>>,
}

impl TaskRegistry {
    /// O(1), never mutates.
    pub fn lookup(&self, name: &str) -> Option<Arc<dyn Task>> {
        self.tasks.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Length of that task's retry schedule, or 0 if the name is unknown or
    /// the task declares no schedule.
    pub fn retry_attempts_for(&self, name: &str) -> i32 {
        self.tasks
            .get(name)
            .map(|entry| entry.value().retry_schedule().len() as i32)
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Explicit builder for [`TaskRegistry`]: callers hand it a set of
/// `(name, task)` pairs rather than relying on runtime annotation scanning
/// or dependency-injection discovery.
#[derive(Default)]
pub struct TaskRegistryBuilder {
    tasks: DashMap<String, Arc<dyn Task>>,
}

impl TaskRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task. Tasks with an empty name are skipped. The first
    /// registration for a given name wins; later duplicates are ignored.
    pub fn register(self, task: Arc<dyn Task>) -> Self {
        if task.name().is_empty() {
            return self;
        }
        self.tasks.entry(task.name().to_string()).or_insert(task);
        self
    }

    pub fn build(self) -> TaskRegistry {
        TaskRegistry { tasks: self.tasks }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExecutionStatus;

    struct Stub {
        name: &'static str,
        schedule: Vec<u64>,
    }

    #[async_trait]
    impl Task for Stub {
        fn name(&self) -> &str {
            self.name
        }

        async fn execute(&self, context: ExecutionContext) -> anyhow::Result<ExecutionContext> {
            Ok(context.with_status(ExecutionStatus::Completed, false)?)
        }

        fn retry_schedule(&self) -> &[u64] {
            &self.schedule
        }
    }

    #[test]
    fn first_registration_wins() {
        let registry = TaskRegistryBuilder::new()
            .register(Arc::new(Stub {
                name: "dup",
                schedule: vec![1],
            }))
            .register(Arc::new(Stub {
                name: "dup",
                schedule: vec![1, 2, 3],
            }))
            .build();

        assert_eq!(registry.retry_attempts_for("dup"), 1);
    }

    #[test]
    fn empty_name_is_skipped() {
        let registry = TaskRegistryBuilder::new()
            .register(Arc::new(Stub {
                name: "",
                schedule: vec![],
            }))
            .build();

        assert!(registry.is_empty());
    }

    #[test]
    fn unknown_task_has_zero_retry_attempts() {
        let registry = TaskRegistryBuilder::new().build();
        assert_eq!(registry.retry_attempts_for("missing"), 0);
        assert!(registry.lookup("missing").is_none());
    }
}
