//! # scheduler-core
//!
//! A durable, priority-aware job scheduler. It polls a relational store for
//! ready work, leases jobs to worker tasks, runs a named unit of business
//! logic (a [`Task`]) inside a database transaction, and, based on the
//! task's declared outcome, either retires the job, advances it to the next
//! task in a multi-step workflow, or schedules a backoff retry.
//!
//! ## Architecture
//!
//! ```text
//! external caller ──submit()──► Store
//!                                  │
//!                                  ▼ lease_candidates()
//!                             Coordinator ──assign()──► Worker pool
//!                                                           │
//!                                                           ▼
//!                                                  Registry.lookup(name)
//!                                                           │
//!                                                           ▼
//!                                              Task.execute(context)
//!                                                           │
//!                                                           ▼
//!                                         delete / advance / schedule-retry
//! ```
//!
//! ## Key invariants
//!
//! 1. **Jobs are the sole persisted entity.** All scheduler state (which
//!    task runs next, when, and with how many retries left) lives in the
//!    `Job` row. Workers hold no state of their own.
//! 2. **One lease, one transaction.** Every state transition for a leased
//!    job happens inside exactly one transaction; the store's atomic
//!    operations are never interleaved across jobs.
//! 3. **At-least-once delivery.** A task may be invoked more than once for
//!    the same job (crash after side effect, before commit). Tasks own their
//!    own idempotency.
//! 4. **Workers are stateless.** Everything needed to run a job is reloaded
//!    from its row; no in-memory job state survives a restart.
//!
//! This crate is the execution engine only. The HTTP/CLI layer that creates
//! jobs, JSON transport of user payloads, configuration loading, and schema
//! migration tooling are deliberately out of scope; see `demos/` for an
//! illustrative caller.

mod clock;
mod context;
mod coordinator;
mod job;
mod store;
mod submit;
mod task;
mod worker;

pub use clock::{Clock, SystemClock};
pub use context::{ExecutionContext, ExecutionContextError, ExecutionStatus};
pub use coordinator::{Coordinator, CoordinatorConfig, CoordinatorHandle};
pub use job::{Job, JobError};
pub use store::{JobStore, JobTransaction, StoreError};
pub use submit::JobSubmitter;
pub use task::{Task, TaskRegistry, TaskRegistryBuilder};
pub use worker::Worker;

pub use async_trait::async_trait;
