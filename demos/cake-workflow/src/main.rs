//! Illustrative workflow: preheat an oven, bake a cake, then frost it. The
//! last step is deliberately flaky so the demo exercises backoff retry.
//!
//! Run against the bundled in-memory store:
//!
//! ```text
//! cargo run -p cake-workflow -- --jobs 5
//! ```
//!
//! Or against PostgreSQL (the `jobs` table is created if missing):
//!
//! ```text
//! DATABASE_URL=postgres://localhost/cake cargo run -p cake-workflow
//! ```

use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clap::Parser;
use scheduler_core::{
    Coordinator, CoordinatorConfig, ExecutionContext, ExecutionStatus, Job, JobStore, JobSubmitter,
    JobTransaction, StoreError, SystemClock, Task, TaskRegistryBuilder,
};
use scheduler_postgres::PgJobStore;
use scheduler_testing::InMemoryJobStore;
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(about = "Preheat oven, bake cake, frost cake: a demo scheduler workflow")]
struct Cli {
    /// Postgres connection string; falls back to $DATABASE_URL, then to the
    /// in-memory store if neither is set.
    #[arg(long)]
    database_url: Option<String>,

    /// Number of cakes to submit.
    #[arg(long, default_value_t = 3)]
    jobs: usize,

    /// How long to let the coordinator run before shutting down.
    #[arg(long, default_value_t = 20)]
    run_for_secs: u64,
}

struct PreheatOven;

#[async_trait]
impl Task for PreheatOven {
    fn name(&self) -> &str {
        "preheat_oven"
    }

    async fn execute(&self, context: ExecutionContext) -> Result<ExecutionContext> {
        let mut data = context.job_data().clone();
        tracing::info!(recipe = %data["recipe"], "oven preheated");
        data["oven_preheated"] = json!(true);

        Ok(context
            .with_job_data(data)
            .with_next_task("bake_cake", Utc::now())
            .with_status(ExecutionStatus::InProgress, false)?)
    }
}

struct BakeCake;

#[async_trait]
impl Task for BakeCake {
    fn name(&self) -> &str {
        "bake_cake"
    }

    async fn execute(&self, context: ExecutionContext) -> Result<ExecutionContext> {
        let mut data = context.job_data().clone();
        tracing::info!(recipe = %data["recipe"], "cake baked");
        data["cake_baked"] = json!(true);

        Ok(context
            .with_job_data(data)
            .with_next_task("frost_cake", Utc::now())
            .with_status(ExecutionStatus::InProgress, false)?)
    }
}

/// Fails about half the time to exercise the retry schedule.
struct FrostCake {
    schedule: Vec<u64>,
}

#[async_trait]
impl Task for FrostCake {
    fn name(&self) -> &str {
        "frost_cake"
    }

    async fn execute(&self, context: ExecutionContext) -> Result<ExecutionContext> {
        let mut data = context.job_data().clone();
        let recipe = data["recipe"].as_str().unwrap_or("cake").to_string();

        if fastrand::f64() < 0.5 {
            tracing::warn!(%recipe, "frosting slid off, retrying");
            return Ok(context.with_status(ExecutionStatus::InProgress, true)?);
        }

        tracing::info!(%recipe, "cake frosted");
        data["cake_frosted"] = json!(true);
        Ok(context.with_job_data(data).with_status(ExecutionStatus::Completed, false)?)
    }

    fn retry_schedule(&self) -> &[u64] {
        &self.schedule
    }
}

/// Dispatches to whichever backend the CLI selected, so `Coordinator` only
/// needs to be generic over one concrete type.
enum AnyStore {
    Memory(InMemoryJobStore),
    Postgres(PgJobStore),
}

#[async_trait]
impl JobStore for AnyStore {
    async fn lease_candidates(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Job>, StoreError> {
        match self {
            AnyStore::Memory(s) => s.lease_candidates(now, limit).await,
            AnyStore::Postgres(s) => s.lease_candidates(now, limit).await,
        }
    }

    async fn assign(&self, job_id: Uuid, worker_id: Uuid, now: DateTime<Utc>) -> Result<Job, StoreError> {
        match self {
            AnyStore::Memory(s) => s.assign(job_id, worker_id, now).await,
            AnyStore::Postgres(s) => s.assign(job_id, worker_id, now).await,
        }
    }

    async fn decrement_retries(&self, job_id: Uuid) -> Result<(), StoreError> {
        match self {
            AnyStore::Memory(s) => s.decrement_retries(job_id).await,
            AnyStore::Postgres(s) => s.decrement_retries(job_id).await,
        }
    }

    async fn release(&self, job_id: Uuid) -> Result<(), StoreError> {
        match self {
            AnyStore::Memory(s) => s.release(job_id).await,
            AnyStore::Postgres(s) => s.release(job_id).await,
        }
    }

    async fn insert(&self, job: Job) -> Result<(), StoreError> {
        match self {
            AnyStore::Memory(s) => s.insert(job).await,
            AnyStore::Postgres(s) => s.insert(job).await,
        }
    }

    async fn begin(&self) -> Result<Box<dyn JobTransaction>, StoreError> {
        match self {
            AnyStore::Memory(s) => s.begin().await,
            AnyStore::Postgres(s) => s.begin().await,
        }
    }
}

const POSTGRES_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    job_id UUID PRIMARY KEY,
    assigned_task_name TEXT NOT NULL,
    assigned_task_start_time TIMESTAMPTZ NOT NULL,
    job_data JSONB NOT NULL,
    retry_attempts_remaining INTEGER NOT NULL CHECK (retry_attempts_remaining >= 0),
    priority INTEGER NOT NULL DEFAULT 10 CHECK (priority BETWEEN 1 AND 10),
    worker_id UUID,
    worker_lock_time TIMESTAMPTZ
)
"#;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let database_url = cli.database_url.or_else(|| std::env::var("DATABASE_URL").ok());

    let store = match database_url {
        Some(url) => {
            let pool = PgPoolOptions::new().max_connections(5).connect(&url).await?;
            sqlx::query(POSTGRES_SCHEMA).execute(&pool).await?;
            tracing::info!("using PostgreSQL store");
            AnyStore::Postgres(PgJobStore::new(pool))
        }
        None => {
            tracing::info!("using in-memory store");
            AnyStore::Memory(InMemoryJobStore::new())
        }
    };
    let store = Arc::new(store);

    let registry = Arc::new(
        TaskRegistryBuilder::new()
            .register(Arc::new(PreheatOven))
            .register(Arc::new(BakeCake))
            .register(Arc::new(FrostCake {
                schedule: vec![2, 5, 10],
            }))
            .build(),
    );

    let submitter = JobSubmitter::new(store.clone(), registry.clone());
    let recipes = ["sourdough", "red velvet", "carrot", "lemon", "chocolate"];
    for i in 0..cli.jobs {
        let recipe = recipes[i % recipes.len()];
        let ctx = ExecutionContext::new(
            json!({"recipe": recipe}),
            "preheat_oven",
            Utc::now(),
            ExecutionStatus::Completed,
            false,
            None,
        )?;
        let job_id = submitter.submit(ctx).await?;
        tracing::info!(%job_id, %recipe, "submitted cake");
    }

    let clock = Arc::new(SystemClock);
    let coordinator = Coordinator::new(store, registry, clock, CoordinatorConfig::default());
    let handle = coordinator.spawn();

    tokio::time::sleep(StdDuration::from_secs(cli.run_for_secs)).await;
    tracing::info!("shutting down");
    handle.shutdown().await;

    Ok(())
}
