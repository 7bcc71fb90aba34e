//! CLI for reconciling entity embeddings and inspecting the job queue.
//!
//! Walks the `entities` table and enqueues an `embedding` job for every entity
//! whose stored embedding is missing or out of date. Running it repeatedly is
//! safe: entities with a job already pending or processing are skipped.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use engine_core::config::Config;
use engine_core::domains::embeddings::{
    EmbeddingReconciler, Entity, PostgresEmbeddingStore, ReconcileOutcome,
};
use engine_core::kernel::jobs::{JobEvents, JobQueue, JobStore, PostgresJobStore};
use sqlx::PgPool;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "reconcile_embeddings")]
#[command(about = "Enqueue embedding jobs for stale entities")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile every entity (or one entity type)
    Run {
        #[arg(long)]
        entity_type: Option<String>,
        /// Report staleness without enqueueing
        #[arg(long)]
        dry_run: bool,
    },

    /// Print job counts by type and status
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,engine_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    let pool = PgPool::connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;

    let store = Arc::new(PostgresJobStore::new(pool.clone()));

    match cli.command {
        Commands::Run {
            entity_type,
            dry_run,
        } => {
            let queue = JobQueue::new(store, JobEvents::new())
                .with_default_max_retries(config.default_max_retries);
            let reconciler =
                EmbeddingReconciler::new(queue, Arc::new(PostgresEmbeddingStore::new(pool.clone())));

            let entities = Entity::find_all(entity_type.as_deref(), &pool)
                .await
                .context("Failed to load entities")?;
            println!("Found {} entities", entities.len());

            let mut up_to_date = 0;
            let mut enqueued = 0;
            let mut already_queued = 0;

            for entity in &entities {
                if dry_run {
                    let staleness = reconciler
                        .check_staleness(&entity.id, &entity.entity_type, &entity.content)
                        .await?;
                    if staleness.is_stale() {
                        enqueued += 1;
                        println!("  stale: {}:{}", entity.entity_type, entity.id);
                    } else {
                        up_to_date += 1;
                    }
                    continue;
                }

                match reconciler
                    .reconcile(&entity.id, &entity.entity_type, &entity.content)
                    .await
                {
                    Ok(ReconcileOutcome::UpToDate) => up_to_date += 1,
                    Ok(ReconcileOutcome::Enqueued(job_id)) => {
                        enqueued += 1;
                        println!(
                            "  enqueued {}:{} (job {})",
                            entity.entity_type, entity.id, job_id
                        );
                    }
                    Ok(ReconcileOutcome::AlreadyQueued(_)) => already_queued += 1,
                    Err(e) => eprintln!(
                        "Failed to reconcile {}:{}: {:#}",
                        entity.entity_type, entity.id, e
                    ),
                }
            }

            println!("\nReconciliation complete{}", if dry_run { " (dry run)" } else { "" });
            println!("  Up to date: {}", up_to_date);
            println!("  {}: {}", if dry_run { "Stale" } else { "Enqueued" }, enqueued);
            println!("  Already queued: {}", already_queued);
        }
        Commands::Stats => {
            let stats = store.queue_stats().await?;
            if stats.is_empty() {
                println!("No jobs");
            }
            for stat in stats {
                println!("{:<24} {:<12} {}", stat.job_type, stat.status.as_str(), stat.count);
            }
        }
    }

    Ok(())
}
