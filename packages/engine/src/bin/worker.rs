use std::sync::Arc;

use anyhow::{Context, Result};
use engine_core::config::Config;
use engine_core::common::utils::OpenAiEmbeddingService;
use engine_core::domains::embeddings::{register_embedding_handler, PostgresEmbeddingStore};
use engine_core::kernel::jobs::{
    JobDispatcher, JobEvents, JobRegistry, PostgresJobStore, Watchdog, WorkerPool,
};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,engine_core=debug,sqlx=warn".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_line_number(true),
        )
        .init();

    tracing::info!("Starting job worker");

    let config = Config::from_env()?;

    // Database setup
    let pool = PgPoolOptions::new()
        .max_connections(
            (config.worker_concurrency.saturating_mul(config.max_in_flight) as u32).saturating_add(3),
        )
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;

    let store = Arc::new(PostgresJobStore::with_retry_policy(
        pool.clone(),
        config.retry_policy(),
    ));
    let registry = Arc::new(JobRegistry::new());
    let events = JobEvents::new();

    match &config.openai_api_key {
        Some(api_key) => {
            let embedder = Arc::new(OpenAiEmbeddingService::with_model(
                api_key.clone(),
                config.embedding_model.clone(),
            ));
            let embeddings = Arc::new(PostgresEmbeddingStore::new(pool.clone()));
            register_embedding_handler(&registry, embedder, embeddings);
        }
        None => tracing::warn!("OPENAI_API_KEY not set; embedding jobs will not be handled here"),
    }

    tracing::info!(job_types = ?registry.registered_types(), "handlers registered");

    // Only claim what this process can run; other workers may serve other types
    let mut dispatcher_config = config.dispatcher_config();
    dispatcher_config.job_types = Some(registry.registered_types());

    let dispatcher =
        JobDispatcher::with_config(store.clone(), registry, events.clone(), dispatcher_config);
    let watchdog = Watchdog::new(store, events, config.watchdog_config());
    let workers = WorkerPool::spawn(dispatcher, watchdog, config.worker_concurrency);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received");

    workers.shutdown().await?;
    pool.close().await;

    Ok(())
}
