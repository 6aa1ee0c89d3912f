//! API server entry point, grounded on the teacher's `server/main.rs`:
//! env-filtered tracing, `Config::from_env`, a pooled Postgres connection,
//! `sqlx::migrate!`, then `axum::serve`. The three background services
//! (scheduler wake-up is driven by the scheduler itself on demand, so only
//! the update processor and reaper run as standalone loops) are spawned
//! alongside the HTTP listener via `run_until_shutdown`.

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use harmony_orchestrator::http::{build_app, AppState};
use harmony_orchestrator::objectstore::FilesystemObjectStore;
use harmony_orchestrator::queue::memory::InMemoryQueue;
use harmony_orchestrator::queue::{WakeupMessage, WorkItemUpdateMessage};
use harmony_orchestrator::reaper::Reaper;
use harmony_orchestrator::scheduler::Scheduler;
use harmony_orchestrator::service::{run_until_shutdown, Service};
use harmony_orchestrator::store::postgres::PostgresStateStore;
use harmony_orchestrator::update_processor::UpdateProcessor;
use harmony_orchestrator::Config;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,harmony_orchestrator=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("starting harmony orchestrator");

    let config = Config::from_env().context("failed to load configuration")?;
    tracing::info!("configuration loaded");

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("failed to connect to database")?;
    tracing::info!("database connected");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("failed to run migrations")?;
    tracing::info!("migrations complete");

    let store = PostgresStateStore::new(pool.clone());
    let object_store = FilesystemObjectStore::new(config.artifact_bucket_root.clone());
    let update_queue: InMemoryQueue<WorkItemUpdateMessage> = InMemoryQueue::new();
    let wakeup_queue: InMemoryQueue<WakeupMessage> = InMemoryQueue::new();

    let scheduler = Arc::new(Scheduler::new(store.clone(), wakeup_queue.clone(), &config));
    let update_processor = UpdateProcessor::new(
        store.clone(),
        object_store.clone(),
        update_queue.clone(),
        wakeup_queue.clone(),
        config.clone(),
    );
    let reaper = Reaper::new(store.clone(), update_queue.clone(), &config);

    let state = AppState {
        store: Arc::new(store),
        object_store: Arc::new(object_store),
        update_queue: Arc::new(update_queue),
        scheduler,
        pool: Some(pool),
    };
    let app = build_app(state);

    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!(addr = %addr, "starting server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("failed to bind to address")?;

    let services: Vec<Box<dyn Service>> = vec![Box::new(update_processor), Box::new(reaper)];
    let background = tokio::spawn(run_until_shutdown(services));

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await
    .context("server error")?;

    background.abort();
    Ok(())
}
