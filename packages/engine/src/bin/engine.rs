//! Standalone engine process: load config, connect, run until SIGTERM.
//!
//! The engine is usually embedded in a larger application; this binary is
//! the minimal host. Email delivery is disabled here because the SMTP
//! transport is an embedding-application concern; webhook deliveries work
//! out of the box.

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pagemail_engine::notify::DisabledMailTransport;
use pagemail_engine::{storage, Engine, EngineConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,pagemail_engine=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    let config = EngineConfig::from_env().context("configuration is invalid")?;

    let database_url =
        std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .context("failed to connect to database")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("failed to run migrations")?;

    let store = storage::from_config(&config.storage).context("failed to build blob store")?;

    let engine = Engine::new(config, pool, store, Arc::new(DisabledMailTransport))?;
    let handle = engine.start();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown signal received");

    handle.shutdown().await;
    Ok(())
}
