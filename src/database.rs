use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

static MIGRATOR: Migrator = sqlx::migrate!();

/// Only dead letters live in Postgres, so a small pool is plenty.
const MAX_CONNECTIONS: u32 = 4;

/// Connects the dead-letter store and brings its schema up to date.
pub async fn setup_database(database_url: &str) -> Result<PgPool> {
  let pool = PgPoolOptions::new()
    .max_connections(MAX_CONNECTIONS)
    .acquire_timeout(Duration::from_secs(5))
    .connect(database_url)
    .await
    .context("failed to connect to the dead-letter database")?;

  MIGRATOR.run(&pool).await.context("failed to run dead-letter migrations")?;
  info!(max_connections = MAX_CONNECTIONS, "dead-letter store ready");
  Ok(pool)
}
