use anyhow::{Context, Result};
use deadpool_postgres::{Config, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime};
use std::time::Duration;
use tokio_postgres::NoTls;

/// Schema for users and sessions. Every statement is idempotent.
const SCHEMA: &str = include_str!("../migrations/0001_auth.sql");

/// Builds the connection pool from `DATABASE_URL`.
///
/// The URL is parsed up front so a typo fails at startup rather than on the
/// first checkout.
pub fn create_pool(database_url: &str) -> Result<Pool> {
    let _: tokio_postgres::Config = database_url.parse().context("Invalid DATABASE_URL")?;

    let mut cfg = Config::new();
    cfg.url = Some(database_url.to_string());
    cfg.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    });

    cfg.pool = Some(PoolConfig {
        max_size: 32,
        timeouts: deadpool_postgres::Timeouts {
            wait: Some(Duration::from_secs(5)),
            create: Some(Duration::from_secs(2)),
            recycle: Some(Duration::from_secs(1)),
        },
        ..PoolConfig::default()
    });

    cfg.create_pool(Some(Runtime::Tokio1), NoTls)
        .context("Failed to create PostgreSQL pool")
}

/// Applies the schema on startup.
pub async fn run_migrations(pool: &Pool) -> Result<()> {
    let client = pool
        .get()
        .await
        .context("Failed to get a connection for migrations")?;
    client
        .batch_execute(SCHEMA)
        .await
        .context("Failed to apply schema")?;
    tracing::info!("✅ Database schema up to date");
    Ok(())
}
