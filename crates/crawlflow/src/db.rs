use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;

use crate::config::Config;

pub async fn make_pool(cfg: &Config) -> anyhow::Result<PgPool> {
    connect(
        &cfg.database_url,
        cfg.db_max_connections,
        Duration::from_secs(cfg.db_acquire_timeout_secs),
    )
    .await
}

pub async fn connect(
    database_url: &str,
    max_connections: u32,
    acquire_timeout: Duration,
) -> anyhow::Result<PgPool> {
    let opts = PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(acquire_timeout)
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                // partition DDL and bulk upserts gain nothing from JIT
                sqlx::query("SET jit = OFF").execute(&mut *conn).await?;
                sqlx::query("SET TIME ZONE 'UTC'").execute(&mut *conn).await?;
                Ok(())
            })
        });

    let pool = opts.connect(database_url).await?;

    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
