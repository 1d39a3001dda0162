use sqlx::{PgPool, postgres::PgPoolOptions};
use std::time::Duration;

/// Connects to `DATABASE_URL`, or returns `None` when it is not set.
pub async fn get_pg_pool() -> Option<PgPool> {
    let _ = env_logger::builder().is_test(true).try_init();
    let Ok(database_url) = std::env::var("DATABASE_URL") else {
        log::warn!("DATABASE_URL is not set, skipping postgres test");
        return None;
    };
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&database_url)
        .await
        .expect("Failed to create Postgres pool");
    Some(pool)
}

pub async fn teardown(pool: &PgPool) {
    sqlx::query("DROP TABLE IF EXISTS herald_dead_letters CASCADE")
        .execute(pool)
        .await
        .expect("Failed to drop dead letters table");
    sqlx::query("DROP TABLE IF EXISTS _herald_migrations CASCADE")
        .execute(pool)
        .await
        .expect("Failed to drop migrations table");
}
