//! Database connection management using sqlx

use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

pub type DbPool = PgPool;

/// Initialize the database connection pool and check it once with `SELECT 1`.
pub async fn init_pool(database_url: &str, acquire_timeout: Duration) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(acquire_timeout)
        .connect(database_url)
        .await?;

    // Test the connection
    sqlx::query("SELECT 1").execute(&pool).await?;

    Ok(pool)
}
