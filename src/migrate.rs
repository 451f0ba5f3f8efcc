use sqlx::SqlitePool;

use crate::error::Result;

/// Create the cache schema if it does not exist yet. Safe to run repeatedly.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cache_entries (
            key TEXT PRIMARY KEY,
            payload TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_cache_entries_created_at ON cache_entries(created_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
