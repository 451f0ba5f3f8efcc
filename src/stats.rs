//! Cache statistics and maintenance.
//!
//! Backs `code-analyzer init`, `code-analyzer cache stats` and
//! `code-analyzer cache clear`. All three work on the SQLite file directly
//! and never load cached reports into memory.

use anyhow::{Context, Result};

use crate::cache::{CacheStore, SqliteStore};
use crate::config::Config;

/// Create the cache database and its schema.
pub async fn run_init(config: &Config) -> Result<()> {
    let store = open(config).await?;
    store.close().await;
    println!("Cache initialized at {}.", config.cache.path.display());
    Ok(())
}

/// Print record counts, file size and write times for the cache.
pub async fn run_cache_stats(config: &Config) -> Result<()> {
    let store = open(config).await?;
    let stats = store.stats().await?;
    store.close().await;

    let size = std::fs::metadata(&config.cache.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Code Analyzer: Cache Stats");
    println!("==========================");
    println!();
    println!("  Cache:       {}", config.cache.path.display());
    println!("  Size:        {}", format_bytes(size));
    println!("  Key mode:    {:?}", config.pipeline.cache_key_mode);
    println!("  Records:     {}", stats.records);
    println!(
        "  Oldest:      {}",
        stats.oldest.map(format_ts_relative).unwrap_or_else(|| "-".to_string())
    );
    println!(
        "  Newest:      {}",
        stats.newest.map(format_ts_relative).unwrap_or_else(|| "-".to_string())
    );
    println!();
    Ok(())
}

/// Delete every cached record.
pub async fn run_cache_clear(config: &Config) -> Result<()> {
    let store = open(config).await?;
    let removed = store.clear().await?;
    store.close().await;
    println!("cache clear");
    println!("  removed: {} records", removed);
    println!("ok");
    Ok(())
}

async fn open(config: &Config) -> Result<SqliteStore> {
    SqliteStore::open(&config.cache.path)
        .await
        .with_context(|| format!("Failed to open cache at {}", config.cache.path.display()))
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
