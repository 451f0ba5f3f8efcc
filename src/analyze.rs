//! The `run` and `chunks` commands.
//!
//! `run` wires configuration, backends, the cache and the processor
//! together, writes one report per file, and prints the run totals.
//! `chunks` is a dry run that only shows where a file would be split.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backend::BackendRegistry;
use crate::cache::{Cache, SqliteStore};
use crate::chunk::chunk_text;
use crate::config::Config;
use crate::output;
use crate::pipeline::{Processor, ProcessorOptions, RunSummary};
use crate::progress::ProgressMode;
use crate::source::{discover, read_source, SourceEntry};

/// Analyze every discovered file under `config.input.root`.
///
/// Returns the run summary; deciding the exit status is left to the caller.
pub async fn run_analysis(
    config: &Config,
    progress: ProgressMode,
    cancel: CancellationToken,
) -> Result<RunSummary> {
    let options = ProcessorOptions::from_config(config)?;
    let registry = BackendRegistry::from_config(config)?;
    if registry.is_empty() {
        warn!("no backends configured; reports will be empty");
    }

    let entries = discover(&config.input)?;
    info!(
        root = %config.input.root.display(),
        files = entries.len(),
        "discovered source files"
    );

    let store = SqliteStore::open(&config.cache.path)
        .await
        .with_context(|| format!("Failed to open cache at {}", config.cache.path.display()))?;
    let cache = Arc::new(
        Cache::open(
            Box::new(store),
            config.pipeline.cache_key_mode,
            config.pipeline.cache_bypass,
        )
        .await?,
    );
    if cache.corrupt_count() > 0 {
        warn!(records = cache.corrupt_count(), "cache holds undecodable records");
    }

    let processor = Arc::new(
        Processor::new(options, registry, Arc::clone(&cache)).with_progress(progress.reporter()),
    );
    let summary = processor.run(entries, cancel).await;

    let mut written = 0u64;
    for outcome in &summary.outcomes {
        let Some(report) = &outcome.report else {
            continue;
        };
        match output::write_report(&config.output.dir, report, config.output.format) {
            Ok(_) => written += 1,
            Err(e) => warn!(path = %outcome.path, error = %e, "failed to write report"),
        }
    }

    cache.close().await;

    println!("run {}", config.input.root.display());
    println!("  files: {}", summary.outcomes.len());
    println!("  succeeded: {}", summary.succeeded());
    println!("  partial: {}", summary.partial());
    println!("  failed: {}", summary.failed());
    println!("  cached: {}", summary.cached());
    println!("  skipped: {}", summary.skipped());
    println!("  backend calls: {}", summary.backend_calls);
    println!("  reports written: {} -> {}", written, config.output.dir.display());
    println!("  elapsed: {:.1}s", summary.elapsed.as_secs_f64());
    for outcome in summary.outcomes.iter().filter(|o| o.error.is_some()) {
        println!(
            "  ! {}: {}",
            outcome.path,
            outcome.error.as_deref().unwrap_or_default()
        );
    }
    println!("ok");

    Ok(summary)
}

/// Print the chunk boundaries `file` would be split into.
pub fn run_chunks(config: &Config, file: &Path) -> Result<()> {
    let params = config.chunking.params()?;
    let entry = SourceEntry {
        path: file.to_path_buf(),
        rel_path: file.display().to_string(),
    };
    let source = read_source(&entry)?;
    let chunks = chunk_text(&source.rel_path, &source.content, params);

    println!("chunks {} (dry-run)", source.rel_path);
    println!("  language: {:?}", source.language);
    println!("  size: {} chars", source.size);
    println!(
        "  window: {} chars, overlap {}, step {}",
        params.max_size(),
        params.overlap(),
        params.step()
    );
    println!("  chunks: {}", chunks.len());
    for chunk in &chunks {
        println!(
            "    #{:<4} [{}..{})  {} chars, {} shared",
            chunk.index,
            chunk.start,
            chunk.end,
            chunk.len(),
            chunk.overlap
        );
    }
    Ok(())
}
