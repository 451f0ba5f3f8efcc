//! # Code Analyzer CLI (`code-analyzer`)
//!
//! ## Usage
//!
//! ```bash
//! code-analyzer --config ./config/analyzer.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `code-analyzer init` | Create the cache database and schema |
//! | `code-analyzer run` | Analyze every source file under the input root |
//! | `code-analyzer chunks <file>` | Show how a file would be chunked |
//! | `code-analyzer cache stats` | Show cache size and record counts |
//! | `code-analyzer cache clear` | Delete every cached report |
//!
//! Exits non-zero when the configuration is invalid or every file failed.

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use code_analyzer::config::{load_config, Config};
use code_analyzer::progress::ProgressMode;
use code_analyzer::{analyze, stats};

/// Code Analyzer: chunked, cached source analysis through pluggable backends.
#[derive(Parser)]
#[command(name = "code-analyzer", version)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// When the file does not exist, built-in defaults are used.
    #[arg(long, global = true, default_value = "./config/analyzer.toml")]
    config: PathBuf,

    /// Enable debug logging (overridden by `RUST_LOG`).
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the cache database and schema. Safe to run repeatedly.
    Init,

    /// Analyze every source file under the input root.
    Run {
        /// Ignore cached reports; fresh results still refresh the cache.
        #[arg(long)]
        no_cache: bool,

        /// Override `input.root`.
        #[arg(long)]
        input_dir: Option<PathBuf>,

        /// Override `output.dir`.
        #[arg(long)]
        output_dir: Option<PathBuf>,

        /// Override `pipeline.max_concurrency`.
        #[arg(long)]
        concurrency: Option<usize>,

        /// Progress output on stderr. Defaults to human when stderr is a TTY.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Show the chunk boundaries for a single file without analyzing it.
    Chunks {
        /// File to chunk.
        file: PathBuf,
    },

    /// Inspect or clear the result cache.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Show cache location, size and record counts.
    Stats,
    /// Delete every cached report.
    Clear,
}

fn init_tracing(debug: bool) {
    let default = if debug { "code_analyzer=debug,warn" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let mut cfg = if cli.config.exists() {
        load_config(&cli.config)?
    } else {
        info!(path = %cli.config.display(), "config file not found, using defaults");
        Config::default()
    };

    match cli.command {
        Commands::Init => {
            stats::run_init(&cfg).await?;
        }
        Commands::Run {
            no_cache,
            input_dir,
            output_dir,
            concurrency,
            progress,
        } => {
            cfg.pipeline.cache_bypass = no_cache;
            if let Some(dir) = input_dir {
                cfg.input.root = dir;
            }
            if let Some(dir) = output_dir {
                cfg.output.dir = dir;
            }
            if let Some(n) = concurrency {
                cfg.pipeline.max_concurrency = n;
            }
            cfg.validate()?;

            let cancel = CancellationToken::new();
            let watcher = {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        warn!("interrupted; letting in-flight calls finish, skipping the rest");
                        cancel.cancel();
                    }
                })
            };

            let progress = progress.unwrap_or_else(ProgressMode::default_for_tty);
            let summary = analyze::run_analysis(&cfg, progress, cancel).await;
            watcher.abort();

            let summary = summary?;
            if summary.all_failed() {
                bail!("all {} files failed", summary.failed());
            }
        }
        Commands::Chunks { file } => {
            analyze::run_chunks(&cfg, &file)?;
        }
        Commands::Cache { action } => match action {
            CacheAction::Stats => stats::run_cache_stats(&cfg).await?,
            CacheAction::Clear => stats::run_cache_clear(&cfg).await?,
        },
    }

    Ok(())
}
