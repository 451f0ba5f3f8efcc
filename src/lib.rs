//! # Code Analyzer
//!
//! Chunk source files, fan the chunks out to pluggable analysis backends,
//! merge the results into one report per file, and cache reports by content
//! fingerprint so unchanged files are never analyzed twice.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌─────────────┐   ┌───────────┐   ┌────────────┐
//! │ Discovery │──▶│ Fingerprint │──▶│   Cache   │──▶│  Reports   │
//! │ walk+read │   │   SHA-256   │   │  SQLite   │   │ JSON / MD  │
//! └───────────┘   └──────┬──────┘   └─────▲─────┘   └─────▲──────┘
//!                        │ miss           │ all ok        │
//!                        ▼                │               │
//!                 ┌─────────────┐   ┌─────┴─────┐         │
//!                 │   Chunker   │──▶│ Backends  │─────────┘
//!                 │ char window │   │ http/cmd  │  assemble
//!                 └─────────────┘   └───────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! code-analyzer init                           # create the cache database
//! code-analyzer run --input-dir ./src          # analyze a tree
//! code-analyzer run --no-cache                 # force re-analysis
//! code-analyzer chunks src/main.rs             # show chunk boundaries
//! code-analyzer cache stats
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Task kinds, chunks, units and task results |
//! | [`error`] | Error taxonomy |
//! | [`source`] | File discovery and reading |
//! | [`fingerprint`] | Content fingerprints for cache keys |
//! | [`chunk`] | Overlapping character-window chunking |
//! | [`backend`] | Analysis backend trait, registry and built-in backends |
//! | [`retry`] | Bounded retry with exponential backoff |
//! | [`cache`] | Fingerprint-keyed report cache |
//! | [`pipeline`] | Per-file processor and run driver |
//! | [`report`] | Deterministic report assembly |
//! | [`output`] | Report files on disk |
//! | [`progress`] | Run progress on stderr |
//! | [`analyze`] | `run` and `chunks` commands |
//! | [`stats`] | Cache initialization, statistics and clearing |
//! | [`migrate`] | Cache schema |

pub mod analyze;
pub mod backend;
pub mod cache;
pub mod chunk;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod migrate;
pub mod models;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod report;
pub mod retry;
pub mod source;
pub mod stats;
