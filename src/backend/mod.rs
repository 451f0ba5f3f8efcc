//! Analysis backend abstraction.
//!
//! Defines the [`AnalysisBackend`] capability and the [`BackendRegistry`]
//! that maps backend ids to implementations. The processor only ever talks to
//! the trait; which provider sits behind an id is decided once, when the
//! registry is built.
//!
//! Built-in implementations:
//! - **[`HttpModelBackend`]** calls an OpenAI-compatible chat-completions API.
//! - **[`CommandBackend`]** runs a local program and parses its JSON output.
//!
//! # Failure contract
//!
//! [`analyze`](AnalysisBackend::analyze) never panics for bad input. Every
//! failure comes back as a [`BackendError`]:
//! - [`BackendError::Transient`] (timeout, 429, 5xx, connection reset) is
//!   retried by the processor with backoff.
//! - [`BackendError::Permanent`] and [`BackendError::Unsupported`] are
//!   recorded as failed task results immediately.

mod command;
mod http;

pub use command::CommandBackend;
pub use http::HttpModelBackend;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

use crate::config::{BackendType, Config};
use crate::error::BackendError;
use crate::models::{TaskKind, Unit};
use crate::source::Language;

/// File metadata sent along with every request.
#[derive(Debug, Clone, Serialize)]
pub struct FileMeta {
    /// Path relative to the input root.
    pub path: String,
    /// Path as found on disk, for tools that read the file themselves.
    pub source_path: String,
    pub language: Language,
    pub size: usize,
    pub chunk_count: usize,
}

/// One unit of work for a backend.
#[derive(Debug, Clone)]
pub struct BackendRequest {
    pub kind: TaskKind,
    pub unit: Unit,
    /// Chunk text for per-chunk tasks, full content for whole-file tasks.
    pub text: String,
    pub file: FileMeta,
    /// Results of earlier phases: static findings for analysis, ordered chunk
    /// analyses for summary.
    pub context: Option<Value>,
}

/// A pluggable analyzer.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use code_analyzer::backend::{AnalysisBackend, BackendRequest};
/// use code_analyzer::error::BackendError;
/// use code_analyzer::models::TaskKind;
/// use serde_json::{json, Value};
///
/// struct LineCounter;
///
/// #[async_trait]
/// impl AnalysisBackend for LineCounter {
///     fn id(&self) -> &str { "lines" }
///     fn task_kinds(&self) -> &[TaskKind] { &[TaskKind::Static] }
///
///     async fn analyze(&self, request: &BackendRequest) -> Result<Value, BackendError> {
///         Ok(json!({ "lines": request.text.lines().count() }))
///     }
/// }
/// ```
#[async_trait]
pub trait AnalysisBackend: Send + Sync {
    /// Registry id, also used to label results in reports.
    fn id(&self) -> &str;

    /// Task kinds this backend is routed for.
    fn task_kinds(&self) -> &[TaskKind];

    fn supports(&self, kind: TaskKind) -> bool {
        self.task_kinds().contains(&kind)
    }

    /// Anything that changes this backend's output for identical input
    /// (model name, tool version). Part of the cache fingerprint.
    fn revision(&self) -> &str {
        ""
    }

    async fn analyze(&self, request: &BackendRequest) -> std::result::Result<Value, BackendError>;
}

/// Registry mapping backend ids to implementations.
///
/// # Example
///
/// ```rust
/// use code_analyzer::backend::BackendRegistry;
///
/// let mut backends = BackendRegistry::new();
/// // backends.register(Arc::new(MyBackend::new()));
/// assert!(backends.is_empty());
/// ```
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: Vec<Arc<dyn AnalysisBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            backends: Vec::new(),
        }
    }

    /// Build every backend declared under `[backends.<id>]`.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut registry = Self::new();
        for (id, cfg) in &config.backends {
            let backend: Arc<dyn AnalysisBackend> = match cfg.kind {
                BackendType::Http => Arc::new(HttpModelBackend::new(id, cfg)?),
                BackendType::Command => Arc::new(CommandBackend::new(id, cfg)?),
            };
            registry.register(backend);
        }
        Ok(registry)
    }

    /// Register a backend. A later registration with the same id replaces
    /// the earlier one.
    pub fn register(&mut self, backend: Arc<dyn AnalysisBackend>) {
        self.backends.retain(|b| b.id() != backend.id());
        self.backends.push(backend);
        self.backends.sort_by(|a, b| a.id().cmp(b.id()));
    }

    pub fn find(&self, id: &str) -> Option<Arc<dyn AnalysisBackend>> {
        self.backends.iter().find(|b| b.id() == id).cloned()
    }

    /// Backends routed for `kind`, ordered by id.
    pub fn for_kind(&self, kind: TaskKind) -> Vec<Arc<dyn AnalysisBackend>> {
        self.backends
            .iter()
            .filter(|b| b.supports(kind))
            .cloned()
            .collect()
    }

    pub fn backends(&self) -> &[Arc<dyn AnalysisBackend>] {
        &self.backends
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }
}
