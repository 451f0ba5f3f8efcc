//! The per-file processor and run driver.
//!
//! Every file moves through the same states:
//!
//! ```text
//! Pending → Fingerprinting → CacheCheck ─hit──────────────────────────▶ Done
//!                                 │
//!                                miss → Chunking → Dispatching → Merging → CacheWrite → Done
//!                                                       │
//!                                                       └─ every task failed ─▶ Failed
//! ```
//!
//! # Dispatch phases
//!
//! 1. **static**: one whole-file call per static backend.
//! 2. **analysis**: one call per chunk per analysis backend, with the static
//!    findings attached as context.
//! 3. **summary**: one whole-file call per summary backend, with the
//!    successful chunk analyses attached in chunk order. Skipped when
//!    analysis ran and nothing succeeded.
//!
//! Calls within a phase run concurrently. A run-wide semaphore of
//! `max_concurrency` permits bounds the calls in flight across all files.
//!
//! # Caching
//!
//! A report is written to the cache only when every task succeeded. Partial,
//! failed and cancelled files are always re-analyzed on the next run.

use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::{AnalysisBackend, BackendRegistry, BackendRequest, FileMeta};
use crate::cache::{Cache, CacheKey};
use crate::chunk::{chunk_text, ChunkParams};
use crate::config::Config;
use crate::error::{PipelineError, Result};
use crate::fingerprint::{fingerprint, ConfigSnapshot};
use crate::models::{Chunk, TaskKind, TaskResult, TaskStatus, Unit};
use crate::progress::{NoProgress, RunProgressEvent, RunProgressReporter};
use crate::report::{assemble, Report, ReportHeader, ReportStatus};
use crate::retry::{call_with_retry, CallContext, CallOutcome, RetryPolicy};
use crate::source::{read_source, SourceEntry, SourceFile};

/// Processing state of one file, logged on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    Pending,
    Fingerprinting,
    CacheCheck,
    CacheHit,
    Chunking,
    Dispatching,
    Merging,
    CacheWrite,
    Done,
    Failed,
}

fn enter(path: &str, state: FileState) {
    debug!(path, ?state, "file state");
}

/// Terminal classification of a file in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    /// Every task succeeded, or there was nothing to analyze.
    Succeeded,
    /// Some tasks failed or were skipped.
    Partial,
    /// No task succeeded, or the file could not be read.
    Failed,
    /// Served from the cache without calling any backend.
    Cached,
    /// Not processed because the run was cancelled.
    Skipped,
}

impl FileStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FileStatus::Succeeded => "succeeded",
            FileStatus::Partial => "partial",
            FileStatus::Failed => "failed",
            FileStatus::Cached => "cached",
            FileStatus::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileOutcome {
    pub path: String,
    pub status: FileStatus,
    pub report: Option<Report>,
    pub cache_written: bool,
    /// Read failure, cache failure or worker crash, if any.
    pub error: Option<String>,
    pub elapsed: Duration,
}

impl FileOutcome {
    fn without_report(path: String, status: FileStatus, error: Option<String>) -> Self {
        Self {
            path,
            status,
            report: None,
            cache_written: false,
            error,
            elapsed: Duration::ZERO,
        }
    }
}

/// Aggregate result of [`Processor::run`].
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// One outcome per discovered file, sorted by path.
    pub outcomes: Vec<FileOutcome>,
    /// Backend invocations made, counting every retry.
    pub backend_calls: u64,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn count(&self, status: FileStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    pub fn succeeded(&self) -> usize {
        self.count(FileStatus::Succeeded)
    }

    pub fn partial(&self) -> usize {
        self.count(FileStatus::Partial)
    }

    pub fn failed(&self) -> usize {
        self.count(FileStatus::Failed)
    }

    pub fn cached(&self) -> usize {
        self.count(FileStatus::Cached)
    }

    pub fn skipped(&self) -> usize {
        self.count(FileStatus::Skipped)
    }

    /// True when at least one file failed and none produced results.
    pub fn all_failed(&self) -> bool {
        self.failed() > 0 && self.succeeded() + self.partial() + self.cached() == 0
    }
}

/// Pipeline settings resolved from [`Config`].
#[derive(Debug, Clone)]
pub struct ProcessorOptions {
    pub params: ChunkParams,
    pub task_kinds: BTreeSet<TaskKind>,
    pub retry: RetryPolicy,
    pub max_concurrency: usize,
}

impl ProcessorOptions {
    pub fn from_config(config: &Config) -> Result<Self> {
        let params = config.chunking.params()?;
        if config.pipeline.max_concurrency == 0 {
            return Err(PipelineError::configuration(
                "pipeline.max_concurrency must be >= 1",
            ));
        }
        Ok(Self {
            params,
            task_kinds: config.pipeline.enabled_task_kinds.iter().copied().collect(),
            retry: RetryPolicy::new(
                config.pipeline.retry_count,
                Duration::from_millis(config.pipeline.backoff_base_ms),
            ),
            max_concurrency: config.pipeline.max_concurrency,
        })
    }
}

/// Drives files through fingerprinting, caching, chunking and dispatch.
pub struct Processor {
    options: ProcessorOptions,
    registry: BackendRegistry,
    cache: Arc<Cache>,
    snapshot: ConfigSnapshot,
    signature: String,
    limiter: Arc<Semaphore>,
    calls: Arc<AtomicU64>,
    progress: Box<dyn RunProgressReporter>,
}

impl Processor {
    pub fn new(options: ProcessorOptions, registry: BackendRegistry, cache: Arc<Cache>) -> Self {
        let mut snapshot = ConfigSnapshot::new(options.params, options.task_kinds.iter().copied());
        for backend in registry.backends() {
            let kinds: Vec<TaskKind> = backend
                .task_kinds()
                .iter()
                .copied()
                .filter(|k| options.task_kinds.contains(k))
                .collect();
            if !kinds.is_empty() {
                snapshot = snapshot.with_backend(backend.id(), kinds, backend.revision());
            }
        }
        let signature = snapshot.task_signature();
        let limiter = Arc::new(Semaphore::new(options.max_concurrency));

        Self {
            options,
            registry,
            cache,
            snapshot,
            signature,
            limiter,
            calls: Arc::new(AtomicU64::new(0)),
            progress: Box::new(NoProgress),
        }
    }

    pub fn with_progress(mut self, progress: Box<dyn RunProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Label of the enabled task kinds and the backends serving them.
    pub fn task_signature(&self) -> &str {
        &self.signature
    }

    /// Backend invocations made so far.
    pub fn backend_calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    fn enabled(&self, kind: TaskKind) -> bool {
        self.options.task_kinds.contains(&kind)
    }

    fn backends_for(&self, kind: TaskKind) -> Vec<Arc<dyn AnalysisBackend>> {
        if self.enabled(kind) {
            self.registry.for_kind(kind)
        } else {
            Vec::new()
        }
    }

    /// Process every entry, at most `max_concurrency` files at a time.
    ///
    /// After `cancel` fires no new file is started; files not yet started are
    /// reported as skipped.
    pub async fn run(self: &Arc<Self>, entries: Vec<SourceEntry>, cancel: CancellationToken) -> RunSummary {
        let started = Instant::now();
        let total = entries.len() as u64;
        self.progress.report(RunProgressEvent::Discovered { total });
        info!(files = total, signature = %self.signature, "starting run");

        let mut outcomes = Vec::with_capacity(entries.len());
        let mut pending = entries.into_iter();
        let mut in_flight: JoinSet<FileOutcome> = JoinSet::new();
        let mut done = 0u64;

        loop {
            while in_flight.len() < self.options.max_concurrency && !cancel.is_cancelled() {
                let Some(entry) = pending.next() else { break };
                let this = Arc::clone(self);
                let cancel = cancel.clone();
                in_flight.spawn(async move {
                    let path = entry.rel_path.clone();
                    let worker = tokio::spawn(async move { this.process_entry(entry, &cancel).await });
                    match worker.await {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            error!(path = %path, error = %e, "file worker crashed");
                            FileOutcome::without_report(
                                path,
                                FileStatus::Failed,
                                Some(format!("worker crashed: {}", e)),
                            )
                        }
                    }
                });
            }

            match in_flight.join_next().await {
                Some(Ok(outcome)) => {
                    done += 1;
                    self.progress.report(RunProgressEvent::FileDone {
                        path: outcome.path.clone(),
                        status: outcome.status.as_str(),
                        n: done,
                        total,
                    });
                    outcomes.push(outcome);
                }
                Some(Err(e)) => error!(error = %e, "file task failed to join"),
                None => break,
            }
        }

        for entry in pending {
            outcomes.push(FileOutcome::without_report(
                entry.rel_path,
                FileStatus::Skipped,
                Some("run cancelled".to_string()),
            ));
        }
        outcomes.sort_by(|a, b| a.path.cmp(&b.path));

        RunSummary {
            outcomes,
            backend_calls: self.backend_calls(),
            elapsed: started.elapsed(),
        }
    }

    async fn process_entry(&self, entry: SourceEntry, cancel: &CancellationToken) -> FileOutcome {
        enter(&entry.rel_path, FileState::Pending);
        if cancel.is_cancelled() {
            return FileOutcome::without_report(
                entry.rel_path,
                FileStatus::Skipped,
                Some("run cancelled".to_string()),
            );
        }
        match read_source(&entry) {
            Ok(file) => self.process_file(&file, cancel).await,
            Err(e) => {
                warn!(path = %entry.rel_path, error = %e, "cannot read file");
                enter(&entry.rel_path, FileState::Failed);
                FileOutcome::without_report(entry.rel_path, FileStatus::Failed, Some(e.to_string()))
            }
        }
    }

    /// Produce the report for one file, from the cache or by dispatching.
    pub async fn process_file(&self, file: &SourceFile, cancel: &CancellationToken) -> FileOutcome {
        let started = Instant::now();
        let path = file.rel_path.as_str();

        enter(path, FileState::Fingerprinting);
        let fingerprint = fingerprint(file.content.as_bytes(), &self.snapshot);
        let key = CacheKey {
            path: path.to_string(),
            fingerprint: fingerprint.clone(),
            task_signature: self.signature.clone(),
        };

        enter(path, FileState::CacheCheck);
        let mut cache_error = None;
        match self.cache.get(&key) {
            Ok(Some(entry)) => {
                enter(path, FileState::CacheHit);
                let mut report = entry.report;
                report.header.path = path.to_string();
                report.header.language = file.language;
                info!(path, "cache hit");
                if let Err(e) = self.cache.adopt(&key).await {
                    warn!(path, error = %e, "cannot attach path to cached record");
                }
                enter(path, FileState::Done);
                return FileOutcome {
                    path: path.to_string(),
                    status: FileStatus::Cached,
                    report: Some(report),
                    cache_written: false,
                    error: None,
                    elapsed: started.elapsed(),
                };
            }
            Ok(None) => debug!(path, "cache miss"),
            Err(e) => {
                warn!(path, error = %e, "cache lookup failed, re-analyzing without caching");
                cache_error = Some(e.to_string());
            }
        }

        enter(path, FileState::Chunking);
        let chunks = chunk_text(path, &file.content, self.options.params);
        let header = ReportHeader {
            path: path.to_string(),
            language: file.language,
            fingerprint,
            size: file.size,
            chunk_count: chunks.len(),
        };

        let results = if chunks.is_empty() {
            debug!(path, "empty file, nothing to analyze");
            Vec::new()
        } else {
            enter(path, FileState::Dispatching);
            self.dispatch_phases(file, &chunks, cancel).await
        };

        enter(path, FileState::Merging);
        let report = assemble(header, results);
        let status = match report.status {
            ReportStatus::Complete | ReportStatus::Empty => FileStatus::Succeeded,
            ReportStatus::Partial => FileStatus::Partial,
            ReportStatus::Failed if nothing_dispatched(&report) => FileStatus::Skipped,
            ReportStatus::Failed => FileStatus::Failed,
        };

        let mut cache_written = false;
        if status == FileStatus::Succeeded && cache_error.is_none() {
            enter(path, FileState::CacheWrite);
            match self.cache.put(&key, report.clone()).await {
                Ok(()) => cache_written = true,
                Err(e) => {
                    warn!(path, error = %e, "cache write failed");
                    cache_error = Some(e.to_string());
                }
            }
        }

        enter(
            path,
            if status == FileStatus::Failed {
                FileState::Failed
            } else {
                FileState::Done
            },
        );
        info!(
            path,
            status = status.as_str(),
            chunks = report.header.chunk_count,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "file processed"
        );

        FileOutcome {
            path: path.to_string(),
            status,
            report: Some(report),
            cache_written,
            error: cache_error,
            elapsed: started.elapsed(),
        }
    }

    async fn dispatch_phases(
        &self,
        file: &SourceFile,
        chunks: &[Chunk],
        cancel: &CancellationToken,
    ) -> Vec<TaskResult> {
        let meta = FileMeta {
            path: file.rel_path.clone(),
            source_path: file.path.display().to_string(),
            language: file.language,
            size: file.size,
            chunk_count: chunks.len(),
        };
        let request = |kind: TaskKind, unit: Unit, text: &str, context: Option<Value>| BackendRequest {
            kind,
            unit,
            text: text.to_string(),
            file: meta.clone(),
            context,
        };

        let static_jobs = self
            .backends_for(TaskKind::Static)
            .into_iter()
            .map(|b| (b, request(TaskKind::Static, Unit::WholeFile, &file.content, None)))
            .collect();
        let static_results = self.dispatch(static_jobs, cancel).await;
        let static_context = static_findings(&static_results);

        let analysis_backends = self.backends_for(TaskKind::Analysis);
        let mut analysis_jobs = Vec::with_capacity(chunks.len() * analysis_backends.len());
        for chunk in chunks {
            for backend in &analysis_backends {
                analysis_jobs.push((
                    Arc::clone(backend),
                    request(TaskKind::Analysis, chunk.unit(), &chunk.text, static_context.clone()),
                ));
            }
        }
        let mut analysis_results = self.dispatch(analysis_jobs, cancel).await;
        analysis_results.sort_by(|a, b| {
            a.unit
                .order_key()
                .cmp(&b.unit.order_key())
                .then_with(|| a.backend.cmp(&b.backend))
        });

        let summary_backends = self.backends_for(TaskKind::Summary);
        let no_analysis = !analysis_backends.is_empty() && !analysis_results.iter().any(|r| r.is_success());
        let summary_results = if no_analysis {
            summary_backends
                .iter()
                .map(|b| {
                    TaskResult::skipped(
                        &file.rel_path,
                        TaskKind::Summary,
                        Unit::WholeFile,
                        b.id(),
                        "no chunk analysis succeeded",
                    )
                })
                .collect()
        } else {
            let context = summary_context(static_context.as_ref(), &analysis_results);
            let jobs = summary_backends
                .into_iter()
                .map(|b| {
                    (
                        b,
                        request(TaskKind::Summary, Unit::WholeFile, &file.content, Some(context.clone())),
                    )
                })
                .collect();
            self.dispatch(jobs, cancel).await
        };

        let mut results = static_results;
        results.extend(analysis_results);
        results.extend(summary_results);
        results
    }

    /// Run every job concurrently and collect one result per job.
    async fn dispatch(
        &self,
        jobs: Vec<(Arc<dyn AnalysisBackend>, BackendRequest)>,
        cancel: &CancellationToken,
    ) -> Vec<TaskResult> {
        let mut handles = Vec::with_capacity(jobs.len());
        for (backend, request) in jobs {
            let label = (
                request.file.path.clone(),
                backend.id().to_string(),
                request.kind,
                request.unit.clone(),
            );
            let limiter = Arc::clone(&self.limiter);
            let calls = Arc::clone(&self.calls);
            let cancel = cancel.clone();
            let policy = self.options.retry;
            let handle = tokio::spawn(async move {
                let ctx = CallContext {
                    policy,
                    limiter: &limiter,
                    cancel: &cancel,
                    calls: &calls,
                };
                let outcome = call_with_retry(backend.as_ref(), &request, &ctx).await;
                to_task_result(backend.id(), &request, outcome)
            });
            handles.push((label, handle));
        }

        let mut results = Vec::with_capacity(handles.len());
        for ((path, backend, kind, unit), handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => {
                    error!(path = %path, backend = %backend, kind = %kind, error = %e, "backend task crashed");
                    TaskResult::failure(
                        &path,
                        kind,
                        unit,
                        &backend,
                        format!("backend task crashed: {}", e),
                        0,
                    )
                }
            };
            results.push(result);
        }
        results
    }
}

/// True when every task was skipped, i.e. cancellation arrived before any
/// call went out.
fn nothing_dispatched(report: &Report) -> bool {
    report
        .sections
        .iter()
        .flat_map(|section| &section.entries)
        .all(|entry| entry.status == TaskStatus::Skipped)
}

fn to_task_result(backend: &str, request: &BackendRequest, outcome: CallOutcome) -> TaskResult {
    let path = request.file.path.as_str();
    let dispatched = outcome.was_dispatched();
    match outcome.result {
        Ok(payload) => TaskResult::success(
            path,
            request.kind,
            request.unit.clone(),
            backend,
            payload,
            outcome.attempts,
        ),
        Err(e) if !dispatched => {
            TaskResult::skipped(path, request.kind, request.unit.clone(), backend, &e.to_string())
        }
        Err(e) => {
            let error = e.into_pipeline(backend, outcome.attempts);
            warn!(path, backend, kind = %request.kind, error = %error, "task failed");
            TaskResult::failure(
                path,
                request.kind,
                request.unit.clone(),
                backend,
                error.to_string(),
                outcome.attempts,
            )
        }
    }
}

/// Successful static payloads keyed by backend id.
fn static_findings(results: &[TaskResult]) -> Option<Value> {
    let findings: Map<String, Value> = results
        .iter()
        .filter_map(|r| r.payload.as_ref().map(|p| (r.backend.clone(), p.clone())))
        .collect();
    if findings.is_empty() {
        None
    } else {
        Some(Value::Object(findings))
    }
}

/// Successful chunk analyses in chunk order, plus static findings if any.
fn summary_context(static_findings: Option<&Value>, analysis: &[TaskResult]) -> Value {
    let chunks: Vec<Value> = analysis
        .iter()
        .filter_map(|r| match (&r.unit, &r.payload) {
            (Unit::Chunk { index, start, end }, Some(payload)) => Some(json!({
                "index": index,
                "start": start,
                "end": end,
                "backend": r.backend,
                "analysis": payload,
            })),
            _ => None,
        })
        .collect();
    json!({
        "static": static_findings.cloned().unwrap_or(Value::Null),
        "chunks": chunks,
    })
}
