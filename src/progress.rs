//! Run progress reporting.
//!
//! Reports how many files have been processed during `code-analyzer run`, so
//! users see how much is left on large trees. Progress goes to **stderr** so
//! stdout stays parseable for scripts.

use std::io::Write;

/// A single progress event for a run.
#[derive(Clone, Debug)]
pub enum RunProgressEvent {
    /// Discovery finished with `total` candidate files.
    Discovered { total: u64 },
    /// One more file reached a terminal state.
    FileDone {
        path: String,
        status: &'static str,
        n: u64,
        total: u64,
    },
}

/// Reports run progress. Implementations write to stderr (human or JSON).
pub trait RunProgressReporter: Send + Sync {
    fn report(&self, event: RunProgressEvent);
}

/// Human-friendly progress on stderr: "analyze  1,234 / 5,000 files  src/lib.rs (cached)".
pub struct StderrProgress;

impl RunProgressReporter for StderrProgress {
    fn report(&self, event: RunProgressEvent) {
        let line = match &event {
            RunProgressEvent::Discovered { total } => {
                format!("analyze  found {} files\n", format_number(*total))
            }
            RunProgressEvent::FileDone {
                path,
                status,
                n,
                total,
            } => format!(
                "analyze  {} / {} files  {} ({})\n",
                format_number(*n),
                format_number(*total),
                path,
                status
            ),
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl RunProgressReporter for JsonProgress {
    fn report(&self, event: RunProgressEvent) {
        let obj = match &event {
            RunProgressEvent::Discovered { total } => serde_json::json!({
                "event": "progress",
                "phase": "discovered",
                "total": total
            }),
            RunProgressEvent::FileDone {
                path,
                status,
                n,
                total,
            } => serde_json::json!({
                "event": "progress",
                "phase": "file_done",
                "path": path,
                "status": status,
                "n": n,
                "total": total
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl RunProgressReporter for NoProgress {
    fn report(&self, _event: RunProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn RunProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
