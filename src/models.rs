//! Core data models used throughout the analyzer.
//!
//! These types describe the units of work (chunks), the task kinds dispatched
//! to backends, and the per-call outcomes ([`TaskResult`]) that the report
//! assembler merges.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Kind of analysis requested from a backend.
///
/// The declaration order is the dispatch order for a file: static findings
/// first, then per-chunk analysis, then the whole-file summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Static,
    Analysis,
    Summary,
}

impl TaskKind {
    pub const ALL: [TaskKind; 3] = [TaskKind::Static, TaskKind::Analysis, TaskKind::Summary];

    /// Whether the kind runs once per chunk or once per file.
    pub fn scope(self) -> Scope {
        match self {
            TaskKind::Analysis => Scope::PerChunk,
            TaskKind::Static | TaskKind::Summary => Scope::WholeFile,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Static => "static",
            TaskKind::Analysis => "analysis",
            TaskKind::Summary => "summary",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "static" => Ok(TaskKind::Static),
            "analysis" => Ok(TaskKind::Analysis),
            "summary" => Ok(TaskKind::Summary),
            other => Err(format!(
                "unknown task kind '{}'. Must be static, analysis, or summary.",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    PerChunk,
    WholeFile,
}

/// A bounded, possibly overlapping slice of a file's content.
///
/// Offsets are in characters, `start` inclusive and `end` exclusive.
/// `overlap` is the number of leading characters shared with the previous
/// chunk (zero for the first one).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub file: String,
    pub index: usize,
    pub start: usize,
    pub end: usize,
    pub overlap: usize,
    pub text: String,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn unit(&self) -> Unit {
        Unit::Chunk {
            index: self.index,
            start: self.start,
            end: self.end,
        }
    }
}

/// What a single task ran over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Unit {
    Chunk {
        index: usize,
        start: usize,
        end: usize,
    },
    WholeFile,
}

impl Unit {
    /// Sort key: whole-file units sort before chunk 0.
    pub fn order_key(&self) -> (u8, usize) {
        match self {
            Unit::WholeFile => (0, 0),
            Unit::Chunk { index, .. } => (1, *index),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Success,
    Failure,
    Skipped,
}

/// Outcome of one backend call for one unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub file: String,
    pub kind: TaskKind,
    pub unit: Unit,
    pub backend: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempts: u32,
}

impl TaskResult {
    pub fn success(
        file: &str,
        kind: TaskKind,
        unit: Unit,
        backend: &str,
        payload: Value,
        attempts: u32,
    ) -> Self {
        Self {
            file: file.to_string(),
            kind,
            unit,
            backend: backend.to_string(),
            status: TaskStatus::Success,
            payload: Some(payload),
            error: None,
            attempts,
        }
    }

    pub fn failure(
        file: &str,
        kind: TaskKind,
        unit: Unit,
        backend: &str,
        error: String,
        attempts: u32,
    ) -> Self {
        Self {
            file: file.to_string(),
            kind,
            unit,
            backend: backend.to_string(),
            status: TaskStatus::Failure,
            payload: None,
            error: Some(error),
            attempts,
        }
    }

    pub fn skipped(file: &str, kind: TaskKind, unit: Unit, backend: &str, reason: &str) -> Self {
        Self {
            file: file.to_string(),
            kind,
            unit,
            backend: backend.to_string(),
            status: TaskStatus::Skipped,
            payload: None,
            error: Some(reason.to_string()),
            attempts: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_kind_parse_roundtrip() {
        for kind in TaskKind::ALL {
            assert_eq!(kind.as_str().parse::<TaskKind>().unwrap(), kind);
        }
        assert!("lint".parse::<TaskKind>().is_err());
    }

    #[test]
    fn whole_file_sorts_before_chunks() {
        let chunk = Unit::Chunk {
            index: 0,
            start: 0,
            end: 10,
        };
        assert!(Unit::WholeFile.order_key() < chunk.order_key());
    }

    #[test]
    fn task_kinds_order_by_phase() {
        let mut kinds = vec![TaskKind::Summary, TaskKind::Static, TaskKind::Analysis];
        kinds.sort();
        assert_eq!(kinds, TaskKind::ALL.to_vec());
    }
}
