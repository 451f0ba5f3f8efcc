//! Per-file report assembly.
//!
//! [`assemble`] is a pure function from a file's [`TaskResult`]s to its
//! [`Report`]. Results are grouped into one [`Section`] per task kind, in
//! dispatch order (static, analysis, summary). Inside a section, entries are
//! ordered by unit (whole-file first, then chunk index) and backend id, so
//! the report does not depend on the order calls completed in.
//!
//! Chunk-level entries keep their chunk index and character range, which
//! lets a consumer trace every finding back to the slice it came from.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::fingerprint::FingerprintId;
use crate::models::{Scope, TaskKind, TaskResult, TaskStatus, Unit};
use crate::source::Language;

/// Overall outcome recorded in a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    /// Every task succeeded.
    Complete,
    /// Some tasks succeeded, some failed or were skipped.
    Partial,
    /// Tasks ran but none succeeded.
    Failed,
    /// Nothing to analyze (empty file or no routed backends).
    Empty,
}

/// Identity of the file a report describes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportHeader {
    pub path: String,
    pub language: Language,
    pub fingerprint: FingerprintId,
    pub size: usize,
    pub chunk_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionEntry {
    pub unit: Unit,
    pub backend: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    pub kind: TaskKind,
    pub scope: Scope,
    pub entries: Vec<SectionEntry>,
}

impl Section {
    pub fn successes(&self) -> impl Iterator<Item = &SectionEntry> {
        self.entries
            .iter()
            .filter(|e| e.status == TaskStatus::Success)
    }
}

/// Merged, deterministic aggregate of all task results for one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    #[serde(flatten)]
    pub header: ReportHeader,
    pub status: ReportStatus,
    /// Set when no task succeeded, so consumers see an explicit marker
    /// instead of a missing report.
    pub no_results: bool,
    pub sections: Vec<Section>,
}

impl Report {
    pub fn section(&self, kind: TaskKind) -> Option<&Section> {
        self.sections.iter().find(|s| s.kind == kind)
    }

    /// Failed or skipped entries across all sections.
    pub fn failures(&self) -> impl Iterator<Item = (&Section, &SectionEntry)> {
        self.sections.iter().flat_map(|s| {
            s.entries
                .iter()
                .filter(|e| e.status != TaskStatus::Success)
                .map(move |e| (s, e))
        })
    }
}

/// Build the report for one file from its task results.
pub fn assemble(header: ReportHeader, mut results: Vec<TaskResult>) -> Report {
    results.sort_by(|a, b| {
        a.kind
            .cmp(&b.kind)
            .then_with(|| a.unit.order_key().cmp(&b.unit.order_key()))
            .then_with(|| a.backend.cmp(&b.backend))
    });

    let total = results.len();
    let succeeded = results.iter().filter(|r| r.is_success()).count();

    let mut sections: Vec<Section> = Vec::new();
    for result in results {
        let entry = SectionEntry {
            unit: result.unit,
            backend: result.backend,
            status: result.status,
            payload: result.payload,
            error: result.error,
        };
        match sections.last_mut() {
            Some(section) if section.kind == result.kind => section.entries.push(entry),
            _ => sections.push(Section {
                kind: result.kind,
                scope: result.kind.scope(),
                entries: vec![entry],
            }),
        }
    }

    let status = if total == 0 {
        ReportStatus::Empty
    } else if succeeded == 0 {
        ReportStatus::Failed
    } else if succeeded < total {
        ReportStatus::Partial
    } else {
        ReportStatus::Complete
    };

    Report {
        header,
        status,
        no_results: succeeded == 0,
        sections,
    }
}
