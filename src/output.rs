//! Write per-file reports to the output directory.
//!
//! Each report lands at `<dir>/<relative path>.<ext>`, mirroring the input
//! tree, as pretty JSON or as Markdown with one heading per section and one
//! sub-heading per chunk.

use anyhow::{Context, Result};
use serde_json::Value;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use crate::config::ReportFormat;
use crate::models::{TaskStatus, Unit};
use crate::report::Report;

impl ReportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ReportFormat::Json => "json",
            ReportFormat::Markdown => "md",
        }
    }
}

/// Path the report for `rel_path` is written to.
pub fn report_path(dir: &Path, rel_path: &str, format: ReportFormat) -> PathBuf {
    dir.join(format!("{}.{}", rel_path, format.extension()))
}

/// Render and write `report`, creating parent directories as needed.
pub fn write_report(dir: &Path, report: &Report, format: ReportFormat) -> Result<PathBuf> {
    let path = report_path(dir, &report.header.path, format);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let body = match format {
        ReportFormat::Json => serde_json::to_string_pretty(report)?,
        ReportFormat::Markdown => render_markdown(report),
    };
    std::fs::write(&path, body).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}

pub fn render_markdown(report: &Report) -> String {
    let header = &report.header;
    let mut out = String::new();
    let _ = writeln!(out, "# {}\n", header.path);
    let _ = writeln!(out, "- Language: {:?}", header.language);
    let _ = writeln!(out, "- Size: {} chars in {} chunks", header.size, header.chunk_count);
    let _ = writeln!(out, "- Status: {:?}", report.status);
    let _ = writeln!(out, "- Fingerprint: `{}`\n", header.fingerprint);

    if report.no_results {
        out.push_str("_No results._\n\n");
    }

    for section in &report.sections {
        let _ = writeln!(out, "## {}\n", title_case(section.kind.as_str()));
        for entry in &section.entries {
            match &entry.unit {
                Unit::WholeFile => {
                    let _ = writeln!(out, "### {}\n", entry.backend);
                }
                Unit::Chunk { index, start, end } => {
                    let _ = writeln!(
                        out,
                        "### Chunk {} [{}..{}) ({})\n",
                        index, start, end, entry.backend
                    );
                }
            }
            match (entry.status, &entry.payload) {
                (TaskStatus::Success, Some(payload)) => render_payload(&mut out, payload),
                _ => {
                    let _ = writeln!(
                        out,
                        "_{:?}: {}_\n",
                        entry.status,
                        entry.error.as_deref().unwrap_or("no payload")
                    );
                }
            }
        }
    }
    out
}

fn render_payload(out: &mut String, payload: &Value) {
    let text = serde_json::to_string_pretty(payload).unwrap_or_else(|_| payload.to_string());
    let _ = writeln!(out, "```json\n{}\n```\n", text);
}

fn title_case(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
