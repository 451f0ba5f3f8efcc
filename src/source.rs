//! Source file discovery and reading.
//!
//! Walks the configured input root, keeps files whose extension is on the
//! allow-list, and reads each one into an immutable [`SourceFile`]. Binary
//! files (a NUL byte in the first KiB) are rejected; content that is not
//! valid UTF-8 is decoded as Latin-1.

use anyhow::{bail, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::WalkDir;

use crate::config::InputConfig;
use crate::error::PipelineError;

const BINARY_PROBE_BYTES: usize = 1024;

/// Language tag inferred from the file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Rust,
    Python,
    JavaScript,
    TypeScript,
    Go,
    Java,
    C,
    Cpp,
    CSharp,
    Ruby,
    Php,
    Swift,
    Kotlin,
    Shell,
    Sql,
    Unknown,
}

impl Language {
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_lowercase().as_str() {
            "rs" => Language::Rust,
            "py" | "pyw" => Language::Python,
            "js" | "mjs" | "cjs" | "jsx" => Language::JavaScript,
            "ts" | "tsx" => Language::TypeScript,
            "go" => Language::Go,
            "java" => Language::Java,
            "c" | "h" => Language::C,
            "cpp" | "cc" | "cxx" | "hpp" | "hh" | "hxx" => Language::Cpp,
            "cs" => Language::CSharp,
            "rb" => Language::Ruby,
            "php" => Language::Php,
            "swift" => Language::Swift,
            "kt" | "kts" => Language::Kotlin,
            "sh" | "bash" | "zsh" => Language::Shell,
            "sql" => Language::Sql,
            _ => Language::Unknown,
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Self {
        path.as_ref()
            .extension()
            .and_then(|ext| ext.to_str())
            .map(Self::from_extension)
            .unwrap_or(Language::Unknown)
    }
}

/// A file's content as read for one pipeline run.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub path: PathBuf,
    /// Path relative to the input root, with `/` separators.
    pub rel_path: String,
    pub content: String,
    /// Length in characters.
    pub size: usize,
    pub language: Language,
}

impl SourceFile {
    pub fn new(path: PathBuf, rel_path: String, content: String) -> Self {
        let language = Language::from_path(&path);
        let size = content.chars().count();
        Self {
            path,
            rel_path,
            content,
            size,
            language,
        }
    }
}

/// A discovered file that has not been read yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEntry {
    pub path: PathBuf,
    pub rel_path: String,
}

/// List candidate files under `input.root`, sorted by relative path.
pub fn discover(input: &InputConfig) -> Result<Vec<SourceEntry>> {
    let root = &input.root;
    if !root.is_dir() {
        bail!("Input directory does not exist: {}", root.display());
    }

    let mut excludes = vec![
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
        "**/node_modules/**".to_string(),
    ];
    excludes.extend(input.exclude_globs.iter().cloned());
    let exclude_set = build_globset(&excludes)?;

    let allowed: Vec<String> = input
        .extensions
        .iter()
        .map(|e| e.trim_start_matches('.').to_lowercase())
        .collect();

    let mut entries = Vec::new();
    for entry in WalkDir::new(root).follow_links(input.follow_symlinks) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "skipping unreadable directory entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        if exclude_set.is_match(&rel_str) {
            continue;
        }

        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase)
            .unwrap_or_default();
        if !allowed.contains(&ext) {
            continue;
        }

        entries.push(SourceEntry {
            path: path.to_path_buf(),
            rel_path: rel_str,
        });
    }

    entries.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    Ok(entries)
}

/// Read one entry. Failures are [`PipelineError::Fingerprint`] so the
/// caller can mark just this file as failed.
pub fn read_source(entry: &SourceEntry) -> Result<SourceFile, PipelineError> {
    let bytes = std::fs::read(&entry.path)
        .map_err(|e| PipelineError::fingerprint(&entry.rel_path, e.to_string()))?;
    let content = decode(&bytes).map_err(|msg| PipelineError::fingerprint(&entry.rel_path, msg))?;
    Ok(SourceFile::new(
        entry.path.clone(),
        entry.rel_path.clone(),
        content,
    ))
}

fn decode(bytes: &[u8]) -> std::result::Result<String, String> {
    let probe = &bytes[..bytes.len().min(BINARY_PROBE_BYTES)];
    if probe.contains(&0) {
        return Err("binary content (NUL byte found)".to_string());
    }
    match std::str::from_utf8(bytes) {
        Ok(s) => Ok(s.to_string()),
        // Latin-1 maps every byte to the code point of the same value.
        Err(_) => Ok(bytes.iter().map(|&b| b as char).collect()),
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
