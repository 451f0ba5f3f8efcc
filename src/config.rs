use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::cache::CacheKeyMode;
use crate::chunk::{ChunkParams, CHARS_PER_TOKEN};
use crate::error::PipelineError;
use crate::models::TaskKind;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub input: InputConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub backends: BTreeMap<String, BackendConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct InputConfig {
    #[serde(default = "default_root")]
    pub root: PathBuf,
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            extensions: default_extensions(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
        }
    }
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_extensions() -> Vec<String> {
    [
        "py", "js", "ts", "jsx", "tsx", "java", "c", "cpp", "h", "hpp", "cs", "go", "rs", "php",
        "rb", "swift", "kt", "sh", "sql",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Unit in which `chunk_size` and `chunk_overlap` are expressed.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChunkUnit {
    #[default]
    Chars,
    /// Approximate tokens, converted at a fixed [`CHARS_PER_TOKEN`] rather
    /// than counted with a provider's tokenizer.
    Tokens,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default)]
    pub unit: ChunkUnit,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            unit: ChunkUnit::Chars,
        }
    }
}

fn default_chunk_size() -> usize {
    4000
}
fn default_chunk_overlap() -> usize {
    200
}

impl ChunkingConfig {
    /// Window parameters in characters.
    pub fn params(&self) -> std::result::Result<ChunkParams, PipelineError> {
        let factor = match self.unit {
            ChunkUnit::Chars => 1,
            ChunkUnit::Tokens => CHARS_PER_TOKEN,
        };
        ChunkParams::new(self.chunk_size * factor, self.chunk_overlap * factor)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Maximum number of backend calls in flight across the whole run.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Retries after the first attempt for transiently failing calls.
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_task_kinds")]
    pub enabled_task_kinds: Vec<TaskKind>,
    #[serde(default)]
    pub cache_key_mode: CacheKeyMode,
    /// Set from `--no-cache`; never read from the file.
    #[serde(skip)]
    pub cache_bypass: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            retry_count: default_retry_count(),
            backoff_base_ms: default_backoff_base_ms(),
            enabled_task_kinds: default_task_kinds(),
            cache_key_mode: CacheKeyMode::default(),
            cache_bypass: false,
        }
    }
}

fn default_max_concurrency() -> usize {
    4
}
fn default_retry_count() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    1000
}
fn default_task_kinds() -> Vec<TaskKind> {
    TaskKind::ALL.to_vec()
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_path")]
    pub path: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: default_cache_path(),
        }
    }
}

fn default_cache_path() -> PathBuf {
    PathBuf::from(".analysis_cache/cache.sqlite")
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    #[default]
    Json,
    Markdown,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,
    #[serde(default)]
    pub format: ReportFormat,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
            format: ReportFormat::Json,
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// Chat-completion model behind an HTTP API.
    Http,
    /// Local program that prints JSON findings.
    Command,
}

/// One named backend instance under `[backends.<id>]`.
#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    #[serde(rename = "type")]
    pub kind: BackendType,
    pub tasks: Vec<TaskKind>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_timeout_secs() -> u64 {
    120
}
fn default_temperature() -> f32 {
    0.1
}

impl Config {
    /// Check everything that must hold before any file is touched.
    pub fn validate(&self) -> Result<()> {
        self.chunking.params()?;

        if self.pipeline.max_concurrency == 0 {
            bail!("pipeline.max_concurrency must be >= 1");
        }
        if self.pipeline.enabled_task_kinds.is_empty() {
            bail!("pipeline.enabled_task_kinds must not be empty");
        }
        if self.input.extensions.is_empty() {
            bail!("input.extensions must list at least one extension");
        }

        for (id, backend) in &self.backends {
            if backend.tasks.is_empty() {
                bail!("backends.{}.tasks must not be empty", id);
            }
            match backend.kind {
                BackendType::Http => {
                    if backend.model.as_deref().map_or(true, str::is_empty) {
                        bail!("backends.{}.model must be specified for type 'http'", id);
                    }
                }
                BackendType::Command => {
                    if backend.command.is_empty() {
                        bail!("backends.{}.command must be specified for type 'command'", id);
                    }
                }
            }
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config: Config = toml::from_str("").unwrap();
        config.validate().unwrap();
        assert_eq!(config.chunking.chunk_size, 4000);
        assert_eq!(config.pipeline.enabled_task_kinds, TaskKind::ALL.to_vec());
        assert_eq!(config.pipeline.cache_key_mode, CacheKeyMode::Content);
    }

    #[test]
    fn overlap_not_below_size_is_configuration_error() {
        let config: Config = toml::from_str(
            r#"
            [chunking]
            chunk_size = 50
            chunk_overlap = 50
            "#,
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::Configuration(_))
        ));
    }

    #[test]
    fn token_unit_scales_params() {
        let chunking = ChunkingConfig {
            chunk_size: 100,
            chunk_overlap: 10,
            unit: ChunkUnit::Tokens,
        };
        let params = chunking.params().unwrap();
        assert_eq!(params.max_size(), 400);
        assert_eq!(params.overlap(), 40);
    }

    #[test]
    fn parses_named_backends() {
        let config: Config = toml::from_str(
            r#"
            [pipeline]
            enabled_task_kinds = ["analysis", "static"]
            cache_key_mode = "path"

            [backends.model]
            type = "http"
            tasks = ["analysis", "summary"]
            model = "gpt-4o-mini"

            [backends.lint]
            type = "command"
            tasks = ["static"]
            command = ["pylint", "--output-format=json"]
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.backends.len(), 2);
        assert_eq!(config.backends["lint"].kind, BackendType::Command);
        assert_eq!(config.pipeline.cache_key_mode, CacheKeyMode::Path);
    }

    #[test]
    fn http_backend_requires_model() {
        let config: Config = toml::from_str(
            r#"
            [backends.model]
            type = "http"
            tasks = ["analysis"]
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }
}
