//! Local-tool backend.
//!
//! Runs the configured program once per call with the source path appended
//! as the last argument and the unit's text on stdin. Whatever JSON the
//! program prints on stdout becomes the payload. Linters commonly exit
//! non-zero when they report findings, so the exit status only matters when
//! stdout is not JSON.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{AnalysisBackend, BackendRequest};
use crate::config::BackendConfig;
use crate::error::BackendError;
use crate::models::{TaskKind, Unit};

pub struct CommandBackend {
    id: String,
    tasks: Vec<TaskKind>,
    program: String,
    args: Vec<String>,
    revision: String,
    timeout: Duration,
}

impl CommandBackend {
    pub fn new(id: &str, config: &BackendConfig) -> Result<Self> {
        let Some((program, args)) = config.command.split_first() else {
            bail!("backends.{}.command must not be empty", id);
        };
        Ok(Self {
            id: id.to_string(),
            tasks: config.tasks.clone(),
            program: program.clone(),
            args: args.to_vec(),
            revision: config.command.join(" "),
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }
}

#[async_trait]
impl AnalysisBackend for CommandBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn task_kinds(&self) -> &[TaskKind] {
        &self.tasks
    }

    fn revision(&self) -> &str {
        &self.revision
    }

    async fn analyze(&self, request: &BackendRequest) -> std::result::Result<Value, BackendError> {
        if !self.supports(request.kind) {
            return Err(BackendError::Unsupported(request.kind.to_string()));
        }

        let unit = match &request.unit {
            Unit::Chunk { index, .. } => index.to_string(),
            Unit::WholeFile => "file".to_string(),
        };

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(&request.file.source_path)
            .env("CODE_ANALYZER_TASK", request.kind.as_str())
            .env("CODE_ANALYZER_UNIT", unit)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BackendError::permanent(format!("cannot run {}: {}", self.program, e)))?;

        // Feed stdin while stdout drains; a tool that never reads stdin must
        // not stall the call past its timeout.
        let stdin = child.stdin.take();
        let text = request.text.as_bytes();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                // A tool that ignores stdin may close it early; that is not an error.
                let _ = stdin.write_all(text).await;
            }
        };
        let run = async move {
            let ((), output) = tokio::join!(feed, child.wait_with_output());
            output
        };

        let output = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| {
                BackendError::transient(format!(
                    "{} timed out after {}s",
                    self.program,
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|e| BackendError::transient(format!("{} failed: {}", self.program, e)))?;

        parse_output(&output.stdout, output.status.success(), &output.stderr)
    }
}

fn parse_output(
    stdout: &[u8],
    success: bool,
    stderr: &[u8],
) -> std::result::Result<Value, BackendError> {
    let text = String::from_utf8_lossy(stdout);
    let text = text.trim();

    if text.is_empty() {
        if success {
            return Ok(json!({ "findings": [] }));
        }
        return Err(BackendError::permanent(format!(
            "exited with failure and no output: {}",
            String::from_utf8_lossy(stderr).trim()
        )));
    }

    match serde_json::from_str::<Value>(text) {
        Ok(value @ Value::Object(_)) => Ok(value),
        Ok(other) => Ok(json!({ "findings": other })),
        Err(e) => Err(BackendError::permanent(format!("output is not JSON: {}", e))),
    }
}
