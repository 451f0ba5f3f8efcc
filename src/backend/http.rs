//! Chat-completion backend over an OpenAI-compatible HTTP API.
//!
//! Sends one request per call to `POST {url}/chat/completions` and expects
//! the model to answer with a JSON object, which becomes the task payload.
//! The API key is read from the environment variable named by
//! `api_key_env` at call time.
//!
//! Status classification:
//! - HTTP 429 and 5xx → transient
//! - other 4xx → permanent
//! - network errors → transient
//! - unparseable model output → permanent

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

use super::{AnalysisBackend, BackendRequest};
use crate::config::BackendConfig;
use crate::error::BackendError;
use crate::models::{TaskKind, Unit};

const DEFAULT_URL: &str = "https://api.openai.com/v1";

pub struct HttpModelBackend {
    id: String,
    tasks: Vec<TaskKind>,
    model: String,
    url: String,
    api_key_env: String,
    temperature: f32,
    client: reqwest::Client,
}

impl HttpModelBackend {
    pub fn new(id: &str, config: &BackendConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("backends.{}.model required for http backend", id))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            id: id.to_string(),
            tasks: config.tasks.clone(),
            model,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| DEFAULT_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key_env: config.api_key_env.clone(),
            temperature: config.temperature,
            client,
        })
    }

    fn messages(&self, request: &BackendRequest) -> Value {
        let unit = match &request.unit {
            Unit::Chunk { index, start, end } => format!(
                "chunk {} of {} (chars {}..{})",
                index + 1,
                request.file.chunk_count,
                start,
                end
            ),
            Unit::WholeFile => "whole file".to_string(),
        };
        let context = request
            .context
            .as_ref()
            .map(|c| serde_json::to_string_pretty(c).unwrap_or_default())
            .unwrap_or_default();

        json!([
            {
                "role": "system",
                "content": "You analyze source code. Respond with a single JSON object only."
            },
            {
                "role": "user",
                "content": format!(
                    "Task: {}\nFile: {} ({:?})\nUnit: {}\nContext:\n{}\n\nInput:\n{}",
                    request.kind, request.file.path, request.file.language, unit, context, request.text
                )
            }
        ])
    }
}

#[async_trait]
impl AnalysisBackend for HttpModelBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn task_kinds(&self) -> &[TaskKind] {
        &self.tasks
    }

    fn revision(&self) -> &str {
        &self.model
    }

    async fn analyze(&self, request: &BackendRequest) -> std::result::Result<Value, BackendError> {
        if !self.supports(request.kind) {
            return Err(BackendError::Unsupported(request.kind.to_string()));
        }

        let api_key = std::env::var(&self.api_key_env).map_err(|_| {
            BackendError::permanent(format!("{} environment variable not set", self.api_key_env))
        })?;

        let body = json!({
            "model": self.model,
            "temperature": self.temperature,
            "response_format": { "type": "json_object" },
            "messages": self.messages(request),
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.url))
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::transient(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), &body_text));
        }

        let json: Value = response
            .json()
            .await
            .map_err(|e| BackendError::transient(format!("reading response failed: {}", e)))?;
        parse_completion(&json)
    }
}

/// Map a non-success HTTP status to a retry class.
pub(crate) fn classify_status(status: u16, body: &str) -> BackendError {
    let msg = format!("API error {}: {}", status, body);
    if status == 429 || (500..600).contains(&status) {
        BackendError::Transient(msg)
    } else {
        BackendError::Permanent(msg)
    }
}

/// Extract the JSON object the model put in `choices[0].message.content`.
pub(crate) fn parse_completion(json: &Value) -> std::result::Result<Value, BackendError> {
    let content = json
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .ok_or_else(|| BackendError::permanent("invalid response: missing message content"))?;

    let trimmed = strip_fences(content);
    let parsed: Value = serde_json::from_str(trimmed)
        .map_err(|e| BackendError::permanent(format!("model output is not JSON: {}", e)))?;
    if !parsed.is_object() {
        return Err(BackendError::permanent("model output is not a JSON object"));
    }
    Ok(parsed)
}

fn strip_fences(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_and_server_errors_are_transient() {
        assert!(classify_status(429, "").is_transient());
        assert!(classify_status(503, "").is_transient());
        assert!(!classify_status(400, "bad").is_transient());
        assert!(!classify_status(401, "").is_transient());
    }

    #[test]
    fn parses_fenced_json_content() {
        let response = json!({
            "choices": [{ "message": { "content": "```json\n{\"overview\": \"ok\"}\n```" } }]
        });
        assert_eq!(parse_completion(&response).unwrap(), json!({ "overview": "ok" }));
    }

    #[test]
    fn non_json_content_is_permanent() {
        let response = json!({
            "choices": [{ "message": { "content": "I cannot help with that." } }]
        });
        let err = parse_completion(&response).unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn missing_choices_is_permanent() {
        assert!(matches!(
            parse_completion(&json!({})),
            Err(BackendError::Permanent(_))
        ));
    }
}
