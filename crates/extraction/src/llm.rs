use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use shared::domain::TextBlock;
use tracing::{debug, warn};

use crate::error::ExtractError;

pub const DEFAULT_MODEL: &str = "gpt-5-mini";
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Builds the extraction prompt. Blocks are numbered from 1 in reading order;
/// the model refers back to them through `block`.
pub fn build_prompt(blocks: &[TextBlock], label: &str, fields: &Map<String, Value>) -> String {
    let blocks_text = blocks
        .iter()
        .enumerate()
        .map(|(i, block)| format!("{}. \"{}\"", i + 1, block.text))
        .collect::<Vec<_>>()
        .join("\n");
    let fields_json =
        serde_json::to_string_pretty(fields).unwrap_or_else(|_| Value::Object(fields.clone()).to_string());

    format!(
        r#"You extract structured information from documents.

You will receive the numbered text blocks of a document and the label of its document type.
You will also receive a schema describing the fields to extract.

For each field of the schema, return:
- "value": the value extracted from this PDF.
- "regex": a generic regular expression able to capture this kind of value
  in similar documents, **not only this specific value**.
- "block": the number of the block the value was extracted from.

The regex must:
- Be generic enough to capture similar values in different documents.
- Use Rust `regex` syntax (no look-around), with `(?m)` if needed.

Answer in JSON with the format:
{{
  "field": {{
    "value": "...",
    "regex": "...", // Only include "regex" when "extract_regex" is true for the field
    "block": "..."
  }}
}}

Label:
{label}

Note: the blocks are sorted in the usual reading order.
Blocks:
{blocks_text}

Schema:
{fields_json}"#
    )
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Sends `prompt` and returns the model's answer as a JSON object.
    async fn complete_json(&self, prompt: &str) -> Result<Map<String, Value>, ExtractError>;
}

/// Stands in when no API key is configured; every fallback fails.
pub struct MissingLlmClient;

#[async_trait]
impl LlmClient for MissingLlmClient {
    async fn complete_json(&self, _prompt: &str) -> Result<Map<String, Value>, ExtractError> {
        Err(ExtractError::Llm(
            "no LLM is configured; set OPENAI_API_KEY".into(),
        ))
    }
}

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    api_key: Secret<String>,
    pub model: String,
    pub base_url: String,
    pub timeout: Duration,
}

impl OpenAiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: Secret::new(api_key.into()),
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(120),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

pub struct OpenAiClient {
    config: OpenAiConfig,
    http: Client,
}

impl OpenAiClient {
    pub fn new(config: OpenAiConfig) -> Result<Self, ExtractError> {
        let http = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { config, http })
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    response_format: ResponseFormat,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete_json(&self, prompt: &str) -> Result<Map<String, Value>, ExtractError> {
        let request = ChatRequest {
            model: &self.config.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            response_format: ResponseFormat {
                kind: "json_object",
            },
        };

        debug!(model = %self.config.model, prompt_chars = prompt.len(), "llm: sending completion request");
        let response = self
            .http
            .post(self.completions_url())
            .bearer_auth(self.config.api_key.expose_secret())
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(%status, "llm: completion request rejected");
            return Err(ExtractError::Llm(format!("upstream returned {status}: {body}")));
        }

        let body: ChatResponse = response.json().await?;
        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| ExtractError::Llm("response contained no message content".into()))?;
        parse_answer(&content)
    }
}

pub fn parse_answer(content: &str) -> Result<Map<String, Value>, ExtractError> {
    match serde_json::from_str::<Value>(content) {
        Ok(Value::Object(map)) => Ok(map),
        _ => {
            warn!(raw = %content, "llm: response parse error");
            Err(ExtractError::Llm("LLM response parse error".into()))
        }
    }
}

#[cfg(test)]
#[path = "tests/llm_tests.rs"]
mod tests;
