use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::UpstreamError,
    models::{ChatMessage, ChatRole},
};

const SERVICE: &str = "Ollama";
pub const DEFAULT_TEMPERATURE: f64 = 0.2;
/// Context window requested per chat; small enough for an 8GB host.
pub const DEFAULT_NUM_CTX: u32 = 2048;

const SYSTEM_PROMPT: &str = "You are a helpful coding assistant running on a self-hosted \
server. Answer clearly and concisely, prefer working code examples, and ask a short \
clarifying question when a request is ambiguous.";

pub fn system_message() -> ChatMessage {
    ChatMessage {
        role: ChatRole::System,
        content: SYSTEM_PROMPT.to_string(),
    }
}

#[derive(Debug, Serialize)]
struct ChatOptions {
    temperature: f64,
    num_ctx: u32,
}

#[derive(Debug, Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    options: ChatOptions,
}

#[derive(Debug, Default, Deserialize)]
struct OllamaMessage {
    #[serde(default)]
    content: String,
}

/// One line of Ollama's NDJSON chat stream.
#[derive(Debug, Default, Deserialize)]
pub struct ChatChunk {
    #[serde(default)]
    message: Option<OllamaMessage>,
    #[serde(default)]
    pub done: bool,
}

impl ChatChunk {
    pub fn content(&self) -> Option<&str> {
        self.message
            .as_ref()
            .map(|m| m.content.as_str())
            .filter(|c| !c.is_empty())
    }
}

#[derive(Debug, Clone)]
pub struct OllamaClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    timeout: Duration,
}

impl OllamaClient {
    pub fn new(http: reqwest::Client, base_url: String, model: String, timeout: Duration) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            timeout,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub async fn list_models(&self) -> Result<Vec<String>, UpstreamError> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self
            .http
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(transport)?;
        let body: Value = ensure_success(response).await?.json().await.map_err(transport)?;

        Ok(body
            .get("models")
            .and_then(Value::as_array)
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m.get("name").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Non-streaming chat. Returns the reply text and Ollama's full body.
    pub async fn chat(
        &self,
        messages: &[ChatMessage],
        temperature: f64,
    ) -> Result<(String, Value), UpstreamError> {
        let response = self
            .post_chat(messages, temperature, false)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(transport)?;
        let raw: Value = ensure_success(response).await?.json().await.map_err(transport)?;
        let content = raw
            .pointer("/message/content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Ok((content, raw))
    }

    /// Streaming chat. The body is left unread for the caller to forward.
    pub async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        temperature: f64,
    ) -> Result<reqwest::Response, UpstreamError> {
        let response = self
            .post_chat(messages, temperature, true)
            .send()
            .await
            .map_err(transport)?;
        ensure_success(response).await
    }

    fn post_chat(
        &self,
        messages: &[ChatMessage],
        temperature: f64,
        stream: bool,
    ) -> reqwest::RequestBuilder {
        let body = OllamaChatRequest {
            model: &self.model,
            messages,
            stream,
            options: ChatOptions {
                temperature,
                num_ctx: DEFAULT_NUM_CTX,
            },
        };
        self.http
            .post(format!("{}/api/chat", self.base_url))
            .json(&body)
    }
}

fn transport(source: reqwest::Error) -> UpstreamError {
    UpstreamError::Transport {
        service: SERVICE,
        source,
    }
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, UpstreamError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let detail = response.text().await.unwrap_or_default();
    Err(UpstreamError::Status {
        service: SERVICE,
        status: status.as_u16(),
        detail,
    })
}

/// Splits a byte stream into complete lines, holding back any partial tail.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]);
            if !line.trim().is_empty() {
                lines.push(line.into_owned());
            }
        }
        lines
    }

    pub fn finish(self) -> Option<String> {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        (!rest.trim().is_empty()).then_some(rest)
    }
}

/// Lines that are not valid JSON are skipped.
pub fn parse_chunk(line: &str) -> Option<ChatChunk> {
    serde_json::from_str(line).ok()
}
