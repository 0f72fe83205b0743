//! Language model clients for the fast, deep, and voice brains.
//!
//! Two wire protocols are spoken:
//! - [`OpenAiCompatClient`]: chat-completions SSE, used for the fast and
//!   voice brains (Groq, Cerebras, Together, OpenAI).
//! - [`AnthropicClient`]: the messages API, used for the deep brain; the
//!   only client that accepts image content blocks.
//!
//! Both stream tokens and support mid-stream cancellation for barge-in.

use crate::providers::retry::{ProviderError, ProviderErrorKind};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::json;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Message role in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One part of a message's content.
#[derive(Debug, Clone)]
pub enum ContentPart {
    /// Plain text.
    Text(String),
    /// Inline JPEG, base64-encoded. Whitespace is stripped before the
    /// payload goes on the wire.
    ImageJpeg(String),
}

/// A single message in the conversation sent to a brain.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: Role,
    pub content: Vec<ContentPart>,
}

impl ChatMessage {
    /// A plain-text user message.
    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentPart::Text(text.into())],
        }
    }

    /// A plain-text assistant message.
    #[must_use]
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: vec![ContentPart::Text(text.into())],
        }
    }

    /// A composite user turn binding an image to the user's utterance.
    #[must_use]
    pub fn user_with_image(preamble: impl Into<String>, jpeg_base64: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![
                ContentPart::Text(preamble.into()),
                ContentPart::ImageJpeg(jpeg_base64.into()),
            ],
        }
    }

    /// Whether any content part is an image.
    #[must_use]
    pub fn has_image(&self) -> bool {
        self.content
            .iter()
            .any(|p| matches!(p, ContentPart::ImageJpeg(_)))
    }
}

/// A completion request to one brain.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// System prompt for this turn.
    pub system: String,
    /// Conversation messages, oldest first.
    pub messages: Vec<ChatMessage>,
    /// Output token budget.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f32,
}

/// A completed (fully drained) response from a brain.
#[derive(Debug, Clone, Default)]
pub struct CompletionResponse {
    /// The generated text.
    pub text: String,
    /// Input token count reported by the provider, when available.
    pub input_tokens: u32,
    /// Output token count reported by the provider, when available.
    pub output_tokens: u32,
    /// Whether the generation was cancelled mid-stream.
    pub cancelled: bool,
}

/// Seam for LLM calls so tests can substitute scripted brains.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Run one completion, streaming internally until done or cancelled.
    ///
    /// Cancellation is observed between stream chunks; a cancelled call
    /// returns the partial text with `cancelled = true` rather than an error.
    async fn complete(
        &self,
        request: CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<CompletionResponse, ProviderError>;
}

fn strip_base64_whitespace(data: &str) -> String {
    data.chars().filter(|c| !c.is_whitespace()).collect()
}

fn classify_reqwest(e: &reqwest::Error) -> ProviderErrorKind {
    if e.is_timeout() {
        ProviderErrorKind::Timeout
    } else {
        ProviderErrorKind::NetworkError
    }
}

/// Incremental SSE line splitter over a byte stream.
///
/// Collects `data: ...` payloads; everything else (comments, event names,
/// blank separators) is discarded.
struct SseLineBuffer {
    pending: String,
}

impl SseLineBuffer {
    fn new() -> Self {
        Self {
            pending: String::new(),
        }
    }

    /// Feed a chunk, returning any complete `data:` payloads it closed.
    fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.push_str(&String::from_utf8_lossy(chunk));
        let mut out = Vec::new();
        while let Some(pos) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=pos).collect();
            let line = line.trim_end();
            if let Some(data) = line.strip_prefix("data: ") {
                out.push(data.to_owned());
            } else if let Some(data) = line.strip_prefix("data:") {
                out.push(data.trim_start().to_owned());
            }
        }
        out
    }
}

/// OpenAI-compatible chat-completions client (fast / voice brains).
pub struct OpenAiCompatClient {
    client: reqwest::Client,
    api_url: String,
    api_model: String,
    api_key: String,
}

impl OpenAiCompatClient {
    /// Build a client for an OpenAI-compatible endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(
        api_url: &str,
        api_model: &str,
        api_key: &str,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| {
                ProviderError::new(ProviderErrorKind::NetworkError, format!("client build: {e}"))
            })?;
        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_owned(),
            api_model: api_model.to_owned(),
            api_key: api_key.to_owned(),
        })
    }

    fn message_json(message: &ChatMessage) -> serde_json::Value {
        // Single text part collapses to a plain string for maximum
        // compatibility with minimal OpenAI-style servers.
        if let [ContentPart::Text(text)] = message.content.as_slice() {
            return json!({"role": message.role.as_str(), "content": text});
        }
        let parts: Vec<serde_json::Value> = message
            .content
            .iter()
            .map(|part| match part {
                ContentPart::Text(text) => json!({"type": "text", "text": text}),
                ContentPart::ImageJpeg(data) => {
                    let data = strip_base64_whitespace(data);
                    json!({
                        "type": "image_url",
                        "image_url": {"url": format!("data:image/jpeg;base64,{data}")},
                    })
                }
            })
            .collect();
        json!({"role": message.role.as_str(), "content": parts})
    }
}

#[async_trait]
impl LanguageModel for OpenAiCompatClient {
    async fn complete(
        &self,
        request: CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<CompletionResponse, ProviderError> {
        let mut messages = vec![json!({"role": "system", "content": request.system})];
        messages.extend(request.messages.iter().map(Self::message_json));

        let body = json!({
            "model": self.api_model,
            "messages": messages,
            "stream": true,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
            "stream_options": {"include_usage": true},
        });

        let url = format!("{}/chat/completions", self.api_url);
        let gen_start = Instant::now();

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::new(classify_reqwest(&e), format!("LLM request: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ProviderError::new(
                ProviderErrorKind::from_status(status.as_u16()),
                format!("LLM HTTP {status}: {detail}"),
            ));
        }

        let mut stream = response.bytes_stream();
        let mut lines = SseLineBuffer::new();
        let mut out = CompletionResponse::default();

        loop {
            let chunk = tokio::select! {
                () = cancel.cancelled() => {
                    out.cancelled = true;
                    break;
                }
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk.map_err(|e| {
                ProviderError::new(classify_reqwest(&e), format!("LLM stream: {e}"))
            })?;

            for data in lines.feed(&chunk) {
                if data == "[DONE]" {
                    continue;
                }
                let Ok(event) = serde_json::from_str::<serde_json::Value>(&data) else {
                    debug!("unparseable SSE chunk skipped");
                    continue;
                };
                if let Some(content) = event["choices"][0]["delta"]["content"].as_str() {
                    out.text.push_str(content);
                }
                if let Some(usage) = event.get("usage").filter(|u| !u.is_null()) {
                    out.input_tokens = usage["prompt_tokens"].as_u64().unwrap_or(0) as u32;
                    out.output_tokens = usage["completion_tokens"].as_u64().unwrap_or(0) as u32;
                }
            }
        }

        if cancel.is_cancelled() {
            out.cancelled = true;
        }

        info!(
            model = %self.api_model,
            ms = gen_start.elapsed().as_millis() as u64,
            cancelled = out.cancelled,
            "LLM completion finished ({} chars)",
            out.text.len()
        );
        Ok(out)
    }
}

/// Anthropic messages-API client (deep brain, vision-capable).
pub struct AnthropicClient {
    client: reqwest::Client,
    api_url: String,
    api_model: String,
    api_key: String,
}

/// API version header sent with every request.
const ANTHROPIC_VERSION: &str = "2023-06-01";

impl AnthropicClient {
    /// Build a client for the Anthropic messages API.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(
        api_url: &str,
        api_model: &str,
        api_key: &str,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| {
                ProviderError::new(ProviderErrorKind::NetworkError, format!("client build: {e}"))
            })?;
        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_owned(),
            api_model: api_model.to_owned(),
            api_key: api_key.to_owned(),
        })
    }

    fn message_json(message: &ChatMessage) -> serde_json::Value {
        let parts: Vec<serde_json::Value> = message
            .content
            .iter()
            .map(|part| match part {
                ContentPart::Text(text) => json!({"type": "text", "text": text}),
                ContentPart::ImageJpeg(data) => json!({
                    "type": "image",
                    "source": {
                        "type": "base64",
                        "media_type": "image/jpeg",
                        "data": strip_base64_whitespace(data),
                    },
                }),
            })
            .collect();
        json!({"role": message.role.as_str(), "content": parts})
    }
}

#[async_trait]
impl LanguageModel for AnthropicClient {
    async fn complete(
        &self,
        request: CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<CompletionResponse, ProviderError> {
        let messages: Vec<serde_json::Value> =
            request.messages.iter().map(Self::message_json).collect();

        let body = json!({
            "model": self.api_model,
            "system": request.system,
            "messages": messages,
            "stream": true,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
        });

        let url = format!("{}/v1/messages", self.api_url);
        let gen_start = Instant::now();

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::new(classify_reqwest(&e), format!("LLM request: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ProviderError::new(
                ProviderErrorKind::from_status(status.as_u16()),
                format!("LLM HTTP {status}: {detail}"),
            ));
        }

        let mut stream = response.bytes_stream();
        let mut lines = SseLineBuffer::new();
        let mut out = CompletionResponse::default();

        loop {
            let chunk = tokio::select! {
                () = cancel.cancelled() => {
                    out.cancelled = true;
                    break;
                }
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk.map_err(|e| {
                ProviderError::new(classify_reqwest(&e), format!("LLM stream: {e}"))
            })?;

            for data in lines.feed(&chunk) {
                let Ok(event) = serde_json::from_str::<serde_json::Value>(&data) else {
                    continue;
                };
                match event["type"].as_str() {
                    Some("content_block_delta") => {
                        if let Some(text) = event["delta"]["text"].as_str() {
                            out.text.push_str(text);
                        }
                    }
                    Some("message_start") => {
                        out.input_tokens = event["message"]["usage"]["input_tokens"]
                            .as_u64()
                            .unwrap_or(0) as u32;
                    }
                    Some("message_delta") => {
                        if let Some(n) = event["usage"]["output_tokens"].as_u64() {
                            out.output_tokens = n as u32;
                        }
                    }
                    Some("error") => {
                        let message = event["error"]["message"]
                            .as_str()
                            .unwrap_or("stream error")
                            .to_owned();
                        return Err(ProviderError::new(ProviderErrorKind::ServerError, message));
                    }
                    _ => {}
                }
            }
        }

        if cancel.is_cancelled() {
            out.cancelled = true;
        }

        info!(
            model = %self.api_model,
            ms = gen_start.elapsed().as_millis() as u64,
            cancelled = out.cancelled,
            "LLM completion finished ({} chars)",
            out.text.len()
        );
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_buffer_splits_across_chunks() {
        let mut buffer = SseLineBuffer::new();
        assert!(buffer.feed(b"data: {\"a\":").is_empty());
        let lines = buffer.feed(b"1}\n\ndata: [DONE]\n");
        assert_eq!(lines, vec!["{\"a\":1}".to_owned(), "[DONE]".to_owned()]);
    }

    #[test]
    fn sse_buffer_ignores_event_lines() {
        let mut buffer = SseLineBuffer::new();
        let lines = buffer.feed(b"event: message_start\ndata: {}\n");
        assert_eq!(lines, vec!["{}".to_owned()]);
    }

    #[test]
    fn image_whitespace_is_stripped() {
        let message = ChatMessage::user_with_image("look", "AA BB\nCC\t==");
        let value = AnthropicClient::message_json(&message);
        assert_eq!(value["content"][1]["source"]["data"], "AABBCC==");
        assert_eq!(value["content"][1]["source"]["media_type"], "image/jpeg");
    }

    #[test]
    fn openai_single_text_collapses_to_string() {
        let value = OpenAiCompatClient::message_json(&ChatMessage::user("hello"));
        assert_eq!(value["content"], "hello");
    }

    #[test]
    fn openai_image_uses_data_uri() {
        let message = ChatMessage::user_with_image("look", "Zm9v");
        let value = OpenAiCompatClient::message_json(&message);
        assert_eq!(
            value["content"][1]["image_url"]["url"],
            "data:image/jpeg;base64,Zm9v"
        );
    }

    #[test]
    fn has_image_detects_parts() {
        assert!(!ChatMessage::user("text").has_image());
        assert!(ChatMessage::user_with_image("p", "d").has_image());
    }
}
