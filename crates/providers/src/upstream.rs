//! The upstream boundary: what the dispatcher sends and what comes back.

use async_trait::async_trait;
use ctxgate_config::ProviderConfig;
use ctxgate_core::error::UpstreamError;
use ctxgate_core::{Message, ToolDefinition};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;

/// A rewritten conversation, addressed to a concrete upstream model.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    /// Model name without any `provider:` prefix
    pub model: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub stream: bool,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub tool_choice: Option<Value>,
}

impl UpstreamRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            tools: Vec::new(),
            stream: false,
            temperature: None,
            max_tokens: None,
            tool_choice: None,
        }
    }

    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }
}

/// A complete (non-streamed) upstream reply, passed back unmodified.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    pub body: Value,
}

impl UpstreamResponse {
    /// Assistant text of the first choice, if any.
    pub fn content(&self) -> Option<&str> {
        self.body["choices"][0]["message"]["content"].as_str()
    }
}

/// One SSE `data:` payload, relayed verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamChunk {
    pub data: String,
}

impl StreamChunk {
    pub fn new(data: impl Into<String>) -> Self {
        Self { data: data.into() }
    }

    /// The `[DONE]` sentinel that ends an OpenAI-style stream.
    pub fn is_done(&self) -> bool {
        self.data.trim() == "[DONE]"
    }

    /// Text delta carried by this chunk, if it parses as a completion delta.
    pub fn content_delta(&self) -> Option<String> {
        let parsed: StreamResponse = serde_json::from_str(&self.data).ok()?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.delta.content)
            .filter(|c| !c.is_empty())
    }
}

/// Receiving half of a relayed stream. A terminal `Err` ends the stream.
pub type ChunkReceiver = mpsc::Receiver<Result<StreamChunk, UpstreamError>>;

/// An HTTP client for chat-completion upstreams.
///
/// The provider is passed per call so one client serves every registered
/// provider, including ones added after startup.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn complete(
        &self,
        provider: &ProviderConfig,
        request: &UpstreamRequest,
    ) -> Result<UpstreamResponse, UpstreamError>;

    /// Open a stream. Returns once the upstream has accepted the request;
    /// chunks arrive on the receiver in upstream order.
    async fn stream(
        &self,
        provider: &ProviderConfig,
        request: &UpstreamRequest,
    ) -> Result<ChunkReceiver, UpstreamError>;
}

// --- Streaming SSE delta types ---

#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn done_sentinel() {
        assert!(StreamChunk::new("[DONE]").is_done());
        assert!(!StreamChunk::new("{}").is_done());
    }

    #[test]
    fn content_delta_extracted() {
        let chunk = StreamChunk::new(r#"{"choices":[{"delta":{"content":"Hello"},"finish_reason":null}]}"#);
        assert_eq!(chunk.content_delta().as_deref(), Some("Hello"));
    }

    #[test]
    fn finish_chunk_has_no_delta() {
        let chunk = StreamChunk::new(r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#);
        assert!(chunk.content_delta().is_none());
        assert!(StreamChunk::new("[DONE]").content_delta().is_none());
    }

    #[test]
    fn response_content() {
        let response = UpstreamResponse {
            status: 200,
            body: serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "hi there"}}]
            }),
        };
        assert_eq!(response.content(), Some("hi there"));
    }
}
