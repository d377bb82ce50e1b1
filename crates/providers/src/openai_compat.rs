//! OpenAI-compatible upstream client.
//!
//! Works with any provider exposing `/chat/completions`: OpenAI, Kimi,
//! Qwen, GLM, DeepSeek, Silicon Flow, vLLM, Ollama and similar.
//!
//! Streaming responses are relayed as raw SSE `data:` payloads; the proxy
//! never re-encodes chunks.

use async_trait::async_trait;
use ctxgate_config::ProviderConfig;
use ctxgate_core::error::UpstreamError;
use ctxgate_core::{Message, Payload, ToolDefinition};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::upstream::{ChunkReceiver, StreamChunk, Upstream, UpstreamRequest, UpstreamResponse};

/// Shared HTTP client for all OpenAI-compatible providers.
///
/// Deadlines are applied by the dispatcher, not here.
#[derive(Clone)]
pub struct OpenAiCompatUpstream {
    client: reqwest::Client,
}

impl OpenAiCompatUpstream {
    pub fn new() -> Result<Self, UpstreamError> {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| UpstreamError::Network(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// Use a preconfigured client (proxies, custom TLS roots).
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn endpoint(provider: &ProviderConfig) -> String {
        format!("{}/chat/completions", provider.base_url.trim_end_matches('/'))
    }

    /// Convert our Message types to OpenAI API format.
    fn to_api_messages(messages: &[Message]) -> Vec<ApiMessage> {
        messages
            .iter()
            .map(|m| {
                let mut api = ApiMessage {
                    role: m.role.as_str().to_string(),
                    content: Some(m.content.clone()),
                    tool_calls: None,
                    tool_call_id: None,
                };
                match &m.payload {
                    Some(Payload::ToolCalls { calls }) => {
                        if m.content.is_empty() {
                            api.content = None;
                        }
                        api.tool_calls = Some(
                            calls
                                .iter()
                                .map(|tc| ApiToolCall {
                                    id: tc.id.clone(),
                                    r#type: "function".into(),
                                    function: ApiFunction {
                                        name: tc.name.clone(),
                                        arguments: tc.arguments.clone(),
                                    },
                                })
                                .collect(),
                        );
                    }
                    Some(Payload::ToolResult { tool_call_id }) => {
                        api.tool_call_id = Some(tool_call_id.clone());
                    }
                    // Attachments travel inside `content`
                    Some(Payload::Attachment(_)) | None => {}
                }
                api
            })
            .collect()
    }

    /// Convert tool definitions to OpenAI API format.
    fn to_api_tools(tools: &[ToolDefinition]) -> Vec<ApiToolDefinition> {
        tools
            .iter()
            .map(|t| ApiToolDefinition {
                r#type: "function".into(),
                function: ApiToolFunction {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters.clone(),
                },
            })
            .collect()
    }

    fn to_api_body(request: &UpstreamRequest, stream: bool) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": Self::to_api_messages(&request.messages),
            "stream": stream,
        });
        if let Some(temperature) = request.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }
        if !request.tools.is_empty() {
            body["tools"] = serde_json::json!(Self::to_api_tools(&request.tools));
        }
        if let Some(tool_choice) = &request.tool_choice {
            body["tool_choice"] = tool_choice.clone();
        }
        body
    }

    async fn send(
        &self,
        provider: &ProviderConfig,
        request: &UpstreamRequest,
        stream: bool,
    ) -> Result<reqwest::Response, UpstreamError> {
        let mut builder = self
            .client
            .post(Self::endpoint(provider))
            .header("Content-Type", "application/json")
            .json(&Self::to_api_body(request, stream));

        if let Some(key) = provider.api_key.as_deref().filter(|k| !k.is_empty()) {
            builder = builder.bearer_auth(key);
        }
        for (name, value) in &provider.headers {
            builder = builder.header(name, value);
        }
        if stream {
            builder = builder.header("Accept", "text/event-stream");
        }

        // A refused or unreachable host is a network failure and counts
        // against the breaker.
        let response = builder.send().await.map_err(|e| {
            if e.is_connect() {
                UpstreamError::Network(format!("connect to {} failed: {e}", provider.id))
            } else {
                UpstreamError::Network(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            warn!(provider = %provider.id, status = status.as_u16(), body = %error_body, "Upstream returned error");
            return Err(UpstreamError::Status {
                status_code: status.as_u16(),
                message: error_body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl Upstream for OpenAiCompatUpstream {
    async fn complete(
        &self,
        provider: &ProviderConfig,
        request: &UpstreamRequest,
    ) -> Result<UpstreamResponse, UpstreamError> {
        debug!(provider = %provider.id, model = %request.model, "Sending completion request");
        let response = self.send(provider, request, false).await?;
        let status = response.status().as_u16();
        let body = response.json().await.map_err(|e| UpstreamError::Status {
            status_code: 502,
            message: format!("failed to parse upstream response: {e}"),
        })?;
        Ok(UpstreamResponse { status, body })
    }

    async fn stream(
        &self,
        provider: &ProviderConfig,
        request: &UpstreamRequest,
    ) -> Result<ChunkReceiver, UpstreamError> {
        debug!(provider = %provider.id, model = %request.model, "Sending streaming request");
        let response = self.send(provider, request, true).await?;

        let (tx, rx) = mpsc::channel(1);
        let provider_id = provider.id.clone();

        // Dropping `response` on return closes the upstream connection
        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut lines = SseLineBuffer::default();

            loop {
                let next = tokio::select! {
                    _ = tx.closed() => {
                        trace!(provider = %provider_id, "Stream receiver dropped while upstream idle");
                        return;
                    }
                    next = byte_stream.next() => next,
                };
                let Some(chunk_result) = next else { break };
                let bytes = match chunk_result {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx
                            .send(Err(UpstreamError::StreamInterrupted(e.to_string())))
                            .await;
                        return;
                    }
                };

                for data in lines.push(&bytes) {
                    let chunk = StreamChunk::new(data);
                    let done = chunk.is_done();
                    if tx.send(Ok(chunk)).await.is_err() {
                        trace!(provider = %provider_id, "Stream receiver dropped");
                        return;
                    }
                    if done {
                        return;
                    }
                }
            }
            trace!(provider = %provider_id, "Upstream closed stream without [DONE]");
        });

        Ok(rx)
    }
}

/// Splits an SSE byte stream into `data:` payloads.
///
/// Bytes are buffered until a full line is seen, so multi-byte characters
/// split across network reads survive intact.
#[derive(Debug, Default)]
struct SseLineBuffer {
    buffer: Vec<u8>,
}

impl SseLineBuffer {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut out = Vec::new();
        while let Some(line_end) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=line_end).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);

            // Skip blank separators and SSE comments
            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            if let Some(data) = line.strip_prefix("data:") {
                out.push(data.trim_start().to_string());
            }
        }
        out
    }
}

// --- OpenAI API types (internal) ---

#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolCall {
    id: String,
    r#type: String,
    function: ApiFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolDefinition {
    r#type: String,
    function: ApiToolFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctxgate_core::{Attachment, ToolCall};

    #[test]
    fn endpoint_strips_trailing_slash() {
        let provider = ProviderConfig::new("kimi", "https://api.moonshot.cn/v1/", "moonshot-v1-8k");
        assert_eq!(
            OpenAiCompatUpstream::endpoint(&provider),
            "https://api.moonshot.cn/v1/chat/completions"
        );
    }

    #[test]
    fn roles_map_to_wire_names() {
        let messages = vec![
            Message::system("Answer in French."),
            Message::user("Bonjour"),
            Message::assistant("Salut"),
        ];
        let roles: Vec<String> = OpenAiCompatUpstream::to_api_messages(&messages)
            .into_iter()
            .map(|m| m.role)
            .collect();
        assert_eq!(roles, vec!["system", "user", "assistant"]);
    }

    #[test]
    fn tool_call_message_has_no_text_content() {
        let msg = Message::assistant_tool_calls(vec![ToolCall {
            id: "call_7".into(),
            name: "grep_repo".into(),
            arguments: r#"{"pattern":"fn main"}"#.into(),
        }]);
        let wire = OpenAiCompatUpstream::to_api_messages(&[msg]);
        let calls = wire[0].tool_calls.as_ref().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_7");
        assert_eq!(calls[0].function.arguments, r#"{"pattern":"fn main"}"#);
        assert!(wire[0].content.is_none());
    }

    #[test]
    fn tool_result_keeps_call_id() {
        let wire = OpenAiCompatUpstream::to_api_messages(&[Message::tool_result("call_7", "src/main.rs:1")]);
        assert_eq!(wire[0].role, "tool");
        assert_eq!(wire[0].tool_call_id.as_deref(), Some("call_7"));
        assert_eq!(wire[0].content.as_deref(), Some("src/main.rs:1"));
    }

    #[test]
    fn attachment_is_sent_as_content() {
        let msg = Message::user("[File: report.pdf]").with_payload(Payload::Attachment(Attachment {
            reference: "report.pdf".into(),
            mime_type: None,
        }));
        let api_msgs = OpenAiCompatUpstream::to_api_messages(&[msg]);
        assert_eq!(api_msgs[0].content.as_deref(), Some("[File: report.pdf]"));
        assert!(api_msgs[0].tool_calls.is_none());
    }

    #[test]
    fn tools_are_wrapped_as_functions() {
        let tools = vec![ToolDefinition {
            name: "grep_repo".into(),
            description: "Search the repository".into(),
            parameters: serde_json::json!({"type": "object", "required": ["pattern"]}),
        }];
        let wire = OpenAiCompatUpstream::to_api_tools(&tools);
        assert_eq!(wire[0].r#type, "function");
        assert_eq!(wire[0].function.name, "grep_repo");
        assert_eq!(wire[0].function.parameters["required"][0], "pattern");
    }

    #[test]
    fn body_omits_unset_parameters() {
        let request = UpstreamRequest::new("moonshot-v1-8k", vec![Message::user("hi")]);
        let body = OpenAiCompatUpstream::to_api_body(&request, false);
        assert_eq!(body["model"], "moonshot-v1-8k");
        assert_eq!(body["stream"], false);
        assert!(body.get("temperature").is_none());
        assert!(body.get("tools").is_none());
    }

    #[test]
    fn body_carries_generation_parameters() {
        let mut request = UpstreamRequest::new("gpt-4o", vec![Message::user("hi")]).streaming();
        request.max_tokens = Some(256);
        request.tool_choice = Some(serde_json::json!("auto"));
        let body = OpenAiCompatUpstream::to_api_body(&request, true);
        assert_eq!(body["stream"], true);
        assert_eq!(body["max_tokens"], 256);
        assert_eq!(body["tool_choice"], "auto");
    }

    #[test]
    fn client_tool_exchange_reaches_upstream_intact() {
        let client: ctxgate_core::ConversationRequest = serde_json::from_str(
            r#"{
                "model": "gpt-4o",
                "messages": [
                    {"role": "assistant", "content": null, "tool_calls": [
                        {"id": "call_9", "type": "function", "function": {"name": "grep", "arguments": "{\"q\":\"todo\"}"}}
                    ]},
                    {"role": "tool", "tool_call_id": "call_9", "content": "3 matches"}
                ],
                "tools": [{"type": "function", "function": {"name": "grep", "description": "search", "parameters": {}}}]
            }"#,
        )
        .unwrap();
        let mut request = UpstreamRequest::new("gpt-4o", client.messages);
        request.tools = client.tools;

        let body = OpenAiCompatUpstream::to_api_body(&request, false);
        let messages = &body["messages"];
        assert!(messages[0]["content"].is_null());
        assert_eq!(messages[0]["tool_calls"][0]["id"], "call_9");
        assert_eq!(messages[0]["tool_calls"][0]["function"]["arguments"], r#"{"q":"todo"}"#);
        assert_eq!(messages[1]["tool_call_id"], "call_9");
        assert_eq!(messages[1]["content"], "3 matches");
        assert_eq!(body["tools"][0]["function"]["name"], "grep");
    }

    #[test]
    fn sse_lines_split_across_reads() {
        let mut lines = SseLineBuffer::default();
        assert!(lines.push(b"data: {\"a\"").is_empty());
        assert_eq!(lines.push(b":1}\n\n"), vec!["{\"a\":1}"]);
    }

    #[test]
    fn sse_skips_comments_and_other_fields() {
        let mut lines = SseLineBuffer::default();
        let out = lines.push(b": keep-alive\nevent: message\ndata: x\r\n\ndata: [DONE]\n");
        assert_eq!(out, vec!["x", "[DONE]"]);
    }

    #[test]
    fn sse_keeps_multibyte_characters_split_between_reads() {
        let text = "data: 你好\n".as_bytes();
        let (head, tail) = text.split_at(8);
        let mut lines = SseLineBuffer::default();
        assert!(lines.push(head).is_empty());
        assert_eq!(lines.push(tail), vec!["你好"]);
    }

    #[tokio::test]
    async fn refused_connection_is_a_network_failure() {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let provider = ProviderConfig::new("dead", format!("http://127.0.0.1:{port}/v1"), "m");
        let request = UpstreamRequest::new("m", vec![Message::user("hi")]);

        let err = OpenAiCompatUpstream::new()
            .unwrap()
            .complete(&provider, &request)
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::Network(_)), "got {err:?}");
        assert!(err.is_breaker_failure());
    }

    #[tokio::test]
    async fn dropped_receiver_closes_idle_upstream_connection() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (closed_tx, closed_rx) = tokio::sync::oneshot::channel();

        // Sends one event, then stays silent until the client hangs up
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut seen: Vec<u8> = Vec::new();
            let mut buf = [0u8; 4096];
            while !seen.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    return;
                }
                seen.extend_from_slice(&buf[..n]);
            }
            socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nConnection: close\r\n\r\n\
                      data: {\"choices\":[{\"delta\":{\"content\":\"A\"}}]}\n\n",
                )
                .await
                .unwrap();
            loop {
                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => continue,
                }
            }
            let _ = closed_tx.send(());
        });

        let provider = ProviderConfig::new("local", format!("http://{addr}/v1"), "m");
        let request = UpstreamRequest::new("m", vec![Message::user("hi")]).streaming();
        let mut rx = OpenAiCompatUpstream::new()
            .unwrap()
            .stream(&provider, &request)
            .await
            .unwrap();

        let first = rx.recv().await.unwrap().unwrap();
        assert!(first.data.contains("\"A\""));
        drop(rx);

        tokio::time::timeout(std::time::Duration::from_secs(2), closed_rx)
            .await
            .expect("upstream connection still open after client went away")
            .unwrap();
    }
}
