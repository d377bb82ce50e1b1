//! Sanitizer: structural validation and protection marking.
//!
//! Content is never altered here. A message becomes protected when it
//! carries tool-call structure or an attachment (declared or inline), when
//! it holds a long fenced code block, or when it is the final user turn.

use async_trait::async_trait;
use ctxgate_core::{ConversationRequest, Error, Message, Result, Role};
use tracing::{debug, info};

use crate::stage::{RequestContext, Stage};

/// Inline markers clients use when pasting files into message text.
const ATTACHMENT_MARKERS: &[&str] = &[
    "[attached file",
    "[file:",
    "<file>",
    "data:application",
    "content-type:",
];

/// Parse a client request body.
///
/// Unknown roles and missing fields fail here and surface as
/// `MalformedRequest`.
pub fn parse_request(body: &[u8]) -> Result<ConversationRequest> {
    serde_json::from_slice(body).map_err(|e| Error::MalformedRequest(e.to_string()))
}

/// Length of the longest fenced code block body, in characters.
///
/// An unterminated trailing fence counts up to the end of the text.
pub fn longest_code_block(content: &str) -> usize {
    content
        .split("```")
        .skip(1)
        .step_by(2)
        .map(|block| {
            // First line is the language tag
            let body = block.split_once('\n').map(|(_, rest)| rest).unwrap_or("");
            body.chars().count()
        })
        .max()
        .unwrap_or(0)
}

pub fn has_attachment_marker(content: &str) -> bool {
    let lower = content.to_lowercase();
    ATTACHMENT_MARKERS.iter().any(|m| lower.contains(m))
}

#[derive(Debug, Clone)]
pub struct Sanitizer {
    code_block_protect_chars: usize,
}

impl Sanitizer {
    pub fn new(code_block_protect_chars: usize) -> Self {
        Self {
            code_block_protect_chars,
        }
    }

    /// Why `message` must pass through untouched, if it must.
    fn protection_reason(&self, message: &Message, is_final: bool) -> Option<&'static str> {
        if message.is_tool_structured() {
            return Some("tool_call");
        }
        if message.has_attachment() || has_attachment_marker(&message.content) {
            return Some("attachment");
        }
        if longest_code_block(&message.content) > self.code_block_protect_chars {
            return Some("code_block");
        }
        if is_final && message.role == Role::User {
            return Some("final_user");
        }
        None
    }

    /// Validate and flag a message list.
    pub fn sanitize(&self, messages: &[Message]) -> Result<Vec<Message>> {
        if messages.is_empty() {
            return Err(Error::MalformedRequest("messages must not be empty".into()));
        }

        let last = messages.len() - 1;
        let sanitized: Vec<Message> = messages
            .iter()
            .enumerate()
            .map(|(idx, msg)| {
                let mut out = msg.clone();
                out.protected = false;
                match self.protection_reason(msg, idx == last) {
                    Some(reason) => {
                        debug!(index = idx, role = %msg.role, reason, "Message marked protected");
                        out.into_protected()
                    }
                    None => out,
                }
            })
            .collect();

        info!(
            total_messages = sanitized.len(),
            protected = sanitized.iter().filter(|m| m.protected).count(),
            "Request sanitized"
        );
        Ok(sanitized)
    }
}

impl Default for Sanitizer {
    fn default() -> Self {
        Self::new(500)
    }
}

#[async_trait]
impl Stage for Sanitizer {
    fn name(&self) -> &'static str {
        "sanitizer"
    }

    async fn run(&self, mut ctx: RequestContext) -> Result<RequestContext> {
        let sanitized = self.sanitize(&ctx.messages)?;
        ctx.original = sanitized.clone();
        ctx.messages = sanitized;
        Ok(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctxgate_core::{Attachment, Payload, ToolCall};

    #[test]
    fn empty_messages_rejected() {
        let err = Sanitizer::default().sanitize(&[]).unwrap_err();
        assert!(matches!(err, Error::MalformedRequest(_)));
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn unknown_role_rejected_at_parse() {
        let body = br#"{"model":"gpt-4","messages":[{"role":"wizard","content":"hi"}]}"#;
        assert!(matches!(parse_request(body), Err(Error::MalformedRequest(_))));
    }

    #[test]
    fn parse_accepts_openai_shape() {
        let body = br#"{"model":"kimi:moonshot-v1-8k","messages":[{"role":"user","content":"hi"}],"stream":true}"#;
        let request = parse_request(body).unwrap();
        assert_eq!(request.model, "kimi:moonshot-v1-8k");
        assert!(request.stream);
    }

    #[test]
    fn openai_tool_exchange_is_parsed_and_protected() {
        let body = br#"{
            "model": "gpt-4o",
            "messages": [
                {"role": "user", "content": "List the repo files"},
                {"role": "assistant", "content": null, "tool_calls": [
                    {"id": "call_ls", "type": "function", "function": {"name": "ls", "arguments": "{}"}}
                ]},
                {"role": "tool", "tool_call_id": "call_ls", "content": "Cargo.toml\nsrc"},
                {"role": "assistant", "content": "Two entries."}
            ],
            "tools": [{"type": "function", "function": {"name": "ls", "parameters": {"type": "object"}}}]
        }"#;
        let request = parse_request(body).unwrap();
        assert_eq!(request.tools[0].name, "ls");

        let out = Sanitizer::default().sanitize(&request.messages).unwrap();
        assert!(out[1].is_tool_structured());
        assert!(out[2].is_tool_structured());
        let flags: Vec<bool> = out.iter().map(|m| m.protected).collect();
        assert_eq!(flags, vec![false, true, true, false]);
    }

    #[test]
    fn final_user_message_protected() {
        let messages = vec![
            Message::system("sys"),
            Message::user("first"),
            Message::assistant("reply"),
            Message::user("last"),
        ];
        let out = Sanitizer::default().sanitize(&messages).unwrap();
        let flags: Vec<bool> = out.iter().map(|m| m.protected).collect();
        assert_eq!(flags, vec![false, false, false, true]);
    }

    #[test]
    fn final_assistant_message_not_protected() {
        let messages = vec![Message::user("q"), Message::assistant("a")];
        let out = Sanitizer::default().sanitize(&messages).unwrap();
        assert!(!out[0].protected);
        assert!(!out[1].protected);
    }

    #[test]
    fn tool_and_attachment_messages_protected() {
        let messages = vec![
            Message::user("run it"),
            Message::assistant_tool_calls(vec![ToolCall {
                id: "call_1".into(),
                name: "shell".into(),
                arguments: "{}".into(),
            }]),
            Message::tool_result("call_1", "ok"),
            Message::user("see file").with_payload(Payload::Attachment(Attachment {
                reference: "blob://1".into(),
                mime_type: Some("text/plain".into()),
            })),
            Message::user("[File: notes.txt] contents"),
            Message::assistant("done"),
        ];
        let out = Sanitizer::default().sanitize(&messages).unwrap();
        let flags: Vec<bool> = out.iter().map(|m| m.protected).collect();
        assert_eq!(flags, vec![false, true, true, true, true, false]);
    }

    #[test]
    fn content_is_never_altered() {
        let messages = vec![Message::system("  keep   spacing "), Message::user("x")];
        let out = Sanitizer::default().sanitize(&messages).unwrap();
        assert_eq!(out[0].content, "  keep   spacing ");
    }

    #[test]
    fn long_code_block_protected() {
        let long = format!("look:\n```rust\n{}\n```", "x".repeat(600));
        let short = "```rust\nfn main() {}\n```".to_string();
        let messages = vec![Message::user(long), Message::user(short), Message::user("q")];
        let out = Sanitizer::default().sanitize(&messages).unwrap();
        assert!(out[0].protected);
        assert!(!out[1].protected);
    }

    #[test]
    fn code_block_measurement() {
        assert_eq!(longest_code_block("no fences"), 0);
        assert_eq!(longest_code_block("```py\nabc\n```"), 4);
        assert_eq!(longest_code_block("```\nab\n``` text ```\nabcdef"), 6);
    }

    #[test]
    fn attachment_markers_case_insensitive() {
        assert!(has_attachment_marker("[ATTACHED FILE: a.pdf]"));
        assert!(has_attachment_marker("Content-Type: image/png"));
        assert!(!has_attachment_marker("a plain question"));
    }
}
