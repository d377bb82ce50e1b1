//! Intent classifier: rule-based, pure, deterministic.
//!
//! Priority: `tool_use` > `code` > `retrieval` > `chat`. Only the request's
//! tools, its last message, and the most recent user text are inspected.

use async_trait::async_trait;
use ctxgate_core::message::last_user_text;
use ctxgate_core::{Classification, Error, Message, Result, ToolDefinition};
use regex::RegexSet;
use tracing::debug;

use crate::stage::{RequestContext, Stage};

const CODE_PATTERNS: &[&str] = &[
    // Fenced or inline code
    r"```",
    r"`[^`\n]+`",
    // Explicit paths and source files
    r"(?:^|\s)(?:\.{1,2}/|~/|/)[\w.-]+/[\w./-]*",
    r"\b[\w-]+\.(?:rs|py|js|ts|tsx|jsx|go|java|kt|c|cc|cpp|h|hpp|rb|php|cs|swift|sh|sql|toml|yaml|yml|json)\b",
    // Definitions and syntax
    r"\b(?:fn|def|func)\s+\w+\s*\(",
    r"\b(?:impl|struct|enum|class|interface|trait)\s+[A-Z]\w*",
    r#"(?m)^\s*(?:import\s+[\w.]+|from\s+[\w.]+\s+import\b)|#include\s*[<"]"#,
    r"\w+\([^)]*\)\s*(?:\{|;|=>|->)",
    // Vocabulary
    r"(?i)\b(?:code|bug|debug|compile[rsd]?|stack ?trace|exception|refactor|segfault|regex|python|javascript|typescript|rust|golang|sql)\b",
    r"编程|函数|代码|报错|调试",
];

const RECALL_PATTERNS: &[&str] = &[
    r"(?i)\b(?:do you |can you )?(?:remember|recall)\b",
    r"(?i)\bwhat (?:did|was|were) (?:i|we|you)\b",
    r"(?i)\b(?:earlier|previously|last time|before that)\b",
    r"(?i)\b(?:we|you|i) (?:discussed|talked about|mentioned|said|told)\b",
    r"(?i)\b(?:look up|remind me)\b",
    r"之前|上次|记得|回忆|查找|查询",
];

/// Assigns one [`Classification`] per request.
#[derive(Debug, Clone)]
pub struct IntentClassifier {
    code: RegexSet,
    recall: RegexSet,
}

impl IntentClassifier {
    pub fn new() -> Result<Self> {
        let build = |patterns: &[&str]| {
            RegexSet::new(patterns).map_err(|e| Error::Internal(format!("classifier pattern: {e}")))
        };
        Ok(Self {
            code: build(CODE_PATTERNS)?,
            recall: build(RECALL_PATTERNS)?,
        })
    }

    /// Label a request. Never fails; missing or empty user text is `chat`.
    pub fn classify(&self, messages: &[Message], tools: &[ToolDefinition]) -> Classification {
        let label = self.label(messages, tools);
        debug!(intent = %label, "Intent classified");
        label
    }

    fn label(&self, messages: &[Message], tools: &[ToolDefinition]) -> Classification {
        if !tools.is_empty() || messages.last().is_some_and(Message::is_tool_structured) {
            return Classification::ToolUse;
        }

        let text = match last_user_text(messages) {
            Some(t) if !t.trim().is_empty() => t,
            _ => return Classification::Chat,
        };

        if self.code.is_match(text) {
            Classification::Code
        } else if self.recall.is_match(text) {
            Classification::Retrieval
        } else {
            Classification::Chat
        }
    }
}

#[async_trait]
impl Stage for IntentClassifier {
    fn name(&self) -> &'static str {
        "classifier"
    }

    async fn run(&self, mut ctx: RequestContext) -> Result<RequestContext> {
        // Computed once; later stages only read it
        if ctx.classification.is_none() {
            ctx.classification = Some(self.classify(&ctx.messages, &ctx.tools));
        }
        Ok(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctxgate_core::ToolCall;

    fn classify(text: &str) -> Classification {
        IntentClassifier::new()
            .unwrap()
            .classify(&[Message::user(text)], &[])
    }

    #[test]
    fn plain_conversation_is_chat() {
        assert_eq!(classify("How are you today?"), Classification::Chat);
        assert_eq!(classify("Tell me a story about a dragon"), Classification::Chat);
        assert_eq!(classify("A letter from my mom, yes/no?"), Classification::Chat);
    }

    #[test]
    fn code_heuristics() {
        assert_eq!(classify("```rust\nfn main() {}\n```"), Classification::Code);
        assert_eq!(classify("why does src/main.rs not build"), Classification::Code);
        assert_eq!(classify("explain lib.rs"), Classification::Code);
        assert_eq!(classify("def handler(event): what's wrong"), Classification::Code);
        assert_eq!(classify("I hit a bug in my parser"), Classification::Code);
        assert_eq!(classify("这个函数怎么写"), Classification::Code);
    }

    #[test]
    fn recall_cues() {
        assert_eq!(classify("Do you remember my cat's name?"), Classification::Retrieval);
        assert_eq!(classify("What did we decide about the trip?"), Classification::Retrieval);
        assert_eq!(classify("我们之前聊过什么"), Classification::Retrieval);
    }

    #[test]
    fn code_beats_retrieval() {
        assert_eq!(
            classify("remember the bug we fixed in config.toml?"),
            Classification::Code
        );
    }

    #[test]
    fn tools_beat_everything() {
        let classifier = IntentClassifier::new().unwrap();
        let tools = vec![ToolDefinition {
            name: "search".into(),
            description: String::new(),
            parameters: serde_json::json!({}),
        }];
        let label = classifier.classify(&[Message::user("```code``` remember")], &tools);
        assert_eq!(label, Classification::ToolUse);
    }

    #[test]
    fn trailing_tool_result_is_tool_use() {
        let classifier = IntentClassifier::new().unwrap();
        let messages = vec![
            Message::user("list files"),
            Message::assistant_tool_calls(vec![ToolCall {
                id: "c1".into(),
                name: "ls".into(),
                arguments: "{}".into(),
            }]),
            Message::tool_result("c1", "a.txt"),
        ];
        assert_eq!(classifier.classify(&messages, &[]), Classification::ToolUse);
    }

    #[test]
    fn missing_user_text_defaults_to_chat() {
        let classifier = IntentClassifier::new().unwrap();
        assert_eq!(
            classifier.classify(&[Message::system("be nice")], &[]),
            Classification::Chat
        );
        assert_eq!(classifier.classify(&[Message::user("   ")], &[]), Classification::Chat);
    }

    #[test]
    fn classification_is_idempotent() {
        let classifier = IntentClassifier::new().unwrap();
        let messages = vec![
            Message::system("sys"),
            Message::user("what did you say about rust earlier?"),
        ];
        let first = classifier.classify(&messages, &[]);
        for _ in 0..100 {
            assert_eq!(classifier.classify(&messages, &[]), first);
        }
    }
}
