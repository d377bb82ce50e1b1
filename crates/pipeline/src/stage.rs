//! The common contract of the four pipeline stages.

use async_trait::async_trait;
use ctxgate_core::{Classification, Message, Result, ToolDefinition};

use crate::sliding_window::PendingTurn;

/// Per-request state threaded through the stages.
///
/// Each stage consumes the context and returns a new one; messages are
/// rebuilt, never edited in place.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    /// Sliding-window key for this conversation
    pub conversation_key: String,
    /// Messages as sanitized; the validator's reference copy
    pub original: Vec<Message>,
    /// Current working list
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    /// Set once by the classifier
    pub classification: Option<Classification>,
    pub memory_degraded: bool,
    /// Number of memory records injected
    pub memory_records: usize,
    /// Number of history messages replaced by the truncation marker
    pub truncated_messages: usize,
    pub tokens_before: usize,
    pub tokens_after: usize,
    pub tokens_saved: usize,
    /// Window update to apply once the exchange succeeds
    pub pending_turn: PendingTurn,
}

impl RequestContext {
    pub fn new(
        request_id: impl Into<String>,
        conversation_key: impl Into<String>,
        messages: Vec<Message>,
        tools: Vec<ToolDefinition>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            conversation_key: conversation_key.into(),
            original: Vec::new(),
            messages,
            tools,
            classification: None,
            memory_degraded: false,
            memory_records: 0,
            truncated_messages: 0,
            tokens_before: 0,
            tokens_after: 0,
            tokens_saved: 0,
            pending_turn: PendingTurn::default(),
        }
    }

    /// The classification, or `Chat` if the classifier has not run.
    pub fn classification(&self) -> Classification {
        self.classification.unwrap_or(Classification::Chat)
    }

    pub fn protected_count(&self) -> usize {
        self.original.iter().filter(|m| m.protected).count()
    }
}

/// One step of the fixed pipeline chain.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, ctx: RequestContext) -> Result<RequestContext>;
}
