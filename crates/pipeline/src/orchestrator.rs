//! Pipeline orchestrator: runs Sanitizer → Classifier → Assembler →
//! Validator and produces the traffic record.

use chrono::Utc;
use ctxgate_config::AppConfig;
use ctxgate_core::breaker::BreakerRegistry;
use ctxgate_core::event::{DomainEvent, EventBus};
use ctxgate_core::{Classification, ConversationRequest, Message, Result, Role, ToolDefinition};
use ctxgate_memory::MemoryRetriever;
use ctxgate_providers::{ResolvedRoute, UpstreamRequest};
use ctxgate_telemetry::TrafficRecord;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::assembler::ContextAssembler;
use crate::classifier::IntentClassifier;
use crate::sanitizer::Sanitizer;
use crate::sliding_window::{PendingTurn, WindowStore};
use crate::stage::{RequestContext, Stage};
use crate::validator::Validator;

/// Name of the breaker guarding memory lookups.
pub const MEMORY_BREAKER: &str = "memory";

/// A request after the pipeline, ready to be routed.
#[derive(Debug, Clone)]
pub struct AssembledRequest {
    pub request_id: String,
    pub conversation_key: String,
    /// Model as the client asked for it, possibly `provider:model`
    pub requested_model: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub stream: bool,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub tool_choice: Option<serde_json::Value>,
    pub classification: Classification,
    /// Window update for this exchange; see [`Pipeline::commit_turn`]
    pub pending_turn: PendingTurn,
}

impl AssembledRequest {
    /// The outbound request for `route`, with the provider prefix stripped.
    pub fn to_upstream(&self, route: &ResolvedRoute) -> UpstreamRequest {
        UpstreamRequest {
            model: route.model.clone(),
            messages: self.messages.clone(),
            tools: self.tools.clone(),
            stream: self.stream,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            tool_choice: self.tool_choice.clone(),
        }
    }
}

/// Sliding-window key: the client's conversation id, else a hash of the
/// first system and first user message.
pub fn conversation_key(request: &ConversationRequest) -> String {
    if let Some(id) = request.conversation_id.as_deref().filter(|id| !id.is_empty()) {
        return id.to_string();
    }
    let first = |role: Role| {
        request
            .messages
            .iter()
            .find(|m| m.role == role)
            .map(|m| m.content.as_str())
            .unwrap_or("")
    };
    let mut hasher = Sha256::new();
    hasher.update(first(Role::System).as_bytes());
    hasher.update([0u8]);
    hasher.update(first(Role::User).as_bytes());
    let digest = hasher.finalize();
    digest.iter().take(16).map(|b| format!("{b:02x}")).collect()
}

/// The four-stage chain. Cheap to share behind an `Arc`.
pub struct Pipeline {
    sanitizer: Sanitizer,
    classifier: IntentClassifier,
    assembler: ContextAssembler,
    validator: Validator,
    events: EventBus,
}

impl Pipeline {
    /// Build from config. `memory: None` turns retrieval off regardless of
    /// `[memory].enabled`.
    pub fn new(
        config: &AppConfig,
        memory: Option<MemoryRetriever>,
        breakers: &BreakerRegistry,
        events: EventBus,
    ) -> Result<Self> {
        let memory = memory.filter(|_| config.memory.enabled);
        let windows = Arc::new(WindowStore::new(config.pipeline.history_turns));
        let assembler = ContextAssembler::new(
            &config.pipeline,
            windows,
            memory,
            breakers.get_or_create(MEMORY_BREAKER),
            events.clone(),
        )?;
        Ok(Self {
            sanitizer: Sanitizer::new(config.pipeline.code_block_protect_chars),
            classifier: IntentClassifier::new()?,
            assembler,
            validator: Validator::new(),
            events,
        })
    }

    pub fn windows(&self) -> &Arc<WindowStore> {
        self.assembler.windows()
    }

    pub fn classifier(&self) -> &IntentClassifier {
        &self.classifier
    }

    /// Run the chain. Malformed input and integrity violations abort
    /// before anything is sent upstream.
    pub async fn process(
        &self,
        request: ConversationRequest,
    ) -> Result<(AssembledRequest, TrafficRecord)> {
        let started = Instant::now();
        let request_id = Uuid::new_v4().to_string();
        let key = conversation_key(&request);
        debug!(request_id = %request_id, model = %request.model, messages = request.messages.len(), "Pipeline start");

        let ConversationRequest {
            model,
            messages,
            tools,
            stream,
            temperature,
            max_tokens,
            tool_choice,
            ..
        } = request;

        let mut ctx = RequestContext::new(request_id.clone(), key.clone(), messages, tools);
        ctx = self.sanitizer.run(ctx).await?;
        ctx = self.classifier.run(ctx).await?;
        ctx = self.assembler.run(ctx).await?;
        ctx = self.validator.run(ctx).await?;

        let classification = ctx.classification();
        let latency_ms = started.elapsed().as_millis() as u64;

        info!(
            request_id = %request_id,
            intent = %classification,
            tokens_before = ctx.tokens_before,
            tokens_after = ctx.tokens_after,
            tokens_saved = ctx.tokens_saved,
            memory_degraded = ctx.memory_degraded,
            "Pipeline complete"
        );
        self.events.publish(DomainEvent::RequestProcessed {
            request_id: request_id.clone(),
            classification,
            tokens_saved: ctx.tokens_saved,
            timestamp: Utc::now(),
        });

        let record = TrafficRecord {
            request_id: request_id.clone(),
            timestamp: Utc::now(),
            // Filled in once the request is routed
            provider: String::new(),
            model: model.clone(),
            original_tokens: ctx.tokens_before,
            optimized_tokens: ctx.tokens_after,
            tokens_saved: ctx.tokens_saved,
            response_tokens: None,
            classification,
            latency_ms,
            memory_degraded: ctx.memory_degraded,
            optimization_applied: ctx.tokens_saved > 0,
        };

        let assembled = AssembledRequest {
            request_id,
            conversation_key: key,
            requested_model: model,
            messages: ctx.messages,
            tools: ctx.tools,
            stream,
            temperature,
            max_tokens,
            tool_choice,
            classification,
            pending_turn: ctx.pending_turn,
        };
        Ok((assembled, record))
    }

    /// Apply an exchange's window update once the upstream accepted it,
    /// along with the reply when it is already known.
    ///
    /// Requests that fail before or during dispatch never reach this, so
    /// the window only ever holds completed exchanges.
    pub async fn commit_turn(
        &self,
        conversation_key: &str,
        pending: PendingTurn,
        reply: Option<Message>,
    ) {
        let window = self.windows().window(conversation_key);
        let mut window = window.lock().await;
        window.commit(pending);
        if let Some(reply) = reply {
            window.record_reply(reply);
        }
    }

    /// Complete the current turn in the conversation's window.
    pub async fn record_reply(&self, conversation_key: &str, reply: Message) {
        let window = self.windows().window(conversation_key);
        window.lock().await.record_reply(reply);
    }
}
