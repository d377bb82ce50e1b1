//! Context assembler: rebuilds the outbound message list.
//!
//! Output layout:
//!
//! 1. **System** (eligible system messages, boilerplate removed)
//! 2. **Memory** (one system block of retrieved records, chat/retrieval only)
//! 3. **Truncation marker** (when older turns were dropped)
//! 4. **History + protected messages** (original relative order)
//! 5. **Final user message**
//!
//! Protected messages are copied through untouched. `tool_use` requests
//! are never truncated. Memory failures degrade to "no memory block".

use async_trait::async_trait;
use chrono::Utc;
use ctxgate_config::PipelineConfig;
use ctxgate_core::breaker::CircuitBreaker;
use ctxgate_core::event::{DomainEvent, EventBus};
use ctxgate_core::{Classification, Error, Message, Result, Role};
use ctxgate_memory::MemoryRetriever;
use regex::Regex;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::sliding_window::{PendingTurn, Turn, WindowStore, group_turns};
use crate::stage::{RequestContext, Stage};

// ── Types ─────────────────────────────────────────────────────────────────

/// Why memory was skipped for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryOutcome {
    /// Records were injected
    Injected(usize),
    /// Lookup ran but nothing cleared the similarity threshold
    NoMatch,
    /// Not attempted: disabled, intent without memory, or no query text
    Skipped,
    /// Breaker open, lookup error, or timeout
    Degraded(String),
}

/// Marker that stands in for dropped history.
pub fn truncation_marker(dropped_messages: usize) -> Message {
    Message::system(format!(
        "[{dropped_messages} earlier messages omitted from this conversation]"
    ))
}

// ── Assembler ─────────────────────────────────────────────────────────────

pub struct ContextAssembler {
    optimization_enabled: bool,
    boilerplate: Vec<Regex>,
    windows: Arc<WindowStore>,
    memory: Option<MemoryRetriever>,
    memory_breaker: Arc<CircuitBreaker>,
    events: EventBus,
}

impl ContextAssembler {
    /// `memory: None` disables retrieval entirely.
    pub fn new(
        config: &PipelineConfig,
        windows: Arc<WindowStore>,
        memory: Option<MemoryRetriever>,
        memory_breaker: Arc<CircuitBreaker>,
        events: EventBus,
    ) -> Result<Self> {
        let boilerplate = config
            .boilerplate_patterns
            .iter()
            .map(|p| {
                Regex::new(p)
                    .map_err(|e| Error::Internal(format!("invalid boilerplate pattern '{p}': {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            optimization_enabled: config.optimization_enabled,
            boilerplate,
            windows,
            memory,
            memory_breaker,
            events,
        })
    }

    pub fn windows(&self) -> &Arc<WindowStore> {
        &self.windows
    }

    /// Strip configured boilerplate from a system prompt.
    pub fn compress_system(&self, content: &str) -> String {
        let mut out = content.to_string();
        for pattern in &self.boilerplate {
            out = pattern.replace_all(&out, "").into_owned();
        }
        if out == content {
            return out;
        }
        // Collapse blank lines left behind by removed segments
        out.lines()
            .map(str::trim_end)
            .filter(|l| !l.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string()
    }

    /// Look up memory for `query`, reporting the outcome to the breaker.
    async fn lookup_memory(&self, query: &str) -> (Option<Message>, MemoryOutcome) {
        let Some(retriever) = &self.memory else {
            return (None, MemoryOutcome::Skipped);
        };
        if query.trim().is_empty() {
            return (None, MemoryOutcome::Skipped);
        }

        let permit = match self.memory_breaker.try_acquire() {
            Ok(permit) => permit,
            Err(rejected) => return (None, MemoryOutcome::Degraded(rejected.to_string())),
        };

        match retriever.retrieve(query).await {
            Ok(records) => {
                permit.success();
                match retriever.format_block(&records) {
                    Some(block) => (Some(Message::system(block)), MemoryOutcome::Injected(records.len())),
                    None => (None, MemoryOutcome::NoMatch),
                }
            }
            Err(e) => {
                permit.failure();
                (None, MemoryOutcome::Degraded(e.to_string()))
            }
        }
    }

    fn record_degradation(&self, ctx: &mut RequestContext, reason: &str) {
        warn!(request_id = %ctx.request_id, reason, "Memory degraded, continuing without memory");
        ctx.memory_degraded = true;
        self.events.publish(DomainEvent::MemoryDegraded {
            request_id: ctx.request_id.clone(),
            reason: reason.to_string(),
            timestamp: Utc::now(),
        });
    }

    /// Build the outbound list for `ctx`.
    pub async fn assemble(&self, mut ctx: RequestContext) -> Result<RequestContext> {
        let classification = ctx.classification();
        let capacity = self.windows.capacity();

        let input = ctx.messages.clone();
        let final_user = match input.last() {
            Some(last) if last.role == Role::User => Some(last.clone()),
            _ => None,
        };
        let body_len = input.len() - usize::from(final_user.is_some());
        let body = &input[..body_len];

        if !self.optimization_enabled {
            debug!(request_id = %ctx.request_id, "Optimization disabled, passing messages through");
            ctx.pending_turn.turn = final_user.map(Turn::new);
            return Ok(ctx);
        }

        // ── 1. Partition ──────────────────────────────────────────────────
        let mut system: Vec<Message> = Vec::new();
        let mut history: Vec<Message> = Vec::new();
        for message in body {
            if message.role == Role::System && !message.protected {
                system.push(message.clone());
            } else {
                history.push(message.clone());
            }
        }

        // ── 2. Compress eligible system content ───────────────────────────
        let system: Vec<Message> = system
            .into_iter()
            .filter_map(|m| {
                let compressed = self.compress_system(&m.content);
                if compressed.is_empty() && !m.content.is_empty() {
                    None
                } else {
                    Some(Message::system(compressed))
                }
            })
            .collect();

        // ── 3. Truncate to the window capacity (in turns) ─────────────────
        let mut turns = group_turns(&history);
        let mut marker = None;
        if classification != Classification::ToolUse && turns.len() > capacity {
            let excess = turns.len() - capacity;
            let mut dropped = 0;
            let mut kept_protected = Vec::new();
            for turn in turns.drain(..excess) {
                for message in turn.messages {
                    if message.protected {
                        kept_protected.push(message);
                    } else {
                        dropped += 1;
                    }
                }
            }
            if dropped > 0 {
                marker = Some(truncation_marker(dropped));
                ctx.truncated_messages = dropped;
            }
            // Protected messages from dropped turns survive in place
            if !kept_protected.is_empty() {
                turns.insert(
                    0,
                    Turn {
                        messages: kept_protected,
                    },
                );
            }
        }

        // ── 4. Memory ─────────────────────────────────────────────────────
        let mut memory_block = None;
        if classification.wants_memory() {
            let query = final_user
                .as_ref()
                .map(|m| m.content.as_str())
                .or_else(|| ctxgate_core::message::last_user_text(&input))
                .unwrap_or("");
            let (block, outcome) = self.lookup_memory(query).await;
            match outcome {
                MemoryOutcome::Injected(n) => ctx.memory_records = n,
                MemoryOutcome::Degraded(reason) => self.record_degradation(&mut ctx, &reason),
                MemoryOutcome::NoMatch | MemoryOutcome::Skipped => {}
            }
            memory_block = block;
        }

        // ── 5. Re-assemble ────────────────────────────────────────────────
        let retained_history: Vec<Message> = turns.into_iter().flat_map(|t| t.messages).collect();
        let mut messages = Vec::with_capacity(input.len() + 2);
        messages.extend(system);
        messages.extend(memory_block);
        messages.extend(marker);
        messages.extend(retained_history.iter().cloned());
        messages.extend(final_user.clone());

        // ── Window update, applied by the caller after dispatch ───────────
        ctx.pending_turn = PendingTurn {
            seed: group_turns(&retained_history),
            turn: final_user.map(Turn::new),
        };

        info!(
            request_id = %ctx.request_id,
            intent = %classification,
            original = input.len(),
            optimized = messages.len(),
            truncated = ctx.truncated_messages,
            memory_records = ctx.memory_records,
            "Context assembled"
        );
        ctx.messages = messages;
        Ok(ctx)
    }
}

#[async_trait]
impl Stage for ContextAssembler {
    fn name(&self) -> &'static str {
        "assembler"
    }

    async fn run(&self, ctx: RequestContext) -> Result<RequestContext> {
        self.assemble(ctx).await
    }
}
