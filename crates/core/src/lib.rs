//! # ctxgate Core
//!
//! Domain types, traits, and error definitions for the ctxgate context proxy.
//! This crate has **no transport dependencies**; it defines the model that the
//! pipeline, memory, and provider crates implement against.
//!
//! ## Contents
//!
//! - Messages and conversation requests as they flow through the pipeline
//! - The approximate token estimator used for all size accounting
//! - The generic circuit breaker shared by the upstream and memory paths
//! - The memory retrieval contract (`Embedder`, `MemoryIndex`)
//! - A broadcast event bus for degradation and breaker events

pub mod breaker;
pub mod error;
pub mod event;
pub mod memory;
pub mod message;
pub mod token;

// Re-export key types at crate root for ergonomics
pub use breaker::{
    BreakerConfig, BreakerPermit, BreakerRegistry, BreakerRejected, BreakerSnapshot, BreakerState,
    CircuitBreaker,
};
pub use error::{Error, MemoryError, RegistryError, Result, UpstreamError};
pub use event::{DomainEvent, EventBus};
pub use memory::{Embedder, MemoryIndex, MemoryRecord, ScoredRecord};
pub use token::{estimate_message_tokens, estimate_messages_tokens, estimate_tokens};
pub use message::{
    Attachment, Classification, ConversationRequest, Message, Payload, Role, ToolCall,
    ToolDefinition,
};
