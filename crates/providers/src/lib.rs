//! Provider routing and upstream forwarding for ctxgate.
//!
//! - [`registry`]: provider id → configuration, default provider, and
//!   `provider:model` resolution
//! - [`templates`]: presets for well-known OpenAI-compatible providers
//! - [`dispatcher`]: breaker-guarded unary and streaming forwarding
//! - [`openai_compat`]: the `reqwest` client for `/chat/completions`

pub mod dispatcher;
pub mod openai_compat;
pub mod registry;
pub mod templates;
pub mod upstream;

pub use dispatcher::{DispatchOutcome, UpstreamDispatcher};
pub use openai_compat::OpenAiCompatUpstream;
pub use registry::{ProviderRegistry, ProviderSummary, ProviderUpdate, RegistrySnapshot, ResolvedRoute};
pub use templates::{ProviderTemplate, TEMPLATES, template};
pub use upstream::{ChunkReceiver, StreamChunk, Upstream, UpstreamRequest, UpstreamResponse};
