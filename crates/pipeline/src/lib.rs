//! # ctxgate Pipeline
//!
//! The context pipeline every request passes before it reaches an
//! upstream model:
//!
//! ```text
//! Sanitizer → IntentClassifier → ContextAssembler → Validator
//! ```
//!
//! [`ContextProxy`] wraps the pipeline together with provider routing,
//! breaker-guarded dispatch, and traffic accounting. It is the single
//! entry point a transport layer needs.

pub mod assembler;
pub mod classifier;
pub mod orchestrator;
pub mod proxy;
pub mod sanitizer;
pub mod sliding_window;
pub mod stage;
pub mod validator;

pub use assembler::{ContextAssembler, MemoryOutcome, truncation_marker};
pub use classifier::IntentClassifier;
pub use orchestrator::{AssembledRequest, MEMORY_BREAKER, Pipeline, conversation_key};
pub use proxy::{ContextProxy, MemoryBackend, ProxyResponse};
pub use sanitizer::{Sanitizer, parse_request};
pub use sliding_window::{PendingTurn, SlidingWindow, Turn, WindowStore, group_turns};
pub use stage::{RequestContext, Stage};
pub use validator::{Savings, Validator};
