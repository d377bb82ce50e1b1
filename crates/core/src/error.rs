//! Error types for the ctxgate domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error enum; the top-level [`Error`]
//! wraps them and knows which status a transport should surface.

use thiserror::Error;

/// The top-level error type for all ctxgate operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The inbound request failed structural validation.
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    /// A protected message was altered, dropped, or reordered by a stage.
    #[error("Integrity violation: {0}")]
    IntegrityViolation(String),

    // --- Provider registry errors ---
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    // --- Upstream errors ---
    #[error("Upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    // --- Memory errors ---
    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP-style status a transport should use when reporting this error.
    ///
    /// Upstream availability problems map to 503/504 so callers can tell
    /// "try another provider" apart from "fix your input" (400).
    pub fn status_code(&self) -> u16 {
        match self {
            Self::MalformedRequest(_) | Self::Serialization(_) => 400,
            Self::IntegrityViolation(_) | Self::Internal(_) | Self::Memory(_) => 500,
            Self::Registry(e) => e.status_code(),
            Self::Upstream(e) => e.status_code(),
        }
    }
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("Provider already exists: {0}")]
    DuplicateProvider(String),

    #[error("Provider not found: {0}")]
    NotFound(String),

    #[error("Cannot remove the default provider: {0}")]
    CannotRemoveDefault(String),

    #[error("No default provider configured")]
    NoDefaultProvider,

    #[error("Model '{model}' is not allowed for provider '{provider}'")]
    ModelNotAllowed { provider: String, model: String },

    #[error("Provider is disabled: {0}")]
    ProviderDisabled(String),

    #[error("Invalid registry contents: {0}")]
    Invalid(String),
}

impl RegistryError {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::DuplicateProvider(_) | Self::CannotRemoveDefault(_) => 409,
            Self::ModelNotAllowed { .. } | Self::Invalid(_) => 400,
            Self::NoDefaultProvider | Self::ProviderDisabled(_) => 503,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum UpstreamError {
    /// The breaker rejected the call; no upstream I/O took place.
    #[error("Upstream unavailable ({provider}): {reason}")]
    Unavailable { provider: String, reason: String },

    #[error("Upstream '{provider}' timed out after {timeout_secs}s")]
    Timeout { provider: String, timeout_secs: u64 },

    /// The upstream answered with a non-success status.
    #[error("Upstream returned status {status_code}: {message}")]
    Status { status_code: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),
}

impl UpstreamError {
    /// Whether this outcome counts against the upstream's circuit breaker.
    ///
    /// Server-side failures and timeouts count; client errors (4xx) do not,
    /// since they say nothing about the upstream's health.
    pub fn is_breaker_failure(&self) -> bool {
        match self {
            Self::Status { status_code, .. } => *status_code >= 500,
            Self::Timeout { .. } | Self::Network(_) | Self::StreamInterrupted(_) => true,
            Self::Unavailable { .. } => false,
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::Unavailable { .. } => 503,
            Self::Timeout { .. } => 504,
            Self::Status { status_code, .. } => *status_code,
            Self::Network(_) | Self::StreamInterrupted(_) => 502,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum MemoryError {
    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),

    #[error("Index query failed: {0}")]
    QueryFailed(String),

    #[error("Memory lookup timed out after {0}ms")]
    Timeout(u64),

    #[error("Memory breaker is open")]
    BreakerOpen,

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}
