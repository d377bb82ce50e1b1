//! Traffic accounting and logging for ctxgate.
//!
//! Every request that passes the pipeline leaves a [`TrafficRecord`] in a
//! bounded ring buffer. [`TrafficLog::stats`] aggregates token savings,
//! optimization rate, and the intent mix over whatever the buffer holds.

pub mod logging;
pub mod traffic;

pub use logging::init_logging;
pub use traffic::{TrafficLog, TrafficRecord, TrafficStats};

/// Errors from the telemetry subsystem.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("invalid log filter '{filter}': {reason}")]
    InvalidFilter { filter: String, reason: String },

    #[error("logging already initialized: {0}")]
    AlreadyInitialized(String),
}
