//! No-op index: disables memory injection entirely.

use async_trait::async_trait;
use ctxgate_core::error::MemoryError;
use ctxgate_core::memory::{MemoryIndex, ScoredRecord};

/// An index that holds nothing and finds nothing.
pub struct NoopIndex;

#[async_trait]
impl MemoryIndex for NoopIndex {
    fn name(&self) -> &str {
        "none"
    }

    async fn search(&self, _query: &[f32], _k: usize) -> Result<Vec<ScoredRecord>, MemoryError> {
        Ok(Vec::new())
    }

    async fn count(&self) -> Result<usize, MemoryError> {
        Ok(0)
    }
}
