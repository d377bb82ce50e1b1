//! Memory retrieval contract: embedding and nearest-neighbour lookup.
//!
//! The proxy never writes memory on the request path. Records are loaded
//! by an operator (or a background job) and read here to enrich chat and
//! retrieval requests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MemoryError;

/// A single long-term memory record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Unique ID for this record
    pub id: String,

    /// The remembered text
    pub content: String,

    /// Embedding vector (stored alongside, never serialized to clients)
    #[serde(default, skip_serializing)]
    pub embedding: Vec<f32>,

    /// When this record was created
    pub created_at: DateTime<Utc>,

    /// Optional ranking weight, multiplied into the similarity score
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f32>,
}

impl MemoryRecord {
    pub fn new(id: impl Into<String>, content: impl Into<String>, embedding: Vec<f32>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            embedding,
            created_at: Utc::now(),
            weight: None,
        }
    }
}

/// A record returned from a similarity search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredRecord {
    pub record: MemoryRecord,
    /// Similarity after weighting, higher is closer
    pub score: f32,
}

/// Turns text into a vector. Model internals live outside the proxy.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Output dimension.
    fn dimension(&self) -> usize;

    async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, MemoryError>;
}

/// Read side of the vector index.
///
/// Implementations: in-memory cosine index, no-op.
#[async_trait]
pub trait MemoryIndex: Send + Sync {
    /// The index name (e.g., "in_memory", "none").
    fn name(&self) -> &str;

    /// Up to `k` records closest to `query`, best first.
    async fn search(
        &self,
        query: &[f32],
        k: usize,
    ) -> std::result::Result<Vec<ScoredRecord>, MemoryError>;

    /// Number of records held.
    async fn count(&self) -> std::result::Result<usize, MemoryError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_record_serialization_skips_embedding() {
        let record = MemoryRecord::new("mem_001", "The user prefers Rust over C++", vec![0.1, 0.2]);
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("Rust over C++"));
        assert!(!json.contains("embedding"));
    }
}
