//! In-memory cosine index: brute-force search over a Vec.
//!
//! Readers share the lock; `replace_all` swaps the whole contents under a
//! single write so searches never observe a half-loaded index.

use async_trait::async_trait;
use ctxgate_core::error::MemoryError;
use ctxgate_core::memory::{Embedder, MemoryIndex, MemoryRecord, ScoredRecord};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::vector::rank_by_similarity;

pub struct InMemoryIndex {
    dimension: usize,
    records: Arc<RwLock<Vec<MemoryRecord>>>,
}

impl InMemoryIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            records: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    fn check_dimension(&self, record: &MemoryRecord) -> Result<(), MemoryError> {
        if record.embedding.len() != self.dimension {
            return Err(MemoryError::DimensionMismatch {
                expected: self.dimension,
                actual: record.embedding.len(),
            });
        }
        Ok(())
    }

    /// Insert a record, replacing any with the same id. Empty ids get a UUID.
    pub async fn add(&self, mut record: MemoryRecord) -> Result<String, MemoryError> {
        self.check_dimension(&record)?;
        if record.id.is_empty() {
            record.id = Uuid::new_v4().to_string();
        }
        let id = record.id.clone();
        let mut records = self.records.write().await;
        records.retain(|r| r.id != id);
        records.push(record);
        debug!(id = %id, total = records.len(), "Memory record added");
        Ok(id)
    }

    /// Embed `content` and store it under a fresh id.
    pub async fn remember(
        &self,
        embedder: &dyn Embedder,
        content: &str,
    ) -> Result<String, MemoryError> {
        let embedding = embedder.embed(content).await?;
        self.add(MemoryRecord::new(String::new(), content, embedding))
            .await
    }

    pub async fn delete(&self, id: &str) -> bool {
        let mut records = self.records.write().await;
        let len_before = records.len();
        records.retain(|r| r.id != id);
        records.len() < len_before
    }

    pub async fn get(&self, id: &str) -> Option<MemoryRecord> {
        self.records.read().await.iter().find(|r| r.id == id).cloned()
    }

    /// Atomically replace the whole index. Nothing changes if any record
    /// has the wrong dimension.
    pub async fn replace_all(&self, records: Vec<MemoryRecord>) -> Result<(), MemoryError> {
        for record in &records {
            self.check_dimension(record)?;
        }
        let count = records.len();
        *self.records.write().await = records;
        info!(count, "Memory index replaced");
        Ok(())
    }

    pub async fn clear(&self) {
        self.records.write().await.clear();
    }
}

#[async_trait]
impl MemoryIndex for InMemoryIndex {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn search(&self, query: &[f32], k: usize) -> Result<Vec<ScoredRecord>, MemoryError> {
        if query.len() != self.dimension {
            return Err(MemoryError::DimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            });
        }
        let records = self.records.read().await;
        Ok(rank_by_similarity(&records, query, k))
    }

    async fn count(&self) -> Result<usize, MemoryError> {
        Ok(self.records.read().await.len())
    }
}
