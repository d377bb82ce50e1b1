//! Memory retriever: embed a query, search the index, format the hits.

use ctxgate_config::MemoryConfig;
use ctxgate_core::error::MemoryError;
use ctxgate_core::memory::{Embedder, MemoryIndex, ScoredRecord};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Per-record line in the injected memory block.
pub const DEFAULT_TEMPLATE: &str = "Relevant context from memory: {text}";

pub struct MemoryRetriever {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn MemoryIndex>,
    top_k: usize,
    similarity_threshold: f32,
    timeout: Duration,
}

impl MemoryRetriever {
    pub fn new(embedder: Arc<dyn Embedder>, index: Arc<dyn MemoryIndex>) -> Self {
        Self {
            embedder,
            index,
            top_k: 3,
            similarity_threshold: 0.5,
            timeout: Duration::from_millis(500),
        }
    }

    pub fn from_config(
        config: &MemoryConfig,
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn MemoryIndex>,
    ) -> Self {
        Self::new(embedder, index)
            .with_top_k(config.top_k)
            .with_similarity_threshold(config.similarity_threshold)
            .with_timeout(config.timeout())
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn with_similarity_threshold(mut self, threshold: f32) -> Self {
        self.similarity_threshold = threshold;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn index(&self) -> &Arc<dyn MemoryIndex> {
        &self.index
    }

    /// Records above the similarity threshold, best first.
    ///
    /// Embedding and search together are bounded by the configured timeout.
    pub async fn retrieve(&self, query: &str) -> Result<Vec<ScoredRecord>, MemoryError> {
        let lookup = async {
            let embedding = self.embedder.embed(query).await?;
            self.index.search(&embedding, self.top_k).await
        };

        let raw = tokio::time::timeout(self.timeout, lookup)
            .await
            .map_err(|_| MemoryError::Timeout(self.timeout.as_millis() as u64))??;

        let raw_count = raw.len();
        let filtered: Vec<ScoredRecord> = raw
            .into_iter()
            .filter(|r| r.score >= self.similarity_threshold)
            .collect();

        debug!(
            raw_results = raw_count,
            filtered_results = filtered.len(),
            "Memory search complete"
        );
        Ok(filtered)
    }

    /// Render hits as one newline-separated block, or `None` when empty.
    pub fn format_block(&self, records: &[ScoredRecord]) -> Option<String> {
        if records.is_empty() {
            return None;
        }
        let lines: Vec<String> = records
            .iter()
            .map(|r| DEFAULT_TEMPLATE.replace("{text}", &r.record.content))
            .collect();
        Some(lines.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::HashEmbedder;
    use crate::in_memory::InMemoryIndex;
    use async_trait::async_trait;

    struct SlowIndex;

    #[async_trait]
    impl MemoryIndex for SlowIndex {
        fn name(&self) -> &str {
            "slow"
        }

        async fn search(&self, _q: &[f32], _k: usize) -> Result<Vec<ScoredRecord>, MemoryError> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(Vec::new())
        }

        async fn count(&self) -> Result<usize, MemoryError> {
            Ok(0)
        }
    }

    async fn seeded() -> MemoryRetriever {
        let embedder = Arc::new(HashEmbedder::new(128));
        let index = Arc::new(InMemoryIndex::new(128));
        index
            .remember(embedder.as_ref(), "The staging database is Postgres 16")
            .await
            .unwrap();
        index
            .remember(embedder.as_ref(), "Lunch is served at noon on Fridays")
            .await
            .unwrap();
        MemoryRetriever::new(embedder, index).with_similarity_threshold(0.3)
    }

    #[tokio::test]
    async fn retrieves_relevant_records_only() {
        let retriever = seeded().await;
        let hits = retriever
            .retrieve("which postgres version is the staging database")
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].record.content.contains("Postgres"));
    }

    #[tokio::test]
    async fn formats_block_with_template() {
        let retriever = seeded().await;
        let hits = retriever.retrieve("staging database postgres").await.unwrap();
        assert_eq!(
            retriever.format_block(&hits).unwrap(),
            "Relevant context from memory: The staging database is Postgres 16"
        );
    }

    #[tokio::test]
    async fn no_hits_means_no_block() {
        let retriever = seeded().await;
        let hits = retriever.retrieve("quantum chromodynamics").await.unwrap();
        assert!(hits.is_empty());
        assert!(retriever.format_block(&hits).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_lookup_times_out() {
        let retriever = MemoryRetriever::new(Arc::new(HashEmbedder::new(8)), Arc::new(SlowIndex))
            .with_timeout(Duration::from_millis(100));
        let err = retriever.retrieve("anything").await.unwrap_err();
        assert!(matches!(err, MemoryError::Timeout(100)));
    }
}
