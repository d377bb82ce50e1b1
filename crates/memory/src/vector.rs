//! Vector similarity utilities.

use ctxgate_core::memory::{MemoryRecord, ScoredRecord};

/// Compute cosine similarity between two vectors.
///
/// Returns a value in [-1, 1] where 1 = identical, 0 = orthogonal, -1 = opposite.
/// Returns 0.0 if either vector is zero-length or empty.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;

    for (x, y) in a.iter().zip(b.iter()) {
        let x = *x as f64;
        let y = *y as f64;
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < 1e-10 {
        return 0.0;
    }

    (dot / denom) as f32
}

/// Rank records by weighted cosine similarity to a query embedding.
///
/// Returns at most `limit` records, best first. Records without an
/// embedding are skipped.
pub fn rank_by_similarity(
    records: &[MemoryRecord],
    query_embedding: &[f32],
    limit: usize,
) -> Vec<ScoredRecord> {
    let mut scored: Vec<ScoredRecord> = records
        .iter()
        .filter(|r| !r.embedding.is_empty())
        .map(|record| {
            let sim = cosine_similarity(&record.embedding, query_embedding);
            ScoredRecord {
                score: sim * record.weight.unwrap_or(1.0),
                record: record.clone(),
            }
        })
        .collect();

    scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(limit);
    scored
}
