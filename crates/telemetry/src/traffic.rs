//! Bounded traffic log: one record per proxied request.

use chrono::{DateTime, Utc};
use ctxgate_core::Classification;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use tracing::info;

/// What the pipeline did to one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficRecord {
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    /// Resolved provider id
    pub provider: String,
    /// Model as sent upstream
    pub model: String,
    /// Estimated tokens of the messages as received
    pub original_tokens: usize,
    /// Estimated tokens of the messages as forwarded
    pub optimized_tokens: usize,
    pub tokens_saved: usize,
    /// Estimated tokens of the upstream reply, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_tokens: Option<usize>,
    pub classification: Classification,
    /// Time spent in the pipeline plus the upstream call
    pub latency_ms: u64,
    pub memory_degraded: bool,
    pub optimization_applied: bool,
}

impl TrafficRecord {
    /// `provider:model` as the client would address it.
    pub fn route(&self) -> String {
        format!("{}:{}", self.provider, self.model)
    }

    /// Share of the original estimate that was removed, in percent.
    pub fn savings_pct(&self) -> f64 {
        self.tokens_saved as f64 / self.original_tokens.max(1) as f64 * 100.0
    }
}

/// Aggregates over the records currently held.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrafficStats {
    pub total_requests: usize,
    pub total_tokens_saved: usize,
    /// Mean of per-request savings percentages, one decimal
    pub avg_savings_pct: f64,
    /// Percentage of requests where optimization removed tokens, one decimal
    pub optimization_rate: f64,
    pub intent_distribution: BTreeMap<String, usize>,
    pub memory_degraded_count: usize,
    pub avg_latency_ms: f64,
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Ring buffer of traffic records. Oldest entries are dropped first.
pub struct TrafficLog {
    capacity: usize,
    records: Mutex<VecDeque<TrafficRecord>>,
}

impl TrafficLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            records: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<TrafficRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn append(&self, record: TrafficRecord) {
        info!(
            request_id = %record.request_id,
            route = %record.route(),
            original_tokens = record.original_tokens,
            optimized_tokens = record.optimized_tokens,
            tokens_saved = record.tokens_saved,
            savings_pct = round1(record.savings_pct()),
            intent = %record.classification,
            "Traffic recorded"
        );
        let mut records = self.lock();
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Up to `n` records, newest first.
    pub fn recent(&self, n: usize) -> Vec<TrafficRecord> {
        self.lock().iter().rev().take(n).cloned().collect()
    }

    pub fn stats(&self) -> TrafficStats {
        let records = self.lock();
        if records.is_empty() {
            return TrafficStats::default();
        }

        let total = records.len();
        let mut stats = TrafficStats {
            total_requests: total,
            ..TrafficStats::default()
        };
        let mut savings_sum = 0.0;
        let mut optimized = 0usize;
        let mut latency_sum = 0u64;

        for record in records.iter() {
            stats.total_tokens_saved += record.tokens_saved;
            savings_sum += record.savings_pct();
            if record.optimization_applied {
                optimized += 1;
            }
            if record.memory_degraded {
                stats.memory_degraded_count += 1;
            }
            latency_sum += record.latency_ms;
            *stats
                .intent_distribution
                .entry(record.classification.to_string())
                .or_insert(0) += 1;
        }

        stats.avg_savings_pct = round1(savings_sum / total as f64);
        stats.optimization_rate = round1(optimized as f64 / total as f64 * 100.0);
        stats.avg_latency_ms = round1(latency_sum as f64 / total as f64);
        stats
    }

    pub fn reset(&self) {
        self.lock().clear();
        info!("Traffic log reset");
    }
}

impl Default for TrafficLog {
    fn default() -> Self {
        Self::new(1000)
    }
}
