//! Circuit breaker: one parameterized state machine per named resource.
//!
//! ```text
//! closed ──(threshold consecutive failures)──▶ open
//!   ▲                                            │
//!   │                              (open duration elapsed,
//!   │                                next attempt)
//!   │                                            ▼
//!   └────────(trial succeeds)──────────── half_open ──(trial fails)──▶ open
//! ```
//!
//! Callers obtain a [`BreakerPermit`] before touching the resource and
//! resolve it with [`BreakerPermit::success`] or [`BreakerPermit::failure`].
//! What counts as a failure is the caller's decision. Dropping an unresolved
//! half-open trial permit frees the trial slot without changing state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::event::{DomainEvent, EventBus};

// ── Types ─────────────────────────────────────────────────────────────────

/// Breaker tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before a trial is allowed.
    pub open_duration: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        })
    }
}

/// Returned by [`CircuitBreaker::try_acquire`] when the call must not proceed.
#[derive(Debug, Clone, thiserror::Error)]
#[error("circuit '{name}' is {state}")]
pub struct BreakerRejected {
    pub name: String,
    pub state: BreakerState,
}

/// Point-in-time view of a breaker for introspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub open_duration_secs: u64,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub total_successes: u64,
    pub total_failures: u64,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    trial_in_flight: bool,
    total_successes: u64,
    total_failures: u64,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            last_failure_at: None,
            trial_in_flight: false,
            total_successes: 0,
            total_failures: 0,
        }
    }
}

// ── Breaker ───────────────────────────────────────────────────────────────

pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
    events: Option<EventBus>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner::new()),
            events: None,
        }
    }

    /// Publish state transitions on the given bus.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> BreakerConfig {
        self.config
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current state as last recorded.
    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// Whether a call would currently be admitted, without claiming a slot.
    pub fn is_call_permitted(&self) -> bool {
        let inner = self.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => inner
                .opened_at
                .is_some_and(|at| at.elapsed() >= self.config.open_duration),
            BreakerState::HalfOpen => !inner.trial_in_flight,
        }
    }

    /// Ask to call the guarded resource.
    ///
    /// In half-open state exactly one caller gets a trial permit; everyone
    /// else is rejected until that trial resolves.
    pub fn try_acquire(self: &Arc<Self>) -> Result<BreakerPermit, BreakerRejected> {
        let mut transition = None;
        let result = {
            let mut inner = self.lock();
            match inner.state {
                BreakerState::Closed => Ok(false),
                BreakerState::Open => {
                    let elapsed = inner
                        .opened_at
                        .is_some_and(|at| at.elapsed() >= self.config.open_duration);
                    if elapsed {
                        inner.state = BreakerState::HalfOpen;
                        inner.trial_in_flight = true;
                        transition = Some((BreakerState::Open, BreakerState::HalfOpen));
                        Ok(true)
                    } else {
                        Err(BreakerState::Open)
                    }
                }
                BreakerState::HalfOpen => {
                    if inner.trial_in_flight {
                        Err(BreakerState::HalfOpen)
                    } else {
                        inner.trial_in_flight = true;
                        Ok(true)
                    }
                }
            }
        };

        if let Some((from, to)) = transition {
            self.announce(from, to);
        }

        match result {
            Ok(trial) => Ok(BreakerPermit {
                breaker: Arc::clone(self),
                trial,
                resolved: false,
            }),
            Err(state) => {
                debug!(breaker = %self.name, %state, "Call rejected by circuit breaker");
                Err(BreakerRejected {
                    name: self.name.clone(),
                    state,
                })
            }
        }
    }

    fn on_success(&self, trial: bool) {
        let transition = {
            let mut inner = self.lock();
            inner.total_successes += 1;
            match inner.state {
                BreakerState::HalfOpen if trial => {
                    inner.state = BreakerState::Closed;
                    inner.consecutive_failures = 0;
                    inner.opened_at = None;
                    inner.trial_in_flight = false;
                    Some((BreakerState::HalfOpen, BreakerState::Closed))
                }
                BreakerState::Closed => {
                    inner.consecutive_failures = 0;
                    None
                }
                // A call admitted before the circuit opened; it does not
                // speak for the trial.
                _ => None,
            }
        };
        if let Some((from, to)) = transition {
            self.announce(from, to);
        }
    }

    fn on_failure(&self, trial: bool) {
        let transition = {
            let mut inner = self.lock();
            inner.total_failures += 1;
            inner.last_failure_at = Some(Utc::now());
            match inner.state {
                BreakerState::HalfOpen if trial => {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                    inner.trial_in_flight = false;
                    Some((BreakerState::HalfOpen, BreakerState::Open))
                }
                BreakerState::Closed => {
                    inner.consecutive_failures += 1;
                    if inner.consecutive_failures >= self.config.failure_threshold {
                        inner.state = BreakerState::Open;
                        inner.opened_at = Some(Instant::now());
                        Some((BreakerState::Closed, BreakerState::Open))
                    } else {
                        None
                    }
                }
                _ => None,
            }
        };
        if let Some((from, to)) = transition {
            self.announce(from, to);
        }
    }

    fn release_trial(&self) {
        let mut inner = self.lock();
        if inner.state == BreakerState::HalfOpen {
            inner.trial_in_flight = false;
        }
    }

    /// Force the breaker back to closed with a clean counter.
    pub fn reset(&self) {
        let previous = {
            let mut inner = self.lock();
            let previous = inner.state;
            inner.state = BreakerState::Closed;
            inner.consecutive_failures = 0;
            inner.opened_at = None;
            inner.trial_in_flight = false;
            previous
        };
        info!(breaker = %self.name, "Circuit breaker reset");
        if previous != BreakerState::Closed {
            self.announce(previous, BreakerState::Closed);
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            failure_threshold: self.config.failure_threshold,
            open_duration_secs: self.config.open_duration.as_secs(),
            last_failure_at: inner.last_failure_at,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
        }
    }

    fn announce(&self, from: BreakerState, to: BreakerState) {
        warn!(breaker = %self.name, %from, %to, "Circuit breaker state changed");
        if let Some(events) = &self.events {
            events.publish(DomainEvent::BreakerStateChanged {
                name: self.name.clone(),
                from,
                to,
                timestamp: Utc::now(),
            });
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

/// Admission ticket for one call through a breaker.
#[must_use = "resolve the permit with success() or failure()"]
pub struct BreakerPermit {
    breaker: Arc<CircuitBreaker>,
    trial: bool,
    resolved: bool,
}

impl BreakerPermit {
    /// Whether this permit is the single half-open trial.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.resolved = true;
        self.breaker.on_success(self.trial);
    }

    pub fn failure(mut self) {
        self.resolved = true;
        self.breaker.on_failure(self.trial);
    }

    /// Resolve with a caller-supplied verdict.
    pub fn record(self, failed: bool) {
        if failed {
            self.failure();
        } else {
            self.success();
        }
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.resolved && self.trial {
            self.breaker.release_trial();
        }
    }
}

// ── Registry ──────────────────────────────────────────────────────────────

/// Name-keyed collection of breakers sharing one default configuration.
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    events: Option<EventBus>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<CircuitBreaker>>> {
        self.breakers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fetch the breaker for `name`, creating it with the default config.
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_or_create_with(name, self.config)
    }

    /// Fetch the breaker for `name`, creating it with `config` if absent.
    /// An existing breaker keeps its original config.
    pub fn get_or_create_with(&self, name: &str, config: BreakerConfig) -> Arc<CircuitBreaker> {
        let mut breakers = self.lock();
        Arc::clone(breakers.entry(name.to_string()).or_insert_with(|| {
            debug!(breaker = %name, "Creating circuit breaker");
            let breaker = CircuitBreaker::new(name, config);
            Arc::new(match &self.events {
                Some(events) => breaker.with_events(events.clone()),
                None => breaker,
            })
        }))
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.lock().get(name).cloned()
    }

    /// Snapshots of every breaker, sorted by name.
    pub fn list(&self) -> Vec<BreakerSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> = self.lock().values().cloned().collect();
        let mut snapshots: Vec<BreakerSnapshot> = breakers.iter().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    /// Reset one breaker. Returns false if no breaker has that name.
    pub fn reset(&self, name: &str) -> bool {
        match self.get(name) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    pub fn reset_all(&self) {
        let breakers: Vec<Arc<CircuitBreaker>> = self.lock().values().cloned().collect();
        for breaker in breakers {
            breaker.reset();
        }
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, open_secs: u64) -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(
            "test",
            BreakerConfig {
                failure_threshold: threshold,
                open_duration: Duration::from_secs(open_secs),
            },
        ))
    }

    fn fail(b: &Arc<CircuitBreaker>) {
        b.try_acquire().unwrap().failure();
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_consecutive_failures() {
        let b = breaker(3, 10);
        fail(&b);
        fail(&b);
        assert_eq!(b.state(), BreakerState::Closed);
        fail(&b);
        assert_eq!(b.state(), BreakerState::Open);
        assert!(b.try_acquire().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn success_in_closed_resets_counter() {
        let b = breaker(3, 10);
        fail(&b);
        fail(&b);
        b.try_acquire().unwrap().success();
        assert_eq!(b.consecutive_failures(), 0);
        fail(&b);
        fail(&b);
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_trial_success_closes() {
        let b = breaker(3, 10);
        for _ in 0..3 {
            fail(&b);
        }
        tokio::time::advance(Duration::from_secs(11)).await;

        let trial = b.try_acquire().unwrap();
        assert!(trial.is_trial());
        assert_eq!(b.state(), BreakerState::HalfOpen);
        trial.success();

        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(b.consecutive_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_trial_failure_reopens_and_resets_clock() {
        let b = breaker(3, 10);
        for _ in 0..3 {
            fail(&b);
        }
        tokio::time::advance(Duration::from_secs(11)).await;
        b.try_acquire().unwrap().failure();
        assert_eq!(b.state(), BreakerState::Open);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(b.try_acquire().is_err());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(b.try_acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn only_one_half_open_trial_admitted() {
        let b = breaker(1, 1);
        fail(&b);
        tokio::time::advance(Duration::from_secs(2)).await;

        let first = b.try_acquire();
        let second = b.try_acquire();
        assert!(first.is_ok());
        let rejected = second.err().unwrap();
        assert_eq!(rejected.state, BreakerState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_trial_frees_the_slot() {
        let b = breaker(1, 1);
        fail(&b);
        tokio::time::advance(Duration::from_secs(2)).await;

        drop(b.try_acquire().unwrap());
        assert_eq!(b.state(), BreakerState::HalfOpen);
        assert!(b.try_acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_trials_admit_exactly_one() {
        let b = breaker(1, 1);
        fail(&b);
        tokio::time::advance(Duration::from_secs(2)).await;

        let mut handles = Vec::new();
        for _ in 0..16 {
            let b = Arc::clone(&b);
            handles.push(tokio::spawn(async move {
                // Hold the permit so no other task can re-take the slot.
                b.try_acquire().map(std::mem::forget).is_ok()
            }));
        }
        let mut admitted = 0;
        for h in handles {
            if h.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_closes_and_publishes() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let b = Arc::new(
            CircuitBreaker::new(
                "upstream:kimi",
                BreakerConfig {
                    failure_threshold: 1,
                    open_duration: Duration::from_secs(60),
                },
            )
            .with_events(bus),
        );

        fail(&b);
        b.reset();
        assert_eq!(b.state(), BreakerState::Closed);

        let opened = rx.recv().await.unwrap();
        assert!(matches!(
            opened.as_ref(),
            DomainEvent::BreakerStateChanged { to: BreakerState::Open, .. }
        ));
        let closed = rx.recv().await.unwrap();
        assert!(matches!(
            closed.as_ref(),
            DomainEvent::BreakerStateChanged { to: BreakerState::Closed, .. }
        ));
    }

    #[test]
    fn snapshot_counts_totals() {
        let b = breaker(5, 60);
        b.try_acquire().unwrap().success();
        b.try_acquire().unwrap().failure();
        b.try_acquire().unwrap().record(false);

        let snap = b.snapshot();
        assert_eq!(snap.total_successes, 2);
        assert_eq!(snap.total_failures, 1);
        assert_eq!(snap.consecutive_failures, 0);
        assert!(snap.last_failure_at.is_some());
    }

    #[test]
    fn registry_reuses_and_lists_breakers() {
        let registry = BreakerRegistry::default();
        let a = registry.get_or_create("upstream:openai");
        let again = registry.get_or_create("upstream:openai");
        assert!(Arc::ptr_eq(&a, &again));

        registry.get_or_create("memory");
        let names: Vec<String> = registry.list().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["memory", "upstream:openai"]);
    }

    #[test]
    fn registry_reset_all() {
        let registry = BreakerRegistry::new(BreakerConfig {
            failure_threshold: 1,
            open_duration: Duration::from_secs(60),
        });
        registry.get_or_create("memory").try_acquire().unwrap().failure();
        registry.get_or_create("upstream:x").try_acquire().unwrap().failure();
        assert!(registry.list().iter().all(|s| s.state == BreakerState::Open));

        registry.reset_all();
        assert!(registry.list().iter().all(|s| s.state == BreakerState::Closed));
        assert!(!registry.reset("missing"));
    }
}
