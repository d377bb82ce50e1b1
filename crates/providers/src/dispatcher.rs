//! Upstream dispatcher: breaker-guarded forwarding of a rewritten request.
//!
//! One attempt per request. A failed call is reported to the provider's
//! breaker and surfaced to the caller; nothing here retries.

use ctxgate_config::ProviderConfig;
use ctxgate_core::breaker::BreakerRegistry;
use ctxgate_core::error::UpstreamError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::registry::ResolvedRoute;
use crate::upstream::{ChunkReceiver, Upstream, UpstreamRequest, UpstreamResponse};

/// What a dispatch produced.
#[derive(Debug)]
pub enum DispatchOutcome {
    Unary(UpstreamResponse),
    Stream(ChunkReceiver),
}

pub struct UpstreamDispatcher {
    upstream: Arc<dyn Upstream>,
    breakers: Arc<BreakerRegistry>,
    default_timeout: Duration,
}

impl UpstreamDispatcher {
    pub fn new(
        upstream: Arc<dyn Upstream>,
        breakers: Arc<BreakerRegistry>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            upstream,
            breakers,
            default_timeout,
        }
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    /// Per-provider timeout, else the dispatcher default.
    fn timeout_for(&self, provider: &ProviderConfig) -> Duration {
        provider
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout)
    }

    /// Forward `request` to the route's provider.
    ///
    /// The model on the wire is `route.model`, with the provider prefix
    /// already stripped. An open breaker fails fast with `Unavailable`.
    pub async fn dispatch(
        &self,
        route: &ResolvedRoute,
        mut request: UpstreamRequest,
    ) -> Result<DispatchOutcome, UpstreamError> {
        let provider = &route.provider;
        let breaker = self.breakers.get_or_create(&route.breaker_name());
        let permit = breaker.try_acquire().map_err(|rejected| {
            debug!(provider = %provider.id, "Upstream breaker rejected call");
            UpstreamError::Unavailable {
                provider: provider.id.clone(),
                reason: rejected.to_string(),
            }
        })?;

        request.model = route.model.clone();
        let timeout = self.timeout_for(provider);
        let timed_out = || UpstreamError::Timeout {
            provider: provider.id.clone(),
            timeout_secs: timeout.as_secs(),
        };

        if request.stream {
            // The permit covers opening the stream; later chunk errors are
            // the client's to handle.
            let opened = tokio::time::timeout(timeout, self.upstream.stream(provider, &request)).await;
            match opened {
                Ok(Ok(upstream_rx)) => {
                    permit.success();
                    Ok(DispatchOutcome::Stream(relay(upstream_rx, timeout, provider.id.clone())))
                }
                Ok(Err(e)) => {
                    permit.record(e.is_breaker_failure());
                    Err(e)
                }
                Err(_) => {
                    permit.failure();
                    warn!(provider = %provider.id, timeout_secs = timeout.as_secs(), "Upstream stream open timed out");
                    Err(timed_out())
                }
            }
        } else {
            let completed =
                tokio::time::timeout(timeout, self.upstream.complete(provider, &request)).await;
            match completed {
                Ok(Ok(response)) => {
                    permit.success();
                    Ok(DispatchOutcome::Unary(response))
                }
                Ok(Err(e)) => {
                    permit.record(e.is_breaker_failure());
                    Err(e)
                }
                Err(_) => {
                    permit.failure();
                    warn!(provider = %provider.id, timeout_secs = timeout.as_secs(), "Upstream call timed out");
                    Err(timed_out())
                }
            }
        }
    }
}

/// Forward chunks one at a time until `[DONE]`, an error, or the client
/// goes away. A gap longer than `idle` ends the stream as interrupted.
fn relay(mut upstream_rx: ChunkReceiver, idle: Duration, provider_id: String) -> ChunkReceiver {
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(async move {
        loop {
            let next = tokio::select! {
                _ = tx.closed() => {
                    debug!(provider = %provider_id, "Client disconnected, dropping upstream stream");
                    return;
                }
                next = tokio::time::timeout(idle, upstream_rx.recv()) => next,
            };
            match next {
                Ok(Some(Ok(chunk))) => {
                    let done = chunk.is_done();
                    if tx.send(Ok(chunk)).await.is_err() || done {
                        return;
                    }
                }
                Ok(Some(Err(e))) => {
                    warn!(provider = %provider_id, error = %e, "Upstream stream interrupted");
                    let _ = tx.send(Err(e)).await;
                    return;
                }
                Ok(None) => return,
                Err(_) => {
                    warn!(provider = %provider_id, idle_secs = idle.as_secs(), "Upstream stream stalled");
                    let _ = tx
                        .send(Err(UpstreamError::StreamInterrupted(format!(
                            "no data from '{provider_id}' for {}s",
                            idle.as_secs()
                        ))))
                        .await;
                    return;
                }
            }
        }
    });
    rx
}
