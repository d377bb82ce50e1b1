//! `ContextProxy`: one handle over pipeline, routing, dispatch, and
//! traffic accounting. A transport layer holds one of these and calls
//! [`ContextProxy::handle`] per request.

use ctxgate_config::AppConfig;
use ctxgate_core::breaker::BreakerRegistry;
use ctxgate_core::event::EventBus;
use ctxgate_core::memory::{Embedder, MemoryIndex};
use ctxgate_core::token::estimate_tokens;
use ctxgate_core::{ConversationRequest, Error, Message, Result};
use ctxgate_memory::MemoryRetriever;
use ctxgate_providers::{
    ChunkReceiver, DispatchOutcome, ProviderRegistry, ResolvedRoute, Upstream, UpstreamDispatcher,
    UpstreamResponse,
};
use ctxgate_telemetry::{TrafficLog, TrafficRecord};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::orchestrator::Pipeline;

/// What the caller relays back to its client.
#[derive(Debug)]
pub enum ProxyResponse {
    Unary(UpstreamResponse),
    Stream(ChunkReceiver),
}

/// Optional memory backend for [`ContextProxy::new`].
pub struct MemoryBackend {
    pub embedder: Arc<dyn Embedder>,
    pub index: Arc<dyn MemoryIndex>,
}

pub struct ContextProxy {
    pipeline: Arc<Pipeline>,
    registry: Arc<ProviderRegistry>,
    dispatcher: UpstreamDispatcher,
    traffic: Arc<TrafficLog>,
    events: EventBus,
}

impl ContextProxy {
    pub fn new(
        config: &AppConfig,
        upstream: Arc<dyn Upstream>,
        memory: Option<MemoryBackend>,
    ) -> Result<Self> {
        let events = EventBus::default();
        let breakers = Arc::new(
            BreakerRegistry::new(config.breaker.to_breaker_config()).with_events(events.clone()),
        );
        let retriever = memory.map(|backend| {
            MemoryRetriever::from_config(&config.memory, backend.embedder, backend.index)
        });
        let pipeline = Pipeline::new(config, retriever, &breakers, events.clone())?;
        let registry = ProviderRegistry::from_config(config)?;
        let dispatcher = UpstreamDispatcher::new(
            upstream,
            Arc::clone(&breakers),
            Duration::from_secs(config.upstream.timeout_secs),
        );

        info!(
            providers = registry.list().len(),
            memory = config.memory.enabled,
            "Context proxy ready"
        );
        Ok(Self {
            pipeline: Arc::new(pipeline),
            registry: Arc::new(registry),
            dispatcher,
            traffic: Arc::new(TrafficLog::new(config.traffic.capacity)),
            events,
        })
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        self.dispatcher.breakers()
    }

    pub fn traffic(&self) -> &Arc<TrafficLog> {
        &self.traffic
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Swap in the providers from a reloaded config. In-flight requests
    /// keep the route they already resolved.
    pub fn apply_config(&self, config: &AppConfig) -> Result<()> {
        self.registry.apply_config(config)?;
        info!("Provider registry reloaded");
        Ok(())
    }

    /// Process, route, and forward one request.
    ///
    /// The conversation window only changes once dispatch succeeds. Unary
    /// replies are recorded before returning; streamed replies are recorded
    /// when the stream ends or the client goes away.
    pub async fn handle(&self, request: ConversationRequest) -> Result<ProxyResponse> {
        let started = Instant::now();
        let (mut assembled, mut record) = self.pipeline.process(request).await?;

        let route = self.registry.resolve(&assembled.requested_model)?;
        record.provider = route.provider_id().to_string();
        record.model = route.model.clone();
        debug!(request_id = %assembled.request_id, route = %record.route(), "Request routed");

        let outcome = self
            .dispatcher
            .dispatch(&route, assembled.to_upstream(&route))
            .await
            .inspect_err(|e| {
                warn!(request_id = %assembled.request_id, route = %record.route(), error = %e, "Upstream call failed");
            })?;

        let pending = std::mem::take(&mut assembled.pending_turn);
        match outcome {
            DispatchOutcome::Unary(response) => {
                let reply = response.content().map(|content| {
                    record.response_tokens = Some(estimate_tokens(content));
                    Message::assistant(content)
                });
                self.pipeline
                    .commit_turn(&assembled.conversation_key, pending, reply)
                    .await;
                record.latency_ms = started.elapsed().as_millis() as u64;
                self.traffic.append(record);
                Ok(ProxyResponse::Unary(response))
            }
            DispatchOutcome::Stream(upstream_rx) => {
                self.pipeline
                    .commit_turn(&assembled.conversation_key, pending, None)
                    .await;
                Ok(ProxyResponse::Stream(self.tap_stream(
                    upstream_rx,
                    assembled.conversation_key,
                    record,
                    started,
                )))
            }
        }
    }

    /// Resolve without dispatching, for management views.
    pub fn resolve(&self, model: &str) -> Result<ResolvedRoute> {
        self.registry.resolve(model).map_err(Error::from)
    }

    /// Pass chunks through unchanged while collecting the reply text.
    fn tap_stream(
        &self,
        mut upstream_rx: ChunkReceiver,
        conversation_key: String,
        mut record: TrafficRecord,
        started: Instant,
    ) -> ChunkReceiver {
        let (tx, rx) = mpsc::channel(1);
        let pipeline = Arc::clone(&self.pipeline);
        let traffic = Arc::clone(&self.traffic);

        tokio::spawn(async move {
            let mut reply = String::new();
            loop {
                let next = tokio::select! {
                    _ = tx.closed() => break,
                    next = upstream_rx.recv() => next,
                };
                let Some(item) = next else { break };
                if let Ok(chunk) = &item {
                    if let Some(delta) = chunk.content_delta() {
                        reply.push_str(&delta);
                    }
                }
                let terminal = match &item {
                    Ok(chunk) => chunk.is_done(),
                    Err(_) => true,
                };
                if tx.send(item).await.is_err() || terminal {
                    break;
                }
            }
            // Dropping the receiver stops the upstream relay
            drop(upstream_rx);

            if !reply.is_empty() {
                record.response_tokens = Some(estimate_tokens(&reply));
                pipeline
                    .record_reply(&conversation_key, Message::assistant(reply))
                    .await;
            }
            record.latency_ms = started.elapsed().as_millis() as u64;
            traffic.append(record);
        });
        rx
    }
}
