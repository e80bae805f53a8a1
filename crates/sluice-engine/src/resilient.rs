//! The resilient strategy: per-item retry, skip, dead-letter and escalation
//! around an erased item body, with backoff, a sequential-failure budget and
//! an optional circuit breaker.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use sluice_core::error::{
    BackoffState, BreakerState, CircuitBreaker, DeadLetterEnvelope, EngineError,
    NodeErrorDecision, NodeErrorHandler, RetryOptions, RetryThenFail,
};
use sluice_core::{AckMode, Envelope, ExecutionContext, ItemBody, NodeSpec};

use crate::runner::RunWiring;

/// The per-item invocation path of a node: either the raw body, or the body
/// wrapped with the resilient strategy.
pub(crate) enum Invoker {
    Plain {
        node_id: String,
        body: ItemBody,
    },
    Resilient(ResilientBody),
}

impl Invoker {
    pub(crate) fn new(spec: &NodeSpec, body: ItemBody, wiring: &RunWiring, retry: &RetryOptions) -> Self {
        if !spec.options.resilient {
            return Invoker::Plain {
                node_id: spec.id.clone(),
                body,
            };
        }
        let handler = spec
            .options
            .error_handler
            .clone()
            .or_else(|| wiring.ctx.node_error_handler(&spec.id))
            .unwrap_or_else(|| Arc::new(RetryThenFail));
        Invoker::Resilient(ResilientBody {
            node_id: spec.id.clone(),
            body,
            handler,
            retry: retry.clone(),
            breaker: wiring
                .circuit_breaker
                .clone()
                .map(|options| Mutex::new(CircuitBreaker::new(options))),
            dead_letter: wiring.dead_letter.clone(),
            sequential_failures: AtomicU32::new(0),
            retries: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
        })
    }

    pub(crate) async fn invoke(
        &self,
        env: Envelope,
        ctx: &Arc<ExecutionContext>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Envelope>, EngineError> {
        match self {
            Invoker::Plain { node_id, body } => {
                body(env, ctx.clone()).await.map_err(|source| EngineError::ItemProcessing {
                    node: node_id.clone(),
                    source,
                })
            }
            Invoker::Resilient(resilient) => resilient.invoke(env, ctx, cancel).await,
        }
    }

    /// Retry attempts performed so far.
    pub(crate) fn retries(&self) -> u64 {
        match self {
            Invoker::Plain { .. } => 0,
            Invoker::Resilient(r) => r.retries.load(Ordering::Relaxed),
        }
    }

    /// Items routed to the dead-letter sink so far.
    pub(crate) fn dead_lettered(&self) -> u64 {
        match self {
            Invoker::Plain { .. } => 0,
            Invoker::Resilient(r) => r.dead_lettered.load(Ordering::Relaxed),
        }
    }
}

pub(crate) struct ResilientBody {
    node_id: String,
    body: ItemBody,
    handler: Arc<dyn NodeErrorHandler>,
    retry: RetryOptions,
    breaker: Option<Mutex<CircuitBreaker>>,
    dead_letter: Option<tokio::sync::mpsc::Sender<DeadLetterEnvelope>>,
    sequential_failures: AtomicU32,
    retries: AtomicU64,
    dead_lettered: AtomicU64,
}

impl ResilientBody {
    async fn invoke(
        &self,
        env: Envelope,
        ctx: &Arc<ExecutionContext>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Envelope>, EngineError> {
        if let Some(short_circuit) = self.breaker_gate(&env, ctx).await? {
            return Ok(short_circuit);
        }

        let mut attempts: u32 = 0;
        let mut backoff = BackoffState::new(&self.retry);
        loop {
            attempts += 1;
            match (self.body)(env.clone(), ctx.clone()).await {
                Ok(outs) => {
                    if let Some(breaker) = &self.breaker {
                        breaker.lock().expect("breaker lock").record_success();
                    }
                    self.sequential_failures.store(0, Ordering::Relaxed);
                    return Ok(outs);
                }
                Err(error) => {
                    if let Some(breaker) = &self.breaker {
                        breaker
                            .lock()
                            .expect("breaker lock")
                            .record_failure(Instant::now());
                    }
                    if attempts == 1 {
                        let streak = self.sequential_failures.fetch_add(1, Ordering::Relaxed) + 1;
                        if streak > self.retry.max_sequential_failures {
                            return Err(EngineError::ItemProcessing {
                                node: self.node_id.clone(),
                                source: error.context(format!(
                                    "{} consecutive items failed, exceeding the sequential-failure budget",
                                    streak
                                )),
                            });
                        }
                    }
                    match self.handler.on_item_error(&env, &error, attempts) {
                        NodeErrorDecision::Retry => {
                            if attempts > self.retry.max_item_retries {
                                return Err(EngineError::ItemProcessing {
                                    node: self.node_id.clone(),
                                    source: error.context(format!(
                                        "retry budget exhausted after {attempts} attempts"
                                    )),
                                });
                            }
                            self.retries.fetch_add(1, Ordering::Relaxed);
                            ctx.observer()
                                .node_retried(&self.node_id, attempts, &error.to_string());
                            tracing::warn!(
                                node = %self.node_id,
                                attempt = attempts,
                                error = %error,
                                "retrying item"
                            );
                            let delay = backoff.next_delay();
                            tokio::select! {
                                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                                _ = tokio::time::sleep(delay) => {}
                            }
                        }
                        NodeErrorDecision::Skip => {
                            tracing::debug!(node = %self.node_id, error = %error, "skipping item");
                            resolve_acks(&env).await;
                            return Ok(Vec::new());
                        }
                        NodeErrorDecision::DeadLetter => {
                            self.send_dead_letter(env, &error, ctx).await?;
                            return Ok(Vec::new());
                        }
                        NodeErrorDecision::Fail => {
                            return Err(EngineError::ItemProcessing {
                                node: self.node_id.clone(),
                                source: error,
                            });
                        }
                    }
                }
            }
        }
    }

    /// Open breaker: short-circuit to dead-letter when bound, otherwise
    /// fail. Returns `Some(outs)` when the item was short-circuited.
    async fn breaker_gate(
        &self,
        env: &Envelope,
        ctx: &Arc<ExecutionContext>,
    ) -> Result<Option<Vec<Envelope>>, EngineError> {
        let state = match &self.breaker {
            Some(breaker) => breaker.lock().expect("breaker lock").check(Instant::now()),
            None => return Ok(None),
        };
        if state != BreakerState::Open {
            return Ok(None);
        }
        let error = anyhow::anyhow!("circuit breaker open");
        if self.dead_letter.is_some() {
            self.send_dead_letter(env.clone(), &error, ctx).await?;
            Ok(Some(Vec::new()))
        } else {
            Err(EngineError::ItemProcessing {
                node: self.node_id.clone(),
                source: error,
            })
        }
    }

    async fn send_dead_letter(
        &self,
        env: Envelope,
        error: &anyhow::Error,
        ctx: &Arc<ExecutionContext>,
    ) -> Result<(), EngineError> {
        let tx = self.dead_letter.as_ref().ok_or_else(|| EngineError::ResourceExhaustion {
            node: self.node_id.clone(),
            message: "dead-letter decision but no dead-letter sink is bound".to_string(),
        })?;
        let envelope = DeadLetterEnvelope::new(&self.node_id, env.clone(), error, ctx.correlation_id());
        tx.send(envelope)
            .await
            .map_err(|_| EngineError::ResourceExhaustion {
                node: self.node_id.clone(),
                message: "dead-letter sink unavailable".to_string(),
            })?;
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(node = %self.node_id, error = %error, "item dead-lettered");
        resolve_acks(&env).await;
        Ok(())
    }
}

/// Acknowledge the engine-managed handles of an item that was handled
/// without reaching a sink (skipped, dropped or dead-lettered), keeping the
/// acknowledgment stream gapless.
pub(crate) async fn resolve_acks(env: &Envelope) {
    for ack in &env.acks {
        if matches!(ack.mode(), AckMode::AutoOnSinkSuccess | AckMode::Delayed) {
            ack.acknowledge().await;
        }
    }
}
