//! Error taxonomy, retry/backoff configuration and the circuit breaker.
//!
//! Two layers make decisions about failures:
//!
//! - a **per-node handler** ([`NodeErrorHandler`]) consulted by the resilient
//!   strategy for individual failing items, returning
//!   [`NodeErrorDecision::Skip`], `Retry`, `DeadLetter` or `Fail`;
//! - a **pipeline handler** ([`PipelineErrorHandler`]) consulted when a node
//!   driver itself fails, returning [`PipelineErrorDecision::FailPipeline`]
//!   or `RestartNode`.
//!
//! [`RetryOptions`] bounds retries at every layer; backoff is exponential
//! with optional jitter and a [`CircuitBreaker`] can short-circuit a node
//! that keeps failing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

use crate::message::Envelope;
use crate::validate::ValidationReport;

/// Serde helpers for `Duration` fields expressed as milliseconds.
pub mod duration_millis {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

/// Serde helpers for `Option<Duration>` fields expressed as milliseconds.
pub mod duration_millis_opt {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let ms = Option::<u64>::deserialize(d)?;
        Ok(ms.map(Duration::from_millis))
    }
}

/// Errors surfaced by the engine. Per-item errors stay inside the resilient
/// strategy as `anyhow` values; anything crossing a node boundary is one of
/// these.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Graph build-time failure; never raised at run time.
    #[error("pipeline validation failed:\n{0}")]
    Validation(ValidationReport),

    /// A node failed to produce its output pipe or initialize.
    #[error("node `{node}` failed to initialize: {source}")]
    NodeInit {
        node: String,
        #[source]
        source: anyhow::Error,
    },

    /// A per-item body raised and the error layer decided to fail.
    #[error("node `{node}` failed processing an item: {source}")]
    ItemProcessing {
        node: String,
        #[source]
        source: anyhow::Error,
    },

    /// An edge closed unexpectedly or a producer faulted.
    #[error("transport fault at node `{node}`: {message}")]
    Transport { node: String, message: String },

    /// Cooperative cancellation; not a failure.
    #[error("pipeline cancelled")]
    Cancelled,

    /// Materialization cap exceeded, inflight cap exceeded, or the
    /// dead-letter sink is unavailable.
    #[error("node `{node}` exhausted resources: {message}")]
    ResourceExhaustion { node: String, message: String },

    /// Contradictory or incomplete runtime configuration.
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Non-recoverable engine fault.
    #[error("fatal engine fault: {message}")]
    Fatal { message: String },
}

impl EngineError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled)
    }

    /// The id of the node the error is attributed to, when known.
    pub fn node_id(&self) -> Option<&str> {
        match self {
            EngineError::NodeInit { node, .. }
            | EngineError::ItemProcessing { node, .. }
            | EngineError::Transport { node, .. }
            | EngineError::ResourceExhaustion { node, .. } => Some(node),
            _ => None,
        }
    }
}

/// Decision returned by a per-node error handler for one failing item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeErrorDecision {
    /// Drop the item and continue.
    Skip,
    /// Re-invoke the body with the same item, within the retry budget.
    Retry,
    /// Route the item to the dead-letter sink and continue.
    DeadLetter,
    /// Escalate to a node failure.
    Fail,
}

/// Decision returned by the pipeline error handler for a failed node driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineErrorDecision {
    FailPipeline,
    RestartNode,
}

/// Per-node handler consulted only by the resilient strategy.
pub trait NodeErrorHandler: Send + Sync {
    /// `attempt` counts completed invocations for this item, starting at 1.
    fn on_item_error(&self, item: &Envelope, error: &anyhow::Error, attempt: u32) -> NodeErrorDecision;
}

/// Pipeline-level handler consulted when a node driver fails.
pub trait PipelineErrorHandler: Send + Sync {
    fn on_node_error(&self, node_id: &str, error: &EngineError) -> PipelineErrorDecision;
}

/// Wrap a closure as a [`NodeErrorHandler`].
pub fn node_handler_fn<F>(f: F) -> Arc<dyn NodeErrorHandler>
where
    F: Fn(&Envelope, &anyhow::Error, u32) -> NodeErrorDecision + Send + Sync + 'static,
{
    struct FnHandler<F>(F);
    impl<F> NodeErrorHandler for FnHandler<F>
    where
        F: Fn(&Envelope, &anyhow::Error, u32) -> NodeErrorDecision + Send + Sync,
    {
        fn on_item_error(&self, item: &Envelope, error: &anyhow::Error, attempt: u32) -> NodeErrorDecision {
            (self.0)(item, error, attempt)
        }
    }
    Arc::new(FnHandler(f))
}

/// Wrap a closure as a [`PipelineErrorHandler`].
pub fn pipeline_handler_fn<F>(f: F) -> Arc<dyn PipelineErrorHandler>
where
    F: Fn(&str, &EngineError) -> PipelineErrorDecision + Send + Sync + 'static,
{
    struct FnHandler<F>(F);
    impl<F> PipelineErrorHandler for FnHandler<F>
    where
        F: Fn(&str, &EngineError) -> PipelineErrorDecision + Send + Sync,
    {
        fn on_node_error(&self, node_id: &str, error: &EngineError) -> PipelineErrorDecision {
            (self.0)(node_id, error)
        }
    }
    Arc::new(FnHandler(f))
}

/// Default per-node handler: retry within the budget; exhaustion escalates.
#[derive(Debug, Default, Clone, Copy)]
pub struct RetryThenFail;

impl NodeErrorHandler for RetryThenFail {
    fn on_item_error(&self, _item: &Envelope, _error: &anyhow::Error, _attempt: u32) -> NodeErrorDecision {
        NodeErrorDecision::Retry
    }
}

/// Default pipeline handler: any node failure fails the run.
#[derive(Debug, Default, Clone, Copy)]
pub struct FailFast;

impl PipelineErrorHandler for FailFast {
    fn on_node_error(&self, _node_id: &str, _error: &EngineError) -> PipelineErrorDecision {
        PipelineErrorDecision::FailPipeline
    }
}

/// Jitter applied to exponential backoff delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Jitter {
    None,
    /// Uniform in `[0, delay)`.
    Full,
    /// `delay / 2` plus uniform in `[0, delay / 2)`.
    Equal,
    /// Uniform in `[base, prev_delay * 3)`, capped.
    Decorrelated,
}

impl Default for Jitter {
    fn default() -> Self {
        Jitter::Full
    }
}

/// Retry budgets and backoff shape, bound globally or per node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryOptions {
    /// Re-invocations allowed per item beyond the first attempt.
    pub max_item_retries: u32,
    /// Node re-initializations allowed per run. Zero disables restart and
    /// with it the materialization buffer.
    pub max_node_restart_attempts: u32,
    /// Consecutive items allowed to hit the error path before the node is
    /// failed regardless of per-item decisions.
    pub max_sequential_failures: u32,
    /// Cap on items buffered to permit restart of a streaming stage.
    /// `None` means unbounded, which is rejected on streaming inputs when
    /// restart is enabled.
    pub max_materialized_items: Option<usize>,
    #[serde(with = "duration_millis")]
    pub backoff_base: Duration,
    pub backoff_multiplier: f64,
    #[serde(with = "duration_millis")]
    pub max_backoff: Duration,
    pub jitter: Jitter,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_item_retries: 3,
            max_node_restart_attempts: 0,
            max_sequential_failures: 16,
            max_materialized_items: Some(4096),
            backoff_base: Duration::from_millis(50),
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_secs(5),
            jitter: Jitter::Full,
        }
    }
}

/// Mutable backoff computation: exponential growth capped at `max_backoff`,
/// shaped by the configured jitter. Decorrelated jitter keeps the previous
/// delay as state, so one instance serves one retry sequence.
#[derive(Debug)]
pub struct BackoffState {
    base: Duration,
    multiplier: f64,
    cap: Duration,
    jitter: Jitter,
    attempt: u32,
    prev: Duration,
}

impl BackoffState {
    pub fn new(options: &RetryOptions) -> Self {
        Self {
            base: options.backoff_base,
            multiplier: options.backoff_multiplier.max(1.0),
            cap: options.max_backoff,
            jitter: options.jitter,
            attempt: 0,
            prev: options.backoff_base,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let exp = self.base.as_secs_f64() * self.multiplier.powi(self.attempt as i32);
        let capped = exp.min(self.cap.as_secs_f64());
        self.attempt = self.attempt.saturating_add(1);

        let mut rng = rand::thread_rng();
        let delay = match self.jitter {
            Jitter::None => capped,
            Jitter::Full => {
                if capped > 0.0 {
                    rng.gen_range(0.0..capped)
                } else {
                    0.0
                }
            }
            Jitter::Equal => {
                let half = capped / 2.0;
                if half > 0.0 {
                    half + rng.gen_range(0.0..half)
                } else {
                    0.0
                }
            }
            Jitter::Decorrelated => {
                let base = self.base.as_secs_f64();
                let hi = (self.prev.as_secs_f64() * 3.0).max(base + f64::EPSILON);
                rng.gen_range(base..hi).min(self.cap.as_secs_f64())
            }
        };
        let delay = Duration::from_secs_f64(delay);
        self.prev = delay;
        delay
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerOptions {
    /// Consecutive failures inside the tracking window that trip the
    /// breaker.
    pub consecutive_failure_threshold: u32,
    /// How long the breaker stays open before admitting a probe.
    #[serde(with = "duration_millis")]
    pub cool_off: Duration,
    /// Failures further apart than this do not count as consecutive.
    #[serde(with = "duration_millis")]
    pub tracking_window: Duration,
}

impl Default for CircuitBreakerOptions {
    fn default() -> Self {
        Self {
            consecutive_failure_threshold: 5,
            cool_off: Duration::from_secs(30),
            tracking_window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Consecutive-failure circuit breaker. While open, items short-circuit to
/// dead-letter or fail without invoking the body; after the cool-off one
/// probe is admitted.
#[derive(Debug)]
pub struct CircuitBreaker {
    options: CircuitBreakerOptions,
    state: BreakerState,
    consecutive: u32,
    last_failure: Option<Instant>,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(options: CircuitBreakerOptions) -> Self {
        Self {
            options,
            state: BreakerState::Closed,
            consecutive: 0,
            last_failure: None,
            opened_at: None,
        }
    }

    /// Current state, transitioning Open to HalfOpen once the cool-off has
    /// elapsed.
    pub fn check(&mut self, now: Instant) -> BreakerState {
        if self.state == BreakerState::Open {
            if let Some(opened) = self.opened_at {
                if now.duration_since(opened) >= self.options.cool_off {
                    self.state = BreakerState::HalfOpen;
                }
            }
        }
        self.state
    }

    pub fn record_success(&mut self) {
        self.state = BreakerState::Closed;
        self.consecutive = 0;
        self.last_failure = None;
        self.opened_at = None;
    }

    /// Record a failure; returns `true` when this failure trips the breaker
    /// open.
    pub fn record_failure(&mut self, now: Instant) -> bool {
        if self.state == BreakerState::HalfOpen {
            // failed probe: straight back to open
            self.state = BreakerState::Open;
            self.opened_at = Some(now);
            self.last_failure = Some(now);
            return true;
        }
        match self.last_failure {
            Some(last) if now.duration_since(last) > self.options.tracking_window => {
                self.consecutive = 1;
            }
            _ => self.consecutive += 1,
        }
        self.last_failure = Some(now);
        if self.state == BreakerState::Closed
            && self.consecutive >= self.options.consecutive_failure_threshold
        {
            self.state = BreakerState::Open;
            self.opened_at = Some(now);
            return true;
        }
        false
    }
}

/// Envelope delivered to the dead-letter sink for each item the error layer
/// routed away. Rust carries no stack trace at this layer; the full error
/// chain stands in.
#[derive(Debug, Clone)]
pub struct DeadLetterEnvelope {
    pub node_id: String,
    /// The original item, opaque to the dead-letter sink.
    pub item: Envelope,
    pub error_type: String,
    pub error_message: String,
    pub error_chain: Vec<String>,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: String,
    pub source_metadata: HashMap<String, String>,
}

impl DeadLetterEnvelope {
    pub fn new(node_id: &str, item: Envelope, error: &anyhow::Error, correlation_id: &str) -> Self {
        let source_metadata = item
            .source_meta
            .as_ref()
            .map(|m| m.metadata.clone())
            .unwrap_or_default();
        Self {
            node_id: node_id.to_string(),
            error_type: error
                .chain()
                .last()
                .map(|c| format!("{c:?}"))
                .unwrap_or_default(),
            error_message: error.to_string(),
            error_chain: error.chain().map(|c| c.to_string()).collect(),
            timestamp: Utc::now(),
            correlation_id: correlation_id.to_string(),
            source_metadata,
            item,
        }
    }
}

/// Terminal error of a failed run: the root cause annotated with the failing
/// node id, plus any other node errors observed while the run unwound.
#[derive(Debug, Error)]
#[error("pipeline run failed at node `{node_id}`: {error}")]
pub struct RunFailure {
    pub node_id: String,
    #[source]
    pub error: EngineError,
    /// Errors from other nodes collected during teardown.
    pub related: Vec<(String, EngineError)>,
}
