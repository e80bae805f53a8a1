//! # Sluice Core - Streaming Dataflow Contracts
//!
//! This crate provides the foundational types, traits, and abstractions for
//! building sluice dataflow pipelines. It defines the message protocol
//! between nodes, the node contracts, the graph model with its validation
//! rule engine, the error model, and the windowing primitives used by the
//! execution engine in `sluice-engine`.
//!
//! ## Key Components
//!
//! - **Message protocol**: [`Message`] values (items, watermarks, end of
//!   stream) flowing over bounded channels between nodes
//! - **Data pipes**: lazy typed streams with a replayable/streaming marker
//! - **Node contracts**: [`Source`], [`ItemTransform`], [`StreamTransform`],
//!   [`ItemSink`], [`StreamSink`], [`LookupResolver`] plus the erasure layer
//!   the builder uses to package them for the engine
//! - **Graph model**: typed nodes, edges and annotations validated by a
//!   composable rule engine before execution
//! - **Error model**: the engine error taxonomy, per-node and pipeline-level
//!   error handlers, retry budgets with backoff and jitter, a circuit
//!   breaker, and dead-letter envelopes
//! - **Windowing**: tumbling/sliding/session assigners, watermarks, and the
//!   keyed state machines behind aggregate and join nodes
//! - **Acknowledgments**: the [`AckMessage`] contract messaging connectors
//!   implement, with idempotent handles routed from sinks back to sources
//!
//! ## Example
//!
//! ```rust,no_run
//! use sluice_core::{PipelineBuilder, Source, ItemSink, ExecutionContext, DataPipe};
//! use async_trait::async_trait;
//! use tokio_util::sync::CancellationToken;
//!
//! struct Numbers;
//!
//! #[async_trait]
//! impl Source<i32> for Numbers {
//!     async fn open(&mut self, _ctx: &ExecutionContext, _cancel: CancellationToken)
//!         -> anyhow::Result<DataPipe<i32>>
//!     {
//!         Ok(DataPipe::from_items(vec![1, 2, 3, 4, 5]))
//!     }
//! }
//!
//! struct Log;
//!
//! #[async_trait]
//! impl ItemSink<i32> for Log {
//!     async fn write(&self, item: i32, _ctx: &ExecutionContext) -> anyhow::Result<()> {
//!         tracing::info!(item, "received");
//!         Ok(())
//!     }
//! }
//!
//! # fn main() -> anyhow::Result<()> {
//! let mut builder = PipelineBuilder::new();
//! builder
//!     .add_source("numbers", || Numbers)
//!     .add_sink("log", || Log)
//!     .connect("numbers", "log");
//! let graph = builder.build()?;
//! // `sluice_engine::Runner` executes the graph
//! # Ok(())
//! # }
//! ```

pub mod ack;
pub mod builder;
pub mod context;
pub mod error;
pub mod graph;
pub mod message;
pub mod node;
pub mod observer;
pub mod pipe;
pub mod validate;
pub mod window;

pub use ack::{AckHandle, AckMessage, AckMode};
pub use builder::PipelineBuilder;
pub use context::{ContextConfiguration, ErrorHandlerFactory, ExecutionContext};
pub use error::{
    duration_millis, duration_millis_opt, node_handler_fn, pipeline_handler_fn, BackoffState,
    BreakerState,
    CircuitBreaker, CircuitBreakerOptions, DeadLetterEnvelope, EngineError, FailFast, Jitter,
    NodeErrorDecision, NodeErrorHandler, PipelineErrorDecision, PipelineErrorHandler,
    RetryOptions, RetryThenFail, RunFailure,
};
pub use graph::{
    BatchOptions, BranchOptions, Edge, FaultPropagation, Graph, GraphDef, NodeKind, NodeOptions,
    NodeSpec, ParallelOptions, PortType, QueuePolicy,
};
pub use message::{Envelope, EnvelopeMeta, ItemPayload, ItemRx, ItemTx, Message, SourceMeta};
pub use node::{
    ItemBody, ItemSink, ItemTransform, LookupOptions, LookupResolver, NodeBody, NodeFactory,
    OnMiss, Source, StreamSink, StreamTransform, TsExtractor,
};
pub use observer::{
    BranchSubscriberStats, CollectingObserver, ExecutionObserver, NodeStats, NoopObserver,
    ObserverEvent,
};
pub use pipe::{DataPipe, PipeTx};
pub use validate::{Severity, ValidationIssue, ValidationReport, ValidationRule};
pub use window::{
    AggregateState, JoinState, JoinType, LatePolicy, StateOutput, TimeMode, WatermarkGenerator,
    Window, WindowAssigner, WindowConfig, WindowedAggregate, WindowedState,
};
