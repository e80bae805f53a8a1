//! # Sluice Engine - Pipeline Execution
//!
//! The execution half of sluice: a scheduler that turns a validated
//! [`sluice_core::Graph`] into running tasks, plus the execution strategies
//! each node body is wrapped with.
//!
//! ## Key Components
//!
//! - **Runner**: one bounded channel per edge, one concurrent driver per
//!   node, a completion barrier, failure aggregation into a
//!   [`sluice_core::RunFailure`]
//! - **Strategies**: sequential and parallel per-item loops (with queue
//!   policies and an order-preserving reorder buffer), the resilient
//!   retry/dead-letter wrapper, size-or-time batching, multicast branching,
//!   and the windowed aggregate/join loops
//! - **Metrics observer**: lifecycle counters through the `metrics` facade
//!
//! ## Example
//!
//! ```rust,no_run
//! use sluice_core::{ContextConfiguration, PipelineBuilder};
//! use sluice_engine::{Runner, RunnerOptions};
//!
//! # async fn run(graph: sluice_core::Graph) -> anyhow::Result<()> {
//! let runner = Runner::new(RunnerOptions::default());
//! let summary = runner.run(&graph, ContextConfiguration::default()).await?;
//! tracing::info!(?summary.status, "done");
//! # Ok(())
//! # }
//! ```

mod branch;
mod drivers;
mod observer_metrics;
mod parallel;
mod resilient;
mod runner;

pub use observer_metrics::MetricsObserver;
pub use runner::{Runner, RunnerOptions, RunStatus, RunSummary};
