//! The scheduler: builds one bounded channel per edge, instantiates every
//! node fresh through its factory, launches one driver per node, and drives
//! the run to completion, cancellation, or an aggregated failure.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use sluice_core::error::{
    CircuitBreakerOptions, DeadLetterEnvelope, EngineError, FailFast, PipelineErrorHandler,
    RetryOptions, RunFailure,
};
use sluice_core::graph::Graph;
use sluice_core::node::NodeBody;
use sluice_core::observer::NodeStats;
use sluice_core::{ContextConfiguration, Envelope, ExecutionContext, ItemRx, ItemTx, Message};

use crate::drivers::drive_node;

/// Scheduler configuration; bindable from YAML like every other options
/// struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerOptions {
    /// Default bounded capacity of edge channels; per-edge overrides win.
    pub channel_capacity: usize,
    /// How long a cancelled run may keep draining before drivers are
    /// aborted. `None` drains without a deadline.
    #[serde(with = "sluice_core::duration_millis_opt")]
    pub shutdown_budget: Option<Duration>,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            channel_capacity: 8,
            shutdown_budget: None,
        }
    }
}

/// How a run ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Every sink completed.
    Completed,
    /// The run was cancelled and drained cooperatively.
    Cancelled,
}

/// Successful run outcome: final status plus per-node statistics.
#[derive(Debug)]
pub struct RunSummary {
    pub status: RunStatus,
    pub stats: HashMap<String, NodeStats>,
    pub correlation_id: String,
}

/// Everything the node drivers share for one run.
#[derive(Clone)]
pub(crate) struct RunWiring {
    pub(crate) ctx: Arc<ExecutionContext>,
    pub(crate) pipeline_handler: Arc<dyn PipelineErrorHandler>,
    pub(crate) dead_letter: Option<mpsc::Sender<DeadLetterEnvelope>>,
    pub(crate) circuit_breaker: Option<CircuitBreakerOptions>,
    pub(crate) global_retry: RetryOptions,
}

/// Executes validated graphs.
#[derive(Debug, Clone, Default)]
pub struct Runner {
    options: RunnerOptions,
}

impl Runner {
    pub fn new(options: RunnerOptions) -> Self {
        Self { options }
    }

    /// Run the graph to completion with an internal cancellation token.
    pub async fn run(&self, graph: &Graph, config: ContextConfiguration) -> Result<RunSummary, RunFailure> {
        self.run_with_cancel(graph, config, CancellationToken::new()).await
    }

    /// Run the graph under a caller-owned cancellation token; cancelling it
    /// stops the sources at their next item and drains the rest of the
    /// pipeline within the shutdown budget.
    pub async fn run_with_cancel(
        &self,
        graph: &Graph,
        config: ContextConfiguration,
        cancel: CancellationToken,
    ) -> Result<RunSummary, RunFailure> {
        let ctx = Arc::new(ExecutionContext::new(config, cancel.clone()));
        let correlation_id = ctx.correlation_id().to_string();
        tracing::info!(
            correlation_id = %correlation_id,
            nodes = graph.nodes().len(),
            edges = graph.edges().len(),
            "pipeline run starting"
        );

        let mut wiring = RunWiring {
            ctx: ctx.clone(),
            pipeline_handler: graph
                .error_handling()
                .pipeline_handler
                .clone()
                .unwrap_or_else(|| Arc::new(FailFast)),
            dead_letter: None,
            circuit_breaker: graph.error_handling().circuit_breaker.clone(),
            global_retry: graph
                .error_handling()
                .retry
                .clone()
                .unwrap_or_else(|| ctx.default_retry().clone()),
        };

        // dead-letter channel and its dedicated sink driver
        let mut dead_letter_driver = None;
        if let Some(factory) = &graph.error_handling().dead_letter {
            let (tx, mut rx) = mpsc::channel::<DeadLetterEnvelope>(self.options.channel_capacity);
            wiring.dead_letter = Some(tx);
            match factory() {
                NodeBody::ItemSink(sink) => {
                    let ctx = ctx.clone();
                    dead_letter_driver = Some(tokio::spawn(async move {
                        while let Some(envelope) = rx.recv().await {
                            tracing::warn!(
                                node = %envelope.node_id,
                                error = %envelope.error_message,
                                "dead-lettered item"
                            );
                            if let Err(error) = sink.write(Envelope::new(envelope), &ctx).await {
                                tracing::error!(%error, "dead-letter sink write failed");
                                break;
                            }
                        }
                        if let Err(error) = sink.close(&ctx).await {
                            tracing::error!(%error, "dead-letter sink close failed");
                        }
                    }));
                }
                _ => {
                    return Err(RunFailure {
                        node_id: "__dead_letter".to_string(),
                        error: EngineError::Configuration {
                            message: "the dead-letter binding must be a per-item sink".to_string(),
                        },
                        related: Vec::new(),
                    })
                }
            }
        }

        // one bounded channel per edge
        let mut edge_tx: Vec<Option<ItemTx>> = Vec::with_capacity(graph.edges().len());
        let mut edge_rx: Vec<Option<ItemRx>> = Vec::with_capacity(graph.edges().len());
        for edge in graph.edges() {
            let capacity = edge.capacity.unwrap_or(self.options.channel_capacity).max(1);
            let (tx, rx) = mpsc::channel::<Message>(capacity);
            edge_tx.push(Some(tx));
            edge_rx.push(Some(rx));
        }

        // one driver per node, spawned in topological order
        let mut join_set: JoinSet<(String, Result<NodeStats, EngineError>)> = JoinSet::new();
        for id in graph.topo_order() {
            let spec = graph.node(id).expect("topo order names known nodes").clone();

            let mut incoming: Vec<(usize, usize)> = graph
                .edges()
                .iter()
                .enumerate()
                .filter(|(_, e)| e.to == *id)
                .map(|(i, e)| (e.to_port, i))
                .collect();
            incoming.sort_by_key(|(port, _)| *port);
            let inputs: Vec<ItemRx> = incoming
                .into_iter()
                .map(|(_, i)| edge_rx[i].take().expect("each edge has one consumer"))
                .collect();

            let outputs: Vec<ItemTx> = graph
                .edges()
                .iter()
                .enumerate()
                .filter(|(_, e)| e.from == *id)
                .map(|(i, _)| edge_tx[i].take().expect("each edge has one producer"))
                .collect();

            let wiring = wiring.clone();
            let cancel = cancel.clone();
            let id = id.clone();
            join_set.spawn(async move {
                let result = drive_node(spec, inputs, outputs, wiring, cancel).await;
                (id, result)
            });
        }

        // completion barrier: first unrecovered error cancels the rest
        let mut stats: HashMap<String, NodeStats> = HashMap::new();
        let mut failure: Option<(String, EngineError)> = None;
        let mut related: Vec<(String, EngineError)> = Vec::new();
        loop {
            let next = if cancel.is_cancelled() {
                match self.options.shutdown_budget {
                    Some(budget) => match tokio::time::timeout(budget, join_set.join_next()).await {
                        Ok(next) => next,
                        Err(_) => {
                            tracing::warn!("shutdown budget elapsed; aborting remaining drivers");
                            join_set.abort_all();
                            while join_set.join_next().await.is_some() {}
                            None
                        }
                    },
                    None => join_set.join_next().await,
                }
            } else {
                join_set.join_next().await
            };
            let Some(joined) = next else { break };
            match joined {
                Ok((id, Ok(node_stats))) => {
                    stats.insert(id, node_stats);
                }
                Ok((_, Err(error))) if error.is_cancelled() => {}
                Ok((id, Err(error))) => {
                    if failure.is_none() {
                        tracing::error!(node = %id, %error, "node failed; cancelling the run");
                        failure = Some((id, error));
                        cancel.cancel();
                    } else {
                        related.push((id, error));
                    }
                }
                Err(join_error) => {
                    let error = EngineError::Fatal {
                        message: format!("node driver panicked: {join_error}"),
                    };
                    if failure.is_none() {
                        failure = Some(("<unknown>".to_string(), error));
                        cancel.cancel();
                    }
                }
            }
        }

        // release the dead-letter channel and let its driver drain
        wiring.dead_letter = None;
        drop(wiring);
        if let Some(driver) = dead_letter_driver {
            let _ = driver.await;
        }

        match failure {
            Some((node_id, error)) => {
                tracing::error!(correlation_id = %correlation_id, node = %node_id, %error, "pipeline run failed");
                Err(RunFailure {
                    node_id,
                    error,
                    related,
                })
            }
            None => {
                let status = if cancel.is_cancelled() {
                    RunStatus::Cancelled
                } else {
                    RunStatus::Completed
                };
                tracing::info!(correlation_id = %correlation_id, ?status, "pipeline run finished");
                Ok(RunSummary {
                    status,
                    stats,
                    correlation_id,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runner_options_bind_from_yaml() {
        let options: RunnerOptions = serde_yaml::from_str("channel_capacity: 32\nshutdown_budget: 1500\n").unwrap();
        assert_eq!(options.channel_capacity, 32);
        assert_eq!(options.shutdown_budget, Some(Duration::from_millis(1500)));

        let defaults: RunnerOptions = serde_yaml::from_str("{}").unwrap();
        assert_eq!(defaults.channel_capacity, 8);
        assert_eq!(defaults.shutdown_budget, None);
    }
}
