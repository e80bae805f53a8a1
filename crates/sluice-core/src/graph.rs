//! Graph model: nodes, edges, annotations and the immutable compiled graph.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use petgraph::graph::DiGraph;
use serde::{Deserialize, Serialize};

use crate::ack::AckMode;
use crate::error::{
    CircuitBreakerOptions, NodeErrorHandler, PipelineErrorHandler, RetryOptions,
};
use crate::node::{NodeBody, NodeFactory};
use crate::window::WindowConfig;

/// The structural role of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Source,
    Transform,
    Sink,
    Branch,
    Batcher,
    Unbatcher,
    Lookup,
    Aggregate,
    Join,
    PassThrough,
    /// Identity node recorded for diagnostics; the driver only forwards and
    /// reports observer events.
    Marker,
}

/// The item type carried by a port, recorded at registration so validation
/// can prove every edge type-compatible.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PortType {
    pub id: TypeId,
    pub name: &'static str,
}

impl PortType {
    pub fn of<T: 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }
}

impl fmt::Debug for PortType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Queue-full behavior for the parallel strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuePolicy {
    /// Apply backpressure upstream.
    Block,
    /// Drop the oldest queued item to admit the new one.
    DropOldest,
    /// Drop the incoming item.
    DropNewest,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        QueuePolicy::Block
    }
}

/// Parallel execution annotation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelOptions {
    /// Worker count `P >= 1`.
    pub parallelism: usize,
    /// Bounded inflight queue length `Q`; defaults to the worker count.
    pub max_queue: Option<usize>,
    pub queue_policy: QueuePolicy,
    /// Emit outputs in input order via a rank-tagged reorder buffer.
    pub preserve_ordering: bool,
}

impl Default for ParallelOptions {
    fn default() -> Self {
        Self {
            parallelism: 1,
            max_queue: None,
            queue_policy: QueuePolicy::Block,
            preserve_ordering: false,
        }
    }
}

/// Batching annotation: flush on size or on time since the first item of the
/// batch, whichever comes first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchOptions {
    pub max_batch: usize,
    #[serde(with = "crate::error::duration_millis")]
    pub window: Duration,
}

/// How a branch node treats a faulted subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultPropagation {
    /// A faulted subscriber stops receiving; the others continue.
    Isolate,
    /// Any subscriber fault fails the branch node.
    All,
}

impl Default for FaultPropagation {
    fn default() -> Self {
        FaultPropagation::Isolate
    }
}

/// Branch (multicast) annotation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BranchOptions {
    /// Per-subscriber buffer length; a slow subscriber backpressures only
    /// itself until its buffer fills.
    pub subscriber_capacity: usize,
    pub fault_propagation: FaultPropagation,
}

impl Default for BranchOptions {
    fn default() -> Self {
        Self {
            subscriber_capacity: 16,
            fault_propagation: FaultPropagation::Isolate,
        }
    }
}

/// Per-node annotations accumulated by the builder.
#[derive(Clone, Default)]
pub struct NodeOptions {
    pub parallel: Option<ParallelOptions>,
    /// Wrap the per-item body with the resilient strategy.
    pub resilient: bool,
    /// Per-node retry options overriding the pipeline-level ones.
    pub retry: Option<RetryOptions>,
    /// Per-node error handler overriding the context factory.
    pub error_handler: Option<Arc<dyn NodeErrorHandler>>,
    pub batch: Option<BatchOptions>,
    pub branch: Option<BranchOptions>,
    pub window: Option<WindowConfig>,
    /// Acknowledgment strategy for acknowledgable sources.
    pub ack_mode: Option<AckMode>,
    /// The source assigns event times (a timestamp extractor is installed).
    pub assigns_event_time: bool,
    /// Out-of-orderness bound for the source's watermark generator.
    pub out_of_orderness: Duration,
}

impl fmt::Debug for NodeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeOptions")
            .field("parallel", &self.parallel)
            .field("resilient", &self.resilient)
            .field("retry", &self.retry)
            .field("error_handler", &self.error_handler.as_ref().map(|_| "<handler>"))
            .field("batch", &self.batch)
            .field("branch", &self.branch)
            .field("window", &self.window)
            .field("ack_mode", &self.ack_mode)
            .field("assigns_event_time", &self.assigns_event_time)
            .finish()
    }
}

/// An immutable node registration: identity, typed ports, the fresh-instance
/// factory and its annotations. A node owns no state beyond the instance the
/// factory creates per run.
#[derive(Clone)]
pub struct NodeSpec {
    pub id: String,
    pub kind: NodeKind,
    /// Input port types; empty for sources, two entries for joins.
    pub inputs: Vec<PortType>,
    /// Output type; `None` for sinks.
    pub output: Option<PortType>,
    pub factory: NodeFactory,
    pub options: NodeOptions,
    /// Inserted by fan-out normalization rather than by the user.
    pub synthetic: bool,
}

impl fmt::Debug for NodeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeSpec")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("inputs", &self.inputs)
            .field("output", &self.output)
            .field("options", &self.options)
            .field("synthetic", &self.synthetic)
            .finish()
    }
}

/// A directed typed link between two node ports, carried by one bounded
/// channel at run time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub from: String,
    pub from_port: usize,
    pub to: String,
    pub to_port: usize,
    /// Override of the runner's default channel capacity.
    pub capacity: Option<usize>,
}

/// Pipeline-level error handling block.
#[derive(Clone, Default)]
pub struct ErrorHandling {
    pub retry: Option<RetryOptions>,
    pub circuit_breaker: Option<CircuitBreakerOptions>,
    pub pipeline_handler: Option<Arc<dyn PipelineErrorHandler>>,
    /// Factory for the dead-letter sink node body; must yield
    /// [`NodeBody::ItemSink`] over
    /// [`crate::error::DeadLetterEnvelope`] items.
    pub dead_letter: Option<NodeFactory>,
}

impl fmt::Debug for ErrorHandling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorHandling")
            .field("retry", &self.retry)
            .field("circuit_breaker", &self.circuit_breaker)
            .field("pipeline_handler", &self.pipeline_handler.as_ref().map(|_| "<handler>"))
            .field("dead_letter", &self.dead_letter.as_ref().map(|_| "<sink>"))
            .finish()
    }
}

/// The builder's accumulated definition, handed to validation before it is
/// frozen into a [`Graph`].
#[derive(Debug, Default, Clone)]
pub struct GraphDef {
    pub(crate) nodes: Vec<NodeSpec>,
    pub(crate) edges: Vec<Edge>,
    pub(crate) error_handling: ErrorHandling,
}

impl GraphDef {
    pub fn nodes(&self) -> &[NodeSpec] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn error_handling(&self) -> &ErrorHandling {
        &self.error_handling
    }

    pub fn node(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn incoming(&self, id: &str) -> Vec<&Edge> {
        let mut edges: Vec<&Edge> = self.edges.iter().filter(|e| e.to == id).collect();
        edges.sort_by_key(|e| e.to_port);
        edges
    }

    pub fn outgoing(&self, id: &str) -> Vec<&Edge> {
        self.edges.iter().filter(|e| e.from == id).collect()
    }

    /// Rewrite multi-consumer fan-out into an explicit branch node, so the
    /// runner only ever sees one consumer per producer port on non-branch
    /// nodes. Both authoring styles (an explicit Branch node, or several
    /// `connect` calls from one producer) end up in the same shape.
    pub(crate) fn normalize_fanout(&mut self) {
        let ids: Vec<String> = self.nodes.iter().map(|n| n.id.clone()).collect();
        for id in ids {
            let node = self.node(&id).expect("node exists").clone();
            if node.kind == NodeKind::Branch {
                continue;
            }
            let fanout: Vec<usize> = self
                .edges
                .iter()
                .enumerate()
                .filter(|(_, e)| e.from == id)
                .map(|(i, _)| i)
                .collect();
            if fanout.len() <= 1 {
                continue;
            }
            let ty = node.output.expect("fan-out producer has an output type");
            let branch_id = format!("{id}__fanout");
            self.nodes.push(NodeSpec {
                id: branch_id.clone(),
                kind: NodeKind::Branch,
                inputs: vec![ty],
                output: Some(ty),
                factory: Arc::new(|| NodeBody::Branch),
                options: NodeOptions::default(),
                synthetic: true,
            });
            for i in fanout {
                self.edges[i].from = branch_id.clone();
            }
            self.edges.push(Edge {
                from: id,
                from_port: 0,
                to: branch_id,
                to_port: 0,
                capacity: None,
            });
        }
    }

    /// Topological order of node ids. Validation has already rejected
    /// cycles; an error here means it was skipped.
    pub(crate) fn topo_order(&self) -> Result<Vec<String>, String> {
        let mut graph: DiGraph<&str, ()> = DiGraph::new();
        let mut indices = HashMap::new();
        for node in &self.nodes {
            indices.insert(node.id.as_str(), graph.add_node(node.id.as_str()));
        }
        for edge in &self.edges {
            if let (Some(&a), Some(&b)) = (indices.get(edge.from.as_str()), indices.get(edge.to.as_str())) {
                graph.add_edge(a, b, ());
            }
        }
        petgraph::algo::toposort(&graph, None)
            .map(|order| order.into_iter().map(|i| graph[i].to_string()).collect())
            .map_err(|cycle| format!("cycle through node `{}`", graph[cycle.node_id()]))
    }
}

/// A validated, immutable pipeline graph ready to run.
#[derive(Debug, Clone)]
pub struct Graph {
    def: GraphDef,
    topo: Vec<String>,
}

impl Graph {
    pub(crate) fn new(def: GraphDef, topo: Vec<String>) -> Self {
        Self { def, topo }
    }

    pub fn nodes(&self) -> &[NodeSpec] {
        self.def.nodes()
    }

    pub fn edges(&self) -> &[Edge] {
        self.def.edges()
    }

    pub fn error_handling(&self) -> &ErrorHandling {
        self.def.error_handling()
    }

    pub fn node(&self, id: &str) -> Option<&NodeSpec> {
        self.def.node(id)
    }

    /// Node ids in topological order; the runner spawns drivers in this
    /// order and reverse-disposal follows from the Eos wave.
    pub fn topo_order(&self) -> &[String] {
        &self.topo
    }

    /// Incoming edges of a node, sorted by consumer port.
    pub fn incoming(&self, id: &str) -> Vec<&Edge> {
        self.def.incoming(id)
    }

    /// Outgoing edges of a node, in registration order (branch subscriber
    /// order).
    pub fn outgoing(&self, id: &str) -> Vec<&Edge> {
        self.def.outgoing(id)
    }
}
