//! Fluent pipeline authoring ending in validation.
//!
//! The builder accumulates typed node registrations, edges and annotations,
//! then `build()` runs the validation rule engine and freezes the result
//! into an immutable [`Graph`]. `try_build()` returns the full report
//! without failing, for callers that want to render every issue at once.

use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use crate::ack::{AckMessage, AckMode};
use crate::error::{
    CircuitBreakerOptions, DeadLetterEnvelope, EngineError, NodeErrorHandler, PipelineErrorHandler,
    RetryOptions,
};
use crate::graph::{
    BatchOptions, BranchOptions, Edge, Graph, GraphDef, NodeKind, NodeOptions, NodeSpec,
    ParallelOptions, PortType,
};
use crate::node::{
    batch_assembler, erase_item_transform, erase_lookup, passthrough_body, unbatch_body,
    AckSourceAdapter, ItemSink, ItemSinkAdapter, ItemTransform, LookupOptions, LookupResolver,
    NodeBody, NodeFactory, Source, SourceAdapter, StreamSink, StreamSinkAdapter, StreamTransform,
    StreamTransformAdapter, TsExtractor,
};
use crate::validate::{validate, ValidationIssue, ValidationReport, ValidationRule};
use crate::window::{
    AggregateState, JoinState, JoinType, WindowConfig, WindowedAggregate,
};

/// Fluent graph builder; see the crate docs for an end-to-end example.
#[derive(Default)]
pub struct PipelineBuilder {
    def: GraphDef,
    custom_rules: Vec<Arc<dyn ValidationRule>>,
    binding_errors: Vec<String>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    // -- node registration --------------------------------------------------

    pub fn add_source<O, S, F>(&mut self, id: impl Into<String>, factory: F) -> &mut Self
    where
        O: Clone + Send + Sync + 'static,
        S: Source<O> + 'static,
        F: Fn() -> S + Send + Sync + 'static,
    {
        let node_factory: NodeFactory =
            Arc::new(move || NodeBody::Source(Box::new(SourceAdapter::<O, S>::new(factory(), None))));
        self.push_node(
            id,
            NodeKind::Source,
            vec![],
            Some(PortType::of::<O>()),
            node_factory,
            NodeOptions::default(),
        )
    }

    /// A source whose items carry event times; the driver runs a watermark
    /// generator with the given out-of-orderness bound.
    pub fn add_source_with_event_time<O, S, F>(
        &mut self,
        id: impl Into<String>,
        factory: F,
        extractor: impl Fn(&O) -> i64 + Send + Sync + 'static,
        out_of_orderness: Duration,
    ) -> &mut Self
    where
        O: Clone + Send + Sync + 'static,
        S: Source<O> + 'static,
        F: Fn() -> S + Send + Sync + 'static,
    {
        let extractor: TsExtractor<O> = Arc::new(extractor);
        let node_factory: NodeFactory = Arc::new(move || {
            NodeBody::Source(Box::new(SourceAdapter::<O, S>::new(factory(), Some(extractor.clone()))))
        });
        let options = NodeOptions {
            assigns_event_time: true,
            out_of_orderness,
            ..NodeOptions::default()
        };
        self.push_node(
            id,
            NodeKind::Source,
            vec![],
            Some(PortType::of::<O>()),
            node_factory,
            options,
        )
    }

    /// A source of [`AckMessage`] items: the handle is split off onto the
    /// envelope, so downstream nodes see plain `T`.
    pub fn add_ack_source<T, S, F>(&mut self, id: impl Into<String>, factory: F, mode: AckMode) -> &mut Self
    where
        T: Clone + Send + Sync + 'static,
        S: Source<AckMessage<T>> + 'static,
        F: Fn() -> S + Send + Sync + 'static,
    {
        let node_factory: NodeFactory = Arc::new(move || {
            NodeBody::Source(Box::new(AckSourceAdapter::<T, S>::new(factory(), mode, None)))
        });
        let options = NodeOptions {
            ack_mode: Some(mode),
            ..NodeOptions::default()
        };
        self.push_node(
            id,
            NodeKind::Source,
            vec![],
            Some(PortType::of::<T>()),
            node_factory,
            options,
        )
    }

    pub fn add_ack_source_with_event_time<T, S, F>(
        &mut self,
        id: impl Into<String>,
        factory: F,
        mode: AckMode,
        extractor: impl Fn(&T) -> i64 + Send + Sync + 'static,
        out_of_orderness: Duration,
    ) -> &mut Self
    where
        T: Clone + Send + Sync + 'static,
        S: Source<AckMessage<T>> + 'static,
        F: Fn() -> S + Send + Sync + 'static,
    {
        let extractor: TsExtractor<T> = Arc::new(extractor);
        let node_factory: NodeFactory = Arc::new(move || {
            NodeBody::Source(Box::new(AckSourceAdapter::<T, S>::new(
                factory(),
                mode,
                Some(extractor.clone()),
            )))
        });
        let options = NodeOptions {
            ack_mode: Some(mode),
            assigns_event_time: true,
            out_of_orderness,
            ..NodeOptions::default()
        };
        self.push_node(
            id,
            NodeKind::Source,
            vec![],
            Some(PortType::of::<T>()),
            node_factory,
            options,
        )
    }

    pub fn add_transform<I, O, T, F>(&mut self, id: impl Into<String>, factory: F) -> &mut Self
    where
        I: Clone + Send + Sync + 'static,
        O: Clone + Send + Sync + 'static,
        T: ItemTransform<I, O> + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        let node_factory: NodeFactory =
            Arc::new(move || NodeBody::Item(erase_item_transform::<I, O, T>(Arc::new(factory()))));
        self.push_node(
            id,
            NodeKind::Transform,
            vec![PortType::of::<I>()],
            Some(PortType::of::<O>()),
            node_factory,
            NodeOptions::default(),
        )
    }

    pub fn add_stream_transform<I, O, T, F>(&mut self, id: impl Into<String>, factory: F) -> &mut Self
    where
        I: Clone + Send + Sync + 'static,
        O: Clone + Send + Sync + 'static,
        T: StreamTransform<I, O> + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        let node_factory: NodeFactory = Arc::new(move || {
            NodeBody::Stream(Box::new(StreamTransformAdapter::<I, O, T>::new(factory())))
        });
        self.push_node(
            id,
            NodeKind::Transform,
            vec![PortType::of::<I>()],
            Some(PortType::of::<O>()),
            node_factory,
            NodeOptions::default(),
        )
    }

    /// Identity node, useful for wiring and diagnostics.
    pub fn add_passthrough<T: Clone + Send + Sync + 'static>(&mut self, id: impl Into<String>) -> &mut Self {
        let node_factory: NodeFactory = Arc::new(|| NodeBody::Item(passthrough_body()));
        self.push_node(
            id,
            NodeKind::PassThrough,
            vec![PortType::of::<T>()],
            Some(PortType::of::<T>()),
            node_factory,
            NodeOptions::default(),
        )
    }

    /// Identity node whose only purpose is to show up in observer events.
    pub fn add_marker<T: Clone + Send + Sync + 'static>(&mut self, id: impl Into<String>) -> &mut Self {
        let node_factory: NodeFactory = Arc::new(|| NodeBody::Item(passthrough_body()));
        self.push_node(
            id,
            NodeKind::Marker,
            vec![PortType::of::<T>()],
            Some(PortType::of::<T>()),
            node_factory,
            NodeOptions::default(),
        )
    }

    pub fn add_sink<I, S, F>(&mut self, id: impl Into<String>, factory: F) -> &mut Self
    where
        I: Clone + Send + Sync + 'static,
        S: ItemSink<I> + 'static,
        F: Fn() -> S + Send + Sync + 'static,
    {
        let node_factory: NodeFactory = Arc::new(move || {
            NodeBody::ItemSink(Arc::new(ItemSinkAdapter::<I, S>::new(factory())))
        });
        self.push_node(
            id,
            NodeKind::Sink,
            vec![PortType::of::<I>()],
            None,
            node_factory,
            NodeOptions::default(),
        )
    }

    pub fn add_stream_sink<I, S, F>(&mut self, id: impl Into<String>, factory: F) -> &mut Self
    where
        I: Clone + Send + Sync + 'static,
        S: StreamSink<I> + 'static,
        F: Fn() -> S + Send + Sync + 'static,
    {
        let node_factory: NodeFactory = Arc::new(move || {
            NodeBody::StreamSink(Box::new(StreamSinkAdapter::<I, S>::new(factory())))
        });
        self.push_node(
            id,
            NodeKind::Sink,
            vec![PortType::of::<I>()],
            None,
            node_factory,
            NodeOptions::default(),
        )
    }

    pub fn add_branch<T: Clone + Send + Sync + 'static>(&mut self, id: impl Into<String>) -> &mut Self {
        self.add_branch_with::<T>(id, BranchOptions::default())
    }

    pub fn add_branch_with<T: Clone + Send + Sync + 'static>(
        &mut self,
        id: impl Into<String>,
        options: BranchOptions,
    ) -> &mut Self {
        let node_factory: NodeFactory = Arc::new(|| NodeBody::Branch);
        let node_options = NodeOptions {
            branch: Some(options),
            ..NodeOptions::default()
        };
        self.push_node(
            id,
            NodeKind::Branch,
            vec![PortType::of::<T>()],
            Some(PortType::of::<T>()),
            node_factory,
            node_options,
        )
    }

    pub fn add_batcher<T: Clone + Send + Sync + 'static>(
        &mut self,
        id: impl Into<String>,
        options: BatchOptions,
    ) -> &mut Self {
        let node_factory: NodeFactory = Arc::new(|| NodeBody::Batch(batch_assembler::<T>()));
        let node_options = NodeOptions {
            batch: Some(options),
            ..NodeOptions::default()
        };
        self.push_node(
            id,
            NodeKind::Batcher,
            vec![PortType::of::<T>()],
            Some(PortType::of::<Vec<T>>()),
            node_factory,
            node_options,
        )
    }

    pub fn add_unbatcher<T: Clone + Send + Sync + 'static>(&mut self, id: impl Into<String>) -> &mut Self {
        let node_factory: NodeFactory = Arc::new(|| NodeBody::Item(unbatch_body::<T>()));
        self.push_node(
            id,
            NodeKind::Unbatcher,
            vec![PortType::of::<Vec<T>>()],
            Some(PortType::of::<T>()),
            node_factory,
            NodeOptions::default(),
        )
    }

    pub fn add_lookup<I, K, V, O, R, F>(
        &mut self,
        id: impl Into<String>,
        key: impl Fn(&I) -> K + Send + Sync + 'static,
        resolver_factory: F,
        combine: impl Fn(I, Option<V>) -> O + Send + Sync + 'static,
        options: LookupOptions,
    ) -> &mut Self
    where
        I: Clone + Send + Sync + 'static,
        K: Clone + Eq + Hash + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
        O: Clone + Send + Sync + 'static,
        R: LookupResolver<K, V> + 'static,
        F: Fn() -> R + Send + Sync + 'static,
    {
        let key: Arc<dyn Fn(&I) -> K + Send + Sync> = Arc::new(key);
        let combine: Arc<dyn Fn(I, Option<V>) -> O + Send + Sync> = Arc::new(combine);
        let node_factory: NodeFactory = Arc::new(move || {
            NodeBody::Item(erase_lookup(
                key.clone(),
                Arc::new(resolver_factory()),
                combine.clone(),
                options,
            ))
        });
        self.push_node(
            id,
            NodeKind::Lookup,
            vec![PortType::of::<I>()],
            Some(PortType::of::<O>()),
            node_factory,
            NodeOptions::default(),
        )
    }

    pub fn add_aggregate<I, K, A>(
        &mut self,
        id: impl Into<String>,
        key: impl Fn(&I) -> K + Send + Sync + 'static,
        init: impl Fn() -> A + Send + Sync + 'static,
        fold: impl Fn(A, I) -> A + Send + Sync + 'static,
        window: WindowConfig,
    ) -> &mut Self
    where
        I: Clone + Send + Sync + 'static,
        K: Clone + Eq + Hash + Send + Sync + 'static,
        A: Clone + Send + Sync + 'static,
    {
        let id = id.into();
        let key: Arc<dyn Fn(&I) -> K + Send + Sync> = Arc::new(key);
        let init: Arc<dyn Fn() -> A + Send + Sync> = Arc::new(init);
        let fold: Arc<dyn Fn(A, I) -> A + Send + Sync> = Arc::new(fold);
        let node_id = id.clone();
        let config = window.clone();
        let node_factory: NodeFactory = Arc::new(move || {
            NodeBody::Windowed(Box::new(AggregateState::new(
                node_id.clone(),
                config.clone(),
                key.clone(),
                init.clone(),
                fold.clone(),
            )))
        });
        let node_options = NodeOptions {
            window: Some(window),
            ..NodeOptions::default()
        };
        self.push_node(
            id,
            NodeKind::Aggregate,
            vec![PortType::of::<I>()],
            Some(PortType::of::<WindowedAggregate<K, A>>()),
            node_factory,
            node_options,
        )
    }

    /// Time-windowed join. Connect the left input to port 0 and the right
    /// input to port 1 via [`PipelineBuilder::connect_port`].
    pub fn add_join<L, R, K, O>(
        &mut self,
        id: impl Into<String>,
        key_left: impl Fn(&L) -> K + Send + Sync + 'static,
        key_right: impl Fn(&R) -> K + Send + Sync + 'static,
        combine: impl Fn(Option<&L>, Option<&R>) -> O + Send + Sync + 'static,
        join_type: JoinType,
        window: WindowConfig,
    ) -> &mut Self
    where
        L: Clone + Send + Sync + 'static,
        R: Clone + Send + Sync + 'static,
        K: Clone + Eq + Hash + Send + Sync + 'static,
        O: Clone + Send + Sync + 'static,
    {
        let id = id.into();
        let key_left: Arc<dyn Fn(&L) -> K + Send + Sync> = Arc::new(key_left);
        let key_right: Arc<dyn Fn(&R) -> K + Send + Sync> = Arc::new(key_right);
        let combine: Arc<dyn Fn(Option<&L>, Option<&R>) -> O + Send + Sync> = Arc::new(combine);
        let node_id = id.clone();
        let config = window.clone();
        let node_factory: NodeFactory = Arc::new(move || {
            NodeBody::Windowed(Box::new(JoinState::new(
                node_id.clone(),
                config.clone(),
                join_type,
                key_left.clone(),
                key_right.clone(),
                combine.clone(),
            )))
        });
        let node_options = NodeOptions {
            window: Some(window),
            ..NodeOptions::default()
        };
        self.push_node(
            id,
            NodeKind::Join,
            vec![PortType::of::<L>(), PortType::of::<R>()],
            Some(PortType::of::<O>()),
            node_factory,
            node_options,
        )
    }

    // -- edges --------------------------------------------------------------

    pub fn connect(&mut self, from: impl Into<String>, to: impl Into<String>) -> &mut Self {
        self.connect_port(from, to, 0)
    }

    pub fn connect_port(
        &mut self,
        from: impl Into<String>,
        to: impl Into<String>,
        to_port: usize,
    ) -> &mut Self {
        self.def.edges.push(Edge {
            from: from.into(),
            from_port: 0,
            to: to.into(),
            to_port,
            capacity: None,
        });
        self
    }

    /// Override the channel capacity of one edge.
    pub fn set_edge_capacity(&mut self, from: &str, to: &str, capacity: usize) -> &mut Self {
        match self
            .def
            .edges
            .iter_mut()
            .find(|e| e.from == from && e.to == to)
        {
            Some(edge) => edge.capacity = Some(capacity),
            None => self
                .binding_errors
                .push(format!("set_edge_capacity: no edge `{from}` -> `{to}`")),
        }
        self
    }

    // -- annotations --------------------------------------------------------

    pub fn set_parallelism(&mut self, id: &str, options: ParallelOptions) -> &mut Self {
        self.with_node(id, "set_parallelism", |node| node.options.parallel = Some(options))
    }

    /// Wrap the node's per-item body with the resilient strategy.
    pub fn with_resilience(&mut self, id: &str) -> &mut Self {
        self.with_node(id, "with_resilience", |node| node.options.resilient = true)
    }

    /// Pipeline-level retry options.
    pub fn with_retry_options(&mut self, options: RetryOptions) -> &mut Self {
        self.def.error_handling.retry = Some(options);
        self
    }

    /// Per-node retry options overriding the pipeline-level ones.
    pub fn with_node_retry_options(&mut self, id: &str, options: RetryOptions) -> &mut Self {
        self.with_node(id, "with_node_retry_options", move |node| {
            node.options.retry = Some(options)
        })
    }

    pub fn with_circuit_breaker(&mut self, options: CircuitBreakerOptions) -> &mut Self {
        self.def.error_handling.circuit_breaker = Some(options);
        self
    }

    pub fn with_pipeline_error_handler(&mut self, handler: Arc<dyn PipelineErrorHandler>) -> &mut Self {
        self.def.error_handling.pipeline_handler = Some(handler);
        self
    }

    /// Per-node error handler consulted by the resilient strategy.
    pub fn with_error_handler(&mut self, id: &str, handler: Arc<dyn NodeErrorHandler>) -> &mut Self {
        self.with_node(id, "with_error_handler", move |node| {
            node.options.error_handler = Some(handler.clone())
        })
    }

    /// Bind the dead-letter sink every `DeadLetter` decision routes to.
    pub fn with_dead_letter<S, F>(&mut self, factory: F) -> &mut Self
    where
        S: ItemSink<DeadLetterEnvelope> + 'static,
        F: Fn() -> S + Send + Sync + 'static,
    {
        self.def.error_handling.dead_letter = Some(Arc::new(move || {
            NodeBody::ItemSink(Arc::new(ItemSinkAdapter::<DeadLetterEnvelope, S>::new(factory())))
        }));
        self
    }

    pub fn with_validation_rule(&mut self, rule: Arc<dyn ValidationRule>) -> &mut Self {
        self.custom_rules.push(rule);
        self
    }

    // -- build --------------------------------------------------------------

    /// Validate and freeze the graph, returning the full report without
    /// failing.
    pub fn try_build(self) -> (Option<Graph>, ValidationReport) {
        let PipelineBuilder {
            mut def,
            custom_rules,
            binding_errors,
        } = self;
        let mut report = validate(&def, &custom_rules);
        for message in binding_errors {
            report
                .issues
                .insert(0, ValidationIssue::error("builder", None, message));
        }
        if report.has_errors() {
            return (None, report);
        }
        def.normalize_fanout();
        match def.topo_order() {
            Ok(topo) => (Some(Graph::new(def, topo)), report),
            Err(message) => {
                report.issues.push(ValidationIssue::error("builder", None, message));
                (None, report)
            }
        }
    }

    /// Validate and freeze the graph, failing on any error-severity issue.
    pub fn build(self) -> Result<Graph, EngineError> {
        let (graph, report) = self.try_build();
        match graph {
            Some(graph) => {
                for issue in &report.issues {
                    tracing::debug!(%issue, "validation note");
                }
                Ok(graph)
            }
            None => Err(EngineError::Validation(report)),
        }
    }

    // -- internals ----------------------------------------------------------

    fn push_node(
        &mut self,
        id: impl Into<String>,
        kind: NodeKind,
        inputs: Vec<PortType>,
        output: Option<PortType>,
        factory: NodeFactory,
        options: NodeOptions,
    ) -> &mut Self {
        let id = id.into();
        if self.def.node(&id).is_some() {
            self.binding_errors.push(format!("duplicate node id `{id}`"));
            return self;
        }
        self.def.nodes.push(NodeSpec {
            id,
            kind,
            inputs,
            output,
            factory,
            options,
            synthetic: false,
        });
        self
    }

    fn with_node(
        &mut self,
        id: &str,
        method: &str,
        mutate: impl FnOnce(&mut NodeSpec),
    ) -> &mut Self {
        match self.def.nodes.iter_mut().find(|n| n.id == id) {
            Some(node) => mutate(node),
            None => self.binding_errors.push(format!("{method}: unknown node `{id}`")),
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExecutionContext;
    use crate::pipe::DataPipe;
    use crate::window::WindowAssigner;
    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    struct Numbers(Vec<i32>);

    #[async_trait]
    impl Source<i32> for Numbers {
        async fn open(
            &mut self,
            _ctx: &ExecutionContext,
            _cancel: CancellationToken,
        ) -> anyhow::Result<DataPipe<i32>> {
            Ok(DataPipe::from_items(self.0.clone()))
        }
    }

    struct Discard;

    #[async_trait]
    impl ItemSink<i32> for Discard {
        async fn write(&self, _item: i32, _ctx: &ExecutionContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct DiscardStrings;

    #[async_trait]
    impl ItemSink<String> for DiscardStrings {
        async fn write(&self, _item: String, _ctx: &ExecutionContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct Stringify;

    #[async_trait]
    impl ItemTransform<i32, String> for Stringify {
        async fn apply(&self, item: i32, _ctx: &ExecutionContext) -> anyhow::Result<String> {
            Ok(item.to_string())
        }
    }

    #[test]
    fn builds_a_linear_graph_in_topological_order() {
        let mut b = PipelineBuilder::new();
        b.add_source("src", || Numbers(vec![1, 2, 3]))
            .add_transform("fmt", || Stringify)
            .add_sink("out", || DiscardStrings)
            .connect("src", "fmt")
            .connect("fmt", "out");
        let graph = b.build().unwrap();
        assert_eq!(graph.topo_order(), &["src", "fmt", "out"]);
        assert_eq!(graph.incoming("fmt").len(), 1);
    }

    #[test]
    fn rejects_type_mismatched_edges() {
        let mut b = PipelineBuilder::new();
        b.add_source("src", || Numbers(vec![1]))
            .add_transform("fmt", || Stringify)
            .add_sink("out", || Discard)
            .connect("src", "fmt")
            .connect("fmt", "out"); // String -> i32 sink
        let (graph, report) = b.try_build();
        assert!(graph.is_none());
        assert!(report.has_errors());
        let msg = report.errors().next().unwrap().message.clone();
        assert!(msg.contains("type mismatch"), "unexpected: {msg}");
    }

    #[test]
    fn rejects_duplicate_node_ids_and_unknown_references() {
        let mut b = PipelineBuilder::new();
        b.add_source("src", || Numbers(vec![1]))
            .add_source("src", || Numbers(vec![2]))
            .with_resilience("nope");
        let (graph, report) = b.try_build();
        assert!(graph.is_none());
        let messages: Vec<String> = report.errors().map(|i| i.message.clone()).collect();
        assert!(messages.iter().any(|m| m.contains("duplicate node id")));
        assert!(messages.iter().any(|m| m.contains("unknown node `nope`")));
    }

    #[test]
    fn rejects_cycles() {
        let mut b = PipelineBuilder::new();
        b.add_source("src", || Numbers(vec![1]))
            .add_passthrough::<i32>("a")
            .add_passthrough::<i32>("b")
            .add_sink("out", || Discard)
            .connect("src", "a")
            .connect("a", "b")
            .connect("b", "a")
            .connect("b", "out");
        let (graph, report) = b.try_build();
        assert!(graph.is_none());
        assert!(report.errors().any(|i| i.rule == "acyclicity"));
    }

    #[test]
    fn fan_out_is_normalized_to_a_synthetic_branch() {
        let mut b = PipelineBuilder::new();
        b.add_source("src", || Numbers(vec![1]))
            .add_passthrough::<i32>("a")
            .add_passthrough::<i32>("b")
            .add_sink("out_a", || Discard)
            .add_sink("out_b", || Discard)
            .connect("src", "a")
            .connect("src", "b")
            .connect("a", "out_a")
            .connect("b", "out_b");
        let graph = b.build().unwrap();
        let branch = graph.node("src__fanout").expect("synthetic branch inserted");
        assert!(branch.synthetic);
        assert_eq!(graph.outgoing("src").len(), 1);
        assert_eq!(graph.outgoing("src__fanout").len(), 2);
    }

    #[test]
    fn event_time_windows_require_a_timestamping_source() {
        let mut b = PipelineBuilder::new();
        b.add_source("src", || Numbers(vec![1]))
            .add_aggregate(
                "sum",
                |v: &i32| *v % 2,
                || 0i64,
                |acc, v| acc + v as i64,
                WindowConfig::event_time(WindowAssigner::tumbling(Duration::from_secs(1))),
            )
            .add_sink("out", || DiscardAgg)
            .connect("src", "sum")
            .connect("sum", "out");
        let (graph, report) = b.try_build();
        assert!(graph.is_none());
        assert!(report
            .errors()
            .any(|i| i.message.contains("does not assign event times")));
    }

    struct DiscardAgg;

    #[async_trait]
    impl ItemSink<WindowedAggregate<i32, i64>> for DiscardAgg {
        async fn write(
            &self,
            _item: WindowedAggregate<i32, i64>,
            _ctx: &ExecutionContext,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn parallelism_annotations_are_checked() {
        let mut b = PipelineBuilder::new();
        b.add_source("src", || Numbers(vec![1]))
            .add_transform("fmt", || Stringify)
            .add_sink("out", || DiscardStrings)
            .connect("src", "fmt")
            .connect("fmt", "out")
            .set_parallelism(
                "fmt",
                ParallelOptions {
                    parallelism: 0,
                    ..ParallelOptions::default()
                },
            );
        let (graph, report) = b.try_build();
        assert!(graph.is_none());
        assert!(report.errors().any(|i| i.rule == "parallelism"));
    }

    #[test]
    fn resilience_without_pipeline_handler_is_a_warning_only() {
        let mut b = PipelineBuilder::new();
        b.add_source("src", || Numbers(vec![1]))
            .add_transform("fmt", || Stringify)
            .add_sink("out", || DiscardStrings)
            .connect("src", "fmt")
            .connect("fmt", "out")
            .with_resilience("fmt");
        let (graph, report) = b.try_build();
        assert!(graph.is_some());
        assert!(report
            .warnings()
            .any(|i| i.message.contains("pipeline-level error handler")));
    }

    #[test]
    fn custom_rules_participate_in_validation() {
        struct NamePrefixRule;
        impl ValidationRule for NamePrefixRule {
            fn name(&self) -> &str {
                "name-prefix"
            }
            fn check(&self, graph: &GraphDef, issues: &mut Vec<ValidationIssue>) {
                for node in graph.nodes() {
                    if !node.id.starts_with("app.") {
                        issues.push(ValidationIssue::error(
                            self.name(),
                            Some(&node.id),
                            "node ids must start with `app.`",
                        ));
                    }
                }
            }
        }

        let mut b = PipelineBuilder::new();
        b.add_source("src", || Numbers(vec![1]))
            .add_sink("out", || Discard)
            .connect("src", "out")
            .with_validation_rule(Arc::new(NamePrefixRule));
        let (graph, report) = b.try_build();
        assert!(graph.is_none());
        assert_eq!(report.errors().filter(|i| i.rule == "name-prefix").count(), 2);
    }
}
