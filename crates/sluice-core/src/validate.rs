//! Graph validation: a rule engine of composable, order-independent rules.
//!
//! Each rule inspects the accumulated [`GraphDef`] and emits issues at
//! `Info`, `Warning` or `Error` severity. Any `Error` fails `build()`;
//! `try_build` hands back the full report without throwing. A rule may opt
//! into `stop_on_error` when later rules would only produce noise on a
//! graph it already rejected.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use petgraph::algo::is_cyclic_directed;
use petgraph::graph::DiGraph;

use crate::graph::{GraphDef, NodeKind};
use crate::window::TimeMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => f.write_str("info"),
            Severity::Warning => f.write_str("warning"),
            Severity::Error => f.write_str("error"),
        }
    }
}

/// One finding from one rule, optionally attributed to a node.
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    pub severity: Severity,
    pub rule: String,
    pub node: Option<String>,
    pub message: String,
}

impl ValidationIssue {
    pub fn error(rule: &str, node: Option<&str>, message: impl Into<String>) -> Self {
        Self::new(Severity::Error, rule, node, message)
    }

    pub fn warning(rule: &str, node: Option<&str>, message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, rule, node, message)
    }

    pub fn info(rule: &str, node: Option<&str>, message: impl Into<String>) -> Self {
        Self::new(Severity::Info, rule, node, message)
    }

    fn new(severity: Severity, rule: &str, node: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            severity,
            rule: rule.to_string(),
            node: node.map(str::to_string),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.node {
            Some(node) => write!(f, "{} [{}] node `{}`: {}", self.severity, self.rule, node, self.message),
            None => write!(f, "{} [{}]: {}", self.severity, self.rule, self.message),
        }
    }
}

/// Every issue every rule produced, in rule order.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn has_errors(&self) -> bool {
        self.issues.iter().any(|i| i.severity == Severity::Error)
    }

    pub fn errors(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|i| i.severity == Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|i| i.severity == Severity::Warning)
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for issue in &self.issues {
            writeln!(f, "  {issue}")?;
        }
        Ok(())
    }
}

/// A composable validation rule. Rules are order-independent; a rule that
/// opts into `stop_on_error` short-circuits the remaining rules when it
/// rejects the graph.
pub trait ValidationRule: Send + Sync {
    fn name(&self) -> &str;
    fn check(&self, graph: &GraphDef, issues: &mut Vec<ValidationIssue>);
    fn stop_on_error(&self) -> bool {
        false
    }
}

/// Run the built-in rules plus any custom ones.
pub fn validate(def: &GraphDef, custom: &[std::sync::Arc<dyn ValidationRule>]) -> ValidationReport {
    let mut report = ValidationReport::default();
    let builtins: Vec<Box<dyn ValidationRule>> = vec![
        Box::new(EdgeEndpointsRule),
        Box::new(AcyclicityRule),
        Box::new(DegreesRule),
        Box::new(ReachabilityRule),
        Box::new(WindowRule),
        Box::new(ResilienceRule),
        Box::new(ParallelismRule),
    ];
    for rule in builtins.iter().map(|r| r.as_ref()) {
        let before = report.issues.len();
        rule.check(def, &mut report.issues);
        let errored = report.issues[before..].iter().any(|i| i.severity == Severity::Error);
        if errored && rule.stop_on_error() {
            return report;
        }
    }
    for rule in custom {
        rule.check(def, &mut report.issues);
    }
    report
}

/// Every edge connects existing nodes through in-range ports, and the
/// producer's output type matches the consumer's input type exactly.
struct EdgeEndpointsRule;

impl ValidationRule for EdgeEndpointsRule {
    fn name(&self) -> &str {
        "edge-endpoints"
    }

    fn stop_on_error(&self) -> bool {
        true
    }

    fn check(&self, graph: &GraphDef, issues: &mut Vec<ValidationIssue>) {
        let rule = self.name();
        for edge in graph.edges() {
            let producer = match graph.node(&edge.from) {
                Some(n) => n,
                None => {
                    issues.push(ValidationIssue::error(
                        rule,
                        None,
                        format!("edge references unknown producer `{}`", edge.from),
                    ));
                    continue;
                }
            };
            let consumer = match graph.node(&edge.to) {
                Some(n) => n,
                None => {
                    issues.push(ValidationIssue::error(
                        rule,
                        None,
                        format!("edge references unknown consumer `{}`", edge.to),
                    ));
                    continue;
                }
            };
            if edge.from_port != 0 {
                issues.push(ValidationIssue::error(
                    rule,
                    Some(&producer.id),
                    format!("producer port {} does not exist", edge.from_port),
                ));
                continue;
            }
            let out = match producer.output {
                Some(ty) => ty,
                None => {
                    issues.push(ValidationIssue::error(
                        rule,
                        Some(&producer.id),
                        "sink nodes have no output to connect",
                    ));
                    continue;
                }
            };
            let input = match consumer.inputs.get(edge.to_port) {
                Some(ty) => *ty,
                None => {
                    issues.push(ValidationIssue::error(
                        rule,
                        Some(&consumer.id),
                        format!("consumer port {} does not exist", edge.to_port),
                    ));
                    continue;
                }
            };
            if out.id != input.id {
                issues.push(ValidationIssue::error(
                    rule,
                    Some(&consumer.id),
                    format!(
                        "type mismatch on edge `{}` -> `{}` port {}: produces `{}`, consumes `{}`",
                        edge.from, edge.to, edge.to_port, out.name, input.name
                    ),
                ));
            }
        }
    }
}

/// No cycles.
struct AcyclicityRule;

impl ValidationRule for AcyclicityRule {
    fn name(&self) -> &str {
        "acyclicity"
    }

    fn stop_on_error(&self) -> bool {
        true
    }

    fn check(&self, graph: &GraphDef, issues: &mut Vec<ValidationIssue>) {
        let mut g: DiGraph<(), ()> = DiGraph::new();
        let mut indices = HashMap::new();
        for node in graph.nodes() {
            indices.insert(node.id.as_str(), g.add_node(()));
        }
        for edge in graph.edges() {
            if let (Some(&a), Some(&b)) = (indices.get(edge.from.as_str()), indices.get(edge.to.as_str())) {
                g.add_edge(a, b, ());
            }
        }
        if is_cyclic_directed(&g) {
            issues.push(ValidationIssue::error(
                self.name(),
                None,
                "the pipeline graph contains a cycle",
            ));
        }
    }
}

/// Sources have no inputs, sinks have no outputs, and every input port has
/// exactly one producer.
struct DegreesRule;

impl ValidationRule for DegreesRule {
    fn name(&self) -> &str {
        "degrees"
    }

    fn check(&self, graph: &GraphDef, issues: &mut Vec<ValidationIssue>) {
        let rule = self.name();
        for node in graph.nodes() {
            let incoming = graph.incoming(&node.id);
            let outgoing = graph.outgoing(&node.id);
            if node.kind == NodeKind::Source && !incoming.is_empty() {
                issues.push(ValidationIssue::error(
                    rule,
                    Some(&node.id),
                    "sources cannot have incoming edges",
                ));
            }
            if node.output.is_none() && !outgoing.is_empty() {
                issues.push(ValidationIssue::error(
                    rule,
                    Some(&node.id),
                    "sinks cannot have outgoing edges",
                ));
            }
            for port in 0..node.inputs.len() {
                let producers = incoming.iter().filter(|e| e.to_port == port).count();
                match producers {
                    0 => issues.push(ValidationIssue::error(
                        rule,
                        Some(&node.id),
                        format!("input port {port} has no producer"),
                    )),
                    1 => {}
                    n => issues.push(ValidationIssue::error(
                        rule,
                        Some(&node.id),
                        format!("input port {port} has {n} producers; exactly one is allowed"),
                    )),
                }
            }
        }
    }
}

/// Every node is reachable from some source and reaches some sink.
struct ReachabilityRule;

impl ValidationRule for ReachabilityRule {
    fn name(&self) -> &str {
        "reachability"
    }

    fn check(&self, graph: &GraphDef, issues: &mut Vec<ValidationIssue>) {
        let rule = self.name();
        let sources: Vec<&str> = graph
            .nodes()
            .iter()
            .filter(|n| n.kind == NodeKind::Source)
            .map(|n| n.id.as_str())
            .collect();
        let sinks: Vec<&str> = graph
            .nodes()
            .iter()
            .filter(|n| n.output.is_none())
            .map(|n| n.id.as_str())
            .collect();
        if sources.is_empty() {
            issues.push(ValidationIssue::error(rule, None, "the pipeline has no source"));
            return;
        }
        if sinks.is_empty() {
            issues.push(ValidationIssue::error(rule, None, "the pipeline has no sink"));
            return;
        }

        let forward = reach(graph, &sources, false);
        let backward = reach(graph, &sinks, true);
        for node in graph.nodes() {
            if !forward.contains(node.id.as_str()) {
                issues.push(ValidationIssue::error(
                    rule,
                    Some(&node.id),
                    "not reachable from any source",
                ));
            }
            if !backward.contains(node.id.as_str()) {
                issues.push(ValidationIssue::error(
                    rule,
                    Some(&node.id),
                    "does not reach any sink",
                ));
            }
        }
    }
}

fn reach<'a>(graph: &'a GraphDef, seeds: &[&'a str], reversed: bool) -> HashSet<&'a str> {
    let mut seen: HashSet<&str> = seeds.iter().copied().collect();
    let mut queue: VecDeque<&str> = seeds.iter().copied().collect();
    while let Some(id) = queue.pop_front() {
        for edge in graph.edges() {
            let (from, to) = if reversed {
                (edge.to.as_str(), edge.from.as_str())
            } else {
                (edge.from.as_str(), edge.to.as_str())
            };
            if from == id && seen.insert(to) {
                queue.push_back(to);
            }
        }
    }
    seen
}

/// Window-bearing operators carry a valid assigner; event-time windows
/// require every upstream source to assign event times.
struct WindowRule;

impl ValidationRule for WindowRule {
    fn name(&self) -> &str {
        "windowing"
    }

    fn check(&self, graph: &GraphDef, issues: &mut Vec<ValidationIssue>) {
        let rule = self.name();
        for node in graph.nodes() {
            let windowed = matches!(node.kind, NodeKind::Aggregate | NodeKind::Join);
            match (&node.options.window, windowed) {
                (None, true) => {
                    issues.push(ValidationIssue::error(
                        rule,
                        Some(&node.id),
                        "windowed operator has no window configuration",
                    ));
                }
                (Some(config), true) => {
                    if let Err(reason) = config.assigner.validate() {
                        issues.push(ValidationIssue::error(rule, Some(&node.id), reason));
                    }
                    if config.time_mode == TimeMode::EventTime {
                        for source in upstream_sources(graph, &node.id) {
                            if !source.options.assigns_event_time {
                                issues.push(ValidationIssue::error(
                                    rule,
                                    Some(&node.id),
                                    format!(
                                        "event-time windows but upstream source `{}` does not assign event times",
                                        source.id
                                    ),
                                ));
                            }
                        }
                    }
                }
                (Some(_), false) => {
                    issues.push(ValidationIssue::warning(
                        rule,
                        Some(&node.id),
                        "window configuration has no effect on this node kind",
                    ));
                }
                (None, false) => {}
            }
        }
    }
}

fn upstream_sources<'a>(graph: &'a GraphDef, id: &str) -> Vec<&'a crate::graph::NodeSpec> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> = VecDeque::new();
    queue.push_back(id);
    let mut sources = Vec::new();
    while let Some(current) = queue.pop_front() {
        for edge in graph.edges() {
            if edge.to == current && seen.insert(edge.from.as_str()) {
                if let Some(node) = graph.node(&edge.from) {
                    if node.kind == NodeKind::Source {
                        sources.push(node);
                    } else {
                        queue.push_back(node.id.as_str());
                    }
                }
            }
        }
    }
    sources
}

/// Resilience configuration sanity; warnings only, per the contract that an
/// under-configured resilient node still builds.
struct ResilienceRule;

impl ValidationRule for ResilienceRule {
    fn name(&self) -> &str {
        "resilience"
    }

    fn check(&self, graph: &GraphDef, issues: &mut Vec<ValidationIssue>) {
        let rule = self.name();
        let has_pipeline_handler = graph.error_handling().pipeline_handler.is_some();
        for node in graph.nodes() {
            if node.options.resilient {
                if matches!(node.kind, NodeKind::Source | NodeKind::Branch | NodeKind::Batcher) {
                    issues.push(ValidationIssue::warning(
                        rule,
                        Some(&node.id),
                        "resilience has no per-item body to wrap on this node kind",
                    ));
                    continue;
                }
                if !has_pipeline_handler {
                    issues.push(ValidationIssue::warning(
                        rule,
                        Some(&node.id),
                        "resilient node without a pipeline-level error handler",
                    ));
                }
                let retry = node
                    .options
                    .retry
                    .as_ref()
                    .or(graph.error_handling().retry.as_ref());
                if retry.map_or(false, |r| {
                    r.max_node_restart_attempts > 0 && r.max_materialized_items.is_none()
                }) {
                    issues.push(ValidationIssue::warning(
                        rule,
                        Some(&node.id),
                        "restart enabled without a materialization cap; streaming inputs will refuse to start",
                    ));
                }
            }
            if node.options.ack_mode.is_some() && node.kind != NodeKind::Source {
                issues.push(ValidationIssue::warning(
                    rule,
                    Some(&node.id),
                    "acknowledgment mode has no effect on non-source nodes",
                ));
            }
        }
    }
}

/// Parallelism annotations are self-consistent.
struct ParallelismRule;

impl ValidationRule for ParallelismRule {
    fn name(&self) -> &str {
        "parallelism"
    }

    fn check(&self, graph: &GraphDef, issues: &mut Vec<ValidationIssue>) {
        let rule = self.name();
        for node in graph.nodes() {
            let options = match &node.options.parallel {
                Some(p) => p,
                None => continue,
            };
            if options.parallelism == 0 {
                issues.push(ValidationIssue::error(
                    rule,
                    Some(&node.id),
                    "parallelism must be at least 1",
                ));
            }
            if options.max_queue == Some(0) {
                issues.push(ValidationIssue::error(
                    rule,
                    Some(&node.id),
                    "max_queue must be at least 1 when set",
                ));
            }
            if options.preserve_ordering && options.parallelism > 1 {
                issues.push(ValidationIssue::info(
                    rule,
                    Some(&node.id),
                    "ordered parallel execution buffers out-of-order completions",
                ));
            }
            if !matches!(
                node.kind,
                NodeKind::Transform | NodeKind::Lookup | NodeKind::Sink | NodeKind::Unbatcher
            ) {
                issues.push(ValidationIssue::warning(
                    rule,
                    Some(&node.id),
                    "parallelism has no effect on this node kind",
                ));
            }
        }
    }
}
