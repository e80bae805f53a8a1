//! Observability hook invoked by node drivers.

use std::sync::Mutex;
use std::time::Duration;

/// Per-subscriber multicast counters reported by branch nodes.
#[derive(Debug, Clone, Default)]
pub struct BranchSubscriberStats {
    /// Items forwarded to this subscriber.
    pub forwarded: u64,
    /// Highest buffered backlog observed.
    pub backlog_high_water: u64,
    /// The subscriber's edge closed while the branch was still live.
    pub faulted: bool,
    /// The subscriber drained its buffer to completion.
    pub completed: bool,
}

/// Per-node counters reported on completion and aggregated into the run
/// summary.
#[derive(Debug, Clone, Default)]
pub struct NodeStats {
    /// Items pulled from the input edge(s).
    pub items_in: u64,
    /// Items pushed to the output edge(s).
    pub items_out: u64,
    /// Per-item retry attempts performed by the resilient strategy.
    pub retries: u64,
    /// Items routed to the dead-letter sink.
    pub dead_lettered: u64,
    /// Items discarded by a queue drop policy.
    pub dropped: u64,
    /// Late items dropped past allowed lateness.
    pub late_dropped: u64,
    /// Node restarts performed during the run.
    pub restarts: u64,
    /// Per-subscriber multicast counters; only branch nodes fill these.
    pub subscribers: Vec<BranchSubscriberStats>,
    /// Wall-clock time the driver was alive.
    pub elapsed: Duration,
}

/// Lifecycle callbacks invoked under the node drivers.
///
/// Implementations must be non-blocking and side-effect free with respect to
/// pipeline state: the driver calls them inline on the hot path.
pub trait ExecutionObserver: Send + Sync {
    fn node_started(&self, _node_id: &str) {}
    fn item_consumed(&self, _node_id: &str, _count: u64) {}
    fn item_emitted(&self, _node_id: &str, _count: u64) {}
    fn node_retried(&self, _node_id: &str, _attempt: u32, _cause: &str) {}
    fn node_failed(&self, _node_id: &str, _cause: &str) {}
    fn node_completed(&self, _node_id: &str, _stats: &NodeStats) {}
}

/// Observer that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl ExecutionObserver for NoopObserver {}

/// A recorded observer event, for assertions in tests.
#[derive(Debug, Clone, PartialEq)]
pub enum ObserverEvent {
    Started(String),
    Consumed(String, u64),
    Emitted(String, u64),
    Retried { node: String, attempt: u32, cause: String },
    Failed { node: String, cause: String },
    Completed(String),
}

/// Observer that records every event, used by the test suites.
#[derive(Debug, Default)]
pub struct CollectingObserver {
    events: Mutex<Vec<ObserverEvent>>,
}

impl CollectingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ObserverEvent> {
        self.events.lock().expect("observer lock").clone()
    }

    pub fn retries_for(&self, node_id: &str) -> u64 {
        self.events()
            .iter()
            .filter(|e| matches!(e, ObserverEvent::Retried { node, .. } if node == node_id))
            .count() as u64
    }

    pub fn emitted_for(&self, node_id: &str) -> u64 {
        self.events()
            .iter()
            .filter_map(|e| match e {
                ObserverEvent::Emitted(node, n) if node == node_id => Some(*n),
                _ => None,
            })
            .sum()
    }

    pub fn failed_nodes(&self) -> Vec<String> {
        self.events()
            .iter()
            .filter_map(|e| match e {
                ObserverEvent::Failed { node, .. } => Some(node.clone()),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: ObserverEvent) {
        self.events.lock().expect("observer lock").push(event);
    }
}

impl ExecutionObserver for CollectingObserver {
    fn node_started(&self, node_id: &str) {
        self.push(ObserverEvent::Started(node_id.to_string()));
    }

    fn item_consumed(&self, node_id: &str, count: u64) {
        self.push(ObserverEvent::Consumed(node_id.to_string(), count));
    }

    fn item_emitted(&self, node_id: &str, count: u64) {
        self.push(ObserverEvent::Emitted(node_id.to_string(), count));
    }

    fn node_retried(&self, node_id: &str, attempt: u32, cause: &str) {
        self.push(ObserverEvent::Retried {
            node: node_id.to_string(),
            attempt,
            cause: cause.to_string(),
        });
    }

    fn node_failed(&self, node_id: &str, cause: &str) {
        self.push(ObserverEvent::Failed {
            node: node_id.to_string(),
            cause: cause.to_string(),
        });
    }

    fn node_completed(&self, node_id: &str, _stats: &NodeStats) {
        self.push(ObserverEvent::Completed(node_id.to_string()));
    }
}
