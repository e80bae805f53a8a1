//! Observer publishing node lifecycle counters through the `metrics`
//! facade. Installing an exporter is the host's concern.

use sluice_core::observer::{ExecutionObserver, NodeStats};

/// Publishes `sluice_*` counters for every observer event, labeled by node
/// id. Non-blocking by construction: the `metrics` macros only touch the
/// registered recorder.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsObserver;

impl MetricsObserver {
    pub fn new() -> Self {
        Self
    }
}

impl ExecutionObserver for MetricsObserver {
    fn node_started(&self, node_id: &str) {
        metrics::counter!("sluice_node_started_total", 1, "node" => node_id.to_string());
    }

    fn item_consumed(&self, node_id: &str, count: u64) {
        metrics::counter!("sluice_items_consumed_total", count, "node" => node_id.to_string());
    }

    fn item_emitted(&self, node_id: &str, count: u64) {
        metrics::counter!("sluice_items_emitted_total", count, "node" => node_id.to_string());
    }

    fn node_retried(&self, node_id: &str, _attempt: u32, _cause: &str) {
        metrics::counter!("sluice_node_retries_total", 1, "node" => node_id.to_string());
    }

    fn node_failed(&self, node_id: &str, _cause: &str) {
        metrics::counter!("sluice_node_failures_total", 1, "node" => node_id.to_string());
    }

    fn node_completed(&self, node_id: &str, stats: &NodeStats) {
        metrics::counter!("sluice_node_completions_total", 1, "node" => node_id.to_string());
        metrics::histogram!(
            "sluice_node_elapsed_seconds",
            stats.elapsed.as_secs_f64(),
            "node" => node_id.to_string()
        );
    }
}
