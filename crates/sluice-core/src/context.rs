//! Per-run execution context shared by every node driver.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio_util::sync::CancellationToken;

use crate::error::{NodeErrorHandler, RetryOptions};
use crate::observer::{ExecutionObserver, NoopObserver};

/// Factory resolving a per-node error handler by node id. Returning `None`
/// leaves the node on the default retry-then-fail behavior.
pub type ErrorHandlerFactory = Arc<dyn Fn(&str) -> Option<Arc<dyn NodeErrorHandler>> + Send + Sync>;

/// Everything a run needs before it starts: the observer, default retry
/// options, an optional error-handler factory and the parameters map.
#[derive(Clone)]
pub struct ContextConfiguration {
    pub observer: Arc<dyn ExecutionObserver>,
    pub default_retry: RetryOptions,
    pub handler_factory: Option<ErrorHandlerFactory>,
    pub params: HashMap<String, serde_json::Value>,
}

impl Default for ContextConfiguration {
    fn default() -> Self {
        Self {
            observer: Arc::new(NoopObserver),
            default_retry: RetryOptions::default(),
            handler_factory: None,
            params: HashMap::new(),
        }
    }
}

impl ContextConfiguration {
    pub fn with_observer(mut self, observer: Arc<dyn ExecutionObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_default_retry(mut self, retry: RetryOptions) -> Self {
        self.default_retry = retry;
        self
    }

    pub fn with_handler_factory(mut self, factory: ErrorHandlerFactory) -> Self {
        self.handler_factory = Some(factory);
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }
}

/// Per-run state bag handed to nodes by reference. The runner is the single
/// owner; nodes never outlive it.
pub struct ExecutionContext {
    correlation_id: String,
    params: HashMap<String, serde_json::Value>,
    items: RwLock<HashMap<String, serde_json::Value>>,
    cancel: CancellationToken,
    observer: Arc<dyn ExecutionObserver>,
    handler_factory: Option<ErrorHandlerFactory>,
    default_retry: RetryOptions,
}

impl ExecutionContext {
    pub fn new(config: ContextConfiguration, cancel: CancellationToken) -> Self {
        Self {
            correlation_id: uuid::Uuid::new_v4().to_string(),
            params: config.params,
            items: RwLock::new(HashMap::new()),
            cancel,
            observer: config.observer,
            handler_factory: config.handler_factory,
            default_retry: config.default_retry,
        }
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn param(&self, key: &str) -> Option<&serde_json::Value> {
        self.params.get(key)
    }

    /// Store a value in the shared items bag.
    pub fn set_item(&self, key: impl Into<String>, value: serde_json::Value) {
        self.items.write().expect("items lock").insert(key.into(), value);
    }

    /// Read a value from the shared items bag.
    pub fn item(&self, key: &str) -> Option<serde_json::Value> {
        self.items.read().expect("items lock").get(key).cloned()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn observer(&self) -> &Arc<dyn ExecutionObserver> {
        &self.observer
    }

    pub fn default_retry(&self) -> &RetryOptions {
        &self.default_retry
    }

    /// Resolve the error handler for a node through the configured factory.
    pub fn node_error_handler(&self, node_id: &str) -> Option<Arc<dyn NodeErrorHandler>> {
        self.handler_factory.as_ref().and_then(|f| f(node_id))
    }

    /// Wall-clock now in epoch milliseconds; drives processing-time windows
    /// and dead-letter timestamps.
    pub fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}
