//! Acknowledgable message contract.
//!
//! Messaging sources hand the engine items wrapped in an [`AckMessage`]: an
//! opaque envelope around a body plus an idempotent acknowledgment callback.
//! The engine routes acknowledgments from sinks back to sources without ever
//! naming the transport; a connector decides what "acknowledge" means
//! (commit an offset, delete a queue entry, ...).

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// How the engine resolves acknowledgments for a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    /// The sink driver acknowledges each item after its write succeeds,
    /// in arrival order. The default.
    AutoOnSinkSuccess,
    /// The engine never acknowledges; user code keeps the [`AckMessage`]
    /// in the payload and calls [`AckMessage::acknowledge`] itself.
    Manual,
    /// Handles are collected and acknowledged together once the sink has
    /// completed and closed successfully.
    Delayed,
    /// Acknowledgments are discarded.
    None,
}

impl Default for AckMode {
    fn default() -> Self {
        AckMode::AutoOnSinkSuccess
    }
}

type AckCallback = Box<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

struct AckShared {
    fired: AtomicBool,
    callback: AckCallback,
}

/// Cloneable handle to a single message's acknowledgment callback.
///
/// All clones share one once-flag: no matter how many copies of the message
/// exist downstream (branch fan-out, retries), the callback runs exactly once.
#[derive(Clone)]
pub struct AckHandle {
    shared: Arc<AckShared>,
    mode: AckMode,
}

impl AckHandle {
    /// Wrap an asynchronous acknowledgment callback.
    pub fn new<F, Fut>(mode: AckMode, callback: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            shared: Arc::new(AckShared {
                fired: AtomicBool::new(false),
                callback: Box::new(move || Box::pin(callback())),
            }),
            mode,
        }
    }

    /// A handle whose callback does nothing. Useful for tests and for
    /// sources that only want ordering bookkeeping.
    pub fn noop(mode: AckMode) -> Self {
        Self::new(mode, || async {})
    }

    /// Invoke the callback if it has not fired yet. Returns `true` when this
    /// call actually fired it.
    pub async fn acknowledge(&self) -> bool {
        if self
            .shared
            .fired
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            (self.shared.callback)().await;
            true
        } else {
            false
        }
    }

    pub fn is_acknowledged(&self) -> bool {
        self.shared.fired.load(Ordering::SeqCst)
    }

    /// The same underlying callback and once-flag under a different mode;
    /// used when a source registration overrides the connector's default.
    pub fn with_mode(&self, mode: AckMode) -> Self {
        Self {
            shared: self.shared.clone(),
            mode,
        }
    }

    pub fn mode(&self) -> AckMode {
        self.mode
    }
}

impl fmt::Debug for AckHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckHandle")
            .field("mode", &self.mode)
            .field("acknowledged", &self.is_acknowledged())
            .finish()
    }
}

/// Envelope around a message body `T` with per-source metadata and an
/// idempotent acknowledgment callback.
#[derive(Debug, Clone)]
pub struct AckMessage<T> {
    body: T,
    message_id: String,
    metadata: HashMap<String, String>,
    handle: AckHandle,
}

impl<T> AckMessage<T> {
    pub fn new(body: T, message_id: impl Into<String>, handle: AckHandle) -> Self {
        Self {
            body,
            message_id: message_id.into(),
            metadata: HashMap::new(),
            handle,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn body(&self) -> &T {
        &self.body
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    pub fn handle(&self) -> &AckHandle {
        &self.handle
    }

    /// Acknowledge the message. Idempotent; returns `true` when this call
    /// fired the callback.
    pub async fn acknowledge(&self) -> bool {
        self.handle.acknowledge().await
    }

    /// Replace the body while preserving the acknowledgment callback,
    /// message id and metadata.
    pub fn with_body<U>(self, body: U) -> AckMessage<U> {
        AckMessage {
            body,
            message_id: self.message_id,
            metadata: self.metadata,
            handle: self.handle,
        }
    }

    /// Split into `(body, message_id, metadata, handle)`.
    pub fn into_parts(self) -> (T, String, HashMap<String, String>, AckHandle) {
        (self.body, self.message_id, self.metadata, self.handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn counting_handle() -> (AckHandle, Arc<AtomicU32>) {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let handle = AckHandle::new(AckMode::AutoOnSinkSuccess, move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });
        (handle, count)
    }

    #[tokio::test]
    async fn acknowledge_is_idempotent() {
        let (handle, count) = counting_handle();
        assert!(handle.acknowledge().await);
        assert!(!handle.acknowledge().await);
        assert!(!handle.acknowledge().await);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(handle.is_acknowledged());
    }

    #[tokio::test]
    async fn clones_share_the_once_flag() {
        let (handle, count) = counting_handle();
        let other = handle.clone();
        assert!(other.acknowledge().await);
        assert!(!handle.acknowledge().await);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn with_body_preserves_the_callback() {
        let (handle, count) = counting_handle();
        let msg = AckMessage::new(41u32, "m-1", handle).with_metadata("partition", "0");
        let msg = msg.with_body("forty-one".to_string());
        assert_eq!(msg.message_id(), "m-1");
        assert_eq!(msg.metadata().get("partition").map(String::as_str), Some("0"));
        assert!(msg.acknowledge().await);
        assert!(!msg.acknowledge().await);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
