//! Lazy typed streams produced by sources and stream bodies.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;

/// Sender half handed to stream-to-stream bodies for their output.
pub type PipeTx<T> = mpsc::Sender<T>;

enum Repr<T> {
    /// Backed by an in-memory collection; enumeration is deterministic and
    /// may happen any number of times.
    Materialized { items: std::sync::Arc<Vec<T>>, cursor: usize },
    /// Backed by a channel; single enumeration only.
    Streaming(mpsc::Receiver<T>),
}

/// A lazy sequence of `T` consumed under a cancellation signal.
///
/// The replayable/streaming marker is load-bearing: the resilient strategy
/// refuses to buffer a streaming pipe past its materialization cap, while a
/// materialized pipe can simply be enumerated again after a restart.
pub struct DataPipe<T> {
    name: Option<String>,
    repr: Repr<T>,
}

impl<T: Clone + Send + Sync + 'static> DataPipe<T> {
    /// A materialized, replayable pipe over an in-memory collection.
    pub fn from_items(items: impl IntoIterator<Item = T>) -> Self {
        Self {
            name: None,
            repr: Repr::Materialized {
                items: std::sync::Arc::new(items.into_iter().collect()),
                cursor: 0,
            },
        }
    }

    /// A streaming, single-consumer pipe over a channel.
    pub fn from_channel(rx: mpsc::Receiver<T>) -> Self {
        Self {
            name: None,
            repr: Repr::Streaming(rx),
        }
    }

    /// Attach a diagnostic name.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn is_replayable(&self) -> bool {
        matches!(self.repr, Repr::Materialized { .. })
    }

    /// Pull the next item. Returns `None` at end of stream or once the
    /// cancellation token fires; cancellation is observed at item
    /// boundaries, never mid-item.
    pub async fn next(&mut self, cancel: &CancellationToken) -> Option<T> {
        if cancel.is_cancelled() {
            return None;
        }
        match &mut self.repr {
            Repr::Materialized { items, cursor } => {
                let item = items.get(*cursor).cloned();
                if item.is_some() {
                    *cursor += 1;
                }
                item
            }
            Repr::Streaming(rx) => tokio::select! {
                _ = cancel.cancelled() => None,
                item = rx.recv() => item,
            },
        }
    }

    /// A fresh enumeration of a materialized pipe from the beginning.
    /// Replaying a streaming pipe is an error.
    pub fn replay(&self) -> Result<DataPipe<T>, EngineError> {
        match &self.repr {
            Repr::Materialized { items, .. } => Ok(DataPipe {
                name: self.name.clone(),
                repr: Repr::Materialized {
                    items: items.clone(),
                    cursor: 0,
                },
            }),
            Repr::Streaming(_) => Err(EngineError::Configuration {
                message: format!(
                    "pipe `{}` is streaming and cannot be replayed",
                    self.name.as_deref().unwrap_or("<unnamed>")
                ),
            }),
        }
    }

    /// Advance a materialized pipe past the first `n` items; used when a
    /// restarted source resumes after already-delivered output. No-op on
    /// streaming pipes, whose position is owned by the connector.
    pub fn skip(&mut self, n: usize) {
        match &mut self.repr {
            Repr::Materialized { items, cursor } => {
                *cursor = (*cursor + n).min(items.len());
            }
            Repr::Streaming(_) => {
                tracing::warn!(pipe = ?self.name, "skip() ignored on a streaming pipe");
            }
        }
    }
}
