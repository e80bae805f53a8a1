//! Messages passed between pipeline nodes.
//!
//! Edges carry [`Message`] values: data items wrapped in an [`Envelope`],
//! watermarks announcing event-time progress, and an end-of-stream marker
//! that lets downstream nodes finalize their work.

use std::any::{type_name, Any};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::ack::AckHandle;
use crate::error::EngineError;

/// Type alias for the sender side of an edge channel between nodes.
pub type ItemTx = mpsc::Sender<Message>;

/// Type alias for the receiver side of an edge channel between nodes.
pub type ItemRx = mpsc::Receiver<Message>;

/// Object-safe clone-able payload. Every item type flowing over an edge must
/// be `Clone + Send + Sync + 'static`; the typed builder records the concrete type
/// per port so validated graphs never fail a downcast at runtime.
pub trait ItemPayload: Any + Send + Sync {
    fn clone_payload(&self) -> Box<dyn ItemPayload>;
    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
    fn payload_type_name(&self) -> &'static str;
}

impl<T: Any + Clone + Send + Sync> ItemPayload for T {
    fn clone_payload(&self) -> Box<dyn ItemPayload> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }

    fn payload_type_name(&self) -> &'static str {
        type_name::<T>()
    }
}

impl Clone for Box<dyn ItemPayload> {
    fn clone(&self) -> Self {
        self.clone_payload()
    }
}

/// Per-source metadata carried alongside items from acknowledgable sources,
/// surfaced again on dead-letter envelopes.
#[derive(Debug, Clone, Default)]
pub struct SourceMeta {
    pub message_id: String,
    pub metadata: HashMap<String, String>,
}

/// One data item in flight: the payload plus the event time and
/// acknowledgment handles that ride along with it.
#[derive(Clone)]
pub struct Envelope {
    payload: Box<dyn ItemPayload>,
    pub event_time: Option<i64>,
    pub acks: Vec<AckHandle>,
    pub source_meta: Option<Arc<SourceMeta>>,
}

/// The non-payload parts of an [`Envelope`], split off so a transform body
/// can rewrap its output without losing acknowledgment routing.
#[derive(Debug, Clone, Default)]
pub struct EnvelopeMeta {
    pub event_time: Option<i64>,
    pub acks: Vec<AckHandle>,
    pub source_meta: Option<Arc<SourceMeta>>,
}

impl EnvelopeMeta {
    /// Wrap a new payload with this metadata.
    pub fn rewrap<T: Clone + Send + Sync + 'static>(self, value: T) -> Envelope {
        Envelope {
            payload: Box::new(value),
            event_time: self.event_time,
            acks: self.acks,
            source_meta: self.source_meta,
        }
    }
}

impl Envelope {
    pub fn new<T: Clone + Send + Sync + 'static>(value: T) -> Self {
        Self {
            payload: Box::new(value),
            event_time: None,
            acks: Vec::new(),
            source_meta: None,
        }
    }

    pub fn with_event_time(mut self, ts: i64) -> Self {
        self.event_time = Some(ts);
        self
    }

    pub fn with_ack(mut self, ack: AckHandle) -> Self {
        self.acks.push(ack);
        self
    }

    pub fn with_source_meta(mut self, meta: Arc<SourceMeta>) -> Self {
        self.source_meta = Some(meta);
        self
    }

    pub fn payload_is<T: 'static>(&self) -> bool {
        self.payload.as_any().is::<T>()
    }

    pub fn payload_ref<T: 'static>(&self) -> Option<&T> {
        self.payload.as_any().downcast_ref::<T>()
    }

    pub fn payload_type_name(&self) -> &'static str {
        self.payload.payload_type_name()
    }

    /// Consume the envelope, downcasting the payload to `T`.
    ///
    /// A mismatch means the graph validator was bypassed; it is reported as
    /// a fatal engine fault, not a recoverable item error.
    pub fn take<T: 'static>(self) -> Result<(T, EnvelopeMeta), EngineError> {
        let Envelope {
            payload,
            event_time,
            acks,
            source_meta,
        } = self;
        let found = payload.payload_type_name();
        match payload.into_any().downcast::<T>() {
            Ok(value) => Ok((
                *value,
                EnvelopeMeta {
                    event_time,
                    acks,
                    source_meta,
                },
            )),
            Err(_) => Err(EngineError::Fatal {
                message: format!(
                    "payload type mismatch: expected `{}`, found `{}`",
                    type_name::<T>(),
                    found
                ),
            }),
        }
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("payload", &self.payload.payload_type_name())
            .field("event_time", &self.event_time)
            .field("acks", &self.acks.len())
            .finish()
    }
}

/// Messages passed between pipeline nodes.
#[derive(Debug, Clone)]
pub enum Message {
    /// One data item.
    Item(Envelope),

    /// A watermark indicating event time progress, in epoch milliseconds.
    /// Monotone per edge; windowed operators close windows against it.
    Watermark(i64),

    /// End-of-stream marker. Sent exactly once per edge by the producer
    /// after its last item, allowing downstream nodes to flush and finish.
    Eos,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_roundtrips_payload_and_meta() {
        let env = Envelope::new(7u64).with_event_time(1_000);
        let (value, meta) = env.take::<u64>().unwrap();
        assert_eq!(value, 7);
        assert_eq!(meta.event_time, Some(1_000));
        let rewrapped = meta.rewrap("seven".to_string());
        assert_eq!(rewrapped.payload_ref::<String>().unwrap(), "seven");
        assert_eq!(rewrapped.event_time, Some(1_000));
    }

    #[test]
    fn take_reports_type_mismatch_as_fatal() {
        let env = Envelope::new(7u64);
        let err = env.take::<String>().unwrap_err();
        assert!(matches!(err, EngineError::Fatal { .. }));
        assert!(err.to_string().contains("u64"));
    }

    #[test]
    fn clone_shares_ack_identity() {
        let env = Envelope::new(1i32).with_ack(AckHandle::noop(Default::default()));
        let copy = env.clone();
        assert_eq!(copy.acks.len(), 1);
        assert_eq!(copy.payload_ref::<i32>(), Some(&1));
    }
}
