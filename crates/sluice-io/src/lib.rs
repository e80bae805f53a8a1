//! # Sluice IO - In-Memory Sources and Sinks
//!
//! Connector-shaped building blocks for sluice pipelines that stay inside
//! the process: vector/iterator/channel sources, collecting and logging
//! sinks, and closure-based transform helpers. External connectors (queues,
//! databases, object stores) implement the same `sluice-core` contracts
//! from their own crates.

pub mod sinks;
pub mod sources;
pub mod transforms;

pub use sinks::{CollectSink, FnSink, NullSink, TracingSink};
pub use sources::{ChannelSource, IterSource, VecSource};
pub use transforms::{map_fn, transform_fn, FilterTransform, FnTransform, InspectTransform, MapTransform};

/// A channel source of acknowledgable messages, for use with
/// [`sluice_core::PipelineBuilder::add_ack_source`].
pub type AckChannelSource<T> = ChannelSource<sluice_core::AckMessage<T>>;
