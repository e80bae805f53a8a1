//! In-memory sinks.

use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::info;

use sluice_core::{ExecutionContext, ItemSink};

/// Collects every written item into a shared vector. Clone the sink before
/// registering it so the test (or host) keeps a handle to the collection:
///
/// ```rust,ignore
/// let sink = CollectSink::new();
/// let handle = sink.clone();
/// builder.add_sink("out", move || handle.clone());
/// // after the run:
/// let items = sink.items();
/// ```
pub struct CollectSink<T> {
    items: Arc<Mutex<Vec<T>>>,
}

impl<T> CollectSink<T> {
    pub fn new() -> Self {
        Self {
            items: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn items(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.items.lock().expect("collect lock").clone()
    }

    pub fn len(&self) -> usize {
        self.items.lock().expect("collect lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for CollectSink<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for CollectSink<T> {
    fn clone(&self) -> Self {
        Self {
            items: self.items.clone(),
        }
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> ItemSink<T> for CollectSink<T> {
    async fn write(&self, item: T, _ctx: &ExecutionContext) -> anyhow::Result<()> {
        self.items.lock().expect("collect lock").push(item);
        Ok(())
    }
}

/// Sink delegating each item to a closure.
pub struct FnSink<F> {
    f: F,
}

impl<F> FnSink<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<I, F> ItemSink<I> for FnSink<F>
where
    I: Clone + Send + Sync + 'static,
    F: Fn(I) -> anyhow::Result<()> + Send + Sync,
{
    async fn write(&self, item: I, _ctx: &ExecutionContext) -> anyhow::Result<()> {
        (self.f)(item)
    }
}

/// Logs every item through `tracing`; handy while wiring up a pipeline.
pub struct TracingSink<T> {
    _marker: PhantomData<fn(T)>,
}

impl<T> TracingSink<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for TracingSink<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Clone + Debug + Send + Sync + 'static> ItemSink<T> for TracingSink<T> {
    async fn write(&self, item: T, _ctx: &ExecutionContext) -> anyhow::Result<()> {
        info!(?item, "sink received");
        Ok(())
    }

    async fn close(&self, _ctx: &ExecutionContext) -> anyhow::Result<()> {
        info!("sink closed");
        Ok(())
    }
}

/// Discards everything.
pub struct NullSink<T> {
    _marker: PhantomData<fn(T)>,
}

impl<T> NullSink<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for NullSink<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> ItemSink<T> for NullSink<T> {
    async fn write(&self, _item: T, _ctx: &ExecutionContext) -> anyhow::Result<()> {
        Ok(())
    }
}
