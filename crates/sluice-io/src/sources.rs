//! In-memory sources.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use sluice_core::{DataPipe, ExecutionContext, Source};

/// Source over a fixed in-memory collection; its pipe is materialized and
/// replayable, so restarts resume after already-delivered items.
pub struct VecSource<T> {
    items: Vec<T>,
}

impl<T> VecSource<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self { items }
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> Source<T> for VecSource<T> {
    async fn open(
        &mut self,
        _ctx: &ExecutionContext,
        _cancel: CancellationToken,
    ) -> anyhow::Result<DataPipe<T>> {
        Ok(DataPipe::from_items(self.items.clone()).named("vec-source"))
    }
}

/// Source that regenerates its items from a closure on every open.
pub struct IterSource<F> {
    make: F,
}

impl<F> IterSource<F> {
    pub fn new(make: F) -> Self {
        Self { make }
    }
}

#[async_trait]
impl<T, I, F> Source<T> for IterSource<F>
where
    T: Clone + Send + Sync + 'static,
    I: IntoIterator<Item = T> + Send,
    F: Fn() -> I + Send + Sync,
{
    async fn open(
        &mut self,
        _ctx: &ExecutionContext,
        _cancel: CancellationToken,
    ) -> anyhow::Result<DataPipe<T>> {
        Ok(DataPipe::from_items((self.make)()).named("iter-source"))
    }
}

/// Source bridging an external channel into the pipeline; its pipe is
/// streaming and single-enumeration, and the source cannot be reopened.
pub struct ChannelSource<T> {
    rx: Option<mpsc::Receiver<T>>,
}

impl<T> ChannelSource<T> {
    pub fn new(rx: mpsc::Receiver<T>) -> Self {
        Self { rx: Some(rx) }
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> Source<T> for ChannelSource<T> {
    async fn open(
        &mut self,
        _ctx: &ExecutionContext,
        _cancel: CancellationToken,
    ) -> anyhow::Result<DataPipe<T>> {
        let rx = self
            .rx
            .take()
            .ok_or_else(|| anyhow::anyhow!("channel source cannot be reopened"))?;
        Ok(DataPipe::from_channel(rx).named("channel-source"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::ContextConfiguration;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(ContextConfiguration::default(), CancellationToken::new())
    }

    #[tokio::test]
    async fn vec_source_yields_a_replayable_pipe() {
        let ctx = ctx();
        let mut source = VecSource::new(vec![1, 2, 3]);
        let pipe = source.open(&ctx, CancellationToken::new()).await.unwrap();
        assert!(pipe.is_replayable());
    }

    #[tokio::test]
    async fn channel_source_refuses_to_reopen() {
        let ctx = ctx();
        let (_tx, rx) = mpsc::channel::<u32>(1);
        let mut source = ChannelSource::new(rx);
        let pipe = source.open(&ctx, CancellationToken::new()).await.unwrap();
        assert!(!pipe.is_replayable());
        assert!(source.open(&ctx, CancellationToken::new()).await.is_err());
    }
}
