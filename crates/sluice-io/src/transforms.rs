//! Transform helpers: closures as per-item bodies, plus small stream
//! transforms.

use std::future::Future;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use sluice_core::{DataPipe, ExecutionContext, ItemTransform, PipeTx, StreamTransform};

/// Wrap an async closure as an [`ItemTransform`].
pub fn transform_fn<F>(f: F) -> FnTransform<F> {
    FnTransform { f }
}

/// Wrap a plain closure as an [`ItemTransform`].
pub fn map_fn<F>(f: F) -> MapTransform<F> {
    MapTransform { f }
}

pub struct FnTransform<F> {
    f: F,
}

#[async_trait]
impl<I, O, F, Fut> ItemTransform<I, O> for FnTransform<F>
where
    I: Clone + Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
    F: Fn(I) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<O>> + Send,
{
    async fn apply(&self, item: I, _ctx: &ExecutionContext) -> anyhow::Result<O> {
        (self.f)(item).await
    }
}

pub struct MapTransform<F> {
    f: F,
}

#[async_trait]
impl<I, O, F> ItemTransform<I, O> for MapTransform<F>
where
    I: Clone + Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
    F: Fn(I) -> O + Send + Sync,
{
    async fn apply(&self, item: I, _ctx: &ExecutionContext) -> anyhow::Result<O> {
        Ok((self.f)(item))
    }
}

/// Stream transform passing through only the items a predicate accepts.
pub struct FilterTransform<F> {
    predicate: F,
}

impl<F> FilterTransform<F> {
    pub fn new(predicate: F) -> Self {
        Self { predicate }
    }
}

#[async_trait]
impl<I, F> StreamTransform<I, I> for FilterTransform<F>
where
    I: Clone + Send + Sync + 'static,
    F: Fn(&I) -> bool + Send + Sync,
{
    async fn run(
        &mut self,
        mut input: DataPipe<I>,
        out: PipeTx<I>,
        _ctx: &ExecutionContext,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        while let Some(item) = input.next(&cancel).await {
            if (self.predicate)(&item) {
                if out.send(item).await.is_err() {
                    break;
                }
            }
        }
        Ok(())
    }
}

/// Observes each item with a closure and passes it through unchanged.
pub struct InspectTransform<F> {
    f: F,
}

impl<F> InspectTransform<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<I, F> ItemTransform<I, I> for InspectTransform<F>
where
    I: Clone + Send + Sync + 'static,
    F: Fn(&I) + Send + Sync,
{
    async fn apply(&self, item: I, _ctx: &ExecutionContext) -> anyhow::Result<I> {
        (self.f)(&item);
        Ok(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::ContextConfiguration;

    #[tokio::test]
    async fn closures_become_transforms() {
        let ctx = ExecutionContext::new(ContextConfiguration::default(), CancellationToken::new());
        let double = transform_fn(|x: i32| async move { Ok(x * 2) });
        assert_eq!(double.apply(21, &ctx).await.unwrap(), 42);

        let upper = map_fn(|s: String| s.to_uppercase());
        assert_eq!(upper.apply("ab".to_string(), &ctx).await.unwrap(), "AB");
    }

    #[tokio::test]
    async fn filter_transform_drops_rejected_items() {
        let ctx = ExecutionContext::new(ContextConfiguration::default(), CancellationToken::new());
        let mut filter = FilterTransform::new(|x: &i32| x % 2 == 0);
        let (tx, mut rx) = tokio::sync::mpsc::channel(8);
        filter
            .run(DataPipe::from_items(vec![1, 2, 3, 4]), tx, &ctx, CancellationToken::new())
            .await
            .unwrap();
        let mut seen = Vec::new();
        while let Some(v) = rx.recv().await {
            seen.push(v);
        }
        assert_eq!(seen, vec![2, 4]);
    }
}
