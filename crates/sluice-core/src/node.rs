//! Node contracts and the type-erasure layer.
//!
//! User code implements the typed traits ([`Source`], [`ItemTransform`],
//! [`StreamTransform`], [`ItemSink`], [`StreamSink`], [`LookupResolver`]).
//! The builder erases them into [`NodeBody`] values behind factory closures;
//! a fresh instance is created per run (and per restart), and the engine
//! never inspects user types at runtime. Validation proves edge types match,
//! so the downcasts inside the adapters cannot fail on a validated graph.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::ack::{AckHandle, AckMessage, AckMode};
use crate::context::ExecutionContext;
use crate::error::EngineError;
use crate::message::{Envelope, ItemRx, ItemTx, Message, SourceMeta};
use crate::pipe::{DataPipe, PipeTx};
use crate::window::WindowedState;

/// Boxed future used by the erased body closures.
pub type BoxFut<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Extracts an event time (epoch millis) from an item.
pub type TsExtractor<O> = Arc<dyn Fn(&O) -> i64 + Send + Sync>;

/// Entry point of a pipeline: produces the output pipe for one run.
#[async_trait]
pub trait Source<O: Clone + Send + Sync + 'static>: Send {
    async fn open(
        &mut self,
        ctx: &ExecutionContext,
        cancel: CancellationToken,
    ) -> anyhow::Result<DataPipe<O>>;
}

/// Per-item transform body. Takes `&self` so the parallel strategy can run
/// invocations concurrently; stateful transforms use interior mutability.
#[async_trait]
pub trait ItemTransform<I, O>: Send + Sync
where
    I: Clone + Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
{
    async fn apply(&self, item: I, ctx: &ExecutionContext) -> anyhow::Result<O>;
}

/// Stream-to-stream transform body: consumes the input pipe and pushes
/// outputs at its own pace.
#[async_trait]
pub trait StreamTransform<I, O>: Send
where
    I: Clone + Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
{
    async fn run(
        &mut self,
        input: DataPipe<I>,
        out: PipeTx<O>,
        ctx: &ExecutionContext,
        cancel: CancellationToken,
    ) -> anyhow::Result<()>;
}

/// Per-item sink body; `close` runs once after end of stream.
#[async_trait]
pub trait ItemSink<I>: Send + Sync
where
    I: Clone + Send + Sync + 'static,
{
    async fn write(&self, item: I, ctx: &ExecutionContext) -> anyhow::Result<()>;

    async fn close(&self, _ctx: &ExecutionContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Whole-stream sink body.
#[async_trait]
pub trait StreamSink<I>: Send
where
    I: Clone + Send + Sync + 'static,
{
    async fn run(
        &mut self,
        input: DataPipe<I>,
        ctx: &ExecutionContext,
        cancel: CancellationToken,
    ) -> anyhow::Result<()>;
}

/// Asynchronous key-to-value resolution for lookup nodes.
#[async_trait]
pub trait LookupResolver<K, V>: Send + Sync
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    async fn resolve(&self, key: &K, ctx: &ExecutionContext) -> anyhow::Result<Option<V>>;
}

/// What a lookup node does when the resolver returns no value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnMiss {
    /// Emit the combined output with `None`.
    Emit,
    /// Drop the item.
    Drop,
    /// Treat the miss as an item error.
    Fail,
}

/// Lookup node configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct LookupOptions {
    /// Cache resolved values for the duration of the run.
    pub cached: bool,
    pub on_miss: OnMiss,
}

impl Default for LookupOptions {
    fn default() -> Self {
        Self {
            cached: false,
            on_miss: OnMiss::Emit,
        }
    }
}

// ---------------------------------------------------------------------------
// Erased bodies driven by the engine
// ---------------------------------------------------------------------------

/// Erased per-item body: one envelope in, zero or more envelopes out.
pub type ItemBody =
    Arc<dyn Fn(Envelope, Arc<ExecutionContext>) -> BoxFut<'static, anyhow::Result<Vec<Envelope>>> + Send + Sync>;

/// Erased batch assembly: the accumulated envelopes of one batch in, the
/// `Vec<T>` batch envelope out, constituent acks merged.
pub type BatchAssembler = Arc<dyn Fn(Vec<Envelope>) -> Result<Envelope, EngineError> + Send + Sync>;

/// Erased output stream of a source: envelopes with event times assigned
/// and ack handles attached.
#[async_trait]
pub trait EnvelopeStream: Send {
    async fn next(&mut self, cancel: &CancellationToken) -> Option<Envelope>;
    fn is_replayable(&self) -> bool;
    /// Resume support: advance a replayable stream past already-delivered
    /// items.
    fn skip(&mut self, n: usize);
}

#[async_trait]
pub trait ErasedSource: Send {
    async fn open(
        &mut self,
        ctx: &ExecutionContext,
        cancel: CancellationToken,
    ) -> anyhow::Result<Box<dyn EnvelopeStream>>;
}

#[async_trait]
pub trait ErasedStreamTransform: Send {
    async fn run(
        &mut self,
        node_id: &str,
        rx: &mut ItemRx,
        tx: ItemTx,
        ctx: Arc<ExecutionContext>,
        cancel: CancellationToken,
    ) -> anyhow::Result<()>;
}

#[async_trait]
pub trait ErasedItemSink: Send + Sync {
    async fn write(&self, env: Envelope, ctx: &ExecutionContext) -> anyhow::Result<()>;
    async fn close(&self, ctx: &ExecutionContext) -> anyhow::Result<()>;
}

#[async_trait]
pub trait ErasedStreamSink: Send {
    async fn run(
        &mut self,
        node_id: &str,
        rx: &mut ItemRx,
        ctx: Arc<ExecutionContext>,
        cancel: CancellationToken,
    ) -> anyhow::Result<()>;
}

/// A freshly instantiated node, ready to be driven. Produced by the
/// registered [`NodeFactory`] once per run and again on every restart.
pub enum NodeBody {
    Source(Box<dyn ErasedSource>),
    Item(ItemBody),
    Stream(Box<dyn ErasedStreamTransform>),
    Batch(BatchAssembler),
    Branch,
    Windowed(Box<dyn WindowedState>),
    ItemSink(Arc<dyn ErasedItemSink>),
    StreamSink(Box<dyn ErasedStreamSink>),
}

/// Fresh-instance factory captured by the builder; no reflection, no
/// registry, just a closure.
pub type NodeFactory = Arc<dyn Fn() -> NodeBody + Send + Sync>;

// ---------------------------------------------------------------------------
// Adapters from typed contracts to erased bodies
// ---------------------------------------------------------------------------

struct TypedPipeStream<O> {
    pipe: DataPipe<O>,
    extractor: Option<TsExtractor<O>>,
}

#[async_trait]
impl<O: Clone + Send + Sync + 'static> EnvelopeStream for TypedPipeStream<O> {
    async fn next(&mut self, cancel: &CancellationToken) -> Option<Envelope> {
        let item = self.pipe.next(cancel).await?;
        let ts = self.extractor.as_ref().map(|ex| ex(&item));
        let mut env = Envelope::new(item);
        env.event_time = ts;
        Some(env)
    }

    fn is_replayable(&self) -> bool {
        self.pipe.is_replayable()
    }

    fn skip(&mut self, n: usize) {
        self.pipe.skip(n);
    }
}

/// Adapter for plain sources.
pub struct SourceAdapter<O, S> {
    inner: S,
    extractor: Option<TsExtractor<O>>,
}

impl<O, S> SourceAdapter<O, S> {
    pub fn new(inner: S, extractor: Option<TsExtractor<O>>) -> Self {
        Self { inner, extractor }
    }
}

#[async_trait]
impl<O, S> ErasedSource for SourceAdapter<O, S>
where
    O: Clone + Send + Sync + 'static,
    S: Source<O>,
{
    async fn open(
        &mut self,
        ctx: &ExecutionContext,
        cancel: CancellationToken,
    ) -> anyhow::Result<Box<dyn EnvelopeStream>> {
        let pipe = self.inner.open(ctx, cancel).await?;
        Ok(Box::new(TypedPipeStream {
            pipe,
            extractor: self.extractor.clone(),
        }))
    }
}

struct AckPipeStream<T> {
    pipe: DataPipe<AckMessage<T>>,
    mode: AckMode,
    extractor: Option<TsExtractor<T>>,
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> EnvelopeStream for AckPipeStream<T> {
    async fn next(&mut self, cancel: &CancellationToken) -> Option<Envelope> {
        let msg = self.pipe.next(cancel).await?;
        let (body, message_id, metadata, handle) = msg.into_parts();
        let ts = self.extractor.as_ref().map(|ex| ex(&body));
        let mut env = Envelope::new(body)
            .with_ack(handle.with_mode(self.mode))
            .with_source_meta(Arc::new(SourceMeta { message_id, metadata }));
        env.event_time = ts;
        Some(env)
    }

    fn is_replayable(&self) -> bool {
        self.pipe.is_replayable()
    }

    fn skip(&mut self, n: usize) {
        self.pipe.skip(n);
    }
}

/// Adapter for acknowledgable sources: unwraps [`AckMessage`] bodies and
/// attaches the handle to the envelope so downstream nodes see plain `T`.
pub struct AckSourceAdapter<T, S> {
    inner: S,
    mode: AckMode,
    extractor: Option<TsExtractor<T>>,
}

impl<T, S> AckSourceAdapter<T, S> {
    pub fn new(inner: S, mode: AckMode, extractor: Option<TsExtractor<T>>) -> Self {
        Self { inner, mode, extractor }
    }
}

#[async_trait]
impl<T, S> ErasedSource for AckSourceAdapter<T, S>
where
    T: Clone + Send + Sync + 'static,
    S: Source<AckMessage<T>>,
{
    async fn open(
        &mut self,
        ctx: &ExecutionContext,
        cancel: CancellationToken,
    ) -> anyhow::Result<Box<dyn EnvelopeStream>> {
        let pipe = self.inner.open(ctx, cancel).await?;
        Ok(Box::new(AckPipeStream {
            pipe,
            mode: self.mode,
            extractor: self.extractor.clone(),
        }))
    }
}

/// Erase a typed per-item transform into an [`ItemBody`].
pub fn erase_item_transform<I, O, T>(transform: Arc<T>) -> ItemBody
where
    I: Clone + Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
    T: ItemTransform<I, O> + 'static,
{
    Arc::new(move |env, ctx| {
        let transform = transform.clone();
        Box::pin(async move {
            let (item, meta) = env.take::<I>()?;
            let out = transform.apply(item, &ctx).await?;
            Ok(vec![meta.rewrap(out)])
        })
    })
}

/// Identity body used by pass-through and marker nodes.
pub fn passthrough_body() -> ItemBody {
    Arc::new(|env, _ctx| Box::pin(async move { Ok(vec![env]) }))
}

/// Flatten a `Vec<T>` batch into its items, preserving intra-batch order.
/// The batch's merged acks ride on the last element so acknowledgment order
/// still closes the whole batch as a prefix.
pub fn unbatch_body<T: Clone + Send + Sync + 'static>() -> ItemBody {
    Arc::new(|env, _ctx| {
        Box::pin(async move {
            let (batch, meta) = env.take::<Vec<T>>()?;
            let n = batch.len();
            let mut outs = Vec::with_capacity(n);
            for (i, item) in batch.into_iter().enumerate() {
                let mut e = Envelope::new(item);
                e.event_time = meta.event_time;
                e.source_meta = meta.source_meta.clone();
                if i + 1 == n {
                    e.acks = meta.acks.clone();
                }
                outs.push(e);
            }
            Ok(outs)
        })
    })
}

/// Assemble accumulated envelopes into one `Vec<T>` batch envelope: acks are
/// merged, the event time is the maximum over the batch.
pub fn batch_assembler<T: Clone + Send + Sync + 'static>() -> BatchAssembler {
    Arc::new(|envs: Vec<Envelope>| {
        let mut items = Vec::with_capacity(envs.len());
        let mut acks = Vec::new();
        let mut event_time: Option<i64> = None;
        let mut source_meta = None;
        for env in envs {
            let (item, meta) = env.take::<T>()?;
            items.push(item);
            acks.extend(meta.acks);
            event_time = match (event_time, meta.event_time) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            };
            source_meta = source_meta.or(meta.source_meta);
        }
        let mut env = Envelope::new(items);
        env.event_time = event_time;
        env.acks = acks;
        env.source_meta = source_meta;
        Ok(env)
    })
}

/// Erase a lookup node (key extraction, async resolution with an optional
/// per-run cache, combination) into an [`ItemBody`].
pub fn erase_lookup<I, K, V, O, R>(
    key_fn: Arc<dyn Fn(&I) -> K + Send + Sync>,
    resolver: Arc<R>,
    combine: Arc<dyn Fn(I, Option<V>) -> O + Send + Sync>,
    options: LookupOptions,
) -> ItemBody
where
    I: Clone + Send + Sync + 'static,
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
    R: LookupResolver<K, V> + 'static,
{
    let cache: Option<Arc<tokio::sync::Mutex<HashMap<K, Option<V>>>>> = options
        .cached
        .then(|| Arc::new(tokio::sync::Mutex::new(HashMap::new())));
    Arc::new(move |env, ctx| {
        let key_fn = key_fn.clone();
        let resolver = resolver.clone();
        let combine = combine.clone();
        let cache = cache.clone();
        let on_miss = options.on_miss;
        Box::pin(async move {
            let (item, meta) = env.take::<I>()?;
            let key = key_fn(&item);
            let value = match &cache {
                Some(cache) => {
                    let mut guard = cache.lock().await;
                    match guard.get(&key) {
                        Some(v) => v.clone(),
                        None => {
                            let v = resolver.resolve(&key, &ctx).await?;
                            guard.insert(key.clone(), v.clone());
                            v
                        }
                    }
                }
                None => resolver.resolve(&key, &ctx).await?,
            };
            match (value, on_miss) {
                (None, OnMiss::Drop) => {
                    for ack in &meta.acks {
                        if matches!(ack.mode(), AckMode::AutoOnSinkSuccess | AckMode::Delayed) {
                            ack.acknowledge().await;
                        }
                    }
                    Ok(Vec::new())
                }
                (None, OnMiss::Fail) => Err(anyhow::anyhow!("lookup returned no value for key")),
                (value, _) => Ok(vec![meta.rewrap(combine(item, value))]),
            }
        })
    })
}

/// Adapter erasing a typed [`ItemSink`].
pub struct ItemSinkAdapter<I, S> {
    inner: S,
    _marker: PhantomData<fn(I)>,
}

impl<I, S> ItemSinkAdapter<I, S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<I, S> ErasedItemSink for ItemSinkAdapter<I, S>
where
    I: Clone + Send + Sync + 'static,
    S: ItemSink<I>,
{
    async fn write(&self, env: Envelope, ctx: &ExecutionContext) -> anyhow::Result<()> {
        let (item, _meta) = env.take::<I>()?;
        self.inner.write(item, ctx).await
    }

    async fn close(&self, ctx: &ExecutionContext) -> anyhow::Result<()> {
        self.inner.close(ctx).await
    }
}

/// Adapter erasing a typed [`StreamTransform`]: feeds the body a typed pipe,
/// forwards watermarks around it, and resolves collected acks once the body
/// completes successfully (stream bodies cannot correlate outputs to
/// inputs).
pub struct StreamTransformAdapter<I, O, S> {
    inner: S,
    _marker: PhantomData<fn(I) -> O>,
}

impl<I, O, S> StreamTransformAdapter<I, O, S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<I, O, S> ErasedStreamTransform for StreamTransformAdapter<I, O, S>
where
    I: Clone + Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
    S: StreamTransform<I, O>,
{
    async fn run(
        &mut self,
        node_id: &str,
        rx: &mut ItemRx,
        tx: ItemTx,
        ctx: Arc<ExecutionContext>,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        const BODY_CAPACITY: usize = 16;
        let (in_tx, in_rx) = mpsc::channel::<I>(BODY_CAPACITY);
        let (out_tx, mut out_rx) = mpsc::channel::<O>(BODY_CAPACITY);
        let pipe = DataPipe::from_channel(in_rx).named(node_id);

        let feed = {
            let tx = tx.clone();
            let ctx = ctx.clone();
            let cancel = cancel.clone();
            let node = node_id.to_string();
            async move {
                let mut acks: Vec<AckHandle> = Vec::new();
                loop {
                    let msg = tokio::select! {
                        _ = cancel.cancelled() => None,
                        m = rx.recv() => m,
                    };
                    match msg {
                        Some(Message::Item(env)) => {
                            ctx.observer().item_consumed(&node, 1);
                            let (item, meta) = env.take::<I>()?;
                            acks.extend(meta.acks);
                            if in_tx.send(item).await.is_err() {
                                break;
                            }
                        }
                        Some(Message::Watermark(w)) => {
                            let _ = tx.send(Message::Watermark(w)).await;
                        }
                        Some(Message::Eos) | None => break,
                    }
                }
                drop(in_tx);
                Ok::<_, anyhow::Error>(acks)
            }
        };

        let emit = {
            let tx = tx.clone();
            let ctx = ctx.clone();
            let node = node_id.to_string();
            async move {
                while let Some(out) = out_rx.recv().await {
                    ctx.observer().item_emitted(&node, 1);
                    if tx.send(Message::Item(Envelope::new(out))).await.is_err() {
                        break;
                    }
                }
            }
        };

        let body = self.inner.run(pipe, out_tx, ctx.as_ref(), cancel.clone());
        let (acks, body_result, ()) = tokio::join!(feed, body, emit);
        body_result?;
        for ack in acks? {
            if matches!(ack.mode(), AckMode::AutoOnSinkSuccess | AckMode::Delayed) {
                ack.acknowledge().await;
            }
        }
        Ok(())
    }
}

/// Adapter erasing a typed [`StreamSink`]; same ack treatment as
/// [`StreamTransformAdapter`].
pub struct StreamSinkAdapter<I, S> {
    inner: S,
    _marker: PhantomData<fn(I)>,
}

impl<I, S> StreamSinkAdapter<I, S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<I, S> ErasedStreamSink for StreamSinkAdapter<I, S>
where
    I: Clone + Send + Sync + 'static,
    S: StreamSink<I>,
{
    async fn run(
        &mut self,
        node_id: &str,
        rx: &mut ItemRx,
        ctx: Arc<ExecutionContext>,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        const BODY_CAPACITY: usize = 16;
        let (in_tx, in_rx) = mpsc::channel::<I>(BODY_CAPACITY);
        let pipe = DataPipe::from_channel(in_rx).named(node_id);

        let feed = {
            let ctx = ctx.clone();
            let cancel = cancel.clone();
            let node = node_id.to_string();
            async move {
                let mut acks: Vec<AckHandle> = Vec::new();
                loop {
                    let msg = tokio::select! {
                        _ = cancel.cancelled() => None,
                        m = rx.recv() => m,
                    };
                    match msg {
                        Some(Message::Item(env)) => {
                            ctx.observer().item_consumed(&node, 1);
                            let (item, meta) = env.take::<I>()?;
                            acks.extend(meta.acks);
                            if in_tx.send(item).await.is_err() {
                                break;
                            }
                        }
                        Some(Message::Watermark(_)) => {}
                        Some(Message::Eos) | None => break,
                    }
                }
                drop(in_tx);
                Ok::<_, anyhow::Error>(acks)
            }
        };

        let body = self.inner.run(pipe, ctx.as_ref(), cancel.clone());
        let (acks, body_result) = tokio::join!(feed, body);
        body_result?;
        for ack in acks? {
            if matches!(ack.mode(), AckMode::AutoOnSinkSuccess | AckMode::Delayed) {
                ack.acknowledge().await;
            }
        }
        Ok(())
    }
}
