//! Node drivers: one per node, spawned by the runner.
//!
//! A driver pulls from its input edge(s), pushes through the node's
//! strategy-selected loop (sequential, parallel, batching, branching,
//! windowed, stream), and forwards watermarks and the end-of-stream marker.
//! Drivers own the restart loop: on a node failure the pipeline handler may
//! ask for a restart, which re-invokes the node factory and re-feeds the
//! materialization buffer.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use sluice_core::error::{BackoffState, DeadLetterEnvelope, EngineError, PipelineErrorDecision, RetryOptions};
use sluice_core::graph::NodeSpec;
use sluice_core::node::{BatchAssembler, NodeBody};
use sluice_core::observer::NodeStats;
use sluice_core::window::{StateOutput, TimeMode, WindowedState};
use sluice_core::{AckHandle, AckMode, Envelope, ExecutionContext, ItemBody, ItemRx, ItemTx, Message};

use crate::branch::branch_loop;
use crate::parallel::parallel_loop;
use crate::resilient::{resolve_acks, Invoker};
use crate::runner::RunWiring;

/// Watermark cadence for processing-time windowed nodes.
const PROCESSING_TICK: Duration = Duration::from_millis(25);

/// Items buffered so a restarted node can be re-fed its input. The cap is
/// charged on admission: on a streaming input, the first item that would
/// exceed it surfaces `ResourceExhaustion` rather than silently losing the
/// ability to restart.
pub(crate) struct ReplayBuffer {
    enabled: bool,
    cap: Option<usize>,
    node: String,
    entries: Vec<(usize, Envelope)>,
    overflowed: bool,
}

impl ReplayBuffer {
    fn new(enabled: bool, cap: Option<usize>, node: String) -> Self {
        Self {
            enabled,
            cap,
            node,
            entries: Vec::new(),
            overflowed: false,
        }
    }

    pub(crate) fn admit(&mut self, input: usize, env: &Envelope) -> Result<(), EngineError> {
        if !self.enabled {
            return Ok(());
        }
        if let Some(cap) = self.cap {
            if self.entries.len() >= cap {
                self.overflowed = true;
                return Err(EngineError::ResourceExhaustion {
                    node: self.node.clone(),
                    message: format!("materialization cap of {cap} items exceeded while buffering for restart"),
                });
            }
        }
        self.entries.push((input, env.clone()));
        Ok(())
    }

    fn disable(&mut self) {
        self.enabled = false;
        self.entries.clear();
    }

    fn snapshot(&self) -> Vec<(usize, Envelope)> {
        self.entries.clone()
    }

    fn overflowed(&self) -> bool {
        self.overflowed
    }
}

/// Run one node to completion, restarting it within the configured budget
/// when the pipeline handler asks for it.
pub(crate) async fn drive_node(
    spec: NodeSpec,
    mut inputs: Vec<ItemRx>,
    outputs: Vec<ItemTx>,
    wiring: RunWiring,
    cancel: CancellationToken,
) -> Result<NodeStats, EngineError> {
    let ctx = wiring.ctx.clone();
    ctx.observer().node_started(&spec.id);
    tracing::debug!(node = %spec.id, kind = ?spec.kind, "node driver started");
    let started = Instant::now();

    let retry = spec
        .options
        .retry
        .clone()
        .unwrap_or_else(|| wiring.global_retry.clone());
    let buffering = spec.options.resilient && retry.max_node_restart_attempts > 0 && !spec.inputs.is_empty();
    let mut replay = ReplayBuffer::new(buffering, retry.max_materialized_items, spec.id.clone());
    let mut stats = NodeStats::default();
    let mut restarts: u32 = 0;
    let mut backoff = BackoffState::new(&retry);
    let mut source_emitted: u64 = 0;
    let mut first_attempt = true;

    let result = loop {
        let body = (spec.factory)();
        if first_attempt {
            first_attempt = false;
            if !matches!(body, NodeBody::Item(_) | NodeBody::ItemSink(_) | NodeBody::Windowed(_)) {
                replay.disable();
            } else if replay.enabled && replay.cap.is_none() {
                break Err(EngineError::Configuration {
                    message: format!(
                        "node `{}` enables restart over a streaming input without a materialization cap",
                        spec.id
                    ),
                });
            }
        }
        let refeed = replay.snapshot();
        let attempt = run_node_once(
            &spec,
            body,
            &mut inputs,
            &outputs,
            &wiring,
            &cancel,
            &mut stats,
            &mut replay,
            refeed,
            &mut source_emitted,
            &retry,
        )
        .await;
        match attempt {
            Ok(()) => break Ok(()),
            Err(error) if error.is_cancelled() => break Err(error),
            Err(error) => {
                match wiring.pipeline_handler.on_node_error(&spec.id, &error) {
                    PipelineErrorDecision::FailPipeline => break Err(error),
                    PipelineErrorDecision::RestartNode => {
                        if replay.overflowed() {
                            break Err(EngineError::ResourceExhaustion {
                                node: spec.id.clone(),
                                message: "restart requested but the materialization buffer overflowed".to_string(),
                            });
                        }
                        restarts += 1;
                        if restarts > retry.max_node_restart_attempts {
                            break Err(error);
                        }
                        stats.restarts += 1;
                        ctx.observer().node_retried(&spec.id, restarts, &error.to_string());
                        tracing::warn!(
                            node = %spec.id,
                            restart = restarts,
                            error = %error,
                            "restarting node"
                        );
                        let delay = backoff.next_delay();
                        tokio::select! {
                            _ = cancel.cancelled() => break Err(EngineError::Cancelled),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        }
    };

    stats.elapsed = started.elapsed();
    match result {
        Ok(()) => {
            ctx.observer().node_completed(&spec.id, &stats);
            tracing::debug!(
                node = %spec.id,
                items_in = stats.items_in,
                items_out = stats.items_out,
                "node driver finished"
            );
            Ok(stats)
        }
        Err(error) if error.is_cancelled() => Err(error),
        Err(error) => {
            ctx.observer().node_failed(&spec.id, &error.to_string());
            tracing::error!(node = %spec.id, error = %error, "node driver failed");
            Err(error)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_node_once(
    spec: &NodeSpec,
    body: NodeBody,
    inputs: &mut [ItemRx],
    outputs: &[ItemTx],
    wiring: &RunWiring,
    cancel: &CancellationToken,
    stats: &mut NodeStats,
    replay: &mut ReplayBuffer,
    refeed: Vec<(usize, Envelope)>,
    source_emitted: &mut u64,
    retry: &RetryOptions,
) -> Result<(), EngineError> {
    let ctx = wiring.ctx.clone();
    match body {
        NodeBody::Source(mut source) => {
            let mut stream = source
                .open(&ctx, cancel.clone())
                .await
                .map_err(|source| EngineError::NodeInit {
                    node: spec.id.clone(),
                    source,
                })?;
            if *source_emitted > 0 && stream.is_replayable() {
                stream.skip(*source_emitted as usize);
            }
            let mut watermarks = spec
                .options
                .assigns_event_time
                .then(|| sluice_core::WatermarkGenerator::new(spec.options.out_of_orderness));
            let out = outputs.first().cloned();
            while let Some(env) = stream.next(cancel).await {
                let advanced = match (&mut watermarks, env.event_time) {
                    (Some(generator), Some(ts)) => generator.observe(ts),
                    _ => None,
                };
                let Some(out) = &out else { break };
                if out.send(Message::Item(env)).await.is_err() {
                    tracing::debug!(node = %spec.id, "downstream closed; source stopping");
                    break;
                }
                *source_emitted += 1;
                stats.items_out += 1;
                ctx.observer().item_emitted(&spec.id, 1);
                if let Some(watermark) = advanced {
                    if out.send(Message::Watermark(watermark)).await.is_err() {
                        break;
                    }
                }
            }
            send_eos(outputs).await;
            Ok(())
        }
        NodeBody::Item(item_body) => {
            let invoker = Arc::new(Invoker::new(spec, item_body, wiring, retry));
            let out = outputs.first().cloned();
            run_item_node(spec, invoker, inputs, out, wiring, cancel, stats, replay, refeed).await?;
            send_eos(outputs).await;
            Ok(())
        }
        NodeBody::ItemSink(sink) => {
            let delayed: Arc<tokio::sync::Mutex<Vec<AckHandle>>> = Arc::new(tokio::sync::Mutex::new(Vec::new()));
            let item_body = sink_body(sink.clone(), delayed.clone());
            let invoker = Arc::new(Invoker::new(spec, item_body, wiring, retry));
            run_item_node(spec, invoker, inputs, None, wiring, cancel, stats, replay, refeed).await?;
            sink.close(&ctx).await.map_err(|source| EngineError::ItemProcessing {
                node: spec.id.clone(),
                source,
            })?;
            for ack in delayed.lock().await.drain(..) {
                ack.acknowledge().await;
            }
            Ok(())
        }
        NodeBody::Batch(assemble) => {
            let out = outputs.first().cloned().ok_or_else(|| EngineError::Configuration {
                message: format!("batcher `{}` has no downstream edge", spec.id),
            })?;
            batch_loop(spec, assemble, &mut inputs[0], out, &ctx, cancel, stats).await?;
            send_eos(outputs).await;
            Ok(())
        }
        NodeBody::Branch => {
            // the per-subscriber forwarders deliver the final Eos themselves
            branch_loop(spec, &mut inputs[0], outputs, ctx, cancel, stats).await?;
            Ok(())
        }
        NodeBody::Windowed(mut state) => {
            let out = outputs.first().cloned();
            if spec.inputs.len() == 2 {
                windowed_dual(spec, &mut state, inputs, out, wiring, cancel, stats, replay, refeed).await?;
            } else {
                windowed_single(spec, &mut state, &mut inputs[0], out, wiring, cancel, stats, replay, refeed)
                    .await?;
            }
            stats.late_dropped += state.late_drops();
            send_eos(outputs).await;
            Ok(())
        }
        NodeBody::Stream(mut stream) => {
            let out = outputs.first().cloned().ok_or_else(|| EngineError::Configuration {
                message: format!("stream transform `{}` has no downstream edge", spec.id),
            })?;
            stream
                .run(&spec.id, &mut inputs[0], out, ctx, cancel.clone())
                .await
                .map_err(|source| EngineError::ItemProcessing {
                    node: spec.id.clone(),
                    source,
                })?;
            send_eos(outputs).await;
            Ok(())
        }
        NodeBody::StreamSink(mut sink) => {
            sink.run(&spec.id, &mut inputs[0], ctx, cancel.clone())
                .await
                .map_err(|source| EngineError::ItemProcessing {
                    node: spec.id.clone(),
                    source,
                })?;
            Ok(())
        }
    }
}

/// Per-item sink body: strip the acks, write, then resolve them according
/// to their mode. Delayed handles wait for a successful close.
fn sink_body(
    sink: Arc<dyn sluice_core::node::ErasedItemSink>,
    delayed: Arc<tokio::sync::Mutex<Vec<AckHandle>>>,
) -> ItemBody {
    Arc::new(move |mut env, ctx| {
        let sink = sink.clone();
        let delayed = delayed.clone();
        Box::pin(async move {
            let acks = std::mem::take(&mut env.acks);
            sink.write(env, &ctx).await?;
            for ack in acks {
                match ack.mode() {
                    AckMode::AutoOnSinkSuccess => {
                        ack.acknowledge().await;
                    }
                    AckMode::Delayed => delayed.lock().await.push(ack),
                    AckMode::Manual | AckMode::None => {}
                }
            }
            Ok(Vec::new())
        })
    })
}

#[allow(clippy::too_many_arguments)]
async fn run_item_node(
    spec: &NodeSpec,
    invoker: Arc<Invoker>,
    inputs: &mut [ItemRx],
    out: Option<ItemTx>,
    wiring: &RunWiring,
    cancel: &CancellationToken,
    stats: &mut NodeStats,
    replay: &mut ReplayBuffer,
    refeed: Vec<(usize, Envelope)>,
) -> Result<(), EngineError> {
    let parallel = spec
        .options
        .parallel
        .clone()
        .filter(|p| p.parallelism > 1);
    let result = match parallel {
        Some(options) => {
            parallel_loop(
                spec,
                &options,
                invoker.clone(),
                &mut inputs[0],
                out,
                wiring.ctx.clone(),
                cancel,
                stats,
                replay,
                refeed,
            )
            .await
        }
        None => {
            sequential_loop(spec, &invoker, &mut inputs[0], out, wiring, cancel, stats, replay, refeed).await
        }
    };
    stats.retries += invoker.retries();
    stats.dead_lettered += invoker.dead_lettered();
    result
}

#[allow(clippy::too_many_arguments)]
async fn sequential_loop(
    spec: &NodeSpec,
    invoker: &Invoker,
    input: &mut ItemRx,
    out: Option<ItemTx>,
    wiring: &RunWiring,
    cancel: &CancellationToken,
    stats: &mut NodeStats,
    replay: &mut ReplayBuffer,
    refeed: Vec<(usize, Envelope)>,
) -> Result<(), EngineError> {
    let ctx = &wiring.ctx;
    for (_, env) in refeed {
        if !forward_outputs(spec, invoker.invoke(env, ctx, cancel).await?, &out, ctx, stats).await {
            return Ok(());
        }
    }
    loop {
        match input.recv().await {
            None | Some(Message::Eos) => break,
            Some(Message::Item(env)) => {
                stats.items_in += 1;
                ctx.observer().item_consumed(&spec.id, 1);
                replay.admit(0, &env)?;
                if !forward_outputs(spec, invoker.invoke(env, ctx, cancel).await?, &out, ctx, stats).await {
                    break;
                }
            }
            Some(Message::Watermark(watermark)) => {
                if let Some(out) = &out {
                    if out.send(Message::Watermark(watermark)).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
    Ok(())
}

/// Push a body's outputs downstream; `false` once the downstream edge is
/// gone.
async fn forward_outputs(
    spec: &NodeSpec,
    outs: Vec<Envelope>,
    out: &Option<ItemTx>,
    ctx: &Arc<ExecutionContext>,
    stats: &mut NodeStats,
) -> bool {
    for env in outs {
        if let Some(out) = out {
            if out.send(Message::Item(env)).await.is_err() {
                tracing::debug!(node = %spec.id, "downstream closed");
                return false;
            }
            stats.items_out += 1;
            ctx.observer().item_emitted(&spec.id, 1);
        }
    }
    true
}

async fn batch_loop(
    spec: &NodeSpec,
    assemble: BatchAssembler,
    input: &mut ItemRx,
    out: ItemTx,
    ctx: &Arc<ExecutionContext>,
    cancel: &CancellationToken,
    stats: &mut NodeStats,
) -> Result<(), EngineError> {
    let options = spec.options.batch.clone().ok_or_else(|| EngineError::Configuration {
        message: format!("batcher `{}` has no batch options", spec.id),
    })?;
    // tiny windows flush right after the first item rather than paying
    // timer jitter
    let immediate = options.window <= Duration::from_millis(100);
    let mut buffer: Vec<Envelope> = Vec::new();
    let mut deadline: Option<Instant> = None;
    let mut downstream_open = true;

    macro_rules! flush {
        () => {
            if !buffer.is_empty() {
                let batch = assemble(std::mem::take(&mut buffer))?;
                deadline = None;
                if out.send(Message::Item(batch)).await.is_err() {
                    downstream_open = false;
                } else {
                    stats.items_out += 1;
                    ctx.observer().item_emitted(&spec.id, 1);
                }
            } else {
                deadline = None;
            }
        };
    }

    loop {
        let timer = async {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = cancel.cancelled() => {
                flush!();
                break;
            }
            _ = timer => {
                flush!();
            }
            msg = input.recv() => match msg {
                None | Some(Message::Eos) => {
                    flush!();
                    break;
                }
                Some(Message::Watermark(watermark)) => {
                    if out.send(Message::Watermark(watermark)).await.is_err() {
                        break;
                    }
                }
                Some(Message::Item(env)) => {
                    stats.items_in += 1;
                    ctx.observer().item_consumed(&spec.id, 1);
                    buffer.push(env);
                    if immediate || buffer.len() >= options.max_batch {
                        flush!();
                    } else if buffer.len() == 1 {
                        deadline = Some(Instant::now() + options.window);
                    }
                }
            }
        }
        if !downstream_open {
            break;
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn windowed_single(
    spec: &NodeSpec,
    state: &mut Box<dyn WindowedState>,
    input: &mut ItemRx,
    out: Option<ItemTx>,
    wiring: &RunWiring,
    cancel: &CancellationToken,
    stats: &mut NodeStats,
    replay: &mut ReplayBuffer,
    refeed: Vec<(usize, Envelope)>,
) -> Result<(), EngineError> {
    let ctx = wiring.ctx.clone();
    let processing = matches!(
        spec.options.window.as_ref().map(|w| w.time_mode),
        Some(TimeMode::Processing)
    );
    for (index, env) in refeed {
        let output = state.on_item(index, env, ctx.now_ms())?;
        emit_state_output(spec, output, &out, wiring, stats).await;
    }
    loop {
        let tick = async {
            if processing {
                tokio::time::sleep(PROCESSING_TICK).await
            } else {
                std::future::pending::<()>().await
            }
        };
        let output = tokio::select! {
            msg = input.recv() => match msg {
                None | Some(Message::Eos) => {
                    let output = state.on_eos(0);
                    emit_state_output(spec, output, &out, wiring, stats).await;
                    break;
                }
                Some(Message::Item(env)) => {
                    stats.items_in += 1;
                    ctx.observer().item_consumed(&spec.id, 1);
                    replay.admit(0, &env)?;
                    state.on_item(0, env, ctx.now_ms())?
                }
                Some(Message::Watermark(watermark)) => state.on_watermark(0, watermark),
            },
            _ = tick => state.on_watermark(0, ctx.now_ms()),
        };
        emit_state_output(spec, output, &out, wiring, stats).await;
        if cancel.is_cancelled() {
            let output = state.on_eos(0);
            emit_state_output(spec, output, &out, wiring, stats).await;
            break;
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn windowed_dual(
    spec: &NodeSpec,
    state: &mut Box<dyn WindowedState>,
    inputs: &mut [ItemRx],
    out: Option<ItemTx>,
    wiring: &RunWiring,
    cancel: &CancellationToken,
    stats: &mut NodeStats,
    replay: &mut ReplayBuffer,
    refeed: Vec<(usize, Envelope)>,
) -> Result<(), EngineError> {
    let ctx = wiring.ctx.clone();
    let processing = matches!(
        spec.options.window.as_ref().map(|w| w.time_mode),
        Some(TimeMode::Processing)
    );
    for (index, env) in refeed {
        let output = state.on_item(index, env, ctx.now_ms())?;
        emit_state_output(spec, output, &out, wiring, stats).await;
    }
    let (left, right) = inputs.split_at_mut(1);
    let left = &mut left[0];
    let right = &mut right[0];
    let mut eos = [false, false];
    while !(eos[0] && eos[1]) {
        let tick = async {
            if processing {
                tokio::time::sleep(PROCESSING_TICK).await
            } else {
                std::future::pending::<()>().await
            }
        };
        let (index, msg) = tokio::select! {
            msg = left.recv(), if !eos[0] => (0, msg),
            msg = right.recv(), if !eos[1] => (1, msg),
            _ = tick => {
                let now = ctx.now_ms();
                let output = state.on_watermark(0, now);
                emit_state_output(spec, output, &out, wiring, stats).await;
                let output = state.on_watermark(1, now);
                emit_state_output(spec, output, &out, wiring, stats).await;
                continue;
            }
        };
        let output = match msg {
            None | Some(Message::Eos) => {
                eos[index] = true;
                state.on_eos(index)
            }
            Some(Message::Item(env)) => {
                stats.items_in += 1;
                ctx.observer().item_consumed(&spec.id, 1);
                replay.admit(index, &env)?;
                state.on_item(index, env, ctx.now_ms())?
            }
            Some(Message::Watermark(watermark)) => state.on_watermark(index, watermark),
        };
        emit_state_output(spec, output, &out, wiring, stats).await;
        if cancel.is_cancelled() {
            break;
        }
    }
    Ok(())
}

/// Emit a windowed state's results: window outputs downstream, late items
/// to the dead-letter side channel, the combined watermark forward, and
/// orphaned acks resolved.
async fn emit_state_output(
    spec: &NodeSpec,
    output: StateOutput,
    out: &Option<ItemTx>,
    wiring: &RunWiring,
    stats: &mut NodeStats,
) {
    let ctx = &wiring.ctx;
    for env in output.emit {
        if let Some(out) = out {
            if out.send(Message::Item(env)).await.is_err() {
                return;
            }
            stats.items_out += 1;
            ctx.observer().item_emitted(&spec.id, 1);
        }
    }
    for env in output.side {
        match &wiring.dead_letter {
            Some(tx) => {
                let error = anyhow::anyhow!("late item past window close");
                resolve_acks(&env).await;
                let dl = DeadLetterEnvelope::new(&spec.id, env, &error, ctx.correlation_id());
                if tx.send(dl).await.is_err() {
                    tracing::warn!(node = %spec.id, "dead-letter sink unavailable for late item");
                }
            }
            None => {
                tracing::warn!(node = %spec.id, "late item dropped: no dead-letter sink bound");
                resolve_acks(&env).await;
                stats.late_dropped += 1;
            }
        }
    }
    if let Some(watermark) = output.forward_watermark {
        if let Some(out) = out {
            let _ = out.send(Message::Watermark(watermark)).await;
        }
    }
    for ack in output.acks_to_resolve {
        if matches!(ack.mode(), AckMode::AutoOnSinkSuccess | AckMode::Delayed) {
            ack.acknowledge().await;
        }
    }
}

async fn send_eos(outputs: &[ItemTx]) {
    for out in outputs {
        let _ = out.send(Message::Eos).await; // best-effort
    }
}
