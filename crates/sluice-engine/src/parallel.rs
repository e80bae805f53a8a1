//! The parallel strategy: a worker pool over a bounded work queue, with
//! Block/DropOldest/DropNewest queue policies and optional order-preserving
//! emission through a rank-tagged reorder buffer.
//!
//! Watermarks and end-of-stream act as drain barriers: in-flight work is
//! released downstream before the marker is forwarded, so markers never
//! overtake items.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use sluice_core::error::EngineError;
use sluice_core::graph::{ParallelOptions, QueuePolicy};
use sluice_core::observer::NodeStats;
use sluice_core::{Envelope, ExecutionContext, ItemTx, Message, NodeSpec};

use crate::drivers::ReplayBuffer;
use crate::resilient::{resolve_acks, Invoker};

struct WorkQueue {
    items: Mutex<VecDeque<(u64, Envelope)>>,
    capacity: usize,
    policy: QueuePolicy,
    closed: AtomicBool,
    not_empty: Notify,
    not_full: Notify,
    dropped: AtomicU64,
}

impl WorkQueue {
    fn new(capacity: usize, policy: QueuePolicy) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            capacity,
            policy,
            closed: AtomicBool::new(false),
            not_empty: Notify::new(),
            not_full: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Admit one item under the queue policy. `Dropped` carries the entry
    /// displaced by `DropOldest` / refused by `DropNewest`; the caller
    /// resolves its acks and reports its rank as an empty result so the
    /// reorder buffer never waits on a dropped rank. `Aborted` means the
    /// pool failed while a `Block` push was waiting for space.
    async fn push(&self, seq: u64, env: Envelope, abort: &CancellationToken) -> PushOutcome {
        let entry = (seq, env);
        loop {
            let not_full = self.not_full.notified();
            {
                let mut items = self.items.lock().expect("queue lock");
                if items.len() < self.capacity {
                    items.push_back(entry);
                    self.not_empty.notify_one();
                    return PushOutcome::Queued;
                }
                match self.policy {
                    QueuePolicy::Block => {}
                    QueuePolicy::DropOldest => {
                        let displaced = items.pop_front().expect("queue is full");
                        items.push_back(entry);
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        self.not_empty.notify_one();
                        return PushOutcome::Dropped(displaced);
                    }
                    QueuePolicy::DropNewest => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        return PushOutcome::Dropped(entry);
                    }
                }
            }
            tokio::select! {
                _ = not_full => {}
                _ = abort.cancelled() => return PushOutcome::Aborted,
            }
        }
    }

    /// Blocking pop; `None` once the queue is closed and drained.
    async fn pop(&self) -> Option<(u64, Envelope)> {
        loop {
            let not_empty = self.not_empty.notified();
            {
                let mut items = self.items.lock().expect("queue lock");
                if let Some(entry) = items.pop_front() {
                    self.not_full.notify_one();
                    return Some(entry);
                }
                if self.closed.load(Ordering::SeqCst) {
                    return None;
                }
            }
            not_empty.await;
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.not_empty.notify_waiters();
    }
}

enum PushOutcome {
    Queued,
    Dropped((u64, Envelope)),
    Aborted,
}

struct Emission {
    released: AtomicU64,
    emitted_items: AtomicU64,
    notify: Notify,
}

/// Drive a per-item node with `P > 1` workers.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn parallel_loop(
    spec: &NodeSpec,
    options: &ParallelOptions,
    invoker: Arc<Invoker>,
    input: &mut sluice_core::ItemRx,
    out: Option<ItemTx>,
    ctx: Arc<ExecutionContext>,
    cancel: &CancellationToken,
    stats: &mut NodeStats,
    replay: &mut ReplayBuffer,
    refeed: Vec<(usize, Envelope)>,
) -> Result<(), EngineError> {
    let workers = options.parallelism.max(1);
    let queue_capacity = options.max_queue.unwrap_or(workers).max(1);
    let queue = Arc::new(WorkQueue::new(queue_capacity, options.queue_policy));
    let emission = Arc::new(Emission {
        released: AtomicU64::new(0),
        emitted_items: AtomicU64::new(0),
        notify: Notify::new(),
    });
    let fail = CancellationToken::new();
    let failure: Arc<Mutex<Option<EngineError>>> = Arc::new(Mutex::new(None));

    let (results_tx, mut results_rx) =
        mpsc::channel::<(u64, Result<Vec<Envelope>, EngineError>)>(workers + queue_capacity + 1);
    let intake_results_tx = results_tx.clone();

    let mut worker_handles = Vec::with_capacity(workers);
    for _ in 0..workers {
        let queue = queue.clone();
        let invoker = invoker.clone();
        let ctx = ctx.clone();
        let cancel = cancel.clone();
        let results_tx = results_tx.clone();
        worker_handles.push(tokio::spawn(async move {
            while let Some((seq, env)) = queue.pop().await {
                let result = invoker.invoke(env, &ctx, &cancel).await;
                if results_tx.send((seq, result)).await.is_err() {
                    break;
                }
            }
        }));
    }
    drop(results_tx);

    let emitter = {
        let emission = emission.clone();
        let fail = fail.clone();
        let failure = failure.clone();
        let out = out.clone();
        let ctx = ctx.clone();
        let node_id = spec.id.clone();
        let preserve_ordering = options.preserve_ordering;
        tokio::spawn(async move {
            let mut next_seq: u64 = 0;
            let mut reorder: BTreeMap<u64, Vec<Envelope>> = BTreeMap::new();
            let mut downstream_open = true;
            while let Some((seq, result)) = results_rx.recv().await {
                let outs = match result {
                    Ok(outs) => outs,
                    Err(error) => {
                        *failure.lock().expect("failure lock") = Some(error);
                        fail.cancel();
                        return;
                    }
                };
                let batches: Vec<Vec<Envelope>> = if preserve_ordering {
                    reorder.insert(seq, outs);
                    let mut ready = Vec::new();
                    while let Some(outs) = reorder.remove(&next_seq) {
                        ready.push(outs);
                        next_seq += 1;
                    }
                    ready
                } else {
                    vec![outs]
                };
                for outs in batches {
                    for env in outs {
                        if downstream_open {
                            if let Some(out) = &out {
                                if out.send(Message::Item(env)).await.is_err() {
                                    downstream_open = false;
                                    continue;
                                }
                                ctx.observer().item_emitted(&node_id, 1);
                                emission.emitted_items.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    }
                    emission.released.fetch_add(1, Ordering::Relaxed);
                    emission.notify.notify_waiters();
                }
            }
        })
    };

    // intake loop
    let mut submitted: u64 = 0;
    let mut error: Option<EngineError> = None;
    for (_, env) in refeed {
        match queue.push(submitted, env, &fail).await {
            PushOutcome::Queued => {}
            PushOutcome::Dropped((dropped_seq, dropped_env)) => {
                resolve_acks(&dropped_env).await;
                let _ = intake_results_tx.send((dropped_seq, Ok(Vec::new()))).await;
            }
            PushOutcome::Aborted => break,
        }
        submitted += 1;
    }
    loop {
        let msg = tokio::select! {
            _ = fail.cancelled() => break,
            _ = cancel.cancelled() => break,
            m = input.recv() => match m {
                Some(m) => m,
                None => break,
            },
        };
        match msg {
            Message::Item(env) => {
                stats.items_in += 1;
                ctx.observer().item_consumed(&spec.id, 1);
                if let Err(e) = replay.admit(0, &env) {
                    error = Some(e);
                    break;
                }
                match queue.push(submitted, env, &fail).await {
                    PushOutcome::Queued => {}
                    PushOutcome::Dropped((dropped_seq, dropped_env)) => {
                        resolve_acks(&dropped_env).await;
                        let _ = intake_results_tx.send((dropped_seq, Ok(Vec::new()))).await;
                    }
                    PushOutcome::Aborted => break,
                }
                submitted += 1;
            }
            Message::Watermark(w) => {
                drain_barrier(&emission, &fail, submitted).await;
                if let Some(out) = &out {
                    let _ = out.send(Message::Watermark(w)).await;
                }
            }
            Message::Eos => break,
        }
    }

    // drain in-flight work, then shut the pool down
    drain_barrier(&emission, &fail, submitted).await;
    queue.close();
    for handle in worker_handles {
        let _ = handle.await;
    }
    drop(intake_results_tx);
    let _ = emitter.await;

    stats.items_out += emission.emitted_items.load(Ordering::Relaxed);
    stats.dropped += queue.dropped.load(Ordering::Relaxed);
    stats.retries += invoker.retries();
    stats.dead_lettered += invoker.dead_lettered();

    if error.is_none() {
        error = failure.lock().expect("failure lock").take();
    }
    match error {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

/// Wait until every submitted rank has been released downstream (or the
/// pool failed). Dropped ranks flow through the emitter as empty results,
/// so the released counter covers them too.
async fn drain_barrier(emission: &Emission, fail: &CancellationToken, submitted: u64) {
    loop {
        if emission.released.load(Ordering::SeqCst) >= submitted {
            return;
        }
        let notified = emission.notify.notified();
        if emission.released.load(Ordering::SeqCst) >= submitted {
            return;
        }
        tokio::select! {
            _ = notified => {}
            _ = fail.cancelled() => return,
        }
    }
}
