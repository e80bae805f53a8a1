//! Branch (multicast) driver: every subscriber sees every input item in
//! input order through its own bounded buffer, so a slow subscriber
//! backpressures only itself until that buffer fills.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use sluice_core::error::EngineError;
use sluice_core::graph::{BranchOptions, FaultPropagation};
use sluice_core::observer::{BranchSubscriberStats, NodeStats};
use sluice_core::{ExecutionContext, ItemRx, ItemTx, Message, NodeSpec};

struct Subscriber {
    tx: Option<mpsc::Sender<Message>>,
    backlog: Arc<AtomicU64>,
    high_water: Arc<AtomicU64>,
    forwarded: Arc<AtomicU64>,
    faulted: Arc<AtomicBool>,
    handle: tokio::task::JoinHandle<bool>,
}

pub(crate) async fn branch_loop(
    spec: &NodeSpec,
    input: &mut ItemRx,
    outputs: &[ItemTx],
    ctx: Arc<ExecutionContext>,
    _cancel: &CancellationToken,
    stats: &mut NodeStats,
) -> Result<(), EngineError> {
    let options = spec.options.branch.clone().unwrap_or_else(BranchOptions::default);
    let mut subscribers: Vec<Subscriber> = outputs
        .iter()
        .map(|out| {
            let (tx, mut rx) = mpsc::channel::<Message>(options.subscriber_capacity.max(1));
            let backlog = Arc::new(AtomicU64::new(0));
            let high_water = Arc::new(AtomicU64::new(0));
            let forwarded = Arc::new(AtomicU64::new(0));
            let faulted = Arc::new(AtomicBool::new(false));
            let out = out.clone();
            let handle = {
                let backlog = backlog.clone();
                let forwarded = forwarded.clone();
                let faulted = faulted.clone();
                tokio::spawn(async move {
                    while let Some(msg) = rx.recv().await {
                        let is_item = matches!(msg, Message::Item(_));
                        if is_item {
                            backlog.fetch_sub(1, Ordering::Relaxed);
                        }
                        if out.send(msg).await.is_err() {
                            faulted.store(true, Ordering::SeqCst);
                            return false;
                        }
                        if is_item {
                            forwarded.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    true
                })
            };
            Subscriber {
                tx: Some(tx),
                backlog,
                high_water,
                forwarded,
                faulted,
                handle,
            }
        })
        .collect();

    loop {
        let msg = match input.recv().await {
            Some(msg) => msg,
            None => break,
        };
        let eos = matches!(msg, Message::Eos);
        if !eos {
            if let Message::Item(_) = &msg {
                stats.items_in += 1;
                ctx.observer().item_consumed(&spec.id, 1);
            }
            for sub in subscribers.iter_mut() {
                if sub.faulted.load(Ordering::SeqCst) {
                    sub.tx = None;
                    continue;
                }
                let Some(tx) = &sub.tx else { continue };
                if let Message::Item(_) = &msg {
                    let depth = sub.backlog.fetch_add(1, Ordering::Relaxed) + 1;
                    sub.high_water.fetch_max(depth, Ordering::Relaxed);
                }
                if tx.send(msg.clone()).await.is_err() {
                    sub.faulted.store(true, Ordering::SeqCst);
                    sub.tx = None;
                }
            }
            let any_faulted = subscribers.iter().any(|s| s.faulted.load(Ordering::SeqCst));
            if any_faulted && options.fault_propagation == FaultPropagation::All {
                return Err(EngineError::Transport {
                    node: spec.id.clone(),
                    message: "a branch subscriber faulted and fault propagation is set to all".to_string(),
                });
            }
        } else {
            break;
        }
    }

    // close the buffers and let every subscriber drain
    for sub in subscribers.iter_mut() {
        if let Some(tx) = sub.tx.take() {
            let _ = tx.send(Message::Eos).await;
        }
    }
    let mut completions = 0u64;
    for sub in subscribers {
        let completed = sub.handle.await.unwrap_or(false);
        if completed {
            completions += 1;
        }
        let forwarded = sub.forwarded.load(Ordering::Relaxed);
        stats.items_out += forwarded;
        stats.subscribers.push(BranchSubscriberStats {
            forwarded,
            backlog_high_water: sub.high_water.load(Ordering::Relaxed),
            faulted: sub.faulted.load(Ordering::SeqCst),
            completed,
        });
    }
    tracing::debug!(
        node = %spec.id,
        completions,
        subscribers = stats.subscribers.len(),
        "branch drained"
    );
    Ok(())
}
