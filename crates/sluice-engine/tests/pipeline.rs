//! End-to-end pipeline scenarios: linear transforms, batching, unbatching,
//! multicast, lookup, parallel execution, acknowledgments and cancellation.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use sluice_core::{
    AckHandle, AckMessage, AckMode, BatchOptions, BranchOptions, CollectingObserver,
    ContextConfiguration, ExecutionContext, LookupOptions, LookupResolver, OnMiss,
    ParallelOptions, PipelineBuilder, QueuePolicy,
};
use sluice_engine::{RunStatus, Runner, RunnerOptions};
use sluice_io::{map_fn, transform_fn, CollectSink, FilterTransform, VecSource};

fn runner() -> Runner {
    Runner::new(RunnerOptions::default())
}

#[tokio::test]
async fn simple_transform_doubles_every_item() {
    let sink = CollectSink::<i32>::new();
    let mut b = PipelineBuilder::new();
    b.add_source("numbers", || VecSource::new(vec![1, 2, 3, 4, 5]))
        .add_transform("double", || map_fn(|x: i32| x * 2))
        .add_sink("collect", {
            let sink = sink.clone();
            move || sink.clone()
        })
        .connect("numbers", "double")
        .connect("double", "collect");
    let graph = b.build().unwrap();

    let summary = runner().run(&graph, ContextConfiguration::default()).await.unwrap();
    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(sink.items(), vec![2, 4, 6, 8, 10]);
    assert_eq!(summary.stats["double"].items_in, 5);
    assert_eq!(summary.stats["double"].items_out, 5);
}

#[tokio::test]
async fn order_preserving_chain_equals_plain_map() {
    let input: Vec<i64> = (0..200).collect();
    let expected: Vec<i64> = input.iter().map(|x| (x + 1) * 3).collect();

    let sink = CollectSink::<i64>::new();
    let mut b = PipelineBuilder::new();
    b.add_source("src", {
        let input = input.clone();
        move || VecSource::new(input.clone())
    })
    .add_transform("inc", || map_fn(|x: i64| x + 1))
    .add_passthrough::<i64>("tap")
    .add_transform("triple", || map_fn(|x: i64| x * 3))
    .add_sink("out", {
        let sink = sink.clone();
        move || sink.clone()
    })
    .connect("src", "inc")
    .connect("inc", "tap")
    .connect("tap", "triple")
    .connect("triple", "out");

    let graph = b.build().unwrap();
    runner().run(&graph, ContextConfiguration::default()).await.unwrap();
    assert_eq!(sink.items(), expected);
}

#[tokio::test]
async fn batcher_flushes_on_size_and_end_of_stream() {
    let sink = CollectSink::<Vec<i32>>::new();
    let mut b = PipelineBuilder::new();
    b.add_source("src", || VecSource::new((1..=25).collect::<Vec<i32>>()))
        .add_batcher::<i32>(
            "batch",
            BatchOptions {
                max_batch: 10,
                window: Duration::from_secs(5),
            },
        )
        .add_sink("out", {
            let sink = sink.clone();
            move || sink.clone()
        })
        .connect("src", "batch")
        .connect("batch", "out");

    let graph = b.build().unwrap();
    runner().run(&graph, ContextConfiguration::default()).await.unwrap();

    let batches = sink.items();
    assert_eq!(batches.len(), 3);
    assert_eq!(batches[0], (1..=10).collect::<Vec<i32>>());
    assert_eq!(batches[1], (11..=20).collect::<Vec<i32>>());
    assert_eq!(batches[2], (21..=25).collect::<Vec<i32>>());
    assert!(batches.iter().all(|b| !b.is_empty() && b.len() <= 10));
}

#[tokio::test]
async fn unbatching_inverts_batching() {
    let sink = CollectSink::<i32>::new();
    let mut b = PipelineBuilder::new();
    b.add_source("src", || VecSource::new((1..=25).collect::<Vec<i32>>()))
        .add_batcher::<i32>(
            "batch",
            BatchOptions {
                max_batch: 10,
                window: Duration::from_secs(5),
            },
        )
        .add_unbatcher::<i32>("unbatch")
        .add_sink("out", {
            let sink = sink.clone();
            move || sink.clone()
        })
        .connect("src", "batch")
        .connect("batch", "unbatch")
        .connect("unbatch", "out");

    let graph = b.build().unwrap();
    runner().run(&graph, ContextConfiguration::default()).await.unwrap();
    assert_eq!(sink.items(), (1..=25).collect::<Vec<i32>>());
}

#[tokio::test]
async fn explicit_branch_feeds_every_subscriber_in_order() {
    let upper_sink = CollectSink::<String>::new();
    let reverse_sink = CollectSink::<String>::new();
    let mut b = PipelineBuilder::new();
    b.add_source("src", || {
        VecSource::new(vec!["ab".to_string(), "cd".to_string()])
    })
    .add_branch::<String>("split")
    .add_transform("upper", || map_fn(|s: String| s.to_uppercase()))
    .add_transform("reverse", || map_fn(|s: String| s.chars().rev().collect::<String>()))
    .add_sink("upper_out", {
        let sink = upper_sink.clone();
        move || sink.clone()
    })
    .add_sink("reverse_out", {
        let sink = reverse_sink.clone();
        move || sink.clone()
    })
    .connect("src", "split")
    .connect("split", "upper")
    .connect("split", "reverse")
    .connect("upper", "upper_out")
    .connect("reverse", "reverse_out");

    let graph = b.build().unwrap();
    let summary = runner().run(&graph, ContextConfiguration::default()).await.unwrap();
    assert_eq!(upper_sink.items(), vec!["AB".to_string(), "CD".to_string()]);
    assert_eq!(reverse_sink.items(), vec!["ba".to_string(), "dc".to_string()]);

    let branch_stats = &summary.stats["split"];
    assert_eq!(branch_stats.subscribers.len(), 2);
    assert!(branch_stats.subscribers.iter().all(|s| s.completed && !s.faulted));
    assert!(branch_stats.subscribers.iter().all(|s| s.forwarded == 2));
}

#[tokio::test]
async fn implicit_fan_out_behaves_like_a_branch() {
    let a = CollectSink::<i32>::new();
    let b_sink = CollectSink::<i32>::new();
    let mut b = PipelineBuilder::new();
    b.add_source("src", || VecSource::new(vec![1, 2, 3]))
        .add_transform("plus", || map_fn(|x: i32| x + 1))
        .add_transform("minus", || map_fn(|x: i32| x - 1))
        .add_sink("a", {
            let sink = a.clone();
            move || sink.clone()
        })
        .add_sink("b", {
            let sink = b_sink.clone();
            move || sink.clone()
        })
        .connect("src", "plus")
        .connect("src", "minus")
        .connect("plus", "a")
        .connect("minus", "b");

    let graph = b.build().unwrap();
    runner().run(&graph, ContextConfiguration::default()).await.unwrap();
    assert_eq!(a.items(), vec![2, 3, 4]);
    assert_eq!(b_sink.items(), vec![0, 1, 2]);
}

#[tokio::test]
async fn slow_subscriber_does_not_starve_the_fast_one() {
    let fast = CollectSink::<i32>::new();
    let slow = CollectSink::<i32>::new();
    let mut b = PipelineBuilder::new();
    b.add_source("src", || VecSource::new((0..50).collect::<Vec<i32>>()))
        .add_branch_with::<i32>(
            "split",
            BranchOptions {
                subscriber_capacity: 4,
                ..BranchOptions::default()
            },
        )
        .add_transform("quick", || map_fn(|x: i32| x))
        .add_transform("sleepy", || {
            transform_fn(|x: i32| async move {
                tokio::time::sleep(Duration::from_millis(1)).await;
                Ok(x)
            })
        })
        .add_sink("fast", {
            let sink = fast.clone();
            move || sink.clone()
        })
        .add_sink("slow", {
            let sink = slow.clone();
            move || sink.clone()
        })
        .connect("src", "split")
        .connect("split", "quick")
        .connect("split", "sleepy")
        .connect("quick", "fast")
        .connect("sleepy", "slow");

    let graph = b.build().unwrap();
    runner().run(&graph, ContextConfiguration::default()).await.unwrap();
    // multicast fidelity: both subscribers observed the full input in order
    assert_eq!(fast.items(), (0..50).collect::<Vec<i32>>());
    assert_eq!(slow.items(), (0..50).collect::<Vec<i32>>());
}

struct ParityResolver;

#[async_trait]
impl LookupResolver<i32, String> for ParityResolver {
    async fn resolve(&self, key: &i32, _ctx: &ExecutionContext) -> anyhow::Result<Option<String>> {
        Ok((key % 2 == 0).then(|| "even".to_string()))
    }
}

#[tokio::test]
async fn lookup_drops_misses_when_asked_to() {
    let sink = CollectSink::<(i32, String)>::new();
    let mut b = PipelineBuilder::new();
    b.add_source("src", || VecSource::new(vec![1, 2, 3, 4]))
        .add_lookup(
            "enrich",
            |x: &i32| *x,
            || ParityResolver,
            |x: i32, v: Option<String>| (x, v.unwrap_or_default()),
            LookupOptions {
                cached: true,
                on_miss: OnMiss::Drop,
            },
        )
        .add_sink("out", {
            let sink = sink.clone();
            move || sink.clone()
        })
        .connect("src", "enrich")
        .connect("enrich", "out");

    let graph = b.build().unwrap();
    runner().run(&graph, ContextConfiguration::default()).await.unwrap();
    assert_eq!(
        sink.items(),
        vec![(2, "even".to_string()), (4, "even".to_string())]
    );
}

#[tokio::test]
async fn stream_transform_filters_inside_the_pipeline() {
    let sink = CollectSink::<i32>::new();
    let mut b = PipelineBuilder::new();
    b.add_source("src", || VecSource::new((1..=10).collect::<Vec<i32>>()))
        .add_stream_transform("evens", || FilterTransform::new(|x: &i32| x % 2 == 0))
        .add_sink("out", {
            let sink = sink.clone();
            move || sink.clone()
        })
        .connect("src", "evens")
        .connect("evens", "out");

    let graph = b.build().unwrap();
    runner().run(&graph, ContextConfiguration::default()).await.unwrap();
    assert_eq!(sink.items(), vec![2, 4, 6, 8, 10]);
}

#[tokio::test(start_paused = true)]
async fn ordered_parallel_execution_preserves_input_order() {
    let sink = CollectSink::<u64>::new();
    let mut b = PipelineBuilder::new();
    b.add_source("src", || VecSource::new((0..16u64).collect::<Vec<u64>>()))
        .add_transform("jittery", || {
            transform_fn(|x: u64| async move {
                // later items finish first without the reorder buffer
                tokio::time::sleep(Duration::from_millis(20 - x)).await;
                Ok(x)
            })
        })
        .add_sink("out", {
            let sink = sink.clone();
            move || sink.clone()
        })
        .connect("src", "jittery")
        .connect("jittery", "out")
        .set_parallelism(
            "jittery",
            ParallelOptions {
                parallelism: 4,
                max_queue: Some(4),
                queue_policy: QueuePolicy::Block,
                preserve_ordering: true,
            },
        );

    let graph = b.build().unwrap();
    runner().run(&graph, ContextConfiguration::default()).await.unwrap();
    assert_eq!(sink.items(), (0..16u64).collect::<Vec<u64>>());
}

#[tokio::test(start_paused = true)]
async fn unordered_parallel_execution_loses_no_items() {
    let sink = CollectSink::<u64>::new();
    let mut b = PipelineBuilder::new();
    b.add_source("src", || VecSource::new((0..32u64).collect::<Vec<u64>>()))
        .add_transform("jittery", || {
            transform_fn(|x: u64| async move {
                tokio::time::sleep(Duration::from_millis(x % 7)).await;
                Ok(x * 10)
            })
        })
        .add_sink("out", {
            let sink = sink.clone();
            move || sink.clone()
        })
        .connect("src", "jittery")
        .connect("jittery", "out")
        .set_parallelism(
            "jittery",
            ParallelOptions {
                parallelism: 8,
                max_queue: Some(8),
                queue_policy: QueuePolicy::Block,
                preserve_ordering: false,
            },
        );

    let graph = b.build().unwrap();
    runner().run(&graph, ContextConfiguration::default()).await.unwrap();
    let mut seen = sink.items();
    seen.sort_unstable();
    assert_eq!(seen, (0..32u64).map(|x| x * 10).collect::<Vec<u64>>());
}

#[tokio::test]
async fn drop_policy_sheds_load_without_losing_accounting() {
    let sink = CollectSink::<u64>::new();
    let mut b = PipelineBuilder::new();
    b.add_source("src", || VecSource::new((0..40u64).collect::<Vec<u64>>()))
        .add_transform("slow", || {
            transform_fn(|x: u64| async move {
                tokio::time::sleep(Duration::from_millis(2)).await;
                Ok(x)
            })
        })
        .add_sink("out", {
            let sink = sink.clone();
            move || sink.clone()
        })
        .connect("src", "slow")
        .connect("slow", "out")
        .set_parallelism(
            "slow",
            ParallelOptions {
                parallelism: 2,
                max_queue: Some(2),
                queue_policy: QueuePolicy::DropOldest,
                preserve_ordering: false,
            },
        );

    let graph = b.build().unwrap();
    let summary = runner().run(&graph, ContextConfiguration::default()).await.unwrap();
    let processed = sink.len() as u64;
    let dropped = summary.stats["slow"].dropped;
    assert_eq!(processed + dropped, 40, "every item is either processed or counted as dropped");
}

struct HoldOpenSource {
    rx: Mutex<Option<mpsc::Receiver<i32>>>,
}

#[async_trait]
impl sluice_core::Source<i32> for HoldOpenSource {
    async fn open(
        &mut self,
        _ctx: &ExecutionContext,
        _cancel: CancellationToken,
    ) -> anyhow::Result<sluice_core::DataPipe<i32>> {
        let rx = self
            .rx
            .lock()
            .expect("rx lock")
            .take()
            .ok_or_else(|| anyhow::anyhow!("already opened"))?;
        Ok(sluice_core::DataPipe::from_channel(rx))
    }
}

#[tokio::test]
async fn cancellation_ends_the_run_as_cancelled_not_failed() {
    let (tx, rx) = mpsc::channel::<i32>(8);
    let sink = CollectSink::<i32>::new();
    let rx = Arc::new(Mutex::new(Some(rx)));

    let mut b = PipelineBuilder::new();
    b.add_source("src", {
        let rx = rx.clone();
        move || HoldOpenSource {
            rx: Mutex::new(rx.lock().expect("rx lock").take()),
        }
    })
    .add_transform("double", || map_fn(|x: i32| x * 2))
    .add_sink("out", {
        let sink = sink.clone();
        move || sink.clone()
    })
    .connect("src", "double")
    .connect("double", "out");
    let graph = b.build().unwrap();

    let cancel = CancellationToken::new();
    let run = {
        let cancel = cancel.clone();
        let runner = runner();
        tokio::spawn(async move { runner.run_with_cancel(&graph, ContextConfiguration::default(), cancel).await })
    };

    tx.send(1).await.unwrap();
    tx.send(2).await.unwrap();
    // wait for the items to land, then cancel while the source is blocked
    tokio::time::timeout(Duration::from_secs(5), async {
        while sink.len() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("sink should receive both items");
    cancel.cancel();

    let summary = run.await.unwrap().unwrap();
    assert_eq!(summary.status, RunStatus::Cancelled);
    assert_eq!(sink.items(), vec![2, 4]);
}

#[tokio::test]
async fn auto_acknowledgments_fire_in_input_order_exactly_once() {
    let acked: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
    let (tx, rx) = mpsc::channel::<AckMessage<u32>>(16);
    for id in 0..10u32 {
        let acked = acked.clone();
        let handle = AckHandle::new(AckMode::AutoOnSinkSuccess, move || {
            let acked = acked.clone();
            async move {
                acked.lock().expect("ack lock").push(id);
            }
        });
        tx.send(AckMessage::new(id, format!("m-{id}"), handle))
            .await
            .unwrap();
    }
    drop(tx);

    let sink = CollectSink::<u32>::new();
    let rx = Arc::new(Mutex::new(Some(rx)));
    let mut b = PipelineBuilder::new();
    b.add_ack_source(
        "queue",
        {
            let rx = rx.clone();
            move || sluice_io::AckChannelSource::new(rx.lock().expect("rx lock").take().expect("single run"))
        },
        AckMode::AutoOnSinkSuccess,
    )
    .add_transform("ident", || map_fn(|x: u32| x))
    .add_sink("out", {
        let sink = sink.clone();
        move || sink.clone()
    })
    .connect("queue", "ident")
    .connect("ident", "out");

    let graph = b.build().unwrap();
    runner().run(&graph, ContextConfiguration::default()).await.unwrap();

    assert_eq!(sink.items(), (0..10).collect::<Vec<u32>>());
    // a gapless prefix, in input order, each exactly once
    assert_eq!(*acked.lock().expect("ack lock"), (0..10).collect::<Vec<u32>>());
}

#[tokio::test]
async fn observer_sees_the_node_lifecycle() {
    let observer = Arc::new(CollectingObserver::new());
    let sink = CollectSink::<i32>::new();
    let mut b = PipelineBuilder::new();
    b.add_source("src", || VecSource::new(vec![1, 2, 3]))
        .add_transform("double", || map_fn(|x: i32| x * 2))
        .add_sink("out", {
            let sink = sink.clone();
            move || sink.clone()
        })
        .connect("src", "double")
        .connect("double", "out");
    let graph = b.build().unwrap();

    let config = ContextConfiguration::default().with_observer(observer.clone());
    runner().run(&graph, config).await.unwrap();

    assert_eq!(observer.emitted_for("double"), 3);
    let events = observer.events();
    use sluice_core::ObserverEvent as E;
    assert!(events.contains(&E::Started("src".to_string())));
    assert!(events.contains(&E::Completed("out".to_string())));
    assert!(events.iter().any(|e| matches!(e, E::Consumed(node, _) if node == "double")));
}

/// Regression guard for per-run instance isolation: two runs of the same
/// graph construct fresh node instances and do not share transform state.
#[tokio::test]
async fn each_run_gets_fresh_node_instances() {
    let instances = Arc::new(AtomicU32::new(0));
    let sink = CollectSink::<u32>::new();
    let mut b = PipelineBuilder::new();
    b.add_source("src", || VecSource::new(vec![1u32, 2, 3]))
        .add_transform("count", {
            let instances = instances.clone();
            move || {
                instances.fetch_add(1, Ordering::SeqCst);
                map_fn(|x: u32| x)
            }
        })
        .add_sink("out", {
            let sink = sink.clone();
            move || sink.clone()
        })
        .connect("src", "count")
        .connect("count", "out");
    let graph = b.build().unwrap();

    let r = runner();
    r.run(&graph, ContextConfiguration::default()).await.unwrap();
    r.run(&graph, ContextConfiguration::default()).await.unwrap();
    assert_eq!(instances.load(Ordering::SeqCst), 2);
    assert_eq!(sink.items(), vec![1, 2, 3, 1, 2, 3]);
}
