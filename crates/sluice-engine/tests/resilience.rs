//! End-to-end resilience scenarios: retry budgets, dead-lettering, node
//! restart with input re-feed, the materialization cap, and the circuit
//! breaker.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use sluice_core::{
    node_handler_fn, pipeline_handler_fn, CircuitBreakerOptions, CollectingObserver,
    ContextConfiguration, DeadLetterEnvelope, EngineError, ExecutionContext, ItemTransform, Jitter,
    NodeErrorDecision, PipelineBuilder, PipelineErrorDecision, RetryOptions,
};
use sluice_engine::{Runner, RunnerOptions};
use sluice_io::{map_fn, CollectSink, VecSource};

fn runner() -> Runner {
    Runner::new(RunnerOptions::default())
}

fn fast_retry() -> RetryOptions {
    RetryOptions {
        backoff_base: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
        jitter: Jitter::None,
        ..RetryOptions::default()
    }
}

/// Fails the first `fail_times` invocations, then echoes its input.
struct Flaky {
    fail_times: u32,
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl ItemTransform<i32, i32> for Flaky {
    async fn apply(&self, item: i32, _ctx: &ExecutionContext) -> anyhow::Result<i32> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.fail_times {
            anyhow::bail!("transient failure {call}");
        }
        Ok(item)
    }
}

#[tokio::test]
async fn transient_failures_are_retried_and_reported() {
    let calls = Arc::new(AtomicU32::new(0));
    let observer = Arc::new(CollectingObserver::new());
    let sink = CollectSink::<i32>::new();

    let mut b = PipelineBuilder::new();
    b.add_source("src", || VecSource::new(vec![42]))
        .add_transform("flaky", {
            let calls = calls.clone();
            move || Flaky {
                fail_times: 2,
                calls: calls.clone(),
            }
        })
        .add_sink("out", {
            let sink = sink.clone();
            move || sink.clone()
        })
        .connect("src", "flaky")
        .connect("flaky", "out")
        .with_resilience("flaky")
        .with_error_handler("flaky", node_handler_fn(|_, _, _| NodeErrorDecision::Retry))
        .with_retry_options(RetryOptions {
            max_item_retries: 3,
            ..fast_retry()
        });

    let graph = b.build().unwrap();
    let config = ContextConfiguration::default().with_observer(observer.clone());
    runner().run(&graph, config).await.unwrap();

    assert_eq!(sink.items(), vec![42]);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(observer.retries_for("flaky"), 2);
}

#[tokio::test]
async fn retry_budget_exhaustion_fails_the_run() {
    let calls = Arc::new(AtomicU32::new(0));
    let sink = CollectSink::<i32>::new();

    let mut b = PipelineBuilder::new();
    b.add_source("src", || VecSource::new(vec![7]))
        .add_transform("broken", {
            let calls = calls.clone();
            move || Flaky {
                fail_times: u32::MAX,
                calls: calls.clone(),
            }
        })
        .add_sink("out", {
            let sink = sink.clone();
            move || sink.clone()
        })
        .connect("src", "broken")
        .connect("broken", "out")
        .with_resilience("broken")
        .with_error_handler("broken", node_handler_fn(|_, _, _| NodeErrorDecision::Retry))
        .with_retry_options(RetryOptions {
            max_item_retries: 2,
            ..fast_retry()
        });

    let graph = b.build().unwrap();
    let failure = runner()
        .run(&graph, ContextConfiguration::default())
        .await
        .unwrap_err();
    assert_eq!(failure.node_id, "broken");
    assert!(matches!(failure.error, EngineError::ItemProcessing { .. }));
    // first attempt + two retries
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(sink.is_empty());
}

#[tokio::test]
async fn dead_letter_routes_failed_items_and_keeps_the_run_alive() {
    let sink = CollectSink::<i32>::new();
    let dead = CollectSink::<DeadLetterEnvelope>::new();

    let mut b = PipelineBuilder::new();
    b.add_source("src", || VecSource::new(vec![1, 2, 3, 4, 5, 6]))
        .add_transform("odd_hater", || {
            sluice_io::transform_fn(|x: i32| async move {
                if x % 2 == 1 {
                    anyhow::bail!("odd item {x}");
                }
                Ok(x)
            })
        })
        .add_sink("out", {
            let sink = sink.clone();
            move || sink.clone()
        })
        .connect("src", "odd_hater")
        .connect("odd_hater", "out")
        .with_resilience("odd_hater")
        .with_error_handler("odd_hater", node_handler_fn(|_, _, _| NodeErrorDecision::DeadLetter))
        .with_dead_letter({
            let dead = dead.clone();
            move || dead.clone()
        })
        .with_retry_options(fast_retry());

    let graph = b.build().unwrap();
    let summary = runner().run(&graph, ContextConfiguration::default()).await.unwrap();

    assert_eq!(sink.items(), vec![2, 4, 6]);
    let letters = dead.items();
    assert_eq!(letters.len(), 3);
    assert!(letters.iter().all(|l| l.node_id == "odd_hater"));
    assert!(letters.iter().all(|l| !l.correlation_id.is_empty()));
    assert!(letters[0].error_message.contains("odd item 1"));
    assert_eq!(letters[0].item.payload_ref::<i32>(), Some(&1));
    assert_eq!(summary.stats["odd_hater"].dead_lettered, 3);
}

/// The first node instance dies on item 3; the pipeline handler asks for a
/// restart, the factory builds a second instance, and the materialization
/// buffer re-feeds everything consumed so far. Downstream therefore sees
/// the buffered prefix twice: restart is at-least-once.
#[tokio::test]
async fn restart_reinitializes_the_node_and_refeeds_buffered_input() {
    let instances = Arc::new(AtomicU32::new(0));
    let sink = CollectSink::<i32>::new();
    let observer = Arc::new(CollectingObserver::new());

    struct DiesOnThree {
        instance: u32,
    }

    #[async_trait]
    impl ItemTransform<i32, i32> for DiesOnThree {
        async fn apply(&self, item: i32, _ctx: &ExecutionContext) -> anyhow::Result<i32> {
            if self.instance == 1 && item == 3 {
                anyhow::bail!("instance 1 cannot handle item 3");
            }
            Ok(item)
        }
    }

    let mut b = PipelineBuilder::new();
    b.add_source("src", || VecSource::new(vec![1, 2, 3, 4, 5]))
        .add_transform("fragile", {
            let instances = instances.clone();
            move || DiesOnThree {
                instance: instances.fetch_add(1, Ordering::SeqCst) + 1,
            }
        })
        .add_sink("out", {
            let sink = sink.clone();
            move || sink.clone()
        })
        .connect("src", "fragile")
        .connect("fragile", "out")
        .with_resilience("fragile")
        .with_error_handler("fragile", node_handler_fn(|_, _, _| NodeErrorDecision::Fail))
        .with_pipeline_error_handler(pipeline_handler_fn(|_, _| PipelineErrorDecision::RestartNode))
        .with_retry_options(RetryOptions {
            max_node_restart_attempts: 1,
            max_materialized_items: Some(16),
            ..fast_retry()
        });

    let graph = b.build().unwrap();
    let config = ContextConfiguration::default().with_observer(observer.clone());
    let summary = runner().run(&graph, config).await.unwrap();

    assert_eq!(instances.load(Ordering::SeqCst), 2);
    assert_eq!(summary.stats["fragile"].restarts, 1);
    // buffered prefix [1, 2, 3] re-fed through the fresh instance
    assert_eq!(sink.items(), vec![1, 2, 1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn materialization_cap_trips_before_the_buffer_outgrows_it() {
    let (tx, rx) = mpsc::channel::<i32>(128);
    for i in 1..=100 {
        tx.try_send(i).expect("channel is large enough");
    }
    drop(tx);
    let rx = Arc::new(Mutex::new(Some(rx)));

    let sink = CollectSink::<i32>::new();
    let mut b = PipelineBuilder::new();
    b.add_source("src", {
        let rx = rx.clone();
        move || sluice_io::ChannelSource::new(rx.lock().expect("rx lock").take().expect("single run"))
    })
    .add_transform("buffered", || {
        sluice_io::transform_fn(|x: i32| async move {
            if x == 60 {
                anyhow::bail!("item 60 is cursed");
            }
            Ok(x)
        })
    })
    .add_sink("out", {
        let sink = sink.clone();
        move || sink.clone()
    })
    .connect("src", "buffered")
    .connect("buffered", "out")
    .with_resilience("buffered")
    .with_error_handler("buffered", node_handler_fn(|_, _, _| NodeErrorDecision::Fail))
    .with_pipeline_error_handler(pipeline_handler_fn(|_, _| PipelineErrorDecision::RestartNode))
    .with_retry_options(RetryOptions {
        max_node_restart_attempts: 2,
        max_materialized_items: Some(50),
        ..fast_retry()
    });

    let graph = b.build().unwrap();
    let failure = runner()
        .run(&graph, ContextConfiguration::default())
        .await
        .unwrap_err();

    assert_eq!(failure.node_id, "buffered");
    assert!(
        matches!(failure.error, EngineError::ResourceExhaustion { .. }),
        "expected resource exhaustion, got: {}",
        failure.error
    );
    assert!(sink.len() <= 50, "sink saw {} items", sink.len());
}

#[tokio::test]
async fn missing_materialization_cap_on_a_streaming_stage_refuses_to_start() {
    let sink = CollectSink::<i32>::new();
    let mut b = PipelineBuilder::new();
    b.add_source("src", || VecSource::new(vec![1, 2, 3]))
        .add_transform("t", || map_fn(|x: i32| x))
        .add_sink("out", {
            let sink = sink.clone();
            move || sink.clone()
        })
        .connect("src", "t")
        .connect("t", "out")
        .with_resilience("t")
        .with_pipeline_error_handler(pipeline_handler_fn(|_, _| PipelineErrorDecision::RestartNode))
        .with_retry_options(RetryOptions {
            max_node_restart_attempts: 1,
            max_materialized_items: None,
            ..fast_retry()
        });

    let (graph, report) = b.try_build();
    let graph = graph.expect("warning only at build time");
    assert!(report
        .warnings()
        .any(|w| w.message.contains("materialization cap")));

    let failure = runner()
        .run(&graph, ContextConfiguration::default())
        .await
        .unwrap_err();
    assert!(matches!(failure.error, EngineError::Configuration { .. }));
}

#[tokio::test]
async fn open_circuit_short_circuits_items_to_the_dead_letter_sink() {
    let sink = CollectSink::<i32>::new();
    let dead = CollectSink::<DeadLetterEnvelope>::new();

    let mut b = PipelineBuilder::new();
    b.add_source("src", || VecSource::new(vec![1, 2, 3, 4, 5]))
        .add_transform("doomed", || {
            sluice_io::transform_fn(|_x: i32| async move {
                Err::<i32, _>(anyhow::anyhow!("downstream dependency is down"))
            })
        })
        .add_sink("out", {
            let sink = sink.clone();
            move || sink.clone()
        })
        .connect("src", "doomed")
        .connect("doomed", "out")
        .with_resilience("doomed")
        .with_error_handler("doomed", node_handler_fn(|_, _, _| NodeErrorDecision::Skip))
        .with_circuit_breaker(CircuitBreakerOptions {
            consecutive_failure_threshold: 2,
            cool_off: Duration::from_secs(60),
            tracking_window: Duration::from_secs(60),
        })
        .with_dead_letter({
            let dead = dead.clone();
            move || dead.clone()
        })
        .with_retry_options(fast_retry());

    let graph = b.build().unwrap();
    runner().run(&graph, ContextConfiguration::default()).await.unwrap();

    assert!(sink.is_empty());
    // items 1 and 2 trip the breaker (skipped); 3, 4, 5 short-circuit
    let letters = dead.items();
    assert_eq!(letters.len(), 3);
    assert!(letters.iter().all(|l| l.error_message.contains("circuit breaker open")));
}
