//! End-to-end windowing scenarios: event-time aggregation over watermarks,
//! windowed joins, late-data accounting, and timer-driven batching.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use sluice_core::{
    BatchOptions, ContextConfiguration, JoinType, PipelineBuilder, Window, WindowAssigner,
    WindowConfig, WindowedAggregate,
};
use sluice_engine::{RunStatus, Runner, RunnerOptions};
use sluice_io::{ChannelSource, CollectSink, VecSource};

fn runner() -> Runner {
    Runner::new(RunnerOptions::default())
}

type Reading = (i64, &'static str, i64); // (event time, key, value)

#[tokio::test]
async fn event_time_aggregate_closes_windows_on_watermarks() {
    let readings: Vec<Reading> = vec![
        (100, "a", 1),
        (200, "a", 2),
        (500, "b", 5),
        (1_100, "a", 10),
        (2_100, "b", 20),
    ];
    let sink = CollectSink::<WindowedAggregate<&'static str, i64>>::new();

    let mut b = PipelineBuilder::new();
    b.add_source_with_event_time(
        "readings",
        {
            let readings = readings.clone();
            move || VecSource::new(readings.clone())
        },
        |r: &Reading| r.0,
        Duration::ZERO,
    )
    .add_aggregate(
        "sum",
        |r: &Reading| r.1,
        || 0i64,
        |acc, r: Reading| acc + r.2,
        WindowConfig::event_time(WindowAssigner::tumbling(Duration::from_secs(1))),
    )
    .add_sink("out", {
        let sink = sink.clone();
        move || sink.clone()
    })
    .connect("readings", "sum")
    .connect("sum", "out");

    let graph = b.build().unwrap();
    let summary = runner().run(&graph, ContextConfiguration::default()).await.unwrap();
    assert_eq!(summary.status, RunStatus::Completed);

    let mut results: Vec<(Window, &'static str, i64)> = sink
        .items()
        .into_iter()
        .map(|agg| (agg.window, agg.key, agg.value))
        .collect();
    results.sort();
    assert_eq!(
        results,
        vec![
            (Window { start: 0, end: 1_000 }, "a", 3),
            (Window { start: 0, end: 1_000 }, "b", 5),
            (Window { start: 1_000, end: 2_000 }, "a", 10),
            (Window { start: 2_000, end: 3_000 }, "b", 20),
        ]
    );
}

#[tokio::test]
async fn items_past_allowed_lateness_are_dropped_and_counted() {
    let readings: Vec<Reading> = vec![(2_100, "a", 1), (100, "a", 99)];
    let sink = CollectSink::<WindowedAggregate<&'static str, i64>>::new();

    let mut b = PipelineBuilder::new();
    b.add_source_with_event_time(
        "readings",
        {
            let readings = readings.clone();
            move || VecSource::new(readings.clone())
        },
        |r: &Reading| r.0,
        Duration::ZERO,
    )
    .add_aggregate(
        "sum",
        |r: &Reading| r.1,
        || 0i64,
        |acc, r: Reading| acc + r.2,
        WindowConfig::event_time(WindowAssigner::tumbling(Duration::from_secs(1))),
    )
    .add_sink("out", {
        let sink = sink.clone();
        move || sink.clone()
    })
    .connect("readings", "sum")
    .connect("sum", "out");

    let graph = b.build().unwrap();
    let summary = runner().run(&graph, ContextConfiguration::default()).await.unwrap();

    let results = sink.items();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].value, 1);
    assert_eq!(results[0].window, Window { start: 2_000, end: 3_000 });
    assert_eq!(summary.stats["sum"].late_dropped, 1);
}

type Order = (i64, &'static str, i64); // (event time, customer, amount)
type Payment = (i64, &'static str, i64); // (event time, customer, paid)

#[tokio::test]
async fn windowed_join_matches_keys_within_the_same_window() {
    let orders: Vec<Order> = vec![(100, "a", 1), (200, "b", 2)];
    let payments: Vec<Payment> = vec![(150, "a", 10), (800, "c", 30)];
    let sink = CollectSink::<(i64, i64)>::new();

    let mut b = PipelineBuilder::new();
    b.add_source_with_event_time(
        "orders",
        {
            let orders = orders.clone();
            move || VecSource::new(orders.clone())
        },
        |o: &Order| o.0,
        Duration::ZERO,
    )
    .add_source_with_event_time(
        "payments",
        {
            let payments = payments.clone();
            move || VecSource::new(payments.clone())
        },
        |p: &Payment| p.0,
        Duration::ZERO,
    )
    .add_join(
        "settle",
        |o: &Order| o.1,
        |p: &Payment| p.1,
        |o: Option<&Order>, p: Option<&Payment>| {
            (o.map(|o| o.2).unwrap_or(-1), p.map(|p| p.2).unwrap_or(-1))
        },
        JoinType::FullOuter,
        WindowConfig::event_time(WindowAssigner::tumbling(Duration::from_secs(1))),
    )
    .add_sink("out", {
        let sink = sink.clone();
        move || sink.clone()
    })
    .connect_port("orders", "settle", 0)
    .connect_port("payments", "settle", 1)
    .connect("settle", "out");

    let graph = b.build().unwrap();
    runner().run(&graph, ContextConfiguration::default()).await.unwrap();

    let mut results = sink.items();
    results.sort();
    // "a" matches; "b" has no payment; "c" has no order
    assert_eq!(results, vec![(-1, 30), (1, 10), (2, -1)]);
}

#[tokio::test]
async fn inner_join_suppresses_unmatched_rows() {
    let orders: Vec<Order> = vec![(100, "a", 1), (200, "b", 2)];
    let payments: Vec<Payment> = vec![(150, "a", 10)];
    let sink = CollectSink::<(i64, i64)>::new();

    let mut b = PipelineBuilder::new();
    b.add_source_with_event_time(
        "orders",
        {
            let orders = orders.clone();
            move || VecSource::new(orders.clone())
        },
        |o: &Order| o.0,
        Duration::ZERO,
    )
    .add_source_with_event_time(
        "payments",
        {
            let payments = payments.clone();
            move || VecSource::new(payments.clone())
        },
        |p: &Payment| p.0,
        Duration::ZERO,
    )
    .add_join(
        "settle",
        |o: &Order| o.1,
        |p: &Payment| p.1,
        |o: Option<&Order>, p: Option<&Payment>| {
            (o.map(|o| o.2).unwrap_or(-1), p.map(|p| p.2).unwrap_or(-1))
        },
        JoinType::Inner,
        WindowConfig::event_time(WindowAssigner::tumbling(Duration::from_secs(1))),
    )
    .add_sink("out", {
        let sink = sink.clone();
        move || sink.clone()
    })
    .connect_port("orders", "settle", 0)
    .connect_port("payments", "settle", 1)
    .connect("settle", "out");

    let graph = b.build().unwrap();
    runner().run(&graph, ContextConfiguration::default()).await.unwrap();
    assert_eq!(sink.items(), vec![(1, 10)]);
}

#[tokio::test(start_paused = true)]
async fn batch_window_timer_flushes_a_partial_batch() {
    let (tx, rx) = mpsc::channel::<i32>(8);
    let rx = Arc::new(Mutex::new(Some(rx)));
    let sink = CollectSink::<Vec<i32>>::new();

    let mut b = PipelineBuilder::new();
    b.add_source("src", {
        let rx = rx.clone();
        move || ChannelSource::new(rx.lock().expect("rx lock").take().expect("single run"))
    })
    .add_batcher::<i32>(
        "batch",
        BatchOptions {
            max_batch: 10,
            window: Duration::from_millis(200),
        },
    )
    .add_sink("out", {
        let sink = sink.clone();
        move || sink.clone()
    })
    .connect("src", "batch")
    .connect("batch", "out");
    let graph = b.build().unwrap();

    let feeder = tokio::spawn(async move {
        tx.send(1).await.unwrap();
        tx.send(2).await.unwrap();
        tx.send(3).await.unwrap();
        // hold the stream open long past the batch window
        tokio::time::sleep(Duration::from_secs(1)).await;
        drop(tx);
    });

    runner().run(&graph, ContextConfiguration::default()).await.unwrap();
    feeder.await.unwrap();

    // the timer, not end-of-stream, produced the batch
    assert_eq!(sink.items(), vec![vec![1, 2, 3]]);
}

#[tokio::test]
async fn tiny_batch_windows_flush_immediately_per_item() {
    let sink = CollectSink::<Vec<i32>>::new();
    let mut b = PipelineBuilder::new();
    b.add_source("src", || VecSource::new(vec![1, 2, 3]))
        .add_batcher::<i32>(
            "batch",
            BatchOptions {
                max_batch: 10,
                window: Duration::from_millis(50),
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
    assert_eq!(sink.items(), vec![vec![1], vec![2], vec![3]]);
}
