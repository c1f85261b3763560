use std::{collections::HashSet, time::Duration};

use async_trait::async_trait;
use serde_json::json;
use similar_asserts::assert_eq;
use tally_core::{
    bus::EventBus,
    engine::{BufferEngine, EngineError},
    measurement::MeasurementRecord,
    registry::{self, MetricDefinition},
    sink::{MemorySink, PersistOutcome, Sink, SinkError},
};
use tokio::time::sleep;
use tracing::Level;

mod common;
use self::common::*;

const LONG: Duration = Duration::from_secs(3600);

fn values(records: &[MeasurementRecord]) -> Vec<i64> {
    records.iter().map(MeasurementRecord::value).collect()
}

#[tokio::test]
async fn reaching_threshold_flushes_exactly_once() {
    let sink = MemorySink::new();
    let engine = BufferEngine::builder(config(5, LONG))
        .with_metrics(vec![])
        .with_sink(sink.clone())
        .spawn()
        .unwrap();
    let handle = engine.handle();

    for i in 0..5 {
        handle.ingest(raw("orders.processor.1", i));
    }

    assert!(handle.get_pending().await.unwrap().is_empty());
    assert_eq!(sink.persist_calls(), 1);
    assert_eq!(values(&sink.batches()[0]), vec![0, 1, 2, 3, 4]);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn below_threshold_stays_pending() {
    let sink = MemorySink::new();
    let engine = BufferEngine::builder(config(5, LONG))
        .with_metrics(vec![])
        .with_sink(sink.clone())
        .spawn()
        .unwrap();
    let handle = engine.handle();

    for i in 0..4 {
        handle.ingest(raw("orders.processor.1", i));
    }

    assert_eq!(values(&handle.get_pending().await.unwrap()), vec![0, 1, 2, 3]);
    assert_eq!(sink.persist_calls(), 0);

    engine.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn empty_timer_flush_skips_sink_and_rearms() {
    let (captured, _guard) = CapturedEvents::install();
    let sink = MemorySink::new();
    let engine = BufferEngine::builder(config(1000, Duration::from_millis(50)))
        .with_metrics(vec![])
        .with_sink(sink.clone())
        .spawn()
        .unwrap();
    let handle = engine.handle();

    sleep(Duration::from_millis(60)).await;
    assert_eq!(sink.persist_calls(), 0);
    assert_eq!(captured.with_message("Flush timer fired.").len(), 1);

    // The timer re-armed itself: the next interval flushes what arrived in between.
    handle.ingest(raw("orders.processor.1", 7));
    sleep(Duration::from_millis(50)).await;

    assert_eq!(captured.with_message("Flush timer fired.").len(), 2);
    assert_eq!(sink.persist_calls(), 1);
    assert_eq!(values(&sink.records()), vec![7]);
    assert!(handle.get_pending().await.unwrap().is_empty());

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn explicit_flush_persists_pending() {
    let sink = MemorySink::new();
    let engine = BufferEngine::builder(config(1000, LONG))
        .with_metrics(vec![])
        .with_sink(sink.clone())
        .spawn()
        .unwrap();
    let handle = engine.handle();

    handle.flush();
    handle.ingest(raw("orders.processor.1", 1));
    handle.ingest(raw("orders.processor.1", 2));
    handle.flush();

    assert!(handle.get_pending().await.unwrap().is_empty());
    assert_eq!(sink.persist_calls(), 1);
    assert_eq!(values(&sink.records()), vec![1, 2]);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn reset_discards_without_persisting() {
    let sink = MemorySink::new();
    let engine = BufferEngine::builder(config(1000, LONG))
        .with_metrics(vec![])
        .with_sink(sink.clone())
        .spawn()
        .unwrap();
    let handle = engine.handle();

    for i in 0..3 {
        handle.ingest(raw("orders.processor.1", i));
    }
    assert_eq!(handle.get_pending().await.unwrap().len(), 3);

    handle.reset();
    assert!(handle.get_pending().await.unwrap().is_empty());

    handle.reset();
    handle.flush();
    assert!(handle.get_pending().await.unwrap().is_empty());
    assert_eq!(sink.persist_calls(), 0);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn failed_batch_is_not_requeued() {
    let (captured, _guard) = CapturedEvents::install();
    let sink = MemorySink::new();
    sink.fail_next(1);

    let engine = BufferEngine::builder(config(2, LONG))
        .with_metrics(vec![])
        .with_sink(sink.clone())
        .spawn()
        .unwrap();
    let handle = engine.handle();

    handle.ingest(raw("orders.processor.1", 1));
    handle.ingest(raw("orders.processor.1", 2));

    assert!(handle.get_pending().await.unwrap().is_empty());
    assert!(handle.get_pending().await.unwrap().is_empty());
    assert_eq!(sink.persist_calls(), 1);
    assert!(sink.records().is_empty());

    let failures = captured.with_message("Failed to persist measurement batch; batch discarded.");
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].level, Level::ERROR);
    assert_eq!(failures[0].fields["operation"], "insert_measurements");
    assert_eq!(failures[0].fields["batch_size"], "2");
    assert_eq!(failures[0].fields["pending_after"], "0");

    // The engine keeps running: the next batch goes through.
    handle.ingest(raw("orders.processor.1", 3));
    handle.ingest(raw("orders.processor.1", 4));
    assert!(handle.get_pending().await.unwrap().is_empty());
    assert_eq!(values(&sink.records()), vec![3, 4]);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn malformed_measurement_is_dropped_with_warning() {
    let (captured, _guard) = CapturedEvents::install();
    let sink = MemorySink::new();
    let engine = BufferEngine::builder(config(1000, LONG))
        .with_metrics(vec![])
        .with_sink(sink.clone())
        .spawn()
        .unwrap();
    let handle = engine.handle();

    handle.ingest(raw("orders.processor.1", 1));
    handle.ingest(json!({ "foo": "bar" }));
    assert_eq!(handle.get_pending().await.unwrap().len(), 1);

    let warnings = captured.with_message("Dropping malformed measurement.");
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].level, Level::WARN);
    assert_eq!(warnings[0].fields["reason"], "missing field 'component_path'");

    handle.ingest(raw("orders.processor.1", 2));
    assert_eq!(values(&handle.get_pending().await.unwrap()), vec![1, 2]);
    assert!(!engine.is_finished());

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_detaches_handlers_and_drops_pending() {
    let bus = EventBus::new();
    let sink = MemorySink::new();
    let engine = BufferEngine::builder(config(1000, LONG))
        .with_metrics(registry::all())
        .with_event_bus(bus.clone())
        .with_sink(sink.clone())
        .spawn()
        .unwrap();
    let handle = engine.handle();

    assert_eq!(bus.handler_count(), registry::all().len());

    for i in 0..3 {
        assert_eq!(bus.emit(&message_stop(), &bus_event("orders.processor.1", i)), 1);
    }
    assert_eq!(handle.get_pending().await.unwrap().len(), 3);

    engine.shutdown().await.unwrap();

    assert_eq!(bus.handler_count(), 0);
    assert_eq!(bus.emit(&message_stop(), &bus_event("orders.processor.1", 99)), 0);
    assert_eq!(sink.persist_calls(), 0);
    assert!(matches!(handle.get_pending().await, Err(EngineError::Stopped)));
}

struct PanickingSink;

#[async_trait]
impl Sink for PanickingSink {
    async fn persist(&self, _batch: Vec<MeasurementRecord>) -> Result<PersistOutcome, SinkError> {
        panic!("store exploded");
    }
}

#[tokio::test]
async fn crash_still_detaches_handlers() {
    let bus = EventBus::new();
    let engine = BufferEngine::builder(config(1, LONG))
        .with_metrics(registry::all())
        .with_event_bus(bus.clone())
        .with_sink(PanickingSink)
        .spawn()
        .unwrap();

    bus.emit(&message_stop(), &bus_event("orders.processor.1", 1));

    tokio::time::timeout(Duration::from_secs(5), async {
        while !engine.is_finished() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("engine should crash");

    assert!(matches!(engine.shutdown().await, Err(EngineError::Crashed { .. })));
    assert_eq!(bus.handler_count(), 0);
}

#[test]
fn runtime_shutdown_before_first_poll_detaches_handlers() {
    let bus = EventBus::new();
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();

    let engine = runtime.block_on(async {
        BufferEngine::builder(config(1000, LONG))
            .with_metrics(registry::all())
            .with_event_bus(bus.clone())
            .with_sink(MemorySink::new())
            .spawn()
            .unwrap()
    });
    assert_eq!(bus.handler_count(), registry::all().len());

    drop(runtime);

    assert_eq!(bus.handler_count(), 0);
    assert_eq!(bus.emit(&message_stop(), &bus_event("orders.processor.1", 1)), 0);
    drop(engine);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_producers_all_land_in_batch() {
    let bus = EventBus::new();
    let sink = MemorySink::new();
    let engine = BufferEngine::builder(config(1000, LONG))
        .with_metrics(registry::all())
        .with_event_bus(bus.clone())
        .with_sink(sink.clone())
        .spawn()
        .unwrap();
    let handle = engine.handle();

    let producers = ["orders.processor.1", "payments.processor.1"]
        .into_iter()
        .map(|component| {
            let bus = bus.clone();
            std::thread::spawn(move || {
                for i in 0..50 {
                    bus.emit(&message_stop(), &bus_event(component, i));
                }
            })
        })
        .collect::<Vec<_>>();
    for producer in producers {
        producer.join().unwrap();
    }

    handle.flush();
    assert!(handle.get_pending().await.unwrap().is_empty());

    let persisted = sink
        .records()
        .into_iter()
        .map(|r| (r.component_path().to_string(), r.value()))
        .collect::<HashSet<_>>();
    let expected = ["orders.processor.1", "payments.processor.1"]
        .into_iter()
        .flat_map(|c| (0..50).map(move |i| (c.to_string(), i)))
        .collect::<HashSet<_>>();
    assert_eq!(persisted, expected);
    assert_eq!(sink.persist_calls(), 1);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn per_producer_order_is_preserved() {
    let bus = EventBus::new();
    let sink = MemorySink::new();
    let engine = BufferEngine::builder(config(1000, LONG))
        .with_metrics(registry::all())
        .with_event_bus(bus.clone())
        .with_sink(sink.clone())
        .spawn()
        .unwrap();
    let handle = engine.handle();

    for i in 0..20 {
        bus.emit(&message_stop(), &bus_event("orders.processor.1", i));
    }

    let pending = handle.get_pending().await.unwrap();
    assert_eq!(values(&pending), (0..20).collect::<Vec<_>>());
    assert!(pending.iter().all(|r| r.metric_name() == "stop"));
    assert!(pending.windows(2).all(|w| w[0].captured_at() <= w[1].captured_at()));

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn write_through_metric_bypasses_buffer() {
    let bus = EventBus::new();
    let sink = MemorySink::new();
    let engine = BufferEngine::builder(config(1000, LONG))
        .with_metrics(registry::all())
        .with_event_bus(bus.clone())
        .with_sink(sink.clone())
        .spawn()
        .unwrap();
    let handle = engine.handle();

    bus.emit(&message_stop(), &bus_event("orders.processor.1", 1));
    bus.emit(&topology_init(), &bus_event("orders", 2));

    let pending = handle.get_pending().await.unwrap();
    assert_eq!(values(&pending), vec![1]);
    assert_eq!(sink.batches().len(), 1);
    assert_eq!(values(&sink.batches()[0]), vec![2]);
    assert_eq!(sink.batches()[0][0].metric_name(), "init");

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn registered_metrics_are_reported() {
    let engine = BufferEngine::builder(config(10, LONG))
        .with_metrics(registry::all())
        .with_sink(MemorySink::new())
        .spawn()
        .unwrap();

    assert_eq!(engine.handle().get_registered_metrics().await.unwrap(), registry::all());

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn missing_metrics_is_fatal() {
    let result = BufferEngine::builder(config(10, LONG))
        .with_sink(MemorySink::new())
        .spawn();
    assert!(matches!(result, Err(EngineError::MissingMetrics)));
}

#[tokio::test]
async fn missing_sink_is_fatal() {
    let result = BufferEngine::builder(config(10, LONG)).with_metrics(vec![]).spawn();
    assert!(matches!(result, Err(EngineError::MissingSink)));
}

#[tokio::test]
async fn duplicate_event_path_is_fatal_and_leaves_nothing_attached() {
    let bus = EventBus::new();
    let result = BufferEngine::builder(config(10, LONG))
        .with_metrics(vec![
            MetricDefinition::cached(["pipeline", "batcher", "stop"]),
            MetricDefinition::write_through(["pipeline", "batcher", "stop"]),
        ])
        .with_event_bus(bus.clone())
        .with_sink(MemorySink::new())
        .spawn();

    match result {
        Err(EngineError::DuplicateSubscription { event_path, .. }) => {
            assert_eq!(event_path, "pipeline.batcher.stop")
        }
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("duplicate subscription should fail"),
    }
    assert_eq!(bus.handler_count(), 0);
}

#[tokio::test]
async fn engines_on_one_bus_are_independent() {
    let bus = EventBus::new();
    let first_sink = MemorySink::new();
    let second_sink = MemorySink::new();
    let first = BufferEngine::builder(config(1000, LONG))
        .with_metrics(registry::all())
        .with_event_bus(bus.clone())
        .with_sink(first_sink)
        .spawn()
        .unwrap();
    let second = BufferEngine::builder(config(1000, LONG))
        .with_metrics(vec![MetricDefinition::cached(["pipeline", "processor", "message", "stop"])])
        .with_event_bus(bus.clone())
        .with_sink(second_sink)
        .spawn()
        .unwrap();

    assert_eq!(bus.emit(&message_stop(), &bus_event("orders.processor.1", 1)), 2);
    assert_eq!(first.handle().get_pending().await.unwrap().len(), 1);
    assert_eq!(second.handle().get_pending().await.unwrap().len(), 1);

    first.shutdown().await.unwrap();
    assert_eq!(bus.handler_count(), 1);
    assert_eq!(bus.emit(&message_stop(), &bus_event("orders.processor.1", 2)), 1);
    assert_eq!(second.handle().get_pending().await.unwrap().len(), 2);

    second.shutdown().await.unwrap();
}
