mod common;

use std::sync::Arc;
use std::time::Duration;

use cachesync::cache::DatasetStore;
use cachesync::changelog::{ChangeLogRecord, MemoryChangeLog, query_sequence};
use cachesync::clock::{Clock, ManualClock};
use cachesync::reconcile::{CycleOutcome, Reconciler, ReconcilerConfig, ReplaySummary};

use common::{Instance, key, settings, widget, widget_store};

fn replayed(outcome: CycleOutcome) -> ReplaySummary {
    match outcome {
        CycleOutcome::Replayed(summary) => summary,
        other => panic!("expected a replayed cycle, got {other:?}"),
    }
}

#[tokio::test]
async fn delete_then_create_reloads_the_key_once() {
    let settings = settings();
    let log = Arc::new(MemoryChangeLog::new());
    let clock = Arc::new(ManualClock::new(0));
    let store = widget_store();
    let writer = Instance::new(&settings, &log, &clock);
    let reader = Instance::new(&settings, &log, &clock);
    let writer_widgets = writer.widgets(&store);
    let reader_widgets = reader.widgets(&store);

    writer_widgets
        .set_one(key("w1"), widget(1))
        .await
        .expect("set");
    clock.set(10);
    writer_widgets.delete_one(&key("w1")).await.expect("delete");
    clock.set(20);
    writer_widgets
        .set_one(key("w1"), widget(2))
        .await
        .expect("set");
    writer.flush().await;
    assert_eq!(log.len(), 3);

    store.reset_load_counts();
    clock.set(1_000);
    let summary = replayed(reader.system.reconciler().run_cycle().await);

    assert_eq!(summary.records, 3);
    assert_eq!(summary.coalesced, 1);
    assert_eq!(summary.superseded, 1);
    assert_eq!(summary.applied, 1);
    assert_eq!(summary.dataset_reloads, 0);
    assert_eq!(store.loads_for(&key("w1")), 1);
    assert_eq!(
        reader_widgets.cache().peek(&key("w1")),
        Some(Some(widget(2)))
    );

    let state = reader.system.reconciler().state().await;
    assert_eq!(state.watermark, 1_000);
    assert_eq!(state.retries_left, 2);
}

#[tokio::test]
async fn replaying_a_window_twice_leaves_the_same_state() {
    let settings = settings();
    let log = Arc::new(MemoryChangeLog::new());
    let clock = Arc::new(ManualClock::new(0));
    let store = widget_store();
    let writer = Instance::new(&settings, &log, &clock);
    let reader = Instance::new(&settings, &log, &clock);
    let writer_widgets = writer.widgets(&store);
    let reader_widgets = reader.widgets(&store);
    reader_widgets.get_one(&key("gone")).await.expect("get");

    writer_widgets
        .set_multiple(vec![(key("a"), widget(1)), (key("b"), widget(2))])
        .await
        .expect("set");
    clock.set(5);
    writer_widgets.delete_one(&key("gone")).await.expect("delete");
    clock.set(6);
    writer_widgets
        .set_one(key("a"), widget(3))
        .await
        .expect("set");
    writer.flush().await;

    clock.set(1_000);
    replayed(reader.system.reconciler().run_cycle().await);
    let mut first = reader_widgets.cache().live_entries();
    first.sort_by(|left, right| left.0.cmp(&right.0));
    let first_hash = reader.system.registry().calculate_hash().expect("hash");

    let clock_dyn: Arc<dyn Clock> = clock.clone();
    clock.set(0);
    let again = Reconciler::new(
        Arc::clone(reader.system.registry()),
        reader.system.reader().clone(),
        clock_dyn,
        ReconcilerConfig {
            initial_delay: Some(Duration::ZERO),
            ..ReconcilerConfig::default()
        },
    );
    clock.set(1_000);
    replayed(again.run_cycle().await);

    let mut second = reader_widgets.cache().live_entries();
    second.sort_by(|left, right| left.0.cmp(&right.0));
    assert_eq!(first, second);
    assert_eq!(
        first,
        vec![(key("a"), widget(3)), (key("b"), widget(2))]
    );
    assert_eq!(
        reader.system.registry().calculate_hash().expect("hash"),
        first_hash
    );
    assert_eq!(reader_widgets.cache().peek(&key("gone")), None);
}

#[tokio::test]
async fn exhausted_retries_force_a_full_reload() {
    let settings = settings();
    let log = Arc::new(MemoryChangeLog::new());
    let clock = Arc::new(ManualClock::new(0));
    let store = widget_store();
    store.put_raw(key("w1"), widget(1));
    let reader = Instance::new(&settings, &log, &clock);
    let widgets = reader.widgets(&store);
    assert_eq!(
        widgets.get_one(&key("w1")).await.expect("get"),
        Some(widget(1))
    );

    store.put_raw(key("w1"), widget(5));
    log.fail_next_scans(2);
    let reconciler = reader.system.reconciler();

    clock.set(1_000);
    assert_eq!(
        reconciler.run_cycle().await,
        CycleOutcome::Failed { retries_left: 1 }
    );
    clock.set(2_000);
    assert_eq!(
        reconciler.run_cycle().await,
        CycleOutcome::Failed { retries_left: 0 }
    );
    assert_eq!(reconciler.state().await.watermark, 0);

    clock.set(3_000);
    assert_eq!(
        reconciler.run_cycle().await,
        CycleOutcome::FullReload {
            not_refreshed: Vec::new()
        }
    );
    let state = reconciler.state().await;
    assert_eq!(state.watermark, 3_000);
    assert_eq!(state.retries_left, 2);
    assert_eq!(widgets.cache().peek(&key("w1")), Some(Some(widget(5))));

    clock.set(4_000);
    replayed(reconciler.run_cycle().await);
}

#[tokio::test]
async fn short_cache_reloads_the_dataset_once() {
    let settings = settings();
    let log = Arc::new(MemoryChangeLog::new());
    let clock = Arc::new(ManualClock::new(50));
    let store = widget_store();
    let writer = Instance::new(&settings, &log, &clock);
    let writer_widgets = writer.widgets(&store);
    writer_widgets
        .set_one(key("k1"), widget(1))
        .await
        .expect("set");
    writer_widgets
        .set_one(key("k2"), widget(2))
        .await
        .expect("set");

    clock.set(100);
    let reader = Instance::new(&settings, &log, &clock);
    let reader_widgets = reader.widgets(&store);

    clock.set(150);
    writer_widgets
        .set_one(key("k3"), widget(3))
        .await
        .expect("set");
    clock.set(160);
    writer_widgets
        .set_one(key("k4"), widget(4))
        .await
        .expect("set");
    writer.flush().await;

    clock.set(1_000);
    let summary = replayed(reader.system.reconciler().run_cycle().await);

    assert_eq!(summary.records, 2);
    assert_eq!(summary.dataset_reloads, 1);
    assert_eq!(reader_widgets.cache().live_count(), 4);
    assert_eq!(
        reader.system.registry().calculate_hash().expect("hash"),
        writer.system.registry().calculate_hash().expect("hash")
    );
}

#[tokio::test]
async fn truncate_clears_peer_caches() {
    let settings = settings();
    let log = Arc::new(MemoryChangeLog::new());
    let clock = Arc::new(ManualClock::new(0));
    let store = widget_store();
    store.put_raw(key("a"), widget(1));
    let writer = Instance::new(&settings, &log, &clock);
    let reader = Instance::new(&settings, &log, &clock);
    let reader_widgets = reader.widgets(&store);
    reader_widgets.get_one(&key("a")).await.expect("get");

    clock.set(10);
    writer.widgets(&store).truncate().await.expect("truncate");
    writer.flush().await;

    clock.set(1_000);
    let summary = replayed(reader.system.reconciler().run_cycle().await);
    assert_eq!(summary.applied, 1);
    assert!(reader_widgets.cache().is_empty());
}

#[tokio::test]
async fn unknown_datasets_and_incomplete_records_are_skipped() {
    let settings = settings();
    let log = Arc::new(MemoryChangeLog::new());
    let clock = Arc::new(ManualClock::new(0));
    let widgets = widget_store();
    let gadgets: Arc<dyn DatasetStore<String, u32>> =
        Arc::new(cachesync::cache::MemoryStore::<String, u32>::new("Gadget"));
    let writer = Instance::new(&settings, &log, &clock);
    let reader = Instance::new(&settings, &log, &clock);
    let reader_widgets = reader.widgets(&widgets);

    let writer_gadgets = writer.system.registry().cached(gadgets).expect("cached");
    writer_gadgets
        .set_one(key("g"), 7)
        .await
        .expect("set");
    log.insert_raw(ChangeLogRecord {
        bucket: 0,
        sequence: query_sequence(5),
        dataset_name: Some("Widget".to_string()),
        changed_key: Some("\"w\"".to_string()),
        operation: None,
        dataset_id: Some(widgets.descriptor().id()),
        observed_live_count: Some(1),
    });
    clock.set(10);
    writer
        .widgets(&widgets)
        .set_one(key("w"), widget(9))
        .await
        .expect("set");
    writer.flush().await;

    clock.set(1_000);
    let summary = replayed(reader.system.reconciler().run_cycle().await);
    assert_eq!(summary.records, 3);
    assert_eq!(summary.skipped, 2);
    assert_eq!(summary.applied, 1);
    assert_eq!(
        reader_widgets.cache().peek(&key("w")),
        Some(Some(widget(9)))
    );
}

#[tokio::test]
async fn failed_apply_keeps_the_watermark() {
    let settings = settings();
    let log = Arc::new(MemoryChangeLog::new());
    let clock = Arc::new(ManualClock::new(0));
    let store = widget_store();
    let writer = Instance::new(&settings, &log, &clock);
    let reader = Instance::new(&settings, &log, &clock);
    reader.widgets(&store);

    writer
        .widgets(&store)
        .set_one(key("a"), widget(1))
        .await
        .expect("set");
    writer.flush().await;

    store.set_failing(true);
    clock.set(1_000);
    assert_eq!(
        reader.system.reconciler().run_cycle().await,
        CycleOutcome::Failed { retries_left: 1 }
    );
    assert_eq!(reader.system.reconciler().state().await.watermark, 0);

    store.set_failing(false);
    clock.set(2_000);
    let summary = replayed(reader.system.reconciler().run_cycle().await);
    assert_eq!(summary.applied, 1);
    assert_eq!(reader.system.reconciler().state().await.retries_left, 2);
}

#[tokio::test]
async fn a_second_cycle_is_refused_while_one_is_running() {
    let settings = settings();
    let log = Arc::new(MemoryChangeLog::new());
    let clock = Arc::new(ManualClock::new(0));
    let store = widget_store();
    let writer = Instance::new(&settings, &log, &clock);
    let reader = Instance::new(&settings, &log, &clock);
    let writer_widgets = writer.widgets(&store);
    let reader_widgets = reader.widgets(&store);
    writer_widgets
        .set_one(key("w1"), widget(1))
        .await
        .expect("set");
    writer.flush().await;

    let reconciler = Arc::clone(reader.system.reconciler());
    store.hold_reads(true);
    clock.set(1_000);
    let running = {
        let reconciler = Arc::clone(&reconciler);
        tokio::spawn(async move { reconciler.run_cycle().await })
    };
    store.read_parked().await;

    clock.set(2_000);
    assert_eq!(reconciler.run_cycle().await, CycleOutcome::Busy);
    store.hold_reads(false);

    let summary = replayed(running.await.expect("join"));
    assert_eq!(summary.start, 0);
    assert_eq!(summary.end, 1_000);
    assert_eq!(summary.applied, 1);
    let state = reconciler.state().await;
    assert_eq!(state.watermark, 1_000);
    assert_eq!(state.retries_left, 2);
    assert_eq!(
        reader_widgets.cache().peek(&key("w1")),
        Some(Some(widget(1)))
    );
}

#[tokio::test]
async fn scheduled_reconciler_replays_until_shut_down() {
    let settings = settings();
    let log = Arc::new(MemoryChangeLog::new());
    let clock = Arc::new(ManualClock::new(0));
    let store = widget_store();
    let writer = Instance::new(&settings, &log, &clock);
    let reader = Instance::new(&settings, &log, &clock);
    let reader_widgets = reader.widgets(&store);

    writer
        .widgets(&store)
        .set_one(key("a"), widget(1))
        .await
        .expect("set");
    writer.flush().await;
    clock.set(1_000);

    let handle = reader.system.start_reconciler();
    tokio::time::timeout(Duration::from_secs(5), async {
        while reader_widgets.cache().peek(&key("a")).is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("first cycle replays the write");

    assert!(!handle.is_finished());
    handle.shutdown().await;
}
