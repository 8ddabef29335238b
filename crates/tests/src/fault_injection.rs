//! 1000 events over 10 keys with a flaky external endpoint; the cache and
//! warehouse sinks are the real ones over in-process stores.

use std::collections::HashMap;
use std::sync::Arc;

use contracts::SinkKind;
use dispatcher::sinks::{AggregationStore, CacheSink, MemoryKeyValueStore, MemoryWarehouseTable, WarehouseSink};
use dispatcher::{PipelineState, SinkSet};
use ingestion::MemoryEventLog;

use crate::support::{events, fast_blueprint, run_to_end, spawn, ScriptedSink, Step};

const EVENTS: u64 = 1_000;
const KEYS: u64 = 10;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_transient_failures_are_retried_to_exactly_once() {
    let blueprint = fast_blueprint();
    let state = PipelineState::in_memory();
    let log = Arc::new(MemoryEventLog::from_events(events(EVENTS, KEYS)));

    let kv = MemoryKeyValueStore::new();
    let aggregation = Arc::new(AggregationStore::from_config(&blueprint.sinks.cache));
    let table = MemoryWarehouseTable::new();
    // Every tenth event fails its first external attempt
    let external = ScriptedSink::new(SinkKind::External, |call| {
        if call.event_id % 10 == 3 && call.attempt == 1 {
            Step::Transient
        } else {
            Step::Deliver
        }
    });

    let sinks = SinkSet::new(vec![
        spawn(
            CacheSink::from_config(kv.clone(), Arc::clone(&aggregation), &blueprint.sinks.cache),
            &blueprint,
            &state,
        ),
        spawn(
            WarehouseSink::from_config(table.clone(), &blueprint.sinks.warehouse),
            &blueprint,
            &state,
        ),
        spawn(external.clone(), &blueprint, &state),
    ]);
    let report = run_to_end(&blueprint, &log, sinks, &state, KEYS).await;

    assert_eq!(report.events_observed, EVENTS);
    assert_eq!(report.events_completed, EVENTS);
    assert_eq!(report.checkpoint, Some(EVENTS - 1));
    for sink in SinkKind::ALL {
        assert_eq!(report.delivered(sink), EVENTS, "{sink}");
        assert_eq!(report.dead_lettered(sink), 0, "{sink}");
    }

    // Exactly once at the external boundary despite 100 retries
    assert!(external.recorder.duplicates().is_empty());
    assert_eq!(external.recorder.delivered_ids().len(), EVENTS as usize);
    assert_eq!(external.recorder.calls().len(), (EVENTS + EVENTS / 10) as usize);

    // Real sinks hold one row / one projection per event
    assert_eq!(table.len(), EVENTS as usize);
    let event_keys = kv.keys().into_iter().filter(|k| k.starts_with("event:")).count();
    assert_eq!(event_keys, EVENTS as usize);
    let meta_keys = kv.keys().into_iter().filter(|k| k.starts_with("content_meta:")).count();
    assert_eq!(meta_keys, KEYS as usize);

    let summary = state.ledger.summary();
    assert_eq!(summary.delivered, (EVENTS * 3) as usize);
    assert_eq!(summary.pending, 0);
    assert!(state.dead_letters.is_empty());
    let retried = state
        .ledger
        .get(3, SinkKind::External)
        .map(|record| record.attempt_count);
    assert_eq!(retried, Some(2));
}

#[tokio::test]
async fn test_permanent_failures_dead_letter_without_stalling_the_checkpoint() {
    let blueprint = fast_blueprint();
    let state = PipelineState::in_memory();
    let log = Arc::new(MemoryEventLog::from_events(events(50, 5)));

    let external = ScriptedSink::new(SinkKind::External, |call| {
        if call.event_id % 7 == 0 {
            Step::Permanent
        } else {
            Step::Deliver
        }
    });
    let cache = ScriptedSink::healthy(SinkKind::Cache);
    let sinks = SinkSet::new(vec![
        spawn(cache.clone(), &blueprint, &state),
        spawn(external.clone(), &blueprint, &state),
    ]);
    let report = run_to_end(&blueprint, &log, sinks, &state, 5).await;

    assert_eq!(report.checkpoint, Some(49));
    assert_eq!(report.dead_lettered(SinkKind::External), 7);
    assert_eq!(report.delivered(SinkKind::Cache), 50);

    let letters = state.dead_letters.list_for_sink(SinkKind::External);
    let ids: Vec<u64> = letters.iter().map(|l| l.event_id).collect();
    assert_eq!(ids, vec![7, 14, 21, 28, 35, 42, 49]);
    assert!(letters.iter().all(|l| l.attempts == 1));
    assert_eq!(letters[0].payload.content_title.as_deref(), Some("Content 1"));

    // Permanent failures are never retried
    let mut attempts: HashMap<u64, u32> = HashMap::new();
    for call in external.recorder.calls() {
        *attempts.entry(call.event_id).or_default() += 1;
    }
    assert!(attempts.values().all(|n| *n == 1));
}
