//! Kill a live run while deliveries are stuck, restart from the state
//! directory and check that nothing is delivered twice or lost.

use std::sync::Arc;
use std::time::Duration;

use contracts::{SinkKind, StateConfig, LIVE_NAMESPACE};
use dispatcher::{
    CoordinatorParts, CoordinatorSettings, DispatchCoordinator, PipelineState, SinkSet,
};
use ingestion::MemoryEventLog;
use tokio::sync::watch;

use crate::support::{catalog, events, fast_blueprint, run_to_end, spawn, wait_until, whole_log, ScriptedSink, Step};

const EVENTS: u64 = 20;
const KEYS: u64 = 4;

fn sorted(mut ids: Vec<u64>) -> Vec<u64> {
    ids.sort_unstable();
    ids
}

#[tokio::test]
async fn test_crash_and_restart_delivers_each_event_once_per_sink() {
    let dir = tempfile::tempdir().unwrap();
    let config = StateConfig {
        dir: dir.path().join("state"),
        ..StateConfig::default()
    };
    let blueprint = fast_blueprint();
    let log = Arc::new(MemoryEventLog::from_events(events(EVENTS, KEYS)));

    // First run: the external endpoint hangs on events 7 (key 2) and 13
    // (key 0), blocking the rest of those two keys.
    let state = PipelineState::open(&config).unwrap();
    let cache_1 = ScriptedSink::healthy(SinkKind::Cache);
    let warehouse_1 = ScriptedSink::healthy(SinkKind::Warehouse);
    let external_1 = ScriptedSink::new(SinkKind::External, |call| {
        if matches!(call.event_id, 7 | 13) {
            Step::Hang
        } else {
            Step::Deliver
        }
    });
    let sinks = SinkSet::new(vec![
        spawn(cache_1.clone(), &blueprint, &state),
        spawn(warehouse_1.clone(), &blueprint, &state),
        spawn(external_1.clone(), &blueprint, &state),
    ]);
    let coordinator = DispatchCoordinator::new(
        CoordinatorSettings::live(&blueprint),
        CoordinatorParts {
            reference: catalog(KEYS),
            sinks,
            state: state.clone(),
        },
    )
    .unwrap();
    let source = whole_log(&log, coordinator.resume_offset()).await;
    let (_tx, rx) = watch::channel(false);
    let run = tokio::spawn(coordinator.run(source, rx));

    // 14 events done everywhere, 7 and 13 done at cache and warehouse only
    let ledger = Arc::clone(&state.ledger);
    wait_until(Duration::from_secs(5), || ledger.summary().delivered == 14 * 3 + 2 * 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    run.abort();
    assert!(run.await.unwrap_err().is_cancelled());
    drop(state);

    // Second run over the same state directory with healthy sinks
    let state = PipelineState::open(&config).unwrap();
    let persisted = state.checkpoints.load(LIVE_NAMESPACE).unwrap();
    assert!(
        persisted.as_ref().and_then(|c| c.offset).map_or(true, |offset| offset < 6),
        "checkpoint passed the stuck event: {persisted:?}"
    );

    let cache_2 = ScriptedSink::healthy(SinkKind::Cache);
    let warehouse_2 = ScriptedSink::healthy(SinkKind::Warehouse);
    let external_2 = ScriptedSink::healthy(SinkKind::External);
    let sinks = SinkSet::new(vec![
        spawn(cache_2.clone(), &blueprint, &state),
        spawn(warehouse_2.clone(), &blueprint, &state),
        spawn(external_2.clone(), &blueprint, &state),
    ]);
    let report = run_to_end(&blueprint, &log, sinks, &state, KEYS).await;

    assert_eq!(report.checkpoint, Some(EVENTS - 1));
    assert!(state.ledger.pending().is_empty());
    assert_eq!(state.ledger.summary().delivered, (EVENTS * 3) as usize);

    // Only the stuck events and the ones queued behind them are new work
    assert_eq!(sorted(external_2.recorder.delivered_ids()), vec![7, 11, 13, 15, 17, 19]);
    assert_eq!(sorted(cache_2.recorder.delivered_ids()), vec![11, 15, 17, 19]);
    assert_eq!(sorted(warehouse_2.recorder.delivered_ids()), vec![11, 15, 17, 19]);

    let all: Vec<u64> = (1..=EVENTS).collect();
    for (first, second) in [(&cache_1, &cache_2), (&warehouse_1, &warehouse_2), (&external_1, &external_2)] {
        let mut combined = first.recorder.delivered_ids();
        combined.extend(second.recorder.delivered_ids());
        assert_eq!(sorted(combined), all);
    }
}

#[tokio::test]
async fn test_restart_after_clean_run_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let config = StateConfig {
        dir: dir.path().join("state"),
        ..StateConfig::default()
    };
    let blueprint = fast_blueprint();
    let log = Arc::new(MemoryEventLog::from_events(events(8, 2)));

    let state = PipelineState::open(&config).unwrap();
    let sinks = SinkSet::new(vec![spawn(ScriptedSink::healthy(SinkKind::Cache), &blueprint, &state)]);
    let first = run_to_end(&blueprint, &log, sinks, &state, 2).await;
    assert_eq!(first.checkpoint, Some(7));
    drop(state);

    let state = PipelineState::open(&config).unwrap();
    let cache = ScriptedSink::healthy(SinkKind::Cache);
    let sinks = SinkSet::new(vec![spawn(cache.clone(), &blueprint, &state)]);
    let second = run_to_end(&blueprint, &log, sinks, &state, 2).await;

    assert_eq!(second.events_observed, 0);
    assert_eq!(second.checkpoint, Some(7));
    assert!(cache.recorder.calls().is_empty());
}
