//! Live runs deliver the events of one content id in source order at every
//! sink, even when sink latency varies and deliveries are retried.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use contracts::{EventId, SinkKind};
use dispatcher::{PipelineState, SinkSet};
use ingestion::MemoryEventLog;

use crate::support::{events, fast_blueprint, run_to_end, spawn, Recorder, ScriptedSink, Step};

const EVENTS: u64 = 120;
const KEYS: u64 = 6;

/// Delivered ids grouped by partition key, in completion order
fn per_key(recorder: &Recorder) -> HashMap<u64, Vec<EventId>> {
    let mut groups: HashMap<u64, Vec<EventId>> = HashMap::new();
    for id in recorder.delivered_ids() {
        groups.entry((id - 1) % KEYS).or_default().push(id);
    }
    groups
}

fn assert_source_order(sink: SinkKind, recorder: &Recorder) {
    let groups = per_key(recorder);
    assert_eq!(groups.len(), KEYS as usize, "{sink}");
    for (key, ids) in groups {
        assert!(
            ids.windows(2).all(|pair| pair[0] < pair[1]),
            "{sink} delivered key {key} out of order: {ids:?}"
        );
        assert_eq!(ids.len(), (EVENTS / KEYS) as usize);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_live_run_preserves_per_key_order() {
    let blueprint = fast_blueprint();
    let state = PipelineState::in_memory();
    let log = Arc::new(MemoryEventLog::from_events(events(EVENTS, KEYS)));

    let warehouse = ScriptedSink::healthy(SinkKind::Warehouse)
        .with_delay(|id| Duration::from_millis(id * 7 % 5));
    // Every fifth event needs a second cache attempt
    let cache = ScriptedSink::new(SinkKind::Cache, |call| {
        if call.event_id % 5 == 0 && call.attempt == 1 {
            Step::Transient
        } else {
            Step::Deliver
        }
    });
    let sinks = SinkSet::new(vec![
        spawn(cache.clone(), &blueprint, &state),
        spawn(warehouse.clone(), &blueprint, &state),
    ]);
    let report = run_to_end(&blueprint, &log, sinks, &state, KEYS).await;

    assert_eq!(report.events_completed, EVENTS);
    assert_eq!(report.checkpoint, Some(EVENTS - 1));
    assert_source_order(SinkKind::Cache, &cache.recorder);
    assert_source_order(SinkKind::Warehouse, &warehouse.recorder);
    assert!(cache.recorder.duplicates().is_empty());
}
