//! Replaying a whole log through real sinks a second time, with the ledger
//! forgotten, leaves every destination exactly as the first run left it.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use config_loader::{ConfigFormat, ConfigLoader};
use contracts::{PipelineBlueprint, SinkKind};
use dispatcher::sinks::{MemoryKeyValueStore, MemoryWarehouseTable};
use dispatcher::{DispatcherBuilder, PipelineState};
use ingestion::MemoryEventLog;

use crate::support::{events, run_to_end};

const EVENTS: u64 = 10;
const KEYS: u64 = 3;

/// Endpoint that honours `Idempotency-Key`, answering 409 for keys it has
/// already applied. The first request for event 3 is applied but answered
/// with a 503, like a response lost after the write.
#[derive(Default)]
struct Endpoint {
    applied: Mutex<HashMap<String, serde_json::Value>>,
    lost_reply: Mutex<HashSet<String>>,
    requests: AtomicUsize,
}

impl Endpoint {
    fn applied(&self) -> usize {
        self.applied.lock().unwrap().len()
    }

    fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

async fn ingest(
    State(endpoint): State<Arc<Endpoint>>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> StatusCode {
    endpoint.requests.fetch_add(1, Ordering::SeqCst);
    let Some(key) = headers
        .get("idempotency-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
    else {
        return StatusCode::BAD_REQUEST;
    };

    let mut applied = endpoint.applied.lock().unwrap();
    if applied.contains_key(&key) {
        return StatusCode::CONFLICT;
    }
    applied.insert(key.clone(), body);
    if key == "engagement-3" && endpoint.lost_reply.lock().unwrap().insert(key) {
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    StatusCode::CREATED
}

async fn serve() -> (Arc<Endpoint>, String) {
    let endpoint = Arc::new(Endpoint::default());
    let app = Router::new()
        .route("/engagements", post(ingest))
        .with_state(Arc::clone(&endpoint));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (endpoint, format!("http://{addr}/engagements"))
}

fn blueprint(url: &str) -> PipelineBlueprint {
    let toml = format!(
        r#"
[reference]
kind = "static"

[dispatch]
checkpoint_interval_ms = 10
shutdown_grace_secs = 2

[sinks.cache.retry]
max_attempts = 3
base_delay_ms = 1
max_delay_ms = 5

[sinks.warehouse]
table = "memory"
batch_size = 4
max_batch_ms = 5

[sinks.external]
enabled = true
url = "{url}"
timeout_ms = 2000

[sinks.external.retry]
max_attempts = 4
base_delay_ms = 5
max_delay_ms = 20
"#
    );
    ConfigLoader::load_from_str(&toml, ConfigFormat::Toml).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_second_pass_over_the_log_changes_nothing() {
    let (endpoint, url) = serve().await;
    let blueprint = blueprint(&url);
    assert_eq!(
        blueprint.sinks.enabled(),
        vec![SinkKind::Cache, SinkKind::Warehouse, SinkKind::External]
    );
    let log = Arc::new(MemoryEventLog::from_events(events(EVENTS, KEYS)));
    let kv = MemoryKeyValueStore::new();
    let table = MemoryWarehouseTable::new();

    let first_state = PipelineState::in_memory();
    let sinks = DispatcherBuilder::new(blueprint.sinks.clone(), first_state.clone())
        .with_key_value_store(kv.clone())
        .with_warehouse_table(table.clone())
        .build()
        .await
        .unwrap();
    let first = run_to_end(&blueprint, &log, sinks, &first_state, KEYS).await;

    assert_eq!(first.checkpoint, Some(EVENTS - 1));
    for sink in SinkKind::ALL {
        assert_eq!(first.delivered(sink), EVENTS, "{sink}");
    }
    // The lost reply cost one extra request; the retry got a 409
    assert_eq!(endpoint.applied(), EVENTS as usize);
    assert_eq!(endpoint.requests(), EVENTS as usize + 1);
    assert_eq!(
        first_state.ledger.get(3, SinkKind::External).map(|r| r.attempt_count),
        Some(2)
    );

    let kv_before = kv.snapshot();
    let rows_before = table.len();
    assert_eq!(rows_before, EVENTS as usize);

    // Fresh ledger: every (event, sink) pair is delivered again
    let second_state = PipelineState::in_memory();
    let sinks = DispatcherBuilder::new(blueprint.sinks.clone(), second_state.clone())
        .with_key_value_store(kv.clone())
        .with_warehouse_table(table.clone())
        .build()
        .await
        .unwrap();
    let second = run_to_end(&blueprint, &log, sinks, &second_state, KEYS).await;

    assert_eq!(second.events_completed, EVENTS);
    for sink in SinkKind::ALL {
        assert_eq!(second.delivered(sink), EVENTS, "{sink}");
    }
    assert_eq!(endpoint.applied(), EVENTS as usize);
    assert_eq!(endpoint.requests(), 2 * EVENTS as usize + 1);
    assert_eq!(table.len(), rows_before);
    assert_eq!(kv.snapshot(), kv_before);
}
