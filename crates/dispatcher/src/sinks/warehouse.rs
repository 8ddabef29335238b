//! WarehouseSink - batched insert-or-ignore into an analytical table
//!
//! Deliveries hand their row to a batcher task and wait for the batch they
//! ended up in. A batch is written when it reaches `batch_size` rows or when
//! its oldest row has waited `max_batch_ms`.

use std::collections::{BTreeMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use contracts::{
    ContractError, DeliveryOutcome, EnrichedEvent, EventId, SinkKind, SinkWriter,
    WarehouseSinkConfig,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::{outcome_from_error, WarehouseTable};
use crate::journal::{read_journal, write_atomic};

const PARTITION_FILE: &str = "rows.jsonl";

/// One warehouse row per event, ids flattened to strings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarehouseRow {
    pub event_id: EventId,
    pub content_id: String,
    pub user_id: String,
    pub event_type: String,
    pub event_timestamp: DateTime<Utc>,
    pub duration_ms: Option<u64>,
    pub engagement_seconds: Option<f64>,
    pub engagement_pct: Option<f64>,
    pub device: Option<String>,
    pub content_slug: Option<String>,
    pub content_title: Option<String>,
    pub content_type: Option<String>,
    pub content_length_seconds: Option<i64>,
    pub raw_payload: Option<serde_json::Value>,
    pub processed_timestamp: DateTime<Utc>,
}

impl From<&EnrichedEvent> for WarehouseRow {
    fn from(event: &EnrichedEvent) -> Self {
        Self {
            event_id: event.id,
            content_id: event.content_id.to_string(),
            user_id: event.user_id.to_string(),
            event_type: event.event_type.as_str().to_string(),
            event_timestamp: event.event_ts,
            duration_ms: event.duration_ms,
            engagement_seconds: event.engagement_seconds,
            engagement_pct: event.engagement_pct,
            device: event.device.clone(),
            content_slug: event.content_slug.clone(),
            content_title: event.content_title.clone(),
            content_type: event.content_type.map(|t| t.to_string()),
            content_length_seconds: event.content_length_seconds,
            raw_payload: event.extra.clone(),
            processed_timestamp: event.processed_at,
        }
    }
}

impl WarehouseRow {
    /// Partition the row lands in
    pub fn partition_date(&self) -> String {
        self.event_timestamp.format("%Y-%m-%d").to_string()
    }
}

#[derive(Debug, Default)]
struct TableInner {
    rows: Vec<WarehouseRow>,
    ids: HashSet<EventId>,
}

/// In-process table keeping arrival order. Clones share the same rows.
#[derive(Debug, Clone, Default)]
pub struct MemoryWarehouseTable {
    inner: Arc<Mutex<TableInner>>,
}

impl MemoryWarehouseTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> Vec<WarehouseRow> {
        self.lock().rows.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TableInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl WarehouseTable for MemoryWarehouseTable {
    async fn insert_or_ignore(&self, rows: Vec<WarehouseRow>) -> Result<usize, ContractError> {
        let mut inner = self.lock();
        let mut inserted = 0;
        for row in rows {
            if inner.ids.insert(row.event_id) {
                inner.rows.push(row);
                inserted += 1;
            }
        }
        Ok(inserted)
    }
}

/// Date-partitioned JSONL files: `<dir>/dt=YYYY-MM-DD/rows.jsonl`
#[derive(Debug)]
pub struct JsonlWarehouseTable {
    dir: PathBuf,
    ids: Mutex<HashSet<EventId>>,
}

impl JsonlWarehouseTable {
    /// Open the table, rebuilding the event id set from existing partitions.
    #[instrument(name = "warehouse_table_open", skip_all, fields(dir = %dir.as_ref().display()))]
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, ContractError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| storage_error(&dir, e))?;

        let mut ids = HashSet::new();
        for partition in Self::partition_dirs(&dir)? {
            let path = partition.join(PARTITION_FILE);
            let rows: Vec<WarehouseRow> = read_journal("warehouse", &path)?;
            let total = rows.len();
            let unique: Vec<&WarehouseRow> =
                rows.iter().filter(|row| ids.insert(row.event_id)).collect();
            if unique.len() < total {
                // A write that failed part way was retried in full
                warn!(
                    partition = %partition.display(),
                    duplicates = total - unique.len(),
                    "Dropping duplicate warehouse rows"
                );
                let mut buffer = Vec::new();
                for row in unique {
                    serde_json::to_writer(&mut buffer, row).map_err(|e| {
                        ContractError::storage("warehouse", format!("encode row: {e}"))
                    })?;
                    buffer.push(b'\n');
                }
                write_atomic(&path, &buffer, false).map_err(|e| storage_error(&path, e))?;
            }
        }
        info!(rows = ids.len(), "Warehouse table opened");

        Ok(Self {
            dir,
            ids: Mutex::new(ids),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Rows of one partition in file order
    pub fn read_partition(&self, date: &str) -> Result<Vec<WarehouseRow>, ContractError> {
        read_journal(
            "warehouse",
            &self.dir.join(format!("dt={date}")).join(PARTITION_FILE),
        )
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn partition_dirs(dir: &Path) -> Result<Vec<PathBuf>, ContractError> {
        let mut partitions = Vec::new();
        for entry in fs::read_dir(dir).map_err(|e| storage_error(dir, e))? {
            let path = entry.map_err(|e| storage_error(dir, e))?.path();
            let is_partition = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with("dt="));
            if is_partition && path.is_dir() {
                partitions.push(path);
            }
        }
        partitions.sort();
        Ok(partitions)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<EventId>> {
        self.ids.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl WarehouseTable for JsonlWarehouseTable {
    async fn insert_or_ignore(&self, rows: Vec<WarehouseRow>) -> Result<usize, ContractError> {
        let mut ids = self.lock();
        let mut batch_ids = HashSet::new();
        let mut by_partition: BTreeMap<String, (Vec<u8>, Vec<EventId>)> = BTreeMap::new();

        for row in &rows {
            if ids.contains(&row.event_id) || !batch_ids.insert(row.event_id) {
                continue;
            }
            let (buffer, partition_ids) = by_partition.entry(row.partition_date()).or_default();
            serde_json::to_writer(&mut *buffer, row)
                .map_err(|e| ContractError::sink_write("warehouse", format!("encode row: {e}")))?;
            buffer.push(b'\n');
            partition_ids.push(row.event_id);
        }

        // Ids become visible per partition, so a failure in a later
        // partition cannot cause earlier ones to be written twice
        let mut inserted = 0;
        for (date, (bytes, partition_ids)) in by_partition {
            let partition = self.dir.join(format!("dt={date}"));
            fs::create_dir_all(&partition).map_err(|e| storage_error(&partition, e))?;
            let path = partition.join(PARTITION_FILE);
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .and_then(|mut file| file.write_all(&bytes).and_then(|()| file.flush()))
                .map_err(|e| storage_error(&path, e))?;
            inserted += partition_ids.len();
            ids.extend(partition_ids);
        }
        Ok(inserted)
    }
}

fn storage_error(path: &Path, e: std::io::Error) -> ContractError {
    ContractError::storage("warehouse", format!("{}: {e}", path.display()))
}

enum Command {
    Row {
        row: WarehouseRow,
        reply: oneshot::Sender<DeliveryOutcome>,
    },
    Flush(oneshot::Sender<()>),
    Close(oneshot::Sender<()>),
}

pub struct WarehouseSink {
    name: String,
    tx: mpsc::Sender<Command>,
    batcher: Mutex<Option<JoinHandle<()>>>,
}

impl WarehouseSink {
    /// Spawn the batcher for `table`
    pub fn new<T>(table: T, batch_size: usize, max_batch_wait: Duration) -> Self
    where
        T: WarehouseTable + Sync + 'static,
    {
        let name = "warehouse".to_string();
        let batch_size = batch_size.max(1);
        let (tx, rx) = mpsc::channel(batch_size * 2);
        let batcher = tokio::spawn(run_batcher(table, rx, batch_size, max_batch_wait));
        Self {
            name,
            tx,
            batcher: Mutex::new(Some(batcher)),
        }
    }

    pub fn from_config<T>(table: T, config: &WarehouseSinkConfig) -> Self
    where
        T: WarehouseTable + Sync + 'static,
    {
        Self::new(
            table,
            config.batch_size,
            Duration::from_millis(config.max_batch_ms),
        )
    }

    async fn command(&self, make: impl FnOnce(oneshot::Sender<()>) -> Command) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(make(done)).await.is_ok() {
            let _ = wait.await;
        }
    }
}

impl SinkWriter for WarehouseSink {
    fn kind(&self) -> SinkKind {
        SinkKind::Warehouse
    }

    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(
        name = "warehouse_sink_deliver",
        skip(self, event),
        fields(sink = %self.name, event_id = event.id)
    )]
    async fn deliver(&self, event: &EnrichedEvent) -> DeliveryOutcome {
        let (reply, outcome) = oneshot::channel();
        let command = Command::Row {
            row: WarehouseRow::from(event),
            reply,
        };
        if self.tx.send(command).await.is_err() {
            return DeliveryOutcome::transient("warehouse batcher stopped");
        }
        outcome
            .await
            .unwrap_or_else(|_| DeliveryOutcome::transient("warehouse batch dropped"))
    }

    #[instrument(name = "warehouse_sink_flush", skip(self))]
    async fn flush(&self) -> Result<(), ContractError> {
        self.command(Command::Flush).await;
        Ok(())
    }

    #[instrument(name = "warehouse_sink_close", skip(self))]
    async fn close(&self) -> Result<(), ContractError> {
        self.command(Command::Close).await;
        let batcher = self
            .batcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(batcher) = batcher {
            batcher
                .await
                .map_err(|e| ContractError::sink_write(&self.name, format!("batcher failed: {e}")))?;
        }
        debug!(sink = %self.name, "WarehouseSink closed");
        Ok(())
    }
}

async fn run_batcher<T: WarehouseTable + Sync>(
    table: T,
    mut rx: mpsc::Receiver<Command>,
    batch_size: usize,
    max_wait: Duration,
) {
    let mut pending: Vec<(WarehouseRow, oneshot::Sender<DeliveryOutcome>)> =
        Vec::with_capacity(batch_size);
    let mut deadline: Option<Instant> = None;

    loop {
        let command = match deadline {
            Some(at) => match tokio::time::timeout_at(at, rx.recv()).await {
                Ok(command) => command,
                Err(_) => {
                    write_batch(&table, &mut pending).await;
                    deadline = None;
                    continue;
                }
            },
            None => rx.recv().await,
        };

        match command {
            Some(Command::Row { row, reply }) => {
                if pending.is_empty() {
                    deadline = Some(Instant::now() + max_wait);
                }
                pending.push((row, reply));
                if pending.len() >= batch_size {
                    write_batch(&table, &mut pending).await;
                    deadline = None;
                }
            }
            Some(Command::Flush(done)) => {
                write_batch(&table, &mut pending).await;
                deadline = None;
                let _ = done.send(());
            }
            Some(Command::Close(done)) => {
                write_batch(&table, &mut pending).await;
                let _ = done.send(());
                break;
            }
            None => {
                write_batch(&table, &mut pending).await;
                break;
            }
        }
    }
}

/// Write the pending rows as one batch; every row gets the batch's outcome.
async fn write_batch<T: WarehouseTable + Sync>(
    table: &T,
    pending: &mut Vec<(WarehouseRow, oneshot::Sender<DeliveryOutcome>)>,
) {
    if pending.is_empty() {
        return;
    }
    let (rows, replies): (Vec<_>, Vec<_>) = pending.drain(..).unzip();
    let batch = rows.len();

    let outcome = match table.insert_or_ignore(rows).await {
        Ok(inserted) => {
            debug!(batch, inserted, "Warehouse batch written");
            DeliveryOutcome::Delivered
        }
        Err(e) => {
            warn!(batch, error = %e, "Warehouse batch failed");
            outcome_from_error(&e)
        }
    };
    for reply in replies {
        let _ = reply.send(outcome.clone());
    }
}
