//! Event logs
//!
//! Offsets are 0-based positions. Both logs wake tail readers through a
//! `Notify` on append; `JsonlEventLog` additionally picks up lines appended
//! by other processes on its poll interval.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;

use contracts::{ContractError, EventLog, RawEvent, SourceOffset, SourceRecord};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{debug, instrument};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// In-process log for tests and demos
#[derive(Debug)]
pub struct MemoryEventLog {
    events: RwLock<Vec<RawEvent>>,
    notify: Notify,
    poll_interval: Duration,
}

impl Default for MemoryEventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self {
            events: RwLock::new(Vec::new()),
            notify: Notify::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn from_events(events: impl IntoIterator<Item = RawEvent>) -> Self {
        Self {
            events: RwLock::new(events.into_iter().collect()),
            ..Self::new()
        }
    }
}

impl EventLog for MemoryEventLog {
    async fn append(&self, event: RawEvent) -> Result<SourceOffset, ContractError> {
        let offset = {
            let mut events = self.events.write().await;
            events.push(event);
            (events.len() - 1) as SourceOffset
        };
        self.notify.notify_waiters();
        Ok(offset)
    }

    async fn read_from(
        &self,
        offset: SourceOffset,
        max: usize,
    ) -> Result<Vec<SourceRecord>, ContractError> {
        let events = self.events.read().await;
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(events.len());
        let end = start.saturating_add(max).min(events.len());
        Ok(events[start..end]
            .iter()
            .enumerate()
            .map(|(i, event)| SourceRecord {
                offset: (start + i) as SourceOffset,
                event: event.clone(),
            })
            .collect())
    }

    async fn len(&self) -> Result<u64, ContractError> {
        Ok(self.events.read().await.len() as u64)
    }

    async fn wait_for_append(&self, known_len: u64) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.events.read().await.len() as u64 > known_len {
            return;
        }
        tokio::select! {
            _ = notified => {}
            _ = tokio::time::sleep(self.poll_interval) => {}
        }
    }
}

/// Durable newline-delimited JSON log; offset = line index.
///
/// Only complete lines (terminated by `\n`) count, so a writer caught
/// mid-append is invisible until it finishes the line.
#[derive(Debug)]
pub struct JsonlEventLog {
    path: PathBuf,
    index: Mutex<LineIndex>,
    notify: Notify,
    poll_interval: Duration,
    fsync: bool,
}

/// Byte position of every complete line seen so far
#[derive(Debug, Default)]
struct LineIndex {
    line_starts: Vec<u64>,
    scanned_to: u64,
}

impl JsonlEventLog {
    /// Open (creating if missing) the log at `path`.
    #[instrument(name = "jsonl_log_open", skip_all, fields(path = %path.as_ref().display()))]
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, ContractError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        let log = Self {
            path,
            index: Mutex::new(LineIndex::default()),
            notify: Notify::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            fsync: false,
        };
        let len = {
            let mut index = log.index.lock().await;
            log.rescan(&mut index).await?;
            index.line_starts.len()
        };
        debug!(events = len, "Event log opened");
        Ok(log)
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// fsync every append
    pub fn with_fsync(mut self, fsync: bool) -> Self {
        self.fsync = fsync;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Index lines appended since the last scan (by us or anyone else).
    async fn rescan(&self, index: &mut LineIndex) -> Result<(), ContractError> {
        let mut file = File::open(&self.path).await?;
        let file_len = file.metadata().await?.len();
        if file_len < index.scanned_to {
            return Err(ContractError::corruption(
                "event log",
                format!(
                    "{} shrank from {} to {} bytes",
                    self.path.display(),
                    index.scanned_to,
                    file_len
                ),
            ));
        }
        if file_len == index.scanned_to {
            return Ok(());
        }

        file.seek(SeekFrom::Start(index.scanned_to)).await?;
        let mut buf = Vec::with_capacity((file_len - index.scanned_to) as usize);
        file.read_to_end(&mut buf).await?;

        let mut line_start = index.scanned_to;
        for (i, byte) in buf.iter().enumerate() {
            if *byte == b'\n' {
                index.line_starts.push(line_start);
                line_start = index.scanned_to + i as u64 + 1;
            }
        }
        index.scanned_to = line_start;
        Ok(())
    }

    fn decode(offset: SourceOffset, line: &str) -> Result<SourceRecord, ContractError> {
        serde_json::from_str(line)
            .map(|event| SourceRecord { offset, event })
            .map_err(|e| ContractError::SourceDecode {
                offset,
                message: e.to_string(),
            })
    }
}

impl EventLog for JsonlEventLog {
    async fn append(&self, event: RawEvent) -> Result<SourceOffset, ContractError> {
        let mut line = serde_json::to_vec(&event)
            .map_err(|e| ContractError::source(format!("encode event {}: {e}", event.id)))?;
        line.push(b'\n');

        let mut index = self.index.lock().await;
        let mut file = OpenOptions::new().append(true).open(&self.path).await?;
        file.write_all(&line).await?;
        file.flush().await?;
        if self.fsync {
            file.sync_data().await?;
        }
        self.rescan(&mut index).await?;
        let offset = (index.line_starts.len() as SourceOffset).saturating_sub(1);
        drop(index);

        self.notify.notify_waiters();
        Ok(offset)
    }

    async fn read_from(
        &self,
        offset: SourceOffset,
        max: usize,
    ) -> Result<Vec<SourceRecord>, ContractError> {
        let (start_byte, count) = {
            let mut index = self.index.lock().await;
            self.rescan(&mut index).await?;
            let len = index.line_starts.len() as u64;
            if offset >= len || max == 0 {
                return Ok(Vec::new());
            }
            let count = (len - offset).min(max as u64) as usize;
            (index.line_starts[offset as usize], count)
        };

        let mut file = File::open(&self.path).await?;
        file.seek(SeekFrom::Start(start_byte)).await?;
        let mut lines = BufReader::new(file).lines();

        let mut records = Vec::with_capacity(count);
        for i in 0..count {
            let record_offset = offset + i as u64;
            let line = lines.next_line().await?.ok_or_else(|| {
                ContractError::corruption(
                    "event log",
                    format!("line {record_offset} indexed but not readable"),
                )
            })?;
            records.push(Self::decode(record_offset, &line)?);
        }
        Ok(records)
    }

    async fn len(&self) -> Result<u64, ContractError> {
        let mut index = self.index.lock().await;
        self.rescan(&mut index).await?;
        Ok(index.line_starts.len() as u64)
    }

    async fn wait_for_append(&self, known_len: u64) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if matches!(self.len().await, Ok(len) if len > known_len) {
            return;
        }
        tokio::select! {
            _ = notified => {}
            _ = tokio::time::sleep(self.poll_interval) => {}
        }
    }
}
