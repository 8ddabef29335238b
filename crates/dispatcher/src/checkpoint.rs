//! Checkpoint persistence and the low-watermark tracker

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use contracts::{Checkpoint, ContractError, SourceOffset};
use tracing::{debug, instrument};

use crate::journal::write_atomic;

const STORE: &str = "checkpoint";
pub const CHECKPOINT_DIR: &str = "checkpoints";

#[derive(Debug)]
enum Backing {
    Dir { dir: PathBuf, fsync: bool },
    Memory(Mutex<HashMap<String, Checkpoint>>),
}

/// One JSON file per namespace under `<state>/checkpoints/`
#[derive(Debug)]
pub struct CheckpointStore {
    backing: Backing,
}

impl CheckpointStore {
    pub fn open(state_dir: impl AsRef<Path>, fsync: bool) -> Result<Self, ContractError> {
        let dir = state_dir.as_ref().join(CHECKPOINT_DIR);
        fs::create_dir_all(&dir).map_err(|e| storage_error(&dir, e))?;
        Ok(Self {
            backing: Backing::Dir { dir, fsync },
        })
    }

    pub fn in_memory() -> Self {
        Self {
            backing: Backing::Memory(Mutex::new(HashMap::new())),
        }
    }

    /// Stored checkpoint for `namespace`. An unreadable file is corruption.
    pub fn load(&self, namespace: &str) -> Result<Option<Checkpoint>, ContractError> {
        match &self.backing {
            Backing::Memory(map) => Ok(lock(map).get(namespace).cloned()),
            Backing::Dir { dir, .. } => {
                let path = dir.join(file_name(namespace));
                match fs::read(&path) {
                    Ok(bytes) => decode(&path, &bytes).map(Some),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
                    Err(e) => Err(storage_error(&path, e)),
                }
            }
        }
    }

    #[instrument(name = "checkpoint_save", skip(self, checkpoint), fields(namespace = %checkpoint.namespace, offset = ?checkpoint.offset))]
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<(), ContractError> {
        match &self.backing {
            Backing::Memory(map) => {
                lock(map).insert(checkpoint.namespace.clone(), checkpoint.clone());
            }
            Backing::Dir { dir, fsync } => {
                let path = dir.join(file_name(&checkpoint.namespace));
                let bytes = serde_json::to_vec_pretty(checkpoint)
                    .map_err(|e| ContractError::storage(STORE, e.to_string()))?;
                write_atomic(&path, &bytes, *fsync).map_err(|e| storage_error(&path, e))?;
            }
        }
        if let Some(offset) = checkpoint.offset {
            observability::record_checkpoint(&checkpoint.namespace, offset);
        }
        debug!("Checkpoint persisted");
        Ok(())
    }

    /// Every stored checkpoint, ordered by namespace
    pub fn list(&self) -> Result<Vec<Checkpoint>, ContractError> {
        let mut checkpoints = match &self.backing {
            Backing::Memory(map) => lock(map).values().cloned().collect(),
            Backing::Dir { dir, .. } => {
                let mut found = Vec::new();
                for entry in fs::read_dir(dir).map_err(|e| storage_error(dir, e))? {
                    let path = entry.map_err(|e| storage_error(dir, e))?.path();
                    if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                        continue;
                    }
                    let bytes = fs::read(&path).map_err(|e| storage_error(&path, e))?;
                    found.push(decode(&path, &bytes)?);
                }
                found
            }
        };
        checkpoints.sort_by(|a: &Checkpoint, b: &Checkpoint| a.namespace.cmp(&b.namespace));
        Ok(checkpoints)
    }
}

/// Namespaces carry `:` and `+`; keep file names portable.
fn file_name(namespace: &str) -> String {
    let stem: String = namespace
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    format!("{stem}.json")
}

fn decode(path: &Path, bytes: &[u8]) -> Result<Checkpoint, ContractError> {
    serde_json::from_slice(bytes)
        .map_err(|e| ContractError::corruption(STORE, format!("{}: {e}", path.display())))
}

fn storage_error(path: &Path, e: io::Error) -> ContractError {
    ContractError::storage(STORE, format!("{}: {e}", path.display()))
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Low watermark over observed offsets.
///
/// Offsets must be observed in increasing order. The watermark is the
/// highest completed offset with no observed-but-unfinished offset below it.
#[derive(Debug, Clone, Default)]
pub struct WatermarkTracker {
    watermark: Option<SourceOffset>,
    pending: BTreeSet<SourceOffset>,
    completed: BTreeSet<SourceOffset>,
}

impl WatermarkTracker {
    /// Start from a previously committed checkpoint offset
    pub fn new(committed: Option<SourceOffset>) -> Self {
        Self {
            watermark: committed,
            ..Self::default()
        }
    }

    pub fn observe(&mut self, offset: SourceOffset) {
        self.pending.insert(offset);
    }

    /// Mark `offset` finished. Returns the new watermark if it moved.
    pub fn complete(&mut self, offset: SourceOffset) -> Option<SourceOffset> {
        if !self.pending.remove(&offset) {
            return None;
        }
        self.completed.insert(offset);

        let floor = self.pending.first().copied();
        let mut advanced = None;
        while let Some(&lowest) = self.completed.first() {
            if floor.is_some_and(|floor| lowest > floor) {
                break;
            }
            self.completed.pop_first();
            if self.watermark.is_none_or(|current| lowest > current) {
                self.watermark = Some(lowest);
                advanced = Some(lowest);
            }
        }
        advanced
    }

    pub fn watermark(&self) -> Option<SourceOffset> {
        self.watermark
    }

    /// Observed offsets not yet completed
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }
}
