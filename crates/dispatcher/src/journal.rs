//! Append-only JSONL files shared by the ledger and the dead-letter store

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use contracts::ContractError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

/// Open handle on a journal file, positioned for appends.
#[derive(Debug)]
pub(crate) struct Journal {
    store: &'static str,
    path: PathBuf,
    file: File,
    fsync: bool,
    lines: usize,
}

impl Journal {
    pub(crate) fn open(
        store: &'static str,
        path: impl Into<PathBuf>,
        fsync: bool,
        existing_lines: usize,
    ) -> Result<Self, ContractError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| storage_error(store, &path, e))?;
        }
        let file = open_append(&path).map_err(|e| storage_error(store, &path, e))?;
        Ok(Self {
            store,
            path,
            file,
            fsync,
            lines: existing_lines,
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Lines written since the file was last rewritten
    pub(crate) fn lines(&self) -> usize {
        self.lines
    }

    pub(crate) fn append<T: Serialize>(&mut self, entry: &T) -> Result<(), ContractError> {
        let mut line = serde_json::to_vec(entry)
            .map_err(|e| ContractError::storage(self.store, format!("encode failed: {e}")))?;
        line.push(b'\n');
        self.file
            .write_all(&line)
            .and_then(|()| self.file.flush())
            .and_then(|()| if self.fsync { self.file.sync_data() } else { Ok(()) })
            .map_err(|e| storage_error(self.store, &self.path, e))?;
        self.lines += 1;
        Ok(())
    }

    /// Replace the whole journal with `entries` (temp file + rename).
    pub(crate) fn rewrite<'a, T, I>(&mut self, entries: I) -> Result<(), ContractError>
    where
        T: Serialize + 'a,
        I: IntoIterator<Item = &'a T>,
    {
        let mut buffer = Vec::new();
        let mut count = 0;
        for entry in entries {
            serde_json::to_writer(&mut buffer, entry)
                .map_err(|e| ContractError::storage(self.store, format!("encode failed: {e}")))?;
            buffer.push(b'\n');
            count += 1;
        }
        write_atomic(&self.path, &buffer, self.fsync)
            .map_err(|e| storage_error(self.store, &self.path, e))?;
        self.file = open_append(&self.path).map_err(|e| storage_error(self.store, &self.path, e))?;
        self.lines = count;
        Ok(())
    }
}

/// Load every complete line of a journal.
///
/// A final line without its newline is a torn write from a crash: it is
/// dropped with a warning and truncated away. Any other line that fails to
/// decode is corruption.
pub(crate) fn read_journal<T: DeserializeOwned>(
    store: &'static str,
    path: &Path,
) -> Result<Vec<T>, ContractError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(storage_error(store, path, e)),
    };

    let complete_len = bytes
        .iter()
        .rposition(|b| *b == b'\n')
        .map_or(0, |pos| pos + 1);
    if complete_len < bytes.len() {
        warn!(
            store,
            path = %path.display(),
            dropped_bytes = bytes.len() - complete_len,
            "Discarding torn trailing journal line"
        );
        truncate(path, complete_len as u64).map_err(|e| storage_error(store, path, e))?;
    }

    let mut entries = Vec::new();
    for (index, line) in bytes[..complete_len].split(|b| *b == b'\n').enumerate() {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        let entry = serde_json::from_slice(line).map_err(|e| {
            ContractError::corruption(
                store,
                format!("{} line {}: {e}", path.display(), index + 1),
            )
        })?;
        entries.push(entry);
    }
    Ok(entries)
}

/// Write `bytes` to `path` through a sibling temp file and a rename.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8], fsync: bool) -> io::Result<()> {
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);

    let mut file = File::create(&tmp)?;
    file.write_all(bytes)?;
    if fsync {
        file.sync_all()?;
    }
    drop(file);
    fs::rename(&tmp, path)
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn truncate(path: &Path, len: u64) -> io::Result<()> {
    OpenOptions::new().write(true).open(path)?.set_len(len)
}

fn storage_error(store: &str, path: &Path, e: io::Error) -> ContractError {
    ContractError::storage(store, format!("{}: {e}", path.display()))
}
