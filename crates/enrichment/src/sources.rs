//! Reference-data sources

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use contracts::{ContentMetadata, ContractError, ReferenceSource};
use uuid::Uuid;

/// In-process catalog. Clones share the same catalog, so tests and demos can
/// change reference data underneath a running cache.
#[derive(Debug, Clone, Default)]
pub struct StaticReferenceSource {
    entries: Arc<RwLock<HashMap<Uuid, ContentMetadata>>>,
}

impl StaticReferenceSource {
    pub fn new(entries: impl IntoIterator<Item = ContentMetadata>) -> Self {
        Self {
            entries: Arc::new(RwLock::new(
                entries.into_iter().map(|m| (m.content_id, m)).collect(),
            )),
        }
    }

    /// Insert or replace (last write wins)
    pub fn upsert(&self, metadata: ContentMetadata) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(metadata.content_id, metadata);
        }
    }

    pub fn remove(&self, content_id: Uuid) {
        if let Ok(mut entries) = self.entries.write() {
            entries.remove(&content_id);
        }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<Uuid, ContentMetadata>>, ContractError> {
        self.entries
            .read()
            .map_err(|_| ContractError::reference("static catalog lock poisoned"))
    }
}

impl ReferenceSource for StaticReferenceSource {
    async fn fetch_all(&self) -> Result<Vec<ContentMetadata>, ContractError> {
        Ok(self.read()?.values().cloned().collect())
    }

    async fn fetch_one(&self, content_id: Uuid) -> Result<Option<ContentMetadata>, ContractError> {
        Ok(self.read()?.get(&content_id).cloned())
    }
}

/// JSON array of `ContentMetadata`, re-read on every fetch
#[derive(Debug, Clone)]
pub struct JsonFileReferenceSource {
    path: PathBuf,
}

impl JsonFileReferenceSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn load(&self) -> Result<Vec<ContentMetadata>, ContractError> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            ContractError::reference(format!("read {}: {e}", self.path.display()))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            ContractError::reference(format!("parse {}: {e}", self.path.display()))
        })
    }
}

impl ReferenceSource for JsonFileReferenceSource {
    async fn fetch_all(&self) -> Result<Vec<ContentMetadata>, ContractError> {
        self.load().await
    }

    async fn fetch_one(&self, content_id: Uuid) -> Result<Option<ContentMetadata>, ContractError> {
        Ok(self
            .load()
            .await?
            .into_iter()
            .find(|m| m.content_id == content_id))
    }
}
