//! ReferenceSource trait - where content metadata comes from

use uuid::Uuid;

use crate::{ContentMetadata, ContractError};

#[trait_variant::make(ReferenceSource: Send)]
pub trait LocalReferenceSource {
    /// Full snapshot of all known content
    async fn fetch_all(&self) -> Result<Vec<ContentMetadata>, ContractError>;

    /// Point lookup used on cache miss
    async fn fetch_one(&self, content_id: Uuid) -> Result<Option<ContentMetadata>, ContractError>;
}
