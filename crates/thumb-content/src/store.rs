//! Content store collaborator interface.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

use thumb_models::{
    ContentId, ContentMetadata, DerivedRecord, DerivedStatus, ObjectInfo, ParentAsset,
    ParentStatus,
};

use crate::error::ContentResult;

/// Offset/limit window for listing calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub offset: usize,
    pub limit: usize,
}

impl PageRequest {
    pub fn new(offset: usize, limit: usize) -> Self {
        Self { offset, limit }
    }
}

/// One page of a listing plus the total match count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
}

/// Filter for scanning parent assets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ParentStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    /// Only original uploads (no derivation type)
    #[serde(default)]
    pub originals_only: bool,
}

/// Filter for scanning derived records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedFilter {
    /// Empty means any status
    #[serde(default)]
    pub statuses: Vec<DerivedStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub derivation_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
}

/// Request body for creating a derived placeholder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewDerived {
    pub variant: String,
    pub derivation_type: String,
    pub metadata: ContentMetadata,
}

/// CRUD, object and listing operations the worker needs from the store.
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn get_content(&self, id: &ContentId) -> ContentResult<ParentAsset>;

    async fn get_metadata(&self, id: &ContentId) -> ContentResult<ContentMetadata>;

    /// Stream the content's bytes into `dest`, returning the byte count.
    async fn download_to(&self, id: &ContentId, dest: &Path) -> ContentResult<u64>;

    /// Create a derived record in status `created`.
    async fn create_derived(&self, parent: &ContentId, req: &NewDerived) -> ContentResult<DerivedRecord>;

    async fn update_status(&self, id: &ContentId, status: DerivedStatus) -> ContentResult<()>;

    async fn update_metadata(&self, id: &ContentId, metadata: &ContentMetadata) -> ContentResult<()>;

    /// Upload a file as the object backing an existing content record.
    async fn upload_object(&self, id: &ContentId, path: &Path, mime_type: &str) -> ContentResult<ObjectInfo>;

    async fn list_objects(&self, id: &ContentId) -> ContentResult<Vec<ObjectInfo>>;

    async fn list_derived(&self, parent: &ContentId, derivation_type: &str) -> ContentResult<Vec<DerivedRecord>>;

    async fn list_contents(&self, filter: &ContentFilter, page: PageRequest) -> ContentResult<Page<ParentAsset>>;

    async fn list_derived_records(
        &self,
        filter: &DerivedFilter,
        page: PageRequest,
    ) -> ContentResult<Page<DerivedRecord>>;
}
