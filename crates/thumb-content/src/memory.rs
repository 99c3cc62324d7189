//! In-process content store for tests and local runs.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use thumb_models::{
    ContentId, ContentMetadata, DerivedRecord, DerivedStatus, ObjectInfo, ObjectStatus,
    ParentAsset, ParentStatus,
};

use crate::error::{ContentError, ContentResult};
use crate::store::{ContentFilter, ContentStore, DerivedFilter, NewDerived, Page, PageRequest};

#[derive(Default)]
struct State {
    parents: HashMap<ContentId, ParentAsset>,
    metadata: HashMap<ContentId, ContentMetadata>,
    blobs: HashMap<ContentId, Vec<u8>>,
    derived: HashMap<ContentId, DerivedRecord>,
    objects: HashMap<ContentId, Vec<ObjectInfo>>,
    /// Insertion order for stable listing
    parent_order: Vec<ContentId>,
    derived_order: Vec<ContentId>,
    failing_upload_variants: HashSet<String>,
    fail_downloads: bool,
    /// Creations left before `create_derived` starts failing
    create_derived_budget: Option<usize>,
    failing_status_ids: HashSet<ContentId>,
    download_delay: Option<Duration>,
    status_updates: Vec<(ContentId, DerivedStatus)>,
}

/// Thread-safe in-memory [`ContentStore`] with failure injection.
#[derive(Default)]
pub struct MemoryContentStore {
    state: Mutex<State>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // Recover from poisoning.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register an uploaded parent with the given bytes.
    pub fn insert_parent(&self, status: ParentStatus, mime_type: &str, file_name: &str, bytes: Vec<u8>) -> ContentId {
        let id = ContentId::new();
        let now = Utc::now();
        let parent = ParentAsset {
            id: id.clone(),
            status,
            name: Some(file_name.to_string()),
            derivation_type: None,
            owner_id: None,
            tenant_id: None,
            created_at: now,
            updated_at: now,
        };
        let metadata = ContentMetadata {
            mime_type: Some(mime_type.to_string()),
            file_name: Some(file_name.to_string()),
            file_size: Some(bytes.len() as u64),
            ..ContentMetadata::default()
        };

        let mut state = self.lock();
        state.parents.insert(id.clone(), parent);
        state.metadata.insert(id.clone(), metadata);
        state.blobs.insert(id.clone(), bytes);
        state.parent_order.push(id.clone());
        id
    }

    /// Insert an existing derived record, optionally with an uploaded object.
    pub fn insert_derived(&self, record: DerivedRecord, uploaded: bool) {
        let mut state = self.lock();
        if uploaded {
            let info = ObjectInfo {
                object_id: format!("obj-{}", record.content_id),
                content_id: record.content_id.clone(),
                status: ObjectStatus::Uploaded,
                size_bytes: 1,
                mime_type: Some("image/jpeg".to_string()),
            };
            state.objects.entry(record.content_id.clone()).or_default().push(info);
        }
        state.derived_order.push(record.content_id.clone());
        state.derived.insert(record.content_id.clone(), record);
    }

    pub fn set_parent_owner(&self, id: &ContentId, owner_id: &str, tenant_id: &str) {
        if let Some(parent) = self.lock().parents.get_mut(id) {
            parent.owner_id = Some(owner_id.to_string());
            parent.tenant_id = Some(tenant_id.to_string());
        }
    }

    pub fn fail_uploads_for_variant(&self, variant: &str) {
        self.lock().failing_upload_variants.insert(variant.to_string());
    }

    pub fn fail_downloads(&self, fail: bool) {
        self.lock().fail_downloads = fail;
    }

    pub fn fail_create_derived(&self, fail: bool) {
        self.lock().create_derived_budget = fail.then_some(0);
    }

    /// Let `n` creations succeed, then fail every later one.
    pub fn fail_create_derived_after(&self, n: usize) {
        self.lock().create_derived_budget = Some(n);
    }

    pub fn fail_status_updates_for(&self, id: &ContentId) {
        self.lock().failing_status_ids.insert(id.clone());
    }

    pub fn set_download_delay(&self, delay: Duration) {
        self.lock().download_delay = Some(delay);
    }

    pub fn derived_for(&self, parent: &ContentId) -> Vec<DerivedRecord> {
        let state = self.lock();
        state
            .derived_order
            .iter()
            .filter_map(|id| state.derived.get(id))
            .filter(|r| &r.parent_id == parent)
            .cloned()
            .collect()
    }

    pub fn derived_record(&self, id: &ContentId) -> Option<DerivedRecord> {
        self.lock().derived.get(id).cloned()
    }

    pub fn metadata_of(&self, id: &ContentId) -> Option<ContentMetadata> {
        self.lock().metadata.get(id).cloned()
    }

    /// Every status write, in order.
    pub fn status_updates(&self) -> Vec<(ContentId, DerivedStatus)> {
        self.lock().status_updates.clone()
    }

    pub fn derived_count(&self) -> usize {
        self.lock().derived.len()
    }
}

fn paginate<T: Clone>(items: Vec<T>, page: PageRequest) -> Page<T> {
    let total = items.len();
    let items = items.into_iter().skip(page.offset).take(page.limit).collect();
    Page { items, total }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn get_content(&self, id: &ContentId) -> ContentResult<ParentAsset> {
        let state = self.lock();
        if let Some(parent) = state.parents.get(id) {
            return Ok(parent.clone());
        }
        Err(ContentError::not_found(format!("contents/{}", id)))
    }

    async fn get_metadata(&self, id: &ContentId) -> ContentResult<ContentMetadata> {
        self.lock()
            .metadata
            .get(id)
            .cloned()
            .ok_or_else(|| ContentError::not_found(format!("contents/{}/metadata", id)))
    }

    async fn download_to(&self, id: &ContentId, dest: &Path) -> ContentResult<u64> {
        let (bytes, delay) = {
            let state = self.lock();
            if state.fail_downloads {
                return Err(ContentError::ServerError(503, "download unavailable".to_string()));
            }
            let bytes = state
                .blobs
                .get(id)
                .cloned()
                .ok_or_else(|| ContentError::not_found(format!("contents/{}/download", id)))?;
            (bytes, state.download_delay)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        tokio::fs::write(dest, &bytes).await?;
        Ok(bytes.len() as u64)
    }

    async fn create_derived(&self, parent: &ContentId, req: &NewDerived) -> ContentResult<DerivedRecord> {
        let mut state = self.lock();
        let budget = state.create_derived_budget;
        match budget {
            Some(0) => return Err(ContentError::ServerError(500, "create derived failed".to_string())),
            Some(left) => state.create_derived_budget = Some(left - 1),
            None => {}
        }
        if !state.parents.contains_key(parent) {
            return Err(ContentError::not_found(format!("contents/{}", parent)));
        }

        let now = Utc::now();
        let record = DerivedRecord {
            content_id: ContentId::new(),
            parent_id: parent.clone(),
            variant: req.variant.clone(),
            derivation_type: req.derivation_type.clone(),
            status: DerivedStatus::Created,
            created_at: now,
            updated_at: now,
        };
        state.metadata.insert(record.content_id.clone(), req.metadata.clone());
        state.derived_order.push(record.content_id.clone());
        state.derived.insert(record.content_id.clone(), record.clone());
        Ok(record)
    }

    async fn update_status(&self, id: &ContentId, status: DerivedStatus) -> ContentResult<()> {
        let mut state = self.lock();
        if state.failing_status_ids.contains(id) {
            return Err(ContentError::ServerError(503, "status update failed".to_string()));
        }
        let record = state
            .derived
            .get_mut(id)
            .ok_or_else(|| ContentError::not_found(format!("contents/{}", id)))?;
        record.status = status;
        record.updated_at = Utc::now();
        state.status_updates.push((id.clone(), status));
        Ok(())
    }

    async fn update_metadata(&self, id: &ContentId, metadata: &ContentMetadata) -> ContentResult<()> {
        let mut state = self.lock();
        if !state.derived.contains_key(id) && !state.parents.contains_key(id) {
            return Err(ContentError::not_found(format!("contents/{}", id)));
        }
        state.metadata.insert(id.clone(), metadata.clone());
        Ok(())
    }

    async fn upload_object(&self, id: &ContentId, path: &Path, mime_type: &str) -> ContentResult<ObjectInfo> {
        let size_bytes = tokio::fs::metadata(path).await?.len();

        let mut state = self.lock();
        let variant = state
            .derived
            .get(id)
            .map(|r| r.variant.clone())
            .ok_or_else(|| ContentError::not_found(format!("contents/{}", id)))?;
        if state.failing_upload_variants.contains(&variant) {
            return Err(ContentError::ServerError(502, format!("upload of {} rejected", variant)));
        }

        let info = ObjectInfo {
            object_id: format!("obj-{}", id),
            content_id: id.clone(),
            status: ObjectStatus::Uploaded,
            size_bytes,
            mime_type: Some(mime_type.to_string()),
        };
        state.objects.entry(id.clone()).or_default().push(info.clone());
        Ok(info)
    }

    async fn list_objects(&self, id: &ContentId) -> ContentResult<Vec<ObjectInfo>> {
        Ok(self.lock().objects.get(id).cloned().unwrap_or_default())
    }

    async fn list_derived(&self, parent: &ContentId, derivation_type: &str) -> ContentResult<Vec<DerivedRecord>> {
        Ok(self
            .derived_for(parent)
            .into_iter()
            .filter(|r| r.derivation_type == derivation_type)
            .collect())
    }

    async fn list_contents(&self, filter: &ContentFilter, page: PageRequest) -> ContentResult<Page<ParentAsset>> {
        let state = self.lock();
        let matches: Vec<ParentAsset> = state
            .parent_order
            .iter()
            .filter_map(|id| state.parents.get(id))
            .filter(|p| filter.status.map_or(true, |s| p.status == s))
            .filter(|p| filter.owner_id.is_none() || p.owner_id == filter.owner_id)
            .filter(|p| filter.tenant_id.is_none() || p.tenant_id == filter.tenant_id)
            .filter(|p| !filter.originals_only || !p.is_derived())
            .cloned()
            .collect();
        Ok(paginate(matches, page))
    }

    async fn list_derived_records(
        &self,
        filter: &DerivedFilter,
        page: PageRequest,
    ) -> ContentResult<Page<DerivedRecord>> {
        let state = self.lock();
        let matches: Vec<DerivedRecord> = state
            .derived_order
            .iter()
            .filter_map(|id| state.derived.get(id))
            .filter(|r| filter.statuses.is_empty() || filter.statuses.contains(&r.status))
            .filter(|r| {
                filter
                    .derivation_type
                    .as_ref()
                    .map_or(true, |t| &r.derivation_type == t)
            })
            .filter(|r| {
                let parent = state.parents.get(&r.parent_id);
                let owner_ok = filter.owner_id.is_none()
                    || parent.is_some_and(|p| p.owner_id == filter.owner_id);
                let tenant_ok = filter.tenant_id.is_none()
                    || parent.is_some_and(|p| p.tenant_id == filter.tenant_id);
                owner_ok && tenant_ok
            })
            .cloned()
            .collect();
        Ok(paginate(matches, page))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use thumb_models::THUMBNAIL_DERIVATION;

    fn new_derived(variant: &str) -> NewDerived {
        NewDerived {
            variant: variant.to_string(),
            derivation_type: THUMBNAIL_DERIVATION.to_string(),
            metadata: ContentMetadata::default(),
        }
    }

    #[tokio::test]
    async fn test_derived_lifecycle() {
        let store = MemoryContentStore::new();
        let parent = store.insert_parent(ParentStatus::Uploaded, "image/png", "a.png", vec![1, 2, 3]);

        let record = store.create_derived(&parent, &new_derived("thumbnail_150")).await.unwrap();
        assert_eq!(record.status, DerivedStatus::Created);

        store.update_status(&record.content_id, DerivedStatus::Processing).await.unwrap();
        let listed = store.list_derived(&parent, THUMBNAIL_DERIVATION).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, DerivedStatus::Processing);
        assert!(store.list_derived(&parent, "preview").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_download_and_upload() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryContentStore::new();
        let parent = store.insert_parent(ParentStatus::Uploaded, "image/png", "a.png", vec![9; 16]);

        let dest = dir.path().join("src");
        assert_eq!(store.download_to(&parent, &dest).await.unwrap(), 16);

        let record = store.create_derived(&parent, &new_derived("thumbnail_64")).await.unwrap();
        let info = store.upload_object(&record.content_id, &dest, "image/png").await.unwrap();
        assert!(info.is_uploaded());
        assert_eq!(store.list_objects(&record.content_id).await.unwrap().len(), 1);

        store.fail_uploads_for_variant("thumbnail_64");
        assert!(store.upload_object(&record.content_id, &dest, "image/png").await.is_err());
    }

    #[tokio::test]
    async fn test_list_contents_paginates_and_filters() {
        let store = MemoryContentStore::new();
        for i in 0..5 {
            store.insert_parent(ParentStatus::Uploaded, "image/png", &format!("{}.png", i), vec![]);
        }
        store.insert_parent(ParentStatus::Created, "image/png", "pending.png", vec![]);

        let filter = ContentFilter {
            status: Some(ParentStatus::Uploaded),
            ..ContentFilter::default()
        };
        let page = store.list_contents(&filter, PageRequest::new(3, 10)).await.unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.items.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_parent() {
        let store = MemoryContentStore::new();
        let err = store.get_content(&ContentId::new()).await.unwrap_err();
        assert!(matches!(err, ContentError::NotFound(_)));
    }
}
