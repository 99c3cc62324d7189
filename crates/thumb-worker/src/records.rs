//! Derived record lifecycle against the content store.

use std::sync::Arc;

use tracing::{debug, warn};

use thumb_content::{ContentStore, NewDerived};
use thumb_models::{
    ContentId, ContentMetadata, DerivationParams, DerivedRecord, DerivedStatus, SizeSpec,
    THUMBNAIL_DERIVATION,
};

use crate::error::WorkerResult;

/// A placeholder created for one requested size.
#[derive(Debug, Clone, PartialEq)]
pub struct Placeholder {
    pub spec: SizeSpec,
    pub record: DerivedRecord,
}

/// Owns every status write for derived records.
#[derive(Clone)]
pub struct DerivedRecordManager {
    store: Arc<dyn ContentStore>,
}

impl DerivedRecordManager {
    pub fn new(store: Arc<dyn ContentStore>) -> Self {
        Self { store }
    }

    pub async fn create_placeholder(
        &self,
        parent: &ContentId,
        variant: &str,
        metadata: ContentMetadata,
    ) -> WorkerResult<DerivedRecord> {
        let request = NewDerived {
            variant: variant.to_string(),
            derivation_type: THUMBNAIL_DERIVATION.to_string(),
            metadata,
        };
        let record = self.store.create_derived(parent, &request).await?;
        debug!(
            parent_id = %parent,
            content_id = %record.content_id,
            variant = %variant,
            "Created placeholder"
        );
        Ok(record)
    }

    /// One placeholder per spec, in spec order.
    ///
    /// When a creation fails, placeholders already created are marked
    /// `failed` so none stay behind as pending work.
    pub async fn create_placeholders(&self, parent: &ContentId, specs: &[SizeSpec]) -> WorkerResult<Vec<Placeholder>> {
        let mut created: Vec<Placeholder> = Vec::with_capacity(specs.len());

        for spec in specs {
            let metadata = ContentMetadata {
                file_name: Some(spec.name.clone()),
                ..ContentMetadata::default()
            };
            match self.create_placeholder(parent, &spec.variant_name(), metadata).await {
                Ok(record) => created.push(Placeholder {
                    spec: spec.clone(),
                    record,
                }),
                Err(e) => {
                    for placeholder in &mut created {
                        if let Err(undo) = self.transition(&mut placeholder.record, DerivedStatus::Failed).await {
                            warn!(
                                content_id = %placeholder.record.content_id,
                                "Failed to mark orphan placeholder failed: {}",
                                undo
                            );
                        }
                    }
                    return Err(e);
                }
            }
        }

        Ok(created)
    }

    /// Move every placeholder to `processing`.
    ///
    /// Every transition is attempted; the first error is returned. A record
    /// whose write failed stays `created` and is settled by status repair.
    pub async fn mark_processing(&self, placeholders: &mut [Placeholder]) -> WorkerResult<()> {
        let mut first_error = None;
        for placeholder in placeholders.iter_mut() {
            if let Err(e) = self.transition(&mut placeholder.record, DerivedStatus::Processing).await {
                warn!(
                    content_id = %placeholder.record.content_id,
                    "Failed to mark placeholder processing: {}",
                    e
                );
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Validated transition; updates `record` on success.
    pub async fn transition(&self, record: &mut DerivedRecord, next: DerivedStatus) -> WorkerResult<()> {
        let next = record.status.transition(next)?;
        self.store.update_status(&record.content_id, next).await?;
        debug!(
            content_id = %record.content_id,
            from = %record.status,
            to = %next,
            "Derived status transition"
        );
        record.status = next;
        Ok(())
    }

    /// Repair write that bypasses the transition table.
    pub async fn force_status(&self, record: &mut DerivedRecord, next: DerivedStatus) -> WorkerResult<()> {
        if record.status == next {
            return Ok(());
        }
        self.store.update_status(&record.content_id, next).await?;
        warn!(
            content_id = %record.content_id,
            parent_id = %record.parent_id,
            from = %record.status,
            to = %next,
            "Repaired derived status"
        );
        record.status = next;
        Ok(())
    }

    pub async fn list_by_parent(&self, parent: &ContentId, derivation_type: &str) -> WorkerResult<Vec<DerivedRecord>> {
        Ok(self.store.list_derived(parent, derivation_type).await?)
    }

    /// Whether the record has an uploaded backing object.
    pub async fn verify_backing(&self, record: &DerivedRecord) -> WorkerResult<bool> {
        let objects = self.store.list_objects(&record.content_id).await?;
        Ok(objects.iter().any(|o| o.is_uploaded()))
    }

    /// Store derivation parameters as the record's metadata.
    pub async fn record_derivation(
        &self,
        record: &DerivedRecord,
        file_name: &str,
        mime_type: &str,
        file_size: u64,
        params: &DerivationParams,
    ) -> WorkerResult<()> {
        let extra = match serde_json::to_value(params) {
            Ok(serde_json::Value::Object(map)) => map.into_iter().collect(),
            _ => Default::default(),
        };
        let metadata = ContentMetadata {
            mime_type: Some(mime_type.to_string()),
            file_name: Some(file_name.to_string()),
            file_size: Some(file_size),
            extra,
        };
        self.store.update_metadata(&record.content_id, &metadata).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WorkerError;
    use chrono::Utc;
    use thumb_content::MemoryContentStore;
    use thumb_models::ParentStatus;

    fn setup() -> (Arc<MemoryContentStore>, DerivedRecordManager, ContentId) {
        let store = Arc::new(MemoryContentStore::new());
        let parent = store.insert_parent(ParentStatus::Uploaded, "image/png", "a.png", vec![0]);
        let manager = DerivedRecordManager::new(store.clone());
        (store, manager, parent)
    }

    fn specs() -> Vec<SizeSpec> {
        vec![SizeSpec::new("small", 150, 150), SizeSpec::new("wide", 512, 384)]
    }

    #[tokio::test]
    async fn test_placeholders_use_variant_names() {
        let (store, manager, parent) = setup();
        let created = manager.create_placeholders(&parent, &specs()).await.unwrap();

        let variants: Vec<&str> = created.iter().map(|p| p.record.variant.as_str()).collect();
        assert_eq!(variants, ["thumbnail_150", "thumbnail_512x384"]);
        assert!(created.iter().all(|p| p.record.status == DerivedStatus::Created));
        assert_eq!(store.derived_for(&parent).len(), 2);
    }

    #[tokio::test]
    async fn test_create_failure_leaves_nothing_pending() {
        let (store, manager, parent) = setup();
        store.fail_create_derived(true);
        assert!(manager.create_placeholders(&parent, &specs()).await.is_err());
        assert_eq!(store.derived_count(), 0);
    }

    #[tokio::test]
    async fn test_partial_create_marks_earlier_placeholders_failed() {
        let (store, manager, parent) = setup();
        let mut three = specs();
        three.push(SizeSpec::new("large", 1024, 1024));
        store.fail_create_derived_after(2);

        let err = manager.create_placeholders(&parent, &three).await.unwrap_err();
        assert!(matches!(err, WorkerError::Content(_)));

        let records = store.derived_for(&parent);
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.status == DerivedStatus::Failed));
    }

    #[tokio::test]
    async fn test_mark_processing_attempts_every_placeholder() {
        let (store, manager, parent) = setup();
        let mut placeholders = manager.create_placeholders(&parent, &specs()).await.unwrap();
        store.fail_status_updates_for(&placeholders[0].record.content_id);

        assert!(manager.mark_processing(&mut placeholders).await.is_err());
        assert_eq!(placeholders[0].record.status, DerivedStatus::Created);
        assert_eq!(placeholders[1].record.status, DerivedStatus::Processing);
        assert_eq!(
            store.derived_record(&placeholders[1].record.content_id).unwrap().status,
            DerivedStatus::Processing
        );
    }

    #[tokio::test]
    async fn test_transition_rejects_invalid_edge() {
        let (store, manager, parent) = setup();
        let mut record = manager
            .create_placeholder(&parent, "thumbnail_150", ContentMetadata::default())
            .await
            .unwrap();

        let err = manager
            .transition(&mut record, DerivedStatus::Processed)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Transition(_)));
        assert_eq!(record.status, DerivedStatus::Created);
        assert!(store.status_updates().is_empty());

        manager.transition(&mut record, DerivedStatus::Processing).await.unwrap();
        manager.transition(&mut record, DerivedStatus::Processed).await.unwrap();
        assert_eq!(
            store.derived_record(&record.content_id).unwrap().status,
            DerivedStatus::Processed
        );
    }

    #[tokio::test]
    async fn test_force_status_and_verify_backing() {
        let (store, manager, parent) = setup();
        let now = Utc::now();
        let mut record = DerivedRecord {
            content_id: ContentId::new(),
            parent_id: parent.clone(),
            variant: "thumbnail_150".into(),
            derivation_type: THUMBNAIL_DERIVATION.into(),
            status: DerivedStatus::Created,
            created_at: now,
            updated_at: now,
        };
        store.insert_derived(record.clone(), true);

        assert!(manager.verify_backing(&record).await.unwrap());
        manager.force_status(&mut record, DerivedStatus::Processed).await.unwrap();
        assert_eq!(record.status, DerivedStatus::Processed);

        // Same status is a no-op write.
        manager.force_status(&mut record, DerivedStatus::Processed).await.unwrap();
        assert_eq!(store.status_updates().len(), 1);

        let listed = manager.list_by_parent(&parent, THUMBNAIL_DERIVATION).await.unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn test_record_derivation_writes_params() {
        let (store, manager, parent) = setup();
        let record = manager
            .create_placeholder(&parent, "thumbnail_150", ContentMetadata::default())
            .await
            .unwrap();
        let params = DerivationParams {
            source_width: 400,
            source_height: 200,
            target_width: 150,
            target_height: 75,
            algorithm: "lanczos3".into(),
            quality: Some(85),
            processing_time_ms: 12,
            generated_at: Utc::now(),
        };

        manager
            .record_derivation(&record, "a_small.jpg", "image/jpeg", 1024, &params)
            .await
            .unwrap();

        let metadata = store.metadata_of(&record.content_id).unwrap();
        assert_eq!(metadata.mime_type.as_deref(), Some("image/jpeg"));
        assert_eq!(metadata.extra["algorithm"], "lanczos3");
        assert_eq!(metadata.extra["target_width"], 150);
    }
}
