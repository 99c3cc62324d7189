//! End-to-end pipeline tests against the in-memory content store.

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use image::{DynamicImage, ImageOutputFormat, Rgb, RgbImage};
use tempfile::TempDir;

use thumb_content::MemoryContentStore;
use thumb_media::RendererRegistry;
use thumb_models::{
    ContentId, ContentMetadata, DerivedStatus, FailureClass, JobEnvelope, ParentStatus,
    ProcessingStage, ResultStatus, ThumbnailJob, HINT_FILENAME,
};
use thumb_queue::{MemoryLease, ParentLease, RecordingEventPublisher};

use super::*;

struct Harness {
    _work: TempDir,
    store: Arc<MemoryContentStore>,
    events: Arc<RecordingEventPublisher>,
    pipeline: Pipeline,
}

fn harness_with(settings: PipelineSettings) -> Harness {
    let work = TempDir::new().unwrap();
    let store = Arc::new(MemoryContentStore::new());
    let events = Arc::new(RecordingEventPublisher::new());
    let pipeline = Pipeline::new(
        store.clone(),
        SourceFetcher::new(store.clone(), work.path()),
        RendererRegistry::with_defaults(Duration::from_secs(10)),
        events.clone(),
        settings,
    );
    Harness {
        _work: work,
        store,
        events,
        pipeline,
    }
}

fn harness() -> Harness {
    harness_with(PipelineSettings::default())
}

fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([30, 120, 200])));
    let mut bytes = Cursor::new(Vec::new());
    img.write_to(&mut bytes, ImageOutputFormat::Png).unwrap();
    bytes.into_inner()
}

fn uploaded_png(h: &Harness) -> ContentId {
    h.store
        .insert_parent(ParentStatus::Uploaded, "image/png", "cat.png", png_bytes(400, 200))
}

fn terminal_count(events: &RecordingEventPublisher) -> usize {
    events.stages().iter().filter(|s| s.is_terminal()).count()
}

#[tokio::test]
async fn test_happy_path_processes_every_size() {
    let h = harness();
    let parent = uploaded_png(&h);

    let completion = h
        .pipeline
        .process(&JobEnvelope::for_content(&parent, None))
        .await
        .unwrap();

    assert_eq!(completion.total_processed, 3);
    assert_eq!(completion.total_failed, 0);
    assert_eq!(completion.parent_content_id.as_ref(), Some(&parent));
    assert_eq!(completion.parent_status, Some(ParentStatus::Uploaded));

    let small = completion.results.iter().find(|r| r.size == "small").unwrap();
    assert_eq!((small.width, small.height), (150, 75));
    let large = completion.results.iter().find(|r| r.size == "large").unwrap();
    assert_eq!((large.width, large.height), (400, 200));
    assert!(large.object_id.is_some());
    assert_eq!(large.derivation_params.as_ref().unwrap().algorithm, "lanczos3");

    let records = h.store.derived_for(&parent);
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.status == DerivedStatus::Processed));

    let metadata = h.store.metadata_of(&small.content_id).unwrap();
    assert_eq!(metadata.file_name.as_deref(), Some("cat_small.png"));
    assert_eq!(metadata.extra["source_width"], 400);

    assert_eq!(
        h.events.stages(),
        vec![
            ProcessingStage::Validation,
            ProcessingStage::Processing,
            ProcessingStage::Upload,
            ProcessingStage::Completed,
        ]
    );
    assert_eq!(completion.lifecycle.len(), 4);
    assert_eq!(h.events.completions(), vec![completion]);
}

#[tokio::test]
async fn test_status_sequence_per_record() {
    let h = harness();
    let parent = uploaded_png(&h);
    h.pipeline
        .process(&JobEnvelope::for_content(&parent, Some("small")))
        .await
        .unwrap();

    let record = &h.store.derived_for(&parent)[0];
    let writes: Vec<DerivedStatus> = h
        .store
        .status_updates()
        .into_iter()
        .filter(|(id, _)| id == &record.content_id)
        .map(|(_, status)| status)
        .collect();
    assert_eq!(writes, vec![DerivedStatus::Processing, DerivedStatus::Processed]);
}

#[tokio::test]
async fn test_size_hint_selects_subset() {
    let h = harness();
    let parent = uploaded_png(&h);

    let completion = h
        .pipeline
        .process(&JobEnvelope::for_content(&parent, Some("small,large")))
        .await
        .unwrap();

    let mut variants: Vec<String> = h
        .store
        .derived_for(&parent)
        .into_iter()
        .map(|r| r.variant)
        .collect();
    variants.sort();
    assert_eq!(variants, vec!["thumbnail_1024", "thumbnail_150"]);
    assert_eq!(completion.results.len(), 2);
    assert!(completion.results.iter().all(|r| r.size != "medium"));
}

#[tokio::test]
async fn test_unknown_size_names_fall_back_to_defaults() {
    let h = harness();
    let parent = uploaded_png(&h);

    h.pipeline
        .process(&JobEnvelope::for_content(&parent, Some("gigantic")))
        .await
        .unwrap();

    assert_eq!(h.store.derived_for(&parent).len(), 3);
}

#[tokio::test]
async fn test_parent_not_ready_is_validation_without_records() {
    let h = harness();
    let parent = h
        .store
        .insert_parent(ParentStatus::Created, "image/png", "cat.png", png_bytes(10, 10));

    let failure = h
        .pipeline
        .process(&JobEnvelope::for_content(&parent, None))
        .await
        .unwrap_err();

    assert_eq!(failure.class, FailureClass::Validation);
    assert_eq!(h.store.derived_count(), 0);
    assert_eq!(h.events.stages(), vec![ProcessingStage::Validation, ProcessingStage::Failed]);

    let completions = h.events.completions();
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].failure_type, Some(FailureClass::Validation));
    assert_eq!(completions[0].parent_status, Some(ParentStatus::Created));
    assert_eq!(completions[0].error.as_deref(), Some(failure.message.as_str()));
}

#[tokio::test]
async fn test_malformed_envelopes_fail_validation() {
    let h = harness();

    let mut missing = JobEnvelope::for_content(&ContentId::new(), None);
    missing.file.id.clear();
    missing.file.attributes.clear();

    let unknown_hint = JobEnvelope::for_content(&ContentId::new(), None).with_hint("colour", "sepia");

    for envelope in [missing, unknown_hint] {
        let failure = h.pipeline.process(&envelope).await.unwrap_err();
        assert_eq!(failure.class, FailureClass::Validation);
    }
    assert_eq!(h.store.derived_count(), 0);
    assert_eq!(terminal_count(&h.events), 2);
}

#[tokio::test]
async fn test_missing_parent_is_permanent() {
    let h = harness();
    let failure = h
        .pipeline
        .process(&JobEnvelope::for_content(&ContentId::new(), None))
        .await
        .unwrap_err();
    assert_eq!(failure.class, FailureClass::Permanent);
}

#[tokio::test]
async fn test_one_upload_failure_is_local() {
    let h = harness();
    let parent = uploaded_png(&h);
    h.store.fail_uploads_for_variant("thumbnail_512");

    let completion = h
        .pipeline
        .process(&JobEnvelope::for_content(&parent, None))
        .await
        .unwrap();

    assert_eq!(completion.total_processed, 2);
    assert_eq!(completion.total_failed, 1);
    assert!(completion.is_partial());

    let failed = completion.results.iter().find(|r| r.size == "medium").unwrap();
    assert_eq!(failed.status, ResultStatus::Failed);
    assert!(failed.error.as_deref().unwrap().contains("medium"));

    for record in h.store.derived_for(&parent) {
        let expected = if record.variant == "thumbnail_512" {
            DerivedStatus::Failed
        } else {
            DerivedStatus::Processed
        };
        assert_eq!(record.status, expected, "{}", record.variant);
    }
    assert_eq!(*h.events.stages().last().unwrap(), ProcessingStage::Completed);
}

#[tokio::test]
async fn test_unsupported_type_falls_back_with_warning() {
    let h = harness();
    let parent = h
        .store
        .insert_parent(ParentStatus::Uploaded, "application/zip", "bundle.zip", png_bytes(64, 64));

    let completion = h
        .pipeline
        .process(&JobEnvelope::for_content(&parent, Some("small")))
        .await
        .unwrap();

    assert_eq!(completion.total_processed, 1);
    let warnings = h.events.warnings();
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].contains("application/zip"));
    assert!(completion.lifecycle.iter().any(|e| e.warning.is_some()));
}

#[tokio::test]
async fn test_render_failure_leaves_records_processing() {
    let h = harness();
    let parent = h
        .store
        .insert_parent(ParentStatus::Uploaded, "image/png", "broken.png", b"not an image".to_vec());

    let failure = h
        .pipeline
        .process(&JobEnvelope::for_content(&parent, None))
        .await
        .unwrap_err();

    assert_eq!(failure.class, FailureClass::Permanent);
    let records = h.store.derived_for(&parent);
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.status == DerivedStatus::Processing));
    assert_eq!(terminal_count(&h.events), 1);
}

#[tokio::test]
async fn test_fetch_failure_leaves_records_created() {
    let h = harness();
    let parent = uploaded_png(&h);
    h.store.fail_downloads(true);

    let failure = h
        .pipeline
        .process(&JobEnvelope::for_content(&parent, None))
        .await
        .unwrap_err();

    assert_eq!(failure.class, FailureClass::Retryable);
    assert!(h
        .store
        .derived_for(&parent)
        .iter()
        .all(|r| r.status == DerivedStatus::Created));
}

#[tokio::test]
async fn test_deadline_is_retryable_and_releases_lease() {
    let h = harness_with(PipelineSettings {
        job_timeout: Duration::from_millis(200),
        ..PipelineSettings::default()
    });
    let lease = Arc::new(MemoryLease::new());
    let pipeline = Pipeline::new(
        h.store.clone(),
        SourceFetcher::new(h.store.clone(), h._work.path()),
        RendererRegistry::with_defaults(Duration::from_secs(10)),
        h.events.clone(),
        h.pipeline.settings().clone(),
    )
    .with_lease(lease.clone());

    let parent = uploaded_png(&h);
    h.store.set_download_delay(Duration::from_secs(5));

    let failure = pipeline
        .process(&JobEnvelope::for_content(&parent, None))
        .await
        .unwrap_err();

    assert_eq!(failure.class, FailureClass::Retryable);
    assert!(failure.message.contains("deadline"));
    assert!(lease.holder_of(&parent).is_none());
    assert!(h
        .store
        .derived_for(&parent)
        .iter()
        .all(|r| r.status == DerivedStatus::Created));
    assert_eq!(*h.events.stages().last().unwrap(), ProcessingStage::Failed);
    assert_eq!(terminal_count(&h.events), 1);
}

#[tokio::test]
async fn test_held_lease_fails_retryable_without_records() {
    let h = harness();
    let lease = Arc::new(MemoryLease::new());
    let parent = uploaded_png(&h);
    lease
        .try_acquire(&parent, "other-job", Duration::from_secs(60))
        .await
        .unwrap();

    let pipeline = Pipeline::new(
        h.store.clone(),
        SourceFetcher::new(h.store.clone(), h._work.path()),
        RendererRegistry::with_defaults(Duration::from_secs(10)),
        h.events.clone(),
        PipelineSettings::default(),
    )
    .with_lease(lease.clone());

    let failure = pipeline
        .process(&JobEnvelope::for_content(&parent, None))
        .await
        .unwrap_err();

    assert_eq!(failure.class, FailureClass::Retryable);
    assert_eq!(h.store.derived_count(), 0);
    assert_eq!(lease.holder_of(&parent).as_deref(), Some("other-job"));
}

#[tokio::test]
async fn test_lease_released_after_success() {
    let h = harness();
    let lease = Arc::new(MemoryLease::new());
    let pipeline = Pipeline::new(
        h.store.clone(),
        SourceFetcher::new(h.store.clone(), h._work.path()),
        RendererRegistry::with_defaults(Duration::from_secs(10)),
        h.events.clone(),
        PipelineSettings::default(),
    )
    .with_lease(lease.clone());
    let parent = uploaded_png(&h);

    pipeline
        .process(&JobEnvelope::for_content(&parent, Some("small")))
        .await
        .unwrap();
    assert!(lease.holder_of(&parent).is_none());
}

#[tokio::test]
async fn test_filename_override_names_outputs() {
    let h = harness();
    let parent = uploaded_png(&h);

    let envelope = JobEnvelope::for_content(&parent, Some("small")).with_hint(HINT_FILENAME, "poster.png");
    let completion = h.pipeline.process(&envelope).await.unwrap();

    let metadata = h.store.metadata_of(&completion.results[0].content_id).unwrap();
    assert_eq!(metadata.file_name.as_deref(), Some("poster_small.png"));
}

#[test]
fn test_resolve_file_name_priority() {
    let parent = ContentId::new();
    let mut envelope = JobEnvelope::for_content(&parent, None);
    envelope.file.id = "uploads/2024/raw.heic".into();
    envelope
        .file
        .attributes
        .insert("filename".into(), serde_json::json!("attr.jpg"));
    let envelope = envelope.with_hint(HINT_FILENAME, "override.jpg");

    let metadata = ContentMetadata {
        file_name: Some("meta.jpg".into()),
        ..ContentMetadata::default()
    };

    let mut job = ThumbnailJob::from_envelope(&envelope).unwrap();
    assert_eq!(resolve_file_name(&job, &metadata), "override.jpg");

    job.filename_override = None;
    assert_eq!(resolve_file_name(&job, &metadata), "attr.jpg");

    job.attribute_filename = None;
    assert_eq!(resolve_file_name(&job, &metadata), "meta.jpg");

    assert_eq!(resolve_file_name(&job, &ContentMetadata::default()), "raw.heic");

    job.source_path.clear();
    assert_eq!(resolve_file_name(&job, &ContentMetadata::default()), "source");
}
