//! Job pipeline: one inbound job through validation, placeholders, fetch,
//! render, upload and completion.
//!
//! Exactly one terminal lifecycle event (`completed` or `failed`) is
//! emitted per attempt, and the returned result always agrees with it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{warn, Instrument};

use thumb_content::ContentStore;
use thumb_media::{RenderOutput, RendererRegistry};
use thumb_models::{
    CompletionEvent, ContentId, ContentMetadata, DerivationParams, DerivedStatus, FailureClass,
    JobEnvelope, JobId, LifecycleEvent, ParentAsset, ParentStatus, ProcessingStage, ResultStatus,
    SizeCatalog, ThumbnailJob, ThumbnailResult,
};
use thumb_queue::{EventPublisher, NoopLease, ParentLease};

use crate::config::WorkerConfig;
use crate::error::{PipelineFailure, WorkerError, WorkerResult};
use crate::logging::JobLogger;
use crate::metrics;
use crate::records::{DerivedRecordManager, Placeholder};
use crate::source::{file_extension, FetchedSource, SourceFetcher};

/// Fallback when no filename source yields a name.
const DEFAULT_FILE_NAME: &str = "source";

/// Tunables for the pipeline.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub sizes: SizeCatalog,
    pub job_timeout: Duration,
    pub lease_ttl: Duration,
    pub unknown_failure_class: FailureClass,
}

impl From<&WorkerConfig> for PipelineSettings {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            sizes: config.sizes.clone(),
            job_timeout: config.job_timeout,
            lease_ttl: config.parent_lease_ttl,
            unknown_failure_class: config.unknown_failure_class,
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from(&WorkerConfig::default())
    }
}

/// Per-attempt state shared between stages.
struct JobRun {
    job_id: JobId,
    source_path: String,
    started_at: DateTime<Utc>,
    timer: Instant,
    parent_id: Option<ContentId>,
    parent_status: Option<ParentStatus>,
    sizes: Vec<String>,
    lifecycle: Vec<LifecycleEvent>,
    leased: Option<ContentId>,
    logger: JobLogger,
}

impl JobRun {
    fn new(envelope: &JobEnvelope) -> Self {
        Self {
            job_id: envelope.job_id.clone(),
            source_path: envelope.file.id.clone(),
            started_at: Utc::now(),
            timer: Instant::now(),
            parent_id: None,
            parent_status: None,
            sizes: Vec::new(),
            lifecycle: Vec::new(),
            leased: None,
            logger: JobLogger::new(&envelope.job_id, &envelope.file.id),
        }
    }

    fn event(&self, stage: ProcessingStage) -> LifecycleEvent {
        LifecycleEvent::new(self.job_id.clone(), stage, self.started_at)
            .with_parent(self.parent_id.clone(), self.parent_status)
            .with_sizes(self.sizes.clone())
    }

    fn completion(&self, results: Vec<ThumbnailResult>) -> CompletionEvent {
        let mut event = CompletionEvent::new(self.job_id.clone(), self.source_path.clone(), results);
        event.parent_content_id = self.parent_id.clone();
        event.parent_status = self.parent_status;
        event.processing_time_ms = self.timer.elapsed().as_millis() as u64;
        event.lifecycle = self.lifecycle.clone();
        event
    }
}

/// Drives jobs through the stage sequence.
pub struct Pipeline {
    store: Arc<dyn ContentStore>,
    records: DerivedRecordManager,
    fetcher: SourceFetcher,
    renderers: RendererRegistry,
    events: Arc<dyn EventPublisher>,
    lease: Arc<dyn ParentLease>,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn ContentStore>,
        fetcher: SourceFetcher,
        renderers: RendererRegistry,
        events: Arc<dyn EventPublisher>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            records: DerivedRecordManager::new(store.clone()),
            store,
            fetcher,
            renderers,
            events,
            lease: Arc::new(NoopLease),
            settings,
        }
    }

    pub fn with_lease(mut self, lease: Arc<dyn ParentLease>) -> Self {
        self.lease = lease;
        self
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Process one job attempt.
    ///
    /// `Ok` once the pipeline reaches its terminal stage, even if some sizes
    /// failed; `Err` with a classified failure when it aborts early.
    pub async fn process(&self, envelope: &JobEnvelope) -> Result<CompletionEvent, PipelineFailure> {
        let mut run = JobRun::new(envelope);
        let span = run.logger.span();

        async {
            run.logger.info("Thumbnail job started");
            self.emit_stage(&mut run, ProcessingStage::Validation).await;

            let deadline = self.settings.job_timeout;
            let outcome = match tokio::time::timeout(deadline, self.run_stages(envelope, &mut run)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(WorkerError::DeadlineExceeded(deadline)),
            };

            self.release_lease(&mut run).await;

            match outcome {
                Ok(results) => Ok(self.complete(&mut run, results).await),
                Err(e) => Err(self.fail(&mut run, e).await),
            }
        }
        .instrument(span)
        .await
    }

    async fn run_stages(&self, envelope: &JobEnvelope, run: &mut JobRun) -> WorkerResult<Vec<ThumbnailResult>> {
        // 1. Identify source
        let job = ThumbnailJob::from_envelope(envelope)?;
        let specs = self.settings.sizes.resolve(job.sizes_hint.as_deref());
        run.parent_id = Some(job.source.clone());
        run.logger.set_parent(&job.source);
        run.sizes = specs.iter().map(|s| s.name.clone()).collect();

        // 2. Validate parent
        let parent = self.store.get_content(&job.source).await?;
        run.parent_status = Some(parent.status);
        if !parent.status.is_available() {
            return Err(WorkerError::ParentNotReady {
                id: parent.id,
                status: parent.status,
            });
        }
        let metadata = self.store.get_metadata(&parent.id).await?;

        self.acquire_lease(&parent, run).await?;

        // 3. Placeholders
        let mut placeholders = self.records.create_placeholders(&parent.id, &specs).await?;
        run.logger.info(&format!("created {} placeholders", placeholders.len()));
        self.emit_stage(run, ProcessingStage::Processing).await;

        // 4. Fetch, then mark every placeholder processing
        let extension = metadata.file_name.as_deref().and_then(file_extension);
        let source = self.fetcher.fetch(&parent.id, extension.as_deref()).await?;
        self.records.mark_processing(&mut placeholders).await?;

        // 5. Filename
        let file_name = resolve_file_name(&job, &metadata);

        // 6. Render
        let outputs = self.render(run, &metadata, &source, &file_name, &placeholders).await?;

        // 7. Upload
        self.emit_stage(run, ProcessingStage::Upload).await;
        let mut results = Vec::with_capacity(placeholders.len());
        for placeholder in &mut placeholders {
            let output = outputs.iter().find(|o| o.spec.name == placeholder.spec.name);
            let result = self.upload_one(run, placeholder, output).await;
            metrics::record_rendition(result.status);
            results.push(result);
        }

        Ok(results)
    }

    async fn acquire_lease(&self, parent: &ParentAsset, run: &mut JobRun) -> WorkerResult<()> {
        let acquired = self
            .lease
            .try_acquire(&parent.id, run.job_id.as_str(), self.settings.lease_ttl)
            .await?;
        if !acquired {
            return Err(WorkerError::LeaseHeld(parent.id.clone()));
        }
        run.leased = Some(parent.id.clone());
        Ok(())
    }

    async fn release_lease(&self, run: &mut JobRun) {
        if let Some(parent) = run.leased.take() {
            if let Err(e) = self.lease.release(&parent, run.job_id.as_str()).await {
                run.logger.warn(&format!("failed to release lease on {}: {}", parent, e));
            }
        }
    }

    async fn render(
        &self,
        run: &mut JobRun,
        metadata: &ContentMetadata,
        source: &FetchedSource,
        file_name: &str,
        placeholders: &[Placeholder],
    ) -> WorkerResult<Vec<RenderOutput>> {
        let mime_type = metadata.mime_type.clone().unwrap_or_default();
        let selection = self.renderers.select(&mime_type);

        if selection.fell_back {
            let warning = format!(
                "unsupported media type '{}', falling back to {} renderer",
                mime_type,
                selection.renderer.name()
            );
            run.logger.warn(&warning);
            let event = run.event(ProcessingStage::Processing).with_warning(warning);
            self.emit(run, event).await;
        }

        let specs: Vec<_> = placeholders.iter().map(|p| p.spec.clone()).collect();
        let output_base = source.scratch.output_base(file_name);
        let outputs = selection
            .renderer
            .generate(&source.path, &output_base, &specs)
            .await?;

        run.logger.info(&format!(
            "{} rendered {} outputs",
            selection.renderer.name(),
            outputs.len()
        ));
        Ok(outputs)
    }

    /// Upload one size; failures stay local to that size.
    async fn upload_one(
        &self,
        run: &JobRun,
        placeholder: &mut Placeholder,
        output: Option<&RenderOutput>,
    ) -> ThumbnailResult {
        let mut result = ThumbnailResult {
            size: placeholder.spec.name.clone(),
            content_id: placeholder.record.content_id.clone(),
            object_id: None,
            width: 0,
            height: 0,
            status: ResultStatus::Failed,
            error: None,
            derivation_params: None,
        };

        let output = match output {
            Some(output) => output,
            None => {
                let message = format!("renderer produced no output for size {}", placeholder.spec.name);
                self.mark_failed(run, placeholder, &message).await;
                result.error = Some(message);
                return result;
            }
        };
        result.width = output.width;
        result.height = output.height;

        let upload = self
            .store
            .upload_object(&placeholder.record.content_id, &output.path, output.mime_type)
            .await;
        let info = match upload {
            Ok(info) => info,
            Err(e) => {
                let message = WorkerError::upload_failed(format!("{}: {}", placeholder.spec.name, e)).to_string();
                self.mark_failed(run, placeholder, &message).await;
                result.error = Some(message);
                return result;
            }
        };
        result.object_id = Some(info.object_id.clone());

        let params = DerivationParams {
            source_width: output.source_width,
            source_height: output.source_height,
            target_width: output.width,
            target_height: output.height,
            algorithm: output.algorithm.to_string(),
            quality: output.quality,
            processing_time_ms: run.timer.elapsed().as_millis() as u64,
            generated_at: Utc::now(),
        };
        let file_name = output
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| placeholder.spec.name.clone());
        if let Err(e) = self
            .records
            .record_derivation(&placeholder.record, &file_name, output.mime_type, info.size_bytes, &params)
            .await
        {
            run.logger.warn(&format!(
                "failed to record derivation metadata for {}: {}",
                placeholder.record.content_id, e
            ));
        }

        match self
            .records
            .transition(&mut placeholder.record, DerivedStatus::Processed)
            .await
        {
            Ok(()) => {
                result.status = ResultStatus::Processed;
                result.derivation_params = Some(params);
            }
            Err(e) => {
                // Object is uploaded; reconciliation promotes the record later.
                let message = format!("{}: status update failed: {}", placeholder.spec.name, e);
                run.logger.warn(&message);
                result.error = Some(message);
            }
        }
        result
    }

    async fn mark_failed(&self, run: &JobRun, placeholder: &mut Placeholder, message: &str) {
        run.logger.warn(message);
        if let Err(e) = self
            .records
            .transition(&mut placeholder.record, DerivedStatus::Failed)
            .await
        {
            run.logger.warn(&format!(
                "failed to mark {} failed: {}",
                placeholder.record.content_id, e
            ));
        }
    }

    async fn complete(&self, run: &mut JobRun, results: Vec<ThumbnailResult>) -> CompletionEvent {
        self.emit_stage(run, ProcessingStage::Completed).await;

        let completion = run.completion(results);
        if let Err(e) = self.events.publish_completion(&completion).await {
            run.logger.warn(&format!("failed to publish completion: {}", e));
        }

        metrics::record_job(None, run.timer.elapsed().as_secs_f64());
        run.logger.finished(
            completion.total_processed,
            completion.total_failed,
            completion.processing_time_ms,
        );
        completion
    }

    async fn fail(&self, run: &mut JobRun, err: WorkerError) -> PipelineFailure {
        let failure = PipelineFailure::from_error(&err, self.settings.unknown_failure_class);
        run.logger.aborted(failure.class, &failure.message);

        let event = run
            .event(ProcessingStage::Failed)
            .with_failure(failure.class, failure.message.clone());
        self.emit(run, event).await;

        let mut completion = run.completion(Vec::new());
        completion.error = Some(failure.message.clone());
        completion.failure_type = Some(failure.class);
        if let Err(e) = self.events.publish_completion(&completion).await {
            run.logger.warn(&format!("failed to publish completion: {}", e));
        }

        metrics::record_job(Some(failure.class), run.timer.elapsed().as_secs_f64());
        failure
    }

    async fn emit_stage(&self, run: &mut JobRun, stage: ProcessingStage) {
        let event = run.event(stage);
        self.emit(run, event).await;
    }

    async fn emit(&self, run: &mut JobRun, event: LifecycleEvent) {
        run.logger.enter_stage(event.stage);
        if let Err(e) = self.events.publish_lifecycle(&event).await {
            warn!(job_id = %run.job_id, stage = %event.stage, "Failed to publish lifecycle event: {}", e);
        }
        run.lifecycle.push(event);
    }
}

/// Override hint, then `filename` attribute, then parent metadata, then
/// the basename of the source reference, then a fixed default.
pub fn resolve_file_name(job: &ThumbnailJob, metadata: &ContentMetadata) -> String {
    let source_basename = std::path::Path::new(&job.source_path)
        .file_name()
        .map(|n| n.to_string_lossy().to_string());

    [
        job.filename_override.clone(),
        job.attribute_filename.clone(),
        metadata.file_name.clone(),
        source_basename,
    ]
    .into_iter()
    .flatten()
    .map(|name| name.trim().to_string())
    .find(|name| !name.is_empty() && name != "." && name != "..")
    .unwrap_or_else(|| DEFAULT_FILE_NAME.to_string())
}

#[cfg(test)]
#[path = "pipeline_tests.rs"]
mod tests;
