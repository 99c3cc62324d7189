//! Tracing setup and per-job log context.

use tracing::{debug, error, field, info, warn, Span};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use thumb_models::{ContentId, FailureClass, JobId, ProcessingStage};

/// Install the global subscriber: JSON when `LOG_FORMAT=json`, human output otherwise.
///
/// `RUST_LOG` directives are honoured on top of `default_directive`.
pub fn init_tracing(default_directive: &str) {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let mut env_filter = EnvFilter::from_default_env();
    if let Ok(directive) = default_directive.parse() {
        env_filter = env_filter.add_directive(directive);
    }

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if use_json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .try_init()
    };
    if let Err(e) = result {
        eprintln!("tracing already initialised: {}", e);
    }
}

/// Per-job log context.
///
/// Owns the `thumbnail_job` span. The parent id is recorded on the span as
/// soon as it is known, and every line carries the stage the job is in.
#[derive(Debug, Clone)]
pub struct JobLogger {
    job_id: JobId,
    stage: ProcessingStage,
    span: Span,
}

impl JobLogger {
    pub fn new(job_id: &JobId, source: &str) -> Self {
        let span = tracing::info_span!(
            "thumbnail_job",
            job_id = %job_id,
            source = %source,
            parent_id = field::Empty
        );
        Self {
            job_id: job_id.clone(),
            stage: ProcessingStage::Validation,
            span,
        }
    }

    pub fn span(&self) -> Span {
        self.span.clone()
    }

    pub fn stage(&self) -> ProcessingStage {
        self.stage
    }

    pub fn set_parent(&self, parent: &ContentId) {
        self.span.record("parent_id", field::display(parent));
    }

    pub fn enter_stage(&mut self, stage: ProcessingStage) {
        if self.stage != stage {
            debug!(job_id = %self.job_id, from = %self.stage, to = %stage, "Stage changed");
            self.stage = stage;
        }
    }

    pub fn info(&self, message: &str) {
        info!(job_id = %self.job_id, stage = %self.stage, "{}", message);
    }

    pub fn warn(&self, message: &str) {
        warn!(job_id = %self.job_id, stage = %self.stage, "{}", message);
    }

    pub fn finished(&self, processed: usize, failed: usize, elapsed_ms: u64) {
        if failed > 0 {
            warn!(
                job_id = %self.job_id,
                processed,
                failed,
                elapsed_ms,
                "Thumbnail job finished with failed sizes"
            );
        } else {
            info!(job_id = %self.job_id, processed, elapsed_ms, "Thumbnail job finished");
        }
    }

    pub fn aborted(&self, class: FailureClass, message: &str) {
        error!(
            job_id = %self.job_id,
            stage = %self.stage,
            failure_class = %class,
            "Thumbnail job aborted: {}",
            message
        );
    }
}
