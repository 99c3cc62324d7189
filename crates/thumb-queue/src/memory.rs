//! In-process publishers that record what they were given.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use thumb_models::{CompletionEvent, JobEnvelope, LifecycleEvent, ProcessingStage};

use crate::error::{QueueError, QueueResult};
use crate::events::EventPublisher;
use crate::queue::JobPublisher;

#[derive(Debug, Default)]
pub struct RecordingEventPublisher {
    lifecycle: Mutex<Vec<LifecycleEvent>>,
    completions: Mutex<Vec<CompletionEvent>>,
}

impl RecordingEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lifecycle(&self) -> Vec<LifecycleEvent> {
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn completions(&self) -> Vec<CompletionEvent> {
        self.completions.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn stages(&self) -> Vec<ProcessingStage> {
        self.lifecycle().iter().map(|e| e.stage).collect()
    }

    /// Lifecycle events that carry a warning.
    pub fn warnings(&self) -> Vec<String> {
        self.lifecycle()
            .into_iter()
            .filter_map(|e| e.warning)
            .collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish_lifecycle(&self, event: &LifecycleEvent) -> QueueResult<()> {
        self.lifecycle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
        Ok(())
    }

    async fn publish_completion(&self, event: &CompletionEvent) -> QueueResult<()> {
        self.completions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct RecordingJobPublisher {
    published: Mutex<Vec<JobEnvelope>>,
    fail: AtomicBool,
}

impl RecordingJobPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<JobEnvelope> {
        self.published.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Make subsequent publishes fail.
    pub fn fail_publishes(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl JobPublisher for RecordingJobPublisher {
    async fn publish_job(&self, envelope: &JobEnvelope) -> QueueResult<String> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(QueueError::publish_failed("publisher unavailable"));
        }
        let mut published = self.published.lock().unwrap_or_else(|e| e.into_inner());
        published.push(envelope.clone());
        Ok(format!("{}-0", published.len()))
    }
}
