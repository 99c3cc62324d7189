//! Job executor.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use thumb_models::FailureClass;
use thumb_queue::{Delivery, JobQueue};

use crate::config::{WorkerConfig, MIN_CLAIM_INTERVAL};
use crate::error::WorkerResult;
use crate::pipeline::Pipeline;

/// Claim at most this many idle messages per sweep.
const CLAIM_BATCH: usize = 5;
/// Read at most this many messages per poll.
const CONSUME_BATCH: usize = 5;
const CONSUME_BLOCK_MS: u64 = 1000;

/// What to do with a message after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Leave pending for redelivery.
    Retry,
    /// Copy to the dead letter stream and acknowledge.
    DeadLetter,
}

/// Decide the fate of a failed message.
///
/// `attempts` is the retry counter after this attempt; it is only consulted
/// for retryable failures.
pub fn disposition(class: FailureClass, attempts: u32, max_retries: u32) -> Disposition {
    match class {
        FailureClass::Validation | FailureClass::Permanent => Disposition::DeadLetter,
        FailureClass::Retryable if attempts >= max_retries => Disposition::DeadLetter,
        FailureClass::Retryable => Disposition::Retry,
    }
}

/// Job executor that processes jobs from the queue.
pub struct JobExecutor {
    config: WorkerConfig,
    queue: Arc<JobQueue>,
    pipeline: Arc<Pipeline>,
    job_semaphore: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
    consumer_name: String,
}

impl JobExecutor {
    pub fn new(config: WorkerConfig, queue: JobQueue, pipeline: Pipeline) -> Self {
        let job_semaphore = Arc::new(Semaphore::new(config.max_concurrent_jobs));
        let (shutdown, _) = watch::channel(false);
        let consumer_name = format!("worker-{}", Uuid::new_v4());

        Self {
            config,
            queue: Arc::new(queue),
            pipeline: Arc::new(pipeline),
            job_semaphore,
            shutdown,
            consumer_name,
        }
    }

    pub fn consumer_name(&self) -> &str {
        &self.consumer_name
    }

    /// Run until [`shutdown`](Self::shutdown) is signalled.
    pub async fn run(&self) -> WorkerResult<()> {
        info!(
            "Starting job executor '{}' with {} max concurrent jobs",
            self.consumer_name, self.config.max_concurrent_jobs
        );

        self.queue.init().await?;

        let mut shutdown_rx = self.shutdown.subscribe();
        let claim_task = tokio::spawn(Self::claim_loop(
            Arc::clone(&self.queue),
            Arc::clone(&self.pipeline),
            Arc::clone(&self.job_semaphore),
            self.shutdown.subscribe(),
            self.consumer_name.clone(),
            self.config.claim_interval,
            self.config.claim_min_idle,
        ));

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping executor");
                        break;
                    }
                }
                result = self.consume_jobs() => {
                    if let Err(e) = result {
                        error!("Error consuming jobs: {}", e);
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        }

        claim_task.abort();

        info!("Waiting for in-flight jobs to complete...");
        if tokio::time::timeout(self.config.shutdown_timeout, self.wait_for_jobs())
            .await
            .is_err()
        {
            warn!(
                "In-flight jobs still running after {}s; they will be redelivered",
                self.config.shutdown_timeout.as_secs()
            );
        }

        info!("Job executor stopped");
        Ok(())
    }

    /// Periodically take over messages left pending by crashed consumers.
    async fn claim_loop(
        queue: Arc<JobQueue>,
        pipeline: Arc<Pipeline>,
        semaphore: Arc<Semaphore>,
        mut shutdown_rx: watch::Receiver<bool>,
        consumer_name: String,
        interval: Duration,
        min_idle: Duration,
    ) {
        let mut ticker = tokio::time::interval(interval.max(MIN_CLAIM_INTERVAL));
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let claimed = queue
                        .claim_pending(&consumer_name, min_idle.as_millis() as u64, CLAIM_BATCH)
                        .await;
                    match claimed {
                        Ok(deliveries) if !deliveries.is_empty() => {
                            info!("Claimed {} pending jobs", deliveries.len());
                            for delivery in deliveries {
                                let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                                    break;
                                };
                                let queue = Arc::clone(&queue);
                                let pipeline = Arc::clone(&pipeline);
                                tokio::spawn(async move {
                                    let _permit = permit;
                                    Self::execute_job(pipeline, queue, delivery).await;
                                });
                            }
                        }
                        Ok(_) => {}
                        Err(e) => warn!("Failed to claim pending jobs: {}", e),
                    }
                }
            }
        }
    }

    async fn consume_jobs(&self) -> WorkerResult<()> {
        let available = self.job_semaphore.available_permits();
        if available == 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            return Ok(());
        }

        let deliveries = self
            .queue
            .consume(&self.consumer_name, CONSUME_BLOCK_MS, available.min(CONSUME_BATCH))
            .await?;
        if deliveries.is_empty() {
            return Ok(());
        }

        debug!("Consumed {} jobs from queue", deliveries.len());

        for delivery in deliveries {
            let Ok(permit) = Arc::clone(&self.job_semaphore).acquire_owned().await else {
                warn!("Job semaphore closed; leaving {} pending", delivery.message_id);
                continue;
            };
            let queue = Arc::clone(&self.queue);
            let pipeline = Arc::clone(&self.pipeline);
            tokio::spawn(async move {
                let _permit = permit;
                Self::execute_job(pipeline, queue, delivery).await;
            });
        }

        Ok(())
    }

    /// Run one delivery through the pipeline and settle the message.
    async fn execute_job(pipeline: Arc<Pipeline>, queue: Arc<JobQueue>, delivery: Delivery) {
        let envelope = match &delivery.envelope {
            Ok(envelope) => envelope,
            Err(reason) => {
                let message = format!("undecodable job payload: {}", reason);
                error!(message_id = %delivery.message_id, "{}", message);
                if let Err(e) = queue.dead_letter(&delivery, FailureClass::Validation, &message).await {
                    error!("Failed to move message {} to DLQ: {}", delivery.message_id, e);
                }
                return;
            }
        };
        let job_id = envelope.job_id.clone();
        info!("Executing job {}", job_id);

        let failure = match pipeline.process(envelope).await {
            Ok(completion) => {
                if completion.is_partial() {
                    warn!(
                        "Job {} completed with {} failed sizes",
                        job_id, completion.total_failed
                    );
                }
                if let Err(e) = queue.ack(&delivery.message_id).await {
                    error!("Failed to ack job {}: {}", job_id, e);
                }
                return;
            }
            Err(failure) => failure,
        };

        let max_retries = queue.max_retries();
        let attempts = if failure.class.is_retryable() {
            queue.increment_retry(&delivery.message_id).await.unwrap_or_else(|e| {
                warn!("Failed to bump retry counter for job {}: {}", job_id, e);
                max_retries
            })
        } else {
            0
        };

        match disposition(failure.class, attempts, max_retries) {
            Disposition::Retry => {
                info!(
                    "Job {} will be retried (attempt {}/{}): {}",
                    job_id, attempts, max_retries, failure
                );
            }
            Disposition::DeadLetter => {
                warn!("Job {} dead-lettered: {}", job_id, failure);
                if let Err(e) = queue
                    .dead_letter(&delivery, failure.class, &failure.message)
                    .await
                {
                    error!("Failed to move job {} to DLQ: {}", job_id, e);
                }
            }
        }
    }

    async fn wait_for_jobs(&self) {
        while self.job_semaphore.available_permits() < self.config.max_concurrent_jobs {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Signal shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}
