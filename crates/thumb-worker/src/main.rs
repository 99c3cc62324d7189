//! Thumbnail worker binary.

use std::sync::Arc;

use tracing::{error, info, warn};

use thumb_content::{ContentClient, ContentStore};
use thumb_media::RendererRegistry;
use thumb_queue::{JobQueue, NoopLease, ParentLease, QueueConfig, RedisEventPublisher, RedisLease};
use thumb_worker::{init_tracing, metrics, JobExecutor, Pipeline, PipelineSettings, SourceFetcher, WorkerConfig};

#[tokio::main]
async fn main() {
    // TLS for the content-store client
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        eprintln!("rustls crypto provider already installed");
    }

    dotenvy::dotenv().ok();
    init_tracing("thumb=info");

    info!("Starting thumb-worker");

    let config = match WorkerConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Invalid worker configuration: {}", e);
            std::process::exit(1);
        }
    };
    info!("Worker config: {:?}", config);

    if let Some(port) = config.metrics_port {
        if let Err(e) = metrics::install_exporter(port) {
            warn!("Metrics disabled: {}", e);
        }
    }

    let store: Arc<dyn ContentStore> = match ContentClient::from_env() {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!("Failed to create content client: {}", e);
            std::process::exit(1);
        }
    };

    let queue_config = QueueConfig::from_env();
    let queue = match JobQueue::new(queue_config.clone()) {
        Ok(q) => q,
        Err(e) => {
            error!("Failed to create job queue: {}", e);
            std::process::exit(1);
        }
    };
    let events = match RedisEventPublisher::new(queue_config.clone()) {
        Ok(p) => Arc::new(p),
        Err(e) => {
            error!("Failed to create event publisher: {}", e);
            std::process::exit(1);
        }
    };
    let lease: Arc<dyn ParentLease> = if config.parent_lease {
        match RedisLease::new(queue_config) {
            Ok(l) => Arc::new(l),
            Err(e) => {
                error!("Failed to create parent lease: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        Arc::new(NoopLease)
    };

    let pipeline = Pipeline::new(
        store.clone(),
        SourceFetcher::new(store, config.work_dir.clone()),
        RendererRegistry::with_defaults(config.render_timeout),
        events,
        PipelineSettings::from(&config),
    )
    .with_lease(lease);

    let executor = Arc::new(JobExecutor::new(config, queue, pipeline));

    let signal_executor = Arc::clone(&executor);
    let shutdown_handle = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
            signal_executor.shutdown();
        }
    });

    if let Err(e) = executor.run().await {
        error!("Executor error: {}", e);
        std::process::exit(1);
    }

    shutdown_handle.abort();
    info!("Worker shutdown complete");
}
