//! Reconciliation scanner for thumbnail renditions.
//!
//! Dry-run by default; pass `--execute` to publish jobs or write statuses.

use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{error, info};

use thumb_content::{ContentClient, ContentFilter, ContentStore};
use thumb_models::{ParentStatus, SizeCatalog};
use thumb_queue::{JobQueue, QueueConfig};
use thumb_worker::{
    init_tracing, DerivedSource, GapFill, ParentSource, ScanOptions, Scanner, StatusRepair, WorkerConfig,
    WorkerError, WorkerResult,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Republish jobs for parents missing renditions
    GapFill,
    /// Settle derived records stuck in created/processing
    StatusRepair,
}

#[derive(Debug, Parser)]
#[command(name = "thumb-backfill", about = "Find and repair missing or stuck thumbnails")]
struct Args {
    #[arg(long, value_enum, default_value = "gap-fill", env = "BACKFILL_MODE")]
    mode: Mode,

    /// Items to query per batch
    #[arg(long, default_value_t = 100, env = "BACKFILL_BATCH")]
    batch: usize,

    /// Maximum items to process (0 = unlimited)
    #[arg(long, default_value_t = 0, env = "BACKFILL_LIMIT")]
    limit: usize,

    /// Report intended actions without performing them
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set, env = "BACKFILL_DRY_RUN")]
    dry_run: bool,

    /// Perform the actions (disables dry-run)
    #[arg(long)]
    execute: bool,

    /// Size names to require, e.g. "small,large" (default: full catalogue)
    #[arg(long, env = "BACKFILL_SIZES")]
    sizes: Option<String>,

    #[arg(long, env = "BACKFILL_OWNER_ID")]
    owner_id: Option<String>,

    #[arg(long, env = "BACKFILL_TENANT_ID")]
    tenant_id: Option<String>,

    /// Maximum jobs published per second (0 = unlimited)
    #[arg(long, default_value_t = 100, env = "BACKFILL_PUBLISH_RATE")]
    publish_rate: u32,

    /// Age after which an in-flight record is considered abandoned
    #[arg(
        long,
        default_value_t = 3600,
        value_parser = clap::value_parser!(u32).range(1..),
        env = "BACKFILL_STALE_AFTER_SECS"
    )]
    stale_after_secs: u32,

    /// Gap-fill: promote backed records of parents that already have every rendition
    #[arg(long)]
    fix_status: bool,

    /// Gap-fill: republish parents that already have every rendition
    #[arg(long)]
    regenerate_all: bool,
}

impl Args {
    fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            batch_size: self.batch,
            limit: self.limit,
            dry_run: self.dry_run && !self.execute,
        }
    }
}

#[tokio::main]
async fn main() {
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        eprintln!("rustls crypto provider already installed");
    }
    dotenvy::dotenv().ok();
    init_tracing("thumb=info");

    let args = Args::parse();
    if let Err(e) = run(args).await {
        error!("Backfill failed: {}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> WorkerResult<()> {
    let config = WorkerConfig::from_env()?;
    let store: Arc<dyn ContentStore> = Arc::new(ContentClient::from_env()?);
    let options = args.scan_options();
    let scanner = Scanner::new(options);

    info!(
        mode = ?args.mode,
        batch = options.batch_size,
        limit = options.limit,
        dry_run = options.dry_run,
        "Starting backfill"
    );
    let progress = |processed: usize, total: usize| info!(processed, total, "Scan progress");

    match args.mode {
        Mode::GapFill => {
            let sizes = match args.sizes.as_deref() {
                Some(hint) => restrict_catalog(&config.sizes, hint)?,
                None => config.sizes.clone(),
            };
            let queue = JobQueue::new(QueueConfig::from_env())?;
            let processor = GapFill::new(store.clone(), Arc::new(queue), sizes)
                .only_missing(!args.regenerate_all)
                .fix_status(args.fix_status)
                .with_publish_rate(args.publish_rate);
            let source = ParentSource::new(
                store,
                ContentFilter {
                    status: Some(ParentStatus::Uploaded),
                    owner_id: args.owner_id.clone(),
                    tenant_id: args.tenant_id.clone(),
                    originals_only: true,
                },
            );

            let result = scanner.scan(&source, &processor, progress).await?;
            let stats = processor.stats();
            info!(
                total_found = result.total_found,
                total_processed = result.total_processed,
                total_failed = result.total_failed,
                jobs_published = stats.jobs_published,
                skipped_unsupported = stats.skipped_unsupported,
                skipped_complete = stats.skipped_complete,
                skipped_derived = stats.skipped_derived,
                status_verified = stats.status_verified,
                dry_run = options.dry_run,
                "Gap-fill finished"
            );
            report_failures(&result.failed_ids);
        }
        Mode::StatusRepair => {
            let source = DerivedSource::in_flight(store.clone(), args.owner_id.clone(), args.tenant_id.clone());
            let processor = StatusRepair::new(store, chrono::Duration::seconds(i64::from(args.stale_after_secs)));

            let result = scanner.scan(&source, &processor, progress).await?;
            let stats = processor.stats();
            info!(
                total_found = result.total_found,
                total_processed = result.total_processed,
                total_failed = result.total_failed,
                marked_failed = stats.marked_failed,
                marked_processed = stats.marked_processed,
                left_in_flight = stats.left_in_flight,
                dry_run = options.dry_run,
                "Status repair finished"
            );
            report_failures(&result.failed_ids);
        }
    }

    Ok(())
}

/// Narrow the catalogue to the named sizes; unknown names are an error here.
fn restrict_catalog(catalog: &SizeCatalog, hint: &str) -> WorkerResult<SizeCatalog> {
    let mut selected = Vec::new();
    for name in thumb_models::split_size_names(hint) {
        let spec = catalog
            .get(name)
            .ok_or_else(|| WorkerError::config_error(format!("--sizes: unknown size '{}'", name)))?;
        selected.push(spec.clone());
    }
    SizeCatalog::new(selected).map_err(|e| WorkerError::config_error(format!("--sizes: {}", e)))
}

fn report_failures(ids: &[String]) {
    if ids.is_empty() {
        return;
    }
    error!(count = ids.len(), "Items failed during scan");
    for id in ids {
        error!(item_id = %id, "Failed item");
    }
}
