//! Reconciliation scanner.
//!
//! [`Scanner`] pages through a [`ScanSource`] and hands each item to a
//! [`ScanProcessor`]. Two processors exist and stay separate:
//!
//! - [`GapFill`] walks parent assets and republishes jobs for parents that
//!   lack some requested renditions.
//! - [`StatusRepair`] walks in-flight derived records and settles the ones
//!   that are stale or already backed by an uploaded object.
//!
//! Both honour dry-run: they report what they would do and write nothing.

use std::collections::HashSet;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use tracing::{debug, info, warn};

use thumb_content::{ContentFilter, ContentStore, DerivedFilter, Page, PageRequest};
use thumb_media::is_supported_mime;
use thumb_models::{
    DerivedRecord, DerivedStatus, JobEnvelope, ParentAsset, SizeCatalog, THUMBNAIL_DERIVATION,
    VARIANT_PREFIX,
};
use thumb_queue::JobPublisher;

use crate::error::WorkerResult;
use crate::records::DerivedRecordManager;

/// Publish limiter for gap-fill.
pub type PublishRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Batch and limit bounds for one scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanOptions {
    pub batch_size: usize,
    /// 0 means unlimited
    pub limit: usize,
    pub dry_run: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            batch_size: 100,
            limit: 0,
            dry_run: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanResult {
    pub total_found: usize,
    pub total_processed: usize,
    pub total_failed: usize,
    pub failed_ids: Vec<String>,
}

/// What a processor did with one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    Unchanged,
    /// Acted on the item (or would have, in dry-run).
    Changed,
}

/// Paged listing the scanner walks.
#[async_trait]
pub trait ScanSource: Send + Sync {
    type Item: Send + Sync;

    async fn fetch_page(&self, page: PageRequest) -> WorkerResult<Page<Self::Item>>;

    fn item_id(&self, item: &Self::Item) -> String;

    /// Whether a changed item drops out of this listing.
    ///
    /// When it does, the scanner does not advance its offset past changed
    /// items, so the following page is not skipped.
    fn shrinks_on_change(&self) -> bool {
        false
    }
}

/// Per-item action plugged into the scanner.
#[async_trait]
pub trait ScanProcessor<T: Send + Sync>: Send + Sync {
    async fn process(&self, item: &T, dry_run: bool) -> WorkerResult<ItemOutcome>;
}

/// Drives a source through a processor in bounded batches.
#[derive(Debug, Clone, Default)]
pub struct Scanner {
    options: ScanOptions,
}

impl Scanner {
    pub fn new(options: ScanOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &ScanOptions {
        &self.options
    }

    /// Run the scan. `progress` gets `(processed, total)` after each batch.
    ///
    /// Item failures are counted and collected; only a failing page fetch
    /// aborts the scan.
    pub async fn scan<S, P, F>(&self, source: &S, processor: &P, mut progress: F) -> WorkerResult<ScanResult>
    where
        S: ScanSource,
        P: ScanProcessor<S::Item>,
        F: FnMut(usize, usize) + Send,
    {
        let batch_size = self.options.batch_size.max(1);
        let limit = self.options.limit;
        let shrinks = source.shrinks_on_change() && !self.options.dry_run;

        let mut result = ScanResult::default();
        let mut offset = 0;
        let mut seen = 0;
        let mut first_page = true;

        loop {
            let want = if limit > 0 {
                batch_size.min(limit.saturating_sub(seen))
            } else {
                batch_size
            };
            if want == 0 {
                break;
            }

            let page = source.fetch_page(PageRequest::new(offset, want)).await?;
            if first_page {
                result.total_found = page.total;
                first_page = false;
            }
            let fetched = page.items.len();
            if fetched == 0 {
                break;
            }

            let mut retained = 0;
            for item in &page.items {
                seen += 1;
                match processor.process(item, self.options.dry_run).await {
                    Ok(ItemOutcome::Unchanged) => {
                        result.total_processed += 1;
                        retained += 1;
                    }
                    Ok(ItemOutcome::Changed) => {
                        result.total_processed += 1;
                        if !shrinks {
                            retained += 1;
                        }
                    }
                    Err(e) => {
                        let id = source.item_id(item);
                        warn!(item_id = %id, "Scan item failed: {}", e);
                        result.total_failed += 1;
                        result.failed_ids.push(id);
                        retained += 1;
                    }
                }
            }

            let total = if limit > 0 {
                result.total_found.min(limit)
            } else {
                result.total_found
            };
            progress(seen, total);

            offset += retained;
            if fetched < want {
                break;
            }
        }

        info!(
            found = result.total_found,
            processed = result.total_processed,
            failed = result.total_failed,
            dry_run = self.options.dry_run,
            "Scan finished"
        );
        Ok(result)
    }
}

/// Parent assets matching a filter.
pub struct ParentSource {
    store: Arc<dyn ContentStore>,
    filter: ContentFilter,
}

impl ParentSource {
    pub fn new(store: Arc<dyn ContentStore>, filter: ContentFilter) -> Self {
        Self { store, filter }
    }
}

#[async_trait]
impl ScanSource for ParentSource {
    type Item = ParentAsset;

    async fn fetch_page(&self, page: PageRequest) -> WorkerResult<Page<ParentAsset>> {
        Ok(self.store.list_contents(&self.filter, page).await?)
    }

    fn item_id(&self, item: &ParentAsset) -> String {
        item.id.to_string()
    }
}

/// Derived records matching a filter.
pub struct DerivedSource {
    store: Arc<dyn ContentStore>,
    filter: DerivedFilter,
}

impl DerivedSource {
    pub fn new(store: Arc<dyn ContentStore>, filter: DerivedFilter) -> Self {
        Self { store, filter }
    }

    /// Thumbnail records still `created` or `processing`.
    pub fn in_flight(store: Arc<dyn ContentStore>, owner_id: Option<String>, tenant_id: Option<String>) -> Self {
        Self::new(
            store,
            DerivedFilter {
                statuses: vec![DerivedStatus::Created, DerivedStatus::Processing],
                derivation_type: Some(THUMBNAIL_DERIVATION.to_string()),
                owner_id,
                tenant_id,
            },
        )
    }
}

#[async_trait]
impl ScanSource for DerivedSource {
    type Item = DerivedRecord;

    async fn fetch_page(&self, page: PageRequest) -> WorkerResult<Page<DerivedRecord>> {
        Ok(self.store.list_derived_records(&self.filter, page).await?)
    }

    fn item_id(&self, item: &DerivedRecord) -> String {
        item.content_id.to_string()
    }

    fn shrinks_on_change(&self) -> bool {
        // Both repairs move the record out of the in-flight statuses.
        !self.filter.statuses.is_empty() && self.filter.statuses.iter().all(|s| s.is_in_flight())
    }
}

/// Gap-fill counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GapFillStats {
    pub jobs_published: usize,
    pub skipped_unsupported: usize,
    pub skipped_complete: usize,
    pub skipped_derived: usize,
    pub status_verified: usize,
}

#[derive(Debug, Default)]
struct GapFillCounters {
    jobs_published: AtomicUsize,
    skipped_unsupported: AtomicUsize,
    skipped_complete: AtomicUsize,
    skipped_derived: AtomicUsize,
    status_verified: AtomicUsize,
}

/// Republishes jobs for parents missing requested renditions.
pub struct GapFill {
    store: Arc<dyn ContentStore>,
    records: DerivedRecordManager,
    publisher: Arc<dyn JobPublisher>,
    sizes: SizeCatalog,
    only_missing: bool,
    fix_status: bool,
    limiter: Option<PublishRateLimiter>,
    counters: GapFillCounters,
}

impl GapFill {
    pub fn new(store: Arc<dyn ContentStore>, publisher: Arc<dyn JobPublisher>, sizes: SizeCatalog) -> Self {
        Self {
            records: DerivedRecordManager::new(store.clone()),
            store,
            publisher,
            sizes,
            only_missing: true,
            fix_status: false,
            limiter: None,
            counters: GapFillCounters::default(),
        }
    }

    /// When false, every supported parent is republished with the full requested set.
    pub fn only_missing(mut self, only_missing: bool) -> Self {
        self.only_missing = only_missing;
        self
    }

    pub fn fix_status(mut self, fix_status: bool) -> Self {
        self.fix_status = fix_status;
        self
    }

    /// Cap publishes at `per_second`; 0 disables the cap.
    pub fn with_publish_rate(mut self, per_second: u32) -> Self {
        self.limiter = NonZeroU32::new(per_second).map(|rate| RateLimiter::direct(Quota::per_second(rate)));
        self
    }

    pub fn stats(&self) -> GapFillStats {
        let c = &self.counters;
        GapFillStats {
            jobs_published: c.jobs_published.load(Ordering::Relaxed),
            skipped_unsupported: c.skipped_unsupported.load(Ordering::Relaxed),
            skipped_complete: c.skipped_complete.load(Ordering::Relaxed),
            skipped_derived: c.skipped_derived.load(Ordering::Relaxed),
            status_verified: c.status_verified.load(Ordering::Relaxed),
        }
    }

    async fn publish(&self, parent: &ParentAsset, sizes: &str, dry_run: bool) -> WorkerResult<()> {
        if dry_run {
            info!(parent_id = %parent.id, sizes = %sizes, "[dry-run] Would publish thumbnail job");
        } else {
            if let Some(limiter) = &self.limiter {
                limiter.until_ready().await;
            }
            let envelope = JobEnvelope::for_content(&parent.id, Some(sizes));
            let message_id = self.publisher.publish_job(&envelope).await?;
            info!(
                parent_id = %parent.id,
                job_id = %envelope.job_id,
                message_id = %message_id,
                sizes = %sizes,
                "Published thumbnail job"
            );
        }
        self.counters.jobs_published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[async_trait]
impl ScanProcessor<ParentAsset> for GapFill {
    async fn process(&self, parent: &ParentAsset, dry_run: bool) -> WorkerResult<ItemOutcome> {
        if parent.is_derived() {
            self.counters.skipped_derived.fetch_add(1, Ordering::Relaxed);
            return Ok(ItemOutcome::Unchanged);
        }

        let metadata = self.store.get_metadata(&parent.id).await?;
        let mime_type = metadata.mime_type.unwrap_or_default();
        if !is_supported_mime(&mime_type) {
            debug!(parent_id = %parent.id, mime_type = %mime_type, "Skipping unsupported type");
            self.counters.skipped_unsupported.fetch_add(1, Ordering::Relaxed);
            return Ok(ItemOutcome::Unchanged);
        }

        let requested = self.sizes.all();
        if !self.only_missing {
            let names: Vec<&str> = requested.iter().map(|s| s.name.as_str()).collect();
            self.publish(parent, &names.join(","), dry_run).await?;
            return Ok(ItemOutcome::Changed);
        }

        let existing = self.records.list_by_parent(&parent.id, THUMBNAIL_DERIVATION).await?;
        let mut covered: HashSet<String> = existing
            .iter()
            .filter(|r| r.status == DerivedStatus::Processed && r.variant.starts_with(VARIANT_PREFIX))
            .map(|r| r.variant.clone())
            .collect();

        let mut repairs = Vec::new();
        if self.fix_status {
            for record in existing.iter().filter(|r| r.status != DerivedStatus::Processed) {
                if covered.contains(&record.variant) || !record.variant.starts_with(VARIANT_PREFIX) {
                    continue;
                }
                if self.records.verify_backing(record).await? {
                    covered.insert(record.variant.clone());
                    repairs.push(record.clone());
                }
            }
        }

        let missing: Vec<&str> = requested
            .iter()
            .filter(|s| !covered.contains(&s.variant_name()))
            .map(|s| s.name.as_str())
            .collect();
        let complete = missing.is_empty() || covered.len() >= requested.len();

        if !complete {
            self.publish(parent, &missing.join(","), dry_run).await?;
            return Ok(ItemOutcome::Changed);
        }

        self.counters.skipped_complete.fetch_add(1, Ordering::Relaxed);
        if repairs.is_empty() {
            return Ok(ItemOutcome::Unchanged);
        }

        for mut record in repairs {
            if dry_run {
                info!(
                    content_id = %record.content_id,
                    from = %record.status,
                    "[dry-run] Would mark derived record processed"
                );
            } else {
                self.records.force_status(&mut record, DerivedStatus::Processed).await?;
            }
            self.counters.status_verified.fetch_add(1, Ordering::Relaxed);
        }
        Ok(ItemOutcome::Changed)
    }
}

/// Status-repair counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepairStats {
    pub marked_failed: usize,
    pub marked_processed: usize,
    pub left_in_flight: usize,
}

/// Settles derived records stuck in `created` or `processing`.
pub struct StatusRepair {
    records: DerivedRecordManager,
    stale_after: chrono::Duration,
    marked_failed: AtomicUsize,
    marked_processed: AtomicUsize,
    left_in_flight: AtomicUsize,
}

impl StatusRepair {
    pub fn new(store: Arc<dyn ContentStore>, stale_after: chrono::Duration) -> Self {
        Self {
            records: DerivedRecordManager::new(store),
            stale_after,
            marked_failed: AtomicUsize::new(0),
            marked_processed: AtomicUsize::new(0),
            left_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn stats(&self) -> RepairStats {
        RepairStats {
            marked_failed: self.marked_failed.load(Ordering::Relaxed),
            marked_processed: self.marked_processed.load(Ordering::Relaxed),
            left_in_flight: self.left_in_flight.load(Ordering::Relaxed),
        }
    }

    async fn settle(&self, record: &DerivedRecord, next: DerivedStatus, dry_run: bool) -> WorkerResult<()> {
        if dry_run {
            info!(
                content_id = %record.content_id,
                parent_id = %record.parent_id,
                from = %record.status,
                to = %next,
                "[dry-run] Would repair derived status"
            );
            return Ok(());
        }
        let mut record = record.clone();
        self.records.force_status(&mut record, next).await
    }
}

#[async_trait]
impl ScanProcessor<DerivedRecord> for StatusRepair {
    async fn process(&self, record: &DerivedRecord, dry_run: bool) -> WorkerResult<ItemOutcome> {
        if !record.status.is_in_flight() {
            return Ok(ItemOutcome::Unchanged);
        }

        if record.is_stale(self.stale_after, Utc::now()) {
            self.settle(record, DerivedStatus::Failed, dry_run).await?;
            self.marked_failed.fetch_add(1, Ordering::Relaxed);
            return Ok(ItemOutcome::Changed);
        }

        if self.records.verify_backing(record).await? {
            self.settle(record, DerivedStatus::Processed, dry_run).await?;
            self.marked_processed.fetch_add(1, Ordering::Relaxed);
            return Ok(ItemOutcome::Changed);
        }

        self.left_in_flight.fetch_add(1, Ordering::Relaxed);
        Ok(ItemOutcome::Unchanged)
    }
}

#[cfg(test)]
#[path = "reconcile_tests.rs"]
mod tests;
