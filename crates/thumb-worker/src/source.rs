//! Source fetching into per-job scratch directories.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;
use tracing::debug;

use thumb_content::ContentStore;
use thumb_models::ContentId;

use crate::error::WorkerResult;

/// Scratch space for one job; removed when dropped.
#[derive(Debug)]
pub struct Scratch {
    dir: TempDir,
}

impl Scratch {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Base path renderers append `_<size>.<ext>` to.
    pub fn output_base(&self, file_name: &str) -> PathBuf {
        self.dir.path().join(file_stem(file_name))
    }
}

/// A downloaded parent held in scratch space.
#[derive(Debug)]
pub struct FetchedSource {
    pub scratch: Scratch,
    pub path: PathBuf,
    pub bytes: u64,
}

/// Materializes parent bytes into local scratch files.
#[derive(Clone)]
pub struct SourceFetcher {
    store: Arc<dyn ContentStore>,
    work_dir: PathBuf,
}

impl SourceFetcher {
    pub fn new(store: Arc<dyn ContentStore>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            work_dir: work_dir.into(),
        }
    }

    /// Create a fresh scratch directory under the work dir.
    pub async fn scratch(&self) -> WorkerResult<Scratch> {
        tokio::fs::create_dir_all(&self.work_dir).await?;
        let dir = tempfile::Builder::new()
            .prefix("job-")
            .tempdir_in(&self.work_dir)?;
        Ok(Scratch { dir })
    }

    /// Download `parent` into a new scratch dir. `extension` keeps the source's suffix.
    pub async fn fetch(&self, parent: &ContentId, extension: Option<&str>) -> WorkerResult<FetchedSource> {
        let scratch = self.scratch().await?;
        let name = match extension.filter(|e| !e.is_empty()) {
            Some(ext) => format!("source.{}", ext),
            None => "source".to_string(),
        };
        let path = scratch.path().join(name);

        let bytes = self.store.download_to(parent, &path).await?;
        debug!(parent_id = %parent, bytes, path = %path.display(), "Fetched source");

        Ok(FetchedSource { scratch, path, bytes })
    }
}

/// Final path component of `name`, without its extension.
pub fn file_stem(name: &str) -> String {
    Path::new(name)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .filter(|s| !s.is_empty() && s != "." && s != "..")
        .unwrap_or_else(|| "source".to_string())
}

/// Lowercased extension of `name`, if any.
pub fn file_extension(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .filter(|e| !e.is_empty() && e.chars().all(|c| c.is_ascii_alphanumeric()))
}
