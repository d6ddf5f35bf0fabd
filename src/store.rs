use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::AsyncWriteExt;

use crate::error::{AppError, Result};

const TEMP_SUFFIX: &str = "tmp";
const FAILED_EXTENSION: &str = "failed";

/// One image waiting to be (or already) enriched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub id: u64,
    pub input: PathBuf,
    pub output: PathBuf,
}

impl WorkItem {
    fn temp_path(&self) -> PathBuf {
        let mut name = self.output.as_os_str().to_owned();
        name.push(format!(".{TEMP_SUFFIX}"));
        PathBuf::from(name)
    }

    fn failure_marker(&self) -> PathBuf {
        self.output.with_extension(FAILED_EXTENSION)
    }
}

/// How work items are discovered in the data directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discovery {
    /// Every `<id>.<input_extension>` file in the directory.
    Listing,
    /// Ids `start..=end`; ids whose input file is missing are skipped.
    Range { start: u64, end: u64 },
}

/// Filesystem-backed store of work items.
///
/// The output artifact `<id>.<output_extension>` is the only completion
/// marker. It is written atomically, so a partially written output never
/// makes an item look done.
#[derive(Debug, Clone)]
pub struct WorkItemStore {
    root: PathBuf,
    input_extension: String,
    output_extension: String,
    discovery: Discovery,
    skip_failed: bool,
}

impl WorkItemStore {
    pub fn new(root: impl Into<PathBuf>, input_extension: &str, output_extension: &str) -> Self {
        Self {
            root: root.into(),
            input_extension: input_extension.trim_start_matches('.').to_string(),
            output_extension: output_extension.trim_start_matches('.').to_string(),
            discovery: Discovery::Listing,
            skip_failed: false,
        }
    }

    pub fn with_discovery(mut self, discovery: Discovery) -> Self {
        self.discovery = discovery;
        self
    }

    /// Treat items carrying a failure marker as not pending.
    pub fn skip_failed(mut self, skip: bool) -> Self {
        self.skip_failed = skip;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn item(&self, id: u64) -> WorkItem {
        WorkItem {
            id,
            input: self.root.join(format!("{id}.{}", self.input_extension)),
            output: self.root.join(format!("{id}.{}", self.output_extension)),
        }
    }

    /// All items with an input file, ascending by id.
    ///
    /// Only canonical `<id>.<input_extension>` names count; anything that
    /// [`item`](Self::item) would not map back to the same file is ignored.
    /// Range discovery filters the directory listing, so its cost follows the
    /// number of files, not the width of the range.
    pub async fn discover(&self) -> Result<Vec<WorkItem>> {
        let mut ids = self.list_input_ids().await?;
        if let Discovery::Range { start, end } = self.discovery {
            ids.retain(|id| (start..=end).contains(id));
        }
        ids.sort_unstable();
        ids.dedup();
        Ok(ids.into_iter().map(|id| self.item(id)).collect())
    }

    async fn list_input_ids(&self) -> Result<Vec<u64>> {
        let mut read_dir = tokio::fs::read_dir(&self.root).await.map_err(|e| {
            AppError::Store(format!("Failed to read {}: {e}", self.root.display()))
        })?;

        let mut ids = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            if !is_file(&entry.path()).await {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            match self.canonical_id(name) {
                Some(id) => ids.push(id),
                None => tracing::debug!(file = name, "Skipping non-input file"),
            }
        }
        Ok(ids)
    }

    fn canonical_id(&self, file_name: &str) -> Option<u64> {
        let (stem, ext) = file_name.rsplit_once('.')?;
        if ext != self.input_extension {
            return None;
        }
        let id = stem.parse::<u64>().ok()?;
        (id.to_string() == stem).then_some(id)
    }

    /// Lazily yield the items that still need work.
    ///
    /// Completion is checked when an item is pulled, not when the sequence
    /// is created, so the sequence can be restarted at any time by calling
    /// this again.
    pub async fn list_pending(self: &Arc<Self>) -> Result<PendingItems> {
        let candidates = self.discover().await?;
        Ok(PendingItems {
            store: Arc::clone(self),
            candidates: candidates.into_iter(),
            skipped: 0,
        })
    }

    pub async fn is_done(&self, item: &WorkItem) -> bool {
        is_file(&item.output).await
    }

    pub async fn is_marked_failed(&self, item: &WorkItem) -> bool {
        is_file(&item.failure_marker()).await
    }

    pub async fn load_input(&self, item: &WorkItem) -> Result<Vec<u8>> {
        tokio::fs::read(&item.input).await.map_err(|e| {
            AppError::Store(format!("Failed to read {}: {e}", item.input.display()))
        })
    }

    pub async fn read_output(&self, item: &WorkItem) -> Result<String> {
        tokio::fs::read_to_string(&item.output).await.map_err(|e| {
            AppError::Store(format!("Failed to read {}: {e}", item.output.display()))
        })
    }

    /// Atomically write the output artifact for `item`.
    ///
    /// The payload goes to a sibling temp file that is flushed, synced and
    /// closed before being renamed into place.
    pub async fn commit(&self, item: &WorkItem, payload: &str) -> Result<()> {
        let temp = item.temp_path();

        let written = async {
            let mut file = tokio::fs::File::create(&temp).await?;
            file.write_all(payload.as_bytes()).await?;
            file.flush().await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&temp, &item.output).await
        }
        .await;

        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(AppError::Store(format!(
                "Failed to commit {}: {e}",
                item.output.display()
            )));
        }

        // A stale marker from an earlier run no longer applies.
        let _ = tokio::fs::remove_file(item.failure_marker()).await;
        Ok(())
    }

    /// Leave a marker so later runs can skip this item.
    pub async fn record_failure(&self, item: &WorkItem, error: &AppError) -> Result<()> {
        let body = format!("{}\t{}\t{error}\n", chrono::Utc::now().to_rfc3339(), error.kind());
        tokio::fs::write(item.failure_marker(), body).await.map_err(|e| {
            AppError::Store(format!("Failed to write failure marker for item {}: {e}", item.id))
        })
    }

    /// Remove every failure marker, returning how many were removed.
    pub async fn clear_failures(&self) -> Result<usize> {
        self.remove_matching(|name| name.ends_with(&format!(".{FAILED_EXTENSION}")))
            .await
    }

    /// Remove temp files left behind by an interrupted commit.
    pub async fn cleanup_stale_temp(&self) -> Result<usize> {
        let suffix = format!(".{}.{TEMP_SUFFIX}", self.output_extension);
        self.remove_matching(|name| name.ends_with(&suffix)).await
    }

    async fn remove_matching<F>(&self, predicate: F) -> Result<usize>
    where
        F: Fn(&str) -> bool,
    {
        let mut removed = 0;
        let mut read_dir = tokio::fs::read_dir(&self.root).await.map_err(|e| {
            AppError::Store(format!("Failed to read {}: {e}", self.root.display()))
        })?;

        while let Some(entry) = read_dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if predicate(&name) {
                tokio::fs::remove_file(entry.path()).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Finite, lazy sequence of pending work items.
pub struct PendingItems {
    store: Arc<WorkItemStore>,
    candidates: std::vec::IntoIter<WorkItem>,
    skipped: usize,
}

impl PendingItems {
    /// Pull the next item that is neither done nor marked failed.
    pub async fn next_pending(&mut self) -> Option<WorkItem> {
        for item in self.candidates.by_ref() {
            if self.store.is_done(&item).await {
                self.skipped += 1;
                continue;
            }
            if self.store.skip_failed && self.store.is_marked_failed(&item).await {
                tracing::debug!(item = item.id, "Skipping item marked as failed");
                self.skipped += 1;
                continue;
            }
            return Some(item);
        }
        None
    }

    /// Drain the remaining pending items.
    pub async fn collect_all(mut self) -> Vec<WorkItem> {
        let mut items = Vec::new();
        while let Some(item) = self.next_pending().await {
            items.push(item);
        }
        items
    }

    /// Items passed over so far because they were done or marked failed.
    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .is_ok_and(|meta| meta.is_file())
}
