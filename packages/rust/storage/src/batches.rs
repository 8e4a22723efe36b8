//! Append-only batch history.
//!
//! Every extraction run that retained products leaves one immutable JSON
//! artifact at `<state_dir>/batches/<timestamp>-<batch_id>.json`.

use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use catalogsync_shared::{Batch, CatalogSyncError, Result};

/// Directory name for batch artifacts inside the state directory.
pub const BATCHES_DIR: &str = "batches";

/// Cross-run batch history.
pub trait BatchStore: Send + Sync {
    /// Every vendor id present in any stored batch.
    fn list_known_ids(&self) -> Result<HashSet<String>>;

    /// Persist a batch. Existing batches are never overwritten.
    fn append_batch(&self, batch: &Batch) -> Result<()>;

    /// All stored batches, oldest first.
    fn load_batches(&self) -> Result<Vec<Batch>>;
}

// ---------------------------------------------------------------------------
// FileBatchStore
// ---------------------------------------------------------------------------

/// One JSON file per batch.
pub struct FileBatchStore {
    dir: PathBuf,
}

impl FileBatchStore {
    /// Store rooted at `<state_dir>/batches`.
    pub fn new(state_dir: &Path) -> Self {
        Self {
            dir: state_dir.join(BATCHES_DIR),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_name(batch: &Batch) -> String {
        format!(
            "{}-{}.json",
            batch.extracted_at.format("%Y%m%dT%H%M%SZ"),
            batch.id
        )
    }

    fn batch_files(&self) -> Result<Vec<PathBuf>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let entries = std::fs::read_dir(&self.dir).map_err(|e| CatalogSyncError::io(&self.dir, e))?;

        let mut files = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| CatalogSyncError::io(&self.dir, e))?.path();
            let is_json = path.extension().is_some_and(|ext| ext == "json");
            let is_temp = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with('.'));
            if is_json && !is_temp {
                files.push(path);
            }
        }
        // Timestamp-prefixed names sort chronologically.
        files.sort();
        Ok(files)
    }
}

impl BatchStore for FileBatchStore {
    fn list_known_ids(&self) -> Result<HashSet<String>> {
        Ok(self
            .load_batches()?
            .iter()
            .flat_map(|b| b.vendor_ids().map(str::to_string))
            .collect())
    }

    fn append_batch(&self, batch: &Batch) -> Result<()> {
        batch.validate()?;
        std::fs::create_dir_all(&self.dir).map_err(|e| CatalogSyncError::io(&self.dir, e))?;

        let filename = Self::file_name(batch);
        let target = self.dir.join(&filename);
        if target.exists() {
            return Err(CatalogSyncError::Storage(format!(
                "batch artifact {} already exists",
                target.display()
            )));
        }

        let json = serde_json::to_vec_pretty(batch)
            .map_err(|e| CatalogSyncError::Storage(format!("encode batch {}: {e}", batch.id)))?;

        // Write to a hidden temp file, then rename into place.
        let temp = self.dir.join(format!(".{filename}.tmp"));
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp)
            .map_err(|e| CatalogSyncError::io(&temp, e))?;
        file.write_all(&json)
            .and_then(|_| file.sync_all())
            .map_err(|e| CatalogSyncError::io(&temp, e))?;
        drop(file);

        std::fs::rename(&temp, &target).map_err(|e| CatalogSyncError::io(&target, e))?;

        tracing::info!(
            batch_id = %batch.id,
            products = batch.products.len(),
            path = %target.display(),
            "batch appended"
        );
        Ok(())
    }

    fn load_batches(&self) -> Result<Vec<Batch>> {
        let mut batches = Vec::new();
        for path in self.batch_files()? {
            let content = std::fs::read(&path).map_err(|e| CatalogSyncError::io(&path, e))?;
            let batch: Batch = serde_json::from_slice(&content).map_err(|e| {
                CatalogSyncError::Storage(format!("corrupt batch {}: {e}", path.display()))
            })?;
            batches.push(batch);
        }
        batches.sort_by_key(|b| b.extracted_at);
        Ok(batches)
    }
}

// ---------------------------------------------------------------------------
// MemoryBatchStore
// ---------------------------------------------------------------------------

/// In-memory history for tests and dry runs.
#[derive(Default)]
pub struct MemoryBatchStore {
    batches: Mutex<Vec<Batch>>,
}

impl MemoryBatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_batches(batches: Vec<Batch>) -> Self {
        Self {
            batches: Mutex::new(batches),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<Batch>>> {
        self.batches
            .lock()
            .map_err(|_| CatalogSyncError::Storage("batch store lock poisoned".into()))
    }
}

impl BatchStore for MemoryBatchStore {
    fn list_known_ids(&self) -> Result<HashSet<String>> {
        Ok(self
            .lock()?
            .iter()
            .flat_map(|b| b.vendor_ids().map(str::to_string))
            .collect())
    }

    fn append_batch(&self, batch: &Batch) -> Result<()> {
        batch.validate()?;
        let mut batches = self.lock()?;
        if batches.iter().any(|b| b.id == batch.id) {
            return Err(CatalogSyncError::Storage(format!(
                "batch {} already exists",
                batch.id
            )));
        }
        batches.push(batch.clone());
        Ok(())
    }

    fn load_batches(&self) -> Result<Vec<Batch>> {
        let mut batches = self.lock()?.clone();
        batches.sort_by_key(|b| b.extracted_at);
        Ok(batches)
    }
}
