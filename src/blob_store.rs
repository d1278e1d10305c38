//! Content-addressed blob storage
//!
//! Stores opaque byte sequences addressed by their SHA-256 hash in a
//! two-level fan-out under a base directory, with deduplication, reference
//! counting, integrity verification on read, quarantine, scan-status
//! tracking, mark-and-sweep garbage collection, and an orphan sweep for
//! files that lost their metadata row mid-write.
//!
//! Concurrency discipline: a store-wide reader-writer barrier lets normal
//! per-blob operations run in parallel while garbage collection, quarantine
//! transitions, and the orphan sweep hold the barrier exclusively. Within
//! the shared side, operations on the same blob id are serialized through a
//! per-blob lock so concurrent stores of identical bytes observe exactly one
//! physical write.

use std::collections::HashMap;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::{BlobTableStats, MetadataDb};
use crate::errors::{StoreError, StoreResult};
use crate::models::{BlobMeta, QuarantineRecord, ScanRecord, ScanStatus};

/// Directory for quarantined blobs under the base directory
const QUARANTINE_DIR: &str = "quarantine";
/// Directory for scan record sidecars under the base directory
const SCAN_METADATA_DIR: &str = "scan_metadata";
/// Metadata database filename under the base directory
const METADATA_DB_FILE: &str = "metadata.db";

/// Aggregate statistics over the store
pub type BlobStoreStats = BlobTableStats;

/// Content-addressed, refcounted blob store
pub struct BlobStore {
    base_dir: PathBuf,
    db: MetadataDb,
    /// Store-wide barrier: exclusive for GC/quarantine/sweep, shared otherwise
    barrier: RwLock<()>,
    /// Per-blob serialization for file operations
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl BlobStore {
    /// Initialize the store under `base_dir`
    ///
    /// Creates the directory tree (`quarantine/`, `scan_metadata/`) and opens
    /// the metadata database. Safe to call on an existing store.
    pub async fn init(base_dir: impl Into<PathBuf>) -> StoreResult<Self> {
        let base_dir = base_dir.into();
        tokio::fs::create_dir_all(&base_dir).await?;
        tokio::fs::create_dir_all(base_dir.join(QUARANTINE_DIR)).await?;
        tokio::fs::create_dir_all(base_dir.join(SCAN_METADATA_DIR)).await?;
        let db = MetadataDb::open(&base_dir.join(METADATA_DB_FILE))?;
        info!(base_dir = %base_dir.display(), "blob store initialized");
        Ok(Self {
            base_dir,
            db,
            barrier: RwLock::new(()),
            locks: StdMutex::new(HashMap::new()),
        })
    }

    /// Flush and close the metadata store
    pub async fn shutdown(&self) -> StoreResult<()> {
        let _guard = self.barrier.write().await;
        self.db.checkpoint()
    }

    /// Shared handle to the underlying metadata database
    ///
    /// The render cache and the pipeline persist their rows in the same
    /// database file.
    pub fn metadata_db(&self) -> MetadataDb {
        self.db.clone()
    }

    /// Compute the content address of a byte sequence
    pub fn content_address(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Relative path for a blob id: `aa/bb/<blob_id>`
    pub fn relative_path(blob_id: &str) -> String {
        format!("{}/{}/{}", &blob_id[0..2], &blob_id[2..4], blob_id)
    }

    fn blob_path(&self, blob_id: &str) -> PathBuf {
        self.base_dir.join(Self::relative_path(blob_id))
    }

    fn quarantine_path(&self, blob_id: &str) -> PathBuf {
        self.base_dir.join(QUARANTINE_DIR).join(blob_id)
    }

    fn quarantine_meta_path(&self, blob_id: &str) -> PathBuf {
        self.base_dir
            .join(QUARANTINE_DIR)
            .join(format!("{blob_id}.meta"))
    }

    fn scan_record_path(&self, blob_id: &str) -> PathBuf {
        self.base_dir.join(SCAN_METADATA_DIR).join(blob_id)
    }

    fn lock_for(&self, blob_id: &str) -> StoreResult<Arc<Mutex<()>>> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| StoreError::Internal("blob lock map poisoned".to_owned()))?;
        Ok(Arc::clone(
            locks
                .entry(blob_id.to_owned())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        ))
    }

    fn validate_blob_id(blob_id: &str) -> StoreResult<()> {
        if blob_id.len() != 64 || !blob_id.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(StoreError::invalid(format!(
                "'{blob_id}' is not a valid blob id"
            )));
        }
        if blob_id.bytes().any(|b| b.is_ascii_uppercase()) {
            return Err(StoreError::invalid("blob ids are lowercase hex"));
        }
        Ok(())
    }

    /// Store a byte sequence; returns its content address
    ///
    /// Identical bytes deduplicate: the existing row's refcount is
    /// incremented and no second file is written. New content is written to
    /// a temp file and renamed into place so a crash never leaves a partial
    /// blob under its final name.
    pub async fn store(&self, bytes: &[u8]) -> StoreResult<String> {
        let blob_id = Self::content_address(bytes);
        let _shared = self.barrier.read().await;
        let lock = self.lock_for(&blob_id)?;
        let _guard = lock.lock().await;

        if self.db.increment_ref(&blob_id)? {
            debug!(blob_id = %blob_id, "deduplicated store; refcount incremented");
            return Ok(blob_id);
        }

        let final_path = self.blob_path(&blob_id);
        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let temp_path = final_path.with_file_name(format!(".tmp-{}", Uuid::new_v4()));
        tokio::fs::write(&temp_path, bytes).await?;
        tokio::fs::rename(&temp_path, &final_path).await?;

        let now = Utc::now();
        let meta = BlobMeta {
            blob_id: blob_id.clone(),
            size_bytes: bytes.len() as u64,
            relative_path: Self::relative_path(&blob_id),
            ref_count: 1,
            created_at: now,
            last_accessed_at: now,
            quarantined: false,
        };
        if let Err(e) = self.db.insert_blob(&meta) {
            // The file stays behind unreferenced; the orphan sweep harvests it.
            warn!(blob_id = %blob_id, error = %e, "metadata insert failed after file write");
            return Err(e);
        }
        debug!(blob_id = %blob_id, size = bytes.len(), "blob stored");
        Ok(blob_id)
    }

    /// Store with a size guard
    ///
    /// # Errors
    ///
    /// Returns `SizeExceeded` when `bytes` is longer than `max_size`.
    pub async fn store_safe(&self, bytes: &[u8], max_size: u64) -> StoreResult<String> {
        if bytes.len() as u64 > max_size {
            return Err(StoreError::SizeExceeded(format!(
                "blob of {} bytes exceeds maximum of {max_size} bytes",
                bytes.len()
            )));
        }
        self.store(bytes).await
    }

    /// Retrieve a blob's bytes, verifying integrity
    ///
    /// Returns `None` when no row exists. The stored bytes are re-hashed on
    /// every read; a mismatch is surfaced as `Integrity` and never retried.
    pub async fn retrieve(&self, blob_id: &str) -> StoreResult<Option<Vec<u8>>> {
        Self::validate_blob_id(blob_id)?;
        let _shared = self.barrier.read().await;
        let lock = self.lock_for(blob_id)?;
        let _guard = lock.lock().await;

        let Some(meta) = self.db.get_blob(blob_id)? else {
            return Ok(None);
        };
        let path = if meta.quarantined {
            self.quarantine_path(blob_id)
        } else {
            self.blob_path(blob_id)
        };
        let bytes = tokio::fs::read(&path).await?;
        let actual = Self::content_address(&bytes);
        if actual != blob_id {
            return Err(StoreError::Integrity {
                blob_id: blob_id.to_owned(),
                actual,
            });
        }
        self.db.touch_blob(blob_id)?;
        Ok(Some(bytes))
    }

    /// Retrieve with quarantine and scan-status enforcement
    ///
    /// Fast-fails with `Security` when the blob is quarantined or its scan
    /// status does not permit download; returns `None` when no row exists.
    pub async fn retrieve_safe(&self, blob_id: &str) -> StoreResult<Option<Vec<u8>>> {
        Self::validate_blob_id(blob_id)?;
        {
            let _shared = self.barrier.read().await;
            let Some(meta) = self.db.get_blob(blob_id)? else {
                return Ok(None);
            };
            if meta.quarantined {
                return Err(StoreError::Security(format!(
                    "blob {blob_id} is quarantined"
                )));
            }
        }
        if let Some(status) = self.get_scan_status(blob_id).await?
            && !status.is_allowed_to_download()
        {
            return Err(StoreError::Security(format!(
                "blob {blob_id} has scan status '{}'",
                status.as_str()
            )));
        }
        self.retrieve(blob_id).await
    }

    /// Whether a blob row exists (constant-time metadata lookup)
    pub async fn exists(&self, blob_id: &str) -> StoreResult<bool> {
        Self::validate_blob_id(blob_id)?;
        let _shared = self.barrier.read().await;
        self.db.blob_exists(blob_id)
    }

    /// Increment a blob's refcount
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when no row exists.
    pub async fn inc_ref(&self, blob_id: &str) -> StoreResult<()> {
        Self::validate_blob_id(blob_id)?;
        let _shared = self.barrier.read().await;
        if !self.db.increment_ref(blob_id)? {
            return Err(StoreError::not_found(format!("blob {blob_id}")));
        }
        Ok(())
    }

    /// Decrement a blob's refcount, clamping at zero
    pub async fn dec_ref(&self, blob_id: &str) -> StoreResult<()> {
        Self::validate_blob_id(blob_id)?;
        let _shared = self.barrier.read().await;
        if self.db.decrement_ref(blob_id)?.is_none() {
            return Err(StoreError::not_found(format!("blob {blob_id}")));
        }
        Ok(())
    }

    /// Delete one reference; removes file and row at the last reference
    pub async fn delete(&self, blob_id: &str) -> StoreResult<()> {
        Self::validate_blob_id(blob_id)?;
        let _shared = self.barrier.read().await;
        let lock = self.lock_for(blob_id)?;
        let _guard = lock.lock().await;

        let Some(meta) = self.db.get_blob(blob_id)? else {
            return Err(StoreError::not_found(format!("blob {blob_id}")));
        };
        if meta.ref_count <= 1 {
            let path = if meta.quarantined {
                self.quarantine_path(blob_id)
            } else {
                self.blob_path(blob_id)
            };
            remove_file_if_present(&path).await?;
            remove_file_if_present(&self.quarantine_meta_path(blob_id)).await?;
            remove_file_if_present(&self.scan_record_path(blob_id)).await?;
            self.db.delete_blob(blob_id)?;
            debug!(blob_id = %blob_id, "blob deleted at last reference");
        } else {
            self.db.decrement_ref(blob_id)?;
        }
        Ok(())
    }

    /// Remove all collectable blobs; returns the count removed
    ///
    /// Collectable means refcount zero and not quarantined. Holds the
    /// store-wide barrier, so it is safe to run concurrently with stores and
    /// retrieves (they wait).
    pub async fn gc(&self) -> StoreResult<u64> {
        let _exclusive = self.barrier.write().await;
        let collectable = self.db.collectable_blobs()?;
        let mut removed = 0u64;
        for meta in collectable {
            remove_file_if_present(&self.base_dir.join(&meta.relative_path)).await?;
            remove_file_if_present(&self.scan_record_path(&meta.blob_id)).await?;
            self.db.delete_blob(&meta.blob_id)?;
            removed += 1;
        }
        if removed > 0 {
            info!(removed, "garbage collection complete");
        }
        Ok(removed)
    }

    /// Harvest files in the fan-out tree that have no metadata row
    ///
    /// Covers the crash window between file write and row insert, and any
    /// abandoned temp files. Returns the count removed.
    pub async fn sweep_orphans(&self) -> StoreResult<u64> {
        let _exclusive = self.barrier.write().await;
        let known: HashSet<String> = self.db.list_blob_paths()?.into_iter().collect();
        let mut removed = 0u64;

        let mut top = tokio::fs::read_dir(&self.base_dir).await?;
        while let Some(level1) = top.next_entry().await? {
            if !is_fanout_dir(&level1.path()) {
                continue;
            }
            let mut mid = tokio::fs::read_dir(level1.path()).await?;
            while let Some(level2) = mid.next_entry().await? {
                if !is_fanout_dir(&level2.path()) {
                    continue;
                }
                let mut files = tokio::fs::read_dir(level2.path()).await?;
                while let Some(file) = files.next_entry().await? {
                    let path = file.path();
                    if !file.file_type().await?.is_file() {
                        continue;
                    }
                    let relative = match path.strip_prefix(&self.base_dir) {
                        Ok(rel) => rel.to_string_lossy().replace('\\', "/"),
                        Err(_) => continue,
                    };
                    if !known.contains(&relative) {
                        warn!(path = %path.display(), "removing orphaned blob file");
                        remove_file_if_present(&path).await?;
                        removed += 1;
                    }
                }
            }
        }
        Ok(removed)
    }

    /// Move a blob out of the normal tree into quarantine
    ///
    /// Writes a `.meta` sidecar JSON next to the quarantined copy and keeps
    /// the metadata row with its quarantine flag set, so `retrieve_safe`
    /// short-circuits and restore is a pure inverse.
    pub async fn quarantine(&self, blob_id: &str, reason: &str) -> StoreResult<()> {
        Self::validate_blob_id(blob_id)?;
        let _exclusive = self.barrier.write().await;

        let Some(meta) = self.db.get_blob(blob_id)? else {
            return Err(StoreError::not_found(format!("blob {blob_id}")));
        };
        if meta.quarantined {
            return Ok(());
        }

        let record = QuarantineRecord {
            original_hash: blob_id.to_owned(),
            quarantine_date: Utc::now(),
            reason: reason.to_owned(),
        };
        let sidecar = serde_json::to_vec_pretty(&record)?;
        tokio::fs::write(self.quarantine_meta_path(blob_id), sidecar).await?;
        tokio::fs::rename(self.blob_path(blob_id), self.quarantine_path(blob_id)).await?;
        self.db.set_blob_quarantined(blob_id, true)?;
        self.mark_scanned(blob_id, ScanStatus::Quarantined, Some(reason))
            .await?;
        warn!(blob_id = %blob_id, reason, "blob quarantined");
        Ok(())
    }

    /// Move a quarantined blob back into the normal tree
    pub async fn restore_from_quarantine(&self, blob_id: &str) -> StoreResult<()> {
        Self::validate_blob_id(blob_id)?;
        let _exclusive = self.barrier.write().await;

        let Some(meta) = self.db.get_blob(blob_id)? else {
            return Err(StoreError::not_found(format!("blob {blob_id}")));
        };
        if !meta.quarantined {
            return Ok(());
        }

        let final_path = self.blob_path(blob_id);
        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(self.quarantine_path(blob_id), &final_path).await?;
        remove_file_if_present(&self.quarantine_meta_path(blob_id)).await?;
        self.db.set_blob_quarantined(blob_id, false)?;
        self.mark_scanned(blob_id, ScanStatus::Pending, Some("restored from quarantine"))
            .await?;
        info!(blob_id = %blob_id, "blob restored from quarantine");
        Ok(())
    }

    /// Record a scan verdict for a blob
    pub async fn mark_scanned(
        &self,
        blob_id: &str,
        status: ScanStatus,
        details: Option<&str>,
    ) -> StoreResult<()> {
        Self::validate_blob_id(blob_id)?;
        let record = ScanRecord {
            hash: blob_id.to_owned(),
            scan_status: status,
            scan_date: Utc::now(),
            details: details.map(str::to_owned),
        };
        let bytes = serde_json::to_vec_pretty(&record)?;
        tokio::fs::write(self.scan_record_path(blob_id), bytes).await?;
        Ok(())
    }

    /// Latest recorded scan verdict for a blob, if any
    pub async fn get_scan_status(&self, blob_id: &str) -> StoreResult<Option<ScanStatus>> {
        Self::validate_blob_id(blob_id)?;
        match tokio::fs::read(self.scan_record_path(blob_id)).await {
            Ok(bytes) => {
                let record: ScanRecord = serde_json::from_slice(&bytes)?;
                Ok(Some(record.scan_status))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Run the periodic housekeeping pass: GC then orphan sweep
    ///
    /// Returns `(collected, orphans_removed)`.
    pub async fn maintenance(&self) -> StoreResult<(u64, u64)> {
        let collected = self.gc().await?;
        let orphans = self.sweep_orphans().await?;
        Ok((collected, orphans))
    }

    /// All blob ids in the store
    pub async fn list_all(&self) -> StoreResult<Vec<String>> {
        let _shared = self.barrier.read().await;
        self.db.list_blob_ids()
    }

    /// Aggregate statistics
    pub async fn stats(&self) -> StoreResult<BlobStoreStats> {
        let _shared = self.barrier.read().await;
        self.db.blob_stats()
    }
}

async fn remove_file_if_present(path: &Path) -> StoreResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn is_fanout_dir(path: &Path) -> bool {
    path.is_dir()
        && path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.len() == 2 && n.bytes().all(|b| b.is_ascii_hexdigit()))
}
