//! On-demand attachment downloading
//!
//! Retrieves deferred parts after initial processing: cache-first, chunked
//! for large sections, scanned before storage, with the resulting blob bound
//! back onto the attachment row. At most one download per
//! `(message_id, part_id)` key is in flight; a duplicate concurrent call
//! fails fast with `AlreadyDownloading`. Bulk downloads fan out under a
//! bounded concurrency cap.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Semaphore, broadcast};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::blob_store::BlobStore;
use crate::config::FetchConfig;
use crate::db::MetadataDb;
use crate::errors::{StoreError, StoreResult};
use crate::fetch_plan::FetchPlanner;
use crate::mime;
use crate::models::{Attachment, MessageIdentity, PipelineEvent, ScanStatus};
use crate::recovery::RecoveryEngine;
use crate::scanner::SecurityScanner;
use crate::transport::Transport;

/// Outcome of a bulk download
#[derive(Debug, Clone, Default)]
pub struct DownloadBatchReport {
    /// Parts whose blobs are now bound
    pub succeeded: usize,
    /// Parts that failed, with the error description
    pub failed: Vec<(String, String)>,
}

type InflightSet = Arc<StdMutex<HashSet<(Uuid, String)>>>;

/// Removes the inflight key when the download future completes or is dropped
struct InflightGuard {
    set: InflightSet,
    key: (Uuid, String),
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        if let Ok(mut set) = self.set.lock() {
            set.remove(&self.key);
        }
    }
}

/// Coalesced, chunked attachment downloader
pub struct AttachmentDownloader {
    store: Arc<BlobStore>,
    db: MetadataDb,
    transport: Arc<dyn Transport>,
    scanner: Arc<SecurityScanner>,
    recovery: Arc<RecoveryEngine>,
    planner: FetchPlanner,
    config: FetchConfig,
    events: broadcast::Sender<PipelineEvent>,
    inflight: InflightSet,
}

impl AttachmentDownloader {
    /// Create a downloader over shared collaborators
    pub fn new(
        store: Arc<BlobStore>,
        transport: Arc<dyn Transport>,
        scanner: Arc<SecurityScanner>,
        recovery: Arc<RecoveryEngine>,
        config: FetchConfig,
        events: broadcast::Sender<PipelineEvent>,
    ) -> Self {
        Self {
            db: store.metadata_db(),
            store,
            transport,
            scanner,
            recovery,
            planner: FetchPlanner::new(config.clone()),
            config,
            events,
            inflight: Arc::new(StdMutex::new(HashSet::new())),
        }
    }

    /// Download one attachment and bind its blob
    ///
    /// Returns the bound blob id. Serves from the blob store without network
    /// when the row already carries a live blob. Sections above the
    /// large-attachment threshold are fetched as sequential 512 KiB ranges
    /// with a progress event after each chunk; the in-memory buffer is
    /// simply discarded if the future is cancelled mid-stream, so no partial
    /// blob is ever committed.
    ///
    /// # Errors
    ///
    /// - `AlreadyDownloading` when the same `(message, part)` key is in flight
    /// - `NotFound` when no attachment row exists for the part
    /// - `Security` when the scan verdict forbids storage
    pub async fn download_attachment(
        &self,
        identity: &MessageIdentity,
        message_id: Uuid,
        part_id: &str,
        expected_size: u64,
    ) -> StoreResult<String> {
        let key = (message_id, part_id.to_owned());
        let _guard = {
            let mut inflight = self
                .inflight
                .lock()
                .map_err(|_| StoreError::Internal("inflight set poisoned".to_owned()))?;
            if !inflight.insert(key.clone()) {
                return Err(StoreError::AlreadyDownloading(format!(
                    "{message_id}:{part_id}"
                )));
            }
            InflightGuard {
                set: Arc::clone(&self.inflight),
                key,
            }
        };

        let attachment = self
            .db
            .get_attachment_by_part(message_id, part_id)?
            .ok_or_else(|| {
                StoreError::not_found(format!("attachment {message_id}:{part_id}"))
            })?;

        if let Some(blob_id) = attachment.blob_id.as_deref()
            && self.store.exists(blob_id).await?
        {
            debug!(message_id = %message_id, part_id, "attachment already stored; no fetch");
            return Ok(blob_id.to_owned());
        }

        let total_size = if expected_size > 0 {
            expected_size
        } else {
            attachment.size_bytes
        };
        let raw = self
            .fetch_section_bytes(identity, message_id, part_id, total_size)
            .await?;

        let transfer_encoding = self
            .db
            .get_mime_part(message_id, part_id)?
            .and_then(|part| part.transfer_encoding);
        let decoded = mime::decode_transfer(&raw, transfer_encoding.as_deref())?;

        self.store_scanned(&attachment, decoded).await
    }

    /// Download every attachment of a message that has no bound blob yet
    ///
    /// Fans out under the configured per-message concurrency cap. Individual
    /// failures are collected, never propagated; the report carries both
    /// tallies.
    pub async fn download_all(
        &self,
        identity: &MessageIdentity,
        message_id: Uuid,
    ) -> StoreResult<DownloadBatchReport> {
        let pending: Vec<Attachment> = self
            .db
            .list_attachments(message_id)?
            .into_iter()
            .filter(|a| a.blob_id.is_none())
            .collect();
        if pending.is_empty() {
            return Ok(DownloadBatchReport::default());
        }

        let semaphore = Arc::new(Semaphore::new(self.config.download_concurrency.max(1)));
        let tasks = pending.into_iter().map(|attachment| {
            let semaphore = Arc::clone(&semaphore);
            async move {
                let _permit = match semaphore.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return Err((
                            attachment.part_id.clone(),
                            StoreError::Internal("semaphore closed".to_owned()),
                        ));
                    }
                };
                self.download_attachment(
                    identity,
                    message_id,
                    &attachment.part_id,
                    attachment.size_bytes,
                )
                .await
                .map(|blob_id| (attachment.part_id.clone(), blob_id))
                .map_err(|e| (attachment.part_id.clone(), e))
            }
        });

        let mut report = DownloadBatchReport::default();
        for result in futures::future::join_all(tasks).await {
            match result {
                Ok(_) => report.succeeded += 1,
                Err((part_id, error)) => {
                    warn!(message_id = %message_id, part_id, error = %error, "bulk download failure");
                    report.failed.push((part_id, error.to_string()));
                }
            }
        }
        info!(
            message_id = %message_id,
            succeeded = report.succeeded,
            failed = report.failed.len(),
            "bulk download finished"
        );
        Ok(report)
    }

    /// Fetch the raw (still transfer-encoded) section bytes
    async fn fetch_section_bytes(
        &self,
        identity: &MessageIdentity,
        message_id: Uuid,
        part_id: &str,
        total_size: u64,
    ) -> StoreResult<Vec<u8>> {
        let context = format!("download:{message_id}:{part_id}");
        if total_size > self.config.large_attachment_threshold {
            let chunks = self.planner.partial_plan(part_id, total_size);
            let mut buffer = Vec::with_capacity(total_size as usize);
            for chunk in chunks {
                let bytes = self
                    .recovery
                    .run_with_retry(&context, || {
                        self.transport.fetch_partial(
                            identity,
                            part_id,
                            chunk.offset,
                            chunk.length,
                        )
                    })
                    .await?;
                buffer.extend_from_slice(&bytes);
                let _ = self.events.send(PipelineEvent::DownloadProgress {
                    message_id,
                    part_id: part_id.to_owned(),
                    current_offset: buffer.len() as u64,
                    total_size,
                });
            }
            Ok(buffer)
        } else {
            self.recovery
                .run_with_retry(&context, || self.transport.fetch_section(identity, part_id))
                .await
        }
    }

    /// Scan, store, and bind the decoded bytes
    async fn store_scanned(
        &self,
        attachment: &Attachment,
        decoded: Vec<u8>,
    ) -> StoreResult<String> {
        let outcome = self
            .scanner
            .scan(&decoded, &attachment.media_type, Some(&attachment.filename))
            .await?;
        if outcome.status == ScanStatus::Infected {
            self.db
                .update_attachment_scan_status(attachment.id, ScanStatus::Infected)?;
            let _ = self.events.send(PipelineEvent::Warning {
                message_id: attachment.message_id,
                detail: format!(
                    "attachment '{}' rejected by scanner: {}",
                    attachment.filename,
                    outcome.threat_name.as_deref().unwrap_or("unnamed threat")
                ),
            });
            return Err(StoreError::Security(format!(
                "attachment '{}' failed its security scan",
                attachment.filename
            )));
        }

        let blob_id = self
            .store
            .store_safe(&decoded, self.config.max_attachment_size)
            .await?;
        self.store
            .mark_scanned(&blob_id, outcome.status, outcome.threat_name.as_deref())
            .await?;
        self.db.bind_attachment_blob(attachment.id, &blob_id)?;
        self.db
            .update_attachment_scan_status(attachment.id, outcome.status)?;
        self.db
            .bind_part_blob(attachment.message_id, &attachment.part_id, &blob_id)?;
        debug!(
            message_id = %attachment.message_id,
            part_id = %attachment.part_id,
            blob_id = %blob_id,
            "attachment downloaded and bound"
        );
        Ok(blob_id)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use tempfile::TempDir;
    use tokio::sync::broadcast;
    use uuid::Uuid;

    use super::AttachmentDownloader;
    use crate::blob_store::BlobStore;
    use crate::config::{FetchConfig, RecoveryConfig};
    use crate::errors::{StoreError, StoreResult};
    use crate::models::{Attachment, MessageIdentity, PipelineEvent, ScanStatus};
    use crate::recovery::RecoveryEngine;
    use crate::scanner::SecurityScanner;
    use crate::structure::BodyStructure;
    use crate::transport::Transport;

    /// Transport serving a fixed payload, counting section fetches
    struct FixedTransport {
        payload: Vec<u8>,
        delay: Duration,
        section_fetches: AtomicU32,
        partial_fetches: AtomicU32,
    }

    impl FixedTransport {
        fn new(payload: Vec<u8>) -> Self {
            Self {
                payload,
                delay: Duration::from_millis(0),
                section_fetches: AtomicU32::new(0),
                partial_fetches: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Transport for FixedTransport {
        async fn fetch_section(
            &self,
            _identity: &MessageIdentity,
            _section_id: &str,
        ) -> StoreResult<Vec<u8>> {
            self.section_fetches.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(self.payload.clone())
        }

        async fn fetch_partial(
            &self,
            _identity: &MessageIdentity,
            _section_id: &str,
            offset: u64,
            length: u64,
        ) -> StoreResult<Vec<u8>> {
            self.partial_fetches.fetch_add(1, Ordering::SeqCst);
            let start = offset as usize;
            let end = (offset + length).min(self.payload.len() as u64) as usize;
            Ok(self.payload[start..end].to_vec())
        }

        async fn fetch_body_structure(
            &self,
            _identity: &MessageIdentity,
        ) -> StoreResult<BodyStructure> {
            Err(StoreError::Internal("not used in these tests".to_owned()))
        }
    }

    struct Fixture {
        _dir: TempDir,
        store: Arc<BlobStore>,
        downloader: AttachmentDownloader,
        transport: Arc<FixedTransport>,
        events: broadcast::Receiver<PipelineEvent>,
        message_id: Uuid,
        identity: MessageIdentity,
    }

    async fn fixture(payload: Vec<u8>, transport_delay: Duration) -> Fixture {
        let dir = TempDir::new().expect("temp dir");
        let store = Arc::new(BlobStore::init(dir.path()).await.expect("store init"));
        let mut transport_inner = FixedTransport::new(payload);
        transport_inner.delay = transport_delay;
        let transport = Arc::new(transport_inner);
        let recovery = Arc::new(RecoveryEngine::new(RecoveryConfig {
            base_delay_ms: 1,
            max_delay_ms: 2,
            ..RecoveryConfig::default()
        }));
        let (tx, rx) = broadcast::channel(64);
        let downloader = AttachmentDownloader::new(
            Arc::clone(&store),
            Arc::clone(&transport) as Arc<dyn Transport>,
            Arc::new(SecurityScanner::new(25 * 1024 * 1024)),
            recovery,
            FetchConfig::default(),
            tx,
        );
        Fixture {
            _dir: dir,
            store,
            downloader,
            transport,
            events: rx,
            message_id: Uuid::new_v4(),
            identity: MessageIdentity::new("default", "INBOX", 7),
        }
    }

    fn attachment_row(message_id: Uuid, part_id: &str, size: u64) -> Attachment {
        Attachment {
            id: 0,
            message_id,
            part_id: part_id.to_owned(),
            filename: "data.bin".to_owned(),
            media_type: "application/octet-stream".to_owned(),
            size_bytes: size,
            blob_id: None,
            content_id: None,
            is_inline: false,
            scan_status: ScanStatus::Pending,
        }
    }

    #[tokio::test]
    async fn small_attachment_downloads_in_one_fetch() {
        let mut fx = fixture(b"small payload".to_vec(), Duration::ZERO).await;
        let db = fx.store.metadata_db();
        db.insert_attachment(&attachment_row(fx.message_id, "1.2", 13))
            .expect("row");

        let blob_id = fx
            .downloader
            .download_attachment(&fx.identity, fx.message_id, "1.2", 13)
            .await
            .expect("download succeeds");

        assert_eq!(fx.transport.section_fetches.load(Ordering::SeqCst), 1);
        assert_eq!(fx.transport.partial_fetches.load(Ordering::SeqCst), 0);
        let stored = fx
            .store
            .retrieve(&blob_id)
            .await
            .expect("ok")
            .expect("present");
        assert_eq!(stored, b"small payload");

        let row = db
            .get_attachment_by_part(fx.message_id, "1.2")
            .expect("query")
            .expect("present");
        assert_eq!(row.blob_id.as_deref(), Some(blob_id.as_str()));
        assert!(fx.events.try_recv().is_err(), "no progress for small fetches");
    }

    #[tokio::test]
    async fn large_attachment_downloads_in_chunks_with_progress() {
        let payload = vec![7u8; 1_300_000];
        let mut fx = fixture(payload.clone(), Duration::ZERO).await;
        let db = fx.store.metadata_db();
        db.insert_attachment(&attachment_row(fx.message_id, "1.3", payload.len() as u64))
            .expect("row");

        let blob_id = fx
            .downloader
            .download_attachment(&fx.identity, fx.message_id, "1.3", payload.len() as u64)
            .await
            .expect("download succeeds");

        assert_eq!(fx.transport.partial_fetches.load(Ordering::SeqCst), 3);
        assert_eq!(fx.transport.section_fetches.load(Ordering::SeqCst), 0);
        let stored = fx
            .store
            .retrieve(&blob_id)
            .await
            .expect("ok")
            .expect("present");
        assert_eq!(stored.len(), payload.len());

        let mut offsets = Vec::new();
        while let Ok(event) = fx.events.try_recv() {
            if let PipelineEvent::DownloadProgress {
                current_offset,
                total_size,
                ..
            } = event
            {
                assert_eq!(total_size, payload.len() as u64);
                offsets.push(current_offset);
            }
        }
        assert_eq!(offsets.len(), 3);
        assert!(offsets.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(*offsets.last().expect("has progress"), payload.len() as u64);
    }

    #[tokio::test]
    async fn duplicate_concurrent_download_fails_fast() {
        let fx = fixture(b"slow payload".to_vec(), Duration::from_millis(150)).await;
        let db = fx.store.metadata_db();
        db.insert_attachment(&attachment_row(fx.message_id, "1.2", 12))
            .expect("row");

        let downloader = Arc::new(fx.downloader);
        let first = {
            let downloader = Arc::clone(&downloader);
            let identity = fx.identity.clone();
            let message_id = fx.message_id;
            tokio::spawn(async move {
                downloader
                    .download_attachment(&identity, message_id, "1.2", 12)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        let second = downloader
            .download_attachment(&fx.identity, fx.message_id, "1.2", 12)
            .await;
        assert!(matches!(second, Err(StoreError::AlreadyDownloading(_))));

        first.await.expect("join").expect("first download wins");
        assert_eq!(fx.transport.section_fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cached_blob_short_circuits_the_network() {
        let fx = fixture(b"never fetched".to_vec(), Duration::ZERO).await;
        let db = fx.store.metadata_db();
        let blob_id = fx.store.store(b"already here").await.expect("seed blob");
        let mut row = attachment_row(fx.message_id, "1.2", 12);
        row.blob_id = Some(blob_id.clone());
        db.insert_attachment(&row).expect("row");

        let result = fx
            .downloader
            .download_attachment(&fx.identity, fx.message_id, "1.2", 12)
            .await
            .expect("serves from cache");
        assert_eq!(result, blob_id);
        assert_eq!(fx.transport.section_fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn download_all_fans_out_and_reports_failures() {
        let fx = fixture(b"bulk payload".to_vec(), Duration::ZERO).await;
        let db = fx.store.metadata_db();
        for part_id in ["1.2", "1.3", "1.4"] {
            db.insert_attachment(&attachment_row(fx.message_id, part_id, 12))
                .expect("row");
        }

        let report = fx
            .downloader
            .download_all(&fx.identity, fx.message_id)
            .await
            .expect("bulk runs");
        assert_eq!(report.succeeded, 3);
        assert!(report.failed.is_empty());

        // A second run has nothing left to do.
        let report = fx
            .downloader
            .download_all(&fx.identity, fx.message_id)
            .await
            .expect("bulk runs");
        assert_eq!(report.succeeded, 0);
    }

    #[tokio::test]
    async fn missing_attachment_row_is_not_found() {
        let fx = fixture(b"payload".to_vec(), Duration::ZERO).await;
        let err = fx
            .downloader
            .download_attachment(&fx.identity, fx.message_id, "9.9", 10)
            .await
            .expect_err("no row");
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
