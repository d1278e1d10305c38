//! Message processing pipeline
//!
//! Orchestrates the end-to-end path from raw message bytes to a cached
//! render artifact: cache probe, size guard, RAW persistence, MIME parse,
//! secure-part detection, body selection, attachment scanning and storage,
//! HTML finalization, and cache materialization. The whole run races a hard
//! timeout and honors cooperative cancellation; attachments are processed in
//! a bounded task group and their failures never abort the message.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Semaphore, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::blob_store::BlobStore;
use crate::body_select::{BodyCandidate, BodySelection, BodySelectionStrategy, select_body};
use crate::config::StoreConfig;
use crate::db::MetadataDb;
use crate::errors::{StoreError, StoreResult};
use crate::fetch_plan::{FetchPlanner, FetchStrategy};
use crate::mime::{self, ParsedPart};
use crate::models::{
    Attachment, MessageIdentity, MessageRecord, MimePart, PipelineEvent, ProcessingState,
    ProcessingSummary, ScanStatus,
};
use crate::recovery::RecoveryEngine;
use crate::sanitize::{derive_text_from_html, rewrite_cid_references, sanitize_html};
use crate::scanner::SecurityScanner;
use crate::secure::{classify_media_type, detect_secure_parts};
use crate::structure::BodyStructure;
use crate::transport::{LimitCheck, MessageLimits, Transport};

/// One processing request
#[derive(Debug, Clone)]
pub struct ProcessingRequest {
    /// Server-side identity
    pub identity: MessageIdentity,
    /// Local 128-bit identity
    pub message_id: Uuid,
    /// Full RFC 822 bytes as fetched
    pub raw_bytes: Vec<u8>,
    /// Server-reported structure, when the transport supplied one
    pub structure: Option<BodyStructure>,
    /// Already-fetched sections keyed by dotted part id (still
    /// transfer-encoded, as they came off the wire)
    pub prefetched_sections: HashMap<String, Vec<u8>>,
    /// Body selection strategy for this run
    pub body_strategy: BodySelectionStrategy,
}

impl ProcessingRequest {
    /// Request with the smart body strategy and no server structure
    pub fn from_raw(identity: MessageIdentity, message_id: Uuid, raw_bytes: Vec<u8>) -> Self {
        Self {
            identity,
            message_id,
            raw_bytes,
            structure: None,
            prefetched_sections: HashMap::new(),
            body_strategy: BodySelectionStrategy::Smart,
        }
    }
}

/// Outcome of processing one attachment part
struct AttachmentOutcome {
    part_id: String,
    stored_bytes: u64,
    warning: Option<String>,
    error: Option<String>,
}

/// The processing pipeline with its injected collaborators
///
/// Everything the pipeline touches is an explicit collaborator passed at
/// construction; there are no process-wide singletons.
pub struct MessagePipeline {
    store: Arc<BlobStore>,
    db: MetadataDb,
    cache: Arc<crate::render_cache::RenderCache>,
    scanner: Arc<SecurityScanner>,
    recovery: Arc<RecoveryEngine>,
    limits: Arc<dyn MessageLimits>,
    transport: Option<Arc<dyn Transport>>,
    planner: FetchPlanner,
    config: StoreConfig,
    events: broadcast::Sender<PipelineEvent>,
    cancel: CancellationToken,
}

impl MessagePipeline {
    /// Assemble a pipeline from its collaborators
    pub fn new(
        store: Arc<BlobStore>,
        cache: Arc<crate::render_cache::RenderCache>,
        scanner: Arc<SecurityScanner>,
        recovery: Arc<RecoveryEngine>,
        limits: Arc<dyn MessageLimits>,
        transport: Option<Arc<dyn Transport>>,
        config: StoreConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            db: store.metadata_db(),
            store,
            cache,
            scanner,
            recovery,
            limits,
            transport,
            planner: FetchPlanner::new(config.fetch.clone()),
            config,
            events,
            cancel: CancellationToken::new(),
        }
    }

    /// Subscribe to pipeline events
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    /// Event sender shared with the downloader
    pub fn event_sender(&self) -> broadcast::Sender<PipelineEvent> {
        self.events.clone()
    }

    /// Token that cancels every in-flight run when triggered
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Process one message end to end
    ///
    /// The run races the configured hard timeout and the cancellation token;
    /// the losing branch is dropped, which abandons any in-flight step at
    /// its next await point.
    ///
    /// Fatal failures (size guard, unparseable message, RAW persistence)
    /// surface as errors after a `Failed` state event; per-part problems
    /// accumulate into the summary instead.
    pub async fn process_message(
        &self,
        request: ProcessingRequest,
    ) -> StoreResult<ProcessingSummary> {
        let message_id = request.message_id;
        let timeout = Duration::from_millis(self.config.fetch.pipeline_timeout_ms);
        tokio::select! {
            result = self.run_pipeline(request) => {
                if result.is_err() {
                    self.set_state(message_id, ProcessingState::Failed);
                }
                result
            }
            _ = tokio::time::sleep(timeout) => {
                self.set_state(message_id, ProcessingState::Failed);
                Err(StoreError::Timeout(format!(
                    "processing of {message_id} exceeded {} ms",
                    timeout.as_millis()
                )))
            }
            _ = self.cancel.cancelled() => {
                self.set_state(message_id, ProcessingState::Failed);
                Err(StoreError::Internal(format!(
                    "processing of {message_id} was cancelled"
                )))
            }
        }
    }

    async fn run_pipeline(&self, request: ProcessingRequest) -> StoreResult<ProcessingSummary> {
        let started = Instant::now();
        let message_id = request.message_id;
        let mut warnings: Vec<String> = Vec::new();
        let mut errors: Vec<String> = Vec::new();
        self.set_state(message_id, ProcessingState::Pending);

        // Step 1: cache probe.
        if self
            .cache
            .has_valid_cache(message_id, self.config.render_cache.generator_version)?
        {
            debug!(message_id = %message_id, "serving processing summary from cache");
            let summary = ProcessingSummary {
                message_id,
                status: ProcessingState::Completed,
                bytes_stored: 0,
                attachment_count: self.db.list_attachments(message_id)?.len(),
                secure_parts_count: 0,
                duration_ms: started.elapsed().as_millis() as u64,
                errors,
                warnings,
                from_cache: true,
            };
            let _ = self.events.send(PipelineEvent::Completed {
                summary: summary.clone(),
            });
            return Ok(summary);
        }

        // Step 2: size guard.
        match self.limits.check_message_size(request.raw_bytes.len() as u64) {
            LimitCheck::Exceeded(msg) => {
                return Err(StoreError::SizeExceeded(msg));
            }
            LimitCheck::Warning(msg) => warnings.push(msg),
            LimitCheck::Ok => {}
        }

        // Step 3: RAW persistence, before anything failable downstream.
        let mut bytes_stored: u64 = 0;
        let raw_context = format!("store-raw:{message_id}");
        let raw_bytes = request.raw_bytes.clone();
        let raw_blob_id = self
            .recovery
            .run_with_retry(&raw_context, || {
                let bytes = raw_bytes.clone();
                async move { self.store.store(&bytes).await }
            })
            .await?;
        bytes_stored += request.raw_bytes.len() as u64;

        let headers = mime::parse_header_summary(&request.raw_bytes).unwrap_or_default();
        self.db.upsert_message(&MessageRecord {
            id: message_id,
            account_id: request.identity.account_id.clone(),
            mailbox: request.identity.folder.clone(),
            uid: request.identity.uid,
            raw_rfc822_blob_id: raw_blob_id.clone(),
            subject: headers.subject,
            from_addr: headers.from,
            has_attachments: false,
        })?;

        // Step 4: parse into the flat part list.
        self.set_state(message_id, ProcessingState::Parsing);
        let parts = match &request.structure {
            Some(structure) => {
                let mut assembled =
                    mime::assemble_from_structure(structure, &request.prefetched_sections);
                self.fetch_missing_sections(&request, structure, &mut assembled, &mut warnings)
                    .await;
                assembled
            }
            None => mime::parse_full(&request.raw_bytes)?,
        };
        for parsed in &parts {
            self.db.upsert_mime_part(message_id, &parsed.part)?;
        }

        // Step 5: secure-part detection. Detection only; crypto stays behind
        // the verifier capability and never gates rendering.
        let part_meta: Vec<MimePart> = parts.iter().map(|p| p.part.clone()).collect();
        let secure = detect_secure_parts(&part_meta);
        if secure.has_secure_parts() {
            let posture = if secure.is_fully_encrypted {
                "encrypted"
            } else if secure.is_fully_signed {
                "signed"
            } else {
                "secure"
            };
            warnings.push(format!(
                "message carries {} {posture} part(s); cryptographic verification is not wired",
                secure.parts.len()
            ));
        }

        // Step 6: body selection.
        let selection = self.select_body_part(&parts, request.body_strategy, &mut warnings);
        let selected_part_id = selection.as_ref().map(|s| s.part_id.clone());

        // Step 7: attachments, bounded fan-out; all complete before step 8.
        self.set_state(message_id, ProcessingState::Scanning);
        let outcomes = self
            .process_attachments(message_id, &parts, selected_part_id.as_deref(), &secure)
            .await;
        let mut attachment_count = 0;
        for outcome in outcomes {
            if outcome.error.is_none() && outcome.warning.is_none() {
                attachment_count += 1;
            }
            bytes_stored += outcome.stored_bytes;
            if let Some(warning) = outcome.warning {
                let _ = self.events.send(PipelineEvent::Warning {
                    message_id,
                    detail: warning.clone(),
                });
                warnings.push(warning);
            }
            if let Some(error) = outcome.error {
                errors.push(format!("part {}: {error}", outcome.part_id));
            }
        }
        if attachment_count > 0 {
            if let Some(mut record) = self.db.get_message(message_id)? {
                record.has_attachments = true;
                self.db.upsert_message(&record)?;
            }
        }

        // Step 8: HTML finalization.
        self.set_state(message_id, ProcessingState::Rendering);
        let (html_rendered, text_rendered) =
            self.finalize_body(message_id, &parts, selection, &mut warnings);

        // Step 9: cache materialization (idempotent; retried locally).
        if html_rendered.is_some() || text_rendered.is_some() {
            let cache_context = format!("cache:{message_id}");
            let html = html_rendered.clone();
            let text = text_rendered.clone();
            self.recovery
                .run_with_retry(&cache_context, || {
                    let html = html.clone();
                    let text = text.clone();
                    async move {
                        self.cache
                            .store(
                                message_id,
                                html.as_deref(),
                                text.as_deref(),
                                self.config.render_cache.generator_version,
                            )
                            .await
                    }
                })
                .await?;
        } else {
            warnings.push("no displayable body found; only the raw view is available".to_owned());
        }

        // Step 10: summary.
        let status = if errors.is_empty() {
            ProcessingState::Completed
        } else {
            ProcessingState::PartialSuccess
        };
        self.set_state(message_id, status);
        let summary = ProcessingSummary {
            message_id,
            status,
            bytes_stored,
            attachment_count,
            secure_parts_count: secure.parts.len(),
            duration_ms: started.elapsed().as_millis().max(1) as u64,
            errors,
            warnings,
            from_cache: false,
        };
        info!(
            message_id = %message_id,
            status = ?summary.status,
            bytes_stored = summary.bytes_stored,
            attachments = summary.attachment_count,
            duration_ms = summary.duration_ms,
            "message processed"
        );
        let _ = self.events.send(PipelineEvent::Completed {
            summary: summary.clone(),
        });
        Ok(summary)
    }

    /// Fetch immediate-plan sections that were not prefetched
    ///
    /// Runs only when a transport is wired; a missing transport leaves the
    /// parts unfetched and lets the downloader pick them up later.
    async fn fetch_missing_sections(
        &self,
        request: &ProcessingRequest,
        structure: &BodyStructure,
        parts: &mut [ParsedPart],
        warnings: &mut Vec<String>,
    ) {
        let Some(transport) = &self.transport else {
            return;
        };
        self.set_state(request.message_id, ProcessingState::Fetching);
        let plan = self.planner.plan(structure, FetchStrategy::Standard);
        for spec in &plan.sections {
            let Some(parsed) = parts.iter_mut().find(|p| p.part.part_id == spec.part_id) else {
                continue;
            };
            if parsed.bytes.is_some() {
                continue;
            }
            let context = format!("fetch:{}:{}", request.message_id, spec.part_id);
            let fetched = self
                .recovery
                .run_with_retry(&context, || {
                    transport.fetch_section(&request.identity, &spec.section_id)
                })
                .await;
            match fetched {
                Ok(raw) => {
                    match mime::decode_transfer(&raw, parsed.part.transfer_encoding.as_deref()) {
                        Ok(decoded) => {
                            parsed.part.size_octets = decoded.len() as u64;
                            parsed.bytes = Some(decoded);
                        }
                        Err(e) => warnings.push(format!(
                            "section {} could not be decoded: {e}",
                            spec.part_id
                        )),
                    }
                }
                Err(e) => {
                    warn!(part_id = %spec.part_id, error = %e, "section fetch failed");
                    warnings.push(format!("section {} could not be fetched: {e}", spec.part_id));
                }
            }
        }
    }

    /// Build candidates from decodable body parts and run selection
    fn select_body_part(
        &self,
        parts: &[ParsedPart],
        strategy: BodySelectionStrategy,
        warnings: &mut Vec<String>,
    ) -> Option<BodySelection> {
        let mut candidates = Vec::new();
        for parsed in parts {
            if !parsed.part.is_body_candidate {
                continue;
            }
            let Some(bytes) = &parsed.bytes else {
                continue;
            };
            match mime::decode_charset(bytes, parsed.part.charset.as_deref()) {
                Ok(content) => candidates.push(BodyCandidate {
                    part: parsed.part.clone(),
                    content,
                }),
                Err(e) => {
                    warnings.push(format!(
                        "body part {} skipped: {e}",
                        parsed.part.part_id
                    ));
                }
            }
        }
        let selection = select_body(&candidates, strategy);
        if let Some(chosen) = &selection {
            debug!(
                part_id = %chosen.part_id,
                score = chosen.score,
                reason = %chosen.reason,
                "body selected"
            );
        }
        selection
    }

    /// Scan and store every attachment part under the bounded task group
    async fn process_attachments(
        &self,
        message_id: Uuid,
        parts: &[ParsedPart],
        selected_part_id: Option<&str>,
        secure: &crate::secure::SecureDetectionResult,
    ) -> Vec<AttachmentOutcome> {
        let semaphore = Arc::new(Semaphore::new(self.config.fetch.attachment_concurrency.max(1)));
        let attachable: Vec<ParsedPart> = parts
            .iter()
            .filter(|p| {
                !p.part.media_type.starts_with("multipart/")
                    && !p.part.is_body_candidate
                    && Some(p.part.part_id.as_str()) != selected_part_id
                    && (p.bytes.is_some() || p.part.size_octets > 0)
            })
            .cloned()
            .collect();

        let tasks = attachable.into_iter().map(|parsed| {
            let semaphore = Arc::clone(&semaphore);
            let secure_filename = secure
                .parts
                .iter()
                .find(|s| s.part_id == parsed.part.part_id)
                .map(|s| s.filename.clone());
            async move {
                let _permit = match semaphore.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return AttachmentOutcome {
                            part_id: parsed.part.part_id.clone(),
                            stored_bytes: 0,
                            warning: None,
                            error: Some("attachment task group closed".to_owned()),
                        };
                    }
                };
                self.process_one_attachment(message_id, parsed, secure_filename)
                    .await
            }
        });
        futures::future::join_all(tasks).await
    }

    /// Scan, store, and persist one attachment part
    async fn process_one_attachment(
        &self,
        message_id: Uuid,
        parsed: ParsedPart,
        secure_filename: Option<String>,
    ) -> AttachmentOutcome {
        let part = &parsed.part;
        let part_id = part.part_id.clone();
        let filename = secure_filename
            .or_else(|| part.filename_normalized.clone())
            .or_else(|| {
                classify_media_type(&part.media_type)
                    .map(|kind| kind.canonical_filename().to_owned())
            })
            .unwrap_or_else(|| format!("part-{part_id}"));
        let is_inline = part.is_inline();

        let mut attachment = Attachment {
            id: 0,
            message_id,
            part_id: part_id.clone(),
            filename: filename.clone(),
            media_type: part.media_type.clone(),
            size_bytes: part.size_octets,
            blob_id: None,
            content_id: part.content_id.clone(),
            is_inline,
            scan_status: ScanStatus::Pending,
        };

        let Some(bytes) = parsed.bytes else {
            // Deferred part: row only, the downloader fills in the blob.
            return match self.db.insert_attachment(&attachment) {
                Ok(_) => AttachmentOutcome {
                    part_id,
                    stored_bytes: 0,
                    warning: None,
                    error: None,
                },
                Err(e) => AttachmentOutcome {
                    part_id,
                    stored_bytes: 0,
                    warning: None,
                    error: Some(e.to_string()),
                },
            };
        };

        if let LimitCheck::Exceeded(msg) = self.limits.check_attachment_size(bytes.len() as u64) {
            return AttachmentOutcome {
                part_id,
                stored_bytes: 0,
                warning: Some(format!("attachment '{filename}' skipped: {msg}")),
                error: None,
            };
        }

        let outcome = match self
            .scanner
            .scan(&bytes, &part.media_type, Some(&filename))
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                return AttachmentOutcome {
                    part_id,
                    stored_bytes: 0,
                    warning: Some(format!("attachment '{filename}' skipped: {e}")),
                    error: None,
                };
            }
        };
        if outcome.status == ScanStatus::Infected {
            attachment.scan_status = ScanStatus::Infected;
            let _ = self.db.insert_attachment(&attachment);
            return AttachmentOutcome {
                part_id,
                stored_bytes: 0,
                warning: Some(format!(
                    "attachment '{filename}' rejected by scanner: {}",
                    outcome.threat_name.as_deref().unwrap_or("unnamed threat")
                )),
                error: None,
            };
        }
        // A scanner-backend failure surfaces as scan_error and is treated as
        // pending for download-gating purposes.
        let effective_status = if outcome.status == ScanStatus::ScanError {
            ScanStatus::Pending
        } else {
            outcome.status
        };

        let stored = self
            .store
            .store_safe(&bytes, self.config.fetch.max_attachment_size)
            .await;
        match stored {
            Ok(blob_id) => {
                attachment.blob_id = Some(blob_id.clone());
                attachment.scan_status = effective_status;
                attachment.size_bytes = bytes.len() as u64;
                let persisted = self
                    .store
                    .mark_scanned(&blob_id, effective_status, outcome.threat_name.as_deref())
                    .await
                    .and_then(|()| self.db.insert_attachment(&attachment))
                    .and_then(|_| self.db.bind_part_blob(message_id, &part_id, &blob_id));
                match persisted {
                    Ok(()) => AttachmentOutcome {
                        part_id,
                        stored_bytes: bytes.len() as u64,
                        warning: None,
                        error: None,
                    },
                    Err(e) => AttachmentOutcome {
                        part_id,
                        stored_bytes: bytes.len() as u64,
                        warning: None,
                        error: Some(e.to_string()),
                    },
                }
            }
            Err(e) => AttachmentOutcome {
                part_id,
                stored_bytes: 0,
                warning: None,
                error: Some(e.to_string()),
            },
        }
    }

    /// Produce the final html/text pair for the artifact
    fn finalize_body(
        &self,
        message_id: Uuid,
        parts: &[ParsedPart],
        selection: Option<BodySelection>,
        warnings: &mut Vec<String>,
    ) -> (Option<String>, Option<String>) {
        let Some(selection) = selection else {
            return (None, None);
        };

        let plain_alternative = parts
            .iter()
            .filter(|p| {
                p.part.is_body_candidate
                    && p.part.media_type == "text/plain"
                    && p.part.part_id != selection.part_id
            })
            .find_map(|p| {
                p.bytes
                    .as_ref()
                    .and_then(|b| mime::decode_charset(b, p.part.charset.as_deref()).ok())
            });

        if selection.media_type == "text/html" {
            let known_cids: HashSet<String> = parts
                .iter()
                .filter_map(|p| p.part.content_id.clone())
                .collect();
            let (rewritten, cid_warnings) =
                rewrite_cid_references(&selection.content, message_id, &known_cids);
            warnings.extend(cid_warnings);
            let sanitized = sanitize_html(&rewritten, &self.config.security);
            warnings.extend(sanitized.warnings);
            let text = plain_alternative.or_else(|| derive_text_from_html(&sanitized.html));
            (Some(sanitized.html), text)
        } else {
            (None, Some(selection.content))
        }
    }

    /// Resolve an inline part by Content-ID to its bytes
    ///
    /// This is what the virtual `/mail/{message_id}/cid/{content_id}` URLs
    /// resolve through. The read path enforces quarantine and scan status.
    pub async fn get_inline_content(
        &self,
        message_id: Uuid,
        content_id: &str,
    ) -> StoreResult<Option<(Attachment, Vec<u8>)>> {
        let Some(attachment) = self.db.get_attachment_by_cid(message_id, content_id)? else {
            return Ok(None);
        };
        let Some(blob_id) = attachment.blob_id.as_deref() else {
            return Ok(None);
        };
        match self.store.retrieve_safe(blob_id).await? {
            Some(bytes) => Ok(Some((attachment, bytes))),
            None => Ok(None),
        }
    }

    /// Resolve an attachment by part id to its bytes
    pub async fn get_attachment_content(
        &self,
        message_id: Uuid,
        part_id: &str,
    ) -> StoreResult<Option<(Attachment, Vec<u8>)>> {
        let Some(attachment) = self.db.get_attachment_by_part(message_id, part_id)? else {
            return Ok(None);
        };
        let Some(blob_id) = attachment.blob_id.as_deref() else {
            return Ok(None);
        };
        match self.store.retrieve_safe(blob_id).await? {
            Some(bytes) => Ok(Some((attachment, bytes))),
            None => Ok(None),
        }
    }

    /// Raw RFC 822 bytes of a message (the technical view)
    ///
    /// Available even after a hard processing failure because RAW persists
    /// before any failable later step.
    pub async fn get_raw_message(&self, message_id: Uuid) -> StoreResult<Option<Vec<u8>>> {
        let Some(record) = self.db.get_message(message_id)? else {
            return Ok(None);
        };
        self.store.retrieve(&record.raw_rfc822_blob_id).await
    }

    fn set_state(&self, message_id: Uuid, state: ProcessingState) {
        let _ = self
            .events
            .send(PipelineEvent::StateChanged { message_id, state });
    }
}
