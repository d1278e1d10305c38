//! Core data model shared across the store
//!
//! Defines the records that flow between the blob store, the metadata
//! database, the processing pipeline, and the render cache. Component-local
//! types (fetch plans, body selection, scan outcomes) live next to their
//! logic; this module holds only the shapes more than one component touches.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{StoreError, StoreResult};

/// Server-side identity of a message
///
/// `(account_id, folder, uid)` uniquely identifies a message on a server.
/// The local identity is a 128-bit [`Uuid`]; the `messages` table maintains
/// the stable one-to-one mapping between the two within an account lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageIdentity {
    /// Account identifier
    pub account_id: String,
    /// Folder/mailbox name (may contain colons)
    pub folder: String,
    /// Message UID within the folder
    pub uid: u32,
}

impl MessageIdentity {
    /// Create a new identity
    pub fn new(account_id: impl Into<String>, folder: impl Into<String>, uid: u32) -> Self {
        Self {
            account_id: account_id.into(),
            folder: folder.into(),
            uid,
        }
    }

    /// Encode identity to its canonical string form
    ///
    /// # Example
    ///
    /// ```text
    /// mail:default:INBOX:42
    /// ```
    pub fn encode(&self) -> String {
        format!("mail:{}:{}:{}", self.account_id, self.folder, self.uid)
    }

    /// Parse an identity from its canonical string form
    ///
    /// The folder segment may contain colons internally; all segments between
    /// the account id and the trailing uid are rejoined.
    pub fn parse(raw: &str) -> StoreResult<Self> {
        let mut parts: Vec<&str> = raw.split(':').collect();
        if parts.len() < 4 {
            return Err(StoreError::invalid(
                "message identity must have at least 4 segments",
            ));
        }
        if parts[0] != "mail" {
            return Err(StoreError::invalid("message identity must start with 'mail'"));
        }

        let uid = parts
            .pop()
            .ok_or_else(|| StoreError::invalid("missing uid"))?
            .parse::<u32>()
            .map_err(|_| StoreError::invalid("invalid uid in message identity"))?;
        let account_id = parts
            .get(1)
            .ok_or_else(|| StoreError::invalid("missing account_id"))?
            .to_string();
        let folder = parts[2..].join(":");
        if folder.is_empty() {
            return Err(StoreError::invalid("message identity folder cannot be empty"));
        }

        Ok(Self {
            account_id,
            folder,
            uid,
        })
    }
}

/// Per-blob metadata record
///
/// One row per distinct content hash. The file at `base_dir/relative_path`
/// exists whenever the row exists outside GC quiescence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobMeta {
    /// Lowercase hex SHA-256 of the stored bytes (64 characters)
    pub blob_id: String,
    /// Size of the stored bytes
    pub size_bytes: u64,
    /// Path relative to the base directory: `aa/bb/<blob_id>`
    pub relative_path: String,
    /// Number of owners; zero means collectable
    pub ref_count: u64,
    /// When the blob was first stored
    pub created_at: DateTime<Utc>,
    /// Last retrieval or dedup-store touch
    pub last_accessed_at: DateTime<Utc>,
    /// Whether the blob currently lives under `quarantine/`
    pub quarantined: bool,
}

/// Scan verdict for stored content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    /// Not yet scanned
    Pending,
    /// Scanned and clean
    Clean,
    /// Threat detected
    Infected,
    /// Moved to quarantine
    Quarantined,
    /// Scanner failed; treated as pending for download purposes
    ScanError,
    /// Scanning intentionally skipped (e.g. scanner disabled)
    Skipped,
}

impl ScanStatus {
    /// Whether content with this status may be handed to callers
    pub fn is_allowed_to_download(self) -> bool {
        matches!(self, Self::Clean | Self::Pending | Self::Skipped)
    }

    /// Stable database/JSON representation
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Clean => "clean",
            Self::Infected => "infected",
            Self::Quarantined => "quarantined",
            Self::ScanError => "scan_error",
            Self::Skipped => "skipped",
        }
    }

    /// Parse the database/JSON representation
    pub fn parse(raw: &str) -> StoreResult<Self> {
        match raw {
            "pending" => Ok(Self::Pending),
            "clean" => Ok(Self::Clean),
            "infected" => Ok(Self::Infected),
            "quarantined" => Ok(Self::Quarantined),
            "scan_error" => Ok(Self::ScanError),
            "skipped" => Ok(Self::Skipped),
            other => Err(StoreError::invalid(format!("unknown scan status '{other}'"))),
        }
    }
}

/// Scan record persisted alongside a blob
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRecord {
    /// Content address of the scanned blob
    pub hash: String,
    /// Verdict
    pub scan_status: ScanStatus,
    /// When the scan ran
    pub scan_date: DateTime<Utc>,
    /// Optional engine details or threat name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Sidecar metadata written next to a quarantined blob
///
/// Field names match the on-disk JSON contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuarantineRecord {
    /// Content address of the quarantined blob
    pub original_hash: String,
    /// When the blob was quarantined
    pub quarantine_date: DateTime<Utc>,
    /// Why it was quarantined
    pub reason: String,
}

/// Content disposition of a MIME part
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Disposition {
    /// Displayed within the body
    Inline,
    /// Offered as a downloadable file
    Attachment,
}

/// One node of a parsed MIME tree
///
/// Parts form a tree through `parent` part ids rather than object
/// references; the flat list plus dotted paths is sufficient to reconstruct
/// the hierarchy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MimePart {
    /// RFC 3501 dotted section path ("1", "1.2", ...)
    pub part_id: String,
    /// Section path of the enclosing multipart, if any
    pub parent: Option<String>,
    /// Lowercased media type, e.g. `text/html`
    pub media_type: String,
    /// Declared charset parameter, lowercased
    pub charset: Option<String>,
    /// Declared Content-Transfer-Encoding, lowercased
    pub transfer_encoding: Option<String>,
    /// Declared disposition, if any
    pub disposition: Option<Disposition>,
    /// Filename exactly as declared (possibly RFC 2047 encoded)
    pub filename_raw: Option<String>,
    /// Decoded and sanitized filename
    pub filename_normalized: Option<String>,
    /// Content-ID with angle brackets stripped
    pub content_id: Option<String>,
    /// Declared or measured size in octets
    pub size_octets: u64,
    /// Whether this part may serve as the displayed body
    pub is_body_candidate: bool,
    /// Content address once the part's bytes have been stored
    pub blob_id: Option<String>,
}

impl MimePart {
    /// Compute body-candidate status from media type and disposition
    ///
    /// A part is a body candidate iff its media type is one of the
    /// displayable text types and it is not explicitly an attachment.
    pub fn compute_body_candidate(media_type: &str, disposition: Option<Disposition>) -> bool {
        let displayable = matches!(
            media_type,
            "text/plain" | "text/html" | "text/enriched"
        );
        displayable && disposition != Some(Disposition::Attachment)
    }

    /// Whether the part is an inline part by disposition or Content-ID
    pub fn is_inline(&self) -> bool {
        self.disposition == Some(Disposition::Inline) || self.content_id.is_some()
    }
}

/// Attachment row bound to a stored blob
///
/// An attachment owns one reference to its blob: creation increments the
/// blob's refcount, deletion decrements it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    /// Database row id (0 before insertion)
    pub id: i64,
    /// Local message identity
    pub message_id: Uuid,
    /// Section path within the message
    pub part_id: String,
    /// Normalized filename
    pub filename: String,
    /// Lowercased media type
    pub media_type: String,
    /// Decoded size in bytes
    pub size_bytes: u64,
    /// Content address in the blob store, once downloaded
    pub blob_id: Option<String>,
    /// Content-ID for inline resolution
    pub content_id: Option<String>,
    /// Inline by disposition or by carrying a Content-ID
    pub is_inline: bool,
    /// Latest scan verdict
    pub scan_status: ScanStatus,
}

/// Message row persisted before any failable pipeline step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Local 128-bit identity
    pub id: Uuid,
    /// Account identifier
    pub account_id: String,
    /// Folder/mailbox name
    pub mailbox: String,
    /// Message UID within the folder
    pub uid: u32,
    /// Content address of the raw RFC 822 bytes
    pub raw_rfc822_blob_id: String,
    /// Decoded Subject header
    pub subject: Option<String>,
    /// Decoded From header
    pub from_addr: Option<String>,
    /// Whether any non-body parts were found
    pub has_attachments: bool,
}

/// Finalized render artifact for a message
///
/// At least one of `html_rendered`/`text_rendered` is non-empty when stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderArtifact {
    /// Local message identity
    pub message_id: Uuid,
    /// Sanitized HTML body, if the message has one
    pub html_rendered: Option<String>,
    /// Plain-text body (parsed or derived from HTML)
    pub text_rendered: Option<String>,
    /// When the artifact was produced
    pub generated_at: DateTime<Utc>,
    /// Pipeline revision that produced it
    pub generator_version: u32,
}

/// Processing task state machine
///
/// `Pending → Fetching → Parsing → Scanning → Rendering` followed by exactly
/// one terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingState {
    /// Queued, not yet started
    Pending,
    /// Retrieving missing sections via the transport
    Fetching,
    /// Building the MIME tree
    Parsing,
    /// Scanning and storing attachments
    Scanning,
    /// Finalizing HTML and materializing the cache
    Rendering,
    /// All steps succeeded
    Completed,
    /// Body rendered but one or more parts failed softly
    PartialSuccess,
    /// A fatal error aborted processing
    Failed,
}

impl ProcessingState {
    /// Whether this is a terminal state
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::PartialSuccess | Self::Failed)
    }
}

/// Outcome summary returned by the pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingSummary {
    /// Local message identity
    pub message_id: Uuid,
    /// Terminal state the task reached
    pub status: ProcessingState,
    /// Total bytes newly written to the blob store
    pub bytes_stored: u64,
    /// Attachments persisted
    pub attachment_count: usize,
    /// Secure (S/MIME / PGP) parts detected
    pub secure_parts_count: usize,
    /// Wall-clock processing duration in milliseconds
    pub duration_ms: u64,
    /// Hard errors encountered (coded strings)
    pub errors: Vec<String>,
    /// Soft warnings accumulated along the way
    pub warnings: Vec<String>,
    /// Whether the summary was served from the render cache
    pub from_cache: bool,
}

/// Event published on the pipeline's broadcast channel
///
/// The UI layer subscribes; nothing in the core depends on a receiver being
/// present.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// The task moved to a new state
    StateChanged {
        /// Message being processed
        message_id: Uuid,
        /// New state
        state: ProcessingState,
    },
    /// A chunked download advanced
    DownloadProgress {
        /// Message being downloaded
        message_id: Uuid,
        /// Section path of the part
        part_id: String,
        /// Bytes received so far
        current_offset: u64,
        /// Expected total
        total_size: u64,
    },
    /// A non-fatal problem was recorded
    Warning {
        /// Message being processed
        message_id: Uuid,
        /// Human-readable description
        detail: String,
    },
    /// Processing finished; the summary is final
    Completed {
        /// Outcome summary
        summary: ProcessingSummary,
    },
}

#[cfg(test)]
mod tests {
    use super::{Disposition, MessageIdentity, MimePart, ProcessingState, ScanStatus};

    #[test]
    fn identity_round_trips_and_preserves_colons_in_folder() {
        let id = MessageIdentity::new("acct", "Projects:2026:Q1", 7);
        let encoded = id.encode();
        assert_eq!(encoded, "mail:acct:Projects:2026:Q1:7");
        let parsed = MessageIdentity::parse(&encoded).expect("parse succeeds");
        assert_eq!(parsed, id);
    }

    #[test]
    fn identity_rejects_wrong_prefix() {
        let err = MessageIdentity::parse("imap:a:INBOX:1").expect_err("must fail");
        assert!(err.to_string().contains("must start with 'mail'"));
    }

    #[test]
    fn scan_status_download_gate() {
        assert!(ScanStatus::Clean.is_allowed_to_download());
        assert!(ScanStatus::Pending.is_allowed_to_download());
        assert!(ScanStatus::Skipped.is_allowed_to_download());
        assert!(!ScanStatus::Infected.is_allowed_to_download());
        assert!(!ScanStatus::Quarantined.is_allowed_to_download());
        assert!(!ScanStatus::ScanError.is_allowed_to_download());
    }

    #[test]
    fn scan_status_round_trips_through_string_form() {
        for status in [
            ScanStatus::Pending,
            ScanStatus::Clean,
            ScanStatus::Infected,
            ScanStatus::Quarantined,
            ScanStatus::ScanError,
            ScanStatus::Skipped,
        ] {
            assert_eq!(ScanStatus::parse(status.as_str()).expect("parses"), status);
        }
    }

    #[test]
    fn body_candidate_requires_text_type_and_non_attachment_disposition() {
        assert!(MimePart::compute_body_candidate("text/plain", None));
        assert!(MimePart::compute_body_candidate(
            "text/html",
            Some(Disposition::Inline)
        ));
        assert!(MimePart::compute_body_candidate("text/enriched", None));
        assert!(!MimePart::compute_body_candidate(
            "text/html",
            Some(Disposition::Attachment)
        ));
        assert!(!MimePart::compute_body_candidate("image/png", None));
        assert!(!MimePart::compute_body_candidate("application/pdf", None));
    }

    #[test]
    fn terminal_states_are_flagged() {
        assert!(ProcessingState::Completed.is_terminal());
        assert!(ProcessingState::PartialSuccess.is_terminal());
        assert!(ProcessingState::Failed.is_terminal());
        assert!(!ProcessingState::Rendering.is_terminal());
        assert!(!ProcessingState::Pending.is_terminal());
    }
}
