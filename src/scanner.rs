//! Pre-store content security checks
//!
//! The scanner runs before any attachment or downloaded part reaches the
//! blob store: a size ceiling, magic-number sniffing with executable
//! coercion, archive bomb heuristics, and an optional asynchronous backend
//! hook. Filename sanitization for untrusted declared names also lives here.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::errors::{StoreError, StoreResult};
use crate::models::ScanStatus;

/// Extensions that are never served under their original name
///
/// A sanitized filename with one of these extensions gets `.txt` appended so
/// no platform treats the stored file as directly executable.
const BLOCKED_EXTENSIONS: &[&str] = &[
    "exe", "scr", "com", "vbs", "js", "cmd", "bat", "pif", "jar", "app", "dmg", "pkg", "deb",
    "rpm",
];

/// Maximum declared-uncompressed to compressed ratio tolerated for archives
const MAX_ARCHIVE_RATIO: u64 = 100;
/// Maximum nested-archive depth tolerated
const MAX_ARCHIVE_DEPTH: u32 = 3;
/// Maximum sanitized filename length, extension included
const MAX_FILENAME_LEN: usize = 255;

/// Result of a pre-store scan
#[derive(Debug, Clone)]
pub struct ScanOutcome {
    /// Verdict to record against the stored blob
    pub status: ScanStatus,
    /// Threat name when the verdict is `Infected`
    pub threat_name: Option<String>,
    /// Media type after sniffing and coercion
    pub effective_media_type: String,
}

/// Optional backend scanner capability
///
/// The core never requires one; when absent the built-in checks alone decide
/// and the verdict is `Skipped` rather than `Clean`.
#[async_trait]
pub trait ScanBackend: Send + Sync {
    /// Scan decoded content; return a verdict
    async fn scan(&self, bytes: &[u8], media_type: &str) -> StoreResult<ScanOutcome>;
}

/// Security scanner consumed by the pipeline and the downloader
pub struct SecurityScanner {
    /// Ceiling for a single scanned object
    max_attachment_size: u64,
    /// Optional backend engine
    backend: Option<Arc<dyn ScanBackend>>,
}

impl SecurityScanner {
    /// Create a scanner with only the built-in checks
    pub fn new(max_attachment_size: u64) -> Self {
        Self {
            max_attachment_size,
            backend: None,
        }
    }

    /// Create a scanner that consults a backend after the built-in checks
    pub fn with_backend(max_attachment_size: u64, backend: Arc<dyn ScanBackend>) -> Self {
        Self {
            max_attachment_size,
            backend: Some(backend),
        }
    }

    /// Scan content prior to storage
    ///
    /// Order of checks: size ceiling, magic sniff + executable coercion,
    /// archive heuristics, then the backend hook if one is wired. Backend
    /// failures degrade to `ScanError` (treated as pending downstream)
    /// rather than blocking the pipeline.
    ///
    /// # Errors
    ///
    /// Returns `SizeExceeded` when the object is over the ceiling; heuristic
    /// rejections are reported through the `Infected` status instead so the
    /// caller can skip the part and keep processing.
    pub async fn scan(
        &self,
        bytes: &[u8],
        declared_media_type: &str,
        filename: Option<&str>,
    ) -> StoreResult<ScanOutcome> {
        if bytes.len() as u64 > self.max_attachment_size {
            return Err(StoreError::SizeExceeded(format!(
                "content of {} bytes exceeds scan ceiling of {} bytes",
                bytes.len(),
                self.max_attachment_size
            )));
        }

        let declared = declared_media_type.to_ascii_lowercase();
        let sniffed = sniff_media_type(bytes);
        let effective_media_type = match sniffed {
            Some("application/vnd.microsoft.portable-executable")
                if declared != "application/vnd.microsoft.portable-executable" =>
            {
                warn!(
                    declared = %declared,
                    filename = filename.unwrap_or("<none>"),
                    "declared type hides an executable; coercing"
                );
                "application/octet-stream".to_owned()
            }
            _ => declared.clone(),
        };

        if let Some(kind) = sniffed
            && is_archive_type(kind)
            && let Some(threat) = archive_violation(bytes, kind)
        {
            return Ok(ScanOutcome {
                status: ScanStatus::Infected,
                threat_name: Some(threat),
                effective_media_type,
            });
        }

        match &self.backend {
            Some(backend) => match backend.scan(bytes, &effective_media_type).await {
                Ok(mut outcome) => {
                    outcome.effective_media_type = effective_media_type;
                    Ok(outcome)
                }
                Err(e) => {
                    warn!(error = %e, "backend scanner failed; degrading to scan_error");
                    Ok(ScanOutcome {
                        status: ScanStatus::ScanError,
                        threat_name: None,
                        effective_media_type,
                    })
                }
            },
            None => {
                debug!(media_type = %effective_media_type, "no scan backend; built-in checks only");
                Ok(ScanOutcome {
                    status: ScanStatus::Skipped,
                    threat_name: None,
                    effective_media_type,
                })
            }
        }
    }
}

/// Sniff a media type from magic numbers
///
/// Recognizes at minimum zip, rar, gzip, bzip2, 7z, PE, JPEG, PNG, and PDF.
pub fn sniff_media_type(bytes: &[u8]) -> Option<&'static str> {
    if bytes.len() >= 2 && bytes[0] == 0x4D && bytes[1] == 0x5A {
        return Some("application/vnd.microsoft.portable-executable");
    }
    let kind = infer::get(bytes)?;
    match kind.mime_type() {
        "application/zip" => Some("application/zip"),
        "application/vnd.rar" => Some("application/vnd.rar"),
        "application/gzip" => Some("application/gzip"),
        "application/x-bzip2" => Some("application/x-bzip2"),
        "application/x-7z-compressed" => Some("application/x-7z-compressed"),
        "application/vnd.microsoft.portable-executable" => {
            Some("application/vnd.microsoft.portable-executable")
        }
        "image/jpeg" => Some("image/jpeg"),
        "image/png" => Some("image/png"),
        "application/pdf" => Some("application/pdf"),
        _ => None,
    }
}

fn is_archive_type(mime: &str) -> bool {
    matches!(
        mime,
        "application/zip"
            | "application/vnd.rar"
            | "application/gzip"
            | "application/x-bzip2"
            | "application/x-7z-compressed"
    )
}

/// Check archive heuristics; return a threat description on violation
///
/// Only zip archives carry enough declared metadata for a cheap header walk;
/// other archive formats pass through to the backend (if any).
fn archive_violation(bytes: &[u8], kind: &str) -> Option<String> {
    if kind != "application/zip" {
        return None;
    }
    match inspect_zip(bytes, 1) {
        ZipVerdict::Ok => None,
        ZipVerdict::RatioExceeded { ratio } => Some(format!(
            "archive declares a {ratio}:1 expansion ratio (limit {MAX_ARCHIVE_RATIO}:1)"
        )),
        ZipVerdict::TooDeep { depth } => Some(format!(
            "archive nesting depth {depth} exceeds limit {MAX_ARCHIVE_DEPTH}"
        )),
    }
}

enum ZipVerdict {
    Ok,
    RatioExceeded { ratio: u64 },
    TooDeep { depth: u32 },
}

/// Walk zip local file headers, summing declared sizes
///
/// Recurses into STORED (method 0) nested archives, which are readable in
/// place; a compressed nested archive counts as one additional depth level
/// without recursion. Entries with zero declared compressed size are skipped
/// for the ratio computation.
fn inspect_zip(bytes: &[u8], depth: u32) -> ZipVerdict {
    if depth > MAX_ARCHIVE_DEPTH {
        return ZipVerdict::TooDeep { depth };
    }

    let mut total_compressed: u64 = 0;
    let mut total_uncompressed: u64 = 0;
    let mut offset = 0usize;

    while offset + 30 <= bytes.len() {
        if &bytes[offset..offset + 4] != b"PK\x03\x04" {
            match find_signature(&bytes[offset..]) {
                Some(rel) => {
                    offset += rel;
                    continue;
                }
                None => break,
            }
        }

        let header = &bytes[offset..];
        let method = u16_le(header, 8);
        let compressed = u32_le(header, 18) as u64;
        let uncompressed = u32_le(header, 22) as u64;
        let name_len = u16_le(header, 26) as usize;
        let extra_len = u16_le(header, 28) as usize;
        let data_start = offset + 30 + name_len + extra_len;
        let name = bytes
            .get(offset + 30..offset + 30 + name_len)
            .map(|n| String::from_utf8_lossy(n).to_string())
            .unwrap_or_default();

        if compressed > 0 {
            total_compressed += compressed;
            total_uncompressed += uncompressed;
        }

        if has_archive_extension(&name) {
            if method == 0 {
                if let Some(entry) = bytes.get(data_start..data_start + compressed as usize) {
                    match inspect_zip(entry, depth + 1) {
                        ZipVerdict::Ok => {}
                        violation => return violation,
                    }
                }
            } else if depth + 1 > MAX_ARCHIVE_DEPTH {
                return ZipVerdict::TooDeep { depth: depth + 1 };
            }
        }

        offset = data_start.saturating_add(compressed as usize).max(offset + 4);
    }

    if total_compressed > 0 {
        let ratio = total_uncompressed / total_compressed;
        if ratio > MAX_ARCHIVE_RATIO {
            return ZipVerdict::RatioExceeded { ratio };
        }
    }
    ZipVerdict::Ok
}

fn find_signature(window: &[u8]) -> Option<usize> {
    window
        .windows(4)
        .skip(1)
        .position(|w| w == b"PK\x03\x04")
        .map(|p| p + 1)
}

fn has_archive_extension(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    [".zip", ".rar", ".7z", ".gz", ".bz2", ".tar"]
        .iter()
        .any(|ext| lower.ends_with(ext))
}

fn u16_le(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

fn u32_le(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

/// Sanitize an untrusted declared filename
///
/// Strips path components, replaces characters outside `[A-Za-z0-9_\-.]`
/// with underscores, truncates to 255 characters while preserving the
/// extension, and appends `.txt` when the original extension is in the
/// hard-blocked set.
pub fn sanitize_filename(raw: &str) -> String {
    let basename = raw
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(raw)
        .trim();
    if basename.is_empty() {
        return "unnamed".to_owned();
    }

    let mut cleaned: String = basename
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    cleaned = cleaned.trim_matches('.').to_owned();
    if cleaned.is_empty() {
        return "unnamed".to_owned();
    }

    let extension = cleaned
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase());

    if cleaned.len() > MAX_FILENAME_LEN {
        cleaned = match &extension {
            Some(ext) if !ext.is_empty() && ext.len() + 1 < MAX_FILENAME_LEN => {
                let stem_len = MAX_FILENAME_LEN - ext.len() - 1;
                let stem: String = cleaned.chars().take(stem_len).collect();
                format!("{stem}.{ext}")
            }
            _ => cleaned.chars().take(MAX_FILENAME_LEN).collect(),
        };
    }

    if let Some(ext) = extension
        && BLOCKED_EXTENSIONS.contains(&ext.as_str())
    {
        cleaned.push_str(".txt");
    }
    cleaned
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{ScanBackend, ScanOutcome, SecurityScanner, sanitize_filename, sniff_media_type};
    use crate::errors::{StoreError, StoreResult};
    use crate::models::ScanStatus;

    #[test]
    fn sanitize_strips_paths_and_bad_characters() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("C:\\Users\\x\\doc.pdf"), "doc.pdf");
        assert_eq!(sanitize_filename("my file (1).pdf"), "my_file__1_.pdf");
        assert_eq!(sanitize_filename("  "), "unnamed");
    }

    #[test]
    fn sanitize_blocks_executable_extensions() {
        assert_eq!(sanitize_filename("payload.exe"), "payload.exe.txt");
        assert_eq!(sanitize_filename("setup.SCR"), "setup.SCR.txt");
        assert_eq!(sanitize_filename("notes.txt"), "notes.txt");
        assert_eq!(sanitize_filename("tool.jar"), "tool.jar.txt");
    }

    #[test]
    fn sanitize_truncates_while_preserving_extension() {
        let long = format!("{}.pdf", "a".repeat(400));
        let cleaned = sanitize_filename(&long);
        assert_eq!(cleaned.len(), 255);
        assert!(cleaned.ends_with(".pdf"));
    }

    #[test]
    fn sniffs_common_magic_numbers() {
        assert_eq!(
            sniff_media_type(b"MZ\x90\x00rest-of-pe"),
            Some("application/vnd.microsoft.portable-executable")
        );
        assert_eq!(
            sniff_media_type(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0]),
            Some("image/png")
        );
        assert_eq!(sniff_media_type(b"%PDF-1.7 ..."), Some("application/pdf"));
        assert_eq!(
            sniff_media_type(&[0x1F, 0x8B, 0x08, 0, 0, 0, 0, 0]),
            Some("application/gzip")
        );
        assert_eq!(sniff_media_type(b"plain old text"), None);
    }

    #[tokio::test]
    async fn oversized_content_is_rejected() {
        let scanner = SecurityScanner::new(16);
        let err = scanner
            .scan(&[0u8; 32], "application/pdf", None)
            .await
            .expect_err("must exceed ceiling");
        assert!(matches!(err, StoreError::SizeExceeded(_)));
    }

    #[tokio::test]
    async fn executables_are_coerced_to_octet_stream() {
        let scanner = SecurityScanner::new(1024);
        let outcome = scanner
            .scan(b"MZ\x90\x00fake-pe-bytes", "image/png", Some("cat.png"))
            .await
            .expect("scan runs");
        assert_eq!(outcome.effective_media_type, "application/octet-stream");
        assert_eq!(outcome.status, ScanStatus::Skipped);
    }

    #[tokio::test]
    async fn zip_bomb_ratio_is_flagged_infected() {
        // One local header declaring a 1000:1 expansion.
        let mut zip = Vec::new();
        zip.extend_from_slice(b"PK\x03\x04");
        zip.extend_from_slice(&[0u8; 4]); // version + flags
        zip.extend_from_slice(&8u16.to_le_bytes()); // method: deflate
        zip.extend_from_slice(&[0u8; 8]); // time/date/crc
        zip.extend_from_slice(&10u32.to_le_bytes()); // compressed
        zip.extend_from_slice(&10_000u32.to_le_bytes()); // uncompressed
        zip.extend_from_slice(&1u16.to_le_bytes()); // name len
        zip.extend_from_slice(&0u16.to_le_bytes()); // extra len
        zip.push(b'a');
        zip.extend_from_slice(&[0u8; 10]); // compressed payload

        let scanner = SecurityScanner::new(1024 * 1024);
        let outcome = scanner
            .scan(&zip, "application/zip", Some("bomb.zip"))
            .await
            .expect("scan runs");
        assert_eq!(outcome.status, ScanStatus::Infected);
        assert!(
            outcome
                .threat_name
                .as_deref()
                .is_some_and(|t| t.contains("expansion ratio"))
        );
    }

    struct AlwaysInfected;

    #[async_trait::async_trait]
    impl ScanBackend for AlwaysInfected {
        async fn scan(&self, _bytes: &[u8], _media_type: &str) -> StoreResult<ScanOutcome> {
            Ok(ScanOutcome {
                status: ScanStatus::Infected,
                threat_name: Some("EICAR-Test".to_owned()),
                effective_media_type: String::new(),
            })
        }
    }

    struct FailingBackend;

    #[async_trait::async_trait]
    impl ScanBackend for FailingBackend {
        async fn scan(&self, _bytes: &[u8], _media_type: &str) -> StoreResult<ScanOutcome> {
            Err(StoreError::Internal("engine offline".to_owned()))
        }
    }

    #[tokio::test]
    async fn backend_verdict_is_propagated() {
        let scanner = SecurityScanner::with_backend(1024, Arc::new(AlwaysInfected));
        let outcome = scanner
            .scan(b"some payload", "application/pdf", None)
            .await
            .expect("scan runs");
        assert_eq!(outcome.status, ScanStatus::Infected);
        assert_eq!(outcome.threat_name.as_deref(), Some("EICAR-Test"));
        assert_eq!(outcome.effective_media_type, "application/pdf");
    }

    #[tokio::test]
    async fn backend_failure_degrades_to_scan_error() {
        let scanner = SecurityScanner::with_backend(1024, Arc::new(FailingBackend));
        let outcome = scanner
            .scan(b"some payload", "application/pdf", None)
            .await
            .expect("scan runs");
        assert_eq!(outcome.status, ScanStatus::ScanError);
    }
}
