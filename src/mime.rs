//! Message parsing and MIME handling
//!
//! Produces the flat part list the pipeline works with, from either a full
//! RFC 822 byte sequence (via `mailparse`) or a server-reported structure
//! plus per-section byte sequences. Handles RFC 2047 encoded-word headers,
//! transfer decoding (base64, quoted-printable, identity), and the charset
//! fallbacks the store recognizes. The parser is single-pass: section byte
//! sequences are consumed exactly once.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::LazyLock;

use base64::Engine;
use mailparse::{DispositionType, ParsedMail};
use regex::Regex;

use crate::errors::{StoreError, StoreResult};
use crate::models::{Disposition, MimePart};
use crate::scanner;
use crate::structure::BodyStructure;

/// One parsed part: metadata plus decoded bytes for leaves
///
/// Multipart containers carry `None` bytes; leaves carry their
/// transfer-decoded payload.
#[derive(Debug, Clone)]
pub struct ParsedPart {
    /// Part metadata
    pub part: MimePart,
    /// Transfer-decoded bytes (leaves only)
    pub bytes: Option<Vec<u8>>,
}

/// Lightweight header summary for the `messages` table
#[derive(Debug, Clone, Default)]
pub struct HeaderSummary {
    /// Decoded Subject header
    pub subject: Option<String>,
    /// Decoded From header
    pub from: Option<String>,
}

static ENCODED_WORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"=\?([^?]+)\?([BbQq])\?([^?]*)\?=").unwrap_or_else(|_| unreachable!())
});

/// Parse a full RFC 822 message into the flat part list
///
/// Section paths follow the engine's convention: root "1", children
/// "parent.N". Decoding failures on individual parts are tolerated (the part
/// is emitted with empty bytes) so one broken part never loses the rest of
/// the message.
///
/// # Errors
///
/// - `Encoding` if `mailparse` rejects the message outright
pub fn parse_full(raw: &[u8]) -> StoreResult<Vec<ParsedPart>> {
    let parsed = mailparse::parse_mail(raw)
        .map_err(|e| StoreError::Encoding(format!("failed to parse RFC 822 message: {e}")))?;

    let mut parts = Vec::new();
    walk_parts(&parsed, "1".to_owned(), None, &mut parts);
    Ok(parts)
}

/// Walk the mailparse tree recursively
///
/// Assigns dotted section paths and collects decoded bytes for leaves.
fn walk_parts(
    part: &ParsedMail<'_>,
    part_id: String,
    parent: Option<String>,
    out: &mut Vec<ParsedPart>,
) {
    let media_type = part.ctype.mimetype.to_ascii_lowercase();
    let disp = part.get_content_disposition();
    let disposition = match disp.disposition {
        DispositionType::Attachment => Some(Disposition::Attachment),
        DispositionType::Inline => Some(Disposition::Inline),
        _ => None,
    };
    let filename_raw = disp
        .params
        .get("filename")
        .cloned()
        .or_else(|| part.ctype.params.get("name").cloned());
    let filename_normalized = filename_raw
        .as_deref()
        .map(decode_rfc2047)
        .map(|name| scanner::sanitize_filename(&name));
    let content_id = header_value(part, "Content-ID").map(|v| strip_angle_brackets(&v));
    let charset = part
        .ctype
        .params
        .get("charset")
        .map(|c| c.to_ascii_lowercase());
    let transfer_encoding =
        header_value(part, "Content-Transfer-Encoding").map(|v| v.trim().to_ascii_lowercase());

    if part.subparts.is_empty() {
        let bytes = part.get_body_raw().unwrap_or_default();
        let is_body_candidate = MimePart::compute_body_candidate(&media_type, disposition);
        out.push(ParsedPart {
            part: MimePart {
                part_id: part_id.clone(),
                parent,
                media_type,
                charset,
                transfer_encoding,
                disposition,
                filename_raw,
                filename_normalized,
                content_id,
                size_octets: bytes.len() as u64,
                is_body_candidate,
                blob_id: None,
            },
            bytes: Some(bytes),
        });
        return;
    }

    out.push(ParsedPart {
        part: MimePart {
            part_id: part_id.clone(),
            parent,
            media_type,
            charset: None,
            transfer_encoding: None,
            disposition: None,
            filename_raw: None,
            filename_normalized: None,
            content_id: None,
            size_octets: 0,
            is_body_candidate: false,
            blob_id: None,
        },
        bytes: None,
    });

    for (idx, sub) in part.subparts.iter().enumerate() {
        let next_id = format!("{part_id}.{}", idx + 1);
        walk_parts(sub, next_id, Some(part_id.clone()), out);
    }
}

/// Assemble parts from a server-reported structure and fetched sections
///
/// `sections` maps dotted part ids to the raw (still transfer-encoded) bytes
/// the transport delivered. Parts without a section entry are emitted with
/// `None` bytes so the planner can schedule them later. Each section byte
/// sequence is decoded exactly once.
///
/// A part whose declared transfer encoding cannot be decoded is emitted with
/// `None` bytes; the caller decides whether that is fatal.
pub fn assemble_from_structure(
    structure: &BodyStructure,
    sections: &HashMap<String, Vec<u8>>,
) -> Vec<ParsedPart> {
    structure
        .flatten()
        .into_iter()
        .map(|mut part| {
            if let Some(name) = part.filename_raw.as_deref() {
                let decoded = decode_rfc2047(name);
                part.filename_normalized = Some(scanner::sanitize_filename(&decoded));
            }
            let bytes = if part.media_type.starts_with("multipart/") {
                None
            } else {
                match sections.get(&part.part_id) {
                    Some(raw) => {
                        match decode_transfer(raw, part.transfer_encoding.as_deref()) {
                            Ok(decoded) => {
                                part.size_octets = decoded.len() as u64;
                                Some(decoded)
                            }
                            Err(e) => {
                                tracing::warn!(
                                    part_id = %part.part_id,
                                    error = %e,
                                    "failed to decode section transfer encoding"
                                );
                                None
                            }
                        }
                    }
                    None => None,
                }
            };
            ParsedPart { part, bytes }
        })
        .collect()
}

/// Decode a Content-Transfer-Encoding
///
/// Supports `base64`, `quoted-printable`, and the identity encodings
/// (`7bit`, `8bit`, `binary`, absent).
///
/// # Errors
///
/// Returns `Encoding` for malformed input or an unrecognized encoding name.
pub fn decode_transfer(raw: &[u8], encoding: Option<&str>) -> StoreResult<Vec<u8>> {
    match encoding.map(str::trim).map(str::to_ascii_lowercase).as_deref() {
        None | Some("") | Some("7bit") | Some("8bit") | Some("binary") => Ok(raw.to_vec()),
        Some("base64") => {
            let compact: Vec<u8> = raw
                .iter()
                .copied()
                .filter(|b| !b.is_ascii_whitespace())
                .collect();
            base64::engine::general_purpose::STANDARD
                .decode(&compact)
                .map_err(|e| StoreError::Encoding(format!("invalid base64 body: {e}")))
        }
        Some("quoted-printable") => decode_quoted_printable(raw, false),
        Some(other) => Err(StoreError::Encoding(format!(
            "unsupported transfer encoding '{other}'"
        ))),
    }
}

/// Decode quoted-printable bytes
///
/// `q_mode` enables the header variant where "_" means space. Soft line
/// breaks (`=` before CRLF/LF) vanish.
fn decode_quoted_printable(raw: &[u8], q_mode: bool) -> StoreResult<Vec<u8>> {
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        match raw[i] {
            b'=' => {
                if i + 1 < raw.len() && raw[i + 1] == b'\n' {
                    i += 2;
                } else if i + 2 < raw.len() && raw[i + 1] == b'\r' && raw[i + 2] == b'\n' {
                    i += 3;
                } else if i + 2 < raw.len() {
                    let hi = hex_val(raw[i + 1]);
                    let lo = hex_val(raw[i + 2]);
                    match (hi, lo) {
                        (Some(h), Some(l)) => {
                            out.push(h * 16 + l);
                            i += 3;
                        }
                        _ => {
                            return Err(StoreError::Encoding(
                                "invalid quoted-printable escape".to_owned(),
                            ));
                        }
                    }
                } else {
                    return Err(StoreError::Encoding(
                        "truncated quoted-printable escape".to_owned(),
                    ));
                }
            }
            b'_' if q_mode => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    Ok(out)
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'A'..=b'F' => Some(b - b'A' + 10),
        b'a'..=b'f' => Some(b - b'a' + 10),
        _ => None,
    }
}

/// Decode RFC 2047 encoded-words in a header value
///
/// Handles `=?charset?B?...?=` and `=?charset?Q?...?=` tokens, with "_"
/// interpreted as space in Q-encoding. Undecodable tokens are preserved
/// verbatim rather than dropped.
pub fn decode_rfc2047(input: &str) -> String {
    ENCODED_WORD
        .replace_all(input, |caps: &regex::Captures<'_>| {
            let charset = caps[1].to_ascii_lowercase();
            let bytes = match caps[2].to_ascii_uppercase().as_str() {
                "B" => base64::engine::general_purpose::STANDARD
                    .decode(caps[3].as_bytes())
                    .ok(),
                _ => decode_quoted_printable(caps[3].as_bytes(), true).ok(),
            };
            match bytes.and_then(|b| decode_charset(&b, Some(&charset)).ok()) {
                Some(decoded) => decoded,
                None => caps[0].to_owned(),
            }
        })
        .into_owned()
}

/// Decode bytes to text using the store's charset policy
///
/// `utf-8` (and absent/us-ascii) decode strictly; `iso-8859-1` and
/// `windows-1252` are the recognized fallbacks and never fail.
///
/// # Errors
///
/// Returns `Encoding` for invalid UTF-8 under a UTF-8 charset or for an
/// unrecognized charset name.
pub fn decode_charset(bytes: &[u8], charset: Option<&str>) -> StoreResult<String> {
    match charset.map(str::to_ascii_lowercase).as_deref() {
        None | Some("utf-8") | Some("utf8") | Some("us-ascii") | Some("ascii") => {
            String::from_utf8(bytes.to_vec())
                .map_err(|_| StoreError::Encoding("invalid utf-8 text".to_owned()))
        }
        Some("iso-8859-1") | Some("latin1") | Some("latin-1") => {
            Ok(bytes.iter().map(|&b| b as char).collect())
        }
        Some("windows-1252") | Some("cp1252") => Ok(bytes.iter().copied().map(cp1252_char).collect()),
        Some(other) => Err(StoreError::Encoding(format!(
            "unsupported charset '{other}'"
        ))),
    }
}

/// Map one windows-1252 byte to its character
///
/// The 0x80..0x9F range differs from latin-1; everything else is identical.
fn cp1252_char(b: u8) -> char {
    match b {
        0x80 => '\u{20AC}',
        0x82 => '\u{201A}',
        0x83 => '\u{0192}',
        0x84 => '\u{201E}',
        0x85 => '\u{2026}',
        0x86 => '\u{2020}',
        0x87 => '\u{2021}',
        0x88 => '\u{02C6}',
        0x89 => '\u{2030}',
        0x8A => '\u{0160}',
        0x8B => '\u{2039}',
        0x8C => '\u{0152}',
        0x8E => '\u{017D}',
        0x91 => '\u{2018}',
        0x92 => '\u{2019}',
        0x93 => '\u{201C}',
        0x94 => '\u{201D}',
        0x95 => '\u{2022}',
        0x96 => '\u{2013}',
        0x97 => '\u{2014}',
        0x98 => '\u{02DC}',
        0x99 => '\u{2122}',
        0x9A => '\u{0161}',
        0x9B => '\u{203A}',
        0x9C => '\u{0153}',
        0x9E => '\u{017E}',
        0x9F => '\u{0178}',
        other => other as char,
    }
}

/// Parse the Subject and From headers from raw message bytes
///
/// Cheap header-only parse used to populate the `messages` row before any
/// failable pipeline step runs.
pub fn parse_header_summary(raw: &[u8]) -> StoreResult<HeaderSummary> {
    let (headers, _) = mailparse::parse_headers(raw)
        .map_err(|e| StoreError::Encoding(format!("failed to parse message headers: {e}")))?;

    let mut map = BTreeMap::new();
    for header in headers {
        let key = header.get_key().to_ascii_lowercase();
        map.entry(key).or_insert_with(|| header.get_value());
    }

    Ok(HeaderSummary {
        subject: map.get("subject").map(|s| decode_rfc2047(s)),
        from: map.get("from").map(|s| decode_rfc2047(s)),
    })
}

fn header_value(part: &ParsedMail<'_>, name: &str) -> Option<String> {
    part.headers.iter().find_map(|h| {
        if h.get_key().eq_ignore_ascii_case(name) {
            Some(h.get_value())
        } else {
            None
        }
    })
}

fn strip_angle_brackets(value: &str) -> String {
    value
        .trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .to_owned()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::{
        assemble_from_structure, decode_charset, decode_rfc2047, decode_transfer, parse_full,
        parse_header_summary,
    };
    use crate::errors::StoreError;
    use crate::models::Disposition;
    use crate::structure::{BodyStructure, PartInfo};

    const MULTIPART_RAW: &[u8] = b"From: sender@example.com\r\n\
To: user@example.com\r\n\
Subject: =?utf-8?Q?Caf=C3=A9_menu?=\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/alternative; boundary=\"b1\"\r\n\
\r\n\
--b1\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
Hello plain\r\n\
--b1\r\n\
Content-Type: text/html; charset=utf-8\r\n\
\r\n\
<p>Hello html</p>\r\n\
--b1--\r\n";

    #[test]
    fn parses_multipart_alternative_with_stable_paths() {
        let parts = parse_full(MULTIPART_RAW).expect("parse succeeds");
        let ids: Vec<&str> = parts.iter().map(|p| p.part.part_id.as_str()).collect();
        assert_eq!(ids, vec!["1", "1.1", "1.2"]);
        assert_eq!(parts[0].part.media_type, "multipart/alternative");
        assert!(parts[1].part.is_body_candidate);
        assert_eq!(
            parts[2].bytes.as_deref(),
            Some(b"<p>Hello html</p>\r\n".as_slice())
        );
    }

    #[test]
    fn header_summary_decodes_encoded_words() {
        let summary = parse_header_summary(MULTIPART_RAW).expect("headers parse");
        assert_eq!(summary.subject.as_deref(), Some("Caf\u{e9} menu"));
        assert_eq!(summary.from.as_deref(), Some("sender@example.com"));
    }

    #[test]
    fn rfc2047_q_encoding_treats_underscore_as_space() {
        assert_eq!(decode_rfc2047("=?utf-8?Q?hello_world?="), "hello world");
        assert_eq!(
            decode_rfc2047("=?iso-8859-1?Q?caf=E9?="),
            "caf\u{e9}"
        );
    }

    #[test]
    fn rfc2047_b_encoding_decodes_base64() {
        assert_eq!(decode_rfc2047("=?utf-8?B?aGVsbG8=?="), "hello");
    }

    #[test]
    fn rfc2047_preserves_undecodable_tokens() {
        let input = "=?utf-8?B?!!notbase64!!?=";
        assert_eq!(decode_rfc2047(input), input);
    }

    #[test]
    fn transfer_decoding_covers_base64_and_quoted_printable() {
        let b64 = decode_transfer(b"aGVs\r\nbG8=", Some("base64")).expect("base64 decodes");
        assert_eq!(b64, b"hello");

        let qp = decode_transfer(b"caf=C3=A9=\r\n done", Some("quoted-printable"))
            .expect("qp decodes");
        assert_eq!(qp, "caf\u{e9} done".as_bytes());

        let identity = decode_transfer(b"as-is", Some("7bit")).expect("identity passes through");
        assert_eq!(identity, b"as-is");
    }

    #[test]
    fn invalid_encodings_surface_as_encoding_errors() {
        let err = decode_transfer(b"%%%", Some("base64")).expect_err("must fail");
        assert!(matches!(err, StoreError::Encoding(_)));

        let err = decode_transfer(b"bad=Z9", Some("quoted-printable")).expect_err("must fail");
        assert!(matches!(err, StoreError::Encoding(_)));

        let err = decode_transfer(b"data", Some("uuencode")).expect_err("must fail");
        assert!(matches!(err, StoreError::Encoding(_)));
    }

    #[test]
    fn charset_fallbacks_never_fail() {
        assert_eq!(
            decode_charset(&[0x63, 0x61, 0x66, 0xE9], Some("iso-8859-1")).expect("latin1"),
            "caf\u{e9}"
        );
        assert_eq!(
            decode_charset(&[0x80, 0x93], Some("windows-1252")).expect("cp1252"),
            "\u{20AC}\u{201C}"
        );
        assert!(decode_charset(&[0xFF, 0xFE], None).is_err());
    }

    #[test]
    fn assembles_from_structure_with_prefetched_sections() {
        let structure = BodyStructure::Multipart {
            subtype: "mixed".to_owned(),
            children: vec![
                BodyStructure::Part(PartInfo {
                    media_type: "text/plain".to_owned(),
                    transfer_encoding: Some("quoted-printable".to_owned()),
                    size_octets: 20,
                    ..PartInfo::default()
                }),
                BodyStructure::Part(PartInfo {
                    media_type: "application/pdf".to_owned(),
                    transfer_encoding: Some("base64".to_owned()),
                    disposition: Some(Disposition::Attachment),
                    filename: Some("=?utf-8?Q?caf=C3=A9_report.pdf?=".to_owned()),
                    size_octets: 8,
                    ..PartInfo::default()
                }),
            ],
        };

        let mut sections = HashMap::new();
        sections.insert("1.1".to_owned(), b"hello=20world".to_vec());
        sections.insert("1.2".to_owned(), b"JVBERg==".to_vec());

        let parts = assemble_from_structure(&structure, &sections);
        assert_eq!(parts.len(), 3);
        assert!(parts[0].bytes.is_none());
        assert_eq!(parts[1].bytes.as_deref(), Some(b"hello world".as_slice()));
        assert_eq!(parts[2].bytes.as_deref(), Some(b"%PDF".as_slice()));
        let filename = parts[2].part.filename_normalized.as_deref().expect("name set");
        assert!(filename.contains("report.pdf"), "got {filename}");
    }

    #[test]
    fn missing_sections_leave_bytes_unset() {
        let structure = BodyStructure::Part(PartInfo {
            media_type: "text/plain".to_owned(),
            size_octets: 10,
            ..PartInfo::default()
        });
        let parts = assemble_from_structure(&structure, &HashMap::new());
        assert_eq!(parts.len(), 1);
        assert!(parts[0].bytes.is_none());
    }
}
