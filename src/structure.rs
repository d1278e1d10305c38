//! Server-reported body structure model
//!
//! Represents the structural description a server returns for a message
//! before any content has been fetched. The transport layer produces this
//! tree; the fetch planner and the pipeline consume it. Flattening assigns
//! RFC 3501 dotted section paths: the root is "1", children of a multipart
//! are "parent.1", "parent.2", and the multipart container itself keeps its
//! own path.

use serde::{Deserialize, Serialize};

use crate::models::{Disposition, MimePart};

/// Dotted section path within a message's MIME tree
///
/// Each segment addresses one level of nesting. An empty segment list means
/// the message root and renders as "1".
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SectionPath {
    /// One-based indices, outermost first
    pub segments: Vec<u32>,
}

impl SectionPath {
    /// Path of the message root
    pub fn root() -> Self {
        Self::default()
    }

    /// Child path with one more trailing segment
    pub fn child(&self, index: u32) -> Self {
        let mut segments = self.segments.clone();
        segments.push(index);
        Self { segments }
    }

    /// Render the dotted form used everywhere as `part_id`
    pub fn dotted(&self) -> String {
        if self.segments.is_empty() {
            "1".to_owned()
        } else {
            let mut out = String::from("1");
            for seg in &self.segments {
                out.push('.');
                out.push_str(&seg.to_string());
            }
            out
        }
    }

    /// Dotted form of the parent path, if this is not the root
    pub fn parent_dotted(&self) -> Option<String> {
        if self.segments.is_empty() {
            None
        } else {
            let parent = Self {
                segments: self.segments[..self.segments.len() - 1].to_vec(),
            };
            Some(parent.dotted())
        }
    }
}

/// Metadata the server reports for one leaf part
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PartInfo {
    /// Lowercased media type, e.g. `text/html`
    pub media_type: String,
    /// Declared charset parameter
    pub charset: Option<String>,
    /// Declared Content-Transfer-Encoding
    pub transfer_encoding: Option<String>,
    /// Declared disposition
    pub disposition: Option<Disposition>,
    /// Declared filename (possibly RFC 2047 encoded)
    pub filename: Option<String>,
    /// Content-ID with angle brackets stripped
    pub content_id: Option<String>,
    /// Declared size in octets
    pub size_octets: u64,
}

/// Server-reported structure of a message
///
/// Mirrors an IMAP BODYSTRUCTURE response without wire details: a tree of
/// multipart containers over leaf parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BodyStructure {
    /// A leaf part
    Part(PartInfo),
    /// A multipart container
    Multipart {
        /// Multipart subtype, lowercased (`alternative`, `related`, `mixed`, ...)
        subtype: String,
        /// Child parts in declared order
        children: Vec<BodyStructure>,
    },
}

impl BodyStructure {
    /// Flatten the tree into the part list the rest of the engine works with
    ///
    /// Containers appear in the output with a `multipart/<subtype>` media
    /// type so section paths remain addressable; leaves carry their declared
    /// metadata. The path assignment is stable across repeated flattening of
    /// the same structure.
    pub fn flatten(&self) -> Vec<MimePart> {
        let mut parts = Vec::new();
        self.flatten_into(&SectionPath::root(), &mut parts);
        parts
    }

    fn flatten_into(&self, path: &SectionPath, out: &mut Vec<MimePart>) {
        match self {
            Self::Part(info) => out.push(Self::leaf_to_part(info, path)),
            Self::Multipart { subtype, children } => {
                out.push(MimePart {
                    part_id: path.dotted(),
                    parent: path.parent_dotted(),
                    media_type: format!("multipart/{subtype}"),
                    charset: None,
                    transfer_encoding: None,
                    disposition: None,
                    filename_raw: None,
                    filename_normalized: None,
                    content_id: None,
                    size_octets: 0,
                    is_body_candidate: false,
                    blob_id: None,
                });
                for (idx, child) in children.iter().enumerate() {
                    let child_path = path.child(idx as u32 + 1);
                    child.flatten_into(&child_path, out);
                }
            }
        }
    }

    fn leaf_to_part(info: &PartInfo, path: &SectionPath) -> MimePart {
        let media_type = info.media_type.to_ascii_lowercase();
        let is_body_candidate = MimePart::compute_body_candidate(&media_type, info.disposition);
        MimePart {
            part_id: path.dotted(),
            parent: path.parent_dotted(),
            media_type,
            charset: info.charset.as_ref().map(|c| c.to_ascii_lowercase()),
            transfer_encoding: info
                .transfer_encoding
                .as_ref()
                .map(|e| e.to_ascii_lowercase()),
            disposition: info.disposition,
            filename_raw: info.filename.clone(),
            filename_normalized: None,
            content_id: info.content_id.clone(),
            size_octets: info.size_octets,
            is_body_candidate,
            blob_id: None,
        }
    }

    /// Sum of all declared leaf sizes
    pub fn estimated_size(&self) -> u64 {
        match self {
            Self::Part(info) => info.size_octets,
            Self::Multipart { children, .. } => children.iter().map(Self::estimated_size).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{BodyStructure, PartInfo, SectionPath};
    use crate::models::Disposition;

    fn text_part(media_type: &str, size: u64) -> BodyStructure {
        BodyStructure::Part(PartInfo {
            media_type: media_type.to_owned(),
            charset: Some("utf-8".to_owned()),
            size_octets: size,
            ..PartInfo::default()
        })
    }

    #[test]
    fn root_path_renders_as_one() {
        assert_eq!(SectionPath::root().dotted(), "1");
        assert_eq!(SectionPath::root().child(2).dotted(), "1.2");
        assert_eq!(SectionPath::root().child(2).child(1).dotted(), "1.2.1");
    }

    #[test]
    fn single_part_message_flattens_to_root() {
        let parts = text_part("text/plain", 120).flatten();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].part_id, "1");
        assert_eq!(parts[0].parent, None);
        assert!(parts[0].is_body_candidate);
    }

    #[test]
    fn multipart_container_keeps_its_own_path() {
        let structure = BodyStructure::Multipart {
            subtype: "alternative".to_owned(),
            children: vec![text_part("text/plain", 30), text_part("text/html", 2048)],
        };
        let parts = structure.flatten();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].part_id, "1");
        assert_eq!(parts[0].media_type, "multipart/alternative");
        assert_eq!(parts[1].part_id, "1.1");
        assert_eq!(parts[1].parent.as_deref(), Some("1"));
        assert_eq!(parts[2].part_id, "1.2");
        assert_eq!(parts[2].media_type, "text/html");
    }

    #[test]
    fn flattening_is_stable_across_reparses() {
        let structure = BodyStructure::Multipart {
            subtype: "mixed".to_owned(),
            children: vec![
                BodyStructure::Multipart {
                    subtype: "related".to_owned(),
                    children: vec![text_part("text/html", 900), text_part("image/png", 4000)],
                },
                BodyStructure::Part(PartInfo {
                    media_type: "application/pdf".to_owned(),
                    disposition: Some(Disposition::Attachment),
                    filename: Some("report.pdf".to_owned()),
                    size_octets: 90_000,
                    ..PartInfo::default()
                }),
            ],
        };
        let first: Vec<String> = structure.flatten().iter().map(|p| p.part_id.clone()).collect();
        let second: Vec<String> = structure.flatten().iter().map(|p| p.part_id.clone()).collect();
        assert_eq!(first, second);
        assert_eq!(first, vec!["1", "1.1", "1.1.1", "1.1.2", "1.2"]);
    }

    #[test]
    fn estimated_size_sums_leaves() {
        let structure = BodyStructure::Multipart {
            subtype: "mixed".to_owned(),
            children: vec![text_part("text/plain", 100), text_part("image/png", 4000)],
        };
        assert_eq!(structure.estimated_size(), 4100);
    }
}
