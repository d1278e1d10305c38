//! Fetch planning
//!
//! Maps a server-reported body structure, a strategy, and optional runtime
//! signals (connection speed, estimated message size) onto a prioritized set
//! of sections to retrieve now versus later, including chunked plans for
//! large sections and grouping hints for the transport layer.

use serde::{Deserialize, Serialize};

use crate::config::FetchConfig;
use crate::models::MimePart;
use crate::structure::BodyStructure;

/// Sections below this size rank as "small files" in priority ordering
const SMALL_FILE_LIMIT: u64 = 100 * 1024;
/// Attachments at or above this size are penalized further
const HUGE_ATTACHMENT_LIMIT: u64 = 5 * 1024 * 1024;

/// Named fetch strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchStrategy {
    /// Best body candidate only
    Minimal,
    /// Body and inline images now, other attachments later
    Standard,
    /// Everything now
    Complete,
    /// Body now, all attachments later
    Lazy,
    /// Serve from cache only; fetch nothing
    Offline,
}

/// Observed connection quality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionSpeed {
    /// No connectivity
    Offline,
    /// Constrained link
    Slow,
    /// Ordinary link
    Medium,
    /// Unconstrained link
    Fast,
}

/// Runtime signals feeding adaptive strategy selection
#[derive(Debug, Clone)]
pub struct AdaptiveSignals {
    /// Observed connection quality
    pub speed: ConnectionSpeed,
    /// Estimated total message size in bytes
    pub estimated_message_size: u64,
    /// Strategy the user configured for unconstrained conditions
    pub user_preference: FetchStrategy,
}

/// Why a section is being fetched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionPurpose {
    /// Displayable body part
    Body,
    /// Image referenced from the body by Content-ID
    InlineImage,
    /// Regular attachment
    Attachment,
}

/// One section the plan wants fetched
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectionSpec {
    /// Dotted part path
    pub part_id: String,
    /// Section identifier handed to the transport (same dotted path)
    pub section_id: String,
    /// Declared size in octets
    pub expected_size: u64,
    /// Lowercased media type
    pub media_type: String,
    /// Why the planner wants it
    pub purpose: SectionPurpose,
    /// Higher fetches first
    pub priority: i32,
}

/// One ranged fetch of a large section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialFetchSpec {
    /// Dotted part path
    pub part_id: String,
    /// Byte offset of the chunk
    pub offset: u64,
    /// Chunk length
    pub length: u64,
}

/// Output of planning: what to fetch now, what to defer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchPlan {
    /// Sections to fetch immediately, highest priority first
    pub sections: Vec<SectionSpec>,
    /// Sections to fetch on demand later
    pub deferred: Vec<SectionSpec>,
    /// Serve from cache only; the transport must not be touched
    pub cache_only: bool,
}

impl FetchPlan {
    fn cache_only() -> Self {
        Self {
            sections: Vec::new(),
            deferred: Vec::new(),
            cache_only: true,
        }
    }
}

/// Strategy-driven fetch planner
#[derive(Debug, Clone)]
pub struct FetchPlanner {
    config: FetchConfig,
}

impl FetchPlanner {
    /// Create a planner with the given fetch settings
    pub fn new(config: FetchConfig) -> Self {
        Self { config }
    }

    /// Pick a strategy from runtime signals
    ///
    /// Offline always wins; a slow link downgrades to lazy for large
    /// messages and minimal otherwise; a fast link honors the user
    /// preference; anything else lands on standard.
    pub fn adaptive_strategy(&self, signals: &AdaptiveSignals) -> FetchStrategy {
        match signals.speed {
            ConnectionSpeed::Offline => FetchStrategy::Offline,
            ConnectionSpeed::Slow => {
                if signals.estimated_message_size > self.config.large_attachment_threshold {
                    FetchStrategy::Lazy
                } else {
                    FetchStrategy::Minimal
                }
            }
            ConnectionSpeed::Fast => signals.user_preference,
            ConnectionSpeed::Medium => FetchStrategy::Standard,
        }
    }

    /// Build a fetch plan for a structure under a strategy
    pub fn plan(&self, structure: &BodyStructure, strategy: FetchStrategy) -> FetchPlan {
        if strategy == FetchStrategy::Offline {
            return FetchPlan::cache_only();
        }

        let parts: Vec<MimePart> = structure
            .flatten()
            .into_iter()
            .filter(|p| !p.media_type.starts_with("multipart/"))
            .collect();
        let best_body = best_body_part_id(&parts);

        let mut sections = Vec::new();
        let mut deferred = Vec::new();
        for part in &parts {
            let spec = self.section_spec(part, best_body.as_deref());
            let is_best_body = best_body.as_deref() == Some(part.part_id.as_str());
            let immediate = match strategy {
                FetchStrategy::Minimal => is_best_body,
                FetchStrategy::Complete => true,
                FetchStrategy::Lazy => is_best_body,
                FetchStrategy::Standard => {
                    is_best_body || spec.purpose == SectionPurpose::InlineImage
                }
                FetchStrategy::Offline => false,
            };
            if immediate {
                sections.push(spec);
            } else if strategy != FetchStrategy::Minimal {
                deferred.push(spec);
            }
        }

        sections.sort_by(|a, b| b.priority.cmp(&a.priority));
        FetchPlan {
            sections,
            deferred,
            cache_only: false,
        }
    }

    /// Chunked plan for a large section, ascending offsets
    ///
    /// Sections at or below the large-attachment threshold come back as a
    /// single full-range fetch.
    pub fn partial_plan(&self, part_id: &str, total_size: u64) -> Vec<PartialFetchSpec> {
        if total_size == 0 {
            return Vec::new();
        }
        if total_size <= self.config.large_attachment_threshold {
            return vec![PartialFetchSpec {
                part_id: part_id.to_owned(),
                offset: 0,
                length: total_size,
            }];
        }

        let chunk = self.config.chunk_size.max(1);
        let mut specs = Vec::new();
        let mut offset = 0;
        while offset < total_size {
            let length = chunk.min(total_size - offset);
            specs.push(PartialFetchSpec {
                part_id: part_id.to_owned(),
                offset,
                length,
            });
            offset += length;
        }
        specs
    }

    /// Group adjacent immediate sections for one multi-section fetch
    ///
    /// A group's cumulative expected size stays at or below the configured
    /// ceiling; an oversized single section forms its own group. Purely an
    /// optimization hint for the transport layer.
    pub fn group_sections(&self, sections: &[SectionSpec]) -> Vec<Vec<SectionSpec>> {
        let mut groups: Vec<Vec<SectionSpec>> = Vec::new();
        let mut current: Vec<SectionSpec> = Vec::new();
        let mut current_size = 0u64;

        for spec in sections {
            if !current.is_empty() && current_size + spec.expected_size > self.config.group_max_bytes
            {
                groups.push(std::mem::take(&mut current));
                current_size = 0;
            }
            current_size += spec.expected_size;
            current.push(spec.clone());
        }
        if !current.is_empty() {
            groups.push(current);
        }
        groups
    }

    fn section_spec(&self, part: &MimePart, best_body: Option<&str>) -> SectionSpec {
        let purpose = if part.is_body_candidate {
            SectionPurpose::Body
        } else if part.is_inline() && part.media_type.starts_with("image/") {
            SectionPurpose::InlineImage
        } else {
            SectionPurpose::Attachment
        };
        SectionSpec {
            part_id: part.part_id.clone(),
            section_id: part.part_id.clone(),
            expected_size: part.size_octets,
            media_type: part.media_type.clone(),
            purpose,
            priority: section_priority(part, purpose, best_body),
        }
    }
}

/// Priority within the immediate set; higher fetches first
///
/// Body first (html beats plain), then inline images, then small files;
/// attachments are penalized, very large ones further.
fn section_priority(part: &MimePart, purpose: SectionPurpose, best_body: Option<&str>) -> i32 {
    match purpose {
        SectionPurpose::Body => {
            let base = match part.media_type.as_str() {
                "text/html" => 100,
                "text/plain" => 90,
                _ => 85,
            };
            if best_body == Some(part.part_id.as_str()) {
                base + 5
            } else {
                base
            }
        }
        SectionPurpose::InlineImage => 80,
        SectionPurpose::Attachment => {
            if part.size_octets < SMALL_FILE_LIMIT {
                60
            } else if part.size_octets >= HUGE_ATTACHMENT_LIMIT {
                20
            } else {
                40
            }
        }
    }
}

/// Part id of the preferred body candidate, html beating plain
fn best_body_part_id(parts: &[MimePart]) -> Option<String> {
    let rank = |media: &str| match media {
        "text/html" => 2,
        "text/plain" => 1,
        _ => 0,
    };
    parts
        .iter()
        .filter(|p| p.is_body_candidate)
        .max_by_key(|p| rank(&p.media_type))
        .map(|p| p.part_id.clone())
}

#[cfg(test)]
mod tests {
    use super::{
        AdaptiveSignals, ConnectionSpeed, FetchPlanner, FetchStrategy, SectionPurpose,
    };
    use crate::config::FetchConfig;
    use crate::models::Disposition;
    use crate::structure::{BodyStructure, PartInfo};

    fn planner() -> FetchPlanner {
        FetchPlanner::new(FetchConfig::default())
    }

    fn rich_structure() -> BodyStructure {
        BodyStructure::Multipart {
            subtype: "mixed".to_owned(),
            children: vec![
                BodyStructure::Multipart {
                    subtype: "related".to_owned(),
                    children: vec![
                        BodyStructure::Multipart {
                            subtype: "alternative".to_owned(),
                            children: vec![
                                BodyStructure::Part(PartInfo {
                                    media_type: "text/plain".to_owned(),
                                    size_octets: 800,
                                    ..PartInfo::default()
                                }),
                                BodyStructure::Part(PartInfo {
                                    media_type: "text/html".to_owned(),
                                    size_octets: 4_000,
                                    ..PartInfo::default()
                                }),
                            ],
                        },
                        BodyStructure::Part(PartInfo {
                            media_type: "image/png".to_owned(),
                            disposition: Some(Disposition::Inline),
                            content_id: Some("logo@x".to_owned()),
                            size_octets: 10_000,
                            ..PartInfo::default()
                        }),
                    ],
                },
                BodyStructure::Part(PartInfo {
                    media_type: "application/pdf".to_owned(),
                    disposition: Some(Disposition::Attachment),
                    filename: Some("report.pdf".to_owned()),
                    size_octets: 6 * 1024 * 1024,
                    ..PartInfo::default()
                }),
            ],
        }
    }

    #[test]
    fn minimal_fetches_only_the_best_body() {
        let plan = planner().plan(&rich_structure(), FetchStrategy::Minimal);
        assert!(!plan.cache_only);
        assert_eq!(plan.sections.len(), 1);
        assert_eq!(plan.sections[0].media_type, "text/html");
        assert!(plan.deferred.is_empty());
    }

    #[test]
    fn standard_defers_plain_attachments_but_takes_inline_images() {
        let plan = planner().plan(&rich_structure(), FetchStrategy::Standard);
        let immediate: Vec<&str> = plan.sections.iter().map(|s| s.media_type.as_str()).collect();
        assert!(immediate.contains(&"text/html"));
        assert!(immediate.contains(&"image/png"));
        assert!(!immediate.contains(&"application/pdf"));
        assert!(
            plan.deferred
                .iter()
                .any(|s| s.media_type == "application/pdf")
        );
    }

    #[test]
    fn complete_takes_every_leaf_and_lazy_defers_all_attachments() {
        let complete = planner().plan(&rich_structure(), FetchStrategy::Complete);
        assert_eq!(complete.sections.len(), 4);
        assert!(complete.deferred.is_empty());

        let lazy = planner().plan(&rich_structure(), FetchStrategy::Lazy);
        assert_eq!(lazy.sections.len(), 1);
        assert_eq!(lazy.sections[0].purpose, SectionPurpose::Body);
        assert_eq!(lazy.deferred.len(), 3);
    }

    #[test]
    fn offline_is_cache_only() {
        let plan = planner().plan(&rich_structure(), FetchStrategy::Offline);
        assert!(plan.cache_only);
        assert!(plan.sections.is_empty());
        assert!(plan.deferred.is_empty());
    }

    #[test]
    fn priorities_order_body_before_images_before_attachments() {
        let plan = planner().plan(&rich_structure(), FetchStrategy::Complete);
        let kinds: Vec<SectionPurpose> = plan.sections.iter().map(|s| s.purpose).collect();
        assert_eq!(kinds[0], SectionPurpose::Body);
        assert_eq!(kinds[1], SectionPurpose::Body);
        assert_eq!(kinds[2], SectionPurpose::InlineImage);
        assert_eq!(kinds[3], SectionPurpose::Attachment);
        // html body outranks plain body; huge attachment is penalized hardest
        assert_eq!(plan.sections[0].media_type, "text/html");
        assert_eq!(plan.sections[3].priority, 20);
    }

    #[test]
    fn adaptive_rules_follow_the_decision_table() {
        let planner = planner();
        let mut signals = AdaptiveSignals {
            speed: ConnectionSpeed::Offline,
            estimated_message_size: 0,
            user_preference: FetchStrategy::Complete,
        };
        assert_eq!(planner.adaptive_strategy(&signals), FetchStrategy::Offline);

        signals.speed = ConnectionSpeed::Slow;
        signals.estimated_message_size = 2 * 1024 * 1024;
        assert_eq!(planner.adaptive_strategy(&signals), FetchStrategy::Lazy);

        signals.estimated_message_size = 10_000;
        assert_eq!(planner.adaptive_strategy(&signals), FetchStrategy::Minimal);

        signals.speed = ConnectionSpeed::Fast;
        assert_eq!(planner.adaptive_strategy(&signals), FetchStrategy::Complete);

        signals.speed = ConnectionSpeed::Medium;
        assert_eq!(planner.adaptive_strategy(&signals), FetchStrategy::Standard);
    }

    #[test]
    fn partial_plan_emits_fixed_chunks_in_ascending_order() {
        let plan = planner().partial_plan("1.2", 1_300_000);
        assert_eq!(plan.len(), 3);
        assert_eq!(plan[0].offset, 0);
        assert_eq!(plan[0].length, 512 * 1024);
        assert_eq!(plan[1].offset, 512 * 1024);
        assert_eq!(plan[2].offset, 1024 * 1024);
        assert_eq!(plan[2].length, 1_300_000 - 1024 * 1024);
        assert!(plan.windows(2).all(|w| w[0].offset < w[1].offset));
    }

    #[test]
    fn small_sections_fetch_in_one_range() {
        let plan = planner().partial_plan("1", 2_000);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].offset, 0);
        assert_eq!(plan[0].length, 2_000);
        assert!(planner().partial_plan("1", 0).is_empty());
    }

    #[test]
    fn grouping_respects_the_cumulative_ceiling() {
        let planner = planner();
        let plan = planner.plan(&rich_structure(), FetchStrategy::Complete);
        let groups = planner.group_sections(&plan.sections);

        for group in &groups {
            let total: u64 = group.iter().map(|s| s.expected_size).sum();
            assert!(total <= 1024 * 1024 || group.len() == 1);
        }
        let flattened: usize = groups.iter().map(Vec::len).sum();
        assert_eq!(flattened, plan.sections.len());
    }
}
