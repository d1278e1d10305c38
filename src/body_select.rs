//! Body part selection
//!
//! Scores every displayable candidate and picks the one to render, together
//! with the set of Content-IDs the chosen body references through `cid:`
//! URLs. Scoring is a total order with ties broken by insertion order, so
//! selection is deterministic for a given candidate list.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::models::{Disposition, MimePart};

static CID_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)cid:([^"'\s>]+)"#).unwrap_or_else(|_| unreachable!())
});

static RICH_TOKENS: &[&str] = &["<table", "<img", "<div", "<span", "<style", "<font"];

static FALLBACK_PHRASES: &[&str] = &[
    "view this email in your browser",
    "please enable html",
    "html version",
    "click here to view",
];

/// Selection strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodySelectionStrategy {
    /// Highest numeric score wins
    Smart,
    /// Any HTML candidate beats any non-HTML candidate
    PreferHtml,
    /// Any plain-text candidate beats any non-plain candidate
    PreferPlainText,
}

/// One candidate: part metadata plus its decoded text
#[derive(Debug, Clone)]
pub struct BodyCandidate {
    /// Part metadata
    pub part: MimePart,
    /// Decoded text content
    pub content: String,
}

/// Result of body selection
#[derive(Debug, Clone)]
pub struct BodySelection {
    /// Chosen part id
    pub part_id: String,
    /// Chosen media type
    pub media_type: String,
    /// Decoded content of the chosen part
    pub content: String,
    /// Numeric score the part achieved
    pub score: i32,
    /// Human-readable scoring explanation
    pub reason: String,
    /// Content-IDs the body references via `cid:` URLs, in order of appearance
    pub inline_content_ids: Vec<String>,
}

/// Pick the body to display
///
/// Returns `None` when the candidate list is empty. Type-preference
/// strategies restrict to their preferred type first and fall back to the
/// full list when no candidate of that type exists.
pub fn select_body(
    candidates: &[BodyCandidate],
    strategy: BodySelectionStrategy,
) -> Option<BodySelection> {
    if candidates.is_empty() {
        return None;
    }

    let preferred: Vec<(usize, &BodyCandidate)> = match strategy {
        BodySelectionStrategy::Smart => candidates.iter().enumerate().collect(),
        BodySelectionStrategy::PreferHtml => {
            let html: Vec<_> = candidates
                .iter()
                .enumerate()
                .filter(|(_, c)| c.part.media_type == "text/html")
                .collect();
            if html.is_empty() {
                candidates.iter().enumerate().collect()
            } else {
                html
            }
        }
        BodySelectionStrategy::PreferPlainText => {
            let plain: Vec<_> = candidates
                .iter()
                .enumerate()
                .filter(|(_, c)| c.part.media_type == "text/plain")
                .collect();
            if plain.is_empty() {
                candidates.iter().enumerate().collect()
            } else {
                plain
            }
        }
    };

    let mut best: Option<(i32, &BodyCandidate, Vec<String>)> = None;
    for (_, candidate) in preferred {
        let (score, reasons) = score_candidate(candidate);
        // Strict comparison keeps the earlier candidate on ties.
        if best.as_ref().is_none_or(|(best_score, _, _)| score > *best_score) {
            best = Some((score, candidate, reasons));
        }
    }

    best.map(|(score, candidate, reasons)| BodySelection {
        part_id: candidate.part.part_id.clone(),
        media_type: candidate.part.media_type.clone(),
        content: candidate.content.clone(),
        score,
        reason: reasons.join(", "),
        inline_content_ids: extract_cid_references(&candidate.content),
    })
}

/// Score one candidate; returns the score and its component descriptions
fn score_candidate(candidate: &BodyCandidate) -> (i32, Vec<String>) {
    let media_type = candidate.part.media_type.as_str();
    let content = candidate.content.as_str();
    let length = content.chars().count();
    let is_html = media_type == "text/html";
    let is_plain = media_type == "text/plain";

    let mut score = 0;
    let mut reasons = Vec::new();

    match media_type {
        "text/html" => {
            score += 100;
            reasons.push("html content".to_owned());
        }
        "text/plain" => {
            score += 50;
            reasons.push("plain text content".to_owned());
        }
        _ => {
            score += 40;
            reasons.push(format!("{media_type} content"));
        }
    }

    if length > 1000 {
        score += if is_html { 20 } else { 15 };
        reasons.push("substantial content".to_owned());
    } else if length >= 500 {
        score += if is_html { 10 } else { 8 };
        reasons.push("moderate content".to_owned());
    }

    if is_html {
        let lower = content.to_ascii_lowercase();
        if RICH_TOKENS.iter().any(|token| lower.contains(token)) {
            score += 10;
            reasons.push("rich formatting".to_owned());
        }
        if lower.contains("cid:") {
            score += 15;
            reasons.push("has inline images".to_owned());
        }
    }

    if candidate
        .part
        .charset
        .as_deref()
        .is_some_and(|c| c.eq_ignore_ascii_case("utf-8"))
    {
        score += 5;
        reasons.push("utf-8 charset".to_owned());
    }

    if is_plain && looks_like_html_fallback(content, length) {
        score -= 20;
        reasons.push("looks like an html fallback stub".to_owned());
    }

    if candidate.part.disposition == Some(Disposition::Inline) {
        score += 5;
        reasons.push("inline disposition".to_owned());
    }

    (score, reasons)
}

/// Whether a plain-text part is just a stub pointing at the HTML version
fn looks_like_html_fallback(content: &str, length: usize) -> bool {
    if length <= 50 {
        return true;
    }
    let lower = content.to_ascii_lowercase();
    FALLBACK_PHRASES.iter().any(|phrase| lower.contains(phrase))
}

/// Extract `cid:` references from a body, in order of appearance
pub fn extract_cid_references(content: &str) -> Vec<String> {
    CID_REFERENCE
        .captures_iter(content)
        .map(|caps| caps[1].to_owned())
        .collect()
}
