//! HTML finalization
//!
//! Rewrites `cid:` references to stable virtual URLs, strips active content,
//! and applies the configured security policy: inline styles, external
//! stylesheets, iframes, forms, external images (blocked or proxied), anchor
//! hardening, and optional Content-Security-Policy injection. Under the
//! strict policy the result additionally passes through the full `ammonia`
//! clean.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use tracing::debug;
use uuid::Uuid;

use crate::config::{SecurityConfig, SecurityPolicy};

/// 1x1 transparent GIF used when external images are blocked
const TRANSPARENT_PIXEL: &str =
    "data:image/gif;base64,R0lGODlhAQABAIAAAAAAAP///yH5BAEAAAAALAAAAAABAAEAAAIBRAA7";

/// Restrictive CSP injected when enforcement is on
const CSP_META: &str = "<meta http-equiv=\"Content-Security-Policy\" content=\"default-src 'none'; \
img-src 'self' data:; style-src 'self' 'unsafe-inline'\">";

static SCRIPT_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<script\b[^>]*>.*?</script>").unwrap_or_else(|_| unreachable!()));
static SCRIPT_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)</?script\b[^>]*>").unwrap_or_else(|_| unreachable!()));
static EVENT_HANDLER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\son\w+\s*=\s*("[^"]*"|'[^']*'|[^\s>]+)"#).unwrap_or_else(|_| unreachable!())
});
static STYLE_ATTR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\sstyle\s*=\s*("[^"]*"|'[^']*'|[^\s>]+)"#).unwrap_or_else(|_| unreachable!())
});
static STYLE_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<style\b[^>]*>.*?</style>").unwrap_or_else(|_| unreachable!()));
static STYLESHEET_LINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<link\b[^>]*rel\s*=\s*["']?stylesheet["']?[^>]*>"#)
        .unwrap_or_else(|_| unreachable!())
});
static IFRAME_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<iframe\b[^>]*>.*?</iframe>|<iframe\b[^>]*/?>").unwrap_or_else(|_| unreachable!())
});
static FORM_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)</?form\b[^>]*>").unwrap_or_else(|_| unreachable!()));
static EXTERNAL_IMG_SRC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)(<img\b[^>]*?\bsrc\s*=\s*)(["'])(https?://[^"']*)(["'])"#)
        .unwrap_or_else(|_| unreachable!())
});
static ANCHOR_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<a\b([^>]*)>").unwrap_or_else(|_| unreachable!()));
static TARGET_ATTR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\starget\s*=\s*("[^"]*"|'[^']*'|[^\s>]+)"#).unwrap_or_else(|_| unreachable!())
});
static REL_ATTR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\srel\s*=\s*("[^"]*"|'[^']*'|[^\s>]+)"#).unwrap_or_else(|_| unreachable!())
});
static HEAD_OPEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<head\b[^>]*>").unwrap_or_else(|_| unreachable!()));
static CID_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)cid:([^"'\s>]+)"#).unwrap_or_else(|_| unreachable!()));

/// Finalized HTML plus the warnings accumulated while producing it
#[derive(Debug, Clone)]
pub struct SanitizedHtml {
    /// Safe-to-display HTML
    pub html: String,
    /// Policy actions worth surfacing (blocked images, unknown CIDs)
    pub warnings: Vec<String>,
}

/// Rewrite every `cid:` reference to its stable virtual URL
///
/// The emitted form `/mail/{message_id}/cid/{content_id}` is the only
/// contract the UI layer must honor; it resolves the URL back through
/// `get_inline_content`. References without a matching inline part are still
/// rewritten (the resolver will report them missing) and recorded as
/// warnings so no raw `cid:` token survives into the artifact.
pub fn rewrite_cid_references(
    html: &str,
    message_id: Uuid,
    known_cids: &HashSet<String>,
) -> (String, Vec<String>) {
    let mut warnings = Vec::new();
    let rewritten = CID_URL
        .replace_all(html, |caps: &Captures<'_>| {
            let cid = &caps[1];
            if !known_cids.contains(cid) {
                warnings.push(format!("inline reference to unknown content id '{cid}'"));
            }
            format!("/mail/{message_id}/cid/{cid}")
        })
        .into_owned();
    (rewritten, warnings)
}

/// Sanitize HTML under the given security policy
///
/// Scripts and event-handler attributes are always removed; the remaining
/// transforms follow the policy flags. Anchors gain `target="_blank"` and
/// `rel="noopener noreferrer"` unconditionally.
pub fn sanitize_html(html: &str, config: &SecurityConfig) -> SanitizedHtml {
    let mut warnings = Vec::new();
    let mut out = SCRIPT_BLOCK.replace_all(html, "").into_owned();
    out = SCRIPT_TAG.replace_all(&out, "").into_owned();
    out = EVENT_HANDLER.replace_all(&out, "").into_owned();

    if !config.allow_inline_styles {
        out = STYLE_ATTR.replace_all(&out, "").into_owned();
        out = STYLE_BLOCK.replace_all(&out, "").into_owned();
    }
    if !config.allow_external_stylesheets {
        out = STYLESHEET_LINK.replace_all(&out, "").into_owned();
    }
    if !config.allow_iframes {
        out = IFRAME_BLOCK.replace_all(&out, "").into_owned();
    }
    if !config.allow_forms {
        out = FORM_TAG.replace_all(&out, "").into_owned();
    }

    if config.proxy_external_content {
        out = EXTERNAL_IMG_SRC
            .replace_all(&out, |caps: &Captures<'_>| {
                let proxied = format!("/proxy?url={}", urlencoding::encode(&caps[3]));
                format!("{}{}{}{}", &caps[1], &caps[2], proxied, &caps[4])
            })
            .into_owned();
    } else if !config.allow_external_images {
        let mut blocked = 0usize;
        out = EXTERNAL_IMG_SRC
            .replace_all(&out, |caps: &Captures<'_>| {
                blocked += 1;
                format!("{}{}{}{}", &caps[1], &caps[2], TRANSPARENT_PIXEL, &caps[4])
            })
            .into_owned();
        if blocked > 0 {
            warnings.push(format!("blocked {blocked} external image(s)"));
        }
    }

    out = harden_anchors(&out);

    if config.policy == SecurityPolicy::Strict {
        out = ammonia::clean(&out);
        out = harden_anchors(&out);
    }

    if config.enforce_csp {
        out = inject_csp(&out);
    }

    debug!(
        policy = ?config.policy,
        warnings = warnings.len(),
        "html sanitized"
    );
    SanitizedHtml { html: out, warnings }
}

/// Force `target="_blank" rel="noopener noreferrer"` on every anchor
fn harden_anchors(html: &str) -> String {
    ANCHOR_TAG
        .replace_all(html, |caps: &Captures<'_>| {
            let attrs = TARGET_ATTR.replace_all(&caps[1], "");
            let attrs = REL_ATTR.replace_all(&attrs, "");
            let attrs = attrs.trim_end();
            if attrs.is_empty() {
                "<a target=\"_blank\" rel=\"noopener noreferrer\">".to_owned()
            } else {
                format!("<a{attrs} target=\"_blank\" rel=\"noopener noreferrer\">")
            }
        })
        .into_owned()
}

/// Prepend the CSP meta tag after `<head>`, or at the document start
fn inject_csp(html: &str) -> String {
    match HEAD_OPEN.find(html) {
        Some(head) => {
            let mut out = String::with_capacity(html.len() + CSP_META.len());
            out.push_str(&html[..head.end()]);
            out.push_str(CSP_META);
            out.push_str(&html[head.end()..]);
            out
        }
        None => format!("{CSP_META}{html}"),
    }
}

/// Derive a plain-text rendering from HTML
///
/// Used when a message carries only an HTML body so text-only consumers
/// still get content. Returns `None` when conversion fails.
pub fn derive_text_from_html(html: &str) -> Option<String> {
    html2text::from_read(html.as_bytes(), 80)
        .ok()
        .map(|text| text.trim_end().to_owned())
        .filter(|text| !text.is_empty())
}
