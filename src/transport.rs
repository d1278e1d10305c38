//! Interfaces consumed from the host application
//!
//! The engine never talks to a mail server itself: the host supplies a
//! [`Transport`] for section retrieval and a [`MessageLimits`] policy for
//! size decisions. Both are async capability traits injected at pipeline
//! construction.

use async_trait::async_trait;

use crate::errors::StoreResult;
use crate::models::MessageIdentity;
use crate::structure::BodyStructure;

/// Verdict from a size-limit check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LimitCheck {
    /// Within limits
    Ok,
    /// Acceptable but worth surfacing to the user
    Warning(String),
    /// Over the hard limit; the object must be rejected
    Exceeded(String),
}

/// Transport capability the host wires in
///
/// Section identifiers are the engine's dotted part paths; the transport
/// maps them onto its own wire addressing.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fetch one complete section
    async fn fetch_section(
        &self,
        identity: &MessageIdentity,
        section_id: &str,
    ) -> StoreResult<Vec<u8>>;

    /// Fetch a byte range of one section
    async fn fetch_partial(
        &self,
        identity: &MessageIdentity,
        section_id: &str,
        offset: u64,
        length: u64,
    ) -> StoreResult<Vec<u8>>;

    /// Fetch the server-reported structure of a message
    async fn fetch_body_structure(&self, identity: &MessageIdentity) -> StoreResult<BodyStructure>;
}

/// Size-limit policy the host wires in
pub trait MessageLimits: Send + Sync {
    /// Check a whole message against the configured ceiling
    fn check_message_size(&self, bytes: u64) -> LimitCheck;

    /// Check one attachment against the configured ceiling
    fn check_attachment_size(&self, bytes: u64) -> LimitCheck;
}

/// Limit policy with fixed ceilings and a warning band
///
/// Warns above `warn_fraction` of the ceiling, rejects above it.
#[derive(Debug, Clone)]
pub struct FixedLimits {
    /// Hard ceiling for a whole message
    pub max_message_size: u64,
    /// Hard ceiling for one attachment
    pub max_attachment_size: u64,
    /// Fraction of the ceiling at which warnings begin
    pub warn_fraction: f64,
}

impl Default for FixedLimits {
    fn default() -> Self {
        Self {
            max_message_size: 100 * 1024 * 1024,
            max_attachment_size: 25 * 1024 * 1024,
            warn_fraction: 0.8,
        }
    }
}

impl FixedLimits {
    fn check(&self, bytes: u64, ceiling: u64, what: &str) -> LimitCheck {
        if bytes > ceiling {
            LimitCheck::Exceeded(format!(
                "{what} of {bytes} bytes exceeds the {ceiling}-byte limit"
            ))
        } else if (bytes as f64) > (ceiling as f64) * self.warn_fraction {
            LimitCheck::Warning(format!(
                "{what} of {bytes} bytes approaches the {ceiling}-byte limit"
            ))
        } else {
            LimitCheck::Ok
        }
    }
}

impl MessageLimits for FixedLimits {
    fn check_message_size(&self, bytes: u64) -> LimitCheck {
        self.check(bytes, self.max_message_size, "message")
    }

    fn check_attachment_size(&self, bytes: u64) -> LimitCheck {
        self.check(bytes, self.max_attachment_size, "attachment")
    }
}

#[cfg(test)]
mod tests {
    use super::{FixedLimits, LimitCheck, MessageLimits};

    #[test]
    fn fixed_limits_ok_warn_and_exceed() {
        let limits = FixedLimits {
            max_message_size: 1_000,
            max_attachment_size: 100,
            warn_fraction: 0.8,
        };
        assert_eq!(limits.check_message_size(500), LimitCheck::Ok);
        assert!(matches!(
            limits.check_message_size(900),
            LimitCheck::Warning(_)
        ));
        assert!(matches!(
            limits.check_message_size(1_001),
            LimitCheck::Exceeded(_)
        ));
        assert!(matches!(
            limits.check_attachment_size(101),
            LimitCheck::Exceeded(_)
        ));
    }
}
