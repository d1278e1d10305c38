//! Application error model for the content store
//!
//! Defines a typed error hierarchy using `thiserror`. Each variant corresponds
//! to a failure class with distinct recovery semantics: some are fatal for the
//! whole operation (`Integrity`, `SizeExceeded`), some are fatal only for the
//! offending part (`Encoding`, `Security`), and some are transient and eligible
//! for retry through the recovery engine (`Io`, `Network`, `Timeout`,
//! `RateLimit`).

use thiserror::Error;

/// Application error type
///
/// Covers all error cases the content store may encounter. The recovery
/// engine classifies variants into retry strategies; the processing pipeline
/// decides per variant whether to abort, skip the part, or record a warning.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Invalid caller input (validation failed, malformed identifier)
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Blob, row, or part not found
    #[error("not found: {0}")]
    NotFound(String),
    /// Stored bytes no longer hash to their blob id; never retried
    #[error("integrity failure for blob {blob_id}: stored hash {actual}")]
    Integrity {
        /// Expected content address
        blob_id: String,
        /// Hash actually computed over the on-disk bytes
        actual: String,
    },
    /// Disk or file-system failure
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// Metadata store failure
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    /// Undecodable transfer encoding or charset; soft failure per part
    #[error("encoding error: {0}")]
    Encoding(String),
    /// Object exceeds a configured size ceiling; fatal for that object
    #[error("size exceeded: {0}")]
    SizeExceeded(String),
    /// Content rejected by a security check (ratio, nesting, dangerous type,
    /// quarantined access); part-level fatal
    #[error("security violation: {0}")]
    Security(String),
    /// Transport-level network failure; retryable
    #[error("network error: {0}")]
    Network(String),
    /// Operation timed out; retryable
    #[error("operation timed out: {0}")]
    Timeout(String),
    /// Server asked us to slow down; retryable with longer backoff
    #[error("rate limited: {0}")]
    RateLimit(String),
    /// Circuit breaker for the context is open; fast fail, no strategy run
    #[error("circuit breaker open for context '{0}'")]
    CircuitBreakerOpen(String),
    /// A download for the same (message, part) key is already in flight
    #[error("download already in progress for {0}")]
    AlreadyDownloading(String),
    /// A declared capability (S/MIME or PGP crypto) has no implementation
    #[error("not implemented: {0}")]
    NotImplemented(String),
    /// Internal error (unexpected failure, external crate error)
    #[error("internal error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Convenience constructor for `InvalidInput`
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Convenience constructor for `NotFound`
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Whether the recovery engine may retry this error at all
    ///
    /// Integrity and size violations are terminal by definition; validation
    /// and capability errors will not improve on retry. Everything else is
    /// handed to the strategy catalog for a per-strategy decision.
    pub fn is_potentially_recoverable(&self) -> bool {
        !matches!(
            self,
            Self::Integrity { .. }
                | Self::SizeExceeded(_)
                | Self::Security(_)
                | Self::InvalidInput(_)
                | Self::NotImplemented(_)
                | Self::AlreadyDownloading(_)
                | Self::CircuitBreakerOpen(_)
        )
    }

    /// Stable machine-readable code for summaries and event payloads
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::NotFound(_) => "not_found",
            Self::Integrity { .. } => "integrity",
            Self::Io(_) => "io",
            Self::Database(_) => "database",
            Self::Encoding(_) => "encoding",
            Self::SizeExceeded(_) => "size_exceeded",
            Self::Security(_) => "security",
            Self::Network(_) => "network",
            Self::Timeout(_) => "timeout",
            Self::RateLimit(_) => "rate_limit",
            Self::CircuitBreakerOpen(_) => "circuit_breaker_open",
            Self::AlreadyDownloading(_) => "already_downloading",
            Self::NotImplemented(_) => "not_implemented",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Internal(format!("json serialization failed: {e}"))
    }
}

/// Type alias for fallible return values
///
/// Use this for all internal functions that can fail. Provides a consistent
/// error type throughout the codebase.
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::StoreError;

    #[test]
    fn terminal_errors_are_not_recoverable() {
        let integrity = StoreError::Integrity {
            blob_id: "ab".repeat(32),
            actual: "cd".repeat(32),
        };
        assert!(!integrity.is_potentially_recoverable());
        assert!(!StoreError::SizeExceeded("too big".into()).is_potentially_recoverable());
        assert!(!StoreError::Security("blocked".into()).is_potentially_recoverable());
        assert!(!StoreError::NotImplemented("pgp".into()).is_potentially_recoverable());
    }

    #[test]
    fn transient_errors_are_recoverable() {
        assert!(StoreError::Network("reset".into()).is_potentially_recoverable());
        assert!(StoreError::Timeout("fetch".into()).is_potentially_recoverable());
        assert!(StoreError::RateLimit("429".into()).is_potentially_recoverable());
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(StoreError::Network("x".into()).code(), "network");
        assert_eq!(
            StoreError::AlreadyDownloading("m:1".into()).code(),
            "already_downloading"
        );
    }
}
