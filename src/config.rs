//! Configuration for the blob store, render cache, recovery, fetch, and
//! security subsystems
//!
//! All settings carry compile-time defaults and can be overridden from
//! environment variables following the pattern `MAIL_STORE_<SECTION>_<KEY>`.
//! Hosts embedding the crate may also construct the config programmatically
//! via the `Default` impls.

use std::env;
use std::env::VarError;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::{StoreError, StoreResult};

/// Blob store settings
#[derive(Debug, Clone)]
pub struct BlobConfig {
    /// Root directory for the content-addressed tree, quarantine, scan
    /// metadata, and the metadata database
    pub base_dir: PathBuf,
    /// Hard ceiling for any single blob accepted by `store_safe`
    pub max_blob_size: u64,
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("mail-store"),
            max_blob_size: 100 * 1024 * 1024,
        }
    }
}

/// Render cache settings
#[derive(Debug, Clone)]
pub struct RenderCacheConfig {
    /// Maximum entries held in the memory tier
    pub memory_max_items: usize,
    /// Maximum total byte cost held in the memory tier
    pub memory_max_bytes: u64,
    /// Fields longer than this are gzip-compressed before persisting
    pub compression_threshold: usize,
    /// Rows older than this many days are removed by `maintenance`
    pub expiration_days: i64,
    /// Version tag written on new artifacts; bumping it invalidates older rows
    pub generator_version: u32,
}

impl Default for RenderCacheConfig {
    fn default() -> Self {
        Self {
            memory_max_items: 100,
            memory_max_bytes: 50 * 1024 * 1024,
            compression_threshold: 10 * 1024,
            expiration_days: 30,
            generator_version: 1,
        }
    }
}

/// Error-recovery engine settings
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Maximum retry attempts per context before giving up
    pub max_retries: u32,
    /// Base delay for the first retry, in milliseconds
    pub base_delay_ms: u64,
    /// Ceiling applied to the computed delay, in milliseconds
    pub max_delay_ms: u64,
    /// Exponential growth factor per attempt
    pub multiplier: f64,
    /// Jitter range as a fraction of the delay (0.1 = plus or minus 10%)
    pub jitter: f64,
    /// Consecutive failures before the circuit breaker opens
    pub breaker_threshold: u32,
    /// Time an open breaker waits before admitting a half-open probe, in
    /// milliseconds
    pub breaker_timeout_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: 0.1,
            breaker_threshold: 5,
            breaker_timeout_ms: 60_000,
        }
    }
}

/// Fetch planner and downloader settings
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Chunk size for partial (ranged) fetches
    pub chunk_size: u64,
    /// Sections larger than this are fetched in chunks
    pub large_attachment_threshold: u64,
    /// Ceiling for one grouped multi-section fetch command
    pub group_max_bytes: u64,
    /// Concurrent attachment downloads per message in `download_all`
    pub download_concurrency: usize,
    /// Hard timeout for one whole pipeline run, in milliseconds
    pub pipeline_timeout_ms: u64,
    /// Bounded fan-out for attachment processing inside the pipeline
    pub attachment_concurrency: usize,
    /// Ceiling for any single attachment accepted during processing
    pub max_attachment_size: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            chunk_size: 512 * 1024,
            large_attachment_threshold: 1024 * 1024,
            group_max_bytes: 1024 * 1024,
            download_concurrency: 4,
            pipeline_timeout_ms: 30_000,
            attachment_concurrency: 4,
            max_attachment_size: 25 * 1024 * 1024,
        }
    }
}

/// Named HTML security policy preset
///
/// `Strict` additionally runs the full `ammonia` deep clean after the
/// policy transforms; `Moderate` is the default; `Relaxed` permits inline
/// styles and external images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityPolicy {
    /// Block everything optional, deep-clean the result
    Strict,
    /// Block active content and external images, keep formatting
    Moderate,
    /// Allow styles and external images; scripts remain forbidden
    Relaxed,
}

/// HTML sanitization flags derived from (or overriding) a policy preset
///
/// Scripts are never allowed; there is intentionally no flag for them.
#[derive(Debug, Clone)]
pub struct SecurityConfig {
    /// Preset the flags were derived from
    pub policy: SecurityPolicy,
    /// Load `<img src="http(s)://…">` content
    pub allow_external_images: bool,
    /// Keep `<link rel="stylesheet">` references
    pub allow_external_stylesheets: bool,
    /// Keep `style="…"` attributes and `<style>` blocks
    pub allow_inline_styles: bool,
    /// Keep `<iframe>` elements
    pub allow_iframes: bool,
    /// Keep `<form>` elements
    pub allow_forms: bool,
    /// Rewrite external `src=` through `/proxy?url=…` instead of blocking
    pub proxy_external_content: bool,
    /// Prepend a restrictive Content-Security-Policy `<meta>` tag
    pub enforce_csp: bool,
}

impl SecurityConfig {
    /// Flags for a named preset
    pub fn for_policy(policy: SecurityPolicy) -> Self {
        match policy {
            SecurityPolicy::Strict => Self {
                policy,
                allow_external_images: false,
                allow_external_stylesheets: false,
                allow_inline_styles: false,
                allow_iframes: false,
                allow_forms: false,
                proxy_external_content: false,
                enforce_csp: true,
            },
            SecurityPolicy::Moderate => Self {
                policy,
                allow_external_images: false,
                allow_external_stylesheets: false,
                allow_inline_styles: true,
                allow_iframes: false,
                allow_forms: false,
                proxy_external_content: false,
                enforce_csp: true,
            },
            SecurityPolicy::Relaxed => Self {
                policy,
                allow_external_images: true,
                allow_external_stylesheets: false,
                allow_inline_styles: true,
                allow_iframes: false,
                allow_forms: false,
                proxy_external_content: false,
                enforce_csp: false,
            },
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self::for_policy(SecurityPolicy::Moderate)
    }
}

/// Aggregate configuration for the whole store
#[derive(Debug, Clone, Default)]
pub struct StoreConfig {
    /// Blob store section
    pub blob: BlobConfig,
    /// Render cache section
    pub render_cache: RenderCacheConfig,
    /// Recovery engine section
    pub recovery: RecoveryConfig,
    /// Fetch planner / downloader / pipeline section
    pub fetch: FetchConfig,
    /// HTML security policy section
    pub security: SecurityConfig,
}

impl StoreConfig {
    /// Load configuration from environment variables
    ///
    /// Every value falls back to its spec default when the variable is unset.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if a variable is set but malformed.
    ///
    /// # Example Environment
    ///
    /// ```text
    /// MAIL_STORE_BLOB_BASE_DIR=/var/lib/mail-store
    /// MAIL_STORE_BLOB_MAX_SIZE=104857600
    /// MAIL_STORE_CACHE_GENERATOR_VERSION=3
    /// MAIL_STORE_RECOVERY_MAX_RETRIES=3
    /// MAIL_STORE_SECURITY_POLICY=strict
    /// ```
    pub fn load_from_env() -> StoreResult<Self> {
        let blob_defaults = BlobConfig::default();
        let cache_defaults = RenderCacheConfig::default();
        let recovery_defaults = RecoveryConfig::default();
        let fetch_defaults = FetchConfig::default();

        let blob = BlobConfig {
            base_dir: env::var("MAIL_STORE_BLOB_BASE_DIR")
                .map(PathBuf::from)
                .unwrap_or(blob_defaults.base_dir),
            max_blob_size: parse_u64_env("MAIL_STORE_BLOB_MAX_SIZE", blob_defaults.max_blob_size)?,
        };

        let render_cache = RenderCacheConfig {
            memory_max_items: parse_usize_env(
                "MAIL_STORE_CACHE_MEMORY_MAX_ITEMS",
                cache_defaults.memory_max_items,
            )?,
            memory_max_bytes: parse_u64_env(
                "MAIL_STORE_CACHE_MEMORY_MAX_BYTES",
                cache_defaults.memory_max_bytes,
            )?,
            compression_threshold: parse_usize_env(
                "MAIL_STORE_CACHE_COMPRESSION_THRESHOLD",
                cache_defaults.compression_threshold,
            )?,
            expiration_days: parse_i64_env(
                "MAIL_STORE_CACHE_EXPIRATION_DAYS",
                cache_defaults.expiration_days,
            )?,
            generator_version: parse_u32_env(
                "MAIL_STORE_CACHE_GENERATOR_VERSION",
                cache_defaults.generator_version,
            )?,
        };

        let recovery = RecoveryConfig {
            max_retries: parse_u32_env(
                "MAIL_STORE_RECOVERY_MAX_RETRIES",
                recovery_defaults.max_retries,
            )?,
            base_delay_ms: parse_u64_env(
                "MAIL_STORE_RECOVERY_BASE_DELAY_MS",
                recovery_defaults.base_delay_ms,
            )?,
            max_delay_ms: parse_u64_env(
                "MAIL_STORE_RECOVERY_MAX_DELAY_MS",
                recovery_defaults.max_delay_ms,
            )?,
            multiplier: parse_f64_env(
                "MAIL_STORE_RECOVERY_MULTIPLIER",
                recovery_defaults.multiplier,
            )?,
            jitter: parse_f64_env("MAIL_STORE_RECOVERY_JITTER", recovery_defaults.jitter)?,
            breaker_threshold: parse_u32_env(
                "MAIL_STORE_RECOVERY_BREAKER_THRESHOLD",
                recovery_defaults.breaker_threshold,
            )?,
            breaker_timeout_ms: parse_u64_env(
                "MAIL_STORE_RECOVERY_BREAKER_TIMEOUT_MS",
                recovery_defaults.breaker_timeout_ms,
            )?,
        };

        let fetch = FetchConfig {
            chunk_size: parse_u64_env("MAIL_STORE_FETCH_CHUNK_SIZE", fetch_defaults.chunk_size)?,
            large_attachment_threshold: parse_u64_env(
                "MAIL_STORE_FETCH_LARGE_THRESHOLD",
                fetch_defaults.large_attachment_threshold,
            )?,
            group_max_bytes: parse_u64_env(
                "MAIL_STORE_FETCH_GROUP_MAX_BYTES",
                fetch_defaults.group_max_bytes,
            )?,
            download_concurrency: parse_usize_env(
                "MAIL_STORE_FETCH_DOWNLOAD_CONCURRENCY",
                fetch_defaults.download_concurrency,
            )?,
            pipeline_timeout_ms: parse_u64_env(
                "MAIL_STORE_PIPELINE_TIMEOUT_MS",
                fetch_defaults.pipeline_timeout_ms,
            )?,
            attachment_concurrency: parse_usize_env(
                "MAIL_STORE_PIPELINE_ATTACHMENT_CONCURRENCY",
                fetch_defaults.attachment_concurrency,
            )?,
            max_attachment_size: parse_u64_env(
                "MAIL_STORE_FETCH_MAX_ATTACHMENT_SIZE",
                fetch_defaults.max_attachment_size,
            )?,
        };

        let security = SecurityConfig::for_policy(parse_policy_env(
            "MAIL_STORE_SECURITY_POLICY",
            SecurityPolicy::Moderate,
        )?);

        Ok(Self {
            blob,
            render_cache,
            recovery,
            fetch,
            security,
        })
    }
}

/// Parse a security policy environment variable
///
/// Accepts `strict`, `moderate`, or `relaxed` (case-insensitive). Returns
/// `default` if unset.
fn parse_policy_env(key: &str, default: SecurityPolicy) -> StoreResult<SecurityPolicy> {
    match env::var(key) {
        Ok(v) => match v.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(SecurityPolicy::Strict),
            "moderate" => Ok(SecurityPolicy::Moderate),
            "relaxed" => Ok(SecurityPolicy::Relaxed),
            _ => Err(StoreError::InvalidInput(format!(
                "invalid security policy environment variable {key}: '{v}'"
            ))),
        },
        Err(VarError::NotPresent) => Ok(default),
        Err(VarError::NotUnicode(_)) => Err(StoreError::InvalidInput(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

/// Parse a `u32` environment variable with default fallback
///
/// Returns `default` if unset.
///
/// # Errors
///
/// Returns `InvalidInput` if the variable is set but not a valid `u32`.
fn parse_u32_env(key: &str, default: u32) -> StoreResult<u32> {
    match env::var(key) {
        Ok(v) => v.parse::<u32>().map_err(|_| {
            StoreError::InvalidInput(format!("invalid u32 environment variable {key}: '{v}'"))
        }),
        Err(VarError::NotPresent) => Ok(default),
        Err(VarError::NotUnicode(_)) => Err(StoreError::InvalidInput(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

/// Parse a `u64` environment variable with default fallback
///
/// Returns `default` if unset.
///
/// # Errors
///
/// Returns `InvalidInput` if the variable is set but not a valid `u64`.
fn parse_u64_env(key: &str, default: u64) -> StoreResult<u64> {
    match env::var(key) {
        Ok(v) => v.parse::<u64>().map_err(|_| {
            StoreError::InvalidInput(format!("invalid u64 environment variable {key}: '{v}'"))
        }),
        Err(VarError::NotPresent) => Ok(default),
        Err(VarError::NotUnicode(_)) => Err(StoreError::InvalidInput(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

/// Parse an `i64` environment variable with default fallback
fn parse_i64_env(key: &str, default: i64) -> StoreResult<i64> {
    match env::var(key) {
        Ok(v) => v.parse::<i64>().map_err(|_| {
            StoreError::InvalidInput(format!("invalid i64 environment variable {key}: '{v}'"))
        }),
        Err(VarError::NotPresent) => Ok(default),
        Err(VarError::NotUnicode(_)) => Err(StoreError::InvalidInput(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

/// Parse an `f64` environment variable with default fallback
fn parse_f64_env(key: &str, default: f64) -> StoreResult<f64> {
    match env::var(key) {
        Ok(v) => v.parse::<f64>().map_err(|_| {
            StoreError::InvalidInput(format!("invalid f64 environment variable {key}: '{v}'"))
        }),
        Err(VarError::NotPresent) => Ok(default),
        Err(VarError::NotUnicode(_)) => Err(StoreError::InvalidInput(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

/// Parse a `usize` environment variable with default fallback
///
/// Returns `default` if unset.
///
/// # Errors
///
/// Returns `InvalidInput` if the variable is set but not a valid `usize`.
fn parse_usize_env(key: &str, default: usize) -> StoreResult<usize> {
    match env::var(key) {
        Ok(v) => v.parse::<usize>().map_err(|_| {
            StoreError::InvalidInput(format!("invalid usize environment variable {key}: '{v}'"))
        }),
        Err(VarError::NotPresent) => Ok(default),
        Err(VarError::NotUnicode(_)) => Err(StoreError::InvalidInput(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::{
        FetchConfig, RecoveryConfig, RenderCacheConfig, SecurityConfig, SecurityPolicy,
        parse_u64_env,
    };

    #[test]
    fn defaults_match_documented_values() {
        let cache = RenderCacheConfig::default();
        assert_eq!(cache.memory_max_items, 100);
        assert_eq!(cache.memory_max_bytes, 50 * 1024 * 1024);
        assert_eq!(cache.compression_threshold, 10 * 1024);
        assert_eq!(cache.expiration_days, 30);

        let recovery = RecoveryConfig::default();
        assert_eq!(recovery.max_retries, 3);
        assert_eq!(recovery.base_delay_ms, 1_000);
        assert_eq!(recovery.max_delay_ms, 30_000);
        assert_eq!(recovery.breaker_threshold, 5);
        assert_eq!(recovery.breaker_timeout_ms, 60_000);

        let fetch = FetchConfig::default();
        assert_eq!(fetch.chunk_size, 512 * 1024);
        assert_eq!(fetch.large_attachment_threshold, 1024 * 1024);
        assert_eq!(fetch.pipeline_timeout_ms, 30_000);
    }

    #[test]
    fn policy_presets_never_allow_scripts_or_external_images_by_default() {
        let strict = SecurityConfig::for_policy(SecurityPolicy::Strict);
        assert!(!strict.allow_external_images);
        assert!(!strict.allow_inline_styles);
        assert!(strict.enforce_csp);

        let moderate = SecurityConfig::default();
        assert_eq!(moderate.policy, SecurityPolicy::Moderate);
        assert!(!moderate.allow_external_images);
        assert!(moderate.allow_inline_styles);

        let relaxed = SecurityConfig::for_policy(SecurityPolicy::Relaxed);
        assert!(relaxed.allow_external_images);
        assert!(!relaxed.allow_iframes);
    }

    #[test]
    fn env_parse_falls_back_to_default_when_unset() {
        let value =
            parse_u64_env("MAIL_STORE_TEST_UNSET_VARIABLE_XYZ", 42).expect("default applies");
        assert_eq!(value, 42);
    }
}
