//! mail-store-rs: offline-first mail content store
//!
//! This crate is the storage and processing engine behind an offline-capable
//! mail client: it ingests a fetched RFC 822 message together with its
//! server-reported structure, decomposes it into MIME parts, persists binary
//! payloads in a content-addressed, deduplicated, reference-counted blob
//! store, selects the best body for display, and emits a sanitized render
//! artifact that is cached for instant re-display. A cooperating recovery
//! layer governs retryable failures.
//!
//! # Architecture
//!
//! - [`config`]: Environment-driven configuration with documented defaults
//! - [`errors`]: Application error model shared by every component
//! - [`models`]: Core data model (identities, parts, attachments, artifacts)
//! - [`structure`]: Server-reported body structure and section paths
//! - [`mime`]: RFC 822 parsing, header decoding, transfer/charset decoding
//! - [`db`]: Embedded metadata store (blobs, parts, attachments, messages)
//! - [`blob_store`]: Content-addressed storage with refcounts, quarantine, GC
//! - [`render_cache`]: Two-tier versioned artifact cache with compression
//! - [`fetch_plan`]: Strategy-driven section planning and partial ranges
//! - [`body_select`]: Body candidate scoring and inline CID extraction
//! - [`secure`]: S/MIME and PGP detection plus crypto capability interfaces
//! - [`sanitize`]: CID rewriting, HTML sanitization, policy transforms
//! - [`scanner`]: Pre-store security checks and filename sanitization
//! - [`recovery`]: Retry with jittered backoff and per-context breakers
//! - [`downloader`]: Coalesced, chunked on-demand attachment retrieval
//! - [`pipeline`]: End-to-end processing orchestration
//! - [`transport`]: Interfaces the host application supplies
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use mail_store::blob_store::BlobStore;
//! use mail_store::config::StoreConfig;
//! use mail_store::models::MessageIdentity;
//! use mail_store::pipeline::{MessagePipeline, ProcessingRequest};
//! use mail_store::recovery::RecoveryEngine;
//! use mail_store::render_cache::RenderCache;
//! use mail_store::scanner::SecurityScanner;
//! use mail_store::transport::FixedLimits;
//!
//! # async fn run(raw_bytes: Vec<u8>) -> Result<(), Box<dyn std::error::Error>> {
//! let config = StoreConfig::load_from_env()?;
//! let store = Arc::new(BlobStore::init(&config.blob.base_dir).await?);
//! let cache = Arc::new(RenderCache::new(
//!     store.metadata_db(),
//!     config.render_cache.clone(),
//! ));
//! let pipeline = MessagePipeline::new(
//!     Arc::clone(&store),
//!     cache,
//!     Arc::new(SecurityScanner::new(config.fetch.max_attachment_size)),
//!     Arc::new(RecoveryEngine::new(config.recovery.clone())),
//!     Arc::new(FixedLimits::default()),
//!     None,
//!     config,
//! );
//!
//! let request = ProcessingRequest::from_raw(
//!     MessageIdentity::new("default", "INBOX", 42),
//!     uuid::Uuid::new_v4(),
//!     raw_bytes,
//! );
//! let summary = pipeline.process_message(request).await?;
//! println!("processed: {:?}", summary.status);
//! # Ok(())
//! # }
//! ```

pub mod blob_store;
pub mod body_select;
pub mod config;
pub mod db;
pub mod downloader;
pub mod errors;
pub mod fetch_plan;
pub mod mime;
pub mod models;
pub mod pipeline;
pub mod recovery;
pub mod render_cache;
pub mod sanitize;
pub mod scanner;
pub mod secure;
pub mod structure;
pub mod transport;

pub use blob_store::BlobStore;
pub use config::StoreConfig;
pub use downloader::AttachmentDownloader;
pub use errors::{StoreError, StoreResult};
pub use pipeline::{MessagePipeline, ProcessingRequest};
pub use recovery::RecoveryEngine;
pub use render_cache::RenderCache;
pub use scanner::SecurityScanner;
