//! Versioned render-artifact cache
//!
//! Two tiers: a bounded in-memory map (evicted by byte cost and entry count,
//! oldest access first) over durable rows in the metadata database. Large
//! fields are gzip-compressed and base64-wrapped before persisting; the
//! compressed form is recognized on read by the `H4sI` prefix (base64 of the
//! gzip magic). Bumping the generator version is the single mechanism for
//! coordinated invalidation when upstream parsing logic changes.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use base64::Engine;
use chrono::{Duration as ChronoDuration, Utc};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::RenderCacheConfig;
use crate::db::MetadataDb;
use crate::errors::{StoreError, StoreResult};
use crate::models::RenderArtifact;

/// Base64 of the gzip magic bytes; every compressed field starts with this
const COMPRESSED_PREFIX: &str = "H4sI";

/// Cache statistics snapshot
#[derive(Debug, Clone, Default)]
pub struct RenderCacheStats {
    /// Entries currently in the memory tier
    pub memory_items: usize,
    /// Byte cost currently in the memory tier
    pub memory_bytes: u64,
    /// Durable rows in the database
    pub durable_rows: u64,
    /// Memory-tier hits since construction
    pub hits: u64,
    /// Memory-tier misses since construction
    pub misses: u64,
}

/// One memory-tier entry
#[derive(Debug, Clone)]
struct MemoryEntry {
    artifact: RenderArtifact,
    cost: u64,
    last_used: Instant,
}

/// Bounded memory tier keyed by message id
///
/// Eviction removes least-recently-used entries until both the entry-count
/// and byte-cost ceilings hold. Runs on the writer path.
#[derive(Debug)]
struct MemoryTier {
    max_items: usize,
    max_bytes: u64,
    total_bytes: u64,
    entries: HashMap<Uuid, MemoryEntry>,
}

impl MemoryTier {
    fn new(max_items: usize, max_bytes: u64) -> Self {
        Self {
            max_items,
            max_bytes,
            total_bytes: 0,
            entries: HashMap::new(),
        }
    }

    fn get(&mut self, message_id: Uuid) -> Option<RenderArtifact> {
        let entry = self.entries.get_mut(&message_id)?;
        entry.last_used = Instant::now();
        Some(entry.artifact.clone())
    }

    fn put(&mut self, artifact: RenderArtifact) {
        let cost = artifact_cost(&artifact);
        if let Some(old) = self.entries.remove(&artifact.message_id) {
            self.total_bytes -= old.cost;
        }
        self.entries.insert(
            artifact.message_id,
            MemoryEntry {
                artifact,
                cost,
                last_used: Instant::now(),
            },
        );
        self.total_bytes += cost;
        self.evict_if_needed();
    }

    fn remove(&mut self, message_id: Uuid) {
        if let Some(old) = self.entries.remove(&message_id) {
            self.total_bytes -= old.cost;
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.total_bytes = 0;
    }

    fn evict_if_needed(&mut self) {
        while self.entries.len() > self.max_items || self.total_bytes > self.max_bytes {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(id, _)| *id);
            match oldest {
                Some(id) => self.remove(id),
                None => break,
            }
        }
    }
}

fn artifact_cost(artifact: &RenderArtifact) -> u64 {
    let html = artifact.html_rendered.as_deref().map_or(0, str::len);
    let text = artifact.text_rendered.as_deref().map_or(0, str::len);
    (html + text) as u64
}

/// Two-tier render cache
pub struct RenderCache {
    db: MetadataDb,
    config: RenderCacheConfig,
    memory: Mutex<MemoryTier>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl RenderCache {
    /// Create a cache over the shared metadata database
    pub fn new(db: MetadataDb, config: RenderCacheConfig) -> Self {
        let memory = MemoryTier::new(config.memory_max_items, config.memory_max_bytes);
        Self {
            db,
            config,
            memory: Mutex::new(memory),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Store a render artifact, replacing any previous row for the message
    ///
    /// Fields above the compression threshold are persisted compressed when
    /// that actually shrinks them. The memory tier receives the uncompressed
    /// artifact at its full byte cost.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` when both fields are absent.
    pub async fn store(
        &self,
        message_id: Uuid,
        html: Option<&str>,
        text: Option<&str>,
        generator_version: u32,
    ) -> StoreResult<()> {
        if html.is_none() && text.is_none() {
            return Err(StoreError::invalid(
                "a render artifact needs at least one of html/text",
            ));
        }

        let generated_at = Utc::now();
        let html_stored = html.map(|h| self.encode_field(h));
        let text_stored = text.map(|t| self.encode_field(t));
        self.db.upsert_render(
            message_id,
            html_stored.as_deref(),
            text_stored.as_deref(),
            generated_at,
            generator_version,
        )?;

        let artifact = RenderArtifact {
            message_id,
            html_rendered: html.map(str::to_owned),
            text_rendered: text.map(str::to_owned),
            generated_at,
            generator_version,
        };
        self.memory.lock().await.put(artifact);
        debug!(message_id = %message_id, generator_version, "render artifact cached");
        Ok(())
    }

    /// Retrieve the artifact for a message
    ///
    /// Memory tier first; on miss the durable row is loaded, decompressed
    /// per field, and promoted into memory.
    pub async fn retrieve(&self, message_id: Uuid) -> StoreResult<Option<RenderArtifact>> {
        if let Some(artifact) = self.memory.lock().await.get(message_id) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(artifact));
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let Some(row) = self.db.get_render(message_id)? else {
            return Ok(None);
        };
        let artifact = RenderArtifact {
            message_id: row.message_id,
            html_rendered: row.html_rendered.as_deref().map(decode_field).transpose()?,
            text_rendered: row.text_rendered.as_deref().map(decode_field).transpose()?,
            generated_at: row.generated_at,
            generator_version: row.generator_version,
        };
        self.memory.lock().await.put(artifact.clone());
        Ok(Some(artifact))
    }

    /// Whether a row exists at or above the required generator version
    pub fn has_valid_cache(&self, message_id: Uuid, required_version: u32) -> StoreResult<bool> {
        Ok(self
            .db
            .render_version(message_id)?
            .is_some_and(|version| version >= required_version))
    }

    /// Drop the artifact for one message from both tiers
    pub async fn invalidate(&self, message_id: Uuid) -> StoreResult<bool> {
        self.memory.lock().await.remove(message_id);
        self.db.delete_render(message_id)
    }

    /// Drop every artifact; returns the row count removed
    pub async fn invalidate_all(&self) -> StoreResult<u64> {
        self.memory.lock().await.clear();
        let removed = self.db.delete_all_renders()?;
        info!(removed, "render cache fully invalidated");
        Ok(removed)
    }

    /// Drop artifacts produced by generator versions below `version`
    pub async fn invalidate_older_than_version(&self, version: u32) -> StoreResult<u64> {
        self.memory.lock().await.clear();
        let removed = self.db.delete_renders_older_than_version(version)?;
        info!(removed, version, "render cache invalidated by version");
        Ok(removed)
    }

    /// Drop artifacts generated before `cutoff`
    pub async fn invalidate_older_than_date(
        &self,
        cutoff: chrono::DateTime<Utc>,
    ) -> StoreResult<u64> {
        self.memory.lock().await.clear();
        let removed = self.db.delete_renders_older_than_date(cutoff)?;
        info!(removed, %cutoff, "render cache invalidated by age");
        Ok(removed)
    }

    /// Warm the memory tier for a batch of messages in parallel
    pub async fn preload(&self, message_ids: &[Uuid]) -> StoreResult<usize> {
        let loads = message_ids.iter().map(|id| self.retrieve(*id));
        let results = futures::future::join_all(loads).await;
        let mut warmed = 0;
        for result in results {
            if result?.is_some() {
                warmed += 1;
            }
        }
        Ok(warmed)
    }

    /// Remove expired rows per the configured expiration window
    pub async fn maintenance(&self) -> StoreResult<u64> {
        let cutoff = Utc::now() - ChronoDuration::days(self.config.expiration_days);
        self.invalidate_older_than_date(cutoff).await
    }

    /// Snapshot of cache statistics
    pub async fn stats(&self) -> StoreResult<RenderCacheStats> {
        let memory = self.memory.lock().await;
        Ok(RenderCacheStats {
            memory_items: memory.entries.len(),
            memory_bytes: memory.total_bytes,
            durable_rows: self.db.render_row_count()?,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        })
    }

    /// Encode one field for persistence
    ///
    /// Compresses above the threshold when compression wins. A plain field
    /// that happens to start with the compressed-form prefix is compressed
    /// unconditionally so the stored form stays unambiguous.
    fn encode_field(&self, value: &str) -> String {
        let must_compress = value.starts_with(COMPRESSED_PREFIX);
        if value.len() > self.config.compression_threshold || must_compress {
            if let Some(compressed) = compress_field(value)
                && (must_compress || compressed.len() < value.len())
            {
                return compressed;
            }
        }
        value.to_owned()
    }
}

/// Gzip-compress and base64-wrap a field
fn compress_field(value: &str) -> Option<String> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(value.as_bytes()).ok()?;
    let compressed = encoder.finish().ok()?;
    Some(base64::engine::general_purpose::STANDARD.encode(compressed))
}

/// Decode one persisted field, detecting compression by its magic prefix
fn decode_field(stored: &str) -> StoreResult<String> {
    if !stored.starts_with(COMPRESSED_PREFIX) {
        return Ok(stored.to_owned());
    }
    let compressed = base64::engine::general_purpose::STANDARD
        .decode(stored.as_bytes())
        .map_err(|e| StoreError::Encoding(format!("corrupt compressed cache field: {e}")))?;
    let mut decoder = GzDecoder::new(compressed.as_slice());
    let mut out = String::new();
    decoder
        .read_to_string(&mut out)
        .map_err(|e| StoreError::Encoding(format!("corrupt compressed cache field: {e}")))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use chrono::{Duration as ChronoDuration, Utc};
    use uuid::Uuid;

    use super::{COMPRESSED_PREFIX, RenderCache, compress_field, decode_field};
    use crate::config::RenderCacheConfig;
    use crate::db::MetadataDb;

    fn cache_with(config: RenderCacheConfig) -> RenderCache {
        let db = MetadataDb::open_in_memory().expect("db opens");
        RenderCache::new(db, config)
    }

    fn default_cache() -> RenderCache {
        cache_with(RenderCacheConfig::default())
    }

    #[tokio::test]
    async fn round_trips_small_and_large_fields() {
        let cache = default_cache();
        let id = Uuid::new_v4();
        let large_html = format!("<div>{}</div>", "content ".repeat(4_000));

        cache
            .store(id, Some(&large_html), Some("plain text body"), 2)
            .await
            .expect("store");

        // Force the durable path by dropping the memory tier entry.
        cache.memory.lock().await.clear();
        let loaded = cache
            .retrieve(id)
            .await
            .expect("retrieve")
            .expect("present");
        assert_eq!(loaded.html_rendered.as_deref(), Some(large_html.as_str()));
        assert_eq!(loaded.text_rendered.as_deref(), Some("plain text body"));
        assert_eq!(loaded.generator_version, 2);
    }

    #[tokio::test]
    async fn large_fields_are_stored_compressed() {
        let cache = default_cache();
        let id = Uuid::new_v4();
        let large_html = format!("<p>{}</p>", "repetitive filler ".repeat(2_000));
        cache
            .store(id, Some(&large_html), None, 1)
            .await
            .expect("store");

        let row = cache.db.get_render(id).expect("query").expect("present");
        let stored = row.html_rendered.expect("html stored");
        assert!(stored.starts_with(COMPRESSED_PREFIX));
        assert!(stored.len() < large_html.len());
    }

    #[test]
    fn field_codec_round_trips_even_for_magic_prefixed_plain_text() {
        let plain = "H4sIlooks like gzip but is not";
        let compressed = compress_field(plain).expect("compresses");
        assert_eq!(decode_field(&compressed).expect("decodes"), plain);

        let normal = "short body";
        assert_eq!(decode_field(normal).expect("passthrough"), normal);
    }

    #[tokio::test]
    async fn rejects_empty_artifacts() {
        let cache = default_cache();
        assert!(cache.store(Uuid::new_v4(), None, None, 1).await.is_err());
    }

    #[tokio::test]
    async fn has_valid_cache_compares_generator_versions() {
        let cache = default_cache();
        let id = Uuid::new_v4();
        cache
            .store(id, None, Some("text"), 3)
            .await
            .expect("store");

        assert!(cache.has_valid_cache(id, 3).expect("query"));
        assert!(cache.has_valid_cache(id, 2).expect("query"));
        assert!(!cache.has_valid_cache(id, 4).expect("query"));
        assert!(!cache.has_valid_cache(Uuid::new_v4(), 1).expect("query"));
    }

    #[tokio::test]
    async fn version_sweep_removes_only_older_rows() {
        let cache = default_cache();
        let old = Uuid::new_v4();
        let new = Uuid::new_v4();
        cache.store(old, None, Some("old"), 1).await.expect("store");
        cache.store(new, None, Some("new"), 5).await.expect("store");

        let removed = cache
            .invalidate_older_than_version(5)
            .await
            .expect("sweep");
        assert_eq!(removed, 1);
        assert!(cache.retrieve(old).await.expect("ok").is_none());
        assert!(cache.retrieve(new).await.expect("ok").is_some());
    }

    #[tokio::test]
    async fn date_sweep_removes_only_older_rows() {
        let cache = default_cache();
        let id = Uuid::new_v4();
        cache.store(id, None, Some("kept"), 1).await.expect("store");

        let removed = cache
            .invalidate_older_than_date(Utc::now() - ChronoDuration::days(1))
            .await
            .expect("sweep");
        assert_eq!(removed, 0);
        assert!(cache.retrieve(id).await.expect("ok").is_some());

        let removed = cache
            .invalidate_older_than_date(Utc::now() + ChronoDuration::seconds(1))
            .await
            .expect("sweep");
        assert_eq!(removed, 1);
    }

    #[tokio::test]
    async fn memory_tier_evicts_by_count_and_cost() {
        let config = RenderCacheConfig {
            memory_max_items: 2,
            memory_max_bytes: 1_000_000,
            ..RenderCacheConfig::default()
        };
        let cache = cache_with(config);
        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            cache
                .store(*id, None, Some("body"), 1)
                .await
                .expect("store");
        }
        let stats = cache.stats().await.expect("stats");
        assert_eq!(stats.memory_items, 2);
        assert_eq!(stats.durable_rows, 3);

        let config = RenderCacheConfig {
            memory_max_items: 100,
            memory_max_bytes: 10,
            ..RenderCacheConfig::default()
        };
        let cache = cache_with(config);
        cache
            .store(Uuid::new_v4(), None, Some("a body larger than ten bytes"), 1)
            .await
            .expect("store");
        let stats = cache.stats().await.expect("stats");
        assert_eq!(stats.memory_items, 0, "oversized entry evicted immediately");
    }

    #[tokio::test]
    async fn preload_warms_memory_and_counts_hits() {
        let cache = default_cache();
        let ids: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            cache
                .store(*id, Some("<p>x</p>"), None, 1)
                .await
                .expect("store");
        }
        cache.memory.lock().await.clear();

        let warmed = cache.preload(&ids).await.expect("preload");
        assert_eq!(warmed, 4);

        for id in &ids {
            assert!(cache.retrieve(*id).await.expect("ok").is_some());
        }
        let stats = cache.stats().await.expect("stats");
        assert_eq!(stats.hits, 4);
        assert_eq!(stats.misses, 4);
    }
}
