//! Embedded metadata store
//!
//! A single rusqlite database under `base_dir/metadata.db` holds all
//! durable metadata: blob records, render-cache rows, MIME part rows,
//! attachment rows, and message rows. The connection runs in WAL mode and is
//! shared behind a mutex: one writer at a time, short lock scopes, explicit
//! transactions for multi-statement writes.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;
use uuid::Uuid;

use crate::errors::{StoreError, StoreResult};
use crate::models::{
    Attachment, BlobMeta, Disposition, MessageRecord, MimePart, RenderArtifact, ScanStatus,
};

/// Aggregate counters over the blob table
#[derive(Debug, Clone, Default)]
pub struct BlobTableStats {
    /// Distinct blobs
    pub total_blobs: u64,
    /// Sum of blob sizes
    pub total_size: u64,
    /// Blobs referenced more than once (dedup wins)
    pub deduplicated_count: u64,
    /// Mean blob size, zero when the table is empty
    pub avg_size: u64,
}

/// Shared handle to the metadata database
#[derive(Clone)]
pub struct MetadataDb {
    conn: Arc<Mutex<Connection>>,
}

impl MetadataDb {
    /// Open (creating if needed) the metadata database at `path`
    ///
    /// Applies WAL mode and creates the schema idempotently.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        // journal_mode returns a result row, so it cannot go through execute.
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        debug!(path = %path.display(), "metadata database opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (tests, ephemeral use)
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Flush WAL contents into the main database file
    ///
    /// Called from `shutdown`; safe to call at any time.
    pub fn checkpoint(&self) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        Ok(())
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Internal("metadata database mutex poisoned".to_owned()))
    }

    // ----- blob_metadata -----

    /// Insert a fresh blob row with `ref_count = 1`
    pub fn insert_blob(&self, meta: &BlobMeta) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO blob_metadata \
             (hash, size_bytes, path, ref_count, created_at, last_accessed, quarantined) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                meta.blob_id,
                meta.size_bytes as i64,
                meta.relative_path,
                meta.ref_count as i64,
                meta.created_at.to_rfc3339(),
                meta.last_accessed_at.to_rfc3339(),
                meta.quarantined as i64,
            ],
        )?;
        Ok(())
    }

    /// Load a blob row
    pub fn get_blob(&self, blob_id: &str) -> StoreResult<Option<BlobMeta>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT hash, size_bytes, path, ref_count, created_at, last_accessed, quarantined \
             FROM blob_metadata WHERE hash = ?1",
            params![blob_id],
            blob_meta_from_row,
        )
        .optional()
        .map_err(StoreError::from)
    }

    /// Whether a blob row exists
    pub fn blob_exists(&self, blob_id: &str) -> StoreResult<bool> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM blob_metadata WHERE hash = ?1",
            params![blob_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Increment a blob's refcount and refresh its access time
    ///
    /// Returns false if no such row exists.
    pub fn increment_ref(&self, blob_id: &str) -> StoreResult<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE blob_metadata SET ref_count = ref_count + 1, last_accessed = ?2 \
             WHERE hash = ?1",
            params![blob_id, Utc::now().to_rfc3339()],
        )?;
        Ok(changed > 0)
    }

    /// Decrement a blob's refcount, clamping at zero
    ///
    /// Returns the refcount after the update, or `None` for a missing row.
    pub fn decrement_ref(&self, blob_id: &str) -> StoreResult<Option<u64>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE blob_metadata \
             SET ref_count = CASE WHEN ref_count > 0 THEN ref_count - 1 ELSE 0 END \
             WHERE hash = ?1",
            params![blob_id],
        )?;
        let remaining = tx
            .query_row(
                "SELECT ref_count FROM blob_metadata WHERE hash = ?1",
                params![blob_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        tx.commit()?;
        Ok(remaining.map(|v| v.max(0) as u64))
    }

    /// Refresh a blob's last-access timestamp
    pub fn touch_blob(&self, blob_id: &str) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE blob_metadata SET last_accessed = ?2 WHERE hash = ?1",
            params![blob_id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Delete a blob row
    pub fn delete_blob(&self, blob_id: &str) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM blob_metadata WHERE hash = ?1",
            params![blob_id],
        )?;
        Ok(())
    }

    /// Set or clear a blob's quarantine flag
    pub fn set_blob_quarantined(&self, blob_id: &str, quarantined: bool) -> StoreResult<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE blob_metadata SET quarantined = ?2 WHERE hash = ?1",
            params![blob_id, quarantined as i64],
        )?;
        Ok(changed > 0)
    }

    /// Blob ids with refcount zero that are not quarantined
    ///
    /// Served by the partial index over `ref_count = 0`.
    pub fn collectable_blobs(&self) -> StoreResult<Vec<BlobMeta>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT hash, size_bytes, path, ref_count, created_at, last_accessed, quarantined \
             FROM blob_metadata WHERE ref_count = 0 AND quarantined = 0",
        )?;
        let rows = stmt.query_map([], blob_meta_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// All blob ids
    pub fn list_blob_ids(&self) -> StoreResult<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT hash FROM blob_metadata ORDER BY hash")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// All relative paths with a live row (orphan sweep input)
    pub fn list_blob_paths(&self) -> StoreResult<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT path FROM blob_metadata")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Aggregate counters over the blob table
    pub fn blob_stats(&self) -> StoreResult<BlobTableStats> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(size_bytes), 0), \
             COALESCE(SUM(CASE WHEN ref_count > 1 THEN 1 ELSE 0 END), 0) \
             FROM blob_metadata",
            [],
            |row| {
                let total_blobs: i64 = row.get(0)?;
                let total_size: i64 = row.get(1)?;
                let deduplicated: i64 = row.get(2)?;
                Ok(BlobTableStats {
                    total_blobs: total_blobs as u64,
                    total_size: total_size as u64,
                    deduplicated_count: deduplicated as u64,
                    avg_size: if total_blobs > 0 {
                        (total_size / total_blobs) as u64
                    } else {
                        0
                    },
                })
            },
        )
        .map_err(StoreError::from)
    }

    // ----- render_cache -----

    /// Insert or replace the render-cache row for a message
    pub fn upsert_render(
        &self,
        message_id: Uuid,
        html: Option<&str>,
        text: Option<&str>,
        generated_at: DateTime<Utc>,
        generator_version: u32,
    ) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO render_cache \
             (message_id, html_rendered, text_rendered, generated_at, generator_version) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(message_id) DO UPDATE SET \
             html_rendered = excluded.html_rendered, \
             text_rendered = excluded.text_rendered, \
             generated_at = excluded.generated_at, \
             generator_version = excluded.generator_version",
            params![
                message_id.to_string(),
                html,
                text,
                generated_at.to_rfc3339(),
                generator_version as i64,
            ],
        )?;
        Ok(())
    }

    /// Load the raw (possibly compressed) render-cache row
    pub fn get_render(&self, message_id: Uuid) -> StoreResult<Option<RenderArtifact>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT message_id, html_rendered, text_rendered, generated_at, generator_version \
             FROM render_cache WHERE message_id = ?1",
            params![message_id.to_string()],
            |row| {
                Ok(RenderArtifact {
                    message_id: parse_uuid_col(row.get::<_, String>(0)?)?,
                    html_rendered: row.get(1)?,
                    text_rendered: row.get(2)?,
                    generated_at: parse_ts_col(row.get::<_, String>(3)?)?,
                    generator_version: row.get::<_, i64>(4)? as u32,
                })
            },
        )
        .optional()
        .map_err(StoreError::from)
    }

    /// Generator version of the row for a message, if any
    pub fn render_version(&self, message_id: Uuid) -> StoreResult<Option<u32>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT generator_version FROM render_cache WHERE message_id = ?1",
            params![message_id.to_string()],
            |row| row.get::<_, i64>(0),
        )
        .optional()
        .map(|opt| opt.map(|v| v as u32))
        .map_err(StoreError::from)
    }

    /// Delete the row for one message; returns whether one existed
    pub fn delete_render(&self, message_id: Uuid) -> StoreResult<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "DELETE FROM render_cache WHERE message_id = ?1",
            params![message_id.to_string()],
        )?;
        Ok(changed > 0)
    }

    /// Delete every render-cache row; returns the count removed
    pub fn delete_all_renders(&self) -> StoreResult<u64> {
        let conn = self.lock()?;
        let changed = conn.execute("DELETE FROM render_cache", [])?;
        Ok(changed as u64)
    }

    /// Delete rows whose generator version is below `version`
    pub fn delete_renders_older_than_version(&self, version: u32) -> StoreResult<u64> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "DELETE FROM render_cache WHERE generator_version < ?1",
            params![version as i64],
        )?;
        Ok(changed as u64)
    }

    /// Delete rows generated before `cutoff`
    pub fn delete_renders_older_than_date(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "DELETE FROM render_cache WHERE generated_at < ?1",
            params![cutoff.to_rfc3339()],
        )?;
        Ok(changed as u64)
    }

    /// Number of durable render-cache rows
    pub fn render_row_count(&self) -> StoreResult<u64> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM render_cache", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    // ----- mime_parts -----

    /// Insert or update the part row for `(message_id, part_id)`
    pub fn upsert_mime_part(&self, message_id: Uuid, part: &MimePart) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO mime_parts \
             (message_id, part_id, parent, media_type, charset, transfer_encoding, disposition, \
              filename, content_id, size_octets, is_body_candidate, blob_id) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12) \
             ON CONFLICT(message_id, part_id) DO UPDATE SET \
             blob_id = COALESCE(excluded.blob_id, mime_parts.blob_id), \
             size_octets = excluded.size_octets",
            params![
                message_id.to_string(),
                part.part_id,
                part.parent,
                part.media_type,
                part.charset,
                part.transfer_encoding,
                part.disposition.map(|d| match d {
                    crate::models::Disposition::Inline => "inline",
                    crate::models::Disposition::Attachment => "attachment",
                }),
                part.filename_normalized,
                part.content_id,
                part.size_octets as i64,
                part.is_body_candidate as i64,
                part.blob_id,
            ],
        )?;
        Ok(())
    }

    /// Load one part row
    pub fn get_mime_part(&self, message_id: Uuid, part_id: &str) -> StoreResult<Option<MimePart>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT part_id, parent, media_type, charset, transfer_encoding, disposition, \
             filename, content_id, size_octets, is_body_candidate, blob_id \
             FROM mime_parts WHERE message_id = ?1 AND part_id = ?2",
            params![message_id.to_string(), part_id],
            mime_part_from_row,
        )
        .optional()
        .map_err(StoreError::from)
    }

    /// Bind a blob to an existing part row
    pub fn bind_part_blob(&self, message_id: Uuid, part_id: &str, blob_id: &str) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE mime_parts SET blob_id = ?3 WHERE message_id = ?1 AND part_id = ?2",
            params![message_id.to_string(), part_id, blob_id],
        )?;
        Ok(())
    }

    // ----- attachments -----

    /// Insert an attachment row; returns the new row id
    pub fn insert_attachment(&self, attachment: &Attachment) -> StoreResult<i64> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO attachments \
             (message_id, part_id, filename, media_type, storage_key, content_id, disposition, \
              size_bytes, inline_referenced, virus_scan_status) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                attachment.message_id.to_string(),
                attachment.part_id,
                attachment.filename,
                attachment.media_type,
                attachment.blob_id,
                attachment.content_id,
                if attachment.is_inline { "inline" } else { "attachment" },
                attachment.size_bytes as i64,
                attachment.is_inline as i64,
                attachment.scan_status.as_str(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// All attachments for a message
    pub fn list_attachments(&self, message_id: Uuid) -> StoreResult<Vec<Attachment>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, message_id, part_id, filename, media_type, storage_key, content_id, \
             size_bytes, inline_referenced, virus_scan_status \
             FROM attachments WHERE message_id = ?1 ORDER BY part_id",
        )?;
        let rows = stmt.query_map(params![message_id.to_string()], attachment_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Attachment for `(message_id, part_id)`, if any
    pub fn get_attachment_by_part(
        &self,
        message_id: Uuid,
        part_id: &str,
    ) -> StoreResult<Option<Attachment>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, message_id, part_id, filename, media_type, storage_key, content_id, \
             size_bytes, inline_referenced, virus_scan_status \
             FROM attachments WHERE message_id = ?1 AND part_id = ?2",
            params![message_id.to_string(), part_id],
            attachment_from_row,
        )
        .optional()
        .map_err(StoreError::from)
    }

    /// Inline attachment with the given Content-ID, if any
    pub fn get_attachment_by_cid(
        &self,
        message_id: Uuid,
        content_id: &str,
    ) -> StoreResult<Option<Attachment>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, message_id, part_id, filename, media_type, storage_key, content_id, \
             size_bytes, inline_referenced, virus_scan_status \
             FROM attachments WHERE message_id = ?1 AND content_id = ?2",
            params![message_id.to_string(), content_id],
            attachment_from_row,
        )
        .optional()
        .map_err(StoreError::from)
    }

    /// Bind a blob to an attachment row
    pub fn bind_attachment_blob(&self, id: i64, blob_id: &str) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE attachments SET storage_key = ?2 WHERE id = ?1",
            params![id, blob_id],
        )?;
        Ok(())
    }

    /// Refresh an attachment's scan status
    pub fn update_attachment_scan_status(&self, id: i64, status: ScanStatus) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE attachments SET virus_scan_status = ?2 WHERE id = ?1",
            params![id, status.as_str()],
        )?;
        Ok(())
    }

    // ----- messages -----

    /// Insert or update the message row
    pub fn upsert_message(&self, record: &MessageRecord) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO messages \
             (id, account_id, mailbox, uid, raw_rfc822_blob_id, subject, from_addr, has_attachments) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
             ON CONFLICT(id) DO UPDATE SET \
             raw_rfc822_blob_id = excluded.raw_rfc822_blob_id, \
             subject = excluded.subject, \
             from_addr = excluded.from_addr, \
             has_attachments = excluded.has_attachments",
            params![
                record.id.to_string(),
                record.account_id,
                record.mailbox,
                record.uid as i64,
                record.raw_rfc822_blob_id,
                record.subject,
                record.from_addr,
                record.has_attachments as i64,
            ],
        )?;
        Ok(())
    }

    /// Load a message row
    pub fn get_message(&self, message_id: Uuid) -> StoreResult<Option<MessageRecord>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, account_id, mailbox, uid, raw_rfc822_blob_id, subject, from_addr, \
             has_attachments FROM messages WHERE id = ?1",
            params![message_id.to_string()],
            |row| {
                Ok(MessageRecord {
                    id: parse_uuid_col(row.get::<_, String>(0)?)?,
                    account_id: row.get(1)?,
                    mailbox: row.get(2)?,
                    uid: row.get::<_, i64>(3)? as u32,
                    raw_rfc822_blob_id: row.get(4)?,
                    subject: row.get(5)?,
                    from_addr: row.get(6)?,
                    has_attachments: row.get::<_, i64>(7)? != 0,
                })
            },
        )
        .optional()
        .map_err(StoreError::from)
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS blob_metadata (
    hash TEXT PRIMARY KEY,
    size_bytes INTEGER NOT NULL,
    path TEXT NOT NULL,
    ref_count INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    last_accessed TEXT NOT NULL,
    quarantined INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_blob_collectable
    ON blob_metadata (hash) WHERE ref_count = 0;

CREATE TABLE IF NOT EXISTS render_cache (
    message_id TEXT PRIMARY KEY,
    html_rendered TEXT,
    text_rendered TEXT,
    generated_at TEXT NOT NULL,
    generator_version INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_render_version
    ON render_cache (generator_version);

CREATE TABLE IF NOT EXISTS mime_parts (
    message_id TEXT NOT NULL,
    part_id TEXT NOT NULL,
    parent TEXT,
    media_type TEXT NOT NULL,
    charset TEXT,
    transfer_encoding TEXT,
    disposition TEXT,
    filename TEXT,
    content_id TEXT,
    size_octets INTEGER NOT NULL DEFAULT 0,
    is_body_candidate INTEGER NOT NULL DEFAULT 0,
    blob_id TEXT,
    UNIQUE (message_id, part_id)
);

CREATE TABLE IF NOT EXISTS attachments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    message_id TEXT NOT NULL,
    part_id TEXT NOT NULL,
    filename TEXT NOT NULL,
    media_type TEXT NOT NULL,
    storage_key TEXT,
    content_id TEXT,
    disposition TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    inline_referenced INTEGER NOT NULL DEFAULT 0,
    virus_scan_status TEXT NOT NULL DEFAULT 'pending'
);
CREATE INDEX IF NOT EXISTS idx_attachments_message
    ON attachments (message_id);
CREATE INDEX IF NOT EXISTS idx_attachments_cid
    ON attachments (message_id, content_id);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    account_id TEXT NOT NULL,
    mailbox TEXT NOT NULL,
    uid INTEGER NOT NULL,
    raw_rfc822_blob_id TEXT NOT NULL,
    subject TEXT,
    from_addr TEXT,
    has_attachments INTEGER NOT NULL DEFAULT 0
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_identity
    ON messages (account_id, mailbox, uid);
";

fn blob_meta_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<BlobMeta> {
    Ok(BlobMeta {
        blob_id: row.get(0)?,
        size_bytes: row.get::<_, i64>(1)? as u64,
        relative_path: row.get(2)?,
        ref_count: row.get::<_, i64>(3)?.max(0) as u64,
        created_at: parse_ts_col(row.get::<_, String>(4)?)?,
        last_accessed_at: parse_ts_col(row.get::<_, String>(5)?)?,
        quarantined: row.get::<_, i64>(6)? != 0,
    })
}

fn mime_part_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MimePart> {
    let disposition: Option<String> = row.get(5)?;
    Ok(MimePart {
        part_id: row.get(0)?,
        parent: row.get(1)?,
        media_type: row.get(2)?,
        charset: row.get(3)?,
        transfer_encoding: row.get(4)?,
        disposition: disposition.as_deref().and_then(|d| match d {
            "inline" => Some(Disposition::Inline),
            "attachment" => Some(Disposition::Attachment),
            _ => None,
        }),
        filename_raw: None,
        filename_normalized: row.get(6)?,
        content_id: row.get(7)?,
        size_octets: row.get::<_, i64>(8)? as u64,
        is_body_candidate: row.get::<_, i64>(9)? != 0,
        blob_id: row.get(10)?,
    })
}

fn attachment_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Attachment> {
    let status: String = row.get(9)?;
    Ok(Attachment {
        id: row.get(0)?,
        message_id: parse_uuid_col(row.get::<_, String>(1)?)?,
        part_id: row.get(2)?,
        filename: row.get(3)?,
        media_type: row.get(4)?,
        blob_id: row.get(5)?,
        content_id: row.get(6)?,
        size_bytes: row.get::<_, i64>(7)? as u64,
        is_inline: row.get::<_, i64>(8)? != 0,
        scan_status: ScanStatus::parse(&status).unwrap_or(ScanStatus::Pending),
    })
}

fn parse_uuid_col(raw: String) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_ts_col(raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::MetadataDb;
    use crate::models::{Attachment, BlobMeta, MessageRecord, ScanStatus};

    fn sample_blob(id: &str, size: u64) -> BlobMeta {
        BlobMeta {
            blob_id: id.to_owned(),
            size_bytes: size,
            relative_path: format!("{}/{}/{id}", &id[0..2], &id[2..4]),
            ref_count: 1,
            created_at: Utc::now(),
            last_accessed_at: Utc::now(),
            quarantined: false,
        }
    }

    #[test]
    fn blob_refcount_clamps_at_zero() {
        let db = MetadataDb::open_in_memory().expect("opens");
        let id = "aa".repeat(32);
        db.insert_blob(&sample_blob(&id, 10)).expect("insert");

        assert_eq!(db.decrement_ref(&id).expect("dec"), Some(0));
        assert_eq!(db.decrement_ref(&id).expect("dec"), Some(0));
        assert!(db.increment_ref(&id).expect("inc"));
        let meta = db.get_blob(&id).expect("get").expect("present");
        assert_eq!(meta.ref_count, 1);
    }

    #[test]
    fn collectable_excludes_quarantined_rows() {
        let db = MetadataDb::open_in_memory().expect("opens");
        let a = "aa".repeat(32);
        let b = "bb".repeat(32);
        db.insert_blob(&sample_blob(&a, 10)).expect("insert a");
        db.insert_blob(&sample_blob(&b, 10)).expect("insert b");
        db.decrement_ref(&a).expect("dec a");
        db.decrement_ref(&b).expect("dec b");
        db.set_blob_quarantined(&b, true).expect("flag b");

        let collectable = db.collectable_blobs().expect("query");
        assert_eq!(collectable.len(), 1);
        assert_eq!(collectable[0].blob_id, a);
    }

    #[test]
    fn blob_stats_aggregate() {
        let db = MetadataDb::open_in_memory().expect("opens");
        let a = "aa".repeat(32);
        let b = "bb".repeat(32);
        db.insert_blob(&sample_blob(&a, 100)).expect("insert a");
        db.insert_blob(&sample_blob(&b, 300)).expect("insert b");
        db.increment_ref(&a).expect("inc");

        let stats = db.blob_stats().expect("stats");
        assert_eq!(stats.total_blobs, 2);
        assert_eq!(stats.total_size, 400);
        assert_eq!(stats.deduplicated_count, 1);
        assert_eq!(stats.avg_size, 200);
    }

    #[test]
    fn render_rows_replace_and_invalidate_by_version() {
        let db = MetadataDb::open_in_memory().expect("opens");
        let m1 = Uuid::new_v4();
        let m2 = Uuid::new_v4();
        db.upsert_render(m1, Some("<p>a</p>"), None, Utc::now(), 1)
            .expect("row 1");
        db.upsert_render(m2, Some("<p>b</p>"), None, Utc::now(), 3)
            .expect("row 2");

        let removed = db.delete_renders_older_than_version(2).expect("sweep");
        assert_eq!(removed, 1);
        assert!(db.get_render(m1).expect("query").is_none());
        assert_eq!(db.render_version(m2).expect("query"), Some(3));
    }

    #[test]
    fn attachment_round_trip_and_cid_lookup() {
        let db = MetadataDb::open_in_memory().expect("opens");
        let message_id = Uuid::new_v4();
        let mut attachment = Attachment {
            id: 0,
            message_id,
            part_id: "1.2".to_owned(),
            filename: "logo.png".to_owned(),
            media_type: "image/png".to_owned(),
            size_bytes: 2048,
            blob_id: Some("cc".repeat(32)),
            content_id: Some("logo@x".to_owned()),
            is_inline: true,
            scan_status: ScanStatus::Clean,
        };
        attachment.id = db.insert_attachment(&attachment).expect("insert");
        assert!(attachment.id > 0);

        let by_cid = db
            .get_attachment_by_cid(message_id, "logo@x")
            .expect("query")
            .expect("present");
        assert_eq!(by_cid.part_id, "1.2");
        assert_eq!(by_cid.scan_status, ScanStatus::Clean);

        db.update_attachment_scan_status(attachment.id, ScanStatus::Infected)
            .expect("update");
        let refreshed = db
            .get_attachment_by_part(message_id, "1.2")
            .expect("query")
            .expect("present");
        assert_eq!(refreshed.scan_status, ScanStatus::Infected);
    }

    #[test]
    fn message_row_upserts_by_id() {
        let db = MetadataDb::open_in_memory().expect("opens");
        let id = Uuid::new_v4();
        let record = MessageRecord {
            id,
            account_id: "default".to_owned(),
            mailbox: "INBOX".to_owned(),
            uid: 42,
            raw_rfc822_blob_id: "dd".repeat(32),
            subject: Some("Hi".to_owned()),
            from_addr: Some("sender@example.com".to_owned()),
            has_attachments: false,
        };
        db.upsert_message(&record).expect("insert");

        let mut updated = record.clone();
        updated.has_attachments = true;
        db.upsert_message(&updated).expect("update");

        let loaded = db.get_message(id).expect("query").expect("present");
        assert!(loaded.has_attachments);
        assert_eq!(loaded.uid, 42);
    }
}
