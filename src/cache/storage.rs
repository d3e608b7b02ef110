//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use super::error::{CacheError, Result};
use super::types::{blob_key, checksum, CacheEntry, CacheStats, CachedContent, ContentKind, Payload};

/// Trait for cache storage backends.
///
/// Methods are synchronous; the cache layer runs them on the blocking pool.
/// Every method is atomic with respect to the others.
pub trait CacheStorage: Send + Sync + 'static {
  /// Insert or replace the entry for `id`. A new entry gets `now` as both
  /// timestamps; a replaced one keeps its `created_at`.
  fn store(&self, id: &str, payload: &Payload, now: DateTime<Utc>) -> Result<CacheEntry>;

  /// Read the entry for `id` and stamp its access time with `now`.
  ///
  /// Entries last accessed at or before `cutoff` are deleted and reported as
  /// `NotFound`. A blob entry whose blob row is missing or damaged is deleted
  /// and reported as `Corrupt`.
  fn load(&self, id: &str, now: DateTime<Utc>, cutoff: Option<DateTime<Utc>>)
    -> Result<CachedContent>;

  /// Delete the entry and any blob it owns. Returns false if there was none.
  fn remove(&self, id: &str) -> Result<bool>;

  /// Delete every entry last accessed at or before `cutoff`, oldest first.
  /// Returns the evicted ids.
  fn evict(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>>;

  /// All entries, most recently accessed first.
  fn entries(&self) -> Result<Vec<CacheEntry>>;

  fn stats(&self) -> Result<CacheStats>;
}

/// Storage implementation that doesn't cache anything.
/// Used when caching is disabled - all operations are no-ops.
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn store(&self, id: &str, payload: &Payload, now: DateTime<Utc>) -> Result<CacheEntry> {
    // Discard, but report what would have been written
    let payload_ref = match payload {
      Payload::Reference(locator) => locator.clone(),
      Payload::Blob { filename, .. } => blob_key(id, filename),
    };
    Ok(CacheEntry {
      id: id.to_string(),
      kind: payload.kind(),
      payload_ref,
      created_at: now,
      last_accessed_at: now,
    })
  }

  fn load(
    &self,
    id: &str,
    _now: DateTime<Utc>,
    _cutoff: Option<DateTime<Utc>>,
  ) -> Result<CachedContent> {
    Err(CacheError::NotFound(id.to_string())) // Always miss
  }

  fn remove(&self, _id: &str) -> Result<bool> {
    Ok(false)
  }

  fn evict(&self, _cutoff: DateTime<Utc>) -> Result<Vec<String>> {
    Ok(Vec::new())
  }

  fn entries(&self) -> Result<Vec<CacheEntry>> {
    Ok(Vec::new())
  }

  fn stats(&self) -> Result<CacheStats> {
    Ok(CacheStats::default())
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the cache database at the default location.
  pub fn open() -> Result<Self> {
    let path = Self::default_path()?;
    Self::open_at(&path)
  }

  /// Open (creating if needed) the cache database at `path`.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
      std::fs::create_dir_all(parent).map_err(|e| {
        CacheError::StorageUnavailable(format!(
          "failed to create cache directory {}: {}",
          parent.display(),
          e
        ))
      })?;
    }

    let conn = Connection::open(path).map_err(|e| {
      CacheError::StorageUnavailable(format!(
        "failed to open cache database at {}: {}",
        path.display(),
        e
      ))
    })?;

    let journal: String = conn
      .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
      .map_err(|e| CacheError::StorageUnavailable(format!("failed to enable WAL: {}", e)))?;
    tracing::debug!("Cache database {} opened (journal_mode={})", path.display(), journal);
    conn.busy_timeout(Duration::from_secs(5))?;

    Self::from_connection(conn)
  }

  /// A private database that lives as long as the storage does.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| CacheError::StorageUnavailable(format!("failed to open in-memory cache: {}", e)))?;
    Self::from_connection(conn)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| CacheError::StorageUnavailable("could not determine data directory".into()))?;

    Ok(data_dir.join("paperstash").join("cache.db"))
  }

  fn from_connection(mut conn: Connection) -> Result<Self> {
    run_migrations(&mut conn)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|_| CacheError::LockPoisoned)
  }

  #[cfg(test)]
  pub(crate) fn execute_raw(&self, sql: &str) -> Result<()> {
    self.lock()?.execute_batch(sql)?;
    Ok(())
  }

  #[cfg(test)]
  pub(crate) fn blob_count(&self) -> Result<i64> {
    let conn = self.lock()?;
    Ok(conn.query_row("SELECT COUNT(*) FROM cache_blobs", [], |row| row.get(0))?)
  }

  #[cfg(test)]
  pub(crate) fn has_blob(&self, key: &str) -> Result<bool> {
    let conn = self.lock()?;
    let found: Option<i64> = conn
      .query_row("SELECT 1 FROM cache_blobs WHERE key = ?1", params![key], |row| row.get(0))
      .optional()?;
    Ok(found.is_some())
  }
}

/// Schema migrations, applied in order. `PRAGMA user_version` records how
/// many have run.
const MIGRATIONS: &[&str] = &[r#"
-- Metadata: one row per cached document
CREATE TABLE IF NOT EXISTS cache_meta (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL CHECK (kind IN ('reference', 'blob')),
    payload_ref TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    last_accessed_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_cache_meta_last_accessed
    ON cache_meta(last_accessed_at);

-- Binary payloads, owned by exactly one blob-kind metadata row
CREATE TABLE IF NOT EXISTS cache_blobs (
    key TEXT PRIMARY KEY,
    filename TEXT NOT NULL,
    size INTEGER NOT NULL,
    sha256 TEXT NOT NULL,
    data BLOB NOT NULL
);
"#];

/// Run database migrations for cache tables.
fn run_migrations(conn: &mut Connection) -> Result<()> {
  let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
  let current = usize::try_from(version).unwrap_or(0);

  if current > MIGRATIONS.len() {
    return Err(CacheError::StorageUnavailable(format!(
      "cache schema version {} is newer than supported version {}",
      current,
      MIGRATIONS.len()
    )));
  }
  if current == MIGRATIONS.len() {
    return Ok(());
  }

  let tx = conn.transaction().map_err(CacheError::TransactionFailed)?;
  for migration in &MIGRATIONS[current..] {
    tx.execute_batch(migration)?;
  }
  tx.pragma_update(None, "user_version", MIGRATIONS.len() as i64)?;
  tx.commit().map_err(CacheError::TransactionFailed)?;

  tracing::debug!("Cache schema migrated from v{} to v{}", current, MIGRATIONS.len());
  Ok(())
}

const ENTRY_COLUMNS: &str = "id, kind, payload_ref, created_at, last_accessed_at";

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<CacheEntry> {
  let kind: String = row.get(1)?;
  let kind = ContentKind::parse(&kind).ok_or_else(|| {
    rusqlite::Error::FromSqlConversionFailure(1, Type::Text, format!("unknown kind {}", kind).into())
  })?;

  Ok(CacheEntry {
    id: row.get(0)?,
    kind,
    payload_ref: row.get(2)?,
    created_at: from_millis(row.get(3)?, 3)?,
    last_accessed_at: from_millis(row.get(4)?, 4)?,
  })
}

fn from_millis(ms: i64, column: usize) -> rusqlite::Result<DateTime<Utc>> {
  DateTime::<Utc>::from_timestamp_millis(ms).ok_or_else(|| {
    rusqlite::Error::FromSqlConversionFailure(
      column,
      Type::Integer,
      format!("timestamp {} out of range", ms).into(),
    )
  })
}

fn find_entry(conn: &Connection, id: &str) -> Result<Option<CacheEntry>> {
  let sql = format!("SELECT {} FROM cache_meta WHERE id = ?1", ENTRY_COLUMNS);
  Ok(conn.query_row(&sql, params![id], row_to_entry).optional()?)
}

/// Delete a metadata row and, for blob entries, its blob.
/// Callers run this inside a transaction.
fn delete_entry(conn: &Connection, entry: &CacheEntry) -> Result<()> {
  if entry.kind == ContentKind::Blob {
    conn.execute("DELETE FROM cache_blobs WHERE key = ?1", params![entry.payload_ref])?;
  }
  conn.execute("DELETE FROM cache_meta WHERE id = ?1", params![entry.id])?;
  Ok(())
}

impl CacheStorage for SqliteStorage {
  fn store(&self, id: &str, payload: &Payload, now: DateTime<Utc>) -> Result<CacheEntry> {
    let mut conn = self.lock()?;
    let tx = conn.transaction().map_err(CacheError::TransactionFailed)?;

    let previous = find_entry(&tx, id)?;

    let payload_ref = match payload {
      Payload::Reference(locator) => locator.clone(),
      Payload::Blob { filename, bytes } => {
        let key = blob_key(id, filename);
        tx.execute(
          "INSERT OR REPLACE INTO cache_blobs (key, filename, size, sha256, data)
           VALUES (?1, ?2, ?3, ?4, ?5)",
          params![key, filename, bytes.len() as i64, checksum(bytes), bytes],
        )?;
        key
      }
    };

    // Drop a blob the entry no longer points at
    if let Some(old) = previous {
      if old.kind == ContentKind::Blob && old.payload_ref != payload_ref {
        tx.execute("DELETE FROM cache_blobs WHERE key = ?1", params![old.payload_ref])?;
      }
    }

    tx.execute(
      "INSERT INTO cache_meta (id, kind, payload_ref, created_at, last_accessed_at)
       VALUES (?1, ?2, ?3, ?4, ?4)
       ON CONFLICT(id) DO UPDATE SET
         kind = excluded.kind,
         payload_ref = excluded.payload_ref,
         last_accessed_at = MAX(excluded.last_accessed_at, cache_meta.created_at)",
      params![id, payload.kind().as_str(), payload_ref, now.timestamp_millis()],
    )?;

    let entry = find_entry(&tx, id)?.ok_or_else(|| CacheError::NotFound(id.to_string()))?;
    tx.commit().map_err(CacheError::TransactionFailed)?;

    Ok(entry)
  }

  fn load(
    &self,
    id: &str,
    now: DateTime<Utc>,
    cutoff: Option<DateTime<Utc>>,
  ) -> Result<CachedContent> {
    let mut conn = self.lock()?;
    let tx = conn.transaction().map_err(CacheError::TransactionFailed)?;

    let entry = find_entry(&tx, id)?.ok_or_else(|| CacheError::NotFound(id.to_string()))?;

    if cutoff.is_some_and(|cutoff| entry.last_accessed_at <= cutoff) {
      delete_entry(&tx, &entry)?;
      tx.commit().map_err(CacheError::TransactionFailed)?;
      tracing::debug!("Dropped expired cache entry {} on read", id);
      return Err(CacheError::NotFound(id.to_string()));
    }

    let payload = match entry.kind {
      ContentKind::Reference => Payload::Reference(entry.payload_ref.clone()),
      ContentKind::Blob => {
        let blob: Option<(String, String, Vec<u8>)> = tx
          .query_row(
            "SELECT filename, sha256, data FROM cache_blobs WHERE key = ?1",
            params![entry.payload_ref],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
          )
          .optional()?;

        let reason = match &blob {
          None => Some("blob record missing"),
          Some((_, sum, bytes)) if checksum(bytes) != *sum => Some("blob checksum mismatch"),
          Some(_) => None,
        };

        match (blob, reason) {
          (Some((filename, _, bytes)), None) => Payload::Blob { filename, bytes },
          (_, reason) => {
            // Self-heal: leave neither a dangling reference nor a bad blob behind
            delete_entry(&tx, &entry)?;
            tx.commit().map_err(CacheError::TransactionFailed)?;
            return Err(CacheError::Corrupt {
              id: id.to_string(),
              reason: reason.unwrap_or("unreadable blob").to_string(),
            });
          }
        }
      }
    };

    tx.execute(
      "UPDATE cache_meta SET last_accessed_at = MAX(?2, created_at) WHERE id = ?1",
      params![id, now.timestamp_millis()],
    )?;
    tx.commit().map_err(CacheError::TransactionFailed)?;

    Ok(CachedContent {
      payload,
      created_at: entry.created_at,
      last_accessed_at: now.max(entry.created_at),
    })
  }

  fn remove(&self, id: &str) -> Result<bool> {
    let mut conn = self.lock()?;
    let tx = conn.transaction().map_err(CacheError::TransactionFailed)?;

    let Some(entry) = find_entry(&tx, id)? else {
      return Ok(false);
    };

    delete_entry(&tx, &entry)?;
    tx.commit().map_err(CacheError::TransactionFailed)?;

    Ok(true)
  }

  fn evict(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
    let mut conn = self.lock()?;
    let tx = conn.transaction().map_err(CacheError::TransactionFailed)?;

    let expired: Vec<CacheEntry> = {
      let sql = format!(
        "SELECT {} FROM cache_meta WHERE last_accessed_at <= ?1 ORDER BY last_accessed_at ASC",
        ENTRY_COLUMNS
      );
      let mut stmt = tx.prepare(&sql)?;
      let rows = stmt.query_map(params![cutoff.timestamp_millis()], row_to_entry)?;
      rows.collect::<rusqlite::Result<Vec<_>>>()?
    };

    for entry in &expired {
      delete_entry(&tx, entry)?;
    }
    tx.commit().map_err(CacheError::TransactionFailed)?;

    Ok(expired.into_iter().map(|e| e.id).collect())
  }

  fn entries(&self) -> Result<Vec<CacheEntry>> {
    let conn = self.lock()?;
    let sql = format!(
      "SELECT {} FROM cache_meta ORDER BY last_accessed_at DESC, id ASC",
      ENTRY_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], row_to_entry)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
  }

  fn stats(&self) -> Result<CacheStats> {
    let conn = self.lock()?;

    let (references, blobs, oldest, newest): (i64, i64, Option<i64>, Option<i64>) = conn.query_row(
      "SELECT
         COALESCE(SUM(kind = 'reference'), 0),
         COALESCE(SUM(kind = 'blob'), 0),
         MIN(last_accessed_at),
         MAX(last_accessed_at)
       FROM cache_meta",
      [],
      |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
    )?;

    let blob_bytes: i64 =
      conn.query_row("SELECT COALESCE(SUM(size), 0) FROM cache_blobs", [], |row| row.get(0))?;

    Ok(CacheStats {
      references: references as u64,
      blobs: blobs as u64,
      blob_bytes: blob_bytes as u64,
      oldest_access: oldest.map(|ms| from_millis(ms, 2)).transpose()?,
      newest_access: newest.map(|ms| from_millis(ms, 3)).transpose()?,
    })
  }
}
