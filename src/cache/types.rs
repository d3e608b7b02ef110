//! Core types for cached content.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;

/// How an entry's payload is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
  /// The entry stores a remote locator string
  Reference,
  /// The entry points at a row in the blob table
  Blob,
}

impl ContentKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      ContentKind::Reference => "reference",
      ContentKind::Blob => "blob",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "reference" => Some(ContentKind::Reference),
      "blob" => Some(ContentKind::Blob),
      _ => None,
    }
  }
}

impl fmt::Display for ContentKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.pad(self.as_str())
  }
}

/// Content handed to or returned from the cache.
#[derive(Clone, PartialEq, Eq)]
pub enum Payload {
  /// A remote locator (URL)
  Reference(String),
  /// Raw bytes plus the filename they arrived under
  Blob { filename: String, bytes: Vec<u8> },
}

impl Payload {
  pub fn reference(locator: impl Into<String>) -> Self {
    Payload::Reference(locator.into())
  }

  pub fn blob(filename: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
    Payload::Blob {
      filename: filename.into(),
      bytes: bytes.into(),
    }
  }

  pub fn kind(&self) -> ContentKind {
    match self {
      Payload::Reference(_) => ContentKind::Reference,
      Payload::Blob { .. } => ContentKind::Blob,
    }
  }
}

// Blobs can be megabytes; keep them out of log lines.
impl fmt::Debug for Payload {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Payload::Reference(locator) => f.debug_tuple("Reference").field(locator).finish(),
      Payload::Blob { filename, bytes } => f
        .debug_struct("Blob")
        .field("filename", filename)
        .field("len", &bytes.len())
        .finish(),
    }
  }
}

/// Metadata row for one cached document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheEntry {
  pub id: String,
  pub kind: ContentKind,
  /// Locator for references, blob key for blobs
  pub payload_ref: String,
  pub created_at: DateTime<Utc>,
  pub last_accessed_at: DateTime<Utc>,
}

/// A cache hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedContent {
  pub payload: Payload,
  pub created_at: DateTime<Utc>,
  /// Access time stamped by this read
  pub last_accessed_at: DateTime<Utc>,
}

impl CachedContent {
  pub fn kind(&self) -> ContentKind {
    self.payload.kind()
  }
}

/// Result from a cache-aside lookup, including where the data came from.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the entry was first cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from freshly fetched data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
    }
  }
}

/// Indicates where returned data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fetched from the remote source on a miss
  Network,
  /// Served from the local cache
  Cache,
}

/// Aggregate numbers for `paperstash stats`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
  pub references: u64,
  pub blobs: u64,
  pub blob_bytes: u64,
  pub oldest_access: Option<DateTime<Utc>>,
  pub newest_access: Option<DateTime<Utc>>,
}

impl CacheStats {
  pub fn entries(&self) -> u64 {
    self.references + self.blobs
  }
}

/// Key for a blob owned by `id` that arrived as `filename`.
///
/// The same pair always yields the same key. Both parts are length-prefixed
/// before hashing so `("a:b", "c")` and `("a", "b:c")` cannot collide.
pub fn blob_key(id: &str, filename: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update((id.len() as u64).to_be_bytes());
  hasher.update(id.as_bytes());
  hasher.update((filename.len() as u64).to_be_bytes());
  hasher.update(filename.as_bytes());
  hex::encode(hasher.finalize())
}

/// Hex SHA-256 of a blob's bytes, stored alongside it to catch torn writes.
pub fn checksum(bytes: &[u8]) -> String {
  hex::encode(Sha256::digest(bytes))
}
