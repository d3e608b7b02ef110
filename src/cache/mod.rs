//! Local content cache for paper PDFs and their locators.
//!
//! This module provides a cache-aside store that:
//! - Keeps either a remote locator or the raw bytes for each document id
//! - Stores blobs in a separate table, written atomically with their metadata
//! - Refreshes an entry's access time on every read
//! - Evicts entries untouched for longer than a retention window, using an
//!   injectable policy and clock
//! - Rewrites known locator forms to a canonical one before storing

mod clock;
mod error;
mod eviction;
mod layer;
mod locator;
mod storage;
mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{CacheError, Result};
pub use eviction::{
  EvictionPolicy, KeepForever, RetentionWindow, SweepMode, SweepSchedule, DEFAULT_RETENTION_DAYS,
};
pub use layer::ContentCache;
pub use locator::{LocatorNormalizer, LocatorRule};
pub use storage::{CacheStorage, NoopStorage, SqliteStorage};
pub use types::{
  blob_key, CacheEntry, CacheResult, CacheSource, CacheStats, CachedContent, ContentKind, Payload,
};
