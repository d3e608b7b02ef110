//! Eviction policies and sweep scheduling.

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

/// Default retention window: an entry untouched for this long is expired.
pub const DEFAULT_RETENTION_DAYS: i64 = 7;

/// Decides which entries are old enough to drop.
pub trait EvictionPolicy: Send + Sync + 'static {
  /// Entries whose last access is at or before the returned instant are
  /// expired. `None` means nothing ever expires.
  fn cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>>;

  /// Whether an entry last touched at `last_accessed_at` is expired at `now`.
  fn is_expired(&self, last_accessed_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    self
      .cutoff(now)
      .is_some_and(|cutoff| last_accessed_at <= cutoff)
  }
}

impl<P: EvictionPolicy + ?Sized> EvictionPolicy for Box<P> {
  fn cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    (**self).cutoff(now)
  }
}

/// Expire entries not accessed within a fixed window.
#[derive(Debug, Clone, Copy)]
pub struct RetentionWindow {
  window: Duration,
}

impl RetentionWindow {
  pub fn new(window: Duration) -> Self {
    Self { window }
  }

  /// Window of `days` days, saturating at the largest representable span.
  pub fn days(days: i64) -> Self {
    Self::new(Duration::try_days(days).unwrap_or(Duration::MAX))
  }

  pub fn window(&self) -> Duration {
    self.window
  }
}

impl Default for RetentionWindow {
  fn default() -> Self {
    Self::days(DEFAULT_RETENTION_DAYS)
  }
}

impl EvictionPolicy for RetentionWindow {
  /// A window reaching back past the earliest representable instant has no
  /// cutoff: nothing can be that old.
  fn cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    now.checked_sub_signed(self.window)
  }
}

/// Never expire anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeepForever;

impl EvictionPolicy for KeepForever {
  fn cutoff(&self, _now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    None
  }
}

/// When the cache runs its eviction sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SweepSchedule {
  /// Sweep inline at the end of every `put`. Sweep failures are logged, the
  /// put still succeeds.
  #[default]
  AfterWrite,
  /// Spawn a sweep task after every `put` without waiting for it.
  Detached,
  /// Sweep on a timer; see `ContentCache::spawn_sweeper`.
  Background { interval: std::time::Duration },
  /// Only sweep when `evict_expired` is called.
  Manual,
}

/// Serialized form of [`SweepSchedule`] used in config files.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SweepMode {
  #[default]
  AfterWrite,
  Detached,
  Background,
  Manual,
}

impl SweepMode {
  pub fn into_schedule(self, interval: std::time::Duration) -> SweepSchedule {
    match self {
      SweepMode::AfterWrite => SweepSchedule::AfterWrite,
      SweepMode::Detached => SweepSchedule::Detached,
      SweepMode::Background => SweepSchedule::Background { interval },
      SweepMode::Manual => SweepSchedule::Manual,
    }
  }
}
