use thiserror::Error;

/// Everything that can go wrong inside the content cache.
///
/// `NotFound` and `Corrupt` are lookup outcomes rather than failures; the
/// cache layer folds both into a miss before anything reaches the caller.
#[derive(Error, Debug)]
pub enum CacheError {
  #[error("Cache storage unavailable: {0}")]
  StorageUnavailable(String),

  #[error("No cache entry for {0}")]
  NotFound(String),

  #[error("Cache entry {id} is corrupt: {reason}")]
  Corrupt { id: String, reason: String },

  #[error("Cache transaction failed: {0}")]
  TransactionFailed(#[source] rusqlite::Error),

  #[error("Cache storage error: {0}")]
  Storage(#[from] rusqlite::Error),

  #[error("Cache lock poisoned")]
  LockPoisoned,

  #[error("Cache task failed: {0}")]
  Task(#[from] tokio::task::JoinError),
}

impl CacheError {
  /// True for outcomes that mean "go fetch it" rather than "something broke".
  pub fn is_miss(&self) -> bool {
    matches!(self, CacheError::NotFound(_) | CacheError::Corrupt { .. })
  }
}

pub type Result<T> = std::result::Result<T, CacheError>;
