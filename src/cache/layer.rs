//! Cache layer that callers talk to.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::clock::{Clock, SystemClock};
use super::error::{CacheError, Result};
use super::eviction::{EvictionPolicy, RetentionWindow, SweepSchedule};
use super::locator::LocatorNormalizer;
use super::storage::CacheStorage;
use super::types::{CacheEntry, CacheResult, CacheStats, CachedContent, Payload};

/// Cache-aside store for paper content.
///
/// Storage work runs on tokio's blocking pool, so callers only suspend at
/// their own `.await` points. Every failure is logged here before it is
/// returned; a caller that gets an `Err` should fetch from the source.
pub struct ContentCache<S: CacheStorage, C: Clock = SystemClock> {
  storage: Arc<S>,
  clock: Arc<C>,
  policy: Arc<dyn EvictionPolicy>,
  normalizer: Arc<LocatorNormalizer>,
  schedule: SweepSchedule,
}

impl<S: CacheStorage> ContentCache<S, SystemClock> {
  /// Create a cache over `storage` with the wall clock, a 7 day retention
  /// window, the default locator rules and a sweep after every write.
  pub fn new(storage: S) -> Self {
    Self {
      storage: Arc::new(storage),
      clock: Arc::new(SystemClock),
      policy: Arc::new(RetentionWindow::default()),
      normalizer: Arc::new(LocatorNormalizer::default()),
      schedule: SweepSchedule::default(),
    }
  }
}

impl<S: CacheStorage, C: Clock> ContentCache<S, C> {
  /// Swap the time source.
  pub fn with_clock<C2: Clock>(self, clock: C2) -> ContentCache<S, C2> {
    ContentCache {
      storage: self.storage,
      clock: Arc::new(clock),
      policy: self.policy,
      normalizer: self.normalizer,
      schedule: self.schedule,
    }
  }

  pub fn with_policy(mut self, policy: impl EvictionPolicy) -> Self {
    self.policy = Arc::new(policy);
    self
  }

  pub fn with_normalizer(mut self, normalizer: LocatorNormalizer) -> Self {
    self.normalizer = Arc::new(normalizer);
    self
  }

  pub fn with_schedule(mut self, schedule: SweepSchedule) -> Self {
    self.schedule = schedule;
    self
  }

  pub fn schedule(&self) -> SweepSchedule {
    self.schedule
  }

  /// Run a storage call on the blocking pool.
  async fn blocking<T, F>(&self, f: F) -> Result<T>
  where
    T: Send + 'static,
    F: FnOnce(&S) -> Result<T> + Send + 'static,
  {
    let storage = Arc::clone(&self.storage);
    tokio::task::spawn_blocking(move || f(storage.as_ref())).await?
  }

  /// Store `payload` under `id`, replacing whatever was there.
  ///
  /// Reference locators are normalized first. Depending on the sweep
  /// schedule an eviction sweep follows; its failures are logged only.
  pub async fn put(&self, id: &str, payload: Payload) -> Result<()> {
    self.store(id, self.canonical(payload)).await
  }

  /// Payload as it is stored: reference locators in normalized form.
  fn canonical(&self, payload: Payload) -> Payload {
    match payload {
      Payload::Reference(locator) => Payload::Reference(self.normalizer.normalize(&locator)),
      blob => blob,
    }
  }

  async fn store(&self, id: &str, payload: Payload) -> Result<()> {
    let now = self.clock.now();

    let owned_id = id.to_string();
    let entry = self
      .blocking(move |s| s.store(&owned_id, &payload, now))
      .await
      .map_err(|e| {
        warn!("Failed to cache {}: {}", id, e);
        e
      })?;
    debug!("Cached {} as {} ({})", entry.id, entry.kind, entry.payload_ref);

    self.after_write().await;
    Ok(())
  }

  async fn after_write(&self) {
    match self.schedule {
      SweepSchedule::AfterWrite => {
        // evict_expired already logs failures
        let _ = self.evict_expired().await;
      }
      SweepSchedule::Detached => {
        let cache = self.clone();
        tokio::spawn(async move {
          let _ = cache.evict_expired().await;
        });
      }
      SweepSchedule::Background { .. } | SweepSchedule::Manual => {}
    }
  }

  /// Look up `id`, refreshing its access time on a hit.
  ///
  /// Missing, expired and corrupt entries all come back as `Ok(None)`.
  pub async fn get(&self, id: &str) -> Result<Option<CachedContent>> {
    let now = self.clock.now();
    let cutoff = self.policy.cutoff(now);

    let owned_id = id.to_string();
    match self.blocking(move |s| s.load(&owned_id, now, cutoff)).await {
      Ok(content) => {
        debug!("Cache hit for {}", id);
        Ok(Some(content))
      }
      Err(CacheError::NotFound(_)) => {
        debug!("Cache miss for {}", id);
        Ok(None)
      }
      Err(e @ CacheError::Corrupt { .. }) => {
        warn!("{}; treating as a miss", e);
        Ok(None)
      }
      Err(e) => {
        warn!("Failed to read {} from cache: {}", id, e);
        Err(e)
      }
    }
  }

  /// Drop `id` and its blob. Returns false if there was nothing to drop.
  pub async fn remove(&self, id: &str) -> Result<bool> {
    let owned_id = id.to_string();
    let removed = self
      .blocking(move |s| s.remove(&owned_id))
      .await
      .map_err(|e| {
        warn!("Failed to remove {} from cache: {}", id, e);
        e
      })?;

    if removed {
      debug!("Removed {} from cache", id);
    }
    Ok(removed)
  }

  /// Delete every entry the eviction policy considers expired right now.
  /// Returns the evicted ids, oldest access first.
  pub async fn evict_expired(&self) -> Result<Vec<String>> {
    let now = self.clock.now();
    let Some(cutoff) = self.policy.cutoff(now) else {
      return Ok(Vec::new());
    };

    let evicted = self
      .blocking(move |s| s.evict(cutoff))
      .await
      .map_err(|e| {
        warn!("Cache eviction sweep failed: {}", e);
        e
      })?;

    if !evicted.is_empty() {
      info!("Evicted {} expired cache entries", evicted.len());
    }
    Ok(evicted)
  }

  /// Fetch with cache-first strategy.
  ///
  /// 1. Check cache - on a hit, return it
  /// 2. On a miss or a cache failure, call `fetcher`
  /// 3. Store what the fetcher returned; a failed store is logged only
  ///
  /// Fetched references are normalized before being stored and returned, so
  /// a miss and a later hit yield the same locator.
  ///
  /// Only the fetcher's error is ever returned.
  pub async fn get_or_fetch<F, Fut, E>(
    &self,
    id: &str,
    fetcher: F,
  ) -> std::result::Result<CacheResult<Payload>, E>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = std::result::Result<Payload, E>>,
  {
    match self.get(id).await {
      Ok(Some(hit)) => return Ok(CacheResult::from_cache(hit.payload, hit.created_at)),
      Ok(None) => {}
      Err(_) => debug!("Cache unavailable for {}, fetching from source", id),
    }

    let payload = self.canonical(fetcher().await?);

    if self.store(id, payload.clone()).await.is_err() {
      debug!("Continuing without caching {}", id);
    }

    Ok(CacheResult::from_network(payload))
  }

  /// All cached entries, most recently accessed first.
  pub async fn entries(&self) -> Result<Vec<CacheEntry>> {
    self.blocking(|s| s.entries()).await.map_err(|e| {
      warn!("Failed to list cache entries: {}", e);
      e
    })
  }

  pub async fn stats(&self) -> Result<CacheStats> {
    self.blocking(|s| s.stats()).await.map_err(|e| {
      warn!("Failed to read cache stats: {}", e);
      e
    })
  }

  /// Run `evict_expired` every `interval` until the handle is aborted.
  pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
    let cache = self.clone();
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        let _ = cache.evict_expired().await;
      }
    })
  }

  /// Start the background sweeper if the schedule asks for one.
  pub fn start_sweeper(&self) -> Option<JoinHandle<()>> {
    match self.schedule {
      SweepSchedule::Background { interval } => {
        debug!("Starting cache sweeper every {:?}", interval);
        Some(self.spawn_sweeper(interval))
      }
      _ => None,
    }
  }
}

impl<S: CacheStorage, C: Clock> Clone for ContentCache<S, C> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      clock: Arc::clone(&self.clock),
      policy: Arc::clone(&self.policy),
      normalizer: Arc::clone(&self.normalizer),
      schedule: self.schedule,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::clock::ManualClock;
  use crate::cache::eviction::KeepForever;
  use crate::cache::storage::{NoopStorage, SqliteStorage};
  use crate::cache::types::{blob_key, CacheSource, ContentKind};
  use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
  use std::sync::atomic::{AtomicU32, Ordering};

  fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 2, 1, 8, 0, 0).unwrap()
  }

  /// In-memory cache on a manual clock that never sweeps on its own.
  fn manual_cache() -> (ContentCache<SqliteStorage, ManualClock>, ManualClock) {
    let clock = ManualClock::new(t0());
    let cache = ContentCache::new(SqliteStorage::open_in_memory().unwrap())
      .with_clock(clock.clone())
      .with_schedule(SweepSchedule::Manual);
    (cache, clock)
  }

  fn pdf(bytes: &[u8]) -> Payload {
    Payload::blob("1234.5678.pdf", bytes.to_vec())
  }

  #[tokio::test]
  async fn test_reference_round_trip() {
    let (cache, _) = manual_cache();
    cache.put("p0", Payload::reference("https://example.com/paper.pdf")).await.unwrap();

    let hit = cache.get("p0").await.unwrap().unwrap();
    assert_eq!(hit.kind(), ContentKind::Reference);
    assert_eq!(hit.payload, Payload::reference("https://example.com/paper.pdf"));
  }

  #[tokio::test]
  async fn test_blob_round_trip() {
    let (cache, _) = manual_cache();
    cache.put("p0", pdf(b"%PDF-1.5 body")).await.unwrap();

    let hit = cache.get("p0").await.unwrap().unwrap();
    assert_eq!(hit.kind(), ContentKind::Blob);
    assert_eq!(hit.payload, pdf(b"%PDF-1.5 body"));
  }

  #[tokio::test]
  async fn test_abstract_locator_stored_as_pdf() {
    let (cache, _) = manual_cache();
    cache.put("arxiv", Payload::reference("https://arxiv.org/abs/1234.5678")).await.unwrap();

    let hit = cache.get("arxiv").await.unwrap().unwrap();
    assert_eq!(
      hit.payload,
      Payload::reference("https://arxiv.org/pdf/1234.5678.pdf")
    );
  }

  #[tokio::test]
  async fn test_identity_normalizer_keeps_locator() {
    let (cache, _) = manual_cache();
    let cache = cache.with_normalizer(LocatorNormalizer::identity());
    cache.put("arxiv", Payload::reference("https://arxiv.org/abs/1234.5678")).await.unwrap();

    let hit = cache.get("arxiv").await.unwrap().unwrap();
    assert_eq!(hit.payload, Payload::reference("https://arxiv.org/abs/1234.5678"));
  }

  #[tokio::test]
  async fn test_get_refreshes_access_time() {
    let (cache, clock) = manual_cache();
    cache.put("p0", Payload::reference("https://a")).await.unwrap();

    clock.advance(ChronoDuration::days(3));
    let hit = cache.get("p0").await.unwrap().unwrap();

    assert_eq!(hit.created_at, t0());
    assert_eq!(hit.last_accessed_at, t0() + ChronoDuration::days(3));
    assert_eq!(cache.entries().await.unwrap()[0].last_accessed_at, hit.last_accessed_at);
  }

  #[tokio::test]
  async fn test_remove_then_get_misses_and_blob_is_gone() {
    let (cache, _) = manual_cache();
    cache.put("p0", pdf(b"bytes")).await.unwrap();

    assert!(cache.remove("p0").await.unwrap());
    assert!(cache.get("p0").await.unwrap().is_none());
    assert!(!cache.storage.has_blob(&blob_key("p0", "1234.5678.pdf")).unwrap());
  }

  #[tokio::test]
  async fn test_remove_absent_is_noop() {
    let (cache, _) = manual_cache();
    assert!(!cache.remove("never-stored").await.unwrap());
  }

  #[tokio::test]
  async fn test_stale_blob_evicted_by_sweep() {
    let (cache, clock) = manual_cache();
    cache.put("p1", pdf(b"old paper")).await.unwrap();

    clock.advance(ChronoDuration::days(8));
    let evicted = cache.evict_expired().await.unwrap();

    assert_eq!(evicted, vec!["p1".to_string()]);
    assert!(cache.get("p1").await.unwrap().is_none());
    assert_eq!(cache.storage.blob_count().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_stale_blob_misses_on_read_before_sweep() {
    let (cache, clock) = manual_cache();
    cache.put("p1", pdf(b"old paper")).await.unwrap();

    clock.advance(ChronoDuration::days(8));
    assert!(cache.get("p1").await.unwrap().is_none());
    assert_eq!(cache.storage.blob_count().unwrap(), 0);
    assert!(cache.evict_expired().await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_read_extends_retention() {
    let (cache, clock) = manual_cache();
    cache.put("p2", Payload::reference("https://a")).await.unwrap();

    clock.set(t0() + ChronoDuration::days(6));
    assert!(cache.get("p2").await.unwrap().is_some());

    clock.set(t0() + ChronoDuration::days(8));
    assert!(cache.evict_expired().await.unwrap().is_empty());
    assert_eq!(cache.entries().await.unwrap().len(), 1);

    clock.set(t0() + ChronoDuration::days(13));
    assert_eq!(cache.evict_expired().await.unwrap(), vec!["p2".to_string()]);
    assert!(cache.entries().await.unwrap().is_empty());
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn test_concurrent_put_and_sweep_keeps_fresh_entry() {
    let (cache, clock) = manual_cache();
    for i in 0..20 {
      cache.put(&format!("stale-{}", i), pdf(b"x")).await.unwrap();
    }
    clock.advance(ChronoDuration::days(10));

    for round in 0..25 {
      let payload = Payload::blob(format!("round-{}.pdf", round), b"fresh".to_vec());
      let (put, sweep) = tokio::join!(cache.put("p3", payload), cache.evict_expired());
      put.unwrap();
      let evicted = sweep.unwrap();
      assert!(!evicted.contains(&"p3".to_string()));
      assert!(cache.get("p3").await.unwrap().is_some());
    }

    let entries = cache.entries().await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].id, "p3");
    assert_eq!(cache.storage.blob_count().unwrap(), 1);
  }

  #[tokio::test]
  async fn test_after_write_schedule_sweeps_on_put() {
    let (cache, clock) = manual_cache();
    let cache = cache.with_schedule(SweepSchedule::AfterWrite);
    cache.put("old", pdf(b"x")).await.unwrap();

    clock.advance(ChronoDuration::days(7));
    cache.put("new", Payload::reference("https://b")).await.unwrap();

    let ids: Vec<String> = cache.entries().await.unwrap().into_iter().map(|e| e.id).collect();
    assert_eq!(ids, vec!["new".to_string()]);
    assert_eq!(cache.storage.blob_count().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_detached_schedule_sweeps_in_background() {
    let (cache, clock) = manual_cache();
    let cache = cache.with_schedule(SweepSchedule::Detached);
    cache.put("old", Payload::reference("https://a")).await.unwrap();

    clock.advance(ChronoDuration::days(8));
    cache.put("new", Payload::reference("https://b")).await.unwrap();

    let mut ids = Vec::new();
    for _ in 0..100 {
      ids = cache.entries().await.unwrap().into_iter().map(|e| e.id).collect();
      if ids.len() == 1 {
        break;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(ids, vec!["new".to_string()]);
  }

  #[tokio::test]
  async fn test_manual_schedule_does_not_sweep_on_put() {
    let (cache, clock) = manual_cache();
    cache.put("old", Payload::reference("https://a")).await.unwrap();

    clock.advance(ChronoDuration::days(30));
    cache.put("new", Payload::reference("https://b")).await.unwrap();

    assert_eq!(cache.entries().await.unwrap().len(), 2);
  }

  #[tokio::test]
  async fn test_background_sweeper_evicts() {
    let (cache, clock) = manual_cache();
    let cache = cache.with_schedule(SweepSchedule::Background {
      interval: Duration::from_millis(10),
    });
    cache.put("old", Payload::reference("https://a")).await.unwrap();
    clock.advance(ChronoDuration::days(9));

    let handle = cache.start_sweeper().unwrap();
    let mut remaining = usize::MAX;
    for _ in 0..100 {
      remaining = cache.entries().await.unwrap().len();
      if remaining == 0 {
        break;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    handle.abort();

    assert_eq!(remaining, 0);
  }

  #[tokio::test]
  async fn test_no_sweeper_unless_background() {
    let (cache, _) = manual_cache();
    assert!(cache.start_sweeper().is_none());
  }

  #[tokio::test]
  async fn test_keep_forever_policy() {
    let (cache, clock) = manual_cache();
    let cache = cache.with_policy(KeepForever);
    cache.put("p0", Payload::reference("https://a")).await.unwrap();

    clock.advance(ChronoDuration::days(365));
    assert!(cache.evict_expired().await.unwrap().is_empty());
    assert!(cache.get("p0").await.unwrap().is_some());
  }

  #[tokio::test]
  async fn test_corrupt_blob_is_a_miss() {
    let (cache, _) = manual_cache();
    cache.put("p0", pdf(b"bytes")).await.unwrap();
    cache.storage.execute_raw("DELETE FROM cache_blobs").unwrap();

    assert!(cache.get("p0").await.unwrap().is_none());
    assert!(cache.entries().await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_broken_storage_surfaces_error() {
    let (cache, _) = manual_cache();
    cache.storage.execute_raw("DROP TABLE cache_meta").unwrap();

    assert!(cache.get("p0").await.is_err());
    assert!(cache.put("p0", Payload::reference("https://a")).await.is_err());
    assert!(cache.remove("p0").await.is_err());
  }

  #[tokio::test]
  async fn test_get_or_fetch_populates_then_hits() {
    let (cache, _) = manual_cache();
    let calls = Arc::new(AtomicU32::new(0));

    let counter = Arc::clone(&calls);
    let first = cache
      .get_or_fetch("p0", move || async move {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok::<_, String>(pdf(b"downloaded"))
      })
      .await
      .unwrap();
    assert_eq!(first.source, CacheSource::Network);
    assert_eq!(first.data, pdf(b"downloaded"));

    let counter = Arc::clone(&calls);
    let second = cache
      .get_or_fetch("p0", move || async move {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok::<_, String>(pdf(b"should not be fetched"))
      })
      .await
      .unwrap();
    assert_eq!(second.source, CacheSource::Cache);
    assert_eq!(second.cached_at, Some(t0()));
    assert_eq!(second.data, pdf(b"downloaded"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_get_or_fetch_returns_normalized_reference() {
    let (cache, _) = manual_cache();

    let first = cache
      .get_or_fetch("arxiv", || async {
        Ok::<_, String>(Payload::reference("https://www.arxiv.org/abs/1234.5678/"))
      })
      .await
      .unwrap();
    assert_eq!(first.source, CacheSource::Network);
    assert_eq!(
      first.data,
      Payload::reference("https://arxiv.org/pdf/1234.5678.pdf")
    );

    let second = cache
      .get_or_fetch("arxiv", || async {
        Ok::<_, String>(Payload::reference("https://example.com/unused"))
      })
      .await
      .unwrap();
    assert_eq!(second.source, CacheSource::Cache);
    assert_eq!(second.data, first.data);
  }

  #[tokio::test]
  async fn test_get_or_fetch_propagates_fetch_error() {
    let (cache, _) = manual_cache();
    let result = cache
      .get_or_fetch("p0", || async { Err::<Payload, _>("404".to_string()) })
      .await;

    assert_eq!(result.unwrap_err(), "404");
    assert!(cache.get("p0").await.unwrap().is_none());
  }

  #[tokio::test]
  async fn test_get_or_fetch_falls_back_when_storage_broken() {
    let (cache, _) = manual_cache();
    cache.storage.execute_raw("DROP TABLE cache_meta").unwrap();

    let result = cache
      .get_or_fetch("p0", || async { Ok::<_, String>(Payload::reference("https://a")) })
      .await
      .unwrap();
    assert_eq!(result.source, CacheSource::Network);
  }

  #[tokio::test]
  async fn test_noop_storage_always_fetches() {
    let cache = ContentCache::new(NoopStorage).with_schedule(SweepSchedule::Manual);
    cache.put("p0", Payload::reference("https://a")).await.unwrap();
    assert!(cache.get("p0").await.unwrap().is_none());

    let result = cache
      .get_or_fetch("p0", || async { Ok::<_, String>(Payload::reference("https://a")) })
      .await
      .unwrap();
    assert_eq!(result.source, CacheSource::Network);
  }

  #[tokio::test]
  async fn test_stats_reflect_contents() {
    let (cache, _) = manual_cache();
    cache.put("a", Payload::reference("https://a")).await.unwrap();
    cache.put("b", pdf(b"1234")).await.unwrap();

    let stats = cache.stats().await.unwrap();
    assert_eq!(stats.entries(), 2);
    assert_eq!(stats.blob_bytes, 4);
  }
}
