//! In-memory response store with TTL expiry.
//!
//! # Concurrency
//!
//! Map mutations (insert, sweep removal, and setting an entry's removal
//! flag) take the map's write lock, so they are serialized. Lookups only
//! take the read lock, upgrading to the write lock just to flag a stale
//! entry. The hit counter is an independent atomic and never contends with
//! mutation traffic.

use super::entry::{CacheEntry, CacheKey};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

/// Interval between expiry sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Result of a single sweep pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    /// Entries removed by this pass.
    pub removed: usize,
    /// Entries left in the store.
    pub remaining: usize,
    /// Cumulative cache hits.
    pub hits: u64,
}

/// Concurrent response cache keyed by URI and User-Agent.
#[derive(Default)]
pub struct CacheStore {
    entries: RwLock<HashMap<CacheKey, Arc<CacheEntry>>>,
    hits: AtomicU64,
}

impl CacheStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a fresh entry for `key`.
    ///
    /// A stale entry is flagged for removal and reported as absent. A
    /// genuine hit increments the hit counter.
    pub fn lookup(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        self.lookup_at(key, Utc::now())
    }

    /// [`lookup`](Self::lookup) evaluated as of `now`.
    pub fn lookup_at(&self, key: &CacheKey, now: DateTime<Utc>) -> Option<Arc<CacheEntry>> {
        let entry = self.read().get(key).cloned()?;

        if entry.is_stale_at(now) {
            let _guard = self.write();
            entry.flag_for_removal();
            trace!("Flagged stale cache entry for {}", key.absolute_uri);
            return None;
        }

        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry)
    }

    /// Insert `entry` unless its key is already present.
    ///
    /// The first writer wins; returns `false` when the entry was discarded.
    pub fn insert(&self, entry: CacheEntry) -> bool {
        let mut entries = self.write();
        if entries.contains_key(&entry.key) {
            debug!("Discarding duplicate cache entry for {}", entry.key.absolute_uri);
            return false;
        }
        debug!("Caching {}", entry.key.absolute_uri);
        entries.insert(entry.key.clone(), Arc::new(entry));
        true
    }

    /// Remove every flagged or expired entry.
    pub fn sweep(&self) -> SweepStats {
        self.sweep_at(Utc::now())
    }

    /// [`sweep`](Self::sweep) evaluated as of `now`.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> SweepStats {
        let mut entries = self.write();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_stale_at(now));

        SweepStats {
            removed: before - entries.len(),
            remaining: entries.len(),
            hits: self.hits(),
        }
    }

    /// Number of entries physically present (fresh or not yet swept).
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Cumulative number of cache hits.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<CacheKey, Arc<CacheEntry>>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<CacheKey, Arc<CacheEntry>>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Spawn the periodic sweep task.
///
/// Sleeps `period` between passes and exits cleanly once the shutdown
/// signal turns true (or its sender is dropped).
pub fn spawn_sweeper(
    store: Arc<CacheStore>,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + period;
        let mut interval = tokio::time::interval_at(start, period);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let stats = store.sweep();
                    info!(
                        "Cache maintenance complete. Number of items stored={} Number of cache hits={}",
                        stats.remaining, stats.hits
                    );
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        debug!("Cache sweeper stopping");
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use chrono::Duration as ChronoDuration;

    fn entry(uri: &str, body: &'static [u8], expires: Option<DateTime<Utc>>) -> CacheEntry {
        CacheEntry::new(
            CacheKey::new(uri, "test-agent"),
            200,
            "OK",
            vec![
                ("Content-Type".to_string(), "text/plain".to_string()),
                ("X-Proxied-By".to_string(), "mitm-cache-proxy".to_string()),
            ],
            Bytes::from_static(body),
            expires,
        )
    }

    #[test]
    fn test_round_trip() {
        let store = CacheStore::new();
        assert!(store.insert(entry("http://example.com/", b"hello", None)));

        let hit = store
            .lookup(&CacheKey::new("http://example.com/", "test-agent"))
            .unwrap();
        assert_eq!(hit.status_code, 200);
        assert_eq!(hit.status_text, "OK");
        assert_eq!(hit.headers[1].0, "X-Proxied-By");
        assert_eq!(hit.response_bytes.as_deref(), Some(&b"hello"[..]));
        assert_eq!(store.hits(), 1);
    }

    #[test]
    fn test_miss_does_not_count() {
        let store = CacheStore::new();
        assert!(store.lookup(&CacheKey::new("http://example.com/", "")).is_none());
        assert_eq!(store.hits(), 0);
    }

    #[test]
    fn test_user_agent_is_part_of_identity() {
        let store = CacheStore::new();
        store.insert(entry("http://example.com/", b"hello", None));
        assert!(store
            .lookup(&CacheKey::new("http://example.com/", "other-agent"))
            .is_none());
    }

    #[test]
    fn test_first_insert_wins() {
        let store = CacheStore::new();
        assert!(store.insert(entry("http://example.com/", b"first", None)));
        assert!(!store.insert(entry("http://example.com/", b"second", None)));
        assert_eq!(store.len(), 1);

        let hit = store
            .lookup(&CacheKey::new("http://example.com/", "test-agent"))
            .unwrap();
        assert_eq!(hit.response_bytes.as_deref(), Some(&b"first"[..]));
    }

    #[test]
    fn test_concurrent_inserts_keep_one() {
        let store = Arc::new(CacheStore::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || store.insert(entry("http://example.com/", b"x", None)))
            })
            .collect();

        let inserted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(inserted, 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_expired_entry_not_returned_before_sweep() {
        let store = CacheStore::new();
        let now = Utc::now();
        store.insert(entry("http://example.com/", b"x", Some(now + ChronoDuration::seconds(5))));
        let key = CacheKey::new("http://example.com/", "test-agent");

        assert!(store.lookup_at(&key, now).is_some());
        assert!(store.lookup_at(&key, now + ChronoDuration::seconds(6)).is_none());

        // Flagged on access: absent even if the clock goes back.
        assert!(store.lookup_at(&key, now).is_none());
        assert_eq!(store.len(), 1);
        assert_eq!(store.hits(), 1);
    }

    #[test]
    fn test_sweep_removes_only_stale() {
        let store = CacheStore::new();
        let now = Utc::now();
        store.insert(entry("http://example.com/fresh", b"x", Some(now + ChronoDuration::seconds(60))));
        store.insert(entry("http://example.com/forever", b"x", None));
        store.insert(entry("http://example.com/expired", b"x", Some(now - ChronoDuration::seconds(1))));
        store.insert(entry("http://example.com/flagged", b"x", Some(now + ChronoDuration::seconds(60))));

        // Flag one entry through a lookup that finds it stale.
        let flagged = CacheKey::new("http://example.com/flagged", "test-agent");
        assert!(store.lookup_at(&flagged, now + ChronoDuration::seconds(61)).is_none());

        let stats = store.sweep_at(now);
        assert_eq!(stats.removed, 2);
        assert_eq!(stats.remaining, 2);

        assert!(store.lookup_at(&CacheKey::new("http://example.com/fresh", "test-agent"), now).is_some());
        assert!(store.lookup_at(&CacheKey::new("http://example.com/forever", "test-agent"), now).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_runs_on_interval_and_stops() {
        let store = Arc::new(CacheStore::new());
        store.insert(entry("http://example.com/", b"x", Some(Utc::now() - ChronoDuration::seconds(1))));

        let (tx, rx) = watch::channel(false);
        let handle = spawn_sweeper(store.clone(), DEFAULT_SWEEP_INTERVAL, rx);

        tokio::time::sleep(DEFAULT_SWEEP_INTERVAL + Duration::from_secs(1)).await;
        assert!(store.is_empty());

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
