use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use metrics::{counter, gauge};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};
use tracing::{debug, warn};

use crate::decision::Decision;
use crate::error::Result;

/// Backend holding cached decisions
///
/// Writes replace the whole entry. Failures are reported as
/// `ProtectError::Cache` and never fail an evaluation.
pub trait DecisionStore: Send + Sync {
    /// The live decision stored under `key`, if any
    fn get(&self, key: &str) -> Result<Option<Decision>>;

    /// Store `decision` under `key` for `ttl`, replacing any previous entry
    fn put(&self, key: &str, decision: Decision, ttl: Duration) -> Result<()>;

    /// Drop expired entries, returning how many were removed
    fn remove_expired(&self) -> Result<usize>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    decision: Decision,
    expires_at: Instant,
}

impl CacheEntry {
    /// Entries live through the whole TTL and expire strictly after it
    fn is_expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }
}

/// In-memory store bounded to `max_entries`
#[derive(Debug)]
pub struct MemoryDecisionStore {
    entries: DashMap<String, CacheEntry>,
    max_entries: usize,
}

impl MemoryDecisionStore {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: max_entries.max(1),
        }
    }

    /// Make room for one more entry: expired entries first, then the one
    /// closest to expiry
    fn make_room(&self, now: Instant) {
        if self.entries.len() < self.max_entries {
            return;
        }
        self.entries.retain(|_, entry| !entry.is_expired(now));
        if self.entries.len() < self.max_entries {
            return;
        }

        let soonest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.value().expires_at)
            .map(|entry| entry.key().clone());
        if let Some(key) = soonest {
            self.entries.remove(&key);
            counter!("protect_cache_evictions_total", 1);
        }
    }
}

impl DecisionStore for MemoryDecisionStore {
    fn get(&self, key: &str) -> Result<Option<Decision>> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired(now) {
                return Ok(Some(entry.decision.clone()));
            }
        }
        // Expired, evict lazily
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        Ok(None)
    }

    fn put(&self, key: &str, decision: Decision, ttl: Duration) -> Result<()> {
        let now = Instant::now();
        if !self.entries.contains_key(key) {
            self.make_room(now);
        }
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                decision,
                expires_at: now + ttl,
            },
        );
        Ok(())
    }

    fn remove_expired(&self) -> Result<usize> {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        Ok(before.saturating_sub(self.entries.len()))
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Decision cache over a pluggable store
///
/// Store failures are logged and read as a miss.
#[derive(Clone)]
pub struct DecisionCache {
    store: Arc<dyn DecisionStore>,
}

impl std::fmt::Debug for DecisionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecisionCache")
            .field("entries", &self.store.len())
            .finish()
    }
}

impl DecisionCache {
    pub fn new(store: Arc<dyn DecisionStore>) -> Self {
        Self { store }
    }

    pub fn in_memory(max_entries: usize) -> Self {
        Self::new(Arc::new(MemoryDecisionStore::new(max_entries)))
    }

    pub fn store(&self) -> Arc<dyn DecisionStore> {
        Arc::clone(&self.store)
    }

    pub fn get(&self, key: &str) -> Option<Decision> {
        match self.store.get(key) {
            Ok(Some(decision)) => {
                counter!("protect_cache_hits_total", 1);
                debug!(key = %key, decision_id = %decision.id(), "Decision cache hit");
                Some(decision)
            }
            Ok(None) => {
                counter!("protect_cache_misses_total", 1);
                None
            }
            Err(e) => {
                counter!("protect_cache_misses_total", 1);
                warn!(key = %key, error = %e, "Decision store lookup failed, treating as miss");
                None
            }
        }
    }

    /// Cache `decision` for its own TTL; zero TTL decisions are not stored
    pub fn put(&self, key: &str, decision: &Decision) {
        if decision.ttl() == 0 {
            return;
        }
        let ttl = Duration::from_secs(u64::from(decision.ttl()));
        if let Err(e) = self.store.put(key, decision.clone(), ttl) {
            warn!(key = %key, error = %e, "Failed to store decision");
            return;
        }
        gauge!("protect_cache_entries", self.store.len() as f64);
    }

    /// Start a background task sweeping expired entries every `every`
    pub fn start_sweep_task(&self, every: Duration) -> JoinHandle<()> {
        let store = self.store();
        tokio::spawn(async move {
            let mut ticker = interval(every);
            loop {
                ticker.tick().await;
                match store.remove_expired() {
                    Ok(0) => {}
                    Ok(removed) => {
                        debug!(removed = removed, remaining = store.len(), "Swept expired decisions");
                        gauge!("protect_cache_entries", store.len() as f64);
                    }
                    Err(e) => warn!(error = %e, "Decision cache sweep failed"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::{Conclusion, Reason};
    use crate::error::ProtectError;

    fn decision(ttl: u32) -> Decision {
        Decision::new(Conclusion::Deny, Reason::Shield { shield_triggered: true }, vec![], None, ttl)
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_trip() {
        let cache = DecisionCache::in_memory(16);
        let d = decision(30);
        cache.put("k", &d);
        assert_eq!(cache.get("k"), Some(d));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_ttl_is_not_stored() {
        let cache = DecisionCache::in_memory(16);
        cache.put("k", &decision(0));
        assert_eq!(cache.get("k"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_after_ttl() {
        let cache = DecisionCache::in_memory(16);
        cache.put("k", &decision(10));

        tokio::time::advance(Duration::from_millis(9_900)).await;
        assert!(cache.get("k").is_some());

        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(cache.get("k").is_none());
        assert!(cache.store().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_is_present_at_exactly_ttl() {
        let cache = DecisionCache::in_memory(16);
        cache.put("k", &decision(10));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(cache.get("k").is_some());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(cache.get("k").is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_writes_keep_one_intact_entry() {
        let cache = DecisionCache::in_memory(16);
        let written: Vec<Decision> = (1..=32).map(decision).collect();

        let handles: Vec<_> = written
            .iter()
            .cloned()
            .map(|d| {
                let cache = cache.clone();
                tokio::spawn(async move {
                    cache.put("shared", &d);
                    cache.get("shared")
                })
            })
            .collect();
        for handle in handles {
            // Every read sees some complete decision
            let seen = handle.await.unwrap().unwrap();
            assert!(written.contains(&seen));
        }

        assert_eq!(cache.store().len(), 1);
        let survivor = cache.get("shared").unwrap();
        assert!(written.contains(&survivor));
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_write_wins() {
        let cache = DecisionCache::in_memory(16);
        let first = decision(10);
        let second = decision(20);
        cache.put("k", &first);
        cache.put("k", &second);
        assert_eq!(cache.get("k").map(|d| d.id().to_string()), Some(second.id().to_string()));
        assert_eq!(cache.store().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_evicts_soonest_expiring() {
        let store = MemoryDecisionStore::new(2);
        store.put("short", decision(5), Duration::from_secs(5)).unwrap();
        store.put("long", decision(50), Duration::from_secs(50)).unwrap();
        store.put("new", decision(20), Duration::from_secs(20)).unwrap();

        assert_eq!(store.len(), 2);
        assert!(store.get("short").unwrap().is_none());
        assert!(store.get("long").unwrap().is_some());
        assert!(store.get("new").unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_expired() {
        let store = MemoryDecisionStore::new(8);
        store.put("a", decision(1), Duration::from_secs(1)).unwrap();
        store.put("b", decision(60), Duration::from_secs(60)).unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.remove_expired().unwrap(), 1);
        assert_eq!(store.len(), 1);
    }

    struct BrokenStore;

    impl DecisionStore for BrokenStore {
        fn get(&self, _key: &str) -> Result<Option<Decision>> {
            Err(ProtectError::Cache("backend unavailable".to_string()))
        }

        fn put(&self, _key: &str, _decision: Decision, _ttl: Duration) -> Result<()> {
            Err(ProtectError::Cache("backend unavailable".to_string()))
        }

        fn remove_expired(&self) -> Result<usize> {
            Ok(0)
        }

        fn len(&self) -> usize {
            0
        }
    }

    #[test]
    fn test_store_failure_is_a_miss() {
        let cache = DecisionCache::new(Arc::new(BrokenStore));
        cache.put("k", &decision(10));
        assert!(cache.get("k").is_none());
    }
}
