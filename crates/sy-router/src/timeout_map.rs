//! TimeoutMap - key/value map with per-entry expiry and vetoable eviction
//!
//! Backs the producer cache and the service pool. Entries expire once they have
//! been idle for their timeout; `get` counts as use. Expired entries are only
//! removed by [`TimeoutMap::purge`], which runs once per tick while the map is
//! started, or on demand through [`TimeoutMap::run`].

use async_trait::async_trait;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

use sy_common::Result;

use crate::lifecycle::{Housekeeping, LifecycleManager};
use crate::service::{Service, ServiceState};

/// Consulted before an entry is evicted.
pub trait EvictionListener<K, V>: Send + Sync {
    /// Return `false` to keep the entry. It is reconsidered on the next purge.
    fn on_eviction(&self, key: &K, value: &V) -> bool;

    /// Receives every pair that was actually removed by a purge or LRU eviction.
    fn evicted(&self, _key: K, _value: V) {}
}

struct Entry<V> {
    value: V,
    timeout: Duration,
    expires_at: Instant,
    last_access: Instant,
}

impl<V> Entry<V> {
    fn new(value: V, timeout: Duration) -> Self {
        let now = Instant::now();
        Self {
            value,
            timeout,
            expires_at: now + timeout,
            last_access: now,
        }
    }

    fn touch(&mut self) {
        let now = Instant::now();
        self.last_access = now;
        self.expires_at = now + self.timeout;
    }
}

struct MapInner<K, V> {
    entries: DashMap<K, Entry<V>>,
    listener: Option<Arc<dyn EvictionListener<K, V>>>,
}

impl<K, V> MapInner<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn allows_eviction(&self, key: &K, value: &V) -> bool {
        self.listener
            .as_ref()
            .map(|l| l.on_eviction(key, value))
            .unwrap_or(true)
    }

    fn notify_evicted(&self, key: K, value: V) {
        if let Some(listener) = &self.listener {
            listener.evicted(key, value);
        }
    }

    fn purge(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<K> = self
            .entries
            .iter()
            .filter(|e| e.value().expires_at <= now)
            .map(|e| e.key().clone())
            .collect();

        let mut evicted = 0;
        for key in expired {
            // Only this entry's shard is locked while the listener decides.
            let removed = self.entries.remove_if(&key, |k, e| {
                e.expires_at <= now && self.allows_eviction(k, &e.value)
            });
            match removed {
                Some((k, e)) => {
                    evicted += 1;
                    self.notify_evicted(k, e.value);
                }
                None => trace!("Eviction vetoed or entry refreshed"),
            }
        }

        if evicted > 0 {
            debug!(evicted, remaining = self.entries.len(), "Purged expired entries");
        }
        evicted
    }
}

#[async_trait]
impl<K, V> Housekeeping for MapInner<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        "timeout-map-purge"
    }

    async fn run(&self) {
        self.purge();
    }
}

pub struct TimeoutMap<K, V> {
    inner: Arc<MapInner<K, V>>,
    purge_interval: Duration,
    state: ServiceState,
    housekeeper: Mutex<Option<LifecycleManager>>,
}

impl<K, V> TimeoutMap<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(purge_interval: Duration) -> Self {
        Self::build(purge_interval, None)
    }

    pub fn with_listener(
        purge_interval: Duration,
        listener: Arc<dyn EvictionListener<K, V>>,
    ) -> Self {
        Self::build(purge_interval, Some(listener))
    }

    fn build(
        purge_interval: Duration,
        listener: Option<Arc<dyn EvictionListener<K, V>>>,
    ) -> Self {
        Self {
            inner: Arc::new(MapInner {
                entries: DashMap::new(),
                listener,
            }),
            purge_interval,
            state: ServiceState::new(),
            housekeeper: Mutex::new(None),
        }
    }

    /// Value for `key`, refreshing its expiry. Entries that expired but were not
    /// purged yet (for example because eviction was vetoed) are still returned.
    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.entries.get_mut(key).map(|mut e| {
            e.touch();
            e.value.clone()
        })
    }

    /// Runs `f` on the value for `key` while its shard is locked, refreshing its
    /// expiry. A purge cannot evict the entry while `f` runs, so state changed
    /// here is seen by the eviction listener.
    pub fn get_with<R>(&self, key: &K, f: impl FnOnce(&V) -> R) -> Option<R> {
        self.inner.entries.get_mut(key).map(|mut e| {
            e.touch();
            f(&e.value)
        })
    }

    /// Value for `key` without counting as use.
    pub fn peek(&self, key: &K) -> Option<V> {
        self.inner.entries.get(key).map(|e| e.value.clone())
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.entries.contains_key(key)
    }

    /// Inserts or replaces, returning the previous value.
    pub fn put(&self, key: K, value: V, timeout: Duration) -> Option<V> {
        self.inner
            .entries
            .insert(key, Entry::new(value, timeout))
            .map(|e| e.value)
    }

    /// Inserts only when the key is absent. Returns the existing value otherwise.
    pub fn put_if_absent(&self, key: K, value: V, timeout: Duration) -> Option<V> {
        self.put_if_absent_with(key, value, timeout, |_| {})
    }

    /// [`put_if_absent`](Self::put_if_absent) that runs `on_existing` on the
    /// value already present before the entry lock is released.
    pub fn put_if_absent_with(
        &self,
        key: K,
        value: V,
        timeout: Duration,
        on_existing: impl FnOnce(&V),
    ) -> Option<V> {
        match self.inner.entries.entry(key) {
            MapEntry::Occupied(mut occupied) => {
                occupied.get_mut().touch();
                on_existing(&occupied.get().value);
                Some(occupied.get().value.clone())
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(Entry::new(value, timeout));
                None
            }
        }
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.inner.entries.remove(key).map(|(_, e)| e.value)
    }

    /// Evicts every expired entry the listener allows. Returns how many were removed.
    pub fn purge(&self) -> usize {
        self.inner.purge()
    }

    /// One housekeeping tick.
    pub fn run(&self) {
        self.inner.purge();
    }

    /// Evicts the least recently used entry the listener does not veto.
    pub fn evict_lru(&self) -> Option<K> {
        let mut candidates: Vec<(K, Instant)> = self
            .inner
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().last_access))
            .collect();
        candidates.sort_by_key(|(_, last_access)| *last_access);

        for (key, last_access) in candidates {
            let removed = self.inner.entries.remove_if(&key, |k, e| {
                e.last_access == last_access && self.inner.allows_eviction(k, &e.value)
            });
            if let Some((k, e)) = removed {
                debug!("Evicted least recently used entry");
                self.inner.notify_evicted(k.clone(), e.value);
                return Some(k);
            }
        }
        None
    }

    pub fn keys(&self) -> Vec<K> {
        self.inner.entries.iter().map(|e| e.key().clone()).collect()
    }

    pub fn values(&self) -> Vec<V> {
        self.inner.entries.iter().map(|e| e.value().value.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Removes everything without consulting the listener.
    pub fn clear(&self) -> Vec<(K, V)> {
        let keys = self.keys();
        keys.into_iter()
            .filter_map(|k| self.inner.entries.remove(&k))
            .map(|(k, e)| (k, e.value))
            .collect()
    }

    pub fn purge_interval(&self) -> Duration {
        self.purge_interval
    }
}

#[async_trait]
impl<K, V> Service for TimeoutMap<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn service_state(&self) -> &ServiceState {
        &self.state
    }

    async fn do_start(&self) -> Result<()> {
        let manager = LifecycleManager::new();
        manager.schedule(self.inner.clone(), self.purge_interval);
        *self.housekeeper.lock() = Some(manager);
        Ok(())
    }

    async fn do_stop(&self) -> Result<()> {
        let manager = self.housekeeper.lock().take();
        if let Some(manager) = manager {
            manager.shutdown().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct Veto {
        allow: AtomicBool,
        evicted: AtomicUsize,
    }

    impl EvictionListener<String, i32> for Veto {
        fn on_eviction(&self, _key: &String, _value: &i32) -> bool {
            self.allow.load(Ordering::SeqCst)
        }

        fn evicted(&self, _key: String, _value: i32) {
            self.evicted.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_entry_expires_after_purge() {
        let map: TimeoutMap<String, i32> = TimeoutMap::new(Duration::from_millis(20));
        map.start().await.unwrap();
        map.put("k".to_string(), 1, Duration::from_millis(50));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(map.get(&"k".to_string()), None);
        map.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_put_if_absent_never_overwrites() {
        let map: TimeoutMap<String, i32> = TimeoutMap::new(Duration::from_secs(1));
        assert_eq!(map.put_if_absent("k".into(), 1, Duration::from_secs(5)), None);
        assert_eq!(map.put_if_absent("k".into(), 2, Duration::from_secs(5)), Some(1));
        assert_eq!(map.get(&"k".to_string()), Some(1));
    }

    #[tokio::test]
    async fn test_veto_keeps_entry() {
        let listener = Arc::new(Veto {
            allow: AtomicBool::new(false),
            evicted: AtomicUsize::new(0),
        });
        let map: TimeoutMap<String, i32> =
            TimeoutMap::with_listener(Duration::from_secs(1), listener.clone());
        map.put("k".into(), 7, Duration::from_millis(10));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(map.purge(), 0);
        assert_eq!(map.peek(&"k".to_string()), Some(7));

        listener.allow.store(true, Ordering::SeqCst);
        assert_eq!(map.purge(), 1);
        assert!(map.is_empty());
        assert_eq!(listener.evicted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_get_refreshes_expiry() {
        let map: TimeoutMap<String, i32> = TimeoutMap::new(Duration::from_secs(1));
        map.put("k".into(), 1, Duration::from_millis(60));

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(25)).await;
            assert_eq!(map.get(&"k".to_string()), Some(1));
            map.purge();
        }
        assert!(map.contains_key(&"k".to_string()));
    }

    #[tokio::test]
    async fn test_get_with_changes_are_seen_by_purge() {
        struct Idle;
        impl EvictionListener<String, Arc<AtomicUsize>> for Idle {
            fn on_eviction(&self, _key: &String, users: &Arc<AtomicUsize>) -> bool {
                users.load(Ordering::SeqCst) == 0
            }
        }

        let map: TimeoutMap<String, Arc<AtomicUsize>> =
            TimeoutMap::with_listener(Duration::from_secs(1), Arc::new(Idle));
        let key = "k".to_string();
        map.put(key.clone(), Arc::new(AtomicUsize::new(0)), Duration::ZERO);

        let users = map
            .get_with(&key, |users| users.fetch_add(1, Ordering::SeqCst) + 1)
            .unwrap();
        assert_eq!(users, 1);
        assert_eq!(map.purge(), 0);

        let fresh = Arc::new(AtomicUsize::new(0));
        let existing = map.put_if_absent_with(key.clone(), fresh, Duration::ZERO, |users| {
            users.fetch_sub(1, Ordering::SeqCst);
        });
        assert_eq!(existing.unwrap().load(Ordering::SeqCst), 0);
        assert_eq!(map.purge(), 1);
        assert_eq!(map.get_with(&key, |_| ()), None);
    }

    #[tokio::test]
    async fn test_evict_lru_skips_vetoed() {
        struct OnlyEven;
        impl EvictionListener<String, i32> for OnlyEven {
            fn on_eviction(&self, _key: &String, value: &i32) -> bool {
                value % 2 == 0
            }
        }

        let map: TimeoutMap<String, i32> =
            TimeoutMap::with_listener(Duration::from_secs(1), Arc::new(OnlyEven));
        map.put("a".into(), 1, Duration::from_secs(60));
        tokio::time::sleep(Duration::from_millis(2)).await;
        map.put("b".into(), 2, Duration::from_secs(60));
        tokio::time::sleep(Duration::from_millis(2)).await;
        map.put("c".into(), 4, Duration::from_secs(60));

        assert_eq!(map.evict_lru(), Some("b".to_string()));
        assert_eq!(map.len(), 2);
        assert!(map.contains_key(&"a".to_string()));
    }
}
