//! ServicePool - keyed pool of started services
//!
//! Mirrors the producer pooling of the routing engine with:
//! - Per-key idle queues with a per-key capacity
//! - Check-out tracking so members in use are never evicted
//! - Idle expiry and LRU eviction through a TimeoutMap
//! - Stop-every-member teardown that aggregates failures

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use sy_common::{AggregateError, CacheConfig, Result, RoutingError};

use crate::lifecycle::{Housekeeping, LifecycleManager};
use crate::service::{Service, ServiceState};
use crate::timeout_map::{EvictionListener, TimeoutMap};

/// Idle members and check-out count for one key
struct KeyedPool<S: ?Sized> {
    idle: Mutex<VecDeque<Arc<S>>>,
    checked_out: AtomicUsize,
}

impl<S: ?Sized> KeyedPool<S> {
    fn with_checked_out(checked_out: usize) -> Self {
        Self {
            idle: Mutex::new(VecDeque::new()),
            checked_out: AtomicUsize::new(checked_out),
        }
    }

    fn idle_len(&self) -> usize {
        self.idle.lock().len()
    }

    fn check_in(&self) {
        // saturating: a release without a matching acquire must not wrap
        let _ = self
            .checked_out
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)));
    }
}

/// Members drained from evicted keys, waiting to be stopped
type Graveyard<S> = Arc<Mutex<Vec<Arc<S>>>>;

struct PoolEvictionListener<S: ?Sized> {
    graveyard: Graveyard<S>,
}

impl<S> EvictionListener<String, Arc<KeyedPool<S>>> for PoolEvictionListener<S>
where
    S: Service + ?Sized + 'static,
{
    fn on_eviction(&self, _key: &String, pool: &Arc<KeyedPool<S>>) -> bool {
        pool.checked_out.load(Ordering::Acquire) == 0
    }

    fn evicted(&self, key: String, pool: Arc<KeyedPool<S>>) {
        let drained: Vec<_> = pool.idle.lock().drain(..).collect();
        debug!(key = %key, members = drained.len(), "Evicted pool key");
        metrics::counter!("switchyard_pool_evictions_total").increment(1);
        self.graveyard.lock().extend(drained);
    }
}

struct PoolInner<S: ?Sized> {
    pools: TimeoutMap<String, Arc<KeyedPool<S>>>,
    graveyard: Graveyard<S>,
    config: CacheConfig,
}

impl<S> PoolInner<S>
where
    S: Service + ?Sized + 'static,
{
    async fn bury(&self) -> Vec<RoutingError> {
        let dead: Vec<_> = std::mem::take(&mut *self.graveyard.lock());
        let mut errors = Vec::new();
        for member in dead {
            if let Err(e) = member.stop().await {
                warn!(error = %e, "Failed to stop evicted pool member");
                errors.push(e);
            }
        }
        errors
    }
}

#[async_trait]
impl<S> Housekeeping for PoolInner<S>
where
    S: Service + ?Sized + 'static,
{
    fn name(&self) -> &str {
        "service-pool-purge"
    }

    async fn run(&self) {
        self.pools.purge();
        self.bury().await;
    }
}

/// Keyed pool of started services.
///
/// A member is owned by exactly one caller between `acquire`/`acquire_if_absent`
/// and `release`. Only the pool starts and stops members.
pub struct ServicePool<S: ?Sized> {
    inner: Arc<PoolInner<S>>,
    state: ServiceState,
    housekeeper: Mutex<Option<LifecycleManager>>,
}

impl<S> ServicePool<S>
where
    S: Service + ?Sized + 'static,
{
    pub fn new(config: CacheConfig) -> Self {
        let graveyard: Graveyard<S> = Arc::new(Mutex::new(Vec::new()));
        let listener = Arc::new(PoolEvictionListener {
            graveyard: graveyard.clone(),
        });
        Self {
            inner: Arc::new(PoolInner {
                pools: TimeoutMap::with_listener(config.purge_interval(), listener),
                graveyard,
                config,
            }),
            state: ServiceState::new(),
            housekeeper: Mutex::new(None),
        }
    }

    pub fn max_size(&self) -> usize {
        self.inner.config.maximum_cache_size
    }

    fn idle_timeout(&self) -> Duration {
        self.inner.config.idle_timeout()
    }

    /// An idle member for `key`, or `None`.
    pub fn acquire(&self, key: &str) -> Option<Arc<S>> {
        // pop and check out under the entry lock: a purge either sees the
        // check-out or removes the key before we get here
        self.inner
            .pools
            .get_with(&key.to_string(), |pool| {
                let member = pool.idle.lock().pop_front()?;
                pool.checked_out.fetch_add(1, Ordering::AcqRel);
                Some(member)
            })
            .flatten()
    }

    /// An idle member for `key` if there is one; otherwise starts `service` and
    /// checks it out. A start failure is returned and nothing is registered.
    pub async fn acquire_if_absent(&self, key: &str, service: Arc<S>) -> Result<Arc<S>> {
        if let Some(existing) = self.acquire(key) {
            return Ok(existing);
        }
        if !self.state.is_run_allowed() {
            return Err(RoutingError::ShutdownInProgress);
        }

        service.start().await?;

        let key = key.to_string();
        if !self.inner.pools.contains_key(&key) {
            self.make_room().await;
        }
        let fresh = Arc::new(KeyedPool::with_checked_out(1));
        self.inner
            .pools
            .put_if_absent_with(key.clone(), fresh, self.idle_timeout(), |pool| {
                pool.checked_out.fetch_add(1, Ordering::AcqRel);
            });

        debug!(key = %key, "Registered new pool member");
        Ok(service)
    }

    /// Returns a member. It is stopped instead of kept when the key is at
    /// capacity, the key is gone, or the pool is stopping.
    pub async fn release(&self, key: &str, service: Arc<S>) {
        let run_allowed = self.state.is_run_allowed();
        let max_per_key = self.inner.config.max_per_key;
        let returned = self.inner.pools.get_with(&key.to_string(), |p| {
            let keep = run_allowed && p.idle_len() < max_per_key;
            if keep {
                p.idle.lock().push_back(service.clone());
            }
            p.check_in();
            keep
        });

        let keep = match returned {
            Some(keep) => keep,
            None => {
                debug!(key = %key, "Released member of an unknown key");
                false
            }
        };

        if !keep {
            if let Err(e) = service.stop().await {
                warn!(key = %key, error = %e, "Failed to stop released pool member");
            }
        }

        // admitted over budget while everything was checked out: trim now
        while self.inner.pools.len() > self.max_size() {
            if self.inner.pools.evict_lru().is_none() {
                break;
            }
        }
        self.inner.bury().await;
    }

    async fn make_room(&self) {
        while self.inner.pools.len() >= self.max_size() {
            if self.inner.pools.evict_lru().is_none() {
                debug!(
                    size = self.inner.pools.len(),
                    "Every pooled key is in use, admitting over budget"
                );
                break;
            }
        }
        self.inner.bury().await;
    }

    /// Number of keys currently pooled
    pub fn size(&self) -> usize {
        self.inner.pools.len()
    }

    pub fn idle_count(&self, key: &str) -> usize {
        self.inner
            .pools
            .peek(&key.to_string())
            .map(|p| p.idle_len())
            .unwrap_or(0)
    }

    pub fn checked_out(&self, key: &str) -> usize {
        self.inner
            .pools
            .peek(&key.to_string())
            .map(|p| p.checked_out.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Runs one eviction sweep now.
    pub async fn purge(&self) -> usize {
        let evicted = self.inner.pools.purge();
        self.inner.bury().await;
        evicted
    }
}

#[async_trait]
impl<S> Service for ServicePool<S>
where
    S: Service + ?Sized + 'static,
{
    fn service_state(&self) -> &ServiceState {
        &self.state
    }

    async fn do_start(&self) -> Result<()> {
        let manager = LifecycleManager::new();
        manager.schedule(self.inner.clone(), self.inner.config.purge_interval());
        *self.housekeeper.lock() = Some(manager);
        info!(max_size = self.max_size(), "Service pool started");
        Ok(())
    }

    async fn do_stop(&self) -> Result<()> {
        let manager = self.housekeeper.lock().take();
        if let Some(manager) = manager {
            manager.shutdown().await;
        }

        let mut errors = Vec::new();
        let mut stopped = 0usize;
        for (key, pool) in self.inner.pools.clear() {
            let members: Vec<_> = pool.idle.lock().drain(..).collect();
            for member in members {
                stopped += 1;
                if let Err(e) = member.stop().await {
                    warn!(key = %key, error = %e, "Failed to stop pool member");
                    errors.push(e);
                }
            }
        }
        errors.extend(self.inner.bury().await);

        info!(stopped, failures = errors.len(), "Service pool stopped");
        match AggregateError::from_causes(errors) {
            Some(agg) => Err(RoutingError::Aggregate(agg)),
            None => Ok(()),
        }
    }
}
