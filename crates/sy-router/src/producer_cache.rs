//! ProducerCache - reuse of started producers per endpoint
//!
//! Singleton producers are cached by endpoint URI in a TimeoutMap, bounded by
//! `maximum_cache_size` with LRU eviction. A producer in use is never evicted.
//! Non-singleton producers go through a [`ServicePool`].
//!
//! Every send holds its producer through a lease. A lease dropped before it was
//! released, as when the caller times out and cancels the send, still hands the
//! producer back so it stays evictable.

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use sy_common::{property, AggregateError, CacheConfig, Exchange, Result, RoutingError};

use crate::endpoint::{Endpoint, Producer};
use crate::lifecycle::{Housekeeping, LifecycleManager};
use crate::metrics;
use crate::pool::ServicePool;
use crate::processor::{run_async, AsyncCallback, AsyncProcessor};
use crate::service::{Service, ServiceState};
use crate::timeout_map::{EvictionListener, TimeoutMap};

#[derive(Clone)]
struct CachedProducer {
    producer: Arc<dyn Producer>,
    in_use: Arc<AtomicUsize>,
}

type Graveyard = Arc<Mutex<Vec<Arc<dyn Producer>>>>;

struct ProducerEvictionListener {
    graveyard: Graveyard,
}

impl EvictionListener<String, CachedProducer> for ProducerEvictionListener {
    fn on_eviction(&self, _uri: &String, cached: &CachedProducer) -> bool {
        cached.in_use.load(Ordering::Acquire) == 0
    }

    fn evicted(&self, uri: String, cached: CachedProducer) {
        debug!(uri = %uri, "Evicting cached producer");
        metrics::cache_eviction();
        self.graveyard.lock().push(cached.producer);
    }
}

struct CacheInner {
    singletons: TimeoutMap<String, CachedProducer>,
    pool: ServicePool<dyn Producer>,
    graveyard: Graveyard,
    maximum_cache_size: usize,
}

impl CacheInner {
    /// Drops the in-use count of a cached singleton. False when `producer` is
    /// no longer the one cached for `uri`.
    fn check_in(&self, uri: &str, producer: &Arc<dyn Producer>) -> bool {
        match self.singletons.peek(&uri.to_string()) {
            Some(cached) if Arc::ptr_eq(&cached.producer, producer) => {
                let _ = cached.in_use.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                    Some(n.saturating_sub(1))
                });
                true
            }
            _ => false,
        }
    }

    /// Evicts idle producers admitted over budget while every entry was in use.
    fn trim(&self) -> bool {
        let mut evicted = false;
        while self.singletons.len() > self.maximum_cache_size {
            if self.singletons.evict_lru().is_none() {
                break;
            }
            evicted = true;
        }
        evicted
    }

    async fn release(&self, uri: &str, producer: Arc<dyn Producer>) {
        if !producer.is_singleton() {
            self.pool.release(uri, producer).await;
            return;
        }
        if self.check_in(uri, &producer) {
            if self.trim() {
                self.stop_evicted().await;
            }
        } else {
            // evicted or replaced while in use
            if let Err(e) = producer.stop().await {
                warn!(uri = %uri, error = %e, "Failed to stop orphaned producer");
            }
        }
    }

    async fn stop_evicted(&self) -> Vec<RoutingError> {
        let evicted: Vec<_> = std::mem::take(&mut *self.graveyard.lock());
        let mut errors = Vec::new();
        for producer in evicted {
            if let Err(e) = producer.stop().await {
                warn!(uri = %producer.endpoint_uri(), error = %e, "Failed to stop evicted producer");
                errors.push(e);
            }
        }
        errors
    }
}

#[async_trait]
impl Housekeeping for CacheInner {
    fn name(&self) -> &str {
        "producer-cache-purge"
    }

    async fn run(&self) {
        self.singletons.purge();
        self.stop_evicted().await;
    }
}

/// A producer checked out for one send.
struct Lease {
    inner: Arc<CacheInner>,
    uri: String,
    producer: Arc<dyn Producer>,
    released: bool,
}

impl Lease {
    async fn release(mut self) {
        self.released = true;
        self.inner.release(&self.uri, self.producer.clone()).await;
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        debug!(uri = %self.uri, "Send cancelled, handing producer back");
        let producer = self.producer.clone();
        let singleton_checked_in =
            producer.is_singleton() && self.inner.check_in(&self.uri, &producer);
        if singleton_checked_in && !self.inner.trim() {
            return;
        }

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!(uri = %self.uri, "No runtime to release producer of a cancelled send");
                return;
            }
        };
        let inner = self.inner.clone();
        let uri = std::mem::take(&mut self.uri);
        handle.spawn(async move {
            if singleton_checked_in {
                inner.stop_evicted().await;
            } else {
                inner.release(&uri, producer).await;
            }
        });
    }
}

pub struct ProducerCache {
    inner: Arc<CacheInner>,
    config: CacheConfig,
    state: ServiceState,
    housekeeper: Mutex<Option<LifecycleManager>>,
}

impl ProducerCache {
    pub fn new(config: CacheConfig) -> Self {
        let graveyard: Graveyard = Arc::new(Mutex::new(Vec::new()));
        let listener = Arc::new(ProducerEvictionListener {
            graveyard: graveyard.clone(),
        });
        Self {
            inner: Arc::new(CacheInner {
                singletons: TimeoutMap::with_listener(config.purge_interval(), listener),
                pool: ServicePool::new(config.clone()),
                graveyard,
                maximum_cache_size: config.maximum_cache_size,
            }),
            config,
            state: ServiceState::new(),
            housekeeper: Mutex::new(None),
        }
    }

    pub fn maximum_cache_size(&self) -> usize {
        self.config.maximum_cache_size
    }

    /// Cached singleton producers plus pooled keys
    pub fn size(&self) -> usize {
        self.inner.singletons.len() + self.inner.pool.size()
    }

    /// A started producer for the endpoint. Must be handed back with
    /// [`release_producer`](Self::release_producer).
    pub async fn acquire_producer(&self, endpoint: &Arc<dyn Endpoint>) -> Result<Arc<dyn Producer>> {
        if !self.state.is_run_allowed() {
            return Err(RoutingError::ShutdownInProgress);
        }
        let uri = endpoint.uri().to_string();

        // counted in use under the entry lock, so a concurrent purge vetoes it
        let cached = self.inner.singletons.get_with(&uri, |cached| {
            cached.in_use.fetch_add(1, Ordering::AcqRel);
            cached.producer.clone()
        });
        if let Some(producer) = cached {
            metrics::cache_hit();
            return Ok(producer);
        }
        if let Some(pooled) = self.inner.pool.acquire(&uri) {
            metrics::cache_hit();
            return Ok(pooled);
        }
        metrics::cache_miss();

        let producer = endpoint
            .clone()
            .create_producer()
            .map_err(|e| RoutingError::failed_to_create_producer(&uri, e))?;

        if !producer.is_singleton() {
            return self.inner.pool.acquire_if_absent(&uri, producer).await;
        }

        producer.start().await?;

        if self.inner.singletons.len() >= self.maximum_cache_size() {
            self.inner.singletons.evict_lru();
            self.inner.stop_evicted().await;
        }

        let cached = CachedProducer {
            producer: producer.clone(),
            in_use: Arc::new(AtomicUsize::new(1)),
        };
        let existing = self.inner.singletons.put_if_absent_with(
            uri.clone(),
            cached,
            self.config.idle_timeout(),
            |existing| {
                existing.in_use.fetch_add(1, Ordering::AcqRel);
            },
        );
        match existing {
            None => {
                debug!(uri = %uri, "Cached new producer");
                Ok(producer)
            }
            Some(existing) => {
                // lost a race with another caller: use theirs
                tokio::spawn(async move {
                    if let Err(e) = producer.stop().await {
                        let uri = producer.endpoint_uri();
                        warn!(uri = %uri, error = %e, "Failed to stop surplus producer");
                    }
                });
                Ok(existing.producer)
            }
        }
    }

    pub async fn release_producer(&self, endpoint: &Arc<dyn Endpoint>, producer: Arc<dyn Producer>) {
        self.inner.release(endpoint.uri(), producer).await;
    }

    async fn lease(&self, endpoint: &Arc<dyn Endpoint>) -> Result<Lease> {
        let producer = self.acquire_producer(endpoint).await?;
        Ok(Lease {
            inner: self.inner.clone(),
            uri: endpoint.uri().to_string(),
            producer,
            released: false,
        })
    }

    /// Sends the exchange to the endpoint. Failures of the producer are set on
    /// the exchange; only acquiring a producer can fail this call.
    ///
    /// Cancel safe: dropping the future mid-send still releases the producer.
    pub async fn send(&self, endpoint: &Arc<dyn Endpoint>, exchange: &mut Exchange) -> Result<()> {
        let lease = self.lease(endpoint).await?;
        exchange.set_property(property::TO_ENDPOINT, endpoint.uri());

        if let Err(e) = lease.producer.process(exchange).await {
            exchange.set_exception(e);
        }
        lease.release().await;
        Ok(())
    }

    /// Callback variant of [`send`](Self::send). An acquisition failure is set on
    /// the exchange.
    pub fn send_async(
        self: &Arc<Self>,
        endpoint: Arc<dyn Endpoint>,
        exchange: Exchange,
        callback: AsyncCallback,
    ) -> bool {
        let cache = self.clone();
        run_async(exchange, callback, move |mut exchange| {
            async move {
                if let Err(e) = cache.send(&endpoint, &mut exchange).await {
                    exchange.set_exception(e);
                }
                exchange
            }
            .boxed()
        })
    }

    /// Runs one eviction sweep over cached and pooled producers now.
    pub async fn purge(&self) -> usize {
        let evicted = self.inner.singletons.purge();
        self.inner.stop_evicted().await;
        evicted + self.inner.pool.purge().await
    }
}

/// Route node that sends the exchange to a fixed endpoint through the cache.
pub struct SendProcessor {
    endpoint: Arc<dyn Endpoint>,
    cache: Arc<ProducerCache>,
}

impl SendProcessor {
    pub fn new(endpoint: Arc<dyn Endpoint>, cache: Arc<ProducerCache>) -> Self {
        Self { endpoint, cache }
    }

    pub fn endpoint(&self) -> &Arc<dyn Endpoint> {
        &self.endpoint
    }
}

impl AsyncProcessor for SendProcessor {
    fn process_async(&self, exchange: Exchange, callback: AsyncCallback) -> bool {
        self.cache
            .send_async(self.endpoint.clone(), exchange, callback)
    }
}

#[async_trait]
impl Service for ProducerCache {
    fn service_state(&self) -> &ServiceState {
        &self.state
    }

    async fn do_start(&self) -> Result<()> {
        self.inner.pool.start().await?;
        let manager = LifecycleManager::new();
        manager.schedule(self.inner.clone(), self.config.purge_interval());
        *self.housekeeper.lock() = Some(manager);
        info!(
            maximum_cache_size = self.maximum_cache_size(),
            "Producer cache started"
        );
        Ok(())
    }

    async fn do_stop(&self) -> Result<()> {
        let manager = self.housekeeper.lock().take();
        if let Some(manager) = manager {
            manager.shutdown().await;
        }

        let mut errors = Vec::new();
        for (uri, cached) in self.inner.singletons.clear() {
            if let Err(e) = cached.producer.stop().await {
                warn!(uri = %uri, error = %e, "Failed to stop cached producer");
                errors.push(e);
            }
        }
        errors.extend(self.inner.stop_evicted().await);
        if let Err(e) = self.inner.pool.stop().await {
            errors.push(e);
        }

        match AggregateError::from_causes(errors) {
            Some(agg) => Err(RoutingError::Aggregate(agg)),
            None => Ok(()),
        }
    }
}
