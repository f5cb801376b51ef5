//! Pull-based consumption
//!
//! [`PollingConsumer`] is the pull contract, [`PollStrategy`] wraps each poll
//! attempt with begin/commit/rollback, and [`BatchConsumer`] processes one poll
//! result as an ordered batch.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, warn};

use sy_common::{property, Exchange, Result, RoutingError};

use crate::endpoint::{Consumer, Endpoint};
use crate::processor::{run_async, AsyncCallback, AsyncProcessor};
use crate::service::{Service, ServiceState};

#[async_trait]
pub trait PollingConsumer: Service {
    fn endpoint_uri(&self) -> &str;

    /// Waits until an exchange is available. `None` once the consumer is stopped.
    async fn receive(&self) -> Option<Exchange>;

    fn receive_no_wait(&self) -> Option<Exchange>;

    /// `None` when nothing arrived within `timeout`.
    async fn receive_timeout(&self, timeout: Duration) -> Option<Exchange>;
}

// ============================================================================
// EventDrivenPollingConsumer
// ============================================================================

pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Pull adapter over a push consumer.
///
/// Exchanges pushed by the endpoint's consumer are queued (bounded) and handed
/// out by `receive*`. The pushing side gets its own exchange back as soon as a
/// copy is queued.
pub struct EventDrivenPollingConsumer {
    endpoint: Arc<dyn Endpoint>,
    sender: mpsc::Sender<Exchange>,
    receiver: AsyncMutex<mpsc::Receiver<Exchange>>,
    consumer: parking_lot::Mutex<Option<Arc<dyn Consumer>>>,
    state: ServiceState,
}

struct QueueingProcessor {
    sender: mpsc::Sender<Exchange>,
}

impl AsyncProcessor for QueueingProcessor {
    fn process_async(&self, mut exchange: Exchange, callback: AsyncCallback) -> bool {
        let mut copy = exchange.copy();
        copy.set_property(property::CORRELATION_ID, exchange.id());

        match self.sender.try_send(copy) {
            Ok(()) => {
                callback.on_data_received(exchange, true);
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                exchange.set_exception(RoutingError::ShutdownInProgress);
                callback.on_data_received(exchange, true);
                true
            }
            Err(mpsc::error::TrySendError::Full(copy)) => {
                let sender = self.sender.clone();
                run_async(exchange, callback, move |mut exchange| {
                    async move {
                        if sender.send(copy).await.is_err() {
                            exchange.set_exception(RoutingError::ShutdownInProgress);
                        }
                        exchange
                    }
                    .boxed()
                })
            }
        }
    }
}

impl EventDrivenPollingConsumer {
    pub fn new(endpoint: Arc<dyn Endpoint>) -> Self {
        Self::with_capacity(endpoint, DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(endpoint: Arc<dyn Endpoint>, capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            endpoint,
            sender,
            receiver: AsyncMutex::new(receiver),
            consumer: parking_lot::Mutex::new(None),
            state: ServiceState::new(),
        }
    }

    /// Processor that feeds this consumer's queue.
    pub fn queueing_processor(&self) -> Arc<dyn AsyncProcessor> {
        Arc::new(QueueingProcessor {
            sender: self.sender.clone(),
        })
    }

    pub fn queued(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }
}

#[async_trait]
impl Service for EventDrivenPollingConsumer {
    fn service_state(&self) -> &ServiceState {
        &self.state
    }

    async fn do_start(&self) -> Result<()> {
        let consumer = self
            .endpoint
            .clone()
            .create_consumer(self.queueing_processor())?;
        consumer.start().await?;
        *self.consumer.lock() = Some(consumer);
        Ok(())
    }

    async fn do_stop(&self) -> Result<()> {
        let consumer = self.consumer.lock().take();
        match consumer {
            Some(consumer) => consumer.stop().await,
            None => Ok(()),
        }
    }
}

#[async_trait]
impl PollingConsumer for EventDrivenPollingConsumer {
    fn endpoint_uri(&self) -> &str {
        self.endpoint.uri()
    }

    async fn receive(&self) -> Option<Exchange> {
        while self.is_run_allowed() {
            if let Some(exchange) = self.receive_timeout(Duration::from_millis(500)).await {
                return Some(exchange);
            }
        }
        None
    }

    fn receive_no_wait(&self) -> Option<Exchange> {
        let mut receiver = self.receiver.try_lock().ok()?;
        receiver.try_recv().ok()
    }

    async fn receive_timeout(&self, timeout: Duration) -> Option<Exchange> {
        let mut receiver = self.receiver.lock().await;
        tokio::time::timeout(timeout, receiver.recv())
            .await
            .ok()
            .flatten()
    }
}

// ============================================================================
// Poll strategy
// ============================================================================

/// Hooks around each poll attempt.
#[async_trait]
pub trait PollStrategy: Send + Sync {
    /// Return false to skip this poll.
    async fn begin(&self, consumer: &dyn Service, endpoint: &str) -> bool;

    async fn commit(&self, consumer: &dyn Service, endpoint: &str, polled: usize);

    /// `Ok(true)` retries at once, `Ok(false)` continues with the normal
    /// schedule, `Err` stops scheduling for this consumer.
    async fn rollback(
        &self,
        consumer: &dyn Service,
        endpoint: &str,
        retry_counter: u32,
        cause: &RoutingError,
    ) -> Result<bool>;
}

/// Logs failures and never retries immediately.
#[derive(Debug, Default)]
pub struct DefaultPollStrategy;

#[async_trait]
impl PollStrategy for DefaultPollStrategy {
    async fn begin(&self, _consumer: &dyn Service, _endpoint: &str) -> bool {
        true
    }

    async fn commit(&self, _consumer: &dyn Service, _endpoint: &str, _polled: usize) {}

    async fn rollback(
        &self,
        _consumer: &dyn Service,
        endpoint: &str,
        retry_counter: u32,
        cause: &RoutingError,
    ) -> Result<bool> {
        warn!(
            endpoint = %endpoint,
            retry_counter,
            error = %cause,
            "Consumer failed polling endpoint, will try again on next poll"
        );
        Ok(false)
    }
}

/// Suspends the consumer after `limit` consecutive failed polls.
#[derive(Debug)]
pub struct LimitedPollStrategy {
    limit: u32,
    failures: DashMap<String, u32>,
}

impl Default for LimitedPollStrategy {
    fn default() -> Self {
        Self::new(3)
    }
}

impl LimitedPollStrategy {
    pub fn new(limit: u32) -> Self {
        Self {
            limit: limit.max(1),
            failures: DashMap::new(),
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn failures(&self, endpoint: &str) -> u32 {
        self.failures.get(endpoint).map(|f| *f).unwrap_or(0)
    }
}

#[async_trait]
impl PollStrategy for LimitedPollStrategy {
    async fn begin(&self, _consumer: &dyn Service, _endpoint: &str) -> bool {
        true
    }

    async fn commit(&self, _consumer: &dyn Service, endpoint: &str, _polled: usize) {
        self.failures.remove(endpoint);
    }

    async fn rollback(
        &self,
        consumer: &dyn Service,
        endpoint: &str,
        retry_counter: u32,
        cause: &RoutingError,
    ) -> Result<bool> {
        let failures = {
            let mut entry = self.failures.entry(endpoint.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };

        if failures >= self.limit {
            warn!(
                endpoint = %endpoint,
                failures,
                error = %cause,
                "Suspending consumer after consecutive poll failures"
            );
            self.failures.remove(endpoint);
            if let Err(e) = consumer.suspend().await {
                warn!(endpoint = %endpoint, error = %e, "Failed to suspend consumer");
            }
        } else {
            debug!(endpoint = %endpoint, failures, retry_counter, "Poll failed");
        }
        Ok(false)
    }
}

// ============================================================================
// Batch consumer
// ============================================================================

#[async_trait]
pub trait BatchConsumer: Send + Sync {
    /// `<= 0` means unlimited.
    fn set_max_messages_per_poll(&self, max: i64);

    fn max_messages_per_poll(&self) -> i64;

    /// Whether the batch loop may continue with the next exchange.
    fn is_batch_allowed(&self) -> bool;

    /// Processes the exchanges in order and returns how many were processed.
    async fn process_batch(&self, exchanges: Vec<Exchange>) -> Result<usize>;
}

/// Stamps batch index/size/complete properties on each exchange.
pub fn mark_batch(exchanges: &mut [Exchange]) {
    let total = exchanges.len();
    for (index, exchange) in exchanges.iter_mut().enumerate() {
        exchange.set_property(property::BATCH_INDEX, index as i64);
        exchange.set_property(property::BATCH_SIZE, total as i64);
        exchange.set_property(property::BATCH_COMPLETE, index + 1 == total);
    }
}

/// Truncates a poll result to the configured maximum.
pub fn limit_batch(exchanges: &mut Vec<Exchange>, max_messages_per_poll: i64) {
    if max_messages_per_poll > 0 && exchanges.len() as i64 > max_messages_per_poll {
        debug!(
            polled = exchanges.len(),
            limit = max_messages_per_poll,
            "Limiting batch to max messages per poll"
        );
        exchanges.truncate(max_messages_per_poll as usize);
    }
}
