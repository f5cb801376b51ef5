//! Endpoint, Producer, Consumer and Component contracts
//!
//! Transports plug into the engine by implementing these traits. Two built-in
//! endpoints live here: [`ProcessorEndpoint`], whose producer calls a processor
//! directly, and the in-memory `direct:` endpoint, whose producer hands the
//! exchange to the consumer of the same URI on the calling task.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;

use sy_common::{
    Exchange, ExchangeContext, ExchangePattern, Result, RoutingError, ShutdownRunningTask,
};

use crate::polling::PollingConsumer;
use crate::processor::{process_in_place, AsyncProcessor, Processor};
use crate::service::{Service, ServiceState};

/// URI-addressed factory for exchanges, producers and consumers.
pub trait Endpoint: Send + Sync {
    fn uri(&self) -> &str;

    /// Singleton endpoints are registered with the routing context and shared.
    fn is_singleton(&self) -> bool {
        true
    }

    fn exchange_context(&self) -> Option<Arc<dyn ExchangeContext>>;

    fn exchange_pattern(&self) -> ExchangePattern {
        ExchangePattern::InOnly
    }

    fn create_exchange(&self) -> Exchange {
        self.create_exchange_with_pattern(self.exchange_pattern())
    }

    fn create_exchange_with_pattern(&self, pattern: ExchangePattern) -> Exchange {
        let mut exchange = match self.exchange_context() {
            Some(ctx) => Exchange::with_context(ctx, pattern),
            None => Exchange::new(pattern),
        };
        exchange.set_from_endpoint(self.uri());
        exchange
    }

    fn create_producer(self: Arc<Self>) -> Result<Arc<dyn Producer>>;

    fn create_consumer(self: Arc<Self>, processor: Arc<dyn AsyncProcessor>)
        -> Result<Arc<dyn Consumer>>;

    /// Pull-based consumer. Endpoints that cannot be polled directly return an
    /// error; callers may fall back to an event-driven adapter.
    fn create_polling_consumer(self: Arc<Self>) -> Result<Arc<dyn PollingConsumer>> {
        Err(RoutingError::failed_to_create_consumer(
            self.uri(),
            "endpoint does not support polling",
        ))
    }
}

/// Send side of an endpoint.
pub trait Producer: Service + Processor {
    fn endpoint_uri(&self) -> &str;

    /// Singleton producers are cached and shared; others are pooled.
    fn is_singleton(&self) -> bool {
        true
    }
}

/// Receive side of an endpoint, pushing exchanges into its processor.
pub trait Consumer: Service {
    fn endpoint_uri(&self) -> &str;

    fn processor(&self) -> Arc<dyn AsyncProcessor>;

    fn shutdown_aware(&self) -> Option<&dyn ShutdownAware> {
        None
    }
}

/// Consumers that hold work of their own (e.g. a polled batch) and take part
/// in graceful shutdown.
pub trait ShutdownAware: Send + Sync {
    /// Records how the in-flight batch should be finished. Returns true to ask the
    /// coordinator to postpone stopping this consumer.
    fn defer_shutdown(&self, task: ShutdownRunningTask) -> bool;

    /// Exchanges still to be processed before the consumer can stop.
    fn pending_exchanges_size(&self) -> usize;

    /// Resets shutdown bookkeeping so the consumer can be started again.
    fn prepare_shutdown(&self);
}

/// Factory of endpoints for one URI scheme.
pub trait Component: Send + Sync {
    fn create_endpoint(
        &self,
        uri: &str,
        context: Arc<dyn ExchangeContext>,
    ) -> Result<Arc<dyn Endpoint>>;
}

pub trait EndpointResolver: Send + Sync {
    fn resolve_endpoint(&self, uri: &str) -> Result<Arc<dyn Endpoint>>;
}

/// Scheme of an endpoint URI (`direct:start` -> `direct`).
pub fn scheme_of(uri: &str) -> Option<&str> {
    uri.split_once(':')
        .map(|(scheme, _)| scheme)
        .filter(|scheme| !scheme.is_empty())
}

// ============================================================================
// ProcessorEndpoint
// ============================================================================

/// Endpoint whose producer invokes a processor.
pub struct ProcessorEndpoint {
    uri: String,
    processor: Arc<dyn AsyncProcessor>,
    context: Option<Arc<dyn ExchangeContext>>,
    pattern: ExchangePattern,
}

impl ProcessorEndpoint {
    pub fn new(uri: impl Into<String>, processor: Arc<dyn AsyncProcessor>) -> Self {
        Self {
            uri: uri.into(),
            processor,
            context: None,
            pattern: ExchangePattern::InOut,
        }
    }

    pub fn with_context(mut self, context: Arc<dyn ExchangeContext>) -> Self {
        self.context = Some(context);
        self
    }

    pub fn processor(&self) -> Arc<dyn AsyncProcessor> {
        self.processor.clone()
    }
}

impl Endpoint for ProcessorEndpoint {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn exchange_context(&self) -> Option<Arc<dyn ExchangeContext>> {
        self.context.clone()
    }

    fn exchange_pattern(&self) -> ExchangePattern {
        self.pattern
    }

    fn create_producer(self: Arc<Self>) -> Result<Arc<dyn Producer>> {
        Ok(Arc::new(ProcessorProducer {
            uri: self.uri.clone(),
            processor: self.processor.clone(),
            state: ServiceState::new(),
        }))
    }

    fn create_consumer(
        self: Arc<Self>,
        _processor: Arc<dyn AsyncProcessor>,
    ) -> Result<Arc<dyn Consumer>> {
        Err(RoutingError::failed_to_create_consumer(
            &self.uri,
            "processor endpoints cannot be consumed from",
        ))
    }
}

struct ProcessorProducer {
    uri: String,
    processor: Arc<dyn AsyncProcessor>,
    state: ServiceState,
}

impl Service for ProcessorProducer {
    fn service_state(&self) -> &ServiceState {
        &self.state
    }
}

#[async_trait]
impl Processor for ProcessorProducer {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        process_in_place(self.processor.as_ref(), exchange).await
    }
}

impl Producer for ProcessorProducer {
    fn endpoint_uri(&self) -> &str {
        &self.uri
    }
}

// ============================================================================
// direct: component
// ============================================================================

/// In-memory synchronous endpoints (`direct:name`).
#[derive(Default)]
pub struct DirectComponent;

impl Component for DirectComponent {
    fn create_endpoint(
        &self,
        uri: &str,
        context: Arc<dyn ExchangeContext>,
    ) -> Result<Arc<dyn Endpoint>> {
        Ok(Arc::new(DirectEndpoint::new(uri, Some(context))))
    }
}

pub struct DirectEndpoint {
    uri: String,
    context: Option<Arc<dyn ExchangeContext>>,
    consumer: Arc<RwLock<Option<Arc<dyn AsyncProcessor>>>>,
}

impl DirectEndpoint {
    pub fn new(uri: impl Into<String>, context: Option<Arc<dyn ExchangeContext>>) -> Self {
        Self {
            uri: uri.into(),
            context,
            consumer: Arc::new(RwLock::new(None)),
        }
    }

    pub fn has_consumer(&self) -> bool {
        self.consumer.read().is_some()
    }
}

impl Endpoint for DirectEndpoint {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn exchange_context(&self) -> Option<Arc<dyn ExchangeContext>> {
        self.context.clone()
    }

    fn create_producer(self: Arc<Self>) -> Result<Arc<dyn Producer>> {
        Ok(Arc::new(DirectProducer {
            uri: self.uri.clone(),
            consumer: self.consumer.clone(),
            state: ServiceState::new(),
        }))
    }

    fn create_consumer(
        self: Arc<Self>,
        processor: Arc<dyn AsyncProcessor>,
    ) -> Result<Arc<dyn Consumer>> {
        Ok(Arc::new(DirectConsumer {
            uri: self.uri.clone(),
            processor,
            slot: self.consumer.clone(),
            state: ServiceState::new(),
        }))
    }
}

struct DirectProducer {
    uri: String,
    consumer: Arc<RwLock<Option<Arc<dyn AsyncProcessor>>>>,
    state: ServiceState,
}

impl Service for DirectProducer {
    fn service_state(&self) -> &ServiceState {
        &self.state
    }
}

#[async_trait]
impl Processor for DirectProducer {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        let consumer = self.consumer.read().clone();
        match consumer {
            Some(processor) => process_in_place(processor.as_ref(), exchange).await,
            None => {
                exchange.set_exception(RoutingError::illegal_state(format!(
                    "No consumers available on endpoint: {}",
                    self.uri
                )));
                Ok(())
            }
        }
    }
}

impl Producer for DirectProducer {
    fn endpoint_uri(&self) -> &str {
        &self.uri
    }
}

struct DirectConsumer {
    uri: String,
    processor: Arc<dyn AsyncProcessor>,
    slot: Arc<RwLock<Option<Arc<dyn AsyncProcessor>>>>,
    state: ServiceState,
}

#[async_trait]
impl Service for DirectConsumer {
    fn service_state(&self) -> &ServiceState {
        &self.state
    }

    async fn do_start(&self) -> Result<()> {
        let mut slot = self.slot.write();
        if slot.is_some() {
            return Err(RoutingError::failed_to_create_consumer(
                &self.uri,
                "endpoint already has a consumer",
            ));
        }
        *slot = Some(self.processor.clone());
        debug!(uri = %self.uri, "Direct consumer attached");
        Ok(())
    }

    async fn do_stop(&self) -> Result<()> {
        let mut slot = self.slot.write();
        if let Some(current) = slot.as_ref() {
            if Arc::ptr_eq(current, &self.processor) {
                *slot = None;
            }
        }
        Ok(())
    }
}

impl Consumer for DirectConsumer {
    fn endpoint_uri(&self) -> &str {
        &self.uri
    }

    fn processor(&self) -> Arc<dyn AsyncProcessor> {
        self.processor.clone()
    }
}
