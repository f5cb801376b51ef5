//! Synchronous facades for sending to and receiving from endpoints
//!
//! Both templates turn a failure carried on the exchange into
//! [`RoutingError::Execution`] so callers get plain `Result` semantics.

use async_trait::async_trait;
use dashmap::DashMap;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use serde_json::Value;
use sy_common::{Exchange, ExchangePattern, Result, RoutingError};

use crate::endpoint::{Endpoint, EndpointResolver};
use crate::polling::{EventDrivenPollingConsumer, PollingConsumer};
use crate::producer_cache::ProducerCache;
use crate::service::{Service, ServiceState};

/// Turns an exchange-attached failure into an error.
pub fn check_exchange(exchange: &Exchange) -> Result<()> {
    if let Some(cause) = exchange.exception_arc() {
        return Err(RoutingError::Execution {
            exchange_id: exchange.id().to_string(),
            cause,
        });
    }
    if exchange.fault().is_some() {
        return Err(RoutingError::Execution {
            exchange_id: exchange.id().to_string(),
            cause: Arc::new(RoutingError::processing("exchange completed with a fault message")),
        });
    }
    Ok(())
}

/// Result body (OUT when present, else IN) converted to `T`.
pub fn result_body<T: Any + Send + Clone>(exchange: &Exchange) -> Result<T> {
    let message = exchange.result_message();
    let body = message.body().ok_or_else(|| {
        RoutingError::no_conversion("<empty body>", std::any::type_name::<T>())
    })?;
    match exchange.context() {
        Some(ctx) => ctx.type_converter().mandatory_convert_to::<T>(body),
        None => body.downcast_ref::<T>().cloned().ok_or_else(|| {
            RoutingError::no_conversion(body.type_name(), std::any::type_name::<T>())
        }),
    }
}

// ============================================================================
// ProducerTemplate
// ============================================================================

pub struct ProducerTemplate {
    resolver: Arc<dyn EndpointResolver>,
    cache: Arc<ProducerCache>,
    default_endpoint: Option<String>,
}

impl ProducerTemplate {
    pub fn new(resolver: Arc<dyn EndpointResolver>, cache: Arc<ProducerCache>) -> Self {
        Self {
            resolver,
            cache,
            default_endpoint: None,
        }
    }

    pub fn with_default_endpoint(mut self, uri: impl Into<String>) -> Self {
        self.default_endpoint = Some(uri.into());
        self
    }

    pub fn default_endpoint(&self) -> Option<&str> {
        self.default_endpoint.as_deref()
    }

    fn endpoint(&self, uri: &str) -> Result<Arc<dyn Endpoint>> {
        self.resolver.resolve_endpoint(uri)
    }

    /// Sends the exchange and hands it back. Failures stay on the exchange.
    pub async fn send(&self, uri: &str, mut exchange: Exchange) -> Result<Exchange> {
        let endpoint = self.endpoint(uri)?;
        self.cache.send(&endpoint, &mut exchange).await?;
        Ok(exchange)
    }

    /// Sends the body as an InOnly exchange.
    pub async fn send_body<B: Any + Send + Sync>(&self, uri: &str, body: B) -> Result<()> {
        let endpoint = self.endpoint(uri)?;
        let mut exchange = endpoint.create_exchange_with_pattern(ExchangePattern::InOnly);
        exchange.in_message_mut().set_body(body);
        self.cache.send(&endpoint, &mut exchange).await?;
        check_exchange(&exchange)
    }

    /// Sends to the default endpoint.
    pub async fn send_body_default<B: Any + Send + Sync>(&self, body: B) -> Result<()> {
        let uri = self
            .default_endpoint
            .clone()
            .ok_or_else(|| RoutingError::illegal_state("No default endpoint configured"))?;
        self.send_body(&uri, body).await
    }

    async fn request(&self, uri: &str, exchange_setup: impl FnOnce(&mut Exchange)) -> Result<Exchange> {
        let endpoint = self.endpoint(uri)?;
        let mut exchange = endpoint.create_exchange_with_pattern(ExchangePattern::InOut);
        exchange_setup(&mut exchange);
        self.cache.send(&endpoint, &mut exchange).await?;
        check_exchange(&exchange)?;
        Ok(exchange)
    }

    /// InOut request returning the reply body converted to `T`.
    pub async fn request_body<B, T>(&self, uri: &str, body: B) -> Result<T>
    where
        B: Any + Send + Sync,
        T: Any + Send + Clone,
    {
        let exchange = self
            .request(uri, |exchange| exchange.in_message_mut().set_body(body))
            .await?;
        result_body(&exchange)
    }

    pub async fn request_body_and_header<B, T>(
        &self,
        uri: &str,
        body: B,
        header: &str,
        value: impl Into<Value>,
    ) -> Result<T>
    where
        B: Any + Send + Sync,
        T: Any + Send + Clone,
    {
        let value = value.into();
        let exchange = self
            .request(uri, |exchange| {
                let message = exchange.in_message_mut();
                message.set_body(body);
                message.set_header(header, value);
            })
            .await?;
        result_body(&exchange)
    }

    /// Like [`request_body`](Self::request_body) but fails with
    /// `ExchangeTimedOut` when no reply arrives within `timeout`.
    pub async fn request_body_timeout<B, T>(&self, uri: &str, body: B, timeout: Duration) -> Result<T>
    where
        B: Any + Send + Sync,
        T: Any + Send + Clone,
    {
        let endpoint = self.endpoint(uri)?;
        let mut exchange = endpoint.create_exchange_with_pattern(ExchangePattern::InOut);
        exchange.in_message_mut().set_body(body);
        let exchange_id = exchange.id().to_string();

        // dropping the send on timeout hands its producer back to the cache
        let sent = tokio::time::timeout(timeout, async {
            self.cache.send(&endpoint, &mut exchange).await
        })
        .await;
        match sent {
            Ok(result) => result?,
            Err(_) => {
                debug!(exchange_id = %exchange_id, uri = %uri, "Request timed out");
                return Err(RoutingError::ExchangeTimedOut {
                    exchange_id,
                    timeout,
                });
            }
        }
        check_exchange(&exchange)?;
        result_body(&exchange)
    }
}

// ============================================================================
// ConsumerTemplate
// ============================================================================

/// Pulls exchanges from endpoints. Polling consumers are created on first use
/// and kept until the template stops.
pub struct ConsumerTemplate {
    resolver: Arc<dyn EndpointResolver>,
    consumers: DashMap<String, Arc<dyn PollingConsumer>>,
    state: ServiceState,
}

impl ConsumerTemplate {
    pub fn new(resolver: Arc<dyn EndpointResolver>) -> Self {
        Self {
            resolver,
            consumers: DashMap::new(),
            state: ServiceState::new(),
        }
    }

    /// Started polling consumer for the endpoint. Endpoints without native
    /// polling support are adapted with an [`EventDrivenPollingConsumer`].
    pub async fn polling_consumer(&self, uri: &str) -> Result<Arc<dyn PollingConsumer>> {
        if let Some(existing) = self.consumers.get(uri) {
            return Ok(existing.clone());
        }
        let endpoint = self.resolver.resolve_endpoint(uri)?;
        let consumer = match endpoint.clone().create_polling_consumer() {
            Ok(consumer) => consumer,
            Err(_) => Arc::new(EventDrivenPollingConsumer::new(endpoint)) as Arc<dyn PollingConsumer>,
        };
        consumer.start().await?;

        let winner = self
            .consumers
            .entry(uri.to_string())
            .or_insert_with(|| consumer.clone())
            .clone();
        if !Arc::ptr_eq(&winner, &consumer) {
            consumer.stop().await?;
        }
        Ok(winner)
    }

    pub async fn receive(&self, uri: &str) -> Result<Option<Exchange>> {
        Ok(self.polling_consumer(uri).await?.receive().await)
    }

    pub async fn receive_no_wait(&self, uri: &str) -> Result<Option<Exchange>> {
        Ok(self.polling_consumer(uri).await?.receive_no_wait())
    }

    pub async fn receive_timeout(&self, uri: &str, timeout: Duration) -> Result<Option<Exchange>> {
        Ok(self.polling_consumer(uri).await?.receive_timeout(timeout).await)
    }

    /// Body of the next exchange within `timeout`, `None` on timeout.
    pub async fn receive_body<T: Any + Send + Clone>(
        &self,
        uri: &str,
        timeout: Duration,
    ) -> Result<Option<T>> {
        match self.receive_timeout(uri, timeout).await? {
            Some(exchange) => {
                check_exchange(&exchange)?;
                result_body(&exchange).map(Some)
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl Service for ConsumerTemplate {
    fn service_state(&self) -> &ServiceState {
        &self.state
    }

    async fn do_stop(&self) -> Result<()> {
        let consumers: Vec<_> = self.consumers.iter().map(|e| e.value().clone()).collect();
        self.consumers.clear();
        crate::service::stop_all(consumers).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{DirectEndpoint, ProcessorEndpoint};
    use crate::processor::{processor_fn, spawn_processor_fn, AsyncProcessor};
    use sy_common::CacheConfig;

    struct MapResolver {
        endpoints: DashMap<String, Arc<dyn Endpoint>>,
    }

    impl EndpointResolver for MapResolver {
        fn resolve_endpoint(&self, uri: &str) -> Result<Arc<dyn Endpoint>> {
            self.endpoints
                .get(uri)
                .map(|e| e.clone())
                .ok_or_else(|| RoutingError::no_such_endpoint(uri))
        }
    }

    fn resolver(endpoints: Vec<Arc<dyn Endpoint>>) -> Arc<MapResolver> {
        let map = DashMap::new();
        for endpoint in endpoints {
            map.insert(endpoint.uri().to_string(), endpoint);
        }
        Arc::new(MapResolver { endpoints: map })
    }

    fn upper() -> Arc<dyn AsyncProcessor> {
        processor_fn(|exchange| {
            let body = exchange.mandatory_in_body::<String>()?;
            let suffix = exchange
                .in_message()
                .header_str("suffix")
                .unwrap_or_default()
                .to_string();
            if let Some(out) = exchange.out_message_mut() {
                out.set_body(format!("{}{}", body.to_uppercase(), suffix));
            }
            Ok(())
        })
    }

    async fn producer(endpoints: Vec<Arc<dyn Endpoint>>) -> ProducerTemplate {
        let cache = Arc::new(ProducerCache::new(CacheConfig::default()));
        cache.start().await.unwrap();
        ProducerTemplate::new(resolver(endpoints), cache)
    }

    #[tokio::test]
    async fn test_request_body_returns_reply() {
        let template = producer(vec![Arc::new(ProcessorEndpoint::new("proc:upper", upper()))]).await;

        let reply: String = template.request_body("proc:upper", "hello".to_string()).await.unwrap();
        assert_eq!(reply, "HELLO");

        let reply: String = template
            .request_body_and_header("proc:upper", "hi".to_string(), "suffix", "!")
            .await
            .unwrap();
        assert_eq!(reply, "HI!");
    }

    #[tokio::test]
    async fn test_failure_becomes_execution_error() {
        let failing = processor_fn(|exchange| {
            exchange.set_exception(RoutingError::processing("rejected"));
            Ok(())
        });
        let template = producer(vec![Arc::new(ProcessorEndpoint::new("proc:fail", failing))]).await;

        let err = template.send_body("proc:fail", 1i64).await.unwrap_err();
        assert!(matches!(err, RoutingError::Execution { .. }));
        assert_eq!(err.as_label(), "execution");
    }

    #[tokio::test]
    async fn test_unknown_endpoint_is_structural() {
        let template = producer(Vec::new()).await;
        let err = template.send_body("proc:missing", 1i64).await.unwrap_err();
        assert!(err.is_structural());
    }

    #[tokio::test]
    async fn test_request_times_out() {
        let slow = spawn_processor_fn(|exchange: Exchange| async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            exchange
        });
        let template = producer(vec![Arc::new(ProcessorEndpoint::new("proc:slow", slow))]).await;

        let err = template
            .request_body_timeout::<_, String>("proc:slow", "x".to_string(), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, RoutingError::ExchangeTimedOut { .. }));
    }

    #[tokio::test]
    async fn test_timed_out_request_leaves_producer_evictable() {
        let slow = spawn_processor_fn(|exchange: Exchange| async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            exchange
        });
        let endpoints: Vec<Arc<dyn Endpoint>> = vec![
            Arc::new(ProcessorEndpoint::new("proc:slow", slow)),
            Arc::new(ProcessorEndpoint::new("proc:upper", upper())),
        ];
        let cache = Arc::new(ProducerCache::new(CacheConfig {
            idle_timeout_ms: 1,
            purge_interval_ms: 60_000,
            ..CacheConfig::default()
        }));
        cache.start().await.unwrap();
        let template = ProducerTemplate::new(resolver(endpoints), cache.clone());

        let err = template
            .request_body_timeout::<_, String>("proc:slow", "x".to_string(), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, RoutingError::ExchangeTimedOut { .. }));
        let reply: String = template.request_body("proc:upper", "y".to_string()).await.unwrap();
        assert_eq!(reply, "Y");
        assert_eq!(cache.size(), 2);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.purge().await, 2);
        assert_eq!(cache.size(), 0);
        cache.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_consumer_template_receives_sent_body() {
        let direct: Arc<dyn Endpoint> = Arc::new(DirectEndpoint::new("direct:inbox", None));
        let endpoints = resolver(vec![direct]);
        let consumer = ConsumerTemplate::new(endpoints.clone());
        consumer.start().await.unwrap();

        assert!(consumer.receive_no_wait("direct:inbox").await.unwrap().is_none());

        let cache = Arc::new(ProducerCache::new(CacheConfig::default()));
        cache.start().await.unwrap();
        let producer = ProducerTemplate::new(endpoints, cache);
        producer.send_body("direct:inbox", "parcel".to_string()).await.unwrap();

        let body: Option<String> = consumer
            .receive_body("direct:inbox", Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(body.as_deref(), Some("parcel"));

        let none: Option<String> = consumer
            .receive_body("direct:inbox", Duration::from_millis(10))
            .await
            .unwrap();
        assert!(none.is_none());
        consumer.stop().await.unwrap();
    }
}
