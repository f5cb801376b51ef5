//! RoutingContext - registries, routes and ordered shutdown
//!
//! The context owns the component, endpoint and language registries, type
//! converters, intercept strategies, the error handler factory, the producer cache and every
//! route. Starting it starts the routes in startup order; stopping it runs a
//! graceful shutdown that stops `ShutdownRoute::Default` routes before deferred
//! ones and waits (bounded) for in-flight exchanges to drain.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use sy_common::logging::init_tracing;
use sy_common::{
    AggregateError, ExchangeContext, ExchangePropertyRegistry, Result, RouterConfig,
    RoutingError, ScheduledPollConfig, TypeConverterRegistry,
};

use crate::channel::{ChannelContext, ErrorHandlerFactory, InterceptStrategy, Tracer};
use crate::endpoint::{scheme_of, Component, DirectComponent, Endpoint, EndpointResolver};
use crate::error_handler::RedeliveryErrorHandlerFactory;
use crate::language::{HeaderLanguage, Language, PropertyLanguage};
use crate::lifecycle::{Housekeeping, LifecycleManager};
use crate::metrics;
use crate::producer_cache::ProducerCache;
use crate::route::{Route, RouteNode};
use crate::service::{Service, ServiceState};
use crate::template::{ConsumerTemplate, ProducerTemplate};

const INFLIGHT_REPORT_INTERVAL: Duration = Duration::from_secs(10);
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// The part of the context exchanges and endpoints hold on to.
struct SharedContext {
    name: String,
    converters: TypeConverterRegistry,
    poll: ScheduledPollConfig,
}

impl ExchangeContext for SharedContext {
    fn name(&self) -> &str {
        &self.name
    }

    fn type_converter(&self) -> &TypeConverterRegistry {
        &self.converters
    }

    fn poll_config(&self) -> ScheduledPollConfig {
        self.poll.clone()
    }
}

type RouteList = Arc<RwLock<Vec<Arc<Route>>>>;

struct InflightReporter {
    routes: RouteList,
}

#[async_trait]
impl Housekeeping for InflightReporter {
    fn name(&self) -> &str {
        "inflight-reporter"
    }

    async fn run(&self) {
        let routes = self.routes.read().clone();
        for route in routes {
            let inflight = route.inflight();
            metrics::inflight(route.id(), inflight);
            if inflight > 0 {
                debug!(route_id = %route.id(), inflight, "Inflight exchanges");
            }
        }
    }
}

pub struct RoutingContext {
    shared: Arc<SharedContext>,
    config: RouterConfig,
    components: DashMap<String, Arc<dyn Component>>,
    endpoints: DashMap<String, Arc<dyn Endpoint>>,
    languages: DashMap<String, Arc<dyn Language>>,
    properties: Arc<ExchangePropertyRegistry>,
    intercept_strategies: RwLock<Vec<Arc<dyn InterceptStrategy>>>,
    error_handler_factory: RwLock<Option<Arc<dyn ErrorHandlerFactory>>>,
    routes: RouteList,
    producer_cache: Arc<ProducerCache>,
    lifecycle: Mutex<Option<LifecycleManager>>,
    state: ServiceState,
}

impl RoutingContext {
    pub fn new(config: RouterConfig) -> Arc<Self> {
        let context = Self {
            shared: Arc::new(SharedContext {
                name: config.name.clone(),
                converters: TypeConverterRegistry::with_defaults(),
                poll: config.poll.clone(),
            }),
            components: DashMap::new(),
            endpoints: DashMap::new(),
            languages: DashMap::new(),
            properties: Arc::new(ExchangePropertyRegistry::with_defaults()),
            intercept_strategies: RwLock::new(Vec::new()),
            error_handler_factory: RwLock::new(None),
            routes: Arc::new(RwLock::new(Vec::new())),
            producer_cache: Arc::new(ProducerCache::new(config.cache.clone())),
            lifecycle: Mutex::new(None),
            state: ServiceState::new(),
            config,
        };
        context.add_component("direct", Arc::new(DirectComponent));
        context.add_language("header", Arc::new(HeaderLanguage));
        context.add_language("exchangeProperty", Arc::new(PropertyLanguage));
        if context.config.redelivery.maximum_redeliveries != 0 {
            context.set_error_handler_factory(Arc::new(RedeliveryErrorHandlerFactory::new(
                context.config.redelivery.clone(),
            )));
        }
        Arc::new(context)
    }

    /// Context configured from `SWITCHYARD_*` environment variables, with the
    /// global tracing subscriber installed to match.
    pub fn from_env() -> Arc<Self> {
        let config = RouterConfig::from_env();
        init_tracing(config.log_json);
        Self::new(config)
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn type_converter(&self) -> &TypeConverterRegistry {
        &self.shared.converters
    }

    pub fn property_registry(&self) -> &ExchangePropertyRegistry {
        self.properties.as_ref()
    }

    /// Handle to hand to endpoints and exchanges
    pub fn exchange_context(&self) -> Arc<dyn ExchangeContext> {
        self.shared.clone()
    }

    pub fn producer_cache(&self) -> Arc<ProducerCache> {
        self.producer_cache.clone()
    }

    // ------------------------------------------------------------------
    // Components and endpoints
    // ------------------------------------------------------------------

    pub fn add_component(&self, scheme: impl Into<String>, component: Arc<dyn Component>) {
        let scheme = scheme.into();
        debug!(scheme = %scheme, "Component registered");
        self.components.insert(scheme, component);
    }

    /// Component for a scheme, or for the scheme of a full URI.
    pub fn resolve_component(&self, scheme_or_uri: &str) -> Result<Arc<dyn Component>> {
        let scheme = scheme_of(scheme_or_uri).unwrap_or(scheme_or_uri);
        self.components
            .get(scheme)
            .map(|c| c.clone())
            .ok_or_else(|| RoutingError::NoSuchComponent {
                scheme: scheme.to_string(),
            })
    }

    /// Registers an endpoint instance under its URI, replacing any previous one.
    pub fn add_endpoint(&self, endpoint: Arc<dyn Endpoint>) {
        self.endpoints.insert(endpoint.uri().to_string(), endpoint);
    }

    pub fn add_language(&self, name: impl Into<String>, language: Arc<dyn Language>) {
        self.languages.insert(name.into(), language);
    }

    pub fn resolve_language(&self, name: &str) -> Result<Arc<dyn Language>> {
        self.languages
            .get(name)
            .map(|l| l.clone())
            .ok_or_else(|| RoutingError::NoSuchLanguage {
                language: name.to_string(),
            })
    }

    pub fn has_endpoint(&self, uri: &str) -> bool {
        self.endpoints.contains_key(uri)
    }

    pub fn endpoints(&self) -> Vec<Arc<dyn Endpoint>> {
        self.endpoints.iter().map(|e| e.value().clone()).collect()
    }

    // ------------------------------------------------------------------
    // Interception
    // ------------------------------------------------------------------

    pub fn add_intercept_strategy(&self, strategy: Arc<dyn InterceptStrategy>) {
        self.intercept_strategies.write().push(strategy);
    }

    /// Adds a [`Tracer`] to the intercept strategies of routes added afterwards.
    /// Properties the registry marks internal are left out of its output.
    pub fn enable_tracing(&self, verbose: bool) {
        let tracer = if verbose { Tracer::verbose() } else { Tracer::new() };
        self.add_intercept_strategy(Arc::new(tracer.with_registry(self.properties.clone())));
    }

    pub fn set_error_handler_factory(&self, factory: Arc<dyn ErrorHandlerFactory>) {
        *self.error_handler_factory.write() = Some(factory);
    }

    // ------------------------------------------------------------------
    // Templates
    // ------------------------------------------------------------------

    pub fn create_producer_template(self: &Arc<Self>) -> ProducerTemplate {
        ProducerTemplate::new(self.clone(), self.producer_cache.clone())
    }

    pub fn create_consumer_template(self: &Arc<Self>) -> ConsumerTemplate {
        ConsumerTemplate::new(self.clone())
    }

    // ------------------------------------------------------------------
    // Routes
    // ------------------------------------------------------------------

    /// Builds a route consuming from `from_uri`. It is started at once when
    /// the context is already running.
    pub async fn add_route(
        &self,
        id: impl Into<String>,
        from_uri: &str,
        nodes: Vec<RouteNode>,
    ) -> Result<Arc<Route>> {
        let id = id.into();
        if self.route(&id).is_some() {
            return Err(RoutingError::failed_to_create_route(&id, "duplicate route id"));
        }
        let endpoint = self.resolve_endpoint(from_uri)?;
        let route = Arc::new(Route::new(id.clone(), endpoint, nodes, self)?);
        self.add_route_instance(route.clone()).await?;
        Ok(route)
    }

    /// Adds an already built route.
    pub async fn add_route_instance(&self, route: Arc<Route>) -> Result<()> {
        {
            let mut routes = self.routes.write();
            if routes.iter().any(|r| r.id() == route.id()) {
                return Err(RoutingError::failed_to_create_route(route.id(), "duplicate route id"));
            }
            routes.push(route.clone());
        }
        info!(route_id = %route.id(), endpoint = %route.endpoint().uri(), "Route added");
        if self.state.is_started() {
            route.start().await?;
        }
        Ok(())
    }

    pub fn route(&self, id: &str) -> Option<Arc<Route>> {
        self.routes.read().iter().find(|r| r.id() == id).cloned()
    }

    pub fn routes(&self) -> Vec<Arc<Route>> {
        self.routes.read().clone()
    }

    fn require_route(&self, id: &str) -> Result<Arc<Route>> {
        self.route(id)
            .ok_or_else(|| RoutingError::illegal_state(format!("No route with id: {id}")))
    }

    pub async fn start_route(&self, id: &str) -> Result<()> {
        self.require_route(id)?.start().await
    }

    pub async fn stop_route(&self, id: &str) -> Result<()> {
        let route = self.require_route(id)?;
        self.shutdown_routes(&[route], self.config.shutdown_timeout()).await
    }

    pub async fn suspend_route(&self, id: &str) -> Result<()> {
        self.require_route(id)?.suspend().await
    }

    pub async fn resume_route(&self, id: &str) -> Result<()> {
        self.require_route(id)?.resume().await
    }

    /// Removes a stopped route. Returns false when it is still running.
    pub fn remove_route(&self, id: &str) -> bool {
        let mut routes = self.routes.write();
        match routes.iter().position(|r| r.id() == id) {
            Some(index) if !routes[index].is_run_allowed() => {
                routes.remove(index);
                info!(route_id = %id, "Route removed");
                true
            }
            _ => false,
        }
    }

    /// Total inflight exchanges across routes
    pub fn inflight(&self) -> usize {
        self.routes.read().iter().map(|r| r.inflight()).sum()
    }

    fn routes_in_startup_order(&self) -> Vec<Arc<Route>> {
        let mut routes = self.routes();
        routes.sort_by_key(|r| r.startup_order());
        routes
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Stops the given routes gracefully: inputs first, then a bounded wait for
    /// pending exchanges, then the routes themselves.
    async fn shutdown_routes(&self, routes: &[Arc<Route>], timeout: Duration) -> Result<()> {
        if routes.is_empty() {
            return Ok(());
        }
        let deadline = Instant::now() + timeout;

        for route in routes {
            route.defer_shutdown();
            if route.is_started() {
                if let Err(e) = route.suspend().await {
                    warn!(route_id = %route.id(), error = %e, "Failed to suspend route input");
                }
            }
        }

        loop {
            let pending: usize = routes.iter().map(|r| r.pending_exchanges()).sum();
            if pending == 0 {
                break;
            }
            if Instant::now() >= deadline {
                warn!(
                    pending,
                    timeout_ms = timeout.as_millis() as u64,
                    "Timeout waiting for inflight exchanges, forcing shutdown"
                );
                break;
            }
            debug!(pending, "Waiting for inflight exchanges to complete");
            tokio::time::sleep(SHUTDOWN_POLL_INTERVAL).await;
        }

        let mut errors = Vec::new();
        for route in routes {
            route.prepare_shutdown();
            if let Err(e) = route.stop().await {
                warn!(route_id = %route.id(), error = %e, "Failed to stop route");
                errors.push(e);
            }
        }
        match AggregateError::from_causes(errors) {
            Some(agg) => Err(RoutingError::Aggregate(agg)),
            None => Ok(()),
        }
    }
}

impl ExchangeContext for RoutingContext {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn type_converter(&self) -> &TypeConverterRegistry {
        &self.shared.converters
    }

    fn poll_config(&self) -> ScheduledPollConfig {
        self.config.poll.clone()
    }
}

impl ChannelContext for RoutingContext {
    fn intercept_strategies(&self) -> Vec<Arc<dyn InterceptStrategy>> {
        self.intercept_strategies.read().clone()
    }

    fn error_handler_factory(&self) -> Option<Arc<dyn ErrorHandlerFactory>> {
        self.error_handler_factory.read().clone()
    }
}

impl EndpointResolver for RoutingContext {
    /// Registered endpoint, else one created by the component for the URI's
    /// scheme. Singleton endpoints are registered for reuse.
    fn resolve_endpoint(&self, uri: &str) -> Result<Arc<dyn Endpoint>> {
        if let Some(endpoint) = self.endpoints.get(uri) {
            return Ok(endpoint.clone());
        }
        let scheme = scheme_of(uri).ok_or_else(|| RoutingError::no_such_endpoint(uri))?;
        let component = self.resolve_component(scheme)?;
        let endpoint = component.create_endpoint(uri, self.exchange_context())?;
        if !endpoint.is_singleton() {
            return Ok(endpoint);
        }
        let registered = self
            .endpoints
            .entry(uri.to_string())
            .or_insert(endpoint)
            .clone();
        debug!(uri = %uri, "Endpoint registered");
        Ok(registered)
    }
}

#[async_trait]
impl Service for RoutingContext {
    fn service_state(&self) -> &ServiceState {
        &self.state
    }

    async fn do_start(&self) -> Result<()> {
        info!(name = %self.name(), "Routing context starting");
        self.producer_cache.start().await?;

        for route in self.routes_in_startup_order() {
            route.start().await?;
        }

        let manager = LifecycleManager::new();
        manager.schedule(
            Arc::new(InflightReporter {
                routes: self.routes.clone(),
            }),
            INFLIGHT_REPORT_INTERVAL,
        );
        *self.lifecycle.lock() = Some(manager);

        info!(name = %self.name(), routes = self.routes.read().len(), "Routing context started");
        Ok(())
    }

    async fn do_stop(&self) -> Result<()> {
        info!(name = %self.name(), "Routing context shutting down");
        let manager = self.lifecycle.lock().take();
        if let Some(manager) = manager {
            manager.shutdown().await;
        }

        let mut routes = self.routes_in_startup_order();
        routes.reverse();
        let (deferred, default): (Vec<_>, Vec<_>) = routes
            .into_iter()
            .partition(|r| r.shutdown_route().is_deferred());

        let timeout = self.config.shutdown_timeout();
        let started = Instant::now();
        let mut errors = Vec::new();

        if let Err(e) = self.shutdown_routes(&default, timeout).await {
            errors.push(e);
        }
        let remaining = timeout.saturating_sub(started.elapsed());
        if let Err(e) = self.shutdown_routes(&deferred, remaining).await {
            errors.push(e);
        }
        if let Err(e) = self.producer_cache.stop().await {
            errors.push(e);
        }

        info!(
            name = %self.name(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Routing context stopped"
        );
        match AggregateError::from_causes(errors) {
            Some(agg) => Err(RoutingError::Aggregate(agg)),
            None => Ok(()),
        }
    }
}
