//! Runtime route: consumer, channels and the processing graph

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use sy_common::{Result, RoutingError, ShutdownRoute, ShutdownRunningTask};

use crate::channel::{Channel, ChannelContext, DefaultChannel, Navigate, ProcessorDefinition};
use crate::endpoint::{Consumer, Endpoint};
use crate::pipeline::Pipeline;
use crate::processor::AsyncProcessor;
use crate::service::{Service, ServiceState};
use crate::unit_of_work::UnitOfWorkProcessor;

/// One processing step of a route.
#[derive(Clone)]
pub struct RouteNode {
    pub definition: ProcessorDefinition,
    pub processor: Arc<dyn AsyncProcessor>,
    /// Abstract nodes describe the graph but get no channel of their own
    pub is_abstract: bool,
}

impl RouteNode {
    pub fn new(definition: ProcessorDefinition, processor: Arc<dyn AsyncProcessor>) -> Self {
        Self {
            definition,
            processor,
            is_abstract: false,
        }
    }

    pub fn abstract_node(definition: ProcessorDefinition, processor: Arc<dyn AsyncProcessor>) -> Self {
        Self {
            definition,
            processor,
            is_abstract: true,
        }
    }
}

impl std::fmt::Debug for RouteNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteNode")
            .field("definition", &self.definition)
            .field("is_abstract", &self.is_abstract)
            .finish()
    }
}

pub struct Route {
    id: String,
    endpoint: Arc<dyn Endpoint>,
    nodes: Vec<RouteNode>,
    channels: Vec<Arc<dyn Channel>>,
    processor: Arc<dyn AsyncProcessor>,
    consumer: Mutex<Option<Arc<dyn Consumer>>>,
    shutdown_route: RwLock<ShutdownRoute>,
    shutdown_running_task: RwLock<ShutdownRunningTask>,
    startup_order: i32,
    inflight: Arc<AtomicUsize>,
    state: ServiceState,
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("id", &self.id)
            .field("nodes", &self.nodes)
            .field("startup_order", &self.startup_order)
            .finish_non_exhaustive()
    }
}

impl Route {
    /// Builds the channels for `nodes`, links them in order and puts a unit of
    /// work boundary in front of the resulting pipeline.
    pub fn new(
        id: impl Into<String>,
        endpoint: Arc<dyn Endpoint>,
        nodes: Vec<RouteNode>,
        context: &dyn ChannelContext,
    ) -> Result<Self> {
        let id = id.into();
        if nodes.iter().all(|node| node.is_abstract) {
            return Err(RoutingError::failed_to_create_route(&id, "route has no processors"));
        }

        let concrete: Vec<&RouteNode> = nodes.iter().filter(|node| !node.is_abstract).collect();
        let channels: Vec<Arc<dyn Channel>> = concrete
            .iter()
            .map(|node| Arc::new(DefaultChannel::new(node.processor.clone())) as Arc<dyn Channel>)
            .collect();
        for pair in channels.windows(2) {
            pair[0].set_next_channel(pair[1].clone());
        }
        for (channel, node) in channels.iter().zip(&concrete) {
            channel
                .init_channel(&node.definition, context)
                .map_err(|e| RoutingError::failed_to_create_route(&id, e))?;
        }

        let steps = channels.iter().map(|c| c.clone().as_processor()).collect();
        let inflight = Arc::new(AtomicUsize::new(0));
        let processor = UnitOfWorkProcessor::new(Arc::new(Pipeline::new(steps)))
            .for_route(id.clone(), inflight.clone());

        debug!(route_id = %id, endpoint = %endpoint.uri(), channels = channels.len(), "Route created");
        Ok(Self {
            id,
            endpoint,
            nodes,
            channels,
            processor: Arc::new(processor),
            consumer: Mutex::new(None),
            shutdown_route: RwLock::new(ShutdownRoute::default()),
            shutdown_running_task: RwLock::new(ShutdownRunningTask::default()),
            startup_order: 0,
            inflight,
            state: ServiceState::new(),
        })
    }

    pub fn with_startup_order(mut self, order: i32) -> Self {
        self.startup_order = order;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn endpoint(&self) -> &Arc<dyn Endpoint> {
        &self.endpoint
    }

    pub fn nodes(&self) -> &[RouteNode] {
        &self.nodes
    }

    pub fn channels(&self) -> &[Arc<dyn Channel>] {
        &self.channels
    }

    /// Entry point the consumer feeds
    pub fn processor(&self) -> Arc<dyn AsyncProcessor> {
        self.processor.clone()
    }

    pub fn consumer(&self) -> Option<Arc<dyn Consumer>> {
        self.consumer.lock().clone()
    }

    pub fn startup_order(&self) -> i32 {
        self.startup_order
    }

    pub fn shutdown_route(&self) -> ShutdownRoute {
        *self.shutdown_route.read()
    }

    pub fn set_shutdown_route(&self, policy: ShutdownRoute) {
        *self.shutdown_route.write() = policy;
    }

    pub fn shutdown_running_task(&self) -> ShutdownRunningTask {
        *self.shutdown_running_task.read()
    }

    pub fn set_shutdown_running_task(&self, task: ShutdownRunningTask) {
        *self.shutdown_running_task.write() = task;
    }

    /// Exchanges inside the route right now
    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Acquire)
    }

    /// Inflight exchanges plus whatever a shutdown-aware consumer still holds.
    pub fn pending_exchanges(&self) -> usize {
        let consumer_pending = self
            .consumer()
            .and_then(|c| c.shutdown_aware().map(|aware| aware.pending_exchanges_size()))
            .unwrap_or(0);
        self.inflight() + consumer_pending
    }

    /// Tells a shutdown-aware consumer how running tasks should finish. Returns
    /// true when the consumer asks to be stopped later.
    pub fn defer_shutdown(&self) -> bool {
        let task = self.shutdown_running_task();
        self.consumer()
            .and_then(|c| c.shutdown_aware().map(|aware| aware.defer_shutdown(task)))
            .unwrap_or(false)
    }

    pub fn prepare_shutdown(&self) {
        if let Some(consumer) = self.consumer() {
            if let Some(aware) = consumer.shutdown_aware() {
                aware.prepare_shutdown();
            }
        }
    }
}

impl Navigate<Arc<dyn Channel>> for Route {
    fn next(&self) -> Vec<Arc<dyn Channel>> {
        self.channels.clone()
    }
}

#[async_trait]
impl Service for Route {
    fn service_state(&self) -> &ServiceState {
        &self.state
    }

    async fn do_start(&self) -> Result<()> {
        let consumer = self.endpoint.clone().create_consumer(self.processor.clone())?;
        consumer.start().await?;
        *self.consumer.lock() = Some(consumer);
        info!(route_id = %self.id, endpoint = %self.endpoint.uri(), "Route started");
        Ok(())
    }

    async fn do_stop(&self) -> Result<()> {
        let consumer = self.consumer.lock().take();
        if let Some(consumer) = consumer {
            consumer.stop().await?;
        }
        info!(route_id = %self.id, "Route stopped");
        Ok(())
    }

    async fn do_suspend(&self) -> Result<()> {
        if let Some(consumer) = self.consumer() {
            consumer.suspend().await?;
        }
        info!(route_id = %self.id, "Route suspended");
        Ok(())
    }

    async fn do_resume(&self) -> Result<()> {
        if let Some(consumer) = self.consumer() {
            consumer.resume().await?;
        }
        info!(route_id = %self.id, "Route resumed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{walk, ErrorHandlerFactory, InterceptStrategy};
    use crate::endpoint::DirectEndpoint;
    use crate::processor::{process_and_wait, processor_fn};
    use sy_common::{Exchange, ExchangePattern};

    struct NoContext;

    impl ChannelContext for NoContext {
        fn intercept_strategies(&self) -> Vec<Arc<dyn InterceptStrategy>> {
            Vec::new()
        }

        fn error_handler_factory(&self) -> Option<Arc<dyn ErrorHandlerFactory>> {
            None
        }
    }

    fn node(id: &str, tag: &'static str) -> RouteNode {
        RouteNode::new(
            ProcessorDefinition::new(id, "process", tag),
            processor_fn(move |exchange| {
                exchange.set_property(tag, true);
                Ok(())
            }),
        )
    }

    fn direct(uri: &str) -> Arc<DirectEndpoint> {
        Arc::new(DirectEndpoint::new(uri, None))
    }

    #[test]
    fn test_route_without_processors_is_rejected() {
        let result = Route::new("empty", direct("direct:empty"), Vec::new(), &NoContext);
        assert!(matches!(result, Err(RoutingError::FailedToCreateRoute { .. })));
    }

    #[tokio::test]
    async fn test_channels_are_linked_in_order() {
        let mut nodes = vec![node("n1", "one"), node("n2", "two"), node("n3", "three")];
        nodes.insert(
            1,
            RouteNode::abstract_node(
                ProcessorDefinition::new("desc", "description", "docs"),
                processor_fn(|_| Ok(())),
            ),
        );
        let route = Route::new("r1", direct("direct:r1"), nodes, &NoContext).unwrap();

        assert_eq!(route.nodes().len(), 4);
        assert_eq!(route.channels().len(), 3);
        assert_eq!(route.next().len(), 3);
        assert_eq!(walk(vec![route.channels()[0].clone()]).len(), 3);

        let exchange = process_and_wait(
            route.processor().as_ref(),
            Exchange::new(ExchangePattern::InOnly),
        )
        .await
        .unwrap();
        assert!(exchange.property_bool("one"));
        assert!(exchange.property_bool("three"));
        assert_eq!(route.inflight(), 0);
    }

    #[tokio::test]
    async fn test_start_attaches_consumer_and_stop_detaches() {
        let endpoint = direct("direct:lifecycle");
        let route = Route::new("r2", endpoint.clone(), vec![node("n1", "one")], &NoContext).unwrap();

        route.start().await.unwrap();
        assert!(route.consumer().is_some());
        assert!(endpoint.has_consumer());

        route.stop().await.unwrap();
        assert!(route.consumer().is_none());
        assert!(!endpoint.has_consumer());
    }

    #[test]
    fn test_shutdown_policy_setters() {
        let route = Route::new("r3", direct("direct:r3"), vec![node("n1", "one")], &NoContext).unwrap();
        assert_eq!(route.shutdown_route(), ShutdownRoute::Default);

        route.set_shutdown_route(ShutdownRoute::Defer);
        route.set_shutdown_running_task(ShutdownRunningTask::CompleteAllTasks);
        assert!(route.shutdown_route().is_deferred());
        assert!(route.shutdown_running_task().completes_all());
        assert_eq!(route.pending_exchanges(), 0);
    }
}
