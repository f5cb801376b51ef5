//! Channels - the wiring between route nodes
//!
//! A channel wraps one node's processor with the intercept strategies of the
//! routing context and of the channel itself, then with the error handler. The
//! route keeps channels linked through their next processor so tooling can walk
//! the graph with [`Navigate`].

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace};

use sy_common::{Exchange, ExchangePropertyRegistry, Result};

use crate::processor::{AsyncCallback, AsyncProcessor};

/// Describes the node a channel was built for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessorDefinition {
    pub id: String,
    pub label: String,
    /// Short kind name, e.g. `to`, `process`, `multicast`
    pub kind: String,
}

impl ProcessorDefinition {
    pub fn new(id: impl Into<String>, kind: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            label: label.into(),
        }
    }
}

/// Wraps a node's processor. Returning `target` unchanged passes it through; a
/// wrapper may also complete without calling `target` at all.
pub trait InterceptStrategy: Send + Sync {
    fn wrap_processor_in_interceptors(
        &self,
        definition: &ProcessorDefinition,
        target: Arc<dyn AsyncProcessor>,
        next: Option<Arc<dyn AsyncProcessor>>,
    ) -> Result<Arc<dyn AsyncProcessor>>;
}

pub trait ErrorHandlerFactory: Send + Sync {
    fn create_error_handler(
        &self,
        definition: &ProcessorDefinition,
        output: Arc<dyn AsyncProcessor>,
    ) -> Result<Arc<dyn AsyncProcessor>>;
}

/// What a channel needs from its routing context during initialization.
pub trait ChannelContext: Send + Sync {
    fn intercept_strategies(&self) -> Vec<Arc<dyn InterceptStrategy>>;

    fn error_handler_factory(&self) -> Option<Arc<dyn ErrorHandlerFactory>>;
}

/// Read-only view of the children of a graph node. There is no cursor:
/// `next` always returns the current children.
pub trait Navigate<T> {
    fn next(&self) -> Vec<T>;

    fn has_next(&self) -> bool {
        !self.next().is_empty()
    }
}

pub trait Channel: AsyncProcessor {
    fn definition(&self) -> Option<ProcessorDefinition>;

    /// The unwrapped processor of the node
    fn target(&self) -> Arc<dyn AsyncProcessor>;

    /// The processor after intercept strategies were applied
    fn output(&self) -> Arc<dyn AsyncProcessor>;

    fn error_handler(&self) -> Option<Arc<dyn AsyncProcessor>>;

    fn next_channel(&self) -> Option<Arc<dyn Channel>>;

    fn set_next_channel(&self, next: Arc<dyn Channel>);

    fn add_intercept_strategy(&self, strategy: Arc<dyn InterceptStrategy>);

    fn init_channel(
        &self,
        definition: &ProcessorDefinition,
        context: &dyn ChannelContext,
    ) -> Result<()>;

    fn as_processor(self: Arc<Self>) -> Arc<dyn AsyncProcessor>;
}

impl Navigate<Arc<dyn Channel>> for dyn Channel {
    fn next(&self) -> Vec<Arc<dyn Channel>> {
        self.next_channel().into_iter().collect()
    }
}

/// Collects every channel reachable from `start`, each once, in visit order.
pub fn walk(start: Vec<Arc<dyn Channel>>) -> Vec<Arc<dyn Channel>> {
    let mut seen = HashSet::new();
    let mut visited = Vec::new();
    let mut pending: Vec<Arc<dyn Channel>> = start.into_iter().rev().collect();

    while let Some(channel) = pending.pop() {
        if !seen.insert(Arc::as_ptr(&channel) as *const () as usize) {
            continue;
        }
        for child in channel.next().into_iter().rev() {
            pending.push(child);
        }
        visited.push(channel);
    }
    visited
}

// ============================================================================
// DefaultChannel
// ============================================================================

pub struct DefaultChannel {
    target: Arc<dyn AsyncProcessor>,
    definition: RwLock<Option<ProcessorDefinition>>,
    strategies: RwLock<Vec<Arc<dyn InterceptStrategy>>>,
    output: RwLock<Option<Arc<dyn AsyncProcessor>>>,
    error_handler: RwLock<Option<Arc<dyn AsyncProcessor>>>,
    next: RwLock<Option<Arc<dyn Channel>>>,
}

impl DefaultChannel {
    pub fn new(target: Arc<dyn AsyncProcessor>) -> Self {
        Self {
            target,
            definition: RwLock::new(None),
            strategies: RwLock::new(Vec::new()),
            output: RwLock::new(None),
            error_handler: RwLock::new(None),
            next: RwLock::new(None),
        }
    }

    pub fn intercept_strategies(&self) -> Vec<Arc<dyn InterceptStrategy>> {
        self.strategies.read().clone()
    }

    fn effective(&self) -> Arc<dyn AsyncProcessor> {
        if let Some(handler) = self.error_handler.read().clone() {
            return handler;
        }
        self.output()
    }
}

impl AsyncProcessor for DefaultChannel {
    fn process_async(&self, exchange: Exchange, callback: AsyncCallback) -> bool {
        if exchange.is_route_stop() {
            trace!(exchange_id = %exchange.id(), "Route stopped, skipping channel");
            callback.on_data_received(exchange, true);
            return true;
        }
        self.effective().process_async(exchange, callback)
    }
}

impl Channel for DefaultChannel {
    fn definition(&self) -> Option<ProcessorDefinition> {
        self.definition.read().clone()
    }

    fn target(&self) -> Arc<dyn AsyncProcessor> {
        self.target.clone()
    }

    fn output(&self) -> Arc<dyn AsyncProcessor> {
        self.output
            .read()
            .clone()
            .unwrap_or_else(|| self.target.clone())
    }

    fn error_handler(&self) -> Option<Arc<dyn AsyncProcessor>> {
        self.error_handler.read().clone()
    }

    fn next_channel(&self) -> Option<Arc<dyn Channel>> {
        self.next.read().clone()
    }

    fn set_next_channel(&self, next: Arc<dyn Channel>) {
        *self.next.write() = Some(next);
    }

    fn add_intercept_strategy(&self, strategy: Arc<dyn InterceptStrategy>) {
        self.strategies.write().push(strategy);
    }

    fn init_channel(
        &self,
        definition: &ProcessorDefinition,
        context: &dyn ChannelContext,
    ) -> Result<()> {
        let mut strategies = context.intercept_strategies();
        strategies.extend(self.intercept_strategies());

        let next = self.next_channel().map(|channel| channel.as_processor());

        // wrap inside out so the first registered strategy runs outermost
        let mut output = self.target.clone();
        for strategy in strategies.iter().rev() {
            output = strategy.wrap_processor_in_interceptors(definition, output, next.clone())?;
        }

        let handler = match context.error_handler_factory() {
            Some(factory) => Some(factory.create_error_handler(definition, output.clone())?),
            None => None,
        };

        debug!(
            node = %definition.id,
            interceptors = strategies.len(),
            error_handler = handler.is_some(),
            "Channel initialized"
        );
        *self.definition.write() = Some(definition.clone());
        *self.output.write() = Some(output);
        *self.error_handler.write() = handler;
        Ok(())
    }

    fn as_processor(self: Arc<Self>) -> Arc<dyn AsyncProcessor> {
        self
    }
}

// ============================================================================
// Tracer
// ============================================================================

/// Intercept strategy that logs each exchange passing a node.
///
/// With a property registry, the exchange properties are logged on entry,
/// leaving out the ones the registry marks internal.
#[derive(Debug, Clone, Default)]
pub struct Tracer {
    /// Log at info instead of debug
    pub verbose: bool,
    properties: Option<Arc<ExchangePropertyRegistry>>,
}

impl Tracer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn verbose() -> Self {
        Self {
            verbose: true,
            properties: None,
        }
    }

    pub fn with_registry(mut self, registry: Arc<ExchangePropertyRegistry>) -> Self {
        self.properties = Some(registry);
        self
    }
}

/// `name=value` for every property the registry does not mark internal, sorted by name.
fn traced_properties(exchange: &Exchange, registry: &ExchangePropertyRegistry) -> Vec<String> {
    let mut traced: Vec<String> = exchange
        .properties()
        .iter()
        .filter(|(name, _)| !registry.is_internal(name))
        .map(|(name, value)| format!("{name}={value}"))
        .collect();
    traced.sort();
    traced
}

impl InterceptStrategy for Tracer {
    fn wrap_processor_in_interceptors(
        &self,
        definition: &ProcessorDefinition,
        target: Arc<dyn AsyncProcessor>,
        _next: Option<Arc<dyn AsyncProcessor>>,
    ) -> Result<Arc<dyn AsyncProcessor>> {
        Ok(Arc::new(TraceInterceptor {
            node: definition.id.clone(),
            label: definition.label.clone(),
            verbose: self.verbose,
            properties: self.properties.clone(),
            target,
        }))
    }
}

struct TraceInterceptor {
    node: String,
    label: String,
    verbose: bool,
    properties: Option<Arc<ExchangePropertyRegistry>>,
    target: Arc<dyn AsyncProcessor>,
}

impl AsyncProcessor for TraceInterceptor {
    fn process_async(&self, exchange: Exchange, callback: AsyncCallback) -> bool {
        let properties = self
            .properties
            .as_ref()
            .map(|registry| traced_properties(&exchange, registry))
            .unwrap_or_default();
        if self.verbose {
            info!(node = %self.node, label = %self.label, exchange_id = %exchange.id(), ?properties, "Exchange entering node");
        } else {
            debug!(node = %self.node, label = %self.label, exchange_id = %exchange.id(), ?properties, "Exchange entering node");
        }

        let started = Instant::now();
        let node = self.node.clone();
        let verbose = self.verbose;
        self.target.process_async(
            exchange,
            AsyncCallback::new(move |exchange, done_sync| {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                let failed = exchange.is_failed();
                if verbose {
                    info!(node = %node, exchange_id = %exchange.id(), elapsed_ms, failed, done_sync, "Exchange left node");
                } else {
                    debug!(node = %node, exchange_id = %exchange.id(), elapsed_ms, failed, done_sync, "Exchange left node");
                }
                callback.on_data_received(exchange, done_sync);
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::{process_and_wait, processor_fn};
    use parking_lot::Mutex;
    use sy_common::{property, ExchangePattern, RoutingError};

    struct Recording {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl InterceptStrategy for Recording {
        fn wrap_processor_in_interceptors(
            &self,
            _definition: &ProcessorDefinition,
            target: Arc<dyn AsyncProcessor>,
            _next: Option<Arc<dyn AsyncProcessor>>,
        ) -> Result<Arc<dyn AsyncProcessor>> {
            let name = self.name;
            let log = self.log.clone();
            let wrapped = processor_fn(move |_| {
                log.lock().push(name.to_string());
                Ok(())
            });
            Ok(Arc::new(crate::pipeline::Pipeline::new(vec![wrapped, target])))
        }
    }

    struct ShortCircuit;

    impl InterceptStrategy for ShortCircuit {
        fn wrap_processor_in_interceptors(
            &self,
            _definition: &ProcessorDefinition,
            _target: Arc<dyn AsyncProcessor>,
            _next: Option<Arc<dyn AsyncProcessor>>,
        ) -> Result<Arc<dyn AsyncProcessor>> {
            Ok(processor_fn(|exchange| {
                exchange.set_property("intercepted", true);
                Ok(())
            }))
        }
    }

    struct TestContext {
        strategies: Vec<Arc<dyn InterceptStrategy>>,
        factory: Option<Arc<dyn ErrorHandlerFactory>>,
    }

    impl ChannelContext for TestContext {
        fn intercept_strategies(&self) -> Vec<Arc<dyn InterceptStrategy>> {
            self.strategies.clone()
        }

        fn error_handler_factory(&self) -> Option<Arc<dyn ErrorHandlerFactory>> {
            self.factory.clone()
        }
    }

    struct Swallowing {
        output: Arc<dyn AsyncProcessor>,
    }

    impl AsyncProcessor for Swallowing {
        fn process_async(&self, exchange: Exchange, callback: AsyncCallback) -> bool {
            self.output.process_async(
                exchange,
                AsyncCallback::new(move |mut exchange, done_sync| {
                    if exchange.take_exception().is_some() {
                        exchange.set_property("handled", true);
                    }
                    callback.on_data_received(exchange, done_sync);
                }),
            )
        }
    }

    struct SwallowingFactory;

    impl ErrorHandlerFactory for SwallowingFactory {
        fn create_error_handler(
            &self,
            _definition: &ProcessorDefinition,
            output: Arc<dyn AsyncProcessor>,
        ) -> Result<Arc<dyn AsyncProcessor>> {
            Ok(Arc::new(Swallowing { output }))
        }
    }

    fn definition(id: &str) -> ProcessorDefinition {
        ProcessorDefinition::new(id, "process", id)
    }

    #[tokio::test]
    async fn test_context_strategies_run_outermost_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let recording = |name| -> Arc<dyn InterceptStrategy> {
            Arc::new(Recording {
                name,
                log: log.clone(),
            })
        };
        let context = TestContext {
            strategies: vec![recording("context-1"), recording("context-2")],
            factory: None,
        };
        let target_log = log.clone();
        let channel = DefaultChannel::new(processor_fn(move |_| {
            target_log.lock().push("target".to_string());
            Ok(())
        }));
        channel.add_intercept_strategy(recording("channel"));
        channel.init_channel(&definition("node1"), &context).unwrap();

        process_and_wait(&channel, Exchange::new(ExchangePattern::InOnly))
            .await
            .unwrap();

        assert_eq!(
            *log.lock(),
            vec!["context-1", "context-2", "channel", "target"]
        );
    }

    #[tokio::test]
    async fn test_strategy_may_short_circuit() {
        let context = TestContext {
            strategies: vec![Arc::new(ShortCircuit)],
            factory: None,
        };
        let channel = DefaultChannel::new(processor_fn(|exchange| {
            exchange.set_property("target", true);
            Ok(())
        }));
        channel.init_channel(&definition("node1"), &context).unwrap();

        let exchange = process_and_wait(&channel, Exchange::new(ExchangePattern::InOnly))
            .await
            .unwrap();
        assert!(exchange.property_bool("intercepted"));
        assert!(!exchange.property_bool("target"));
    }

    #[tokio::test]
    async fn test_error_handler_wraps_output() {
        let context = TestContext {
            strategies: vec![Arc::new(Tracer::new())],
            factory: Some(Arc::new(SwallowingFactory)),
        };
        let channel = DefaultChannel::new(processor_fn(|exchange| {
            exchange.set_exception(RoutingError::processing("boom"));
            Ok(())
        }));
        channel.init_channel(&definition("node1"), &context).unwrap();
        assert!(channel.error_handler().is_some());

        let exchange = process_and_wait(&channel, Exchange::new(ExchangePattern::InOnly))
            .await
            .unwrap();
        assert!(!exchange.is_failed());
        assert!(exchange.property_bool("handled"));
    }

    #[test]
    fn test_trace_leaves_out_internal_properties() {
        let registry = ExchangePropertyRegistry::with_defaults();
        let mut exchange = Exchange::new(ExchangePattern::InOnly);
        exchange.set_property(property::BATCH_INDEX, 2);
        exchange.set_property(property::ROUTE_STOP, true);
        exchange.set_property("orderId", "A-17");

        assert_eq!(
            traced_properties(&exchange, &registry),
            vec!["SwitchyardBatchIndex=2".to_string(), "orderId=\"A-17\"".to_string()]
        );
    }

    #[tokio::test]
    async fn test_tracer_with_registry_passes_exchange_through() {
        let registry = Arc::new(ExchangePropertyRegistry::with_defaults());
        let context = TestContext {
            strategies: vec![Arc::new(Tracer::verbose().with_registry(registry))],
            factory: None,
        };
        let channel = DefaultChannel::new(processor_fn(|exchange| {
            exchange.set_property("target", true);
            Ok(())
        }));
        channel.init_channel(&definition("traced"), &context).unwrap();

        let mut exchange = Exchange::new(ExchangePattern::InOnly);
        exchange.set_property(property::ROUTE_STOP, false);
        let exchange = process_and_wait(&channel, exchange).await.unwrap();
        assert!(exchange.property_bool("target"));
    }

    #[test]
    fn test_walk_visits_each_channel_once() {
        let noop = || processor_fn(|_| Ok(()));
        let a: Arc<dyn Channel> = Arc::new(DefaultChannel::new(noop()));
        let b: Arc<dyn Channel> = Arc::new(DefaultChannel::new(noop()));
        let c: Arc<dyn Channel> = Arc::new(DefaultChannel::new(noop()));
        a.set_next_channel(b.clone());
        b.set_next_channel(c.clone());
        // cycle back to the start
        c.set_next_channel(a.clone());

        let visited = walk(vec![a.clone()]);
        assert_eq!(visited.len(), 3);
        assert!(a.has_next());
        assert_eq!(b.next().len(), 1);
    }
}
