//! Switchyard routing engine
//!
//! This crate provides the runtime that moves exchanges through routes:
//! - Service: start/stop/suspend/resume lifecycle shared by every component
//! - AsyncProcessor: callback-driven processing with exactly-once completion
//! - Endpoint/Producer/Consumer: transport contracts plus the `direct:` component
//! - ProducerCache and ServicePool: reuse of producers across sends
//! - Channel and Pipeline: the per-node graph with interceptors and error handling
//! - ScheduledPollConsumer: timer-driven polling with backoff and batch support
//! - RoutingContext: registries, routes and graceful two-phase shutdown
//! - Language: named expression languages resolved through the context
//! - ProducerTemplate/ConsumerTemplate: request/reply access from plain code

pub mod channel;
pub mod context;
pub mod endpoint;
pub mod error_handler;
pub mod language;
pub mod lifecycle;
pub mod metrics;
pub mod pipeline;
pub mod polling;
pub mod pool;
pub mod processor;
pub mod producer_cache;
pub mod route;
pub mod scheduled;
pub mod service;
pub mod template;
pub mod timeout_map;
pub mod unit_of_work;

pub use channel::{
    walk, Channel, ChannelContext, DefaultChannel, ErrorHandlerFactory, InterceptStrategy,
    Navigate, ProcessorDefinition, Tracer,
};
pub use context::RoutingContext;
pub use endpoint::{
    scheme_of, Component, Consumer, DirectComponent, DirectEndpoint, Endpoint,
    EndpointResolver, ProcessorEndpoint, Producer, ShutdownAware,
};
pub use error_handler::{RedeliveryErrorHandler, RedeliveryErrorHandlerFactory};
pub use language::{HeaderLanguage, Language, PropertyLanguage};
pub use lifecycle::{Housekeeping, LifecycleManager};
pub use pipeline::{AggregationStrategy, MulticastProcessor, Pipeline, UseLatestAggregationStrategy};
pub use polling::{
    BatchConsumer, DefaultPollStrategy, EventDrivenPollingConsumer, LimitedPollStrategy,
    PollStrategy, PollingConsumer,
};
pub use pool::ServicePool;
pub use processor::{
    process_and_wait, process_in_place, processor_fn, run_async, spawn_processor_fn,
    AsyncCallback, AsyncProcessor, AsyncProcessorConverter, AwaitingProcessor, Processor,
};
pub use producer_cache::{ProducerCache, SendProcessor};
pub use route::{Route, RouteNode};
pub use scheduled::{PollSource, ScheduledPollConsumer};
pub use service::{stop_all, Service, ServiceState, ServiceStatus};
pub use template::{ConsumerTemplate, ProducerTemplate};
pub use timeout_map::{EvictionListener, TimeoutMap};
pub use unit_of_work::UnitOfWorkProcessor;

pub use sy_common::{
    Exchange, ExchangeContext, ExchangePattern, Message, Result, RouterConfig, RoutingError,
    ShutdownRoute, ShutdownRunningTask,
};
