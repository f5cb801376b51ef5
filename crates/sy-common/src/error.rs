//! Routing error types
//!
//! Processing failures travel on the exchange (`Exchange::set_exception`) so error
//! handlers can inspect them without unwinding. Structural failures (missing
//! endpoints, converters, failed consumer/route creation) are returned at the point
//! of resolution because no exchange exists yet.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RoutingError {
    #[error("No endpoint could be found for: {uri}")]
    NoSuchEndpoint { uri: String },

    #[error("No component found with scheme: {scheme}")]
    NoSuchComponent { scheme: String },

    #[error("No language could be found for: {language}")]
    NoSuchLanguage { language: String },

    #[error("No type converter available to convert from type: {from} to the required type: {to}")]
    NoTypeConversionAvailable { from: String, to: String },

    #[error("Failed to create producer for endpoint: {uri}. Reason: {reason}")]
    FailedToCreateProducer { uri: String, reason: String },

    #[error("Failed to create consumer for endpoint: {uri}. Reason: {reason}")]
    FailedToCreateConsumer { uri: String, reason: String },

    #[error("Failed to create route {route_id}: {reason}")]
    FailedToCreateRoute { route_id: String, reason: String },

    #[error("The OUT message was not received within: {timeout:?} on exchange: {exchange_id}")]
    ExchangeTimedOut { exchange_id: String, timeout: Duration },

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Shutdown in progress")]
    ShutdownInProgress,

    #[error("Processing failed: {message}")]
    Processing { message: String },

    /// Wraps a failure that was carried on an exchange so synchronous callers get
    /// ordinary error semantics.
    #[error("Exception occurred during execution on the exchange: {exchange_id}. Caused by: {cause}")]
    Execution { exchange_id: String, cause: Arc<RoutingError> },

    #[error(transparent)]
    Aggregate(#[from] AggregateError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RoutingError {
    pub fn processing(message: impl Into<String>) -> Self {
        Self::Processing { message: message.into() }
    }

    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalState(message.into())
    }

    pub fn no_such_endpoint(uri: impl Into<String>) -> Self {
        Self::NoSuchEndpoint { uri: uri.into() }
    }

    pub fn no_conversion(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::NoTypeConversionAvailable {
            from: from.into(),
            to: to.into(),
        }
    }

    pub fn failed_to_create_consumer(uri: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::FailedToCreateConsumer {
            uri: uri.into(),
            reason: reason.to_string(),
        }
    }

    pub fn failed_to_create_producer(uri: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::FailedToCreateProducer {
            uri: uri.into(),
            reason: reason.to_string(),
        }
    }

    pub fn failed_to_create_route(route_id: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::FailedToCreateRoute {
            route_id: route_id.into(),
            reason: reason.to_string(),
        }
    }

    /// True for failures raised while resolving or wiring the route graph.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::NoSuchEndpoint { .. }
                | Self::NoSuchComponent { .. }
                | Self::NoSuchLanguage { .. }
                | Self::NoTypeConversionAvailable { .. }
                | Self::FailedToCreateProducer { .. }
                | Self::FailedToCreateConsumer { .. }
                | Self::FailedToCreateRoute { .. }
        )
    }

    /// Short stable label (snake_case) for logs and metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            Self::NoSuchEndpoint { .. } => "no_such_endpoint",
            Self::NoSuchComponent { .. } => "no_such_component",
            Self::NoSuchLanguage { .. } => "no_such_language",
            Self::NoTypeConversionAvailable { .. } => "no_type_conversion",
            Self::FailedToCreateProducer { .. } => "failed_to_create_producer",
            Self::FailedToCreateConsumer { .. } => "failed_to_create_consumer",
            Self::FailedToCreateRoute { .. } => "failed_to_create_route",
            Self::ExchangeTimedOut { .. } => "exchange_timed_out",
            Self::IllegalState(_) => "illegal_state",
            Self::ShutdownInProgress => "shutdown_in_progress",
            Self::Processing { .. } => "processing",
            Self::Execution { .. } => "execution",
            Self::Aggregate(_) => "aggregate",
            Self::Other(_) => "other",
        }
    }
}

/// Several failures raised by one operation (e.g. a unit of work whose
/// synchronizations each failed, or a pool sweep).
///
/// The first cause is the primary one and is what `Display`/`source` report.
#[derive(Debug, Clone)]
pub struct AggregateError {
    causes: Vec<Arc<RoutingError>>,
}

impl AggregateError {
    /// Returns `None` when there is nothing to aggregate.
    pub fn from_causes(causes: Vec<RoutingError>) -> Option<Self> {
        if causes.is_empty() {
            return None;
        }
        Some(Self {
            causes: causes.into_iter().map(Arc::new).collect(),
        })
    }

    pub fn primary(&self) -> &RoutingError {
        &self.causes[0]
    }

    pub fn causes(&self) -> &[Arc<RoutingError>] {
        &self.causes
    }

    pub fn len(&self) -> usize {
        self.causes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.causes.is_empty()
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.causes.len() == 1 {
            write!(f, "{}", self.primary())
        } else {
            write!(
                f,
                "{} errors occurred, first: {}",
                self.causes.len(),
                self.primary()
            )
        }
    }
}

impl std::error::Error for AggregateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.causes[0].as_ref())
    }
}

pub type Result<T> = std::result::Result<T, RoutingError>;
