//! Well-known exchange property keys and their registry

use dashmap::DashMap;

pub const BATCH_INDEX: &str = "SwitchyardBatchIndex";
pub const BATCH_SIZE: &str = "SwitchyardBatchSize";
pub const BATCH_COMPLETE: &str = "SwitchyardBatchComplete";
pub const CORRELATION_ID: &str = "SwitchyardCorrelationId";
pub const EXCEPTION_CAUGHT: &str = "SwitchyardExceptionCaught";
pub const FAILURE_HANDLED: &str = "SwitchyardFailureHandled";
pub const REDELIVERED: &str = "SwitchyardRedelivered";
pub const REDELIVERY_COUNTER: &str = "SwitchyardRedeliveryCounter";
pub const REDELIVERY_EXHAUSTED: &str = "SwitchyardRedeliveryExhausted";
pub const ROLLBACK_ONLY: &str = "SwitchyardRollbackOnly";
pub const ROUTE_STOP: &str = "SwitchyardRouteStop";
pub const TO_ENDPOINT: &str = "SwitchyardToEndpoint";
pub const MULTICAST_INDEX: &str = "SwitchyardMulticastIndex";

/// Describes one property key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyDescriptor {
    pub name: String,
    pub description: String,
    /// Internal properties are engine bookkeeping and are hidden from tracing output.
    pub internal: bool,
}

impl PropertyDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>, internal: bool) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            internal,
        }
    }
}

/// Registry of known exchange properties.
///
/// Built once at startup and owned by the routing context; components add their
/// own keys with [`register`](Self::register).
#[derive(Debug)]
pub struct ExchangePropertyRegistry {
    descriptors: DashMap<String, PropertyDescriptor>,
}

impl Default for ExchangePropertyRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl ExchangePropertyRegistry {
    pub fn new() -> Self {
        Self {
            descriptors: DashMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let registry = Self::new();
        let defaults = [
            (BATCH_INDEX, "Zero-based position of the exchange in its poll batch", false),
            (BATCH_SIZE, "Number of exchanges in the poll batch", false),
            (BATCH_COMPLETE, "True on the last exchange of a poll batch", false),
            (CORRELATION_ID, "Id of the exchange this one was derived from", false),
            (EXCEPTION_CAUGHT, "Failure handled by an error handler", true),
            (FAILURE_HANDLED, "Set once an error handler handled the failure", true),
            (REDELIVERED, "True when the exchange is being redelivered", false),
            (REDELIVERY_COUNTER, "Number of redelivery attempts so far", false),
            (REDELIVERY_EXHAUSTED, "Set when redelivery attempts are exhausted", true),
            (ROLLBACK_ONLY, "Marks the exchange for rollback without a failure cause", true),
            (ROUTE_STOP, "Stops routing the exchange any further", true),
            (TO_ENDPOINT, "URI of the last endpoint the exchange was sent to", false),
            (MULTICAST_INDEX, "Index of the multicast branch", false),
        ];
        for (name, description, internal) in defaults {
            registry.register(PropertyDescriptor::new(name, description, internal));
        }
        registry
    }

    pub fn register(&self, descriptor: PropertyDescriptor) {
        self.descriptors.insert(descriptor.name.clone(), descriptor);
    }

    pub fn get(&self, name: &str) -> Option<PropertyDescriptor> {
        self.descriptors.get(name).map(|d| d.value().clone())
    }

    pub fn is_internal(&self, name: &str) -> bool {
        self.descriptors
            .get(name)
            .map(|d| d.internal)
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}
