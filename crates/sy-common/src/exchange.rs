//! Exchange - the unit of work carried through a route
//!
//! An exchange always owns exactly one IN message. OUT and FAULT messages are
//! created on first mutable access, and only when the exchange pattern allows
//! them. Routing failures are recorded on the exchange rather than returned, so
//! error handlers further up the chain can inspect them.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::config::ScheduledPollConfig;
use crate::convert::TypeConverterRegistry;
use crate::error::{Result, RoutingError};
use crate::message::Message;
use crate::pattern::ExchangePattern;
use crate::property;
use crate::unit_of_work::{Synchronization, UnitOfWork};

/// What an exchange needs from the context that owns it.
pub trait ExchangeContext: Send + Sync {
    fn name(&self) -> &str;

    fn type_converter(&self) -> &TypeConverterRegistry;

    /// Scheduling for polling consumers that do not bring their own.
    fn poll_config(&self) -> ScheduledPollConfig {
        ScheduledPollConfig::default()
    }
}

pub struct Exchange {
    id: String,
    pattern: ExchangePattern,
    in_message: Message,
    out_message: Option<Message>,
    fault: Option<Message>,
    properties: HashMap<String, Value>,
    exception: Option<Arc<RoutingError>>,
    context: Option<Arc<dyn ExchangeContext>>,
    unit_of_work: Option<Arc<UnitOfWork>>,
    /// Synchronizations registered before a unit of work was attached
    pending_completions: Vec<Arc<dyn Synchronization>>,
    from_endpoint: Option<String>,
    created_at: DateTime<Utc>,
}

impl Default for Exchange {
    fn default() -> Self {
        Self::new(ExchangePattern::default())
    }
}

impl Exchange {
    pub fn new(pattern: ExchangePattern) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        let mut in_message = Message::new();
        in_message.bind(&id);
        Self {
            id,
            pattern,
            in_message,
            out_message: None,
            fault: None,
            properties: HashMap::new(),
            exception: None,
            context: None,
            unit_of_work: None,
            pending_completions: Vec::new(),
            from_endpoint: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_context(context: Arc<dyn ExchangeContext>, pattern: ExchangePattern) -> Self {
        let mut exchange = Self::new(pattern);
        exchange.context = Some(context);
        exchange
    }

    /// Empty exchange carrying a known id. Completion guards use it to report an
    /// exchange that was lost to a panic or a cancelled task.
    pub fn with_id(id: impl Into<String>, pattern: ExchangePattern) -> Self {
        let mut exchange = Self::new(pattern);
        exchange.id = id.into();
        exchange.in_message.bind(&exchange.id);
        exchange
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pattern(&self) -> ExchangePattern {
        self.pattern
    }

    pub fn set_pattern(&mut self, pattern: ExchangePattern) {
        self.pattern = pattern;
    }

    pub fn context(&self) -> Option<&Arc<dyn ExchangeContext>> {
        self.context.as_ref()
    }

    pub fn set_context(&mut self, context: Arc<dyn ExchangeContext>) {
        self.context = Some(context);
    }

    pub fn from_endpoint(&self) -> Option<&str> {
        self.from_endpoint.as_deref()
    }

    pub fn set_from_endpoint(&mut self, uri: impl Into<String>) {
        self.from_endpoint = Some(uri.into());
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    pub fn in_message(&self) -> &Message {
        &self.in_message
    }

    pub fn in_message_mut(&mut self) -> &mut Message {
        &mut self.in_message
    }

    pub fn set_in(&mut self, mut message: Message) {
        message.bind(&self.id);
        self.in_message = message;
    }

    /// The OUT message if one exists. Never allocates.
    pub fn out_message(&self) -> Option<&Message> {
        self.out_message.as_ref()
    }

    /// The OUT message, created empty on first call when the pattern is out-capable.
    pub fn out_message_mut(&mut self) -> Option<&mut Message> {
        if self.out_message.is_none() && self.pattern.is_out_capable() {
            let mut message = Message::new();
            message.bind(&self.id);
            self.out_message = Some(message);
        }
        self.out_message.as_mut()
    }

    pub fn set_out(&mut self, mut message: Message) {
        message.bind(&self.id);
        self.out_message = Some(message);
    }

    pub fn take_out(&mut self) -> Option<Message> {
        self.out_message.take()
    }

    pub fn has_out(&self) -> bool {
        self.out_message.is_some()
    }

    pub fn fault(&self) -> Option<&Message> {
        self.fault.as_ref()
    }

    /// The FAULT message, created empty on first call when the pattern is fault-capable.
    pub fn fault_mut(&mut self) -> Option<&mut Message> {
        if self.fault.is_none() && self.pattern.is_fault_capable() {
            let mut message = Message::new();
            message.bind(&self.id);
            self.fault = Some(message);
        }
        self.fault.as_mut()
    }

    pub fn set_fault(&mut self, mut message: Message) {
        message.bind(&self.id);
        self.fault = Some(message);
    }

    pub fn clear_fault(&mut self) -> Option<Message> {
        self.fault.take()
    }

    /// OUT when present, IN otherwise.
    pub fn result_message(&self) -> &Message {
        self.out_message.as_ref().unwrap_or(&self.in_message)
    }

    /// Where a processor should write its reply: OUT for out-capable patterns, IN otherwise.
    pub fn result_message_mut(&mut self) -> &mut Message {
        if !self.pattern.is_out_capable() {
            return &mut self.in_message;
        }
        let id = &self.id;
        self.out_message.get_or_insert_with(|| {
            let mut message = Message::new();
            message.bind(id);
            message
        })
    }

    /// Moves OUT into IN so the next step of a pipeline sees the previous reply.
    pub fn prepare_for_next_step(&mut self) {
        if let Some(out) = self.out_message.take() {
            self.in_message = out;
            self.in_message.bind(&self.id);
        }
    }

    // ------------------------------------------------------------------
    // Body conversion
    // ------------------------------------------------------------------

    /// IN body converted to `T` using the context's converters, or a direct
    /// downcast when the exchange has no context.
    pub fn in_body_as<T: Any + Send + Clone>(&self) -> Option<T> {
        let body = self.in_message.body()?;
        match &self.context {
            Some(ctx) => ctx.type_converter().convert_to::<T>(body),
            None => body.downcast_ref::<T>().cloned(),
        }
    }

    pub fn mandatory_in_body<T: Any + Send + Clone>(&self) -> Result<T> {
        let body = self.in_message.body().ok_or_else(|| {
            RoutingError::no_conversion("<empty body>", std::any::type_name::<T>())
        })?;
        match &self.context {
            Some(ctx) => ctx.type_converter().mandatory_convert_to::<T>(body),
            None => body.downcast_ref::<T>().cloned().ok_or_else(|| {
                RoutingError::no_conversion(body.type_name(), std::any::type_name::<T>())
            }),
        }
    }

    // ------------------------------------------------------------------
    // Failure
    // ------------------------------------------------------------------

    pub fn exception(&self) -> Option<&RoutingError> {
        self.exception.as_deref()
    }

    pub fn exception_arc(&self) -> Option<Arc<RoutingError>> {
        self.exception.clone()
    }

    pub fn set_exception(&mut self, error: impl Into<RoutingError>) {
        self.exception = Some(Arc::new(error.into()));
    }

    pub fn set_exception_arc(&mut self, error: Arc<RoutingError>) {
        self.exception = Some(error);
    }

    pub fn take_exception(&mut self) -> Option<Arc<RoutingError>> {
        self.exception.take()
    }

    /// True when a failure cause is set or a fault message is present.
    pub fn is_failed(&self) -> bool {
        self.exception.is_some() || self.fault.is_some()
    }

    pub fn is_rollback_only(&self) -> bool {
        self.property_bool(property::ROLLBACK_ONLY)
    }

    pub fn set_rollback_only(&mut self) {
        self.set_property(property::ROLLBACK_ONLY, true);
    }

    pub fn is_route_stop(&self) -> bool {
        self.property_bool(property::ROUTE_STOP)
    }

    pub fn stop_route(&mut self) {
        self.set_property(property::ROUTE_STOP, true);
    }

    // ------------------------------------------------------------------
    // Properties
    // ------------------------------------------------------------------

    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    pub fn property_bool(&self, name: &str) -> bool {
        self.properties
            .get(name)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn property_i64(&self, name: &str) -> Option<i64> {
        self.properties.get(name).and_then(Value::as_i64)
    }

    pub fn set_property(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.properties.insert(name.into(), value.into());
    }

    pub fn remove_property(&mut self, name: &str) -> Option<Value> {
        self.properties.remove(name)
    }

    pub fn properties(&self) -> &HashMap<String, Value> {
        &self.properties
    }

    pub fn has_properties(&self) -> bool {
        !self.properties.is_empty()
    }

    // ------------------------------------------------------------------
    // Unit of work
    // ------------------------------------------------------------------

    pub fn unit_of_work(&self) -> Option<&Arc<UnitOfWork>> {
        self.unit_of_work.as_ref()
    }

    /// Attaches a unit of work and hands it every synchronization registered so far.
    pub fn set_unit_of_work(&mut self, unit_of_work: Option<Arc<UnitOfWork>>) {
        if let Some(uow) = &unit_of_work {
            for sync in self.pending_completions.drain(..) {
                uow.add_synchronization(sync);
            }
        }
        self.unit_of_work = unit_of_work;
    }

    pub fn add_on_completion(&mut self, sync: Arc<dyn Synchronization>) {
        match &self.unit_of_work {
            Some(uow) => uow.add_synchronization(sync),
            None => self.pending_completions.push(sync),
        }
    }

    pub fn pending_completions(&self) -> usize {
        self.pending_completions.len()
    }

    // ------------------------------------------------------------------
    // Copying
    // ------------------------------------------------------------------

    /// Independent copy with a new id. Properties and headers are duplicated,
    /// bodies are shared. The unit of work is not carried over.
    pub fn copy(&self) -> Exchange {
        let id = uuid::Uuid::new_v4().to_string();
        let rebind = |m: &Message| {
            let mut copy = m.copy();
            copy.bind(&id);
            copy
        };
        Exchange {
            in_message: rebind(&self.in_message),
            out_message: self.out_message.as_ref().map(rebind),
            fault: self.fault.as_ref().map(rebind),
            pattern: self.pattern,
            properties: self.properties.clone(),
            exception: self.exception.clone(),
            context: self.context.clone(),
            unit_of_work: None,
            pending_completions: Vec::new(),
            from_endpoint: self.from_endpoint.clone(),
            created_at: Utc::now(),
            id,
        }
    }

    /// Takes over the state of `other`, keeping this exchange's id.
    pub fn copy_from(&mut self, other: &Exchange) {
        let mut in_message = other.in_message.copy();
        in_message.bind(&self.id);
        self.in_message = in_message;
        self.out_message = other.out_message.as_ref().map(|m| {
            let mut copy = m.copy();
            copy.bind(&self.id);
            copy
        });
        self.fault = other.fault.as_ref().map(|m| {
            let mut copy = m.copy();
            copy.bind(&self.id);
            copy
        });
        self.pattern = other.pattern;
        self.properties = other.properties.clone();
        self.exception = other.exception.clone();
        if other.context.is_some() {
            self.context = other.context.clone();
        }
        if other.unit_of_work.is_some() {
            self.unit_of_work = other.unit_of_work.clone();
        }
    }

    /// Empty exchange bound to the same context, pattern and source endpoint.
    pub fn new_instance(&self) -> Exchange {
        let mut exchange = Exchange::new(self.pattern);
        exchange.context = self.context.clone();
        exchange.from_endpoint = self.from_endpoint.clone();
        exchange
    }
}

impl fmt::Debug for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exchange")
            .field("id", &self.id)
            .field("pattern", &self.pattern)
            .field("in", &self.in_message)
            .field("out", &self.out_message)
            .field("fault", &self.fault)
            .field("properties", &self.properties)
            .field("exception", &self.exception.as_ref().map(|e| e.to_string()))
            .field("from_endpoint", &self.from_endpoint)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_created_only_when_capable() {
        let mut in_only = Exchange::new(ExchangePattern::InOnly);
        assert!(in_only.out_message_mut().is_none());
        assert!(!in_only.has_out());

        let mut in_out = Exchange::new(ExchangePattern::InOut);
        assert!(in_out.out_message().is_none());
        in_out.out_message_mut().unwrap().set_body("reply");
        let id = in_out.out_message().unwrap().message_id().to_string();
        assert_eq!(in_out.out_message_mut().unwrap().message_id(), id);
        assert_eq!(in_out.out_message().unwrap().exchange_id(), Some(in_out.id()));
    }

    #[test]
    fn test_set_out_always_succeeds() {
        let mut exchange = Exchange::new(ExchangePattern::InOnly);
        exchange.set_out(Message::with_body(1i64));
        assert!(exchange.has_out());
        assert!(exchange.fault_mut().is_none());
        exchange.set_fault(Message::new());
        assert!(exchange.is_failed());
    }

    #[test]
    fn test_copy_isolation() {
        let mut original = Exchange::new(ExchangePattern::InOut);
        original.in_message_mut().set_header("h", "one");
        original.set_property("p", 1);

        let mut copy = original.copy();
        assert_ne!(copy.id(), original.id());
        assert_eq!(copy.in_message().exchange_id(), Some(copy.id()));

        copy.in_message_mut().set_header("h", "two");
        copy.set_property("p", 2);
        assert_eq!(original.in_message().header_str("h"), Some("one"));
        assert_eq!(original.property_i64("p"), Some(1));

        original.in_message_mut().set_header("other", true);
        assert!(copy.in_message().header("other").is_none());
    }

    #[test]
    fn test_copy_from_keeps_id() {
        let mut source = Exchange::new(ExchangePattern::InOut);
        source.in_message_mut().set_body(String::from("hello"));
        source.set_exception(RoutingError::processing("boom"));

        let mut target = Exchange::new(ExchangePattern::InOnly);
        let id = target.id().to_string();
        target.copy_from(&source);

        assert_eq!(target.id(), id);
        assert_eq!(target.pattern(), ExchangePattern::InOut);
        assert_eq!(target.in_body_as::<String>(), Some("hello".to_string()));
        assert!(target.is_failed());
    }

    #[test]
    fn test_new_instance_is_empty() {
        let mut exchange = Exchange::new(ExchangePattern::InOut);
        exchange.set_from_endpoint("direct:start");
        exchange.in_message_mut().set_body("x");
        exchange.set_property("p", 1);

        let fresh = exchange.new_instance();
        assert_ne!(fresh.id(), exchange.id());
        assert_eq!(fresh.pattern(), ExchangePattern::InOut);
        assert_eq!(fresh.from_endpoint(), Some("direct:start"));
        assert!(fresh.in_message().body().is_none());
        assert!(!fresh.has_properties());
    }

    #[test]
    fn test_prepare_for_next_step_moves_out_to_in() {
        let mut exchange = Exchange::new(ExchangePattern::InOut);
        exchange.in_message_mut().set_body("request");
        exchange.out_message_mut().unwrap().set_body("reply");
        exchange.prepare_for_next_step();

        assert!(!exchange.has_out());
        assert_eq!(exchange.in_message().body_as::<&str>(), Some(&"reply"));

        // no OUT: IN is left alone
        exchange.prepare_for_next_step();
        assert_eq!(exchange.in_message().body_as::<&str>(), Some(&"reply"));
    }

    #[test]
    fn test_failure_flags() {
        let mut exchange = Exchange::default();
        assert!(!exchange.is_failed());
        exchange.set_exception(RoutingError::processing("x"));
        assert!(exchange.is_failed());
        assert!(exchange.take_exception().is_some());
        assert!(!exchange.is_failed());

        assert!(!exchange.is_rollback_only());
        exchange.set_rollback_only();
        assert!(exchange.is_rollback_only());
    }
}
