//! Message - header map plus an opaque, reference-counted body

use indexmap::IndexMap;
use serde_json::Value;
use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

/// Opaque message payload.
///
/// Cloning a `Body` shares the payload; use [`Body::deep_clone`] when the payload
/// itself must be duplicated.
#[derive(Clone)]
pub struct Body {
    value: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl Body {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            value: Arc::new(value),
            type_name: std::any::type_name::<T>(),
        }
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    pub fn is<T: Any>(&self) -> bool {
        self.value.is::<T>()
    }

    pub fn payload_type_id(&self) -> TypeId {
        Any::type_id(&*self.value)
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn as_any(&self) -> &(dyn Any + Send + Sync) {
        &*self.value
    }

    /// Copies the payload into a fresh allocation. `None` if the payload is not a `T`.
    pub fn deep_clone<T: Any + Send + Sync + Clone>(&self) -> Option<Body> {
        self.downcast_ref::<T>().map(|v| Body::new(v.clone()))
    }

    /// True when both bodies point at the same payload allocation.
    pub fn ptr_eq(&self, other: &Body) -> bool {
        Arc::ptr_eq(&self.value, &other.value)
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(s) = self.downcast_ref::<String>() {
            write!(f, "Body({:?})", s)
        } else if let Some(s) = self.downcast_ref::<&'static str>() {
            write!(f, "Body({:?})", s)
        } else if let Some(v) = self.downcast_ref::<Value>() {
            write!(f, "Body({})", v)
        } else {
            write!(f, "Body(<{}>)", self.type_name)
        }
    }
}

/// A header + body container owned by one exchange at a time.
#[derive(Debug, Clone)]
pub struct Message {
    message_id: String,
    exchange_id: Option<String>,
    headers: IndexMap<String, Value>,
    body: Option<Body>,
}

impl Default for Message {
    fn default() -> Self {
        Self::new()
    }
}

impl Message {
    pub fn new() -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            exchange_id: None,
            headers: IndexMap::new(),
            body: None,
        }
    }

    pub fn with_body<T: Any + Send + Sync>(body: T) -> Self {
        let mut message = Self::new();
        message.set_body(body);
        message
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn set_message_id(&mut self, id: impl Into<String>) {
        self.message_id = id.into();
    }

    /// Id of the exchange currently owning this message
    pub fn exchange_id(&self) -> Option<&str> {
        self.exchange_id.as_deref()
    }

    pub(crate) fn bind(&mut self, exchange_id: &str) {
        self.exchange_id = Some(exchange_id.to_string());
    }

    // ------------------------------------------------------------------
    // Body
    // ------------------------------------------------------------------

    pub fn body(&self) -> Option<&Body> {
        self.body.as_ref()
    }

    pub fn set_body<T: Any + Send + Sync>(&mut self, value: T) {
        self.body = Some(Body::new(value));
    }

    pub fn replace_body(&mut self, body: Option<Body>) -> Option<Body> {
        std::mem::replace(&mut self.body, body)
    }

    pub fn take_body(&mut self) -> Option<Body> {
        self.body.take()
    }

    /// Direct downcast of the body, without type conversion.
    pub fn body_as<T: Any>(&self) -> Option<&T> {
        self.body.as_ref().and_then(|b| b.downcast_ref::<T>())
    }

    // ------------------------------------------------------------------
    // Headers
    // ------------------------------------------------------------------

    pub fn header(&self, name: &str) -> Option<&Value> {
        self.headers.get(name)
    }

    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(Value::as_str)
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.headers.insert(name.into(), value.into());
    }

    pub fn remove_header(&mut self, name: &str) -> Option<Value> {
        self.headers.shift_remove(name)
    }

    pub fn has_headers(&self) -> bool {
        !self.headers.is_empty()
    }

    pub fn headers(&self) -> &IndexMap<String, Value> {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut IndexMap<String, Value> {
        &mut self.headers
    }

    /// Duplicates headers; the body payload stays shared.
    pub fn copy(&self) -> Self {
        self.clone()
    }

    /// Replaces headers and body with the ones of `other`, keeping this message's id.
    pub fn copy_from(&mut self, other: &Message) {
        self.headers = other.headers.clone();
        self.body = other.body.clone();
    }
}
