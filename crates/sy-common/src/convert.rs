//! Type conversion registry
//!
//! Converters are registered explicitly by startup code (`register`,
//! `register_fallback`). There is no discovery.

use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use std::any::{Any, TypeId};
use std::sync::Arc;

use crate::error::{Result, RoutingError};
use crate::message::Body;

type ConvertFn = Arc<dyn Fn(&(dyn Any + Send + Sync)) -> Option<Box<dyn Any + Send>> + Send + Sync>;
type FallbackFn = Arc<dyn Fn(TypeId, &Body) -> Option<Box<dyn Any + Send>> + Send + Sync>;

/// Registry of `From -> To` conversions keyed by type id.
pub struct TypeConverterRegistry {
    converters: DashMap<(TypeId, TypeId), ConvertFn>,
    fallbacks: RwLock<Vec<FallbackFn>>,
}

impl Default for TypeConverterRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl TypeConverterRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            converters: DashMap::new(),
            fallbacks: RwLock::new(Vec::new()),
        }
    }

    /// Registry pre-populated with the core string/bytes/JSON/number conversions
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register(|s: &String| Some(s.clone().into_bytes()));
        registry.register(|b: &Vec<u8>| String::from_utf8(b.clone()).ok());
        registry.register(|s: &&'static str| Some(s.to_string()));
        registry.register(|s: &&'static str| Some(s.as_bytes().to_vec()));
        registry.register(|s: &String| Some(Value::String(s.clone())));
        registry.register(|v: &Value| match v {
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        });
        registry.register(|s: &String| s.trim().parse::<i64>().ok());
        registry.register(|n: &i64| Some(n.to_string()));
        registry.register(|n: &i64| Some(Value::from(*n)));
        registry.register(|v: &Value| v.as_i64());
        registry.register(|s: &String| s.trim().parse::<bool>().ok());
        registry
    }

    /// Registers a converter from `F` to `T`. Replaces an existing one for the same pair.
    pub fn register<F, T, C>(&self, converter: C)
    where
        F: Any + Send + Sync,
        T: Any + Send,
        C: Fn(&F) -> Option<T> + Send + Sync + 'static,
    {
        let f: ConvertFn = Arc::new(move |value: &(dyn Any + Send + Sync)| {
            value
                .downcast_ref::<F>()
                .and_then(|v| converter(v))
                .map(|t| Box::new(t) as Box<dyn Any + Send>)
        });
        self.converters.insert((TypeId::of::<F>(), TypeId::of::<T>()), f);
    }

    /// Registers a fallback consulted when no direct converter matches.
    /// Fallbacks are tried in registration order.
    pub fn register_fallback<C>(&self, fallback: C)
    where
        C: Fn(TypeId, &Body) -> Option<Box<dyn Any + Send>> + Send + Sync + 'static,
    {
        self.fallbacks.write().push(Arc::new(fallback));
    }

    pub fn size(&self) -> usize {
        self.converters.len()
    }

    /// Converts the body to `T`, or `None` when no conversion is available.
    pub fn convert_to<T: Any + Send + Clone>(&self, body: &Body) -> Option<T> {
        if let Some(value) = body.downcast_ref::<T>() {
            return Some(value.clone());
        }

        let target = TypeId::of::<T>();
        let converter = self
            .converters
            .get(&(body.payload_type_id(), target))
            .map(|c| c.value().clone());

        if let Some(converter) = converter {
            if let Some(converted) = converter(body.as_any()) {
                return converted.downcast::<T>().ok().map(|b| *b);
            }
        }

        let fallbacks = self.fallbacks.read().clone();
        fallbacks
            .iter()
            .find_map(|fallback| fallback(target, body))
            .and_then(|converted| converted.downcast::<T>().ok())
            .map(|b| *b)
    }

    /// Like [`convert_to`](Self::convert_to) but fails with
    /// `NoTypeConversionAvailable`.
    pub fn mandatory_convert_to<T: Any + Send + Clone>(&self, body: &Body) -> Result<T> {
        self.convert_to::<T>(body)
            .ok_or_else(|| RoutingError::no_conversion(body.type_name(), std::any::type_name::<T>()))
    }
}
