//! Expression languages resolved by name
//!
//! Routes and components look a language up through the routing context; an
//! unknown name fails at resolution with `RoutingError::NoSuchLanguage`.

use serde_json::Value;

use sy_common::Exchange;

/// Evaluates expressions against an exchange.
pub trait Language: Send + Sync {
    /// `None` when the expression selects nothing.
    fn evaluate(&self, expression: &str, exchange: &Exchange) -> Option<Value>;

    fn matches(&self, expression: &str, exchange: &Exchange) -> bool {
        match self.evaluate(expression, exchange) {
            None | Some(Value::Null) | Some(Value::Bool(false)) => false,
            Some(_) => true,
        }
    }
}

/// `header`: the IN header named by the expression.
#[derive(Debug, Default)]
pub struct HeaderLanguage;

impl Language for HeaderLanguage {
    fn evaluate(&self, expression: &str, exchange: &Exchange) -> Option<Value> {
        exchange.in_message().header(expression.trim()).cloned()
    }
}

/// `exchangeProperty`: the exchange property named by the expression.
#[derive(Debug, Default)]
pub struct PropertyLanguage;

impl Language for PropertyLanguage {
    fn evaluate(&self, expression: &str, exchange: &Exchange) -> Option<Value> {
        exchange.property(expression.trim()).cloned()
    }
}
