//! Shared types for the Switchyard routing engine
//!
//! The exchange/message model, exchange patterns, errors, type conversion,
//! configuration and logging setup used by every other crate.

pub mod config;
pub mod convert;
pub mod error;
pub mod exchange;
pub mod logging;
pub mod message;
pub mod pattern;
pub mod property;
pub mod shutdown;
pub mod unit_of_work;

pub use config::{CacheConfig, RedeliveryPolicy, RouterConfig, ScheduledPollConfig};
pub use convert::TypeConverterRegistry;
pub use error::{AggregateError, Result, RoutingError};
pub use exchange::{Exchange, ExchangeContext};
pub use message::{Body, Message};
pub use pattern::ExchangePattern;
pub use property::{ExchangePropertyRegistry, PropertyDescriptor};
pub use shutdown::{ShutdownRoute, ShutdownRunningTask};
pub use unit_of_work::{Synchronization, UnitOfWork};
