//! Graceful shutdown policy values
//!
//! These are declarative: the routing context reads them when ordering route
//! shutdown, batch consumers read them when deciding how much of an in-flight
//! batch to finish.

use serde::{Deserialize, Serialize};

/// When a route's consumer is stopped during context shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ShutdownRoute {
    /// Stopped in the first phase.
    #[default]
    Default,
    /// Kept running until every `Default` route has stopped.
    Defer,
}

/// How much in-flight work a batch consumer finishes once shutdown begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ShutdownRunningTask {
    #[default]
    CompleteCurrentTaskOnly,
    CompleteAllTasks,
}

impl ShutdownRoute {
    pub fn is_deferred(&self) -> bool {
        matches!(self, Self::Defer)
    }
}

impl ShutdownRunningTask {
    pub fn completes_all(&self) -> bool {
        matches!(self, Self::CompleteAllTasks)
    }
}
