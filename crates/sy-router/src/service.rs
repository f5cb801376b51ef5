//! Service lifecycle state machine
//!
//! Every long-lived component (endpoints, producers, consumers, pools, routes)
//! embeds a [`ServiceState`] and implements the `do_*` hooks of [`Service`]. The
//! provided `start`/`stop`/`suspend`/`resume` methods drive the transitions.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use sy_common::{AggregateError, Result, RoutingError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceStatus {
    Starting,
    Started,
    Stopping,
    Stopped,
    Suspending,
    Suspended,
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Outcome of a transition check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    Proceed,
    NoOp,
}

/// Status holder embedded in every service.
///
/// All checks are check-and-set under a short lock; the lock is never held while
/// a `do_*` hook runs.
#[derive(Debug)]
pub struct ServiceState {
    status: Mutex<ServiceStatus>,
}

impl Default for ServiceState {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceState {
    pub fn new() -> Self {
        Self {
            status: Mutex::new(ServiceStatus::Stopped),
        }
    }

    pub fn status(&self) -> ServiceStatus {
        *self.status.lock()
    }

    pub fn is_started(&self) -> bool {
        self.status() == ServiceStatus::Started
    }

    pub fn is_stopped(&self) -> bool {
        self.status() == ServiceStatus::Stopped
    }

    pub fn is_suspended(&self) -> bool {
        self.status() == ServiceStatus::Suspended
    }

    /// False once a stop has begun.
    pub fn is_run_allowed(&self) -> bool {
        !matches!(self.status(), ServiceStatus::Stopping | ServiceStatus::Stopped)
    }

    fn set(&self, status: ServiceStatus) {
        *self.status.lock() = status;
    }

    fn begin_start(&self) -> Result<Transition> {
        let mut status = self.status.lock();
        match *status {
            ServiceStatus::Started | ServiceStatus::Starting => Ok(Transition::NoOp),
            ServiceStatus::Stopped | ServiceStatus::Suspended => {
                *status = ServiceStatus::Starting;
                Ok(Transition::Proceed)
            }
            other => Err(RoutingError::illegal_state(format!(
                "Cannot start service while {other}"
            ))),
        }
    }

    fn begin_stop(&self) -> Result<Transition> {
        let mut status = self.status.lock();
        match *status {
            ServiceStatus::Stopped | ServiceStatus::Stopping => Ok(Transition::NoOp),
            ServiceStatus::Started | ServiceStatus::Suspended => {
                *status = ServiceStatus::Stopping;
                Ok(Transition::Proceed)
            }
            other => Err(RoutingError::illegal_state(format!(
                "Cannot stop service while {other}"
            ))),
        }
    }

    fn begin_suspend(&self) -> Result<Transition> {
        let mut status = self.status.lock();
        match *status {
            ServiceStatus::Suspended | ServiceStatus::Suspending => Ok(Transition::NoOp),
            ServiceStatus::Started => {
                *status = ServiceStatus::Suspending;
                Ok(Transition::Proceed)
            }
            other => Err(RoutingError::illegal_state(format!(
                "Cannot suspend service while {other}"
            ))),
        }
    }

    fn begin_resume(&self) -> Result<Transition> {
        let mut status = self.status.lock();
        match *status {
            ServiceStatus::Started | ServiceStatus::Starting => Ok(Transition::NoOp),
            ServiceStatus::Suspended => {
                *status = ServiceStatus::Starting;
                Ok(Transition::Proceed)
            }
            other => Err(RoutingError::illegal_state(format!(
                "Cannot resume service while {other}"
            ))),
        }
    }
}

/// Start/stop/suspend/resume contract.
///
/// Implementors provide [`service_state`](Service::service_state) and override
/// whichever `do_*` hooks they need.
#[async_trait]
pub trait Service: Send + Sync {
    fn service_state(&self) -> &ServiceState;

    fn service_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    async fn do_start(&self) -> Result<()> {
        Ok(())
    }

    async fn do_stop(&self) -> Result<()> {
        Ok(())
    }

    /// Services that cannot really suspend simply stop.
    async fn do_suspend(&self) -> Result<()> {
        self.do_stop().await
    }

    async fn do_resume(&self) -> Result<()> {
        self.do_start().await
    }

    async fn start(&self) -> Result<()> {
        let state = self.service_state();
        if state.begin_start()? == Transition::NoOp {
            return Ok(());
        }

        debug!(service = self.service_name(), "Starting service");
        match self.do_start().await {
            Ok(()) => {
                state.set(ServiceStatus::Started);
                Ok(())
            }
            Err(e) => {
                warn!(service = self.service_name(), error = %e, "Service failed to start");
                if let Err(cleanup) = self.do_stop().await {
                    warn!(
                        service = self.service_name(),
                        error = %cleanup,
                        "Cleanup after failed start also failed"
                    );
                }
                state.set(ServiceStatus::Stopped);
                Err(e)
            }
        }
    }

    async fn stop(&self) -> Result<()> {
        let state = self.service_state();
        if state.begin_stop()? == Transition::NoOp {
            return Ok(());
        }

        debug!(service = self.service_name(), "Stopping service");
        let result = self.do_stop().await;
        state.set(ServiceStatus::Stopped);
        if let Err(e) = &result {
            warn!(service = self.service_name(), error = %e, "Service failed to stop cleanly");
        }
        result
    }

    async fn suspend(&self) -> Result<()> {
        let state = self.service_state();
        if state.begin_suspend()? == Transition::NoOp {
            return Ok(());
        }

        debug!(service = self.service_name(), "Suspending service");
        match self.do_suspend().await {
            Ok(()) => {
                state.set(ServiceStatus::Suspended);
                Ok(())
            }
            Err(e) => {
                state.set(ServiceStatus::Started);
                Err(e)
            }
        }
    }

    async fn resume(&self) -> Result<()> {
        let state = self.service_state();
        if state.begin_resume()? == Transition::NoOp {
            return Ok(());
        }

        debug!(service = self.service_name(), "Resuming service");
        match self.do_resume().await {
            Ok(()) => {
                state.set(ServiceStatus::Started);
                Ok(())
            }
            Err(e) => {
                state.set(ServiceStatus::Suspended);
                Err(e)
            }
        }
    }

    fn status(&self) -> ServiceStatus {
        self.service_state().status()
    }

    fn is_started(&self) -> bool {
        self.service_state().is_started()
    }

    fn is_suspended(&self) -> bool {
        self.service_state().is_suspended()
    }

    fn is_run_allowed(&self) -> bool {
        self.service_state().is_run_allowed()
    }
}

/// Stops every service, continuing past failures. Failures come back as one
/// aggregate error.
pub async fn stop_all<S>(services: impl IntoIterator<Item = Arc<S>>) -> Result<()>
where
    S: Service + ?Sized,
{
    let mut errors = Vec::new();
    for service in services {
        if let Err(e) = service.stop().await {
            errors.push(e);
        }
    }
    match AggregateError::from_causes(errors) {
        Some(agg) => Err(RoutingError::Aggregate(agg)),
        None => Ok(()),
    }
}
