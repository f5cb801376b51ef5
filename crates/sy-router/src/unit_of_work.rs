//! Unit of work boundary at the head of a route

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use sy_common::{Exchange, UnitOfWork};

use crate::metrics;
use crate::processor::{AsyncCallback, AsyncProcessor};

/// Opens a unit of work for exchanges entering a route and closes it once the
/// wrapped processor completes.
///
/// An exchange that already carries a unit of work (e.g. sent from another
/// route through `direct:`) is passed through untouched; the outermost boundary
/// owns completion.
pub struct UnitOfWorkProcessor {
    processor: Arc<dyn AsyncProcessor>,
    route_id: Option<String>,
    inflight: Arc<AtomicUsize>,
}

impl UnitOfWorkProcessor {
    pub fn new(processor: Arc<dyn AsyncProcessor>) -> Self {
        Self {
            processor,
            route_id: None,
            inflight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Binds the boundary to a route so its inflight count is shared.
    pub fn for_route(mut self, route_id: impl Into<String>, inflight: Arc<AtomicUsize>) -> Self {
        self.route_id = Some(route_id.into());
        self.inflight = inflight;
        self
    }

    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Acquire)
    }
}

impl AsyncProcessor for UnitOfWorkProcessor {
    fn process_async(&self, mut exchange: Exchange, callback: AsyncCallback) -> bool {
        if exchange.unit_of_work().is_some() {
            return self.processor.process_async(exchange, callback);
        }

        let uow = Arc::new(UnitOfWork::new(&exchange));
        exchange.set_unit_of_work(Some(uow.clone()));

        let count = self.inflight.fetch_add(1, Ordering::AcqRel) + 1;
        let route_id = self.route_id.clone().unwrap_or_default();
        metrics::inflight(&route_id, count);

        let inflight = self.inflight.clone();
        self.processor.process_async(
            exchange,
            AsyncCallback::new(move |mut exchange, done_sync| {
                // a processor may have swapped the exchange; rebind so pending
                // completions land on this unit of work
                exchange.set_unit_of_work(Some(uow.clone()));
                if let Err(e) = uow.done(&exchange) {
                    warn!(exchange_id = %exchange.id(), error = %e, "Unit of work completed with errors");
                }
                exchange.set_unit_of_work(None);

                match exchange.exception() {
                    Some(cause) => metrics::exchange_failed(&route_id, cause.as_label()),
                    None => metrics::exchange_completed(&route_id),
                }
                let remaining = inflight.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
                metrics::inflight(&route_id, remaining);
                debug!(exchange_id = %exchange.id(), done_sync, "Exchange completed");

                callback.on_data_received(exchange, done_sync);
            }),
        )
    }
}
