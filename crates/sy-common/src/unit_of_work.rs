//! Unit of work - completion scope bound to one exchange

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{AggregateError, Result, RoutingError};
use crate::exchange::Exchange;

/// Callback fired when an exchange's unit of work completes.
pub trait Synchronization: Send + Sync {
    fn on_complete(&self, exchange: &Exchange) -> Result<()>;

    fn on_failure(&self, exchange: &Exchange) -> Result<()>;
}

pub struct UnitOfWork {
    id: String,
    exchange_id: String,
    synchronizations: Mutex<Vec<Arc<dyn Synchronization>>>,
    done: AtomicBool,
}

impl UnitOfWork {
    pub fn new(exchange: &Exchange) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            exchange_id: exchange.id().to_string(),
            synchronizations: Mutex::new(Vec::new()),
            done: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn exchange_id(&self) -> &str {
        &self.exchange_id
    }

    pub fn add_synchronization(&self, sync: Arc<dyn Synchronization>) {
        self.synchronizations.lock().push(sync);
    }

    pub fn remove_synchronization(&self, sync: &Arc<dyn Synchronization>) {
        self.synchronizations
            .lock()
            .retain(|s| !Arc::ptr_eq(s, sync));
    }

    pub fn synchronization_count(&self) -> usize {
        self.synchronizations.lock().len()
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Fires every synchronization once. Later calls are no-ops.
    ///
    /// Every synchronization runs even if an earlier one fails; failures are
    /// returned together as an aggregate.
    pub fn done(&self, exchange: &Exchange) -> Result<()> {
        if self.done.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let syncs: Vec<_> = std::mem::take(&mut *self.synchronizations.lock());
        let failed = exchange.is_failed();
        debug!(
            exchange_id = %self.exchange_id,
            failed,
            synchronizations = syncs.len(),
            "Unit of work done"
        );

        let mut errors = Vec::new();
        for sync in syncs {
            let outcome = if failed {
                sync.on_failure(exchange)
            } else {
                sync.on_complete(exchange)
            };
            if let Err(e) = outcome {
                warn!(exchange_id = %self.exchange_id, error = %e, "Synchronization failed");
                errors.push(e);
            }
        }

        match AggregateError::from_causes(errors) {
            Some(agg) => Err(RoutingError::Aggregate(agg)),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("id", &self.id)
            .field("exchange_id", &self.exchange_id)
            .field("done", &self.is_done())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::ExchangePattern;
    use std::sync::atomic::AtomicUsize;

    struct Recorder {
        completed: AtomicUsize,
        failed: AtomicUsize,
        fail_with: Option<&'static str>,
    }

    impl Recorder {
        fn new(fail_with: Option<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                completed: AtomicUsize::new(0),
                failed: AtomicUsize::new(0),
                fail_with,
            })
        }
    }

    impl Synchronization for Recorder {
        fn on_complete(&self, _exchange: &Exchange) -> Result<()> {
            self.completed.fetch_add(1, Ordering::SeqCst);
            match self.fail_with {
                Some(msg) => Err(RoutingError::processing(msg)),
                None => Ok(()),
            }
        }

        fn on_failure(&self, _exchange: &Exchange) -> Result<()> {
            self.failed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_done_fires_once() {
        let exchange = Exchange::new(ExchangePattern::InOnly);
        let uow = UnitOfWork::new(&exchange);
        let recorder = Recorder::new(None);
        uow.add_synchronization(recorder.clone());

        uow.done(&exchange).unwrap();
        uow.done(&exchange).unwrap();

        assert!(uow.is_done());
        assert_eq!(recorder.completed.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.failed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_failed_exchange_fires_on_failure() {
        let mut exchange = Exchange::new(ExchangePattern::InOnly);
        exchange.set_exception(RoutingError::processing("boom"));
        let uow = UnitOfWork::new(&exchange);
        let recorder = Recorder::new(None);
        uow.add_synchronization(recorder.clone());

        uow.done(&exchange).unwrap();
        assert_eq!(recorder.failed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failures_are_aggregated() {
        let exchange = Exchange::new(ExchangePattern::InOnly);
        let uow = UnitOfWork::new(&exchange);
        let first = Recorder::new(Some("first"));
        let ok = Recorder::new(None);
        let second = Recorder::new(Some("second"));
        uow.add_synchronization(first.clone());
        uow.add_synchronization(ok.clone());
        uow.add_synchronization(second.clone());

        let err = uow.done(&exchange).unwrap_err();
        match err {
            RoutingError::Aggregate(agg) => {
                assert_eq!(agg.len(), 2);
                assert_eq!(agg.primary().to_string(), "Processing failed: first");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(ok.completed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_pending_completions_handed_over() {
        let mut exchange = Exchange::new(ExchangePattern::InOnly);
        let recorder = Recorder::new(None);
        exchange.add_on_completion(recorder.clone());
        assert_eq!(exchange.pending_completions(), 1);

        let uow = Arc::new(UnitOfWork::new(&exchange));
        exchange.set_unit_of_work(Some(uow.clone()));
        assert_eq!(exchange.pending_completions(), 0);
        assert_eq!(uow.synchronization_count(), 1);

        uow.done(&exchange).unwrap();
        assert_eq!(recorder.completed.load(Ordering::SeqCst), 1);
    }
}
