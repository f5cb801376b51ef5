//! Composite processors: sequential pipeline and multicast fan-out

use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

use sy_common::{property, Exchange};

use crate::processor::{AsyncCallback, AsyncProcessor, CompletionGuard, StepHandoff};

// ============================================================================
// Pipeline
// ============================================================================

/// Runs its steps in order. The OUT of one step becomes the IN of the next.
/// Stops early when the exchange fails or a step requested a route stop.
pub struct Pipeline {
    steps: Arc<[Arc<dyn AsyncProcessor>]>,
}

impl Pipeline {
    pub fn new(steps: Vec<Arc<dyn AsyncProcessor>>) -> Self {
        Self {
            steps: steps.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn steps(&self) -> &[Arc<dyn AsyncProcessor>] {
        &self.steps
    }
}

fn continue_processing(exchange: &Exchange) -> bool {
    if exchange.is_failed() {
        debug!(exchange_id = %exchange.id(), "Exchange failed, pipeline stops");
        return false;
    }
    if exchange.is_route_stop() {
        debug!(exchange_id = %exchange.id(), "Route stop requested, pipeline stops");
        return false;
    }
    true
}

/// Drives the steps from `index`. Returns true when the guard was completed on
/// this call stack.
fn run_steps(
    steps: Arc<[Arc<dyn AsyncProcessor>]>,
    mut index: usize,
    mut exchange: Exchange,
    guard: CompletionGuard,
    done_sync: bool,
) -> bool {
    loop {
        if index >= steps.len() || (index > 0 && !continue_processing(&exchange)) {
            guard.complete(exchange, done_sync);
            return done_sync;
        }
        if index > 0 {
            exchange.prepare_for_next_step();
        }

        trace!(exchange_id = %exchange.id(), step = index, "Pipeline step");
        let handoff = StepHandoff::new();
        let next = index + 1;
        let callback = {
            let handoff = handoff.clone();
            let steps = steps.clone();
            let guard = guard.clone();
            AsyncCallback::new(move |exchange, _| {
                if let Some(exchange) = handoff.complete(exchange) {
                    run_steps(steps, next, exchange, guard, false);
                }
            })
        };
        steps[index].process_async(exchange, callback);

        match handoff.returned() {
            Some(returned) => {
                exchange = returned;
                index = next;
            }
            None => return false,
        }
    }
}

impl AsyncProcessor for Pipeline {
    fn process_async(&self, exchange: Exchange, callback: AsyncCallback) -> bool {
        let guard = CompletionGuard::new(&exchange, callback);
        run_steps(self.steps.clone(), 0, exchange, guard, true)
    }
}

// ============================================================================
// Multicast
// ============================================================================

/// Folds branch results into one exchange.
pub trait AggregationStrategy: Send + Sync {
    /// `previous` is `None` for the first branch
    fn aggregate(&self, previous: Option<Exchange>, next: Exchange) -> Exchange;
}

/// Keeps the last branch result. An earlier failure is carried forward so it
/// is never lost to a later success.
#[derive(Debug, Default, Clone, Copy)]
pub struct UseLatestAggregationStrategy;

impl AggregationStrategy for UseLatestAggregationStrategy {
    fn aggregate(&self, previous: Option<Exchange>, mut next: Exchange) -> Exchange {
        if let Some(previous) = previous {
            if next.exception().is_none() {
                if let Some(cause) = previous.exception_arc() {
                    next.set_exception_arc(cause);
                }
            }
        }
        next
    }
}

/// Sends a copy of the exchange to every processor and completes once, after
/// the last branch has completed.
pub struct MulticastProcessor {
    processors: Vec<Arc<dyn AsyncProcessor>>,
    strategy: Arc<dyn AggregationStrategy>,
}

impl MulticastProcessor {
    pub fn new(processors: Vec<Arc<dyn AsyncProcessor>>) -> Self {
        Self::with_strategy(processors, Arc::new(UseLatestAggregationStrategy))
    }

    pub fn with_strategy(
        processors: Vec<Arc<dyn AsyncProcessor>>,
        strategy: Arc<dyn AggregationStrategy>,
    ) -> Self {
        Self {
            processors,
            strategy,
        }
    }

    pub fn processors(&self) -> &[Arc<dyn AsyncProcessor>] {
        &self.processors
    }
}

struct Fanout {
    original: Mutex<Option<Exchange>>,
    results: Mutex<Vec<Option<Exchange>>>,
    remaining: AtomicUsize,
    strategy: Arc<dyn AggregationStrategy>,
    handoff: StepHandoff,
    guard: CompletionGuard,
}

impl Fanout {
    fn branch_done(&self, index: usize, exchange: Exchange) {
        self.results.lock()[index] = Some(exchange);
        if self.remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        if let Some(aggregated) = self.aggregate() {
            if let Some(exchange) = self.handoff.complete(aggregated) {
                self.guard.complete(exchange, false);
            }
        }
    }

    fn aggregate(&self) -> Option<Exchange> {
        let mut original = self.original.lock().take()?;
        let results: Vec<_> = std::mem::take(&mut *self.results.lock());

        let mut aggregated: Option<Exchange> = None;
        for result in results.into_iter().flatten() {
            aggregated = Some(self.strategy.aggregate(aggregated, result));
        }

        if let Some(result) = aggregated {
            let kept: Vec<(&str, Option<Value>)> = [property::MULTICAST_INDEX, property::CORRELATION_ID]
                .into_iter()
                .map(|key| (key, original.property(key).cloned()))
                .collect();
            original.copy_from(&result);
            for (key, value) in kept {
                match value {
                    Some(value) => original.set_property(key, value),
                    None => {
                        original.remove_property(key);
                    }
                }
            }
        }
        Some(original)
    }
}

impl AsyncProcessor for MulticastProcessor {
    fn process_async(&self, exchange: Exchange, callback: AsyncCallback) -> bool {
        if self.processors.is_empty() {
            callback.on_data_received(exchange, true);
            return true;
        }

        let copies: Vec<Exchange> = (0..self.processors.len())
            .map(|index| {
                let mut copy = exchange.copy();
                copy.set_property(property::MULTICAST_INDEX, index);
                copy.set_property(property::CORRELATION_ID, exchange.id());
                copy
            })
            .collect();

        let fanout = Arc::new(Fanout {
            guard: CompletionGuard::new(&exchange, callback),
            original: Mutex::new(Some(exchange)),
            results: Mutex::new((0..copies.len()).map(|_| None).collect()),
            remaining: AtomicUsize::new(copies.len()),
            strategy: self.strategy.clone(),
            handoff: StepHandoff::new(),
        });

        for (index, (processor, copy)) in self.processors.iter().zip(copies).enumerate() {
            let fanout_cb = fanout.clone();
            processor.process_async(
                copy,
                AsyncCallback::new(move |exchange, _| fanout_cb.branch_done(index, exchange)),
            );
        }

        match fanout.handoff.returned() {
            Some(exchange) => {
                fanout.guard.complete(exchange, true);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::{process_and_wait, processor_fn, spawn_processor_fn};
    use std::time::Duration;
    use sy_common::{ExchangePattern, RoutingError};
    use tokio::sync::oneshot;

    fn append(tag: &'static str) -> Arc<dyn AsyncProcessor> {
        processor_fn(move |exchange| {
            let body = exchange.in_body_as::<String>().unwrap_or_default();
            if let Some(out) = exchange.out_message_mut() {
                out.set_body(format!("{body}{tag}"));
            }
            Ok(())
        })
    }

    fn in_out(body: &str) -> Exchange {
        let mut exchange = Exchange::new(ExchangePattern::InOut);
        exchange.in_message_mut().set_body(body.to_string());
        exchange
    }

    #[tokio::test]
    async fn test_out_becomes_next_in() {
        let pipeline = Pipeline::new(vec![append("a"), append("b"), append("c")]);
        let (tx, rx) = oneshot::channel();

        let sync = pipeline.process_async(
            in_out(">"),
            AsyncCallback::new(move |ex, done_sync| {
                let _ = tx.send((ex, done_sync));
            }),
        );
        let (exchange, done_sync) = rx.await.unwrap();

        assert!(sync);
        assert!(done_sync);
        let out = exchange.out_message().and_then(|m| m.body_as::<String>()).cloned();
        assert_eq!(out.as_deref(), Some(">abc"));
    }

    #[tokio::test]
    async fn test_async_step_completes_once_with_sync_false() {
        let slow = spawn_processor_fn(|mut exchange: Exchange| async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let body = exchange.in_body_as::<String>().unwrap_or_default();
            if let Some(out) = exchange.out_message_mut() {
                out.set_body(format!("{body}slow"));
            }
            exchange
        });
        let pipeline = Pipeline::new(vec![append("a"), slow, append("z")]);
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let (tx, rx) = oneshot::channel();

        let sync = pipeline.process_async(
            in_out(""),
            AsyncCallback::new(move |ex, done_sync| {
                counted.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send((ex, done_sync));
            }),
        );
        let (exchange, done_sync) = rx.await.unwrap();

        assert!(!sync);
        assert!(!done_sync);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let out = exchange.out_message().and_then(|m| m.body_as::<String>()).cloned();
        assert_eq!(out.as_deref(), Some("aslowz"));
    }

    #[tokio::test]
    async fn test_failure_stops_pipeline() {
        let reached = Arc::new(AtomicUsize::new(0));
        let seen = reached.clone();
        let fail = processor_fn(|exchange| {
            exchange.set_exception(RoutingError::processing("boom"));
            Ok(())
        });
        let after = processor_fn(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let pipeline = Pipeline::new(vec![fail, after]);

        let exchange = process_and_wait(&pipeline, in_out("x")).await.unwrap();
        assert!(exchange.is_failed());
        assert_eq!(reached.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_route_stop_stops_pipeline() {
        let stop = processor_fn(|exchange| {
            exchange.stop_route();
            Ok(())
        });
        let pipeline = Pipeline::new(vec![stop, append("never")]);

        let exchange = process_and_wait(&pipeline, in_out("x")).await.unwrap();
        assert!(!exchange.is_failed());
        assert!(exchange.out_message().is_none());
    }

    #[tokio::test]
    async fn test_multicast_completes_once_after_all_branches() {
        let calls = Arc::new(AtomicUsize::new(0));
        let branch = |delay: u64, tag: &'static str| {
            spawn_processor_fn(move |mut exchange: Exchange| async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                exchange.set_property(tag, true);
                exchange
            })
        };
        let multicast = MulticastProcessor::new(vec![branch(20, "first"), branch(5, "second")]);
        let counted = calls.clone();
        let (tx, rx) = oneshot::channel();
        let exchange = in_out("x");
        let id = exchange.id().to_string();

        multicast.process_async(
            exchange,
            AsyncCallback::new(move |ex, _| {
                counted.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(ex);
            }),
        );
        let exchange = rx.await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(exchange.id(), id);
        // latest wins in branch order
        assert!(exchange.property_bool("second"));
        assert!(exchange.property(property::MULTICAST_INDEX).is_none());
    }

    #[tokio::test]
    async fn test_multicast_keeps_branch_failure() {
        let fail = processor_fn(|exchange| {
            exchange.set_exception(RoutingError::processing("branch failed"));
            Ok(())
        });
        let ok = processor_fn(|_| Ok(()));
        let multicast = MulticastProcessor::new(vec![fail, ok]);

        let exchange = process_and_wait(&multicast, in_out("x")).await.unwrap();
        assert!(exchange.is_failed());
    }

    #[tokio::test]
    async fn test_empty_multicast_is_sync() {
        let multicast = MulticastProcessor::new(Vec::new());
        let (tx, rx) = oneshot::channel();
        let sync = multicast.process_async(
            in_out("x"),
            AsyncCallback::new(move |ex, done_sync| {
                let _ = tx.send((ex, done_sync));
            }),
        );
        let (_, done_sync) = rx.await.unwrap();
        assert!(sync && done_sync);
    }
}
