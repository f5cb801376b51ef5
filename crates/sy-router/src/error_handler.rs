//! Redelivery error handler with optional dead letter processor

use std::sync::Arc;
use tracing::{debug, warn};

use sy_common::{property, Exchange, RedeliveryPolicy, Result};

use crate::channel::{ErrorHandlerFactory, ProcessorDefinition};
use crate::metrics;
use crate::processor::{AsyncCallback, AsyncProcessor, CompletionGuard, StepHandoff};

/// Retries a failed exchange according to a [`RedeliveryPolicy`]. Once
/// redeliveries are exhausted the exchange goes to the dead letter processor if
/// one is configured, otherwise it completes with its failure.
pub struct RedeliveryErrorHandler {
    inner: Arc<Redelivery>,
}

struct Redelivery {
    output: Arc<dyn AsyncProcessor>,
    policy: RedeliveryPolicy,
    dead_letter: Option<Arc<dyn AsyncProcessor>>,
}

enum Outcome {
    Completed(bool),
    Retry(Exchange, u32),
}

impl RedeliveryErrorHandler {
    pub fn new(output: Arc<dyn AsyncProcessor>, policy: RedeliveryPolicy) -> Self {
        Self {
            inner: Arc::new(Redelivery {
                output,
                policy,
                dead_letter: None,
            }),
        }
    }

    pub fn with_dead_letter(
        output: Arc<dyn AsyncProcessor>,
        policy: RedeliveryPolicy,
        dead_letter: Arc<dyn AsyncProcessor>,
    ) -> Self {
        Self {
            inner: Arc::new(Redelivery {
                output,
                policy,
                dead_letter: Some(dead_letter),
            }),
        }
    }

    pub fn policy(&self) -> &RedeliveryPolicy {
        &self.inner.policy
    }
}

impl AsyncProcessor for RedeliveryErrorHandler {
    fn process_async(&self, exchange: Exchange, callback: AsyncCallback) -> bool {
        let guard = CompletionGuard::new(&exchange, callback);
        self.inner.attempt(exchange, guard, 0, true)
    }
}

impl Redelivery {
    /// Runs attempts until one completes asynchronously or the outcome is final.
    fn attempt(
        self: &Arc<Self>,
        mut exchange: Exchange,
        guard: CompletionGuard,
        mut counter: u32,
        done_sync: bool,
    ) -> bool {
        loop {
            let handoff = StepHandoff::new();
            let callback = {
                let handoff = handoff.clone();
                let this = self.clone();
                let guard = guard.clone();
                AsyncCallback::new(move |exchange, _| {
                    if let Some(exchange) = handoff.complete(exchange) {
                        this.settle(exchange, guard, counter);
                    }
                })
            };
            self.output.process_async(exchange, callback);

            let Some(returned) = handoff.returned() else {
                return false;
            };
            match self.after_attempt(returned, &guard, counter, done_sync) {
                Outcome::Completed(sync) => return sync,
                Outcome::Retry(next_exchange, next_counter) => {
                    exchange = next_exchange;
                    counter = next_counter;
                }
            }
        }
    }

    /// Continuation for attempts that completed on another task.
    fn settle(self: &Arc<Self>, exchange: Exchange, guard: CompletionGuard, counter: u32) {
        if let Outcome::Retry(exchange, next) = self.after_attempt(exchange, &guard, counter, false) {
            self.attempt(exchange, guard, next, false);
        }
    }

    fn after_attempt(
        self: &Arc<Self>,
        mut exchange: Exchange,
        guard: &CompletionGuard,
        counter: u32,
        done_sync: bool,
    ) -> Outcome {
        if !exchange.is_failed() {
            guard.complete(exchange, done_sync);
            return Outcome::Completed(done_sync);
        }

        let next = counter + 1;
        if self.policy.should_redeliver(next) {
            let delay = self.policy.delay_for(next);
            debug!(
                exchange_id = %exchange.id(),
                attempt = next,
                delay_ms = delay.as_millis() as u64,
                "Redelivering failed exchange"
            );
            metrics::redelivery(next);
            prepare_redelivery(&mut exchange, next);

            if delay.is_zero() {
                return Outcome::Retry(exchange, next);
            }
            let this = self.clone();
            let guard = guard.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                this.attempt(exchange, guard, next, false);
            });
            return Outcome::Completed(false);
        }

        exchange.set_property(property::REDELIVERY_EXHAUSTED, true);
        match &self.dead_letter {
            Some(dead_letter) => {
                if let Some(cause) = exchange.take_exception() {
                    warn!(
                        exchange_id = %exchange.id(),
                        error = %cause,
                        "Redelivery exhausted, moving exchange to dead letter"
                    );
                    exchange.set_property(property::EXCEPTION_CAUGHT, cause.to_string());
                }
                exchange.clear_fault();
                exchange.set_property(property::FAILURE_HANDLED, true);

                let guard = guard.clone();
                let sync = dead_letter.process_async(
                    exchange,
                    AsyncCallback::new(move |exchange, sync| {
                        guard.complete(exchange, done_sync && sync);
                    }),
                );
                Outcome::Completed(done_sync && sync)
            }
            None => {
                warn!(exchange_id = %exchange.id(), attempts = counter, "Redelivery exhausted");
                guard.complete(exchange, done_sync);
                Outcome::Completed(done_sync)
            }
        }
    }
}

fn prepare_redelivery(exchange: &mut Exchange, counter: u32) {
    exchange.take_exception();
    exchange.clear_fault();
    exchange.set_property(property::REDELIVERED, true);
    exchange.set_property(property::REDELIVERY_COUNTER, counter);
}

/// Builds a [`RedeliveryErrorHandler`] around every channel output.
pub struct RedeliveryErrorHandlerFactory {
    policy: RedeliveryPolicy,
    dead_letter: Option<Arc<dyn AsyncProcessor>>,
}

impl RedeliveryErrorHandlerFactory {
    pub fn new(policy: RedeliveryPolicy) -> Self {
        Self {
            policy,
            dead_letter: None,
        }
    }

    pub fn dead_letter(mut self, processor: Arc<dyn AsyncProcessor>) -> Self {
        self.dead_letter = Some(processor);
        self
    }
}

impl ErrorHandlerFactory for RedeliveryErrorHandlerFactory {
    fn create_error_handler(
        &self,
        _definition: &ProcessorDefinition,
        output: Arc<dyn AsyncProcessor>,
    ) -> Result<Arc<dyn AsyncProcessor>> {
        let handler = match &self.dead_letter {
            Some(dead_letter) => {
                RedeliveryErrorHandler::with_dead_letter(output, self.policy.clone(), dead_letter.clone())
            }
            None => RedeliveryErrorHandler::new(output, self.policy.clone()),
        };
        Ok(Arc::new(handler))
    }
}
