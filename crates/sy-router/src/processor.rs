//! Processor execution contract
//!
//! [`Processor`] is the plain async contract: it returns once the exchange is
//! handled. [`AsyncProcessor`] is the callback contract used for routing: the
//! exchange is moved in and handed back through an [`AsyncCallback`] exactly once.
//!
//! A `true` return means the callback has already fired on the calling task. A
//! `false` return means it fires later on another task.

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{error, warn};

use sy_common::{Exchange, ExchangeContext, ExchangePattern, Result, RoutingError};

#[async_trait]
pub trait Processor: Send + Sync {
    /// Handles the exchange. Routing failures belong on the exchange
    /// (`set_exception`); `Err` is for unrecoverable internal errors.
    async fn process(&self, exchange: &mut Exchange) -> Result<()>;
}

pub trait AsyncProcessor: Send + Sync {
    fn process_async(&self, exchange: Exchange, callback: AsyncCallback) -> bool;
}

type CallbackFn = Box<dyn FnOnce(Exchange, bool) + Send>;

/// Completion callback. Consumed on invocation, so it can fire at most once.
pub struct AsyncCallback {
    inner: Option<CallbackFn>,
}

impl AsyncCallback {
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce(Exchange, bool) + Send + 'static,
    {
        Self {
            inner: Some(Box::new(f)),
        }
    }

    /// Callback that discards the exchange
    pub fn noop() -> Self {
        Self::new(|_, _| {})
    }

    pub fn on_data_received(mut self, exchange: Exchange, done_sync: bool) {
        if let Some(f) = self.inner.take() {
            f(exchange, done_sync);
        }
    }
}

impl Drop for AsyncCallback {
    fn drop(&mut self) {
        if self.inner.is_some() {
            error!("AsyncCallback dropped without being invoked");
        }
    }
}

impl std::fmt::Debug for AsyncCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncCallback")
            .field("pending", &self.inner.is_some())
            .finish()
    }
}

// ============================================================================
// Completion guard
// ============================================================================

struct GuardInner {
    callback: Mutex<Option<AsyncCallback>>,
    exchange_id: String,
    pattern: ExchangePattern,
    context: Option<Arc<dyn ExchangeContext>>,
}

impl Drop for GuardInner {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.get_mut().take() {
            warn!(
                exchange_id = %self.exchange_id,
                "Exchange was lost before completion, completing it with an error"
            );
            let mut shell = Exchange::with_id(self.exchange_id.clone(), self.pattern);
            if let Some(ctx) = &self.context {
                shell.set_context(ctx.clone());
            }
            shell.set_exception(RoutingError::illegal_state(
                "Exchange lost before completion (processor panicked or was cancelled)",
            ));
            callback.on_data_received(shell, false);
        }
    }
}

/// Shared owner of a pending callback.
///
/// Whoever calls [`complete`](CompletionGuard::complete) first fires the
/// callback; later calls are ignored. When the last clone is dropped without a
/// completion, the callback fires with a failed exchange carrying the original id.
#[derive(Clone)]
pub struct CompletionGuard {
    inner: Arc<GuardInner>,
}

impl CompletionGuard {
    pub fn new(exchange: &Exchange, callback: AsyncCallback) -> Self {
        Self {
            inner: Arc::new(GuardInner {
                callback: Mutex::new(Some(callback)),
                exchange_id: exchange.id().to_string(),
                pattern: exchange.pattern(),
                context: exchange.context().cloned(),
            }),
        }
    }

    /// Fires the callback. Returns false when it had already fired.
    pub fn complete(&self, exchange: Exchange, done_sync: bool) -> bool {
        let callback = self.inner.callback.lock().take();
        match callback {
            Some(callback) => {
                callback.on_data_received(exchange, done_sync);
                true
            }
            None => {
                warn!(exchange_id = %exchange.id(), "Completion already signalled, ignoring");
                false
            }
        }
    }

    pub fn is_completed(&self) -> bool {
        self.inner.callback.lock().is_none()
    }

    pub fn exchange_id(&self) -> &str {
        &self.inner.exchange_id
    }
}

// ============================================================================
// Sync/async handoff
// ============================================================================

enum HandoffState {
    Pending,
    Parked(Exchange),
    Returned,
}

/// Decides which side continues routing after a nested `process_async` call.
///
/// The callback calls [`complete`](StepHandoff::complete) and the caller calls
/// [`returned`](StepHandoff::returned) once `process_async` returns. Whichever
/// arrives second gets the exchange back and continues; the decision does not
/// depend on the boolean the nested processor returned.
#[derive(Clone)]
pub struct StepHandoff {
    state: Arc<Mutex<HandoffState>>,
}

impl Default for StepHandoff {
    fn default() -> Self {
        Self::new()
    }
}

impl StepHandoff {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(HandoffState::Pending)),
        }
    }

    /// Callback side. `Some` means the caller already returned and the callback
    /// must continue with the exchange itself.
    pub fn complete(&self, exchange: Exchange) -> Option<Exchange> {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, HandoffState::Pending) {
            HandoffState::Returned => Some(exchange),
            HandoffState::Pending => {
                *state = HandoffState::Parked(exchange);
                None
            }
            HandoffState::Parked(previous) => {
                error!(exchange_id = %previous.id(), "Step completed twice");
                *state = HandoffState::Parked(previous);
                None
            }
        }
    }

    /// Caller side. `Some` means the step already completed and the caller
    /// continues synchronously.
    pub fn returned(&self) -> Option<Exchange> {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, HandoffState::Returned) {
            HandoffState::Parked(exchange) => Some(exchange),
            HandoffState::Pending | HandoffState::Returned => None,
        }
    }
}

// ============================================================================
// Adapters
// ============================================================================

/// Drives `work` to completion and fires the callback exactly once.
///
/// The future is polled once on the calling task. If it is already complete the
/// callback fires synchronously and `true` is returned; otherwise the rest runs on
/// a spawned task. A panic completes the exchange with an error.
pub fn run_async<F>(exchange: Exchange, callback: AsyncCallback, work: F) -> bool
where
    F: FnOnce(Exchange) -> BoxFuture<'static, Exchange>,
{
    let guard = CompletionGuard::new(&exchange, callback);
    let mut future = AssertUnwindSafe(work(exchange)).catch_unwind().boxed();

    match (&mut future).now_or_never() {
        Some(Ok(exchange)) => {
            guard.complete(exchange, true);
            true
        }
        Some(Err(_)) => {
            error!(exchange_id = %guard.exchange_id(), "Processor panicked");
            // dropping the guard completes the exchange with an error
            drop(guard);
            true
        }
        None => {
            tokio::spawn(async move {
                match future.await {
                    Ok(exchange) => {
                        guard.complete(exchange, false);
                    }
                    Err(_) => {
                        error!(exchange_id = %guard.exchange_id(), "Processor panicked");
                    }
                }
            });
            false
        }
    }
}

/// Wraps a [`Processor`] as an [`AsyncProcessor`].
pub struct AsyncProcessorConverter {
    processor: Arc<dyn Processor>,
}

impl AsyncProcessorConverter {
    pub fn new(processor: Arc<dyn Processor>) -> Self {
        Self { processor }
    }

    pub fn convert(processor: Arc<dyn Processor>) -> Arc<dyn AsyncProcessor> {
        Arc::new(Self::new(processor))
    }
}

impl AsyncProcessor for AsyncProcessorConverter {
    fn process_async(&self, exchange: Exchange, callback: AsyncCallback) -> bool {
        let processor = self.processor.clone();
        run_async(exchange, callback, move |mut exchange| {
            async move {
                if let Err(e) = processor.process(&mut exchange).await {
                    exchange.set_exception(e);
                }
                exchange
            }
            .boxed()
        })
    }
}

/// Runs an async processor and waits for its callback.
pub async fn process_and_wait(
    processor: &dyn AsyncProcessor,
    exchange: Exchange,
) -> Result<Exchange> {
    let (tx, rx) = oneshot::channel();
    processor.process_async(
        exchange,
        AsyncCallback::new(move |exchange, _| {
            let _ = tx.send(exchange);
        }),
    );
    rx.await
        .map_err(|_| RoutingError::illegal_state("Exchange callback dropped without completion"))
}

/// Runs an async processor on an exchange owned by the caller.
pub async fn process_in_place(
    processor: &dyn AsyncProcessor,
    exchange: &mut Exchange,
) -> Result<()> {
    let taken = std::mem::take(exchange);
    *exchange = process_and_wait(processor, taken).await?;
    Ok(())
}

/// Exposes an [`AsyncProcessor`] through the awaitable [`Processor`] contract.
pub struct AwaitingProcessor {
    processor: Arc<dyn AsyncProcessor>,
}

impl AwaitingProcessor {
    pub fn new(processor: Arc<dyn AsyncProcessor>) -> Self {
        Self { processor }
    }
}

#[async_trait]
impl Processor for AwaitingProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        process_in_place(self.processor.as_ref(), exchange).await
    }
}

/// Processor built from a synchronous closure.
pub struct FnProcessor<F> {
    f: F,
}

impl<F> FnProcessor<F>
where
    F: Fn(&mut Exchange) -> Result<()> + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> Processor for FnProcessor<F>
where
    F: Fn(&mut Exchange) -> Result<()> + Send + Sync + 'static,
{
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        (self.f)(exchange)
    }
}

/// Async processor from a closure, completing synchronously.
pub fn processor_fn<F>(f: F) -> Arc<dyn AsyncProcessor>
where
    F: Fn(&mut Exchange) -> Result<()> + Send + Sync + 'static,
{
    AsyncProcessorConverter::convert(Arc::new(FnProcessor::new(f)))
}

/// Async processor that runs `f` on a spawned task and completes asynchronously.
pub fn spawn_processor_fn<F, Fut>(f: F) -> Arc<dyn AsyncProcessor>
where
    F: Fn(Exchange) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Exchange> + Send + 'static,
{
    struct Spawned<F> {
        f: Arc<F>,
    }

    impl<F, Fut> AsyncProcessor for Spawned<F>
    where
        F: Fn(Exchange) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Exchange> + Send + 'static,
    {
        fn process_async(&self, exchange: Exchange, callback: AsyncCallback) -> bool {
            let guard = CompletionGuard::new(&exchange, callback);
            let f = self.f.clone();
            tokio::spawn(async move {
                let exchange = f(exchange).await;
                guard.complete(exchange, false);
            });
            false
        }
    }

    Arc::new(Spawned { f: Arc::new(f) })
}
