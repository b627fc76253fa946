//! Sequential cancelling request runner.
//!
//! Wraps an operation factory so that triggering it again while an earlier
//! invocation is still pending cancels the earlier one. Only the newest
//! invocation is considered live; superseded ones resolve with
//! [`RequestError::Cancelled`].
//!
//! Cancellation is cooperative: the factory receives a [`CancellationToken`]
//! and is expected to stop its own work once the token fires. The runner
//! itself never retries and never logs.

use futures::future::{BoxFuture, FutureExt};
use std::future::Future;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, MutexGuard, PoisonError, RwLock,
};
use tokio_util::sync::CancellationToken;

/// Outcome of a triggered request that did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError<E> {
    /// Superseded by a newer trigger, or cancelled before it started.
    #[error("request cancelled")]
    Cancelled,
    /// The operation itself failed.
    #[error("{0}")]
    Operation(E),
}

impl<E> RequestError<E> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RequestError::Cancelled)
    }
}

/// A factory producing one fresh operation per trigger.
pub type OperationFactory<T, E> =
    dyn Fn(CancellationToken) -> BoxFuture<'static, Result<T, E>> + Send + Sync;

/// Shared reference cell that always hands out the most recently stored value.
///
/// The owner keeps a clone and calls [`LatestRef::set`] whenever the value it
/// depends on changes; readers see the new value on their next [`LatestRef::get`].
pub struct LatestRef<F: ?Sized> {
    cell: Arc<RwLock<Arc<F>>>,
}

impl<F: ?Sized> Clone for LatestRef<F> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<F: ?Sized> LatestRef<F> {
    pub fn new(value: Arc<F>) -> Self {
        Self {
            cell: Arc::new(RwLock::new(value)),
        }
    }

    pub fn set(&self, value: Arc<F>) {
        *self.cell.write().unwrap_or_else(PoisonError::into_inner) = value;
    }

    pub fn get(&self) -> Arc<F> {
        Arc::clone(&self.cell.read().unwrap_or_else(PoisonError::into_inner))
    }
}

impl<T, E> LatestRef<OperationFactory<T, E>>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Build a factory cell from a closure returning any sendable future.
    pub fn from_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self::new(boxed_factory(f))
    }

    /// Swap in a new factory; subsequent triggers use it.
    pub fn replace<F, Fut>(&self, f: F)
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.set(boxed_factory(f));
    }
}

fn boxed_factory<T, E, F, Fut>(f: F) -> Arc<OperationFactory<T, E>>
where
    T: Send + 'static,
    E: Send + 'static,
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
{
    Arc::new(move |token: CancellationToken| -> BoxFuture<'static, Result<T, E>> {
        f(token).boxed()
    })
}

/// What a superseded trigger resolves with when its operation settles anyway.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SupersededPolicy {
    /// Superseded triggers always resolve with `Cancelled`, even if the
    /// operation ignores its token and completes.
    #[default]
    Reject,
    /// A superseded operation that completes anyway still hands its value to
    /// its own caller; the caller must discard stale results itself.
    Deliver,
}

/// Bookkeeping for the single live request.
struct InFlight {
    id: u64,
    cancel: CancellationToken,
}

#[derive(Default)]
struct RunnerState {
    current: Mutex<Option<InFlight>>,
    next_id: AtomicU64,
    superseded: AtomicU64,
}

impl RunnerState {
    fn lock_current(&self) -> MutexGuard<'_, Option<InFlight>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Clears the slot when the owning trigger settles, unless it was superseded.
struct SettleGuard {
    state: Arc<RunnerState>,
    id: u64,
}

impl Drop for SettleGuard {
    fn drop(&mut self) {
        let mut slot = self.state.lock_current();
        if slot.as_ref().map(|h| h.id) == Some(self.id) {
            *slot = None;
        }
    }
}

/// Runs the latest operation, cancelling whichever one was still pending.
pub struct SequentialRequest<T, E> {
    factory: LatestRef<OperationFactory<T, E>>,
    policy: SupersededPolicy,
    state: Arc<RunnerState>,
}

impl<T, E> Clone for SequentialRequest<T, E> {
    fn clone(&self) -> Self {
        Self {
            factory: self.factory.clone(),
            policy: self.policy,
            state: Arc::clone(&self.state),
        }
    }
}

impl<T, E> SequentialRequest<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    pub fn new(factory: LatestRef<OperationFactory<T, E>>) -> Self {
        Self::with_policy(factory, SupersededPolicy::default())
    }

    pub fn with_policy(factory: LatestRef<OperationFactory<T, E>>, policy: SupersededPolicy) -> Self {
        Self {
            factory,
            policy,
            state: Arc::new(RunnerState::default()),
        }
    }

    /// Start a new operation with the current factory.
    ///
    /// Any pending operation is cancelled before this returns. The returned
    /// future invokes the factory on its first poll; if the token has already
    /// fired by then the factory is never called.
    pub fn trigger(&self) -> impl Future<Output = Result<T, RequestError<E>>> + Send + 'static {
        let id = self.state.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        {
            let mut slot = self.state.lock_current();
            if let Some(previous) = slot.take() {
                previous.cancel.cancel();
                self.state.superseded.fetch_add(1, Ordering::Relaxed);
            }
            *slot = Some(InFlight {
                id,
                cancel: token.clone(),
            });
        }

        let factory = self.factory.get();
        let policy = self.policy;
        let guard = SettleGuard {
            state: Arc::clone(&self.state),
            id,
        };

        async move {
            let _guard = guard;
            if token.is_cancelled() {
                return Err(RequestError::Cancelled);
            }
            let operation = factory(token.clone());
            // The factory may have fired the token while building the operation.
            if token.is_cancelled() {
                return Err(RequestError::Cancelled);
            }

            match policy {
                SupersededPolicy::Reject => {
                    tokio::select! {
                        biased;
                        () = token.cancelled() => Err(RequestError::Cancelled),
                        result = operation => result.map_err(RequestError::Operation),
                    }
                }
                SupersededPolicy::Deliver => match operation.await {
                    Ok(value) => Ok(value),
                    Err(_) if token.is_cancelled() => Err(RequestError::Cancelled),
                    Err(e) => Err(RequestError::Operation(e)),
                },
            }
        }
    }

    /// The factory cell this runner reads from.
    pub fn factory(&self) -> &LatestRef<OperationFactory<T, E>> {
        &self.factory
    }

    /// Cancel the pending operation, if any, without starting a new one.
    pub fn cancel(&self) {
        if let Some(previous) = self.state.lock_current().take() {
            previous.cancel.cancel();
            self.state.superseded.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// True when no operation is pending.
    pub fn is_idle(&self) -> bool {
        self.state.lock_current().is_none()
    }

    /// How many times a pending operation has been cancelled.
    pub fn superseded_count(&self) -> u64 {
        self.state.superseded.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::{sleep, Instant};

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum TestError {
        Aborted,
        Failed(&'static str),
    }

    type Factory = LatestRef<OperationFactory<&'static str, TestError>>;

    /// Resolves with `label` after `delay`, aborting early if the token fires.
    fn cooperative(factory: &Factory, label: &'static str, delay: Duration) {
        factory.replace(move |token: CancellationToken| async move {
            tokio::select! {
                () = token.cancelled() => Err(TestError::Aborted),
                () = sleep(delay) => Ok(label),
            }
        });
    }

    /// Resolves with `label` after `delay` no matter what the token says.
    fn stubborn(factory: &Factory, label: &'static str, delay: Duration) {
        factory.replace(move |_token: CancellationToken| async move {
            sleep(delay).await;
            Ok(label)
        });
    }

    fn empty_factory() -> Factory {
        LatestRef::from_fn(|_token: CancellationToken| async { Err(TestError::Failed("unset")) })
    }

    #[tokio::test(start_paused = true)]
    async fn single_trigger_resolves_and_clears_slot() {
        let factory = empty_factory();
        cooperative(&factory, "A", Duration::from_millis(100));
        let runner = SequentialRequest::new(factory);

        let a = runner.trigger();
        assert!(!runner.is_idle());
        assert_eq!(a.await, Ok("A"));
        assert!(runner.is_idle());
        assert_eq!(runner.superseded_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn operation_errors_propagate_unchanged() {
        let factory: Factory =
            LatestRef::from_fn(|_token: CancellationToken| async { Err(TestError::Failed("500")) });
        let runner = SequentialRequest::new(factory);

        assert_eq!(
            runner.trigger().await,
            Err(RequestError::Operation(TestError::Failed("500")))
        );
        assert!(runner.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn first_trigger_never_cancels_anything() {
        let seen = Arc::new(Mutex::new(Vec::<CancellationToken>::new()));
        let seen2 = seen.clone();
        let factory: Factory = LatestRef::from_fn(move |token: CancellationToken| {
            seen2.lock().unwrap().push(token);
            async { Ok("ok") }
        });
        let runner = SequentialRequest::new(factory);

        assert_eq!(runner.trigger().await, Ok("ok"));
        assert_eq!(runner.trigger().await, Ok("ok"));

        assert_eq!(runner.superseded_count(), 0);
        let tokens = seen.lock().unwrap();
        assert_eq!(tokens.len(), 2);
        assert!(tokens.iter().all(|t| !t.is_cancelled()));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_then_fast_only_latest_resolves() {
        let factory = empty_factory();
        let runner = SequentialRequest::new(factory.clone());
        let start = Instant::now();

        cooperative(&factory, "A", Duration::from_millis(100));
        let mut a = Box::pin(runner.trigger());
        assert!(futures::poll!(&mut a).is_pending());

        cooperative(&factory, "B", Duration::from_millis(10));
        let b = runner.trigger();

        assert_eq!(a.await, Err(RequestError::Cancelled));
        assert_eq!(b.await, Ok("B"));
        assert_eq!(start.elapsed(), Duration::from_millis(10));
        assert!(runner.is_idle());
        assert_eq!(runner.superseded_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn three_overlapping_triggers_cancel_twice() {
        let factory = empty_factory();
        let runner = SequentialRequest::new(factory.clone());

        cooperative(&factory, "A", Duration::from_millis(30));
        let mut a = Box::pin(runner.trigger());
        assert!(futures::poll!(&mut a).is_pending());
        cooperative(&factory, "B", Duration::from_millis(20));
        let mut b = Box::pin(runner.trigger());
        assert!(futures::poll!(&mut b).is_pending());
        cooperative(&factory, "C", Duration::from_millis(10));
        let c = runner.trigger();

        let (a, b, c) = tokio::join!(a, b, c);
        assert_eq!(a, Err(RequestError::Cancelled));
        assert_eq!(b, Err(RequestError::Cancelled));
        assert_eq!(c, Ok("C"));
        assert_eq!(runner.superseded_count(), 2);
        assert!(runner.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn n_overlapping_triggers_only_last_resolves() {
        let factory = empty_factory();
        let runner = SequentialRequest::new(factory.clone());
        let labels = ["1", "2", "3", "4", "5", "6"];

        let mut pending = Vec::new();
        for label in labels {
            cooperative(&factory, label, Duration::from_millis(50));
            let mut fut = Box::pin(runner.trigger());
            assert!(futures::poll!(&mut fut).is_pending());
            pending.push(fut);
        }

        let results = futures::future::join_all(pending).await;
        let (last, earlier) = results.split_last().unwrap();
        assert_eq!(*last, Ok("6"));
        assert!(earlier.iter().all(|r| r == &Err(RequestError::Cancelled)));
        assert_eq!(runner.superseded_count(), labels.len() as u64 - 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unpolled_superseded_trigger_never_invokes_factory() {
        let calls = Arc::new(AtomicU64::new(0));
        let calls2 = calls.clone();
        let factory: Factory = LatestRef::from_fn(move |_token: CancellationToken| {
            calls2.fetch_add(1, Ordering::SeqCst);
            async { Ok("ran") }
        });
        let runner = SequentialRequest::new(factory);

        let a = runner.trigger();
        let b = runner.trigger();

        assert_eq!(a.await, Err(RequestError::Cancelled));
        assert_eq!(b.await, Ok("ran"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn token_cancelled_inside_factory_fails_instead_of_hanging() {
        let factory: Factory = LatestRef::from_fn(|token: CancellationToken| {
            token.cancel();
            futures::future::pending::<Result<&'static str, TestError>>()
        });
        let runner = SequentialRequest::new(factory);

        let result = tokio::time::timeout(Duration::from_secs(1), runner.trigger()).await;
        assert_eq!(result, Ok(Err(RequestError::Cancelled)));
        assert!(runner.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn trigger_reads_factory_at_call_time() {
        let factory = empty_factory();
        let runner = SequentialRequest::new(factory.clone());

        cooperative(&factory, "old", Duration::from_millis(5));
        let first = runner.trigger();
        // Replacing after the trigger must not affect the pending call.
        cooperative(&factory, "new", Duration::from_millis(5));

        assert_eq!(first.await, Ok("old"));
        assert_eq!(runner.trigger().await, Ok("new"));
    }

    #[tokio::test(start_paused = true)]
    async fn reject_policy_hides_stale_result_of_stubborn_operation() {
        let factory = empty_factory();
        let runner = SequentialRequest::new(factory.clone());

        stubborn(&factory, "stale", Duration::from_millis(10));
        let mut a = Box::pin(runner.trigger());
        assert!(futures::poll!(&mut a).is_pending());
        stubborn(&factory, "fresh", Duration::from_millis(50));
        let b = runner.trigger();

        let (a, b) = tokio::join!(a, b);
        assert_eq!(a, Err(RequestError::Cancelled));
        assert_eq!(b, Ok("fresh"));
    }

    #[tokio::test(start_paused = true)]
    async fn deliver_policy_hands_stale_result_to_its_caller() {
        let factory = empty_factory();
        let runner = SequentialRequest::with_policy(factory.clone(), SupersededPolicy::Deliver);

        stubborn(&factory, "stale", Duration::from_millis(10));
        let mut a = Box::pin(runner.trigger());
        assert!(futures::poll!(&mut a).is_pending());
        stubborn(&factory, "fresh", Duration::from_millis(50));
        let mut b = Box::pin(runner.trigger());
        assert!(futures::poll!(&mut b).is_pending());

        assert_eq!(a.await, Ok("stale"));
        // The stale settlement must not clear the newer handle.
        assert!(!runner.is_idle());
        assert_eq!(b.await, Ok("fresh"));
        assert!(runner.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn deliver_policy_maps_cooperative_abort_to_cancelled() {
        let factory = empty_factory();
        let runner = SequentialRequest::with_policy(factory.clone(), SupersededPolicy::Deliver);

        cooperative(&factory, "A", Duration::from_millis(100));
        let mut a = Box::pin(runner.trigger());
        assert!(futures::poll!(&mut a).is_pending());
        cooperative(&factory, "B", Duration::from_millis(10));
        let b = runner.trigger();

        assert_eq!(a.await, Err(RequestError::Cancelled));
        assert_eq!(b.await, Ok("B"));
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_cancel_settles_pending_trigger() {
        let factory = empty_factory();
        cooperative(&factory, "A", Duration::from_millis(100));
        let runner = SequentialRequest::new(factory);

        let mut a = Box::pin(runner.trigger());
        assert!(futures::poll!(&mut a).is_pending());
        runner.cancel();

        assert!(runner.is_idle());
        assert_eq!(a.await, Err(RequestError::Cancelled));
        // Nothing left to cancel.
        runner.cancel();
        assert_eq!(runner.superseded_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_trigger_future_frees_slot() {
        let factory = empty_factory();
        cooperative(&factory, "A", Duration::from_millis(100));
        let runner = SequentialRequest::new(factory);

        let a = runner.trigger();
        assert!(!runner.is_idle());
        drop(a);
        assert!(runner.is_idle());
    }
}
