//! Write-once results of quorum operations.

use std::{
    fmt::{self, Debug, Formatter},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use futures::future::AbortHandle;
use tracing::debug;

use crate::common::Peer;

/// Per-peer results, in the order they arrived.
///
/// A peer appears at most once.
pub type RawResults<T> = Vec<(Peer, T)>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FutureStatus {
    Pending,
    Ok,
    /// Failed with a reason.
    Failed(String),
}

#[derive(Debug, Clone, Default)]
/// Abort handles of the requests an operation has in flight.
pub struct Cancellation {
    inner: Arc<Mutex<CancellationState>>,
}

#[derive(Debug, Default)]
struct CancellationState {
    cancelled: bool,
    handles: Vec<AbortHandle>,
}

impl Cancellation {
    /// Track a request, aborting it right away if already cancelled.
    pub fn register(&self, handle: AbortHandle) {
        let mut state = self.state();

        if state.cancelled {
            handle.abort();
        } else {
            state.handles.push(handle);
        }
    }

    /// Abort every tracked request. Idempotent.
    pub fn cancel(&self) {
        let mut state = self.state();

        state.cancelled = true;

        for handle in state.handles.drain(..) {
            handle.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state().cancelled
    }

    fn state(&self) -> MutexGuard<'_, CancellationState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct State<T> {
    status: FutureStatus,
    minimum_results: usize,
    raw: RawResults<T>,
    minimum_reached: bool,
    waiters: Vec<flume::Sender<()>>,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    cancellation: Cancellation,
}

/// The shared, single assignment result of one logical operation.
///
/// Completed at most once; the first call to [ResultFuture::complete] or
/// [ResultFuture::fail] wins and every later one is ignored. Clones share
/// the same result, so any number of waiters can read it afterwards.
pub struct ResultFuture<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for ResultFuture<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Debug for ResultFuture<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let state = self.state();

        f.debug_struct("ResultFuture")
            .field("status", &state.status)
            .field("results", &state.raw.len())
            .field("minimum_results", &state.minimum_results)
            .finish()
    }
}

impl<T> ResultFuture<T> {
    /// A pending future that needs `minimum_results` peer results to succeed.
    pub fn new(minimum_results: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    status: FutureStatus::Pending,
                    minimum_results,
                    raw: Vec::new(),
                    minimum_reached: false,
                    waiters: Vec::new(),
                }),
                cancellation: Cancellation::default(),
            }),
        }
    }

    /// A future that already failed, used for requests rejected before any
    /// network activity.
    pub fn failed(reason: impl Into<String>) -> Self {
        let future = Self::new(0);
        future.fail(reason);
        future
    }

    // === Getters ===

    pub fn minimum_results(&self) -> usize {
        self.state().minimum_results
    }

    pub fn status(&self) -> FutureStatus {
        self.state().status.clone()
    }

    pub fn is_completed(&self) -> bool {
        self.state().status != FutureStatus::Pending
    }

    /// Completed and enough peers answered.
    pub fn is_success(&self) -> bool {
        self.state().status == FutureStatus::Ok
    }

    pub fn failed_reason(&self) -> Option<String> {
        match &self.state().status {
            FutureStatus::Failed(reason) => Some(reason.clone()),
            _ => None,
        }
    }

    pub fn is_minimum_reached(&self) -> bool {
        self.state().minimum_reached
    }

    /// Number of peers that answered.
    pub fn results_len(&self) -> usize {
        self.state().raw.len()
    }

    /// Read the per-peer results without copying them.
    pub fn with_raw<R>(&self, f: impl FnOnce(&RawResults<T>) -> R) -> R {
        f(&self.state().raw)
    }

    pub fn cancellation(&self) -> &Cancellation {
        &self.inner.cancellation
    }

    // === Public Methods ===

    /// Complete with the per-peer results.
    ///
    /// Returns `false` if the future was already completed.
    pub fn complete(&self, raw: RawResults<T>) -> bool {
        let mut state = self.state();

        if state.status != FutureStatus::Pending {
            return false;
        }

        let minimum_results = state.minimum_results;

        state.minimum_reached = raw.len() >= minimum_results;
        state.status = if state.minimum_reached {
            FutureStatus::Ok
        } else {
            FutureStatus::Failed(format!(
                "Expected at least {} results, got {}",
                minimum_results,
                raw.len()
            ))
        };
        state.raw = raw;

        debug!(status = ?state.status, "ResultFuture completed");

        notify(&mut state);

        true
    }

    /// Lower the number of results needed to succeed, usually to what the
    /// routed peers can deliver at all.
    ///
    /// Never raises the minimum, and is ignored once completed.
    pub fn narrow_minimum_results(&self, minimum_results: usize) {
        let mut state = self.state();

        if state.status == FutureStatus::Pending {
            state.minimum_results = state.minimum_results.min(minimum_results);
        }
    }

    /// Fail with a reason.
    ///
    /// Returns `false` if the future was already completed.
    pub fn fail(&self, reason: impl Into<String>) -> bool {
        let mut state = self.state();

        if state.status != FutureStatus::Pending {
            return false;
        }

        state.status = FutureStatus::Failed(reason.into());

        debug!(status = ?state.status, "ResultFuture failed");

        notify(&mut state);

        true
    }

    /// Abort every request in flight and fail if still pending.
    pub fn cancel(&self) {
        self.inner.cancellation.cancel();
        self.fail("Cancelled");
    }

    /// Wait for completion.
    pub async fn wait(&self) {
        let receiver = {
            let mut state = self.state();

            if state.status != FutureStatus::Pending {
                return;
            }

            let (sender, receiver) = flume::bounded::<()>(1);
            state.waiters.push(sender);

            receiver
        };

        let _ = receiver.recv_async().await;
    }

    /// Block the current thread until completion.
    pub fn await_completion(&self) {
        let receiver = {
            let mut state = self.state();

            if state.status != FutureStatus::Pending {
                return;
            }

            let (sender, receiver) = flume::bounded::<()>(1);
            state.waiters.push(sender);

            receiver
        };

        let _ = receiver.recv();
    }

    // === Private Methods ===

    fn state(&self) -> MutexGuard<'_, State<T>> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Clone> ResultFuture<T> {
    /// A copy of the per-peer results.
    pub fn raw(&self) -> RawResults<T> {
        self.state().raw.clone()
    }
}

fn notify<T>(state: &mut State<T>) {
    for waiter in state.waiters.drain(..) {
        let _ = waiter.try_send(());
    }
}
