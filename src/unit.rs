use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        Arc, OnceLock,
    },
    task::{Context, Poll, Waker},
    time::Duration,
};

use crate::{
    sync::{Condvar, Mutex},
    UnitError,
};

/// Queued, not yet picked up by a worker.
const PENDING: u8 = 0;
/// A worker (or the cancellation path) has claimed the unit; it will be finished exactly once.
const CLAIMED: u8 = 1;

/// Called with the unit right after its completion signal fires.
pub(crate) type Observer<T> = Box<dyn FnOnce(WorkUnit<T>) + Send>;

/// A handle to one submitted unit of work and its eventual outcome.
///
/// [`WorkUnit`]s are returned by [`Pool::queue`] and [`Batch::queue`]. The handle is cheap to
/// clone; every clone refers to the same unit, and any number of threads may wait for it.
///
/// Once complete, a unit holds exactly one of:
///
/// - the value returned by its work function,
/// - [`UnitError::Failed`] with the error returned by its work function,
/// - [`UnitError::Panicked`] if the work function panicked,
/// - [`UnitError::Cancelled`] if it was cancelled before a worker started running it.
///
/// [`Pool::queue`]: crate::Pool::queue
/// [`Batch::queue`]: crate::Batch::queue
pub struct WorkUnit<T> {
    shared: Arc<Shared<T>>,
}

struct Shared<T> {
    phase: AtomicU8,
    cancel_requested: AtomicBool,
    /// Written once by whoever claimed the unit, strictly before the signal fires.
    outcome: OnceLock<Result<T, UnitError>>,
    signal: Mutex<Signal>,
    condvar: Condvar,
    observer: Mutex<Option<Observer<T>>>,
}

#[derive(Default)]
struct Signal {
    fired: bool,
    wakers: Vec<Waker>,
}

impl<T> Clone for WorkUnit<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> WorkUnit<T> {
    pub(crate) fn new(observer: Option<Observer<T>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                phase: AtomicU8::new(PENDING),
                cancel_requested: AtomicBool::new(false),
                outcome: OnceLock::new(),
                signal: Mutex::new(Signal::default()),
                condvar: Condvar::new(),
                observer: Mutex::new(observer),
            }),
        }
    }

    /// Claims the unit so it can be finished. Returns `false` if someone else (a worker, or a
    /// cancellation) got there first.
    pub(crate) fn claim(&self) -> bool {
        self.shared
            .phase
            .compare_exchange(PENDING, CLAIMED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Stores the outcome and fires the completion signal. Only the claimant may call this.
    pub(crate) fn finish(&self, outcome: Result<T, UnitError>) {
        if self.shared.outcome.set(outcome).is_err() {
            unreachable!("work unit finished twice");
        }

        let wakers = {
            let mut signal = self.shared.signal.lock();
            signal.fired = true;
            std::mem::take(&mut signal.wakers)
        };
        self.shared.condvar.notify_all();
        wakers.into_iter().for_each(Waker::wake);

        let observer = self.shared.observer.lock().take();
        if let Some(observer) = observer {
            observer(self.clone());
        }
    }

    /// Requests cancellation of this unit.
    ///
    /// If no worker has started running the unit yet, it is completed right away with
    /// [`UnitError::Cancelled`] and its work function is never called; `true` is returned in that
    /// case. If the unit is already running or complete, it is left alone and `false` is
    /// returned: a running work function is never interrupted.
    pub fn cancel(&self) -> bool {
        self.shared.cancel_requested.store(true, Ordering::Release);
        if self.claim() {
            log::trace!("work unit cancelled before it ran");
            self.finish(Err(UnitError::Cancelled));
            true
        } else {
            false
        }
    }

    /// Returns whether [`WorkUnit::cancel`] has been called on this unit, whether or not it took
    /// effect.
    pub fn cancel_requested(&self) -> bool {
        self.shared.cancel_requested.load(Ordering::Acquire)
    }

    /// Blocks the calling thread until the unit has completed, and returns its outcome.
    ///
    /// This can be called any number of times, from any number of threads, and always returns
    /// the same outcome.
    pub fn wait(&self) -> Result<&T, &UnitError> {
        let signal = self.shared.signal.lock();
        drop(self.shared.condvar.wait_while(signal, |s| !s.fired));
        self.outcome()
    }

    /// Like [`WorkUnit::wait`], but gives up after `timeout`, returning [`None`].
    ///
    /// Timing out does not affect the unit. To abandon it, call [`WorkUnit::cancel`].
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<&T, &UnitError>> {
        let signal = self.shared.signal.lock();
        let (signal, _) = self
            .shared
            .condvar
            .wait_timeout_while(signal, timeout, |s| !s.fired);
        if !signal.fired {
            return None;
        }
        drop(signal);
        Some(self.outcome())
    }

    /// Returns a [`Future`] that resolves to the unit's outcome once it has completed.
    ///
    /// The future does not depend on any particular async runtime.
    pub fn completion(&self) -> Completion<'_, T> {
        Completion { unit: self }
    }

    /// Returns the outcome if the unit has completed, without blocking.
    pub fn try_result(&self) -> Option<Result<&T, &UnitError>> {
        self.shared.outcome.get().map(Result::as_ref)
    }

    /// Returns the produced value, if the unit completed successfully.
    pub fn value(&self) -> Option<&T> {
        self.try_result()?.ok()
    }

    /// Returns the error, if the unit completed unsuccessfully.
    pub fn error(&self) -> Option<&UnitError> {
        self.try_result()?.err()
    }

    /// Returns `true` once the unit has an outcome, so [`WorkUnit::wait`] would not block.
    #[inline]
    pub fn is_done(&self) -> bool {
        self.shared.outcome.get().is_some()
    }

    /// Returns `true` if the unit completed without running because it was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.error().is_some_and(UnitError::is_cancelled)
    }

    fn outcome(&self) -> Result<&T, &UnitError> {
        match self.shared.outcome.get() {
            Some(outcome) => outcome.as_ref(),
            None => unreachable!("completion signal fired without an outcome"),
        }
    }
}

impl<T> fmt::Debug for WorkUnit<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.shared.outcome.get() {
            Some(Ok(_)) => "ok",
            Some(Err(UnitError::Cancelled)) => "cancelled",
            Some(Err(_)) => "failed",
            None if self.shared.phase.load(Ordering::Acquire) == PENDING => "pending",
            None => "running",
        };
        f.debug_struct("WorkUnit")
            .field("state", &state)
            .finish_non_exhaustive()
    }
}

/// Future returned by [`WorkUnit::completion`].
pub struct Completion<'a, T> {
    unit: &'a WorkUnit<T>,
}

impl<'a, T> Future for Completion<'a, T> {
    type Output = Result<&'a T, &'a UnitError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let unit = self.unit;
        let mut signal = unit.shared.signal.lock();
        if signal.fired {
            drop(signal);
            return Poll::Ready(unit.outcome());
        }

        if !signal.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            signal.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}
