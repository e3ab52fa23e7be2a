//! The hand-off between submitters and worker threads.
//!
//! A [`DispatchQueue`] is a FIFO [`crossbeam_channel`] of type-erased [`Job`]s plus a
//! [`CancelSignal`]. Dropping a [`Job`] that has not run cancels its unit, so nothing that ends up
//! discarded (by a worker noticing cancellation, a drain, or the channel being torn down) can
//! leave a waiter hanging.

use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use crossbeam_channel::{select, Receiver, Sender};

use crate::{sync::Mutex, BoxError, UnitError, WorkUnit};

/// A one-shot, broadcast cancellation flag.
///
/// Setting it is O(1) regardless of how many threads are waiting on it: the flag is flipped and a
/// channel is disconnected, which wakes every [`select!`] watching [`CancelSignal::watch`].
pub(crate) struct CancelSignal {
    flag: AtomicBool,
    trigger: Mutex<Option<Sender<()>>>,
    watch: Receiver<()>,
}

impl CancelSignal {
    pub(crate) fn new() -> Self {
        let (trigger, watch) = crossbeam_channel::bounded(0);
        Self {
            flag: AtomicBool::new(false),
            trigger: Mutex::new(Some(trigger)),
            watch,
        }
    }

    /// Sets the signal. Returns `false` if it was already set.
    pub(crate) fn cancel(&self) -> bool {
        if self.flag.swap(true, Ordering::SeqCst) {
            return false;
        }
        drop(self.trigger.lock().take());
        true
    }

    #[inline]
    pub(crate) fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// A receiver that never yields a message and becomes disconnected once the signal is set.
    pub(crate) fn watch(&self) -> &Receiver<()> {
        &self.watch
    }
}

/// A unit of work with its concrete types erased, as seen by a worker thread.
pub(crate) trait Job: Send {
    fn run(self: Box<Self>);
}

/// The [`Job`] behind every [`WorkUnit`].
pub(crate) struct Task<T, F> {
    unit: WorkUnit<T>,
    func: Option<F>,
    /// Cancellation of the batch this unit belongs to, if any.
    scope: Option<Arc<CancelSignal>>,
}

impl<T, F> Task<T, F>
where
    T: Send + Sync + 'static,
    F: FnOnce() -> Result<T, BoxError> + Send + 'static,
{
    pub(crate) fn new(unit: WorkUnit<T>, func: F, scope: Option<Arc<CancelSignal>>) -> Self {
        Self {
            unit,
            func: Some(func),
            scope,
        }
    }
}

impl<T, F> Job for Task<T, F>
where
    T: Send + Sync + 'static,
    F: FnOnce() -> Result<T, BoxError> + Send + 'static,
{
    fn run(mut self: Box<Self>) {
        if self.scope.as_ref().is_some_and(|scope| scope.is_cancelled()) {
            // Dropping `self` cancels the unit.
            return;
        }
        if !self.unit.claim() {
            // Cancelled between enqueue and dequeue.
            self.func = None;
            return;
        }
        let Some(func) = self.func.take() else {
            return;
        };

        let outcome = match panic::catch_unwind(AssertUnwindSafe(func)) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(UnitError::Failed(err)),
            Err(payload) => {
                let err = UnitError::from_panic(&*payload);
                log::debug!("contained panic in work unit: {err}");
                Err(err)
            }
        };
        self.unit.finish(outcome);
    }
}

impl<T, F> Drop for Task<T, F> {
    fn drop(&mut self) {
        if self.func.take().is_some() {
            self.unit.cancel();
        }
    }
}

pub(crate) type BoxJob = Box<dyn Job>;

/// Result of a worker's attempt to take the next job.
pub(crate) enum Pop {
    Job(BoxJob),
    /// The queue was closed and fully drained, or cancelled.
    Exhausted,
}

/// The FIFO queue of one pool generation.
pub(crate) struct DispatchQueue {
    /// `None` once the queue has been closed. Submitters clone it while holding the pool lock.
    sender: Option<Sender<BoxJob>>,
    receiver: Receiver<BoxJob>,
    cancel: Arc<CancelSignal>,
}

impl DispatchQueue {
    /// Creates a queue. `capacity` of `None` means unbounded.
    pub(crate) fn new(capacity: Option<usize>) -> Self {
        let (sender, receiver) = match capacity {
            Some(cap) => crossbeam_channel::bounded(cap),
            None => crossbeam_channel::unbounded(),
        };
        Self {
            sender: Some(sender),
            receiver,
            cancel: Arc::new(CancelSignal::new()),
        }
    }

    /// Returns a handle that can push into this queue, or `None` if the queue has been closed.
    pub(crate) fn pusher(&self) -> Option<Pusher> {
        Some(Pusher {
            sender: self.sender.clone()?,
            receiver: self.receiver.clone(),
            cancel: self.cancel.clone(),
        })
    }

    pub(crate) fn popper(&self) -> Popper {
        Popper {
            receiver: self.receiver.clone(),
            cancel: self.cancel.clone(),
        }
    }

    /// Stops accepting new jobs. Jobs already in the queue are still handed out.
    pub(crate) fn close(&mut self) {
        self.sender = None;
    }

    /// Stops handing out jobs. Jobs still in the queue are cancelled once a [`Popper`] drains it.
    pub(crate) fn cancel(&mut self) -> bool {
        self.close();
        self.cancel.cancel()
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Submitting end of a [`DispatchQueue`].
pub(crate) struct Pusher {
    sender: Sender<BoxJob>,
    receiver: Receiver<BoxJob>,
    cancel: Arc<CancelSignal>,
}

impl Pusher {
    /// Enqueues `job`.
    ///
    /// With a bounded queue this blocks while the queue is full, unless the queue gets cancelled,
    /// in which case `job` is dropped (and thereby cancelled).
    pub(crate) fn push(self, job: BoxJob) {
        select! {
            send(self.sender, job) -> res => drop(res),
            recv(self.cancel.watch()) -> _ => {}
        }

        // A cancel that raced with this push may have already had its queue drained by the
        // workers. Make sure the job does not get stranded.
        if self.cancel.is_cancelled() {
            drain(&self.receiver);
        }
    }
}

/// Consuming end of a [`DispatchQueue`], owned by a worker thread.
pub(crate) struct Popper {
    receiver: Receiver<BoxJob>,
    cancel: Arc<CancelSignal>,
}

impl Popper {
    /// Blocks until a job is available, the queue is closed and empty, or the queue is cancelled.
    pub(crate) fn pop(&self) -> Pop {
        if self.cancel.is_cancelled() {
            return Pop::Exhausted;
        }
        select! {
            recv(self.receiver) -> job => match job {
                // `select!` picks randomly among ready operations, so check again.
                Ok(job) if !self.cancel.is_cancelled() => Pop::Job(job),
                Ok(job) => {
                    drop(job);
                    Pop::Exhausted
                }
                Err(_) => Pop::Exhausted,
            },
            recv(self.cancel.watch()) -> _ => Pop::Exhausted,
        }
    }

    /// Cancels every job still sitting in the queue, if the queue was cancelled.
    pub(crate) fn drain_if_cancelled(&self) {
        if self.cancel.is_cancelled() {
            drain(&self.receiver);
        }
    }
}

fn drain(receiver: &Receiver<BoxJob>) {
    let dropped = receiver.try_iter().count();
    if dropped > 0 {
        log::trace!("cancelled {dropped} queued work units");
    }
}
