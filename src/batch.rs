use std::{collections::HashMap, fmt, mem, sync::Arc};

use crossbeam_channel::{Receiver, Sender};

use crate::{
    dispatch::CancelSignal,
    pool::{self, PoolShared},
    sync::Mutex,
    unit::Observer,
    BoxError, QueueError, WorkUnit,
};

/// A group of [`WorkUnit`]s submitted through a [`Pool`], whose results can be consumed as a
/// stream while more units are still being queued.
///
/// Obtained from [`Pool::batch`]. [`Batch`] is cheap to clone; all clones refer to the same
/// batch, so one thread can [`queue`] units while another iterates over the [`results`].
///
/// # Completing a batch
///
/// The [`results`] iterator only ends once [`Batch::queue_complete`] has been called *and* every
/// queued unit has completed. **If `queue_complete` is never called, iterating over the results
/// blocks forever.** The batch has no way to tell a producer that is still working apart from one
/// that forgot to mark the batch as complete. [`Batch::cancel`] marks the batch complete
/// implicitly.
///
/// [`Pool`]: crate::Pool
/// [`Pool::batch`]: crate::Pool::batch
/// [`queue`]: Batch::queue
/// [`results`]: Batch::results
pub struct Batch<T> {
    pool: Arc<PoolShared>,
    generation: u64,
    shared: Arc<BatchShared<T>>,
}

struct BatchShared<T> {
    state: Mutex<BatchState<T>>,
    cancel: Arc<CancelSignal>,
    results: Receiver<WorkUnit<T>>,
}

struct BatchState<T> {
    queued: usize,
    completed: usize,
    complete: bool,
    /// Dropped once the batch is complete and every unit has reported back, which ends the
    /// [`Results`] iterators.
    sender: Option<Sender<WorkUnit<T>>>,
    next_id: u64,
    /// Units that have not completed yet, keyed by their id within the batch.
    members: HashMap<u64, WorkUnit<T>>,
}

impl<T> BatchState<T> {
    fn close_if_finished(&mut self) {
        if self.complete && self.completed == self.queued && self.sender.take().is_some() {
            log::trace!("batch finished with {} units", self.queued);
        }
    }
}

impl<T> BatchShared<T> {
    fn unit_done(&self, id: u64, unit: WorkUnit<T>) {
        let mut state = self.state.lock();
        state.members.remove(&id);
        state.completed += 1;
        if let Some(sender) = &state.sender {
            // All `Results` may have been dropped; nobody is interested then.
            sender.send(unit).ok();
        }
        state.close_if_finished();
    }
}

impl<T> Clone for Batch<T> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            generation: self.generation,
            shared: self.shared.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> Batch<T> {
    pub(crate) fn new(pool: Arc<PoolShared>) -> Self {
        let (sender, results) = crossbeam_channel::unbounded();
        Self {
            generation: pool.generation(),
            pool,
            shared: Arc::new(BatchShared {
                state: Mutex::new(BatchState {
                    queued: 0,
                    completed: 0,
                    complete: false,
                    sender: Some(sender),
                    next_id: 0,
                    members: HashMap::new(),
                }),
                cancel: Arc::new(CancelSignal::new()),
                results,
            }),
        }
    }

    /// Submits a unit of work as part of this batch and returns a handle to it.
    ///
    /// Returns [`QueueError::BatchComplete`] after [`Batch::queue_complete`] or [`Batch::cancel`]
    /// has been called, and [`QueueError::PoolClosed`] if the pool has been closed, cancelled or
    /// reset since the batch was opened.
    pub fn queue<F, E>(&self, f: F) -> Result<WorkUnit<T>, QueueError>
    where
        E: Into<BoxError>,
        F: FnOnce() -> Result<T, E> + Send + 'static,
    {
        let pusher = self.pool.pusher(Some(self.generation))?;

        let unit = {
            let mut state = self.shared.state.lock();
            if state.complete {
                return Err(QueueError::BatchComplete);
            }
            state.queued += 1;
            let id = state.next_id;
            state.next_id += 1;

            let shared = self.shared.clone();
            let observer: Observer<T> = Box::new(move |unit| shared.unit_done(id, unit));
            let unit = WorkUnit::new(Some(observer));
            state.members.insert(id, unit.clone());
            unit
        };

        // The batch lock must not be held here: a push that gets cancelled completes the unit
        // right away, which calls back into `unit_done`.
        pool::submit_unit(pusher, Some(self.shared.cancel.clone()), unit.clone(), f);
        Ok(unit)
    }

    /// Marks that no more units will be queued into this batch.
    ///
    /// Calling this is required for [`Batch::results`] to ever end. Calling it more than once
    /// has no further effect.
    pub fn queue_complete(&self) {
        let mut state = self.shared.state.lock();
        state.complete = true;
        state.close_if_finished();
    }

    /// Cancels the batch.
    ///
    /// This implicitly calls [`Batch::queue_complete`], then cancels every member unit that has
    /// not started running yet; those complete with
    /// [`UnitError::Cancelled`][crate::UnitError::Cancelled]. Units that are already running are
    /// not interrupted. The [`Batch::results`] iterator still yields every unit and then ends.
    pub fn cancel(&self) {
        let members = {
            let mut state = self.shared.state.lock();
            state.complete = true;
            state.close_if_finished();
            mem::take(&mut state.members)
        };
        if self.shared.cancel.cancel() {
            log::debug!("cancelling batch of {} units", members.len());
        }
        for unit in members.values() {
            unit.cancel();
        }
    }

    /// Returns an iterator over the units of this batch, in the order they complete.
    ///
    /// Every unit yielded has already completed, so [`WorkUnit::wait`] returns immediately.
    /// Each unit is yielded once, across all [`Results`] obtained from the same batch; once the
    /// batch has finished, the iterator ends and cannot be restarted.
    pub fn results(&self) -> Results<T> {
        Results {
            receiver: self.shared.results.clone(),
        }
    }

    /// Returns the number of units queued into this batch so far.
    pub fn len(&self) -> usize {
        self.shared.state.lock().queued
    }

    /// Returns `true` if no unit has been queued into this batch yet.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` once [`Batch::queue_complete`] or [`Batch::cancel`] has been called.
    pub fn is_complete(&self) -> bool {
        self.shared.state.lock().complete
    }
}

impl<T> fmt::Debug for Batch<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("Batch")
            .field("queued", &state.queued)
            .field("completed", &state.completed)
            .field("complete", &state.complete)
            .finish_non_exhaustive()
    }
}

/// A blocking [`Iterator`] over the completed units of a [`Batch`].
///
/// Created by [`Batch::results`].
pub struct Results<T> {
    receiver: Receiver<WorkUnit<T>>,
}

impl<T> Iterator for Results<T> {
    type Item = WorkUnit<T>;

    fn next(&mut self) -> Option<Self::Item> {
        self.receiver.recv().ok()
    }
}
