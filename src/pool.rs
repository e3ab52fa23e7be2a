use std::{io, mem, sync::Arc};

use crate::{
    batch::Batch,
    dispatch::{CancelSignal, DispatchQueue, Pusher, Task},
    sync::RwLock,
    worker::{self, WorkerSet},
    BoxError, QueueError, ResetError, WorkUnit,
};

/// A builder object that can be used to configure and spawn a [`Pool`].
#[derive(Debug, Clone)]
pub struct PoolBuilder {
    name: Option<String>,
    workers: usize,
    capacity: Option<usize>,
}

impl PoolBuilder {
    /// Sets the base name of the [`Pool`]'s worker threads.
    ///
    /// Each thread spawned will be named according to this base name and its index.
    pub fn name<N: Into<String>>(self, name: N) -> Self {
        Self {
            name: Some(name.into()),
            ..self
        }
    }

    /// Sets the number of worker threads.
    ///
    /// Defaults to the number of logical CPUs. Spawning a pool with 0 workers panics.
    #[inline]
    pub fn workers(self, workers: usize) -> Self {
        Self { workers, ..self }
    }

    /// Bounds the number of units that can wait in the queue.
    ///
    /// By default the queue is unbounded and [`Pool::queue`] never blocks. With a capacity set,
    /// [`Pool::queue`] blocks while the queue is full (a capacity of 0 makes every submission
    /// wait for an idle worker). A blocked submission is released by [`Pool::cancel`], and the
    /// unit it carried is cancelled.
    #[inline]
    pub fn capacity(self, capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..self
        }
    }

    /// Spawns the worker threads and returns the [`Pool`].
    pub fn spawn(self) -> io::Result<Pool> {
        let generation = Generation::spawn(&self, 0)?;
        Ok(Pool {
            shared: Arc::new(PoolShared {
                config: self,
                inner: RwLock::new(Inner {
                    lifecycle: Lifecycle::Open,
                    generation,
                }),
            }),
        })
    }
}

/// The externally visible lifecycle state of a [`Pool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    /// Accepting work.
    Open,
    /// [`Pool::close`] was called; queued units are still being worked off.
    Closing,
    /// [`Pool::cancel`] was called; workers are finishing the unit they are running.
    Cancelling,
    /// Every worker of the current generation has exited. The pool can be [`Pool::reset`].
    Drained,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Open,
    Closed,
    Cancelled,
}

/// One queue and the set of workers consuming it, from spawn (or reset) to close (or cancel).
struct Generation {
    id: u64,
    queue: DispatchQueue,
    workers: WorkerSet,
}

impl Generation {
    fn spawn(config: &PoolBuilder, id: u64) -> io::Result<Self> {
        let queue = DispatchQueue::new(config.capacity);
        let workers = WorkerSet::spawn(config.name.as_deref(), config.workers, &queue)?;
        Ok(Self { id, queue, workers })
    }
}

struct Inner {
    lifecycle: Lifecycle,
    generation: Generation,
}

pub(crate) struct PoolShared {
    config: PoolBuilder,
    inner: RwLock<Inner>,
}

impl PoolShared {
    pub(crate) fn generation(&self) -> u64 {
        self.inner.read().generation.id
    }

    /// Returns a [`Pusher`] for the current generation, if it is open and (when given) has the
    /// expected id.
    pub(crate) fn pusher(&self, generation: Option<u64>) -> Result<Pusher, QueueError> {
        let inner = self.inner.read();
        if inner.lifecycle != Lifecycle::Open {
            return Err(QueueError::PoolClosed);
        }
        if generation.is_some_and(|id| id != inner.generation.id) {
            return Err(QueueError::PoolClosed);
        }
        inner
            .generation
            .queue
            .pusher()
            .ok_or(QueueError::PoolClosed)
    }
}

/// Pushes `f` through `pusher` as the work function of `unit`.
///
/// The pool lock is not held here, so a full bounded queue only blocks the submitter.
pub(crate) fn submit_unit<T, E, F>(
    pusher: Pusher,
    scope: Option<Arc<CancelSignal>>,
    unit: WorkUnit<T>,
    f: F,
) where
    T: Send + Sync + 'static,
    E: Into<BoxError>,
    F: FnOnce() -> Result<T, E> + Send + 'static,
{
    let func = move || f().map_err(Into::into);
    pusher.push(Box::new(Task::new(unit, func, scope)));
}

/// A fixed-size pool of worker threads executing [`WorkUnit`]s.
///
/// Units can be submitted one at a time with [`Pool::queue`], or grouped into a [`Batch`] with
/// [`Pool::batch`]. Panics in work functions are caught and reported through the unit's outcome;
/// they never take down a worker.
///
/// This type enforces structured concurrency: dropping the [`Pool`] performs [`Pool::close`],
/// letting queued work finish and joining every worker thread.
///
/// # Lifecycle
///
/// A pool starts out [`PoolState::Open`]. [`Pool::close`] stops intake and waits for the queue
/// to be worked off; [`Pool::cancel`] stops intake and drops all queued units (they complete
/// with [`UnitError::Cancelled`][crate::UnitError::Cancelled]) without waiting. Once drained,
/// [`Pool::reset`] starts a fresh generation of workers with the same configuration.
pub struct Pool {
    shared: Arc<PoolShared>,
}

impl Pool {
    /// Returns a builder that can be used to configure and spawn a [`Pool`].
    #[inline]
    pub fn builder() -> PoolBuilder {
        PoolBuilder {
            name: None,
            workers: num_cpus::get(),
            capacity: None,
        }
    }

    /// Spawns a [`Pool`] with `workers` worker threads and an unbounded queue.
    ///
    /// # Panics
    ///
    /// Panics if `workers` is 0.
    pub fn new(workers: usize) -> io::Result<Pool> {
        Self::builder().workers(workers).spawn()
    }

    /// Returns the number of worker threads per generation.
    #[inline]
    pub fn worker_count(&self) -> usize {
        self.shared.config.workers
    }

    /// Submits a unit of work and returns a handle to it.
    ///
    /// This does not block unless the pool was configured with a [`PoolBuilder::capacity`] and
    /// the queue is full.
    ///
    /// Returns [`QueueError::PoolClosed`] if the pool has been closed or cancelled and not reset
    /// since.
    pub fn queue<T, E, F>(&self, f: F) -> Result<WorkUnit<T>, QueueError>
    where
        T: Send + Sync + 'static,
        E: Into<BoxError>,
        F: FnOnce() -> Result<T, E> + Send + 'static,
    {
        let pusher = self.shared.pusher(None)?;
        let unit = WorkUnit::new(None);
        submit_unit(pusher, None, unit.clone(), f);
        Ok(unit)
    }

    /// Opens a new [`Batch`] on the current generation of this pool.
    pub fn batch<T: Send + Sync + 'static>(&self) -> Batch<T> {
        Batch::new(self.shared.clone())
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> PoolState {
        let inner = self.shared.inner.read();
        match inner.lifecycle {
            Lifecycle::Open => PoolState::Open,
            _ if inner.generation.workers.is_drained() => PoolState::Drained,
            Lifecycle::Closed => PoolState::Closing,
            Lifecycle::Cancelled => PoolState::Cancelling,
        }
    }

    /// Gracefully shuts the pool down.
    ///
    /// New submissions are rejected from now on. Every unit that was already queued still runs.
    /// This blocks until the queue is empty and every worker thread has exited.
    ///
    /// Must not be called from inside a work function running on this pool, since the calling
    /// worker would wait for itself.
    pub fn close(&self) {
        let handles = {
            let mut inner = self.shared.inner.write();
            if inner.lifecycle == Lifecycle::Open {
                log::debug!("closing pool generation {}", inner.generation.id);
                inner.lifecycle = Lifecycle::Closed;
                inner.generation.queue.close();
            }
            inner.generation.workers.take_handles()
        };
        worker::join_all(handles);
    }

    /// Eagerly shuts the pool down.
    ///
    /// New submissions are rejected from now on, and every queued unit that no worker has picked
    /// up yet is completed with [`UnitError::Cancelled`][crate::UnitError::Cancelled] without
    /// running. Units that are already running are not interrupted.
    ///
    /// This never waits for running units or for workers to exit; by the time it returns, every
    /// unit that was still queued has been completed. Use [`Pool::join`] to wait for the workers.
    pub fn cancel(&self) {
        let popper = {
            let mut inner = self.shared.inner.write();
            if inner.lifecycle == Lifecycle::Cancelled {
                return;
            }
            log::debug!("cancelling pool generation {}", inner.generation.id);
            inner.lifecycle = Lifecycle::Cancelled;
            inner.generation.queue.cancel();
            inner.generation.queue.popper()
        };
        // Outside the lock: dropping a queued job runs its batch observer.
        popper.drain_if_cancelled();
    }

    /// Blocks until every worker of the current generation has exited.
    ///
    /// Returns [`ResetError::StillOpen`] instead of waiting forever if the pool is still open.
    pub fn join(&self) -> Result<(), ResetError> {
        let handles = {
            let mut inner = self.shared.inner.write();
            if inner.lifecycle == Lifecycle::Open {
                return Err(ResetError::StillOpen);
            }
            inner.generation.workers.take_handles()
        };
        worker::join_all(handles);
        Ok(())
    }

    /// Reopens a closed or cancelled pool with a fresh queue and a fresh set of workers.
    ///
    /// The previous generation must be fully drained: call [`Pool::close`], or [`Pool::cancel`]
    /// followed by [`Pool::join`], first. Otherwise [`ResetError::StillOpen`] or
    /// [`ResetError::NotDrained`] is returned and nothing changes.
    ///
    /// [`Batch`]es opened before the reset belong to the old generation and keep rejecting new
    /// units.
    pub fn reset(&self) -> Result<(), ResetError> {
        let (old, handles) = {
            let mut inner = self.shared.inner.write();
            if inner.lifecycle == Lifecycle::Open {
                return Err(ResetError::StillOpen);
            }
            if !inner.generation.workers.is_drained() {
                return Err(ResetError::NotDrained);
            }

            let id = inner.generation.id + 1;
            let generation = Generation::spawn(&self.shared.config, id)?;
            let mut old = mem::replace(&mut inner.generation, generation);
            inner.lifecycle = Lifecycle::Open;
            log::debug!("pool reset to generation {id}");
            let handles = old.workers.take_handles();
            (old, handles)
        };

        worker::join_all(handles);
        // Anything still left in the old queue is cancelled when it is dropped.
        drop(old);
        Ok(())
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashSet,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Barrier,
        },
        thread,
        time::{Duration, Instant},
    };

    use super::*;

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn doubles() {
        let pool = Pool::new(4).unwrap();
        let units: Vec<_> = (0..10)
            .map(|i| pool.queue(move || Ok::<_, BoxError>(i * 2)).unwrap())
            .collect();

        let values: HashSet<i32> = units.iter().map(|u| *u.wait().unwrap()).collect();
        assert_eq!(values, (0..10).map(|i| i * 2).collect());
        assert!(units.iter().all(|u| u.error().is_none()));
    }

    #[test]
    fn user_errors_pass_through() {
        let pool = Pool::new(2).unwrap();
        let unit = pool.queue(|| Err::<(), _>("bad input")).unwrap();
        match unit.wait() {
            Err(crate::UnitError::Failed(err)) => assert_eq!(err.to_string(), "bad input"),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(unit.value().is_none());
    }

    #[test]
    fn panic_is_contained_and_pool_keeps_working() {
        let pool = Pool::new(1).unwrap();
        let bad = pool
            .queue(|| -> Result<(), BoxError> { crate::test::silent_panic("fault") })
            .unwrap();
        assert!(bad.wait().unwrap_err().is_panic());

        let good = pool.queue(|| Ok::<_, BoxError>("after fault")).unwrap();
        assert_eq!(good.wait().ok(), Some(&"after fault"));
    }

    #[test]
    fn close_runs_queued_work() {
        let pool = Pool::new(2).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let units: Vec<_> = (0..50)
            .map(|_| {
                let ran = ran.clone();
                pool.queue(move || {
                    ran.fetch_add(1, Ordering::Relaxed);
                    Ok::<_, BoxError>(())
                })
                .unwrap()
            })
            .collect();

        pool.close();
        assert_eq!(pool.state(), PoolState::Drained);
        assert_eq!(ran.load(Ordering::Relaxed), 50);
        assert!(units.iter().all(|u| u.is_done() && !u.is_cancelled()));
        assert_eq!(
            pool.queue(|| Ok::<_, BoxError>(())).unwrap_err(),
            QueueError::PoolClosed
        );
    }

    #[test]
    fn cancel_skips_pending_units_promptly() {
        let pool = Pool::new(1).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let (started_tx, started_rx) = crossbeam_channel::bounded(0);
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);

        let running = pool
            .queue(move || {
                started_tx.send(()).unwrap();
                release_rx.recv().unwrap();
                Ok::<_, BoxError>("completed")
            })
            .unwrap();
        let pending: Vec<_> = (0..1000)
            .map(|_| {
                let ran = ran.clone();
                pool.queue(move || {
                    ran.fetch_add(1, Ordering::Relaxed);
                    Ok::<_, BoxError>(())
                })
                .unwrap()
            })
            .collect();

        started_rx.recv().unwrap();
        let start = Instant::now();
        pool.cancel();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(pool.state(), PoolState::Cancelling);
        assert_eq!(
            pool.queue(|| Ok::<_, BoxError>(())).unwrap_err(),
            QueueError::PoolClosed
        );

        // The worker is still busy, but every queued unit is already finished.
        for unit in &pending {
            assert!(unit.is_cancelled());
        }
        assert!(!running.is_done());

        release_tx.send(()).unwrap();
        assert_eq!(running.wait().ok(), Some(&"completed"));
        pool.join().unwrap();
        assert_eq!(pool.state(), PoolState::Drained);
        assert_eq!(ran.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn cancel_finishes_queued_units_while_all_workers_busy() {
        let pool = Pool::new(2).unwrap();
        let (started_tx, started_rx) = crossbeam_channel::unbounded();
        let (release_tx, release_rx) = crossbeam_channel::unbounded::<()>();
        let busy: Vec<_> = (0..2)
            .map(|_| {
                let started_tx = started_tx.clone();
                let release_rx = release_rx.clone();
                pool.queue(move || {
                    started_tx.send(()).unwrap();
                    release_rx.recv().ok();
                    Ok::<_, BoxError>(())
                })
                .unwrap()
            })
            .collect();
        let queued = pool.queue(|| Ok::<_, BoxError>(())).unwrap();

        started_rx.recv().unwrap();
        started_rx.recv().unwrap();
        pool.cancel();

        let outcome = queued.wait_timeout(Duration::from_millis(500));
        assert!(outcome.is_some(), "queued unit not finished by cancel");
        assert!(queued.is_cancelled());

        drop(release_tx);
        for unit in &busy {
            assert!(unit.wait().is_ok());
        }
        pool.join().unwrap();
    }

    #[test]
    fn close_then_reset_then_queue() {
        let pool = Pool::new(3).unwrap();
        assert!(matches!(pool.reset(), Err(ResetError::StillOpen)));
        pool.close();
        pool.reset().unwrap();
        assert_eq!(pool.state(), PoolState::Open);

        let unit = pool.queue(|| Ok::<_, BoxError>(5)).unwrap();
        assert_eq!(unit.wait().ok(), Some(&5));
    }

    #[test]
    fn reset_before_drain_fails() {
        let pool = Pool::new(1).unwrap();
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);
        let (started_tx, started_rx) = crossbeam_channel::bounded(0);
        let running = pool
            .queue(move || {
                started_tx.send(()).unwrap();
                release_rx.recv().unwrap();
                Ok::<_, BoxError>(())
            })
            .unwrap();

        started_rx.recv().unwrap();
        pool.cancel();
        assert!(matches!(pool.reset(), Err(ResetError::NotDrained)));

        release_tx.send(()).unwrap();
        running.wait().unwrap();
        pool.join().unwrap();
        pool.reset().unwrap();
        assert!(pool.queue(|| Ok::<_, BoxError>(())).unwrap().wait().is_ok());
    }

    #[test]
    fn cancel_then_reset_then_cancel_again() {
        let pool = Pool::new(2).unwrap();
        for _ in 0..3 {
            let unit = pool.queue(|| Ok::<_, BoxError>(1)).unwrap();
            unit.wait().unwrap();
            pool.cancel();
            pool.join().unwrap();
            pool.reset().unwrap();
        }
        assert_eq!(pool.state(), PoolState::Open);
    }

    #[test]
    fn join_open_pool_fails() {
        let pool = Pool::new(1).unwrap();
        assert!(matches!(pool.join(), Err(ResetError::StillOpen)));
    }

    #[test]
    fn workers_run_concurrently() {
        const WORKERS: usize = 4;
        let pool = Pool::new(WORKERS).unwrap();
        assert_eq!(pool.worker_count(), WORKERS);
        let barrier = Arc::new(Barrier::new(WORKERS));
        let units: Vec<_> = (0..WORKERS)
            .map(|_| {
                let barrier = barrier.clone();
                pool.queue(move || {
                    barrier.wait();
                    Ok::<_, BoxError>(())
                })
                .unwrap()
            })
            .collect();
        for unit in &units {
            unit.wait().unwrap();
        }
    }

    #[test]
    fn named_worker_threads() {
        let pool = Pool::builder().name("named").workers(1).spawn().unwrap();
        let unit = pool
            .queue(|| Ok::<_, BoxError>(thread::current().name().map(str::to_owned)))
            .unwrap();
        assert_eq!(unit.wait().unwrap().as_deref(), Some("named-0"));
    }

    #[test]
    fn queue_from_inside_a_unit() {
        let pool = Arc::new(Pool::new(2).unwrap());
        let p = pool.clone();
        let outer = pool
            .queue(move || {
                let inner = p.queue(|| Ok::<_, BoxError>(21))?;
                let value = *inner.wait().map_err(|e| e.to_string())?;
                Ok::<_, BoxError>(value * 2)
            })
            .unwrap();
        assert_eq!(outer.wait().ok(), Some(&42));
    }

    #[test]
    fn bounded_queue_applies_backpressure() {
        let pool = Pool::builder().workers(1).capacity(1).spawn().unwrap();
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);
        let blocker = pool
            .queue(move || {
                release_rx.recv().unwrap();
                Ok::<_, BoxError>(())
            })
            .unwrap();

        thread::scope(|s| {
            let submitter = s.spawn(|| {
                (0..3)
                    .map(|i| pool.queue(move || Ok::<_, BoxError>(i)).unwrap())
                    .collect::<Vec<_>>()
            });
            thread::sleep(Duration::from_millis(20));
            assert!(!submitter.is_finished());
            release_tx.send(()).unwrap();
            let units = submitter.join().unwrap();
            for (i, unit) in units.iter().enumerate() {
                assert_eq!(unit.wait().ok(), Some(&i));
            }
        });
        blocker.wait().unwrap();
    }

    #[test]
    fn drop_waits_for_queued_work() {
        let ran = Arc::new(AtomicUsize::new(0));
        let units: Vec<_> = {
            let pool = Pool::new(2).unwrap();
            (0..20)
                .map(|_| {
                    let ran = ran.clone();
                    pool.queue(move || {
                        thread::sleep(Duration::from_millis(1));
                        ran.fetch_add(1, Ordering::Relaxed);
                        Ok::<_, BoxError>(())
                    })
                    .unwrap()
                })
                .collect()
        };
        assert_eq!(ran.load(Ordering::Relaxed), 20);
        assert!(units.iter().all(WorkUnit::is_done));
    }

    #[test]
    fn pool_is_send_sync() {
        assert_send_sync::<Pool>();
    }
}
