use std::{
    io,
    panic::resume_unwind,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};

use crate::{
    dispatch::{DispatchQueue, Pop, Popper},
    drop::defer,
};

/// The worker threads of one pool generation.
pub(crate) struct WorkerSet {
    handles: Vec<JoinHandle<()>>,
    /// Number of worker threads that have not exited their loop yet.
    live: Arc<AtomicUsize>,
}

impl WorkerSet {
    /// Spawns `count` worker threads consuming from `queue`.
    ///
    /// Threads are named `{name}-{i}` if a base name is given.
    pub(crate) fn spawn(
        name: Option<&str>,
        count: usize,
        queue: &DispatchQueue,
    ) -> io::Result<WorkerSet> {
        assert_ne!(count, 0, "worker count must be at least 1");

        let live = Arc::new(AtomicUsize::new(0));
        let mut set = WorkerSet {
            handles: Vec::with_capacity(count),
            live: live.clone(),
        };
        for i in 0..count {
            let mut builder = thread::Builder::new();
            let label = match name {
                Some(name) => {
                    let label = format!("{name}-{i}");
                    builder = builder.name(label.clone());
                    label
                }
                None => format!("worker-{i}"),
            };
            let popper = queue.popper();
            let live = live.clone();
            live.fetch_add(1, Ordering::AcqRel);
            match builder.spawn(move || {
                let _guard = defer(|| {
                    live.fetch_sub(1, Ordering::AcqRel);
                });
                run(&label, popper);
            }) {
                Ok(handle) => set.handles.push(handle),
                Err(err) => {
                    // The threads that did start exit once the caller drops `queue`.
                    set.live.fetch_sub(1, Ordering::AcqRel);
                    return Err(err);
                }
            }
        }
        Ok(set)
    }

    /// Returns `true` once every worker thread has left its loop.
    pub(crate) fn is_drained(&self) -> bool {
        self.live.load(Ordering::Acquire) == 0
    }

    /// Takes the join handles out, leaving the set empty (but still tracking liveness).
    pub(crate) fn take_handles(&mut self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut self.handles)
    }
}

/// Waits for all `handles` to exit and propagates a panic if one of them panicked.
///
/// Panics raised by work functions never get here; only a panic in the worker loop itself does.
pub(crate) fn join_all(handles: Vec<JoinHandle<()>>) {
    let mut payload = None;
    for handle in handles {
        if let Err(pl) = handle.join() {
            payload = Some(pl);
        }
    }
    if let Some(payload) = payload {
        if !thread::panicking() {
            resume_unwind(payload);
        }
    }
}

fn run(label: &str, popper: Popper) {
    log::trace!("worker '{label}' starting");
    let _guard = defer(|| log::trace!("worker '{label}' exiting"));

    while let Pop::Job(job) = popper.pop() {
        job.run();
    }
    popper.drain_if_cancelled();
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::{dispatch::Task, BoxError, WorkUnit};

    use super::*;

    fn push<T: Send + Sync + 'static>(
        queue: &DispatchQueue,
        f: impl FnOnce() -> Result<T, BoxError> + Send + 'static,
    ) -> WorkUnit<T> {
        let unit = WorkUnit::new(None);
        queue
            .pusher()
            .unwrap()
            .push(Box::new(Task::new(unit.clone(), f, None)));
        unit
    }

    #[test]
    #[should_panic(expected = "worker count must be at least 1")]
    fn zero_workers_panics() {
        let queue = DispatchQueue::new(None);
        let _ = WorkerSet::spawn(None, 0, &queue);
    }

    #[test]
    fn workers_run_jobs_and_exit_on_close() {
        let mut queue = DispatchQueue::new(None);
        let mut set = WorkerSet::spawn(Some("test-worker"), 3, &queue).unwrap();
        let units: Vec<_> = (0..20).map(|i| push(&queue, move || Ok(i))).collect();

        queue.close();
        join_all(set.take_handles());
        assert!(set.is_drained());
        for (i, unit) in units.iter().enumerate() {
            assert_eq!(unit.value(), Some(&i));
        }
    }

    #[test]
    fn workers_survive_panicking_units() {
        let mut queue = DispatchQueue::new(None);
        let mut set = WorkerSet::spawn(None, 1, &queue).unwrap();
        let bad = push(&queue, || -> Result<(), BoxError> {
            crate::test::silent_panic("unit panic")
        });
        let good = push(&queue, || Ok("still alive"));

        assert!(bad.wait().unwrap_err().is_panic());
        assert_eq!(good.wait().ok(), Some(&"still alive"));

        queue.close();
        join_all(set.take_handles());
    }

    #[test]
    fn cancel_stops_workers_after_current_unit() {
        let mut queue = DispatchQueue::new(None);
        let mut set = WorkerSet::spawn(None, 1, &queue).unwrap();
        let (started_tx, started_rx) = crossbeam_channel::bounded(0);
        let running = push(&queue, move || {
            started_tx.send(()).unwrap();
            thread::sleep(Duration::from_millis(50));
            Ok("finished")
        });
        let queued: Vec<_> = (0..100).map(|i| push(&queue, move || Ok(i))).collect();

        started_rx.recv().unwrap();
        queue.cancel();
        join_all(set.take_handles());

        assert!(set.is_drained());
        assert_eq!(running.wait().ok(), Some(&"finished"));
        for unit in &queued {
            assert!(unit.wait().unwrap_err().is_cancelled());
        }
    }
}
