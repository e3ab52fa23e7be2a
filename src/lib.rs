//! A fixed-size worker thread pool with cancellable work units and streaming batches.
//!
//! (if you want to split one big homogeneous computation across cores, check out [`rayon`]
//! instead; if you need to juggle many thousands of I/O-bound tasks, an `async` runtime will serve
//! you better)
//!
//! # Overview
//!
//! A [`Pool`] owns a fixed number of worker threads that pull units of work off a shared FIFO
//! queue. Submitting a closure returns a [`WorkUnit`], a handle that can be waited on (from any
//! number of threads), polled, or cancelled. A [`Batch`] groups units together so their outcomes
//! can be consumed as a stream, in completion order, while more units are still being submitted.
//!
//! Work functions return a `Result<T, E>`. The outcome of a unit is always one of:
//!
//! - the returned value,
//! - the returned error ([`UnitError::Failed`]),
//! - the panic the function raised ([`UnitError::Panicked`]). Panics never take down a worker or
//!   the pool,
//! - [`UnitError::Cancelled`], if the unit was cancelled before a worker picked it up.
//!
//! ## Cancellation
//!
//! Cancellation is cooperative: a unit that is already running always runs to completion, and
//! only units still waiting in the queue are skipped. Units can be cancelled individually
//! ([`WorkUnit::cancel`]), per batch ([`Batch::cancel`]), or all at once ([`Pool::cancel`]).
//! Cancelling never waits for the queue to be worked off, no matter how long it is.
//!
//! There are no built-in timeouts. To put a deadline on a unit, wait with
//! [`WorkUnit::wait_timeout`] and cancel it when the deadline passes.
//!
//! ## Lifecycle
//!
//! [`Pool::close`] lets everything already queued finish and then joins the workers;
//! [`Pool::cancel`] drops everything that hasn't started yet. Either way the pool can be brought
//! back with [`Pool::reset`] once drained. Dropping a [`Pool`] closes it, so worker threads never
//! outlive their pool.
//!
//! # Usage
//!
//! Running individual units of work:
//!
//! ```
//! use batchpool::{BoxError, Pool};
//!
//! let pool = Pool::new(4).unwrap();
//!
//! let user = pool.queue(|| get_user(13)).unwrap();
//! let other = pool.queue(|| Ok::<_, BoxError>("other info")).unwrap();
//!
//! // <do other work concurrently>
//!
//! match user.wait() {
//!     Ok(name) => assert_eq!(name, "Joeybloggs"),
//!     Err(err) => panic!("lookup failed: {err}"),
//! }
//! assert_eq!(other.wait().ok(), Some(&"other info"));
//!
//! fn get_user(id: u32) -> Result<String, BoxError> {
//!     if id == 0 {
//!         return Err("no such user".into());
//!     }
//!     Ok("Joeybloggs".to_string())
//! }
//! ```
//!
//! Running a batch, with one thread queueing units while another consumes the results:
//!
//! ```
//! use std::thread;
//! use batchpool::{BoxError, Pool};
//!
//! let pool = Pool::new(4).unwrap();
//! let batch = pool.batch::<()>();
//!
//! let producer = batch.clone();
//! let feeder = thread::spawn(move || {
//!     for i in 0..10 {
//!         producer.queue(move || send_email(i)).unwrap();
//!     }
//!     // Without this, the `results` loop below would never end.
//!     producer.queue_complete();
//! });
//!
//! let mut sent = 0;
//! for email in batch.results() {
//!     match email.wait() {
//!         Ok(()) => sent += 1,
//!         Err(err) => {
//!             eprintln!("giving up: {err}");
//!             batch.cancel();
//!         }
//!     }
//! }
//! feeder.join().unwrap();
//! assert_eq!(sent, 10);
//!
//! fn send_email(_id: u32) -> Result<(), BoxError> {
//!     Ok(())
//! }
//! ```
//!
//! Putting a deadline on a unit:
//!
//! ```
//! use std::time::Duration;
//! use batchpool::{BoxError, Pool};
//!
//! let pool = Pool::new(1).unwrap();
//! let slow = pool.queue(|| {
//!     std::thread::sleep(Duration::from_millis(200));
//!     Ok::<_, BoxError>(())
//! }).unwrap();
//! let queued = pool.queue(|| Ok::<_, BoxError>(())).unwrap();
//!
//! if queued.wait_timeout(Duration::from_millis(10)).is_none() {
//!     // Still waiting behind `slow`; it will never run now.
//!     assert!(queued.cancel());
//! }
//! assert!(queued.is_cancelled());
//! assert!(slow.wait().is_ok());
//! ```
//!
//! [`rayon`]: https://crates.io/crates/rayon

mod batch;
mod dispatch;
mod drop;
mod error;
mod pool;
mod sync;
mod unit;
mod worker;

pub use batch::{Batch, Results};
pub use error::{BoxError, QueueError, ResetError, UnitError};
pub use pool::{Pool, PoolBuilder, PoolState};
pub use unit::{Completion, WorkUnit};
