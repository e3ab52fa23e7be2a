use std::{any::Any, error::Error, fmt, io};

/// A type-erased error returned by a work function.
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// The error half of a [`WorkUnit`][crate::WorkUnit]'s outcome.
#[derive(Debug)]
pub enum UnitError {
    /// The work function ran and returned this error.
    Failed(BoxError),
    /// The work function panicked. Holds the panic message, if one could be extracted.
    Panicked(String),
    /// The unit was cancelled before any worker started running it.
    Cancelled,
}

impl UnitError {
    /// Returns `true` if the unit never ran because it was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, UnitError::Cancelled)
    }

    /// Returns `true` if the work function panicked.
    pub fn is_panic(&self) -> bool {
        matches!(self, UnitError::Panicked(_))
    }

    pub(crate) fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let msg = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "<non-string panic payload>".to_string()
        };
        UnitError::Panicked(msg)
    }
}

impl fmt::Display for UnitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitError::Failed(err) => write!(f, "work unit failed: {err}"),
            UnitError::Panicked(msg) => write!(f, "work unit panicked: {msg}"),
            UnitError::Cancelled => f.write_str("work unit was cancelled before it ran"),
        }
    }
}

impl Error for UnitError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            UnitError::Failed(err) => Some(&**err),
            UnitError::Panicked(_) | UnitError::Cancelled => None,
        }
    }
}

/// An error returned when a unit of work could not be submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// The pool has been closed or cancelled (and not reset), or the batch belongs to a
    /// generation of the pool that has since been replaced by [`Pool::reset`].
    ///
    /// [`Pool::reset`]: crate::Pool::reset
    PoolClosed,
    /// [`Batch::queue_complete`] or [`Batch::cancel`] was already called on this batch.
    ///
    /// [`Batch::queue_complete`]: crate::Batch::queue_complete
    /// [`Batch::cancel`]: crate::Batch::cancel
    BatchComplete,
}

impl Error for QueueError {}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            QueueError::PoolClosed => "pool is closed and does not accept new work",
            QueueError::BatchComplete => "batch has been marked complete",
        })
    }
}

/// An error returned by [`Pool::reset`] and [`Pool::join`].
///
/// [`Pool::reset`]: crate::Pool::reset
/// [`Pool::join`]: crate::Pool::join
#[derive(Debug)]
pub enum ResetError {
    /// The pool is still open; it has to be closed or cancelled first.
    StillOpen,
    /// The pool was cancelled, but some of its workers are still finishing their current unit.
    NotDrained,
    /// Spawning the new generation's worker threads failed.
    Spawn(io::Error),
}

impl fmt::Display for ResetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResetError::StillOpen => f.write_str("pool is still open"),
            ResetError::NotDrained => f.write_str("pool workers have not all exited yet"),
            ResetError::Spawn(err) => write!(f, "failed to spawn worker threads: {err}"),
        }
    }
}

impl Error for ResetError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ResetError::Spawn(err) => Some(err),
            ResetError::StillOpen | ResetError::NotDrained => None,
        }
    }
}

impl From<io::Error> for ResetError {
    fn from(err: io::Error) -> Self {
        ResetError::Spawn(err)
    }
}
