use std::fmt;
use std::sync::Arc;

use crate::scheduler::{Scheduler, SessionToken};
use crate::Result;

/// Process-unique identity of an asynchronous task. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub(crate) const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw identity.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a task as seen through its handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    /// Submitted and not finished yet.
    Pending,
    /// Finished; encoded data is available.
    Succeeded,
    /// Finished with an error.
    Failed,
    /// Disposed, or force-resolved because its session was closed.
    Disposed,
}

/// Handle to an asynchronous encode task.
///
/// A handle only carries the task identity; the scheduler owns the task and its
/// result buffer. Finished tasks keep their data until [`dispose`](Self::dispose)
/// is called, so call it once the result has been consumed. Every accessor is
/// non-blocking and safe to call after disposal.
#[must_use = "finished tasks hold their encoded data until disposed"]
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: TaskId,
    session: SessionToken,
    scheduler: Scheduler,
}

impl TaskHandle {
    pub(crate) const fn new(id: TaskId, session: SessionToken, scheduler: Scheduler) -> Self {
        Self {
            id,
            session,
            scheduler,
        }
    }

    /// Returns the task identity.
    #[must_use]
    pub const fn id(&self) -> TaskId {
        self.id
    }

    /// Returns the current status.
    #[must_use]
    pub fn status(&self) -> TaskStatus {
        self.scheduler.status(self.id)
    }

    /// Returns `true` once the task finished, failed or was disposed.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.status() != TaskStatus::Pending
    }

    /// Returns `true` if the task failed or no longer exists.
    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self.status(), TaskStatus::Failed | TaskStatus::Disposed)
    }

    /// Returns the failure message.
    ///
    /// `None` while pending or after success. A task that no longer exists
    /// reports why: its session was closed or the handle was disposed.
    #[must_use]
    pub fn error(&self) -> Option<String> {
        self.scheduler.error(self.id, &self.session)
    }

    /// Returns the encoded bytes of a succeeded task.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidState`](crate::CodecError::InvalidState) if
    /// the task is pending, failed or was disposed.
    pub fn data(&self) -> Result<Arc<Vec<u8>>> {
        self.scheduler.data(self.id)
    }

    /// Frees the task and its data. Calling it again does nothing.
    pub fn dispose(&self) {
        self.scheduler.dispose(self.id);
    }
}
