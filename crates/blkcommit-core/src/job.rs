//! The externally visible control surface for a running commit job.
//!
//! Grounded on `EngineHandle`/`EngineInner` in a teacher-style async engine:
//! a small shared-state struct (here [`JobInner`]) carries the cancellation
//! flag and a wakeup [`tokio::sync::Notify`] between the handle and the
//! spawned task, while live progress is published through a
//! `tokio::sync::watch` channel rather than polled field by field.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{CommitStatus, NegativeSpeed, OnError};

/// Coarse job state, suitable for snapshotting (unlike [`CommitStatus`],
/// which carries a non-`Clone` `io::Error` on failure).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// The job is still copying sectors.
    Running,
    /// The job finished and the chain was re-linked.
    Success,
    /// The job was cancelled.
    Cancelled,
    /// The job stopped on an unrecoverable error.
    Failed,
}

/// A point-in-time view of a commit job's progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitProgress {
    /// Bytes written into Base so far.
    pub offset: u64,
    /// Size of Top at job start, in bytes.
    pub length: u64,
    /// Current target speed in bytes/second (0 = unlimited).
    pub speed: u64,
    /// Coarse lifecycle state.
    pub state: JobState,
}

/// Configuration for a single commit job, supplied to `commit_start`.
pub struct CommitConfig<L> {
    /// The topmost, active layer. Not modified by the commit itself.
    pub active: L,
    /// The intermediate layer being committed and removed from the chain.
    pub top: L,
    /// The ancestor layer Top's allocated sectors are merged into.
    pub base: L,
    /// Target throughput in bytes/second; `0` means unlimited.
    pub speed: u64,
    /// Verdict applied to read/write errors during the loop.
    pub on_error: OnError,
    /// Invoked exactly once, just before the job's task returns.
    pub on_complete: Option<Box<dyn FnOnce(&CommitStatus) + Send>>,
}

/// State shared between a [`CommitJob`] handle and its spawned engine task.
pub(crate) struct JobInner {
    pub(crate) cancelled: AtomicBool,
    pub(crate) speed: AtomicU64,
    pub(crate) notify: tokio::sync::Notify,
}

impl JobInner {
    pub(crate) fn new(initial_speed: u64) -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            speed: AtomicU64::new(initial_speed),
            notify: tokio::sync::Notify::new(),
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// Handle to a running commit job.
///
/// Dropping the handle does not cancel the job; call [`CommitJob::cancel`]
/// explicitly, or [`CommitJob::wait`] to block until it finishes on its own.
pub struct CommitJob {
    pub(crate) inner: Arc<JobInner>,
    pub(crate) progress_rx: watch::Receiver<CommitProgress>,
    pub(crate) join: JoinHandle<CommitStatus>,
}

impl CommitJob {
    /// Request cancellation. Idempotent; safe to call multiple times or
    /// after the job has already finished.
    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }

    /// A cheap, cloneable token that can cancel this job without needing to
    /// borrow or outlive the [`CommitJob`] itself — handy for a ctrl-c
    /// watcher task spawned alongside a call to [`CommitJob::wait`].
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            inner: self.inner.clone(),
        }
    }

    /// Change the target throughput of a running job.
    ///
    /// Takes effect on the next loop iteration; does not retroactively
    /// affect bytes already accounted in the current window.
    pub fn set_speed(&self, bytes_per_sec: i64) -> Result<(), NegativeSpeed> {
        if bytes_per_sec < 0 {
            return Err(NegativeSpeed);
        }
        self.inner.speed.store(bytes_per_sec as u64, Ordering::SeqCst);
        Ok(())
    }

    /// The most recently published progress snapshot.
    pub fn progress(&self) -> CommitProgress {
        *self.progress_rx.borrow()
    }

    /// A standalone progress receiver, independent of the handle's lifetime —
    /// useful for a reporting task spawned alongside [`CommitJob::wait`].
    pub fn subscribe(&self) -> watch::Receiver<CommitProgress> {
        self.progress_rx.clone()
    }

    /// Wait for the job to finish, consuming the handle.
    pub async fn wait(self) -> CommitStatus {
        match self.join.await {
            Ok(status) => status,
            Err(join_err) => {
                CommitStatus::Failed(std::io::Error::other(format!(
                    "commit job task panicked: {join_err}"
                )))
            }
        }
    }
}

/// A cloneable cancellation token for a [`CommitJob`], independent of the
/// handle's lifetime. See [`CommitJob::cancel_handle`].
#[derive(Clone)]
pub struct CancelHandle {
    inner: Arc<JobInner>,
}

impl CancelHandle {
    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }
}
