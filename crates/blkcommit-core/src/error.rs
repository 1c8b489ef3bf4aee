//! Typed errors and the on-error policy for a commit job.

use std::io;

/// Verdict applied to each failed read or write during the commit loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnError {
    /// Record the error and stop.
    Report,
    /// Retry the same sector indefinitely.
    Ignore,
    /// Stop on any I/O error.
    StopAny,
    /// Stop only on ENOSPC; otherwise behave like `Ignore`.
    StopEnospc,
}

impl OnError {
    /// Whether iostatus reporting must be enabled on Active for this policy.
    pub(crate) fn requires_iostatus(self) -> bool {
        matches!(self, OnError::StopAny | OnError::StopEnospc)
    }

    /// Whether `err`, observed on a read or write, should stop the loop.
    pub(crate) fn should_stop(self, err: &io::Error) -> bool {
        match self {
            OnError::StopAny | OnError::Report => true,
            OnError::StopEnospc => is_enospc(err),
            OnError::Ignore => false,
        }
    }
}

/// Whether `err` is classified as "no space left on device".
pub fn is_enospc(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc_enospc())
}

#[cfg(unix)]
fn libc_enospc() -> i32 {
    // ENOSPC is 28 on every current Unix ABI; avoiding a `libc` dependency
    // here keeps the core backend-agnostic (only `blkcommit-posix` needs libc).
    28
}

#[cfg(not(unix))]
fn libc_enospc() -> i32 {
    i32::MIN
}

/// Synchronous validation failures at `commit_start`. No job is created.
#[derive(Debug, thiserror::Error)]
pub enum CommitStartError {
    /// `on_error` is `StopAny`/`StopEnospc` but iostatus reporting is disabled.
    #[error("on-error policy requires iostatus reporting to be enabled")]
    InvalidParameterCombination,
    /// `top == active`; committing into the active layer is not supported.
    #[error("top layer is the active layer")]
    TopIsActive,
    /// `top == base`.
    #[error("top and base layers are identical")]
    TopAndBaseIdentical,
    /// `top` is not a backing file of any layer reachable from `active`.
    #[error("top layer not found in the chain rooted at active")]
    TopNotFound,
    /// The overlay lookup itself failed (a genuine backend I/O error, not an
    /// absent overlay).
    #[error("failed to look up top's overlay: {0}")]
    OverlayLookup(#[source] io::Error),
    /// The device already has a commit (or other) job running on it.
    #[error("device already has a job running")]
    DeviceInUse,
    /// Widening Base/Overlay to read-write failed.
    #[error("failed to reopen base/overlay read-write: {0}")]
    Reopen(#[source] io::Error),
}

/// Failure to change a running job's target speed.
#[derive(Debug, thiserror::Error)]
#[error("speed must not be negative")]
pub struct NegativeSpeed;

/// Terminal outcome of a commit job.
#[derive(Debug)]
pub enum CommitStatus {
    /// The commit completed and the chain was re-linked.
    Success,
    /// The job was cancelled before completion; the chain is untouched.
    Cancelled,
    /// The job stopped because of an unrecoverable error.
    Failed(io::Error),
}

impl CommitStatus {
    /// Whether this status represents a successful, chain-relinked commit.
    pub fn is_success(&self) -> bool {
        matches!(self, CommitStatus::Success)
    }
}
