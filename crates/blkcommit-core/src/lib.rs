//! Engine for committing a chain of image layers: folding an intermediate
//! layer's allocated sectors down into an ancestor and splicing it out of
//! the chain, while the active layer stays online and servable throughout.
//!
//! This crate is backend-agnostic: it is written entirely against the
//! [`ImageChain`] trait. A reference POSIX-file backend lives in the sibling
//! `blkcommit-posix` crate; a minimal in-memory backend for testing lives in
//! this crate's own test module.

#![deny(missing_docs)]
#![deny(unreachable_pub)]

mod chain;
mod engine;
mod error;
mod job;
mod ratelimit;
mod registry;

pub use chain::{Allocation, ImageChain, OpenFlags, ReopenQueue, SECTOR_SIZE};
pub use engine::commit_start;
pub use error::{is_enospc, CommitStartError, CommitStatus, NegativeSpeed, OnError};
pub use job::{CancelHandle, CommitConfig, CommitJob, CommitProgress, JobState};
pub use ratelimit::RateLimiter;
pub use registry::{DeviceLease, JobRegistry};

#[cfg(test)]
mod tests;
