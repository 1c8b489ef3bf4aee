//! The commit state machine: start-time validation, the cooperative copy
//! loop, and best-effort teardown.
//!
//! This is a direct Rust port of `block/commit.c`'s `commit_start` and
//! `commit_run`, restructured as an async task the way a tokio-based engine
//! (`bbr-client-engine`'s worker/engine split) would express a cooperative
//! coroutine.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::chain::{Allocation, ImageChain, OpenFlags, ReopenQueue, SECTOR_SIZE};
use crate::error::{CommitStartError, CommitStatus};
use crate::job::{CommitConfig, CommitJob, CommitProgress, JobInner, JobState};
use crate::ratelimit::RateLimiter;
use crate::registry::{DeviceLease, JobRegistry};

/// Size of the scratch buffer used to stage copies from Top into Base.
const BUFFER_BYTES: u64 = 512 * 1024;

/// Validate and start a commit job.
///
/// On success, the job is already running in the background; use the
/// returned [`CommitJob`] to track progress, retune its speed, cancel it, or
/// wait for it to finish.
pub async fn commit_start<C>(
    chain: Arc<C>,
    registry: &Arc<JobRegistry<C::Layer>>,
    config: CommitConfig<C::Layer>,
) -> Result<CommitJob, CommitStartError>
where
    C: ImageChain + 'static,
{
    if config.on_error.requires_iostatus() && !chain.iostatus_is_enabled(&config.active) {
        return Err(CommitStartError::InvalidParameterCombination);
    }
    if config.top == config.active {
        return Err(CommitStartError::TopIsActive);
    }
    if config.top == config.base {
        return Err(CommitStartError::TopAndBaseIdentical);
    }

    let overlay = chain
        .find_overlay(&config.active, &config.top)
        .await
        .map_err(CommitStartError::OverlayLookup)?
        .ok_or(CommitStartError::TopNotFound)?;

    let base_flags = chain
        .get_flags(&config.base)
        .await
        .map_err(CommitStartError::Reopen)?;
    let overlay_flags = chain
        .get_flags(&overlay)
        .await
        .map_err(CommitStartError::Reopen)?;

    let mut queue = ReopenQueue::new();
    if !base_flags.read_write {
        queue.push(config.base.clone(), OpenFlags { read_write: true });
    }
    if !overlay_flags.read_write {
        queue.push(overlay.clone(), OpenFlags { read_write: true });
    }
    if !queue.is_empty() {
        chain
            .reopen_multiple(queue)
            .await
            .map_err(CommitStartError::Reopen)?;
    }

    // Note: if device acquisition fails below, the flag widening above is
    // *not* reverted. This mirrors the original's documented behaviour
    // (SPEC_FULL.md §9, open question 1) rather than an oversight.
    let lease = registry
        .try_acquire(config.active.clone())
        .ok_or(CommitStartError::DeviceInUse)?;

    let inner = Arc::new(JobInner::new(config.speed));
    let (progress_tx, progress_rx) = watch::channel(CommitProgress {
        offset: 0,
        length: 0,
        speed: config.speed,
        state: JobState::Running,
    });

    let task_inner = inner.clone();
    let task_chain = chain;
    let join = tokio::spawn(async move {
        run_job(task_chain, overlay, config, base_flags, overlay_flags, task_inner, progress_tx, lease).await
    });

    Ok(CommitJob {
        inner,
        progress_rx,
        join,
    })
}

async fn run_job<C: ImageChain>(
    chain: Arc<C>,
    overlay: C::Layer,
    mut config: CommitConfig<C::Layer>,
    base_flags: OpenFlags,
    overlay_flags: OpenFlags,
    inner: Arc<JobInner>,
    progress_tx: watch::Sender<CommitProgress>,
    _lease: DeviceLease<C::Layer>,
) -> CommitStatus {
    tracing::info!(top = ?config.top, base = ?config.base, "commit job starting");

    let mut status = run_loop(&chain, &config, &inner, &progress_tx).await;

    if matches!(status, CommitStatus::Success) {
        if let Err(err) = chain
            .drop_intermediate(&config.active, &config.top, &config.base)
            .await
        {
            status = CommitStatus::Failed(err);
        }
    }

    teardown(&chain, &config.base, &overlay, base_flags, overlay_flags).await;

    let final_progress = {
        let mut p = *progress_tx.borrow();
        p.state = match &status {
            CommitStatus::Success => JobState::Success,
            CommitStatus::Cancelled => JobState::Cancelled,
            CommitStatus::Failed(_) => JobState::Failed,
        };
        p
    };
    let _ = progress_tx.send(final_progress);

    if let Some(cb) = config.on_complete.take() {
        cb(&status);
    }

    match &status {
        CommitStatus::Success => tracing::info!("commit job completed"),
        CommitStatus::Cancelled => tracing::info!("commit job cancelled"),
        CommitStatus::Failed(err) => tracing::warn!(%err, "commit job failed"),
    }

    status
}

async fn run_loop<C: ImageChain>(
    chain: &Arc<C>,
    config: &CommitConfig<C::Layer>,
    inner: &Arc<JobInner>,
    progress_tx: &watch::Sender<CommitProgress>,
) -> CommitStatus {
    let top_len = match chain.length(&config.top).await {
        Ok(len) => len,
        Err(err) => return CommitStatus::Failed(err),
    };

    let base_len = match chain.length(&config.base).await {
        Ok(len) => len,
        Err(err) => return CommitStatus::Failed(err),
    };

    if base_len < top_len {
        if let Err(err) = chain.truncate(&config.base, top_len).await {
            return CommitStatus::Failed(err);
        }
    }

    let _ = progress_tx.send(CommitProgress {
        offset: 0,
        length: top_len,
        speed: inner.speed.load(Ordering::Relaxed),
        state: JobState::Running,
    });

    let end_sector = top_len.div_ceil(SECTOR_SIZE);
    let mut buf = vec![0u8; BUFFER_BYTES as usize];
    let mut limiter = RateLimiter::new();

    let mut sector = 0u64;
    let mut offset = 0u64;
    let mut pending_delay = Duration::ZERO;

    loop {
        // Mandatory per-iteration yield: even at "unlimited" speed, this
        // lets the backend's own submission path make progress. Racing it
        // against the cancellation notifier gives prompt cancel response
        // even mid rate-limit wait (P4).
        tokio::select! {
            _ = sleep_or_yield(pending_delay) => {}
            _ = inner.notify.notified() => {}
        }
        pending_delay = Duration::ZERO;

        if inner.is_cancelled() {
            return CommitStatus::Cancelled;
        }

        if sector >= end_sector {
            break;
        }

        let n_req = (BUFFER_BYTES / SECTOR_SIZE).min(end_sector - sector);
        let (allocation, mut n) =
            match chain.is_allocated_above(&config.top, &config.base, sector, n_req).await {
                Ok(v) => v,
                Err(err) => return CommitStatus::Failed(err),
            };

        if matches!(allocation, Allocation::Allocated) {
            let speed = inner.speed.load(Ordering::Relaxed);
            if speed > 0 {
                limiter.set_speed(speed);
                let delay = limiter.calculate_delay(n * SECTOR_SIZE);
                if delay > Duration::ZERO {
                    pending_delay = delay;
                    continue;
                }
            }

            let byte_len = (n * SECTOR_SIZE) as usize;
            let slice = &mut buf[..byte_len];

            match copy_range(chain, &config.top, &config.base, sector, n, slice).await {
                Ok(()) => {
                    offset += byte_len as u64;
                }
                Err(err) => {
                    if config.on_error.should_stop(&err) {
                        return CommitStatus::Failed(err);
                    }
                    // Soft error: retry the same sector next iteration.
                    n = 0;
                }
            }
        }

        sector += n;

        let _ = progress_tx.send(CommitProgress {
            offset,
            length: top_len,
            speed: inner.speed.load(Ordering::Relaxed),
            state: JobState::Running,
        });
    }

    CommitStatus::Success
}

async fn copy_range<C: ImageChain>(
    chain: &Arc<C>,
    top: &C::Layer,
    base: &C::Layer,
    sector: u64,
    n: u64,
    buf: &mut [u8],
) -> std::io::Result<()> {
    chain.read(top, sector, n, buf).await?;
    chain.write(base, sector, n, buf).await?;
    Ok(())
}

async fn sleep_or_yield(delay: Duration) {
    if delay.is_zero() {
        tokio::task::yield_now().await;
    } else {
        tokio::time::sleep(delay).await;
    }
}

async fn teardown<C: ImageChain>(
    chain: &Arc<C>,
    base: &C::Layer,
    overlay: &C::Layer,
    original_base_flags: OpenFlags,
    original_overlay_flags: OpenFlags,
) {
    let mut queue = ReopenQueue::new();

    match chain.get_flags(base).await {
        Ok(flags) if flags != original_base_flags => {
            queue.push(base.clone(), original_base_flags);
        }
        Ok(_) => {}
        Err(err) => tracing::warn!(%err, "failed to read base flags during teardown"),
    }

    match chain.get_flags(overlay).await {
        Ok(flags) if flags != original_overlay_flags => {
            queue.push(overlay.clone(), original_overlay_flags);
        }
        Ok(_) => {}
        Err(err) => tracing::warn!(%err, "failed to read overlay flags during teardown"),
    }

    if !queue.is_empty() {
        if let Err(err) = chain.reopen_multiple(queue).await {
            tracing::warn!(%err, "failed to restore original open flags");
        }
    }
}
