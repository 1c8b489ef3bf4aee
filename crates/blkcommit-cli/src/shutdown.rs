//! Ctrl-C handling, grounded on the teacher client's `ShutdownController`:
//! first signal requests a graceful cancel, a second forces immediate exit.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use blkcommit_core::CancelHandle;

pub struct ShutdownController {
    signals: AtomicU8,
}

impl ShutdownController {
    pub fn new() -> Self {
        Self {
            signals: AtomicU8::new(0),
        }
    }

    fn bump(&self) -> u8 {
        self.signals.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Spawn a ctrl-c watcher that cancels `job` on the first signal and aborts
/// the process on the second.
pub fn spawn_ctrl_c_handler(controller: Arc<ShutdownController>, job: CancelHandle) {
    tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            match controller.bump() {
                1 => {
                    tracing::warn!("received interrupt, cancelling commit job");
                    job.cancel();
                }
                _ => {
                    tracing::warn!("received second interrupt, exiting immediately");
                    std::process::exit(130);
                }
            }
        }
    });
}
