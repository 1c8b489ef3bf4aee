mod cli;
mod shutdown;

use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;

use blkcommit_core::{commit_start, CommitConfig, JobRegistry};
use blkcommit_posix::{OpenSpec, PosixChain};

use cli::Args;
use shutdown::ShutdownController;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    if !args.top.exists() {
        bail!("top layer {:?} does not exist", args.top);
    }
    if !args.base.exists() {
        bail!("base layer {:?} does not exist", args.base);
    }

    let chain = Arc::new(PosixChain::new());
    chain
        .register(
            "active",
            OpenSpec {
                path: args.top.clone(),
                read_write: true,
                no_cache: args.no_cache,
                write_back_cache: false,
            },
            Some(Arc::from("top")),
        )
        .context("failed to open top layer as active")?;
    chain
        .register(
            "top",
            OpenSpec {
                path: args.top.clone(),
                read_write: true,
                no_cache: args.no_cache,
                write_back_cache: false,
            },
            Some(Arc::from("base")),
        )
        .context("failed to open top layer")?;
    chain
        .register(
            "base",
            OpenSpec {
                path: args.base.clone(),
                read_write: true,
                no_cache: args.no_cache,
                write_back_cache: false,
            },
            None,
        )
        .context("failed to open base layer")?;

    let registry = Arc::new(JobRegistry::new());
    let job = commit_start(
        chain,
        &registry,
        CommitConfig {
            active: Arc::from("active"),
            top: Arc::from("top"),
            base: Arc::from("base"),
            speed: args.speed,
            on_error: args.on_error.into(),
            on_complete: None,
        },
    )
    .await
    .context("failed to start commit job")?;

    let shutdown = Arc::new(ShutdownController::new());
    shutdown::spawn_ctrl_c_handler(shutdown, job.cancel_handle());

    let mut progress_rx = job.subscribe();
    let wait_fut = job.wait();
    tokio::pin!(wait_fut);

    let mut ticker = tokio::time::interval(std::time::Duration::from_millis(500));
    let status = loop {
        tokio::select! {
            _ = ticker.tick() => {
                let progress = *progress_rx.borrow();
                if progress.length > 0 {
                    let pct = (progress.offset as f64 / progress.length as f64) * 100.0;
                    tracing::info!(offset = progress.offset, length = progress.length, "{pct:.1}% committed");
                }
            }
            status = &mut wait_fut => break status,
        }
    };

    match status.is_success() {
        true => {
            println!("commit finished successfully");
            Ok(())
        }
        false => {
            bail!("commit did not complete successfully: {status:?}")
        }
    }
}
