use std::path::PathBuf;

use blkcommit_core::OnError;
use clap::{Parser, ValueEnum};

/// Commit an intermediate image layer ("top") down into an ancestor ("base").
#[derive(Debug, Parser)]
#[command(name = "blkcommit", version, about)]
pub struct Args {
    /// Path to the intermediate layer being committed and removed.
    pub top: PathBuf,
    /// Path to the ancestor layer Top's allocated sectors are merged into.
    pub base: PathBuf,
    /// Target throughput in bytes/second. `0` means unlimited.
    #[arg(long, default_value_t = 0, value_parser = parse_speed)]
    pub speed: u64,
    /// Verdict applied to read/write errors encountered during the commit.
    #[arg(long, value_enum, default_value_t = OnErrorArg::Report)]
    pub on_error: OnErrorArg,
    /// Open Base/Top with O_DIRECT (bypass the page cache).
    #[arg(long)]
    pub no_cache: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OnErrorArg {
    Report,
    Ignore,
    StopAny,
    StopEnospc,
}

impl From<OnErrorArg> for OnError {
    fn from(value: OnErrorArg) -> Self {
        match value {
            OnErrorArg::Report => OnError::Report,
            OnErrorArg::Ignore => OnError::Ignore,
            OnErrorArg::StopAny => OnError::StopAny,
            OnErrorArg::StopEnospc => OnError::StopEnospc,
        }
    }
}

fn parse_speed(input: &str) -> Result<u64, String> {
    let s = input.trim().to_ascii_lowercase();
    let (num, scale) = if let Some(raw) = s.strip_suffix("mib") {
        (raw, 1024u64 * 1024)
    } else if let Some(raw) = s.strip_suffix("kib") {
        (raw, 1024u64)
    } else if let Some(raw) = s.strip_suffix("mb") {
        (raw, 1_000_000u64)
    } else if let Some(raw) = s.strip_suffix("kb") {
        (raw, 1_000u64)
    } else {
        (s.as_str(), 1u64)
    };
    num.trim()
        .parse::<u64>()
        .map_err(|_| format!("invalid speed: {input:?}"))?
        .checked_mul(scale)
        .ok_or_else(|| format!("speed too large: {input:?}"))
}
