//! End-to-end engine tests against an in-memory chain fixture.
//!
//! `MemoryChain` is not meant to be realistic I/O; it exists to drive the
//! engine through every control-flow path (`blkcommit-posix` exercises the
//! real I/O path against the filesystem).

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::chain::{Allocation, ImageChain, OpenFlags, ReopenQueue, SECTOR_SIZE};
use crate::engine::commit_start;
use crate::error::{CommitStartError, CommitStatus, OnError};
use crate::job::CommitConfig;
use crate::registry::JobRegistry;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
enum FaultOp {
    Read,
    Write,
}

#[derive(Clone)]
struct FaultSpec {
    /// Successful calls to let through before the fault starts firing.
    after: u32,
    /// `None` = fires forever once triggered; `Some(k)` = fires `k` more
    /// times then clears.
    remaining: Option<u32>,
    raw_os_error: i32,
}

struct LayerState {
    data: Vec<u8>,
    allocated: Vec<bool>,
    backing: Option<&'static str>,
    flags: OpenFlags,
    iostatus: bool,
}

impl LayerState {
    fn blank(len_bytes: u64) -> Self {
        let sectors = len_bytes.div_ceil(SECTOR_SIZE) as usize;
        Self {
            data: vec![0u8; len_bytes as usize],
            allocated: vec![false; sectors],
            backing: None,
            flags: OpenFlags { read_write: true },
            iostatus: true,
        }
    }
}

/// In-memory, fault-injectable [`ImageChain`] used to exercise the engine.
#[derive(Default)]
struct MemoryChain {
    layers: Mutex<HashMap<&'static str, LayerState>>,
    faults: Mutex<HashMap<(&'static str, FaultOp), FaultSpec>>,
}

impl MemoryChain {
    fn new() -> Self {
        Self {
            layers: Mutex::new(HashMap::new()),
            faults: Mutex::new(HashMap::new()),
        }
    }

    fn add_layer(&self, name: &'static str, len_bytes: u64) {
        self.layers.lock().unwrap().insert(name, LayerState::blank(len_bytes));
    }

    fn set_backing(&self, overlay: &'static str, target: &'static str) {
        self.layers.lock().unwrap().get_mut(overlay).unwrap().backing = Some(target);
    }

    fn mark_allocated(&self, layer: &'static str, sector: u64, n: u64) {
        let mut layers = self.layers.lock().unwrap();
        let state = layers.get_mut(layer).unwrap();
        for i in sector..sector + n {
            state.allocated[i as usize] = true;
        }
    }

    fn set_read_only(&self, layer: &'static str) {
        self.layers.lock().unwrap().get_mut(layer).unwrap().flags.read_write = false;
    }

    fn inject_fault(&self, layer: &'static str, op: FaultOp, spec: FaultSpec) {
        self.faults.lock().unwrap().insert((layer, op), spec);
    }

    fn maybe_fault(&self, layer: &'static str, op: FaultOp) -> Option<io::Error> {
        let mut faults = self.faults.lock().unwrap();
        let key = (layer, op);
        let Some(spec) = faults.get_mut(&key) else {
            return None;
        };
        if spec.after > 0 {
            spec.after -= 1;
            return None;
        }
        match spec.remaining {
            Some(0) => {
                faults.remove(&key);
                None
            }
            Some(ref mut k) => {
                *k -= 1;
                let err = io::Error::from_raw_os_error(spec.raw_os_error);
                if *k == 0 {
                    faults.remove(&key);
                }
                Some(err)
            }
            None => Some(io::Error::from_raw_os_error(spec.raw_os_error)),
        }
    }

    fn snapshot(&self, layer: &'static str) -> Vec<u8> {
        self.layers.lock().unwrap().get(layer).unwrap().data.clone()
    }
}

impl ImageChain for MemoryChain {
    type Layer = &'static str;

    async fn length(&self, layer: &Self::Layer) -> io::Result<u64> {
        Ok(self.layers.lock().unwrap().get(layer).unwrap().data.len() as u64)
    }

    async fn truncate(&self, layer: &Self::Layer, bytes: u64) -> io::Result<()> {
        let mut layers = self.layers.lock().unwrap();
        let state = layers.get_mut(layer).unwrap();
        state.data.resize(bytes as usize, 0);
        state.allocated.resize(bytes.div_ceil(SECTOR_SIZE) as usize, false);
        Ok(())
    }

    async fn read(
        &self,
        layer: &Self::Layer,
        sector: u64,
        n_sectors: u64,
        buf: &mut [u8],
    ) -> io::Result<()> {
        if let Some(err) = self.maybe_fault(layer, FaultOp::Read) {
            return Err(err);
        }
        let layers = self.layers.lock().unwrap();
        let state = layers.get(layer).unwrap();
        let start = (sector * SECTOR_SIZE) as usize;
        let len = (n_sectors * SECTOR_SIZE) as usize;
        buf[..len].copy_from_slice(&state.data[start..start + len]);
        Ok(())
    }

    async fn write(
        &self,
        layer: &Self::Layer,
        sector: u64,
        n_sectors: u64,
        buf: &[u8],
    ) -> io::Result<()> {
        if let Some(err) = self.maybe_fault(layer, FaultOp::Write) {
            return Err(err);
        }
        let mut layers = self.layers.lock().unwrap();
        let state = layers.get_mut(layer).unwrap();
        let start = (sector * SECTOR_SIZE) as usize;
        let len = (n_sectors * SECTOR_SIZE) as usize;
        state.data[start..start + len].copy_from_slice(&buf[..len]);
        Ok(())
    }

    async fn is_allocated_above(
        &self,
        top: &Self::Layer,
        _base: &Self::Layer,
        sector: u64,
        n_req: u64,
    ) -> io::Result<(Allocation, u64)> {
        let layers = self.layers.lock().unwrap();
        let state = layers.get(top).unwrap();
        let status = state.allocated.get(sector as usize).copied().unwrap_or(false);
        let mut n = 1;
        while n < n_req {
            let idx = (sector + n) as usize;
            if state.allocated.get(idx).copied().unwrap_or(false) != status {
                break;
            }
            n += 1;
        }
        let allocation = if status {
            Allocation::Allocated
        } else {
            Allocation::NotAllocated
        };
        Ok((allocation, n))
    }

    async fn find_overlay(
        &self,
        _active: &Self::Layer,
        top: &Self::Layer,
    ) -> io::Result<Option<Self::Layer>> {
        let layers = self.layers.lock().unwrap();
        Ok(layers
            .iter()
            .find(|(_, state)| state.backing == Some(*top))
            .map(|(name, _)| *name))
    }

    async fn get_flags(&self, layer: &Self::Layer) -> io::Result<OpenFlags> {
        Ok(self.layers.lock().unwrap().get(layer).unwrap().flags)
    }

    async fn reopen_multiple(&self, queue: ReopenQueue<Self::Layer>) -> io::Result<()> {
        let mut layers = self.layers.lock().unwrap();
        for (layer, _) in &queue.entries {
            if !layers.contains_key(layer) {
                return Err(io::Error::other("unknown layer in reopen queue"));
            }
        }
        for (layer, flags) in queue.entries {
            layers.get_mut(&layer).unwrap().flags = flags;
        }
        Ok(())
    }

    async fn drop_intermediate(
        &self,
        _active: &Self::Layer,
        top: &Self::Layer,
        base: &Self::Layer,
    ) -> io::Result<()> {
        let mut layers = self.layers.lock().unwrap();
        let overlay = layers
            .iter()
            .find(|(_, state)| state.backing == Some(*top))
            .map(|(name, _)| *name);
        if let Some(overlay) = overlay {
            layers.get_mut(overlay).unwrap().backing = Some(*base);
        }
        layers.remove(top);
        Ok(())
    }

    fn iostatus_is_enabled(&self, layer: &Self::Layer) -> bool {
        self.layers.lock().unwrap().get(layer).unwrap().iostatus
    }

    fn block_align(&self, _layer: &Self::Layer) -> u64 {
        SECTOR_SIZE
    }
}

fn basic_chain(top_len: u64) -> Arc<MemoryChain> {
    let chain = Arc::new(MemoryChain::new());
    chain.add_layer("active", top_len);
    chain.add_layer("top", top_len);
    chain.add_layer("base", 0);
    chain.set_backing("active", "top");
    chain.set_backing("top", "base");
    chain
}

fn config(
    top: &'static str,
    base: &'static str,
    active: &'static str,
    speed: u64,
    on_error: OnError,
) -> CommitConfig<&'static str> {
    CommitConfig {
        active,
        top,
        base,
        speed,
        on_error,
        on_complete: None,
    }
}

#[tokio::test]
async fn small_all_allocated_commit_copies_every_sector() {
    let chain = basic_chain(2048);
    chain.mark_allocated("top", 0, 4);
    for i in 0..4 {
        let b = (i + 1) as u8;
        let buf = vec![b; SECTOR_SIZE as usize];
        chain.write("top", i, 1, &buf).await.unwrap();
    }

    let registry = Arc::new(JobRegistry::new());
    let job = commit_start(chain.clone(), &registry, config("top", "base", "active", 0, OnError::Report))
        .await
        .expect("commit should start");
    let status = job.wait().await;
    assert!(status.is_success());

    let base_contents = chain.snapshot("base");
    assert_eq!(base_contents.len(), 2048);
    for i in 0..4u8 {
        let start = i as usize * SECTOR_SIZE as usize;
        assert!(base_contents[start..start + SECTOR_SIZE as usize]
            .iter()
            .all(|&b| b == i + 1));
    }
}

#[tokio::test]
async fn sparse_commit_only_copies_allocated_runs() {
    let top_len = 10 * 1024 * 1024;
    let chain = basic_chain(top_len);
    chain.add_layer("base", top_len); // pre-extend so untouched bytes are comparable
    chain.mark_allocated("top", 0, 2048); // 1 MiB
    chain.mark_allocated("top", 8192, 2048); // 1 MiB

    // Mark the pre-existing Base bytes so we can detect untouched regions.
    {
        let filler = vec![0xAAu8; top_len as usize];
        chain.write("base", 0, top_len / SECTOR_SIZE, &filler).await.unwrap();
    }
    let stamp = vec![0x42u8; 1024 * 1024];
    chain.write("top", 0, 2048, &stamp).await.unwrap();
    chain.write("top", 8192, 2048, &stamp).await.unwrap();

    let registry = Arc::new(JobRegistry::new());
    let job = commit_start(chain.clone(), &registry, config("top", "base", "active", 0, OnError::Report))
        .await
        .unwrap();
    let status = job.wait().await;
    assert!(status.is_success());

    let base = chain.snapshot("base");
    assert!(base[0..1024 * 1024].iter().all(|&b| b == 0x42));
    assert!(base[8192 * 512..8192 * 512 + 1024 * 1024].iter().all(|&b| b == 0x42));
    assert!(base[2 * 1024 * 1024..8192 * 512].iter().all(|&b| b == 0xAA));
}

#[tokio::test]
async fn rate_limited_commit_paces_to_target_speed() {
    // Small enough to keep the test fast, large enough relative to the
    // target speed to force several 100ms accounting windows.
    let top_len = 300 * 1024;
    let chain = basic_chain(top_len);
    chain.mark_allocated("top", 0, top_len / SECTOR_SIZE);

    let registry = Arc::new(JobRegistry::new());
    let started = Instant::now();
    let job = commit_start(
        chain.clone(),
        &registry,
        config("top", "base", "active", 100 * 1024, OnError::Report),
    )
    .await
    .unwrap();

    let status = job.wait().await;
    assert!(status.is_success());
    // ~3 windows of 100ms at 100 KiB/s for 300 KiB of work.
    assert!(started.elapsed() >= Duration::from_millis(200));
}

#[tokio::test]
async fn cancel_mid_run_leaves_chain_unlinked() {
    let top_len = 4 * 1024 * 1024;
    let chain = basic_chain(top_len);
    chain.mark_allocated("top", 0, top_len / SECTOR_SIZE);

    let registry = Arc::new(JobRegistry::new());
    let job = commit_start(chain.clone(), &registry, config("top", "base", "active", 0, OnError::Report))
        .await
        .unwrap();

    job.cancel();
    let status = job.wait().await;
    assert!(matches!(status, CommitStatus::Cancelled));

    // Chain must remain exactly as before: overlay still targets top.
    let overlay = chain.find_overlay(&"active", &"top").await.unwrap();
    assert_eq!(overlay, Some("active"));
}

#[tokio::test]
async fn enospc_under_stop_enospc_halts_and_preserves_chain() {
    let chain = basic_chain(4096);
    chain.mark_allocated("top", 0, 8);
    chain.inject_fault(
        "base",
        FaultOp::Write,
        FaultSpec {
            after: 2,
            remaining: None,
            raw_os_error: 28, // ENOSPC
        },
    );

    let registry = Arc::new(JobRegistry::new());
    let job = commit_start(
        chain.clone(),
        &registry,
        config("top", "base", "active", 0, OnError::StopEnospc),
    )
    .await
    .unwrap();
    let status = job.wait().await;
    match status {
        CommitStatus::Failed(err) => assert_eq!(err.raw_os_error(), Some(28)),
        other => panic!("expected ENOSPC failure, got {other:?}"),
    }

    let overlay = chain.find_overlay(&"active", &"top").await.unwrap();
    assert_eq!(overlay, Some("active"));
}

#[tokio::test]
async fn transient_eio_report_stops_but_ignore_recovers() {
    // REPORT: any I/O error is fatal.
    {
        let chain = basic_chain(2048);
        chain.mark_allocated("top", 0, 4);
        chain.inject_fault(
            "top",
            FaultOp::Read,
            FaultSpec {
                after: 1,
                remaining: Some(1),
                raw_os_error: 5, // EIO
            },
        );
        let registry = Arc::new(JobRegistry::new());
        let job = commit_start(chain.clone(), &registry, config("top", "base", "active", 0, OnError::Report))
            .await
            .unwrap();
        let status = job.wait().await;
        assert!(matches!(status, CommitStatus::Failed(_)));
    }

    // IGNORE: the same transient fault is retried and the job completes.
    {
        let chain = basic_chain(2048);
        chain.mark_allocated("top", 0, 4);
        chain.inject_fault(
            "top",
            FaultOp::Read,
            FaultSpec {
                after: 1,
                remaining: Some(1),
                raw_os_error: 5,
            },
        );
        let registry = Arc::new(JobRegistry::new());
        let job = commit_start(chain.clone(), &registry, config("top", "base", "active", 0, OnError::Ignore))
            .await
            .unwrap();
        let status = job.wait().await;
        assert!(status.is_success());
    }
}

#[tokio::test]
async fn start_rejects_top_equal_to_active() {
    let chain = basic_chain(2048);
    let registry = Arc::new(JobRegistry::new());
    let err = commit_start(chain, &registry, config("active", "base", "active", 0, OnError::Report))
        .await
        .unwrap_err();
    assert!(matches!(err, CommitStartError::TopIsActive));
}

#[tokio::test]
async fn start_rejects_top_equal_to_base() {
    let chain = basic_chain(2048);
    let registry = Arc::new(JobRegistry::new());
    let err = commit_start(chain, &registry, config("base", "base", "active", 0, OnError::Report))
        .await
        .unwrap_err();
    assert!(matches!(err, CommitStartError::TopAndBaseIdentical));
}

#[tokio::test]
async fn start_rejects_top_not_found_in_chain() {
    // "top" exists but nothing backs onto it, so it is not reachable from
    // "active" — find_overlay must return None rather than an error here.
    let chain = Arc::new(MemoryChain::new());
    chain.add_layer("active", 2048);
    chain.add_layer("top", 2048);
    chain.add_layer("base", 2048);
    chain.set_backing("top", "base");
    // Deliberately no `chain.set_backing("active", "top")`.

    let registry = Arc::new(JobRegistry::new());
    let err = commit_start(chain, &registry, config("top", "base", "active", 0, OnError::Report))
        .await
        .unwrap_err();
    assert!(matches!(err, CommitStartError::TopNotFound));
}

#[tokio::test]
async fn start_rejects_policy_requiring_iostatus_when_disabled() {
    let chain = basic_chain(2048);
    {
        let mut layers = chain.layers.lock().unwrap();
        layers.get_mut("active").unwrap().iostatus = false;
    }
    let registry = Arc::new(JobRegistry::new());
    let err = commit_start(chain, &registry, config("top", "base", "active", 0, OnError::StopAny))
        .await
        .unwrap_err();
    assert!(matches!(err, CommitStartError::InvalidParameterCombination));
}

#[tokio::test]
async fn start_widens_read_only_base_and_overlay_then_restores_on_completion() {
    let chain = basic_chain(2048);
    chain.mark_allocated("top", 0, 4);
    chain.set_read_only("base");
    chain.set_read_only("active");

    let registry = Arc::new(JobRegistry::new());
    let job = commit_start(chain.clone(), &registry, config("top", "base", "active", 0, OnError::Report))
        .await
        .unwrap();
    let status = job.wait().await;
    assert!(status.is_success());

    // Base no longer exists post-commit under our drop_intermediate impl's
    // naming, but the Overlay (active) flags must be restored read-only.
    let active_flags = chain.get_flags(&"active").await.unwrap();
    assert!(!active_flags.read_write);
}

#[tokio::test]
async fn second_commit_on_same_device_is_rejected_while_first_runs() {
    let chain = basic_chain(4 * 1024 * 1024);
    chain.mark_allocated("top", 0, (4 * 1024 * 1024) / SECTOR_SIZE);

    let registry = Arc::new(JobRegistry::new());
    let first = commit_start(chain.clone(), &registry, config("top", "base", "active", 1, OnError::Report))
        .await
        .unwrap();

    let err = commit_start(chain.clone(), &registry, config("top", "base", "active", 0, OnError::Report))
        .await
        .unwrap_err();
    assert!(matches!(err, CommitStartError::DeviceInUse));

    first.cancel();
    first.wait().await;
}
