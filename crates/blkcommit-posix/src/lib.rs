//! Reference POSIX-file [`ImageChain`] backend.
//!
//! Grounded on `block/raw-posix.c`'s flag-to-`open()` mapping (O_DIRECT for
//! no-cache, O_DSYNC for write-through, native AIO reserved for O_DIRECT
//! files), its `SEEK_DATA`/`SEEK_HOLE` allocation probing, and its NFS
//! `force_linearize` detection via `statfs`.
//!
//! Raw files carry no backing-file pointer of their own (unlike a format
//! such as qcow2), so this backend tracks chain topology (which layer backs
//! which) as explicit in-process registration rather than on-disk metadata.
//! Byte-level I/O is the only thing actually delegated to POSIX.

#![deny(missing_docs)]
#![deny(unreachable_pub)]

mod aligned;

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use blkcommit_core::{Allocation, ImageChain, OpenFlags, ReopenQueue, SECTOR_SIZE};

use aligned::AlignedBuffer;

/// How a layer should be opened, mirroring the cache-mode knobs the original
/// exposes at the block-device level.
#[derive(Debug, Clone)]
pub struct OpenSpec {
    /// Path to the backing regular file.
    pub path: PathBuf,
    /// Initial read/write mode.
    pub read_write: bool,
    /// "no-cache": open with `O_DIRECT`.
    pub no_cache: bool,
    /// "write-back cache": if false and `no_cache` is also false, open with
    /// `O_DSYNC` for write-through durability.
    pub write_back_cache: bool,
}

struct LayerFile {
    path: PathBuf,
    file: Mutex<File>,
    no_cache: bool,
    write_back_cache: bool,
    flags: Mutex<OpenFlags>,
    iostatus: AtomicBool,
    /// Force scatter-gather linearisation: set when the filesystem is known
    /// to split vectored direct I/O (observed for NFS with no-cache).
    force_linearize: bool,
    backing: Mutex<Option<Arc<str>>>,
}

/// A POSIX-file-backed image chain.
///
/// Layers are registered by name with [`PosixChain::register`] before a
/// commit job references them; the chain itself has no notion of "open an
/// image file and discover its backing chain" the way a real format driver
/// would, since modelling that is orthogonal to the commit engine's contract.
#[derive(Default)]
pub struct PosixChain {
    layers: Mutex<HashMap<Arc<str>, Arc<LayerFile>>>,
}

impl PosixChain {
    /// An empty chain.
    pub fn new() -> Self {
        Self {
            layers: Mutex::new(HashMap::new()),
        }
    }

    /// Open `spec.path` and register it under `name`, backed by `backing`
    /// (the next layer down the chain, if any).
    pub fn register(
        &self,
        name: impl Into<Arc<str>>,
        spec: OpenSpec,
        backing: Option<Arc<str>>,
    ) -> io::Result<()> {
        let name = name.into();
        let file = open_with_flags(&spec.path, spec.read_write, spec.no_cache, spec.write_back_cache)?;
        let force_linearize = is_nfs(&file)?;
        if force_linearize {
            tracing::debug!(layer = %name, path = ?spec.path, "NFS filesystem detected, forcing scatter-gather linearisation");
        }
        let layer = Arc::new(LayerFile {
            path: spec.path,
            file: Mutex::new(file),
            no_cache: spec.no_cache,
            write_back_cache: spec.write_back_cache,
            flags: Mutex::new(OpenFlags {
                read_write: spec.read_write,
            }),
            iostatus: AtomicBool::new(true),
            force_linearize,
            backing: Mutex::new(backing),
        });
        self.layers.lock().unwrap().insert(name, layer);
        Ok(())
    }

    /// Disable iostatus reporting for `name` (affects `STOP_ANY`/`STOP_ENOSPC`
    /// eligibility at `commit_start`).
    pub fn set_iostatus_enabled(&self, name: &str, enabled: bool) {
        if let Some(layer) = self.layers.lock().unwrap().get(name) {
            layer.iostatus.store(enabled, Ordering::Relaxed);
        }
    }

    fn layer(&self, name: &str) -> Arc<LayerFile> {
        self.layers
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .unwrap_or_else(|| panic!("unregistered layer {name:?}"))
    }
}

fn open_with_flags(path: &Path, read_write: bool, no_cache: bool, write_back_cache: bool) -> io::Result<File> {
    let mut custom_flags = 0;
    if no_cache {
        custom_flags |= libc::O_DIRECT;
    } else if !write_back_cache {
        custom_flags |= libc::O_DSYNC;
    }
    OpenOptions::new()
        .read(true)
        .write(read_write)
        .custom_flags(custom_flags)
        .open(path)
}

fn is_nfs(file: &File) -> io::Result<bool> {
    // Linux's NFS magic number from <linux/magic.h>.
    const NFS_SUPER_MAGIC: i64 = 0x6969;
    unsafe {
        let mut stfs: libc::statfs = std::mem::zeroed();
        if libc::fstatfs(file.as_raw_fd(), &mut stfs) != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(i64::from(stfs.f_type) == NFS_SUPER_MAGIC)
    }
}

impl ImageChain for PosixChain {
    type Layer = Arc<str>;

    async fn length(&self, layer: &Self::Layer) -> io::Result<u64> {
        let layer = self.layer(layer);
        tokio::task::spawn_blocking(move || {
            let file = layer.file.lock().unwrap();
            Ok(file.metadata()?.len())
        })
        .await
        .map_err(join_err)?
    }

    async fn truncate(&self, layer: &Self::Layer, bytes: u64) -> io::Result<()> {
        let layer = self.layer(layer);
        tokio::task::spawn_blocking(move || {
            let file = layer.file.lock().unwrap();
            file.set_len(bytes)
        })
        .await
        .map_err(join_err)?
    }

    async fn read(
        &self,
        layer: &Self::Layer,
        sector: u64,
        n_sectors: u64,
        buf: &mut [u8],
    ) -> io::Result<()> {
        let layer = self.layer(layer);
        let len = (n_sectors * SECTOR_SIZE) as usize;
        let offset = sector * SECTOR_SIZE;
        let bytes = tokio::task::spawn_blocking(move || -> io::Result<Vec<u8>> {
            let file = layer.file.lock().unwrap();
            if layer.no_cache || layer.force_linearize {
                let mut aligned = AlignedBuffer::new(len, SECTOR_SIZE as usize);
                file.read_exact_at(aligned.as_mut_slice(), offset)?;
                Ok(aligned.as_slice().to_vec())
            } else {
                let mut tmp = vec![0u8; len];
                file.read_exact_at(&mut tmp, offset)?;
                Ok(tmp)
            }
        })
        .await
        .map_err(join_err)??;
        buf[..len].copy_from_slice(&bytes);
        Ok(())
    }

    async fn write(
        &self,
        layer: &Self::Layer,
        sector: u64,
        n_sectors: u64,
        buf: &[u8],
    ) -> io::Result<()> {
        let layer = self.layer(layer);
        let len = (n_sectors * SECTOR_SIZE) as usize;
        let offset = sector * SECTOR_SIZE;
        let owned = buf[..len].to_vec();
        tokio::task::spawn_blocking(move || -> io::Result<()> {
            let file = layer.file.lock().unwrap();
            if layer.no_cache || layer.force_linearize {
                let mut aligned = AlignedBuffer::new(len, SECTOR_SIZE as usize);
                aligned.as_mut_slice().copy_from_slice(&owned);
                file.write_all_at(aligned.as_slice(), offset)
            } else {
                file.write_all_at(&owned, offset)
            }
        })
        .await
        .map_err(join_err)?
    }

    async fn is_allocated_above(
        &self,
        top: &Self::Layer,
        _base: &Self::Layer,
        sector: u64,
        n_req: u64,
    ) -> io::Result<(Allocation, u64)> {
        let layer = self.layer(top);
        tokio::task::spawn_blocking(move || seek_probe(&layer, sector, n_req))
            .await
            .map_err(join_err)?
    }

    async fn find_overlay(
        &self,
        _active: &Self::Layer,
        top: &Self::Layer,
    ) -> io::Result<Option<Self::Layer>> {
        let layers = self.layers.lock().unwrap();
        Ok(layers.iter().find_map(|(name, layer)| {
            if layer.backing.lock().unwrap().as_deref() == Some(&**top) {
                Some(name.clone())
            } else {
                None
            }
        }))
    }

    async fn get_flags(&self, layer: &Self::Layer) -> io::Result<OpenFlags> {
        Ok(*self.layer(layer).flags.lock().unwrap())
    }

    async fn reopen_multiple(&self, queue: ReopenQueue<Self::Layer>) -> io::Result<()> {
        let entries = queue.into_entries();
        let mut opened = Vec::with_capacity(entries.len());
        for (name, flags) in &entries {
            let layer = self.layer(name);
            let new_file = open_with_flags(&layer.path, flags.read_write, layer.no_cache, layer.write_back_cache)?;
            opened.push((layer, *flags, new_file));
        }
        // All reopens succeeded; commit them together.
        for (layer, flags, new_file) in opened {
            *layer.file.lock().unwrap() = new_file;
            *layer.flags.lock().unwrap() = flags;
        }
        Ok(())
    }

    async fn drop_intermediate(
        &self,
        _active: &Self::Layer,
        top: &Self::Layer,
        base: &Self::Layer,
    ) -> io::Result<()> {
        let overlay = {
            let layers = self.layers.lock().unwrap();
            layers
                .iter()
                .find(|(_, layer)| layer.backing.lock().unwrap().as_deref() == Some(&**top))
                .map(|(name, layer)| (name.clone(), layer.clone()))
        };
        if let Some((_, overlay)) = overlay {
            *overlay.backing.lock().unwrap() = Some(base.clone());
        }
        self.layers.lock().unwrap().remove(top);
        Ok(())
    }

    fn iostatus_is_enabled(&self, layer: &Self::Layer) -> bool {
        self.layer(layer).iostatus.load(Ordering::Relaxed)
    }

    fn block_align(&self, _layer: &Self::Layer) -> u64 {
        SECTOR_SIZE
    }
}

fn seek_probe(layer: &LayerFile, sector: u64, n_req: u64) -> io::Result<(Allocation, u64)> {
    let fd = layer.file.lock().unwrap().as_raw_fd();
    let start = (sector * SECTOR_SIZE) as i64;
    let want_end = start + (n_req * SECTOR_SIZE) as i64;

    let data_pos = unsafe { libc::lseek(fd, start, libc::SEEK_DATA) };
    let allocated = if data_pos == start {
        true
    } else if data_pos < 0 && io::Error::last_os_error().raw_os_error() == Some(libc::ENXIO) {
        // No more data past `start`: everything to EOF is a hole.
        false
    } else if data_pos > start {
        false
    } else {
        return Err(io::Error::last_os_error());
    };

    let boundary = if allocated {
        let hole_pos = unsafe { libc::lseek(fd, start, libc::SEEK_HOLE) };
        if hole_pos < 0 {
            want_end
        } else {
            hole_pos
        }
    } else if data_pos > start {
        data_pos
    } else {
        want_end
    };

    let end = boundary.min(want_end).max(start + SECTOR_SIZE as i64);
    let n = ((end - start) as u64) / SECTOR_SIZE;
    let allocation = if allocated { Allocation::Allocated } else { Allocation::NotAllocated };
    Ok((allocation, n.min(n_req).max(1)))
}

fn join_err(err: tokio::task::JoinError) -> io::Error {
    io::Error::other(format!("blocking I/O task panicked: {err}"))
}
