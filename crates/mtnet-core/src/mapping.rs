//! Memory-mapped destination file for multi-segment downloads.
//!
//! The coordinator opens a [`FileMapping`] at the full file size (the file
//! is pre-allocated up front), carves one [`SegmentView`] per worker, and
//! workers write through their view without taking the mapping lock —
//! correctness comes from the views' ranges being disjoint by construction.

use anyhow::{bail, Context, Result};
use mmap_io::MemoryMappedFile;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

/// Thread-safe byte-window writer backed by a memory-mapped file.
pub struct FileMapping {
    mmap: RwLock<Option<MemoryMappedFile>>,
    path: PathBuf,
    size: u64,
    write_lock: Mutex<()>,
}

impl FileMapping {
    /// Create (or truncate) `path`, extend it to exactly `size` bytes and
    /// map it read/write. Parent directories are created as needed.
    pub fn open(path: &Path, size: u64) -> Result<Self> {
        if size == 0 {
            bail!("invalid mapping size: 0");
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create directory path: {}", parent.display())
            })?;
        }

        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("failed to create file: {}", path.display()))?;
        preallocate(&file, size)?;
        drop(file);

        let mmap = MemoryMappedFile::open_rw(path)
            .map_err(|e| anyhow::anyhow!("failed to map {}: {}", path.display(), e))?;

        Ok(Self {
            mmap: RwLock::new(Some(mmap)),
            path: path.to_path_buf(),
            size,
            write_lock: Mutex::new(()),
        })
    }

    /// Write `data` at `offset` under the mapping lock. Returns the number
    /// of bytes written, clamped to the mapped window.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<u64> {
        let _guard = self.write_lock.lock().unwrap();
        self.write_unchecked(offset, data)
    }

    /// Write without the internal lock. Only for producers that partition
    /// the address space a priori (see [`SegmentView`]); concurrent callers
    /// must never overlap.
    pub fn write_unchecked(&self, offset: u64, data: &[u8]) -> Result<u64> {
        if offset >= self.size || data.is_empty() {
            return Ok(0);
        }
        let n = data.len().min((self.size - offset) as usize);
        let guard = self.mmap.read().unwrap();
        let mmap = guard.as_ref().context("mapping is closed")?;
        mmap.update_region(offset, &data[..n])
            .map_err(|e| anyhow::anyhow!("mapped write at {} failed: {}", offset, e))?;
        Ok(n as u64)
    }

    /// Read up to `buf.len()` bytes at `offset` (clamped to the window).
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<u64> {
        if offset >= self.size || buf.is_empty() {
            return Ok(0);
        }
        let n = buf.len().min((self.size - offset) as usize);
        let guard = self.mmap.read().unwrap();
        let mmap = guard.as_ref().context("mapping is closed")?;
        mmap.read_into(offset, &mut buf[..n])
            .map_err(|e| anyhow::anyhow!("mapped read at {} failed: {}", offset, e))?;
        Ok(n as u64)
    }

    /// Trigger an OS-level write-back of the mapped region.
    pub fn flush(&self) -> Result<()> {
        let guard = self.mmap.read().unwrap();
        let mmap = guard.as_ref().context("mapping is closed")?;
        mmap.flush()
            .map_err(|e| anyhow::anyhow!("flush of {} failed: {}", self.path.display(), e))?;
        Ok(())
    }

    /// Unmap and close. Further writes fail; the file itself is kept.
    pub fn close(&self) {
        self.mmap.write().unwrap().take();
    }

    pub fn is_open(&self) -> bool {
        self.mmap.read().unwrap().is_some()
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Carve an exclusive window `[start, end)` for one producer. Callers
    /// are responsible for handing out disjoint ranges.
    pub fn view(self: &Arc<Self>, start: u64, end: u64) -> SegmentView {
        SegmentView {
            mapping: Arc::clone(self),
            start,
            end: end.min(self.size),
        }
    }
}

/// Preallocate `size` bytes. On Unix tries `posix_fallocate` for real block
/// allocation; falls back to `set_len` on failure or non-Unix.
fn preallocate(file: &File, size: u64) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        let r = unsafe { libc::posix_fallocate(fd, 0, size as libc::off_t) };
        if r == 0 {
            return Ok(());
        }
        tracing::debug!(errno = r, "posix_fallocate failed, falling back to set_len");
    }
    file.set_len(size).context("failed to preallocate file")?;
    Ok(())
}

/// A writer for one exclusive sub-range of a [`FileMapping`].
///
/// Writes are sequential within the window: `write_at(written, data)`
/// places `data` at `start + written` and clamps to the window end, so a
/// worker can never spill into a sibling's range.
#[derive(Clone)]
pub struct SegmentView {
    mapping: Arc<FileMapping>,
    start: u64,
    end: u64,
}

impl SegmentView {
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    /// Lock-free write of `data` at window offset `written`. Returns bytes
    /// actually written (0 once the window is full or the mapping closed).
    pub fn write_at(&self, written: u64, data: &[u8]) -> Result<u64> {
        let remaining = self.len().saturating_sub(written);
        if remaining == 0 {
            return Ok(0);
        }
        let n = data.len().min(remaining as usize);
        self.mapping
            .write_unchecked(self.start + written, &data[..n])
    }
}
