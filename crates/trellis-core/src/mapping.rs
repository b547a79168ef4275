//! Memory-mapped file access with lock-free base publication
//!
//! Both engine files (the id directory and the region file) are accessed
//! through `Mapping`. Readers fetch the base pointer per access and never take
//! a lock; growing a file installs a fresh map and hands the previous one back
//! to the caller as a `RetiredMapping`, which must stay alive (via the GC
//! queue) until every reader epoch has advanced past the resize. A grown file
//! never moves existing bytes, so a stale base pointer still resolves every
//! offset that existed when it was fetched.

use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;

use memmap2::{Mmap, MmapMut};
use parking_lot::Mutex;

use crate::error::{TrellisError, TrellisResult};

/// How a database (and therefore each of its files) is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

enum MapInner {
    Rw(MmapMut),
    Ro(Mmap),
    /// A file that is still zero bytes long and cannot be mapped yet.
    Empty,
}

impl MapInner {
    fn ptr(&self) -> *mut u8 {
        match self {
            MapInner::Rw(m) => m.as_ptr() as *mut u8,
            MapInner::Ro(m) => m.as_ptr() as *mut u8,
            MapInner::Empty => std::ptr::null_mut(),
        }
    }

    fn len(&self) -> usize {
        match self {
            MapInner::Rw(m) => m.len(),
            MapInner::Ro(m) => m.len(),
            MapInner::Empty => 0,
        }
    }
}

/// A superseded map, kept alive until concurrent readers are done with it.
pub struct RetiredMapping {
    _map: Arc<MapInner>,
}

/// A growable memory-mapped file.
pub struct Mapping {
    path: PathBuf,
    file: std::fs::File,
    mode: AccessMode,
    current: Mutex<Arc<MapInner>>,
    base: AtomicPtr<u8>,
    len: AtomicUsize,
}

impl Mapping {
    /// Open (creating in read-write mode if absent) and map the file at `path`.
    pub fn open(path: &Path, mode: AccessMode) -> TrellisResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(mode == AccessMode::ReadWrite)
            .create(mode == AccessMode::ReadWrite)
            .open(path)
            .map_err(|e| io_error(path, "open", &e))?;

        let size = file.metadata().map_err(|e| io_error(path, "stat", &e))?.len() as usize;

        let inner = if size == 0 {
            MapInner::Empty
        } else {
            Self::map_file(&file, mode, path)?
        };

        let inner = Arc::new(inner);
        let base = AtomicPtr::new(inner.ptr());
        let len = AtomicUsize::new(inner.len());

        Ok(Self {
            path: path.to_path_buf(),
            file,
            mode,
            current: Mutex::new(inner),
            base,
            len,
        })
    }

    fn map_file(file: &std::fs::File, mode: AccessMode, path: &Path) -> TrellisResult<MapInner> {
        match mode {
            AccessMode::ReadWrite => {
                // SAFETY: the engine is the only writer of this file and all
                // concurrent access goes through the atomic slot protocols.
                let m = unsafe { MmapMut::map_mut(file) }.map_err(|e| io_error(path, "mmap", &e))?;
                Ok(MapInner::Rw(m))
            }
            AccessMode::ReadOnly => {
                let m = unsafe { Mmap::map(file) }.map_err(|e| io_error(path, "mmap", &e))?;
                Ok(MapInner::Ro(m))
            }
        }
    }

    /// Current base pointer. Null only while the file is still empty.
    pub fn data(&self) -> *mut u8 {
        self.base.load(Ordering::Acquire)
    }

    /// Current mapped length in bytes.
    pub fn size(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Grow the file to `new_size` and remap it.
    ///
    /// The caller must serialize resizes with its own structural mutex. The
    /// returned retirement (if any) must be pushed onto the GC queue; dropping
    /// it early would unmap memory a concurrent reader may still dereference.
    pub fn resize(&self, new_size: u64) -> TrellisResult<Option<RetiredMapping>> {
        assert_eq!(self.mode, AccessMode::ReadWrite, "resize of read-only mapping");
        assert!(new_size as usize >= self.size(), "mappings never shrink");

        self.file
            .set_len(new_size)
            .map_err(|e| io_error(&self.path, "grow", &e))?;

        let fresh = Arc::new(Self::map_file(&self.file, self.mode, &self.path)?);

        let mut cur = self.current.lock();
        let old = std::mem::replace(&mut *cur, fresh);
        self.base.store(cur.ptr(), Ordering::Release);
        self.len.store(cur.len(), Ordering::Release);
        drop(cur);

        if matches!(*old, MapInner::Empty) {
            Ok(None)
        } else {
            Ok(Some(RetiredMapping { _map: old }))
        }
    }

    /// Flush the mapping and then the file with the strongest platform
    /// primitive, so the data survives power loss, not just a crash.
    pub fn sync(&self) -> TrellisResult<()> {
        {
            let cur = self.current.lock();
            if let MapInner::Rw(m) = &**cur {
                m.flush().map_err(|e| io_error(&self.path, "msync", &e))?;
            }
        }
        if self.mode == AccessMode::ReadWrite {
            durable_sync(&self.file).map_err(|e| io_error(&self.path, "sync", &e))?;
        }
        Ok(())
    }
}

fn io_error(path: &Path, op: &str, e: &io::Error) -> TrellisError {
    TrellisError::Io {
        path: Some(path.to_path_buf()),
        kind: e.kind(),
        message: format!("{} failed: {}", op, e),
    }
}

/// File-level durable sync.
///
/// Linux gets fdatasync (data without metadata timestamps); macOS needs
/// F_FULLFSYNC because plain fsync there stops at the disk write cache.
/// Everything else falls back to the stdlib's best effort.
fn durable_sync(file: &std::fs::File) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: fdatasync on a file descriptor obtained from an open File.
        if unsafe { libc::fdatasync(file.as_raw_fd()) } == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: fcntl(F_FULLFSYNC) on a file descriptor obtained from an open File.
        if unsafe { libc::fcntl(file.as_raw_fd(), libc::F_FULLFSYNC) } == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "ios")))]
    {
        file.sync_data()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_empty_then_grow() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("m.bin");

        let m = Mapping::open(&path, AccessMode::ReadWrite).unwrap();
        assert_eq!(m.size(), 0);
        assert!(m.data().is_null());

        let retired = m.resize(8192).unwrap();
        assert!(retired.is_none(), "empty mapping has nothing to retire");
        assert_eq!(m.size(), 8192);
        assert!(!m.data().is_null());
    }

    #[test]
    fn test_grow_retires_old_map() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("m.bin");

        let m = Mapping::open(&path, AccessMode::ReadWrite).unwrap();
        m.resize(4096).unwrap();
        unsafe { *m.data() = 0xAB };

        let retired = m.resize(8192).unwrap();
        assert!(retired.is_some());
        assert_eq!(unsafe { *m.data() }, 0xAB, "contents survive a grow");
    }

    #[test]
    fn test_contents_persist_across_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("m.bin");

        {
            let m = Mapping::open(&path, AccessMode::ReadWrite).unwrap();
            m.resize(4096).unwrap();
            unsafe { std::ptr::write_bytes(m.data(), 0x5A, 16) };
            m.sync().unwrap();
        }
        {
            let m = Mapping::open(&path, AccessMode::ReadOnly).unwrap();
            assert_eq!(m.size(), 4096);
            let first = unsafe { std::slice::from_raw_parts(m.data(), 16) };
            assert!(first.iter().all(|&b| b == 0x5A));
        }
    }

    #[test]
    fn test_read_only_missing_file_fails() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("missing.bin");
        assert!(Mapping::open(&path, AccessMode::ReadOnly).is_err());
    }
}
