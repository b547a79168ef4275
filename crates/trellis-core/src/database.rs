//! Database facade — files, recovery, sessions
//!
//! Owns the two engine files (`trellis.ids`, `trellis.data`), the GC queue,
//! and the session registry. Opening performs recovery in three steps: stale
//! move-locks are cleared (their owners died with the previous process), the
//! relocation queue is reconciled into fresh usage accounting, and — when the
//! id directory says a collection was interrupted and the caller asked for
//! recovery — the mark-and-sweep is replayed against the published root
//! before any writes are accepted.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::Config;
use crate::directory::{Directory, DirectoryStats, NodeKind, ObjectId};
use crate::error::{TrellisError, TrellisResult};
use crate::gc::GcQueue;
use crate::mapping::AccessMode;
use crate::node::{InnerRef, LeafRef, Node};
use crate::region::{RegionAllocator, RegionStats};
use crate::session::{ReadSession, SessionCore, SessionShared};
use crate::write::WriteSession;

const IDS_FILE: &str = "trellis.ids";
const DATA_FILE: &str = "trellis.data";

/// Counters reported by [`Database::stats`].
#[derive(Debug, Clone, Copy)]
pub struct DatabaseStats {
    pub directory: DirectoryStats,
    pub region: RegionStats,
    pub gc_pending: usize,
    /// Lowest swap position any live session currently publishes, per cache
    /// tier; `u64::MAX` when no reader is mid-descent.
    pub min_swap_positions: [u64; 4],
}

/// A trellis database: one radix trie persisted across two files.
pub struct Database {
    /// Dropped first so the evacuator joins while everything is still alive.
    region: RegionAllocator,
    dir: Arc<Directory>,
    gc: Arc<GcQueue>,
    sessions: Mutex<Vec<Weak<SessionShared>>>,
    root_mutex: Mutex<()>,
    writer_live: AtomicBool,
    mode: AccessMode,
    path: PathBuf,
}

impl Database {
    /// Open (creating on first use in read-write mode) the database in `dir`.
    ///
    /// Fails with `GcInProgress` when a collection was interrupted; use
    /// [`Database::open_with_recovery`] to replay it.
    pub fn open<P: AsRef<Path>>(path: P, mode: AccessMode, config: Config) -> TrellisResult<Self> {
        Self::open_impl(path.as_ref(), mode, config, false)
    }

    /// Open read-write, replaying an interrupted mark-and-sweep if needed.
    pub fn open_with_recovery<P: AsRef<Path>>(path: P, config: Config) -> TrellisResult<Self> {
        Self::open_impl(path.as_ref(), AccessMode::ReadWrite, config, true)
    }

    fn open_impl(
        path: &Path,
        mode: AccessMode,
        config: Config,
        recover: bool,
    ) -> TrellisResult<Self> {
        config.validate().map_err(|what| TrellisError::InvalidArgument { what })?;
        if mode == AccessMode::ReadWrite {
            std::fs::create_dir_all(path).map_err(|e| TrellisError::Io {
                path: Some(path.to_path_buf()),
                kind: e.kind(),
                message: format!("failed to create database directory: {}", e),
            })?;
        }

        let gc = GcQueue::new();
        let dir =
            Directory::open(Arc::clone(&gc), &path.join(IDS_FILE), mode, &config, recover)?;
        let region = RegionAllocator::open(
            Arc::clone(&gc),
            Arc::clone(&dir),
            &path.join(DATA_FILE),
            mode,
            &config,
        )?;

        let db = Database {
            region,
            dir,
            gc,
            sessions: Mutex::new(Vec::new()),
            root_mutex: Mutex::new(()),
            writer_live: AtomicBool::new(false),
            mode,
            path: path.to_path_buf(),
        };

        if db.dir.gc_running() && mode == AccessMode::ReadWrite && recover {
            db.replay_gc()?;
        }

        Ok(db)
    }

    /// Replay an interrupted collection: re-clamp, re-mark from the published
    /// root, sweep.
    fn replay_gc(&self) -> TrellisResult<()> {
        info!("replaying interrupted garbage collection");
        self.dir.gc_start();
        let root = ObjectId::new(self.dir.root_revision_cell().load(Ordering::SeqCst));
        if !root.is_null() {
            let epoch = self.gc.register();
            self.gc.pin(&epoch);
            let walked = self.recursive_retain(root);
            epoch.idle();
            walked?;
        }
        self.dir.gc_finish();
        info!(root = root.raw(), "garbage collection replay complete");
        Ok(())
    }

    // --- sessions ----------------------------------------------------------

    /// Pin the current root revision and read from it until dropped.
    pub fn start_read_session(&self) -> TrellisResult<ReadSession<'_>> {
        let root = self.get_root_revision()?;
        Ok(ReadSession::new(self, root))
    }

    /// Start the single write session. Fails while another one is live or
    /// the database is read-only.
    pub fn start_write_session(&self) -> TrellisResult<WriteSession<'_>> {
        if self.mode == AccessMode::ReadOnly {
            return Err(TrellisError::InvalidArgument {
                what: "write session on a read-only database".into(),
            });
        }
        if self
            .writer_live
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(TrellisError::ResourceExhausted { resource: "write sessions", limit: 1 });
        }

        let root = match self.get_root_revision() {
            Ok(r) => r,
            Err(e) => {
                self.writer_live.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        let mut core = SessionCore::new(self, root);
        // Seed the version above everything reachable, so the first mutation
        // of any pre-existing node copies instead of patching.
        match core.root_version() {
            Ok(v) => Ok(WriteSession::new(core, v + 1)),
            Err(e) => {
                core.close();
                self.writer_done();
                Err(e)
            }
        }
    }

    pub(crate) fn writer_done(&self) {
        self.writer_live.store(false, Ordering::SeqCst);
    }

    pub(crate) fn register_session(&self, shared: &Arc<SessionShared>) {
        let mut sessions = self.sessions.lock();
        sessions.retain(|w| w.upgrade().is_some());
        sessions.push(Arc::downgrade(shared));
    }

    /// The lowest swap position any live session has published, per tier.
    /// `u64::MAX` means no session is inside a guarded interval.
    pub(crate) fn min_swap_positions(&self) -> [u64; 4] {
        let mut out = [u64::MAX; 4];
        let mut sessions = self.sessions.lock();
        sessions.retain(|w| match w.upgrade() {
            Some(s) => {
                for (o, p) in out.iter_mut().zip(s.swap_pos.iter()) {
                    *o = (*o).min(p.load(Ordering::SeqCst));
                }
                true
            }
            None => false,
        });
        out
    }

    // --- root revision -----------------------------------------------------

    /// The published root, with one reference taken for the caller. Pair
    /// with [`Database::release_revision`].
    pub fn get_root_revision(&self) -> TrellisResult<ObjectId> {
        let _l = self.root_mutex.lock();
        let root = ObjectId::new(self.dir.root_revision_cell().load(Ordering::SeqCst));
        self.retain(root)
    }

    /// Give back a reference obtained from [`Database::get_root_revision`].
    pub fn release_revision(&self, root: ObjectId) -> TrellisResult<()> {
        if root.is_null() {
            return Ok(());
        }
        let epoch = self.gc.register();
        self.gc.pin(&epoch);
        let res = self.release_tree(root);
        epoch.idle();
        res
    }

    /// Retain-new-release-old swap of the published root. Caller must be
    /// inside a guarded interval.
    pub(crate) fn publish_root(&self, root: ObjectId) -> TrellisResult<()> {
        let _l = self.root_mutex.lock();
        let cell = self.dir.root_revision_cell();
        let cur = ObjectId::new(cell.load(Ordering::SeqCst));
        if cur == root {
            return Ok(());
        }
        self.retain(root)?;
        cell.store(root.raw(), Ordering::SeqCst);
        info!(root = root.raw(), "published root revision");
        if !cur.is_null() {
            self.release_tree(cur)?;
        }
        Ok(())
    }

    // --- object plumbing ---------------------------------------------------

    pub(crate) fn gc(&self) -> &GcQueue {
        &self.gc
    }

    pub(crate) fn dir(&self) -> &Directory {
        &self.dir
    }

    pub(crate) fn region(&self) -> &RegionAllocator {
        &self.region
    }

    /// Resolve an id to a typed node view. Caller must be inside a guarded
    /// interval.
    pub(crate) fn resolve(&self, id: ObjectId) -> TrellisResult<Node> {
        self.dir.validate_id(id)?;
        let info = self.dir.get(id);
        if info.ref_count() == 0 {
            return Err(TrellisError::Corruption {
                path: None,
                detail: format!("traversal reached freed id {}", id.raw()),
            });
        }
        if info.unplaced() {
            return Err(TrellisError::Corruption {
                path: None,
                detail: format!("traversal reached unplaced id {}", id.raw()),
            });
        }
        let (ptr, size) = self.region.object(info.location())?;
        Ok(match info.kind() {
            // SAFETY: kind bits select the layout the payload was written with.
            NodeKind::Leaf => Node::Leaf(unsafe { LeafRef::from_raw(ptr, size) }),
            NodeKind::Inner => Node::Inner(unsafe { InnerRef::from_raw(ptr, size) }),
        })
    }

    /// Take one reference on a (possibly null) id.
    ///
    /// A read-only database never touches refcounts: there is no writer to
    /// race, so snapshots need no pinning and the mapping stays untouched.
    pub(crate) fn retain(&self, id: ObjectId) -> TrellisResult<ObjectId> {
        if id.is_null() || self.mode == AccessMode::ReadOnly {
            return Ok(id);
        }
        if !self.dir.bump(id) {
            return Err(TrellisError::ResourceExhausted {
                resource: "reference count",
                limit: (1 << 13) - 2,
            });
        }
        Ok(id)
    }

    /// Drop one reference on `id`; when it hits zero, reclaim the payload
    /// bytes and recursively release the children. Caller must be inside a
    /// guarded interval.
    pub(crate) fn release_tree(&self, id: ObjectId) -> TrellisResult<()> {
        if id.is_null() || self.mode == AccessMode::ReadOnly {
            return Ok(());
        }
        let info = self.dir.release(id);
        if info.ref_count() != 0 {
            return Ok(());
        }
        if info.unplaced() {
            // Freed before its payload was ever placed; nothing to reclaim.
            return Ok(());
        }
        let loc = info.location();
        match info.kind() {
            NodeKind::Leaf => {
                self.region.deallocate(loc);
            }
            NodeKind::Inner => {
                // Read the children before the byte accounting drops; the
                // region cannot be recycled while they are still counted.
                let (ptr, size) = self.region.object(loc)?;
                // SAFETY: location and size came from the directory slot this
                // thread just transitioned to refcount 0.
                let inner = unsafe { InnerRef::from_raw(ptr, size) };
                let value = inner.value_id();
                let children = inner.children();
                self.region.deallocate(loc);
                self.release_tree(value)?;
                for c in children {
                    self.release_tree(c)?;
                }
            }
        }
        Ok(())
    }

    /// Mark-and-sweep walk: bump `id`, descend only on first visit.
    pub(crate) fn recursive_retain(&self, id: ObjectId) -> TrellisResult<()> {
        if id.is_null() {
            return Ok(());
        }
        let first_visit = self.dir.gc_retain(id)?;
        if !first_visit {
            return Ok(());
        }
        if let Node::Inner(inner) = self.resolve(id)? {
            self.recursive_retain(inner.value_id())?;
            for c in inner.children() {
                self.recursive_retain(c)?;
            }
        }
        Ok(())
    }

    pub(crate) fn begin_collect_garbage(&self) -> TrellisResult<()> {
        {
            let mut sessions = self.sessions.lock();
            sessions.retain(|w| w.upgrade().is_some());
            // The writer running the collection holds one registered session.
            if sessions.len() > 1 {
                return Err(TrellisError::InvalidArgument {
                    what: "garbage collection requires all other sessions closed".into(),
                });
            }
        }
        self.dir.gc_start();
        Ok(())
    }

    pub(crate) fn finish_collect_garbage(&self) -> TrellisResult<()> {
        self.dir.gc_finish();
        Ok(())
    }

    // --- maintenance -------------------------------------------------------

    /// Cooperative reclamation hook: runs any retirements whose readers have
    /// moved on. Called from the write paths; cheap when there is nothing to
    /// do.
    pub fn ensure_free_space(&self) {
        self.gc.poll();
    }

    /// Durably flush both files.
    pub fn sync(&self) -> TrellisResult<()> {
        self.dir.sync()?;
        self.region.sync()
    }

    pub fn stats(&self) -> DatabaseStats {
        DatabaseStats {
            directory: self.dir.stats(),
            region: self.region.stats(),
            gc_pending: self.gc.pending(),
            min_swap_positions: self.min_swap_positions(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Walk the published root and verify the structural invariants: ids in
    /// range, every reachable refcount nonzero, children present, and the
    /// free list well formed.
    pub fn validate(&self) -> TrellisResult<()> {
        self.dir.check_free_list()?;
        let root = self.get_root_revision()?;
        if root.is_null() {
            return Ok(());
        }
        let epoch = self.gc.register();
        self.gc.pin(&epoch);
        let walked = self.validate_walk(root);
        epoch.idle();
        let released = self.release_revision(root);
        walked?;
        released
    }

    fn validate_walk(&self, id: ObjectId) -> TrellisResult<()> {
        match self.resolve(id)? {
            Node::Leaf(_) => Ok(()),
            Node::Inner(inner) => {
                let children = inner.children();
                if children.iter().any(|c| c.is_null()) {
                    return Err(TrellisError::Corruption {
                        path: None,
                        detail: format!("null child slot in inner node {}", id.raw()),
                    });
                }
                let value = inner.value_id();
                if !value.is_null() {
                    self.validate_walk(value)?;
                }
                for c in children {
                    self.validate_walk(c)?;
                }
                Ok(())
            }
        }
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if self.mode == AccessMode::ReadWrite {
            if let Err(e) = self.sync() {
                warn!(error = %e, "flush on close failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_creates_files() {
        let tmp = TempDir::new().unwrap();
        let db = Database::open(tmp.path(), AccessMode::ReadWrite, Config::small()).unwrap();
        assert!(tmp.path().join(IDS_FILE).exists());
        assert!(tmp.path().join(DATA_FILE).exists());
        assert!(db.get_root_revision().unwrap().is_null());
    }

    #[test]
    fn test_read_only_open_requires_existing_db() {
        let tmp = TempDir::new().unwrap();
        assert!(Database::open(tmp.path(), AccessMode::ReadOnly, Config::small()).is_err());

        drop(Database::open(tmp.path(), AccessMode::ReadWrite, Config::small()).unwrap());
        let db = Database::open(tmp.path(), AccessMode::ReadOnly, Config::small()).unwrap();
        assert!(db.start_write_session().is_err());
        let rs = db.start_read_session().unwrap();
        assert_eq!(rs.get(b"anything").unwrap(), None);
    }

    #[test]
    fn test_single_writer_enforced() {
        let tmp = TempDir::new().unwrap();
        let db = Database::open(tmp.path(), AccessMode::ReadWrite, Config::small()).unwrap();
        let ws = db.start_write_session().unwrap();
        let second = db.start_write_session();
        assert!(matches!(second, Err(TrellisError::ResourceExhausted { .. })));
        drop(ws);
        assert!(db.start_write_session().is_ok());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::small();
        config.max_objects = 1;
        let err = Database::open(tmp.path(), AccessMode::ReadWrite, config).err().unwrap();
        assert!(matches!(err, TrellisError::InvalidArgument { .. }));
    }

    #[test]
    fn test_validate_empty_db() {
        let tmp = TempDir::new().unwrap();
        let db = Database::open(tmp.path(), AccessMode::ReadWrite, Config::small()).unwrap();
        db.validate().unwrap();
    }

    #[test]
    fn test_idle_sessions_publish_no_swap_position() {
        let tmp = TempDir::new().unwrap();
        let db = Database::open(tmp.path(), AccessMode::ReadWrite, Config::small()).unwrap();
        let _rs = db.start_read_session().unwrap();
        // The session exists but is not mid-descent, so the allocator sees no
        // byte range it must preserve.
        assert_eq!(db.stats().min_swap_positions, [u64::MAX; 4]);
    }
}
