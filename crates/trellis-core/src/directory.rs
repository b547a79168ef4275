//! ID directory — logical object ids, reference counts, locations
//!
//! A memory-mapped array of 64-bit slots indexed by object id. Each slot packs
//! a reference count, a move-lock bit, the node kind, a cache tier and the
//! payload offset:
//!
//! ```text
//!   bits 0-12   reference count (0 = free, all-ones reserved for recovery)
//!   bit  13     move-lock (held while relocating or initializing the object)
//!   bits 14-15  node kind (leaf / inner)     \
//!   bits 16-17  cache tier                    | next-free pointer << 14
//!   bits 18-63  payload offset / 8           /  when the slot is free
//! ```
//!
//! Free slots form a LIFO chain threaded through the slots themselves; the
//! head lives in the file header next to the published root revision. All hot
//! operations (bump, release, lock, move) are single-word CAS loops; only
//! allocation takes a mutex, and only to serialize high-water-mark growth.

use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::config::Config;
use crate::error::{TrellisError, TrellisResult};
use crate::gc::GcQueue;
use crate::mapping::{AccessMode, Mapping};

/// "TRID" little-endian
const MAGIC: u32 = u32::from_le_bytes(*b"TRID");

const REF_MASK: u64 = (1 << 13) - 1;
const LOCK_BIT: u64 = 1 << 13;
const KIND_SHIFT: u32 = 14;
const KIND_MASK: u64 = 0b11 << KIND_SHIFT;
const TIER_SHIFT: u32 = 16;
const TIER_MASK: u64 = 0b11 << TIER_SHIFT;
const OFFSET_SHIFT: u32 = 18;
/// Offset value published at alloc time, before the first `move_object`.
const OFFSET_UNSET: u64 = (1 << 46) - 1;

const GC_RUNNING_FLAG: u32 = 1 << 8;

// File header layout (all fields little-endian).
const HDR_MAGIC: usize = 0;
const HDR_FLAGS: usize = 4;
const HDR_FIRST_FREE: usize = 8;
const HDR_MAX_ALLOCATED: usize = 16;
const HDR_MAX_UNALLOCATED: usize = 24;
const HDR_ROOT_REVISION: usize = 32;
const HEADER_SIZE: usize = 64;

/// A 40-bit logical object id. Zero is the null reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u64);

impl ObjectId {
    pub const NULL: ObjectId = ObjectId(0);

    pub fn new(raw: u64) -> Self {
        debug_assert!(raw < (1 << 40));
        ObjectId(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// What an id refers to. Determines how the payload bytes are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Leaf,
    Inner,
}

impl NodeKind {
    fn from_bits(bits: u64) -> NodeKind {
        if bits & 1 == 0 {
            NodeKind::Leaf
        } else {
            NodeKind::Inner
        }
    }

    fn to_bits(self) -> u64 {
        match self {
            NodeKind::Leaf => 0,
            NodeKind::Inner => 1,
        }
    }
}

/// Physical position of an object's header inside the region file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectLocation {
    /// Byte offset from the start of the payload area. Always 8-aligned.
    pub offset: u64,
    /// Cache tier hint; the engine keeps everything in tier 3.
    pub tier: u8,
}

/// Decoded view of one directory slot.
#[derive(Debug, Clone, Copy)]
pub struct ObjectInfo(u64);

impl ObjectInfo {
    pub fn from_raw(raw: u64) -> Self {
        ObjectInfo(raw)
    }

    pub fn ref_count(self) -> u16 {
        (self.0 & REF_MASK) as u16
    }

    pub fn locked(self) -> bool {
        self.0 & LOCK_BIT != 0
    }

    pub fn kind(self) -> NodeKind {
        NodeKind::from_bits((self.0 & KIND_MASK) >> KIND_SHIFT)
    }

    pub fn tier(self) -> u8 {
        ((self.0 & TIER_MASK) >> TIER_SHIFT) as u8
    }

    fn offset_units(self) -> u64 {
        self.0 >> OFFSET_SHIFT
    }

    /// The object has been allocated but its location was never published.
    pub fn unplaced(self) -> bool {
        self.offset_units() == OFFSET_UNSET
    }

    pub fn location(self) -> ObjectLocation {
        ObjectLocation { offset: self.offset_units() * 8, tier: self.tier() }
    }

    fn with_location(self, loc: ObjectLocation) -> ObjectInfo {
        debug_assert_eq!(loc.offset % 8, 0);
        let cleared = self.0 & !(TIER_MASK | (!0u64 << OFFSET_SHIFT));
        ObjectInfo(
            cleared | ((loc.tier as u64) << TIER_SHIFT) | ((loc.offset / 8) << OFFSET_SHIFT),
        )
    }

    fn matches(self, loc: ObjectLocation) -> bool {
        self.tier() == loc.tier && self.offset_units() * 8 == loc.offset
    }
}

/// Slot value for a freshly allocated object: refcount 1, location unset.
fn fresh_slot(kind: NodeKind) -> u64 {
    1 | (kind.to_bits() << KIND_SHIFT) | (OFFSET_UNSET << OFFSET_SHIFT)
}

fn next_free_of(raw: u64) -> u64 {
    raw >> 14
}

fn free_slot(next: u64) -> u64 {
    next << 14
}

/// RAII move-lock on one object id.
///
/// The holder may relocate the object or, before the id is exposed to other
/// threads, finish initializing it. Dropping the lock clears the bit; if the
/// last reference went away while the lock was held, the drop also completes
/// the deferred push onto the free list.
pub struct LocationLock<'a> {
    dir: &'a Directory,
    id: ObjectId,
}

impl<'a> LocationLock<'a> {
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Unlock and hand the id to the caller. Does not touch the refcount.
    pub fn into_id(self) -> ObjectId {
        let id = self.id;
        drop(self);
        id
    }
}

impl Drop for LocationLock<'_> {
    fn drop(&mut self) {
        self.dir.unlock(self.id);
    }
}

/// Counters reported by [`Directory::stats`].
#[derive(Debug, Clone, Copy)]
pub struct DirectoryStats {
    pub live: u64,
    pub free: u64,
    pub capacity: u64,
}

/// The id directory: a mapped slot array plus its growth mutex.
pub struct Directory {
    mapping: Mapping,
    gc: Arc<GcQueue>,
    mode: AccessMode,
    /// Serializes high-water allocation and file growth. Never held on the
    /// read path.
    grow_mutex: Mutex<()>,
}

impl Directory {
    /// Open the id file, creating and formatting it when absent (read-write).
    ///
    /// `allow_gc` permits opening while the gc-running flag is set, for
    /// recovery; otherwise such an open fails with `GcInProgress`.
    pub fn open(
        gc: Arc<GcQueue>,
        path: &Path,
        mode: AccessMode,
        config: &Config,
        allow_gc: bool,
    ) -> TrellisResult<Arc<Directory>> {
        let mapping = Mapping::open(path, mode)?;

        if mapping.size() == 0 {
            if mode == AccessMode::ReadOnly {
                return Err(TrellisError::Io {
                    path: Some(path.to_path_buf()),
                    kind: std::io::ErrorKind::NotFound,
                    message: "id file does not exist".into(),
                });
            }
            let size = round_to_page(HEADER_SIZE as u64 + config.max_objects * 8);
            mapping.resize(size)?;
            let dir = Directory { mapping, gc, mode, grow_mutex: Mutex::new(()) };
            dir.header_u32(HDR_MAGIC).store(MAGIC, Ordering::SeqCst);
            dir.header_u32(HDR_FLAGS).store(0, Ordering::SeqCst);
            dir.header_u64(HDR_FIRST_FREE).store(0, Ordering::SeqCst);
            dir.header_u64(HDR_MAX_ALLOCATED).store(0, Ordering::SeqCst);
            dir.header_u64(HDR_MAX_UNALLOCATED)
                .store((size - HEADER_SIZE as u64) / 8 - 1, Ordering::SeqCst);
            dir.header_u64(HDR_ROOT_REVISION).store(0, Ordering::SeqCst);
            return Ok(Arc::new(dir));
        }

        if mapping.size() < HEADER_SIZE + 16 {
            return Err(TrellisError::Corruption {
                path: Some(path.to_path_buf()),
                detail: "id file too short for its header".into(),
            });
        }

        let dir = Directory { mapping, gc, mode, grow_mutex: Mutex::new(()) };

        if dir.header_u32(HDR_MAGIC).load(Ordering::SeqCst) != MAGIC {
            return Err(TrellisError::Corruption {
                path: Some(path.to_path_buf()),
                detail: "bad magic in id file header".into(),
            });
        }
        let expected = (dir.mapping.size() as u64 - HEADER_SIZE as u64) / 8 - 1;
        if dir.header_u64(HDR_MAX_UNALLOCATED).load(Ordering::SeqCst) != expected {
            return Err(TrellisError::Corruption {
                path: Some(path.to_path_buf()),
                detail: "slot count disagrees with file size".into(),
            });
        }
        if dir.gc_running() && !allow_gc && mode == AccessMode::ReadWrite {
            return Err(TrellisError::GcInProgress {
                path: path.parent().unwrap_or(path).to_path_buf(),
            });
        }

        if mode == AccessMode::ReadWrite {
            // Whoever held these locks died with the previous process.
            dir.clear_stale_locks();
        }

        Ok(Arc::new(dir))
    }

    fn header_u64(&self, off: usize) -> &AtomicU64 {
        debug_assert!(off + 8 <= HEADER_SIZE);
        // SAFETY: the header page exists for the lifetime of the mapping and
        // `off` is 8-aligned within it.
        unsafe { &*(self.mapping.data().add(off) as *const AtomicU64) }
    }

    fn header_u32(&self, off: usize) -> &AtomicU32 {
        debug_assert!(off + 4 <= HEADER_SIZE);
        // SAFETY: as above; `off` is 4-aligned.
        unsafe { &*(self.mapping.data().add(off) as *const AtomicU32) }
    }

    fn slot(&self, id: ObjectId) -> &AtomicU64 {
        debug_assert!(!id.is_null());
        debug_assert!(id.raw() <= self.capacity());
        // SAFETY: id is bounds-checked against the mapped slot array; slots
        // are 8-aligned. The reference only lives for the current operation,
        // and resized mappings are retired through the GC queue.
        unsafe {
            &*(self.mapping.data().add(HEADER_SIZE + id.raw() as usize * 8) as *const AtomicU64)
        }
    }

    /// Highest id that fits in the file.
    pub fn capacity(&self) -> u64 {
        self.header_u64(HDR_MAX_UNALLOCATED).load(Ordering::SeqCst)
    }

    /// Highest id ever allocated.
    pub fn high_water(&self) -> u64 {
        self.header_u64(HDR_MAX_ALLOCATED).load(Ordering::SeqCst)
    }

    /// The durably published root revision cell.
    pub fn root_revision_cell(&self) -> &AtomicU64 {
        self.header_u64(HDR_ROOT_REVISION)
    }

    pub fn gc_running(&self) -> bool {
        self.header_u32(HDR_FLAGS).load(Ordering::SeqCst) & GC_RUNNING_FLAG != 0
    }

    /// Allocate an id with refcount 1, kind `kind` and an unpublished
    /// location. The returned lock must be held until the location is
    /// published via [`Directory::move_object`].
    pub fn alloc(&self, kind: NodeKind) -> TrellisResult<LocationLock<'_>> {
        let _g = self.grow_mutex.lock();
        debug_assert!(!self.gc_running());

        if self.header_u64(HDR_FIRST_FREE).load(Ordering::SeqCst) == 0 {
            let hw = self.high_water();
            if hw >= self.capacity() {
                self.grow()?;
            }
            let id = ObjectId::new(hw + 1);
            self.header_u64(HDR_MAX_ALLOCATED).store(id.raw(), Ordering::SeqCst);
            self.slot(id).store(fresh_slot(kind) | LOCK_BIT, Ordering::SeqCst);
            debug!(id = id.raw(), ?kind, "alloc");
            return Ok(LocationLock { dir: self, id });
        }

        // Pop the free list. The CAS only races concurrent releases pushing
        // new heads; pops are serialized by the growth mutex, so there is no
        // ABA hazard.
        let first_free = self.header_u64(HDR_FIRST_FREE);
        let mut head = first_free.load(Ordering::SeqCst);
        loop {
            debug_assert_ne!(head, 0);
            let next = next_free_of(self.slot(ObjectId::new(head)).load(Ordering::SeqCst));
            match first_free.compare_exchange(head, next, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => break,
                Err(cur) => head = cur,
            }
        }
        let id = ObjectId::new(head);
        self.slot(id).store(fresh_slot(kind) | LOCK_BIT, Ordering::SeqCst);
        debug!(id = id.raw(), ?kind, "alloc (reused)");
        Ok(LocationLock { dir: self, id })
    }

    fn grow(&self) -> TrellisResult<()> {
        let new_capacity = (self.capacity() + 1) * 2;
        if new_capacity >= 1 << 40 {
            return Err(TrellisError::ResourceExhausted {
                resource: "object ids",
                limit: 1 << 40,
            });
        }
        let new_size = round_to_page(HEADER_SIZE as u64 + new_capacity * 8);
        debug!(new_size, "growing id file");
        if let Some(retired) = self.mapping.resize(new_size)? {
            self.gc.push(Box::new(move || drop(retired)));
        }
        self.header_u64(HDR_MAX_UNALLOCATED)
            .store((new_size - HEADER_SIZE as u64) / 8 - 1, Ordering::SeqCst);
        Ok(())
    }

    /// Take one more reference on `id`.
    ///
    /// Returns false if the count is saturated and the caller must instead
    /// allocate a fresh copy of the object.
    pub fn bump(&self, id: ObjectId) -> bool {
        let slot = self.slot(id);
        let mut cur = slot.load(Ordering::SeqCst);
        loop {
            // All-ones is reserved so gc recovery can always add one more.
            if cur & REF_MASK == REF_MASK - 1 {
                return false;
            }
            debug_assert_ne!(cur & REF_MASK, 0, "bump of unreferenced id {}", id.raw());
            match slot.compare_exchange_weak(cur, cur + 1, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => return true,
                Err(v) => cur = v,
            }
        }
    }

    /// Drop one reference. The id was freed iff the returned info has
    /// refcount 0; its location fields are still valid in that case so the
    /// caller can reclaim the payload bytes.
    ///
    /// If the object is move-locked when the count hits zero, the free-list
    /// push is deferred to the lock holder's unlock; pushing here would let
    /// the slot be reallocated under the holder's feet.
    pub fn release(&self, id: ObjectId) -> ObjectInfo {
        debug_assert!(!self.gc_running());
        let slot = self.slot(id);
        let val = slot.fetch_sub(1, Ordering::SeqCst) - 1;
        debug_assert_ne!(val & REF_MASK, REF_MASK, "release of unreferenced id {}", id.raw());

        if val & REF_MASK == 0 && val & LOCK_BIT == 0 {
            self.push_free(id);
        }
        debug!(id = id.raw(), refs = val & REF_MASK, "release");
        ObjectInfo::from_raw(val)
    }

    fn push_free(&self, id: ObjectId) {
        let first_free = self.header_u64(HDR_FIRST_FREE);
        let slot = self.slot(id);
        loop {
            let head = first_free.load(Ordering::SeqCst);
            slot.store(free_slot(head), Ordering::SeqCst);
            if first_free
                .compare_exchange(head, id.raw(), Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return;
            }
        }
    }

    pub fn ref_count(&self, id: ObjectId) -> u16 {
        self.get(id).ref_count()
    }

    pub fn get(&self, id: ObjectId) -> ObjectInfo {
        ObjectInfo::from_raw(self.slot(id).load(Ordering::SeqCst))
    }

    /// Acquire the move-lock, failing if it is already held.
    pub fn try_lock(&self, id: ObjectId) -> Option<LocationLock<'_>> {
        let slot = self.slot(id);
        let mut cur = slot.load(Ordering::SeqCst);
        loop {
            if cur & LOCK_BIT != 0 {
                return None;
            }
            match slot.compare_exchange_weak(
                cur,
                cur | LOCK_BIT,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Some(LocationLock { dir: self, id }),
                Err(v) => cur = v,
            }
        }
    }

    /// Acquire the move-lock only if the object is still live at `loc`.
    ///
    /// The evacuator uses this so a racing writer that already freed or moved
    /// the object makes the copy abort instead of clobbering it.
    pub fn try_lock_at(&self, id: ObjectId, loc: ObjectLocation) -> Option<LocationLock<'_>> {
        let slot = self.slot(id);
        let mut cur = slot.load(Ordering::SeqCst);
        loop {
            let info = ObjectInfo::from_raw(cur);
            if info.ref_count() == 0 || info.locked() || !info.matches(loc) {
                return None;
            }
            match slot.compare_exchange_weak(
                cur,
                cur | LOCK_BIT,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Some(LocationLock { dir: self, id }),
                Err(v) => cur = v,
            }
        }
    }

    /// Acquire the move-lock, spinning while another thread holds it. Lock
    /// hold times are bounded by one memcpy, so contention is brief.
    pub fn spin_lock(&self, id: ObjectId) -> LocationLock<'_> {
        let slot = self.slot(id);
        loop {
            let cur = slot.load(Ordering::SeqCst);
            if cur & LOCK_BIT != 0 {
                std::hint::spin_loop();
                continue;
            }
            if slot
                .compare_exchange_weak(cur, cur | LOCK_BIT, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return LocationLock { dir: self, id };
            }
        }
    }

    /// Publish a new location for the locked object. A no-op if the last
    /// reference disappeared while the lock was held.
    pub fn move_object(&self, lock: &LocationLock<'_>, loc: ObjectLocation) {
        let slot = self.slot(lock.id);
        let mut cur = slot.load(Ordering::SeqCst);
        loop {
            if cur & REF_MASK == 0 {
                return;
            }
            let next = ObjectInfo::from_raw(cur).with_location(loc).0;
            match slot.compare_exchange_weak(cur, next, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => return,
                Err(v) => cur = v,
            }
        }
    }

    fn unlock(&self, id: ObjectId) {
        let slot = self.slot(id);
        let mut cur = slot.load(Ordering::SeqCst);
        loop {
            debug_assert_ne!(cur & LOCK_BIT, 0, "unlock of unlocked id {}", id.raw());
            if cur & REF_MASK == 0 {
                // Freed while we held the lock; complete the deferred push.
                self.push_free(id);
                return;
            }
            match slot.compare_exchange_weak(
                cur,
                cur & !LOCK_BIT,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return,
                Err(v) => cur = v,
            }
        }
    }

    /// Reject ids that can never have been allocated.
    pub fn validate_id(&self, id: ObjectId) -> TrellisResult<()> {
        if id.is_null() || id.raw() > self.high_water() {
            return Err(TrellisError::Corruption {
                path: Some(self.mapping.path().to_path_buf()),
                detail: format!("invalid object id {} discovered during traversal", id.raw()),
            });
        }
        Ok(())
    }

    /// Clear every move-lock bit. Only meaningful right after open, before
    /// any thread of this process takes a lock.
    fn clear_stale_locks(&self) {
        let hw = self.high_water();
        let mut cleared = 0u64;
        for i in 1..=hw {
            let slot = self.slot(ObjectId::new(i));
            if slot.load(Ordering::SeqCst) & LOCK_BIT != 0 {
                slot.fetch_and(!LOCK_BIT, Ordering::SeqCst);
                cleared += 1;
            }
        }
        if cleared > 0 {
            debug!(cleared, "cleared stale move-locks");
        }
    }

    // --- mark-and-sweep recovery ------------------------------------------

    /// Begin a collection: set the durable gc-running flag and clamp every
    /// nonzero refcount to 1.
    pub fn gc_start(&self) {
        let flags = self.header_u32(HDR_FLAGS);
        flags.store(flags.load(Ordering::SeqCst) | GC_RUNNING_FLAG, Ordering::SeqCst);
        let hw = self.high_water();
        for i in 1..=hw {
            let slot = self.slot(ObjectId::new(i));
            let v = slot.load(Ordering::SeqCst);
            if v & REF_MASK != 0 {
                slot.store((v & !REF_MASK) | 1, Ordering::SeqCst);
            }
        }
    }

    /// Mark `id` reachable. Returns true the first time the object is
    /// retained during this collection, telling the walker to descend.
    pub fn gc_retain(&self, id: ObjectId) -> TrellisResult<bool> {
        debug_assert!(self.gc_running());
        if id.raw() > self.high_water() {
            return Err(TrellisError::Corruption {
                path: Some(self.mapping.path().to_path_buf()),
                detail: format!("id {} outside allocated range during gc", id.raw()),
            });
        }
        let slot = self.slot(id);
        let refs = (slot.load(Ordering::SeqCst) & REF_MASK) as u16;
        if refs == 0 {
            return Err(TrellisError::Corruption {
                path: Some(self.mapping.path().to_path_buf()),
                detail: format!("reference to freed id {} found during gc", id.raw()),
            });
        }
        if refs as u64 == REF_MASK {
            return Err(TrellisError::ResourceExhausted {
                resource: "reference count",
                limit: REF_MASK,
            });
        }
        // During gc this may legally reach the otherwise reserved all-ones.
        slot.fetch_add(1, Ordering::SeqCst);
        Ok(refs == 1)
    }

    /// Finish a collection: remove the baseline 1 from live slots and rebuild
    /// the free list in ascending id order so low ids are reused first.
    pub fn gc_finish(&self) {
        debug_assert!(self.gc_running());
        let hw = self.high_water();
        let mut head = 0u64;
        let mut prev = 0u64;
        for i in 1..=hw {
            let slot = self.slot(ObjectId::new(i));
            let v = slot.load(Ordering::SeqCst);
            if v & REF_MASK > 1 {
                slot.store(v - 1, Ordering::SeqCst);
            } else {
                // Never retained: unreachable. Chain it behind the previous
                // free slot; its own next pointer is set when a successor
                // shows up, so it starts as the terminator.
                slot.store(free_slot(0), Ordering::SeqCst);
                if prev == 0 {
                    head = i;
                } else {
                    self.slot(ObjectId::new(prev)).store(free_slot(i), Ordering::SeqCst);
                }
                prev = i;
            }
        }
        self.header_u64(HDR_FIRST_FREE).store(head, Ordering::SeqCst);
        let flags = self.header_u32(HDR_FLAGS);
        flags.store(flags.load(Ordering::SeqCst) & !GC_RUNNING_FLAG, Ordering::SeqCst);
    }

    /// Count live and free slots up to the high-water mark.
    pub fn stats(&self) -> DirectoryStats {
        let hw = self.high_water();
        let mut live = 0u64;
        for i in 1..=hw {
            if self.slot(ObjectId::new(i)).load(Ordering::SeqCst) & REF_MASK != 0 {
                live += 1;
            }
        }
        DirectoryStats { live, free: hw - live, capacity: self.capacity() }
    }

    /// Flush the slot array and header to disk.
    pub fn sync(&self) -> TrellisResult<()> {
        self.mapping.sync()
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    pub fn path(&self) -> &Path {
        self.mapping.path()
    }

    /// Walk the free list, checking that every entry has refcount 0 and the
    /// chain terminates. Test and recovery aid.
    pub fn check_free_list(&self) -> TrellisResult<u64> {
        let mut seen = 0u64;
        let mut cur = self.header_u64(HDR_FIRST_FREE).load(Ordering::SeqCst);
        while cur != 0 {
            if cur > self.high_water() || seen > self.high_water() {
                return Err(TrellisError::Corruption {
                    path: Some(self.mapping.path().to_path_buf()),
                    detail: "free list cycle or out-of-range entry".into(),
                });
            }
            let v = self.slot(ObjectId::new(cur)).load(Ordering::SeqCst);
            if v & REF_MASK != 0 {
                return Err(TrellisError::Corruption {
                    path: Some(self.mapping.path().to_path_buf()),
                    detail: format!("free-list entry {} has nonzero refcount", cur),
                });
            }
            seen += 1;
            cur = next_free_of(v);
        }
        Ok(seen)
    }
}

fn round_to_page(n: u64) -> u64 {
    (n + 4095) & !4095
}
