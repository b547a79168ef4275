//! Region allocator — bump allocation inside fixed-size regions, with a
//! background evacuator that compacts sparse regions
//!
//! The payload file is one 4096-byte header page followed by
//! `num_regions x region_size` bytes. All allocation is a bump pointer inside
//! the current region; when a request does not fit, the tail is stamped with a
//! filler record, the allocator switches to a free region (extending the file,
//! or doubling the region size once the region count is capped), and the
//! smallest sparse region is queued for evacuation.
//!
//! The header page holds two copies of the allocator state toggled by an
//! atomic index, so a crash never observes a half-written snapshot, plus a
//! 32-entry relocation queue that survives crashes: `load_queue` reconstructs
//! the usage accounting from it on open and the evacuator simply resumes.
//!
//! `region_used[r]` counts live payload bytes plus `PENDING_WRITE` for every
//! in-flight activity targeting the region (being the allocation target, or
//! being a relocation destination). A region is recycled only when the counter
//! reaches exactly zero, and even then only after passing through the GC
//! queue, because readers may still hold pointers into it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info};

use crate::config::Config;
use crate::directory::{Directory, LocationLock, ObjectId, ObjectLocation};
use crate::error::{TrellisError, TrellisResult};
use crate::gc::{GcEpoch, GcQueue};
use crate::mapping::{AccessMode, Mapping};

const PAGE_SIZE: u64 = 4096;
const MAX_REGIONS: u64 = 64;
const MAX_QUEUE: u64 = 32;
/// High-order marker counting in-flight writers per region.
const PENDING_WRITE: u64 = 1 << 48;
/// Largest single filler record (bounded by the 24-bit size field).
const MAX_FILL: u64 = 1 << 24;
/// Offsets beyond 2^49 bytes stop fitting the directory's offset/8 field.
const MAX_PAYLOAD_BYTES: u64 = 1 << 49;

/// The cache tier of the on-disk region file.
pub const REGION_TIER: u8 = 3;

// One copy of the mutable allocator state (there are two, plus `current`).
const D_REGION_SIZE: u64 = 0;
const D_ALLOC_POS: u64 = 8;
const D_NUM_REGIONS: u64 = 16;
const D_CURRENT_REGION: u64 = 24;
const D_REGION_USED: u64 = 32;
const DATA_COPY_SIZE: u64 = 32 + MAX_REGIONS * 8;
const H_CURRENT: u64 = 2 * DATA_COPY_SIZE;
const H_QUEUE: u64 = H_CURRENT + 8;
const QUEUE_ITEM_SIZE: u64 = 32;
const Q_DEST_BEGIN: u64 = 0;
const Q_DEST_END: u64 = 8;
const Q_SRC_BEGIN: u64 = 16;
const Q_SRC_END: u64 = 24;

const HEADER_SIZE_MASK: u64 = (1 << 24) - 1;

fn round8(n: u64) -> u64 {
    (n + 7) & !7
}

/// Bytes consumed by an object of payload `size`: header plus 8-byte rounding.
fn alloc_size(size: u32) -> u64 {
    round8(size as u64) + 8
}

/// Counters reported by [`RegionAllocator::stats`].
#[derive(Debug, Clone, Copy)]
pub struct RegionStats {
    pub region_size: u64,
    pub num_regions: u64,
    pub free_regions: u32,
    pub queue_used: u32,
}

struct AllocState {
    /// Bit r set = region r is empty and may become the next current region.
    free_regions: u64,
    /// Next queue slot a writer will try to fill.
    queue_pos: u64,
    /// Next queue slot the evacuator will look at.
    queue_front: u64,
}

struct RegionShared {
    mapping: Mapping,
    dir: Arc<Directory>,
    gc: Arc<GcQueue>,
    gc_epoch: Arc<GcEpoch>,
    compaction_trigger: f64,
    state: Mutex<AllocState>,
    work: Condvar,
    done: AtomicBool,
    self_ref: OnceLock<Weak<RegionShared>>,
}

/// View over one of the two header state copies.
#[derive(Clone, Copy)]
struct Hdr<'a> {
    sh: &'a RegionShared,
    base: u64,
}

impl<'a> Hdr<'a> {
    fn cell(&self, off: u64) -> &'a AtomicU64 {
        self.sh.cell(self.base + off)
    }

    fn region_size(&self) -> u64 {
        self.cell(D_REGION_SIZE).load(Ordering::SeqCst)
    }
    fn set_region_size(&self, v: u64) {
        self.cell(D_REGION_SIZE).store(v, Ordering::SeqCst)
    }
    fn alloc_pos(&self) -> u64 {
        self.cell(D_ALLOC_POS).load(Ordering::SeqCst)
    }
    fn set_alloc_pos(&self, v: u64) {
        self.cell(D_ALLOC_POS).store(v, Ordering::SeqCst)
    }
    fn num_regions(&self) -> u64 {
        self.cell(D_NUM_REGIONS).load(Ordering::SeqCst)
    }
    fn set_num_regions(&self, v: u64) {
        self.cell(D_NUM_REGIONS).store(v, Ordering::SeqCst)
    }
    fn current_region(&self) -> u64 {
        self.cell(D_CURRENT_REGION).load(Ordering::SeqCst)
    }
    fn set_current_region(&self, v: u64) {
        self.cell(D_CURRENT_REGION).store(v, Ordering::SeqCst)
    }
    fn region_used(&self, r: u64) -> &'a AtomicU64 {
        debug_assert!(r < MAX_REGIONS);
        self.cell(D_REGION_USED + r * 8)
    }
}

/// View over one relocation queue entry. An entry is in use while
/// `dest_end > dest_begin`; the evacuator advances `src_begin`/`dest_begin`
/// as it copies, so a crash resumes exactly where the walk stopped.
#[derive(Clone, Copy)]
struct QueueItem<'a> {
    sh: &'a RegionShared,
    base: u64,
}

impl<'a> QueueItem<'a> {
    fn cell(&self, off: u64) -> &'a AtomicU64 {
        self.sh.cell(self.base + off)
    }

    fn dest_begin(&self) -> u64 {
        self.cell(Q_DEST_BEGIN).load(Ordering::SeqCst)
    }
    fn set_dest_begin(&self, v: u64) {
        self.cell(Q_DEST_BEGIN).store(v, Ordering::SeqCst)
    }
    fn dest_end(&self) -> u64 {
        self.cell(Q_DEST_END).load(Ordering::SeqCst)
    }
    fn set_dest_end(&self, v: u64) {
        self.cell(Q_DEST_END).store(v, Ordering::SeqCst)
    }
    fn src_begin(&self) -> u64 {
        self.cell(Q_SRC_BEGIN).load(Ordering::SeqCst)
    }
    fn set_src_begin(&self, v: u64) {
        self.cell(Q_SRC_BEGIN).store(v, Ordering::SeqCst)
    }
    fn src_end(&self) -> u64 {
        self.cell(Q_SRC_END).load(Ordering::SeqCst)
    }
    fn set_src_end(&self, v: u64) {
        self.cell(Q_SRC_END).store(v, Ordering::SeqCst)
    }

    fn is_used(&self) -> bool {
        self.dest_end() > self.dest_begin()
    }
}

impl RegionShared {
    fn cell(&self, off: u64) -> &AtomicU64 {
        debug_assert!(off + 8 <= PAGE_SIZE);
        // SAFETY: the header page exists for the lifetime of the mapping and
        // every field offset is 8-aligned.
        unsafe { &*(self.mapping.data().add(off as usize) as *const AtomicU64) }
    }

    fn current_copy(&self) -> u64 {
        self.cell(H_CURRENT).load(Ordering::SeqCst) & 1
    }

    fn hdr(&self, copy: u64) -> Hdr<'_> {
        Hdr { sh: self, base: copy * DATA_COPY_SIZE }
    }

    fn cur_hdr(&self) -> Hdr<'_> {
        self.hdr(self.current_copy())
    }

    fn queue_item(&self, i: u64) -> QueueItem<'_> {
        debug_assert!(i < MAX_QUEUE);
        QueueItem { sh: self, base: H_QUEUE + i * QUEUE_ITEM_SIZE }
    }

    fn payload_base(&self) -> *mut u8 {
        // SAFETY: the file is always at least one page long once opened.
        unsafe { self.mapping.data().add(PAGE_SIZE as usize) }
    }

    fn payload_len(&self) -> u64 {
        self.mapping.size() as u64 - PAGE_SIZE
    }

    fn write_header(&self, pos: u64, size: u32, id: u64) {
        debug_assert_eq!(pos % 8, 0);
        debug_assert!(size as u64 <= HEADER_SIZE_MASK);
        let v = size as u64 | (id << 24);
        // SAFETY: pos is 8-aligned and inside the payload area; headers are
        // written exactly once before the object's location is published.
        unsafe { (self.payload_base().add(pos as usize) as *mut u64).write(v) }
    }

    fn read_header(&self, pos: u64) -> (u32, u64) {
        debug_assert_eq!(pos % 8, 0);
        // SAFETY: pos is bounds-checked by the callers.
        let v = unsafe { (self.payload_base().add(pos as usize) as *const u64).read() };
        ((v & HEADER_SIZE_MASK) as u32, v >> 24)
    }

    /// Reserve `used` bytes and stamp the object header. Returns the object's
    /// byte offset; the caller initializes the payload, publishes the
    /// location, and only then advances `alloc_pos`.
    fn allocate_impl(
        &self,
        st: &mut AllocState,
        id: ObjectId,
        size: u32,
        used: u64,
    ) -> TrellisResult<u64> {
        let h = self.cur_hdr();
        if used > h.region_size() {
            return Err(TrellisError::ResourceExhausted {
                resource: "object size vs region size",
                limit: h.region_size(),
            });
        }
        let alloc_pos = h.alloc_pos();
        let available = (h.current_region() + 1) * h.region_size() - alloc_pos;
        if used > available {
            if available > 0 {
                self.write_header(alloc_pos, (available - 8) as u32, 0);
            }
            let old_region = h.current_region();
            self.deallocate_bytes(&h, old_region, available + PENDING_WRITE);

            let next_idx = self.current_copy() ^ 1;
            self.start_new_region(st, next_idx)?;
            self.cell(H_CURRENT).store(next_idx, Ordering::SeqCst);

            let h = self.cur_hdr();
            if self.hdr(0).region_size() != self.hdr(1).region_size() {
                self.reevaluate_free(st, &h);
            }
            let (smallest, small_size) = self.smallest_region(&h);
            if small_size > 0
                && (small_size as f64) < h.region_size() as f64 * self.compaction_trigger
            {
                self.push_queue(st, &h, smallest, small_size);
            }
        }
        let h = self.cur_hdr();
        let pos = h.alloc_pos();
        self.write_header(pos, size, id.raw());
        Ok(pos)
    }

    fn deallocate_bytes(&self, h: &Hdr<'_>, region: u64, amount: u64) {
        let cell = h.region_used(region);
        let total = cell.load(Ordering::SeqCst);
        debug_assert!(amount <= total, "region {} accounting underflow", region);
        cell.store(total - amount, Ordering::SeqCst);
        if total == amount {
            self.make_available(region, h.region_size());
        }
    }

    /// Smallest non-empty region by live bytes. Regions with pending markers
    /// carry huge counter values and are never picked.
    fn smallest_region(&self, h: &Hdr<'_>) -> (u64, u64) {
        let mut min = 0u64;
        let mut min_pos = 0u64;
        for r in 0..h.num_regions() {
            let used = h.region_used(r).load(Ordering::SeqCst);
            if used != 0 && (min == 0 || used < min) {
                min = used;
                min_pos = r;
            }
        }
        (min_pos, if min >= PENDING_WRITE { 0 } else { min })
    }

    fn find_free_region(&self, st: &AllocState, num_regions: u64) -> Option<u64> {
        let mask = if num_regions >= 64 { !0u64 } else { (1u64 << num_regions) - 1 };
        let masked = st.free_regions & mask;
        if masked == 0 {
            None
        } else {
            Some(masked.trailing_zeros() as u64)
        }
    }

    fn copy_header_data(&self, old: &Hdr<'_>, next: &Hdr<'_>) {
        next.set_region_size(old.region_size());
        next.set_num_regions(old.num_regions());
        next.set_current_region(old.current_region());
        for r in 0..old.num_regions() {
            next.region_used(r).store(old.region_used(r).load(Ordering::SeqCst), Ordering::SeqCst);
        }
    }

    /// Pick (or create) the next allocation region, writing the complete new
    /// state into the inactive header copy. The caller flips `current` after
    /// this returns, so a crash in the middle leaves the old copy intact.
    fn start_new_region(&self, st: &mut AllocState, next_idx: u64) -> TrellisResult<()> {
        let old = self.hdr(next_idx ^ 1);
        let next = self.hdr(next_idx);
        let num_regions = old.num_regions();

        if let Some(r) = self.find_free_region(st, num_regions) {
            self.copy_header_data(&old, &next);
            next.set_current_region(r);
        } else {
            if num_regions == MAX_REGIONS {
                self.double_region_size(st, &old, &next)?;
            } else {
                self.copy_header_data(&old, &next);
            }
            let new_size = self.mapping.size() as u64 + next.region_size();
            if new_size - PAGE_SIZE > MAX_PAYLOAD_BYTES {
                return Err(TrellisError::ResourceExhausted {
                    resource: "payload address space",
                    limit: MAX_PAYLOAD_BYTES,
                });
            }
            if let Some(retired) = self.mapping.resize(new_size)? {
                self.gc.push(Box::new(move || drop(retired)));
            }
            let appended = next.num_regions();
            next.set_current_region(appended);
            next.set_num_regions(appended + 1);
        }

        let cur = next.current_region();
        next.region_used(cur).store(next.region_size() + PENDING_WRITE, Ordering::SeqCst);
        st.free_regions &= !(1u64 << cur);
        next.set_alloc_pos(cur * next.region_size());
        Ok(())
    }

    /// At the region-count cap: double the region size, halving the logical
    /// region count by merging counter pairs. Byte offsets are unaffected.
    fn double_region_size(
        &self,
        st: &mut AllocState,
        old: &Hdr<'_>,
        next: &Hdr<'_>,
    ) -> TrellisResult<()> {
        let num_regions = old.num_regions();
        debug_assert_eq!(num_regions % 2, 0);
        if old.region_size().checked_mul(2).is_none() {
            return Err(TrellisError::ResourceExhausted {
                resource: "region size",
                limit: u64::MAX,
            });
        }
        next.set_region_size(old.region_size() * 2);
        next.set_num_regions(num_regions / 2);
        let mut free = 0u64;
        for i in 0..num_regions / 2 {
            let merged = old.region_used(2 * i).load(Ordering::SeqCst)
                + old.region_used(2 * i + 1).load(Ordering::SeqCst);
            next.region_used(i).store(merged, Ordering::SeqCst);
            let both_free =
                st.free_regions >> (2 * i) & 1 == 1 && st.free_regions >> (2 * i + 1) & 1 == 1;
            if both_free {
                free |= 1u64 << i;
            }
        }
        st.free_regions = free;
        debug!(region_size = next.region_size(), "doubled region size");
        Ok(())
    }

    /// Queue `region` for evacuation, reserving its live bytes at the current
    /// allocation frontier. A full ring defers compaction to a later switch.
    fn push_queue(&self, st: &mut AllocState, h: &Hdr<'_>, region: u64, used: u64) -> bool {
        let item = self.queue_item(st.queue_pos);
        if item.is_used() {
            return false;
        }
        // Keep the item unusable until the final dest_end store.
        item.set_dest_end(0);
        item.set_src_begin(region * h.region_size());
        item.set_src_end((region + 1) * h.region_size());
        let alloc_pos = h.alloc_pos();
        item.set_dest_begin(alloc_pos);
        h.set_alloc_pos(alloc_pos + used);
        let dest_region = alloc_pos / h.region_size();
        h.region_used(dest_region).fetch_add(PENDING_WRITE, Ordering::SeqCst);
        item.set_dest_end(alloc_pos + used);
        st.queue_pos = (st.queue_pos + 1) % MAX_QUEUE;
        debug!(region, used, "queued region for evacuation");
        self.work.notify_one();
        true
    }

    /// Return `region` to the free set once every reader that might still
    /// observe its bytes has moved on.
    fn make_available(&self, region: u64, region_size: u64) {
        let weak = self.self_ref.get().expect("self_ref set at open").clone();
        self.gc.push(Box::new(move || {
            if let Some(sh) = weak.upgrade() {
                let mut st = sh.state.lock();
                let h = sh.cur_hdr();
                if h.region_size() == region_size && st.free_regions & (1u64 << region) == 0 {
                    st.free_regions |= 1u64 << region;
                    debug!(region, "region returned to free set");
                }
            }
        }));
    }

    fn reevaluate_free(&self, st: &mut AllocState, h: &Hdr<'_>) {
        for r in 0..h.num_regions() {
            if h.region_used(r).load(Ordering::SeqCst) == 0 && st.free_regions & (1u64 << r) == 0 {
                self.make_available(r, h.region_size());
            }
        }
    }

    /// Rebuild the in-memory accounting from the persisted queue after a
    /// crash (or a clean shutdown; the procedure is the same).
    fn load_queue(&self) -> TrellisResult<()> {
        let mut st = self.state.lock();
        // Writers fill the first unused slot going forward; surviving entries
        // are picked up by the evacuator's straggler sweep.
        st.queue_front = 0;
        st.queue_pos = 0;
        for i in 0..MAX_QUEUE {
            if !self.queue_item(i).is_used() {
                st.queue_pos = i;
                st.queue_front = i;
                break;
            }
        }

        let h = self.cur_hdr();
        let rs = h.region_size();
        let len = self.payload_len();

        // Strip every pending marker, then re-add one per live activity:
        // each still-used queue entry's destination, plus the current region.
        for r in 0..MAX_REGIONS {
            let cell = h.region_used(r);
            cell.store(cell.load(Ordering::SeqCst) % PENDING_WRITE, Ordering::SeqCst);
        }
        let mut pending = 0u32;
        for i in 0..MAX_QUEUE {
            let item = self.queue_item(i);
            if item.is_used() {
                if item.dest_end() > len || item.src_end() > len || item.src_begin() > item.src_end()
                {
                    return Err(TrellisError::Corruption {
                        path: Some(self.mapping.path().to_path_buf()),
                        detail: format!("relocation queue entry {} out of bounds", i),
                    });
                }
                h.region_used(item.dest_begin() / rs).fetch_add(PENDING_WRITE, Ordering::SeqCst);
                pending += 1;
            }
        }
        h.region_used(h.current_region()).fetch_add(PENDING_WRITE, Ordering::SeqCst);

        st.free_regions = 0;
        for r in 0..h.num_regions() {
            if h.region_used(r).load(Ordering::SeqCst) == 0 {
                st.free_regions |= 1u64 << r;
            }
        }
        if pending > 0 {
            info!(pending, "relocation queue entries pending after recovery");
        }
        Ok(())
    }

    // --- evacuator --------------------------------------------------------

    fn next_queue_item(&self, st: &mut AllocState) -> Option<u64> {
        if st.queue_front != st.queue_pos {
            let front = st.queue_front;
            st.queue_front = (front + 1) % MAX_QUEUE;
            return Some(front);
        }
        // Recovery can leave used entries anywhere in the ring, outside the
        // [front, pos) window. Sweep for stragglers; run_one retires them.
        (0..MAX_QUEUE).find(|&i| self.queue_item(i).is_used())
    }

    /// Walk one source range, copying every still-live object into its
    /// reserved destination. Freed, moved or locked objects are skipped.
    fn evacuate(&self, item: &QueueItem<'_>) -> u64 {
        let mut begin = item.src_begin();
        let end = item.src_end();
        let mut dest = item.dest_begin();
        let dest_end = item.dest_end();
        let base = self.payload_base();

        while begin != end {
            if begin > end || begin + 8 > self.payload_len() {
                self.corrupt("relocation walk ran past its source range");
            }
            let (size, id_raw) = self.read_header(begin);
            let step = 8 + round8(size as u64);
            if begin + step > end {
                self.corrupt("object record crosses a region boundary");
            }
            if id_raw != 0 {
                if id_raw > self.dir.high_water() {
                    self.corrupt("object header names an unallocated id");
                }
                let id = ObjectId::new(id_raw);
                let loc = ObjectLocation { offset: begin, tier: REGION_TIER };
                if let Some(lock) = self.dir.try_lock_at(id, loc) {
                    if step > dest_end - dest {
                        // Out of reserved room; the rest stays where it is.
                        drop(lock);
                        break;
                    }
                    // SAFETY: source and destination are disjoint live ranges
                    // of the payload area; the move-lock keeps the object's
                    // bytes stable for the duration of the copy.
                    unsafe {
                        std::ptr::copy_nonoverlapping(
                            base.add(begin as usize),
                            base.add(dest as usize),
                            step as usize,
                        );
                    }
                    item.set_dest_begin(dest + step);
                    self.dir
                        .move_object(&lock, ObjectLocation { offset: dest, tier: REGION_TIER });
                    dest += step;
                }
            }
            begin += step;
            item.set_src_begin(begin);
        }
        dest
    }

    fn run_one(&self, qi: u64) {
        let item = self.queue_item(qi);
        if !item.is_used() {
            return;
        }
        let orig_dest = item.dest_begin();
        let end = self.evacuate(&item);

        let _guard = self.state.lock();
        let h = self.cur_hdr();
        let rs = h.region_size();
        let src_region = (item.src_end() - 1) / rs;
        let dest_region = orig_dest / rs;
        let dest_end = item.dest_end();
        let extra = dest_end - end;
        let copied = end - orig_dest;

        if extra > 0 {
            // Pad the unused reservation tail so the region stays scannable.
            let mut pos = end;
            while pos < dest_end {
                let chunk = (dest_end - pos).min(MAX_FILL);
                self.write_header(pos, (chunk - 8) as u32, 0);
                pos += chunk;
            }
            item.set_dest_begin(dest_end);
        }

        let fully_drained = item.src_begin() == item.src_end();
        let src_used = h.region_used(src_region).load(Ordering::SeqCst);
        if src_used != 0 {
            // After a crash the counter may have drifted; a fully drained
            // region is exactly empty no matter what it claims.
            let remaining = if fully_drained { 0 } else { src_used - copied };
            h.region_used(src_region).store(remaining, Ordering::SeqCst);
            if remaining == 0 {
                self.make_available(src_region, rs);
            }
        }

        let dest_used = h.region_used(dest_region).load(Ordering::SeqCst);
        let settled = dest_used - PENDING_WRITE - extra;
        h.region_used(dest_region).store(settled, Ordering::SeqCst);
        if settled == 0 {
            self.make_available(dest_region, rs);
        }
        debug!(src_region, copied, extra, "evacuated region");
    }

    fn corrupt(&self, detail: &str) -> ! {
        // The evacuator has no one to report to. Abort so the next startup
        // runs recovery instead of spreading bad bytes around.
        error!(path = %self.mapping.path().display(), detail, "region file corruption");
        std::process::abort();
    }
}

fn evacuator_loop(sh: Arc<RegionShared>) {
    loop {
        let next = {
            let mut st = sh.state.lock();
            loop {
                if let Some(qi) = sh.next_queue_item(&mut *st) {
                    break Some(qi);
                }
                if sh.done.load(Ordering::SeqCst) {
                    break None;
                }
                sh.work.wait(&mut st);
            }
        };
        match next {
            Some(qi) => {
                sh.gc.pin(&sh.gc_epoch);
                sh.run_one(qi);
                sh.gc_epoch.idle();
                sh.gc.poll();
            }
            None => return,
        }
    }
}

/// Public allocator handle; owns the evacuator thread.
pub struct RegionAllocator {
    shared: Arc<RegionShared>,
    thread: Option<thread::JoinHandle<()>>,
}

impl RegionAllocator {
    /// Open the region file, creating and formatting it when absent
    /// (read-write). Spawns the evacuator in read-write mode.
    pub fn open(
        gc: Arc<GcQueue>,
        dir: Arc<Directory>,
        path: &std::path::Path,
        mode: AccessMode,
        config: &Config,
    ) -> TrellisResult<Self> {
        let mapping = Mapping::open(path, mode)?;
        let fresh = mapping.size() == 0;
        if fresh {
            if mode == AccessMode::ReadOnly {
                return Err(TrellisError::Io {
                    path: Some(path.to_path_buf()),
                    kind: std::io::ErrorKind::NotFound,
                    message: "region file does not exist".into(),
                });
            }
            mapping.resize(PAGE_SIZE + config.initial_region_size)?;
        } else if (mapping.size() as u64) < PAGE_SIZE {
            return Err(TrellisError::Corruption {
                path: Some(path.to_path_buf()),
                detail: "region file too short for its header page".into(),
            });
        }

        let gc_epoch = gc.register();
        let shared = Arc::new(RegionShared {
            mapping,
            dir,
            gc,
            gc_epoch,
            compaction_trigger: config.compaction_trigger,
            state: Mutex::new(AllocState { free_regions: 0, queue_pos: 0, queue_front: 0 }),
            work: Condvar::new(),
            done: AtomicBool::new(false),
            self_ref: OnceLock::new(),
        });
        let _ = shared.self_ref.set(Arc::downgrade(&shared));

        if fresh {
            let h = shared.hdr(0);
            h.set_region_size(config.initial_region_size);
            h.set_alloc_pos(0);
            h.set_num_regions(1);
            h.set_current_region(0);
            h.region_used(0).store(config.initial_region_size, Ordering::SeqCst);
            shared.cell(H_CURRENT).store(0, Ordering::SeqCst);
        }

        if !fresh {
            let h = shared.cur_hdr();
            let rs = h.region_size();
            let nr = h.num_regions();
            if rs == 0
                || rs % 8 != 0
                || nr == 0
                || nr > MAX_REGIONS
                || PAGE_SIZE + nr * rs > shared.mapping.size() as u64
            {
                return Err(TrellisError::Corruption {
                    path: Some(path.to_path_buf()),
                    detail: "region file header disagrees with file size".into(),
                });
            }
        }

        let thread = if mode == AccessMode::ReadWrite {
            shared.load_queue()?;
            let sh = Arc::clone(&shared);
            let t = thread::Builder::new()
                .name("trellis-evacuator".to_string())
                .spawn(move || evacuator_loop(sh))
                .map_err(|e| TrellisError::Io {
                    path: Some(path.to_path_buf()),
                    kind: std::io::ErrorKind::Other,
                    message: format!("failed to spawn evacuator thread: {}", e),
                })?;
            shared.work.notify_one();
            Some(t)
        } else {
            None
        };

        Ok(Self { shared, thread })
    }

    /// Allocate `size` payload bytes for the locked id. `init` fills the
    /// payload before the location is published, so no reader or evacuator
    /// can observe a half-written object.
    pub fn allocate<F>(&self, lock: &LocationLock<'_>, size: u32, init: F) -> TrellisResult<()>
    where
        F: FnOnce(&mut [u8]),
    {
        let sh = &self.shared;
        let used = alloc_size(size);
        let mut st = sh.state.lock();
        let pos = sh.allocate_impl(&mut *st, lock.id(), size, used)?;
        // SAFETY: [pos+8, pos+8+size) was just reserved under the state
        // mutex and is not visible to any other thread yet.
        let payload = unsafe {
            std::slice::from_raw_parts_mut(sh.payload_base().add(pos as usize + 8), size as usize)
        };
        init(payload);
        sh.dir.move_object(lock, ObjectLocation { offset: pos, tier: REGION_TIER });
        sh.cur_hdr().set_alloc_pos(pos + used);
        Ok(())
    }

    /// Account the object's bytes as dead. Called when an id's refcount
    /// reaches zero.
    pub fn deallocate(&self, loc: ObjectLocation) {
        debug_assert_eq!(loc.tier, REGION_TIER);
        let sh = &self.shared;
        let _st = sh.state.lock();
        let h = sh.cur_hdr();
        let region = loc.offset / h.region_size();
        let (size, _) = sh.read_header(loc.offset);
        sh.deallocate_bytes(&h, region, alloc_size(size));
    }

    /// Resolve a location to the payload pointer and size. The caller must be
    /// inside a guarded interval (swap guard / GC pin).
    pub fn object(&self, loc: ObjectLocation) -> TrellisResult<(*mut u8, u32)> {
        let sh = &self.shared;
        if loc.tier != REGION_TIER {
            return Err(self.corruption(format!("object in unknown cache tier {}", loc.tier)));
        }
        let len = sh.payload_len();
        if loc.offset + 8 > len {
            return Err(self.corruption(format!("object offset {} beyond payload", loc.offset)));
        }
        let (size, _) = sh.read_header(loc.offset);
        if loc.offset + 8 + size as u64 > len {
            return Err(self.corruption(format!("object at {} overruns payload", loc.offset)));
        }
        // SAFETY: bounds checked above; validity across concurrent resizes is
        // the caller's guard obligation.
        Ok((unsafe { sh.payload_base().add(loc.offset as usize + 8) }, size))
    }

    fn corruption(&self, detail: String) -> TrellisError {
        TrellisError::Corruption {
            path: Some(self.shared.mapping.path().to_path_buf()),
            detail,
        }
    }

    /// Current allocation frontier (byte offset). Read sessions publish this
    /// as their swap position while descending.
    pub fn frontier(&self) -> u64 {
        self.shared.cur_hdr().alloc_pos()
    }

    pub fn stats(&self) -> RegionStats {
        let sh = &self.shared;
        let st = sh.state.lock();
        let h = sh.cur_hdr();
        let queue_used =
            (0..MAX_QUEUE).filter(|&i| sh.queue_item(i).is_used()).count() as u32;
        RegionStats {
            region_size: h.region_size(),
            num_regions: h.num_regions(),
            free_regions: st.free_regions.count_ones(),
            queue_used,
        }
    }

    pub fn sync(&self) -> TrellisResult<()> {
        self.shared.mapping.sync()
    }
}

impl Drop for RegionAllocator {
    fn drop(&mut self) {
        self.shared.done.store(true, Ordering::SeqCst);
        self.shared.work.notify_all();
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}
