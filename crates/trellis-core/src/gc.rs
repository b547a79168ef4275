//! Epoch-based deferred reclamation
//!
//! Retiring a resource (a superseded mmap, a drained region) cannot free it
//! immediately: a reader that entered its descent before the retirement may
//! still hold pointers into it. Each reader session owns an epoch cell; the
//! cell holds the queue epoch while the session is inside a guard and
//! `u64::MAX` while it is not. A retirement is tagged with the epoch at push
//! time and runs only once every pinned cell has moved past that tag.
//!
//! `push` never runs retirements inline — callers frequently hold the
//! allocator mutex, and most retirements need that same mutex. Draining
//! happens from `poll`, which is only invoked from lock-free call sites
//! (`ensure_free_space`, session teardown, the evacuator between items).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

/// A boxed retirement action.
pub type Retirement = Box<dyn FnOnce() + Send>;

/// Per-session epoch cell. `u64::MAX` means "not inside a guarded interval".
pub struct GcEpoch(AtomicU64);

impl GcEpoch {
    pub fn idle(&self) {
        self.0.store(u64::MAX, Ordering::SeqCst);
    }

    pub fn pinned_at(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

struct GcInner {
    items: VecDeque<(u64, Retirement)>,
    sessions: Vec<Weak<GcEpoch>>,
}

/// Single-producer / multi-consumer retirement queue.
pub struct GcQueue {
    inner: Mutex<GcInner>,
    epoch: AtomicU64,
}

impl GcQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(GcInner { items: VecDeque::new(), sessions: Vec::new() }),
            epoch: AtomicU64::new(1),
        })
    }

    /// Register a reader; the returned cell starts idle.
    pub fn register(&self) -> Arc<GcEpoch> {
        let cell = Arc::new(GcEpoch(AtomicU64::new(u64::MAX)));
        self.inner.lock().sessions.push(Arc::downgrade(&cell));
        cell
    }

    /// Pin `cell` at the current epoch.
    ///
    /// The store is validated against a re-read of the epoch counter so that a
    /// concurrent `push`+`poll` pair cannot observe the cell as idle after
    /// tagging an item with an epoch the pin should protect.
    pub fn pin(&self, cell: &GcEpoch) {
        loop {
            let e = self.epoch.load(Ordering::SeqCst);
            cell.0.store(e, Ordering::SeqCst);
            if self.epoch.load(Ordering::SeqCst) == e {
                return;
            }
        }
    }

    /// Retire a resource. It will be dropped once all current readers unpin.
    pub fn push(&self, f: Retirement) {
        let tag = self.epoch.fetch_add(1, Ordering::SeqCst);
        self.inner.lock().items.push_back((tag, f));
    }

    /// Run every retirement whose epoch precedes all pinned readers.
    pub fn poll(&self) {
        let ready: Vec<Retirement> = {
            let mut inner = self.inner.lock();
            let mut min = u64::MAX;
            inner.sessions.retain(|w| match w.upgrade() {
                Some(cell) => {
                    min = min.min(cell.pinned_at());
                    true
                }
                None => false,
            });

            let mut ready = Vec::new();
            while let Some((tag, _)) = inner.items.front() {
                if *tag < min {
                    let (_, f) = inner.items.pop_front().unwrap();
                    ready.push(f);
                } else {
                    break;
                }
            }
            ready
        };

        // Run outside the queue mutex: retirements may take allocator locks
        // or push further retirements.
        for f in ready {
            f();
        }
    }

    /// Number of retirements still waiting. Test and stats hook.
    pub fn pending(&self) -> usize {
        self.inner.lock().items.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_unpinned_items_run_on_poll() {
        let gc = GcQueue::new();
        let ran = Arc::new(AtomicUsize::new(0));

        let r = Arc::clone(&ran);
        gc.push(Box::new(move || {
            r.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(ran.load(Ordering::SeqCst), 0, "push must not run inline");

        gc.poll();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(gc.pending(), 0);
    }

    #[test]
    fn test_pinned_session_blocks_reclamation() {
        let gc = GcQueue::new();
        let cell = gc.register();
        let ran = Arc::new(AtomicUsize::new(0));

        gc.pin(&cell);

        let r = Arc::clone(&ran);
        gc.push(Box::new(move || {
            r.fetch_add(1, Ordering::SeqCst);
        }));

        gc.poll();
        assert_eq!(ran.load(Ordering::SeqCst), 0, "pinned reader must hold the item");

        cell.idle();
        gc.poll();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_pin_does_not_protect_earlier_retirements() {
        let gc = GcQueue::new();
        let cell = gc.register();
        let ran = Arc::new(AtomicUsize::new(0));

        let r = Arc::clone(&ran);
        gc.push(Box::new(move || {
            r.fetch_add(1, Ordering::SeqCst);
        }));
        gc.pin(&cell);
        gc.poll();
        // The reader pinned after the push cannot hold pointers into the
        // retired resource: the base it fetches post-pin is already the new one.
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        cell.idle();
    }

    #[test]
    fn test_dropped_session_is_pruned() {
        let gc = GcQueue::new();
        let cell = gc.register();
        gc.pin(&cell);
        drop(cell);

        let ran = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&ran);
        gc.push(Box::new(move || {
            r.fetch_add(1, Ordering::SeqCst);
        }));
        gc.poll();
        assert_eq!(ran.load(Ordering::SeqCst), 1, "dead sessions must not pin the queue");
    }
}
