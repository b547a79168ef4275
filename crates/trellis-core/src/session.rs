//! Read sessions and cursors
//!
//! A session pins one root revision: the refcount it takes on the root keeps
//! the whole snapshot reachable, so readers never block writers and vice
//! versa. While a session is actually dereferencing nodes it holds a
//! `SwapGuard`, which publishes the allocator frontier as the session's swap
//! position and pins the session's GC epoch; between guards the session holds
//! nothing but the root refcount.
//!
//! Cursors hold a descent path of `(id, branch)` pairs; branch -1 denotes an
//! inner node's own value, which sorts before any child branch. A cursor
//! borrows its session, so the borrow checker statically prevents using a
//! cursor across a write on the same session.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::warn;

use crate::database::Database;
use crate::directory::ObjectId;
use crate::error::{TrellisError, TrellisResult};
use crate::gc::GcEpoch;
use crate::key::{common_prefix, from_key6, to_key6};
use crate::node::Node;
use crate::region::REGION_TIER;

/// State the allocator and GC inspect while the session lives.
pub(crate) struct SessionShared {
    /// Furthest byte offset per cache tier the session may be observing;
    /// `u64::MAX` when outside a guarded interval.
    pub(crate) swap_pos: [AtomicU64; 4],
    pub(crate) epoch: Arc<GcEpoch>,
}

impl SessionShared {
    pub(crate) fn new(epoch: Arc<GcEpoch>) -> Arc<SessionShared> {
        Arc::new(SessionShared {
            swap_pos: [
                AtomicU64::new(u64::MAX),
                AtomicU64::new(u64::MAX),
                AtomicU64::new(u64::MAX),
                AtomicU64::new(u64::MAX),
            ],
            epoch,
        })
    }
}

/// RAII guard for one descent: publishes swap positions and pins the epoch.
pub(crate) struct SwapGuard {
    shared: Arc<SessionShared>,
}

impl SwapGuard {
    pub(crate) fn new(db: &Database, shared: &Arc<SessionShared>) -> SwapGuard {
        db.gc().pin(&shared.epoch);
        shared.swap_pos[REGION_TIER as usize].store(db.region().frontier(), Ordering::SeqCst);
        SwapGuard { shared: Arc::clone(shared) }
    }
}

impl Drop for SwapGuard {
    fn drop(&mut self) {
        self.shared.swap_pos[REGION_TIER as usize].store(u64::MAX, Ordering::SeqCst);
        self.shared.epoch.idle();
    }
}

/// The machinery shared by read and write sessions.
pub(crate) struct SessionCore<'db> {
    pub(crate) db: &'db Database,
    pub(crate) shared: Arc<SessionShared>,
    pub(crate) root: ObjectId,
}

impl<'db> SessionCore<'db> {
    /// Takes ownership of the caller's reference on `root`.
    pub(crate) fn new(db: &'db Database, root: ObjectId) -> SessionCore<'db> {
        let shared = SessionShared::new(db.gc().register());
        db.register_session(&shared);
        SessionCore { db, shared, root }
    }

    pub(crate) fn guard(&self) -> SwapGuard {
        SwapGuard::new(self.db, &self.shared)
    }

    pub(crate) fn resolve(&self, id: ObjectId) -> TrellisResult<Node> {
        self.db.resolve(id)
    }

    /// Drop the pinned root. Called exactly once, from the session's Drop.
    pub(crate) fn close(&mut self) {
        if !self.root.is_null() {
            let root = std::mem::replace(&mut self.root, ObjectId::NULL);
            let _g = self.guard();
            if let Err(e) = self.db.release_tree(root) {
                warn!(error = %e, "failed to release session root");
            }
        }
    }

    // --- point lookup -----------------------------------------------------

    pub(crate) fn get(&self, key: &[u8]) -> TrellisResult<Option<Vec<u8>>> {
        let k6 = to_key6(key);
        let _g = self.guard();
        self.get_bytes(self.root, &k6)
    }

    fn get_bytes(&self, mut root: ObjectId, mut key: &[u8]) -> TrellisResult<Option<Vec<u8>>> {
        if root.is_null() {
            return Ok(None);
        }
        loop {
            match self.resolve(root)? {
                Node::Leaf(leaf) => {
                    return Ok(if leaf.key() == key { Some(leaf.value().to_vec()) } else { None });
                }
                Node::Inner(inner) => {
                    let ik = inner.key();
                    if key.len() < ik.len() {
                        return Ok(None);
                    }
                    if key == ik {
                        let v = inner.value_id();
                        if v.is_null() {
                            return Ok(None);
                        }
                        root = v;
                        key = &[];
                        continue;
                    }
                    if &key[..ik.len()] != ik {
                        return Ok(None);
                    }
                    let b = key[ik.len()];
                    if !inner.has_branch(b) {
                        return Ok(None);
                    }
                    key = &key[ik.len() + 1..];
                    root = inner.branch(b);
                }
            }
        }
    }

    // --- cursor construction ----------------------------------------------

    pub(crate) fn first(&self) -> TrellisResult<Cursor<'_>> {
        let mut path = Vec::new();
        if !self.root.is_null() {
            let _g = self.guard();
            self.descend_first(&mut path, self.root)?;
        }
        Ok(Cursor { core: self, path })
    }

    pub(crate) fn last(&self) -> TrellisResult<Cursor<'_>> {
        let mut path = Vec::new();
        if !self.root.is_null() {
            let _g = self.guard();
            self.descend_last(&mut path, self.root)?;
        }
        Ok(Cursor { core: self, path })
    }

    pub(crate) fn find(&self, key: &[u8]) -> TrellisResult<Cursor<'_>> {
        let k6 = to_key6(key);
        let mut path = Vec::new();
        if !self.root.is_null() {
            let _g = self.guard();
            self.find_path(&mut path, &k6)?;
        }
        Ok(Cursor { core: self, path })
    }

    pub(crate) fn lower_bound(&self, key: &[u8]) -> TrellisResult<Cursor<'_>> {
        let k6 = to_key6(key);
        let mut path = Vec::new();
        if !self.root.is_null() {
            let _g = self.guard();
            self.lower_bound_path(&mut path, &k6)?;
        }
        Ok(Cursor { core: self, path })
    }

    pub(crate) fn last_with_prefix(&self, prefix: &[u8]) -> TrellisResult<Cursor<'_>> {
        let mut path = Vec::new();
        if !self.root.is_null() {
            let _g = self.guard();
            self.last_with_prefix_path(&mut path, prefix)?;
        }
        Ok(Cursor { core: self, path })
    }

    fn find_path(&self, path: &mut Vec<(ObjectId, i8)>, k6: &[u8]) -> TrellisResult<()> {
        let mut root = self.root;
        let mut key: &[u8] = k6;
        loop {
            match self.resolve(root)? {
                Node::Leaf(leaf) => {
                    if leaf.key() == key {
                        path.push((root, -1));
                    } else {
                        path.clear();
                    }
                    return Ok(());
                }
                Node::Inner(inner) => {
                    let ik = inner.key();
                    if key.len() < ik.len() || &key[..ik.len()] != ik {
                        path.clear();
                        return Ok(());
                    }
                    if key.len() == ik.len() {
                        if inner.value_id().is_null() {
                            path.clear();
                        } else {
                            path.push((root, -1));
                        }
                        return Ok(());
                    }
                    let b = key[ik.len()];
                    if !inner.has_branch(b) {
                        path.clear();
                        return Ok(());
                    }
                    path.push((root, b as i8));
                    key = &key[ik.len() + 1..];
                    root = inner.branch(b);
                }
            }
        }
    }

    fn lower_bound_path(&self, path: &mut Vec<(ObjectId, i8)>, k6: &[u8]) -> TrellisResult<()> {
        let mut root = self.root;
        let mut key: &[u8] = k6;
        loop {
            match self.resolve(root)? {
                Node::Leaf(leaf) => {
                    path.push((root, -1));
                    if leaf.key() < key {
                        self.next_path(path)?;
                    }
                    return Ok(());
                }
                Node::Inner(inner) => {
                    let ik = inner.key();
                    if ik >= key {
                        // Every key in this subtree is >= the query; the
                        // smallest is the node's own value if it has one.
                        path.push((root, -1));
                        if inner.value_id().is_null() {
                            self.next_path(path)?;
                        }
                        return Ok(());
                    }
                    let p = common_prefix(ik, key);
                    if p.len() != ik.len() {
                        // The subtree diverges below the query; everything in
                        // it is smaller. Fall through to the next in-order key.
                        path.push((root, 63));
                        self.next_path(path)?;
                        return Ok(());
                    }
                    let nib = key[ik.len()] as i32;
                    let b = inner.lower_bound(nib);
                    if b > 63 {
                        path.push((root, 63));
                        self.next_path(path)?;
                        return Ok(());
                    }
                    path.push((root, b as i8));
                    if b > nib {
                        // Skipped past the query nibble; take the leftmost key
                        // of that branch.
                        self.descend_first(path, inner.branch(b as u8))?;
                        return Ok(());
                    }
                    key = &key[ik.len() + 1..];
                    root = inner.branch(b as u8);
                }
            }
        }
    }

    fn last_with_prefix_path(
        &self,
        path: &mut Vec<(ObjectId, i8)>,
        prefix: &[u8],
    ) -> TrellisResult<()> {
        let p6 = to_key6(prefix);
        // An 8-bit prefix rarely ends on a 6-bit boundary. The trailing
        // nibble then constrains only its top bits, which in nibble space is
        // the contiguous range [lo, hi].
        let partial_bits = (prefix.len() * 8) % 6;
        let (exact, range): (&[u8], Option<(u8, u8)>) = if partial_bits == 0 {
            (&p6[..], None)
        } else {
            let lo = p6[p6.len() - 1];
            let hi = lo | ((1u8 << (6 - partial_bits)) - 1);
            (&p6[..p6.len() - 1], Some((lo, hi)))
        };

        let mut root = self.root;
        let mut rem: &[u8] = exact;
        loop {
            match self.resolve(root)? {
                Node::Leaf(leaf) => {
                    let lk = leaf.key();
                    let matches = lk.len() >= rem.len()
                        && &lk[..rem.len()] == rem
                        && match range {
                            None => true,
                            Some((lo, hi)) => {
                                lk.len() > rem.len() && lk[rem.len()] >= lo && lk[rem.len()] <= hi
                            }
                        };
                    if matches {
                        path.push((root, -1));
                    } else {
                        path.clear();
                    }
                    return Ok(());
                }
                Node::Inner(inner) => {
                    let ik = inner.key();
                    if ik.len() >= rem.len() {
                        if &ik[..rem.len()] != rem {
                            path.clear();
                            return Ok(());
                        }
                        match range {
                            None => return self.descend_last(path, root),
                            Some((lo, hi)) => {
                                if ik.len() > rem.len() {
                                    // The prefix ends inside this edge; the
                                    // next edge nibble decides for the whole
                                    // subtree.
                                    let n = ik[rem.len()];
                                    if n >= lo && n <= hi {
                                        return self.descend_last(path, root);
                                    }
                                    path.clear();
                                    return Ok(());
                                }
                                // Edge consumed exactly: pick the greatest
                                // branch inside the admissible nibble range.
                                // The node's own value ends before the partial
                                // nibble and can never carry the prefix.
                                let b = inner.reverse_lower_bound(hi as i32);
                                if b >= lo as i32 {
                                    path.push((root, b as i8));
                                    return self.descend_last(path, inner.branch(b as u8));
                                }
                                path.clear();
                                return Ok(());
                            }
                        }
                    }
                    if &rem[..ik.len()] != ik {
                        path.clear();
                        return Ok(());
                    }
                    let nib = rem[ik.len()];
                    if !inner.has_branch(nib) {
                        path.clear();
                        return Ok(());
                    }
                    path.push((root, nib as i8));
                    rem = &rem[ik.len() + 1..];
                    root = inner.branch(nib);
                }
            }
        }
    }

    // --- path navigation --------------------------------------------------

    fn descend_first(&self, path: &mut Vec<(ObjectId, i8)>, mut id: ObjectId) -> TrellisResult<()> {
        loop {
            match self.resolve(id)? {
                Node::Leaf(_) => {
                    path.push((id, -1));
                    return Ok(());
                }
                Node::Inner(inner) => {
                    if !inner.value_id().is_null() {
                        path.push((id, -1));
                        return Ok(());
                    }
                    let b = inner.lower_bound(0);
                    if b > 63 {
                        return Err(self.malformed(id, "inner node with no value and no branches"));
                    }
                    path.push((id, b as i8));
                    id = inner.branch(b as u8);
                }
            }
        }
    }

    fn descend_last(&self, path: &mut Vec<(ObjectId, i8)>, mut id: ObjectId) -> TrellisResult<()> {
        loop {
            match self.resolve(id)? {
                Node::Leaf(_) => {
                    path.push((id, -1));
                    return Ok(());
                }
                Node::Inner(inner) => {
                    let b = inner.reverse_lower_bound(63);
                    if b < 0 {
                        path.push((id, -1));
                        return Ok(());
                    }
                    path.push((id, b as i8));
                    id = inner.branch(b as u8);
                }
            }
        }
    }

    pub(crate) fn next_path(&self, path: &mut Vec<(ObjectId, i8)>) -> TrellisResult<()> {
        loop {
            let Some(&(id, br)) = path.last() else { return Ok(()) };
            match self.resolve(id)? {
                Node::Leaf(_) => {
                    path.pop();
                }
                Node::Inner(inner) => {
                    let nb = inner.lower_bound(br as i32 + 1);
                    if nb <= 63 {
                        path.last_mut().unwrap().1 = nb as i8;
                        let child = inner.branch(nb as u8);
                        return self.descend_first(path, child);
                    }
                    path.pop();
                }
            }
        }
    }

    pub(crate) fn prev_path(&self, path: &mut Vec<(ObjectId, i8)>) -> TrellisResult<()> {
        loop {
            let Some(&(id, br)) = path.last() else { return Ok(()) };
            match self.resolve(id)? {
                Node::Leaf(_) => {
                    path.pop();
                }
                Node::Inner(inner) => {
                    if br == -1 {
                        path.pop();
                        continue;
                    }
                    let pb = inner.reverse_lower_bound(br as i32 - 1);
                    if pb >= 0 {
                        path.last_mut().unwrap().1 = pb as i8;
                        let child = inner.branch(pb as u8);
                        return self.descend_last(path, child);
                    }
                    if !inner.value_id().is_null() {
                        path.last_mut().unwrap().1 = -1;
                        return Ok(());
                    }
                    path.pop();
                }
            }
        }
    }

    pub(crate) fn key_of(&self, path: &[(ObjectId, i8)]) -> TrellisResult<Vec<u8>> {
        let mut k6 = Vec::new();
        for &(id, br) in path {
            match self.resolve(id)? {
                Node::Leaf(leaf) => k6.extend_from_slice(leaf.key()),
                Node::Inner(inner) => k6.extend_from_slice(inner.key()),
            }
            if br >= 0 {
                k6.push(br as u8);
            }
        }
        Ok(from_key6(&k6))
    }

    pub(crate) fn value_of(&self, path: &[(ObjectId, i8)]) -> TrellisResult<Vec<u8>> {
        let Some(&(id, _)) = path.last() else {
            return Err(TrellisError::InvalidArgument { what: "cursor is not valid".into() });
        };
        match self.resolve(id)? {
            Node::Leaf(leaf) => Ok(leaf.value().to_vec()),
            Node::Inner(inner) => {
                let v = inner.value_id();
                if v.is_null() {
                    return Err(self.malformed(id, "cursor parked on a valueless inner node"));
                }
                match self.resolve(v)? {
                    Node::Leaf(leaf) => Ok(leaf.value().to_vec()),
                    Node::Inner(_) => Err(self.malformed(v, "inner node in a value slot")),
                }
            }
        }
    }

    /// Seed version for a write session: one past everything reachable.
    pub(crate) fn root_version(&self) -> TrellisResult<u64> {
        if self.root.is_null() {
            return Ok(0);
        }
        let _g = self.guard();
        match self.resolve(self.root)? {
            Node::Leaf(_) => Ok(0),
            Node::Inner(inner) => Ok(inner.version()),
        }
    }

    fn malformed(&self, id: ObjectId, detail: &str) -> TrellisError {
        TrellisError::Corruption {
            path: None,
            detail: format!("{} (id {})", detail, id.raw()),
        }
    }
}

/// A pinned, immutable view of one root revision.
pub struct ReadSession<'db> {
    pub(crate) core: SessionCore<'db>,
}

impl<'db> ReadSession<'db> {
    pub(crate) fn new(db: &'db Database, root: ObjectId) -> ReadSession<'db> {
        ReadSession { core: SessionCore::new(db, root) }
    }

    /// The value mapped to `key`, or None.
    pub fn get(&self, key: &[u8]) -> TrellisResult<Option<Vec<u8>>> {
        self.core.get(key)
    }

    /// Cursor on the smallest key.
    pub fn first(&self) -> TrellisResult<Cursor<'_>> {
        self.core.first()
    }

    /// Cursor on the greatest key.
    pub fn last(&self) -> TrellisResult<Cursor<'_>> {
        self.core.last()
    }

    /// Cursor on exactly `key`; invalid if absent.
    pub fn find(&self, key: &[u8]) -> TrellisResult<Cursor<'_>> {
        self.core.find(key)
    }

    /// Cursor on the smallest key >= `key`.
    pub fn lower_bound(&self, key: &[u8]) -> TrellisResult<Cursor<'_>> {
        self.core.lower_bound(key)
    }

    /// Cursor on the greatest key that starts with `prefix` (byte-wise).
    pub fn last_with_prefix(&self, prefix: &[u8]) -> TrellisResult<Cursor<'_>> {
        self.core.last_with_prefix(prefix)
    }

    /// The root revision this session is pinned to.
    pub fn revision(&self) -> ObjectId {
        self.core.root
    }
}

impl Drop for ReadSession<'_> {
    fn drop(&mut self) {
        self.core.close();
    }
}

/// An ordered cursor over one session's snapshot.
///
/// Borrowing rules double as the invalidation rules: a cursor borrows its
/// session immutably, so any mutating call on a write session first requires
/// every cursor to be gone.
pub struct Cursor<'s> {
    pub(crate) core: &'s SessionCore<'s>,
    pub(crate) path: Vec<(ObjectId, i8)>,
}

impl Cursor<'_> {
    /// False once the cursor has run off either end (or a find missed).
    pub fn valid(&self) -> bool {
        !self.path.is_empty()
    }

    /// The full key at the cursor, in public byte form.
    pub fn key(&self) -> TrellisResult<Vec<u8>> {
        let _g = self.core.guard();
        self.core.key_of(&self.path)
    }

    /// The value at the cursor.
    pub fn value(&self) -> TrellisResult<Vec<u8>> {
        let _g = self.core.guard();
        self.core.value_of(&self.path)
    }

    /// Advance to the next key in ascending order.
    pub fn next(&mut self) -> TrellisResult<()> {
        let _g = self.core.guard();
        self.core.next_path(&mut self.path)
    }

    /// Step back to the previous key.
    pub fn prev(&mut self) -> TrellisResult<()> {
        let _g = self.core.guard();
        self.core.prev_path(&mut self.path)
    }
}
