//! Write sessions — upsert, remove, fork, publish, and crash-recovery GC
//!
//! A write session owns a private root and a monotonic `version`. Nodes it
//! creates carry that version; a node whose version matches the session's may
//! be patched in place, every other node is cloned on write. The version is
//! seeded above everything reachable from the published root and bumped on
//! every publish, so version-match is exactly "created since the last
//! publish" and in-place mutation can never be observed by a snapshot.
//!
//! In-place payload or pointer patches additionally take the object's
//! move-lock for their duration, so the evacuator either finishes relocating
//! the object before the patch resolves its pointer, or skips the object
//! entirely while the patch holds the lock.
//!
//! At most one write session exists per database at a time; the facade
//! enforces it.

use crate::database::Database;
use crate::directory::{NodeKind, ObjectId};
use crate::error::{TrellisError, TrellisResult};
use crate::key::{common_prefix, to_key6};
use crate::node::{InnerRef, LeafRef, Node, MAX_KEY_SIZE, MAX_VALUE_SIZE};
use crate::session::{Cursor, SessionCore};

/// What a cloned inner node's value slot should hold.
enum ValueArg {
    /// Share the source node's value (takes a reference on it).
    Inherit,
    /// Use this id, transferring ownership of one reference (may be null).
    Set(ObjectId),
}

/// The single writer's handle: a read session plus mutation.
pub struct WriteSession<'db> {
    pub(crate) core: SessionCore<'db>,
    version: u64,
}

impl<'db> WriteSession<'db> {
    pub(crate) fn new(core: SessionCore<'db>, version: u64) -> WriteSession<'db> {
        WriteSession { core, version }
    }

    fn db(&self) -> &'db Database {
        self.core.db
    }

    // --- read surface (the writer sees its own uncommitted root) ----------

    pub fn get(&self, key: &[u8]) -> TrellisResult<Option<Vec<u8>>> {
        self.core.get(key)
    }

    pub fn first(&self) -> TrellisResult<Cursor<'_>> {
        self.core.first()
    }

    pub fn last(&self) -> TrellisResult<Cursor<'_>> {
        self.core.last()
    }

    pub fn find(&self, key: &[u8]) -> TrellisResult<Cursor<'_>> {
        self.core.find(key)
    }

    pub fn lower_bound(&self, key: &[u8]) -> TrellisResult<Cursor<'_>> {
        self.core.lower_bound(key)
    }

    pub fn last_with_prefix(&self, prefix: &[u8]) -> TrellisResult<Cursor<'_>> {
        self.core.last_with_prefix(prefix)
    }

    /// The session's current (possibly unpublished) root.
    pub fn revision(&self) -> ObjectId {
        self.core.root
    }

    // --- mutation ----------------------------------------------------------

    /// Insert or update. Returns the replaced value's length, or -1 when the
    /// key was absent.
    pub fn upsert(&mut self, key: &[u8], value: &[u8]) -> TrellisResult<i32> {
        if key.len() > MAX_KEY_SIZE {
            return Err(TrellisError::InvalidArgument {
                what: format!("key length {} exceeds {}", key.len(), MAX_KEY_SIZE),
            });
        }
        if value.len() > MAX_VALUE_SIZE {
            return Err(TrellisError::InvalidArgument {
                what: format!("value length {} exceeds {}", value.len(), MAX_VALUE_SIZE),
            });
        }
        self.db().ensure_free_space();
        let k6 = to_key6(key);
        let old_root = self.core.root;
        let mut old_size = -1i32;
        let new_root = {
            let _g = self.core.guard();
            self.add_child(old_root, &k6, value, &mut old_size)?
        };
        if new_root != old_root {
            self.core.root = new_root;
            if !old_root.is_null() {
                let _g = self.core.guard();
                self.db().release_tree(old_root)?;
            }
        }
        Ok(old_size)
    }

    /// Remove a mapping. Returns the removed value's length, or -1 when the
    /// key was absent.
    pub fn remove(&mut self, key: &[u8]) -> TrellisResult<i32> {
        if key.len() > MAX_KEY_SIZE {
            return Err(TrellisError::InvalidArgument {
                what: format!("key length {} exceeds {}", key.len(), MAX_KEY_SIZE),
            });
        }
        self.db().ensure_free_space();
        let k6 = to_key6(key);
        let old_root = self.core.root;
        let mut removed = -1i32;
        let new_root = {
            let _g = self.core.guard();
            self.remove_child(old_root, &k6, &mut removed)?
        };
        if new_root != old_root {
            self.core.root = new_root;
            if !old_root.is_null() {
                let _g = self.core.guard();
                self.db().release_tree(old_root)?;
            }
        }
        Ok(removed)
    }

    /// Drop every mapping from this session's root.
    pub fn clear(&mut self) -> TrellisResult<()> {
        let old = std::mem::replace(&mut self.core.root, ObjectId::NULL);
        if !old.is_null() {
            let _g = self.core.guard();
            self.db().release_tree(old)?;
        }
        Ok(())
    }

    /// Fork the session onto a copy of its current root. See [`Self::fork_from`].
    pub fn fork(&mut self) -> TrellisResult<ObjectId> {
        self.fork_from(self.core.root)
    }

    /// Make the session mutate against a fresh copy of `base`.
    ///
    /// The copy shares all of `base`'s children; only the top node is cloned,
    /// with the session's version bumped past everything in the base tree, so
    /// later mutations copy shared interior nodes lazily.
    pub fn fork_from(&mut self, base: ObjectId) -> TrellisResult<ObjectId> {
        self.db().ensure_free_space();
        let new_root = {
            let _g = self.core.guard();
            if base.is_null() {
                ObjectId::NULL
            } else {
                match self.db().resolve(base)? {
                    Node::Leaf(leaf) => self.make_value(leaf.key(), leaf.value())?,
                    Node::Inner(inner) => {
                        self.version = inner.version() + 1;
                        self.make_inner_from(
                            &inner,
                            inner.key(),
                            ValueArg::Inherit,
                            inner.branches(),
                            None,
                        )?
                    }
                }
            }
        };
        let old = std::mem::replace(&mut self.core.root, new_root);
        if !old.is_null() {
            let _g = self.core.guard();
            self.db().release_tree(old)?;
        }
        Ok(new_root)
    }

    /// Durably publish `root` as the database's root revision.
    ///
    /// Readers that start after this returns see `root`; existing readers
    /// keep their snapshots. The session version is bumped so nodes that just
    /// became shared are no longer patched in place.
    pub fn set_root_revision(&mut self, root: ObjectId) -> TrellisResult<()> {
        let _g = self.core.guard();
        self.db().publish_root(root)?;
        self.version += 1;
        Ok(())
    }

    // --- crash-recovery garbage collection ---------------------------------

    /// Reset every live refcount to 1 and set the durable gc-running flag.
    /// All sessions other than this one must be closed.
    pub fn start_collect_garbage(&mut self) -> TrellisResult<()> {
        self.db().begin_collect_garbage()
    }

    /// Mark everything reachable from `root`. Retaining an already-marked
    /// root just takes one more reference on it and prunes the walk, so
    /// re-retaining shared roots is cheap.
    pub fn recursive_retain(&mut self, root: ObjectId) -> TrellisResult<()> {
        if root.is_null() {
            return Ok(());
        }
        let _g = self.core.guard();
        self.db().recursive_retain(root)
    }

    /// Remove the mark baseline, rebuild the free list, clear the flag.
    pub fn end_collect_garbage(&mut self) -> TrellisResult<()> {
        self.db().finish_collect_garbage()
    }

    // --- node construction -------------------------------------------------

    fn make_value(&self, key6: &[u8], value: &[u8]) -> TrellisResult<ObjectId> {
        let db = self.db();
        let size = LeafRef::payload_size(key6, value);
        let lock = db.dir().alloc(NodeKind::Leaf)?;
        match db.region().allocate(&lock, size, |buf| LeafRef::init(buf, key6, value)) {
            Ok(()) => Ok(lock.into_id()),
            Err(e) => {
                let id = lock.into_id();
                let _ = db.release_tree(id);
                Err(e)
            }
        }
    }

    fn make_inner_new(
        &self,
        key6: &[u8],
        value: ObjectId,
        branches: u64,
        children: &[(u8, ObjectId)],
    ) -> TrellisResult<ObjectId> {
        debug_assert_eq!(branches.count_ones() as usize, children.len());
        let db = self.db();
        let size = InnerRef::payload_size(key6, branches.count_ones());
        let version = self.version;
        let lock = db.dir().alloc(NodeKind::Inner)?;
        let res = db.region().allocate(&lock, size, |buf| {
            InnerRef::init_new(buf, key6, value, branches, version);
            // SAFETY: buf is exactly the freshly reserved payload.
            let n = unsafe { InnerRef::from_raw(buf.as_mut_ptr(), buf.len() as u32) };
            for &(b, id) in children {
                n.set_branch(b, id);
            }
        });
        match res {
            Ok(()) => Ok(lock.into_id()),
            Err(e) => {
                let id = lock.into_id();
                let _ = db.release_tree(id);
                Err(e)
            }
        }
    }

    /// Clone `src` with a new edge label, value slot, and branch set.
    ///
    /// Shared children (and the value, for `Inherit`) get their refcounts
    /// bumped here; an `override_child` slot and a `Set` value transfer
    /// ownership of one reference from the caller.
    fn make_inner_from(
        &self,
        src: &InnerRef,
        key6: &[u8],
        value: ValueArg,
        branches: u64,
        override_child: Option<(u8, ObjectId)>,
    ) -> TrellisResult<ObjectId> {
        let db = self.db();

        let mut bumped: Vec<ObjectId> = Vec::new();
        let unwind = |bumped: &[ObjectId]| {
            for &c in bumped {
                let _ = db.release_tree(c);
            }
        };

        let mut bits = branches;
        while bits != 0 {
            let b = bits.trailing_zeros() as u8;
            bits &= bits - 1;
            if override_child.map_or(false, |(ob, _)| ob == b) {
                continue;
            }
            debug_assert!(src.has_branch(b), "new branch bit without an override");
            let c = src.branch(b);
            if let Err(e) = db.retain(c) {
                unwind(&bumped);
                return Err(e);
            }
            bumped.push(c);
        }

        let value_id = match value {
            ValueArg::Set(v) => v,
            ValueArg::Inherit => {
                let v = src.value_id();
                if !v.is_null() {
                    if let Err(e) = db.retain(v) {
                        unwind(&bumped);
                        return Err(e);
                    }
                    bumped.push(v);
                }
                v
            }
        };

        let size = InnerRef::payload_size(key6, branches.count_ones());
        let version = self.version;
        let lock = match db.dir().alloc(NodeKind::Inner) {
            Ok(l) => l,
            Err(e) => {
                unwind(&bumped);
                return Err(e);
            }
        };
        let res = db.region().allocate(&lock, size, |buf| {
            InnerRef::init_from(buf, src, key6, value_id, branches, version);
            if let Some((ob, oid)) = override_child {
                // SAFETY: buf is exactly the freshly reserved payload.
                let n = unsafe { InnerRef::from_raw(buf.as_mut_ptr(), buf.len() as u32) };
                n.set_branch(ob, oid);
            }
        });
        match res {
            Ok(()) => Ok(lock.into_id()),
            Err(e) => {
                let id = lock.into_id();
                unwind(&bumped);
                let _ = db.release_tree(id);
                Err(e)
            }
        }
    }

    /// Patch an inner node in place, holding its move-lock so a concurrent
    /// relocation cannot tear the write. The pointer is resolved after the
    /// lock is taken in case the evacuator just moved the node.
    fn locked_inner<F: FnOnce(&InnerRef)>(&self, id: ObjectId, f: F) -> TrellisResult<()> {
        let db = self.db();
        let lock = db.dir().spin_lock(id);
        let res = match db.resolve(id)? {
            Node::Inner(inner) => {
                f(&inner);
                Ok(())
            }
            Node::Leaf(_) => Err(TrellisError::Corruption {
                path: None,
                detail: format!("expected inner node at id {}", id.raw()),
            }),
        };
        drop(lock);
        res
    }

    /// Same-size in-place leaf rewrite under the move-lock.
    fn locked_leaf_overwrite(&self, id: ObjectId, value: &[u8]) -> TrellisResult<()> {
        let db = self.db();
        let lock = db.dir().spin_lock(id);
        let res = match db.resolve(id)? {
            Node::Leaf(leaf) => {
                leaf.overwrite_value(value);
                Ok(())
            }
            Node::Inner(_) => Err(TrellisError::Corruption {
                path: None,
                detail: format!("expected leaf node at id {}", id.raw()),
            }),
        };
        drop(lock);
        res
    }

    // --- insert ------------------------------------------------------------

    /// Core upsert descent. Returns the id of the subtree with the mapping
    /// applied: the same id when the node could be updated in place, a new id
    /// otherwise. `old_size` receives the replaced value's length.
    fn add_child(
        &self,
        root: ObjectId,
        key: &[u8],
        val: &[u8],
        old_size: &mut i32,
    ) -> TrellisResult<ObjectId> {
        if root.is_null() {
            return self.make_value(key, val);
        }
        match self.db().resolve(root)? {
            Node::Leaf(leaf) => {
                if leaf.key() != key {
                    return self.combine_value_nodes(leaf.key(), leaf.value(), key, val);
                }
                *old_size = leaf.value_len() as i32;
                self.set_value(root, &leaf, key, val)
            }
            Node::Inner(inner) => {
                let ik = inner.key();
                if ik == key {
                    let iv = inner.value_id();
                    if !iv.is_null() {
                        if let Node::Leaf(v) = self.db().resolve(iv)? {
                            *old_size = v.value_len() as i32;
                        }
                    }
                    return self.set_inner_value(root, &inner, val);
                }

                let cpre = common_prefix(ik, key);
                if cpre.len() == ik.len() {
                    // The key continues below this node.
                    let b = key[cpre.len()];
                    let rest = &key[cpre.len() + 1..];

                    if inner.version() == self.version && inner.has_branch(b) {
                        let cur_b = inner.branch(b);
                        let new_b = self.add_child(cur_b, rest, val, old_size)?;
                        if new_b != cur_b {
                            self.locked_inner(root, |n| n.set_branch(b, new_b))?;
                            self.db().release_tree(cur_b)?;
                        }
                        return Ok(root);
                    }

                    // Copy on write. Holding an extra reference on the child
                    // across the recursion keeps its leaves from being
                    // rewritten in place while the old tree still shares them.
                    let cur_b =
                        if inner.has_branch(b) { inner.branch(b) } else { ObjectId::NULL };
                    if !cur_b.is_null() {
                        self.db().retain(cur_b)?;
                    }
                    let recursed = self.add_child(cur_b, rest, val, old_size);
                    if !cur_b.is_null() {
                        self.db().release_tree(cur_b)?;
                    }
                    let new_b = recursed?;
                    debug_assert_ne!(new_b, cur_b);
                    return self.make_inner_from(
                        &inner,
                        ik,
                        ValueArg::Inherit,
                        inner.branches() | (1u64 << b),
                        Some((b, new_b)),
                    );
                }

                // The node's edge and the key diverge at the common prefix:
                // split into a new parent at the divergence.
                if cpre.len() == key.len() {
                    // The key ends at the split point and becomes the new
                    // parent's own value.
                    let b1 = ik[cpre.len()];
                    let sub = self.make_inner_from(
                        &inner,
                        &ik[cpre.len() + 1..],
                        ValueArg::Inherit,
                        inner.branches(),
                        None,
                    )?;
                    let v = self.make_value(&[], val)?;
                    self.make_inner_new(cpre, v, 1u64 << b1, &[(b1, sub)])
                } else {
                    let b1 = key[cpre.len()];
                    let b2 = ik[cpre.len()];
                    let leaf = self.make_value(&key[cpre.len() + 1..], val)?;
                    let sub = self.make_inner_from(
                        &inner,
                        &ik[cpre.len() + 1..],
                        ValueArg::Inherit,
                        inner.branches(),
                        None,
                    )?;
                    self.make_inner_new(
                        cpre,
                        ObjectId::NULL,
                        (1u64 << b1) | (1u64 << b2),
                        &[(b1, leaf), (b2, sub)],
                    )
                }
            }
        }
    }

    /// Two leaves under a fresh inner node (or one as the node's own value).
    fn combine_value_nodes(
        &self,
        k1: &[u8],
        v1: &[u8],
        k2: &[u8],
        v2: &[u8],
    ) -> TrellisResult<ObjectId> {
        if k1.len() > k2.len() {
            return self.combine_value_nodes(k2, v2, k1, v1);
        }
        let cpre = common_prefix(k1, k2);
        if cpre.len() == k1.len() {
            // k1 ends exactly at the new node; k2 continues on a branch.
            let inner_value = self.make_value(&[], v1)?;
            let b2 = k2[cpre.len()];
            let l2 = self.make_value(&k2[cpre.len() + 1..], v2)?;
            self.make_inner_new(cpre, inner_value, 1u64 << b2, &[(b2, l2)])
        } else {
            let b1 = k1[cpre.len()];
            let b2 = k2[cpre.len()];
            let l1 = self.make_value(&k1[cpre.len() + 1..], v1)?;
            let l2 = self.make_value(&k2[cpre.len() + 1..], v2)?;
            self.make_inner_new(
                cpre,
                ObjectId::NULL,
                (1u64 << b1) | (1u64 << b2),
                &[(b1, l1), (b2, l2)],
            )
        }
    }

    /// Replace a leaf's value, in place when the leaf is exclusively ours and
    /// the size matches.
    fn set_value(
        &self,
        id: ObjectId,
        leaf: &LeafRef,
        key: &[u8],
        val: &[u8],
    ) -> TrellisResult<ObjectId> {
        if self.db().dir().ref_count(id) == 1 && leaf.value_len() == val.len() {
            self.locked_leaf_overwrite(id, val)?;
            return Ok(id);
        }
        self.make_value(key, val)
    }

    /// Write or replace an inner node's own value.
    fn set_inner_value(
        &self,
        id: ObjectId,
        inner: &InnerRef,
        val: &[u8],
    ) -> TrellisResult<ObjectId> {
        if inner.version() == self.version {
            let v = inner.value_id();
            if !v.is_null() {
                if let Node::Leaf(leaf) = self.db().resolve(v)? {
                    if self.db().dir().ref_count(v) == 1 && leaf.value_len() == val.len() {
                        self.locked_leaf_overwrite(v, val)?;
                        return Ok(id);
                    }
                }
                let nv = self.make_value(&[], val)?;
                self.locked_inner(id, |n| n.set_value_id(nv))?;
                self.db().release_tree(v)?;
                return Ok(id);
            }
            let nv = self.make_value(&[], val)?;
            self.locked_inner(id, |n| n.set_value_id(nv))?;
            return Ok(id);
        }
        let nv = self.make_value(&[], val)?;
        self.make_inner_from(inner, inner.key(), ValueArg::Set(nv), inner.branches(), None)
    }

    // --- remove ------------------------------------------------------------

    /// Core remove descent. Returns the replacement subtree id (same id when
    /// untouched or patched in place, null when the subtree vanishes).
    fn remove_child(
        &self,
        root: ObjectId,
        key: &[u8],
        removed: &mut i32,
    ) -> TrellisResult<ObjectId> {
        if root.is_null() {
            return Ok(root);
        }
        match self.db().resolve(root)? {
            Node::Leaf(leaf) => {
                if leaf.key() == key {
                    *removed = leaf.value_len() as i32;
                    Ok(ObjectId::NULL)
                } else {
                    Ok(root)
                }
            }
            Node::Inner(inner) => {
                let ik = inner.key();
                if ik.len() > key.len() {
                    return Ok(root);
                }
                if ik == key {
                    return self.remove_inner_value(root, &inner, removed);
                }
                if &key[..ik.len()] != ik {
                    return Ok(root);
                }
                let b = key[ik.len()];
                if !inner.has_branch(b) {
                    return Ok(root);
                }
                let cur_b = inner.branch(b);
                let new_b = self.remove_child(cur_b, &key[ik.len() + 1..], removed)?;
                if new_b == cur_b {
                    return Ok(root);
                }

                if !new_b.is_null() {
                    // Updated branch.
                    if inner.version() == self.version {
                        self.locked_inner(root, |n| n.set_branch(b, new_b))?;
                        self.db().release_tree(cur_b)?;
                        return Ok(root);
                    }
                    return self.make_inner_from(
                        &inner,
                        ik,
                        ValueArg::Inherit,
                        inner.branches(),
                        Some((b, new_b)),
                    );
                }

                // The branch vanished.
                let new_branches = inner.branches() & !(1u64 << b);
                let populated =
                    new_branches.count_ones() as u64 + (!inner.value_id().is_null()) as u64;
                if populated > 1 {
                    // Still enough slots; just drop the branch.
                    return self.make_inner_from(
                        &inner,
                        ik,
                        ValueArg::Inherit,
                        new_branches,
                        None,
                    );
                }
                if new_branches == 0 {
                    // Only the node's own value remains; collapse to a leaf.
                    let iv = inner.value_id();
                    let Node::Leaf(v) = self.db().resolve(iv)? else {
                        return Err(TrellisError::Corruption {
                            path: None,
                            detail: format!("inner node in value slot of id {}", root.raw()),
                        });
                    };
                    let mut nk = ik.to_vec();
                    nk.extend_from_slice(v.key());
                    return self.make_value(&nk, v.value());
                }
                // One branch remains (and no value): lift it into this node.
                let lb = new_branches.trailing_zeros() as u8;
                self.fuse_child(ik, lb, inner.branch(lb))
            }
        }
    }

    /// Remove the value sitting on an inner node whose edge equals the key.
    fn remove_inner_value(
        &self,
        root: ObjectId,
        inner: &InnerRef,
        removed: &mut i32,
    ) -> TrellisResult<ObjectId> {
        let iv = inner.value_id();
        if iv.is_null() {
            return Ok(root);
        }
        if let Node::Leaf(v) = self.db().resolve(iv)? {
            *removed = v.value_len() as i32;
        }
        if inner.num_branches() == 1 {
            // A single child is left: fuse it into this node's edge.
            let b = inner.branches().trailing_zeros() as u8;
            return self.fuse_child(inner.key(), b, inner.branch(b));
        }
        if inner.version() == self.version {
            self.locked_inner(root, |n| n.set_value_id(ObjectId::NULL))?;
            self.db().release_tree(iv)?;
            return Ok(root);
        }
        self.make_inner_from(
            inner,
            inner.key(),
            ValueArg::Set(ObjectId::NULL),
            inner.branches(),
            None,
        )
    }

    /// Rebuild `child` with the parent's edge, the lifting nibble, and its
    /// own edge concatenated. Restores the ">= 2 populated slots" invariant.
    fn fuse_child(&self, parent_key: &[u8], nibble: u8, child: ObjectId) -> TrellisResult<ObjectId> {
        let mut nk = Vec::with_capacity(parent_key.len() + 1 + 8);
        nk.extend_from_slice(parent_key);
        nk.push(nibble);
        match self.db().resolve(child)? {
            Node::Leaf(cl) => {
                nk.extend_from_slice(cl.key());
                self.make_value(&nk, cl.value())
            }
            Node::Inner(ci) => {
                nk.extend_from_slice(ci.key());
                self.make_inner_from(&ci, &nk, ValueArg::Inherit, ci.branches(), None)
            }
        }
    }
}

impl Drop for WriteSession<'_> {
    fn drop(&mut self) {
        self.core.close();
        self.core.db.writer_done();
    }
}
