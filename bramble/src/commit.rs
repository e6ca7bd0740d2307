//! Hashing and flushing of dirty subtrees into the cell array.
//!
//! A flush is a post-order walk: every child's cells land below its
//! parent's, and one dirty child of each internal node is written
//! immediately before the parent so its index can be elided from the
//! parent's cell. The left child takes the adjacent slot when both are
//! dirty. Cell bytes are synced before the new length and root are
//! published, so readers never observe a half-written parent.

use crate::error::{Error, Result};
use crate::{HashAlgorithm, Shared};
use bramble_core::node::{CellIndex, Node, View, ViewKind, NIL_INDEX};
use bramble_core::{Digest, EMPTY_DIGEST};

use crate::store::cell;

/// Compute the digest of a subtree, filling digest caches along the way.
pub(crate) fn node_digest<H: HashAlgorithm>(sh: &Shared, node: &Node) -> Result<Digest> {
    match node {
        Node::Null => Ok(EMPTY_DIGEST),
        Node::Disk(index) => sh.store.node_digest(*index),
        Node::View(view) => {
            if let Some(digest) = view.cached_digest() {
                return Ok(*digest);
            }
            let digest = match view.kind() {
                ViewKind::Internal { left, right } => H::hash_internal(
                    &node_digest::<H>(sh, left)?,
                    &node_digest::<H>(sh, right)?,
                ),
                ViewKind::Extender { segment, child } => {
                    H::hash_extender(segment, &node_digest::<H>(sh, child)?)
                }
                ViewKind::Bud { child } => H::hash_bud(&node_digest::<H>(sh, child)?),
                ViewKind::Leaf { value_hash } => H::hash_leaf(value_hash),
            };
            view.cache_digest(digest);
            Ok(digest)
        }
    }
}

/// The number of cells a flush of this subtree will append.
fn cells_to_write(node: &Node) -> u64 {
    let Some(view) = node.as_view() else { return 0 };
    match view.kind() {
        ViewKind::Internal { left, right } => 1 + cells_to_write(left) + cells_to_write(right),
        ViewKind::Extender { child, .. } => 1 + cells_to_write(child),
        ViewKind::Bud { child } => 1 + cells_to_write(child),
        ViewKind::Leaf { .. } => 2,
    }
}

/// Flush every dirty node under `root`, record the root in the root table,
/// and republish the meta and leaf files. Returns the indexed root handle
/// and its digest. Idempotent on already-indexed subtrees.
pub(crate) fn commit<H: HashAlgorithm>(sh: &Shared, root: Node) -> Result<(Node, Digest)> {
    let _writer = sh.writer.lock();

    if root.is_null() {
        sh.roots.lock().insert(EMPTY_DIGEST, NIL_INDEX);
        persist::<H>(sh)?;
        return Ok((Node::Null, EMPTY_DIGEST));
    }

    let needed = cells_to_write(&root);
    let start = sh.store.length();
    let free = sh.store.capacity() - start;
    if needed > free {
        return Err(Error::OutOfSpace { needed, free });
    }

    let mut writer = CellWriter { sh, next: start };
    let (index, digest) = writer.flush::<H>(&root)?;
    debug_assert_eq!(writer.next, start + needed);

    sh.store.sync_cells(start, writer.next)?;
    sh.store.publish_length(writer.next);
    sh.roots.lock().insert(digest, index);
    persist::<H>(sh)?;

    tracing::debug!(cells = needed, index, "committed root");
    Ok((Node::Disk(index), digest))
}

/// Republish the leaf image and the meta file, in that order.
pub(crate) fn persist<H: HashAlgorithm>(sh: &Shared) -> Result<()> {
    {
        let leaves = sh.leaves.lock();
        sh.store.write_leaves::<H>(&leaves)?;
    }
    let roots: Vec<_> = sh.roots.lock().iter().map(|(d, i)| (*d, *i)).collect();
    sh.store.write_meta::<H>(roots)
}

struct CellWriter<'a> {
    sh: &'a Shared,
    next: CellIndex,
}

impl<'a> CellWriter<'a> {
    fn flush<H: HashAlgorithm>(&mut self, node: &Node) -> Result<(CellIndex, Digest)> {
        match node {
            // edits never leave a null below a materialized node; reaching
            // one here is a construction bug.
            Node::Null => panic!("null node in a flushed subtree"),
            Node::Disk(index) => Ok((*index, self.sh.store.node_digest(*index)?)),
            Node::View(view) => match view.kind() {
                ViewKind::Internal { left, right } => self.flush_internal::<H>(view, left, right),
                ViewKind::Extender { segment, child } => {
                    let (child_index, child_digest) = self.flush::<H>(child)?;
                    let digest = cached_or(view, || H::hash_extender(segment, &child_digest));
                    let index = self.write(&cell::encode_extender(segment, child_index, &digest));
                    Ok((index, digest))
                }
                ViewKind::Bud { child } => {
                    let (child_index, child_digest) = self.flush::<H>(child)?;
                    let digest = cached_or(view, || H::hash_bud(&child_digest));
                    let index = self.write(&cell::encode_bud(child_index, &digest));
                    Ok((index, digest))
                }
                ViewKind::Leaf { value_hash } => {
                    let digest = cached_or(view, || H::hash_leaf(value_hash));
                    let (payload, ext) = cell::encode_leaf(&digest, value_hash);
                    let index = self.write(&payload);
                    self.write(&ext);
                    Ok((index, digest))
                }
            },
        }
    }

    fn flush_internal<H: HashAlgorithm>(
        &mut self,
        view: &View,
        left: &Node,
        right: &Node,
    ) -> Result<(CellIndex, Digest)> {
        // the adjacent child goes last so its cells end right below the
        // parent. Prefer the left child when both are dirty.
        let (left_slot, right_slot, left_digest, right_digest);
        if !left.is_indexed() {
            let (r_index, r_digest) = self.flush::<H>(right)?;
            let (l_index, l_digest) = self.flush::<H>(left)?;
            debug_assert!(self.ends_adjacent(l_index, left));
            left_slot = None;
            right_slot = Some(r_index);
            left_digest = l_digest;
            right_digest = r_digest;
        } else if !right.is_indexed() {
            let (l_index, l_digest) = self.flush::<H>(left)?;
            let (r_index, r_digest) = self.flush::<H>(right)?;
            debug_assert!(self.ends_adjacent(r_index, right));
            left_slot = Some(l_index);
            right_slot = None;
            left_digest = l_digest;
            right_digest = r_digest;
        } else {
            // both children indexed: legitimate only for a re-flushed
            // materialized node. No adjacency; store both indices.
            debug_assert!(
                view.is_indexed(),
                "unindexed internal node with two indexed children"
            );
            let (l_index, l_digest) = self.flush::<H>(left)?;
            let (r_index, r_digest) = self.flush::<H>(right)?;
            left_slot = Some(l_index);
            right_slot = Some(r_index);
            left_digest = l_digest;
            right_digest = r_digest;
        }

        let digest = cached_or(view, || H::hash_internal(&left_digest, &right_digest));
        let index = self.write(&cell::encode_internal(left_slot, right_slot, &digest));
        Ok((index, digest))
    }

    fn write(&mut self, cell: &cell::Cell) -> CellIndex {
        let index = self.next;
        self.sh.store.write_cell(index, cell);
        self.next += 1;
        index
    }

    /// Whether the node just written at `index` ends in the cell right below
    /// the next write position.
    fn ends_adjacent(&self, index: CellIndex, node: &Node) -> bool {
        let width = match node.as_view().map(View::kind) {
            Some(ViewKind::Leaf { .. }) => 2,
            _ => 1,
        };
        index + width == self.next
    }
}

fn cached_or(view: &View, compute: impl FnOnce() -> Digest) -> Digest {
    match view.cached_digest() {
        Some(digest) => *digest,
        None => {
            let digest = compute();
            view.cache_digest(digest);
            digest
        }
    }
}
