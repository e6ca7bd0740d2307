//! The edit engine: `upsert`, `get`, and `delete` over segmented paths.
//!
//! All three walk the same case analysis over `(node, segment tail, rest of
//! path)`, materializing `Disk` references on demand. Upsert rebuilds the
//! spine above the touched leaf, structurally sharing every untouched
//! sibling; delete collapses the spine on the way back so extender
//! minimality survives removals.

use crate::error::{Error, Result};
use crate::store::MAX_SEGMENT_BITS;
use crate::{HashAlgorithm, Shared};
use bramble_core::node::{
    make_bud, make_extender, make_internal, make_leaf, Node, ViewKind,
};
use bramble_core::path::Path;
use bramble_core::seg::{self, SegBits, Segment, Side};
use bramble_core::Digest;

/// Reject segments no extender cell could hold. Splits only shorten
/// segments and collapse only rejoins fragments of one original, so
/// bounding inputs here bounds every reachable extender.
fn check_segments(path: &Path) -> Result<()> {
    if path.segments().iter().any(|s| s.len() > MAX_SEGMENT_BITS) {
        return Err(Error::BadPath("segment wider than an extender cell"));
    }
    Ok(())
}

fn materialize(sh: &Shared, node: &Node) -> Result<Node> {
    match node {
        Node::Disk(index) => sh.store.load_node(*index),
        other => Ok(other.clone()),
    }
}

/// Insert or overwrite the value at `path`, returning the new root.
pub(crate) fn upsert<H: HashAlgorithm>(
    sh: &Shared,
    root: Node,
    path: &Path,
    value: &[u8],
) -> Result<Node> {
    check_segments(path)?;
    let value_hash = sh.leaves.lock().insert::<H>(value);
    let (first, rest) = path.split_first();
    match upsert_node(sh, root, first.bits(), rest, &value_hash) {
        Ok(new_root) => Ok(new_root),
        Err(e) => {
            // the traversal failed; take back the reference we added.
            sh.leaves.lock().decr(&value_hash);
            Err(e)
        }
    }
}

fn upsert_node(
    sh: &Shared,
    node: Node,
    segment: &SegBits,
    rest: &[Segment],
    value_hash: &Digest,
) -> Result<Node> {
    let view = match node {
        Node::Disk(index) => {
            return upsert_node(sh, sh.store.load_node(index)?, segment, rest, value_hash)
        }
        Node::Null => {
            // a fresh sub-trie: one extender per remaining segment, a bud at
            // each boundary, a leaf at the end.
            let tail = if rest.is_empty() {
                make_leaf(*value_hash)
            } else {
                let sub = upsert_node(sh, Node::Null, rest[0].bits(), &rest[1..], value_hash)?;
                make_bud(sub)
            };
            return Ok(make_extender(Segment::of_bits(segment), tail));
        }
        Node::View(view) => view,
    };

    match view.kind() {
        ViewKind::Internal { left, right } => {
            let Some((side, tail)) = seg::cut(segment) else {
                return Err(Error::BadPath("path ends on an internal node"));
            };
            let (into, other) = match side {
                Side::Left => (left, right),
                Side::Right => (right, left),
            };
            let new_child = upsert_node(sh, into.clone(), tail, rest, value_hash)?;
            Ok(make_internal(new_child, other.clone(), side))
        }
        ViewKind::Leaf { value_hash: old } => {
            if !segment.is_empty() {
                return Err(Error::BadPath("path traverses past a leaf"));
            }
            if !rest.is_empty() {
                return Err(Error::BudLeafConflict(
                    "path expects a sub-trie where a leaf is stored",
                ));
            }
            // only the working tree's own reference is released here; a
            // leaf materialized from a cell is owned by that cell, and
            // compaction reconciles cell-owned references.
            if !view.is_indexed() {
                sh.leaves.lock().decr(old);
            }
            Ok(make_leaf(*value_hash))
        }
        ViewKind::Bud { child } => {
            if !segment.is_empty() {
                return Err(Error::BudLeafConflict(
                    "segment runs across a sub-trie boundary",
                ));
            }
            let Some((next, rest)) = rest.split_first() else {
                return Err(Error::BudLeafConflict(
                    "path ends at a sub-trie boundary",
                ));
            };
            let sub = upsert_node(sh, child.clone(), next.bits(), rest, value_hash)?;
            Ok(make_bud(sub))
        }
        ViewKind::Extender {
            segment: ext,
            child,
        } => {
            let (prefix, seg_tail, ext_tail) = seg::common_prefix(segment, ext.bits());
            match (seg::cut(seg_tail), seg::cut(ext_tail)) {
                // the extender is fully matched; keep descending.
                (_, None) => {
                    let new_child = upsert_node(sh, child.clone(), seg_tail, rest, value_hash)?;
                    Ok(make_extender(ext.clone(), new_child))
                }
                // the path gives out strictly inside the compressed span; a
                // key that is a proper prefix of another has no home here.
                (None, Some(_)) => Err(Error::BadPath(
                    "path ends inside a compressed span",
                )),
                // first bits differ: split the extender around the fork.
                (Some((seg_side, seg_after)), Some((ext_side, ext_after))) => {
                    debug_assert_ne!(seg_side, ext_side);
                    let fresh = upsert_node(sh, Node::Null, seg_after, rest, value_hash)?;
                    let existing = make_extender(Segment::of_bits(ext_after), child.clone());
                    let fork = make_internal(fresh, existing, seg_side);
                    Ok(make_extender(Segment::of_bits(prefix), fork))
                }
            }
        }
    }
}

/// Look up the value at `path`. `Ok(None)` when the path is absent; errors
/// only when the path and the trie structurally disagree.
pub(crate) fn get(sh: &Shared, root: &Node, path: &Path) -> Result<Option<Vec<u8>>> {
    check_segments(path)?;
    let (first, rest) = path.split_first();
    let Some(value_hash) = get_node(sh, root.clone(), first.bits(), rest)? else {
        return Ok(None);
    };
    let leaves = sh.leaves.lock();
    match leaves.get(&value_hash) {
        Some(value) => Ok(Some(value.to_vec())),
        // a reachable leaf always holds a store reference; losing one is a
        // bookkeeping bug, not a caller error.
        None => panic!("leaf value missing from the leaf store"),
    }
}

fn get_node(
    sh: &Shared,
    node: Node,
    segment: &SegBits,
    rest: &[Segment],
) -> Result<Option<Digest>> {
    let view = match node {
        Node::Disk(index) => {
            return get_node(sh, sh.store.load_node(index)?, segment, rest)
        }
        Node::Null => return Ok(None),
        Node::View(view) => view,
    };

    match view.kind() {
        ViewKind::Internal { left, right } => {
            let Some((side, tail)) = seg::cut(segment) else {
                return Err(Error::BadPath("path ends on an internal node"));
            };
            let into = match side {
                Side::Left => left,
                Side::Right => right,
            };
            get_node(sh, into.clone(), tail, rest)
        }
        ViewKind::Leaf { value_hash } => {
            if !segment.is_empty() {
                return Err(Error::BadPath("path traverses past a leaf"));
            }
            if !rest.is_empty() {
                return Err(Error::BudLeafConflict(
                    "path expects a sub-trie where a leaf is stored",
                ));
            }
            Ok(Some(*value_hash))
        }
        ViewKind::Bud { child } => {
            if !segment.is_empty() {
                return Err(Error::BudLeafConflict(
                    "segment runs across a sub-trie boundary",
                ));
            }
            let Some((next, rest)) = rest.split_first() else {
                return Err(Error::BudLeafConflict(
                    "path ends at a sub-trie boundary",
                ));
            };
            get_node(sh, child.clone(), next.bits(), rest)
        }
        ViewKind::Extender {
            segment: ext,
            child,
        } => {
            let (_, seg_tail, ext_tail) = seg::common_prefix(segment, ext.bits());
            match (seg::cut(seg_tail), seg::cut(ext_tail)) {
                (_, None) => get_node(sh, child.clone(), seg_tail, rest),
                // inside the span or diverging from it: simply not present.
                (None, Some(_)) | (Some(_), Some(_)) => Ok(None),
            }
        }
    }
}

/// The result of deleting below a node.
enum Deleted {
    /// The path was absent; the subtree is untouched.
    Absent,
    /// The subtree was rebuilt; `Node::Null` means it emptied out.
    Now(Node),
}

/// Remove the leaf at `path`, returning the new root. Deleting an absent
/// path returns the root unchanged.
pub(crate) fn delete(sh: &Shared, root: Node, path: &Path) -> Result<Node> {
    check_segments(path)?;
    let (first, rest) = path.split_first();
    match delete_node(sh, root.clone(), first.bits(), rest)? {
        Deleted::Absent => Ok(root),
        Deleted::Now(new_root) => Ok(new_root),
    }
}

fn delete_node(
    sh: &Shared,
    node: Node,
    segment: &SegBits,
    rest: &[Segment],
) -> Result<Deleted> {
    let view = match node {
        Node::Disk(index) => {
            return delete_node(sh, sh.store.load_node(index)?, segment, rest)
        }
        Node::Null => return Ok(Deleted::Absent),
        Node::View(view) => view,
    };

    match view.kind() {
        ViewKind::Internal { left, right } => {
            let Some((side, tail)) = seg::cut(segment) else {
                return Err(Error::BadPath("path ends on an internal node"));
            };
            let (into, other) = match side {
                Side::Left => (left, right),
                Side::Right => (right, left),
            };
            match delete_node(sh, into.clone(), tail, rest)? {
                Deleted::Absent => Ok(Deleted::Absent),
                Deleted::Now(Node::Null) => {
                    // one side emptied: the branch disappears and the
                    // survivor moves up under its arrival bit. A surviving
                    // extender fuses with the bit; anything else keeps its
                    // original handle and is simply re-extended.
                    let side_seg = Segment::of_side(side.opposite());
                    let survivor = materialize(sh, other)?;
                    let collapsed = match survivor.as_view().map(|v| v.kind()) {
                        Some(ViewKind::Extender { segment, child }) => {
                            make_extender(side_seg.join(segment), child.clone())
                        }
                        _ => make_extender(side_seg, other.clone()),
                    };
                    Ok(Deleted::Now(collapsed))
                }
                Deleted::Now(new_child) => {
                    Ok(Deleted::Now(make_internal(new_child, other.clone(), side)))
                }
            }
        }
        ViewKind::Leaf { value_hash } => {
            if !segment.is_empty() {
                return Err(Error::BadPath("path traverses past a leaf"));
            }
            if !rest.is_empty() {
                return Err(Error::BudLeafConflict(
                    "path expects a sub-trie where a leaf is stored",
                ));
            }
            if !view.is_indexed() {
                sh.leaves.lock().decr(value_hash);
            }
            Ok(Deleted::Now(Node::Null))
        }
        ViewKind::Bud { child } => {
            if !segment.is_empty() {
                return Err(Error::BudLeafConflict(
                    "segment runs across a sub-trie boundary",
                ));
            }
            let Some((next, rest)) = rest.split_first() else {
                return Err(Error::BudLeafConflict(
                    "path ends at a sub-trie boundary",
                ));
            };
            match delete_node(sh, child.clone(), next.bits(), rest)? {
                Deleted::Absent => Ok(Deleted::Absent),
                // an empty sub-trie takes its boundary with it.
                Deleted::Now(Node::Null) => Ok(Deleted::Now(Node::Null)),
                Deleted::Now(sub) => Ok(Deleted::Now(make_bud(sub))),
            }
        }
        ViewKind::Extender {
            segment: ext,
            child,
        } => {
            let (_, seg_tail, ext_tail) = seg::common_prefix(segment, ext.bits());
            match (seg::cut(seg_tail), seg::cut(ext_tail)) {
                (_, None) => match delete_node(sh, child.clone(), seg_tail, rest)? {
                    Deleted::Absent => Ok(Deleted::Absent),
                    Deleted::Now(Node::Null) => Ok(Deleted::Now(Node::Null)),
                    Deleted::Now(new_child) => {
                        Ok(Deleted::Now(make_extender(ext.clone(), new_child)))
                    }
                },
                (None, Some(_)) | (Some(_), Some(_)) => Ok(Deleted::Absent),
            }
        }
    }
}
