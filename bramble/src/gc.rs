//! Stop-and-copy compaction of the cell array.
//!
//! Every root in the root table is walked and its reachable cells are copied
//! into a fresh array file in flush order, child indices rewritten through a
//! relocation map so shared subtrees are copied once. Leaf refcounts are
//! rebuilt from what the copy actually reaches, restoring the conservation
//! between live roots and the leaf store. The new generation is published
//! through the meta file; digests never change, so the root table keys are
//! stable.

use crate::error::{Error, Result};
use crate::leaf_store::LeafStore;
use crate::store::{cell, CELL_SIZE};
use crate::{HashAlgorithm, Shared};
use bramble_core::node::{CellIndex, Node, ViewKind, NIL_INDEX};
use bramble_core::Digest;
use fxhash::{FxHashMap, FxHashSet};

/// What a compaction accomplished.
#[derive(Debug, Clone, Copy)]
pub struct GcStats {
    /// Cells reachable from the root table, copied to the new array.
    pub live_cells: u64,
    /// Cells of the old array left behind.
    pub reclaimed_cells: u64,
    /// Roots retained.
    pub roots: usize,
}

pub(crate) fn gc<H: HashAlgorithm>(sh: &Shared) -> Result<GcStats> {
    let _writer = sh.writer.lock();

    let mut roots: Vec<(Digest, CellIndex)> =
        sh.roots.lock().iter().map(|(d, i)| (*d, *i)).collect();
    roots.sort_unstable_by(|a, b| a.0.cmp(&b.0));
    let old_length = sh.store.length();

    // first pass: how many cells survive.
    let mut seen = FxHashSet::default();
    let mut live_cells = 0u64;
    for (_, index) in &roots {
        if *index != NIL_INDEX {
            count_live(sh, *index, &mut seen, &mut live_cells)?;
        }
    }

    let (file, map, capacity, seqn) = sh.store.create_next_array(live_cells)?;

    // second pass: copy in flush order, rewriting child indices.
    let mut new_roots = Vec::with_capacity(roots.len());
    let new_leaves = {
        let mut copier = Copier {
            sh,
            map: &map,
            reloc: FxHashMap::default(),
            next: 0,
            leaves: LeafStore::new(),
        };
        for (digest, index) in &roots {
            let new_index = if *index == NIL_INDEX {
                NIL_INDEX
            } else {
                copier.copy(*index)?
            };
            new_roots.push((*digest, new_index));
        }
        debug_assert_eq!(copier.next, live_cells);
        copier.leaves
    };
    if live_cells > 0 {
        map.sync(0, live_cells as usize * CELL_SIZE)?;
    }

    {
        let mut leaves = sh.leaves.lock();
        *leaves = new_leaves;
        sh.store
            .install_array::<H>(file, map, capacity, live_cells, seqn, new_roots.clone(), &leaves)?;
    }
    *sh.roots.lock() = new_roots.into_iter().collect();

    let stats = GcStats {
        live_cells,
        reclaimed_cells: old_length - live_cells,
        roots: roots.len(),
    };
    tracing::info!(
        live = stats.live_cells,
        reclaimed = stats.reclaimed_cells,
        roots = stats.roots,
        "compacted cell array"
    );
    Ok(stats)
}

fn count_live(
    sh: &Shared,
    index: CellIndex,
    seen: &mut FxHashSet<CellIndex>,
    live: &mut u64,
) -> Result<()> {
    if !seen.insert(index) {
        return Ok(());
    }
    let node = sh.store.load_node(index)?;
    let Some(view) = node.as_view() else {
        unreachable!("loaded nodes are views");
    };
    match view.kind() {
        ViewKind::Internal { left, right } => {
            *live += 1;
            count_live(sh, disk_index(left), seen, live)?;
            count_live(sh, disk_index(right), seen, live)?;
        }
        ViewKind::Extender { child, .. } | ViewKind::Bud { child } => {
            *live += 1;
            count_live(sh, disk_index(child), seen, live)?;
        }
        ViewKind::Leaf { .. } => *live += 2,
    }
    Ok(())
}

fn disk_index(node: &Node) -> CellIndex {
    match node {
        Node::Disk(index) => *index,
        _ => unreachable!("children of loaded nodes are disk references"),
    }
}

struct Copier<'a> {
    sh: &'a Shared,
    map: &'a crate::store::mmap::Mmap,
    reloc: FxHashMap<CellIndex, CellIndex>,
    next: CellIndex,
    leaves: LeafStore,
}

impl<'a> Copier<'a> {
    fn copy(&mut self, old_index: CellIndex) -> Result<CellIndex> {
        if let Some(&new_index) = self.reloc.get(&old_index) {
            return Ok(new_index);
        }
        let node = self.sh.store.load_node(old_index)?;
        let view = node.as_view().expect("loaded nodes are views");
        let digest = *view.cached_digest().expect("loaded nodes carry their digest");

        let new_index = match view.kind() {
            ViewKind::Internal { left, right } => {
                let old_left = disk_index(left);
                let new_right = self.copy(disk_index(right))?;
                // the left child keeps the adjacent slot, unless a shared
                // subtree already placed it elsewhere.
                let left_shared = self.reloc.contains_key(&old_left);
                let new_left = self.copy(old_left)?;
                let left_slot = if left_shared { Some(new_left) } else { None };
                self.write(&cell::encode_internal(left_slot, Some(new_right), &digest))
            }
            ViewKind::Extender { segment, child } => {
                let new_child = self.copy(disk_index(child))?;
                self.write(&cell::encode_extender(segment, new_child, &digest))
            }
            ViewKind::Bud { child } => {
                let new_child = self.copy(disk_index(child))?;
                self.write(&cell::encode_bud(new_child, &digest))
            }
            ViewKind::Leaf { value_hash } => {
                self.adopt_leaf(old_index, value_hash)?;
                let (payload, ext) = cell::encode_leaf(&digest, value_hash);
                let index = self.write(&payload);
                self.write(&ext);
                index
            }
        };

        self.reloc.insert(old_index, new_index);
        Ok(new_index)
    }

    /// Credit one reachable reference to `value_hash` in the rebuilt store.
    fn adopt_leaf(&mut self, old_index: CellIndex, value_hash: &Digest) -> Result<()> {
        if self.leaves.incr(value_hash) {
            return Ok(());
        }
        let value = self
            .sh
            .leaves
            .lock()
            .get(value_hash)
            .map(<[u8]>::to_vec)
            .ok_or(Error::CorruptCell {
                index: old_index,
                reason: "leaf value missing from the leaf store",
            })?;
        self.leaves.adopt(*value_hash, value);
        Ok(())
    }

    fn write(&mut self, cell: &cell::Cell) -> CellIndex {
        let index = self.next;
        self.map.write(index as usize * CELL_SIZE, cell);
        self.next += 1;
        index
    }
}
