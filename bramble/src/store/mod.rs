//! The storage layer: an append-only, memory-mapped array of fixed-size
//! cells plus the meta and leaf files published alongside it.
//!
//! The store is a directory: `cells-<seqn>` (the array), `meta` (header and
//! root table), `leaves` (the leaf store image), and `.lock`. Commits append
//! cells, sync them, and only then replace `meta`; compaction writes a whole
//! new `cells-<seqn+1>` and flips to it through the same meta publication,
//! so every crash lands on a consistent generation.

use crate::error::{Error, Result};
use crate::leaf_store::LeafStore;
use bramble_core::hasher::ValueHasher;
use bramble_core::node::{self, CellIndex, Node, ViewKind, NIL_INDEX};
use bramble_core::{Digest, EMPTY_DIGEST};
use parking_lot::RwLock;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

pub mod cell;
mod flock;
mod meta;
pub(crate) mod mmap;

pub use cell::{CELL_SIZE, MAX_SEGMENT_BITS};
pub use meta::Meta;

use cell::{Cell, ChildRef, DiskNode};
use flock::DirLock;
use mmap::Mmap;

const META_FILENAME: &str = "meta";
const LEAVES_FILENAME: &str = "leaves";

/// Cell counts are rounded up to this when sizing a fresh array file.
pub const GROWTH_CHUNK_CELLS: u64 = 1024;

fn cells_filename(seqn: u64) -> String {
    format!("cells-{:010}", seqn)
}

struct Array {
    file: File,
    map: Mmap,
    capacity: u64,
}

/// The mmapped cell array and its publication state.
pub(crate) struct Store {
    dir: PathBuf,
    array: RwLock<Array>,
    /// Committed cells. Published with release ordering after their bytes
    /// are written; readers never look past it.
    length: AtomicU64,
    /// Generation of the current array file.
    seqn: AtomicU64,
    _lock: DirLock,
}

impl Store {
    /// Open the store directory, creating it if missing, and read back the
    /// root table and leaf store.
    pub fn open<H: ValueHasher>(
        path: &Path,
        capacity: u64,
    ) -> Result<(Self, Vec<(Digest, CellIndex)>, LeafStore)> {
        if !path.exists() {
            create::<H>(path, capacity)?;
        }
        let lock = DirLock::lock(path)?;

        let meta_bytes = fs::read(path.join(META_FILENAME))?;
        let meta = Meta::decode::<H>(&meta_bytes)?;

        let cells_path = path.join(cells_filename(meta.array_seqn));
        let file = OpenOptions::new().read(true).write(true).open(&cells_path)?;
        let file_len = file.metadata()?.len();
        if file_len == 0 || file_len % CELL_SIZE as u64 != 0 {
            return Err(Error::CorruptCell {
                index: 0,
                reason: "array file length is not a multiple of the cell size",
            });
        }
        let capacity = file_len / CELL_SIZE as u64;
        if meta.length > capacity {
            return Err(Error::CorruptCell {
                index: meta.length,
                reason: "committed length exceeds the array file",
            });
        }
        let map = Mmap::map_file(&file, file_len as usize)?;

        remove_stale_arrays(path, meta.array_seqn);

        let leaves = LeafStore::decode::<H>(&fs::read(path.join(LEAVES_FILENAME))?)?;

        let store = Store {
            dir: path.to_path_buf(),
            array: RwLock::new(Array {
                file,
                map,
                capacity,
            }),
            length: AtomicU64::new(meta.length),
            seqn: AtomicU64::new(meta.array_seqn),
            _lock: lock,
        };

        for (digest, index) in &meta.roots {
            store.check_root(digest, *index)?;
        }

        tracing::debug!(
            path = %path.display(),
            cells = meta.length,
            roots = meta.roots.len(),
            "opened trie store"
        );
        Ok((store, meta.roots, leaves))
    }

    fn check_root(&self, digest: &Digest, index: CellIndex) -> Result<()> {
        if index == NIL_INDEX {
            if digest != &EMPTY_DIGEST {
                return Err(Error::CorruptCell {
                    index: 0,
                    reason: "nil root entry with a non-empty digest",
                });
            }
            return Ok(());
        }
        if index >= self.length() {
            return Err(Error::CorruptCell {
                index,
                reason: "root entry past the committed length",
            });
        }
        if self.node_digest(index)? != *digest {
            return Err(Error::CorruptCell {
                index,
                reason: "root entry digest does not match its cell",
            });
        }
        Ok(())
    }

    /// Committed cells.
    pub fn length(&self) -> u64 {
        self.length.load(Ordering::Acquire)
    }

    /// Total cells the array file can hold.
    pub fn capacity(&self) -> u64 {
        self.array.read().capacity
    }

    /// Read the committed cell at `index`.
    pub fn read_cell(&self, index: CellIndex) -> Result<Cell> {
        if index >= self.length() {
            return Err(Error::CorruptCell {
                index,
                reason: "reference past the committed length",
            });
        }
        let array = self.array.read();
        let mut cell = [0u8; CELL_SIZE];
        array.map.read(index as usize * CELL_SIZE, &mut cell);
        Ok(cell)
    }

    /// Write a not-yet-committed cell. Only the single writer calls this,
    /// with `index` at or past the committed length and below capacity.
    pub fn write_cell(&self, index: CellIndex, cell: &Cell) {
        debug_assert!(index >= self.length());
        let array = self.array.read();
        debug_assert!(index < array.capacity);
        array.map.write(index as usize * CELL_SIZE, cell);
    }

    /// Flush the cell range `from..to` to disk.
    pub fn sync_cells(&self, from: CellIndex, to: CellIndex) -> Result<()> {
        if from == to {
            return Ok(());
        }
        let array = self.array.read();
        array
            .map
            .sync(from as usize * CELL_SIZE, (to - from) as usize * CELL_SIZE)
    }

    /// Publish a new committed length. Bytes for every cell below it must
    /// already be written.
    pub fn publish_length(&self, length: u64) {
        debug_assert!(length >= self.length());
        self.length.store(length, Ordering::Release);
    }

    /// Extend the array file by `additional` cells and remap.
    pub fn grow(&self, additional: u64) -> Result<()> {
        let mut array = self.array.write();
        let new_capacity = array.capacity + additional.max(GROWTH_CHUNK_CELLS);
        array.file.set_len(new_capacity * CELL_SIZE as u64)?;
        array.map = Mmap::map_file(&array.file, (new_capacity * CELL_SIZE as u64) as usize)?;
        array.capacity = new_capacity;
        tracing::debug!(capacity = new_capacity, "grew cell array");
        Ok(())
    }

    /// Materialize the node at `index`. Children stay as `Disk` references;
    /// the view carries the digest stored in its cell.
    pub fn load_node(&self, index: CellIndex) -> Result<Node> {
        let cell = self.read_cell(index)?;
        let decoded = cell::decode(&cell, index)?;
        let (kind, digest) = match decoded {
            DiskNode::Internal { left, right, digest } => {
                let left = self.resolve_child(index, left)?;
                let right = self.resolve_child(index, right)?;
                return Ok(node::from_disk(
                    ViewKind::Internal {
                        left: Node::Disk(left),
                        right: Node::Disk(right),
                    },
                    digest,
                ));
            }
            DiskNode::Extender {
                segment,
                child,
                digest,
            } => (
                ViewKind::Extender {
                    segment,
                    child: Node::Disk(child),
                },
                digest,
            ),
            DiskNode::Bud { child, digest } => (
                ViewKind::Bud {
                    child: Node::Disk(child),
                },
                digest,
            ),
            DiskNode::Leaf { digest, value_hash } => {
                let ext = self.read_cell(index + 1)?;
                if !cell::is_leaf_ext(&ext) {
                    return Err(Error::CorruptCell {
                        index: index + 1,
                        reason: "leaf payload not followed by its extension cell",
                    });
                }
                (ViewKind::Leaf { value_hash }, digest)
            }
        };
        Ok(node::from_disk(kind, digest))
    }

    fn resolve_child(&self, parent: CellIndex, child: ChildRef) -> Result<CellIndex> {
        match child {
            ChildRef::Index(i) => Ok(i),
            ChildRef::Adjacent => {
                if parent == 0 {
                    return Err(Error::CorruptCell {
                        index: parent,
                        reason: "adjacent child of the first cell",
                    });
                }
                let prev = self.read_cell(parent - 1)?;
                if cell::is_leaf_ext(&prev) {
                    if parent == 1 {
                        return Err(Error::CorruptCell {
                            index: parent,
                            reason: "adjacent leaf child of the second cell",
                        });
                    }
                    Ok(parent - 2)
                } else {
                    Ok(parent - 1)
                }
            }
        }
    }

    /// The digest stored in the cell at `index`.
    pub fn node_digest(&self, index: CellIndex) -> Result<Digest> {
        let cell = self.read_cell(index)?;
        match cell::decode(&cell, index)? {
            DiskNode::Internal { digest, .. }
            | DiskNode::Extender { digest, .. }
            | DiskNode::Bud { digest, .. }
            | DiskNode::Leaf { digest, .. } => Ok(digest),
        }
    }

    /// Atomically publish the meta file for the current generation.
    pub fn write_meta<H: ValueHasher>(&self, roots: Vec<(Digest, CellIndex)>) -> Result<()> {
        let meta = Meta {
            array_seqn: self.seqn.load(Ordering::Acquire),
            length: self.length(),
            roots,
        };
        write_file_atomic(&self.dir, META_FILENAME, &meta.encode::<H>())
    }

    /// Atomically publish the leaf store image.
    pub fn write_leaves<H: ValueHasher>(&self, leaves: &LeafStore) -> Result<()> {
        write_file_atomic(&self.dir, LEAVES_FILENAME, &leaves.encode::<H>())
    }

    /// The store directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The generation of the current array file.
    pub fn array_seqn(&self) -> u64 {
        self.seqn.load(Ordering::Acquire)
    }

    /// Create the next generation's array file, sized for `cells` cells.
    pub fn create_next_array(&self, cells: u64) -> Result<(File, Mmap, u64, u64)> {
        let seqn = self.array_seqn() + 1;
        let capacity = cells
            .max(1)
            .div_ceil(GROWTH_CHUNK_CELLS)
            * GROWTH_CHUNK_CELLS;
        let path = self.dir.join(cells_filename(seqn));
        // a compaction that failed before publication may have left this
        // generation behind; start it over.
        let _ = fs::remove_file(&path);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        file.set_len(capacity * CELL_SIZE as u64)?;
        let map = Mmap::map_file(&file, (capacity * CELL_SIZE as u64) as usize)?;
        Ok((file, map, capacity, seqn))
    }

    /// Swap in a fully written next-generation array and publish it. The old
    /// mapping is dropped once no reader holds it; the old file is removed
    /// after publication.
    pub fn install_array<H: ValueHasher>(
        &self,
        file: File,
        map: Mmap,
        capacity: u64,
        length: u64,
        seqn: u64,
        roots: Vec<(Digest, CellIndex)>,
        leaves: &LeafStore,
    ) -> Result<()> {
        let old_seqn = self.array_seqn();
        {
            let mut array = self.array.write();
            *array = Array {
                file,
                map,
                capacity,
            };
            self.length.store(length, Ordering::Release);
            self.seqn.store(seqn, Ordering::Release);
        }
        self.write_leaves::<H>(leaves)?;
        self.write_meta::<H>(roots)?;
        if let Err(e) = fs::remove_file(self.dir.join(cells_filename(old_seqn))) {
            tracing::warn!("failed to remove old array file: {e}");
        }
        Ok(())
    }
}

/// Lay out a fresh store directory: a zeroed array file, an empty leaf
/// image, and a meta file publishing generation zero.
fn create<H: ValueHasher>(path: &Path, capacity: u64) -> Result<()> {
    fs::create_dir_all(path)?;

    let capacity = capacity.max(GROWTH_CHUNK_CELLS);
    let cells_file = OpenOptions::new()
        .write(true)
        .create(true)
        .open(path.join(cells_filename(0)))?;
    cells_file.set_len(capacity * CELL_SIZE as u64)?;
    cells_file.sync_all()?;
    drop(cells_file);

    write_file_atomic(path, LEAVES_FILENAME, &LeafStore::new().encode::<H>())?;
    let meta = Meta {
        array_seqn: 0,
        length: 0,
        roots: Vec::new(),
    };
    write_file_atomic(path, META_FILENAME, &meta.encode::<H>())?;

    tracing::info!(path = %path.display(), capacity, "created trie store");
    Ok(())
}

/// Write `bytes` to `dir/name` via a temp file, rename, and directory sync.
fn write_file_atomic(dir: &Path, name: &str, bytes: &[u8]) -> Result<()> {
    let tmp = dir.join(format!("{name}.tmp"));
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        use std::io::Write as _;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, dir.join(name))?;
    File::open(dir)?.sync_all()?;
    Ok(())
}

/// A crash between array publication and old-file removal leaves a stale
/// generation behind; sweep it on open.
fn remove_stale_arrays(dir: &Path, current_seqn: u64) {
    let keep = cells_filename(current_seqn);
    let Ok(entries) = fs::read_dir(dir) else { return };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.starts_with("cells-") && name != keep {
            tracing::warn!(file = name, "removing stale array generation");
            let _ = fs::remove_file(entry.path());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bramble_core::hasher::Blake3Hasher;

    fn temp_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store");
        let (store, roots, leaves) = Store::open::<Blake3Hasher>(&path, 64).unwrap();
        assert!(roots.is_empty());
        assert!(leaves.is_empty());
        (dir, store)
    }

    #[test]
    fn create_then_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store");
        {
            let (store, _, _) = Store::open::<Blake3Hasher>(&path, 64).unwrap();
            assert_eq!(store.length(), 0);
            assert_eq!(store.capacity(), GROWTH_CHUNK_CELLS);
        }
        let (store, _, _) = Store::open::<Blake3Hasher>(&path, 64).unwrap();
        assert_eq!(store.length(), 0);
    }

    #[test]
    fn second_open_is_locked_out() {
        let (_dir, store) = temp_store();
        let err = Store::open::<Blake3Hasher>(store.dir(), 64);
        assert!(err.is_err());
    }

    #[test]
    fn append_publish_read_back() {
        let (_dir, store) = temp_store();
        let cell = cell::encode_bud(0, &[3; 32]);
        store.write_cell(0, &cell);
        store.write_cell(1, &cell);
        store.sync_cells(0, 2).unwrap();
        store.publish_length(2);

        // cell 1's child reference (0) is below it, so it decodes.
        let digest = store.node_digest(1).unwrap();
        assert_eq!(digest, [3; 32]);
        // reads past the committed length fail.
        assert!(store.read_cell(2).is_err());
    }

    #[test]
    fn grow_extends_capacity() {
        let (_dir, store) = temp_store();
        let before = store.capacity();
        store.grow(1).unwrap();
        assert!(store.capacity() > before);
    }
}
