#![warn(missing_docs)]

//! A persistent, authenticated binary Patricia trie.
//!
//! Keys are bit-strings decomposed into segments separated by sub-trie
//! boundaries; values are opaque byte blobs held in a content-addressed,
//! reference-counted leaf store. Edits are functional: they return a fresh
//! root and structurally share everything off the edited path, so old roots
//! keep working. Roots are persisted on demand into an append-only,
//! memory-mapped array of fixed-size cells, and a stop-and-copy compaction
//! reclaims cells no retained root can reach.
//!
//! ```no_run
//! use bramble::{Blake3Hasher, Context, Options, Path};
//!
//! # fn main() -> bramble::Result<()> {
//! let mut options = Options::new();
//! options.path("example_db");
//! let context = Context::<Blake3Hasher>::open(&options)?;
//!
//! let path = Path::from_key(b"account/42").unwrap();
//! let root = context.upsert(Context::<Blake3Hasher>::empty_root(), &path, b"balance")?;
//! let (root, digest) = context.commit(root)?;
//! assert_eq!(context.get(&root, &path)?.as_deref(), Some(&b"balance"[..]));
//! # let _ = digest;
//! # Ok(())
//! # }
//! ```
//!
//! A context is single-writer: edits build in memory, [`Context::commit`]
//! appends under an internal writer lock, and readers traversing committed
//! roots run concurrently with appends. [`Context::gc`] relocates cells;
//! `Disk` handles taken before it must be re-resolved through
//! [`Context::root`] (digests are stable, indices are not).

use bramble_core::hasher::{TrieHasher, ValueHasher};
use bramble_core::node;
use fxhash::FxHashMap;
use parking_lot::Mutex;
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::Arc;

mod commit;
mod edit;
mod error;
mod gc;
mod leaf_store;
mod store;

pub use bramble_core::hasher;
pub use bramble_core::node::{CellIndex, Node, ViewKind, NIL_INDEX};
pub use bramble_core::path::Path;
pub use bramble_core::seg::{Segment, Side};
pub use bramble_core::{Digest, EMPTY_DIGEST};
pub use error::{Error, Result};
pub use gc::GcStats;
pub use store::{CELL_SIZE, MAX_SEGMENT_BITS};

#[cfg(feature = "blake3-hasher")]
pub use bramble_core::hasher::Blake3Hasher;
#[cfg(feature = "sha2-hasher")]
pub use bramble_core::hasher::Sha2Hasher;

use leaf_store::LeafStore;
use store::Store;

/// A full hash algorithm: node hashing plus value hashing.
pub trait HashAlgorithm: TrieHasher + ValueHasher + Send + Sync + 'static {}
impl<T: TrieHasher + ValueHasher + Send + Sync + 'static> HashAlgorithm for T {}

/// Options when opening a [`Context`].
pub struct Options {
    pub(crate) path: PathBuf,
    pub(crate) capacity: u64,
}

impl Options {
    /// Create a new `Options` instance with the default values.
    pub fn new() -> Self {
        Options {
            path: PathBuf::from("bramble_db"),
            capacity: 1 << 16,
        }
    }

    /// Set the path to the directory where the trie is stored.
    pub fn path(&mut self, path: impl Into<PathBuf>) {
        self.path = path.into();
    }

    /// Set the cell capacity of a freshly created array file.
    ///
    /// Ignored when opening an existing store; the array keeps its size.
    /// May be rounded up to the allocation chunk.
    pub fn capacity(&mut self, cells: u64) {
        self.capacity = cells;
    }
}

impl Default for Options {
    fn default() -> Self {
        Options::new()
    }
}

pub(crate) struct Shared {
    pub(crate) store: Store,
    pub(crate) leaves: Mutex<LeafStore>,
    pub(crate) roots: Mutex<FxHashMap<Digest, CellIndex>>,
    /// Serializes commit, compaction, grow, and root-table writes. Edits and
    /// reads never take it.
    pub(crate) writer: Mutex<()>,
}

/// A handle to an open trie store. Cheap to clone; all clones share one
/// underlying context.
pub struct Context<H: HashAlgorithm> {
    shared: Arc<Shared>,
    _marker: PhantomData<fn() -> H>,
}

impl<H: HashAlgorithm> Clone for Context<H> {
    fn clone(&self) -> Self {
        Context {
            shared: self.shared.clone(),
            _marker: PhantomData,
        }
    }
}

impl<H: HashAlgorithm> Context<H> {
    /// Open the store with the provided `Options`, creating it on first use.
    pub fn open(options: &Options) -> Result<Self> {
        let (store, roots, leaves) = Store::open::<H>(&options.path, options.capacity)?;
        Ok(Context {
            shared: Arc::new(Shared {
                store,
                leaves: Mutex::new(leaves),
                roots: Mutex::new(roots.into_iter().collect()),
                writer: Mutex::new(()),
            }),
            _marker: PhantomData,
        })
    }

    /// The root of an empty trie.
    pub fn empty_root() -> Node {
        Node::Null
    }

    /// Return a root identical to `root` except that `path` now leads to a
    /// leaf containing `value`. Any prior leaf at that path is overwritten.
    pub fn upsert(&self, root: Node, path: &Path, value: &[u8]) -> Result<Node> {
        let new_root = edit::upsert::<H>(&self.shared, root, path, value)?;
        #[cfg(debug_assertions)]
        node::check_view_invariants(&new_root);
        Ok(new_root)
    }

    /// Look up the value at `path` under `root`. Does not mutate.
    pub fn get(&self, root: &Node, path: &Path) -> Result<Option<Vec<u8>>> {
        edit::get(&self.shared, root, path)
    }

    /// Return a root with the leaf at `path` removed, collapsing any
    /// branches left with a single child. Deleting an absent path returns
    /// the root unchanged.
    pub fn delete(&self, root: Node, path: &Path) -> Result<Node> {
        let new_root = edit::delete(&self.shared, root, path)?;
        #[cfg(debug_assertions)]
        node::check_view_invariants(&new_root);
        Ok(new_root)
    }

    /// Flush every dirty node under `root` to the array and record the root
    /// in the root table. Returns the indexed root and its digest.
    pub fn commit(&self, root: Node) -> Result<(Node, Digest)> {
        commit::commit::<H>(&self.shared, root)
    }

    /// Copy everything reachable from the root table into a fresh array,
    /// dropping the rest. Digests are stable across compaction; previously
    /// obtained `Disk` handles are not and must be re-resolved via
    /// [`Context::root`]. Uncommitted roots from before the compaction are
    /// invalidated with them: their cells and leaf references are not
    /// considered reachable.
    pub fn gc(&self) -> Result<GcStats> {
        gc::gc::<H>(&self.shared)
    }

    /// Compute the digest of a subtree without flushing it.
    pub fn hash(&self, node: &Node) -> Result<Digest> {
        commit::node_digest::<H>(&self.shared, node)
    }

    /// Resolve a retained root by digest.
    pub fn root(&self, digest: &Digest) -> Option<Node> {
        let roots = self.shared.roots.lock();
        match roots.get(digest) {
            Some(&NIL_INDEX) => Some(Node::Null),
            Some(&index) => Some(Node::Disk(index)),
            None => None,
        }
    }

    /// All retained roots as `(digest, cell index)` pairs.
    pub fn roots(&self) -> Vec<(Digest, CellIndex)> {
        self.shared.roots.lock().iter().map(|(d, i)| (*d, *i)).collect()
    }

    /// Drop a root from the root table so the next [`Context::gc`] may
    /// reclaim cells only it could reach. Returns whether it was present.
    pub fn forget_root(&self, digest: &Digest) -> Result<bool> {
        let _writer = self.shared.writer.lock();
        let removed = self.shared.roots.lock().remove(digest).is_some();
        if removed {
            commit::persist::<H>(&self.shared)?;
        }
        Ok(removed)
    }

    /// Extend the array file by at least `additional` cells. The usual
    /// answer to [`Error::OutOfSpace`].
    pub fn grow(&self, additional: u64) -> Result<()> {
        let _writer = self.shared.writer.lock();
        self.shared.store.grow(additional)
    }

    /// Materialize one level of a `Disk` reference; other handles are
    /// returned as-is.
    pub fn materialize(&self, node: &Node) -> Result<Node> {
        match node {
            Node::Disk(index) => self.shared.store.load_node(*index),
            other => Ok(other.clone()),
        }
    }

    /// Committed cells in the array.
    pub fn cells(&self) -> u64 {
        self.shared.store.length()
    }

    /// Total cells the array file can hold.
    pub fn capacity(&self) -> u64 {
        self.shared.store.capacity()
    }

    /// The refcount the leaf store records for `digest`; zero when absent.
    /// Diagnostic surface for the conservation between roots and values.
    pub fn leaf_refcount(&self, digest: &Digest) -> u64 {
        self.shared.leaves.lock().refcount(digest)
    }

    /// The number of distinct values in the leaf store.
    pub fn leaf_count(&self) -> usize {
        self.shared.leaves.lock().len()
    }

    /// Hash a value the way the leaf store keys it.
    pub fn value_hash(value: &[u8]) -> Digest {
        H::hash_value(value)
    }
}

/// A context plus a current root: the working handle for a single trie.
pub struct Tree<H: HashAlgorithm> {
    context: Context<H>,
    root: Node,
}

impl<H: HashAlgorithm> Tree<H> {
    /// An empty tree over `context`.
    pub fn new(context: Context<H>) -> Self {
        Tree {
            context,
            root: Node::Null,
        }
    }

    /// A tree over an existing root.
    pub fn with_root(context: Context<H>, root: Node) -> Self {
        Tree { context, root }
    }

    /// The current root handle.
    pub fn root(&self) -> &Node {
        &self.root
    }

    /// The underlying context.
    pub fn context(&self) -> &Context<H> {
        &self.context
    }

    /// Insert or overwrite the value at `path`.
    pub fn upsert(&mut self, path: &Path, value: &[u8]) -> Result<()> {
        self.root = self.context.upsert(self.root.clone(), path, value)?;
        Ok(())
    }

    /// Look up the value at `path`.
    pub fn get(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        self.context.get(&self.root, path)
    }

    /// Remove the leaf at `path`.
    pub fn delete(&mut self, path: &Path) -> Result<()> {
        self.root = self.context.delete(self.root.clone(), path)?;
        Ok(())
    }

    /// Flush the tree and return its digest; the root handle becomes
    /// indexed.
    pub fn commit(&mut self) -> Result<Digest> {
        let (root, digest) = self.context.commit(self.root.clone())?;
        self.root = root;
        Ok(digest)
    }

    /// The digest of the current root, computed without flushing.
    pub fn digest(&self) -> Result<Digest> {
        self.context.hash(&self.root)
    }
}
