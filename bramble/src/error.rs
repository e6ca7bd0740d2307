//! The public error surface.

/// Alias for results produced by this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong operating on a trie context.
///
/// Internal invariant violations (a chained extender, a null child of a
/// materialized node) are construction bugs and abort via panic; they are
/// deliberately not represented here.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The path is empty, ends on an internal node, terminates strictly
    /// inside a compressed span, or traverses past a leaf.
    #[error("bad path: {0}")]
    BadPath(&'static str),

    /// The path and the trie disagree about where a sub-trie boundary lies:
    /// a bud was found where a leaf was expected, or vice versa.
    #[error("bud/leaf conflict: {0}")]
    BudLeafConflict(&'static str),

    /// A loaded cell failed tag, length, or digest validation. Fatal for the
    /// affected edit; the context remains usable for other roots.
    #[error("corrupt cell {index}: {reason}")]
    CorruptCell {
        /// The array slot that failed validation.
        index: u64,
        /// What the validation found.
        reason: &'static str,
    },

    /// An mmap, open, truncate, or sync failure. Fatal at the context level.
    #[error("store i/o failed")]
    Io(#[from] std::io::Error),

    /// A flush needs more free cells than the array has left. The caller may
    /// grow the array and retry, or reclaim space first.
    #[error("array out of space: {needed} cells needed, {free} free")]
    OutOfSpace {
        /// Cells the flush would write.
        needed: u64,
        /// Cells available before the end of the array.
        free: u64,
    },
}
