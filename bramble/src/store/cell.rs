//! The on-disk cell encoding.
//!
//! The array is a contiguous run of fixed-size cells; a 64-bit index locates
//! a cell. A single tag byte discriminates the variant and, for internal
//! nodes, records which child was written immediately before its parent.
//!
//! Layout, by variant (all integers little-endian):
//!
//! ```text
//! offset    0     2..4      8..16      16..24    24..56     56..88   56..96
//! internal  tag   -         left       right     digest     -        -
//! extender  tag   bit len   child      -         digest     -        segment
//! bud       tag   -         child      -         digest     -        -
//! leaf      tag   -         -          -         digest     value    -
//! leaf ext  tag   reserved for leaf metadata
//! ```
//!
//! A leaf occupies two cells: the payload cell above, then a `leaf ext` cell
//! whose tag is what lets a reader resolving an adjacent child at `p - 1`
//! recognize a two-cell leaf and step back to `p - 2`. Children are always
//! written before their parents, so a child index is strictly below its
//! parent's.

use crate::error::{Error, Result};
use bramble_core::node::CellIndex;
use bramble_core::seg::Segment;
use bramble_core::Digest;

/// The uniform cell size in bytes.
pub const CELL_SIZE: usize = 96;

/// A raw cell.
pub type Cell = [u8; CELL_SIZE];

const SEG_OFF: usize = 56;

/// The widest segment one extender cell can hold.
pub const MAX_SEGMENT_BITS: usize = (CELL_SIZE - SEG_OFF) * 8;

const TAG_INTERNAL: u8 = 1;
const TAG_EXTENDER: u8 = 2;
const TAG_BUD: u8 = 3;
const TAG_LEAF: u8 = 4;
const TAG_LEAF_EXT: u8 = 5;

const TAG_MASK: u8 = 0x0f;
const FLAG_ADJ_LEFT: u8 = 0x10;
const FLAG_ADJ_RIGHT: u8 = 0x20;

/// A child slot of an internal cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildRef {
    /// The child's index is stored explicitly.
    Index(CellIndex),
    /// The child was written immediately before this cell; its index is
    /// elided and recovered from the preceding cell's tag.
    Adjacent,
}

/// A decoded cell, children still by reference.
#[derive(Debug)]
pub enum DiskNode {
    /// A branch cell.
    Internal {
        /// Left child slot.
        left: ChildRef,
        /// Right child slot.
        right: ChildRef,
        /// Node digest.
        digest: Digest,
    },
    /// A compressed span cell.
    Extender {
        /// The compressed fragment.
        segment: Segment,
        /// Child index.
        child: CellIndex,
        /// Node digest.
        digest: Digest,
    },
    /// A sub-trie boundary cell.
    Bud {
        /// Child index.
        child: CellIndex,
        /// Node digest.
        digest: Digest,
    },
    /// A leaf payload cell.
    Leaf {
        /// Node digest.
        digest: Digest,
        /// Digest of the stored value; the leaf-store key.
        value_hash: Digest,
    },
}

/// Whether the tag byte marks a leaf extension cell.
pub fn is_leaf_ext(cell: &Cell) -> bool {
    cell[0] & TAG_MASK == TAG_LEAF_EXT
}

/// Encode an internal cell. `None` for a child elides its index and sets
/// the corresponding adjacency flag; at most one side may be elided.
pub fn encode_internal(left: Option<CellIndex>, right: Option<CellIndex>, digest: &Digest) -> Cell {
    debug_assert!(left.is_some() || right.is_some(), "at most one child may be elided");
    let mut cell = [0u8; CELL_SIZE];
    let mut tag = TAG_INTERNAL;
    match left {
        Some(i) => cell[8..16].copy_from_slice(&i.to_le_bytes()),
        None => tag |= FLAG_ADJ_LEFT,
    }
    match right {
        Some(i) => cell[16..24].copy_from_slice(&i.to_le_bytes()),
        None => tag |= FLAG_ADJ_RIGHT,
    }
    cell[0] = tag;
    cell[24..56].copy_from_slice(digest);
    cell
}

/// Encode an extender cell. Panics if the segment is empty or too wide for
/// one cell; the edit engine bounds segments before they get here.
pub fn encode_extender(segment: &Segment, child: CellIndex, digest: &Digest) -> Cell {
    assert!(!segment.is_empty() && segment.len() <= MAX_SEGMENT_BITS);
    let mut cell = [0u8; CELL_SIZE];
    cell[0] = TAG_EXTENDER;
    cell[2..4].copy_from_slice(&(segment.len() as u16).to_le_bytes());
    cell[8..16].copy_from_slice(&child.to_le_bytes());
    cell[24..56].copy_from_slice(digest);
    segment.copy_to_bytes(&mut cell[SEG_OFF..]);
    cell
}

/// Encode a bud cell.
pub fn encode_bud(child: CellIndex, digest: &Digest) -> Cell {
    let mut cell = [0u8; CELL_SIZE];
    cell[0] = TAG_BUD;
    cell[8..16].copy_from_slice(&child.to_le_bytes());
    cell[24..56].copy_from_slice(digest);
    cell
}

/// Encode the two cells of a leaf.
pub fn encode_leaf(digest: &Digest, value_hash: &Digest) -> (Cell, Cell) {
    let mut payload = [0u8; CELL_SIZE];
    payload[0] = TAG_LEAF;
    payload[24..56].copy_from_slice(digest);
    payload[56..88].copy_from_slice(value_hash);

    let mut ext = [0u8; CELL_SIZE];
    ext[0] = TAG_LEAF_EXT;
    (payload, ext)
}

/// Decode the cell at `index`, validating tag, child bounds, and segment
/// shape. Adjacent child slots are left for the caller to resolve against
/// the preceding cell.
pub fn decode(cell: &Cell, index: CellIndex) -> Result<DiskNode> {
    let corrupt = |reason| Error::CorruptCell { index, reason };
    let tag = cell[0] & TAG_MASK;
    let flags = cell[0] & !TAG_MASK;
    if tag != TAG_INTERNAL && flags != 0 {
        return Err(corrupt("adjacency flags on a non-internal cell"));
    }

    let digest: Digest = cell[24..56].try_into().expect("32 bytes");
    let child_at = |range: std::ops::Range<usize>| -> Result<CellIndex> {
        let child = u64::from_le_bytes(cell[range].try_into().expect("8 bytes"));
        if child >= index {
            return Err(corrupt("child index at or above parent"));
        }
        Ok(child)
    };

    match tag {
        TAG_INTERNAL => {
            if flags == FLAG_ADJ_LEFT | FLAG_ADJ_RIGHT {
                return Err(corrupt("both children marked adjacent"));
            }
            let left = if flags & FLAG_ADJ_LEFT != 0 {
                ChildRef::Adjacent
            } else {
                ChildRef::Index(child_at(8..16)?)
            };
            let right = if flags & FLAG_ADJ_RIGHT != 0 {
                ChildRef::Adjacent
            } else {
                ChildRef::Index(child_at(16..24)?)
            };
            Ok(DiskNode::Internal { left, right, digest })
        }
        TAG_EXTENDER => {
            let bit_len = u16::from_le_bytes(cell[2..4].try_into().expect("2 bytes")) as usize;
            if bit_len == 0 || bit_len > MAX_SEGMENT_BITS {
                return Err(corrupt("extender segment length out of range"));
            }
            let segment = Segment::from_raw(&cell[SEG_OFF..], bit_len)
                .expect("length checked against cell capacity");
            // padding must be canonical or digests would not be reproducible.
            let mut canonical = [0u8; CELL_SIZE - SEG_OFF];
            segment.copy_to_bytes(&mut canonical);
            if canonical[..] != cell[SEG_OFF..] {
                return Err(corrupt("extender segment padding not zeroed"));
            }
            Ok(DiskNode::Extender {
                segment,
                child: child_at(8..16)?,
                digest,
            })
        }
        TAG_BUD => Ok(DiskNode::Bud {
            child: child_at(8..16)?,
            digest,
        }),
        TAG_LEAF => Ok(DiskNode::Leaf {
            digest,
            value_hash: cell[56..88].try_into().expect("32 bytes"),
        }),
        TAG_LEAF_EXT => Err(corrupt("node reference into a leaf extension cell")),
        _ => Err(corrupt("unknown cell tag")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bramble_core::seg::Side;

    fn seg(s: &str) -> Segment {
        Segment::from_sides(s.chars().map(|c| match c {
            'L' => Side::Left,
            _ => Side::Right,
        }))
    }

    #[test]
    fn internal_round_trip() {
        let cell = encode_internal(Some(3), None, &[7; 32]);
        match decode(&cell, 10).unwrap() {
            DiskNode::Internal { left, right, digest } => {
                assert_eq!(left, ChildRef::Index(3));
                assert_eq!(right, ChildRef::Adjacent);
                assert_eq!(digest, [7; 32]);
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn extender_round_trip() {
        let s = seg("LRRLLLR");
        let cell = encode_extender(&s, 5, &[9; 32]);
        match decode(&cell, 6).unwrap() {
            DiskNode::Extender { segment, child, digest } => {
                assert_eq!(segment, s);
                assert_eq!(child, 5);
                assert_eq!(digest, [9; 32]);
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn leaf_round_trip() {
        let (payload, ext) = encode_leaf(&[1; 32], &[2; 32]);
        assert!(is_leaf_ext(&ext));
        match decode(&payload, 4).unwrap() {
            DiskNode::Leaf { digest, value_hash } => {
                assert_eq!(digest, [1; 32]);
                assert_eq!(value_hash, [2; 32]);
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_tag() {
        let mut cell = [0u8; CELL_SIZE];
        cell[0] = 0x0f;
        assert!(decode(&cell, 1).is_err());
    }

    #[test]
    fn rejects_child_at_or_above_parent() {
        let cell = encode_bud(8, &[0; 32]);
        assert!(decode(&cell, 8).is_err());
        assert!(decode(&cell, 9).is_ok());
    }

    #[test]
    fn rejects_reference_into_leaf_ext() {
        let (_, ext) = encode_leaf(&[1; 32], &[2; 32]);
        assert!(decode(&ext, 3).is_err());
    }

    #[test]
    fn rejects_dirty_segment_padding() {
        let mut cell = encode_extender(&seg("LR"), 1, &[0; 32]);
        cell[SEG_OFF + 1] = 0xff;
        assert!(decode(&cell, 2).is_err());
    }
}
