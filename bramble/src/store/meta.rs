//! The `meta` file: array header and root table.
//!
//! The cell array itself is headerless; everything needed to interpret it
//! lives here. The meta file is the publication point of the store: cells
//! are appended and synced first, then the meta file is atomically replaced,
//! so a crash can never publish a root referencing unwritten cells.

use super::cell::CELL_SIZE;
use crate::error::{Error, Result};
use bramble_core::hasher::ValueHasher;
use bramble_core::node::CellIndex;
use bramble_core::Digest;

const META_MAGIC: [u8; 8] = *b"brmbmeta";
const META_VERSION: u32 = 1;
const HEADER_LEN: usize = 8 + 4 + 4 + 8 + 8 + 4;
const ROOT_ENTRY_LEN: usize = 40;

/// The decoded state of the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Meta {
    /// Which `cells-<seqn>` file the meta refers to. Bumped by compaction.
    pub array_seqn: u64,
    /// Committed cells in the array.
    pub length: u64,
    /// The root table: digest to array slot of each retained root.
    pub roots: Vec<(Digest, CellIndex)>,
}

impl Meta {
    /// Serialize: header, root entries sorted by digest, trailing checksum.
    pub fn encode<H: ValueHasher>(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.roots.len() * ROOT_ENTRY_LEN + 32);
        buf.extend_from_slice(&META_MAGIC);
        buf.extend_from_slice(&META_VERSION.to_le_bytes());
        buf.extend_from_slice(&(CELL_SIZE as u32).to_le_bytes());
        buf.extend_from_slice(&self.array_seqn.to_le_bytes());
        buf.extend_from_slice(&self.length.to_le_bytes());
        buf.extend_from_slice(&(self.roots.len() as u32).to_le_bytes());

        let mut roots = self.roots.clone();
        roots.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        for (digest, index) in &roots {
            buf.extend_from_slice(digest);
            buf.extend_from_slice(&index.to_le_bytes());
        }

        let checksum = H::hash_value(&buf);
        buf.extend_from_slice(&checksum);
        buf
    }

    /// Decode and validate a meta image.
    pub fn decode<H: ValueHasher>(bytes: &[u8]) -> Result<Self> {
        let corrupt = |reason| Error::CorruptCell { index: 0, reason };

        if bytes.len() < HEADER_LEN + 32 {
            return Err(corrupt("meta image too short"));
        }
        let (body, checksum) = bytes.split_at(bytes.len() - 32);
        if H::hash_value(body)[..] != checksum[..] {
            return Err(corrupt("meta image checksum mismatch"));
        }
        if body[0..8] != META_MAGIC {
            return Err(corrupt("meta image bad magic"));
        }
        if u32::from_le_bytes(body[8..12].try_into().expect("4 bytes")) != META_VERSION {
            return Err(corrupt("meta image unknown version"));
        }
        if u32::from_le_bytes(body[12..16].try_into().expect("4 bytes")) != CELL_SIZE as u32 {
            return Err(corrupt("meta image cell size mismatch"));
        }
        let array_seqn = u64::from_le_bytes(body[16..24].try_into().expect("8 bytes"));
        let length = u64::from_le_bytes(body[24..32].try_into().expect("8 bytes"));
        let count = u32::from_le_bytes(body[32..36].try_into().expect("4 bytes")) as usize;

        if body.len() != HEADER_LEN + count * ROOT_ENTRY_LEN {
            return Err(corrupt("meta image root table truncated"));
        }
        let mut roots = Vec::with_capacity(count);
        for i in 0..count {
            let at = HEADER_LEN + i * ROOT_ENTRY_LEN;
            let digest: Digest = body[at..at + 32].try_into().expect("32 bytes");
            let index = u64::from_le_bytes(body[at + 32..at + 40].try_into().expect("8 bytes"));
            roots.push((digest, index));
        }

        Ok(Meta {
            array_seqn,
            length,
            roots,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bramble_core::hasher::Blake3Hasher;
    use bramble_core::node::NIL_INDEX;

    #[test]
    fn round_trip() {
        let meta = Meta {
            array_seqn: 3,
            length: 17,
            roots: vec![([2; 32], 11), ([1; 32], NIL_INDEX)],
        };
        let image = meta.encode::<Blake3Hasher>();
        let back = Meta::decode::<Blake3Hasher>(&image).unwrap();
        assert_eq!(back.array_seqn, 3);
        assert_eq!(back.length, 17);
        // entries come back sorted by digest.
        assert_eq!(back.roots, vec![([1; 32], NIL_INDEX), ([2; 32], 11)]);
    }

    #[test]
    fn rejects_corruption() {
        let meta = Meta {
            array_seqn: 0,
            length: 0,
            roots: vec![],
        };
        let mut image = meta.encode::<Blake3Hasher>();
        image[9] ^= 0xff;
        assert!(Meta::decode::<Blake3Hasher>(&image).is_err());
        assert!(Meta::decode::<Blake3Hasher>(&[]).is_err());
    }
}
