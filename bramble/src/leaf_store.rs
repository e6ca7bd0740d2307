//! Content-addressed, reference-counted storage of leaf values.
//!
//! Two leaves carrying the same value share a single entry here, keyed by
//! the value digest. Counts move with the edit engine: an upsert inserts,
//! an overwrite or delete decrements, and compaction rebuilds the counts
//! from whatever the live roots actually reach.

use crate::error::{Error, Result};
use bramble_core::{hasher::ValueHasher, Digest};
use fxhash::FxHashMap;

const LEAVES_MAGIC: [u8; 8] = *b"brmbleaf";
const LEAVES_VERSION: u32 = 1;

struct LeafEntry {
    value: Vec<u8>,
    refs: u64,
}

/// The in-memory leaf store, serializable to the `leaves` file.
pub struct LeafStore {
    entries: FxHashMap<Digest, LeafEntry>,
}

impl LeafStore {
    /// An empty store.
    pub fn new() -> Self {
        LeafStore {
            entries: FxHashMap::default(),
        }
    }

    /// Insert a value, returning its digest. If the digest is already
    /// present the refcount is incremented and the stored bytes are kept.
    pub fn insert<H: ValueHasher>(&mut self, value: &[u8]) -> Digest {
        let digest = H::hash_value(value);
        self.entries
            .entry(digest)
            .and_modify(|e| e.refs += 1)
            .or_insert_with(|| LeafEntry {
                value: value.to_vec(),
                refs: 1,
            });
        digest
    }

    /// Look up the value stored under `digest`.
    pub fn get(&self, digest: &Digest) -> Option<&[u8]> {
        self.entries.get(digest).map(|e| e.value.as_slice())
    }

    /// Decrement the refcount under `digest`, removing the entry when it
    /// reaches zero. Decrementing an absent digest is a no-op, observable
    /// only as a diagnostic event.
    pub fn decr(&mut self, digest: &Digest) {
        match self.entries.get_mut(digest) {
            Some(e) if e.refs > 1 => e.refs -= 1,
            Some(_) => {
                self.entries.remove(digest);
            }
            None => {
                tracing::debug!(prefix = ?&digest[..4], "decr on absent leaf digest");
            }
        }
    }

    /// Increment the refcount under an already-present digest. Returns false
    /// if the digest is absent.
    pub fn incr(&mut self, digest: &Digest) -> bool {
        match self.entries.get_mut(digest) {
            Some(e) => {
                e.refs += 1;
                true
            }
            None => false,
        }
    }

    /// Adopt a value from another store under a known digest, starting its
    /// refcount at one. Used when rebuilding counts from reachable leaves.
    pub fn adopt(&mut self, digest: Digest, value: Vec<u8>) {
        let prev = self.entries.insert(digest, LeafEntry { value, refs: 1 });
        debug_assert!(prev.is_none());
    }

    /// The refcount currently recorded under `digest`; zero when absent.
    pub fn refcount(&self, digest: &Digest) -> u64 {
        self.entries.get(digest).map_or(0, |e| e.refs)
    }

    /// The number of distinct values held.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no values.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize to the `leaves` file image: header, records sorted by
    /// digest, trailing checksum.
    pub fn encode<H: ValueHasher>(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(20 + self.entries.len() * 48);
        buf.extend_from_slice(&LEAVES_MAGIC);
        buf.extend_from_slice(&LEAVES_VERSION.to_le_bytes());
        buf.extend_from_slice(&(self.entries.len() as u64).to_le_bytes());

        let mut digests: Vec<&Digest> = self.entries.keys().collect();
        digests.sort_unstable();
        for digest in digests {
            let e = &self.entries[digest];
            buf.extend_from_slice(digest);
            buf.extend_from_slice(&e.refs.to_le_bytes());
            buf.extend_from_slice(&(e.value.len() as u32).to_le_bytes());
            buf.extend_from_slice(&e.value);
        }

        let checksum = H::hash_value(&buf);
        buf.extend_from_slice(&checksum);
        buf
    }

    /// Decode a `leaves` file image, validating magic, version, record
    /// lengths, and the trailing checksum.
    pub fn decode<H: ValueHasher>(bytes: &[u8]) -> Result<Self> {
        let corrupt = |reason| Error::CorruptCell { index: 0, reason };

        if bytes.len() < 20 + 32 {
            return Err(corrupt("leaf image too short"));
        }
        let (body, checksum) = bytes.split_at(bytes.len() - 32);
        if H::hash_value(body)[..] != checksum[..] {
            return Err(corrupt("leaf image checksum mismatch"));
        }
        if body[0..8] != LEAVES_MAGIC {
            return Err(corrupt("leaf image bad magic"));
        }
        if u32::from_le_bytes(body[8..12].try_into().expect("4 bytes")) != LEAVES_VERSION {
            return Err(corrupt("leaf image unknown version"));
        }
        let count = u64::from_le_bytes(body[12..20].try_into().expect("8 bytes"));

        let mut entries = FxHashMap::default();
        let mut at = 20;
        for _ in 0..count {
            if body.len() < at + 44 {
                return Err(corrupt("leaf record truncated"));
            }
            let digest: Digest = body[at..at + 32].try_into().expect("32 bytes");
            let refs = u64::from_le_bytes(body[at + 32..at + 40].try_into().expect("8 bytes"));
            let len = u32::from_le_bytes(body[at + 40..at + 44].try_into().expect("4 bytes")) as usize;
            at += 44;
            if body.len() < at + len {
                return Err(corrupt("leaf value truncated"));
            }
            if refs == 0 {
                return Err(corrupt("leaf record with zero refcount"));
            }
            let value = body[at..at + len].to_vec();
            at += len;
            entries.insert(digest, LeafEntry { value, refs });
        }
        if at != body.len() {
            return Err(corrupt("trailing bytes after leaf records"));
        }

        Ok(LeafStore { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bramble_core::hasher::Blake3Hasher;

    #[test]
    fn insert_dedups_and_counts() {
        let mut store = LeafStore::new();
        let d1 = store.insert::<Blake3Hasher>(b"v");
        let d2 = store.insert::<Blake3Hasher>(b"v");
        assert_eq!(d1, d2);
        assert_eq!(store.len(), 1);
        assert_eq!(store.refcount(&d1), 2);
    }

    #[test]
    fn decr_removes_at_zero() {
        let mut store = LeafStore::new();
        let d = store.insert::<Blake3Hasher>(b"v");
        store.insert::<Blake3Hasher>(b"v");
        store.decr(&d);
        assert_eq!(store.refcount(&d), 1);
        assert!(store.get(&d).is_some());
        store.decr(&d);
        assert_eq!(store.refcount(&d), 0);
        assert!(store.get(&d).is_none());
        // absent decr is a no-op.
        store.decr(&d);
    }

    #[test]
    fn image_round_trips() {
        let mut store = LeafStore::new();
        store.insert::<Blake3Hasher>(b"alpha");
        store.insert::<Blake3Hasher>(b"alpha");
        let beta = store.insert::<Blake3Hasher>(b"beta");
        store.insert::<Blake3Hasher>(b"");

        let image = store.encode::<Blake3Hasher>();
        let back = LeafStore::decode::<Blake3Hasher>(&image).unwrap();
        assert_eq!(back.len(), 3);
        assert_eq!(back.refcount(&beta), 1);
        assert_eq!(back.get(&beta), Some(&b"beta"[..]));
    }

    #[test]
    fn image_rejects_bit_flip() {
        let mut store = LeafStore::new();
        store.insert::<Blake3Hasher>(b"x");
        let mut image = store.encode::<Blake3Hasher>();
        image[21] ^= 1;
        assert!(LeafStore::decode::<Blake3Hasher>(&image).is_err());
    }
}
