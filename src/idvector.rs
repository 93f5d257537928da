//! Delta-coded vector of strictly increasing 32-bit block ids.
//!
//! Stores the varint-encoded deltas between successive ids, followed by a
//! raw 4-byte little-endian copy of the most recent id (a "sentinel") that
//! lets `add` extend the sequence without rescanning the whole buffer. The
//! wire layout is exactly the in-memory buffer, so it round-trips across
//! process restarts unchanged.

use crate::varint;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdVector {
    data: Vec<u8>,
    last: u32,
}

impl IdVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Appends `id`, which must be strictly greater than the previously
    /// added id (or anything, if this is the first id).
    ///
    /// # Panics
    /// Panics if `id` is not strictly increasing relative to the last added
    /// id; this mirrors the source invariant that block ids assigned by the
    /// store are monotonic and callers never hand the vector out-of-order
    /// ids.
    pub fn add(&mut self, id: u32) {
        if self.data.is_empty() {
            let mut tmp = [0u8; 4];
            let n = varint::write_uint(id, &mut tmp).expect("id fits in 30 bits");
            self.data.extend_from_slice(&tmp[..n]);
        } else {
            assert!(id > self.last, "block ids must be strictly increasing");
            let delta = id - self.last;
            let sentinel_at = self.data.len() - 4;
            self.data.truncate(sentinel_at);
            let mut tmp = [0u8; 4];
            let n = varint::write_uint(delta, &mut tmp).expect("delta fits in 30 bits");
            self.data.extend_from_slice(&tmp[..n]);
        }
        self.data.extend_from_slice(&id.to_le_bytes());
        self.last = id;
    }

    /// Reconstructs the plain id sequence.
    pub fn unpack(&self) -> Vec<u32> {
        if self.data.is_empty() {
            return Vec::new();
        }
        let end = self.data.len() - 4;
        let mut ids = Vec::new();
        let mut pos = 0;
        let mut prev: u32 = 0;
        while pos < end {
            let (v, n) = varint::read_uint(&self.data[pos..]).expect("well-formed id vector");
            pos += n;
            let id = if ids.is_empty() { v } else { prev + v };
            ids.push(id);
            prev = id;
        }
        ids
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        if bytes.is_empty() {
            return Self::default();
        }
        let last = u32::from_le_bytes(bytes[bytes.len() - 4..].try_into().unwrap());
        Self {
            data: bytes.to_vec(),
            last,
        }
    }

    pub fn len(&self) -> usize {
        self.unpack().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_strictly_increasing_sequence() {
        let ids = [1u32, 3, 4, 100, 101, 50_000, 1_000_000];
        let mut v = IdVector::new();
        for &id in &ids {
            v.add(id);
        }
        assert_eq!(v.unpack(), ids.to_vec());
    }

    #[test]
    fn byte_layout_round_trips() {
        let mut v = IdVector::new();
        for id in [0u32, 5, 9, 1000] {
            v.add(id);
        }
        let bytes = v.as_bytes().to_vec();
        let restored = IdVector::from_bytes(&bytes);
        assert_eq!(restored.unpack(), v.unpack());
        assert_eq!(restored.as_bytes(), v.as_bytes());
    }

    #[test]
    fn empty_vector_unpacks_empty() {
        let v = IdVector::new();
        assert!(v.is_empty());
        assert_eq!(v.unpack(), Vec::<u32>::new());
    }

    #[test]
    #[should_panic]
    fn rejects_non_increasing_ids() {
        let mut v = IdVector::new();
        v.add(5);
        v.add(5);
    }
}
