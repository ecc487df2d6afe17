//! Chunk-index arithmetic and the `read_state` bitset shared by every
//! strategy, grounded on `librqbit`'s `chunk_tracker.rs` bitfield handling
//! and `bitv.rs`'s choice of `bitvec` over a hand-rolled bitset.

use bitvec::{order::Lsb0, vec::BitVec};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

pub fn chunk_count(file_size: u64, chunk_size: u64) -> u64 {
    if file_size == 0 {
        return 0;
    }
    file_size.div_ceil(chunk_size)
}

pub fn chunk_index(offset: u64, chunk_size: u64) -> u64 {
    offset / chunk_size
}

pub fn chunk_offset(chunk_index: u64, chunk_size: u64) -> u64 {
    chunk_index * chunk_size
}

/// Length of `chunk_index`, clamped to the file's actual tail.
pub fn chunk_len(chunk_index: u64, chunk_size: u64, file_size: u64) -> u64 {
    let start = chunk_offset(chunk_index, chunk_size);
    if start >= file_size {
        return 0;
    }
    (file_size - start).min(chunk_size)
}

/// Inclusive-exclusive range of chunk indices covering `[offset, offset+len)`.
pub fn chunks_covering(offset: u64, len: u64, chunk_size: u64) -> std::ops::Range<u64> {
    if len == 0 {
        return 0..0;
    }
    let first = chunk_index(offset, chunk_size);
    let last = chunk_index(offset + len - 1, chunk_size);
    first..(last + 1)
}

/// Presence bitset over chunk indices. Used both for the full-file strategy
/// (one bit per chunk of the whole file) and, slot-indexed, for the ring
/// strategies (`slot = chunk_index mod ring_size`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadState {
    bits: BitVec<u8, Lsb0>,
}

impl ReadState {
    pub fn new(len: usize) -> Self {
        Self {
            bits: BitVec::repeat(false, len),
        }
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn get(&self, index: usize) -> bool {
        self.bits.get(index).map(|b| *b).unwrap_or(false)
    }

    pub fn set(&mut self, index: usize, value: bool) {
        if index < self.bits.len() {
            self.bits.set(index, value);
        }
    }

    pub fn clear_all(&mut self) {
        self.bits.fill(false);
    }

    pub fn clear_range(&mut self, range: std::ops::Range<usize>) {
        let end = range.end.min(self.bits.len());
        for i in range.start..end {
            self.bits.set(i, false);
        }
    }

    pub fn all_set(&self) -> bool {
        self.bits.all()
    }

    pub fn resize(&mut self, new_len: usize) {
        self.bits.resize(new_len, false);
    }

    /// Marks `[0, new_complete_bits)` as present and drops anything beyond —
    /// used by full-file truncate/grow where newly created chunks are
    /// known-zero and don't need a download.
    pub fn set_present_up_to(&mut self, new_complete_bits: usize) {
        self.resize(new_complete_bits.max(self.bits.len().min(new_complete_bits)));
        for i in 0..self.bits.len().min(new_complete_bits) {
            self.bits.set(i, true);
        }
    }

    pub fn as_bool_vec(&self) -> Vec<bool> {
        self.bits.iter().map(|b| *b).collect()
    }

    pub fn from_bool_vec(bits: Vec<bool>) -> Self {
        Self {
            bits: bits.into_iter().collect(),
        }
    }
}

/// Wire/persisted form of [`ReadState`] (`resume` table rows are JSON).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadStateSnapshot(pub Vec<bool>);

impl From<&ReadState> for ReadStateSnapshot {
    fn from(rs: &ReadState) -> Self {
        ReadStateSnapshot(rs.as_bool_vec())
    }
}

impl From<ReadStateSnapshot> for ReadState {
    fn from(snap: ReadStateSnapshot) -> Self {
        ReadState::from_bool_vec(snap.0)
    }
}
