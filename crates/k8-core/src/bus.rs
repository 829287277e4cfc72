//! Bit-range addressing on terminals.
//!
//! Terminal values are carried as `u64` words, so a terminal is at most
//! [`MAX_WIDTH`] bits wide. A [`BusMask`] selects the `count` bits starting
//! at `offset`; masked values are always right-aligned (bit 0 of the masked
//! value is bit `offset` of the terminal).

use serde::{Deserialize, Serialize};

/// Widest terminal the runtime can store.
pub const MAX_WIDTH: u32 = 64;

/// An `(offset, count)` sub-range of a terminal's bit vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BusMask {
    pub offset: u32,
    pub count: u32,
}

impl BusMask {
    pub const fn new(offset: u32, count: u32) -> Self {
        Self { offset, count }
    }

    /// The mask covering a whole terminal of the given width.
    pub const fn full(width: u32) -> Self {
        Self {
            offset: 0,
            count: width,
        }
    }

    /// A single bit.
    pub const fn bit(index: u32) -> Self {
        Self {
            offset: index,
            count: 1,
        }
    }

    /// One past the last selected bit.
    pub const fn end(&self) -> u32 {
        self.offset + self.count
    }

    /// `count` is positive and the range lies inside `width`.
    pub fn fits(&self, width: u32) -> bool {
        self.count > 0 && self.offset.checked_add(self.count).is_some_and(|end| end <= width)
    }

    pub fn overlaps(&self, other: &BusMask) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }

    /// Bit indices covered by this mask, low to high.
    pub fn bits(&self) -> std::ops::Range<u32> {
        self.offset..self.end()
    }

    /// Right-aligned low-bit mask of `count` ones.
    pub fn value_mask(&self) -> u64 {
        low_bits(self.count)
    }

    /// Extract the selected range from a full terminal value.
    pub fn extract(&self, word: u64) -> u64 {
        if self.offset >= MAX_WIDTH {
            return 0;
        }
        (word >> self.offset) & self.value_mask()
    }

    /// Replace the selected range of `word` with the low bits of `value`.
    pub fn insert(&self, word: u64, value: u64) -> u64 {
        if self.offset >= MAX_WIDTH {
            return word;
        }
        let field = self.value_mask() << self.offset;
        (word & !field) | ((value << self.offset) & field)
    }
}

impl std::fmt::Display for BusMask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}..{})", self.offset, self.end())
    }
}

/// `n` low bits set. Saturates at 64.
pub fn low_bits(n: u32) -> u64 {
    if n >= 64 { u64::MAX } else { (1u64 << n) - 1 }
}
