//! Sparse dirty-slot bitsets
//!
//! `Bits` tracks which field, key-slot or list index a transaction touched.
//! Most objects touch a handful of fields per commit, so the common case is a
//! single inline `u32`. Sets that reach index 32 or beyond escalate to a sparse
//! word array indexed by `index >> 5`, where absent words cost one `None`.
//!
//! # Index shifting
//!
//! Indexed (list-like) objects renumber their slots when elements are inserted
//! or removed. [`Bits::remove`] and [`Bits::insert_shift`] keep recorded bits in
//! current coordinates:
//!
//! ```
//! use mvstm_core::Bits;
//!
//! let mut bits = Bits::new();
//! bits.set(5);
//! bits.remove(2); // an element below moved out, slot 5 is now slot 4
//! assert!(bits.get(4));
//! assert!(!bits.get(5));
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

const WORD_BITS: u32 = 32;

/// Sparse, growable bitset.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Bits {
    /// Up to 32 slots in one word
    Inline(u32),
    /// Word `i` covers indices `i * 32 .. i * 32 + 32`
    Sparse(Vec<Option<u32>>),
}

impl Default for Bits {
    fn default() -> Self {
        Bits::Inline(0)
    }
}

impl Bits {
    /// Create an empty set
    pub fn new() -> Self {
        Bits::Inline(0)
    }

    /// Build a set from indices
    pub fn from_indices<I: IntoIterator<Item = u32>>(indices: I) -> Self {
        let mut bits = Bits::new();
        for index in indices {
            bits.set(index);
        }
        bits
    }

    #[inline]
    fn split(index: u32) -> (usize, u32) {
        ((index / WORD_BITS) as usize, 1u32 << (index % WORD_BITS))
    }

    /// Test whether `index` is set
    pub fn get(&self, index: u32) -> bool {
        match self {
            Bits::Inline(word) => index < WORD_BITS && word & (1 << index) != 0,
            Bits::Sparse(words) => {
                let (slot, mask) = Self::split(index);
                matches!(words.get(slot), Some(Some(word)) if word & mask != 0)
            }
        }
    }

    /// Set `index`, returning true if it was not already set
    pub fn set(&mut self, index: u32) -> bool {
        if let Bits::Inline(word) = self {
            if index < WORD_BITS {
                let mask = 1 << index;
                let fresh = *word & mask == 0;
                *word |= mask;
                return fresh;
            }
            self.escalate();
        }

        match self {
            Bits::Sparse(words) => {
                let (slot, mask) = Self::split(index);
                if words.len() <= slot {
                    words.resize(slot + 1, None);
                }
                let word = words[slot].get_or_insert(0);
                let fresh = *word & mask == 0;
                *word |= mask;
                fresh
            }
            Bits::Inline(_) => unreachable!("escalated above"),
        }
    }

    /// Clear a single bit without renumbering the others
    pub fn unset(&mut self, index: u32) {
        match self {
            Bits::Inline(word) => {
                if index < WORD_BITS {
                    *word &= !(1 << index);
                }
            }
            Bits::Sparse(words) => {
                let (slot, mask) = Self::split(index);
                if let Some(entry) = words.get_mut(slot) {
                    if let Some(word) = entry {
                        *word &= !mask;
                        if *word == 0 {
                            *entry = None;
                        }
                    }
                }
            }
        }
    }

    fn escalate(&mut self) {
        if let Bits::Inline(word) = *self {
            let first = if word == 0 { None } else { Some(word) };
            *self = Bits::Sparse(vec![first]);
        }
    }

    /// True when no bit is set
    pub fn is_empty(&self) -> bool {
        match self {
            Bits::Inline(word) => *word == 0,
            Bits::Sparse(words) => words.iter().all(|w| w.map_or(true, |w| w == 0)),
        }
    }

    /// Number of set bits
    pub fn len(&self) -> usize {
        match self {
            Bits::Inline(word) => word.count_ones() as usize,
            Bits::Sparse(words) => words
                .iter()
                .map(|w| w.map_or(0, |w| w.count_ones() as usize))
                .sum(),
        }
    }

    /// Remove every bit
    pub fn clear(&mut self) {
        *self = Bits::Inline(0);
    }

    /// Iterate set indices in ascending order
    pub fn iter(&self) -> BitsIter<'_> {
        BitsIter {
            bits: self,
            slot: 0,
            current: self.word(0),
        }
    }

    fn word(&self, slot: usize) -> u32 {
        match self {
            Bits::Inline(word) => {
                if slot == 0 {
                    *word
                } else {
                    0
                }
            }
            Bits::Sparse(words) => words.get(slot).copied().flatten().unwrap_or(0),
        }
    }

    fn word_count(&self) -> usize {
        match self {
            Bits::Inline(_) => 1,
            Bits::Sparse(words) => words.len(),
        }
    }

    /// True if any index is set in both sets
    pub fn intersects(&self, other: &Bits) -> bool {
        if let (Bits::Inline(a), Bits::Inline(b)) = (self, other) {
            return a & b != 0;
        }
        let words = self.word_count().min(other.word_count());
        (0..words).any(|slot| self.word(slot) & other.word(slot) != 0)
    }

    /// First index set in both sets
    pub fn first_common(&self, other: &Bits) -> Option<u32> {
        let words = self.word_count().min(other.word_count());
        (0..words).find_map(|slot| {
            let common = self.word(slot) & other.word(slot);
            (common != 0).then(|| slot as u32 * WORD_BITS + common.trailing_zeros())
        })
    }

    /// Add every bit of `other`
    pub fn union_with(&mut self, other: &Bits) {
        match (&mut *self, other) {
            (Bits::Inline(a), Bits::Inline(b)) => *a |= b,
            _ => {
                for index in other.iter() {
                    self.set(index);
                }
            }
        }
    }

    /// Delete slot `index` from the index space.
    ///
    /// Bit `index` is dropped and every bit above it moves down by one.
    pub fn remove(&mut self, index: u32) {
        if let Bits::Inline(word) = self {
            let word64 = *word as u64;
            let low = word64 & ((1u64 << index.min(WORD_BITS)) - 1);
            let high = if index >= WORD_BITS {
                0
            } else {
                (word64 >> (index + 1)) << index
            };
            *word = (low | high) as u32;
            return;
        }
        let shifted: Vec<u32> = self
            .iter()
            .filter(|&i| i != index)
            .map(|i| if i > index { i - 1 } else { i })
            .collect();
        *self = Bits::from_indices(shifted);
    }

    /// Open a gap at `index`: every bit at or above it moves up by one.
    pub fn insert_shift(&mut self, index: u32) {
        if let Bits::Inline(word) = self {
            if *word & 0x8000_0000 == 0 && index < WORD_BITS {
                let word64 = *word as u64;
                let low = word64 & ((1u64 << index) - 1);
                let high = (word64 >> index) << (index + 1);
                *word = (low | high) as u32;
                return;
            }
        }
        let shifted: Vec<u32> = self
            .iter()
            .map(|i| if i >= index { i + 1 } else { i })
            .collect();
        *self = Bits::from_indices(shifted);
    }
}

impl fmt::Debug for Bits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl FromIterator<u32> for Bits {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        Bits::from_indices(iter)
    }
}

/// Ascending iterator over the set indices of a [`Bits`]
pub struct BitsIter<'a> {
    bits: &'a Bits,
    slot: usize,
    current: u32,
}

impl Iterator for BitsIter<'_> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        loop {
            if self.current != 0 {
                let offset = self.current.trailing_zeros();
                self.current &= self.current - 1;
                return Some(self.slot as u32 * WORD_BITS + offset);
            }
            self.slot += 1;
            if self.slot >= self.bits.word_count() {
                return None;
            }
            self.current = self.bits.word(self.slot);
        }
    }
}

impl<'a> IntoIterator for &'a Bits {
    type Item = u32;
    type IntoIter = BitsIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
