//! Growable bit map backed by 64-bit words.
//!
//! Used for constant-pool request sets, the oop and native-pointer maps of the
//! heap region, and the pointer map of the metadata regions.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitMap {
    words: Vec<u64>,
    len: usize,
}

impl BitMap {
    /// Creates a map of `len` cleared bits.
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(64)],
            len,
        }
    }

    /// Rebuilds a map from its serialized words.
    pub fn from_words(words: Vec<u64>, len: usize) -> Self {
        let mut words = words;
        words.resize(len.div_ceil(64), 0);
        Self { words, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn words(&self) -> &[u64] {
        &self.words
    }

    /// Grows the map so that `len` bits are addressable. Never shrinks.
    pub fn resize(&mut self, len: usize) {
        if len > self.len {
            self.len = len;
            self.words.resize(len.div_ceil(64), 0);
        }
    }

    /// Sets bit `i`, growing the map when needed.
    pub fn set(&mut self, i: usize) {
        if i >= self.len {
            self.resize(i + 1);
        }
        self.words[i / 64] |= 1u64 << (i % 64);
    }

    pub fn clear(&mut self, i: usize) {
        if i < self.len {
            self.words[i / 64] &= !(1u64 << (i % 64));
        }
    }

    pub fn at(&self, i: usize) -> bool {
        i < self.len && self.words[i / 64] & (1u64 << (i % 64)) != 0
    }

    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Iterates set bits in ascending order.
    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(wi, &w)| {
            let mut word = w;
            std::iter::from_fn(move || {
                if word == 0 {
                    return None;
                }
                let bit = word.trailing_zeros() as usize;
                word &= word - 1;
                Some(wi * 64 + bit)
            })
        })
    }
}
