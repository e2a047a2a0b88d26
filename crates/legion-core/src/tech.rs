// SPDX-License-Identifier: Apache-2.0
//! Per-user technology unlocks: a flat bitset, no research graph.
//!
//! The opcode/compiler surface that would otherwise drive a dependency-graph
//! style tech tree is out of scope here, so unlocks are independent flags a
//! user can acquire in any order.

use crate::save::{Reader, SaveError, Writer};
use rustc_hash::FxHashMap;

/// A technology identifier.
pub type TechId = u16;

const WORD_BITS: u32 = 64;

/// One user's unlocked technologies, stored as a bitset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TechSet {
    words: Vec<u64>,
}

impl TechSet {
    /// Construct an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure(&mut self, id: TechId) {
        let word = id as usize / WORD_BITS as usize;
        if self.words.len() <= word {
            self.words.resize(word + 1, 0);
        }
    }

    /// Unlock `id`. Idempotent.
    pub fn unlock(&mut self, id: TechId) {
        self.ensure(id);
        let word = id as usize / WORD_BITS as usize;
        let bit = u64::from(id) % u64::from(WORD_BITS);
        self.words[word] |= 1 << bit;
    }

    /// Whether `id` has been unlocked.
    #[must_use]
    pub fn has(&self, id: TechId) -> bool {
        let word = id as usize / WORD_BITS as usize;
        let bit = u64::from(id) % u64::from(WORD_BITS);
        self.words
            .get(word)
            .is_some_and(|w| w & (1 << bit) != 0)
    }

    /// Iterate unlocked ids in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = TechId> + '_ {
        self.words.iter().enumerate().flat_map(|(word, &bits)| {
            (0..WORD_BITS).filter_map(move |bit| {
                if bits & (1 << bit) != 0 {
                    Some((word as u32 * WORD_BITS + bit) as TechId)
                } else {
                    None
                }
            })
        })
    }

    /// Number of unlocked technologies.
    #[must_use]
    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Whether no technologies are unlocked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    /// Write this set's backing words, unframed (the caller, `World`,
    /// brackets the whole per-user tech section).
    pub fn encode(&self, w: &mut Writer) {
        w.write_u32(self.words.len() as u32);
        for &word in &self.words {
            w.write_u64(word);
        }
    }

    /// Read a set previously written by [`Self::encode`].
    ///
    /// # Errors
    ///
    /// Returns an error on truncated data.
    pub fn decode(r: &mut Reader<'_>) -> Result<Self, SaveError> {
        let count = r.read_u32()? as usize;
        let mut words = Vec::with_capacity(count);
        for _ in 0..count {
            words.push(r.read_u64()?);
        }
        Ok(Self { words })
    }
}

/// Per-user technology registry for the whole world.
pub type TechRegistry = FxHashMap<u64, TechSet>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrips() {
        let mut set = TechSet::new();
        set.unlock(3);
        set.unlock(200);
        let mut w = Writer::new();
        set.encode(&mut w);
        let buf = w.into_inner();
        let mut r = Reader::new(&buf);
        let decoded = TechSet::decode(&mut r).unwrap();
        assert_eq!(decoded, set);
    }

    #[test]
    fn unlock_is_idempotent_and_queryable() {
        let mut set = TechSet::new();
        assert!(!set.has(3));
        set.unlock(3);
        set.unlock(3);
        assert!(set.has(3));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn unlock_spans_word_boundary() {
        let mut set = TechSet::new();
        set.unlock(0);
        set.unlock(63);
        set.unlock(64);
        set.unlock(200);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![0, 63, 64, 200]);
    }

    #[test]
    fn independent_unlocks_do_not_imply_order() {
        let mut set = TechSet::new();
        set.unlock(50);
        assert!(!set.has(49));
        assert!(!set.has(51));
        assert!(set.has(50));
    }
}
