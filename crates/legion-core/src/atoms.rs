// SPDX-License-Identifier: Apache-2.0
//! Bidirectional intern table: symbol ↔ 64-bit atom id.

use crate::save::{Reader, SaveError, Writer, MAGIC_ATOMS};
use rustc_hash::FxHashMap;

/// A bidirectional intern table.
///
/// `atom(symbol)` returns an existing id or mints a new monotonically
/// increasing one; `str(id)` retrieves the symbol back. The original
/// implementation resolves hash collisions with an embedded chaining list;
/// a `HashMap` gives the same guarantee (no two symbols share an id) without
/// needing to hand-roll chaining.
#[derive(Debug, Clone, Default)]
pub struct Atoms {
    next_id: u64,
    by_symbol: FxHashMap<String, u64>,
    by_id: FxHashMap<u64, String>,
}

impl Atoms {
    /// Construct an empty table. Id `0` is reserved as "no atom."
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: 1,
            by_symbol: FxHashMap::default(),
            by_id: FxHashMap::default(),
        }
    }

    /// Intern `symbol`, returning its id (existing or freshly minted).
    pub fn atom(&mut self, symbol: &str) -> u64 {
        if let Some(&id) = self.by_symbol.get(symbol) {
            return id;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.by_symbol.insert(symbol.to_owned(), id);
        self.by_id.insert(id, symbol.to_owned());
        id
    }

    /// Look up the symbol for `id`, if interned.
    #[must_use]
    pub fn str(&self, id: u64) -> Option<&str> {
        self.by_id.get(&id).map(String::as_str)
    }

    /// Pin `symbol` to an explicit `id`, admin-only. Fails if `id` is
    /// already in use by a different symbol, or `symbol` is already pinned
    /// to a different id.
    pub fn set(&mut self, symbol: &str, id: u64) -> bool {
        if let Some(existing) = self.by_id.get(&id) {
            return existing == symbol;
        }
        if self.by_symbol.contains_key(symbol) {
            return false;
        }
        self.by_symbol.insert(symbol.to_owned(), id);
        self.by_id.insert(id, symbol.to_owned());
        if id >= self.next_id {
            self.next_id = id + 1;
        }
        true
    }

    /// Number of interned atoms (used by the ack/delta protocol as
    /// `atoms_len`).
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Whether the table holds no atoms.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Iterate atoms with id `>= from`, in id order, for delta encoding.
    pub fn delta(&self, from: u64) -> impl Iterator<Item = (u64, &str)> + '_ {
        let mut ids: Vec<u64> = self.by_id.keys().copied().filter(|&id| id >= from).collect();
        ids.sort_unstable();
        ids.into_iter().map(move |id| (id, self.by_id[&id].as_str()))
    }

    /// Write this table's contents, bracketed by [`MAGIC_ATOMS`].
    pub fn encode(&self, w: &mut Writer) {
        w.write_magic(MAGIC_ATOMS);
        w.write_u64(self.next_id);
        w.write_u64(self.by_id.len() as u64);
        for (id, symbol) in self.delta(0) {
            w.write_u64(id);
            w.write_bytes(symbol.as_bytes());
        }
        w.write_magic(MAGIC_ATOMS);
    }

    /// Read a table previously written by [`Self::encode`].
    ///
    /// # Errors
    ///
    /// Returns an error on truncated data or a mismatched framing tag.
    pub fn decode(r: &mut Reader<'_>) -> Result<Self, SaveError> {
        r.read_magic(MAGIC_ATOMS)?;
        let next_id = r.read_u64()?;
        let count = r.read_u64()?;
        let mut by_symbol = FxHashMap::default();
        let mut by_id = FxHashMap::default();
        for _ in 0..count {
            let id = r.read_u64()?;
            let symbol = String::from_utf8_lossy(r.read_bytes()?).into_owned();
            by_symbol.insert(symbol.clone(), id);
            by_id.insert(id, symbol);
        }
        r.read_magic(MAGIC_ATOMS)?;
        Ok(Self {
            next_id,
            by_symbol,
            by_id,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn atom_is_injective() {
        let mut atoms = Atoms::new();
        let a = atoms.atom("foo");
        let b = atoms.atom("bar");
        let a2 = atoms.atom("foo");
        assert_eq!(a, a2);
        assert_ne!(a, b);
        assert_eq!(atoms.str(a), Some("foo"));
        assert_eq!(atoms.str(b), Some("bar"));
    }

    #[test]
    fn set_pins_explicit_id() {
        let mut atoms = Atoms::new();
        assert!(atoms.set("boot", 100));
        assert_eq!(atoms.atom("boot"), 100);
        // next auto-minted id continues past the pinned one
        let next = atoms.atom("other");
        assert!(next > 100);
    }

    #[test]
    fn set_rejects_conflicting_id() {
        let mut atoms = Atoms::new();
        atoms.atom("foo");
        let id = atoms.atom("foo");
        assert!(!atoms.set("bar", id));
    }

    #[test]
    fn encode_decode_roundtrips() {
        let mut atoms = Atoms::new();
        atoms.atom("foo");
        atoms.atom("bar");
        atoms.set("pinned", 500);

        let mut w = Writer::new();
        atoms.encode(&mut w);
        let buf = w.into_inner();
        let mut r = Reader::new(&buf);
        let mut decoded = Atoms::decode(&mut r).unwrap();

        assert_eq!(decoded.atom("foo"), atoms.atom("foo"));
        assert_eq!(decoded.str(500), Some("pinned"));
        assert_eq!(decoded.len(), atoms.len());
    }

    #[test]
    fn delta_returns_ids_at_or_after_cursor() {
        let mut atoms = Atoms::new();
        let a = atoms.atom("a");
        let b = atoms.atom("b");
        let c = atoms.atom("c");
        let from_b: Vec<_> = atoms.delta(b).map(|(id, _)| id).collect();
        assert_eq!(from_b, vec![b, c]);
        assert!(!atoms.delta(a).collect::<Vec<_>>().is_empty());
    }
}
