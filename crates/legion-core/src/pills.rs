// SPDX-License-Identifier: Apache-2.0
//! Pills: docked cargo parcels left at a coordinate by a lane delivery,
//! waiting to be picked up by a matching dock request.

use crate::coord::Coord;
use crate::save::{Reader, SaveError, Writer};

/// Maximum number of pills resident in a chunk at once.
pub const PILLS_MAX: usize = 256;

/// A resource kind and quantity carried by a pill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cargo {
    /// The resource kind.
    pub item: u16,
    /// The quantity of that resource.
    pub count: u32,
}

impl Cargo {
    /// Construct a cargo parcel.
    #[must_use]
    pub const fn new(item: u16, count: u32) -> Self {
        Self { item, count }
    }

    /// Unpack from a single VM word: `item` in the high 16 bits, `count` in
    /// the low 32.
    #[must_use]
    pub const fn from_word(word: u64) -> Self {
        Self {
            item: (word >> 32) as u16,
            count: word as u32,
        }
    }

    /// Pack into a single VM word.
    #[must_use]
    pub const fn to_word(self) -> u64 {
        (self.item as u64) << 32 | self.count as u64
    }
}

#[derive(Debug, Clone)]
enum Slot {
    Free,
    Occupied { coord: Coord, cargo: Cargo },
}

/// The set of pills resident in one chunk.
#[derive(Debug, Clone, Default)]
pub struct Pills {
    slots: Vec<Slot>,
    free_list: Vec<u32>,
    count: u32,
}

impl Pills {
    /// Construct an empty pill set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pills currently resident.
    #[must_use]
    pub const fn count(&self) -> u32 {
        self.count
    }

    /// Drop off cargo at `coord`. Fails once [`PILLS_MAX`] is reached.
    pub fn arrive(&mut self, coord: Coord, cargo: Cargo) -> bool {
        if self.count as usize >= PILLS_MAX {
            return false;
        }
        if let Some(idx) = self.free_list.pop() {
            self.slots[idx as usize] = Slot::Occupied { coord, cargo };
        } else {
            self.slots.push(Slot::Occupied { coord, cargo });
        }
        self.count += 1;
        true
    }

    /// Find and remove the first pill matching both filters. A `None`
    /// filter matches anything; a `Some(coord)` filter requires an exact
    /// coordinate match (`Coord::nil()` behaves like `None` for coord,
    /// mirroring the original's "nil coord means any coord").
    pub fn dock(&mut self, coord: Option<Coord>, item: Option<u16>) -> Option<(Coord, Cargo)> {
        let coord = coord.filter(|c| !c.is_nil());
        let hit = self.slots.iter().enumerate().find_map(|(idx, slot)| {
            let Slot::Occupied { coord: c, cargo } = slot else {
                return None;
            };
            if let Some(item) = item {
                if cargo.item != item {
                    return None;
                }
            }
            if let Some(coord) = coord {
                if *c != coord {
                    return None;
                }
            }
            Some((idx, *c, *cargo))
        });

        let (idx, c, cargo) = hit?;
        self.slots[idx] = Slot::Free;
        self.free_list.push(idx as u32);
        self.count -= 1;
        Some((c, cargo))
    }

    /// Feed this pill set's contents into a running hash, for ack/delta
    /// content comparison. Iterates in slot order (stable across identical
    /// histories, since `arrive`/`dock` always reuse the lowest free slot).
    pub fn hash(&self, hasher: &mut blake3::Hasher) {
        hasher.update(&self.count.to_le_bytes());
        for slot in &self.slots {
            if let Slot::Occupied { coord, cargo } = slot {
                hasher.update(&coord.to_u64().to_le_bytes());
                hasher.update(&cargo.to_word().to_le_bytes());
            }
        }
    }

    /// Write this pill set's slots (including free ones, to preserve slot
    /// indices for later `dock`/`arrive` reuse), unframed.
    pub fn encode(&self, w: &mut Writer) {
        w.write_u32(self.count);
        w.write_u32(self.slots.len() as u32);
        for slot in &self.slots {
            match slot {
                Slot::Occupied { coord, cargo } => {
                    w.write_u8(1);
                    w.write_u64(coord.to_u64());
                    w.write_u64(cargo.to_word());
                }
                Slot::Free => w.write_u8(0),
            }
        }
        w.write_u32(self.free_list.len() as u32);
        for &idx in &self.free_list {
            w.write_u32(idx);
        }
    }

    /// Read a pill set previously written by [`Self::encode`].
    ///
    /// # Errors
    ///
    /// Returns an error on truncated data.
    pub fn decode(r: &mut Reader<'_>) -> Result<Self, SaveError> {
        let count = r.read_u32()?;
        let slot_count = r.read_u32()? as usize;
        let mut slots = Vec::with_capacity(slot_count);
        for _ in 0..slot_count {
            if r.read_u8()? == 1 {
                let coord = Coord::from_u64(r.read_u64()?);
                let cargo = Cargo::from_word(r.read_u64()?);
                slots.push(Slot::Occupied { coord, cargo });
            } else {
                slots.push(Slot::Free);
            }
        }
        let free_count = r.read_u32()?;
        let mut free_list = Vec::with_capacity(free_count as usize);
        for _ in 0..free_count {
            free_list.push(r.read_u32()?);
        }
        Ok(Self {
            slots,
            free_list,
            count,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn arrive_then_dock_roundtrips() {
        let mut pills = Pills::new();
        let coord = Coord::new(1, 2);
        let cargo = Cargo::new(7, 100);
        assert!(pills.arrive(coord, cargo));
        assert_eq!(pills.count(), 1);

        let (got_coord, got_cargo) = pills.dock(None, None).expect("pill present");
        assert_eq!(got_coord, coord);
        assert_eq!(got_cargo, cargo);
        assert_eq!(pills.count(), 0);
        assert!(pills.dock(None, None).is_none());
    }

    #[test]
    fn dock_filters_by_item_and_coord() {
        let mut pills = Pills::new();
        pills.arrive(Coord::new(0, 0), Cargo::new(1, 10));
        pills.arrive(Coord::new(5, 5), Cargo::new(2, 20));

        assert!(pills.dock(None, Some(3)).is_none());
        let (coord, cargo) = pills.dock(Some(Coord::new(5, 5)), None).expect("match");
        assert_eq!(coord, Coord::new(5, 5));
        assert_eq!(cargo.item, 2);
        assert_eq!(pills.count(), 1);
    }

    #[test]
    fn arrive_reuses_freed_slot() {
        let mut pills = Pills::new();
        pills.arrive(Coord::new(0, 0), Cargo::new(1, 1));
        pills.dock(None, None);
        pills.arrive(Coord::new(9, 9), Cargo::new(2, 2));
        assert_eq!(pills.slots.len(), 1);
    }

    #[test]
    fn arrive_fails_once_full() {
        let mut pills = Pills::new();
        for i in 0..PILLS_MAX {
            assert!(pills.arrive(Coord::new(i as u32, 0), Cargo::new(1, 1)));
        }
        assert!(!pills.arrive(Coord::new(0, 1), Cargo::new(1, 1)));
    }

    #[test]
    fn encode_decode_roundtrips() {
        let mut pills = Pills::new();
        pills.arrive(Coord::new(1, 1), Cargo::new(3, 9));
        pills.arrive(Coord::new(2, 2), Cargo::new(4, 16));
        pills.dock(Some(Coord::new(1, 1)), None);
        pills.arrive(Coord::new(5, 5), Cargo::new(6, 25));

        let mut w = Writer::new();
        pills.encode(&mut w);
        let buf = w.into_inner();
        let mut r = Reader::new(&buf);
        let mut decoded = Pills::decode(&mut r).unwrap();

        assert_eq!(decoded.count(), pills.count());
        assert_eq!(
            decoded.dock(Some(Coord::new(5, 5)), None),
            Some((Coord::new(5, 5), Cargo::new(6, 25)))
        );
    }

    #[test]
    fn cargo_word_roundtrips() {
        let cargo = Cargo::new(0xBEEF, 0xCAFE_F00D);
        assert_eq!(Cargo::from_word(cargo.to_word()), cargo);
    }
}
