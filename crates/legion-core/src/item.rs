// SPDX-License-Identifier: Apache-2.0
//! Item identity and the active-item lifecycle subsystem.

use rustc_hash::FxHashMap;

/// A 16-bit packed `(type, seq)` item id. `seq == 0` is the "any" wildcard
/// used in port filters; real instances use `seq >= 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemId {
    /// The item type, e.g. a specific machine or resource kind.
    pub kind: u8,
    /// The instance sequence number within its type's arena, 1-based.
    pub seq: u8,
}

impl ItemId {
    /// Construct an id for the "any instance of this type" wildcard.
    #[must_use]
    pub const fn any(kind: u8) -> Self {
        Self { kind, seq: 0 }
    }

    /// Construct a concrete instance id.
    #[must_use]
    pub const fn instance(kind: u8, seq: u8) -> Self {
        Self { kind, seq }
    }

    /// Whether this is the "any" wildcard.
    #[must_use]
    pub const fn is_any(self) -> bool {
        self.seq == 0
    }

    /// Pack into the 16-bit wire representation.
    #[must_use]
    pub const fn to_u16(self) -> u16 {
        (self.kind as u16) << 8 | self.seq as u16
    }

    /// Unpack from the 16-bit wire representation.
    #[must_use]
    pub const fn from_u16(word: u16) -> Self {
        Self {
            kind: (word >> 8) as u8,
            seq: word as u8,
        }
    }
}

/// The four coarse item ranges named by the data model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemClass {
    /// Raw resources present on the star itself.
    Natural,
    /// Machines with per-instance lifecycle (arena-backed).
    Active,
    /// Workers, solar, kwheel, battery, pill: logistics plumbing.
    Logistics,
    /// Everything else (passive cargo, e.g. raw ore once produced).
    Passive,
}

/// Per-type behavior for an active item, selected at construction.
///
/// Replaces the original's `im_config` table with a trait object per
/// variant, per the arena+index / tagged-variant design note: dispatch on
/// item kind becomes a sum type, and the config table becomes a trait.
pub trait ActiveConfig: std::fmt::Debug {
    /// The fixed per-instance state this config's arena stores.
    type State: Default + Clone;

    /// Called once when an instance is created.
    fn init(&self, _state: &mut Self::State, _id: ItemId) {}

    /// Called once per tick, in `seq` order, for every live instance.
    fn step(&self, _state: &mut Self::State, _id: ItemId) {}
}

/// One instance's ports: an output slot and an input request/receive
/// state machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ports {
    /// Item currently offered for pickup, if any.
    pub out: Option<u16>,
    /// Requested input item and whether it has arrived.
    pub in_state: InState,
}

/// The state of an instance's input port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InState {
    /// Nothing requested.
    #[default]
    Nil,
    /// Requested `item`, not yet matched.
    Requested(u16),
    /// Matched; `item` is available to `consume`.
    Received(u16),
}

/// A slot in an active arena: either free (reusable) or occupied.
#[derive(Debug, Clone)]
enum Slot<S> {
    Free,
    Occupied { state: S, ports: Ports },
}

/// A packed array of per-instance state for one active item type, indexed
/// by `seq - 1`. Freed slots are reused by subsequent `create` calls.
#[derive(Debug, Clone)]
pub struct Arena<S> {
    kind: u8,
    slots: Vec<Slot<S>>,
    free_list: Vec<u8>,
}

impl<S: Default + Clone> Arena<S> {
    /// Construct an empty arena for item type `kind`.
    #[must_use]
    pub fn new(kind: u8) -> Self {
        Self {
            kind,
            slots: Vec::new(),
            free_list: Vec::new(),
        }
    }

    /// Allocate the next free slot and return its id, with default state
    /// and empty ports. Callers apply type-specific `init` afterward.
    pub fn create(&mut self) -> ItemId {
        let seq = if let Some(seq) = self.free_list.pop() {
            let idx = (seq - 1) as usize;
            self.slots[idx] = Slot::Occupied {
                state: S::default(),
                ports: Ports::default(),
            };
            seq
        } else {
            self.slots.push(Slot::Occupied {
                state: S::default(),
                ports: Ports::default(),
            });
            self.slots.len() as u8
        };
        ItemId::instance(self.kind, seq)
    }

    /// Reset an instance's ports and mark its slot free for reuse.
    pub fn delete(&mut self, id: ItemId) {
        debug_assert_eq!(id.kind, self.kind);
        if id.seq == 0 {
            return;
        }
        let idx = (id.seq - 1) as usize;
        if idx < self.slots.len() && matches!(self.slots[idx], Slot::Occupied { .. }) {
            self.slots[idx] = Slot::Free;
            self.free_list.push(id.seq);
        }
    }

    /// Shared access to an instance's state and ports.
    #[must_use]
    pub fn get(&self, id: ItemId) -> Option<(&S, &Ports)> {
        let idx = (id.seq.checked_sub(1)?) as usize;
        match self.slots.get(idx)? {
            Slot::Occupied { state, ports } => Some((state, ports)),
            Slot::Free => None,
        }
    }

    /// Mutable access to an instance's state and ports.
    pub fn get_mut(&mut self, id: ItemId) -> Option<(&mut S, &mut Ports)> {
        let idx = (id.seq.checked_sub(1)?) as usize;
        match self.slots.get_mut(idx)? {
            Slot::Occupied { state, ports } => Some((state, ports)),
            Slot::Free => None,
        }
    }

    /// Iterate live instances in ascending `seq` order.
    pub fn iter(&self) -> impl Iterator<Item = (ItemId, &S, &Ports)> + '_ {
        self.slots.iter().enumerate().filter_map(move |(i, slot)| {
            if let Slot::Occupied { state, ports } = slot {
                Some((ItemId::instance(self.kind, (i + 1) as u8), state, ports))
            } else {
                None
            }
        })
    }

    /// Mutably iterate live instances in ascending `seq` order, for
    /// `step`-like passes that need to mutate each instance in place.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ItemId, &mut S, &mut Ports)> + '_ {
        let kind = self.kind;
        self.slots.iter_mut().enumerate().filter_map(move |(i, slot)| {
            if let Slot::Occupied { state, ports } = slot {
                Some((ItemId::instance(kind, (i + 1) as u8), state, ports))
            } else {
                None
            }
        })
    }

    /// Number of live instances.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len() - self.free_list.len()
    }

    /// Whether the arena holds no live instances.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<S> Default for Arena<S> {
    fn default() -> Self {
        Self {
            kind: 0,
            slots: Vec::new(),
            free_list: Vec::new(),
        }
    }
}

/// A non-owning handle valid only against the arena it was minted from.
pub type ImId = ItemId;

/// Per-chunk listen table for data-lane arrivals: `(src coord hash,
/// channel) -> listening item`.
pub type ListenTable = FxHashMap<(u64, u32), ItemId>;

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, Clone, PartialEq, Eq)]
    struct Counter(u32);

    #[test]
    fn create_delete_reuses_freed_slot() {
        let mut arena: Arena<Counter> = Arena::new(3);
        let a = arena.create();
        let b = arena.create();
        assert_eq!(a, ItemId::instance(3, 1));
        assert_eq!(b, ItemId::instance(3, 2));
        arena.delete(a);
        assert_eq!(arena.len(), 1);
        let c = arena.create();
        assert_eq!(c, ItemId::instance(3, 1));
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn iter_visits_seq_order_skipping_free() {
        let mut arena: Arena<Counter> = Arena::new(1);
        let a = arena.create();
        let _b = arena.create();
        let c = arena.create();
        arena.delete(a);
        let ids: Vec<_> = arena.iter().map(|(id, _, _)| id).collect();
        assert_eq!(ids, vec![ItemId::instance(1, 2), c]);
    }

    #[test]
    fn item_id_packs_and_unpacks() {
        let id = ItemId::instance(7, 200);
        assert_eq!(ItemId::from_u16(id.to_u16()), id);
        assert!(ItemId::any(7).is_any());
    }
}
