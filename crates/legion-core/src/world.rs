// SPDX-License-Identifier: Apache-2.0
//! The world: sector/star generation, chunk ownership, and the per-tick
//! step driver that ties lanes, logistics, and energy together.

use crate::atoms::Atoms;
use crate::brain::BrainArena;
use crate::chunk::Chunk;
use crate::coord::Coord;
use crate::energy::Energy;
use crate::item::ItemId;
use crate::lanes::{Arrival, Lanes};
use crate::log::Log;
use crate::mod_registry::ModRegistry;
use crate::pills::{Cargo, Pills};
use crate::save::{Reader, SaveError, Writer, MAGIC_LOG, MAGIC_PILLS, MAGIC_WORLD};
use crate::tech::{TechRegistry, TechSet};
use crate::users::Users;
use rustc_hash::FxHashMap;
use tracing::{debug, info, trace, warn};

const PER_CHUNK_LOG_CAP: usize = 8;
const PER_USER_LOG_CAP: usize = 64;
const ELEMENT_KINDS: usize = 6;
const STARS_PER_SECTOR: u32 = 64;

/// The resource id used for lane/pill deliveries of raw cargo (matches
/// [`crate::pills::Cargo::item`]).
pub const ITEM_PILL: u16 = 1;

/// A splitmix64 step, used for deterministic, seedable generation that
/// doesn't depend on a process-wide RNG (needed for identical worlds across
/// save/load and across machines).
fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// One star: a coordinate and its raw element reserves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Star {
    /// Star's absolute coordinate.
    pub coord: Coord,
    /// Raw element reserves, indexed by element kind.
    pub elements: [u32; ELEMENT_KINDS],
}

/// A lazily generated, deterministic collection of stars covering one
/// sector (the area named by [`Coord::sector`]).
#[derive(Debug, Clone)]
pub struct Sector {
    /// This sector's coordinate (already normalized via `Coord::sector`).
    pub coord: Coord,
    /// Generated stars, in generation order.
    pub stars: Vec<Star>,
}

fn gen_sector(coord: Coord, world_seed: u64) -> Sector {
    let mut state = world_seed ^ u64::from(coord.x) << 32 ^ u64::from(coord.y);
    let mut stars = Vec::with_capacity(STARS_PER_SECTOR as usize);
    for _ in 0..STARS_PER_SECTOR {
        let x = coord.x.wrapping_add((splitmix64(&mut state) % 0x1_0000) as u32);
        let y = coord.y.wrapping_add((splitmix64(&mut state) % 0x1_0000) as u32);
        let mut elements = [0u32; ELEMENT_KINDS];
        for e in &mut elements {
            *e = (splitmix64(&mut state) % 40_000) as u32;
        }
        stars.push(Star {
            coord: Coord::new(x, y),
            elements,
        });
    }
    Sector { coord, stars }
}

/// Bundled per-chunk state: logistics ports, energy accounting, docked
/// pills, and the chunk's local fault/delivery log.
#[derive(Debug, Clone)]
pub struct ChunkState {
    /// Owning user.
    pub owner: u64,
    /// Producer/consumer matching state.
    pub ports: Chunk,
    /// Energy accounting for this tick.
    pub energy: Energy,
    /// Docked cargo parcels.
    pub pills: Pills,
    /// Local fault/delivery log.
    pub log: Log,
    /// Active machines (one VM instance each) placed in this chunk.
    /// Transient: not persisted by [`Self::encode`]/[`Self::decode`] — see
    /// `DESIGN.md` for why.
    pub machines: BrainArena,
}

impl ChunkState {
    fn new(owner: u64, worker_count: u32) -> Self {
        Self {
            owner,
            ports: Chunk::new(worker_count, Default::default()),
            energy: Energy::default(),
            pills: Pills::new(),
            log: Log::new(PER_CHUNK_LOG_CAP),
            machines: BrainArena::default(),
        }
    }

    fn encode(&self, w: &mut Writer) {
        w.write_u64(self.owner);
        self.ports.encode(w);
        self.energy.encode(w);
        w.write_magic(MAGIC_PILLS);
        self.pills.encode(w);
        w.write_magic(MAGIC_PILLS);
        w.write_magic(MAGIC_LOG);
        self.log.encode(w);
        w.write_magic(MAGIC_LOG);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, SaveError> {
        let owner = r.read_u64()?;
        let ports = Chunk::decode(r)?;
        let energy = Energy::decode(r)?;
        r.read_magic(MAGIC_PILLS)?;
        let pills = Pills::decode(r)?;
        r.read_magic(MAGIC_PILLS)?;
        r.read_magic(MAGIC_LOG)?;
        let log = Log::decode(r)?;
        r.read_magic(MAGIC_LOG)?;
        Ok(Self {
            owner,
            ports,
            energy,
            pills,
            log,
            machines: BrainArena::default(),
        })
    }
}

/// The whole simulated galaxy: sectors, chunks, lanes, atoms, modules, and
/// per-user technology unlocks.
#[derive(Debug)]
pub struct World {
    seed: u64,
    time: u64,
    atoms: Atoms,
    mods: ModRegistry,
    tech: TechRegistry,
    users: Users,
    sectors: FxHashMap<Coord, Sector>,
    chunks: FxHashMap<Coord, ChunkState>,
    lanes: Lanes,
    homes: FxHashMap<u64, Coord>,
    user_logs: FxHashMap<u64, Log>,
}

impl World {
    /// Construct a fresh world for the given deterministic seed.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        // Derived, not fetched from an entropy source: this crate is a
        // deterministic library (see `users` doc comment), so the initial
        // server token is just another seed-derived value, same as sector
        // generation. A server wanting an unpredictable token can still
        // rotate it at the binary layer before accepting connections.
        let mut token_state = seed ^ 0x5345_5256_5F54_4B4E;
        let server_token = splitmix64(&mut token_state);
        Self {
            seed,
            time: 0,
            atoms: Atoms::new(),
            mods: ModRegistry::new(),
            tech: TechRegistry::default(),
            users: Users::new(server_token),
            sectors: FxHashMap::default(),
            chunks: FxHashMap::default(),
            lanes: Lanes::default(),
            homes: FxHashMap::default(),
            user_logs: FxHashMap::default(),
        }
    }

    /// The seed this world was generated from.
    #[must_use]
    pub const fn seed(&self) -> u64 {
        self.seed
    }

    /// Current tick count.
    #[must_use]
    pub const fn time(&self) -> u64 {
        self.time
    }

    /// Mutable access to the atom table.
    pub fn atoms_mut(&mut self) -> &mut Atoms {
        &mut self.atoms
    }

    /// Mutable access to the module registry.
    pub fn mods_mut(&mut self) -> &mut ModRegistry {
        &mut self.mods
    }

    /// Read-only access to the user registry.
    #[must_use]
    pub const fn users(&self) -> &Users {
        &self.users
    }

    /// Mutable access to the user registry.
    pub fn users_mut(&mut self) -> &mut Users {
        &mut self.users
    }

    /// A user's technology unlocks, created empty on first access.
    pub fn tech_mut(&mut self, user: u64) -> &mut crate::tech::TechSet {
        self.tech.entry(user).or_default()
    }

    /// The sector containing `coord`, generating it deterministically on
    /// first access.
    pub fn sector(&mut self, coord: Coord) -> &Sector {
        let key = coord.sector();
        let seed = self.seed;
        self.sectors.entry(key).or_insert_with(|| gen_sector(key, seed))
    }

    /// Allocate a new chunk for `owner` at `coord`, if one doesn't already
    /// exist there.
    pub fn chunk_alloc(&mut self, coord: Coord, owner: u64, worker_count: u32) -> bool {
        if self.chunks.contains_key(&coord) {
            return false;
        }
        self.chunks.insert(coord, ChunkState::new(owner, worker_count));
        true
    }

    /// Access a chunk's state, if one has been allocated at `coord`.
    pub fn chunk(&self, coord: Coord) -> Option<&ChunkState> {
        self.chunks.get(&coord)
    }

    /// Mutable access to a chunk's state.
    pub fn chunk_mut(&mut self, coord: Coord) -> Option<&mut ChunkState> {
        self.chunks.get_mut(&coord)
    }

    /// Coordinates of every currently allocated chunk, in arbitrary order.
    /// Callers that need per-chunk star data ahead of [`World::step`] (which
    /// only exposes a plain `Fn`, not one that can itself mutate `World` to
    /// lazily generate sectors) collect this first.
    #[must_use]
    pub fn chunk_coords(&self) -> Vec<Coord> {
        self.chunks.keys().copied().collect()
    }

    /// Assign `coord` as `user`'s home chunk, allocating it if needed.
    pub fn populate_user(&mut self, user: u64, coord: Coord, worker_count: u32) {
        self.homes.insert(user, coord);
        self.chunk_alloc(coord, user, worker_count);
        self.user_logs
            .entry(user)
            .or_insert_with(|| Log::new(PER_USER_LOG_CAP));
    }

    /// A user's home chunk coordinate, if populated.
    #[must_use]
    pub fn home(&self, user: u64) -> Option<Coord> {
        self.homes.get(&user).copied()
    }

    /// A user's world-level fault/delivery log.
    pub fn user_log(&mut self, user: u64) -> &mut Log {
        self.user_logs
            .entry(user)
            .or_insert_with(|| Log::new(PER_USER_LOG_CAP))
    }

    /// Mutable access to the lanes registry, for launching new deliveries.
    pub fn lanes_mut(&mut self) -> &mut Lanes {
        &mut self.lanes
    }

    /// Route one lane arrival into its destination chunk: pills dock
    /// directly, everything else is handed to the caller to route into the
    /// appropriate active-item inbox.
    fn route_arrival(&mut self, arrival: Arrival) {
        let Some(state) = self.chunks.get_mut(&arrival.dst) else {
            return;
        };
        if arrival.item == ITEM_PILL {
            let count = arrival.data.first().copied().unwrap_or(0) as u32;
            if !state.pills.arrive(arrival.src, Cargo::new(arrival.item, count)) {
                state.log.push(
                    self.time,
                    arrival.dst,
                    ItemId::any(0).to_u16(),
                    0,
                    1,
                );
            }
        }
    }

    /// Advance the world by one tick: drain due lane deliveries, then for
    /// each chunk run energy accounting around stepping every active
    /// machine and the chunk's logistics matching, per §2's tick order.
    pub fn step(&mut self, star_energy_of: impl Fn(Coord) -> (u64, u16)) {
        self.time += 1;
        trace!(time = self.time, "world step begin");

        let arrivals = self.lanes.step(self.time);
        for arrival in arrivals {
            self.route_arrival(arrival);
        }

        for (&coord, state) in &mut self.chunks {
            let (star_energy, star_elem_k) = star_energy_of(coord);
            state.energy.step_begin(star_energy, star_elem_k);
            for (_, brain, _) in state.machines.iter_mut() {
                brain.step(&self.mods);
                if let Some(fault) = brain.vm().flags().fault() {
                    warn!(?coord, ?fault, "brain faulted during step");
                }
            }
            state.ports.ports_step();
            state.energy.step_end();
        }
    }

    /// Serialize the full world: atoms, mods, tech, homes, every chunk's
    /// port/energy/pill/log state, and in-flight lanes. Sectors are not
    /// persisted — they regenerate deterministically from `seed` on first
    /// access, so carrying their bytes would only bloat the save.
    #[must_use]
    pub fn save(&self) -> Vec<u8> {
        debug!(time = self.time, chunks = self.chunks.len(), "saving world");
        let mut w = Writer::new();
        w.write_magic(MAGIC_WORLD);
        w.write_u64(self.seed);
        w.write_u64(self.time);
        self.atoms.encode(&mut w);
        self.mods.encode(&mut w);
        self.users.encode(&mut w);

        w.write_u32(self.tech.len() as u32);
        let mut tech_users: Vec<_> = self.tech.keys().copied().collect();
        tech_users.sort_unstable();
        for user in tech_users {
            w.write_u64(user);
            self.tech[&user].encode(&mut w);
        }

        w.write_u32(self.homes.len() as u32);
        let mut home_users: Vec<_> = self.homes.keys().copied().collect();
        home_users.sort_unstable();
        for user in home_users {
            w.write_u64(user);
            w.write_u64(self.homes[&user].to_u64());
        }

        w.write_u32(self.user_logs.len() as u32);
        let mut log_users: Vec<_> = self.user_logs.keys().copied().collect();
        log_users.sort_unstable();
        for user in log_users {
            w.write_u64(user);
            w.write_magic(MAGIC_LOG);
            self.user_logs[&user].encode(&mut w);
            w.write_magic(MAGIC_LOG);
        }

        w.write_u32(self.chunks.len() as u32);
        let mut coords: Vec<_> = self.chunks.keys().copied().collect();
        coords.sort_unstable_by_key(Coord::to_u64);
        for coord in coords {
            w.write_u64(coord.to_u64());
            self.chunks[&coord].encode(&mut w);
        }

        self.lanes.encode(&mut w);
        w.write_magic(MAGIC_WORLD);
        w.into_inner()
    }

    /// Reconstruct a world previously serialized by [`Self::save`].
    ///
    /// # Errors
    ///
    /// Returns an error on truncated data or a mismatched framing tag.
    pub fn load(bytes: &[u8]) -> Result<Self, SaveError> {
        let mut r = Reader::new(bytes);
        r.read_magic(MAGIC_WORLD)?;
        let seed = r.read_u64()?;
        let time = r.read_u64()?;
        let atoms = Atoms::decode(&mut r)?;
        let mods = ModRegistry::decode(&mut r)?;
        let users = Users::decode(&mut r)?;

        let tech_count = r.read_u32()?;
        let mut tech: TechRegistry = FxHashMap::default();
        for _ in 0..tech_count {
            let user = r.read_u64()?;
            tech.insert(user, TechSet::decode(&mut r)?);
        }

        let home_count = r.read_u32()?;
        let mut homes = FxHashMap::default();
        for _ in 0..home_count {
            let user = r.read_u64()?;
            homes.insert(user, Coord::from_u64(r.read_u64()?));
        }

        let log_count = r.read_u32()?;
        let mut user_logs = FxHashMap::default();
        for _ in 0..log_count {
            let user = r.read_u64()?;
            r.read_magic(MAGIC_LOG)?;
            let log = Log::decode(&mut r)?;
            r.read_magic(MAGIC_LOG)?;
            user_logs.insert(user, log);
        }

        let chunk_count = r.read_u32()?;
        let mut chunks = FxHashMap::default();
        for _ in 0..chunk_count {
            let coord = Coord::from_u64(r.read_u64()?);
            chunks.insert(coord, ChunkState::decode(&mut r)?);
        }

        let lanes = Lanes::decode(&mut r)?;
        r.read_magic(MAGIC_WORLD)?;

        info!(time, chunks = chunks.len(), "loaded world");
        Ok(Self {
            seed,
            time,
            atoms,
            mods,
            tech,
            users,
            sectors: FxHashMap::default(),
            chunks,
            lanes,
            homes,
            user_logs,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn sector_generation_is_deterministic_for_seed() {
        let mut a = World::new(42);
        let mut b = World::new(42);
        let coord = Coord::new(100, 100);
        assert_eq!(a.sector(coord).stars, b.sector(coord).stars);
    }

    #[test]
    fn step_advances_time_and_drains_due_lanes() {
        let mut world = World::new(1);
        world.chunk_alloc(Coord::new(0, 0), 1, 2);
        world.chunk_alloc(Coord::new(10, 0), 1, 2);
        world
            .lanes_mut()
            .launch(0, Coord::new(0, 0), Coord::new(10, 0), 1_000_000, 1, ITEM_PILL, vec![5]);

        world.step(|_| (0, 0));

        let dst = world.chunk(Coord::new(10, 0)).unwrap();
        assert_eq!(dst.pills.count(), 1);
    }

    /// S6 — save/load preserves seed, time, atoms, mods, chunks, lanes,
    /// home, tech, log, and chunk items across repeated snapshot/restore
    /// cycles, each followed by stepping the restored world forward.
    #[test]
    fn s6_save_load_roundtrip_across_iterations() {
        let mut world = World::new(99);
        let home = Coord::new(0, 0);
        world.populate_user(1, home, 2);
        world.chunk_alloc(Coord::new(10, 0), 1, 2);
        world.mods_mut().register("boot");
        world.tech_mut(1).unlock(5);
        world.atoms_mut().atom("foo");
        world
            .lanes_mut()
            .launch(0, home, Coord::new(10, 0), 1_000_000, 1, ITEM_PILL, vec![3]);

        for _ in 0..5 {
            world.user_log(1).push(world.time(), home, 1, 1, 7);
            world.user_log(1).push(world.time(), home, 2, 1, 0);

            let bytes = world.save();
            let restored = World::load(&bytes).unwrap();

            assert_eq!(restored.seed(), world.seed());
            assert_eq!(restored.time(), world.time());
            assert_eq!(restored.home(1), world.home(1));
            assert_eq!(
                restored.chunks.keys().collect::<std::collections::BTreeSet<_>>(),
                world.chunks.keys().collect::<std::collections::BTreeSet<_>>()
            );
            assert_eq!(restored.lanes.len(), world.lanes.len());
            assert_eq!(
                restored.mods.list().len(),
                world.mods.list().len()
            );

            world = restored;
            world.step(|_| (0, 0));
            for _ in 0..99 {
                world.step(|_| (0, 0));
            }
        }
    }

    #[test]
    fn populate_user_sets_home_and_allocates_chunk() {
        let mut world = World::new(7);
        let home = Coord::new(3, 3);
        world.populate_user(1, home, 4);
        assert_eq!(world.home(1), Some(home));
        assert!(world.chunk(home).is_some());
    }

    #[test]
    fn step_runs_every_active_machine() {
        let mut world = World::new(5);
        let coord = Coord::new(0, 0);
        world.chunk_alloc(coord, 1, 2);
        let major = world.mods_mut().register("boot");
        world.mods_mut().store(
            major,
            vec![crate::vm::Op::Tsc as u8, crate::vm::Op::Yield as u8],
            vec![],
            vec![],
        );

        let specs = crate::vm::Specs {
            stack_cap: 8,
            speed: 8,
        };
        let id = crate::brain::spawn(&mut world.chunk_mut(coord).unwrap().machines, specs, major, None);

        world.step(|_| (0, 0));

        let (brain, _) = world.chunk(coord).unwrap().machines.get(id).unwrap();
        assert!(brain.vm().flags().is_suspended());
        assert_eq!(brain.vm().stack(), &[0]);
    }
}
