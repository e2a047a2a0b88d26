// SPDX-License-Identifier: Apache-2.0
//! legion-core: a tick-driven, deterministic simulation of a galaxy of
//! programmable machines.
//!
//! The world is a lazily generated plane of stars, visited by users who
//! place active machines in a chunk's logistics network, program them with
//! the stack VM in [`vm`], and move cargo between chunks over [`lanes`].
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]
#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::cargo,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::dbg_macro,
    clippy::print_stdout,
    clippy::print_stderr
)]
#![allow(
    clippy::must_use_candidate,
    clippy::return_self_not_must_use,
    clippy::unreadable_literal,
    clippy::missing_const_for_fn,
    clippy::suboptimal_flops,
    clippy::redundant_pub_crate,
    clippy::many_single_char_names,
    clippy::module_name_repetitions,
    clippy::use_self
)]
// Permit intentional name repetition for public API clarity (e.g. `lanes::Lanes`)
// and functions named after their module for discoverability.

/// Bidirectional atom/symbol interning shared across a world.
pub mod atoms;
/// The brain active item: one VM instance per machine, bound to a module.
pub mod brain;
/// Chunk logistics: producer/consumer matching via a fixed worker pool.
pub mod chunk;
/// Star coordinates, sector partitioning, and lane keying.
pub mod coord;
/// Per-tick energy production, consumption, and storage accounting.
pub mod energy;
/// Item identity and the active-item lifecycle subsystem.
pub mod item;
/// Inter-star lanes: priority queues of in-flight packets.
pub mod lanes;
/// A fixed-capacity ring of I/O fault and delivery events.
pub mod log;
/// The module registry: named, versioned, content-hash-deduplicated VM programs.
pub mod mod_registry;
/// Docked cargo parcels awaiting pickup.
pub mod pills;
/// Binary persistence: magic-framed cursors and save backends.
pub mod save;
/// Per-user technology unlocks.
pub mod tech;
/// User identity, access grants, and token-based auth.
pub mod users;
/// The stack-based bytecode VM.
pub mod vm;
/// The world: sectors, chunks, and the per-tick step driver.
pub mod world;

pub use atoms::Atoms;
pub use brain::{BrainArena, BrainState};
pub use chunk::Chunk;
pub use coord::{lanes_key, Coord, Rect};
pub use energy::Energy;
pub use item::{ActiveConfig, Arena, ItemClass, ItemId};
pub use lanes::{Arrival, Lanes};
pub use log::Log;
pub use mod_registry::{Mod, ModRegistry};
pub use pills::{Cargo, Pills};
pub use save::{Reader, SaveBackend, SaveError, Writer};
pub use tech::{TechId, TechSet};
pub use users::{User, UserId, Users};
pub use vm::{Fault, Flags, Op, Specs, Vm, VmExit};
pub use world::World;
