// SPDX-License-Identifier: Apache-2.0
//! Wire schema for the cmd/ack/state protocol: the command stream a client
//! sends to the simulation server, and the delta-scoped state stream the
//! server replies with.
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
    clippy::module_name_repetitions,
    clippy::use_self
)]

mod canonical;
pub mod wire;

pub use canonical::{decode_value, encode_value, CanonError};

use legion_core::Coord;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Default Unix socket path for the simulation server.
///
/// Prefers a per-user runtime dir (`XDG_RUNTIME_DIR`) and falls back to
/// `/tmp` when unavailable.
#[must_use]
pub fn default_socket_path() -> PathBuf {
    std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("legion.sock")
}

/// Simulation speed multiplier, selectable via [`Cmd::Speed`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Speed {
    /// 0.25x.
    Slow,
    /// 1x.
    Normal,
    /// 2x.
    Fast,
    /// 4x.
    Faster,
    /// 8x.
    Fastest,
}

/// Commands a client sends to the server, one per magic-framed record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Cmd {
    /// No-op, used as a keepalive.
    Nil,
    /// Disconnects the session.
    Quit,
    /// Requests a durable save of the world.
    Save,
    /// Requests a reload of the world from its durable save.
    Load,
    /// Registers (or re-authenticates) a user symbol against the server.
    User {
        /// Shared server token presented by every client.
        server_token: u64,
        /// The user's chosen symbol.
        symbol: String,
    },
    /// Authenticates an existing user.
    Auth {
        /// Shared server token.
        server_token: u64,
        /// The user id being authenticated.
        user_id: u64,
        /// The user's private token.
        private_token: u64,
    },
    /// Submits an updated ack, describing what state this client has seen.
    Ack(Ack),
    /// Selects the simulation speed.
    Speed(Speed),
    /// Selects the chunk this client is viewing.
    Chunk(Coord),
    /// Selects a module as the client's active editing target.
    Mod(u32),
    /// Registers a new module under the given symbol.
    ModRegister {
        /// Module name.
        symbol: String,
    },
    /// Publishes the latest compiled version of a module into the world.
    ModPublish {
        /// Module id.
        major: u32,
    },
    /// Submits source for a module to be compiled.
    ModCompile {
        /// Module id.
        major: u32,
        /// Raw source bytes.
        source: Vec<u8>,
    },
    /// Injects an I/O event directly into a running machine, bypassing the
    /// simulation's own I/O port matching (used for manual control/testing).
    Io {
        /// The I/O opcode being delivered.
        io_code: u16,
        /// The target machine's packed id.
        dst_id: u16,
        /// Argument words.
        args: Vec<u64>,
    },
}

/// A client's acknowledgement of the server state it has already seen.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Ack {
    /// The stream id this ack was built against; a mismatch with the
    /// server's current stream id forces a full resync.
    pub stream_id: u64,
    /// Last world tick this client received.
    pub time: u64,
    /// Number of atoms this client already knows.
    pub atoms_len: u64,
    /// Ack for the client's currently selected chunk, if any.
    pub chunk: Option<ChunkAck>,
}

/// A client's acknowledgement of one chunk's logistics state.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChunkAck {
    /// The acked chunk's coordinate.
    pub coord: Coord,
    /// Last chunk-local tick this client received.
    pub time: u64,
    /// Ring head the client has consumed up to, for `requested`.
    pub requested_head: u32,
    /// Ring head the client has consumed up to, for `storage`.
    pub storage_head: u32,
    /// Ring heads per `provided[resource]` queue.
    pub provided_heads: BTreeMap<u16, u32>,
    /// Content hash per active item kind the client already has.
    pub active_hashes: BTreeMap<u8, [u8; 32]>,
    /// Content hash of the pill registry the client already has.
    pub pills_hash: [u8; 32],
}

/// World-level metadata sent at the head of every state record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorldMeta {
    /// The world's generation seed.
    pub seed: u64,
    /// Current tick.
    pub time: u64,
    /// Current simulation speed.
    pub speed: Speed,
    /// The receiving user's home chunk.
    pub home: Coord,
}

/// A delta of newly registered atoms, `id >= ack.atoms_len`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AtomsDelta {
    /// `(id, symbol)` pairs in ascending id order.
    pub entries: Vec<(u64, String)>,
}

/// One module's summary, as listed in a state record's mod list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModSummary {
    /// Module id.
    pub major: u32,
    /// Module name.
    pub name: String,
    /// Latest stored version.
    pub version: u16,
    /// Whether the latest version has compile errors.
    pub has_errors: bool,
}

/// A compile error, line-attached, as returned from [`Cmd::ModCompile`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompileError {
    /// Source line the error applies to.
    pub line: u32,
    /// Human-readable message.
    pub message: String,
}

/// The result of compiling a module upload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompileResult {
    /// Module id compiled.
    pub major: u32,
    /// Version assigned to this upload.
    pub version: u16,
    /// Compile errors, empty on success.
    pub errors: Vec<CompileError>,
}

/// A chunk's coordinate and last-updated tick, for the state record's
/// "chunks newer than `ack.time`" set.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkSummary {
    /// Chunk coordinate.
    pub coord: Coord,
    /// Tick this chunk was last updated.
    pub time: u64,
}

/// A fault or delivery log entry, delta-scoped to `time > ack.time`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogEntry {
    /// Tick the event was recorded at.
    pub time: u64,
    /// Chunk the event concerns.
    pub star: Coord,
    /// Packed item id involved.
    pub id: u16,
    /// I/O operation kind.
    pub io: u16,
    /// Error code, or `0` for a non-error event.
    pub err: u16,
}

/// A delta-encoded view of one ring (`requested`, `storage`, or a single
/// `provided[resource]` queue): just the entries between the client's
/// acked head and the current head.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RingDelta {
    /// New head position after this delta.
    pub head: u32,
    /// Entries from the old head (exclusive) to the new head (inclusive),
    /// `None` marking a slot cleared by reset.
    pub entries: Vec<Option<u16>>,
}

/// A delta-encoded snapshot of the client's currently selected chunk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkDelta {
    /// The chunk's coordinate.
    pub coord: Coord,
    /// Delta of the `requested` ring.
    pub requested: RingDelta,
    /// Delta of the `storage` ring.
    pub storage: RingDelta,
    /// Deltas of each `provided[resource]` ring, only for resources whose
    /// ring changed.
    pub provided: BTreeMap<u16, RingDelta>,
    /// Active item kinds whose content hash differs from the client's ack,
    /// fully retransmitted.
    pub active: BTreeMap<u8, Vec<u8>>,
    /// The full pill registry, only present if its hash differs from the
    /// client's ack.
    pub pills: Option<Vec<(Coord, u16, u32)>>,
}

/// A full state record sent from server to client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct State {
    /// World metadata.
    pub meta: WorldMeta,
    /// Atoms registered since the client's ack.
    pub atoms: AtomsDelta,
    /// Modules visible to this client.
    pub mods: Vec<ModSummary>,
    /// Chunks updated since the client's ack.
    pub chunks: Vec<ChunkSummary>,
    /// Lanes touching a chunk in the client's access set.
    pub lanes: Vec<(Coord, Coord)>,
    /// The client's unlocked technology ids.
    pub tech: Vec<u16>,
    /// Log entries recorded since the client's ack.
    pub log: Vec<LogEntry>,
    /// Result of the client's most recent `mod_compile`, if any.
    pub compile: Option<CompileResult>,
    /// The client's currently selected module, if any.
    pub selected_mod: Option<u32>,
    /// Delta of the client's currently selected chunk, if any.
    pub selected_chunk: Option<ChunkDelta>,
}

/// A protocol-level error reported to a client (handshake failure, bad
/// command, validation failure).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProtoError {
    /// Numeric error code.
    pub code: u32,
    /// Stable machine-readable identifier, e.g. `"E_BAD_TOKEN"`.
    pub name: String,
    /// Human-readable message.
    pub message: String,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn ack_chunk_ack_defaults_to_full_resync_shape() {
        let ack = Ack::default();
        assert_eq!(ack.stream_id, 0);
        assert!(ack.chunk.is_none());
    }

    /// S6 — two acks that diverge only in `time` produce state records
    /// whose log/chunks deltas are scoped differently, but whose `meta`
    /// converges once both clients have caught up to the same tick.
    #[test]
    fn s6_state_delta_converges_once_acks_match() {
        let meta = WorldMeta {
            seed: 1,
            time: 10,
            speed: Speed::Normal,
            home: Coord::new(0, 0),
        };

        let behind = State {
            meta: meta.clone(),
            atoms: AtomsDelta::default(),
            mods: vec![],
            chunks: vec![ChunkSummary {
                coord: Coord::new(1, 1),
                time: 9,
            }],
            lanes: vec![],
            tech: vec![],
            log: vec![LogEntry {
                time: 9,
                star: Coord::new(1, 1),
                id: 1,
                io: 1,
                err: 0,
            }],
            compile: None,
            selected_mod: None,
            selected_chunk: None,
        };
        let caught_up = State {
            chunks: vec![],
            log: vec![],
            ..behind.clone()
        };

        assert_eq!(behind.meta, caught_up.meta);
        assert_ne!(behind.chunks, caught_up.chunks);
    }

    #[test]
    fn cmd_roundtrips_through_canonical_cbor() {
        let cmd = Cmd::ModRegister {
            symbol: "miner".to_owned(),
        };
        let bytes = wire::to_cbor(&cmd).unwrap();
        let decoded: Cmd = wire::from_cbor(&bytes).unwrap();
        assert_eq!(decoded, cmd);
    }
}
