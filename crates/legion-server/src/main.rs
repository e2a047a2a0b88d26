// SPDX-License-Identifier: Apache-2.0
//! Headless Legion world server: owns the `World`, runs the tick loop, and
//! speaks the cmd/ack/state protocol over a Unix socket.

use anyhow::{Context, Result};
use clap::Parser;
use legion_config::{ConfigService, FsConfigStore, ListenerPrefs, LISTENER_PREFS_KEY};
use legion_core::mod_registry::LineIndex;
use legion_core::save::{FileBackend, SaveBackend};
use legion_core::{brain, Coord, ItemId, Specs, World};
use legion_proto::{
    default_socket_path,
    wire::{decode_frame, encode_frame},
    Ack, AtomsDelta, ChunkDelta, Cmd, CompileResult, Speed, State, WorldMeta,
};
use rand::Rng;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Headless Legion simulation server.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Unix socket path to listen on. Defaults to the platform runtime dir.
    #[arg(long)]
    listen: Option<PathBuf>,

    /// Durable save file. If present on startup, the world is reloaded from
    /// it instead of being freshly generated; `Cmd::Save`/`Cmd::Load` target
    /// this same path for the lifetime of the process.
    #[arg(long)]
    save: Option<PathBuf>,

    /// World generation seed, for deterministic, reproducible worlds.
    #[arg(long, default_value_t = 1)]
    seed: u64,

    /// Initial simulation speed (slow, normal, fast, faster, fastest).
    #[arg(long, default_value = "normal")]
    speed: String,
}

fn parse_speed(value: &str) -> Speed {
    match value.to_ascii_lowercase().as_str() {
        "slow" => Speed::Slow,
        "fast" => Speed::Fast,
        "faster" => Speed::Faster,
        "fastest" => Speed::Fastest,
        _ => Speed::Normal,
    }
}

fn tick_interval(speed: Speed) -> Duration {
    let base_ms = 250.0;
    let mult = match speed {
        Speed::Slow => 0.25,
        Speed::Normal => 1.0,
        Speed::Fast => 2.0,
        Speed::Faster => 4.0,
        Speed::Fastest => 8.0,
    };
    Duration::from_millis((base_ms / mult) as u64)
}

const WORKER_COUNT: u32 = 4;

struct ConnState {
    tx: tokio::sync::mpsc::Sender<Vec<u8>>,
    ack: Ack,
    selected_chunk: Option<Coord>,
    selected_mod: Option<u32>,
    /// The registered-user identity this connection authenticated as, via
    /// `Cmd::User`/`Cmd::Auth`. Distinct from the per-connection `user_id`
    /// handed out at accept time, which only keys chunk ownership/home.
    auth_user: Option<u8>,
    pending_compile: Option<CompileResult>,
}

struct ServerState {
    world: World,
    speed: Speed,
    next_conn_id: u64,
    next_user_id: u64,
    conns: HashMap<u64, ConnState>,
    save_backend: Option<FileBackend>,
}

impl ServerState {
    fn new(world: World, speed: Speed, save_backend: Option<FileBackend>) -> Self {
        Self {
            world,
            speed,
            next_conn_id: 0,
            next_user_id: 1,
            conns: HashMap::new(),
            save_backend,
        }
    }
}

/// Baseline solar output and kwheel element count for a chunk's star,
/// drawn from its generated sector entry (falling back to a bare minimum
/// if the coordinate doesn't line up with a generated star).
fn star_energy_of(world: &mut World, coord: Coord) -> (u64, u16) {
    const BASE_SOLAR: u64 = 1_000_000;
    let sector = world.sector(coord);
    sector
        .stars
        .iter()
        .find(|s| s.coord == coord)
        .map_or((BASE_SOLAR, 0), |s| {
            (BASE_SOLAR, (s.elements[0] % u32::from(u16::MAX)) as u16)
        })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    let config: Option<ConfigService<FsConfigStore>> =
        FsConfigStore::new().map(ConfigService::new).ok();
    let mut prefs: ListenerPrefs = config
        .as_ref()
        .and_then(|c| c.load::<ListenerPrefs>(LISTENER_PREFS_KEY).ok().flatten())
        .unwrap_or_default();

    let socket_path = cli.listen.clone().unwrap_or_else(|| {
        prefs
            .listen
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(default_socket_path)
    });
    prefs.listen = Some(socket_path.display().to_string());
    if let Some(path) = &cli.save {
        prefs.save_path = Some(path.display().to_string());
    }
    if let Some(cfg) = &config {
        if let Err(err) = cfg.save(LISTENER_PREFS_KEY, &prefs) {
            warn!(?err, "failed to persist listener prefs");
        }
    }

    let save_path = cli.save.clone().or_else(|| prefs.save_path.clone().map(PathBuf::from));
    let save_backend = save_path.map(FileBackend::new);
    let world = match &save_backend {
        Some(backend) => match backend.load() {
            Ok(Some(bytes)) => match World::load(&bytes) {
                Ok(world) => {
                    info!(seed = world.seed(), "loaded world from save");
                    world
                }
                Err(err) => {
                    warn!(?err, "save file is corrupt, generating a fresh world");
                    World::new(cli.seed)
                }
            },
            Ok(None) => World::new(cli.seed),
            Err(err) => {
                warn!(?err, "failed to read save file, generating a fresh world");
                World::new(cli.seed)
            }
        },
        None => World::new(cli.seed),
    };

    let state = Arc::new(Mutex::new(ServerState::new(
        world,
        parse_speed(&cli.speed),
        save_backend,
    )));

    let _ = std::fs::remove_file(&socket_path);
    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("binding socket at {}", socket_path.display()))?;
    info!(path = %socket_path.display(), seed = cli.seed, "legion-server listening");

    let tick_state = state.clone();
    tokio::spawn(async move {
        tick_loop(tick_state).await;
    });

    loop {
        let (stream, _) = listener.accept().await?;
        let conn_state = state.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_client(stream, conn_state).await {
                warn!(?err, "client handler error");
            }
        });
    }
}

async fn tick_loop(state: Arc<Mutex<ServerState>>) {
    loop {
        let interval = {
            let guard = state.lock().await;
            tick_interval(guard.speed)
        };
        tokio::time::sleep(interval).await;

        let mut guard = state.lock().await;

        // Sector generation is lazy and mutates `World`, so star energies
        // are resolved up front into a plain map `step`'s closure can read
        // without itself needing mutable access to `World`.
        let coords = guard.world.chunk_coords();
        let mut energies = HashMap::with_capacity(coords.len());
        for coord in coords {
            energies.insert(coord, star_energy_of(&mut guard.world, coord));
        }

        guard
            .world
            .step(|coord| energies.get(&coord).copied().unwrap_or((0, 0)));
        for conn in guard.conns.values() {
            let _ = conn.tx.try_send(Vec::new());
        }
    }
}

async fn handle_client(stream: UnixStream, state: Arc<Mutex<ServerState>>) -> Result<()> {
    let (mut reader, writer) = tokio::io::split(stream);

    let (tx, mut rx) = tokio::sync::mpsc::channel::<Vec<u8>>(256);
    let (conn_id, user_id, home) = {
        let mut guard = state.lock().await;
        let conn_id = guard.next_conn_id;
        guard.next_conn_id += 1;
        let user_id = guard.next_user_id;
        guard.next_user_id += 1;
        guard.conns.insert(
            conn_id,
            ConnState {
                tx,
                ack: Ack::default(),
                selected_chunk: None,
                selected_mod: None,
                auth_user: None,
                pending_compile: None,
            },
        );
        let home = Coord::new(conn_id as u32 * 1000, 0);
        guard.world.populate_user(user_id, home, WORKER_COUNT);
        (conn_id, user_id, home)
    };

    tokio::spawn(async move {
        let mut ws = writer;
        while let Some(buf) = rx.recv().await {
            if buf.is_empty() {
                continue;
            }
            if ws.write_all(&buf).await.is_err() {
                break;
            }
        }
    });

    const MAX_PAYLOAD: usize = 8 * 1024 * 1024;
    let mut read_buf = vec![0u8; 16 * 1024];
    let mut acc: Vec<u8> = Vec::with_capacity(32 * 1024);
    loop {
        let n = reader.read(&mut read_buf).await?;
        if n == 0 {
            break;
        }
        acc.extend_from_slice(&read_buf[..n]);

        loop {
            if acc.len() >= 4 {
                let len = u32::from_be_bytes([acc[0], acc[1], acc[2], acc[3]]) as usize;
                if len > MAX_PAYLOAD {
                    warn!(conn_id, len, "payload too large, dropping connection");
                    return Ok(());
                }
            }
            match decode_frame::<Cmd>(&acc) {
                Ok(Some((cmd, used))) => {
                    acc.drain(..used);
                    if matches!(cmd, Cmd::Quit) {
                        return Ok(());
                    }
                    if let Err(err) = handle_cmd(cmd, conn_id, user_id, home, &state).await {
                        warn!(?err, conn_id, "dropping connection after command error");
                        return Ok(());
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(?err, conn_id, "malformed frame, dropping connection");
                    return Ok(());
                }
            }
        }
    }

    let mut guard = state.lock().await;
    guard.conns.remove(&conn_id);
    Ok(())
}

async fn handle_cmd(
    cmd: Cmd,
    conn_id: u64,
    user_id: u64,
    home: Coord,
    state: &Arc<Mutex<ServerState>>,
) -> Result<()> {
    match cmd {
        Cmd::Nil => Ok(()),
        Cmd::Ack(ack) => {
            let mut guard = state.lock().await;
            if let Some(conn) = guard.conns.get_mut(&conn_id) {
                conn.ack = ack;
            }
            send_state(&mut guard, conn_id, user_id, home).await
        }
        Cmd::Speed(speed) => {
            let mut guard = state.lock().await;
            guard.speed = speed;
            Ok(())
        }
        Cmd::Chunk(coord) => {
            let mut guard = state.lock().await;
            if let Some(conn) = guard.conns.get_mut(&conn_id) {
                conn.selected_chunk = Some(coord);
            }
            Ok(())
        }
        // `Cmd::Quit` never reaches here: `handle_client` intercepts it
        // before calling `handle_cmd` so the connection can close cleanly.
        Cmd::Quit => Ok(()),
        Cmd::Save => {
            let mut guard = state.lock().await;
            let Some(backend) = guard.save_backend.as_mut() else {
                warn!(conn_id, "save requested but no save path is configured");
                return Ok(());
            };
            let bytes = guard.world.save();
            if let Err(err) = backend.store(&bytes) {
                warn!(?err, conn_id, "failed to write save file");
            }
            Ok(())
        }
        Cmd::Load => {
            let mut guard = state.lock().await;
            let Some(backend) = guard.save_backend.as_ref() else {
                warn!(conn_id, "load requested but no save path is configured");
                return Ok(());
            };
            match backend.load() {
                Ok(Some(bytes)) => match World::load(&bytes) {
                    Ok(world) => {
                        guard.world = world;
                        info!(conn_id, "reloaded world from save");
                    }
                    Err(err) => warn!(?err, conn_id, "save file is corrupt, ignoring load"),
                },
                Ok(None) => warn!(conn_id, "load requested but no save file exists yet"),
                Err(err) => warn!(?err, conn_id, "failed to read save file"),
            }
            Ok(())
        }
        Cmd::User { server_token, symbol } => {
            let mut guard = state.lock().await;
            if !guard.world.users().auth_server(server_token) {
                warn!(conn_id, "user registration rejected: bad server token");
                return Ok(());
            }
            let atom = guard.world.atoms_mut().atom(&symbol);
            let mut rng = rand::thread_rng();
            let public: u64 = rng.gen();
            let private: u64 = rng.gen();
            match guard.world.users_mut().create(atom, public, private) {
                Some(id) => {
                    // The wire protocol carries no reply for a freshly
                    // registered user's id/tokens; they're surfaced here for
                    // an operator to relay out of band, same as the
                    // original's single-process, locally-readable `users`
                    // table.
                    info!(conn_id, user = id, public, private, "registered user");
                    if let Some(conn) = guard.conns.get_mut(&conn_id) {
                        conn.auth_user = Some(id);
                    }
                }
                None => warn!(conn_id, symbol, "user registration failed: symbol taken or registry full"),
            }
            Ok(())
        }
        Cmd::Auth { server_token, user_id, private_token } => {
            let mut guard = state.lock().await;
            if !guard.world.users().auth_server(server_token) {
                warn!(conn_id, "auth rejected: bad server token");
                return Ok(());
            }
            let Ok(id) = u8::try_from(user_id) else {
                warn!(conn_id, user_id, "auth rejected: id out of range");
                return Ok(());
            };
            if guard.world.users().auth_user(id, private_token) {
                if let Some(conn) = guard.conns.get_mut(&conn_id) {
                    conn.auth_user = Some(id);
                }
            } else {
                warn!(conn_id, user = id, "auth rejected: bad private token");
            }
            Ok(())
        }
        Cmd::Mod(major) => {
            let mut guard = state.lock().await;
            if let Some(conn) = guard.conns.get_mut(&conn_id) {
                conn.selected_mod = Some(major);
            }
            Ok(())
        }
        Cmd::ModRegister { symbol } => {
            let mut guard = state.lock().await;
            let major = guard.world.mods_mut().register(&symbol);
            if let Some(conn) = guard.conns.get_mut(&conn_id) {
                conn.selected_mod = Some(major);
            }
            Ok(())
        }
        Cmd::ModPublish { major } => {
            let mut guard = state.lock().await;
            let coord = guard
                .conns
                .get(&conn_id)
                .and_then(|conn| conn.selected_chunk)
                .unwrap_or(home);
            let Some(chunk) = guard.world.chunk_mut(coord) else {
                warn!(conn_id, ?coord, "mod publish: no chunk allocated there");
                return Ok(());
            };
            // `mod_version: None` always tracks the module's latest stored
            // version, so a later `mod_compile` takes effect on the next
            // tick without republishing.
            brain::spawn(&mut chunk.machines, Specs { stack_cap: 64, speed: 64 }, major, None);
            Ok(())
        }
        Cmd::ModCompile { major, source } => {
            let mut guard = state.lock().await;
            let len = source.len() as u32;
            let index = vec![LineIndex { line: 0, byte: 0 }, LineIndex { line: 1, byte: len }];
            match guard.world.mods_mut().store(major, source, Vec::new(), index) {
                Some(version) => {
                    if let Some(conn) = guard.conns.get_mut(&conn_id) {
                        conn.pending_compile = Some(CompileResult { major, version, errors: Vec::new() });
                    }
                }
                None => warn!(conn_id, major, "mod compile: module id not registered"),
            }
            Ok(())
        }
        Cmd::Io { io_code: _, dst_id, args } => {
            let mut guard = state.lock().await;
            let coord = guard
                .conns
                .get(&conn_id)
                .and_then(|conn| conn.selected_chunk)
                .unwrap_or(home);
            let Some(chunk) = guard.world.chunk_mut(coord) else {
                warn!(conn_id, ?coord, "io: no chunk allocated there");
                return Ok(());
            };
            let Some((brain, _)) = chunk.machines.get_mut(ItemId::from_u16(dst_id)) else {
                warn!(conn_id, dst_id, "io: no machine at that id");
                return Ok(());
            };
            if let Err(fault) = brain.io_resume(&args) {
                warn!(conn_id, dst_id, ?fault, "io reply rejected by machine");
            }
            Ok(())
        }
    }
}

async fn send_state(
    guard: &mut tokio::sync::MutexGuard<'_, ServerState>,
    conn_id: u64,
    user_id: u64,
    home: Coord,
) -> Result<()> {
    let (ack, selected_chunk, selected_mod, compile) = guard
        .conns
        .get_mut(&conn_id)
        .map(|conn| (conn.ack.clone(), conn.selected_chunk, conn.selected_mod, conn.pending_compile.take()))
        .unwrap_or_default();

    let meta = WorldMeta {
        seed: guard.world.seed(),
        time: guard.world.time(),
        speed: guard.speed,
        home: guard.world.home(user_id).unwrap_or(home),
    };
    let atoms = AtomsDelta {
        entries: guard
            .world
            .atoms_mut()
            .delta(ack.atoms_len)
            .map(|(id, symbol)| (id, symbol.to_owned()))
            .collect(),
    };
    let selected_chunk = selected_chunk
        .filter(|coord| guard.world.chunk(*coord).is_some())
        .map(|coord| ChunkDelta {
            coord,
            ..Default::default()
        });

    let state_record = State {
        meta,
        atoms,
        mods: Vec::new(),
        chunks: Vec::new(),
        lanes: Vec::new(),
        tech: Vec::new(),
        log: Vec::new(),
        compile,
        selected_mod,
        selected_chunk,
    };
    let Some(conn) = guard.conns.get(&conn_id) else {
        return Ok(());
    };
    let frame = encode_frame(&state_record)?;
    let _ = conn.tx.send(frame).await;
    Ok(())
}
