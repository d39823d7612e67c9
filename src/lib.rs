//! Botlink Server Library
//!
//! Coordinates autonomous bot clients controlling entities inside a live,
//! tick-driven simulation, and reconstructs their recorded behavior for
//! offline inspection.
//!
//! The two halves:
//!
//! - a connection and tick-synchronization server that admits many
//!   concurrent bot clients, funnels their asynchronous requests onto the
//!   single simulation thread, and broadcasts per-tick state snapshots
//!   while tolerating partial per-client failure
//! - a tick-indexed replay engine that answers point-in-time queries
//!   (alive at tick T? path up to T? just spawned/despawned?) over the
//!   sparse per-entity history the server records

pub mod config;
pub mod net;
pub mod replay;
pub mod server;
pub mod sim;
pub mod util;

/// Identity of one bot connection; unique for the lifetime of a session and
/// reused only after explicit teardown
pub type ClientId = i64;

/// Identity of one simulation entity
pub type EntityId = i64;

/// Reserved client id for main-thread tasks not associated with any bot
/// (run start/stop, pending spawns)
pub const CONTROL_CLIENT: ClientId = i64::MAX;
