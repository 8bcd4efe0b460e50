//! Failover coordination core for a two-peer batch-job server cluster.
//!
//! Two peers — a Primary and a Secondary — run the same binary in
//! different roles and agree on which of them is the authoritative,
//! "active" server, without an external coordinator and without
//! split-brain. This crate is the coordination core: the protocol codec,
//! the two state machines, the takeover-from-Secondary restart path, and
//! the fencing gate that guards a unilateral takeover. It deliberately does
//! not include the batch-job server itself, job submission, or credential
//! propagation — those are external collaborators this core assumes.
//!
//! Layout mirrors the dependency order of the components themselves,
//! leaves first:
//!
//! - [`protocol`]: the wire format (one tagged subtype per request; a
//!   status code plus optional text per reply).
//! - [`connection`]: a framed `TcpStream` wrapper built on top of it.
//! - [`files`]: the filesystem-mediated signals (liveness mtime, the
//!   Secondary-active marker, the license-binding file).
//! - [`fencing`]: the STONITH hook consulted before a unilateral takeover.
//! - [`hostid`]: derivation of a stable per-machine identifier.
//! - [`secondary`]: the Secondary State Machine.
//! - [`primary`]: the Primary Heartbeat Driver and registration handler.
//! - [`takeover`]: the Takeover-from-Secondary routine run by a restarting
//!   Primary.
//! - [`config`]: layered configuration loading.
//! - [`shutdown`]: a broadcast-backed graceful shutdown signal, shared by
//!   both roles' binaries.

pub mod config;
pub mod connection;
pub mod error;
pub mod fencing;
pub mod files;
pub mod hostid;
pub mod primary;
pub mod protocol;
pub mod secondary;
pub mod shutdown;
pub mod takeover;

pub use error::{FailoverError, Result};

/// Seconds between Primary heartbeat ticks. The Secondary declares a
/// handshake timeout after `2 * HANDSHAKE_TIME` seconds without one.
pub const HANDSHAKE_TIME: u64 = 5;
