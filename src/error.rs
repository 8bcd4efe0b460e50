//! Error types for the failover core.
//!
//! Most of the crate propagates through [`FailoverError`] because the state
//! machines need to match on *why* something failed (a decode error returns
//! to `NoConn`, a rejected register exits the process). Binary entry points
//! and CLI glue widen this into `anyhow::Result` the way the teacher's
//! `bin/server.rs` widens `mini_redis::Error` at the edges.

use std::io;

use thiserror::Error;

/// Errors recognized by the failover protocol core.
#[derive(Debug, Error)]
pub enum FailoverError {
    /// Transient network failure: connect refused, read EOF mid-stream, etc.
    /// Callers treat this as a state transition, never a process exit.
    #[error("transient network error: {0}")]
    Io(#[from] io::Error),

    /// The peer sent something that doesn't parse as a FailOver request or
    /// reply, or used a subtype outside the closed enumeration.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The connection was closed by the peer before a full message arrived.
    #[error("connection closed by peer")]
    Eof,

    /// The Primary explicitly rejected a Register request.
    #[error("registration rejected by primary: {0}")]
    Rejected(String),

    /// A second Secondary attempted to register while one is already bound.
    #[error("a secondary is already registered")]
    ObjBusy,

    /// The configured STONITH script exited non-zero.
    #[error("fencing script failed for peer {peer}: exit status {status}")]
    Fencing { peer: String, status: i32 },

    /// A filesystem operation on the liveness, marker, or license file failed.
    /// Non-fatal everywhere it's raised; carried as a typed variant so the
    /// call sites can log the path and keep going (see spec §7).
    #[error("filesystem error on {path}: {source}")]
    FileState {
        path: String,
        #[source]
        source: io::Error,
    },

    /// Configuration is unusable (can't resolve a peer hostname, bad home
    /// path, etc). Unlike the variants above, this is unrecoverable.
    #[error("configuration error: {0}")]
    Configuration(String),
}

pub type Result<T> = std::result::Result<T, FailoverError>;
