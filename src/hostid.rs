//! Host identifier derivation.
//!
//! The original implementation calls into a platform-specific
//! `pbs_get_hostid()` that reads a hardware-derived identifier (historically
//! the host's primary IPv4 address on most Unixes). We don't have a
//! hardware register to read here, so we derive a stable, process-external
//! identifier from the local hostname, which is the portable analogue: it's
//! stable across restarts of the same machine and distinct across machines,
//! which is all the protocol actually requires (spec §3).

use std::convert::TryInto;

use sha2::{Digest, Sha256};

/// Returns this machine's host identifier as an unsigned integer.
///
/// Hashes the local hostname with SHA-256 and takes the first 8 bytes as a
/// big-endian `u64`. Two peers with different hostnames get different ids
/// with overwhelming probability; the same peer gets the same id across
/// restarts.
pub fn local_hostid() -> u64 {
    hostid_for(&hostname::get().map(|h| h.to_string_lossy().into_owned()).unwrap_or_default())
}

pub(crate) fn hostid_for(name: &str) -> u64 {
    let digest = Sha256::digest(name.as_bytes());
    u64::from_be_bytes(digest[..8].try_into().expect("digest is at least 8 bytes"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_hostname_hashes_the_same() {
        assert_eq!(hostid_for("server-a"), hostid_for("server-a"));
    }

    #[test]
    fn different_hostnames_hash_differently() {
        assert_ne!(hostid_for("server-a"), hostid_for("server-b"));
    }
}
