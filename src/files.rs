//! Filesystem-mediated signals: the liveness file, the Secondary-active
//! marker, and the license binding file (spec §3, §6).
//!
//! All operations here are best-effort from the caller's point of view:
//! errors are returned as [`FailoverError::FileState`] so call sites can log
//! and continue per spec §7, rather than bubbling up as fatal.

use std::io;
use std::path::Path;
use std::time::SystemTime;

use tracing::warn;

use crate::error::FailoverError;

fn wrap(path: &Path, source: io::Error) -> FailoverError {
    FailoverError::FileState {
        path: path.display().to_string(),
        source,
    }
}

/// Touches the liveness file's mtime, creating it if absent. Logged and
/// swallowed on failure by the caller (the heartbeat driver never treats
/// this as fatal).
pub fn touch_liveness(path: &Path) -> Result<(), FailoverError> {
    match std::fs::OpenOptions::new().create(true).write(true).open(path) {
        Ok(file) => {
            let now = SystemTime::now();
            file.set_modified(now).map_err(|e| wrap(path, e))?;
            Ok(())
        }
        Err(e) => Err(wrap(path, e)),
    }
}

/// Returns the liveness file's mtime, if it can be stat'd.
pub fn liveness_mtime(path: &Path) -> Result<SystemTime, FailoverError> {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map_err(|e| wrap(path, e))
}

/// Returns whether the Secondary-active marker file currently exists.
pub fn marker_exists(path: &Path) -> bool {
    path.exists()
}

/// Creates the Secondary-active marker file, writing `hostname\n` as its
/// contents. Best-effort: a write failure is logged, the takeover proceeds
/// anyway (spec §4.2 step 5 — the marker is an optimization for a
/// restarting Primary, not a correctness requirement on its own).
pub fn create_marker(path: &Path, hostname: &str) {
    if let Err(e) = std::fs::write(path, format!("{hostname}\n")) {
        warn!(path = %path.display(), error = %e, "failed to create secondary-active marker");
    }
}

/// Removes the Secondary-active marker file. Called by the Secondary when
/// it acknowledges a `PrimIsBack` directive and yields control.
pub fn remove_marker(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove secondary-active marker"),
    }
}

/// Reads the hostname recorded in the marker file, if present.
pub fn read_marker(path: &Path) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|s| s.trim_end().to_string())
}

/// Persists `primary_hostid XOR local_hostid` to `license.fo`, mode 0600
/// (spec §3, §6). Written exactly once, after a successful Register.
pub fn write_license(path: &Path, xored: u64) -> Result<(), FailoverError> {
    let bytes = xored.to_ne_bytes();
    std::fs::write(path, bytes).map_err(|e| wrap(path, e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .map_err(|e| wrap(path, e))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::TryInto;
    use std::thread::sleep;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn touch_creates_and_advances_mtime() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("svrlive");

        touch_liveness(&path).unwrap();
        let first = liveness_mtime(&path).unwrap();

        sleep(Duration::from_millis(20));
        touch_liveness(&path).unwrap();
        let second = liveness_mtime(&path).unwrap();

        assert!(second >= first);
    }

    #[test]
    fn marker_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("secondary_active");

        assert!(!marker_exists(&path));
        create_marker(&path, "secondary.example.com");
        assert!(marker_exists(&path));
        assert_eq!(read_marker(&path).as_deref(), Some("secondary.example.com"));

        remove_marker(&path);
        assert!(!marker_exists(&path));
    }

    #[test]
    fn remove_marker_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("secondary_active");
        remove_marker(&path);
        remove_marker(&path);
    }

    #[test]
    fn license_file_round_trips_xor() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("license.fo");

        let primary: u64 = 0xDEAD_BEEF_0000_1111;
        let secondary: u64 = 0x1234_5678_9ABC_DEF0;
        write_license(&path, primary ^ secondary).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let stored = u64::from_ne_bytes(bytes.try_into().unwrap());
        assert_eq!(stored ^ secondary, primary);
    }
}
