//! STONITH fencing hook (spec §4.5): a gate the Secondary must pass before
//! declaring a unilateral takeover, so a partitioned-but-still-running
//! Primary can't keep serving alongside a newly active Secondary.

use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::{info, warn};

/// Outcome of a fencing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FencingOutcome {
    /// No `stonith` script is installed; takeover proceeds unguarded.
    Skipped,
    /// The script ran and exited 0: the peer is confirmed down.
    Confirmed,
    /// The script ran and exited non-zero: the peer could not be confirmed
    /// down. The caller must retry after a backoff (spec §4.5, §8 S5).
    Failed,
}

/// Invokes `<home>/server_priv/stonith <peer_host>` if present, capturing
/// combined stdout+stderr into a spool file, logging it, then unlinking the
/// spool file (spec §4.5, §6). `spool_dir` is where the transient capture
/// file is written; `pid` makes its name unique per invocation.
pub async fn check_and_invoke(
    stonith_script: &Path,
    spool_dir: &Path,
    peer_host: &str,
    pid: u32,
) -> FencingOutcome {
    if !stonith_script.exists() {
        info!("skipping STONITH: no script installed");
        return FencingOutcome::Skipped;
    }

    let spool_file: PathBuf = spool_dir.join(format!("stonith_out_err_fl_{peer_host}_{pid}"));

    info!(peer = %peer_host, "executing STONITH script to confirm peer is down");

    let output = Command::new(stonith_script).arg(peer_host).output().await;

    let (status_code, captured) = match output {
        Ok(out) => {
            let mut combined = out.stdout;
            combined.extend_from_slice(&out.stderr);
            (out.status.code().unwrap_or(-1), combined)
        }
        Err(e) => {
            warn!(error = %e, "failed to execute STONITH script");
            (-1, Vec::new())
        }
    };

    // Best-effort spool-file bookkeeping: write what we captured, read it
    // back the way the original does (so a future out-of-process reader of
    // the spool file sees the same content), then unlink it. Failure here
    // is non-fatal.
    let _ = std::fs::write(&spool_file, &captured);
    if let Ok(text) = std::fs::read_to_string(&spool_file) {
        let trimmed = text.trim_end_matches(['\n', '\r']);
        if !trimmed.is_empty() {
            info!(output = %trimmed, exit_code = status_code, "STONITH script output");
        }
    }
    let _ = std::fs::remove_file(&spool_file);

    if status_code == 0 {
        info!("STONITH script executed successfully");
        FencingOutcome::Confirmed
    } else {
        warn!(exit_code = status_code, "STONITH script execution failed");
        FencingOutcome::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn missing_script_is_skipped() {
        let dir = tempdir().unwrap();
        let outcome = check_and_invoke(
            &dir.path().join("no-such-stonith"),
            dir.path(),
            "peer.example.com",
            1234,
        )
        .await;
        assert_eq!(outcome, FencingOutcome::Skipped);
    }

    #[tokio::test]
    async fn zero_exit_confirms_peer_down() {
        let dir = tempdir().unwrap();
        let script = write_script(dir.path(), "stonith", "#!/bin/sh\necho confirmed\nexit 0\n");

        let outcome = check_and_invoke(&script, dir.path(), "peer.example.com", 4321).await;
        assert_eq!(outcome, FencingOutcome::Confirmed);
    }

    #[tokio::test]
    async fn nonzero_exit_fails_and_leaves_no_spool_file() {
        let dir = tempdir().unwrap();
        let script = write_script(dir.path(), "stonith", "#!/bin/sh\necho nope 1>&2\nexit 1\n");

        let outcome = check_and_invoke(&script, dir.path(), "peer.example.com", 777).await;
        assert_eq!(outcome, FencingOutcome::Failed);

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("stonith_out_err_fl_"))
            .collect();
        assert!(leftovers.is_empty(), "no transient spool file should survive");
    }
}
