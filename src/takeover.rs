//! Takeover-from-Secondary routine (spec §4.6): run by a restarting
//! Primary when it finds the Secondary-active marker file present, so it
//! can reclaim the active role instead of starting up alongside an
//! already-active Secondary.

use std::time::Duration;

use tracing::{error, info, warn};

use crate::config::FailoverConfig;
use crate::connection::Connection;
use crate::files;
use crate::protocol::{Request, Subtype};

/// How long this routine waits for the Secondary to acknowledge
/// `PrimIsBack` once the request has been sent (spec §4.6 `wait_request(600)`).
const ACK_TIMEOUT: Duration = Duration::from_secs(600);

/// How long the initial reconnection probe is allowed to take (spec §4.6,
/// §5: "4-second timeout" for the takeover probe).
const CONNECT_TIMEOUT: Duration = Duration::from_secs(4);

/// Outcome of attempting to reclaim the Primary role from an active
/// Secondary (spec §6 exit codes 0/2 map onto this at the binary edge).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TakeoverResult {
    /// No marker, or the Secondary couldn't be reached: proceed with a
    /// normal cold start.
    NoTakeoverNeeded,
    /// The Secondary acknowledged `PrimIsBack` and yielded; this process
    /// continues on to normal Primary startup.
    Reclaimed,
    /// The Secondary was reachable but never yielded; the caller should
    /// exit(2).
    SecondaryDidNotYield,
}

/// Entry point used by `failoverd` at startup.
pub async fn takeover_from_secondary(cfg: &FailoverConfig) -> TakeoverResult {
    takeover_from_secondary_with_timeout(cfg, ACK_TIMEOUT).await
}

async fn takeover_from_secondary_with_timeout(cfg: &FailoverConfig, ack_timeout: Duration) -> TakeoverResult {
    if !files::marker_exists(&cfg.secondary_active_path()) {
        return TakeoverResult::NoTakeoverNeeded;
    }

    let addr = format!("{}:{}", cfg.secondary_host, cfg.server_port);
    let conn = match Connection::connect_timeout(addr, CONNECT_TIMEOUT).await {
        Ok(conn) => conn,
        Err(e) => {
            info!(error = %e, "secondary unreachable; proceeding with normal startup");
            return TakeoverResult::NoTakeoverNeeded;
        }
    };

    reclaim_over(conn, ack_timeout).await
}

async fn reclaim_over(mut conn: Connection, ack_timeout: Duration) -> TakeoverResult {
    if let Err(e) = conn.write_request(Request { subtype: Subtype::PrimIsBack }).await {
        warn!(error = %e, "failed to send PrimIsBack to secondary");
        return TakeoverResult::NoTakeoverNeeded;
    }

    match tokio::time::timeout(ack_timeout, conn.read_reply()).await {
        Ok(Ok(reply)) if reply.is_ok() => {
            info!("secondary acknowledged takeover and yielded");
            TakeoverResult::Reclaimed
        }
        Ok(Ok(reply)) => {
            error!(code = ?reply.code, "secondary responded but did not acknowledge yielding");
            TakeoverResult::SecondaryDidNotYield
        }
        Ok(Err(e)) => {
            error!(error = %e, "lost connection to secondary while awaiting takeover ack");
            TakeoverResult::SecondaryDidNotYield
        }
        Err(_) => {
            error!("timed out waiting for secondary to acknowledge takeover");
            TakeoverResult::SecondaryDidNotYield
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Reply;
    use tempfile::tempdir;
    use tokio::net::TcpListener;

    fn test_config(home: &std::path::Path, port: u16) -> FailoverConfig {
        std::fs::create_dir_all(home.join("server_priv")).unwrap();
        FailoverConfig {
            role: None,
            primary_host: "127.0.0.1".into(),
            secondary_host: "127.0.0.1".into(),
            server_port: port,
            home_path: home.to_path_buf(),
            auth_method: crate::config::AuthMethod::Reserved,
            secondary_delay_secs: 300,
        }
    }

    #[tokio::test]
    async fn no_marker_means_no_takeover_needed() {
        let dir = tempdir().unwrap();
        let cfg = test_config(dir.path(), 9);
        assert_eq!(takeover_from_secondary(&cfg).await, TakeoverResult::NoTakeoverNeeded);
    }

    #[tokio::test]
    async fn unreachable_secondary_with_marker_present_is_a_normal_cold_start() {
        let dir = tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let cfg = test_config(dir.path(), port);
        files::create_marker(&cfg.secondary_active_path(), "secondary.example.com");

        assert_eq!(takeover_from_secondary(&cfg).await, TakeoverResult::NoTakeoverNeeded);
    }

    #[tokio::test]
    async fn secondary_acknowledging_prim_is_back_reclaims_the_role() {
        let dir = tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let cfg = test_config(dir.path(), port);
        files::create_marker(&cfg.secondary_active_path(), "secondary.example.com");

        let secondary_side = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut conn = Connection::new(socket);
            let req = conn.read_request().await.unwrap();
            assert_eq!(req.subtype, Subtype::PrimIsBack);
            conn.write_reply(&Reply::ok()).await.unwrap();
        });

        assert_eq!(takeover_from_secondary(&cfg).await, TakeoverResult::Reclaimed);
        secondary_side.await.unwrap();
    }

    #[tokio::test]
    async fn secondary_dropping_connection_before_ack_is_a_failed_takeover() {
        let dir = tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let cfg = test_config(dir.path(), port);
        files::create_marker(&cfg.secondary_active_path(), "secondary.example.com");

        let secondary_side = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut conn = Connection::new(socket);
            let _ = conn.read_request().await.unwrap();
            conn.shutdown().await;
        });

        let result = takeover_from_secondary_with_timeout(&cfg, Duration::from_millis(200)).await;
        assert_eq!(result, TakeoverResult::SecondaryDidNotYield);
        secondary_side.await.unwrap();
    }

    #[tokio::test]
    async fn secondary_silence_past_the_ack_timeout_is_a_failed_takeover() {
        let dir = tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let cfg = test_config(dir.path(), port);
        files::create_marker(&cfg.secondary_active_path(), "secondary.example.com");

        let secondary_side = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut conn = Connection::new(socket);
            let _ = conn.read_request().await.unwrap();
            // Never reply; hold the connection open past the ack timeout.
            tokio::time::sleep(Duration::from_millis(500)).await;
            let _ = conn;
        });

        let result = takeover_from_secondary_with_timeout(&cfg, Duration::from_millis(100)).await;
        assert_eq!(result, TakeoverResult::SecondaryDidNotYield);
        secondary_side.await.unwrap();
    }
}
