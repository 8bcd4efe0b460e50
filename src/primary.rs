//! Primary Heartbeat Driver and registration handler (spec §4.3, §4.4).
//!
//! Structured the way the teacher splits `Listener`/`Handler`: [`PrimaryServer`]
//! owns the listening socket and the process-wide heartbeat; each accepted
//! connection that successfully registers gets handed to a [`SecondaryLink`]
//! task that owns it from then on, the way the teacher hands an accepted
//! socket to a spawned `Handler::run`.
//!
//! Only one piece of state here doesn't fit a plain enum-over-socket model:
//! whether a Secondary has ever registered, is currently registered, or was
//! registered and dropped. That's [`SecondaryConnection`], kept as a
//! three-state value per the design note about the source's `-1`/`-2`
//! sentinel distinction on `Secondary_connection`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::config::FailoverConfig;
use crate::connection::Connection;
use crate::error::FailoverError;
use crate::files;
use crate::hostid;
use crate::protocol::{Reply, ReplyCode, Request, Subtype};
use crate::shutdown::Shutdown;
use crate::HANDSHAKE_TIME;

/// Whether a Secondary connection is registered, as a three-state value
/// (spec §9): `Never` (no Secondary has registered this run), `Closed`
/// (one registered, then the connection dropped), `Live` (currently
/// registered and connected).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum SecondaryConnection {
    #[default]
    Never,
    Closed,
    Live,
}

/// Runs the Primary role: listens for a Secondary's `Register`, then
/// drives the recurring heartbeat (liveness touch, handshake dispatch,
/// self-recycle check) for as long as the process is up.
pub struct PrimaryServer {
    cfg: Arc<FailoverConfig>,
    local_hostid: u64,
    registered: Arc<AtomicBool>,
    recycle_requested: Arc<AtomicBool>,
}

impl PrimaryServer {
    pub fn new(cfg: FailoverConfig) -> Self {
        PrimaryServer {
            local_hostid: hostid::local_hostid(),
            cfg: Arc::new(cfg),
            registered: Arc::new(AtomicBool::new(false)),
            recycle_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Current coarse view of the Secondary connection, for diagnostics.
    pub fn secondary_connection(&self) -> SecondaryConnection {
        if self.recycle_requested.load(Ordering::SeqCst) {
            SecondaryConnection::Closed
        } else if self.registered.load(Ordering::SeqCst) {
            SecondaryConnection::Live
        } else {
            SecondaryConnection::Never
        }
    }

    /// Runs until `shutdown_signal` resolves or the Secondary's marker file
    /// shows up and this process self-recycles (spec §4.3 step 2b).
    ///
    /// Takes the shutdown trigger as a generic future, the same shape the
    /// teacher's `server::run` does, so callers can pass `ctrl_c()` in
    /// production and a oneshot channel in tests.
    pub async fn run(self, shutdown_signal: impl std::future::Future<Output = ()>) -> Result<(), FailoverError> {
        let listener = TcpListener::bind(("0.0.0.0", self.cfg.server_port)).await?;
        info!(port = self.cfg.server_port, "primary listening for secondary registration");

        let (notify_shutdown, _) = broadcast::channel(1);
        let mut heartbeat = tokio::time::interval(Duration::from_secs(HANDSHAKE_TIME));
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown_signal);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, peer)) => {
                            self.spawn_link_if_registerable(socket, peer, notify_shutdown.subscribe());
                        }
                        Err(e) => warn!(error = %e, "accept failed"),
                    }
                }
                _ = heartbeat.tick() => {
                    if let Err(e) = files::touch_liveness(&self.cfg.svrlive_path()) {
                        warn!(error = %e, "failed to touch liveness file");
                    }
                    if files::marker_exists(&self.cfg.secondary_active_path()) {
                        self.recycle_requested.store(true, Ordering::SeqCst);
                    }
                }
                _ = &mut shutdown_signal => {
                    info!("primary shutting down");
                    let _ = notify_shutdown.send(());
                    return Ok(());
                }
            }

            if self.recycle_requested.load(Ordering::SeqCst) {
                info!("secondary-active marker observed; primary self-recycling");
                return Ok(());
            }
        }
    }

    fn spawn_link_if_registerable(&self, socket: TcpStream, peer: SocketAddr, shutdown_rx: broadcast::Receiver<()>) {
        let registered = Arc::clone(&self.registered);
        let local_hostid = self.local_hostid;
        tokio::spawn(async move {
            if let Some(conn) = accept_registration(socket, peer, local_hostid, &registered).await {
                info!(%peer, "secondary registered");
                SecondaryLink { conn, registered, shutdown: Shutdown::new(shutdown_rx) }.run().await;
            }
        });
    }
}

/// Reads the initial request off a newly accepted socket, which must be a
/// `Register` (spec §4.4). Accepts at most one Secondary at a time; a
/// second attempt is rejected with `ObjBusy` (spec §8 property 2, S6).
async fn accept_registration(
    socket: TcpStream,
    peer: SocketAddr,
    local_hostid: u64,
    registered: &Arc<AtomicBool>,
) -> Option<Connection> {
    let mut conn = Connection::new(socket);

    let req = match conn.read_request().await {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, %peer, "failed to read initial request from new connection");
            return None;
        }
    };

    if req.subtype != Subtype::Register {
        warn!(%peer, subtype = ?req.subtype, "expected register request from new connection");
        let _ = conn.write_reply(&Reply::err(ReplyCode::System)).await;
        return None;
    }

    if registered.swap(true, Ordering::SeqCst) {
        warn!(%peer, "second secondary tried to register");
        let _ = conn.write_reply(&Reply::err(ReplyCode::ObjBusy)).await;
        return None;
    }

    if let Err(e) = conn.write_reply(&Reply::ok_with_text(local_hostid.to_string())).await {
        warn!(error = %e, "failed to reply to register request");
        registered.store(false, Ordering::SeqCst);
        return None;
    }

    Some(conn)
}

/// Owns the control connection once a Secondary has registered: dispatches
/// the periodic handshake, notices the connection close, and relays a
/// graceful-shutdown directive (spec §4.3 step 2a, §4.4 `SecdGoInactive`).
struct SecondaryLink {
    conn: Connection,
    registered: Arc<AtomicBool>,
    shutdown: Shutdown,
}

impl SecondaryLink {
    async fn run(mut self) {
        let mut heartbeat = tokio::time::interval(Duration::from_secs(HANDSHAKE_TIME));
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // `interval` fires immediately on its first tick, so the freshly
        // registered secondary gets a handshake right away rather than
        // waiting a full period.

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    if let Err(e) = self.conn.write_request(Request { subtype: Subtype::HandShake }).await {
                        warn!(error = %e, "failed to dispatch handshake; secondary connection lost");
                        break;
                    }
                    // The secondary acks every handshake (see `secondary.rs`'s
                    // `handle_incoming`); that ack rides a reply frame, not a
                    // request, so it has to be consumed with `read_reply`
                    // rather than `read_request`.
                    match self.conn.read_reply().await {
                        Ok(reply) if reply.is_ok() => {}
                        Ok(reply) => warn!(code = ?reply.code, "secondary rejected handshake"),
                        Err(FailoverError::Eof) => {
                            info!("secondary connection closed");
                            break;
                        }
                        Err(e) => {
                            warn!(error = %e, "failed to read handshake acknowledgment; secondary connection lost");
                            break;
                        }
                    }
                }
                _ = self.shutdown.recv() => {
                    self.issue_shutdown().await;
                    break;
                }
            }
        }

        self.registered.store(false, Ordering::SeqCst);
    }

    /// Sends `SecdGoInactive` and waits for the acknowledgment before this
    /// process exits (spec §4.4 `SecdGoInactive`, §5 ordering guarantees).
    async fn issue_shutdown(&mut self) {
        info!("notifying secondary to go inactive before exit");
        if let Err(e) = self.conn.write_request(Request { subtype: Subtype::SecdGoInactive }).await {
            warn!(error = %e, "failed to send shutdown directive to secondary");
            return;
        }
        match self.conn.read_reply().await {
            Ok(_) => info!("secondary acknowledged shutdown directive"),
            Err(e) => warn!(error = %e, "secondary did not acknowledge shutdown directive"),
        }
    }

    /// Forces the Secondary to take over immediately (spec §4.4
    /// `SecdTakeOver`): ack first, give the ack time to land, then close.
    #[cfg(test)]
    async fn issue_force_takeover(&mut self) {
        let _ = self.conn.write_request(Request { subtype: Subtype::SecdTakeOver }).await;
        let _ = self.conn.read_reply().await;
        self.conn.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
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
    async fn register_grants_hostid_and_second_attempt_is_rejected() {
        let dir = tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _cfg = test_config(dir.path(), port);

        let registered = Arc::new(AtomicBool::new(false));

        let client1 = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let server_side1 = listener.accept().await.unwrap().0;
        let conn1 = accept_registration(server_side1, "0.0.0.0:0".parse().unwrap(), 42, &registered).await;
        assert!(conn1.is_some());

        let mut client1 = Connection::new(client1);
        let reply = client1.read_reply().await.unwrap();
        assert!(reply.is_ok());
        assert_eq!(reply.text.as_deref(), Some("42"));

        let client2 = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let server_side2 = listener.accept().await.unwrap().0;
        let conn2 = accept_registration(server_side2, "0.0.0.0:0".parse().unwrap(), 42, &registered).await;
        assert!(conn2.is_none());

        let mut client2 = Connection::new(client2);
        let reply = client2.read_reply().await.unwrap();
        assert_eq!(reply.code, ReplyCode::ObjBusy);
    }

    #[tokio::test]
    async fn secondary_link_dispatches_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let (server_side, _) = listener.accept().await.unwrap();

        let (tx, rx) = broadcast::channel(1);

        let link = SecondaryLink {
            conn: Connection::new(server_side),
            registered: Arc::new(AtomicBool::new(true)),
            shutdown: Shutdown::new(rx),
        };
        let handle = tokio::spawn(link.run());

        let mut client = Connection::new(client);
        let req = client.read_request().await.unwrap();
        assert_eq!(req.subtype, Subtype::HandShake);
        client.write_reply(&Reply::ok()).await.unwrap();

        let _ = tx.send(());
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_ack_does_not_drop_registration() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let (server_side, _) = listener.accept().await.unwrap();

        let (tx, rx) = broadcast::channel(1);
        let registered = Arc::new(AtomicBool::new(true));

        let link = SecondaryLink {
            conn: Connection::new(server_side),
            registered: Arc::clone(&registered),
            shutdown: Shutdown::new(rx),
        };
        let handle = tokio::spawn(link.run());

        let mut client = Connection::new(client);

        let req = client.read_request().await.unwrap();
        assert_eq!(req.subtype, Subtype::HandShake);
        client.write_reply(&Reply::ok()).await.unwrap();

        // Advancing past the next heartbeat tick must still find the link
        // registered and dispatching, not torn down by the first ack.
        tokio::time::advance(Duration::from_secs(HANDSHAKE_TIME)).await;
        let req = client.read_request().await.unwrap();
        assert_eq!(req.subtype, Subtype::HandShake);
        assert!(registered.load(Ordering::SeqCst));
        client.write_reply(&Reply::ok()).await.unwrap();

        let _ = tx.send(());
        handle.await.unwrap();
        assert!(!registered.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn force_takeover_acks_then_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let (server_side, _) = listener.accept().await.unwrap();

        let (_tx, rx) = broadcast::channel(1);
        let mut link = SecondaryLink {
            conn: Connection::new(server_side),
            registered: Arc::new(AtomicBool::new(true)),
            shutdown: Shutdown::new(rx),
        };

        let mut client = Connection::new(client);
        let client_side = tokio::spawn(async move {
            let req = client.read_request().await.unwrap();
            assert_eq!(req.subtype, Subtype::SecdTakeOver);
            client.write_reply(&Reply::ok()).await.unwrap();
        });

        link.issue_force_takeover().await;
        client_side.await.unwrap();
    }
}
