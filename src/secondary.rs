//! The Secondary State Machine (spec §4.2): connects to Primary, registers,
//! then alternates between receiving handshakes and watching the liveness
//! file's mtime. Loss of both signals for `secondary_delay` seconds triggers
//! a fencing-gated takeover.
//!
//! Mirrors the teacher's "one `run` loop per role, one struct holding its
//! connection + shared state" shape (`server.rs`'s `Listener`/`Handler`),
//! but the event loop here is driven by protocol state rather than
//! accept/dispatch.

use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::config::{FailoverConfig, SecondaryDelay};
use crate::connection::Connection;
use crate::error::FailoverError;
use crate::fencing::{self, FencingOutcome};
use crate::files;
use crate::hostid;
use crate::protocol::{Reply, ReplyCode, Request, Subtype};
use crate::HANDSHAKE_TIME;

/// Seconds after startup at which a Secondary gives up waiting for an
/// initial connection to Primary and takes over (spec §4.2 `NoConn`
/// row, original `be_secondary`'s `60*5`).
const TAKEOVER_GRACE_SECS: u64 = 300;

/// Serves as the active peer until a restarting Primary reclaims the role
/// via `PrimIsBack` (spec §4.6, S4). Returns once the marker has been
/// removed and the handoff acknowledged, so the caller can return to
/// `SecondaryMachine::run` from a standby state.
pub async fn serve_active_until_reclaimed(cfg: &FailoverConfig) -> Result<(), FailoverError> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", cfg.server_port)).await?;
    info!(port = cfg.server_port, "serving as active peer; awaiting primary's return");

    loop {
        let (socket, peer) = listener.accept().await?;
        let mut conn = Connection::new(socket);
        match conn.read_request().await {
            Ok(Request { subtype: Subtype::PrimIsBack }) => {
                info!(%peer, "primary has returned; yielding active role");
                files::remove_marker(&cfg.secondary_active_path());
                let _ = conn.write_reply(&Reply::ok()).await;
                return Ok(());
            }
            Ok(req) => {
                warn!(%peer, subtype = ?req.subtype, "unexpected request while active");
                let _ = conn.write_reply(&Reply::err(ReplyCode::System)).await;
            }
            Err(e) => {
                warn!(%peer, error = %e, "failed to read request while active");
            }
        }
    }
}

/// Secondary-side protocol state (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecondaryState {
    NoConn,
    Conn,
    RegSent,
    HandSk,
    NoHsk,
    Shutd,
    TakeOv,
    Inact,
    Idle,
}

/// What the state machine's `run` loop has decided to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Takeover completed; the marker file exists and this process should
    /// now serve as the active server.
    Active,
    /// The process should exit with this status code (spec §6 exit codes).
    Exit(i32),
}

/// Owns every piece of process-wide state the original kept as free
/// globals (`Secondary_state`, `sec_sock`, `hd_time`, ...), per the
/// encapsulation guidance in spec §9.
pub struct SecondaryMachine {
    cfg: FailoverConfig,
    state: SecondaryState,
    conn: Option<Connection>,
    local_hostid: u64,
    local_hostname: String,

    hd_time: Instant,
    takeover_deadline: Instant,

    nohsk_entered_at: Instant,
    sb_mtime: Option<std::time::SystemTime>,
    sb_observed_at: Instant,
    progress_without_socket: u32,
    tick_count: u64,

    /// Set when a `PrimIsBack` has been received and acknowledged by
    /// protocol but whose *reply* is deferred until the embedder confirms
    /// its node table has been saved (spec §4.4, §5, §9 "deferred ack").
    pending_takeover_ack: bool,
}

impl SecondaryMachine {
    pub fn new(cfg: FailoverConfig) -> Self {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| cfg.secondary_host.clone());
        Self::with_hostname(cfg, hostname)
    }

    pub fn with_hostname(cfg: FailoverConfig, hostname: String) -> Self {
        let delay = cfg.secondary_delay();
        let state = match delay {
            SecondaryDelay::Immediate => SecondaryState::TakeOv,
            SecondaryDelay::Seconds(_) => SecondaryState::NoConn,
        };
        let delay_secs = match delay {
            SecondaryDelay::Seconds(s) => s,
            SecondaryDelay::Immediate => 0,
        };
        let now = Instant::now();
        SecondaryMachine {
            local_hostid: hostid::local_hostid(),
            local_hostname: hostname,
            hd_time: now,
            takeover_deadline: now + Duration::from_secs(TAKEOVER_GRACE_SECS + delay_secs),
            nohsk_entered_at: now,
            sb_mtime: None,
            sb_observed_at: now,
            progress_without_socket: 0,
            tick_count: 0,
            pending_takeover_ack: false,
            conn: None,
            state,
            cfg,
        }
    }

    pub fn state(&self) -> SecondaryState {
        self.state
    }

    pub fn has_pending_takeover_ack(&self) -> bool {
        self.pending_takeover_ack
    }

    /// Sends the deferred acknowledgment of a `PrimIsBack` directive. The
    /// embedding server calls this once its in-memory node table has been
    /// persisted — never from the request handler itself (spec §5
    /// ordering guarantee).
    pub async fn acknowledge_takeover(&mut self) -> Result<(), FailoverError> {
        if !self.pending_takeover_ack {
            return Ok(());
        }
        if let Some(conn) = self.conn.as_mut() {
            conn.write_reply(&Reply::ok()).await?;
        }
        self.pending_takeover_ack = false;
        Ok(())
    }

    /// Drives the state machine until it either takes over as active or the
    /// process should exit (spec §4.2's transition table run to
    /// completion).
    pub async fn run(mut self) -> Outcome {
        loop {
            if let Some(outcome) = self.tick().await {
                return outcome;
            }
        }
    }

    fn primary_addr(&self) -> String {
        format!("{}:{}", self.cfg.primary_host, self.cfg.server_port)
    }

    fn secondary_delay_duration(&self) -> Duration {
        match self.cfg.secondary_delay() {
            SecondaryDelay::Seconds(s) => Duration::from_secs(s),
            SecondaryDelay::Immediate => Duration::ZERO,
        }
    }

    async fn reply_ok(&mut self) {
        if let Some(conn) = self.conn.as_mut() {
            if let Err(e) = conn.write_reply(&Reply::ok()).await {
                warn!(error = %e, "failed to acknowledge request from primary");
            }
        }
    }

    async fn tick(&mut self) -> Option<Outcome> {
        match self.state {
            SecondaryState::NoConn | SecondaryState::Idle => self.try_connect().await,
            SecondaryState::Conn => self.send_register().await,
            SecondaryState::RegSent => self.await_register_reply().await,
            SecondaryState::HandSk => self.wait_for_handshake().await,
            SecondaryState::NoHsk => self.wait_in_nohsk().await,
            SecondaryState::Inact => self.wait_inactive().await,
            SecondaryState::TakeOv => self.attempt_takeover().await,
            SecondaryState::Shutd => Some(Outcome::Exit(0)),
        }
    }

    /// `NoConn`/`Idle` row: try to (re)connect; on failure either declare a
    /// takeover (grace period elapsed) or back off 10s.
    async fn try_connect(&mut self) -> Option<Outcome> {
        match Connection::connect_timeout(self.primary_addr(), Duration::from_secs(5)).await {
            Ok(conn) => {
                self.conn = Some(conn);
                self.state = SecondaryState::Conn;
                info!("connected to primary");
            }
            Err(e) => {
                debug!(error = %e, "failed to connect to primary");
                if matches!(self.state, SecondaryState::NoConn) && Instant::now() >= self.takeover_deadline {
                    self.state = SecondaryState::TakeOv;
                } else {
                    sleep(Duration::from_secs(10)).await;
                }
            }
        }
        None
    }

    /// `Conn` row: send Register, advance to `RegSent` or fall back to
    /// `NoConn` on a send failure.
    async fn send_register(&mut self) -> Option<Outcome> {
        let conn = self.conn.as_mut().expect("Conn state always holds a connection");
        match conn.write_request(Request { subtype: Subtype::Register }).await {
            Ok(()) => self.state = SecondaryState::RegSent,
            Err(e) => {
                warn!(error = %e, "failed to send register request");
                self.conn = None;
                self.state = SecondaryState::NoConn;
            }
        }
        None
    }

    /// `RegSent` row: await the Register reply and react per spec §4.2.
    async fn await_register_reply(&mut self) -> Option<Outcome> {
        let conn = self.conn.as_mut().expect("RegSent state always holds a connection");
        match conn.read_reply().await {
            Ok(reply) if reply.is_ok() => self.accept_register_reply(reply).await,
            Ok(reply) if reply.code == ReplyCode::UnkReq => {
                error!("primary rejected attempt to register as secondary");
                Some(Outcome::Exit(1))
            }
            Ok(reply) => {
                warn!(code = ?reply.code, "primary refused registration");
                Some(Outcome::Exit(1))
            }
            Err(FailoverError::Eof) => {
                // Connected successfully but primary vanished before
                // replying: treat as "primary must be down" (spec §4.2
                // RegSent EOF row).
                self.conn = None;
                self.state = SecondaryState::TakeOv;
                None
            }
            Err(e) => {
                warn!(error = %e, "error reading register reply");
                self.conn = None;
                self.state = SecondaryState::NoConn;
                None
            }
        }
    }

    async fn accept_register_reply(&mut self, reply: Reply) -> Option<Outcome> {
        let primary_hostid: u64 = match reply.text.as_deref().and_then(|t| t.parse().ok()) {
            Some(id) => id,
            None => {
                warn!("register reply missing primary host id");
                self.conn = None;
                self.state = SecondaryState::NoConn;
                return None;
            }
        };

        let xored = primary_hostid ^ self.local_hostid;
        if let Err(e) = files::write_license(&self.cfg.license_path(), xored) {
            error!(error = %e, "unable to save primary hostid");
            return Some(Outcome::Exit(1));
        }

        self.hd_time = Instant::now();
        self.state = SecondaryState::HandSk;
        info!("registered with primary");
        None
    }

    /// `HandSk` row: wait for the next handshake (or other directive) while
    /// also watching for the handshake timeout.
    async fn wait_for_handshake(&mut self) -> Option<Outcome> {
        if let Some(outcome) = self.read_one_request_or_tick().await {
            return Some(outcome);
        }

        if matches!(self.state, SecondaryState::HandSk)
            && Instant::now() >= self.hd_time + Duration::from_secs(2 * HANDSHAKE_TIME)
        {
            warn!("no handshake received within {}s", 2 * HANDSHAKE_TIME);
            self.state = SecondaryState::NoHsk;
            self.nohsk_entered_at = Instant::now();
            self.sb_observed_at = Instant::now();
            self.sb_mtime = None;
            self.progress_without_socket = 0;
        }
        None
    }

    /// `NoHsk` row: combines (a) still listening for a resumed handshake if
    /// the socket is open, (b) sampling the liveness file's mtime, and (c)
    /// periodically retrying the connection.
    ///
    /// The predicate for giving up and reconnecting is "4 consecutive
    /// ticks where the liveness mtime advanced but we have no socket" —
    /// see the Open Question in spec §9; this is the exact reading chosen.
    async fn wait_in_nohsk(&mut self) -> Option<Outcome> {
        if let Some(outcome) = self.read_one_request_or_tick().await {
            return Some(outcome);
        }
        if !matches!(self.state, SecondaryState::NoHsk) {
            return None;
        }

        self.tick_count += 1;

        match files::liveness_mtime(&self.cfg.svrlive_path()) {
            Ok(mtime) => {
                let advanced = self.sb_mtime.map(|prev| mtime > prev).unwrap_or(true);
                if advanced {
                    self.sb_mtime = Some(mtime);
                    self.sb_observed_at = Instant::now();
                    if self.conn.is_none() {
                        self.progress_without_socket += 1;
                        if self.progress_without_socket > 4 {
                            debug!("liveness file still advancing with no handshake socket; reconnecting");
                            self.state = SecondaryState::NoConn;
                        }
                    } else {
                        self.progress_without_socket = 0;
                    }
                } else if Instant::now() >= self.sb_observed_at + self.secondary_delay_duration() {
                    info!("liveness file stagnant past secondary_delay; taking over");
                    self.state = SecondaryState::TakeOv;
                }
            }
            Err(e) => {
                if Instant::now() >= self.nohsk_entered_at + self.secondary_delay_duration() {
                    error!(error = %e, "secondary unable to stat server live file");
                    self.state = SecondaryState::NoConn;
                }
            }
        }

        if self.conn.is_none() && matches!(self.state, SecondaryState::NoHsk) && self.tick_count % 3 == 0 {
            if let Ok(conn) = Connection::connect_timeout(self.primary_addr(), Duration::from_secs(8)).await {
                self.conn = Some(conn);
                self.state = SecondaryState::Conn;
                info!("reconnected to primary while waiting in NoHsk");
            }
        }

        None
    }

    /// `Inact` row: wait (up to 600s) for Primary to close the connection,
    /// then settle into `Idle` after a 10s safety sleep.
    async fn wait_inactive(&mut self) -> Option<Outcome> {
        let Some(conn) = self.conn.as_mut() else {
            sleep(Duration::from_secs(10)).await;
            self.state = SecondaryState::Idle;
            return None;
        };

        tokio::select! {
            req = conn.read_request() => {
                match req {
                    Ok(request) => return self.handle_incoming(request).await,
                    Err(_) => {
                        self.conn = None;
                        sleep(Duration::from_secs(10)).await;
                        info!("completed waiting for primary to go down");
                        self.state = SecondaryState::Idle;
                    }
                }
            }
            _ = sleep(Duration::from_secs(600)) => {
                warn!("timed out waiting for primary to close connection while inactive");
            }
        }
        None
    }

    /// `TakeOv` row: one last connection attempt, then fencing, then go
    /// active (spec §4.2 "Takeover procedure").
    async fn attempt_takeover(&mut self) -> Option<Outcome> {
        if let Some(conn) = self.conn.as_mut() {
            conn.shutdown().await;
        }
        self.conn = None;

        info!("attempting to connect with primary one last time before taking over");
        if let Ok(conn) = Connection::connect_timeout(self.primary_addr(), Duration::from_secs(8)).await {
            self.conn = Some(conn);
            self.state = SecondaryState::Conn;
            info!("reconnected with primary; aborting takeover");
            return None;
        }

        match fencing::check_and_invoke(
            &self.cfg.stonith_path(),
            &self.cfg.spool_dir(),
            &self.cfg.primary_host,
            std::process::id(),
        )
        .await
        {
            FencingOutcome::Failed => {
                info!("secondary will attempt taking over again");
                sleep(Duration::from_secs(10)).await;
                return None;
            }
            FencingOutcome::Skipped | FencingOutcome::Confirmed => {}
        }

        files::create_marker(&self.cfg.secondary_active_path(), &self.local_hostname);
        info!("secondary is now active");
        Some(Outcome::Active)
    }

    /// Races reading the next request against a 1-second tick, the way
    /// every state that owns an open connection needs both "did a message
    /// arrive" and "has a second passed" (spec §5 `wait_request(1s)`).
    async fn read_one_request_or_tick(&mut self) -> Option<Outcome> {
        let Some(conn) = self.conn.as_mut() else {
            sleep(Duration::from_secs(1)).await;
            return None;
        };

        tokio::select! {
            req = conn.read_request() => {
                match req {
                    Ok(request) => return self.handle_incoming(request).await,
                    Err(FailoverError::Eof) => {
                        warn!("primary connection closed");
                        self.conn = None;
                        if matches!(self.state, SecondaryState::HandSk) {
                            self.state = SecondaryState::NoHsk;
                            self.nohsk_entered_at = Instant::now();
                            self.sb_observed_at = Instant::now();
                            self.sb_mtime = None;
                            self.progress_without_socket = 0;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "protocol error reading from primary");
                        self.conn = None;
                        self.state = SecondaryState::NoConn;
                    }
                }
            }
            _ = sleep(Duration::from_secs(1)) => {}
        }
        None
    }

    /// Handles the "any state" rows of the transition table: directives
    /// that can arrive whenever the control connection is open.
    async fn handle_incoming(&mut self, req: Request) -> Option<Outcome> {
        match req.subtype {
            Subtype::HandShake => {
                self.hd_time = Instant::now();
                if matches!(self.state, SecondaryState::NoHsk) {
                    info!("handshake resumed");
                    self.state = SecondaryState::HandSk;
                }
                self.reply_ok().await;
            }
            Subtype::PrimIsBack => {
                info!("received takeover message from primary, going inactive");
                files::remove_marker(&self.cfg.secondary_active_path());
                if self.pending_takeover_ack {
                    warn!("overlapping PrimIsBack while a takeover ack is already pending");
                }
                self.pending_takeover_ack = true;
                self.state = SecondaryState::Inact;
            }
            Subtype::SecdShutdown => {
                self.reply_ok().await;
                return Some(Outcome::Exit(0));
            }
            Subtype::SecdGoInactive => {
                self.state = SecondaryState::Inact;
                self.reply_ok().await;
            }
            Subtype::SecdTakeOver => {
                self.reply_ok().await;
                sleep(Duration::from_secs(10)).await;
                if let Some(conn) = self.conn.as_mut() {
                    conn.shutdown().await;
                }
                self.conn = None;
                self.state = SecondaryState::TakeOv;
            }
            Subtype::Register => {
                warn!("unexpected register request received on secondary side");
            }
        }
        None
    }
}
