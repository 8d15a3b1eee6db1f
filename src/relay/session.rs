//! Session Manager
//!
//! Owns one client/target pairing from accept to teardown: opens the
//! outbound connection, runs the forwarder over the pair, and closes both
//! sockets exactly once on every exit path.

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::error::RelayError;
use super::forwarder::{CloseReason, ForwardReport, Forwarder};
use super::stats::StatsHandle;
use crate::config::RelayConfig;

/// Lifecycle of a session. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Client accepted, target connect in progress
    Connecting,
    /// Both ends open, bytes flowing
    Forwarding,
    /// Forwarding ended and both sockets released
    Closed,
    /// Target connect failed, client released
    Failed,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        matches!(
            (self, next),
            (SessionState::Connecting, SessionState::Forwarding)
                | (SessionState::Connecting, SessionState::Failed)
                | (SessionState::Forwarding, SessionState::Closed)
        )
    }

    fn advance(&mut self, next: SessionState) {
        debug_assert!(
            self.can_transition_to(next),
            "invalid session transition {:?} -> {:?}",
            self,
            next
        );
        debug!("Session state {:?} -> {:?}", self, next);
        *self = next;
    }
}

/// An open client/target pairing.
///
/// Both streams live and die together: dropping the session (including
/// when its task is aborted) closes both sockets.
pub struct Session {
    id: Uuid,
    client_addr: SocketAddr,
    target_addr: SocketAddr,
    created_at: DateTime<Utc>,
    client: TcpStream,
    target: TcpStream,
}

impl Session {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    pub fn target_addr(&self) -> SocketAddr {
        self.target_addr
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Shut down both write sides, then release both sockets
    async fn close(mut self) {
        if let Err(e) = self.client.shutdown().await {
            debug!("Client shutdown: {}", e);
        }
        if let Err(e) = self.target.shutdown().await {
            debug!("Target shutdown: {}", e);
        }
    }
}

/// Runs sessions against the fixed target
#[derive(Debug, Clone)]
pub struct SessionManager {
    config: Arc<RelayConfig>,
    forwarder: Forwarder,
    stats: StatsHandle,
}

impl SessionManager {
    pub fn new(config: Arc<RelayConfig>, stats: StatsHandle) -> Self {
        let forwarder = Forwarder::from_config(&config);
        Self {
            config,
            forwarder,
            stats,
        }
    }

    /// Handle one accepted client connection to completion.
    ///
    /// A failed target connect closes the client and returns the error; there
    /// is no retry. Otherwise the forwarding report is returned once both
    /// sockets are closed. Errors never leave the session other than through
    /// this return value and the logs.
    pub async fn handle(
        &self,
        client: TcpStream,
        client_addr: SocketAddr,
        shutdown: watch::Receiver<bool>,
    ) -> Result<ForwardReport, RelayError> {
        let id = Uuid::new_v4();
        let span = info_span!("session", id = %short_id(&id), client = %client_addr);
        self.run_session(id, client, client_addr, shutdown)
            .instrument(span)
            .await
    }

    async fn run_session(
        &self,
        id: Uuid,
        client: TcpStream,
        client_addr: SocketAddr,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<ForwardReport, RelayError> {
        let created_at = Utc::now();
        let mut state = SessionState::Connecting;
        info!("New connection from {}", client_addr);

        let (target, target_addr) = match connect_target(&self.config).await {
            Ok(connected) => connected,
            Err(e) => {
                state.advance(SessionState::Failed);
                self.stats.connect_failed();
                warn!(
                    "Failed to connect to target {} for client {}: {}",
                    self.config.target_addr(),
                    client_addr,
                    e
                );
                drop(client);
                return Err(e);
            }
        };

        for (stream, side) in [(&client, "client"), (&target, "target")] {
            // Disable Nagle's algorithm for low-latency forwarding
            if let Err(e) = stream.set_nodelay(true) {
                warn!("Failed to set TCP_NODELAY on {} socket: {}", side, e);
            }
        }

        let mut session = Session {
            id,
            client_addr,
            target_addr,
            created_at,
            client,
            target,
        };
        state.advance(SessionState::Forwarding);
        info!("Connected to target {}", session.target_addr());

        let report = self
            .forwarder
            .run(&mut session.client, &mut session.target, &mut shutdown)
            .await;

        let (session_id, client_addr, opened_at) =
            (session.id(), session.client_addr(), session.created_at());
        session.close().await;
        state.advance(SessionState::Closed);
        debug!("Session {} released", session_id);
        self.stats
            .add_bytes(report.bytes_to_target, report.bytes_to_client);

        let duration_ms = (Utc::now() - opened_at).num_milliseconds();
        match &report.reason {
            CloseReason::Error { side, error } => warn!(
                reason = report.reason.as_str(),
                failed_side = side.as_str(),
                bytes_to_target = report.bytes_to_target,
                bytes_to_client = report.bytes_to_client,
                duration_ms,
                "Connection from {} closed: {}",
                client_addr,
                error
            ),
            reason => info!(
                reason = reason.as_str(),
                bytes_to_target = report.bytes_to_target,
                bytes_to_client = report.bytes_to_client,
                duration_ms,
                "Connection from {} closed",
                client_addr
            ),
        }

        Ok(report)
    }
}

/// Open the outbound connection, bounded by the connect timeout.
///
/// Resolution and every connect attempt share the one bound. Returns the
/// address actually reached.
async fn connect_target(config: &RelayConfig) -> Result<(TcpStream, SocketAddr), RelayError> {
    match tokio::time::timeout(config.connect_timeout, connect_first(config)).await {
        Ok(result) => result,
        Err(_) => Err(RelayError::Timeout(format!(
            "connecting to {} took longer than {:?}",
            config.target_addr(),
            config.connect_timeout
        ))),
    }
}

/// Try each resolved address in order until one accepts
async fn connect_first(config: &RelayConfig) -> Result<(TcpStream, SocketAddr), RelayError> {
    let target = config.target_addr();
    let addrs = tokio::net::lookup_host((config.target_host.as_str(), config.target_port))
        .await
        .map_err(|e| RelayError::ConnectionFailed(format!("{}: {}", target, e)))?;

    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok((stream, addr)),
            Err(e) => {
                debug!("Connect to {} failed: {}", addr, e);
                last_err = Some(e);
            }
        }
    }
    Err(RelayError::ConnectionFailed(match last_err {
        Some(e) => format!("{}: {}", target, e),
        None => format!("{}: no addresses resolved", target),
    }))
}

fn short_id(id: &Uuid) -> String {
    id.simple().to_string()[..8].to_string()
}
