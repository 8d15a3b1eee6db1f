//! Listener / Dispatcher
//!
//! Owns the listening socket and hands every accepted connection to its own
//! task, so a stalled session never holds up the next accept.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::error::RelayError;
use super::session::SessionManager;
use super::stats::{ActiveSessionGuard, RelayStats, StatsHandle};
use crate::config::RelayConfig;

/// How long sessions get to react to the close signal before being aborted
const FORCE_CLOSE_WAIT: Duration = Duration::from_secs(2);

/// Two-tier classification of `accept()` failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptErrorClass {
    /// Back off and keep accepting (aborted handshakes, fd/memory exhaustion, ...)
    Transient,
    /// The listening socket itself is unusable
    Fatal,
}

/// Decide whether an accept error is worth retrying
pub fn classify_accept_error(err: &std::io::Error) -> AcceptErrorClass {
    use std::io::ErrorKind;

    match err.kind() {
        ErrorKind::ConnectionAborted
        | ErrorKind::ConnectionReset
        | ErrorKind::Interrupted
        | ErrorKind::WouldBlock
        | ErrorKind::TimedOut
        | ErrorKind::OutOfMemory => AcceptErrorClass::Transient,
        _ if is_transient_errno(err) => AcceptErrorClass::Transient,
        _ => AcceptErrorClass::Fatal,
    }
}

#[cfg(unix)]
fn is_transient_errno(err: &std::io::Error) -> bool {
    use nix::errno::Errno;

    let Some(code) = err.raw_os_error() else {
        return false;
    };
    // Resource exhaustion plus the network errors accept(2) passes through
    // from the pending connection
    [
        Errno::EMFILE,
        Errno::ENFILE,
        Errno::ENOBUFS,
        Errno::ENOMEM,
        Errno::EPROTO,
        Errno::EPERM,
        Errno::ENETDOWN,
        Errno::ENETUNREACH,
        Errno::EHOSTDOWN,
        Errno::EHOSTUNREACH,
        Errno::ENOPROTOOPT,
        Errno::EOPNOTSUPP,
    ]
    .iter()
    .any(|errno| *errno as i32 == code)
}

#[cfg(not(unix))]
fn is_transient_errno(_err: &std::io::Error) -> bool {
    false
}

/// Bound listening socket, ready to dispatch sessions
pub struct RelayListener {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: Arc<RelayConfig>,
    stats: StatsHandle,
}

impl RelayListener {
    /// Bind the configured listen address with address reuse enabled.
    ///
    /// Any failure here is fatal for the relay.
    pub async fn bind(config: Arc<RelayConfig>) -> Result<Self, RelayError> {
        let addr_str = config.listen_addr();

        let addr = tokio::net::lookup_host((config.listen_host.as_str(), config.listen_port))
            .await
            .map_err(|e| RelayError::from_bind(&addr_str, e))?
            .next()
            .ok_or_else(|| {
                RelayError::BindFailed(format!("{} did not resolve to any address", addr_str))
            })?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(|e| RelayError::from_bind(&addr_str, e))?;

        // Restarts must not wait out TIME_WAIT on the old socket
        #[cfg(unix)]
        socket
            .set_reuseaddr(true)
            .map_err(|e| RelayError::from_bind(&addr_str, e))?;

        socket
            .bind(addr)
            .map_err(|e| RelayError::from_bind(&addr_str, e))?;
        let listener = socket
            .listen(config.backlog)
            .map_err(|e| RelayError::from_bind(&addr_str, e))?;

        let local_addr = listener
            .local_addr()
            .map_err(|e| RelayError::BindFailed(format!("Failed to get bound address: {}", e)))?;

        info!(
            "Relay listening on {} -> {}",
            local_addr,
            config.target_addr()
        );

        Ok(Self {
            listener,
            local_addr,
            config,
            stats: StatsHandle::new(),
        })
    }

    /// Actual bound address (differs from the configured one when port was 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shared relay counters
    pub fn stats(&self) -> StatsHandle {
        self.stats.clone()
    }

    /// Accept connections until `shutdown` flips to true (or its sender is
    /// dropped), then drain in-flight sessions within the grace period.
    ///
    /// Returns an error only when the listening socket fails in a way that
    /// retrying cannot fix.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), RelayError> {
        let RelayListener {
            listener,
            local_addr,
            config,
            stats,
        } = self;

        let manager = SessionManager::new(config.clone(), stats.clone());
        // Separate signal for sessions: they keep running through the grace period
        let (close_tx, close_rx) = watch::channel(false);
        let mut sessions: JoinSet<()> = JoinSet::new();

        let result = loop {
            if *shutdown.borrow() {
                break Ok(());
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Stopping accept loop on {}", local_addr);
                        break Ok(());
                    }
                }

                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!("Session task panicked: {}", e);
                        }
                    }
                }

                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            debug!("Accepted connection from {}", peer_addr);
                            let guard = ActiveSessionGuard::new(stats.clone());
                            let manager = manager.clone();
                            let close_rx = close_rx.clone();
                            sessions.spawn(async move {
                                let _guard = guard;
                                // Failures are logged by the session itself
                                let _ = manager.handle(stream, peer_addr, close_rx).await;
                            });
                        }
                        Err(e) => {
                            let recovered =
                                recover_from_accept_error(&e, config.accept_backoff).await;
                            if let Err(fatal) = recovered {
                                error!("Listener on {} failed: {}", local_addr, e);
                                break Err(fatal);
                            }
                        }
                    }
                }
            }
        };

        // Stop accepting before draining
        drop(listener);
        drain_sessions(&mut sessions, &close_tx, &stats, config.shutdown_grace).await;

        let RelayStats {
            connection_count,
            failed_connects,
            bytes_to_target,
            bytes_to_client,
            ..
        } = stats.snapshot();
        info!(
            connection_count,
            failed_connects,
            bytes_to_target,
            bytes_to_client,
            "Relay on {} stopped",
            local_addr
        );

        result
    }
}

/// Sleep out `backoff` after a retryable accept error; a fatal one is returned
async fn recover_from_accept_error(
    err: &std::io::Error,
    backoff: Duration,
) -> Result<(), RelayError> {
    match classify_accept_error(err) {
        AcceptErrorClass::Transient => {
            error!(
                "Error accepting connection: {}; retrying in {:?}",
                err, backoff
            );
            tokio::time::sleep(backoff).await;
            Ok(())
        }
        AcceptErrorClass::Fatal => Err(RelayError::ListenerClosed(err.to_string())),
    }
}

/// Give sessions `grace` to finish, then signal close, then abort stragglers
async fn drain_sessions(
    sessions: &mut JoinSet<()>,
    close_tx: &watch::Sender<bool>,
    stats: &StatsHandle,
    grace: Duration,
) {
    if sessions.is_empty() {
        return;
    }

    info!(
        "Waiting up to {:?} for {} active sessions to finish",
        grace,
        stats.active()
    );
    if tokio::time::timeout(grace, join_all(sessions)).await.is_ok() {
        return;
    }

    warn!(
        "Grace period elapsed with {} sessions active, closing them",
        sessions.len()
    );
    let _ = close_tx.send(true);

    if tokio::time::timeout(FORCE_CLOSE_WAIT, join_all(sessions))
        .await
        .is_err()
    {
        warn!("Aborting {} sessions that did not close", sessions.len());
        sessions.shutdown().await;
    }
}

async fn join_all(sessions: &mut JoinSet<()>) {
    while sessions.join_next().await.is_some() {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn spawn_echo_target() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut rd, mut wr) = stream.split();
                    let _ = tokio::io::copy(&mut rd, &mut wr).await;
                });
            }
        });
        addr
    }

    fn relay_config(target: SocketAddr) -> RelayConfig {
        RelayConfig::new("127.0.0.1", 0, "127.0.0.1", target.port())
            .with_poll_interval(Duration::from_millis(20))
            .with_connect_timeout(Duration::from_secs(2))
            .with_shutdown_grace(Duration::from_millis(200))
    }

    async fn start_relay(
        config: RelayConfig,
    ) -> (
        SocketAddr,
        StatsHandle,
        watch::Sender<bool>,
        tokio::task::JoinHandle<Result<(), RelayError>>,
    ) {
        let listener = RelayListener::bind(Arc::new(config)).await.unwrap();
        let addr = listener.local_addr();
        let stats = listener.stats();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(listener.run(rx));
        (addr, stats, tx, handle)
    }

    #[test]
    fn test_classify_accept_errors() {
        use std::io::{Error, ErrorKind};
        assert_eq!(
            classify_accept_error(&Error::new(ErrorKind::ConnectionAborted, "aborted")),
            AcceptErrorClass::Transient
        );
        assert_eq!(
            classify_accept_error(&Error::new(ErrorKind::Interrupted, "eintr")),
            AcceptErrorClass::Transient
        );
        assert_eq!(
            classify_accept_error(&Error::new(ErrorKind::InvalidInput, "bad socket")),
            AcceptErrorClass::Fatal
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_classify_errno() {
        use nix::errno::Errno;
        let emfile = std::io::Error::from_raw_os_error(Errno::EMFILE as i32);
        assert_eq!(classify_accept_error(&emfile), AcceptErrorClass::Transient);
        let ebadf = std::io::Error::from_raw_os_error(Errno::EBADF as i32);
        assert_eq!(classify_accept_error(&ebadf), AcceptErrorClass::Fatal);
    }

    #[tokio::test]
    async fn test_transient_accept_error_backs_off() {
        use std::io::{Error, ErrorKind};
        let backoff = Duration::from_millis(50);
        let started = tokio::time::Instant::now();
        let err = Error::new(ErrorKind::ConnectionAborted, "handshake aborted");
        assert!(recover_from_accept_error(&err, backoff).await.is_ok());
        assert!(started.elapsed() >= backoff);
    }

    #[tokio::test]
    async fn test_fatal_accept_error_ends_loop_without_waiting() {
        use std::io::{Error, ErrorKind};
        let started = tokio::time::Instant::now();
        let err = Error::new(ErrorKind::InvalidInput, "bad socket");
        let result = recover_from_accept_error(&err, Duration::from_secs(30)).await;
        assert!(matches!(result, Err(RelayError::ListenerClosed(_))));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_echo_through_relay() {
        let target = spawn_echo_target().await;
        let (addr, _stats, _tx, _handle) = start_relay(relay_config(target)).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        let payload: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
        let (mut rd, mut wr) = client.split();
        let expected = payload.clone();
        let (_, received) = tokio::join!(
            async { wr.write_all(&payload).await.unwrap() },
            async {
                let mut buf = vec![0u8; expected.len()];
                rd.read_exact(&mut buf).await.unwrap();
                buf
            }
        );
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_concurrent_sessions_do_not_cross() {
        let target = spawn_echo_target().await;
        let (addr, stats, _tx, _handle) = start_relay(relay_config(target)).await;

        let mut clients = JoinSet::new();
        for i in 0..16u32 {
            clients.spawn(async move {
                let mut stream = TcpStream::connect(addr).await.unwrap();
                let tag = format!("session-{:02}:", i).repeat(64);
                stream.write_all(tag.as_bytes()).await.unwrap();
                let mut buf = vec![0u8; tag.len()];
                stream.read_exact(&mut buf).await.unwrap();
                assert_eq!(buf, tag.as_bytes());
            });
        }
        while let Some(res) = clients.join_next().await {
            res.unwrap();
        }
        assert_eq!(stats.snapshot().connection_count, 16);
    }

    #[tokio::test]
    async fn test_empty_client_close_closes_target() {
        let target_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = target_listener.local_addr().unwrap();
        let (addr, _stats, _tx, _handle) = start_relay(relay_config(target)).await;

        let client = TcpStream::connect(addr).await.unwrap();
        let (mut upstream, _) = target_listener.accept().await.unwrap();
        drop(client);

        let mut buf = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(2), upstream.read_to_end(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_target_immediate_close_closes_client() {
        let target_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = target_listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = target_listener.accept().await {
                drop(stream);
            }
        });
        let (addr, _stats, _tx, _handle) = start_relay(relay_config(target)).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
    }

    #[tokio::test]
    async fn test_unreachable_target_does_not_block_accept() {
        let dead = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap()
        };
        let (addr, stats, _tx, _handle) = start_relay(relay_config(dead)).await;

        for _ in 0..2 {
            let mut client = TcpStream::connect(addr).await.unwrap();
            let mut buf = [0u8; 1];
            let read = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
                .await
                .unwrap();
            assert!(matches!(read, Ok(0) | Err(_)));
        }

        let snap = stats.snapshot();
        assert_eq!(snap.connection_count, 2);
        assert_eq!(snap.failed_connects, 2);
    }

    #[tokio::test]
    async fn test_bind_conflict_fails() {
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = occupied.local_addr().unwrap().port();
        let config = RelayConfig::new("127.0.0.1", port, "127.0.0.1", 5432);

        let result = RelayListener::bind(Arc::new(config)).await;
        assert!(matches!(result, Err(RelayError::BindFailed(_))));
    }

    #[tokio::test]
    async fn test_shutdown_drains_and_closes_sessions() {
        let target_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = target_listener.local_addr().unwrap();
        let (addr, stats, tx, handle) = start_relay(relay_config(target)).await;

        // An idle session that never finishes on its own
        let mut client = TcpStream::connect(addr).await.unwrap();
        let (_upstream, _) = target_listener.accept().await.unwrap();
        while stats.active() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        tx.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(stats.active(), 0);

        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));

        // Listener is gone
        assert!(TcpStream::connect(addr).await.is_err());
    }
}
