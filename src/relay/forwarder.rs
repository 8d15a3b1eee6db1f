//! Socket Pair Forwarder
//!
//! Copies bytes in both directions between two already-connected streams
//! until one side closes, an I/O error or write timeout occurs, the session
//! goes idle, or shutdown is signalled.
//!
//! The forwarder borrows its streams. Closing them is the session's job.

use std::fmt;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::config::{RelayConfig, MIN_POLL_INTERVAL};

/// One end of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Target,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Client => "client",
            Side::Target => "target",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a forwarding loop ended
#[derive(Debug)]
pub enum CloseReason {
    /// Client closed its write side (zero-length read)
    ClientClosed,
    /// Target closed its write side (zero-length read)
    TargetClosed,
    /// No bytes moved in either direction for the idle timeout
    IdleTimeout,
    /// Relay is shutting down
    Shutdown,
    /// Read/write failure or write timeout on one side
    Error { side: Side, error: std::io::Error },
}

impl CloseReason {
    /// Stable label used in logs
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::ClientClosed => "client_closed",
            CloseReason::TargetClosed => "target_closed",
            CloseReason::IdleTimeout => "idle_timeout",
            CloseReason::Shutdown => "shutdown",
            CloseReason::Error { .. } => "error",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Error { side, error } => write!(f, "error on {} side: {}", side, error),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Outcome of a forwarding loop
#[derive(Debug)]
pub struct ForwardReport {
    pub reason: CloseReason,
    /// Bytes copied client -> target
    pub bytes_to_target: u64,
    /// Bytes copied target -> client
    pub bytes_to_client: u64,
}

/// What woke the readiness wait
enum Ready {
    Client(std::io::Result<usize>),
    Target(std::io::Result<usize>),
    Shutdown,
    Tick,
}

/// Bidirectional byte pump with bounded waits
#[derive(Debug, Clone)]
pub struct Forwarder {
    buffer_size: usize,
    poll_interval: Duration,
    io_timeout: Duration,
    idle_timeout: Option<Duration>,
}

impl Forwarder {
    pub fn new(buffer_size: usize, poll_interval: Duration, io_timeout: Duration) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
            poll_interval: poll_interval.max(MIN_POLL_INTERVAL),
            io_timeout,
            idle_timeout: None,
        }
    }

    pub fn from_config(config: &RelayConfig) -> Self {
        Self::new(config.buffer_size, config.poll_interval, config.io_timeout)
            .with_idle_timeout(config.idle_timeout)
    }

    /// End the session after this long without traffic
    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Run the forwarding loop to completion.
    ///
    /// Each iteration waits at most `poll_interval` for either stream to be
    /// readable. A read of up to `buffer_size` bytes is written in full to the
    /// other stream before the next wait; a write that does not finish within
    /// `io_timeout` ends the session. Order is preserved per direction.
    pub async fn run<A, B>(
        &self,
        client: &mut A,
        target: &mut B,
        shutdown: &mut watch::Receiver<bool>,
    ) -> ForwardReport
    where
        A: AsyncRead + AsyncWrite + Unpin,
        B: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut client_rd, mut client_wr) = tokio::io::split(client);
        let (mut target_rd, mut target_wr) = tokio::io::split(target);

        let mut client_buf = vec![0u8; self.buffer_size];
        let mut target_buf = vec![0u8; self.buffer_size];

        let mut bytes_to_target = 0u64;
        let mut bytes_to_client = 0u64;
        let mut last_activity = Instant::now();
        // Cleared once the shutdown sender is gone, so `changed()` can't spin
        let mut shutdown_armed = true;

        let reason = loop {
            if *shutdown.borrow() {
                break CloseReason::Shutdown;
            }

            let ready = tokio::select! {
                r = client_rd.read(&mut client_buf) => Ready::Client(r),
                r = target_rd.read(&mut target_buf) => Ready::Target(r),
                changed = shutdown.changed(), if shutdown_armed => {
                    if changed.is_err() {
                        shutdown_armed = false;
                        Ready::Tick
                    } else {
                        Ready::Shutdown
                    }
                }
                _ = tokio::time::sleep(self.poll_interval) => Ready::Tick,
            };

            match ready {
                Ready::Client(Ok(0)) => break CloseReason::ClientClosed,
                Ready::Target(Ok(0)) => break CloseReason::TargetClosed,
                Ready::Client(Err(error)) => {
                    break CloseReason::Error {
                        side: Side::Client,
                        error,
                    }
                }
                Ready::Target(Err(error)) => {
                    break CloseReason::Error {
                        side: Side::Target,
                        error,
                    }
                }
                Ready::Client(Ok(n)) => {
                    if let Err(error) =
                        write_block(&mut target_wr, &client_buf[..n], self.io_timeout).await
                    {
                        break CloseReason::Error {
                            side: Side::Target,
                            error,
                        };
                    }
                    bytes_to_target += n as u64;
                    last_activity = Instant::now();
                    debug!("Forwarded {} bytes client->target", n);
                }
                Ready::Target(Ok(n)) => {
                    if let Err(error) =
                        write_block(&mut client_wr, &target_buf[..n], self.io_timeout).await
                    {
                        break CloseReason::Error {
                            side: Side::Client,
                            error,
                        };
                    }
                    bytes_to_client += n as u64;
                    last_activity = Instant::now();
                    debug!("Forwarded {} bytes target->client", n);
                }
                Ready::Shutdown => continue,
                Ready::Tick => {
                    if let Some(idle) = self.idle_timeout {
                        if last_activity.elapsed() >= idle {
                            debug!("Session idle for {:?}, closing", idle);
                            break CloseReason::IdleTimeout;
                        }
                    }
                    trace!("Readiness wait elapsed, re-polling");
                }
            }
        };

        ForwardReport {
            reason,
            bytes_to_target,
            bytes_to_client,
        }
    }
}

/// Write one block in full, bounded by `timeout`. Short writes are retried
/// by `write_all` until the block is sent or the write fails.
async fn write_block<W>(writer: &mut W, block: &[u8], timeout: Duration) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    match tokio::time::timeout(timeout, async {
        writer.write_all(block).await?;
        writer.flush().await
    })
    .await
    {
        Ok(result) => result,
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("write of {} bytes timed out after {:?}", block.len(), timeout),
        )),
    }
}
