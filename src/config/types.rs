//! Endpoint configuration
//!
//! Built once before the listener starts and shared read-only (behind `Arc`)
//! by every session for the lifetime of the process.

use std::time::Duration;

/// Default listen host (all interfaces)
pub const DEFAULT_LISTEN_HOST: &str = "0.0.0.0";
/// Default listen port
pub const DEFAULT_LISTEN_PORT: u16 = 5433;
/// Default target port (PostgreSQL)
pub const DEFAULT_TARGET_PORT: u16 = 5432;
/// Default transfer buffer size in bytes
pub const DEFAULT_BUFFER_SIZE: usize = 4096;
/// Shortest readiness wait; a zero wait would spin the forwarding loop
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Process-wide relay configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Host/IP the listener binds to
    pub listen_host: String,
    /// Port the listener binds to (0 = OS assigned)
    pub listen_port: u16,
    /// Upstream host every session connects to
    pub target_host: String,
    /// Upstream port every session connects to
    pub target_port: u16,
    /// Size of the single in-flight read block per direction
    pub buffer_size: usize,
    /// Bound on opening the outbound connection of a session
    pub connect_timeout: Duration,
    /// Bound on the startup liveness probe
    pub probe_timeout: Duration,
    /// Bound on a single forwarded write
    pub io_timeout: Duration,
    /// Readiness wait between shutdown/idle checks
    pub poll_interval: Duration,
    /// End a session after this long without traffic (None = never)
    pub idle_timeout: Option<Duration>,
    /// Pause after a transient accept error
    pub accept_backoff: Duration,
    /// Pending-connection queue length for the listening socket
    pub backlog: u32,
    /// Time in-flight sessions get to drain at shutdown
    pub shutdown_grace: Duration,
    /// Start listening even if the startup probe fails
    pub allow_unreachable_target: bool,
}

impl RelayConfig {
    /// Create a configuration with default timeouts and buffer size
    pub fn new(
        listen_host: impl Into<String>,
        listen_port: u16,
        target_host: impl Into<String>,
        target_port: u16,
    ) -> Self {
        Self {
            listen_host: listen_host.into(),
            listen_port,
            target_host: target_host.into(),
            target_port,
            buffer_size: DEFAULT_BUFFER_SIZE,
            connect_timeout: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            io_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
            idle_timeout: None,
            accept_backoff: Duration::from_secs(1),
            backlog: 128,
            shutdown_grace: Duration::from_secs(5),
            allow_unreachable_target: false,
        }
    }

    /// Set transfer buffer size
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Set connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set probe timeout
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Set per-write timeout
    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    /// Set readiness poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(MIN_POLL_INTERVAL);
        self
    }

    /// Set idle timeout
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set shutdown grace period
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Address string for the listener, e.g. "0.0.0.0:5433" or "[::1]:5433"
    pub fn listen_addr(&self) -> String {
        join_host_port(&self.listen_host, self.listen_port)
    }

    /// Address string for the upstream target
    pub fn target_addr(&self) -> String {
        join_host_port(&self.target_host, self.target_port)
    }
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
