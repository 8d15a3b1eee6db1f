//! Command line / environment surface
//!
//! Every option can come from a flag or from the environment variable the
//! deployment already uses (`PROXY_HOST`, `PROXY_TARGET_HOST`, ...).

use std::time::Duration;

use clap::builder::FalseyValueParser;
use clap::Parser;

use super::types::{RelayConfig, DEFAULT_BUFFER_SIZE, DEFAULT_LISTEN_PORT, DEFAULT_TARGET_PORT};
use crate::relay::RelayError;

#[derive(Parser, Debug, Clone)]
#[command(name = "db-relay")]
#[command(version)]
#[command(about = "Transparent TCP relay to a database reachable only from this network")]
pub struct Cli {
    /// Host/IP to listen on
    #[arg(long, env = "PROXY_HOST", default_value = "0.0.0.0")]
    pub listen_host: String,

    /// Port to listen on
    #[arg(long, env = "PROXY_PORT", default_value_t = DEFAULT_LISTEN_PORT)]
    pub listen_port: u16,

    /// Upstream database host (required)
    #[arg(long, env = "PROXY_TARGET_HOST")]
    pub target_host: String,

    /// Upstream database port
    #[arg(long, env = "PROXY_TARGET_PORT", default_value_t = DEFAULT_TARGET_PORT)]
    pub target_port: u16,

    /// Transfer buffer size in bytes
    #[arg(long, env = "PROXY_BUFFER_SIZE", default_value_t = DEFAULT_BUFFER_SIZE)]
    pub buffer_size: usize,

    /// Timeout for connecting to the target, per session
    #[arg(long, env = "PROXY_CONNECT_TIMEOUT_SECS", default_value_t = 30)]
    pub connect_timeout_secs: u64,

    /// Timeout for the startup reachability probe
    #[arg(long, env = "PROXY_PROBE_TIMEOUT_SECS", default_value_t = 5)]
    pub probe_timeout_secs: u64,

    /// Timeout for a single forwarded write
    #[arg(long, env = "PROXY_IO_TIMEOUT_SECS", default_value_t = 30)]
    pub io_timeout_secs: u64,

    /// Readiness poll interval
    #[arg(long, env = "PROXY_POLL_INTERVAL_MS", default_value_t = 1000)]
    pub poll_interval_ms: u64,

    /// Close sessions idle for this long (0 = never)
    #[arg(long, env = "PROXY_IDLE_TIMEOUT_SECS", default_value_t = 0)]
    pub idle_timeout_secs: u64,

    /// Backoff after a transient accept error
    #[arg(long, env = "PROXY_ACCEPT_BACKOFF_MS", default_value_t = 1000)]
    pub accept_backoff_ms: u64,

    /// Listen backlog
    #[arg(long, env = "PROXY_BACKLOG", default_value_t = 128)]
    pub backlog: u32,

    /// Grace period for in-flight sessions at shutdown
    #[arg(long, env = "PROXY_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,

    /// Keep running when the target is unreachable at startup
    #[arg(
        long,
        env = "PROXY_ALLOW_UNREACHABLE_TARGET",
        value_parser = FalseyValueParser::new()
    )]
    pub allow_unreachable_target: bool,

    /// Enable verbose/debug logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl TryFrom<Cli> for RelayConfig {
    type Error = RelayError;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let target_host = cli.target_host.trim();
        if target_host.is_empty() {
            return Err(RelayError::Config(
                "PROXY_TARGET_HOST environment variable is required".into(),
            ));
        }
        if cli.listen_host.trim().is_empty() {
            return Err(RelayError::Config("listen host must not be empty".into()));
        }
        if cli.buffer_size == 0 {
            return Err(RelayError::Config("buffer size must be greater than 0".into()));
        }
        if cli.backlog == 0 {
            return Err(RelayError::Config("backlog must be greater than 0".into()));
        }
        for (name, value) in [
            ("connect timeout", cli.connect_timeout_secs),
            ("probe timeout", cli.probe_timeout_secs),
            ("io timeout", cli.io_timeout_secs),
            ("poll interval", cli.poll_interval_ms),
        ] {
            if value == 0 {
                return Err(RelayError::Config(format!("{} must be greater than 0", name)));
            }
        }

        let idle_timeout = match cli.idle_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        Ok(RelayConfig {
            listen_host: cli.listen_host.trim().to_string(),
            listen_port: cli.listen_port,
            target_host: target_host.to_string(),
            target_port: cli.target_port,
            buffer_size: cli.buffer_size,
            connect_timeout: Duration::from_secs(cli.connect_timeout_secs),
            probe_timeout: Duration::from_secs(cli.probe_timeout_secs),
            io_timeout: Duration::from_secs(cli.io_timeout_secs),
            poll_interval: Duration::from_millis(cli.poll_interval_ms),
            idle_timeout,
            accept_backoff: Duration::from_millis(cli.accept_backoff_ms),
            backlog: cli.backlog,
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
            allow_unreachable_target: cli.allow_unreachable_target,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("db-relay").chain(args.iter().copied()))
    }

    #[test]
    fn test_defaults_from_flags() {
        let cli = parse(&["--target-host", "10.8.0.1"]).unwrap();
        let config = RelayConfig::try_from(cli).unwrap();
        assert_eq!(config.listen_addr(), "0.0.0.0:5433");
        assert_eq!(config.target_addr(), "10.8.0.1:5432");
        assert_eq!(config.buffer_size, 4096);
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.accept_backoff, Duration::from_secs(1));
        assert!(config.idle_timeout.is_none());
    }

    #[test]
    fn test_overrides() {
        let cli = parse(&[
            "--listen-host",
            "127.0.0.1",
            "--listen-port",
            "6543",
            "--target-host",
            "db",
            "--target-port",
            "15432",
            "--idle-timeout-secs",
            "600",
            "--allow-unreachable-target",
        ])
        .unwrap();
        let config = RelayConfig::try_from(cli).unwrap();
        assert_eq!(config.listen_addr(), "127.0.0.1:6543");
        assert_eq!(config.target_addr(), "db:15432");
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(600)));
        assert!(config.allow_unreachable_target);
    }

    #[test]
    fn test_blank_target_host_rejected() {
        let cli = parse(&["--target-host", "   "]).unwrap();
        let err = RelayConfig::try_from(cli).unwrap_err();
        assert!(matches!(err, RelayError::Config(_)));
    }

    #[test]
    fn test_zero_buffer_rejected() {
        let cli = parse(&["--target-host", "db", "--buffer-size", "0"]).unwrap();
        assert!(RelayConfig::try_from(cli).is_err());
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let cli = parse(&["--target-host", "db", "--poll-interval-ms", "0"]).unwrap();
        let err = RelayConfig::try_from(cli).unwrap_err();
        assert!(err.to_string().contains("poll interval"));
    }
}
