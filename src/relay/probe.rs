//! Target Liveness Probe
//!
//! One throwaway connection to the target at startup, so a misconfigured
//! target host/port is caught before the listener starts accepting.

use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{error, info};

use crate::config::RelayConfig;

/// Check whether the configured target accepts TCP connections.
///
/// Never fails by itself: refused, timed out and unresolvable targets all
/// come back as `false` with the cause logged. The caller decides whether
/// that aborts startup.
pub async fn probe_target(config: &RelayConfig) -> bool {
    probe(&config.target_host, config.target_port, config.probe_timeout).await
}

/// Probe an arbitrary host:port with a bounded timeout
pub async fn probe(host: &str, port: u16, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => {
            drop(stream);
            info!("✅ Target {}:{} is reachable", host, port);
            true
        }
        Ok(Err(e)) => {
            error!("❌ Cannot reach target {}:{}: {}", host, port, e);
            false
        }
        Err(_) => {
            error!(
                "❌ Cannot reach target {}:{}: timed out after {:?}",
                host, port, timeout
            );
            false
        }
    }
}
