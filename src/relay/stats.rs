//! Relay statistics
//!
//! Process-wide counters. Sessions only ever add to them; no session state
//! lives here.

use std::sync::Arc;

use parking_lot::RwLock;

/// Snapshot of relay counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Total connections accepted
    pub connection_count: u64,
    /// Sessions currently alive (accepted and not yet torn down)
    pub active_connections: u64,
    /// Sessions whose target connect failed
    pub failed_connects: u64,
    /// Total bytes forwarded client -> target
    pub bytes_to_target: u64,
    /// Total bytes forwarded target -> client
    pub bytes_to_client: u64,
}

/// Shared handle to the relay counters
#[derive(Debug, Clone, Default)]
pub struct StatsHandle {
    inner: Arc<RwLock<RelayStats>>,
}

impl StatsHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current counters
    pub fn snapshot(&self) -> RelayStats {
        self.inner.read().clone()
    }

    /// Number of live sessions
    pub fn active(&self) -> u64 {
        self.inner.read().active_connections
    }

    pub(crate) fn session_opened(&self) {
        let mut s = self.inner.write();
        s.connection_count += 1;
        s.active_connections += 1;
    }

    pub(crate) fn session_closed(&self) {
        let mut s = self.inner.write();
        s.active_connections = s.active_connections.saturating_sub(1);
    }

    pub(crate) fn connect_failed(&self) {
        self.inner.write().failed_connects += 1;
    }

    pub(crate) fn add_bytes(&self, to_target: u64, to_client: u64) {
        let mut s = self.inner.write();
        s.bytes_to_target += to_target;
        s.bytes_to_client += to_client;
    }
}

/// Decrements the active session count when dropped, so an aborted session
/// task is still accounted for.
pub(crate) struct ActiveSessionGuard {
    stats: StatsHandle,
}

impl ActiveSessionGuard {
    pub(crate) fn new(stats: StatsHandle) -> Self {
        stats.session_opened();
        Self { stats }
    }
}

impl Drop for ActiveSessionGuard {
    fn drop(&mut self) {
        self.stats.session_closed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_tracks_active_sessions() {
        let stats = StatsHandle::new();
        {
            let _a = ActiveSessionGuard::new(stats.clone());
            let _b = ActiveSessionGuard::new(stats.clone());
            assert_eq!(stats.active(), 2);
        }
        let snap = stats.snapshot();
        assert_eq!(snap.active_connections, 0);
        assert_eq!(snap.connection_count, 2);
    }

    #[test]
    fn test_byte_and_failure_counters() {
        let stats = StatsHandle::new();
        stats.add_bytes(10, 4);
        stats.add_bytes(1, 0);
        stats.connect_failed();
        let snap = stats.snapshot();
        assert_eq!(snap.bytes_to_target, 11);
        assert_eq!(snap.bytes_to_client, 4);
        assert_eq!(snap.failed_connects, 1);
    }

    #[test]
    fn test_closed_never_underflows() {
        let stats = StatsHandle::new();
        stats.session_closed();
        assert_eq!(stats.active(), 0);
    }
}
