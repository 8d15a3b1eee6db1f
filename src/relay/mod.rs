//! TCP Relay Module
//!
//! Accepts inbound connections and forwards their bytes, untouched, to a
//! single fixed upstream target.

mod error;
mod forwarder;
mod listener;
mod probe;
mod session;
mod stats;

pub use error::RelayError;
pub use forwarder::{CloseReason, ForwardReport, Forwarder, Side};
pub use listener::{classify_accept_error, AcceptErrorClass, RelayListener};
pub use probe::{probe, probe_target};
pub use session::{SessionManager, SessionState};
pub use stats::{RelayStats, StatsHandle};
