//! Relay Error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Bind failed: {0}")]
    BindFailed(String),

    #[error("Target unreachable: {0}")]
    TargetUnreachable(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Listener closed: {0}")]
    ListenerClosed(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl RelayError {
    /// Map a bind/listen failure to a message an operator can act on
    pub fn from_bind(addr: &str, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::AddrInUse => RelayError::BindFailed(format!(
                "Port already in use: {}. Another process (or a second relay instance) owns it.",
                addr
            )),
            std::io::ErrorKind::PermissionDenied => RelayError::BindFailed(format!(
                "Permission denied binding to {}. Ports below 1024 require elevated privileges.",
                addr
            )),
            std::io::ErrorKind::AddrNotAvailable => RelayError::BindFailed(format!(
                "Address not available: {}. The specified address is not valid on this system.",
                addr
            )),
            _ => RelayError::BindFailed(format!("Failed to bind to {}: {}", addr, err)),
        }
    }
}
