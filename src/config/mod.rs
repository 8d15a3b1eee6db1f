//! Configuration Module
//!
//! Endpoint configuration for the relay, loaded from flags or environment.

pub mod cli;
pub mod types;

pub use cli::Cli;
pub use types::{
    RelayConfig, DEFAULT_BUFFER_SIZE, DEFAULT_LISTEN_HOST, DEFAULT_LISTEN_PORT,
    DEFAULT_TARGET_PORT, MIN_POLL_INTERVAL,
};
