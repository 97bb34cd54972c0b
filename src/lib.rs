//! Multi-endpoint websocket connection manager for the GRVT venue
//!
//! Keeps one websocket per venue endpoint (public market data and private
//! trade data, partial and full feeds), gates private endpoints on a
//! session credential and opens every transport with the same keepalive
//! tunables. Connect attempts are idempotent and never raise; retry
//! scheduling belongs to the caller.

pub mod core;
pub mod infrastructure;
pub mod ws;

#[cfg(test)]
pub mod test_utils;

// Re-export commonly used types
pub use crate::core::{
    AuthHeaders, CredentialSource, EndpointType, EndpointUrls, GrvtEnv, SessionCredential,
    SharedCredential,
};
pub use infrastructure::config::Config;
pub use ws::{ConnectOutcome, ConnectionManager, KeepaliveConfig, SubscriptionRegistry};

use thiserror::Error;

/// Main error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] infrastructure::config::ConfigError),

    #[error("Endpoint error: {0}")]
    Endpoint(#[from] crate::core::EndpointError),

    #[error("Logging error: {0}")]
    Logging(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
