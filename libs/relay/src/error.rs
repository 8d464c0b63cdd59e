//! Relay errors.
//!
//! Only setup failures surface as errors: binding the listen socket and
//! dialing the upstream. Failures inside copy loops and teardown are logged
//! and counted instead.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Errors returned by relay setup operations.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The listen socket could not be created, bound, or put in listen mode.
    #[error("failed to bind relay listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Dialing the upstream target failed.
    #[error("failed to connect to upstream {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: io::Error,
    },

    /// The relay was disposed; no new connections are accepted.
    #[error("relay is shutting down")]
    ShuttingDown,

    /// Other socket error during setup.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl RelayError {
    /// Whether the error came from dialing the upstream.
    pub fn is_connect(&self) -> bool {
        matches!(self, Self::Connect { .. })
    }
}
