//! Relay configuration.

use std::fmt;

/// Default backlog for the listen socket.
pub const DEFAULT_BACKLOG: u32 = 16;

/// Default size of the per-direction copy buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Construction parameters for a [`Proxy`](crate::Proxy).
///
/// The relay always listens on loopback. A `listen_port` of 0 picks an
/// ephemeral port; use [`Proxy::local_addr`](crate::Proxy::local_addr) to
/// find out which one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Upstream host name or address.
    pub target_host: String,
    /// Upstream port.
    pub target_port: u16,
    /// Loopback port to accept clients on.
    pub listen_port: u16,
    /// Listen backlog.
    pub backlog: u32,
    /// Copy buffer size per direction.
    pub buffer_size: usize,
}

impl RelayConfig {
    /// Create a configuration with default backlog and buffer size.
    pub fn new(target_host: impl Into<String>, target_port: u16, listen_port: u16) -> Self {
        Self {
            target_host: target_host.into(),
            target_port,
            listen_port,
            backlog: DEFAULT_BACKLOG,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }

    pub fn with_backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog.max(1);
        self
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }

    /// The upstream target as `host:port`.
    pub fn target(&self) -> Target<'_> {
        Target {
            host: &self.target_host,
            port: self.target_port,
        }
    }
}

/// Display helper for the upstream target.
#[derive(Debug, Clone, Copy)]
pub struct Target<'a> {
    host: &'a str,
    port: u16,
}

impl fmt::Display for Target<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') && !self.host.starts_with('[') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}
