//! relayd configuration.
//!
//! Everything comes from environment variables; there is no config file.

use anyhow::{Context, Result};
use faultline_relay::{RelayConfig, DEFAULT_BACKLOG, DEFAULT_BUFFER_SIZE};

/// Largest accepted copy buffer.
const MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// relayd configuration (env-driven).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Upstream host (default 127.0.0.1).
    pub target_host: String,

    /// Upstream port.
    pub target_port: u16,

    /// Loopback port to listen on.
    pub listen_port: u16,

    /// Copy buffer size per direction.
    pub buffer_size: usize,

    /// Listen backlog.
    pub backlog: u32,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let target_host =
            lookup("FAULTLINE_TARGET_HOST").unwrap_or_else(|| "127.0.0.1".to_string());

        let target_port: u16 = lookup("FAULTLINE_TARGET_PORT")
            .context("Missing upstream port. Set FAULTLINE_TARGET_PORT.")?
            .parse()
            .context("FAULTLINE_TARGET_PORT must be a port number.")?;

        let listen_port: u16 = lookup("FAULTLINE_LISTEN_PORT")
            .context("Missing listen port. Set FAULTLINE_LISTEN_PORT.")?
            .parse()
            .context("FAULTLINE_LISTEN_PORT must be a port number.")?;

        let buffer_size: usize = lookup("FAULTLINE_BUFFER_SIZE")
            .map(|v| v.parse())
            .transpose()
            .context("FAULTLINE_BUFFER_SIZE must be an integer (bytes).")?
            .unwrap_or(DEFAULT_BUFFER_SIZE)
            .clamp(1, MAX_BUFFER_SIZE);

        let backlog: u32 = lookup("FAULTLINE_BACKLOG")
            .map(|v| v.parse())
            .transpose()
            .context("FAULTLINE_BACKLOG must be an integer.")?
            .unwrap_or(DEFAULT_BACKLOG)
            .max(1);

        let log_level = lookup("FAULTLINE_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            target_host,
            target_port,
            listen_port,
            buffer_size,
            backlog,
            log_level,
        })
    }

    /// Relay engine configuration.
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig::new(self.target_host.clone(), self.target_port, self.listen_port)
            .with_backlog(self.backlog)
            .with_buffer_size(self.buffer_size)
    }
}
