//! faultline relay
//!
//! A TCP relay that sits between a client and a real upstream and lets test
//! code drop or stall traffic on either direction of any live connection.
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> Connection --(client_to_upstream Streamer)--> Upstream
//!                          |       <-(upstream_to_client Streamer)--
//!                          v
//!                       Registry <- Proxy::execute(action)
//! ```
//!
//! Faults are per direction:
//! - **drop**: chunks are read and discarded; the connection stays open.
//! - **suspend**: forwarding stalls until resumed; nothing is lost.

mod config;
mod connection;
mod error;
mod gate;
mod listener;
mod proxy;
mod registry;
mod stats;
mod streamer;

pub use config::{RelayConfig, Target, DEFAULT_BACKLOG, DEFAULT_BUFFER_SIZE};
pub use connection::Connection;
pub use error::RelayError;
pub use gate::Gate;
pub use proxy::Proxy;
pub use registry::{ConnectionId, ExecuteReport, Registry};
pub use stats::{RelayStats, RelayStatsSnapshot};
pub use streamer::{Direction, StreamEnd, Streamer};
