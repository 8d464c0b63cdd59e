//! Unidirectional copy loop with drop and suspend faults.
//!
//! A [`Streamer`] is the control handle for one direction of a connection.
//! Its copy loop reads a chunk from the source and writes it to the sink,
//! consulting the drop flag and the suspend gate on every iteration:
//!
//! ```text
//! wait gate -> read chunk -> (EOF/error: stop) -> wait gate -> drop? -> write chunk
//! ```
//!
//! Fault changes are picked up on the next iteration. A read already in
//! flight is not interrupted, so a suspend requested while the loop waits on
//! the source holds that one chunk until the gate reopens.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use crate::gate::Gate;
use crate::stats::RelayStats;

/// Direction of traffic through a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Bytes sent by the client, forwarded to the upstream.
    ClientToUpstream,
    /// Bytes sent by the upstream, forwarded to the client.
    UpstreamToClient,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::ClientToUpstream, Direction::UpstreamToClient];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientToUpstream => "client_to_upstream",
            Self::UpstreamToClient => "upstream_to_client",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a copy loop ended.
#[derive(Debug)]
pub enum StreamEnd {
    /// The source reached end of stream.
    Eof,
    /// Reading from the source failed.
    ReadFailed(io::Error),
    /// Writing to the sink failed.
    WriteFailed(io::Error),
}

impl StreamEnd {
    pub fn is_eof(&self) -> bool {
        matches!(self, Self::Eof)
    }
}

/// Fault controls and counters for one direction.
#[derive(Debug)]
pub struct Streamer {
    direction: Direction,
    drop_traffic: AtomicBool,
    gate: Gate,
    bytes_forwarded: AtomicU64,
    bytes_dropped: AtomicU64,
    relay_stats: Arc<RelayStats>,
}

impl Streamer {
    pub fn new(direction: Direction, relay_stats: Arc<RelayStats>) -> Self {
        Self {
            direction,
            drop_traffic: AtomicBool::new(false),
            gate: Gate::new(),
            bytes_forwarded: AtomicU64::new(0),
            bytes_dropped: AtomicU64::new(0),
            relay_stats,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Discard (`true`) or forward (`false`) chunks read from now on.
    ///
    /// The source keeps being drained while dropping; the peer never learns
    /// about the loss.
    pub fn set_drop(&self, drop: bool) {
        let previous = self.drop_traffic.swap(drop, Ordering::SeqCst);
        if previous != drop {
            debug!(direction = %self.direction, drop, "Drop fault changed");
        }
    }

    pub fn is_dropping(&self) -> bool {
        self.drop_traffic.load(Ordering::SeqCst)
    }

    /// Stall (`true`) or resume (`false`) forwarding. Nothing is lost.
    pub fn set_suspended(&self, suspended: bool) {
        if self.gate.set_open(!suspended) {
            debug!(direction = %self.direction, suspended, "Suspend fault changed");
        }
    }

    pub fn is_suspended(&self) -> bool {
        !self.gate.is_open()
    }

    /// Clear both faults.
    pub fn reset(&self) {
        self.set_drop(false);
        self.set_suspended(false);
    }

    /// Bytes written to the sink so far.
    pub fn bytes_forwarded(&self) -> u64 {
        self.bytes_forwarded.load(Ordering::Relaxed)
    }

    /// Bytes read from the source and discarded so far.
    pub fn bytes_dropped(&self) -> u64 {
        self.bytes_dropped.load(Ordering::Relaxed)
    }

    /// Run the copy loop until the source ends or an I/O error occurs.
    ///
    /// Source and sink are consumed so they are closed as soon as the loop
    /// returns (or its future is dropped).
    pub async fn run<R, W>(&self, mut source: R, mut sink: W, buffer_size: usize) -> StreamEnd
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut buf = vec![0u8; buffer_size.max(1)];

        loop {
            self.gate.wait_open().await;

            let n = match source.read(&mut buf).await {
                Ok(0) => return StreamEnd::Eof,
                Ok(n) => n,
                Err(e) => return StreamEnd::ReadFailed(e),
            };

            // Suspend gates forwarding, not just reading.
            self.gate.wait_open().await;

            if self.drop_traffic.load(Ordering::SeqCst) {
                self.bytes_dropped.fetch_add(n as u64, Ordering::Relaxed);
                self.relay_stats
                    .bytes_dropped
                    .fetch_add(n as u64, Ordering::Relaxed);
                trace!(direction = %self.direction, bytes = n, "Dropped chunk");
                continue;
            }

            if let Err(e) = sink.write_all(&buf[..n]).await {
                return StreamEnd::WriteFailed(e);
            }

            self.bytes_forwarded.fetch_add(n as u64, Ordering::Relaxed);
            self.direction_counter().fetch_add(n as u64, Ordering::Relaxed);
            trace!(direction = %self.direction, bytes = n, "Forwarded chunk");
        }
    }

    fn direction_counter(&self) -> &AtomicU64 {
        match self.direction {
            Direction::ClientToUpstream => &self.relay_stats.bytes_client_to_upstream,
            Direction::UpstreamToClient => &self.relay_stats.bytes_upstream_to_client,
        }
    }
}
