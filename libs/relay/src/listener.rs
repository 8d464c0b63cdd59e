//! Loopback listener and accept loop.
//!
//! Every accepted client gets its own task that dials the upstream and, on
//! success, becomes a registered [`Connection`]. A slow or failing upstream
//! therefore never blocks accepting further clients.
//!
//! The listening socket lives in a slot shared with the accept loop.
//! [`Listener::close`] empties the slot, so the port is released before it
//! returns; the loop notices on its next poll and exits.

use std::future::poll_fn;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::Poll;
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::{debug, error, info, warn, Instrument};

use crate::connection::{Connection, RelayContext};
use crate::error::RelayError;

/// Pause after a failed accept before trying again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// A bound loopback listener.
#[derive(Debug)]
pub(crate) struct Listener {
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
}

impl Listener {
    /// Bind `127.0.0.1:port` with the given backlog.
    pub(crate) async fn bind(port: u16, backlog: u32) -> Result<Self, RelayError> {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let bind_err = |source| RelayError::Bind { addr, source };

        let socket = TcpSocket::new_v4().map_err(bind_err)?;
        socket.set_reuseaddr(true).map_err(bind_err)?;
        socket.bind(addr).map_err(bind_err)?;
        let listener = socket.listen(backlog).map_err(bind_err)?;
        let local_addr = listener.local_addr()?;

        info!(bind_addr = %local_addr, backlog, "Listener bound");

        Ok(Self {
            listener: Mutex::new(Some(listener)),
            local_addr,
        })
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Close the listening socket. Returns `false` if it was already closed.
    pub(crate) fn close(&self) -> bool {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match listener {
            Some(listener) => {
                drop(listener);
                info!(bind_addr = %self.local_addr, "Listener closed");
                true
            }
            None => false,
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Next accepted client, or `None` once the listener is closed.
    ///
    /// The lock is held only while polling, never across a suspension point.
    async fn accept(&self) -> Option<io::Result<(TcpStream, SocketAddr)>> {
        poll_fn(|cx| {
            let slot = self.listener.lock().unwrap_or_else(PoisonError::into_inner);
            match slot.as_ref() {
                Some(listener) => listener.poll_accept(cx).map(Some),
                None => Poll::Ready(None),
            }
        })
        .await
    }

    /// Accept clients until the listener is closed.
    ///
    /// A loop parked in `accept` is not woken by [`Listener::close`]; the
    /// owner aborts the task after closing.
    pub(crate) async fn run(self: Arc<Self>, ctx: Arc<RelayContext>) {
        info!(bind_addr = %self.local_addr, upstream = %ctx.config.target(), "Listener started");

        while let Some(accepted) = self.accept().await {
            match accepted {
                Ok((stream, peer_addr)) => {
                    ctx.stats
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed);
                    debug!(peer_addr = %peer_addr, "Accepted client");

                    let ctx = Arc::clone(&ctx);
                    tokio::spawn(
                        open_connection(ctx, stream, peer_addr)
                            .instrument(tracing::info_span!("connection", peer = %peer_addr)),
                    );
                }
                Err(e) => {
                    ctx.stats.accept_errors.fetch_add(1, Ordering::Relaxed);
                    error!(error = %e, "Accept error");
                    // Brief sleep to avoid tight loop on persistent errors
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }

        debug!(bind_addr = %self.local_addr, "Accept loop stopped");
    }
}

async fn open_connection(ctx: Arc<RelayContext>, stream: TcpStream, peer_addr: SocketAddr) {
    match Connection::open(Arc::clone(&ctx), stream, peer_addr).await {
        Ok(_) => {}
        Err(RelayError::ShuttingDown) => {
            debug!("Relay shutting down, dropping client");
        }
        Err(e) => {
            if e.is_connect() {
                ctx.stats
                    .upstream_connect_failed
                    .fetch_add(1, Ordering::Relaxed);
            }
            warn!(error = %e, "Failed to open connection");
        }
    }
}
