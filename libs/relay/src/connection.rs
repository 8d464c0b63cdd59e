//! A relayed client connection.
//!
//! A [`Connection`] pairs an accepted client socket with a freshly dialed
//! upstream socket and runs one copy task per direction. Each task owns the
//! read half of its source and the write half of its sink, so closing the
//! sockets means ending both tasks.
//!
//! Teardown happens exactly once, triggered by whichever comes first: either
//! copy loop ending, or an explicit [`Connection::dispose`]. There are no
//! half-open connections.
//!
//! The connection also keeps a duplicate handle of each socket. Teardown
//! shuts those down directly, so both peers see the close before `dispose`
//! returns even if the copy tasks have not been dropped yet.

use std::fmt;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn, Instrument};

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::registry::{ConnectionId, Registry};
use crate::stats::RelayStats;
use crate::streamer::{Direction, StreamEnd, Streamer};

/// State shared by the proxy, its listener, and every connection.
#[derive(Debug)]
pub(crate) struct RelayContext {
    pub(crate) config: RelayConfig,
    pub(crate) registry: Registry<Connection>,
    pub(crate) stats: Arc<RelayStats>,
}

impl RelayContext {
    pub(crate) fn new(config: RelayConfig) -> Self {
        Self {
            config,
            registry: Registry::new(),
            stats: Arc::new(RelayStats::default()),
        }
    }
}

/// One client paired with its upstream.
pub struct Connection {
    id: ConnectionId,
    peer_addr: SocketAddr,
    upstream_addr: SocketAddr,
    client_to_upstream: Streamer,
    upstream_to_client: Streamer,
    ctx: Arc<RelayContext>,
    disposed: AtomicBool,
    workers: Mutex<Vec<AbortHandle>>,
    sockets: Mutex<Vec<std::net::TcpStream>>,
    closed: watch::Sender<bool>,
}

impl Connection {
    /// Dial the upstream for an accepted client, register, and start relaying.
    ///
    /// A dial failure is returned before anything is registered or started;
    /// the client socket is dropped with it.
    pub(crate) async fn open(
        ctx: Arc<RelayContext>,
        client: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<Arc<Self>, RelayError> {
        let target = ctx.config.target().to_string();
        debug!(upstream = %target, "Dialing upstream");

        let upstream = TcpStream::connect((ctx.config.target_host.as_str(), ctx.config.target_port))
            .await
            .map_err(|source| RelayError::Connect {
                target: target.clone(),
                source,
            })?;
        let upstream_addr = upstream.peer_addr()?;

        // Forward small writes without Nagle delay.
        for stream in [&client, &upstream] {
            if let Err(e) = stream.set_nodelay(true) {
                debug!(error = %e, "Failed to set TCP_NODELAY");
            }
        }

        let (client, client_handle) = with_shutdown_handle(client)?;
        let (upstream, upstream_handle) = with_shutdown_handle(upstream)?;

        let (closed, _) = watch::channel(false);
        let conn = Arc::new(Self {
            id: ConnectionId::next(),
            peer_addr,
            upstream_addr,
            client_to_upstream: Streamer::new(Direction::ClientToUpstream, Arc::clone(&ctx.stats)),
            upstream_to_client: Streamer::new(Direction::UpstreamToClient, Arc::clone(&ctx.stats)),
            ctx,
            disposed: AtomicBool::new(false),
            workers: Mutex::new(Vec::with_capacity(2)),
            sockets: Mutex::new(vec![upstream_handle, client_handle]),
            closed,
        });

        // Counted before registering so a racing dispose never underflows it.
        let stats = &conn.ctx.stats;
        stats.connections_active.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = conn.ctx.registry.register(conn.id, Arc::clone(&conn)) {
            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
            return Err(e);
        }

        conn.start(client, upstream);

        info!(
            conn_id = %conn.id,
            peer_addr = %peer_addr,
            upstream_addr = %upstream_addr,
            "Connection established"
        );

        Ok(conn)
    }

    /// Spawn both copy tasks together.
    fn start(self: &Arc<Self>, client: TcpStream, upstream: TcpStream) {
        let (client_read, client_write) = client.into_split();
        let (upstream_read, upstream_write) = upstream.into_split();

        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        workers.push(self.spawn_worker(Direction::ClientToUpstream, client_read, upstream_write));
        workers.push(self.spawn_worker(Direction::UpstreamToClient, upstream_read, client_write));

        // A worker may already have finished and disposed before its handle was stored.
        if self.disposed.load(Ordering::SeqCst) {
            for worker in workers.drain(..) {
                worker.abort();
            }
        }
    }

    fn spawn_worker(
        self: &Arc<Self>,
        direction: Direction,
        source: OwnedReadHalf,
        sink: OwnedWriteHalf,
    ) -> AbortHandle {
        let conn = Arc::clone(self);
        let span = tracing::info_span!("streamer", conn_id = %self.id, direction = %direction);

        tokio::spawn(
            async move {
                let buffer_size = conn.ctx.config.buffer_size;
                let end = conn.streamer(direction).run(source, sink, buffer_size).await;
                match &end {
                    StreamEnd::Eof => debug!("Source closed"),
                    StreamEnd::ReadFailed(e) => warn!(error = %e, "Read from source failed"),
                    StreamEnd::WriteFailed(e) => warn!(error = %e, "Write to sink failed"),
                }
                conn.dispose();
            }
            .instrument(span),
        )
        .abort_handle()
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Address of the relayed client.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Address of the upstream this connection dialed.
    pub fn upstream_addr(&self) -> SocketAddr {
        self.upstream_addr
    }

    /// Controls for bytes flowing from the client to the upstream.
    pub fn client_to_upstream(&self) -> &Streamer {
        &self.client_to_upstream
    }

    /// Controls for bytes flowing from the upstream to the client.
    pub fn upstream_to_client(&self) -> &Streamer {
        &self.upstream_to_client
    }

    pub fn streamer(&self, direction: Direction) -> &Streamer {
        match direction {
            Direction::ClientToUpstream => &self.client_to_upstream,
            Direction::UpstreamToClient => &self.upstream_to_client,
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Tear the connection down: unregister and close both sockets.
    ///
    /// Idempotent and safe to race; only the first call does any work. Both
    /// sockets are shut down before this returns; their descriptors are
    /// released once the runtime drops the cancelled copy tasks.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        if self.ctx.registry.unregister(self.id).is_none() {
            debug!(conn_id = %self.id, "Connection was not registered");
        }

        let workers = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for worker in workers {
            worker.abort();
        }

        // Upstream first, then client.
        let sockets = std::mem::take(
            &mut *self.sockets.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for socket in sockets {
            if let Err(e) = socket.shutdown(Shutdown::Both) {
                debug!(conn_id = %self.id, error = %e, "Socket already closed");
            }
        }

        self.ctx
            .stats
            .connections_active
            .fetch_sub(1, Ordering::Relaxed);
        self.ctx
            .stats
            .connections_closed
            .fetch_add(1, Ordering::Relaxed);
        self.closed.send_replace(true);

        info!(
            conn_id = %self.id,
            peer_addr = %self.peer_addr,
            bytes_to_upstream = self.client_to_upstream.bytes_forwarded(),
            bytes_to_client = self.upstream_to_client.bytes_forwarded(),
            bytes_dropped =
                self.client_to_upstream.bytes_dropped() + self.upstream_to_client.bytes_dropped(),
            "Connection disposed"
        );
    }

    /// Wait until the connection has been torn down.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

/// Duplicate `stream` so the socket can be shut down while the original is
/// owned by a copy task.
fn with_shutdown_handle(stream: TcpStream) -> io::Result<(TcpStream, std::net::TcpStream)> {
    let stream = stream.into_std()?;
    let handle = stream.try_clone()?;
    Ok((TcpStream::from_std(stream)?, handle))
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("upstream_addr", &self.upstream_addr)
            .field("client_to_upstream", &self.client_to_upstream)
            .field("upstream_to_client", &self.upstream_to_client)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
