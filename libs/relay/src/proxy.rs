//! The relay's composition root.
//!
//! A [`Proxy`] binds the listener and starts accepting as soon as it is
//! constructed. Test code drives faults through [`Proxy::execute`], which
//! applies an action to a snapshot of every live connection:
//!
//! ```ignore
//! let proxy = Proxy::bind(RelayConfig::new("127.0.0.1", 5672, 0)).await?;
//!
//! // Partition client -> upstream on every connection.
//! proxy.execute(|conn| conn.client_to_upstream().set_drop(true));
//!
//! // Stall responses.
//! proxy.execute(|conn| conn.upstream_to_client().set_suspended(true));
//!
//! proxy.dispose();
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinHandle;
use tracing::{info, Instrument};

use crate::config::RelayConfig;
use crate::connection::{Connection, RelayContext};
use crate::error::RelayError;
use crate::listener::Listener;
use crate::registry::ExecuteReport;
use crate::stats::RelayStatsSnapshot;

/// Fault-injecting TCP relay.
#[derive(Debug)]
pub struct Proxy {
    ctx: Arc<RelayContext>,
    listener: Arc<Listener>,
    local_addr: SocketAddr,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl Proxy {
    /// Bind the loopback listener and start accepting clients.
    ///
    /// Binding failures are returned; everything after that is logged.
    pub async fn bind(config: RelayConfig) -> Result<Self, RelayError> {
        let listener = Arc::new(Listener::bind(config.listen_port, config.backlog).await?);
        let local_addr = listener.local_addr();
        let ctx = Arc::new(RelayContext::new(config));

        let span = tracing::info_span!("relay", listen_addr = %local_addr);
        let accept_task = tokio::spawn(
            Arc::clone(&listener)
                .run(Arc::clone(&ctx))
                .instrument(span),
        );

        Ok(Self {
            ctx,
            listener,
            local_addr,
            accept_task: Mutex::new(Some(accept_task)),
            disposed: AtomicBool::new(false),
        })
    }

    /// Address clients should connect to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &RelayConfig {
        &self.ctx.config
    }

    pub fn stats(&self) -> RelayStatsSnapshot {
        self.ctx.stats.snapshot()
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.ctx.registry.len()
    }

    /// Snapshot of the live connections, oldest first.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.ctx
            .registry
            .snapshot()
            .into_iter()
            .map(|(_, conn)| conn)
            .collect()
    }

    /// Apply `action` to every live connection.
    pub fn execute<F>(&self, mut action: F) -> ExecuteReport
    where
        F: FnMut(&Connection),
    {
        self.try_execute(|conn| {
            action(conn);
            Ok(())
        })
    }

    /// Apply a fallible `action` to every live connection.
    ///
    /// Runs on a snapshot taken under the registry lock; the action itself
    /// runs without it. Failures are logged and counted and do not stop the
    /// remaining connections from being visited.
    pub fn try_execute<F>(&self, action: F) -> ExecuteReport
    where
        F: FnMut(&Connection) -> anyhow::Result<()>,
    {
        let report = self.ctx.registry.for_each_snapshot(action);
        if report.failed > 0 {
            self.ctx
                .stats
                .action_failures
                .fetch_add(report.failed as u64, Ordering::Relaxed);
        }
        report
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Stop listening, then dispose every live connection.
    ///
    /// Idempotent. The listening socket and every connection's sockets are
    /// closed by the time this returns, so the port can be bound again right
    /// away. Connections whose upstream dial is still in flight are refused
    /// registration and closed as well.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.listener.close();
        if let Some(accept_task) = self
            .accept_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            accept_task.abort();
        }

        let remaining = self.ctx.registry.close();
        let count = remaining.len();
        for (_, conn) in remaining {
            conn.dispose();
        }

        info!(
            listen_addr = %self.local_addr,
            connections_disposed = count,
            "Relay disposed"
        );
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        self.dispose();
    }
}
