//! Registry of live connections.
//!
//! All mutation happens under one mutex. Control actions never run under it:
//! [`Registry::for_each_snapshot`] copies the live set, releases the lock, and
//! then visits the copy, so a slow action cannot starve registration and an
//! action may observe an entry that tore itself down in the meantime.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::warn;

use crate::error::RelayError;

/// Identity of a registered connection. Never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

impl ConnectionId {
    /// Allocate the next identifier.
    pub fn next() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::SeqCst))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Outcome of applying an action to a snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecuteReport {
    /// Entries the action was invoked on.
    pub visited: usize,
    /// Entries for which the action returned an error.
    pub failed: usize,
}

impl ExecuteReport {
    pub fn succeeded(&self) -> usize {
        self.visited - self.failed
    }
}

#[derive(Debug)]
struct RegistryState<T> {
    entries: BTreeMap<ConnectionId, Arc<T>>,
    closed: bool,
}

/// Thread-safe, insertion-ordered set of live entries keyed by [`ConnectionId`].
#[derive(Debug)]
pub struct Registry<T> {
    state: Mutex<RegistryState<T>>,
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState {
                entries: BTreeMap::new(),
                closed: false,
            }),
        }
    }

    // The map stays consistent even if a holder panicked.
    fn lock(&self) -> MutexGuard<'_, RegistryState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add an entry. Fails once the registry has been closed.
    pub fn register(&self, id: ConnectionId, entry: Arc<T>) -> Result<(), RelayError> {
        let mut state = self.lock();
        if state.closed {
            return Err(RelayError::ShuttingDown);
        }
        state.entries.insert(id, entry);
        Ok(())
    }

    /// Remove an entry, returning it if it was present.
    pub fn unregister(&self, id: ConnectionId) -> Option<Arc<T>> {
        self.lock().entries.remove(&id)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.lock().entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Point-in-time copy of the live entries, in registration order.
    pub fn snapshot(&self) -> Vec<(ConnectionId, Arc<T>)> {
        self.lock()
            .entries
            .iter()
            .map(|(id, entry)| (*id, Arc::clone(entry)))
            .collect()
    }

    /// Apply `action` to every entry of a snapshot, outside the lock.
    ///
    /// An error from one entry is logged and counted; the remaining entries
    /// are still visited.
    pub fn for_each_snapshot<F>(&self, mut action: F) -> ExecuteReport
    where
        F: FnMut(&T) -> anyhow::Result<()>,
    {
        let snapshot = self.snapshot();
        let mut report = ExecuteReport::default();

        for (id, entry) in snapshot {
            report.visited += 1;
            if let Err(e) = action(&entry) {
                report.failed += 1;
                warn!(conn_id = %id, error = %e, "Control action failed");
            }
        }

        report
    }

    /// Stop accepting registrations and return the entries still live.
    ///
    /// Entries stay registered; the caller disposes them, which unregisters
    /// each one.
    pub fn close(&self) -> Vec<(ConnectionId, Arc<T>)> {
        let mut state = self.lock();
        state.closed = true;
        state
            .entries
            .iter()
            .map(|(id, entry)| (*id, Arc::clone(entry)))
            .collect()
    }
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}
