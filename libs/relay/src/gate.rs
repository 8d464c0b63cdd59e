//! Open/closed gate used to suspend a streamer.

use tokio::sync::watch;

/// A gate tasks wait on while it is closed.
///
/// Closing never interrupts a task that already passed the gate; it only
/// blocks the next [`Gate::wait_open`]. Opening wakes every waiter.
#[derive(Debug)]
pub struct Gate {
    open: watch::Sender<bool>,
}

impl Gate {
    /// Create an open gate.
    pub fn new() -> Self {
        let (open, _) = watch::channel(true);
        Self { open }
    }

    pub fn open(&self) -> bool {
        self.set_open(true)
    }

    pub fn close(&self) -> bool {
        self.set_open(false)
    }

    /// Set the gate state, notifying waiters only on an actual change.
    ///
    /// Returns whether the state changed. Of several racing callers setting
    /// the same state, exactly one sees `true`.
    pub fn set_open(&self, open: bool) -> bool {
        self.open.send_if_modified(|current| {
            let changed = *current != open;
            *current = open;
            changed
        })
    }

    pub fn is_open(&self) -> bool {
        *self.open.borrow()
    }

    /// Wait until the gate is open. Returns immediately if it already is.
    pub async fn wait_open(&self) {
        let mut rx = self.open.subscribe();
        // The sender lives as long as `self`, so this cannot observe a closed channel.
        let _ = rx.wait_for(|open| *open).await;
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}
