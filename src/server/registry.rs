//! Bookkeeping of every live resource a server must close on shutdown.

use std::collections::HashMap;
use std::net::SocketAddr;

use tokio_util::sync::CancellationToken;

/// The set of currently-open listeners and connections owned by one
/// server instance.
///
/// Each tracked resource is represented by the cancellation token its
/// owning loop observes at suspension points; signaling the token is
/// the close operation. Signaling is idempotent, so closing an
/// already-closed resource is harmless — one stuck resource can never
/// prevent the rest from closing. Membership means open: a resource is
/// untracked before or together with being closed.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    next_id: u64,
    listeners: HashMap<u64, TrackedListener>,
    connections: HashMap<u64, CancellationToken>,
}

#[derive(Debug)]
struct TrackedListener {
    token: CancellationToken,
    addr: Option<SocketAddr>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Tracks a listener; returns its id and the token its accept loop
    /// must observe.
    pub(crate) fn track_listener(&mut self, addr: Option<SocketAddr>) -> (u64, CancellationToken) {
        let id = self.next_id();
        let token = CancellationToken::new();
        self.listeners
            .insert(id, TrackedListener { token: token.clone(), addr });
        (id, token)
    }

    /// Untracks a listener. A no-op if `close_all` already drained it.
    pub(crate) fn untrack_listener(&mut self, id: u64) {
        self.listeners.remove(&id);
    }

    /// Tracks a connection; returns its id and the token its exchange
    /// loop must observe.
    pub(crate) fn track_connection(&mut self) -> (u64, CancellationToken) {
        let id = self.next_id();
        let token = CancellationToken::new();
        self.connections.insert(id, token.clone());
        (id, token)
    }

    /// Untracks a connection. A no-op if `close_all` already drained it.
    pub(crate) fn untrack_connection(&mut self, id: u64) {
        self.connections.remove(&id);
    }

    /// Closes every tracked listener and connection, then clears both
    /// sets. Loops suspended on a closed resource unwind through their
    /// own untrack-and-drop exit path.
    pub(crate) fn close_all(&mut self) {
        for tracked in self.listeners.values() {
            tracked.token.cancel();
        }
        self.listeners.clear();
        for token in self.connections.values() {
            token.cancel();
        }
        self.connections.clear();
    }

    /// Bound addresses of all tracked listeners.
    pub(crate) fn addresses(&self) -> Vec<SocketAddr> {
        self.listeners
            .values()
            .filter_map(|tracked| tracked.addr)
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    #[cfg(test)]
    pub(crate) fn connection_count(&self) -> usize {
        self.connections.len()
    }
}
