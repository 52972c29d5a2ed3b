//! Shared table of channels, keyed by peer address.
//!
//! The table is the single synchronization boundary between the acceptor,
//! the handshake workers, and the orchestrator. One lock covers both
//! single-entry mutations and the table-wide predicates so readiness is
//! never observed torn across concurrent state transitions. A condvar
//! lets the orchestrator wait for convergence with bounded latency
//! instead of sleeping a fixed interval.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use crate::channel::{Channel, ChannelState, PeerAddress};

// ============================================================================
// Connection Table
// ============================================================================

/// Concurrency-safe map from peer address to channel, with the aggregate
/// queries the orchestrator converges on.
pub struct ConnectionTable {
    inner: Mutex<HashMap<PeerAddress, Arc<Channel>>>,
    changed: Condvar,
}

impl ConnectionTable {
    pub fn new() -> Self {
        ConnectionTable {
            inner: Mutex::new(HashMap::new()),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PeerAddress, Arc<Channel>>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert a channel under `address`. Entries are expected to be added
    /// only before workers start, one per peer; a duplicate key should
    /// not occur and is resolved by overwriting the previous entry with a
    /// warning.
    pub fn add(&self, address: PeerAddress, channel: Arc<Channel>) {
        let mut map = self.lock();
        if map.insert(address, channel).is_some() {
            log::warn!("duplicate channel entry for {} overwritten", address);
        }
    }

    pub fn get(&self, address: &PeerAddress) -> Option<Arc<Channel>> {
        self.lock().get(address).cloned()
    }

    pub fn remove(&self, address: &PeerAddress) -> Option<Arc<Channel>> {
        self.lock().remove(address)
    }

    pub fn count(&self) -> usize {
        self.lock().len()
    }

    pub fn addresses(&self) -> Vec<PeerAddress> {
        self.lock().keys().copied().collect()
    }

    /// True iff every entry is `Ready`. Vacuously true for an empty
    /// table, which is what a fully pruned lenient setup returns.
    pub fn all_ready(&self) -> bool {
        self.lock()
            .values()
            .all(|ch| ch.state() == ChannelState::Ready)
    }

    /// True if any entry is in `Error` state.
    pub fn any_failed(&self) -> bool {
        self.lock()
            .values()
            .any(|ch| ch.state() == ChannelState::Error)
    }

    /// True iff every entry has reached a terminal state (ready, error or
    /// closed); no further progress will happen on its own.
    pub fn all_settled(&self) -> bool {
        self.lock().values().all(|ch| ch.state().is_terminal())
    }

    /// Remove and close every entry that is not `Ready`. Returns the
    /// number of entries removed.
    pub fn prune_not_ready(&self) -> usize {
        let mut map = self.lock();
        let doomed: Vec<PeerAddress> = map
            .iter()
            .filter(|(_, ch)| ch.state() != ChannelState::Ready)
            .map(|(addr, _)| *addr)
            .collect();
        for addr in &doomed {
            if let Some(ch) = map.remove(addr) {
                log::info!("pruning channel {} in state {}", addr, ch.state());
                ch.close();
            }
        }
        doomed.len()
    }

    /// Apply the socket-level low-latency flag to every entry.
    /// Best-effort: a per-entry failure is logged and the loop continues.
    pub fn set_low_latency(&self, enabled: bool) {
        for (addr, ch) in self.lock().iter() {
            if let Err(e) = ch.set_low_latency(enabled) {
                log::warn!("low-latency toggle failed for {}: {}", addr, e);
            }
        }
    }

    /// Close every channel. Idempotent; entries remain in the table in
    /// `Closed` state.
    pub fn close_all(&self) {
        for (addr, ch) in self.lock().iter() {
            log::debug!("closing channel {}", addr);
            ch.close();
        }
    }

    /// Wake everyone blocked in [`ConnectionTable::wait_changed`].
    /// Workers call this after publishing a state transition.
    pub fn notify_changed(&self) {
        let _guard = self.lock();
        self.changed.notify_all();
    }

    /// Block until notified of a state change or until `timeout` elapses,
    /// whichever is first.
    pub fn wait_changed(&self, timeout: Duration) {
        let guard = self.lock();
        let _ = self
            .changed
            .wait_timeout(guard, timeout)
            .unwrap_or_else(|e| e.into_inner());
    }
}

impl Default for ConnectionTable {
    fn default() -> Self {
        Self::new()
    }
}
