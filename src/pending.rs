//! Registry of workers awaiting an inbound socket, keyed by peer host.
//!
//! Inbound sockets can only be matched to an expected peer by source
//! host: the remote ephemeral port is unknown until the peer actually
//! connects. Several expected peers may share a host, so each host maps
//! to a FIFO queue and the acceptor hands sockets out first-pending-
//! first-served. A host's key is dropped once its queue drains, which is
//! what makes later connections from that host unauthorized.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, TcpStream};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::channel::{Channel, ChannelState};

// ============================================================================
// Pending Peer
// ============================================================================

/// One worker waiting for the acceptor to hand it a socket.
pub struct PendingPeer {
    channel: Arc<Channel>,
    sender: Sender<TcpStream>,
}

impl PendingPeer {
    pub fn new(channel: Arc<Channel>, sender: Sender<TcpStream>) -> Self {
        PendingPeer { channel, sender }
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    /// Hand the accepted socket to the waiting worker. If the worker has
    /// already given up (receiver dropped), the socket is returned so the
    /// caller can close it.
    pub fn deliver(self, stream: TcpStream) -> Result<(), TcpStream> {
        self.sender.send(stream).map_err(|e| e.0)
    }
}

// ============================================================================
// Pending Registry
// ============================================================================

/// Host-keyed FIFO queues of pending acceptee workers. Shared between
/// the acceptor and the orchestrator; guarded by its own single lock.
pub struct PendingRegistry {
    inner: Mutex<HashMap<IpAddr, VecDeque<PendingPeer>>>,
}

impl PendingRegistry {
    pub fn new() -> Self {
        PendingRegistry {
            inner: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<IpAddr, VecDeque<PendingPeer>>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue a worker under its peer's host.
    pub fn register(&self, channel: Arc<Channel>, sender: Sender<TcpStream>) {
        let host = channel.address().host;
        self.lock()
            .entry(host)
            .or_default()
            .push_back(PendingPeer::new(channel, sender));
    }

    /// Pop the first pending worker for `host`, removing the host key if
    /// its queue becomes empty. `None` means the host is not expected;
    /// the inbound connection is unauthorized.
    pub fn claim(&self, host: IpAddr) -> Option<PendingPeer> {
        let mut map = self.lock();
        let queue = map.get_mut(&host)?;
        let pending = queue.pop_front();
        if queue.is_empty() {
            map.remove(&host);
        }
        pending
    }

    /// Mark every pending channel as `Connecting`: the acceptor's
    /// announcement that it is about to start accepting for them.
    pub fn mark_all_connecting(&self) {
        for queue in self.lock().values() {
            for pending in queue {
                pending.channel.set_state(ChannelState::Connecting);
            }
        }
    }

    /// Total number of workers still waiting, across all hosts.
    pub fn pending_count(&self) -> usize {
        self.lock().values().map(|q| q.len()).sum()
    }
}

impl Default for PendingRegistry {
    fn default() -> Self {
        Self::new()
    }
}
