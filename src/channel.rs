//! A single logical connection to one remote party.
//!
//! A `Channel` owns its socket once one is bound to it, tracks the
//! lifecycle state that the rest of the crate keys off, and offers
//! length-prefixed send/receive for the layer above. Only channels in
//! `Ready` state are usable by upper layers.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{IpAddr, Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};

// ============================================================================
// Constants
// ============================================================================

/// Length of the frame header (4 bytes, big-endian payload length)
pub const HEADER_LEN: usize = 4;

/// Maximum payload size for a single frame (64 KB)
pub const MAX_FRAME_SIZE: u32 = 65536;

// ============================================================================
// Peer Address
// ============================================================================

/// Network identity of a remote party.
///
/// The (host, port) pair is unique per party and keys the connection
/// table. During inbound acceptance only the host half can be matched,
/// since a connecting peer's source port is not known in advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerAddress {
    pub host: IpAddr,
    pub port: u16,
}

impl PeerAddress {
    pub fn new(host: IpAddr, port: u16) -> Self {
        PeerAddress { host, port }
    }

    /// The address to dial for an outbound connection to this peer.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

impl From<SocketAddr> for PeerAddress {
    fn from(addr: SocketAddr) -> Self {
        PeerAddress::new(addr.ip(), addr.port())
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

// ============================================================================
// Channel State
// ============================================================================

/// Lifecycle state of a channel.
///
/// `Connecting` covers "no socket yet"; `Securing` covers "socket bound,
/// handshake not yet complete". `Error` and `Closed` are reachable from
/// any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Created, nothing attempted yet
    NotInitiated,
    /// Socket being established (outbound dial or awaiting inbound match)
    Connecting,
    /// Socket bound, security handshake in progress
    Securing,
    /// Handshake complete, usable by upper layers
    Ready,
    /// Establishment failed; socket closed
    Error,
    /// Torn down
    Closed,
}

impl ChannelState {
    /// Whether the channel will make no further progress on its own.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ChannelState::Ready | ChannelState::Error | ChannelState::Closed
        )
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelState::NotInitiated => "not-initiated",
            ChannelState::Connecting => "connecting",
            ChannelState::Securing => "securing",
            ChannelState::Ready => "ready",
            ChannelState::Error => "error",
            ChannelState::Closed => "closed",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors raised by channel operations
#[derive(Debug)]
pub enum ChannelError {
    /// A socket was already bound to this channel; binding is one-time
    AlreadyBound,
    /// The channel has no usable socket (never opened, or closed)
    Closed,
    /// Frame payload exceeds `MAX_FRAME_SIZE`
    FrameTooLarge(usize),
    /// Underlying socket I/O failure
    Io(io::Error),
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelError::AlreadyBound => write!(f, "channel already has a socket bound"),
            ChannelError::Closed => write!(f, "channel is closed"),
            ChannelError::FrameTooLarge(len) => {
                write!(f, "frame of {} bytes exceeds {} byte limit", len, MAX_FRAME_SIZE)
            }
            ChannelError::Io(e) => write!(f, "channel i/o error: {}", e),
        }
    }
}

impl std::error::Error for ChannelError {}

// ============================================================================
// Channel
// ============================================================================

/// One bidirectional connection to one remote party.
///
/// State may be overwritten unconditionally via [`Channel::set_state`];
/// callers are responsible for not regressing it. The socket is bound
/// exactly once. `close` is idempotent and safe to call from any thread,
/// including while another thread is mid-send: the in-flight operation
/// fails with [`ChannelError::Closed`].
pub struct Channel {
    address: PeerAddress,
    state: Mutex<ChannelState>,
    socket: RwLock<Option<TcpStream>>,
    low_latency: AtomicBool,
}

impl Channel {
    pub fn new(address: PeerAddress) -> Self {
        Channel {
            address,
            state: Mutex::new(ChannelState::NotInitiated),
            socket: RwLock::new(None),
            low_latency: AtomicBool::new(false),
        }
    }

    pub fn address(&self) -> PeerAddress {
        self.address
    }

    pub fn state(&self) -> ChannelState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Overwrite the lifecycle state. No legality checking is enforced.
    pub fn set_state(&self, state: ChannelState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Whether a socket is currently bound.
    pub fn is_open(&self) -> bool {
        self.socket
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Whether immediate-send mode was last enabled via
    /// [`Channel::set_low_latency`].
    pub fn low_latency(&self) -> bool {
        self.low_latency.load(Ordering::Relaxed)
    }

    /// Bind the socket. One-time: a second call fails with
    /// [`ChannelError::AlreadyBound`]: a programming error in the
    /// caller, not a condition to retry.
    pub fn open(&self, stream: TcpStream) -> Result<(), ChannelError> {
        let mut guard = self.socket.write().unwrap_or_else(|e| e.into_inner());
        if guard.is_some() {
            return Err(ChannelError::AlreadyBound);
        }
        *guard = Some(stream);
        Ok(())
    }

    /// Send one length-prefixed frame.
    pub fn send(&self, payload: &[u8]) -> Result<(), ChannelError> {
        if payload.len() > MAX_FRAME_SIZE as usize {
            return Err(ChannelError::FrameTooLarge(payload.len()));
        }
        let guard = self.socket.read().unwrap_or_else(|e| e.into_inner());
        let mut stream: &TcpStream = guard.as_ref().ok_or(ChannelError::Closed)?;
        let header = (payload.len() as u32).to_be_bytes();
        stream
            .write_all(&header)
            .and_then(|_| stream.write_all(payload))
            .map_err(|e| self.map_io(e))
    }

    /// Receive one length-prefixed frame, blocking until it arrives.
    pub fn receive(&self) -> Result<Vec<u8>, ChannelError> {
        let guard = self.socket.read().unwrap_or_else(|e| e.into_inner());
        let mut stream: &TcpStream = guard.as_ref().ok_or(ChannelError::Closed)?;
        let mut header = [0u8; HEADER_LEN];
        stream.read_exact(&mut header).map_err(|e| self.map_io(e))?;
        let len = u32::from_be_bytes(header);
        if len > MAX_FRAME_SIZE {
            return Err(ChannelError::FrameTooLarge(len as usize));
        }
        let mut payload = vec![0u8; len as usize];
        stream.read_exact(&mut payload).map_err(|e| self.map_io(e))?;
        Ok(payload)
    }

    /// Enable or disable immediate-send mode (TCP_NODELAY).
    pub fn set_low_latency(&self, enabled: bool) -> Result<(), ChannelError> {
        let guard = self.socket.read().unwrap_or_else(|e| e.into_inner());
        let stream = guard.as_ref().ok_or(ChannelError::Closed)?;
        stream.set_nodelay(enabled).map_err(ChannelError::Io)?;
        self.low_latency.store(enabled, Ordering::Relaxed);
        Ok(())
    }

    /// Tear the channel down. Idempotent; concurrent callers and
    /// in-flight send/receive on other threads are all safe.
    pub fn close(&self) {
        self.teardown(ChannelState::Closed);
    }

    /// Tear the channel down after an establishment failure, leaving the
    /// state at `Error` rather than `Closed`.
    pub fn fail(&self) {
        self.teardown(ChannelState::Error);
    }

    fn teardown(&self, final_state: ChannelState) {
        // Publish the terminal state before touching the socket so a
        // send/receive we are about to unblock reports Closed, not a raw
        // I/O error.
        self.set_state(final_state);
        // Shut the socket down under a shared lock: a blocked
        // send/receive holds the other shared lock, and must be
        // unblocked before the exclusive lock below can be taken.
        {
            let guard = self.socket.read().unwrap_or_else(|e| e.into_inner());
            if let Some(stream) = guard.as_ref() {
                let _ = stream.shutdown(Shutdown::Both);
            }
        }
        let mut guard = self.socket.write().unwrap_or_else(|e| e.into_inner());
        *guard = None;
    }

    fn map_io(&self, e: io::Error) -> ChannelError {
        // A concurrent close shuts the socket down under us; surface that
        // as Closed rather than a raw I/O error.
        if self.state() == ChannelState::Closed {
            ChannelError::Closed
        } else {
            ChannelError::Io(e)
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("address", &self.address)
            .field("state", &self.state())
            .field("open", &self.is_open())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::sync::Arc;
    use std::thread;

    fn test_address() -> PeerAddress {
        PeerAddress::new("127.0.0.1".parse().unwrap(), 9001)
    }

    /// Connected loopback stream pair
    fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let a = TcpStream::connect(addr).unwrap();
        let (b, _) = listener.accept().unwrap();
        (a, b)
    }

    #[test]
    fn test_new_channel_not_initiated() {
        let ch = Channel::new(test_address());
        assert_eq!(ch.state(), ChannelState::NotInitiated);
        assert!(!ch.is_open());
        assert!(!ch.low_latency());
    }

    #[test]
    fn test_state_overwrite() {
        let ch = Channel::new(test_address());
        ch.set_state(ChannelState::Connecting);
        assert_eq!(ch.state(), ChannelState::Connecting);
        ch.set_state(ChannelState::Ready);
        assert_eq!(ch.state(), ChannelState::Ready);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!ChannelState::NotInitiated.is_terminal());
        assert!(!ChannelState::Connecting.is_terminal());
        assert!(!ChannelState::Securing.is_terminal());
        assert!(ChannelState::Ready.is_terminal());
        assert!(ChannelState::Error.is_terminal());
        assert!(ChannelState::Closed.is_terminal());
    }

    #[test]
    fn test_open_is_one_time() {
        let (a, b) = tcp_pair();
        let ch = Channel::new(test_address());
        ch.open(a).unwrap();
        assert!(ch.is_open());
        match ch.open(b) {
            Err(ChannelError::AlreadyBound) => {}
            other => panic!("expected AlreadyBound, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_send_receive_roundtrip() {
        let (a, b) = tcp_pair();
        let tx = Channel::new(test_address());
        let rx = Channel::new(test_address());
        tx.open(a).unwrap();
        rx.open(b).unwrap();

        tx.send(b"hello channel").unwrap();
        assert_eq!(rx.receive().unwrap(), b"hello channel");

        // empty frame is legal
        tx.send(b"").unwrap();
        assert_eq!(rx.receive().unwrap(), b"");
    }

    #[test]
    fn test_send_without_socket_fails_closed() {
        let ch = Channel::new(test_address());
        assert!(matches!(ch.send(b"x"), Err(ChannelError::Closed)));
        assert!(matches!(ch.receive(), Err(ChannelError::Closed)));
    }

    #[test]
    fn test_frame_too_large() {
        let (a, _b) = tcp_pair();
        let ch = Channel::new(test_address());
        ch.open(a).unwrap();
        let oversized = vec![0u8; MAX_FRAME_SIZE as usize + 1];
        assert!(matches!(
            ch.send(&oversized),
            Err(ChannelError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn test_close_idempotent_and_concurrent() {
        let (a, _b) = tcp_pair();
        let ch = Arc::new(Channel::new(test_address()));
        ch.open(a).unwrap();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let ch = ch.clone();
            handles.push(thread::spawn(move || ch.close()));
        }
        for h in handles {
            h.join().unwrap();
        }
        ch.close();
        assert_eq!(ch.state(), ChannelState::Closed);
        assert!(!ch.is_open());
    }

    #[test]
    fn test_concurrent_close_fails_pending_receive() {
        let (a, _b) = tcp_pair();
        let ch = Arc::new(Channel::new(test_address()));
        ch.open(a).unwrap();

        let reader = {
            let ch = ch.clone();
            thread::spawn(move || ch.receive())
        };
        // let the reader block on the empty socket, then close under it
        thread::sleep(std::time::Duration::from_millis(100));
        ch.close();
        assert!(matches!(reader.join().unwrap(), Err(ChannelError::Closed)));
    }

    #[test]
    fn test_fail_leaves_error_state() {
        let (a, _b) = tcp_pair();
        let ch = Channel::new(test_address());
        ch.open(a).unwrap();
        ch.fail();
        assert_eq!(ch.state(), ChannelState::Error);
        assert!(!ch.is_open());
    }

    #[test]
    fn test_low_latency_toggle() {
        let (a, _b) = tcp_pair();
        let ch = Channel::new(test_address());
        assert!(matches!(
            ch.set_low_latency(true),
            Err(ChannelError::Closed)
        ));
        ch.open(a).unwrap();
        ch.set_low_latency(true).unwrap();
        assert!(ch.low_latency());
        ch.set_low_latency(false).unwrap();
        assert!(!ch.low_latency());
    }

    #[test]
    fn test_peer_address_display_and_key() {
        let addr = PeerAddress::new("10.0.0.5".parse().unwrap(), 7000);
        assert_eq!(addr.to_string(), "10.0.0.5:7000");
        assert_eq!(addr.socket_addr().port(), 7000);
        let same = PeerAddress::new("10.0.0.5".parse().unwrap(), 7000);
        assert_eq!(addr, same);
    }
}
