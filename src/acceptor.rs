//! Inbound accept loop.
//!
//! One listening socket, polled with a bounded wait so the stop flag is
//! observed within [`ACCEPT_POLL_INTERVAL`] even when no one connects.
//! Each accepted socket is matched against the pending registry by its
//! source host; unknown hosts are unauthorized and their sockets are
//! closed without counting toward the inbound target.

use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{FromRawFd, IntoRawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};

use crate::metrics::Metrics;
use crate::pending::PendingRegistry;

// ============================================================================
// Constants
// ============================================================================

/// Bounded wait per poll iteration; also the maximum stop latency
pub const ACCEPT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// mio token for the listening socket
const LISTENER_TOKEN: Token = Token(0);

// ============================================================================
// Errors
// ============================================================================

/// Fatal listener failures, surfaced to the orchestrator
#[derive(Debug)]
pub enum AcceptorError {
    /// Could not bind or register the listening socket
    Bind(io::Error),
    /// Readiness polling failed
    Poll(io::Error),
    /// Accept failed with a non-transient error
    Accept(io::Error),
}

impl fmt::Display for AcceptorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcceptorError::Bind(e) => write!(f, "listener bind failed: {}", e),
            AcceptorError::Poll(e) => write!(f, "listener poll failed: {}", e),
            AcceptorError::Accept(e) => write!(f, "accept failed: {}", e),
        }
    }
}

impl std::error::Error for AcceptorError {}

// ============================================================================
// Acceptor
// ============================================================================

/// Runs the accept loop on one bound local port until the expected
/// number of inbound peers has been matched or the stop flag is raised.
pub struct Acceptor {
    poll: Poll,
    listener: TcpListener,
    expected_inbound: usize,
    registry: Arc<PendingRegistry>,
    metrics: Arc<Metrics>,
    stop: Arc<AtomicBool>,
}

impl Acceptor {
    /// Bind the listening socket and register it for readiness events.
    pub fn bind(
        listen_addr: SocketAddr,
        expected_inbound: usize,
        registry: Arc<PendingRegistry>,
        metrics: Arc<Metrics>,
        stop: Arc<AtomicBool>,
    ) -> Result<Self, AcceptorError> {
        let mut listener = TcpListener::bind(listen_addr).map_err(AcceptorError::Bind)?;
        let poll = Poll::new().map_err(AcceptorError::Poll)?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
            .map_err(AcceptorError::Poll)?;

        let bound = listener.local_addr().map_err(AcceptorError::Bind)?;
        log::info!(
            "listening on {} for {} inbound peer(s)",
            bound,
            expected_inbound
        );

        Ok(Acceptor {
            poll,
            listener,
            expected_inbound,
            registry,
            metrics,
            stop,
        })
    }

    /// The actual bound address (useful when binding port 0).
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run the accept loop. Returns the number of inbound sockets handed
    /// to pending workers.
    pub fn run(mut self) -> Result<usize, AcceptorError> {
        // announce intent: every peer we expect to initiate is now being
        // waited for
        self.registry.mark_all_connecting();

        let mut events = Events::with_capacity(64);
        let mut accepted = 0;

        while accepted < self.expected_inbound && !self.stop.load(Ordering::Relaxed) {
            if let Err(e) = self.poll.poll(&mut events, Some(ACCEPT_POLL_INTERVAL)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(AcceptorError::Poll(e));
            }

            // drain the listener until it would block
            loop {
                match self.listener.accept() {
                    Ok((stream, remote)) => {
                        if self.handle_inbound(stream, remote) {
                            accepted += 1;
                            if accepted == self.expected_inbound {
                                break;
                            }
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if is_transient(&e) => {
                        log::debug!("transient accept error: {}", e);
                    }
                    Err(e) => return Err(AcceptorError::Accept(e)),
                }
            }
        }

        log::info!("accept loop done, {} inbound peer(s) matched", accepted);
        Ok(accepted)
    }

    /// Match one accepted socket. Returns true if it was handed to a
    /// pending worker (counts toward the inbound target).
    fn handle_inbound(&self, stream: mio::net::TcpStream, remote: SocketAddr) -> bool {
        // the workers do blocking I/O; hand them a blocking socket
        let stream = match into_blocking(stream) {
            Ok(s) => s,
            Err(e) => {
                log::warn!("could not prepare inbound socket from {}: {}", remote, e);
                return false;
            }
        };

        match self.registry.claim(remote.ip()) {
            None => {
                log::warn!("rejecting inbound connection from unexpected host {}", remote);
                self.metrics
                    .unauthorized_rejected_total
                    .fetch_add(1, Ordering::Relaxed);
                drop(stream);
                false
            }
            Some(pending) => {
                let address = pending.channel().address();
                match pending.deliver(stream) {
                    Ok(()) => {
                        log::debug!("inbound socket from {} handed to channel {}", remote, address);
                        self.metrics
                            .inbound_accepted_total
                            .fetch_add(1, Ordering::Relaxed);
                        true
                    }
                    Err(stream) => {
                        log::warn!(
                            "worker for channel {} is gone, dropping inbound socket from {}",
                            address,
                            remote
                        );
                        drop(stream);
                        false
                    }
                }
            }
        }
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

/// An accepted mio stream is non-blocking; convert it to a blocking
/// std stream for the handshake worker.
fn into_blocking(stream: mio::net::TcpStream) -> io::Result<TcpStream> {
    let stream = unsafe { TcpStream::from_raw_fd(stream.into_raw_fd()) };
    stream.set_nonblocking(false)?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Channel, PeerAddress};
    use std::io::Read;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Instant;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn test_unauthorized_inbound_closed() {
        let registry = Arc::new(PendingRegistry::new());
        let metrics = Arc::new(Metrics::new());
        let stop = Arc::new(AtomicBool::new(false));

        // expect one inbound, but from a host that will never connect
        let expected = Arc::new(Channel::new(PeerAddress::new(
            "203.0.113.9".parse().unwrap(),
            9001,
        )));
        let (tx, _rx) = mpsc::channel();
        registry.register(expected, tx);

        let acceptor =
            Acceptor::bind(loopback(), 1, registry, metrics.clone(), stop.clone()).unwrap();
        let addr = acceptor.local_addr().unwrap();
        let handle = thread::spawn(move || acceptor.run());

        // rogue connection from 127.0.0.1
        let mut rogue = TcpStream::connect(addr).unwrap();
        let mut buf = [0u8; 1];
        // closed by the acceptor: read yields EOF (or a reset)
        let eof = match rogue.read(&mut buf) {
            Ok(0) => true,
            Ok(_) => false,
            Err(_) => true,
        };
        assert!(eof, "rogue socket should have been closed");

        stop.store(true, Ordering::Relaxed);
        let accepted = handle.join().unwrap().unwrap();
        assert_eq!(accepted, 0);
        assert_eq!(
            metrics.unauthorized_rejected_total.load(Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn test_matched_inbound_delivered_and_loop_ends() {
        let registry = Arc::new(PendingRegistry::new());
        let metrics = Arc::new(Metrics::new());
        let stop = Arc::new(AtomicBool::new(false));

        let expected = Arc::new(Channel::new(PeerAddress::new(
            "127.0.0.1".parse().unwrap(),
            9001,
        )));
        let (tx, rx) = mpsc::channel();
        registry.register(expected.clone(), tx);

        let acceptor = Acceptor::bind(loopback(), 1, registry, metrics.clone(), stop).unwrap();
        let addr = acceptor.local_addr().unwrap();
        let handle = thread::spawn(move || acceptor.run());

        let _peer = TcpStream::connect(addr).unwrap();

        let delivered = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(delivered.peer_addr().is_ok());

        // target reached: the loop ends without the stop flag
        let accepted = handle.join().unwrap().unwrap();
        assert_eq!(accepted, 1);
        assert_eq!(metrics.inbound_accepted_total.load(Ordering::Relaxed), 1);
        // acceptor marked the pending channel connecting before accepting
        assert_eq!(
            expected.state(),
            crate::channel::ChannelState::Connecting
        );
    }

    #[test]
    fn test_stop_flag_bounds_shutdown() {
        let registry = Arc::new(PendingRegistry::new());
        let metrics = Arc::new(Metrics::new());
        let stop = Arc::new(AtomicBool::new(false));

        let acceptor =
            Acceptor::bind(loopback(), 5, registry, metrics, stop.clone()).unwrap();
        let handle = thread::spawn(move || acceptor.run());

        thread::sleep(Duration::from_millis(100));
        let raised = Instant::now();
        stop.store(true, Ordering::Relaxed);
        let accepted = handle.join().unwrap().unwrap();
        assert_eq!(accepted, 0);
        // cooperative cancellation: bounded by one poll interval (plus slack)
        assert!(raised.elapsed() < ACCEPT_POLL_INTERVAL + Duration::from_secs(1));
    }
}
