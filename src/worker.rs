//! Per-channel workers that drive connect + handshake to readiness.
//!
//! Each expected channel gets exactly one worker thread, which is the
//! only writer of that channel's lifecycle state until it publishes a
//! terminal outcome. Connect-role workers dial out; accept-role workers
//! wait for the acceptor to hand them an inbound socket. From the socket
//! onward both roles run the same securing sequence. A failed worker
//! marks only its own channel; whether that fails the whole setup is the
//! orchestrator's policy call.

use std::fmt;
use std::io;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::channel::{Channel, ChannelError, ChannelState};
use crate::handshake::{Handshake, HandshakeError};
use crate::metrics::Metrics;
use crate::table::ConnectionTable;

// ============================================================================
// Constants
// ============================================================================

/// Delay between outbound dial attempts
pub const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Per-attempt outbound connect timeout
pub const CONNECT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(3);

/// Bounded wait per iteration while an acceptee waits for its socket
const INBOUND_WAIT_SLICE: Duration = Duration::from_secs(1);

/// Read/write timeout applied to the socket for the handshake phase
pub const HANDSHAKE_IO_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Errors
// ============================================================================

/// Why a worker failed to bring its channel to ready
#[derive(Debug)]
pub enum WorkerError {
    /// Stop flag observed before the channel was established
    Stopped,
    /// Global setup deadline passed
    DeadlineExceeded,
    /// The acceptor went away before delivering an inbound socket
    AcceptorGone,
    /// Channel misuse or socket binding failure
    Channel(ChannelError),
    /// The securing step failed
    Handshake(HandshakeError),
    /// Socket-level failure outside the handshake
    Io(io::Error),
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerError::Stopped => write!(f, "setup stopped"),
            WorkerError::DeadlineExceeded => write!(f, "setup deadline exceeded"),
            WorkerError::AcceptorGone => write!(f, "acceptor terminated before delivering a socket"),
            WorkerError::Channel(e) => write!(f, "channel error: {}", e),
            WorkerError::Handshake(e) => write!(f, "{}", e),
            WorkerError::Io(e) => write!(f, "i/o error: {}", e),
        }
    }
}

impl std::error::Error for WorkerError {}

// ============================================================================
// Worker Role
// ============================================================================

/// How this worker obtains its socket
pub enum WorkerRole {
    /// Actively dial the peer's known (host, port)
    Connect,
    /// Wait for the acceptor to hand over an inbound socket
    Accept { receiver: Receiver<TcpStream> },
}

// ============================================================================
// Handshake Worker
// ============================================================================

/// Drives exactly one channel to `Ready`, or to `Error`.
pub struct HandshakeWorker {
    channel: Arc<Channel>,
    table: Arc<ConnectionTable>,
    handshake: Arc<dyn Handshake>,
    metrics: Arc<Metrics>,
    stop: Arc<AtomicBool>,
    deadline: Instant,
    role: WorkerRole,
}

impl HandshakeWorker {
    pub fn new(
        channel: Arc<Channel>,
        table: Arc<ConnectionTable>,
        handshake: Arc<dyn Handshake>,
        metrics: Arc<Metrics>,
        stop: Arc<AtomicBool>,
        deadline: Instant,
        role: WorkerRole,
    ) -> Self {
        HandshakeWorker {
            channel,
            table,
            handshake,
            metrics,
            stop,
            deadline,
            role,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        thread::spawn(move || self.run())
    }

    fn run(self) {
        let address = self.channel.address();
        match self.establish() {
            Ok(()) => {
                self.channel.set_state(ChannelState::Ready);
                self.metrics
                    .handshakes_completed_total
                    .fetch_add(1, Ordering::Relaxed);
                self.metrics.channels_ready.fetch_add(1, Ordering::Relaxed);
                log::info!("channel {} ready", address);
            }
            Err(e) => {
                log::warn!("channel {} failed: {}", address, e);
                self.channel.fail();
                self.metrics
                    .handshake_failures_total
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
        // publish the terminal state to whoever is converging on the table
        self.table.notify_changed();
    }

    fn establish(&self) -> Result<(), WorkerError> {
        let stream = match &self.role {
            WorkerRole::Connect => self.connect_outbound()?,
            WorkerRole::Accept { receiver } => self.await_inbound(receiver)?,
        };

        // bound the securing phase; a handshake peer that stalls must not
        // hold the worker past teardown
        stream
            .set_read_timeout(Some(HANDSHAKE_IO_TIMEOUT))
            .map_err(WorkerError::Io)?;
        stream
            .set_write_timeout(Some(HANDSHAKE_IO_TIMEOUT))
            .map_err(WorkerError::Io)?;

        // the handshake runs on a duplicate handle; the channel owns the
        // socket from here on, so teardown can unblock the handshake I/O
        let mut handshake_io = stream.try_clone().map_err(WorkerError::Io)?;
        self.channel.open(stream).map_err(WorkerError::Channel)?;
        self.channel.set_state(ChannelState::Securing);

        self.handshake
            .secure(&mut handshake_io, &self.channel.address())
            .map_err(WorkerError::Handshake)?;

        // hand the upper layer an unbounded socket again
        handshake_io.set_read_timeout(None).map_err(WorkerError::Io)?;
        handshake_io.set_write_timeout(None).map_err(WorkerError::Io)?;
        Ok(())
    }

    /// Dial the peer, retrying until success, stop, or deadline. The
    /// retry matters for symmetric startups: the first party up must
    /// keep dialing until the other party's listener is bound.
    fn connect_outbound(&self) -> Result<TcpStream, WorkerError> {
        self.channel.set_state(ChannelState::Connecting);
        let target = self.channel.address().socket_addr();
        let mut first_attempt = true;

        loop {
            if self.stop.load(Ordering::Relaxed) {
                return Err(WorkerError::Stopped);
            }
            let now = Instant::now();
            if now >= self.deadline {
                return Err(WorkerError::DeadlineExceeded);
            }
            if !first_attempt {
                self.metrics
                    .connect_retries_total
                    .fetch_add(1, Ordering::Relaxed);
            }
            first_attempt = false;

            let attempt_timeout = CONNECT_ATTEMPT_TIMEOUT.min(self.deadline - now);
            match TcpStream::connect_timeout(&target, attempt_timeout) {
                Ok(stream) => {
                    log::debug!("connected to {}", target);
                    return Ok(stream);
                }
                Err(e) => {
                    log::debug!("connect to {} failed ({}), retrying", target, e);
                    let remaining = self.deadline.saturating_duration_since(Instant::now());
                    thread::sleep(CONNECT_RETRY_INTERVAL.min(remaining));
                }
            }
        }
    }

    /// Wait for the acceptor to deliver the inbound socket, in bounded
    /// slices so the stop flag and deadline stay observable.
    fn await_inbound(&self, receiver: &Receiver<TcpStream>) -> Result<TcpStream, WorkerError> {
        loop {
            if self.stop.load(Ordering::Relaxed) {
                return Err(WorkerError::Stopped);
            }
            let now = Instant::now();
            if now >= self.deadline {
                return Err(WorkerError::DeadlineExceeded);
            }

            let slice = INBOUND_WAIT_SLICE.min(self.deadline - now);
            match receiver.recv_timeout(slice) {
                Ok(stream) => return Ok(stream),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Err(WorkerError::AcceptorGone),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::PeerAddress;
    use crate::handshake::InsecureHandshake;
    use std::net::TcpListener;
    use std::sync::mpsc;

    fn worker_parts() -> (Arc<ConnectionTable>, Arc<Metrics>, Arc<AtomicBool>) {
        (
            Arc::new(ConnectionTable::new()),
            Arc::new(Metrics::new()),
            Arc::new(AtomicBool::new(false)),
        )
    }

    #[test]
    fn test_connect_worker_reaches_ready() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let accept_side = thread::spawn(move || listener.accept().unwrap());

        let (table, metrics, stop) = worker_parts();
        let channel = Arc::new(Channel::new(PeerAddress::from(addr)));
        table.add(channel.address(), channel.clone());

        let worker = HandshakeWorker::new(
            channel.clone(),
            table,
            Arc::new(InsecureHandshake),
            metrics.clone(),
            stop,
            Instant::now() + Duration::from_secs(5),
            WorkerRole::Connect,
        );
        worker.spawn().join().unwrap();
        accept_side.join().unwrap();

        assert_eq!(channel.state(), ChannelState::Ready);
        assert!(channel.is_open());
        assert_eq!(
            metrics.handshakes_completed_total.load(Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn test_connect_worker_times_out_without_listener() {
        let (table, metrics, stop) = worker_parts();
        // port from the discard range; nothing listens there in tests
        let channel = Arc::new(Channel::new(PeerAddress::new(
            "127.0.0.1".parse().unwrap(),
            9,
        )));
        table.add(channel.address(), channel.clone());

        let worker = HandshakeWorker::new(
            channel.clone(),
            table,
            Arc::new(InsecureHandshake),
            metrics.clone(),
            stop,
            Instant::now() + Duration::from_millis(700),
            WorkerRole::Connect,
        );
        worker.spawn().join().unwrap();

        assert_eq!(channel.state(), ChannelState::Error);
        assert_eq!(metrics.handshake_failures_total.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_accept_worker_secures_delivered_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let dialer = thread::spawn(move || TcpStream::connect(addr).unwrap());
        let (inbound, _) = listener.accept().unwrap();
        let _remote = dialer.join().unwrap();

        let (table, metrics, stop) = worker_parts();
        let channel = Arc::new(Channel::new(PeerAddress::new(
            "127.0.0.1".parse().unwrap(),
            9001,
        )));
        table.add(channel.address(), channel.clone());

        let (tx, rx) = mpsc::channel();
        let worker = HandshakeWorker::new(
            channel.clone(),
            table,
            Arc::new(InsecureHandshake),
            metrics,
            stop,
            Instant::now() + Duration::from_secs(5),
            WorkerRole::Accept { receiver: rx },
        );
        let handle = worker.spawn();
        tx.send(inbound).unwrap();
        handle.join().unwrap();

        assert_eq!(channel.state(), ChannelState::Ready);
    }

    #[test]
    fn test_accept_worker_fails_when_acceptor_gone() {
        let (table, metrics, stop) = worker_parts();
        let channel = Arc::new(Channel::new(PeerAddress::new(
            "127.0.0.1".parse().unwrap(),
            9001,
        )));
        table.add(channel.address(), channel.clone());

        let (tx, rx) = mpsc::channel::<TcpStream>();
        let worker = HandshakeWorker::new(
            channel.clone(),
            table,
            Arc::new(InsecureHandshake),
            metrics,
            stop,
            Instant::now() + Duration::from_secs(5),
            WorkerRole::Accept { receiver: rx },
        );
        drop(tx); // no acceptor will ever deliver
        worker.spawn().join().unwrap();

        assert_eq!(channel.state(), ChannelState::Error);
    }

    #[test]
    fn test_stop_flag_aborts_waiting_worker() {
        let (table, metrics, stop) = worker_parts();
        let channel = Arc::new(Channel::new(PeerAddress::new(
            "127.0.0.1".parse().unwrap(),
            9001,
        )));
        table.add(channel.address(), channel.clone());

        let (_tx, rx) = mpsc::channel::<TcpStream>();
        let worker = HandshakeWorker::new(
            channel.clone(),
            table,
            Arc::new(InsecureHandshake),
            metrics,
            stop.clone(),
            Instant::now() + Duration::from_secs(60),
            WorkerRole::Accept { receiver: rx },
        );
        let handle = worker.spawn();
        thread::sleep(Duration::from_millis(100));
        stop.store(true, Ordering::Relaxed);
        handle.join().unwrap();

        assert_eq!(channel.state(), ChannelState::Error);
    }
}
