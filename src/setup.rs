//! Orchestrates channel establishment across the expected peer roster.
//!
//! `CommSetup::establish` spawns the acceptor (when any peer connects
//! inbound) plus one handshake worker per peer, then converges on the
//! connection table: the caller gets the table only once every expected
//! channel is ready, or, in lenient mode, a pruned table of whatever
//! became ready before the deadline. On any failure every socket opened
//! during the attempt is closed and an explicit error is returned.

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::acceptor::{Acceptor, AcceptorError};
use crate::channel::Channel;
use crate::config::{ConfigError, PeerRole, SetupConfig};
use crate::handshake::Handshake;
use crate::metrics::Metrics;
use crate::pending::PendingRegistry;
use crate::table::ConnectionTable;
use crate::worker::{HandshakeWorker, WorkerRole};

// ============================================================================
// Constants
// ============================================================================

/// Bounded wait per convergence-check iteration
pub const SETUP_POLL_INTERVAL: Duration = Duration::from_millis(200);

// ============================================================================
// Phases and Errors
// ============================================================================

/// Phase of one setup run, for logging and introspection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupPhase {
    Preparing,
    Waiting,
    Succeeded,
    Failed,
    TimedOut,
}

impl fmt::Display for SetupPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SetupPhase::Preparing => "preparing",
            SetupPhase::Waiting => "waiting",
            SetupPhase::Succeeded => "succeeded",
            SetupPhase::Failed => "failed",
            SetupPhase::TimedOut => "timed-out",
        };
        f.write_str(name)
    }
}

/// Why a setup run did not produce a full table
#[derive(Debug)]
pub enum SetupError {
    /// The roster failed validation or resolution
    InvalidConfig(ConfigError),
    /// The listening socket could not be bound
    Bind(io::Error),
    /// Not every channel became ready within the deadline
    TimedOut { ready: usize, expected: usize },
    /// One or more channels failed and the policy is fail-fast
    ChannelsFailed { failed: usize },
    /// The accept loop died with a fatal listener error
    AcceptorFailed(AcceptorError),
    /// The caller raised the abort flag mid-setup
    Aborted,
}

impl fmt::Display for SetupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SetupError::InvalidConfig(e) => write!(f, "invalid setup config: {}", e),
            SetupError::Bind(e) => write!(f, "could not bind listening socket: {}", e),
            SetupError::TimedOut { ready, expected } => {
                write!(f, "setup timed out with {}/{} channels ready", ready, expected)
            }
            SetupError::ChannelsFailed { failed } => {
                write!(f, "{} channel(s) failed to establish", failed)
            }
            SetupError::AcceptorFailed(e) => write!(f, "accept loop failed: {}", e),
            SetupError::Aborted => write!(f, "setup aborted"),
        }
    }
}

impl std::error::Error for SetupError {}

/// What the convergence loop observed
enum WaitOutcome {
    AllReady,
    Settled,
    ChannelFailed,
    AcceptorFailed,
    Aborted,
    DeadlinePassed,
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Public entry point: wires up every expected channel and hands back
/// the connection table once the roster has converged.
pub struct CommSetup {
    config: SetupConfig,
    handshake: Arc<dyn Handshake>,
    metrics: Arc<Metrics>,
    abort: Arc<AtomicBool>,
}

impl CommSetup {
    /// Validate the roster and build an orchestrator. The handshake
    /// collaborator is injected here and shared by every worker.
    pub fn new(config: SetupConfig, handshake: Arc<dyn Handshake>) -> Result<Self, SetupError> {
        config.validate().map_err(SetupError::InvalidConfig)?;
        Ok(CommSetup {
            config,
            handshake,
            metrics: Arc::new(Metrics::new()),
            abort: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Shared flag that aborts an in-flight `establish` when raised
    /// (e.g. from a signal handler).
    pub fn abort_flag(&self) -> Arc<AtomicBool> {
        self.abort.clone()
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// Run the full establishment state machine. All-or-nothing by
    /// default: a returned table has every expected channel ready. In
    /// lenient mode a timeout instead prunes not-ready entries and
    /// returns the remainder.
    pub fn establish(&self) -> Result<Arc<ConnectionTable>, SetupError> {
        log::debug!("setup phase: {}", SetupPhase::Preparing);

        let peers = self
            .config
            .resolve_peers()
            .map_err(SetupError::InvalidConfig)?;
        let expected = peers.len();
        let deadline = Instant::now() + self.config.timeout();

        let table = Arc::new(ConnectionTable::new());
        let registry = Arc::new(PendingRegistry::new());
        let stop = Arc::new(AtomicBool::new(false));

        // build one channel + one worker per expected peer
        let mut workers = Vec::with_capacity(expected);
        let mut inbound = 0;
        for (address, role) in peers {
            let channel = Arc::new(Channel::new(address));
            table.add(address, channel.clone());
            let worker_role = match role {
                PeerRole::Connect => WorkerRole::Connect,
                PeerRole::Accept => {
                    let (tx, rx) = mpsc::channel();
                    registry.register(channel.clone(), tx);
                    inbound += 1;
                    WorkerRole::Accept { receiver: rx }
                }
            };
            workers.push(HandshakeWorker::new(
                channel,
                table.clone(),
                self.handshake.clone(),
                self.metrics.clone(),
                stop.clone(),
                deadline,
                worker_role,
            ));
        }

        // the accept loop only runs when someone is expected to dial in
        let acceptor_failure: Arc<Mutex<Option<AcceptorError>>> = Arc::new(Mutex::new(None));
        let acceptor_handle: Option<JoinHandle<()>> = if inbound > 0 {
            let listen_addr = SocketAddr::new(
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                self.config.listen_port,
            );
            let acceptor = Acceptor::bind(
                listen_addr,
                inbound,
                registry.clone(),
                self.metrics.clone(),
                stop.clone(),
            )
            .map_err(|e| match e {
                AcceptorError::Bind(io) => SetupError::Bind(io),
                other => SetupError::AcceptorFailed(other),
            })?;

            let failure = acceptor_failure.clone();
            let table_for_acceptor = table.clone();
            Some(thread::spawn(move || {
                if let Err(e) = acceptor.run() {
                    log::error!("accept loop failed: {}", e);
                    *failure.lock().unwrap_or_else(|p| p.into_inner()) = Some(e);
                    // wake the convergence loop
                    table_for_acceptor.notify_changed();
                }
            }))
        } else {
            None
        };

        let worker_handles: Vec<JoinHandle<()>> =
            workers.into_iter().map(HandshakeWorker::spawn).collect();

        log::debug!("setup phase: {}", SetupPhase::Waiting);
        let outcome = self.wait_for_convergence(&table, &acceptor_failure, deadline);

        // teardown ordering: raise the stop flag, then join every thread
        // before touching channels; a channel is never torn down while
        // its owning worker is active
        stop.store(true, Ordering::Relaxed);
        if let Some(handle) = acceptor_handle {
            if handle.join().is_err() {
                log::error!("accept loop thread panicked");
            }
        }
        for handle in worker_handles {
            if handle.join().is_err() {
                log::error!("handshake worker thread panicked");
            }
        }

        self.finish(outcome, table, &acceptor_failure, expected)
    }

    fn wait_for_convergence(
        &self,
        table: &ConnectionTable,
        acceptor_failure: &Mutex<Option<AcceptorError>>,
        deadline: Instant,
    ) -> WaitOutcome {
        loop {
            if table.all_ready() {
                return WaitOutcome::AllReady;
            }
            if self.abort.load(Ordering::Relaxed) {
                return WaitOutcome::Aborted;
            }
            if acceptor_failure
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .is_some()
            {
                return WaitOutcome::AcceptorFailed;
            }
            let now = Instant::now();
            if now >= deadline {
                return WaitOutcome::DeadlinePassed;
            }
            if self.config.lenient {
                // tolerate per-channel failures; stop early once nothing
                // can make further progress
                if table.all_settled() {
                    return WaitOutcome::Settled;
                }
            } else if table.any_failed() {
                return WaitOutcome::ChannelFailed;
            }
            table.wait_changed(SETUP_POLL_INTERVAL.min(deadline - now));
        }
    }

    fn finish(
        &self,
        outcome: WaitOutcome,
        table: Arc<ConnectionTable>,
        acceptor_failure: &Mutex<Option<AcceptorError>>,
        expected: usize,
    ) -> Result<Arc<ConnectionTable>, SetupError> {
        match outcome {
            WaitOutcome::AllReady => {
                log::info!(
                    "setup phase: {}, {} channel(s) ready",
                    SetupPhase::Succeeded,
                    table.count()
                );
                Ok(table)
            }
            WaitOutcome::Settled | WaitOutcome::DeadlinePassed if self.config.lenient => {
                let pruned = table.prune_not_ready();
                log::info!(
                    "setup phase: {}, lenient mode kept {} channel(s), pruned {}",
                    SetupPhase::Succeeded,
                    table.count(),
                    pruned
                );
                Ok(table)
            }
            WaitOutcome::DeadlinePassed | WaitOutcome::Settled => {
                let ready = self.count_ready(&table);
                table.close_all();
                log::warn!(
                    "setup phase: {}, {}/{} channels ready at deadline",
                    SetupPhase::TimedOut,
                    ready,
                    expected
                );
                Err(SetupError::TimedOut { ready, expected })
            }
            WaitOutcome::ChannelFailed => {
                let failed = self.count_failed(&table);
                table.close_all();
                log::warn!(
                    "setup phase: {}, {} channel(s) failed",
                    SetupPhase::Failed,
                    failed
                );
                Err(SetupError::ChannelsFailed { failed })
            }
            WaitOutcome::AcceptorFailed => {
                table.close_all();
                let error = acceptor_failure
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .take()
                    .unwrap_or(AcceptorError::Accept(io::Error::new(
                        io::ErrorKind::Other,
                        "accept loop terminated",
                    )));
                log::warn!("setup phase: {}", SetupPhase::Failed);
                Err(SetupError::AcceptorFailed(error))
            }
            WaitOutcome::Aborted => {
                table.close_all();
                log::warn!("setup phase: {}, aborted", SetupPhase::Failed);
                Err(SetupError::Aborted)
            }
        }
    }

    fn count_ready(&self, table: &ConnectionTable) -> usize {
        table
            .addresses()
            .iter()
            .filter_map(|a| table.get(a))
            .filter(|ch| ch.state() == crate::channel::ChannelState::Ready)
            .count()
    }

    fn count_failed(&self, table: &ConnectionTable) -> usize {
        table
            .addresses()
            .iter()
            .filter_map(|a| table.get(a))
            .filter(|ch| ch.state() == crate::channel::ChannelState::Error)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PeerEntry;
    use crate::handshake::InsecureHandshake;

    fn config_with(peers: Vec<PeerEntry>, listen_port: u16, lenient: bool) -> SetupConfig {
        SetupConfig {
            listen_port,
            peers,
            timeout_secs: 1,
            lenient,
            psk: None,
        }
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = config_with(Vec::new(), 0, false);
        let result = CommSetup::new(config, Arc::new(InsecureHandshake));
        assert!(matches!(result, Err(SetupError::InvalidConfig(_))));
    }

    #[test]
    fn test_strict_timeout_when_peer_absent() {
        // nothing listens on the target port: the dial retries until the
        // deadline, then the setup reports a timeout and closes the table
        let config = config_with(
            vec![PeerEntry {
                host: "127.0.0.1".into(),
                port: 9,
                role: PeerRole::Connect,
            }],
            0,
            false,
        );
        let setup = CommSetup::new(config, Arc::new(InsecureHandshake)).unwrap();
        let started = Instant::now();
        match setup.establish() {
            Err(SetupError::TimedOut { ready, expected }) => {
                assert_eq!(ready, 0);
                assert_eq!(expected, 1);
            }
            other => panic!("expected TimedOut, got {:?}", other.map(|t| t.count())),
        }
        // deadline bound: reported no later than D plus one poll interval
        // (plus worker-join slack)
        assert!(started.elapsed() < Duration::from_secs(6));
    }

    #[test]
    fn test_lenient_timeout_returns_pruned_table() {
        let config = config_with(
            vec![PeerEntry {
                host: "127.0.0.1".into(),
                port: 9,
                role: PeerRole::Connect,
            }],
            0,
            true,
        );
        let setup = CommSetup::new(config, Arc::new(InsecureHandshake)).unwrap();
        let table = setup.establish().unwrap();
        assert_eq!(table.count(), 0);
        assert!(table.all_ready());
    }

    #[test]
    fn test_abort_flag_cancels_setup() {
        let mut config = config_with(
            vec![PeerEntry {
                host: "127.0.0.1".into(),
                port: 9,
                role: PeerRole::Connect,
            }],
            0,
            false,
        );
        config.timeout_secs = 30;
        let setup = CommSetup::new(config, Arc::new(InsecureHandshake)).unwrap();
        let abort = setup.abort_flag();
        let started = Instant::now();
        let runner = thread::spawn(move || setup.establish());
        thread::sleep(Duration::from_millis(300));
        abort.store(true, Ordering::Relaxed);
        let result = runner.join().unwrap();
        assert!(matches!(result, Err(SetupError::Aborted)));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
