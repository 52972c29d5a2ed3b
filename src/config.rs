//! Setup configuration: the peer roster and local listening endpoint.
//!
//! The roster is the in-memory form the orchestrator consumes; the JSON
//! loader is a convenience for binaries. Each entry names one expected
//! peer, its nominal (host, port) identity, and whether we dial them or
//! they dial us.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::io;
use std::net::ToSocketAddrs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::channel::PeerAddress;

// ============================================================================
// Peer Roster
// ============================================================================

/// Who initiates the connection for one expected peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    /// We dial the peer's (host, port)
    Connect,
    /// The peer dials our listening port
    Accept,
}

/// One expected peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEntry {
    /// Hostname or IP literal
    pub host: String,
    /// The peer's nominal port: dialed for connect-role peers, identity
    /// only for accept-role peers (their source port is ephemeral)
    pub port: u16,
    pub role: PeerRole,
}

impl PeerEntry {
    /// Resolve the entry to a concrete peer address.
    pub fn resolve(&self) -> Result<PeerAddress, ConfigError> {
        let mut addrs = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| ConfigError::Resolve(self.host.clone(), e))?;
        match addrs.next() {
            Some(addr) => Ok(PeerAddress::from(addr)),
            None => Err(ConfigError::Resolve(
                self.host.clone(),
                io::Error::new(io::ErrorKind::NotFound, "no addresses"),
            )),
        }
    }
}

// ============================================================================
// Setup Config
// ============================================================================

fn default_timeout_secs() -> u64 {
    30
}

/// Everything one setup run needs to know.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupConfig {
    /// Local TCP port the acceptor binds; required when any peer has the
    /// accept role
    #[serde(default)]
    pub listen_port: u16,
    /// Expected peers, one channel each
    pub peers: Vec<PeerEntry>,
    /// Global establishment deadline in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Tolerate partial readiness: prune not-ready channels at the
    /// deadline instead of failing the whole setup
    #[serde(default)]
    pub lenient: bool,
    /// Pre-shared key for mutual channel authentication; unauthenticated
    /// channels when absent
    #[serde(default)]
    pub psk: Option<String>,
}

impl SetupConfig {
    /// Load and validate a JSON config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(ConfigError::Read)?;
        let config: SetupConfig = serde_json::from_str(&raw).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Check roster invariants before any socket is touched.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.peers.is_empty() {
            return Err(ConfigError::NoPeers);
        }
        if self.timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        let mut seen = HashSet::new();
        for entry in &self.peers {
            if entry.host.is_empty() {
                return Err(ConfigError::InvalidPeer("empty host".into()));
            }
            if entry.port == 0 {
                return Err(ConfigError::InvalidPeer(format!(
                    "peer {} has port 0",
                    entry.host
                )));
            }
            if !seen.insert((entry.host.clone(), entry.port)) {
                return Err(ConfigError::DuplicatePeer(format!(
                    "{}:{}",
                    entry.host, entry.port
                )));
            }
        }
        let has_inbound = self.peers.iter().any(|p| p.role == PeerRole::Accept);
        if has_inbound && self.listen_port == 0 {
            return Err(ConfigError::MissingListenPort);
        }
        Ok(())
    }

    /// Resolve the whole roster to concrete addresses.
    pub fn resolve_peers(&self) -> Result<Vec<(PeerAddress, PeerRole)>, ConfigError> {
        self.peers
            .iter()
            .map(|entry| entry.resolve().map(|addr| (addr, entry.role)))
            .collect()
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors while loading or validating a setup config
#[derive(Debug)]
pub enum ConfigError {
    /// Could not read the config file
    Read(io::Error),
    /// The file is not valid JSON for this schema
    Parse(serde_json::Error),
    /// The roster is empty
    NoPeers,
    /// A zero deadline can never converge
    ZeroTimeout,
    /// A roster entry is malformed
    InvalidPeer(String),
    /// Two roster entries share the same (host, port) identity
    DuplicatePeer(String),
    /// Accept-role peers are expected but no listening port is set
    MissingListenPort,
    /// A hostname did not resolve
    Resolve(String, io::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Read(e) => write!(f, "cannot read config: {}", e),
            ConfigError::Parse(e) => write!(f, "cannot parse config: {}", e),
            ConfigError::NoPeers => write!(f, "peer roster is empty"),
            ConfigError::ZeroTimeout => write!(f, "timeout_secs must be positive"),
            ConfigError::InvalidPeer(msg) => write!(f, "invalid peer entry: {}", msg),
            ConfigError::DuplicatePeer(key) => write!(f, "duplicate peer entry: {}", key),
            ConfigError::MissingListenPort => {
                write!(f, "accept-role peers configured but listen_port is unset")
            }
            ConfigError::Resolve(host, e) => write!(f, "cannot resolve host {}: {}", host, e),
        }
    }
}

impl std::error::Error for ConfigError {}
