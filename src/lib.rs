//! Pairwise authenticated channel establishment for multi-party
//! protocols.
//!
//! Before a multi-party protocol can exchange a single message, every
//! party needs a live, authenticated channel to every other party. This
//! crate wires that up:
//! - one accept loop for peers that dial in, matched by source host
//! - one worker thread per expected channel driving connect + handshake
//! - a shared connection table the caller receives only once every
//!   expected channel is ready (all-or-nothing), or pruned to the ready
//!   subset in lenient mode
//!
//! The security handshake is an injected collaborator; the crate ships a
//! pre-shared-key implementation and an insecure no-op for tests.

pub mod acceptor;
pub mod channel;
pub mod config;
pub mod handshake;
pub mod metrics;
pub mod pending;
pub mod setup;
pub mod table;
pub mod worker;

pub use channel::{Channel, ChannelError, ChannelState, PeerAddress};
pub use config::{ConfigError, PeerEntry, PeerRole, SetupConfig};
pub use handshake::{Handshake, HandshakeError, InsecureHandshake, PskHandshake};
pub use metrics::Metrics;
pub use setup::{CommSetup, SetupError};
pub use table::ConnectionTable;
