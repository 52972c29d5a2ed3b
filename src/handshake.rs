//! Channel securing.
//!
//! The orchestrator is handed a [`Handshake`] implementation and every
//! worker invokes it exactly once on its freshly connected socket. The
//! crate ships two implementations: [`PskHandshake`], a mutual
//! challenge/response authentication over a pre-shared key, and
//! [`InsecureHandshake`], which skips authentication entirely.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::TcpStream;

use ring::hmac;
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};

use crate::channel::PeerAddress;

// ============================================================================
// Constants
// ============================================================================

/// Challenge nonce length in bytes
pub const NONCE_LEN: usize = 32;

/// Length of the message header (4 bytes for length)
const HEADER_LEN: usize = 4;

/// Upper bound on a single handshake message (the real ones are < 64 bytes)
const MAX_AUTH_MESSAGE_SIZE: u32 = 1024;

// ============================================================================
// Errors
// ============================================================================

/// Errors during channel securing
#[derive(Debug)]
pub enum HandshakeError {
    /// The peer failed authentication (bad proof)
    Rejected,
    /// The peer sent something that is not a valid handshake message
    Protocol(String),
    /// Socket failure mid-handshake
    Io(io::Error),
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeError::Rejected => write!(f, "peer rejected: authentication proof invalid"),
            HandshakeError::Protocol(msg) => write!(f, "handshake protocol error: {}", msg),
            HandshakeError::Io(e) => write!(f, "handshake i/o error: {}", e),
        }
    }
}

impl std::error::Error for HandshakeError {}

impl From<io::Error> for HandshakeError {
    fn from(e: io::Error) -> Self {
        HandshakeError::Io(e)
    }
}

// ============================================================================
// Handshake Trait
// ============================================================================

/// Secures one raw socket against one expected peer.
///
/// Implementations are injected into the orchestrator and invoked once
/// per channel by its worker, from that worker's thread. Failure here is
/// the principal failure mode of establishment and marks only the one
/// channel as failed.
pub trait Handshake: Send + Sync {
    fn secure(&self, stream: &mut TcpStream, peer: &PeerAddress) -> Result<(), HandshakeError>;
}

// ============================================================================
// Wire Messages
// ============================================================================

/// Handshake message types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum AuthMessage {
    /// Random nonce the peer must prove key knowledge over
    Challenge { nonce: [u8; NONCE_LEN] },
    /// HMAC over the received nonce under the shared key
    Proof { tag: Vec<u8> },
}

/// Encode a handshake message with a 4-byte length prefix.
fn write_message(stream: &mut TcpStream, msg: &AuthMessage) -> Result<(), HandshakeError> {
    let payload =
        bincode::serialize(msg).map_err(|e| HandshakeError::Protocol(e.to_string()))?;
    if payload.len() > MAX_AUTH_MESSAGE_SIZE as usize {
        return Err(HandshakeError::Protocol(format!(
            "message too large: {} bytes",
            payload.len()
        )));
    }
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&payload);
    stream.write_all(&buf)?;
    Ok(())
}

/// Decode one length-prefixed handshake message from the stream.
fn read_message(stream: &mut TcpStream) -> Result<AuthMessage, HandshakeError> {
    let mut header = [0u8; HEADER_LEN];
    stream.read_exact(&mut header)?;
    let length = u32::from_be_bytes(header);
    if length > MAX_AUTH_MESSAGE_SIZE {
        return Err(HandshakeError::Protocol(format!(
            "message too large: {} bytes",
            length
        )));
    }
    let mut payload = vec![0u8; length as usize];
    stream.read_exact(&mut payload)?;
    bincode::deserialize(&payload).map_err(|e| HandshakeError::Protocol(e.to_string()))
}

// ============================================================================
// Pre-Shared Key Handshake
// ============================================================================

/// Mutual challenge/response authentication over a pre-shared key.
///
/// Both sides send a random nonce, answer the peer's nonce with an
/// HMAC-SHA256 proof under the shared key, and verify the proof they get
/// back. Symmetric, so it needs no role negotiation. It authenticates
/// the peer; it does not encrypt the channel.
pub struct PskHandshake {
    key: hmac::Key,
    rng: SystemRandom,
}

impl PskHandshake {
    pub fn new(secret: &[u8]) -> Self {
        PskHandshake {
            key: hmac::Key::new(hmac::HMAC_SHA256, secret),
            rng: SystemRandom::new(),
        }
    }
}

impl Handshake for PskHandshake {
    fn secure(&self, stream: &mut TcpStream, peer: &PeerAddress) -> Result<(), HandshakeError> {
        // 1. challenge the peer
        let mut nonce = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce)
            .map_err(|_| HandshakeError::Protocol("nonce generation failed".into()))?;
        write_message(stream, &AuthMessage::Challenge { nonce })?;

        // 2. receive the peer's challenge
        let peer_nonce = match read_message(stream)? {
            AuthMessage::Challenge { nonce } => nonce,
            other => {
                return Err(HandshakeError::Protocol(format!(
                    "expected challenge, got {:?}",
                    other
                )))
            }
        };

        // 3. prove key knowledge over the peer's nonce
        let tag = hmac::sign(&self.key, &peer_nonce);
        write_message(
            stream,
            &AuthMessage::Proof {
                tag: tag.as_ref().to_vec(),
            },
        )?;

        // 4. verify the peer's proof over our nonce (constant-time)
        let peer_tag = match read_message(stream)? {
            AuthMessage::Proof { tag } => tag,
            other => {
                return Err(HandshakeError::Protocol(format!(
                    "expected proof, got {:?}",
                    other
                )))
            }
        };
        hmac::verify(&self.key, &nonce, &peer_tag).map_err(|_| HandshakeError::Rejected)?;

        log::debug!("peer {} authenticated", peer);
        Ok(())
    }
}

// ============================================================================
// Insecure Handshake
// ============================================================================

/// No-op handshake for tests and plaintext deployments.
pub struct InsecureHandshake;

impl Handshake for InsecureHandshake {
    fn secure(&self, _stream: &mut TcpStream, peer: &PeerAddress) -> Result<(), HandshakeError> {
        log::debug!("skipping authentication for {}", peer);
        Ok(())
    }
}
