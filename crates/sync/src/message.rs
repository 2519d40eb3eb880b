//! Wire commands and payloads shared with the network layer.
//!
//! The pool never sees sockets; it exchanges pre-encoded payloads with the
//! network layer, tagged with a command code and a request id. Payloads are
//! serde types encoded through `to_bytes`/`from_bytes`.

use lattice_types::{AccountBlock, SnapshotBlock};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Command codes shared between the pool and the network layer.
///
/// The pool sends [`Cmd::GetChunk`] and handles [`Cmd::SubLedger`]; the rest
/// of the set belongs to other subsystems and reaches the pool only when a
/// message is misrouted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Cmd {
    /// Peer status announcement
    Status,
    /// Request for a chunk of the ledger
    GetChunk,
    /// Chunk response carrying ledger blocks
    SubLedger,
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status => write!(f, "status"),
            Self::GetChunk => write!(f, "get-chunk"),
            Self::SubLedger => write!(f, "sub-ledger"),
        }
    }
}

/// Errors raised while decoding inbound payloads.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// Payload bytes did not decode as the expected type
    #[error("malformed payload: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Request for an inclusive range of snapshot-chain heights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetChunk {
    /// First requested height
    pub start: u64,
    /// Last requested height
    pub end: u64,
}

impl GetChunk {
    /// Encodes the request for the wire.
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Decodes a request from wire bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, WireError> {
        Ok(serde_json::from_slice(data)?)
    }
}

impl fmt::Display for GetChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chunk [{}, {}]", self.start, self.end)
    }
}

/// Chunk response payload.
///
/// Account blocks are listed before the snapshot blocks that reference them,
/// and are delivered to the receiver in that order. Chunk completion is
/// measured in snapshot blocks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubLedger {
    /// Account-chain blocks covered by the requested range
    pub account_blocks: Vec<AccountBlock>,
    /// Snapshot-chain blocks for the requested range
    pub snapshot_blocks: Vec<SnapshotBlock>,
}

impl SubLedger {
    /// Encodes the response for the wire.
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Decodes a response from wire bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, WireError> {
        Ok(serde_json::from_slice(data)?)
    }
}

impl fmt::Display for SubLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} account blocks, {} snapshot blocks",
            self.account_blocks.len(),
            self.snapshot_blocks.len()
        )
    }
}

/// Inbound message envelope as delivered by the network layer.
#[derive(Debug, Clone)]
pub struct Message {
    /// Command code the sender tagged the message with
    pub cmd: Cmd,
    /// Request id the message answers
    pub id: u64,
    /// Encoded payload
    pub payload: Vec<u8>,
}

impl Message {
    /// Creates an envelope.
    pub fn new(cmd: Cmd, id: u64, payload: Vec<u8>) -> Self {
        Self { cmd, id, payload }
    }
}
