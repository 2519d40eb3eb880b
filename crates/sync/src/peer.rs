//! Capability traits the pool consumes from the surrounding node.
//!
//! The pool is generic over its collaborators: where peers come from, where
//! blocks go, and how request ids are minted. Each trait is the narrow
//! surface the pool actually touches, so tests and the composition root can
//! supply their own implementations.

use crate::message::Cmd;
use crate::PeerId;
use lattice_types::{AccountBlock, SnapshotBlock};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A remote peer able to accept fire-and-forget sends.
pub trait Peer: Send + Sync {
    /// Stable identifier, used to avoid retrying a chunk against the peer
    /// that just failed it.
    fn peer_id(&self) -> PeerId;

    /// Queues an encoded payload tagged with a request id.
    ///
    /// Delivery is not acknowledged at this layer; it is verified only by a
    /// later response or by the timeout sweep.
    fn send(&self, cmd: Cmd, request_id: u64, payload: Vec<u8>);

    /// Remote address, for logging.
    fn remote_addr(&self) -> SocketAddr;
}

/// Directory of peers keyed by advertised ledger height.
pub trait PeerSelector: Send + Sync {
    /// Peers claiming a ledger height of at least `height`.
    ///
    /// Order is unspecified; an empty vector means no peer can currently
    /// serve the height.
    fn pick(&self, height: u64) -> Vec<Arc<dyn Peer>>;
}

/// A band-addressable work unit, reported upward on unrecoverable failure.
pub trait Piece: Send {
    /// Inclusive height bounds of the piece.
    fn band(&self) -> (u64, u64);

    /// Rewrites the bounds, letting the receiver reshape the piece into a
    /// coarser recovery request.
    fn set_band(&mut self, from: u64, to: u64);
}

/// Downstream consumer of fetched blocks and failed pieces.
pub trait BlockReceiver: Send + Sync {
    /// Delivers an account block. Within one response, all account blocks
    /// arrive before any snapshot block.
    fn receive_account_block(&self, block: AccountBlock);

    /// Delivers a snapshot block.
    fn receive_snapshot_block(&self, block: SnapshotBlock);

    /// Reports a piece the pool has given up on. Called exactly once per
    /// piece; the pool will not retry it further.
    fn catch(&self, piece: &mut dyn Piece);
}

/// Allocator of process-unique request ids.
pub trait IdSource: Send + Sync {
    /// Returns the next id, never repeating one within the process lifetime.
    fn next_id(&self) -> u64;
}

/// Monotonic [`IdSource`] backed by an atomic counter, starting at 1.
#[derive(Debug, Default)]
pub struct SequentialIds(AtomicU64);

impl SequentialIds {
    /// Creates a fresh id source.
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdSource for SequentialIds {
    fn next_id(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}
