//! Chunk splitting and per-chunk request state.

use crate::peer::{Peer, Piece};
use crate::CHUNK_WIDTH;
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;

/// Splits `[from, to]` into consecutive closed intervals of width
/// [`CHUNK_WIDTH`], the last possibly shorter.
///
/// The first interval starts at `from`; each subsequent interval starts one
/// past the previous interval's end. Returns an empty vector when
/// `from > to` or `to == 0`.
pub fn split_chunks(from: u64, to: u64) -> Vec<(u64, u64)> {
    // A chunk may be a single block, so from == to is a valid range.
    if from > to || to == 0 {
        return Vec::new();
    }

    let mut chunks = Vec::with_capacity(((to - from) / CHUNK_WIDTH + 1) as usize);
    let mut lo = from;
    while lo <= to {
        let hi = (lo + CHUNK_WIDTH - 1).min(to);
        chunks.push((lo, hi));
        match hi.checked_add(1) {
            Some(next) => lo = next,
            None => break,
        }
    }

    chunks
}

/// Lifecycle state of a chunk request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    /// Queued, not yet dispatched
    Waiting,
    /// Sent to a peer, awaiting a response before the deadline
    Pending,
    /// A response for the chunk is being applied
    Respond,
    /// All expected snapshot blocks received
    Done,
    /// Abandoned after peer exhaustion
    Error,
    /// Dropped by pool shutdown
    Cancelled,
}

impl fmt::Display for ChunkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Waiting => write!(f, "waiting"),
            Self::Pending => write!(f, "pending"),
            Self::Respond => write!(f, "respond"),
            Self::Done => write!(f, "done"),
            Self::Error => write!(f, "error"),
            Self::Cancelled => write!(f, "canceled"),
        }
    }
}

/// One chunk of a requested height range and its request state.
///
/// The record keeps a non-owning handle to its currently assigned peer;
/// ownership of the record itself moves from the pending queue into the
/// pool's in-flight map when the chunk is dispatched.
pub struct ChunkRequest {
    pub(crate) id: u64,
    pub(crate) from: u64,
    pub(crate) to: u64,
    pub(crate) peer: Option<Arc<dyn Peer>>,
    pub(crate) state: ChunkState,
    /// Only meaningful while `state` is [`ChunkState::Pending`].
    pub(crate) deadline: Instant,
    /// Snapshot blocks received so far; never exceeds the chunk width.
    pub(crate) count: u64,
    /// Pre-encoded request payload, reused across retries.
    pub(crate) msg: Vec<u8>,
}

impl ChunkRequest {
    /// Creates a chunk covering `[from, to]` with an encoded request payload.
    pub fn new(id: u64, from: u64, to: u64, msg: Vec<u8>) -> Self {
        Self {
            id,
            from,
            to,
            peer: None,
            state: ChunkState::Waiting,
            deadline: Instant::now(),
            count: 0,
            msg,
        }
    }

    /// Process-unique request id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ChunkState {
        self.state
    }

    /// Snapshot blocks received so far.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Number of snapshot blocks the chunk must receive to complete.
    pub fn width(&self) -> u64 {
        self.to - self.from + 1
    }

    /// Whether the chunk is in flight with its deadline behind `now`.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.state == ChunkState::Pending && now > self.deadline
    }
}

impl Piece for ChunkRequest {
    fn band(&self) -> (u64, u64) {
        (self.from, self.to)
    }

    fn set_band(&mut self, from: u64, to: u64) {
        self.from = from;
        self.to = to;
    }
}

impl fmt::Debug for ChunkRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkRequest")
            .field("id", &self.id)
            .field("from", &self.from)
            .field("to", &self.to)
            .field("state", &self.state)
            .field("count", &self.count)
            .finish()
    }
}
