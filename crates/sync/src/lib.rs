//! # Lattice Sync
//!
//! The chunk-request pool that drives the fetch of contiguous ledger ranges
//! from remote peers while a node catches up to the network.
//!
//! ## Overview
//!
//! A requested height range is split into fixed-width chunks of
//! [`CHUNK_WIDTH`] blocks. Chunks wait in a FIFO queue until a paced dispatch
//! loop hands each one to a peer advertising enough height; from then on the
//! chunk is tracked in an in-flight map against a deadline. Responses deliver
//! account blocks and snapshot blocks to a downstream receiver and advance
//! the chunk's receive count; timed-out or malformed responses move the chunk
//! to a different peer; a chunk that no peer can serve is reported upward
//! exactly once and forgotten.
//!
//! ## Protocol Flow
//!
//! 1. **Enqueue**: [`ChunkPool::add`] splits a range and queues its chunks.
//!    [`ChunkPool::exec`] dispatches a small urgent range immediately,
//!    bypassing the queue.
//!
//! 2. **Dispatch**: a 200 ms loop drains the queue one chunk per tick while
//!    the backpressure gate is open and the in-flight bound has room. Peers
//!    are chosen uniformly at random among those advertising the chunk's
//!    upper height.
//!
//! 3. **Backpressure**: the surrounding ledger pipeline reports its height
//!    via [`ChunkPool::threshold`]; the gate stays open only while the local
//!    chain is within [`DEFAULT_GATE_MARGIN`] heights of the furthest
//!    requested chunk.
//!
//! 4. **Recovery**: a second loop sweeps the in-flight map every
//!    [`DEFAULT_CHUNK_TIMEOUT_SECS`] seconds and moves expired chunks to a
//!    different peer. Peer exhaustion surfaces the chunk's band through
//!    [`BlockReceiver::catch`].
//!
//! ## Example
//!
//! ```rust,ignore
//! use lattice_sync::{ChunkPool, ChunkPoolConfig, SequentialIds};
//! use std::sync::Arc;
//!
//! let pool = ChunkPool::new(
//!     ChunkPoolConfig::default(),
//!     peer_set,          // Arc<impl PeerSelector>
//!     chain_receiver,    // Arc<impl BlockReceiver>
//!     Arc::new(SequentialIds::new()),
//! );
//! pool.start();
//! pool.add(1, 60);
//! // feed inbound messages: pool.handle(msg, sender)
//! # async {
//! pool.stop().await;
//! # };
//! ```
//!
//! The pool does not validate or persist blocks, does not negotiate peers,
//! and guarantees delivery only as best-effort retry across the available
//! peer set. Block ordering is guaranteed within a response (account blocks
//! first), not across chunks.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod chunk;
pub mod message;
pub mod peer;
pub mod pool;

// Re-export main types at crate root
pub use chunk::{split_chunks, ChunkRequest, ChunkState};
pub use message::{Cmd, GetChunk, Message, SubLedger, WireError};
pub use peer::{BlockReceiver, IdSource, Peer, PeerSelector, Piece, SequentialIds};
pub use pool::{ChunkPool, ChunkPoolConfig};

/// Identifier of a remote peer
pub type PeerId = [u8; 32];

/// Width of a chunk in snapshot-chain blocks
pub const CHUNK_WIDTH: u64 = 20;

/// Seconds an in-flight chunk may go unanswered before it is retried
pub const DEFAULT_CHUNK_TIMEOUT_SECS: u64 = 20;

/// Height window within which the dispatch gate stays open
pub const DEFAULT_GATE_MARGIN: u64 = 500;

/// Milliseconds between dispatch loop ticks
pub const DEFAULT_DISPATCH_TICK_MS: u64 = 200;

/// Bound on chunks concurrently in flight from the queue
pub const DEFAULT_MAX_INFLIGHT: usize = 5;
