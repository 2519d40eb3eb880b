//! # Lattice Types
//!
//! Core ledger types for the Lattice node.
//!
//! The Lattice ledger is a block lattice: every account owns its own chain of
//! [`AccountBlock`]s, and a single snapshot chain of [`SnapshotBlock`]s
//! periodically captures the head of each account chain. Both block kinds
//! travel over the wire during synchronization, so they carry serde
//! serialization alongside their canonical RLP encoding.
//!
//! This crate provides:
//! - [`H256`] - 32-byte hashes with Keccak256 support
//! - [`Address`] - 20-byte account addresses
//! - [`AccountBlock`] and [`SnapshotBlock`] - the two ledger block kinds

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod address;
pub mod block;
pub mod hash;

// Re-export main types at crate root
pub use address::Address;
pub use block::{AccountBlock, SnapshotBlock, SnapshotEntry};
pub use hash::H256;

/// Result type alias for Lattice types operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when working with Lattice types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid hex string
    #[error("invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    /// Invalid length for a fixed-size type
    #[error("invalid length: expected {expected}, got {actual}")]
    InvalidLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// RLP decoding error
    #[error("RLP decode error: {0}")]
    RlpDecode(#[from] rlp::DecoderError),
}
