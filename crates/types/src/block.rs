//! Account-chain and snapshot-chain block types.
//!
//! The ledger carries two block kinds:
//! - [`AccountBlock`] - a block on a single account's own chain
//! - [`SnapshotBlock`] - a block on the global snapshot chain, capturing the
//!   head of each account chain it has seen
//!
//! Snapshot blocks reference account blocks, so during synchronization the
//! account blocks of a response are always applied first.

use crate::{Address, Error, Result, H256};
use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};
use serde::{Deserialize, Serialize};

/// A block on one account chain.
///
/// Account chains grow independently of each other; `height` counts from 1
/// within the owning account's chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountBlock {
    /// Owning account
    pub account: Address,
    /// Height within the account chain (1-indexed)
    pub height: u64,
    /// Hash of the previous block on this account chain (NIL for the first)
    pub prev_hash: H256,
    /// Counterparty account for transfers, if any
    pub to: Option<Address>,
    /// Transferred amount in base units
    pub amount: u128,
    /// Unix timestamp in milliseconds
    pub timestamp: u64,
}

impl AccountBlock {
    /// Creates a new account block with no transfer attached.
    pub fn new(account: Address, height: u64, prev_hash: H256) -> Self {
        Self {
            account,
            height,
            prev_hash,
            to: None,
            amount: 0,
            timestamp: 0,
        }
    }

    /// Attaches a transfer to the block.
    pub fn with_transfer(mut self, to: Address, amount: u128) -> Self {
        self.to = Some(to);
        self.amount = amount;
        self
    }

    /// Computes the hash of this block.
    ///
    /// The hash is the Keccak256 of the RLP-encoded block.
    pub fn hash(&self) -> H256 {
        H256::keccak256(&rlp::encode(self))
    }

    /// Decodes a block from RLP bytes.
    pub fn rlp_decode(data: &[u8]) -> Result<Self> {
        let rlp = Rlp::new(data);
        Self::decode(&rlp).map_err(Error::RlpDecode)
    }
}

impl Encodable for AccountBlock {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(6);
        s.append(&self.account);
        s.append(&self.height);
        s.append(&self.prev_hash);
        match &self.to {
            Some(to) => s.append(to),
            None => s.append_empty_data(),
        };
        s.append(&self.amount);
        s.append(&self.timestamp);
    }
}

impl Decodable for AccountBlock {
    fn decode(rlp: &Rlp<'_>) -> std::result::Result<Self, DecoderError> {
        let to_raw: Vec<u8> = rlp.val_at(3)?;
        let to = if to_raw.is_empty() {
            None
        } else {
            Some(Address::from_slice(&to_raw).map_err(|_| DecoderError::RlpInvalidLength)?)
        };

        Ok(Self {
            account: rlp.val_at(0)?,
            height: rlp.val_at(1)?,
            prev_hash: rlp.val_at(2)?,
            to,
            amount: rlp.val_at(4)?,
            timestamp: rlp.val_at(5)?,
        })
    }
}

/// Head of one account chain as captured by a snapshot block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    /// Account whose chain head is captured
    pub account: Address,
    /// Height of the captured account block
    pub height: u64,
    /// Hash of the captured account block
    pub hash: H256,
}

impl Encodable for SnapshotEntry {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(3);
        s.append(&self.account);
        s.append(&self.height);
        s.append(&self.hash);
    }
}

impl Decodable for SnapshotEntry {
    fn decode(rlp: &Rlp<'_>) -> std::result::Result<Self, DecoderError> {
        Ok(Self {
            account: rlp.val_at(0)?,
            height: rlp.val_at(1)?,
            hash: rlp.val_at(2)?,
        })
    }
}

/// A block on the global snapshot chain.
///
/// Each snapshot block pins a consistent cut of the lattice: for every
/// account chain it has seen progress on, it records the newest block.
/// Ledger height, as used by synchronization, is snapshot-chain height.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotBlock {
    /// Height within the snapshot chain (1-indexed, genesis is height 1)
    pub height: u64,
    /// Hash of the previous snapshot block
    pub prev_hash: H256,
    /// Unix timestamp in milliseconds
    pub timestamp: u64,
    /// Captured account chain heads
    pub content: Vec<SnapshotEntry>,
}

impl SnapshotBlock {
    /// Creates a new snapshot block with empty content.
    pub fn new(height: u64, prev_hash: H256) -> Self {
        Self {
            height,
            prev_hash,
            timestamp: 0,
            content: Vec::new(),
        }
    }

    /// Records an account chain head in this snapshot.
    pub fn push_entry(&mut self, account: Address, height: u64, hash: H256) {
        self.content.push(SnapshotEntry {
            account,
            height,
            hash,
        });
    }

    /// Computes the hash of this block.
    ///
    /// The hash is the Keccak256 of the RLP-encoded block.
    pub fn hash(&self) -> H256 {
        H256::keccak256(&rlp::encode(self))
    }

    /// Decodes a block from RLP bytes.
    pub fn rlp_decode(data: &[u8]) -> Result<Self> {
        let rlp = Rlp::new(data);
        Self::decode(&rlp).map_err(Error::RlpDecode)
    }
}

impl Encodable for SnapshotBlock {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(4);
        s.append(&self.height);
        s.append(&self.prev_hash);
        s.append(&self.timestamp);
        s.append_list(&self.content);
    }
}

impl Decodable for SnapshotBlock {
    fn decode(rlp: &Rlp<'_>) -> std::result::Result<Self, DecoderError> {
        Ok(Self {
            height: rlp.val_at(0)?,
            prev_hash: rlp.val_at(1)?,
            timestamp: rlp.val_at(2)?,
            content: rlp.list_at(3)?,
        })
    }
}
