use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::crypto::sha256;

use super::CoSignatures;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TxBlockHeader {
    pub block_num: u64,
    pub block_type: u8,
    pub version: u32,
    pub num_txs: u32,
    pub rewards: u128,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub timestamp: u64,
    pub state_root: String,
    pub tx_root: String,
    pub prev_hash: String,
}

impl TxBlockHeader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        block_num: u64,
        block_type: u8,
        version: u32,
        num_txs: u32,
        rewards: u128,
        gas_limit: u64,
        gas_used: u64,
        state_root: String,
        tx_root: String,
        prev_hash: String,
    ) -> Self {
        Self {
            block_num,
            block_type,
            version,
            num_txs,
            rewards,
            gas_limit,
            gas_used,
            state_root,
            tx_root,
            prev_hash,
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        }
    }

    pub fn canonical_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("serializing TX block header")
    }
}

/// The epoch's canonical transaction block, aggregating the per-shard micro
/// blocks referenced in `micro_block_hashes`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TxBlock {
    pub header: TxBlockHeader,
    pub cosigs: CoSignatures,
    pub micro_block_hashes: Vec<String>,
}

impl TxBlock {
    pub fn new(header: TxBlockHeader, micro_block_hashes: Vec<String>) -> Self {
        Self {
            header,
            cosigs: CoSignatures::default(),
            micro_block_hashes,
        }
    }

    pub fn set_co_signatures(&mut self, cosigs: CoSignatures) {
        self.cosigs = cosigs;
    }

    pub fn block_hash(&self) -> [u8; 32] {
        sha256(&self.header.canonical_bytes())
    }

    pub fn block_hash_hex(&self) -> String {
        hex::encode(self.block_hash())
    }

    /// Serialization the rotation selector hashes; covers the whole block so
    /// the selector moves with the co-signatures, not just the header.
    pub fn selector_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("serializing TX block")
    }
}
