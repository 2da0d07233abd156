use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::crypto::sha256;

use super::{CoSignatures, PublicKey};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DsBlockHeader {
    pub block_num: u64,
    pub prev_hash: String,
    pub miner_pub_key: PublicKey,
    pub nonce: u64,
    pub ds_difficulty: u8,
    pub difficulty: u8,
    pub timestamp: u64,
    pub committee_hash: String,
}

impl DsBlockHeader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        block_num: u64,
        prev_hash: String,
        miner_pub_key: PublicKey,
        nonce: u64,
        ds_difficulty: u8,
        difficulty: u8,
        committee_hash: String,
    ) -> Self {
        Self {
            block_num,
            prev_hash,
            miner_pub_key,
            nonce,
            ds_difficulty,
            difficulty,
            committee_hash,
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        }
    }

    pub fn canonical_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("serializing DS block header")
    }
}

/// Block announcing the PoW winner, the next sharding structure, and the
/// difficulty targets for the coming DS epoch.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DsBlock {
    pub header: DsBlockHeader,
    pub cosigs: CoSignatures,
}

impl DsBlock {
    pub fn new(header: DsBlockHeader) -> Self {
        Self {
            header,
            cosigs: CoSignatures::default(),
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
}
