use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::crypto::sha256;

use super::{CoSignatures, NodeState, Peer, PublicKey};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct VcBlockHeader {
    pub vc_ds_epoch_no: u64,
    pub vc_epoch_no: u64,
    pub view_change_state: NodeState,
    pub faulty_leaders: Vec<(PublicKey, Peer)>,
    pub committee_hash: String,
    pub timestamp: u64,
}

impl VcBlockHeader {
    pub fn new(
        vc_ds_epoch_no: u64,
        vc_epoch_no: u64,
        view_change_state: NodeState,
        faulty_leaders: Vec<(PublicKey, Peer)>,
        committee_hash: String,
    ) -> Self {
        Self {
            vc_ds_epoch_no,
            vc_epoch_no,
            view_change_state,
            faulty_leaders,
            committee_hash,
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        }
    }

    pub fn canonical_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("serializing VC block header")
    }

    pub fn compute_hash(&self) -> String {
        hex::encode(sha256(&self.canonical_bytes()))
    }
}

/// Block recording leader-suspicion evidence; replaces the suspected leader
/// by parking every named faulty leader at the committee tail.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct VcBlock {
    pub header: VcBlockHeader,
    pub cosigs: CoSignatures,
    pub block_hash: String,
}

impl VcBlock {
    pub fn new(header: VcBlockHeader, cosigs: CoSignatures) -> Self {
        let block_hash = header.compute_hash();
        Self {
            header,
            cosigs,
            block_hash,
        }
    }
}
