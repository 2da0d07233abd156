use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::errors::{ChainError, ChainResult};
use crate::types::{DsBlock, Peer, ShardTable, TxBlock, VcBlock};

/// First envelope byte: the node-to-node channel.
pub const MSG_TYPE_NODE: u8 = 0x01;

/// Second envelope byte: instruction within the node channel.
pub const NODE_INST_DSBLOCK: u8 = 0x06;
pub const NODE_INST_FINALBLOCK: u8 = 0x07;
pub const NODE_INST_VCBLOCK: u8 = 0x0a;

/// Offset of the encoded payload within an enveloped message.
pub const MESSAGE_BODY_OFFSET: usize = 2;

/// Payload of a `NODE/DSBLOCK` message: the finalized DS block plus the
/// sharding structure the receiving shard needs to set itself up.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DsBlockAnnouncement {
    pub shard_id: u32,
    pub ds_block: DsBlock,
    pub winner_peer: Peer,
    pub shards: ShardTable,
    pub ds_receivers: Vec<Peer>,
    pub shard_receivers: Vec<Vec<Peer>>,
    pub shard_senders: Vec<Vec<Peer>>,
}

/// Payload of a `NODE/FINALBLOCK` message.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct FinalBlockAnnouncement {
    pub shard_id: u32,
    pub ds_block_num: u64,
    pub consensus_id: u32,
    pub tx_block: TxBlock,
    pub state_delta: Vec<u8>,
}

/// Payload of a `NODE/VCBLOCK` message.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct VcBlockAnnouncement {
    pub vc_block: VcBlock,
}

fn compose<T: Serialize>(instruction: u8, payload: &T) -> ChainResult<Vec<u8>> {
    let mut message = vec![MSG_TYPE_NODE, instruction];
    let encoded = bincode::serialize(payload)?;
    message.extend_from_slice(&encoded);
    Ok(message)
}

fn read<T: DeserializeOwned>(instruction: u8, message: &[u8], offset: usize) -> ChainResult<T> {
    if message.len() < MESSAGE_BODY_OFFSET || offset < MESSAGE_BODY_OFFSET {
        return Err(ChainError::Codec("message shorter than envelope".into()));
    }
    if message[0] != MSG_TYPE_NODE || message[1] != instruction {
        return Err(ChainError::Codec(format!(
            "unexpected envelope {:#04x}/{:#04x}",
            message[0], message[1]
        )));
    }
    Ok(bincode::deserialize(&message[offset..])?)
}

pub fn compose_ds_block(announcement: &DsBlockAnnouncement) -> ChainResult<Vec<u8>> {
    compose(NODE_INST_DSBLOCK, announcement)
}

pub fn read_ds_block(message: &[u8], offset: usize) -> ChainResult<DsBlockAnnouncement> {
    read(NODE_INST_DSBLOCK, message, offset)
}

pub fn compose_final_block(announcement: &FinalBlockAnnouncement) -> ChainResult<Vec<u8>> {
    compose(NODE_INST_FINALBLOCK, announcement)
}

pub fn read_final_block(message: &[u8], offset: usize) -> ChainResult<FinalBlockAnnouncement> {
    read(NODE_INST_FINALBLOCK, message, offset)
}

pub fn compose_vc_block(announcement: &VcBlockAnnouncement) -> ChainResult<Vec<u8>> {
    compose(NODE_INST_VCBLOCK, announcement)
}

pub fn read_vc_block(message: &[u8], offset: usize) -> ChainResult<VcBlockAnnouncement> {
    read(NODE_INST_VCBLOCK, message, offset)
}
