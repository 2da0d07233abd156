use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::crypto::sha256;
use crate::errors::{ChainError, ChainResult};
use crate::types::{DsBlock, TxBlock};

/// Kind tag for entries in the block-link chain.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum BlockLinkKind {
    Ds,
    Tx,
    Vc,
}

/// One entry of the block-link chain: a pointer tying an accepted block into
/// the global ordering across block kinds.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockLink {
    pub index: u64,
    pub ds_epoch_no: u64,
    pub kind: BlockLinkKind,
    pub hash: String,
}

#[derive(Debug)]
struct ChainInner {
    ds_blocks: Vec<DsBlock>,
    tx_blocks: Vec<TxBlock>,
    block_links: Vec<BlockLink>,
    current_epoch_num: u64,
    consensus_id: u32,
    ds_block_rand: [u8; 32],
    tx_block_rand: [u8; 32],
    latest_active_ds_block_num: u64,
}

/// In-memory append-only view of the DS chain, the TX chain, and the
/// block-link chain, plus the epoch counters and randomness seeds derived
/// from them.
pub struct ChainState {
    inner: RwLock<ChainInner>,
}

impl ChainState {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(ChainInner {
                ds_blocks: Vec::new(),
                tx_blocks: Vec::new(),
                block_links: Vec::new(),
                current_epoch_num: 0,
                consensus_id: 0,
                ds_block_rand: [0u8; 32],
                tx_block_rand: [0u8; 32],
                latest_active_ds_block_num: 0,
            }),
        }
    }

    /// Append a DS block. Rejects anything but the direct successor of the
    /// current tail. A gap is not fatal to the caller: the block is
    /// persisted by storage either way and the mismatch is a recovery
    /// signal.
    pub fn append_ds(&self, block: DsBlock) -> ChainResult<()> {
        let mut inner = self.inner.write();
        if let Some(tail) = inner.ds_blocks.last() {
            let expected = tail.header.block_num + 1;
            if block.header.block_num != expected {
                return Err(ChainError::ChainGap {
                    expected,
                    received: block.header.block_num,
                });
            }
        }
        inner.ds_blocks.push(block);
        Ok(())
    }

    pub fn append_tx(&self, block: TxBlock) -> ChainResult<()> {
        let mut inner = self.inner.write();
        if let Some(tail) = inner.tx_blocks.last() {
            let expected = tail.header.block_num + 1;
            if block.header.block_num != expected {
                return Err(ChainError::ChainGap {
                    expected,
                    received: block.header.block_num,
                });
            }
        }
        inner.tx_blocks.push(block);
        Ok(())
    }

    /// Append a block link and return the index it was assigned.
    pub fn append_link(&self, ds_epoch_no: u64, kind: BlockLinkKind, hash: String) -> u64 {
        let mut inner = self.inner.write();
        let index = inner.block_links.len() as u64;
        inner.block_links.push(BlockLink {
            index,
            ds_epoch_no,
            kind,
            hash,
        });
        index
    }

    pub fn tail_ds(&self) -> Option<DsBlock> {
        self.inner.read().ds_blocks.last().cloned()
    }

    pub fn tail_tx(&self) -> Option<TxBlock> {
        self.inner.read().tx_blocks.last().cloned()
    }

    pub fn tail_ds_block_num(&self) -> u64 {
        self.inner
            .read()
            .ds_blocks
            .last()
            .map(|block| block.header.block_num)
            .unwrap_or(0)
    }

    pub fn tail_tx_block_num(&self) -> u64 {
        self.inner
            .read()
            .tx_blocks
            .last()
            .map(|block| block.header.block_num)
            .unwrap_or(0)
    }

    pub fn latest_link_index(&self) -> Option<u64> {
        self.inner.read().block_links.last().map(|link| link.index)
    }

    pub fn block_links(&self) -> Vec<BlockLink> {
        self.inner.read().block_links.clone()
    }

    pub fn current_epoch_num(&self) -> u64 {
        self.inner.read().current_epoch_num
    }

    pub fn consensus_id(&self) -> u32 {
        self.inner.read().consensus_id
    }

    /// Advance to the next TX epoch. Called exactly once per committed final
    /// block, after the block reached storage.
    pub fn increase_epoch(&self) {
        let mut inner = self.inner.write();
        inner.current_epoch_num += 1;
        inner.consensus_id += 1;
    }

    /// `H(prev_rand ∥ new_block_hash)`, refreshed on every DS block commit.
    pub fn update_ds_block_rand(&self, block_hash: [u8; 32]) {
        let mut inner = self.inner.write();
        let mut material = Vec::with_capacity(64);
        material.extend_from_slice(&inner.ds_block_rand);
        material.extend_from_slice(&block_hash);
        inner.ds_block_rand = sha256(&material);
    }

    pub fn update_tx_block_rand(&self, block_hash: [u8; 32]) {
        let mut inner = self.inner.write();
        let mut material = Vec::with_capacity(64);
        material.extend_from_slice(&inner.tx_block_rand);
        material.extend_from_slice(&block_hash);
        inner.tx_block_rand = sha256(&material);
    }

    pub fn ds_block_rand(&self) -> [u8; 32] {
        self.inner.read().ds_block_rand
    }

    pub fn tx_block_rand(&self) -> [u8; 32] {
        self.inner.read().tx_block_rand
    }

    pub fn set_latest_active_ds_block_num(&self, block_num: u64) {
        self.inner.write().latest_active_ds_block_num = block_num;
    }

    pub fn latest_active_ds_block_num(&self) -> u64 {
        self.inner.read().latest_active_ds_block_num
    }
}

impl Default for ChainState {
    fn default() -> Self {
        Self::new()
    }
}
