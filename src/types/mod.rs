mod committee;
mod cosig;
mod ds_block;
mod peer;
mod tx_block;
mod vc_block;

pub use committee::{
    committee_hash, Committee, Mode, NodeState, Shard, ShardMember, ShardTable, SyncType,
};
pub use cosig::{bitmap_to_bytes, CoSignatures};
pub use ds_block::{DsBlock, DsBlockHeader};
pub use peer::Peer;
pub use tx_block::{TxBlock, TxBlockHeader};
pub use vc_block::{VcBlock, VcBlockHeader};

/// Hex-encoded public key identifying a node on the wire and in the
/// committee.
pub type PublicKey = String;
