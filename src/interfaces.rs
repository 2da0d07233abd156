//! Contracts for the subsystems this core drives but does not implement:
//! the BFT consensus primitive, the peer-to-peer transport, the account
//! store, and the shard-node half of the epoch protocol. Production wiring
//! injects real implementations; tests inject doubles.

use crate::errors::ChainResult;
use crate::types::{Committee, CoSignatures, Peer, PublicKey, ShardTable};

/// Outcome classes reported by the consensus primitive after absorbing a
/// message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsensusState {
    Initial,
    InProgress,
    Done,
    Error,
}

/// Failure detail for [`ConsensusState::Error`]; the missing-data codes are
/// recoverable by refetching and re-running the round.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsensusErrorCode {
    MissingMicroblocks,
    MissingTxn,
    Other,
}

/// One in-flight consensus round. Constructed by the consensus layer when
/// the node enters the corresponding consensus state; implementations use
/// interior mutability because handlers share the object across threads.
pub trait ConsensusObject: Send + Sync {
    /// Absorb one consensus message. Returns false when the message was
    /// rejected outright (bad signature, wrong round).
    fn process(&self, message: &[u8], offset: usize, from: &Peer) -> bool;

    /// Whether `message` can be absorbed now without violating the round's
    /// internal ordering.
    fn can_process(&self, message: &[u8], offset: usize) -> bool;

    /// Extract the consensus id stamped on `message`.
    fn consensus_id(&self, message: &[u8], offset: usize) -> ChainResult<u32>;

    fn state(&self) -> ConsensusState;

    fn error_code(&self) -> ConsensusErrorCode;

    /// Co-signatures accumulated by a DONE round, to be attached to the
    /// pending block.
    fn co_signatures(&self) -> CoSignatures;

    /// Rewind the round to its initial state so it can be re-driven after
    /// missing data was fetched.
    fn recover_to_initial(&self);
}

/// Entry points for starting consensus rounds; implemented by the consensus
/// layer, invoked by the epoch state machine when timers fire or buffered
/// messages force an early start.
pub trait ConsensusRunner: Send + Sync {
    fn run_microblock_consensus(&self);

    /// Rebuild the final-block consensus announcement before re-processing
    /// a recovered round.
    fn prepare_final_block_consensus(&self);

    fn run_final_block_consensus(&self, proceed_without_all_microblocks: bool);

    /// Vacuous-epoch handoff: begin the PoW round for the next DS epoch.
    fn start_new_ds_epoch(&self);
}

/// Peer-to-peer sends used for block dissemination.
pub trait Transport: Send + Sync {
    fn send_broadcast(&self, peers: &[Peer], message: &[u8]) -> ChainResult<()>;

    fn send_unicast(&self, peer: &Peer, message: &[u8]) -> ChainResult<()>;

    fn send_rumor_to_foreign(&self, peers: &[Peer], message: &[u8]) -> ChainResult<()>;

    /// Reset the rumor/gossip membership for the new epoch.
    fn init_rumor_manager(&self, peers: &[Peer]) -> ChainResult<()>;

    fn send_to_lookup_nodes(&self, message: &[u8]) -> ChainResult<()>;
}

/// Schnorr multi-signature operations over hex-encoded keys and signatures.
pub trait MultiSigVerifier: Send + Sync {
    /// Aggregate the given public keys into one verification key.
    fn aggregate(&self, pub_keys: &[PublicKey]) -> ChainResult<PublicKey>;

    fn verify(&self, message: &[u8], signature: &str, aggregated_key: &PublicKey) -> bool;

    /// Minimum number of co-signers for a committee of `n`.
    fn num_for_consensus(&self, n: usize) -> usize {
        n - (n - 1) / 3
    }
}

/// The externally synchronized account state; this core only moves deltas
/// in and out around final-block commits.
pub trait AccountStore: Send + Sync {
    fn serialized_delta(&self) -> ChainResult<Vec<u8>>;

    fn move_updates_to_disk(&self) -> ChainResult<()>;

    fn init_temp(&self);

    fn init_reversibles(&self);
}

/// Coordinated dissemination of a finalized block to the committee, the
/// shards, and the lookup set.
pub trait DataSender: Send + Sync {
    fn send_data_to_others(
        &self,
        block_hash: [u8; 32],
        committee: &Committee,
        shards: &ShardTable,
        composer: &(dyn Fn(u32) -> ChainResult<Vec<u8>> + Sync),
        send_to_shards: &(dyn Fn(&ShardTable, usize, usize) -> ChainResult<()> + Sync),
    ) -> ChainResult<()>;
}

/// The shard-node half of the node: everything the DS core delegates when
/// the epoch advances or the node is demoted out of the committee.
pub trait ShardNodeHooks: Send + Sync {
    /// Bind the DS committee as this node's shard for the coming TX epochs
    /// and record whether this node leads it.
    fn configure_ds_shard(&self, members: &Committee, is_primary: bool);

    fn set_shard_id(&self, shard_id: u32);

    fn load_sharding_structure(&self) -> bool;

    fn load_txn_sharing_info(&self);

    /// Test-net only: refresh the admission whitelist for the new shards.
    fn refresh_shard_whitelist(&self) {}

    fn commit_txn_packet_buffer(&self);

    fn update_processed_transactions(&self);

    fn act_on_final_block(&self);

    fn has_local_microblock(&self) -> bool;

    fn update_state_for_next_consensus_round(&self);

    /// Demoted-node entry point: start the first TX epoch as a shard node.
    fn start_first_tx_epoch(&self);

    /// Replay one buffered microblock submission once the state opens.
    fn process_microblock_submission(&self, message: Vec<u8>, from: Peer);
}

/// Software-upgrade hook fired at the scheduled DS block.
pub trait UpgradeManager: Send + Sync {
    fn replace_node(&self);
}
