use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use crate::chain::ChainState;
use crate::committee::CommitteeRegistry;
use crate::config::NodeConfig;
use crate::interfaces::{
    AccountStore, ConsensusObject, ConsensusRunner, DataSender, MultiSigVerifier, ShardNodeHooks,
    Transport, UpgradeManager,
};
use crate::storage::Storage;
use crate::types::{Committee, DsBlock, Mode, NodeState, Peer, PublicKey, SyncType, TxBlock};

/// Tolerated clock skew when judging block timestamps.
const CLOCK_SKEW_SECS: u64 = 10;

/// Everything the post-consensus core calls but does not own.
pub struct DsDependencies {
    pub storage: Arc<Storage>,
    pub transport: Arc<dyn Transport>,
    pub runner: Arc<dyn ConsensusRunner>,
    pub multisig: Arc<dyn MultiSigVerifier>,
    pub account_store: Arc<dyn AccountStore>,
    pub data_sender: Arc<dyn DataSender>,
    pub shard_node: Arc<dyn ShardNodeHooks>,
    pub upgrade: Arc<dyn UpgradeManager>,
}

/// Scheduled software upgrade, if any.
#[derive(Clone, Copy, Debug, Default)]
pub struct SwInfo {
    pub upgrade_ds_block_num: Option<u64>,
}

/// Post-consensus state machine of one DS committee member. Construction
/// wires in the collaborators; inbound consensus messages enter through
/// [`process_ds_block_consensus`] and [`process_final_block_consensus`]
/// (dispatch module), and the epoch advances through the DS-block and
/// final-block post-processors.
///
/// [`process_ds_block_consensus`]: DirectoryService::process_ds_block_consensus
/// [`process_final_block_consensus`]: DirectoryService::process_final_block_consensus
pub struct DirectoryService {
    pub(crate) config: NodeConfig,
    pub(crate) registry: CommitteeRegistry,
    pub(crate) chain: ChainState,
    pub(crate) storage: Arc<Storage>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) runner: Arc<dyn ConsensusRunner>,
    pub(crate) multisig: Arc<dyn MultiSigVerifier>,
    pub(crate) account_store: Arc<dyn AccountStore>,
    pub(crate) data_sender: Arc<dyn DataSender>,
    pub(crate) shard_node: Arc<dyn ShardNodeHooks>,
    pub(crate) upgrade: Arc<dyn UpgradeManager>,

    state: Mutex<NodeState>,
    sync_type: Mutex<SyncType>,

    // Lock order when nested: consensus_mutex -> registry -> pending block
    // mutexes -> leaf mutexes. Never the reverse.
    pub(crate) consensus_mutex: Mutex<()>,
    pub(crate) consensus_object: Mutex<Option<Arc<dyn ConsensusObject>>>,

    pub(crate) pending_ds_block: Mutex<Option<DsBlock>>,
    pub(crate) pending_final_block: Mutex<Option<TxBlock>>,

    pub(crate) microblock_submission_buffer: Mutex<Vec<(Peer, Vec<u8>)>>,
    pub(crate) coinbase_rewardees: Mutex<HashMap<u64, Vec<PublicKey>>>,
    pub(crate) final_block_consensus_buffer: Mutex<HashMap<u32, Vec<(Peer, Vec<u8>)>>>,
    pub(crate) state_delta_from_shards: Mutex<Vec<u8>>,
    pub(crate) sw_info: Mutex<SwInfo>,
    pub(crate) total_txn_fees: Mutex<u128>,
    pub(crate) prepare_run_guard: Mutex<()>,

    pub(crate) stop_recv_new_mb_submission: AtomicBool,
    pub(crate) ds_started_microblock_consensus: AtomicBool,
    pub(crate) view_change_counter: AtomicU32,
    pub(crate) pow_submission_counter: AtomicU32,

    pub(crate) mutex_cv_ds_block_consensus_object: Mutex<()>,
    pub(crate) cv_ds_block_consensus_object: Condvar,
    pub(crate) mutex_cv_final_block_consensus_object: Mutex<()>,
    pub(crate) cv_final_block_consensus_object: Condvar,
    pub(crate) mutex_process_consensus_message: Mutex<()>,
    pub(crate) cv_process_consensus_message: Condvar,
    pub(crate) mutex_schedule_ds_microblock_consensus: Mutex<()>,
    pub(crate) cv_schedule_ds_microblock_consensus: Condvar,
    pub(crate) mutex_schedule_final_block_consensus: Mutex<()>,
    pub(crate) cv_schedule_final_block_consensus: Condvar,
    pub(crate) mutex_cv_missing_microblock: Mutex<()>,
    pub(crate) cv_missing_microblock: Condvar,
    pub(crate) mutex_cv_missing_txn: Mutex<()>,
    pub(crate) cv_missing_txn: Condvar,
    pub(crate) mutex_cv_ds_block_consensus: Mutex<()>,
    pub(crate) cv_ds_block_consensus: Condvar,
    pub(crate) mutex_cv_view_change_ds_block: Mutex<()>,
    pub(crate) cv_view_change_ds_block: Condvar,
    pub(crate) mutex_cv_view_change_final_block: Mutex<()>,
    pub(crate) cv_view_change_final_block: Condvar,
}

impl DirectoryService {
    pub fn new(
        config: NodeConfig,
        self_key: PublicKey,
        self_peer: Peer,
        committee: Committee,
        mode: Mode,
        consensus_my_id: usize,
        deps: DsDependencies,
    ) -> Arc<Self> {
        let guard_mode = config.runtime.guard_mode;
        Arc::new(Self {
            registry: CommitteeRegistry::new(
                self_key,
                self_peer,
                committee,
                mode,
                consensus_my_id,
                guard_mode,
            ),
            chain: ChainState::new(),
            storage: deps.storage,
            transport: deps.transport,
            runner: deps.runner,
            multisig: deps.multisig,
            account_store: deps.account_store,
            data_sender: deps.data_sender,
            shard_node: deps.shard_node,
            upgrade: deps.upgrade,
            config,
            state: Mutex::new(NodeState::PowSubmission),
            sync_type: Mutex::new(SyncType::NoSync),
            consensus_mutex: Mutex::new(()),
            consensus_object: Mutex::new(None),
            pending_ds_block: Mutex::new(None),
            pending_final_block: Mutex::new(None),
            microblock_submission_buffer: Mutex::new(Vec::new()),
            coinbase_rewardees: Mutex::new(HashMap::new()),
            final_block_consensus_buffer: Mutex::new(HashMap::new()),
            state_delta_from_shards: Mutex::new(Vec::new()),
            sw_info: Mutex::new(SwInfo::default()),
            total_txn_fees: Mutex::new(0),
            prepare_run_guard: Mutex::new(()),
            stop_recv_new_mb_submission: AtomicBool::new(false),
            ds_started_microblock_consensus: AtomicBool::new(false),
            view_change_counter: AtomicU32::new(0),
            pow_submission_counter: AtomicU32::new(0),
            mutex_cv_ds_block_consensus_object: Mutex::new(()),
            cv_ds_block_consensus_object: Condvar::new(),
            mutex_cv_final_block_consensus_object: Mutex::new(()),
            cv_final_block_consensus_object: Condvar::new(),
            mutex_process_consensus_message: Mutex::new(()),
            cv_process_consensus_message: Condvar::new(),
            mutex_schedule_ds_microblock_consensus: Mutex::new(()),
            cv_schedule_ds_microblock_consensus: Condvar::new(),
            mutex_schedule_final_block_consensus: Mutex::new(()),
            cv_schedule_final_block_consensus: Condvar::new(),
            mutex_cv_missing_microblock: Mutex::new(()),
            cv_missing_microblock: Condvar::new(),
            mutex_cv_missing_txn: Mutex::new(()),
            cv_missing_txn: Condvar::new(),
            mutex_cv_ds_block_consensus: Mutex::new(()),
            cv_ds_block_consensus: Condvar::new(),
            mutex_cv_view_change_ds_block: Mutex::new(()),
            cv_view_change_ds_block: Condvar::new(),
            mutex_cv_view_change_final_block: Mutex::new(()),
            cv_view_change_final_block: Condvar::new(),
        })
    }

    pub fn state(&self) -> NodeState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: NodeState) {
        let mut guard = self.state.lock();
        debug!(from = %*guard, to = %state, "state transition");
        *guard = state;
    }

    pub fn sync_type(&self) -> SyncType {
        *self.sync_type.lock()
    }

    /// Flip the node into (or out of) rejoin mode. Waiting handlers observe
    /// this at their next predicate check and bail out.
    pub fn set_sync_type(&self, sync_type: SyncType) {
        *self.sync_type.lock() = sync_type;
        self.cv_process_consensus_message.notify_all();
    }

    pub fn is_rejoining(&self) -> bool {
        self.sync_type() != SyncType::NoSync
    }

    pub fn chain(&self) -> &ChainState {
        &self.chain
    }

    pub fn registry(&self) -> &CommitteeRegistry {
        &self.registry
    }

    pub fn consensus_object(&self) -> Option<Arc<dyn ConsensusObject>> {
        self.consensus_object.lock().clone()
    }

    /// Install the consensus object for the round being entered and wake
    /// every handler parked on its construction. When a final-block round
    /// opens, messages buffered for the current consensus id are replayed.
    pub fn set_consensus_object(self: &Arc<Self>, object: Arc<dyn ConsensusObject>) {
        *self.consensus_object.lock() = Some(object);
        {
            let _guard = self.mutex_cv_ds_block_consensus_object.lock();
            self.cv_ds_block_consensus_object.notify_all();
        }
        {
            let _guard = self.mutex_cv_final_block_consensus_object.lock();
            self.cv_final_block_consensus_object.notify_all();
        }
        if self.state() == NodeState::FinalBlockConsensus {
            self.commit_final_block_consensus_buffer();
        }
    }

    /// Stage the DS block the current consensus round is agreeing on; the
    /// post-processor takes ownership of it at DONE.
    pub fn set_pending_ds_block(&self, block: DsBlock) {
        *self.pending_ds_block.lock() = Some(block);
    }

    /// Stage the final block the current consensus round is agreeing on.
    pub fn set_pending_final_block(&self, block: TxBlock) {
        *self.pending_final_block.lock() = Some(block);
    }

    /// Signal that the missing microblocks a final-block round complained
    /// about have been fetched.
    pub fn signal_missing_microblock_fetched(&self) {
        let _guard = self.mutex_cv_missing_microblock.lock();
        self.cv_missing_microblock.notify_all();
    }

    /// Signal that the missing transactions a final-block round complained
    /// about have been fetched.
    pub fn signal_missing_txn_fetched(&self) {
        let _guard = self.mutex_cv_missing_txn.lock();
        self.cv_missing_txn.notify_all();
    }

    /// Schedule a software upgrade to fire once the named DS block is the
    /// chain tail at a vacuous epoch.
    pub fn schedule_upgrade_at(&self, ds_block_num: u64) {
        self.sw_info.lock().upgrade_ds_block_num = Some(ds_block_num);
    }

    pub fn view_change_count(&self) -> u32 {
        self.view_change_counter.load(Ordering::SeqCst)
    }

    /// Called by the PoW subsystem for every accepted submission this DS
    /// epoch; the counter resets when the epoch turns over.
    pub fn note_pow_submission(&self) {
        self.pow_submission_counter.fetch_add(1, Ordering::SeqCst);
    }

    pub fn pow_submissions(&self) -> u32 {
        self.pow_submission_counter.load(Ordering::SeqCst)
    }

    /// The last TX epoch before a new PoW round; its final block flushes
    /// state to disk instead of paying out.
    pub fn is_vacuous_epoch(&self) -> bool {
        let per_pow = self.config.runtime.num_final_block_per_pow;
        if per_pow == 0 {
            return false;
        }
        (self.chain.current_epoch_num() + 1) % per_pow == 0
    }

    /// Record the state delta a shard shipped alongside its microblock;
    /// the buffer is reset when the epoch turns over.
    pub fn record_shard_state_delta(&self, delta: &[u8]) {
        self.state_delta_from_shards.lock().extend_from_slice(delta);
    }

    /// Accept or buffer a microblock submission depending on whether the
    /// collection window is open.
    pub fn handle_microblock_submission(&self, message: Vec<u8>, from: Peer) {
        let open = self.state() == NodeState::MicroblockSubmission
            && !self.stop_recv_new_mb_submission.load(Ordering::SeqCst);
        if open {
            self.shard_node.process_microblock_submission(message, from);
        } else {
            self.microblock_submission_buffer.lock().push((from, message));
            debug!("microblock submission arrived early, buffered");
        }
    }

    /// Drain submissions that arrived before the collection window opened.
    pub fn commit_microblock_submissions(&self) {
        let buffered: Vec<(Peer, Vec<u8>)> =
            self.microblock_submission_buffer.lock().drain(..).collect();
        if !buffered.is_empty() {
            info!(count = buffered.len(), "replaying buffered microblock submissions");
        }
        for (from, message) in buffered {
            self.shard_node.process_microblock_submission(message, from);
        }
    }

    /// Reject timestamps from the future (beyond clock skew) or older than
    /// the allowed window.
    pub fn verify_timestamp(&self, timestamp: u64, window_secs: u64) -> bool {
        let now = now_secs();
        if timestamp > now + CLOCK_SKEW_SECS {
            return false;
        }
        now <= timestamp.saturating_add(window_secs)
    }

    pub(crate) fn wait_timeout(
        &self,
        mutex: &Mutex<()>,
        condvar: &Condvar,
        timeout: Duration,
    ) -> bool {
        let mut guard = mutex.lock();
        condvar.wait_for(&mut guard, timeout).timed_out()
    }

    /// Park until a DS-block consensus message arrives ahead of the state
    /// transition, or the timeout elapses. The state machine uses this to
    /// hurry consensus-object construction. Returns true when signalled.
    pub fn wait_for_early_ds_block_consensus(&self, timeout: Duration) -> bool {
        !self.wait_timeout(
            &self.mutex_cv_ds_block_consensus,
            &self.cv_ds_block_consensus,
            timeout,
        )
    }

    /// Park until the current DS-block round reaches DONE, or the timeout
    /// elapses; the view-change precheck waits here before suspecting the
    /// leader. Returns true when signalled.
    pub fn wait_for_ds_block_done(&self, timeout: Duration) -> bool {
        !self.wait_timeout(
            &self.mutex_cv_view_change_ds_block,
            &self.cv_view_change_ds_block,
            timeout,
        )
    }

    /// Counterpart of [`wait_for_ds_block_done`] for final-block rounds.
    ///
    /// [`wait_for_ds_block_done`]: DirectoryService::wait_for_ds_block_done
    pub fn wait_for_final_block_done(&self, timeout: Duration) -> bool {
        !self.wait_timeout(
            &self.mutex_cv_view_change_final_block,
            &self.cv_view_change_final_block,
            timeout,
        )
    }

    /// Whether a DS-side entry point is being driven on a lookup node, which
    /// never participates in committee duties.
    pub(crate) fn reject_on_lookup(&self, operation: &str) -> bool {
        if self.config.runtime.lookup_node_mode {
            tracing::warn!(operation, "not expected to be called on a lookup node");
            return true;
        }
        false
    }
}

/// Fallible-free wall clock in seconds.
pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
