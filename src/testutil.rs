//! Mock collaborators and a wiring harness shared by the unit tests.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tempfile::TempDir;

use crate::config::{NodeConfig, RuntimeConfig};
use crate::errors::ChainResult;
use crate::interfaces::{
    AccountStore, ConsensusErrorCode, ConsensusObject, ConsensusRunner, ConsensusState,
    DataSender, MultiSigVerifier, ShardNodeHooks, Transport, UpgradeManager,
};
use crate::service::{DirectoryService, DsDependencies};
use crate::storage::Storage;
use crate::types::{
    Committee, CoSignatures, Mode, Peer, PublicKey, ShardTable,
};

pub fn peer(last_octet: u8) -> Peer {
    Peer::new(format!("10.0.0.{last_octet}").parse().expect("ip"), 5000)
}

pub fn member(name: &str, last_octet: u8) -> (PublicKey, Peer) {
    (name.to_string(), peer(last_octet))
}

#[derive(Default)]
pub struct MockTransport {
    pub broadcasts: Mutex<Vec<(Vec<Peer>, Vec<u8>)>>,
    pub unicasts: Mutex<Vec<(Peer, Vec<u8>)>>,
    pub rumors: Mutex<Vec<(Vec<Peer>, Vec<u8>)>>,
    pub rumor_inits: Mutex<Vec<Vec<Peer>>>,
    pub lookup_messages: Mutex<Vec<Vec<u8>>>,
}

impl MockTransport {
    pub fn broadcast_count(&self) -> usize {
        self.broadcasts.lock().len()
    }

    pub fn unicast_count(&self) -> usize {
        self.unicasts.lock().len()
    }

    pub fn lookup_count(&self) -> usize {
        self.lookup_messages.lock().len()
    }
}

impl Transport for MockTransport {
    fn send_broadcast(&self, peers: &[Peer], message: &[u8]) -> ChainResult<()> {
        self.broadcasts.lock().push((peers.to_vec(), message.to_vec()));
        Ok(())
    }

    fn send_unicast(&self, peer: &Peer, message: &[u8]) -> ChainResult<()> {
        self.unicasts.lock().push((*peer, message.to_vec()));
        Ok(())
    }

    fn send_rumor_to_foreign(&self, peers: &[Peer], message: &[u8]) -> ChainResult<()> {
        self.rumors.lock().push((peers.to_vec(), message.to_vec()));
        Ok(())
    }

    fn init_rumor_manager(&self, peers: &[Peer]) -> ChainResult<()> {
        self.rumor_inits.lock().push(peers.to_vec());
        Ok(())
    }

    fn send_to_lookup_nodes(&self, message: &[u8]) -> ChainResult<()> {
        self.lookup_messages.lock().push(message.to_vec());
        Ok(())
    }
}

#[derive(Default)]
pub struct MockRunner {
    pub microblock_runs: AtomicU32,
    pub final_block_runs: Mutex<Vec<bool>>,
    pub prepares: AtomicU32,
    pub new_ds_epochs: AtomicU32,
}

impl MockRunner {
    pub fn final_block_run_count(&self) -> usize {
        self.final_block_runs.lock().len()
    }
}

impl ConsensusRunner for MockRunner {
    fn run_microblock_consensus(&self) {
        self.microblock_runs.fetch_add(1, Ordering::SeqCst);
    }

    fn prepare_final_block_consensus(&self) {
        self.prepares.fetch_add(1, Ordering::SeqCst);
    }

    fn run_final_block_consensus(&self, proceed_without_all_microblocks: bool) {
        self.final_block_runs
            .lock()
            .push(proceed_without_all_microblocks);
    }

    fn start_new_ds_epoch(&self) {
        self.new_ds_epochs.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct MockMultiSig {
    pub accept: AtomicBool,
}

impl Default for MockMultiSig {
    fn default() -> Self {
        Self {
            accept: AtomicBool::new(true),
        }
    }
}

impl MultiSigVerifier for MockMultiSig {
    fn aggregate(&self, pub_keys: &[PublicKey]) -> ChainResult<PublicKey> {
        Ok(pub_keys.join("+"))
    }

    fn verify(&self, _message: &[u8], _signature: &str, _aggregated_key: &PublicKey) -> bool {
        self.accept.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct MockAccountStore {
    pub delta: Mutex<Vec<u8>>,
    pub moved_to_disk: AtomicU32,
    pub temp_inits: AtomicU32,
    pub reversible_inits: AtomicU32,
}

impl AccountStore for MockAccountStore {
    fn serialized_delta(&self) -> ChainResult<Vec<u8>> {
        Ok(self.delta.lock().clone())
    }

    fn move_updates_to_disk(&self) -> ChainResult<()> {
        self.moved_to_disk.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn init_temp(&self) {
        self.temp_inits.fetch_add(1, Ordering::SeqCst);
    }

    fn init_reversibles(&self) {
        self.reversible_inits.fetch_add(1, Ordering::SeqCst);
    }
}

/// Records the dissemination request and exercises both callbacks the way
/// the production sender would.
#[derive(Default)]
pub struct MockDataSender {
    pub sent_hashes: Mutex<Vec<String>>,
    pub composed: Mutex<Vec<Vec<u8>>>,
}

impl DataSender for MockDataSender {
    fn send_data_to_others(
        &self,
        block_hash: [u8; 32],
        _committee: &Committee,
        shards: &ShardTable,
        composer: &(dyn Fn(u32) -> ChainResult<Vec<u8>> + Sync),
        send_to_shards: &(dyn Fn(&ShardTable, usize, usize) -> ChainResult<()> + Sync),
    ) -> ChainResult<()> {
        self.sent_hashes.lock().push(hex::encode(block_hash));
        self.composed.lock().push(composer(0)?);
        if !shards.is_empty() {
            send_to_shards(shards, 0, shards.len() - 1)?;
        }
        Ok(())
    }
}

pub struct MockShardNode {
    pub ds_shard_configs: Mutex<Vec<(usize, bool)>>,
    pub shard_ids: Mutex<Vec<u32>>,
    pub load_sharding_result: AtomicBool,
    pub sharding_loads: AtomicU32,
    pub txn_sharing_loads: AtomicU32,
    pub txn_packet_commits: AtomicU32,
    pub processed_tx_updates: AtomicU32,
    pub final_block_acts: AtomicU32,
    pub has_microblock: AtomicBool,
    pub state_updates: AtomicU32,
    pub first_tx_epochs: AtomicU32,
    pub submissions: AtomicU32,
}

impl Default for MockShardNode {
    fn default() -> Self {
        Self {
            ds_shard_configs: Mutex::new(Vec::new()),
            shard_ids: Mutex::new(Vec::new()),
            load_sharding_result: AtomicBool::new(true),
            sharding_loads: AtomicU32::new(0),
            txn_sharing_loads: AtomicU32::new(0),
            txn_packet_commits: AtomicU32::new(0),
            processed_tx_updates: AtomicU32::new(0),
            final_block_acts: AtomicU32::new(0),
            has_microblock: AtomicBool::new(false),
            state_updates: AtomicU32::new(0),
            first_tx_epochs: AtomicU32::new(0),
            submissions: AtomicU32::new(0),
        }
    }
}

impl MockShardNode {
    pub fn microblock_submissions(&self) -> u32 {
        self.submissions.load(Ordering::SeqCst)
    }

    pub fn last_shard_id(&self) -> Option<u32> {
        self.shard_ids.lock().last().copied()
    }
}

impl ShardNodeHooks for MockShardNode {
    fn configure_ds_shard(&self, members: &Committee, is_primary: bool) {
        self.ds_shard_configs.lock().push((members.len(), is_primary));
    }

    fn set_shard_id(&self, shard_id: u32) {
        self.shard_ids.lock().push(shard_id);
    }

    fn load_sharding_structure(&self) -> bool {
        self.sharding_loads.fetch_add(1, Ordering::SeqCst);
        self.load_sharding_result.load(Ordering::SeqCst)
    }

    fn load_txn_sharing_info(&self) {
        self.txn_sharing_loads.fetch_add(1, Ordering::SeqCst);
    }

    fn commit_txn_packet_buffer(&self) {
        self.txn_packet_commits.fetch_add(1, Ordering::SeqCst);
    }

    fn update_processed_transactions(&self) {
        self.processed_tx_updates.fetch_add(1, Ordering::SeqCst);
    }

    fn act_on_final_block(&self) {
        self.final_block_acts.fetch_add(1, Ordering::SeqCst);
    }

    fn has_local_microblock(&self) -> bool {
        self.has_microblock.load(Ordering::SeqCst)
    }

    fn update_state_for_next_consensus_round(&self) {
        self.state_updates.fetch_add(1, Ordering::SeqCst);
    }

    fn start_first_tx_epoch(&self) {
        self.first_tx_epochs.fetch_add(1, Ordering::SeqCst);
    }

    fn process_microblock_submission(&self, _message: Vec<u8>, _from: Peer) {
        self.submissions.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct MockUpgrade {
    pub replacements: AtomicU32,
}

impl UpgradeManager for MockUpgrade {
    fn replace_node(&self) {
        self.replacements.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct MockConsensusObject {
    pub can: AtomicBool,
    pub process_result: AtomicBool,
    pub state: Mutex<ConsensusState>,
    pub error: Mutex<ConsensusErrorCode>,
    pub id: AtomicU32,
    pub cosigs: Mutex<CoSignatures>,
    pub processed: Mutex<Vec<Vec<u8>>>,
    pub recoveries: AtomicU32,
}

impl Default for MockConsensusObject {
    fn default() -> Self {
        Self {
            can: AtomicBool::new(true),
            process_result: AtomicBool::new(true),
            state: Mutex::new(ConsensusState::InProgress),
            error: Mutex::new(ConsensusErrorCode::Other),
            id: AtomicU32::new(0),
            cosigs: Mutex::new(CoSignatures::default()),
            processed: Mutex::new(Vec::new()),
            recoveries: AtomicU32::new(0),
        }
    }
}

impl MockConsensusObject {
    pub fn set_outcome(&self, state: ConsensusState) {
        *self.state.lock() = state;
    }

    pub fn set_error(&self, code: ConsensusErrorCode) {
        *self.state.lock() = ConsensusState::Error;
        *self.error.lock() = code;
    }

    pub fn processed_count(&self) -> usize {
        self.processed.lock().len()
    }
}

impl ConsensusObject for MockConsensusObject {
    fn process(&self, message: &[u8], _offset: usize, _from: &Peer) -> bool {
        self.processed.lock().push(message.to_vec());
        self.process_result.load(Ordering::SeqCst)
    }

    fn can_process(&self, _message: &[u8], _offset: usize) -> bool {
        self.can.load(Ordering::SeqCst)
    }

    fn consensus_id(&self, _message: &[u8], _offset: usize) -> ChainResult<u32> {
        Ok(self.id.load(Ordering::SeqCst))
    }

    fn state(&self) -> ConsensusState {
        *self.state.lock()
    }

    fn error_code(&self) -> ConsensusErrorCode {
        *self.error.lock()
    }

    fn co_signatures(&self) -> CoSignatures {
        self.cosigs.lock().clone()
    }

    fn recover_to_initial(&self) {
        self.recoveries.fetch_add(1, Ordering::SeqCst);
        *self.state.lock() = ConsensusState::Initial;
    }
}

pub struct HarnessOptions {
    pub committee: Vec<&'static str>,
    pub self_name: &'static str,
    pub my_id: usize,
    pub mode: Mode,
    pub comm_size: usize,
    pub tx_sharing_cluster_size: usize,
    pub ds_multicast_cluster_size: usize,
    pub num_final_block_per_pow: u64,
    pub guard_mode: bool,
    pub broadcast_gossip_mode: bool,
    pub microblock_timeout_secs: u64,
    pub fetching_missing_data_timeout_secs: u64,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            committee: vec!["A", "B", "C", "D"],
            self_name: "A",
            my_id: 0,
            mode: Mode::BackupDs,
            comm_size: 8,
            tx_sharing_cluster_size: 20,
            ds_multicast_cluster_size: 10,
            num_final_block_per_pow: 100,
            guard_mode: false,
            broadcast_gossip_mode: false,
            // long enough that watchdogs never fire inside a test
            microblock_timeout_secs: 3600,
            fetching_missing_data_timeout_secs: 1,
        }
    }
}

pub struct Harness {
    pub service: Arc<DirectoryService>,
    pub transport: Arc<MockTransport>,
    pub runner: Arc<MockRunner>,
    pub multisig: Arc<MockMultiSig>,
    pub account_store: Arc<MockAccountStore>,
    pub data_sender: Arc<MockDataSender>,
    pub shard_node: Arc<MockShardNode>,
    pub upgrade: Arc<MockUpgrade>,
    pub consensus: Arc<MockConsensusObject>,
    _data_dir: TempDir,
}

impl Harness {
    pub fn install_consensus(&self) {
        self.service
            .set_consensus_object(self.consensus.clone() as Arc<dyn ConsensusObject>);
    }
}

pub fn harness(options: HarnessOptions) -> Harness {
    let data_dir = TempDir::new().expect("tempdir");
    let runtime = RuntimeConfig {
        comm_size: options.comm_size,
        tx_sharing_cluster_size: options.tx_sharing_cluster_size,
        ds_multicast_cluster_size: options.ds_multicast_cluster_size,
        num_final_block_per_pow: options.num_final_block_per_pow,
        guard_mode: options.guard_mode,
        broadcast_gossip_mode: options.broadcast_gossip_mode,
        microblock_timeout_secs: options.microblock_timeout_secs,
        ds_microblock_consensus_object_timeout_secs: options.microblock_timeout_secs,
        consensus_object_timeout_secs: 1,
        consensus_msg_order_block_window_secs: 1,
        fetching_missing_data_timeout_secs: options.fetching_missing_data_timeout_secs,
        ..RuntimeConfig::default()
    };
    let config = NodeConfig {
        data_dir: data_dir.path().to_path_buf(),
        key_path: data_dir.path().join("node.toml"),
        runtime,
    };

    let committee: Committee = options
        .committee
        .iter()
        .enumerate()
        .map(|(index, name)| member(name, 10 + index as u8))
        .collect();
    let self_peer = committee
        .iter()
        .find(|(key, _)| key == options.self_name)
        .map(|(_, peer)| *peer)
        .unwrap_or_else(|| peer(99));

    let storage = Arc::new(Storage::open(&data_dir.path().join("db")).expect("storage"));
    let transport = Arc::new(MockTransport::default());
    let runner = Arc::new(MockRunner::default());
    let multisig = Arc::new(MockMultiSig::default());
    let account_store = Arc::new(MockAccountStore::default());
    let data_sender = Arc::new(MockDataSender::default());
    let shard_node = Arc::new(MockShardNode::default());
    let upgrade = Arc::new(MockUpgrade::default());
    let consensus = Arc::new(MockConsensusObject::default());

    let service = DirectoryService::new(
        config,
        options.self_name.to_string(),
        self_peer,
        committee,
        options.mode,
        options.my_id,
        DsDependencies {
            storage,
            transport: transport.clone(),
            runner: runner.clone(),
            multisig: multisig.clone(),
            account_store: account_store.clone(),
            data_sender: data_sender.clone(),
            shard_node: shard_node.clone(),
            upgrade: upgrade.clone(),
        },
    );

    Harness {
        service,
        transport,
        runner,
        multisig,
        account_store,
        data_sender,
        shard_node,
        upgrade,
        consensus,
        _data_dir: data_dir,
    }
}
