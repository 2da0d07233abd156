use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::errors::{ChainError, ChainResult};
use crate::types::{committee_hash, Committee, Mode, Peer, PublicKey, ShardTable};

/// Sharding structure built during DS-block consensus. Backups accumulate it
/// here and swap it in atomically on DONE; the primary writes the live slots
/// directly.
#[derive(Clone, Debug, Default)]
pub struct ShardingStructure {
    pub shards: ShardTable,
    pub pub_key_to_shard_id: HashMap<PublicKey, u32>,
    pub node_reputation: HashMap<PublicKey, u32>,
    pub ds_receivers: Vec<Peer>,
    pub shard_receivers: Vec<Vec<Peer>>,
    pub shard_senders: Vec<Vec<Peer>>,
}

#[derive(Debug)]
struct RegistryInner {
    committee: Committee,
    sharding: ShardingStructure,
    shadow_sharding: Option<ShardingStructure>,
    mode: Mode,
    consensus_my_id: usize,
    consensus_leader_id: usize,
    self_key: PublicKey,
    self_peer: Peer,
}

/// Ordered DS committee plus the sharding structure of the current epoch and
/// this node's position within both. All mutation goes through this type
/// under its own mutex; PoW connections live under a separate leaf mutex.
pub struct CommitteeRegistry {
    guard_mode: bool,
    inner: Mutex<RegistryInner>,
    pow_connections: Mutex<HashMap<PublicKey, Peer>>,
    pow_solutions: Mutex<HashMap<PublicKey, u64>>,
}

impl CommitteeRegistry {
    pub fn new(
        self_key: PublicKey,
        self_peer: Peer,
        committee: Committee,
        mode: Mode,
        consensus_my_id: usize,
        guard_mode: bool,
    ) -> Self {
        Self {
            guard_mode,
            inner: Mutex::new(RegistryInner {
                committee,
                sharding: ShardingStructure::default(),
                shadow_sharding: None,
                mode,
                consensus_my_id,
                consensus_leader_id: 0,
                self_key,
                self_peer,
            }),
            pow_connections: Mutex::new(HashMap::new()),
            pow_solutions: Mutex::new(HashMap::new()),
        }
    }

    pub fn committee(&self) -> Committee {
        self.inner.lock().committee.clone()
    }

    pub fn committee_size(&self) -> usize {
        self.inner.lock().committee.len()
    }

    pub fn committee_hash(&self) -> String {
        committee_hash(&self.inner.lock().committee)
    }

    pub fn shards(&self) -> ShardTable {
        self.inner.lock().sharding.shards.clone()
    }

    pub fn shard_count(&self) -> usize {
        self.inner.lock().sharding.shards.len()
    }

    pub fn sharding(&self) -> ShardingStructure {
        self.inner.lock().sharding.clone()
    }

    pub fn shard_id_for(&self, pub_key: &PublicKey) -> Option<u32> {
        self.inner
            .lock()
            .sharding
            .pub_key_to_shard_id
            .get(pub_key)
            .copied()
    }

    pub fn mode(&self) -> Mode {
        self.inner.lock().mode
    }

    pub fn set_mode(&self, mode: Mode) {
        self.inner.lock().mode = mode;
    }

    pub fn consensus_my_id(&self) -> usize {
        self.inner.lock().consensus_my_id
    }

    pub fn consensus_leader_id(&self) -> usize {
        self.inner.lock().consensus_leader_id
    }

    pub fn self_key(&self) -> PublicKey {
        self.inner.lock().self_key.clone()
    }

    pub fn self_peer(&self) -> Peer {
        self.inner.lock().self_peer
    }

    /// Member the recomputed leader index points at.
    pub fn leader(&self) -> Option<(PublicKey, Peer)> {
        let inner = self.inner.lock();
        inner.committee.get(inner.consensus_leader_id).cloned()
    }

    pub fn is_self_leader(&self) -> bool {
        let inner = self.inner.lock();
        inner
            .committee
            .get(inner.consensus_leader_id)
            .map(|(key, _)| *key == inner.self_key)
            .unwrap_or(false)
    }

    /// Install the sharding structure directly (primary path: the leader
    /// builds the live structure while composing the DS block).
    pub fn set_sharding(&self, sharding: ShardingStructure) {
        self.inner.lock().sharding = sharding;
    }

    /// Stage the sharding structure announced during DS-block consensus
    /// (backup path); it goes live via [`swap_in_shadow_sharding`].
    ///
    /// [`swap_in_shadow_sharding`]: CommitteeRegistry::swap_in_shadow_sharding
    pub fn set_shadow_sharding(&self, sharding: ShardingStructure) {
        self.inner.lock().shadow_sharding = Some(sharding);
    }

    /// Atomically promote the staged sharding structure. No-op when nothing
    /// was staged.
    pub fn swap_in_shadow_sharding(&self) {
        let mut inner = self.inner.lock();
        if let Some(shadow) = inner.shadow_sharding.take() {
            inner.sharding = shadow;
        } else {
            warn!("no staged sharding structure to swap in");
        }
    }

    pub fn insert_pow_connection(&self, pub_key: PublicKey, peer: Peer) {
        self.pow_connections.lock().insert(pub_key, peer);
    }

    pub fn pow_connection(&self, pub_key: &PublicKey) -> Option<Peer> {
        self.pow_connections.lock().get(pub_key).copied()
    }

    pub fn pow_connection_count(&self) -> usize {
        self.pow_connections.lock().len()
    }

    pub fn clear_pow_connections(&self) {
        self.pow_connections.lock().clear();
    }

    pub fn insert_pow_solution(&self, pub_key: PublicKey, nonce: u64) {
        self.pow_solutions.lock().insert(pub_key, nonce);
    }

    pub fn pow_solution_count(&self) -> usize {
        self.pow_solutions.lock().len()
    }

    pub fn clear_pow_solutions(&self) {
        self.pow_solutions.lock().clear();
    }

    /// Rotate the committee for a freshly committed DS block: the PoW winner
    /// enters at the head, the oldest backup leaves at the tail, and the
    /// winner no longer needs a PoW connection.
    pub fn rotate_for_new_ds_block(&self, winner_key: PublicKey, winner_peer: Peer) {
        {
            let mut inner = self.inner.lock();
            inner.committee.push_front((winner_key.clone(), winner_peer));
            inner.committee.pop_back();
        }
        self.pow_connections.lock().remove(&winner_key);
    }

    /// Recompute this node's mode and committee index ahead of the rotation.
    ///
    /// `last_tx_hash16` selects the next leader: index 0 means the incoming
    /// PoW winner leads, any other index `i` promotes the member currently at
    /// `i - 1` (who sits at `i` once the rotation shifts everyone down).
    /// The oldest backup drops to [`Mode::Idle`] instead and must rejoin as a
    /// shard node.
    pub fn update_self_mode_and_id(&self, last_tx_hash16: u16) -> Mode {
        let mut inner = self.inner.lock();
        let size = inner.committee.len();
        if size == 0 {
            warn!("committee is empty, cannot update self mode");
            return inner.mode;
        }

        if inner.consensus_my_id + 1 == size {
            info!("oldest backup: leaving the DS committee for a shard");
            inner.mode = Mode::Idle;
            return Mode::Idle;
        }

        let leader_id = (last_tx_hash16 as usize) % size;
        inner.consensus_leader_id = leader_id;
        info!(
            selector = last_tx_hash16,
            leader_id, "recomputed consensus leader index"
        );

        if leader_id > 0
            && inner
                .committee
                .get(leader_id - 1)
                .map(|(key, _)| *key == inner.self_key)
                .unwrap_or(false)
        {
            inner.mode = Mode::PrimaryDs;
        } else {
            inner.mode = Mode::BackupDs;
        }
        inner.consensus_my_id += 1;
        inner.mode
    }

    /// Park every faulty leader named by a view-change block at the
    /// committee tail, preserving the relative order of everyone else. A
    /// member the block names but the committee does not hold means this
    /// node's committee view has diverged, which is fatal.
    pub fn reorder_for_vc(&self, faulty_leaders: &[(PublicKey, Peer)]) -> ChainResult<()> {
        if self.guard_mode {
            info!("guard mode: committee composition left unchanged");
            return Ok(());
        }

        let mut inner = self.inner.lock();
        for faulty in faulty_leaders {
            let position = inner
                .committee
                .iter()
                .position(|member| member == faulty)
                .ok_or_else(|| {
                    ChainError::CommitteeDesync(format!(
                        "faulty leader {} not found in committee",
                        faulty.0
                    ))
                })?;
            inner.committee.remove(position);
            inner.committee.push_back(faulty.clone());
        }
        Ok(())
    }

    /// Like [`reorder_for_vc`] but matching on public key only; used when a
    /// recovered committee carries stale peer addresses.
    ///
    /// [`reorder_for_vc`]: CommitteeRegistry::reorder_for_vc
    pub fn reorder_for_vc_by_pub_key(
        &self,
        faulty_leaders: &[(PublicKey, Peer)],
    ) -> ChainResult<()> {
        if self.guard_mode {
            info!("guard mode: committee composition left unchanged");
            return Ok(());
        }

        let mut inner = self.inner.lock();
        for faulty in faulty_leaders {
            let position = inner
                .committee
                .iter()
                .position(|(key, _)| *key == faulty.0)
                .ok_or_else(|| {
                    ChainError::CommitteeDesync(format!(
                        "faulty leader {} not found in committee",
                        faulty.0
                    ))
                })?;
            inner.committee.remove(position);
            inner.committee.push_back(faulty.clone());
        }
        Ok(())
    }

    /// Linear scan for this node in the current shard table; the demoted
    /// oldest backup uses this to find its new home.
    pub fn locate_self_in_shards(&self) -> Option<u32> {
        let inner = self.inner.lock();
        for (shard_id, shard) in inner.sharding.shards.iter().enumerate() {
            if shard.iter().any(|member| member.pub_key == inner.self_key) {
                return Some(shard_id as u32);
            }
        }
        None
    }
}
