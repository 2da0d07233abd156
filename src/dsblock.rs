use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use tracing::{info, warn};

use crate::crypto::hash16;
use crate::errors::{ChainError, ChainResult};
use crate::messages::{compose_ds_block, DsBlockAnnouncement};
use crate::multicast::multicast_plan;
use crate::service::DirectoryService;
use crate::types::{DsBlock, Mode, NodeState, Peer};

impl DirectoryService {
    /// Commit the pending DS block to the in-memory chain and durable
    /// storage, and publish the latest-active marker. A block number ahead
    /// of the tail is persisted anyway; the gap is a recovery signal for
    /// the catch-up machinery, not a reason to drop the block.
    fn store_ds_block_to_storage(&self) -> ChainResult<DsBlock> {
        if self.reject_on_lookup("store_ds_block_to_storage") {
            return Err(ChainError::Config("lookup node stores no DS blocks".into()));
        }

        let block = {
            let mut pending = self.pending_ds_block.lock();
            pending
                .take()
                .ok_or_else(|| ChainError::Consensus("no pending DS block to store".into()))?
        };

        if let Err(err) = self.chain.append_ds(block.clone()) {
            warn!(%err, "failed to append DS block to the chain");
        }
        info!(
            block_num = block.header.block_num,
            nonce = block.header.nonce,
            ds_difficulty = block.header.ds_difficulty,
            difficulty = block.header.difficulty,
            timestamp = block.header.timestamp,
            "storing DS block"
        );

        self.storage.put_ds_block(&block)?;
        self.chain
            .set_latest_active_ds_block_num(block.header.block_num);
        self.storage.put_metadata(
            crate::storage::MetaKey::LatestActiveDsBlockNum,
            block.header.block_num.to_string().as_bytes(),
        )?;
        Ok(block)
    }

    fn ds_block_announcement(&self, shard_id: u32, block: &DsBlock, winner_peer: Peer) -> DsBlockAnnouncement {
        let sharding = self.registry.sharding();
        DsBlockAnnouncement {
            shard_id,
            ds_block: block.clone(),
            winner_peer,
            shards: sharding.shards,
            ds_receivers: sharding.ds_receivers,
            shard_receivers: sharding.shard_receivers,
            shard_senders: sharding.shard_senders,
        }
    }

    fn send_ds_block_to_lookup_nodes(&self, block: &DsBlock, winner_peer: Peer) -> ChainResult<()> {
        let message = compose_ds_block(&self.ds_block_announcement(0, block, winner_peer))?;
        self.transport.send_to_lookup_nodes(&message)?;
        info!("sent the DS block to the lookup nodes");
        Ok(())
    }

    fn send_ds_block_to_new_leader(&self, block: &DsBlock, winner_peer: Peer) -> ChainResult<()> {
        let message = compose_ds_block(&self.ds_block_announcement(0, block, winner_peer))?;
        self.transport.send_unicast(&winner_peer, &message)?;
        info!(winner = %winner_peer, "sent the DS block to the new DS leader");
        Ok(())
    }

    fn send_ds_block_to_shard_nodes(
        &self,
        block: &DsBlock,
        winner_peer: Peer,
        shards_lo: usize,
        shards_hi: usize,
    ) -> ChainResult<()> {
        let runtime = &self.config.runtime;
        let shards = self.registry.shards();
        for shard in shards
            .iter()
            .skip(shards_lo)
            .take(shards_hi.saturating_sub(shards_lo) + 1)
        {
            let Some(leader) = shard.first() else {
                warn!("skipping empty shard during DS block dissemination");
                continue;
            };
            let shard_id = self
                .registry
                .shard_id_for(&leader.pub_key)
                .ok_or_else(|| {
                    ChainError::Consensus(format!(
                        "shard leader {} missing from the shard-id map",
                        leader.pub_key
                    ))
                })?;
            let message = compose_ds_block(&self.ds_block_announcement(shard_id, block, winner_peer))?;

            let peers: Vec<Peer> = shard.iter().map(|member| member.peer).collect();
            if runtime.broadcast_gossip_mode {
                let receivers: Vec<Peer> = peers
                    .iter()
                    .copied()
                    .take(runtime.num_dsblock_gossip_receivers_per_shard)
                    .collect();
                self.transport.send_rumor_to_foreign(&receivers, &message)?;
            } else {
                self.transport.send_broadcast(&peers, &message)?;
            }
        }
        Ok(())
    }

    /// Selector for the next leader: the low 16 bits of the TX chain tail's
    /// hash, zero until the chain has produced its first TX block.
    fn last_tx_block_hash16(&self) -> u16 {
        if self.chain.current_epoch_num() <= 1 {
            return 0;
        }
        self.chain
            .tail_tx()
            .map(|block| hash16(&block.selector_bytes()))
            .unwrap_or(0)
    }

    /// DS-block consensus reported DONE: commit, rotate, disseminate, and
    /// move into the first TX epoch of the new DS epoch.
    pub fn process_ds_block_consensus_when_done(self: &Arc<Self>) -> ChainResult<()> {
        if self.reject_on_lookup("process_ds_block_consensus_when_done") {
            return Ok(());
        }
        info!(
            epoch = self.chain.current_epoch_num(),
            "DS block consensus is DONE"
        );

        {
            let mut pending = self.pending_ds_block.lock();
            let block = pending
                .as_mut()
                .ok_or_else(|| ChainError::Consensus("no pending DS block".into()))?;
            if let Some(consensus) = self.consensus_object() {
                block.set_co_signatures(consensus.co_signatures());
            }

            let expected = self.chain.tail_ds_block_num() + 1;
            if block.header.block_num > expected {
                warn!(
                    pending = block.header.block_num,
                    expected, "missing DS blocks between the tail and the pending block"
                );
            } else if block.header.block_num < expected {
                warn!(
                    pending = block.header.block_num,
                    expected, "pending DS block is already part of the chain"
                );
                return Err(ChainError::ChainGap {
                    expected,
                    received: block.header.block_num,
                });
            }
        }

        self.coinbase_rewardees.lock().clear();

        let block = self.store_ds_block_to_storage()?;
        self.chain.update_ds_block_rand(block.block_hash());

        let winner_key = block.header.miner_pub_key.clone();
        let winner_peer = self.registry.pow_connection(&winner_key).ok_or_else(|| {
            ChainError::Consensus(format!("no PoW connection for the DS winner {winner_key}"))
        })?;

        if self.registry.mode() == Mode::BackupDs {
            self.registry.swap_in_shadow_sharding();
        }

        let runtime = &self.config.runtime;
        let my_id = self.registry.consensus_my_id();
        let cohort_lo = runtime.comm_size / 4;
        let cohort_hi = cohort_lo + runtime.tx_sharing_cluster_size;
        if cohort_lo < my_id && my_id < cohort_hi {
            info!("member of the cohort forwarding the DS block outward");
            self.send_ds_block_to_lookup_nodes(&block, winner_peer)?;
            // The new leader is not in the shard table, so the same cohort
            // reaches it by unicast.
            self.send_ds_block_to_new_leader(&block, winner_peer)?;
        }

        info!(
            nonce = block.header.nonce,
            rand = %hex::encode(self.chain.ds_block_rand()),
            winner = %winner_peer,
            "new DS block accepted"
        );

        if let Some(plan) = multicast_plan(
            self.registry.committee_size(),
            self.registry.shard_count(),
            my_id,
            runtime.ds_multicast_cluster_size,
        ) {
            info!(
                cluster = plan.cluster,
                shards_lo = plan.shards_lo,
                shards_hi = plan.shards_hi,
                "multicasting the DS block to the assigned shards"
            );
            self.send_ds_block_to_shard_nodes(&block, winner_peer, plan.shards_lo, plan.shards_hi)?;
        }

        let selector = self.last_tx_block_hash16();
        self.registry.update_self_mode_and_id(selector);
        self.registry.rotate_for_new_ds_block(winner_key, winner_peer);

        match self.registry.leader() {
            Some((key, _)) if key == self.registry.self_key() => {
                info!(
                    leader_id = self.registry.consensus_leader_id(),
                    "this node leads the next consensus round"
                );
            }
            Some((_, peer)) => {
                info!(
                    leader_id = self.registry.consensus_leader_id(),
                    leader = %peer,
                    "next consensus round leader resolved"
                );
            }
            None => warn!("committee is empty after rotation"),
        }

        self.start_first_tx_epoch();
        Ok(())
    }

    /// Reset the per-DS-epoch buffers and enter the first TX epoch, either
    /// as a committee member collecting microblocks or as a freshly demoted
    /// shard node.
    pub fn start_first_tx_epoch(self: &Arc<Self>) {
        if self.reject_on_lookup("start_first_tx_epoch") {
            return;
        }

        self.registry.clear_pow_solutions();
        self.pow_submission_counter.store(0, Ordering::SeqCst);
        self.view_change_counter.store(0, Ordering::SeqCst);
        self.microblock_submission_buffer.lock().clear();
        self.state_delta_from_shards.lock().clear();

        if self.registry.mode().is_ds() {
            let committee = self.registry.committee();
            let is_primary = committee
                .front()
                .map(|(key, _)| *key == self.registry.self_key())
                .unwrap_or(false);
            if is_primary {
                info!("leading the DS sharded committee");
            } else {
                info!("backup member of the DS sharded committee");
            }
            self.shard_node.configure_ds_shard(&committee, is_primary);
            // Sentinel shard id: one past the real shards marks "DS".
            self.shard_node
                .set_shard_id(self.registry.shard_count() as u32);
            self.shard_node.commit_txn_packet_buffer();

            if self.config.runtime.test_net_mode {
                info!("test net mode: refreshing the shard whitelist");
                self.shard_node.refresh_shard_whitelist();
            }

            if self.config.runtime.broadcast_gossip_mode {
                let peers: Vec<Peer> = committee
                    .iter()
                    .map(|(_, peer)| *peer)
                    .filter(|peer| peer.port != 0)
                    .collect();
                if let Err(err) = self.transport.init_rumor_manager(&peers) {
                    warn!(%err, "failed to reinitialize the rumor manager");
                }
            }

            self.set_state(NodeState::MicroblockSubmission);
            self.ds_started_microblock_consensus
                .store(false, Ordering::SeqCst);
            self.stop_recv_new_mb_submission.store(false, Ordering::SeqCst);

            let service = Arc::clone(self);
            thread::spawn(move || service.microblock_collection_watchdog());
        } else {
            let Some(shard_id) = self.registry.locate_self_in_shards() else {
                warn!("demoted DS node is absent from every new shard");
                return;
            };
            self.shard_node.set_shard_id(shard_id);
            if !self.shard_node.load_sharding_structure() {
                return;
            }
            self.shard_node.load_txn_sharing_info();

            if self.config.runtime.broadcast_gossip_mode {
                let shards = self.registry.shards();
                let peers: Vec<Peer> = shards
                    .get(shard_id as usize)
                    .map(|shard| {
                        shard
                            .iter()
                            .map(|member| member.peer)
                            .filter(|peer| peer.port != 0)
                            .collect()
                    })
                    .unwrap_or_default();
                if let Err(err) = self.transport.init_rumor_manager(&peers) {
                    warn!(%err, "failed to reinitialize the rumor manager");
                }
            }

            self.shard_node.start_first_tx_epoch();
        }
    }

    /// Detached watchdog for the first TX epoch: if microblocks do not all
    /// arrive in time, run the DS microblock consensus without them, and if
    /// that in turn stalls, push on to final-block consensus.
    fn microblock_collection_watchdog(self: Arc<Self>) {
        let runtime = &self.config.runtime;
        let timed_out = self.wait_timeout(
            &self.mutex_schedule_ds_microblock_consensus,
            &self.cv_schedule_ds_microblock_consensus,
            runtime.microblock_timeout(),
        );
        if !timed_out || self.is_rejoining() {
            return;
        }
        warn!("timed out collecting microblocks, proceeding without the stragglers");

        self.ds_started_microblock_consensus
            .store(true, Ordering::SeqCst);
        let runner = Arc::clone(&self.runner);
        thread::spawn(move || runner.run_microblock_consensus());

        let timed_out = self.wait_timeout(
            &self.mutex_schedule_final_block_consensus,
            &self.cv_schedule_final_block_consensus,
            runtime.ds_microblock_consensus_object_timeout(),
        );
        if !timed_out || self.is_rejoining() {
            return;
        }
        warn!("DS microblock consensus stalled, running final block consensus without it");
        self.runner.run_final_block_consensus(true);
    }
}
