use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use tracing::{info, warn};

use crate::errors::{ChainError, ChainResult};
use crate::messages::{compose_final_block, FinalBlockAnnouncement};
use crate::service::DirectoryService;
use crate::storage::MetaKey;
use crate::types::{NodeState, Peer, ShardTable, TxBlock};

impl DirectoryService {
    /// Commit the pending final block: append to the TX chain, persist the
    /// block and its state delta, and advance the epoch. The epoch counter
    /// moves only after the block has reached durable storage.
    fn store_final_block_to_disk(&self) -> ChainResult<(TxBlock, Vec<u8>)> {
        if self.reject_on_lookup("store_final_block_to_disk") {
            return Err(ChainError::Config("lookup node stores no final blocks".into()));
        }

        let block = {
            let mut pending = self.pending_final_block.lock();
            pending
                .take()
                .ok_or_else(|| ChainError::Consensus("no pending final block to store".into()))?
        };

        if let Err(err) = self.chain.append_tx(block.clone()) {
            warn!(%err, "failed to append final block to the TX chain");
        }
        info!(
            block_num = block.header.block_num,
            block_type = block.header.block_type,
            version = block.header.version,
            timestamp = block.header.timestamp,
            num_txs = block.header.num_txs,
            "storing final block"
        );

        self.storage.put_tx_block(&block)?;
        self.chain.increase_epoch();

        let state_delta = self.account_store.serialized_delta()?;
        self.storage
            .put_state_delta(block.header.block_num, &state_delta)?;
        Ok((block, state_delta))
    }

    /// Record every committee member whose bit is set in either co-signature
    /// bitmap as a rewardee of this epoch.
    fn save_coinbase(&self, block: &TxBlock) {
        let committee = self.registry.committee();
        let epoch = self.chain.current_epoch_num();
        let mut rewardees = self.coinbase_rewardees.lock();
        let entry = rewardees.entry(epoch).or_default();
        for bitmap in [&block.cosigs.b1, &block.cosigs.b2] {
            if bitmap.len() != committee.len() {
                warn!(
                    bitmap = bitmap.len(),
                    committee = committee.len(),
                    "co-signature bitmap does not cover the committee, skipping rewards"
                );
                continue;
            }
            for (member, signed) in committee.iter().zip(bitmap.iter()) {
                if *signed {
                    entry.push(member.0.clone());
                }
            }
        }
    }

    fn compose_final_block_message(
        &self,
        shard_id: u32,
        block: &TxBlock,
        state_delta: &[u8],
    ) -> ChainResult<Vec<u8>> {
        compose_final_block(&FinalBlockAnnouncement {
            shard_id,
            ds_block_num: self.chain.tail_ds_block_num(),
            consensus_id: self.chain.consensus_id(),
            tx_block: block.clone(),
            state_delta: state_delta.to_vec(),
        })
    }

    fn send_final_block_to_shard_nodes(
        &self,
        block: &TxBlock,
        state_delta: &[u8],
        shards: &ShardTable,
        shards_lo: usize,
        shards_hi: usize,
    ) -> ChainResult<()> {
        let runtime = &self.config.runtime;
        for shard in shards
            .iter()
            .skip(shards_lo)
            .take(shards_hi.saturating_sub(shards_lo) + 1)
        {
            let Some(leader) = shard.first() else {
                warn!("skipping empty shard during final block dissemination");
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
            let message = self.compose_final_block_message(shard_id, block, state_delta)?;

            if runtime.broadcast_gossip_mode {
                let receivers: Vec<Peer> = shard
                    .iter()
                    .map(|member| member.peer)
                    .take(runtime.num_gossip_receivers)
                    .collect();
                self.transport.send_rumor_to_foreign(&receivers, &message)?;
            } else {
                let peers: Vec<Peer> = shard.iter().map(|member| member.peer).collect();
                self.transport.send_broadcast(&peers, &message)?;
            }
        }
        Ok(())
    }

    /// Final-block consensus reported DONE: commit the block, settle the
    /// epoch's rewards or flush state on a vacuous epoch, disseminate, and
    /// dispatch the next phase on a detached thread.
    pub fn process_final_block_consensus_when_done(self: &Arc<Self>) -> ChainResult<()> {
        if self.reject_on_lookup("process_final_block_consensus_when_done") {
            return Ok(());
        }
        info!(
            epoch = self.chain.current_epoch_num(),
            "final block consensus is DONE"
        );

        {
            let mut pending = self.pending_final_block.lock();
            let block = pending
                .as_mut()
                .ok_or_else(|| ChainError::Consensus("no pending final block".into()))?;
            if let Some(consensus) = self.consensus_object() {
                block.set_co_signatures(consensus.co_signatures());
            }
        }

        let is_vacuous = self.is_vacuous_epoch();
        let (block, state_delta) = self.store_final_block_to_disk()?;

        if is_vacuous {
            self.account_store.move_updates_to_disk()?;
            self.storage.put_metadata(MetaKey::DsIncompleted, b"0")?;
        } else {
            self.save_coinbase(&block);
            let mut fees = self.total_txn_fees.lock();
            *fees = fees.saturating_add(block.header.rewards);
        }

        if let Some(ds_tail) = self.chain.tail_ds() {
            self.chain.update_ds_block_rand(ds_tail.block_hash());
        }
        self.chain.update_tx_block_rand(block.block_hash());

        if self.shard_node.has_local_microblock() && !is_vacuous {
            self.shard_node.update_processed_transactions();
            self.shard_node.act_on_final_block();
        }

        let committee = self.registry.committee();
        let shards = self.registry.shards();
        let composer = |shard_id: u32| self.compose_final_block_message(shard_id, &block, &state_delta);
        let send_to_shards = |shards: &ShardTable, lo: usize, hi: usize| {
            self.send_final_block_to_shard_nodes(&block, &state_delta, shards, lo, hi)
        };
        self.data_sender.send_data_to_others(
            block.block_hash(),
            &committee,
            &shards,
            &composer,
            &send_to_shards,
        )?;

        {
            let sw_info = self.sw_info.lock();
            if let Some(upgrade_at) = sw_info.upgrade_ds_block_num {
                if is_vacuous && upgrade_at.saturating_sub(1) == self.chain.tail_ds_block_num() {
                    info!(upgrade_at, "scheduled software upgrade is due");
                    let upgrade = Arc::clone(&self.upgrade);
                    thread::spawn(move || upgrade.replace_node());
                }
            }
        }

        self.account_store.init_temp();
        self.account_store.init_reversibles();
        self.state_delta_from_shards.lock().clear();
        self.registry.clear_pow_connections();
        self.registry.clear_pow_solutions();
        self.pow_submission_counter.store(0, Ordering::SeqCst);

        let service = Arc::clone(self);
        thread::spawn(move || service.start_next_tx_epoch(is_vacuous));
        Ok(())
    }

    /// Detached continuation after a final-block commit: either kick off a
    /// new DS epoch (vacuous) or open the next microblock collection window
    /// with its timeout.
    fn start_next_tx_epoch(self: Arc<Self>, is_vacuous: bool) {
        info!(
            epoch = self.chain.current_epoch_num(),
            "start of a new epoch"
        );
        if is_vacuous {
            info!("PoW needed, starting a new DS epoch");
            if let Err(err) = self.storage.put_metadata(MetaKey::DsIncompleted, b"1") {
                warn!(%err, "failed to flag the new DS epoch as incomplete");
            }
            self.set_state(NodeState::PowSubmission);
            self.runner.start_new_ds_epoch();
            return;
        }

        self.shard_node.update_state_for_next_consensus_round();
        self.set_state(NodeState::MicroblockSubmission);
        self.stop_recv_new_mb_submission.store(false, Ordering::SeqCst);
        info!("no PoW needed, waiting for microblocks");

        let shard_node = Arc::clone(&self.shard_node);
        thread::spawn(move || shard_node.commit_txn_packet_buffer());
        self.commit_microblock_submissions();

        let timed_out = self.wait_timeout(
            &self.mutex_schedule_ds_microblock_consensus,
            &self.cv_schedule_ds_microblock_consensus,
            self.config.runtime.microblock_timeout(),
        );
        if !timed_out || self.is_rejoining() {
            return;
        }
        warn!("timed out collecting microblocks, sealing the epoch without them");
        self.stop_recv_new_mb_submission.store(true, Ordering::SeqCst);
        self.runner.run_final_block_consensus(false);
    }
}
