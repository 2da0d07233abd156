use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use tracing::{info, warn};

use crate::errors::{ChainError, ChainResult};
use crate::interfaces::{ConsensusErrorCode, ConsensusState};
use crate::messages::MESSAGE_BODY_OFFSET;
use crate::service::DirectoryService;
use crate::types::{Mode, NodeState, Peer};

/// Which consensus stream an inbound message belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsensusMsgKind {
    DsBlock,
    FinalBlock,
}

impl DirectoryService {
    /// Single entry point for inbound consensus messages from the
    /// transport.
    pub fn process_consensus(
        self: &Arc<Self>,
        kind: ConsensusMsgKind,
        message: &[u8],
        offset: usize,
        from: &Peer,
    ) -> ChainResult<()> {
        match kind {
            ConsensusMsgKind::DsBlock => self.process_ds_block_consensus(message, offset, from),
            ConsensusMsgKind::FinalBlock => {
                self.process_final_block_consensus(message, offset, from)
            }
        }
    }

    /// Consensus messages must be absorbed in protocol order even though
    /// they can arrive in any order. Parks the caller until the round can
    /// take this message, the order window elapses, or the node leaves the
    /// live state.
    fn wait_for_message_order(&self, message: &[u8], offset: usize) -> ChainResult<()> {
        let window = self.config.runtime.consensus_msg_order_block_window();
        let deadline = Instant::now() + window;
        let mut guard = self.mutex_process_consensus_message.lock();
        loop {
            if self.is_rejoining() {
                warn!("node started rejoining, dropping the rest of the consensus messages");
                return Err(ChainError::Consensus("node is rejoining".into()));
            }
            match self.consensus_object() {
                Some(consensus) => {
                    if consensus.can_process(message, offset) {
                        return Ok(());
                    }
                }
                None => warn!("consensus object has not been initialized"),
            }
            let now = Instant::now();
            if now >= deadline {
                warn!("timed out waiting for the correct consensus message order");
                return Err(ChainError::Timeout("consensus message order window"));
            }
            self.cv_process_consensus_message
                .wait_for(&mut guard, deadline - now);
        }
    }

    /// DS-block stream. Messages that arrive before the consensus object
    /// exists wait for its construction; anything not processable in the
    /// current state is dropped.
    pub fn process_ds_block_consensus(
        self: &Arc<Self>,
        message: &[u8],
        offset: usize,
        from: &Peer,
    ) -> ChainResult<()> {
        if self.reject_on_lookup("process_ds_block_consensus") {
            return Ok(());
        }

        {
            let _consensus_guard = self.consensus_mutex.lock();
            let state = self.state();
            if matches!(
                state,
                NodeState::PowSubmission
                    | NodeState::DsBlockConsensusPrep
                    | NodeState::ViewChangeConsensus
            ) {
                // The announcement beat the state transition; nudge the
                // state machine and wait for the consensus object.
                self.cv_ds_block_consensus.notify_all();
                let timed_out = self.wait_timeout(
                    &self.mutex_cv_ds_block_consensus_object,
                    &self.cv_ds_block_consensus_object,
                    self.config.runtime.consensus_object_timeout(),
                );
                if timed_out {
                    warn!("timed out waiting for state transition and consensus object creation");
                }
            }

            if self.state() != NodeState::DsBlockConsensus {
                info!(state = %self.state(), "ignoring DS block consensus message");
                return Err(ChainError::Consensus(
                    "not in DS block consensus state".into(),
                ));
            }
        }

        self.wait_for_message_order(message, offset)?;

        let _consensus_guard = self.consensus_mutex.lock();
        let consensus = self
            .consensus_object()
            .ok_or_else(|| ChainError::Consensus("consensus object not initialized".into()))?;
        if !consensus.process(message, offset, from) {
            return Err(ChainError::Consensus(
                "DS block consensus message rejected".into(),
            ));
        }

        match consensus.state() {
            ConsensusState::Done => {
                self.view_change_counter.store(0, Ordering::SeqCst);
                self.cv_view_change_ds_block.notify_all();
                self.process_ds_block_consensus_when_done()
            }
            ConsensusState::Error => {
                info!("no consensus reached, waiting for view change");
                Ok(())
            }
            _ => {
                self.cv_process_consensus_message.notify_all();
                Ok(())
            }
        }
    }

    /// Final-block stream. Out-of-order consensus ids are triaged here:
    /// stale ids are dropped, future ids buffered, the current id processed
    /// in arrival order.
    pub fn process_final_block_consensus(
        self: &Arc<Self>,
        message: &[u8],
        offset: usize,
        from: &Peer,
    ) -> ChainResult<()> {
        if self.reject_on_lookup("process_final_block_consensus") {
            return Ok(());
        }

        let consensus = self
            .consensus_object()
            .ok_or_else(|| ChainError::Consensus("consensus object not initialized".into()))?;
        let consensus_id = consensus.consensus_id(message, offset)?;

        if self.state() != NodeState::FinalBlockConsensus {
            if self.registry.mode() == Mode::Idle {
                info!("idle node ignores final block consensus messages");
                return Err(ChainError::Consensus(
                    "final block consensus not buffered while idle".into(),
                ));
            }
            if !matches!(
                self.state(),
                NodeState::MicroblockSubmission
                    | NodeState::FinalBlockConsensusPrep
                    | NodeState::ViewChangeConsensus
            ) {
                info!(state = %self.state(), "ignoring final block consensus message");
                return Err(ChainError::Consensus(
                    "final block consensus message not processable".into(),
                ));
            }

            self.final_block_consensus_buffer
                .lock()
                .entry(consensus_id)
                .or_default()
                .push((*from, message.to_vec()));
            info!(consensus_id, "final block consensus arrived early, saved to buffer");

            if consensus_id == self.chain.consensus_id() {
                // The committee has moved on to sealing this epoch; stop
                // collecting microblocks and catch up.
                let _prepare_guard = self.prepare_run_guard.lock();
                {
                    let _guard = self.mutex_schedule_ds_microblock_consensus.lock();
                    self.cv_schedule_ds_microblock_consensus.notify_all();
                }
                self.stop_recv_new_mb_submission.store(true, Ordering::SeqCst);
                {
                    let _guard = self.mutex_schedule_final_block_consensus.lock();
                    self.cv_schedule_final_block_consensus.notify_all();
                }
                self.runner.run_final_block_consensus(false);
            }
            return Ok(());
        }

        let current = self.chain.consensus_id();
        if consensus_id < current {
            warn!(consensus_id, current, "consensus id in message is stale");
            Err(ChainError::Consensus("stale consensus id".into()))
        } else if consensus_id > current {
            info!(consensus_id, current, "buffering final block consensus from the future");
            self.final_block_consensus_buffer
                .lock()
                .entry(consensus_id)
                .or_default()
                .push((*from, message.to_vec()));
            Ok(())
        } else {
            self.process_final_block_consensus_core(message, offset, from)
        }
    }

    /// Drive one current-id final-block consensus message through the
    /// round, handling the recoverable missing-data errors by waiting for
    /// the fetch signal and re-entering from INITIAL.
    pub(crate) fn process_final_block_consensus_core(
        self: &Arc<Self>,
        message: &[u8],
        offset: usize,
        from: &Peer,
    ) -> ChainResult<()> {
        if self.state() != NodeState::FinalBlockConsensus {
            info!(state = %self.state(), "ignoring final block consensus message");
            return Err(ChainError::Consensus(
                "not in final block consensus state".into(),
            ));
        }

        self.wait_for_message_order(message, offset)?;

        let _consensus_guard = self.consensus_mutex.lock();
        let consensus = self
            .consensus_object()
            .ok_or_else(|| ChainError::Consensus("consensus object not initialized".into()))?;
        if !consensus.process(message, offset, from) {
            return Err(ChainError::Consensus(
                "final block consensus message rejected".into(),
            ));
        }

        match consensus.state() {
            ConsensusState::Done => {
                self.cv_view_change_final_block.notify_all();
                self.view_change_counter.store(0, Ordering::SeqCst);
                self.process_final_block_consensus_when_done()
            }
            ConsensusState::Error => {
                warn!(code = ?consensus.error_code(), "final block consensus error");
                match consensus.error_code() {
                    ConsensusErrorCode::MissingMicroblocks => {
                        let timed_out = self.wait_timeout(
                            &self.mutex_cv_missing_microblock,
                            &self.cv_missing_microblock,
                            self.config.runtime.fetching_missing_data_timeout(),
                        );
                        if timed_out {
                            warn!("fetching missing microblocks timed out");
                        } else {
                            consensus.recover_to_initial();
                            let service = Arc::clone(self);
                            let message = message.to_vec();
                            let from = *from;
                            thread::spawn(move || {
                                service.runner.prepare_final_block_consensus();
                                if let Err(err) =
                                    service.process_final_block_consensus_core(&message, offset, &from)
                                {
                                    warn!(%err, "re-running final block consensus failed");
                                }
                            });
                            return Ok(());
                        }
                    }
                    ConsensusErrorCode::MissingTxn => {
                        info!("waiting for missing transactions to be fetched");
                        let timed_out = self.wait_timeout(
                            &self.mutex_cv_missing_txn,
                            &self.cv_missing_txn,
                            self.config.runtime.fetching_missing_data_timeout(),
                        );
                        if timed_out {
                            warn!("fetching missing transactions timed out");
                        } else {
                            consensus.recover_to_initial();
                            let service = Arc::clone(self);
                            let message = message.to_vec();
                            let from = *from;
                            thread::spawn(move || {
                                if let Err(err) =
                                    service.process_final_block_consensus_core(&message, offset, &from)
                                {
                                    warn!(%err, "re-processing final block consensus failed");
                                }
                            });
                            return Ok(());
                        }
                    }
                    ConsensusErrorCode::Other => {}
                }
                warn!("no consensus reached, waiting for view change");
                Err(ChainError::Consensus("no consensus reached".into()))
            }
            _ => {
                self.cv_process_consensus_message.notify_all();
                Ok(())
            }
        }
    }

    /// Replay buffered final-block consensus messages for the current
    /// consensus id through detached reprocessing.
    pub fn commit_final_block_consensus_buffer(self: &Arc<Self>) {
        let current = self.chain.consensus_id();
        let buffered = self
            .final_block_consensus_buffer
            .lock()
            .remove(&current)
            .unwrap_or_default();
        if buffered.is_empty() {
            return;
        }
        info!(
            consensus_id = current,
            count = buffered.len(),
            "replaying buffered final block consensus messages"
        );
        for (from, message) in buffered {
            let service = Arc::clone(self);
            thread::spawn(move || {
                if let Err(err) =
                    service.process_final_block_consensus_core(&message, MESSAGE_BODY_OFFSET, &from)
                {
                    warn!(%err, "buffered final block consensus message failed");
                }
            });
        }
    }

    /// Drop every buffered final-block consensus message; used when the
    /// node resyncs and the buffer no longer reflects a live round.
    pub fn clean_final_block_consensus_buffer(&self) {
        self.final_block_consensus_buffer.lock().clear();
    }
}
