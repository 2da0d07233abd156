use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::chain::BlockLinkKind;
use crate::errors::{ChainError, ChainResult};
use crate::messages::read_vc_block;
use crate::service::DirectoryService;
use crate::types::{bitmap_to_bytes, Peer, PublicKey, VcBlock};

impl DirectoryService {
    /// A view-change block names a DS epoch and a TX epoch; it only applies
    /// to the committee view at the current chain head.
    fn is_latest_vc_block(&self, vc_ds_epoch_no: u64, vc_epoch_no: u64) -> bool {
        vc_ds_epoch_no == self.chain.tail_ds_block_num() + 1
            && vc_epoch_no == self.chain.current_epoch_num()
    }

    /// Verify the second-round co-signature of a view-change block against
    /// the current committee: bitmap must cover the committee, enough
    /// members must have signed, and the aggregate must verify over
    /// `header ∥ CS1 ∥ B1`.
    fn verify_vc_block_co_signature(&self, vc_block: &VcBlock) -> ChainResult<()> {
        let committee = self.registry.committee();
        let b2 = &vc_block.cosigs.b2;
        if b2.len() != committee.len() {
            return Err(ChainError::Consensus(format!(
                "co-sig bitmap size {} does not match committee size {}",
                b2.len(),
                committee.len()
            )));
        }

        let signer_keys: Vec<PublicKey> = committee
            .iter()
            .zip(b2.iter())
            .filter(|(_, signed)| **signed)
            .map(|((key, _), _)| key.clone())
            .collect();
        let required = self.multisig.num_for_consensus(b2.len());
        if signer_keys.len() != required {
            return Err(ChainError::Consensus(format!(
                "co-signature carries {} signers, consensus requires {required}",
                signer_keys.len()
            )));
        }

        let aggregated_key = self.multisig.aggregate(&signer_keys)?;
        let mut message = vc_block.header.canonical_bytes();
        message.extend_from_slice(vc_block.cosigs.cs1.as_bytes());
        message.extend_from_slice(&bitmap_to_bytes(&vc_block.cosigs.b1));
        if !self
            .multisig
            .verify(&message, &vc_block.cosigs.cs2, &aggregated_key)
        {
            return Err(ChainError::Crypto(
                "view-change co-signature verification failed".into(),
            ));
        }
        Ok(())
    }

    /// Validate and apply one view-change block: link it into the block-link
    /// chain, persist it, and park the faulty leaders at the committee tail.
    pub fn process_vc_block_core(&self, vc_block: &VcBlock) -> ChainResult<()> {
        let header = &vc_block.header;

        if header.vc_epoch_no != self.chain.current_epoch_num() {
            warn!(
                vc_epoch = header.vc_epoch_no,
                current = self.chain.current_epoch_num(),
                "view-change block is for a different epoch"
            );
            return Err(ChainError::Consensus(
                "view-change block epoch mismatch".into(),
            ));
        }

        if !self.is_latest_vc_block(header.vc_ds_epoch_no, header.vc_epoch_no) {
            warn!(
                vc_ds_epoch = header.vc_ds_epoch_no,
                "view-change block is not for the latest chain state"
            );
            return Err(ChainError::Consensus("view-change block is stale".into()));
        }

        let recomputed = header.compute_hash();
        if recomputed != vc_block.block_hash {
            warn!(
                calculated = %recomputed,
                received = %vc_block.block_hash,
                "view-change block hash mismatch"
            );
            return Err(ChainError::Consensus("view-change block hash mismatch".into()));
        }

        if !self.verify_timestamp(
            header.timestamp,
            self.config.runtime.viewchange_timestamp_window_secs(),
        ) {
            return Err(ChainError::Consensus(
                "view-change block timestamp out of window".into(),
            ));
        }

        let committee_hash = self.registry.committee_hash();
        if committee_hash != header.committee_hash {
            warn!(
                calculated = %committee_hash,
                received = %header.committee_hash,
                "committee hash in view-change block does not match"
            );
            return Err(ChainError::Consensus(
                "view-change committee hash mismatch".into(),
            ));
        }

        self.verify_vc_block_co_signature(vc_block)?;

        self.chain.append_link(
            header.vc_ds_epoch_no,
            BlockLinkKind::Vc,
            vc_block.block_hash.clone(),
        );
        if let Err(err) = self.storage.put_vc_block(vc_block) {
            warn!(%err, "failed to store the view-change block");
            return Err(err);
        }

        self.registry.reorder_for_vc(&header.faulty_leaders)?;
        Ok(())
    }

    /// Entry point for a `NODE/VCBLOCK` message: decode, validate, apply,
    /// and fan the raw bytes out to this node's shard neighbors.
    pub fn process_vc_block(self: &Arc<Self>, message: &[u8], offset: usize) -> ChainResult<()> {
        let announcement = match read_vc_block(message, offset) {
            Ok(announcement) => announcement,
            Err(err) => {
                warn!(%err, "failed to decode the view-change block message");
                return Err(err);
            }
        };
        let vc_block = announcement.vc_block;

        // A view change raised during the DS-block phase travels with the DS
        // block itself and is applied by that path instead.
        if vc_block.header.view_change_state.is_ds_block_phase() {
            warn!(
                vc_epoch = vc_block.header.vc_epoch_no,
                state = %vc_block.header.view_change_state,
                "DS-phase view change must be processed together with the DS block"
            );
            return Err(ChainError::Consensus(
                "DS-phase view change handled elsewhere".into(),
            ));
        }

        self.process_vc_block_core(&vc_block)?;

        if !self.config.runtime.lookup_node_mode
            && self.config.runtime.broadcast_treebased_cluster_mode
        {
            self.send_vc_block_to_other_shard_nodes(message);
        }

        info!("view of the consensus leader changed");
        Ok(())
    }

    /// Tree-based rebroadcast: forward the raw view-change message to this
    /// node's child clusters within its shard.
    fn send_vc_block_to_other_shard_nodes(&self, message: &[u8]) {
        let runtime = &self.config.runtime;
        let mut cluster_size = runtime.num_forwarded_block_receivers_per_shard;
        if cluster_size <= runtime.num_ds_election {
            warn!(
                cluster_size,
                floor = runtime.num_ds_election,
                "forwarding cluster size raised above the DS election count"
            );
            cluster_size = runtime.num_ds_election + 1;
        }

        let Some(shard_id) = self.registry.locate_self_in_shards() else {
            debug!("not part of any shard, skipping view-change rebroadcast");
            return;
        };
        let shards = self.registry.shards();
        let Some(shard) = shards.get(shard_id as usize) else {
            return;
        };
        let self_key = self.registry.self_key();
        let Some(my_index) = shard.iter().position(|member| member.pub_key == self_key) else {
            return;
        };

        let my_cluster = my_index / cluster_size;
        let child_start = my_cluster * runtime.num_of_treebased_child_clusters + 1;
        for child in child_start..child_start + runtime.num_of_treebased_child_clusters {
            let lo = child * cluster_size;
            if lo >= shard.len() {
                break;
            }
            let hi = (lo + cluster_size).min(shard.len());
            let peers: Vec<Peer> = shard[lo..hi].iter().map(|member| member.peer).collect();
            if let Err(err) = self.transport.send_broadcast(&peers, message) {
                warn!(%err, "failed to forward the view-change block to a child cluster");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::chain::BlockLinkKind;
    use crate::committee::ShardingStructure;
    use crate::messages::{compose_vc_block, VcBlockAnnouncement, MESSAGE_BODY_OFFSET};
    use crate::service::now_secs;
    use crate::testutil::{harness, member, peer, Harness, HarnessOptions};
    use crate::types::{
        CoSignatures, DsBlock, DsBlockHeader, NodeState, ShardMember, VcBlockHeader,
    };

    fn seed_ds_tail(fixture: &Harness) {
        fixture
            .service
            .chain()
            .append_ds(DsBlock::new(DsBlockHeader::new(
                1,
                "00".repeat(32),
                "W".to_string(),
                1,
                20,
                10,
                "11".repeat(32),
            )))
            .expect("seed ds block");
    }

    fn quorum_cosigs(n: usize, signers: usize) -> CoSignatures {
        let mut b2 = vec![false; n];
        for bit in b2.iter_mut().take(signers) {
            *bit = true;
        }
        CoSignatures::new("cs1".into(), vec![true; n], "cs2".into(), b2)
    }

    fn valid_vc_block(fixture: &Harness, faulty: Vec<(String, crate::types::Peer)>) -> VcBlock {
        let header = VcBlockHeader::new(
            fixture.service.chain().tail_ds_block_num() + 1,
            fixture.service.chain().current_epoch_num(),
            NodeState::FinalBlockConsensus,
            faulty,
            fixture.service.registry().committee_hash(),
        );
        let size = fixture.service.registry().committee_size();
        // a committee of 4 needs 3 co-signers
        VcBlock::new(header, quorum_cosigs(size, size - (size - 1) / 3))
    }

    #[test]
    fn valid_vc_block_is_linked_stored_and_reorders_the_committee() {
        let fixture = harness(HarnessOptions::default());
        seed_ds_tail(&fixture);
        let vc_block = valid_vc_block(&fixture, vec![member("B", 11)]);

        fixture
            .service
            .process_vc_block_core(&vc_block)
            .expect("process");

        let committee = fixture.service.registry().committee();
        assert_eq!(committee[0].0, "A");
        assert_eq!(committee[1].0, "C");
        assert_eq!(committee[2].0, "D");
        assert_eq!(committee[3].0, "B");

        let links = fixture.service.chain().block_links();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].kind, BlockLinkKind::Vc);
        assert_eq!(links[0].hash, vc_block.block_hash);
        assert_eq!(links[0].ds_epoch_no, 2);

        assert!(fixture
            .service
            .storage
            .get_vc_block(&vc_block.block_hash)
            .expect("get vc block")
            .is_some());
    }

    #[test]
    fn empty_faulty_leader_list_changes_nothing() {
        let fixture = harness(HarnessOptions::default());
        seed_ds_tail(&fixture);
        let before = fixture.service.registry().committee();
        let vc_block = valid_vc_block(&fixture, vec![]);

        fixture
            .service
            .process_vc_block_core(&vc_block)
            .expect("process");
        assert_eq!(fixture.service.registry().committee(), before);
    }

    #[test]
    fn bitmap_not_covering_the_committee_is_rejected() {
        let fixture = harness(HarnessOptions::default());
        seed_ds_tail(&fixture);
        let mut vc_block = valid_vc_block(&fixture, vec![member("B", 11)]);
        vc_block.cosigs.b2 = vec![true; 3];

        let err = fixture
            .service
            .process_vc_block_core(&vc_block)
            .expect_err("size mismatch");
        assert!(matches!(err, ChainError::Consensus(_)));
        assert_eq!(fixture.service.registry().committee()[1].0, "B");
    }

    #[test]
    fn too_few_co_signers_is_rejected() {
        let fixture = harness(HarnessOptions::default());
        seed_ds_tail(&fixture);
        let mut vc_block = valid_vc_block(&fixture, vec![member("B", 11)]);
        vc_block.cosigs.b2 = vec![true, true, false, false];

        let err = fixture
            .service
            .process_vc_block_core(&vc_block)
            .expect_err("below threshold");
        assert!(matches!(err, ChainError::Consensus(_)));
    }

    #[test]
    fn failed_signature_verification_is_rejected() {
        let fixture = harness(HarnessOptions::default());
        seed_ds_tail(&fixture);
        fixture.multisig.accept.store(false, Ordering::SeqCst);
        let vc_block = valid_vc_block(&fixture, vec![member("B", 11)]);

        let err = fixture
            .service
            .process_vc_block_core(&vc_block)
            .expect_err("bad signature");
        assert!(matches!(err, ChainError::Crypto(_)));
    }

    #[test]
    fn epoch_mismatch_is_rejected() {
        let fixture = harness(HarnessOptions::default());
        seed_ds_tail(&fixture);
        let mut vc_block = valid_vc_block(&fixture, vec![member("B", 11)]);
        vc_block.header.vc_epoch_no = 7;
        vc_block.block_hash = vc_block.header.compute_hash();

        assert!(fixture.service.process_vc_block_core(&vc_block).is_err());
    }

    #[test]
    fn stale_ds_epoch_is_rejected() {
        let fixture = harness(HarnessOptions::default());
        seed_ds_tail(&fixture);
        let mut vc_block = valid_vc_block(&fixture, vec![member("B", 11)]);
        vc_block.header.vc_ds_epoch_no = 9;
        vc_block.block_hash = vc_block.header.compute_hash();

        assert!(fixture.service.process_vc_block_core(&vc_block).is_err());
    }

    #[test]
    fn tampered_block_hash_is_rejected() {
        let fixture = harness(HarnessOptions::default());
        seed_ds_tail(&fixture);
        let mut vc_block = valid_vc_block(&fixture, vec![member("B", 11)]);
        vc_block.block_hash = "ff".repeat(32);

        assert!(fixture.service.process_vc_block_core(&vc_block).is_err());
    }

    #[test]
    fn expired_timestamp_is_rejected() {
        let fixture = harness(HarnessOptions::default());
        seed_ds_tail(&fixture);
        let mut header = VcBlockHeader::new(
            2,
            0,
            NodeState::FinalBlockConsensus,
            vec![member("B", 11)],
            fixture.service.registry().committee_hash(),
        );
        header.timestamp = now_secs().saturating_sub(100_000);
        let vc_block = VcBlock::new(header, quorum_cosigs(4, 3));

        assert!(fixture.service.process_vc_block_core(&vc_block).is_err());
    }

    #[test]
    fn committee_hash_mismatch_is_rejected() {
        let fixture = harness(HarnessOptions::default());
        seed_ds_tail(&fixture);
        let mut vc_block = valid_vc_block(&fixture, vec![member("B", 11)]);
        vc_block.header.committee_hash = "ee".repeat(32);
        vc_block.block_hash = vc_block.header.compute_hash();

        assert!(fixture.service.process_vc_block_core(&vc_block).is_err());
    }

    #[test]
    fn guard_mode_applies_the_block_without_touching_the_committee() {
        let fixture = harness(HarnessOptions {
            guard_mode: true,
            ..HarnessOptions::default()
        });
        seed_ds_tail(&fixture);
        let before = fixture.service.registry().committee();
        let vc_block = valid_vc_block(&fixture, vec![member("B", 11)]);

        fixture
            .service
            .process_vc_block_core(&vc_block)
            .expect("guarded process");
        assert_eq!(fixture.service.registry().committee(), before);
        assert_eq!(fixture.service.chain().block_links().len(), 1);
    }

    #[test]
    fn ds_phase_view_change_is_refused_at_the_entry_point() {
        let fixture = harness(HarnessOptions::default());
        seed_ds_tail(&fixture);
        let mut vc_block = valid_vc_block(&fixture, vec![member("B", 11)]);
        vc_block.header.view_change_state = NodeState::DsBlockConsensus;
        vc_block.block_hash = vc_block.header.compute_hash();
        let message = compose_vc_block(&VcBlockAnnouncement { vc_block }).expect("compose");

        let err = fixture
            .service
            .process_vc_block(&message, MESSAGE_BODY_OFFSET)
            .expect_err("ds phase");
        assert!(matches!(err, ChainError::Consensus(_)));
    }

    #[test]
    fn garbled_message_is_a_codec_error() {
        let fixture = harness(HarnessOptions::default());
        let err = fixture
            .service
            .process_vc_block(&[0x01, 0x0a, 0xff, 0xff], MESSAGE_BODY_OFFSET)
            .expect_err("garbled");
        assert!(matches!(
            err,
            ChainError::Codec(_) | ChainError::Serialization(_)
        ));
    }

    #[test]
    fn accepted_vc_block_is_rebroadcast_to_child_clusters() {
        let fixture = harness(HarnessOptions::default());
        seed_ds_tail(&fixture);

        // place this node at the root of a ten-member shard
        let mut sharding = ShardingStructure::default();
        let mut shard = vec![ShardMember::new("A".to_string(), peer(10), 1)];
        for index in 0..9u8 {
            shard.push(ShardMember::new(
                format!("N{index}"),
                peer(100 + index),
                1,
            ));
        }
        sharding.shards = vec![shard];
        fixture.service.registry().set_sharding(sharding);

        let vc_block = valid_vc_block(&fixture, vec![member("B", 11)]);
        let message = compose_vc_block(&VcBlockAnnouncement { vc_block }).expect("compose");

        fixture
            .service
            .process_vc_block(&message, MESSAGE_BODY_OFFSET)
            .expect("process");

        // cluster size 3, three child clusters starting at index 3
        let broadcasts = fixture.transport.broadcasts.lock();
        assert_eq!(broadcasts.len(), 3);
        assert_eq!(broadcasts[0].0.len(), 3);
        assert_eq!(broadcasts[1].0.len(), 3);
        assert_eq!(broadcasts[2].0.len(), 1);
        assert!(broadcasts.iter().all(|(_, bytes)| bytes == &message));
    }
}
