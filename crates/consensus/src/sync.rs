//! Block fetch between validators.
//!
//! A validator that sees a certificate or proposal for a block it does not
//! have asks the sender for the missing chain segment. Responses carry each
//! block with the QC that certifies it, so fetched blocks go through the
//! same certificate path as live ones.

use hotchain_core::VerifyMode;
use tracing::{debug, info};

use crate::qc::validate_qc;
use crate::smr::{ChainedBftSmr, SmrAction, SmrError, SmrResult};
use crate::types::{
    BlockFetchMsg, BlockFetchRespMsg, ConsensusPayload, FetchStatus,
};

impl ChainedBftSmr {
    /// Answer a peer's fetch with up to `num_blocks` certified blocks
    /// ending at `block_id`.
    pub fn process_block_fetch(&self, msg: BlockFetchMsg) -> SmrResult<Vec<SmrAction>> {
        let epoch = self.epoch();
        let Some(local) = epoch.local_index else {
            return Ok(Vec::new());
        };
        if epoch.validator(msg.author_idx).is_none() {
            return Err(SmrError::InvalidFetch(format!(
                "request from unknown validator {}",
                msg.author_idx
            )));
        }

        let limit = msg.num_blocks.min(self.config.fetch_batch_size).max(1);
        let blocks = self.chain_store.ancestors(&msg.block_id, limit as usize)?;
        let status = if blocks.len() >= msg.num_blocks as usize {
            FetchStatus::Succeed
        } else {
            FetchStatus::NotEnough
        };
        debug!(
            req_id = msg.req_id,
            from = msg.author_idx,
            requested = msg.num_blocks,
            returned = blocks.len(),
            ?status,
            "Serving block fetch"
        );

        Ok(vec![SmrAction::SendTo {
            to: msg.author_idx,
            payload: ConsensusPayload::BlockFetchResp(BlockFetchRespMsg {
                resp_id: msg.req_id,
                status,
                blocks,
                author_idx: local,
            }),
        }])
    }

    /// Insert fetched blocks oldest first, apply their certificates, then
    /// retry whatever was waiting on them.
    pub fn process_fetch_resp(&mut self, msg: BlockFetchRespMsg) -> SmrResult<Vec<SmrAction>> {
        if msg.blocks.is_empty() {
            debug!(resp_id = msg.resp_id, status = ?msg.status, "Empty fetch response");
            let mut actions = Vec::new();
            self.retry_pending(&mut actions);
            return Ok(actions);
        }

        let mut pairs = msg.blocks;
        pairs.sort_by_key(|pair| pair.block.height());
        let mut actions = Vec::new();
        let mut inserted = 0usize;

        for pair in pairs {
            let height = pair.block.height();
            if height <= self.chain_store.get_commit_height() {
                continue;
            }
            let hash = pair.block.hash();
            if pair.block.compute_hash() != hash {
                return Err(SmrError::InvalidFetch(format!("block hash mismatch at {height}")));
            }
            if pair.qc.new_view || pair.qc.block_id != hash || pair.qc.height != height {
                return Err(SmrError::InvalidFetch(format!(
                    "qc does not certify block at {height}"
                )));
            }
            validate_qc(&pair.qc, &self.epochs.read(), self.deps.ac.as_ref())?;

            if !self.chain_store.contains(&hash) {
                let parent = pair.block.header.pre_block_hash;
                if !self.chain_store.contains(&parent) {
                    info!(height, "Fetched segment does not reach local chain, fetching further");
                    actions.extend(self.fetch_request(msg.author_idx, parent, height - 1));
                    return Ok(actions);
                }
                self.deps.verifier.verify_block(&pair.block, VerifyMode::Sync)?;
                self.chain_store.insert_block(pair.block, pair.qc.level)?;
                inserted += 1;
            }
            actions.extend(self.process_certificates(&pair.qc)?);
        }
        info!(resp_id = msg.resp_id, inserted, "Applied fetched blocks");

        self.retry_pending(&mut actions);
        Ok(actions)
    }

    /// Retry the parked proposal once its parent is known, then the
    /// parked QC. A parent still missing keeps the proposal parked.
    fn retry_pending(&mut self, actions: &mut Vec<SmrAction>) {
        if let Some(proposal) = self.pending_proposal.take() {
            if self.chain_store.contains(&proposal.justify_qc.block_id) {
                let (height, level) = (proposal.height, proposal.level);
                match self.process_proposal(proposal) {
                    Ok(more) => actions.extend(more),
                    Err(e) => debug!(height, level, error = %e, "pending proposal dropped"),
                }
            } else {
                self.pending_proposal = Some(proposal);
            }
        }
        self.retry_pending_qc(None, actions);
    }
}
