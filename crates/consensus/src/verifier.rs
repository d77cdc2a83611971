//! Admission check for certified blocks.

use std::sync::Arc;

use hotchain_core::AccessControlProvider;
use hotchain_types::Block;
use parking_lot::RwLock;
use tracing::debug;

use crate::engine::{ConsensusError, ConsensusResult};
use crate::governance::EpochView;
use crate::qc::validate_qc;
use crate::types::QuorumCert;

/// Re-validates the QC embedded in a block's additional data.
///
/// Holds its own handle on the epoch view so the committer can call it
/// while the SMR is locked.
#[derive(Clone)]
pub struct BlockSignatureVerifier {
    epochs: Arc<RwLock<EpochView>>,
    ac: Arc<dyn AccessControlProvider>,
}

impl BlockSignatureVerifier {
    /// Verify against `epochs` using `ac` for endorsement checks.
    pub fn new(epochs: Arc<RwLock<EpochView>>, ac: Arc<dyn AccessControlProvider>) -> Self {
        Self { epochs, ac }
    }

    /// Decode the block's QC, check that it certifies this block, and run
    /// full QC validation.
    pub fn verify_block_signatures(&self, block: &Block) -> ConsensusResult<QuorumCert> {
        let height = block.height();
        let bytes = block.qc_bytes().ok_or(ConsensusError::MissingQc(height))?;
        let qc = QuorumCert::decode(bytes).map_err(|e| ConsensusError::Codec(e.to_string()))?;

        if qc.new_view || qc.block_id != block.hash() || qc.height != height {
            return Err(ConsensusError::QcMismatch {
                height,
                qc_height: qc.height,
            });
        }
        validate_qc(&qc, &self.epochs.read(), self.ac.as_ref())?;
        debug!(height, level = qc.level, votes = qc.votes.len(), "Block signatures verified");
        Ok(qc)
    }
}
