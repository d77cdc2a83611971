//! # Proposer Election
//!
//! Every node must agree on the proposer for a given (height, level) without
//! exchanging messages, so election is a pure function of the epoch's
//! validator list and the round coordinates.
//!
//! - [`ProposerSelection::RoundRobin`]: `level % n`
//! - [`ProposerSelection::Shuffled`]: the validator indices are shuffled with
//!   a ChaCha20 RNG seeded from Keccak(epoch, height), then indexed by
//!   `level % n`. Each validator still proposes exactly once every `n` levels
//!   at a given height, but the order differs across heights and epochs.

use hotchain_crypto::Hasher;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};

use crate::types::ValidatorIndex;

/// Domain separator for proposer shuffle seed generation
const SHUFFLE_DOMAIN: &[u8] = b"HOTCHAIN_PROPOSER_SHUFFLE_V1";

/// Election scheme.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProposerSelection {
    /// `level % n`
    #[default]
    RoundRobin,
    /// Seeded shuffle keyed by (epoch, height), indexed by level
    Shuffled,
}

impl ProposerSelection {
    /// Proposer index for (height, level) among `n` validators.
    ///
    /// Returns `None` for an empty validator set.
    pub fn select(self, epoch_id: u64, height: u64, level: u64, n: usize) -> Option<ValidatorIndex> {
        if n == 0 {
            return None;
        }
        let slot = (level % n as u64) as usize;
        let index = match self {
            ProposerSelection::RoundRobin => slot,
            ProposerSelection::Shuffled => shuffle(n, epoch_id, height)[slot],
        };
        Some(index as ValidatorIndex)
    }
}

/// Fisher-Yates shuffle of `0..n`, deterministic in (epoch, height).
fn shuffle(n: usize, epoch_id: u64, height: u64) -> Vec<usize> {
    let mut order: Vec<usize> = (0..n).collect();
    if n <= 1 {
        return order;
    }

    let mut rng = create_rng(epoch_id, height);
    for i in (1..n).rev() {
        let j = rng.gen_range(0..=i);
        order.swap(i, j);
    }
    order
}

fn create_rng(epoch_id: u64, height: u64) -> ChaCha20Rng {
    let mut hasher = Hasher::new();
    hasher.update(SHUFFLE_DOMAIN);
    hasher.update_u64(epoch_id);
    hasher.update_u64(height);
    ChaCha20Rng::from_seed(hasher.finalize())
}
