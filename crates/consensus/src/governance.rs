//! Governance and epochs.
//!
//! Validator sets and timeout parameters come from a [`GovernanceProvider`]
//! passed to the engine at construction. The SMR asks it once per epoch
//! transition and keeps the answer as an immutable [`Epoch`]; nothing reads
//! governance state on the hot path.

use std::sync::Arc;

use hotchain_types::Member;
use thiserror::Error;
use tracing::info;

use crate::proposer::ProposerSelection;
use crate::timer::TimeoutConfig;
use crate::types::ValidatorIndex;

/// Governance lookup failures.
#[derive(Debug, Error)]
pub enum GovernanceError {
    /// The provider has no validators configured
    #[error("governance returned an empty validator set at height {0}")]
    EmptyValidatorSet(u64),

    /// Validator indices are not `0..n` in order
    #[error("validator at position {position} has index {index}")]
    BadIndex {
        /// Position in the list
        position: usize,
        /// Declared index
        index: ValidatorIndex,
    },

    /// Provider-specific failure
    #[error("governance unavailable: {0}")]
    Unavailable(String),
}

/// Result type for governance lookups
pub type GovernanceResult<T> = Result<T, GovernanceError>;

/// A validator as governance lists it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorInfo {
    /// Stable index within the epoch
    pub index: ValidatorIndex,
    /// Network node id
    pub node_id: String,
    /// Identity votes are attributed to
    pub member: Member,
}

/// Read-only governance state for one epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GovernanceContract {
    /// Epoch number
    pub epoch_id: u64,
    /// Validators in index order
    pub validators: Vec<ValidatorInfo>,
    /// Lower bound on the quorum (0 = derive from the set size)
    pub min_quorum: u32,
    /// Base round timeout, 0 = node default
    pub base_timeout_ms: u64,
    /// Per-level backoff, 0 = node default
    pub timeout_delta_ms: u64,
    /// Last height of this epoch; the next epoch starts after it commits
    pub next_switch_height: u64,
}

/// Source of governance snapshots.
pub trait GovernanceProvider: Send + Sync {
    /// Governance in force for the block at `height`.
    fn governance_at(&self, height: u64) -> GovernanceResult<GovernanceContract>;
}

/// Governance with a fixed validator set and fixed-length epochs.
#[derive(Debug, Clone)]
pub struct StaticGovernance {
    validators: Vec<ValidatorInfo>,
    epoch_length: u64,
    min_quorum: u32,
    base_timeout_ms: u64,
    timeout_delta_ms: u64,
}

impl StaticGovernance {
    /// Validators are indexed in the order given. `epoch_length == 0` keeps a
    /// single epoch forever.
    pub fn new(validators: Vec<(String, Member)>, epoch_length: u64) -> Self {
        let validators = validators
            .into_iter()
            .enumerate()
            .map(|(i, (node_id, member))| ValidatorInfo {
                index: i as ValidatorIndex,
                node_id,
                member,
            })
            .collect();
        Self {
            validators,
            epoch_length,
            min_quorum: 0,
            base_timeout_ms: 0,
            timeout_delta_ms: 0,
        }
    }

    /// Raise the quorum floor.
    pub fn with_min_quorum(mut self, min_quorum: u32) -> Self {
        self.min_quorum = min_quorum;
        self
    }

    /// Governance-level timeouts, in milliseconds.
    pub fn with_timeouts(mut self, base_timeout_ms: u64, timeout_delta_ms: u64) -> Self {
        self.base_timeout_ms = base_timeout_ms;
        self.timeout_delta_ms = timeout_delta_ms;
        self
    }
}

impl GovernanceProvider for StaticGovernance {
    fn governance_at(&self, height: u64) -> GovernanceResult<GovernanceContract> {
        if self.validators.is_empty() {
            return Err(GovernanceError::EmptyValidatorSet(height));
        }
        let (epoch_id, next_switch_height) = if self.epoch_length == 0 {
            (0, u64::MAX)
        } else {
            let epoch_id = height.saturating_sub(1) / self.epoch_length;
            (
                epoch_id,
                epoch_id.saturating_add(1).saturating_mul(self.epoch_length),
            )
        };
        Ok(GovernanceContract {
            epoch_id,
            validators: self.validators.clone(),
            min_quorum: self.min_quorum,
            base_timeout_ms: self.base_timeout_ms,
            timeout_delta_ms: self.timeout_delta_ms,
            next_switch_height,
        })
    }
}

/// `ceil((2n + 1) / 3)`, raised to `min_quorum` and capped at `n`.
pub fn quorum_for(n: usize, min_quorum: u32) -> usize {
    let derived = (2 * n + 3) / 3;
    derived.max(min_quorum as usize).min(n)
}

/// Immutable view of one epoch as the local node sees it.
#[derive(Debug, Clone)]
pub struct Epoch {
    /// Epoch number
    pub epoch_id: u64,
    /// Validators in index order
    pub validators: Vec<ValidatorInfo>,
    /// Votes needed for a QC
    pub quorum: usize,
    /// Local validator index, `None` when observing
    pub local_index: Option<ValidatorIndex>,
    /// Round timeouts after governance fallback
    pub timeouts: TimeoutConfig,
    /// Last height of the epoch
    pub next_switch_height: u64,
    selection: ProposerSelection,
}

impl Epoch {
    /// Build an epoch from a governance snapshot.
    pub fn new(
        contract: GovernanceContract,
        local_node_id: &str,
        selection: ProposerSelection,
        timeout_defaults: &TimeoutConfig,
    ) -> GovernanceResult<Self> {
        if contract.validators.is_empty() {
            return Err(GovernanceError::Unavailable(format!(
                "epoch {} has no validators",
                contract.epoch_id
            )));
        }
        for (position, v) in contract.validators.iter().enumerate() {
            if v.index as usize != position {
                return Err(GovernanceError::BadIndex {
                    position,
                    index: v.index,
                });
            }
        }

        let local_index = contract
            .validators
            .iter()
            .find(|v| v.node_id == local_node_id)
            .map(|v| v.index);
        let quorum = quorum_for(contract.validators.len(), contract.min_quorum);
        let timeouts = TimeoutConfig::from_governance(
            contract.base_timeout_ms,
            contract.timeout_delta_ms,
            timeout_defaults,
        );

        Ok(Self {
            epoch_id: contract.epoch_id,
            validators: contract.validators,
            quorum,
            local_index,
            timeouts,
            next_switch_height: contract.next_switch_height,
            selection,
        })
    }

    /// Number of validators.
    pub fn len(&self) -> usize {
        self.validators.len()
    }

    /// Whether the set is empty. Never true for a constructed epoch.
    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// Validator at `index`.
    pub fn validator(&self, index: ValidatorIndex) -> Option<&ValidatorInfo> {
        self.validators.get(index as usize)
    }

    /// Elected proposer for (height, level).
    pub fn proposer_for(&self, height: u64, level: u64) -> ValidatorIndex {
        self.selection
            .select(self.epoch_id, height, level, self.validators.len())
            .unwrap_or(0)
    }

    /// Whether the local node proposes at (height, level).
    pub fn is_local_proposer(&self, height: u64, level: u64) -> bool {
        self.local_index == Some(self.proposer_for(height, level))
    }
}

/// Current epoch plus the one before it.
///
/// The previous epoch is kept so that certificates formed just before a
/// switch are still accepted during the transition.
#[derive(Debug, Clone)]
pub struct EpochView {
    /// Epoch in force
    pub current: Arc<Epoch>,
    /// Epoch replaced by the last switch
    pub previous: Option<Arc<Epoch>>,
}

impl EpochView {
    /// Start at `current`.
    pub fn new(current: Epoch) -> Self {
        Self {
            current: Arc::new(current),
            previous: None,
        }
    }

    /// Install `next` as the current epoch.
    pub fn switch(&mut self, next: Epoch) {
        info!(
            from = self.current.epoch_id,
            to = next.epoch_id,
            validators = next.len(),
            quorum = next.quorum,
            "Switching epoch"
        );
        let previous = std::mem::replace(&mut self.current, Arc::new(next));
        self.previous = Some(previous);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn members(n: usize) -> Vec<(String, Member)> {
        (0..n)
            .map(|i| (format!("node{i}"), Member::new("org1", vec![i as u8; 33])))
            .collect()
    }

    #[test]
    fn test_quorum() {
        assert_eq!(quorum_for(1, 0), 1);
        assert_eq!(quorum_for(3, 0), 3);
        assert_eq!(quorum_for(4, 0), 3);
        assert_eq!(quorum_for(7, 0), 5);
        assert_eq!(quorum_for(10, 0), 7);
        assert_eq!(quorum_for(4, 4), 4);
        assert_eq!(quorum_for(4, 9), 4);
    }

    #[test]
    fn test_static_single_epoch() {
        let gov = StaticGovernance::new(members(4), 0);
        let contract = gov.governance_at(1_000_000).unwrap();
        assert_eq!(contract.epoch_id, 0);
        assert_eq!(contract.next_switch_height, u64::MAX);
    }

    #[test]
    fn test_static_epoch_boundaries() {
        let gov = StaticGovernance::new(members(4), 10);
        assert_eq!(gov.governance_at(1).unwrap().epoch_id, 0);
        assert_eq!(gov.governance_at(10).unwrap().epoch_id, 0);
        assert_eq!(gov.governance_at(10).unwrap().next_switch_height, 10);
        assert_eq!(gov.governance_at(11).unwrap().epoch_id, 1);
        assert_eq!(gov.governance_at(11).unwrap().next_switch_height, 20);
    }

    #[test]
    fn test_empty_governance_fails() {
        let gov = StaticGovernance::new(Vec::new(), 0);
        assert!(matches!(
            gov.governance_at(1),
            Err(GovernanceError::EmptyValidatorSet(1))
        ));
    }

    #[test]
    fn test_epoch_local_index() {
        let gov = StaticGovernance::new(members(4), 0);
        let defaults = TimeoutConfig::default();
        let epoch = Epoch::new(
            gov.governance_at(1).unwrap(),
            "node2",
            ProposerSelection::RoundRobin,
            &defaults,
        )
        .unwrap();
        assert_eq!(epoch.local_index, Some(2));
        assert_eq!(epoch.quorum, 3);
        assert!(epoch.is_local_proposer(5, 2));
        assert!(!epoch.is_local_proposer(5, 3));

        let observer = Epoch::new(
            gov.governance_at(1).unwrap(),
            "outsider",
            ProposerSelection::RoundRobin,
            &defaults,
        )
        .unwrap();
        assert_eq!(observer.local_index, None);
    }

    #[test]
    fn test_epoch_view_switch_keeps_previous() {
        let gov = StaticGovernance::new(members(4), 5);
        let defaults = TimeoutConfig::default();
        let first = Epoch::new(gov.governance_at(1).unwrap(), "node0", ProposerSelection::RoundRobin, &defaults).unwrap();
        let second = Epoch::new(gov.governance_at(6).unwrap(), "node0", ProposerSelection::RoundRobin, &defaults).unwrap();
        let mut view = EpochView::new(first);
        view.switch(second);
        assert_eq!(view.current.epoch_id, 1);
        assert_eq!(view.previous.as_ref().map(|e| e.epoch_id), Some(0));
    }
}
