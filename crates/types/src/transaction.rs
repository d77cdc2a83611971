//! Transactions and execution results.

use serde::{Deserialize, Serialize};

use crate::Member;

/// Transaction category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxType {
    /// Contract invocation
    #[default]
    InvokeContract,
    /// Read-only query
    QueryContract,
}

/// Final status of an executed transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxStatusCode {
    /// Executed successfully
    #[default]
    Success,
    /// The contract reported a failure
    ContractFail,
    /// Execution hit a VM-level failure
    InternalError,
}

/// A transaction as carried in a block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Unique transaction id
    pub tx_id: String,
    /// Chain this transaction targets
    pub chain_id: String,
    /// Transaction category
    pub tx_type: TxType,
    /// Submission timestamp (unix seconds)
    pub timestamp: i64,
    /// Target contract
    pub contract_name: String,
    /// Contract method
    pub method: String,
    /// Method parameters
    pub parameters: Vec<(String, Vec<u8>)>,
    /// Sender identity, if signed
    pub sender: Option<Member>,
    /// Result filled in after execution
    pub result: Option<TxResult>,
}

impl Transaction {
    /// Create an invoke transaction.
    pub fn invoke(
        tx_id: impl Into<String>,
        contract_name: impl Into<String>,
        method: impl Into<String>,
    ) -> Self {
        Self {
            tx_id: tx_id.into(),
            contract_name: contract_name.into(),
            method: method.into(),
            ..Default::default()
        }
    }
}

/// Outcome of the contract call itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractResult {
    /// Contract-defined result code (0 = ok)
    pub code: u32,
    /// Returned payload
    pub result: Vec<u8>,
    /// Human-readable message
    pub message: String,
    /// Gas consumed
    pub gas_used: u64,
}

/// Result of executing a transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxResult {
    /// Final status
    pub code: TxStatusCode,
    /// Contract outcome
    pub contract_result: ContractResult,
    /// Hash of the read/write set produced by the run
    pub rw_set_hash: Vec<u8>,
}
