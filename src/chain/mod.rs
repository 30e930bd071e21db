//! Chain module - read access, signing and confirmation tracking
//!
//! This module provides:
//! - The `ChainReader` and `SigningProvider` capabilities the orchestrator
//!   is built on
//! - An ethers-backed provider with multi-RPC failover
//! - A local-key signer with gas estimation
//! - Confirmation tracking and identity change notification

pub mod finality;
pub mod gas;
pub mod provider;
pub mod signer;
pub mod watcher;

pub use finality::ConfirmationTracker;
pub use gas::GasEstimator;
pub use provider::{ChainProvider, GasPrice};
pub use signer::WalletSigner;
pub use watcher::IdentityWatcher;

use crate::contracts::ContractRef;
use crate::error::ClientResult;

use async_trait::async_trait;
use ethers::abi::Token;
use ethers::types::{Address, Bytes, TransactionReceipt, H256};
use serde::Serialize;

/// An encoded state-changing call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractCall {
    pub to: Address,
    pub data: Bytes,
    /// Name of the invoked function, for logs and metrics
    pub function: &'static str,
}

/// A log entry emitted by a confirmed transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptLog {
    pub address: Address,
    pub topics: Vec<H256>,
    pub data: Vec<u8>,
}

/// Outcome of a mined transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TxReceipt {
    pub tx_hash: H256,
    pub block_number: u64,
    pub success: bool,
    #[serde(skip)]
    pub logs: Vec<ReceiptLog>,
}

impl From<TransactionReceipt> for TxReceipt {
    fn from(receipt: TransactionReceipt) -> Self {
        Self {
            tx_hash: receipt.transaction_hash,
            block_number: receipt.block_number.map(|b| b.as_u64()).unwrap_or(0),
            success: receipt.status.map(|s| s.as_u64() == 1).unwrap_or(false),
            logs: receipt
                .logs
                .into_iter()
                .map(|log| ReceiptLog {
                    address: log.address,
                    topics: log.topics,
                    data: log.data.to_vec(),
                })
                .collect(),
        }
    }
}

/// Status of a previously submitted transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TxStatus {
    /// Not yet mined, or unknown to the node
    Pending,
    Confirmed { block_number: u64 },
    Reverted { block_number: u64 },
}

impl From<Option<TxReceipt>> for TxStatus {
    fn from(receipt: Option<TxReceipt>) -> Self {
        match receipt {
            None => TxStatus::Pending,
            Some(r) if r.success => TxStatus::Confirmed {
                block_number: r.block_number,
            },
            Some(r) => TxStatus::Reverted {
                block_number: r.block_number,
            },
        }
    }
}

/// Read-only access to contract state
#[async_trait]
pub trait ChainReader: Send + Sync {
    /// Call a view function by name and return its decoded outputs
    async fn call(
        &self,
        contract: &ContractRef,
        function: &str,
        args: &[Token],
    ) -> ClientResult<Vec<Token>>;
}

/// A connected signing identity able to submit transactions
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SigningProvider: Send + Sync {
    /// Currently connected identity, `None` when no wallet is connected
    async fn identity(&self) -> ClientResult<Option<Address>>;

    /// Chain id of the network the signer submits to
    async fn network(&self) -> ClientResult<u64>;

    /// Sign and broadcast a call, returning its hash once the node accepted it
    async fn submit(&self, call: ContractCall) -> ClientResult<H256>;

    /// Wait until the transaction is mined deep enough to count as confirmed.
    /// Callers bound this with their own timeout.
    async fn wait_for_confirmation(&self, tx_hash: H256) -> ClientResult<TxReceipt>;

    /// Receipt of a transaction if it has been mined
    async fn receipt(&self, tx_hash: H256) -> ClientResult<Option<TxReceipt>>;
}
