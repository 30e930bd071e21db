//! Confirmation tracking for submitted transactions
//!
//! A transaction counts as confirmed once its receipt is `confirmation_blocks`
//! deep and a second receipt lookup still finds it included. The tracker polls
//! without a deadline of its own; callers wrap it in `tokio::time::timeout`.

use super::{ChainProvider, TxReceipt};
use crate::error::ClientResult;

use ethers::types::H256;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Tracks confirmation depth for transactions on the configured chain
pub struct ConfirmationTracker {
    provider: Arc<ChainProvider>,
    /// Confirmed receipts (cached to avoid re-checking)
    confirmed: RwLock<HashMap<H256, TxReceipt>>,
}

impl ConfirmationTracker {
    pub fn new(provider: Arc<ChainProvider>) -> Self {
        Self {
            provider,
            confirmed: RwLock::new(HashMap::new()),
        }
    }

    /// Poll until the transaction is confirmed. A failed lookup is logged and
    /// retried on the next tick; the transaction is already out.
    pub async fn wait(&self, tx_hash: H256) -> ClientResult<TxReceipt> {
        let interval = self.provider.receipt_poll_interval();
        loop {
            match self.check(tx_hash).await {
                Ok(Some(receipt)) => return Ok(receipt),
                Ok(None) => {}
                Err(e) => warn!("Confirmation check for {:?} failed, retrying: {}", tx_hash, e),
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// One confirmation check; `None` while the transaction is not deep enough
    pub async fn check(&self, tx_hash: H256) -> ClientResult<Option<TxReceipt>> {
        if let Some(receipt) = self.confirmed.read().await.get(&tx_hash) {
            return Ok(Some(receipt.clone()));
        }

        let Some(receipt) = self.provider.get_transaction_receipt(tx_hash).await? else {
            debug!("Transaction {:?} not yet mined", tx_hash);
            return Ok(None);
        };
        let receipt = TxReceipt::from(receipt);

        let current_block = self.provider.get_block_number().await?;
        let confirmations = current_block.saturating_sub(receipt.block_number) + 1;
        let required = self.provider.confirmation_blocks();

        if confirmations < required {
            debug!(
                "Transaction {:?} has {} / {} confirmations",
                tx_hash, confirmations, required
            );
            return Ok(None);
        }

        if !self.verify_inclusion(tx_hash, receipt.block_number).await? {
            warn!(
                "Transaction {:?} no longer included at block {}",
                tx_hash, receipt.block_number
            );
            return Ok(None);
        }

        info!(
            "Transaction {:?} confirmed in block {} ({} confirmations, success={})",
            tx_hash, receipt.block_number, confirmations, receipt.success
        );
        self.confirmed.write().await.insert(tx_hash, receipt.clone());
        Ok(Some(receipt))
    }

    /// Verify a transaction is still included where it was first seen
    async fn verify_inclusion(&self, tx_hash: H256, block_number: u64) -> ClientResult<bool> {
        match self.provider.get_transaction_receipt(tx_hash).await? {
            Some(receipt) => Ok(receipt.block_number.map(|b| b.as_u64()) == Some(block_number)),
            None => Ok(false),
        }
    }

    pub async fn receipt(&self, tx_hash: H256) -> ClientResult<Option<TxReceipt>> {
        if let Some(receipt) = self.confirmed.read().await.get(&tx_hash) {
            return Ok(Some(receipt.clone()));
        }
        self.provider
            .get_transaction_receipt(tx_hash)
            .await
            .map(|r| r.map(TxReceipt::from))
    }

    /// Clear old cache entries (call periodically)
    pub async fn cleanup_cache(&self, max_entries: usize) {
        let mut confirmed = self.confirmed.write().await;
        if confirmed.len() > max_entries {
            let to_remove: Vec<_> = confirmed
                .keys()
                .take(confirmed.len() / 2)
                .cloned()
                .collect();
            for k in to_remove {
                confirmed.remove(&k);
            }
        }
    }
}

/// Confirmation depth suggested for well-known chains
pub fn recommended_confirmations(chain_id: u64) -> u64 {
    match chain_id {
        1 => 12,
        11155111 => 3,
        137 => 64,
        // Polygon zkEVM mainnet and testnets
        1101 | 1442 | 2442 => 1,
        42161 | 421614 | 10 | 11155420 | 8453 | 84532 => 1,
        _ => 2,
    }
}
