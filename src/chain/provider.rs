//! Chain provider with multi-RPC support and automatic failover

use super::ChainReader;
use crate::config::{GasPriceStrategy, NetworkConfig};
use crate::contracts::{ContractRef, ContractRejection};
use crate::error::{ClientError, ClientResult};

use async_trait::async_trait;
use ethers::abi::Token;
use ethers::prelude::*;
use ethers::providers::{Http, Provider, ProviderError, RpcError};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

/// Multi-provider wrapper with automatic failover
pub struct ChainProvider {
    /// Network configuration
    config: NetworkConfig,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
    /// Last known block number
    last_block: RwLock<u64>,
}

impl ChainProvider {
    /// Create a new chain provider
    pub fn new(config: NetworkConfig) -> ClientResult<Self> {
        let mut http_providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(100));
                    http_providers.push(provider);
                    debug!("Added HTTP provider for chain {}: {}", config.chain_id, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(ClientError::Config(format!(
                "No valid RPC providers for chain {}",
                config.chain_id
            )));
        }

        Ok(Self {
            config,
            http_providers,
            current_provider: AtomicUsize::new(0),
            last_block: RwLock::new(0),
        })
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.config.chain_id, next);
    }

    /// Get current block number with failover
    pub async fn get_block_number(&self) -> ClientResult<u64> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_block_number().await {
                Ok(block) => {
                    let block_num = block.as_u64();
                    *self.last_block.write().await = block_num;
                    return Ok(block_num);
                }
                Err(e) => {
                    warn!(
                        "Failed to get block number from chain {}: {}",
                        self.config.chain_id, e
                    );
                    self.failover();
                }
            }
        }

        Err(ClientError::NetworkUnreachable(format!(
            "All providers for chain {} failed",
            self.config.chain_id
        )))
    }

    /// Last block number seen by this provider
    pub async fn last_block(&self) -> u64 {
        *self.last_block.read().await
    }

    /// Chain id reported by the node
    pub async fn get_chain_id(&self) -> ClientResult<u64> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_chainid().await {
                Ok(id) => return Ok(id.as_u64()),
                Err(e) => {
                    warn!("Failed to get chain id: {}", e);
                    self.failover();
                }
            }
        }

        Err(ClientError::NetworkUnreachable(
            "All providers failed to report chain id".to_string(),
        ))
    }

    /// Execute `eth_call`, failing over only on transport errors
    pub async fn eth_call(&self, tx: &TypedTransaction) -> ClientResult<Bytes> {
        for _ in 0..self.http_providers.len() {
            match self.http().call(tx, None).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) if RpcError::as_error_response(&e).is_some() => {
                    return Err(classify_rpc_error(&e));
                }
                Err(e) => {
                    warn!("eth_call failed on chain {}: {}", self.config.chain_id, e);
                    self.failover();
                }
            }
        }

        Err(ClientError::NetworkUnreachable(format!(
            "All providers for chain {} failed eth_call",
            self.config.chain_id
        )))
    }

    /// Get transaction receipt
    pub async fn get_transaction_receipt(
        &self,
        tx_hash: H256,
    ) -> ClientResult<Option<TransactionReceipt>> {
        self.http()
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(|e| ClientError::NetworkUnreachable(e.to_string()))
    }

    /// Next nonce for an account, counting mempool transactions
    pub async fn get_pending_nonce(&self, address: Address) -> ClientResult<U256> {
        self.http()
            .get_transaction_count(address, Some(BlockNumber::Pending.into()))
            .await
            .map_err(|e| ClientError::NetworkUnreachable(e.to_string()))
    }

    pub async fn get_balance(&self, address: Address) -> ClientResult<U256> {
        self.http()
            .get_balance(address, None)
            .await
            .map_err(|e| ClientError::NetworkUnreachable(e.to_string()))
    }

    /// Estimate gas for a transaction; reverts surface as contract rejections
    pub async fn estimate_gas(&self, tx: &TypedTransaction) -> ClientResult<U256> {
        self.http()
            .estimate_gas(tx, None)
            .await
            .map_err(|e| classify_rpc_error(&e))
    }

    /// Broadcast a signed transaction
    pub async fn send_raw_transaction(&self, raw: Bytes) -> ClientResult<H256> {
        self.http()
            .send_raw_transaction(raw)
            .await
            .map(|pending| pending.tx_hash())
            .map_err(|e| classify_rpc_error(&e))
    }

    /// Get current gas price based on network strategy
    pub async fn get_gas_price(&self) -> ClientResult<GasPrice> {
        match self.config.gas_price_strategy {
            GasPriceStrategy::Legacy => {
                let price = self
                    .http()
                    .get_gas_price()
                    .await
                    .map_err(|e| ClientError::NetworkUnreachable(e.to_string()))?;
                Ok(GasPrice::Legacy(price))
            }
            GasPriceStrategy::Eip1559 => {
                let (max_fee, priority_fee) = self.estimate_eip1559_fees().await?;
                Ok(GasPrice::Eip1559 {
                    max_fee_per_gas: max_fee,
                    max_priority_fee_per_gas: priority_fee,
                })
            }
        }
    }

    /// Estimate EIP-1559 fees
    async fn estimate_eip1559_fees(&self) -> ClientResult<(U256, U256)> {
        let block = self
            .http()
            .get_block(BlockNumber::Latest)
            .await
            .map_err(|e| ClientError::NetworkUnreachable(e.to_string()))?
            .ok_or_else(|| ClientError::NetworkUnreachable("No latest block".to_string()))?;

        let base_fee = block
            .base_fee_per_gas
            .ok_or_else(|| ClientError::Config("Network has no base fee; use legacy gas".to_string()))?;

        let priority_fee = U256::from(2_000_000_000u64); // 2 gwei default

        // Max fee = 2 * base_fee + priority_fee (buffer for block variability)
        let max_fee = base_fee * 2 + priority_fee;

        Ok((std::cmp::min(max_fee, self.max_gas_price()), priority_fee))
    }

    /// Configured gas price ceiling in wei
    pub fn max_gas_price(&self) -> U256 {
        U256::from(self.config.max_gas_price_gwei) * U256::from(1_000_000_000u64)
    }

    /// Health check
    pub async fn health_check(&self) -> bool {
        match self.get_block_number().await {
            Ok(_) => true,
            Err(e) => {
                error!("Health check failed for chain {}: {}", self.config.chain_id, e);
                false
            }
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.config.chain_id
    }

    pub fn confirmation_blocks(&self) -> u64 {
        self.config.confirmation_blocks
    }

    pub fn receipt_poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.receipt_poll_interval_ms)
    }
}

#[async_trait]
impl ChainReader for ChainProvider {
    async fn call(
        &self,
        contract: &ContractRef,
        function: &str,
        args: &[Token],
    ) -> ClientResult<Vec<Token>> {
        let function = contract.function(function)?;
        let data = function
            .encode_input(args)
            .map_err(|e| ClientError::ReadFailed(format!("{}: {}", function.name, e)))?;

        let tx: TypedTransaction = TransactionRequest::new()
            .to(contract.address())
            .data(data)
            .into();

        let output = self.eth_call(&tx).await?;
        if output.is_empty() {
            // No code at the address, or a function the contract does not have
            return Err(ClientError::ReadFailed(format!(
                "{} returned no data from {}",
                function.name, contract
            )));
        }

        function
            .decode_output(&output)
            .map_err(|e| ClientError::ReadFailed(format!("{}: {}", function.name, e)))
    }
}

/// Map a node error to the client's error taxonomy
pub fn classify_rpc_error(err: &ProviderError) -> ClientError {
    let Some(response) = RpcError::as_error_response(err) else {
        return ClientError::NetworkUnreachable(err.to_string());
    };

    if let Some(rejection) = response
        .as_revert_data()
        .and_then(|data| ContractRejection::from_revert_data(&data))
    {
        return ClientError::ContractLevelRejection(rejection);
    }

    classify_message(&response.message)
}

/// Classify a node or wallet error message
pub fn classify_message(message: &str) -> ClientError {
    let lower = message.to_lowercase();
    if lower.contains("insufficient funds") {
        ClientError::InsufficientFunds(message.to_string())
    } else if lower.contains("user denied") || lower.contains("user rejected") {
        ClientError::SignatureRejected(message.to_string())
    } else if lower.contains("execution reverted") || lower.contains("revert") {
        ClientError::ContractLevelRejection(ContractRejection::Reason(message.to_string()))
    } else {
        ClientError::Internal(format!("RPC error: {}", message))
    }
}

/// Gas price types
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GasPrice {
    Legacy(U256),
    Eip1559 {
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    },
}
