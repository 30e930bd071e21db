//! Local-key signer submitting transactions through the chain provider
//!
//! Every call is estimated before signing, so a call the contract would
//! reject fails with the contract's reason and nothing is broadcast. A
//! transaction is sent once; the client never resubmits on its own.

use super::{
    ChainProvider, ConfirmationTracker, ContractCall, GasEstimator, GasPrice, SigningProvider,
    TxReceipt,
};
use crate::error::{ClientError, ClientResult};

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, info, warn};

const SEND_TIMEOUT: Duration = Duration::from_secs(30);
const RECEIPT_CACHE_ENTRIES: usize = 1024;

/// Signs with a locally held key
pub struct WalletSigner {
    provider: Arc<ChainProvider>,
    tracker: ConfirmationTracker,
    gas_estimator: GasEstimator,
    /// Connected wallet; `None` means read-only
    wallet: RwLock<Option<LocalWallet>>,
}

impl WalletSigner {
    pub fn new(provider: Arc<ChainProvider>, wallet: Option<LocalWallet>) -> Self {
        if let Some(ref wallet) = wallet {
            info!("Signer initialized with wallet: {:?}", wallet.address());
        }
        Self {
            tracker: ConfirmationTracker::new(provider.clone()),
            provider,
            gas_estimator: GasEstimator::new(),
            wallet: RwLock::new(wallet),
        }
    }

    /// Build a signer from the key held in the named environment variable.
    /// An unset variable leaves the signer without an identity.
    pub fn from_env(provider: Arc<ChainProvider>, key_env: Option<&str>) -> ClientResult<Self> {
        let wallet = match key_env {
            Some(name) => load_wallet(name)?,
            None => None,
        };
        Ok(Self::new(provider, wallet))
    }

    /// Replace the connected wallet
    pub async fn connect(&self, wallet: LocalWallet) {
        info!("Wallet connected: {:?}", wallet.address());
        let wallet = wallet.with_chain_id(self.provider.chain_id());
        *self.wallet.write().await = Some(wallet);
    }

    pub async fn disconnect(&self) {
        if self.wallet.write().await.take().is_some() {
            info!("Wallet disconnected");
        }
    }

    async fn connected_wallet(&self) -> ClientResult<LocalWallet> {
        self.wallet
            .read()
            .await
            .clone()
            .ok_or(ClientError::NoSigningIdentity)
    }

    /// Build the transaction for a call with gas price already set
    fn build_tx(call: &ContractCall, from: Address, nonce: U256, gas_price: &GasPrice) -> TypedTransaction {
        match gas_price {
            GasPrice::Legacy(price) => TransactionRequest::new()
                .from(from)
                .to(call.to)
                .data(call.data.clone())
                .nonce(nonce)
                .gas_price(*price)
                .into(),
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => Eip1559TransactionRequest::new()
                .from(from)
                .to(call.to)
                .data(call.data.clone())
                .nonce(nonce)
                .max_fee_per_gas(*max_fee_per_gas)
                .max_priority_fee_per_gas(*max_priority_fee_per_gas)
                .into(),
        }
    }

    /// Send a signed transaction whose hash is already known. A send that
    /// times out or drops its connection may still have reached the node.
    async fn broadcast(
        &self,
        raw: Bytes,
        tx_hash: H256,
        function: &'static str,
        limit: Duration,
    ) -> ClientResult<H256> {
        match timeout(limit, self.provider.send_raw_transaction(raw)).await {
            Ok(Ok(sent)) => {
                if sent != tx_hash {
                    warn!("Node reported {:?} for {} signed as {:?}", sent, function, tx_hash);
                }
                Ok(sent)
            }
            Ok(Err(ClientError::NetworkUnreachable(reason))) => {
                Err(ClientError::SubmissionUnacknowledged { tx_hash, reason })
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ClientError::SubmissionUnacknowledged {
                tx_hash,
                reason: format!("sending {} timed out after {:?}", function, limit),
            }),
        }
    }
}

fn load_wallet(key_env: &str) -> ClientResult<Option<LocalWallet>> {
    match std::env::var(key_env) {
        Ok(key) => key
            .trim()
            .parse::<LocalWallet>()
            .map(Some)
            .map_err(|e| ClientError::Config(format!("Invalid private key in {}: {}", key_env, e))),
        Err(_) => {
            warn!("{} is not set - running without a signing identity", key_env);
            Ok(None)
        }
    }
}

#[async_trait]
impl SigningProvider for WalletSigner {
    async fn identity(&self) -> ClientResult<Option<Address>> {
        Ok(self.wallet.read().await.as_ref().map(|w| w.address()))
    }

    async fn network(&self) -> ClientResult<u64> {
        self.provider.get_chain_id().await
    }

    async fn submit(&self, call: ContractCall) -> ClientResult<H256> {
        let wallet = self
            .connected_wallet()
            .await?
            .with_chain_id(self.provider.chain_id());
        let from = wallet.address();

        let nonce = self.provider.get_pending_nonce(from).await?;
        let gas_price = self.gas_estimator.get_gas_price(&self.provider).await?;
        let mut tx = Self::build_tx(&call, from, nonce, &gas_price);
        tx.set_chain_id(self.provider.chain_id());

        let gas_limit = self
            .gas_estimator
            .estimate_gas_limit(&self.provider, &tx)
            .await?;
        tx.set_gas(gas_limit);

        let cost = GasEstimator::calculate_cost(gas_limit, &gas_price);
        let balance = self.provider.get_balance(from).await?;
        if balance < cost {
            return Err(ClientError::InsufficientFunds(format!(
                "{} needs up to {} wei for gas, balance is {}",
                call.function, cost, balance
            )));
        }

        let signature = wallet
            .sign_transaction(&tx)
            .await
            .map_err(|e| ClientError::SignatureRejected(e.to_string()))?;
        let raw = tx.rlp_signed(&signature);
        let tx_hash = tx.hash(&signature);

        debug!(
            "Sending {} {:?} to {:?} (nonce {}, gas {})",
            call.function, tx_hash, call.to, nonce, gas_limit
        );
        let tx_hash = self
            .broadcast(raw, tx_hash, call.function, SEND_TIMEOUT)
            .await?;

        info!("Transaction sent: {} {:?}", call.function, tx_hash);
        crate::metrics::record_tx_submitted(call.function);
        Ok(tx_hash)
    }

    async fn wait_for_confirmation(&self, tx_hash: H256) -> ClientResult<TxReceipt> {
        let receipt = self.tracker.wait(tx_hash).await?;
        crate::metrics::record_block_height(self.provider.chain_id(), self.provider.last_block().await);
        self.tracker.cleanup_cache(RECEIPT_CACHE_ENTRIES).await;
        Ok(receipt)
    }

    async fn receipt(&self, tx_hash: H256) -> ClientResult<Option<TxReceipt>> {
        self.tracker.receipt(tx_hash).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GasPriceStrategy, NetworkConfig};

    const DEV_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    fn provider() -> Arc<ChainProvider> {
        provider_at("http://127.0.0.1:1")
    }

    fn provider_at(url: &str) -> Arc<ChainProvider> {
        Arc::new(
            ChainProvider::new(NetworkConfig {
                chain_id: 1442,
                name: "test".into(),
                rpc_urls: vec![url.into()],
                confirmation_blocks: 1,
                gas_price_strategy: GasPriceStrategy::Legacy,
                max_gas_price_gwei: 50,
                receipt_poll_interval_ms: 100,
            })
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_without_wallet_nothing_is_sent() {
        let signer = WalletSigner::new(provider(), None);
        assert_eq!(signer.identity().await.unwrap(), None);

        let call = ContractCall {
            to: Address::repeat_byte(1),
            data: Bytes::from(vec![0u8; 4]),
            function: "approve",
        };
        let err = signer.submit(call).await.unwrap_err();
        assert!(matches!(err, ClientError::NoSigningIdentity));
    }

    #[tokio::test]
    async fn test_wallet_from_env() {
        std::env::set_var("DERIVATIVE_SIGNER_TEST_KEY", DEV_KEY);
        let signer =
            WalletSigner::from_env(provider(), Some("DERIVATIVE_SIGNER_TEST_KEY")).unwrap();
        let expected: Address = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266".parse().unwrap();
        assert_eq!(signer.identity().await.unwrap(), Some(expected));

        signer.disconnect().await;
        assert_eq!(signer.identity().await.unwrap(), None);

        signer.connect(DEV_KEY.parse::<LocalWallet>().unwrap()).await;
        assert_eq!(signer.identity().await.unwrap(), Some(expected));
    }

    #[test]
    fn test_missing_env_means_read_only() {
        let signer =
            WalletSigner::from_env(provider(), Some("DERIVATIVE_SIGNER_TEST_UNSET")).unwrap();
        assert!(signer.wallet.try_read().unwrap().is_none());
    }

    #[test]
    fn test_invalid_key_is_a_config_error() {
        std::env::set_var("DERIVATIVE_SIGNER_TEST_BAD", "0x1234");
        let err = WalletSigner::from_env(provider(), Some("DERIVATIVE_SIGNER_TEST_BAD"))
            .err()
            .unwrap();
        assert!(matches!(err, ClientError::Config(_)));
    }

    #[tokio::test]
    async fn test_unanswered_send_reports_local_hash() {
        // Connections queue in the backlog and never get a response
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let signer = WalletSigner::new(provider_at(&url), None);

        let wallet = DEV_KEY.parse::<LocalWallet>().unwrap().with_chain_id(1442u64);
        let call = ContractCall {
            to: Address::repeat_byte(1),
            data: Bytes::from(vec![0u8; 4]),
            function: "approve",
        };
        let mut tx = WalletSigner::build_tx(
            &call,
            wallet.address(),
            U256::zero(),
            &GasPrice::Eip1559 {
                max_fee_per_gas: U256::from(100),
                max_priority_fee_per_gas: U256::from(2),
            },
        );
        tx.set_chain_id(1442u64);
        tx.set_gas(U256::from(60_000));
        let signature = wallet.sign_transaction(&tx).await.unwrap();
        let raw = tx.rlp_signed(&signature);
        let tx_hash = tx.hash(&signature);
        assert_eq!(tx_hash, H256::from(ethers::utils::keccak256(&raw)));

        let err = signer
            .broadcast(raw, tx_hash, "approve", Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClientError::SubmissionUnacknowledged { tx_hash: sent, .. } if sent == tx_hash
        ));
        assert!(err.funds_may_have_moved());
        drop(listener);
    }

    #[test]
    fn test_build_eip1559_tx() {
        let call = ContractCall {
            to: Address::repeat_byte(1),
            data: Bytes::from(vec![1, 2, 3, 4]),
            function: "deposit",
        };
        let tx = WalletSigner::build_tx(
            &call,
            Address::repeat_byte(2),
            U256::from(7),
            &GasPrice::Eip1559 {
                max_fee_per_gas: U256::from(100),
                max_priority_fee_per_gas: U256::from(2),
            },
        );
        assert!(matches!(tx, TypedTransaction::Eip1559(_)));
        assert_eq!(tx.nonce(), Some(&U256::from(7)));
        assert_eq!(tx.data(), Some(&call.data));
    }
}
