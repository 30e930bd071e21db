//! Gas limit and price buffering

use super::{ChainProvider, GasPrice};
use crate::error::ClientResult;

use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::U256;
use tracing::debug;

/// Gas estimator for transactions
pub struct GasEstimator {
    /// Buffer percentage for gas limit (e.g., 20 = 20% buffer)
    gas_limit_buffer_percent: u64,
    /// Buffer percentage for gas price
    gas_price_buffer_percent: u64,
}

impl GasEstimator {
    pub fn new() -> Self {
        Self {
            gas_limit_buffer_percent: 20,
            gas_price_buffer_percent: 10,
        }
    }

    /// Estimate a gas limit for the call. A revert during estimation is
    /// returned as the contract's rejection before anything is signed.
    pub async fn estimate_gas_limit(
        &self,
        provider: &ChainProvider,
        tx: &TypedTransaction,
    ) -> ClientResult<U256> {
        let estimate = provider.estimate_gas(tx).await?;
        Ok(self.buffer_limit(estimate))
    }

    pub fn buffer_limit(&self, estimate: U256) -> U256 {
        estimate + estimate * self.gas_limit_buffer_percent / 100
    }

    /// Current gas price with buffer, capped at the configured maximum
    pub async fn get_gas_price(&self, provider: &ChainProvider) -> ClientResult<GasPrice> {
        let gas_price = provider.get_gas_price().await?;
        let buffered = self.buffer_price(gas_price, provider.max_gas_price());
        debug!("Gas price for chain {}: {:?}", provider.chain_id(), buffered);
        Ok(buffered)
    }

    pub fn buffer_price(&self, gas_price: GasPrice, cap: U256) -> GasPrice {
        let bump = |v: U256| std::cmp::min(v + v * self.gas_price_buffer_percent / 100, cap);
        match gas_price {
            GasPrice::Legacy(price) => GasPrice::Legacy(bump(price)),
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                let max_fee_per_gas = bump(max_fee_per_gas);
                GasPrice::Eip1559 {
                    max_fee_per_gas,
                    max_priority_fee_per_gas: std::cmp::min(
                        bump(max_priority_fee_per_gas),
                        max_fee_per_gas,
                    ),
                }
            }
        }
    }

    /// Calculate total cost in wei
    pub fn calculate_cost(gas_limit: U256, gas_price: &GasPrice) -> U256 {
        match gas_price {
            GasPrice::Legacy(price) => gas_limit * *price,
            GasPrice::Eip1559 { max_fee_per_gas, .. } => gas_limit * *max_fee_per_gas,
        }
    }
}

impl Default for GasEstimator {
    fn default() -> Self {
        Self::new()
    }
}
