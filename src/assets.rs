//! Asset selectors and block-explorer links

use crate::config::{AssetEntry, AssetsConfig, ExplorerConfig};
use crate::error::{ClientError, ClientResult, InputError};

use ethers::types::{Address, H256};
use std::collections::HashMap;

/// Maps user-facing asset symbols to on-chain addresses and back
#[derive(Debug, Clone, Default)]
pub struct AssetRegistry {
    underlying: HashMap<String, Address>,
    collateral: HashMap<String, Address>,
    symbols: HashMap<Address, String>,
}

impl AssetRegistry {
    pub fn from_config(config: &AssetsConfig) -> ClientResult<Self> {
        let mut registry = Self::default();
        for entry in &config.underlying {
            let address = parse_entry(entry)?;
            registry.insert_underlying(&entry.symbol, address)?;
        }
        for entry in &config.collateral {
            let address = parse_entry(entry)?;
            registry.insert_collateral(&entry.symbol, address)?;
        }
        Ok(registry)
    }

    /// Register an underlying asset tracked by `price_feed`
    pub fn insert_underlying(&mut self, symbol: &str, price_feed: Address) -> ClientResult<()> {
        insert(&mut self.underlying, &mut self.symbols, "underlying", symbol, price_feed)
    }

    /// Register a collateral token
    pub fn insert_collateral(&mut self, symbol: &str, token: Address) -> ClientResult<()> {
        insert(&mut self.collateral, &mut self.symbols, "collateral", symbol, token)
    }

    /// Price feed for an underlying asset symbol
    pub fn underlying(&self, symbol: &str) -> Result<Address, InputError> {
        self.underlying
            .get(&symbol.to_uppercase())
            .copied()
            .ok_or_else(|| InputError::UnknownAsset {
                kind: "underlying",
                symbol: symbol.to_string(),
            })
    }

    /// Token address for a collateral asset symbol
    pub fn collateral(&self, symbol: &str) -> Result<Address, InputError> {
        self.collateral
            .get(&symbol.to_uppercase())
            .copied()
            .ok_or_else(|| InputError::UnknownAsset {
                kind: "collateral",
                symbol: symbol.to_string(),
            })
    }

    pub fn symbol_for(&self, address: &Address) -> Option<&str> {
        self.symbols.get(address).map(String::as_str)
    }

    /// Known symbol for an address, or the checksummed address itself
    pub fn display(&self, address: &Address) -> String {
        match self.symbol_for(address) {
            Some(symbol) => symbol.to_string(),
            None => ethers::utils::to_checksum(address, None),
        }
    }

    pub fn underlying_symbols(&self) -> Vec<&str> {
        let mut symbols: Vec<&str> = self.underlying.keys().map(String::as_str).collect();
        symbols.sort_unstable();
        symbols
    }

    pub fn collateral_symbols(&self) -> Vec<&str> {
        let mut symbols: Vec<&str> = self.collateral.keys().map(String::as_str).collect();
        symbols.sort_unstable();
        symbols
    }
}

fn parse_entry(entry: &AssetEntry) -> ClientResult<Address> {
    entry.address.parse::<Address>().map_err(|_| {
        ClientError::Config(format!(
            "asset {} has invalid address {:?}",
            entry.symbol, entry.address
        ))
    })
}

fn insert(
    selector: &mut HashMap<String, Address>,
    symbols: &mut HashMap<Address, String>,
    kind: &str,
    symbol: &str,
    address: Address,
) -> ClientResult<()> {
    let key = symbol.to_uppercase();
    if selector.contains_key(&key) {
        return Err(ClientError::Config(format!(
            "duplicate {} asset symbol {}",
            kind, symbol
        )));
    }
    if selector.values().any(|existing| *existing == address) {
        return Err(ClientError::Config(format!(
            "{} asset {} reuses address {:?}",
            kind, symbol, address
        )));
    }
    selector.insert(key.clone(), address);
    symbols.entry(address).or_insert(key);
    Ok(())
}

/// Builds block-explorer links for display
#[derive(Debug, Clone)]
pub struct Explorer {
    base_url: String,
}

impl Explorer {
    pub fn new(config: &ExplorerConfig) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn tx_url(&self, tx_hash: &H256) -> String {
        format!("{}/tx/{:?}", self.base_url, tx_hash)
    }

    pub fn address_url(&self, address: &Address) -> String {
        format!("{}/address/{:?}", self.base_url, address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> AssetRegistry {
        let mut registry = AssetRegistry::default();
        registry
            .insert_underlying("ETH", Address::repeat_byte(0x01))
            .unwrap();
        registry
            .insert_collateral("USDC", Address::repeat_byte(0x02))
            .unwrap();
        registry
            .insert_collateral("WETH", Address::repeat_byte(0x03))
            .unwrap();
        registry
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let registry = registry();
        assert_eq!(registry.collateral("usdc").unwrap(), Address::repeat_byte(0x02));
        assert_eq!(registry.underlying("Eth").unwrap(), Address::repeat_byte(0x01));
        assert_eq!(registry.collateral_symbols(), vec!["USDC", "WETH"]);
    }

    #[test]
    fn test_unknown_symbol_is_input_error() {
        let err = registry().collateral("DAI").unwrap_err();
        assert_eq!(
            err,
            InputError::UnknownAsset {
                kind: "collateral",
                symbol: "DAI".into()
            }
        );
    }

    #[test]
    fn test_selectable_assets_map_to_distinct_addresses() {
        let mut registry = registry();
        let err = registry
            .insert_collateral("ETH", Address::repeat_byte(0x02))
            .unwrap_err();
        assert!(matches!(err, ClientError::Config(_)));
    }

    #[test]
    fn test_display_falls_back_to_address() {
        let registry = registry();
        assert_eq!(registry.display(&Address::repeat_byte(0x02)), "USDC");
        let unknown = Address::repeat_byte(0xab);
        assert_eq!(
            registry.display(&unknown),
            ethers::utils::to_checksum(&unknown, None)
        );
    }

    #[test]
    fn test_explorer_links() {
        let explorer = Explorer::new(&ExplorerConfig {
            base_url: "https://testnet-zkevm.polygonscan.com/".into(),
        });
        assert_eq!(
            explorer.address_url(&Address::repeat_byte(0x11)),
            "https://testnet-zkevm.polygonscan.com/address/0x1111111111111111111111111111111111111111"
        );
        assert!(explorer
            .tx_url(&H256::repeat_byte(0x22))
            .starts_with("https://testnet-zkevm.polygonscan.com/tx/0x2222"));
    }
}
