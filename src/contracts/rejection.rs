//! Decoding of revert data into the derivative contract's named errors

use ethers::abi::ParamType;
use ethers::utils::id;
use lazy_static::lazy_static;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

/// Named error conditions raised by the custom derivative contract
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum ContractRejection {
    AddressCannotBeBothParties,
    BothPartiesNeedToAgreeToCancel,
    CollateralFullyDeposited,
    CollateralNotFullyDeposited,
    ContractAlreadySettled,
    ContractCancelled,
    ContractNotCancelled,
    CounterpartyAlreadyAgreed,
    InvalidAddress,
    NeedsToBeMoreThanZero,
    NotEnoughCollateral,
    OnlyDepositsByPartyA,
    OnlyPartiesCanDeposit,
    OnlyPartyACanCall,
    OnlyPartyBCanCall,
    SettlementTimeNeedsToBeInFuture,
    SettlementTimeNotReached,
    TransferFailed,
    /// `Error(string)` revert, e.g. from the collateral token
    Reason(String),
    /// Revert with an unrecognised 4-byte selector
    Unknown(String),
}

const NAMED: [ContractRejection; 18] = [
    ContractRejection::AddressCannotBeBothParties,
    ContractRejection::BothPartiesNeedToAgreeToCancel,
    ContractRejection::CollateralFullyDeposited,
    ContractRejection::CollateralNotFullyDeposited,
    ContractRejection::ContractAlreadySettled,
    ContractRejection::ContractCancelled,
    ContractRejection::ContractNotCancelled,
    ContractRejection::CounterpartyAlreadyAgreed,
    ContractRejection::InvalidAddress,
    ContractRejection::NeedsToBeMoreThanZero,
    ContractRejection::NotEnoughCollateral,
    ContractRejection::OnlyDepositsByPartyA,
    ContractRejection::OnlyPartiesCanDeposit,
    ContractRejection::OnlyPartyACanCall,
    ContractRejection::OnlyPartyBCanCall,
    ContractRejection::SettlementTimeNeedsToBeInFuture,
    ContractRejection::SettlementTimeNotReached,
    ContractRejection::TransferFailed,
];

const ERROR_STRING_SELECTOR: [u8; 4] = [0x08, 0xc3, 0x79, 0xa0];

lazy_static! {
    static ref SELECTORS: HashMap<[u8; 4], ContractRejection> = NAMED
        .iter()
        .map(|rejection| (id(rejection.signature()), rejection.clone()))
        .collect();
}

impl ContractRejection {
    /// Error name without the contract prefix
    pub fn name(&self) -> &str {
        match self {
            ContractRejection::AddressCannotBeBothParties => "AddressCannotBeBothParties",
            ContractRejection::BothPartiesNeedToAgreeToCancel => "BothPartiesNeedToAgreeToCancel",
            ContractRejection::CollateralFullyDeposited => "CollateralFullyDeposited",
            ContractRejection::CollateralNotFullyDeposited => "CollateralNotFullyDeposited",
            ContractRejection::ContractAlreadySettled => "ContractAlreadySettled",
            ContractRejection::ContractCancelled => "ContractCancelled",
            ContractRejection::ContractNotCancelled => "ContractNotCancelled",
            ContractRejection::CounterpartyAlreadyAgreed => "CounterpartyAlreadyAgreed",
            ContractRejection::InvalidAddress => "InvalidAddress",
            ContractRejection::NeedsToBeMoreThanZero => "NeedsToBeMoreThanZero",
            ContractRejection::NotEnoughCollateral => "NotEnoughCollateral",
            ContractRejection::OnlyDepositsByPartyA => "OnlyDepositsByPartyA",
            ContractRejection::OnlyPartiesCanDeposit => "OnlyPartiesCanDeposit",
            ContractRejection::OnlyPartyACanCall => "OnlyPartyACanCall",
            ContractRejection::OnlyPartyBCanCall => "OnlyPartyBCanCall",
            ContractRejection::SettlementTimeNeedsToBeInFuture => {
                "SettlementTimeNeedsToBeInFuture"
            }
            ContractRejection::SettlementTimeNotReached => "SettlementTimeNotReached",
            ContractRejection::TransferFailed => "TransferFailed",
            ContractRejection::Reason(reason) => reason,
            ContractRejection::Unknown(selector) => selector,
        }
    }

    /// Solidity error signature, e.g. `CustomDerivative__TransferFailed()`
    fn signature(&self) -> String {
        format!("CustomDerivative__{}()", self.name())
    }

    /// Decode raw revert data returned by a node
    pub fn from_revert_data(data: &[u8]) -> Option<Self> {
        if data.len() < 4 {
            return None;
        }
        let mut selector = [0u8; 4];
        selector.copy_from_slice(&data[..4]);

        if selector == ERROR_STRING_SELECTOR {
            let reason = ethers::abi::decode(&[ParamType::String], &data[4..])
                .ok()
                .and_then(|mut tokens| tokens.pop())
                .and_then(|token| token.into_string())
                .unwrap_or_default();
            return Some(ContractRejection::Reason(reason));
        }

        Some(
            SELECTORS
                .get(&selector)
                .cloned()
                .unwrap_or_else(|| ContractRejection::Unknown(format!("0x{}", hex::encode(selector)))),
        )
    }
}

impl fmt::Display for ContractRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContractRejection::Reason(reason) => write!(f, "reverted: {}", reason),
            ContractRejection::Unknown(selector) => write!(f, "unknown error {}", selector),
            named => write!(f, "CustomDerivative__{}", named.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::abi::Token;

    #[test]
    fn test_decodes_named_error() {
        let data = id("CustomDerivative__NotEnoughCollateral()");
        assert_eq!(
            ContractRejection::from_revert_data(&data),
            Some(ContractRejection::NotEnoughCollateral)
        );
        assert_eq!(
            ContractRejection::NotEnoughCollateral.to_string(),
            "CustomDerivative__NotEnoughCollateral"
        );
    }

    #[test]
    fn test_every_named_error_has_distinct_selector() {
        assert_eq!(SELECTORS.len(), NAMED.len());
    }

    #[test]
    fn test_decodes_error_string() {
        let mut data = ERROR_STRING_SELECTOR.to_vec();
        data.extend(ethers::abi::encode(&[Token::String(
            "ERC20: insufficient allowance".into(),
        )]));
        assert_eq!(
            ContractRejection::from_revert_data(&data),
            Some(ContractRejection::Reason("ERC20: insufficient allowance".into()))
        );
    }

    #[test]
    fn test_unknown_selector_and_short_data() {
        assert_eq!(
            ContractRejection::from_revert_data(&[0xde, 0xad, 0xbe, 0xef]),
            Some(ContractRejection::Unknown("0xdeadbeef".into()))
        );
        assert_eq!(ContractRejection::from_revert_data(&[0x01]), None);
    }
}
