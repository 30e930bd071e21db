//! Fixed interfaces of the external contracts
//!
//! The client does not define or version these interfaces. The ABIs below
//! mirror the deployed custom derivative, its factory and the ERC-20 token
//! used as collateral.

mod rejection;

pub use rejection::ContractRejection;

use crate::chain::ContractCall;
use crate::error::{ClientError, ClientResult};

use ethers::abi::{Abi, Function, Token};
use ethers::types::{Address, Bytes, U256};
use lazy_static::lazy_static;
use std::fmt;

lazy_static! {
    pub static ref CUSTOM_DERIVATIVE_ABI: Abi = ethers::abi::parse_abi(&[
        "function DEVELOPER_FEE_PERCENTAGE() external view returns (uint256)",
        "function strikePrice() external view returns (uint256)",
        "function settlementTime() external view returns (uint256)",
        "function collateralToken() external view returns (address)",
        "function collateralAmount() external view returns (uint256)",
        "function priceFeed() external view returns (address)",
        "function partyA() external view returns (address)",
        "function partyB() external view returns (address)",
        "function isPartyALong() external view returns (bool)",
        "function partyACollateral() external view returns (uint256)",
        "function partyBCollateral() external view returns (uint256)",
        "function partyACancel() external view returns (bool)",
        "function partyBCancel() external view returns (bool)",
        "function counterpartyAgreed() external view returns (bool)",
        "function contractSettled() external view returns (bool)",
        "function contractCancelled() external view returns (bool)",
        "function depositCollateralPartyA(uint256 amount) external",
        "function agreeToContractAndDeposit(uint256 amount) external",
        "function settleContract() external",
        "function cancelDueToIncompleteDeposit() external",
        "function setCancelPartyA() external",
        "function setCancelPartyB() external",
        "event CollateralDeposited(address depositor, uint256 amount)",
        "event CollateralWithdrawn(address withdrawer, uint256 amount)",
        "event ContractCancelled()",
        "event ContractSettled(uint256 finalPrice)",
        "event CounterpartyEntered(address partyB)",
        "event PartyRequestedCancellation(address party)",
    ])
    .expect("custom derivative ABI is well-formed");

    pub static ref DERIVATIVE_FACTORY_ABI: Abi = ethers::abi::parse_abi(&[
        "function createCustomDerivative(address priceFeed, uint256 strikePrice, uint256 settlementTime, address collateralToken, uint256 collateralAmount, bool isPartyALong) external returns (address)",
        "event DerivativeCreated(address derivativeContract, address partyA)",
    ])
    .expect("factory ABI is well-formed");

    pub static ref ERC20_ABI: Abi = ethers::abi::parse_abi(&[
        "function allowance(address owner, address spender) external view returns (uint256)",
        "function approve(address spender, uint256 amount) external returns (bool)",
        "function balanceOf(address account) external view returns (uint256)",
        "function decimals() external view returns (uint8)",
        "function symbol() external view returns (string)",
        "event Approval(address indexed owner, address indexed spender, uint256 value)",
        "event Transfer(address indexed from, address indexed to, uint256 value)",
    ])
    .expect("ERC-20 ABI is well-formed");
}

/// Which fixed interface a contract exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interface {
    CustomDerivative,
    DerivativeFactory,
    Erc20,
}

impl Interface {
    pub fn abi(&self) -> &'static Abi {
        match self {
            Interface::CustomDerivative => &CUSTOM_DERIVATIVE_ABI,
            Interface::DerivativeFactory => &DERIVATIVE_FACTORY_ABI,
            Interface::Erc20 => &ERC20_ABI,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Interface::CustomDerivative => "CustomDerivative",
            Interface::DerivativeFactory => "DerivativeFactory",
            Interface::Erc20 => "ERC20",
        }
    }
}

/// A deployed contract instance and the interface used to talk to it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContractRef {
    address: Address,
    interface: Interface,
}

impl ContractRef {
    pub const fn new(address: Address, interface: Interface) -> Self {
        Self { address, interface }
    }

    pub const fn derivative(address: Address) -> Self {
        Self::new(address, Interface::CustomDerivative)
    }

    pub const fn factory(address: Address) -> Self {
        Self::new(address, Interface::DerivativeFactory)
    }

    pub const fn erc20(address: Address) -> Self {
        Self::new(address, Interface::Erc20)
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn interface(&self) -> Interface {
        self.interface
    }

    /// Look up a function of this contract's interface
    pub fn function(&self, name: &str) -> ClientResult<&'static Function> {
        self.interface.abi().function(name).map_err(|_| {
            ClientError::Internal(format!(
                "{} has no function {}",
                self.interface.name(),
                name
            ))
        })
    }

    /// Encode a state-changing call against this contract
    pub fn call(&self, name: &'static str, args: &[Token]) -> ClientResult<ContractCall> {
        let data = self
            .function(name)?
            .encode_input(args)
            .map_err(|e| ClientError::Internal(format!("Failed to encode {}: {}", name, e)))?;

        Ok(ContractCall {
            to: self.address,
            data: Bytes::from(data),
            function: name,
        })
    }
}

impl fmt::Display for ContractRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{:?}", self.interface.name(), self.address)
    }
}

/// Take the single return value of a view call
pub fn single(function: &str, mut tokens: Vec<Token>) -> ClientResult<Token> {
    if tokens.len() != 1 {
        return Err(ClientError::ReadFailed(format!(
            "{} returned {} values, expected 1",
            function,
            tokens.len()
        )));
    }
    Ok(tokens.remove(0))
}

pub fn as_uint(function: &str, token: Token) -> ClientResult<U256> {
    token
        .into_uint()
        .ok_or_else(|| ClientError::ReadFailed(format!("{} did not return a uint", function)))
}

pub fn as_address(function: &str, token: Token) -> ClientResult<Address> {
    token
        .into_address()
        .ok_or_else(|| ClientError::ReadFailed(format!("{} did not return an address", function)))
}

pub fn as_bool(function: &str, token: Token) -> ClientResult<bool> {
    token
        .into_bool()
        .ok_or_else(|| ClientError::ReadFailed(format!("{} did not return a bool", function)))
}
