//! Point-in-time view of a derivative instance

use crate::units::FixedPoint;

use chrono::{DateTime, Utc};
use ethers::types::{Address, H256};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// The two fixed roles of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Deployer,
    Counterparty,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Deployer => f.write_str("deployer"),
            Role::Counterparty => f.write_str("counterparty"),
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "deployer" | "party-a" | "a" => Ok(Role::Deployer),
            "counterparty" | "party-b" | "b" => Ok(Role::Counterparty),
            other => Err(format!("unknown role {:?}", other)),
        }
    }
}

/// Side taken by the deployer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Position {
    Long,
    Short,
}

impl Position {
    pub fn is_long(&self) -> bool {
        matches!(self, Position::Long)
    }
}

impl FromStr for Position {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "long" => Ok(Position::Long),
            "short" => Ok(Position::Short),
            other => Err(format!("position must be long or short, got {:?}", other)),
        }
    }
}

/// Immutable snapshot of a derivative's on-chain state.
///
/// Snapshots are never mutated in place: every change produces a new value
/// that replaces the previous one as a whole.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DerivativeSnapshot {
    pub address: Address,
    /// Price feed that identifies the underlying asset
    pub underlying_asset: Address,
    pub strike_price: FixedPoint,
    pub settlement_time: DateTime<Utc>,
    pub collateral_asset: Address,
    pub collateral_amount: FixedPoint,
    pub deployer: Address,
    pub counterparty: Option<Address>,
    pub is_deployer_long: bool,
    pub deployer_deposited: bool,
    pub counterparty_deposited: bool,
    pub settled: bool,
    pub cancelled: bool,
    pub last_tx_hash: Option<H256>,
}

impl DerivativeSnapshot {
    /// Role an address would act in: the deployer, or anyone else as counterparty
    pub fn role_of(&self, address: Address) -> Role {
        if address == self.deployer {
            Role::Deployer
        } else {
            Role::Counterparty
        }
    }

    pub fn has_deposited(&self, role: Role) -> bool {
        match role {
            Role::Deployer => self.deployer_deposited,
            Role::Counterparty => self.counterparty_deposited,
        }
    }

    pub fn position(&self) -> Position {
        if self.is_deployer_long {
            Position::Long
        } else {
            Position::Short
        }
    }

    /// Copy of this snapshot with `role`'s deposit recorded
    pub fn with_deposit(&self, role: Role, tx_hash: H256) -> Self {
        let mut next = self.clone();
        match role {
            Role::Deployer => next.deployer_deposited = true,
            Role::Counterparty => next.counterparty_deposited = true,
        }
        next.last_tx_hash = Some(tx_hash);
        next
    }
}
