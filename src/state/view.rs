//! Human-readable rendering of a snapshot

use super::snapshot::{DerivativeSnapshot, Role};
use crate::assets::{AssetRegistry, Explorer};

use ethers::types::Address;
use serde::Serialize;
use std::fmt;

/// Which deposit actions the connected identity may take
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DepositActions {
    pub as_deployer: bool,
    pub as_counterparty: bool,
}

impl DepositActions {
    /// Deployer may deposit iff connected as deployer and not yet deposited;
    /// anyone else may deposit as counterparty until the counterparty has.
    pub fn for_identity(snapshot: &DerivativeSnapshot, identity: Option<Address>) -> Self {
        match identity {
            None => Self {
                as_deployer: false,
                as_counterparty: false,
            },
            Some(identity) => {
                let role = snapshot.role_of(identity);
                let open = !snapshot.settled && !snapshot.cancelled;
                Self {
                    as_deployer: open
                        && role == Role::Deployer
                        && !snapshot.has_deposited(Role::Deployer),
                    as_counterparty: open
                        && role == Role::Counterparty
                        && !snapshot.has_deposited(Role::Counterparty),
                }
            }
        }
    }
}

/// Snapshot rendered for display
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotView {
    pub address: String,
    pub address_url: String,
    pub underlying_asset: String,
    pub strike_price: String,
    pub settlement_time: String,
    pub collateral_asset: String,
    pub collateral_amount: String,
    pub deployer: String,
    pub counterparty: Option<String>,
    pub position: &'static str,
    pub deployer_deposited: &'static str,
    pub counterparty_deposited: &'static str,
    pub settled: bool,
    pub cancelled: bool,
    pub tx_url: Option<String>,
    /// Set while a local change awaits the next chain read
    pub unconfirmed: bool,
    pub actions: DepositActions,
}

impl SnapshotView {
    pub fn render(
        snapshot: &DerivativeSnapshot,
        assets: &AssetRegistry,
        explorer: &Explorer,
        identity: Option<Address>,
        unconfirmed: bool,
    ) -> Self {
        Self {
            address: format!("{:?}", snapshot.address),
            address_url: explorer.address_url(&snapshot.address),
            underlying_asset: assets.display(&snapshot.underlying_asset),
            strike_price: snapshot.strike_price.to_string(),
            settlement_time: snapshot.settlement_time.to_rfc3339(),
            collateral_asset: assets.display(&snapshot.collateral_asset),
            collateral_amount: snapshot.collateral_amount.to_string(),
            deployer: format!("{:?}", snapshot.deployer),
            counterparty: snapshot.counterparty.map(|c| format!("{:?}", c)),
            position: if snapshot.is_deployer_long { "Long" } else { "Short" },
            deployer_deposited: yes_no(snapshot.deployer_deposited),
            counterparty_deposited: yes_no(snapshot.counterparty_deposited),
            settled: snapshot.settled,
            cancelled: snapshot.cancelled,
            tx_url: snapshot.last_tx_hash.map(|h| explorer.tx_url(&h)),
            unconfirmed,
            actions: DepositActions::for_identity(snapshot, identity),
        }
    }
}

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "Yes"
    } else {
        "No"
    }
}

impl fmt::Display for SnapshotView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Contract Address:       {} ({})", self.address, self.address_url)?;
        writeln!(f, "Underlying Asset:       {}", self.underlying_asset)?;
        writeln!(f, "Strike Price:           {}", self.strike_price)?;
        writeln!(f, "Settlement Time:        {}", self.settlement_time)?;
        writeln!(f, "Collateral Asset:       {}", self.collateral_asset)?;
        writeln!(f, "Collateral Amount:      {}", self.collateral_amount)?;
        writeln!(f, "Deployer:               {}", self.deployer)?;
        if let Some(ref counterparty) = self.counterparty {
            writeln!(f, "Counterparty:           {}", counterparty)?;
        }
        writeln!(f, "Position:               {}", self.position)?;
        writeln!(f, "Deployer Deposited:     {}", self.deployer_deposited)?;
        writeln!(f, "Counterparty Deposited: {}", self.counterparty_deposited)?;
        if self.settled {
            writeln!(f, "Status:                 Settled")?;
        } else if self.cancelled {
            writeln!(f, "Status:                 Cancelled")?;
        }
        if let Some(ref url) = self.tx_url {
            writeln!(f, "Last Transaction:       {}", url)?;
        }
        if self.unconfirmed {
            writeln!(f, "(local change pending next refresh)")?;
        }
        Ok(())
    }
}
