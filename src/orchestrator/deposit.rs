//! Approve-then-deposit state machine

use super::OperationStatus;
use crate::error::{ClientError, ClientResult};

use ethers::types::{Address, H256};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Progress of a collateral deposit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DepositState {
    Idle,
    CheckingAllowance,
    SubmittingApproval,
    ConfirmingApproval {
        tx_hash: H256,
    },
    SubmittingDeposit {
        approval_tx: Option<H256>,
    },
    Confirming {
        tx_hash: H256,
    },
    Done {
        tx_hash: H256,
    },
    /// Terminal; carries the error kind and message
    Failed {
        kind: &'static str,
        reason: String,
    },
}

impl DepositState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DepositState::Done { .. } | DepositState::Failed { .. })
    }

    /// Whether the machine may move from `self` to `next`
    pub fn can_advance(&self, next: &DepositState) -> bool {
        use DepositState::*;

        if let Failed { .. } = next {
            return !self.is_terminal();
        }

        match (self, next) {
            (Idle, CheckingAllowance) => true,
            // Sufficient allowance skips the approval
            (CheckingAllowance, SubmittingDeposit { approval_tx: None }) => true,
            (CheckingAllowance, SubmittingApproval) => true,
            (SubmittingApproval, ConfirmingApproval { .. }) => true,
            (ConfirmingApproval { tx_hash }, SubmittingDeposit { approval_tx }) => {
                *approval_tx == Some(*tx_hash)
            }
            (SubmittingDeposit { .. }, Confirming { .. }) => true,
            (Confirming { tx_hash }, Done { tx_hash: done }) => tx_hash == done,
            _ => false,
        }
    }
}

/// Drives one deposit through its states and publishes each step
pub(crate) struct DepositFlow<'a> {
    contract: Address,
    state: DepositState,
    status: &'a watch::Sender<OperationStatus>,
}

impl<'a> DepositFlow<'a> {
    pub(crate) fn new(contract: Address, status: &'a watch::Sender<OperationStatus>) -> Self {
        let flow = Self {
            contract,
            state: DepositState::Idle,
            status,
        };
        flow.publish();
        flow
    }

    pub(crate) fn state(&self) -> &DepositState {
        &self.state
    }

    pub(crate) fn advance(&mut self, next: DepositState) -> ClientResult<()> {
        if !self.state.can_advance(&next) {
            return Err(ClientError::Internal(format!(
                "Invalid deposit transition {:?} -> {:?}",
                self.state, next
            )));
        }
        debug!("Deposit on {:?}: {:?} -> {:?}", self.contract, self.state, next);
        self.state = next;
        self.publish();
        Ok(())
    }

    /// Move to the terminal failed state
    pub(crate) fn fail(&mut self, err: &ClientError) {
        if self.state.is_terminal() {
            return;
        }
        warn!("Deposit on {:?} failed in {:?}: {}", self.contract, self.state, err);
        self.state = DepositState::Failed {
            kind: err.kind(),
            reason: err.to_string(),
        };
        self.publish();
    }

    fn publish(&self) {
        self.status.send_replace(OperationStatus::Deposit {
            contract: self.contract,
            state: self.state.clone(),
        });
    }
}
