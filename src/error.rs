//! Error types for the derivative client

use crate::contracts::ContractRejection;
use crate::state::Role;

use ethers::types::H256;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Which transaction of an orchestrated operation an outcome refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStage {
    Deploy,
    Approval,
    Deposit,
    Settle,
    RequestCancel,
    CancelIncomplete,
}

impl TxStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxStage::Deploy => "deploy",
            TxStage::Approval => "approval",
            TxStage::Deposit => "deposit",
            TxStage::Settle => "settle",
            TxStage::RequestCancel => "request_cancel",
            TxStage::CancelIncomplete => "cancel_incomplete",
        }
    }
}

impl fmt::Display for TxStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input rejected before anything is sent to the chain
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InputError {
    #[error("{field} has more than {max} fractional digits")]
    PrecisionLoss { field: &'static str, max: u32 },

    #[error("{field} must be greater than zero")]
    NonPositiveAmount { field: &'static str },

    #[error("{field} is not a decimal number: {value:?}")]
    MalformedNumber { field: &'static str, value: String },

    #[error("{field} does not fit in 256 bits")]
    Overflow { field: &'static str },

    #[error("settlement time {settlement} is not after {now}")]
    SettlementTimeNotInFuture { settlement: i64, now: i64 },

    #[error("unknown {kind} asset {symbol:?}")]
    UnknownAsset { kind: &'static str, symbol: String },

    #[error("invalid address {0:?}")]
    InvalidAddress(String),
}

/// Main error type for the client
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("No signing identity connected")]
    NoSigningIdentity,

    #[error("Network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("Invalid input: {0}")]
    InvalidInput(#[from] InputError),

    #[error("Acting address is not authorized to deposit as {role}")]
    NotAuthorizedForRole { role: Role },

    #[error("Collateral already deposited by {role}")]
    AlreadyDeposited { role: Role },

    #[error("Allowance check failed: {0}")]
    AllowanceCheckFailed(String),

    #[error("Approval rejected or failed: {0}")]
    ApprovalRejectedOrFailed(#[source] Box<ClientError>),

    /// The deposit step failed. When `approval_tx` is set, an approval
    /// confirmed on-chain before the deposit was attempted.
    #[error("Deposit rejected or failed (approval tx: {approval_tx:?}): {source}")]
    DepositRejectedOrFailed {
        approval_tx: Option<H256>,
        #[source]
        source: Box<ClientError>,
    },

    #[error("Timed out waiting for {stage} tx {tx_hash:?} to confirm")]
    ConfirmationTimedOut { tx_hash: H256, stage: TxStage },

    /// Sent, but the client lost track of it before seeing a receipt. The
    /// transaction may still confirm.
    #[error("{stage} tx {tx_hash:?} was sent but its outcome is unknown: {reason}")]
    OutcomeUnknown {
        tx_hash: H256,
        stage: TxStage,
        reason: String,
    },

    /// The signed transaction went out but the node never answered
    #[error("Node did not acknowledge tx {tx_hash:?}: {reason}")]
    SubmissionUnacknowledged { tx_hash: H256, reason: String },

    #[error("Contract rejected the call: {0}")]
    ContractLevelRejection(ContractRejection),

    #[error("Reading contract state failed: {0}")]
    ReadFailed(String),

    #[error("Signature request rejected: {0}")]
    SignatureRejected(String),

    #[error("Insufficient funds for gas or value: {0}")]
    InsufficientFunds(String),

    #[error("Transaction {tx_hash:?} reverted on-chain")]
    TransactionReverted { tx_hash: H256 },

    #[error("A write is already in flight for contract {contract:?} from {identity:?}")]
    OperationInProgress {
        contract: ethers::types::Address,
        identity: ethers::types::Address,
    },

    #[error("No snapshot available for contract {0:?}; read it first")]
    NoSnapshot(ethers::types::Address),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ClientError {
    /// Whether on-chain state may differ from before the failed operation
    pub fn funds_may_have_moved(&self) -> bool {
        match self {
            ClientError::ConfirmationTimedOut { .. }
            | ClientError::OutcomeUnknown { .. }
            | ClientError::SubmissionUnacknowledged { .. } => true,
            ClientError::ApprovalRejectedOrFailed(source) => source.funds_may_have_moved(),
            ClientError::DepositRejectedOrFailed {
                approval_tx,
                source,
            } => approval_tx.is_some() || source.funds_may_have_moved(),
            _ => false,
        }
    }

    /// Hash of a sent transaction whose outcome the client did not observe
    pub fn pending_tx(&self) -> Option<H256> {
        match self {
            ClientError::ConfirmationTimedOut { tx_hash, .. }
            | ClientError::OutcomeUnknown { tx_hash, .. }
            | ClientError::SubmissionUnacknowledged { tx_hash, .. } => Some(*tx_hash),
            ClientError::ApprovalRejectedOrFailed(source)
            | ClientError::DepositRejectedOrFailed { source, .. } => source.pending_tx(),
            _ => None,
        }
    }

    /// Errors the user can fix by changing input or wallet state
    pub fn is_user_actionable(&self) -> bool {
        matches!(
            self,
            ClientError::NoSigningIdentity
                | ClientError::InvalidInput(_)
                | ClientError::NotAuthorizedForRole { .. }
                | ClientError::AlreadyDeposited { .. }
                | ClientError::SignatureRejected(_)
                | ClientError::InsufficientFunds(_)
        )
    }

    /// Short label for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            ClientError::NoSigningIdentity => "no_signing_identity",
            ClientError::NetworkUnreachable(_) => "network_unreachable",
            ClientError::InvalidInput(_) => "invalid_input",
            ClientError::NotAuthorizedForRole { .. } => "not_authorized_for_role",
            ClientError::AlreadyDeposited { .. } => "already_deposited",
            ClientError::AllowanceCheckFailed(_) => "allowance_check_failed",
            ClientError::ApprovalRejectedOrFailed(_) => "approval_failed",
            ClientError::DepositRejectedOrFailed { .. } => "deposit_failed",
            ClientError::ConfirmationTimedOut { .. } => "confirmation_timed_out",
            ClientError::OutcomeUnknown { .. } => "outcome_unknown",
            ClientError::SubmissionUnacknowledged { .. } => "submission_unacknowledged",
            ClientError::ContractLevelRejection(_) => "contract_rejection",
            ClientError::ReadFailed(_) => "read_failed",
            ClientError::SignatureRejected(_) => "signature_rejected",
            ClientError::InsufficientFunds(_) => "insufficient_funds",
            ClientError::TransactionReverted { .. } => "reverted",
            ClientError::OperationInProgress { .. } => "operation_in_progress",
            ClientError::NoSnapshot(_) => "no_snapshot",
            ClientError::Config(_) => "config",
            ClientError::Internal(_) => "internal",
        }
    }
}

/// Result type for client operations
pub type ClientResult<T> = Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deposit_failure_after_approval_reports_moved_state() {
        let err = ClientError::DepositRejectedOrFailed {
            approval_tx: Some(H256::repeat_byte(7)),
            source: Box::new(ClientError::SignatureRejected("user denied".into())),
        };
        assert!(err.funds_may_have_moved());

        let err = ClientError::DepositRejectedOrFailed {
            approval_tx: None,
            source: Box::new(ClientError::SignatureRejected("user denied".into())),
        };
        assert!(!err.funds_may_have_moved());
    }

    #[test]
    fn test_wrapped_unknown_outcome_keeps_hash() {
        let sent = H256::repeat_byte(0x42);
        let err = ClientError::ApprovalRejectedOrFailed(Box::new(
            ClientError::SubmissionUnacknowledged {
                tx_hash: sent,
                reason: "timed out".into(),
            },
        ));
        assert!(err.funds_may_have_moved());
        assert_eq!(err.pending_tx(), Some(sent));

        let err = ClientError::ApprovalRejectedOrFailed(Box::new(ClientError::SignatureRejected(
            "user denied".into(),
        )));
        assert!(!err.funds_may_have_moved());
        assert_eq!(err.pending_tx(), None);
    }

    #[test]
    fn test_input_error_converts() {
        let err: ClientError = InputError::NonPositiveAmount { field: "strike price" }.into();
        assert_eq!(err.kind(), "invalid_input");
        assert!(err.is_user_actionable());
    }
}
