//! Contract interaction orchestrator
//!
//! Turns user intents into the minimum sequence of contract calls:
//! - Reads a derivative's full state as one snapshot
//! - Deploys new instances through the factory
//! - Deposits collateral, approving the token first when needed
//! - Settles and cancels instances
//!
//! Writes are sent at most once, never retried, and at most one write is in
//! flight per (contract, identity). Every confirmation wait is bounded by the
//! caller's timeout.

mod deposit;
mod guard;
mod poller;

pub use deposit::DepositState;
pub use guard::{WriteGuard, WriteRegistry};
pub use poller::SnapshotPoller;

use deposit::DepositFlow;

use crate::assets::AssetRegistry;
use crate::chain::{ChainReader, ContractCall, SigningProvider, TxReceipt, TxStatus};
use crate::contracts::{as_address, as_bool, as_uint, single, ContractRef};
use crate::error::{ClientError, ClientResult, InputError, TxStage};
use crate::events;
use crate::metrics;
use crate::state::{DerivativeSnapshot, LocalPatch, Position, Role, SnapshotStore};
use crate::units::FixedPoint;

use chrono::{DateTime, TimeZone, Utc};
use ethers::abi::Token;
use ethers::types::{Address, H256, U256};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// What the orchestrator is currently doing, for progress display
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum OperationStatus {
    Idle,
    Deposit {
        contract: Address,
        state: DepositState,
    },
    Write {
        contract: Address,
        stage: TxStage,
        state: WriteState,
    },
}

/// Progress of a single-transaction write
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WriteState {
    Submitting,
    Pending { tx_hash: H256 },
    Confirmed { tx_hash: H256, block_number: u64 },
    Failed { kind: &'static str, reason: String },
}

/// Parameters of a new derivative as entered by the user
#[derive(Debug, Clone)]
pub struct DeployRequest {
    /// Underlying asset symbol
    pub underlying: String,
    pub strike_price: String,
    pub settlement_time: DateTime<Utc>,
    /// Collateral asset symbol
    pub collateral: String,
    pub collateral_amount: String,
    pub position: Position,
}

/// Validated, chain-ready deploy parameters
#[derive(Debug, Clone, PartialEq)]
pub struct DeployParams {
    pub price_feed: Address,
    pub strike_price: FixedPoint,
    pub settlement_time: u64,
    pub collateral_token: Address,
    pub collateral_amount: FixedPoint,
    pub is_party_a_long: bool,
}

impl DeployRequest {
    pub fn validate(&self, assets: &AssetRegistry, now: DateTime<Utc>) -> Result<DeployParams, InputError> {
        let price_feed = assets.underlying(&self.underlying)?;
        let collateral_token = assets.collateral(&self.collateral)?;
        let strike_price = FixedPoint::parse_positive("strike price", &self.strike_price)?;
        let collateral_amount =
            FixedPoint::parse_positive("collateral amount", &self.collateral_amount)?;

        if self.settlement_time <= now {
            return Err(InputError::SettlementTimeNotInFuture {
                settlement: self.settlement_time.timestamp(),
                now: now.timestamp(),
            });
        }

        Ok(DeployParams {
            price_feed,
            strike_price,
            // strictly after `now`, so positive
            settlement_time: self.settlement_time.timestamp() as u64,
            collateral_token,
            collateral_amount,
            is_party_a_long: self.position.is_long(),
        })
    }
}

impl DeployParams {
    fn tokens(&self) -> Vec<Token> {
        vec![
            Token::Address(self.price_feed),
            Token::Uint(self.strike_price.raw()),
            Token::Uint(U256::from(self.settlement_time)),
            Token::Address(self.collateral_token),
            Token::Uint(self.collateral_amount.raw()),
            Token::Bool(self.is_party_a_long),
        ]
    }
}

/// Outcome of a confirmed deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeployReceipt {
    pub tx_hash: H256,
    pub block_number: u64,
    /// Address announced by the factory; `None` if the receipt carried no record
    pub instance: Option<Address>,
    pub deployer: Address,
}

/// Collateral deposit requested by a user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepositIntent {
    pub contract: Address,
    pub acting_address: Address,
    pub as_role: Role,
}

/// Sequences reads and writes against derivative instances
pub struct ContractInteractionOrchestrator {
    reader: Arc<dyn ChainReader>,
    signer: Arc<dyn SigningProvider>,
    assets: Arc<AssetRegistry>,
    factory: ContractRef,
    store: Arc<SnapshotStore>,
    writes: Arc<WriteRegistry>,
    status: watch::Sender<OperationStatus>,
}

impl ContractInteractionOrchestrator {
    pub fn new(
        reader: Arc<dyn ChainReader>,
        signer: Arc<dyn SigningProvider>,
        assets: Arc<AssetRegistry>,
        factory: Address,
    ) -> Self {
        let (status, _) = watch::channel(OperationStatus::Idle);
        Self {
            reader,
            signer,
            assets,
            factory: ContractRef::factory(factory),
            store: Arc::new(SnapshotStore::new()),
            writes: Arc::new(WriteRegistry::new()),
            status,
        }
    }

    pub fn store(&self) -> &Arc<SnapshotStore> {
        &self.store
    }

    pub fn assets(&self) -> &Arc<AssetRegistry> {
        &self.assets
    }

    pub fn signer(&self) -> &Arc<dyn SigningProvider> {
        &self.signer
    }

    pub fn status(&self) -> OperationStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<OperationStatus> {
        self.status.subscribe()
    }

    // ============ Reads ============

    /// Read every field of an instance concurrently and replace the stored
    /// snapshot. Any failed field fails the whole read and leaves the
    /// previous snapshot in place. A read that started before a local patch
    /// returns the patched view rather than undo it.
    pub async fn read_snapshot(&self, contract: Address) -> ClientResult<Arc<DerivativeSnapshot>> {
        let ticket = self.store.begin_read();
        match self.fetch_snapshot(contract).await {
            Ok(snapshot) => {
                metrics::record_snapshot_read(true);
                debug!("Read snapshot of {:?}", contract);
                Ok(self.store.replace_from_read(snapshot, ticket))
            }
            Err(e) => {
                metrics::record_snapshot_read(false);
                warn!("Reading {:?} failed, keeping previous snapshot: {}", contract, e);
                Err(match e {
                    ClientError::ReadFailed(_) => e,
                    other => ClientError::ReadFailed(other.to_string()),
                })
            }
        }
    }

    async fn fetch_snapshot(&self, contract: Address) -> ClientResult<DerivativeSnapshot> {
        let c = ContractRef::derivative(contract);
        let r = self.reader.as_ref();

        let (
            strike_price,
            settlement_time,
            collateral_token,
            collateral_amount,
            price_feed,
            party_a,
            party_b,
            is_party_a_long,
            party_a_collateral,
            party_b_collateral,
            settled,
            cancelled,
        ) = tokio::try_join!(
            read_uint(r, &c, "strikePrice"),
            read_uint(r, &c, "settlementTime"),
            read_address(r, &c, "collateralToken"),
            read_uint(r, &c, "collateralAmount"),
            read_address(r, &c, "priceFeed"),
            read_address(r, &c, "partyA"),
            read_address(r, &c, "partyB"),
            read_bool(r, &c, "isPartyALong"),
            read_uint(r, &c, "partyACollateral"),
            read_uint(r, &c, "partyBCollateral"),
            read_bool(r, &c, "contractSettled"),
            read_bool(r, &c, "contractCancelled"),
        )?;

        let settlement_time = to_datetime(settlement_time)?;
        // The hash of our own last write is client knowledge, not chain state
        let last_tx_hash = self.store.current(&contract).and_then(|s| s.last_tx_hash);

        Ok(DerivativeSnapshot {
            address: contract,
            underlying_asset: price_feed,
            strike_price: FixedPoint::from_raw(strike_price),
            settlement_time,
            collateral_asset: collateral_token,
            collateral_amount: FixedPoint::from_raw(collateral_amount),
            deployer: party_a,
            counterparty: (!party_b.is_zero()).then_some(party_b),
            is_deployer_long: is_party_a_long,
            deployer_deposited: !party_a_collateral.is_zero(),
            counterparty_deposited: !party_b_collateral.is_zero(),
            settled,
            cancelled,
            last_tx_hash,
        })
    }

    /// Stored snapshot, reading it from the chain if there is none yet
    async fn snapshot_for(&self, contract: Address) -> ClientResult<Arc<DerivativeSnapshot>> {
        match self.store.current(&contract) {
            Some(snapshot) => Ok(snapshot),
            None => self.read_snapshot(contract).await,
        }
    }

    /// Re-read after a confirmed write; the write already succeeded, so a
    /// failed read is only logged
    async fn refresh_after_write(&self, contract: Address) {
        if let Err(e) = self.read_snapshot(contract).await {
            warn!("Refresh of {:?} after confirmed write failed: {}", contract, e);
        }
    }

    pub async fn transaction_status(&self, tx_hash: H256) -> ClientResult<TxStatus> {
        self.signer.receipt(tx_hash).await.map(TxStatus::from)
    }

    // ============ Writes ============

    async fn require_identity(&self) -> ClientResult<Address> {
        self.signer
            .identity()
            .await?
            .ok_or(ClientError::NoSigningIdentity)
    }

    /// Deploy a new derivative through the factory
    pub async fn deploy(&self, request: DeployRequest, timeout: Duration) -> ClientResult<DeployReceipt> {
        let result = self.run_deploy(request, timeout).await;
        if let Err(ref e) = result {
            metrics::record_operation_failed("deploy", e);
        }
        result
    }

    async fn run_deploy(&self, request: DeployRequest, timeout: Duration) -> ClientResult<DeployReceipt> {
        let deployer = self.require_identity().await?;
        let params = request.validate(&self.assets, Utc::now())?;
        let factory = self.factory.address();
        let _guard = self.writes.acquire(factory, deployer, TxStage::Deploy)?;

        info!(
            "Deploying derivative: strike {} settles {} collateral {} {:?} long={}",
            params.strike_price,
            request.settlement_time,
            params.collateral_amount,
            params.collateral_token,
            params.is_party_a_long
        );

        let call = self.factory.call("createCustomDerivative", &params.tokens())?;
        let receipt = self
            .submit_and_confirm(factory, TxStage::Deploy, call, timeout)
            .await?;

        let instance = events::find_derivative_created(&receipt, factory).map(|(instance, _)| instance);
        match instance {
            Some(instance) => info!("Derivative deployed at {:?} by {:?}", instance, deployer),
            None => warn!(
                "Deploy {:?} confirmed but carried no DerivativeCreated record",
                receipt.tx_hash
            ),
        }

        Ok(DeployReceipt {
            tx_hash: receipt.tx_hash,
            block_number: receipt.block_number,
            instance,
            deployer,
        })
    }

    /// Deposit the role's collateral, approving the token first when the
    /// current allowance is below the required amount
    pub async fn deposit_collateral(
        &self,
        intent: DepositIntent,
        timeout: Duration,
    ) -> ClientResult<TxReceipt> {
        let result = self.run_deposit(intent, timeout).await;
        if let Err(ref e) = result {
            metrics::record_operation_failed("deposit", e);
        }
        result
    }

    async fn run_deposit(&self, intent: DepositIntent, timeout: Duration) -> ClientResult<TxReceipt> {
        let identity = self.require_identity().await?;
        if intent.acting_address != identity {
            // Only the connected identity can sign
            return Err(ClientError::NotAuthorizedForRole { role: intent.as_role });
        }

        let snapshot = self.snapshot_for(intent.contract).await?;
        let role = snapshot.role_of(intent.acting_address);
        if role != intent.as_role {
            return Err(ClientError::NotAuthorizedForRole { role: intent.as_role });
        }
        if snapshot.has_deposited(role) {
            return Err(ClientError::AlreadyDeposited { role });
        }

        let _guard = self
            .writes
            .acquire(intent.contract, identity, TxStage::Deposit)?;

        let mut flow = DepositFlow::new(intent.contract, &self.status);
        let result = self
            .deposit_steps(&mut flow, &snapshot, role, identity, timeout)
            .await;
        if let Err(ref e) = result {
            flow.fail(e);
        }
        result
    }

    async fn deposit_steps(
        &self,
        flow: &mut DepositFlow<'_>,
        snapshot: &DerivativeSnapshot,
        role: Role,
        identity: Address,
        timeout: Duration,
    ) -> ClientResult<TxReceipt> {
        let contract = snapshot.address;
        let token = ContractRef::erc20(snapshot.collateral_asset);
        let required = snapshot.collateral_amount.raw();

        flow.advance(DepositState::CheckingAllowance)?;
        let allowance = self
            .read_allowance(&token, identity, contract)
            .await
            .map_err(|e| ClientError::AllowanceCheckFailed(e.to_string()))?;

        let approval_tx = if allowance < required {
            debug!(
                "Allowance {} below required {} for {:?}",
                allowance, required, contract
            );
            flow.advance(DepositState::SubmittingApproval)?;
            let call = token.call("approve", &[Token::Address(contract), Token::Uint(required)])?;
            let approval_failed = |source: ClientError| {
                if source.pending_tx().is_some() {
                    source
                } else {
                    ClientError::ApprovalRejectedOrFailed(Box::new(source))
                }
            };
            let tx_hash = self
                .send(call, TxStage::Approval)
                .await
                .map_err(approval_failed)?;

            flow.advance(DepositState::ConfirmingApproval { tx_hash })?;
            self.confirm(tx_hash, TxStage::Approval, timeout)
                .await
                .map_err(approval_failed)?;
            Some(tx_hash)
        } else {
            None
        };

        flow.advance(DepositState::SubmittingDeposit { approval_tx })?;
        let function = match role {
            Role::Deployer => "depositCollateralPartyA",
            Role::Counterparty => "agreeToContractAndDeposit",
        };
        // A deposit that may still land is reported by its own hash
        let deposit_failed = |source: ClientError| {
            if source.pending_tx().is_some() {
                source
            } else {
                ClientError::DepositRejectedOrFailed {
                    approval_tx,
                    source: Box::new(source),
                }
            }
        };

        let call = ContractRef::derivative(contract).call(function, &[Token::Uint(required)])?;
        let tx_hash = self
            .send(call, TxStage::Deposit)
            .await
            .map_err(deposit_failed)?;

        flow.advance(DepositState::Confirming { tx_hash })?;
        let receipt = self
            .confirm(tx_hash, TxStage::Deposit, timeout)
            .await
            .map_err(deposit_failed)?;

        flow.advance(DepositState::Done { tx_hash })?;
        self.store
            .apply_patch(&contract, LocalPatch::deposit(role, tx_hash));
        metrics::record_deposit_completed(&role.to_string());
        info!("{} deposit on {:?} confirmed in {:?}", role, contract, tx_hash);

        Ok(receipt)
    }

    async fn read_allowance(&self, token: &ContractRef, owner: Address, spender: Address) -> ClientResult<U256> {
        let tokens = self
            .reader
            .call(token, "allowance", &[Token::Address(owner), Token::Address(spender)])
            .await?;
        as_uint("allowance", single("allowance", tokens)?)
    }

    /// Settle an instance after its settlement time
    pub async fn settle(&self, contract: Address, timeout: Duration) -> ClientResult<TxReceipt> {
        let call = ContractRef::derivative(contract).call("settleContract", &[])?;
        self.single_write(contract, TxStage::Settle, call, timeout).await
    }

    /// Record the connected party's request to cancel
    pub async fn request_cancellation(&self, contract: Address, timeout: Duration) -> ClientResult<TxReceipt> {
        let identity = self.require_identity().await?;
        let snapshot = self.snapshot_for(contract).await?;

        let function = match snapshot.role_of(identity) {
            Role::Deployer => "setCancelPartyA",
            Role::Counterparty if snapshot.counterparty == Some(identity) => "setCancelPartyB",
            Role::Counterparty => {
                return Err(ClientError::NotAuthorizedForRole {
                    role: Role::Counterparty,
                })
            }
        };

        let call = ContractRef::derivative(contract).call(function, &[])?;
        self.single_write(contract, TxStage::RequestCancel, call, timeout)
            .await
    }

    /// Cancel an instance whose counterparty never deposited
    pub async fn cancel_incomplete_deposit(
        &self,
        contract: Address,
        timeout: Duration,
    ) -> ClientResult<TxReceipt> {
        let call = ContractRef::derivative(contract).call("cancelDueToIncompleteDeposit", &[])?;
        self.single_write(contract, TxStage::CancelIncomplete, call, timeout)
            .await
    }

    async fn single_write(
        &self,
        contract: Address,
        stage: TxStage,
        call: ContractCall,
        timeout: Duration,
    ) -> ClientResult<TxReceipt> {
        let result = async {
            let identity = self.require_identity().await?;
            let _guard = self.writes.acquire(contract, identity, stage)?;
            self.submit_and_confirm(contract, stage, call, timeout).await
        }
        .await;

        match result {
            Ok(receipt) => {
                self.refresh_after_write(contract).await;
                Ok(receipt)
            }
            Err(e) => {
                metrics::record_operation_failed(stage.as_str(), &e);
                Err(e)
            }
        }
    }

    /// Submit one transaction and wait for it, publishing each step
    async fn submit_and_confirm(
        &self,
        contract: Address,
        stage: TxStage,
        call: ContractCall,
        timeout: Duration,
    ) -> ClientResult<TxReceipt> {
        let publish = |state: WriteState| {
            self.status.send_replace(OperationStatus::Write {
                contract,
                stage,
                state,
            });
        };

        publish(WriteState::Submitting);
        let result = async {
            let tx_hash = self.send(call, stage).await?;
            publish(WriteState::Pending { tx_hash });
            self.confirm(tx_hash, stage, timeout).await
        }
        .await;

        match result {
            Ok(receipt) => {
                publish(WriteState::Confirmed {
                    tx_hash: receipt.tx_hash,
                    block_number: receipt.block_number,
                });
                Ok(receipt)
            }
            Err(e) => {
                publish(WriteState::Failed {
                    kind: e.kind(),
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Submit a call once. A send the node never acknowledged is reported
    /// with the hash it would confirm under.
    async fn send(&self, call: ContractCall, stage: TxStage) -> ClientResult<H256> {
        self.signer.submit(call).await.map_err(|e| match e {
            ClientError::SubmissionUnacknowledged { tx_hash, reason } => {
                warn!(
                    "{} tx {:?} was not acknowledged; it may still confirm: {}",
                    stage, tx_hash, reason
                );
                ClientError::OutcomeUnknown {
                    tx_hash,
                    stage,
                    reason,
                }
            }
            other => other,
        })
    }

    /// Wait for a submitted transaction within `timeout`
    async fn confirm(&self, tx_hash: H256, stage: TxStage, timeout: Duration) -> ClientResult<TxReceipt> {
        let started = Instant::now();
        let receipt = match tokio::time::timeout(timeout, self.signer.wait_for_confirmation(tx_hash)).await {
            Ok(Ok(receipt)) => receipt,
            Ok(Err(e)) => {
                // Already broadcast, so a failed wait says nothing about the outcome
                warn!(
                    "Lost track of {} tx {:?}; it may still confirm: {}",
                    stage, tx_hash, e
                );
                return Err(ClientError::OutcomeUnknown {
                    tx_hash,
                    stage,
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                warn!(
                    "{} tx {:?} not confirmed within {:?}; it may still confirm",
                    stage, tx_hash, timeout
                );
                metrics::record_confirmation_timeout(stage.as_str());
                return Err(ClientError::ConfirmationTimedOut { tx_hash, stage });
            }
        };

        metrics::record_tx_confirmed(stage.as_str(), receipt.success, started.elapsed().as_secs_f64());
        for emitted in events::decode_receipt(&receipt) {
            info!(
                "{} tx {:?}: {} from {:?}",
                stage,
                tx_hash,
                emitted.event.name(),
                emitted.emitter
            );
            metrics::record_event(emitted.event.name());
        }

        if !receipt.success {
            return Err(ClientError::TransactionReverted { tx_hash });
        }
        Ok(receipt)
    }
}

async fn read_token(reader: &dyn ChainReader, contract: &ContractRef, function: &'static str) -> ClientResult<Token> {
    single(function, reader.call(contract, function, &[]).await?)
}

async fn read_uint(reader: &dyn ChainReader, contract: &ContractRef, function: &'static str) -> ClientResult<U256> {
    as_uint(function, read_token(reader, contract, function).await?)
}

async fn read_address(
    reader: &dyn ChainReader,
    contract: &ContractRef,
    function: &'static str,
) -> ClientResult<Address> {
    as_address(function, read_token(reader, contract, function).await?)
}

async fn read_bool(reader: &dyn ChainReader, contract: &ContractRef, function: &'static str) -> ClientResult<bool> {
    as_bool(function, read_token(reader, contract, function).await?)
}

fn to_datetime(seconds: U256) -> ClientResult<DateTime<Utc>> {
    if seconds > U256::from(i64::MAX as u64) {
        return Err(ClientError::ReadFailed(format!("settlementTime {} out of range", seconds)));
    }
    Utc.timestamp_opt(seconds.as_u64() as i64, 0)
        .single()
        .ok_or_else(|| ClientError::ReadFailed(format!("settlementTime {} out of range", seconds)))
}
