//! In-memory chain for orchestrator and API tests
//!
//! State changes apply when a call is submitted, as if mined at once.
//! Confirmation can be held back to simulate a slow network.

use crate::assets::AssetRegistry;
use crate::chain::{ChainReader, ContractCall, ReceiptLog, SigningProvider, TxReceipt};
use crate::contracts::{ContractRef, ContractRejection, Interface};
use crate::error::{ClientError, ClientResult};
use crate::events::tests::derivative_created_log;

use async_trait::async_trait;
use ethers::abi::Token;
use ethers::types::{Address, H160, H256, U256};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub(crate) const FACTORY: Address = H160([0xfa; 20]);
pub(crate) const ETH_FEED: Address = H160([0x01; 20]);
pub(crate) const USDC: Address = H160([0x02; 20]);
pub(crate) const WETH: Address = H160([0x03; 20]);
pub(crate) const ALICE: Address = H160([0xaa; 20]);
pub(crate) const BOB: Address = H160([0xbb; 20]);

pub(crate) fn assets() -> AssetRegistry {
    let mut assets = AssetRegistry::default();
    assets.insert_underlying("ETH", ETH_FEED).unwrap();
    assets.insert_collateral("USDC", USDC).unwrap();
    assets.insert_collateral("WETH", WETH).unwrap();
    assets
}

/// `whole` units at 18 decimals
pub(crate) fn units(whole: u64) -> U256 {
    U256::from(whole) * U256::exp10(18)
}

#[derive(Debug, Clone, Default)]
struct FakeDerivative {
    price_feed: Address,
    strike_price: U256,
    settlement_time: U256,
    collateral_token: Address,
    collateral_amount: U256,
    party_a: Address,
    party_b: Address,
    is_party_a_long: bool,
    party_a_collateral: U256,
    party_b_collateral: U256,
    party_a_cancel: bool,
    party_b_cancel: bool,
    settled: bool,
    cancelled: bool,
}

#[derive(Default)]
struct Inner {
    identity: Option<Address>,
    derivatives: HashMap<Address, FakeDerivative>,
    /// (token, owner, spender) -> amount
    allowances: HashMap<(Address, Address, Address), U256>,
    receipts: HashMap<H256, (&'static str, TxReceipt)>,
    journal: Vec<String>,
    rejections: HashSet<&'static str>,
    block: u64,
    tx_count: u64,
}

#[derive(Default)]
pub(crate) struct FakeChain {
    inner: Mutex<Inner>,
    hold_confirmations: AtomicBool,
    fail_reads: AtomicBool,
    hold_reads: AtomicBool,
    held_reads: AtomicUsize,
}

impl FakeChain {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn connect(&self, identity: Option<Address>) {
        self.inner.lock().unwrap().identity = identity;
    }

    pub(crate) fn hold_confirmations(&self, hold: bool) {
        self.hold_confirmations.store(hold, Ordering::SeqCst);
    }

    pub(crate) fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Answer derivative reads with the state at call time, but only once
    /// released
    pub(crate) fn hold_reads(&self, hold: bool) {
        self.hold_reads.store(hold, Ordering::SeqCst);
    }

    /// Derivative reads that have been answered and are being held back
    pub(crate) fn held_reads(&self) -> usize {
        self.held_reads.load(Ordering::SeqCst)
    }

    /// Make the next submission of `function` revert during estimation
    pub(crate) fn reject_next(&self, function: &'static str) {
        self.inner.lock().unwrap().rejections.insert(function);
    }

    pub(crate) fn set_allowance(&self, token: Address, owner: Address, spender: Address, amount: U256) {
        self.inner
            .lock()
            .unwrap()
            .allowances
            .insert((token, owner, spender), amount);
    }

    pub(crate) fn allowance(&self, token: Address, owner: Address, spender: Address) -> U256 {
        self.inner
            .lock()
            .unwrap()
            .allowances
            .get(&(token, owner, spender))
            .copied()
            .unwrap_or_default()
    }

    /// Ordered record of submissions and confirmations, e.g. `submit:approve`
    pub(crate) fn journal(&self) -> Vec<String> {
        self.inner.lock().unwrap().journal.clone()
    }

    pub(crate) fn submitted(&self) -> Vec<String> {
        self.journal()
            .into_iter()
            .filter_map(|entry| entry.strip_prefix("submit:").map(String::from))
            .collect()
    }

    /// Deploy an instance directly, bypassing the factory
    pub(crate) fn add_derivative(&self, address: Address, party_a: Address, token: Address, amount: U256) {
        self.inner.lock().unwrap().derivatives.insert(
            address,
            FakeDerivative {
                price_feed: ETH_FEED,
                strike_price: units(2000),
                settlement_time: U256::from(4_102_444_800u64),
                collateral_token: token,
                collateral_amount: amount,
                party_a,
                is_party_a_long: true,
                ..Default::default()
            },
        );
    }

    fn read(&self, contract: &ContractRef, function: &str, args: &[Token]) -> ClientResult<Vec<Token>> {
        let inner = self.inner.lock().unwrap();
        let address = contract.address();

        let token = match contract.interface() {
            Interface::Erc20 => match function {
                "allowance" => {
                    let owner = arg_address(args, 0)?;
                    let spender = arg_address(args, 1)?;
                    Token::Uint(
                        inner
                            .allowances
                            .get(&(address, owner, spender))
                            .copied()
                            .unwrap_or_default(),
                    )
                }
                "balanceOf" => Token::Uint(units(1_000_000)),
                _ => return Err(ClientError::ReadFailed(format!("no {}", function))),
            },
            Interface::CustomDerivative => {
                let d = inner
                    .derivatives
                    .get(&address)
                    .ok_or_else(|| ClientError::ReadFailed(format!("no contract at {:?}", address)))?;
                match function {
                    "strikePrice" => Token::Uint(d.strike_price),
                    "settlementTime" => Token::Uint(d.settlement_time),
                    "collateralToken" => Token::Address(d.collateral_token),
                    "collateralAmount" => Token::Uint(d.collateral_amount),
                    "priceFeed" => Token::Address(d.price_feed),
                    "partyA" => Token::Address(d.party_a),
                    "partyB" => Token::Address(d.party_b),
                    "isPartyALong" => Token::Bool(d.is_party_a_long),
                    "partyACollateral" => Token::Uint(d.party_a_collateral),
                    "partyBCollateral" => Token::Uint(d.party_b_collateral),
                    "partyACancel" => Token::Bool(d.party_a_cancel),
                    "partyBCancel" => Token::Bool(d.party_b_cancel),
                    "contractSettled" => Token::Bool(d.settled),
                    "contractCancelled" => Token::Bool(d.cancelled),
                    _ => return Err(ClientError::ReadFailed(format!("no {}", function))),
                }
            }
            Interface::DerivativeFactory => {
                return Err(ClientError::ReadFailed("factory has no views".into()))
            }
        };
        Ok(vec![token])
    }

    /// Apply a call's effect, returning the logs it emits
    fn execute(inner: &mut Inner, call: &ContractCall, from: Address) -> ClientResult<Vec<ReceiptLog>> {
        let interface = if call.to == FACTORY {
            Interface::DerivativeFactory
        } else if inner.derivatives.contains_key(&call.to) {
            Interface::CustomDerivative
        } else {
            Interface::Erc20
        };
        let args = ContractRef::new(call.to, interface)
            .function(call.function)?
            .decode_input(&call.data[4..])
            .map_err(|e| ClientError::Internal(e.to_string()))?;

        let mut logs = Vec::new();
        match call.function {
            "approve" => {
                let spender = arg_address(&args, 0)?;
                let amount = arg_uint(&args, 1)?;
                inner.allowances.insert((call.to, from, spender), amount);
            }
            "createCustomDerivative" => {
                let address = Address::from_low_u64_be(0xd000 + inner.tx_count);
                inner.derivatives.insert(
                    address,
                    FakeDerivative {
                        price_feed: arg_address(&args, 0)?,
                        strike_price: arg_uint(&args, 1)?,
                        settlement_time: arg_uint(&args, 2)?,
                        collateral_token: arg_address(&args, 3)?,
                        collateral_amount: arg_uint(&args, 4)?,
                        party_a: from,
                        is_party_a_long: args.get(5).cloned().and_then(Token::into_bool).unwrap_or(false),
                        ..Default::default()
                    },
                );
                logs.push(derivative_created_log(call.to, address, from));
            }
            "depositCollateralPartyA" | "agreeToContractAndDeposit" => {
                let amount = arg_uint(&args, 0)?;
                let d = inner
                    .derivatives
                    .get(&call.to)
                    .cloned()
                    .ok_or_else(|| reject(ContractRejection::InvalidAddress))?;
                let is_party_a = call.function == "depositCollateralPartyA";
                if is_party_a && from != d.party_a {
                    return Err(reject(ContractRejection::OnlyDepositsByPartyA));
                }
                if !is_party_a && !d.party_b.is_zero() {
                    return Err(reject(ContractRejection::CounterpartyAlreadyAgreed));
                }

                let key = (d.collateral_token, from, call.to);
                let allowance = inner.allowances.get(&key).copied().unwrap_or_default();
                if allowance < amount {
                    return Err(reject(ContractRejection::Reason(
                        "ERC20: insufficient allowance".into(),
                    )));
                }
                inner.allowances.insert(key, allowance - amount);

                with_derivative(inner, call.to, |d| {
                    if is_party_a {
                        d.party_a_collateral = amount;
                    } else {
                        d.party_b = from;
                        d.party_b_collateral = amount;
                    }
                    Ok(())
                })?;
            }
            "settleContract" => with_derivative(inner, call.to, |d| {
                if d.party_a_collateral.is_zero() || d.party_b_collateral.is_zero() {
                    return Err(ContractRejection::CollateralNotFullyDeposited);
                }
                d.settled = true;
                Ok(())
            })?,
            "setCancelPartyA" => with_derivative(inner, call.to, |d| {
                d.party_a_cancel = true;
                d.cancelled = d.party_b_cancel;
                Ok(())
            })?,
            "setCancelPartyB" => with_derivative(inner, call.to, |d| {
                d.party_b_cancel = true;
                d.cancelled = d.party_a_cancel;
                Ok(())
            })?,
            "cancelDueToIncompleteDeposit" => with_derivative(inner, call.to, |d| {
                if !d.party_b_collateral.is_zero() {
                    return Err(ContractRejection::CollateralFullyDeposited);
                }
                d.cancelled = true;
                Ok(())
            })?,
            other => return Err(ClientError::Internal(format!("fake chain cannot run {}", other))),
        }
        Ok(logs)
    }
}

fn with_derivative(
    inner: &mut Inner,
    address: Address,
    f: impl FnOnce(&mut FakeDerivative) -> Result<(), ContractRejection>,
) -> ClientResult<()> {
    let d = inner
        .derivatives
        .get_mut(&address)
        .ok_or_else(|| reject(ContractRejection::InvalidAddress))?;
    f(d).map_err(reject)
}

fn reject(rejection: ContractRejection) -> ClientError {
    ClientError::ContractLevelRejection(rejection)
}

fn arg_address(args: &[Token], i: usize) -> ClientResult<Address> {
    args.get(i)
        .cloned()
        .and_then(Token::into_address)
        .ok_or_else(|| ClientError::Internal(format!("argument {} is not an address", i)))
}

fn arg_uint(args: &[Token], i: usize) -> ClientResult<U256> {
    args.get(i)
        .cloned()
        .and_then(Token::into_uint)
        .ok_or_else(|| ClientError::Internal(format!("argument {} is not a uint", i)))
}

#[async_trait]
impl ChainReader for FakeChain {
    async fn call(&self, contract: &ContractRef, function: &str, args: &[Token]) -> ClientResult<Vec<Token>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(ClientError::NetworkUnreachable("connection refused".into()));
        }
        let result = self.read(contract, function, args);
        if matches!(contract.interface(), Interface::CustomDerivative)
            && self.hold_reads.load(Ordering::SeqCst)
        {
            self.held_reads.fetch_add(1, Ordering::SeqCst);
            while self.hold_reads.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
        result
    }
}

#[async_trait]
impl SigningProvider for FakeChain {
    async fn identity(&self) -> ClientResult<Option<Address>> {
        Ok(self.inner.lock().unwrap().identity)
    }

    async fn network(&self) -> ClientResult<u64> {
        Ok(1442)
    }

    async fn submit(&self, call: ContractCall) -> ClientResult<H256> {
        let mut inner = self.inner.lock().unwrap();
        let from = inner.identity.ok_or(ClientError::NoSigningIdentity)?;

        if inner.rejections.remove(call.function) {
            return Err(reject(ContractRejection::Reason(format!(
                "{} rejected",
                call.function
            ))));
        }
        let logs = Self::execute(&mut inner, &call, from)?;

        inner.tx_count += 1;
        inner.block += 1;
        let tx_hash = H256::from_low_u64_be(inner.tx_count);
        let receipt = TxReceipt {
            tx_hash,
            block_number: inner.block,
            success: true,
            logs,
        };
        inner.receipts.insert(tx_hash, (call.function, receipt));
        inner.journal.push(format!("submit:{}", call.function));
        Ok(tx_hash)
    }

    async fn wait_for_confirmation(&self, tx_hash: H256) -> ClientResult<TxReceipt> {
        while self.hold_confirmations.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let mut inner = self.inner.lock().unwrap();
        let (function, receipt) = inner
            .receipts
            .get(&tx_hash)
            .cloned()
            .ok_or_else(|| ClientError::Internal(format!("unknown tx {:?}", tx_hash)))?;
        inner.journal.push(format!("confirmed:{}", function));
        Ok(receipt)
    }

    async fn receipt(&self, tx_hash: H256) -> ClientResult<Option<TxReceipt>> {
        if self.hold_confirmations.load(Ordering::SeqCst) {
            return Ok(None);
        }
        Ok(self
            .inner
            .lock()
            .unwrap()
            .receipts
            .get(&tx_hash)
            .map(|(_, receipt)| receipt.clone()))
    }
}
