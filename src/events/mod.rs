//! Contract event types and parsing
//!
//! Decodes the logs of confirmed receipts emitted by the derivative, its
//! factory and the collateral token.

use crate::chain::{ReceiptLog, TxReceipt};
use crate::contracts::Interface;

use ethers::abi::{Event, RawLog, Token};
use ethers::types::{Address, U256};
use serde::Serialize;
use tracing::debug;

/// Events the client understands
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DerivativeEvent {
    /// New derivative instance deployed by the factory
    DerivativeCreated { derivative: Address, party_a: Address },
    CollateralDeposited { depositor: Address, amount: U256 },
    CollateralWithdrawn { withdrawer: Address, amount: U256 },
    ContractCancelled,
    ContractSettled { final_price: U256 },
    CounterpartyEntered { party_b: Address },
    PartyRequestedCancellation { party: Address },
    /// ERC-20 allowance set
    Approval {
        owner: Address,
        spender: Address,
        value: U256,
    },
    Transfer { from: Address, to: Address, value: U256 },
}

impl DerivativeEvent {
    /// Get event name for logs
    pub fn name(&self) -> &'static str {
        match self {
            DerivativeEvent::DerivativeCreated { .. } => "derivative_created",
            DerivativeEvent::CollateralDeposited { .. } => "collateral_deposited",
            DerivativeEvent::CollateralWithdrawn { .. } => "collateral_withdrawn",
            DerivativeEvent::ContractCancelled => "contract_cancelled",
            DerivativeEvent::ContractSettled { .. } => "contract_settled",
            DerivativeEvent::CounterpartyEntered { .. } => "counterparty_entered",
            DerivativeEvent::PartyRequestedCancellation { .. } => "party_requested_cancellation",
            DerivativeEvent::Approval { .. } => "approval",
            DerivativeEvent::Transfer { .. } => "transfer",
        }
    }
}

/// An event together with the contract that emitted it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmittedEvent {
    pub emitter: Address,
    #[serde(flatten)]
    pub event: DerivativeEvent,
}

/// Decode every recognised log in a receipt; unknown logs are skipped
pub fn decode_receipt(receipt: &TxReceipt) -> Vec<EmittedEvent> {
    receipt
        .logs
        .iter()
        .filter_map(|log| {
            let event = parse_log(log);
            if event.is_none() {
                debug!(
                    "Skipping unrecognised log from {:?} in {:?}",
                    log.address, receipt.tx_hash
                );
            }
            event.map(|event| EmittedEvent {
                emitter: log.address,
                event,
            })
        })
        .collect()
}

/// Address of the instance announced by the factory in this receipt
pub fn find_derivative_created(receipt: &TxReceipt, factory: Address) -> Option<(Address, Address)> {
    decode_receipt(receipt)
        .into_iter()
        .find_map(|emitted| match emitted.event {
            DerivativeEvent::DerivativeCreated {
                derivative,
                party_a,
            } if emitted.emitter == factory => Some((derivative, party_a)),
            _ => None,
        })
}

/// Parse a single log against the known interfaces
pub fn parse_log(log: &ReceiptLog) -> Option<DerivativeEvent> {
    let topic = *log.topics.first()?;
    let event = [
        Interface::DerivativeFactory,
        Interface::CustomDerivative,
        Interface::Erc20,
    ]
    .iter()
    .flat_map(|interface| interface.abi().events())
    .find(|event| event.signature() == topic)?;

    let raw = RawLog {
        topics: log.topics.clone(),
        data: log.data.clone(),
    };
    let decoded = event.parse_log(raw).ok()?;
    let params: Vec<Token> = decoded.params.into_iter().map(|p| p.value).collect();
    from_params(event, params)
}

fn from_params(event: &Event, params: Vec<Token>) -> Option<DerivativeEvent> {
    let addresses: Vec<Address> = params
        .iter()
        .filter_map(|t| t.clone().into_address())
        .collect();
    let address = |i: usize| addresses.get(i).copied();
    // Every valued event carries its amount last
    let value = || params.last().and_then(|t| t.clone().into_uint());

    let event = match event.name.as_str() {
        "DerivativeCreated" => DerivativeEvent::DerivativeCreated {
            derivative: address(0)?,
            party_a: address(1)?,
        },
        "CollateralDeposited" => DerivativeEvent::CollateralDeposited {
            depositor: address(0)?,
            amount: value()?,
        },
        "CollateralWithdrawn" => DerivativeEvent::CollateralWithdrawn {
            withdrawer: address(0)?,
            amount: value()?,
        },
        "ContractCancelled" => DerivativeEvent::ContractCancelled,
        "ContractSettled" => DerivativeEvent::ContractSettled {
            final_price: value()?,
        },
        "CounterpartyEntered" => DerivativeEvent::CounterpartyEntered {
            party_b: address(0)?,
        },
        "PartyRequestedCancellation" => DerivativeEvent::PartyRequestedCancellation {
            party: address(0)?,
        },
        "Approval" => DerivativeEvent::Approval {
            owner: address(0)?,
            spender: address(1)?,
            value: value()?,
        },
        "Transfer" => DerivativeEvent::Transfer {
            from: address(0)?,
            to: address(1)?,
            value: value()?,
        },
        _ => return None,
    };
    Some(event)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use ethers::abi::encode;
    use ethers::types::H256;

    fn topic(interface: Interface, name: &str) -> H256 {
        interface.abi().event(name).unwrap().signature()
    }

    fn address_topic(address: Address) -> H256 {
        H256::from(address)
    }

    /// Log emitted by the factory for a new instance
    pub(crate) fn derivative_created_log(
        factory: Address,
        derivative: Address,
        party_a: Address,
    ) -> ReceiptLog {
        ReceiptLog {
            address: factory,
            topics: vec![topic(Interface::DerivativeFactory, "DerivativeCreated")],
            data: encode(&[Token::Address(derivative), Token::Address(party_a)]),
        }
    }

    fn receipt(logs: Vec<ReceiptLog>) -> TxReceipt {
        TxReceipt {
            tx_hash: H256::repeat_byte(1),
            block_number: 10,
            success: true,
            logs,
        }
    }

    #[test]
    fn test_find_derivative_created() {
        let factory = Address::repeat_byte(0xfa);
        let derivative = Address::repeat_byte(0xdd);
        let party_a = Address::repeat_byte(0xaa);
        let receipt = receipt(vec![derivative_created_log(factory, derivative, party_a)]);

        assert_eq!(
            find_derivative_created(&receipt, factory),
            Some((derivative, party_a))
        );
        // Only trusted when emitted by the configured factory
        assert_eq!(find_derivative_created(&receipt, Address::repeat_byte(1)), None);
    }

    #[test]
    fn test_decode_approval_and_deposit() {
        let owner = Address::repeat_byte(0xbb);
        let spender = Address::repeat_byte(0xdd);
        let token = Address::repeat_byte(0x02);
        let amount = U256::from(500u64) * U256::exp10(18);

        let approval = ReceiptLog {
            address: token,
            topics: vec![
                topic(Interface::Erc20, "Approval"),
                address_topic(owner),
                address_topic(spender),
            ],
            data: encode(&[Token::Uint(amount)]),
        };
        let deposited = ReceiptLog {
            address: spender,
            topics: vec![topic(Interface::CustomDerivative, "CollateralDeposited")],
            data: encode(&[Token::Address(owner), Token::Uint(amount)]),
        };
        let unknown = ReceiptLog {
            address: token,
            topics: vec![H256::repeat_byte(0x77)],
            data: vec![],
        };

        let events = decode_receipt(&receipt(vec![approval, unknown, deposited]));
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0].event,
            DerivativeEvent::Approval {
                owner,
                spender,
                value: amount
            }
        );
        assert_eq!(events[1].emitter, spender);
        assert_eq!(
            events[1].event,
            DerivativeEvent::CollateralDeposited {
                depositor: owner,
                amount
            }
        );
        assert_eq!(events[1].event.name(), "collateral_deposited");
    }

    #[test]
    fn test_decode_settled() {
        let log = ReceiptLog {
            address: Address::repeat_byte(0xdd),
            topics: vec![topic(Interface::CustomDerivative, "ContractSettled")],
            data: encode(&[Token::Uint(U256::from(2100u64))]),
        };
        assert_eq!(
            parse_log(&log),
            Some(DerivativeEvent::ContractSettled {
                final_price: U256::from(2100u64)
            })
        );
    }
}
