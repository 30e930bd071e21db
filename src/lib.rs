//! Client for two-party custom derivative contracts on EVM chains
//!
//! Reads instance state into immutable snapshots, deploys new instances
//! through the factory, and drives the approve-then-deposit sequence for
//! either party with bounded confirmation waits.

pub mod api;
pub mod assets;
pub mod chain;
pub mod config;
pub mod contracts;
pub mod error;
pub mod events;
pub mod metrics;
pub mod orchestrator;
pub mod state;
pub mod units;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{ClientError, ClientResult};
pub use orchestrator::ContractInteractionOrchestrator;
