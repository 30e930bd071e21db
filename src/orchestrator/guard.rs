//! At most one write in flight per (contract, identity)

use crate::error::{ClientError, ClientResult, TxStage};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ethers::types::Address;
use std::sync::Arc;
use tracing::debug;

type WriteKey = (Address, Address);

/// Registry of writes currently in flight
#[derive(Default)]
pub struct WriteRegistry {
    in_flight: DashMap<WriteKey, TxStage>,
}

impl WriteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the write slot for `contract` as `identity`.
    /// The slot is released when the returned guard is dropped.
    pub fn acquire(
        self: &Arc<Self>,
        contract: Address,
        identity: Address,
        stage: TxStage,
    ) -> ClientResult<WriteGuard> {
        let key = (contract, identity);
        match self.in_flight.entry(key) {
            Entry::Occupied(existing) => {
                debug!(
                    "Rejecting {} on {:?}: {} already in flight",
                    stage,
                    contract,
                    existing.get()
                );
                Err(ClientError::OperationInProgress { contract, identity })
            }
            Entry::Vacant(slot) => {
                slot.insert(stage);
                Ok(WriteGuard {
                    registry: self.clone(),
                    key,
                })
            }
        }
    }

    pub fn in_flight(&self, contract: Address, identity: Address) -> Option<TxStage> {
        self.in_flight.get(&(contract, identity)).map(|s| *s)
    }
}

/// Holds a write slot until dropped
pub struct WriteGuard {
    registry: Arc<WriteRegistry>,
    key: WriteKey,
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        self.registry.in_flight.remove(&self.key);
    }
}
