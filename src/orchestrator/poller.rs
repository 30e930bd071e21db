//! Periodic snapshot refresh

use super::ContractInteractionOrchestrator;

use ethers::types::Address;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info};

/// Re-reads one instance on a fixed interval. A failed read is logged by the
/// orchestrator and the previous snapshot stays current.
pub struct SnapshotPoller {
    orchestrator: Arc<ContractInteractionOrchestrator>,
    contract: Address,
    poll_interval: Duration,
    shutdown: Arc<RwLock<bool>>,
}

impl SnapshotPoller {
    pub fn new(
        orchestrator: Arc<ContractInteractionOrchestrator>,
        contract: Address,
        poll_interval: Duration,
    ) -> Self {
        Self {
            orchestrator,
            contract,
            poll_interval,
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    pub async fn run(&self) {
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Snapshot poller started for {:?}", self.contract);

        loop {
            ticker.tick().await;
            if *self.shutdown.read().await {
                break;
            }
            if self.orchestrator.read_snapshot(self.contract).await.is_ok() {
                debug!("Polled {:?}", self.contract);
            }
        }

        info!("Snapshot poller stopped for {:?}", self.contract);
    }

    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
    }
}
