//! Signing identity change notification

use super::SigningProvider;

use ethers::types::Address;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

/// Polls the signer and publishes the connected identity whenever it changes
pub struct IdentityWatcher {
    signer: Arc<dyn SigningProvider>,
    poll_interval: Duration,
    current: watch::Sender<Option<Address>>,
    shutdown: Arc<RwLock<bool>>,
}

impl IdentityWatcher {
    pub fn new(signer: Arc<dyn SigningProvider>, poll_interval: Duration) -> Self {
        let (current, _) = watch::channel(None);
        Self {
            signer,
            poll_interval,
            current,
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    /// Receiver that always holds the latest known identity
    pub fn subscribe(&self) -> watch::Receiver<Option<Address>> {
        self.current.subscribe()
    }

    pub fn current(&self) -> Option<Address> {
        *self.current.borrow()
    }

    /// Query the signer once; returns true when the identity changed
    pub async fn refresh(&self) -> bool {
        match self.signer.identity().await {
            Ok(identity) => self.current.send_if_modified(|current| {
                if *current == identity {
                    return false;
                }
                info!("Signing identity changed: {:?} -> {:?}", current, identity);
                *current = identity;
                true
            }),
            Err(e) => {
                warn!("Failed to query signing identity: {}", e);
                false
            }
        }
    }

    pub async fn run(&self) {
        let mut ticker = interval(self.poll_interval);
        info!("Identity watcher started");

        loop {
            if *self.shutdown.read().await {
                break;
            }
            ticker.tick().await;
            if !self.refresh().await {
                debug!("Signing identity unchanged");
            }
        }

        info!("Identity watcher stopped");
    }

    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
    }
}
