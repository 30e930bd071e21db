//! In-memory snapshot store with unconfirmed local patches

use super::snapshot::{DerivativeSnapshot, Role};

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use ethers::types::{Address, H256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// A locally-known change that the chain has confirmed but that no
/// authoritative read has reflected yet
#[derive(Debug, Clone, PartialEq)]
pub struct LocalPatch {
    pub role: Role,
    pub tx_hash: H256,
    pub applied_at: DateTime<Utc>,
}

impl LocalPatch {
    pub fn deposit(role: Role, tx_hash: H256) -> Self {
        Self {
            role,
            tx_hash,
            applied_at: Utc::now(),
        }
    }

    fn apply(&self, snapshot: &DerivativeSnapshot) -> DerivativeSnapshot {
        snapshot.with_deposit(self.role, self.tx_hash)
    }
}

/// Position of a chain read relative to local patches, taken before the
/// read starts
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ReadTicket(u64);

struct Entry {
    authoritative: Arc<DerivativeSnapshot>,
    patch: Option<LocalPatch>,
    /// Sequence number of the latest patch
    patched_at: u64,
    /// Authoritative snapshot with the patch applied, rebuilt on every change
    view: Arc<DerivativeSnapshot>,
}

impl Entry {
    fn authoritative(snapshot: Arc<DerivativeSnapshot>) -> Self {
        Self {
            authoritative: snapshot.clone(),
            patch: None,
            patched_at: 0,
            view: snapshot,
        }
    }
}

/// Holds the latest snapshot per contract instance
pub struct SnapshotStore {
    entries: DashMap<Address, Entry>,
    updates: broadcast::Sender<Arc<DerivativeSnapshot>>,
    patch_sequence: AtomicU64,
}

impl SnapshotStore {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(64);
        Self {
            entries: DashMap::new(),
            updates,
            patch_sequence: AtomicU64::new(0),
        }
    }

    /// Mark the start of a chain read
    pub fn begin_read(&self) -> ReadTicket {
        ReadTicket(self.patch_sequence.load(Ordering::SeqCst))
    }

    /// Current view of an instance, including any unconfirmed patch
    pub fn current(&self, contract: &Address) -> Option<Arc<DerivativeSnapshot>> {
        self.entries.get(contract).map(|e| e.view.clone())
    }

    /// Last snapshot read from the chain, ignoring local patches
    pub fn authoritative(&self, contract: &Address) -> Option<Arc<DerivativeSnapshot>> {
        self.entries.get(contract).map(|e| e.authoritative.clone())
    }

    pub fn has_unconfirmed_patch(&self, contract: &Address) -> bool {
        self.entries
            .get(contract)
            .map(|e| e.patch.is_some())
            .unwrap_or(false)
    }

    /// Replace the snapshot with a fresh chain read, discarding local patches
    pub fn replace_authoritative(&self, snapshot: DerivativeSnapshot) -> Arc<DerivativeSnapshot> {
        self.replace_from_read(snapshot, self.begin_read())
    }

    /// Replace the snapshot with a chain read that started at `ticket`. A
    /// read that started before the latest patch may not reflect it, so the
    /// current view is kept and returned instead.
    pub fn replace_from_read(&self, snapshot: DerivativeSnapshot, ticket: ReadTicket) -> Arc<DerivativeSnapshot> {
        let address = snapshot.address;
        let snapshot = Arc::new(snapshot);

        match self.entries.entry(address) {
            MapEntry::Occupied(mut entry) => {
                let current = entry.get();
                if current.patch.is_some() && current.patched_at > ticket.0 {
                    debug!("Ignoring read of {:?} that started before the latest patch", address);
                    return current.view.clone();
                }
                if current.patch.is_some() {
                    debug!("Read of {:?} supersedes local patch", address);
                }
                entry.insert(Entry::authoritative(snapshot.clone()));
            }
            MapEntry::Vacant(entry) => {
                entry.insert(Entry::authoritative(snapshot.clone()));
            }
        }

        let _ = self.updates.send(snapshot.clone());
        snapshot
    }

    /// Record a confirmed local change on top of the authoritative snapshot
    pub fn apply_patch(&self, contract: &Address, patch: LocalPatch) -> Option<Arc<DerivativeSnapshot>> {
        let view = {
            let mut entry = self.entries.get_mut(contract)?;
            // Stack on an earlier patch so both deposits stay visible
            let base = if entry.patch.is_some() {
                (*entry.view).clone()
            } else {
                (*entry.authoritative).clone()
            };
            let view = Arc::new(patch.apply(&base));
            entry.patch = Some(patch);
            entry.patched_at = self.patch_sequence.fetch_add(1, Ordering::SeqCst) + 1;
            entry.view = view.clone();
            view
        };

        let _ = self.updates.send(view.clone());
        Some(view)
    }

    /// Subscribe to every new snapshot view
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DerivativeSnapshot>> {
        self.updates.subscribe()
    }
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}
