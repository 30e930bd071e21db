//! Local state for derivative instances
//!
//! Handles:
//! - Immutable snapshots of on-chain state
//! - Unconfirmed local patches after confirmed writes
//! - Rendering for display

mod snapshot;
mod store;
mod view;

pub use snapshot::{DerivativeSnapshot, Position, Role};
pub use store::{LocalPatch, ReadTicket, SnapshotStore};
pub use view::{DepositActions, SnapshotView};

