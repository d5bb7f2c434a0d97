//! Host upgrade protocol state machine.
//!
//! [`handle`] takes the owned [`UpgradeContext`] and one [`UpgradeEvent`] and
//! returns the [`Effect`]s for the caller to carry out: responses, timers,
//! indications, peer commands and reboots. Flash and key-store access go
//! through the context's [`PartitionIo`](crate::partition::PartitionIo) and
//! [`KeyStore`](crate::store::KeyStore).

mod context;
mod event;
mod handlers;
mod state;

pub use context::{CopyState, PeerStatus, UpgradeContext, UpgradeSettings};
pub use event::{AppIndication, Effect, Effects, PeerCommand, PeerNotification, UpgradeEvent};
pub use handlers::{HandleResult, handle};
pub use state::{
    DeviceRole, EndDataStatus, Permission, PermissionError, ProgressStatus, ReconnectRecommendation,
    UpgradeState,
};
