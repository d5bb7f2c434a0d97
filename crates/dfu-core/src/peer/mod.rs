//! Peer DFU: relaying an upgrade from the primary earbud to the secondary.
//!
//! The primary receives the file from the host, writes it to its own
//! partitions, and in parallel plays host to the secondary over the peer
//! link. [`PeerRelay`] drives that second conversation and reads the file
//! back through [`PartitionMirror`].

pub mod mirror;
pub mod relay;

pub use mirror::{MirrorError, PartitionMirror};
pub use relay::{
    dfu_info, set_dfu_mode, set_role, DfuInfo, PeerRelay, RelayEffect, RelayEnv, RelayInput, RelaySettings,
    RelayState,
};
