//! DFU-Core: earbud device firmware upgrade engine in Rust.
//!
//! This crate implements the device side of a host-driven upgrade: a phone
//! streams an upgrade file over a transport, the device writes it into
//! spare flash banks, validates it, reboots into it and commits. A primary
//! earbud can relay the same file to its secondary over the peer link.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Opcodes, host messages, status codes
//! - **File**: Upgrade file format and the streaming partition parser
//! - **Partition**: Flash partition I/O abstraction (in-memory banks)
//! - **Validation**: SHA-256 check of the received file
//! - **Store**: Persistent resume record in a key store
//! - **SM**: Host upgrade state machine
//! - **Sink**: Response delivery by device role
//! - **Peer**: Relay to the secondary and partition mirror
//! - **Events**: Observer pattern for UI decoupling
//! - **Session**: Orchestrator with transport, timers and peer link
//! - **Sim**: Scripted host and earbud pair
//!
//! # Example
//!
//! ```no_run
//! use dfu_core::partition::BlockingFlash;
//! use dfu_core::session::{DfuConfig, DfuSession};
//! use dfu_core::sim::{run_single, HostDriver, HostOptions};
//! use dfu_core::store::MemoryKeyStore;
//!
//! let config = DfuConfig::default();
//! let flash = BlockingFlash::new(config.memory_partitions());
//! let mut session = DfuSession::new(config, flash, MemoryKeyStore::default());
//! session.init_from_config();
//!
//! let file = std::fs::read("upgrade.bin").expect("read file");
//! let mut host = HostDriver::new(file, HostOptions::default());
//! host.connect(&mut session);
//! let (_session, outcome) = run_single(session, &mut host);
//! println!("{outcome:?}");
//! ```

pub mod events;
pub mod file;
pub mod partition;
pub mod peer;
pub mod protocol;
pub mod session;
pub mod sim;
pub mod sink;
pub mod sm;
pub mod store;
pub mod timer;
pub mod validation;

// Re-exports for convenience
pub use events::{DfuEvent, DfuObserver, Link, NullObserver, PacketDirection, RecordingObserver, TracingObserver};
pub use file::{FileSummary, UpgradeFileBuilder, UpgradeHeader, Version, inspect};
pub use partition::{BlockingFlash, DeferredEraseFlash, PartitionIo, PartitionTable, PartitionType};
pub use peer::{PeerRelay, RelayState};
pub use protocol::{Action, HostMessage, HostResponse, UpgradeStatus};
pub use session::{DfuConfig, DfuSession, PeerLinkRequest, TransportNotice};
pub use sim::{DevicePair, HostDriver, HostOptions, HostOutcome, run_single};
pub use sm::{AppIndication, DeviceRole, Permission, UpgradeState};
pub use store::{KeyStore, MemoryKeyStore, ResumePoint, ResumeStore};
pub use validation::Validator;
