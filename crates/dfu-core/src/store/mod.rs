//! Persistent state: key store, resume records and the header log.

pub mod header_log;
pub mod keystore;
pub mod record;
pub mod resume;

pub use header_log::HeaderLog;
pub use keystore::{KeyStore, MemoryKeyStore, StoreError};
pub use record::{LoaderResult, PartitionsState, PeerRecord, ResumePoint, ResumeRecord};
pub use resume::ResumeStore;
