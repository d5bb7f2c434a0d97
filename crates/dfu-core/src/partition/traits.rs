//! Partition I/O abstraction.
//!
//! Defines the `PartitionIo` trait the engine writes flash through,
//! allowing different implementations (platform flash, in-memory, etc.).

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PartitionError {
    #[error("Partition {0} does not exist")]
    NoSuchPartition(u16),

    #[error("Cannot open partition {requested}: partition {open} is still open")]
    AlreadyOpen { requested: u16, open: u16 },

    #[error("Open failed for partition {0}")]
    OpenFailed(u16),

    #[error("Stale handle for partition {0}")]
    InvalidHandle(u16),

    #[error("Close failed for partition {0}")]
    CloseFailed(u16),

    #[error("Persistent store has no room to record the close")]
    PsSpaceLow,

    #[error("Read past end of partition {physical} at offset {offset}")]
    ReadOutOfRange { physical: u16, offset: u32 },
}

/// What a physical partition holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionType {
    Exe,
    /// Single-bank image installed by the DFU loader.
    Dfu,
    Config,
    Data,
    DataRawSerial,
}

/// Write handle for an open partition.
///
/// Not `Clone`: a handle is owned by whoever opened the partition.
#[derive(Debug, PartialEq, Eq)]
pub struct PartitionHandle {
    physical: u16,
    logical: u16,
    generation: u32,
}

impl PartitionHandle {
    /// Only back-ends mint handles.
    pub fn new(physical: u16, logical: u16, generation: u32) -> Self {
        Self {
            physical,
            logical,
            generation,
        }
    }

    pub fn physical(&self) -> u16 {
        self.physical
    }

    pub fn logical(&self) -> u16 {
        self.logical
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EraseOutcome {
    Done,
    /// Completion arrives later as [`FlashEvent::EraseDone`].
    Pending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyOutcome {
    Done(bool),
    /// Completion arrives later as [`FlashEvent::CopyDone`].
    Pending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsValidation {
    Done(bool),
    /// Completion arrives later as [`FlashEvent::ValidationDone`].
    InProgress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppValidation {
    /// Still checking; ask again.
    Running,
    Pass,
    /// Platform has nothing to check.
    Skip,
}

/// Asynchronous completions reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashEvent {
    EraseDone { ok: bool },
    CopyDone { ok: bool },
    ValidationDone { ok: bool },
    /// The audio image copy failed after the main copy was requested.
    AudioCopyFailed,
}

/// Abstract partition interface.
///
/// At most one partition may be open for writing at any time.
pub trait PartitionIo: Send {
    /// Number of physical partitions.
    fn partition_count(&self) -> u16;

    fn partition_type(&self, physical: u16) -> Option<PartitionType>;

    /// Size in bytes.
    fn partition_size(&self, physical: u16) -> Option<u32>;

    /// Open a partition for writing. Reopening a partially written partition
    /// resumes at its current offset.
    fn open(
        &mut self,
        logical: u16,
        physical: u16,
        first_word: u16,
    ) -> Result<PartitionHandle, PartitionError>;

    /// Append bytes; returns the count written, 0 on failure.
    fn write(&mut self, handle: &PartitionHandle, data: &[u8]) -> usize;

    fn close(&mut self, handle: PartitionHandle) -> Result<(), PartitionError>;

    /// Bytes written so far, not counting the first word.
    fn offset(&self, handle: &PartitionHandle) -> u32;

    /// Read back written bytes.
    fn read(&self, physical: u16, offset: u32, buf: &mut [u8]) -> Result<usize, PartitionError>;

    fn erase(&mut self, partitions: &[u16]) -> EraseOutcome;

    /// Copy the new image into place ahead of the swap.
    fn start_image_copy(&mut self) -> CopyOutcome;

    /// Check the filesystems written during this upgrade.
    fn validate_partitions(&mut self) -> FsValidation;

    /// Check the running application after a reboot into the new image.
    fn validate_application(&mut self) -> AppValidation;

    /// Next pending completion, if any.
    fn poll_event(&mut self) -> Option<FlashEvent>;

    /// Forget volatile state (open handle, operations in flight) after a reset.
    fn power_cycle(&mut self);
}
