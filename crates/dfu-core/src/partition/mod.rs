//! Partition I/O layer.

pub mod memory;
pub mod table;
pub mod traits;

pub use memory::{
    Blocking, BlockingFlash, Deferred, DeferredEraseFlash, EraseStrategy, MemoryFlash,
    MemoryPartitions,
};
pub use table::{Banking, PartitionTable, UpgradablePartition};
pub use traits::{
    AppValidation, CopyOutcome, EraseOutcome, FlashEvent, FsValidation, PartitionError,
    PartitionHandle, PartitionIo, PartitionType,
};

use crate::store::{KeyStore, ResumeStore};

/// Close the open partition and record it as the last one finished.
///
/// The handle stays in `slot` when the key store has no room for the
/// bookkeeping write, so the caller can still abandon it later.
pub fn close_partition<F: PartitionIo, K: KeyStore>(
    io: &mut F,
    store: &mut ResumeStore<K>,
    slot: &mut Option<PartitionHandle>,
) -> Result<(), PartitionError> {
    if !store.has_space_for_save() {
        tracing::warn!(free = store.free_words(), "No room to record partition close");
        return Err(PartitionError::PsSpaceLow);
    }
    let Some(handle) = slot.take() else {
        return Ok(());
    };
    let physical = handle.physical();
    io.close(handle)
        .map_err(|_| PartitionError::CloseFailed(physical))?;

    store.record_mut().last_closed_partition = physical + 1;
    store
        .save()
        .map_err(|_| PartitionError::PsSpaceLow)?;
    tracing::info!(physical, "Partition closed and recorded");
    Ok(())
}
