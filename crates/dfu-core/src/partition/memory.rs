//! In-memory partition back-ends for simulation and testing.

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::traits::{
    AppValidation, CopyOutcome, EraseOutcome, FlashEvent, FsValidation, PartitionError,
    PartitionHandle, PartitionIo, PartitionType,
};

#[derive(Debug, Clone)]
struct MemoryPartition {
    kind: PartitionType,
    size: u32,
    first_word: Option<u16>,
    data: Vec<u8>,
}

#[derive(Debug, Default)]
struct FlashState {
    partitions: Vec<MemoryPartition>,
    /// Open partition and the generation of its handle.
    open: Option<(u16, u32)>,
    generation: u32,
    /// Pending completions; lost on power cycle.
    events: VecDeque<FlashEvent>,
    write_log: Vec<(u16, usize)>,
    open_log: Vec<u16>,
    erase_log: Vec<Vec<u16>>,
    open_conflicts: usize,
    fail_writes: bool,
    erase_ok: bool,
    copy_ok: bool,
    copy_async: bool,
    validation_ok: bool,
    validation_async: bool,
    app_validation: VecDeque<AppValidation>,
}

/// Flash contents shared between back-end instances and test code.
///
/// Cloning shares the same storage, so a simulated reboot keeps the data.
#[derive(Debug, Clone)]
pub struct MemoryPartitions {
    state: Arc<Mutex<FlashState>>,
}

impl MemoryPartitions {
    pub fn new(layout: &[(PartitionType, u32)]) -> Self {
        let partitions = layout
            .iter()
            .map(|&(kind, size)| MemoryPartition {
                kind,
                size,
                first_word: None,
                data: Vec::new(),
            })
            .collect();
        Self {
            state: Arc::new(Mutex::new(FlashState {
                partitions,
                erase_ok: true,
                copy_ok: true,
                validation_ok: true,
                ..Default::default()
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, FlashState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Payload written to a partition so far.
    pub fn contents(&self, physical: u16) -> Vec<u8> {
        self.state()
            .partitions
            .get(physical as usize)
            .map(|p| p.data.clone())
            .unwrap_or_default()
    }

    pub fn first_word(&self, physical: u16) -> Option<u16> {
        self.state()
            .partitions
            .get(physical as usize)
            .and_then(|p| p.first_word)
    }

    /// Every successful write as `(physical, length)`.
    pub fn write_log(&self) -> Vec<(u16, usize)> {
        self.state().write_log.clone()
    }

    /// Physical partitions in the order they were opened.
    pub fn open_log(&self) -> Vec<u16> {
        self.state().open_log.clone()
    }

    pub fn erase_log(&self) -> Vec<Vec<u16>> {
        self.state().erase_log.clone()
    }

    /// Opens refused because another partition was still open.
    pub fn open_conflicts(&self) -> usize {
        self.state().open_conflicts
    }

    pub fn is_open(&self) -> bool {
        self.state().open.is_some()
    }

    /// Make every subsequent write fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.state().fail_writes = fail;
    }

    pub fn set_erase_result(&self, ok: bool) {
        self.state().erase_ok = ok;
    }

    /// Configure the image copy: asynchronous copies finish through `poll_event`.
    pub fn set_image_copy(&self, asynchronous: bool, ok: bool) {
        let mut state = self.state();
        state.copy_async = asynchronous;
        state.copy_ok = ok;
    }

    /// Configure filesystem validation the same way as the image copy.
    pub fn set_fs_validation(&self, asynchronous: bool, ok: bool) {
        let mut state = self.state();
        state.validation_async = asynchronous;
        state.validation_ok = ok;
    }

    /// Queue results for `validate_application`; `Pass` once the queue is empty.
    pub fn push_app_validation(&self, result: AppValidation) {
        self.state().app_validation.push_back(result);
    }

    /// Inject a platform completion, e.g. an audio copy failure.
    pub fn inject_event(&self, event: FlashEvent) {
        self.state().events.push_back(event);
    }
}

/// How a back-end completes erases.
pub trait EraseStrategy: Send + 'static {
    const DEFERRED: bool;
}

/// Erase finishes before `erase` returns.
#[derive(Debug, Clone, Copy)]
pub struct Blocking;

/// Erase reports completion through `poll_event`.
#[derive(Debug, Clone, Copy)]
pub struct Deferred;

impl EraseStrategy for Blocking {
    const DEFERRED: bool = false;
}

impl EraseStrategy for Deferred {
    const DEFERRED: bool = true;
}

/// Partition back-end over [`MemoryPartitions`].
#[derive(Debug, Clone)]
pub struct MemoryFlash<E: EraseStrategy> {
    partitions: MemoryPartitions,
    _erase: PhantomData<E>,
}

pub type BlockingFlash = MemoryFlash<Blocking>;
pub type DeferredEraseFlash = MemoryFlash<Deferred>;

impl<E: EraseStrategy> MemoryFlash<E> {
    pub fn new(partitions: MemoryPartitions) -> Self {
        Self {
            partitions,
            _erase: PhantomData,
        }
    }

    /// Shared view of the flash contents.
    pub fn partitions(&self) -> &MemoryPartitions {
        &self.partitions
    }
}

impl<E: EraseStrategy> PartitionIo for MemoryFlash<E> {
    fn partition_count(&self) -> u16 {
        self.partitions.state().partitions.len() as u16
    }

    fn partition_type(&self, physical: u16) -> Option<PartitionType> {
        self.partitions
            .state()
            .partitions
            .get(physical as usize)
            .map(|p| p.kind)
    }

    fn partition_size(&self, physical: u16) -> Option<u32> {
        self.partitions
            .state()
            .partitions
            .get(physical as usize)
            .map(|p| p.size)
    }

    fn open(
        &mut self,
        logical: u16,
        physical: u16,
        first_word: u16,
    ) -> Result<PartitionHandle, PartitionError> {
        let mut state = self.partitions.state();
        if let Some((open, _)) = state.open {
            state.open_conflicts += 1;
            return Err(PartitionError::AlreadyOpen {
                requested: physical,
                open,
            });
        }
        let partition = state
            .partitions
            .get_mut(physical as usize)
            .ok_or(PartitionError::NoSuchPartition(physical))?;
        match partition.first_word {
            Some(existing) if existing != first_word => {
                return Err(PartitionError::OpenFailed(physical));
            }
            Some(_) => {}
            None => {
                partition.first_word = Some(first_word);
                partition.data.clear();
            }
        }
        state.generation = state.generation.wrapping_add(1);
        let generation = state.generation;
        state.open = Some((physical, generation));
        state.open_log.push(physical);
        tracing::debug!(logical, physical, "Partition opened");
        Ok(PartitionHandle::new(physical, logical, generation))
    }

    fn write(&mut self, handle: &PartitionHandle, data: &[u8]) -> usize {
        let mut state = self.partitions.state();
        if state.fail_writes || state.open != Some((handle.physical(), handle.generation())) {
            return 0;
        }
        let Some(partition) = state.partitions.get_mut(handle.physical() as usize) else {
            return 0;
        };
        if partition.data.len() + data.len() > partition.size as usize {
            return 0;
        }
        partition.data.extend_from_slice(data);
        state.write_log.push((handle.physical(), data.len()));
        data.len()
    }

    fn close(&mut self, handle: PartitionHandle) -> Result<(), PartitionError> {
        let mut state = self.partitions.state();
        if state.open != Some((handle.physical(), handle.generation())) {
            return Err(PartitionError::InvalidHandle(handle.physical()));
        }
        state.open = None;
        tracing::debug!(physical = handle.physical(), "Partition closed");
        Ok(())
    }

    fn offset(&self, handle: &PartitionHandle) -> u32 {
        self.partitions
            .state()
            .partitions
            .get(handle.physical() as usize)
            .map(|p| p.data.len() as u32)
            .unwrap_or(0)
    }

    fn read(&self, physical: u16, offset: u32, buf: &mut [u8]) -> Result<usize, PartitionError> {
        let state = self.partitions.state();
        let partition = state
            .partitions
            .get(physical as usize)
            .ok_or(PartitionError::NoSuchPartition(physical))?;
        let start = offset as usize;
        if start > partition.data.len() {
            return Err(PartitionError::ReadOutOfRange { physical, offset });
        }
        let n = buf.len().min(partition.data.len() - start);
        buf[..n].copy_from_slice(&partition.data[start..start + n]);
        Ok(n)
    }

    fn erase(&mut self, partitions: &[u16]) -> EraseOutcome {
        let mut state = self.partitions.state();
        let ok = state.erase_ok;
        if ok {
            for &physical in partitions {
                if state.open.map(|(open, _)| open) == Some(physical) {
                    state.open = None;
                }
                if let Some(partition) = state.partitions.get_mut(physical as usize) {
                    partition.first_word = None;
                    partition.data.clear();
                }
            }
        }
        state.erase_log.push(partitions.to_vec());
        tracing::debug!(?partitions, deferred = E::DEFERRED, "Erase requested");
        if E::DEFERRED {
            state.events.push_back(FlashEvent::EraseDone { ok });
            EraseOutcome::Pending
        } else {
            EraseOutcome::Done
        }
    }

    fn start_image_copy(&mut self) -> CopyOutcome {
        let mut state = self.partitions.state();
        let ok = state.copy_ok;
        if state.copy_async {
            state.events.push_back(FlashEvent::CopyDone { ok });
            CopyOutcome::Pending
        } else {
            CopyOutcome::Done(ok)
        }
    }

    fn validate_partitions(&mut self) -> FsValidation {
        let mut state = self.partitions.state();
        let ok = state.validation_ok;
        if state.validation_async {
            state.events.push_back(FlashEvent::ValidationDone { ok });
            FsValidation::InProgress
        } else {
            FsValidation::Done(ok)
        }
    }

    fn validate_application(&mut self) -> AppValidation {
        self.partitions
            .state()
            .app_validation
            .pop_front()
            .unwrap_or(AppValidation::Pass)
    }

    fn poll_event(&mut self) -> Option<FlashEvent> {
        self.partitions.state().events.pop_front()
    }

    fn power_cycle(&mut self) {
        let mut state = self.partitions.state();
        state.open = None;
        state.events.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> MemoryPartitions {
        MemoryPartitions::new(&[(PartitionType::Exe, 64), (PartitionType::Data, 32)])
    }

    #[test]
    fn test_single_open_handle() {
        let mut flash = BlockingFlash::new(layout());
        let handle = flash.open(0, 0, 0xAA55).unwrap();
        assert!(matches!(
            flash.open(1, 1, 0),
            Err(PartitionError::AlreadyOpen { requested: 1, open: 0 })
        ));
        assert_eq!(flash.partitions().open_conflicts(), 1);
        flash.close(handle).unwrap();
        assert!(flash.open(1, 1, 0).is_ok());
    }

    #[test]
    fn test_write_capture_and_read_back() {
        let mut flash = BlockingFlash::new(layout());
        let handle = flash.open(0, 0, 1).unwrap();
        assert_eq!(flash.write(&handle, b"Hello"), 5);
        assert_eq!(flash.write(&handle, b"World"), 5);
        assert_eq!(flash.offset(&handle), 10);

        let mut buf = [0u8; 4];
        assert_eq!(flash.read(0, 6, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"orld");
        assert_eq!(flash.partitions().write_log(), vec![(0, 5), (0, 5)]);
        assert_eq!(flash.partitions().first_word(0), Some(1));
    }

    #[test]
    fn test_reopen_resumes_at_offset() {
        let shared = layout();
        let mut flash = BlockingFlash::new(shared.clone());
        let handle = flash.open(0, 0, 7).unwrap();
        flash.write(&handle, &[1, 2, 3]);
        flash.power_cycle();

        let mut rebooted = BlockingFlash::new(shared);
        let handle = rebooted.open(0, 0, 7).unwrap();
        assert_eq!(rebooted.offset(&handle), 3);
        assert_eq!(rebooted.write(&PartitionHandle::new(0, 0, 0), &[9]), 0);
    }

    #[test]
    fn test_write_overflow_and_failure() {
        let mut flash = BlockingFlash::new(layout());
        let handle = flash.open(1, 1, 0).unwrap();
        assert_eq!(flash.write(&handle, &[0; 33]), 0);
        flash.partitions().set_fail_writes(true);
        assert_eq!(flash.write(&handle, &[0; 4]), 0);
    }

    #[test]
    fn test_blocking_erase() {
        let mut flash = BlockingFlash::new(layout());
        let handle = flash.open(0, 0, 0).unwrap();
        flash.write(&handle, &[1; 8]);
        flash.close(handle).unwrap();
        assert_eq!(flash.erase(&[0]), EraseOutcome::Done);
        assert!(flash.partitions().contents(0).is_empty());
        assert_eq!(flash.poll_event(), None);
    }

    #[test]
    fn test_deferred_erase_completes_on_poll() {
        let mut flash = DeferredEraseFlash::new(layout());
        assert_eq!(flash.erase(&[0, 1]), EraseOutcome::Pending);
        assert_eq!(flash.poll_event(), Some(FlashEvent::EraseDone { ok: true }));
        assert_eq!(flash.poll_event(), None);
        assert_eq!(flash.partitions().erase_log(), vec![vec![0, 1]]);
    }

    #[test]
    fn test_async_validation_and_copy() {
        let mut flash = BlockingFlash::new(layout());
        flash.partitions().set_fs_validation(true, false);
        flash.partitions().set_image_copy(true, true);
        assert_eq!(flash.validate_partitions(), FsValidation::InProgress);
        assert_eq!(flash.start_image_copy(), CopyOutcome::Pending);
        assert_eq!(
            flash.poll_event(),
            Some(FlashEvent::ValidationDone { ok: false })
        );
        assert_eq!(flash.poll_event(), Some(FlashEvent::CopyDone { ok: true }));
    }

    #[test]
    fn test_app_validation_queue() {
        let mut flash = BlockingFlash::new(layout());
        flash.partitions().push_app_validation(AppValidation::Running);
        assert_eq!(flash.validate_application(), AppValidation::Running);
        assert_eq!(flash.validate_application(), AppValidation::Pass);
    }
}
