//! Streaming upgrade file parser and partition writer.
//!
//! The parser always names the exact number of bytes it wants next, so the
//! host never sends more than can be consumed. Partition payload is written
//! through [`PartitionIo`] as it arrives; nothing but section headers is
//! buffered.

use std::fmt;

use tracing::{debug, info, warn};

use super::format::*;
use crate::partition::{self, PartitionError, PartitionHandle, PartitionIo, PartitionTable, PartitionType};
use crate::protocol::{UpgradeStatus, VARIANT_SIZE};
use crate::store::{HeaderLog, KeyStore, PartitionsState, ResumeStore, StoreError};
use crate::validation::Validator;

/// Largest upgrade header body accepted.
pub const MAX_UPGRADE_HEADER_SIZE: u32 = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParserState {
    #[default]
    GenericFirstPart,
    Header,
    PartitionHeader,
    Data,
    Footer,
    Complete,
}

impl fmt::Display for ParserState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParserState::GenericFirstPart => write!(f, "GENERIC_FIRST_PART"),
            ParserState::Header => write!(f, "HEADER"),
            ParserState::PartitionHeader => write!(f, "PARTITION_HEADER"),
            ParserState::Data => write!(f, "DATA"),
            ParserState::Footer => write!(f, "FOOTER"),
            ParserState::Complete => write!(f, "COMPLETE"),
        }
    }
}

/// Result of a successful [`PartitionDataParser::parse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseOutcome {
    /// All input consumed; another request may be pending.
    Success,
    /// The footer has been read.
    TransferComplete,
}

/// Everything the parser touches outside itself.
pub struct ParseEnv<'a, F: PartitionIo, K: KeyStore> {
    pub flash: &'a mut F,
    pub store: &'a mut ResumeStore<K>,
    pub validator: &'a mut Validator,
    pub table: &'a PartitionTable,
    /// Device variant; all zeros accepts any file.
    pub variant: &'a [u8; VARIANT_SIZE],
    /// Receives every non-payload byte when the peer relay is in use.
    pub header_log: Option<&'a mut HeaderLog>,
}

impl<F: PartitionIo, K: KeyStore> ParseEnv<'_, F, K> {
    fn hash(&mut self, data: &[u8], on_fail: UpgradeStatus) -> Result<(), UpgradeStatus> {
        if self.validator.update(data) {
            Ok(())
        } else {
            Err(on_fail)
        }
    }

    fn log(&mut self, data: &[u8]) -> Result<(), UpgradeStatus> {
        match self.header_log.as_mut() {
            Some(log) => log.append(self.store.keys_mut(), data).map_err(store_status),
            None => Ok(()),
        }
    }

    fn log_reset(&mut self) -> Result<(), UpgradeStatus> {
        match self.header_log.as_mut() {
            Some(log) => log.reset(self.store.keys_mut()).map_err(store_status),
            None => Ok(()),
        }
    }
}

fn store_status(err: StoreError) -> UpgradeStatus {
    warn!(error = %err, "Key store write failed");
    match err {
        StoreError::NoSpace { .. } => UpgradeStatus::PartitionCloseFailedPsSpace,
        StoreError::TooLong { .. } => UpgradeStatus::NoMemory,
    }
}

/// Per-attempt parser context. Created on START_DATA_REQ, dropped on abort
/// or once the transfer completes.
#[derive(Debug, Default)]
pub struct PartitionDataParser {
    state: ParserState,
    buffer: Vec<u8>,
    /// Bytes still owed on the current request.
    expected: u32,
    next_request: Option<(u32, u32)>,
    partition_length: u32,
    partition_remaining: u32,
    open_handle: Option<PartitionHandle>,
    open_next_partition: bool,
    is_dfu_single_bank: bool,
    signature: Vec<u8>,
}

impl PartitionDataParser {
    pub fn new() -> Self {
        let mut parser = Self::default();
        parser.request(HEADER_FIRST_PART_SIZE as u32, 0);
        parser
    }

    pub fn state(&self) -> ParserState {
        self.state
    }

    /// Next `(count, skip)` to ask the host for, yielded once.
    pub fn take_next_request(&mut self) -> Option<(u32, u32)> {
        self.next_request.take()
    }

    pub fn has_open_partition(&self) -> bool {
        self.open_handle.is_some()
    }

    pub fn is_dfu_single_bank(&self) -> bool {
        self.is_dfu_single_bank
    }

    /// Footer signature, empty until the footer is read.
    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    /// Drop the context, closing any partition left open.
    pub fn abandon<F: PartitionIo>(mut self, flash: &mut F) {
        if let Some(handle) = self.open_handle.take() {
            let physical = handle.physical();
            if let Err(e) = flash.close(handle) {
                warn!(physical, error = %e, "Close on abandon failed");
            }
        }
    }

    fn request(&mut self, count: u32, skip: u32) {
        debug!(count, skip, "Requesting bytes");
        self.expected = count;
        self.next_request = Some((count, skip));
    }

    /// Consume host bytes, possibly spanning several requests.
    pub fn parse<F: PartitionIo, K: KeyStore>(
        &mut self,
        mut data: &[u8],
        env: &mut ParseEnv<'_, F, K>,
    ) -> Result<ParseOutcome, UpgradeStatus> {
        while !data.is_empty() {
            if self.state == ParserState::Complete {
                warn!(extra = data.len(), "Bytes after footer");
                return Err(UpgradeStatus::FileTooBig);
            }
            if self.expected == 0 {
                warn!(len = data.len(), state = %self.state, "Unrequested bytes");
                return Err(UpgradeStatus::InternalError1);
            }
            // A skip only applies to the next packet.
            if matches!(self.next_request, Some((_, skip)) if skip > 0) {
                warn!("Bytes arrived past a pending skip");
                return Err(UpgradeStatus::BadLengthDatahdrResume);
            }

            let take = (self.expected as usize).min(data.len());
            let (chunk, rest) = data.split_at(take);
            data = rest;
            self.expected -= take as u32;

            if self.state == ParserState::Data {
                self.handle_data(chunk, env)?;
                continue;
            }
            self.buffer.extend_from_slice(chunk);
            if self.expected > 0 {
                continue;
            }
            let section = std::mem::take(&mut self.buffer);
            match self.state {
                ParserState::GenericFirstPart => self.handle_generic(&section, env)?,
                ParserState::Header => self.handle_header(&section, env)?,
                ParserState::PartitionHeader => self.handle_partition_header(&section, env)?,
                ParserState::Footer => self.handle_footer(section, env)?,
                ParserState::Data | ParserState::Complete => {
                    return Err(UpgradeStatus::InternalError2);
                }
            }
        }

        Ok(if self.state == ParserState::Complete {
            ParseOutcome::TransferComplete
        } else {
            ParseOutcome::Success
        })
    }

    fn goto_state(&mut self, new_state: ParserState) {
        debug!(from = %self.state, to = %new_state, "Parser state");
        self.state = new_state;
    }

    fn handle_generic<F: PartitionIo, K: KeyStore>(
        &mut self,
        section: &[u8],
        env: &mut ParseEnv<'_, F, K>,
    ) -> Result<(), UpgradeStatus> {
        let prefix = match SectionPrefix::from_bytes(section) {
            Ok(prefix) => prefix,
            Err(FormatError::UnknownTag(tag)) => {
                warn!(tag = %String::from_utf8_lossy(&tag), "Unknown section");
                return Err(UpgradeStatus::UnknownId);
            }
            Err(_) => return Err(UpgradeStatus::BadLengthTooShort),
        };
        debug!(tag = %prefix.tag, length = prefix.length, "Section");

        match prefix.tag {
            SectionTag::Header => {
                if prefix.length < UPGRADE_HEADER_MIN_SECOND_PART_SIZE
                    || prefix.length > MAX_UPGRADE_HEADER_SIZE
                {
                    return Err(UpgradeStatus::BadLengthUpgradeHeader);
                }
                env.log_reset()?;
                self.request(prefix.length, 0);
                self.goto_state(ParserState::Header);
            }
            SectionTag::Partition => {
                if prefix.length < PARTITION_SECOND_HEADER_SIZE {
                    return Err(UpgradeStatus::BadLengthPartitionHeader);
                }
                self.partition_length = prefix.length - PARTITION_SECOND_HEADER_SIZE;
                self.request(PARTITION_SECOND_HEADER_SIZE, 0);
                self.goto_state(ParserState::PartitionHeader);
            }
            SectionTag::Footer => {
                if prefix.length != EXPECTED_SIGNATURE_SIZE {
                    return Err(UpgradeStatus::BadLengthSignature);
                }
                self.request(prefix.length, 0);
                self.goto_state(ParserState::Footer);
            }
        }

        env.hash(section, UpgradeStatus::OemValidationFailedHeaders)?;
        env.log(section)
    }

    fn handle_header<F: PartitionIo, K: KeyStore>(
        &mut self,
        section: &[u8],
        env: &mut ParseEnv<'_, F, K>,
    ) -> Result<(), UpgradeStatus> {
        let header =
            UpgradeHeader::from_bytes(section).map_err(|_| UpgradeStatus::BadLengthUpgradeHeader)?;

        if env.variant.iter().any(|&b| b != 0) && header.variant != *env.variant {
            warn!(
                file = %variant_name(&header.variant),
                device = %variant_name(env.variant),
                "Variant mismatch"
            );
            return Err(UpgradeStatus::WrongVariant);
        }

        let record = env.store.record();
        if !header.accepts_version(&record.active_version) {
            warn!(running = %record.active_version, new = %header.version, "Version incompatible");
            return Err(UpgradeStatus::WarnAppConfigVersionIncompatible);
        }
        if !header.accepts_config(record.active_config_version) {
            warn!(
                running = record.active_config_version,
                new = header.config_version,
                "Config version incompatible"
            );
            return Err(UpgradeStatus::WarnAppConfigVersionIncompatible);
        }

        env.hash(section, UpgradeStatus::OemValidationFailedUpgradeHeader)?;
        env.log(section)?;

        let record = env.store.record_mut();
        record.in_progress_version = header.version;
        record.in_progress_config_version = header.config_version;
        record.partitions_state = PartitionsState::Upgrading;
        env.store.save().map_err(store_status)?;
        info!(version = %header.version, config = header.config_version, "Upgrade header accepted");

        self.request(HEADER_FIRST_PART_SIZE as u32, 0);
        self.goto_state(ParserState::GenericFirstPart);
        Ok(())
    }

    fn handle_partition_header<F: PartitionIo, K: KeyStore>(
        &mut self,
        section: &[u8],
        env: &mut ParseEnv<'_, F, K>,
    ) -> Result<(), UpgradeStatus> {
        let header = PartitionHeader::from_bytes(section)
            .map_err(|_| UpgradeStatus::BadLengthPartitionHeader)?;
        let record = env.store.record();
        let entry = env
            .table
            .get(header.logical)
            .copied()
            .ok_or(UpgradeStatus::WrongPartitionNumber)?;
        let physical = env
            .table
            .physical_for_write(header.logical, record.partition_bitmap)
            .ok_or(UpgradeStatus::WrongPartitionNumber)?;
        if physical >= env.flash.partition_count() {
            warn!(physical, count = env.flash.partition_count(), "Partition out of range");
            return Err(UpgradeStatus::WrongPartitionNumber);
        }

        let length = self.partition_length;
        let last_closed = record.last_closed_partition;
        if last_closed != 0 && !self.open_next_partition {
            // Written before the reboot: hash it back in and skip the payload.
            if last_closed == physical + 1 {
                self.open_next_partition = true;
            }
            info!(physical, length, "Partition already written, replaying");
            env.hash(section, UpgradeStatus::OemValidationFailedPartitionHeader1)?;
            env.log(section)?;
            self.replay(env, physical, 0, length)?;
            self.request(HEADER_FIRST_PART_SIZE as u32, length);
            self.goto_state(ParserState::GenericFirstPart);
            return Ok(());
        }

        let actual = env.flash.partition_type(physical);
        if actual != Some(entry.kind) {
            warn!(physical, expected = ?entry.kind, actual = ?actual, "Partition type mismatch");
            return Err(UpgradeStatus::PartitionTypeNotMatching);
        }

        if entry.kind == PartitionType::Dfu {
            let dfu = &mut env.store.record_mut().dfu_partition_number;
            if *dfu != 0 && *dfu != physical + 1 {
                warn!(physical, previous = *dfu - 1, "Second DFU partition");
                return Err(UpgradeStatus::PartitionTypeTwoDfu);
            }
            *dfu = physical + 1;
            self.is_dfu_single_bank = true;
        }

        let size = env.flash.partition_size(physical).unwrap_or(0);
        if length > size {
            warn!(physical, length, size, "Partition too small for payload");
            return Err(UpgradeStatus::PartitionSizeMismatch);
        }

        env.hash(section, UpgradeStatus::OemValidationFailedPartitionHeader1)?;
        env.log(section)?;

        let handle = env
            .flash
            .open(header.logical, physical, header.first_word)
            .map_err(|e| {
                warn!(physical, error = %e, "Partition open failed");
                UpgradeStatus::PartitionOpenFailed
            })?;
        let offset = env.flash.offset(&handle);
        self.open_handle = Some(handle);
        if entry.banking.is_double() {
            env.store.record_mut().pending_bitmap |= partition::table::bit(header.logical);
        }
        info!(logical = header.logical, physical, length, offset, "Partition opened");

        if offset < length {
            self.replay(env, physical, 0, offset)?;
            self.partition_remaining = length - offset;
            self.request(length - offset, offset);
            self.goto_state(ParserState::Data);
        } else {
            self.replay(env, physical, 0, length)?;
            self.finish_partition(env, length)?;
        }
        Ok(())
    }

    fn handle_data<F: PartitionIo, K: KeyStore>(
        &mut self,
        chunk: &[u8],
        env: &mut ParseEnv<'_, F, K>,
    ) -> Result<(), UpgradeStatus> {
        env.hash(chunk, UpgradeStatus::OemValidationFailedPartitionData)?;
        let handle = self.open_handle.as_ref().ok_or(UpgradeStatus::InternalError4)?;
        let written = env.flash.write(handle, chunk);
        if written != chunk.len() {
            warn!(wanted = chunk.len(), written, "Partition write failed");
            return Err(UpgradeStatus::PartitionWriteFailedData);
        }
        self.partition_remaining -= chunk.len() as u32;
        if self.partition_remaining == 0 {
            self.finish_partition(env, 0)?;
        }
        Ok(())
    }

    fn handle_footer<F: PartitionIo, K: KeyStore>(
        &mut self,
        section: Vec<u8>,
        env: &mut ParseEnv<'_, F, K>,
    ) -> Result<(), UpgradeStatus> {
        env.log(&section)?;
        self.signature = section;
        self.next_request = None;
        self.goto_state(ParserState::Complete);
        info!("Footer received");
        Ok(())
    }

    /// Close the open partition and ask for the next section prefix.
    fn finish_partition<F: PartitionIo, K: KeyStore>(
        &mut self,
        env: &mut ParseEnv<'_, F, K>,
        skip: u32,
    ) -> Result<(), UpgradeStatus> {
        partition::close_partition(&mut *env.flash, &mut *env.store, &mut self.open_handle)
            .map_err(|e| match e {
                PartitionError::PsSpaceLow => UpgradeStatus::PartitionCloseFailedPsSpace,
                _ => UpgradeStatus::PartitionCloseFailed,
            })?;
        self.open_next_partition = true;
        self.request(HEADER_FIRST_PART_SIZE as u32, skip);
        self.goto_state(ParserState::GenericFirstPart);
        Ok(())
    }

    fn replay<F: PartitionIo, K: KeyStore>(
        &mut self,
        env: &mut ParseEnv<'_, F, K>,
        physical: u16,
        skip: u32,
        len: u32,
    ) -> Result<(), UpgradeStatus> {
        if len == 0 {
            return Ok(());
        }
        env.validator
            .replay(&*env.flash, physical, skip, len)
            .map(|_| ())
            .map_err(|e| {
                warn!(physical, error = %e, "Replay failed");
                UpgradeStatus::OemValidationFailedPartitionData
            })
    }
}
