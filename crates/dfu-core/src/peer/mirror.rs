//! Read-back of the received upgrade file for the peer relay.
//!
//! The file is never stored whole. Everything but partition payload sits in
//! the [`HeaderLog`]; payload sits in the partitions it was written to. The
//! mirror stitches the two back into the original byte stream.

use thiserror::Error;
use tracing::debug;

use crate::file::{PartitionHeader, SectionPrefix, SectionTag, PARTITION_SECOND_HEADER_SIZE};
use crate::partition::{PartitionError, PartitionIo, PartitionTable};
use crate::store::HeaderLog;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MirrorError {
    #[error("Header log ends inside a section at byte {0}")]
    TruncatedLog(usize),

    #[error("Header log holds an unreadable section prefix at byte {0}")]
    BadPrefix(usize),

    #[error("Header log holds no upgrade header")]
    EmptyLog,

    #[error("No partition to read logical partition {0} from")]
    UnknownPartition(u16),

    #[error("Partition {physical} holds fewer bytes than the file needs at offset {offset}")]
    ShortPartition { physical: u16, offset: u32 },

    #[error(transparent)]
    Partition(#[from] PartitionError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    /// Bytes `start..start + len` of the header log.
    Log { start: usize },
    /// Payload of a physical partition from offset 0.
    Flash { physical: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Segment {
    /// Offset of the segment within the file.
    file_offset: u64,
    len: u64,
    source: Source,
}

/// Cursor over the reconstructed upgrade file.
#[derive(Debug, Clone)]
pub struct PartitionMirror {
    log: Vec<u8>,
    segments: Vec<Segment>,
    total: u64,
    position: u64,
}

impl PartitionMirror {
    /// Lay out the file from the header log. Payload goes where the parser
    /// wrote it: the inactive bank of each logical partition.
    pub fn build(log: &HeaderLog, table: &PartitionTable, bitmap: u16) -> Result<Self, MirrorError> {
        let bytes = log.bytes();
        if bytes.is_empty() {
            return Err(MirrorError::EmptyLog);
        }

        let mut segments = Vec::new();
        let mut file_offset = 0u64;
        let mut pos = 0usize;
        let mut push = |segments: &mut Vec<Segment>, len: u64, source: Source| {
            segments.push(Segment {
                file_offset,
                len,
                source,
            });
            file_offset += len;
        };

        while pos < bytes.len() {
            let prefix_end = pos + SectionPrefix::SIZE;
            let raw = bytes.get(pos..prefix_end).ok_or(MirrorError::TruncatedLog(pos))?;
            let prefix = SectionPrefix::from_bytes(raw).map_err(|_| MirrorError::BadPrefix(pos))?;
            push(&mut segments, SectionPrefix::SIZE as u64, Source::Log { start: pos });
            pos = prefix_end;

            match prefix.tag {
                SectionTag::Header | SectionTag::Footer => {
                    let len = prefix.length as usize;
                    if pos + len > bytes.len() {
                        return Err(MirrorError::TruncatedLog(pos));
                    }
                    push(&mut segments, len as u64, Source::Log { start: pos });
                    pos += len;
                }
                SectionTag::Partition => {
                    let raw = bytes
                        .get(pos..pos + PartitionHeader::SIZE)
                        .ok_or(MirrorError::TruncatedLog(pos))?;
                    let header =
                        PartitionHeader::from_bytes(raw).map_err(|_| MirrorError::BadPrefix(pos))?;
                    push(&mut segments, PartitionHeader::SIZE as u64, Source::Log { start: pos });
                    pos += PartitionHeader::SIZE;

                    let physical = table
                        .physical_for_write(header.logical, bitmap)
                        .ok_or(MirrorError::UnknownPartition(header.logical))?;
                    let payload = prefix.length.saturating_sub(PARTITION_SECOND_HEADER_SIZE);
                    push(&mut segments, u64::from(payload), Source::Flash { physical });
                }
            }
        }

        let total = file_offset;
        debug!(segments = segments.len(), total, "Peer mirror laid out");
        Ok(Self {
            log: bytes.to_vec(),
            segments,
            total,
            position: 0,
        })
    }

    /// Size of the whole file.
    pub fn total_len(&self) -> u64 {
        self.total
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn remaining(&self) -> u64 {
        self.total - self.position
    }

    pub fn is_finished(&self) -> bool {
        self.position >= self.total
    }

    /// Move forward without reading; clamps at the end of the file.
    pub fn skip(&mut self, n: u64) {
        self.position = self.position.saturating_add(n).min(self.total);
    }

    /// Read up to `count` bytes from the current position.
    pub fn read<F: PartitionIo>(&mut self, flash: &F, count: usize) -> Result<Vec<u8>, MirrorError> {
        let want = (count as u64).min(self.remaining());
        let mut out = Vec::with_capacity(want as usize);

        while (out.len() as u64) < want {
            let Some(segment) = self
                .segments
                .iter()
                .find(|s| self.position < s.file_offset + s.len)
            else {
                break;
            };
            let within = self.position - segment.file_offset;
            let take = (segment.len - within).min(want - out.len() as u64) as usize;

            match segment.source {
                Source::Log { start } => {
                    let from = start + within as usize;
                    out.extend_from_slice(&self.log[from..from + take]);
                }
                Source::Flash { physical } => {
                    let offset = within as u32;
                    let mut buf = vec![0u8; take];
                    let read = flash.read(physical, offset, &mut buf)?;
                    if read < take {
                        return Err(MirrorError::ShortPartition {
                            physical,
                            offset: offset + read as u32,
                        });
                    }
                    out.extend_from_slice(&buf);
                }
            }
            self.position += take as u64;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::{UpgradeFileBuilder, UpgradeHeader, Version};
    use crate::partition::{BlockingFlash, MemoryPartitions, PartitionType, UpgradablePartition};
    use crate::store::MemoryKeyStore;

    fn table() -> PartitionTable {
        PartitionTable::new(vec![
            UpgradablePartition::double(0, 1, PartitionType::Exe),
            UpgradablePartition::double(2, 3, PartitionType::Data),
        ])
    }

    fn layout() -> MemoryPartitions {
        MemoryPartitions::new(&[
            (PartitionType::Exe, 4096),
            (PartitionType::Exe, 4096),
            (PartitionType::Data, 1024),
            (PartitionType::Data, 1024),
        ])
    }

    /// Lay a file out the way the parser leaves it: non-payload bytes in
    /// the log, payload in the inactive banks.
    fn received(file: &[u8]) -> (HeaderLog, BlockingFlash) {
        let mut flash = BlockingFlash::new(layout());
        let mut keys = MemoryKeyStore::default();
        let mut log = HeaderLog::new();
        let summary = crate::file::inspect(file).unwrap();
        for section in &summary.sections {
            let body = section.offset + SectionPrefix::SIZE;
            match section.partition {
                Some(header) => {
                    log.append(&mut keys, &file[section.offset..body + PartitionHeader::SIZE])
                        .unwrap();
                    let physical = table().physical_for_write(header.logical, 0).unwrap();
                    let handle = flash.open(header.logical, physical, header.first_word).unwrap();
                    let payload = &file[body + PartitionHeader::SIZE..body + section.length as usize];
                    assert_eq!(flash.write(&handle, payload), payload.len());
                    flash.close(handle).unwrap();
                }
                None => log
                    .append(&mut keys, &file[section.offset..body + section.length as usize])
                    .unwrap(),
            }
        }
        (log, flash)
    }

    fn sample() -> Vec<u8> {
        UpgradeFileBuilder::new(UpgradeHeader::new("EARBUD", Version::new(2, 0), 1))
            .partition(0, 0x1234, (0..700u32).map(|i| (i * 7) as u8).collect())
            .partition(1, 0x4321, vec![0xA5; 90])
            .build()
    }

    #[test]
    fn test_mirror_rebuilds_file() {
        let file = sample();
        let (log, partitions) = received(&file);
        let mut mirror = PartitionMirror::build(&log, &table(), 0).unwrap();
        assert_eq!(mirror.total_len(), file.len() as u64);

        let mut rebuilt = Vec::new();
        while !mirror.is_finished() {
            rebuilt.extend(mirror.read(&partitions, 100).unwrap());
        }
        assert_eq!(rebuilt, file);
    }

    #[test]
    fn test_skip_then_read() {
        let file = sample();
        let (log, partitions) = received(&file);
        let mut mirror = PartitionMirror::build(&log, &table(), 0).unwrap();
        mirror.skip(50);
        assert_eq!(mirror.read(&partitions, 30).unwrap(), file[50..80].to_vec());
        mirror.skip(u64::MAX);
        assert!(mirror.is_finished());
        assert!(mirror.read(&partitions, 10).unwrap().is_empty());
    }

    #[test]
    fn test_missing_payload_is_reported() {
        let file = sample();
        let (log, _) = received(&file);
        let empty = BlockingFlash::new(layout());
        let mut mirror = PartitionMirror::build(&log, &table(), 0).unwrap();
        let err = mirror.read(&empty, file.len()).unwrap_err();
        assert!(matches!(
            err,
            MirrorError::ShortPartition { .. } | MirrorError::Partition(_)
        ));
    }

    #[test]
    fn test_empty_log_refused() {
        assert_eq!(
            PartitionMirror::build(&HeaderLog::new(), &table(), 0).unwrap_err(),
            MirrorError::EmptyLog
        );
    }
}
