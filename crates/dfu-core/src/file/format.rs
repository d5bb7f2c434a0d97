//! Upgrade file sections and builder.
//!
//! An upgrade file is a header section, any number of partition sections and
//! a footer. Every section starts with an 8-byte tag and a 4-byte body
//! length. All integers are little-endian.

use std::fmt;
use std::io::Cursor;

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::VARIANT_SIZE;
use crate::validation;

// ============================================================================
// Section Layout
// ============================================================================

pub const ID_FIELD_SIZE: usize = 8;

/// Tag plus body length.
pub const HEADER_FIRST_PART_SIZE: usize = 12;

/// Variant, version, empty compatibility list and config version.
pub const UPGRADE_HEADER_MIN_SECOND_PART_SIZE: u32 = 16;

/// Logical partition plus first word.
pub const PARTITION_SECOND_HEADER_SIZE: u32 = 4;

/// Footer body size; the first [`DIGEST_SIZE`] bytes carry the file digest.
pub const EXPECTED_SIGNATURE_SIZE: u32 = 128;

pub const DIGEST_SIZE: usize = 32;

/// Minor version in a compatibility entry that matches any minor.
pub const VERSION_MINOR_WILDCARD: u16 = 0xFFFF;

pub const HEADER_ID: &[u8; ID_FIELD_SIZE] = b"APPUHDR2";
pub const PARTITION_ID: &[u8; ID_FIELD_SIZE] = b"PARTDATA";
pub const FOOTER_ID: &[u8; ID_FIELD_SIZE] = b"APPUPFTR";

#[derive(Error, Debug)]
pub enum FormatError {
    #[error("Buffer too small: expected {expected}, got {actual}")]
    BufferTooSmall { expected: usize, actual: usize },
    #[error("Unknown section tag {0:?}")]
    UnknownTag([u8; ID_FIELD_SIZE]),
    #[error("Section {tag} has bad length {length}")]
    BadLength { tag: SectionTag, length: u32 },
    #[error("Section at offset {offset} runs past the end of the file")]
    Truncated { offset: usize },
    #[error("File has no footer")]
    MissingFooter,
    #[error("File has no header section")]
    MissingHeader,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Application version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
}

impl Version {
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    /// Whether a compatibility entry from a file accepts this running version.
    pub fn matches(&self, entry: &Version) -> bool {
        self.major == entry.major
            && (entry.minor == VERSION_MINOR_WILDCARD || self.minor == entry.minor)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionTag {
    Header,
    Partition,
    Footer,
}

impl SectionTag {
    pub fn from_bytes(id: &[u8]) -> Option<Self> {
        match id {
            id if id == HEADER_ID => Some(SectionTag::Header),
            id if id == PARTITION_ID => Some(SectionTag::Partition),
            id if id == FOOTER_ID => Some(SectionTag::Footer),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> &'static [u8; ID_FIELD_SIZE] {
        match self {
            SectionTag::Header => HEADER_ID,
            SectionTag::Partition => PARTITION_ID,
            SectionTag::Footer => FOOTER_ID,
        }
    }

    /// Smallest acceptable body length.
    pub fn min_length(&self) -> u32 {
        match self {
            SectionTag::Header => UPGRADE_HEADER_MIN_SECOND_PART_SIZE,
            SectionTag::Partition => PARTITION_SECOND_HEADER_SIZE,
            SectionTag::Footer => EXPECTED_SIGNATURE_SIZE,
        }
    }
}

impl fmt::Display for SectionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SectionTag::Header => write!(f, "HEADER"),
            SectionTag::Partition => write!(f, "PARTITION"),
            SectionTag::Footer => write!(f, "FOOTER"),
        }
    }
}

/// The 12-byte prefix every section starts with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionPrefix {
    pub tag: SectionTag,
    pub length: u32,
}

impl SectionPrefix {
    pub const SIZE: usize = HEADER_FIRST_PART_SIZE;

    pub fn to_bytes(&self) -> [u8; HEADER_FIRST_PART_SIZE] {
        let mut buf = [0u8; HEADER_FIRST_PART_SIZE];
        buf[..ID_FIELD_SIZE].copy_from_slice(self.tag.as_bytes());
        LittleEndian::write_u32(&mut buf[ID_FIELD_SIZE..], self.length);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, FormatError> {
        if data.len() < Self::SIZE {
            return Err(FormatError::BufferTooSmall {
                expected: Self::SIZE,
                actual: data.len(),
            });
        }
        let mut id = [0u8; ID_FIELD_SIZE];
        id.copy_from_slice(&data[..ID_FIELD_SIZE]);
        let tag = SectionTag::from_bytes(&id).ok_or(FormatError::UnknownTag(id))?;
        Ok(Self {
            tag,
            length: LittleEndian::read_u32(&data[ID_FIELD_SIZE..Self::SIZE]),
        })
    }
}

/// Body of the `APPUHDR2` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeHeader {
    pub variant: [u8; VARIANT_SIZE],
    pub version: Version,
    /// Running versions this file may be applied on top of.
    pub compatible_versions: Vec<Version>,
    pub config_version: u16,
    /// Running config versions this file accepts when they differ from
    /// `config_version`.
    pub compatible_config_versions: Vec<u16>,
}

impl UpgradeHeader {
    pub fn new(variant: &str, version: Version, config_version: u16) -> Self {
        Self {
            variant: variant_bytes(variant),
            version,
            compatible_versions: Vec::new(),
            config_version,
            compatible_config_versions: Vec::new(),
        }
    }

    /// Accept `version` as a running version to upgrade from.
    pub fn with_compatible(mut self, version: Version) -> Self {
        self.compatible_versions.push(version);
        self
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.extend_from_slice(&self.variant);
        push_u16(&mut buf, self.version.major);
        push_u16(&mut buf, self.version.minor);
        push_u16(&mut buf, self.compatible_versions.len() as u16);
        for entry in &self.compatible_versions {
            push_u16(&mut buf, entry.major);
            push_u16(&mut buf, entry.minor);
        }
        push_u16(&mut buf, self.config_version);
        if !self.compatible_config_versions.is_empty() {
            push_u16(&mut buf, self.compatible_config_versions.len() as u16);
            for config in &self.compatible_config_versions {
                push_u16(&mut buf, *config);
            }
        }
        buf
    }

    pub fn encoded_len(&self) -> usize {
        let config_list = if self.compatible_config_versions.is_empty() {
            0
        } else {
            2 + 2 * self.compatible_config_versions.len()
        };
        UPGRADE_HEADER_MIN_SECOND_PART_SIZE as usize + 4 * self.compatible_versions.len() + config_list
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, FormatError> {
        let min = UPGRADE_HEADER_MIN_SECOND_PART_SIZE as usize;
        if data.len() < min {
            return Err(FormatError::BufferTooSmall {
                expected: min,
                actual: data.len(),
            });
        }
        let mut variant = [0u8; VARIANT_SIZE];
        variant.copy_from_slice(&data[..VARIANT_SIZE]);

        let mut cursor = Cursor::new(&data[VARIANT_SIZE..]);
        let version = Version::new(
            cursor.read_u16::<LittleEndian>()?,
            cursor.read_u16::<LittleEndian>()?,
        );
        let count = cursor.read_u16::<LittleEndian>()? as usize;
        let expected = min + 4 * count;
        if data.len() < expected {
            return Err(FormatError::BufferTooSmall {
                expected,
                actual: data.len(),
            });
        }
        let mut compatible_versions = Vec::with_capacity(count);
        for _ in 0..count {
            compatible_versions.push(Version::new(
                cursor.read_u16::<LittleEndian>()?,
                cursor.read_u16::<LittleEndian>()?,
            ));
        }
        let config_version = cursor.read_u16::<LittleEndian>()?;

        let mut compatible_config_versions = Vec::new();
        if data.len() >= expected + 2 {
            let config_count = cursor.read_u16::<LittleEndian>()? as usize;
            let needed = expected + 2 + 2 * config_count;
            if data.len() < needed {
                return Err(FormatError::BufferTooSmall {
                    expected: needed,
                    actual: data.len(),
                });
            }
            for _ in 0..config_count {
                compatible_config_versions.push(cursor.read_u16::<LittleEndian>()?);
            }
        }

        Ok(Self {
            variant,
            version,
            compatible_versions,
            config_version,
            compatible_config_versions,
        })
    }

    /// Whether the file may be applied on top of the running version.
    pub fn accepts_version(&self, running: &Version) -> bool {
        self.compatible_versions
            .iter()
            .any(|entry| running.matches(entry))
    }

    /// Whether the file may be applied on top of the running config version.
    pub fn accepts_config(&self, running: u16) -> bool {
        self.config_version == running || self.compatible_config_versions.contains(&running)
    }
}

/// Body prefix of a `PARTDATA` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionHeader {
    pub logical: u16,
    /// First word of the partition, written on open rather than with the payload.
    pub first_word: u16,
}

impl PartitionHeader {
    pub const SIZE: usize = PARTITION_SECOND_HEADER_SIZE as usize;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        LittleEndian::write_u16(&mut buf[0..2], self.logical);
        LittleEndian::write_u16(&mut buf[2..4], self.first_word);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, FormatError> {
        if data.len() < Self::SIZE {
            return Err(FormatError::BufferTooSmall {
                expected: Self::SIZE,
                actual: data.len(),
            });
        }
        Ok(Self {
            logical: LittleEndian::read_u16(&data[0..2]),
            first_word: LittleEndian::read_u16(&data[2..4]),
        })
    }
}

fn push_u16(buf: &mut Vec<u8>, value: u16) {
    let mut word = [0u8; 2];
    LittleEndian::write_u16(&mut word, value);
    buf.extend_from_slice(&word);
}

/// Pad or truncate a variant name to its fixed 8-byte form.
pub fn variant_bytes(name: &str) -> [u8; VARIANT_SIZE] {
    let mut out = [0u8; VARIANT_SIZE];
    let bytes = name.as_bytes();
    let len = bytes.len().min(VARIANT_SIZE);
    out[..len].copy_from_slice(&bytes[..len]);
    out
}

/// Readable form of a fixed variant field.
pub fn variant_name(variant: &[u8; VARIANT_SIZE]) -> String {
    let end = variant.iter().position(|&b| b == 0).unwrap_or(VARIANT_SIZE);
    String::from_utf8_lossy(&variant[..end]).into_owned()
}

/// Produces complete upgrade files.
#[derive(Debug, Clone)]
pub struct UpgradeFileBuilder {
    header: UpgradeHeader,
    partitions: Vec<(PartitionHeader, Vec<u8>)>,
}

impl UpgradeFileBuilder {
    pub fn new(header: UpgradeHeader) -> Self {
        Self {
            header,
            partitions: Vec::new(),
        }
    }

    pub fn partition(mut self, logical: u16, first_word: u16, payload: Vec<u8>) -> Self {
        self.partitions.push((
            PartitionHeader {
                logical,
                first_word,
            },
            payload,
        ));
        self
    }

    /// Serialize the file; the footer carries the SHA-256 of all preceding bytes.
    pub fn build(&self) -> Vec<u8> {
        let header_body = self.header.to_bytes();
        let mut out = Vec::new();
        out.extend_from_slice(
            &SectionPrefix {
                tag: SectionTag::Header,
                length: header_body.len() as u32,
            }
            .to_bytes(),
        );
        out.extend_from_slice(&header_body);

        for (header, payload) in &self.partitions {
            out.extend_from_slice(
                &SectionPrefix {
                    tag: SectionTag::Partition,
                    length: PARTITION_SECOND_HEADER_SIZE + payload.len() as u32,
                }
                .to_bytes(),
            );
            out.extend_from_slice(&header.to_bytes());
            out.extend_from_slice(payload);
        }

        out.extend_from_slice(
            &SectionPrefix {
                tag: SectionTag::Footer,
                length: EXPECTED_SIGNATURE_SIZE,
            }
            .to_bytes(),
        );
        let digest = validation::file_digest(&out);
        let mut signature = vec![0u8; EXPECTED_SIGNATURE_SIZE as usize];
        signature[..DIGEST_SIZE].copy_from_slice(&digest);
        out.extend_from_slice(&signature);
        out
    }
}

/// One section found by [`inspect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionInfo {
    /// File offset of the section prefix.
    pub offset: usize,
    pub tag: SectionTag,
    pub length: u32,
    pub partition: Option<PartitionHeader>,
}

/// Summary of an upgrade file.
#[derive(Debug, Clone)]
pub struct FileSummary {
    pub header: UpgradeHeader,
    pub sections: Vec<SectionInfo>,
    /// Digest carried in the footer.
    pub signature_digest: [u8; DIGEST_SIZE],
    /// Digest computed over the file.
    pub computed_digest: [u8; DIGEST_SIZE],
}

impl FileSummary {
    pub fn digest_matches(&self) -> bool {
        self.signature_digest == self.computed_digest
    }
}

/// Walk the sections of a file without writing anything.
pub fn inspect(data: &[u8]) -> Result<FileSummary, FormatError> {
    let mut offset = 0usize;
    let mut sections = Vec::new();
    let mut header = None;

    while offset < data.len() {
        let prefix = SectionPrefix::from_bytes(&data[offset..])?;
        if prefix.length < prefix.tag.min_length()
            || (prefix.tag == SectionTag::Footer && prefix.length != EXPECTED_SIGNATURE_SIZE)
        {
            return Err(FormatError::BadLength {
                tag: prefix.tag,
                length: prefix.length,
            });
        }
        let body_start = offset + SectionPrefix::SIZE;
        let body_end = body_start + prefix.length as usize;
        if body_end > data.len() {
            return Err(FormatError::Truncated { offset });
        }
        let body = &data[body_start..body_end];

        let mut partition = None;
        match prefix.tag {
            SectionTag::Header => header = Some(UpgradeHeader::from_bytes(body)?),
            SectionTag::Partition => partition = Some(PartitionHeader::from_bytes(body)?),
            SectionTag::Footer => {
                sections.push(SectionInfo {
                    offset,
                    tag: prefix.tag,
                    length: prefix.length,
                    partition: None,
                });
                let mut signature_digest = [0u8; DIGEST_SIZE];
                signature_digest.copy_from_slice(&body[..DIGEST_SIZE]);
                let header = header.ok_or(FormatError::MissingHeader)?;
                return Ok(FileSummary {
                    header,
                    sections,
                    signature_digest,
                    computed_digest: validation::file_digest(&data[..body_start]),
                });
            }
        }
        sections.push(SectionInfo {
            offset,
            tag: prefix.tag,
            length: prefix.length,
            partition,
        });
        offset = body_end;
    }

    Err(FormatError::MissingFooter)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> UpgradeHeader {
        let mut header = UpgradeHeader::new("QCC5141", Version::new(2, 0), 5);
        header.compatible_versions.push(Version::new(1, VERSION_MINOR_WILDCARD));
        header.compatible_config_versions.push(4);
        header
    }

    #[test]
    fn test_header_layout() {
        let header = sample_header();
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), header.encoded_len());
        assert_eq!(&bytes[..7], b"QCC5141");
        assert_eq!(&bytes[8..10], &[2, 0]);
        assert_eq!(&bytes[12..14], &[1, 0]);
        assert_eq!(UpgradeHeader::from_bytes(&bytes).unwrap(), header);
    }

    #[test]
    fn test_header_without_config_list() {
        let header = UpgradeHeader::new("X", Version::new(1, 1), 3);
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), UPGRADE_HEADER_MIN_SECOND_PART_SIZE as usize);
        let parsed = UpgradeHeader::from_bytes(&bytes).unwrap();
        assert!(parsed.compatible_config_versions.is_empty());
    }

    #[test]
    fn test_short_header_rejected() {
        let mut bytes = sample_header().to_bytes();
        bytes.truncate(14);
        assert!(matches!(
            UpgradeHeader::from_bytes(&bytes),
            Err(FormatError::BufferTooSmall { .. })
        ));
    }

    #[test]
    fn test_version_wildcard() {
        let header = sample_header();
        assert!(header.accepts_version(&Version::new(1, 42)));
        assert!(!header.accepts_version(&Version::new(2, 0)));
        assert!(header.accepts_config(5));
        assert!(header.accepts_config(4));
        assert!(!header.accepts_config(3));
    }

    #[test]
    fn test_prefix_unknown_tag() {
        let mut bytes = [0u8; 12];
        bytes[..8].copy_from_slice(b"BADTAG!!");
        assert!(matches!(
            SectionPrefix::from_bytes(&bytes),
            Err(FormatError::UnknownTag(_))
        ));
    }

    #[test]
    fn test_builder_and_inspect() {
        let file = UpgradeFileBuilder::new(sample_header())
            .partition(0, 0xA5A5, vec![1, 2, 3, 4, 5])
            .partition(1, 0x0102, vec![9; 300])
            .build();

        let summary = inspect(&file).unwrap();
        assert!(summary.digest_matches());
        assert_eq!(summary.sections.len(), 4);
        assert_eq!(summary.sections[0].tag, SectionTag::Header);
        assert_eq!(summary.sections[1].length, 9);
        assert_eq!(
            summary.sections[2].partition,
            Some(PartitionHeader {
                logical: 1,
                first_word: 0x0102
            })
        );
        assert_eq!(summary.sections[3].tag, SectionTag::Footer);
        assert_eq!(summary.header.version, Version::new(2, 0));
    }

    #[test]
    fn test_inspect_detects_corruption() {
        let mut file = UpgradeFileBuilder::new(sample_header())
            .partition(0, 0, vec![7; 16])
            .build();
        let payload_at = file.len() - 12 - 128 - 3;
        file[payload_at] ^= 0xFF;
        let summary = inspect(&file).unwrap();
        assert!(!summary.digest_matches());
    }

    #[test]
    fn test_inspect_truncated() {
        let file = UpgradeFileBuilder::new(sample_header())
            .partition(0, 0, vec![7; 16])
            .build();
        assert!(matches!(
            inspect(&file[..file.len() - 1]),
            Err(FormatError::Truncated { .. })
        ));
    }

    #[test]
    fn test_variant_helpers() {
        let variant = variant_bytes("EB2");
        assert_eq!(&variant[..3], b"EB2");
        assert_eq!(variant_name(&variant), "EB2");
        assert_eq!(variant_bytes("TOO-LONG-NAME"), *b"TOO-LONG");
    }
}
