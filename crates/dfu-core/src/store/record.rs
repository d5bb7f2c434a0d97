//! Persisted upgrade records and their word layout.
//!
//! Both records share one 32-word key. The upgrade record sits at word 0,
//! the peer record at word 26.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::file::Version;

// ============================================================================
// Key Layout
// ============================================================================

/// Key holding both upgrade records.
pub const UPGRADE_CONTEXT_KEY: u16 = 0x0001;

/// Maximum number of words a single key holds.
pub const PSKEY_MAX_WORDS: usize = 32;

pub const RESUME_RECORD_OFFSET: usize = 0;
pub const RESUME_RECORD_WORDS: usize = 18;
pub const PEER_RECORD_OFFSET: usize = 26;
pub const PEER_RECORD_WORDS: usize = 6;

/// Where an interrupted upgrade picks up again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[repr(u16)]
pub enum ResumePoint {
    /// Nothing downloaded yet, or a partial download.
    #[default]
    Start = 0,
    /// Download complete, partitions not yet validated.
    PreValidate = 1,
    /// Validated, waiting for TRANSFER_COMPLETE_RES.
    PreReboot = 2,
    /// Rebooted into the new image, waiting for the commit.
    PostReboot = 3,
    /// Commit in progress.
    Commit = 4,
    /// Committed, erasing the old banks.
    Erase = 5,
    /// A fatal error is pending host acknowledgement.
    Error = 6,
}

impl ResumePoint {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u16> for ResumePoint {
    type Error = u16;

    fn try_from(value: u16) -> Result<Self, u16> {
        match value {
            0 => Ok(Self::Start),
            1 => Ok(Self::PreValidate),
            2 => Ok(Self::PreReboot),
            3 => Ok(Self::PostReboot),
            4 => Ok(Self::Commit),
            5 => Ok(Self::Erase),
            6 => Ok(Self::Error),
            other => Err(other),
        }
    }
}

impl fmt::Display for ResumePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResumePoint::Start => write!(f, "START"),
            ResumePoint::PreValidate => write!(f, "PRE_VALIDATE"),
            ResumePoint::PreReboot => write!(f, "PRE_REBOOT"),
            ResumePoint::PostReboot => write!(f, "POST_REBOOT"),
            ResumePoint::Commit => write!(f, "COMMIT"),
            ResumePoint::Erase => write!(f, "ERASE"),
            ResumePoint::Error => write!(f, "ERROR"),
        }
    }
}

/// State of the inactive banks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u16)]
pub enum PartitionsState {
    #[default]
    Erased = 0,
    Upgrading = 1,
    Error = 2,
}

impl From<u16> for PartitionsState {
    fn from(value: u16) -> Self {
        match value {
            1 => Self::Upgrading,
            2 => Self::Error,
            _ => Self::Erased,
        }
    }
}

/// Result reported by the DFU loader after a single-bank upgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u16)]
pub enum LoaderResult {
    #[default]
    None = 0,
    Success = 1,
    Error = 2,
}

impl From<u16> for LoaderResult {
    fn from(value: u16) -> Self {
        match value {
            1 => Self::Success,
            2 => Self::Error,
            _ => Self::None,
        }
    }
}

/// Upgrade progress that survives a reboot.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResumeRecord {
    pub active_version: Version,
    pub active_config_version: u16,
    /// Bit n set: logical partition n runs from bank 2.
    pub partition_bitmap: u16,
    pub partitions_state: PartitionsState,
    pub in_progress_version: Version,
    pub in_progress_config_version: u16,
    pub upgrade_id: u32,
    pub resume_point: ResumePoint,
    /// Physical number + 1 of the last fully written partition, 0 if none.
    pub last_closed_partition: u16,
    /// Physical number + 1 of the DFU partition in this file, 0 if none.
    pub dfu_partition_number: u16,
    pub loader_result: LoaderResult,
    /// Logical partitions written to their inactive bank in this upgrade.
    pub pending_bitmap: u16,
    /// Set while running the new image before the commit.
    pub trial_active: bool,
}

impl ResumeRecord {
    pub fn to_words(&self) -> [u16; RESUME_RECORD_WORDS] {
        let mut words = [0u16; RESUME_RECORD_WORDS];
        words[0] = self.active_version.major;
        words[1] = self.active_version.minor;
        words[2] = self.active_config_version;
        words[3] = self.partition_bitmap;
        words[4] = self.partitions_state as u16;
        words[5] = self.in_progress_version.major;
        words[6] = self.in_progress_version.minor;
        words[7] = self.in_progress_config_version;
        words[8] = self.upgrade_id as u16;
        words[9] = (self.upgrade_id >> 16) as u16;
        words[10] = self.resume_point as u16;
        words[11] = self.last_closed_partition;
        words[12] = self.dfu_partition_number;
        words[13] = self.loader_result as u16;
        words[14] = self.pending_bitmap;
        words[15] = u16::from(self.trial_active);
        words
    }

    /// Decode from key words; missing words read as zero.
    pub fn from_words(words: &[u16]) -> Self {
        let w = |i: usize| words.get(i).copied().unwrap_or(0);
        let resume_point = ResumePoint::try_from(w(10)).unwrap_or_else(|raw| {
            tracing::warn!(raw, "Unknown resume point in record, using START");
            ResumePoint::Start
        });
        Self {
            active_version: Version::new(w(0), w(1)),
            active_config_version: w(2),
            partition_bitmap: w(3),
            partitions_state: PartitionsState::from(w(4)),
            in_progress_version: Version::new(w(5), w(6)),
            in_progress_config_version: w(7),
            upgrade_id: u32::from(w(8)) | (u32::from(w(9)) << 16),
            resume_point,
            last_closed_partition: w(11),
            dfu_partition_number: w(12),
            loader_result: LoaderResult::from(w(13)),
            pending_bitmap: w(14),
            trial_active: w(15) != 0,
        }
    }

    /// Whether the record describes a download that started but has not been
    /// validated yet.
    pub fn has_partial_download(&self) -> bool {
        self.resume_point == ResumePoint::Start
            && (self.last_closed_partition != 0
                || self.partitions_state == PartitionsState::Upgrading)
    }
}

/// Peer relay progress, stored next to the upgrade record.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PeerRecord {
    pub resume_point: ResumePoint,
    /// Raw relay state at the time of the last save.
    pub relay_state: u16,
    pub is_secondary: bool,
    pub is_dfu_mode: bool,
    pub upgrade_id: u32,
}

impl PeerRecord {
    pub fn to_words(&self) -> [u16; PEER_RECORD_WORDS] {
        [
            self.resume_point as u16,
            self.relay_state,
            u16::from(self.is_secondary),
            u16::from(self.is_dfu_mode),
            self.upgrade_id as u16,
            (self.upgrade_id >> 16) as u16,
        ]
    }

    pub fn from_words(words: &[u16]) -> Self {
        let w = |i: usize| words.get(i).copied().unwrap_or(0);
        Self {
            resume_point: ResumePoint::try_from(w(0)).unwrap_or_default(),
            relay_state: w(1),
            is_secondary: w(2) != 0,
            is_dfu_mode: w(3) != 0,
            upgrade_id: u32::from(w(4)) | (u32::from(w(5)) << 16),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_layout_does_not_overlap() {
        assert!(RESUME_RECORD_OFFSET + RESUME_RECORD_WORDS <= PEER_RECORD_OFFSET);
        assert_eq!(PEER_RECORD_OFFSET + PEER_RECORD_WORDS, PSKEY_MAX_WORDS);
    }

    #[test]
    fn test_record_word_order() {
        let record = ResumeRecord {
            active_version: Version::new(2, 7),
            upgrade_id: 0x1234_5678,
            resume_point: ResumePoint::PreReboot,
            last_closed_partition: 3,
            trial_active: true,
            ..Default::default()
        };
        let words = record.to_words();
        assert_eq!(words[0], 2);
        assert_eq!(words[1], 7);
        assert_eq!(words[8], 0x5678);
        assert_eq!(words[9], 0x1234);
        assert_eq!(words[10], 2);
        assert_eq!(words[11], 3);
        assert_eq!(words[15], 1);
        assert_eq!(ResumeRecord::from_words(&words), record);
    }

    #[test]
    fn test_missing_words_load_as_zero() {
        let record = ResumeRecord::from_words(&[]);
        assert_eq!(record, ResumeRecord::default());
        let peer = PeerRecord::from_words(&[3]);
        assert_eq!(peer.resume_point, ResumePoint::PostReboot);
        assert!(!peer.is_secondary);
    }

    #[test]
    fn test_resume_point_ordering() {
        assert!(ResumePoint::Start < ResumePoint::PreValidate);
        assert!(ResumePoint::PostReboot < ResumePoint::Erase);
        assert_eq!(ResumePoint::try_from(9), Err(9));
    }
}
