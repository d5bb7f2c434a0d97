//! Status and error codes carried by ERRORWARN_IND.

use thiserror::Error;

/// Protocol-visible result codes.
///
/// Codes at or above 0x80 are warnings: the host may answer them and the
/// device stays where it is.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum UpgradeStatus {
    #[error("success")]
    Success = 0x00,
    #[error("unknown section id")]
    UnknownId = 0x11,
    #[error("wrong device variant")]
    WrongVariant = 0x13,
    #[error("wrong partition number")]
    WrongPartitionNumber = 0x14,
    #[error("partition size mismatch")]
    PartitionSizeMismatch = 0x15,
    #[error("partition open failed")]
    PartitionOpenFailed = 0x17,
    #[error("filesystem validation failed")]
    SfsValidationFailed = 0x1A,
    #[error("update failed")]
    UpdateFailed = 0x1C,
    #[error("application not ready")]
    AppNotReady = 0x1D,
    #[error("loader error")]
    LoaderError = 0x1E,
    #[error("battery low")]
    BatteryLow = 0x21,
    #[error("invalid sync id")]
    InvalidSyncId = 0x22,
    #[error("device in error state")]
    InErrorState = 0x23,
    #[error("out of memory")]
    NoMemory = 0x24,
    #[error("serial flash erase failed")]
    SqifErase = 0x25,
    #[error("serial flash copy failed")]
    SqifCopy = 0x26,
    #[error("audio image copy failed")]
    AudioCopy = 0x27,
    #[error("bad length while parsing partition")]
    BadLengthPartitionParse = 0x30,
    #[error("section too short")]
    BadLengthTooShort = 0x31,
    #[error("bad upgrade header length")]
    BadLengthUpgradeHeader = 0x32,
    #[error("bad partition header length")]
    BadLengthPartitionHeader = 0x33,
    #[error("bad signature length")]
    BadLengthSignature = 0x34,
    #[error("bad length on data header resume")]
    BadLengthDatahdrResume = 0x35,
    #[error("validation failed on section headers")]
    OemValidationFailedHeaders = 0x38,
    #[error("validation failed on upgrade header")]
    OemValidationFailedUpgradeHeader = 0x39,
    #[error("validation failed on partition header")]
    OemValidationFailedPartitionHeader1 = 0x3A,
    #[error("validation failed on partition header length")]
    OemValidationFailedPartitionHeader2 = 0x3B,
    #[error("validation failed on partition data")]
    OemValidationFailedPartitionData = 0x3C,
    #[error("footer digest mismatch")]
    OemValidationFailedFooter = 0x3D,
    #[error("validation ran out of memory")]
    OemValidationFailedMemory = 0x3E,
    #[error("partition close failed")]
    PartitionCloseFailed = 0x40,
    #[error("partition close failed on header")]
    PartitionCloseFailedHeader = 0x41,
    #[error("partition close failed, persistent store full")]
    PartitionCloseFailedPsSpace = 0x42,
    #[error("partition type does not match")]
    PartitionTypeNotMatching = 0x48,
    #[error("file carries two DFU partitions")]
    PartitionTypeTwoDfu = 0x49,
    #[error("partition header write failed")]
    PartitionWriteFailedHeader = 0x50,
    #[error("partition data write failed")]
    PartitionWriteFailedData = 0x51,
    #[error("file too small")]
    FileTooSmall = 0x58,
    #[error("file too big")]
    FileTooBig = 0x59,
    #[error("internal error 1")]
    InternalError1 = 0x65,
    #[error("internal error 2")]
    InternalError2 = 0x66,
    #[error("internal error 3")]
    InternalError3 = 0x67,
    #[error("internal error 4")]
    InternalError4 = 0x68,
    #[error("internal error 5")]
    InternalError5 = 0x69,
    #[error("internal error 6")]
    InternalError6 = 0x6A,
    #[error("internal error 7")]
    InternalError7 = 0x6B,
    #[error("internal error 8")]
    InternalError8 = 0x6C,
    #[error("application or config version incompatible")]
    WarnAppConfigVersionIncompatible = 0x80,
    #[error("sync id is different")]
    WarnSyncIdIsDifferent = 0x81,
}

impl UpgradeStatus {
    const ALL: [UpgradeStatus; 49] = [
        Self::Success,
        Self::UnknownId,
        Self::WrongVariant,
        Self::WrongPartitionNumber,
        Self::PartitionSizeMismatch,
        Self::PartitionOpenFailed,
        Self::SfsValidationFailed,
        Self::UpdateFailed,
        Self::AppNotReady,
        Self::LoaderError,
        Self::BatteryLow,
        Self::InvalidSyncId,
        Self::InErrorState,
        Self::NoMemory,
        Self::SqifErase,
        Self::SqifCopy,
        Self::AudioCopy,
        Self::BadLengthPartitionParse,
        Self::BadLengthTooShort,
        Self::BadLengthUpgradeHeader,
        Self::BadLengthPartitionHeader,
        Self::BadLengthSignature,
        Self::BadLengthDatahdrResume,
        Self::OemValidationFailedHeaders,
        Self::OemValidationFailedUpgradeHeader,
        Self::OemValidationFailedPartitionHeader1,
        Self::OemValidationFailedPartitionHeader2,
        Self::OemValidationFailedPartitionData,
        Self::OemValidationFailedFooter,
        Self::OemValidationFailedMemory,
        Self::PartitionCloseFailed,
        Self::PartitionCloseFailedHeader,
        Self::PartitionCloseFailedPsSpace,
        Self::PartitionTypeNotMatching,
        Self::PartitionTypeTwoDfu,
        Self::PartitionWriteFailedHeader,
        Self::PartitionWriteFailedData,
        Self::FileTooSmall,
        Self::FileTooBig,
        Self::InternalError1,
        Self::InternalError2,
        Self::InternalError3,
        Self::InternalError4,
        Self::InternalError5,
        Self::InternalError6,
        Self::InternalError7,
        Self::InternalError8,
        Self::WarnAppConfigVersionIncompatible,
        Self::WarnSyncIdIsDifferent,
    ];

    /// Numeric wire code.
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Warnings leave the device state untouched.
    pub fn is_warning(self) -> bool {
        self.code() >= 0x80
    }
}

impl TryFrom<u16> for UpgradeStatus {
    type Error = u16;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        Self::ALL
            .iter()
            .copied()
            .find(|status| status.code() == code)
            .ok_or(code)
    }
}
