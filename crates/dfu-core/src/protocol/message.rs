//! Wire codec for upgrade protocol messages.
//!
//! Every frame is `opcode (u8) | length (u16, BE) | payload`.

use std::io::Cursor;

use byteorder::{BigEndian, ByteOrder, ReadBytesExt};
use thiserror::Error;

use super::constants::*;
use super::status::UpgradeStatus;
use crate::store::ResumePoint;

#[derive(Error, Debug)]
pub enum MessageError {
    #[error("Buffer too small: expected {expected}, got {actual}")]
    BufferTooSmall { expected: usize, actual: usize },
    #[error("Length field says {declared} bytes, frame carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("Unknown opcode 0x{0:02X}")]
    UnknownOpcode(u8),
    #[error("Invalid resume point {0}")]
    InvalidResumePoint(u8),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Answer carried by TRANSFER_COMPLETE_RES, IN_PROGRESS_RES and COMMIT_CFM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Proceed (0 on the wire).
    Continue,
    /// Anything else.
    Abort,
}

impl From<u8> for Action {
    fn from(value: u8) -> Self {
        if value == ACTION_CONTINUE {
            Action::Continue
        } else {
            Action::Abort
        }
    }
}

impl From<Action> for u8 {
    fn from(action: Action) -> u8 {
        match action {
            Action::Continue => ACTION_CONTINUE,
            Action::Abort => ACTION_ABORT,
        }
    }
}

/// Messages a host (or the peer relay, acting as host) sends to the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostMessage {
    SyncReq { upgrade_id: u32 },
    StartReq,
    StartDataReq,
    /// `last_packet` is set on the packet carrying the final byte of the file.
    Data { last_packet: bool, bytes: Vec<u8> },
    IsValidationDoneReq,
    TransferCompleteRes { action: Action },
    InProgressRes { action: Action },
    CommitCfm { action: Action },
    AbortReq,
    ErrorWarnRes { code: u16 },
    SyncAfterRebootReq,
    VersionReq,
    VariantReq,
}

/// Responses and indications the device sends to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostResponse {
    SyncCfm {
        resume_point: ResumePoint,
        upgrade_id: u32,
        protocol_version: u8,
    },
    StartCfm { status: u8, battery_level: u16 },
    DataBytesReq { count: u32, offset: u32 },
    IsValidationDoneCfm { backoff_ms: u16 },
    TransferCompleteInd,
    InProgressInd,
    CommitReq,
    CompleteInd,
    AbortCfm,
    ErrorWarnInd { code: u16 },
    VersionCfm { major: u16, minor: u16, config: u16 },
    VariantCfm { variant: [u8; VARIANT_SIZE] },
}

/// Responses with an empty payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShortResponse {
    TransferCompleteInd,
    InProgressInd,
    CommitReq,
    CompleteInd,
    AbortCfm,
}

impl From<ShortResponse> for HostResponse {
    fn from(short: ShortResponse) -> Self {
        match short {
            ShortResponse::TransferCompleteInd => HostResponse::TransferCompleteInd,
            ShortResponse::InProgressInd => HostResponse::InProgressInd,
            ShortResponse::CommitReq => HostResponse::CommitReq,
            ShortResponse::CompleteInd => HostResponse::CompleteInd,
            ShortResponse::AbortCfm => HostResponse::AbortCfm,
        }
    }
}

fn frame(opcode: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; FRAME_HEADER_SIZE];
    out[0] = opcode;
    // Callers keep payloads below 64 KiB; the peer relay chunks DATA.
    BigEndian::write_u16(&mut out[1..3], payload.len().min(u16::MAX as usize) as u16);
    out.extend_from_slice(payload);
    out
}

fn split_frame(data: &[u8]) -> Result<(u8, &[u8]), MessageError> {
    if data.len() < FRAME_HEADER_SIZE {
        return Err(MessageError::BufferTooSmall {
            expected: FRAME_HEADER_SIZE,
            actual: data.len(),
        });
    }
    let declared = BigEndian::read_u16(&data[1..3]) as usize;
    let payload = &data[FRAME_HEADER_SIZE..];
    if payload.len() != declared {
        return Err(MessageError::LengthMismatch {
            declared,
            actual: payload.len(),
        });
    }
    Ok((data[0], payload))
}

fn require(payload: &[u8], expected: usize) -> Result<(), MessageError> {
    if payload.len() < expected {
        return Err(MessageError::BufferTooSmall {
            expected,
            actual: payload.len(),
        });
    }
    Ok(())
}

fn u16_be(value: u16) -> [u8; 2] {
    let mut buf = [0u8; 2];
    BigEndian::write_u16(&mut buf, value);
    buf
}

fn u32_be(value: u32) -> [u8; 4] {
    let mut buf = [0u8; 4];
    BigEndian::write_u32(&mut buf, value);
    buf
}

impl HostMessage {
    pub fn opcode(&self) -> u8 {
        match self {
            HostMessage::SyncReq { .. } => UPGRADE_SYNC_REQ,
            HostMessage::StartReq => UPGRADE_START_REQ,
            HostMessage::StartDataReq => UPGRADE_START_DATA_REQ,
            HostMessage::Data { .. } => UPGRADE_DATA,
            HostMessage::IsValidationDoneReq => UPGRADE_IS_VALIDATION_DONE_REQ,
            HostMessage::TransferCompleteRes { .. } => UPGRADE_TRANSFER_COMPLETE_RES,
            HostMessage::InProgressRes { .. } => UPGRADE_IN_PROGRESS_RES,
            HostMessage::CommitCfm { .. } => UPGRADE_COMMIT_CFM,
            HostMessage::AbortReq => UPGRADE_ABORT_REQ,
            HostMessage::ErrorWarnRes { .. } => UPGRADE_ERRORWARN_RES,
            HostMessage::SyncAfterRebootReq => UPGRADE_SYNC_AFTER_REBOOT_REQ,
            HostMessage::VersionReq => UPGRADE_VERSION_REQ,
            HostMessage::VariantReq => UPGRADE_VARIANT_REQ,
        }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            HostMessage::SyncReq { .. } => "SYNC_REQ",
            HostMessage::StartReq => "START_REQ",
            HostMessage::StartDataReq => "START_DATA_REQ",
            HostMessage::Data { .. } => "DATA",
            HostMessage::IsValidationDoneReq => "IS_VALIDATION_DONE_REQ",
            HostMessage::TransferCompleteRes { .. } => "TRANSFER_COMPLETE_RES",
            HostMessage::InProgressRes { .. } => "IN_PROGRESS_RES",
            HostMessage::CommitCfm { .. } => "COMMIT_CFM",
            HostMessage::AbortReq => "ABORT_REQ",
            HostMessage::ErrorWarnRes { .. } => "ERRORWARN_RES",
            HostMessage::SyncAfterRebootReq => "SYNC_AFTER_REBOOT_REQ",
            HostMessage::VersionReq => "VERSION_REQ",
            HostMessage::VariantReq => "VARIANT_REQ",
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let opcode = self.opcode();
        match self {
            HostMessage::SyncReq { upgrade_id } => frame(opcode, &u32_be(*upgrade_id)),
            HostMessage::Data { last_packet, bytes } => {
                let mut payload = Vec::with_capacity(bytes.len() + 1);
                payload.push(u8::from(*last_packet));
                payload.extend_from_slice(bytes);
                frame(opcode, &payload)
            }
            HostMessage::TransferCompleteRes { action }
            | HostMessage::InProgressRes { action }
            | HostMessage::CommitCfm { action } => frame(opcode, &[u8::from(*action)]),
            HostMessage::ErrorWarnRes { code } => frame(opcode, &u16_be(*code)),
            _ => frame(opcode, &[]),
        }
    }

    pub fn decode(data: &[u8]) -> Result<Self, MessageError> {
        let (opcode, payload) = split_frame(data)?;
        let mut cursor = Cursor::new(payload);
        let message = match opcode {
            UPGRADE_SYNC_REQ => {
                require(payload, 4)?;
                HostMessage::SyncReq {
                    upgrade_id: cursor.read_u32::<BigEndian>()?,
                }
            }
            UPGRADE_START_REQ => HostMessage::StartReq,
            UPGRADE_START_DATA_REQ => HostMessage::StartDataReq,
            UPGRADE_DATA => {
                require(payload, 1)?;
                HostMessage::Data {
                    last_packet: payload[0] != 0,
                    bytes: payload[1..].to_vec(),
                }
            }
            UPGRADE_IS_VALIDATION_DONE_REQ => HostMessage::IsValidationDoneReq,
            UPGRADE_TRANSFER_COMPLETE_RES => {
                require(payload, 1)?;
                HostMessage::TransferCompleteRes {
                    action: Action::from(payload[0]),
                }
            }
            UPGRADE_IN_PROGRESS_RES => {
                require(payload, 1)?;
                HostMessage::InProgressRes {
                    action: Action::from(payload[0]),
                }
            }
            UPGRADE_COMMIT_CFM => {
                require(payload, 1)?;
                HostMessage::CommitCfm {
                    action: Action::from(payload[0]),
                }
            }
            UPGRADE_ABORT_REQ => HostMessage::AbortReq,
            UPGRADE_ERRORWARN_RES => {
                require(payload, 2)?;
                HostMessage::ErrorWarnRes {
                    code: cursor.read_u16::<BigEndian>()?,
                }
            }
            UPGRADE_SYNC_AFTER_REBOOT_REQ => HostMessage::SyncAfterRebootReq,
            UPGRADE_VERSION_REQ => HostMessage::VersionReq,
            UPGRADE_VARIANT_REQ => HostMessage::VariantReq,
            other => return Err(MessageError::UnknownOpcode(other)),
        };
        Ok(message)
    }
}

impl HostResponse {
    pub fn opcode(&self) -> u8 {
        match self {
            HostResponse::SyncCfm { .. } => UPGRADE_SYNC_CFM,
            HostResponse::StartCfm { .. } => UPGRADE_START_CFM,
            HostResponse::DataBytesReq { .. } => UPGRADE_DATA_BYTES_REQ,
            HostResponse::IsValidationDoneCfm { .. } => UPGRADE_IS_VALIDATION_DONE_CFM,
            HostResponse::TransferCompleteInd => UPGRADE_TRANSFER_COMPLETE_IND,
            HostResponse::InProgressInd => UPGRADE_IN_PROGRESS_IND,
            HostResponse::CommitReq => UPGRADE_COMMIT_REQ,
            HostResponse::CompleteInd => UPGRADE_COMPLETE_IND,
            HostResponse::AbortCfm => UPGRADE_ABORT_CFM,
            HostResponse::ErrorWarnInd { .. } => UPGRADE_ERRORWARN_IND,
            HostResponse::VersionCfm { .. } => UPGRADE_VERSION_CFM,
            HostResponse::VariantCfm { .. } => UPGRADE_VARIANT_CFM,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            HostResponse::SyncCfm { .. } => "SYNC_CFM",
            HostResponse::StartCfm { .. } => "START_CFM",
            HostResponse::DataBytesReq { .. } => "DATA_BYTES_REQ",
            HostResponse::IsValidationDoneCfm { .. } => "IS_VALIDATION_DONE_CFM",
            HostResponse::TransferCompleteInd => "TRANSFER_COMPLETE_IND",
            HostResponse::InProgressInd => "IN_PROGRESS_IND",
            HostResponse::CommitReq => "COMMIT_REQ",
            HostResponse::CompleteInd => "COMPLETE_IND",
            HostResponse::AbortCfm => "ABORT_CFM",
            HostResponse::ErrorWarnInd { .. } => "ERRORWARN_IND",
            HostResponse::VersionCfm { .. } => "VERSION_CFM",
            HostResponse::VariantCfm { .. } => "VARIANT_CFM",
        }
    }

    /// Error carried by an ERRORWARN_IND, if it is one with a known code.
    pub fn error_status(&self) -> Option<UpgradeStatus> {
        match self {
            HostResponse::ErrorWarnInd { code } => UpgradeStatus::try_from(*code).ok(),
            _ => None,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let opcode = self.opcode();
        match self {
            HostResponse::SyncCfm {
                resume_point,
                upgrade_id,
                protocol_version,
            } => {
                let mut payload = Vec::with_capacity(6);
                payload.push(resume_point.as_u8());
                payload.extend_from_slice(&u32_be(*upgrade_id));
                payload.push(*protocol_version);
                frame(opcode, &payload)
            }
            HostResponse::StartCfm {
                status,
                battery_level,
            } => {
                let mut payload = vec![*status];
                payload.extend_from_slice(&u16_be(*battery_level));
                frame(opcode, &payload)
            }
            HostResponse::DataBytesReq { count, offset } => {
                let mut payload = Vec::with_capacity(8);
                payload.extend_from_slice(&u32_be(*count));
                payload.extend_from_slice(&u32_be(*offset));
                frame(opcode, &payload)
            }
            HostResponse::IsValidationDoneCfm { backoff_ms } => {
                frame(opcode, &u16_be(*backoff_ms))
            }
            HostResponse::ErrorWarnInd { code } => frame(opcode, &u16_be(*code)),
            HostResponse::VersionCfm {
                major,
                minor,
                config,
            } => {
                let mut payload = Vec::with_capacity(6);
                payload.extend_from_slice(&u16_be(*major));
                payload.extend_from_slice(&u16_be(*minor));
                payload.extend_from_slice(&u16_be(*config));
                frame(opcode, &payload)
            }
            HostResponse::VariantCfm { variant } => frame(opcode, variant),
            _ => frame(opcode, &[]),
        }
    }

    pub fn decode(data: &[u8]) -> Result<Self, MessageError> {
        let (opcode, payload) = split_frame(data)?;
        let mut cursor = Cursor::new(payload);
        let response = match opcode {
            UPGRADE_SYNC_CFM => {
                require(payload, 6)?;
                let raw = cursor.read_u8()?;
                let resume_point = ResumePoint::try_from(u16::from(raw))
                    .map_err(|_| MessageError::InvalidResumePoint(raw))?;
                HostResponse::SyncCfm {
                    resume_point,
                    upgrade_id: cursor.read_u32::<BigEndian>()?,
                    protocol_version: cursor.read_u8()?,
                }
            }
            UPGRADE_START_CFM => {
                require(payload, 3)?;
                HostResponse::StartCfm {
                    status: cursor.read_u8()?,
                    battery_level: cursor.read_u16::<BigEndian>()?,
                }
            }
            UPGRADE_DATA_BYTES_REQ => {
                require(payload, 8)?;
                HostResponse::DataBytesReq {
                    count: cursor.read_u32::<BigEndian>()?,
                    offset: cursor.read_u32::<BigEndian>()?,
                }
            }
            UPGRADE_IS_VALIDATION_DONE_CFM => {
                require(payload, 2)?;
                HostResponse::IsValidationDoneCfm {
                    backoff_ms: cursor.read_u16::<BigEndian>()?,
                }
            }
            UPGRADE_TRANSFER_COMPLETE_IND => HostResponse::TransferCompleteInd,
            UPGRADE_IN_PROGRESS_IND => HostResponse::InProgressInd,
            UPGRADE_COMMIT_REQ => HostResponse::CommitReq,
            UPGRADE_COMPLETE_IND => HostResponse::CompleteInd,
            UPGRADE_ABORT_CFM => HostResponse::AbortCfm,
            UPGRADE_ERRORWARN_IND => {
                require(payload, 2)?;
                HostResponse::ErrorWarnInd {
                    code: cursor.read_u16::<BigEndian>()?,
                }
            }
            UPGRADE_VERSION_CFM => {
                require(payload, 6)?;
                HostResponse::VersionCfm {
                    major: cursor.read_u16::<BigEndian>()?,
                    minor: cursor.read_u16::<BigEndian>()?,
                    config: cursor.read_u16::<BigEndian>()?,
                }
            }
            UPGRADE_VARIANT_CFM => {
                require(payload, VARIANT_SIZE)?;
                let mut variant = [0u8; VARIANT_SIZE];
                variant.copy_from_slice(&payload[..VARIANT_SIZE]);
                HostResponse::VariantCfm { variant }
            }
            other => return Err(MessageError::UnknownOpcode(other)),
        };
        Ok(response)
    }
}
