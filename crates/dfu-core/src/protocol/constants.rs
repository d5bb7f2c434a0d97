//! Upgrade protocol constants.
//!
//! Opcode values follow the GAIA upgrade message numbering used by the
//! earbud host applications.

// ============================================================================
// Host Protocol Opcodes
// ============================================================================

pub const UPGRADE_START_REQ: u8 = 0x01;
pub const UPGRADE_START_CFM: u8 = 0x02;
pub const UPGRADE_DATA_BYTES_REQ: u8 = 0x03;
pub const UPGRADE_DATA: u8 = 0x04;
pub const UPGRADE_ABORT_REQ: u8 = 0x07;
pub const UPGRADE_ABORT_CFM: u8 = 0x08;
pub const UPGRADE_TRANSFER_COMPLETE_IND: u8 = 0x0B;
pub const UPGRADE_TRANSFER_COMPLETE_RES: u8 = 0x0C;
pub const UPGRADE_IN_PROGRESS_IND: u8 = 0x0D;
pub const UPGRADE_IN_PROGRESS_RES: u8 = 0x0E;
pub const UPGRADE_COMMIT_REQ: u8 = 0x0F;
pub const UPGRADE_COMMIT_CFM: u8 = 0x10;
pub const UPGRADE_ERRORWARN_IND: u8 = 0x11;
pub const UPGRADE_COMPLETE_IND: u8 = 0x12;
pub const UPGRADE_SYNC_REQ: u8 = 0x13;
pub const UPGRADE_SYNC_CFM: u8 = 0x14;
pub const UPGRADE_START_DATA_REQ: u8 = 0x15;
pub const UPGRADE_IS_VALIDATION_DONE_REQ: u8 = 0x16;
pub const UPGRADE_IS_VALIDATION_DONE_CFM: u8 = 0x17;
pub const UPGRADE_SYNC_AFTER_REBOOT_REQ: u8 = 0x18;
pub const UPGRADE_VERSION_REQ: u8 = 0x19;
pub const UPGRADE_VERSION_CFM: u8 = 0x1A;
pub const UPGRADE_VARIANT_REQ: u8 = 0x1B;
pub const UPGRADE_VARIANT_CFM: u8 = 0x1C;
pub const UPGRADE_ERRORWARN_RES: u8 = 0x1F;

// ============================================================================
// Framing
// ============================================================================

/// Frame header: opcode (1) + big-endian payload length (2).
pub const FRAME_HEADER_SIZE: usize = 3;

/// Variant identifiers are fixed 8-byte strings.
pub const VARIANT_SIZE: usize = 8;

// ============================================================================
// Protocol Values
// ============================================================================

/// Protocol version reported in SYNC_CFM.
pub const PROTOCOL_VERSION: u8 = 3;

/// Battery level reported in START_CFM; hosts treat it as "not measured".
pub const START_CFM_BATTERY_LEVEL: u16 = 0x0666;

/// Back-off returned in IS_VALIDATION_DONE_CFM while validation runs.
pub const VALIDATION_BACKOFF_MS: u16 = 100;

/// Maximum number of host messages accepted before flow is turned off.
pub const MAX_PENDING_DATA_REQ: usize = 8;

/// Action byte meaning "continue" / "yes" in the *_RES and COMMIT_CFM messages.
pub const ACTION_CONTINUE: u8 = 0;

/// Action byte sent to abandon the step.
pub const ACTION_ABORT: u8 = 1;

// ============================================================================
// Timing
// ============================================================================

/// How long a post-reboot device waits for the host before reverting.
pub const DEFAULT_RECONNECTION_TIMEOUT_MS: u32 = 60_000;

/// Delay between COMPLETE_IND and the final "done" status indication.
pub const COMPLETE_STATUS_DELAY_MS: u32 = 2_000;

/// Upper bound on START_REQ retries toward the peer.
pub const PEER_START_RETRY_LIMIT: u32 = 5;

/// Delay between START_REQ retries toward the peer.
pub const PEER_START_RETRY_DELAY_MS: u32 = 2_000;

/// Poll interval while the commit waits for the peer relay to finish.
pub const PEER_POLL_INTERVAL_MS: u32 = 500;

/// Largest DATA payload the peer relay puts in a single message.
pub const PEER_MAX_DATA_PACKET: usize = 240;
