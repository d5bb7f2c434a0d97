//! Upgrade states and the application-facing policy enums.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// State of the host upgrade protocol machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum UpgradeState {
    /// Booted, deciding where to continue.
    #[default]
    CheckStatus,
    /// Idle, waiting for SYNC_REQ.
    Sync,
    /// Synced, waiting for START_REQ.
    Ready,
    /// A fatal error is waiting for the host to acknowledge it.
    Aborting,
    /// Started, waiting for START_DATA_REQ.
    DataReady,
    /// Receiving the upgrade file.
    DataTransfer,
    /// Whole file received, checking the digest.
    DataHashChecking,
    /// Validating the written partitions.
    Validating,
    /// Waiting for an asynchronous partition validation.
    WaitForValidate,
    /// Validated, waiting for TRANSFER_COMPLETE_RES.
    Validated,
    /// Rebooted into the new image, waiting for the host to reconnect.
    RestartedForCommit,
    /// Waiting for IN_PROGRESS_RES.
    CommitHostContinue,
    /// Checking the running application before asking for the commit.
    CommitVerification,
    /// Waiting for COMMIT_CFM.
    CommitConfirm,
    /// Committing and erasing the old banks.
    Commit,
    /// Out of key store space; only a reboot recovers.
    RebootToResume,
    BatteryLow,
}

impl fmt::Display for UpgradeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpgradeState::CheckStatus => write!(f, "CHECK_STATUS"),
            UpgradeState::Sync => write!(f, "SYNC"),
            UpgradeState::Ready => write!(f, "READY"),
            UpgradeState::Aborting => write!(f, "ABORTING"),
            UpgradeState::DataReady => write!(f, "DATA_READY"),
            UpgradeState::DataTransfer => write!(f, "DATA_TRANSFER"),
            UpgradeState::DataHashChecking => write!(f, "DATA_HASH_CHECKING"),
            UpgradeState::Validating => write!(f, "VALIDATING"),
            UpgradeState::WaitForValidate => write!(f, "WAIT_FOR_VALIDATE"),
            UpgradeState::Validated => write!(f, "VALIDATED"),
            UpgradeState::RestartedForCommit => write!(f, "RESTARTED_FOR_COMMIT"),
            UpgradeState::CommitHostContinue => write!(f, "COMMIT_HOST_CONTINUE"),
            UpgradeState::CommitVerification => write!(f, "COMMIT_VERIFICATION"),
            UpgradeState::CommitConfirm => write!(f, "COMMIT_CONFIRM"),
            UpgradeState::Commit => write!(f, "COMMIT"),
            UpgradeState::RebootToResume => write!(f, "REBOOT_TO_RESUME"),
            UpgradeState::BatteryLow => write!(f, "BATTERY_LOW"),
        }
    }
}

impl UpgradeState {
    /// Whether an upgrade is under way, so upgrades may not be disabled.
    pub fn is_upgrading(&self) -> bool {
        !matches!(self, UpgradeState::CheckStatus | UpgradeState::Sync)
    }
}

/// How the engine asks the application before disruptive steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    /// Upgrades are disabled.
    Deny,
    /// Reboots and erases happen without asking.
    #[default]
    AutoApprove,
    /// Every reboot and erase waits for the application to answer.
    AskApplication,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Permission::Deny => write!(f, "deny"),
            Permission::AutoApprove => write!(f, "auto_approve"),
            Permission::AskApplication => write!(f, "ask_application"),
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionError {
    #[error("Upgrades cannot be disabled while in {0}")]
    InProgress(UpgradeState),
}

/// Which earbud this device is in a peer upgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceRole {
    /// Talks to the host and relays the file to the peer.
    #[default]
    Primary,
    /// Receives the file from the primary over the peer link.
    Secondary,
}

/// What the application should tell the host after a reboot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectRecommendation {
    NotRequired,
    /// The new image waits for the host to confirm the commit.
    RequiredForConfirm,
    /// An upgrade was interrupted and can be resumed.
    RecommendedInProgress,
    /// The upgrade finished; the host may want to hear about it.
    RecommendedAsCompleted,
}

/// Coarse progress reported to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressStatus {
    Downloading,
    Committing,
    Done,
}

/// How a data phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndDataStatus {
    Complete,
    Abort,
}
