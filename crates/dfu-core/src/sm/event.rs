//! Inputs to the upgrade machine and the effects it asks for.

use super::state::{EndDataStatus, ProgressStatus, ReconnectRecommendation};
use crate::partition::FlashEvent;
use crate::protocol::{Action, HostMessage, HostResponse, UpgradeStatus};

/// Everything the upgrade machine reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeEvent {
    /// A decoded message from the host (or, on a secondary, the relay).
    Host(HostMessage),

    // Internal
    Continue,
    /// Upgrades may start: leave CHECK_STATUS for SYNC.
    Permit,
    /// Booted into a new image: leave CHECK_STATUS for RESTARTED_FOR_COMMIT.
    InProgress,
    BatteryLow,
    /// The application granted the blocking erase.
    Erase,
    /// The application granted the reboot.
    Reboot,
    ReconnectionTimeout,
    /// Re-check whether the peer relay has finished before erasing.
    PeerPoll,

    // Platform
    EraseStatus { ok: bool },
    CopyStatus { ok: bool },
    FsValidationStatus { ok: bool },
    AudioDfuFailure,

    /// Reported by the peer relay.
    Peer(PeerNotification),
}

impl UpgradeEvent {
    pub fn name(&self) -> &'static str {
        match self {
            UpgradeEvent::Host(msg) => msg.name(),
            UpgradeEvent::Continue => "CONTINUE",
            UpgradeEvent::Permit => "PERMIT",
            UpgradeEvent::InProgress => "IN_PROGRESS",
            UpgradeEvent::BatteryLow => "BATTERY_LOW",
            UpgradeEvent::Erase => "ERASE",
            UpgradeEvent::Reboot => "REBOOT",
            UpgradeEvent::ReconnectionTimeout => "RECONNECTION_TIMEOUT",
            UpgradeEvent::PeerPoll => "PEER_POLL",
            UpgradeEvent::EraseStatus { .. } => "ERASE_STATUS",
            UpgradeEvent::CopyStatus { .. } => "COPY_STATUS",
            UpgradeEvent::FsValidationStatus { .. } => "FS_VALIDATION_STATUS",
            UpgradeEvent::AudioDfuFailure => "AUDIO_DFU_FAILURE",
            UpgradeEvent::Peer(_) => "PEER",
        }
    }
}

impl From<HostMessage> for UpgradeEvent {
    fn from(msg: HostMessage) -> Self {
        UpgradeEvent::Host(msg)
    }
}

impl From<FlashEvent> for UpgradeEvent {
    fn from(event: FlashEvent) -> Self {
        match event {
            FlashEvent::EraseDone { ok } => UpgradeEvent::EraseStatus { ok },
            FlashEvent::CopyDone { ok } => UpgradeEvent::CopyStatus { ok },
            FlashEvent::ValidationDone { ok } => UpgradeEvent::FsValidationStatus { ok },
            FlashEvent::AudioCopyFailed => UpgradeEvent::AudioDfuFailure,
        }
    }
}

/// What the peer relay tells the upgrade machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerNotification {
    /// The secondary finished its transfer and validation.
    TransferCompleteInd,
    /// The secondary is ready to commit.
    CommitReq,
    /// The secondary is back after the reboot.
    SyncAfterRebootReq,
    /// The link came back after the reboot; carries the host's earlier answer.
    TransferCompleteRes(Action),
    /// The secondary failed.
    Error(UpgradeStatus),
    /// The relay stopped after an abort.
    Aborted,
}

/// Commands for the peer relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerCommand {
    Start { upgrade_id: u32 },
    TransferCompleteRes(Action),
    InProgressRes(Action),
    CommitCfm(Action),
    ErrorWarnRes(u16),
    Abort,
}

/// Notifications for the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppIndication {
    InitCfm,
    RestartedInd(ReconnectRecommendation),
    StatusInd(ProgressStatus),
    StartDataInd,
    EndDataInd(EndDataStatus),
    /// Asks whether the device may reboot now.
    ApplyInd,
    /// Asks whether the device may run a blocking erase now.
    BlockingInd,
    BlockingIsDoneInd,
    AudioCopyFailure,
    /// Clean up anything the application set up for the upgrade.
    CleanupOnAbort,
}

/// Side effects produced by one step of the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Send to whoever acts as host.
    Respond(HostResponse),
    Indicate(AppIndication),
    IndicateLater { indication: AppIndication, delay_ms: u32 },
    /// Feed an event back after a delay.
    Schedule { event: UpgradeEvent, delay_ms: u32 },
    /// Feed an event back once the current queue drains.
    Internal(UpgradeEvent),
    Peer(PeerCommand),
    Reboot,
}

/// Effect list with helpers for the common sends.
#[derive(Debug, Default)]
pub struct Effects(Vec<Effect>);

impl Effects {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, effect: Effect) {
        self.0.push(effect);
    }

    pub fn respond(&mut self, response: impl Into<HostResponse>) {
        self.0.push(Effect::Respond(response.into()));
    }

    pub fn error(&mut self, status: UpgradeStatus) {
        self.respond(HostResponse::ErrorWarnInd { code: status.code() });
    }

    pub fn indicate(&mut self, indication: AppIndication) {
        self.0.push(Effect::Indicate(indication));
    }

    pub fn indicate_later(&mut self, indication: AppIndication, delay_ms: u32) {
        self.0.push(Effect::IndicateLater { indication, delay_ms });
    }

    pub fn internal(&mut self, event: UpgradeEvent) {
        self.0.push(Effect::Internal(event));
    }

    pub fn schedule(&mut self, event: UpgradeEvent, delay_ms: u32) {
        self.0.push(Effect::Schedule { event, delay_ms });
    }

    pub fn peer(&mut self, command: PeerCommand) {
        self.0.push(Effect::Peer(command));
    }

    pub fn reboot(&mut self) {
        self.0.push(Effect::Reboot);
    }

    pub fn as_slice(&self) -> &[Effect] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<Effect> {
        self.0
    }
}
