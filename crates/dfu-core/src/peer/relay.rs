//! Peer relay state machine.
//!
//! On a primary earbud the relay plays host to the secondary: it syncs,
//! starts, streams the file back out of local flash and forwards the
//! host's confirmations. It never sees the host link itself. Commands
//! arrive from the upgrade machine as [`PeerCommand`]s and results go back
//! as [`PeerNotification`]s.

use std::fmt;

use tracing::{debug, info, warn};

use super::mirror::PartitionMirror;
use crate::partition::{PartitionIo, PartitionTable};
use crate::protocol::*;
use crate::sm::{PeerCommand, PeerNotification, PeerStatus};
use crate::store::{HeaderLog, KeyStore, ResumePoint, ResumeStore, StoreError};

/// Relay progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RelayState {
    #[default]
    Idle,
    Sync,
    Ready,
    DataReady,
    DataTransfer,
    Validated,
    /// The secondary dropped the link to reboot; reconnecting.
    ConnectForReboot,
    RestartedForCommit,
    CommitHostContinue,
    CommitVerification,
    CommitConfirm,
    Commit,
    Aborting,
}

impl RelayState {
    const ALL: [RelayState; 13] = [
        RelayState::Idle,
        RelayState::Sync,
        RelayState::Ready,
        RelayState::DataReady,
        RelayState::DataTransfer,
        RelayState::Validated,
        RelayState::ConnectForReboot,
        RelayState::RestartedForCommit,
        RelayState::CommitHostContinue,
        RelayState::CommitVerification,
        RelayState::CommitConfirm,
        RelayState::Commit,
        RelayState::Aborting,
    ];

    pub fn as_u16(self) -> u16 {
        Self::ALL.iter().position(|s| *s == self).unwrap_or(0) as u16
    }

    pub fn from_u16(value: u16) -> Option<Self> {
        Self::ALL.get(value as usize).copied()
    }
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RelayState::Idle => "IDLE",
            RelayState::Sync => "SYNC",
            RelayState::Ready => "READY",
            RelayState::DataReady => "DATA_READY",
            RelayState::DataTransfer => "DATA_TRANSFER",
            RelayState::Validated => "VALIDATED",
            RelayState::ConnectForReboot => "CONNECT_FOR_REBOOT",
            RelayState::RestartedForCommit => "RESTARTED_FOR_COMMIT",
            RelayState::CommitHostContinue => "COMMIT_HOST_CONTINUE",
            RelayState::CommitVerification => "COMMIT_VERIFICATION",
            RelayState::CommitConfirm => "COMMIT_CONFIRM",
            RelayState::Commit => "COMMIT",
            RelayState::Aborting => "ABORTING",
        };
        f.write_str(name)
    }
}

/// Everything the relay reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayInput {
    Command(PeerCommand),
    /// Result of a requested link connection.
    LinkConnected(bool),
    LinkDisconnected,
    /// A decoded message from the secondary.
    Received(HostResponse),
    /// Start retry timer fired.
    RetryStart,
    /// Validation back-off expired.
    PollValidation,
    /// Voice call started or ended.
    Sco(bool),
}

impl RelayInput {
    pub fn name(&self) -> &'static str {
        match self {
            RelayInput::Command(_) => "COMMAND",
            RelayInput::LinkConnected(_) => "LINK_CONNECTED",
            RelayInput::LinkDisconnected => "LINK_DISCONNECTED",
            RelayInput::Received(resp) => resp.name(),
            RelayInput::RetryStart => "RETRY_START",
            RelayInput::PollValidation => "POLL_VALIDATION",
            RelayInput::Sco(_) => "SCO",
        }
    }
}

/// What the relay asks the session to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEffect {
    /// Send to the secondary.
    Send(HostMessage),
    Notify(PeerNotification),
    Schedule { input: RelayInput, delay_ms: u32 },
    /// Ask the application to open the peer link.
    Connect,
    /// Ask the application to close the peer link.
    Disconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelaySettings {
    pub start_retry_limit: u32,
    pub start_retry_delay_ms: u32,
    pub max_data_packet: usize,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            start_retry_limit: PEER_START_RETRY_LIMIT,
            start_retry_delay_ms: PEER_START_RETRY_DELAY_MS,
            max_data_packet: PEER_MAX_DATA_PACKET,
        }
    }
}

/// Local resources the relay reads and persists through.
pub struct RelayEnv<'a, F: PartitionIo, K: KeyStore> {
    pub flash: &'a F,
    pub store: &'a mut ResumeStore<K>,
    pub header_log: &'a HeaderLog,
    pub table: &'a PartitionTable,
}

/// Persisted role flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DfuInfo {
    pub is_secondary: bool,
    pub is_dfu_mode: bool,
}

/// Role flags as last persisted.
pub fn dfu_info<K: KeyStore>(store: &ResumeStore<K>) -> DfuInfo {
    let record = store.peer_record();
    DfuInfo {
        is_secondary: record.is_secondary,
        is_dfu_mode: record.is_dfu_mode,
    }
}

/// Persist the device role.
pub fn set_role<K: KeyStore>(store: &mut ResumeStore<K>, primary: bool) -> Result<(), StoreError> {
    info!(primary, "Peer role set");
    store.peer_record_mut().is_secondary = !primary;
    store.save()
}

/// Persist whether the earbuds are in DFU mode.
pub fn set_dfu_mode<K: KeyStore>(store: &mut ResumeStore<K>, dfu_mode: bool) -> Result<(), StoreError> {
    debug!(dfu_mode, "Peer DFU mode set");
    store.peer_record_mut().is_dfu_mode = dfu_mode;
    store.save()
}

/// Relay from this (primary) earbud to its peer.
#[derive(Debug, Default)]
pub struct PeerRelay {
    state: RelayState,
    /// A relay run exists, from start until it is stopped.
    active: bool,
    /// SYNC_REQ went out, so stopping needs ABORT_REQ.
    upgrading: bool,
    upgrade_id: u32,
    resume_point: ResumePoint,
    start_attempts: u32,
    mirror: Option<PartitionMirror>,
    /// The link dropped mid-transfer; abort the secondary once back.
    abort_triggered: bool,
    sco_active: bool,
    /// DATA_BYTES_REQ held back during a voice call.
    deferred_request: Option<(u32, u32)>,
    settings: RelaySettings,
}

impl PeerRelay {
    pub fn new(settings: RelaySettings) -> Self {
        Self {
            settings,
            ..Default::default()
        }
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    pub fn resume_point(&self) -> ResumePoint {
        self.resume_point
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Snapshot for the upgrade machine.
    pub fn status(&self) -> PeerStatus {
        PeerStatus {
            started: self.active,
            restarted: self.active && self.resume_point == ResumePoint::PostReboot,
            committed: self.state == RelayState::CommitConfirm,
            commit_continue: self.state == RelayState::CommitHostContinue,
        }
    }

    /// Pick up after a reboot of this device from the persisted peer record.
    pub fn restore<K: KeyStore>(&mut self, store: &ResumeStore<K>) -> Vec<RelayEffect> {
        let record = store.peer_record();
        if record.is_secondary || record.resume_point != ResumePoint::PostReboot {
            return Vec::new();
        }
        info!(upgrade_id = record.upgrade_id, "Peer relay resuming after reboot");
        self.active = true;
        self.upgrading = true;
        self.upgrade_id = record.upgrade_id;
        self.resume_point = ResumePoint::PostReboot;
        self.goto_state(RelayState::RestartedForCommit);
        vec![RelayEffect::Connect]
    }

    fn goto_state(&mut self, new_state: RelayState) {
        info!(from = %self.state, to = %new_state, "Relay state transition");
        self.state = new_state;
    }

    /// Run one input through the relay.
    pub fn handle<F: PartitionIo, K: KeyStore>(
        &mut self,
        input: RelayInput,
        env: &mut RelayEnv<'_, F, K>,
    ) -> Vec<RelayEffect> {
        let mut out = Vec::new();
        debug!(state = %self.state, input = input.name(), "Relay input");
        match input {
            RelayInput::Command(command) => self.handle_command(command, env, &mut out),
            RelayInput::LinkConnected(ok) => self.handle_connected(ok, env, &mut out),
            RelayInput::LinkDisconnected => self.handle_disconnected(env, &mut out),
            RelayInput::Received(response) => self.handle_response(response, env, &mut out),
            RelayInput::RetryStart if self.active && self.state == RelayState::Ready => {
                out.push(RelayEffect::Send(HostMessage::StartReq));
            }
            RelayInput::PollValidation if self.active => {
                out.push(RelayEffect::Send(HostMessage::IsValidationDoneReq));
            }
            RelayInput::Sco(active) => {
                self.sco_active = active;
                if !active {
                    if let Some((count, skip)) = self.deferred_request.take() {
                        debug!(count, skip, "Voice call ended, serving deferred request");
                        self.send_data(count, skip, env, &mut out);
                    }
                }
            }
            other => debug!(state = %self.state, input = other.name(), "Relay input ignored"),
        }
        out
    }

    // ========================================================================
    // Commands from the upgrade machine
    // ========================================================================

    fn handle_command<F: PartitionIo, K: KeyStore>(
        &mut self,
        command: PeerCommand,
        env: &mut RelayEnv<'_, F, K>,
        out: &mut Vec<RelayEffect>,
    ) {
        if let PeerCommand::Start { upgrade_id } = command {
            self.start(upgrade_id, env, out);
            return;
        }
        if !self.active {
            if command == PeerCommand::Abort {
                debug!("No relay to abort");
                return;
            }
            // The host carries on with an upgrade this relay no longer knows
            // about; reach the secondary and abort it there too.
            warn!(?command, "Relay command with no relay running");
            self.active = true;
            self.abort_triggered = true;
            self.goto_state(RelayState::Idle);
            out.push(RelayEffect::Connect);
            return;
        }

        match command {
            PeerCommand::Start { .. } => {}
            PeerCommand::TransferCompleteRes(Action::Continue) => {
                out.push(RelayEffect::Send(HostMessage::TransferCompleteRes {
                    action: Action::Continue,
                }));
            }
            PeerCommand::InProgressRes(action) => {
                self.goto_state(RelayState::CommitVerification);
                match action {
                    Action::Continue => out.push(RelayEffect::Send(HostMessage::InProgressRes { action })),
                    Action::Abort => self.abort_peer(env, out),
                }
            }
            PeerCommand::CommitCfm(Action::Continue) => {
                self.goto_state(RelayState::Commit);
                out.push(RelayEffect::Send(HostMessage::CommitCfm {
                    action: Action::Continue,
                }));
            }
            PeerCommand::TransferCompleteRes(Action::Abort) | PeerCommand::CommitCfm(Action::Abort) => {
                self.abort_peer(env, out);
            }
            PeerCommand::ErrorWarnRes(code) => {
                out.push(RelayEffect::Send(HostMessage::ErrorWarnRes { code }));
            }
            PeerCommand::Abort if self.state == RelayState::Aborting => {
                debug!("Link already gone, stopping relay");
                self.stop(env, out);
            }
            PeerCommand::Abort => self.abort_peer(env, out),
        }
    }

    fn start<F: PartitionIo, K: KeyStore>(
        &mut self,
        upgrade_id: u32,
        env: &mut RelayEnv<'_, F, K>,
        out: &mut Vec<RelayEffect>,
    ) {
        if self.active && self.state != RelayState::Idle {
            warn!(state = %self.state, "Peer upgrade already running");
            out.push(RelayEffect::Notify(PeerNotification::Error(UpgradeStatus::UpdateFailed)));
            return;
        }
        info!(upgrade_id, "Peer relay started");
        self.active = true;
        self.upgrading = false;
        self.abort_triggered = false;
        self.upgrade_id = upgrade_id;
        self.resume_point = ResumePoint::Start;
        self.start_attempts = 0;
        self.mirror = None;
        self.deferred_request = None;
        self.goto_state(RelayState::Sync);
        self.persist(env);
        out.push(RelayEffect::Connect);
    }

    fn abort_peer<F: PartitionIo, K: KeyStore>(&mut self, env: &mut RelayEnv<'_, F, K>, out: &mut Vec<RelayEffect>) {
        if self.upgrading {
            info!("Aborting the peer upgrade");
            out.push(RelayEffect::Send(HostMessage::AbortReq));
            self.upgrading = false;
        } else if self.state == RelayState::Sync {
            debug!("Peer upgrade not started yet, stopping");
            self.stop(env, out);
        }
    }

    // ========================================================================
    // Link events
    // ========================================================================

    fn handle_connected<F: PartitionIo, K: KeyStore>(
        &mut self,
        ok: bool,
        env: &mut RelayEnv<'_, F, K>,
        out: &mut Vec<RelayEffect>,
    ) {
        if !self.active {
            debug!("Peer link up with no relay running");
            return;
        }
        if !ok {
            warn!(state = %self.state, "Peer link could not be opened");
            out.push(RelayEffect::Notify(PeerNotification::Error(UpgradeStatus::AppNotReady)));
            return;
        }
        match self.state {
            RelayState::Sync => {
                self.upgrading = true;
                self.start_attempts = 0;
                out.push(RelayEffect::Send(HostMessage::SyncReq {
                    upgrade_id: self.upgrade_id,
                }));
            }
            RelayState::ConnectForReboot => {
                info!("Peer back after its reboot");
                self.resume_point = ResumePoint::PostReboot;
                self.persist(env);
                out.push(RelayEffect::Notify(PeerNotification::TransferCompleteRes(Action::Continue)));
            }
            RelayState::RestartedForCommit => {
                self.goto_state(RelayState::CommitHostContinue);
                out.push(RelayEffect::Send(HostMessage::SyncAfterRebootReq));
                out.push(RelayEffect::Notify(PeerNotification::SyncAfterRebootReq));
            }
            _ if self.abort_triggered => {
                warn!("Aborting the peer after a lost link");
                self.abort_triggered = false;
                out.push(RelayEffect::Send(HostMessage::ErrorWarnRes {
                    code: UpgradeStatus::UpdateFailed.code(),
                }));
                out.push(RelayEffect::Notify(PeerNotification::Error(UpgradeStatus::UpdateFailed)));
                self.goto_state(RelayState::Aborting);
                out.push(RelayEffect::Disconnect);
            }
            state => debug!(%state, "Peer link up"),
        }
    }

    fn handle_disconnected<F: PartitionIo, K: KeyStore>(
        &mut self,
        env: &mut RelayEnv<'_, F, K>,
        out: &mut Vec<RelayEffect>,
    ) {
        if !self.active {
            debug!("Peer link down with no relay running");
            return;
        }
        match self.state {
            RelayState::Validated => {
                // The secondary rebooted into its new image.
                self.goto_state(RelayState::ConnectForReboot);
                out.push(RelayEffect::Connect);
            }
            RelayState::ConnectForReboot | RelayState::RestartedForCommit => {
                out.push(RelayEffect::Connect);
            }
            RelayState::Aborting => {
                info!("Peer link closed after abort");
                self.clear(env);
            }
            state => {
                warn!(%state, "Peer link lost mid-upgrade");
                self.abort_triggered = true;
                out.push(RelayEffect::Connect);
            }
        }
    }

    // ========================================================================
    // Messages from the secondary
    // ========================================================================

    fn handle_response<F: PartitionIo, K: KeyStore>(
        &mut self,
        response: HostResponse,
        env: &mut RelayEnv<'_, F, K>,
        out: &mut Vec<RelayEffect>,
    ) {
        if !self.active {
            debug!(msg = response.name(), "Peer message with no relay running");
            return;
        }
        match response {
            HostResponse::SyncCfm { resume_point, .. } => {
                self.resume_point = resume_point;
                self.goto_state(RelayState::Ready);
                out.push(RelayEffect::Send(HostMessage::StartReq));
            }
            HostResponse::StartCfm { status, .. } => self.receive_start_cfm(status, env, out),
            HostResponse::DataBytesReq { count, offset } => {
                if self.sco_active {
                    debug!(count, offset, "Voice call active, deferring peer data");
                    self.deferred_request = Some((count, offset));
                } else {
                    self.send_data(count, offset, env, out);
                }
            }
            HostResponse::IsValidationDoneCfm { backoff_ms } if backoff_ms > 0 => {
                out.push(RelayEffect::Schedule {
                    input: RelayInput::PollValidation,
                    delay_ms: u32::from(backoff_ms),
                });
            }
            HostResponse::IsValidationDoneCfm { .. } => {
                out.push(RelayEffect::Send(HostMessage::IsValidationDoneReq));
            }
            HostResponse::TransferCompleteInd => {
                self.goto_state(RelayState::Validated);
                self.resume_point = ResumePoint::PreReboot;
                self.mirror = None;
                self.persist(env);
                out.push(RelayEffect::Notify(PeerNotification::TransferCompleteInd));
            }
            HostResponse::CommitReq => {
                self.goto_state(RelayState::CommitConfirm);
                self.resume_point = ResumePoint::Commit;
                self.persist(env);
                out.push(RelayEffect::Notify(PeerNotification::CommitReq));
            }
            HostResponse::InProgressInd if self.state == RelayState::RestartedForCommit => {
                self.goto_state(RelayState::CommitHostContinue);
                out.push(RelayEffect::Notify(PeerNotification::SyncAfterRebootReq));
            }
            HostResponse::InProgressInd => debug!(state = %self.state, "Peer in progress"),
            HostResponse::CompleteInd => {
                info!("Peer upgrade complete");
                self.stop(env, out);
            }
            HostResponse::AbortCfm => {
                info!("Peer upgrade aborted");
                self.stop(env, out);
                out.push(RelayEffect::Notify(PeerNotification::Aborted));
            }
            HostResponse::ErrorWarnInd { code } => {
                let status = UpgradeStatus::try_from(code).unwrap_or(UpgradeStatus::UpdateFailed);
                warn!(code, "Peer reported an error");
                out.push(RelayEffect::Notify(PeerNotification::Error(status)));
            }
            HostResponse::VersionCfm { .. } | HostResponse::VariantCfm { .. } => {
                debug!(msg = response.name(), "Peer info ignored");
            }
        }
    }

    fn receive_start_cfm<F: PartitionIo, K: KeyStore>(
        &mut self,
        status: u8,
        env: &mut RelayEnv<'_, F, K>,
        out: &mut Vec<RelayEffect>,
    ) {
        let status = u16::from(status);
        if status == UpgradeStatus::Success.code() {
            self.start_attempts = 0;
            self.goto_state(RelayState::DataReady);
            self.send_start_data_req(env, out);
        } else if status == UpgradeStatus::AppNotReady.code()
            && self.start_attempts < self.settings.start_retry_limit
        {
            self.start_attempts += 1;
            debug!(attempt = self.start_attempts, "Peer not ready, retrying start");
            out.push(RelayEffect::Schedule {
                input: RelayInput::RetryStart,
                delay_ms: self.settings.start_retry_delay_ms,
            });
        } else {
            warn!(status, attempts = self.start_attempts, "Peer refused to start");
            self.start_attempts = 0;
            out.push(RelayEffect::Notify(PeerNotification::Error(UpgradeStatus::InErrorState)));
        }
    }

    /// The secondary always receives the whole file from the top.
    fn send_start_data_req<F: PartitionIo, K: KeyStore>(
        &mut self,
        env: &mut RelayEnv<'_, F, K>,
        out: &mut Vec<RelayEffect>,
    ) {
        let bitmap = env.store.record().partition_bitmap;
        match PartitionMirror::build(env.header_log, env.table, bitmap) {
            Ok(mirror) => {
                debug!(bytes = mirror.total_len(), "Relaying upgrade file");
                self.mirror = Some(mirror);
            }
            Err(e) => {
                warn!(error = %e, "Cannot rebuild the upgrade file for the peer");
                out.push(RelayEffect::Notify(PeerNotification::Error(
                    UpgradeStatus::PartitionOpenFailed,
                )));
                return;
            }
        }
        self.resume_point = ResumePoint::Start;
        self.persist(env);
        out.push(RelayEffect::Send(HostMessage::StartDataReq));
    }

    fn send_data<F: PartitionIo, K: KeyStore>(
        &mut self,
        count: u32,
        skip: u32,
        env: &mut RelayEnv<'_, F, K>,
        out: &mut Vec<RelayEffect>,
    ) {
        let Some(mirror) = self.mirror.as_mut() else {
            warn!("Peer asked for data before START_DATA");
            out.push(RelayEffect::Notify(PeerNotification::Error(UpgradeStatus::InErrorState)));
            return;
        };
        if self.state != RelayState::DataTransfer {
            self.state = RelayState::DataTransfer;
            info!(to = %self.state, "Relay state transition");
        }

        mirror.skip(u64::from(skip));
        let bytes = match mirror.read(env.flash, count as usize) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "Peer data read failed");
                out.push(RelayEffect::Notify(PeerNotification::Error(
                    UpgradeStatus::PartitionOpenFailed,
                )));
                return;
            }
        };
        let last = mirror.is_finished();

        let packet = self.settings.max_data_packet.max(1);
        let chunks: Vec<&[u8]> = if bytes.is_empty() {
            vec![bytes.as_slice()]
        } else {
            bytes.chunks(packet).collect()
        };
        let final_index = chunks.len() - 1;
        for (i, chunk) in chunks.into_iter().enumerate() {
            out.push(RelayEffect::Send(HostMessage::Data {
                last_packet: last && i == final_index,
                bytes: chunk.to_vec(),
            }));
        }

        if last && self.resume_point == ResumePoint::Start {
            debug!("Last packet relayed, polling validation");
            self.resume_point = ResumePoint::PreValidate;
            self.persist(env);
            out.push(RelayEffect::Send(HostMessage::IsValidationDoneReq));
        }
    }

    // ========================================================================
    // Teardown and persistence
    // ========================================================================

    /// End the relay run and drop the link.
    fn stop<F: PartitionIo, K: KeyStore>(&mut self, env: &mut RelayEnv<'_, F, K>, out: &mut Vec<RelayEffect>) {
        self.clear(env);
        out.push(RelayEffect::Disconnect);
    }

    fn clear<F: PartitionIo, K: KeyStore>(&mut self, env: &mut RelayEnv<'_, F, K>) {
        self.upgrading = false;
        self.active = false;
        self.abort_triggered = false;
        self.mirror = None;
        self.deferred_request = None;
        self.resume_point = ResumePoint::Start;
        self.upgrade_id = 0;
        self.goto_state(RelayState::Idle);

        let record = env.store.peer_record_mut();
        record.resume_point = ResumePoint::Start;
        record.relay_state = RelayState::Idle.as_u16();
        record.upgrade_id = 0;
        if let Err(e) = env.store.save() {
            warn!(error = %e, "Peer record not cleared");
        }
    }

    fn persist<F: PartitionIo, K: KeyStore>(&self, env: &mut RelayEnv<'_, F, K>) {
        let record = env.store.peer_record_mut();
        record.resume_point = self.resume_point;
        record.relay_state = self.state.as_u16();
        record.upgrade_id = self.upgrade_id;
        if let Err(e) = env.store.save() {
            warn!(resume_point = %self.resume_point, error = %e, "Peer record not saved");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::{UpgradeFileBuilder, UpgradeHeader, Version};
    use crate::partition::{BlockingFlash, MemoryPartitions, PartitionType, UpgradablePartition};
    use crate::store::MemoryKeyStore;

    struct Rig {
        relay: PeerRelay,
        flash: BlockingFlash,
        store: ResumeStore<MemoryKeyStore>,
        log: HeaderLog,
        table: PartitionTable,
        file: Vec<u8>,
    }

    impl Rig {
        /// A primary that already received and stored `file`.
        fn new() -> Self {
            let file = UpgradeFileBuilder::new(UpgradeHeader::new("EARBUD", Version::new(2, 0), 1))
                .partition(0, 0x1234, (0..600u32).map(|i| i as u8).collect())
                .build();
            let table = PartitionTable::new(vec![UpgradablePartition::double(0, 1, PartitionType::Exe)]);
            let mut flash = BlockingFlash::new(MemoryPartitions::new(&[
                (PartitionType::Exe, 4096),
                (PartitionType::Exe, 4096),
            ]));
            let mut keys = MemoryKeyStore::default();
            let mut log = HeaderLog::new();
            let summary = crate::file::inspect(&file).unwrap();
            for section in &summary.sections {
                let body = section.offset + 12;
                if let Some(header) = section.partition {
                    log.append(&mut keys, &file[section.offset..body + 4]).unwrap();
                    let handle = flash.open(0, 1, header.first_word).unwrap();
                    flash.write(&handle, &file[body + 4..body + section.length as usize]);
                    flash.close(handle).unwrap();
                } else {
                    log.append(&mut keys, &file[section.offset..body + section.length as usize])
                        .unwrap();
                }
            }
            Self {
                relay: PeerRelay::new(RelaySettings::default()),
                flash,
                store: ResumeStore::load(keys),
                log,
                table,
                file,
            }
        }

        fn input(&mut self, input: RelayInput) -> Vec<RelayEffect> {
            let mut env = RelayEnv {
                flash: &self.flash,
                store: &mut self.store,
                header_log: &self.log,
                table: &self.table,
            };
            self.relay.handle(input, &mut env)
        }

        fn recv(&mut self, response: HostResponse) -> Vec<RelayEffect> {
            self.input(RelayInput::Received(response))
        }

        /// Start, connect, sync and start data.
        fn started(mut self) -> Self {
            assert_eq!(
                self.input(RelayInput::Command(PeerCommand::Start { upgrade_id: 7 })),
                vec![RelayEffect::Connect]
            );
            assert_eq!(
                self.input(RelayInput::LinkConnected(true)),
                vec![RelayEffect::Send(HostMessage::SyncReq { upgrade_id: 7 })]
            );
            self.recv(HostResponse::SyncCfm {
                resume_point: ResumePoint::Start,
                upgrade_id: 7,
                protocol_version: PROTOCOL_VERSION,
            });
            assert_eq!(
                self.recv(HostResponse::StartCfm {
                    status: 0,
                    battery_level: START_CFM_BATTERY_LEVEL,
                }),
                vec![RelayEffect::Send(HostMessage::StartDataReq)]
            );
            self
        }
    }

    fn data_of(effects: &[RelayEffect]) -> Vec<(bool, Vec<u8>)> {
        effects
            .iter()
            .filter_map(|e| match e {
                RelayEffect::Send(HostMessage::Data { last_packet, bytes }) => {
                    Some((*last_packet, bytes.clone()))
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_relay_streams_file_in_packets() {
        let mut rig = Rig::new().started();
        let len = rig.file.len() as u32;
        let effects = rig.recv(HostResponse::DataBytesReq { count: len, offset: 0 });
        let packets = data_of(&effects);

        assert!(packets.iter().all(|(_, bytes)| bytes.len() <= PEER_MAX_DATA_PACKET));
        assert_eq!(packets.iter().filter(|(last, _)| *last).count(), 1);
        assert!(packets.last().unwrap().0);
        let sent: Vec<u8> = packets.into_iter().flat_map(|(_, b)| b).collect();
        assert_eq!(sent, rig.file);
        assert_eq!(
            effects.last(),
            Some(&RelayEffect::Send(HostMessage::IsValidationDoneReq))
        );
        assert_eq!(rig.relay.resume_point(), ResumePoint::PreValidate);
        assert_eq!(rig.store.peer_record().resume_point, ResumePoint::PreValidate);
    }

    #[test]
    fn test_start_retries_are_bounded() {
        let mut rig = Rig::new();
        rig.input(RelayInput::Command(PeerCommand::Start { upgrade_id: 7 }));
        rig.input(RelayInput::LinkConnected(true));
        rig.recv(HostResponse::SyncCfm {
            resume_point: ResumePoint::Start,
            upgrade_id: 7,
            protocol_version: PROTOCOL_VERSION,
        });
        let not_ready = HostResponse::StartCfm {
            status: UpgradeStatus::AppNotReady.code() as u8,
            battery_level: 0,
        };
        for _ in 0..PEER_START_RETRY_LIMIT {
            assert_eq!(
                rig.recv(not_ready.clone()),
                vec![RelayEffect::Schedule {
                    input: RelayInput::RetryStart,
                    delay_ms: PEER_START_RETRY_DELAY_MS,
                }]
            );
            assert_eq!(
                rig.input(RelayInput::RetryStart),
                vec![RelayEffect::Send(HostMessage::StartReq)]
            );
        }
        assert_eq!(
            rig.recv(not_ready),
            vec![RelayEffect::Notify(PeerNotification::Error(UpgradeStatus::InErrorState))]
        );
    }

    #[test]
    fn test_voice_call_defers_data() {
        let mut rig = Rig::new().started();
        rig.input(RelayInput::Sco(true));
        assert!(rig.recv(HostResponse::DataBytesReq { count: 12, offset: 0 }).is_empty());

        let effects = rig.input(RelayInput::Sco(false));
        assert_eq!(data_of(&effects), vec![(false, rig.file[..12].to_vec())]);
    }

    #[test]
    fn test_validation_poll_and_transfer_complete() {
        let mut rig = Rig::new().started();
        assert_eq!(
            rig.recv(HostResponse::IsValidationDoneCfm { backoff_ms: 100 }),
            vec![RelayEffect::Schedule {
                input: RelayInput::PollValidation,
                delay_ms: 100,
            }]
        );
        assert_eq!(
            rig.recv(HostResponse::TransferCompleteInd),
            vec![RelayEffect::Notify(PeerNotification::TransferCompleteInd)]
        );
        assert_eq!(rig.relay.state(), RelayState::Validated);
        assert_eq!(rig.store.peer_record().resume_point, ResumePoint::PreReboot);
    }

    #[test]
    fn test_reboot_of_secondary_resumes_commit() {
        let mut rig = Rig::new().started();
        rig.recv(HostResponse::TransferCompleteInd);
        assert_eq!(
            rig.input(RelayInput::Command(PeerCommand::TransferCompleteRes(Action::Continue))),
            vec![RelayEffect::Send(HostMessage::TransferCompleteRes {
                action: Action::Continue
            })]
        );
        assert!(!rig.relay.status().restarted);

        assert_eq!(rig.input(RelayInput::LinkDisconnected), vec![RelayEffect::Connect]);
        assert_eq!(rig.relay.state(), RelayState::ConnectForReboot);
        assert_eq!(
            rig.input(RelayInput::LinkConnected(true)),
            vec![RelayEffect::Notify(PeerNotification::TransferCompleteRes(Action::Continue))]
        );
        assert!(rig.relay.status().restarted);
        assert_eq!(rig.store.peer_record().resume_point, ResumePoint::PostReboot);

        // This earbud reboots too and picks the relay back up.
        let mut relay = PeerRelay::new(RelaySettings::default());
        assert_eq!(relay.restore(&rig.store), vec![RelayEffect::Connect]);
        assert_eq!(relay.state(), RelayState::RestartedForCommit);
        rig.relay = relay;
        assert_eq!(
            rig.input(RelayInput::LinkConnected(true)),
            vec![
                RelayEffect::Send(HostMessage::SyncAfterRebootReq),
                RelayEffect::Notify(PeerNotification::SyncAfterRebootReq),
            ]
        );
        assert!(rig.relay.status().commit_continue);

        rig.input(RelayInput::Command(PeerCommand::InProgressRes(Action::Continue)));
        assert_eq!(rig.relay.state(), RelayState::CommitVerification);
        assert_eq!(
            rig.recv(HostResponse::CommitReq),
            vec![RelayEffect::Notify(PeerNotification::CommitReq)]
        );
        assert!(rig.relay.status().committed);
        rig.input(RelayInput::Command(PeerCommand::CommitCfm(Action::Continue)));
        assert_eq!(rig.relay.state(), RelayState::Commit);

        assert_eq!(rig.recv(HostResponse::CompleteInd), vec![RelayEffect::Disconnect]);
        assert!(!rig.relay.status().started);
        assert_eq!(rig.store.peer_record().resume_point, ResumePoint::Start);
    }

    #[test]
    fn test_lost_link_mid_transfer_aborts_peer() {
        let mut rig = Rig::new().started();
        rig.recv(HostResponse::DataBytesReq { count: 12, offset: 0 });
        assert_eq!(rig.input(RelayInput::LinkDisconnected), vec![RelayEffect::Connect]);
        assert_eq!(
            rig.input(RelayInput::LinkConnected(true)),
            vec![
                RelayEffect::Send(HostMessage::ErrorWarnRes {
                    code: UpgradeStatus::UpdateFailed.code()
                }),
                RelayEffect::Notify(PeerNotification::Error(UpgradeStatus::UpdateFailed)),
                RelayEffect::Disconnect,
            ]
        );
        assert_eq!(rig.relay.state(), RelayState::Aborting);
        assert!(rig.input(RelayInput::LinkDisconnected).is_empty());
        assert!(!rig.relay.is_active());
    }

    #[test]
    fn test_abort_before_and_after_sync() {
        let mut rig = Rig::new();
        rig.input(RelayInput::Command(PeerCommand::Start { upgrade_id: 7 }));
        assert_eq!(
            rig.input(RelayInput::Command(PeerCommand::Abort)),
            vec![RelayEffect::Disconnect]
        );
        assert!(!rig.relay.is_active());

        let mut rig = Rig::new().started();
        assert_eq!(
            rig.input(RelayInput::Command(PeerCommand::Abort)),
            vec![RelayEffect::Send(HostMessage::AbortReq)]
        );
        assert_eq!(
            rig.recv(HostResponse::AbortCfm),
            vec![RelayEffect::Disconnect, RelayEffect::Notify(PeerNotification::Aborted)]
        );
    }

    #[test]
    fn test_second_start_refused() {
        let mut rig = Rig::new().started();
        assert_eq!(
            rig.input(RelayInput::Command(PeerCommand::Start { upgrade_id: 8 })),
            vec![RelayEffect::Notify(PeerNotification::Error(UpgradeStatus::UpdateFailed))]
        );
    }

    #[test]
    fn test_role_flags_persist() {
        let mut store = ResumeStore::load(MemoryKeyStore::default());
        set_role(&mut store, false).unwrap();
        set_dfu_mode(&mut store, true).unwrap();
        let reloaded = ResumeStore::load(store.keys().clone());
        assert_eq!(
            dfu_info(&reloaded),
            DfuInfo {
                is_secondary: true,
                is_dfu_mode: true
            }
        );
    }

    #[test]
    fn test_state_codes_round_trip() {
        for state in RelayState::ALL {
            assert_eq!(RelayState::from_u16(state.as_u16()), Some(state));
        }
    }
}
