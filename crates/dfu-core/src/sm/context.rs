//! Upgrade machine context: everything a handler reads or changes.

use tracing::{debug, info, warn};

use super::event::{AppIndication, Effects, PeerCommand, UpgradeEvent};
use super::state::{
    DeviceRole, EndDataStatus, Permission, PermissionError, ProgressStatus,
    ReconnectRecommendation, UpgradeState,
};
use crate::file::{PartitionDataParser, Version};
use crate::partition::{CopyOutcome, EraseOutcome, PartitionIo, PartitionTable};
use crate::protocol::*;
use crate::store::{HeaderLog, KeyStore, LoaderResult, PartitionsState, ResumePoint, ResumeStore};
use crate::validation::Validator;

/// Tunables the machine needs at run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpgradeSettings {
    pub reconnection_timeout_ms: u32,
    pub validation_backoff_ms: u16,
    pub complete_status_delay_ms: u32,
    pub peer_poll_interval_ms: u32,
    /// Relay the file to the peer earbud after validation.
    pub peer_enabled: bool,
}

impl Default for UpgradeSettings {
    fn default() -> Self {
        Self {
            reconnection_timeout_ms: DEFAULT_RECONNECTION_TIMEOUT_MS,
            validation_backoff_ms: VALIDATION_BACKOFF_MS,
            complete_status_delay_ms: COMPLETE_STATUS_DELAY_MS,
            peer_poll_interval_ms: PEER_POLL_INTERVAL_MS,
            peer_enabled: false,
        }
    }
}

/// Progress of the bank copy started after validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CopyState {
    #[default]
    NotStarted,
    Pending,
    Done(bool),
}

/// Snapshot of the peer relay, refreshed by the session after every relay step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PeerStatus {
    /// The relay is running an upgrade of the peer.
    pub started: bool,
    /// The peer has rebooted into its new image.
    pub restarted: bool,
    /// The peer sent COMMIT_REQ.
    pub committed: bool,
    /// The peer is back after its reboot and waits for IN_PROGRESS_RES.
    pub commit_continue: bool,
}

/// Owned state of the upgrade machine.
pub struct UpgradeContext<F: PartitionIo, K: KeyStore> {
    pub state: UpgradeState,
    pub permission: Permission,
    pub role: DeviceRole,
    pub battery_low: bool,
    pub variant: [u8; VARIANT_SIZE],
    pub table: PartitionTable,
    pub settings: UpgradeSettings,
    pub flash: F,
    pub store: ResumeStore<K>,
    pub header_log: HeaderLog,
    pub validator: Validator,
    pub peer: PeerStatus,
    /// Ask for every pending block at once instead of one at a time.
    pub request_multiple_blocks: bool,
    pub(crate) parser: Option<PartitionDataParser>,
    pub(crate) copy: CopyState,
    /// Wipe the inactive banks before the next transfer.
    pub(crate) force_erase: bool,
    pub(crate) validation_done_req: bool,
    pub(crate) swap_requested: bool,
    pub(crate) peer_start_sent: bool,
    pub(crate) delayed_peer_start: bool,
    /// ABORT_CFM is owed once the erase completes.
    pub(crate) abort_pending: bool,
    pub(crate) abort_done: bool,
    pub(crate) battery_error_sent: bool,
    pub(crate) reconnect_armed: bool,
    pub(crate) host_synced_after_reboot: bool,
}

impl<F: PartitionIo, K: KeyStore> UpgradeContext<F, K> {
    /// Load the persisted records from `keys`; nothing is sent until [`init`](Self::init).
    pub fn new(flash: F, keys: K, table: PartitionTable, settings: UpgradeSettings) -> Self {
        let store = ResumeStore::load(keys);
        let header_log = HeaderLog::load(store.keys());
        Self {
            state: UpgradeState::CheckStatus,
            permission: Permission::default(),
            role: DeviceRole::default(),
            battery_low: false,
            variant: [0; VARIANT_SIZE],
            table,
            settings,
            flash,
            store,
            header_log,
            validator: Validator::new(),
            peer: PeerStatus::default(),
            request_multiple_blocks: false,
            parser: None,
            copy: CopyState::NotStarted,
            force_erase: false,
            validation_done_req: false,
            swap_requested: false,
            peer_start_sent: false,
            delayed_peer_start: false,
            abort_pending: false,
            abort_done: false,
            battery_error_sent: false,
            reconnect_armed: false,
            host_synced_after_reboot: false,
        }
    }

    /// Decide where to continue after boot and tell the application.
    pub fn init(
        &mut self,
        permission: Permission,
        variant: [u8; VARIANT_SIZE],
        factory_version: Version,
        factory_config_version: u16,
    ) -> Effects {
        let mut out = Effects::new();
        self.permission = permission;
        self.variant = variant;
        self.role = if self.store.peer_record().is_secondary {
            DeviceRole::Secondary
        } else {
            DeviceRole::Primary
        };
        if let Err(e) = self.store.init_factory(factory_version, factory_config_version) {
            warn!(error = %e, "Could not record factory version");
        }

        let record = self.store.record();
        let resume_point = record.resume_point;
        let recommendation = match resume_point {
            ResumePoint::PostReboot | ResumePoint::Commit => ReconnectRecommendation::RequiredForConfirm,
            ResumePoint::Erase => ReconnectRecommendation::RecommendedAsCompleted,
            ResumePoint::PreValidate | ResumePoint::PreReboot => {
                ReconnectRecommendation::RecommendedInProgress
            }
            ResumePoint::Start if record.has_partial_download() => {
                ReconnectRecommendation::RecommendedInProgress
            }
            _ => ReconnectRecommendation::NotRequired,
        };
        info!(
            resume_point = %resume_point,
            upgrade_id = record.upgrade_id,
            version = %record.active_version,
            role = ?self.role,
            "Upgrade engine initialised"
        );

        match resume_point {
            ResumePoint::PostReboot => {
                self.state = UpgradeState::CheckStatus;
                out.internal(UpgradeEvent::InProgress);
                self.reconnect_armed = true;
                out.schedule(
                    UpgradeEvent::ReconnectionTimeout,
                    self.settings.reconnection_timeout_ms,
                );
            }
            ResumePoint::Error => self.goto_state(UpgradeState::Aborting),
            _ => {
                self.state = UpgradeState::CheckStatus;
                out.internal(UpgradeEvent::Permit);
            }
        }

        out.indicate(AppIndication::InitCfm);
        out.indicate(AppIndication::RestartedInd(recommendation));
        out
    }

    /// Hand back the platform pieces; everything volatile is dropped.
    pub fn into_parts(self) -> (F, K) {
        (self.flash, self.store.into_keys())
    }

    /// Transition to a new state.
    pub fn goto_state(&mut self, new_state: UpgradeState) {
        info!(from = %self.state, to = %new_state, "State transition");
        self.state = new_state;
    }

    /// Transition and immediately feed `Continue` to the new state.
    pub(crate) fn move_to_state(&mut self, new_state: UpgradeState, out: &mut Effects) {
        self.goto_state(new_state);
        out.internal(UpgradeEvent::Continue);
    }

    pub fn resume_point(&self) -> ResumePoint {
        self.store.record().resume_point
    }

    /// Persist a new resume point. A failed write is logged; the next save
    /// carries the value.
    pub(crate) fn persist(&mut self, point: ResumePoint) {
        if let Err(e) = self.store.set_resume_point(point) {
            warn!(point = %point, error = %e, "Resume point not saved");
        }
    }

    pub(crate) fn save(&mut self) {
        if let Err(e) = self.store.save() {
            warn!(error = %e, "Resume record not saved");
        }
    }

    /// Whether this device relays the upgrade to its peer.
    pub fn peer_supported(&self) -> bool {
        self.settings.peer_enabled && self.role == DeviceRole::Primary
    }

    pub(crate) fn peer_started(&self) -> bool {
        self.peer_supported() && self.peer.started
    }

    pub fn copy_state(&self) -> CopyState {
        self.copy
    }

    pub fn has_open_partition(&self) -> bool {
        self.parser.as_ref().is_some_and(|p| p.has_open_partition())
    }

    // ========================================================================
    // Permission
    // ========================================================================

    /// Ask for a reboot (`ApplyInd`) or blocking erase (`BlockingInd`).
    pub(crate) fn have_permission(&self, request: AppIndication, out: &mut Effects) -> bool {
        match self.permission {
            Permission::Deny => false,
            Permission::AutoApprove => true,
            Permission::AskApplication => {
                out.indicate(request);
                false
            }
        }
    }

    /// Application answer to `ApplyInd`: 0 reboots now, anything else asks again later.
    pub fn apply_response(&self, postpone_ms: u32) -> Effects {
        self.permission_response(AppIndication::ApplyInd, UpgradeEvent::Reboot, postpone_ms)
    }

    /// Application answer to `BlockingInd`: 0 erases now, anything else asks again later.
    pub fn blocking_response(&self, postpone_ms: u32) -> Effects {
        self.permission_response(AppIndication::BlockingInd, UpgradeEvent::Erase, postpone_ms)
    }

    fn permission_response(
        &self,
        indication: AppIndication,
        granted: UpgradeEvent,
        postpone_ms: u32,
    ) -> Effects {
        let mut out = Effects::new();
        if postpone_ms == 0 {
            debug!(event = granted.name(), "Permission granted");
            out.internal(granted);
        } else {
            debug!(postpone_ms, "Permission postponed");
            out.indicate_later(indication, postpone_ms);
        }
        out
    }

    /// Change the permission policy. Upgrades cannot be disabled mid-upgrade.
    pub fn set_permission(&mut self, permission: Permission) -> Result<(), PermissionError> {
        if permission == Permission::Deny && self.state.is_upgrading() {
            warn!(state = %self.state, "Refusing to disable upgrades mid-upgrade");
            return Err(PermissionError::InProgress(self.state));
        }
        info!(from = %self.permission, to = %permission, "Permission changed");
        self.permission = permission;
        Ok(())
    }

    // ========================================================================
    // Shared routines
    // ========================================================================

    /// Report an unrecoverable error and wait for the host to acknowledge it.
    pub(crate) fn fatal_error(&mut self, status: UpgradeStatus, out: &mut Effects) {
        warn!(code = ?status, state = %self.state, "Fatal upgrade error");
        out.error(status);
        self.goto_state(UpgradeState::Aborting);
        self.persist(ResumePoint::Error);
        out.indicate(AppIndication::EndDataInd(EndDataStatus::Abort));
    }

    /// No room to record progress: only flooding the key store and rebooting helps.
    pub(crate) fn ps_space_error(&mut self, out: &mut Effects) {
        warn!(free = self.store.free_words(), "Key store full");
        out.error(UpgradeStatus::PartitionCloseFailedPsSpace);
        self.goto_state(UpgradeState::RebootToResume);
    }

    /// Drop the parser, reset the record and erase the inactive banks.
    pub(crate) fn erase(&mut self, out: &mut Effects) -> EraseOutcome {
        if let Some(parser) = self.parser.take() {
            parser.abandon(&mut self.flash);
        }
        self.store.reset_for_erase();
        self.store.record_mut().loader_result = LoaderResult::None;
        self.save();
        if let Err(e) = self.header_log.reset(self.store.keys_mut()) {
            warn!(error = %e, "Header log not reset");
        }

        let targets = self.table.erase_targets(self.store.record().partition_bitmap);
        info!(partitions = ?targets, "Erasing inactive banks");
        let outcome = self.flash.erase(&targets);
        if outcome == EraseOutcome::Done {
            self.blocking_done(out);
        }
        outcome
    }

    /// Wipe the inactive banks ahead of a restarted transfer, keeping the sync id.
    pub(crate) fn force_erase_banks(&mut self) -> EraseOutcome {
        self.force_erase = false;
        let record = self.store.record_mut();
        record.partitions_state = PartitionsState::Erased;
        record.last_closed_partition = 0;
        record.dfu_partition_number = 0;
        record.pending_bitmap = 0;
        self.save();
        let targets = self.table.erase_targets(self.store.record().partition_bitmap);
        info!(partitions = ?targets, "Forced erase before transfer");
        self.flash.erase(&targets)
    }

    pub(crate) fn blocking_done(&self, out: &mut Effects) {
        if self.permission == Permission::AskApplication {
            out.indicate(AppIndication::BlockingIsDoneInd);
        }
    }

    /// Tear the upgrade down after ABORT_REQ or an acknowledged error.
    pub(crate) fn abort(&mut self, out: &mut Effects) {
        self.swap_requested = false;
        self.validation_done_req = false;
        self.delayed_peer_start = false;
        self.copy = CopyState::NotStarted;
        if self.peer_started() || self.peer_start_sent {
            out.peer(PeerCommand::Abort);
        }
        self.peer_start_sent = false;

        match self.permission {
            Permission::AutoApprove => match self.erase(out) {
                EraseOutcome::Done => out.respond(HostResponse::AbortCfm),
                EraseOutcome::Pending => self.abort_pending = true,
            },
            Permission::AskApplication => {
                out.indicate(AppIndication::BlockingInd);
                self.abort_pending = true;
            }
            Permission::Deny => {
                // Banks stay as written; only the erase needs permission.
                if let Some(parser) = self.parser.take() {
                    parser.abandon(&mut self.flash);
                }
                self.persist(ResumePoint::Start);
                out.respond(HostResponse::AbortCfm);
            }
        }
        self.abort_done = true;
        self.goto_state(UpgradeState::Sync);
    }

    /// Send the owed ABORT_CFM once the erase behind it finished.
    pub(crate) fn confirm_pending_abort(&mut self, out: &mut Effects) {
        if self.abort_pending {
            self.abort_pending = false;
            out.respond(HostResponse::AbortCfm);
        }
    }

    /// Start copying the validated image into place.
    pub(crate) fn start_image_copy(&mut self, out: &mut Effects) {
        self.copy = CopyState::Pending;
        match self.flash.start_image_copy() {
            CopyOutcome::Done(ok) => out.internal(UpgradeEvent::CopyStatus { ok }),
            CopyOutcome::Pending => debug!("Image copy running"),
        }
    }

    pub(crate) fn start_peer(&mut self, out: &mut Effects) {
        let upgrade_id = self.store.record().upgrade_id;
        info!(upgrade_id, "Starting peer upgrade");
        self.peer_start_sent = true;
        self.delayed_peer_start = false;
        out.peer(PeerCommand::Start { upgrade_id });
    }

    /// Reboot into the new image once the copy is done and the reboot allowed.
    pub(crate) fn try_swap(&mut self, out: &mut Effects) {
        if !self.swap_requested {
            return;
        }
        match self.copy {
            CopyState::Done(true) => {
                self.swap_requested = false;
                if let Err(e) = self.store.set_to_try_upgrades() {
                    warn!(error = %e, "Trial flag not saved");
                }
                info!("Rebooting into the new image");
                out.reboot();
            }
            CopyState::Done(false) => warn!("Swap requested after a failed copy"),
            CopyState::Pending | CopyState::NotStarted => debug!("Swap waits for the image copy"),
        }
    }

    /// Final step of a successful upgrade.
    pub(crate) fn inform_complete(&mut self, out: &mut Effects) {
        info!(version = %self.store.record().active_version, "Upgrade complete");
        out.respond(HostResponse::CompleteInd);
        out.indicate_later(
            AppIndication::StatusInd(ProgressStatus::Done),
            self.settings.complete_status_delay_ms,
        );
        self.goto_state(UpgradeState::Sync);
    }

    /// Whether the new image reports a problem after the reboot.
    pub(crate) fn new_image_error(&self) -> bool {
        let record = self.store.record();
        !record.trial_active || record.loader_result == LoaderResult::Error
    }

    pub(crate) fn is_dfu_update(&self) -> bool {
        self.store.record().dfu_partition_number != 0
    }

    /// Ask for every byte range the parser wants next.
    pub(crate) fn request_data(&mut self, out: &mut Effects) {
        let multiple_blocks = self.request_multiple_blocks;
        let Some(parser) = self.parser.as_mut() else {
            return;
        };
        while let Some((count, offset)) = parser.take_next_request() {
            out.respond(HostResponse::DataBytesReq { count, offset });
            if !multiple_blocks {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::{BlockingFlash, MemoryPartitions, PartitionType, UpgradablePartition};
    use crate::sm::event::Effect;
    use crate::store::MemoryKeyStore;

    fn context(keys: MemoryKeyStore) -> UpgradeContext<BlockingFlash, MemoryKeyStore> {
        let flash = BlockingFlash::new(MemoryPartitions::new(&[
            (PartitionType::Exe, 256),
            (PartitionType::Exe, 256),
        ]));
        let table = PartitionTable::new(vec![UpgradablePartition::double(0, 1, PartitionType::Exe)]);
        UpgradeContext::new(flash, keys, table, UpgradeSettings::default())
    }

    #[test]
    fn test_init_fresh_device_permits() {
        let mut ctx = context(MemoryKeyStore::default());
        let out = ctx.init(Permission::AutoApprove, [0; 8], Version::new(1, 0), 1).into_vec();
        assert_eq!(out[0], Effect::Internal(UpgradeEvent::Permit));
        assert_eq!(
            out[2],
            Effect::Indicate(AppIndication::RestartedInd(ReconnectRecommendation::NotRequired))
        );
        assert_eq!(ctx.store.record().active_version, Version::new(1, 0));
    }

    #[test]
    fn test_init_after_reboot_arms_reconnection_timer() {
        let keys = MemoryKeyStore::default();
        let mut store = ResumeStore::load(keys.clone());
        store.record_mut().resume_point = ResumePoint::PostReboot;
        store.save().unwrap();

        let mut ctx = context(keys);
        let out = ctx.init(Permission::AutoApprove, [0; 8], Version::new(1, 0), 1).into_vec();
        assert!(ctx.reconnect_armed);
        assert!(out.contains(&Effect::Internal(UpgradeEvent::InProgress)));
        assert!(out.contains(&Effect::Indicate(AppIndication::RestartedInd(
            ReconnectRecommendation::RequiredForConfirm
        ))));
    }

    #[test]
    fn test_init_in_error_goes_to_aborting() {
        let keys = MemoryKeyStore::default();
        let mut store = ResumeStore::load(keys.clone());
        store.record_mut().resume_point = ResumePoint::Error;
        store.save().unwrap();

        let mut ctx = context(keys);
        ctx.init(Permission::AutoApprove, [0; 8], Version::new(1, 0), 1);
        assert_eq!(ctx.state, UpgradeState::Aborting);
    }

    #[test]
    fn test_ask_application_emits_request() {
        let mut ctx = context(MemoryKeyStore::default());
        ctx.permission = Permission::AskApplication;
        let mut out = Effects::new();
        assert!(!ctx.have_permission(AppIndication::ApplyInd, &mut out));
        assert_eq!(out.as_slice(), &[Effect::Indicate(AppIndication::ApplyInd)]);
    }

    #[test]
    fn test_permission_responses() {
        let ctx = context(MemoryKeyStore::default());
        assert_eq!(
            ctx.apply_response(0).into_vec(),
            vec![Effect::Internal(UpgradeEvent::Reboot)]
        );
        assert_eq!(
            ctx.blocking_response(250).into_vec(),
            vec![Effect::IndicateLater {
                indication: AppIndication::BlockingInd,
                delay_ms: 250
            }]
        );
    }

    #[test]
    fn test_cannot_deny_mid_upgrade() {
        let mut ctx = context(MemoryKeyStore::default());
        ctx.state = UpgradeState::DataTransfer;
        assert_eq!(
            ctx.set_permission(Permission::Deny),
            Err(PermissionError::InProgress(UpgradeState::DataTransfer))
        );
        ctx.state = UpgradeState::Sync;
        assert!(ctx.set_permission(Permission::Deny).is_ok());
    }

    #[test]
    fn test_erase_resets_record() {
        let mut ctx = context(MemoryKeyStore::default());
        ctx.store.record_mut().upgrade_id = 9;
        ctx.store.record_mut().resume_point = ResumePoint::Erase;
        let mut out = Effects::new();
        assert_eq!(ctx.erase(&mut out), EraseOutcome::Done);
        ctx.store.reload();
        assert_eq!(ctx.store.record().upgrade_id, 0);
        assert_eq!(ctx.resume_point(), ResumePoint::Start);
    }
}
