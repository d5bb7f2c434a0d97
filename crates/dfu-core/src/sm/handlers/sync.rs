//! Check-status, sync and ready handlers, plus the default handler.

use tracing::{debug, info, warn};

use super::{HandleResult, recovery};
use crate::partition::{EraseOutcome, PartitionIo};
use crate::protocol::*;
use crate::sm::context::UpgradeContext;
use crate::sm::event::{AppIndication, Effects, PeerNotification, UpgradeEvent};
use crate::sm::state::{DeviceRole, EndDataStatus, Permission, ProgressStatus, UpgradeState};
use crate::store::{KeyStore, ResumePoint};

/// CHECK_STATUS - waits for the boot decision.
pub(super) fn handle_check_status<F: PartitionIo, K: KeyStore>(
    ctx: &mut UpgradeContext<F, K>,
    event: &UpgradeEvent,
    _out: &mut Effects,
) -> HandleResult {
    match event {
        UpgradeEvent::Permit => ctx.goto_state(UpgradeState::Sync),
        UpgradeEvent::InProgress => ctx.goto_state(UpgradeState::RestartedForCommit),
        _ => return HandleResult::NotHandled,
    }
    HandleResult::Handled
}

/// SYNC - idle; only the reconnection timer is special here.
pub(super) fn handle_sync<F: PartitionIo, K: KeyStore>(
    ctx: &mut UpgradeContext<F, K>,
    event: &UpgradeEvent,
    out: &mut Effects,
) -> HandleResult {
    match event {
        UpgradeEvent::ReconnectionTimeout if ctx.reconnect_armed => {
            warn!("Host did not reconnect, reverting");
            ctx.reconnect_armed = false;
            if let Err(e) = ctx.store.revert_upgrades() {
                warn!(error = %e, "Revert not saved");
            }
            out.reboot();
            HandleResult::Handled
        }
        _ => HandleResult::NotHandled,
    }
}

/// READY - START_REQ picks up from the persisted resume point.
pub(super) fn handle_ready<F: PartitionIo, K: KeyStore>(
    ctx: &mut UpgradeContext<F, K>,
    event: &UpgradeEvent,
    out: &mut Effects,
) -> HandleResult {
    let UpgradeEvent::Host(HostMessage::StartReq) = event else {
        return HandleResult::NotHandled;
    };

    let resume_point = ctx.resume_point();
    info!(resume_point = %resume_point, "START_REQ");
    match resume_point {
        ResumePoint::Start => {
            if !ctx.store.record().has_partial_download() {
                out.indicate(AppIndication::StatusInd(ProgressStatus::Downloading));
            }
            ctx.goto_state(UpgradeState::DataReady);
        }
        ResumePoint::PreValidate => {
            ctx.validator.init();
            ctx.move_to_state(UpgradeState::Validating, out);
        }
        ResumePoint::PreReboot => {
            // The copy did not survive the reboot; run it again.
            ctx.validation_done_req = true;
            ctx.start_image_copy(out);
            ctx.move_to_state(UpgradeState::Validated, out);
        }
        ResumePoint::PostReboot => ctx.goto_state(UpgradeState::CommitHostContinue),
        ResumePoint::Commit | ResumePoint::Erase => ctx.move_to_state(UpgradeState::Commit, out),
        ResumePoint::Error => ctx.goto_state(UpgradeState::Aborting),
    }

    out.respond(HostResponse::StartCfm {
        status: UpgradeStatus::Success.code() as u8,
        battery_level: START_CFM_BATTERY_LEVEL,
    });
    HandleResult::Handled
}

/// Messages any state accepts unless its own handler took them.
pub(super) fn handle_default<F: PartitionIo, K: KeyStore>(
    ctx: &mut UpgradeContext<F, K>,
    event: &UpgradeEvent,
    out: &mut Effects,
) -> HandleResult {
    match event {
        UpgradeEvent::Host(HostMessage::SyncReq { upgrade_id }) => {
            handle_sync_req(ctx, *upgrade_id, out);
        }
        UpgradeEvent::Host(HostMessage::AbortReq) => handle_abort_req(ctx, out),
        UpgradeEvent::Host(HostMessage::VersionReq) => {
            let record = ctx.store.record();
            out.respond(HostResponse::VersionCfm {
                major: record.active_version.major,
                minor: record.active_version.minor,
                config: record.active_config_version,
            });
        }
        UpgradeEvent::Host(HostMessage::VariantReq) => {
            out.respond(HostResponse::VariantCfm {
                variant: ctx.variant,
            });
        }
        UpgradeEvent::Host(HostMessage::ErrorWarnRes { code }) if ctx.role == DeviceRole::Secondary => {
            info!(code, "Error acknowledged by the primary, aborting");
            ctx.abort(out);
            out.indicate(AppIndication::CleanupOnAbort);
        }
        UpgradeEvent::BatteryLow => {
            ctx.battery_error_sent = false;
            ctx.goto_state(UpgradeState::BatteryLow);
        }
        UpgradeEvent::Erase => {
            match ctx.erase(out) {
                EraseOutcome::Done => ctx.confirm_pending_abort(out),
                EraseOutcome::Pending => debug!("Erase running"),
            }
            ctx.goto_state(UpgradeState::Sync);
        }
        UpgradeEvent::Peer(PeerNotification::Error(status)) => recovery::peer_error(ctx, *status, out),
        UpgradeEvent::Peer(PeerNotification::Aborted) => recovery::peer_aborted(ctx, out),
        _ => return HandleResult::NotHandled,
    }
    HandleResult::Handled
}

fn handle_sync_req<F: PartitionIo, K: KeyStore>(
    ctx: &mut UpgradeContext<F, K>,
    upgrade_id: u32,
    out: &mut Effects,
) {
    ctx.force_erase = false;

    if ctx.permission == Permission::Deny {
        warn!(upgrade_id, "SYNC_REQ refused, upgrades disabled");
        out.error(UpgradeStatus::AppNotReady);
        return;
    }
    if upgrade_id == 0 {
        out.error(UpgradeStatus::InvalidSyncId);
        return;
    }

    let stored = ctx.store.record().upgrade_id;
    if stored != 0 && stored != upgrade_id {
        warn!(stored, requested = upgrade_id, "SYNC_REQ for a different upgrade");
        out.error(UpgradeStatus::WarnSyncIdIsDifferent);
        return;
    }

    if ctx.role == DeviceRole::Secondary
        && (stored != 0 || ctx.store.record().last_closed_partition != 0)
    {
        // The secondary never resumes a transfer; it starts over on clean banks.
        info!(upgrade_id, "Secondary restarting the transfer");
        let record = ctx.store.record_mut();
        record.last_closed_partition = 0;
        record.resume_point = ResumePoint::Start;
        ctx.force_erase = true;
    }

    let resume_point = ctx.resume_point();
    out.respond(HostResponse::SyncCfm {
        resume_point,
        upgrade_id,
        protocol_version: PROTOCOL_VERSION,
    });
    ctx.store.record_mut().upgrade_id = upgrade_id;
    ctx.store.peer_record_mut().upgrade_id = upgrade_id;
    ctx.save();
    info!(upgrade_id, resume_point = %resume_point, "Synced");
    ctx.goto_state(UpgradeState::Ready);
    ctx.abort_done = false;
}

fn handle_abort_req<F: PartitionIo, K: KeyStore>(ctx: &mut UpgradeContext<F, K>, out: &mut Effects) {
    if ctx.abort_pending {
        debug!("ABORT_REQ while an abort is pending, ignored");
        return;
    }
    if ctx.abort_done && ctx.state == UpgradeState::Sync {
        debug!("ABORT_REQ after a completed abort, ignored");
        return;
    }
    info!(state = %ctx.state, "Aborting upgrade");
    out.indicate(AppIndication::EndDataInd(EndDataStatus::Abort));
    ctx.abort(out);
}

#[cfg(test)]
mod tests {
    use crate::partition::{DeferredEraseFlash, PartitionIo};
    use crate::protocol::*;
    use crate::sm::event::{AppIndication, Effect, UpgradeEvent};
    use crate::sm::handlers::handle;
    use crate::sm::handlers::test_support::{Harness, layout, sample_file, table};
    use crate::sm::context::{UpgradeContext, UpgradeSettings};
    use crate::sm::state::{Permission, UpgradeState};
    use crate::store::{MemoryKeyStore, ResumePoint, ResumeStore};
    use crate::file::{Version, variant_bytes};

    #[test]
    fn test_boot_reaches_sync() {
        let harness = Harness::new(Permission::AutoApprove);
        assert_eq!(harness.ctx.state, UpgradeState::Sync);
        assert_eq!(harness.indications[0], AppIndication::InitCfm);
    }

    #[test]
    fn test_sync_accepts_and_persists_id() {
        let mut harness = Harness::new(Permission::AutoApprove);
        harness.host(HostMessage::SyncReq { upgrade_id: 0x1234 });
        assert_eq!(
            harness.take_responses(),
            vec![HostResponse::SyncCfm {
                resume_point: ResumePoint::Start,
                upgrade_id: 0x1234,
                protocol_version: PROTOCOL_VERSION,
            }]
        );
        assert_eq!(harness.ctx.state, UpgradeState::Ready);
        let reloaded = ResumeStore::load(harness.keys.clone());
        assert_eq!(reloaded.record().upgrade_id, 0x1234);
    }

    #[test]
    fn test_sync_rejections() {
        let mut harness = Harness::new(Permission::AutoApprove);
        harness.host(HostMessage::SyncReq { upgrade_id: 0 });
        assert_eq!(
            harness.take_responses(),
            vec![HostResponse::ErrorWarnInd {
                code: UpgradeStatus::InvalidSyncId.code()
            }]
        );

        harness.host(HostMessage::SyncReq { upgrade_id: 7 });
        harness.take_responses();
        harness.host(HostMessage::SyncReq { upgrade_id: 8 });
        assert_eq!(
            harness.take_responses(),
            vec![HostResponse::ErrorWarnInd {
                code: UpgradeStatus::WarnSyncIdIsDifferent.code()
            }]
        );
        assert_eq!(harness.ctx.state, UpgradeState::Ready);
        assert_eq!(harness.ctx.store.record().upgrade_id, 7);
    }

    #[test]
    fn test_sync_refused_when_denied() {
        let mut harness = Harness::new(Permission::Deny);
        harness.host(HostMessage::SyncReq { upgrade_id: 3 });
        assert_eq!(
            harness.take_responses(),
            vec![HostResponse::ErrorWarnInd {
                code: UpgradeStatus::AppNotReady.code()
            }]
        );
        assert_eq!(harness.ctx.state, UpgradeState::Sync);
    }

    #[test]
    fn test_version_and_variant() {
        let mut harness = Harness::new(Permission::AutoApprove);
        harness.host(HostMessage::VersionReq);
        harness.host(HostMessage::VariantReq);
        assert_eq!(
            harness.take_responses(),
            vec![
                HostResponse::VersionCfm {
                    major: 1,
                    minor: 0,
                    config: 1
                },
                HostResponse::VariantCfm {
                    variant: variant_bytes("EARBUD")
                },
            ]
        );
    }

    #[test]
    fn test_start_on_fresh_upgrade() {
        let mut harness = Harness::new(Permission::AutoApprove);
        harness.host(HostMessage::SyncReq { upgrade_id: 1 });
        harness.take_responses();
        harness.host(HostMessage::StartReq);
        assert_eq!(
            harness.take_responses(),
            vec![HostResponse::StartCfm {
                status: 0,
                battery_level: START_CFM_BATTERY_LEVEL
            }]
        );
        assert_eq!(harness.ctx.state, UpgradeState::DataReady);
    }

    #[test]
    fn test_abort_is_idempotent() {
        let mut harness = Harness::new(Permission::AutoApprove);
        harness.host(HostMessage::SyncReq { upgrade_id: 1 });
        harness.take_responses();
        harness.host(HostMessage::AbortReq);
        assert_eq!(harness.take_responses(), vec![HostResponse::AbortCfm]);
        assert_eq!(harness.ctx.state, UpgradeState::Sync);

        harness.host(HostMessage::AbortReq);
        assert!(harness.take_responses().is_empty());
        assert_eq!(harness.partitions.erase_log().len(), 1);
    }

    #[test]
    fn test_abort_without_permission_resets_resume_point() {
        let mut harness = Harness::new(Permission::AutoApprove);
        harness.download(1, &sample_file());
        assert_eq!(harness.ctx.state, UpgradeState::Validated);
        assert_eq!(harness.ctx.resume_point(), ResumePoint::PreReboot);
        harness.take_responses();

        harness.ctx.permission = Permission::Deny;
        harness.host(HostMessage::AbortReq);
        harness.host(HostMessage::AbortReq);
        assert_eq!(harness.take_responses(), vec![HostResponse::AbortCfm]);
        assert_eq!(harness.ctx.state, UpgradeState::Sync);
        assert_eq!(harness.ctx.resume_point(), ResumePoint::Start);
        assert!(harness.partitions.erase_log().is_empty());

        let reloaded = ResumeStore::load(harness.keys.clone());
        assert_eq!(reloaded.record().resume_point, ResumePoint::Start);
    }

    #[test]
    fn test_abort_with_deferred_erase_confirms_later() {
        let partitions = layout();
        let flash = DeferredEraseFlash::new(partitions.clone());
        let mut ctx = UpgradeContext::new(flash, MemoryKeyStore::default(), table(), UpgradeSettings::default());
        ctx.init(Permission::AutoApprove, [0; 8], Version::new(1, 0), 1);
        handle(&mut ctx, UpgradeEvent::Permit);
        handle(&mut ctx, UpgradeEvent::Host(HostMessage::SyncReq { upgrade_id: 4 }));

        let effects = handle(&mut ctx, UpgradeEvent::Host(HostMessage::AbortReq));
        assert!(!effects.contains(&Effect::Respond(HostResponse::AbortCfm)));
        assert!(handle(&mut ctx, UpgradeEvent::Host(HostMessage::AbortReq)).is_empty());

        let done = ctx.flash.poll_event().map(UpgradeEvent::from).unwrap();
        let effects = handle(&mut ctx, done);
        assert!(effects.contains(&Effect::Respond(HostResponse::AbortCfm)));
    }

    #[test]
    fn test_abort_asks_application_before_erasing() {
        let mut harness = Harness::new(Permission::AskApplication);
        harness.host(HostMessage::SyncReq { upgrade_id: 1 });
        harness.take_responses();
        harness.host(HostMessage::AbortReq);
        assert!(harness.take_responses().is_empty());
        assert!(harness.indications.contains(&AppIndication::BlockingInd));
        assert!(harness.partitions.erase_log().is_empty());

        let granted = harness.ctx.blocking_response(0).into_vec();
        harness.apply(granted);
        assert_eq!(harness.take_responses(), vec![HostResponse::AbortCfm]);
        assert_eq!(harness.partitions.erase_log().len(), 1);
        assert!(harness.indications.contains(&AppIndication::BlockingIsDoneInd));
    }

    #[test]
    fn test_reconnection_timeout_in_sync_reverts() {
        let keys = MemoryKeyStore::default();
        let mut store = ResumeStore::load(keys.clone());
        store.record_mut().resume_point = ResumePoint::PostReboot;
        store.record_mut().trial_active = true;
        store.save().unwrap();

        let mut harness = Harness::with_parts(layout(), keys, Permission::AutoApprove);
        assert_eq!(harness.ctx.state, UpgradeState::RestartedForCommit);
        harness.ctx.goto_state(UpgradeState::Sync);
        harness.event(UpgradeEvent::ReconnectionTimeout);
        assert_eq!(harness.reboots, 1);
        assert!(!harness.ctx.store.record().trial_active);
    }
}
