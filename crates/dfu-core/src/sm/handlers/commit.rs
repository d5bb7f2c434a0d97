//! Handlers for the path after the reboot into the new image.

use tracing::{debug, info, warn};

use super::HandleResult;
use crate::partition::{AppValidation, EraseOutcome, PartitionIo};
use crate::protocol::*;
use crate::sm::context::UpgradeContext;
use crate::sm::event::{AppIndication, Effects, PeerCommand, PeerNotification, UpgradeEvent};
use crate::sm::state::{ProgressStatus, UpgradeState};
use crate::store::{KeyStore, ResumePoint};

/// RESTARTED_FOR_COMMIT - booted into the new image, waiting for the host.
pub(super) fn handle_restarted_for_commit<F: PartitionIo, K: KeyStore>(
    ctx: &mut UpgradeContext<F, K>,
    event: &UpgradeEvent,
    out: &mut Effects,
) -> HandleResult {
    match event {
        UpgradeEvent::Host(HostMessage::SyncAfterRebootReq) => sync_after_reboot(ctx, true, out),
        UpgradeEvent::Peer(PeerNotification::SyncAfterRebootReq) => sync_after_reboot(ctx, false, out),
        UpgradeEvent::ReconnectionTimeout if ctx.reconnect_armed => reconnection_timeout(ctx, out),
        _ => return HandleResult::NotHandled,
    }
    HandleResult::Handled
}

/// COMMIT_HOST_CONTINUE - IN_PROGRESS_IND sent, waiting for IN_PROGRESS_RES.
pub(super) fn handle_commit_host_continue<F: PartitionIo, K: KeyStore>(
    ctx: &mut UpgradeContext<F, K>,
    event: &UpgradeEvent,
    out: &mut Effects,
) -> HandleResult {
    match event {
        UpgradeEvent::Host(HostMessage::SyncAfterRebootReq) => sync_after_reboot(ctx, true, out),
        UpgradeEvent::Peer(PeerNotification::SyncAfterRebootReq) => sync_after_reboot(ctx, false, out),
        UpgradeEvent::Host(HostMessage::InProgressRes { action }) => {
            ctx.reconnect_armed = false;
            if ctx.peer_started() {
                out.peer(PeerCommand::InProgressRes(*action));
            }
            match action {
                Action::Continue => ctx.move_to_state(UpgradeState::CommitVerification, out),
                Action::Abort => {
                    info!("Host stopped the commit");
                    ctx.move_to_state(UpgradeState::Sync, out);
                }
            }
        }
        UpgradeEvent::ReconnectionTimeout if ctx.reconnect_armed => reconnection_timeout(ctx, out),
        _ => return HandleResult::NotHandled,
    }
    HandleResult::Handled
}

/// Both ends must be back before the host hears IN_PROGRESS_IND.
fn sync_after_reboot<F: PartitionIo, K: KeyStore>(
    ctx: &mut UpgradeContext<F, K>,
    from_host: bool,
    out: &mut Effects,
) {
    if from_host {
        ctx.host_synced_after_reboot = true;
    }
    if ctx.state != UpgradeState::CommitHostContinue {
        ctx.goto_state(UpgradeState::CommitHostContinue);
    }
    let peer_ready = !ctx.peer_started() || ctx.peer.commit_continue;
    if ctx.host_synced_after_reboot && peer_ready {
        out.respond(ShortResponse::InProgressInd);
    } else {
        debug!(
            host = ctx.host_synced_after_reboot,
            peer = peer_ready,
            "Waiting for both sides to sync after reboot"
        );
    }
}

fn reconnection_timeout<F: PartitionIo, K: KeyStore>(ctx: &mut UpgradeContext<F, K>, out: &mut Effects) {
    ctx.reconnect_armed = false;
    if ctx.is_dfu_update() && !ctx.new_image_error() {
        info!("Host did not reconnect, committing the loader update");
        commit_confirm_yes(ctx, out);
        return;
    }
    warn!("Host did not reconnect, reverting");
    if let Err(e) = ctx.store.revert_upgrades() {
        warn!(error = %e, "Revert not saved");
    }
    ctx.persist(ResumePoint::Error);
    ctx.goto_state(UpgradeState::Sync);
    out.reboot();
}

/// COMMIT_VERIFICATION - check the running image before asking to commit.
pub(super) fn handle_commit_verification<F: PartitionIo, K: KeyStore>(
    ctx: &mut UpgradeContext<F, K>,
    event: &UpgradeEvent,
    out: &mut Effects,
) -> HandleResult {
    match event {
        UpgradeEvent::Continue | UpgradeEvent::Peer(PeerNotification::CommitReq) => {
            verify_new_image(ctx, out);
            HandleResult::Handled
        }
        _ => HandleResult::NotHandled,
    }
}

fn verify_new_image<F: PartitionIo, K: KeyStore>(ctx: &mut UpgradeContext<F, K>, out: &mut Effects) {
    if ctx.peer_started() && !ctx.peer.committed {
        debug!("Waiting for the peer commit request");
        return;
    }
    match ctx.flash.validate_application() {
        AppValidation::Running => {
            out.schedule(UpgradeEvent::Continue, u32::from(ctx.settings.validation_backoff_ms));
        }
        AppValidation::Pass => {
            out.respond(ShortResponse::CommitReq);
            ctx.goto_state(UpgradeState::CommitConfirm);
        }
        AppValidation::Skip if ctx.new_image_error() => {
            ctx.fatal_error(UpgradeStatus::LoaderError, out);
        }
        AppValidation::Skip if ctx.is_dfu_update() => {
            ctx.move_to_state(UpgradeState::CommitConfirm, out);
        }
        AppValidation::Skip => {
            out.respond(ShortResponse::CommitReq);
            ctx.goto_state(UpgradeState::CommitConfirm);
        }
    }
}

/// COMMIT_CONFIRM - COMMIT_REQ sent, waiting for COMMIT_CFM.
pub(super) fn handle_commit_confirm<F: PartitionIo, K: KeyStore>(
    ctx: &mut UpgradeContext<F, K>,
    event: &UpgradeEvent,
    out: &mut Effects,
) -> HandleResult {
    match event {
        UpgradeEvent::Host(HostMessage::CommitCfm { action }) => {
            if ctx.peer_started() {
                out.peer(PeerCommand::CommitCfm(*action));
            }
            match action {
                Action::Continue => commit_confirm_yes(ctx, out),
                Action::Abort => {
                    info!("Host refused the commit, reverting");
                    if let Err(e) = ctx.store.revert_upgrades() {
                        warn!(error = %e, "Revert not saved");
                    }
                    ctx.persist(ResumePoint::PreReboot);
                    ctx.goto_state(UpgradeState::Sync);
                    out.reboot();
                }
            }
        }
        UpgradeEvent::Continue => commit_confirm_yes(ctx, out),
        _ => return HandleResult::NotHandled,
    }
    HandleResult::Handled
}

fn commit_confirm_yes<F: PartitionIo, K: KeyStore>(ctx: &mut UpgradeContext<F, K>, out: &mut Effects) {
    ctx.persist(ResumePoint::Commit);
    if let Err(e) = ctx.store.commit_upgrades(&ctx.table) {
        warn!(error = %e, "Commit not saved");
    }
    out.indicate(AppIndication::StatusInd(ProgressStatus::Committing));
    ctx.move_to_state(UpgradeState::Commit, out);
}

/// COMMIT - make the new version current and clean the old banks.
pub(super) fn handle_commit<F: PartitionIo, K: KeyStore>(
    ctx: &mut UpgradeContext<F, K>,
    event: &UpgradeEvent,
    out: &mut Effects,
) -> HandleResult {
    match event {
        UpgradeEvent::Continue => {
            ctx.persist(ResumePoint::Erase);
            let record = ctx.store.record_mut();
            record.active_version = record.in_progress_version;
            record.active_config_version = record.in_progress_config_version;
            ctx.save();
            if ctx.have_permission(AppIndication::BlockingInd, out) {
                erase_when_peer_done(ctx, out);
            }
        }
        UpgradeEvent::Erase | UpgradeEvent::PeerPoll => erase_when_peer_done(ctx, out),
        UpgradeEvent::Host(HostMessage::AbortReq) => debug!("ABORT_REQ ignored while committing"),
        _ => return HandleResult::NotHandled,
    }
    HandleResult::Handled
}

fn erase_when_peer_done<F: PartitionIo, K: KeyStore>(ctx: &mut UpgradeContext<F, K>, out: &mut Effects) {
    if ctx.peer_started() {
        debug!("Peer still upgrading, polling again");
        out.schedule(UpgradeEvent::PeerPoll, ctx.settings.peer_poll_interval_ms);
        return;
    }
    match ctx.erase(out) {
        EraseOutcome::Done => ctx.inform_complete(out),
        EraseOutcome::Pending => debug!("Waiting for the old banks to erase"),
    }
}

#[cfg(test)]
mod tests {
    use crate::file::Version;
    use crate::partition::AppValidation;
    use crate::protocol::*;
    use crate::sm::event::{AppIndication, PeerCommand, PeerNotification, UpgradeEvent};
    use crate::sm::handlers::test_support::{Harness, sample_file};
    use crate::sm::state::{Permission, ProgressStatus, UpgradeState};
    use crate::store::{ResumePoint, ResumeStore};

    /// Download, reboot, and come back up on a fresh context over the same storage.
    fn rebooted(permission: Permission, peer: bool) -> Harness {
        let mut first = Harness::new(Permission::AutoApprove);
        first.ctx.settings.peer_enabled = peer;
        first.download(5, &sample_file());
        first.ctx.peer.started = peer;
        first.ctx.peer.restarted = peer;
        first.host(HostMessage::IsValidationDoneReq);
        first.host(HostMessage::TransferCompleteRes {
            action: Action::Continue,
        });
        assert_eq!(first.reboots, 1);

        let mut harness = Harness::with_parts(first.partitions.clone(), first.keys.clone(), permission);
        harness.ctx.settings.peer_enabled = peer;
        harness
    }

    #[test]
    fn test_boot_after_swap_waits_for_host() {
        let harness = rebooted(Permission::AutoApprove, false);
        assert_eq!(harness.ctx.state, UpgradeState::RestartedForCommit);
        assert!(harness.scheduled.contains(&(UpgradeEvent::ReconnectionTimeout, 60_000)));
    }

    #[test]
    fn test_commit_happy_path() {
        let mut harness = rebooted(Permission::AutoApprove, false);
        harness.host(HostMessage::SyncAfterRebootReq);
        assert_eq!(harness.take_responses(), vec![HostResponse::InProgressInd]);
        assert_eq!(harness.ctx.state, UpgradeState::CommitHostContinue);

        harness.host(HostMessage::InProgressRes {
            action: Action::Continue,
        });
        assert_eq!(harness.take_responses(), vec![HostResponse::CommitReq]);
        assert_eq!(harness.ctx.state, UpgradeState::CommitConfirm);

        harness.host(HostMessage::CommitCfm {
            action: Action::Continue,
        });
        assert_eq!(harness.take_responses(), vec![HostResponse::CompleteInd]);
        assert_eq!(harness.ctx.state, UpgradeState::Sync);
        assert!(harness.indications.contains(&AppIndication::StatusInd(ProgressStatus::Committing)));
        assert!(harness.indications.contains(&AppIndication::StatusInd(ProgressStatus::Done)));

        let store = ResumeStore::load(harness.keys.clone());
        assert_eq!(store.record().active_version, Version::new(2, 0));
        assert_eq!(store.record().resume_point, ResumePoint::Start);
        assert!(!store.record().trial_active);
    }

    #[test]
    fn test_sync_then_start_after_reboot() {
        let mut harness = rebooted(Permission::AutoApprove, false);
        harness.host(HostMessage::SyncReq { upgrade_id: 5 });
        assert_eq!(
            harness.take_responses(),
            vec![HostResponse::SyncCfm {
                resume_point: ResumePoint::PostReboot,
                upgrade_id: 5,
                protocol_version: PROTOCOL_VERSION,
            }]
        );
        harness.host(HostMessage::StartReq);
        assert_eq!(harness.ctx.state, UpgradeState::CommitHostContinue);
        harness.take_responses();
        harness.host(HostMessage::SyncAfterRebootReq);
        assert_eq!(harness.take_responses(), vec![HostResponse::InProgressInd]);
    }

    #[test]
    fn test_commit_refused_reverts() {
        let mut harness = rebooted(Permission::AutoApprove, false);
        harness.host(HostMessage::SyncAfterRebootReq);
        harness.host(HostMessage::InProgressRes {
            action: Action::Continue,
        });
        harness.host(HostMessage::CommitCfm { action: Action::Abort });
        assert_eq!(harness.reboots, 1);
        assert_eq!(harness.ctx.state, UpgradeState::Sync);
        assert_eq!(harness.ctx.resume_point(), ResumePoint::PreReboot);
        assert!(!harness.ctx.store.record().trial_active);
    }

    #[test]
    fn test_reconnection_timeout_reverts() {
        let mut harness = rebooted(Permission::AutoApprove, false);
        harness.event(UpgradeEvent::ReconnectionTimeout);
        assert_eq!(harness.reboots, 1);
        assert_eq!(harness.ctx.resume_point(), ResumePoint::Error);

        harness.event(UpgradeEvent::ReconnectionTimeout);
        assert_eq!(harness.reboots, 1);
    }

    #[test]
    fn test_running_validation_polls() {
        let mut harness = rebooted(Permission::AutoApprove, false);
        harness.partitions.push_app_validation(AppValidation::Running);
        harness.host(HostMessage::SyncAfterRebootReq);
        harness.host(HostMessage::InProgressRes {
            action: Action::Continue,
        });
        assert_eq!(harness.ctx.state, UpgradeState::CommitVerification);
        assert!(harness.scheduled.contains(&(UpgradeEvent::Continue, 100)));

        harness.event(UpgradeEvent::Continue);
        assert_eq!(harness.ctx.state, UpgradeState::CommitConfirm);
    }

    #[test]
    fn test_skip_without_trial_is_loader_error() {
        let mut harness = rebooted(Permission::AutoApprove, false);
        harness.ctx.store.record_mut().trial_active = false;
        harness.partitions.push_app_validation(AppValidation::Skip);
        harness.host(HostMessage::SyncAfterRebootReq);
        harness.host(HostMessage::InProgressRes {
            action: Action::Continue,
        });
        assert_eq!(harness.ctx.state, UpgradeState::Aborting);
        assert!(harness.responses.contains(&HostResponse::ErrorWarnInd {
            code: UpgradeStatus::LoaderError.code()
        }));
    }

    #[test]
    fn test_commit_ignores_abort_and_waits_for_erase_permission() {
        let mut harness = rebooted(Permission::AskApplication, false);
        harness.host(HostMessage::SyncAfterRebootReq);
        harness.host(HostMessage::InProgressRes {
            action: Action::Continue,
        });
        harness.host(HostMessage::CommitCfm {
            action: Action::Continue,
        });
        assert_eq!(harness.ctx.state, UpgradeState::Commit);
        assert!(harness.indications.contains(&AppIndication::BlockingInd));
        harness.take_responses();

        harness.host(HostMessage::AbortReq);
        assert!(harness.take_responses().is_empty());
        assert_eq!(harness.ctx.state, UpgradeState::Commit);

        let granted = harness.ctx.blocking_response(0).into_vec();
        harness.apply(granted);
        assert_eq!(harness.take_responses(), vec![HostResponse::CompleteInd]);
        assert_eq!(harness.ctx.store.record().active_version, Version::new(2, 0));
    }

    #[test]
    fn test_peer_commit_sequence() {
        let mut harness = rebooted(Permission::AutoApprove, true);
        harness.ctx.peer.started = true;

        harness.host(HostMessage::SyncAfterRebootReq);
        assert!(harness.take_responses().is_empty());
        harness.ctx.peer.commit_continue = true;
        harness.event(UpgradeEvent::Peer(PeerNotification::SyncAfterRebootReq));
        assert_eq!(harness.take_responses(), vec![HostResponse::InProgressInd]);

        harness.host(HostMessage::InProgressRes {
            action: Action::Continue,
        });
        assert_eq!(harness.peer, vec![PeerCommand::InProgressRes(Action::Continue)]);
        assert_eq!(harness.ctx.state, UpgradeState::CommitVerification);
        assert!(harness.take_responses().is_empty());

        harness.ctx.peer.committed = true;
        harness.event(UpgradeEvent::Peer(PeerNotification::CommitReq));
        assert_eq!(harness.take_responses(), vec![HostResponse::CommitReq]);

        harness.host(HostMessage::CommitCfm {
            action: Action::Continue,
        });
        assert_eq!(harness.peer.last(), Some(&PeerCommand::CommitCfm(Action::Continue)));
        assert!(harness.scheduled.contains(&(UpgradeEvent::PeerPoll, 500)));
        assert!(harness.take_responses().is_empty());

        harness.ctx.peer.started = false;
        harness.event(UpgradeEvent::PeerPoll);
        assert_eq!(harness.take_responses(), vec![HostResponse::CompleteInd]);
    }
}
