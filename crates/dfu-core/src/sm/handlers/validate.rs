//! Validation, image copy and swap handlers.

use tracing::{debug, info, warn};

use super::{HandleResult, transfer};
use crate::partition::{FsValidation, PartitionIo};
use crate::protocol::*;
use crate::sm::context::{CopyState, UpgradeContext};
use crate::sm::event::{AppIndication, Effects, PeerCommand, PeerNotification, UpgradeEvent};
use crate::sm::state::{EndDataStatus, UpgradeState};
use crate::store::{KeyStore, ResumePoint};

/// Erase and copy completions, whatever the state.
pub(super) fn handle_platform<F: PartitionIo, K: KeyStore>(
    ctx: &mut UpgradeContext<F, K>,
    event: &UpgradeEvent,
    out: &mut Effects,
) -> HandleResult {
    match *event {
        UpgradeEvent::EraseStatus { ok } => {
            info!(ok, state = %ctx.state, "Erase finished");
            if ok {
                ctx.blocking_done(out);
            }
            match ctx.state {
                UpgradeState::DataReady => transfer::erase_done_in_data_ready(ctx, ok, out),
                UpgradeState::Commit if ok => ctx.inform_complete(out),
                UpgradeState::Commit => ctx.fatal_error(UpgradeStatus::SqifErase, out),
                _ => ctx.confirm_pending_abort(out),
            }
        }
        UpgradeEvent::CopyStatus { ok } => {
            if ctx.copy != CopyState::Pending {
                debug!(ok, "Stale image copy result");
                return HandleResult::Handled;
            }
            info!(ok, "Image copy finished");
            ctx.copy = CopyState::Done(ok);
            if ok {
                if ctx.delayed_peer_start {
                    ctx.start_peer(out);
                }
                ctx.try_swap(out);
            } else {
                if ctx.peer_start_sent {
                    out.peer(PeerCommand::Abort);
                    ctx.peer_start_sent = false;
                }
                ctx.fatal_error(UpgradeStatus::SqifCopy, out);
                image_copy_failed(ctx);
            }
        }
        UpgradeEvent::AudioDfuFailure => {
            warn!(state = %ctx.state, "Audio image copy failed");
            ctx.blocking_done(out);
            out.indicate(AppIndication::AudioCopyFailure);
            ctx.fatal_error(UpgradeStatus::AudioCopy, out);
            // Same recovery as a failed image copy.
            image_copy_failed(ctx);
        }
        _ => return HandleResult::NotHandled,
    }
    HandleResult::Handled
}

/// VALIDATING - check the written partitions.
pub(super) fn handle_validating<F: PartitionIo, K: KeyStore>(
    ctx: &mut UpgradeContext<F, K>,
    event: &UpgradeEvent,
    out: &mut Effects,
) -> HandleResult {
    match event {
        UpgradeEvent::Continue => match ctx.flash.validate_partitions() {
            FsValidation::InProgress => ctx.goto_state(UpgradeState::WaitForValidate),
            FsValidation::Done(true) => partitions_valid(ctx, out),
            FsValidation::Done(false) => ctx.fatal_error(UpgradeStatus::SfsValidationFailed, out),
        },
        UpgradeEvent::Host(HostMessage::IsValidationDoneReq) => transfer::validation_backoff(ctx, out),
        _ => return HandleResult::NotHandled,
    }
    HandleResult::Handled
}

/// WAIT_FOR_VALIDATE - the platform reports validation asynchronously.
pub(super) fn handle_wait_for_validate<F: PartitionIo, K: KeyStore>(
    ctx: &mut UpgradeContext<F, K>,
    event: &UpgradeEvent,
    out: &mut Effects,
) -> HandleResult {
    match event {
        UpgradeEvent::FsValidationStatus { ok: true } => {
            ctx.goto_state(UpgradeState::Validating);
            partitions_valid(ctx, out);
        }
        UpgradeEvent::FsValidationStatus { ok: false } => {
            ctx.fatal_error(UpgradeStatus::SfsValidationFailed, out);
        }
        UpgradeEvent::Host(HostMessage::IsValidationDoneReq) => transfer::validation_backoff(ctx, out),
        _ => return HandleResult::NotHandled,
    }
    HandleResult::Handled
}

fn partitions_valid<F: PartitionIo, K: KeyStore>(ctx: &mut UpgradeContext<F, K>, out: &mut Effects) {
    info!("Partitions validated");
    ctx.persist(ResumePoint::PreReboot);
    ctx.start_image_copy(out);
    ctx.move_to_state(UpgradeState::Validated, out);
}

/// VALIDATED - hand over to the peer, then wait for the host to allow the reboot.
pub(super) fn handle_validated<F: PartitionIo, K: KeyStore>(
    ctx: &mut UpgradeContext<F, K>,
    event: &UpgradeEvent,
    out: &mut Effects,
) -> HandleResult {
    match event {
        UpgradeEvent::Continue => transfer_complete(ctx, out),
        UpgradeEvent::Host(HostMessage::IsValidationDoneReq) => {
            ctx.validation_done_req = true;
            transfer_complete(ctx, out);
        }
        UpgradeEvent::Host(HostMessage::TransferCompleteRes { action }) => {
            transfer_complete_res(ctx, *action, out);
        }
        UpgradeEvent::Peer(PeerNotification::TransferCompleteRes(action)) => {
            transfer_complete_res(ctx, *action, out);
        }
        UpgradeEvent::Peer(PeerNotification::TransferCompleteInd) => {
            info!("Peer transfer complete");
            out.respond(ShortResponse::TransferCompleteInd);
        }
        UpgradeEvent::Reboot => {
            ctx.swap_requested = true;
            ctx.try_swap(out);
        }
        _ => return HandleResult::NotHandled,
    }
    HandleResult::Handled
}

fn transfer_complete<F: PartitionIo, K: KeyStore>(ctx: &mut UpgradeContext<F, K>, out: &mut Effects) {
    if !ctx.validation_done_req {
        return;
    }
    if !ctx.peer_supported() {
        out.respond(ShortResponse::TransferCompleteInd);
        return;
    }
    if ctx.peer_start_sent || ctx.delayed_peer_start {
        return;
    }
    match ctx.copy {
        CopyState::Done(true) => ctx.start_peer(out),
        CopyState::Done(false) => debug!("Image copy failed, peer not started"),
        CopyState::Pending | CopyState::NotStarted => {
            debug!("Peer start waits for the image copy");
            ctx.delayed_peer_start = true;
        }
    }
}

fn transfer_complete_res<F: PartitionIo, K: KeyStore>(
    ctx: &mut UpgradeContext<F, K>,
    action: Action,
    out: &mut Effects,
) {
    match action {
        Action::Continue if ctx.peer_started() && !ctx.peer.restarted => {
            info!("Forwarding TRANSFER_COMPLETE_RES to the peer");
            out.peer(PeerCommand::TransferCompleteRes(action));
        }
        Action::Continue => {
            ctx.persist(ResumePoint::PostReboot);
            out.indicate(AppIndication::EndDataInd(EndDataStatus::Complete));
            if ctx.have_permission(AppIndication::ApplyInd, out) {
                ctx.swap_requested = true;
                ctx.try_swap(out);
            }
        }
        Action::Abort => {
            info!("Host declined the reboot");
            if ctx.peer_started() {
                out.peer(PeerCommand::TransferCompleteRes(action));
            }
            out.indicate(AppIndication::EndDataInd(EndDataStatus::Abort));
            ctx.swap_requested = false;
            ctx.peer_start_sent = false;
            ctx.goto_state(UpgradeState::Sync);
        }
    }
}

/// Drop the failed copy and return to SYNC. The persisted ERROR point sends
/// the next START_REQ to ABORTING.
fn image_copy_failed<F: PartitionIo, K: KeyStore>(ctx: &mut UpgradeContext<F, K>) {
    ctx.swap_requested = false;
    ctx.copy = CopyState::Done(false);
    ctx.goto_state(UpgradeState::Sync);
}

#[cfg(test)]
mod tests {
    use crate::partition::{FlashEvent, PartitionIo};
    use crate::protocol::*;
    use crate::sm::event::{AppIndication, PeerCommand, PeerNotification, UpgradeEvent};
    use crate::sm::handlers::test_support::{Harness, sample_file};
    use crate::sm::state::{EndDataStatus, Permission, UpgradeState};
    use crate::store::ResumePoint;

    fn validated(permission: Permission) -> Harness {
        let mut harness = Harness::new(permission);
        harness.download(1, &sample_file());
        assert_eq!(harness.ctx.state, UpgradeState::Validated);
        harness
    }

    #[test]
    fn test_validation_done_req_gets_transfer_complete() {
        let mut harness = validated(Permission::AutoApprove);
        harness.host(HostMessage::IsValidationDoneReq);
        assert_eq!(harness.take_responses(), vec![HostResponse::TransferCompleteInd]);
    }

    #[test]
    fn test_transfer_complete_res_reboots() {
        let mut harness = validated(Permission::AutoApprove);
        harness.host(HostMessage::IsValidationDoneReq);
        harness.host(HostMessage::TransferCompleteRes {
            action: Action::Continue,
        });
        assert_eq!(harness.reboots, 1);
        assert_eq!(harness.ctx.resume_point(), ResumePoint::PostReboot);
        assert!(harness.ctx.store.record().trial_active);
        assert!(harness.indications.contains(&AppIndication::EndDataInd(EndDataStatus::Complete)));
    }

    #[test]
    fn test_reboot_waits_for_application() {
        let mut harness = validated(Permission::AskApplication);
        harness.host(HostMessage::TransferCompleteRes {
            action: Action::Continue,
        });
        assert_eq!(harness.reboots, 0);
        assert!(harness.indications.contains(&AppIndication::ApplyInd));

        let later = harness.ctx.apply_response(1000).into_vec();
        harness.apply(later);
        assert_eq!(harness.reboots, 0);

        let now = harness.ctx.apply_response(0).into_vec();
        harness.apply(now);
        assert_eq!(harness.reboots, 1);
    }

    #[test]
    fn test_reboot_waits_for_async_copy() {
        let mut harness = Harness::new(Permission::AutoApprove);
        harness.partitions.set_image_copy(true, true);
        harness.download(1, &sample_file());
        harness.host(HostMessage::TransferCompleteRes {
            action: Action::Continue,
        });
        assert_eq!(harness.reboots, 0);

        let done = harness.ctx.flash.poll_event().map(UpgradeEvent::from).unwrap();
        harness.event(done);
        assert_eq!(harness.reboots, 1);
    }

    #[test]
    fn test_async_validation() {
        let mut harness = Harness::new(Permission::AutoApprove);
        harness.partitions.set_fs_validation(true, true);
        harness.download(1, &sample_file());
        assert_eq!(harness.ctx.state, UpgradeState::WaitForValidate);
        harness.host(HostMessage::IsValidationDoneReq);
        assert_eq!(
            harness.take_responses(),
            vec![HostResponse::IsValidationDoneCfm { backoff_ms: 100 }]
        );

        let done = harness.ctx.flash.poll_event().map(UpgradeEvent::from).unwrap();
        harness.event(done);
        assert_eq!(harness.ctx.state, UpgradeState::Validated);
        assert_eq!(harness.take_responses(), vec![HostResponse::TransferCompleteInd]);
    }

    #[test]
    fn test_failed_validation_is_fatal() {
        let mut harness = Harness::new(Permission::AutoApprove);
        harness.partitions.set_fs_validation(false, false);
        harness.download(1, &sample_file());
        assert_eq!(harness.ctx.state, UpgradeState::Aborting);
        assert!(harness.responses.contains(&HostResponse::ErrorWarnInd {
            code: UpgradeStatus::SfsValidationFailed.code()
        }));
    }

    #[test]
    fn test_copy_failure_is_fatal() {
        let mut harness = Harness::new(Permission::AutoApprove);
        harness.partitions.set_image_copy(false, false);
        harness.download(1, &sample_file());
        assert!(harness.responses.contains(&HostResponse::ErrorWarnInd {
            code: UpgradeStatus::SqifCopy.code()
        }));
        assert_eq!(harness.ctx.state, UpgradeState::Sync);
        assert_eq!(harness.ctx.resume_point(), ResumePoint::Error);
        assert!(harness.indications.contains(&AppIndication::EndDataInd(EndDataStatus::Abort)));

        // The next attempt lands in ABORTING until the host acknowledges.
        harness.host(HostMessage::SyncReq { upgrade_id: 1 });
        harness.host(HostMessage::StartReq);
        assert_eq!(harness.ctx.state, UpgradeState::Aborting);
    }

    #[test]
    fn test_audio_failure_falls_through_to_copy_failure() {
        let mut harness = validated(Permission::AutoApprove);
        harness.take_responses();
        harness.partitions.inject_event(FlashEvent::AudioCopyFailed);
        let event = harness.ctx.flash.poll_event().map(UpgradeEvent::from).unwrap();
        harness.event(event);
        assert!(harness.indications.contains(&AppIndication::AudioCopyFailure));
        assert_eq!(
            harness.take_responses(),
            vec![HostResponse::ErrorWarnInd {
                code: UpgradeStatus::AudioCopy.code()
            }]
        );
        assert_eq!(harness.ctx.state, UpgradeState::Sync);
        assert_eq!(harness.ctx.resume_point(), ResumePoint::Error);

        harness.host(HostMessage::TransferCompleteRes {
            action: Action::Continue,
        });
        assert_eq!(harness.reboots, 0);
    }

    #[test]
    fn test_host_declines_reboot() {
        let mut harness = validated(Permission::AutoApprove);
        harness.host(HostMessage::TransferCompleteRes { action: Action::Abort });
        assert_eq!(harness.ctx.state, UpgradeState::Sync);
        assert_eq!(harness.reboots, 0);
    }

    #[test]
    fn test_peer_started_after_copy() {
        let mut harness = Harness::new(Permission::AutoApprove);
        harness.ctx.settings.peer_enabled = true;
        harness.download(9, &sample_file());
        harness.host(HostMessage::IsValidationDoneReq);
        assert_eq!(harness.peer, vec![PeerCommand::Start { upgrade_id: 9 }]);
        assert!(harness.take_responses().is_empty());

        harness.event(UpgradeEvent::Peer(PeerNotification::TransferCompleteInd));
        assert_eq!(harness.take_responses(), vec![HostResponse::TransferCompleteInd]);

        harness.ctx.peer.started = true;
        harness.host(HostMessage::TransferCompleteRes {
            action: Action::Continue,
        });
        assert_eq!(
            harness.peer.last(),
            Some(&PeerCommand::TransferCompleteRes(Action::Continue))
        );
        assert_eq!(harness.reboots, 0);

        harness.ctx.peer.restarted = true;
        harness.event(UpgradeEvent::Peer(PeerNotification::TransferCompleteRes(Action::Continue)));
        assert_eq!(harness.reboots, 1);
    }
}
