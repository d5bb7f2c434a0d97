//! Error, battery and key-store recovery handlers.

use tracing::{debug, info, warn};

use super::HandleResult;
use crate::partition::PartitionIo;
use crate::protocol::*;
use crate::sm::context::UpgradeContext;
use crate::sm::event::{AppIndication, Effects, PeerCommand, UpgradeEvent};
use crate::sm::state::{DeviceRole, UpgradeState};
use crate::store::KeyStore;

/// ABORTING - an error was reported, waiting for the host to acknowledge it.
pub(super) fn handle_aborting<F: PartitionIo, K: KeyStore>(
    ctx: &mut UpgradeContext<F, K>,
    event: &UpgradeEvent,
    out: &mut Effects,
) -> HandleResult {
    let UpgradeEvent::Host(msg) = event else {
        return HandleResult::NotHandled;
    };
    match msg {
        HostMessage::ErrorWarnRes { code } => {
            info!(code, "Error acknowledged");
            if ctx.role == DeviceRole::Primary && ctx.peer_started() {
                out.peer(PeerCommand::ErrorWarnRes(*code));
            }
            ctx.abort(out);
            out.indicate(AppIndication::CleanupOnAbort);
        }
        HostMessage::AbortReq if ctx.abort_pending => debug!("Abort already pending"),
        HostMessage::AbortReq => ctx.abort(out),
        HostMessage::SyncReq { .. } => out.error(UpgradeStatus::InErrorState),
        _ => return HandleResult::NotHandled,
    }
    HandleResult::Handled
}

/// BATTERY_LOW - refuse host traffic until the battery recovers.
pub(super) fn handle_battery_low<F: PartitionIo, K: KeyStore>(
    ctx: &mut UpgradeContext<F, K>,
    event: &UpgradeEvent,
    out: &mut Effects,
) -> HandleResult {
    if !ctx.battery_low {
        return HandleResult::NotHandled;
    }
    let UpgradeEvent::Host(msg) = event else {
        return HandleResult::NotHandled;
    };
    match msg {
        HostMessage::ErrorWarnRes { .. } => {}
        // A burst of DATA gets a single error.
        HostMessage::Data { .. } if ctx.battery_error_sent => {}
        HostMessage::Data { .. } => {
            if let Some(parser) = ctx.parser.take() {
                parser.abandon(&mut ctx.flash);
            }
            ctx.battery_error_sent = true;
            out.error(UpgradeStatus::BatteryLow);
        }
        _ => out.error(UpgradeStatus::BatteryLow),
    }
    HandleResult::Handled
}

/// REBOOT_TO_RESUME - the key store is full; flood it and reboot once allowed.
pub(super) fn handle_reboot_to_resume<F: PartitionIo, K: KeyStore>(
    ctx: &mut UpgradeContext<F, K>,
    event: &UpgradeEvent,
    out: &mut Effects,
) -> HandleResult {
    match event {
        UpgradeEvent::Host(HostMessage::ErrorWarnRes { code })
            if *code == UpgradeStatus::PartitionCloseFailedPsSpace.code() =>
        {
            if ctx.have_permission(AppIndication::ApplyInd, out) {
                flood_and_reboot(ctx, out);
            }
        }
        UpgradeEvent::Reboot => flood_and_reboot(ctx, out),
        UpgradeEvent::Host(HostMessage::SyncReq { .. } | HostMessage::StartReq | HostMessage::AbortReq) => {
            out.error(UpgradeStatus::PartitionCloseFailedPsSpace);
        }
        _ => return HandleResult::NotHandled,
    }
    HandleResult::Handled
}

fn flood_and_reboot<F: PartitionIo, K: KeyStore>(ctx: &mut UpgradeContext<F, K>, out: &mut Effects) {
    info!("Flooding the key store and rebooting");
    ctx.store.flood();
    out.reboot();
}

/// The peer relay reported a failure on the secondary.
pub(super) fn peer_error<F: PartitionIo, K: KeyStore>(
    ctx: &mut UpgradeContext<F, K>,
    status: UpgradeStatus,
    out: &mut Effects,
) {
    if ctx.state == UpgradeState::Aborting {
        debug!(code = ?status, "Peer error while already aborting");
        return;
    }
    warn!(code = ?status, "Peer upgrade failed");
    ctx.peer_start_sent = false;
    ctx.fatal_error(status, out);
}

/// The relay stopped on its own.
pub(super) fn peer_aborted<F: PartitionIo, K: KeyStore>(ctx: &mut UpgradeContext<F, K>, out: &mut Effects) {
    ctx.peer_start_sent = false;
    match ctx.state {
        UpgradeState::CheckStatus | UpgradeState::Sync | UpgradeState::Aborting => {
            debug!(state = %ctx.state, "Peer relay stopped");
        }
        _ => ctx.fatal_error(UpgradeStatus::UpdateFailed, out),
    }
}
