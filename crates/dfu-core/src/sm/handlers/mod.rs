//! State handlers - dispatch logic for each upgrade state.
//!
//! This module is split into submodules by phase:
//! - `sync`: check-status, sync, ready and the default handler
//! - `transfer`: data ready, data transfer and digest checking
//! - `validate`: partition validation, image copy and the swap
//! - `commit`: the post-reboot commit path
//! - `recovery`: aborting, battery low and reboot-to-resume

mod commit;
mod recovery;
mod sync;
mod transfer;
mod validate;

use tracing::debug;

use super::context::UpgradeContext;
use super::event::{Effect, Effects, UpgradeEvent};
use super::state::UpgradeState;
use crate::partition::PartitionIo;
use crate::store::KeyStore;

/// Whether a handler consumed the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleResult {
    Handled,
    /// Let the default handler try.
    NotHandled,
}

/// Run one event through the machine and return what it asks for.
pub fn handle<F: PartitionIo, K: KeyStore>(
    ctx: &mut UpgradeContext<F, K>,
    event: UpgradeEvent,
) -> Vec<Effect> {
    let mut out = Effects::new();
    debug!(state = %ctx.state, event = event.name(), "Handling event");

    // Platform completions matter whatever the state.
    if validate::handle_platform(ctx, &event, &mut out) == HandleResult::Handled {
        return out.into_vec();
    }

    let result = match ctx.state {
        UpgradeState::CheckStatus => sync::handle_check_status(ctx, &event, &mut out),
        UpgradeState::Sync => sync::handle_sync(ctx, &event, &mut out),
        UpgradeState::Ready => sync::handle_ready(ctx, &event, &mut out),
        UpgradeState::Aborting => recovery::handle_aborting(ctx, &event, &mut out),
        UpgradeState::DataReady => transfer::handle_data_ready(ctx, &event, &mut out),
        UpgradeState::DataTransfer => transfer::handle_data_transfer(ctx, &event, &mut out),
        UpgradeState::DataHashChecking => {
            transfer::handle_data_hash_checking(ctx, &event, &mut out)
        }
        UpgradeState::Validating => validate::handle_validating(ctx, &event, &mut out),
        UpgradeState::WaitForValidate => validate::handle_wait_for_validate(ctx, &event, &mut out),
        UpgradeState::Validated => validate::handle_validated(ctx, &event, &mut out),
        UpgradeState::RestartedForCommit => {
            commit::handle_restarted_for_commit(ctx, &event, &mut out)
        }
        UpgradeState::CommitHostContinue => {
            commit::handle_commit_host_continue(ctx, &event, &mut out)
        }
        UpgradeState::CommitVerification => {
            commit::handle_commit_verification(ctx, &event, &mut out)
        }
        UpgradeState::CommitConfirm => commit::handle_commit_confirm(ctx, &event, &mut out),
        UpgradeState::Commit => commit::handle_commit(ctx, &event, &mut out),
        UpgradeState::RebootToResume => recovery::handle_reboot_to_resume(ctx, &event, &mut out),
        UpgradeState::BatteryLow => recovery::handle_battery_low(ctx, &event, &mut out),
    };

    if result == HandleResult::NotHandled {
        let fallback = if ctx.state == UpgradeState::CheckStatus {
            HandleResult::NotHandled
        } else {
            sync::handle_default(ctx, &event, &mut out)
        };
        if fallback == HandleResult::NotHandled {
            debug!(state = %ctx.state, event = event.name(), "Event ignored");
        }
    }
    out.into_vec()
}
