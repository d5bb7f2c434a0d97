//! Data phase handlers: start of data, the transfer itself and the digest check.

use tracing::{debug, info, warn};

use super::HandleResult;
use crate::file::{ParseEnv, ParseOutcome, PartitionDataParser};
use crate::partition::{EraseOutcome, PartitionIo};
use crate::protocol::*;
use crate::sm::context::{CopyState, UpgradeContext};
use crate::sm::event::{AppIndication, Effects, UpgradeEvent};
use crate::sm::state::UpgradeState;
use crate::store::{KeyStore, ResumePoint};

/// DATA_READY - START_DATA_REQ sets up the parser.
pub(super) fn handle_data_ready<F: PartitionIo, K: KeyStore>(
    ctx: &mut UpgradeContext<F, K>,
    event: &UpgradeEvent,
    out: &mut Effects,
) -> HandleResult {
    let UpgradeEvent::Host(HostMessage::StartDataReq) = event else {
        return HandleResult::NotHandled;
    };

    if let Some(stale) = ctx.parser.take() {
        stale.abandon(&mut ctx.flash);
    }
    ctx.parser = Some(PartitionDataParser::new());
    ctx.validator.init();
    out.indicate(AppIndication::StartDataInd);

    if ctx.force_erase {
        match ctx.force_erase_banks() {
            EraseOutcome::Done => debug!("Forced erase finished"),
            EraseOutcome::Pending => {
                info!("Waiting for the forced erase");
                return HandleResult::Handled;
            }
        }
    }
    ctx.request_data(out);
    ctx.goto_state(UpgradeState::DataTransfer);
    HandleResult::Handled
}

/// Completion of a forced erase started from DATA_READY.
pub(super) fn erase_done_in_data_ready<F: PartitionIo, K: KeyStore>(
    ctx: &mut UpgradeContext<F, K>,
    ok: bool,
    out: &mut Effects,
) {
    if ok {
        ctx.request_data(out);
        ctx.goto_state(UpgradeState::DataTransfer);
    } else {
        ctx.fatal_error(UpgradeStatus::SqifErase, out);
    }
}

/// DATA_TRANSFER - feed DATA to the parser and ask for the next range.
pub(super) fn handle_data_transfer<F: PartitionIo, K: KeyStore>(
    ctx: &mut UpgradeContext<F, K>,
    event: &UpgradeEvent,
    out: &mut Effects,
) -> HandleResult {
    let UpgradeEvent::Host(HostMessage::Data { last_packet, bytes }) = event else {
        return HandleResult::NotHandled;
    };

    let Some(parser) = ctx.parser.as_mut() else {
        warn!("DATA without a parser");
        ctx.fatal_error(UpgradeStatus::InternalError3, out);
        return HandleResult::Handled;
    };
    let header_log = if ctx.settings.peer_enabled {
        Some(&mut ctx.header_log)
    } else {
        None
    };
    let mut env = ParseEnv {
        flash: &mut ctx.flash,
        store: &mut ctx.store,
        validator: &mut ctx.validator,
        table: &ctx.table,
        variant: &ctx.variant,
        header_log,
    };

    let result = match parser.parse(bytes, &mut env) {
        Ok(ParseOutcome::Success) if *last_packet => Err(UpgradeStatus::FileTooSmall),
        Ok(ParseOutcome::TransferComplete) if !*last_packet => Err(UpgradeStatus::FileTooBig),
        other => other,
    };

    match result {
        Ok(ParseOutcome::Success) => ctx.request_data(out),
        Ok(ParseOutcome::TransferComplete) => {
            info!("Upgrade file received");
            ctx.persist(ResumePoint::PreValidate);
            ctx.validation_done_req = false;
            ctx.copy = CopyState::NotStarted;
            ctx.move_to_state(UpgradeState::DataHashChecking, out);
        }
        Err(UpgradeStatus::PartitionCloseFailedPsSpace) => ctx.ps_space_error(out),
        Err(status) => ctx.fatal_error(status, out),
    }
    HandleResult::Handled
}

/// DATA_HASH_CHECKING - compare the digest with the footer.
pub(super) fn handle_data_hash_checking<F: PartitionIo, K: KeyStore>(
    ctx: &mut UpgradeContext<F, K>,
    event: &UpgradeEvent,
    out: &mut Effects,
) -> HandleResult {
    match event {
        UpgradeEvent::Continue => {
            let signature = ctx
                .parser
                .as_ref()
                .map(|p| p.signature().to_vec())
                .unwrap_or_default();
            if ctx.validator.finalize(&signature) {
                ctx.parser = None;
                ctx.validator.init();
                ctx.move_to_state(UpgradeState::Validating, out);
            } else {
                ctx.fatal_error(UpgradeStatus::OemValidationFailedFooter, out);
            }
        }
        UpgradeEvent::Host(HostMessage::IsValidationDoneReq) => {
            validation_backoff(ctx, out);
        }
        _ => return HandleResult::NotHandled,
    }
    HandleResult::Handled
}

/// Tell the host to ask again later.
pub(super) fn validation_backoff<F: PartitionIo, K: KeyStore>(
    ctx: &mut UpgradeContext<F, K>,
    out: &mut Effects,
) {
    ctx.validation_done_req = true;
    out.respond(HostResponse::IsValidationDoneCfm {
        backoff_ms: ctx.settings.validation_backoff_ms,
    });
}

#[cfg(test)]
mod tests {
    use crate::protocol::*;
    use crate::sm::event::{AppIndication, UpgradeEvent};
    use crate::sm::handlers::test_support::{Harness, sample_file};
    use crate::sm::state::{EndDataStatus, Permission, UpgradeState};
    use crate::store::{MemoryKeyStore, ResumePoint, ResumeStore};

    fn started() -> Harness {
        let mut harness = Harness::new(Permission::AutoApprove);
        harness.host(HostMessage::SyncReq { upgrade_id: 1 });
        harness.host(HostMessage::StartReq);
        harness.take_responses();
        harness
    }

    #[test]
    fn test_start_data_requests_first_prefix() {
        let mut harness = started();
        harness.host(HostMessage::StartDataReq);
        assert_eq!(
            harness.take_responses(),
            vec![HostResponse::DataBytesReq { count: 12, offset: 0 }]
        );
        assert_eq!(harness.ctx.state, UpgradeState::DataTransfer);
        assert!(harness.indications.contains(&AppIndication::StartDataInd));
    }

    #[test]
    fn test_full_transfer_reaches_validated() {
        let mut harness = started();
        harness.host(HostMessage::StartDataReq);
        harness.send_file(&sample_file());
        assert_eq!(harness.ctx.state, UpgradeState::Validated);
        assert_eq!(harness.ctx.resume_point(), ResumePoint::PreReboot);
        assert_eq!(harness.partitions.contents(1).len(), 900);
        assert_eq!(harness.partitions.contents(3), vec![0x5A; 300]);
    }

    #[test]
    fn test_last_packet_too_early() {
        let mut harness = started();
        harness.host(HostMessage::StartDataReq);
        harness.take_responses();
        let file = sample_file();
        harness.host(HostMessage::Data {
            last_packet: true,
            bytes: file[..12].to_vec(),
        });
        assert_eq!(
            harness.take_responses(),
            vec![HostResponse::ErrorWarnInd {
                code: UpgradeStatus::FileTooSmall.code()
            }]
        );
        assert_eq!(harness.ctx.state, UpgradeState::Aborting);
        assert_eq!(harness.ctx.resume_point(), ResumePoint::Error);
        assert!(harness.indications.contains(&AppIndication::EndDataInd(EndDataStatus::Abort)));
    }

    #[test]
    fn test_corrupt_payload_fails_footer_check() {
        let mut file = sample_file();
        file[200] ^= 0xFF;
        let mut harness = started();
        harness.host(HostMessage::StartDataReq);
        harness.send_file(&file);
        assert_eq!(harness.ctx.state, UpgradeState::Aborting);
        assert!(harness.responses.contains(&HostResponse::ErrorWarnInd {
            code: UpgradeStatus::OemValidationFailedFooter.code()
        }));
    }

    #[test]
    fn test_close_without_key_space_needs_reboot() {
        let keys = MemoryKeyStore::new(4096);
        let mut harness = Harness::with_parts(
            crate::sm::handlers::test_support::layout(),
            keys.clone(),
            Permission::AutoApprove,
        );
        harness.host(HostMessage::SyncReq { upgrade_id: 1 });
        harness.host(HostMessage::StartReq);
        harness.host(HostMessage::StartDataReq);

        let file = sample_file();
        let summary = crate::file::inspect(&file).unwrap();
        let first_partition = &summary.sections[1];
        let first_payload_end = first_partition.offset + 12 + first_partition.length as usize;
        let mut pos = 0;
        while pos < first_payload_end - 1 {
            let request = harness.take_responses().into_iter().find_map(|r| match r {
                HostResponse::DataBytesReq { count, .. } => Some(count as usize),
                _ => None,
            });
            let count = request.unwrap().min(first_payload_end - 1 - pos);
            harness.host(HostMessage::Data {
                last_packet: false,
                bytes: file[pos..pos + count].to_vec(),
            });
            pos += count;
        }
        keys.consume(4096);
        harness.host(HostMessage::Data {
            last_packet: false,
            bytes: file[pos..pos + 1].to_vec(),
        });
        assert!(harness.responses.contains(&HostResponse::ErrorWarnInd { code: 0x42 }));
        assert_eq!(harness.ctx.state, UpgradeState::RebootToResume);
        assert!(ResumeStore::load(keys).record().resume_point < ResumePoint::PreValidate);
    }

    #[test]
    fn test_validation_done_req_while_hashing() {
        let mut harness = started();
        harness.ctx.goto_state(UpgradeState::DataHashChecking);
        harness.event(UpgradeEvent::Host(HostMessage::IsValidationDoneReq));
        assert_eq!(
            harness.take_responses(),
            vec![HostResponse::IsValidationDoneCfm { backoff_ms: 100 }]
        );
    }
}
