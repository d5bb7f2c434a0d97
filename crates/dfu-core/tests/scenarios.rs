//! End-to-end upgrades through a session, a scripted host and the
//! in-memory flash.

use std::sync::Arc;

use dfu_core::partition::{BlockingFlash, DeferredEraseFlash, MemoryPartitions, PartitionIo};
use dfu_core::protocol::{HostMessage, HostResponse, UpgradeStatus};
use dfu_core::session::{DfuConfig, DfuSession};
use dfu_core::sim::{DevicePair, HostDriver, HostOptions, HostOutcome, run_single};
use dfu_core::sm::{AppIndication, EndDataStatus, Permission, UpgradeState};
use dfu_core::store::{KeyStore, MemoryKeyStore, ResumePoint};
use dfu_core::{DfuEvent, RecordingObserver, UpgradeFileBuilder, UpgradeHeader, Version};

type Session<F> = DfuSession<F, MemoryKeyStore, RecordingObserver>;

fn payloads() -> (Vec<u8>, Vec<u8>) {
    let exe = (0..5000u32).map(|i| (i % 253) as u8).collect();
    let data = vec![0x3C; 1200];
    (exe, data)
}

fn upgrade_file() -> Vec<u8> {
    let (exe, data) = payloads();
    UpgradeFileBuilder::new(UpgradeHeader::new("EARBUD", Version::new(2, 0), 1).with_compatible(Version::new(1, 0)))
        .partition(0, 0xBEEF, exe)
        .partition(1, 0xCAFE, data)
        .build()
}

fn device<F: PartitionIo>(config: &DfuConfig, flash: F, keys: MemoryKeyStore) -> Session<F> {
    let mut session = DfuSession::with_observer(config.clone(), flash, keys, Arc::new(RecordingObserver::new()));
    session.init_from_config();
    session
}

fn blocking_device(config: &DfuConfig) -> (Session<BlockingFlash>, MemoryPartitions, MemoryKeyStore) {
    let partitions = config.memory_partitions();
    let keys = MemoryKeyStore::default();
    let session = device(config, BlockingFlash::new(partitions.clone()), keys.clone());
    (session, partitions, keys)
}

/// `expected` appears in `states` in order, not necessarily adjacent.
fn visits_in_order(states: &[UpgradeState], expected: &[UpgradeState]) -> bool {
    let mut rest = states.iter();
    expected.iter().all(|want| rest.any(|state| state == want))
}

#[test]
fn test_upgrade_completes_and_swaps_banks() {
    let (mut session, partitions, _keys) = blocking_device(&DfuConfig::default());
    let mut host = HostDriver::new(upgrade_file(), HostOptions::default());
    host.connect(&mut session);
    let (session, outcome) = run_single(session, &mut host);

    assert_eq!(outcome, HostOutcome::Complete);
    let states = session.observer().states();
    assert!(visits_in_order(
        &states,
        &[
            UpgradeState::Ready,
            UpgradeState::DataTransfer,
            UpgradeState::Validated,
            UpgradeState::RestartedForCommit,
            UpgradeState::CommitHostContinue,
            UpgradeState::CommitConfirm,
            UpgradeState::Sync,
        ]
    ));

    let (exe, data) = payloads();
    assert_eq!(partitions.contents(1), exe);
    assert_eq!(partitions.contents(3), data);
    assert_eq!(partitions.first_word(1), Some(0xBEEF));
    assert!(partitions.contents(0).is_empty());
    assert_eq!(session.store().record().active_version, Version::new(2, 0));
    assert_eq!(session.resume_point(), ResumePoint::Start);
}

#[test]
fn test_deferred_erase_completes() {
    let config = DfuConfig::default();
    let partitions = config.memory_partitions();
    let mut session = device(&config, DeferredEraseFlash::new(partitions.clone()), MemoryKeyStore::default());
    let mut host = HostDriver::new(upgrade_file(), HostOptions::default());
    host.connect(&mut session);
    let (session, outcome) = run_single(session, &mut host);

    assert_eq!(outcome, HostOutcome::Complete);
    assert_eq!(session.state(), UpgradeState::Sync);
    assert!(!partitions.erase_log().is_empty());
}

#[test]
fn test_resume_after_power_loss_skips_closed_partition() {
    let file = upgrade_file();
    let (exe, _) = payloads();
    let (mut session, partitions, _keys) = blocking_device(&DfuConfig::default());
    let options = HostOptions {
        chunk_size: 128,
        // Past the first partition, inside the second.
        interrupt_at: Some(exe.len() as u64 + 400),
        ..HostOptions::default()
    };
    let mut host = HostDriver::new(file.clone(), options);
    host.connect(&mut session);
    let (session, outcome) = run_single(session, &mut host);
    assert!(matches!(outcome, HostOutcome::Interrupted { .. }));
    let before = host.bytes_sent();

    let mut session = session.reboot();
    assert_eq!(session.store().record().last_closed_partition, 2);
    host.clear_interrupt();
    host.connect(&mut session);
    let (_, outcome) = run_single(session, &mut host);

    assert_eq!(outcome, HostOutcome::Complete);
    // The first partition is not sent again.
    assert!(host.bytes_sent() - before < (file.len() - exe.len()) as u64);
    assert_eq!(partitions.contents(1), exe);
}

#[test]
fn test_different_upgrade_id_is_refused() {
    let (mut session, _partitions, _keys) = blocking_device(&DfuConfig::default());
    let options = HostOptions {
        interrupt_at: Some(1000),
        ..HostOptions::default()
    };
    let mut host = HostDriver::new(upgrade_file(), options);
    host.connect(&mut session);
    let (session, _) = run_single(session, &mut host);

    let mut session = session.reboot();
    let mut other = HostDriver::new(
        upgrade_file(),
        HostOptions {
            upgrade_id: 0x0200_0002,
            ..HostOptions::default()
        },
    );
    other.connect(&mut session);
    let (_, outcome) = run_single(session, &mut other);
    assert_eq!(outcome, HostOutcome::Failed(UpgradeStatus::WarnSyncIdIsDifferent));
}

#[test]
fn test_key_store_exhaustion_floods_and_resumes() {
    let (mut session, partitions, keys) = blocking_device(&DfuConfig::default());
    let (exe, _) = payloads();
    let mut host = HostDriver::new(
        upgrade_file(),
        HostOptions {
            chunk_size: 100,
            ..HostOptions::default()
        },
    );
    host.connect(&mut session);
    for _ in 0..1000 {
        if host.bytes_sent() >= 1000 {
            break;
        }
        assert!(host.pump(&mut session));
    }
    keys.consume(keys.free_words());

    let (_, outcome) = run_single(session, &mut host);
    assert_eq!(outcome, HostOutcome::Complete);
    assert!(keys.flood_count() >= 1);
    assert!(host.responses().contains(&HostResponse::ErrorWarnInd {
        code: UpgradeStatus::PartitionCloseFailedPsSpace.code()
    }));
    assert_eq!(partitions.contents(1), exe);
}

#[test]
fn test_abort_twice_confirms_once() {
    let (mut session, _partitions, _keys) = blocking_device(&DfuConfig::default());
    session.transport_connect(false, false);
    for msg in [HostMessage::SyncReq { upgrade_id: 3 }, HostMessage::StartReq, HostMessage::AbortReq] {
        assert!(session.process_data_request(&msg.encode()));
    }
    session.run_until_idle();
    let responses = session.take_host_responses();
    assert_eq!(responses.last(), Some(&HostResponse::AbortCfm));
    assert!(
        session
            .take_indications()
            .contains(&AppIndication::EndDataInd(EndDataStatus::Abort))
    );

    assert!(session.process_data_request(&HostMessage::AbortReq.encode()));
    session.run_until_idle();
    assert!(session.take_host_responses().is_empty());
    assert_eq!(session.state(), UpgradeState::Sync);
}

#[test]
fn test_battery_low_refuses_data() {
    let (mut session, _partitions, _keys) = blocking_device(&DfuConfig::default());
    let mut host = HostDriver::new(upgrade_file(), HostOptions::default());
    host.connect(&mut session);
    for _ in 0..100 {
        if host.bytes_sent() > 0 {
            break;
        }
        host.pump(&mut session);
    }
    session.battery_state_changed(true);
    assert_eq!(session.state(), UpgradeState::BatteryLow);

    let (_, outcome) = run_single(session, &mut host);
    assert_eq!(outcome, HostOutcome::Failed(UpgradeStatus::BatteryLow));
}

#[test]
fn test_denied_permission_refuses_sync() {
    let config = DfuConfig {
        permission: Permission::Deny,
        ..DfuConfig::default()
    };
    let (mut session, _partitions, _keys) = blocking_device(&config);
    let mut host = HostDriver::new(upgrade_file(), HostOptions::default());
    host.connect(&mut session);
    let (_, outcome) = run_single(session, &mut host);
    assert_eq!(outcome, HostOutcome::Failed(UpgradeStatus::AppNotReady));
}

#[test]
fn test_application_approves_reboot_and_erase() {
    let config = DfuConfig {
        permission: Permission::AskApplication,
        ..DfuConfig::default()
    };
    let (mut session, _partitions, _keys) = blocking_device(&config);
    let mut host = HostDriver::new(upgrade_file(), HostOptions::default());
    host.connect(&mut session);
    let (session, outcome) = run_single(session, &mut host);

    assert_eq!(outcome, HostOutcome::Complete);
    let events = session.observer().events();
    assert!(events.contains(&DfuEvent::Indication(AppIndication::ApplyInd)));
    assert!(events.contains(&DfuEvent::Indication(AppIndication::BlockingInd)));
}

#[test]
fn test_pair_relays_file_to_secondary() {
    let mut config = DfuConfig::default();
    config.peer.enabled = true;
    let (primary, primary_flash, _) = blocking_device(&config);
    let (secondary, secondary_flash, _) = blocking_device(&config);
    let mut pair = DevicePair::new(primary, secondary);
    let mut host = HostDriver::new(upgrade_file(), HostOptions::default());
    host.connect(&mut pair.primary);
    let (pair, outcome) = pair.run(&mut host);

    assert_eq!(outcome, HostOutcome::Complete);
    let (exe, data) = payloads();
    for flash in [&primary_flash, &secondary_flash] {
        assert_eq!(flash.contents(1), exe);
        assert_eq!(flash.contents(3), data);
    }
    assert_eq!(pair.secondary.store().record().active_version, Version::new(2, 0));
    assert!(
        pair.secondary
            .observer()
            .states()
            .contains(&UpgradeState::RestartedForCommit)
    );
    // The host never talks to the secondary directly.
    assert_eq!(host.responses().iter().filter(|r| **r == HostResponse::CompleteInd).count(), 1);
}
