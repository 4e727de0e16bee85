// Licensed under the Apache-2.0 license

#[cfg(test)]
mod common;

use common::{
    image, init_logger, test_config, Device, MemorySource, RecordingDelay, SLOT_SIZE,
};
use ota_config::boot::{BootConfig, PartitionId, RollbackState};
use ota_config::{FailurePolicy, UpdateConfig};
use ota_config_emulator::flash::{PartitionInfo, PartitionKind, SECTOR_SIZE};
use ota_config_emulator::FlashLayout;
use ota_image::{FirmwareVersion, ImageError, MIN_HEADER_LEN};
use ota_lib::error::{FailureCategory, OtaError, TransferError};
use ota_lib::fetch::FetchError;
use ota_lib::orchestrator::{Exit, Step, UpdateOrchestrator};
use ota_lib::system::{RestartLatch, RestartReason, SystemControl};
use std::sync::atomic::Ordering;
use std::time::Duration;

fn assert_unchanged(device: &Device) {
    let cfg = device.boot_cfg();
    assert_eq!(cfg.get_boot_partition(), Ok(PartitionId::A));
    assert_eq!(
        cfg.get_partition_state(PartitionId::A),
        Ok(RollbackState::Valid)
    );
    assert_ne!(
        cfg.get_partition_state(PartitionId::B),
        Ok(RollbackState::Fresh)
    );
}

fn retry(step: Step) -> (Duration, OtaError) {
    match step {
        Step::Retry { delay, error } => (delay, error),
        other => panic!("expected a retry, got {:?}", other),
    }
}

#[test]
fn new_version_is_written_activated_and_restarted_once() {
    init_logger();
    let device = Device::new();
    device.provision("1.0.0");
    let offered = image("2.0.0");

    let directory = device.directory(PartitionId::A);
    let latch = RestartLatch::new();
    let delay = RecordingDelay::default();
    let mut orchestrator = UpdateOrchestrator::new(
        MemorySource::new(offered.clone()),
        &directory,
        &latch,
        &delay,
        test_config(),
    );

    assert!(matches!(
        orchestrator.run(),
        Exit::Restart(RestartReason::UpdateActivated)
    ));
    assert_eq!(latch.requests(), vec![RestartReason::UpdateActivated]);
    assert_eq!(orchestrator.attempts(), 1);

    let activation = orchestrator.activation().unwrap();
    assert_eq!(activation.partition, PartitionId::B);
    assert_eq!(activation.version, FirmwareVersion::new("2.0.0"));
    assert_eq!(activation.bytes_written, offered.len());

    assert_eq!(device.slot_bytes(PartitionId::B, offered.len()), offered);
    let cfg = device.boot_cfg();
    assert_eq!(cfg.get_boot_partition(), Ok(PartitionId::B));
    assert_eq!(cfg.get_fallback_partition(), Ok(PartitionId::A));
    assert_eq!(
        cfg.get_partition_state(PartitionId::B),
        Ok(RollbackState::Fresh)
    );
    // The running image is left alone.
    assert_eq!(device.slot_version(PartitionId::A), Some(FirmwareVersion::new("1.0.0")));
}

#[test]
fn body_without_declared_length_ends_on_transport_marker() {
    init_logger();
    let device = Device::new();
    device.provision("1.0.0");
    let directory = device.directory(PartitionId::A);
    let latch = RestartLatch::new();
    let delay = RecordingDelay::default();
    let mut orchestrator = UpdateOrchestrator::new(
        MemorySource::new(image("2.0.0")).without_length(),
        &directory,
        &latch,
        &delay,
        test_config(),
    );

    assert!(matches!(orchestrator.step(), Step::Exit(Exit::Restart(_))));
    assert_eq!(
        device.slot_version(PartitionId::B),
        Some(FirmwareVersion::new("2.0.0"))
    );
}

#[test]
fn known_bad_version_is_refused_even_without_version_check() {
    init_logger();
    let device = Device::new();
    device.provision("0.9.0");
    device.install(PartitionId::B, &image("1.0.0"));
    let cfg = device.boot_cfg();
    cfg.activate_partition(PartitionId::B, PartitionId::A).unwrap();
    cfg.reject_partition(PartitionId::B, FirmwareVersion::new("1.0.0").as_bytes())
        .unwrap();

    let directory = device.directory(PartitionId::A);
    let latch = RestartLatch::new();
    let delay = RecordingDelay::default();
    let config = UpdateConfig {
        version_check_enabled: false,
        policy_retry_interval_secs: Some(60),
        ..test_config()
    };
    let mut orchestrator = UpdateOrchestrator::new(
        MemorySource::new(image("1.0.0")),
        &directory,
        &latch,
        &delay,
        config,
    );

    let (delay, error) = retry(orchestrator.step());
    assert_eq!(delay, Duration::from_secs(60));
    assert!(matches!(error, OtaError::KnownBadVersion(v) if v == FirmwareVersion::new("1.0.0")));
    assert!(latch.requests().is_empty());
    assert_eq!(cfg.get_boot_partition(), Ok(PartitionId::A));
    assert_eq!(
        cfg.get_partition_state(PartitionId::B),
        Ok(RollbackState::Invalid)
    );
}

#[test]
fn running_version_is_skipped_and_retried_later() {
    init_logger();
    let device = Device::new();
    device.provision("1.0.0");
    let directory = device.directory(PartitionId::A);
    let latch = RestartLatch::new();
    let delay = RecordingDelay::default();
    let mut orchestrator = UpdateOrchestrator::new(
        MemorySource::new(image("1.0.0")),
        &directory,
        &latch,
        &delay,
        test_config(),
    );

    let (delay, error) = retry(orchestrator.step());
    assert_eq!(delay, Duration::from_secs(10));
    assert_eq!(error.category(), FailureCategory::UpToDate);
    // Nothing was written to the update slot.
    assert_eq!(device.slot_version(PartitionId::B), None);
    assert_unchanged(&device);
}

#[test]
fn running_version_is_installed_when_version_check_is_off() {
    init_logger();
    let device = Device::new();
    device.provision("1.0.0");
    let directory = device.directory(PartitionId::A);
    let latch = RestartLatch::new();
    let delay = RecordingDelay::default();
    let config = UpdateConfig {
        version_check_enabled: false,
        ..test_config()
    };
    let mut orchestrator = UpdateOrchestrator::new(
        MemorySource::new(image("1.0.0")),
        &directory,
        &latch,
        &delay,
        config,
    );

    assert!(matches!(orchestrator.step(), Step::Exit(Exit::Restart(_))));
    assert_eq!(device.boot_cfg().get_boot_partition(), Ok(PartitionId::B));
}

#[test]
fn reset_before_declared_length_never_switches_boot() {
    init_logger();
    let device = Device::new();
    device.provision("1.0.0");
    let directory = device.directory(PartitionId::A);
    let latch = RestartLatch::new();
    let delay = RecordingDelay::default();
    let offered = image("2.0.0");
    let declared = offered.len() as u64;
    let mut orchestrator = UpdateOrchestrator::new(
        MemorySource::new(offered).truncate_at(2048),
        &directory,
        &latch,
        &delay,
        test_config(),
    );

    let (_, error) = retry(orchestrator.step());
    assert!(matches!(
        error,
        OtaError::MalformedTransfer(TransferError::Truncated { received: 2048, expected: Some(d) })
            if d == declared
    ));
    assert!(latch.requests().is_empty());
    assert_unchanged(&device);
}

#[test]
fn transport_error_mid_body_is_a_truncated_transfer() {
    init_logger();
    let device = Device::new();
    device.provision("1.0.0");
    let directory = device.directory(PartitionId::A);
    let latch = RestartLatch::new();
    let delay = RecordingDelay::default();
    let config = UpdateConfig {
        failure_policy: FailurePolicy {
            fatal_on_bad_transfer: true,
            ..FailurePolicy::retry_forever()
        },
        ..test_config()
    };
    let mut orchestrator = UpdateOrchestrator::new(
        MemorySource::new(image("2.0.0")).body_error_at(2000),
        &directory,
        &latch,
        &delay,
        config,
    );

    match orchestrator.step() {
        Step::Exit(Exit::Halted(err)) => {
            assert_eq!(err.category(), FailureCategory::MalformedTransfer);
            assert!(matches!(
                err,
                OtaError::MalformedTransfer(TransferError::Truncated { received: 2000, .. })
            ));
        }
        other => panic!("expected a halt, got {:?}", other),
    }
    assert!(latch.requests().is_empty());
    assert_unchanged(&device);
}

#[test]
fn first_chunk_shorter_than_header_is_malformed() {
    init_logger();
    let device = Device::new();
    device.provision("1.0.0");
    let directory = device.directory(PartitionId::A);
    let latch = RestartLatch::new();
    let delay = RecordingDelay::default();
    let mut orchestrator = UpdateOrchestrator::new(
        MemorySource::new(image("2.0.0")).chunk(100),
        &directory,
        &latch,
        &delay,
        test_config(),
    );

    let (_, error) = retry(orchestrator.step());
    assert!(matches!(
        error,
        OtaError::MalformedTransfer(TransferError::ShortFirstChunk { len: 100, min })
            if min == MIN_HEADER_LEN
    ));
    assert_unchanged(&device);
}

#[test]
fn garbage_header_is_malformed() {
    init_logger();
    let device = Device::new();
    device.provision("1.0.0");
    let directory = device.directory(PartitionId::A);
    let latch = RestartLatch::new();
    let delay = RecordingDelay::default();
    let mut orchestrator = UpdateOrchestrator::new(
        MemorySource::new(vec![0x42; 4096]),
        &directory,
        &latch,
        &delay,
        test_config(),
    );

    let (_, error) = retry(orchestrator.step());
    assert!(matches!(
        error,
        OtaError::MalformedTransfer(TransferError::Header(_))
    ));
}

#[test]
fn unreachable_source_is_retried() {
    init_logger();
    let device = Device::new();
    device.provision("1.0.0");
    let directory = device.directory(PartitionId::A);
    let latch = RestartLatch::new();
    let delay = RecordingDelay::default();
    let source = MemorySource::new(image("2.0.0")).failing_connects(2);
    let connects = source.connects();
    let mut orchestrator =
        UpdateOrchestrator::new(source, &directory, &latch, &delay, test_config());

    assert!(matches!(
        orchestrator.run(),
        Exit::Restart(RestartReason::UpdateActivated)
    ));
    assert_eq!(connects.load(Ordering::SeqCst), 3);
    assert_eq!(orchestrator.attempts(), 3);
    assert_eq!(
        delay.delays(),
        vec![Duration::from_secs(10), Duration::from_secs(10)]
    );
}

#[test]
fn fail_fast_policy_halts_on_bad_transfer() {
    init_logger();
    let device = Device::new();
    device.provision("1.0.0");
    let directory = device.directory(PartitionId::A);
    let latch = RestartLatch::new();
    let delay = RecordingDelay::default();
    let config = UpdateConfig {
        failure_policy: FailurePolicy::fail_fast(),
        ..test_config()
    };
    let mut orchestrator = UpdateOrchestrator::new(
        MemorySource::new(image("2.0.0")).truncate_at(1024),
        &directory,
        &latch,
        &delay,
        config,
    );

    assert!(matches!(
        orchestrator.run(),
        Exit::Halted(OtaError::MalformedTransfer(_))
    ));
    assert!(latch.requests().is_empty());
    assert!(delay.delays().is_empty());
}

#[test]
fn fail_fast_policy_still_retries_policy_outcomes() {
    init_logger();
    let device = Device::new();
    device.provision("1.0.0");
    let directory = device.directory(PartitionId::A);
    let latch = RestartLatch::new();
    let delay = RecordingDelay::default();
    let config = UpdateConfig {
        failure_policy: FailurePolicy::fail_fast(),
        ..test_config()
    };
    let mut orchestrator = UpdateOrchestrator::new(
        MemorySource::new(image("1.0.0")),
        &directory,
        &latch,
        &delay,
        config,
    );

    let (_, error) = retry(orchestrator.step());
    assert!(matches!(error, OtaError::UpToDate(_)));
}

#[test]
fn layout_without_update_slot_halts() {
    init_logger();
    let mut layout = common::test_layout();
    layout.partitions.retain(|p| p.id != PartitionId::B);
    let device = Device::with_layout(layout);
    device.provision("1.0.0");
    let directory = device.directory(PartitionId::A);
    let latch = RestartLatch::new();
    let delay = RecordingDelay::default();
    let source = MemorySource::new(image("2.0.0"));
    let connects = source.connects();
    let mut orchestrator =
        UpdateOrchestrator::new(source, &directory, &latch, &delay, test_config());

    assert!(matches!(
        orchestrator.run(),
        Exit::Halted(OtaError::InconsistentLayout(_))
    ));
    assert_eq!(connects.load(Ordering::SeqCst), 0);
}

#[test]
fn update_slot_overlapping_running_slot_halts() {
    init_logger();
    let overlapping = FlashLayout::new(vec![
        PartitionInfo {
            name: "otadata",
            id: PartitionId::None,
            kind: PartitionKind::BootData,
            offset: 0,
            size: 2 * SECTOR_SIZE,
        },
        PartitionInfo {
            name: "ota_0",
            id: PartitionId::A,
            kind: PartitionKind::App,
            offset: 2 * SECTOR_SIZE,
            size: SLOT_SIZE,
        },
        PartitionInfo {
            name: "ota_1",
            id: PartitionId::B,
            kind: PartitionKind::App,
            offset: 2 * SECTOR_SIZE + SLOT_SIZE / 2,
            size: SLOT_SIZE,
        },
    ]);
    let device = Device::with_layout(overlapping);
    device.provision("1.0.0");
    let directory = device.directory(PartitionId::A);
    let latch = RestartLatch::new();
    let delay = RecordingDelay::default();
    let mut orchestrator = UpdateOrchestrator::new(
        MemorySource::new(image("2.0.0")),
        &directory,
        &latch,
        &delay,
        test_config(),
    );

    assert!(matches!(
        orchestrator.step(),
        Step::Exit(Exit::Halted(OtaError::InconsistentLayout(_)))
    ));
}

#[test]
fn empty_reads_are_polled_until_data_arrives() {
    init_logger();
    let device = Device::new();
    device.provision("1.0.0");
    let directory = device.directory(PartitionId::A);
    let latch = RestartLatch::new();
    let delay = RecordingDelay::default();
    let mut orchestrator = UpdateOrchestrator::new(
        MemorySource::new(image("2.0.0")).pending_polls(3),
        &directory,
        &latch,
        &delay,
        test_config(),
    );

    assert!(matches!(orchestrator.step(), Step::Exit(Exit::Restart(_))));
    assert_eq!(delay.delays(), vec![Duration::from_millis(1); 3]);
}

#[test]
fn silent_source_times_out_as_truncated() {
    init_logger();
    let device = Device::new();
    device.provision("1.0.0");
    let directory = device.directory(PartitionId::A);
    let latch = RestartLatch::new();
    let delay = RecordingDelay::default();
    let mut orchestrator = UpdateOrchestrator::new(
        MemorySource::new(image("2.0.0")).pending_polls(1000),
        &directory,
        &latch,
        &delay,
        test_config(),
    );

    let (_, error) = retry(orchestrator.step());
    assert!(matches!(
        error,
        OtaError::MalformedTransfer(TransferError::Truncated { received: 0, .. })
    ));
    // recv_timeout_ms / poll_interval_ms polls were waited out.
    assert_eq!(delay.delays().len(), 20);
}

#[test]
fn corrupted_image_fails_validation() {
    init_logger();
    let device = Device::new();
    device.provision("1.0.0");
    let mut offered = image("2.0.0");
    offered[MIN_HEADER_LEN + 100] ^= 0xFF;

    let directory = device.directory(PartitionId::A);
    let latch = RestartLatch::new();
    let delay = RecordingDelay::default();
    let mut orchestrator = UpdateOrchestrator::new(
        MemorySource::new(offered),
        &directory,
        &latch,
        &delay,
        test_config(),
    );

    let (_, error) = retry(orchestrator.step());
    assert!(matches!(
        error,
        OtaError::Validation(ImageError::Checksum { .. })
    ));
    assert_unchanged(&device);
}

#[test]
fn write_failure_is_retried() {
    init_logger();
    let device = Device::new();
    device.provision("1.0.0");
    let target = device.layout.app(PartitionId::B).unwrap().offset;
    device.flash.fail_writes_in(target + 1024..target + 2048);

    let directory = device.directory(PartitionId::A);
    let latch = RestartLatch::new();
    let delay = RecordingDelay::default();
    let mut orchestrator = UpdateOrchestrator::new(
        MemorySource::new(image("2.0.0")),
        &directory,
        &latch,
        &delay,
        test_config(),
    );

    let (_, error) = retry(orchestrator.step());
    assert_eq!(error.category(), FailureCategory::Write);
    assert_unchanged(&device);

    device.flash.clear_faults();
    assert!(matches!(orchestrator.step(), Step::Exit(Exit::Restart(_))));
}

#[test]
fn no_update_while_running_image_is_unconfirmed() {
    init_logger();
    let device = Device::new();
    device.provision("1.0.0");
    device
        .boot_cfg()
        .set_partition_state(PartitionId::A, RollbackState::PendingVerify)
        .unwrap();

    let directory = device.directory(PartitionId::A);
    let latch = RestartLatch::new();
    let delay = RecordingDelay::default();
    let source = MemorySource::new(image("2.0.0"));
    let connects = source.connects();
    let config = UpdateConfig {
        retry_interval_secs: 1,
        policy_retry_interval_secs: Some(60),
        ..test_config()
    };
    let mut orchestrator = UpdateOrchestrator::new(source, &directory, &latch, &delay, config);

    // Confirmation is usually seconds away, so the short delay applies.
    let (wait, error) = retry(orchestrator.step());
    assert!(matches!(
        error,
        OtaError::AwaitingVerification(PartitionId::A)
    ));
    assert_eq!(wait, Duration::from_secs(1));
    assert_eq!(connects.load(Ordering::SeqCst), 0);
}

#[test]
fn pending_restart_stops_the_task() {
    init_logger();
    let device = Device::new();
    device.provision("1.0.0");
    let directory = device.directory(PartitionId::A);
    let latch = RestartLatch::new();
    latch.restart(RestartReason::Rollback);
    let delay = RecordingDelay::default();
    let mut orchestrator = UpdateOrchestrator::new(
        MemorySource::new(image("2.0.0")),
        &directory,
        &latch,
        &delay,
        test_config(),
    );

    assert!(matches!(
        orchestrator.step(),
        Step::Exit(Exit::Restart(RestartReason::Rollback))
    ));
    assert_eq!(orchestrator.attempts(), 0);
}

#[test]
fn fetch_errors_follow_the_failure_policy() {
    init_logger();
    let device = Device::new();
    device.provision("1.0.0");
    let directory = device.directory(PartitionId::A);
    let latch = RestartLatch::new();
    let delay = RecordingDelay::default();
    let config = UpdateConfig {
        failure_policy: FailurePolicy {
            fatal_on_fetch_error: true,
            ..FailurePolicy::retry_forever()
        },
        ..test_config()
    };
    let mut orchestrator = UpdateOrchestrator::new(
        MemorySource::new(image("2.0.0")).failing_connects(1),
        &directory,
        &latch,
        &delay,
        config,
    );

    assert!(matches!(
        orchestrator.run(),
        Exit::Halted(OtaError::Fetch(FetchError::Unreachable(_)))
    ));
}
