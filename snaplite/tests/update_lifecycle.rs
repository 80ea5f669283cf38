//! End-to-end update lifecycle: begin, snapshot, finalize, boot, merge.

mod common;

use std::time::Duration;

use common::{daemon_manifest, TestContext, GIB, MIB};
use snaplite::{CancelResult, Slot, UpdateState};

const NO_TIMEOUT: Duration = Duration::ZERO;

/// Two partitions on the daemon driver, neither resized.
fn standard_update(ctx: &TestContext) {
    ctx.set_slot_metadata(
        0,
        &[("system_a", GIB, false), ("vendor_a", 512 * MIB, false)],
    );
    ctx.set_slot_metadata(
        1,
        &[("system_b", GIB, true), ("vendor_b", 512 * MIB, true)],
    );

    ctx.manager.begin_update().unwrap();
    ctx.manager
        .create_update_snapshots(&daemon_manifest(&[
            ("system_b", GIB, GIB),
            ("vendor_b", 512 * MIB, 512 * MIB),
        ]))
        .unwrap();
    ctx.manager.finished_snapshot_writes(false).unwrap();
}

#[test]
fn clean_update_and_merge() {
    let mut ctx = TestContext::new();
    standard_update(&ctx);

    // Finalized: unverified, boot indicator records the old slot, and no
    // rollback has been flagged.
    assert_eq!(ctx.manager.update_state(), UpdateState::Unverified);
    let boot_indicator = ctx.dir.path().join("snapshot-boot");
    assert_eq!(std::fs::read_to_string(&boot_indicator).unwrap(), "_a");
    assert!(!ctx.dir.path().join("rollback-indicator").exists());

    ctx.reboot_into("_b");
    assert_eq!(ctx.manager.current_slot(), Slot::Target);
    assert!(ctx.manager.need_snapshots_in_first_stage_mount());

    ctx.manager
        .create_logical_and_snapshot_partitions(NO_TIMEOUT)
        .unwrap();
    assert!(ctx.stack.has_device("system_b"));
    assert!(ctx.stack.has_device("system_b-base"));
    assert!(ctx.stack.has_device("vendor_b"));

    ctx.manager.initiate_merge().unwrap();
    assert_eq!(ctx.manager.update_state(), UpdateState::Merging);
    // Nothing shrunk, so everything merges in the second phase at once.
    assert_eq!(
        ctx.daemon.initiated(),
        vec!["system_b".to_string(), "vendor_b".to_string()]
    );

    ctx.daemon.complete_merge("system_b");
    ctx.daemon.complete_merge("vendor_b");
    let state = ctx.manager.process_update_state();
    assert_eq!(state, UpdateState::MergeCompleted);

    // All update state is gone and the partitions collapsed to linear.
    assert_eq!(ctx.manager.update_state(), UpdateState::None);
    assert!(!boot_indicator.exists());
    let snapshots: Vec<_> = std::fs::read_dir(ctx.dir.path().join("snapshots"))
        .unwrap()
        .collect();
    assert!(snapshots.is_empty());
    let table = ctx.stack.table_of("system_b").unwrap();
    assert_eq!(table.entries[0].spec.target_type(), "linear");
    assert!(!ctx.stack.has_device("system_b-base"));
    assert!(!ctx.stack.has_device("system_b-src"));
}

#[test]
fn finalize_is_idempotent() {
    let ctx = TestContext::new();
    standard_update(&ctx);
    // A second call is a no-op, not an error.
    ctx.manager.finished_snapshot_writes(false).unwrap();
    assert_eq!(ctx.manager.update_state(), UpdateState::Unverified);
}

#[test]
fn rollback_before_merge_cancels_the_update() {
    let mut ctx = TestContext::new();
    standard_update(&ctx);

    // Reboot lands back on the source slot.
    ctx.reboot();
    assert_eq!(ctx.manager.current_slot(), Slot::Source);

    // First-stage boot flags the rollback and skips snapshot assembly.
    assert!(!ctx.manager.need_snapshots_in_first_stage_mount());
    assert!(ctx.dir.path().join("rollback-indicator").exists());

    let state = ctx.manager.process_update_state();
    assert_eq!(state, UpdateState::Cancelled);
    assert_eq!(ctx.manager.update_state(), UpdateState::None);
    assert!(!ctx.dir.path().join("snapshots").join("system_b").exists());
    assert!(!ctx.dir.path().join("rollback-indicator").exists());
}

#[test]
fn cancel_from_source_slot_is_allowed() {
    let ctx = TestContext::new();
    standard_update(&ctx);

    assert!(ctx.manager.cancel_update());
    assert_eq!(ctx.manager.update_state(), UpdateState::None);
    assert!(!ctx.dir.path().join("snapshots").join("system_b").exists());
}

#[test]
fn cancel_from_target_slot_is_refused() {
    let mut ctx = TestContext::new();
    standard_update(&ctx);
    ctx.reboot_into("_b");

    assert_eq!(ctx.manager.try_cancel_update(), CancelResult::LiveSnapshots);
    assert!(!ctx.manager.is_cancel_update_safe());
    assert_eq!(ctx.manager.update_state(), UpdateState::Unverified);
}

#[test]
fn cancel_during_merge_needs_merge() {
    let mut ctx = TestContext::new();
    standard_update(&ctx);
    ctx.reboot_into("_b");
    ctx.manager
        .create_logical_and_snapshot_partitions(NO_TIMEOUT)
        .unwrap();
    ctx.manager.initiate_merge().unwrap();

    assert_eq!(ctx.manager.try_cancel_update(), CancelResult::NeedsMerge);
    assert!(!ctx.manager.is_cancel_update_safe());
    assert_eq!(ctx.manager.update_state(), UpdateState::Merging);
}

#[test]
fn begin_update_waits_out_a_pending_merge() {
    let mut ctx = TestContext::new();
    standard_update(&ctx);
    ctx.reboot_into("_b");
    ctx.manager
        .create_logical_and_snapshot_partitions(NO_TIMEOUT)
        .unwrap();
    ctx.manager.initiate_merge().unwrap();
    ctx.daemon.complete_merge("system_b");
    ctx.daemon.complete_merge("vendor_b");

    // begin_update observes NeedsMerge, drives the merge to completion, and
    // then starts cleanly.
    ctx.manager.begin_update().unwrap();
    assert_eq!(ctx.manager.update_state(), UpdateState::Initiated);
}

#[test]
fn initiate_merge_requires_target_slot() {
    let ctx = TestContext::new();
    standard_update(&ctx);
    // Still on the source slot.
    assert!(ctx.manager.initiate_merge().is_err());
}

#[test]
fn initiate_merge_requires_unverified() {
    let ctx = TestContext::new();
    assert!(ctx.manager.initiate_merge().is_err());
}

#[test]
fn merge_status_bit_ordering() {
    let mut ctx = TestContext::new();
    standard_update(&ctx);
    ctx.reboot_into("_b");
    ctx.manager
        .create_logical_and_snapshot_partitions(NO_TIMEOUT)
        .unwrap();
    ctx.manager.initiate_merge().unwrap();
    ctx.daemon.complete_merge("system_b");
    ctx.daemon.complete_merge("vendor_b");
    ctx.manager.process_update_state();

    // The bit was raised for the unverified and merging windows and dropped
    // again once the update state went away.
    use snaplite::MergeIndicator;
    let indicators = ctx.device.merge_indicators();
    assert!(indicators.contains(&MergeIndicator::Snapshotted));
    assert!(indicators.contains(&MergeIndicator::Merging));
    assert_eq!(*indicators.last().unwrap(), MergeIndicator::None);
}

#[test]
fn update_snapshot_mapping_during_install() {
    let ctx = TestContext::new();
    standard_update(&ctx);

    // Mapping for installation stops at the base for daemon-backed stacks;
    // the COW content does not exist yet.
    let path = ctx
        .manager
        .map_update_snapshot("system_b", NO_TIMEOUT)
        .unwrap()
        .unwrap();
    assert_eq!(path.to_string_lossy(), "/dev/block/mapper/system_b-base");
    assert!(ctx.stack.has_device("system_b-base"));
    assert!(!ctx.stack.has_device("system_b"));

    ctx.manager.unmap_update_snapshot("system_b").unwrap();
    assert!(!ctx.stack.has_device("system_b-base"));
}

#[test]
fn unmap_all_snapshots_releases_the_daemon() {
    let mut ctx = TestContext::new();
    standard_update(&ctx);
    ctx.reboot_into("_b");
    ctx.manager
        .create_logical_and_snapshot_partitions(NO_TIMEOUT)
        .unwrap();
    // Mapping attached the daemon to both partitions.
    assert_eq!(ctx.daemon.attached().len(), 2);

    ctx.manager.unmap_all_snapshots().unwrap();
    assert!(!ctx.stack.has_device("system_b"));
    assert!(!ctx.stack.has_device("system_b-base"));
    assert!(ctx.daemon.detach_count() > 0);
}

#[test]
fn source_build_fingerprint_is_recorded() {
    let ctx = TestContext::new();
    standard_update(&ctx);
    assert_eq!(
        ctx.manager.read_source_build_fingerprint(),
        "fake/device:15/BP1A/1:user"
    );
}

#[test]
fn dump_reports_state_and_snapshots() {
    let ctx = TestContext::new();
    standard_update(&ctx);

    let mut out = Vec::new();
    ctx.manager.dump(&mut out).unwrap();
    let report = String::from_utf8(out).unwrap();
    assert!(report.contains("Update state: unverified"));
    assert!(report.contains("Snapshot: system_b"));
    assert!(report.contains("Snapshot: vendor_b"));
}

#[test]
fn no_update_means_no_first_stage_snapshots() {
    let ctx = TestContext::new();
    assert_eq!(ctx.manager.current_slot(), Slot::Unknown);
    assert!(!ctx.manager.need_snapshots_in_first_stage_mount());
    // No boot indicator, so no rollback indicator either.
    assert!(!ctx.dir.path().join("rollback-indicator").exists());
}
