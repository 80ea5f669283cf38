//! The merge orchestrator: two-phase policy, polling, failure accounting.
//!
//! A merge always runs to a terminal state eventually. When it fails, the
//! state is recorded as `MergeFailed` and retried on every subsequent boot
//! with no upper bound; transient faults self-heal.

use std::time::Duration;

use crate::device::{merge_percent, DaemonMergeState, DeviceState, SnapshotTargetStatus};
use crate::error::{MergeFailureCode, SnapError, SnapResult};
use crate::manager::SnapshotManager;
use crate::metadata::PartitionState;
use crate::slot::Slot;
use crate::state::{MergePhase, SnapshotState, UpdateState};
use crate::store::DirLock;

/// Cadence of the merge polling loop. Not time sensitive.
pub const UPDATE_STATE_CHECK_INTERVAL: Duration = Duration::from_secs(2);

const PAUSE_RESUME_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of one merge-state evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeResult {
    pub state: UpdateState,
    pub failure_code: MergeFailureCode,
}

impl MergeResult {
    fn new(state: UpdateState) -> Self {
        Self {
            state,
            failure_code: MergeFailureCode::Ok,
        }
    }

    fn failed(code: MergeFailureCode) -> Self {
        Self {
            state: UpdateState::MergeFailed,
            failure_code: code,
        }
    }
}

impl SnapshotManager {
    // ========================================================================
    // INITIATION
    // ========================================================================

    /// Begin merging COW contents back into the base partitions.
    ///
    /// Preconditions: the update is `Unverified` and the device booted the
    /// target slot. Re-flashed partitions are dropped from the merge (their
    /// snapshots are deleted); if nothing qualifies, the merge still commits
    /// and converges immediately.
    ///
    /// Writing `Merging` is the point of no return: from then on every
    /// qualifying snapshot must eventually become a merge target, so
    /// per-entity switch failures are recorded but do not abort the sweep.
    pub fn initiate_merge(&self) -> SnapResult<()> {
        let lock = self.lock_exclusive()?;

        let state = self.read_update_state(&lock);
        if state != UpdateState::Unverified {
            return Err(SnapError::InvalidState(format!(
                "cannot begin a merge if the update has not been verified ({state})"
            )));
        }
        if self.current_slot() != Slot::Target {
            return Err(SnapError::InvalidState(
                "device cannot merge while not booted from the new slot".to_string(),
            ));
        }

        let snapshots = self.store.list_snapshots(&lock, None)?;
        let current_suffix = self.device.slot_suffix();

        for snapshot in &snapshots {
            if !snapshot.ends_with(&current_suffix) {
                // Allow the merge to continue, but this is unexpected.
                tracing::error!(snapshot = %snapshot, "unexpected snapshot found during merge");
                continue;
            }
            // Everything merges together; the stack should have been mapped
            // during first-stage boot.
            if self.stack.state(snapshot) == DeviceState::Invalid {
                return Err(SnapError::Device(format!(
                    "cannot begin merge; device {snapshot} is not mapped"
                )));
            }
        }

        let metadata = self.read_current_metadata()?;
        let mut merge_list = Vec::new();
        for snapshot in snapshots {
            if !snapshot.ends_with(&current_suffix) {
                continue;
            }
            match metadata.partition_state(&snapshot) {
                PartitionState::Updated => merge_list.push(snapshot),
                state => {
                    if state == PartitionState::Flashed {
                        tracing::warn!(partition = %snapshot, "detected re-flashing, skipping merge");
                    }
                    tracing::warn!(partition = %snapshot, "deleting snapshot");
                    if let Err(err) = self.delete_snapshot(&lock, &snapshot) {
                        tracing::warn!(partition = %snapshot, %err,
                            "cannot delete snapshot, skipping merge anyway");
                    }
                }
            }
        }

        let userspace = self.uses_userspace_snapshots(&lock);
        let mut using_daemon = false;
        let mut baseline = SnapshotTargetStatus::default();
        let mut first_group = Vec::new();

        for snapshot in &merge_list {
            if !userspace {
                let (_, status) = self.query_snapshot_status(snapshot)?;
                baseline.sectors_allocated += status.sectors_allocated;
                baseline.total_sectors += status.total_sectors;
                baseline.metadata_sectors += status.metadata_sectors;
            }
            let status = self.store.read_snapshot(&lock, snapshot)?;
            using_daemon |= status.using_daemon;
            if status.merge_phase() == MergePhase::First {
                first_group.push(snapshot.clone());
            }
        }

        let mut global = self.store.read_global(&lock);
        global.state = UpdateState::Merging;
        global.using_daemon = using_daemon;
        if !userspace {
            global.sectors_allocated = baseline.sectors_allocated;
            global.total_sectors = baseline.total_sectors;
            global.metadata_sectors = baseline.metadata_sectors;
        }

        // Shrunk partitions must merge before anything else; a merge from
        // another partition could overwrite the source block of a pending
        // copy operation.
        let merge_group: &[String] = if first_group.is_empty() {
            global.merge_phase = MergePhase::Second;
            &merge_list
        } else {
            global.merge_phase = MergePhase::First;
            &first_group
        };

        // Point of no return.
        self.write_global_status(&lock, &global)?;

        let mut reported_code = MergeFailureCode::Ok;
        for snapshot in merge_group {
            // If this fails there is no choice but to continue; everything
            // must be merged. The next boot will try again.
            let code = self.switch_snapshot_to_merge(&lock, snapshot);
            if code != MergeFailureCode::Ok {
                tracing::error!(snapshot = %snapshot, ?code,
                    "failed to switch snapshot to a merge target");
                if reported_code == MergeFailureCode::Ok {
                    reported_code = code;
                }
            }
        }

        if reported_code != MergeFailureCode::Ok {
            // Pre-emptively record the failure; it is acknowledged when the
            // poll loop runs.
            let _ = self.write_update_state(&lock, UpdateState::MergeFailed, reported_code);
        }

        // A merge was initiated regardless of per-entity switch failures.
        Ok(())
    }

    /// Turn one snapshot into a merge target: rewrite the dm-snapshot table
    /// in place with the kernel driver, or tell the daemon with the
    /// userspace driver.
    pub(crate) fn switch_snapshot_to_merge(&self, lock: &DirLock, name: &str) -> MergeFailureCode {
        let Ok(mut status) = self.store.read_snapshot(lock, name) else {
            return MergeFailureCode::ReadStatus;
        };
        if status.state != SnapshotState::Created {
            tracing::warn!(snapshot = name, state = %status.state, "unexpected snapshot state");
        }

        if self.uses_userspace_snapshots(lock) {
            if let Err(err) = self.with_daemon(|daemon| daemon.initiate_merge(name)) {
                tracing::error!(snapshot = name, %err, "daemon failed to initiate merge");
                return MergeFailureCode::UnknownTable;
            }
        } else {
            let code = self.rewrite_snapshot_device_table(name);
            if code != MergeFailureCode::Ok {
                return code;
            }
        }

        status.state = SnapshotState::Merging;

        if !self.uses_userspace_snapshots(lock) {
            match self.query_snapshot_status(name) {
                Ok((_, dm_status)) => {
                    status.sectors_allocated = dm_status.sectors_allocated;
                    status.metadata_sectors = dm_status.metadata_sectors;
                }
                Err(err) => {
                    tracing::error!(snapshot = name, %err, "could not query merge status");
                }
            }
        }

        if let Err(err) = self.store.write_snapshot(lock, &status) {
            tracing::error!(snapshot = name, %err, "could not update snapshot record");
        }
        MergeFailureCode::Ok
    }

    /// Swap a dm-snapshot table for a snapshot-merge one, in place.
    fn rewrite_snapshot_device_table(&self, name: &str) -> MergeFailureCode {
        let Ok(targets) = self.stack.table(name) else {
            tracing::error!(device = name, "could not read snapshot device table");
            return MergeFailureCode::GetTableInfo;
        };
        if targets.len() != 1 {
            tracing::error!(device = name, "unexpected device-mapper table for snapshot");
            return MergeFailureCode::UnknownTable;
        }
        let entry = &targets[0];
        let crate::device::TargetSpec::Snapshot {
            base,
            cow,
            mode: crate::device::SnapshotMode::Persistent,
            chunk_sectors,
        } = &entry.spec
        else {
            tracing::error!(device = name, "unexpected device-mapper table for snapshot");
            return MergeFailureCode::UnknownTable;
        };

        let table = crate::device::TableSpec::single(
            entry.num_sectors,
            crate::device::TargetSpec::Snapshot {
                base: base.clone(),
                cow: cow.clone(),
                mode: crate::device::SnapshotMode::Merge,
                chunk_sectors: *chunk_sectors,
            },
        );
        if self.stack.load_table_and_activate(name, &table).is_err() {
            tracing::error!(device = name, "could not swap tables on snapshot device");
            return MergeFailureCode::ActivateNewTable;
        }
        tracing::info!(device = name, "switched snapshot device to a merge target");
        MergeFailureCode::Ok
    }

    // ========================================================================
    // POLLING
    // ========================================================================

    /// Poll until the merge reaches a terminal state.
    pub fn process_update_state(&self) -> UpdateState {
        self.process_update_state_with(None, None)
    }

    /// Poll with a cooperative callback checked between polls; returning
    /// false ends the loop early with the last observed state.
    pub fn process_update_state_with(
        &self,
        callback: Option<&dyn Fn() -> bool>,
        before_cancel: Option<&dyn Fn() -> bool>,
    ) -> UpdateState {
        loop {
            let result = self.check_merge_state(before_cancel);
            tracing::info!(state = %result.state, "processing update state");

            if result.state == UpdateState::MergeFailed {
                self.acknowledge_merge_failure(result.failure_code);
            }
            if result.state != UpdateState::Merging {
                return result.state;
            }
            if let Some(callback) = callback {
                if !callback() {
                    return result.state;
                }
            }
            std::thread::sleep(UPDATE_STATE_CHECK_INTERVAL);
        }
    }

    /// Evaluate the merge once, acknowledging completion or cancellation.
    pub(crate) fn check_merge_state(
        &self,
        before_cancel: Option<&dyn Fn() -> bool>,
    ) -> MergeResult {
        let Ok(lock) = self.lock_exclusive() else {
            return MergeResult::failed(MergeFailureCode::AcquireLock);
        };

        let result = self.check_merge_state_locked(&lock, before_cancel);
        tracing::info!(state = %result.state, "merge state evaluated");

        if result.state == UpdateState::MergeCompleted {
            // Acknowledge success under the same lock; failures get
            // acknowledged without it because the lock itself may have been
            // the problem.
            self.acknowledge_merge_success(&lock);
        } else if result.state == UpdateState::Cancelled {
            if !self.device.is_recovery() {
                if let Err(err) = self.remove_all_update_state(&lock, before_cancel) {
                    tracing::error!(%err, "failed to remove update state after cancelled update");
                }
            }
        }
        result
    }

    fn check_merge_state_locked(
        &self,
        lock: &DirLock,
        before_cancel: Option<&dyn Fn() -> bool>,
    ) -> MergeResult {
        let global = self.store.read_global(lock);
        match global.state {
            // Harmless races between two pollers; just report.
            UpdateState::None | UpdateState::MergeCompleted => {
                return MergeResult::new(global.state);
            }

            // Poll per snapshot below. NeedsReboot polls once more to give
            // cleanup another chance.
            UpdateState::Merging | UpdateState::MergeNeedsReboot | UpdateState::MergeFailed => {}

            UpdateState::Unverified => {
                // Cancelled updates are normally detected by the poll below,
                // but a merge that never started needs this check.
                if self.handle_cancelled_update(lock, before_cancel) {
                    return MergeResult::new(UpdateState::Cancelled);
                }
                return MergeResult::new(global.state);
            }

            _ => return MergeResult::new(global.state),
        }

        let Ok(snapshots) = self.store.list_snapshots(lock, None) else {
            return MergeResult::failed(MergeFailureCode::ListSnapshots);
        };
        let current_suffix = self.device.slot_suffix();

        let mut cancelled = false;
        let mut merging = false;
        let mut needs_reboot = false;
        let mut wrong_phase = false;
        let mut failure_code = MergeFailureCode::Ok;

        for snapshot in &snapshots {
            if !snapshot.ends_with(&current_suffix) {
                tracing::error!(snapshot = %snapshot, "skipping merge validation of unexpected snapshot");
                continue;
            }

            let result = self.check_target_merge_state(lock, snapshot, &global);
            tracing::info!(snapshot = %snapshot, state = %result.state, "per-snapshot merge state");

            match result.state {
                UpdateState::MergeFailed => {
                    // First failure wins in case others compound.
                    if failure_code == MergeFailureCode::Ok {
                        failure_code = result.failure_code;
                    }
                }
                UpdateState::Merging => merging = true,
                UpdateState::MergeNeedsReboot => needs_reboot = true,
                UpdateState::MergeCompleted => {}
                UpdateState::Cancelled => cancelled = true,
                // Signals "waiting for the other phase".
                UpdateState::None => wrong_phase = true,
                state => {
                    tracing::error!(snapshot = %snapshot, %state, "unknown per-snapshot merge state");
                    if failure_code == MergeFailureCode::Ok {
                        failure_code = MergeFailureCode::UnexpectedMergeState;
                    }
                }
            }
        }

        if merging {
            // Merging dominates: poll until nothing is merging so everything
            // gets the chance to settle as completed or failed.
            return MergeResult::new(UpdateState::Merging);
        }
        if failure_code != MergeFailureCode::Ok {
            return MergeResult::failed(failure_code);
        }
        if wrong_phase {
            // Nothing is merging and nothing failed: safe to advance phase.
            let code = self.merge_second_phase_snapshots(lock);
            if code != MergeFailureCode::Ok {
                return MergeResult::failed(code);
            }
            return MergeResult::new(UpdateState::Merging);
        }
        if needs_reboot {
            let _ = self.write_update_state(lock, UpdateState::MergeNeedsReboot, MergeFailureCode::Ok);
            return MergeResult::new(UpdateState::MergeNeedsReboot);
        }
        if cancelled {
            // The underlying partition changed behind the update; only
            // possible on an unlocked device. Handle as gracefully as we can.
            return MergeResult::new(UpdateState::Cancelled);
        }
        MergeResult::new(UpdateState::MergeCompleted)
    }

    /// Classify one snapshot's merge progress.
    fn check_target_merge_state(
        &self,
        lock: &DirLock,
        name: &str,
        global: &crate::state::GlobalStatus,
    ) -> MergeResult {
        let Ok(mut snapshot_status) = self.store.read_snapshot(lock, name) else {
            return MergeResult::failed(MergeFailureCode::ReadStatus);
        };

        if !self.is_snapshot_device(name) {
            let updated = self
                .read_current_metadata()
                .map(|m| m.partition_state(name) == PartitionState::Updated)
                .unwrap_or(false);
            if !updated {
                // Mid-merge re-flash: drop the snapshot, cancel this entity.
                if let Err(err) = self.delete_snapshot(lock, name) {
                    tracing::warn!(snapshot = name, %err, "failed to delete re-flashed snapshot");
                }
                return MergeResult::new(UpdateState::Cancelled);
            }

            // The merge completed earlier but collapse could not finish. If
            // the device rebooted since, it is a plain linear target now and
            // cleanup can be retried.
            if snapshot_status.state == SnapshotState::MergeCompleted {
                // Best effort; cleanup already got its chance once.
                let _ = self.on_snapshot_merge_complete(lock, name, &snapshot_status);
                return MergeResult::new(UpdateState::MergeCompleted);
            }

            tracing::error!(snapshot = name, "expected snapshot or snapshot-merge device");
            return MergeResult::failed(MergeFailureCode::UnknownTargetType);
        }

        if self.uses_userspace_snapshots(lock) {
            let merge_status = match self.with_daemon(|daemon| daemon.query_snapshot_status(name))
            {
                Ok(status) => status,
                Err(err) => {
                    tracing::error!(snapshot = name, %err, "daemon status query failed");
                    return MergeResult::failed(MergeFailureCode::QuerySnapshotStatus);
                }
            };

            if merge_status == DaemonMergeState::SnapshotMergeFailed {
                return MergeResult::failed(MergeFailureCode::UnknownTargetType);
            }

            // After a reboot the daemon does not resume merges on its own;
            // the record says merging while the daemon still says snapshot.
            // Nudge it.
            if merge_status == DaemonMergeState::Snapshot
                && snapshot_status.state == SnapshotState::Merging
            {
                if self
                    .with_daemon(|daemon| daemon.initiate_merge(name))
                    .is_err()
                {
                    return MergeResult::failed(MergeFailureCode::UnknownTargetType);
                }
                return MergeResult::new(UpdateState::Merging);
            }

            if merge_status == DaemonMergeState::Snapshot
                && snapshot_status.merge_phase() == MergePhase::Second
            {
                if global.merge_phase == MergePhase::First {
                    // Not merging because it belongs to the other phase.
                    return MergeResult::new(UpdateState::None);
                }
                // Already in the second phase but this snapshot was never
                // switched; resume it now.
                tracing::info!(snapshot = name, "switching snapshot to merge after resume");
                let code = self.switch_snapshot_to_merge(lock, name);
                if code != MergeFailureCode::Ok {
                    tracing::error!(snapshot = name, "failed to switch snapshot during second phase");
                    return MergeResult::failed(MergeFailureCode::UnknownTargetType);
                }
                return MergeResult::new(UpdateState::Merging);
            }

            if merge_status == DaemonMergeState::SnapshotMerge {
                if snapshot_status.state == SnapshotState::MergeCompleted {
                    tracing::error!(snapshot = name, "merging after being marked merge-complete");
                    return MergeResult::failed(MergeFailureCode::UnmergedSectorsAfterCompletion);
                }
                return MergeResult::new(UpdateState::Merging);
            }

            if merge_status != DaemonMergeState::SnapshotMergeComplete {
                tracing::error!(snapshot = name, status = %merge_status, "incorrect daemon status");
                return MergeResult::failed(MergeFailureCode::ExpectedMergeTarget);
            }
        } else {
            let Ok((target_type, dm_status)) = self.query_snapshot_status(name) else {
                return MergeResult::failed(MergeFailureCode::QuerySnapshotStatus);
            };
            if target_type == "snapshot"
                && snapshot_status.merge_phase() == MergePhase::Second
                && global.merge_phase == MergePhase::First
            {
                return MergeResult::new(UpdateState::None);
            }
            if target_type != "snapshot-merge" {
                // Reachable when the table rewrite failed at initiation.
                tracing::error!(snapshot = name, %target_type, "incorrect target type");
                return MergeResult::failed(MergeFailureCode::ExpectedMergeTarget);
            }

            // Equal counts mean the merge is complete.
            if dm_status.sectors_allocated != dm_status.metadata_sectors {
                if snapshot_status.state == SnapshotState::MergeCompleted {
                    tracing::error!(snapshot = name, "merging after being marked merge-complete");
                    return MergeResult::failed(MergeFailureCode::UnmergedSectorsAfterCompletion);
                }
                return MergeResult::new(UpdateState::Merging);
            }
        }

        // The merge is done. Persist completion before the destructive
        // cleanup: whatever part of teardown fails, the next boot will not
        // build another snapshot device for this partition.
        snapshot_status.state = SnapshotState::MergeCompleted;
        if self.store.write_snapshot(lock, &snapshot_status).is_err() {
            return MergeResult::failed(MergeFailureCode::WriteStatus);
        }
        if self
            .on_snapshot_merge_complete(lock, name, &snapshot_status)
            .is_err()
        {
            // Not fatal; retried after the next reboot.
            return MergeResult::new(UpdateState::MergeNeedsReboot);
        }
        MergeResult::new(UpdateState::MergeCompleted)
    }

    /// Advance from the first to the second merge phase and switch the
    /// remaining snapshots.
    fn merge_second_phase_snapshots(&self, lock: &DirLock) -> MergeFailureCode {
        let Ok(snapshots) = self.store.list_snapshots(lock, None) else {
            return MergeFailureCode::ListSnapshots;
        };

        let mut global = self.store.read_global(lock);
        debug_assert!(matches!(
            global.state,
            UpdateState::Merging | UpdateState::MergeFailed
        ));
        debug_assert_eq!(global.merge_phase, MergePhase::First);

        global.state = UpdateState::Merging;
        global.merge_phase = MergePhase::Second;
        if self.write_global_status(lock, &global).is_err() {
            return MergeFailureCode::WriteStatus;
        }

        let current_suffix = self.device.slot_suffix();
        let mut result = MergeFailureCode::Ok;
        for snapshot in snapshots {
            if !snapshot.ends_with(&current_suffix) {
                tracing::error!(snapshot = %snapshot, "skipping invalid snapshot in second phase");
                continue;
            }
            let Ok(status) = self.store.read_snapshot(lock, &snapshot) else {
                return MergeFailureCode::ReadStatus;
            };
            if status.merge_phase() != MergePhase::Second {
                continue;
            }
            let code = self.switch_snapshot_to_merge(lock, &snapshot);
            if code != MergeFailureCode::Ok {
                tracing::error!(snapshot = %snapshot,
                    "failed to switch snapshot to a second-phase merge target");
                if result == MergeFailureCode::Ok {
                    result = code;
                }
            }
        }
        result
    }

    // ========================================================================
    // ACKNOWLEDGEMENT
    // ========================================================================

    pub(crate) fn acknowledge_merge_success(&self, lock: &DirLock) {
        // Update state cannot be removed in recovery; record completion so
        // cleanup runs on the next boot. A pending data wipe covers it too.
        if self.device.is_recovery() {
            let _ = self.write_update_state(lock, UpdateState::MergeCompleted, MergeFailureCode::Ok);
            return;
        }

        if let Err(err) = self.remove_all_update_state(lock, None) {
            tracing::error!(%err, "failed to remove update state after merge success");
        }

        if self.uses_userspace_snapshots(lock) && self.daemon_connected() {
            let _ = self.with_daemon(|daemon| {
                daemon.remove_transitioned_daemon_indicator()?;
                daemon.detach()
            });
            self.disconnect_daemon();
        }
    }

    fn acknowledge_merge_failure(&self, failure_code: MergeFailureCode) {
        // Log first so there is always a record of why.
        tracing::error!(?failure_code, "merge could not be completed, marking as failed");

        let Ok(lock) = self.lock_exclusive() else {
            return;
        };

        // The lock was released since the poll; the merge may have finished
        // or already been marked. Only mark failure when still appropriate.
        let state = self.read_update_state(&lock);
        if !matches!(
            state,
            UpdateState::Merging | UpdateState::MergeNeedsReboot
        ) {
            return;
        }
        let _ = self.write_update_state(&lock, UpdateState::MergeFailed, failure_code);
    }

    fn daemon_connected(&self) -> bool {
        self.daemon.borrow().is_some()
    }

    // ========================================================================
    // PROGRESS AND QUERIES
    // ========================================================================

    /// The current state plus merge completion percentage.
    pub fn update_state_with_progress(&self) -> (UpdateState, f64) {
        // Never started an update: the state file will not exist.
        if !self.store.state_file_exists() {
            return (UpdateState::None, 0.0);
        }
        let Ok(lock) = self.lock_shared() else {
            return (UpdateState::None, 0.0);
        };

        let global = self.store.read_global(&lock);
        if global.state == UpdateState::MergeCompleted {
            return (global.state, 100.0);
        }
        if global.state != UpdateState::Merging {
            return (global.state, 0.0);
        }

        if self.uses_userspace_snapshots(&lock) {
            let percent = self
                .with_daemon(|daemon| daemon.merge_percent())
                .unwrap_or(0.0);
            return (global.state, percent);
        }

        // Sum all devices as if they were one giant snapshot, then compute
        // that device's completion.
        let Ok(snapshots) = self.store.list_snapshots(&lock, None) else {
            return (global.state, 0.0);
        };
        let mut sum = SnapshotTargetStatus::default();
        for snapshot in snapshots {
            if !self.is_snapshot_device(&snapshot) {
                continue;
            }
            let Ok((_, status)) = self.query_snapshot_status(&snapshot) else {
                continue;
            };
            sum.sectors_allocated += status.sectors_allocated;
            sum.total_sectors += status.total_sectors;
            sum.metadata_sectors += status.metadata_sectors;
        }
        (global.state, merge_percent(&sum, global.sectors_allocated))
    }

    /// The recorded failure code, `Ok` unless the state is `MergeFailed`.
    pub fn read_merge_failure_code(&self) -> MergeFailureCode {
        let Ok(lock) = self.lock_exclusive() else {
            return MergeFailureCode::AcquireLock;
        };
        let global = self.store.read_global(&lock);
        if global.state != UpdateState::MergeFailed {
            return MergeFailureCode::Ok;
        }
        global.merge_failure_code
    }

    /// Fingerprint of the build the update was installed from.
    pub fn read_source_build_fingerprint(&self) -> String {
        match self.lock_exclusive() {
            Ok(lock) => self.store.read_global(&lock).source_build_fingerprint,
            Err(_) => String::new(),
        }
    }

    /// Ask the daemon to pause the running merge, over a fresh best-effort
    /// connection.
    pub fn pause_merge(&self) -> SnapResult<()> {
        let mut daemon = self.daemon_factory.connect(PAUSE_RESUME_CONNECT_TIMEOUT)?;
        daemon.pause_merge()
    }

    /// Resume a previously paused merge.
    pub fn resume_merge(&self) -> SnapResult<()> {
        let mut daemon = self.daemon_factory.connect(PAUSE_RESUME_CONNECT_TIMEOUT)?;
        daemon.resume_merge()
    }
}
