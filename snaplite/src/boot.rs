//! The boot bridge: first-stage assembly decisions, rollback detection,
//! recovery data-wipe handling, and the init daemon handoff.

use std::time::Duration;

use crate::device::{DeviceState, TableSpec, TargetSpec};
use crate::entity::{base_device_name, cow_device_name, cow_image_name, source_device_name, MapContext};
use crate::error::{MergeFailureCode, SnapError, SnapResult};
use crate::manager::SnapshotManager;
use crate::metadata::{COW_GROUP_NAME, OTA_METADATA_PARTITION};
use crate::slot::{slot_number_for_suffix, Slot};
use crate::state::{SnapshotStatus, UpdateState};
use crate::store::DirLock;

/// Timeout for assembling the stacks in recovery flows.
const RECOVERY_MAP_TIMEOUT: Duration = Duration::from_secs(20);

const CONTROL_DEVICE_TIMEOUT: Duration = Duration::from_secs(10);

/// Which init handoff is being performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitTransition {
    /// Second-stage init takes over the dm-user devices directly.
    SecondStage,
    /// First-stage daemon is torn down for the policy transition; emit the
    /// launch arguments for its replacement instead of talking to it.
    SelinuxDetach,
}

impl SnapshotManager {
    // ========================================================================
    // FIRST-STAGE MOUNT
    // ========================================================================

    /// Whether first-stage boot must assemble snapshot stacks.
    ///
    /// Booting the source slot is a rollback: the rollback indicator is
    /// written and the system boots from the original blocks.
    pub fn need_snapshots_in_first_stage_mount(&self) -> bool {
        if self.is_snapshot_without_slot_switch() {
            if self.current_slot() != Slot::Source {
                tracing::error!(
                    "snapshots marked to boot without slot switch, but the slot is wrong"
                );
                return false;
            }
            return true;
        }

        let slot = self.current_slot();
        if slot != Slot::Target {
            if slot == Slot::Source {
                let path = self.store.layout().rollback_indicator();
                match self.store.write_indicator(&path, "1") {
                    Ok(()) => {
                        tracing::info!(path = %path.display(), "rollback detected, wrote indicator")
                    }
                    Err(err) => tracing::error!(%err, "unable to write rollback indicator"),
                }
            }
            tracing::info!("not booting from new slot, will not mount snapshots");
            return false;
        }

        let Ok(lock) = self.lock_shared() else {
            tracing::error!("could not read update state to determine snapshot status");
            return false;
        };
        matches!(
            self.read_update_state(&lock),
            UpdateState::Unverified | UpdateState::Merging | UpdateState::MergeFailed
        )
    }

    /// Map every logical partition of the booted slot, stacking snapshots
    /// where live ones exist. The COW group and the ephemeral metadata
    /// partition are skipped.
    pub fn create_logical_and_snapshot_partitions(&self, timeout: Duration) -> SnapResult<()> {
        tracing::info!("creating logical partitions with snapshots as needed");
        let lock = self.lock_exclusive()?;
        self.map_all_partitions(&lock, timeout)
    }

    fn map_all_partitions(&self, lock: &DirLock, timeout: Duration) -> SnapResult<()> {
        let metadata = self.read_current_metadata()?;
        for partition in &metadata.partitions {
            if partition.group == COW_GROUP_NAME {
                tracing::info!(partition = %partition.name, "skipping COW group partition");
                continue;
            }
            if partition.name == OTA_METADATA_PARTITION {
                tracing::info!(partition = %partition.name, "skipping metadata partition");
                continue;
            }
            self.map_partition_with_snapshot(
                lock,
                &metadata,
                &partition.name,
                timeout,
                MapContext::Mount,
            )?;
        }
        tracing::info!("created logical partitions with snapshots");
        Ok(())
    }

    /// Remap every snapshot from scratch. Allowed while installing, or from
    /// the source slot before the switch.
    pub fn map_all_snapshots(&self, timeout: Duration) -> SnapResult<()> {
        let lock = self.lock_exclusive()?;

        let state = self.read_update_state(&lock);
        match state {
            UpdateState::Unverified => {
                if self.current_slot() == Slot::Target {
                    return Err(SnapError::InvalidState(
                        "cannot map all snapshots when booted from the target slot".to_string(),
                    ));
                }
            }
            UpdateState::Initiated => {}
            state => {
                return Err(SnapError::InvalidState(format!(
                    "cannot map all snapshots from update state {state}"
                )));
            }
        }

        // Snapshots describe the target slot, so use the other slot's view
        // of super.
        let target_slot = slot_number_for_suffix(&self.device.other_slot_suffix());
        let metadata = self.device.read_current_metadata(target_slot)?;

        for name in self.store.list_snapshots(&lock, None)? {
            self.unmap_partition_with_snapshot(&lock, &name)?;
            self.map_partition_with_snapshot(&lock, &metadata, &name, timeout, MapContext::Mount)?;
        }
        tracing::info!("mapped all snapshots");
        Ok(())
    }

    /// Tear down every snapshot stack and release the daemon.
    pub fn unmap_all_snapshots(&self) -> SnapResult<()> {
        let lock = self.lock_exclusive()?;
        self.unmap_all_snapshots_locked(&lock)
    }

    pub(crate) fn unmap_all_snapshots_locked(&self, lock: &DirLock) -> SnapResult<()> {
        let snapshots = self.store.list_snapshots(lock, None)?;
        tracing::info!(count = snapshots.len(), "unmapping partitions with snapshots");

        for snapshot in &snapshots {
            self.unmap_partition_with_snapshot(lock, snapshot)?;
        }

        // Release the connection; a later operation reconnects on demand.
        if self.daemon.borrow().is_some() {
            tracing::info!("shutting down COW daemon");
            let _ = self.with_daemon(|daemon| daemon.detach());
            self.disconnect_daemon();
        }
        Ok(())
    }

    /// Unmap every logical partition (recovery only; nothing depends on the
    /// partitions there).
    pub fn unmap_all_partitions(&self) -> SnapResult<()> {
        let lock = self.lock_exclusive()?;
        let metadata = self.read_current_metadata()?;

        let mut ok = true;
        for partition in &metadata.partitions {
            if self
                .unmap_partition_with_snapshot(&lock, &partition.name)
                .is_err()
            {
                ok = false;
            }
        }
        if ok {
            Ok(())
        } else {
            Err(SnapError::Device(
                "could not unmap all partitions".to_string(),
            ))
        }
    }

    // ========================================================================
    // RECOVERY FLOWS
    // ========================================================================

    /// Decide whether an imminent data wipe may proceed, finishing or
    /// rolling back a pending update as needed. Returns true when the wipe
    /// is allowed.
    pub fn handle_imminent_data_wipe(&self, callback: Option<&dyn Fn()>) -> bool {
        if !self.device.is_recovery() {
            tracing::error!("data wipes are only allowed in recovery");
            return false;
        }

        match self.device.ensure_metadata_mounted() {
            Ok(true) => {}
            // No metadata partition: the device predates this mechanism, or
            // it would not have booted anyway.
            Ok(false) | Err(_) => {
                tracing::info!("metadata not found, allowing wipe");
                return true;
            }
        }

        let mut state = {
            let Ok(lock) = self.lock_exclusive() else {
                tracing::error!("unable to determine update state, allowing wipe");
                return true;
            };
            let state = self.read_update_state(&lock);
            tracing::info!(%state, slot = %self.current_slot(), "update state before wipe");
            state
        };

        let mut try_merge = false;
        match state {
            UpdateState::None | UpdateState::Initiated => {
                tracing::info!("wipe is not impacted by update state, allowing wipe");
            }
            UpdateState::Unverified => {
                if self.current_slot() != Slot::Target {
                    tracing::info!("wipe is not impacted by rolled back update, allowing wipe");
                } else if !self.has_forward_merge_indicator() {
                    // Not allowed to merge across the wipe, so forcefully
                    // roll the slot switch back.
                    let slot = slot_number_for_suffix(&self.device.slot_suffix());
                    let other = slot_number_for_suffix(&self.device.other_slot_suffix());
                    tracing::info!(
                        "allowing wipe, reverting to old slot since the update will be deleted"
                    );
                    self.device.set_slot_unbootable(slot);
                    self.device.set_active_boot_slot(other);
                } else {
                    tracing::info!("forward merge indicator is present");
                    try_merge = true;
                }
            }
            UpdateState::Merging | UpdateState::MergeFailed => {
                try_merge = true;
            }
            UpdateState::MergeNeedsReboot
            | UpdateState::MergeCompleted
            | UpdateState::Cancelled => {
                tracing::info!(%state, "unexpected update state in recovery, allowing wipe");
            }
        }

        if try_merge {
            if self
                .create_logical_and_snapshot_partitions(RECOVERY_MAP_TIMEOUT)
                .is_err()
            {
                tracing::error!("unable to map partitions to complete merge");
                return false;
            }

            let process_callback = || {
                if let Some(callback) = callback {
                    callback();
                }
                true
            };
            state = self.process_update_state_on_data_wipe(Some(&process_callback));
            if state == UpdateState::MergeFailed {
                return false;
            }

            // Nothing should depend on the partitions now.
            if self.unmap_all_partitions().is_err() {
                tracing::error!("unable to unmap all partitions; flashing may fail");
            }
        }

        if state != UpdateState::None {
            let Ok(lock) = self.lock_exclusive() else {
                return false;
            };
            // Zap the state so the bootloader no longer thinks a merge is
            // running. Informative only at this point.
            let _ = self.write_update_state(&lock, UpdateState::None, MergeFailureCode::Ok);
        }
        true
    }

    /// Run a pending merge to completion in recovery.
    pub fn finish_merge_in_recovery(&self) -> SnapResult<()> {
        if !self.device.is_recovery() {
            return Err(SnapError::InvalidState(
                "finishing a merge is only allowed in recovery".to_string(),
            ));
        }
        if !self.device.ensure_metadata_mounted()? {
            return Err(SnapError::Store("metadata not mounted".to_string()));
        }

        self.create_logical_and_snapshot_partitions(RECOVERY_MAP_TIMEOUT)?;

        let state = self.process_update_state();
        if state != UpdateState::MergeCompleted {
            return Err(SnapError::InvalidState(format!(
                "merge returned unexpected status {state}"
            )));
        }

        if self.unmap_all_partitions().is_err() {
            tracing::error!("unable to unmap all partitions; flashing may fail");
        }
        Ok(())
    }

    /// Poll the update to a terminal state during a data wipe, initiating a
    /// forward merge from `Unverified` when required.
    fn process_update_state_on_data_wipe(
        &self,
        callback: Option<&dyn Fn() -> bool>,
    ) -> UpdateState {
        loop {
            let state = self.process_update_state_with(callback, None);
            tracing::info!(%state, "processed update state in recovery");
            match state {
                UpdateState::MergeFailed => {
                    tracing::error!("unrecoverable merge failure detected");
                    return state;
                }
                UpdateState::Unverified => {
                    // Reached only when a forward merge is authorized; once
                    // initiated, the next poll cannot return here.
                    if self.initiate_merge().is_err() {
                        tracing::error!("failed to initiate merge on data wipe");
                        return UpdateState::MergeFailed;
                    }
                }
                UpdateState::MergeNeedsReboot => {
                    // Nothing depends on logical partitions in recovery.
                    tracing::error!("unexpected merge-needs-reboot state in recovery");
                    return state;
                }
                state => return state,
            }
        }
    }

    // ========================================================================
    // INIT TRANSITIONS
    // ========================================================================

    /// Collect daemon launch arguments for the policy transition.
    pub fn prepare_daemon_args_for_selinux(&self, argv: &mut Vec<String>) -> SnapResult<()> {
        self.perform_init_transition(InitTransition::SelinuxDetach, Some(argv))
    }

    /// Hand the dm-user devices over to the second-stage daemon.
    pub fn perform_second_stage_transition(&self) -> SnapResult<()> {
        self.perform_init_transition(InitTransition::SecondStage, None)
    }

    /// Rewrite every dm-user table to its post-init misc name so the
    /// second-stage daemon can serve it. Every device must transition;
    /// otherwise I/O to the missed one would dead-end.
    fn perform_init_transition(
        &self,
        transition: InitTransition,
        mut argv: Option<&mut Vec<String>>,
    ) -> SnapResult<()> {
        tracing::info!(?transition, "performing daemon transition");

        if transition == InitTransition::SecondStage {
            // SelinuxDetach runs inside init, where connecting would
            // deadlock; it only emits arguments.
            self.ensure_daemon_connected()?;
        }

        let lock = self.lock_exclusive()?;
        let snapshots = self.store.list_snapshots(&lock, None)?;
        let userspace = self.uses_userspace_snapshots(&lock);
        let driver = self.snapshot_driver(&lock);

        if userspace && transition == InitTransition::SelinuxDetach {
            if let Some(argv) = argv.as_mut() {
                argv.push("-user_snapshot".to_string());
                let global = self.store.read_global(&lock);
                if global.io_uring {
                    argv.push("-io_uring".to_string());
                }
                if global.o_direct {
                    argv.push("-o_direct".to_string());
                }
                if global.cow_op_merge_size != 0 {
                    argv.push(format!("-cow_op_merge_size={}", global.cow_op_merge_size));
                }
                if global.worker_count != 0 {
                    argv.push(format!("-worker_count={}", global.worker_count));
                }
                if global.verify_block_size != 0 {
                    argv.push(format!("-verify_block_size={}", global.verify_block_size));
                }
                if global.verification_threads != 0 {
                    argv.push(format!(
                        "-num_verify_threads={}",
                        global.verification_threads
                    ));
                }
            }
        }

        let mut num_cows = 0usize;
        let mut ok_cows = 0usize;
        for snapshot in &snapshots {
            let user_cow_name = self.dm_user_cow_name(snapshot, driver);
            if self.stack.state(&user_cow_name) == DeviceState::Invalid {
                continue;
            }
            let Some(entry) = self.single_target_entry(&user_cow_name) else {
                continue;
            };
            if entry.spec.target_type() != "user" {
                tracing::error!(device = %user_cow_name, target_type = entry.spec.target_type(),
                    "unexpected target type");
                continue;
            }

            num_cows += 1;

            let status = match self.store.read_snapshot(&lock, snapshot) {
                Ok(status) => status,
                Err(err) => {
                    tracing::error!(snapshot = %snapshot, %err, "unable to read snapshot record");
                    continue;
                }
            };

            // The undecorated name is the post-transition misc name.
            let misc_name = user_cow_name.clone();

            let source_name = if status.old_partition_size > 0 {
                source_device_name(snapshot)
            } else {
                base_device_name(snapshot)
            };
            let Ok(source_device) = self.stack.device_path(&source_name) else {
                tracing::error!(device = %source_name, "could not get device path");
                continue;
            };
            let Ok(base_path_merge) = self.stack.device_path(&base_device_name(snapshot)) else {
                tracing::error!(snapshot = %snapshot, "could not get base device path");
                continue;
            };
            let cow_mapped = mapped_cow_device_name(snapshot, &status);
            let Ok(cow_device) = self.mapped_device_path(&cow_mapped) else {
                tracing::error!(device = %cow_mapped, "could not get COW device path");
                continue;
            };

            if transition == InitTransition::SelinuxDetach {
                if let Some(argv) = argv.as_mut() {
                    let mut message = format!(
                        "{misc_name},{},{}",
                        cow_device.display(),
                        source_device.display()
                    );
                    if userspace {
                        message.push(',');
                        message.push_str(&base_path_merge.display().to_string());
                    }
                    argv.push(message);
                }
                // The replacement daemon has not started; do not connect.
                // Waiting for its misc device happens after exec.
                ok_cows += 1;
                continue;
            }

            let table = TableSpec::single(
                entry.num_sectors,
                TargetSpec::User {
                    misc_name: misc_name.clone(),
                },
            );
            if self
                .stack
                .load_table_and_activate(&user_cow_name, &table)
                .is_err()
            {
                tracing::error!(device = %user_cow_name, "unable to swap dm-user tables");
                continue;
            }
            if self
                .stack
                .wait_for_path(
                    &Self::control_device_path(&misc_name),
                    CONTROL_DEVICE_TIMEOUT,
                )
                .is_err()
            {
                tracing::error!(misc = %misc_name, "dm-user control device not found");
                continue;
            }

            let init_result = self.with_daemon(|daemon| {
                if userspace {
                    daemon.init_user_cow(
                        &misc_name,
                        &cow_device.to_string_lossy(),
                        &source_device.to_string_lossy(),
                        Some(&base_path_merge.to_string_lossy()),
                    )
                } else {
                    daemon.init_user_cow(
                        &misc_name,
                        &cow_device.to_string_lossy(),
                        &source_device.to_string_lossy(),
                        None,
                    )
                }
            });
            if let Err(err) = init_result {
                // Unrecoverable: reads from the COW metadata failed.
                return Err(SnapError::Daemon(format!(
                    "failed to initialize daemon for {misc_name}: {err}"
                )));
            }

            if let Err(err) = self.with_daemon(|daemon| daemon.attach(&misc_name)) {
                // Unrecoverable: reads to the underlying device would fail.
                return Err(SnapError::Daemon(format!(
                    "could not attach daemon for {user_cow_name}: {err}"
                )));
            }

            ok_cows += 1;
        }

        if ok_cows != num_cows {
            return Err(SnapError::Daemon(
                "could not transition all daemon consumers".to_string(),
            ));
        }
        Ok(())
    }

    /// Swap every first-stage dm-user table to its undecorated misc name so
    /// the next daemon instance can pick the devices up.
    pub fn detach_first_stage_daemon(&self) -> SnapResult<()> {
        tracing::info!("detaching first-stage daemon");

        let lock = self.lock_exclusive()?;
        let snapshots = self.store.list_snapshots(&lock, None)?;
        let driver = self.snapshot_driver(&lock);

        let mut num_cows = 0usize;
        let mut ok_cows = 0usize;
        for snapshot in &snapshots {
            let user_cow_name = self.dm_user_cow_name(snapshot, driver);
            if self.stack.state(&user_cow_name) == DeviceState::Invalid {
                continue;
            }
            let Some(entry) = self.single_target_entry(&user_cow_name) else {
                continue;
            };
            if entry.spec.target_type() != "user" {
                tracing::error!(device = %user_cow_name, target_type = entry.spec.target_type(),
                    "unexpected target type");
                continue;
            }
            num_cows += 1;

            let misc_name = user_cow_name.clone();
            let table = TableSpec::single(
                entry.num_sectors,
                TargetSpec::User {
                    misc_name: misc_name.clone(),
                },
            );
            if self
                .stack
                .load_table_and_activate(&user_cow_name, &table)
                .is_err()
            {
                tracing::error!(device = %user_cow_name, "unable to swap dm-user tables");
                continue;
            }
            if self
                .stack
                .wait_for_path(
                    &Self::control_device_path(&misc_name),
                    CONTROL_DEVICE_TIMEOUT,
                )
                .is_err()
            {
                tracing::error!(misc = %misc_name, "dm-user control device not found");
                continue;
            }
            tracing::info!(misc = %misc_name, "control device is ready");
            ok_cows += 1;
        }

        if ok_cows != num_cows {
            return Err(SnapError::Daemon(
                "could not transition all daemon consumers".to_string(),
            ));
        }
        Ok(())
    }

    // ========================================================================
    // BOOT WITHOUT SLOT SWITCH
    // ========================================================================

    /// Mark the device to boot from snapshots applied in place, with no slot
    /// switch.
    pub fn boot_from_snapshots_without_slot_switch(&self) -> SnapResult<()> {
        let lock = self.lock_exclusive()?;

        self.store.write_indicator(
            &self.store.layout().boot_without_slot_switch(),
            &self.device.slot_suffix(),
        )?;

        let mut global = self.store.read_global(&lock);
        global.state = UpdateState::Initiated;
        global.userspace_snapshots = true;
        global.using_daemon = true;
        self.write_global_status(&lock, &global)
    }

    /// Undo the in-place snapshot arrangement and boot from plain blocks.
    pub fn prepare_device_to_boot_without_snapshot(&self) -> SnapResult<()> {
        let lock = self.lock_exclusive()?;

        self.store
            .remove_indicator(&self.store.layout().boot_indicator())?;
        self.store
            .remove_indicator(&self.store.layout().boot_without_slot_switch())?;

        let mut global = self.store.read_global(&lock);
        global.state = UpdateState::Cancelled;
        self.write_global_status(&lock, &global)
    }
}

/// The device actually holding the COW: the stitched device normally, the
/// bare image when the COW lives entirely in a file.
fn mapped_cow_device_name(snapshot: &str, status: &SnapshotStatus) -> String {
    if status.cow_partition_size == 0 {
        cow_image_name(snapshot)
    } else {
        cow_device_name(snapshot)
    }
}
