//! The global update state machine: begin, create, finalize, cancel.

use std::collections::HashMap;

use crate::error::{CancelResult, MergeFailureCode, SnapError, SnapResult};
use crate::manager::SnapshotManager;
use crate::planner::{round_up_to_sector, UpdateManifest};
use crate::slot::{slot_number_for_suffix, Slot};
use crate::state::{SnapshotStatus, UpdateState};
use crate::store::DirLock;

impl SnapshotManager {
    /// Current update state, for callers that only need the answer.
    pub fn update_state(&self) -> UpdateState {
        match self.lock_shared() {
            Ok(lock) => self.read_update_state(&lock),
            Err(_) => UpdateState::None,
        }
    }

    // ========================================================================
    // BEGIN / CREATE / FINISH
    // ========================================================================

    /// Start a new update. Any cancellable leftover state is cleared first;
    /// a still-running merge is waited out.
    pub fn begin_update(&self) -> SnapResult<()> {
        match self.try_cancel_update() {
            CancelResult::Ok => {}
            CancelResult::NeedsMerge => {
                tracing::info!("waiting for in-flight merge before beginning a new update");
                let state = self.process_update_state();
                tracing::info!(%state, "merge settled");
            }
            result => {
                return Err(SnapError::InvalidState(format!(
                    "cannot begin update, existing update cannot be cancelled: {result}"
                )));
            }
        }

        let lock = self.lock_exclusive()?;

        // Purge stale backing images in case a corrupt artifact is lying
        // around; the update can proceed even if this fails.
        if let Err(err) = self.images.remove_all_images() {
            tracing::warn!(%err, "failed to purge stale backing images");
        }
        self.clear_old_metadata_cache();
        self.reset_driver_cache();

        let state = self.read_update_state(&lock);
        if state != UpdateState::None {
            return Err(SnapError::InvalidState(format!(
                "an update is already in progress ({state}), cannot begin a new one"
            )));
        }
        self.write_update_state(&lock, UpdateState::Initiated, MergeFailureCode::Ok)
    }

    /// Provision snapshot records and COW storage for every partition in the
    /// manifest, sized by the planner.
    pub fn create_update_snapshots(&self, manifest: &UpdateManifest) -> SnapResult<()> {
        let lock = self.lock_exclusive()?;

        let state = self.read_update_state(&lock);
        if state != UpdateState::Initiated {
            return Err(SnapError::InvalidState(format!(
                "can only create snapshots from the initiated state, not {state}"
            )));
        }

        let mut global = self.store.read_global(&lock);
        let opts = &manifest.options;
        global.using_daemon = opts.using_daemon;
        global.userspace_snapshots = opts.userspace_snapshots;
        global.legacy_compat = opts.legacy_compat;
        global.io_uring = opts.io_uring;
        global.o_direct = opts.o_direct;
        global.skip_verification = opts.skip_verification;
        global.cow_op_merge_size = opts.cow_op_merge_size;
        global.worker_count = opts.worker_count;
        global.verify_block_size = opts.verify_block_size;
        global.verification_threads = opts.verification_threads;
        self.write_global_status(&lock, &global)?;
        self.reset_driver_cache();

        // Preserve the source view of super; resized partitions need it to
        // map their old blocks after the slot switch.
        let source_slot = slot_number_for_suffix(&self.device.slot_suffix());
        let old_metadata = self.device.read_current_metadata(source_slot)?;
        crate::store::write_atomic(
            &self.store.layout().old_partition_metadata(),
            &old_metadata.encode()?,
        )?;

        for (index, partition) in manifest.partitions.iter().enumerate() {
            // A previous attempt may have left records behind.
            if self.store.snapshot_file_exists(&partition.name) {
                self.delete_snapshot(&lock, &partition.name)?;
            }

            let plan = self.planner.plan(partition, opts)?;
            let mut status = SnapshotStatus {
                name: partition.name.clone(),
                device_size: partition.size,
                snapshot_size: partition.size,
                cow_partition_size: plan.cow_partition_size,
                cow_file_size: round_up_to_sector(plan.cow_file_size),
                old_partition_size: partition.old_size,
                using_daemon: opts.using_daemon,
                compression_algorithm: plan.compression_algorithm.clone(),
                compression_factor: plan.compression_factor,
                read_ahead_size: plan.read_ahead_size,
                enable_threading: plan.enable_threading,
                batched_writes: plan.batched_writes,
                estimated_cow_size: plan.estimated_cow_size,
                estimated_ops_buffer_size: plan.estimated_ops_buffer_size,
                ..Default::default()
            };
            self.create_snapshot(&lock, &mut status)?;

            if status.cow_file_size > 0 {
                if let Err(err) = self.create_cow_image(&lock, &partition.name) {
                    // Report the whole remaining requirement, not just the
                    // allocation that tipped over.
                    if let SnapError::NoSpace { required } = err {
                        let remaining: u64 = manifest.partitions[index + 1..]
                            .iter()
                            .map(|p| {
                                self.planner
                                    .plan(p, opts)
                                    .map(|plan| round_up_to_sector(plan.cow_file_size))
                                    .unwrap_or(0)
                            })
                            .sum();
                        return Err(SnapError::NoSpace {
                            required: required + remaining,
                        });
                    }
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Finalize the update: snapshot writes are complete and the device may
    /// reboot into the new slot.
    pub fn finished_snapshot_writes(&self, wipe: bool) -> SnapResult<()> {
        let lock = self.lock_exclusive()?;

        let state = self.read_update_state(&lock);
        if state == UpdateState::Unverified {
            tracing::info!("finished_snapshot_writes already called, ignored");
            return Ok(());
        }
        if state != UpdateState::Initiated {
            return Err(SnapError::InvalidState(format!(
                "can only transition to unverified from initiated, not {state}"
            )));
        }

        self.ensure_no_overflow_snapshot(&lock)?;
        self.update_forward_merge_indicator(wipe)?;

        // The rollback indicator is written on boot to detect a rollback. It
        // must not exist before rebooting or snapshots could be deleted too
        // early.
        self.store
            .remove_indicator(&self.store.layout().rollback_indicator())?;

        // Doubles as a quick first-stage hint and as the record of the old
        // slot, which is how a later boot tells source from target.
        self.store.write_indicator(
            &self.store.layout().boot_indicator(),
            &self.device.slot_suffix(),
        )?;

        self.write_update_state(&lock, UpdateState::Unverified, MergeFailureCode::Ok)
    }

    // ========================================================================
    // CANCEL
    // ========================================================================

    /// Cancel the update if it is safe to do so.
    pub fn cancel_update(&self) -> bool {
        self.try_cancel_update() == CancelResult::Ok
    }

    /// Attempt to cancel, reporting why cancellation is impossible when it
    /// is. Recovery overrides the refusals so data-wipe flows can proceed.
    pub fn try_cancel_update(&self) -> CancelResult {
        let Ok(lock) = self.lock_exclusive() else {
            return CancelResult::Error;
        };

        let state = self.read_update_state(&lock);
        let mut result = self.cancel_safety(state);

        if result != CancelResult::Ok && self.device.is_recovery() {
            tracing::error!(%result, "cancel result overridden in recovery");
            result = CancelResult::Ok;
        }

        match result {
            CancelResult::Ok => {
                tracing::info!(%state, "cancelling update");
                if let Err(err) = self.remove_all_update_state(&lock, None) {
                    tracing::error!(%err, "failed to remove update state during cancel");
                    return CancelResult::Error;
                }
                self.remove_invalid_snapshots(&lock);
            }
            CancelResult::NeedsMerge => {
                tracing::error!("cannot cancel an update while a merge is in progress");
            }
            CancelResult::LiveSnapshots => {
                tracing::error!("cannot cancel an update while snapshots are live");
            }
            CancelResult::Error => {}
        }
        result
    }

    /// Whether a cancel would succeed right now.
    pub fn is_cancel_update_safe(&self) -> bool {
        match self.device.ensure_metadata_mounted() {
            Ok(true) => {}
            // No metadata at all: nothing to protect.
            Ok(false) | Err(_) => return true,
        }
        let Ok(lock) = self.lock_exclusive() else {
            return false;
        };
        let state = self.read_update_state(&lock);
        self.cancel_safety(state) == CancelResult::Ok
    }

    pub(crate) fn cancel_safety(&self, state: UpdateState) -> CancelResult {
        if self.is_snapshot_without_slot_switch() {
            return CancelResult::LiveSnapshots;
        }
        match state {
            UpdateState::Merging | UpdateState::MergeNeedsReboot | UpdateState::MergeFailed => {
                CancelResult::NeedsMerge
            }
            UpdateState::Unverified => {
                // Finalized, but still cancellable until the new slot boots.
                if self.current_slot() == Slot::Target {
                    CancelResult::LiveSnapshots
                } else {
                    CancelResult::Ok
                }
            }
            UpdateState::None | UpdateState::Initiated | UpdateState::Cancelled => CancelResult::Ok,
            UpdateState::MergeCompleted => {
                tracing::error!(%state, "unexpected state for cancel");
                CancelResult::Error
            }
        }
    }

    // ========================================================================
    // TEARDOWN
    // ========================================================================

    /// Remove every snapshot, indicator, and the global record. Idempotent:
    /// repeated calls converge on `state == None` with no residue.
    pub(crate) fn remove_all_update_state(
        &self,
        lock: &DirLock,
        prolog: Option<&dyn Fn() -> bool>,
    ) -> SnapResult<()> {
        if let Some(prolog) = prolog {
            if !prolog() {
                return Err(SnapError::InvalidState(
                    "cannot remove update state: prolog failed".to_string(),
                ));
            }
        }

        tracing::info!("removing all update state");

        if self.read_update_state(lock) != UpdateState::None {
            // Only worth doing when an update actually existed; the image
            // store scan is not free on a normal boot.
            self.remove_all_snapshots(lock)?;
        }

        // Removal failures here are tolerable: first-stage init performs a
        // deeper check after reading the boot and rollback indicators, and
        // finalize re-asserts the forward-merge indicator.
        let layout = self.store.layout();
        for path in [
            layout.boot_indicator(),
            layout.rollback_indicator(),
            layout.forward_merge_indicator(),
            layout.old_partition_metadata(),
            layout.boot_without_slot_switch(),
            layout.daemon_from_system(),
        ] {
            if let Err(err) = self.store.remove_indicator(&path) {
                tracing::error!(path = %path.display(), %err, "remove failed");
            }
        }

        // If this fails we keep retrying on reboot or at the next update
        // until it finally sticks.
        self.write_update_state(lock, UpdateState::None, MergeFailureCode::Ok)
    }

    /// Unmap and delete all snapshots, respecting which slot is live.
    pub(crate) fn remove_all_snapshots(&self, lock: &DirLock) -> SnapResult<()> {
        let snapshots = self.store.list_snapshots(lock, None)?;

        let flashing = match self.snapshot_flashing_status(lock, &snapshots) {
            Ok(flashing) => flashing,
            Err(err) => {
                tracing::warn!(%err, "failed to get flashing status");
                HashMap::new()
            }
        };

        let current_slot = self.current_slot();
        let mut ok = true;
        for name in &snapshots {
            // Booting from the target slot, partitions are mounted off the
            // collapsed devices; unmapping them would take the system down.
            let mut should_unmap = current_slot != Slot::Target;
            let should_delete = self.should_delete_snapshot(&flashing, current_slot, name);

            if should_unmap && name.ends_with(&self.device.slot_suffix()) {
                // A snapshot on the active slot should not exist; if it is
                // not really a snapshot, skip the unmap step.
                if self.stack.state(name) == crate::device::DeviceState::Invalid
                    || !self.is_snapshot_device(name)
                {
                    tracing::error!(
                        snapshot = %name,
                        slot = %current_slot,
                        "snapshot found for active partition; removing without unmap"
                    );
                    should_unmap = false;
                }
            }

            let mut partition_ok = true;
            if should_unmap && self.unmap_partition_with_snapshot(lock, name).is_err() {
                partition_ok = false;
            }
            if partition_ok && should_delete && self.delete_snapshot(lock, name).is_err() {
                partition_ok = false;
            }
            if !partition_ok {
                ok = false;
            }
        }

        if ok {
            if self.device.is_recovery() {
                // Images cannot be deleted in recovery; mark them for cleanup
                // on the next boot.
                self.images.disable_all_images()?;
            } else {
                self.images.remove_all_images()?;
            }
            Ok(())
        } else {
            Err(SnapError::Store(
                "could not remove all snapshots".to_string(),
            ))
        }
    }

    fn should_delete_snapshot(
        &self,
        flashing: &HashMap<String, bool>,
        current_slot: Slot,
        name: &str,
    ) -> bool {
        if current_slot != Slot::Target {
            return true;
        }
        match flashing.get(name) {
            None => {
                tracing::warn!(snapshot = name, "cannot determine flashing status");
                true
            }
            // Re-flashed: the snapshot is obsolete regardless.
            Some(true) => true,
            Some(false) => !self.is_snapshot_device(name),
        }
    }

    /// Delete records for current-slot snapshots whose mapped device is no
    /// longer a snapshot target.
    pub(crate) fn remove_invalid_snapshots(&self, lock: &DirLock) {
        let Ok(snapshots) = self
            .store
            .list_snapshots(lock, Some(&self.device.slot_suffix()))
        else {
            return;
        };
        for name in snapshots {
            if self.stack.state(&name) == crate::device::DeviceState::Active
                && !self.is_snapshot_device(&name)
            {
                match self.delete_snapshot(lock, &name) {
                    Ok(()) => tracing::info!(snapshot = %name, "invalid snapshot deleted"),
                    Err(err) => {
                        tracing::error!(snapshot = %name, %err, "failed to delete invalid snapshot")
                    }
                }
            }
        }
    }

    // ========================================================================
    // ROLLBACK AND RE-FLASH DETECTION
    // ========================================================================

    /// Detect a cancelled update from the unverified state: either every
    /// partition was re-flashed, or the device rolled back to the source
    /// slot. Returns true when the update state was removed.
    pub(crate) fn handle_cancelled_update(
        &self,
        lock: &DirLock,
        before_cancel: Option<&dyn Fn() -> bool>,
    ) -> bool {
        if self.current_slot() == Slot::Unknown {
            return false;
        }

        if self.are_all_snapshots_cancelled(lock) {
            tracing::warn!("detected re-flashing, cancelling unverified update");
            return self.remove_all_update_state(lock, before_cancel).is_ok();
        }

        let current_slot = self.current_slot();
        if current_slot != Slot::Source {
            tracing::info!(slot = %current_slot, "update state processed while booting, no action");
            return false;
        }

        // Source slot: only a rollback (flagged by first-stage boot) means
        // the update is dead. Before the reboot this is just a normal query.
        if !self.store.layout().rollback_indicator().exists() {
            tracing::info!("rollback indicator not detected, no action");
            return false;
        }

        tracing::warn!("detected rollback, cancelling unverified update");
        self.remove_all_update_state(lock, before_cancel).is_ok()
    }

    pub(crate) fn are_all_snapshots_cancelled(&self, lock: &DirLock) -> bool {
        let snapshots = match self.store.list_snapshots(lock, None) {
            Ok(snapshots) => snapshots,
            Err(err) => {
                tracing::warn!(%err, "failed to list snapshots, assuming none");
                return true;
            }
        };
        let flashing = match self.snapshot_flashing_status(lock, &snapshots) {
            Ok(flashing) => flashing,
            Err(err) => {
                tracing::warn!(%err, "cannot determine flashing status, not removing state");
                return false;
            }
        };
        let all_cancelled = flashing.values().all(|flashed| *flashed);
        if all_cancelled {
            tracing::warn!("all partitions re-flashed after update");
        }
        all_cancelled
    }

    /// Which snapshots cover partitions that were flashed over since the
    /// update (true = re-flashed, snapshot obsolete).
    ///
    /// Target-slot metadata is authoritative: flashing any slot clears the
    /// updated attribute on all metadata copies.
    pub(crate) fn snapshot_flashing_status(
        &self,
        _lock: &DirLock,
        snapshots: &[String],
    ) -> SnapResult<HashMap<String, bool>> {
        let source_suffix = self.update_source_slot_suffix().ok_or_else(|| {
            SnapError::Metadata("no boot indicator to derive the target slot".to_string())
        })?;
        let source_slot = slot_number_for_suffix(&source_suffix);
        let target_slot = 1 - source_slot;
        let metadata = self.device.read_current_metadata(target_slot)?;

        let mut out = HashMap::new();
        for name in snapshots {
            let flashed =
                metadata.partition_state(name) != crate::metadata::PartitionState::Updated;
            if flashed {
                tracing::warn!(partition = %name, "detected re-flashing");
            }
            out.insert(name.clone(), flashed);
        }
        Ok(out)
    }

    // ========================================================================
    // FINALIZE SUPPORT
    // ========================================================================

    /// Fail if any kernel snapshot overflowed its COW; that means the sizing
    /// computation was wrong and the update must not be finalized.
    pub(crate) fn ensure_no_overflow_snapshot(&self, lock: &DirLock) -> SnapResult<()> {
        let snapshots = self.store.list_snapshots(lock, None)?;
        for name in snapshots {
            let status = self.store.read_snapshot(lock, &name)?;
            if status.using_daemon {
                continue;
            }
            let targets = self.stack.table_status(&name)?;
            if targets.len() != 1 {
                return Err(SnapError::Device(format!(
                    "unexpected device-mapper table for snapshot {name}: {} targets",
                    targets.len()
                )));
            }
            if targets[0].is_overflow() {
                return Err(SnapError::InvalidState(format!(
                    "detected overflow in snapshot {name}, COW size computation is wrong"
                )));
            }
        }
        Ok(())
    }

    fn update_forward_merge_indicator(&self, wipe: bool) -> SnapResult<()> {
        let path = self.store.layout().forward_merge_indicator();
        if !wipe {
            tracing::info!("wipe is not scheduled, deleting forward merge indicator");
            return self.store.remove_indicator(&path);
        }
        tracing::info!("wipe will be scheduled, allowing forward merge of snapshots");
        self.store.write_indicator(&path, "1")
    }

    /// Record that the first-stage daemon binary came from the system
    /// partition and can handle userspace snapshots.
    pub fn mark_daemon_from_system(&self) -> SnapResult<()> {
        self.store
            .write_indicator(&self.store.layout().daemon_from_system(), "1")
    }
}
