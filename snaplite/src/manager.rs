//! The snapshot manager: the single value owning all update state.
//!
//! All process-wide state — the persisted file set, the cached old-partition
//! metadata, the daemon connection — lives in fields of [`SnapshotManager`].
//! The manager is constructed through [`SnapshotManagerBuilder`] with the
//! capabilities it depends on.

use std::cell::{Cell, RefCell};
use std::io::Write;
use std::time::Duration;

use crate::device::{BlockStack, CowDaemon, CowDaemonFactory};
use crate::error::{MergeFailureCode, SnapError, SnapResult};
use crate::images::CowImageStore;
use crate::metadata::SuperMetadata;
use crate::planner::CowPlanner;
use crate::slot::{slot_number_for_suffix, DeviceInfo, MergeIndicator, Slot};
use crate::state::{GlobalStatus, UpdateState};
use crate::store::{DirLock, MetadataLayout, MetadataStore};

/// How long to wait for the daemon socket when a connection is first needed.
pub(crate) const DAEMON_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Which block-layer backend serves snapshots for this update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotDriver {
    /// Kernel dm-snapshot; dm-user (if any) only backs the COW device.
    Kernel,
    /// dm-user devices are the snapshot devices, driven by the daemon.
    Userspace,
}

/// Orchestrates the snapshot lifecycle for seamless updates.
pub struct SnapshotManager {
    pub(crate) store: MetadataStore,
    pub(crate) images: CowImageStore,
    pub(crate) device: Box<dyn DeviceInfo>,
    pub(crate) stack: Box<dyn BlockStack>,
    pub(crate) daemon_factory: Box<dyn CowDaemonFactory>,
    pub(crate) planner: Box<dyn CowPlanner>,

    pub(crate) daemon: RefCell<Option<Box<dyn CowDaemon>>>,
    pub(crate) old_metadata: RefCell<Option<SuperMetadata>>,
    userspace_cache: Cell<Option<bool>>,
    legacy_cache: Cell<Option<bool>>,

    /// Use the first-stage misc decoration when talking to the daemon.
    pub(crate) first_stage_daemon: bool,
}

impl SnapshotManager {
    pub fn builder() -> SnapshotManagerBuilder {
        SnapshotManagerBuilder::default()
    }

    pub fn lock_shared(&self) -> SnapResult<DirLock> {
        self.store.lock_shared()
    }

    pub fn lock_exclusive(&self) -> SnapResult<DirLock> {
        self.store.lock_exclusive()
    }

    // ========================================================================
    // SLOT IDENTITY
    // ========================================================================

    /// The slot suffix that was current when the update was finalized, from
    /// the boot indicator.
    pub fn update_source_slot_suffix(&self) -> Option<String> {
        self.store
            .read_indicator(&self.store.layout().boot_indicator())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    /// Where this boot stands relative to the pending update.
    pub fn current_slot(&self) -> Slot {
        match self.update_source_slot_suffix() {
            None => Slot::Unknown,
            Some(source) if source == self.device.slot_suffix() => Slot::Source,
            Some(_) => Slot::Target,
        }
    }

    /// The slot suffix snapshots are named with: the current suffix when
    /// booted from the target slot, the other one otherwise.
    pub fn snapshot_slot_suffix(&self) -> String {
        match self.current_slot() {
            Slot::Target => self.device.slot_suffix(),
            _ => self.device.other_slot_suffix(),
        }
    }

    pub fn is_snapshot_without_slot_switch(&self) -> bool {
        self.store.layout().boot_without_slot_switch().exists()
    }

    pub(crate) fn has_forward_merge_indicator(&self) -> bool {
        self.store.layout().forward_merge_indicator().exists()
    }

    // ========================================================================
    // GLOBAL STATE ACCESS
    // ========================================================================

    pub(crate) fn read_update_state(&self, lock: &DirLock) -> UpdateState {
        self.store.read_global(lock).state
    }

    /// Write a new update state, carrying forward the fields that survive
    /// valid-to-valid transitions (driver selection, fingerprint, merge
    /// phase, tuning). Begin and end of an update start from a clean record.
    pub(crate) fn write_update_state(
        &self,
        lock: &DirLock,
        state: UpdateState,
        failure_code: MergeFailureCode,
    ) -> SnapResult<()> {
        let mut status = GlobalStatus {
            state,
            ..Default::default()
        };
        match state {
            UpdateState::MergeFailed => status.merge_failure_code = failure_code,
            UpdateState::Initiated => {
                status.source_build_fingerprint = self.device.build_fingerprint();
            }
            _ => {}
        }

        if !matches!(state, UpdateState::Initiated | UpdateState::None) {
            let old = self.store.read_global(lock);
            status.using_daemon = old.using_daemon;
            status.source_build_fingerprint = old.source_build_fingerprint;
            status.merge_phase = old.merge_phase;
            status.userspace_snapshots = old.userspace_snapshots;
            status.legacy_compat = old.legacy_compat;
            status.io_uring = old.io_uring;
            status.o_direct = old.o_direct;
            status.skip_verification = old.skip_verification;
            status.cow_op_merge_size = old.cow_op_merge_size;
            status.worker_count = old.worker_count;
            status.verify_block_size = old.verify_block_size;
            status.verification_threads = old.verification_threads;
        }

        self.write_global_status(lock, &status)
    }

    /// Write the full global record, ordering the bootloader merge-status
    /// bit against the file write so the bit never falsely reports that a
    /// wipe is safe.
    pub(crate) fn write_global_status(
        &self,
        lock: &DirLock,
        status: &GlobalStatus,
    ) -> SnapResult<()> {
        let indicator = match status.state {
            UpdateState::Unverified => MergeIndicator::Snapshotted,
            UpdateState::Merging | UpdateState::MergeFailed => MergeIndicator::Merging,
            // Cancelled is a transient answer to callers; it is never
            // persisted, but map it to the safe value regardless.
            _ => MergeIndicator::None,
        };

        let set_before = indicator != MergeIndicator::None;
        if set_before && !self.device.set_merge_indicator(indicator) {
            return Err(SnapError::Device(
                "failed to raise bootloader merge status".to_string(),
            ));
        }

        self.store.write_global(lock, status)?;

        if !set_before && !self.device.set_merge_indicator(indicator) {
            return Err(SnapError::Device(
                "failed to clear bootloader merge status".to_string(),
            ));
        }
        Ok(())
    }

    // ========================================================================
    // DRIVER SELECTION
    // ========================================================================

    /// Whether this update runs on userspace snapshots. Cached after the
    /// first read: the value is written once at update creation and never
    /// changes during a merge.
    pub(crate) fn uses_userspace_snapshots(&self, lock: &DirLock) -> bool {
        if self.userspace_cache.get().is_none() {
            let status = self.store.read_global(lock);
            self.userspace_cache.set(Some(status.userspace_snapshots));
            self.legacy_cache.set(Some(status.legacy_compat));
        }
        if self.is_legacy_daemon_post_reboot() {
            return false;
        }
        self.userspace_cache.get().unwrap_or(false)
    }

    /// The vendor-compat rule: post reboot on the target slot, a vendor
    /// partition that predates the userspace driver forces the kernel path —
    /// unless the daemon-provenance marker shows the first-stage daemon came
    /// from the system partition and can handle userspace snapshots.
    fn is_legacy_daemon_post_reboot(&self) -> bool {
        if self.current_slot() != Slot::Target {
            return false;
        }
        if self.store.layout().daemon_from_system().exists() {
            self.userspace_cache.set(Some(true));
            return false;
        }
        self.legacy_cache.get() == Some(true)
    }

    pub(crate) fn snapshot_driver(&self, lock: &DirLock) -> SnapshotDriver {
        if self.uses_userspace_snapshots(lock) {
            SnapshotDriver::Userspace
        } else {
            SnapshotDriver::Kernel
        }
    }

    pub(crate) fn uses_daemon(&self, lock: &DirLock) -> bool {
        self.store.read_global(lock).using_daemon
    }

    /// Drop cached driver selection (a new update may choose differently).
    pub(crate) fn reset_driver_cache(&self) {
        self.userspace_cache.set(None);
        self.legacy_cache.set(None);
    }

    // ========================================================================
    // DAEMON CONNECTION
    // ========================================================================

    pub(crate) fn ensure_daemon_connected(&self) -> SnapResult<()> {
        if self.daemon.borrow().is_some() {
            return Ok(());
        }
        let daemon = self.daemon_factory.connect(DAEMON_CONNECT_TIMEOUT)?;
        *self.daemon.borrow_mut() = Some(daemon);
        Ok(())
    }

    /// Run one serialized call against the daemon connection.
    pub(crate) fn with_daemon<R>(
        &self,
        f: impl FnOnce(&mut dyn CowDaemon) -> SnapResult<R>,
    ) -> SnapResult<R> {
        self.ensure_daemon_connected()?;
        let mut guard = self.daemon.borrow_mut();
        let daemon = guard
            .as_mut()
            .ok_or_else(|| SnapError::Daemon("daemon connection lost".to_string()))?;
        f(daemon.as_mut())
    }

    pub(crate) fn disconnect_daemon(&self) {
        *self.daemon.borrow_mut() = None;
    }

    // ========================================================================
    // OLD PARTITION METADATA
    // ========================================================================

    /// The pre-update super metadata, read once and cached.
    pub(crate) fn read_old_partition_metadata(&self, _lock: &DirLock) -> SnapResult<SuperMetadata> {
        if let Some(metadata) = self.old_metadata.borrow().as_ref() {
            return Ok(metadata.clone());
        }
        let path = self.store.layout().old_partition_metadata();
        let bytes = std::fs::read(&path).map_err(|err| {
            SnapError::Metadata(format!(
                "could not read old partition metadata from {}: {err}",
                path.display()
            ))
        })?;
        let metadata = SuperMetadata::decode(&bytes)?;
        *self.old_metadata.borrow_mut() = Some(metadata.clone());
        Ok(metadata)
    }

    pub(crate) fn clear_old_metadata_cache(&self) {
        *self.old_metadata.borrow_mut() = None;
    }

    /// Read the current super metadata for the booted slot.
    pub(crate) fn read_current_metadata(&self) -> SnapResult<SuperMetadata> {
        let slot = slot_number_for_suffix(&self.device.slot_suffix());
        self.device.read_current_metadata(slot)
    }

    // ========================================================================
    // DIAGNOSTICS
    // ========================================================================

    /// Write a human-readable report of all update state. Takes only the
    /// shared lock; dump is for debugging and a racy read is acceptable.
    pub fn dump(&self, out: &mut dyn Write) -> SnapResult<()> {
        let lock = self.store.lock_shared()?;
        let status = self.store.read_global(&lock);

        writeln!(out, "Update state: {}", status.state)?;
        writeln!(out, "Using daemon: {}", status.using_daemon)?;
        writeln!(
            out,
            "Using userspace snapshots: {}",
            status.userspace_snapshots
        )?;
        writeln!(out, "Legacy compat: {}", status.legacy_compat)?;
        writeln!(out, "Using io_uring: {}", status.io_uring)?;
        writeln!(out, "Using o_direct: {}", status.o_direct)?;
        writeln!(out, "Skip verification: {}", status.skip_verification)?;
        writeln!(
            out,
            "Cow op merge size (0 for uncapped): {}",
            status.cow_op_merge_size
        )?;
        writeln!(out, "Worker thread count: {}", status.worker_count)?;
        writeln!(out, "Verify block size: {}", status.verify_block_size)?;
        writeln!(
            out,
            "Num verification threads: {}",
            status.verification_threads
        )?;
        writeln!(out, "Current slot: {}", self.device.slot_suffix())?;
        writeln!(out, "Boot indicator: booting from {} slot", self.current_slot())?;
        writeln!(
            out,
            "Rollback indicator: {}",
            if self.store.layout().rollback_indicator().exists() {
                "exists"
            } else {
                "none"
            }
        )?;
        writeln!(
            out,
            "Forward merge indicator: {}",
            if self.has_forward_merge_indicator() {
                "exists"
            } else {
                "none"
            }
        )?;
        writeln!(
            out,
            "Source build fingerprint: {}",
            status.source_build_fingerprint
        )?;
        if status.state == UpdateState::Merging {
            writeln!(out, "Merge phase: {}", status.merge_phase)?;
        }

        for name in self.store.list_snapshots(&lock, None)? {
            writeln!(out, "Snapshot: {name}")?;
            let snapshot = match self.store.read_snapshot(&lock, &name) {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    writeln!(out, "    unreadable: {err}")?;
                    continue;
                }
            };
            writeln!(out, "    state: {}", snapshot.state)?;
            writeln!(out, "    device size (bytes): {}", snapshot.device_size)?;
            writeln!(out, "    snapshot size (bytes): {}", snapshot.snapshot_size)?;
            writeln!(
                out,
                "    cow partition size (bytes): {}",
                snapshot.cow_partition_size
            )?;
            writeln!(out, "    cow file size (bytes): {}", snapshot.cow_file_size)?;
            writeln!(out, "    allocated sectors: {}", snapshot.sectors_allocated)?;
            writeln!(out, "    metadata sectors: {}", snapshot.metadata_sectors)?;
            writeln!(out, "    compression: {}", snapshot.compression_algorithm)?;
            writeln!(out, "    merge phase: {}", snapshot.merge_phase())?;
        }
        Ok(())
    }
}

/// Builder for [`SnapshotManager`].
#[derive(Default)]
pub struct SnapshotManagerBuilder {
    metadata_dir: Option<std::path::PathBuf>,
    device: Option<Box<dyn DeviceInfo>>,
    stack: Option<Box<dyn BlockStack>>,
    daemon_factory: Option<Box<dyn CowDaemonFactory>>,
    planner: Option<Box<dyn CowPlanner>>,
    first_stage_daemon: bool,
}

impl SnapshotManagerBuilder {
    pub fn metadata_dir(mut self, dir: impl Into<std::path::PathBuf>) -> Self {
        self.metadata_dir = Some(dir.into());
        self
    }

    pub fn device(mut self, device: Box<dyn DeviceInfo>) -> Self {
        self.device = Some(device);
        self
    }

    pub fn block_stack(mut self, stack: Box<dyn BlockStack>) -> Self {
        self.stack = Some(stack);
        self
    }

    pub fn daemon_factory(mut self, factory: Box<dyn CowDaemonFactory>) -> Self {
        self.daemon_factory = Some(factory);
        self
    }

    pub fn planner(mut self, planner: Box<dyn CowPlanner>) -> Self {
        self.planner = Some(planner);
        self
    }

    /// Build a manager for first-stage mount: daemon misc names carry the
    /// init decoration until the second-stage handoff.
    pub fn first_stage_daemon(mut self, first_stage: bool) -> Self {
        self.first_stage_daemon = first_stage;
        self
    }

    pub fn build(self) -> SnapResult<SnapshotManager> {
        let metadata_dir = self
            .metadata_dir
            .ok_or_else(|| SnapError::Store("metadata directory is required".to_string()))?;
        let layout = MetadataLayout::new(metadata_dir);
        layout.prepare()?;
        let images = CowImageStore::new(layout.cow_images_dir());

        Ok(SnapshotManager {
            store: MetadataStore::new(layout),
            images,
            device: self
                .device
                .ok_or_else(|| SnapError::Store("device info is required".to_string()))?,
            stack: self
                .stack
                .ok_or_else(|| SnapError::Store("block stack is required".to_string()))?,
            daemon_factory: self
                .daemon_factory
                .ok_or_else(|| SnapError::Store("daemon factory is required".to_string()))?,
            planner: self
                .planner
                .ok_or_else(|| SnapError::Store("cow planner is required".to_string()))?,
            daemon: RefCell::new(None),
            old_metadata: RefCell::new(None),
            userspace_cache: Cell::new(None),
            legacy_cache: Cell::new(None),
            first_stage_daemon: self.first_stage_daemon,
        })
    }
}
