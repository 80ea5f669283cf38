//! Per-partition snapshot entities: stack assembly, teardown, collapse.
//!
//! A snapshot entity maps a target-slot partition as a writable, COW-backed
//! device. Depending on the driver the stack is one of:
//!
//! ```text
//! kernel:     <p>          dm-snapshot(base, cow, mode, chunk)
//!             <p>-base     dm-linear over super
//!             <p>-cow      dm-linear (COW partition) ++ <p>-cow-img
//!
//! userspace:  <p>          dm-user(misc)            ← served by the daemon
//!             <p>-base     dm-linear over super
//!             <p>-src      dm-linear over the old partition (if resized)
//!             <p>-cow      dm-linear ++ <p>-cow-img
//!
//! no snapshot: <p>         dm-linear over super (plain pass-through)
//! ```

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::device::{
    delete_device_with_retries, parse_snapshot_status, DeviceState, SnapshotMode,
    SnapshotTargetStatus, TableSpec, TargetEntry, TargetSpec, TargetStatus, SECTOR_SIZE,
    SNAPSHOT_CHUNK_SIZE,
};
use crate::error::{SnapError, SnapResult};
use crate::manager::{SnapshotDriver, SnapshotManager};
use crate::metadata::{PartitionRecord, SuperMetadata};
use crate::slot::{other_partition_name, slot_number_for_suffix};
use crate::state::{SnapshotState, SnapshotStatus, UpdateState};
use crate::store::DirLock;

/// Directory where the kernel exposes dm-user control nodes.
const DM_USER_CONTROL_DIR: &str = "/dev/dm-user";

/// Timeout for deleting devices that might briefly stay referenced.
const SLOW_DELETE_TIMEOUT: Duration = Duration::from_millis(4000);

/// What the mapped device will be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapContext {
    /// First-stage or recovery mount of the full stack.
    Mount,
    /// Mapping during update installation; the COW is not built yet, so
    /// daemon-backed stacks stop at the base and COW devices.
    Update,
}

pub(crate) fn base_device_name(partition: &str) -> String {
    format!("{partition}-base")
}

pub(crate) fn source_device_name(partition: &str) -> String {
    format!("{partition}-src")
}

pub(crate) fn cow_device_name(partition: &str) -> String {
    format!("{partition}-cow")
}

pub(crate) fn cow_image_name(partition: &str) -> String {
    format!("{partition}-cow-img")
}

/// Remaining-budget deadline arithmetic. A zero total means no deadline and
/// propagates as zero to every subcall.
pub(crate) struct Deadline {
    total: Duration,
    start: Instant,
}

impl Deadline {
    pub fn new(total: Duration) -> Self {
        Self {
            total,
            start: Instant::now(),
        }
    }

    /// The budget left for the next subcall, or a timeout error once the
    /// total is exhausted.
    pub fn remaining(&self, what: &str) -> SnapResult<Duration> {
        if self.total.is_zero() {
            return Ok(Duration::ZERO);
        }
        let elapsed = self.start.elapsed();
        if elapsed >= self.total {
            return Err(SnapError::Timeout(format!(
                "{what}: deadline of {}ms exhausted",
                self.total.as_millis()
            )));
        }
        Ok(self.total - elapsed)
    }
}

/// Deletes the devices it tracks, newest first, unless released. Holds the
/// partially assembled stack while children are created; released only after
/// every child exists.
pub(crate) struct StackGuard<'a> {
    manager: &'a SnapshotManager,
    devices: Vec<String>,
    released: bool,
}

impl<'a> StackGuard<'a> {
    pub fn new(manager: &'a SnapshotManager) -> Self {
        Self {
            manager,
            devices: Vec::new(),
            released: false,
        }
    }

    pub fn push(&mut self, device: String) {
        self.devices.push(device);
    }

    pub fn release(&mut self) {
        self.released = true;
    }
}

impl Drop for StackGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        for device in self.devices.iter().rev() {
            if let Err(err) = self.manager.stack.delete_device_if_exists(device) {
                tracing::error!(device = %device, %err, "failed to roll back partially mapped device");
            }
        }
    }
}

fn wait_for_file_deleted(path: &Path, timeout: Duration) -> SnapResult<()> {
    let start = Instant::now();
    while path.exists() {
        if start.elapsed() >= timeout {
            return Err(SnapError::Timeout(format!(
                "waiting for {} to unlink",
                path.display()
            )));
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    Ok(())
}

impl SnapshotManager {
    // ========================================================================
    // NAMING
    // ========================================================================

    /// The dm-user device carrying a snapshot's COW traffic. With the
    /// userspace driver the partition device itself is the dm-user device.
    pub(crate) fn dm_user_cow_name(&self, partition: &str, driver: SnapshotDriver) -> String {
        match driver {
            SnapshotDriver::Userspace => partition.to_string(),
            SnapshotDriver::Kernel => format!("{partition}-user-cow"),
        }
    }

    /// The misc name registered with the daemon. First-stage boot decorates
    /// it so second-stage can take over under the undecorated name.
    pub(crate) fn misc_name(&self, device_name: &str) -> String {
        if self.first_stage_daemon {
            format!("{device_name}-init")
        } else {
            device_name.to_string()
        }
    }

    pub(crate) fn control_device_path(misc_name: &str) -> PathBuf {
        Path::new(DM_USER_CONTROL_DIR).join(misc_name)
    }

    // ========================================================================
    // CREATION
    // ========================================================================

    /// Materialize a snapshot record in state `Created`. Overwrites any
    /// previous record for the same name.
    pub(crate) fn create_snapshot(
        &self,
        lock: &DirLock,
        status: &mut SnapshotStatus,
    ) -> SnapResult<()> {
        lock.require_exclusive()?;
        status.validate()?;
        status.state = SnapshotState::Created;
        status.sectors_allocated = 0;
        status.metadata_sectors = 0;
        self.store.write_snapshot(lock, status)
    }

    /// Allocate the file-backed COW image sized to the record's
    /// `cow_file_size`.
    pub(crate) fn create_cow_image(&self, lock: &DirLock, name: &str) -> SnapResult<()> {
        lock.require_exclusive()?;
        let status = self.store.read_snapshot(lock, name)?;
        if status.cow_file_size % SECTOR_SIZE != 0 {
            return Err(SnapError::InvalidState(format!(
                "snapshot {name}: COW file size is not a multiple of the sector size: {}",
                status.cow_file_size
            )));
        }
        self.images
            .create_backing_image(&cow_image_name(name), status.cow_file_size)
    }

    // ========================================================================
    // MAPPING
    // ========================================================================

    /// Map one partition, composing whichever stack its snapshot state
    /// requires. Returns `None` for zero-length partitions, otherwise the
    /// path of the device serving the partition.
    pub(crate) fn map_partition_with_snapshot(
        &self,
        lock: &DirLock,
        current_metadata: &SuperMetadata,
        name: &str,
        timeout: Duration,
        context: MapContext,
    ) -> SnapResult<Option<PathBuf>> {
        let deadline = Deadline::new(timeout);

        let record = current_metadata.find_partition(name).ok_or_else(|| {
            SnapError::Metadata(format!("no partition {name} in current metadata"))
        })?;
        if record.extents.is_empty() {
            tracing::info!(partition = name, "skipping zero-length logical partition");
            return Ok(None);
        }

        let live_status = self.live_snapshot_status(lock, record)?;

        let super_device = self.current_super_device();
        let base_name = if live_status.is_some() {
            // The snapshot sits on top; map the raw blocks under a different
            // name. The base must be writable for the merge to fold into it.
            base_device_name(name)
        } else {
            name.to_string()
        };

        let mut guard = StackGuard::new(self);
        let base_table = base_table(record, &super_device);
        let base_path = self.stack.create_device(
            &base_name,
            &base_table,
            deadline.remaining("create base device")?,
        )?;
        guard.push(base_name.clone());
        self.stack
            .wait_for_path(&base_path, deadline.remaining("wait for base device")?)?;

        let Some(status) = live_status else {
            guard.release();
            return Ok(Some(base_path));
        };

        // Device nodes may not be populated in first-stage boot; reference
        // children by major:minor instead of path.
        let base_ref = self.stack.device_string(&base_name)?;

        let cow_mapped = self.map_cow_devices(lock, current_metadata, name, &status, &mut guard, &deadline)?;
        let cow_ref = self.mapped_device_ref(&cow_mapped)?;

        if context == MapContext::Update && status.using_daemon {
            // The daemon cannot serve the device until the COW is written.
            guard.release();
            return Ok(Some(base_path));
        }

        let path = if status.using_daemon {
            self.map_daemon_backed_snapshot(
                lock, name, &status, &base_path, &base_ref, &cow_mapped, &deadline, &mut guard,
            )?
        } else {
            self.map_snapshot(
                lock,
                name,
                &base_ref,
                &cow_ref,
                deadline.remaining("map snapshot")?,
            )?
        };

        guard.release();
        tracing::info!(partition = name, path = %path.display(), "mapped snapshot device");
        Ok(Some(path))
    }

    /// Map a partition for update installation (the writer side of the COW).
    /// Snapshots describe the target slot, so its metadata view is used.
    pub fn map_update_snapshot(&self, name: &str, timeout: Duration) -> SnapResult<Option<PathBuf>> {
        let lock = self.lock_exclusive()?;
        let slot = slot_number_for_suffix(&self.snapshot_slot_suffix());
        let metadata = self.device.read_current_metadata(slot)?;
        self.map_partition_with_snapshot(&lock, &metadata, name, timeout, MapContext::Update)
    }

    /// Unmap a partition mapped by [`Self::map_update_snapshot`].
    pub fn unmap_update_snapshot(&self, name: &str) -> SnapResult<()> {
        let lock = self.lock_shared()?;
        self.unmap_partition_with_snapshot(&lock, name)
    }

    /// Decide whether the partition still has a live snapshot to stack.
    fn live_snapshot_status(
        &self,
        lock: &DirLock,
        record: &PartitionRecord,
    ) -> SnapResult<Option<SnapshotStatus>> {
        if !self.is_snapshot_without_slot_switch() && !record.updated {
            tracing::info!(
                partition = %record.name,
                "detected re-flashing of partition, will not map a snapshot"
            );
            return Ok(None);
        }
        if !self.store.snapshot_file_exists(&record.name) {
            return Ok(None);
        }
        let status = self.store.read_snapshot(lock, &record.name)?;
        if status.state == SnapshotState::MergeCompleted {
            return Ok(None);
        }
        if status.state == SnapshotState::None || status.total_cow_size() == 0 {
            tracing::warn!(
                partition = %record.name,
                state = %status.state,
                cow_partition_size = status.cow_partition_size,
                cow_file_size = status.cow_file_size,
                "snapshot record is invalid, ignoring"
            );
            return Ok(None);
        }
        Ok(Some(status))
    }

    /// Map the COW device pair. Returns the name of the device holding the
    /// COW: the stitched `-cow` device, or the bare image when no COW
    /// partition exists.
    pub(crate) fn map_cow_devices(
        &self,
        _lock: &DirLock,
        current_metadata: &SuperMetadata,
        name: &str,
        status: &SnapshotStatus,
        guard: &mut StackGuard<'_>,
        deadline: &Deadline,
    ) -> SnapResult<String> {
        if status.total_cow_size() == 0 {
            return Err(SnapError::InvalidState(format!(
                "snapshot {name} has no COW storage to map"
            )));
        }

        let image_name = cow_image_name(name);
        let cow_name = cow_device_name(name);

        let image_path = if status.cow_file_size > 0 {
            let path = self.images.map_image(&image_name)?;
            if status.cow_partition_size == 0 {
                tracing::info!(partition = name, image = %image_name, "mapped COW image");
                return Ok(image_name);
            }
            Some(path)
        } else {
            None
        };

        let record = current_metadata.find_partition(&cow_name).ok_or_else(|| {
            SnapError::Metadata(format!("no COW partition {cow_name} in current metadata"))
        })?;
        let mut table = base_table(record, &self.current_super_device());
        if let Some(image_path) = image_path {
            // The image rides as the last extent of the stitched device.
            table.push(
                status.cow_file_size / SECTOR_SIZE,
                TargetSpec::Linear {
                    backing: image_path.to_string_lossy().into_owned(),
                    offset_sectors: 0,
                },
            );
        }

        self.stack
            .create_device(&cow_name, &table, deadline.remaining("create COW device")?)?;
        guard.push(cow_name.clone());
        tracing::info!(partition = name, cow = %cow_name, "mapped COW device");
        Ok(cow_name)
    }

    /// Map the raw old-slot blocks of a resized partition.
    pub(crate) fn map_source_device(
        &self,
        lock: &DirLock,
        name: &str,
        timeout: Duration,
    ) -> SnapResult<PathBuf> {
        let old_metadata = self.read_old_partition_metadata(lock)?;
        let old_name = other_partition_name(name)?;
        let record = old_metadata.find_partition(&old_name).ok_or_else(|| {
            SnapError::Metadata(format!("no partition {old_name} in old metadata"))
        })?;
        let table = base_table(record, &self.current_super_device());
        self.stack
            .create_device(&source_device_name(name), &table, timeout)
    }

    /// Map a kernel dm-snapshot device over (base, cow).
    pub(crate) fn map_snapshot(
        &self,
        lock: &DirLock,
        name: &str,
        base_ref: &str,
        cow_ref: &str,
        timeout: Duration,
    ) -> SnapResult<PathBuf> {
        let status = self.store.read_snapshot(lock, name)?;
        if matches!(
            status.state,
            SnapshotState::None | SnapshotState::MergeCompleted
        ) {
            return Err(SnapError::InvalidState(format!(
                "should not create a snapshot device for {name} after merging has completed"
            )));
        }
        status.validate()?;
        if status.device_size != status.snapshot_size {
            return Err(SnapError::InvalidState(format!(
                "device size and snapshot size must match for {name} \
                 (device size = {}, snapshot size = {})",
                status.device_size, status.snapshot_size
            )));
        }

        // Merging is a global state; the phase decides whether this device
        // joins it now or stays a read-only overlay.
        let global = self.store.read_global(lock);
        let mut mode = match global.state {
            UpdateState::MergeCompleted | UpdateState::MergeNeedsReboot => {
                return Err(SnapError::InvalidState(format!(
                    "should not create a snapshot device for {name} \
                     after global merging has completed"
                )));
            }
            // MergeFailed still means a merge is in flight, only stalled.
            UpdateState::Merging | UpdateState::MergeFailed => {
                if status.merge_phase() == global.merge_phase {
                    SnapshotMode::Merge
                } else {
                    SnapshotMode::Persistent
                }
            }
            _ => SnapshotMode::Persistent,
        };

        if mode == SnapshotMode::Persistent && status.state == SnapshotState::Merging {
            tracing::error!(
                partition = name,
                "snapshot record says merging but mode resolved to persistent; forcing merge"
            );
            mode = SnapshotMode::Merge;
        }

        let table = TableSpec::single(
            status.snapshot_size / SECTOR_SIZE,
            TargetSpec::Snapshot {
                base: base_ref.to_string(),
                cow: cow_ref.to_string(),
                mode,
                chunk_sectors: SNAPSHOT_CHUNK_SIZE,
            },
        );
        self.stack.create_device(name, &table, timeout)
    }

    /// Map the dm-user parts of a daemon-backed stack (source device,
    /// dm-user device, daemon handshake), then whatever sits on top.
    #[allow(clippy::too_many_arguments)]
    fn map_daemon_backed_snapshot(
        &self,
        lock: &DirLock,
        name: &str,
        status: &SnapshotStatus,
        base_path: &Path,
        base_ref: &str,
        cow_mapped: &str,
        deadline: &Deadline,
        guard: &mut StackGuard<'_>,
    ) -> SnapResult<PathBuf> {
        if matches!(
            status.state,
            SnapshotState::None | SnapshotState::MergeCompleted
        ) {
            return Err(SnapError::InvalidState(format!(
                "should not create a snapshot device for {name} after merging has completed"
            )));
        }
        let global = self.store.read_global(lock);
        if matches!(
            global.state,
            UpdateState::MergeCompleted | UpdateState::MergeNeedsReboot
        ) {
            return Err(SnapError::InvalidState(format!(
                "should not create a snapshot device for {name} after global merging has completed"
            )));
        }

        // The old-slot view of a resized partition, for daemon-side reads.
        let source_path = if status.old_partition_size > 0 {
            let path =
                self.map_source_device(lock, name, deadline.remaining("map source device")?)?;
            guard.push(source_device_name(name));
            path
        } else {
            base_path.to_path_buf()
        };
        self.stack
            .wait_for_path(&source_path, deadline.remaining("wait for source device")?)?;

        let cow_path = self.mapped_device_path(cow_mapped)?;
        self.stack
            .wait_for_path(&cow_path, deadline.remaining("wait for COW device")?)?;

        let driver = self.snapshot_driver(lock);
        let user_device = self.dm_user_cow_name(name, driver);
        let misc = self.misc_name(&user_device);

        match driver {
            SnapshotDriver::Userspace => {
                // The dm-user device is the partition device; its size is the
                // size of the base it will merge into.
                let table = TableSpec::single(
                    status.snapshot_size / SECTOR_SIZE,
                    TargetSpec::User {
                        misc_name: misc.clone(),
                    },
                );
                let path = self.stack.create_device(
                    &user_device,
                    &table,
                    deadline.remaining("create dm-user device")?,
                )?;
                guard.push(user_device.clone());
                self.stack
                    .wait_for_path(&path, deadline.remaining("wait for dm-user device")?)?;
                self.stack.wait_for_path(
                    &Self::control_device_path(&misc),
                    deadline.remaining("wait for dm-user control device")?,
                )?;

                self.with_daemon(|daemon| {
                    daemon.init_user_cow(
                        &misc,
                        &cow_path.to_string_lossy(),
                        &source_path.to_string_lossy(),
                        Some(&base_path.to_string_lossy()),
                    )?;
                    daemon.attach(&misc)
                })?;
                Ok(path)
            }
            SnapshotDriver::Kernel => {
                // Legacy layering: the dm-user device replaces the COW under
                // a kernel dm-snapshot, so the daemon sizes it first.
                let base_sectors = self.with_daemon(|daemon| {
                    daemon.init_user_cow(
                        &misc,
                        &cow_path.to_string_lossy(),
                        &source_path.to_string_lossy(),
                        None,
                    )
                })?;

                let table = TableSpec::single(
                    base_sectors,
                    TargetSpec::User {
                        misc_name: misc.clone(),
                    },
                );
                let user_path = self.stack.create_device(
                    &user_device,
                    &table,
                    deadline.remaining("create dm-user device")?,
                )?;
                guard.push(user_device.clone());
                self.stack
                    .wait_for_path(&user_path, deadline.remaining("wait for dm-user device")?)?;
                self.stack.wait_for_path(
                    &Self::control_device_path(&misc),
                    deadline.remaining("wait for dm-user control device")?,
                )?;
                self.with_daemon(|daemon| daemon.attach(&misc))?;

                let cow_ref = self.stack.device_string(&user_device)?;
                self.map_snapshot(
                    lock,
                    name,
                    base_ref,
                    &cow_ref,
                    deadline.remaining("map snapshot")?,
                )
            }
        }
    }

    /// `major:minor` reference for a mapped device, or the image path when
    /// the name refers to a bare COW image.
    pub(crate) fn mapped_device_ref(&self, name: &str) -> SnapResult<String> {
        if self.stack.state(name) != DeviceState::Invalid {
            return self.stack.device_string(name);
        }
        Ok(self.images.map_image(name)?.to_string_lossy().into_owned())
    }

    /// Node path for a mapped device, or the image path.
    pub(crate) fn mapped_device_path(&self, name: &str) -> SnapResult<PathBuf> {
        if self.stack.state(name) != DeviceState::Invalid {
            return self.stack.device_path(name);
        }
        self.images.map_image(name)
    }

    pub(crate) fn current_super_device(&self) -> String {
        let slot = slot_number_for_suffix(&self.device.slot_suffix());
        self.device.super_device(slot)
    }

    // ========================================================================
    // TEARDOWN
    // ========================================================================

    /// Tear the whole stack down, top first.
    pub(crate) fn unmap_partition_with_snapshot(
        &self,
        lock: &DirLock,
        name: &str,
    ) -> SnapResult<()> {
        self.unmap_snapshot(lock, name)?;
        self.unmap_cow_devices(lock, name)?;

        self.stack
            .delete_device_if_exists(&base_device_name(name))
            .map_err(|err| {
                SnapError::Device(format!("cannot delete base device for {name}: {err}"))
            })?;
        self.stack
            .delete_device_if_exists(&source_device_name(name))
            .map_err(|err| {
                SnapError::Device(format!("cannot delete source device for {name}: {err}"))
            })?;

        tracing::info!(partition = name, "unmapped snapshot");
        Ok(())
    }

    pub(crate) fn unmap_snapshot(&self, lock: &DirLock, name: &str) -> SnapResult<()> {
        if self.uses_userspace_snapshots(lock) {
            self.unmap_userspace_snapshot_device(lock, name)
        } else {
            self.stack.delete_device_if_exists(name).map_err(|err| {
                SnapError::Device(format!("could not delete snapshot device {name}: {err}"))
            })
        }
    }

    pub(crate) fn unmap_cow_devices(&self, lock: &DirLock, name: &str) -> SnapResult<()> {
        if self.uses_daemon(lock) && !self.uses_userspace_snapshots(lock) {
            let user_cow = self.dm_user_cow_name(name, SnapshotDriver::Kernel);
            self.unmap_dm_user_device(&user_cow)?;
        }

        delete_device_with_retries(
            self.stack.as_ref(),
            &cow_device_name(name),
            SLOW_DELETE_TIMEOUT,
        )?;
        self.images.unmap_image_if_exists(&cow_image_name(name))
    }

    pub(crate) fn unmap_dm_user_device(&self, dm_user_name: &str) -> SnapResult<()> {
        if self.stack.state(dm_user_name) == DeviceState::Invalid {
            return Ok(());
        }
        self.stack.delete_device_if_exists(dm_user_name)?;
        self.with_daemon(|daemon| daemon.wait_for_device_delete(dm_user_name))?;
        // Make sure the control node is gone so a remap cannot race it.
        wait_for_file_deleted(
            &Self::control_device_path(&self.misc_name(dm_user_name)),
            Duration::from_secs(10),
        )
    }

    pub(crate) fn unmap_userspace_snapshot_device(
        &self,
        lock: &DirLock,
        name: &str,
    ) -> SnapResult<()> {
        let driver = self.snapshot_driver(lock);
        let dm_user_name = self.dm_user_cow_name(name, driver);
        if self.stack.state(&dm_user_name) == DeviceState::Invalid {
            return Ok(());
        }

        let status = self.store.read_snapshot(lock, name)?;
        // Once the merge completed, collapse already swapped the table in
        // place; the device is mounted as the partition and must stay.
        if status.state != SnapshotState::MergeCompleted {
            delete_device_with_retries(self.stack.as_ref(), &dm_user_name, SLOW_DELETE_TIMEOUT)?;
        }

        self.with_daemon(|daemon| daemon.wait_for_device_delete(&dm_user_name))?;
        wait_for_file_deleted(
            &Self::control_device_path(&self.misc_name(&dm_user_name)),
            Duration::from_secs(10),
        )
    }

    /// Remove every artifact of a snapshot: mapped COW devices, the backing
    /// image, and the record (kept on disk in recovery, where images cannot
    /// be deleted anyway).
    pub(crate) fn delete_snapshot(&self, lock: &DirLock, name: &str) -> SnapResult<()> {
        lock.require_exclusive()?;
        self.unmap_cow_devices(lock, name)?;

        if self.device.is_recovery() {
            tracing::info!(partition = name, "skipping delete of snapshot in recovery");
            return Ok(());
        }

        let image = cow_image_name(name);
        if self.images.backing_image_exists(&image) {
            self.images.delete_backing_image(&image)?;
        }
        self.store.remove_snapshot_file(lock, name)
    }

    // ========================================================================
    // COLLAPSE
    // ========================================================================

    /// Replace a merged snapshot device with a plain linear table over its
    /// base, in place, then delete the helper devices underneath.
    pub(crate) fn collapse_snapshot_device(
        &self,
        lock: &DirLock,
        name: &str,
        status: &SnapshotStatus,
    ) -> SnapResult<()> {
        let userspace = self.uses_userspace_snapshots(lock);
        if !userspace {
            let entry = self.single_target_entry(name).ok_or_else(|| {
                SnapError::Device(format!("unexpected table for snapshot device {name}"))
            })?;
            if entry.spec.target_type() != "snapshot-merge" {
                return Err(SnapError::Device(format!(
                    "snapshot device {name} has invalid target type {}",
                    entry.spec.target_type()
                )));
            }
        }

        if status.snapshot_size % SECTOR_SIZE != 0 {
            return Err(SnapError::InvalidState(format!(
                "snapshot {name} size is not sector aligned: {}",
                status.snapshot_size
            )));
        }

        let metadata = self.read_current_metadata()?;
        let record = metadata.find_partition(name).ok_or_else(|| {
            SnapError::Metadata(format!("no partition {name} in current metadata"))
        })?;
        let table = base_table(record, &self.current_super_device());
        self.stack.load_table_and_activate(name, &table)?;

        if !userspace && status.using_daemon {
            // The dm-user COW helper is no longer referenced after the swap.
            let user_cow = self.dm_user_cow_name(name, SnapshotDriver::Kernel);
            if let Err(err) = self.unmap_dm_user_device(&user_cow) {
                tracing::error!(device = %user_cow, %err, "failed to unmap dm-user COW helper");
            }
        }

        if userspace {
            // The daemon's workers hold the base open; wait for them to let
            // go before deleting helpers.
            if let Err(err) = self.with_daemon(|daemon| daemon.wait_for_device_delete(name)) {
                tracing::error!(partition = name, %err, "failed to wait for daemon device delete");
            }
        }

        let base_name = base_device_name(name);
        if let Err(err) = self.stack.delete_device_if_exists(&base_name) {
            tracing::error!(device = %base_name, %err, "unable to delete base device after collapse");
        }
        let source_name = source_device_name(name);
        if let Err(err) =
            delete_device_with_retries(self.stack.as_ref(), &source_name, SLOW_DELETE_TIMEOUT)
        {
            tracing::error!(device = %source_name, %err, "unable to delete source device after collapse");
        }

        Ok(())
    }

    /// Cleanup after a completed per-entity merge: collapse the stack and
    /// delete the snapshot artifacts. Failures leave retryable state.
    pub(crate) fn on_snapshot_merge_complete(
        &self,
        lock: &DirLock,
        name: &str,
        status: &SnapshotStatus,
    ) -> SnapResult<()> {
        if !self.uses_userspace_snapshots(lock) {
            if self.is_snapshot_device(name) {
                // Extra caution before replacing a table destructively.
                let (target_type, dm_status) = self.query_snapshot_status(name)?;
                if target_type != "snapshot-merge" {
                    return Err(SnapError::Device(format!(
                        "unexpected target type {target_type} for snapshot device {name}"
                    )));
                }
                if dm_status.sectors_allocated != dm_status.metadata_sectors {
                    return Err(SnapError::Device(format!(
                        "merge is unexpectedly incomplete for device {name}"
                    )));
                }
                self.collapse_snapshot_device(lock, name, status)?;
            }
        } else {
            self.collapse_snapshot_device(lock, name, status)?;
        }

        // Collapsing is implicitly an unmap; only artifacts remain.
        self.delete_snapshot(lock, name)
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    pub(crate) fn single_target_status(&self, name: &str) -> Option<TargetStatus> {
        if self.stack.state(name) == DeviceState::Invalid {
            return None;
        }
        let mut targets = self.stack.table_status(name).ok()?;
        if targets.len() != 1 {
            return None;
        }
        targets.pop()
    }

    pub(crate) fn single_target_entry(&self, name: &str) -> Option<TargetEntry> {
        if self.stack.state(name) == DeviceState::Invalid {
            return None;
        }
        let mut targets = self.stack.table(name).ok()?;
        if targets.len() != 1 {
            return None;
        }
        targets.pop()
    }

    /// Whether the mapped device is some kind of snapshot (kernel snapshot,
    /// merge target, or dm-user).
    pub(crate) fn is_snapshot_device(&self, name: &str) -> bool {
        let Some(target) = self.single_target_status(name) else {
            return false;
        };
        matches!(
            target.target_type.as_str(),
            "user" | "snapshot" | "snapshot-merge"
        )
    }

    /// Target type and parsed accounting of a kernel snapshot device.
    pub(crate) fn query_snapshot_status(
        &self,
        name: &str,
    ) -> SnapResult<(String, SnapshotTargetStatus)> {
        let target = self.single_target_status(name).ok_or_else(|| {
            SnapError::Device(format!(
                "device {name} is not a snapshot or snapshot-merge device"
            ))
        })?;
        if !matches!(target.target_type.as_str(), "snapshot" | "snapshot-merge") {
            return Err(SnapError::Device(format!(
                "device {name} is not a snapshot or snapshot-merge device"
            )));
        }
        let status = parse_snapshot_status(&target.data)?;
        Ok((target.target_type, status))
    }
}

/// Table mapping a partition's extents linearly over the super device.
pub(crate) fn base_table(record: &PartitionRecord, super_device: &str) -> TableSpec {
    let mut table = TableSpec::new();
    for extent in &record.extents {
        table.push(
            extent.num_sectors,
            TargetSpec::Linear {
                backing: super_device.to_string(),
                offset_sectors: extent.super_offset_sectors,
            },
        );
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_names() {
        assert_eq!(base_device_name("system_b"), "system_b-base");
        assert_eq!(source_device_name("system_b"), "system_b-src");
        assert_eq!(cow_device_name("system_b"), "system_b-cow");
        assert_eq!(cow_image_name("system_b"), "system_b-cow-img");
    }

    #[test]
    fn test_deadline_zero_means_unlimited() {
        let deadline = Deadline::new(Duration::ZERO);
        assert_eq!(deadline.remaining("x").unwrap(), Duration::ZERO);
    }

    #[test]
    fn test_deadline_expires() {
        let deadline = Deadline::new(Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        assert!(deadline.remaining("x").is_err());
    }

    #[test]
    fn test_base_table_covers_extents() {
        let record = PartitionRecord {
            name: "system_b".to_string(),
            group: "main_b".to_string(),
            updated: true,
            extents: vec![
                crate::metadata::Extent {
                    super_offset_sectors: 2048,
                    num_sectors: 4096,
                },
                crate::metadata::Extent {
                    super_offset_sectors: 65536,
                    num_sectors: 1024,
                },
            ],
        };
        let table = base_table(&record, "/dev/block/super");
        assert_eq!(table.entries.len(), 2);
        assert_eq!(table.num_sectors(), 5120);
        assert_eq!(table.entries[1].start_sector, 4096);
    }
}
