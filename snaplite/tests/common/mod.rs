//! Shared fixtures: in-memory capability fakes and an isolated manager.
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use snaplite::device::{
    BlockStack, CowDaemon, CowDaemonFactory, DaemonMergeState, DeviceState, SnapshotMode,
    TableSpec, TargetEntry, TargetStatus,
};
use snaplite::error::{SnapError, SnapResult};
use snaplite::metadata::{Extent, PartitionRecord, SuperMetadata};
use snaplite::planner::{CowPlan, CowPlanner, PartitionUpdate, UpdateManifest, UpdateOptions};
use snaplite::slot::{DeviceInfo, MergeIndicator};
use snaplite::SnapshotManager;
use tempfile::TempDir;

pub const MIB: u64 = 1 << 20;
pub const GIB: u64 = 1 << 30;

// ============================================================================
// BLOCK STACK FAKE
// ============================================================================

#[derive(Default)]
struct StackInner {
    devices: HashMap<String, TableSpec>,
    status_overrides: HashMap<String, String>,
    ids: HashMap<String, u32>,
    next_id: u32,
}

/// In-memory device-mapper double. Tables are held verbatim; snapshot
/// status text can be scripted per device.
#[derive(Clone, Default)]
pub struct FakeBlockStack {
    inner: Arc<Mutex<StackInner>>,
}

impl FakeBlockStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_snapshot_status(&self, name: &str, data: &str) {
        self.inner
            .lock()
            .unwrap()
            .status_overrides
            .insert(name.to_string(), data.to_string());
    }

    pub fn remove_device(&self, name: &str) {
        self.inner.lock().unwrap().devices.remove(name);
    }

    pub fn clear_devices(&self) {
        self.inner.lock().unwrap().devices.clear();
    }

    pub fn has_device(&self, name: &str) -> bool {
        self.inner.lock().unwrap().devices.contains_key(name)
    }

    pub fn table_of(&self, name: &str) -> Option<TableSpec> {
        self.inner.lock().unwrap().devices.get(name).cloned()
    }

    fn node_path(name: &str) -> PathBuf {
        PathBuf::from(format!("/dev/block/mapper/{name}"))
    }
}

impl BlockStack for FakeBlockStack {
    fn create_device(
        &self,
        name: &str,
        table: &TableSpec,
        _timeout: Duration,
    ) -> SnapResult<PathBuf> {
        let mut inner = self.inner.lock().unwrap();
        if inner.devices.contains_key(name) {
            return Err(SnapError::Device(format!("device {name} already exists")));
        }
        if !inner.ids.contains_key(name) {
            let id = inner.next_id;
            inner.next_id += 1;
            inner.ids.insert(name.to_string(), id);
        }
        inner.devices.insert(name.to_string(), table.clone());
        Ok(Self::node_path(name))
    }

    fn load_table_and_activate(&self, name: &str, table: &TableSpec) -> SnapResult<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.devices.get_mut(name) {
            Some(existing) => {
                *existing = table.clone();
                Ok(())
            }
            None => Err(SnapError::Device(format!("no device {name} to reload"))),
        }
    }

    fn delete_device_if_exists(&self, name: &str) -> SnapResult<()> {
        self.inner.lock().unwrap().devices.remove(name);
        Ok(())
    }

    fn state(&self, name: &str) -> DeviceState {
        if self.inner.lock().unwrap().devices.contains_key(name) {
            DeviceState::Active
        } else {
            DeviceState::Invalid
        }
    }

    fn table(&self, name: &str) -> SnapResult<Vec<TargetEntry>> {
        self.inner
            .lock()
            .unwrap()
            .devices
            .get(name)
            .map(|t| t.entries.clone())
            .ok_or_else(|| SnapError::Device(format!("no device {name}")))
    }

    fn table_status(&self, name: &str) -> SnapResult<Vec<TargetStatus>> {
        let inner = self.inner.lock().unwrap();
        let table = inner
            .devices
            .get(name)
            .ok_or_else(|| SnapError::Device(format!("no device {name}")))?;
        let statuses = table
            .entries
            .iter()
            .map(|entry| {
                let data = match &entry.spec {
                    snaplite::device::TargetSpec::Snapshot { mode, .. } => inner
                        .status_overrides
                        .get(name)
                        .cloned()
                        .unwrap_or_else(|| match mode {
                            SnapshotMode::Persistent => "532480/2097152 1024".to_string(),
                            SnapshotMode::Merge => "1024/2097152 1024".to_string(),
                        }),
                    _ => String::new(),
                };
                TargetStatus {
                    target_type: entry.spec.target_type().to_string(),
                    data,
                }
            })
            .collect();
        Ok(statuses)
    }

    fn device_string(&self, name: &str) -> SnapResult<String> {
        let inner = self.inner.lock().unwrap();
        if !inner.devices.contains_key(name) {
            return Err(SnapError::Device(format!("no device {name}")));
        }
        Ok(format!("253:{}", inner.ids[name]))
    }

    fn device_path(&self, name: &str) -> SnapResult<PathBuf> {
        if self.has_device(name) {
            Ok(Self::node_path(name))
        } else {
            Err(SnapError::Device(format!("no device {name}")))
        }
    }

    fn wait_for_path(&self, _path: &Path, _timeout: Duration) -> SnapResult<()> {
        Ok(())
    }
}

// ============================================================================
// DAEMON FAKE
// ============================================================================

#[derive(Default)]
struct DaemonInner {
    states: HashMap<String, DaemonMergeState>,
    initiated: Vec<String>,
    attached: Vec<String>,
    percent: f64,
    detach_count: usize,
}

/// Scripted daemon double. All connections share the same state, like
/// clients of one out-of-process daemon.
#[derive(Clone, Default)]
pub struct FakeDaemonHub {
    inner: Arc<Mutex<DaemonInner>>,
}

impl FakeDaemonHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_state(&self, name: &str, state: DaemonMergeState) {
        self.inner
            .lock()
            .unwrap()
            .states
            .insert(name.to_string(), state);
    }

    pub fn complete_merge(&self, name: &str) {
        self.set_state(name, DaemonMergeState::SnapshotMergeComplete);
    }

    pub fn fail_merge(&self, name: &str) {
        self.set_state(name, DaemonMergeState::SnapshotMergeFailed);
    }

    /// Names in the order the core asked to start merging.
    pub fn initiated(&self) -> Vec<String> {
        self.inner.lock().unwrap().initiated.clone()
    }

    pub fn attached(&self) -> Vec<String> {
        self.inner.lock().unwrap().attached.clone()
    }

    pub fn set_percent(&self, percent: f64) {
        self.inner.lock().unwrap().percent = percent;
    }

    pub fn detach_count(&self) -> usize {
        self.inner.lock().unwrap().detach_count
    }
}

pub struct FakeDaemonClient {
    inner: Arc<Mutex<DaemonInner>>,
}

impl CowDaemon for FakeDaemonClient {
    fn init_user_cow(
        &mut self,
        _misc_name: &str,
        _cow_device: &str,
        _base_device: &str,
        _base_merge: Option<&str>,
    ) -> SnapResult<u64> {
        Ok(2048)
    }

    fn attach(&mut self, misc_name: &str) -> SnapResult<()> {
        self.inner
            .lock()
            .unwrap()
            .attached
            .push(misc_name.to_string());
        Ok(())
    }

    fn initiate_merge(&mut self, name: &str) -> SnapResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.initiated.push(name.to_string());
        inner
            .states
            .insert(name.to_string(), DaemonMergeState::SnapshotMerge);
        Ok(())
    }

    fn pause_merge(&mut self) -> SnapResult<()> {
        Ok(())
    }

    fn resume_merge(&mut self) -> SnapResult<()> {
        Ok(())
    }

    fn query_snapshot_status(&mut self, name: &str) -> SnapResult<DaemonMergeState> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .states
            .get(name)
            .copied()
            .unwrap_or(DaemonMergeState::Snapshot))
    }

    fn merge_percent(&mut self) -> SnapResult<f64> {
        Ok(self.inner.lock().unwrap().percent)
    }

    fn wait_for_device_delete(&mut self, _name: &str) -> SnapResult<()> {
        Ok(())
    }

    fn detach(&mut self) -> SnapResult<()> {
        self.inner.lock().unwrap().detach_count += 1;
        Ok(())
    }

    fn remove_transitioned_daemon_indicator(&mut self) -> SnapResult<()> {
        Ok(())
    }
}

impl CowDaemonFactory for FakeDaemonHub {
    fn connect(&self, _timeout: Duration) -> SnapResult<Box<dyn CowDaemon>> {
        Ok(Box::new(FakeDaemonClient {
            inner: Arc::clone(&self.inner),
        }))
    }
}

// ============================================================================
// DEVICE INFO FAKE
// ============================================================================

struct DeviceInner {
    slot_suffix: String,
    recovery: bool,
    metadata: HashMap<u32, SuperMetadata>,
    merge_indicators: Vec<MergeIndicator>,
    unbootable_slots: Vec<u32>,
    active_slots: Vec<u32>,
}

#[derive(Clone)]
pub struct FakeDevice {
    inner: Arc<Mutex<DeviceInner>>,
}

impl FakeDevice {
    pub fn new(slot_suffix: &str) -> Self {
        Self {
            inner: Arc::new(Mutex::new(DeviceInner {
                slot_suffix: slot_suffix.to_string(),
                recovery: false,
                metadata: HashMap::new(),
                merge_indicators: Vec::new(),
                unbootable_slots: Vec::new(),
                active_slots: Vec::new(),
            })),
        }
    }

    pub fn set_slot(&self, suffix: &str) {
        self.inner.lock().unwrap().slot_suffix = suffix.to_string();
    }

    pub fn set_recovery(&self, recovery: bool) {
        self.inner.lock().unwrap().recovery = recovery;
    }

    pub fn set_metadata(&self, slot: u32, metadata: SuperMetadata) {
        self.inner.lock().unwrap().metadata.insert(slot, metadata);
    }

    pub fn set_partition_updated(&self, slot: u32, name: &str, updated: bool) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(metadata) = inner.metadata.get_mut(&slot) {
            if let Some(record) = metadata.partitions.iter_mut().find(|p| p.name == name) {
                record.updated = updated;
            }
        }
    }

    pub fn merge_indicators(&self) -> Vec<MergeIndicator> {
        self.inner.lock().unwrap().merge_indicators.clone()
    }

    pub fn unbootable_slots(&self) -> Vec<u32> {
        self.inner.lock().unwrap().unbootable_slots.clone()
    }

    pub fn active_slots(&self) -> Vec<u32> {
        self.inner.lock().unwrap().active_slots.clone()
    }
}

impl DeviceInfo for FakeDevice {
    fn slot_suffix(&self) -> String {
        self.inner.lock().unwrap().slot_suffix.clone()
    }

    fn other_slot_suffix(&self) -> String {
        if self.slot_suffix() == "_a" {
            "_b".to_string()
        } else {
            "_a".to_string()
        }
    }

    fn super_device(&self, slot: u32) -> String {
        format!("/dev/block/by-name/super{slot}")
    }

    fn is_recovery(&self) -> bool {
        self.inner.lock().unwrap().recovery
    }

    fn is_first_stage_init(&self) -> bool {
        false
    }

    fn read_current_metadata(&self, slot: u32) -> SnapResult<SuperMetadata> {
        self.inner
            .lock()
            .unwrap()
            .metadata
            .get(&slot)
            .cloned()
            .ok_or_else(|| SnapError::Metadata(format!("no metadata for slot {slot}")))
    }

    fn ensure_metadata_mounted(&self) -> SnapResult<bool> {
        Ok(true)
    }

    fn set_merge_indicator(&self, indicator: MergeIndicator) -> bool {
        self.inner.lock().unwrap().merge_indicators.push(indicator);
        true
    }

    fn set_slot_unbootable(&self, slot: u32) -> bool {
        self.inner.lock().unwrap().unbootable_slots.push(slot);
        true
    }

    fn set_active_boot_slot(&self, slot: u32) -> bool {
        self.inner.lock().unwrap().active_slots.push(slot);
        true
    }

    fn build_fingerprint(&self) -> String {
        "fake/device:15/BP1A/1:user".to_string()
    }
}

// ============================================================================
// PLANNER FAKE
// ============================================================================

/// Sizes every COW file to a quarter of the partition, entirely
/// file-backed.
pub struct RatioPlanner;

impl CowPlanner for RatioPlanner {
    fn plan(&self, partition: &PartitionUpdate, options: &UpdateOptions) -> SnapResult<CowPlan> {
        Ok(CowPlan {
            cow_partition_size: 0,
            cow_file_size: partition.size / 4,
            estimated_cow_size: partition.size / 4,
            estimated_ops_buffer_size: 0,
            compression_algorithm: if options.using_daemon {
                "gz".to_string()
            } else {
                String::new()
            },
            compression_factor: 4096,
            read_ahead_size: 32,
            enable_threading: true,
            batched_writes: true,
        })
    }
}

// ============================================================================
// TEST CONTEXT
// ============================================================================

pub struct TestContext {
    pub manager: SnapshotManager,
    pub stack: FakeBlockStack,
    pub daemon: FakeDaemonHub,
    pub device: FakeDevice,
    pub dir: TempDir,
}

impl TestContext {
    /// A manager on slot `_a` with empty metadata for both slots.
    pub fn new() -> Self {
        let dir = TempDir::new().expect("create temp metadata dir");
        let stack = FakeBlockStack::new();
        let daemon = FakeDaemonHub::new();
        let device = FakeDevice::new("_a");
        device.set_metadata(0, SuperMetadata::default());
        device.set_metadata(1, SuperMetadata::default());

        let manager = build_manager(dir.path(), &stack, &daemon, &device);
        Self {
            manager,
            stack,
            daemon,
            device,
            dir,
        }
    }

    /// Drop all in-memory caches, as a process restart would.
    pub fn restart(&mut self) {
        self.manager = build_manager(self.dir.path(), &self.stack, &self.daemon, &self.device);
    }

    /// Switch the booted slot and restart; mapped devices do not survive.
    pub fn reboot_into(&mut self, suffix: &str) {
        self.device.set_slot(suffix);
        self.stack.clear_devices();
        self.restart();
    }

    /// Reboot into the same slot.
    pub fn reboot(&mut self) {
        self.stack.clear_devices();
        self.restart();
    }

    /// Rebuild the manager as first-stage init would see it: daemon misc
    /// names carry the init decoration.
    pub fn restart_first_stage(&mut self) {
        self.manager = SnapshotManager::builder()
            .metadata_dir(self.dir.path())
            .device(Box::new(self.device.clone()))
            .block_stack(Box::new(self.stack.clone()))
            .daemon_factory(Box::new(self.daemon.clone()))
            .planner(Box::new(RatioPlanner))
            .first_stage_daemon(true)
            .build()
            .expect("build first-stage snapshot manager");
    }

    pub fn set_slot_metadata(&self, slot: u32, partitions: &[(&str, u64, bool)]) {
        let metadata = SuperMetadata {
            partitions: partitions
                .iter()
                .map(|(name, size, updated)| partition_record(name, *size, *updated))
                .collect(),
        };
        self.device.set_metadata(slot, metadata);
    }
}

fn build_manager(
    dir: &Path,
    stack: &FakeBlockStack,
    daemon: &FakeDaemonHub,
    device: &FakeDevice,
) -> SnapshotManager {
    SnapshotManager::builder()
        .metadata_dir(dir)
        .device(Box::new(device.clone()))
        .block_stack(Box::new(stack.clone()))
        .daemon_factory(Box::new(daemon.clone()))
        .planner(Box::new(RatioPlanner))
        .build()
        .expect("build snapshot manager")
}

pub fn partition_record(name: &str, size: u64, updated: bool) -> PartitionRecord {
    PartitionRecord {
        name: name.to_string(),
        group: if name.ends_with("-cow") {
            "cow".to_string()
        } else {
            "main".to_string()
        },
        updated,
        extents: vec![Extent {
            super_offset_sectors: 2048,
            num_sectors: size / 512,
        }],
    }
}

/// A manifest running on the userspace daemon.
pub fn daemon_manifest(partitions: &[(&str, u64, u64)]) -> UpdateManifest {
    UpdateManifest {
        partitions: partitions
            .iter()
            .map(|(name, size, old_size)| PartitionUpdate {
                name: name.to_string(),
                size: *size,
                old_size: *old_size,
            })
            .collect(),
        options: UpdateOptions {
            using_daemon: true,
            userspace_snapshots: true,
            worker_count: 4,
            ..Default::default()
        },
    }
}

/// A daemon-backed manifest whose vendor partition predates the userspace
/// driver.
pub fn legacy_manifest(partitions: &[(&str, u64, u64)]) -> UpdateManifest {
    let mut manifest = daemon_manifest(partitions);
    manifest.options.legacy_compat = true;
    manifest
}

/// A manifest on the legacy kernel dm-snapshot path.
pub fn kernel_manifest(partitions: &[(&str, u64, u64)]) -> UpdateManifest {
    UpdateManifest {
        partitions: partitions
            .iter()
            .map(|(name, size, old_size)| PartitionUpdate {
                name: name.to_string(),
                size: *size,
                old_size: *old_size,
            })
            .collect(),
        options: UpdateOptions::default(),
    }
}
