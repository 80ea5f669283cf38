//! The block-stack capability: create, query, relayer, and delete
//! device-mapper devices.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::device::table::{DeviceState, TableSpec, TargetEntry, TargetStatus};
use crate::error::SnapResult;

/// Interval between retries when a device refuses to delete.
pub const DEVICE_DELETE_RETRY_INTERVAL: Duration = Duration::from_millis(400);

/// Capability over the device-mapper layer.
///
/// Implementations must refuse tables containing target types they do not
/// understand rather than rendering them blindly.
pub trait BlockStack {
    /// Create and activate a device, returning its node path. A zero timeout
    /// means no deadline.
    fn create_device(&self, name: &str, table: &TableSpec, timeout: Duration)
        -> SnapResult<PathBuf>;

    /// Replace the table of an existing device in place and resume it. The
    /// device keeps its major:minor, so mounted filesystems are unaffected.
    fn load_table_and_activate(&self, name: &str, table: &TableSpec) -> SnapResult<()>;

    /// Delete a device. Deleting a device that does not exist is not an
    /// error.
    fn delete_device_if_exists(&self, name: &str) -> SnapResult<()>;

    fn state(&self, name: &str) -> DeviceState;

    /// The loaded table (target parameters).
    fn table(&self, name: &str) -> SnapResult<Vec<TargetEntry>>;

    /// The runtime status of each target.
    fn table_status(&self, name: &str) -> SnapResult<Vec<TargetStatus>>;

    /// `major:minor` string for table references when device nodes are not
    /// yet populated (first-stage boot).
    fn device_string(&self, name: &str) -> SnapResult<String>;

    fn device_path(&self, name: &str) -> SnapResult<PathBuf>;

    /// Block until `path` exists. A zero timeout fails immediately if the
    /// path is absent.
    fn wait_for_path(&self, path: &Path, timeout: Duration) -> SnapResult<()>;
}

/// Delete a device, retrying until `timeout`, then diagnose why it is busy.
///
/// The diagnostics name the concrete blocker when they can find one: a child
/// device-mapper device holding a reference, a mounted filesystem, or a
/// lazily unmounted filesystem that still pins the node.
pub fn delete_device_with_retries(
    stack: &dyn BlockStack,
    name: &str,
    timeout: Duration,
) -> SnapResult<()> {
    let start = Instant::now();
    let mut last_err;
    loop {
        match stack.delete_device_if_exists(name) {
            Ok(()) => return Ok(()),
            Err(err) => last_err = err,
        }
        if start.elapsed() >= timeout {
            break;
        }
        std::thread::sleep(DEVICE_DELETE_RETRY_INTERVAL);
    }

    let Ok(path) = stack.device_path(name) else {
        tracing::error!(device = name, "unable to diagnose device delete failure");
        return Err(last_err);
    };
    diagnose_busy_device(name, &path);
    Err(last_err)
}

fn diagnose_busy_device(name: &str, path: &Path) {
    let block_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    // Child dm devices keep a reference through sysfs holders.
    let holders = format!("/sys/class/block/{block_name}/holders");
    if let Ok(mut entries) = std::fs::read_dir(&holders) {
        if let Some(Ok(entry)) = entries.next() {
            tracing::error!(
                device = name,
                holder = %entry.path().display(),
                "child device-mapper device still mapped"
            );
            return;
        }
    }

    // Mounted partitions.
    if let Ok(mounts) = std::fs::read_to_string("/proc/mounts") {
        for line in mounts.lines() {
            let mut fields = line.split_whitespace();
            let (Some(source), Some(mount_point)) = (fields.next(), fields.next()) else {
                continue;
            };
            if Path::new(source).file_name().map(|n| n.to_string_lossy())
                == Some(block_name.as_str().into())
            {
                tracing::error!(device = name, mount_point, "partition still mounted");
                return;
            }
        }
    }

    // Lazily unmounted filesystems linger under the filesystem sysfs trees.
    for fs_type in ["ext4", "f2fs"] {
        let sysfs = format!("/sys/fs/{fs_type}/{block_name}");
        if Path::new(&sysfs).exists() {
            tracing::error!(
                device = name,
                path = %path.display(),
                "block device was lazily unmounted and is still in use; \
                 possibly an open file descriptor or attached loop device"
            );
            return;
        }
    }

    tracing::error!(
        device = name,
        path = %path.display(),
        "device still in use; probably a leaked file descriptor or an attached loop device"
    );
}
