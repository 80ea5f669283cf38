//! Per-partition snapshot records.

use serde::{Deserialize, Serialize};

use crate::device::SECTOR_SIZE;
use crate::error::{SnapError, SnapResult};
use crate::state::MergePhase;

/// Lifecycle state of a single snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotState {
    /// Record exists but carries no usable snapshot.
    #[default]
    None,
    /// The snapshot was provisioned and may be mapped.
    Created,
    /// The snapshot was switched to a merge target.
    Merging,
    /// The merge finished; only teardown remains. Persisted before the
    /// destructive collapse so a crash rediscovers the entity as complete.
    MergeCompleted,
}

impl SnapshotState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotState::None => "none",
            SnapshotState::Created => "created",
            SnapshotState::Merging => "merging",
            SnapshotState::MergeCompleted => "merge-completed",
        }
    }
}

impl std::fmt::Display for SnapshotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The persisted per-partition snapshot record.
///
/// Identified by partition name plus target-slot suffix (for example
/// `system_b`), which is also the file name under `snapshots/`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotStatus {
    pub name: String,
    pub state: SnapshotState,

    /// Size of the full (new) partition device, in bytes.
    pub device_size: u64,
    /// Size of the snapshot overlay, in bytes. Equal to `device_size` for
    /// freshly created snapshots.
    pub snapshot_size: u64,
    /// Bytes of COW storage carved out of the super partition.
    pub cow_partition_size: u64,
    /// Bytes of COW storage backed by a file image.
    pub cow_file_size: u64,
    /// Size of the partition on the source slot; non-zero only when the
    /// partition was resized by the update.
    pub old_partition_size: u64,

    // Kernel snapshot accounting, refreshed while merging.
    pub sectors_allocated: u64,
    pub metadata_sectors: u64,

    pub using_daemon: bool,
    pub compression_algorithm: String,
    pub compression_factor: u32,
    pub read_ahead_size: u32,
    pub enable_threading: bool,
    pub batched_writes: bool,
    pub estimated_cow_size: u64,
    pub estimated_ops_buffer_size: u64,
}

impl SnapshotStatus {
    /// Check the sector-alignment and sizing invariants that every persisted
    /// record must satisfy.
    pub fn validate(&self) -> SnapResult<()> {
        if self.name.is_empty() {
            return Err(SnapError::InvalidState(
                "snapshot record has no name".to_string(),
            ));
        }
        for (what, value) in [
            ("device size", self.device_size),
            ("snapshot size", self.snapshot_size),
            ("cow partition size", self.cow_partition_size),
            ("cow file size", self.cow_file_size),
        ] {
            if value % SECTOR_SIZE != 0 {
                return Err(SnapError::InvalidState(format!(
                    "snapshot {}: {} is not a multiple of the sector size: {}",
                    self.name, what, value
                )));
            }
        }
        if self.snapshot_size > self.device_size {
            return Err(SnapError::InvalidState(format!(
                "snapshot {}: snapshot size {} exceeds device size {}",
                self.name, self.snapshot_size, self.device_size
            )));
        }
        Ok(())
    }

    /// Total COW bytes backing this snapshot. Zero means there is nothing to
    /// snapshot and the partition is served as plain linear.
    pub fn total_cow_size(&self) -> u64 {
        self.cow_partition_size + self.cow_file_size
    }

    /// Which merge phase this snapshot belongs to.
    ///
    /// A daemon-backed partition that shrunk merges in the first phase, so
    /// its blocks stop being copy sources before anything else merges over
    /// them.
    pub fn merge_phase(&self) -> MergePhase {
        if self.using_daemon && self.device_size < self.old_partition_size {
            MergePhase::First
        } else {
            MergePhase::Second
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(name: &str) -> SnapshotStatus {
        SnapshotStatus {
            name: name.to_string(),
            state: SnapshotState::Created,
            device_size: 1 << 30,
            snapshot_size: 1 << 30,
            cow_file_size: 256 << 20,
            ..Default::default()
        }
    }

    #[test]
    fn test_validate_accepts_aligned_sizes() {
        assert!(status("system_b").validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_unaligned_device_size() {
        let mut s = status("system_b");
        s.device_size += 1;
        s.snapshot_size = s.device_size;
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_oversized_snapshot() {
        let mut s = status("system_b");
        s.snapshot_size = s.device_size + SECTOR_SIZE;
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_name() {
        assert!(status("").validate().is_err());
    }

    #[test]
    fn test_merge_phase_shrunk_daemon_partition_is_first() {
        let mut s = status("system_b");
        s.using_daemon = true;
        s.device_size = 900 << 20;
        s.snapshot_size = s.device_size;
        s.old_partition_size = 1 << 30;
        assert_eq!(s.merge_phase(), MergePhase::First);
    }

    #[test]
    fn test_merge_phase_grown_partition_is_second() {
        let mut s = status("vendor_b");
        s.using_daemon = true;
        s.device_size = 512 << 20;
        s.snapshot_size = s.device_size;
        s.old_partition_size = 400 << 20;
        assert_eq!(s.merge_phase(), MergePhase::Second);
    }

    #[test]
    fn test_merge_phase_kernel_snapshot_is_second() {
        let mut s = status("system_b");
        s.device_size = 900 << 20;
        s.snapshot_size = s.device_size;
        s.old_partition_size = 1 << 30;
        assert_eq!(s.merge_phase(), MergePhase::Second);
    }

    #[test]
    fn test_binary_round_trip() {
        let s = status("system_b");
        let bytes = bincode::serialize(&s).unwrap();
        assert_eq!(bincode::deserialize::<SnapshotStatus>(&bytes).unwrap(), s);
    }
}
