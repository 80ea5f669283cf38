//! The external COW planner capability.
//!
//! Sizing COW storage requires knowledge of the payload (compression,
//! operation counts) that this crate does not have; clients supply a planner
//! and the update flow turns its output into snapshot records.

use crate::device::SECTOR_SIZE;
use crate::error::SnapResult;

/// One partition in an incoming update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionUpdate {
    /// Target-slot partition name, including slot suffix.
    pub name: String,
    /// New partition size in bytes.
    pub size: u64,
    /// Size of the partition on the source slot; zero if it did not exist.
    pub old_size: u64,
}

/// Update-wide options recorded into the global record at creation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateOptions {
    pub using_daemon: bool,
    pub userspace_snapshots: bool,
    pub legacy_compat: bool,
    pub io_uring: bool,
    pub o_direct: bool,
    pub skip_verification: bool,
    pub cow_op_merge_size: u32,
    pub worker_count: u32,
    pub verify_block_size: u32,
    pub verification_threads: u32,
}

/// The full description of an update to snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateManifest {
    pub partitions: Vec<PartitionUpdate>,
    pub options: UpdateOptions,
}

/// Planner output for one partition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CowPlan {
    /// Bytes of COW carved out of super; may be zero.
    pub cow_partition_size: u64,
    /// Bytes of file-backed COW; may be zero. Rounded up to the sector size
    /// by the caller if the planner did not.
    pub cow_file_size: u64,
    pub estimated_cow_size: u64,
    pub estimated_ops_buffer_size: u64,
    pub compression_algorithm: String,
    pub compression_factor: u32,
    pub read_ahead_size: u32,
    pub enable_threading: bool,
    pub batched_writes: bool,
}

/// Capability computing COW sizing for each partition of an update.
pub trait CowPlanner {
    fn plan(&self, partition: &PartitionUpdate, options: &UpdateOptions) -> SnapResult<CowPlan>;
}

/// Round a byte count up to the next sector boundary.
pub fn round_up_to_sector(bytes: u64) -> u64 {
    bytes.div_ceil(SECTOR_SIZE) * SECTOR_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_up_to_sector() {
        assert_eq!(round_up_to_sector(0), 0);
        assert_eq!(round_up_to_sector(1), SECTOR_SIZE);
        assert_eq!(round_up_to_sector(SECTOR_SIZE), SECTOR_SIZE);
        assert_eq!(round_up_to_sector(SECTOR_SIZE + 1), 2 * SECTOR_SIZE);
    }
}
