//! A narrow view of the super-partition metadata.
//!
//! The metadata builder and the on-disk super format live outside this
//! crate; the core only needs to know which logical partitions exist, where
//! their extents sit inside super, and whether each partition still carries
//! the updated attribute written by the installer. A partition that loses
//! that attribute was re-flashed out from under the update.

use serde::{Deserialize, Serialize};

use crate::device::SECTOR_SIZE;
use crate::error::{SnapError, SnapResult};

/// Group holding the COW partitions carved out of super. These are never
/// mapped as top-level partitions during boot.
pub const COW_GROUP_NAME: &str = "cow";

/// Ephemeral metadata partition, skipped during first-stage assembly.
pub const OTA_METADATA_PARTITION: &str = "ota_metadata";

/// State of one partition in the current super metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionState {
    /// The partition does not exist.
    None,
    /// The partition exists but was flashed outside the update flow (no
    /// updated attribute).
    Flashed,
    /// The partition was written by the update.
    Updated,
}

/// A contiguous run of sectors inside the super device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    pub super_offset_sectors: u64,
    pub num_sectors: u64,
}

/// One logical partition record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionRecord {
    pub name: String,
    pub group: String,
    pub updated: bool,
    pub extents: Vec<Extent>,
}

impl PartitionRecord {
    pub fn num_sectors(&self) -> u64 {
        self.extents.iter().map(|e| e.num_sectors).sum()
    }

    pub fn size_bytes(&self) -> u64 {
        self.num_sectors() * SECTOR_SIZE
    }
}

/// The set of logical partitions for one slot of the super device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SuperMetadata {
    pub partitions: Vec<PartitionRecord>,
}

impl SuperMetadata {
    pub fn find_partition(&self, name: &str) -> Option<&PartitionRecord> {
        self.partitions.iter().find(|p| p.name == name)
    }

    pub fn partition_state(&self, name: &str) -> PartitionState {
        match self.find_partition(name) {
            None => PartitionState::None,
            Some(p) if p.updated => PartitionState::Updated,
            Some(_) => PartitionState::Flashed,
        }
    }

    pub fn encode(&self) -> SnapResult<Vec<u8>> {
        bincode::serialize(self)
            .map_err(|err| SnapError::Metadata(format!("encode super metadata: {err}")))
    }

    pub fn decode(bytes: &[u8]) -> SnapResult<Self> {
        bincode::deserialize(bytes)
            .map_err(|err| SnapError::Metadata(format!("decode super metadata: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> SuperMetadata {
        SuperMetadata {
            partitions: vec![
                PartitionRecord {
                    name: "system_b".to_string(),
                    group: "main_b".to_string(),
                    updated: true,
                    extents: vec![Extent {
                        super_offset_sectors: 2048,
                        num_sectors: 8192,
                    }],
                },
                PartitionRecord {
                    name: "vendor_b".to_string(),
                    group: "main_b".to_string(),
                    updated: false,
                    extents: vec![],
                },
            ],
        }
    }

    #[test]
    fn test_partition_state() {
        let m = metadata();
        assert_eq!(m.partition_state("system_b"), PartitionState::Updated);
        assert_eq!(m.partition_state("vendor_b"), PartitionState::Flashed);
        assert_eq!(m.partition_state("odm_b"), PartitionState::None);
    }

    #[test]
    fn test_sizes_from_extents() {
        let m = metadata();
        let system = m.find_partition("system_b").unwrap();
        assert_eq!(system.num_sectors(), 8192);
        assert_eq!(system.size_bytes(), 8192 * SECTOR_SIZE);
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let m = metadata();
        assert_eq!(SuperMetadata::decode(&m.encode().unwrap()).unwrap(), m);
    }
}
