//! Device-mapper table model.
//!
//! Tables are described as typed target entries; the [`super::BlockStack`]
//! implementation is responsible for rendering them to whatever wire format
//! the kernel (or a test double) expects. Unknown target types must be
//! refused by the implementation, never passed through.

use crate::error::{SnapError, SnapResult};

/// Fixed sector size. All persisted sizes are multiples of this.
pub const SECTOR_SIZE: u64 = 512;

/// Chunk size, in sectors, for kernel snapshot targets.
pub const SNAPSHOT_CHUNK_SIZE: u64 = 8;

/// Storage mode of a kernel snapshot target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotMode {
    /// Read-only overlay; writes land in the COW.
    Persistent,
    /// In-place merge-back of COW contents into the base.
    Merge,
}

/// A single device-mapper target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSpec {
    /// Maps a contiguous sector range of a backing device.
    Linear {
        backing: String,
        offset_sectors: u64,
    },
    /// Kernel snapshot over (base, cow).
    Snapshot {
        base: String,
        cow: String,
        mode: SnapshotMode,
        chunk_sectors: u64,
    },
    /// User-mode block device served by the COW daemon.
    User { misc_name: String },
}

impl TargetSpec {
    pub fn target_type(&self) -> &'static str {
        match self {
            TargetSpec::Linear { .. } => "linear",
            TargetSpec::Snapshot {
                mode: SnapshotMode::Persistent,
                ..
            } => "snapshot",
            TargetSpec::Snapshot {
                mode: SnapshotMode::Merge,
                ..
            } => "snapshot-merge",
            TargetSpec::User { .. } => "user",
        }
    }
}

/// A target plus the sector range it occupies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetEntry {
    pub start_sector: u64,
    pub num_sectors: u64,
    pub spec: TargetSpec,
}

/// An ordered device-mapper table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableSpec {
    pub entries: Vec<TargetEntry>,
}

impl TableSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a target covering `num_sectors` after the current end.
    pub fn push(&mut self, num_sectors: u64, spec: TargetSpec) -> &mut Self {
        let start_sector = self.num_sectors();
        self.entries.push(TargetEntry {
            start_sector,
            num_sectors,
            spec,
        });
        self
    }

    /// Build a single-target table.
    pub fn single(num_sectors: u64, spec: TargetSpec) -> Self {
        let mut table = Self::new();
        table.push(num_sectors, spec);
        table
    }

    pub fn num_sectors(&self) -> u64 {
        self.entries
            .iter()
            .map(|e| e.num_sectors)
            .sum()
    }
}

/// Activation state of a device-mapper device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// No such device.
    Invalid,
    Suspended,
    Active,
}

/// One target row from a table-status query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetStatus {
    pub target_type: String,
    /// Raw status text; for snapshot targets this is
    /// `<allocated>/<total> <metadata>` or `Overflow`.
    pub data: String,
}

impl TargetStatus {
    /// The kernel reports `Overflow` in place of counts when the COW ran out
    /// of room.
    pub fn is_overflow(&self) -> bool {
        self.data.trim() == "Overflow"
    }
}

/// Parsed accounting of a kernel snapshot or snapshot-merge target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotTargetStatus {
    pub sectors_allocated: u64,
    pub total_sectors: u64,
    pub metadata_sectors: u64,
}

/// Parse `<allocated>/<total> <metadata>` snapshot status text.
pub fn parse_snapshot_status(data: &str) -> SnapResult<SnapshotTargetStatus> {
    let parse = |s: &str| -> Option<u64> { s.parse().ok() };
    let mut words = data.split_whitespace();
    let counts = words.next().unwrap_or("");
    let metadata = words.next().unwrap_or("");
    let (allocated, total) = counts.split_once('/').unwrap_or(("", ""));
    match (parse(allocated), parse(total), parse(metadata)) {
        (Some(sectors_allocated), Some(total_sectors), Some(metadata_sectors)) => {
            Ok(SnapshotTargetStatus {
                sectors_allocated,
                total_sectors,
                metadata_sectors,
            })
        }
        _ => Err(SnapError::Device(format!(
            "could not parse snapshot status text: {data:?}"
        ))),
    }
}

/// Merge completion percentage for a kernel snapshot-merge target.
///
/// `baseline_sectors` is the allocation count captured when the merge was
/// initiated; zero falls back to the total.
pub fn merge_percent(status: &SnapshotTargetStatus, baseline_sectors: u64) -> f64 {
    let s = status.sectors_allocated;
    let t = status.total_sectors;
    let m = status.metadata_sectors;
    let initial = if baseline_sectors != 0 { baseline_sectors } else { t };

    if t <= s || initial <= m {
        return 0.0;
    }
    if s == 0 || t == 0 || s <= m {
        return 100.0;
    }

    let allocated = (s - m) as f64;
    let total = (initial - m) as f64;
    (total - allocated) / total * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_offsets_accumulate() {
        let mut table = TableSpec::new();
        table.push(
            1024,
            TargetSpec::Linear {
                backing: "/dev/block/super".to_string(),
                offset_sectors: 2048,
            },
        );
        table.push(
            512,
            TargetSpec::Linear {
                backing: "/dev/block/loop7".to_string(),
                offset_sectors: 0,
            },
        );
        assert_eq!(table.entries[0].start_sector, 0);
        assert_eq!(table.entries[1].start_sector, 1024);
        assert_eq!(table.num_sectors(), 1536);
    }

    #[test]
    fn test_target_type_strings() {
        let snap = TargetSpec::Snapshot {
            base: "a".into(),
            cow: "b".into(),
            mode: SnapshotMode::Persistent,
            chunk_sectors: SNAPSHOT_CHUNK_SIZE,
        };
        assert_eq!(snap.target_type(), "snapshot");
        let merge = TargetSpec::Snapshot {
            base: "a".into(),
            cow: "b".into(),
            mode: SnapshotMode::Merge,
            chunk_sectors: SNAPSHOT_CHUNK_SIZE,
        };
        assert_eq!(merge.target_type(), "snapshot-merge");
        let user = TargetSpec::User {
            misc_name: "system_b".into(),
        };
        assert_eq!(user.target_type(), "user");
    }

    #[test]
    fn test_parse_snapshot_status() {
        let st = parse_snapshot_status("532480/1048576 1024").unwrap();
        assert_eq!(st.sectors_allocated, 532480);
        assert_eq!(st.total_sectors, 1048576);
        assert_eq!(st.metadata_sectors, 1024);
    }

    #[test]
    fn test_parse_snapshot_status_rejects_overflow_text() {
        assert!(parse_snapshot_status("Overflow").is_err());
        assert!(TargetStatus {
            target_type: "snapshot".into(),
            data: "Overflow".into()
        }
        .is_overflow());
    }

    #[test]
    fn test_merge_percent_complete_when_allocated_equals_metadata() {
        let st = SnapshotTargetStatus {
            sectors_allocated: 1024,
            total_sectors: 1 << 21,
            metadata_sectors: 1024,
        };
        assert_eq!(merge_percent(&st, 0), 100.0);
    }

    #[test]
    fn test_merge_percent_halfway() {
        let st = SnapshotTargetStatus {
            sectors_allocated: 1024 + 500,
            total_sectors: 1 << 21,
            metadata_sectors: 1024,
        };
        let pct = merge_percent(&st, 1024 + 1000);
        assert!((pct - 50.0).abs() < 0.01, "pct = {pct}");
    }
}
