//! On-disk layout of the metadata directory.

use std::path::{Path, PathBuf};

/// File and directory names inside the metadata directory.
pub mod files {
    /// Binary-encoded [`crate::state::GlobalStatus`].
    pub const STATE: &str = "state";

    /// Per-partition snapshot records, keyed by partition name with slot
    /// suffix.
    pub const SNAPSHOTS_DIR: &str = "snapshots";

    /// File-backed COW images.
    pub const COW_IMAGES_DIR: &str = "cow-images";

    /// Slot suffix that was current when the update was finalized.
    pub const BOOT_INDICATOR: &str = "snapshot-boot";

    /// Present when first-stage boot detected a rollback to the source slot.
    pub const ROLLBACK_INDICATOR: &str = "rollback-indicator";

    /// Present when a pending merge is authorized to finish across a data
    /// wipe.
    pub const FORWARD_MERGE_INDICATOR: &str = "allow-forward-merge";

    /// Serialized pre-update super metadata.
    pub const OLD_PARTITION_METADATA: &str = "old-partition-metadata";

    /// Alternate-mode marker: snapshots are applied in place, without a slot
    /// switch.
    pub const BOOT_WITHOUT_SLOT_SWITCH: &str = "snapshot-boot-without-slot-switch";

    /// Daemon-provenance marker: the first-stage daemon binary came from the
    /// system partition and handles userspace snapshots.
    pub const DAEMON_FROM_SYSTEM: &str = "snapuserd-from-system";
}

/// Path helpers over a fixed metadata directory.
///
/// The directory itself doubles as the lock target for the advisory file
/// lock guarding all mutations.
#[derive(Debug, Clone)]
pub struct MetadataLayout {
    root: PathBuf,
}

impl MetadataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_file(&self) -> PathBuf {
        self.root.join(files::STATE)
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.root.join(files::SNAPSHOTS_DIR)
    }

    pub fn snapshot_file(&self, name: &str) -> PathBuf {
        self.snapshots_dir().join(name)
    }

    pub fn cow_images_dir(&self) -> PathBuf {
        self.root.join(files::COW_IMAGES_DIR)
    }

    pub fn boot_indicator(&self) -> PathBuf {
        self.root.join(files::BOOT_INDICATOR)
    }

    pub fn rollback_indicator(&self) -> PathBuf {
        self.root.join(files::ROLLBACK_INDICATOR)
    }

    pub fn forward_merge_indicator(&self) -> PathBuf {
        self.root.join(files::FORWARD_MERGE_INDICATOR)
    }

    pub fn old_partition_metadata(&self) -> PathBuf {
        self.root.join(files::OLD_PARTITION_METADATA)
    }

    pub fn boot_without_slot_switch(&self) -> PathBuf {
        self.root.join(files::BOOT_WITHOUT_SLOT_SWITCH)
    }

    pub fn daemon_from_system(&self) -> PathBuf {
        self.root.join(files::DAEMON_FROM_SYSTEM)
    }

    /// Create the directory structure.
    pub fn prepare(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.snapshots_dir())?;
        std::fs::create_dir_all(self.cow_images_dir())?;
        Ok(())
    }
}
