//! Slot identity and the device-side capability.

use crate::error::{SnapError, SnapResult};
use crate::metadata::SuperMetadata;

/// Which slot the device booted relative to the pending update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// No update in flight (no boot indicator), or indeterminate.
    Unknown,
    /// Booted back into the slot the update was installed from.
    Source,
    /// Booted the newly updated slot.
    Target,
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Slot::Unknown => "unknown",
            Slot::Source => "source",
            Slot::Target => "target",
        };
        write!(f, "{s}")
    }
}

/// Value of the bootloader merge-status bit.
///
/// The bit must never falsely report that the device is safe to wipe, so
/// writers order it against the state-file write accordingly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeIndicator {
    /// Nothing pending; wiping is safe.
    None,
    /// Snapshots exist but no merge has started.
    Snapshotted,
    /// A merge is running or stalled.
    Merging,
}

/// Capability over everything the core needs from the device: slot wiring,
/// super access, bootloader controls, and environment flags.
pub trait DeviceInfo {
    /// The suffix of the currently booted slot, like `_a`.
    fn slot_suffix(&self) -> String;

    fn other_slot_suffix(&self) -> String;

    /// Path of the super block device holding the given metadata slot.
    fn super_device(&self, slot: u32) -> String;

    fn is_recovery(&self) -> bool;

    /// Running before the init handoff; device nodes may not exist yet and
    /// dm-user misc names carry the first-stage decoration.
    fn is_first_stage_init(&self) -> bool;

    /// Read the current super metadata for a slot.
    fn read_current_metadata(&self, slot: u32) -> SnapResult<SuperMetadata>;

    /// Mount the metadata filesystem if this environment requires it
    /// (recovery). Returns false when no metadata device exists at all.
    fn ensure_metadata_mounted(&self) -> SnapResult<bool>;

    /// Update the bootloader merge-status bit. Failures are reported but the
    /// flow continues.
    fn set_merge_indicator(&self, indicator: MergeIndicator) -> bool;

    fn set_slot_unbootable(&self, slot: u32) -> bool;

    fn set_active_boot_slot(&self, slot: u32) -> bool;

    /// Build fingerprint of the running (source) build.
    fn build_fingerprint(&self) -> String;
}

/// Map a slot suffix to its metadata slot number.
pub fn slot_number_for_suffix(suffix: &str) -> u32 {
    if suffix == "_b" {
        1
    } else {
        0
    }
}

/// Swap the slot suffix of a partition name (`system_a` ⇄ `system_b`).
pub fn other_partition_name(name: &str) -> SnapResult<String> {
    let (stem, suffix) = name
        .rsplit_once('_')
        .ok_or_else(|| SnapError::Metadata(format!("partition {name} has no slot suffix")))?;
    let other = match suffix {
        "a" => "b",
        "b" => "a",
        _ => {
            return Err(SnapError::Metadata(format!(
                "partition {name} has unexpected slot suffix _{suffix}"
            )))
        }
    };
    Ok(format!("{stem}_{other}"))
}
