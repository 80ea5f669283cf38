//! Global update lifecycle state.
//!
//! [`GlobalStatus`] is the singleton record persisted in the metadata
//! directory. It is binary-encoded on disk; when the file does not decode,
//! readers fall back to the legacy plain-text state words that older
//! installations wrote.

use serde::{Deserialize, Serialize};

use crate::error::MergeFailureCode;

/// Lifecycle state of the update as a whole.
///
/// ```text
/// begin_update()            → Initiated
/// finished_snapshot_writes()→ Unverified
/// initiate_merge()          → Merging
/// (poll)                    → MergeCompleted | MergeNeedsReboot | MergeFailed
/// ack / cancel              → None | Cancelled
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateState {
    /// No update in progress.
    #[default]
    None,
    /// An update is being applied; snapshots may exist but writes are not
    /// finished.
    Initiated,
    /// Snapshot writes are done, but the device has not yet booted and
    /// verified the new slot.
    Unverified,
    /// The device booted the new slot and COW contents are merging back.
    Merging,
    /// Per-device cleanup could not finish; a reboot will retry it.
    MergeNeedsReboot,
    /// The merge finished; update state can be cleared.
    MergeCompleted,
    /// The merge hit an unrecoverable condition this attempt. Retried on
    /// every subsequent boot.
    MergeFailed,
    /// The underlying partitions changed out from under the update.
    Cancelled,
}

impl UpdateState {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateState::None => "none",
            UpdateState::Initiated => "initiated",
            UpdateState::Unverified => "unverified",
            UpdateState::Merging => "merging",
            UpdateState::MergeNeedsReboot => "merge-needs-reboot",
            UpdateState::MergeCompleted => "merge-completed",
            UpdateState::MergeFailed => "merge-failed",
            UpdateState::Cancelled => "cancelled",
        }
    }

    /// Decode the legacy plain-text state file contents.
    ///
    /// Unrecognized contents decode to `None`; the caller logs a warning.
    pub fn from_legacy(contents: &str) -> Option<Self> {
        match contents {
            "" | "none" => Some(UpdateState::None),
            "initiated" => Some(UpdateState::Initiated),
            "unverified" => Some(UpdateState::Unverified),
            "merging" => Some(UpdateState::Merging),
            "merge-needs-reboot" => Some(UpdateState::MergeNeedsReboot),
            "merge-completed" => Some(UpdateState::MergeCompleted),
            "merge-failed" => Some(UpdateState::MergeFailed),
            "cancelled" => Some(UpdateState::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for UpdateState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Two-phase merge ordering discipline.
///
/// Partitions that shrunk must finish merging before any other partition is
/// switched to a merge target; otherwise a merge could overwrite blocks that
/// are still the source of a pending copy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergePhase {
    #[default]
    None,
    First,
    Second,
}

impl std::fmt::Display for MergePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MergePhase::None => "none",
            MergePhase::First => "first",
            MergePhase::Second => "second",
        };
        write!(f, "{s}")
    }
}

/// The persisted singleton update record.
///
/// Tuning knobs are opaque to the core: they are recorded when the update is
/// created and handed through to the COW daemon on the other side of the
/// reboot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalStatus {
    pub state: UpdateState,

    /// The userspace COW daemon serves snapshot reads/writes for this update.
    pub using_daemon: bool,
    /// dm-user devices are the snapshot devices themselves (vs. the legacy
    /// kernel dm-snapshot stack).
    pub userspace_snapshots: bool,
    /// The vendor partition predates the userspace driver; post-reboot the
    /// device stack must fall back to the kernel path.
    pub legacy_compat: bool,

    pub merge_phase: MergePhase,
    pub merge_failure_code: MergeFailureCode,
    pub source_build_fingerprint: String,

    /// Baseline snapshot accounting captured when the merge was initiated;
    /// used to compute the kernel-driver merge percentage.
    pub sectors_allocated: u64,
    pub total_sectors: u64,
    pub metadata_sectors: u64,

    // Daemon tuning, recorded at update creation and passed through.
    pub io_uring: bool,
    pub o_direct: bool,
    pub skip_verification: bool,
    pub cow_op_merge_size: u32,
    pub worker_count: u32,
    pub verify_block_size: u32,
    pub verification_threads: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_string_round_trip() {
        let all = [
            UpdateState::None,
            UpdateState::Initiated,
            UpdateState::Unverified,
            UpdateState::Merging,
            UpdateState::MergeNeedsReboot,
            UpdateState::MergeCompleted,
            UpdateState::MergeFailed,
            UpdateState::Cancelled,
        ];
        for state in all {
            assert_eq!(UpdateState::from_legacy(state.as_str()), Some(state));
        }
    }

    #[test]
    fn test_legacy_empty_is_none() {
        assert_eq!(UpdateState::from_legacy(""), Some(UpdateState::None));
    }

    #[test]
    fn test_legacy_unknown_is_rejected() {
        assert_eq!(UpdateState::from_legacy("bogus"), None);
    }

    #[test]
    fn test_binary_round_trip() {
        let status = GlobalStatus {
            state: UpdateState::Merging,
            using_daemon: true,
            userspace_snapshots: true,
            merge_phase: MergePhase::First,
            source_build_fingerprint: "generic/aosp:14".to_string(),
            worker_count: 4,
            ..Default::default()
        };
        let bytes = bincode::serialize(&status).unwrap();
        let decoded: GlobalStatus = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, status);
    }

    #[test]
    fn test_legacy_text_does_not_decode_as_binary() {
        // A legacy state file holds a bare word; it must not be mistaken for
        // the binary encoding.
        for word in ["none", "merging", "merge-completed"] {
            assert!(bincode::deserialize::<GlobalStatus>(word.as_bytes()).is_err());
        }
    }
}
