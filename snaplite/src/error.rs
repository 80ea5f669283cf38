//! Error types for snapshot management.
//!
//! [`SnapError`] is the library-wide error enum. The merge subsystem
//! additionally records a [`MergeFailureCode`], which is persisted alongside
//! the update state and survives reboots; it is data, not a thrown error.

use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias used throughout the crate.
pub type SnapResult<T> = Result<T, SnapError>;

/// Errors that can occur during snapshot operations.
#[derive(Debug, Error)]
pub enum SnapError {
    /// Persistent store failure (state files, snapshot records, indicators).
    #[error("store: {0}")]
    Store(String),

    /// Failed to acquire or validate the metadata directory lock.
    #[error("lock: {0}")]
    Lock(String),

    /// Device-mapper stack failure.
    #[error("device: {0}")]
    Device(String),

    /// COW daemon connection or request failure.
    #[error("daemon: {0}")]
    Daemon(String),

    /// Super-partition metadata could not be read or is inconsistent.
    #[error("metadata: {0}")]
    Metadata(String),

    /// An operation was requested from an update state that does not allow it.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// COW allocation failed; `required` is the cumulative byte requirement.
    #[error("insufficient space for COW allocation: {required} bytes required")]
    NoSpace { required: u64 },

    /// A deadline was exhausted before the operation completed.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Generic IO error (catch-all).
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

/// Failure codes recorded when a merge cannot make progress.
///
/// The first failure observed during a sweep wins; later failures are logged
/// but do not overwrite the recorded code.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize,
)]
pub enum MergeFailureCode {
    #[default]
    Ok,
    AcquireLock,
    ListSnapshots,
    ReadStatus,
    WriteStatus,
    GetTableInfo,
    GetTableParams,
    UnknownTable,
    ActivateNewTable,
    QuerySnapshotStatus,
    ExpectedMergeTarget,
    UnexpectedMergeState,
    UnknownTargetType,
    UnmergedSectorsAfterCompletion,
    NoSpace,
}

/// Outcome of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelResult {
    /// The update was (or can be) cancelled.
    Ok,
    /// A merge is in progress; it must finish before the update can go away.
    NeedsMerge,
    /// Snapshots are live on the booted slot; cancelling would corrupt it.
    LiveSnapshots,
    /// The cancel attempt itself failed.
    Error,
}

impl std::fmt::Display for CancelResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CancelResult::Ok => "ok",
            CancelResult::NeedsMerge => "needs_merge",
            CancelResult::LiveSnapshots => "live_snapshots",
            CancelResult::Error => "error",
        };
        write!(f, "{s}")
    }
}
