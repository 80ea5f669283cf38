//! Persisted data model: the global update record and per-partition
//! snapshot records.

mod snapshot;
mod update;

pub use snapshot::{SnapshotState, SnapshotStatus};
pub use update::{GlobalStatus, MergePhase, UpdateState};
