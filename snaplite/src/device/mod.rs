//! Block-layer capabilities.
//!
//! The core never speaks the device-mapper wire protocol or the daemon's
//! socket protocol directly; it goes through the [`BlockStack`] and
//! [`CowDaemon`] capabilities defined here.

mod daemon;
mod stack;
mod table;

pub use daemon::{
    CowDaemon, CowDaemonFactory, DaemonMergeState, SocketCowDaemon, SocketDaemonFactory,
};
pub use stack::{delete_device_with_retries, BlockStack, DEVICE_DELETE_RETRY_INTERVAL};
pub use table::{
    merge_percent, parse_snapshot_status, DeviceState, SnapshotMode, SnapshotTargetStatus,
    TableSpec, TargetEntry, TargetSpec, TargetStatus, SECTOR_SIZE, SNAPSHOT_CHUNK_SIZE,
};
