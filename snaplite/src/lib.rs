//! Snapshot lifecycle and merge orchestration for seamless A/B updates.
//!
//! During an update, the inactive slot's logical partitions are written
//! through copy-on-write devices layered over the old blocks. After the
//! device reboots into the new slot and verifies it, the COW contents are
//! merged back into the base partitions and the stack collapses to plain
//! linear devices.
//!
//! [`SnapshotManager`] owns the whole flow:
//!
//! ```text
//! begin_update → create_update_snapshots → finished_snapshot_writes
//!      (reboot into the new slot; first-stage mount reassembles stacks)
//! initiate_merge → process_update_state → state returns to None
//! ```
//!
//! The manager is built against four capabilities so the block layer, the
//! COW daemon, the bootloader, and COW sizing stay out of this crate:
//! [`device::BlockStack`], [`device::CowDaemon`], [`slot::DeviceInfo`], and
//! [`planner::CowPlanner`].
//!
//! Consistency rules: every persisted record is written atomically under an
//! exclusive directory lock, per-entity merge completion is persisted before
//! destructive teardown, and a failed merge is retried on every boot until
//! it converges.

pub mod device;
pub mod error;
pub mod images;
pub mod metadata;
pub mod planner;
pub mod slot;
pub mod state;
pub mod store;

mod boot;
mod entity;
mod manager;
mod merge;
mod update;

pub use boot::InitTransition;
pub use entity::MapContext;
pub use error::{CancelResult, MergeFailureCode, SnapError, SnapResult};
pub use manager::{SnapshotDriver, SnapshotManager, SnapshotManagerBuilder};
pub use planner::{CowPlan, CowPlanner, PartitionUpdate, UpdateManifest, UpdateOptions};
pub use slot::{DeviceInfo, MergeIndicator, Slot};
pub use state::{GlobalStatus, MergePhase, SnapshotState, SnapshotStatus, UpdateState};
