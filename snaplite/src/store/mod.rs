//! Persistent store: atomic read/write of the global update record and
//! per-partition snapshot records under the metadata directory lock.
//!
//! Every mutation is write-to-temp + fsync + rename + directory fsync, so an
//! interrupted write leaves either the previous committed contents or the
//! new ones, never a torn file.

mod layout;
mod lock;

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

pub use layout::{files, MetadataLayout};
pub use lock::{DirLock, LockMode};

use crate::error::{SnapError, SnapResult};
use crate::state::{GlobalStatus, SnapshotStatus, UpdateState};

/// Snapshot names promoted to the head of merge listings, so the most
/// consequential partitions are processed first.
const PRIORITY_SNAPSHOT_NAMES: [&str; 4] = ["system_a", "system_b", "product_a", "product_b"];

/// File-backed store for update and snapshot state.
#[derive(Debug)]
pub struct MetadataStore {
    layout: MetadataLayout,
}

impl MetadataStore {
    pub fn new(layout: MetadataLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &MetadataLayout {
        &self.layout
    }

    pub fn lock_shared(&self) -> SnapResult<DirLock> {
        DirLock::acquire(self.layout.root(), LockMode::Shared)
    }

    pub fn lock_exclusive(&self) -> SnapResult<DirLock> {
        DirLock::acquire(self.layout.root(), LockMode::Exclusive)
    }

    // ========================================================================
    // GLOBAL STATUS
    // ========================================================================

    /// Read the global update record.
    ///
    /// A missing file reads as `{state: None}`. A file that does not decode
    /// as the binary encoding falls back to the legacy plain-text state
    /// words; unrecognized contents read as `None` with a warning.
    pub fn read_global(&self, _lock: &DirLock) -> GlobalStatus {
        let path = self.layout.state_file();
        let contents = match std::fs::read(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return GlobalStatus::default();
            }
            Err(err) => {
                tracing::error!(path = %path.display(), %err, "read state file failed");
                return GlobalStatus::default();
            }
        };

        if let Ok(status) = bincode::deserialize::<GlobalStatus>(&contents) {
            return status;
        }

        tracing::warn!(
            path = %path.display(),
            "state file is not binary-encoded, trying the legacy text format"
        );
        let text = String::from_utf8_lossy(&contents);
        let state = match UpdateState::from_legacy(text.trim()) {
            Some(state) => state,
            None => {
                tracing::warn!(contents = %text.trim(), "unknown update state, assuming none");
                UpdateState::None
            }
        };
        GlobalStatus {
            state,
            ..Default::default()
        }
    }

    /// Write the global update record. Requires the exclusive lock.
    pub fn write_global(&self, lock: &DirLock, status: &GlobalStatus) -> SnapResult<()> {
        lock.require_exclusive()?;
        let bytes = bincode::serialize(status)
            .map_err(|err| SnapError::Store(format!("encode global status: {err}")))?;
        write_atomic(&self.layout.state_file(), &bytes)
    }

    pub fn state_file_exists(&self) -> bool {
        self.layout.state_file().exists()
    }

    // ========================================================================
    // SNAPSHOT STATUS
    // ========================================================================

    /// Read one snapshot record. A record whose stored name disagrees with
    /// the file key is repaired to the key.
    pub fn read_snapshot(&self, _lock: &DirLock, name: &str) -> SnapResult<SnapshotStatus> {
        let path = self.layout.snapshot_file(name);
        let contents = std::fs::read(&path)
            .map_err(|err| SnapError::Store(format!("read {}: {err}", path.display())))?;
        let mut status: SnapshotStatus = bincode::deserialize(&contents)
            .map_err(|err| SnapError::Store(format!("decode {}: {err}", path.display())))?;
        if status.name != name {
            tracing::warn!(
                file = name,
                stored = %status.name,
                "snapshot record name mismatch, repairing"
            );
            status.name = name.to_string();
        }
        Ok(status)
    }

    /// Write one snapshot record. Requires the exclusive lock; validates the
    /// sizing invariants first.
    pub fn write_snapshot(&self, lock: &DirLock, status: &SnapshotStatus) -> SnapResult<()> {
        lock.require_exclusive()?;
        status.validate()?;
        let bytes = bincode::serialize(status)
            .map_err(|err| SnapError::Store(format!("encode snapshot {}: {err}", status.name)))?;
        write_atomic(&self.layout.snapshot_file(&status.name), &bytes)
    }

    pub fn snapshot_file_exists(&self, name: &str) -> bool {
        self.layout.snapshot_file(name).exists()
    }

    /// Remove a snapshot record and any stale temp sibling left by an
    /// interrupted write.
    pub fn remove_snapshot_file(&self, lock: &DirLock, name: &str) -> SnapResult<()> {
        lock.require_exclusive()?;
        let path = self.layout.snapshot_file(name);
        remove_if_exists(&path)?;
        let tmp = temp_sibling(&path);
        if let Err(err) = remove_if_exists(&tmp) {
            tracing::error!(path = %tmp.display(), %err, "failed to remove stale snapshot temp file");
        }
        Ok(())
    }

    /// List snapshot record names, optionally filtered to a slot suffix.
    ///
    /// System and product partitions are moved to the head so they merge
    /// first; the remaining order is unspecified.
    pub fn list_snapshots(
        &self,
        _lock: &DirLock,
        suffix: Option<&str>,
    ) -> SnapResult<Vec<String>> {
        let dir = self.layout.snapshots_dir();
        let entries = std::fs::read_dir(&dir)
            .map_err(|err| SnapError::Store(format!("read {}: {err}", dir.display())))?;

        let mut snapshots = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|err| SnapError::Store(format!("read {}: {err}", dir.display())))?;
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(suffix) = suffix {
                if !name.ends_with(suffix) {
                    continue;
                }
            }
            if PRIORITY_SNAPSHOT_NAMES.contains(&name.as_str()) {
                snapshots.insert(0, name);
            } else {
                snapshots.push(name);
            }
        }
        Ok(snapshots)
    }

    // ========================================================================
    // INDICATOR FILES
    // ========================================================================

    pub fn write_indicator(&self, path: &Path, contents: &str) -> SnapResult<()> {
        write_atomic(path, contents.as_bytes())
    }

    pub fn remove_indicator(&self, path: &Path) -> SnapResult<()> {
        remove_if_exists(path)
    }

    pub fn read_indicator(&self, path: &Path) -> Option<String> {
        std::fs::read_to_string(path).ok()
    }
}

fn temp_sibling(path: &Path) -> std::path::PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    std::path::PathBuf::from(tmp)
}

/// Write `contents` to `path` atomically: temp file, fsync, rename, then
/// fsync the containing directory so the rename itself is durable.
pub fn write_atomic(path: &Path, contents: &[u8]) -> SnapResult<()> {
    let tmp = temp_sibling(path);
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)
            .map_err(|err| SnapError::Store(format!("open {}: {err}", tmp.display())))?;
        file.write_all(contents)
            .map_err(|err| SnapError::Store(format!("write {}: {err}", tmp.display())))?;
        // rename() without fsync() is not durable; the data could still be
        // sitting in the page cache.
        if let Err(err) = file.sync_all() {
            tracing::error!(path = %tmp.display(), %err, "fsync failed");
        }
    }
    std::fs::rename(&tmp, path).map_err(|err| {
        SnapError::Store(format!(
            "rename {} to {}: {err}",
            tmp.display(),
            path.display()
        ))
    })?;
    fsync_parent_dir(path);
    Ok(())
}

fn fsync_parent_dir(path: &Path) {
    let Some(parent) = path.parent() else { return };
    match File::open(parent) {
        Ok(dir) => {
            if let Err(err) = dir.sync_all() {
                // Some filesystems cannot sync directories; not fatal.
                tracing::warn!(dir = %parent.display(), %err, "directory fsync failed");
            }
        }
        Err(err) => {
            tracing::error!(dir = %parent.display(), %err, "open for fsync failed");
        }
    }
}

fn remove_if_exists(path: &Path) -> SnapResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(SnapError::Store(format!(
            "remove {}: {err}",
            path.display()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{MergePhase, SnapshotState};
    use tempfile::TempDir;

    struct Fixture {
        store: MetadataStore,
        _dir: TempDir,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let layout = MetadataLayout::new(dir.path());
        layout.prepare().unwrap();
        Fixture {
            store: MetadataStore::new(layout),
            _dir: dir,
        }
    }

    fn snapshot(name: &str) -> SnapshotStatus {
        SnapshotStatus {
            name: name.to_string(),
            state: SnapshotState::Created,
            device_size: 4096,
            snapshot_size: 4096,
            cow_file_size: 1024 * 512,
            ..Default::default()
        }
    }

    #[test]
    fn test_read_global_missing_file_is_none() {
        let f = fixture();
        let lock = f.store.lock_shared().unwrap();
        assert_eq!(f.store.read_global(&lock).state, UpdateState::None);
    }

    #[test]
    fn test_global_round_trip() {
        let f = fixture();
        let lock = f.store.lock_exclusive().unwrap();
        let status = GlobalStatus {
            state: UpdateState::Merging,
            merge_phase: MergePhase::First,
            using_daemon: true,
            ..Default::default()
        };
        f.store.write_global(&lock, &status).unwrap();
        assert_eq!(f.store.read_global(&lock), status);
    }

    #[test]
    fn test_write_global_requires_exclusive_lock() {
        let f = fixture();
        let lock = f.store.lock_shared().unwrap();
        let err = f
            .store
            .write_global(&lock, &GlobalStatus::default())
            .unwrap_err();
        assert!(matches!(err, SnapError::Lock(_)));
    }

    #[test]
    fn test_legacy_text_state_decodes() {
        let f = fixture();
        std::fs::write(f.store.layout().state_file(), "merge-completed").unwrap();
        let lock = f.store.lock_shared().unwrap();
        assert_eq!(
            f.store.read_global(&lock).state,
            UpdateState::MergeCompleted
        );
    }

    #[test]
    fn test_unrecognized_state_reads_as_none() {
        let f = fixture();
        std::fs::write(f.store.layout().state_file(), "what-is-this").unwrap();
        let lock = f.store.lock_shared().unwrap();
        assert_eq!(f.store.read_global(&lock).state, UpdateState::None);
    }

    #[test]
    fn test_snapshot_round_trip_and_name_repair() {
        let f = fixture();
        let lock = f.store.lock_exclusive().unwrap();
        let status = snapshot("system_b");
        f.store.write_snapshot(&lock, &status).unwrap();
        assert_eq!(f.store.read_snapshot(&lock, "system_b").unwrap(), status);

        // A record copied under the wrong key is repaired on read.
        std::fs::copy(
            f.store.layout().snapshot_file("system_b"),
            f.store.layout().snapshot_file("vendor_b"),
        )
        .unwrap();
        let repaired = f.store.read_snapshot(&lock, "vendor_b").unwrap();
        assert_eq!(repaired.name, "vendor_b");
    }

    #[test]
    fn test_write_snapshot_rejects_unaligned_sizes() {
        let f = fixture();
        let lock = f.store.lock_exclusive().unwrap();
        let mut status = snapshot("system_b");
        status.cow_file_size += 3;
        assert!(f.store.write_snapshot(&lock, &status).is_err());
    }

    #[test]
    fn test_list_snapshots_priority_and_suffix() {
        let f = fixture();
        let lock = f.store.lock_exclusive().unwrap();
        for name in ["vendor_b", "system_b", "odm_b", "vendor_a"] {
            f.store.write_snapshot(&lock, &snapshot(name)).unwrap();
        }
        let all = f.store.list_snapshots(&lock, Some("_b")).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0], "system_b");
        assert!(!all.contains(&"vendor_a".to_string()));
    }

    #[test]
    fn test_remove_snapshot_clears_temp_sibling() {
        let f = fixture();
        let lock = f.store.lock_exclusive().unwrap();
        f.store.write_snapshot(&lock, &snapshot("system_b")).unwrap();
        let tmp = f
            .store
            .layout()
            .snapshot_file("system_b")
            .with_extension("tmp");
        std::fs::write(&tmp, b"stale").unwrap();
        f.store.remove_snapshot_file(&lock, "system_b").unwrap();
        assert!(!f.store.snapshot_file_exists("system_b"));
        assert!(!tmp.exists());
    }

    #[test]
    fn test_atomic_write_leaves_no_temp_on_success() {
        let f = fixture();
        let lock = f.store.lock_exclusive().unwrap();
        f.store
            .write_global(&lock, &GlobalStatus::default())
            .unwrap();
        let tmp = temp_sibling(&f.store.layout().state_file());
        assert!(!tmp.exists());
    }
}
