//! File-backed COW image storage.
//!
//! Images live as sized files under the metadata directory. Mapping an image
//! hands out its path; stitching it under a device-mapper table is the
//! caller's concern.

use std::path::{Path, PathBuf};

use crate::error::{SnapError, SnapResult};

const IMAGE_EXTENSION: &str = "img";
const DISABLED_EXTENSION: &str = "disabled";

/// Store of file-backed COW images.
#[derive(Debug)]
pub struct CowImageStore {
    dir: PathBuf,
}

impl CowImageStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn image_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.{IMAGE_EXTENSION}"))
    }

    fn disabled_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.{DISABLED_EXTENSION}"))
    }

    /// Allocate a backing image of exactly `size` bytes.
    ///
    /// Allocation failure from a full filesystem surfaces as
    /// [`SnapError::NoSpace`] carrying this image's requirement; the caller
    /// accumulates the total.
    pub fn create_backing_image(&self, name: &str, size: u64) -> SnapResult<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.image_path(name);
        let file = std::fs::File::create(&path)
            .map_err(|err| SnapError::Store(format!("create {}: {err}", path.display())))?;
        if let Err(err) = file.set_len(size) {
            let _ = std::fs::remove_file(&path);
            if err.raw_os_error() == Some(libc::ENOSPC) {
                return Err(SnapError::NoSpace { required: size });
            }
            return Err(SnapError::Store(format!(
                "allocate {} ({size} bytes): {err}",
                path.display()
            )));
        }
        tracing::info!(image = name, size, "allocated backing image");
        Ok(())
    }

    pub fn backing_image_exists(&self, name: &str) -> bool {
        self.image_path(name).exists()
    }

    pub fn delete_backing_image(&self, name: &str) -> SnapResult<()> {
        remove_if_exists(&self.image_path(name))?;
        remove_if_exists(&self.disabled_path(name))
    }

    /// Hand out the backing path of an existing image.
    pub fn map_image(&self, name: &str) -> SnapResult<PathBuf> {
        let path = self.image_path(name);
        if !path.exists() {
            return Err(SnapError::Store(format!(
                "no backing image for {name}"
            )));
        }
        Ok(path)
    }

    /// Unmapping is a no-op for plain file backing; kept for symmetry with
    /// the mapping call sites.
    pub fn unmap_image_if_exists(&self, _name: &str) -> SnapResult<()> {
        Ok(())
    }

    /// Delete every image. Used when cancelling an update or purging stale
    /// artifacts before a new one.
    pub fn remove_all_images(&self) -> SnapResult<()> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                return Err(SnapError::Store(format!(
                    "read {}: {err}",
                    self.dir.display()
                )))
            }
        };
        for entry in entries {
            let entry = entry
                .map_err(|err| SnapError::Store(format!("read {}: {err}", self.dir.display())))?;
            remove_if_exists(&entry.path())?;
        }
        Ok(())
    }

    /// Mark every image for removal on the next boot. Recovery cannot delete
    /// in-use backing storage, so images are renamed aside and purged by the
    /// next `remove_all_images`.
    pub fn disable_all_images(&self) -> SnapResult<()> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                return Err(SnapError::Store(format!(
                    "read {}: {err}",
                    self.dir.display()
                )))
            }
        };
        for entry in entries {
            let entry = entry
                .map_err(|err| SnapError::Store(format!("read {}: {err}", self.dir.display())))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some(IMAGE_EXTENSION) {
                let disabled = path.with_extension(DISABLED_EXTENSION);
                std::fs::rename(&path, &disabled).map_err(|err| {
                    SnapError::Store(format!("disable {}: {err}", path.display()))
                })?;
            }
        }
        Ok(())
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
