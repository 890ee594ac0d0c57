//! Disk image discovery.
//!
//! Finds image files (`.ffpkg`, `.exfat`, `.ffpfs`) directly under the scan
//! roots and derives where each one is mounted.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::trace;

use crate::preset::ImageFsType;
use crate::stop::StopFlag;

/// An image file found under a scan root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskImage {
    pub path: PathBuf,
    pub fs_type: ImageFsType,
    /// Size in bytes.
    pub size: u64,
    pub modified: SystemTime,
}

impl DiskImage {
    /// Inspects `path`. Returns `None` for non-image names and non-regular files.
    pub fn from_path(path: &Path) -> Option<Self> {
        let fs_type = ImageFsType::from_file_name(path.file_name()?.to_str()?)?;
        let meta = fs::metadata(path).ok()?;
        if !meta.is_file() {
            return None;
        }
        Some(Self {
            path: path.to_path_buf(),
            fs_type,
            size: meta.len(),
            modified: meta.modified().ok()?,
        })
    }

    /// File name without its extension (`Game.exfat` -> `Game`).
    pub fn stem(&self) -> String {
        image_stem(&self.path)
    }

    /// `<mount_base>/<fs-subdir>/<stem>`
    pub fn mount_point(&self, mount_base: &Path) -> PathBuf {
        mount_base.join(self.fs_type.mount_subdir()).join(self.stem())
    }

    /// Time since the last modification (zero if in the future).
    pub fn age(&self) -> Duration {
        modified_age(self.modified)
    }

    /// Whether the file has been left alone for at least `threshold`.
    pub fn is_stable(&self, threshold: Duration) -> bool {
        self.age() >= threshold
    }
}

/// Returns the file name of `path` with its last extension removed.
pub fn image_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

pub(crate) fn modified_age(modified: SystemTime) -> Duration {
    SystemTime::now()
        .duration_since(modified)
        .unwrap_or(Duration::ZERO)
}

/// Lists the visible entries of `dir`, sorted. Missing directories yield none.
pub(crate) fn visible_entries(dir: &Path) -> Vec<PathBuf> {
    let Ok(read) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut entries: Vec<PathBuf> = read
        .filter_map(|e| e.ok())
        .filter(|e| !e.file_name().to_string_lossy().starts_with('.'))
        .map(|e| e.path())
        .collect();
    entries.sort();
    entries
}

/// Finds image files directly under `root`.
///
/// Roots at or below `mount_base` are skipped so mounted images are never
/// scanned for nested images. Stops early when `stop` trips.
pub fn scan_images(root: &Path, mount_base: &Path, stop: &StopFlag) -> Vec<DiskImage> {
    if root.starts_with(mount_base) {
        return Vec::new();
    }
    let mut images = Vec::new();
    for entry in visible_entries(root) {
        if stop.should_stop() {
            break;
        }
        if let Some(image) = DiskImage::from_path(&entry) {
            trace!(path = %image.path.display(), fs_type = %image.fs_type, "found image");
            images.push(image);
        }
    }
    images
}
