//! Mount operations module.
//!
//! This module issues `nmount(2)`/`unmount(2)` through the [`Kernel`] seam:
//! primary image mounts, union overlays, nullfs binds, and a verified
//! unmount that escalates to a forced one. It also owns the mount point
//! directory helpers.

use std::fs;
use std::path::Path;

use nix::errno::Errno;
use tracing::{debug, warn};

use crate::device::Backend;
use crate::error::{Error, IoResultExt, Result};
use crate::preset::{self, ImageFsType, MNT_FORCE, PfsProfile};
use crate::syscall::Kernel;

/// Creates a mount point directory if it doesn't exist.
pub fn create_mount_point(path: &Path) -> Result<()> {
    if !path.exists() {
        fs::create_dir_all(path).mount_point_context(path)?;
    }
    Ok(())
}

/// Removes `path` if it is an empty directory. Returns true if removed.
pub fn remove_mount_point_if_empty(path: &Path) -> bool {
    match fs::remove_dir(path) {
        Ok(()) => {
            debug!(path = %path.display(), "removed mount point");
            true
        }
        Err(_) => false,
    }
}

/// Returns true if `path` is a directory with at least one visible entry.
pub fn is_populated(path: &Path) -> bool {
    fs::read_dir(path)
        .map(|mut entries| {
            entries.any(|e| e.is_ok_and(|e| !e.file_name().to_string_lossy().starts_with('.')))
        })
        .unwrap_or(false)
}

/// Returns true if `path` is the root of a mount.
pub fn is_mount_point(kernel: &dyn Kernel, path: &Path) -> bool {
    kernel
        .mount_source(path)
        .is_some_and(|src| src.is_root(path))
}

/// Resolves the backing device of an image mounted at `path`.
///
/// Returns `None` unless `path` is a mount root whose source is an LVD or MD
/// device node.
pub fn active_image_mount(kernel: &dyn Kernel, path: &Path) -> Option<(Backend, i32)> {
    let src = kernel.mount_source(path)?;
    if !src.is_root(path) {
        return None;
    }
    Backend::parse_node(&src.from)
}

/// Mounts the attached `node` at `mount_point`. One attempt only.
pub fn mount_image(
    kernel: &mut dyn Kernel,
    fs_type: ImageFsType,
    node: &Path,
    mount_point: &Path,
    read_only: bool,
    pfs: &PfsProfile,
) -> Result<()> {
    let opts = preset::image_mount_options(fs_type, node, mount_point, pfs);
    let flags = preset::primary_mount_flags(fs_type, read_only);
    debug!(
        %fs_type,
        node = %node.display(),
        mount_point = %mount_point.display(),
        flags = format_args!("{flags:#x}"),
        "nmount"
    );
    kernel.nmount(&opts, flags).map_err(|r| Error::Mount {
        fs_type,
        mount_point: mount_point.to_path_buf(),
        source: r.errno,
        errmsg: r.errmsg,
    })
}

/// Stacks a union mount of `upper` onto `mount_point`.
pub fn mount_overlay(
    kernel: &mut dyn Kernel,
    upper: &Path,
    mount_point: &Path,
    read_only: bool,
) -> Result<()> {
    let opts = preset::overlay_options(upper, mount_point);
    kernel
        .nmount(&opts, preset::plain_flags(read_only))
        .map_err(|r| Error::Overlay {
            upper: upper.to_path_buf(),
            mount_point: mount_point.to_path_buf(),
            source: r.errno,
            errmsg: r.errmsg,
        })
}

/// Bind mounts `src` onto `dst` with nullfs.
pub fn mount_nullfs(
    kernel: &mut dyn Kernel,
    src: &Path,
    dst: &Path,
    read_only: bool,
) -> Result<()> {
    let opts = preset::nullfs_options(src, dst);
    kernel
        .nmount(&opts, preset::plain_flags(read_only))
        .map_err(|r| Error::Bind {
            from: src.to_path_buf(),
            target: dst.to_path_buf(),
            source: r.errno,
            errmsg: r.errmsg,
        })
}

fn not_mounted(errno: Errno) -> bool {
    matches!(errno, Errno::ENOENT | Errno::EINVAL)
}

/// Removes the topmost mount at `path`: plain first, then forced.
///
/// A path that is not mounted counts as success.
pub fn unmount_layer(kernel: &mut dyn Kernel, path: &Path) -> Result<()> {
    let errno = match kernel.unmount(path, 0) {
        Ok(()) => return Ok(()),
        Err(e) if not_mounted(e) => return Ok(()),
        Err(e) => e,
    };
    debug!(path = %path.display(), error = %errno, "unmount failed, trying force");
    match kernel.unmount(path, MNT_FORCE) {
        Ok(()) => Ok(()),
        Err(e) if not_mounted(e) => Ok(()),
        Err(source) => {
            warn!(path = %path.display(), error = %source, "forced unmount failed");
            Err(Error::Unmount {
                path: path.to_path_buf(),
                source,
            })
        }
    }
}

/// Unmounts `path` and verifies it is no longer a mount point.
///
/// Idempotent: unmounting a path that is not mounted succeeds without side
/// effects.
pub fn unmount(kernel: &mut dyn Kernel, path: &Path) -> Result<()> {
    unmount_layer(kernel, path)?;
    if is_mount_point(kernel, path) {
        warn!(path = %path.display(), "still mounted after unmount");
        return Err(Error::Unmount {
            path: path.to_path_buf(),
            source: Errno::EBUSY,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::preset::{MNT_RDONLY, UFS_DOWNLOAD_DATA_FLAGS};
    use crate::syscall::MountRejection;
    use crate::testing::FakeKernel;

    #[test]
    fn test_mount_point_helpers() {
        let dir = tempfile::tempdir().unwrap();
        let mp = dir.path().join("exfatmnt").join("Game");

        create_mount_point(&mp).unwrap();
        assert!(mp.is_dir());
        assert!(!is_populated(&mp));

        fs::write(mp.join(".dot"), b"").unwrap();
        assert!(!is_populated(&mp));
        fs::write(mp.join("eboot.bin"), b"").unwrap();
        assert!(is_populated(&mp));
        assert!(!remove_mount_point_if_empty(&mp));

        fs::remove_file(mp.join("eboot.bin")).unwrap();
        fs::remove_file(mp.join(".dot")).unwrap();
        assert!(remove_mount_point_if_empty(&mp));
        assert!(!mp.exists());
    }

    #[test]
    fn test_mount_image_flags_and_errmsg() {
        let mut kernel = FakeKernel::new();
        let mp = Path::new("/data/imgmnt/ufsmnt/Game");
        mount_image(
            &mut kernel,
            ImageFsType::Ufs,
            Path::new("/dev/lvd0"),
            mp,
            true,
            &PfsProfile::default(),
        )
        .unwrap();
        assert_eq!(kernel.mount_calls[0].1, UFS_DOWNLOAD_DATA_FLAGS);
        assert_eq!(active_image_mount(&kernel, mp), Some((Backend::Lvd, 0)));

        kernel.mount_errors.push_back(MountRejection {
            errno: Errno::EINVAL,
            errmsg: Some("Invalid fstype".to_string()),
        });
        let err = mount_image(
            &mut kernel,
            ImageFsType::Exfat,
            Path::new("/dev/md1"),
            Path::new("/data/imgmnt/exfatmnt/Other"),
            true,
            &PfsProfile::default(),
        )
        .unwrap_err();
        assert_eq!(kernel.mount_calls[1].1, MNT_RDONLY);
        assert_eq!(err.kernel_message(), Some("Invalid fstype"));
    }

    #[test]
    fn test_unmount_not_mounted_is_success() {
        let mut kernel = FakeKernel::new();
        unmount(&mut kernel, Path::new("/data/imgmnt/exfatmnt/None")).unwrap();
        assert_eq!(kernel.unmount_calls.len(), 1);
        assert!(kernel.mounts.is_empty());
    }

    #[test]
    fn test_unmount_escalates_to_force() {
        let mut kernel = FakeKernel::new();
        let mp = PathBuf::from("/data/imgmnt/pfsmnt/Game");
        kernel.add_mount("/dev/lvd3", &mp);
        kernel.unmount_errors.push_back(Errno::EBUSY);

        unmount(&mut kernel, &mp).unwrap();
        assert_eq!(kernel.unmount_calls, vec![(mp.clone(), 0), (mp.clone(), MNT_FORCE)]);
        assert!(!kernel.is_mounted(&mp));
    }

    #[test]
    fn test_unmount_reports_failure() {
        let mut kernel = FakeKernel::new();
        let mp = PathBuf::from("/data/imgmnt/pfsmnt/Game");
        kernel.add_mount("/dev/lvd3", &mp);
        kernel.unmount_errors.extend([Errno::EBUSY, Errno::EBUSY]);

        let err = unmount(&mut kernel, &mp).unwrap_err();
        assert!(matches!(err, Error::Unmount { source: Errno::EBUSY, .. }));
        assert!(kernel.is_mounted(&mp));
    }

    #[test]
    fn test_unmount_verifies_stacked_mounts() {
        let mut kernel = FakeKernel::new();
        let mp = PathBuf::from("/data/imgmnt/exfatmnt/Game");
        kernel.add_mount("/dev/md0", &mp);
        kernel.add_mount("/data/backports/CUSA00001", &mp);

        unmount_layer(&mut kernel, &mp).unwrap();
        assert_eq!(active_image_mount(&kernel, &mp), Some((Backend::Md, 0)));
        // a single layer still leaves the image mounted
        kernel.add_mount("/data/backports/CUSA00001", &mp);
        assert!(unmount(&mut kernel, &mp).is_err());
    }

    #[test]
    fn test_overlay_and_bind() {
        let mut kernel = FakeKernel::new();
        let mp = Path::new("/data/imgmnt/ufsmnt/Game");
        mount_overlay(&mut kernel, Path::new("/data/backports/CUSA1"), mp, true).unwrap();
        mount_nullfs(&mut kernel, mp, Path::new("/system_ex/app/CUSA1"), true).unwrap();
        assert_eq!(kernel.mounted_types(), ["unionfs", "nullfs"]);
        assert!(active_image_mount(&kernel, mp).is_none());
    }
}
