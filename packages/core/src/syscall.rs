//! Kernel boundary.
//!
//! Everything above this module talks to the kernel through the [`Kernel`]
//! trait using safe value types. The `#[repr(C)]` request layouts for the two
//! attach control devices, the iovec view of a [`MountOptions`] vector and the
//! only `unsafe` blocks of the crate live here.

#![cfg_attr(not(target_os = "freebsd"), allow(dead_code))]

use std::ffi::{CString, c_char, c_int, c_uint, c_void};
use std::mem::{offset_of, size_of};
use std::path::{Path, PathBuf};
use std::ptr;

use nix::errno::Errno;
use nix::libc;

use crate::device::{AttachRequest, Backend};
use crate::error::Result;
use crate::preset::MountOptions;

/// `MDIOVERSION` of the memory-disk ioctl ABI.
pub const MD_IO_VERSION: c_uint = 0;
/// `MD_VNODE`: file-backed memory disk.
pub const MD_TYPE_VNODE: c_uint = 2;
pub const MD_AUTOUNIT: u32 = 0x04;
pub const MD_READONLY: u32 = 0x08;
pub const MD_FORCE: u32 = 0x20;
pub const MD_ASYNC: u32 = 0x40;

/// Version field of the LVD attach payload.
pub const LVD_IO_VERSION: u32 = 1;
/// Layer source type for a regular file.
pub const LVD_SOURCE_FILE: u16 = 1;
/// Layer flag: no bitmap file specified.
pub const LVD_ENTRY_NO_BITMAP: u8 = 0x1;
/// Size of the layer array handed to the kernel.
pub const LVD_LAYER_SLOTS: usize = 3;

const IOC_INOUT: u64 = 0xC000_0000;
const IOCPARM_MASK: usize = 0x1fff;

/// Encodes a BSD `_IOWR(group, num, len)` request code.
pub const fn iowr(group: u8, num: u8, len: usize) -> u64 {
    IOC_INOUT | (((len & IOCPARM_MASK) as u64) << 16) | ((group as u64) << 8) | num as u64
}

/// One backing layer of an LVD device.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct LvdLayer {
    source_type: u16,
    entry_flags: u8,
    reserved0: u8,
    reserved1: u32,
    path: *const c_char,
    offset: u64,
    size: u64,
    bitmap_path: *const c_char,
    bitmap_offset: u64,
    bitmap_size: u64,
}

impl LvdLayer {
    const EMPTY: LvdLayer = LvdLayer {
        source_type: 0,
        entry_flags: 0,
        reserved0: 0,
        reserved1: 0,
        path: ptr::null(),
        offset: 0,
        size: 0,
        bitmap_path: ptr::null(),
        bitmap_offset: 0,
        bitmap_size: 0,
    };

    fn file(path: *const c_char, offset: u64, size: u64) -> Self {
        Self {
            source_type: LVD_SOURCE_FILE,
            entry_flags: LVD_ENTRY_NO_BITMAP,
            path,
            offset,
            size,
            ..Self::EMPTY
        }
    }
}

/// `/dev/lvdctl` attach payload.
#[repr(C)]
#[derive(Debug)]
pub(crate) struct LvdAttachIo {
    io_version: u32,
    device_id: i32,
    sector_size_0: u32,
    sector_size_1: u32,
    option_len: u16,
    image_type: u16,
    layer_count: u32,
    device_size: u64,
    layers: *mut LvdLayer,
}

/// `/dev/lvdctl` detach payload.
#[repr(C)]
#[derive(Debug)]
pub(crate) struct LvdDetachIo {
    reserved0: u32,
    device_id: i32,
    reserved: [u8; 0x20],
}

/// FreeBSD `struct md_ioctl`.
#[repr(C)]
#[derive(Debug)]
pub(crate) struct MdIoctl {
    md_version: c_uint,
    md_unit: c_uint,
    md_type: c_uint,
    md_file: *mut c_char,
    md_mediasize: i64,
    md_sectorsize: c_uint,
    md_options: c_uint,
    md_base: u64,
    md_fwheads: c_int,
    md_fwsectors: c_int,
    md_label: *mut c_char,
    md_pad: [c_int; 96],
}

pub const LVD_IOC_ATTACH: u64 = iowr(b'm', 0x00, size_of::<LvdAttachIo>());
pub const LVD_IOC_DETACH: u64 = iowr(b'm', 0x01, size_of::<LvdDetachIo>());
pub const MD_IOC_ATTACH: u64 = iowr(b'm', 0x00, size_of::<MdIoctl>());
pub const MD_IOC_DETACH: u64 = iowr(b'm', 0x01, size_of::<MdIoctl>());

#[cfg(target_pointer_width = "64")]
const _: () = {
    assert!(size_of::<LvdLayer>() == 0x38);
    assert!(offset_of!(LvdLayer, path) == 0x08);
    assert!(offset_of!(LvdLayer, bitmap_size) == 0x30);
    assert!(size_of::<LvdAttachIo>() == 0x28);
    assert!(offset_of!(LvdAttachIo, option_len) == 0x10);
    assert!(offset_of!(LvdAttachIo, device_size) == 0x18);
    assert!(offset_of!(LvdAttachIo, layers) == 0x20);
    assert!(size_of::<LvdDetachIo>() == 0x28);
    assert!(size_of::<MdIoctl>() == 0x1C0);
    assert!(offset_of!(MdIoctl, md_file) == 0x10);
    assert!(offset_of!(MdIoctl, md_options) == 0x24);
    assert!(LVD_IOC_ATTACH == 0xC028_6D00);
    assert!(LVD_IOC_DETACH == 0xC028_6D01);
};

impl LvdAttachIo {
    fn new(request: &AttachRequest, layers: *mut LvdLayer) -> Self {
        Self {
            io_version: LVD_IO_VERSION,
            device_id: -1,
            sector_size_0: request.sector_size,
            sector_size_1: request.sector_size,
            option_len: request.options as u16,
            image_type: request.image_type,
            layer_count: 1,
            device_size: request.image_size,
            layers,
        }
    }
}

impl MdIoctl {
    fn new(unit: c_uint, options: u32) -> Self {
        Self {
            md_version: MD_IO_VERSION,
            md_unit: unit,
            md_type: 0,
            md_file: ptr::null_mut(),
            md_mediasize: 0,
            md_sectorsize: 0,
            md_options: options,
            md_base: 0,
            md_fwheads: 0,
            md_fwsectors: 0,
            md_label: ptr::null_mut(),
            md_pad: [0; 96],
        }
    }

    fn attach(request: &AttachRequest, file: *mut c_char) -> Self {
        Self {
            md_type: MD_TYPE_VNODE,
            md_file: file,
            md_mediasize: i64::try_from(request.image_size).unwrap_or(i64::MAX),
            md_sectorsize: request.sector_size,
            ..Self::new(0, request.options)
        }
    }
}

/// Filesystem mounted at (or containing) a path, as reported by `statfs(2)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSource {
    /// `f_mntfromname`, e.g. `/dev/md3`.
    pub from: String,
    /// `f_mntonname`, the root of that mount.
    pub on: PathBuf,
}

impl MountSource {
    /// Returns true if `path` is the root of this mount.
    pub fn is_root(&self, path: &Path) -> bool {
        self.on == path
    }
}

/// A mount request refused by the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRejection {
    pub errno: Errno,
    /// Text the kernel wrote into the `errmsg` buffer.
    pub errmsg: Option<String>,
}

/// Kernel operations used by the daemon.
pub trait Kernel {
    /// Issues the attach ioctl of `request.backend`; returns the unit id.
    fn attach(&mut self, request: &AttachRequest) -> Result<i32>;

    /// Issues the detach ioctl for `unit`.
    fn detach(&mut self, backend: Backend, unit: i32, force: bool) -> Result<()>;

    /// Calls `nmount(2)` with the option vector.
    fn nmount(
        &mut self,
        options: &MountOptions,
        flags: u32,
    ) -> std::result::Result<(), MountRejection>;

    /// Calls `unmount(2)`.
    fn unmount(&mut self, path: &Path, flags: u32) -> std::result::Result<(), Errno>;

    /// Mount containing `path`, if it can be queried.
    fn mount_source(&self, path: &Path) -> Option<MountSource>;

    /// Block size of the filesystem holding `path`.
    fn block_size(&self, path: &Path) -> Option<u64>;

    /// Whether a device node exists.
    fn node_exists(&self, node: &Path) -> bool {
        node.exists()
    }
}

/// Builds the iovec view of `options` plus the `errmsg` out buffer.
///
/// The returned vector borrows from `options` and `errmsg`; it must not outlive
/// the call it is built for.
pub(crate) fn build_iovecs(options: &MountOptions, errmsg: &mut [u8]) -> Vec<libc::iovec> {
    fn entry(bytes: &[u8]) -> libc::iovec {
        libc::iovec {
            iov_base: bytes.as_ptr() as *mut c_void,
            iov_len: bytes.len(),
        }
    }

    let mut iov = Vec::with_capacity(options.len() * 2 + 2);
    for (key, value) in options.raw_entries() {
        iov.push(entry(key));
        iov.push(match value {
            Some(value) => entry(value),
            None => libc::iovec {
                iov_base: ptr::null_mut(),
                iov_len: 0,
            },
        });
    }
    if !errmsg.is_empty() {
        iov.push(entry(b"errmsg\0"));
        iov.push(libc::iovec {
            iov_base: errmsg.as_mut_ptr() as *mut c_void,
            iov_len: errmsg.len(),
        });
    }
    iov
}

/// Decodes the kernel's diagnostic buffer.
pub(crate) fn errmsg_text(buf: &[u8]) -> Option<String> {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    let text = String::from_utf8_lossy(&buf[..end]).trim().to_string();
    (!text.is_empty()).then_some(text)
}

fn c_path(path: &Path) -> std::result::Result<CString, Errno> {
    use std::os::unix::ffi::OsStrExt;
    CString::new(path.as_os_str().as_bytes()).map_err(|_| Errno::EINVAL)
}

/// The real kernel.
#[derive(Debug, Default, Clone, Copy)]
pub struct SysKernel;

impl SysKernel {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(target_os = "freebsd")]
mod sys {
    use std::ffi::CStr;
    use std::fs::{File, OpenOptions};
    use std::mem::MaybeUninit;
    use std::os::fd::AsRawFd;

    use snafu::ResultExt;

    use super::*;
    use crate::error::{AttachIoctlSnafu, ControlDeviceOpenSnafu, DetachSnafu};

    fn open_control(backend: Backend) -> Result<File> {
        let path = backend.control_path();
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .context(ControlDeviceOpenSnafu { backend, path })
    }

    /// # Safety
    ///
    /// `arg` must point to the payload type the request code was encoded for.
    unsafe fn ioctl<T>(file: &File, request: u64, arg: *mut T) -> std::result::Result<(), Errno> {
        let rc = unsafe { libc::ioctl(file.as_raw_fd(), request as libc::c_ulong, arg) };
        Errno::result(rc).map(drop)
    }

    pub(super) fn attach(request: &AttachRequest) -> Result<i32> {
        let backend = request.backend;
        let image = &request.layer.path;
        let file = open_control(backend)?;
        let path = c_path(image).context(AttachIoctlSnafu { backend, image })?;

        match backend {
            Backend::Lvd => {
                let mut layers = [LvdLayer::EMPTY; LVD_LAYER_SLOTS];
                let layer = &request.layer;
                layers[0] = LvdLayer::file(path.as_ptr(), layer.offset, layer.length);
                let mut io = LvdAttachIo::new(request, layers.as_mut_ptr());
                // SAFETY: io and the layer array it points to outlive the call.
                unsafe { ioctl(&file, LVD_IOC_ATTACH, &mut io) }
                    .context(AttachIoctlSnafu { backend, image })?;
                Ok(io.device_id)
            }
            Backend::Md => {
                let mut io = MdIoctl::attach(request, path.as_ptr() as *mut c_char);
                // SAFETY: io and the path it points to outlive the call.
                unsafe { ioctl(&file, MD_IOC_ATTACH, &mut io) }
                    .context(AttachIoctlSnafu { backend, image })?;
                Ok(io.md_unit as i32)
            }
        }
    }

    pub(super) fn detach(backend: Backend, unit: i32, force: bool) -> Result<()> {
        let file = open_control(backend)?;
        let outcome = match backend {
            Backend::Lvd => {
                let mut io = LvdDetachIo {
                    reserved0: 0,
                    device_id: unit,
                    reserved: [0; 0x20],
                };
                // SAFETY: io is a live LvdDetachIo.
                unsafe { ioctl(&file, LVD_IOC_DETACH, &mut io) }
            }
            Backend::Md => {
                let mut io = MdIoctl::new(unit as c_uint, if force { MD_FORCE } else { 0 });
                // SAFETY: io is a live MdIoctl.
                unsafe { ioctl(&file, MD_IOC_DETACH, &mut io) }
            }
        };
        outcome.context(DetachSnafu { backend, unit })
    }

    pub(super) fn nmount(
        options: &MountOptions,
        flags: u32,
    ) -> std::result::Result<(), MountRejection> {
        let mut errmsg = vec![0u8; options.errmsg_len()];
        let mut iov = build_iovecs(options, &mut errmsg);
        // SAFETY: every iovec borrows from `options` or `errmsg`, both alive here.
        let rc = unsafe { libc::nmount(iov.as_mut_ptr(), iov.len() as c_uint, flags as c_int) };
        drop(iov);
        Errno::result(rc).map(drop).map_err(|errno| MountRejection {
            errno,
            errmsg: errmsg_text(&errmsg),
        })
    }

    pub(super) fn unmount(path: &Path, flags: u32) -> std::result::Result<(), Errno> {
        let path = c_path(path)?;
        // SAFETY: path is a valid NUL-terminated string.
        Errno::result(unsafe { libc::unmount(path.as_ptr(), flags as c_int) }).map(drop)
    }

    fn statfs(path: &Path) -> Option<libc::statfs> {
        let path = c_path(path).ok()?;
        let mut buf = MaybeUninit::<libc::statfs>::zeroed();
        // SAFETY: buf is large enough for a statfs and is only read on success.
        let rc = unsafe { libc::statfs(path.as_ptr(), buf.as_mut_ptr()) };
        (rc == 0).then(|| unsafe { buf.assume_init() })
    }

    pub(super) fn mount_source(path: &Path) -> Option<MountSource> {
        let sfs = statfs(path)?;
        // SAFETY: the kernel NUL-terminates both name arrays.
        let (from, on) = unsafe {
            (
                CStr::from_ptr(sfs.f_mntfromname.as_ptr()),
                CStr::from_ptr(sfs.f_mntonname.as_ptr()),
            )
        };
        Some(MountSource {
            from: from.to_string_lossy().into_owned(),
            on: PathBuf::from(on.to_string_lossy().into_owned()),
        })
    }

    pub(super) fn block_size(path: &Path) -> Option<u64> {
        statfs(path).map(|sfs| sfs.f_bsize)
    }
}

#[cfg(not(target_os = "freebsd"))]
mod sys {
    use snafu::IntoError;

    use super::*;
    use crate::error::{AttachIoctlSnafu, DetachSnafu};

    pub(super) fn attach(request: &AttachRequest) -> Result<i32> {
        Err(AttachIoctlSnafu {
            backend: request.backend,
            image: request.layer.path.clone(),
        }
        .into_error(Errno::ENOSYS))
    }

    pub(super) fn detach(backend: Backend, unit: i32, _force: bool) -> Result<()> {
        Err(DetachSnafu { backend, unit }.into_error(Errno::ENOSYS))
    }

    pub(super) fn nmount(
        _options: &MountOptions,
        _flags: u32,
    ) -> std::result::Result<(), MountRejection> {
        Err(MountRejection {
            errno: Errno::ENOSYS,
            errmsg: None,
        })
    }

    pub(super) fn unmount(path: &Path, _flags: u32) -> std::result::Result<(), Errno> {
        c_path(path)?;
        Err(Errno::ENOSYS)
    }

    pub(super) fn mount_source(_path: &Path) -> Option<MountSource> {
        None
    }

    pub(super) fn block_size(path: &Path) -> Option<u64> {
        nix::sys::statfs::statfs(path)
            .ok()
            .map(|sfs| sfs.block_size() as u64)
    }
}

impl Kernel for SysKernel {
    fn attach(&mut self, request: &AttachRequest) -> Result<i32> {
        sys::attach(request)
    }

    fn detach(&mut self, backend: Backend, unit: i32, force: bool) -> Result<()> {
        sys::detach(backend, unit, force)
    }

    fn nmount(
        &mut self,
        options: &MountOptions,
        flags: u32,
    ) -> std::result::Result<(), MountRejection> {
        sys::nmount(options, flags)
    }

    fn unmount(&mut self, path: &Path, flags: u32) -> std::result::Result<(), Errno> {
        sys::unmount(path, flags)
    }

    fn mount_source(&self, path: &Path) -> Option<MountSource> {
        sys::mount_source(path)
    }

    fn block_size(&self, path: &Path) -> Option<u64> {
        sys::block_size(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SourceLayer;
    use crate::preset::{ImageFsType, MountOptions};

    fn request(backend: Backend) -> AttachRequest {
        AttachRequest {
            fs_type: ImageFsType::Exfat,
            backend,
            sector_size: 4096,
            image_type: 7,
            options: 0x14,
            image_size: 1 << 30,
            layer: SourceLayer {
                path: PathBuf::from("/data/homebrew/Game.exfat"),
                offset: 0,
                length: 1 << 30,
            },
            read_only: true,
        }
    }

    #[test]
    fn test_request_codes() {
        assert_eq!(LVD_IOC_ATTACH, 0xC028_6D00);
        assert_eq!(LVD_IOC_DETACH, 0xC028_6D01);
        assert_eq!(MD_IOC_ATTACH, 0xC1C0_6D00);
        assert_eq!(MD_IOC_DETACH, 0xC1C0_6D01);
    }

    #[test]
    fn test_lvd_attach_payload() {
        let mut layers = [LvdLayer::EMPTY; LVD_LAYER_SLOTS];
        layers[0] = LvdLayer::file(ptr::null(), 0, 1 << 30);
        let io = LvdAttachIo::new(&request(Backend::Lvd), layers.as_mut_ptr());

        assert_eq!(io.io_version, 1);
        assert_eq!(io.device_id, -1);
        assert_eq!(io.sector_size_0, 4096);
        assert_eq!(io.sector_size_1, 4096);
        assert_eq!(io.option_len, 0x14);
        assert_eq!(io.image_type, 7);
        assert_eq!(io.layer_count, 1);
        assert_eq!(io.device_size, 1 << 30);
        assert_eq!(layers[0].source_type, LVD_SOURCE_FILE);
        assert_eq!(layers[0].entry_flags, LVD_ENTRY_NO_BITMAP);
        assert_eq!(layers[1].source_type, 0);
    }

    #[test]
    fn test_md_attach_payload() {
        let mut req = request(Backend::Md);
        req.sector_size = 512;
        req.options = MD_AUTOUNIT | MD_READONLY | MD_ASYNC;
        let io = MdIoctl::attach(&req, ptr::null_mut());

        assert_eq!(io.md_version, MD_IO_VERSION);
        assert_eq!(io.md_type, MD_TYPE_VNODE);
        assert_eq!(io.md_sectorsize, 512);
        assert_eq!(io.md_options, 0x4C);
        assert_eq!(io.md_mediasize, 1 << 30);
    }

    #[test]
    fn test_iovecs_include_errmsg_buffer() {
        let opts = MountOptions::new()
            .str("fstype", "exfatfs")
            .flag("async")
            .with_errmsg(16);
        let mut errmsg = vec![0u8; opts.errmsg_len()];
        let iov = build_iovecs(&opts, &mut errmsg);

        assert_eq!(iov.len(), 6);
        assert_eq!(iov[0].iov_len, b"fstype\0".len());
        assert_eq!(iov[1].iov_len, b"exfatfs\0".len());
        assert!(iov[3].iov_base.is_null());
        assert_eq!(iov[3].iov_len, 0);
        assert_eq!(iov[5].iov_len, 16);
    }

    #[test]
    fn test_iovecs_without_errmsg() {
        let opts = MountOptions::new().str("fstype", "nullfs");
        let iov = build_iovecs(&opts, &mut []);
        assert_eq!(iov.len(), 2);
    }

    #[test]
    fn test_errmsg_text() {
        assert_eq!(errmsg_text(b"bad key\0\0\0"), Some("bad key".to_string()));
        assert_eq!(errmsg_text(&[0u8; 8]), None);
    }

    #[test]
    fn test_mount_source_root() {
        let src = MountSource {
            from: "/dev/md0".to_string(),
            on: PathBuf::from("/data/imgmnt/exfatmnt/Game"),
        };
        assert!(src.is_root(Path::new("/data/imgmnt/exfatmnt/Game")));
        assert!(!src.is_root(Path::new("/data/imgmnt/exfatmnt")));
    }
}
