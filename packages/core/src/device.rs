//! Device backend protocol.
//!
//! Attaches a regular image file as a block device through one of two control
//! devices and detaches it again:
//!
//! - [`Backend::Lvd`]: the layered virtual disk driver (`/dev/lvdctl`)
//! - [`Backend::Md`]: the legacy memory disk driver (`/dev/mdctl`)
//!
//! Both hand back a unit number whose node (`/dev/lvd<N>` or `/dev/md<N>`)
//! appears asynchronously, so every attach polls for the node before
//! reporting success.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use snafu::whatever;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::preset::ImageFsType;
use crate::stop::StopFlag;
use crate::syscall::{Kernel, MD_ASYNC, MD_AUTOUNIT, MD_READONLY};

const DEV_DIR: &str = "/dev";

/// Raw LVD option mask for a read-only single-image attach.
pub const LVD_RAW_RO: u32 = 0x8;
/// Raw LVD option mask for a read-write single-image attach.
pub const LVD_RAW_RW: u32 = 0x9;
/// Normalized LVD option mask for a read-only UFS download-data attach.
pub const LVD_UFS_RO: u32 = 0x16;
/// Normalized LVD option mask for a read-write UFS download-data attach.
pub const LVD_UFS_RW: u32 = 0x1E;

/// LVD image type for generic images.
pub const LVD_IMAGE_GENERIC: u16 = 0;
/// LVD image type for UFS download-data images.
pub const LVD_IMAGE_UFS_DOWNLOAD_DATA: u16 = 7;

pub const SECTOR_SIZE_DEFAULT: u32 = 512;
pub const SECTOR_SIZE_MAX: u32 = 4096;
/// Sector size always used for MD attaches.
pub const MD_SECTOR_SIZE: u32 = 512;

/// Kernel driver used to attach an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Lvd,
    Md,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Lvd => write!(f, "LVD"),
            Backend::Md => write!(f, "MD"),
        }
    }
}

impl Backend {
    /// Device node name prefix.
    pub fn node_prefix(&self) -> &'static str {
        match self {
            Backend::Lvd => "lvd",
            Backend::Md => "md",
        }
    }

    /// Control device the attach/detach ioctls are issued on.
    pub fn control_path(&self) -> &'static Path {
        match self {
            Backend::Lvd => Path::new("/dev/lvdctl"),
            Backend::Md => Path::new("/dev/mdctl"),
        }
    }

    /// Device node of `unit`, e.g. `/dev/md3`.
    pub fn node_path(&self, unit: i32) -> PathBuf {
        Path::new(DEV_DIR).join(format!("{}{unit}", self.node_prefix()))
    }

    /// Resolves a mount source such as `/dev/lvd2` to its backend and unit.
    ///
    /// # Examples
    ///
    /// ```
    /// use imagemount_core::device::Backend;
    ///
    /// assert_eq!(Backend::parse_node("/dev/md3"), Some((Backend::Md, 3)));
    /// assert_eq!(Backend::parse_node("/dev/lvd0"), Some((Backend::Lvd, 0)));
    /// assert_eq!(Backend::parse_node("/dev/mdctl"), None);
    /// ```
    pub fn parse_node(node: &str) -> Option<(Backend, i32)> {
        let name = node.strip_prefix(DEV_DIR)?.strip_prefix('/')?;
        [Backend::Lvd, Backend::Md].into_iter().find_map(|backend| {
            let digits = name.strip_prefix(backend.node_prefix())?;
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            digits.parse().ok().map(|unit| (backend, unit))
        })
    }
}

/// Expands a raw 4-bit LVD option mask into the length-prefixed encoding the
/// driver validates for non-UFS images.
///
/// ```
/// use imagemount_core::device::lvd_option_len;
///
/// assert_eq!(lvd_option_len(0x8), 0x14);
/// assert_eq!(lvd_option_len(0x9), 0x1C);
/// ```
pub fn lvd_option_len(raw: u32) -> u32 {
    if raw & 0x800A != 0 {
        (raw & 0xFFFF_8000)
            + ((raw & 2) << 6)
            + 8 * (raw & 1)
            + 2 * ((raw >> 2) & 1)
            + 2 * (raw & 8)
            + 4
    } else {
        8 * (raw & 1) + 4
    }
}

/// Sector size requested from LVD for an image on a filesystem with the given
/// block size.
pub fn lvd_sector_size(block_size: Option<u64>) -> u32 {
    match block_size {
        Some(0) | None => SECTOR_SIZE_DEFAULT,
        Some(size) => size.min(SECTOR_SIZE_MAX as u64) as u32,
    }
}

/// The single file-backed layer of an attach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLayer {
    pub path: PathBuf,
    pub offset: u64,
    pub length: u64,
}

impl SourceLayer {
    /// Whole-file layer.
    pub fn file(path: impl Into<PathBuf>, length: u64) -> Self {
        Self {
            path: path.into(),
            offset: 0,
            length,
        }
    }
}

/// One attach attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachRequest {
    pub fs_type: ImageFsType,
    pub backend: Backend,
    pub sector_size: u32,
    /// LVD image type tag. Unused by MD.
    pub image_type: u16,
    /// LVD option word or MD option bits.
    pub options: u32,
    pub image_size: u64,
    pub layer: SourceLayer,
    pub read_only: bool,
}

/// Inputs shared by every attach attempt for one image.
#[derive(Debug, Clone)]
pub struct AttachSpec {
    pub fs_type: ImageFsType,
    pub backend: Backend,
    pub read_only: bool,
    /// Block size of the filesystem holding the image.
    pub block_size: Option<u64>,
    /// LVD image type used for PFS images.
    pub pfs_image_type: u16,
    pub layer: SourceLayer,
}

impl AttachSpec {
    /// Requests to try in order. A read-write attach falls back to read-only.
    pub fn requests(&self) -> Vec<AttachRequest> {
        let modes: &[bool] = if self.read_only { &[true] } else { &[false, true] };
        modes.iter().map(|&ro| self.request(ro)).collect()
    }

    fn request(&self, read_only: bool) -> AttachRequest {
        let (sector_size, image_type, options) = match self.backend {
            Backend::Lvd => {
                let options = match (self.fs_type, read_only) {
                    (ImageFsType::Ufs, true) => LVD_UFS_RO,
                    (ImageFsType::Ufs, false) => LVD_UFS_RW,
                    (_, true) => lvd_option_len(LVD_RAW_RO),
                    (_, false) => lvd_option_len(LVD_RAW_RW),
                };
                let image_type = match self.fs_type {
                    ImageFsType::Ufs => LVD_IMAGE_UFS_DOWNLOAD_DATA,
                    ImageFsType::Pfs => self.pfs_image_type,
                    ImageFsType::Exfat => LVD_IMAGE_GENERIC,
                };
                (lvd_sector_size(self.block_size), image_type, options)
            }
            Backend::Md => {
                let mut options = MD_AUTOUNIT | MD_ASYNC;
                if read_only {
                    options |= MD_READONLY;
                }
                (MD_SECTOR_SIZE, 0, options)
            }
        };

        AttachRequest {
            fs_type: self.fs_type,
            backend: self.backend,
            sector_size,
            image_type,
            options,
            image_size: self.layer.length,
            layer: self.layer.clone(),
            read_only,
        }
    }
}

/// Bounded polling for device node state changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeWait {
    pub retries: u32,
    pub interval: Duration,
}

impl Default for NodeWait {
    fn default() -> Self {
        Self {
            retries: 100,
            interval: Duration::from_millis(100),
        }
    }
}

/// A successfully attached image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub backend: Backend,
    pub unit: i32,
    pub node: PathBuf,
    /// Whether the read-only fallback request was the one accepted.
    pub read_only: bool,
}

/// Polls until `node` exists (or is gone). Returns false on timeout or stop.
pub fn wait_for_node(
    kernel: &dyn Kernel,
    node: &Path,
    present: bool,
    wait: &NodeWait,
    stop: &StopFlag,
) -> bool {
    for _ in 0..wait.retries {
        if kernel.node_exists(node) == present {
            return true;
        }
        if stop.should_stop() {
            return false;
        }
        std::thread::sleep(wait.interval);
    }
    kernel.node_exists(node) == present
}

/// Attaches the image described by `spec`, trying each request of
/// [`AttachSpec::requests`] until one is accepted, then waits for the node.
pub fn attach(
    kernel: &mut dyn Kernel,
    spec: &AttachSpec,
    wait: &NodeWait,
    stop: &StopFlag,
) -> Result<Attachment> {
    let backend = spec.backend;
    let mut last_err: Option<Error> = None;
    let mut accepted = None;

    for request in spec.requests() {
        debug!(
            %backend,
            image = %request.layer.path.display(),
            sector_size = request.sector_size,
            image_type = request.image_type,
            options = format_args!("{:#x}", request.options),
            "attach try"
        );
        match kernel.attach(&request) {
            Ok(unit) => {
                accepted = Some((unit, request.read_only));
                break;
            }
            Err(e) => {
                debug!(
                    %backend,
                    options = format_args!("{:#x}", request.options),
                    error = %e,
                    "attach attempt rejected"
                );
                last_err = Some(e);
            }
        }
    }

    let Some((unit, read_only)) = accepted else {
        return match last_err {
            Some(e) => Err(e),
            None => whatever!("no attach request for {}", spec.layer.path.display()),
        };
    };

    if unit < 0 {
        return Err(Error::InvalidUnit { backend, unit });
    }

    let node = backend.node_path(unit);
    if !wait_for_node(kernel, &node, true, wait, stop) {
        detach(kernel, backend, unit, wait, stop);
        if stop.should_stop() {
            info!(%backend, unit, "attach interrupted by stop request");
            return Err(Error::Interrupted);
        }
        warn!(%backend, node = %node.display(), "device node did not appear");
        return Err(Error::DeviceNodeTimeout { backend, node });
    }

    info!(%backend, unit, node = %node.display(), "attached {}", spec.layer.path.display());
    Ok(Attachment {
        backend,
        unit,
        node,
        read_only,
    })
}

/// Detaches `unit`. Advisory: failures are logged and reported as `false`.
///
/// A negative unit is a no-op. MD retries once with the force bit. Afterwards
/// the node is polled until it disappears.
pub fn detach(
    kernel: &mut dyn Kernel,
    backend: Backend,
    unit: i32,
    wait: &NodeWait,
    stop: &StopFlag,
) -> bool {
    if unit < 0 {
        debug!(%backend, unit, "detach skipped for unknown unit");
        return true;
    }

    if let Err(e) = kernel.detach(backend, unit, false) {
        if backend != Backend::Md {
            warn!(%backend, unit, error = %e, "detach failed");
            return false;
        }
        debug!(%backend, unit, error = %e, "detach failed, retrying with force");
        if let Err(e) = kernel.detach(backend, unit, true) {
            warn!(%backend, unit, error = %e, "forced detach failed");
            return false;
        }
    }

    let node = backend.node_path(unit);
    if !wait_for_node(kernel, &node, false, wait, stop) {
        warn!(%backend, node = %node.display(), "device node still present after detach");
    }
    debug!(%backend, unit, "detached");
    true
}
