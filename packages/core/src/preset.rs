//! Mount presets for the supported image filesystems.
//!
//! This module knows how each image filesystem wants to be mounted:
//! - which file extensions map to which filesystem
//! - the ordered key/value vector handed to `nmount(2)`
//! - the primary mount flag word for a read-only/read-write policy

use std::ffi::OsStr;
use std::fmt;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Size of the kernel diagnostic buffer passed as `errmsg`.
pub const ERRMSG_LEN: usize = 256;

/// `MNT_RDONLY` from `sys/mount.h`.
pub const MNT_RDONLY: u32 = 0x0000_0001;

/// `MNT_FORCE` from `sys/mount.h`.
pub const MNT_FORCE: u32 = 0x0008_0000;

/// Base of the UFS "download data" flag pair (RO = base, RW = base + 1).
pub const UFS_DOWNLOAD_DATA_FLAGS: u32 = 0x1000_0000;

/// Placeholder content key handed to PFS mounts (32 zero bytes, hex encoded).
pub const PFS_ZERO_EKPFS: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// Image filesystems the daemon knows how to attach and mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFsType {
    Ufs,
    Exfat,
    Pfs,
}

impl TryFrom<&str> for ImageFsType {
    type Error = crate::error::Error;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "ufs" | "ufs2" => Ok(ImageFsType::Ufs),
            "exfat" | "exfatfs" => Ok(ImageFsType::Exfat),
            "pfs" => Ok(ImageFsType::Pfs),
            _ => snafu::whatever!("unsupported image filesystem: {s}"),
        }
    }
}

impl fmt::Display for ImageFsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ufs => "ufs",
            Self::Exfat => "exfat",
            Self::Pfs => "pfs",
        };
        f.write_str(name)
    }
}

impl ImageFsType {
    /// All supported filesystems, in scan order.
    pub const ALL: [ImageFsType; 3] = [Self::Ufs, Self::Exfat, Self::Pfs];

    /// Detects the filesystem from an image file name (case-insensitive extension).
    pub fn from_file_name(name: &str) -> Option<Self> {
        let (_, ext) = name.rsplit_once('.')?;
        match ext.to_ascii_lowercase().as_str() {
            "ffpkg" => Some(Self::Ufs),
            "exfat" => Some(Self::Exfat),
            "ffpfs" => Some(Self::Pfs),
            _ => None,
        }
    }

    /// Returns the `fstype` value understood by the kernel.
    pub fn kernel_name(&self) -> &'static str {
        match self {
            Self::Ufs => "ufs",
            Self::Exfat => "exfatfs",
            Self::Pfs => "pfs",
        }
    }

    /// Directory under the mount base that holds mounts of this type.
    pub fn mount_subdir(&self) -> &'static str {
        match self {
            Self::Ufs => "ufsmnt",
            Self::Exfat => "exfatmnt",
            Self::Pfs => "pfsmnt",
        }
    }
}

/// Option set for PFS mounts.
///
/// The defaults reproduce the shell's own mount of a game PFS image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PfsProfile {
    /// Profile id for logs.
    pub name: String,
    /// Preferred mode for the mount.
    pub read_only: bool,
    /// `budgetid` value ("game" or "system").
    pub budget_id: String,
    /// `mkeymode` value.
    pub mkeymode: String,
    pub sigverify: bool,
    pub playgo: bool,
    pub disc: bool,
}

impl Default for PfsProfile {
    fn default() -> Self {
        Self {
            name: "shell_default".to_string(),
            read_only: true,
            budget_id: "game".to_string(),
            mkeymode: "SD".to_string(),
            sigverify: false,
            playgo: false,
            disc: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct MountOption {
    key: Vec<u8>,
    value: Option<Vec<u8>>,
}

/// Ordered `nmount(2)` key/value vector.
///
/// Keys and values are stored NUL-terminated and owned by the builder; the
/// iovec view handed to the kernel borrows them for the duration of one call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountOptions {
    entries: Vec<MountOption>,
    errmsg_len: usize,
}

impl MountOptions {
    /// Creates an empty option vector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a `key=value` pair.
    pub fn str(mut self, key: &str, value: impl AsRef<OsStr>) -> Self {
        self.entries.push(MountOption {
            key: nul_terminated(key.as_bytes()),
            value: Some(nul_terminated(value.as_ref().as_bytes())),
        });
        self
    }

    /// Appends a path-valued pair.
    pub fn path(self, key: &str, value: &Path) -> Self {
        self.str(key, value.as_os_str())
    }

    /// Appends a `0`/`1` switch.
    pub fn switch(self, key: &str, on: bool) -> Self {
        self.str(key, if on { "1" } else { "0" })
    }

    /// Appends a key with an omitted value.
    pub fn flag(mut self, key: &str) -> Self {
        self.entries.push(MountOption {
            key: nul_terminated(key.as_bytes()),
            value: None,
        });
        self
    }

    /// Requests a kernel diagnostic buffer of `len` bytes under `errmsg`.
    pub fn with_errmsg(mut self, len: usize) -> Self {
        self.errmsg_len = len;
        self
    }

    /// Size of the requested diagnostic buffer (0 = none).
    pub fn errmsg_len(&self) -> usize {
        self.errmsg_len
    }

    /// Number of key/value pairs (excluding `errmsg`).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no pairs were added.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keys in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| trim_nul(&e.key))
    }

    /// Looks up a key. `Some(None)` means the key is present without a value.
    pub fn value(&self, key: &str) -> Option<Option<&str>> {
        self.entries
            .iter()
            .find(|e| trim_nul(&e.key) == key)
            .map(|e| e.value.as_deref().map(trim_nul))
    }

    /// The `fstype` value, if set.
    pub fn fstype(&self) -> Option<&str> {
        self.value("fstype").flatten()
    }

    /// Raw NUL-terminated entries for the syscall layer.
    pub(crate) fn raw_entries(&self) -> impl Iterator<Item = (&[u8], Option<&[u8]>)> {
        self.entries
            .iter()
            .map(|e| (e.key.as_slice(), e.value.as_deref()))
    }
}

fn nul_terminated(bytes: &[u8]) -> Vec<u8> {
    let mut owned = Vec::with_capacity(bytes.len() + 1);
    owned.extend_from_slice(bytes);
    owned.push(0);
    owned
}

fn trim_nul(bytes: &[u8]) -> &str {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    std::str::from_utf8(&bytes[..end]).unwrap_or("")
}

/// Builds the option vector for mounting an attached image.
pub fn image_mount_options(
    fs_type: ImageFsType,
    device_node: &Path,
    mount_point: &Path,
    pfs: &PfsProfile,
) -> MountOptions {
    let opts = match fs_type {
        ImageFsType::Ufs => MountOptions::new()
            .str("fstype", fs_type.kernel_name())
            .path("from", device_node)
            .path("fspath", mount_point)
            .str("budgetid", "game"),
        ImageFsType::Exfat => MountOptions::new()
            .path("from", device_node)
            .path("fspath", mount_point)
            .str("fstype", fs_type.kernel_name())
            .str("large", "yes")
            .str("timezone", "static")
            .flag("async")
            .flag("ignoreacl"),
        ImageFsType::Pfs => MountOptions::new()
            .path("from", device_node)
            .path("fspath", mount_point)
            .str("fstype", fs_type.kernel_name())
            .switch("sigverify", pfs.sigverify)
            .str("mkeymode", &pfs.mkeymode)
            .str("budgetid", &pfs.budget_id)
            .switch("playgo", pfs.playgo)
            .switch("disc", pfs.disc)
            .str("ekpfs", PFS_ZERO_EKPFS),
    };
    opts.with_errmsg(ERRMSG_LEN)
}

/// Builds the option vector for a union overlay stacked on `mount_point`.
pub fn overlay_options(upper: &Path, mount_point: &Path) -> MountOptions {
    MountOptions::new()
        .str("fstype", "unionfs")
        .path("from", upper)
        .path("fspath", mount_point)
        .with_errmsg(ERRMSG_LEN)
}

/// Builds the option vector for a nullfs bind of `src` onto `dst`.
pub fn nullfs_options(src: &Path, dst: &Path) -> MountOptions {
    MountOptions::new()
        .str("fstype", "nullfs")
        .path("from", src)
        .path("fspath", dst)
        .with_errmsg(ERRMSG_LEN)
}

/// Primary mount flags for a filesystem under the given policy.
pub fn primary_mount_flags(fs_type: ImageFsType, read_only: bool) -> u32 {
    match fs_type {
        ImageFsType::Ufs => UFS_DOWNLOAD_DATA_FLAGS + u32::from(!read_only),
        ImageFsType::Exfat | ImageFsType::Pfs => plain_flags(read_only),
    }
}

/// Flags for mounts that only distinguish read-only from read-write.
pub fn plain_flags(read_only: bool) -> u32 {
    if read_only { MNT_RDONLY } else { 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_fs_type_from_extension() {
        assert_eq!(ImageFsType::from_file_name("Game.ffpkg"), Some(ImageFsType::Ufs));
        assert_eq!(ImageFsType::from_file_name("Game.EXFAT"), Some(ImageFsType::Exfat));
        assert_eq!(ImageFsType::from_file_name("a.b.ffpfs"), Some(ImageFsType::Pfs));
        assert_eq!(ImageFsType::from_file_name("Game.iso"), None);
        assert_eq!(ImageFsType::from_file_name("exfat"), None);
    }

    #[test]
    fn test_try_from_names() {
        assert_eq!(ImageFsType::try_from("exfatfs").unwrap(), ImageFsType::Exfat);
        assert_eq!(ImageFsType::try_from("UFS").unwrap(), ImageFsType::Ufs);
        assert!(ImageFsType::try_from("ntfs").is_err());
    }

    #[test]
    fn test_ufs_options() {
        let opts = image_mount_options(
            ImageFsType::Ufs,
            Path::new("/dev/lvd2"),
            Path::new("/data/imgmnt/ufsmnt/Game"),
            &PfsProfile::default(),
        );

        assert_eq!(
            opts.keys().collect::<Vec<_>>(),
            ["fstype", "from", "fspath", "budgetid"]
        );
        assert_eq!(opts.fstype(), Some("ufs"));
        assert_eq!(opts.value("from"), Some(Some("/dev/lvd2")));
        assert_eq!(opts.errmsg_len(), ERRMSG_LEN);
    }

    #[test]
    fn test_exfat_options() {
        let opts = image_mount_options(
            ImageFsType::Exfat,
            Path::new("/dev/md0"),
            Path::new("/data/imgmnt/exfatmnt/Game"),
            &PfsProfile::default(),
        );

        assert_eq!(opts.fstype(), Some("exfatfs"));
        assert_eq!(opts.value("large"), Some(Some("yes")));
        assert_eq!(opts.value("timezone"), Some(Some("static")));
        assert_eq!(opts.value("async"), Some(None));
        assert_eq!(opts.value("ignoreacl"), Some(None));
        assert_eq!(opts.value("budgetid"), None);
        assert_eq!(opts.errmsg_len(), ERRMSG_LEN);
    }

    #[test]
    fn test_pfs_options() {
        let opts = image_mount_options(
            ImageFsType::Pfs,
            Path::new("/dev/lvd0"),
            Path::new("/data/imgmnt/pfsmnt/Game"),
            &PfsProfile::default(),
        );

        assert_eq!(
            opts.keys().collect::<Vec<_>>(),
            [
                "from", "fspath", "fstype", "sigverify", "mkeymode", "budgetid", "playgo",
                "disc", "ekpfs"
            ]
        );
        assert_eq!(opts.value("sigverify"), Some(Some("0")));
        assert_eq!(opts.value("mkeymode"), Some(Some("SD")));
        assert_eq!(opts.value("budgetid"), Some(Some("game")));
        let key = opts.value("ekpfs").flatten().unwrap();
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c == '0'));
    }

    #[test]
    fn test_raw_entries_are_nul_terminated() {
        let opts = MountOptions::new().str("fstype", "nullfs").flag("async");
        let raw: Vec<_> = opts.raw_entries().collect();

        assert_eq!(raw[0].0, b"fstype\0");
        assert_eq!(raw[0].1, Some(&b"nullfs\0"[..]));
        assert_eq!(raw[1].1, None);
    }

    #[test]
    fn test_primary_mount_flags() {
        assert_eq!(primary_mount_flags(ImageFsType::Ufs, true), 0x1000_0000);
        assert_eq!(primary_mount_flags(ImageFsType::Ufs, false), 0x1000_0001);
        assert_eq!(primary_mount_flags(ImageFsType::Exfat, true), MNT_RDONLY);
        assert_eq!(primary_mount_flags(ImageFsType::Exfat, false), 0);
        assert_eq!(primary_mount_flags(ImageFsType::Pfs, true), MNT_RDONLY);
    }

    #[test]
    fn test_overlay_and_nullfs_options() {
        let overlay = overlay_options(Path::new("/data/backports/CUSA1"), Path::new("/m"));
        assert_eq!(overlay.fstype(), Some("unionfs"));
        assert_eq!(overlay.value("from"), Some(Some("/data/backports/CUSA1")));

        let bind = nullfs_options(Path::new("/src"), Path::new("/dst"));
        assert_eq!(bind.fstype(), Some("nullfs"));
        assert_eq!(bind.value("fspath"), Some(Some("/dst")));
    }
}
