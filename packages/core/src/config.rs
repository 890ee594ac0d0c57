//! Daemon configuration.
//!
//! Loaded from a TOML file; every field has a default so an absent file or a
//! partial one is valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use tracing::debug;

use crate::device::{Backend, LVD_IMAGE_GENERIC, NodeWait};
use crate::error::{ConfigParseSnafu, IoResultExt, Result};
use crate::preset::{ImageFsType, PfsProfile};

pub const DEFAULT_CONFIG_PATH: &str = "/data/shadowmount/config.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directories scanned for image files and game folders.
    pub scan_roots: Vec<PathBuf>,
    /// Root of the per-filesystem image mount directories.
    pub mount_base: PathBuf,
    /// Log, lock, stop sentinel and toast file location.
    pub state_dir: PathBuf,
    /// `<overlay_root>/<title_id>` is stacked on a matching image mount.
    pub overlay_root: Option<PathBuf>,
    pub overlay_read_only: bool,

    /// Mount images read-only.
    pub read_only: bool,
    pub backends: BackendMap,
    /// LVD image type tag used for PFS images.
    pub pfs_image_type: u16,
    pub pfs: PfsProfile,

    pub scan_interval_secs: u64,
    pub stop_poll_ms: u64,
    /// Minimum age of an image or folder before it is acted upon.
    pub stability_secs: u64,
    pub retry_ceiling: u32,
    pub max_mounts: usize,
    pub path_cache_capacity: usize,
    pub title_cache_capacity: usize,
    pub node_wait_retries: u32,
    pub node_wait_interval_ms: u64,

    pub install: InstallConfig,
    /// Write toasts to `<state_dir>/notify.txt` in addition to logging them.
    pub toast_file: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scan_roots: default_scan_roots(),
            mount_base: PathBuf::from("/data/imgmnt"),
            state_dir: PathBuf::from("/data/shadowmount"),
            overlay_root: Some(PathBuf::from("/data/backports")),
            overlay_read_only: true,
            read_only: true,
            backends: BackendMap::default(),
            pfs_image_type: LVD_IMAGE_GENERIC,
            pfs: PfsProfile::default(),
            scan_interval_secs: 3,
            stop_poll_ms: 200,
            stability_secs: 10,
            retry_ceiling: 3,
            max_mounts: 64,
            path_cache_capacity: 512,
            title_cache_capacity: 512,
            node_wait_retries: 100,
            node_wait_interval_ms: 100,
            install: InstallConfig::default(),
            toast_file: true,
        }
    }
}

fn default_scan_roots() -> Vec<PathBuf> {
    let mut roots: Vec<PathBuf> = ["/data/homebrew", "/data/etaHEN/games"]
        .iter()
        .map(PathBuf::from)
        .collect();
    for ext in ["ext0", "ext1"] {
        roots.push(format!("/mnt/{ext}/etaHEN/homebrew").into());
        roots.push(format!("/mnt/{ext}/etaHEN/games").into());
    }
    for n in 0..8 {
        roots.push(format!("/mnt/usb{n}/homebrew").into());
        roots.push(format!("/mnt/usb{n}/etaHEN/games").into());
    }
    roots.extend((0..8).map(|n| PathBuf::from(format!("/mnt/usb{n}"))));
    roots.extend(["/mnt/ext0", "/mnt/ext1"].iter().map(PathBuf::from));
    roots
}

/// Attach backend per filesystem type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendMap {
    pub ufs: Backend,
    pub exfat: Backend,
    pub pfs: Backend,
}

impl Default for BackendMap {
    fn default() -> Self {
        Self {
            ufs: Backend::Lvd,
            exfat: Backend::Md,
            pfs: Backend::Lvd,
        }
    }
}

impl BackendMap {
    pub fn for_type(&self, fs_type: ImageFsType) -> Backend {
        match fs_type {
            ImageFsType::Ufs => self.ufs,
            ImageFsType::Exfat => self.exfat,
            ImageFsType::Pfs => self.pfs,
        }
    }
}

/// Install pipeline settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallConfig {
    pub enabled: bool,
    /// Where game folders are bind mounted (`<root>/<title_id>`).
    pub system_app_root: PathBuf,
    /// Where metadata, icon and tracker link are written.
    pub user_app_root: PathBuf,
    /// Registrar invoked as `<cmd...> <title_id> <user_app_root>`.
    /// Exit 0 = registered, 3 = already registered.
    pub register_command: Vec<String>,
    pub register_settle_ms: u64,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            system_app_root: PathBuf::from("/system_ex/app"),
            user_app_root: PathBuf::from("/user/app"),
            register_command: vec!["/data/shadowmount/register".to_string()],
            register_settle_ms: 200,
        }
    }
}

impl Config {
    /// Loads `path`, falling back to defaults if it does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        Self::load_from(path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).config_read_context(path)?;
        toml::from_str(&content).context(ConfigParseSnafu { path })
    }

    pub fn log_file(&self) -> PathBuf {
        self.state_dir.join("debug.log")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.state_dir.join("daemon.lock")
    }

    pub fn stop_file(&self) -> PathBuf {
        self.state_dir.join("STOP")
    }

    pub fn toast_path(&self) -> PathBuf {
        self.state_dir.join("notify.txt")
    }

    /// `<mount_base>/<fs-subdir>`
    pub fn mount_dir(&self, fs_type: ImageFsType) -> PathBuf {
        self.mount_base.join(fs_type.mount_subdir())
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    pub fn stop_poll(&self) -> Duration {
        Duration::from_millis(self.stop_poll_ms)
    }

    pub fn stability(&self) -> Duration {
        Duration::from_secs(self.stability_secs)
    }

    pub fn node_wait(&self) -> NodeWait {
        NodeWait {
            retries: self.node_wait_retries,
            interval: Duration::from_millis(self.node_wait_interval_ms),
        }
    }

    /// Read-only policy for an image of `fs_type`.
    pub fn image_read_only(&self, fs_type: ImageFsType) -> bool {
        match fs_type {
            ImageFsType::Pfs => self.pfs.read_only,
            ImageFsType::Ufs | ImageFsType::Exfat => self.read_only,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.max_mounts, 64);
        assert_eq!(config.retry_ceiling, 3);
        assert_eq!(config.stability(), Duration::from_secs(10));
        assert_eq!(config.node_wait(), NodeWait::default());
        assert_eq!(config.backends.for_type(ImageFsType::Exfat), Backend::Md);
        assert_eq!(config.backends.for_type(ImageFsType::Ufs), Backend::Lvd);
        assert_eq!(
            config.mount_dir(ImageFsType::Exfat),
            PathBuf::from("/data/imgmnt/exfatmnt")
        );
        assert!(config.scan_roots.contains(&PathBuf::from("/mnt/usb7/homebrew")));
        assert_eq!(config.lock_file(), PathBuf::from("/data/shadowmount/daemon.lock"));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
scan_roots = ["/data/homebrew"]
read_only = false
retry_ceiling = 5

[backends]
exfat = "lvd"

[pfs]
mkeymode = "GD"

[install]
enabled = false
"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.scan_roots, vec![PathBuf::from("/data/homebrew")]);
        assert!(!config.read_only);
        assert_eq!(config.retry_ceiling, 5);
        assert_eq!(config.backends.exfat, Backend::Lvd);
        assert_eq!(config.backends.ufs, Backend::Lvd);
        assert_eq!(config.pfs.mkeymode, "GD");
        assert_eq!(config.pfs.budget_id, "game");
        assert!(!config.install.enabled);
        assert_eq!(config.install.user_app_root, PathBuf::from("/user/app"));
        assert_eq!(config.max_mounts, 64);
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_invalid_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "retry_ceiling = \"many\"").unwrap();
        let err = Config::load_from(&path).unwrap_err();
        assert!(matches!(err, crate::error::Error::ConfigParse { .. }));
    }

    #[test]
    fn test_pfs_policy_follows_profile() {
        let mut config = Config::default();
        config.read_only = false;
        assert!(config.image_read_only(ImageFsType::Pfs));
        assert!(!config.image_read_only(ImageFsType::Exfat));
    }
}
