//! Unified error types for the imagemount-core library.
//!
//! Uses SNAFU for context-rich error handling. Kernel-facing failures carry the
//! raw [`Errno`] and, where the kernel supplied one, its diagnostic text.

use nix::errno::Errno;
use snafu::{ResultExt, Snafu};
use std::path::PathBuf;

use crate::device::Backend;
use crate::preset::ImageFsType;

/// Result type alias using the library's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for all core library operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// The backend control device could not be opened.
    #[snafu(display("failed to open {backend} control device {}", path.display()))]
    ControlDeviceOpen {
        backend: Backend,
        path: PathBuf,
        source: std::io::Error,
    },

    /// The attach ioctl was rejected.
    #[snafu(display("{backend} attach of {} failed: {source}", image.display()))]
    AttachIoctl {
        backend: Backend,
        image: PathBuf,
        source: Errno,
    },

    /// The kernel accepted the attach but handed back an unusable unit.
    #[snafu(display("{backend} attach returned invalid unit {unit}"))]
    InvalidUnit { backend: Backend, unit: i32 },

    /// The device node never appeared after a successful attach.
    #[snafu(display("{backend} device node {} did not appear", node.display()))]
    DeviceNodeTimeout { backend: Backend, node: PathBuf },

    /// A stop request interrupted the operation.
    #[snafu(display("interrupted by stop request"))]
    Interrupted,

    /// The detach ioctl was rejected.
    #[snafu(display("{backend} detach of unit {unit} failed: {source}"))]
    Detach {
        backend: Backend,
        unit: i32,
        source: Errno,
    },

    /// The kernel rejected the mount request.
    #[snafu(display(
        "failed to mount {fs_type} at {}: {source}{}",
        mount_point.display(),
        kernel_detail(errmsg)
    ))]
    Mount {
        fs_type: ImageFsType,
        mount_point: PathBuf,
        source: Errno,
        errmsg: Option<String>,
    },

    /// The overlay could not be stacked on an image mount.
    #[snafu(display(
        "failed to stack overlay {} on {}: {source}{}",
        upper.display(),
        mount_point.display(),
        kernel_detail(errmsg)
    ))]
    Overlay {
        upper: PathBuf,
        mount_point: PathBuf,
        source: Errno,
        errmsg: Option<String>,
    },

    /// A nullfs bind mount failed.
    #[snafu(display(
        "failed to bind {} onto {}: {source}{}",
        from.display(),
        target.display(),
        kernel_detail(errmsg)
    ))]
    Bind {
        from: PathBuf,
        target: PathBuf,
        source: Errno,
        errmsg: Option<String>,
    },

    /// Unmount operation failed even with force.
    #[snafu(display("failed to unmount {}: {source}", path.display()))]
    Unmount { path: PathBuf, source: Errno },

    /// Mount point creation failed.
    #[snafu(display("failed to create mount point at {}", path.display()))]
    MountPointCreation {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The mount-record table has no free slot.
    #[snafu(display("image mount table is full ({capacity} entries)"))]
    MountTableFull { capacity: usize },

    /// Configuration file could not be read.
    #[snafu(display("failed to read config at {}", path.display()))]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Configuration file is not valid TOML for [`crate::config::Config`].
    #[snafu(display("failed to parse config at {}", path.display()))]
    ConfigParse {
        path: PathBuf,
        source: toml::de::Error,
    },

    /// A title metadata file could not be read.
    #[snafu(display("failed to read metadata at {}", path.display()))]
    MetadataRead {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A title metadata file is not valid JSON.
    #[snafu(display("failed to parse metadata at {}", path.display()))]
    MetadataParse {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// Copying title assets failed.
    #[snafu(display("failed to copy {} to {}", src.display(), dst.display()))]
    AssetCopy {
        src: PathBuf,
        dst: PathBuf,
        source: std::io::Error,
    },

    /// Writing the tracker link failed.
    #[snafu(display("failed to write tracker link at {}", path.display()))]
    TrackerWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to execute a system command.
    #[snafu(display("failed to execute command '{command}'"))]
    CommandExecution {
        command: String,
        source: std::io::Error,
    },

    /// The title database or registrar could not be reached.
    #[snafu(display("title database unavailable: {message}"))]
    Collaborator { message: String },

    /// The registrar refused the title.
    #[snafu(display("registration of {title_id} failed with code {code:#x}"))]
    Register { title_id: String, code: i32 },

    #[snafu(whatever, display("{message}"))]
    Generic {
        message: String,
        #[snafu(source(from(Box<dyn std::error::Error>, Some)))]
        source: Option<Box<dyn std::error::Error>>,
    },
}

impl Error {
    /// Kernel diagnostic text attached to this error, if any.
    pub fn kernel_message(&self) -> Option<&str> {
        match self {
            Error::Mount { errmsg, .. }
            | Error::Overlay { errmsg, .. }
            | Error::Bind { errmsg, .. } => errmsg.as_deref(),
            _ => None,
        }
    }
}

fn kernel_detail(errmsg: &Option<String>) -> String {
    match errmsg {
        Some(msg) => format!(" ({msg})"),
        None => String::new(),
    }
}

/// Extension trait for adding context to io::Error results.
pub trait IoResultExt<T> {
    /// Add context for command execution errors.
    fn command_context(self, command: impl Into<String>) -> Result<T>;

    /// Add context for mount point creation errors.
    fn mount_point_context(self, path: impl Into<PathBuf>) -> Result<T>;

    /// Add context for config read errors.
    fn config_read_context(self, path: impl Into<PathBuf>) -> Result<T>;

    /// Add context for metadata read errors.
    fn metadata_read_context(self, path: impl Into<PathBuf>) -> Result<T>;

    /// Add context for tracker link write errors.
    fn tracker_context(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::result::Result<T, std::io::Error> {
    fn command_context(self, command: impl Into<String>) -> Result<T> {
        self.context(CommandExecutionSnafu {
            command: command.into(),
        })
    }

    fn mount_point_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(MountPointCreationSnafu { path: path.into() })
    }

    fn config_read_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(ConfigReadSnafu { path: path.into() })
    }

    fn metadata_read_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(MetadataReadSnafu { path: path.into() })
    }

    fn tracker_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(TrackerWriteSnafu { path: path.into() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mount_error_keeps_kernel_text() {
        let err = Error::Mount {
            fs_type: ImageFsType::Pfs,
            mount_point: PathBuf::from("/data/imgmnt/pfsmnt/Game"),
            source: Errno::EINVAL,
            errmsg: Some("bad ekpfs".to_string()),
        };

        assert_eq!(err.kernel_message(), Some("bad ekpfs"));
        let text = err.to_string();
        assert!(text.contains("pfs"));
        assert!(text.contains("(bad ekpfs)"));
    }

    #[test]
    fn test_mount_error_without_kernel_text() {
        let err = Error::Mount {
            fs_type: ImageFsType::Exfat,
            mount_point: PathBuf::from("/mnt/x"),
            source: Errno::EIO,
            errmsg: None,
        };

        assert_eq!(err.kernel_message(), None);
        assert!(!err.to_string().contains('('));
    }
}
