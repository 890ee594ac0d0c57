//! imagemount-core: Core library for the disk image mount daemon.
//!
//! This library discovers filesystem images (UFS, exFAT, PFS) in configured
//! directories, attaches them through the LVD or MD kernel drivers, mounts
//! them with `nmount(2)`, and installs the application folders it finds.
//!
//! # Modules
//!
//! - [`syscall`]: ioctl structures and the [`Kernel`] seam over the raw syscalls
//! - [`device`]: Attach/detach protocol for the LVD and MD backends
//! - [`preset`]: Filesystem types, mount option vectors and flags
//! - [`mount`]: Mount/unmount operations and mount point helpers
//! - [`disk`]: Image discovery
//! - [`cache`]: Bounded path/title state cache with retry counters
//! - [`metadata`]: `param.json` identity parsing
//! - [`install`]: Bind, copy, track and register application folders
//! - [`registry`]: Title database access
//! - [`manager`]: Per-image orchestration on the [`Daemon`] context
//! - [`scan`]: Polling loop
//! - [`config`]: TOML configuration
//! - [`error`]: Error types
//!
//! # Example
//!
//! ```no_run
//! use imagemount_core::{Config, Daemon, StopFlag};
//!
//! let config = Config::load_or_default(std::path::Path::new("config.toml")).unwrap();
//! let stop = StopFlag::with_sentinel(config.stop_file());
//! let mut daemon = Daemon::from_config(config, stop);
//!
//! // Mounts, installs and reconciles until the stop flag trips.
//! daemon.run();
//! ```

pub mod cache;
pub mod config;
pub mod device;
pub mod disk;
pub mod error;
pub mod install;
pub mod manager;
pub mod metadata;
pub mod mount;
pub mod notify;
pub mod preset;
pub mod registry;
pub mod scan;
pub mod stop;
pub mod syscall;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use config::{Config, DEFAULT_CONFIG_PATH};
pub use device::Backend;
pub use disk::DiskImage;
pub use error::{Error, Result};
pub use manager::{Daemon, ImageMount, MountOutcome};
pub use preset::ImageFsType;
pub use scan::CycleReport;
pub use stop::StopFlag;
pub use syscall::{Kernel, SysKernel};
