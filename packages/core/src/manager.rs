//! Image mount orchestration.
//!
//! [`Daemon`] owns the kernel handle, the mount-record table, both state
//! caches and the collaborators. This module drives the per-image lifecycle:
//! attach, mount, optional overlay, health checks and teardown. The polling
//! loop built on top of it lives in [`crate::scan`].

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::cache::{Counter, StateCache};
use crate::config::Config;
use crate::device::{self, AttachSpec, Backend, SourceLayer};
use crate::disk::DiskImage;
use crate::error::{Error, Result};
use crate::install::{AppInstaller, Installer, TitleMemo, title_is_live};
use crate::metadata::{MetadataReader, ParamJsonReader, PathMemo, path_is_live};
use crate::mount;
use crate::notify::{LogNotifier, Notifier, ToastFileNotifier};
use crate::preset::ImageFsType;
use crate::registry::CommandRegistry;
use crate::stop::StopFlag;
use crate::syscall::{Kernel, SysKernel};

/// An attached and mounted image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageMount {
    pub source: PathBuf,
    pub mount_point: PathBuf,
    pub fs_type: ImageFsType,
    /// `None` when the backing device could not be resolved.
    pub backend: Option<Backend>,
    /// Attached unit, -1 if unknown.
    pub unit: i32,
    /// A union overlay is stacked on the mount.
    pub overlay: bool,
    pub title_id: Option<String>,
}

/// Result of [`Daemon::mount_image`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountOutcome {
    /// Already recorded.
    Tracked,
    /// An existing mount of the image was taken over.
    Adopted,
    Mounted { overlay: bool },
    /// The file changed too recently.
    Waiting,
    /// The retry ceiling was reached or the mount point is taken.
    Suppressed,
}

/// Pluggable services used by the daemon.
pub struct Collaborators {
    pub metadata: Box<dyn MetadataReader>,
    pub notifier: Box<dyn Notifier>,
    pub installer: Option<Box<dyn Installer>>,
}

impl Collaborators {
    /// Services backed by the filesystem and the configured registrar.
    pub fn from_config(config: &Config) -> Self {
        let notifier: Box<dyn Notifier> = if config.toast_file {
            Box::new(ToastFileNotifier::new(config.toast_path()))
        } else {
            Box::new(LogNotifier)
        };
        let installer = config.install.enabled.then(|| {
            let registry = CommandRegistry::new(
                &config.install.user_app_root,
                config.install.register_command.clone(),
                std::time::Duration::from_millis(config.install.register_settle_ms),
            );
            Box::new(AppInstaller::new(
                &config.install.system_app_root,
                &config.install.user_app_root,
                Box::new(registry),
            )) as Box<dyn Installer>
        });
        Self {
            metadata: Box::new(ParamJsonReader),
            notifier,
            installer,
        }
    }
}

/// Daemon context. Single-threaded; every table lives here.
pub struct Daemon<K: Kernel = SysKernel> {
    pub(crate) kernel: K,
    pub(crate) config: Config,
    pub(crate) stop: StopFlag,
    pub(crate) mounts: Vec<ImageMount>,
    pub(crate) paths: StateCache<PathMemo>,
    pub(crate) titles: StateCache<TitleMemo>,
    pub(crate) metadata: Box<dyn MetadataReader>,
    pub(crate) notifier: Box<dyn Notifier>,
    pub(crate) installer: Option<Box<dyn Installer>>,
}

impl Daemon<SysKernel> {
    /// Daemon on the real kernel with the default collaborators.
    pub fn from_config(config: Config, stop: StopFlag) -> Self {
        let collaborators = Collaborators::from_config(&config);
        Self::new(SysKernel::new(), config, stop, collaborators)
    }
}

impl<K: Kernel> Daemon<K> {
    pub fn new(kernel: K, config: Config, stop: StopFlag, collaborators: Collaborators) -> Self {
        Self {
            paths: StateCache::new(config.path_cache_capacity, path_is_live),
            titles: StateCache::new(config.title_cache_capacity, title_is_live),
            mounts: Vec::with_capacity(config.max_mounts),
            kernel,
            config,
            stop,
            metadata: collaborators.metadata,
            notifier: collaborators.notifier,
            installer: collaborators.installer,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    pub fn mounts(&self) -> &[ImageMount] {
        &self.mounts
    }

    pub fn stop_flag(&self) -> &StopFlag {
        &self.stop
    }

    /// Whether `source` currently has a mount record.
    pub fn is_mounted(&self, source: &Path) -> bool {
        self.mounts.iter().any(|m| m.source == source)
    }

    /// Attempts of `counter` recorded for `key`.
    pub fn attempts(&self, key: &Path, counter: Counter) -> u8 {
        self.paths
            .find(&key.to_string_lossy())
            .map_or(0, |rec| rec.count(counter))
    }

    /// Brings `image` to the mounted state.
    pub fn mount_image(&mut self, image: &DiskImage) -> Result<MountOutcome> {
        if self.is_mounted(&image.path) {
            return Ok(MountOutcome::Tracked);
        }

        let key = image.path.to_string_lossy().into_owned();
        let ceiling = self.config.retry_ceiling;
        if self
            .paths
            .find(&key)
            .is_some_and(|rec| rec.limit_reached(Counter::Mount, ceiling))
        {
            return Ok(MountOutcome::Suppressed);
        }

        let mount_point = image.mount_point(&self.config.mount_base);
        if let Some(owner) = self.mounts.iter().find(|m| m.mount_point == mount_point) {
            debug!(
                image = %image.path.display(),
                owner = %owner.source.display(),
                "mount point already in use"
            );
            return Ok(MountOutcome::Suppressed);
        }

        if let Some((backend, unit, overlay)) = self.adoptable_mount(&mount_point) {
            info!(
                %backend,
                unit,
                overlay,
                mount_point = %mount_point.display(),
                "already mounted, adopting"
            );
            let title_id = self.title_at(&mount_point);
            self.mounts.push(ImageMount {
                source: image.path.clone(),
                mount_point,
                fs_type: image.fs_type,
                backend: Some(backend),
                unit,
                overlay,
                title_id,
            });
            if let Some(rec) = self.paths.find_mut(&key) {
                rec.clear(Counter::Mount);
            }
            return Ok(MountOutcome::Adopted);
        }

        if mount::is_populated(&mount_point) {
            info!(
                mount_point = %mount_point.display(),
                "mount point is non-empty but not an active mount, reattaching"
            );
        }

        if !image.is_stable(self.config.stability()) {
            debug!(image = %image.path.display(), age = ?image.age(), "recently modified, waiting");
            return Ok(MountOutcome::Waiting);
        }

        if self.mounts.len() >= self.config.max_mounts {
            return Err(Error::MountTableFull {
                capacity: self.config.max_mounts,
            });
        }

        info!(
            fs_type = %image.fs_type,
            image = %image.path.display(),
            mount_point = %mount_point.display(),
            "mounting image"
        );
        let mounted = match self.attach_and_mount(image, &mount_point) {
            Ok(mounted) => mounted,
            Err(Error::Interrupted) => return Err(Error::Interrupted),
            Err(e) => {
                self.record_failure(&key, Counter::Mount, &image.stem(), &e);
                return Err(e);
            }
        };

        let overlay = self.apply_overlay(&mounted);
        self.mounts.push(ImageMount { overlay, ..mounted });
        if let Some(rec) = self.paths.find_mut(&key) {
            rec.clear(Counter::Mount);
        }
        Ok(MountOutcome::Mounted { overlay })
    }

    fn attach_and_mount(&mut self, image: &DiskImage, mount_point: &Path) -> Result<ImageMount> {
        let fs_type = image.fs_type;
        let spec = AttachSpec {
            fs_type,
            backend: self.config.backends.for_type(fs_type),
            read_only: self.config.image_read_only(fs_type),
            block_size: self.kernel.block_size(&image.path),
            pfs_image_type: self.config.pfs_image_type,
            layer: SourceLayer::file(&image.path, image.size),
        };
        let wait = self.config.node_wait();

        mount::create_mount_point(mount_point)?;
        let attachment = match device::attach(&mut self.kernel, &spec, &wait, &self.stop) {
            Ok(attachment) => attachment,
            Err(e) => {
                mount::remove_mount_point_if_empty(mount_point);
                return Err(e);
            }
        };

        let node = &attachment.node;
        if let Err(e) = self.mount_with_fallback(fs_type, node, mount_point, attachment.read_only) {
            let (backend, unit) = (attachment.backend, attachment.unit);
            device::detach(&mut self.kernel, backend, unit, &wait, &self.stop);
            mount::remove_mount_point_if_empty(mount_point);
            return Err(e);
        }

        info!(
            backend = %attachment.backend,
            node = %attachment.node.display(),
            mount_point = %mount_point.display(),
            "mounted {fs_type} image"
        );
        Ok(ImageMount {
            source: image.path.clone(),
            mount_point: mount_point.to_path_buf(),
            fs_type,
            backend: Some(attachment.backend),
            unit: attachment.unit,
            overlay: false,
            title_id: self.title_at(mount_point),
        })
    }

    /// Mounts once; a read-write non-UFS mount is retried read-only.
    fn mount_with_fallback(
        &mut self,
        fs_type: ImageFsType,
        node: &Path,
        mount_point: &Path,
        read_only: bool,
    ) -> Result<()> {
        let pfs = &self.config.pfs;
        match mount::mount_image(&mut self.kernel, fs_type, node, mount_point, read_only, pfs) {
            Err(e) if !read_only && fs_type != ImageFsType::Ufs => {
                warn!(
                    %fs_type,
                    mount_point = %mount_point.display(),
                    error = %e,
                    "read-write mount failed, trying read-only"
                );
                mount::mount_image(&mut self.kernel, fs_type, node, mount_point, true, pfs)
            }
            other => other,
        }
    }

    fn title_at(&self, root: &Path) -> Option<String> {
        self.metadata.read_identity(root).map(|id| id.title_id)
    }

    /// Upper directory of an overlay from `overlay_root` mounted on top of
    /// `mount_point`.
    fn overlay_on_top(&self, mount_point: &Path) -> Option<PathBuf> {
        let root = self.config.overlay_root.as_deref()?;
        let src = self.kernel.mount_source(mount_point)?;
        let upper = PathBuf::from(&src.from);
        (src.is_root(mount_point) && upper.starts_with(root)).then_some(upper)
    }

    /// Resolves an image mount at `mount_point`, looking under an overlay left
    /// on top of it. The overlay is lifted for the query and stacked again;
    /// the flag reports whether it is back in place.
    fn adoptable_mount(&mut self, mount_point: &Path) -> Option<(Backend, i32, bool)> {
        if let Some((backend, unit)) = mount::active_image_mount(&self.kernel, mount_point) {
            return Some((backend, unit, false));
        }
        let upper = self.overlay_on_top(mount_point)?;
        if let Err(e) = mount::unmount_layer(&mut self.kernel, mount_point) {
            warn!(mount_point = %mount_point.display(), error = %e, "cannot lift overlay");
            return None;
        }

        let found = mount::active_image_mount(&self.kernel, mount_point);
        let read_only = self.config.overlay_read_only;
        let restacked = mount::mount_overlay(&mut self.kernel, &upper, mount_point, read_only);
        let restored = match restacked {
            Ok(()) => true,
            Err(e) => {
                warn!(upper = %upper.display(), error = %e, "failed to restore overlay");
                false
            }
        };
        found.map(|(backend, unit)| (backend, unit, restored))
    }

    /// Stacks `<overlay_root>/<title_id>` on a fresh mount. Never fails the
    /// mount itself.
    fn apply_overlay(&mut self, mounted: &ImageMount) -> bool {
        let (Some(root), Some(title_id)) = (&self.config.overlay_root, &mounted.title_id) else {
            return false;
        };
        let upper = root.join(title_id);
        if !upper.is_dir() {
            return false;
        }
        let mount_point = &mounted.mount_point;
        let read_only = self.config.overlay_read_only;
        match mount::mount_overlay(&mut self.kernel, &upper, mount_point, read_only) {
            Ok(()) => {
                info!(
                    upper = %upper.display(),
                    mount_point = %mount_point.display(),
                    "overlay applied"
                );
                true
            }
            Err(e) => {
                warn!(error = %e, "overlay failed");
                self.notifier.notify(&format!("Overlay failed for {title_id}"));
                false
            }
        }
    }

    /// Bumps `counter` for `key` and notifies once when the ceiling is hit.
    pub(crate) fn record_failure(
        &mut self,
        key: &str,
        counter: Counter,
        name: &str,
        error: &Error,
    ) {
        let ceiling = self.config.retry_ceiling;
        let rec = self.paths.get_or_create(key);
        let attempts = rec.bump(counter, ceiling);
        warn!(path = key, attempts, ?counter, error = %error, "attempt failed");
        if rec.limit_reached(counter, ceiling) && rec.note_limit(counter) {
            warn!(path = key, ?counter, "retry limit reached, giving up");
            self.notifier
                .notify(&format!("Giving up on {name} after {attempts} failed attempts"));
        }
    }

    /// Reconciles the mount table with the filesystem.
    ///
    /// Records whose source is gone are torn down; records whose mount was
    /// lost are cleared and re-attempted.
    pub fn check_mounts(&mut self) {
        let mut lost = Vec::new();
        let mut i = 0;
        while i < self.mounts.len() {
            if self.stop.should_stop() {
                return;
            }
            let record = self.mounts[i].clone();

            if !record.source.exists() {
                info!(source = %record.source.display(), "source removed, unmounting");
                if self.teardown(&record) {
                    self.mounts.remove(i);
                    self.paths.remove(&record.source.to_string_lossy());
                } else {
                    i += 1;
                }
                continue;
            }

            if !mount::is_mount_point(&self.kernel, &record.mount_point) {
                warn!(
                    source = %record.source.display(),
                    mount_point = %record.mount_point.display(),
                    "mount lost, clearing record"
                );
                self.forget(&record);
                self.mounts.remove(i);
                lost.push(record.source);
                continue;
            }
            i += 1;
        }

        for source in lost {
            let Some(image) = DiskImage::from_path(&source) else {
                continue;
            };
            match self.mount_image(&image) {
                Ok(outcome) => {
                    debug!(source = %source.display(), ?outcome, "re-attempted lost mount")
                }
                Err(e) => debug!(source = %source.display(), error = %e, "re-attempt failed"),
            }
        }
    }

    /// Drops what is left of a mount that disappeared underneath us.
    fn forget(&mut self, record: &ImageMount) {
        if let Some(installer) = self.installer.as_mut() {
            installer.release(&mut self.kernel, &record.mount_point);
        }
        if let Some(backend) = record.backend {
            let wait = self.config.node_wait();
            device::detach(&mut self.kernel, backend, record.unit, &wait, &self.stop);
        }
        mount::remove_mount_point_if_empty(&record.mount_point);
    }

    /// Releases binds, unmounts overlay and image, detaches and removes the
    /// mount point. Returns false (keeping the record) if the unmount failed.
    pub(crate) fn teardown(&mut self, record: &ImageMount) -> bool {
        if let Some(installer) = self.installer.as_mut() {
            installer.release(&mut self.kernel, &record.mount_point);
        }

        let mount_point = &record.mount_point;
        if record.overlay || self.overlay_on_top(mount_point).is_some() {
            if let Err(e) = mount::unmount_layer(&mut self.kernel, mount_point) {
                warn!(mount_point = %mount_point.display(), error = %e, "overlay unmount failed");
            }
        }

        let resolved = match (record.backend, record.unit) {
            (Some(backend), unit) if unit >= 0 => Some((backend, unit)),
            _ => mount::active_image_mount(&self.kernel, mount_point),
        };

        if let Err(e) = mount::unmount(&mut self.kernel, &record.mount_point) {
            warn!(error = %e, "unmount failed, keeping record for the next cycle");
            return false;
        }

        match resolved {
            Some((backend, unit)) => {
                let wait = self.config.node_wait();
                device::detach(&mut self.kernel, backend, unit, &wait, &self.stop);
            }
            None => debug!(mount_point = %mount_point.display(), "detach skipped, backend unknown"),
        }
        mount::remove_mount_point_if_empty(&record.mount_point);
        info!(source = %record.source.display(), "image unmounted");
        true
    }

    /// Tears down every bind and mount. Called once when the daemon stops.
    pub fn shutdown(&mut self) {
        if let Some(installer) = self.installer.as_mut() {
            installer.shutdown(&mut self.kernel);
        }
        let records = std::mem::take(&mut self.mounts);
        for record in records.iter().rev() {
            if !self.teardown(record) {
                warn!(source = %record.source.display(), "left mounted at shutdown");
            }
        }
    }
}
