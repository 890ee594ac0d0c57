//! Install pipeline for application folders.
//!
//! A folder holding `sce_sys/param.json` is bind mounted into the system
//! application tree, its metadata and icon are copied into the user
//! application tree next to a `mount.lnk` tracker pointing back at the
//! source, and the title is registered. Binds are released again when their
//! source disappears or the daemon stops.

use std::fs;
use std::path::{Path, PathBuf};

use snafu::ResultExt;
use tracing::{debug, info, warn};

use crate::cache::CacheRecord;
use crate::error::{AssetCopySnafu, IoResultExt, Result};
use crate::metadata::{TitleIdentity, param_path};
use crate::mount;
use crate::registry::{RegisterOutcome, TitleDatabase};
use crate::syscall::Kernel;

const TRACKER_FILE: &str = "mount.lnk";
const ICON_FILE: &str = "icon0.png";

/// Title-keyed cache payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TitleMemo {
    /// Folder that claimed the title.
    pub source: PathBuf,
    /// Last answer of the title database.
    pub known: bool,
}

/// Title records stay alive while their claiming folder exists or while they
/// hold a positive database answer, which outlives a moved folder.
pub fn title_is_live(record: &CacheRecord<TitleMemo>) -> bool {
    record
        .payload
        .as_ref()
        .is_some_and(|memo| memo.known || memo.source.exists())
}

/// Installs application folders and tracks the binds it created.
pub trait Installer {
    /// Whether the title is installed, its data mounted and its tracker
    /// pointing at `source`.
    fn is_current(&self, identity: &TitleIdentity, source: &Path) -> bool;

    /// Whether the title database already knows `title_id`.
    fn title_known(&self, title_id: &str) -> Result<bool>;

    /// Runs the pipeline. On reinstall the asset copy is skipped.
    fn install(
        &mut self,
        kernel: &mut dyn Kernel,
        source: &Path,
        identity: &TitleIdentity,
        reinstall: bool,
    ) -> Result<RegisterOutcome>;

    /// Unmounts every bind whose source lies under `source`.
    fn release(&mut self, kernel: &mut dyn Kernel, source: &Path);

    /// Unmounts every bind.
    fn shutdown(&mut self, kernel: &mut dyn Kernel);
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Bind {
    source: PathBuf,
    target: PathBuf,
}

pub struct AppInstaller {
    system_app_root: PathBuf,
    user_app_root: PathBuf,
    database: Box<dyn TitleDatabase>,
    binds: Vec<Bind>,
}

impl AppInstaller {
    pub fn new(
        system_app_root: impl Into<PathBuf>,
        user_app_root: impl Into<PathBuf>,
        database: Box<dyn TitleDatabase>,
    ) -> Self {
        Self {
            system_app_root: system_app_root.into(),
            user_app_root: user_app_root.into(),
            database,
            binds: Vec::new(),
        }
    }

    fn system_dir(&self, title_id: &str) -> PathBuf {
        self.system_app_root.join(title_id)
    }

    fn user_dir(&self, title_id: &str) -> PathBuf {
        self.user_app_root.join(title_id)
    }

    /// Source path recorded in the title's tracker link.
    pub fn read_tracker(&self, title_id: &str) -> Option<PathBuf> {
        let content = fs::read_to_string(self.user_dir(title_id).join(TRACKER_FILE)).ok()?;
        let line = content.lines().next()?.trim_end();
        (!line.is_empty()).then(|| PathBuf::from(line))
    }

    /// Targets currently bind mounted.
    pub fn bound_targets(&self) -> impl Iterator<Item = &Path> {
        self.binds.iter().map(|b| b.target.as_path())
    }

    fn bind(&mut self, kernel: &mut dyn Kernel, source: &Path, target: &Path) -> Result<()> {
        mount::create_mount_point(target)?;
        mount::unmount_layer(kernel, target)?;
        self.binds.retain(|b| b.target != target);
        mount::mount_nullfs(kernel, source, target, true)?;
        self.binds.push(Bind {
            source: source.to_path_buf(),
            target: target.to_path_buf(),
        });
        debug!(source = %source.display(), target = %target.display(), "bound");
        Ok(())
    }

    fn unbind(&mut self, kernel: &mut dyn Kernel, target: &Path) {
        match mount::unmount_layer(kernel, target) {
            Ok(()) => self.binds.retain(|b| b.target != target),
            Err(e) => warn!(target = %target.display(), error = %e, "failed to release bind"),
        }
    }

    fn copy_assets(&self, source: &Path, title_id: &str) -> Result<()> {
        let user_dir = self.user_dir(title_id);
        copy_tree(&source.join("sce_sys"), &user_dir.join("sce_sys"))?;
        let icon = source.join("sce_sys").join(ICON_FILE);
        let icon_dst = user_dir.join(ICON_FILE);
        fs::copy(&icon, &icon_dst).context(AssetCopySnafu {
            src: icon,
            dst: icon_dst,
        })?;
        Ok(())
    }

    fn write_tracker(&self, source: &Path, title_id: &str) -> Result<()> {
        let user_dir = self.user_dir(title_id);
        let path = user_dir.join(TRACKER_FILE);
        fs::create_dir_all(&user_dir).tracker_context(&path)?;
        fs::write(&path, source.as_os_str().as_encoded_bytes()).tracker_context(&path)
    }

    fn install_steps(
        &mut self,
        source: &Path,
        identity: &TitleIdentity,
        reinstall: bool,
    ) -> Result<RegisterOutcome> {
        let title_id = identity.title_id.as_str();
        if reinstall {
            debug!(title_id, "assets already present, skipping copy");
        } else {
            self.copy_assets(source, title_id)?;
        }
        self.write_tracker(source, title_id)?;
        self.database.register(title_id, &self.user_app_root)
    }
}

impl Installer for AppInstaller {
    fn is_current(&self, identity: &TitleIdentity, source: &Path) -> bool {
        let title_id = identity.title_id.as_str();
        self.user_dir(title_id).exists()
            && param_path(&self.system_dir(title_id)).exists()
            && self.read_tracker(title_id).as_deref() == Some(source)
    }

    fn title_known(&self, title_id: &str) -> Result<bool> {
        self.database.title_exists(title_id)
    }

    fn install(
        &mut self,
        kernel: &mut dyn Kernel,
        source: &Path,
        identity: &TitleIdentity,
        reinstall: bool,
    ) -> Result<RegisterOutcome> {
        let target = self.system_dir(&identity.title_id);
        self.bind(kernel, source, &target)?;

        match self.install_steps(source, identity, reinstall) {
            Ok(outcome) => {
                info!(
                    title_id = %identity.title_id,
                    source = %source.display(),
                    ?outcome,
                    "installed"
                );
                Ok(outcome)
            }
            Err(e) => {
                self.unbind(kernel, &target);
                Err(e)
            }
        }
    }

    fn release(&mut self, kernel: &mut dyn Kernel, source: &Path) {
        let targets: Vec<PathBuf> = self
            .binds
            .iter()
            .filter(|b| b.source.starts_with(source))
            .map(|b| b.target.clone())
            .collect();
        for target in targets {
            debug!(source = %source.display(), target = %target.display(), "releasing bind");
            self.unbind(kernel, &target);
        }
    }

    fn shutdown(&mut self, kernel: &mut dyn Kernel) {
        let targets: Vec<PathBuf> = self.binds.iter().map(|b| b.target.clone()).collect();
        for target in targets {
            self.unbind(kernel, &target);
        }
    }
}

/// Recursively copies `src` into `dst`, creating directories as needed.
fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst).context(AssetCopySnafu { src, dst })?;
    let entries = fs::read_dir(src).context(AssetCopySnafu { src, dst })?;
    for entry in entries {
        let entry = entry.context(AssetCopySnafu { src, dst })?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        if from.is_dir() {
            copy_tree(&from, &to)?;
        } else {
            fs::copy(&from, &to).context(AssetCopySnafu { src: &from, dst: &to })?;
        }
    }
    Ok(())
}
