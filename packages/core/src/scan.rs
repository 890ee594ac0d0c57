//! Polling loop: reconcile mounts, mount new images, install game folders.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::cache::Counter;
use crate::disk::{self, modified_age, visible_entries};
use crate::error::Error;
use crate::install::TitleMemo;
use crate::manager::{Daemon, MountOutcome};
use crate::metadata::{TitleIdentity, cached_identity};
use crate::mount;
use crate::preset::ImageFsType;
use crate::registry::RegisterOutcome;
use crate::syscall::Kernel;

/// Counters of one scan cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub mounted: usize,
    pub unmounted: usize,
    pub installed: usize,
}

impl<K: Kernel> Daemon<K> {
    /// Runs until stopped, then tears everything down.
    pub fn run(&mut self) {
        info!(
            roots = self.config.scan_roots.len(),
            interval = ?self.config.scan_interval(),
            "scan loop started"
        );
        self.startup();
        loop {
            if self.stop.should_stop() {
                break;
            }
            if self.stop.sleep(self.config.scan_interval(), self.config.stop_poll()) {
                break;
            }
            let report = self.run_cycle();
            if report != CycleReport::default() {
                debug!(?report, "cycle finished");
            }
        }
        info!("stop requested, shutting down");
        self.shutdown();
    }

    /// One reconcile and scan, then teardown.
    pub fn run_once(&mut self) -> CycleReport {
        let report = self.startup();
        self.shutdown();
        report
    }

    /// First cycle, with a summary notification around the install scan.
    pub fn startup(&mut self) -> CycleReport {
        let before = self.mounts.len();
        self.check_mounts();
        let unmounted = before.saturating_sub(self.mounts.len());
        let mounted = self.mount_new_images();

        let pending = self.count_pending_titles();
        if pending == 0 {
            self.notifier.notify("Library ready.");
        } else {
            self.notifier.notify(&format!("Found {pending} games. Executing..."));
        }
        let installed = self.install_titles();
        if pending > 0 {
            self.notifier.notify("Library synchronized.");
        }

        CycleReport {
            mounted,
            unmounted,
            installed,
        }
    }

    /// Health check, image scan and install scan.
    pub fn run_cycle(&mut self) -> CycleReport {
        let before = self.mounts.len();
        self.check_mounts();
        let unmounted = before.saturating_sub(self.mounts.len());
        let mounted = self.mount_new_images();
        let installed = self.install_titles();

        let pruned = self.paths.prune() + self.titles.prune();
        if pruned > 0 {
            debug!(pruned, "dropped cache records of vanished paths");
        }
        CycleReport {
            mounted,
            unmounted,
            installed,
        }
    }

    /// Mounts every image found under the scan roots. Returns the number of
    /// new mount records.
    pub fn mount_new_images(&mut self) -> usize {
        let mut mounted = 0;
        let roots = self.config.scan_roots.clone();
        for root in &roots {
            for image in disk::scan_images(root, &self.config.mount_base, &self.stop) {
                if self.stop.should_stop() {
                    return mounted;
                }
                match self.mount_image(&image) {
                    Ok(MountOutcome::Mounted { .. } | MountOutcome::Adopted) => mounted += 1,
                    Ok(_) => {}
                    Err(Error::MountTableFull { capacity }) => {
                        warn!(capacity, image = %image.path.display(), "mount table full");
                        return mounted;
                    }
                    Err(e) => debug!(image = %image.path.display(), error = %e, "mount failed"),
                }
            }
        }
        mounted
    }

    /// Folders that may hold an application: direct children of the scan
    /// roots and the roots of active image mounts.
    pub fn candidates(&self) -> Vec<PathBuf> {
        let mut dirs = Vec::new();
        for root in &self.config.scan_roots {
            if root.starts_with(&self.config.mount_base) {
                continue;
            }
            dirs.extend(visible_entries(root).into_iter().filter(|p| p.is_dir()));
        }
        for fs_type in ImageFsType::ALL {
            let base = self.config.mount_dir(fs_type);
            dirs.extend(
                visible_entries(&base)
                    .into_iter()
                    .filter(|p| mount::is_mount_point(&self.kernel, p)),
            );
        }
        dirs
    }

    /// Candidates with metadata that are not installed from their current
    /// location.
    fn count_pending_titles(&mut self) -> usize {
        let Some(installer) = self.installer.as_deref() else {
            return 0;
        };
        let mut pending = 0;
        for dir in self.candidates() {
            let identity = cached_identity(self.metadata.as_ref(), &mut self.paths, &dir);
            let Some(identity) = identity else {
                continue;
            };
            if !installer.is_current(&identity, &dir) {
                pending += 1;
            }
        }
        pending
    }

    /// Installs every candidate folder that needs it. Returns the number of
    /// titles installed.
    pub fn install_titles(&mut self) -> usize {
        if self.installer.is_none() {
            return 0;
        }
        let mut installed = 0;
        for dir in self.candidates() {
            if self.stop.should_stop() {
                break;
            }
            if self.install_candidate(&dir) {
                installed += 1;
            }
        }
        installed
    }

    fn install_candidate(&mut self, dir: &Path) -> bool {
        let key = dir.to_string_lossy().into_owned();
        let ceiling = self.config.retry_ceiling;
        if self
            .paths
            .find(&key)
            .is_some_and(|rec| rec.limit_reached(Counter::Install, ceiling))
        {
            return false;
        }

        let Some(identity) = cached_identity(self.metadata.as_ref(), &mut self.paths, dir) else {
            if dir.starts_with(&self.config.mount_base) {
                debug!(dir = %dir.display(), "mounted image has no usable param.json");
            }
            return false;
        };
        let Some(current) = self.installer.as_deref().map(|i| i.is_current(&identity, dir)) else {
            return false;
        };
        if current {
            self.claim_title(&identity, dir);
            return false;
        }
        if self.is_duplicate(&identity, dir) {
            return false;
        }

        let Some(known) = self.title_known(&identity.title_id) else {
            return false;
        };
        if !known && !folder_is_stable(dir, self.config.stability()) {
            debug!(dir = %dir.display(), "recently modified, waiting");
            return false;
        }
        if !known {
            self.notifier
                .notify(&format!("Installing: {} ({})...", identity.title_name, identity.title_id));
        }

        let Some(installer) = self.installer.as_deref_mut() else {
            return false;
        };
        match installer.install(&mut self.kernel, dir, &identity, known) {
            Ok(outcome) => {
                if let Some(rec) = self.paths.find_mut(&key) {
                    rec.clear(Counter::Install);
                }
                self.claim_title(&identity, dir);
                if outcome == RegisterOutcome::Registered {
                    self.notifier
                        .toast(&identity.title_id, &identity.title_name, "Installed");
                }
                true
            }
            Err(e) => {
                self.record_failure(&key, Counter::Install, &identity.title_name, &e);
                false
            }
        }
    }

    /// Asks the title database whether the title is registered. A failed
    /// query falls back to the last answer cached for the title and defers
    /// when there is none.
    fn title_known(&mut self, title_id: &str) -> Option<bool> {
        let answer = self.installer.as_deref()?.title_known(title_id);
        let cached = self
            .titles
            .find_mut(title_id)
            .and_then(|rec| rec.payload.as_mut());
        match (answer, cached) {
            (Ok(known), Some(memo)) => {
                memo.known = known;
                Some(known)
            }
            (Ok(known), None) => Some(known),
            (Err(e), Some(memo)) => {
                warn!(
                    title_id,
                    error = %e,
                    known = memo.known,
                    "title database query failed, using cached answer"
                );
                Some(memo.known)
            }
            (Err(e), None) => {
                warn!(title_id, error = %e, "title database query failed");
                None
            }
        }
    }

    /// Records `dir` as the title's source. Only called once the title is
    /// installed, so the database knows it.
    fn claim_title(&mut self, identity: &TitleIdentity, dir: &Path) {
        self.titles.get_or_create(&identity.title_id).payload = Some(TitleMemo {
            source: dir.to_path_buf(),
            known: true,
        });
    }

    /// Whether another live folder already claimed the title. The title
    /// record's register flag marks the conflict as reported.
    fn is_duplicate(&mut self, identity: &TitleIdentity, dir: &Path) -> bool {
        let claimed = self
            .titles
            .find(&identity.title_id)
            .and_then(|rec| rec.payload.as_ref())
            .filter(|memo| memo.source != dir && memo.source.exists())
            .map(|memo| memo.source.clone());
        let Some(owner) = claimed else {
            return false;
        };

        let rec = self.titles.get_or_create(&identity.title_id);
        if rec.note_limit(Counter::Register) {
            warn!(
                title_id = %identity.title_id,
                dir = %dir.display(),
                owner = %owner.display(),
                "duplicate title, skipping"
            );
            self.notifier.notify(&format!(
                "Duplicate {} ({}) ignored: already provided by {}",
                identity.title_name,
                identity.title_id,
                owner.display()
            ));
        }
        true
    }
}

/// A folder is stable once it and its `sce_sys` have been left alone for
/// `threshold`.
fn folder_is_stable(dir: &Path, threshold: Duration) -> bool {
    [dir.to_path_buf(), dir.join("sce_sys")]
        .iter()
        .filter_map(|p| std::fs::metadata(p).ok()?.modified().ok())
        .all(|modified| modified_age(modified) >= threshold)
}

#[cfg(test)]
mod tests {
    use std::fs::{self, File, FileTimes};
    use std::time::SystemTime;

    use super::*;
    use crate::install::AppInstaller;
    use crate::install::tests::{FakeDatabase, write_game};
    use crate::manager::tests::{Harness, harness_with};

    struct Install {
        h: Harness,
        db: FakeDatabase,
    }

    impl Install {
        fn system(&self) -> PathBuf {
            self.h.root.path().join("system_ex").join("app")
        }
    }

    fn age(path: &Path) {
        let past = SystemTime::now() - Duration::from_secs(60);
        File::open(path)
            .unwrap()
            .set_times(FileTimes::new().set_modified(past))
            .unwrap();
    }

    fn add_game(h: &Harness, name: &str, title_id: &str) -> PathBuf {
        let dir = h.scan_root().join(name);
        write_game(&dir, title_id);
        age(&dir.join("sce_sys"));
        age(&dir);
        dir
    }

    fn install_harness() -> Install {
        let mut h = harness_with(|_| {});
        let db = FakeDatabase::default();
        let system = h.root.path().join("system_ex").join("app");
        let user = h.root.path().join("user").join("app");
        h.daemon.installer = Some(Box::new(AppInstaller::new(system, user, Box::new(db.clone()))));
        Install { h, db }
    }

    #[test]
    fn test_startup_mounts_and_installs() {
        let mut t = install_harness();
        t.h.add_image("Game.exfat");
        let game = add_game(&t.h, "Folder", "CUSA00001");

        let report = t.h.daemon.startup();
        assert_eq!(report.mounted, 1);
        assert_eq!(report.installed, 1);
        assert_eq!(t.db.registered.borrow().as_slice(), ["CUSA00001"]);
        let bound = t.system().join("CUSA00001");
        assert!(t.h.kernel().is_mounted(&bound));
        assert_eq!(t.h.notes.count_containing("Found 1 games"), 1);
        assert_eq!(t.h.notes.count_containing("Installed: Game CUSA00001"), 1);
        assert_eq!(t.h.notes.count_containing("Library synchronized."), 1);

        t.h.daemon.shutdown();
        assert!(t.h.kernel().mounts.is_empty());
        assert!(game.exists());
    }

    #[test]
    fn test_empty_library_is_ready() {
        let mut t = install_harness();
        assert_eq!(t.h.daemon.startup(), CycleReport::default());
        assert_eq!(t.h.notes.messages(), ["Library ready."]);
    }

    #[test]
    fn test_image_root_is_a_candidate() {
        let mut t = install_harness();
        let image = t.h.add_image("Game.ffpkg");
        let mp = t.h.mount_base().join("ufsmnt").join("Game");
        write_game(&mp, "CUSA00007");
        age(&mp.join("sce_sys"));
        age(&mp);
        t.h.daemon.mount_image(&image).unwrap();

        assert!(t.h.daemon.candidates().contains(&mp));
        assert_eq!(t.h.daemon.install_titles(), 1);

        // removing the image releases the bind before the image unmount
        fs::remove_file(&image.path).unwrap();
        let seen = t.h.kernel().unmount_calls.len();
        t.h.daemon.check_mounts();
        let unmounts: Vec<PathBuf> = t.h.kernel().unmount_calls[seen..]
            .iter()
            .map(|(p, _)| p.clone())
            .collect();
        assert_eq!(unmounts, vec![t.system().join("CUSA00007"), mp.clone()]);
        assert!(t.h.daemon.mounts().is_empty());
    }

    #[test]
    fn test_duplicate_title_is_reported_once() {
        let mut t = install_harness();
        add_game(&t.h, "First", "CUSA00001");
        add_game(&t.h, "Second", "CUSA00001");

        assert_eq!(t.h.daemon.install_titles(), 1);
        write_game(&t.system().join("CUSA00001"), "CUSA00001");
        assert_eq!(t.h.daemon.install_titles(), 0);
        assert_eq!(t.h.daemon.install_titles(), 0);
        assert_eq!(t.db.registered.borrow().len(), 1);
        assert_eq!(t.h.notes.count_containing("Duplicate Game CUSA00001"), 1);
    }

    #[test]
    fn test_recent_folder_waits() {
        let mut t = install_harness();
        let dir = t.h.scan_root().join("Fresh");
        write_game(&dir, "CUSA00003");

        assert_eq!(t.h.daemon.install_titles(), 0);
        assert!(t.db.registered.borrow().is_empty());
        assert_eq!(t.h.notes.count_containing("Installing"), 0);
    }

    #[test]
    fn test_known_title_skips_stability_and_copy() {
        let mut t = install_harness();
        t.db.known.borrow_mut().insert("CUSA00004".to_string());
        let dir = t.h.scan_root().join("Moved");
        write_game(&dir, "CUSA00004");

        assert_eq!(t.h.daemon.install_titles(), 1);
        let user = t.h.root.path().join("user/app/CUSA00004");
        assert!(user.join("mount.lnk").exists());
        assert!(!user.join("sce_sys").exists());
        assert!(t.h.notes.messages().is_empty());
    }

    #[test]
    fn test_moved_title_reuses_cached_answer_when_database_fails() {
        let mut t = install_harness();
        let first = add_game(&t.h, "First", "CUSA00008");
        assert_eq!(t.h.daemon.install_titles(), 1);
        let user = t.h.root.path().join("user/app/CUSA00008");
        fs::remove_dir_all(user.join("sce_sys")).unwrap();

        let moved = t.h.scan_root().join("Moved");
        fs::rename(&first, &moved).unwrap();
        t.db.unavailable.set(true);

        assert_eq!(t.h.daemon.install_titles(), 1);
        assert_eq!(t.db.registered.borrow().len(), 2);
        assert!(!user.join("sce_sys").exists());
        let tracker = fs::read_to_string(user.join("mount.lnk")).unwrap();
        assert_eq!(PathBuf::from(tracker), moved);
        assert_eq!(t.h.notes.count_containing("Installing"), 1);
    }

    #[test]
    fn test_unanswered_title_query_defers() {
        let mut t = install_harness();
        let dir = add_game(&t.h, "Folder", "CUSA00009");
        t.db.unavailable.set(true);

        assert_eq!(t.h.daemon.install_titles(), 0);
        assert!(t.db.registered.borrow().is_empty());
        assert_eq!(t.h.daemon.attempts(&dir, Counter::Install), 0);
        assert!(t.h.notes.messages().is_empty());

        t.db.unavailable.set(false);
        assert_eq!(t.h.daemon.install_titles(), 1);
    }

    #[test]
    fn test_install_failures_respect_ceiling() {
        let mut h = harness_with(|c| c.retry_ceiling = 2);
        let db = FakeDatabase {
            refuse_with: Some(5),
            ..Default::default()
        };
        let system = h.root.path().join("system_ex").join("app");
        let user = h.root.path().join("user").join("app");
        h.daemon.installer = Some(Box::new(AppInstaller::new(system, user, Box::new(db))));
        let dir = add_game(&h, "Broken", "CUSA00005");

        for _ in 0..4 {
            assert_eq!(h.daemon.install_titles(), 0);
        }
        assert_eq!(h.daemon.attempts(&dir, Counter::Install), 2);
        assert_eq!(h.notes.count_containing("Installing: Game CUSA00005"), 2);
        assert_eq!(h.notes.count_containing("Giving up on Game CUSA00005"), 1);
        assert!(h.daemon.kernel().mounts.is_empty());
    }

    #[test]
    fn test_current_title_is_not_reinstalled() {
        let mut t = install_harness();
        add_game(&t.h, "Folder", "CUSA00006");
        assert_eq!(t.h.daemon.install_titles(), 1);
        // the fake kernel does not expose the bind's contents
        write_game(&t.system().join("CUSA00006"), "CUSA00006");

        assert_eq!(t.h.daemon.install_titles(), 0);
        assert_eq!(t.db.registered.borrow().len(), 1);
    }

    #[test]
    fn test_run_exits_on_stop_and_tears_down() {
        let mut h = harness_with(|c| c.scan_interval_secs = 0);
        h.add_image("Game.exfat");
        h.daemon.startup();
        assert_eq!(h.daemon.mounts().len(), 1);

        h.daemon.stop_flag().request();
        h.daemon.run();
        assert!(h.daemon.mounts().is_empty());
        assert!(h.kernel().mounts.is_empty());
    }

    #[test]
    fn test_run_once() {
        let mut h = harness_with(|_| {});
        h.add_image("A.exfat");
        h.add_image("B.ffpfs");

        let report = h.daemon.run_once();
        assert_eq!(report.mounted, 2);
        assert!(h.daemon.mounts().is_empty());
        assert_eq!(h.kernel().detach_calls.len(), 2);
    }

    #[test]
    fn test_folder_stability() {
        let dir = tempfile::tempdir().unwrap();
        let game = dir.path().join("Game");
        write_game(&game, "CUSA00001");
        assert!(!folder_is_stable(&game, Duration::from_secs(10)));
        age(&game.join("sce_sys"));
        age(&game);
        assert!(folder_is_stable(&game, Duration::from_secs(10)));
        assert!(folder_is_stable(&game, Duration::ZERO));
    }
}
