//! In-memory [`Kernel`] for unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use snafu::IntoError;

use crate::device::{AttachRequest, Backend};
use crate::error::{AttachIoctlSnafu, DetachSnafu, Result};
use crate::preset::MountOptions;
use crate::syscall::{Kernel, MountRejection, MountSource};

/// Records every call and simulates attach units, device nodes and a mount
/// table. Queued errors are consumed one per call.
#[derive(Debug)]
pub(crate) struct FakeKernel {
    pub next_unit: i32,
    /// Whether a successful attach creates the device node.
    pub create_nodes: bool,
    pub nodes: HashSet<PathBuf>,
    /// Mount stacks keyed by mount point, top of stack last.
    pub mounts: HashMap<PathBuf, Vec<MountSource>>,
    pub block_size: Option<u64>,

    pub attach_errors: VecDeque<Errno>,
    pub detach_errors: VecDeque<Errno>,
    pub mount_errors: VecDeque<MountRejection>,
    /// Filesystem types every `nmount` of which fails with `EOPNOTSUPP`.
    pub refused_fstypes: HashSet<String>,
    pub unmount_errors: VecDeque<Errno>,

    pub attach_calls: Vec<AttachRequest>,
    pub detach_calls: Vec<(Backend, i32, bool)>,
    pub mount_calls: Vec<(MountOptions, u32)>,
    pub unmount_calls: Vec<(PathBuf, u32)>,
}

impl FakeKernel {
    pub fn new() -> Self {
        Self {
            next_unit: 0,
            create_nodes: true,
            nodes: HashSet::new(),
            mounts: HashMap::new(),
            block_size: None,
            attach_errors: VecDeque::new(),
            detach_errors: VecDeque::new(),
            mount_errors: VecDeque::new(),
            refused_fstypes: HashSet::new(),
            unmount_errors: VecDeque::new(),
            attach_calls: Vec::new(),
            detach_calls: Vec::new(),
            mount_calls: Vec::new(),
            unmount_calls: Vec::new(),
        }
    }

    /// Pretends `from` is mounted on `on` by someone else.
    pub fn add_mount(&mut self, from: &str, on: &Path) {
        self.mounts.entry(on.to_path_buf()).or_default().push(MountSource {
            from: from.to_string(),
            on: on.to_path_buf(),
        });
    }

    /// Drops every mount stacked on `on`, as an outside `umount -f` would.
    pub fn drop_mount(&mut self, on: &Path) {
        self.mounts.remove(on);
    }

    pub fn is_mounted(&self, on: &Path) -> bool {
        self.mounts.get(on).is_some_and(|stack| !stack.is_empty())
    }

    /// Filesystem types passed to successful and failed `nmount` calls.
    pub fn mounted_types(&self) -> Vec<String> {
        self.mount_calls
            .iter()
            .filter_map(|(opts, _)| opts.fstype().map(str::to_string))
            .collect()
    }
}

impl Kernel for FakeKernel {
    fn attach(&mut self, request: &AttachRequest) -> Result<i32> {
        self.attach_calls.push(request.clone());
        if let Some(errno) = self.attach_errors.pop_front() {
            return Err(AttachIoctlSnafu {
                backend: request.backend,
                image: request.layer.path.clone(),
            }
            .into_error(errno));
        }
        let unit = self.next_unit;
        if unit >= 0 {
            self.next_unit += 1;
            if self.create_nodes {
                self.nodes.insert(request.backend.node_path(unit));
            }
        }
        Ok(unit)
    }

    fn detach(&mut self, backend: Backend, unit: i32, force: bool) -> Result<()> {
        self.detach_calls.push((backend, unit, force));
        if let Some(errno) = self.detach_errors.pop_front() {
            return Err(DetachSnafu { backend, unit }.into_error(errno));
        }
        self.nodes.remove(&backend.node_path(unit));
        Ok(())
    }

    fn nmount(
        &mut self,
        options: &MountOptions,
        flags: u32,
    ) -> std::result::Result<(), MountRejection> {
        self.mount_calls.push((options.clone(), flags));
        if let Some(rejection) = self.mount_errors.pop_front() {
            return Err(rejection);
        }
        if options.fstype().is_some_and(|t| self.refused_fstypes.contains(t)) {
            return Err(MountRejection {
                errno: Errno::EOPNOTSUPP,
                errmsg: None,
            });
        }
        let from = options.value("from").flatten().unwrap_or_default().to_string();
        let Some(on) = options.value("fspath").flatten() else {
            return Err(MountRejection {
                errno: Errno::EINVAL,
                errmsg: Some("missing fspath".to_string()),
            });
        };
        self.add_mount(&from, Path::new(on));
        Ok(())
    }

    fn unmount(&mut self, path: &Path, flags: u32) -> std::result::Result<(), Errno> {
        self.unmount_calls.push((path.to_path_buf(), flags));
        if let Some(errno) = self.unmount_errors.pop_front() {
            return Err(errno);
        }
        let Some(stack) = self.mounts.get_mut(path) else {
            return Err(Errno::EINVAL);
        };
        stack.pop();
        if stack.is_empty() {
            self.mounts.remove(path);
        }
        Ok(())
    }

    fn mount_source(&self, path: &Path) -> Option<MountSource> {
        path.ancestors()
            .find_map(|p| self.mounts.get(p).and_then(|stack| stack.last()))
            .cloned()
            .or_else(|| {
                Some(MountSource {
                    from: "/dev/root".to_string(),
                    on: PathBuf::from("/"),
                })
            })
    }

    fn block_size(&self, _path: &Path) -> Option<u64> {
        self.block_size
    }

    fn node_exists(&self, node: &Path) -> bool {
        self.nodes.contains(node)
    }
}
