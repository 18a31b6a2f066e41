/// Recording kernel
///
/// Every privileged call is recorded instead of performed. Mounts can be
/// simulated: a snapshot directory registered for a mount source is copied
/// into the target, and bind mounts copy their source tree.
use crate::config::types::{InitError, Result};
use crate::fs::{clone_contents, DirHandle};
use crate::kernel::{KernelOps, NodeKind};
use nix::mount::MsFlags;
use std::cell::RefCell;
use std::collections::HashMap;
use std::convert::Infallible;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountCall {
    pub source: String,
    pub target: PathBuf,
    pub fstype: Option<String>,
    pub flags: MsFlags,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeCall {
    pub path: PathBuf,
    pub kind: NodeKind,
    pub perm: u32,
    pub major: u64,
    pub minor: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecCall {
    pub path: PathBuf,
    pub args: Vec<OsString>,
}

/// Message carried by the error [`RecordingKernel::exec`] returns
pub const EXEC_RECORDED: &str = "exec recorded";

#[derive(Debug, Default)]
pub struct RecordingKernel {
    snapshots: HashMap<String, PathBuf>,
    refused: Vec<PathBuf>,
    mounts: RefCell<Vec<MountCall>>,
    unmounts: RefCell<Vec<PathBuf>>,
    nodes: RefCell<Vec<NodeCall>>,
    stdio: RefCell<Vec<PathBuf>>,
    execs: RefCell<Vec<ExecCall>>,
}

impl RecordingKernel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Populate the target of any mount of `source` from `snapshot`
    pub fn with_mount_source(mut self, source: impl Into<String>, snapshot: impl Into<PathBuf>) -> Self {
        self.snapshots.insert(source.into(), snapshot.into());
        self
    }

    /// Fail every mount onto `target`
    pub fn refusing_mount_at(mut self, target: impl Into<PathBuf>) -> Self {
        self.refused.push(target.into());
        self
    }

    pub fn mounts(&self) -> Vec<MountCall> {
        self.mounts.borrow().clone()
    }

    pub fn unmounts(&self) -> Vec<PathBuf> {
        self.unmounts.borrow().clone()
    }

    pub fn nodes(&self) -> Vec<NodeCall> {
        self.nodes.borrow().clone()
    }

    pub fn stdio_redirects(&self) -> Vec<PathBuf> {
        self.stdio.borrow().clone()
    }

    pub fn execs(&self) -> Vec<ExecCall> {
        self.execs.borrow().clone()
    }

    /// Targets mounted and not yet unmounted, in mount order
    pub fn active_mounts(&self) -> Vec<PathBuf> {
        let unmounts = self.unmounts.borrow();
        self.mounts
            .borrow()
            .iter()
            .map(|m| m.target.clone())
            .filter(|t| !unmounts.contains(t))
            .collect()
    }

    fn populate(&self, from: &Path, target: &Path) -> Result<()> {
        let src = DirHandle::open(from)?;
        let dst = DirHandle::open(target)?;
        clone_contents(&src, &dst, &[])
    }
}

impl KernelOps for RecordingKernel {
    fn mount(&self, source: &str, target: &Path, fstype: Option<&str>, flags: MsFlags) -> Result<()> {
        if !target.is_dir() {
            return Err(InitError::Mount(format!(
                "mount target {} is not a directory",
                target.display()
            )));
        }
        if self.refused.iter().any(|t| t == target) {
            return Err(InitError::Mount(format!("mount of {} refused", target.display())));
        }

        if flags.contains(MsFlags::MS_BIND) {
            self.populate(Path::new(source), target)?;
        } else if let Some(snapshot) = self.snapshots.get(source) {
            self.populate(snapshot, target)?;
        }

        self.mounts.borrow_mut().push(MountCall {
            source: source.to_string(),
            target: target.to_path_buf(),
            fstype: fstype.map(str::to_string),
            flags,
        });
        Ok(())
    }

    fn umount(&self, target: &Path) -> Result<()> {
        self.unmounts.borrow_mut().push(target.to_path_buf());
        Ok(())
    }

    /// Creates an empty regular file where the node would be
    fn mknod(&self, path: &Path, kind: NodeKind, perm: u32, major: u64, minor: u64) -> Result<()> {
        if fs::symlink_metadata(path).is_ok() {
            return Err(InitError::Io(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} exists", path.display()),
            )));
        }
        fs::File::create(path).map_err(|e| InitError::io_at(path, e))?;

        self.nodes.borrow_mut().push(NodeCall {
            path: path.to_path_buf(),
            kind,
            perm,
            major,
            minor,
        });
        Ok(())
    }

    fn redirect_stdio(&self, null_node: &Path) -> Result<()> {
        self.stdio.borrow_mut().push(null_node.to_path_buf());
        Ok(())
    }

    fn exec(&self, path: &Path, args: &[OsString]) -> Result<Infallible> {
        self.execs.borrow_mut().push(ExecCall {
            path: path.to_path_buf(),
            args: args.to_vec(),
        });
        Err(InitError::Handoff(EXEC_RECORDED.to_string()))
    }
}
