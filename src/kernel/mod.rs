//! Thin wrappers around the Linux kernel primitives used during early boot.
//!
//! Privileged side effects (mounts, device nodes, descriptor rewiring, exec)
//! go through [`KernelOps`] so the pipeline can be replayed without privileges.

pub mod block;
pub mod stdio;

use crate::config::types::{InitError, Result};
use nix::mount::MsFlags;
use std::convert::Infallible;
use std::ffi::{CString, OsString};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

/// Kind of special file created by [`KernelOps::mknod`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
    Char,
    Block,
}

/// Privileged operations the boot pipeline performs on the kernel
pub trait KernelOps {
    /// Mount `source` on `target`. `fstype` is `None` for bind mounts.
    fn mount(&self, source: &str, target: &Path, fstype: Option<&str>, flags: MsFlags)
        -> Result<()>;

    fn umount(&self, target: &Path) -> Result<()>;

    fn mknod(&self, path: &Path, kind: NodeKind, perm: u32, major: u64, minor: u64)
        -> Result<()>;

    /// Point stdin/stdout/stderr at a freshly created null device
    fn redirect_stdio(&self, null_node: &Path) -> Result<()>;

    /// Replace the process image. Only returns on failure.
    fn exec(&self, path: &Path, args: &[OsString]) -> Result<Infallible>;
}

/// [`KernelOps`] backed by real syscalls
#[derive(Clone, Copy, Debug, Default)]
pub struct LinuxKernel;

impl KernelOps for LinuxKernel {
    fn mount(
        &self,
        source: &str,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
    ) -> Result<()> {
        nix::mount::mount(Some(source), target, fstype, flags, None::<&str>).map_err(|e| {
            InitError::Mount(format!(
                "mount {} on {} ({}) failed: {}",
                source,
                target.display(),
                fstype.unwrap_or("bind"),
                e
            ))
        })?;
        log::debug!("Mounted {} on {}", source, target.display());
        Ok(())
    }

    fn umount(&self, target: &Path) -> Result<()> {
        nix::mount::umount(target).map_err(|e| {
            InitError::Mount(format!("umount {} failed: {}", target.display(), e))
        })
    }

    fn mknod(&self, path: &Path, kind: NodeKind, perm: u32, major: u64, minor: u64) -> Result<()> {
        use nix::sys::stat::{makedev, mknod, Mode, SFlag};

        let sflag = match kind {
            NodeKind::Char => SFlag::S_IFCHR,
            NodeKind::Block => SFlag::S_IFBLK,
        };
        mknod(
            path,
            sflag,
            Mode::from_bits_truncate(perm as libc::mode_t),
            makedev(major, minor),
        )
        .map_err(|e| InitError::io_at(path, e.into()))
    }

    fn redirect_stdio(&self, null_node: &Path) -> Result<()> {
        stdio::redirect_to_null(self, null_node)
    }

    fn exec(&self, path: &Path, args: &[OsString]) -> Result<Infallible> {
        let path_c = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| InitError::Handoff(format!("NUL byte in {}", path.display())))?;

        let mut argv = Vec::with_capacity(args.len());
        for arg in args {
            argv.push(
                CString::new(arg.as_bytes())
                    .map_err(|_| InitError::Handoff("argument contains NUL byte".to_string()))?,
            );
        }

        log::info!("Handing off to {} {:?}", path.display(), args);
        nix::unistd::execv(&path_c, &argv)
            .map_err(|e| InitError::Handoff(format!("execv {} failed: {}", path.display(), e)))
    }
}
