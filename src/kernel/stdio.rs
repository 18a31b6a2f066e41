/// Standard descriptor hygiene for the first user-space process
///
/// The kernel hands init whatever console it found (or nothing at all), so the
/// three standard descriptors are pinned to a private null device before any
/// file is opened. A stale low-numbered descriptor can then never be mistaken
/// for a log or policy file.
use crate::config::types::{InitError, Result};
use crate::kernel::{KernelOps, NodeKind};
use nix::fcntl::OFlag;
use std::fs::OpenOptions;
use std::os::fd::{AsRawFd, IntoRawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

/// Device numbers of the memory null device
pub const NULL_MAJOR: u64 = 1;
pub const NULL_MINOR: u64 = 3;

/// Create a null node at `node`, open it, unlink it and dup it over 0, 1 and 2
pub fn redirect_to_null<K: KernelOps + ?Sized>(kernel: &K, node: &Path) -> Result<()> {
    match kernel.mknod(node, NodeKind::Char, 0o666, NULL_MAJOR, NULL_MINOR) {
        Ok(()) => {}
        Err(InitError::Io(e)) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
        Err(e) => return Err(e),
    }

    let null = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_CLOEXEC)
        .open(node)
        .map_err(|e| InitError::io_at(node, e))?;

    if let Err(e) = std::fs::remove_file(node) {
        log::warn!("Failed to unlink {}: {}", node.display(), e);
    }

    let null_fd = null.as_raw_fd();
    for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        if null_fd == target {
            continue;
        }
        nix::unistd::dup3(null_fd, target, OFlag::O_CLOEXEC)?;
    }

    if null_fd <= libc::STDERR_FILENO {
        // Now one of the standard descriptors; keep it open.
        let _ = null.into_raw_fd();
    }

    Ok(())
}
