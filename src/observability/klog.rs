//! Kernel log sink.
//!
//! In boot mode stdio points at a discarded device, so records go to the
//! kernel ring buffer instead. The kmsg node is created, opened, and unlinked
//! straight away; only the descriptor survives.

use crate::config::types::{InitError, Result};
use crate::kernel::{KernelOps, NodeKind};
use env_logger::{Builder, Env, Target};
use log::LevelFilter;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

pub const KMSG_MAJOR: u64 = 1;
pub const KMSG_MINOR: u64 = 11;

/// Environment variable holding the log filter
pub const LOG_ENV: &str = "PREINIT_LOG";

/// Prefix of every kernel log line
pub const LOG_TAG: &str = "preinit";

pub fn open_kmsg<K: KernelOps + ?Sized>(kernel: &K, node: &Path) -> Result<File> {
    match kernel.mknod(node, NodeKind::Char, 0o600, KMSG_MAJOR, KMSG_MINOR) {
        Ok(()) => {}
        Err(InitError::Io(e)) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
        Err(e) => return Err(e),
    }

    let file = OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_CLOEXEC)
        .open(node)
        .map_err(|e| InitError::io_at(node, e));
    if let Err(e) = fs::remove_file(node) {
        log::debug!("Leaving {} behind: {}", node.display(), e);
    }
    file
}

fn builder() -> Builder {
    let mut builder = Builder::new();
    builder.filter_level(LevelFilter::Info);
    builder.parse_env(Env::new().filter(LOG_ENV));
    builder
}

/// Route log records to the kernel log.
///
/// Falls back to stderr when the kmsg node is unavailable. Calling this twice
/// is harmless; the first logger stays installed.
pub fn init_boot_logger<K: KernelOps + ?Sized>(kernel: &K, node: &Path) {
    let mut builder = builder();
    builder.format(|buf, record| writeln!(buf, "{}: {} {}", LOG_TAG, record.level(), record.args()));

    let kmsg = open_kmsg(kernel, node);
    if let Ok(file) = &kmsg {
        if let Ok(clone) = file.try_clone() {
            builder.target(Target::Pipe(Box::new(clone)));
        }
    }

    if builder.try_init().is_ok() {
        if let Err(e) = kmsg {
            log::warn!("Kernel log unavailable, logging to stderr: {}", e);
        }
    }
}

/// Plain stderr logging for the command-line modes
pub fn init_cli_logger() {
    let _ = builder().try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingKernel;

    #[test]
    fn test_open_kmsg_unlinks_node() {
        let dir = tempfile::tempdir().unwrap();
        let node = dir.path().join("kmsg");
        let kernel = RecordingKernel::new();

        let mut file = open_kmsg(&kernel, &node).unwrap();
        writeln!(file, "hello").unwrap();

        assert!(!node.exists());
        let nodes = kernel.nodes();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].kind, NodeKind::Char);
        assert_eq!((nodes[0].major, nodes[0].minor), (KMSG_MAJOR, KMSG_MINOR));
    }

    #[test]
    fn test_open_kmsg_missing_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = RecordingKernel::new();
        assert!(open_kmsg(&kernel, &dir.path().join("nope/kmsg")).is_err());
    }
}
