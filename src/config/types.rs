/// Core types and structures for the preinit pipeline
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Boot-mode flags extracted from the kernel command line.
///
/// Built once at startup and never mutated afterwards.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootConfig {
    /// Kernel asked the ramdisk to be skipped (system-as-root devices)
    pub skip_initramfs: bool,
    /// A/B slot suffix such as `_a`; empty on non-A/B devices
    pub slot_suffix: String,
}

impl BootConfig {
    /// Partition name with the active slot suffix appended
    pub fn partition(&self, base: &str) -> String {
        format!("{}{}", base, self.slot_suffix)
    }
}

/// One parsed uevent record of a block device
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockDeviceInfo {
    pub major: u64,
    pub minor: u64,
    /// Kernel device name (`DEVNAME`), e.g. `sda1`
    pub kernel_name: String,
    /// Partition label (`PARTNAME`), e.g. `SYSTEM_a`
    pub partition_name: String,
    /// Device node path; only meaningful once the record matched a lookup
    pub resolved_path: PathBuf,
}

/// The single rootfs population strategy chosen for this boot
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BootstrapStrategy {
    /// Wipe rootfs and rebuild it from the system partition
    ClearAndRebuild,
    /// Wipe rootfs and extract the xz-compressed ramdisk archive over it
    HighCompressionExtract,
    /// Restore the saved pristine init binary; no tree rebuild
    LegacyRevert,
}

/// Where the active security policy came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicySource {
    /// Single pre-existing monolithic policy file
    Monolithic,
    /// Precompiled split policy whose platform and vendor digests agree
    PrecompiledSplit,
    /// Platform, mapping and vendor CIL sources compiled at boot
    CilCompiled,
}

/// Error type for every fallible preinit operation
#[derive(Error, Debug)]
pub enum InitError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Command line error: {0}")]
    Cmdline(String),

    #[error("Block device error: {0}")]
    Block(String),

    #[error("Mount error: {0}")]
    Mount(String),

    #[error("Filesystem error: {0}")]
    Filesystem(String),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Patch error: {0}")]
    Patch(String),

    #[error("Policy error: {0}")]
    Policy(String),

    #[error("Payload error: {0}")]
    Payload(String),

    #[error("Handoff error: {0}")]
    Handoff(String),
}

pub type Result<T> = std::result::Result<T, InitError>;

impl From<nix::errno::Errno> for InitError {
    fn from(err: nix::errno::Errno) -> Self {
        InitError::Io(std::io::Error::from(err))
    }
}

impl InitError {
    /// Wrap an io error with the path it concerns
    pub fn io_at(path: &std::path::Path, err: std::io::Error) -> Self {
        InitError::Io(std::io::Error::new(
            err.kind(),
            format!("{}: {}", path.display(), err),
        ))
    }

    /// True when the underlying cause is a missing file or directory
    pub fn is_not_found(&self) -> bool {
        matches!(self, InitError::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }
}
