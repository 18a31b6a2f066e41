//! Rootfs Reconstructor
//!
//! Exactly one of three strategies repopulates the root directory:
//!
//! - `ClearAndRebuild` when the kernel skipped the ramdisk: wipe rootfs and
//!   rebuild it from the system partition.
//! - `HighCompressionExtract` when an xz ramdisk image is present: wipe rootfs
//!   and extract the image over it.
//! - `LegacyRevert` otherwise: put the pristine init binary back in place.
//!
//! The root directory descriptor stays open across the wipe.

use crate::archive::{self, unxz};
use crate::boot::early_mount::{EarlyMounter, EarlyMounts};
use crate::config::layout::{Layout, CLEAR_PRESERVE, EXTRACT_PRESERVE};
use crate::config::types::{BootConfig, BootstrapStrategy, InitError, Result};
use crate::fs::{remove_contents_except, DirHandle, MappedFile};
use crate::kernel::KernelOps;
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::os::unix::fs::OpenOptionsExt;

/// Pick the strategy for this boot.
///
/// `skip_initramfs` takes precedence over a present compressed ramdisk.
pub fn select_strategy(config: &BootConfig, compressed_ramdisk: bool) -> BootstrapStrategy {
    if config.skip_initramfs {
        BootstrapStrategy::ClearAndRebuild
    } else if compressed_ramdisk {
        BootstrapStrategy::HighCompressionExtract
    } else {
        BootstrapStrategy::LegacyRevert
    }
}

pub struct RootfsReconstructor<'a, K: KernelOps + ?Sized> {
    kernel: &'a K,
    layout: &'a Layout,
    config: &'a BootConfig,
}

impl<'a, K: KernelOps + ?Sized> RootfsReconstructor<'a, K> {
    pub fn new(kernel: &'a K, layout: &'a Layout, config: &'a BootConfig) -> Self {
        Self {
            kernel,
            layout,
            config,
        }
    }

    pub fn strategy(&self) -> BootstrapStrategy {
        let compressed = fs::symlink_metadata(&self.layout.compressed_ramdisk).is_ok();
        select_strategy(self.config, compressed)
    }

    pub fn run(&self, root: &DirHandle, mounts: &mut EarlyMounts) -> Result<BootstrapStrategy> {
        let strategy = self.strategy();
        log::info!("Rootfs strategy: {:?}", strategy);

        match strategy {
            BootstrapStrategy::ClearAndRebuild => self.clear_and_rebuild(root, mounts)?,
            BootstrapStrategy::HighCompressionExtract => self.extract_ramdisk(root)?,
            BootstrapStrategy::LegacyRevert => self.legacy_revert()?,
        }
        Ok(strategy)
    }

    fn clear_and_rebuild(&self, root: &DirHandle, mounts: &mut EarlyMounts) -> Result<()> {
        remove_contents_except(root, CLEAR_PRESERVE)?;
        EarlyMounter::new(self.kernel, self.layout, self.config).mount_system_root(root, mounts)
    }

    /// Decompress the ramdisk image into the archive file
    fn decompress_ramdisk(&self) -> Result<()> {
        let image = MappedFile::open(&self.layout.compressed_ramdisk)?;
        let out = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .custom_flags(libc::O_CLOEXEC)
            .open(&self.layout.ramdisk_archive)
            .map_err(|e| InitError::io_at(&self.layout.ramdisk_archive, e))?;

        let mut out = BufWriter::new(out);
        let n = unxz(image.as_bytes(), &mut out)?;
        out.flush()
            .map_err(|e| InitError::io_at(&self.layout.ramdisk_archive, e))?;
        log::info!("Decompressed ramdisk: {} bytes", n);
        Ok(())
    }

    fn extract_ramdisk(&self, root: &DirHandle) -> Result<()> {
        self.decompress_ramdisk()?;

        // Parse before the wipe removes the archive itself
        let entries = {
            let archive_map = MappedFile::open(&self.layout.ramdisk_archive)?;
            archive::parse(archive_map.as_bytes())?
        };

        remove_contents_except(root, EXTRACT_PRESERVE)?;
        archive::extract_all(&entries, &self.layout.root)?;
        log::info!("Extracted {} ramdisk entries", entries.len());
        Ok(())
    }

    fn legacy_revert(&self) -> Result<()> {
        let pristine = &self.layout.pristine_init;
        if fs::symlink_metadata(pristine).is_err() {
            log::warn!("No saved init at {}, leaving /init alone", pristine.display());
            return Ok(());
        }

        match fs::remove_file(&self.layout.init) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(InitError::io_at(&self.layout.init, e)),
        }
        // Linked, not moved: the saved copy stays for later boots
        fs::hard_link(pristine, &self.layout.init).map_err(|e| InitError::io_at(pristine, e))?;
        log::info!("Restored pristine init");
        Ok(())
    }
}
