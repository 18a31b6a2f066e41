//! Early mounts of the system and vendor partitions.
//!
//! The real init expects to find its policy sources before ueventd runs, so
//! the partitions are mounted read-only here and released again right before
//! handoff.

use crate::config::layout::{
    Layout, CLONE_EXCLUDE, PARTITION_FSTYPE, SYSTEM_PARTITION, VENDOR_PARTITION,
};
use crate::config::types::{BootConfig, InitError, Result};
use crate::fs::{clone_contents, DirHandle};
use crate::kernel::block::BlockResolver;
use crate::kernel::KernelOps;
use nix::mount::MsFlags;
use std::fs::DirBuilder;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

/// What this boot has mounted so far
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EarlyMounts {
    pub sysfs: bool,
    pub system_root: bool,
    pub system: bool,
    pub vendor: bool,
}

impl EarlyMounts {
    /// Human readable list for the boot report
    pub fn describe(&self, layout: &Layout) -> Vec<String> {
        let mut out = Vec::new();
        for (mounted, path) in [
            (self.system_root, &layout.system_root),
            (self.system, &layout.system),
            (self.vendor, &layout.vendor),
        ] {
            if mounted {
                out.push(path.display().to_string());
            }
        }
        out
    }
}

fn ensure_dir(path: &Path) -> Result<()> {
    DirBuilder::new()
        .recursive(true)
        .mode(0o755)
        .create(path)
        .map_err(|e| InitError::io_at(path, e))
}

pub struct EarlyMounter<'a, K: KernelOps + ?Sized> {
    kernel: &'a K,
    layout: &'a Layout,
    config: &'a BootConfig,
}

impl<'a, K: KernelOps + ?Sized> EarlyMounter<'a, K> {
    pub fn new(kernel: &'a K, layout: &'a Layout, config: &'a BootConfig) -> Self {
        Self {
            kernel,
            layout,
            config,
        }
    }

    /// Mount sysfs once so partitions can be resolved
    pub fn mount_sysfs(&self, mounts: &mut EarlyMounts) -> Result<()> {
        if mounts.sysfs {
            return Ok(());
        }
        ensure_dir(&self.layout.sys_dir)?;
        self.kernel
            .mount("sysfs", &self.layout.sys_dir, Some("sysfs"), MsFlags::empty())?;
        mounts.sysfs = true;
        Ok(())
    }

    /// Resolve `base` plus slot suffix and mount it read-only on `target`.
    ///
    /// `Ok(None)` when the partition does not exist.
    fn mount_partition(&self, base: &str, target: &Path) -> Result<Option<PathBuf>> {
        let partition = self.config.partition(base);
        let resolver = BlockResolver::new(self.kernel, self.layout);
        let Some(info) = resolver.resolve(&partition)? else {
            return Ok(None);
        };

        ensure_dir(target)?;
        let source = info.resolved_path.to_string_lossy();
        self.kernel
            .mount(&source, target, Some(PARTITION_FSTYPE), MsFlags::MS_RDONLY)?;
        log::info!("Mounted {} on {}", partition, target.display());
        Ok(Some(target.to_path_buf()))
    }

    /// Vendor is optional everywhere
    fn mount_vendor(&self, mounts: &mut EarlyMounts) -> Result<()> {
        match self.mount_partition(VENDOR_PARTITION, &self.layout.vendor) {
            Ok(Some(_)) => mounts.vendor = true,
            Ok(None) => log::info!("No vendor partition"),
            Err(e) => log::warn!("Vendor mount failed: {}", e),
        }
        Ok(())
    }

    /// System-as-root: mount the system partition at `/system_root`, rebuild
    /// rootfs from it, and expose its `system` subtree at `/system`.
    pub fn mount_system_root(&self, root: &DirHandle, mounts: &mut EarlyMounts) -> Result<()> {
        self.mount_sysfs(mounts)?;

        if self
            .mount_partition(SYSTEM_PARTITION, &self.layout.system_root)?
            .is_none()
        {
            return Err(InitError::Block(format!(
                "System partition {} not found",
                self.config.partition(SYSTEM_PARTITION)
            )));
        }
        mounts.system_root = true;

        let system_root = DirHandle::open(&self.layout.system_root)?;
        clone_contents(&system_root, root, CLONE_EXCLUDE)?;
        drop(system_root);

        ensure_dir(&self.layout.system)?;
        let bind_source = self.layout.system_root_system();
        self.kernel.mount(
            &bind_source.to_string_lossy(),
            &self.layout.system,
            None,
            MsFlags::MS_BIND,
        )?;
        mounts.system = true;

        self.mount_vendor(mounts)
    }

    /// Split-policy device with a ramdisk: mount system at `/system` and
    /// vendor at `/vendor`.
    pub fn mount_system(&self, mounts: &mut EarlyMounts) -> Result<()> {
        self.mount_sysfs(mounts)?;

        if self
            .mount_partition(SYSTEM_PARTITION, &self.layout.system)?
            .is_none()
        {
            return Err(InitError::Block(format!(
                "System partition {} not found",
                self.config.partition(SYSTEM_PARTITION)
            )));
        }
        mounts.system = true;

        self.mount_vendor(mounts)
    }

    /// Undo the early mounts before handoff.
    ///
    /// Vendor is always unmounted. System stays mounted for system-as-root
    /// boots, where the real init expects it in place.
    pub fn release(&self, mounts: &mut EarlyMounts) {
        if let Err(e) = self.kernel.umount(&self.layout.vendor) {
            log::debug!("Vendor not unmounted: {}", e);
        }
        mounts.vendor = false;

        if !self.config.skip_initramfs && mounts.system {
            match self.kernel.umount(&self.layout.system) {
                Ok(()) => mounts.system = false,
                Err(e) => log::warn!("System not unmounted: {}", e),
            }
        }
    }
}
