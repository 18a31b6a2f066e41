//! Kernel command line parsing.
//!
//! Only three tokens matter to preinit; everything else is left for the real init.

use crate::config::layout::Layout;
use crate::config::types::{BootConfig, InitError, Result};
use crate::kernel::KernelOps;
use nix::mount::MsFlags;
use std::fs::{self, DirBuilder};
use std::os::unix::fs::DirBuilderExt;

/// Longest accepted slot suffix (`_` plus one slot letter)
pub const MAX_SLOT_SUFFIX: usize = 2;

/// Mode of the procfs mountpoint
const PROC_MODE: u32 = 0o555;

/// Parse raw command line text into a [`BootConfig`]
pub fn parse(cmdline: &str) -> BootConfig {
    let mut config = BootConfig::default();

    for token in cmdline.split_ascii_whitespace() {
        let (key, value) = match token.split_once('=') {
            Some((key, value)) => (key, Some(value)),
            None => (token, None),
        };

        match (key, value) {
            ("skip_initramfs", None) => config.skip_initramfs = true,
            ("androidboot.slot_suffix", Some(suffix)) => {
                if suffix.chars().count() > MAX_SLOT_SUFFIX {
                    log::warn!("Ignoring over-long slot suffix {:?}", suffix);
                } else {
                    config.slot_suffix = suffix.to_string();
                }
            }
            ("androidboot.slot", Some(slot)) => match slot.chars().next() {
                Some(c) => config.slot_suffix = format!("_{}", c),
                None => log::warn!("Ignoring empty androidboot.slot"),
            },
            _ => {}
        }
    }

    config
}

/// Mount a private procfs, read `/proc/cmdline`, unmount it again
fn read_cmdline<K: KernelOps + ?Sized>(kernel: &K, layout: &Layout) -> Result<String> {
    DirBuilder::new()
        .recursive(true)
        .mode(PROC_MODE)
        .create(&layout.proc_dir)
        .map_err(|e| InitError::io_at(&layout.proc_dir, e))?;
    kernel.mount("proc", &layout.proc_dir, Some("proc"), MsFlags::empty())?;

    let text = fs::read(&layout.proc_cmdline)
        .map(|raw| String::from_utf8_lossy(&raw).into_owned())
        .map_err(|e| InitError::Cmdline(format!("{}: {}", layout.proc_cmdline.display(), e)));

    if let Err(e) = kernel.umount(&layout.proc_dir) {
        log::warn!("Failed to unmount temporary procfs: {}", e);
    }

    text
}

/// Read and parse the kernel command line.
///
/// Never fails: an unreadable command line yields the zeroed configuration.
pub fn load<K: KernelOps + ?Sized>(kernel: &K, layout: &Layout) -> BootConfig {
    let config = match read_cmdline(kernel, layout) {
        Ok(text) => parse(&text),
        Err(e) => {
            log::warn!("Kernel command line unavailable, using defaults: {}", e);
            BootConfig::default()
        }
    };

    log::info!(
        "cmdline: skip_initramfs[{}] slot[{}]",
        config.skip_initramfs,
        config.slot_suffix
    );
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingKernel;

    #[test]
    fn test_skip_initramfs_flag() {
        assert!(parse("console=ttyMSM0 skip_initramfs rootwait").skip_initramfs);
        assert!(!parse("console=ttyMSM0 rootwait").skip_initramfs);
        assert!(!parse("skip_initramfs=0").skip_initramfs);
    }

    #[test]
    fn test_slot_letter() {
        assert_eq!(parse("androidboot.slot=a").slot_suffix, "_a");
    }

    #[test]
    fn test_slot_suffix_literal() {
        assert_eq!(parse("androidboot.slot_suffix=_b").slot_suffix, "_b");
    }

    #[test]
    fn test_last_slot_token_wins() {
        assert_eq!(
            parse("androidboot.slot_suffix=_b androidboot.slot=a").slot_suffix,
            "_a"
        );
        assert_eq!(
            parse("androidboot.slot=a androidboot.slot_suffix=_b").slot_suffix,
            "_b"
        );
    }

    #[test]
    fn test_prefix_lookalikes_are_ignored() {
        let cfg = parse("androidboot.slotx=a androidboot.slot_suffix_extra=_c skip_initramfsx");
        assert_eq!(cfg, BootConfig::default());
    }

    #[test]
    fn test_over_long_suffix_rejected() {
        assert_eq!(parse("androidboot.slot_suffix=_abc").slot_suffix, "");
    }

    #[test]
    fn test_empty_cmdline() {
        assert_eq!(parse(""), BootConfig::default());
        assert_eq!(parse("   \n"), BootConfig::default());
    }

    #[test]
    fn test_load_reads_proc_and_unmounts() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::rooted(dir.path());
        fs::create_dir_all(&layout.proc_dir).unwrap();
        fs::write(&layout.proc_cmdline, "skip_initramfs androidboot.slot=b\n").unwrap();

        let kernel = RecordingKernel::new();
        let cfg = load(&kernel, &layout);

        assert!(cfg.skip_initramfs);
        assert_eq!(cfg.slot_suffix, "_b");
        assert!(kernel.mounts().iter().any(|m| m.target == layout.proc_dir));
        assert!(kernel.unmounts().contains(&layout.proc_dir));
    }

    #[test]
    fn test_proc_mountpoint_is_read_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::rooted(dir.path());
        load(&RecordingKernel::new(), &layout);

        let mode = fs::metadata(&layout.proc_dir).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o555);
    }

    #[test]
    fn test_load_unreadable_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::rooted(dir.path());
        let kernel = RecordingKernel::new();
        assert_eq!(load(&kernel, &layout), BootConfig::default());
    }
}
