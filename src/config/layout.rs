//! Well-known filesystem locations used during early boot.
//!
//! Every path the pipeline touches is derived from a single root so the whole
//! boot sequence can be replayed inside a scratch directory.

use std::path::{Path, PathBuf};

/// Partition label of the system image (slot suffix appended at runtime)
pub const SYSTEM_PARTITION: &str = "SYSTEM";
/// Partition label of the vendor image (slot suffix appended at runtime)
pub const VENDOR_PARTITION: &str = "VENDOR";
/// Filesystem type of system and vendor partitions
pub const PARTITION_FSTYPE: &str = "ext4";

/// Entries that survive the ClearAndRebuild wipe
pub const CLEAR_PRESERVE: &[&str] = &["overlay", ".backup", "init.bak"];
/// Entries that survive the HighCompressionExtract wipe
pub const EXTRACT_PRESERVE: &[&str] = &["overlay", ".backup"];
/// Entries of the system partition root not cloned into rootfs
pub const CLONE_EXCLUDE: &[&str] = &["system"];

/// Resolved set of boot paths
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Layout {
    pub root: PathBuf,

    pub init: PathBuf,
    pub init_backup: PathBuf,
    pub pristine_init: PathBuf,
    pub init_rc: PathBuf,
    pub overlay: PathBuf,
    pub compressed_ramdisk: PathBuf,
    pub ramdisk_archive: PathBuf,
    pub recovery_marker: PathBuf,

    pub null_node: PathBuf,
    pub kmsg_node: PathBuf,
    pub proc_dir: PathBuf,
    pub proc_cmdline: PathBuf,
    pub sys_dir: PathBuf,
    pub block_class_dir: PathBuf,
    pub dev_block_dir: PathBuf,

    pub system_root: PathBuf,
    pub system: PathBuf,
    pub vendor: PathBuf,

    pub monolithic_policy: PathBuf,
    pub debug_policy: PathBuf,
    pub precompiled_policy: PathBuf,
    pub plat_policy_dir: PathBuf,
    pub vendor_policy_dir: PathBuf,
    pub plat_cil: PathBuf,
    pub plat_mapping_dir: PathBuf,
    pub vendor_plat_version: PathBuf,

    pub agent_script: PathBuf,
    pub agent_binary: PathBuf,
    pub init_service: PathBuf,
}

impl Layout {
    /// Layout of the live device, rooted at `/`
    pub fn system() -> Self {
        Self::rooted("/")
    }

    /// Layout rooted at an arbitrary directory
    pub fn rooted<P: AsRef<Path>>(root: P) -> Self {
        let root = root.as_ref().to_path_buf();
        let at = |rel: &str| root.join(rel);

        Self {
            init: at("init"),
            init_backup: at("init.bak"),
            pristine_init: at(".backup/init"),
            init_rc: at("init.rc"),
            overlay: at("overlay"),
            compressed_ramdisk: at("ramdisk.cpio.xz"),
            ramdisk_archive: at("ramdisk.cpio"),
            recovery_marker: at("etc/recovery.fstab"),

            null_node: at("null"),
            kmsg_node: at("kmsg"),
            proc_dir: at("proc"),
            proc_cmdline: at("proc/cmdline"),
            sys_dir: at("sys"),
            block_class_dir: at("sys/dev/block"),
            dev_block_dir: at("dev/block"),

            system_root: at("system_root"),
            system: at("system"),
            vendor: at("vendor"),

            monolithic_policy: at("sepolicy"),
            debug_policy: at("sepolicy_debug"),
            precompiled_policy: at("vendor/etc/selinux/precompiled_sepolicy"),
            plat_policy_dir: at("system/etc/selinux"),
            vendor_policy_dir: at("vendor/etc/selinux"),
            plat_cil: at("system/etc/selinux/plat_sepolicy.cil"),
            plat_mapping_dir: at("system/etc/selinux/mapping"),
            vendor_plat_version: at("vendor/etc/selinux/plat_sepolicy_vers.txt"),

            agent_script: at("init.magisk.rc"),
            agent_binary: at("sbin/magisk"),
            init_service: at("sbin/magiskinit"),

            root,
        }
    }

    /// Path of the platform-to-vendor mapping CIL for a platform version
    pub fn plat_mapping(&self, version: &str) -> PathBuf {
        self.plat_mapping_dir.join(format!("{}.cil", version))
    }

    /// Path of the system partition's `/system` subtree once mounted at `system_root`
    pub fn system_root_system(&self) -> PathBuf {
        self.system_root.join("system")
    }

    /// The placeholder path compiled into the real init binary.
    ///
    /// Always the on-device absolute path, regardless of where the layout is rooted.
    pub fn plat_cil_signature() -> &'static [u8] {
        b"/system/etc/selinux/plat_sepolicy.cil"
    }
}

impl Default for Layout {
    fn default() -> Self {
        Self::system()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_layout_paths() {
        let layout = Layout::system();
        assert_eq!(layout.init, PathBuf::from("/init"));
        assert_eq!(layout.block_class_dir, PathBuf::from("/sys/dev/block"));
        assert_eq!(
            layout.plat_mapping("26.0"),
            PathBuf::from("/system/etc/selinux/mapping/26.0.cil")
        );
    }

    #[test]
    fn test_rooted_layout_stays_under_root() {
        let layout = Layout::rooted("/tmp/scratch");
        for path in [
            &layout.init,
            &layout.overlay,
            &layout.monolithic_policy,
            &layout.vendor_policy_dir,
            &layout.agent_binary,
        ] {
            assert!(path.starts_with("/tmp/scratch"), "{}", path.display());
        }
    }

    #[test]
    fn test_preserve_lists_exclude_working_dirs() {
        for name in ["system_root", "system", "vendor", "sys", "dev"] {
            assert!(!CLEAR_PRESERVE.contains(&name));
            assert!(!EXTRACT_PRESERVE.contains(&name));
        }
    }

    #[test]
    fn test_plat_cil_signature_matches_system_layout() {
        let layout = Layout::system();
        assert_eq!(
            layout.plat_cil.to_str().map(str::as_bytes),
            Some(Layout::plat_cil_signature())
        );
    }
}
