//! CIL compilation inputs.
//!
//! Split-policy devices ship CIL text instead of a binary policy. Before it can
//! be patched, the policy must be compiled from three groups of files, in
//! order: the platform CIL, the platform-to-vendor mapping for the vendor's
//! platform version, then every `*.cil` in the vendor policy directory.

use crate::config::layout::Layout;
use crate::config::types::{InitError, Result};
use crate::fs::MappedFile;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Policy database version with ioctl extended permissions
pub const POLICYDB_VERSION_XPERMS_IOCTL: u32 = 30;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum TargetPlatform {
    Selinux,
    Xen,
}

impl TargetPlatform {
    /// Numeric value understood by the policy library
    pub fn as_raw(self) -> i32 {
        match self {
            TargetPlatform::Selinux => 0,
            TargetPlatform::Xen => 1,
        }
    }
}

/// Compiler switches
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CilOptions {
    pub mls: bool,
    pub multiple_decls: bool,
    pub disable_neverallow: bool,
    pub target_platform: TargetPlatform,
    pub policy_version: u32,
    pub attrs_expand_generated: bool,
}

impl CilOptions {
    /// Options used when compiling split policy at boot
    pub fn boot() -> Self {
        Self {
            mls: true,
            multiple_decls: true,
            disable_neverallow: true,
            target_platform: TargetPlatform::Selinux,
            policy_version: POLICYDB_VERSION_XPERMS_IOCTL,
            attrs_expand_generated: false,
        }
    }
}

impl Default for CilOptions {
    fn default() -> Self {
        Self::boot()
    }
}

/// One CIL file mapped into memory for the compiler
pub struct CilSource {
    pub path: PathBuf,
    pub contents: MappedFile,
}

impl CilSource {
    pub fn open(path: &Path) -> Result<Self> {
        let contents = MappedFile::open(path)
            .map_err(|e| InitError::Policy(format!("Cannot map CIL source: {}", e)))?;
        Ok(Self {
            path: path.to_path_buf(),
            contents,
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.contents.as_bytes()
    }
}

impl std::fmt::Debug for CilSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CilSource")
            .field("path", &self.path)
            .field("len", &self.contents.len())
            .finish()
    }
}

/// Platform version the vendor policy was built against
pub fn vendor_platform_version(layout: &Layout) -> Result<String> {
    let raw = fs::read_to_string(&layout.vendor_plat_version).map_err(|e| {
        InitError::Policy(format!(
            "Cannot read {}: {}",
            layout.vendor_plat_version.display(),
            e
        ))
    })?;
    let version = raw.trim();
    if version.is_empty() {
        return Err(InitError::Policy(format!(
            "{} is empty",
            layout.vendor_plat_version.display()
        )));
    }
    Ok(version.to_string())
}

/// Vendor `*.cil` files in directory enumeration order
fn vendor_cil_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir)
        .map_err(|e| InitError::Policy(format!("Cannot read {}: {}", dir.display(), e)))?;

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| InitError::io_at(dir, e))?;
        let path = entry.path();
        let is_cil = path.extension().map_or(false, |ext| ext == "cil");
        let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
        if is_cil && is_file {
            files.push(path);
        }
    }
    Ok(files)
}

/// Gather and map every compiler input in compile order
pub fn collect_sources(layout: &Layout) -> Result<Vec<CilSource>> {
    let version = vendor_platform_version(layout)?;

    let mut paths = vec![layout.plat_cil.clone(), layout.plat_mapping(&version)];
    paths.extend(vendor_cil_files(&layout.vendor_policy_dir)?);

    let mut sources = Vec::with_capacity(paths.len());
    for path in &paths {
        log::info!("Loading CIL {}", path.display());
        sources.push(CilSource::open(path)?);
    }
    Ok(sources)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split_policy_tree(layout: &Layout, vendor_files: &[&str]) {
        fs::create_dir_all(&layout.plat_mapping_dir).unwrap();
        fs::create_dir_all(&layout.vendor_policy_dir).unwrap();
        fs::write(&layout.plat_cil, "(type plat)").unwrap();
        fs::write(layout.plat_mapping("28.0"), "(type mapping)").unwrap();
        fs::write(&layout.vendor_plat_version, "28.0\n").unwrap();
        for name in vendor_files {
            fs::write(layout.vendor_policy_dir.join(name), "(type vendor)").unwrap();
        }
    }

    #[test]
    fn test_boot_options() {
        let options = CilOptions::boot();
        assert!(options.mls);
        assert!(options.multiple_decls);
        assert!(options.disable_neverallow);
        assert_eq!(options.target_platform, TargetPlatform::Selinux);
        assert_eq!(options.policy_version, 30);
        assert!(!options.attrs_expand_generated);
    }

    #[test]
    fn test_collect_sources_order() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::rooted(dir.path());
        split_policy_tree(&layout, &["nonplat_sepolicy.cil"]);
        fs::write(layout.vendor_policy_dir.join("plat_sepolicy_vers.txt"), "28.0").unwrap();

        let sources = collect_sources(&layout).unwrap();
        let paths: Vec<_> = sources.iter().map(|s| s.path.clone()).collect();
        assert_eq!(
            paths,
            vec![
                layout.plat_cil.clone(),
                layout.plat_mapping("28.0"),
                layout.vendor_policy_dir.join("nonplat_sepolicy.cil"),
            ]
        );
        assert_eq!(sources[1].as_bytes(), b"(type mapping)");
    }

    #[test]
    fn test_missing_version_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::rooted(dir.path());
        split_policy_tree(&layout, &[]);
        fs::remove_file(&layout.vendor_plat_version).unwrap();
        assert!(matches!(
            collect_sources(&layout),
            Err(InitError::Policy(_))
        ));
    }

    #[test]
    fn test_missing_mapping_fails() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::rooted(dir.path());
        split_policy_tree(&layout, &[]);
        fs::write(&layout.vendor_plat_version, "27.0").unwrap();
        assert!(collect_sources(&layout).is_err());
    }
}
