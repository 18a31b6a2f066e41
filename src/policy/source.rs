//! Policy source selection
use crate::config::layout::Layout;
use crate::config::types::PolicySource;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

const DIGEST_SUFFIX: &str = ".sha256";

pub(crate) fn is_readable(path: &Path) -> bool {
    fs::File::open(path).is_ok()
}

/// The `*.sha256` sidecar written most recently in `dir`.
///
/// Equal modification times are broken by the lexicographically smallest
/// name so the choice does not depend on directory order.
pub fn newest_sidecar(dir: &Path) -> Option<PathBuf> {
    let entries = fs::read_dir(dir).ok()?;

    let mut best: Option<(SystemTime, PathBuf)> = None;
    for entry in entries.flatten() {
        let path = entry.path();
        let is_sidecar = path
            .file_name()
            .and_then(|n| n.to_str())
            .map_or(false, |n| n.ends_with(DIGEST_SUFFIX) && n.len() > DIGEST_SUFFIX.len());
        if !is_sidecar {
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        if !meta.is_file() {
            continue;
        }
        let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);

        let better = match &best {
            None => true,
            Some((best_time, best_path)) => {
                mtime > *best_time || (mtime == *best_time && path < *best_path)
            }
        };
        if better {
            best = Some((mtime, path));
        }
    }

    best.map(|(_, path)| path)
}

fn read_digest(dir: &Path) -> Option<Vec<u8>> {
    let path = newest_sidecar(dir)?;
    let raw = fs::read(&path).ok()?;
    let digest = raw.trim_ascii_end().to_vec();
    log::debug!("Digest {} = {}", path.display(), String::from_utf8_lossy(&digest));
    Some(digest)
}

/// True when the platform and vendor sidecars exist and hold the same digest
pub fn digests_match(plat_dir: &Path, vendor_dir: &Path) -> bool {
    match (read_digest(plat_dir), read_digest(vendor_dir)) {
        (Some(plat), Some(vendor)) => !plat.is_empty() && plat == vendor,
        _ => false,
    }
}

/// Pick the policy source by strict priority.
///
/// Later candidates are not probed once an earlier one qualifies. CIL
/// compilation is returned as the last resort whether or not its inputs
/// are present; missing inputs surface as a compile failure.
pub fn select(layout: &Layout) -> PolicySource {
    if is_readable(&layout.monolithic_policy) {
        return PolicySource::Monolithic;
    }

    if is_readable(&layout.precompiled_policy) {
        if digests_match(&layout.plat_policy_dir, &layout.vendor_policy_dir) {
            return PolicySource::PrecompiledSplit;
        }
        log::warn!("Precompiled policy digests differ, compiling from CIL");
    }

    PolicySource::CilCompiled
}
