/// Service script rewriting for the real init
use crate::config::types::{InitError, Result};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::Path;

/// Import line that pulls the agent's services into the boot graph
pub const AGENT_IMPORT: &str = "import /init.magisk.rc";

/// Property whose trigger would make init reload an unpatched policy
const RELOAD_POLICY_MARKER: &str = "selinux.reload_policy";

/// Rewrite init.rc text. Idempotent.
pub fn rewrite(text: &str) -> String {
    let already_imported = text.lines().any(|l| l.trim() == AGENT_IMPORT);
    let mut injected = already_imported;
    let mut out = String::with_capacity(text.len() + AGENT_IMPORT.len() + 1);

    for line in text.lines() {
        if line.contains(RELOAD_POLICY_MARKER) {
            continue;
        }
        if !injected && line.trim_start().starts_with("import") {
            out.push_str(AGENT_IMPORT);
            out.push('\n');
            injected = true;
        }
        out.push_str(line);
        out.push('\n');
    }

    if !injected {
        out.insert_str(0, &format!("{}\n", AGENT_IMPORT));
    }
    out
}

/// Patch the init.rc at `path` in place. A missing file is not an error.
pub fn patch_file(path: &Path) -> Result<bool> {
    let text = match fs::read(path) {
        Ok(raw) => String::from_utf8_lossy(&raw).into_owned(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            log::info!("{} not present, skipping", path.display());
            return Ok(false);
        }
        Err(e) => return Err(InitError::io_at(path, e)),
    };

    let patched = rewrite(&text);
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o750)
        .custom_flags(libc::O_CLOEXEC)
        .open(path)
        .map_err(|e| InitError::io_at(path, e))?;
    file.write_all(patched.as_bytes())
        .map_err(|e| InitError::io_at(path, e))?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o750))
        .map_err(|e| InitError::io_at(path, e))?;

    log::info!("Patched {}", path.display());
    Ok(true)
}
