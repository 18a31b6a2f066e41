//! Payload Deployer
//!
//! The agent binary (xz-compressed) and its rc script are embedded at build
//! time and written out on demand.

use crate::archive::unxz;
use crate::config::types::{InitError, Result};
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::Path;

static EMBEDDED_AGENT: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/agent.xz"));
static EMBEDDED_SCRIPT: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/agent.rc"));

/// Which embedded payload to write
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, clap::ValueEnum)]
pub enum PayloadKind {
    /// The agent binary, decompressed on the way out
    #[value(name = "magisk")]
    Agent,
    /// The agent's init rc script, written verbatim
    #[value(name = "magiskrc")]
    Script,
}

/// Embedded blobs. Tests substitute their own.
#[derive(Clone, Copy, Debug)]
pub struct Payloads<'a> {
    pub agent_xz: &'a [u8],
    pub script: &'a [u8],
}

impl Payloads<'static> {
    pub fn embedded() -> Self {
        Self {
            agent_xz: EMBEDDED_AGENT,
            script: EMBEDDED_SCRIPT,
        }
    }
}

impl<'a> Payloads<'a> {
    pub fn deploy(&self, kind: PayloadKind, dest: &Path, mode: u32) -> Result<u64> {
        let written = match kind {
            PayloadKind::Agent => deploy_agent(self.agent_xz, dest, mode)?,
            PayloadKind::Script => deploy_script(self.script, dest, mode)?,
        };
        log::info!("Deployed {:?} to {} ({} bytes)", kind, dest.display(), written);
        Ok(written)
    }
}

/// Unlink anything at `dest`, then create it fresh with `mode`
fn create_fresh(dest: &Path, mode: u32) -> Result<fs::File> {
    match fs::remove_file(dest) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(InitError::io_at(dest, e)),
    }

    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(mode)
        .custom_flags(libc::O_CLOEXEC)
        .open(dest)
        .map_err(|e| InitError::io_at(dest, e))?;
    // the process umask may have masked bits off
    file.set_permissions(fs::Permissions::from_mode(mode))
        .map_err(|e| InitError::io_at(dest, e))?;
    Ok(file)
}

fn deploy_agent(compressed: &[u8], dest: &Path, mode: u32) -> Result<u64> {
    let file = create_fresh(dest, mode)?;
    let mut out = BufWriter::new(file);
    let written = unxz(compressed, &mut out)
        .map_err(|e| InitError::Payload(format!("{}: {}", dest.display(), e)))?;
    out.flush().map_err(|e| InitError::io_at(dest, e))?;
    Ok(written)
}

fn deploy_script(script: &[u8], dest: &Path, mode: u32) -> Result<u64> {
    let mut file = create_fresh(dest, mode)?;
    file.write_all(script)
        .map_err(|e| InitError::io_at(dest, e))?;
    Ok(script.len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use xz2::read::XzEncoder;

    fn compress(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        XzEncoder::new(data, 6).read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn test_agent_decompressed_with_mode() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("magisk");
        let body = b"\x7fELF agent body";
        let agent = compress(body);
        let payloads = Payloads {
            agent_xz: &agent,
            script: b"",
        };

        let n = payloads.deploy(PayloadKind::Agent, &dest, 0o755).unwrap();
        assert_eq!(n, body.len() as u64);
        assert_eq!(fs::read(&dest).unwrap(), body);
        assert_eq!(fs::metadata(&dest).unwrap().permissions().mode() & 0o777, 0o755);
    }

    #[test]
    fn test_script_written_verbatim_over_existing() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("init.magisk.rc");
        fs::write(&dest, "old contents that are longer").unwrap();
        let payloads = Payloads {
            agent_xz: b"",
            script: b"on post-fs-data\n",
        };

        payloads.deploy(PayloadKind::Script, &dest, 0o750).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"on post-fs-data\n");
        assert_eq!(fs::metadata(&dest).unwrap().permissions().mode() & 0o777, 0o750);
    }

    #[test]
    fn test_corrupt_agent_is_payload_error() {
        let dir = tempfile::tempdir().unwrap();
        let payloads = Payloads {
            agent_xz: b"not xz at all",
            script: b"",
        };
        let err = payloads
            .deploy(PayloadKind::Agent, &dir.path().join("magisk"), 0o755)
            .unwrap_err();
        assert!(matches!(err, InitError::Payload(_)));
    }

    #[test]
    fn test_missing_parent_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let payloads = Payloads {
            agent_xz: b"",
            script: b"x",
        };
        assert!(payloads
            .deploy(PayloadKind::Script, &dir.path().join("no/such/dir/rc"), 0o750)
            .is_err());
    }

    #[test]
    fn test_embedded_script_present() {
        assert!(!Payloads::embedded().script.is_empty());
    }
}
