//! In-place binary signature patching.
//!
//! Binaries are patched without symbol information: a known byte pattern is
//! located by exact match and overwritten inside a shared mapping, so the file
//! size never changes.

pub mod initrc;

use crate::config::types::{InitError, Result};
use crate::fs::MappedFileMut;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::path::Path;

/// Rendezvous name compiled into the agent binary (the trailing NUL is part of the match)
pub const RENDEZVOUS_NAME: &[u8] = b"d30138f2310a9fb9c54a3e0c21f58591\0";

/// Filler written over the extension of the platform CIL path inside init
const CIL_FILLER: &[u8] = b"xxx";

/// A byte pattern and what to write over its first occurrence
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PatchSignature {
    pub pattern: Vec<u8>,
    pub replacement: Vec<u8>,
}

impl PatchSignature {
    pub fn new(pattern: &[u8], replacement: &[u8]) -> Result<Self> {
        if pattern.is_empty() {
            return Err(InitError::Patch("empty signature".to_string()));
        }
        if replacement.len() > pattern.len() {
            return Err(InitError::Patch(format!(
                "replacement ({} bytes) longer than signature ({} bytes)",
                replacement.len(),
                pattern.len()
            )));
        }
        Ok(Self {
            pattern: pattern.to_vec(),
            replacement: replacement.to_vec(),
        })
    }

    /// Neutralize the platform CIL path: same length, `.cil` becomes `.xxx`
    pub fn plat_cil(path: &[u8]) -> Result<Self> {
        if path.len() < CIL_FILLER.len() {
            return Err(InitError::Patch("CIL path shorter than filler".to_string()));
        }
        let mut replacement = path.to_vec();
        let start = replacement.len() - CIL_FILLER.len();
        replacement[start..].copy_from_slice(CIL_FILLER);
        Self::new(path, &replacement)
    }

    /// Fresh random alphanumeric name of the same length, NUL kept in place
    pub fn rendezvous() -> Result<Self> {
        let name_len = RENDEZVOUS_NAME.len() - 1;
        let mut replacement: Vec<u8> = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(name_len)
            .collect();
        replacement.push(0);
        Self::new(RENDEZVOUS_NAME, &replacement)
    }
}

/// First exact occurrence of `pattern` in `haystack`
pub fn find(haystack: &[u8], pattern: &[u8]) -> Option<usize> {
    if pattern.is_empty() || pattern.len() > haystack.len() {
        return None;
    }
    haystack
        .windows(pattern.len())
        .position(|window| window == pattern)
}

/// Locates and overwrites one signature, remembering where it was found
#[derive(Debug, Default)]
pub struct SignaturePatcher {
    cached_offset: Option<usize>,
}

impl SignaturePatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cached_offset(&self) -> Option<usize> {
        self.cached_offset
    }

    /// Patch a buffer in place. Returns the offset written, or `None` if the
    /// signature is absent (buffer untouched).
    pub fn patch_bytes(&mut self, buf: &mut [u8], signature: &PatchSignature) -> Option<usize> {
        let len = signature.pattern.len();
        let cached_hit = self
            .cached_offset
            .filter(|&off| buf.get(off..off + len) == Some(signature.pattern.as_slice()));

        let offset = match cached_hit {
            Some(off) => off,
            None => {
                let off = find(buf, &signature.pattern)?;
                self.cached_offset = Some(off);
                off
            }
        };

        buf[offset..offset + signature.replacement.len()].copy_from_slice(&signature.replacement);
        Some(offset)
    }

    /// Map `path` read-write and patch it. Absence of the signature is not an error.
    pub fn patch_file(&mut self, path: &Path, signature: &PatchSignature) -> Result<Option<usize>> {
        let mut map = MappedFileMut::open(path)?;
        let result = self.patch_bytes(map.as_mut_bytes(), signature);
        match result {
            Some(offset) => {
                map.flush()?;
                log::info!("Patched {} at offset {:#x}", path.display(), offset);
            }
            None => log::info!(
                "Signature not present in {}, leaving it untouched",
                path.display()
            ),
        }
        Ok(result)
    }
}
