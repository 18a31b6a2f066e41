//! Policy backend seam.
//!
//! The binary policy format and the CIL compiler live in the platform's
//! policy library. Everything above this trait is plain Rust; everything
//! below it is FFI or a recorder.

use crate::config::types::{InitError, Result};
use crate::policy::cil::{CilOptions, CilSource};
use crate::policy::rules::PolicyStatement;
use std::path::Path;

/// Operations the policy engine needs from a policy library.
///
/// A backend holds at most one policy in memory. `load` and `compile`
/// replace it; `apply` and `write` operate on it.
pub trait PolicyBackend {
    fn name(&self) -> &str;

    /// Load a binary policy file
    fn load(&mut self, path: &Path) -> Result<()>;

    /// Compile CIL sources into a binary policy
    fn compile(&mut self, options: &CilOptions, sources: &[CilSource]) -> Result<()>;

    fn apply(&mut self, statement: &PolicyStatement) -> Result<()>;

    /// Serialize the current policy to `path`
    fn write(&mut self, path: &Path) -> Result<()>;
}

/// Backend used when no policy library was linked in.
///
/// Every operation fails, which the boot pipeline treats as a lost feature
/// rather than a failed boot.
#[derive(Clone, Copy, Debug, Default)]
pub struct UnlinkedBackend;

impl UnlinkedBackend {
    fn unavailable(&self, op: &str) -> InitError {
        InitError::Policy(format!("{}: no policy library linked ({})", op, self.name()))
    }
}

impl PolicyBackend for UnlinkedBackend {
    fn name(&self) -> &str {
        "unlinked"
    }

    fn load(&mut self, _path: &Path) -> Result<()> {
        Err(self.unavailable("load"))
    }

    fn compile(&mut self, _options: &CilOptions, _sources: &[CilSource]) -> Result<()> {
        Err(self.unavailable("compile"))
    }

    fn apply(&mut self, _statement: &PolicyStatement) -> Result<()> {
        Err(self.unavailable("apply"))
    }

    fn write(&mut self, _path: &Path) -> Result<()> {
        Err(self.unavailable("write"))
    }
}

/// The backend this binary was built with
pub fn default_backend() -> Box<dyn PolicyBackend> {
    #[cfg(feature = "libsepol")]
    {
        Box::new(crate::policy::sepol::SepolBackend::new())
    }
    #[cfg(not(feature = "libsepol"))]
    {
        Box::new(UnlinkedBackend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlinked_backend_fails_every_operation() {
        let mut backend = UnlinkedBackend;
        assert!(matches!(
            backend.load(Path::new("/sepolicy")),
            Err(InitError::Policy(_))
        ));
        assert!(backend.compile(&CilOptions::boot(), &[]).is_err());
        assert!(backend
            .apply(&PolicyStatement::Permissive("magisk"))
            .is_err());
        assert!(backend.write(Path::new("/sepolicy")).is_err());
    }
}
