//! Security Policy Engine
//!
//! Acquires the active policy from the best available source, applies the
//! agent rules, and writes the result back as the monolithic policy the real
//! init will load.
//!
//! # Source priority
//!
//! 1. Monolithic policy file
//! 2. Precompiled split policy, only when its digest sidecars agree
//! 3. CIL compilation of platform, mapping and vendor sources
//!
//! Failures here cost the agent its policy, not the boot. The caller decides
//! what to do with an `Err`.

pub mod backend;
pub mod cil;
pub mod rules;
#[cfg(feature = "libsepol")]
pub mod sepol;
pub mod source;

pub use backend::{default_backend, PolicyBackend, UnlinkedBackend};
pub use cil::{CilOptions, CilSource};
pub use rules::{PolicyStatement, AGENT_RULES};

use crate::config::layout::Layout;
use crate::config::types::{InitError, PolicySource, Result};
use serde::Serialize;
use std::fs;

/// Summary of one engine run
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PolicyOutcome {
    pub source: PolicySource,
    pub rules_applied: usize,
    pub rules_rejected: usize,
    pub debug_relinked: bool,
}

pub struct PolicyEngine<'a, B: PolicyBackend + ?Sized> {
    backend: &'a mut B,
    layout: &'a Layout,
}

impl<'a, B: PolicyBackend + ?Sized> PolicyEngine<'a, B> {
    pub fn new(backend: &'a mut B, layout: &'a Layout) -> Self {
        Self { backend, layout }
    }

    fn acquire(&mut self, source: PolicySource) -> Result<()> {
        match source {
            PolicySource::Monolithic => self.backend.load(&self.layout.monolithic_policy),
            PolicySource::PrecompiledSplit => self.backend.load(&self.layout.precompiled_policy),
            PolicySource::CilCompiled => {
                let sources = cil::collect_sources(self.layout)?;
                self.backend.compile(&CilOptions::boot(), &sources)
            }
        }
    }

    /// Individual rule failures are tolerated; a type missing from one
    /// vendor's policy must not block the rest.
    fn augment(&mut self) -> (usize, usize) {
        let mut applied = 0;
        let mut rejected = 0;
        for statement in AGENT_RULES {
            match self.backend.apply(statement) {
                Ok(()) => applied += 1,
                Err(e) => {
                    log::warn!("Rule {:?} rejected: {}", statement, e);
                    rejected += 1;
                }
            }
        }
        (applied, rejected)
    }

    /// Replace the debug policy with a hard link to the patched policy
    fn relink_debug_policy(&self) -> Result<bool> {
        let debug = &self.layout.debug_policy;
        if fs::symlink_metadata(debug).is_err() {
            return Ok(false);
        }
        fs::remove_file(debug).map_err(|e| InitError::io_at(debug, e))?;
        fs::hard_link(&self.layout.monolithic_policy, debug)
            .map_err(|e| InitError::io_at(debug, e))?;
        Ok(true)
    }

    pub fn run(&mut self) -> Result<PolicyOutcome> {
        let source = source::select(self.layout);
        log::info!("Policy source: {:?} (backend {})", source, self.backend.name());

        self.acquire(source)?;
        let (rules_applied, rules_rejected) = self.augment();
        if rules_applied == 0 && rules_rejected > 0 {
            return Err(InitError::Policy("no agent rule could be applied".to_string()));
        }

        self.backend.write(&self.layout.monolithic_policy)?;
        let debug_relinked = self.relink_debug_policy()?;

        Ok(PolicyOutcome {
            source,
            rules_applied,
            rules_rejected,
            debug_relinked,
        })
    }
}
