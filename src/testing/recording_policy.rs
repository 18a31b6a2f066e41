/// Recording policy backend
///
/// Accepts every operation and remembers it. `write` produces a small
/// placeholder file so callers that link or inspect the output still work.
use crate::config::types::{InitError, Result};
use crate::policy::{CilOptions, CilSource, PolicyBackend, PolicyStatement};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyCall {
    Load(PathBuf),
    Compile {
        options: CilOptions,
        sources: Vec<PathBuf>,
    },
    Apply(PolicyStatement),
    Write(PathBuf),
}

/// Placeholder written by [`RecordingPolicy::write`]
pub const RECORDED_POLICY: &[u8] = b"recorded policy\n";

#[derive(Debug, Default)]
pub struct RecordingPolicy {
    calls: Vec<PolicyCall>,
    loaded: bool,
}

impl RecordingPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> &[PolicyCall] {
        &self.calls
    }

    pub fn applied(&self) -> Vec<PolicyStatement> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                PolicyCall::Apply(s) => Some(*s),
                _ => None,
            })
            .collect()
    }
}

impl PolicyBackend for RecordingPolicy {
    fn name(&self) -> &str {
        "recording"
    }

    fn load(&mut self, path: &Path) -> Result<()> {
        fs::metadata(path).map_err(|e| InitError::io_at(path, e))?;
        self.calls.push(PolicyCall::Load(path.to_path_buf()));
        self.loaded = true;
        Ok(())
    }

    fn compile(&mut self, options: &CilOptions, sources: &[CilSource]) -> Result<()> {
        self.calls.push(PolicyCall::Compile {
            options: options.clone(),
            sources: sources.iter().map(|s| s.path.clone()).collect(),
        });
        self.loaded = true;
        Ok(())
    }

    fn apply(&mut self, statement: &PolicyStatement) -> Result<()> {
        if !self.loaded {
            return Err(InitError::Policy("no policy loaded".to_string()));
        }
        self.calls.push(PolicyCall::Apply(*statement));
        Ok(())
    }

    fn write(&mut self, path: &Path) -> Result<()> {
        if !self.loaded {
            return Err(InitError::Policy("no policy loaded".to_string()));
        }
        fs::write(path, RECORDED_POLICY).map_err(|e| InitError::io_at(path, e))?;
        self.calls.push(PolicyCall::Write(path.to_path_buf()));
        Ok(())
    }
}
