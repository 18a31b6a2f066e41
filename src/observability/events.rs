/// Structured boot events
///
/// Every stage transition produces one JSON line under the `preinit::event`
/// target so a kernel log capture can be parsed after the fact. The final
/// [`BootReport`] summarizes the whole run right before handoff.
use crate::config::types::{BootConfig, BootstrapStrategy, PolicySource};
use log::{error, info, warn};
use serde::Serialize;
use std::time::Instant;

pub const EVENT_TARGET: &str = "preinit::event";

/// Boot stages in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BootStage {
    Stdio,
    Backup,
    Cmdline,
    Rootfs,
    EarlyMount,
    Overlay,
    InitPatch,
    ServicePatch,
    Policy,
    Payload,
    Rendezvous,
    ServiceRelocate,
    Cleanup,
    Handoff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventOutcome {
    Ok,
    /// Stage intentionally not run for this boot
    Skipped,
    /// Stage failed but boot continues
    Degraded,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct BootEvent {
    pub stage: BootStage,
    pub outcome: EventOutcome,
    pub detail: String,
    /// Milliseconds since the pipeline started
    pub elapsed_ms: u64,
}

/// Log one event as a single JSON line
pub fn emit(event: &BootEvent) {
    let line = match serde_json::to_string(event) {
        Ok(line) => line,
        Err(e) => {
            warn!("Failed to serialize boot event: {}", e);
            return;
        }
    };
    match event.outcome {
        EventOutcome::Failed => error!(target: EVENT_TARGET, "{}", line),
        EventOutcome::Degraded => warn!(target: EVENT_TARGET, "{}", line),
        EventOutcome::Ok | EventOutcome::Skipped => info!(target: EVENT_TARGET, "{}", line),
    }
}

/// Everything worth knowing about one boot, accumulated stage by stage
#[derive(Debug, Clone, Default, Serialize)]
pub struct BootReport {
    pub config: BootConfig,
    pub strategy: Option<BootstrapStrategy>,
    pub policy_source: Option<PolicySource>,
    pub policy_error: Option<String>,
    pub recovery: bool,
    pub mounted: Vec<String>,
    pub patched: Vec<String>,
    pub deployed: Vec<String>,
    pub events: Vec<BootEvent>,
    #[serde(skip)]
    started: Option<Instant>,
}

impl BootReport {
    pub fn new() -> Self {
        Self {
            started: Some(Instant::now()),
            ..Self::default()
        }
    }

    fn elapsed_ms(&self) -> u64 {
        self.started
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0)
    }

    /// Emit an event and keep it in the report
    pub fn record(&mut self, stage: BootStage, outcome: EventOutcome, detail: impl Into<String>) {
        let event = BootEvent {
            stage,
            outcome,
            detail: detail.into(),
            elapsed_ms: self.elapsed_ms(),
        };
        emit(&event);
        self.events.push(event);
    }

    pub fn outcome_of(&self, stage: BootStage) -> Option<EventOutcome> {
        self.events
            .iter()
            .rev()
            .find(|e| e.stage == stage)
            .map(|e| e.outcome)
    }

    /// Log the whole report as one JSON line
    pub fn emit(&self) {
        match serde_json::to_string(self) {
            Ok(line) => info!(target: EVENT_TARGET, "report {}", line),
            Err(e) => warn!("Failed to serialize boot report: {}", e),
        }
    }
}
