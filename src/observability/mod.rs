//! Observability
//!
//! Kernel log routing and structured boot events.

pub mod events;
pub mod klog;

pub use events::{BootEvent, BootReport, BootStage, EventOutcome};
