//! Testing infrastructure
//!
//! Stand-ins for the privileged seams so the boot pipeline can be replayed
//! unprivileged inside a scratch directory.

pub mod recording_kernel;
pub mod recording_policy;

pub use recording_kernel::*;
pub use recording_policy::*;
