//! Boot pipeline: rootfs reconstruction, early mounts and the staged orchestrator

pub mod early_mount;
pub mod rootfs;
pub mod stages;

pub use early_mount::{EarlyMounter, EarlyMounts};
pub use rootfs::{select_strategy, RootfsReconstructor};
pub use stages::{run, Boot};
