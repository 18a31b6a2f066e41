//! Configuration: boot paths, command line flags and shared types

pub mod cmdline;
pub mod layout;
pub mod types;

pub use layout::Layout;
pub use types::*;
