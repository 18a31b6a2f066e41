//! Filesystem tree operations and mapped-file helpers
//!
//! Tree walks work on directory descriptors (openat/fstatat/unlinkat) and never
//! follow symlinks. Exclusion lists are passed per call.

pub mod mmap;
pub mod tree;

pub use mmap::{MappedFile, MappedFileMut};
pub use tree::{clone_contents, move_contents, remove_contents_except, remove_path, DirHandle};
