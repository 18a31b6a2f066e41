//! Ramdisk archive handling: xz decompression and newc cpio extraction

pub mod cpio;
pub mod xz;

pub use cpio::{extract_all, parse, CpioEntry};
pub use xz::unxz;
