//! preinit: the first process on an Android boot image
//!
//! Runs in place of the device's init, rebuilds the root filesystem the real
//! init expects, patches in the agent's security policy and services, then
//! execs the real init with the original arguments.
//!
//! # Architecture
//!
//! ## Kernel Primitives ([`kernel`])
//! - [`kernel::KernelOps`]: the seam for mounts, device nodes, stdio and exec
//! - [`kernel::block`]: partition lookup through sysfs uevent records
//! - [`kernel::stdio`]: stdio redirection to a discarded device
//!
//! ## Boot Pipeline ([`boot`])
//! - [`boot::stages`]: type-state enforced boot ordering
//! - [`boot::rootfs`]: rootfs reconstruction strategies
//! - [`boot::early_mount`]: system/vendor early mounts
//!
//! ## Security Policy ([`policy`])
//! - [`policy::source`]: source priority and digest sidecars
//! - [`policy::cil`]: CIL compiler inputs and options
//! - [`policy::rules`]: agent rules as data
//! - [`policy::backend`]: the policy library seam
//!
//! ## Rootfs Content
//! - [`patch`]: in-place binary signature patching, init.rc rewriting
//! - [`payload`]: embedded agent binary and service script
//! - [`archive`]: newc cpio and xz decoding
//! - [`fs`]: descriptor-based tree operations and file mappings
//!
//! ## Observability ([`observability`])
//! - [`observability::klog`]: kernel log sink
//! - [`observability::events`]: structured boot events and report
//!
//! ## Configuration ([`config`])
//! - [`config::layout`]: every path the pipeline touches
//! - [`config::cmdline`]: kernel command line flags
//! - [`config::types`]: shared types and the error enum
//!
//! ## Testing Infrastructure ([`testing`])
//! - [`testing::RecordingKernel`], [`testing::RecordingPolicy`]
//!
//! # Failure classes
//!
//! 1. **Fatal** - the boot stops before handoff (`Err` from a stage)
//! 2. **Feature loss** - logged and reported, boot continues
//! 3. **Soft absence** - an optional input is missing, nothing to do

// Kernel Primitives
pub mod kernel;

// Boot Pipeline
pub mod boot;

// Security Policy
pub mod policy;

// Rootfs Content
pub mod archive;
pub mod fs;
pub mod patch;
pub mod payload;

// Observability
pub mod observability;

// Configuration
pub mod config;

// Testing Infrastructure
pub mod testing;

// Entry dispatch for the preinit binary
pub mod cli;

pub use config::types::*;
