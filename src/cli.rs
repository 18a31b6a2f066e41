use crate::boot;
use crate::config::Layout;
use crate::kernel::LinuxKernel;
use crate::observability::klog;
use crate::payload::{PayloadKind, Payloads};
use crate::policy::default_backend;
use anyhow::Result;
use clap::{Parser, ValueEnum};
use nix::sys::stat::{umask, Mode};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Names under which the binary runs the companion policy tool
pub const POLICY_APPLETS: &[&str] = &["magiskpolicy", "supolicy"];

/// Mode of payloads written through `-x`
const EXTRACT_MODE: u32 = 0o755;

/// How this invocation should behave
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EntryMode {
    /// Running as the policy tool applet
    PolicyApplet,
    /// `-x <payload> <path>`
    Extract,
    /// Running as the device's first process
    Boot,
}

impl EntryMode {
    pub fn detect(args: &[OsString]) -> Self {
        let applet = args
            .first()
            .and_then(|argv0| Path::new(argv0).file_name())
            .and_then(|name| name.to_str())
            .map_or(false, |name| POLICY_APPLETS.contains(&name));
        if applet {
            return Self::PolicyApplet;
        }

        // Anything but `-x <known payload>` is a normal boot
        let flag = args.get(1).and_then(|a| a.to_str());
        let payload = args.get(2).and_then(|a| a.to_str());
        match (flag, payload) {
            (Some("-x"), Some(name)) if PayloadKind::from_str(name, false).is_ok() => Self::Extract,
            _ => Self::Boot,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "preinit", about = "Extract an embedded payload", long_about = None)]
struct ExtractCli {
    /// Payload to extract
    #[arg(short = 'x', value_enum, value_name = "PAYLOAD")]
    extract: PayloadKind,
    /// Destination file
    dest: PathBuf,
}

fn run_extract(args: &[OsString]) -> Result<i32> {
    klog::init_cli_logger();
    let cli = match ExtractCli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(e) => {
            log::error!("{}", e);
            return Ok(1);
        }
    };

    match Payloads::embedded().deploy(cli.extract, &cli.dest, EXTRACT_MODE) {
        Ok(_) => Ok(0),
        Err(e) => {
            log::error!("Cannot extract {:?}: {}", cli.extract, e);
            Ok(1)
        }
    }
}

#[cfg(feature = "libsepol")]
fn run_policy_applet(args: &[OsString]) -> Result<i32> {
    Ok(crate::policy::sepol::run_policy_tool(args)?)
}

#[cfg(not(feature = "libsepol"))]
fn run_policy_applet(args: &[OsString]) -> Result<i32> {
    let name = args
        .first()
        .map(|a| a.to_string_lossy().into_owned())
        .unwrap_or_default();
    eprintln!("{}: policy tool not built in", name);
    Ok(1)
}

fn run_boot(args: Vec<OsString>) -> Result<i32> {
    let kernel = LinuxKernel;
    let layout = Layout::system();
    klog::init_boot_logger(&kernel, &layout.kmsg_node);
    log::info!("preinit {} starting", env!("CARGO_PKG_VERSION"));

    let mut backend = default_backend();
    match boot::run(&kernel, backend.as_mut(), layout, Payloads::embedded(), args) {
        Ok(never) => match never {},
        Err(e) => {
            log::error!("Boot failed: {}", e);
            Err(e.into())
        }
    }
}

/// Entry point shared by every name the binary is installed under.
///
/// Returns the process exit code for the non-boot modes.
pub fn run() -> Result<i32> {
    // Requested file modes must land exactly
    umask(Mode::empty());

    let args: Vec<OsString> = std::env::args_os().collect();
    match EntryMode::detect(&args) {
        EntryMode::PolicyApplet => run_policy_applet(&args),
        EntryMode::Extract => run_extract(&args),
        EntryMode::Boot => run_boot(args),
    }
}
