//! End-to-end boot pipeline tests
//!
//! The whole boot sequence is replayed inside a scratch root with the
//! recording kernel and policy backend standing in for privileged calls.

use nix::mount::MsFlags;
use preinit::boot;
use preinit::boot::stages::POLICY_LOST;
use preinit::config::Layout;
use preinit::observability::{BootStage, EventOutcome};
use preinit::patch::RENDEZVOUS_NAME;
use preinit::payload::Payloads;
use preinit::testing::{PolicyCall, RecordingKernel, RecordingPolicy};
use preinit::{BootstrapStrategy, InitError};
use std::ffi::OsString;
use std::fs;
use std::io::Read;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tempfile::TempDir;
use xz2::read::XzEncoder;

const PREINIT_BODY: &[u8] = b"\x7fELF preinit";
const REAL_INIT_BODY: &[u8] = b"\x7fELF init ... /system/etc/selinux/plat_sepolicy.cil\0 ...";
const AGENT_SCRIPT: &[u8] = b"service magisk_daemon /sbin/magisk --daemon\n";

fn agent_xz() -> Vec<u8> {
    let mut agent = b"\x7fELF agent ".to_vec();
    agent.extend_from_slice(RENDEZVOUS_NAME);
    agent.extend_from_slice(b" tail");
    let mut out = Vec::new();
    XzEncoder::new(agent.as_slice(), 6)
        .read_to_end(&mut out)
        .unwrap();
    out
}

fn write(path: &Path, body: &[u8]) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, body).unwrap();
}

fn args() -> Vec<OsString> {
    vec![OsString::from("/init"), OsString::from("second_stage")]
}

/// Scratch device: a root plus out-of-tree snapshots for sysfs and partitions
struct Device {
    _dir: TempDir,
    layout: Layout,
    sysfs: std::path::PathBuf,
    system: std::path::PathBuf,
}

impl Device {
    fn new(cmdline: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        let sysfs = dir.path().join("sysfs");
        let system = dir.path().join("system_image");
        fs::create_dir_all(&root).unwrap();
        fs::create_dir_all(&sysfs).unwrap();
        fs::create_dir_all(&system).unwrap();

        let layout = Layout::rooted(&root);
        write(&layout.init, PREINIT_BODY);
        write(&layout.proc_cmdline, cmdline.as_bytes());

        Self {
            _dir: dir,
            layout,
            sysfs,
            system,
        }
    }

    fn partition(&self, entry: &str, devname: &str, partname: &str) {
        write(
            &self.sysfs.join("dev/block").join(entry).join("uevent"),
            format!("MAJOR=259\nMINOR=1\nDEVNAME={}\nPARTNAME={}\n", devname, partname).as_bytes(),
        );
    }

    /// Lay out a system-as-root image with split CIL policy
    fn system_as_root_image(&self) {
        let at = |rel: &str| self.system.join(rel);
        write(&at("init"), REAL_INIT_BODY);
        write(&at("init.rc"), b"import /init.environ.rc\non early-init\n");
        write(&at("system/etc/selinux/plat_sepolicy.cil"), b"(plat)");
        write(&at("system/etc/selinux/mapping/28.0.cil"), b"(mapping)");
        write(&at("system/build.prop"), b"ro.build.type=user\n");
        write(&at("vendor/etc/selinux/plat_sepolicy_vers.txt"), b"28.0\n");
        write(&at("vendor/etc/selinux/vendor_sepolicy.cil"), b"(vendor)");
    }

    fn kernel(&self, devname: &str) -> RecordingKernel {
        let device = self.layout.dev_block_dir.join(devname);
        RecordingKernel::new()
            .with_mount_source("sysfs", &self.sysfs)
            .with_mount_source(device.to_string_lossy(), &self.system)
    }
}

#[test]
fn test_system_as_root_boot() {
    let device = Device::new("console=ttyMSM0 skip_initramfs androidboot.slot=a");
    device.partition("259:1", "sda1", "SYSTEM_a");
    device.partition("259:2", "sda2", "SYSTEM_b");
    device.system_as_root_image();
    write(&device.layout.overlay.join("sbin/helper"), b"helper");

    let layout = device.layout.clone();
    let kernel = device.kernel("sda1");
    let mut policy = RecordingPolicy::new();
    let xz = agent_xz();
    let payloads = Payloads {
        agent_xz: &xz,
        script: AGENT_SCRIPT,
    };

    let err = boot::run(&kernel, &mut policy, layout.clone(), payloads, args()).unwrap_err();
    assert!(matches!(err, InitError::Handoff(_)));

    // handoff with the original arguments
    let execs = kernel.execs();
    assert_eq!(execs.len(), 1);
    assert_eq!(execs[0].path, layout.init);
    assert_eq!(execs[0].args, args());
    assert_eq!(kernel.stdio_redirects(), vec![layout.null_node.clone()]);

    // only the system partition was mounted, and it stays mounted
    let mounts = kernel.mounts();
    let targets: Vec<_> = mounts.iter().map(|m| m.target.clone()).collect();
    assert!(targets.contains(&layout.sys_dir));
    assert!(targets.contains(&layout.system_root));
    assert!(!targets.contains(&layout.vendor));
    let bind = mounts.iter().find(|m| m.target == layout.system).unwrap();
    assert_eq!(bind.flags, MsFlags::MS_BIND);
    assert_eq!(kernel.unmounts().last(), Some(&layout.vendor));
    assert!(!kernel.unmounts().contains(&layout.system));

    // rootfs rebuilt from the system partition, its system subtree bound at /system
    assert!(layout.root.join("init.rc").exists());
    assert!(layout.system.join("build.prop").exists());

    // the real init no longer points at the CIL
    let init = fs::read(&layout.init).unwrap();
    assert_eq!(init.len(), REAL_INIT_BODY.len());
    assert!(init
        .windows(b"plat_sepolicy.xxx".len())
        .any(|w| w == b"plat_sepolicy.xxx"));

    let init_rc = fs::read_to_string(&layout.init_rc).unwrap();
    assert!(init_rc.starts_with("import /init.magisk.rc\nimport /init.environ.rc\n"));

    // policy compiled from CIL and written back
    match &policy.calls()[0] {
        PolicyCall::Compile { sources, .. } => assert_eq!(
            sources,
            &vec![
                layout.plat_cil.clone(),
                layout.plat_mapping("28.0"),
                layout.vendor_policy_dir.join("vendor_sepolicy.cil"),
            ]
        ),
        other => panic!("expected compile first, got {:?}", other),
    }
    assert!(layout.monolithic_policy.exists());

    // payloads deployed with their modes, rendezvous name randomized
    assert_eq!(fs::read(&layout.agent_script).unwrap(), AGENT_SCRIPT);
    let mode = |p: &Path| fs::metadata(p).unwrap().permissions().mode() & 0o777;
    assert_eq!(mode(&layout.agent_script), 0o750);
    assert_eq!(mode(&layout.agent_binary), 0o755);
    let agent = fs::read(&layout.agent_binary).unwrap();
    assert!(!agent
        .windows(RENDEZVOUS_NAME.len())
        .any(|w| w == RENDEZVOUS_NAME));
    let name_at = b"\x7fELF agent ".len();
    let name = &agent[name_at..name_at + RENDEZVOUS_NAME.len()];
    assert!(name[..32].iter().all(u8::is_ascii_alphanumeric));
    assert_eq!(name[32], 0);

    // overlay merged and removed, preinit relocated
    assert_eq!(fs::read(layout.root.join("sbin/helper")).unwrap(), b"helper");
    assert!(!layout.overlay.exists());
    assert_eq!(fs::read(&layout.init_service).unwrap(), PREINIT_BODY);
    assert!(!layout.init_backup.exists());
}

#[test]
fn test_legacy_boot_with_monolithic_policy() {
    let device = Device::new("console=ttyMSM0");
    let layout = device.layout.clone();
    write(&layout.pristine_init, REAL_INIT_BODY);
    write(&layout.monolithic_policy, b"monolithic");
    write(&layout.init_rc, b"on early-init\n    setprop selinux.reload_policy 1\n");

    let kernel = device.kernel("sda1");
    let mut policy = RecordingPolicy::new();
    let xz = agent_xz();
    let payloads = Payloads {
        agent_xz: &xz,
        script: AGENT_SCRIPT,
    };

    let err = boot::run(&kernel, &mut policy, layout.clone(), payloads, args()).unwrap_err();
    assert!(matches!(err, InitError::Handoff(_)));

    assert_eq!(fs::read(&layout.init).unwrap().len(), REAL_INIT_BODY.len());
    assert!(layout.pristine_init.exists());

    // nothing but procfs was mounted and compilation never ran
    assert!(kernel.mounts().iter().all(|m| m.target == layout.proc_dir));
    assert_eq!(policy.calls()[0], PolicyCall::Load(layout.monolithic_policy.clone()));
    assert!(!policy
        .calls()
        .iter()
        .any(|c| matches!(c, PolicyCall::Compile { .. })));

    let init_rc = fs::read_to_string(&layout.init_rc).unwrap();
    assert!(!init_rc.contains("selinux.reload_policy"));
    assert!(init_rc.starts_with("import /init.magisk.rc\n"));
}

#[test]
fn test_recovery_boot_skips_patching() {
    let device = Device::new("");
    let layout = device.layout.clone();
    write(&layout.recovery_marker, b"/dev/block/by-name/system /system ext4 ro 0 0\n");
    write(&layout.monolithic_policy, b"monolithic");
    write(&layout.overlay.join("sbin/helper"), b"helper");

    let kernel = device.kernel("sda1");
    let mut policy = RecordingPolicy::new();
    let err = boot::run(
        &kernel,
        &mut policy,
        layout.clone(),
        Payloads {
            agent_xz: b"",
            script: AGENT_SCRIPT,
        },
        args(),
    )
    .unwrap_err();
    assert!(matches!(err, InitError::Handoff(_)));

    assert!(policy.calls().is_empty());
    assert!(layout.overlay.join("sbin/helper").exists());
    assert!(!layout.agent_binary.exists());
    assert!(!layout.agent_script.exists());
    assert_eq!(kernel.execs().len(), 1);
}

#[test]
fn test_missing_system_partition_is_fatal() {
    let device = Device::new("skip_initramfs");
    device.partition("259:1", "sda1", "VENDOR");

    let kernel = device.kernel("sda1");
    let mut policy = RecordingPolicy::new();
    let err = boot::run(
        &kernel,
        &mut policy,
        device.layout.clone(),
        Payloads {
            agent_xz: b"",
            script: b"",
        },
        args(),
    )
    .unwrap_err();

    assert!(matches!(err, InitError::Block(_)));
    assert!(kernel.execs().is_empty());
}

#[test]
fn test_policy_failure_does_not_stop_boot() {
    let device = Device::new("");
    let layout = device.layout.clone();
    write(&layout.pristine_init, REAL_INIT_BODY);
    write(&layout.monolithic_policy, b"monolithic");

    let kernel = device.kernel("sda1");
    let mut policy = preinit::policy::UnlinkedBackend;
    let xz = agent_xz();
    let stage = boot::Boot::new(
        &kernel,
        &mut policy,
        layout.clone(),
        Payloads {
            agent_xz: &xz,
            script: AGENT_SCRIPT,
        },
        args(),
    )
    .prepare()
    .unwrap()
    .reconstruct_rootfs()
    .unwrap()
    .early_mount()
    .unwrap()
    .patch_rootfs()
    .unwrap();

    let report = stage.report();
    assert_eq!(report.strategy, Some(BootstrapStrategy::LegacyRevert));
    assert!(report.policy_error.is_some());
    assert!(report.policy_source.is_none());

    // init was already pointed away from its CIL, so the loss is spelled out
    assert_eq!(report.outcome_of(BootStage::InitPatch), Some(EventOutcome::Ok));
    let policy_event = report
        .events
        .iter()
        .find(|e| e.stage == BootStage::Policy)
        .unwrap();
    assert_eq!(policy_event.outcome, EventOutcome::Failed);
    assert!(policy_event.detail.ends_with(POLICY_LOST));
    assert_eq!(report.deployed.len(), 2);
    assert!(layout.agent_binary.exists());

    let err = stage.release().handoff().unwrap_err();
    assert!(matches!(err, InitError::Handoff(_)));
}
