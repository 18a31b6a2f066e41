//! Boot Orchestrator
//!
//! The boot sequence is FIXED:
//! 1. route stdio to a discarded device
//! 2. keep a hard link to ourselves as `/init.bak`
//! 3. read the kernel command line
//! 4. reconstruct rootfs (exactly one strategy)
//! 5. early-mount system/vendor when the policy must be compiled
//! 6. unless booting recovery: merge overlay, patch init and init.rc,
//!    prepare the policy, deploy payloads, randomize the rendezvous name,
//!    relocate ourselves to `/sbin/magiskinit`
//! 7. release early mounts
//! 8. replace the process image with the real init
//!
//! Each step consumes the prior state and returns exactly one next state, so
//! the order cannot drift. Only `Boot<HandoffReady>` can exec.

use crate::boot::early_mount::{EarlyMounter, EarlyMounts};
use crate::boot::rootfs::RootfsReconstructor;
use crate::config::cmdline;
use crate::config::layout::Layout;
use crate::config::types::{BootConfig, InitError, Result};
use crate::fs::{move_contents, DirHandle};
use crate::kernel::KernelOps;
use crate::observability::{BootReport, BootStage, EventOutcome};
use crate::patch::{initrc, PatchSignature, SignaturePatcher};
use crate::payload::{PayloadKind, Payloads};
use crate::policy::{PolicyBackend, PolicyEngine};
use std::convert::Infallible;
use std::ffi::OsString;
use std::fs::{self, DirBuilder};
use std::marker::PhantomData;
use std::os::unix::fs::DirBuilderExt;

/// Mode of the deployed service script
pub const SCRIPT_MODE: u32 = 0o750;
/// Mode of the deployed agent binary
pub const AGENT_MODE: u32 = 0o755;
/// Appended to the policy failure once init's CIL path has been neutralized
pub const POLICY_LOST: &str = "patched init has no policy to load";

/// Type-state marker: nothing done yet
pub struct Fresh;

/// Type-state marker: stdio routed, backup link made, command line read
pub struct Prepared;

/// Type-state marker: rootfs holds the tree the real init expects
pub struct RootfsReady;

/// Type-state marker: partitions needed for policy work are mounted
pub struct Mounted;

/// Type-state marker: rootfs patched and payloads deployed
pub struct Patched;

/// Type-state marker: mounts released, ready to exec
pub struct HandoffReady;

struct BootContext<'a> {
    kernel: &'a dyn KernelOps,
    policy: &'a mut dyn PolicyBackend,
    layout: Layout,
    payloads: Payloads<'a>,
    args: Vec<OsString>,
    config: BootConfig,
    root: Option<DirHandle>,
    mounts: EarlyMounts,
    report: BootReport,
}

/// Boot pipeline in state `S`
pub struct Boot<'a, S> {
    ctx: BootContext<'a>,
    _state: PhantomData<S>,
}

impl<'a, S> Boot<'a, S> {
    fn advance<T>(self) -> Boot<'a, T> {
        Boot {
            ctx: self.ctx,
            _state: PhantomData,
        }
    }

    pub fn config(&self) -> &BootConfig {
        &self.ctx.config
    }

    pub fn report(&self) -> &BootReport {
        &self.ctx.report
    }

    pub fn layout(&self) -> &Layout {
        &self.ctx.layout
    }
}

impl<'a> Boot<'a, Fresh> {
    pub fn new(
        kernel: &'a dyn KernelOps,
        policy: &'a mut dyn PolicyBackend,
        layout: Layout,
        payloads: Payloads<'a>,
        args: Vec<OsString>,
    ) -> Self {
        Self {
            ctx: BootContext {
                kernel,
                policy,
                layout,
                payloads,
                args,
                config: BootConfig::default(),
                root: None,
                mounts: EarlyMounts::default(),
                report: BootReport::new(),
            },
            _state: PhantomData,
        }
    }

    /// Steps 1-3
    pub fn prepare(mut self) -> Result<Boot<'a, Prepared>> {
        let ctx = &mut self.ctx;

        match ctx.kernel.redirect_stdio(&ctx.layout.null_node) {
            Ok(()) => ctx.report.record(BootStage::Stdio, EventOutcome::Ok, ""),
            Err(e) => ctx
                .report
                .record(BootStage::Stdio, EventOutcome::Degraded, e.to_string()),
        }

        match fs::hard_link(&ctx.layout.init, &ctx.layout.init_backup) {
            Ok(()) => ctx.report.record(BootStage::Backup, EventOutcome::Ok, ""),
            Err(e) => ctx.report.record(
                BootStage::Backup,
                EventOutcome::Degraded,
                format!("{}: {}", ctx.layout.init_backup.display(), e),
            ),
        }

        ctx.config = cmdline::load(ctx.kernel, &ctx.layout);
        ctx.report.config = ctx.config.clone();
        ctx.report.record(
            BootStage::Cmdline,
            EventOutcome::Ok,
            format!(
                "skip_initramfs={} slot={:?}",
                ctx.config.skip_initramfs, ctx.config.slot_suffix
            ),
        );

        ctx.root = Some(DirHandle::open(&ctx.layout.root)?);
        Ok(self.advance())
    }
}

impl<'a> Boot<'a, Prepared> {
    /// Step 4
    pub fn reconstruct_rootfs(mut self) -> Result<Boot<'a, RootfsReady>> {
        let ctx = &mut self.ctx;
        let root = ctx
            .root
            .as_ref()
            .ok_or_else(|| InitError::Filesystem("root directory not open".to_string()))?;

        let reconstructor = RootfsReconstructor::new(ctx.kernel, &ctx.layout, &ctx.config);
        match reconstructor.run(root, &mut ctx.mounts) {
            Ok(strategy) => {
                ctx.report.strategy = Some(strategy);
                ctx.report
                    .record(BootStage::Rootfs, EventOutcome::Ok, format!("{:?}", strategy));
            }
            Err(e) => {
                ctx.report
                    .record(BootStage::Rootfs, EventOutcome::Failed, e.to_string());
                return Err(e);
            }
        }

        Ok(self.advance())
    }
}

impl<'a> Boot<'a, RootfsReady> {
    /// Step 5
    pub fn early_mount(mut self) -> Result<Boot<'a, Mounted>> {
        let ctx = &mut self.ctx;

        if ctx.config.skip_initramfs {
            ctx.report.record(
                BootStage::EarlyMount,
                EventOutcome::Skipped,
                "mounted during rebuild",
            );
        } else if crate::policy::source::is_readable(&ctx.layout.monolithic_policy) {
            ctx.report.record(
                BootStage::EarlyMount,
                EventOutcome::Skipped,
                "monolithic policy present",
            );
        } else {
            let mounter = EarlyMounter::new(ctx.kernel, &ctx.layout, &ctx.config);
            if let Err(e) = mounter.mount_system(&mut ctx.mounts) {
                ctx.report
                    .record(BootStage::EarlyMount, EventOutcome::Failed, e.to_string());
                return Err(e);
            }
            ctx.report.record(BootStage::EarlyMount, EventOutcome::Ok, "");
        }

        ctx.report.mounted = ctx.mounts.describe(&ctx.layout);
        Ok(self.advance())
    }
}

impl<'a> Boot<'a, Mounted> {
    /// Step 6. Only payload deployment failures are fatal here.
    pub fn patch_rootfs(mut self) -> Result<Boot<'a, Patched>> {
        if fs::symlink_metadata(&self.ctx.layout.recovery_marker).is_ok() {
            self.ctx.report.recovery = true;
            self.ctx
                .report
                .record(BootStage::Overlay, EventOutcome::Skipped, "recovery mode");
            return Ok(self.advance());
        }

        self.merge_overlay();
        self.patch_init();
        self.patch_service_script();
        self.prepare_policy();
        self.deploy_payloads()?;
        self.randomize_rendezvous();
        self.relocate_self();

        Ok(self.advance())
    }

    fn merge_overlay(&mut self) {
        let ctx = &mut self.ctx;
        let overlay = match DirHandle::open(&ctx.layout.overlay) {
            Ok(dir) => dir,
            Err(e) if e.is_not_found() => {
                ctx.report
                    .record(BootStage::Overlay, EventOutcome::Skipped, "no overlay");
                return;
            }
            Err(e) => {
                ctx.report
                    .record(BootStage::Overlay, EventOutcome::Degraded, e.to_string());
                return;
            }
        };

        let result = match &ctx.root {
            Some(root) => move_contents(&overlay, root),
            None => Err(InitError::Filesystem("root directory not open".to_string())),
        };
        drop(overlay);

        match result.and_then(|()| {
            fs::remove_dir(&ctx.layout.overlay).map_err(|e| InitError::io_at(&ctx.layout.overlay, e))
        }) {
            Ok(()) => ctx.report.record(BootStage::Overlay, EventOutcome::Ok, ""),
            Err(e) => ctx
                .report
                .record(BootStage::Overlay, EventOutcome::Degraded, e.to_string()),
        }
    }

    /// Point the real init at a CIL path that does not exist, so it loads
    /// the monolithic policy written below instead of recompiling.
    fn patch_init(&mut self) {
        let ctx = &mut self.ctx;
        let result = PatchSignature::plat_cil(Layout::plat_cil_signature())
            .and_then(|sig| SignaturePatcher::new().patch_file(&ctx.layout.init, &sig));

        match result {
            Ok(Some(offset)) => {
                ctx.report.patched.push(ctx.layout.init.display().to_string());
                ctx.report.record(
                    BootStage::InitPatch,
                    EventOutcome::Ok,
                    format!("offset {:#x}", offset),
                );
            }
            Ok(None) => ctx.report.record(
                BootStage::InitPatch,
                EventOutcome::Skipped,
                "signature not present",
            ),
            Err(e) => ctx
                .report
                .record(BootStage::InitPatch, EventOutcome::Degraded, e.to_string()),
        }
    }

    fn patch_service_script(&mut self) {
        let ctx = &mut self.ctx;
        match initrc::patch_file(&ctx.layout.init_rc) {
            Ok(true) => {
                ctx.report.patched.push(ctx.layout.init_rc.display().to_string());
                ctx.report.record(BootStage::ServicePatch, EventOutcome::Ok, "");
            }
            Ok(false) => ctx.report.record(
                BootStage::ServicePatch,
                EventOutcome::Skipped,
                "no init.rc",
            ),
            Err(e) => ctx.report.record(
                BootStage::ServicePatch,
                EventOutcome::Degraded,
                e.to_string(),
            ),
        }
    }

    fn prepare_policy(&mut self) {
        let ctx = &mut self.ctx;
        match PolicyEngine::new(&mut *ctx.policy, &ctx.layout).run() {
            Ok(outcome) => {
                ctx.report.policy_source = Some(outcome.source);
                ctx.report.record(
                    BootStage::Policy,
                    EventOutcome::Ok,
                    format!(
                        "{:?}: {} rules applied, {} rejected",
                        outcome.source, outcome.rules_applied, outcome.rules_rejected
                    ),
                );
            }
            Err(e) => {
                let init_patched =
                    ctx.report.outcome_of(BootStage::InitPatch) == Some(EventOutcome::Ok);
                let detail = if init_patched {
                    log::error!("Policy not written after patching init: {}", POLICY_LOST);
                    format!("{}; {}", e, POLICY_LOST)
                } else {
                    e.to_string()
                };
                ctx.report.policy_error = Some(e.to_string());
                ctx.report.record(BootStage::Policy, EventOutcome::Failed, detail);
            }
        }
    }

    fn deploy_payloads(&mut self) -> Result<()> {
        let ctx = &mut self.ctx;
        let deploy = |kind: PayloadKind, dest: &std::path::Path, mode: u32| -> Result<()> {
            if let Some(parent) = dest.parent() {
                DirBuilder::new()
                    .recursive(true)
                    .mode(0o755)
                    .create(parent)
                    .map_err(|e| InitError::io_at(parent, e))?;
            }
            ctx.payloads.deploy(kind, dest, mode).map(|_| ())
        };

        let result = deploy(PayloadKind::Script, &ctx.layout.agent_script, SCRIPT_MODE)
            .and_then(|()| deploy(PayloadKind::Agent, &ctx.layout.agent_binary, AGENT_MODE));
        match result {
            Ok(()) => {
                for path in [&ctx.layout.agent_script, &ctx.layout.agent_binary] {
                    ctx.report.deployed.push(path.display().to_string());
                }
                ctx.report.record(BootStage::Payload, EventOutcome::Ok, "");
                Ok(())
            }
            Err(e) => {
                ctx.report
                    .record(BootStage::Payload, EventOutcome::Failed, e.to_string());
                Err(e)
            }
        }
    }

    fn randomize_rendezvous(&mut self) {
        let ctx = &mut self.ctx;
        let result = PatchSignature::rendezvous()
            .and_then(|sig| SignaturePatcher::new().patch_file(&ctx.layout.agent_binary, &sig));

        match result {
            Ok(Some(offset)) => {
                ctx.report
                    .patched
                    .push(ctx.layout.agent_binary.display().to_string());
                ctx.report.record(
                    BootStage::Rendezvous,
                    EventOutcome::Ok,
                    format!("offset {:#x}", offset),
                );
            }
            Ok(None) => ctx.report.record(
                BootStage::Rendezvous,
                EventOutcome::Skipped,
                "rendezvous name not present",
            ),
            Err(e) => ctx
                .report
                .record(BootStage::Rendezvous, EventOutcome::Degraded, e.to_string()),
        }
    }

    fn relocate_self(&mut self) {
        let ctx = &mut self.ctx;
        let result = fs::rename(&ctx.layout.init_backup, &ctx.layout.init_service)
            .map_err(|e| InitError::io_at(&ctx.layout.init_backup, e));

        match result {
            Ok(()) => ctx.report.record(
                BootStage::ServiceRelocate,
                EventOutcome::Ok,
                ctx.layout.init_service.display().to_string(),
            ),
            Err(e) => ctx.report.record(
                BootStage::ServiceRelocate,
                EventOutcome::Degraded,
                e.to_string(),
            ),
        }
    }
}

impl<'a> Boot<'a, Patched> {
    /// Step 7
    pub fn release(mut self) -> Boot<'a, HandoffReady> {
        let ctx = &mut self.ctx;
        EarlyMounter::new(ctx.kernel, &ctx.layout, &ctx.config).release(&mut ctx.mounts);
        ctx.root = None;
        ctx.report.mounted = ctx.mounts.describe(&ctx.layout);
        ctx.report.record(BootStage::Cleanup, EventOutcome::Ok, "");
        self.advance()
    }
}

impl<'a> Boot<'a, HandoffReady> {
    /// Step 8. Returns only if the exec failed.
    pub fn handoff(mut self) -> Result<Infallible> {
        let ctx = &mut self.ctx;
        ctx.report.record(
            BootStage::Handoff,
            EventOutcome::Ok,
            ctx.layout.init.display().to_string(),
        );
        ctx.report.emit();
        ctx.kernel.exec(&ctx.layout.init, &ctx.args)
    }
}

/// Run the whole pipeline. Returns only on failure.
pub fn run(
    kernel: &dyn KernelOps,
    policy: &mut dyn PolicyBackend,
    layout: Layout,
    payloads: Payloads<'_>,
    args: Vec<OsString>,
) -> Result<Infallible> {
    Boot::new(kernel, policy, layout, payloads, args)
        .prepare()?
        .reconstruct_rootfs()?
        .early_mount()?
        .patch_rootfs()?
        .release()
        .handoff()
}
