//! Integration tests for rootfs reconstruction
//!
//! These tests verify the tree each strategy leaves behind.

use preinit::boot::{EarlyMounts, RootfsReconstructor};
use preinit::config::Layout;
use preinit::fs::DirHandle;
use preinit::testing::RecordingKernel;
use preinit::{BootConfig, BootstrapStrategy};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

fn write(path: &Path, body: &[u8]) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, body).unwrap();
}

/// Relative path -> file contents (`None` for directories)
fn snapshot(root: &Path) -> BTreeMap<String, Option<Vec<u8>>> {
    fn walk(base: &Path, dir: &Path, out: &mut BTreeMap<String, Option<Vec<u8>>>) {
        for entry in fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            let rel = path.strip_prefix(base).unwrap().display().to_string();
            let meta = fs::symlink_metadata(&path).unwrap();
            if meta.is_dir() {
                out.insert(rel, None);
                walk(base, &path, out);
            } else if meta.is_file() {
                out.insert(rel, Some(fs::read(&path).unwrap()));
            }
        }
    }
    let mut out = BTreeMap::new();
    walk(root, root, &mut out);
    out
}

struct Scratch {
    _dir: tempfile::TempDir,
    layout: Layout,
    sysfs: std::path::PathBuf,
    system: std::path::PathBuf,
}

fn scratch() -> Scratch {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("root");
    let sysfs = dir.path().join("sysfs");
    let system = dir.path().join("system_image");

    write(
        &sysfs.join("dev/block/259:4/uevent"),
        b"MAJOR=259\nMINOR=4\nDEVNAME=sda4\nPARTNAME=SYSTEM\n",
    );
    write(&system.join("init"), b"real init");
    write(&system.join("init.rc"), b"on init\n");
    write(&system.join("sbin/.keep"), b"");
    write(&system.join("system/build.prop"), b"ro.x=1\n");

    let layout = Layout::rooted(&root);
    write(&layout.init, b"preinit");
    write(&layout.init_backup, b"preinit");
    write(&layout.overlay.join("sbin/tool"), b"tool");
    write(&layout.pristine_init, b"pristine");
    write(&root.join("stale/file"), b"stale");

    Scratch {
        _dir: dir,
        layout,
        sysfs,
        system,
    }
}

fn rebuild(s: &Scratch) -> BootstrapStrategy {
    let config = BootConfig {
        skip_initramfs: true,
        slot_suffix: String::new(),
    };
    let device = s.layout.dev_block_dir.join("sda4");
    let kernel = RecordingKernel::new()
        .with_mount_source("sysfs", &s.sysfs)
        .with_mount_source(device.to_string_lossy(), &s.system);
    let root = DirHandle::open(&s.layout.root).unwrap();
    RootfsReconstructor::new(&kernel, &s.layout, &config)
        .run(&root, &mut EarlyMounts::default())
        .unwrap()
}

#[test]
fn test_clear_and_rebuild_contents() {
    let s = scratch();
    assert_eq!(rebuild(&s), BootstrapStrategy::ClearAndRebuild);

    let root = &s.layout.root;
    assert!(!root.join("stale").exists());
    assert_eq!(fs::read(&s.layout.init).unwrap(), b"real init");
    assert_eq!(fs::read(&s.layout.init_backup).unwrap(), b"preinit");
    assert_eq!(fs::read(s.layout.overlay.join("sbin/tool")).unwrap(), b"tool");
    assert!(s.layout.pristine_init.exists());
    assert_eq!(fs::read(s.layout.system.join("build.prop")).unwrap(), b"ro.x=1\n");
}

#[test]
fn test_clear_and_rebuild_is_idempotent() {
    let s = scratch();
    rebuild(&s);
    let first = snapshot(&s.layout.root);
    rebuild(&s);
    let second = snapshot(&s.layout.root);
    assert_eq!(first, second);
}
