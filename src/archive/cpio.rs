/// newc (SVR4, `070701`) cpio archive reader and extractor
use crate::config::types::{InitError, Result};
use std::ffi::CString;
use std::fs::{self, DirBuilder, OpenOptions};
use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{symlink, DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Component, Path};

const NEWC_MAGIC: &[u8; 6] = b"070701";
const NEWC_CRC_MAGIC: &[u8; 6] = b"070702";
const HEADER_LEN: usize = 110;
const TRAILER: &str = "TRAILER!!!";
/// Mode of directories implied by a member path but absent from the archive
const PARENT_MODE: u32 = 0o755;

/// One archive member held in memory
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CpioEntry {
    pub name: String,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev_major: u32,
    pub rdev_minor: u32,
    pub data: Vec<u8>,
}

impl CpioEntry {
    pub fn file_type(&self) -> libc::mode_t {
        self.mode as libc::mode_t & libc::S_IFMT
    }
}

fn align4(n: usize) -> usize {
    (n + 3) & !3
}

fn hex_field(header: &[u8], index: usize) -> Result<u32> {
    let start = 6 + index * 8;
    let raw = &header[start..start + 8];
    let text = std::str::from_utf8(raw)
        .map_err(|_| InitError::Archive(format!("non-ascii header field {}", index)))?;
    u32::from_str_radix(text, 16)
        .map_err(|_| InitError::Archive(format!("invalid hex header field {:?}", text)))
}

fn take(buf: &[u8], pos: usize, len: usize) -> Result<&[u8]> {
    buf.get(pos..pos + len)
        .ok_or_else(|| InitError::Archive(format!("truncated archive at offset {}", pos)))
}

/// Parse a whole newc archive into memory
pub fn parse(buf: &[u8]) -> Result<Vec<CpioEntry>> {
    let mut entries = Vec::new();
    let mut pos = 0usize;

    while pos < buf.len() {
        let header = take(buf, pos, HEADER_LEN)?;
        let magic = &header[..6];
        if magic != NEWC_MAGIC && magic != NEWC_CRC_MAGIC {
            return Err(InitError::Archive(format!("bad cpio magic at offset {}", pos)));
        }

        let mode = hex_field(header, 1)?;
        let uid = hex_field(header, 2)?;
        let gid = hex_field(header, 3)?;
        let file_size = hex_field(header, 6)? as usize;
        let rdev_major = hex_field(header, 9)?;
        let rdev_minor = hex_field(header, 10)?;
        let name_size = hex_field(header, 11)? as usize;

        let name_raw = take(buf, pos + HEADER_LEN, name_size)?;
        let name_raw = name_raw.strip_suffix(&[0]).unwrap_or(name_raw);
        let name = String::from_utf8_lossy(name_raw).into_owned();
        pos = align4(pos + HEADER_LEN + name_size);

        if name == TRAILER {
            break;
        }

        let data = take(buf, pos, file_size)?.to_vec();
        pos = align4(pos + file_size);

        if name == "." || name.is_empty() {
            continue;
        }
        entries.push(CpioEntry {
            name,
            mode,
            uid,
            gid,
            rdev_major,
            rdev_minor,
            data,
        });
    }

    Ok(entries)
}

/// Reject names that would escape the extraction root
fn checked_relative(name: &str) -> Result<&Path> {
    let path = Path::new(name.trim_start_matches('/'));
    if path
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(InitError::Archive(format!("unsafe entry name {:?}", name)));
    }
    Ok(path)
}

fn chown_entry(path: &Path, entry: &CpioEntry) {
    let Ok(path_c) = CString::new(path.as_os_str().as_bytes()) else {
        return;
    };
    let rc = unsafe { libc::lchown(path_c.as_ptr(), entry.uid, entry.gid) };
    if rc != 0 {
        log::debug!(
            "lchown {} failed: {}",
            path.display(),
            std::io::Error::last_os_error()
        );
    }
}

fn extract_entry(root: &Path, entry: &CpioEntry) -> Result<()> {
    let target = root.join(checked_relative(&entry.name)?);
    let perm = entry.mode & 0o7777;

    if let Some(parent) = target.parent() {
        DirBuilder::new()
            .recursive(true)
            .mode(PARENT_MODE)
            .create(parent)
            .map_err(|e| InitError::io_at(parent, e))?;
    }

    // Existing non-directories are replaced outright
    if let Ok(meta) = fs::symlink_metadata(&target) {
        if !(meta.is_dir() && entry.file_type() == libc::S_IFDIR) {
            crate::fs::remove_path(&target)?;
        }
    }

    match entry.file_type() {
        libc::S_IFDIR => {
            if !target.is_dir() {
                fs::create_dir(&target).map_err(|e| InitError::io_at(&target, e))?;
            }
            fs::set_permissions(&target, fs::Permissions::from_mode(perm))
                .map_err(|e| InitError::io_at(&target, e))?;
        }
        libc::S_IFREG => {
            let mut file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(perm)
                .custom_flags(libc::O_CLOEXEC)
                .open(&target)
                .map_err(|e| InitError::io_at(&target, e))?;
            file.write_all(&entry.data)
                .map_err(|e| InitError::io_at(&target, e))?;
            fs::set_permissions(&target, fs::Permissions::from_mode(perm))
                .map_err(|e| InitError::io_at(&target, e))?;
        }
        libc::S_IFLNK => {
            let link = std::ffi::OsStr::from_bytes(&entry.data);
            symlink(link, &target).map_err(|e| InitError::io_at(&target, e))?;
        }
        libc::S_IFCHR | libc::S_IFBLK | libc::S_IFIFO | libc::S_IFSOCK => {
            let path_c = CString::new(target.as_os_str().as_bytes())
                .map_err(|_| InitError::Archive(format!("NUL in path {}", target.display())))?;
            let dev = libc::makedev(entry.rdev_major, entry.rdev_minor);
            let rc = unsafe { libc::mknod(path_c.as_ptr(), entry.mode as libc::mode_t, dev) };
            if rc != 0 {
                return Err(InitError::io_at(&target, std::io::Error::last_os_error()));
            }
        }
        other => {
            return Err(InitError::Archive(format!(
                "unsupported file type {:o} for {}",
                other, entry.name
            )))
        }
    }

    chown_entry(&target, entry);
    Ok(())
}

/// Extract every entry under `root`, in archive order
pub fn extract_all(entries: &[CpioEntry], root: &Path) -> Result<()> {
    for entry in entries {
        log::debug!("Extracting {} ({:o})", entry.name, entry.mode);
        extract_entry(root, entry)?;
    }
    log::info!("Extracted {} archive entries into {}", entries.len(), root.display());
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build a newc archive for tests
    pub(crate) fn build(entries: &[(&str, u32, &[u8])]) -> Vec<u8> {
        fn push(out: &mut Vec<u8>, name: &str, mode: u32, data: &[u8]) {
            let fields = [0u32, mode, 0, 0, 1, 0, data.len() as u32, 0, 0, 0, 0, name.len() as u32 + 1, 0];
            out.extend_from_slice(NEWC_MAGIC);
            for f in fields {
                out.extend_from_slice(format!("{:08x}", f).as_bytes());
            }
            out.extend_from_slice(name.as_bytes());
            out.push(0);
            while out.len() % 4 != 0 {
                out.push(0);
            }
            out.extend_from_slice(data);
            while out.len() % 4 != 0 {
                out.push(0);
            }
        }

        let mut out = Vec::new();
        for (name, mode, data) in entries {
            push(&mut out, name, *mode, data);
        }
        push(&mut out, TRAILER, 0, &[]);
        out
    }

    #[test]
    fn test_parse_entries() {
        let archive = build(&[
            ("sbin", 0o040750, b""),
            ("init.rc", 0o100750, b"on init\n"),
            ("bin", 0o120777, b"/system/bin"),
        ]);
        let entries = parse(&archive).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].name, "init.rc");
        assert_eq!(entries[1].data, b"on init\n");
        assert_eq!(entries[2].file_type(), libc::S_IFLNK);
    }

    #[test]
    fn test_parse_rejects_bad_magic() {
        let mut archive = build(&[("a", 0o100644, b"x")]);
        archive[0] = b'1';
        assert!(parse(&archive).is_err());
    }

    #[test]
    fn test_parse_rejects_truncation() {
        let archive = build(&[("a", 0o100644, b"0123456789")]);
        assert!(parse(&archive[..HEADER_LEN + 4]).is_err());
    }

    #[test]
    fn test_extract_all_materializes_tree() {
        let dir = tempfile::tempdir().unwrap();
        let archive = build(&[
            ("sbin", 0o040750, b""),
            ("sbin/tool", 0o100755, b"#!/bin/sh\n"),
            ("init.rc", 0o100750, b"on init\n"),
            ("bin", 0o120777, b"/system/bin"),
        ]);
        extract_all(&parse(&archive).unwrap(), dir.path()).unwrap();

        assert_eq!(fs::read(dir.path().join("sbin/tool")).unwrap(), b"#!/bin/sh\n");
        let mode = fs::metadata(dir.path().join("init.rc")).unwrap().permissions().mode();
        assert_eq!(mode & 0o7777, 0o750);
        assert_eq!(
            fs::read_link(dir.path().join("bin")).unwrap(),
            Path::new("/system/bin")
        );
    }

    #[test]
    fn test_implied_parents_are_not_world_writable() {
        let dir = tempfile::tempdir().unwrap();
        let entries = parse(&build(&[("etc/init/hw/init.rc", 0o100644, b"on boot\n")])).unwrap();
        extract_all(&entries, dir.path()).unwrap();

        for parent in ["etc", "etc/init", "etc/init/hw"] {
            let mode = fs::metadata(dir.path().join(parent)).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755, "{}", parent);
        }
    }

    #[test]
    fn test_extract_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let entries = parse(&build(&[("../escape", 0o100644, b"x")])).unwrap();
        assert!(extract_all(&entries, dir.path()).is_err());
    }
}
