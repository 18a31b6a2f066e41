use crate::config::types::{InitError, Result};
use nix::errno::Errno;
use std::ffi::{CStr, CString};
use std::fs::File;
use std::io;
use std::os::fd::{FromRawFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

/// Directory descriptor closed on drop.
///
/// Holding one keeps the directory reachable while its named children are
/// deleted and recreated.
pub struct DirHandle {
    fd: RawFd,
    path: PathBuf,
}

impl DirHandle {
    /// Open a directory without following a trailing symlink
    pub fn open(path: &Path) -> Result<Self> {
        let path_c = path_cstring(path)?;
        let fd = unsafe {
            libc::open(
                path_c.as_ptr(),
                libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC | libc::O_NOFOLLOW,
            )
        };
        if fd < 0 {
            return Err(InitError::io_at(path, io::Error::last_os_error()));
        }
        Ok(Self {
            fd,
            path: path.to_path_buf(),
        })
    }

    fn open_child(&self, name: &CStr) -> Result<Self> {
        let fd = unsafe {
            libc::openat(
                self.fd,
                name.as_ptr(),
                libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC | libc::O_NOFOLLOW,
            )
        };
        let path = self.child_path(name);
        if fd < 0 {
            return Err(InitError::io_at(&path, io::Error::last_os_error()));
        }
        Ok(Self { fd, path })
    }

    fn child_path(&self, name: &CStr) -> PathBuf {
        self.path
            .join(std::ffi::OsStr::from_bytes(name.to_bytes()))
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn stat(&self) -> Result<libc::stat> {
        let mut st = std::mem::MaybeUninit::<libc::stat>::zeroed();
        let rc = unsafe { libc::fstat(self.fd, st.as_mut_ptr()) };
        if rc != 0 {
            return Err(InitError::io_at(&self.path, io::Error::last_os_error()));
        }
        Ok(unsafe { st.assume_init() })
    }
}

impl Drop for DirHandle {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

fn path_cstring(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| InitError::Filesystem(format!("Path contains NUL byte: {}", path.display())))
}

fn file_type(st: &libc::stat) -> libc::mode_t {
    st.st_mode as libc::mode_t & libc::S_IFMT
}

/// `st_mode` is wider than `mode_t` on 32-bit Android
fn permission_bits(st: &libc::stat) -> libc::mode_t {
    (st.st_mode & 0o7777) as libc::mode_t
}

fn stat_at(dir: &DirHandle, name: &CStr) -> Result<Option<libc::stat>> {
    let mut st = std::mem::MaybeUninit::<libc::stat>::zeroed();
    let rc = unsafe {
        libc::fstatat(
            dir.as_raw_fd(),
            name.as_ptr(),
            st.as_mut_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    if rc != 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::NotFound {
            return Ok(None);
        }
        return Err(InitError::io_at(&dir.child_path(name), err));
    }
    Ok(Some(unsafe { st.assume_init() }))
}

fn unlink_at(dir: &DirHandle, name: &CStr, flags: libc::c_int) -> Result<()> {
    let rc = unsafe { libc::unlinkat(dir.as_raw_fd(), name.as_ptr(), flags) };
    if rc != 0 {
        return Err(InitError::io_at(
            &dir.child_path(name),
            io::Error::last_os_error(),
        ));
    }
    Ok(())
}

/// Snapshot of a directory's entry names, excluding `.` and `..`
fn entry_names(dir: &DirHandle) -> Result<Vec<CString>> {
    let iter_fd = unsafe { libc::dup(dir.as_raw_fd()) };
    if iter_fd < 0 {
        return Err(InitError::io_at(dir.path(), io::Error::last_os_error()));
    }

    let stream = unsafe { libc::fdopendir(iter_fd) };
    if stream.is_null() {
        let err = io::Error::last_os_error();
        unsafe {
            libc::close(iter_fd);
        }
        return Err(InitError::io_at(dir.path(), err));
    }
    unsafe {
        libc::rewinddir(stream);
    }

    let mut names = Vec::new();
    loop {
        // readdir signals both end and failure with NULL
        Errno::clear();
        let entry = unsafe { libc::readdir(stream) };
        if entry.is_null() {
            let errno = Errno::last();
            unsafe {
                libc::closedir(stream);
            }
            if errno != Errno::UnknownErrno {
                return Err(InitError::io_at(dir.path(), io::Error::from(errno)));
            }
            break;
        }

        let name = unsafe { CStr::from_ptr((*entry).d_name.as_ptr()) };
        let bytes = name.to_bytes();
        if bytes == b"." || bytes == b".." {
            continue;
        }
        names.push(name.to_owned());
    }

    Ok(names)
}

fn is_listed(name: &CStr, list: &[&str]) -> bool {
    list.iter().any(|item| item.as_bytes() == name.to_bytes())
}

// ============================================================================
// Delete with exclusions
// ============================================================================

fn remove_dir_contents(dir: &DirHandle, root_dev: libc::dev_t) -> Result<()> {
    for name in entry_names(dir)? {
        remove_entry(dir, &name, root_dev)?;
    }
    Ok(())
}

fn remove_entry(dir: &DirHandle, name: &CStr, root_dev: libc::dev_t) -> Result<()> {
    let Some(st) = stat_at(dir, name)? else {
        return Ok(());
    };

    if file_type(&st) == libc::S_IFDIR {
        if st.st_dev != root_dev {
            log::warn!(
                "Not descending into mountpoint {}",
                dir.child_path(name).display()
            );
            return Ok(());
        }
        let child = dir.open_child(name)?;
        remove_dir_contents(&child, root_dev)?;
        drop(child);
        unlink_at(dir, name, libc::AT_REMOVEDIR)
    } else {
        unlink_at(dir, name, 0)
    }
}

/// Delete every entry of `dir` except the top-level names in `preserve`.
///
/// Never follows symlinks and never descends into another filesystem.
pub fn remove_contents_except(dir: &DirHandle, preserve: &[&str]) -> Result<()> {
    let root_dev = dir.stat()?.st_dev;
    let mut removed = 0usize;

    for name in entry_names(dir)? {
        if is_listed(&name, preserve) {
            log::debug!("Preserving {}", dir.child_path(&name).display());
            continue;
        }
        remove_entry(dir, &name, root_dev)?;
        removed += 1;
    }

    log::info!(
        "Cleared {} entries from {} (preserved {:?})",
        removed,
        dir.path().display(),
        preserve
    );
    Ok(())
}

/// Remove a single path (file, symlink or whole tree) if it exists
pub fn remove_path(path: &Path) -> Result<()> {
    let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
        return Err(InitError::Filesystem(format!(
            "Cannot remove path without parent: {}",
            path.display()
        )));
    };
    let parent_dir = match DirHandle::open(parent) {
        Ok(dir) => dir,
        Err(e) if e.is_not_found() => return Ok(()),
        Err(e) => return Err(e),
    };
    let name_c = CString::new(name.as_bytes())
        .map_err(|_| InitError::Filesystem(format!("Path contains NUL byte: {}", path.display())))?;
    let root_dev = parent_dir.stat()?.st_dev;
    remove_entry(&parent_dir, &name_c, root_dev)
}

// ============================================================================
// Clone
// ============================================================================

fn copy_ownership(dir: &DirHandle, name: &CStr, st: &libc::stat) {
    let rc = unsafe {
        libc::fchownat(
            dir.as_raw_fd(),
            name.as_ptr(),
            st.st_uid,
            st.st_gid,
            libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    if rc != 0 {
        log::debug!(
            "chown {} failed: {}",
            dir.child_path(name).display(),
            io::Error::last_os_error()
        );
    }
}

fn copy_mode(dir: &DirHandle, name: &CStr, st: &libc::stat) -> Result<()> {
    let rc = unsafe { libc::fchmodat(dir.as_raw_fd(), name.as_ptr(), permission_bits(st), 0) };
    if rc != 0 {
        return Err(InitError::io_at(
            &dir.child_path(name),
            io::Error::last_os_error(),
        ));
    }
    Ok(())
}

fn clone_regular(src: &DirHandle, dst: &DirHandle, name: &CStr, st: &libc::stat) -> Result<()> {
    let in_fd = unsafe {
        libc::openat(
            src.as_raw_fd(),
            name.as_ptr(),
            libc::O_RDONLY | libc::O_CLOEXEC | libc::O_NOFOLLOW,
        )
    };
    if in_fd < 0 {
        return Err(InitError::io_at(
            &src.child_path(name),
            io::Error::last_os_error(),
        ));
    }
    let mut input = unsafe { File::from_raw_fd(in_fd) };

    let out_fd = unsafe {
        libc::openat(
            dst.as_raw_fd(),
            name.as_ptr(),
            libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC | libc::O_CLOEXEC | libc::O_NOFOLLOW,
            (st.st_mode & 0o7777) as libc::c_uint,
        )
    };
    if out_fd < 0 {
        return Err(InitError::io_at(
            &dst.child_path(name),
            io::Error::last_os_error(),
        ));
    }
    let mut output = unsafe { File::from_raw_fd(out_fd) };

    io::copy(&mut input, &mut output).map_err(|e| InitError::io_at(&dst.child_path(name), e))?;
    Ok(())
}

fn clone_symlink(src: &DirHandle, dst: &DirHandle, name: &CStr) -> Result<()> {
    let mut buf = vec![0u8; libc::PATH_MAX as usize];
    let len = unsafe {
        libc::readlinkat(
            src.as_raw_fd(),
            name.as_ptr(),
            buf.as_mut_ptr() as *mut libc::c_char,
            buf.len(),
        )
    };
    if len < 0 {
        return Err(InitError::io_at(
            &src.child_path(name),
            io::Error::last_os_error(),
        ));
    }
    buf.truncate(len as usize);
    let target = CString::new(buf).map_err(|_| {
        InitError::Filesystem(format!(
            "Symlink target contains NUL byte: {}",
            src.child_path(name).display()
        ))
    })?;

    let rc = unsafe { libc::symlinkat(target.as_ptr(), dst.as_raw_fd(), name.as_ptr()) };
    if rc != 0 {
        return Err(InitError::io_at(
            &dst.child_path(name),
            io::Error::last_os_error(),
        ));
    }
    Ok(())
}

fn clone_special(dst: &DirHandle, name: &CStr, st: &libc::stat) -> Result<()> {
    let rc = unsafe {
        libc::mknodat(
            dst.as_raw_fd(),
            name.as_ptr(),
            st.st_mode as libc::mode_t,
            st.st_rdev as libc::dev_t,
        )
    };
    if rc != 0 {
        return Err(InitError::io_at(
            &dst.child_path(name),
            io::Error::last_os_error(),
        ));
    }
    Ok(())
}

fn clone_entry(src: &DirHandle, dst: &DirHandle, name: &CStr) -> Result<()> {
    let Some(st) = stat_at(src, name)? else {
        return Ok(());
    };
    let kind = file_type(&st);

    // Replace whatever non-directory sits at the destination
    if let Some(existing) = stat_at(dst, name)? {
        let existing_is_dir = file_type(&existing) == libc::S_IFDIR;
        if kind != libc::S_IFDIR || !existing_is_dir {
            remove_entry(dst, name, existing.st_dev)?;
        }
    }

    match kind {
        libc::S_IFDIR => {
            let rc = unsafe { libc::mkdirat(dst.as_raw_fd(), name.as_ptr(), permission_bits(&st)) };
            if rc != 0 {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::AlreadyExists {
                    return Err(InitError::io_at(&dst.child_path(name), err));
                }
            }
            let src_child = src.open_child(name)?;
            let dst_child = dst.open_child(name)?;
            clone_contents(&src_child, &dst_child, &[])?;
            copy_ownership(dst, name, &st);
            copy_mode(dst, name, &st)?;
        }
        libc::S_IFREG => {
            clone_regular(src, dst, name, &st)?;
            copy_ownership(dst, name, &st);
            copy_mode(dst, name, &st)?;
        }
        libc::S_IFLNK => {
            clone_symlink(src, dst, name)?;
            copy_ownership(dst, name, &st);
        }
        _ => {
            clone_special(dst, name, &st)?;
            copy_ownership(dst, name, &st);
        }
    }

    Ok(())
}

/// Recursively copy every entry of `src` into `dst`, skipping top-level names in `exclude`.
///
/// Modes, ownership (best effort), symlinks and special files are preserved.
pub fn clone_contents(src: &DirHandle, dst: &DirHandle, exclude: &[&str]) -> Result<()> {
    for name in entry_names(src)? {
        if is_listed(&name, exclude) {
            continue;
        }
        clone_entry(src, dst, &name)?;
    }
    Ok(())
}

// ============================================================================
// Move
// ============================================================================

fn rename_at(src: &DirHandle, dst: &DirHandle, name: &CStr) -> Result<()> {
    let rc = unsafe {
        libc::renameat(
            src.as_raw_fd(),
            name.as_ptr(),
            dst.as_raw_fd(),
            name.as_ptr(),
        )
    };
    if rc != 0 {
        return Err(InitError::io_at(
            &src.child_path(name),
            io::Error::last_os_error(),
        ));
    }
    Ok(())
}

/// Move every entry of `src` into `dst`, merging directories and replacing files
pub fn move_contents(src: &DirHandle, dst: &DirHandle) -> Result<()> {
    for name in entry_names(src)? {
        let Some(st) = stat_at(src, &name)? else {
            continue;
        };
        let existing = stat_at(dst, &name)?;

        if file_type(&st) == libc::S_IFDIR {
            match existing {
                Some(ex) if file_type(&ex) == libc::S_IFDIR => {
                    let src_child = src.open_child(&name)?;
                    let dst_child = dst.open_child(&name)?;
                    move_contents(&src_child, &dst_child)?;
                    drop(src_child);
                    unlink_at(src, &name, libc::AT_REMOVEDIR)?;
                }
                Some(ex) => {
                    remove_entry(dst, &name, ex.st_dev)?;
                    rename_at(src, dst, &name)?;
                }
                None => rename_at(src, dst, &name)?,
            }
        } else {
            if let Some(ex) = existing {
                if file_type(&ex) == libc::S_IFDIR {
                    remove_entry(dst, &name, ex.st_dev)?;
                }
            }
            rename_at(src, dst, &name)?;
        }
        log::debug!("Moved {}", src.child_path(&name).display());
    }
    Ok(())
}
