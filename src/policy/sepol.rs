//! libsepol-backed [`PolicyBackend`].
//!
//! Binary policy IO and CIL compilation come from libsepol. Rule editing
//! comes from the companion policy tool library, which operates on a
//! process-global policy database pointer.

use crate::config::types::{InitError, Result};
use crate::fs::MappedFile;
use crate::policy::backend::PolicyBackend;
use crate::policy::cil::{CilOptions, CilSource};
use crate::policy::rules::{PolicyStatement, ANY};
use libc::{c_char, c_int, c_void, size_t};
use std::ffi::{CStr, CString};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr;

#[repr(C)]
struct CilDb {
    _private: [u8; 0],
}

#[repr(C)]
struct SepolPolicydb {
    _private: [u8; 0],
}

#[repr(C)]
struct SepolPolicyFile {
    _private: [u8; 0],
}

#[link(name = "sepol")]
extern "C" {
    fn cil_db_init(db: *mut *mut CilDb);
    fn cil_db_destroy(db: *mut *mut CilDb);
    fn cil_set_mls(db: *mut CilDb, mls: c_int);
    fn cil_set_multiple_decls(db: *mut CilDb, multiple_decls: c_int);
    fn cil_set_disable_neverallow(db: *mut CilDb, disable: c_int);
    fn cil_set_target_platform(db: *mut CilDb, target: c_int);
    fn cil_set_policy_version(db: *mut CilDb, version: c_int);
    fn cil_set_attrs_expand_generated(db: *mut CilDb, expand: c_int);
    fn cil_add_file(db: *mut CilDb, name: *const c_char, data: *const c_char, size: size_t)
        -> c_int;
    fn cil_compile(db: *mut CilDb) -> c_int;
    fn cil_build_policydb(db: *mut CilDb, pdb: *mut *mut SepolPolicydb) -> c_int;

    fn sepol_policydb_create(pdb: *mut *mut SepolPolicydb) -> c_int;
    fn sepol_policydb_free(pdb: *mut SepolPolicydb);
    fn sepol_policydb_read(pdb: *mut SepolPolicydb, pf: *mut SepolPolicyFile) -> c_int;
    fn sepol_policydb_write(pdb: *mut SepolPolicydb, pf: *mut SepolPolicyFile) -> c_int;
    fn sepol_policy_file_create(pf: *mut *mut SepolPolicyFile) -> c_int;
    fn sepol_policy_file_free(pf: *mut SepolPolicyFile);
    fn sepol_policy_file_set_mem(pf: *mut SepolPolicyFile, data: *mut c_char, len: size_t);
    fn sepol_policy_file_set_fp(pf: *mut SepolPolicyFile, fp: *mut libc::FILE);
}

#[link(name = "magiskpolicy")]
extern "C" {
    /// Database the editing primitives operate on
    static mut policydb: *mut c_void;

    fn sepol_create_domain(domain: *const c_char) -> c_int;
    fn sepol_permissive(domain: *const c_char) -> c_int;
    fn sepol_allow(
        source: *const c_char,
        target: *const c_char,
        class: *const c_char,
        perm: *const c_char,
    ) -> c_int;
    fn sepol_attradd(ty: *const c_char, attribute: *const c_char) -> c_int;

    fn magiskpolicy_main(argc: c_int, argv: *mut *mut c_char) -> c_int;
}

fn cstring(s: &str) -> Result<CString> {
    CString::new(s).map_err(|_| InitError::Policy(format!("NUL byte in {:?}", s)))
}

fn path_cstring(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| InitError::Policy(format!("NUL byte in {}", path.display())))
}

/// Owned `sepol_policy_file_t`
struct PolicyFile(*mut SepolPolicyFile);

impl PolicyFile {
    fn new() -> Result<Self> {
        let mut pf = ptr::null_mut();
        if unsafe { sepol_policy_file_create(&mut pf) } != 0 || pf.is_null() {
            return Err(InitError::Policy("sepol_policy_file_create failed".to_string()));
        }
        Ok(Self(pf))
    }
}

impl Drop for PolicyFile {
    fn drop(&mut self) {
        unsafe { sepol_policy_file_free(self.0) }
    }
}

/// libsepol policy database plus the global pointer the editor reads
pub struct SepolBackend {
    pdb: *mut SepolPolicydb,
}

impl SepolBackend {
    pub fn new() -> Self {
        Self {
            pdb: ptr::null_mut(),
        }
    }

    fn replace(&mut self, pdb: *mut SepolPolicydb) {
        self.release();
        self.pdb = pdb;
        // sepol_policydb_t wraps policydb_t as its first member
        unsafe { policydb = pdb as *mut c_void };
    }

    fn release(&mut self) {
        if !self.pdb.is_null() {
            unsafe {
                policydb = ptr::null_mut();
                sepol_policydb_free(self.pdb);
            }
            self.pdb = ptr::null_mut();
        }
    }

    fn loaded(&self) -> Result<*mut SepolPolicydb> {
        if self.pdb.is_null() {
            return Err(InitError::Policy("no policy loaded".to_string()));
        }
        Ok(self.pdb)
    }
}

impl Default for SepolBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SepolBackend {
    fn drop(&mut self) {
        self.release();
    }
}

/// Owned CIL database
struct CilDbGuard(*mut CilDb);

impl Drop for CilDbGuard {
    fn drop(&mut self) {
        unsafe { cil_db_destroy(&mut self.0) }
    }
}

impl PolicyBackend for SepolBackend {
    fn name(&self) -> &str {
        "libsepol"
    }

    fn load(&mut self, path: &Path) -> Result<()> {
        let map = MappedFile::open(path)?;
        let pf = PolicyFile::new()?;

        let mut pdb = ptr::null_mut();
        if unsafe { sepol_policydb_create(&mut pdb) } != 0 || pdb.is_null() {
            return Err(InitError::Policy("sepol_policydb_create failed".to_string()));
        }

        unsafe {
            // libsepol only reads through this pointer
            sepol_policy_file_set_mem(pf.0, map.as_bytes().as_ptr() as *mut c_char, map.len());
            if sepol_policydb_read(pdb, pf.0) != 0 {
                sepol_policydb_free(pdb);
                return Err(InitError::Policy(format!(
                    "Cannot parse policy {}",
                    path.display()
                )));
            }
        }

        self.replace(pdb);
        log::info!("Loaded policy {}", path.display());
        Ok(())
    }

    fn compile(&mut self, options: &CilOptions, sources: &[CilSource]) -> Result<()> {
        let mut db = CilDbGuard(ptr::null_mut());
        unsafe {
            cil_db_init(&mut db.0);
            if db.0.is_null() {
                return Err(InitError::Policy("cil_db_init failed".to_string()));
            }
            cil_set_mls(db.0, options.mls as c_int);
            cil_set_multiple_decls(db.0, options.multiple_decls as c_int);
            cil_set_disable_neverallow(db.0, options.disable_neverallow as c_int);
            cil_set_target_platform(db.0, options.target_platform.as_raw());
            cil_set_policy_version(db.0, options.policy_version as c_int);
            cil_set_attrs_expand_generated(db.0, options.attrs_expand_generated as c_int);
        }

        for source in sources {
            let name = path_cstring(&source.path)?;
            let data = source.as_bytes();
            let rc = unsafe {
                cil_add_file(db.0, name.as_ptr(), data.as_ptr() as *const c_char, data.len())
            };
            if rc != 0 {
                return Err(InitError::Policy(format!(
                    "cil_add_file {} failed",
                    source.path.display()
                )));
            }
        }

        if unsafe { cil_compile(db.0) } != 0 {
            return Err(InitError::Policy("cil_compile failed".to_string()));
        }

        let mut pdb = ptr::null_mut();
        if unsafe { cil_build_policydb(db.0, &mut pdb) } != 0 || pdb.is_null() {
            return Err(InitError::Policy("cil_build_policydb failed".to_string()));
        }

        self.replace(pdb);
        log::info!("Compiled policy from {} CIL sources", sources.len());
        Ok(())
    }

    fn apply(&mut self, statement: &PolicyStatement) -> Result<()> {
        self.loaded()?;

        // The editor takes NULL for a wildcard
        let arg = |s: &str| -> Result<Option<CString>> {
            if s == ANY {
                Ok(None)
            } else {
                cstring(s).map(Some)
            }
        };
        let ptr_of = |c: &Option<CString>| c.as_ref().map_or(ptr::null(), |c| c.as_ptr());

        let rc = match *statement {
            PolicyStatement::CreateDomain(domain) => {
                let domain = cstring(domain)?;
                unsafe { sepol_create_domain(domain.as_ptr()) }
            }
            PolicyStatement::Permissive(domain) => {
                let domain = cstring(domain)?;
                unsafe { sepol_permissive(domain.as_ptr()) }
            }
            PolicyStatement::Allow {
                source,
                target,
                class,
                perm,
            } => {
                let (s, t, c, p) = (arg(source)?, arg(target)?, arg(class)?, arg(perm)?);
                unsafe { sepol_allow(ptr_of(&s), ptr_of(&t), ptr_of(&c), ptr_of(&p)) }
            }
            PolicyStatement::AttributeAdd { ty, attribute } => {
                let (ty, attribute) = (cstring(ty)?, cstring(attribute)?);
                unsafe { sepol_attradd(ty.as_ptr(), attribute.as_ptr()) }
            }
        };

        if rc != 0 {
            return Err(InitError::Policy(format!("{:?} returned {}", statement, rc)));
        }
        Ok(())
    }

    fn write(&mut self, path: &Path) -> Result<()> {
        let pdb = self.loaded()?;
        let path_c = path_cstring(path)?;
        let mode = CStr::from_bytes_with_nul(b"we\0")
            .map_err(|e| InitError::Policy(e.to_string()))?;

        let fp = unsafe { libc::fopen(path_c.as_ptr(), mode.as_ptr()) };
        if fp.is_null() {
            return Err(InitError::io_at(path, std::io::Error::last_os_error()));
        }

        let pf = PolicyFile::new();
        let rc = match &pf {
            Ok(pf) => unsafe {
                sepol_policy_file_set_fp(pf.0, fp);
                sepol_policydb_write(pdb, pf.0)
            },
            Err(_) => -1,
        };
        drop(pf);

        if unsafe { libc::fclose(fp) } != 0 || rc != 0 {
            return Err(InitError::Policy(format!("Cannot write policy {}", path.display())));
        }
        log::info!("Wrote policy {}", path.display());
        Ok(())
    }
}

/// Run the policy editing tool with `args` (argv[0] included)
pub fn run_policy_tool(args: &[std::ffi::OsString]) -> Result<i32> {
    let owned = args
        .iter()
        .map(|a| CString::new(a.as_bytes()))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|_| InitError::Config("argument contains NUL byte".to_string()))?;

    let mut argv: Vec<*mut c_char> = owned.iter().map(|a| a.as_ptr() as *mut c_char).collect();
    argv.push(ptr::null_mut());

    let rc = unsafe { magiskpolicy_main(owned.len() as c_int, argv.as_mut_ptr()) };
    Ok(rc)
}
