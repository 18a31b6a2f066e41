/// Memory-mapped file helpers
///
/// Mappings are owned values; dropping one unmaps it, so every early return
/// releases the region.
use crate::config::types::{InitError, Result};
use memmap2::{Mmap, MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

/// Read-only view of a whole file
pub struct MappedFile {
    map: Option<Mmap>,
}

impl MappedFile {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(path)
            .map_err(|e| InitError::io_at(path, e))?;
        let len = file_len(&file, path)?;
        if len == 0 {
            return Ok(Self { map: None });
        }
        let map = unsafe { MmapOptions::new().map(&file) }.map_err(|e| InitError::io_at(path, e))?;
        Ok(Self { map: Some(map) })
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.map.as_deref().unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shared read-write mapping; writes land in the file itself
pub struct MappedFileMut {
    map: Option<MmapMut>,
}

impl MappedFileMut {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(path)
            .map_err(|e| InitError::io_at(path, e))?;
        let len = file_len(&file, path)?;
        if len == 0 {
            return Ok(Self { map: None });
        }
        let map =
            unsafe { MmapOptions::new().map_mut(&file) }.map_err(|e| InitError::io_at(path, e))?;
        Ok(Self { map: Some(map) })
    }

    pub fn as_mut_bytes(&mut self) -> &mut [u8] {
        match self.map.as_mut() {
            Some(map) => &mut map[..],
            None => &mut [],
        }
    }

    /// Push dirty pages to the file before the mapping is dropped
    pub fn flush(&self) -> Result<()> {
        if let Some(map) = &self.map {
            map.flush()?;
        }
        Ok(())
    }
}

fn file_len(file: &File, path: &Path) -> Result<u64> {
    Ok(file
        .metadata()
        .map_err(|e| InitError::io_at(path, e))?
        .len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_read_only_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        fs::write(&path, b"hello").unwrap();
        let map = MappedFile::open(&path).unwrap();
        assert_eq!(map.as_bytes(), b"hello");
    }

    #[test]
    fn test_empty_file_maps_to_empty_slice() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty");
        fs::write(&path, b"").unwrap();
        assert!(MappedFile::open(&path).unwrap().is_empty());
        assert!(MappedFileMut::open(&path).unwrap().as_mut_bytes().is_empty());
    }

    #[test]
    fn test_writable_mapping_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        fs::write(&path, b"abcdef").unwrap();
        {
            let mut map = MappedFileMut::open(&path).unwrap();
            map.as_mut_bytes()[0..3].copy_from_slice(b"xyz");
            map.flush().unwrap();
        }
        assert_eq!(fs::read(&path).unwrap(), b"xyzdef");
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = MappedFile::open(&dir.path().join("nope")).err().unwrap();
        assert!(err.is_not_found());
    }
}
