// SPDX-FileCopyrightText: © 2026 Manifold Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Named shared pages.
//!
//! A page is a fixed-size region shared between processes, backed by a
//! file in the scratch directory and mapped with `memmap2`. The creating
//! process is the page *master*: the backing file is unlinked when the
//! master handle drops, after which existing mappings keep working but no
//! new reader can attach.

use crate::scratch::backing_path;
use manifold_core::{ManifoldError, Result};
use memmap2::{Mmap, MmapMut};
use std::fs::OpenOptions;
use std::path::PathBuf;

enum Mapping {
    Rw(MmapMut),
    Ro(Mmap),
}

/// A mapped shared page.
pub struct SharedPage {
    name: String,
    path: PathBuf,
    map: Mapping,
    master: bool,
}

impl SharedPage {
    /// Creates (or truncates) the page and maps it writable. The returned
    /// handle is the page master.
    #[allow(unsafe_code)] // mmap of a file we just created and sized
    pub fn create(name: &str, size: usize) -> Result<Self> {
        let path = backing_path(name);
        let file = OpenOptions::new().read(true).write(true).create(true).truncate(true).open(&path)?;
        file.set_len(size as u64)?;
        let map = unsafe { MmapMut::map_mut(&file) }?;
        tracing::trace!(page = name, size, "created shared page");
        Ok(Self { name: name.to_string(), path, map: Mapping::Rw(map), master: true })
    }

    /// Maps an existing page writable without claiming mastership, growing
    /// it to `min_size` when it is smaller. Used by slot writers.
    #[allow(unsafe_code)]
    pub fn open_rw(name: &str, min_size: usize) -> Result<Self> {
        let path = backing_path(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| map_open_error(name, &e))?;
        if file.metadata()?.len() < min_size as u64 {
            file.set_len(min_size as u64)?;
        }
        let map = unsafe { MmapMut::map_mut(&file) }?;
        Ok(Self { name: name.to_string(), path, map: Mapping::Rw(map), master: false })
    }

    /// Maps an existing page read-only. Fails with `NotFound` when no such
    /// page has been published.
    #[allow(unsafe_code)]
    pub fn open(name: &str) -> Result<Self> {
        let path = backing_path(name);
        let file = OpenOptions::new().read(true).open(&path).map_err(|e| map_open_error(name, &e))?;
        let map = unsafe { Mmap::map(&file) }?;
        Ok(Self { name: name.to_string(), path, map: Mapping::Ro(map), master: false })
    }

    /// Whether a page with this name currently exists.
    pub fn exists(name: &str) -> bool {
        backing_path(name).exists()
    }

    /// Removes the backing file for the named page, if any.
    pub fn unlink(name: &str) {
        let _ = std::fs::remove_file(backing_path(name));
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        match &self.map {
            Mapping::Rw(m) => m.len(),
            Mapping::Ro(m) => m.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Transfers or drops mastership. A non-master drop leaves the backing
    /// file in place.
    pub fn set_master(&mut self, master: bool) {
        self.master = master;
    }

    pub const fn is_master(&self) -> bool {
        self.master
    }

    pub fn bytes(&self) -> &[u8] {
        match &self.map {
            Mapping::Rw(m) => m,
            Mapping::Ro(m) => m,
        }
    }

    /// Mutable view of the page. Fails on read-only mappings.
    pub fn bytes_mut(&mut self) -> Result<&mut [u8]> {
        match &mut self.map {
            Mapping::Rw(m) => Ok(&mut m[..]),
            Mapping::Ro(_) => {
                Err(ManifoldError::Fatal(format!("page {} is mapped read-only", self.name)))
            },
        }
    }

    /// Publishes a length-prefixed payload on this page. The version byte
    /// is written last so readers never observe a half-written blob.
    pub fn write_blob(&mut self, payload: &[u8]) -> Result<()> {
        let needed = payload.len() + 5;
        if needed > self.len() {
            return Err(ManifoldError::Fatal(format!(
                "payload of {} bytes does not fit page {} ({} bytes)",
                payload.len(),
                self.name,
                self.len()
            )));
        }
        let len = u32::try_from(payload.len())
            .map_err(|_| ManifoldError::Fatal("blob payload exceeds u32".to_string()))?;
        let buf = self.bytes_mut()?;
        buf[1..5].copy_from_slice(&len.to_be_bytes());
        buf[5..5 + payload.len()].copy_from_slice(payload);
        buf[0] = 1;
        Ok(())
    }

    /// Reads a previously published blob. `None` when the page exists but
    /// nothing has been published yet.
    pub fn read_blob(&self) -> Result<Option<&[u8]>> {
        let buf = self.bytes();
        if buf.len() < 5 || buf[0] == 0 {
            return Ok(None);
        }
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&buf[1..5]);
        let len = u32::from_be_bytes(len_bytes) as usize;
        if 5 + len > buf.len() {
            return Err(ManifoldError::Corruption(format!(
                "blob length {} exceeds page {} size {}",
                len,
                self.name,
                buf.len()
            )));
        }
        Ok(Some(&buf[5..5 + len]))
    }
}

fn map_open_error(name: &str, e: &std::io::Error) -> ManifoldError {
    if e.kind() == std::io::ErrorKind::NotFound {
        ManifoldError::NotFound(format!("page {name}"))
    } else {
        ManifoldError::Fatal(format!("cannot map page {name}: {e}"))
    }
}

impl Drop for SharedPage {
    fn drop(&mut self) {
        if self.master {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

impl std::fmt::Debug for SharedPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedPage")
            .field("name", &self.name)
            .field("len", &self.len())
            .field("master", &self.master)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn unique(name: &str) -> String {
        format!("{}-{}-{}", name, std::process::id(), line!())
    }

    #[test]
    fn test_create_then_open() {
        let name = unique("MstTest@page");
        let mut master = SharedPage::create(&name, 64).unwrap();
        master.bytes_mut().unwrap()[0..4].copy_from_slice(b"abcd");

        let reader = SharedPage::open(&name).unwrap();
        assert_eq!(&reader.bytes()[0..4], b"abcd");
        assert_eq!(reader.len(), 64);

        drop(master);
        assert!(!SharedPage::exists(&name));
    }

    #[test]
    fn test_open_missing_is_not_found() {
        let err = SharedPage::open("MstTest@definitely-missing").unwrap_err();
        assert!(matches!(err, ManifoldError::NotFound(_)));
    }

    #[test]
    fn test_blob_round_trip() {
        let name = unique("MstTest@blob");
        let mut master = SharedPage::create(&name, 128).unwrap();
        assert!(master.read_blob().unwrap().is_none());

        master.write_blob(b"{\"live\":true}").unwrap();
        let reader = SharedPage::open(&name).unwrap();
        assert_eq!(reader.read_blob().unwrap().unwrap(), b"{\"live\":true}");
    }

    #[test]
    fn test_blob_too_large_rejected() {
        let name = unique("MstTest@small");
        let mut master = SharedPage::create(&name, 16).unwrap();
        assert!(master.write_blob(&[0u8; 32]).is_err());
    }

    #[test]
    fn test_non_master_drop_keeps_file() {
        let name = unique("MstTest@keep");
        let mut master = SharedPage::create(&name, 32).unwrap();
        master.set_master(false);
        drop(master);
        assert!(SharedPage::exists(&name));
        SharedPage::unlink(&name);
    }
}
