//! Fork content behind catalog objects.
//!
//! The catalog engine only touches content for symlink targets and for
//! truncating the data of deleted objects.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use dashmap::DashMap;

use crate::error::CatalogResult;
use crate::types::Cnid;

/// Storage for object content keyed by object id.
pub trait ContentStore: Send + Sync {
    /// Stores a symlink target for `cnid`.
    fn write_symlink(&self, cnid: Cnid, target: &[u8]) -> CatalogResult<()>;

    /// Reads back a symlink target; empty when none was stored.
    fn read_symlink(&self, cnid: Cnid) -> CatalogResult<Vec<u8>>;

    /// Drops all content of `cnid`.
    fn truncate(&self, cnid: Cnid) -> CatalogResult<()>;
}

/// In-memory content store.
#[derive(Default)]
pub struct MemoryContentStore {
    data: DashMap<Cnid, Vec<u8>>,
}

impl MemoryContentStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of objects with stored content.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True when no object has content.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl ContentStore for MemoryContentStore {
    fn write_symlink(&self, cnid: Cnid, target: &[u8]) -> CatalogResult<()> {
        self.data.insert(cnid, target.to_vec());
        Ok(())
    }

    fn read_symlink(&self, cnid: Cnid) -> CatalogResult<Vec<u8>> {
        Ok(self.data.get(&cnid).map(|v| v.clone()).unwrap_or_default())
    }

    fn truncate(&self, cnid: Cnid) -> CatalogResult<()> {
        self.data.remove(&cnid);
        Ok(())
    }
}

/// Content store keeping one file per object under a directory.
pub struct DirContentStore {
    root: PathBuf,
}

impl DirContentStore {
    /// Opens or creates the store directory.
    pub fn open(root: &Path) -> CatalogResult<Self> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn path(&self, cnid: Cnid) -> PathBuf {
        self.root.join(format!("{:08x}", cnid.as_u32()))
    }
}

impl ContentStore for DirContentStore {
    fn write_symlink(&self, cnid: Cnid, target: &[u8]) -> CatalogResult<()> {
        fs::write(self.path(cnid), target)?;
        Ok(())
    }

    fn read_symlink(&self, cnid: Cnid) -> CatalogResult<Vec<u8>> {
        match fs::read(self.path(cnid)) {
            Ok(v) => Ok(v),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn truncate(&self, cnid: Cnid) -> CatalogResult<()> {
        match fs::remove_file(self.path(cnid)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
