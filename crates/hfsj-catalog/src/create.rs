//! Entry creation: files, folders, special nodes and symlinks.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::codec::CatalogKey;
use crate::error::{CatalogError, CatalogResult};
use crate::resolver::ResolvedEntry;
use crate::types::{Cnid, FileKind, S_IFDIR, S_IFLNK, S_IFMT, S_IFREG};
use crate::volume::Volume;

impl Volume {
    /// Creates a regular file.
    pub fn create(&self, parent: Cnid, name: &str, mode: u16) -> CatalogResult<ResolvedEntry> {
        self.make_node("create", parent, name, (mode & !S_IFMT) | S_IFREG, 0, None)
    }

    /// Creates a folder.
    ///
    /// Under the reserved hidden directory id nothing is created and
    /// `Ok(None)` is returned.
    pub fn mkdir(
        &self,
        parent: Cnid,
        name: &str,
        mode: u16,
    ) -> CatalogResult<Option<ResolvedEntry>> {
        if parent == self.reserved.hidden_dir() {
            debug!(%parent, name, "mkdir in hidden directory ignored");
            return Ok(None);
        }
        self.make_node("mkdir", parent, name, (mode & !S_IFMT) | S_IFDIR, 0, None)
            .map(Some)
    }

    /// Creates a file of the type given in `mode`'s type bits. `rdev` is kept
    /// for block and character devices only.
    pub fn mknod(
        &self,
        parent: Cnid,
        name: &str,
        mode: u16,
        rdev: u32,
    ) -> CatalogResult<ResolvedEntry> {
        let kind = FileKind::from_mode(mode);
        if kind == FileKind::Directory {
            return Err(CatalogError::PermissionDenied { op: "mknod" });
        }
        let rdev = if kind.has_rdev() { rdev } else { 0 };
        self.make_node("mknod", parent, name, (mode & !S_IFMT) | kind.mode_bits(), rdev, None)
    }

    /// Creates a symbolic link to `target`.
    pub fn symlink(&self, parent: Cnid, name: &str, target: &[u8]) -> CatalogResult<ResolvedEntry> {
        self.make_node("symlink", parent, name, S_IFLNK | 0o777, 0, Some(target))
    }

    /// Reads the target of a symbolic link.
    pub fn readlink(&self, entry: &ResolvedEntry) -> CatalogResult<Vec<u8>> {
        if entry.kind != FileKind::Symlink {
            return Err(CatalogError::PermissionDenied { op: "readlink" });
        }
        self.content.read_symlink(entry.resolved_id)
    }

    fn make_node(
        &self,
        tag: &'static str,
        parent: Cnid,
        name: &str,
        mode: u16,
        rdev: u32,
        target: Option<&[u8]>,
    ) -> CatalogResult<ResolvedEntry> {
        let name = self.encode_new_name(name)?;
        let kind = FileKind::from_mode(mode);
        let key = CatalogKey::new(parent, name.clone());

        let mut vs = self.lock_structure();
        self.acquire_dir(parent)?;
        if self.store.find(&key)?.is_some() {
            return Err(CatalogError::AlreadyExists {
                parent,
                name: name.display_lossy(),
            });
        }

        self.scoped(tag, || {
            let obj = self.new_object(&mut vs, kind, mode, rdev, key.clone())?;
            let inserted = match target {
                Some(target) => self.content.write_symlink(obj.cnid(), target),
                None => Ok(()),
            }
            .and_then(|()| self.create_cat(obj.cnid(), parent, &name, &obj));

            if let Err(e) = inserted {
                let mut st = obj.state.lock();
                st.nlink = 0;
                if let Err(cleanup) = self.delete_object(&mut vs, &obj, &mut st) {
                    warn!(cnid = %obj.cnid(), error = %cleanup, "failed to release object");
                }
                return Err(e);
            }
            debug!(cnid = %obj.cnid(), %parent, ?kind, "entry created");
            Ok(ResolvedEntry::direct(parent, name.clone(), Arc::clone(&obj)))
        })
    }
}
