//! Rename, including rename over an existing destination.
//!
//! An existing destination is removed first through the unlink/rmdir paths,
//! each in its own transaction. The move itself is then one transaction that
//! deletes the old key and inserts the identical record under the new one.
//! A failure between the two steps leaves the destination removed; it is not
//! restored.

use tracing::debug;

use crate::codec::{CatalogKey, CatalogRecord};
use crate::error::{CatalogError, CatalogResult};
use crate::resolver::ResolvedEntry;
use crate::types::{Cnid, FileKind, ForkKind};
use crate::volume::Volume;

/// Upper bound on the ancestor walk; deeper trees are treated as corrupt.
const MAX_DEPTH: usize = 4096;

impl Volume {
    /// Renames `(src_parent, src_name)` to `(dst_parent, dst_name)`.
    pub fn rename(
        &self,
        src_parent: Cnid,
        src_name: &str,
        dst_parent: Cnid,
        dst_name: &str,
    ) -> CatalogResult<()> {
        let src_name = self.encode_name(src_parent, src_name)?;
        let dst_name = self.encode_new_name(dst_name)?;

        let mut vs = self.lock_structure();
        let src = self.lookup_name(src_parent, &src_name)?;
        self.check_renamable(&src)?;
        self.acquire_dir(dst_parent)?;

        let src_key = src.key();
        let dst_key = CatalogKey::new(dst_parent, dst_name.clone());

        if src_key == dst_key {
            let stored = self.store.first_from(&src_key)?.map(|(key, _)| key);
            if stored.map_or(false, |key| key.name.units() == dst_name.units()) {
                return Ok(());
            }
            debug!(%src_parent, from = %src_name, to = %dst_name, "case-only rename");
            return self.scoped("rename", || self.rename_cat(&src_key, &dst_key));
        }

        let existing = match self.lookup_name(dst_parent, &dst_name) {
            Ok(dst) => Some(dst),
            Err(CatalogError::NotFound { .. }) => None,
            Err(e) => return Err(e),
        };
        if let Some(dst) = &existing {
            if dst.resolved_id == src.resolved_id {
                debug!(cnid = %src.resolved_id, "rename onto another name of the same object");
                return Ok(());
            }
            self.check_renamable(dst)?;
            match (src.kind == FileKind::Directory, dst.kind == FileKind::Directory) {
                (true, false) => return Err(CatalogError::NotADirectory(dst.resolved_id)),
                (false, true) => return Err(CatalogError::IsADirectory(dst.resolved_id)),
                _ => {}
            }
        }
        if src.kind == FileKind::Directory {
            self.check_not_ancestor(src.resolved_id, dst_parent)?;
        }

        if let Some(dst) = &existing {
            debug!(dst = %dst.resolved_id, "removing rename destination");
            if dst.kind == FileKind::Directory {
                self.rmdir_locked(&mut vs, dst)?;
            } else {
                self.unlink_locked(&mut vs, dst)?;
            }
        }
        self.scoped("rename", || self.rename_cat(&src_key, &dst_key))?;
        debug!(cnid = %src.resolved_id, from = ?src_key, to = ?dst_key, "renamed");
        Ok(())
    }

    fn check_renamable(&self, entry: &ResolvedEntry) -> CatalogResult<()> {
        if entry.resolved_id == self.root()
            || Some(entry.resolved_id) == self.hidden_cnid()
            || entry.fork == ForkKind::Resource
        {
            return Err(CatalogError::PermissionDenied { op: "rename" });
        }
        Ok(())
    }

    /// Fails when `dir` is `target` or one of its ancestors.
    fn check_not_ancestor(&self, dir: Cnid, target: Cnid) -> CatalogResult<()> {
        let root = self.root();
        let mut cur = target;
        for _ in 0..MAX_DEPTH {
            if cur == dir {
                return Err(CatalogError::PermissionDenied { op: "rename" });
            }
            if cur == root {
                return Ok(());
            }
            cur = match self.read_record(&CatalogKey::thread(cur))? {
                Some(CatalogRecord::FolderThread(t)) => t.parent,
                _ => {
                    return Err(CatalogError::corrupt(format!(
                        "folder {} has no thread record",
                        cur
                    )))
                }
            };
        }
        Err(CatalogError::corrupt(format!(
            "folder {} is nested deeper than {}",
            target, MAX_DEPTH
        )))
    }
}
