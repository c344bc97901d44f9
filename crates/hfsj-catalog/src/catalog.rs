//! Catalog record primitives: building records from objects and the
//! insert / delete / move operations that keep folder valence, thread records
//! and open enumeration cursors in step with the store.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::codec::{
    CatalogKey, CatalogRecord, FileRecord, FolderRecord, ThreadRecord, HARDLINK_TYPE,
    HFSPLUS_CREATOR, SYMLINK_CREATOR, SYMLINK_TYPE,
};
use crate::error::{CatalogError, CatalogResult};
use crate::object::{Object, ObjectState};
use crate::types::{Cnid, FileKind, HfsDate};
use crate::unicode::HfsName;
use crate::volume::Volume;

impl Volume {
    /// Reads and decodes the record at `key`.
    pub fn read_record(&self, key: &CatalogKey) -> CatalogResult<Option<CatalogRecord>> {
        self.store
            .find(key)?
            .map(|bytes| CatalogRecord::decode(&bytes))
            .transpose()
    }

    /// Reads the record at `key` together with the key as stored, which
    /// carries the stored spelling of the name.
    pub(crate) fn read_entry(
        &self,
        key: &CatalogKey,
    ) -> CatalogResult<Option<(CatalogKey, CatalogRecord)>> {
        match self.store.first_from(key)? {
            Some((stored, bytes)) if stored == *key => {
                Ok(Some((stored, CatalogRecord::decode(&bytes)?)))
            }
            _ => Ok(None),
        }
    }

    /// True when `file` is a hard-link pointer on this volume.
    pub(crate) fn is_pointer(&self, file: &FileRecord) -> bool {
        match self.hidden {
            Some(hidden) => {
                file.has_hardlink_signature()
                    && (file.create_date == hidden.create_date
                        || file.create_date == self.root_create_date)
            }
            None => false,
        }
    }

    /// Builds the record stored for entry `cnid` naming `obj`.
    ///
    /// An entry id different from the object id makes a pointer record.
    pub(crate) fn build_record(&self, cnid: Cnid, obj: &Object, st: &ObjectState) -> CatalogRecord {
        if obj.kind() == FileKind::Directory {
            let mut folder = FolderRecord::new(cnid, st.create_date, st.mode);
            folder.valence = st.valence;
            folder.attribute_mod_date = st.ctime;
            return CatalogRecord::Folder(folder);
        }

        let mut file = FileRecord::new(cnid, st.create_date, st.mode);
        file.attribute_mod_date = st.ctime;
        if cnid != obj.cnid() {
            let sentinel = self
                .hidden
                .map(|h| h.create_date)
                .unwrap_or(self.root_create_date);
            file.user_info.file_type = HARDLINK_TYPE;
            file.user_info.creator = HFSPLUS_CREATOR;
            file.create_date = sentinel;
            file.content_mod_date = sentinel;
            file.permissions.special = st.link_id;
            return CatalogRecord::File(file);
        }
        match obj.kind() {
            FileKind::Symlink => {
                file.user_info.file_type = SYMLINK_TYPE;
                file.user_info.creator = SYMLINK_CREATOR;
            }
            kind if kind.has_rdev() => file.permissions.special = st.rdev,
            _ if st.link_id != 0 => file.permissions.special = st.nlink,
            _ => {}
        }
        CatalogRecord::File(file)
    }

    /// Inserts entry `cnid` for `obj` as `name` in `dir`.
    ///
    /// Folders get their thread record first; it is removed again if the
    /// entry insert fails.
    pub(crate) fn create_cat(
        &self,
        cnid: Cnid,
        dir: Cnid,
        name: &HfsName,
        obj: &Object,
    ) -> CatalogResult<()> {
        let dir_obj = self.acquire_dir(dir)?;
        let key = CatalogKey::new(dir, name.clone());
        let record = {
            let st = obj.state.lock();
            self.build_record(cnid, obj, &st)
        };

        let mut dst = dir_obj.state.lock();
        if self.store.find(&key)?.is_some() {
            return Err(CatalogError::AlreadyExists {
                parent: dir,
                name: name.display_lossy(),
            });
        }
        let thread_key = CatalogKey::thread(cnid);
        let is_folder = matches!(record, CatalogRecord::Folder(_));
        if is_folder {
            let thread = CatalogRecord::FolderThread(ThreadRecord {
                parent: dir,
                name: name.clone(),
            });
            self.store.insert(&thread_key, &thread.encode())?;
        }
        if let Err(e) = self.store.insert(&key, &record.encode()) {
            if is_folder {
                if let Err(cleanup) = self.store.delete(&thread_key) {
                    warn!(%cnid, error = %cleanup, "failed to remove thread after insert failure");
                }
            }
            return Err(e);
        }

        dst.valence += 1;
        dst.ctime = HfsDate::now();
        adjust_cursors(&dst, &key, 1);
        self.persist(&dir_obj, &dst)?;
        debug!(%cnid, %dir, name = %name, "catalog entry created");
        Ok(())
    }

    /// Deletes the entry `name` in `dir`, plus the thread of a folder entry.
    pub(crate) fn delete_cat(&self, dir: Cnid, name: &HfsName) -> CatalogResult<CatalogRecord> {
        let dir_obj = self.acquire_dir(dir)?;
        let key = CatalogKey::new(dir, name.clone());

        let mut st = dir_obj.state.lock();
        let record = self.read_record(&key)?.ok_or_else(|| CatalogError::NotFound {
            parent: dir,
            name: name.display_lossy(),
        })?;
        if let CatalogRecord::Folder(f) = &record {
            let thread_key = CatalogKey::thread(f.id);
            match self.store.delete(&thread_key) {
                Ok(()) => {}
                Err(CatalogError::NotFound { .. }) => {
                    warn!(cnid = %f.id, "folder had no thread record")
                }
                Err(e) => return Err(e),
            }
        }
        self.store.delete(&key)?;

        st.valence = st.valence.saturating_sub(1);
        st.ctime = HfsDate::now();
        adjust_cursors(&st, &key, -1);
        self.persist(&dir_obj, &st)?;
        debug!(%dir, name = %name, "catalog entry deleted");
        Ok(record)
    }

    /// Moves the record at `src` to `dst`, replacing the thread of a folder
    /// and updating the cached object's home.
    ///
    /// `dst` may be collation-equal to `src` (a case-only rename). Otherwise
    /// an occupied `dst` fails with `AlreadyExists` before anything changes.
    /// A failure after the delete leaves the record gone.
    pub(crate) fn rename_cat(&self, src: &CatalogKey, dst: &CatalogKey) -> CatalogResult<()> {
        let src_dir = self.acquire_dir(src.parent)?;
        let dst_dir = self.acquire_dir(dst.parent)?;
        let bytes = self.store.find(src)?.ok_or_else(|| CatalogError::NotFound {
            parent: src.parent,
            name: src.name.display_lossy(),
        })?;
        if src != dst && self.store.find(dst)?.is_some() {
            return Err(CatalogError::AlreadyExists {
                parent: dst.parent,
                name: dst.name.display_lossy(),
            });
        }
        let record = CatalogRecord::decode(&bytes)?;

        {
            let mut st = src_dir.state.lock();
            self.store.delete(src)?;
            st.valence = st.valence.saturating_sub(1);
            st.ctime = HfsDate::now();
            adjust_cursors(&st, src, -1);
            self.persist(&src_dir, &st)?;
        }
        {
            let mut st = dst_dir.state.lock();
            if let Err(e) = self.store.insert(dst, &bytes) {
                warn!(from = ?src, to = ?dst, error = %e, "rename lost its source record");
                return Err(e);
            }
            st.valence += 1;
            st.ctime = HfsDate::now();
            adjust_cursors(&st, dst, 1);
            self.persist(&dst_dir, &st)?;
        }

        if let CatalogRecord::Folder(f) = &record {
            let thread_key = CatalogKey::thread(f.id);
            let thread = CatalogRecord::FolderThread(ThreadRecord {
                parent: dst.parent,
                name: dst.name.clone(),
            })
            .encode();
            match self.store.replace(&thread_key, &thread) {
                Err(CatalogError::NotFound { .. }) => self.store.insert(&thread_key, &thread)?,
                other => other?,
            }
        }
        if let Some(obj) = record.id().and_then(|id| self.objects.get(id)) {
            let mut st = obj.state.lock();
            if st.home == *src {
                st.home = dst.clone();
            }
        }
        debug!(from = ?src, to = ?dst, "catalog entry moved");
        Ok(())
    }

    /// Writes the in-core metadata of `obj` back to its own record.
    pub(crate) fn persist(&self, obj: &Object, st: &ObjectState) -> CatalogResult<()> {
        if st.deleted {
            return Ok(());
        }
        let record = self.read_record(&st.home)?.ok_or_else(|| {
            CatalogError::corrupt(format!("record of {} missing at {:?}", obj.cnid(), st.home))
        })?;
        let updated = match record {
            CatalogRecord::Folder(mut f) if f.id == obj.cnid() => {
                f.valence = st.valence;
                f.attribute_mod_date = st.ctime;
                f.permissions.mode = st.mode;
                CatalogRecord::Folder(f)
            }
            CatalogRecord::File(mut f) if f.id == obj.cnid() => {
                f.attribute_mod_date = st.ctime;
                f.permissions.mode = st.mode;
                if st.link_id != 0 {
                    f.permissions.special = st.nlink;
                } else if obj.kind().has_rdev() {
                    f.permissions.special = st.rdev;
                }
                CatalogRecord::File(f)
            }
            other => {
                return Err(CatalogError::corrupt(format!(
                    "record at {:?} does not belong to {}: {:?}",
                    st.home,
                    obj.cnid(),
                    other.id()
                )))
            }
        };
        self.store.replace(&st.home, &updated.encode())
    }

    /// Journalled dirty mark: stamps ctime and persists.
    pub(crate) fn touch(&self, obj: &Arc<Object>, st: &mut ObjectState) -> CatalogResult<()> {
        st.ctime = HfsDate::now();
        self.persist(obj, st)
    }
}

/// Shifts the position of every cursor of a directory that has already
/// passed `changed`, so that the valence-based end check stays exact.
fn adjust_cursors(dir: &ObjectState, changed: &CatalogKey, delta: i64) {
    for cursor in dir.cursors.iter().filter_map(|c| c.upgrade()) {
        let mut cs = cursor.lock();
        let passed = cs.last_key.as_ref().map_or(false, |last| last >= changed);
        if passed {
            cs.position = if delta < 0 {
                cs.position.saturating_sub(delta.unsigned_abs())
            } else {
                cs.position + delta as u64
            };
        }
    }
}
