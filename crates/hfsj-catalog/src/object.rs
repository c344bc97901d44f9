//! In-core objects and their lifecycle.
//!
//! An [`Object`] is the cached state of one catalog object: link and open
//! counts, the indirection link id, deletion marks and the list of open
//! directory cursors. Objects are created on first lookup or creation and
//! leave the table when their catalog record is deleted.

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::codec::{CatalogKey, CatalogRecord};
use crate::error::{CatalogError, CatalogResult};
use crate::readdir::CursorState;
use crate::resolver::ResolvedEntry;
use crate::types::{Cnid, FileKind, ForkKind, HfsDate, S_IFDIR, S_IFMT, S_IFREG};
use crate::volume::{Volume, VolumeState};

/// Mutable per-object state, guarded by the object lock.
#[derive(Debug)]
pub(crate) struct ObjectState {
    pub(crate) nlink: u32,
    pub(crate) open_count: u32,
    /// Non-zero once the object lives in the hidden directory as `iNode<link_id>`.
    pub(crate) link_id: u32,
    /// Unlinked while open; deleted on last release.
    pub(crate) dead: bool,
    /// Catalog record gone; the object is no longer in the table.
    pub(crate) deleted: bool,
    pub(crate) mode: u16,
    pub(crate) rdev: u32,
    pub(crate) ctime: HfsDate,
    pub(crate) create_date: HfsDate,
    pub(crate) valence: u32,
    /// Key of the object's own record.
    pub(crate) home: CatalogKey,
    pub(crate) cursors: Vec<Weak<Mutex<CursorState>>>,
}

/// A cached catalog object.
#[derive(Debug)]
pub struct Object {
    cnid: Cnid,
    kind: FileKind,
    pub(crate) state: Mutex<ObjectState>,
}

/// Parses the link id out of an `iNode<id>` name.
pub(crate) fn parse_indirect_name(key: &CatalogKey) -> Option<u32> {
    String::from_utf16(key.name.units())
        .ok()?
        .strip_prefix("iNode")?
        .parse()
        .ok()
}

impl Object {
    pub(crate) fn new(cnid: Cnid, kind: FileKind, mode: u16, rdev: u32, home: CatalogKey) -> Self {
        let now = HfsDate::now();
        Self {
            cnid,
            kind,
            state: Mutex::new(ObjectState {
                nlink: 1,
                open_count: 0,
                link_id: 0,
                dead: false,
                deleted: false,
                mode,
                rdev,
                ctime: now,
                create_date: now,
                valence: 0,
                home,
                cursors: Vec::new(),
            }),
        }
    }

    /// Builds the in-core object for a folder or file record stored at `key`.
    pub(crate) fn from_record(
        key: &CatalogKey,
        record: &CatalogRecord,
        hidden: Option<Cnid>,
    ) -> Option<Self> {
        match record {
            CatalogRecord::Folder(f) => {
                let mut mode = f.permissions.mode;
                if mode & S_IFMT == 0 {
                    mode |= S_IFDIR;
                }
                let obj = Object::new(f.id, FileKind::Directory, mode, 0, key.clone());
                {
                    let mut st = obj.state.lock();
                    st.valence = f.valence;
                    st.ctime = f.attribute_mod_date;
                    st.create_date = f.create_date;
                }
                Some(obj)
            }
            CatalogRecord::File(f) => {
                let mut mode = f.permissions.mode;
                if mode & S_IFMT == 0 {
                    mode |= S_IFREG;
                }
                let kind = FileKind::from_mode(mode);
                let rdev = if kind.has_rdev() { f.permissions.special } else { 0 };
                let obj = Object::new(f.id, kind, mode, rdev, key.clone());
                {
                    let mut st = obj.state.lock();
                    st.ctime = f.attribute_mod_date;
                    st.create_date = f.create_date;
                    if hidden == Some(key.parent) && !f.has_hardlink_signature() {
                        if let Some(link_id) = parse_indirect_name(key) {
                            st.link_id = link_id;
                            st.nlink = f.permissions.special.max(1);
                        }
                    }
                }
                Some(obj)
            }
            CatalogRecord::FolderThread(_) => None,
        }
    }

    /// Object id.
    pub fn cnid(&self) -> Cnid {
        self.cnid
    }

    /// Object kind.
    pub fn kind(&self) -> FileKind {
        self.kind
    }

    /// Current link count.
    pub fn nlink(&self) -> u32 {
        self.state.lock().nlink
    }

    /// Number of open handles.
    pub fn open_count(&self) -> u32 {
        self.state.lock().open_count
    }

    /// Indirection link id, 0 when the object is not indirected.
    pub fn link_id(&self) -> u32 {
        self.state.lock().link_id
    }

    /// True when unlinked while open.
    pub fn is_dead(&self) -> bool {
        self.state.lock().dead
    }

    /// True once the catalog record has been deleted.
    pub fn is_deleted(&self) -> bool {
        self.state.lock().deleted
    }

    /// BSD mode.
    pub fn mode(&self) -> u16 {
        self.state.lock().mode
    }

    /// Device number of block and character devices.
    pub fn rdev(&self) -> u32 {
        self.state.lock().rdev
    }

    /// Attribute change time.
    pub fn ctime(&self) -> HfsDate {
        self.state.lock().ctime
    }

    /// Number of children of a folder.
    pub fn valence(&self) -> u32 {
        self.state.lock().valence
    }

    /// Key of the object's own catalog record.
    pub fn home(&self) -> CatalogKey {
        self.state.lock().home.clone()
    }

    /// Number of live enumeration cursors registered on this directory.
    pub fn open_cursors(&self) -> usize {
        self.state
            .lock()
            .cursors
            .iter()
            .filter(|c| c.strong_count() > 0)
            .count()
    }
}

/// In-core object table keyed by object id.
#[derive(Default)]
pub(crate) struct ObjectTable {
    objects: DashMap<Cnid, Arc<Object>>,
}

impl ObjectTable {
    pub(crate) fn get(&self, cnid: Cnid) -> Option<Arc<Object>> {
        self.objects.get(&cnid).map(|o| Arc::clone(o.value()))
    }

    /// Returns the cached object, inserting `obj` if none is cached yet.
    pub(crate) fn get_or_insert(&self, obj: Object) -> Arc<Object> {
        Arc::clone(
            self.objects
                .entry(obj.cnid)
                .or_insert_with(|| Arc::new(obj))
                .value(),
        )
    }

    pub(crate) fn remove(&self, cnid: Cnid) {
        self.objects.remove(&cnid);
    }

    pub(crate) fn len(&self) -> usize {
        self.objects.len()
    }
}

/// An open handle on an object. Hand it back through [`Volume::release`].
#[derive(Debug)]
pub struct OpenHandle {
    object: Arc<Object>,
    fork: ForkKind,
}

impl OpenHandle {
    /// The opened object.
    pub fn object(&self) -> &Arc<Object> {
        &self.object
    }

    /// The opened fork.
    pub fn fork(&self) -> ForkKind {
        self.fork
    }
}

impl Volume {
    /// Allocates an id and creates the in-core object for a new catalog entry.
    pub(crate) fn new_object(
        &self,
        vs: &mut VolumeState,
        kind: FileKind,
        mode: u16,
        rdev: u32,
        home: CatalogKey,
    ) -> CatalogResult<Arc<Object>> {
        let cnid = vs.alloc_cnid()?;
        match kind {
            FileKind::Directory => vs.folder_count += 1,
            _ => vs.file_count += 1,
        }
        debug!(%cnid, ?kind, "new object");
        Ok(self
            .objects
            .get_or_insert(Object::new(cnid, kind, mode, rdev, home)))
    }

    /// Drops an object whose catalog record is gone: counters, content and
    /// the table entry.
    pub(crate) fn delete_object(
        &self,
        vs: &mut VolumeState,
        obj: &Object,
        st: &mut ObjectState,
    ) -> CatalogResult<()> {
        if st.deleted {
            return Ok(());
        }
        match obj.kind {
            FileKind::Directory => vs.folder_count = vs.folder_count.saturating_sub(1),
            kind => {
                vs.file_count = vs.file_count.saturating_sub(1);
                if (kind == FileKind::Regular && st.nlink == 0) || kind == FileKind::Symlink {
                    self.content.truncate(obj.cnid)?;
                }
            }
        }
        st.deleted = true;
        self.objects.remove(obj.cnid);
        debug!(cnid = %obj.cnid, "object deleted");
        Ok(())
    }

    /// Instantiates the object for a record read at `key`, reusing the cached
    /// object when there is one.
    pub(crate) fn instantiate(
        &self,
        key: &CatalogKey,
        record: &CatalogRecord,
    ) -> CatalogResult<Arc<Object>> {
        let cnid = record
            .id()
            .ok_or_else(|| CatalogError::corrupt(format!("thread record at {:?}", key)))?;
        if let Some(obj) = self.objects.get(cnid) {
            return Ok(obj);
        }
        let obj = Object::from_record(key, record, self.hidden_cnid())
            .ok_or_else(|| CatalogError::corrupt(format!("no object for record at {:?}", key)))?;
        Ok(self.objects.get_or_insert(obj))
    }

    /// Returns the object for `cnid`.
    ///
    /// Folders are found through their thread record; files are reachable
    /// only once a lookup has cached them.
    pub fn acquire(&self, cnid: Cnid) -> CatalogResult<Arc<Object>> {
        if let Some(obj) = self.objects.get(cnid) {
            return Ok(obj);
        }
        let thread = match self.read_record(&CatalogKey::thread(cnid))? {
            Some(CatalogRecord::FolderThread(t)) => t,
            Some(_) => {
                return Err(CatalogError::corrupt(format!(
                    "record at thread key of {} is not a thread",
                    cnid
                )))
            }
            None => return Err(CatalogError::ObjectNotFound(cnid)),
        };
        let key = thread.target_key();
        match self.read_record(&key)? {
            Some(record @ CatalogRecord::Folder(_)) if record.id() == Some(cnid) => {
                self.instantiate(&key, &record)
            }
            _ => Err(CatalogError::corrupt(format!(
                "thread of {} points at {:?}, which is not its folder record",
                cnid, key
            ))),
        }
    }

    /// Like [`Volume::acquire`] but requires a directory.
    pub(crate) fn acquire_dir(&self, cnid: Cnid) -> CatalogResult<Arc<Object>> {
        let obj = self.acquire(cnid)?;
        if obj.kind != FileKind::Directory {
            return Err(CatalogError::NotADirectory(cnid));
        }
        Ok(obj)
    }

    /// Opens the object behind a resolved entry.
    pub fn open(&self, entry: &ResolvedEntry) -> OpenHandle {
        let mut st = entry.object.state.lock();
        st.open_count += 1;
        debug!(cnid = %entry.object.cnid, open = st.open_count, "open");
        OpenHandle {
            object: Arc::clone(&entry.object),
            fork: entry.fork,
        }
    }

    /// Closes a handle. The last close of an unlinked object deletes its
    /// remaining record from the hidden directory.
    pub fn release(&self, handle: OpenHandle) -> CatalogResult<()> {
        let obj = handle.object;
        let reap = {
            let mut st = obj.state.lock();
            st.open_count = st.open_count.saturating_sub(1);
            st.open_count == 0 && st.dead && st.nlink == 0 && !st.deleted
        };
        if !reap {
            return Ok(());
        }

        let mut vs = self.lock_structure();
        self.scoped("release", || {
            let home = {
                let st = obj.state.lock();
                if st.open_count != 0 || st.deleted {
                    return Ok(());
                }
                st.home.clone()
            };
            debug!(cnid = %obj.cnid, ?home, "reaping unlinked object");
            self.delete_cat(home.parent, &home.name)?;
            let mut st = obj.state.lock();
            self.delete_object(&mut vs, &obj, &mut st)
        })
    }
}
