//! Directory enumeration with key-based, resumable cursors.
//!
//! A session emits `.` and `..`, then walks the catalog records whose parent
//! is the directory, in key order. The cursor keeps the last emitted key and
//! re-seeks past it on every step, so entries inserted or removed elsewhere in
//! the directory never cause repeats. The position counter is compared against
//! the directory valence to detect the end; catalog inserts and deletes behind
//! the cursor shift it to keep that comparison exact.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::codec::{CatalogKey, CatalogRecord};
use crate::error::{CatalogError, CatalogResult};
use crate::object::Object;
use crate::types::{Cnid, FileKind};
use crate::volume::Volume;

/// Enumeration state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnumState {
    /// Session allocated, thread not yet validated.
    Created,
    /// Thread validated; nothing emitted yet.
    Seeking,
    /// At least one entry emitted.
    Emitting,
    /// End of directory reached.
    Exhausted,
    /// A corrupt record or store error stopped the walk.
    Failed,
}

/// Cursor shared between a session and its directory's cursor list.
#[derive(Debug)]
pub(crate) struct CursorState {
    pub(crate) position: u64,
    pub(crate) last_key: Option<CatalogKey>,
    pub(crate) parent: Cnid,
    pub(crate) state: EnumState,
}

/// One emitted directory entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    /// Display name.
    pub name: String,
    /// Entry id. For hard-link pointers this is the pointer's own id.
    pub cnid: Cnid,
    /// Entry kind.
    pub kind: FileKind,
    /// Position of the entry in the enumeration.
    pub position: u64,
}

/// An open enumeration of one directory.
///
/// The cursor is registered on the directory object while the session lives;
/// dropping the session unregisters it.
pub struct DirSession {
    dir: Arc<Object>,
    cursor: Arc<Mutex<CursorState>>,
}

impl DirSession {
    /// The directory being enumerated.
    pub fn dir(&self) -> Cnid {
        self.dir.cnid()
    }

    /// Position of the next entry.
    pub fn position(&self) -> u64 {
        self.cursor.lock().position
    }

    /// Current state.
    pub fn state(&self) -> EnumState {
        self.cursor.lock().state
    }
}

impl Drop for DirSession {
    fn drop(&mut self) {
        let mut st = self.dir.state.lock();
        st.cursors.retain(|c| match c.upgrade() {
            Some(c) => !Arc::ptr_eq(&c, &self.cursor),
            None => false,
        });
    }
}

impl Volume {
    /// Opens an enumeration session on `dir`, validating its thread record.
    pub fn opendir(&self, dir: Cnid) -> CatalogResult<DirSession> {
        let obj = self.acquire_dir(dir)?;
        let cursor = Arc::new(Mutex::new(CursorState {
            position: 0,
            last_key: None,
            parent: Cnid::new(0),
            state: EnumState::Created,
        }));

        let thread = match self.read_record(&CatalogKey::thread(dir))? {
            Some(CatalogRecord::FolderThread(t)) => t,
            _ => return Err(CatalogError::corrupt(format!("bad folder thread for {}", dir))),
        };
        {
            let mut cs = cursor.lock();
            cs.parent = thread.parent;
            cs.state = EnumState::Seeking;
        }
        obj.state.lock().cursors.push(Arc::downgrade(&cursor));
        debug!(%dir, "opendir");
        Ok(DirSession { dir: obj, cursor })
    }

    /// Emits the next entry, or `None` at the end.
    pub fn next_entry(&self, session: &mut DirSession) -> CatalogResult<Option<DirEntry>> {
        let dir = &session.dir;
        let st = dir.state.lock();
        let mut cs = session.cursor.lock();
        match cs.state {
            EnumState::Exhausted | EnumState::Failed => return Ok(None),
            _ => cs.state = EnumState::Emitting,
        }

        match cs.position {
            0 => {
                cs.position = 1;
                return Ok(Some(DirEntry {
                    name: ".".to_string(),
                    cnid: dir.cnid(),
                    kind: FileKind::Directory,
                    position: 0,
                }));
            }
            1 => {
                cs.position = 2;
                cs.last_key = Some(CatalogKey::thread(dir.cnid()));
                return Ok(Some(DirEntry {
                    name: "..".to_string(),
                    cnid: cs.parent,
                    kind: FileKind::Directory,
                    position: 1,
                }));
            }
            _ => {}
        }

        let end = u64::from(st.valence) + 2;
        let hidden = self.hidden_cnid();
        loop {
            if cs.position >= end {
                cs.state = EnumState::Exhausted;
                return Ok(None);
            }
            let last = cs
                .last_key
                .clone()
                .unwrap_or_else(|| CatalogKey::thread(dir.cnid()));
            let next = match self.store.next_after(&last) {
                Ok(next) => next,
                Err(e) => {
                    cs.state = EnumState::Failed;
                    return Err(e);
                }
            };
            let (key, bytes) = match next {
                Some((key, bytes)) if key.parent == dir.cnid() => (key, bytes),
                _ => {
                    warn!(
                        dir = %dir.cnid(),
                        position = cs.position,
                        valence = st.valence,
                        "walked past end of directory"
                    );
                    cs.state = EnumState::Exhausted;
                    return Ok(None);
                }
            };

            let decoded = CatalogRecord::decode(&bytes).and_then(|record| match record {
                CatalogRecord::Folder(f) => Ok((f.id, FileKind::Directory)),
                CatalogRecord::File(f) => Ok((f.id, FileKind::from_mode(f.permissions.mode))),
                CatalogRecord::FolderThread(_) => Err(CatalogError::corrupt(format!(
                    "thread record inside directory {} at {:?}",
                    dir.cnid(),
                    key
                ))),
            });
            let (cnid, kind) = match decoded {
                Ok(v) => v,
                Err(e) => {
                    cs.state = EnumState::Failed;
                    return Err(e);
                }
            };
            if kind == FileKind::Directory && Some(cnid) == hidden {
                cs.last_key = Some(key);
                continue;
            }
            let name = match self.codec.decode_name(&key.name) {
                Ok(name) => name,
                Err(e) => {
                    cs.state = EnumState::Failed;
                    return Err(e);
                }
            };

            let position = cs.position;
            cs.position += 1;
            cs.last_key = Some(key);
            return Ok(Some(DirEntry {
                name,
                cnid,
                kind,
                position,
            }));
        }
    }

    /// Emits up to `max` entries.
    pub fn readdir(&self, session: &mut DirSession, max: usize) -> CatalogResult<Vec<DirEntry>> {
        let mut entries = Vec::new();
        while entries.len() < max {
            match self.next_entry(session)? {
                Some(entry) => entries.push(entry),
                None => break,
            }
        }
        Ok(entries)
    }

    /// Directory-release hook: unregisters and frees the session's cursor.
    pub fn releasedir(&self, session: DirSession) {
        debug!(dir = %session.dir(), position = session.position(), "releasedir");
        drop(session);
    }
}
