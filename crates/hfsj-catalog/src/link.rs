//! Hard links, unlink and rmdir.
//!
//! The first `link` of a file promotes it: its record moves into the hidden
//! directory as `iNode<link_id>` and the original name is recreated as a
//! pointer record. Every further name is another pointer. The object keeps
//! its id throughout; pointers get ids of their own.
//!
//! A promotion that fails after the move is undone on a best-effort basis.
//! Whatever is left behind is reported by [`crate::fsck`].

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::codec::CatalogKey;
use crate::error::{CatalogError, CatalogResult};
use crate::object::Object;
use crate::resolver::ResolvedEntry;
use crate::types::{Cnid, FileKind, ForkKind, HfsDate};
use crate::unicode::HfsName;
use crate::volume::{Volume, VolumeState};

/// Link ids are kept to 30 bits.
pub const LINK_ID_MASK: u32 = 0x3fff_ffff;

/// Source of candidate link ids for promotion.
pub trait LinkIdSource: Send {
    /// Next candidate. Collisions are retried by the caller.
    fn next_id(&mut self) -> u32;
}

/// Draws link ids from the thread-local RNG.
#[derive(Clone, Copy, Debug, Default)]
pub struct RandomLinkIds;

impl LinkIdSource for RandomLinkIds {
    fn next_id(&mut self) -> u32 {
        rand::random::<u32>()
    }
}

/// Hands out a fixed sequence of ids, then repeats `fallback`.
#[derive(Clone, Debug)]
pub struct ScriptedLinkIds {
    queue: VecDeque<u32>,
    fallback: u32,
}

impl ScriptedLinkIds {
    /// Yields `ids` in order, then `fallback` forever.
    pub fn new(ids: impl IntoIterator<Item = u32>, fallback: u32) -> Self {
        Self {
            queue: ids.into_iter().collect(),
            fallback,
        }
    }
}

impl LinkIdSource for ScriptedLinkIds {
    fn next_id(&mut self) -> u32 {
        self.queue.pop_front().unwrap_or(self.fallback)
    }
}

/// Name of the indirection node for `link_id`.
pub fn indirect_node_name(link_id: u32) -> String {
    format!("iNode{}", link_id)
}

/// Name an open file is parked under after its last name is unlinked.
pub fn temp_node_name(cnid: Cnid) -> String {
    format!("temp{}", cnid.as_u32())
}

impl Volume {
    fn hidden_key(&self, op: &'static str, name: &str) -> CatalogResult<CatalogKey> {
        let hidden = self
            .hidden_cnid()
            .ok_or(CatalogError::PermissionDenied { op })?;
        Ok(CatalogKey::new(hidden, HfsName::from_raw_str(name)?))
    }

    /// Adds `dst_name` in `dst_parent` as another name for `src`.
    ///
    /// On promotion `src` is updated in place to describe the pointer that
    /// now stands under its name.
    pub fn link(
        &self,
        src: &mut ResolvedEntry,
        dst_parent: Cnid,
        dst_name: &str,
    ) -> CatalogResult<ResolvedEntry> {
        if src.fork == ForkKind::Resource || src.kind != FileKind::Regular {
            return Err(CatalogError::PermissionDenied { op: "link" });
        }
        if src.is_pointer() && src.object.link_id() == 0 {
            return Err(CatalogError::corrupt(format!(
                "{:?} points at {}, which is not an indirection node",
                src.key(),
                src.resolved_id
            )));
        }
        self.hidden_cnid()
            .ok_or(CatalogError::PermissionDenied { op: "link" })?;
        let dst_name = self.encode_new_name(dst_name)?;
        let dst_key = CatalogKey::new(dst_parent, dst_name.clone());
        let obj = Arc::clone(&src.object);

        let mut vs = self.lock_structure();
        self.acquire_dir(dst_parent)?;
        if self.store.find(&dst_key)?.is_some() {
            return Err(CatalogError::AlreadyExists {
                parent: dst_parent,
                name: dst_name.display_lossy(),
            });
        }
        if obj.is_deleted() {
            return Err(CatalogError::ObjectNotFound(obj.cnid()));
        }

        self.scoped("link", || {
            let promoted = obj.link_id() == 0;
            if promoted {
                self.promote(&mut vs, src)?;
            }

            let inserted = vs.alloc_cnid().and_then(|id| {
                self.create_cat(id, dst_parent, &dst_name, &obj)
                    .map(|()| id)
            });
            let entry_id = match inserted {
                Ok(id) => id,
                Err(e) => {
                    if promoted {
                        self.demote(&mut vs, src);
                    }
                    return Err(e);
                }
            };
            {
                let mut st = obj.state.lock();
                st.nlink += 1;
                self.touch(&obj, &mut st)?;
            }
            vs.file_count += 1;

            let link_id = obj.link_id();
            debug!(cnid = %obj.cnid(), %entry_id, link_id, "hard link added");
            Ok(ResolvedEntry {
                parent: dst_parent,
                name: dst_name.clone(),
                entry_id,
                resolved_id: obj.cnid(),
                link_id,
                kind: obj.kind(),
                fork: ForkKind::Data,
                object: Arc::clone(&obj),
            })
        })
    }

    /// Moves the direct record of `src` into the hidden directory and puts a
    /// pointer back under its name.
    fn promote(&self, vs: &mut VolumeState, src: &mut ResolvedEntry) -> CatalogResult<()> {
        let obj = Arc::clone(&src.object);
        let src_key = src.key();

        let mut attempt = 0;
        let (link_id, node_key) = loop {
            if attempt == self.config.max_link_id_attempts {
                warn!(cnid = %obj.cnid(), attempts = attempt, "no free link id");
                return Err(CatalogError::NoSpace);
            }
            attempt += 1;
            let id = self.link_ids.lock().next_id() & LINK_ID_MASK;
            if id == 0 {
                continue;
            }
            let node_key = self.hidden_key("link", &indirect_node_name(id))?;
            match self.rename_cat(&src_key, &node_key) {
                Ok(()) => break (id, node_key),
                Err(CatalogError::AlreadyExists { .. }) => {
                    debug!(link_id = id, attempt, "link id in use, retrying");
                }
                Err(e) => return Err(e),
            }
        };
        obj.state.lock().link_id = link_id;

        let pointer_id = match vs.alloc_cnid() {
            Ok(id) => id,
            Err(e) => {
                self.undo_promotion(&obj, &node_key, &src_key);
                return Err(e);
            }
        };
        if let Err(e) = self.create_cat(pointer_id, src.parent, &src.name, &obj) {
            self.undo_promotion(&obj, &node_key, &src_key);
            return Err(e);
        }
        vs.file_count += 1;
        src.entry_id = pointer_id;
        src.link_id = link_id;
        info!(cnid = %obj.cnid(), link_id, pointer = %pointer_id, "file promoted to indirection node");
        Ok(())
    }

    /// Reverses a promotion made earlier in the same `link` call: removes
    /// the pointer under the source name and moves the record back.
    fn demote(&self, vs: &mut VolumeState, src: &mut ResolvedEntry) {
        let obj = Arc::clone(&src.object);
        if let Err(e) = self.delete_cat(src.parent, &src.name) {
            warn!(cnid = %obj.cnid(), error = %e, "failed link left its source promoted");
            return;
        }
        vs.file_count = vs.file_count.saturating_sub(1);
        match self.hidden_key("link", &indirect_node_name(obj.link_id())) {
            Ok(node) => self.undo_promotion(&obj, &node, &src.key()),
            Err(e) => warn!(cnid = %obj.cnid(), error = %e, "no hidden directory to undo promotion"),
        }
        src.entry_id = obj.cnid();
        src.link_id = 0;
    }

    fn undo_promotion(&self, obj: &Object, node: &CatalogKey, src: &CatalogKey) {
        obj.state.lock().link_id = 0;
        if let Err(e) = self.rename_cat(node, src) {
            warn!(
                cnid = %obj.cnid(),
                node = ?node,
                error = %e,
                "promotion cleanup failed; indirection node left without pointer"
            );
        }
    }

    /// Removes the name `name` from `parent`.
    pub fn unlink(&self, parent: Cnid, name: &str) -> CatalogResult<()> {
        let name = self.encode_name(parent, name)?;
        let mut vs = self.lock_structure();
        let entry = self.lookup_name(parent, &name)?;
        self.unlink_locked(&mut vs, &entry)
    }

    /// Removes the name a resolved entry stands for. The entry is resolved
    /// again under the structural lock; its fork is kept.
    pub fn unlink_entry(&self, entry: &ResolvedEntry) -> CatalogResult<()> {
        let mut vs = self.lock_structure();
        let mut current = self.lookup_name(entry.parent, &entry.name)?;
        current.fork = entry.fork;
        self.unlink_locked(&mut vs, &current)
    }

    pub(crate) fn unlink_locked(
        &self,
        vs: &mut VolumeState,
        entry: &ResolvedEntry,
    ) -> CatalogResult<()> {
        if entry.fork == ForkKind::Resource {
            return Err(CatalogError::PermissionDenied { op: "unlink" });
        }
        if entry.kind == FileKind::Directory {
            return Err(CatalogError::IsADirectory(entry.resolved_id));
        }
        let obj = Arc::clone(&entry.object);
        let key = entry.key();

        if !entry.is_pointer() && obj.open_count() > 0 {
            let temp = self.hidden_key("unlink", &temp_node_name(obj.cnid()))?;
            return self.scoped("unlink", || {
                self.rename_cat(&key, &temp)?;
                let mut st = obj.state.lock();
                st.dead = true;
                st.nlink = st.nlink.saturating_sub(1);
                debug!(cnid = %obj.cnid(), open = st.open_count, "open file parked in hidden directory");
                self.touch(&obj, &mut st)
            });
        }

        self.scoped("unlink", || {
            self.delete_cat(entry.parent, &entry.name)?;
            let mut st = obj.state.lock();
            st.nlink = st.nlink.saturating_sub(1);

            if st.nlink == 0 {
                if !entry.is_pointer() {
                    return self.delete_object(vs, &obj, &mut st);
                }
                vs.file_count = vs.file_count.saturating_sub(1);
                if st.open_count == 0 {
                    let home = st.home.clone();
                    drop(st);
                    self.delete_cat(home.parent, &home.name)?;
                    let mut st = obj.state.lock();
                    return self.delete_object(vs, &obj, &mut st);
                }
                st.dead = true;
                debug!(cnid = %obj.cnid(), "last link removed while open");
            } else {
                vs.file_count = vs.file_count.saturating_sub(1);
            }

            if st.home == key {
                warn!(cnid = %obj.cnid(), nlink = st.nlink, "indirection node removed while pointers remain");
                st.ctime = HfsDate::now();
                return Ok(());
            }
            self.touch(&obj, &mut st)
        })
    }

    /// Removes the empty directory `name` from `parent`.
    pub fn rmdir(&self, parent: Cnid, name: &str) -> CatalogResult<()> {
        let name = self.encode_name(parent, name)?;
        let mut vs = self.lock_structure();
        let entry = self.lookup_name(parent, &name)?;
        self.rmdir_locked(&mut vs, &entry)
    }

    pub(crate) fn rmdir_locked(
        &self,
        vs: &mut VolumeState,
        entry: &ResolvedEntry,
    ) -> CatalogResult<()> {
        let id = entry.resolved_id;
        if entry.kind != FileKind::Directory {
            return Err(CatalogError::NotADirectory(id));
        }
        if id == self.root() || Some(id) == self.hidden_cnid() {
            return Err(CatalogError::PermissionDenied { op: "rmdir" });
        }
        let obj = Arc::clone(&entry.object);
        if obj.valence() != 0 {
            return Err(CatalogError::NotEmpty(id));
        }

        self.scoped("rmdir", || {
            self.delete_cat(entry.parent, &entry.name)?;
            let mut st = obj.state.lock();
            st.nlink = 0;
            self.delete_object(vs, &obj, &mut st)
        })
    }
}
