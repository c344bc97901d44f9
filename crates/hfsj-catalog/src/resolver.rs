//! Name resolution with hard-link indirection.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::codec::{CatalogKey, CatalogRecord};
use crate::error::{CatalogError, CatalogResult};
use crate::link::indirect_node_name;
use crate::object::Object;
use crate::types::{Cnid, FileKind, ForkKind, S_ISVTX};
use crate::unicode::HfsName;
use crate::volume::Volume;

/// Result of resolving `(parent, name)`.
///
/// Owned by the caller; it is what a dentry cache would hold for the name.
#[derive(Clone, Debug)]
pub struct ResolvedEntry {
    /// Directory holding the entry.
    pub parent: Cnid,
    /// Entry name as stored in the catalog.
    pub name: HfsName,
    /// Id of the record found under `(parent, name)`. Differs from
    /// `resolved_id` when the entry is a hard-link pointer.
    pub entry_id: Cnid,
    /// Id of the object the entry resolves to.
    pub resolved_id: Cnid,
    /// Link id followed through the pointer, 0 for direct entries.
    pub link_id: u32,
    /// Kind of the resolved object.
    pub kind: FileKind,
    /// Fork this entry refers to.
    pub fork: ForkKind,
    /// The resolved object.
    pub object: Arc<Object>,
}

impl ResolvedEntry {
    /// Entry for an object whose own record sits under `(parent, name)`.
    pub(crate) fn direct(parent: Cnid, name: HfsName, object: Arc<Object>) -> Self {
        Self {
            parent,
            name,
            entry_id: object.cnid(),
            resolved_id: object.cnid(),
            link_id: 0,
            kind: object.kind(),
            fork: ForkKind::Data,
            object,
        }
    }

    /// True when the entry is a hard-link pointer.
    pub fn is_pointer(&self) -> bool {
        self.entry_id != self.resolved_id
    }

    /// Catalog key of the entry.
    pub fn key(&self) -> CatalogKey {
        CatalogKey::new(self.parent, self.name.clone())
    }

    /// The resource-fork pseudo-file of the same entry.
    pub fn resource_fork(&self) -> Self {
        Self {
            fork: ForkKind::Resource,
            ..self.clone()
        }
    }
}

impl Volume {
    /// Resolves `name` inside `parent`, following at most one hard-link hop.
    pub fn lookup(&self, parent: Cnid, name: &str) -> CatalogResult<ResolvedEntry> {
        let name = self.encode_name(parent, name)?;
        self.lookup_name(parent, &name)
    }

    pub(crate) fn lookup_name(&self, parent: Cnid, name: &HfsName) -> CatalogResult<ResolvedEntry> {
        if Some(parent) == self.hidden_cnid() {
            let hidden = self.acquire_dir(parent)?;
            hidden.state.lock().mode |= S_ISVTX;
        }

        let not_found = || CatalogError::NotFound {
            parent,
            name: name.display_lossy(),
        };
        let mut key = CatalogKey::new(parent, name.clone());
        let mut entry_key: Option<CatalogKey> = None;
        let mut entry_id: Option<Cnid> = None;
        let mut link_id = 0;
        let mut capped = false;
        let (key, record) = loop {
            let (stored, record) = self.read_entry(&key)?.ok_or_else(not_found)?;
            if entry_key.is_none() {
                entry_key = Some(stored.clone());
            }
            let hop = match &record {
                CatalogRecord::Folder(f) => {
                    entry_id.get_or_insert(f.id);
                    None
                }
                CatalogRecord::File(f) if self.is_pointer(f) && entry_id.is_none() => {
                    entry_id = Some(f.id);
                    Some(f.link_id())
                }
                CatalogRecord::File(f) => {
                    // A pointer reached through a pointer is taken as a plain file.
                    if entry_id.is_some() && self.is_pointer(f) {
                        warn!(%parent, name = %name, node = ?stored, "pointer chain not followed");
                        capped = true;
                    }
                    entry_id.get_or_insert(f.id);
                    None
                }
                CatalogRecord::FolderThread(_) => {
                    return Err(CatalogError::corrupt(format!(
                        "invalid catalog entry type in lookup of {:?}",
                        key
                    )))
                }
            };
            match hop {
                Some(id) => {
                    let hidden = self.hidden_cnid().ok_or_else(not_found)?;
                    link_id = id;
                    key = CatalogKey::new(hidden, HfsName::from_raw_str(&indirect_node_name(id))?);
                    debug!(%parent, name = %name, link_id, "following hard link");
                }
                None => break (stored, record),
            }
        };
        if capped {
            link_id = 0;
        }

        let object = self.instantiate(&key, &record)?;
        if object.kind() == FileKind::Regular
            && !capped
            && (link_id != 0 || Some(key.parent) != self.hidden_cnid())
        {
            object.state.lock().link_id = link_id;
        }
        let entry_id = entry_id.unwrap_or_else(|| object.cnid());
        let name = entry_key.map_or_else(|| name.clone(), |k| k.name);
        Ok(ResolvedEntry {
            parent,
            name,
            entry_id,
            resolved_id: object.cnid(),
            link_id,
            kind: object.kind(),
            fork: ForkKind::Data,
            object,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VolumeConfig;
    use crate::volume::VolumeParts;

    fn make_volume() -> Volume {
        let config = VolumeConfig::default();
        Volume::format(VolumeParts::in_memory(&config), config).unwrap()
    }

    #[test]
    fn test_lookup_missing() {
        let volume = make_volume();
        match volume.lookup(volume.root(), "nope") {
            Err(CatalogError::NotFound { name, .. }) => assert_eq!(name, "nope"),
            other => panic!("expected NotFound, got {:?}", other),
        }
    }

    #[test]
    fn test_lookup_empty_name() {
        let volume = make_volume();
        match volume.lookup(volume.root(), "") {
            Err(CatalogError::NotFound { .. }) => {}
            other => panic!("expected NotFound, got {:?}", other),
        }
    }

    #[test]
    fn test_lookup_case_insensitive() {
        let volume = make_volume();
        let created = volume.create(volume.root(), "Notes.txt", 0o644).unwrap();
        let found = volume.lookup(volume.root(), "NOTES.TXT").unwrap();
        assert_eq!(found.resolved_id, created.resolved_id);
        assert!(!found.is_pointer());
        assert_eq!(found.link_id, 0);
    }

    #[test]
    fn test_lookup_reports_stored_spelling() {
        let volume = make_volume();
        let root = volume.root();
        let created = volume.mkdir(root, "Docs", 0o755).unwrap().unwrap();
        let found = volume.lookup(root, "dOCS").unwrap();
        assert_eq!(found.name.units(), created.name.units());
        assert_eq!(found.object.home().name.units(), created.name.units());
    }

    #[test]
    fn test_lookup_folder() {
        let volume = make_volume();
        let dir = volume.mkdir(volume.root(), "docs", 0o755).unwrap().unwrap();
        let found = volume.lookup(volume.root(), "docs").unwrap();
        assert_eq!(found.kind, FileKind::Directory);
        assert_eq!(found.resolved_id, dir.resolved_id);
    }

    #[test]
    fn test_lookup_through_pointer() {
        let volume = make_volume();
        let root = volume.root();
        let mut a = volume.create(root, "a", 0o644).unwrap();
        volume.link(&mut a, root, "b").unwrap();
        let b = volume.lookup(root, "b").unwrap();
        assert!(b.is_pointer());
        assert_eq!(b.resolved_id, a.resolved_id);
        assert_ne!(b.link_id, 0);
        assert_eq!(b.object.link_id(), b.link_id);
    }

    #[test]
    fn test_thread_record_at_entry_key_is_corrupt() {
        let volume = make_volume();
        let root = volume.root();
        let key = CatalogKey::new(root, HfsName::from_raw_str("odd").unwrap());
        let thread = CatalogRecord::FolderThread(crate::codec::ThreadRecord {
            parent: root,
            name: HfsName::empty(),
        });
        volume.store().insert(&key, &thread.encode()).unwrap();
        match volume.lookup(root, "odd") {
            Err(CatalogError::CorruptCatalog { .. }) => {}
            other => panic!("expected CorruptCatalog, got {:?}", other),
        }
    }

    #[test]
    fn test_lookup_in_hidden_dir_sets_sticky() {
        let volume = make_volume();
        let hidden = volume.hidden_dir().unwrap().cnid;
        let _ = volume.lookup(hidden, "iNode1");
        assert_ne!(volume.acquire(hidden).unwrap().mode() & S_ISVTX, 0);
    }

    #[test]
    fn test_resource_fork_view() {
        let volume = make_volume();
        let entry = volume.create(volume.root(), "f", 0o644).unwrap();
        let rsrc = entry.resource_fork();
        assert_eq!(rsrc.fork, ForkKind::Resource);
        assert_eq!(rsrc.resolved_id, entry.resolved_id);
    }
}
