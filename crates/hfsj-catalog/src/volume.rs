//! The mounted volume: collaborators, the structural lock and lifecycle.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::codec::{CatalogKey, CatalogRecord, FolderRecord, ThreadRecord};
use crate::config::{ReservedIds, VolumeConfig};
use crate::content::{ContentStore, MemoryContentStore};
use crate::error::{CatalogError, CatalogResult};
use crate::journal::{Journal, MemoryJournal, TransactionScope};
use crate::link::{LinkIdSource, RandomLinkIds};
use crate::object::ObjectTable;
use crate::store::{iterate_from, CatalogStore, MemoryCatalogStore};
use crate::types::{Cnid, HfsDate};
use crate::unicode::{HfsName, HfsTextCodec, TextCodec};

/// Volume-wide counters, guarded by the structural lock.
#[derive(Debug)]
pub struct VolumeState {
    pub(crate) next_cnid: u32,
    pub(crate) file_count: u64,
    pub(crate) folder_count: u64,
    pub(crate) reserved: ReservedIds,
}

impl VolumeState {
    /// Hands out the next free id, skipping reserved ones.
    pub(crate) fn alloc_cnid(&mut self) -> CatalogResult<Cnid> {
        while self.reserved.is_reserved(self.next_cnid) {
            self.next_cnid = self.next_cnid.checked_add(1).ok_or(CatalogError::NoSpace)?;
        }
        let cnid = Cnid::new(self.next_cnid);
        self.next_cnid = self.next_cnid.checked_add(1).ok_or(CatalogError::NoSpace)?;
        Ok(cnid)
    }
}

/// Snapshot of the volume counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VolumeStats {
    /// Next id the allocator will consider.
    pub next_cnid: u32,
    /// File records on the volume, pointers and indirection nodes included.
    pub file_count: u64,
    /// Folder records, the root excluded.
    pub folder_count: u64,
    /// Objects currently cached in-core.
    pub cached_objects: usize,
}

/// The hidden directory holding indirection nodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HiddenDir {
    /// Its id.
    pub cnid: Cnid,
    /// Its create date, which pointer records carry as a sentinel.
    pub create_date: HfsDate,
}

/// Collaborators a volume is assembled from.
pub struct VolumeParts {
    /// Ordered catalog store.
    pub store: Arc<dyn CatalogStore>,
    /// Journal providing transaction scopes.
    pub journal: Arc<dyn Journal>,
    /// Symlink targets and fork content.
    pub content: Arc<dyn ContentStore>,
    /// Name codec.
    pub codec: Arc<dyn TextCodec>,
    /// Link id generator.
    pub link_ids: Box<dyn LinkIdSource>,
}

impl VolumeParts {
    /// Uses `store` and `journal` with default in-memory content, the HFS+
    /// codec and random link ids.
    pub fn new(store: Arc<dyn CatalogStore>, journal: Arc<dyn Journal>) -> Self {
        Self {
            store,
            journal,
            content: Arc::new(MemoryContentStore::new()),
            codec: Arc::new(HfsTextCodec),
            link_ids: Box::new(RandomLinkIds),
        }
    }

    /// Fully in-memory collaborators.
    pub fn in_memory(config: &VolumeConfig) -> Self {
        Self::new(
            Arc::new(MemoryCatalogStore::new()),
            Arc::new(MemoryJournal::new(config.journal_max_entries)),
        )
    }

    /// Replaces the content store.
    pub fn with_content(mut self, content: Arc<dyn ContentStore>) -> Self {
        self.content = content;
        self
    }

    /// Replaces the link id generator.
    pub fn with_link_ids(mut self, link_ids: Box<dyn LinkIdSource>) -> Self {
        self.link_ids = link_ids;
        self
    }

    /// Replaces the text codec.
    pub fn with_codec(mut self, codec: Arc<dyn TextCodec>) -> Self {
        self.codec = codec;
        self
    }
}

/// A mounted catalog volume.
///
/// Mutating operations (`create`, `mkdir`, `mknod`, `symlink`, `link`,
/// `unlink`, `rmdir`, `rename`) serialize on the structural lock and run
/// their catalog updates inside one transaction scope each. `lookup` and
/// directory enumeration take only per-object locks.
pub struct Volume {
    pub(crate) store: Arc<dyn CatalogStore>,
    pub(crate) journal: Arc<dyn Journal>,
    pub(crate) content: Arc<dyn ContentStore>,
    pub(crate) codec: Arc<dyn TextCodec>,
    pub(crate) link_ids: Mutex<Box<dyn LinkIdSource>>,
    pub(crate) config: VolumeConfig,
    pub(crate) reserved: ReservedIds,
    pub(crate) structural: Mutex<VolumeState>,
    pub(crate) objects: ObjectTable,
    pub(crate) root_create_date: HfsDate,
    pub(crate) hidden: Option<HiddenDir>,
}

impl Volume {
    fn assemble(
        parts: VolumeParts,
        config: VolumeConfig,
        reserved: ReservedIds,
        state: VolumeState,
        root_create_date: HfsDate,
        hidden: Option<HiddenDir>,
    ) -> Self {
        Self {
            store: parts.store,
            journal: parts.journal,
            content: parts.content,
            codec: parts.codec,
            link_ids: Mutex::new(parts.link_ids),
            config,
            reserved,
            structural: Mutex::new(state),
            objects: ObjectTable::default(),
            root_create_date,
            hidden,
        }
    }

    /// Formats an empty store: root folder, its thread and, if configured,
    /// the hidden directory.
    pub fn format(parts: VolumeParts, config: VolumeConfig) -> CatalogResult<Self> {
        let reserved = config.reserved;
        if !parts.store.is_empty()? {
            return Err(CatalogError::AlreadyExists {
                parent: reserved.root_parent(),
                name: config.volume_name.clone(),
            });
        }
        let volume_name = parts.codec.encode_name(&config.volume_name)?;
        let hidden_name = parts.codec.encode_name(&config.hidden_dir_name)?;
        let now = HfsDate::now();
        let state = VolumeState {
            next_cnid: reserved.first_user,
            file_count: 0,
            folder_count: 0,
            reserved,
        };
        let mut volume = Self::assemble(parts, config, reserved, state, now, None);

        let root = reserved.root();
        let mut hidden = None;
        volume.scoped("format", || {
            volume.insert_folder(
                CatalogKey::new(reserved.root_parent(), volume_name.clone()),
                FolderRecord::new(root, now, 0o755),
            )?;
            if volume.config.create_hidden_dir {
                let cnid = reserved.hidden_dir();
                volume.insert_folder(
                    CatalogKey::new(root, hidden_name.clone()),
                    FolderRecord::new(cnid, now, 0),
                )?;
                volume.structural.lock().folder_count += 1;
                hidden = Some(HiddenDir {
                    cnid,
                    create_date: now,
                });
            }
            Ok(())
        })?;
        volume.hidden = hidden;
        info!(
            name = %volume.config.volume_name,
            hidden = ?volume.hidden.map(|h| h.cnid),
            "volume formatted"
        );
        Ok(volume)
    }

    /// Inserts a folder record and its thread without touching the parent's
    /// valence.
    fn insert_folder(&self, key: CatalogKey, folder: FolderRecord) -> CatalogResult<()> {
        let thread = CatalogRecord::FolderThread(ThreadRecord {
            parent: key.parent,
            name: key.name.clone(),
        });
        self.store
            .insert(&CatalogKey::thread(folder.id), &thread.encode())?;
        self.store
            .insert(&key, &CatalogRecord::Folder(folder).encode())
    }

    /// Mounts a formatted store, recovering the hidden directory, the pointer
    /// sentinels and the volume counters.
    pub fn mount(parts: VolumeParts, config: VolumeConfig) -> CatalogResult<Self> {
        let mut reserved = config.reserved;
        let root = reserved.root();
        let store = Arc::clone(&parts.store);

        let root_key = match read(store.as_ref(), &CatalogKey::thread(root))? {
            Some(CatalogRecord::FolderThread(t)) => t.target_key(),
            _ => return Err(CatalogError::corrupt("root folder thread missing")),
        };
        let root_create_date = match read(store.as_ref(), &root_key)? {
            Some(CatalogRecord::Folder(f)) if f.id == root => f.create_date,
            _ => return Err(CatalogError::corrupt("root folder record missing")),
        };

        let hidden_name = parts.codec.encode_name(&config.hidden_dir_name)?;
        let hidden = match read(store.as_ref(), &CatalogKey::new(root, hidden_name))? {
            Some(CatalogRecord::Folder(f)) => Some(HiddenDir {
                cnid: f.id,
                create_date: f.create_date,
            }),
            _ => None,
        };
        if let Some(h) = hidden {
            reserved.hidden_dir = h.cnid.as_u32();
        }

        let mut max_id = 0u32;
        let mut files = 0u64;
        let mut folders = 0u64;
        let start = CatalogKey::thread(Cnid::new(0));
        for entry in iterate_from(store.as_ref(), &start)? {
            let (_, bytes) = entry?;
            match CatalogRecord::decode(&bytes)? {
                CatalogRecord::Folder(f) => {
                    max_id = max_id.max(f.id.as_u32());
                    if f.id != root {
                        folders += 1;
                    }
                }
                CatalogRecord::File(f) => {
                    max_id = max_id.max(f.id.as_u32());
                    files += 1;
                }
                CatalogRecord::FolderThread(_) => {}
            }
        }
        let next_cnid = max_id
            .checked_add(1)
            .ok_or(CatalogError::NoSpace)?
            .max(reserved.first_user);

        let state = VolumeState {
            next_cnid,
            file_count: files,
            folder_count: folders,
            reserved,
        };
        info!(
            next_cnid,
            files,
            folders,
            hidden = ?hidden.map(|h| h.cnid),
            "volume mounted"
        );
        Ok(Self::assemble(
            parts,
            config,
            reserved,
            state,
            root_create_date,
            hidden,
        ))
    }

    /// The root folder id.
    pub fn root(&self) -> Cnid {
        self.reserved.root()
    }

    /// The hidden directory, if the volume has one.
    pub fn hidden_dir(&self) -> Option<HiddenDir> {
        self.hidden
    }

    pub(crate) fn hidden_cnid(&self) -> Option<Cnid> {
        self.hidden.map(|h| h.cnid)
    }

    /// Reserved identifier table as resolved at mount.
    pub fn reserved(&self) -> &ReservedIds {
        &self.reserved
    }

    /// Active configuration.
    pub fn config(&self) -> &VolumeConfig {
        &self.config
    }

    /// The catalog store.
    pub fn store(&self) -> &Arc<dyn CatalogStore> {
        &self.store
    }

    /// Current counters.
    pub fn stats(&self) -> VolumeStats {
        let vs = self.structural.lock();
        VolumeStats {
            next_cnid: vs.next_cnid,
            file_count: vs.file_count,
            folder_count: vs.folder_count,
            cached_objects: self.objects.len(),
        }
    }

    pub(crate) fn lock_structure(&self) -> MutexGuard<'_, VolumeState> {
        self.structural.lock()
    }

    /// Runs `f` inside one transaction scope. The scope is committed on every
    /// path; an error from `f` takes precedence over a commit error.
    pub(crate) fn scoped<T>(
        &self,
        tag: &'static str,
        f: impl FnOnce() -> CatalogResult<T>,
    ) -> CatalogResult<T> {
        let scope = TransactionScope::begin(self.journal.as_ref(), tag)?;
        let result = f();
        let committed = scope.commit();
        if let Err(e) = &result {
            debug!(tag, error = %e, "operation failed");
        }
        let value = result?;
        committed?;
        Ok(value)
    }

    /// Encodes a caller name for lookup. A name that collates empty never
    /// names an entry.
    pub(crate) fn encode_name(&self, parent: Cnid, name: &str) -> CatalogResult<HfsName> {
        let units = self.codec.encode_name(name)?;
        if units.collates_empty() {
            return Err(CatalogError::NotFound {
                parent,
                name: name.to_string(),
            });
        }
        Ok(units)
    }

    /// Encodes the name of an entry about to be created.
    pub(crate) fn encode_new_name(&self, name: &str) -> CatalogResult<HfsName> {
        let units = self.codec.encode_name(name)?;
        if units.collates_empty() {
            return Err(CatalogError::InvalidName {
                name: name.to_string(),
            });
        }
        Ok(units)
    }

    /// Decodes catalog units for display.
    pub fn decode_name(&self, name: &HfsName) -> CatalogResult<String> {
        self.codec.decode_name(name)
    }
}

fn read(store: &dyn CatalogStore, key: &CatalogKey) -> CatalogResult<Option<CatalogRecord>> {
    store
        .find(key)?
        .map(|bytes| CatalogRecord::decode(&bytes))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_skips_reserved() {
        let mut vs = VolumeState {
            next_cnid: 17,
            file_count: 0,
            folder_count: 0,
            reserved: ReservedIds::default(),
        };
        assert_eq!(vs.alloc_cnid().unwrap(), Cnid::new(17));
        assert_eq!(vs.alloc_cnid().unwrap(), Cnid::new(18));
        assert_eq!(vs.alloc_cnid().unwrap(), Cnid::new(20));
    }

    #[test]
    fn test_alloc_exhaustion() {
        let mut vs = VolumeState {
            next_cnid: u32::MAX,
            file_count: 0,
            folder_count: 0,
            reserved: ReservedIds::default(),
        };
        match vs.alloc_cnid() {
            Err(CatalogError::NoSpace) => {}
            other => panic!("expected NoSpace, got {:?}", other),
        }
    }

    #[test]
    fn test_format_layout() {
        let config = VolumeConfig::default();
        let volume = Volume::format(VolumeParts::in_memory(&config), config).unwrap();
        assert_eq!(volume.store().len().unwrap(), 4);
        let root = volume.acquire(volume.root()).unwrap();
        assert_eq!(root.valence(), 0);
        let hidden = volume.hidden_dir().unwrap();
        assert_eq!(hidden.cnid, Cnid::new(19));
        let stats = volume.stats();
        assert_eq!(stats.folder_count, 1);
        assert_eq!(stats.file_count, 0);
        assert_eq!(stats.next_cnid, 2);
    }

    #[test]
    fn test_format_refuses_non_empty_store() {
        let config = VolumeConfig::default();
        let store: Arc<dyn CatalogStore> = Arc::new(MemoryCatalogStore::new());
        let journal: Arc<dyn Journal> = Arc::new(MemoryJournal::default());
        Volume::format(
            VolumeParts::new(Arc::clone(&store), Arc::clone(&journal)),
            config.clone(),
        )
        .unwrap();
        match Volume::format(VolumeParts::new(store, journal), config) {
            Err(CatalogError::AlreadyExists { .. }) => {}
            Err(e) => panic!("expected AlreadyExists, got {:?}", e),
            Ok(_) => panic!("expected AlreadyExists, got a volume"),
        }
    }

    #[test]
    fn test_format_without_hidden_dir() {
        let config = VolumeConfig {
            create_hidden_dir: false,
            ..VolumeConfig::default()
        };
        let volume = Volume::format(VolumeParts::in_memory(&config), config).unwrap();
        assert!(volume.hidden_dir().is_none());
        assert_eq!(volume.store().len().unwrap(), 2);
    }

    #[test]
    fn test_mount_unformatted_store() {
        let config = VolumeConfig::default();
        match Volume::mount(VolumeParts::in_memory(&config), config) {
            Err(CatalogError::CorruptCatalog { .. }) => {}
            Err(e) => panic!("expected CorruptCatalog, got {:?}", e),
            Ok(_) => panic!("expected CorruptCatalog, got a volume"),
        }
    }
}
