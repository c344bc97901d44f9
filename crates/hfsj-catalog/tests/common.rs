//! Common test utilities and fixtures for catalog integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use hfsj_catalog::store::{iterate_from, CatalogEntry};
use hfsj_catalog::{
    CatalogError, CatalogKey, CatalogResult, CatalogStore, Cnid, Journal, MemoryCatalogStore,
    MemoryJournal, ScriptedLinkIds, Volume, VolumeConfig, VolumeParts,
};

/// A formatted in-memory volume with its journal exposed for inspection.
pub struct TestVolume {
    pub volume: Volume,
    pub journal: Arc<MemoryJournal>,
    pub store: Arc<dyn CatalogStore>,
}

impl TestVolume {
    /// Link ids 1000, 1001, ... so that indirection node names are predictable.
    pub fn new() -> Self {
        Self::build(
            Arc::new(MemoryCatalogStore::new()),
            ScriptedLinkIds::new(1000..1100, 5000),
            VolumeConfig::default(),
        )
    }

    pub fn with_link_ids(ids: Vec<u32>, fallback: u32, config: VolumeConfig) -> Self {
        Self::build(
            Arc::new(MemoryCatalogStore::new()),
            ScriptedLinkIds::new(ids, fallback),
            config,
        )
    }

    pub fn with_store(store: Arc<dyn CatalogStore>) -> Self {
        Self::build(
            store,
            ScriptedLinkIds::new(1000..1100, 5000),
            VolumeConfig::default(),
        )
    }

    fn build(store: Arc<dyn CatalogStore>, ids: ScriptedLinkIds, config: VolumeConfig) -> Self {
        let journal = Arc::new(MemoryJournal::default());
        let journal_dyn: Arc<dyn Journal> = journal.clone();
        let parts = VolumeParts::new(Arc::clone(&store), journal_dyn).with_link_ids(Box::new(ids));
        let volume = Volume::format(parts, config).expect("format");
        Self {
            volume,
            journal,
            store,
        }
    }

    pub fn root(&self) -> Cnid {
        self.volume.root()
    }

    pub fn hidden(&self) -> Cnid {
        self.volume.hidden_dir().expect("hidden directory").cnid
    }

    /// Names in `dir`, without `.` and `..`.
    pub fn names(&self, dir: Cnid) -> Vec<String> {
        let mut session = self.volume.opendir(dir).expect("opendir");
        let entries = self.volume.readdir(&mut session, usize::MAX).expect("readdir");
        entries.into_iter().skip(2).map(|e| e.name).collect()
    }

    pub fn file_count(&self) -> u64 {
        self.volume.stats().file_count
    }

    pub fn records(&self) -> usize {
        self.store.len().expect("len")
    }

    /// Every record as (encoded key, record bytes), in key order.
    pub fn snapshot(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        let start = CatalogKey::thread(Cnid::new(0));
        iterate_from(self.store.as_ref(), &start)
            .expect("seek")
            .map(|entry| {
                let (key, record) = entry.expect("record");
                (key.encode(), record)
            })
            .collect()
    }

    /// True when the hidden directory holds a record called `name`.
    pub fn hidden_has(&self, name: &str) -> bool {
        let key = CatalogKey::new(
            self.hidden(),
            hfsj_catalog::HfsName::from_raw_str(name).expect("name"),
        );
        self.store.find(&key).expect("find").is_some()
    }
}

/// Store wrapper that fails the n-th insert after being armed.
pub struct FaultyStore {
    inner: MemoryCatalogStore,
    countdown: AtomicUsize,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryCatalogStore::new(),
            countdown: AtomicUsize::new(0),
        }
    }

    /// Makes the `n`-th insert from now fail (1 = the next one).
    pub fn fail_insert(&self, n: usize) {
        self.countdown.store(n, Ordering::SeqCst);
    }

    fn should_fail(&self) -> bool {
        let left = self.countdown.load(Ordering::SeqCst);
        if left == 0 {
            return false;
        }
        self.countdown.store(left - 1, Ordering::SeqCst);
        left == 1
    }
}

impl CatalogStore for FaultyStore {
    fn find(&self, key: &CatalogKey) -> CatalogResult<Option<Vec<u8>>> {
        self.inner.find(key)
    }

    fn insert(&self, key: &CatalogKey, record: &[u8]) -> CatalogResult<()> {
        if self.should_fail() {
            return Err(CatalogError::Storage("injected insert failure".into()));
        }
        self.inner.insert(key, record)
    }

    fn replace(&self, key: &CatalogKey, record: &[u8]) -> CatalogResult<()> {
        self.inner.replace(key, record)
    }

    fn delete(&self, key: &CatalogKey) -> CatalogResult<()> {
        self.inner.delete(key)
    }

    fn first_from(&self, key: &CatalogKey) -> CatalogResult<Option<CatalogEntry>> {
        self.inner.first_from(key)
    }

    fn next_after(&self, key: &CatalogKey) -> CatalogResult<Option<CatalogEntry>> {
        self.inner.next_after(key)
    }

    fn len(&self) -> CatalogResult<usize> {
        self.inner.len()
    }
}
