//! Ordered catalog store.
//!
//! The catalog engine only needs point lookups, strict insert/replace/delete
//! and ordered iteration by key. [`MemoryCatalogStore`] keeps everything in a
//! `BTreeMap`; the file-backed variant lives in `persistent.rs`.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, RwLock};

use crate::codec::CatalogKey;
use crate::error::{CatalogError, CatalogResult};

/// A key and its encoded record.
pub type CatalogEntry = (CatalogKey, Vec<u8>);

/// Ordered keyed store holding encoded catalog records.
///
/// Keys compare under catalog collation, so a lookup with a differently-cased
/// name finds the stored entry and the returned key carries the stored case.
pub trait CatalogStore: Send + Sync {
    /// Point lookup.
    fn find(&self, key: &CatalogKey) -> CatalogResult<Option<Vec<u8>>>;

    /// Inserts a new record. Fails with `AlreadyExists` if the key is live.
    fn insert(&self, key: &CatalogKey, record: &[u8]) -> CatalogResult<()>;

    /// Overwrites an existing record in place. Fails with `NotFound` if absent.
    fn replace(&self, key: &CatalogKey, record: &[u8]) -> CatalogResult<()>;

    /// Removes a record. Fails with `NotFound` if absent.
    fn delete(&self, key: &CatalogKey) -> CatalogResult<()>;

    /// First entry with key `>= key`.
    fn first_from(&self, key: &CatalogKey) -> CatalogResult<Option<CatalogEntry>>;

    /// First entry with key `> key`.
    fn next_after(&self, key: &CatalogKey) -> CatalogResult<Option<CatalogEntry>>;

    /// Number of live records.
    fn len(&self) -> CatalogResult<usize>;

    /// True when the store holds no records.
    fn is_empty(&self) -> CatalogResult<bool> {
        Ok(self.len()? == 0)
    }
}

/// Positioned iterator over a [`CatalogStore`].
///
/// Each step is an independent seek, so the cursor tolerates concurrent
/// mutation: it never repeats a key and never revisits a smaller one.
pub struct StoreCursor<'a> {
    store: &'a dyn CatalogStore,
    current: Option<CatalogEntry>,
}

impl<'a> StoreCursor<'a> {
    /// The entry under the cursor, or `None` past the end.
    pub fn read(&self) -> Option<(&CatalogKey, &[u8])> {
        self.current.as_ref().map(|(k, v)| (k, v.as_slice()))
    }

    /// Moves to the next key.
    pub fn advance(&mut self) -> CatalogResult<()> {
        if let Some((key, _)) = self.current.take() {
            self.current = self.store.next_after(&key)?;
        }
        Ok(())
    }
}

impl Iterator for StoreCursor<'_> {
    type Item = CatalogResult<CatalogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.current.take()?;
        match self.store.next_after(&entry.0) {
            Ok(next) => self.current = next,
            Err(e) => return Some(Err(e)),
        }
        Some(Ok(entry))
    }
}

/// Positions a cursor at the first key `>= key`.
pub fn iterate_from<'a>(
    store: &'a dyn CatalogStore,
    key: &CatalogKey,
) -> CatalogResult<StoreCursor<'a>> {
    Ok(StoreCursor {
        store,
        current: store.first_from(key)?,
    })
}

/// Record map shared by the in-memory and file-backed stores.
#[derive(Default)]
pub(crate) struct RecordMap {
    records: BTreeMap<CatalogKey, Vec<u8>>,
}

impl RecordMap {
    pub(crate) fn get(&self, key: &CatalogKey) -> Option<Vec<u8>> {
        self.records.get(key).cloned()
    }

    pub(crate) fn contains(&self, key: &CatalogKey) -> bool {
        self.records.contains_key(key)
    }

    pub(crate) fn check_insert(&self, key: &CatalogKey) -> CatalogResult<()> {
        if self.records.contains_key(key) {
            return Err(CatalogError::AlreadyExists {
                parent: key.parent,
                name: key.name.display_lossy(),
            });
        }
        Ok(())
    }

    pub(crate) fn check_present(&self, key: &CatalogKey) -> CatalogResult<()> {
        if !self.records.contains_key(key) {
            return Err(CatalogError::NotFound {
                parent: key.parent,
                name: key.name.display_lossy(),
            });
        }
        Ok(())
    }

    /// The key as stored for an entry that collates equal to `key`.
    pub(crate) fn stored_key(&self, key: &CatalogKey) -> CatalogResult<CatalogKey> {
        self.records
            .get_key_value(key)
            .map(|(k, _)| k.clone())
            .ok_or_else(|| CatalogError::NotFound {
                parent: key.parent,
                name: key.name.display_lossy(),
            })
    }

    /// Unconditional write, used by replay.
    pub(crate) fn put(&mut self, key: CatalogKey, record: Vec<u8>) {
        // Drop the old entry first so the stored key takes the new spelling.
        self.records.remove(&key);
        self.records.insert(key, record);
    }

    /// Overwrites the value, keeping the stored key spelling.
    pub(crate) fn overwrite(&mut self, key: &CatalogKey, record: Vec<u8>) {
        if let Some(slot) = self.records.get_mut(key) {
            *slot = record;
        }
    }

    pub(crate) fn remove(&mut self, key: &CatalogKey) {
        self.records.remove(key);
    }

    pub(crate) fn first_from(&self, key: &CatalogKey) -> Option<CatalogEntry> {
        self.records
            .range((Bound::Included(key), Bound::Unbounded))
            .next()
            .map(|(k, v)| (k.clone(), v.clone()))
    }

    pub(crate) fn next_after(&self, key: &CatalogKey) -> Option<CatalogEntry> {
        self.records
            .range((Bound::Excluded(key), Bound::Unbounded))
            .next()
            .map(|(k, v)| (k.clone(), v.clone()))
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&CatalogKey, &Vec<u8>)> {
        self.records.iter()
    }

    pub(crate) fn clear(&mut self) {
        self.records.clear();
    }
}

/// In-memory catalog store backed by a BTreeMap. Thread-safe via RwLock.
///
/// Does not persist across restarts; tests and scratch volumes use it.
#[derive(Clone, Default)]
pub struct MemoryCatalogStore {
    data: Arc<RwLock<RecordMap>>,
}

impl MemoryCatalogStore {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

pub(crate) fn lock_error<E: std::fmt::Display>(e: E) -> CatalogError {
    CatalogError::Storage(e.to_string())
}

impl CatalogStore for MemoryCatalogStore {
    fn find(&self, key: &CatalogKey) -> CatalogResult<Option<Vec<u8>>> {
        let data = self.data.read().map_err(lock_error)?;
        Ok(data.get(key))
    }

    fn insert(&self, key: &CatalogKey, record: &[u8]) -> CatalogResult<()> {
        let mut data = self.data.write().map_err(lock_error)?;
        data.check_insert(key)?;
        data.put(key.clone(), record.to_vec());
        Ok(())
    }

    fn replace(&self, key: &CatalogKey, record: &[u8]) -> CatalogResult<()> {
        let mut data = self.data.write().map_err(lock_error)?;
        data.check_present(key)?;
        data.overwrite(key, record.to_vec());
        Ok(())
    }

    fn delete(&self, key: &CatalogKey) -> CatalogResult<()> {
        let mut data = self.data.write().map_err(lock_error)?;
        data.check_present(key)?;
        data.remove(key);
        Ok(())
    }

    fn first_from(&self, key: &CatalogKey) -> CatalogResult<Option<CatalogEntry>> {
        let data = self.data.read().map_err(lock_error)?;
        Ok(data.first_from(key))
    }

    fn next_after(&self, key: &CatalogKey) -> CatalogResult<Option<CatalogEntry>> {
        let data = self.data.read().map_err(lock_error)?;
        Ok(data.next_after(key))
    }

    fn len(&self) -> CatalogResult<usize> {
        let data = self.data.read().map_err(lock_error)?;
        Ok(data.len())
    }
}
