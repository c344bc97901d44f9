//! File-backed catalog store with a transactional write-ahead log.
//!
//! Records live in an in-memory ordered map. Every mutation is appended to a
//! WAL as a length-prefixed bincode frame tagged with the open transaction;
//! `checkpoint` snapshots the map to a file and truncates the WAL. On open the
//! checkpoint is loaded and the WAL replayed, applying only the frames of
//! transactions whose Commit frame made it to disk.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::codec::CatalogKey;
use crate::error::{CatalogError, CatalogResult};
use crate::journal::{Journal, TxnId};
use crate::store::{lock_error, CatalogEntry, CatalogStore, RecordMap};

const WAL_FILENAME: &str = "catalog.wal";
const CHECKPOINT_FILENAME: &str = "catalog.ckpt";

#[derive(Debug, Serialize, Deserialize, Clone)]
enum WalOp {
    Begin,
    Put { key: Vec<u8>, record: Vec<u8> },
    Delete { key: Vec<u8> },
    Commit,
}

#[derive(Debug, Serialize, Deserialize)]
struct WalEntry {
    seq: u64,
    txn: Option<u64>,
    op: WalOp,
}

#[derive(Debug, Serialize, Deserialize)]
struct Checkpoint {
    seq: u64,
    next_txn: u64,
    entries: Vec<(Vec<u8>, Vec<u8>)>,
}

struct WalWriter {
    file: File,
}

impl WalWriter {
    fn new(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(WalWriter { file })
    }

    fn append(&mut self, entry: &WalEntry) -> CatalogResult<()> {
        let encoded = bincode::serialize(entry)
            .map_err(|e| CatalogError::Storage(format!("failed to encode WAL frame: {}", e)))?;
        let len_bytes = (encoded.len() as u32).to_le_bytes();
        self.file.write_all(&len_bytes)?;
        self.file.write_all(&encoded)?;
        self.file.sync_all()?;
        Ok(())
    }

    fn truncate(&mut self) -> std::io::Result<()> {
        self.file.set_len(0)?;
        self.file.sync_all()?;
        Ok(())
    }
}

struct LogState {
    wal: WalWriter,
    seq: u64,
    next_txn: u64,
    open: Option<u64>,
}

impl LogState {
    fn append(&mut self, op: WalOp) -> CatalogResult<()> {
        self.seq += 1;
        let entry = WalEntry {
            seq: self.seq,
            txn: self.open,
            op,
        };
        self.wal.append(&entry)
    }
}

/// Persistent catalog store and journal.
///
/// The same value serves as the volume's [`CatalogStore`] and its
/// [`Journal`]; share it through two `Arc` handles.
pub struct PersistentCatalogStore {
    data: Arc<RwLock<RecordMap>>,
    log: Mutex<LogState>,
    dir: PathBuf,
}

impl PersistentCatalogStore {
    /// Opens or creates a store in `dir`, recovering committed state.
    pub fn open(dir: &Path) -> CatalogResult<Self> {
        fs::create_dir_all(dir)?;
        let wal_path = dir.join(WAL_FILENAME);
        let checkpoint_path = dir.join(CHECKPOINT_FILENAME);

        let mut data = RecordMap::default();
        let (mut seq, mut next_txn) = load_checkpoint(&checkpoint_path, &mut data)?;
        let replay = replay_wal(&wal_path, &mut data)?;
        seq = seq.max(replay.max_seq);
        next_txn = next_txn.max(replay.max_txn + 1);
        if replay.discarded > 0 {
            warn!(
                discarded = replay.discarded,
                "dropped uncommitted transactions from WAL"
            );
        }
        info!(
            dir = %dir.display(),
            records = data.len(),
            replayed = replay.applied,
            "opened catalog store"
        );

        Ok(Self {
            data: Arc::new(RwLock::new(data)),
            log: Mutex::new(LogState {
                wal: WalWriter::new(&wal_path)?,
                seq,
                next_txn,
                open: None,
            }),
            dir: dir.to_path_buf(),
        })
    }

    /// Snapshots the catalog and truncates the WAL.
    ///
    /// Fails while a transaction is open, since its frames would be lost.
    pub fn checkpoint(&self) -> CatalogResult<()> {
        let mut log = self.log.lock();
        if let Some(txn) = log.open {
            return Err(CatalogError::transaction(format!(
                "cannot checkpoint while {} is open",
                TxnId::new(txn)
            )));
        }
        let entries: Vec<(Vec<u8>, Vec<u8>)> = {
            let data = self.data.read().map_err(lock_error)?;
            data.iter().map(|(k, v)| (k.encode(), v.clone())).collect()
        };
        let count = entries.len();
        let checkpoint = Checkpoint {
            seq: log.seq,
            next_txn: log.next_txn,
            entries,
        };
        let encoded = bincode::serialize(&checkpoint)
            .map_err(|e| CatalogError::Storage(format!("failed to encode checkpoint: {}", e)))?;

        let checkpoint_path = self.dir.join(CHECKPOINT_FILENAME);
        let mut tmp_path = checkpoint_path.clone();
        tmp_path.set_extension("tmp");
        {
            let mut tmp_file = File::create(&tmp_path)?;
            tmp_file.write_all(&encoded)?;
            tmp_file.sync_all()?;
        }
        fs::rename(&tmp_path, &checkpoint_path)?;
        log.wal.truncate()?;
        info!(records = count, seq = log.seq, "catalog checkpoint written");
        Ok(())
    }

    /// Directory holding the WAL and checkpoint.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn load_checkpoint(path: &Path, data: &mut RecordMap) -> CatalogResult<(u64, u64)> {
    if !path.exists() {
        return Ok((0, 1));
    }
    let mut contents = Vec::new();
    File::open(path)?.read_to_end(&mut contents)?;
    if contents.is_empty() {
        return Ok((0, 1));
    }
    let checkpoint: Checkpoint = bincode::deserialize(&contents)
        .map_err(|e| CatalogError::Storage(format!("failed to decode checkpoint: {}", e)))?;
    data.clear();
    for (k, v) in checkpoint.entries {
        data.put(CatalogKey::decode(&k)?, v);
    }
    Ok((checkpoint.seq, checkpoint.next_txn.max(1)))
}

#[derive(Default)]
struct ReplayStats {
    max_seq: u64,
    max_txn: u64,
    applied: usize,
    discarded: usize,
}

fn apply(data: &mut RecordMap, op: WalOp) -> CatalogResult<()> {
    match op {
        WalOp::Put { key, record } => data.put(CatalogKey::decode(&key)?, record),
        WalOp::Delete { key } => data.remove(&CatalogKey::decode(&key)?),
        WalOp::Begin | WalOp::Commit => {}
    }
    Ok(())
}

fn replay_wal(path: &Path, data: &mut RecordMap) -> CatalogResult<ReplayStats> {
    let mut stats = ReplayStats::default();
    if !path.exists() {
        return Ok(stats);
    }
    let mut file = File::open(path)?;
    let mut pending: HashMap<u64, Vec<WalOp>> = HashMap::new();

    loop {
        let mut len_buf = [0u8; 4];
        match file.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut frame = vec![0u8; len];
        match file.read_exact(&mut frame) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                warn!(len, "torn WAL frame at end of log, ignoring");
                break;
            }
            Err(e) => return Err(e.into()),
        }
        let entry: WalEntry = bincode::deserialize(&frame)
            .map_err(|e| CatalogError::Storage(format!("failed to decode WAL frame: {}", e)))?;
        stats.max_seq = stats.max_seq.max(entry.seq);

        match (entry.txn, entry.op) {
            (Some(txn), WalOp::Begin) => {
                stats.max_txn = stats.max_txn.max(txn);
                pending.insert(txn, Vec::new());
            }
            (Some(txn), WalOp::Commit) => {
                for op in pending.remove(&txn).unwrap_or_default() {
                    apply(data, op)?;
                    stats.applied += 1;
                }
            }
            (Some(txn), op) => match pending.get_mut(&txn) {
                Some(ops) => ops.push(op),
                None => debug!(txn, "WAL frame for unknown transaction, skipping"),
            },
            (None, op) => {
                apply(data, op)?;
                stats.applied += 1;
            }
        }
    }
    stats.discarded = pending.len();
    Ok(stats)
}

impl Journal for PersistentCatalogStore {
    fn begin(&self, tag: &'static str) -> CatalogResult<TxnId> {
        let mut log = self.log.lock();
        if let Some(open) = log.open {
            return Err(CatalogError::transaction(format!(
                "cannot begin '{}': {} is still open",
                tag,
                TxnId::new(open)
            )));
        }
        let txn = log.next_txn;
        log.next_txn += 1;
        log.open = Some(txn);
        if let Err(e) = log.append(WalOp::Begin) {
            log.open = None;
            return Err(e);
        }
        Ok(TxnId::new(txn))
    }

    fn commit(&self, txn: TxnId) -> CatalogResult<()> {
        let mut log = self.log.lock();
        if log.open != Some(txn.as_u64()) {
            return Err(CatalogError::transaction(format!(
                "{} is not the open transaction",
                txn
            )));
        }
        let result = log.append(WalOp::Commit);
        log.open = None;
        result
    }
}

impl CatalogStore for PersistentCatalogStore {
    fn find(&self, key: &CatalogKey) -> CatalogResult<Option<Vec<u8>>> {
        let data = self.data.read().map_err(lock_error)?;
        Ok(data.get(key))
    }

    fn insert(&self, key: &CatalogKey, record: &[u8]) -> CatalogResult<()> {
        let mut log = self.log.lock();
        let mut data = self.data.write().map_err(lock_error)?;
        data.check_insert(key)?;
        log.append(WalOp::Put {
            key: key.encode(),
            record: record.to_vec(),
        })?;
        data.put(key.clone(), record.to_vec());
        Ok(())
    }

    fn replace(&self, key: &CatalogKey, record: &[u8]) -> CatalogResult<()> {
        let mut log = self.log.lock();
        let mut data = self.data.write().map_err(lock_error)?;
        let stored = data.stored_key(key)?;
        log.append(WalOp::Put {
            key: stored.encode(),
            record: record.to_vec(),
        })?;
        data.overwrite(&stored, record.to_vec());
        Ok(())
    }

    fn delete(&self, key: &CatalogKey) -> CatalogResult<()> {
        let mut log = self.log.lock();
        let mut data = self.data.write().map_err(lock_error)?;
        data.check_present(key)?;
        log.append(WalOp::Delete { key: key.encode() })?;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Cnid;
    use crate::unicode::HfsName;
    use tempfile::TempDir;

    fn key(parent: u32, name: &str) -> CatalogKey {
        CatalogKey::new(Cnid::new(parent), HfsName::from_raw_str(name).unwrap())
    }

    fn make_store() -> (TempDir, PersistentCatalogStore) {
        let dir = TempDir::new().unwrap();
        let store = PersistentCatalogStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_committed_transaction_survives_reopen() {
        let (dir, store) = make_store();
        let txn = store.begin("create").unwrap();
        store.insert(&key(1, "a"), b"rec-a").unwrap();
        store.insert(&key(1, "b"), b"rec-b").unwrap();
        store.commit(txn).unwrap();
        drop(store);

        let store = PersistentCatalogStore::open(dir.path()).unwrap();
        assert_eq!(store.find(&key(1, "a")).unwrap(), Some(b"rec-a".to_vec()));
        assert_eq!(store.len().unwrap(), 2);
    }

    #[test]
    fn test_uncommitted_transaction_discarded() {
        let (dir, store) = make_store();
        let txn = store.begin("create").unwrap();
        store.insert(&key(1, "kept"), b"1").unwrap();
        store.commit(txn).unwrap();
        let _open = store.begin("link").unwrap();
        store.delete(&key(1, "kept")).unwrap();
        store.insert(&key(1, "lost"), b"2").unwrap();
        drop(store);

        let store = PersistentCatalogStore::open(dir.path()).unwrap();
        assert!(store.find(&key(1, "kept")).unwrap().is_some());
        assert!(store.find(&key(1, "lost")).unwrap().is_none());
    }

    #[test]
    fn test_torn_tail_ignored() {
        let (dir, store) = make_store();
        let txn = store.begin("mkdir").unwrap();
        store.insert(&key(1, "a"), b"1").unwrap();
        store.commit(txn).unwrap();
        drop(store);

        let mut wal = OpenOptions::new()
            .append(true)
            .open(dir.path().join(WAL_FILENAME))
            .unwrap();
        wal.write_all(&100u32.to_le_bytes()).unwrap();
        wal.write_all(&[1, 2, 3]).unwrap();
        drop(wal);

        let store = PersistentCatalogStore::open(dir.path()).unwrap();
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn test_checkpoint_truncates_wal() {
        let (dir, store) = make_store();
        let txn = store.begin("create").unwrap();
        store.insert(&key(2, "x"), b"1").unwrap();
        store.replace(&key(2, "X"), b"2").unwrap();
        store.commit(txn).unwrap();
        store.checkpoint().unwrap();
        let wal_len = fs::metadata(dir.path().join(WAL_FILENAME)).unwrap().len();
        assert_eq!(wal_len, 0);
        drop(store);

        let store = PersistentCatalogStore::open(dir.path()).unwrap();
        assert_eq!(store.find(&key(2, "x")).unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn test_checkpoint_refused_inside_transaction() {
        let (_dir, store) = make_store();
        let txn = store.begin("rename").unwrap();
        match store.checkpoint() {
            Err(CatalogError::Transaction { .. }) => {}
            other => panic!("expected Transaction error, got {:?}", other),
        }
        store.commit(txn).unwrap();
        store.checkpoint().unwrap();
    }

    #[test]
    fn test_replace_keeps_stored_spelling_after_reopen() {
        let (dir, store) = make_store();
        store.insert(&key(1, "Docs"), b"1").unwrap();
        store.replace(&key(1, "DOCS"), b"2").unwrap();
        drop(store);

        let store = PersistentCatalogStore::open(dir.path()).unwrap();
        let (stored, record) = store.first_from(&key(1, "docs")).unwrap().unwrap();
        assert_eq!(String::from_utf16(stored.name.units()).unwrap(), "Docs");
        assert_eq!(record, b"2".to_vec());
    }

    #[test]
    fn test_txn_ids_not_reused_after_reopen() {
        let (dir, store) = make_store();
        let first = store.begin("a").unwrap();
        store.commit(first).unwrap();
        drop(store);
        let store = PersistentCatalogStore::open(dir.path()).unwrap();
        let second = store.begin("b").unwrap();
        assert!(second > first);
        store.commit(second).unwrap();
    }

    #[test]
    fn test_strict_insert_and_delete() {
        let (_dir, store) = make_store();
        store.insert(&key(1, "a"), b"1").unwrap();
        match store.insert(&key(1, "A"), b"2") {
            Err(CatalogError::AlreadyExists { .. }) => {}
            other => panic!("expected AlreadyExists, got {:?}", other),
        }
        store.delete(&key(1, "a")).unwrap();
        match store.delete(&key(1, "a")) {
            Err(CatalogError::NotFound { .. }) => {}
            other => panic!("expected NotFound, got {:?}", other),
        }
    }
}
