//! Transaction scopes over the volume journal.
//!
//! Every mutating catalog operation runs its store updates inside one
//! [`TransactionScope`]. The scope begins a journal transaction on creation
//! and commits it exactly once: explicitly through [`TransactionScope::commit`]
//! or, on an early return, from `Drop`.

use std::collections::VecDeque;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{CatalogError, CatalogResult};

/// Identifier of a journal transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxnId(u64);

impl TxnId {
    /// Wraps a raw transaction number.
    pub const fn new(id: u64) -> Self {
        TxnId(id)
    }

    /// Returns the raw transaction number.
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn-{}", self.0)
    }
}

/// Journaling transaction manager.
///
/// A transaction groups the store mutations issued between `begin` and
/// `commit` so that crash recovery applies all of them or none.
pub trait Journal: Send + Sync {
    /// Opens a transaction. `tag` names the operation for diagnostics.
    fn begin(&self, tag: &'static str) -> CatalogResult<TxnId>;

    /// Commits a transaction opened by `begin`.
    fn commit(&self, txn: TxnId) -> CatalogResult<()>;
}

/// RAII wrapper around one journal transaction.
pub struct TransactionScope<'a> {
    journal: &'a dyn Journal,
    txn: Option<TxnId>,
    tag: &'static str,
}

impl<'a> TransactionScope<'a> {
    /// Begins a transaction on `journal`.
    pub fn begin(journal: &'a dyn Journal, tag: &'static str) -> CatalogResult<Self> {
        let txn = journal.begin(tag)?;
        debug!(%txn, tag, "transaction begun");
        Ok(Self {
            journal,
            txn: Some(txn),
            tag,
        })
    }

    /// Id of the open transaction.
    pub fn id(&self) -> Option<TxnId> {
        self.txn
    }

    /// Commits the transaction.
    pub fn commit(mut self) -> CatalogResult<()> {
        match self.txn.take() {
            Some(txn) => {
                debug!(%txn, tag = self.tag, "transaction committed");
                self.journal.commit(txn)
            }
            None => Ok(()),
        }
    }
}

impl Drop for TransactionScope<'_> {
    fn drop(&mut self) {
        if let Some(txn) = self.txn.take() {
            warn!(%txn, tag = self.tag, "transaction scope dropped without commit, committing");
            if let Err(e) = self.journal.commit(txn) {
                warn!(%txn, error = %e, "commit on drop failed");
            }
        }
    }
}

/// A committed transaction kept in the in-memory history.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JournalRecord {
    /// Monotonically increasing sequence number.
    pub sequence: u64,
    /// The committed transaction.
    pub txn: TxnId,
    /// Operation tag passed to `begin`.
    pub tag: &'static str,
    /// Commit time in seconds since the Unix epoch.
    pub committed_at: u64,
}

struct JournalState {
    open: Option<(TxnId, &'static str)>,
    next_txn: u64,
    next_sequence: u64,
    begun: u64,
    committed: u64,
    history: VecDeque<JournalRecord>,
}

/// In-memory journal.
///
/// Allows one open transaction at a time and keeps a bounded history of
/// committed transactions, oldest first.
pub struct MemoryJournal {
    state: Mutex<JournalState>,
    max_entries: usize,
}

impl MemoryJournal {
    /// Creates a journal retaining at most `max_entries` committed records.
    pub fn new(max_entries: usize) -> Self {
        Self {
            state: Mutex::new(JournalState {
                open: None,
                next_txn: 1,
                next_sequence: 1,
                begun: 0,
                committed: 0,
                history: VecDeque::new(),
            }),
            max_entries,
        }
    }

    /// Number of transactions begun.
    pub fn begun(&self) -> u64 {
        self.state.lock().begun
    }

    /// Number of transactions committed.
    pub fn committed(&self) -> u64 {
        self.state.lock().committed
    }

    /// Number of transactions currently open (0 or 1).
    pub fn open_scopes(&self) -> u64 {
        let state = self.state.lock();
        state.begun - state.committed
    }

    /// Committed records, oldest first.
    pub fn history(&self) -> Vec<JournalRecord> {
        self.state.lock().history.iter().cloned().collect()
    }

    /// Tags of the committed records, oldest first.
    pub fn tags(&self) -> Vec<&'static str> {
        self.state.lock().history.iter().map(|r| r.tag).collect()
    }
}

impl Default for MemoryJournal {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl Journal for MemoryJournal {
    fn begin(&self, tag: &'static str) -> CatalogResult<TxnId> {
        let mut state = self.state.lock();
        if let Some((open, open_tag)) = state.open {
            return Err(CatalogError::transaction(format!(
                "cannot begin '{}': {} ('{}') is still open",
                tag, open, open_tag
            )));
        }
        let txn = TxnId(state.next_txn);
        state.next_txn += 1;
        state.begun += 1;
        state.open = Some((txn, tag));
        Ok(txn)
    }

    fn commit(&self, txn: TxnId) -> CatalogResult<()> {
        let mut state = self.state.lock();
        let tag = match state.open {
            Some((open, tag)) if open == txn => tag,
            _ => {
                return Err(CatalogError::transaction(format!(
                    "{} is not the open transaction",
                    txn
                )))
            }
        };
        state.open = None;
        state.committed += 1;

        let sequence = state.next_sequence;
        state.next_sequence += 1;
        let committed_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        state.history.push_back(JournalRecord {
            sequence,
            txn,
            tag,
            committed_at,
        });
        while state.history.len() > self.max_entries {
            state.history.pop_front();
        }
        Ok(())
    }
}
