#![warn(missing_docs)]

//! Journaled HFS+ catalog engine: name lookup with hard-link indirection,
//! resumable directory enumeration, hard links, entry creation and rename
//! over an ordered catalog store.

pub mod catalog;
pub mod cli;
pub mod codec;
pub mod config;
pub mod content;
pub mod create;
pub mod error;
pub mod fsck;
pub mod journal;
pub mod link;
pub mod object;
pub mod persistent;
pub mod readdir;
pub mod rename;
pub mod resolver;
pub mod store;
pub mod types;
pub mod unicode;
pub mod volume;

pub use codec::{CatalogKey, CatalogRecord, FileRecord, FolderRecord, ThreadRecord};
pub use config::{ReservedIds, VolumeConfig};
pub use content::{ContentStore, DirContentStore, MemoryContentStore};
pub use error::{CatalogError, CatalogResult};
pub use fsck::{check_catalog, FsckConfig, FsckReport};
pub use journal::{Journal, MemoryJournal, TransactionScope, TxnId};
pub use link::{LinkIdSource, RandomLinkIds, ScriptedLinkIds};
pub use object::{Object, OpenHandle};
pub use persistent::PersistentCatalogStore;
pub use readdir::{DirEntry, DirSession, EnumState};
pub use resolver::ResolvedEntry;
pub use store::{CatalogStore, MemoryCatalogStore};
pub use types::{Cnid, FileKind, ForkKind, HfsDate};
pub use unicode::{HfsName, HfsTextCodec, TextCodec};
pub use volume::{HiddenDir, Volume, VolumeParts, VolumeStats};
