//! Volume configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CatalogError, CatalogResult};
use crate::types::Cnid;

/// Identifiers with fixed meaning on the volume.
///
/// `hidden_dir` is the id given to the hidden indirection directory at format
/// time; mount replaces it with the id actually found on the volume.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservedIds {
    /// Parent id of the root folder.
    pub root_parent: u32,
    /// The root folder.
    pub root: u32,
    /// The hidden directory holding indirection nodes.
    pub hidden_dir: u32,
    /// Lowest id handed out to user objects.
    pub first_user: u32,
}

impl Default for ReservedIds {
    fn default() -> Self {
        Self {
            root_parent: 0,
            root: 1,
            hidden_dir: 19,
            first_user: 2,
        }
    }
}

impl ReservedIds {
    /// The root folder id.
    pub fn root(&self) -> Cnid {
        Cnid::new(self.root)
    }

    /// Parent id of the root folder.
    pub fn root_parent(&self) -> Cnid {
        Cnid::new(self.root_parent)
    }

    /// The hidden directory id.
    pub fn hidden_dir(&self) -> Cnid {
        Cnid::new(self.hidden_dir)
    }

    /// True when the allocator must not hand out `id`.
    pub fn is_reserved(&self, id: u32) -> bool {
        id < self.first_user || id == self.root_parent || id == self.root || id == self.hidden_dir
    }
}

/// Volume configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeConfig {
    /// Reserved identifier table.
    pub reserved: ReservedIds,
    /// Name of the root folder.
    pub volume_name: String,
    /// Name of the hidden directory under the root.
    pub hidden_dir_name: String,
    /// Whether `format` creates the hidden directory.
    pub create_hidden_dir: bool,
    /// Attempts at picking an unused link id before giving up with `NoSpace`.
    pub max_link_id_attempts: u32,
    /// Committed transactions retained by the in-memory journal.
    pub journal_max_entries: usize,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            reserved: ReservedIds::default(),
            volume_name: "Untitled".to_string(),
            hidden_dir_name: "\u{2400}\u{2400}\u{2400}\u{2400}HFS+ Private Data".to_string(),
            create_hidden_dir: true,
            max_link_id_attempts: 64,
            journal_max_entries: 10_000,
        }
    }
}

impl VolumeConfig {
    /// Parses a JSON document; missing fields take their defaults.
    pub fn from_json(json: &str) -> CatalogResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| CatalogError::Storage(format!("invalid volume config: {}", e)))
    }

    /// Reads a JSON config file.
    pub fn load(path: &Path) -> CatalogResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Serializes the config as pretty JSON.
    pub fn to_json(&self) -> CatalogResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| CatalogError::Storage(format!("failed to encode volume config: {}", e)))
    }
}
