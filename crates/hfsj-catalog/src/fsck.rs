//! Catalog consistency checker.
//!
//! Report-only: a single ordered scan of the store collects folders, threads,
//! hard-link pointers and indirection nodes, then cross-checks them. Nothing
//! is modified; [`suggest_repair`] describes what a repair would do.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info};

use crate::codec::{CatalogKey, CatalogRecord, ThreadRecord};
use crate::error::CatalogResult;
use crate::object::parse_indirect_name;
use crate::store::iterate_from;
use crate::types::Cnid;
use crate::volume::Volume;

/// Severity level for a check finding.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FsckSeverity {
    /// Catalog inconsistency.
    Error,
    /// Leftover state that recovers on its own or is harmless.
    Warning,
}

impl FsckSeverity {
    /// Returns true if this severity is Error.
    pub fn is_error(&self) -> bool {
        matches!(self, FsckSeverity::Error)
    }
}

impl std::fmt::Display for FsckSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FsckSeverity::Error => write!(f, "ERROR"),
            FsckSeverity::Warning => write!(f, "WARNING"),
        }
    }
}

/// Types of catalog inconsistencies.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FsckIssue {
    /// Folder record without a thread pointing back at it.
    MissingThread {
        /// The folder.
        folder: Cnid,
    },
    /// Thread record whose target is not the folder it names.
    OrphanThread {
        /// Id the thread is keyed by.
        folder: Cnid,
    },
    /// Recorded valence differs from the children found.
    ValenceMismatch {
        /// The folder.
        folder: Cnid,
        /// Valence stored in the folder record.
        recorded: u32,
        /// Children counted in the catalog.
        counted: u32,
    },
    /// Pointer whose indirection node does not exist.
    DanglingPointer {
        /// Directory holding the pointer.
        parent: Cnid,
        /// Pointer name.
        name: String,
        /// Link id it refers to.
        link_id: u32,
    },
    /// Indirection node no pointer refers to.
    OrphanIndirectNode {
        /// Link id of the node.
        link_id: u32,
        /// Object id of the node.
        cnid: Cnid,
    },
    /// Link count stored on an indirection node differs from its pointers.
    LinkCountMismatch {
        /// Link id of the node.
        link_id: u32,
        /// Count stored in the node.
        recorded: u32,
        /// Pointers found.
        pointers: u32,
    },
    /// A `temp<cnid>` node left from an unlink while open.
    LeftoverTempNode {
        /// Node name.
        name: String,
    },
    /// Record that does not decode.
    CorruptRecord {
        /// Key of the record.
        key: String,
        /// Decoder message.
        detail: String,
    },
}

impl std::fmt::Display for FsckIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FsckIssue::MissingThread { folder } => {
                write!(f, "Folder {} has no thread record", folder)
            }
            FsckIssue::OrphanThread { folder } => {
                write!(f, "Thread of {} does not lead to its folder", folder)
            }
            FsckIssue::ValenceMismatch {
                folder,
                recorded,
                counted,
            } => write!(
                f,
                "Valence mismatch for folder {}: recorded {}, found {}",
                folder, recorded, counted
            ),
            FsckIssue::DanglingPointer {
                parent,
                name,
                link_id,
            } => write!(
                f,
                "Pointer '{}' in folder {} refers to missing iNode{}",
                name, parent, link_id
            ),
            FsckIssue::OrphanIndirectNode { link_id, cnid } => {
                write!(f, "iNode{} (object {}) has no pointers", link_id, cnid)
            }
            FsckIssue::LinkCountMismatch {
                link_id,
                recorded,
                pointers,
            } => write!(
                f,
                "Link count mismatch for iNode{}: recorded {}, {} pointers",
                link_id, recorded, pointers
            ),
            FsckIssue::LeftoverTempNode { name } => {
                write!(f, "Leftover temporary node '{}'", name)
            }
            FsckIssue::CorruptRecord { key, detail } => {
                write!(f, "Corrupt record at {}: {}", key, detail)
            }
        }
    }
}

/// A single finding from the checker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FsckFinding {
    /// Severity of this finding.
    pub severity: FsckSeverity,
    /// The detected issue.
    pub issue: FsckIssue,
}

impl std::fmt::Display for FsckFinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.severity, self.issue)
    }
}

/// Configuration for a catalog check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FsckConfig {
    /// Cross-check folder and thread records.
    pub check_threads: bool,
    /// Compare folder valences with their children.
    pub check_valence: bool,
    /// Cross-check pointers and indirection nodes.
    pub check_links: bool,
    /// Maximum errors recorded before findings are dropped.
    pub max_errors: usize,
}

impl Default for FsckConfig {
    fn default() -> Self {
        Self {
            check_threads: true,
            check_valence: true,
            check_links: true,
            max_errors: 100,
        }
    }
}

/// Report of a catalog check.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FsckReport {
    /// All recorded findings.
    pub findings: Vec<FsckFinding>,
    /// Count of error-severity findings.
    pub errors: u64,
    /// Count of warning-severity findings.
    pub warnings: u64,
    /// Records read from the store.
    pub records_scanned: u64,
}

impl FsckReport {
    /// Returns true if no errors were found.
    pub fn is_clean(&self) -> bool {
        self.errors == 0
    }

    fn push(&mut self, config: &FsckConfig, severity: FsckSeverity, issue: FsckIssue) {
        if severity.is_error() {
            if self.errors >= config.max_errors as u64 {
                return;
            }
            self.errors += 1;
        } else {
            self.warnings += 1;
        }
        self.findings.push(FsckFinding { severity, issue });
    }
}

/// Action that would repair an issue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FsckRepairAction {
    /// Remove a catalog entry.
    RemoveEntry {
        /// Parent folder.
        parent: Cnid,
        /// Entry name.
        name: String,
    },
    /// Remove an indirection node from the hidden directory.
    RemoveIndirectNode {
        /// Link id of the node.
        link_id: u32,
    },
    /// Remove a thread record that leads nowhere.
    RemoveThread {
        /// Id the thread is keyed by.
        folder: Cnid,
    },
    /// Rewrite the thread record of a folder from its folder record.
    RewriteThread {
        /// The folder.
        folder: Cnid,
    },
    /// Store a corrected valence.
    SetValence {
        /// The folder.
        folder: Cnid,
        /// Correct valence.
        valence: u32,
    },
    /// Store a corrected link count on an indirection node.
    SetLinkCount {
        /// Link id of the node.
        link_id: u32,
        /// Correct count.
        nlink: u32,
    },
}

/// Suggests repair actions for an issue.
pub fn suggest_repair(issue: &FsckIssue) -> Vec<FsckRepairAction> {
    match issue {
        FsckIssue::MissingThread { folder } => {
            vec![FsckRepairAction::RewriteThread { folder: *folder }]
        }
        FsckIssue::OrphanThread { folder } => {
            vec![FsckRepairAction::RemoveThread { folder: *folder }]
        }
        FsckIssue::ValenceMismatch {
            folder, counted, ..
        } => vec![FsckRepairAction::SetValence {
            folder: *folder,
            valence: *counted,
        }],
        FsckIssue::DanglingPointer { parent, name, .. } => vec![FsckRepairAction::RemoveEntry {
            parent: *parent,
            name: name.clone(),
        }],
        FsckIssue::OrphanIndirectNode { link_id, .. } => {
            vec![FsckRepairAction::RemoveIndirectNode { link_id: *link_id }]
        }
        FsckIssue::LinkCountMismatch {
            link_id, pointers, ..
        } => vec![FsckRepairAction::SetLinkCount {
            link_id: *link_id,
            nlink: *pointers,
        }],
        FsckIssue::LeftoverTempNode { .. } | FsckIssue::CorruptRecord { .. } => vec![],
    }
}

/// What one scan of the catalog found.
#[derive(Default)]
struct CatalogScan {
    /// Folder id to (key, recorded valence).
    folders: BTreeMap<Cnid, (CatalogKey, u32)>,
    threads: BTreeMap<Cnid, ThreadRecord>,
    /// Children counted per folder, hidden directory excluded from the root.
    children: BTreeMap<Cnid, u32>,
    /// Pointers per link id, with their location.
    pointers: BTreeMap<u32, Vec<(Cnid, String)>>,
    /// Link id to (object id, recorded link count).
    nodes: BTreeMap<u32, (Cnid, u32)>,
    temp_nodes: BTreeSet<String>,
}

/// Scans the catalog of `volume` and reports inconsistencies.
///
/// Run it on a quiescent volume; the scan takes no locks.
pub fn check_catalog(volume: &Volume, config: &FsckConfig) -> CatalogResult<FsckReport> {
    let mut report = FsckReport::default();
    let scan = scan_catalog(volume, config, &mut report)?;

    if config.check_threads {
        check_threads(&scan, config, &mut report);
    }
    if config.check_valence {
        check_valence(&scan, config, &mut report);
    }
    if config.check_links {
        check_links(&scan, config, &mut report);
    }

    info!(
        records = report.records_scanned,
        errors = report.errors,
        warnings = report.warnings,
        "catalog check finished"
    );
    Ok(report)
}

fn scan_catalog(
    volume: &Volume,
    config: &FsckConfig,
    report: &mut FsckReport,
) -> CatalogResult<CatalogScan> {
    let mut scan = CatalogScan::default();
    let root = volume.root();
    let hidden = volume.hidden_dir().map(|h| h.cnid);
    let start = CatalogKey::thread(Cnid::new(0));

    for entry in iterate_from(volume.store().as_ref(), &start)? {
        let (key, bytes) = entry?;
        report.records_scanned += 1;
        let record = match CatalogRecord::decode(&bytes) {
            Ok(record) => record,
            Err(e) => {
                report.push(
                    config,
                    FsckSeverity::Error,
                    FsckIssue::CorruptRecord {
                        key: format!("{:?}", key),
                        detail: e.to_string(),
                    },
                );
                continue;
            }
        };

        let name = key.name.display_lossy();
        match record {
            CatalogRecord::FolderThread(thread) => {
                scan.threads.insert(key.parent, thread);
                continue;
            }
            CatalogRecord::Folder(f) => {
                scan.folders.insert(f.id, (key.clone(), f.valence));
                if key.parent == root && Some(f.id) == hidden {
                    continue;
                }
            }
            CatalogRecord::File(f) => {
                if volume.is_pointer(&f) {
                    scan.pointers
                        .entry(f.link_id())
                        .or_default()
                        .push((key.parent, name.clone()));
                } else if Some(key.parent) == hidden {
                    if let Some(link_id) = parse_indirect_name(&key) {
                        scan.nodes.insert(link_id, (f.id, f.permissions.special));
                    } else if name.starts_with("temp") {
                        scan.temp_nodes.insert(name.clone());
                    }
                }
            }
        }
        *scan.children.entry(key.parent).or_insert(0) += 1;
    }
    debug!(
        folders = scan.folders.len(),
        threads = scan.threads.len(),
        nodes = scan.nodes.len(),
        "catalog scanned"
    );
    Ok(scan)
}

fn check_threads(scan: &CatalogScan, config: &FsckConfig, report: &mut FsckReport) {
    for (folder, (key, _)) in &scan.folders {
        let matches = scan
            .threads
            .get(folder)
            .map_or(false, |t| t.target_key() == *key);
        if !matches {
            report.push(
                config,
                FsckSeverity::Error,
                FsckIssue::MissingThread { folder: *folder },
            );
        }
    }
    for folder in scan.threads.keys() {
        if !scan.folders.contains_key(folder) {
            report.push(
                config,
                FsckSeverity::Error,
                FsckIssue::OrphanThread { folder: *folder },
            );
        }
    }
}

fn check_valence(scan: &CatalogScan, config: &FsckConfig, report: &mut FsckReport) {
    for (folder, (_, recorded)) in &scan.folders {
        let counted = scan.children.get(folder).copied().unwrap_or(0);
        if counted != *recorded {
            report.push(
                config,
                FsckSeverity::Error,
                FsckIssue::ValenceMismatch {
                    folder: *folder,
                    recorded: *recorded,
                    counted,
                },
            );
        }
    }
}

fn check_links(scan: &CatalogScan, config: &FsckConfig, report: &mut FsckReport) {
    for (link_id, pointers) in &scan.pointers {
        if scan.nodes.contains_key(link_id) {
            continue;
        }
        for (parent, name) in pointers {
            report.push(
                config,
                FsckSeverity::Error,
                FsckIssue::DanglingPointer {
                    parent: *parent,
                    name: name.clone(),
                    link_id: *link_id,
                },
            );
        }
    }
    for (link_id, (cnid, recorded)) in &scan.nodes {
        let pointers = scan.pointers.get(link_id).map_or(0, |p| p.len() as u32);
        if pointers == 0 {
            report.push(
                config,
                FsckSeverity::Error,
                FsckIssue::OrphanIndirectNode {
                    link_id: *link_id,
                    cnid: *cnid,
                },
            );
        } else if pointers != *recorded {
            report.push(
                config,
                FsckSeverity::Error,
                FsckIssue::LinkCountMismatch {
                    link_id: *link_id,
                    recorded: *recorded,
                    pointers,
                },
            );
        }
    }
    for name in &scan.temp_nodes {
        report.push(
            config,
            FsckSeverity::Warning,
            FsckIssue::LeftoverTempNode { name: name.clone() },
        );
    }
}
