//! `hfsj-cat`: command-line access to a catalog store directory.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};

use crate::config::VolumeConfig;
use crate::content::DirContentStore;
use crate::fsck::{check_catalog, suggest_repair, FsckConfig};
use crate::journal::Journal;
use crate::persistent::PersistentCatalogStore;
use crate::store::CatalogStore;
use crate::types::{Cnid, FileKind};
use crate::volume::{Volume, VolumeParts};

/// Command line of `hfsj-cat`: a store directory and one operation.
#[derive(Parser, Debug)]
#[command(name = "hfsj-cat")]
#[command(about = "Inspect and modify a journaled HFS+ catalog store", long_about = None)]
pub struct Cli {
    /// Directory holding the catalog WAL, checkpoint and content.
    pub store: PathBuf,

    /// JSON volume configuration.
    #[arg(short, long, env = "HFSJ_CONFIG")]
    pub config: Option<PathBuf>,

    /// Operation to run.
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Format an empty store.
    Mkfs,
    /// List a directory.
    Ls {
        /// Directory path from the root.
        #[arg(default_value = "/")]
        path: String,
    },
    /// Create a directory.
    Mkdir {
        /// Path from the root.
        path: String,
    },
    /// Create an empty regular file.
    Touch {
        /// Path from the root.
        path: String,
    },
    /// Create a hard link, or a symbolic link with `-s`.
    Ln {
        /// Make a symbolic link whose target is `src`.
        #[arg(short, long)]
        symbolic: bool,
        /// Existing path, or the symlink target.
        src: String,
        /// New path.
        dst: String,
    },
    /// Print the target of a symbolic link.
    Readlink {
        /// Path from the root.
        path: String,
    },
    /// Remove a file.
    Rm {
        /// Path from the root.
        path: String,
    },
    /// Remove an empty directory.
    Rmdir {
        /// Path from the root.
        path: String,
    },
    /// Rename an entry.
    Mv {
        /// Existing path.
        src: String,
        /// New path.
        dst: String,
    },
    /// Show what an entry resolves to.
    Stat {
        /// Path from the root.
        path: String,
    },
    /// Check catalog consistency.
    Fsck,
    /// Snapshot the catalog and truncate the WAL.
    Checkpoint,
}

/// An opened store: the volume plus the concrete store for checkpoints.
struct Opened {
    volume: Volume,
    store: Arc<PersistentCatalogStore>,
}

impl Cli {
    /// Runs the command, writing its output to `out`.
    pub fn run(self, out: &mut impl Write) -> Result<()> {
        let config = match &self.config {
            Some(path) => VolumeConfig::load(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => VolumeConfig::default(),
        };

        match &self.command {
            Command::Mkfs => {
                let opened = open(&self.store, config, true)?;
                let stats = opened.volume.stats();
                writeln!(
                    out,
                    "formatted {} (next id {}, {} folders)",
                    self.store.display(),
                    stats.next_cnid,
                    stats.folder_count
                )?;
            }
            Command::Ls { path } => {
                let opened = open(&self.store, config, false)?;
                let volume = &opened.volume;
                let dir = resolve_dir(volume, path)?;
                let mut session = volume.opendir(dir)?;
                loop {
                    let batch = volume.readdir(&mut session, 64)?;
                    if batch.is_empty() {
                        break;
                    }
                    for entry in batch {
                        writeln!(out, "{:>8} {:<9} {}", entry.cnid.as_u32(), kind_label(entry.kind), entry.name)?;
                    }
                }
                volume.releasedir(session);
            }
            Command::Mkdir { path } => {
                let opened = open(&self.store, config, false)?;
                let (parent, name) = split_parent(&opened.volume, path)?;
                match opened.volume.mkdir(parent, &name, 0o755)? {
                    Some(dir) => writeln!(out, "{}", dir.resolved_id)?,
                    None => writeln!(out, "ignored: parent is the hidden directory")?,
                }
            }
            Command::Touch { path } => {
                let opened = open(&self.store, config, false)?;
                let (parent, name) = split_parent(&opened.volume, path)?;
                let file = opened.volume.create(parent, &name, 0o644)?;
                writeln!(out, "{}", file.resolved_id)?;
            }
            Command::Ln { symbolic, src, dst } => {
                let opened = open(&self.store, config, false)?;
                let volume = &opened.volume;
                let (parent, name) = split_parent(volume, dst)?;
                let entry = if *symbolic {
                    volume.symlink(parent, &name, src.as_bytes())?
                } else {
                    let (src_parent, src_name) = split_parent(volume, src)?;
                    let mut existing = volume.lookup(src_parent, &src_name)?;
                    volume.link(&mut existing, parent, &name)?
                };
                writeln!(out, "{} -> {}", entry.entry_id, entry.resolved_id)?;
            }
            Command::Readlink { path } => {
                let opened = open(&self.store, config, false)?;
                let (parent, name) = split_parent(&opened.volume, path)?;
                let entry = opened.volume.lookup(parent, &name)?;
                let target = opened.volume.readlink(&entry)?;
                writeln!(out, "{}", String::from_utf8_lossy(&target))?;
            }
            Command::Rm { path } => {
                let opened = open(&self.store, config, false)?;
                let (parent, name) = split_parent(&opened.volume, path)?;
                opened.volume.unlink(parent, &name)?;
            }
            Command::Rmdir { path } => {
                let opened = open(&self.store, config, false)?;
                let (parent, name) = split_parent(&opened.volume, path)?;
                opened.volume.rmdir(parent, &name)?;
            }
            Command::Mv { src, dst } => {
                let opened = open(&self.store, config, false)?;
                let volume = &opened.volume;
                let (sp, sn) = split_parent(volume, src)?;
                let (dp, dn) = split_parent(volume, dst)?;
                volume.rename(sp, &sn, dp, &dn)?;
            }
            Command::Stat { path } => {
                let opened = open(&self.store, config, false)?;
                let (parent, name) = split_parent(&opened.volume, path)?;
                let entry = opened.volume.lookup(parent, &name)?;
                writeln!(
                    out,
                    "entry {} object {} kind {} link_id {} nlink {} mode {:o}",
                    entry.entry_id,
                    entry.resolved_id,
                    kind_label(entry.kind),
                    entry.link_id,
                    entry.object.nlink(),
                    entry.object.mode()
                )?;
            }
            Command::Fsck => {
                let opened = open(&self.store, config, false)?;
                let report = check_catalog(&opened.volume, &FsckConfig::default())?;
                for finding in &report.findings {
                    writeln!(out, "{}", finding)?;
                    for action in suggest_repair(&finding.issue) {
                        writeln!(out, "    suggested: {:?}", action)?;
                    }
                }
                writeln!(
                    out,
                    "{} records, {} errors, {} warnings",
                    report.records_scanned, report.errors, report.warnings
                )?;
                if !report.is_clean() {
                    bail!("catalog has {} errors", report.errors);
                }
            }
            Command::Checkpoint => {
                let opened = open(&self.store, config, false)?;
                opened.store.checkpoint()?;
                writeln!(out, "checkpoint written to {}", opened.store.dir().display())?;
            }
        }
        Ok(())
    }
}

fn open(dir: &Path, config: VolumeConfig, format: bool) -> Result<Opened> {
    let store = Arc::new(
        PersistentCatalogStore::open(dir)
            .with_context(|| format!("opening catalog store {}", dir.display()))?,
    );
    let content = Arc::new(DirContentStore::open(&dir.join("content"))?);
    let catalog: Arc<dyn CatalogStore> = store.clone();
    let journal: Arc<dyn Journal> = store.clone();
    let parts = VolumeParts::new(catalog, journal).with_content(content);
    let volume = if format {
        Volume::format(parts, config)?
    } else {
        Volume::mount(parts, config).context("mounting catalog (run mkfs first?)")?
    };
    Ok(Opened { volume, store })
}

fn components(path: &str) -> Vec<&str> {
    path.split('/').filter(|c| !c.is_empty()).collect()
}

/// Walks `path` from the root; every component must be a directory.
fn resolve_dir(volume: &Volume, path: &str) -> Result<Cnid> {
    let mut dir = volume.root();
    for name in components(path) {
        let entry = volume.lookup(dir, name)?;
        if entry.kind != FileKind::Directory {
            bail!("{}: not a directory", name);
        }
        dir = entry.resolved_id;
    }
    Ok(dir)
}

/// Splits `path` into its parent directory id and final name.
fn split_parent(volume: &Volume, path: &str) -> Result<(Cnid, String)> {
    let mut parts = components(path);
    let name = parts
        .pop()
        .ok_or_else(|| anyhow!("{:?} does not name an entry", path))?;
    let dir = resolve_dir(volume, &parts.join("/"))?;
    Ok((dir, name.to_string()))
}

fn kind_label(kind: FileKind) -> &'static str {
    match kind {
        FileKind::Regular => "file",
        FileKind::Directory => "dir",
        FileKind::Symlink => "symlink",
        FileKind::BlockDevice => "blockdev",
        FileKind::CharDevice => "chardev",
        FileKind::Fifo => "fifo",
        FileKind::Socket => "socket",
    }
}
