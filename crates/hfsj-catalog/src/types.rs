//! Catalog node ids, file kinds and HFS+ dates.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Catalog node identifier naming a file, folder or indirection node on the volume.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Cnid(u32);

impl Cnid {
    /// Creates a new Cnid from a raw u32 value
    pub const fn new(id: u32) -> Self {
        Cnid(id)
    }

    /// Returns the raw u32 value of this identifier
    pub const fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for Cnid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Seconds between 1904-01-01 (the HFS+ epoch) and 1970-01-01.
const HFS_EPOCH_OFFSET: u64 = 2_082_844_800;

/// HFS+ date: seconds since 1904-01-01 00:00 UTC.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HfsDate(u32);

impl HfsDate {
    /// Creates a date from raw seconds since the HFS+ epoch
    pub const fn new(secs: u32) -> Self {
        HfsDate(secs)
    }

    /// Returns the current date, clamped to the representable range
    pub fn now() -> Self {
        let unix = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self::from_unix(unix)
    }

    /// Converts Unix seconds to an HFS+ date
    pub fn from_unix(secs: u64) -> Self {
        HfsDate(u32::try_from(secs + HFS_EPOCH_OFFSET).unwrap_or(u32::MAX))
    }

    /// Converts this date to Unix seconds (0 for pre-1970 dates)
    pub fn to_unix(&self) -> u64 {
        u64::from(self.0).saturating_sub(HFS_EPOCH_OFFSET)
    }

    /// Returns the raw seconds since the HFS+ epoch
    pub const fn as_u32(&self) -> u32 {
        self.0
    }
}

/// File-type bits of a BSD mode.
pub const S_IFMT: u16 = 0o170000;
/// Socket.
pub const S_IFSOCK: u16 = 0o140000;
/// Symbolic link.
pub const S_IFLNK: u16 = 0o120000;
/// Regular file.
pub const S_IFREG: u16 = 0o100000;
/// Block device.
pub const S_IFBLK: u16 = 0o060000;
/// Directory.
pub const S_IFDIR: u16 = 0o040000;
/// Character device.
pub const S_IFCHR: u16 = 0o020000;
/// FIFO.
pub const S_IFIFO: u16 = 0o010000;
/// Sticky bit.
pub const S_ISVTX: u16 = 0o001000;

/// File type enumeration matching POSIX file types
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileKind {
    /// Regular file (S_IFREG)
    Regular,
    /// Directory (S_IFDIR)
    Directory,
    /// Symbolic link (S_IFLNK)
    Symlink,
    /// Block device (S_IFBLK)
    BlockDevice,
    /// Character device (S_IFCHR)
    CharDevice,
    /// FIFO/named pipe (S_IFIFO)
    Fifo,
    /// Socket (S_IFSOCK)
    Socket,
}

impl FileKind {
    /// Derives the kind from the S_IFMT bits of a mode. A mode without type
    /// bits (as written by classic Mac OS) is a regular file.
    pub fn from_mode(mode: u16) -> Self {
        match mode & S_IFMT {
            S_IFDIR => FileKind::Directory,
            S_IFLNK => FileKind::Symlink,
            S_IFBLK => FileKind::BlockDevice,
            S_IFCHR => FileKind::CharDevice,
            S_IFIFO => FileKind::Fifo,
            S_IFSOCK => FileKind::Socket,
            _ => FileKind::Regular,
        }
    }

    /// Returns the S_IFMT bits for this kind
    pub fn mode_bits(&self) -> u16 {
        match self {
            FileKind::Regular => S_IFREG,
            FileKind::Directory => S_IFDIR,
            FileKind::Symlink => S_IFLNK,
            FileKind::BlockDevice => S_IFBLK,
            FileKind::CharDevice => S_IFCHR,
            FileKind::Fifo => S_IFIFO,
            FileKind::Socket => S_IFSOCK,
        }
    }

    /// True for block and character devices, which carry a device number.
    pub fn has_rdev(&self) -> bool {
        matches!(self, FileKind::BlockDevice | FileKind::CharDevice)
    }
}

/// Which fork of a file an object handle refers to.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum ForkKind {
    /// The data fork; the only fork reachable through catalog names.
    #[default]
    Data,
    /// The resource fork pseudo-file.
    Resource,
}
