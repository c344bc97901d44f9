//! Big-endian encoding of catalog keys and records.
//!
//! Layouts follow the HFS+ catalog B-tree leaf format: a key is
//! `key_length, parent_id, name_length, name units`, and the record body
//! starts with a 16-bit record type. Folder records are 88 bytes, file records
//! 248 bytes and thread records at least 10 bytes.

use std::cmp::Ordering;
use std::fmt;

use crate::error::{CatalogError, CatalogResult};
use crate::types::{Cnid, HfsDate, S_IFDIR};
use crate::unicode::{HfsName, MAX_NAME_UNITS};

/// Record type of a folder record.
pub const RECORD_FOLDER: u16 = 0x0001;
/// Record type of a file record.
pub const RECORD_FILE: u16 = 0x0002;
/// Record type of a folder thread record.
pub const RECORD_FOLDER_THREAD: u16 = 0x0003;

/// Encoded size of a folder record.
pub const FOLDER_RECORD_SIZE: usize = 88;
/// Encoded size of a file record.
pub const FILE_RECORD_SIZE: usize = 248;
/// Smallest valid thread record (empty name).
pub const MIN_THREAD_SIZE: usize = 10;

/// `fdType` of a hard-link pointer record ("hlnk").
pub const HARDLINK_TYPE: u32 = 0x686c_6e6b;
/// `fdCreator` of a hard-link pointer record ("hfs+").
pub const HFSPLUS_CREATOR: u32 = 0x6866_732b;
/// `fdType` of a symbolic link ("slnk").
pub const SYMLINK_TYPE: u32 = 0x736c_6e6b;
/// `fdCreator` of a symbolic link ("rhap").
pub const SYMLINK_CREATOR: u32 = 0x7268_6170;

/// Key of a catalog record: parent folder plus entry name.
///
/// Ordered by parent id, then by case-insensitive name collation. The thread
/// record of folder `f` lives at `(f, "")`, ahead of all of its children.
#[derive(Clone, PartialEq, Eq)]
pub struct CatalogKey {
    /// Folder containing the entry.
    pub parent: Cnid,
    /// Entry name.
    pub name: HfsName,
}

impl CatalogKey {
    /// Builds a key.
    pub fn new(parent: Cnid, name: HfsName) -> Self {
        Self { parent, name }
    }

    /// Key of the thread record of folder `cnid`.
    pub fn thread(cnid: Cnid) -> Self {
        Self::new(cnid, HfsName::empty())
    }

    /// True when this key names a thread record.
    pub fn is_thread(&self) -> bool {
        self.name.is_empty()
    }

    /// Encodes the key.
    pub fn encode(&self) -> Vec<u8> {
        let units = self.name.units();
        let mut w = Writer::with_capacity(8 + units.len() * 2);
        w.u16((6 + units.len() * 2) as u16);
        w.u32(self.parent.as_u32());
        write_units(&mut w, units);
        w.into_inner()
    }

    /// Decodes a key produced by [`CatalogKey::encode`].
    pub fn decode(bytes: &[u8]) -> CatalogResult<Self> {
        let mut r = Reader::new(bytes);
        let key_len = r.u16()? as usize;
        if key_len + 2 > bytes.len() || key_len < 6 {
            return Err(CatalogError::corrupt(format!(
                "key length {} does not fit in {} bytes",
                key_len,
                bytes.len()
            )));
        }
        let parent = Cnid::new(r.u32()?);
        let name = read_units(&mut r)?;
        Ok(Self { parent, name })
    }
}

impl PartialOrd for CatalogKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CatalogKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.parent
            .cmp(&other.parent)
            .then_with(|| self.name.cmp(&other.name))
    }
}

impl fmt::Debug for CatalogKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {:?})", self.parent, self.name)
    }
}

/// BSD ownership and mode stored with every folder and file record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BsdPermissions {
    /// Owner uid.
    pub owner: u32,
    /// Group gid.
    pub group: u32,
    /// Administrator flags.
    pub admin_flags: u8,
    /// Owner flags.
    pub owner_flags: u8,
    /// BSD file mode including S_IFMT bits.
    pub mode: u16,
    /// Overloaded field: device number, link count of an indirection node, or
    /// the link id of a hard-link pointer.
    pub special: u32,
}

/// Finder `FInfo` of a file record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FileInfo {
    /// Four-character file type.
    pub file_type: u32,
    /// Four-character creator.
    pub creator: u32,
    /// Finder flags.
    pub flags: u16,
    /// Icon position, vertical.
    pub location_v: i16,
    /// Icon position, horizontal.
    pub location_h: i16,
    /// Reserved.
    pub reserved: u16,
}

/// One allocation extent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Extent {
    /// First allocation block.
    pub start_block: u32,
    /// Number of blocks.
    pub block_count: u32,
}

/// Fork descriptor: size plus the first eight extents.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ForkData {
    /// Logical size in bytes.
    pub logical_size: u64,
    /// Clump size.
    pub clump_size: u32,
    /// Allocated blocks.
    pub total_blocks: u32,
    /// First extents.
    pub extents: [Extent; 8],
}

/// Folder record body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FolderRecord {
    /// Folder flags.
    pub flags: u16,
    /// Number of children.
    pub valence: u32,
    /// Folder id.
    pub id: Cnid,
    /// Creation date.
    pub create_date: HfsDate,
    /// Last content change.
    pub content_mod_date: HfsDate,
    /// Last attribute change (ctime).
    pub attribute_mod_date: HfsDate,
    /// Last access.
    pub access_date: HfsDate,
    /// Last backup.
    pub backup_date: HfsDate,
    /// Ownership and mode.
    pub permissions: BsdPermissions,
    /// Finder `DInfo`.
    pub user_info: [u8; 16],
    /// Finder `DXInfo`.
    pub finder_info: [u8; 16],
    /// Text encoding hint.
    pub text_encoding: u32,
    /// Reserved.
    pub reserved: u32,
}

impl FolderRecord {
    /// A fresh, empty folder.
    pub fn new(id: Cnid, date: HfsDate, mode: u16) -> Self {
        Self {
            flags: 0,
            valence: 0,
            id,
            create_date: date,
            content_mod_date: date,
            attribute_mod_date: date,
            access_date: date,
            backup_date: HfsDate::default(),
            permissions: BsdPermissions {
                mode: mode | S_IFDIR,
                ..BsdPermissions::default()
            },
            user_info: [0; 16],
            finder_info: [0; 16],
            text_encoding: 0,
            reserved: 0,
        }
    }
}

/// File record body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileRecord {
    /// File flags.
    pub flags: u16,
    /// Reserved.
    pub reserved1: u32,
    /// Entry id.
    pub id: Cnid,
    /// Creation date. For pointer records this is the sentinel date.
    pub create_date: HfsDate,
    /// Last content change.
    pub content_mod_date: HfsDate,
    /// Last attribute change (ctime).
    pub attribute_mod_date: HfsDate,
    /// Last access.
    pub access_date: HfsDate,
    /// Last backup.
    pub backup_date: HfsDate,
    /// Ownership and mode.
    pub permissions: BsdPermissions,
    /// Finder `FInfo`.
    pub user_info: FileInfo,
    /// Finder `FXInfo`.
    pub finder_info: [u8; 16],
    /// Text encoding hint.
    pub text_encoding: u32,
    /// Reserved.
    pub reserved2: u32,
    /// Data fork.
    pub data_fork: ForkData,
    /// Resource fork.
    pub resource_fork: ForkData,
}

impl FileRecord {
    /// A fresh, empty file.
    pub fn new(id: Cnid, date: HfsDate, mode: u16) -> Self {
        Self {
            flags: 0,
            reserved1: 0,
            id,
            create_date: date,
            content_mod_date: date,
            attribute_mod_date: date,
            access_date: date,
            backup_date: HfsDate::default(),
            permissions: BsdPermissions {
                mode,
                ..BsdPermissions::default()
            },
            user_info: FileInfo::default(),
            finder_info: [0; 16],
            text_encoding: 0,
            reserved2: 0,
            data_fork: ForkData::default(),
            resource_fork: ForkData::default(),
        }
    }

    /// True when type and creator carry the hard-link pointer signature.
    /// Callers still have to check the sentinel create date.
    pub fn has_hardlink_signature(&self) -> bool {
        self.user_info.file_type == HARDLINK_TYPE && self.user_info.creator == HFSPLUS_CREATOR
    }

    /// Link id carried by a pointer record.
    pub fn link_id(&self) -> u32 {
        self.permissions.special
    }
}

/// Folder thread record body: where the folder's own record lives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThreadRecord {
    /// Parent of the folder.
    pub parent: Cnid,
    /// Name of the folder inside `parent`.
    pub name: HfsName,
}

impl ThreadRecord {
    /// Key of the folder record this thread points at.
    pub fn target_key(&self) -> CatalogKey {
        CatalogKey::new(self.parent, self.name.clone())
    }
}

/// A decoded catalog record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CatalogRecord {
    /// Folder.
    Folder(FolderRecord),
    /// File, including pointer records.
    File(FileRecord),
    /// Folder thread.
    FolderThread(ThreadRecord),
}

impl CatalogRecord {
    /// Id carried by a folder or file record; `None` for threads.
    pub fn id(&self) -> Option<Cnid> {
        match self {
            CatalogRecord::Folder(f) => Some(f.id),
            CatalogRecord::File(f) => Some(f.id),
            CatalogRecord::FolderThread(_) => None,
        }
    }

    /// Encodes the record body.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            CatalogRecord::Folder(f) => encode_folder(f),
            CatalogRecord::File(f) => encode_file(f),
            CatalogRecord::FolderThread(t) => {
                let mut w = Writer::with_capacity(MIN_THREAD_SIZE + t.name.len() * 2);
                w.u16(RECORD_FOLDER_THREAD);
                w.u16(0);
                w.u32(t.parent.as_u32());
                write_units(&mut w, t.name.units());
                w.into_inner()
            }
        }
    }

    /// Decodes a record body, rejecting unknown types and short records.
    pub fn decode(bytes: &[u8]) -> CatalogResult<Self> {
        let mut r = Reader::new(bytes);
        let record_type = r.u16()?;
        let (min, label) = match record_type {
            RECORD_FOLDER => (FOLDER_RECORD_SIZE, "folder"),
            RECORD_FILE => (FILE_RECORD_SIZE, "file"),
            RECORD_FOLDER_THREAD => (MIN_THREAD_SIZE, "thread"),
            other => {
                return Err(CatalogError::corrupt(format!(
                    "invalid catalog record type {:#06x}",
                    other
                )))
            }
        };
        if bytes.len() < min {
            return Err(CatalogError::corrupt(format!(
                "short {} record: {} bytes, need {}",
                label,
                bytes.len(),
                min
            )));
        }
        match record_type {
            RECORD_FOLDER => Ok(CatalogRecord::Folder(decode_folder(&mut r)?)),
            RECORD_FILE => Ok(CatalogRecord::File(decode_file(&mut r)?)),
            _ => {
                r.u16()?;
                let parent = Cnid::new(r.u32()?);
                let name = read_units(&mut r)?;
                Ok(CatalogRecord::FolderThread(ThreadRecord { parent, name }))
            }
        }
    }
}

fn encode_folder(f: &FolderRecord) -> Vec<u8> {
    let mut w = Writer::with_capacity(FOLDER_RECORD_SIZE);
    w.u16(RECORD_FOLDER);
    w.u16(f.flags);
    w.u32(f.valence);
    w.u32(f.id.as_u32());
    write_dates(
        &mut w,
        [
            f.create_date,
            f.content_mod_date,
            f.attribute_mod_date,
            f.access_date,
            f.backup_date,
        ],
    );
    write_permissions(&mut w, &f.permissions);
    w.bytes(&f.user_info);
    w.bytes(&f.finder_info);
    w.u32(f.text_encoding);
    w.u32(f.reserved);
    w.into_inner()
}

fn decode_folder(r: &mut Reader<'_>) -> CatalogResult<FolderRecord> {
    let flags = r.u16()?;
    let valence = r.u32()?;
    let id = Cnid::new(r.u32()?);
    let [create_date, content_mod_date, attribute_mod_date, access_date, backup_date] =
        read_dates(r)?;
    Ok(FolderRecord {
        flags,
        valence,
        id,
        create_date,
        content_mod_date,
        attribute_mod_date,
        access_date,
        backup_date,
        permissions: read_permissions(r)?,
        user_info: r.array()?,
        finder_info: r.array()?,
        text_encoding: r.u32()?,
        reserved: r.u32()?,
    })
}

fn encode_file(f: &FileRecord) -> Vec<u8> {
    let mut w = Writer::with_capacity(FILE_RECORD_SIZE);
    w.u16(RECORD_FILE);
    w.u16(f.flags);
    w.u32(f.reserved1);
    w.u32(f.id.as_u32());
    write_dates(
        &mut w,
        [
            f.create_date,
            f.content_mod_date,
            f.attribute_mod_date,
            f.access_date,
            f.backup_date,
        ],
    );
    write_permissions(&mut w, &f.permissions);
    w.u32(f.user_info.file_type);
    w.u32(f.user_info.creator);
    w.u16(f.user_info.flags);
    w.u16(f.user_info.location_v as u16);
    w.u16(f.user_info.location_h as u16);
    w.u16(f.user_info.reserved);
    w.bytes(&f.finder_info);
    w.u32(f.text_encoding);
    w.u32(f.reserved2);
    write_fork(&mut w, &f.data_fork);
    write_fork(&mut w, &f.resource_fork);
    w.into_inner()
}

fn decode_file(r: &mut Reader<'_>) -> CatalogResult<FileRecord> {
    let flags = r.u16()?;
    let reserved1 = r.u32()?;
    let id = Cnid::new(r.u32()?);
    let [create_date, content_mod_date, attribute_mod_date, access_date, backup_date] =
        read_dates(r)?;
    let permissions = read_permissions(r)?;
    let user_info = FileInfo {
        file_type: r.u32()?,
        creator: r.u32()?,
        flags: r.u16()?,
        location_v: r.u16()? as i16,
        location_h: r.u16()? as i16,
        reserved: r.u16()?,
    };
    Ok(FileRecord {
        flags,
        reserved1,
        id,
        create_date,
        content_mod_date,
        attribute_mod_date,
        access_date,
        backup_date,
        permissions,
        user_info,
        finder_info: r.array()?,
        text_encoding: r.u32()?,
        reserved2: r.u32()?,
        data_fork: read_fork(r)?,
        resource_fork: read_fork(r)?,
    })
}

fn write_dates(w: &mut Writer, dates: [HfsDate; 5]) {
    for d in dates {
        w.u32(d.as_u32());
    }
}

fn read_dates(r: &mut Reader<'_>) -> CatalogResult<[HfsDate; 5]> {
    let mut dates = [HfsDate::default(); 5];
    for d in dates.iter_mut() {
        *d = HfsDate::new(r.u32()?);
    }
    Ok(dates)
}

fn write_permissions(w: &mut Writer, p: &BsdPermissions) {
    w.u32(p.owner);
    w.u32(p.group);
    w.u8(p.admin_flags);
    w.u8(p.owner_flags);
    w.u16(p.mode);
    w.u32(p.special);
}

fn read_permissions(r: &mut Reader<'_>) -> CatalogResult<BsdPermissions> {
    Ok(BsdPermissions {
        owner: r.u32()?,
        group: r.u32()?,
        admin_flags: r.u8()?,
        owner_flags: r.u8()?,
        mode: r.u16()?,
        special: r.u32()?,
    })
}

fn write_fork(w: &mut Writer, fork: &ForkData) {
    w.u64(fork.logical_size);
    w.u32(fork.clump_size);
    w.u32(fork.total_blocks);
    for e in &fork.extents {
        w.u32(e.start_block);
        w.u32(e.block_count);
    }
}

fn read_fork(r: &mut Reader<'_>) -> CatalogResult<ForkData> {
    let mut fork = ForkData {
        logical_size: r.u64()?,
        clump_size: r.u32()?,
        total_blocks: r.u32()?,
        ..ForkData::default()
    };
    for e in fork.extents.iter_mut() {
        e.start_block = r.u32()?;
        e.block_count = r.u32()?;
    }
    Ok(fork)
}

fn write_units(w: &mut Writer, units: &[u16]) {
    w.u16(units.len() as u16);
    for &u in units {
        w.u16(u);
    }
}

fn read_units(r: &mut Reader<'_>) -> CatalogResult<HfsName> {
    let len = r.u16()? as usize;
    if len > MAX_NAME_UNITS {
        return Err(CatalogError::corrupt(format!("name length {} out of range", len)));
    }
    let mut units = Vec::with_capacity(len);
    for _ in 0..len {
        units.push(r.u16()?);
    }
    HfsName::from_units(units)
}

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn with_capacity(cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap),
        }
    }

    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn bytes(&mut self, b: &[u8]) {
        self.buf.extend_from_slice(b);
    }

    fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> CatalogResult<&'a [u8]> {
        let end = self.pos + n;
        if end > self.buf.len() {
            return Err(CatalogError::corrupt(format!(
                "truncated catalog data at offset {}",
                self.pos
            )));
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> CatalogResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> CatalogResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> CatalogResult<u16> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    fn u32(&mut self) -> CatalogResult<u32> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    fn u64(&mut self) -> CatalogResult<u64> {
        Ok(u64::from_be_bytes(self.array()?))
    }
}
