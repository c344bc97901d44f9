//! Catalog names: UTF-16 storage, case-insensitive collation and the text codec.
//!
//! Catalog names are stored as raw UTF-16 units. Ordering and equality follow
//! the HFS+ fast case-insensitive comparison: every unit is lower-cased,
//! ignorable format characters are skipped and NUL sorts after everything else.
//! The text codec maps between those units and the strings handed to callers.

use std::cmp::Ordering;
use std::fmt;

use crate::error::{CatalogError, CatalogResult};

/// Longest name a catalog key can hold, in UTF-16 units.
pub const MAX_NAME_UNITS: usize = 255;

/// Unit shown in place of NUL ("SYMBOL FOR NULL", U+2400).
const NUL_SYMBOL: u16 = 0x2400;

fn is_ignorable(unit: u16) -> bool {
    matches!(unit, 0x200C..=0x200F | 0x202A..=0x202E | 0x206A..=0x206F | 0xFEFF)
}

/// Folds one unit for comparison. Returns `None` for units the comparison skips.
fn fold_unit(unit: u16) -> Option<u16> {
    if unit == 0 {
        return Some(0xFFFF);
    }
    if is_ignorable(unit) {
        return None;
    }
    let lowered = char::from_u32(u32::from(unit)).and_then(|c| {
        let mut lower = c.to_lowercase();
        match (lower.next(), lower.next()) {
            (Some(l), None) => u16::try_from(u32::from(l)).ok(),
            _ => None,
        }
    });
    Some(lowered.unwrap_or(unit))
}

/// A catalog name as stored on disk.
///
/// `Eq` and `Ord` are collation-based: two names differing only in case or in
/// ignorable characters compare equal and therefore name the same entry.
#[derive(Clone, Default)]
pub struct HfsName {
    units: Vec<u16>,
}

impl HfsName {
    /// The empty name used by thread-record keys.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Wraps raw units, rejecting names longer than [`MAX_NAME_UNITS`].
    pub fn from_units(units: Vec<u16>) -> CatalogResult<Self> {
        if units.len() > MAX_NAME_UNITS {
            return Err(CatalogError::NameTooLong { len: units.len() });
        }
        Ok(Self { units })
    }

    /// Builds a name from ASCII-compatible text without display mapping.
    /// Used for the synthetic `iNode<id>` and `temp<cnid>` names.
    pub fn from_raw_str(s: &str) -> CatalogResult<Self> {
        Self::from_units(s.encode_utf16().collect())
    }

    /// Raw UTF-16 units.
    pub fn units(&self) -> &[u16] {
        &self.units
    }

    /// Number of UTF-16 units.
    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// True for the thread-key name.
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Lossy rendering for logs and error messages.
    pub fn display_lossy(&self) -> String {
        HfsTextCodec
            .decode_name(self)
            .unwrap_or_else(|_| String::from_utf16_lossy(&self.units))
    }

    /// True when every unit is ignorable, so the name collates like the
    /// thread-record name.
    pub fn collates_empty(&self) -> bool {
        self.folded().next().is_none()
    }

    fn folded(&self) -> impl Iterator<Item = u16> + '_ {
        self.units.iter().filter_map(|&u| fold_unit(u))
    }
}

impl PartialEq for HfsName {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HfsName {}

impl PartialOrd for HfsName {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HfsName {
    fn cmp(&self, other: &Self) -> Ordering {
        self.folded().cmp(other.folded())
    }
}

impl fmt::Debug for HfsName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.display_lossy())
    }
}

impl fmt::Display for HfsName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_lossy())
    }
}

/// Converts between caller-visible strings and catalog name units.
pub trait TextCodec: Send + Sync {
    /// Decodes catalog units into a display string.
    fn decode_name(&self, name: &HfsName) -> CatalogResult<String>;

    /// Encodes a display string into catalog units.
    fn encode_name(&self, name: &str) -> CatalogResult<HfsName>;
}

/// Default codec: UTF-8 text, `:` on the caller side is `/` on disk and NUL
/// units are shown as U+2400.
#[derive(Clone, Copy, Debug, Default)]
pub struct HfsTextCodec;

impl TextCodec for HfsTextCodec {
    fn decode_name(&self, name: &HfsName) -> CatalogResult<String> {
        let mapped: Vec<u16> = name
            .units()
            .iter()
            .map(|&u| match u {
                0 => NUL_SYMBOL,
                0x2F => u16::from(b':'),
                other => other,
            })
            .collect();
        String::from_utf16(&mapped)
            .map_err(|e| CatalogError::corrupt(format!("undecodable catalog name: {}", e)))
    }

    fn encode_name(&self, name: &str) -> CatalogResult<HfsName> {
        let units = name
            .encode_utf16()
            .map(|u| match u {
                0x3A => u16::from(b'/'),
                NUL_SYMBOL => 0,
                other => other,
            })
            .collect();
        HfsName::from_units(units)
    }
}
