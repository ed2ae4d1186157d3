//! Version magic table.
//!
//! Maps a host runtime version label (`"3.11"`) to the 16-byte header that a
//! `.pyc` container produced by that version starts with. Only the first four
//! bytes (version tag + `CR CR LF`) carry meaning for detection; the trailing
//! twelve are written verbatim when re-framing.

use std::collections::BTreeMap;

use thiserror::Error;

/// Length of every table entry.
pub const MAGIC_LEN: usize = 16;

/// Length of the version tag at the front of an entry.
pub const TAG_LEN: usize = 4;

/// Label used when a lookup misses.
pub const DEFAULT_VERSION: &str = "3.11";

pub type MagicBytes = [u8; MAGIC_LEN];

const BUILTIN: &[(&str, MagicBytes)] = &[
    ("3.6", *b"3\r\r\n\x8bq\x98d\x0c\x00\x00\x00\xe3\x00\x00\x00"),
    ("3.7", *b"B\r\r\n\x00\x00\x00\x00\x8bq\x98d\x0c\x00\x00\x00"),
    ("3.8", *b"U\r\r\n\x00\x00\x00\x00\tq\x98d\x0b\x00\x00\x00"),
    ("3.9", *b"a\r\r\n\x00\x00\x00\x00\tq\x98d\x0b\x00\x00\x00"),
    ("3.10", *b"o\r\r\n\x00\x00\x00\x00\tq\x98d\x0b\x00\x00\x00"),
    ("3.11", *b"\xa7\r\r\n\x00\x00\x00\x00\x04\x94\x90d\xd4`\x00\x00"),
    ("3.12", *b"\xcb\r\r\n\x00\x00\x00\x00\tq\x98d\x0b\x00\x00\x00"),
    ("3.13", *b"\xee\r\r\n\x00\x00\x00\x00*\x80\xb4e\x0b\x00\x00\x00"),
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MagicError {
    #[error("magic for {label} is not valid hex: {reason}")]
    InvalidHex { label: String, reason: String },

    #[error("magic for {label} must be 16 bytes, got {len}")]
    InvalidLength { label: String, len: usize },

    #[error("default version {0} has no table entry")]
    UnknownDefault(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMagicEntry {
    pub version_label: String,
    pub magic_bytes: MagicBytes,
}

impl VersionMagicEntry {
    pub fn new(version_label: impl Into<String>, magic_bytes: MagicBytes) -> Self {
        Self {
            version_label: version_label.into(),
            magic_bytes,
        }
    }

    /// The 4-byte version tag (`XX XX 0D 0A`).
    pub fn tag(&self) -> &[u8] {
        &self.magic_bytes[..TAG_LEN]
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.magic_bytes)
    }
}

/// Immutable label -> magic mapping with a fallback entry.
///
/// Built once at startup and shared by reference; there is no way to mutate
/// a table after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagicTable {
    // Kept in ascending version order for listing.
    entries: Vec<VersionMagicEntry>,
    default_index: usize,
}

impl MagicTable {
    /// The built-in table covering 3.6 through 3.13, falling back to 3.11.
    pub fn builtin() -> Self {
        let entries = BUILTIN
            .iter()
            .map(|(label, magic)| VersionMagicEntry::new(*label, *magic))
            .collect();
        Self::from_entries(entries, DEFAULT_VERSION)
            .expect("built-in magic table contains the default version")
    }

    /// Build a table from explicit entries. Later entries replace earlier
    /// ones with the same label.
    pub fn from_entries(
        entries: Vec<VersionMagicEntry>,
        default_version: &str,
    ) -> Result<Self, MagicError> {
        let mut by_label: BTreeMap<String, VersionMagicEntry> = BTreeMap::new();
        for entry in entries {
            by_label.insert(entry.version_label.clone(), entry);
        }
        let mut entries: Vec<VersionMagicEntry> = by_label.into_values().collect();
        entries.sort_by_key(|e| version_sort_key(&e.version_label));

        let default_index = entries
            .iter()
            .position(|e| e.version_label == default_version)
            .ok_or_else(|| MagicError::UnknownDefault(default_version.to_string()))?;

        Ok(Self {
            entries,
            default_index,
        })
    }

    /// Built-in table with `overrides` (label -> 32 hex chars) merged on top.
    pub fn with_overrides(
        overrides: &BTreeMap<String, String>,
        default_version: &str,
    ) -> Result<Self, MagicError> {
        let mut entries: Vec<VersionMagicEntry> = BUILTIN
            .iter()
            .map(|(label, magic)| VersionMagicEntry::new(*label, *magic))
            .collect();
        for (label, text) in overrides {
            entries.push(VersionMagicEntry::new(
                label.clone(),
                parse_magic_hex(label, text)?,
            ));
        }
        Self::from_entries(entries, default_version)
    }

    /// Total lookup: unknown labels resolve to the default entry.
    pub fn lookup(&self, version_label: &str) -> &MagicBytes {
        &self.resolve(version_label).magic_bytes
    }

    pub fn resolve(&self, version_label: &str) -> &VersionMagicEntry {
        self.get(version_label).unwrap_or_else(|| self.default_entry())
    }

    pub fn get(&self, version_label: &str) -> Option<&VersionMagicEntry> {
        self.entries
            .iter()
            .find(|e| e.version_label == version_label)
    }

    pub fn default_entry(&self) -> &VersionMagicEntry {
        &self.entries[self.default_index]
    }

    pub fn entries(&self) -> &[VersionMagicEntry] {
        &self.entries
    }

    /// Find the entry whose version tag matches the start of `data`.
    pub fn identify(&self, data: &[u8]) -> Option<&VersionMagicEntry> {
        let tag = data.get(..TAG_LEN)?;
        self.entries.iter().find(|e| e.tag() == tag)
    }
}

impl Default for MagicTable {
    fn default() -> Self {
        Self::builtin()
    }
}

fn parse_magic_hex(label: &str, text: &str) -> Result<MagicBytes, MagicError> {
    let bytes = hex::decode(text.trim()).map_err(|e| MagicError::InvalidHex {
        label: label.to_string(),
        reason: e.to_string(),
    })?;
    MagicBytes::try_from(bytes.as_slice()).map_err(|_| MagicError::InvalidLength {
        label: label.to_string(),
        len: bytes.len(),
    })
}

// "3.10" must sort after "3.9"; unparseable labels go last, by text.
fn version_sort_key(label: &str) -> (u32, u32, String) {
    let mut parts = label.splitn(2, '.');
    let major = parts.next().and_then(|p| p.parse().ok());
    let minor = parts.next().and_then(|p| p.parse().ok());
    match (major, minor) {
        (Some(major), Some(minor)) => (major, minor, String::new()),
        _ => (u32::MAX, u32::MAX, label.to_string()),
    }
}
