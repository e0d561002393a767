//! Rule source binary layout
//!
//! A rule source is a [`crate::layout`] container with magic `CFRS` and
//! these sections:
//!
//! - `StrPool`: raw UTF-8 bytes, every string is an (offset, len) reference
//! - `Lists`: string lists, `u32 count` followed by `count` references
//! - `Metadata`: `u32 count` followed by (key, value) reference pairs
//! - `Rules`: fixed-size rule records, see [`rule_record`]

use std::collections::HashMap;

use crate::layout::{read_u32_le, FormatError};

pub const MAGIC: [u8; 4] = *b"CFRS";

/// Bumped on every incompatible change of the record layout.
pub const RULES_FORMAT_VERSION: u16 = 14;

/// Section identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum SectionId {
    StrPool = 0x0001,
    Lists = 0x0002,
    Metadata = 0x0003,
    Rules = 0x0004,
}

/// (offset, len) into the string pool.
pub const STR_REF_SIZE: usize = 8;

/// Rule record layout.
pub const RULE_RECORD_SIZE: usize = 52;

pub mod rule_record {
    /// u8 decision
    pub const DECISION: usize = 0;
    /// u8 modifier
    pub const MODIFIER: usize = 1;
    /// u8 anchor bits
    pub const ANCHOR: usize = 2;
    /// u8 party
    pub const PARTY: usize = 3;
    /// u8 activation bits
    pub const ACTIVATION: usize = 4;
    /// u8 record flags
    pub const FLAGS: usize = 5;
    /// u32 resource type bits
    pub const RESOURCE_TYPES: usize = 8;
    /// str ref
    pub const PATTERN: usize = 12;
    /// str ref
    pub const HOST: usize = 20;
    /// str ref
    pub const TEXT: usize = 28;
    /// u32 list offset
    pub const MODIFIER_VALUES: usize = 36;
    /// u32 list offset
    pub const INCLUDED_DOMAINS: usize = 40;
    /// u32 list offset
    pub const EXCLUDED_DOMAINS: usize = 44;
    /// u32 list offset
    pub const AD_ATTRIBUTION: usize = 48;
}

pub mod rule_flags {
    pub const CASE_SENSITIVE: u8 = 1 << 0;
    pub const HAS_HOST: u8 = 1 << 1;
}

/// List offset used for empty lists.
pub const NO_LIST: u32 = 0xFFFF_FFFF;

pub mod metadata_key {
    pub const TITLE: &str = "title";
    pub const HOMEPAGE: &str = "homepage";
    pub const LICENSE: &str = "license";
    pub const EXPIRES: &str = "expires";
    pub const VERSION: &str = "version";
}

// =============================================================================
// Writing
// =============================================================================

/// Interned string storage.
#[derive(Debug, Default)]
pub struct StringPool {
    data: Vec<u8>,
    index: HashMap<String, u32>,
}

impl StringPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, s: &str) -> (u32, u32) {
        if s.is_empty() {
            return (0, 0);
        }
        if let Some(&offset) = self.index.get(s) {
            return (offset, s.len() as u32);
        }
        let offset = self.data.len() as u32;
        self.data.extend_from_slice(s.as_bytes());
        self.index.insert(s.to_string(), offset);
        (offset, s.len() as u32)
    }

    pub fn build(self) -> Vec<u8> {
        self.data
    }
}

/// Storage for string lists; empty lists are never written.
#[derive(Debug, Default)]
pub struct ListPool {
    data: Vec<u8>,
}

impl ListPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, items: &[String], strings: &mut StringPool) -> u32 {
        if items.is_empty() {
            return NO_LIST;
        }
        let offset = self.data.len() as u32;
        self.data.extend_from_slice(&(items.len() as u32).to_le_bytes());
        for item in items {
            push_str_ref(&mut self.data, strings.intern(item));
        }
        offset
    }

    pub fn build(self) -> Vec<u8> {
        self.data
    }
}

pub fn push_str_ref(buf: &mut Vec<u8>, (offset, len): (u32, u32)) {
    buf.extend_from_slice(&offset.to_le_bytes());
    buf.extend_from_slice(&len.to_le_bytes());
}

// =============================================================================
// Reading
// =============================================================================

/// Resolve a string reference stored at `at` in `data`.
pub fn read_str_ref(data: &[u8], at: usize, pool: &[u8]) -> Result<String, FormatError> {
    let offset = read_u32_le(data, at)? as usize;
    let len = read_u32_le(data, at + 4)? as usize;
    let bytes = pool
        .get(offset..offset + len)
        .ok_or_else(|| FormatError::InvalidSection("string reference out of bounds".to_string()))?;
    std::str::from_utf8(bytes)
        .map(str::to_string)
        .map_err(|_| FormatError::InvalidSection("string pool is not UTF-8".to_string()))
}

/// Resolve a list offset.
pub fn read_list(lists: &[u8], offset: u32, pool: &[u8]) -> Result<Vec<String>, FormatError> {
    if offset == NO_LIST {
        return Ok(Vec::new());
    }
    let offset = offset as usize;
    let count = read_u32_le(lists, offset)? as usize;
    let start = offset + 4;
    if start + count * STR_REF_SIZE > lists.len() {
        return Err(FormatError::DataTooShort);
    }
    (0..count)
        .map(|i| read_str_ref(lists, start + i * STR_REF_SIZE, pool))
        .collect()
}
