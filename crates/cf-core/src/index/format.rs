//! Persisted index layout
//!
//! The index is a [`crate::layout`] container with magic `CFIX`. It stores
//! the identity of every source it was built from plus the lookup bucket
//! chosen for each rule, so a reload skips token selection but still has to
//! present the exact same sources.
//!
//! - `Sources`: `u8 group, u8[3] pad, u32 count`, then per source
//!   `u32 id, u32 checksum_len, checksum bytes`
//! - `Entries`: fixed 20-byte records, see [`entry`]

use crate::layout::{read_u32_le, read_u8, write_container, Container, FormatError};
use crate::types::RuleGroup;

pub const MAGIC: [u8; 4] = *b"CFIX";

/// Independent from the rule source format version.
pub const INDEX_FORMAT_VERSION: u16 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
enum SectionId {
    Sources = 0x0001,
    Entries = 0x0002,
}

pub const ENTRY_SIZE: usize = 20;

pub mod entry {
    /// u32 position of the source in the index
    pub const SOURCE: usize = 0;
    /// u32 rule index inside the source
    pub const RULE: usize = 4;
    /// u32 bucket kind
    pub const KIND: usize = 8;
    /// u32 key low bits
    pub const KEY_LO: usize = 12;
    /// u32 key high bits
    pub const KEY_HI: usize = 16;
}

/// Lookup table a rule is reachable from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Bucket {
    /// Scanned for every request
    Fallback,
    /// Keyed by the hash of the `||host` of the rule
    Host(u64),
    /// Keyed by a URL token hash
    Token(u32),
    /// Document-level rule
    Activation,
}

impl Bucket {
    fn encode(self) -> (u32, u64) {
        match self {
            Bucket::Fallback => (0, 0),
            Bucket::Host(key) => (1, key),
            Bucket::Token(key) => (2, key as u64),
            Bucket::Activation => (3, 0),
        }
    }

    fn decode(kind: u32, key: u64) -> Option<Self> {
        match kind {
            0 => Some(Bucket::Fallback),
            1 => Some(Bucket::Host(key)),
            2 => u32::try_from(key).ok().map(Bucket::Token),
            3 => Some(Bucket::Activation),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SourceRecord {
    pub id: u32,
    pub checksum: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EntryRecord {
    pub source: u32,
    pub rule: u32,
    pub bucket: Bucket,
}

pub(crate) fn encode(group: RuleGroup, sources: &[SourceRecord], entries: &[EntryRecord]) -> Vec<u8> {
    let mut source_section = vec![group as u8, 0, 0, 0];
    source_section.extend_from_slice(&(sources.len() as u32).to_le_bytes());
    for source in sources {
        source_section.extend_from_slice(&source.id.to_le_bytes());
        source_section.extend_from_slice(&(source.checksum.len() as u32).to_le_bytes());
        source_section.extend_from_slice(source.checksum.as_bytes());
    }

    let mut entry_section = Vec::with_capacity(entries.len() * ENTRY_SIZE);
    for record in entries {
        let (kind, key) = record.bucket.encode();
        entry_section.extend_from_slice(&record.source.to_le_bytes());
        entry_section.extend_from_slice(&record.rule.to_le_bytes());
        entry_section.extend_from_slice(&kind.to_le_bytes());
        entry_section.extend_from_slice(&(key as u32).to_le_bytes());
        entry_section.extend_from_slice(&((key >> 32) as u32).to_le_bytes());
    }

    write_container(
        MAGIC,
        INDEX_FORMAT_VERSION,
        entries.len() as u32,
        &[
            (SectionId::Sources as u16, source_section),
            (SectionId::Entries as u16, entry_section),
        ],
    )
}

pub(crate) fn decode(data: &[u8]) -> Result<(RuleGroup, Vec<SourceRecord>, Vec<EntryRecord>), FormatError> {
    let container = Container::load(data, MAGIC, INDEX_FORMAT_VERSION)?;
    let source_section = container.require(SectionId::Sources as u16, "sources")?;
    let entry_section = container.require(SectionId::Entries as u16, "entries")?;

    let group = RuleGroup::try_from(read_u8(source_section, 0)?)
        .map_err(|_| FormatError::InvalidSection("unknown rule group".to_string()))?;

    let count = read_u32_le(source_section, 4)? as usize;
    let mut sources = Vec::with_capacity(count.min(1024));
    let mut pos = 8;
    for _ in 0..count {
        let id = read_u32_le(source_section, pos)?;
        let len = read_u32_le(source_section, pos + 4)? as usize;
        let bytes = source_section
            .get(pos + 8..pos + 8 + len)
            .ok_or(FormatError::DataTooShort)?;
        let checksum = std::str::from_utf8(bytes)
            .map_err(|_| FormatError::InvalidSection("source checksum is not UTF-8".to_string()))?
            .to_string();
        sources.push(SourceRecord { id, checksum });
        pos += 8 + len;
    }

    let entry_count = container.item_count as usize;
    if entry_section.len() != entry_count * ENTRY_SIZE {
        return Err(FormatError::InvalidSection("entry count does not match section size".to_string()));
    }
    let entries = (0..entry_count)
        .map(|index| {
            let at = index * ENTRY_SIZE;
            let kind = read_u32_le(entry_section, at + entry::KIND)?;
            let key = read_u32_le(entry_section, at + entry::KEY_LO)? as u64
                | (read_u32_le(entry_section, at + entry::KEY_HI)? as u64) << 32;
            let bucket = Bucket::decode(kind, key).ok_or_else(|| FormatError::InvalidRecord {
                index,
                reason: format!("unknown bucket kind {kind}"),
            })?;
            Ok(EntryRecord {
                source: read_u32_le(entry_section, at + entry::SOURCE)?,
                rule: read_u32_le(entry_section, at + entry::RULE)?,
                bucket,
            })
        })
        .collect::<Result<Vec<_>, FormatError>>()?;

    Ok((group, sources, entries))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_survive_encoding() {
        let sources = vec![
            SourceRecord { id: 3, checksum: "12345".to_string() },
            SourceRecord { id: 9, checksum: "42".to_string() },
        ];
        let entries = vec![
            EntryRecord { source: 0, rule: 0, bucket: Bucket::Host(0xdead_beef_0000_0001) },
            EntryRecord { source: 1, rule: 7, bucket: Bucket::Token(77) },
            EntryRecord { source: 1, rule: 8, bucket: Bucket::Activation },
            EntryRecord { source: 0, rule: 2, bucket: Bucket::Fallback },
        ];

        let bytes = encode(RuleGroup::AdBlockingRules, &sources, &entries);
        let (group, decoded_sources, decoded_entries) = decode(&bytes).expect("index should decode");
        assert_eq!(group, RuleGroup::AdBlockingRules);
        assert_eq!(decoded_sources, sources);
        assert_eq!(decoded_entries, entries);
    }

    #[test]
    fn rule_source_magic_is_not_an_index() {
        let bytes = write_container(*b"CFRS", INDEX_FORMAT_VERSION, 0, &[]);
        assert_eq!(decode(&bytes).unwrap_err(), FormatError::InvalidMagic);
    }
}
