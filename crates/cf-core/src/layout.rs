//! Shared binary container layout
//!
//! Both the compiled rule source and the persisted index are sectioned
//! containers with the same 64-byte header and 24-byte section directory
//! entries. All values are little-endian.
//!
//! ```text
//! +--------+-------------------+-----------+-----------+-----
//! | header | section directory | section 0 | section 1 | ...
//! +--------+-------------------+-----------+-----------+-----
//! ```

use std::collections::HashMap;

use crate::hash::{crc32, crc32_update};

/// Header size in bytes
pub const HEADER_SIZE: usize = 64;

/// Section directory entry size
pub const SECTION_ENTRY_SIZE: usize = 24;

/// Header field byte offsets.
pub mod header {
    /// u8[4] magic
    pub const MAGIC: usize = 0;
    /// u16 format version
    pub const VERSION: usize = 4;
    /// u16 flags
    pub const FLAGS: usize = 6;
    /// u32 headerBytes (always 64)
    pub const HEADER_BYTES: usize = 8;
    /// u32 sectionCount
    pub const SECTION_COUNT: usize = 12;
    /// u32 sectionDirOffset
    pub const SECTION_DIR_OFFSET: usize = 16;
    /// u32 sectionDirBytes
    pub const SECTION_DIR_BYTES: usize = 20;
    /// u32 item count (rules or index entries)
    pub const ITEM_COUNT: usize = 24;
    /// u32 CRC32 of the whole container minus this field
    pub const CRC32: usize = 28;
}

/// Header flags.
pub mod header_flags {
    pub const HAS_CRC32: u16 = 1 << 0;
}

/// Section directory entry offsets.
pub mod section_entry {
    /// u16 section id
    pub const ID: usize = 0;
    /// u16 flags
    pub const FLAGS: usize = 2;
    /// u32 file offset
    pub const OFFSET: usize = 4;
    /// u32 byte length
    pub const LENGTH: usize = 8;
    /// u32 reserved
    pub const RESERVED: usize = 12;
    /// u32 CRC32 of the section bytes
    pub const CRC32: usize = 16;
}

/// Error decoding a container or its sections.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    #[error("Invalid magic bytes")]
    InvalidMagic,
    #[error("Unsupported format version: {found} (supported: {supported})")]
    UnsupportedVersion { found: u16, supported: u16 },
    #[error("CRC32 mismatch: stored={stored}, computed={computed}")]
    Crc32Mismatch { stored: u32, computed: u32 },
    #[error("Invalid section: {0}")]
    InvalidSection(String),
    #[error("Invalid record {index}: {reason}")]
    InvalidRecord { index: usize, reason: String },
    #[error("Data too short")]
    DataTooShort,
    #[error("Index was built from source {source_id} with checksum {stored}, current checksum is {current}")]
    SourceMismatch { source_id: u32, stored: String, current: String },
}

// =============================================================================
// Little-endian helpers
// =============================================================================

/// Align offset to boundary.
#[inline]
pub const fn align_offset(offset: usize, alignment: usize) -> usize {
    (offset + alignment - 1) & !(alignment - 1)
}

#[inline]
pub fn read_u8(data: &[u8], offset: usize) -> Result<u8, FormatError> {
    data.get(offset).copied().ok_or(FormatError::DataTooShort)
}

#[inline]
pub fn read_u16_le(data: &[u8], offset: usize) -> Result<u16, FormatError> {
    let b = data.get(offset..offset + 2).ok_or(FormatError::DataTooShort)?;
    Ok(u16::from_le_bytes([b[0], b[1]]))
}

#[inline]
pub fn read_u32_le(data: &[u8], offset: usize) -> Result<u32, FormatError> {
    let b = data.get(offset..offset + 4).ok_or(FormatError::DataTooShort)?;
    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

#[inline]
pub fn write_u16_le(data: &mut [u8], offset: usize, value: u16) {
    data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn write_u32_le(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

// =============================================================================
// Varint posting lists
// =============================================================================

pub fn encode_varint(buf: &mut Vec<u8>, mut value: u32) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            break;
        }
        buf.push(byte | 0x80);
    }
}

/// Decode one unsigned LEB128 varint. Returns (value, bytes_read).
pub fn decode_varint(data: &[u8], offset: usize) -> Result<(u32, usize), FormatError> {
    let mut result: u32 = 0;
    let mut shift = 0;
    let mut pos = offset;

    loop {
        let byte = *data.get(pos).ok_or(FormatError::DataTooShort)?;
        pos += 1;
        result |= ((byte & 0x7f) as u32) << shift;
        if byte & 0x80 == 0 {
            return Ok((result, pos - offset));
        }
        shift += 7;
        if shift > 28 {
            return Err(FormatError::InvalidSection("varint overflow".to_string()));
        }
    }
}

/// Delta-encode a sorted id list, prefixed with its length.
pub fn encode_posting_list(buf: &mut Vec<u8>, ids: &[u32]) {
    encode_varint(buf, ids.len() as u32);
    let mut prev = 0u32;
    for &id in ids {
        encode_varint(buf, id.wrapping_sub(prev));
        prev = id;
    }
}

/// Decode a list written by [`encode_posting_list`]. Returns (ids, bytes_read).
pub fn decode_posting_list(data: &[u8], offset: usize) -> Result<(Vec<u32>, usize), FormatError> {
    let (count, mut read) = decode_varint(data, offset)?;
    let mut ids = Vec::with_capacity((count as usize).min(data.len()));
    let mut prev = 0u32;
    for _ in 0..count {
        let (delta, n) = decode_varint(data, offset + read)?;
        read += n;
        prev = prev.wrapping_add(delta);
        ids.push(prev);
    }
    Ok((ids, read))
}

// =============================================================================
// Container writer
// =============================================================================

/// Lay out a container: header, directory, 4-byte aligned sections, CRCs.
pub fn write_container(magic: [u8; 4], version: u16, item_count: u32, sections: &[(u16, Vec<u8>)]) -> Vec<u8> {
    let section_count = sections.len();
    let section_dir_offset = HEADER_SIZE;
    let section_dir_bytes = section_count * SECTION_ENTRY_SIZE;
    let mut data_offset = align_offset(section_dir_offset + section_dir_bytes, 4);

    let mut offsets = Vec::with_capacity(section_count);
    for (_, data) in sections {
        offsets.push(data_offset);
        data_offset = align_offset(data_offset + data.len(), 4);
    }

    let mut buffer = vec![0u8; data_offset];
    buffer[header::MAGIC..header::MAGIC + 4].copy_from_slice(&magic);
    write_u16_le(&mut buffer, header::VERSION, version);
    write_u16_le(&mut buffer, header::FLAGS, header_flags::HAS_CRC32);
    write_u32_le(&mut buffer, header::HEADER_BYTES, HEADER_SIZE as u32);
    write_u32_le(&mut buffer, header::SECTION_COUNT, section_count as u32);
    write_u32_le(&mut buffer, header::SECTION_DIR_OFFSET, section_dir_offset as u32);
    write_u32_le(&mut buffer, header::SECTION_DIR_BYTES, section_dir_bytes as u32);
    write_u32_le(&mut buffer, header::ITEM_COUNT, item_count);

    for (index, ((id, data), offset)) in sections.iter().zip(&offsets).enumerate() {
        let entry = section_dir_offset + index * SECTION_ENTRY_SIZE;
        write_u16_le(&mut buffer, entry + section_entry::ID, *id);
        write_u16_le(&mut buffer, entry + section_entry::FLAGS, 0);
        write_u32_le(&mut buffer, entry + section_entry::OFFSET, *offset as u32);
        write_u32_le(&mut buffer, entry + section_entry::LENGTH, data.len() as u32);
        write_u32_le(&mut buffer, entry + section_entry::RESERVED, 0);
        write_u32_le(&mut buffer, entry + section_entry::CRC32, crc32(data));
        buffer[*offset..*offset + data.len()].copy_from_slice(data);
    }

    let crc = container_crc(&buffer);
    write_u32_le(&mut buffer, header::CRC32, crc);
    buffer
}

/// CRC over everything except the CRC field.
fn container_crc(data: &[u8]) -> u32 {
    let head = crc32_update(0, &data[..header::CRC32]);
    crc32_update(head, &data[header::CRC32 + 4..])
}

// =============================================================================
// Container reader
// =============================================================================

/// Validated view of a container.
#[derive(Debug)]
pub struct Container<'a> {
    data: &'a [u8],
    pub version: u16,
    pub flags: u16,
    pub item_count: u32,
    sections: HashMap<u16, (usize, usize)>,
}

impl<'a> Container<'a> {
    /// Validate magic, version and checksums and index the directory.
    pub fn load(data: &'a [u8], magic: [u8; 4], supported_version: u16) -> Result<Self, FormatError> {
        if data.len() < HEADER_SIZE {
            return Err(FormatError::DataTooShort);
        }
        if data[header::MAGIC..header::MAGIC + 4] != magic {
            return Err(FormatError::InvalidMagic);
        }

        let version = read_u16_le(data, header::VERSION)?;
        if version != supported_version {
            return Err(FormatError::UnsupportedVersion {
                found: version,
                supported: supported_version,
            });
        }

        let flags = read_u16_le(data, header::FLAGS)?;
        if flags & header_flags::HAS_CRC32 != 0 {
            let stored = read_u32_le(data, header::CRC32)?;
            let computed = container_crc(data);
            if stored != computed {
                return Err(FormatError::Crc32Mismatch { stored, computed });
            }
        }

        let section_count = read_u32_le(data, header::SECTION_COUNT)? as usize;
        let section_dir_offset = read_u32_le(data, header::SECTION_DIR_OFFSET)? as usize;
        let item_count = read_u32_le(data, header::ITEM_COUNT)?;

        let mut sections = HashMap::with_capacity(section_count);
        for i in 0..section_count {
            let entry = section_dir_offset + i * SECTION_ENTRY_SIZE;
            let id = read_u16_le(data, entry + section_entry::ID)?;
            let offset = read_u32_le(data, entry + section_entry::OFFSET)? as usize;
            let length = read_u32_le(data, entry + section_entry::LENGTH)? as usize;
            let stored_crc = read_u32_le(data, entry + section_entry::CRC32)?;

            let bytes = data
                .get(offset..offset + length)
                .ok_or_else(|| FormatError::InvalidSection(format!("section {id:#06x} out of bounds")))?;
            let computed = crc32(bytes);
            if stored_crc != computed {
                return Err(FormatError::Crc32Mismatch { stored: stored_crc, computed });
            }
            sections.insert(id, (offset, length));
        }

        Ok(Self {
            data,
            version,
            flags,
            item_count,
            sections,
        })
    }

    pub fn section_count(&self) -> usize {
        self.sections.len()
    }

    pub fn section(&self, id: u16) -> Option<&'a [u8]> {
        let &(offset, length) = self.sections.get(&id)?;
        self.data.get(offset..offset + length)
    }

    /// Like [`Container::section`] but missing sections are an error.
    pub fn require(&self, id: u16, name: &str) -> Result<&'a [u8], FormatError> {
        self.section(id)
            .ok_or_else(|| FormatError::InvalidSection(format!("missing {name} section")))
    }
}
