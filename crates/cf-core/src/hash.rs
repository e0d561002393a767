//! Hash functions
//!
//! Murmur3 32-bit with two seeds gives the 64-bit composite keys used by the
//! index tables; CRC32 guards the binary formats and doubles as the stable
//! checksum that identifies a compiled source or a built index.
//!
//! Empty slot sentinel in hash tables is `(lo=0, hi=0)`; [`hash64`] never
//! produces it.

/// 64-bit hash represented as two 32-bit parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(C)]
pub struct Hash64 {
    pub lo: u32,
    pub hi: u32,
}

impl Hash64 {
    #[inline]
    pub const fn new(lo: u32, hi: u32) -> Self {
        Self { lo, hi }
    }

    /// Check if this hash is the empty sentinel (0, 0).
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.lo == 0 && self.hi == 0
    }

    #[inline]
    pub const fn to_u64(&self) -> u64 {
        ((self.hi as u64) << 32) | (self.lo as u64)
    }
}

const SEED_LO: u32 = 0x9e3779b9;
const SEED_HI: u32 = 0x85ebca6b;
const SEED_TOKEN: u32 = 0x811c9dc5;

/// Murmur3 32-bit hash.
#[inline]
pub fn murmur3_32(data: &[u8], seed: u32) -> u32 {
    let mut h = seed;
    let mut chunks = data.chunks_exact(4);

    for chunk in &mut chunks {
        let k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        h ^= scramble(k);
        h = h.rotate_left(13);
        h = h.wrapping_mul(5).wrapping_add(0xe6546b64);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut k: u32 = 0;
        for (i, &b) in tail.iter().enumerate() {
            k |= (b as u32) << (8 * i);
        }
        h ^= scramble(k);
    }

    h ^= data.len() as u32;
    h ^= h >> 16;
    h = h.wrapping_mul(0x85ebca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2ae35);
    h ^= h >> 16;
    h
}

#[inline]
fn scramble(k: u32) -> u32 {
    k.wrapping_mul(0xcc9e2d51)
        .rotate_left(15)
        .wrapping_mul(0x1b873593)
}

/// Two Murmur3 passes combined. Never returns the (0, 0) sentinel.
#[inline]
pub fn hash64(data: &[u8]) -> Hash64 {
    let mut lo = murmur3_32(data, SEED_LO);
    let hi = murmur3_32(data, SEED_HI);
    if lo == 0 && hi == 0 {
        lo = 1;
    }
    Hash64 { lo, hi }
}

/// Hash a host name. Case and a trailing dot are ignored.
#[inline]
pub fn hash_domain(domain: &str) -> Hash64 {
    let domain = domain.strip_suffix('.').unwrap_or(domain);
    if domain.bytes().any(|b| b.is_ascii_uppercase()) {
        hash64(domain.to_ascii_lowercase().as_bytes())
    } else {
        hash64(domain.as_bytes())
    }
}

/// 32-bit token hash for the token dictionary. Never returns 0.
#[inline]
pub fn hash_token(token: &str) -> u32 {
    hash_token_bytes(token.as_bytes())
}

/// Same as [`hash_token`] over raw, already lowercased bytes.
#[inline]
pub fn hash_token_bytes(bytes: &[u8]) -> u32 {
    match murmur3_32(bytes, SEED_TOKEN) {
        0 => 1,
        h => h,
    }
}

/// CRC32 (IEEE 802.3 polynomial).
pub fn crc32(data: &[u8]) -> u32 {
    crc32_update(0, data)
}

/// Continue a CRC32 over another chunk. Start from 0.
pub fn crc32_update(crc: u32, data: &[u8]) -> u32 {
    static CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut c = i as u32;
            let mut j = 0;
            while j < 8 {
                c = if c & 1 != 0 { 0xedb88320 ^ (c >> 1) } else { c >> 1 };
                j += 1;
            }
            table[i] = c;
            i += 1;
        }
        table
    };

    let mut crc = crc ^ 0xffffffff;
    for &byte in data {
        crc = CRC32_TABLE[((crc ^ byte as u32) & 0xff) as usize] ^ (crc >> 8);
    }
    crc ^ 0xffffffff
}

/// Stable identity of a buffer, rendered the way it is persisted.
pub fn buffer_checksum(data: &[u8]) -> String {
    crc32(data).to_string()
}
