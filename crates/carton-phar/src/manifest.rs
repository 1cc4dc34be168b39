//! Binary manifest layout.
//!
//! The manifest sits between the stub and the entry bodies:
//!
//! ```text
//! u32 manifest_len      bytes following this field, through the entry table
//! u32 entry_count
//! u16 api_version       0x1100 ("1.1.0")
//! u32 global_flags
//! u32 alias_len, alias
//! u32 metadata_len, metadata (PHP serialize encoding)
//! entry records ...
//! ```
//!
//! Each entry record: path_len/path, uncompressed size, mtime, compressed
//! size, CRC32 of the uncompressed bytes, flags, metadata_len (always 0).
//! All integers little-endian.

use crate::PharError;

pub const API_VERSION: u16 = 0x1100;

/// Global flag: a signature trailer is present.
pub const GLOBAL_FLAG_SIGNED: u32 = 0x0001_0000;

/// Entry flag bits. The low nine bits carry the permission mode.
pub const ENTRY_FLAG_GZ: u32 = 0x0000_1000;
pub const ENTRY_FLAG_BZ2: u32 = 0x0000_2000;
pub const ENTRY_MODE: u32 = 0o644;

/// Magic marker closing the signature trailer.
pub const SIG_MAGIC: &[u8; 4] = b"GBMB";

/// Per-entry compression algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
    Gz,
    Bz2,
}

impl Compression {
    pub fn entry_flag(self) -> u32 {
        match self {
            Compression::None => 0,
            Compression::Gz => ENTRY_FLAG_GZ,
            Compression::Bz2 => ENTRY_FLAG_BZ2,
        }
    }
}

/// One manifest entry record. Order in the manifest equals insertion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryRecord {
    /// Bundle path: forward slashes, no leading `/`, no `.`/`..` segments.
    pub path: String,
    pub uncompressed_size: u32,
    /// Fixed at 0 so identical inputs produce identical archives.
    pub mtime: u32,
    pub compressed_size: u32,
    /// CRC32 of the uncompressed bytes.
    pub crc32: u32,
    pub compression: Compression,
}

impl EntryRecord {
    pub fn flags(&self) -> u32 {
        ENTRY_MODE | self.compression.entry_flag()
    }
}

/// Reject paths that would be ambiguous or escape the container root.
pub fn validate_entry_path(path: &str) -> Result<(), PharError> {
    let reject = |reason: &str| {
        Err(PharError::InvalidEntryPath {
            path: path.to_string(),
            reason: reason.to_string(),
        })
    };
    if path.is_empty() {
        return reject("empty path");
    }
    if path.contains('\\') {
        return reject("backslash in path");
    }
    if path.starts_with('/') {
        return reject("leading slash");
    }
    if path.contains('\0') {
        return reject("NUL byte in path");
    }
    if path.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..") {
        return reject("dot or empty path segment");
    }
    Ok(())
}

/// Encode the full manifest (length prefix included).
pub fn encode(
    entries: &[EntryRecord],
    alias: &str,
    metadata: Option<&[u8]>,
    signed: bool,
) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    body.extend_from_slice(&API_VERSION.to_le_bytes());

    let global_flags = if signed { GLOBAL_FLAG_SIGNED } else { 0 };
    body.extend_from_slice(&global_flags.to_le_bytes());

    body.extend_from_slice(&(alias.len() as u32).to_le_bytes());
    body.extend_from_slice(alias.as_bytes());

    // Absent metadata is encoded as length 0, not as an empty serialized
    // string.
    let metadata = metadata.unwrap_or(&[]);
    body.extend_from_slice(&(metadata.len() as u32).to_le_bytes());
    body.extend_from_slice(metadata);

    for entry in entries {
        body.extend_from_slice(&(entry.path.len() as u32).to_le_bytes());
        body.extend_from_slice(entry.path.as_bytes());
        body.extend_from_slice(&entry.uncompressed_size.to_le_bytes());
        body.extend_from_slice(&entry.mtime.to_le_bytes());
        body.extend_from_slice(&entry.compressed_size.to_le_bytes());
        body.extend_from_slice(&entry.crc32.to_le_bytes());
        body.extend_from_slice(&entry.flags().to_le_bytes());
        body.extend_from_slice(&0u32.to_le_bytes());
    }

    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&body);
    out
}

/// Decoded manifest header and entry table.
#[derive(Debug, Clone)]
pub struct Decoded {
    pub alias: String,
    pub metadata: Option<Vec<u8>>,
    pub global_flags: u32,
    pub entries: Vec<EntryRecord>,
}

/// Decode a manifest from `bytes` (starting at the length prefix). Returns
/// the decoded table and the number of bytes consumed.
pub fn decode(bytes: &[u8]) -> Result<(Decoded, usize), PharError> {
    let mut cur = Cursor::new(bytes);
    let manifest_len = cur.u32()? as usize;
    let body_start = cur.pos;
    let entry_count = cur.u32()?;
    let api = cur.u16()?;
    if api != API_VERSION {
        return Err(PharError::Malformed {
            reason: format!("unsupported manifest api version {:#06x}", api),
        });
    }
    let global_flags = cur.u32()?;
    let alias_len = cur.u32()? as usize;
    let alias = String::from_utf8(cur.take(alias_len)?.to_vec()).map_err(|_| {
        PharError::Malformed {
            reason: "alias is not valid UTF-8".into(),
        }
    })?;
    let metadata_len = cur.u32()? as usize;
    let metadata = if metadata_len == 0 {
        None
    } else {
        Some(cur.take(metadata_len)?.to_vec())
    };

    let mut entries = Vec::with_capacity(entry_count as usize);
    for _ in 0..entry_count {
        let path_len = cur.u32()? as usize;
        let path = String::from_utf8(cur.take(path_len)?.to_vec()).map_err(|_| {
            PharError::Malformed {
                reason: "entry path is not valid UTF-8".into(),
            }
        })?;
        let uncompressed_size = cur.u32()?;
        let mtime = cur.u32()?;
        let compressed_size = cur.u32()?;
        let crc32 = cur.u32()?;
        let flags = cur.u32()?;
        let entry_meta_len = cur.u32()? as usize;
        cur.take(entry_meta_len)?;

        let compression = if flags & ENTRY_FLAG_GZ != 0 {
            Compression::Gz
        } else if flags & ENTRY_FLAG_BZ2 != 0 {
            Compression::Bz2
        } else {
            Compression::None
        };
        entries.push(EntryRecord {
            path,
            uncompressed_size,
            mtime,
            compressed_size,
            crc32,
            compression,
        });
    }

    let consumed = cur.pos;
    if consumed - body_start != manifest_len {
        return Err(PharError::Malformed {
            reason: format!(
                "manifest length mismatch: header says {}, decoded {}",
                manifest_len,
                consumed - body_start
            ),
        });
    }
    Ok((
        Decoded {
            alias,
            metadata,
            global_flags,
            entries,
        },
        consumed,
    ))
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], PharError> {
        let end = self.pos.checked_add(n).ok_or_else(truncated)?;
        if end > self.bytes.len() {
            return Err(truncated());
        }
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32, PharError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u16(&mut self) -> Result<u16, PharError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }
}

fn truncated() -> PharError {
    PharError::Malformed {
        reason: "manifest truncated".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry(path: &str, compression: Compression) -> EntryRecord {
        EntryRecord {
            path: path.into(),
            uncompressed_size: 10,
            mtime: 0,
            compressed_size: 10,
            crc32: 0xDEAD_BEEF,
            compression,
        }
    }

    #[test]
    fn roundtrip_preserves_entries_and_header() {
        let entries = vec![
            sample_entry("index.php", Compression::None),
            sample_entry("src/App.php", Compression::Gz),
        ];
        let encoded = encode(&entries, "app.phar", Some(b"i:42;"), true);
        let (decoded, consumed) = decode(&encoded).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded.alias, "app.phar");
        assert_eq!(decoded.metadata.as_deref(), Some(&b"i:42;"[..]));
        assert_eq!(decoded.global_flags, GLOBAL_FLAG_SIGNED);
        assert_eq!(decoded.entries, entries);
    }

    #[test]
    fn absent_metadata_is_length_zero() {
        let encoded = encode(&[], "a.phar", None, false);
        let (decoded, _) = decode(&encoded).unwrap();
        assert_eq!(decoded.metadata, None);
    }

    #[test]
    fn per_entry_compression_does_not_set_global_bits() {
        let entries = vec![sample_entry("a.php", Compression::Gz)];
        let encoded = encode(&entries, "a.phar", None, true);
        let (decoded, _) = decode(&encoded).unwrap();
        assert_eq!(decoded.global_flags, GLOBAL_FLAG_SIGNED);
        assert_eq!(decoded.entries[0].compression, Compression::Gz);
    }

    #[test]
    fn entry_flags_carry_mode_and_compression() {
        let entry = sample_entry("a.php", Compression::Bz2);
        assert_eq!(entry.flags(), ENTRY_MODE | ENTRY_FLAG_BZ2);
    }

    #[test]
    fn truncated_manifest_is_rejected() {
        let encoded = encode(&[sample_entry("a.php", Compression::None)], "a", None, false);
        let err = decode(&encoded[..encoded.len() - 3]).unwrap_err();
        assert!(matches!(err, PharError::Malformed { .. }));
    }

    #[test]
    fn path_validation() {
        assert!(validate_entry_path("src/App.php").is_ok());
        assert!(validate_entry_path(".box/.requirements.php").is_ok());
        assert!(validate_entry_path("/abs").is_err());
        assert!(validate_entry_path("a\\b").is_err());
        assert!(validate_entry_path("a/../b").is_err());
        assert!(validate_entry_path("a//b").is_err());
        assert!(validate_entry_path("./a").is_err());
        assert!(validate_entry_path("").is_err());
    }
}
