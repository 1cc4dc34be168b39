//! Streaming phar writer.
//!
//! Entry bodies are spooled to an unnamed temp file as they are added, so
//! the manifest (which precedes the bodies in the container) can be encoded
//! at close time without ever holding a large file in memory. Files above
//! [`STREAM_THRESHOLD`] are copied through a fixed buffer; smaller files are
//! read whole.
//!
//! Close order: stub, manifest, bodies (compressing per-entry on the way
//! through), then the signature trailer over everything written so far.

use std::collections::HashSet;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bzip2::write::BzEncoder;
use flate2::write::DeflateEncoder;
use tracing::debug;

use crate::manifest::{self, Compression, EntryRecord};
use crate::signature::Signer;
use crate::{stub, PharError};

/// Files at or below this size are read fully; larger files are streamed.
pub const STREAM_THRESHOLD: u64 = 64 * 1024;

/// Entry written when a build produces no files, keeping the container
/// valid.
pub const EMPTY_ENTRY_PATH: &str = ".box_empty";

/// Result of a successful close.
#[derive(Debug, Clone, Copy)]
pub struct CloseSummary {
    pub entry_count: usize,
    /// Final on-disk size of the archive, trailer included.
    pub file_size: u64,
}

struct PendingEntry {
    path: String,
    spool_offset: u64,
    uncompressed_size: u64,
    crc32: u32,
    compression: Compression,
}

/// Writer for a phar container at a temporary path. The caller renames the
/// finished file into place.
pub struct PharWriter {
    tmp_path: PathBuf,
    spool: File,
    spool_len: u64,
    entries: Vec<PendingEntry>,
    seen: HashSet<String>,
    stub: Option<Vec<u8>>,
    alias: String,
    metadata: Option<Vec<u8>>,
    closed: bool,
}

impl PharWriter {
    /// Create the output file at `tmp_path` (truncating any leftover) and an
    /// anonymous spool for entry bodies.
    pub fn create(tmp_path: &Path) -> Result<Self, PharError> {
        File::create(tmp_path).map_err(PharError::Io)?;
        let spool = tempfile::tempfile().map_err(PharError::Io)?;
        Ok(Self {
            tmp_path: tmp_path.to_path_buf(),
            spool,
            spool_len: 0,
            entries: Vec::new(),
            seen: HashSet::new(),
            stub: None,
            alias: String::new(),
            metadata: None,
            closed: false,
        })
    }

    pub fn tmp_path(&self) -> &Path {
        &self.tmp_path
    }

    /// Set the leading stub. Must end with the terminator, optionally
    /// followed by a single newline; written verbatim, trailing whitespace
    /// preserved.
    pub fn set_stub(&mut self, stub: &[u8]) -> Result<(), PharError> {
        stub::validate_custom(stub)?;
        self.stub = Some(stub.to_vec());
        Ok(())
    }

    pub fn set_alias(&mut self, alias: &str) {
        self.alias = alias.to_string();
    }

    /// Store metadata in the manifest header. `None` (and JSON null) is
    /// represented as absent rather than as an empty serialized value.
    pub fn set_metadata(&mut self, metadata: Option<&serde_json::Value>) {
        self.metadata = match metadata {
            None | Some(serde_json::Value::Null) => None,
            Some(value) => Some(crate::php_serialize(value)),
        };
    }

    /// Append an entry from in-memory bytes.
    pub fn add_from_string(&mut self, path: &str, contents: &[u8]) -> Result<(), PharError> {
        self.begin_entry(path)?;
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(contents);
        self.spool.write_all(contents).map_err(PharError::Io)?;
        self.finish_entry(path, contents.len() as u64, hasher.finalize())
    }

    /// Append an entry streamed from disk. Contents above the threshold
    /// never reside fully in memory.
    pub fn add_from_file(&mut self, path: &str, local: &Path) -> Result<(), PharError> {
        self.begin_entry(path)?;
        let mut file = File::open(local).map_err(PharError::Io)?;
        let len = file.metadata().map_err(PharError::Io)?.len();

        let mut hasher = crc32fast::Hasher::new();
        let mut written = 0u64;
        if len <= STREAM_THRESHOLD {
            let mut contents = Vec::with_capacity(len as usize);
            file.read_to_end(&mut contents).map_err(PharError::Io)?;
            hasher.update(&contents);
            self.spool.write_all(&contents).map_err(PharError::Io)?;
            written = contents.len() as u64;
        } else {
            debug!(path, len, "streaming large entry");
            let mut buf = [0u8; STREAM_THRESHOLD as usize];
            loop {
                let n = file.read(&mut buf).map_err(PharError::Io)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                self.spool.write_all(&buf[..n]).map_err(PharError::Io)?;
                written += n as u64;
            }
        }
        self.finish_entry(path, written, hasher.finalize())
    }

    /// Mark one entry for per-entry compression at close.
    pub fn compress_entry(&mut self, path: &str, compression: Compression) -> Result<(), PharError> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.path == path)
            .ok_or_else(|| PharError::Malformed {
                reason: format!("no such entry to compress: {}", path),
            })?;
        entry.compression = compression;
        Ok(())
    }

    /// Mark every entry for per-entry compression at close.
    pub fn compress_all(&mut self, compression: Compression) {
        for entry in &mut self.entries {
            entry.compression = compression;
        }
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn has_entry(&self, path: &str) -> bool {
        self.seen.contains(path)
    }

    /// Write stub, manifest, bodies and trailer, then fsync. On any error
    /// the temporary file is removed before the error propagates.
    pub fn close(mut self, signer: &Signer) -> Result<CloseSummary, PharError> {
        let result = self.close_inner(signer);
        self.closed = true;
        if result.is_err() {
            let _ = std::fs::remove_file(&self.tmp_path);
        }
        result
    }

    fn close_inner(&mut self, signer: &Signer) -> Result<CloseSummary, PharError> {
        if self.entries.is_empty() {
            self.add_from_string(EMPTY_ENTRY_PATH, b"")?;
        }
        let stub = self.stub.take().ok_or_else(|| PharError::Malformed {
            reason: "no stub set before close".into(),
        })?;

        // Pass 1: produce final bodies, compressing where flagged.
        let mut bodies = tempfile::tempfile().map_err(PharError::Io)?;
        let mut records = Vec::with_capacity(self.entries.len());
        self.spool.flush().map_err(PharError::Io)?;
        for entry in &self.entries {
            let compressed_size = copy_body(
                &mut self.spool,
                entry.spool_offset,
                entry.uncompressed_size,
                &mut bodies,
                entry.compression,
            )?;
            records.push(EntryRecord {
                path: entry.path.clone(),
                uncompressed_size: checked_u32(entry.uncompressed_size, &entry.path)?,
                mtime: 0,
                compressed_size: checked_u32(compressed_size, &entry.path)?,
                crc32: entry.crc32,
                compression: entry.compression,
            });
        }

        // Pass 2: stub + manifest + bodies into the output file.
        let manifest = manifest::encode(&records, &self.alias, self.metadata.as_deref(), true);
        let mut out = File::options()
            .write(true)
            .truncate(true)
            .open(&self.tmp_path)
            .map_err(PharError::Io)?;
        out.write_all(&stub).map_err(PharError::Io)?;
        out.write_all(&manifest).map_err(PharError::Io)?;
        bodies.seek(SeekFrom::Start(0)).map_err(PharError::Io)?;
        std::io::copy(&mut bodies, &mut out).map_err(PharError::Io)?;
        out.flush().map_err(PharError::Io)?;

        // Pass 3: signature over everything written so far.
        let signed_len = out.stream_position().map_err(PharError::Io)?;
        let mut reader = File::open(&self.tmp_path).map_err(PharError::Io)?;
        let signature = signer.sign((&mut reader).take(signed_len))?;
        out.write_all(&signature).map_err(PharError::Io)?;
        out.write_all(&signer.algorithm().flag().to_le_bytes())
            .map_err(PharError::Io)?;
        out.write_all(manifest::SIG_MAGIC).map_err(PharError::Io)?;
        out.flush().map_err(PharError::Io)?;
        out.sync_all().map_err(PharError::Io)?;

        let file_size = out.stream_position().map_err(PharError::Io)?;
        debug!(entries = records.len(), file_size, "archive closed");
        Ok(CloseSummary {
            entry_count: records.len(),
            file_size,
        })
    }

    fn begin_entry(&mut self, path: &str) -> Result<(), PharError> {
        manifest::validate_entry_path(path)?;
        if self.seen.contains(path) {
            return Err(PharError::DuplicateEntry {
                path: path.to_string(),
            });
        }
        self.spool.seek(SeekFrom::End(0)).map_err(PharError::Io)?;
        Ok(())
    }

    fn finish_entry(&mut self, path: &str, size: u64, crc32: u32) -> Result<(), PharError> {
        self.seen.insert(path.to_string());
        self.entries.push(PendingEntry {
            path: path.to_string(),
            spool_offset: self.spool_len,
            uncompressed_size: size,
            crc32,
            compression: Compression::None,
        });
        self.spool_len += size;
        Ok(())
    }
}

impl Drop for PharWriter {
    fn drop(&mut self) {
        // An unclosed writer leaves no partial output behind.
        if !self.closed {
            let _ = std::fs::remove_file(&self.tmp_path);
        }
    }
}

/// Copy one raw body segment into `out`, applying `compression`. Returns the
/// number of bytes written.
fn copy_body(
    spool: &mut File,
    offset: u64,
    len: u64,
    out: &mut File,
    compression: Compression,
) -> Result<u64, PharError> {
    spool.seek(SeekFrom::Start(offset)).map_err(PharError::Io)?;
    let mut segment = spool.take(len);
    let start = out.stream_position().map_err(PharError::Io)?;
    match compression {
        Compression::None => {
            std::io::copy(&mut segment, out).map_err(PharError::Io)?;
        }
        Compression::Gz => {
            // Raw DEFLATE stream; the entry flag, not a header, names the
            // algorithm.
            let mut encoder = DeflateEncoder::new(&mut *out, flate2::Compression::default());
            std::io::copy(&mut segment, &mut encoder).map_err(PharError::Io)?;
            encoder.finish().map_err(PharError::Io)?;
        }
        Compression::Bz2 => {
            let mut encoder = BzEncoder::new(&mut *out, bzip2::Compression::default());
            std::io::copy(&mut segment, &mut encoder).map_err(PharError::Io)?;
            encoder.finish().map_err(PharError::Io)?;
        }
    }
    let end = out.stream_position().map_err(PharError::Io)?;
    Ok(end - start)
}

fn checked_u32(value: u64, path: &str) -> Result<u32, PharError> {
    u32::try_from(value).map_err(|_| PharError::Malformed {
        reason: format!("entry {} exceeds the 4 GiB container limit", path),
    })
}
