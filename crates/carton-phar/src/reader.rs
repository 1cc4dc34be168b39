//! Minimal phar reader.
//!
//! Enough of the read path to verify a freshly written bundle and to let
//! tests assert on container contents: stub boundary scan, manifest decode,
//! entry extraction with CRC check, signature verification. Not a general
//! phar toolbox.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use bzip2::read::BzDecoder;
use flate2::read::DeflateDecoder;

use crate::manifest::{self, Compression, Decoded, EntryRecord, SIG_MAGIC};
use crate::signature::{self, SignatureAlgorithm};
use crate::stub::STUB_TERMINATOR;
use crate::PharError;

/// Largest stub the scanner will accept before declaring the file
/// terminator-less.
const MAX_STUB_LEN: u64 = 4 * 1024 * 1024;

pub struct PharReader {
    path: PathBuf,
    stub: Vec<u8>,
    decoded: Decoded,
    /// Offset of the first entry body.
    data_offset: u64,
    /// Offset of the signature (end of the last entry body).
    sig_offset: u64,
    signature: Vec<u8>,
    sig_algorithm: SignatureAlgorithm,
}

impl PharReader {
    pub fn open(path: &Path) -> Result<Self, PharError> {
        let mut file = File::open(path).map_err(PharError::Io)?;
        let file_len = file.metadata().map_err(PharError::Io)?.len();

        let stub = read_stub(&mut file, file_len)?;
        let stub_len = stub.len() as u64;

        // Manifest: length prefix, then the table.
        file.seek(SeekFrom::Start(stub_len)).map_err(PharError::Io)?;
        let mut len_buf = [0u8; 4];
        file.read_exact(&mut len_buf).map_err(PharError::Io)?;
        let manifest_len = u32::from_le_bytes(len_buf) as u64;
        if stub_len + 4 + manifest_len > file_len {
            return Err(PharError::Malformed {
                reason: "manifest extends past end of file".into(),
            });
        }
        let mut manifest_buf = vec![0u8; 4 + manifest_len as usize];
        manifest_buf[..4].copy_from_slice(&len_buf);
        file.read_exact(&mut manifest_buf[4..]).map_err(PharError::Io)?;
        let (decoded, consumed) = manifest::decode(&manifest_buf)?;
        let data_offset = stub_len + consumed as u64;

        let body_len: u64 = decoded
            .entries
            .iter()
            .map(|e| e.compressed_size as u64)
            .sum();
        let sig_offset = data_offset + body_len;
        if sig_offset + 8 > file_len {
            return Err(PharError::Malformed {
                reason: "file too short for signature trailer".into(),
            });
        }

        // Trailer: signature bytes, u32 flag, magic.
        file.seek(SeekFrom::Start(file_len - 8)).map_err(PharError::Io)?;
        let mut trailer = [0u8; 8];
        file.read_exact(&mut trailer).map_err(PharError::Io)?;
        if &trailer[4..] != SIG_MAGIC {
            return Err(PharError::Malformed {
                reason: "missing GBMB signature magic".into(),
            });
        }
        let flag = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        let sig_algorithm = SignatureAlgorithm::from_flag(flag)?;

        file.seek(SeekFrom::Start(sig_offset)).map_err(PharError::Io)?;
        let mut signature = vec![0u8; (file_len - 8 - sig_offset) as usize];
        file.read_exact(&mut signature).map_err(PharError::Io)?;

        Ok(Self {
            path: path.to_path_buf(),
            stub,
            decoded,
            data_offset,
            sig_offset,
            signature,
            sig_algorithm,
        })
    }

    pub fn stub(&self) -> &[u8] {
        &self.stub
    }

    pub fn alias(&self) -> &str {
        &self.decoded.alias
    }

    /// Raw PHP-serialized metadata, when present.
    pub fn metadata_bytes(&self) -> Option<&[u8]> {
        self.decoded.metadata.as_deref()
    }

    pub fn global_flags(&self) -> u32 {
        self.decoded.global_flags
    }

    pub fn entries(&self) -> &[EntryRecord] {
        &self.decoded.entries
    }

    pub fn entry_names(&self) -> Vec<&str> {
        self.decoded.entries.iter().map(|e| e.path.as_str()).collect()
    }

    pub fn signature_algorithm(&self) -> SignatureAlgorithm {
        self.sig_algorithm
    }

    /// Read and decompress one entry, checking size and CRC32.
    pub fn read_entry(&self, path: &str) -> Result<Vec<u8>, PharError> {
        let mut offset = self.data_offset;
        let entry = self
            .decoded
            .entries
            .iter()
            .find(|e| {
                if e.path == path {
                    true
                } else {
                    offset += e.compressed_size as u64;
                    false
                }
            })
            .ok_or_else(|| PharError::Malformed {
                reason: format!("no such entry: {}", path),
            })?;

        let mut file = File::open(&self.path).map_err(PharError::Io)?;
        file.seek(SeekFrom::Start(offset)).map_err(PharError::Io)?;
        let segment = (&mut file).take(entry.compressed_size as u64);

        let mut contents = Vec::with_capacity(entry.uncompressed_size as usize);
        match entry.compression {
            Compression::None => {
                let mut segment = segment;
                segment.read_to_end(&mut contents).map_err(PharError::Io)?;
            }
            Compression::Gz => {
                DeflateDecoder::new(segment)
                    .read_to_end(&mut contents)
                    .map_err(PharError::Io)?;
            }
            Compression::Bz2 => {
                BzDecoder::new(segment)
                    .read_to_end(&mut contents)
                    .map_err(PharError::Io)?;
            }
        }

        if contents.len() as u64 != entry.uncompressed_size as u64 {
            return Err(PharError::Malformed {
                reason: format!(
                    "entry {} size mismatch: manifest {}, decoded {}",
                    path,
                    entry.uncompressed_size,
                    contents.len()
                ),
            });
        }
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&contents);
        if hasher.finalize() != entry.crc32 {
            return Err(PharError::Malformed {
                reason: format!("entry {} CRC32 mismatch", path),
            });
        }
        Ok(contents)
    }

    /// Verify the signature trailer. OPENSSL needs the sidecar public key
    /// PEM.
    pub fn verify_signature(&self, public_key_pem: Option<&str>) -> Result<(), PharError> {
        let mut file = File::open(&self.path).map_err(PharError::Io)?;
        signature::verify(
            self.sig_algorithm,
            &self.signature,
            (&mut file).take(self.sig_offset),
            public_key_pem,
        )
    }
}

/// Read bytes up to and including the stub terminator (plus one optional
/// newline).
fn read_stub(file: &mut File, file_len: u64) -> Result<Vec<u8>, PharError> {
    let scan_len = file_len.min(MAX_STUB_LEN) as usize;
    let mut buf = vec![0u8; scan_len];
    file.seek(SeekFrom::Start(0)).map_err(PharError::Io)?;
    file.read_exact(&mut buf).map_err(PharError::Io)?;

    let needle = STUB_TERMINATOR.as_bytes();
    let pos = buf
        .windows(needle.len())
        .position(|w| w == needle)
        .ok_or_else(|| PharError::StubInvalid {
            reason: format!("no `{}` terminator found", STUB_TERMINATOR),
        })?;
    let mut end = pos + needle.len();
    if buf.get(end) == Some(&b'\r') && buf.get(end + 1) == Some(&b'\n') {
        end += 2;
    } else if buf.get(end) == Some(&b'\n') {
        end += 1;
    }
    buf.truncate(end);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::Signer;
    use crate::stub::{generate, StubSpec};
    use crate::writer::PharWriter;

    fn build_archive(dir: &tempfile::TempDir, compression: Compression) -> PathBuf {
        let tmp = dir.path().join("app.phar.tmp");
        let mut w = PharWriter::create(&tmp).unwrap();
        w.set_stub(
            generate(&StubSpec {
                alias: "app.phar".into(),
                index: Some("index.php".into()),
                ..Default::default()
            })
            .as_bytes(),
        )
        .unwrap();
        w.set_alias("app.phar");
        w.set_metadata(Some(&serde_json::json!({"rand": 42})));
        w.add_from_string("index.php", b"<?php echo 'Yo';").unwrap();
        w.add_from_string("src/App.php", b"<?php class App {}").unwrap();
        w.compress_all(compression);
        w.close(&Signer::Sha256).unwrap();
        tmp
    }

    #[test]
    fn roundtrip_uncompressed() {
        let dir = tempfile::tempdir().unwrap();
        let path = build_archive(&dir, Compression::None);
        let reader = PharReader::open(&path).unwrap();

        assert_eq!(reader.alias(), "app.phar");
        assert_eq!(reader.entry_names(), vec!["index.php", "src/App.php"]);
        assert_eq!(reader.read_entry("index.php").unwrap(), b"<?php echo 'Yo';");
        assert_eq!(
            reader.metadata_bytes().unwrap(),
            b"a:1:{s:4:\"rand\";i:42;}"
        );
        reader.verify_signature(None).unwrap();
    }

    #[test]
    fn roundtrip_gz_and_bz2() {
        for compression in [Compression::Gz, Compression::Bz2] {
            let dir = tempfile::tempdir().unwrap();
            let path = build_archive(&dir, compression);
            let reader = PharReader::open(&path).unwrap();
            for entry in reader.entries() {
                assert_eq!(entry.compression, compression);
            }
            assert_eq!(reader.read_entry("src/App.php").unwrap(), b"<?php class App {}");
            reader.verify_signature(None).unwrap();
        }
    }

    #[test]
    fn global_flags_keep_compression_bits_clear() {
        let dir = tempfile::tempdir().unwrap();
        let path = build_archive(&dir, Compression::Gz);
        let reader = PharReader::open(&path).unwrap();
        assert_eq!(reader.global_flags(), manifest::GLOBAL_FLAG_SIGNED);
    }

    #[test]
    fn tampering_breaks_signature() {
        let dir = tempfile::tempdir().unwrap();
        let path = build_archive(&dir, Compression::None);
        let mut bytes = std::fs::read(&path).unwrap();
        // Flip a byte inside the stub.
        bytes[3] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let reader = PharReader::open(&path).unwrap();
        assert!(matches!(
            reader.verify_signature(None),
            Err(PharError::SignatureMismatch)
        ));
    }

    #[test]
    fn stub_bytes_are_preserved_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let tmp = dir.path().join("custom.phar.tmp");
        let custom = b"#!/usr/bin/env php\n<?php echo 'custom'; __HALT_COMPILER(); ?>\n";
        let mut w = PharWriter::create(&tmp).unwrap();
        w.set_stub(custom).unwrap();
        w.set_alias("c.phar");
        w.add_from_string("a.php", b"x").unwrap();
        w.close(&Signer::Sha1).unwrap();

        let reader = PharReader::open(&tmp).unwrap();
        assert_eq!(reader.stub(), custom);
    }
}
