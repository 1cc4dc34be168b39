//! Signature trailer computation and verification.
//!
//! The digest covers every byte from offset 0 through the end of the last
//! entry body. The trailer is `signature bytes | u32 algorithm flag | GBMB`.
//!
//! SHA-family signatures are plain unkeyed digests. OPENSSL signs the
//! SHA-256 digest with RSA PKCS#1 v1.5 padding, which is deterministic, so
//! repeated builds with the same key stay byte-identical.

use std::io::Read;
use std::path::Path;

use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};

use crate::PharError;

/// Signature algorithm flags as stored in the trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureAlgorithm {
    Sha1,
    Sha256,
    Sha512,
    OpenSsl,
}

impl SignatureAlgorithm {
    pub fn flag(self) -> u32 {
        match self {
            SignatureAlgorithm::Sha1 => 0x02,
            SignatureAlgorithm::Sha256 => 0x04,
            SignatureAlgorithm::Sha512 => 0x08,
            SignatureAlgorithm::OpenSsl => 0x10,
        }
    }

    pub fn from_flag(flag: u32) -> Result<Self, PharError> {
        match flag {
            0x02 => Ok(SignatureAlgorithm::Sha1),
            0x04 => Ok(SignatureAlgorithm::Sha256),
            0x08 => Ok(SignatureAlgorithm::Sha512),
            0x10 => Ok(SignatureAlgorithm::OpenSsl),
            other => Err(PharError::Malformed {
                reason: format!("unknown signature flag {:#x}", other),
            }),
        }
    }
}

/// A configured signer, ready to produce the trailer bytes.
pub enum Signer {
    Sha1,
    Sha256,
    Sha512,
    OpenSsl(Box<RsaPrivateKey>),
}

impl Signer {
    /// Load an RSA private key for OPENSSL signing.
    ///
    /// Accepts PKCS#8 (`PRIVATE KEY`), encrypted PKCS#8
    /// (`ENCRYPTED PRIVATE KEY`, requires the passphrase), and PKCS#1
    /// (`RSA PRIVATE KEY`) PEM encodings.
    pub fn openssl_from_key_file(
        path: &Path,
        passphrase: Option<&str>,
    ) -> Result<Self, PharError> {
        let pem = std::fs::read_to_string(path).map_err(|source| PharError::SigningKeyUnreadable {
            path: path.to_path_buf(),
            reason: source.to_string(),
        })?;
        let unreadable = |reason: String| PharError::SigningKeyUnreadable {
            path: path.to_path_buf(),
            reason,
        };

        let key = if pem.contains("ENCRYPTED PRIVATE KEY") {
            let passphrase = passphrase.ok_or_else(|| {
                unreadable("key is encrypted but no passphrase was provided".into())
            })?;
            RsaPrivateKey::from_pkcs8_encrypted_pem(&pem, passphrase)
                .map_err(|e| unreadable(format!("cannot decrypt key: {}", e)))?
        } else {
            RsaPrivateKey::from_pkcs8_pem(&pem)
                .or_else(|_| RsaPrivateKey::from_pkcs1_pem(&pem))
                .map_err(|e| unreadable(format!("cannot parse key: {}", e)))?
        };
        Ok(Signer::OpenSsl(Box::new(key)))
    }

    pub fn algorithm(&self) -> SignatureAlgorithm {
        match self {
            Signer::Sha1 => SignatureAlgorithm::Sha1,
            Signer::Sha256 => SignatureAlgorithm::Sha256,
            Signer::Sha512 => SignatureAlgorithm::Sha512,
            Signer::OpenSsl(_) => SignatureAlgorithm::OpenSsl,
        }
    }

    /// Compute the signature bytes over `reader` (the archive from offset 0
    /// through the last entry body).
    pub fn sign<R: Read>(&self, reader: R) -> Result<Vec<u8>, PharError> {
        match self {
            Signer::Sha1 => digest_stream::<Sha1, _>(reader),
            Signer::Sha256 => digest_stream::<Sha256, _>(reader),
            Signer::Sha512 => digest_stream::<Sha512, _>(reader),
            Signer::OpenSsl(key) => {
                let digest = digest_stream::<Sha256, _>(reader)?;
                key.sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
                    .map_err(|e| PharError::Malformed {
                        reason: format!("RSA signing failed: {}", e),
                    })
            }
        }
    }

    /// The PKCS#8 public key PEM for OPENSSL signers, written beside the
    /// bundle as `<output>.pubkey`.
    pub fn public_key_pem(&self) -> Option<Result<String, PharError>> {
        match self {
            Signer::OpenSsl(key) => Some(
                key.to_public_key()
                    .to_public_key_pem(LineEnding::LF)
                    .map_err(|e| PharError::Malformed {
                        reason: format!("cannot encode public key: {}", e),
                    }),
            ),
            _ => None,
        }
    }
}

/// Verify a signature trailer against the signed byte stream.
///
/// For OPENSSL, `public_key_pem` must hold the sidecar public key.
pub fn verify<R: Read>(
    algorithm: SignatureAlgorithm,
    signature: &[u8],
    reader: R,
    public_key_pem: Option<&str>,
) -> Result<(), PharError> {
    let mismatch = || PharError::SignatureMismatch;
    match algorithm {
        SignatureAlgorithm::Sha1 => {
            (digest_stream::<Sha1, _>(reader)? == signature)
                .then_some(())
                .ok_or_else(mismatch)
        }
        SignatureAlgorithm::Sha256 => {
            (digest_stream::<Sha256, _>(reader)? == signature)
                .then_some(())
                .ok_or_else(mismatch)
        }
        SignatureAlgorithm::Sha512 => {
            (digest_stream::<Sha512, _>(reader)? == signature)
                .then_some(())
                .ok_or_else(mismatch)
        }
        SignatureAlgorithm::OpenSsl => {
            let pem = public_key_pem.ok_or(PharError::SignatureMismatch)?;
            let key = RsaPublicKey::from_public_key_pem(pem).map_err(|e| PharError::Malformed {
                reason: format!("cannot parse public key: {}", e),
            })?;
            let digest = digest_stream::<Sha256, _>(reader)?;
            key.verify(Pkcs1v15Sign::new::<Sha256>(), &digest, signature)
                .map_err(|_| mismatch())
        }
    }
}

fn digest_stream<D: Digest, R: Read>(mut reader: R) -> Result<Vec<u8>, PharError> {
    let mut hasher = D::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf).map_err(PharError::Io)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_vec())
}
