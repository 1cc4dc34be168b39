//! Phar self-executing archive container.
//!
//! A phar is a stub (executable PHP prelude) followed by a binary manifest,
//! the concatenated entry bodies, and a signature trailer ending in the
//! `GBMB` magic. This crate owns the container format: stub synthesis and
//! validation, manifest encoding, per-entry compression, trailer signing,
//! and a reader used for post-build verification and tests.
//!
//! The write path is streaming: entry bodies are spooled to disk so archives
//! with tens of thousands of files never hold more than one 64 KiB buffer of
//! file content in memory.

pub mod manifest;
mod php_serialize;
pub mod reader;
pub mod signature;
pub mod stub;
pub mod writer;

pub use manifest::{Compression, EntryRecord};
pub use php_serialize::php_serialize;
pub use reader::PharReader;
pub use signature::{SignatureAlgorithm, Signer};
pub use stub::{StubSpec, STUB_TERMINATOR};
pub use writer::{CloseSummary, PharWriter, EMPTY_ENTRY_PATH, STREAM_THRESHOLD};

/// Container-level errors.
#[derive(Debug, thiserror::Error)]
pub enum PharError {
    #[error("duplicate entry: {path}")]
    DuplicateEntry { path: String },

    #[error("invalid entry path {path}: {reason}")]
    InvalidEntryPath { path: String, reason: String },

    #[error("invalid stub: {reason}")]
    StubInvalid { reason: String },

    #[error("signing key {path} unusable: {reason}")]
    SigningKeyUnreadable {
        path: std::path::PathBuf,
        reason: String,
    },

    #[error("signature does not match archive contents")]
    SignatureMismatch,

    #[error("malformed archive: {reason}")]
    Malformed { reason: String },

    #[error("archive I/O error")]
    Io(#[source] std::io::Error),
}
