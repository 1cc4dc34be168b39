//! Build error taxonomy. Every error is fatal for the current build; there
//! are no retries.

use std::path::PathBuf;

use carton_phar::PharError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Unknown option, type mismatch, or mutually exclusive options both
    /// set.
    #[error("invalid configuration: {reason}")]
    ConfigInvalid { reason: String },

    #[error("source path is not readable: {path}")]
    UnreadableSource {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Two distinct local paths mapped onto the same bundle path.
    #[error(
        "conflicting source paths: both {first} and {second} map to bundle path {bundle_path}"
    )]
    ConflictingSourcePaths {
        bundle_path: String,
        first: PathBuf,
        second: PathBuf,
    },

    #[error("dependency manager exited with {status}:\n{output}")]
    DependencyManagerFailed { status: String, output: String },

    #[error("prefixer failed on {path}: {reason}")]
    PrefixFailed { path: String, reason: String },

    /// OPENSSL signing selected but no key path configured.
    #[error("the OPENSSL signing algorithm requires a private key path")]
    SigningKeyRequired,

    /// The host interpreter environment forbids creating self-executing
    /// archives.
    #[error("creating self-executing archives is disabled by the host environment (PHAR_READONLY)")]
    HostReadOnly,

    #[error("build cancelled")]
    Cancelled,

    /// Container-level failures: duplicate entries, invalid stubs, signing
    /// key problems, archive I/O.
    #[error(transparent)]
    Phar(#[from] PharError),

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub fn config(reason: impl Into<String>) -> Self {
        Error::ConfigInvalid {
            reason: reason.into(),
        }
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    /// True for errors the CLI reports as configuration mistakes (exit code
    /// 2) rather than build failures.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Error::ConfigInvalid { .. } | Error::SigningKeyRequired | Error::HostReadOnly
        )
    }
}
