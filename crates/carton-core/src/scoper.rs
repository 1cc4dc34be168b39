//! Source prefixer (scoper) integration.
//!
//! The prefixer wraps declared symbols of third-party code in a generated
//! namespace so bundled dependencies cannot collide with host code. It is
//! externalized: a child process reads file contents on stdin and writes the
//! transformed contents on stdout. The core only consumes the byte-to-byte
//! contract; any failure is fatal.

use std::io::{Read, Write};
use std::path::Path;
use std::process::{Command, Stdio};

use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{Error, Result};

/// Configuration file probed in the base path.
pub const SCOPER_CONFIG_FILE: &str = "scoper.json";

const AUTO_PREFIX_BASE: &str = "_HumbugBox";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct RawScoperConfig {
    /// Namespace prefix; generated when absent.
    prefix: Option<String>,
    /// Prefixer command line; receives `--prefix <prefix> --file <path>`.
    command: Vec<String>,
    /// Glob patterns (on bundle paths) selecting the files to rewrite.
    include: Option<Vec<String>>,
}

/// Resolved scoper configuration.
#[derive(Debug, Clone)]
pub struct ScoperConfig {
    pub prefix: String,
    pub command: Vec<String>,
    pub include: Vec<String>,
}

impl ScoperConfig {
    /// Load `scoper.json` from the base path; absent file means the Prefix
    /// stage is skipped entirely.
    ///
    /// The auto-generated prefix carries a stable suffix derived from the
    /// base path and lock file, so rebuilds of the same tree stay
    /// byte-identical.
    pub fn load(base_path: &Path) -> Result<Option<Self>> {
        let path = base_path.join(SCOPER_CONFIG_FILE);
        if !path.is_file() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&path)
            .map_err(|e| Error::io(format!("cannot read {}", path.display()), e))?;
        let raw: RawScoperConfig = serde_json::from_str(&text)
            .map_err(|e| Error::config(format!("cannot parse {}: {}", path.display(), e)))?;
        if raw.command.is_empty() {
            return Err(Error::config("scoper command must not be empty"));
        }

        let prefix = match raw.prefix {
            Some(prefix) if !prefix.is_empty() => prefix,
            _ => generated_prefix(base_path),
        };
        Ok(Some(Self {
            prefix,
            command: raw.command,
            include: raw
                .include
                .unwrap_or_else(|| vec!["**/*.php".to_string()]),
        }))
    }
}

fn generated_prefix(base_path: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(base_path.to_string_lossy().as_bytes());
    if let Ok(lock) = std::fs::read(base_path.join("composer.lock")) {
        hasher.update(&lock);
    }
    let digest = hex::encode(hasher.finalize());
    format!("{}{}", AUTO_PREFIX_BASE, &digest[..12])
}

/// The contract the core consumes: `prefix(contents, relativePath) ->
/// contents`.
pub trait Prefixer {
    fn prefix(&self, contents: &[u8], relative_path: &str) -> Result<Vec<u8>>;
}

/// Runs the configured prefixer command per file, streaming contents through
/// stdin/stdout.
pub struct SubprocessPrefixer {
    config: ScoperConfig,
}

impl SubprocessPrefixer {
    pub fn new(config: ScoperConfig) -> Self {
        Self { config }
    }

    pub fn namespace_prefix(&self) -> &str {
        &self.config.prefix
    }
}

impl Prefixer for SubprocessPrefixer {
    fn prefix(&self, contents: &[u8], relative_path: &str) -> Result<Vec<u8>> {
        let failed = |reason: String| Error::PrefixFailed {
            path: relative_path.to_string(),
            reason,
        };

        let mut child = Command::new(&self.config.command[0])
            .args(&self.config.command[1..])
            .arg("--prefix")
            .arg(&self.config.prefix)
            .arg("--file")
            .arg(relative_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| failed(format!("cannot spawn {}: {}", self.config.command[0], e)))?;

        // Feed stdin from a helper thread: the child may start writing
        // before it has consumed all input, and both pipes have bounded
        // buffers.
        let mut stdin = child.stdin.take().expect("stdin piped");
        let input = contents.to_vec();
        let feeder = std::thread::spawn(move || stdin.write_all(&input));

        let mut transformed = Vec::new();
        child
            .stdout
            .take()
            .expect("stdout piped")
            .read_to_end(&mut transformed)
            .map_err(|e| failed(format!("cannot read prefixer output: {}", e)))?;

        feeder
            .join()
            .map_err(|_| failed("stdin feeder panicked".to_string()))?
            .map_err(|e| failed(format!("cannot write prefixer input: {}", e)))?;

        let status = child
            .wait()
            .map_err(|e| failed(format!("cannot wait for prefixer: {}", e)))?;
        if !status.success() {
            let mut stderr = String::new();
            if let Some(mut pipe) = child.stderr.take() {
                let _ = pipe.read_to_string(&mut stderr);
            }
            return Err(failed(format!("exited with {}: {}", status, stderr.trim())));
        }
        debug!(path = relative_path, bytes = transformed.len(), "file prefixed");
        Ok(transformed)
    }
}
