//! Content compactors.
//!
//! A compactor is a pure, deterministic transformer applied to matching
//! files before archival. Registered compactors run in declared order; each
//! only touches files it supports.

mod php;

use crate::error::{Error, Result};

pub use php::PhpCompactor;

pub trait Compactor: Send + Sync {
    /// Identifier shown in logs and the debug dump.
    fn name(&self) -> &str;

    fn supports(&self, bundle_path: &str) -> bool;

    /// Transform file contents. Must be deterministic; applying the
    /// compactor to its own output is a no-op.
    fn compact(&self, contents: &[u8]) -> Vec<u8>;
}

/// Build the compactor set from configuration identifiers: `php`, `json`,
/// or `pattern:EXT[,EXT…]`.
pub fn registry(identifiers: &[String]) -> Result<Vec<Box<dyn Compactor>>> {
    let mut out: Vec<Box<dyn Compactor>> = Vec::new();
    for id in identifiers {
        match id.as_str() {
            "php" => out.push(Box::new(PhpCompactor)),
            "json" => out.push(Box::new(JsonCompactor)),
            other => match other.strip_prefix("pattern:") {
                Some(suffixes) if !suffixes.is_empty() => {
                    out.push(Box::new(PatternCompactor::new(
                        suffixes.split(',').map(str::to_string).collect(),
                    )));
                }
                _ => {
                    return Err(Error::config(format!(
                        "unknown compactor {:?} (expected php, json or pattern:EXT,…)",
                        other
                    )));
                }
            },
        }
    }
    Ok(out)
}

/// Minifies JSON files. Invalid JSON passes through untouched.
pub struct JsonCompactor;

impl Compactor for JsonCompactor {
    fn name(&self) -> &str {
        "json"
    }

    fn supports(&self, bundle_path: &str) -> bool {
        bundle_path.ends_with(".json")
    }

    fn compact(&self, contents: &[u8]) -> Vec<u8> {
        match serde_json::from_slice::<serde_json::Value>(contents) {
            Ok(value) => serde_json::to_vec(&value).unwrap_or_else(|_| contents.to_vec()),
            Err(_) => contents.to_vec(),
        }
    }
}

/// Suffix-parameterized whitespace trimmer: strips trailing horizontal
/// whitespace per line and collapses runs of blank lines to one.
pub struct PatternCompactor {
    suffixes: Vec<String>,
}

impl PatternCompactor {
    pub fn new(suffixes: Vec<String>) -> Self {
        let suffixes = suffixes
            .into_iter()
            .map(|s| {
                if s.starts_with('.') {
                    s
                } else {
                    format!(".{}", s)
                }
            })
            .collect();
        Self { suffixes }
    }
}

impl Compactor for PatternCompactor {
    fn name(&self) -> &str {
        "pattern"
    }

    fn supports(&self, bundle_path: &str) -> bool {
        self.suffixes.iter().any(|s| bundle_path.ends_with(s))
    }

    fn compact(&self, contents: &[u8]) -> Vec<u8> {
        let Ok(text) = std::str::from_utf8(contents) else {
            return contents.to_vec();
        };
        let mut out = String::with_capacity(text.len());
        let mut blank_run = 0usize;
        for line in text.split_inclusive('\n') {
            let has_newline = line.ends_with('\n');
            let trimmed = line.trim_end_matches(['\n', '\r', ' ', '\t']);
            if trimmed.is_empty() {
                blank_run += 1;
                if blank_run > 1 {
                    continue;
                }
            } else {
                blank_run = 0;
            }
            out.push_str(trimmed);
            if has_newline {
                out.push('\n');
            }
        }
        out.into_bytes()
    }
}
