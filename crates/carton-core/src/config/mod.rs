//! Configuration file schema and loading.
//!
//! The configuration lives in `box.json` (a `box.json.dist` variant is
//! accepted when the primary file is absent). The raw schema is strict:
//! unknown keys fail the build instead of being silently ignored.

pub mod resolve;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;

use crate::error::{Error, Result};

pub use resolve::{BuildConfig, SigningAlgorithm, SigningConfig, StubMode};

/// Default configuration file names, probed in order.
pub const CONFIG_CANDIDATES: &[&str] = &["box.json", "box.json.dist"];

/// A key accepting one value or a list of values.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T: Clone> OneOrMany<T> {
    pub fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(v) => vec![v],
            OneOrMany::Many(vs) => vs,
        }
    }
}

/// A key accepting a string or the literal `false` to disable the feature.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum StringOrFalse {
    Value(String),
    Disabled(bool),
}

/// `key-pass`: a literal passphrase, or `true` to prompt on the terminal.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum KeyPass {
    Passphrase(String),
    Prompt(bool),
}

/// `stub`: a stub file path, `true` for the library default stub, or
/// `false` to autogenerate.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum StubOption {
    Path(String),
    Flag(bool),
}

/// One finder block: a declarative directory walk.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct RawFinder {
    #[serde(rename = "in")]
    pub in_dirs: Option<OneOrMany<String>>,
    pub name: Option<OneOrMany<String>>,
    pub not_name: Option<OneOrMany<String>>,
    pub path: Option<OneOrMany<String>>,
    pub not_path: Option<OneOrMany<String>>,
    /// Maximum directory depth below each `in` root; 0 means files directly
    /// inside it.
    pub depth: Option<usize>,
    pub exclude: Option<OneOrMany<String>>,
    pub ignore_vcs: Option<bool>,
    pub ignore_dot_files: Option<bool>,
}

/// The raw `box.json` schema. All keys optional; resolution applies
/// defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct RawConfig {
    pub alias: Option<String>,
    pub banner: Option<BannerOption>,
    pub banner_file: Option<String>,
    pub base_path: Option<String>,
    pub blacklist: Option<Vec<String>>,
    pub check_requirements: Option<bool>,
    pub chmod: Option<String>,
    pub compactors: Option<OneOrMany<String>>,
    pub compression: Option<String>,
    pub directories: Option<OneOrMany<String>>,
    pub directories_bin: Option<OneOrMany<String>>,
    pub dump_autoload: Option<bool>,
    pub exclude_composer_files: Option<bool>,
    pub exclude_dev_files: Option<bool>,
    pub files: Option<OneOrMany<String>>,
    pub files_bin: Option<OneOrMany<String>>,
    pub finder: Option<Vec<RawFinder>>,
    pub finder_bin: Option<Vec<RawFinder>>,
    pub force_autodiscovery: Option<bool>,
    pub intercept: Option<bool>,
    pub main: Option<StringOrFalse>,
    /// Ordered prefix rewrites; each element is a single-pair object.
    pub map: Option<Vec<BTreeMap<String, String>>>,
    pub metadata: Option<Value>,
    pub output: Option<String>,
    pub algorithm: Option<String>,
    pub key: Option<String>,
    pub key_pass: Option<KeyPass>,
    pub replacements: Option<BTreeMap<String, Value>>,
    pub git_version: Option<String>,
    pub git_commit: Option<String>,
    pub git_tag: Option<String>,
    pub datetime: Option<String>,
    #[serde(rename = "datetime_format")]
    pub datetime_format: Option<String>,
    pub shebang: Option<StringOrFalse>,
    pub stub: Option<StubOption>,
}

/// `banner`: a string, a list of lines, or `false` for none.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum BannerOption {
    Text(String),
    Lines(Vec<String>),
    Disabled(bool),
}

/// Where the configuration came from.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub raw: RawConfig,
    /// Absent when running with `--no-config` and no file was found.
    pub path: Option<PathBuf>,
}

/// Load an explicit configuration file.
pub fn load_file(path: &Path) -> Result<LoadedConfig> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        Error::config(format!("cannot read config {}: {}", path.display(), e))
    })?;
    let raw: RawConfig = serde_json::from_str(&text)
        .map_err(|e| Error::config(format!("cannot parse {}: {}", path.display(), e)))?;
    validate_raw(&raw)?;
    Ok(LoadedConfig {
        raw,
        path: Some(path.to_path_buf()),
    })
}

/// Probe the working directory for `box.json` / `box.json.dist`. A missing
/// file yields an empty configuration, matching the zero-config build path.
pub fn discover(working_dir: &Path) -> Result<LoadedConfig> {
    for candidate in CONFIG_CANDIDATES {
        let path = working_dir.join(candidate);
        if path.is_file() {
            return load_file(&path);
        }
    }
    Ok(LoadedConfig {
        raw: RawConfig::default(),
        path: None,
    })
}

/// Cross-key validation the serde schema cannot express.
fn validate_raw(raw: &RawConfig) -> Result<()> {
    if raw.banner.is_some() && raw.banner_file.is_some() {
        return Err(Error::config(
            "banner and banner-file are mutually exclusive",
        ));
    }
    if let Some(map) = &raw.map {
        for pair in map {
            if pair.len() != 1 {
                return Err(Error::config(
                    "each map element must hold exactly one prefix-replacement pair",
                ));
            }
        }
    }
    if matches!(raw.stub, Some(StubOption::Path(_)))
        && (raw.shebang.is_some() || raw.banner.is_some() || raw.banner_file.is_some())
    {
        return Err(Error::config(
            "shebang and banner cannot be combined with a custom stub file",
        ));
    }
    Ok(())
}
