//! Dependency manager integration.
//!
//! The manager is an external collaborator: its manifest and lock file are
//! read for discovery, dev-package pruning and requirement collection, and
//! its `dump-autoload` command is invoked as a subprocess to rewrite the
//! autoload graph before assembly.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;

use serde::Deserialize;
use tracing::{debug, info};

use crate::config::OneOrMany;
use crate::error::{Error, Result};

/// Environment override for the manager binary (useful in tests).
pub const COMPOSER_BIN_ENV: &str = "COMPOSER_BIN";

/// The project manifest (`composer.json`). Parsed leniently: only the keys
/// the builder consumes are modeled.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub autoload: Autoload,
    #[serde(default)]
    pub require: BTreeMap<String, String>,
    #[serde(default)]
    pub config: ManagerConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Autoload {
    #[serde(rename = "psr-4", default)]
    pub psr4: BTreeMap<String, OneOrMany<String>>,
    #[serde(rename = "psr-0", default)]
    pub psr0: BTreeMap<String, OneOrMany<String>>,
    #[serde(default)]
    pub classmap: Vec<String>,
    #[serde(default)]
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ManagerConfig {
    #[serde(rename = "vendor-dir")]
    pub vendor_dir: Option<String>,
}

impl Manifest {
    pub fn load(base_path: &Path) -> Result<Option<Self>> {
        let path = base_path.join("composer.json");
        if !path.is_file() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&path)
            .map_err(|e| Error::io(format!("cannot read {}", path.display()), e))?;
        let manifest = serde_json::from_str(&text)
            .map_err(|e| Error::config(format!("cannot parse {}: {}", path.display(), e)))?;
        Ok(Some(manifest))
    }

    /// Directories named by the autoload declaration (psr-4, psr-0,
    /// classmap), relative to the base path.
    pub fn autoload_directories(&self) -> Vec<String> {
        let mut dirs = Vec::new();
        for value in self.autoload.psr4.values().chain(self.autoload.psr0.values()) {
            dirs.extend(value.clone().into_vec());
        }
        dirs.extend(self.autoload.classmap.iter().cloned());
        dirs.sort();
        dirs.dedup();
        dirs
    }

    pub fn autoload_files(&self) -> Vec<String> {
        self.autoload.files.clone()
    }

    pub fn vendor_dir(&self) -> String {
        self.config
            .vendor_dir
            .clone()
            .unwrap_or_else(|| "vendor".to_string())
    }
}

/// The dependency lock file (`composer.lock`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Lock {
    #[serde(default)]
    pub packages: Vec<Package>,
    #[serde(rename = "packages-dev", default)]
    pub packages_dev: Vec<Package>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Package {
    pub name: String,
    #[serde(default)]
    pub require: BTreeMap<String, String>,
}

impl Lock {
    pub fn load(base_path: &Path) -> Result<Option<Self>> {
        let path = base_path.join("composer.lock");
        if !path.is_file() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&path)
            .map_err(|e| Error::io(format!("cannot read {}", path.display()), e))?;
        let lock = serde_json::from_str(&text)
            .map_err(|e| Error::config(format!("cannot parse {}: {}", path.display(), e)))?;
        Ok(Some(lock))
    }
}

/// Run `dump-autoload --classmap-authoritative [--no-dev] [-v…]` in the
/// base path. A non-zero exit is fatal with the captured output surfaced.
/// No timeout by design: some installs are slow.
pub fn dump_autoload(base_path: &Path, no_dev: bool, verbosity: u8) -> Result<()> {
    let bin = std::env::var(COMPOSER_BIN_ENV).unwrap_or_else(|_| "composer".to_string());
    let mut cmd = Command::new(&bin);
    cmd.arg("dump-autoload")
        .arg("--classmap-authoritative")
        .current_dir(base_path);
    if no_dev {
        cmd.arg("--no-dev");
    }
    if verbosity > 0 {
        cmd.arg(format!("-{}", "v".repeat(verbosity.min(3) as usize)));
    }

    info!(manager = %bin, no_dev, "dumping the optimized autoloader");
    let output = cmd.output().map_err(|e| Error::DependencyManagerFailed {
        status: "spawn failed".to_string(),
        output: format!("cannot run {}: {}", bin, e),
    })?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !output.status.success() {
        return Err(Error::DependencyManagerFailed {
            status: output.status.to_string(),
            output: format!("{}{}", stdout, stderr),
        });
    }
    debug!(stdout = %stdout.trim(), stderr = %stderr.trim(), "autoload dump finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_autoload_directories() {
        let manifest: Manifest = serde_json::from_str(
            r#"{
                "name": "acme/app",
                "autoload": {
                    "psr-4": {"Acme\\": "src/", "Acme\\Tests\\": ["tests/", "spec/"]},
                    "classmap": ["legacy/"],
                    "files": ["bootstrap.php"]
                }
            }"#,
        )
        .unwrap();
        assert_eq!(
            manifest.autoload_directories(),
            vec!["legacy/", "spec/", "src/", "tests/"]
        );
        assert_eq!(manifest.autoload_files(), vec!["bootstrap.php"]);
        assert_eq!(manifest.vendor_dir(), "vendor");
    }

    #[test]
    fn custom_vendor_dir() {
        let manifest: Manifest =
            serde_json::from_str(r#"{"config": {"vendor-dir": "deps"}}"#).unwrap();
        assert_eq!(manifest.vendor_dir(), "deps");
    }

    #[test]
    fn lock_packages_parse_with_requirements() {
        let lock: Lock = serde_json::from_str(
            r#"{
                "packages": [
                    {"name": "acme/lib", "require": {"php": ">=8.1", "ext-mbstring": "*"}}
                ],
                "packages-dev": [{"name": "acme/devtool"}]
            }"#,
        )
        .unwrap();
        assert_eq!(lock.packages[0].name, "acme/lib");
        assert_eq!(lock.packages[0].require["php"], ">=8.1");
        assert_eq!(lock.packages_dev[0].name, "acme/devtool");
    }

    #[test]
    fn failed_dump_surfaces_output() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var(COMPOSER_BIN_ENV, "false");
        let err = dump_autoload(dir.path(), false, 0).unwrap_err();
        std::env::remove_var(COMPOSER_BIN_ENV);
        assert!(matches!(err, Error::DependencyManagerFailed { .. }));
    }
}
