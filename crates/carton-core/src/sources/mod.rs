//! Source enumeration: expand finders, directories, explicit lists,
//! exclusions and auto-discovery into the deduplicated, sorted entry set the
//! assembler consumes.

mod finder;
mod map;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::composer;
use crate::config::{BuildConfig, RawFinder};
use crate::error::{Error, Result};

pub use finder::FinderConfig;
pub use map::MapFile;

/// One file placed in the bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEntry {
    /// Absolute path on disk.
    pub local_path: PathBuf,
    /// Forward-slash path inside the bundle; never starts with `/`.
    pub bundle_path: String,
}

/// Enumeration result: regular files (compactable) and binary files (added
/// raw), both sorted by bundle path.
#[derive(Debug, Default)]
pub struct Sources {
    pub files: Vec<SourceEntry>,
    pub binary_files: Vec<SourceEntry>,
}

impl Sources {
    pub fn len(&self) -> usize {
        self.files.len() + self.binary_files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.binary_files.is_empty()
    }
}

pub fn enumerate(
    config: &BuildConfig,
    manifest: Option<&composer::Manifest>,
    lock: Option<&composer::Lock>,
) -> Result<Sources> {
    let base = &config.base_path;

    let has_explicit = !config.files.is_empty()
        || !config.directories.is_empty()
        || !config.finders.is_empty();
    let auto_discover = config.force_autodiscovery || !has_explicit;

    let mut regular: Vec<PathBuf> = Vec::new();
    if auto_discover {
        regular.extend(discover_from_autoload(base, manifest)?);
    }
    if has_explicit {
        for dir in &config.directories {
            regular.extend(walk_directory(base, dir)?);
        }
        for finder in &config.finders {
            regular.extend(finder.find(base)?);
        }
        regular.extend(config.files.iter().cloned());
    }

    let mut binary: Vec<PathBuf> = Vec::new();
    for dir in &config.directories_bin {
        binary.extend(walk_directory(base, dir)?);
    }
    for finder in &config.finders_bin {
        binary.extend(finder.find(base)?);
    }
    binary.extend(config.binary_files.iter().cloned());

    let excluder = Excluder::new(config, lock);
    let mut seen: HashMap<String, PathBuf> = HashMap::new();

    let files = place(regular, config, &excluder, &mut seen)?;
    let binary_files = place(binary, config, &excluder, &mut seen)?;

    debug!(
        files = files.len(),
        binary = binary_files.len(),
        "sources enumerated"
    );
    Ok(Sources {
        files,
        binary_files,
    })
}

/// Map, deduplicate, verify readability and sort one candidate list. `seen`
/// spans the regular/binary union so bundle paths stay globally unique.
fn place(
    candidates: Vec<PathBuf>,
    config: &BuildConfig,
    excluder: &Excluder,
    seen: &mut HashMap<String, PathBuf>,
) -> Result<Vec<SourceEntry>> {
    let mut entries = Vec::new();
    for local_path in candidates {
        let Some(relative) = excluder.admit(&local_path, config) else {
            continue;
        };
        let bundle_path = config.map.apply(&relative);

        match seen.get(&bundle_path) {
            Some(existing) if existing == &local_path => continue,
            Some(existing) => {
                return Err(Error::ConflictingSourcePaths {
                    bundle_path,
                    first: existing.clone(),
                    second: local_path,
                });
            }
            None => {}
        }

        // Every entry must be stat-able and readable at assembly time.
        std::fs::File::open(&local_path).map_err(|e| Error::UnreadableSource {
            path: local_path.clone(),
            source: e,
        })?;

        seen.insert(bundle_path.clone(), local_path.clone());
        entries.push(SourceEntry {
            local_path,
            bundle_path,
        });
    }
    entries.sort_by(|a, b| a.bundle_path.cmp(&b.bundle_path));
    Ok(entries)
}

struct Excluder {
    /// Base-relative forward-slash paths always excluded: the output file,
    /// the temporary output, the configuration file.
    fixed: Vec<String>,
    builder_exe: Option<PathBuf>,
    blacklist: Vec<String>,
    dev_dirs: Vec<String>,
    main_relative: Option<String>,
}

impl Excluder {
    fn new(config: &BuildConfig, lock: Option<&composer::Lock>) -> Self {
        let rel = |path: &Path| -> Option<String> {
            let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
            path.strip_prefix(&config.base_path)
                .ok()
                .map(|r| r.to_string_lossy().replace('\\', "/"))
        };
        let mut fixed = Vec::new();
        fixed.extend(rel(&config.output_path));
        fixed.extend(rel(&config.tmp_output_path));
        if let Some(config_file) = &config.config_path {
            fixed.extend(rel(config_file));
        }

        let dev_dirs = if config.exclude_dev_files {
            lock.map(|l| {
                l.packages_dev
                    .iter()
                    .map(|p| format!("vendor/{}", p.name))
                    .collect()
            })
            .unwrap_or_default()
        } else {
            Vec::new()
        };
        Self {
            fixed,
            builder_exe: std::env::current_exe().ok(),
            blacklist: config.blacklist.clone(),
            dev_dirs,
            main_relative: config.main_script_bundle_path.clone(),
        }
    }

    /// Returns the base-relative forward-slash path when the candidate
    /// survives every exclusion rule.
    fn admit(&self, path: &Path, config: &BuildConfig) -> Option<String> {
        if self.builder_exe.as_deref() == Some(path) {
            return None;
        }
        if path
            .components()
            .any(|c| matches!(c.as_os_str().to_str(), Some(".git" | ".svn" | ".hg")))
        {
            return None;
        }

        let relative = path
            .strip_prefix(&config.base_path)
            .ok()?
            .to_string_lossy()
            .replace('\\', "/");

        if self.fixed.iter().any(|f| f == &relative) {
            return None;
        }
        if self.main_relative.as_deref() == Some(relative.as_str()) {
            return None;
        }
        for entry in &self.blacklist {
            let entry = entry.trim_end_matches('/');
            if relative == entry || relative.starts_with(&format!("{}/", entry)) {
                return None;
            }
        }
        for dev_dir in &self.dev_dirs {
            if relative.starts_with(&format!("{}/", dev_dir)) {
                return None;
            }
        }
        Some(relative)
    }
}

/// Plain recursive directory walk with the default VCS and dot-file
/// exclusions.
fn walk_directory(base: &Path, dir: &Path) -> Result<Vec<PathBuf>> {
    let raw = RawFinder {
        in_dirs: Some(crate::config::OneOrMany::One(
            dir.to_string_lossy().into_owned(),
        )),
        ..Default::default()
    };
    FinderConfig::from_raw(raw)?.find(base)
}

/// Auto-discovery: include what the dependency manager's autoload
/// declaration names, plus the vendor tree and the manager's own manifest
/// files (the latter may be stripped again after the autoload dump).
fn discover_from_autoload(
    base: &Path,
    manifest: Option<&composer::Manifest>,
) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();

    if let Some(manifest) = manifest {
        for dir in manifest.autoload_directories() {
            let path = base.join(&dir);
            if path.is_dir() {
                out.extend(walk_directory(base, &path)?);
            }
        }
        for file in manifest.autoload_files() {
            let path = base.join(&file);
            if path.is_file() {
                out.push(path);
            }
        }
    }

    let vendor = base.join(manifest.map(|m| m.vendor_dir()).unwrap_or_else(|| "vendor".into()));
    if vendor.is_dir() {
        out.extend(walk_directory(base, &vendor)?);
    }
    for name in ["composer.json", "composer.lock"] {
        let path = base.join(name);
        if path.is_file() {
            out.push(path);
        }
    }
    Ok(out)
}
