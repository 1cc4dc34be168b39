//! Declarative finder: a configured directory walk.
//!
//! Mirrors the recognized finder options (`in`, `name`, `not-name`, `path`,
//! `not-path`, `depth`, `exclude`, `ignore-vcs`, `ignore-dot-files`) with a
//! deterministic walker instead of a fluent builder.

use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use walkdir::WalkDir;

use crate::config::RawFinder;
use crate::error::{Error, Result};

const VCS_DIRS: &[&str] = &[".git", ".svn", ".hg"];

/// A resolved finder block.
#[derive(Debug, Clone)]
pub struct FinderConfig {
    pub in_dirs: Vec<PathBuf>,
    names: Vec<String>,
    not_names: Vec<String>,
    paths: Vec<String>,
    not_paths: Vec<String>,
    depth: Option<usize>,
    excludes: Vec<String>,
    ignore_vcs: bool,
    ignore_dot_files: bool,
}

impl FinderConfig {
    pub fn from_raw(raw: RawFinder) -> Result<Self> {
        let in_dirs = raw
            .in_dirs
            .map(|d| d.into_vec())
            .unwrap_or_default()
            .into_iter()
            .map(PathBuf::from)
            .collect::<Vec<_>>();
        if in_dirs.is_empty() {
            return Err(Error::config("finder requires at least one `in` directory"));
        }
        Ok(Self {
            in_dirs,
            names: raw.name.map(|n| n.into_vec()).unwrap_or_default(),
            not_names: raw.not_name.map(|n| n.into_vec()).unwrap_or_default(),
            paths: raw.path.map(|p| p.into_vec()).unwrap_or_default(),
            not_paths: raw.not_path.map(|p| p.into_vec()).unwrap_or_default(),
            depth: raw.depth,
            excludes: raw.exclude.map(|e| e.into_vec()).unwrap_or_default(),
            ignore_vcs: raw.ignore_vcs.unwrap_or(true),
            ignore_dot_files: raw.ignore_dot_files.unwrap_or(true),
        })
    }

    /// Walk every `in` root under `base`, yielding matching files in
    /// walkdir's sorted order.
    pub fn find(&self, base: &Path) -> Result<Vec<PathBuf>> {
        let names = compile_globs(&self.names)?;
        let not_names = compile_globs(&self.not_names)?;
        let paths = compile_globs(&self.paths)?;
        let not_paths = compile_globs(&self.not_paths)?;

        let mut out = Vec::new();
        for in_dir in &self.in_dirs {
            let root = if in_dir.is_absolute() {
                in_dir.clone()
            } else {
                base.join(in_dir)
            };
            if !root.is_dir() {
                return Err(Error::config(format!(
                    "finder `in` directory does not exist: {}",
                    root.display()
                )));
            }

            let mut walker = WalkDir::new(&root).follow_links(false).sort_by_file_name();
            if let Some(depth) = self.depth {
                // depth 0 = files directly inside the root.
                walker = walker.max_depth(depth + 1);
            }
            let iter = walker.into_iter().filter_entry(|entry| {
                let name = entry.file_name().to_string_lossy();
                if entry.depth() == 0 {
                    return true;
                }
                if self.ignore_vcs && entry.file_type().is_dir() && VCS_DIRS.contains(&&*name) {
                    return false;
                }
                if self.ignore_dot_files && name.starts_with('.') {
                    return false;
                }
                if entry.file_type().is_dir() {
                    let rel = entry.path().strip_prefix(&root).unwrap_or(entry.path());
                    let rel = rel.to_string_lossy().replace('\\', "/");
                    if self.excludes.iter().any(|ex| {
                        let ex = ex.trim_end_matches('/');
                        rel == ex || rel.starts_with(&format!("{}/", ex))
                    }) {
                        return false;
                    }
                }
                true
            });

            for entry in iter {
                let entry = entry.map_err(|e| {
                    Error::config(format!("finder walk failed under {}: {}", root.display(), e))
                })?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy();
                if let Some(names) = &names {
                    if !names.is_match(&*name) {
                        continue;
                    }
                }
                if let Some(not_names) = &not_names {
                    if not_names.is_match(&*name) {
                        continue;
                    }
                }
                let rel = entry
                    .path()
                    .strip_prefix(&root)
                    .unwrap_or(entry.path())
                    .to_string_lossy()
                    .replace('\\', "/");
                if let Some(paths) = &paths {
                    if !paths.is_match(&rel) {
                        continue;
                    }
                }
                if let Some(not_paths) = &not_paths {
                    if not_paths.is_match(&rel) {
                        continue;
                    }
                }
                out.push(entry.into_path());
            }
        }
        Ok(out)
    }
}

fn compile_globs(patterns: &[String]) -> Result<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(
            Glob::new(pattern)
                .map_err(|e| Error::config(format!("invalid finder pattern {:?}: {}", pattern, e)))?,
        );
    }
    builder
        .build()
        .map(Some)
        .map_err(|e| Error::config(format!("cannot compile finder patterns: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OneOrMany;

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"x").unwrap();
    }

    fn finder(raw: RawFinder) -> FinderConfig {
        FinderConfig::from_raw(raw).unwrap()
    }

    fn rel_names(found: &[PathBuf], root: &Path) -> Vec<String> {
        found
            .iter()
            .map(|p| {
                p.strip_prefix(root)
                    .unwrap()
                    .to_string_lossy()
                    .replace('\\', "/")
            })
            .collect()
    }

    #[test]
    fn name_patterns_filter_files() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("src/App.php"));
        touch(&dir.path().join("src/notes.md"));
        touch(&dir.path().join("src/deep/Tool.php"));

        let f = finder(RawFinder {
            in_dirs: Some(OneOrMany::One("src".into())),
            name: Some(OneOrMany::One("*.php".into())),
            ..Default::default()
        });
        let found = f.find(dir.path()).unwrap();
        assert_eq!(
            rel_names(&found, dir.path()),
            vec!["src/App.php", "src/deep/Tool.php"]
        );
    }

    #[test]
    fn vcs_and_dot_files_ignored_by_default() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("src/a.php"));
        touch(&dir.path().join("src/.git/config"));
        touch(&dir.path().join("src/.hidden"));

        let f = finder(RawFinder {
            in_dirs: Some(OneOrMany::One("src".into())),
            ..Default::default()
        });
        let found = f.find(dir.path()).unwrap();
        assert_eq!(rel_names(&found, dir.path()), vec!["src/a.php"]);
    }

    #[test]
    fn excludes_prune_directories() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("src/a.php"));
        touch(&dir.path().join("src/vendor/dep.php"));

        let f = finder(RawFinder {
            in_dirs: Some(OneOrMany::One("src".into())),
            exclude: Some(OneOrMany::One("vendor".into())),
            ..Default::default()
        });
        let found = f.find(dir.path()).unwrap();
        assert_eq!(rel_names(&found, dir.path()), vec!["src/a.php"]);
    }

    #[test]
    fn depth_limits_recursion() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("src/a.php"));
        touch(&dir.path().join("src/deep/b.php"));

        let f = finder(RawFinder {
            in_dirs: Some(OneOrMany::One("src".into())),
            depth: Some(0),
            ..Default::default()
        });
        let found = f.find(dir.path()).unwrap();
        assert_eq!(rel_names(&found, dir.path()), vec!["src/a.php"]);
    }

    #[test]
    fn not_path_filters_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("src/a.php"));
        touch(&dir.path().join("src/tests/t.php"));

        let f = finder(RawFinder {
            in_dirs: Some(OneOrMany::One("src".into())),
            not_path: Some(OneOrMany::One("tests/**".into())),
            ..Default::default()
        });
        let found = f.find(dir.path()).unwrap();
        assert_eq!(rel_names(&found, dir.path()), vec!["src/a.php"]);
    }

    #[test]
    fn missing_in_dir_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let f = finder(RawFinder {
            in_dirs: Some(OneOrMany::One("nope".into())),
            ..Default::default()
        });
        assert!(matches!(
            f.find(dir.path()),
            Err(Error::ConfigInvalid { .. })
        ));
    }
}
