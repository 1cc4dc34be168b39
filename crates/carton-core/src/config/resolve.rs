//! Configuration resolution.
//!
//! Turns the raw schema into an immutable [`BuildConfig`]: absolute paths,
//! generated alias, processed replacement tokens, stub selection, signing
//! setup, and the warnings/recommendations surfaced in the final report.
//! After resolution nothing mutates the configuration again.

use std::path::{Path, PathBuf};
use std::process::Command;

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::Value;
use tracing::debug;

use carton_phar::Compression;

use crate::config::{
    BannerOption, KeyPass, LoadedConfig, RawConfig, StringOrFalse, StubOption,
};
use crate::error::{Error, Result};
use crate::sources::{FinderConfig, MapFile};

/// Signature algorithm selection. SHA1 is the container default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SigningAlgorithm {
    #[default]
    Sha1,
    Sha256,
    Sha512,
    OpenSsl,
}

impl SigningAlgorithm {
    fn parse(name: &str) -> Result<Self> {
        match name {
            "SHA1" => Ok(SigningAlgorithm::Sha1),
            "SHA256" => Ok(SigningAlgorithm::Sha256),
            "SHA512" => Ok(SigningAlgorithm::Sha512),
            "OPENSSL" => Ok(SigningAlgorithm::OpenSsl),
            other => Err(Error::config(format!(
                "unknown signature algorithm {:?} (expected SHA1, SHA256, SHA512 or OPENSSL)",
                other
            ))),
        }
    }
}

/// Resolved signing setup.
#[derive(Debug, Clone, Default)]
pub struct SigningConfig {
    pub algorithm: SigningAlgorithm,
    pub key_path: Option<PathBuf>,
    pub passphrase: Option<String>,
    /// Prompt on the controlling terminal when no passphrase is configured.
    pub prompt_for_passphrase: bool,
}

/// Exactly one stub source is selected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StubMode {
    /// Read the file verbatim; no shebang or banner injection.
    Path(PathBuf),
    /// Synthesize the stub from shebang/banner/alias/index.
    Generate,
    /// Use the archive library's built-in default stub.
    Default,
}

/// Immutable build configuration (spec: created once by ConfigResolve).
#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub base_path: PathBuf,
    pub alias: String,
    pub main_script_path: Option<PathBuf>,
    /// Bundle path of the main script inside the archive.
    pub main_script_bundle_path: Option<String>,
    pub main_script_contents: Option<Vec<u8>>,
    pub output_path: PathBuf,
    pub tmp_output_path: PathBuf,
    pub chmod: Option<u32>,

    pub files: Vec<PathBuf>,
    pub binary_files: Vec<PathBuf>,
    pub directories: Vec<PathBuf>,
    pub directories_bin: Vec<PathBuf>,
    pub finders: Vec<FinderConfig>,
    pub finders_bin: Vec<FinderConfig>,
    pub blacklist: Vec<String>,
    pub force_autodiscovery: bool,

    pub compactors: Vec<String>,
    pub compression: Compression,
    pub signing: SigningConfig,

    pub shebang: Option<String>,
    /// `None` renders no banner block; `Some("")` likewise.
    pub banner: Option<String>,
    pub stub: StubMode,
    pub map: MapFile,
    pub metadata: Option<Value>,

    pub check_requirements: bool,
    pub dump_autoload: bool,
    pub exclude_dev_files: bool,
    pub exclude_composer_files: bool,
    pub intercept_file_funcs: bool,

    /// `@key@` token to replacement value, in deterministic order.
    pub replacements: Vec<(String, String)>,

    pub dev_mode: bool,
    pub config_path: Option<PathBuf>,

    pub warnings: Vec<String>,
    pub recommendations: Vec<String>,
}

const DEFAULT_SHEBANG: &str = "#!/usr/bin/env php";
const DEFAULT_BANNER: &str =
    "Generated by Carton.\n\n@link https://github.com/carton-project/carton";
const ALIAS_PREFIX: &str = "box-auto-generated-alias-";
const DEFAULT_DATETIME_FORMAT: &str = "Y-m-d H:i:s T";

/// Resolve a loaded configuration against `working_dir`.
pub fn resolve(loaded: LoadedConfig, working_dir: &Path, dev_mode: bool) -> Result<BuildConfig> {
    let LoadedConfig { raw, path: config_path } = loaded;
    let mut warnings = Vec::new();
    let mut recommendations = Vec::new();

    let base_path = match &raw.base_path {
        Some(base) => {
            let joined = absolutize(working_dir, Path::new(base));
            joined.canonicalize().map_err(|e| {
                Error::config(format!("base-path {} is not usable: {}", joined.display(), e))
            })?
        }
        None => working_dir
            .canonicalize()
            .map_err(|e| Error::io("cannot canonicalize working directory", e))?,
    };

    let composer_json_present = base_path.join("composer.json").is_file();

    let alias = match &raw.alias {
        Some(alias) if alias.is_empty() => {
            return Err(Error::config("alias must not be empty"));
        }
        Some(alias) => alias.clone(),
        None => generated_alias(),
    };

    // Main script: `false` disables, absent defaults to index.php.
    let (main_script_path, main_explicit) = match &raw.main {
        Some(StringOrFalse::Disabled(false)) => (None, true),
        Some(StringOrFalse::Disabled(true)) => {
            return Err(Error::config("main accepts a path or false, not true"));
        }
        Some(StringOrFalse::Value(main)) => (Some(absolutize(&base_path, Path::new(main))), true),
        None => (Some(base_path.join("index.php")), false),
    };
    let main_script_path = match main_script_path {
        Some(path) if path.is_file() => Some(path),
        Some(path) if main_explicit => {
            return Err(Error::UnreadableSource {
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "main script not found"),
                path,
            });
        }
        Some(_) => None,
        None => None,
    };
    let main_script_bundle_path = main_script_path
        .as_ref()
        .map(|p| bundle_relative(&base_path, p))
        .transpose()?;
    let main_script_contents = main_script_path
        .as_ref()
        .map(|p| {
            std::fs::read(p).map_err(|e| Error::UnreadableSource {
                path: p.clone(),
                source: e,
            })
        })
        .transpose()?
        .map(strip_shebang);

    let output_path = match &raw.output {
        Some(output) => absolutize(&base_path, Path::new(output)),
        None => match &main_script_path {
            Some(main) => main.with_extension("phar"),
            None => {
                return Err(Error::config(
                    "output is required when no main script is configured",
                ));
            }
        },
    };
    let tmp_output_path = tmp_path_for(&output_path);

    let shebang = match &raw.shebang {
        Some(StringOrFalse::Disabled(false)) => None,
        Some(StringOrFalse::Disabled(true)) => {
            return Err(Error::config("shebang accepts a string or false, not true"));
        }
        Some(StringOrFalse::Value(line)) => {
            if !line.starts_with("#!") {
                return Err(Error::config(format!(
                    "shebang must start with #!: {:?}",
                    line
                )));
            }
            Some(line.clone())
        }
        None => Some(DEFAULT_SHEBANG.to_string()),
    };

    let chmod = match &raw.chmod {
        Some(mode) => Some(parse_chmod(mode)?),
        None if shebang.is_some() => Some(0o755),
        None => None,
    };

    let stub = match &raw.stub {
        Some(StubOption::Path(path)) => StubMode::Path(absolutize(&base_path, Path::new(path))),
        Some(StubOption::Flag(true)) => StubMode::Default,
        Some(StubOption::Flag(false)) | None => StubMode::Generate,
    };

    let banner = match (&raw.banner, &raw.banner_file) {
        (Some(BannerOption::Disabled(false)), None) => None,
        (Some(BannerOption::Disabled(true)), None) => {
            return Err(Error::config("banner accepts text, lines or false, not true"));
        }
        (Some(BannerOption::Text(text)), None) => Some(text.clone()),
        (Some(BannerOption::Lines(lines)), None) => Some(lines.join("\n")),
        (None, Some(file)) => {
            let path = absolutize(&base_path, Path::new(file));
            let text = std::fs::read_to_string(&path).map_err(|e| Error::UnreadableSource {
                path,
                source: e,
            })?;
            Some(text.trim_end_matches('\n').to_string())
        }
        (None, None) => Some(DEFAULT_BANNER.to_string()),
        (Some(_), Some(_)) => unreachable!("rejected by schema validation"),
    };

    let compression = match raw.compression.as_deref() {
        None | Some("NONE") => Compression::None,
        Some("GZ") => Compression::Gz,
        Some("BZ2") => Compression::Bz2,
        Some(other) => {
            return Err(Error::config(format!(
                "unknown compression algorithm {:?} (expected NONE, GZ or BZ2)",
                other
            )));
        }
    };
    match compression {
        Compression::Gz => warnings.push(
            "Using the \"GZ\" compression: the extension \"zlib\" will now be required to \
             execute the bundle"
                .to_string(),
        ),
        Compression::Bz2 => warnings.push(
            "Using the \"BZ2\" compression: the extension \"bz2\" will now be required to \
             execute the bundle"
                .to_string(),
        ),
        Compression::None => {}
    }

    let algorithm = match raw.algorithm.as_deref() {
        Some(name) => SigningAlgorithm::parse(name)?,
        None => SigningAlgorithm::default(),
    };
    let key_path = raw.key.as_ref().map(|k| absolutize(&base_path, Path::new(k)));
    let (passphrase, prompt_for_passphrase) = match &raw.key_pass {
        Some(KeyPass::Passphrase(pass)) => (Some(pass.clone()), false),
        Some(KeyPass::Prompt(true)) => (None, true),
        Some(KeyPass::Prompt(false)) | None => (None, false),
    };
    if algorithm == SigningAlgorithm::OpenSsl && key_path.is_none() {
        return Err(Error::SigningKeyRequired);
    }
    if algorithm != SigningAlgorithm::OpenSsl && (key_path.is_some() || raw.key_pass.is_some()) {
        warnings.push(
            "key and key-pass are only used with the OPENSSL signature algorithm".to_string(),
        );
    }
    let signing = SigningConfig {
        algorithm,
        key_path,
        passphrase,
        prompt_for_passphrase,
    };

    let dump_autoload = raw.dump_autoload.unwrap_or(composer_json_present);
    if raw.dump_autoload == Some(true) && !composer_json_present {
        return Err(Error::config(
            "dump-autoload requires a composer.json in the base path",
        ));
    }
    let check_requirements = raw.check_requirements.unwrap_or(composer_json_present);
    let exclude_composer_files = raw.exclude_composer_files.unwrap_or(true);
    let exclude_dev_files = raw.exclude_dev_files.unwrap_or(dump_autoload);

    if check_requirements && !base_path.join("composer.lock").is_file() {
        recommendations.push(
            "check-requirements is enabled but composer.lock is missing: the requirement \
             checker will have nothing to check"
                .to_string(),
        );
    }

    let map = MapFile::new(
        raw.map
            .as_ref()
            .map(|pairs| {
                pairs
                    .iter()
                    .flat_map(|p| p.iter().map(|(k, v)| (k.clone(), v.clone())))
                    .collect()
            })
            .unwrap_or_default(),
    );

    let replacements = process_replacements(&raw, &base_path)?;

    let finders = raw
        .finder
        .clone()
        .unwrap_or_default()
        .into_iter()
        .map(FinderConfig::from_raw)
        .collect::<Result<Vec<_>>>()?;
    let finders_bin = raw
        .finder_bin
        .clone()
        .unwrap_or_default()
        .into_iter()
        .map(FinderConfig::from_raw)
        .collect::<Result<Vec<_>>>()?;

    let to_abs = |paths: &Option<crate::config::OneOrMany<String>>| -> Vec<PathBuf> {
        paths
            .clone()
            .map(|p| p.into_vec())
            .unwrap_or_default()
            .into_iter()
            .map(|p| absolutize(&base_path, Path::new(&p)))
            .collect()
    };
    let files = to_abs(&raw.files);
    let binary_files = to_abs(&raw.files_bin);
    let directories = to_abs(&raw.directories);
    let directories_bin = to_abs(&raw.directories_bin);

    let config = BuildConfig {
        alias,
        main_script_path,
        main_script_bundle_path,
        main_script_contents,
        output_path,
        tmp_output_path,
        chmod,
        files,
        binary_files,
        directories,
        directories_bin,
        finders,
        finders_bin,
        blacklist: raw.blacklist.clone().unwrap_or_default(),
        force_autodiscovery: raw.force_autodiscovery.unwrap_or(false),
        compactors: raw.compactors.clone().map(|c| c.into_vec()).unwrap_or_default(),
        compression,
        signing,
        shebang,
        banner,
        stub,
        map,
        metadata: raw.metadata.clone(),
        check_requirements,
        dump_autoload,
        exclude_dev_files,
        exclude_composer_files,
        intercept_file_funcs: raw.intercept.unwrap_or(false),
        replacements,
        dev_mode,
        config_path,
        warnings,
        recommendations,
        base_path,
    };
    debug!(output = %config.output_path.display(), alias = %config.alias, "configuration resolved");
    Ok(config)
}

/// `box-auto-generated-alias-<12 alphanumerics>.phar`.
fn generated_alias() -> String {
    let token: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect();
    format!("{}{}.phar", ALIAS_PREFIX, token)
}

fn absolutize(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Temporary output path: the final name with a `.tmp` suffix appended.
fn tmp_path_for(output: &Path) -> PathBuf {
    let mut name = output
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    output.with_file_name(name)
}

fn parse_chmod(mode: &str) -> Result<u32> {
    let digits = mode.strip_prefix('0').unwrap_or(mode);
    if digits.len() != 3 || !digits.bytes().all(|b| (b'0'..=b'7').contains(&b)) {
        return Err(Error::config(format!(
            "chmod must be a 3-digit octal string, got {:?}",
            mode
        )));
    }
    u32::from_str_radix(digits, 8)
        .map_err(|e| Error::config(format!("chmod {:?}: {}", mode, e)))
}

fn bundle_relative(base: &Path, path: &Path) -> Result<String> {
    let rel = path.strip_prefix(base).map_err(|_| {
        Error::config(format!(
            "{} is outside the base path {}",
            path.display(),
            base.display()
        ))
    })?;
    Ok(rel.to_string_lossy().replace('\\', "/"))
}

/// Drop a leading shebang line from the main script so the archive stub's
/// own shebang is the only one.
fn strip_shebang(contents: Vec<u8>) -> Vec<u8> {
    if contents.starts_with(b"#!") {
        match contents.iter().position(|&b| b == b'\n') {
            Some(pos) => contents[pos + 1..].to_vec(),
            None => Vec::new(),
        }
    } else {
        contents
    }
}

/// Build the `@key@` replacement map from literal replacements plus the
/// derived git/datetime tokens.
fn process_replacements(raw: &RawConfig, base_path: &Path) -> Result<Vec<(String, String)>> {
    let mut out = Vec::new();
    if let Some(replacements) = &raw.replacements {
        for (key, value) in replacements {
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            out.push((format!("@{}@", key), rendered));
        }
    }
    if let Some(key) = &raw.git_version {
        let version = git_output(base_path, &["describe", "--tags", "HEAD"])
            .or_else(|_| git_output(base_path, &["log", "--pretty=%h", "-n1", "HEAD"]))?;
        out.push((format!("@{}@", key), version));
    }
    if let Some(key) = &raw.git_commit {
        out.push((
            format!("@{}@", key),
            git_output(base_path, &["log", "--pretty=%h", "-n1", "HEAD"])?,
        ));
    }
    if let Some(key) = &raw.git_tag {
        out.push((
            format!("@{}@", key),
            git_output(base_path, &["describe", "--tags", "HEAD"])?,
        ));
    }
    if let Some(key) = &raw.datetime {
        let format = raw
            .datetime_format
            .as_deref()
            .unwrap_or(DEFAULT_DATETIME_FORMAT);
        let now = chrono::Utc::now();
        out.push((
            format!("@{}@", key),
            now.format(&php_to_chrono_format(format)).to_string(),
        ));
    }
    Ok(out)
}

fn git_output(base_path: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(base_path)
        .output()
        .map_err(|e| Error::config(format!("cannot run git: {}", e)))?;
    if !output.status.success() {
        return Err(Error::config(format!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Translate the PHP date() format characters used by configurations into a
/// chrono format string. Unknown characters pass through literally.
fn php_to_chrono_format(format: &str) -> String {
    let mut out = String::new();
    for ch in format.chars() {
        match ch {
            'Y' => out.push_str("%Y"),
            'y' => out.push_str("%y"),
            'm' => out.push_str("%m"),
            'd' => out.push_str("%d"),
            'H' => out.push_str("%H"),
            'i' => out.push_str("%M"),
            's' => out.push_str("%S"),
            'T' => out.push_str("%Z"),
            'e' => out.push_str("%Z"),
            'P' => out.push_str("%:z"),
            '%' => out.push_str("%%"),
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{discover, load_file};

    fn write_config(dir: &Path, json: &str) -> PathBuf {
        let path = dir.join("box.json");
        std::fs::write(&path, json).unwrap();
        path
    }

    fn resolve_in(dir: &Path, json: &str) -> Result<BuildConfig> {
        let path = write_config(dir, json);
        resolve(load_file(&path)?, dir, false)
    }

    #[test]
    fn zero_config_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.php"), "<?php echo 'Yo';").unwrap();

        let config = resolve(discover(dir.path()).unwrap(), dir.path(), false).unwrap();
        assert!(config.alias.starts_with(ALIAS_PREFIX));
        assert!(config.alias.ends_with(".phar"));
        assert_eq!(
            config.alias.len(),
            ALIAS_PREFIX.len() + 12 + ".phar".len()
        );
        assert_eq!(config.output_path, dir.path().canonicalize().unwrap().join("index.phar"));
        assert_eq!(
            config.tmp_output_path.file_name().unwrap().to_str().unwrap(),
            "index.phar.tmp"
        );
        assert_eq!(config.signing.algorithm, SigningAlgorithm::Sha1);
        assert_eq!(config.stub, StubMode::Generate);
        assert_eq!(config.shebang.as_deref(), Some(DEFAULT_SHEBANG));
        assert_eq!(config.chmod, Some(0o755));
        assert!(!config.dump_autoload, "no composer.json present");
        assert!(!config.check_requirements);
    }

    #[test]
    fn main_false_requires_output() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve_in(dir.path(), r#"{"main": false}"#).unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid { .. }));

        let config =
            resolve_in(dir.path(), r#"{"main": false, "output": "app.phar"}"#).unwrap();
        assert!(config.main_script_path.is_none());
        assert!(config.main_script_contents.is_none());
    }

    #[test]
    fn explicit_missing_main_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve_in(dir.path(), r#"{"main": "run.php"}"#).unwrap_err();
        assert!(matches!(err, Error::UnreadableSource { .. }));
    }

    #[test]
    fn main_shebang_is_stripped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("run.php"), "#!/usr/bin/env php\n<?php echo 1;").unwrap();
        let config = resolve_in(dir.path(), r#"{"main": "run.php"}"#).unwrap();
        assert_eq!(config.main_script_contents.as_deref(), Some(&b"<?php echo 1;"[..]));
        assert_eq!(config.main_script_bundle_path.as_deref(), Some("run.php"));
    }

    #[test]
    fn openssl_requires_key() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.php"), "<?php").unwrap();
        let err = resolve_in(dir.path(), r#"{"algorithm": "OPENSSL"}"#).unwrap_err();
        assert!(matches!(err, Error::SigningKeyRequired));
    }

    #[test]
    fn key_pass_prompt_flag() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.php"), "<?php").unwrap();
        let config = resolve_in(
            dir.path(),
            r#"{"algorithm": "OPENSSL", "key": "private.key", "key-pass": true}"#,
        )
        .unwrap();
        assert!(config.signing.prompt_for_passphrase);
        assert!(config.signing.passphrase.is_none());
    }

    #[test]
    fn chmod_parsing() {
        assert_eq!(parse_chmod("0700").unwrap(), 0o700);
        assert_eq!(parse_chmod("755").unwrap(), 0o755);
        assert!(parse_chmod("77").is_err());
        assert!(parse_chmod("abc").is_err());
        assert!(parse_chmod("0999").is_err());
    }

    #[test]
    fn compression_warning_names_the_runtime_extension() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.php"), "<?php").unwrap();
        let config = resolve_in(dir.path(), r#"{"compression": "GZ"}"#).unwrap();
        assert_eq!(config.compression, Compression::Gz);
        assert!(config
            .warnings
            .iter()
            .any(|w| w.contains("the extension \"zlib\" will now be required")));
    }

    #[test]
    fn literal_replacements_are_tokenized() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.php"), "<?php").unwrap();
        let config = resolve_in(
            dir.path(),
            r#"{"replacements": {"version": "1.2.3", "build": 7}}"#,
        )
        .unwrap();
        assert!(config
            .replacements
            .contains(&("@version@".to_string(), "1.2.3".to_string())));
        assert!(config
            .replacements
            .contains(&("@build@".to_string(), "7".to_string())));
    }

    #[test]
    fn php_datetime_format_translation() {
        assert_eq!(php_to_chrono_format("Y-m-d H:i:s T"), "%Y-%m-%d %H:%M:%S %Z");
        assert_eq!(php_to_chrono_format("Y"), "%Y");
    }

    #[test]
    fn banner_lines_are_joined() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.php"), "<?php").unwrap();
        let config = resolve_in(dir.path(), r#"{"banner": ["one", "two"]}"#).unwrap();
        assert_eq!(config.banner.as_deref(), Some("one\ntwo"));

        let config = resolve_in(dir.path(), r#"{"banner": false}"#).unwrap();
        assert_eq!(config.banner, None);

        let config = resolve_in(dir.path(), r#"{"banner": ""}"#).unwrap();
        assert_eq!(config.banner.as_deref(), Some(""));
    }

    #[test]
    fn default_banner_applies_when_unset() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.php"), "<?php").unwrap();
        let config = resolve_in(dir.path(), r#"{}"#).unwrap();
        assert_eq!(config.banner.as_deref(), Some(DEFAULT_BANNER));
    }
}
