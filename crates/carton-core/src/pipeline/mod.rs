//! Build pipeline orchestration.
//!
//! Stages run in a fixed order in a single thread; skipping is decided by
//! configuration, never by reordering. Cancellation is observed between
//! stages only. On any fatal error after the archive is opened, the
//! temporary output file is removed before the error propagates.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use globset::{Glob, GlobSetBuilder};
use tracing::{debug, info};

use carton_phar::{
    stub as phar_stub, Compression, PharReader, PharWriter, Signer, StubSpec,
};

use crate::compact::{self, Compactor};
use crate::composer;
use crate::config::{BuildConfig, SigningAlgorithm, StubMode};
use crate::error::{Error, Result};
use crate::requirements;
use crate::scoper::{Prefixer, ScoperConfig, SubprocessPrefixer};
use crate::sources::{self, Sources};

/// Cooperative cancellation flag, set from the SIGINT handler and observed
/// between stages.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Final report rendered by the CLI.
#[derive(Debug)]
pub struct BuildReport {
    pub output_path: std::path::PathBuf,
    pub entry_count: usize,
    pub file_size: u64,
    pub peak_memory_bytes: u64,
    pub elapsed: Duration,
    pub warnings: Vec<String>,
    pub recommendations: Vec<String>,
}

/// One build, configured and ready to run.
pub struct Builder {
    config: BuildConfig,
    cancel: CancelToken,
    /// Verbosity forwarded to the dependency manager subprocess.
    pub dump_verbosity: u8,
    /// Passphrase collected by the CLI prompt, overriding the configured
    /// one.
    pub passphrase: Option<String>,
}

impl Builder {
    pub fn new(config: BuildConfig, cancel: CancelToken) -> Self {
        Self {
            config,
            cancel,
            dump_verbosity: 0,
            passphrase: None,
        }
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    /// Run stages 2–10 (ConfigResolve already produced `self.config`).
    pub fn build(self) -> Result<BuildReport> {
        let started = Instant::now();
        let mut memory = MemorySampler::new();
        let config = &self.config;
        let base = &config.base_path;

        let manifest = composer::Manifest::load(base)?;
        let lock = composer::Lock::load(base)?;

        info!("Enumerating source files");
        let mut sources = sources::enumerate(config, manifest.as_ref(), lock.as_ref())?;
        memory.sample();
        self.cancel.checkpoint()?;

        if config.dump_autoload {
            info!("Dumping the optimized autoloader");
            composer::dump_autoload(base, config.exclude_dev_files, self.dump_verbosity)?;
            // The dump may create files; re-discover so the fresh artifacts
            // fall under the enumerated set.
            sources = sources::enumerate(config, manifest.as_ref(), lock.as_ref())?;
        } else {
            info!("Skipping the autoloader dump");
        }
        if config.exclude_composer_files {
            strip_composer_files(&mut sources);
        }
        memory.sample();
        self.cancel.checkpoint()?;

        let mut prefixed: HashMap<String, Vec<u8>> = HashMap::new();
        if let Some(scoper_config) = ScoperConfig::load(base)? {
            info!(prefix = %scoper_config.prefix, "Prefixing sources");
            prefixed = prefix_sources(&sources, scoper_config)?;
        }
        memory.sample();
        self.cancel.checkpoint()?;

        let compactors = compact::registry(&config.compactors)?;
        if !compactors.is_empty() {
            info!(count = compactors.len(), "Registered compactors");
        }

        let collected_requirements = if config.check_requirements {
            info!("Collecting interpreter requirements");
            requirements::collect(manifest.as_ref(), lock.as_ref(), !config.exclude_dev_files)
        } else {
            Vec::new()
        };
        self.cancel.checkpoint()?;

        info!("Assembling the bundle");
        let mut writer = PharWriter::create(&config.tmp_output_path)?;
        assemble(
            &mut writer,
            config,
            &sources,
            prefixed,
            &compactors,
            &collected_requirements,
        )?;
        memory.sample();
        self.cancel.checkpoint()?;

        if config.compression != Compression::None {
            if config.dev_mode {
                info!("Dev mode detected: skipping the compression");
            } else {
                info!(algorithm = ?config.compression, "Compressing entries");
                writer.compress_all(config.compression);
            }
        }
        self.cancel.checkpoint()?;

        info!("Signing the bundle");
        let signer = self.signer()?;
        let summary = writer.close(&signer)?;
        memory.sample();
        if self.cancel.is_cancelled() {
            // The archive is closed but not yet renamed into place.
            let _ = std::fs::remove_file(&config.tmp_output_path);
            return Err(Error::Cancelled);
        }

        info!("Finalizing the bundle");
        finalize(config, &signer)?;
        memory.sample();

        let report = BuildReport {
            output_path: config.output_path.clone(),
            entry_count: summary.entry_count,
            file_size: std::fs::metadata(&config.output_path)
                .map(|m| m.len())
                .unwrap_or(summary.file_size),
            peak_memory_bytes: memory.peak(),
            elapsed: started.elapsed(),
            warnings: config.warnings.clone(),
            recommendations: config.recommendations.clone(),
        };
        Ok(report)
    }

    fn signer(&self) -> Result<Signer> {
        let signing = &self.config.signing;
        match signing.algorithm {
            SigningAlgorithm::Sha1 => Ok(Signer::Sha1),
            SigningAlgorithm::Sha256 => Ok(Signer::Sha256),
            SigningAlgorithm::Sha512 => Ok(Signer::Sha512),
            SigningAlgorithm::OpenSsl => {
                let key_path = signing.key_path.as_ref().ok_or(Error::SigningKeyRequired)?;
                let passphrase = self
                    .passphrase
                    .as_deref()
                    .or(signing.passphrase.as_deref());
                Ok(Signer::openssl_from_key_file(key_path, passphrase)?)
            }
        }
    }
}

/// Assemble stage: stub, main script, requirement payload, regular files
/// (replaced/compacted), then binary files raw.
fn assemble(
    writer: &mut PharWriter,
    config: &BuildConfig,
    sources: &Sources,
    mut prefixed: HashMap<String, Vec<u8>>,
    compactors: &[Box<dyn Compactor>],
    collected_requirements: &[requirements::Requirement],
) -> Result<()> {
    writer.set_alias(&config.alias);
    writer.set_metadata(config.metadata.as_ref());
    writer.set_stub(&stub_bytes(config)?)?;

    if let (Some(bundle_path), Some(contents)) = (
        config.main_script_bundle_path.as_deref(),
        config.main_script_contents.as_deref(),
    ) {
        let contents = apply_replacements(contents.to_vec(), &config.replacements);
        let contents = compactors
            .iter()
            .filter(|c| c.supports(bundle_path))
            .fold(contents, |acc, c| c.compact(&acc));
        writer.add_from_string(bundle_path, &contents)?;
    }

    if config.check_requirements {
        writer.add_from_string(
            requirements::REQUIREMENTS_PATH,
            requirements::render_requirements_php(collected_requirements).as_bytes(),
        )?;
        for (path, contents) in requirements::checker_payload() {
            writer.add_from_string(path, contents)?;
        }
    }

    for entry in &sources.files {
        let overridden = prefixed.remove(&entry.bundle_path);
        let needs_memory = overridden.is_some()
            || !config.replacements.is_empty()
            || compactors.iter().any(|c| c.supports(&entry.bundle_path));

        if needs_memory {
            let contents = match overridden {
                Some(contents) => contents,
                None => std::fs::read(&entry.local_path).map_err(|e| Error::UnreadableSource {
                    path: entry.local_path.clone(),
                    source: e,
                })?,
            };
            let contents = apply_replacements(contents, &config.replacements);
            let contents = compactors
                .iter()
                .filter(|c| c.supports(&entry.bundle_path))
                .fold(contents, |acc, c| c.compact(&acc));
            writer.add_from_string(&entry.bundle_path, &contents)?;
        } else {
            writer.add_from_file(&entry.bundle_path, &entry.local_path)?;
        }
    }

    for entry in &sources.binary_files {
        writer.add_from_file(&entry.bundle_path, &entry.local_path)?;
    }
    Ok(())
}

fn stub_bytes(config: &BuildConfig) -> Result<Vec<u8>> {
    match &config.stub {
        StubMode::Path(path) => {
            // Embedded verbatim; no shebang or banner injection.
            std::fs::read(path).map_err(|e| Error::UnreadableSource {
                path: path.clone(),
                source: e,
            })
        }
        StubMode::Generate => Ok(phar_stub::generate(&StubSpec {
            shebang: config.shebang.clone(),
            banner: config.banner.clone(),
            alias: config.alias.clone(),
            index: config.main_script_bundle_path.clone(),
            intercept_file_funcs: config.intercept_file_funcs,
            check_requirements: config.check_requirements,
        })
        .into_bytes()),
        StubMode::Default => Ok(phar_stub::default_stub().into_bytes()),
    }
}

fn apply_replacements(contents: Vec<u8>, replacements: &[(String, String)]) -> Vec<u8> {
    if replacements.is_empty() {
        return contents;
    }
    let mut contents = contents;
    for (token, value) in replacements {
        contents = replace_bytes(&contents, token.as_bytes(), value.as_bytes());
    }
    contents
}

fn replace_bytes(haystack: &[u8], needle: &[u8], replacement: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(haystack.len());
    let mut i = 0;
    while i < haystack.len() {
        if haystack[i..].starts_with(needle) {
            out.extend_from_slice(replacement);
            i += needle.len();
        } else {
            out.push(haystack[i]);
            i += 1;
        }
    }
    out
}

/// Run the prefixer over every matching regular file; transformed contents
/// replace the originals in memory.
fn prefix_sources(
    sources: &Sources,
    config: ScoperConfig,
) -> Result<HashMap<String, Vec<u8>>> {
    let mut builder = GlobSetBuilder::new();
    for pattern in &config.include {
        builder.add(
            Glob::new(pattern)
                .map_err(|e| Error::config(format!("invalid scoper pattern {:?}: {}", pattern, e)))?,
        );
    }
    let matcher = builder
        .build()
        .map_err(|e| Error::config(format!("cannot compile scoper patterns: {}", e)))?;

    let prefixer = SubprocessPrefixer::new(config);
    let mut out = HashMap::new();
    for entry in &sources.files {
        if !matcher.is_match(&entry.bundle_path) {
            continue;
        }
        let contents = std::fs::read(&entry.local_path).map_err(|e| Error::UnreadableSource {
            path: entry.local_path.clone(),
            source: e,
        })?;
        let transformed = prefixer.prefix(&contents, &entry.bundle_path)?;
        out.insert(entry.bundle_path.clone(), transformed);
    }
    debug!(files = out.len(), "prefixing finished");
    Ok(out)
}

fn strip_composer_files(sources: &mut Sources) {
    const STRIPPED: &[&str] = &[
        "composer.json",
        "composer.lock",
        "vendor/composer/installed.json",
    ];
    sources
        .files
        .retain(|e| !STRIPPED.contains(&e.bundle_path.as_str()));
    sources
        .binary_files
        .retain(|e| !STRIPPED.contains(&e.bundle_path.as_str()));
}

/// Finalize stage: atomic rename, chmod, public key sidecar, post-build
/// verification.
fn finalize(config: &BuildConfig, signer: &Signer) -> Result<()> {
    let result = finalize_inner(config, signer);
    if result.is_err() {
        let _ = std::fs::remove_file(&config.tmp_output_path);
    }
    result
}

fn finalize_inner(config: &BuildConfig, signer: &Signer) -> Result<()> {
    let output = &config.output_path;
    if output.exists() {
        std::fs::remove_file(output)
            .map_err(|e| Error::io(format!("cannot remove previous {}", output.display()), e))?;
    }
    std::fs::rename(&config.tmp_output_path, output).map_err(|e| {
        Error::io(
            format!(
                "cannot move {} to {}",
                config.tmp_output_path.display(),
                output.display()
            ),
            e,
        )
    })?;

    #[cfg(unix)]
    if let Some(mode) = config.chmod {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(output, std::fs::Permissions::from_mode(mode))
            .map_err(|e| Error::io(format!("cannot chmod {}", output.display()), e))?;
    }

    let pubkey_pem = match signer.public_key_pem() {
        Some(pem) => {
            let pem = pem?;
            let sidecar = sidecar_pubkey_path(output);
            std::fs::write(&sidecar, &pem)
                .map_err(|e| Error::io(format!("cannot write {}", sidecar.display()), e))?;
            Some(pem)
        }
        None => None,
    };

    verify_output(output, pubkey_pem.as_deref())?;
    Ok(())
}

fn sidecar_pubkey_path(output: &Path) -> std::path::PathBuf {
    let mut name = output
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".pubkey");
    output.with_file_name(name)
}

/// Re-open the finished bundle and check it end to end before reporting
/// success.
fn verify_output(output: &Path, pubkey_pem: Option<&str>) -> Result<()> {
    let reader = PharReader::open(output)?;
    reader.verify_signature(pubkey_pem)?;
    for name in reader.entry_names() {
        // read_entry checks declared size and CRC32.
        reader.read_entry(name)?;
    }
    debug!(entries = reader.entries().len(), "bundle verified");
    Ok(())
}

struct MemorySampler {
    system: sysinfo::System,
    pid: sysinfo::Pid,
    peak: u64,
}

impl MemorySampler {
    fn new() -> Self {
        let mut sampler = Self {
            system: sysinfo::System::new(),
            pid: sysinfo::Pid::from_u32(std::process::id()),
            peak: 0,
        };
        sampler.sample();
        sampler
    }

    /// Sampled at stage boundaries; the maximum stands in for peak resident
    /// memory in the report.
    fn sample(&mut self) {
        self.system.refresh_process(self.pid);
        if let Some(process) = self.system.process(self.pid) {
            self.peak = self.peak.max(process.memory());
        }
    }

    fn peak(&self) -> u64 {
        self.peak
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{discover, resolve::resolve};

    fn touch(path: &Path, contents: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    fn build_in(dir: &Path, json: Option<&str>) -> Result<BuildReport> {
        if let Some(json) = json {
            std::fs::write(dir.join("box.json"), json).unwrap();
        }
        let config = resolve(discover(dir).unwrap(), dir, false)?;
        Builder::new(config, CancelToken::new()).build()
    }

    #[test]
    fn minimal_build_produces_a_verifiable_bundle() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("index.php"), "<?php echo 'Yo';");

        let report = build_in(dir.path(), None).unwrap();
        assert_eq!(report.entry_count, 1);
        assert!(report.output_path.ends_with("index.phar"));
        assert!(report.output_path.is_file());

        let reader = PharReader::open(&report.output_path).unwrap();
        assert_eq!(reader.entry_names(), vec!["index.php"]);
        assert_eq!(reader.read_entry("index.php").unwrap(), b"<?php echo 'Yo';");
        assert_eq!(
            reader.signature_algorithm(),
            carton_phar::SignatureAlgorithm::Sha1
        );
        let stub = String::from_utf8(reader.stub().to_vec()).unwrap();
        assert!(stub.contains("box-auto-generated-alias-"));
        reader.verify_signature(None).unwrap();
    }

    #[test]
    fn empty_bundle_contains_only_the_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        touch(
            &dir.path().join("stub.php"),
            "<?php echo 'custom'; __HALT_COMPILER(); ?>\n",
        );

        let report = build_in(
            dir.path(),
            Some(r#"{"main": false, "output": "empty.phar", "stub": "stub.php"}"#),
        )
        .unwrap();
        assert_eq!(report.entry_count, 1);

        let reader = PharReader::open(&report.output_path).unwrap();
        assert_eq!(reader.entry_names(), vec![carton_phar::EMPTY_ENTRY_PATH]);
        assert_eq!(
            reader.read_entry(carton_phar::EMPTY_ENTRY_PATH).unwrap(),
            b""
        );
        assert_eq!(
            reader.stub(),
            b"<?php echo 'custom'; __HALT_COMPILER(); ?>\n"
        );
    }

    #[test]
    fn compression_marks_every_entry() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("index.php"), "<?php echo 'Yo';");
        touch(&dir.path().join("src/a.php"), "<?php // comment\n$a = 1;\n");

        let report = build_in(
            dir.path(),
            Some(r#"{"directories": ["src"], "compression": "GZ"}"#),
        )
        .unwrap();
        assert!(report
            .warnings
            .iter()
            .any(|w| w.contains("the extension \"zlib\" will now be required")));

        let reader = PharReader::open(&report.output_path).unwrap();
        for entry in reader.entries() {
            assert_eq!(entry.compression, Compression::Gz);
        }
        reader.verify_signature(None).unwrap();
    }

    #[test]
    fn dev_mode_skips_compression() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("index.php"), "<?php echo 'Yo';");
        std::fs::write(
            dir.path().join("box.json"),
            r#"{"compression": "GZ"}"#,
        )
        .unwrap();
        let config = resolve(discover(dir.path()).unwrap(), dir.path(), true).unwrap();
        let report = Builder::new(config, CancelToken::new()).build().unwrap();

        let reader = PharReader::open(&report.output_path).unwrap();
        for entry in reader.entries() {
            assert_eq!(entry.compression, Compression::None);
        }
    }

    #[test]
    fn compactors_and_replacements_apply_to_regular_files() {
        let dir = tempfile::tempdir().unwrap();
        touch(
            &dir.path().join("index.php"),
            "<?php // version @version@\necho '@version@';",
        );

        let report = build_in(
            dir.path(),
            Some(r#"{"compactors": ["php"], "replacements": {"version": "1.0.0"}}"#),
        )
        .unwrap();
        let reader = PharReader::open(&report.output_path).unwrap();
        let contents = reader.read_entry("index.php").unwrap();
        let text = String::from_utf8(contents).unwrap();
        assert_eq!(text, "<?php \necho '1.0.0';");
    }

    #[test]
    fn requirement_checker_payload_is_embedded() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("index.php"), "<?php echo 'Yo';");
        touch(&dir.path().join("composer.json"), r#"{"require": {"php": ">=8.1"}}"#);
        touch(
            &dir.path().join("composer.lock"),
            r#"{"packages": [], "packages-dev": []}"#,
        );

        let report = build_in(dir.path(), Some(r#"{"dump-autoload": false}"#)).unwrap();
        let reader = PharReader::open(&report.output_path).unwrap();
        let names = reader.entry_names();
        assert!(names.contains(&".box/.requirements.php"));
        assert!(names.contains(&".box/bin/check-requirements.php"));
        let manifest = String::from_utf8(
            reader.read_entry(".box/.requirements.php").unwrap(),
        )
        .unwrap();
        assert!(manifest.contains("'condition' => '>=8.1'"));

        let stub = String::from_utf8(reader.stub().to_vec()).unwrap();
        assert!(stub.contains("/.box/bin/check-requirements.php'"));

        // composer files stripped by default
        assert!(!names.contains(&"composer.json"));
        assert!(!names.contains(&"composer.lock"));
    }

    #[test]
    fn cancelled_build_leaves_no_output() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("index.php"), "<?php echo 'Yo';");

        let config = resolve(discover(dir.path()).unwrap(), dir.path(), false).unwrap();
        let output = config.output_path.clone();
        let tmp = config.tmp_output_path.clone();
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = Builder::new(config, cancel).build().unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(!output.exists());
        assert!(!tmp.exists());
    }

    #[test]
    fn metadata_and_alias_reach_the_manifest() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("index.php"), "<?php echo 'Yo';");

        let report = build_in(
            dir.path(),
            Some(r#"{"alias": "alias-test.phar", "metadata": {"rand": 42}}"#),
        )
        .unwrap();
        let reader = PharReader::open(&report.output_path).unwrap();
        assert_eq!(reader.alias(), "alias-test.phar");
        assert_eq!(
            reader.metadata_bytes().unwrap(),
            b"a:1:{s:4:\"rand\";i:42;}"
        );
        let stub = String::from_utf8(reader.stub().to_vec()).unwrap();
        assert_eq!(stub.matches("Phar::mapPhar('alias-test.phar');").count(), 1);
    }
}
