//! `--debug` dump: the resolved configuration and in-memory file list,
//! written in textual form under `.box_dump/` beside the output file.

use std::fmt::Write as _;
use std::path::Path;
use std::process::Command;

use tracing::info;

use carton_core::{composer, sources, BuildConfig, Error};

pub const DUMP_DIR: &str = ".box_dump";

pub fn write(config: &BuildConfig) -> Result<(), Error> {
    let dir = config
        .output_path
        .parent()
        .unwrap_or(Path::new("."))
        .join(DUMP_DIR);
    std::fs::create_dir_all(&dir)
        .map_err(|e| Error::io(format!("cannot create {}", dir.display()), e))?;

    let write_file = |name: &str, contents: String| -> Result<(), Error> {
        let path = dir.join(name);
        std::fs::write(&path, contents)
            .map_err(|e| Error::io(format!("cannot write {}", path.display()), e))
    };

    write_file("runner.txt", runner_info())?;
    write_file("config.txt", config_dump(config))?;
    write_file("files.txt", file_list(config)?)?;

    info!(dir = %dir.display(), "debug dump written");
    Ok(())
}

fn runner_info() -> String {
    let mut out = String::new();
    let _ = writeln!(out, "builder: carton {}", env!("CARGO_PKG_VERSION"));
    let _ = writeln!(out, "os: {} {}", std::env::consts::OS, std::env::consts::ARCH);
    let _ = writeln!(
        out,
        "command: {}",
        std::env::args().collect::<Vec<_>>().join(" ")
    );
    let _ = writeln!(out, "timestamp: {}", chrono::Utc::now().to_rfc3339());
    let _ = writeln!(out, "php: {}", host_php_line("-v"));
    let _ = writeln!(out, "php extensions: {}", host_php_line("-m"));
    out
}

/// First line (`-v`) or comma-joined list (`-m`) from the host interpreter,
/// best effort.
fn host_php_line(flag: &str) -> String {
    let output = match Command::new("php").arg(flag).output() {
        Ok(output) if output.status.success() => output,
        _ => return "<unavailable>".to_string(),
    };
    let text = String::from_utf8_lossy(&output.stdout);
    if flag == "-m" {
        text.lines()
            .filter(|l| !l.is_empty() && !l.starts_with('['))
            .collect::<Vec<_>>()
            .join(",")
    } else {
        text.lines().next().unwrap_or("<unavailable>").to_string()
    }
}

fn config_dump(config: &BuildConfig) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "base-path: {}", config.base_path.display());
    let _ = writeln!(out, "alias: {}", config.alias);
    let _ = writeln!(out, "output: {}", config.output_path.display());
    let _ = writeln!(
        out,
        "main: {}",
        config
            .main_script_bundle_path
            .as_deref()
            .unwrap_or("<none>")
    );
    let _ = writeln!(out, "stub: {:?}", config.stub);
    let _ = writeln!(out, "shebang: {:?}", config.shebang);
    let _ = writeln!(out, "compression: {:?}", config.compression);
    let _ = writeln!(out, "algorithm: {:?}", config.signing.algorithm);
    let _ = writeln!(out, "chmod: {:?}", config.chmod.map(|m| format!("{:o}", m)));
    let _ = writeln!(out, "compactors: {:?}", config.compactors);
    let _ = writeln!(out, "check-requirements: {}", config.check_requirements);
    let _ = writeln!(out, "dump-autoload: {}", config.dump_autoload);
    let _ = writeln!(out, "exclude-dev-files: {}", config.exclude_dev_files);
    let _ = writeln!(
        out,
        "exclude-composer-files: {}",
        config.exclude_composer_files
    );
    let _ = writeln!(out, "intercept: {}", config.intercept_file_funcs);
    let _ = writeln!(out, "dev-mode: {}", config.dev_mode);
    let _ = writeln!(
        out,
        "replacements: {:?}",
        config
            .replacements
            .iter()
            .map(|(k, v)| format!("{} => {}", k, v))
            .collect::<Vec<_>>()
    );
    let _ = writeln!(out, "metadata: {:?}", config.metadata);
    out
}

fn file_list(config: &BuildConfig) -> Result<String, Error> {
    let manifest = composer::Manifest::load(&config.base_path)?;
    let lock = composer::Lock::load(&config.base_path)?;
    let enumerated = sources::enumerate(config, manifest.as_ref(), lock.as_ref())?;

    let mut out = String::new();
    for entry in &enumerated.files {
        let _ = writeln!(
            out,
            "{} <- {}",
            entry.bundle_path,
            entry.local_path.display()
        );
    }
    for entry in &enumerated.binary_files {
        let _ = writeln!(
            out,
            "{} <- {} (binary)",
            entry.bundle_path,
            entry.local_path.display()
        );
    }
    Ok(out)
}
