//! The `compile` command: pre-flight checks, configuration resolution, the
//! build pipeline on a blocking thread, SIGINT wiring and the final report.

use std::path::PathBuf;

use anyhow::Context;
use tracing::{debug, info, warn};

use carton_core::config::{self, resolve::resolve, SigningAlgorithm};
use carton_core::{Builder, CancelToken, Error};

use crate::cli::args::CompileArgs;
use crate::debug_dump;
use crate::exit_codes;

/// Environment switch of the host interpreter forbidding archive creation.
const HOST_READONLY_ENV: &str = "PHAR_READONLY";

pub async fn run(args: CompileArgs) -> anyhow::Result<i32> {
    if host_is_readonly() {
        report_error(&Error::HostReadOnly, args.debug);
        return Ok(exit_codes::CONFIG_ERROR);
    }

    let working_dir = match &args.working_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("cannot determine working directory")?,
    };

    let build = match prepare(&args, &working_dir) {
        Ok(build) => build,
        Err(e) => {
            report_error(&e, args.debug);
            return Ok(exit_code_for(&e));
        }
    };

    let cancel = build.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received: stopping after the current stage");
            cancel.cancel();
        }
    });

    let started_output = build.builder.config().output_path.clone();
    let result = tokio::task::spawn_blocking(move || build.builder.build())
        .await
        .context("build thread panicked")?;

    match result {
        Ok(report) => {
            println!();
            println!(" // Bundle: {}", started_output.display());
            println!(" // Files: {}", report.entry_count);
            println!(" // Size: {}", human_size(report.file_size));
            println!(
                " // Memory: {} (peak), elapsed: {:.2?}",
                human_size(report.peak_memory_bytes),
                report.elapsed
            );
            for warning in &report.warnings {
                println!(" [warning] {}", warning);
            }
            for recommendation in &report.recommendations {
                println!(" [recommendation] {}", recommendation);
            }
            Ok(exit_codes::SUCCESS)
        }
        Err(e) => {
            report_error(&e, args.debug);
            Ok(exit_code_for(&e))
        }
    }
}

struct PreparedBuild {
    builder: Builder,
    cancel: CancelToken,
}

/// Stage 1 (ConfigResolve) plus everything that needs the terminal:
/// configuration loading, passphrase prompt, debug dump.
fn prepare(args: &CompileArgs, working_dir: &PathBuf) -> Result<PreparedBuild, Error> {
    let loaded = if args.no_config {
        config::LoadedConfig {
            raw: Default::default(),
            path: None,
        }
    } else if let Some(path) = &args.config {
        config::load_file(path)?
    } else {
        config::discover(working_dir)?
    };
    info!(
        config = %loaded
            .path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<none>".to_string()),
        "Loading the configuration"
    );

    let resolved = resolve(loaded, working_dir, args.dev)?;

    if args.no_parallel {
        debug!("--no-parallel: builds are always sequential");
    }
    if args.with_docker {
        info!("--with-docker: the Docker file emitter runs after the build, outside this process");
    }
    if args.debug {
        debug_dump::write(&resolved)?;
    }

    let passphrase = if resolved.signing.algorithm == SigningAlgorithm::OpenSsl
        && resolved.signing.prompt_for_passphrase
        && resolved.signing.passphrase.is_none()
    {
        let pass = dialoguer::Password::new()
            .with_prompt("Private key passphrase")
            .allow_empty_password(true)
            .interact()
            .map_err(|e| Error::ConfigInvalid {
                reason: format!("cannot prompt for the key passphrase: {}", e),
            })?;
        Some(pass)
    } else {
        None
    };

    let cancel = CancelToken::new();
    let mut builder = Builder::new(resolved, cancel.clone());
    builder.dump_verbosity = args.verbose;
    builder.passphrase = passphrase;
    Ok(PreparedBuild { builder, cancel })
}

fn host_is_readonly() -> bool {
    match std::env::var(HOST_READONLY_ENV) {
        Ok(value) => matches!(
            value.to_ascii_lowercase().as_str(),
            "1" | "on" | "true" | "yes"
        ),
        Err(_) => false,
    }
}

fn exit_code_for(error: &Error) -> i32 {
    if error.is_config_error() {
        exit_codes::CONFIG_ERROR
    } else {
        exit_codes::BUILD_FAILURE
    }
}

/// Single red line; the chain only under --debug.
fn report_error(error: &Error, debug: bool) {
    eprintln!("\x1b[31merror: {}\x1b[0m", error);
    if debug {
        let mut source = std::error::Error::source(error);
        while let Some(cause) = source {
            eprintln!("  caused by: {}", cause);
            source = cause.source();
        }
    }
}

fn human_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[unit])
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn human_sizes() {
        assert_eq!(human_size(512), "512 B");
        assert_eq!(human_size(2048), "2.00 KiB");
        assert_eq!(human_size(5 * 1024 * 1024), "5.00 MiB");
    }

    #[test]
    fn readonly_env_values() {
        std::env::remove_var(HOST_READONLY_ENV);
        assert!(!host_is_readonly());
        for value in ["1", "on", "ON", "true", "yes"] {
            std::env::set_var(HOST_READONLY_ENV, value);
            assert!(host_is_readonly(), "{} should be truthy", value);
        }
        std::env::set_var(HOST_READONLY_ENV, "0");
        assert!(!host_is_readonly());
        std::env::remove_var(HOST_READONLY_ENV);
    }
}
